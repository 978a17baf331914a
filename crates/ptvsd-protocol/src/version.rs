//! Debugger protocol identity.
//!
//! Both sides announce a debugger name and an integer protocol version.
//! Unlike a semantic version there is no compatibility range: a client is
//! accepted only when both values match exactly.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Name every compatible client and server announces.
pub const DEBUGGER_NAME: &str = "PTVSDBG";

/// Integer protocol version of the attach handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProtocolVersion(pub u32);

impl ProtocolVersion {
    /// Current protocol version.
    pub const CURRENT: ProtocolVersion = ProtocolVersion(8);

    /// Returns true if this is the version this build speaks.
    pub fn is_current(&self) -> bool {
        *self == Self::CURRENT
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The `(debuggerName, debuggerProtocolVersion)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebuggerIdentity {
    pub debugger_name: String,
    pub debugger_protocol_version: ProtocolVersion,
}

impl DebuggerIdentity {
    /// The identity this build announces.
    pub fn current() -> Self {
        Self {
            debugger_name: DEBUGGER_NAME.to_string(),
            debugger_protocol_version: ProtocolVersion::CURRENT,
        }
    }

    /// Returns true if `other` names the same debugger and protocol version.
    pub fn matches(&self, other: &DebuggerIdentity) -> bool {
        self == other
    }
}

impl Default for DebuggerIdentity {
    fn default() -> Self {
        Self::current()
    }
}

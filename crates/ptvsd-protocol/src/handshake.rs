//! Attach handshake vocabulary.
//!
//! The server greets every connection with a `legacyRemoteConnected`
//! event. The client must authenticate first and may then either ask for
//! process information or commit to attaching.

use serde::{Deserialize, Serialize};

use crate::version::DebuggerIdentity;

/// Event sent once per connection, before any request is read.
pub const CONNECTED_EVENT: &str = "legacyRemoteConnected";

/// Body of the greeting event.
pub type ConnectedBody = DebuggerIdentity;

/// Requests recognized during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Authenticate,
    Info,
    Attach,
}

impl Command {
    pub const ALL: [Command; 3] = [Command::Authenticate, Command::Info, Command::Attach];

    /// Wire name of the command.
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Authenticate => "legacyRemoteDebuggerAuthenticate",
            Command::Info => "legacyRemoteDebuggerInfo",
            Command::Attach => "legacyRemoteDebuggerAttach",
        }
    }

    /// Looks up a command by wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == name)
    }
}

/// Arguments of `legacyRemoteDebuggerAuthenticate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticateArgs {
    #[serde(flatten)]
    pub identity: DebuggerIdentity,
    #[serde(default)]
    pub client_secret: String,
}

/// Response body of `legacyRemoteDebuggerAuthenticate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticateBody {
    pub accepted: bool,
}

/// Response body of `legacyRemoteDebuggerInfo`.
///
/// Any string field may be empty when the host cannot determine it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfoBody {
    pub process_id: u32,
    #[serde(default)]
    pub executable: String,
    #[serde(default)]
    pub user: String,
    /// Free-form `"<impl> <M>.<m>.<u> (<os> <bits>)"`
    #[serde(default)]
    pub python_version: String,
}

/// Arguments of `legacyRemoteDebuggerAttach`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachArgs {
    #[serde(default)]
    pub debug_options: Vec<String>,
}

/// Response body of `legacyRemoteDebuggerAttach`.
///
/// A rejected attach carries only `accepted: false`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachBody {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub python_major: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub python_minor: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub python_micro: Option<u32>,
}

impl AttachBody {
    /// Body for an accepted attach.
    pub fn accepted(process_id: u32, (major, minor, micro): (u32, u32, u32)) -> Self {
        Self {
            accepted: true,
            process_id: Some(process_id),
            python_major: Some(major),
            python_minor: Some(minor),
            python_micro: Some(micro),
        }
    }

    /// Body for a rejected attach.
    pub fn rejected() -> Self {
        Self {
            accepted: false,
            process_id: None,
            python_major: None,
            python_minor: None,
            python_micro: None,
        }
    }
}

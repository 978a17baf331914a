//! Process identity reported to a probing client.

use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// What the host interpreter says about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeIdentity {
    /// Implementation name, e.g. `CPython`
    pub implementation: String,
    /// `(major, minor, micro)`
    pub version: (u32, u32, u32),
    /// Interpreter executable, if the runtime knows it
    #[serde(default)]
    pub executable: Option<PathBuf>,
}

impl RuntimeIdentity {
    pub fn new(implementation: impl Into<String>, version: (u32, u32, u32)) -> Self {
        Self {
            implementation: implementation.into(),
            version,
            executable: None,
        }
    }

    pub fn with_executable(mut self, executable: impl Into<PathBuf>) -> Self {
        self.executable = Some(executable.into());
        self
    }

    /// Formats as `"<impl> <M>.<m>.<u> (<os> <bits>-bit)"`.
    pub fn version_string(&self) -> String {
        let (major, minor, micro) = self.version;
        format!(
            "{} {major}.{minor}.{micro} ({} {}-bit)",
            self.implementation,
            env::consts::OS,
            usize::BITS
        )
    }
}

/// Identity of the running process as shown by `legacyRemoteDebuggerInfo`.
///
/// Fields the host cannot determine are left empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessIdentity {
    pub process_id: u32,
    pub executable: String,
    pub user: String,
    pub python_version: String,
}

impl ProcessIdentity {
    /// Collects the identity of the current process.
    pub fn collect(runtime: &RuntimeIdentity) -> Self {
        let executable = runtime
            .executable
            .clone()
            .or_else(|| env::current_exe().ok())
            .map(|p| p.display().to_string())
            .unwrap_or_default();

        Self {
            process_id: std::process::id(),
            executable,
            user: current_user(),
            python_version: runtime.version_string(),
        }
    }
}

fn current_user() -> String {
    ["USER", "USERNAME", "LOGNAME"]
        .iter()
        .find_map(|key| env::var(key).ok().filter(|v| !v.is_empty()))
        .unwrap_or_default()
}

//! Options accepted by `enable_attach`.

use std::path::{Path, PathBuf};

use crate::error::AttachError;
use crate::tls;

/// Default interface the attach server listens on.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Conventional attach port.
pub const DEFAULT_PORT: u16 = 5678;

/// Configuration for an attach server.
///
/// # Example
///
/// ```rust
/// use ptvsd_attach::AttachOptions;
///
/// let options = AttachOptions::default()
///     .with_secret("s3cret")
///     .with_address("0.0.0.0", 0);
/// assert_eq!(options.secret(), Some("s3cret"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachOptions {
    /// Shared secret a client must present. Empty or `None` accepts anyone.
    pub secret: Option<String>,

    /// Interface to bind.
    pub host: String,

    /// Port to bind; 0 lets the OS pick.
    pub port: u16,

    /// PEM certificate chain. May also hold the private key.
    pub certfile: Option<PathBuf>,

    /// PEM private key, when not bundled in `certfile`.
    pub keyfile: Option<PathBuf>,

    /// Whether the debug session should mirror program output to the IDE.
    pub redirect_output: bool,

    /// File that receives the bound port number, one decimal line.
    pub port_file: Option<PathBuf>,
}

impl Default for AttachOptions {
    fn default() -> Self {
        Self {
            secret: None,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            certfile: None,
            keyfile: None,
            redirect_output: true,
            port_file: None,
        }
    }
}

impl AttachOptions {
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn with_address(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    pub fn with_tls(mut self, certfile: impl Into<PathBuf>, keyfile: Option<PathBuf>) -> Self {
        self.certfile = Some(certfile.into());
        self.keyfile = keyfile;
        self
    }

    pub fn with_redirect_output(mut self, redirect_output: bool) -> Self {
        self.redirect_output = redirect_output;
        self
    }

    pub fn with_port_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.port_file = Some(path.into());
        self
    }

    /// The configured secret, with the empty string meaning none.
    pub fn secret(&self) -> Option<&str> {
        self.secret.as_deref().filter(|s| !s.is_empty())
    }

    pub fn wants_tls(&self) -> bool {
        self.certfile.is_some() || self.keyfile.is_some()
    }

    pub fn certfile(&self) -> Option<&Path> {
        self.certfile.as_deref()
    }

    pub fn keyfile(&self) -> Option<&Path> {
        self.keyfile.as_deref()
    }

    /// `host:port` as passed to bind.
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Checks option combinations before anything is bound.
    pub fn validate(&self) -> Result<(), AttachError> {
        if self.keyfile.is_some() && self.certfile.is_none() {
            return Err(AttachError::KeyWithoutCertificate);
        }
        if self.wants_tls() && !tls::AVAILABLE {
            return Err(AttachError::TlsUnavailable);
        }
        Ok(())
    }
}

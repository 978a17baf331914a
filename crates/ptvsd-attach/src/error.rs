//! Errors raised out of `enable_attach` and server startup.

use std::io;
use std::path::PathBuf;

use ptvsd_core::TraceError;
use thiserror::Error;

/// Errors that can occur while enabling attach.
///
/// Nothing in the running server changes when one of these is returned.
#[derive(Error, Debug)]
pub enum AttachError {
    /// `enable_attach` was already called successfully in this process
    #[error("Attach is already enabled for this process")]
    AttachAlreadyEnabled,

    /// A certificate or key was given but this build has no TLS support
    #[error("TLS was requested but this build has no TLS support")]
    TlsUnavailable,

    /// A key file was given without a certificate file
    #[error("A key file requires a certificate file")]
    KeyWithoutCertificate,

    /// The host runtime cannot install the tracing hooks attach needs
    #[error("Host runtime is missing {capability}, which attach requires")]
    RuntimeMissingCapability { capability: &'static str },

    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("Failed to write port file {path}: {source}")]
    PortFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Tracing retrofit failed: {0}")]
    Trace(#[from] TraceError),

    #[error("Failed to start the server thread: {0}")]
    Runtime(#[source] io::Error),
}

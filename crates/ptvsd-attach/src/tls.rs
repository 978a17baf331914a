//! Optional TLS on accepted connections.
//!
//! Built on rustls, which negotiates TLS 1.2 or 1.3; older protocol
//! versions are never offered. The private key may live in its own PEM
//! file or be bundled after the certificate chain in the certificate file.
//! Without the `tls` feature every attempt to turn TLS on fails with
//! [`AttachError::TlsUnavailable`](crate::AttachError::TlsUnavailable).

/// Whether this build can serve TLS.
pub const AVAILABLE: bool = cfg!(feature = "tls");

#[cfg(feature = "tls")]
pub use enabled::TlsWrapper;

#[cfg(not(feature = "tls"))]
pub use disabled::TlsWrapper;

#[cfg(feature = "tls")]
mod enabled {
    use std::fs::File;
    use std::io::{self, BufReader};
    use std::path::Path;
    use std::sync::Arc;

    use tokio::net::TcpStream;
    use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
    use tokio_rustls::rustls::{self, ServerConfig};
    use tokio_rustls::TlsAcceptor;
    use tracing::debug;

    use crate::channel::Transport;
    use crate::error::AttachError;

    /// Server-side TLS acceptor built from PEM files.
    #[derive(Clone)]
    pub struct TlsWrapper {
        acceptor: TlsAcceptor,
    }

    impl std::fmt::Debug for TlsWrapper {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("TlsWrapper").finish_non_exhaustive()
        }
    }

    impl TlsWrapper {
        /// Loads the certificate chain from `certfile` and the key from
        /// `keyfile`, or from `certfile` when no key file is given.
        pub fn load(certfile: &Path, keyfile: Option<&Path>) -> Result<Self, AttachError> {
            let certs = read_certs(certfile)?;
            let key = read_key(keyfile.unwrap_or(certfile))?;

            let provider = Arc::new(rustls::crypto::ring::default_provider());
            let config = ServerConfig::builder_with_provider(provider)
                .with_safe_default_protocol_versions()
                .map_err(|e| AttachError::Tls(e.to_string()))?
                .with_no_client_auth()
                .with_single_cert(certs, key)
                .map_err(|e| AttachError::Tls(e.to_string()))?;

            debug!(certfile = %certfile.display(), "TLS configuration loaded");
            Ok(Self {
                acceptor: TlsAcceptor::from(Arc::new(config)),
            })
        }

        /// Runs the server side of the TLS handshake on `stream`.
        pub async fn accept(&self, stream: TcpStream) -> io::Result<Box<dyn Transport>> {
            let stream = self.acceptor.accept(stream).await?;
            Ok(Box::new(stream))
        }
    }

    fn open(path: &Path) -> Result<BufReader<File>, AttachError> {
        File::open(path)
            .map(BufReader::new)
            .map_err(|e| AttachError::Tls(format!("Cannot read {}: {e}", path.display())))
    }

    fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, AttachError> {
        let certs = rustls_pemfile::certs(&mut open(path)?)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| {
                AttachError::Tls(format!("Invalid certificate in {}: {e}", path.display()))
            })?;

        if certs.is_empty() {
            return Err(AttachError::Tls(format!(
                "No certificate found in {}",
                path.display()
            )));
        }
        Ok(certs)
    }

    fn read_key(path: &Path) -> Result<PrivateKeyDer<'static>, AttachError> {
        rustls_pemfile::private_key(&mut open(path)?)
            .map_err(|e| {
                AttachError::Tls(format!("Invalid private key in {}: {e}", path.display()))
            })?
            .ok_or_else(|| AttachError::Tls(format!("No private key found in {}", path.display())))
    }
}

#[cfg(not(feature = "tls"))]
mod disabled {
    use std::io;
    use std::path::Path;

    use tokio::net::TcpStream;

    use crate::channel::Transport;
    use crate::error::AttachError;

    /// Placeholder acceptor for builds without TLS support.
    #[derive(Debug, Clone)]
    pub struct TlsWrapper {
        _private: (),
    }

    impl TlsWrapper {
        pub fn load(_certfile: &Path, _keyfile: Option<&Path>) -> Result<Self, AttachError> {
            Err(AttachError::TlsUnavailable)
        }

        pub async fn accept(&self, _stream: TcpStream) -> io::Result<Box<dyn Transport>> {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "TLS support is not compiled in",
            ))
        }
    }
}

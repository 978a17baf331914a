//! IDE side of the attach handshake.
//!
//! Used by the `ptvsd` binary to probe a process and by the integration
//! tests. Targets are named by URI:
//!
//! ```text
//! tcp://[secret@]host[:port]
//! ```

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::debug;

use ptvsd_protocol::{
    AttachArgs, AttachBody, AuthenticateArgs, AuthenticateBody, Command, ConnectedBody,
    DebuggerIdentity, InfoBody, Response, CONNECTED_EVENT,
};

use crate::channel::{Channel, ChannelError};
use crate::config::DEFAULT_PORT;

/// Errors that can occur on the client side.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("Unexpected greeting from server: {0}")]
    UnexpectedGreeting(String),

    #[error("{command} failed: {message}")]
    Rejected { command: String, message: String },

    #[error("Invalid {command} response body: {source}")]
    InvalidBody {
        command: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid attach target '{0}'")]
    InvalidTarget(String),
}

// ============================================================================
// Target
// ============================================================================

/// A process to attach to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachTarget {
    pub host: String,
    pub port: u16,
    pub secret: Option<String>,
}

impl AttachTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            secret: None,
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// `host:port` suitable for connect.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for AttachTarget {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ClientError::InvalidTarget(s.to_string());

        let rest = s.strip_prefix("tcp://").ok_or_else(invalid)?;
        let rest = rest.strip_suffix('/').unwrap_or(rest);

        let (secret, authority) = match rest.rsplit_once('@') {
            Some((secret, authority)) => (Some(secret.to_string()), authority),
            None => (None, rest),
        };

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, after) = bracketed.split_once(']').ok_or_else(invalid)?;
            let port = match after {
                "" => None,
                _ => Some(after.strip_prefix(':').ok_or_else(invalid)?),
            };
            (host, port)
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };

        if host.is_empty() || host.contains('/') {
            return Err(invalid());
        }
        let port = match port {
            Some(p) => p.parse::<u16>().map_err(|_| invalid())?,
            None => DEFAULT_PORT,
        };

        Ok(Self {
            host: host.to_string(),
            port,
            secret: secret.filter(|s| !s.is_empty()),
        })
    }
}

impl fmt::Display for AttachTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp://")?;
        if let Some(secret) = &self.secret {
            write!(f, "{secret}@")?;
        }
        write!(f, "{}", self.address())
    }
}

// ============================================================================
// Client
// ============================================================================

/// A connection to an attach server, past the greeting.
pub struct AttachClient {
    channel: Channel<TcpStream>,
    greeting: ConnectedBody,
}

impl AttachClient {
    /// Connects and reads the `legacyRemoteConnected` greeting.
    pub async fn connect(target: &AttachTarget) -> Result<Self, ClientError> {
        let address = target.address();
        let stream = TcpStream::connect(&address)
            .await
            .map_err(|source| ClientError::Connect {
                address: address.clone(),
                source,
            })?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }

        let mut channel = Channel::new(stream, address);
        let event = channel.wait_for_event(CONNECTED_EVENT).await?;
        let greeting: ConnectedBody = serde_json::from_value(event.body.clone())
            .map_err(|_| ClientError::UnexpectedGreeting(event.body.to_string()))?;

        debug!(
            debugger_name = %greeting.debugger_name,
            protocol_version = %greeting.debugger_protocol_version,
            "Connected"
        );
        Ok(Self { channel, greeting })
    }

    /// The identity the server announced.
    pub fn greeting(&self) -> &ConnectedBody {
        &self.greeting
    }

    /// Authenticates with this build's debugger identity.
    pub async fn authenticate(&mut self, secret: Option<&str>) -> Result<bool, ClientError> {
        self.authenticate_as(DebuggerIdentity::current(), secret).await
    }

    /// Authenticates with an explicit identity.
    pub async fn authenticate_as(
        &mut self,
        identity: DebuggerIdentity,
        secret: Option<&str>,
    ) -> Result<bool, ClientError> {
        let args = AuthenticateArgs {
            identity,
            client_secret: secret.unwrap_or_default().to_string(),
        };
        let body: AuthenticateBody = self.call(Command::Authenticate.as_str(), args).await?;
        Ok(body.accepted)
    }

    /// Requests the process identity. The server closes afterwards.
    pub async fn info(&mut self) -> Result<InfoBody, ClientError> {
        self.call(Command::Info.as_str(), json!({})).await
    }

    /// Requests an attach with the given debug options.
    pub async fn attach(&mut self, debug_options: Vec<String>) -> Result<AttachBody, ClientError> {
        self.call(Command::Attach.as_str(), AttachArgs { debug_options })
            .await
    }

    /// Sends any request and returns the raw response.
    pub async fn request(
        &mut self,
        command: &str,
        arguments: Value,
    ) -> Result<Response, ClientError> {
        let seq = self.channel.sender().send_request(command, arguments).await?;
        Ok(self.channel.wait_for_response(seq).await?)
    }

    /// The underlying channel, e.g. to keep talking after an attach.
    pub fn into_channel(self) -> Channel<TcpStream> {
        self.channel
    }

    async fn call<A, B>(&mut self, command: &str, arguments: A) -> Result<B, ClientError>
    where
        A: serde::Serialize,
        B: DeserializeOwned,
    {
        let arguments = serde_json::to_value(arguments).map_err(ChannelError::from)?;
        let response = self.request(command, arguments).await?;
        if !response.success {
            return Err(ClientError::Rejected {
                command: command.to_string(),
                message: response.message,
            });
        }
        serde_json::from_value(response.body).map_err(|source| ClientError::InvalidBody {
            command: command.to_string(),
            source,
        })
    }
}

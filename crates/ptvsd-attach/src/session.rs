//! Hand-off from the attach handshake to a debug session.
//!
//! The debug protocol proper is not spoken here. Once an attach is
//! accepted the socket, together with any bytes the handshake already
//! buffered, is given to the host's [`DebugSession`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;

use ptvsd_core::{AttachState, ThreadRegistry};

use crate::channel::Transport;

/// Everything a debug session needs to take over a connection.
pub struct Handoff {
    /// The accepted stream, TLS-wrapped if TLS is on.
    pub stream: Box<dyn Transport>,
    /// Bytes read past the attach request, to be consumed first.
    pub buffered: BytesMut,
    /// Peer address, for logging.
    pub peer: String,
    /// `debugOptions` from the attach request.
    pub debug_options: Vec<String>,
    /// Whether program output should be mirrored to the IDE.
    pub redirect_output: bool,
    /// Threads whose tracing was installed by the attach server.
    pub threads: Arc<ThreadRegistry>,
    /// Returns the process to the detached state.
    pub detach: DetachHook,
}

impl fmt::Debug for Handoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handoff")
            .field("buffered", &self.buffered.len())
            .field("peer", &self.peer)
            .field("debug_options", &self.debug_options)
            .field("redirect_output", &self.redirect_output)
            .finish_non_exhaustive()
    }
}

/// Lets a session give the process back.
///
/// After `detach`, a new client may attach.
#[derive(Debug, Clone)]
pub struct DetachHook {
    state: Arc<AttachState>,
    threads: Arc<ThreadRegistry>,
}

impl DetachHook {
    pub(crate) fn new(state: Arc<AttachState>, threads: Arc<ThreadRegistry>) -> Self {
        Self { state, threads }
    }

    /// Clears pending breaks and flips the process back to detached.
    ///
    /// Returns false if it was not attached.
    pub fn detach(&self) -> bool {
        let detached = self.state.detach();
        if detached {
            self.threads.clear_breaks();
        }
        detached
    }

    pub fn is_attached(&self) -> bool {
        self.state.is_attached()
    }
}

/// The debug session a host runs on an accepted connection.
///
/// `run` is called on the server's runtime, once per accepted attach. The
/// session owns the stream; dropping it closes the connection. Call
/// [`DetachHook::detach`] when the session ends so another client can
/// attach.
#[async_trait]
pub trait DebugSession: Send + Sync {
    async fn run(&self, handoff: Handoff);
}

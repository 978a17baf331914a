//! TCP attach server.
//!
//! The server:
//! - Binds the listen socket on the caller's thread, so bind failures are
//!   reported by `start`
//! - Retrofits tracing onto the caller's thread
//! - Runs the accept loop on a dedicated `ptvsd.server` thread with its own
//!   single-threaded tokio runtime
//! - Serves each connection on its own task
//! - Supports shutdown via CancellationToken
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  AttachServer   │
//! │                 │
//! │   TcpListener   │
//! └───────┬─────────┘
//!         │ accept()
//!         ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │   connection    │────▶│   AttachState   │
//! │ (per client)    │     │  (process-wide) │
//! └─────────────────┘     └─────────────────┘
//!         │
//!         │ attach accepted
//!         ▼
//! ┌─────────────────┐
//! │  DebugSession   │
//! └─────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Accept and connection errors are logged and the loop continues

mod connection;

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ptvsd_core::{AttachState, HostRuntime, ThreadId, ThreadRegistry};

use crate::config::AttachOptions;
use crate::error::AttachError;
use crate::retrofit;
use crate::session::{DebugSession, DetachHook};
use crate::tls::TlsWrapper;

/// Name of the accept loop thread.
pub const SERVER_THREAD_NAME: &str = "ptvsd.server";

/// Pause after a failed accept, e.g. when out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// What the embedding host provides.
#[derive(Clone)]
pub struct Host {
    /// Tracing hooks of the host runtime
    pub runtime: Arc<dyn HostRuntime>,
    /// Debug session started for each accepted attach
    pub session: Arc<dyn DebugSession>,
}

impl Host {
    pub fn new(runtime: Arc<dyn HostRuntime>, session: Arc<dyn DebugSession>) -> Self {
        Self { runtime, session }
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("runtime", &self.runtime.identity())
            .finish_non_exhaustive()
    }
}

/// State shared by the accept loop and every connection task.
pub(crate) struct ServerContext {
    pub(crate) options: AttachOptions,
    pub(crate) host: Host,
    pub(crate) tls: Option<TlsWrapper>,
    pub(crate) state: Arc<AttachState>,
    pub(crate) threads: Arc<ThreadRegistry>,
    pub(crate) connection_counter: AtomicU64,
}

impl ServerContext {
    pub(crate) fn detach_hook(&self) -> DetachHook {
        DetachHook::new(Arc::clone(&self.state), Arc::clone(&self.threads))
    }
}

/// A running attach server.
///
/// Dropping it stops the accept loop; a debug session already handed a
/// socket is dropped with the server thread's runtime.
pub struct AttachServer {
    local_addr: SocketAddr,
    context: Arc<ServerContext>,
    traced_thread: ThreadId,
    cancel_token: CancellationToken,
    ready: Mutex<Option<oneshot::Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl AttachServer {
    /// Binds, retrofits tracing onto the calling thread and starts
    /// accepting.
    ///
    /// Returns once the listener is bound. Clients that connect earlier
    /// wait in the listen backlog; no connection is accepted before this
    /// returns.
    pub fn start(options: AttachOptions, host: Host) -> Result<Self, AttachError> {
        let server = Self::start_paused(options, host)?;
        server.resume();
        Ok(server)
    }

    /// Like [`start`](Self::start), but the accept loop stays parked until
    /// [`resume`](Self::resume).
    ///
    /// The port file is written last, so a failed start never leaves one
    /// behind.
    pub(crate) fn start_paused(options: AttachOptions, host: Host) -> Result<Self, AttachError> {
        options.validate()?;
        retrofit::check_capabilities(host.runtime.as_ref())?;

        let tls = match options.certfile() {
            Some(certfile) => Some(TlsWrapper::load(certfile, options.keyfile())?),
            None => None,
        };

        let address = options.address();
        let listener = std::net::TcpListener::bind(&address)
            .and_then(|l| l.set_nonblocking(true).map(|()| l))
            .map_err(|source| AttachError::Bind {
                address: address.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| AttachError::Bind {
            address: address.clone(),
            source,
        })?;

        let threads = Arc::new(ThreadRegistry::new());
        let traced_thread = retrofit::retrofit(host.runtime.as_ref(), &threads)?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(AttachError::Runtime)?;

        let context = Arc::new(ServerContext {
            options,
            host,
            tls,
            state: Arc::new(AttachState::new()),
            threads,
            connection_counter: AtomicU64::new(0),
        });
        let cancel_token = CancellationToken::new();
        let (ready, gate) = oneshot::channel();

        let thread = {
            let context = Arc::clone(&context);
            let cancel_token = cancel_token.clone();
            thread::Builder::new()
                .name(SERVER_THREAD_NAME.to_string())
                .spawn(move || runtime.block_on(accept_loop(listener, gate, context, cancel_token)))
                .map_err(AttachError::Runtime)?
        };

        let server = Self {
            local_addr,
            context,
            traced_thread,
            cancel_token,
            ready: Mutex::new(Some(ready)),
            thread: Mutex::new(Some(thread)),
        };

        if let Some(path) = &server.context.options.port_file {
            if let Err(source) = std::fs::write(path, format!("{}\n", local_addr.port())) {
                server.shutdown();
                return Err(AttachError::PortFile {
                    path: path.clone(),
                    source,
                });
            }
            debug!(path = %path.display(), port = local_addr.port(), "Port file written");
        }

        info!(
            address = %local_addr,
            tls = server.context.tls.is_some(),
            secret = server.context.options.secret().is_some(),
            "Attach server listening"
        );
        Ok(server)
    }

    /// Lets the accept loop run. Later calls do nothing.
    pub(crate) fn resume(&self) {
        let ready = self
            .ready
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(ready) = ready {
            // The loop only goes away once cancelled.
            let _ = ready.send(());
        }
    }

    /// The address actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn options(&self) -> &AttachOptions {
        &self.context.options
    }

    pub fn is_attached(&self) -> bool {
        self.context.state.is_attached()
    }

    /// Blocks until a debugger attaches or `timeout` elapses.
    ///
    /// Returns whether the process is attached.
    pub fn wait_for_attach(&self, timeout: Option<Duration>) -> bool {
        self.context.state.wait(timeout)
    }

    /// Marks every traced thread to break at its next traceable event.
    ///
    /// Does nothing while detached. Returns the number of threads marked.
    pub fn break_into_debugger(&self) -> usize {
        if !self.is_attached() {
            return 0;
        }
        let marked = self.context.threads.request_break_all();
        info!(threads = marked, "Break requested");
        marked
    }

    /// Hook a debug session calls to give the process back.
    pub fn detach_hook(&self) -> DetachHook {
        self.context.detach_hook()
    }

    pub fn threads(&self) -> &Arc<ThreadRegistry> {
        &self.context.threads
    }

    /// The thread `start` was called on.
    pub fn traced_thread(&self) -> ThreadId {
        self.traced_thread
    }

    pub fn attached_since(&self) -> Option<DateTime<Utc>> {
        self.context.state.attached_since()
    }

    /// Stops the accept loop and waits for the server thread to exit.
    pub fn shutdown(&self) {
        self.cancel_token.cancel();

        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if thread::current().id() == handle.thread().id() {
                return;
            }
            if handle.join().is_err() {
                error!("Attach server thread panicked");
            }
        }
    }
}

impl fmt::Debug for AttachServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachServer")
            .field("local_addr", &self.local_addr)
            .field("attached", &self.is_attached())
            .finish_non_exhaustive()
    }
}

impl Drop for AttachServer {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// Waits for `gate`, then accepts connections until cancelled.
async fn accept_loop(
    listener: std::net::TcpListener,
    gate: oneshot::Receiver<()>,
    context: Arc<ServerContext>,
    cancel_token: CancellationToken,
) {
    tokio::select! {
        _ = cancel_token.cancelled() => return,
        opened = gate => {
            if opened.is_err() {
                debug!("Attach server dropped before accepting");
                return;
            }
        }
    }

    let listener = match TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, "Failed to register listener with the runtime");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                info!("Attach server shutdown requested");
                break;
            }

            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let context = Arc::clone(&context);
                        tokio::spawn(connection::serve(stream, peer, context));
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
        }
    }
}

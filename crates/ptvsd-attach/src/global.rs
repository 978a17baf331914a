//! Process-wide attach API.
//!
//! A process has at most one attach server. `enable_attach` starts it;
//! the other functions act on it and are harmless before it exists.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::warn;

use crate::config::AttachOptions;
use crate::error::AttachError;
use crate::server::{AttachServer, Host};

static SERVER: Mutex<Option<Arc<AttachServer>>> = Mutex::new(None);

fn lock() -> MutexGuard<'static, Option<Arc<AttachServer>>> {
    SERVER.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Enables attaching a debugger to this process.
///
/// Binds the listener, retrofits tracing onto the calling thread and
/// returns without waiting for a client. A second successful call in the
/// same process is impossible: it fails with
/// [`AttachError::AttachAlreadyEnabled`] and leaves the running server
/// untouched. A failed call may be retried.
pub fn enable_attach(options: AttachOptions, host: Host) -> Result<Arc<AttachServer>, AttachError> {
    // Held across start so concurrent callers cannot both succeed.
    let mut slot = lock();
    if slot.is_some() {
        warn!("enable_attach called twice");
        return Err(AttachError::AttachAlreadyEnabled);
    }

    let server = Arc::new(AttachServer::start_paused(options, host)?);
    *slot = Some(Arc::clone(&server));
    // Accepting only once the server is reachable through `attach_server`.
    server.resume();
    Ok(server)
}

/// The server started by [`enable_attach`], if any.
pub fn attach_server() -> Option<Arc<AttachServer>> {
    lock().clone()
}

/// Blocks until a debugger attaches or `timeout` elapses; `None` waits
/// forever.
///
/// Returns whether the process is attached. Before `enable_attach` this
/// returns false immediately.
pub fn wait_for_attach(timeout: Option<Duration>) -> bool {
    // Not holding the lock while blocked.
    match attach_server() {
        Some(server) => server.wait_for_attach(timeout),
        None => false,
    }
}

/// Requests a break on every traced thread if a debugger is attached.
pub fn break_into_debugger() {
    if let Some(server) = attach_server() {
        server.break_into_debugger();
    }
}

pub fn is_attached() -> bool {
    attach_server().is_some_and(|server| server.is_attached())
}

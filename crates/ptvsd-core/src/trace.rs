//! Seam to the host runtime's tracing hooks.
//!
//! Installing tracing on a live stack cannot be done from the outside; the
//! host runtime has to cooperate. [`HostRuntime`] is the small interface
//! the attach server needs from it:
//!
//! - snapshot the current thread's frames
//! - install a tracer on one frame
//! - install a tracer process-wide
//! - intercept thread creation
//!
//! The server answers with [`ThreadState`]s, one per traced thread, kept in
//! a [`ThreadRegistry`]. A [`Tracer`] only holds a weak reference to its
//! state: once the state is dropped the tracer asks the runtime to disable
//! itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::TraceResult;
use crate::identity::RuntimeIdentity;

// ============================================================================
// Identifiers
// ============================================================================

/// OS-level identifier of a host thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadId(pub u64);

/// Runtime handle of a live frame, valid until that frame returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(pub u64);

/// Location of a frame, as the debugger displays it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameInfo {
    pub function: String,
    pub filename: String,
    pub line: u32,
}

impl FrameInfo {
    pub fn new(function: impl Into<String>, filename: impl Into<String>, line: u32) -> Self {
        Self {
            function: function.into(),
            filename: filename.into(),
            line,
        }
    }
}

/// A frame from a stack snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: FrameId,
    pub info: FrameInfo,
}

// ============================================================================
// Runtime Interface
// ============================================================================

/// Hooks a host runtime supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub stack_introspection: bool,
    pub frame_tracing: bool,
    pub process_tracing: bool,
    pub thread_interception: bool,
}

impl Capabilities {
    /// Every hook available.
    pub const fn all() -> Self {
        Self {
            stack_introspection: true,
            frame_tracing: true,
            process_tracing: true,
            thread_interception: true,
        }
    }

    /// Names the first missing capability, if any.
    pub fn missing(&self) -> Option<&'static str> {
        if !self.stack_introspection {
            Some("stack introspection")
        } else if !self.frame_tracing {
            Some("per-frame tracing")
        } else if !self.process_tracing {
            Some("process-wide tracing")
        } else if !self.thread_interception {
            Some("thread creation interception")
        } else {
            None
        }
    }
}

/// The host runtime the attach server retrofits tracing onto.
///
/// Implementations are called from the thread that enables attach, except
/// for [`identity`](HostRuntime::identity), which is also called from the
/// server thread.
pub trait HostRuntime: Send + Sync {
    /// Interpreter implementation and version.
    fn identity(&self) -> RuntimeIdentity;

    /// Hooks this runtime supports. On runtimes where a hook needs a
    /// startup flag that was not given, report it as missing.
    fn capabilities(&self) -> Capabilities;

    /// The calling thread.
    fn current_thread(&self) -> ThreadId;

    /// The calling thread's live frames, innermost first.
    fn snapshot_frames(&self) -> TraceResult<Vec<Frame>>;

    /// Installs `tracer` as the per-frame trace hook of `frame`.
    fn set_frame_tracer(&self, frame: FrameId, tracer: Tracer) -> TraceResult<()>;

    /// Installs `tracer` as the process-wide trace hook, so newly entered
    /// frames are traced as well.
    fn set_process_tracer(&self, tracer: Tracer) -> TraceResult<()>;

    /// Arranges that every thread started from now on calls
    /// [`ThreadHook::on_thread_start`] first and installs the returned
    /// tracer, and calls [`ThreadHook::on_thread_exit`] when it ends.
    fn intercept_new_threads(&self, hook: ThreadHook) -> TraceResult<()>;
}

// ============================================================================
// Synthetic Thread State
// ============================================================================

/// Trace events delivered by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEvent {
    Call,
    Line,
    Return,
    Exception,
}

/// What the runtime should do after delivering an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceAction {
    /// Keep tracing
    Continue,
    /// Stop this thread at the current location for the debugger
    Break,
    /// Remove this tracer
    Disable,
}

/// Bookkeeping that lets a debug session treat a thread as traced from its
/// start, even when tracing was installed mid-execution.
#[derive(Debug)]
pub struct ThreadState {
    id: ThreadId,
    frames: Mutex<Vec<FrameInfo>>,
    break_requested: AtomicBool,
}

impl ThreadState {
    pub fn new(id: ThreadId) -> Self {
        Self {
            id,
            frames: Mutex::new(Vec::new()),
            break_requested: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Replays already-running frames, oldest first.
    pub fn push_frames(&self, frames: impl IntoIterator<Item = FrameInfo>) {
        self.lock_frames().extend(frames);
    }

    /// The current stack as seen by the debugger, oldest first.
    pub fn frames(&self) -> Vec<FrameInfo> {
        self.lock_frames().clone()
    }

    /// Asks the thread to stop at its next traceable event.
    pub fn request_break(&self) {
        self.break_requested.store(true, Ordering::Release);
    }

    pub fn break_requested(&self) -> bool {
        self.break_requested.load(Ordering::Acquire)
    }

    /// Drops a pending break request.
    pub fn clear_break(&self) {
        self.break_requested.store(false, Ordering::Release);
    }

    /// Handles one trace event on this thread.
    pub fn trace(&self, event: TraceEvent, frame: &FrameInfo) -> TraceAction {
        {
            let mut frames = self.lock_frames();
            match event {
                TraceEvent::Call => frames.push(frame.clone()),
                TraceEvent::Return => {
                    frames.pop();
                }
                TraceEvent::Line | TraceEvent::Exception => {
                    if let Some(top) = frames.last_mut() {
                        top.line = frame.line;
                    }
                }
            }
        }

        if self.break_requested.swap(false, Ordering::AcqRel) {
            TraceAction::Break
        } else {
            TraceAction::Continue
        }
    }

    fn lock_frames(&self) -> MutexGuard<'_, Vec<FrameInfo>> {
        self.frames.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Trace function handed to the runtime.
///
/// Holds only a weak reference to its thread state.
#[derive(Debug, Clone)]
pub struct Tracer {
    state: Weak<ThreadState>,
}

impl Tracer {
    pub fn new(state: &Arc<ThreadState>) -> Self {
        Self {
            state: Arc::downgrade(state),
        }
    }

    /// Thread this tracer belongs to, while its state is alive.
    pub fn thread_id(&self) -> Option<ThreadId> {
        self.state.upgrade().map(|s| s.id())
    }

    /// Delivers an event. Returns `Disable` once the state is gone.
    pub fn on_event(&self, event: TraceEvent, frame: &FrameInfo) -> TraceAction {
        match self.state.upgrade() {
            Some(state) => state.trace(event, frame),
            None => TraceAction::Disable,
        }
    }
}

// ============================================================================
// Thread Registry
// ============================================================================

/// All thread states visible to the debugger.
#[derive(Debug, Default)]
pub struct ThreadRegistry {
    threads: Mutex<HashMap<ThreadId, Arc<ThreadState>>>,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fresh state for `id`, replacing any previous one.
    pub fn register(&self, id: ThreadId) -> Arc<ThreadState> {
        let state = Arc::new(ThreadState::new(id));
        self.lock().insert(id, Arc::clone(&state));
        debug!(thread = id.0, "Thread registered");
        state
    }

    pub fn remove(&self, id: ThreadId) -> Option<Arc<ThreadState>> {
        let removed = self.lock().remove(&id);
        if removed.is_some() {
            debug!(thread = id.0, "Thread unregistered");
        }
        removed
    }

    pub fn get(&self, id: ThreadId) -> Option<Arc<ThreadState>> {
        self.lock().get(&id).cloned()
    }

    /// Registered thread ids, sorted.
    pub fn thread_ids(&self) -> Vec<ThreadId> {
        let mut ids: Vec<_> = self.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Marks every thread to break at its next traceable event.
    ///
    /// Returns the number of threads marked.
    pub fn request_break_all(&self) -> usize {
        let threads = self.lock();
        for state in threads.values() {
            state.request_break();
        }
        threads.len()
    }

    /// Drops every pending break request.
    pub fn clear_breaks(&self) {
        for state in self.lock().values() {
            state.clear_break();
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ThreadId, Arc<ThreadState>>> {
        self.threads.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Callback the runtime invokes around every newly created thread.
#[derive(Debug, Clone)]
pub struct ThreadHook {
    registry: Arc<ThreadRegistry>,
}

impl ThreadHook {
    pub fn new(registry: Arc<ThreadRegistry>) -> Self {
        Self { registry }
    }

    /// Called first thing on a new thread; returns the tracer to install.
    pub fn on_thread_start(&self, id: ThreadId) -> Tracer {
        let state = self.registry.register(id);
        Tracer::new(&state)
    }

    /// Called when a thread created after interception ends.
    pub fn on_thread_exit(&self, id: ThreadId) {
        self.registry.remove(id);
    }
}

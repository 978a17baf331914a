//! Installs tracing on a stack that is already running.
//!
//! Attach is enabled from inside a running program, long after its frames
//! were entered without a tracer. The retrofit makes the calling thread
//! look to the debugger as if it had been traced from the start:
//!
//! 1. snapshot the calling thread's frames
//! 2. register a thread state and replay the frames into it, oldest first
//! 3. install the thread's tracer on every live frame
//! 4. install the same tracer process-wide for frames entered later
//! 5. hook thread creation so new threads get their own state
//!
//! Threads that were already running elsewhere are not retrofitted and
//! stay invisible to the debugger.

use std::sync::Arc;

use tracing::{debug, info};

use ptvsd_core::{
    HostRuntime, ThreadHook, ThreadId, ThreadRegistry, ThreadState, TraceResult, Tracer,
};

use crate::error::AttachError;

/// Fails if `runtime` lacks any hook the retrofit needs.
pub fn check_capabilities(runtime: &dyn HostRuntime) -> Result<(), AttachError> {
    match runtime.capabilities().missing() {
        Some(capability) => Err(AttachError::RuntimeMissingCapability { capability }),
        None => Ok(()),
    }
}

/// Retrofits tracing onto the calling thread and returns its id.
///
/// Must be called on the thread that should become debuggable. On failure
/// the thread's registration is undone; hooks the runtime already
/// installed stay in place but their tracer disables itself.
pub fn retrofit(
    runtime: &dyn HostRuntime,
    threads: &Arc<ThreadRegistry>,
) -> Result<ThreadId, AttachError> {
    check_capabilities(runtime)?;

    let thread = runtime.current_thread();
    let state = threads.register(thread);

    if let Err(e) = install(runtime, threads, &state) {
        threads.remove(thread);
        return Err(e.into());
    }

    info!(
        thread = thread.0,
        frames = state.frames().len(),
        "Tracing retrofitted onto running thread"
    );
    Ok(thread)
}

fn install(
    runtime: &dyn HostRuntime,
    threads: &Arc<ThreadRegistry>,
    state: &Arc<ThreadState>,
) -> TraceResult<()> {
    let thread = state.id();
    let tracer = Tracer::new(state);
    let mut frames = runtime.snapshot_frames()?;
    frames.reverse();

    state.push_frames(frames.iter().map(|f| f.info.clone()));

    for frame in &frames {
        runtime.set_frame_tracer(frame.id, tracer.clone())?;
        debug!(
            thread = thread.0,
            function = %frame.info.function,
            line = frame.info.line,
            "Frame tracer installed"
        );
    }

    runtime.set_process_tracer(tracer.clone())?;
    runtime.intercept_new_threads(ThreadHook::new(Arc::clone(threads)))?;
    Ok(())
}

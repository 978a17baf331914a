//! Shared fixtures for the attach server integration tests.
//!
//! Tests CAN use `.unwrap()` and `.expect()`; the panic-free behavior of
//! production code is checked through assertions.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use ptvsd_attach::{AttachOptions, AttachServer, DebugSession, Handoff, Host};
use ptvsd_core::{
    Capabilities, Frame, FrameId, FrameInfo, HostRuntime, RuntimeIdentity, ThreadHook, ThreadId,
    TraceError, TraceResult, Tracer,
};

/// Upper bound for any single network step in a test.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Stub Runtime
// ============================================================================

/// Tracing runtime with a fixed two-frame stack that records every hook.
#[derive(Default)]
pub struct StubRuntime {
    pub capabilities: Option<Capabilities>,
    pub reject_process_tracer: bool,
    pub frame_tracers: Mutex<Vec<(FrameId, Tracer)>>,
    pub process_tracer: Mutex<Option<Tracer>>,
    pub thread_hook: Mutex<Option<ThreadHook>>,
}

impl StubRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_capabilities(capabilities: Capabilities) -> Arc<Self> {
        Arc::new(Self {
            capabilities: Some(capabilities),
            ..Default::default()
        })
    }

    /// A runtime that refuses the process-wide tracer.
    pub fn rejecting_process_tracer() -> Arc<Self> {
        Arc::new(Self {
            reject_process_tracer: true,
            ..Default::default()
        })
    }
}

impl HostRuntime for StubRuntime {
    fn identity(&self) -> RuntimeIdentity {
        RuntimeIdentity::new("CPython", (3, 11, 4)).with_executable("/usr/bin/python3")
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities.unwrap_or(Capabilities::all())
    }

    fn current_thread(&self) -> ThreadId {
        ThreadId(1)
    }

    fn snapshot_frames(&self) -> TraceResult<Vec<Frame>> {
        Ok(vec![
            Frame {
                id: FrameId(11),
                info: FrameInfo::new("serve_forever", "app.py", 42),
            },
            Frame {
                id: FrameId(10),
                info: FrameInfo::new("<module>", "app.py", 1),
            },
        ])
    }

    fn set_frame_tracer(&self, frame: FrameId, tracer: Tracer) -> TraceResult<()> {
        self.frame_tracers.lock().unwrap().push((frame, tracer));
        Ok(())
    }

    fn set_process_tracer(&self, tracer: Tracer) -> TraceResult<()> {
        if self.reject_process_tracer {
            return Err(TraceError::Rejected {
                operation: "settrace".to_string(),
                reason: "tracing disabled by host".to_string(),
            });
        }
        *self.process_tracer.lock().unwrap() = Some(tracer);
        Ok(())
    }

    fn intercept_new_threads(&self, hook: ThreadHook) -> TraceResult<()> {
        *self.thread_hook.lock().unwrap() = Some(hook);
        Ok(())
    }
}

// ============================================================================
// Recording Session
// ============================================================================

/// What a session was handed.
#[derive(Debug, Clone)]
pub struct HandoffRecord {
    pub peer: String,
    pub debug_options: Vec<String>,
    pub redirect_output: bool,
    pub buffered: Vec<u8>,
    pub threads: usize,
}

/// Debug session that reports each hand-off and then either holds the
/// connection open or detaches at once.
pub struct RecordingSession {
    detach_immediately: bool,
    handoffs: mpsc::UnboundedSender<HandoffRecord>,
    held: Mutex<Vec<Handoff>>,
}

impl RecordingSession {
    pub fn new(detach_immediately: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<HandoffRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            detach_immediately,
            handoffs: tx,
            held: Mutex::new(Vec::new()),
        });
        (session, rx)
    }
}

#[async_trait]
impl DebugSession for RecordingSession {
    async fn run(&self, handoff: Handoff) {
        let record = HandoffRecord {
            peer: handoff.peer.clone(),
            debug_options: handoff.debug_options.clone(),
            redirect_output: handoff.redirect_output,
            buffered: handoff.buffered.to_vec(),
            threads: handoff.threads.len(),
        };

        if self.detach_immediately {
            handoff.detach.detach();
        } else {
            self.held.lock().unwrap().push(handoff);
        }
        let _ = self.handoffs.send(record);
    }
}

// ============================================================================
// Server Helpers
// ============================================================================

/// Options for an ephemeral-port server on loopback.
pub fn loopback_options() -> AttachOptions {
    AttachOptions::default().with_address("127.0.0.1", 0)
}

/// Starts a server whose session holds every attached connection.
pub fn start_server(
    options: AttachOptions,
) -> (AttachServer, mpsc::UnboundedReceiver<HandoffRecord>) {
    let (session, handoffs) = RecordingSession::new(false);
    let host = Host::new(StubRuntime::new(), session);
    let server = AttachServer::start(options, host).expect("start attach server");
    (server, handoffs)
}

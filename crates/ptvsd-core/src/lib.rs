//! ptvsd Core - Shared types for the in-process attach server
//!
//! This crate provides the domain types shared between the attach server
//! and whatever hosts it:
//! - `state` - the process-wide detached/attached flag and its event
//! - `trace` - the seam to the host runtime's tracing hooks, plus the
//!   synthetic thread states the debugger sees
//! - `identity` - what the process reports about itself to a client
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod error;
pub mod identity;
pub mod state;
pub mod trace;

// Re-exports for convenience
pub use error::{TraceError, TraceResult};
pub use identity::{ProcessIdentity, RuntimeIdentity};
pub use state::AttachState;
pub use trace::{
    Capabilities, Frame, FrameId, FrameInfo, HostRuntime, ThreadHook, ThreadId, ThreadRegistry,
    ThreadState, TraceAction, TraceEvent, Tracer,
};

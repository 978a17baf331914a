//! ptvsd Attach - In-process debug attach server
//!
//! This crate makes a live process debuggable on demand from an
//! out-of-process IDE:
//! - `server` - TCP listener, per-connection lifetime, optional TLS
//! - `channel` - sequencing and dispatch on top of the wire codec
//! - `handshake` - connect, authenticate, then info or attach
//! - `retrofit` - tracing installed onto frames that were already running
//! - `global` - the process-wide `enable_attach` API
//! - `loader` - environment-driven startup that never fails the host
//! - `client` - the IDE side of the handshake, for probing and tests
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐  enable_attach   ┌───────────────────────────┐
//! │   host thread    │─────────────────▶│ AttachServer              │
//! │ (retrofit here)  │                  │  bind, spawn server thread│
//! └──────────────────┘                  └────────────┬──────────────┘
//!                                                    │ accept()
//!                                                    ▼
//!                                       ┌───────────────────────────┐
//!                                       │ Channel + Handshake       │
//!                                       │  (per connection task)    │
//!                                       └────────────┬──────────────┘
//!                                                    │ attach accepted
//!                                                    ▼
//!                                       ┌───────────────────────────┐
//!                                       │ DebugSession (host)       │
//!                                       │  owns the socket from now │
//!                                       └───────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Lock poisoning is recovered, never propagated

pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod global;
pub mod handshake;
pub mod loader;
pub mod retrofit;
pub mod server;
pub mod session;
pub mod tls;

pub use channel::{Channel, ChannelError, ChannelSender, Handled, RequestHandler, Transport};
pub use client::{AttachClient, AttachTarget, ClientError};
pub use config::{AttachOptions, DEFAULT_HOST, DEFAULT_PORT};
pub use error::AttachError;
pub use global::{attach_server, break_into_debugger, enable_attach, is_attached, wait_for_attach};
pub use handshake::{Handshake, HandshakeOutcome, HandshakeState};
pub use server::{AttachServer, Host};
pub use session::{DebugSession, DetachHook, Handoff};

//! ptvsd Protocol - Wire protocol for the attach channel
//!
//! This crate provides the framing codec and message types spoken between
//! an IDE client and the in-process attach server:
//! - `codec` - `Content-Length` framed UTF-8 JSON
//! - `message` - request/response/event envelopes
//! - `handshake` - the `legacyRemote*` commands and their bodies
//! - `version` - the debugger protocol identity both sides must agree on

pub mod codec;
pub mod handshake;
pub mod message;
pub mod version;

pub use codec::{encode, FramingError, MessageCodec, MAX_CONTENT_LENGTH};
pub use handshake::{
    AttachArgs, AttachBody, AuthenticateArgs, AuthenticateBody, Command, ConnectedBody, InfoBody,
    CONNECTED_EVENT,
};
pub use message::{Event, Message, Request, Response};
pub use version::{DebuggerIdentity, ProtocolVersion, DEBUGGER_NAME};

//! Lifetime of a single accepted connection.
//!
//! Each connection:
//! - Is wrapped in TLS when the server has a certificate
//! - Gets a strict `Channel` and a fresh `Handshake`
//! - Is closed after a terminal handshake, or handed to the debug session
//!   after an accepted attach
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Connection errors are logged and result in the socket being dropped

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::channel::{Channel, Transport};
use crate::handshake::{Handshake, HandshakeOutcome};
use crate::session::Handoff;

use super::ServerContext;

/// Serves one connection to completion.
pub(super) async fn serve(stream: TcpStream, peer: SocketAddr, context: Arc<ServerContext>) {
    let connection = context.connection_counter.fetch_add(1, Ordering::Relaxed);
    debug!(connection, peer = %peer, "Connection accepted");

    if let Err(e) = stream.set_nodelay(true) {
        debug!(connection, error = %e, "Failed to set TCP_NODELAY");
    }

    let stream: Box<dyn Transport> = match &context.tls {
        Some(tls) => match tls.accept(stream).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(connection, peer = %peer, error = %e, "TLS handshake failed");
                return;
            }
        },
        None => Box::new(stream),
    };

    let mut channel = Channel::new(stream, peer.to_string()).strict(true);
    let handshake = Handshake::new(
        context.options.secret().map(String::from),
        Arc::clone(&context.state),
        context.host.runtime.identity(),
    );

    match handshake.run(&mut channel).await {
        Ok(HandshakeOutcome::Terminal) => {
            if let Err(e) = channel.close().await {
                debug!(connection, error = %e, "Error while closing connection");
            }
            debug!(connection, peer = %peer, "Connection closed");
        }
        Ok(HandshakeOutcome::HandedOff { debug_options }) => {
            hand_off(channel, peer, debug_options, &context).await;
        }
        Err(e) => {
            warn!(connection, peer = %peer, error = %e, "Handshake failed");
        }
    }
}

async fn hand_off(
    channel: Channel<Box<dyn Transport>>,
    peer: SocketAddr,
    debug_options: Vec<String>,
    context: &ServerContext,
) {
    let detach = context.detach_hook();

    let (stream, buffered) = match channel.into_parts() {
        Ok(parts) => parts,
        Err(e) => {
            warn!(peer = %peer, error = %e, "Cannot hand off connection");
            detach.detach();
            return;
        }
    };

    info!(
        peer = %peer,
        options = ?debug_options,
        buffered = buffered.len(),
        "Handing connection to debug session"
    );

    let handoff = Handoff {
        stream,
        buffered,
        peer: peer.to_string(),
        debug_options,
        redirect_output: context.options.redirect_output,
        threads: Arc::clone(&context.threads),
        detach,
    };
    context.host.session.run(handoff).await;
}

//! Typed message passing on top of the wire codec.
//!
//! A `Channel` splits a bidirectional stream into a framed reader, owned by
//! the single task running [`Channel::process_messages`], and a
//! [`ChannelSender`] whose writer sits behind a mutex. Sequence numbers are
//! assigned while that mutex is held, so the order of `seq` values on the
//! wire is the order of the bytes.
//!
//! Requests are dispatched to a [`RequestHandler`] passed in by the caller
//! rather than owned by the channel, which keeps the handler free to hold
//! its own state without a reference cycle back to the channel.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Handler failures become `success: false` responses
//! - Framing and socket failures end the loop with an error

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::codec::{Encoder, FramedRead, FramedWrite};
use tracing::{debug, warn};

use ptvsd_protocol::{Event, FramingError, Message, MessageCodec, Request, Response};

/// Byte stream a channel can run over.
///
/// Channels over a boxed transport are borrowed across await points in
/// spawned tasks, hence `Sync`.
pub trait Transport: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static {}

type SharedWriter<S> = Arc<Mutex<FramedWrite<WriteHalf<S>, MessageCodec>>>;

// ============================================================================
// Handler Interface
// ============================================================================

/// What a handler did with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// Responded; keep reading
    Continue,
    /// Responded; stop reading after this request
    Exit,
    /// Not a command this handler knows
    Unknown,
}

/// Dispatch table for incoming requests.
///
/// A handler responds through the sender it is given. Returning an error
/// makes the channel answer with `success: false` and the error chain as
/// the message.
#[async_trait]
pub trait RequestHandler<S: Transport>: Send {
    async fn handle(&mut self, sender: &ChannelSender<S>, request: &Request)
        -> anyhow::Result<Handled>;
}

// ============================================================================
// Sender
// ============================================================================

/// Cloneable write side of a channel.
pub struct ChannelSender<S> {
    writer: SharedWriter<S>,
    seq: Arc<AtomicI64>,
}

impl<S> Clone for ChannelSender<S> {
    fn clone(&self) -> Self {
        Self {
            writer: Arc::clone(&self.writer),
            seq: Arc::clone(&self.seq),
        }
    }
}

impl<S: Transport> ChannelSender<S> {
    /// Sends an event.
    pub async fn send_event<B: Serialize>(
        &self,
        event: &str,
        body: B,
    ) -> Result<i64, ChannelError> {
        let body = serde_json::to_value(body)?;
        self.send_with(|seq| {
            Message::Event(Event {
                seq,
                event: event.to_string(),
                body,
            })
        })
        .await
    }

    /// Sends the response to `request`, echoing its `seq` and command.
    pub async fn send_response<B: Serialize>(
        &self,
        request: &Request,
        success: bool,
        message: Option<&str>,
        body: B,
    ) -> Result<i64, ChannelError> {
        let body = serde_json::to_value(body)?;
        self.send_with(|seq| {
            Message::Response(Response {
                seq,
                request_seq: request.seq,
                command: request.command.clone(),
                success,
                message: message.unwrap_or_default().to_string(),
                body,
            })
        })
        .await
    }

    /// Sends a request and returns its sequence number.
    pub async fn send_request<A: Serialize>(
        &self,
        command: &str,
        arguments: A,
    ) -> Result<i64, ChannelError> {
        let arguments = serde_json::to_value(arguments)?;
        self.send_with(|seq| Message::Request(Request::new(seq, command, arguments)))
            .await
    }

    /// Flushes and shuts down the write side.
    pub async fn close(&self) -> Result<(), ChannelError> {
        let mut writer = self.writer.lock().await;
        SinkExt::<Message>::close(&mut *writer).await?;
        Ok(())
    }

    async fn send_with(&self, build: impl FnOnce(i64) -> Message) -> Result<i64, ChannelError> {
        let mut writer = self.writer.lock().await;
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let message = build(seq);

        debug!(seq, kind = message.kind(), "Sending message");
        writer.send(message).await?;
        Ok(seq)
    }
}

// ============================================================================
// Channel
// ============================================================================

/// A framed, sequenced message channel over one stream.
pub struct Channel<S> {
    reader: FramedRead<ReadHalf<S>, MessageCodec>,
    sender: ChannelSender<S>,
    /// Messages read ahead of the one currently being waited for
    pending: VecDeque<Message>,
    exited: bool,
    strict: bool,
    peer: String,
}

impl<S: Transport> Channel<S> {
    /// Creates a channel over `stream`. `peer` is used for logging only.
    pub fn new(stream: S, peer: impl Into<String>) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: FramedRead::new(read_half, MessageCodec::new()),
            sender: ChannelSender {
                writer: Arc::new(Mutex::new(FramedWrite::new(write_half, MessageCodec::new()))),
                seq: Arc::new(AtomicI64::new(0)),
            },
            pending: VecDeque::new(),
            exited: false,
            strict: false,
            peer: peer.into(),
        }
    }

    /// In strict mode an unknown command also ends the loop.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn sender(&self) -> &ChannelSender<S> {
        &self.sender
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Marks the channel exited; `process_messages` returns after the
    /// current message.
    pub fn set_exit(&mut self) {
        self.exited = true;
    }

    pub fn is_exited(&self) -> bool {
        self.exited
    }

    pub async fn send_event<B: Serialize>(
        &self,
        event: &str,
        body: B,
    ) -> Result<i64, ChannelError> {
        self.sender.send_event(event, body).await
    }

    pub async fn send_response<B: Serialize>(
        &self,
        request: &Request,
        success: bool,
        message: Option<&str>,
        body: B,
    ) -> Result<i64, ChannelError> {
        self.sender.send_response(request, success, message, body).await
    }

    /// Runs until the channel is exited or the peer disconnects.
    ///
    /// Framing errors are logged and returned; the caller should close
    /// the connection.
    pub async fn process_messages<H>(&mut self, handler: &mut H) -> Result<(), ChannelError>
    where
        H: RequestHandler<S>,
    {
        while !self.exited {
            if let Err(e) = self.process_one_message(handler).await {
                warn!(peer = %self.peer, error = %e, "Channel closed on error");
                self.exited = true;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Reads and dispatches a single message.
    ///
    /// End of stream marks the channel exited.
    pub async fn process_one_message<H>(&mut self, handler: &mut H) -> Result<(), ChannelError>
    where
        H: RequestHandler<S>,
    {
        match self.recv().await? {
            None => {
                debug!(peer = %self.peer, "Peer closed the connection");
                self.exited = true;
            }
            Some(Message::Request(request)) => self.dispatch(handler, request).await?,
            Some(Message::Response(response)) => {
                debug!(
                    peer = %self.peer,
                    request_seq = response.request_seq,
                    "Ignoring unsolicited response"
                );
            }
            Some(Message::Event(event)) => {
                debug!(peer = %self.peer, event = %event.event, "Ignoring event");
            }
        }
        Ok(())
    }

    /// Returns the next message, buffered ones first.
    ///
    /// JSON values that are not a well-formed message are logged and
    /// skipped. `None` means the peer closed the stream.
    pub async fn recv(&mut self) -> Result<Option<Message>, ChannelError> {
        if let Some(message) = self.pending.pop_front() {
            return Ok(Some(message));
        }

        loop {
            let value = match self.reader.next().await {
                None => return Ok(None),
                Some(result) => result?,
            };

            match serde_json::from_value::<Message>(value) {
                Ok(message) => return Ok(Some(message)),
                Err(e) => {
                    warn!(peer = %self.peer, error = %e, "Skipping malformed message");
                }
            }
        }
    }

    /// Reads until the response to `request_seq` arrives. Anything read on
    /// the way is kept for later `recv` calls.
    pub async fn wait_for_response(&mut self, request_seq: i64) -> Result<Response, ChannelError> {
        let mut deferred = Vec::new();

        let result = loop {
            match self.recv().await {
                Ok(Some(Message::Response(r))) if r.request_seq == request_seq => break Ok(r),
                Ok(Some(other)) => deferred.push(other),
                Ok(None) => break Err(ChannelError::Closed),
                Err(e) => break Err(e),
            }
        };

        for message in deferred.into_iter().rev() {
            self.pending.push_front(message);
        }
        result
    }

    /// Reads until an event named `event` arrives, keeping anything else.
    pub async fn wait_for_event(&mut self, event: &str) -> Result<Event, ChannelError> {
        let mut deferred = Vec::new();

        let result = loop {
            match self.recv().await {
                Ok(Some(Message::Event(e))) if e.event == event => break Ok(e),
                Ok(Some(other)) => deferred.push(other),
                Ok(None) => break Err(ChannelError::Closed),
                Err(e) => break Err(e),
            }
        };

        for message in deferred.into_iter().rev() {
            self.pending.push_front(message);
        }
        result
    }

    /// Flushes and shuts down the write side.
    pub async fn close(&mut self) -> Result<(), ChannelError> {
        self.sender.close().await
    }

    /// Gives up the channel and returns the stream together with any bytes
    /// already read but not yet consumed.
    ///
    /// Fails if a clone of the sender is still alive.
    pub fn into_parts(self) -> Result<(S, BytesMut), ChannelError> {
        let Channel {
            reader,
            sender,
            pending,
            ..
        } = self;

        let writer = Arc::try_unwrap(sender.writer)
            .map_err(|_| ChannelError::SenderInUse)?
            .into_inner();

        let parts = reader.into_parts();

        let mut buffered = BytesMut::new();
        let mut codec = MessageCodec::new();
        for message in pending {
            codec.encode(message, &mut buffered)?;
        }
        buffered.extend_from_slice(&parts.read_buf);

        let stream = parts.io.unsplit(writer.into_inner());
        Ok((stream, buffered))
    }

    async fn dispatch<H>(&mut self, handler: &mut H, request: Request) -> Result<(), ChannelError>
    where
        H: RequestHandler<S>,
    {
        debug!(
            peer = %self.peer,
            seq = request.seq,
            command = %request.command,
            "Dispatching request"
        );

        match handler.handle(&self.sender, &request).await {
            Ok(Handled::Continue) => {}
            Ok(Handled::Exit) => self.exited = true,
            Ok(Handled::Unknown) => {
                let message = format!("Unknown command: {}", request.command);
                self.sender
                    .send_response(&request, false, Some(&message), empty_body())
                    .await?;
                if self.strict {
                    self.exited = true;
                }
            }
            Err(err) => {
                // Transport failures inside a handler are fatal.
                let err = match err.downcast::<ChannelError>() {
                    Ok(channel_err) => return Err(channel_err),
                    Err(other) => other,
                };

                warn!(
                    peer = %self.peer,
                    command = %request.command,
                    error = %err,
                    "Request handler failed"
                );
                let message = format!("{err:?}");
                self.sender
                    .send_response(&request, false, Some(&message), empty_body())
                    .await?;
            }
        }
        Ok(())
    }
}

fn empty_body() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Errors that can occur on a channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("Failed to serialize message body: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Connection closed")]
    Closed,

    #[error("Channel sender is still in use")]
    SenderInUse,
}

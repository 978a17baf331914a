//! Per-connection attach handshake.
//!
//! ```text
//! Greeted ──▶ AwaitingAuth ──authenticate ok──▶ Authenticated ──attach ok──▶ HandedOff
//!                  │                                  │
//!                  └──anything else──▶ Terminal ◀─────┘ info / attach rejected
//! ```
//!
//! Every path that does not end in `HandedOff` closes the connection after
//! its final response.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use ptvsd_core::{AttachState, ProcessIdentity, RuntimeIdentity};
use ptvsd_protocol::{
    AttachArgs, AttachBody, AuthenticateBody, Command, DebuggerIdentity, InfoBody, Request,
    CONNECTED_EVENT,
};

use crate::channel::{Channel, ChannelError, ChannelSender, Handled, RequestHandler, Transport};

/// Response message for a request that arrives before authentication.
pub const AUTHENTICATE_FIRST: &str = "legacyRemoteDebuggerAuthenticate must be sent first.";

/// Where a connection is in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Greeting sent, nothing read yet
    Greeted,
    /// Waiting for `legacyRemoteDebuggerAuthenticate`
    AwaitingAuth,
    /// Identity and secret accepted
    Authenticated,
    /// Final response sent; close the connection
    Terminal,
    /// Attach accepted; the socket belongs to the debug session
    HandedOff,
}

/// How a handshake ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// Close the connection
    Terminal,
    /// Start a debug session with these options
    HandedOff { debug_options: Vec<String> },
}

/// Handshake driver for one connection.
pub struct Handshake {
    secret: Option<String>,
    attach: Arc<AttachState>,
    runtime: RuntimeIdentity,
    state: HandshakeState,
    debug_options: Vec<String>,
}

impl Handshake {
    pub fn new(secret: Option<String>, attach: Arc<AttachState>, runtime: RuntimeIdentity) -> Self {
        Self {
            secret: secret.filter(|s| !s.is_empty()),
            attach,
            runtime,
            state: HandshakeState::Greeted,
            debug_options: Vec::new(),
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Sends the `legacyRemoteConnected` greeting.
    pub async fn greet<S: Transport>(
        &mut self,
        sender: &ChannelSender<S>,
    ) -> Result<(), ChannelError> {
        sender
            .send_event(CONNECTED_EVENT, DebuggerIdentity::current())
            .await?;
        self.state = HandshakeState::AwaitingAuth;
        Ok(())
    }

    /// Greets, then processes requests until the handshake ends.
    ///
    /// A client that disconnects mid-handshake yields `Terminal`.
    pub async fn run<S: Transport>(
        mut self,
        channel: &mut Channel<S>,
    ) -> Result<HandshakeOutcome, ChannelError> {
        self.greet(channel.sender()).await?;
        channel.process_messages(&mut self).await?;

        Ok(match self.state {
            HandshakeState::HandedOff => HandshakeOutcome::HandedOff {
                debug_options: self.debug_options,
            },
            _ => HandshakeOutcome::Terminal,
        })
    }

    fn secret_matches(&self, client_secret: Option<&str>) -> bool {
        self.secret
            .as_deref()
            .map_or(true, |s| Some(s) == client_secret)
    }

    /// Any field that is missing or of the wrong type is a failed match,
    /// not a malformed request.
    async fn authenticate<S: Transport>(
        &mut self,
        sender: &ChannelSender<S>,
        request: &Request,
    ) -> anyhow::Result<Handled> {
        let args = request
            .arguments
            .as_object()
            .context("legacyRemoteDebuggerAuthenticate arguments must be an object")?;

        let name = args.get("debuggerName").and_then(Value::as_str);
        let version = args.get("debuggerProtocolVersion");
        let current = DebuggerIdentity::current();
        let identity_ok = name == Some(current.debugger_name.as_str())
            && version.and_then(Value::as_u64)
                == Some(u64::from(current.debugger_protocol_version.0));
        let client_secret = args.get("clientSecret").and_then(Value::as_str);
        let accepted = identity_ok && self.secret_matches(client_secret);

        sender
            .send_response(request, true, None, AuthenticateBody { accepted })
            .await?;

        if accepted {
            debug!("Client authenticated");
            self.state = HandshakeState::Authenticated;
            Ok(Handled::Continue)
        } else {
            warn!(
                debugger_name = name.unwrap_or_default(),
                protocol_version = ?version,
                identity_ok,
                "Authentication rejected"
            );
            self.state = HandshakeState::Terminal;
            Ok(Handled::Exit)
        }
    }

    async fn info<S: Transport>(
        &mut self,
        sender: &ChannelSender<S>,
        request: &Request,
    ) -> anyhow::Result<Handled> {
        let identity = ProcessIdentity::collect(&self.runtime);
        let body = InfoBody {
            process_id: identity.process_id,
            executable: identity.executable,
            user: identity.user,
            python_version: identity.python_version,
        };

        sender.send_response(request, true, None, body).await?;
        self.state = HandshakeState::Terminal;
        Ok(Handled::Exit)
    }

    async fn attach<S: Transport>(
        &mut self,
        sender: &ChannelSender<S>,
        request: &Request,
    ) -> anyhow::Result<Handled> {
        let args: AttachArgs = serde_json::from_value(request.arguments.clone())
            .context("Invalid legacyRemoteDebuggerAttach arguments")?;

        // Claimed now, announced to waiters only once the client has the
        // acceptance.
        if !self.attach.try_claim() {
            info!("Attach rejected: a debugger is already attached");
            sender
                .send_response(request, true, None, AttachBody::rejected())
                .await?;
            self.state = HandshakeState::Terminal;
            return Ok(Handled::Exit);
        }

        let body = AttachBody::accepted(std::process::id(), self.runtime.version);
        if let Err(e) = sender.send_response(request, true, None, body).await {
            self.attach.detach();
            return Err(e.into());
        }
        self.attach.confirm_attach();

        info!(options = ?args.debug_options, "Attach accepted");
        self.debug_options = args.debug_options;
        self.state = HandshakeState::HandedOff;
        Ok(Handled::Exit)
    }
}

#[async_trait]
impl<S: Transport> RequestHandler<S> for Handshake {
    async fn handle(
        &mut self,
        sender: &ChannelSender<S>,
        request: &Request,
    ) -> anyhow::Result<Handled> {
        let command = Command::from_name(&request.command);

        match (self.state, command) {
            (HandshakeState::AwaitingAuth, Some(Command::Authenticate)) => {
                self.authenticate(sender, request).await
            }
            (HandshakeState::AwaitingAuth, _) => {
                sender
                    .send_response(request, false, Some(AUTHENTICATE_FIRST), json!({}))
                    .await?;
                self.state = HandshakeState::Terminal;
                Ok(Handled::Exit)
            }
            (HandshakeState::Authenticated, Some(Command::Info)) => {
                self.info(sender, request).await
            }
            (HandshakeState::Authenticated, Some(Command::Attach)) => {
                self.attach(sender, request).await
            }
            _ => Ok(Handled::Unknown),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use ptvsd_protocol::{encode, Message, MessageCodec, Response};
    use std::pin::Pin;
    use std::task::{ready, Context as TaskContext, Poll};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
    use tokio_util::codec::Decoder;

    fn runtime() -> RuntimeIdentity {
        RuntimeIdentity::new("CPython", (3, 11, 4))
    }

    fn frame(seq: i64, command: &str, arguments: serde_json::Value) -> Vec<u8> {
        encode(&Message::Request(Request::new(seq, command, arguments))).unwrap()
    }

    fn authenticate(seq: i64, secret: &str) -> Vec<u8> {
        frame(
            seq,
            "legacyRemoteDebuggerAuthenticate",
            json!({
                "debuggerName": "PTVSDBG",
                "debuggerProtocolVersion": 8,
                "clientSecret": secret
            }),
        )
    }

    /// Runs a handshake over `input` and returns the outcome and every
    /// message the server wrote.
    async fn run(
        secret: Option<&str>,
        state: Arc<AttachState>,
        input: Vec<u8>,
    ) -> (HandshakeOutcome, Vec<Message>) {
        let (server, mut client) = duplex(64 * 1024);
        client.write_all(&input).await.unwrap();
        client.shutdown().await.unwrap();

        let mut channel = Channel::new(server, "test").strict(true);
        let handshake = Handshake::new(secret.map(String::from), state, runtime());
        let outcome = handshake.run(&mut channel).await.unwrap();
        drop(channel);

        let mut raw = Vec::new();
        client.read_to_end(&mut raw).await.unwrap();
        let mut buf = BytesMut::from(&raw[..]);
        let mut codec = MessageCodec::new();
        let mut messages = Vec::new();
        while let Some(value) = codec.decode(&mut buf).unwrap() {
            messages.push(serde_json::from_value(value).unwrap());
        }
        (outcome, messages)
    }

    fn response(message: &Message) -> &Response {
        match message {
            Message::Response(r) => r,
            other => panic!("Expected response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_greeting_comes_first() {
        let state = Arc::new(AttachState::new());
        let (outcome, messages) = run(None, state, Vec::new()).await;

        assert_eq!(outcome, HandshakeOutcome::Terminal);
        assert_eq!(messages.len(), 1);
        match &messages[0] {
            Message::Event(e) => {
                assert_eq!(e.event, CONNECTED_EVENT);
                assert_eq!(e.body["debuggerName"], "PTVSDBG");
                assert_eq!(e.body["debuggerProtocolVersion"], 8);
            }
            other => panic!("Expected greeting, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_info_before_authenticate_is_refused() {
        let state = Arc::new(AttachState::new());
        let mut input = frame(1, "legacyRemoteDebuggerInfo", json!({}));
        input.extend(authenticate(2, ""));

        let (outcome, messages) = run(None, state, input).await;
        assert_eq!(outcome, HandshakeOutcome::Terminal);
        assert_eq!(messages.len(), 2);
        let r = response(&messages[1]);
        assert!(!r.success);
        assert_eq!(r.message, AUTHENTICATE_FIRST);
    }

    #[tokio::test]
    async fn test_wrong_secret_is_rejected() {
        let state = Arc::new(AttachState::new());
        let mut input = authenticate(1, "nope");
        input.extend(frame(2, "legacyRemoteDebuggerInfo", json!({})));

        let (outcome, messages) = run(Some("s3cret"), state, input).await;
        assert_eq!(outcome, HandshakeOutcome::Terminal);
        assert_eq!(messages.len(), 2);
        let r = response(&messages[1]);
        assert!(r.success);
        assert_eq!(r.body, json!({"accepted": false}));
    }

    #[tokio::test]
    async fn test_wrong_protocol_version_is_rejected() {
        let state = Arc::new(AttachState::new());
        let input = frame(
            1,
            "legacyRemoteDebuggerAuthenticate",
            json!({"debuggerName": "PTVSDBG", "debuggerProtocolVersion": 7}),
        );

        let (_, messages) = run(None, state, input).await;
        assert_eq!(response(&messages[1]).body, json!({"accepted": false}));
    }

    #[tokio::test]
    async fn test_empty_secret_accepts_anything() {
        let state = Arc::new(AttachState::new());
        let mut input = authenticate(1, "whatever");
        input.extend(frame(2, "legacyRemoteDebuggerInfo", json!({})));

        let (outcome, messages) = run(Some(""), state, input).await;
        assert_eq!(outcome, HandshakeOutcome::Terminal);
        assert_eq!(messages.len(), 3);
        assert_eq!(response(&messages[1]).body, json!({"accepted": true}));

        let info = response(&messages[2]);
        assert_eq!(info.body["processId"], std::process::id());
        assert!(info.body["pythonVersion"]
            .as_str()
            .unwrap()
            .starts_with("CPython 3.11.4"));
    }

    #[tokio::test]
    async fn test_wrong_typed_identity_is_rejected_and_closes() {
        for version in [json!("8"), json!(-1), json!(4294967296u64), json!(8.5), json!(null)] {
            let state = Arc::new(AttachState::new());
            let mut input = frame(
                1,
                "legacyRemoteDebuggerAuthenticate",
                json!({"debuggerName": "PTVSDBG", "debuggerProtocolVersion": version}),
            );
            input.extend(frame(2, "legacyRemoteDebuggerInfo", json!({})));

            let (outcome, messages) = run(None, state, input).await;
            assert_eq!(outcome, HandshakeOutcome::Terminal, "version {version}");
            assert_eq!(messages.len(), 2, "version {version}");
            let r = response(&messages[1]);
            assert!(r.success);
            assert_eq!(r.body, json!({"accepted": false}), "version {version}");
        }
    }

    #[tokio::test]
    async fn test_missing_fields_are_a_failed_match() {
        let state = Arc::new(AttachState::new());
        let mut input = frame(1, "legacyRemoteDebuggerAuthenticate", json!({"bogus": true}));
        input.extend(authenticate(2, ""));

        let (outcome, messages) = run(None, state, input).await;
        assert_eq!(outcome, HandshakeOutcome::Terminal);
        assert_eq!(messages.len(), 2);
        assert_eq!(response(&messages[1]).body, json!({"accepted": false}));
    }

    #[tokio::test]
    async fn test_non_string_secret_does_not_match() {
        let state = Arc::new(AttachState::new());
        let input = frame(
            1,
            "legacyRemoteDebuggerAuthenticate",
            json!({"debuggerName": "PTVSDBG", "debuggerProtocolVersion": 8, "clientSecret": 42}),
        );

        let (_, messages) = run(Some("42"), state, input).await;
        assert_eq!(response(&messages[1]).body, json!({"accepted": false}));
    }

    #[tokio::test]
    async fn test_non_object_arguments_keep_connection() {
        let state = Arc::new(AttachState::new());
        let mut input = frame(1, "legacyRemoteDebuggerAuthenticate", json!(["PTVSDBG", 8]));
        input.extend(authenticate(2, ""));

        let (_, messages) = run(None, state, input).await;
        assert_eq!(messages.len(), 3);
        assert!(!response(&messages[1]).success);
        assert_eq!(response(&messages[2]).body, json!({"accepted": true}));
    }

    #[tokio::test]
    async fn test_attach_hands_off() {
        let state = Arc::new(AttachState::new());
        let mut input = authenticate(1, "");
        input.extend(frame(
            2,
            "legacyRemoteDebuggerAttach",
            json!({"debugOptions": ["RedirectOutput"]}),
        ));

        let (outcome, messages) = run(None, Arc::clone(&state), input).await;
        assert_eq!(
            outcome,
            HandshakeOutcome::HandedOff {
                debug_options: vec!["RedirectOutput".to_string()]
            }
        );
        assert!(state.is_attached());

        let body = &response(&messages[2]).body;
        assert_eq!(body["accepted"], true);
        assert_eq!(body["processId"], std::process::id());
        assert_eq!(body["pythonMajor"], 3);
        assert_eq!(body["pythonMinor"], 11);
        assert_eq!(body["pythonMicro"], 4);
    }

    /// Passes reads through; fails every write after the first `writes_left`.
    struct FailingWrites {
        inner: tokio::io::DuplexStream,
        writes_left: usize,
    }

    impl tokio::io::AsyncRead for FailingWrites {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut TaskContext<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl tokio::io::AsyncWrite for FailingWrites {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut TaskContext<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            if self.writes_left == 0 {
                return Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()));
            }
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, buf))?;
            self.writes_left -= 1;
            Poll::Ready(Ok(n))
        }

        fn poll_flush(
            mut self: Pin<&mut Self>,
            cx: &mut TaskContext<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(
            mut self: Pin<&mut Self>,
            cx: &mut TaskContext<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    #[tokio::test]
    async fn test_unsent_acceptance_never_wakes_waiters() {
        let state = Arc::new(AttachState::new());
        let waiter = {
            let state = Arc::clone(&state);
            std::thread::spawn(move || state.wait(Some(std::time::Duration::from_millis(500))))
        };

        let (server, mut client) = duplex(64 * 1024);
        let mut input = authenticate(1, "");
        input.extend(frame(2, "legacyRemoteDebuggerAttach", json!({})));
        client.write_all(&input).await.unwrap();

        // Greeting and authenticate response go out; the attach response fails.
        let stream = FailingWrites {
            inner: server,
            writes_left: 2,
        };
        let mut channel = Channel::new(stream, "test").strict(true);
        let handshake = Handshake::new(None, Arc::clone(&state), runtime());
        assert!(handshake.run(&mut channel).await.is_err());

        assert!(!state.is_attached());
        assert!(!waiter.join().unwrap());
        assert!(state.try_attach());
    }

    #[tokio::test]
    async fn test_attach_while_attached_is_rejected() {
        let state = Arc::new(AttachState::new());
        assert!(state.try_attach());

        let mut input = authenticate(1, "");
        input.extend(frame(2, "legacyRemoteDebuggerAttach", json!({})));

        let (outcome, messages) = run(None, Arc::clone(&state), input).await;
        assert_eq!(outcome, HandshakeOutcome::Terminal);
        assert_eq!(response(&messages[2]).body, json!({"accepted": false}));
        assert!(state.is_attached());
    }

    #[tokio::test]
    async fn test_unknown_command_after_auth_ends_connection() {
        let state = Arc::new(AttachState::new());
        let mut input = authenticate(1, "");
        input.extend(frame(2, "legacyRemoteDebuggerDetach", json!({})));
        input.extend(frame(3, "legacyRemoteDebuggerInfo", json!({})));

        let (outcome, messages) = run(None, state, input).await;
        assert_eq!(outcome, HandshakeOutcome::Terminal);
        assert_eq!(messages.len(), 3);
        let r = response(&messages[2]);
        assert!(!r.success);
        assert!(r.message.contains("legacyRemoteDebuggerDetach"));
    }
}

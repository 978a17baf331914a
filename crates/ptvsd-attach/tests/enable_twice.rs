//! The process-wide `enable_attach` API.
//!
//! Kept in its own test binary: the first successful call is permanent for
//! the process, so every step runs in sequence inside one test.

mod common;

use std::time::Duration;

use tokio::time::timeout;

use ptvsd_attach::{
    attach_server, break_into_debugger, enable_attach, is_attached, wait_for_attach, AttachClient,
    AttachError, AttachTarget, Host,
};

use common::{loopback_options, RecordingSession, StubRuntime, STEP_TIMEOUT};

fn host() -> Host {
    let (session, _handoffs) = RecordingSession::new(false);
    Host::new(StubRuntime::new(), session)
}

#[tokio::test]
async fn test_enable_attach_is_once_per_process() {
    // Before enable nothing blocks and nothing is attached.
    assert!(attach_server().is_none());
    assert!(!wait_for_attach(Some(Duration::ZERO)));
    assert!(!wait_for_attach(None));
    assert!(!is_attached());
    break_into_debugger();

    // A failed enable can be retried.
    let mut bad = loopback_options();
    bad.keyfile = Some("/tmp/key.pem".into());
    assert!(matches!(
        enable_attach(bad, host()),
        Err(AttachError::KeyWithoutCertificate)
    ));
    assert!(attach_server().is_none());

    let server = enable_attach(loopback_options(), host()).unwrap();
    assert!(!is_attached());
    break_into_debugger();
    assert!(!is_attached());
    assert!(!wait_for_attach(Some(Duration::ZERO)));

    let second = enable_attach(loopback_options(), host());
    assert!(matches!(second, Err(AttachError::AttachAlreadyEnabled)));

    // The first server is still alive and serving.
    let target = AttachTarget::new("127.0.0.1", server.port());
    let mut client = timeout(STEP_TIMEOUT, AttachClient::connect(&target))
        .await
        .unwrap()
        .unwrap();
    assert!(client.authenticate(None).await.unwrap());
    assert!(client.attach(vec!["RedirectOutput".to_string()]).await.unwrap().accepted);

    assert!(is_attached());
    assert!(wait_for_attach(Some(Duration::ZERO)));
    assert_eq!(attach_server().map(|s| s.port()), Some(server.port()));
}

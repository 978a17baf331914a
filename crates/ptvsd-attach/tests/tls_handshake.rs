//! The attach handshake over TLS.
//!
//! Fixtures under `tests/fixtures`: a test CA (`ca.pem`), a `localhost`
//! certificate signed by it (`server.pem`), its key (`server.key`) and the
//! two concatenated (`bundled.pem`).

#![cfg(feature = "tls")]

mod common;

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use ptvsd_attach::{AttachServer, Channel};
use ptvsd_protocol::{DebuggerIdentity, CONNECTED_EVENT};

use common::{loopback_options, start_server, STEP_TIMEOUT};

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

fn connector() -> TlsConnector {
    let mut roots = RootCertStore::empty();
    let mut reader = BufReader::new(File::open(fixture("ca.pem")).unwrap());
    for cert in rustls_pemfile::certs(&mut reader) {
        roots.add(cert.unwrap()).unwrap();
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

async fn connect(server: &AttachServer) -> Channel<TlsStream<TcpStream>> {
    let tcp = TcpStream::connect(server.local_addr()).await.unwrap();
    let name = ServerName::try_from("localhost").unwrap();
    let tls = timeout(STEP_TIMEOUT, connector().connect(name, tcp))
        .await
        .expect("TLS handshake timed out")
        .expect("TLS handshake");
    Channel::new(tls, "tls-client")
}

/// Greeting, authenticate, info; returns the info body.
async fn probe(server: &AttachServer) -> serde_json::Value {
    let mut channel = connect(server).await;

    let greeting = timeout(STEP_TIMEOUT, channel.wait_for_event(CONNECTED_EVENT))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(greeting.body, serde_json::to_value(DebuggerIdentity::current()).unwrap());

    let seq = channel
        .sender()
        .send_request(
            "legacyRemoteDebuggerAuthenticate",
            json!({"debuggerName": "PTVSDBG", "debuggerProtocolVersion": 8, "clientSecret": "s"}),
        )
        .await
        .unwrap();
    let response = timeout(STEP_TIMEOUT, channel.wait_for_response(seq))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.body, json!({"accepted": true}));

    let seq = channel
        .sender()
        .send_request("legacyRemoteDebuggerInfo", json!({}))
        .await
        .unwrap();
    let response = timeout(STEP_TIMEOUT, channel.wait_for_response(seq))
        .await
        .unwrap()
        .unwrap();
    assert!(response.success);
    response.body
}

#[tokio::test]
async fn test_handshake_with_separate_key_file() {
    let options = loopback_options()
        .with_secret("s")
        .with_tls(fixture("server.pem"), Some(fixture("server.key")));
    let (server, _handoffs) = start_server(options);

    let info = probe(&server).await;
    assert_eq!(info["processId"], std::process::id());
}

#[tokio::test]
async fn test_handshake_with_key_bundled_in_certfile() {
    let options = loopback_options()
        .with_secret("s")
        .with_tls(fixture("bundled.pem"), None);
    let (server, _handoffs) = start_server(options);

    let info = probe(&server).await;
    assert!(info["pythonVersion"].as_str().unwrap().starts_with("CPython 3.11.4"));
}

#[tokio::test]
async fn test_plaintext_client_gets_no_greeting() {
    let options = loopback_options().with_tls(fixture("bundled.pem"), None);
    let (server, _handoffs) = start_server(options);

    // A plain client never sees a readable greeting; the server drops it.
    let tcp = TcpStream::connect(server.local_addr()).await.unwrap();
    let mut channel = Channel::new(tcp, "plain-client");
    channel
        .sender()
        .send_request("legacyRemoteDebuggerInfo", json!({}))
        .await
        .unwrap();
    let result = timeout(STEP_TIMEOUT, channel.wait_for_event(CONNECTED_EVENT))
        .await
        .unwrap();
    assert!(result.is_err(), "got {result:?}");
}

//! TLS transport: the relay serves a PEM identity and the client
//! reaches it by trusting that CA explicitly — verification is never
//! turned off, so a client without the CA must refuse the relay.

mod common;

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use chai_sdk::store::{ClientStore, MemoryStore};
use chai_sdk::{Client, ClientConfig, Event, load_or_create_identity};
use chai_server::config::ServerConfig;
use chai_server::db::Db;
use chai_server::server::{Server, SharedState, load_tls_acceptor};
use common::{next_event, wait_for_event, wait_until};

/// Start a TLS relay with a fresh self-signed identity for
/// `localhost`. Returns the shared state, the bound port, and the path
/// of the certificate the client must trust.
async fn start_tls_relay(dir: &std::path::Path) -> (Arc<SharedState>, u16, PathBuf) {
    let identity = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_path = dir.join("relay-cert.pem");
    let key_path = dir.join("relay-key.pem");
    std::fs::write(&cert_path, identity.cert.pem()).unwrap();
    std::fs::write(&key_path, identity.key_pair.serialize_pem()).unwrap();

    let mut config = ServerConfig::default();
    config.tls_cert = Some(cert_path.to_string_lossy().into_owned());
    config.tls_key = Some(key_path.to_string_lossy().into_owned());
    let acceptor = load_tls_acceptor(&config).unwrap();

    let state = Arc::new(SharedState::new(config, Db::open_memory().unwrap()));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(Server::serve_tls(state.clone(), listener, acceptor));
    (state, port, cert_path)
}

fn tls_client_config(port: u16, token: &str, ca: Option<PathBuf>) -> ClientConfig {
    ClientConfig {
        server_addr: format!("localhost:{port}"),
        token: token.to_string(),
        tls: true,
        tls_ca: ca,
        ..ClientConfig::default()
    }
}

#[tokio::test]
async fn client_attaches_over_tls_with_trusted_ca() {
    let dir = tempfile::tempdir().unwrap();
    let (state, port, cert_path) = start_tls_relay(dir.path()).await;
    state.register_token("tok-bob", "bob");

    let store: Arc<dyn ClientStore> = Arc::new(MemoryStore::new());
    let manager = Arc::new(Mutex::new(load_or_create_identity(store.as_ref(), None).unwrap()));
    let (handle, mut events) = Client::new(
        tls_client_config(port, "tok-bob", Some(cert_path)),
        manager,
        store,
    )
    .spawn();

    wait_for_event(&mut events, |e| matches!(e, Event::Attached { .. })).await;

    // Frames flow both ways over the secured transport.
    handle.upload_prekeys(2).await.unwrap();
    wait_until(|| state.db.lock().remaining_one_time_prekeys("bob").unwrap() == 2).await;
    handle.quit().await.unwrap();
}

#[tokio::test]
async fn client_without_the_ca_refuses_the_relay() {
    let dir = tempfile::tempdir().unwrap();
    let (state, port, _cert_path) = start_tls_relay(dir.path()).await;
    state.register_token("tok-bob", "bob");

    let store: Arc<dyn ClientStore> = Arc::new(MemoryStore::new());
    let manager = Arc::new(Mutex::new(load_or_create_identity(store.as_ref(), None).unwrap()));
    let (handle, mut events) =
        Client::new(tls_client_config(port, "tok-bob", None), manager, store).spawn();

    // The self-signed relay fails verification; the connection never
    // reaches attach.
    match next_event(&mut events).await {
        Event::Disconnected { reason } => {
            assert!(reason.contains("connect failed"), "unexpected reason: {reason}");
        }
        other => panic!("expected Disconnected, got {other:?}"),
    }
    handle.quit().await.unwrap();
}

#[tokio::test]
async fn missing_ca_file_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let (_state, port, _cert_path) = start_tls_relay(dir.path()).await;

    let store: Arc<dyn ClientStore> = Arc::new(MemoryStore::new());
    let manager = Arc::new(Mutex::new(load_or_create_identity(store.as_ref(), None).unwrap()));
    let bogus = dir.path().join("no-such-ca.pem");
    let (handle, mut events) =
        Client::new(tls_client_config(port, "tok", Some(bogus)), manager, store).spawn();

    match next_event(&mut events).await {
        Event::Disconnected { reason } => {
            assert!(reason.contains("relay CA"), "unexpected reason: {reason}");
        }
        other => panic!("expected Disconnected, got {other:?}"),
    }
    handle.quit().await.unwrap();
}

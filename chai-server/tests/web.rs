//! HTTP surface acceptance tests: health probe, bearer-token auth on
//! the prekey publish endpoint, and signature rejection.

use std::sync::Arc;

use chai_sdk::SessionManager;
use chai_server::config::ServerConfig;
use chai_server::db::Db;
use chai_server::server::SharedState;

/// Start the web router on an ephemeral port.
async fn start_web() -> (Arc<SharedState>, std::net::SocketAddr) {
    let state = Arc::new(SharedState::new(ServerConfig::default(), Db::open_memory().unwrap()));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = chai_server::web::router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (state, addr)
}

#[tokio::test]
async fn healthz_responds() {
    let (_state, addr) = start_web().await;
    let resp = reqwest::get(format!("http://{addr}/healthz")).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "ok");
}

#[tokio::test]
async fn publish_requires_bearer_token() {
    let (_state, addr) = start_web().await;
    let manager = SessionManager::generate();
    let body = serde_json::json!({ "bundle": manager.generate_prekey_bundle() });
    let client = reqwest::Client::new();

    // No Authorization header at all.
    let resp = client
        .post(format!("http://{addr}/prekeys/bundle"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    // A token the relay has never heard of.
    let resp = client
        .post(format!("http://{addr}/prekeys/bundle"))
        .bearer_auth("who-dis")
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn publish_rejects_bad_signature() {
    let (state, addr) = start_web().await;
    let token = state.mint_token("bob");

    let manager = SessionManager::generate();
    let mut bundle = manager.generate_prekey_bundle();
    bundle.signed_prekey_signature[0] ^= 1;

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/prekeys/bundle"))
        .bearer_auth(&token)
        .json(&serde_json::json!({ "bundle": bundle }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    assert_eq!(resp.text().await.unwrap(), "BadSignature");

    // Nothing was stored.
    assert!(state.db.lock().fetch_bundle("bob").unwrap().is_none());
}

#[tokio::test]
async fn publish_stores_bundle_with_inline_prekey() {
    let (state, addr) = start_web().await;
    let token = state.mint_token("bob");

    let mut manager = SessionManager::generate();
    let otps = manager.generate_one_time_prekeys(1);
    let mut bundle = manager.generate_prekey_bundle();
    bundle.one_time_prekey = Some(otps[0].1.to_vec());
    bundle.one_time_prekey_id = Some(otps[0].0);

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/prekeys/bundle"))
        .bearer_auth(&token)
        .json(&serde_json::json!({ "bundle": bundle }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    // Both the signed prekey and the inline one-time prekey landed.
    assert_eq!(state.db.lock().remaining_one_time_prekeys("bob").unwrap(), 1);
    let served = state.db.lock().fetch_bundle("bob").unwrap().unwrap();
    served.verify().unwrap();
    assert_eq!(served.one_time_prekey_id, Some(otps[0].0));
}

#[tokio::test]
async fn malformed_body_is_a_client_error() {
    let (state, addr) = start_web().await;
    let token = state.mint_token("bob");

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/prekeys/bundle"))
        .bearer_auth(&token)
        .header("content-type", "application/json")
        .body("{\"bundle\": 42}")
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_client_error());
}

#[tokio::test]
async fn ws_endpoint_requires_upgrade() {
    let (_state, addr) = start_web().await;
    let resp = reqwest::get(format!("http://{addr}/ws")).await.unwrap();
    assert!(!resp.status().is_success());
}

//! Relay server: shared state, the connection registry, and the accept
//! loops.
//!
//! One logical actor per connection; the only cross-connection state is
//! the `user_id → connection` registry (under a mutex) and the SQLite
//! store (serialized by its own mutex). Connections are held as weak
//! relations: closing a connection removes its registry entry, never
//! the other way around.
//!
//! Device policy is latest-wins: a second attach for the same user
//! closes the first connection with `Replaced`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;

use crate::config::ServerConfig;
use crate::connection;
use crate::db::Db;

/// Cross-connection nudges pushed through the registry. Envelope bytes
/// themselves are never pushed; the receiving connection reads them
/// back from the store so ordering and ack bookkeeping stay in one
/// place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// New mail: re-query the undelivered set.
    Wake,
    /// The user's one-time prekey pool dropped below the watermark.
    LowPrekeys { remaining: u32 },
    /// A newer connection took over this user id.
    Replaced,
}

/// Registry entry for a live connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub conn_id: u64,
    pub tx: mpsc::Sender<Signal>,
}

pub struct SharedState {
    pub config: ServerConfig,
    pub db: Mutex<Db>,
    /// user_id → live connection. At most one per user (latest wins).
    pub connections: Mutex<HashMap<String, ConnectionHandle>>,
    /// session token → user_id, filled by the authentication component.
    tokens: Mutex<HashMap<String, String>>,
    next_conn_id: AtomicU64,
}

impl SharedState {
    pub fn new(config: ServerConfig, db: Db) -> Self {
        Self {
            config,
            db: Mutex::new(db),
            connections: Mutex::new(HashMap::new()),
            tokens: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Register a session token for a user. Called by the (external)
    /// authentication layer, and by tests.
    pub fn register_token(&self, token: &str, user_id: &str) {
        self.tokens.lock().insert(token.to_string(), user_id.to_string());
    }

    /// Mint and register a random token for a user.
    pub fn mint_token(&self, user_id: &str) -> String {
        let token = format!("{:032x}", rand::random::<u128>());
        self.register_token(&token, user_id);
        token
    }

    /// Resolve a session token to a user id. In insecure-token mode an
    /// unknown token is its own user id (tests and local development).
    pub fn resolve_token(&self, token: &str) -> Option<String> {
        if let Some(user_id) = self.tokens.lock().get(token) {
            return Some(user_id.clone());
        }
        if self.config.insecure_tokens && !token.is_empty() {
            return Some(token.to_string());
        }
        None
    }

    pub fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Current unix time in milliseconds, the `created_at` clock.
    pub fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

pub struct Server {
    config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Open the store and build shared state.
    pub fn build_state(&self) -> Result<Arc<SharedState>> {
        let db = match &self.config.db_path {
            Some(path) => Db::open(path).with_context(|| format!("opening database {path}"))?,
            None => {
                tracing::warn!("no --db-path; messages and prekeys are in-memory only");
                Db::open_memory().context("opening in-memory database")?
            }
        };
        Ok(Arc::new(SharedState::new(self.config.clone(), db)))
    }

    /// Run everything: web surface (if configured), retention sweeper,
    /// and the TCP accept loop. Returns only on fatal errors.
    pub async fn run(self) -> Result<()> {
        let state = self.build_state()?;

        if let Some(web_addr) = state.config.web_addr.clone() {
            let web_state = state.clone();
            tokio::spawn(async move {
                if let Err(e) = crate::web::serve(web_state, &web_addr).await {
                    tracing::error!(error = %e, "web surface failed");
                }
            });
        }

        tokio::spawn(run_sweeper(state.clone()));

        let listener = TcpListener::bind(&state.config.listen_addr)
            .await
            .with_context(|| format!("binding {}", state.config.listen_addr))?;
        tracing::info!(addr = %state.config.listen_addr, "relay listening");

        if state.config.tls_enabled() {
            let acceptor = load_tls_acceptor(&state.config)?;
            Self::serve_tls(state, listener, acceptor).await
        } else {
            Self::serve(state, listener).await
        }
    }

    /// Plaintext accept loop. Public so tests can drive an ephemeral
    /// listener directly.
    pub async fn serve(state: Arc<SharedState>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer_addr) = listener.accept().await.context("accept")?;
            tracing::debug!(%peer_addr, "connection accepted");
            let state = state.clone();
            tokio::spawn(connection::handle(stream, state));
        }
    }

    /// TLS accept loop, same shape as [`serve`](Self::serve) with a
    /// handshake in front.
    pub async fn serve_tls(
        state: Arc<SharedState>,
        listener: TcpListener,
        acceptor: TlsAcceptor,
    ) -> Result<()> {
        loop {
            let (stream, peer_addr) = listener.accept().await.context("accept")?;
            let state = state.clone();
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                match acceptor.accept(stream).await {
                    Ok(tls) => connection::handle(tls, state).await,
                    Err(e) => tracing::debug!(%peer_addr, error = %e, "TLS handshake failed"),
                }
            });
        }
    }
}

/// Build the TLS acceptor from the configured PEM cert chain and key.
pub fn load_tls_acceptor(config: &ServerConfig) -> Result<TlsAcceptor> {
    use tokio_rustls::rustls;

    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let cert_path = config.tls_cert.as_deref().context("tls_cert is not configured")?;
    let key_path = config.tls_key.as_deref().context("tls_key is not configured")?;

    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(
        std::fs::File::open(cert_path).with_context(|| format!("opening {cert_path}"))?,
    ))
    .collect::<std::io::Result<Vec<_>>>()?;
    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(
        std::fs::File::open(key_path).with_context(|| format!("opening {key_path}"))?,
    ))?
    .context("no private key found in key file")?;

    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("building TLS config")?;
    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

/// Hourly retention sweep: delivered envelopes, expired envelopes, and
/// consumed one-time prekey rows.
async fn run_sweeper(state: Arc<SharedState>) {
    let retention_ms = i64::from(state.config.retention_days) * 24 * 60 * 60 * 1000;
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(3600));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let now = state.now_ms();
        match state.db.lock().sweep(now, retention_ms) {
            Ok(removed) if removed > 0 => {
                tracing::info!(removed, "retention sweep");
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "retention sweep failed"),
        }
    }
}

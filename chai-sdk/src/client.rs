//! Relay client: connection state machine, session restore, offline
//! drain, and automatic reconnection.
//!
//! The client is a single cooperative task. Crypto calls are
//! synchronous and fast; the only suspension points are the network and
//! the blob store. Commands arrive over a channel and events flow back
//! over another, so the UI layer never touches the socket.
//!
//! ## Reconnection
//!
//! `Disconnected → Connecting → Connected → Disconnected`, with a fixed
//! backoff ladder of 1, 2, 5, 10, 30 seconds and steady 30 s after
//! that. A successful attach resets the ladder. Sends issued while
//! disconnected are rejected immediately; nothing is queued.
//!
//! ## On attach
//!
//! Sessions are restored from the store best-effort (failures surface
//! as per-peer warnings), then the relay drains every stored envelope
//! addressed to us. Each is decrypted and acked; an undecryptable one
//! is acked too and surfaced as [`Event::MessageFailed`] so the UI can
//! show a placeholder instead of dropping it silently.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;

use crate::event::Event;
use crate::frame::{
    self, ClientFrame, ErrorKind, MESSAGE_TYPE_CONTROL, MESSAGE_TYPE_NORMAL, OneTimePrekeyUpload,
    ServerFrame,
};
use crate::session::{RotationPolicy, SessionManager};
use crate::store::{self, ClientStore};
use crate::vault;

/// Fixed reconnect ladder, then steady state at the last entry.
const BACKOFF_SCHEDULE: [Duration; 5] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(30),
];

const PING_INTERVAL: Duration = Duration::from_secs(30);
const MAX_MISSED_PONGS: u32 = 2;
const ATTACH_TIMEOUT: Duration = Duration::from_secs(10);

/// Default one-time prekey pool target when replenishing.
const DEFAULT_REPLENISH_TARGET: u32 = 30;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay address (host:port).
    pub server_addr: String,
    /// Session token from the authentication component.
    pub token: String,
    /// Connect with TLS.
    pub tls: bool,
    /// Extra CA certificate (PEM) trusted besides the webpki roots, for
    /// self-hosted relays running under their own CA. There is no way
    /// to turn certificate verification off.
    pub tls_ca: Option<PathBuf>,
    /// Password protecting the identity blob at rest, if any. Needed to
    /// re-lock the blob when prekey material changes.
    pub identity_password: Option<String>,
    /// One-time prekey pool size to restore on `LowPrekeys`.
    pub replenish_target: u32,
    /// Signed-prekey rotation policy, checked on every attach.
    pub rotation: RotationPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:7420".to_string(),
            token: String::new(),
            tls: false,
            tls_ca: None,
            identity_password: None,
            replenish_target: DEFAULT_REPLENISH_TARGET,
            rotation: RotationPolicy::default(),
        }
    }
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
}

/// Commands the consumer can send to the client task.
#[derive(Debug)]
pub enum Command {
    SendMessage { recipient_id: String, plaintext: Vec<u8> },
    /// Fetch the peer's bundle and establish a session without sending
    /// a user-visible message.
    EstablishSession { peer_id: String },
    /// Generate and upload one-time prekeys plus the current bundle.
    UploadPrekeys { count: u32 },
    Quit,
}

/// Handle to a running client task.
#[derive(Clone)]
pub struct ClientHandle {
    cmd_tx: mpsc::Sender<Command>,
}

impl ClientHandle {
    pub async fn send_message(&self, recipient_id: &str, plaintext: &[u8]) -> Result<()> {
        self.cmd_tx
            .send(Command::SendMessage {
                recipient_id: recipient_id.to_string(),
                plaintext: plaintext.to_vec(),
            })
            .await?;
        Ok(())
    }

    pub async fn establish_session(&self, peer_id: &str) -> Result<()> {
        self.cmd_tx
            .send(Command::EstablishSession { peer_id: peer_id.to_string() })
            .await?;
        Ok(())
    }

    pub async fn upload_prekeys(&self, count: u32) -> Result<()> {
        self.cmd_tx.send(Command::UploadPrekeys { count }).await?;
        Ok(())
    }

    pub async fn quit(&self) -> Result<()> {
        self.cmd_tx.send(Command::Quit).await?;
        Ok(())
    }
}

/// Load the identity from the store, or create and persist a fresh one.
/// A vault-locked blob requires the password.
pub fn load_or_create_identity(
    store: &dyn ClientStore,
    password: Option<&str>,
) -> Result<SessionManager> {
    match store.get(store::IDENTITY_KEY)? {
        Some(blob) => {
            let raw = if vault::is_locked(&blob) {
                let password = password
                    .ok_or_else(|| anyhow::anyhow!("identity blob is password-protected"))?;
                vault::unlock(&blob, password)?
            } else {
                blob
            };
            Ok(SessionManager::from_bytes(&raw)?)
        }
        None => {
            let manager = SessionManager::generate();
            persist_identity_blob(store, &manager, password)?;
            Ok(manager)
        }
    }
}

fn persist_identity_blob(
    store: &dyn ClientStore,
    manager: &SessionManager,
    password: Option<&str>,
) -> Result<()> {
    let raw = manager.export_identity();
    let blob = match password {
        Some(pw) => vault::lock(&raw, pw),
        None => raw,
    };
    store.put(store::IDENTITY_KEY, &blob)?;
    Ok(())
}

/// The relay client. Construct, then [`spawn`](Client::spawn).
pub struct Client {
    config: ClientConfig,
    manager: Arc<Mutex<SessionManager>>,
    store: Arc<dyn ClientStore>,
}

impl Client {
    pub fn new(
        config: ClientConfig,
        manager: Arc<Mutex<SessionManager>>,
        store: Arc<dyn ClientStore>,
    ) -> Self {
        Self { config, manager, store }
    }

    /// Start the connection task. Returns a command handle and the
    /// event stream.
    pub fn spawn(self) -> (ClientHandle, mpsc::Receiver<Event>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(256);
        tokio::spawn(run_client(self.config, self.manager, self.store, cmd_rx, event_tx));
        (ClientHandle { cmd_tx }, event_rx)
    }
}

/// How a single connection ended.
enum ConnectionEnd {
    /// Consumer asked us to stop.
    Quit,
    /// The relay replaced this device; do not reconnect.
    Replaced,
    /// Transport lost. `attached` controls backoff reset.
    Lost { attached: bool },
}

async fn run_client(
    config: ClientConfig,
    manager: Arc<Mutex<SessionManager>>,
    store: Arc<dyn ClientStore>,
    mut cmd_rx: mpsc::Receiver<Command>,
    event_tx: mpsc::Sender<Event>,
) {
    let mut failures: usize = 0;
    loop {
        let conn = match establish_connection(&config).await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(error = %e, attempt = failures, "connect failed");
                let _ = event_tx
                    .send(Event::Disconnected { reason: format!("connect failed: {e}") })
                    .await;
                if !backoff_wait(&mut cmd_rx, &event_tx, failures).await {
                    return;
                }
                failures += 1;
                continue;
            }
        };
        let _ = event_tx.send(Event::Connected).await;

        let end = match conn {
            EstablishedConnection::Plain(stream) => {
                run_connection(stream, &config, &manager, &store, &mut cmd_rx, &event_tx).await
            }
            EstablishedConnection::Tls(stream) => {
                run_connection(stream, &config, &manager, &store, &mut cmd_rx, &event_tx).await
            }
        };

        match end {
            Ok(ConnectionEnd::Quit) => return,
            Ok(ConnectionEnd::Replaced) => {
                let _ = event_tx
                    .send(Event::Disconnected { reason: "replaced by a newer connection".into() })
                    .await;
                return;
            }
            Ok(ConnectionEnd::Lost { attached }) => {
                if attached {
                    failures = 0;
                }
                let _ = event_tx
                    .send(Event::Disconnected { reason: "connection lost".into() })
                    .await;
            }
            Err(e) => {
                let _ = event_tx.send(Event::Disconnected { reason: e.to_string() }).await;
            }
        }

        if !backoff_wait(&mut cmd_rx, &event_tx, failures).await {
            return;
        }
        failures += 1;
    }
}

/// Sleep out the backoff window while rejecting commands immediately.
/// Returns false when the consumer quit.
async fn backoff_wait(
    cmd_rx: &mut mpsc::Receiver<Command>,
    event_tx: &mpsc::Sender<Event>,
    failures: usize,
) -> bool {
    let delay = BACKOFF_SCHEDULE[failures.min(BACKOFF_SCHEDULE.len() - 1)];
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            cmd = cmd_rx.recv() => match cmd {
                None | Some(Command::Quit) => return false,
                Some(Command::SendMessage { recipient_id, .. }) => {
                    let _ = event_tx
                        .send(Event::Warning {
                            message: format!("not connected; send to {recipient_id} rejected"),
                        })
                        .await;
                }
                Some(_) => {
                    let _ = event_tx
                        .send(Event::Warning { message: "not connected; command rejected".into() })
                        .await;
                }
            },
        }
    }
}

// ── Transport establishment ────────────────────────────────────────

enum EstablishedConnection {
    Plain(TcpStream),
    Tls(tokio_rustls::client::TlsStream<TcpStream>),
}

async fn establish_connection(config: &ClientConfig) -> Result<EstablishedConnection> {
    let tcp = TcpStream::connect(&config.server_addr)
        .await
        .with_context(|| format!("relay {} is unreachable", config.server_addr))?;

    if !config.tls {
        return Ok(EstablishedConnection::Plain(tcp));
    }

    let connector = TlsConnector::from(Arc::new(tls_client_config(config.tls_ca.as_deref())?));
    let host = config.server_addr.split(':').next().unwrap_or("localhost");
    let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
        .with_context(|| format!("{host} is not usable as a TLS server name"))?;
    let stream = connector
        .connect(server_name, tcp)
        .await
        .with_context(|| format!("could not secure the connection to {host}"))?;
    Ok(EstablishedConnection::Tls(stream))
}

/// The client's one TLS policy: the webpki root set, optionally
/// extended with an operator-supplied CA for self-hosted relays.
/// Certificate verification is never skipped.
fn tls_client_config(relay_ca: Option<&Path>) -> Result<rustls::ClientConfig> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let mut roots =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    if let Some(path) = relay_ca {
        let file = std::fs::File::open(path)
            .with_context(|| format!("opening relay CA {}", path.display()))?;
        let mut reader = std::io::BufReader::new(file);
        let mut added = 0usize;
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert = cert.with_context(|| format!("parsing relay CA {}", path.display()))?;
            roots.add(cert)?;
            added += 1;
        }
        if added == 0 {
            anyhow::bail!("relay CA {} holds no certificates", path.display());
        }
        tracing::debug!(ca = %path.display(), added, "extended trust roots with relay CA");
    }

    Ok(rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}

// ── One connection ─────────────────────────────────────────────────

async fn run_connection<S>(
    stream: S,
    config: &ClientConfig,
    manager: &Arc<Mutex<SessionManager>>,
    store: &Arc<dyn ClientStore>,
    cmd_rx: &mut mpsc::Receiver<Command>,
    event_tx: &mpsc::Sender<Event>,
) -> Result<ConnectionEnd>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    let mut writer = write_half;

    // Attach must be the first exchange on the wire.
    frame::write_frame(&mut writer, &ClientFrame::Attach { token: config.token.clone() }).await?;
    let attach = tokio::time::timeout(
        ATTACH_TIMEOUT,
        frame::read_frame::<_, ServerFrame>(&mut reader),
    )
    .await;
    let user_id = match attach {
        Ok(Ok(Some(ServerFrame::Attached { user_id }))) => user_id,
        Ok(Ok(Some(ServerFrame::Error { kind, message }))) => {
            let _ = event_tx
                .send(Event::Warning { message: format!("attach rejected ({kind:?}): {message}") })
                .await;
            return Ok(ConnectionEnd::Lost { attached: false });
        }
        Ok(Ok(_)) => return Ok(ConnectionEnd::Lost { attached: false }),
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => {
            tracing::warn!("attach timed out");
            return Ok(ConnectionEnd::Lost { attached: false });
        }
    };
    tracing::info!(%user_id, "attached to relay");
    let _ = event_tx.send(Event::Attached { user_id }).await;

    restore_sessions(manager, store, event_tx).await;

    // Reads happen on their own task so the select loop below only ever
    // races cancel-safe channel receives.
    let (frame_tx, mut frame_rx) = mpsc::channel::<std::io::Result<ServerFrame>>(64);
    let reader_task = tokio::spawn(async move {
        loop {
            match frame::read_frame::<_, ServerFrame>(&mut reader).await {
                Ok(Some(frame)) => {
                    if frame_tx.send(Ok(frame)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = frame_tx.send(Err(e)).await;
                    break;
                }
            }
        }
    });

    let mut conn = ConnectionState {
        config,
        manager,
        store,
        event_tx,
        pending_sends: HashMap::new(),
        outstanding_pings: 0,
    };

    conn.check_rotation(&mut writer).await?;

    let mut ping = tokio::time::interval_at(
        tokio::time::Instant::now() + PING_INTERVAL,
        PING_INTERVAL,
    );
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let end = loop {
        tokio::select! {
            _ = ping.tick() => {
                if conn.outstanding_pings >= MAX_MISSED_PONGS {
                    tracing::warn!("ping timeout; dropping connection");
                    break ConnectionEnd::Lost { attached: true };
                }
                frame::write_frame(&mut writer, &ClientFrame::Ping).await?;
                conn.outstanding_pings += 1;
            }
            cmd = cmd_rx.recv() => match cmd {
                None | Some(Command::Quit) => break ConnectionEnd::Quit,
                Some(cmd) => conn.handle_command(cmd, &mut writer).await?,
            },
            frame = frame_rx.recv() => match frame {
                None => break ConnectionEnd::Lost { attached: true },
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "read failed");
                    break ConnectionEnd::Lost { attached: true };
                }
                Some(Ok(frame)) => {
                    if let Some(end) = conn.handle_server_frame(frame, &mut writer).await? {
                        break end;
                    }
                }
            },
        }
    };

    reader_task.abort();
    Ok(end)
}

async fn restore_sessions(
    manager: &Arc<Mutex<SessionManager>>,
    store: &Arc<dyn ClientStore>,
    event_tx: &mpsc::Sender<Event>,
) {
    let keys = match store.keys_with_prefix("session:") {
        Ok(keys) => keys,
        Err(e) => {
            let _ = event_tx
                .send(Event::Warning { message: format!("session restore failed: {e}") })
                .await;
            return;
        }
    };
    for key in keys {
        let Some(peer_id) = store::peer_of_session_key(&key) else { continue };
        let outcome = store
            .get(&key)
            .map_err(|e| e.to_string())
            .and_then(|blob| blob.ok_or_else(|| "missing blob".to_string()))
            .and_then(|blob| {
                manager.lock().import_session(peer_id, &blob).map_err(|e| e.to_string())
            });
        if let Err(reason) = outcome {
            let _ = event_tx
                .send(Event::Warning {
                    message: format!("could not restore session with {peer_id}: {reason}"),
                })
                .await;
        }
    }
}

/// Per-connection client state and frame/command handlers.
struct ConnectionState<'a> {
    config: &'a ClientConfig,
    manager: &'a Arc<Mutex<SessionManager>>,
    store: &'a Arc<dyn ClientStore>,
    event_tx: &'a mpsc::Sender<Event>,
    /// Plaintexts waiting on a prekey bundle, keyed by peer. An empty
    /// entry marks a bundle requested for session establishment only.
    pending_sends: HashMap<String, Vec<Vec<u8>>>,
    outstanding_pings: u32,
}

impl ConnectionState<'_> {
    async fn handle_command<W>(&mut self, cmd: Command, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        match cmd {
            Command::SendMessage { recipient_id, plaintext } => {
                let encrypted = {
                    let mut manager = self.manager.lock();
                    if manager.has_session(&recipient_id) {
                        Some(manager.encrypt(&recipient_id, &plaintext))
                    } else {
                        None
                    }
                };
                match encrypted {
                    Some(Ok(ciphertext)) => {
                        self.persist_session(&recipient_id).await;
                        frame::write_frame(
                            writer,
                            &ClientFrame::SendMessage {
                                recipient_id,
                                ciphertext,
                                message_type: MESSAGE_TYPE_NORMAL,
                            },
                        )
                        .await?;
                    }
                    Some(Err(e)) => {
                        let _ = self
                            .event_tx
                            .send(Event::Warning {
                                message: format!("encrypt for {recipient_id} failed: {e}"),
                            })
                            .await;
                    }
                    None => {
                        // No session yet: fetch the bundle and hold the
                        // plaintext until it arrives.
                        self.pending_sends
                            .entry(recipient_id.clone())
                            .or_default()
                            .push(plaintext);
                        frame::write_frame(
                            writer,
                            &ClientFrame::GetPrekeyBundle { user_id: recipient_id },
                        )
                        .await?;
                    }
                }
            }
            Command::EstablishSession { peer_id } => {
                if self.manager.lock().has_session(&peer_id) {
                    let _ = self.event_tx.send(Event::SessionEstablished { peer_id }).await;
                } else {
                    self.pending_sends.entry(peer_id.clone()).or_default();
                    frame::write_frame(writer, &ClientFrame::GetPrekeyBundle { user_id: peer_id })
                        .await?;
                }
            }
            Command::UploadPrekeys { count } => {
                self.upload_prekeys(count, writer).await?;
            }
            Command::Quit => unreachable!("handled by the select loop"),
        }
        Ok(())
    }

    /// Returns `Some(end)` when the connection must stop.
    async fn handle_server_frame<W>(
        &mut self,
        frame: ServerFrame,
        writer: &mut W,
    ) -> Result<Option<ConnectionEnd>>
    where
        W: AsyncWrite + Unpin,
    {
        match frame {
            ServerFrame::Pong => {
                self.outstanding_pings = 0;
            }
            ServerFrame::Message { message_id, sender_id, ciphertext, message_type, .. } => {
                let (had_session, held_before) = {
                    let manager = self.manager.lock();
                    (manager.has_session(&sender_id), manager.one_time_prekeys_held())
                };
                let result = self.manager.lock().decrypt(&sender_id, &ciphertext);
                match result {
                    Ok(plaintext) => {
                        self.persist_session(&sender_id).await;
                        let held_after = self.manager.lock().one_time_prekeys_held();
                        if held_after != held_before {
                            // A one-time prekey was consumed; its
                            // private half must not survive a restart.
                            self.persist_identity().await;
                        }
                        if !had_session {
                            let _ = self
                                .event_tx
                                .send(Event::SessionEstablished { peer_id: sender_id.clone() })
                                .await;
                        }
                        if message_type == MESSAGE_TYPE_CONTROL && plaintext.is_empty() {
                            // Session-establishment ping; nothing to show.
                        } else {
                            let _ = self
                                .event_tx
                                .send(Event::MessageReceived { sender_id, message_id, plaintext })
                                .await;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(%sender_id, message_id, error = %e, "decrypt failed");
                        let _ = self
                            .event_tx
                            .send(Event::MessageFailed {
                                sender_id,
                                message_id,
                                reason: e.to_string(),
                            })
                            .await;
                    }
                }
                // Delivered either way; ack so the relay stops holding it.
                frame::write_frame(writer, &ClientFrame::AckMessages { message_ids: vec![message_id] })
                    .await?;
            }
            ServerFrame::MessageSent { message_id } => {
                let _ = self.event_tx.send(Event::MessageSent { message_id }).await;
            }
            ServerFrame::PrekeyBundle { user_id, bundle } => {
                self.finish_pending_sends(user_id, bundle, writer).await?;
            }
            ServerFrame::LowPrekeys { remaining } => {
                let _ = self.event_tx.send(Event::LowPrekeys { remaining }).await;
                let count = self.config.replenish_target.saturating_sub(remaining);
                if count > 0 {
                    self.upload_prekeys(count, writer).await?;
                }
            }
            ServerFrame::Error { kind: ErrorKind::Replaced, .. } => {
                return Ok(Some(ConnectionEnd::Replaced));
            }
            ServerFrame::Error { kind: ErrorKind::Backpressure, message } => {
                tracing::warn!(%message, "relay backpressure; reconnecting");
                return Ok(Some(ConnectionEnd::Lost { attached: true }));
            }
            ServerFrame::Error { kind, message } => {
                let _ = self
                    .event_tx
                    .send(Event::Warning { message: format!("relay error ({kind:?}): {message}") })
                    .await;
            }
            ServerFrame::Attached { .. } => {
                // Already attached; a duplicate is a protocol hiccup.
                tracing::debug!("unexpected Attached frame");
            }
        }
        Ok(None)
    }

    /// A fetched bundle arrived: establish the session and flush any
    /// plaintexts that were waiting on it.
    async fn finish_pending_sends<W>(
        &mut self,
        user_id: String,
        bundle: Option<crate::x3dh::PreKeyBundle>,
        writer: &mut W,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let pending = self.pending_sends.remove(&user_id).unwrap_or_default();
        let Some(bundle) = bundle else {
            let _ = self
                .event_tx
                .send(Event::Warning {
                    message: format!("no prekey bundle published for {user_id}"),
                })
                .await;
            return Ok(());
        };

        let mut queue = pending.into_iter();
        let (first, first_type) = match queue.next() {
            Some(plaintext) => (plaintext, MESSAGE_TYPE_NORMAL),
            // Establishment-only: an empty control message carries the
            // initial block without surfacing anything at the peer's UI.
            None => (Vec::new(), MESSAGE_TYPE_CONTROL),
        };

        let mut frames = Vec::new();
        let init_err = {
            let mut manager = self.manager.lock();
            match manager.init_session(&user_id, &bundle, &first) {
                Ok(ciphertext) => {
                    frames.push(ClientFrame::SendMessage {
                        recipient_id: user_id.clone(),
                        ciphertext,
                        message_type: first_type,
                    });
                    for plaintext in queue {
                        match manager.encrypt(&user_id, &plaintext) {
                            Ok(ciphertext) => frames.push(ClientFrame::SendMessage {
                                recipient_id: user_id.clone(),
                                ciphertext,
                                message_type: MESSAGE_TYPE_NORMAL,
                            }),
                            Err(e) => {
                                tracing::warn!(%user_id, error = %e, "queued encrypt failed");
                            }
                        }
                    }
                    None
                }
                Err(e) => Some(e),
            }
        };
        if let Some(e) = init_err {
            let _ = self
                .event_tx
                .send(Event::Warning {
                    message: format!("session init with {user_id} failed: {e}"),
                })
                .await;
            return Ok(());
        }

        self.persist_session(&user_id).await;
        for frame_out in frames {
            frame::write_frame(writer, &frame_out).await?;
        }
        let _ = self.event_tx.send(Event::SessionEstablished { peer_id: user_id }).await;
        Ok(())
    }

    /// Mint a new signed-prekey generation when the policy says the
    /// current one is worn out, and re-publish the bundle. Always
    /// persists the identity so the rotation clock survives restarts.
    async fn check_rotation<W>(&mut self, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let now_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        let rotated = self
            .manager
            .lock()
            .maybe_rotate_signed_prekey(now_ms, &self.config.rotation);
        self.persist_identity().await;
        let Some(bundle) = rotated else { return Ok(()) };
        tracing::info!(signed_prekey_id = bundle.signed_prekey_id, "rotated signed prekey");
        frame::write_frame(
            writer,
            &ClientFrame::UploadPrekeys { bundle, one_time_prekeys: Vec::new() },
        )
        .await?;
        Ok(())
    }

    async fn upload_prekeys<W>(&mut self, count: u32, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let (bundle, one_time_prekeys) = {
            let mut manager = self.manager.lock();
            let otps = manager
                .generate_one_time_prekeys(count)
                .into_iter()
                .map(|(prekey_id, prekey)| OneTimePrekeyUpload {
                    prekey_id,
                    prekey: prekey.to_vec(),
                })
                .collect::<Vec<_>>();
            (manager.generate_prekey_bundle(), otps)
        };
        // New private halves exist; persist before the publics go out.
        self.persist_identity().await;
        frame::write_frame(writer, &ClientFrame::UploadPrekeys { bundle, one_time_prekeys })
            .await?;
        Ok(())
    }

    async fn persist_session(&self, peer_id: &str) {
        let blob = self.manager.lock().export_session(peer_id);
        let outcome = blob.map_err(|e| e.to_string()).and_then(|blob| {
            self.store
                .put(&store::session_key(peer_id), &blob)
                .map_err(|e| e.to_string())
        });
        if let Err(reason) = outcome {
            let _ = self
                .event_tx
                .send(Event::Warning {
                    message: format!("could not persist session with {peer_id}: {reason}"),
                })
                .await;
        }
    }

    async fn persist_identity(&self) {
        let result = {
            let manager = self.manager.lock();
            persist_identity_blob(
                self.store.as_ref(),
                &manager,
                self.config.identity_password.as_deref(),
            )
        };
        if let Err(e) = result {
            let _ = self
                .event_tx
                .send(Event::Warning { message: format!("could not persist identity: {e}") })
                .await;
        }
    }
}

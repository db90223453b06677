//! Per-connection handler: attach, frame dispatch, delivery, and
//! liveness.
//!
//! The first frame on a connection must be `Attach`; everything else is
//! rejected until the token resolves. After attach the handler:
//!
//! - drains every undelivered envelope for the user, oldest first,
//!   before any new traffic;
//! - delivers new mail on `Wake` signals from sender connections —
//!   `Message` frames are always re-read from the store, so per-pair
//!   order is the store's `(created_at, id)` order and an envelope is
//!   sent at most once per connection (acks clear the in-flight set);
//! - answers `Ping`, serves bundle fetches, accepts prekey uploads and
//!   acks;
//! - closes the connection when the client goes quiet past the idle
//!   deadline, when a newer attach replaces it, or when its signal
//!   queue overflows (backpressure).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::mpsc;
use tokio::time::Instant;

use chai_sdk::frame::{self, ClientFrame, ErrorKind, ServerFrame};

use crate::db::DirectoryError;
use crate::server::{ConnectionHandle, SharedState, Signal};

/// Deadline for the initial Attach frame.
const ATTACH_TIMEOUT: Duration = Duration::from_secs(10);

/// Clients ping every 30 s; two missed rounds and the connection is
/// considered dead.
const IDLE_TIMEOUT: Duration = Duration::from_secs(75);
const IDLE_CHECK: Duration = Duration::from_secs(30);

/// Entry point for one accepted transport stream.
pub async fn handle<S>(stream: S, state: Arc<SharedState>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    if let Err(e) = run(stream, state).await {
        tracing::debug!(error = %e, "connection closed with error");
    }
}

async fn run<S>(stream: S, state: Arc<SharedState>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    let mut writer = write_half;

    // ── Attach ─────────────────────────────────────────────────────
    let first = tokio::time::timeout(
        ATTACH_TIMEOUT,
        frame::read_frame::<_, ClientFrame>(&mut reader),
    )
    .await;
    let token = match first {
        Ok(Ok(Some(ClientFrame::Attach { token }))) => token,
        Ok(Ok(Some(_))) => {
            send_error(&mut writer, ErrorKind::Unauthorized, "attach required").await;
            return Ok(());
        }
        Ok(Ok(None)) => return Ok(()),
        Ok(Err(e)) => {
            send_error(&mut writer, ErrorKind::BadRequest, "malformed attach").await;
            return Err(e.into());
        }
        Err(_) => {
            tracing::debug!("attach timed out");
            return Ok(());
        }
    };
    let Some(user_id) = state.resolve_token(&token) else {
        send_error(&mut writer, ErrorKind::Unauthorized, "unknown session token").await;
        return Ok(());
    };

    let conn_id = state.next_conn_id();
    let (tx, rx) = mpsc::channel::<Signal>(state.config.outbound_queue.max(1));

    // Latest wins: shove aside any previous connection for this user.
    let previous = state
        .connections
        .lock()
        .insert(user_id.clone(), ConnectionHandle { conn_id, tx });
    if let Some(previous) = previous {
        tracing::info!(%user_id, old_conn = previous.conn_id, "replacing earlier connection");
        let _ = previous.tx.try_send(Signal::Replaced);
    }

    frame::write_frame(&mut writer, &ServerFrame::Attached { user_id: user_id.clone() }).await?;
    tracing::info!(%user_id, conn_id, "attached");

    let result = serve_attached(reader, &mut writer, &state, &user_id, rx).await;

    // Unregister, but only if the entry is still ours.
    {
        let mut connections = state.connections.lock();
        if connections.get(&user_id).map(|h| h.conn_id) == Some(conn_id) {
            connections.remove(&user_id);
        }
    }
    tracing::info!(%user_id, conn_id, "detached");
    result
}

async fn serve_attached<R, W>(
    mut reader: BufReader<R>,
    writer: &mut W,
    state: &Arc<SharedState>,
    user_id: &str,
    mut signal_rx: mpsc::Receiver<Signal>,
) -> Result<()>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Unpin,
{
    let mut conn = Connection {
        state,
        user_id,
        inflight: HashSet::new(),
    };

    // Drain the stored backlog before anything else reaches this client.
    conn.deliver_pending(writer).await?;

    // Reads run on their own task so the select below only races
    // cancel-safe channel receives.
    let (frame_tx, mut frame_rx) = mpsc::channel::<std::io::Result<ClientFrame>>(16);
    let reader_task = tokio::spawn(async move {
        loop {
            match frame::read_frame::<_, ClientFrame>(&mut reader).await {
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

    let mut last_inbound = Instant::now();
    let mut idle = tokio::time::interval(IDLE_CHECK);
    idle.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    idle.reset();

    let result = loop {
        tokio::select! {
            _ = idle.tick() => {
                if last_inbound.elapsed() > IDLE_TIMEOUT {
                    tracing::info!(user_id = %conn.user_id, "idle timeout");
                    break Ok(());
                }
            }
            signal = signal_rx.recv() => match signal {
                None => {
                    // Our registry entry was dropped without a Replaced
                    // signal: the signal queue overflowed.
                    send_error(writer, ErrorKind::Backpressure, "outbound queue overflow").await;
                    break Ok(());
                }
                Some(Signal::Replaced) => {
                    send_error(writer, ErrorKind::Replaced, "newer connection attached").await;
                    break Ok(());
                }
                Some(Signal::Wake) => {
                    if let Err(e) = conn.deliver_pending(writer).await {
                        break Err(e);
                    }
                }
                Some(Signal::LowPrekeys { remaining }) => {
                    frame::write_frame(writer, &ServerFrame::LowPrekeys { remaining }).await?;
                }
            },
            inbound = frame_rx.recv() => match inbound {
                None => break Ok(()),
                Some(Err(e)) => {
                    match e.kind() {
                        std::io::ErrorKind::FileTooLarge => {
                            send_error(writer, ErrorKind::FrameTooLarge, "frame exceeds 1 MiB")
                                .await;
                        }
                        std::io::ErrorKind::InvalidData => {
                            send_error(writer, ErrorKind::BadRequest, &e.to_string()).await;
                        }
                        _ => {}
                    }
                    break Ok(());
                }
                Some(Ok(frame)) => {
                    last_inbound = Instant::now();
                    if let Err(e) = conn.handle_frame(frame, writer).await {
                        break Err(e);
                    }
                }
            },
        }
    };

    reader_task.abort();
    result
}

/// Post-attach state for one connection.
struct Connection<'a> {
    state: &'a Arc<SharedState>,
    user_id: &'a str,
    /// Message ids sent on this connection and not yet acked. Prevents
    /// duplicate delivery when several Wake signals race one backlog.
    inflight: HashSet<i64>,
}

impl Connection<'_> {
    async fn handle_frame<W>(&mut self, frame: ClientFrame, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        match frame {
            ClientFrame::Ping => {
                frame::write_frame(writer, &ServerFrame::Pong).await?;
            }
            ClientFrame::Attach { .. } => {
                send_error(writer, ErrorKind::BadRequest, "already attached").await;
            }
            ClientFrame::SendMessage { recipient_id, ciphertext, message_type } => {
                self.handle_send(recipient_id, ciphertext, message_type, writer).await?;
            }
            ClientFrame::GetPrekeyBundle { user_id: target } => {
                self.handle_fetch_bundle(target, writer).await?;
            }
            ClientFrame::AckMessages { message_ids } => {
                let now = self.state.now_ms();
                let acked = self.state.db.lock().mark_delivered(&message_ids, now);
                match acked {
                    Ok(changed) => {
                        tracing::debug!(
                            user_id = %self.user_id,
                            acked = message_ids.len(),
                            changed,
                            "messages acked"
                        );
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "ack failed");
                        send_error(writer, ErrorKind::Internal, "storage failure").await;
                    }
                }
                for id in message_ids {
                    self.inflight.remove(&id);
                }
            }
            ClientFrame::UploadPrekeys { bundle, one_time_prekeys } => {
                let now = self.state.now_ms();
                let uploads: Vec<(u32, Vec<u8>)> = one_time_prekeys
                    .into_iter()
                    .map(|otp| (otp.prekey_id, otp.prekey))
                    .collect();
                let result = {
                    let db = self.state.db.lock();
                    db.publish_bundle(self.user_id, &bundle, now).and_then(|()| {
                        db.append_one_time_prekeys(self.user_id, &uploads, now)
                            .map_err(DirectoryError::from)
                    })
                };
                match result {
                    Ok(()) => {
                        tracing::debug!(user_id = %self.user_id, count = uploads.len(), "prekeys published");
                    }
                    Err(DirectoryError::BadSignature | DirectoryError::IdentityMismatch) => {
                        send_error(writer, ErrorKind::BadSignature, "bundle signature rejected")
                            .await;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "prekey publish failed");
                        send_error(writer, ErrorKind::Internal, "storage failure").await;
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_send<W>(
        &mut self,
        recipient_id: String,
        ciphertext: Vec<u8>,
        message_type: u8,
        writer: &mut W,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        if recipient_id.is_empty() || ciphertext.is_empty() {
            send_error(writer, ErrorKind::BadRequest, "empty recipient or ciphertext").await;
            return Ok(());
        }

        let created_at = self.state.now_ms();
        let inserted = self.state.db.lock().insert_message(
            self.user_id,
            &recipient_id,
            &ciphertext,
            message_type,
            created_at,
        );
        let message_id = match inserted {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(error = %e, "message insert failed");
                send_error(writer, ErrorKind::Internal, "storage failure").await;
                return Ok(());
            }
        };

        // Persisted: confirm to the sender before attempting delivery.
        frame::write_frame(writer, &ServerFrame::MessageSent { message_id }).await?;
        tracing::debug!(
            sender = %self.user_id,
            recipient = %recipient_id,
            message_id,
            "message stored"
        );

        self.nudge(&recipient_id, Signal::Wake);
        Ok(())
    }

    async fn handle_fetch_bundle<W>(&mut self, target: String, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let fetched = self.state.db.lock().fetch_bundle(&target);
        let bundle = match fetched {
            Ok(bundle) => bundle,
            Err(e) => {
                tracing::error!(error = %e, "bundle fetch failed");
                send_error(writer, ErrorKind::Internal, "storage failure").await;
                return Ok(());
            }
        };

        let consumed_one_time = bundle
            .as_ref()
            .is_some_and(|b| b.one_time_prekey_id.is_some());
        frame::write_frame(writer, &ServerFrame::PrekeyBundle { user_id: target.clone(), bundle })
            .await?;

        // Consuming a one-time prekey may have crossed the low-stock
        // watermark; tell the owner while they are online.
        if consumed_one_time {
            let remaining = self
                .state
                .db
                .lock()
                .remaining_one_time_prekeys(&target)
                .unwrap_or(0);
            if remaining < self.state.config.low_watermark {
                self.nudge(&target, Signal::LowPrekeys { remaining });
            }
        }
        Ok(())
    }

    /// Push a signal to another user's connection, if live. A full
    /// queue means the peer has stopped draining: drop its registry
    /// entry, which closes it with Backpressure.
    fn nudge(&self, user_id: &str, signal: Signal) {
        let handle = self.state.connections.lock().get(user_id).cloned();
        let Some(handle) = handle else { return };
        match handle.tx.try_send(signal) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(%user_id, "signal queue overflow; closing connection");
                let mut connections = self.state.connections.lock();
                if connections.get(user_id).map(|h| h.conn_id) == Some(handle.conn_id) {
                    connections.remove(user_id);
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                let mut connections = self.state.connections.lock();
                if connections.get(user_id).map(|h| h.conn_id) == Some(handle.conn_id) {
                    connections.remove(user_id);
                }
            }
        }
    }

    /// Send every undelivered envelope not already in flight, oldest
    /// first.
    async fn deliver_pending<W>(&mut self, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let queried = self.state.db.lock().undelivered_for(self.user_id);
        let rows = match queried {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!(error = %e, "undelivered query failed");
                send_error(writer, ErrorKind::Internal, "storage failure").await;
                return Ok(());
            }
        };
        for row in rows {
            if !self.inflight.insert(row.id) {
                continue;
            }
            frame::write_frame(
                writer,
                &ServerFrame::Message {
                    message_id: row.id,
                    sender_id: row.sender_id,
                    ciphertext: row.ciphertext,
                    message_type: row.message_type,
                    created_at: row.created_at,
                },
            )
            .await?;
        }
        Ok(())
    }
}

async fn send_error<W>(writer: &mut W, kind: ErrorKind, message: &str)
where
    W: AsyncWrite + Unpin,
{
    let frame = ServerFrame::Error { kind, message: message.to_string() };
    if let Err(e) = frame::write_frame(writer, &frame).await {
        tracing::debug!(error = %e, "error frame not delivered");
    }
}

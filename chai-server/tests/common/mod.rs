//! Shared scaffolding for relay integration tests: an ephemeral relay
//! on a random port plus a minimal frame-level test client.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use chai_sdk::frame::{self, ClientFrame, ServerFrame};
use chai_server::config::ServerConfig;
use chai_server::db::Db;
use chai_server::server::{Server, SharedState};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Start a relay with an in-memory store on an ephemeral port.
pub async fn spawn_relay() -> (Arc<SharedState>, SocketAddr) {
    spawn_relay_with(ServerConfig::default()).await
}

pub async fn spawn_relay_with(config: ServerConfig) -> (Arc<SharedState>, SocketAddr) {
    let state = Arc::new(SharedState::new(config, Db::open_memory().unwrap()));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(Server::serve(state.clone(), listener));
    (state, addr)
}

/// A raw frame-level client.
pub struct TestClient {
    pub reader: BufReader<OwnedReadHalf>,
    pub writer: OwnedWriteHalf,
}

impl TestClient {
    /// Connect and attach as `user_id` with a freshly minted token.
    pub async fn attach(state: &SharedState, addr: SocketAddr, user_id: &str) -> Self {
        let token = state.mint_token(user_id);
        let mut client = Self::connect(addr).await;
        client.send(&ClientFrame::Attach { token }).await;
        match client.recv().await {
            ServerFrame::Attached { user_id: confirmed } => assert_eq!(confirmed, user_id),
            other => panic!("expected Attached, got {other:?}"),
        }
        client
    }

    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, write_half) = stream.into_split();
        Self { reader: BufReader::new(read_half), writer: write_half }
    }

    pub async fn send(&mut self, frame: &ClientFrame) {
        frame::write_frame(&mut self.writer, frame).await.unwrap();
    }

    /// Receive the next frame, panicking after a timeout.
    pub async fn recv(&mut self) -> ServerFrame {
        tokio::time::timeout(RECV_TIMEOUT, frame::read_frame(&mut self.reader))
            .await
            .expect("timed out waiting for a frame")
            .expect("read failed")
            .expect("connection closed")
    }

    /// Receive, skipping frames the caller does not care about.
    pub async fn recv_matching<F>(&mut self, mut want: F) -> ServerFrame
    where
        F: FnMut(&ServerFrame) -> bool,
    {
        loop {
            let frame = self.recv().await;
            if want(&frame) {
                return frame;
            }
        }
    }

    /// True when the server closed the stream.
    pub async fn closed(&mut self) -> bool {
        matches!(
            tokio::time::timeout(RECV_TIMEOUT, frame::read_frame::<_, ServerFrame>(&mut self.reader))
                .await,
            Ok(Ok(None))
        )
    }
}

/// Poll until `pred` holds or a few seconds pass.
pub async fn wait_until<F>(mut pred: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if pred() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached in time");
}

/// Next SDK client event, with a deadline.
pub async fn next_event(rx: &mut tokio::sync::mpsc::Receiver<chai_sdk::Event>) -> chai_sdk::Event {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event stream closed")
}

/// Skip SDK client events until one matches.
pub async fn wait_for_event<F>(
    rx: &mut tokio::sync::mpsc::Receiver<chai_sdk::Event>,
    mut pred: F,
) -> chai_sdk::Event
where
    F: FnMut(&chai_sdk::Event) -> bool,
{
    loop {
        let event = next_event(rx).await;
        if pred(&event) {
            return event;
        }
    }
}

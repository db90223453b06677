//! Relay configuration, parsed from flags and environment.

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "chai-server",
    about = "Store-and-forward relay and prekey directory for the chai messenger"
)]
pub struct ServerConfig {
    /// TCP frame-transport listen address.
    #[arg(long, env = "CHAI_LISTEN_ADDR", default_value = "127.0.0.1:7420")]
    pub listen_addr: String,

    /// HTTP/WebSocket listen address. The web surface (prekey publish
    /// endpoint, WebSocket transport, health check) is off when unset.
    #[arg(long, env = "CHAI_WEB_ADDR")]
    pub web_addr: Option<String>,

    /// SQLite database path. In-memory when unset.
    #[arg(long, env = "CHAI_DB_PATH")]
    pub db_path: Option<String>,

    /// TLS certificate chain (PEM). TLS is on when cert and key are
    /// both set.
    #[arg(long)]
    pub tls_cert: Option<String>,

    /// TLS private key (PEM).
    #[arg(long)]
    pub tls_key: Option<String>,

    /// Days an undelivered envelope survives before the sweeper
    /// deletes it.
    #[arg(long, default_value_t = 30)]
    pub retention_days: u32,

    /// Unused one-time prekey count below which the owner is told to
    /// replenish.
    #[arg(long, default_value_t = 10)]
    pub low_watermark: u32,

    /// Per-connection outbound signal queue capacity. Overflow closes
    /// the connection with Backpressure.
    #[arg(long, default_value_t = 64)]
    pub outbound_queue: usize,

    /// Treat unknown session tokens as user ids. For tests and local
    /// development only; never enable in production.
    #[arg(long, default_value_t = false)]
    pub insecure_tokens: bool,
}

impl ServerConfig {
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::parse_from(["chai-server"])
    }
}

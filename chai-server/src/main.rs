use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs in production (CHAI_LOG_JSON=1), human-readable otherwise.
    let json_logs = std::env::var("CHAI_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("chai_server=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = chai_server::config::ServerConfig::parse();
    tracing::info!("starting relay on {}", config.listen_addr);
    if config.tls_enabled() {
        tracing::info!("TLS enabled");
    }
    if let Some(ref web_addr) = config.web_addr {
        tracing::info!("HTTP/WebSocket enabled on {web_addr}");
    }
    if config.insecure_tokens {
        tracing::warn!("insecure token mode: tokens are treated as user ids");
    }

    let server = chai_server::server::Server::new(config);
    // An unrecoverable storage or bind failure propagates here and the
    // process exits non-zero.
    server.run().await
}

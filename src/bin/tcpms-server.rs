//! Demo `tcpms-server` binary: a thin CLI front-end over [`tcpms::Server`].

use clap::Parser;
use std::sync::Arc;
use tcpms::{NoopServerEvents, Server, ServerSettings};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "tcpms-server", version, about = "TcpMs demo server")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:7420")]
    listen_addr: String,

    /// Shared password. Omit to run with encryption disabled.
    #[arg(long)]
    password: Option<String>,

    #[arg(long, default_value_t = 15)]
    max_clients: usize,

    #[arg(long, default_value_t = 10_000)]
    ping_interval_ms: u64,

    #[arg(long, default_value_t = 8_000)]
    ping_timeout_ms: u64,

    #[arg(long, default_value_t = 3)]
    connection_test_tries: u8,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tcpms=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    let mut settings = ServerSettings::new(1)
        .with_max_clients(args.max_clients)
        .with_ping_interval_ms(args.ping_interval_ms)
        .with_ping_timeout_ms(args.ping_timeout_ms)
        .with_connection_test_tries(args.connection_test_tries);

    settings = match args.password {
        Some(password) => settings.with_password(password),
        None => settings.with_encryption_enabled(false),
    };

    if let Err(err) = settings.validate() {
        error!(%err, "invalid settings");
        return;
    }

    info!(addr = %args.listen_addr, max_clients = args.max_clients, "starting tcpms-server");

    let server = Server::new(settings, Arc::new(NoopServerEvents));
    let cancel = CancellationToken::new();

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutting down");
        shutdown.cancel();
    });

    if let Err(err) = server.serve(&args.listen_addr, cancel).await {
        error!(%err, "server exited with error");
    }
}

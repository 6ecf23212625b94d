//! Demo `tcpms-client` binary: connects, sends one greeting, then waits for
//! Ctrl-C to disconnect cleanly.

use clap::Parser;
use std::sync::Arc;
use tcpms::events::ClientEvents;
use tcpms::{ClientConfig, ClientEndpoint};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "tcpms-client", version, about = "TcpMs demo client")]
struct Args {
    /// Address of the server to connect to.
    #[arg(long, default_value = "127.0.0.1:7420")]
    server_addr: String,

    /// Shared password. Must match the server's, or be omitted if the
    /// server runs with encryption disabled.
    #[arg(long)]
    password: Option<String>,

    /// Greeting string to send once joined.
    #[arg(long, default_value = "hello from tcpms-client")]
    message: String,
}

struct LoggingEvents;

impl ClientEvents for LoggingEvents {
    fn on_connected(&self) {
        info!("connected");
    }

    fn on_disconnected(&self) {
        info!("disconnected");
    }

    fn on_panic(&self) {
        info!("recovered from a panic");
    }

    fn on_blob_received(&self, data: &[u8]) {
        info!(len = data.len(), "blob received");
    }

    fn on_string_received(&self, text: &str) {
        info!(%text, "string received");
    }
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

    let mut config = ClientConfig::new(args.server_addr.clone());
    if let Some(password) = args.password {
        config = config.with_password(password);
    }

    let events: Arc<dyn ClientEvents> = Arc::new(LoggingEvents);
    let client = match ClientEndpoint::connect(config, events).await {
        Ok(client) => client,
        Err(err) => {
            error!(%err, "failed to connect");
            return;
        }
    };

    if let Err(err) = client.send_string(&args.message) {
        error!(%err, "failed to send greeting");
    }

    info!("press ctrl-c to disconnect");
    tokio::signal::ctrl_c().await.ok();
    client.disconnect().await;
}

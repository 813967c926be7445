// listener: runs a bare event-bus node from environment configuration.
//
// A bare node accepts, classifies and forwards events with the default
// behavior; services embed the `listener` library and install their own.

use std::sync::Arc;

use listener::{DefaultBehavior, EventListener, ListenerOptions};
use tracing::info;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let options = ListenerOptions::from_env();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        name = %options.name,
        address = %options.address,
        port = options.port,
        "listener starting"
    );

    let node = Arc::new(EventListener::new(options, Arc::new(DefaultBehavior)));
    if let Err(err) = node.start().await {
        eprintln!("FATAL: {err}");
        std::process::exit(1);
    }
}

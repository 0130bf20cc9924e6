// Nebula signaling relay
// Registers peers by identity and relays call and data-connection frames between them
//
// Usage: cargo run --bin signaling-server [bind-addr]

use tokio::net::TcpListener;

const DEFAULT_ADDR: &str = "0.0.0.0:8080";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let addr = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_ADDR.to_string());
    let listener = TcpListener::bind(&addr).await?;

    nebula_signal::network::relay::serve(listener).await
}

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use lumen_agent::Agent;
use lumen_store::Store;

#[derive(Parser, Debug)]
#[command(name = "lumen-agentd", about = "payment-channel agent daemon")]
struct Cli {
    /// Database file for all agent state.
    #[arg(long, env = "LUMEN_DB", default_value = "lumen-agent.redb")]
    db: PathBuf,

    /// Listen address for the peer RPC surface.
    #[arg(long, env = "LUMEN_LISTEN", default_value = "127.0.0.1:7167")]
    listen: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lumen_agent=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let store = Store::open(&cli.db)?;
    let agent = Agent::start(store)?;

    if !agent.configured() {
        tracing::info!("agent not configured yet; waiting for config-init");
    }

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    tracing::info!("peer RPC listening on {}", cli.listen);

    let router = agent.peer_router();
    tokio::select! {
        r = axum::serve(listener, router) => r?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
        }
    }
    agent.close_wait().await;
    Ok(())
}

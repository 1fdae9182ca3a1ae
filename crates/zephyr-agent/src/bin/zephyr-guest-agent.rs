//! In-guest agent.
//!
//! Started by the guest's init supervisor once the network is up. Listens
//! on the agent port and executes host requests until told to shut down,
//! then powers the machine off.

use std::net::{Ipv4Addr, SocketAddr};
use tokio::net::TcpListener;
use tracing::info;
use zephyr_agent::server::AgentServer;
use zephyr_agent::AGENT_PORT;

const DEFAULT_WORKSPACE: &str = "/workspace";

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let port = std::env::var("ZEPHYR_AGENT_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(AGENT_PORT);
    let workspace =
        std::env::var("ZEPHYR_WORKSPACE").unwrap_or_else(|_| DEFAULT_WORKSPACE.to_string());

    tokio::fs::create_dir_all(&workspace).await?;

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, workspace = %workspace, "guest agent listening");

    let server = AgentServer::new(workspace);
    server.serve(listener).await?;

    // Shutdown was acknowledged over the wire; now halt the guest.
    let _ = tokio::process::Command::new("poweroff").status().await;
    Ok(())
}

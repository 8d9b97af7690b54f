use std::sync::Arc;

use anyhow::Result;
use kube::Client;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::init as tracing_init;

mod attachment_controller;
mod node_network;
mod options;

use attachment_controller::AttachmentController;
use nodenet_core::bridge::{Bridge, BRIDGE_NAME};
use nodenet_core::link::netlink::NetlinkHandle;
use nodenet_core::link::LinkOps;
use options::AgentOptions;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_init();

    info!("Starting nodenet-agent...");

    let options = AgentOptions::from_env()?;
    let client = Client::try_default().await?;

    let ops: Arc<dyn LinkOps> = Arc::new(NetlinkHandle::new()?);
    let mgmt = node_network::resolve_mgmt_network(&client, &options, ops.clone()).await?;

    let mut bridge = Bridge::new(BRIDGE_NAME, ops.clone());
    if let Err(e) = mgmt.setup(&mut bridge).await {
        if e.is_not_ready() {
            warn!(error = %e, "management network not ready at startup, reconciles will skip until it is");
        } else {
            return Err(e.into());
        }
    }

    let controller = AttachmentController::new(client.clone(), mgmt, ops);
    tokio::spawn(async move {
        if let Err(e) = controller.run().await {
            error!("NetworkAttachment controller error: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting...");

    Ok(())
}

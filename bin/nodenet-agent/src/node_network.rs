//! Resolution of this node's management network from its NodeNetwork record.

use std::sync::Arc;

use anyhow::Context;
use kube::api::{Api, ListParams};
use kube::Client;
use tracing::info;

use nodenet_api::{MgmtNetworkType, NodeNetwork};
use nodenet_core::link::LinkOps;
use nodenet_core::mgmt::{CiliumNetwork, FlannelNetwork, MgmtNetwork};

use crate::options::AgentOptions;

/// Look up the NodeNetwork record for this node and build the management
/// network backend it declares; the env-provided options are the fallback
/// for nodes without a record.
pub async fn resolve_mgmt_network(
    client: &Client,
    options: &AgentOptions,
    ops: Arc<dyn LinkOps>,
) -> anyhow::Result<MgmtNetwork> {
    let api: Api<NodeNetwork> = Api::all(client.clone());
    let records = api.list(&ListParams::default()).await?;
    let record = records
        .items
        .into_iter()
        .find(|nn| nn.spec.node_name == options.node_name);

    let (network_type, device) = match record {
        Some(nn) => {
            info!(node = %options.node_name, "using NodeNetwork record");
            (nn.spec.network_type, nn.spec.device)
        }
        None => {
            let device = options.mgmt_network_device.clone().context(
                "no NodeNetwork record for this node and MGMT_NETWORK_DEVICE is unset",
            )?;
            (options.mgmt_network_type, device)
        }
    };

    // The single construction-time switch over backend kinds.
    let mgmt = match network_type {
        MgmtNetworkType::Flannel | MgmtNetworkType::Canal => {
            MgmtNetwork::Flannel(FlannelNetwork::new(&device, ops))
        }
        MgmtNetworkType::Cilium => MgmtNetwork::Cilium(CiliumNetwork::new(&device, ops)),
    };
    info!(kind = mgmt.kind(), device = %device, "management network selected");

    Ok(mgmt)
}

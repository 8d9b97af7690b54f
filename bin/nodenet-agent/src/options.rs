use std::env;

use anyhow::Context;
use nodenet_api::MgmtNetworkType;

/// Process options. Everything arrives through the environment; the
/// management network settings are fallbacks for nodes without a
/// NodeNetwork record yet.
#[derive(Clone, Debug)]
pub struct AgentOptions {
    pub node_name: String,
    pub mgmt_network_type: MgmtNetworkType,
    pub mgmt_network_device: Option<String>,
}

impl AgentOptions {
    pub fn from_env() -> anyhow::Result<Self> {
        let node_name = env::var("NODE_NAME").context("NODE_NAME must be set")?;
        let mgmt_network_type = match env::var("MGMT_NETWORK_TYPE") {
            Ok(value) => value.parse().map_err(anyhow::Error::msg)?,
            Err(_) => MgmtNetworkType::default(),
        };
        let mgmt_network_device = env::var("MGMT_NETWORK_DEVICE").ok();

        Ok(Self {
            node_name,
            mgmt_network_type,
            mgmt_network_device,
        })
    }
}

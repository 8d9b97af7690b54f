use std::fmt;
use std::str::FromStr;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// NodeNetwork declares which management network a node uses: the backend
/// kind (plain device for flannel/canal, overlay tunnel for cilium) and the
/// kernel device the uplink is resolved from. One record per node, written
/// by cluster operators; the agent only reads it.
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "network.nodenet.io",
    version = "v1alpha1",
    kind = "NodeNetwork",
    plural = "nodenetworks",
    derive = "Default",
    status = "NodeNetworkStatus",
)]
#[serde(rename_all = "camelCase")]
pub struct NodeNetworkSpec {
    /// Name of the node this record configures
    pub node_name: String,

    /// Management network backend kind
    #[serde(default)]
    pub network_type: MgmtNetworkType,

    /// Kernel device the backend resolves the uplink from. For plain-device
    /// backends this is the uplink itself; for the overlay-tunnel backend it
    /// is the tunnel endpoint device.
    pub device: String,
}

/// Management network backend kinds
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum MgmtNetworkType {
    #[default]
    Flannel,
    Canal,
    Cilium,
}

impl fmt::Display for MgmtNetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MgmtNetworkType::Flannel => write!(f, "flannel"),
            MgmtNetworkType::Canal => write!(f, "canal"),
            MgmtNetworkType::Cilium => write!(f, "cilium"),
        }
    }
}

impl FromStr for MgmtNetworkType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "flannel" => Ok(MgmtNetworkType::Flannel),
            "canal" => Ok(MgmtNetworkType::Canal),
            "cilium" => Ok(MgmtNetworkType::Cilium),
            other => Err(format!("unknown management network type: {}", other)),
        }
    }
}

/// Status of a NodeNetwork
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
pub struct NodeNetworkStatus {
    /// Whether the node's management network has been set up
    #[serde(default)]
    pub ready: bool,

    /// Human-readable detail for the last transition
    #[serde(default)]
    pub message: String,
}

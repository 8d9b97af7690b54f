/// API version v1alpha1 for Nodenet CRDs

pub mod network_attachment;
pub mod node_network;

pub use network_attachment::{NetworkAttachment, NetworkAttachmentSpec};
pub use node_network::{MgmtNetworkType, NodeNetwork, NodeNetworkSpec};

/// API group for Nodenet resources
pub const API_GROUP: &str = "network.nodenet.io";
/// API version for Nodenet resources
pub const API_VERSION: &str = "v1alpha1";

/// Label every attachment record carries: its VLAN id as a decimal string.
/// Used for the reverse lookup that reference-counts a shared VLAN id.
pub const VLAN_ID_LABEL: &str = "network.nodenet.io/vlan-id";

/// Annotation carrying the optional layer-3 network configuration (JSON).
pub const LAYER3_NETWORK_ANNOTATION: &str = "network.nodenet.io/layer3-network";

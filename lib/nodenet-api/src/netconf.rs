//! Payload types parsed out of attachment records.

use serde::{Deserialize, Serialize};

/// CNI-style configuration carried in a NetworkAttachment's `spec.config`.
/// The agent reads only the VLAN id; the remaining fields are kept so the
/// payload round-trips for other consumers.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NetConf {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub r#type: String,

    #[serde(default)]
    pub bridge: String,

    /// 802.1Q VLAN id; 0 means untagged / no VLAN
    #[serde(default)]
    pub vlan: u16,
}

impl NetConf {
    pub fn parse(config: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(config)
    }
}

/// Optional layer-3 metadata for a VLAN's local area. The zero value (all
/// fields empty) means "no layer-3 local area semantics"; downstream code
/// treats an empty `cidr` as "membership bookkeeping only".
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Layer3NetworkConf {
    #[serde(default)]
    pub mode: String,

    #[serde(default)]
    pub cidr: String,

    #[serde(default)]
    pub gateway: String,
}

impl Layer3NetworkConf {
    pub fn parse(value: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(value)
    }
}

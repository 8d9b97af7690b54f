use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::netconf::Layer3NetworkConf;
use crate::v1alpha1::LAYER3_NETWORK_ANNOTATION;

/// NetworkAttachment describes how a workload interface should be connected
/// to a VLAN. The spec carries a CNI-style JSON payload; the agent reads only
/// its VLAN id. Layer-3 metadata, when present, rides in the
/// `network.nodenet.io/layer3-network` annotation.
///
/// Records are created and deleted by users or provisioning tooling; the
/// agent only reacts to them.
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "network.nodenet.io",
    version = "v1alpha1",
    kind = "NetworkAttachment",
    plural = "networkattachments",
    namespaced,
    derive = "Default",
)]
pub struct NetworkAttachmentSpec {
    /// Network configuration payload, a JSON document
    #[serde(default)]
    pub config: String,
}

impl NetworkAttachment {
    /// Layer-3 network configuration parsed from the well-known annotation.
    /// Returns the zero-value conf when the annotation is absent or empty,
    /// so callers always have a well-defined conf to pass down.
    pub fn layer3_conf(&self) -> Result<Layer3NetworkConf, serde_json::Error> {
        match self
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(LAYER3_NETWORK_ANNOTATION))
        {
            Some(value) if !value.is_empty() => Layer3NetworkConf::parse(value),
            _ => Ok(Layer3NetworkConf::default()),
        }
    }
}

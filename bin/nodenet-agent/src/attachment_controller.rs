//! NetworkAttachment controller: watches attachment records and drives the
//! node's VLAN local areas to match.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use kube_runtime::controller::{Action, Controller};
use kube_runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube_runtime::watcher;
use thiserror::Error;
use tracing::{debug, error, info};

use nodenet_api::v1alpha1::VLAN_ID_LABEL;
use nodenet_api::{NetConf, NetworkAttachment};
use nodenet_core::link::LinkOps;
use nodenet_core::mgmt::MgmtNetwork;
use nodenet_core::vlan::get_vlan;
use nodenet_core::NetworkError;

pub const CONTROLLER_NAME: &str = "nodenet-attachment-controller";

const FINALIZER_NAME: &str = "network.nodenet.io/attachment";

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("invalid config on attachment {name}: {source}")]
    InvalidConfig {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid layer-3 annotation on attachment {name}: {source}")]
    InvalidLayer3Conf {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("listing attachments: {0}")]
    List(#[source] kube::Error),

    #[error("finalizer: {0}")]
    Finalizer(#[source] Box<kube_runtime::finalizer::Error<ReconcileError>>),
}

/// Live-record index: how many attachment records currently carry a given
/// VLAN id label. The count is re-derived from the record set on every call
/// rather than kept as a running counter, so process restarts and
/// concurrent record churn cannot skew it.
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    async fn count_by_vlan(&self, vlan_id: u16) -> Result<usize, ReconcileError>;
}

pub struct KubeAttachmentStore {
    client: Client,
}

#[async_trait]
impl AttachmentStore for KubeAttachmentStore {
    async fn count_by_vlan(&self, vlan_id: u16) -> Result<usize, ReconcileError> {
        let api: Api<NetworkAttachment> = Api::all(self.client.clone());
        let params = ListParams::default().labels(&format!("{}={}", VLAN_ID_LABEL, vlan_id));
        let list = api.list(&params).await.map_err(ReconcileError::List)?;
        Ok(list.items.len())
    }
}

/// Reconcile handler for attachment records. Change events add the record's
/// VLAN local area; remove events tear it down only when no other live
/// record references the same VLAN id.
pub struct Handler<S> {
    mgmt: MgmtNetwork,
    ops: Arc<dyn LinkOps>,
    store: S,
}

impl<S: AttachmentStore> Handler<S> {
    pub fn new(mgmt: MgmtNetwork, ops: Arc<dyn LinkOps>, store: S) -> Self {
        Self { mgmt, ops, store }
    }

    pub async fn on_change(&self, nad: &NetworkAttachment) -> Result<(), ReconcileError> {
        if nad.metadata.deletion_timestamp.is_some() {
            return Ok(());
        }
        if nad.spec.config.is_empty() {
            return Ok(());
        }

        let name = nad.name_any();
        info!(attachment = %name, config = %nad.spec.config, "attachment configuration changed");

        let netconf = NetConf::parse(&nad.spec.config).map_err(|source| {
            ReconcileError::InvalidConfig {
                name: name.clone(),
                source,
            }
        })?;

        let mut vlan = match get_vlan(&self.mgmt, self.ops.clone()).await {
            Ok(vlan) => vlan,
            Err(e) if e.is_not_ready() => {
                info!(attachment = %name, reason = %e, "management network not ready, skipping");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let layer3 = nad.layer3_conf().map_err(|source| {
            ReconcileError::InvalidLayer3Conf {
                name: name.clone(),
                source,
            }
        })?;

        vlan.add_local_area(netconf.vlan, &layer3.cidr).await?;
        Ok(())
    }

    pub async fn on_remove(&self, nad: &NetworkAttachment) -> Result<(), ReconcileError> {
        if nad.spec.config.is_empty() {
            return Ok(());
        }

        let name = nad.name_any();
        info!(attachment = %name, "attachment deleted");

        let netconf = NetConf::parse(&nad.spec.config).map_err(|source| {
            ReconcileError::InvalidConfig {
                name: name.clone(),
                source,
            }
        })?;

        // Several records may share one VLAN id; the record being removed is
        // usually still visible in the index, so anything above one means
        // the local area stays.
        let remaining = self.store.count_by_vlan(netconf.vlan).await?;
        if remaining > 1 {
            info!(
                attachment = %name,
                vlan = netconf.vlan,
                remaining,
                "VLAN id still referenced, leaving local area in place"
            );
            return Ok(());
        }

        let mut vlan = match get_vlan(&self.mgmt, self.ops.clone()).await {
            Ok(vlan) => vlan,
            Err(e) if e.is_not_ready() => {
                info!(attachment = %name, reason = %e, "management network not ready, nothing to tear down");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let layer3 = nad.layer3_conf().map_err(|source| {
            ReconcileError::InvalidLayer3Conf {
                name: name.clone(),
                source,
            }
        })?;

        vlan.remove_local_area(netconf.vlan, &layer3.cidr).await?;
        Ok(())
    }
}

struct Ctx {
    client: Client,
    handler: Arc<Handler<KubeAttachmentStore>>,
}

pub struct AttachmentController {
    client: Client,
    handler: Arc<Handler<KubeAttachmentStore>>,
}

impl AttachmentController {
    pub fn new(client: Client, mgmt: MgmtNetwork, ops: Arc<dyn LinkOps>) -> Self {
        let store = KubeAttachmentStore {
            client: client.clone(),
        };
        Self {
            client,
            handler: Arc::new(Handler::new(mgmt, ops, store)),
        }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        info!(controller = CONTROLLER_NAME, "Starting NetworkAttachment reconciliation");

        let attachments: Api<NetworkAttachment> = Api::all(self.client.clone());
        let ctx = Arc::new(Ctx {
            client: self.client.clone(),
            handler: self.handler.clone(),
        });

        let mut stream = Controller::new(attachments, watcher::Config::default())
            .run(reconcile, error_policy, ctx)
            .boxed();

        while let Some(item) = stream.next().await {
            match item {
                Ok(_) => debug!("Reconciled NetworkAttachment successfully"),
                Err(e) => error!("Error in reconciliation stream: {}", e),
            }
        }

        Ok(())
    }
}

async fn reconcile(
    nad: Arc<NetworkAttachment>,
    ctx: Arc<Ctx>,
) -> Result<Action, ReconcileError> {
    let namespace = nad.namespace().unwrap_or_default();
    let api: Api<NetworkAttachment> = Api::namespaced(ctx.client.clone(), &namespace);
    let handler = ctx.handler.clone();

    finalizer(&api, FINALIZER_NAME, nad, |event| async move {
        match event {
            FinalizerEvent::Apply(nad) => handler.on_change(&nad).await?,
            FinalizerEvent::Cleanup(nad) => handler.on_remove(&nad).await?,
        }
        Ok(Action::requeue(Duration::from_secs(300)))
    })
    .await
    .map_err(|e| ReconcileError::Finalizer(Box::new(e)))
}

fn error_policy(nad: Arc<NetworkAttachment>, err: &ReconcileError, _ctx: Arc<Ctx>) -> Action {
    error!(attachment = %nad.name_any(), error = %err, "reconcile failed, requeueing");
    Action::requeue(Duration::from_secs(60))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use nodenet_api::v1alpha1::{NetworkAttachmentSpec, LAYER3_NETWORK_ANNOTATION};
    use nodenet_core::bridge::{Bridge, BRIDGE_NAME};
    use nodenet_core::link::memory::MemoryLinks;
    use nodenet_core::mgmt::FlannelNetwork;

    struct FixedStore(Arc<AtomicUsize>);

    #[async_trait]
    impl AttachmentStore for FixedStore {
        async fn count_by_vlan(&self, _vlan_id: u16) -> Result<usize, ReconcileError> {
            Ok(self.0.load(Ordering::SeqCst))
        }
    }

    fn attachment(name: &str, vlan: u16, cidr: Option<&str>) -> NetworkAttachment {
        let mut nad = NetworkAttachment::new(
            name,
            NetworkAttachmentSpec {
                config: format!(
                    r#"{{"name":"{}","type":"bridge","bridge":"{}","vlan":{}}}"#,
                    name, BRIDGE_NAME, vlan
                ),
            },
        );
        nad.metadata.namespace = Some("default".to_string());
        let mut labels = BTreeMap::new();
        labels.insert(VLAN_ID_LABEL.to_string(), vlan.to_string());
        nad.metadata.labels = Some(labels);
        if let Some(cidr) = cidr {
            let mut annotations = BTreeMap::new();
            annotations.insert(
                LAYER3_NETWORK_ANNOTATION.to_string(),
                format!(r#"{{"mode":"auto","cidr":"{}"}}"#, cidr),
            );
            nad.metadata.annotations = Some(annotations);
        }
        nad
    }

    /// Node with a ready management network: eth0 enslaved to the trunk
    /// bridge, addresses mirrored.
    async fn ready_harness(
        count: usize,
    ) -> (Arc<MemoryLinks>, Arc<AtomicUsize>, Handler<FixedStore>) {
        let links = Arc::new(MemoryLinks::new());
        links.add_device("eth0", &["192.168.1.10/24"]);
        let ops: Arc<dyn LinkOps> = links.clone();
        let mgmt = MgmtNetwork::Flannel(FlannelNetwork::new("eth0", ops.clone()));
        let mut bridge = Bridge::new(BRIDGE_NAME, ops.clone());
        mgmt.setup(&mut bridge).await.unwrap();

        let counter = Arc::new(AtomicUsize::new(count));
        let handler = Handler::new(mgmt, ops, FixedStore(counter.clone()));
        (links, counter, handler)
    }

    #[tokio::test]
    async fn empty_config_is_a_no_op() {
        let (links, _, handler) = ready_harness(1).await;
        let mutations = links.mutation_count();

        let nad = NetworkAttachment::new("empty", NetworkAttachmentSpec::default());
        handler.on_change(&nad).await.unwrap();
        handler.on_remove(&nad).await.unwrap();
        assert_eq!(links.mutation_count(), mutations);
    }

    #[tokio::test]
    async fn record_marked_for_deletion_is_ignored() {
        let (links, _, handler) = ready_harness(1).await;
        let mutations = links.mutation_count();

        let mut nad = attachment("doomed", 100, None);
        nad.metadata.deletion_timestamp = Some(
            k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                k8s_openapi::chrono::Utc::now(),
            ),
        );
        handler.on_change(&nad).await.unwrap();
        assert_eq!(links.mutation_count(), mutations);
    }

    #[tokio::test]
    async fn malformed_config_is_rejected_without_mutation() {
        let (links, _, handler) = ready_harness(1).await;
        let mutations = links.mutation_count();

        let nad = NetworkAttachment::new(
            "broken",
            NetworkAttachmentSpec {
                config: "not json".to_string(),
            },
        );
        let err = handler.on_change(&nad).await.unwrap_err();
        assert!(matches!(err, ReconcileError::InvalidConfig { .. }));
        assert_eq!(links.mutation_count(), mutations);
    }

    #[tokio::test]
    async fn malformed_layer3_annotation_is_rejected() {
        let (_, _, handler) = ready_harness(1).await;

        let mut nad = attachment("bad-annotation", 100, None);
        let mut annotations = BTreeMap::new();
        annotations.insert(LAYER3_NETWORK_ANNOTATION.to_string(), "garbage".to_string());
        nad.metadata.annotations = Some(annotations);

        let err = handler.on_change(&nad).await.unwrap_err();
        assert!(matches!(err, ReconcileError::InvalidLayer3Conf { .. }));
    }

    #[tokio::test]
    async fn skips_when_uplink_is_missing() {
        let links = Arc::new(MemoryLinks::new());
        let ops: Arc<dyn LinkOps> = links.clone();
        let mgmt = MgmtNetwork::Flannel(FlannelNetwork::new("eth0", ops.clone()));
        let handler = Handler::new(mgmt, ops, FixedStore(Arc::new(AtomicUsize::new(1))));

        handler.on_change(&attachment("vm-net", 100, None)).await.unwrap();
        handler.on_remove(&attachment("vm-net", 100, None)).await.unwrap();
        assert_eq!(links.mutation_count(), 0);
    }

    #[tokio::test]
    async fn skips_when_uplink_is_not_enslaved() {
        let links = Arc::new(MemoryLinks::new());
        links.add_device("eth0", &["192.168.1.10/24"]);
        let ops: Arc<dyn LinkOps> = links.clone();
        let mgmt = MgmtNetwork::Flannel(FlannelNetwork::new("eth0", ops.clone()));
        let handler = Handler::new(mgmt, ops, FixedStore(Arc::new(AtomicUsize::new(1))));

        handler.on_change(&attachment("vm-net", 100, None)).await.unwrap();
        assert_eq!(links.mutation_count(), 0);
    }

    #[tokio::test]
    async fn untagged_attachment_round_trip() {
        let (links, _, handler) = ready_harness(1).await;
        let uplink = links.link("eth0").unwrap();

        handler.on_change(&attachment("vlan100", 100, None)).await.unwrap();

        let bridge = links.link(BRIDGE_NAME).unwrap();
        assert!(bridge.up);
        assert!(bridge.promisc);
        assert_eq!(bridge.vlan_filtering, Some(true));
        assert_eq!(links.vlans_of(uplink.index), vec![100]);
        assert!(links.routes_of(bridge.index).is_empty());

        // sole record for the VLAN id, so removal tears the local area down
        handler.on_remove(&attachment("vlan100", 100, None)).await.unwrap();
        assert!(links.vlans_of(uplink.index).is_empty());
    }

    #[tokio::test]
    async fn shared_vlan_id_is_reference_counted() {
        let (links, counter, handler) = ready_harness(2).await;
        let uplink = links.link("eth0").unwrap();
        let bridge_index = links.link(BRIDGE_NAME).unwrap().index;

        let a = attachment("vm-a", 200, Some("10.0.0.0/24"));
        let b = attachment("vm-b", 200, Some("10.0.0.0/24"));
        handler.on_change(&a).await.unwrap();
        handler.on_change(&b).await.unwrap();
        assert_eq!(links.vlans_of(uplink.index), vec![200]);
        assert_eq!(links.routes_of(bridge_index).len(), 1);

        // both records still indexed while A is being removed
        let mutations = links.mutation_count();
        handler.on_remove(&a).await.unwrap();
        assert_eq!(links.mutation_count(), mutations);
        assert_eq!(links.vlans_of(uplink.index), vec![200]);
        assert_eq!(links.routes_of(bridge_index).len(), 1);

        // B is the last record for VLAN 200
        counter.store(1, Ordering::SeqCst);
        handler.on_remove(&b).await.unwrap();
        assert!(links.vlans_of(uplink.index).is_empty());
        assert!(links.routes_of(bridge_index).is_empty());
    }
}

use thiserror::Error;

pub type Result<T> = std::result::Result<T, NetworkError>;

/// Error kinds for kernel networking operations. Callers branch on the kind,
/// never on an underlying library's error shapes.
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("link {0} not found")]
    LinkNotFound(String),

    #[error("link {0} is not enslaved to any bridge")]
    SlaveNotFound(String),

    #[error("link {name} exists but is not a {expected}")]
    UnexpectedKind { name: String, expected: &'static str },

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("{op} {object} failed: {source}")]
    Netlink {
        op: &'static str,
        object: String,
        #[source]
        source: rtnetlink::Error,
    },

    #[error("sysctl {path} failed: {source}")]
    Sysctl {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid VLAN id {0}, must be 0 or 1-4094")]
    InvalidVlanId(u16),

    #[error("invalid CIDR {cidr}: {source}")]
    InvalidCidr {
        cidr: String,
        #[source]
        source: ipnetwork::IpNetworkError,
    },
}

impl NetworkError {
    /// True for the two conditions that mean "the node's management network
    /// is not provisioned yet": the uplink link is missing, or it is not
    /// enslaved to a bridge. Reconcilers skip on these instead of failing.
    pub fn is_not_ready(&self) -> bool {
        matches!(
            self,
            NetworkError::LinkNotFound(_) | NetworkError::SlaveNotFound(_)
        )
    }
}

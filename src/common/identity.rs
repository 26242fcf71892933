//! Node identity and cluster membership view

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};

/// Immutable description of one registry process.
///
/// Two identities are equal when host and port match; eligibility is
/// carried along but never participates in comparisons.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub host: String,
    pub port: u16,
    pub master_eligible: bool,
}

impl NodeIdentity {
    pub fn new(host: impl Into<String>, port: u16, master_eligible: bool) -> Self {
        Self {
            host: host.into(),
            port,
            master_eligible,
        }
    }

    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Encoding stored under the leader and membership keys
    pub fn encode(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(data: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(data)?)
    }
}

impl PartialEq for NodeIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl Eq for NodeIdentity {}

impl Hash for NodeIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl Ord for NodeIdentity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.host
            .cmp(&other.host)
            .then_with(|| self.port.cmp(&other.port))
    }
}

impl PartialOrd for NodeIdentity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Live members as last reported by the coordination service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClusterView {
    members: BTreeSet<NodeIdentity>,
}

impl ClusterView {
    pub fn new(members: impl IntoIterator<Item = NodeIdentity>) -> Self {
        Self {
            members: members.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeIdentity> {
        self.members.iter()
    }

    /// Members that could take over as master
    pub fn eligible(&self) -> impl Iterator<Item = &NodeIdentity> {
        self.members.iter().filter(|m| m.master_eligible)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_ignores_eligibility() {
        let a = NodeIdentity::new("localhost", 8081, true);
        let b = NodeIdentity::new("localhost", 8081, false);
        let c = NodeIdentity::new("localhost", 8082, true);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a < c);
    }

    #[test]
    fn test_encode_decode_identity() {
        let id = NodeIdentity::new("reg-1.internal", 8081, false);
        let encoded = id.encode().unwrap();
        assert!(encoded.contains("reg-1.internal"));

        let decoded = NodeIdentity::decode(&encoded).unwrap();
        assert_eq!(decoded, id);
        assert!(!decoded.master_eligible);
        assert!(NodeIdentity::decode("localhost:8081").is_err());
    }

    #[test]
    fn test_cluster_view() {
        let view = ClusterView::new(vec![
            NodeIdentity::new("b", 1, false),
            NodeIdentity::new("a", 1, true),
            NodeIdentity::new("a", 1, true),
        ]);
        assert_eq!(view.len(), 2);
        assert_eq!(view.eligible().count(), 1);
        assert_eq!(view.iter().next().unwrap().host, "a");
    }
}

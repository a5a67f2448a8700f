//! Cluster topology

use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Cluster membership descriptor
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClusterTopology {
    /// Identifier of the cluster this topology belongs to
    pub topology_id: String,
    /// Tag of the node that issued it
    pub leader: Option<String>,
    /// Node tag -> url
    pub members: BTreeMap<String, String>,
    /// Tags of voting members
    pub voters: Vec<String>,
}

impl ClusterTopology {
    /// Topology with a single member
    pub fn new(topology_id: impl Into<String>, tag: impl Into<String>, url: impl Into<String>) -> Self {
        let tag = tag.into();
        let mut members = BTreeMap::new();
        members.insert(tag.clone(), url.into());
        Self {
            topology_id: topology_id.into(),
            leader: Some(tag.clone()),
            members,
            voters: vec![tag],
        }
    }

    /// Add a voting member
    pub fn with_member(mut self, tag: impl Into<String>, url: impl Into<String>) -> Self {
        let tag = tag.into();
        self.members.insert(tag.clone(), url.into());
        self.voters.push(tag);
        self
    }

    /// Whether `url` belongs to a member
    pub fn contains_url(&self, url: &str) -> bool {
        self.members.values().any(|u| u == url)
    }

    /// JSON encoding carried by topology log entries
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a topology log entry payload
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topology_members() {
        let topology = ClusterTopology::new("cluster-1", "A", "tcp://a:15480")
            .with_member("B", "tcp://b:15480");
        assert_eq!(topology.leader.as_deref(), Some("A"));
        assert_eq!(topology.voters, vec!["A", "B"]);
        assert!(topology.contains_url("tcp://b:15480"));
        assert!(!topology.contains_url("tcp://c:15480"));

        let decoded = ClusterTopology::from_json(&topology.to_json().unwrap()).unwrap();
        assert_eq!(decoded, topology);
        assert!(ClusterTopology::from_json(b"not json").is_err());
    }
}

use serde::{Deserialize, Serialize};
use std::fmt;

/// Integer identity of a runtime node as recorded in the `owner_id` column.
///
/// [`NodeId::ANY`] (`0`) marks an envelope as unowned: any node may claim it.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct NodeId(i32);

impl NodeId {
    /// The "any node" owner.
    pub const ANY: NodeId = NodeId(0);

    pub fn new(id: i32) -> Self {
        Self(id)
    }

    pub fn value(&self) -> i32 {
        self.0
    }

    pub fn is_any(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of the current process, passed explicitly to every store and agent.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub id: NodeId,
    /// Control address other nodes may use to reach this one.
    pub uri: String,
    /// Relative share of distributed agents this node should run. Zero drains it.
    pub weight: i32,
}

impl NodeIdentity {
    pub fn new(id: NodeId, uri: impl Into<String>) -> Self {
        Self {
            id,
            uri: uri.into(),
            weight: 1,
        }
    }

    pub fn with_weight(mut self, weight: i32) -> Self {
        self.weight = weight;
        self
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.uri)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_node_is_zero() {
        assert!(NodeId::ANY.is_any());
        assert_eq!(NodeId::ANY.value(), 0);
        assert!(!NodeId::new(7).is_any());
    }

    #[test]
    fn identity_display() {
        let node = NodeIdentity::new(NodeId::new(3), "tcp://10.0.0.1:5000");
        assert_eq!(node.to_string(), "3@tcp://10.0.0.1:5000");
        assert_eq!(node.weight, 1);
    }
}

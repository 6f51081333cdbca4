//! [`Node`], [`Edge`], [`NodeEdge`], and [`Meta`] — the graph vertices,
//! relations, and store-wide metadata singleton.

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use crate::ids::{EdgeID, NodeID};
use crate::point::Points;

/// 16-byte MD5 digest cached on an [`Edge`].
pub type Hash = [u8; 16];

/// A graph vertex. `Type` is persisted out of band from `Points`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeID,
    #[serde(rename = "type")]
    pub typ: String,
    pub points: Points,
}

impl Node {
    pub fn new(typ: impl Into<String>) -> Self {
        Self {
            id: NodeID::new(),
            typ: typ.into(),
            points: Points::new(),
        }
    }
}

/// A directed `up -> down` relation. `up == None` marks the root's sole
/// incoming edge, expressed as `Option<NodeID>` rather than an empty-string
/// sentinel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeID,
    pub up: Option<NodeID>,
    pub down: NodeID,
    pub points: Points,
    #[serde(with = "hash_hex")]
    pub hash: Hash,
}

impl Edge {
    pub fn new(up: Option<NodeID>, down: NodeID) -> Self {
        Self {
            id: EdgeID::new(),
            up,
            down,
            points: Points::new(),
            hash: [0u8; 16],
        }
    }

    /// True when this edge's `tombstone` point value is non-zero.
    pub fn is_tombstone(&self) -> bool {
        self.points
            .value(crate::point::types::TOMBSTONE, "0")
            .map(crate::point::float_to_bool)
            .unwrap_or(false)
    }
}

/// Join projection of a [`Node`] with the specific incoming [`Edge`] it was
/// reached by, used whenever a caller needs both the node and the relation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeEdge {
    pub id: NodeID,
    #[serde(rename = "type")]
    pub typ: String,
    pub points: Points,
    pub edge_points: Points,
    pub parent: Option<NodeID>,
    #[serde(with = "hash_hex")]
    pub hash: Hash,
}

impl Node {
    pub fn to_node_edge(&self, edge: &Edge) -> NodeEdge {
        NodeEdge {
            id: self.id,
            typ: self.typ.clone(),
            points: self.points.clone(),
            edge_points: edge.points.clone(),
            parent: edge.up,
            hash: edge.hash,
        }
    }
}

impl NodeEdge {
    pub fn is_tombstone(&self) -> bool {
        self.edge_points
            .value(crate::point::types::TOMBSTONE, "0")
            .map(crate::point::float_to_bool)
            .unwrap_or(false)
    }
}

/// Singleton store metadata.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    pub version: u32,
    pub root_id: Option<NodeID>,
}

/// Computes `MD5(upEdge.Points[*].Time ++ node.Points[*].Time ++ sorted
/// child-edge hashes)`.
///
/// `child_hashes` must already be sorted by the owning edge's ID — callers
/// (the store) are responsible for that ordering since only they know edge
/// identity; this function just concatenates what it's given.
pub fn edge_hash(up_points: &Points, node_points: &Points, child_hashes: &[Hash]) -> Hash {
    let mut hasher = Md5::new();
    for p in up_points.iter() {
        hasher.update(p.time.timestamp_nanos_opt().unwrap_or(0).to_le_bytes());
    }
    for p in node_points.iter() {
        hasher.update(p.time.timestamp_nanos_opt().unwrap_or(0).to_le_bytes());
    }
    for h in child_hashes {
        hasher.update(h);
    }
    hasher.finalize().into()
}

mod hash_hex {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(hash: &super::Hash, s: S) -> Result<S::Ok, S::Error> {
        hex::encode(hash).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<super::Hash, D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 16-byte hash"))
    }
}

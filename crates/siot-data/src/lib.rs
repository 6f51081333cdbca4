//! Data model for the siot graph runtime: typed [`Point`]s attached to
//! [`Node`]s and [`Edge`]s, plus the typed node/edge codec used by device
//! clients and the manager to move between the graph and Rust structs.

pub mod codec;
pub mod error;
pub mod ids;
pub mod node;
pub mod point;

pub use codec::NodeConfig;
pub use error::{DecodeError, StoreError};
pub use ids::{EdgeID, NodeID};
pub use node::{edge_hash, Edge, Hash, Meta, Node, NodeEdge};
pub use point::{Point, Points};

//! Error kinds shared across the workspace.
//!
//! A typed enum rather than a flat `anyhow::Error`, so callers can
//! distinguish `NotFound` from, say, a `Fatal` storage failure without
//! downcasting. No `TransactionConflict` variant: every write to the store
//! serializes behind `siot_store::Inner::write_lock`, so two writers never
//! race on the same transaction and there is no conflict for a caller to
//! retry.

use thiserror::Error;

use crate::ids::{EdgeID, NodeID};

/// Errors the graph store and bus bridge surface to callers.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("node {0} not found")]
    NodeNotFound(NodeID),
    #[error("edge {0} not found")]
    EdgeNotFound(EdgeID),
    #[error("node {0} has no edge from parent {1}")]
    NodeEdgeNotFound(NodeID, NodeID),
    #[error("node {0} has no root edge (up == None)")]
    RootEdgeNotFound(NodeID),
    #[error("a root node already exists; NodePoints for an unknown node must include addParent")]
    MissingAddParent,
    #[error("hash propagation exceeded recursion depth {0}")]
    RecursionLimitExceeded(u32),
    #[error("storage backend failure: {0}")]
    Fatal(String),
    #[error("(de)serialization failure: {0}")]
    Codec(String),
}

/// Failure to project a [`crate::NodeEdge`] into a typed client config, or
/// vice versa. Logged by the manager and treated as "skip this child until
/// the next scan".
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("missing required point {0:?}")]
    MissingPoint(&'static str),
    #[error("point {0:?} has the wrong shape for its field")]
    WrongShape(&'static str),
}

//! The graph store: transactional persistence of nodes, edges, and points,
//! with Merkle-style hash propagation on every mutation.

mod codec;
mod dump;
mod mutate;
mod query;
mod user;

use std::path::Path;
use std::sync::Arc;

use siot_data::StoreError;
use sled::Db;
use tokio::sync::Mutex;

pub use dump::{DumpDoc, ImportDoc};
pub use user::User;

/// The graph store. Cheap to clone; internally `Arc`-backed.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Inner>,
}

struct Inner {
    #[allow(dead_code)]
    db: Db,
    nodes: sled::Tree,
    edges: sled::Tree,
    meta: sled::Tree,
    /// Secondary index: `type\0id -> ()`, maintained alongside `nodes` so
    /// type-filtered queries don't have to decode the whole tree.
    nodes_by_type: sled::Tree,
    /// Serializes all writes behind a single writer lock.
    write_lock: Mutex<()>,
}

pub(crate) const META_KEY: &[u8] = b"meta";

impl Store {
    /// Opens (or creates) a store at `path` on disk.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Opens a throwaway in-memory store, for tests.
    pub fn temporary() -> anyhow::Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> anyhow::Result<Self> {
        let nodes = db.open_tree("nodes")?;
        let edges = db.open_tree("edges")?;
        let meta = db.open_tree("meta")?;
        let nodes_by_type = db.open_tree("nodes_by_type")?;
        Ok(Self {
            inner: Arc::new(Inner {
                db,
                nodes,
                edges,
                meta,
                nodes_by_type,
                write_lock: Mutex::new(()),
            }),
        })
    }
}

fn fatal(e: impl std::fmt::Display) -> StoreError {
    StoreError::Fatal(e.to_string())
}

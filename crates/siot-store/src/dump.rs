//! `Dump`/`Import`: whole-store JSON snapshot, as `{nodes, edges, meta}`.
//!
//! Import also restores `meta`, so a dump round-trips the root ID along
//! with every node and edge.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use siot_data::{Edge, Meta, Node, StoreError};

use crate::codec::{tree_put, type_key};
use crate::query::{tx_edges, tx_nodes};
use crate::{fatal, Inner, Store, META_KEY};

/// The on-the-wire shape of a full store snapshot.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DumpDoc {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub meta: Meta,
}

/// Alias kept distinct from [`DumpDoc`] so a future divergence between the
/// dump and import wire shapes doesn't require touching every call site.
pub type ImportDoc = DumpDoc;

impl Store {
    /// Serializes every node, edge, and the meta singleton as indented JSON.
    pub async fn dump(&self, out: &mut (impl Write + Send)) -> Result<(), StoreError> {
        let inner = self.inner.clone();
        let doc = tokio::task::spawn_blocking(move || -> Result<DumpDoc, StoreError> {
            Ok(DumpDoc {
                nodes: tx_nodes(&inner)?,
                edges: tx_edges(&inner)?,
                meta: crate::codec::tree_get(&inner.meta, META_KEY)?.unwrap_or_default(),
            })
        })
        .await
        .map_err(fatal)??;

        serde_json::to_writer_pretty(out, &doc).map_err(|e| StoreError::Codec(e.to_string()))
    }

    /// Restores nodes, edges, and meta from a JSON snapshot produced by
    /// [`Store::dump`]. Overwrites any record sharing an ID; does not clear
    /// records absent from the snapshot.
    pub async fn import(&self, input: &mut (impl Read + Send)) -> Result<(), StoreError> {
        let mut bytes = Vec::new();
        input
            .read_to_end(&mut bytes)
            .map_err(|e| StoreError::Codec(e.to_string()))?;
        let doc: ImportDoc =
            serde_json::from_slice(&bytes).map_err(|e| StoreError::Codec(e.to_string()))?;

        let inner = self.inner.clone();
        let _guard = inner.write_lock.lock().await;
        tokio::task::spawn_blocking(move || do_import(&inner, doc))
            .await
            .map_err(fatal)?
    }
}

fn do_import(inner: &Inner, doc: ImportDoc) -> Result<(), StoreError> {
    for node in &doc.nodes {
        tree_put(&inner.nodes, &node.id.as_bytes(), node)?;
        if !node.typ.is_empty() {
            inner
                .nodes_by_type
                .insert(type_key(&node.typ, node.id), &[])
                .map_err(fatal)?;
        }
    }
    for edge in &doc.edges {
        tree_put(&inner.edges, &edge.id.as_bytes(), edge)?;
    }
    tree_put(&inner.meta, META_KEY, &doc.meta)?;
    Ok(())
}

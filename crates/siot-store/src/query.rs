//! Read-only queries: `Node`, `NodeEdge`, `Nodes`, `Edges`, `NodeDescendents`,
//! `EdgeUp`.

use std::str::FromStr;

use siot_data::{Edge, Meta, Node, NodeEdge, NodeID, StoreError};

use crate::codec::{tree_get, type_prefix};
use crate::{fatal, Inner, Store, META_KEY};

impl Store {
    /// The store-wide metadata singleton — in particular `root_id`, which
    /// is `None` until the first node is ever written.
    pub async fn meta(&self) -> Result<Meta, StoreError> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || Ok(tree_get(&inner.meta, META_KEY)?.unwrap_or_default()))
            .await
            .map_err(fatal)?
    }

    pub async fn node(&self, id: NodeID) -> Result<Node, StoreError> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || tx_node(&inner, id))
            .await
            .map_err(fatal)?
    }

    pub async fn nodes(&self) -> Result<Vec<Node>, StoreError> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || tx_nodes(&inner))
            .await
            .map_err(fatal)?
    }

    pub async fn edges(&self) -> Result<Vec<Edge>, StoreError> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || tx_edges(&inner))
            .await
            .map_err(fatal)?
    }

    /// The incoming, non-tombstoned edges of `id`.
    pub async fn edge_up(&self, id: NodeID) -> Result<Vec<Edge>, StoreError> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || tx_edge_up(&inner, id))
            .await
            .map_err(fatal)?
    }

    /// The node joined with the edge from `parent`.
    pub async fn node_edge(&self, id: NodeID, parent: Option<NodeID>) -> Result<NodeEdge, StoreError> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let node = tx_node(&inner, id)?;
            let edge = tx_edge_between(&inner, parent, id)?;
            Ok(node.to_node_edge(&edge))
        })
        .await
        .map_err(fatal)?
    }

    /// DFS over descendents of `id`. Skips tombstoned children unless
    /// `include_deleted`; filters by `typ` when `Some`.
    ///
    /// A direct (non-recursive), type-filtered call is the hot path driven
    /// by the supervisor's periodic scan, so it is answered off the
    /// `nodes_by_type` index instead of a full DFS over every child edge.
    pub async fn node_descendents(
        &self,
        id: NodeID,
        typ: Option<&str>,
        recursive: bool,
        include_deleted: bool,
    ) -> Result<Vec<NodeEdge>, StoreError> {
        let inner = self.inner.clone();
        let typ = typ.map(str::to_string);
        tokio::task::spawn_blocking(move || {
            if !recursive {
                if let Some(typ) = &typ {
                    return direct_children_of_type(&inner, id, typ, include_deleted);
                }
            }
            let mut out = Vec::new();
            find_descendents(&inner, id, recursive, 0, &mut out)?;
            out.retain(|ne| include_deleted || !ne.is_tombstone());
            if let Some(typ) = typ {
                out.retain(|ne| ne.typ == typ);
            }
            Ok(out)
        })
        .await
        .map_err(fatal)?
    }
}

/// Node ids currently registered under `typ` in the `nodes_by_type` index.
pub(crate) fn tx_nodes_of_type(inner: &Inner, typ: &str) -> Result<Vec<NodeID>, StoreError> {
    let prefix = type_prefix(typ);
    let mut out = Vec::new();
    for kv in inner.nodes_by_type.scan_prefix(&prefix) {
        let (key, _) = kv.map_err(fatal)?;
        let id_bytes = &key[prefix.len()..];
        let id_str = std::str::from_utf8(id_bytes).map_err(|e| StoreError::Codec(e.to_string()))?;
        out.push(NodeID::from_str(id_str).map_err(|e| StoreError::Codec(e.to_string()))?);
    }
    Ok(out)
}

/// Direct children of `id` whose type is `typ`: one down-edge scan of `id`
/// intersected against the type index, rather than decoding every node in
/// the store to test its type.
fn direct_children_of_type(
    inner: &Inner,
    id: NodeID,
    typ: &str,
    include_deleted: bool,
) -> Result<Vec<NodeEdge>, StoreError> {
    let candidates: std::collections::HashSet<NodeID> = tx_nodes_of_type(inner, typ)?.into_iter().collect();
    let mut out = Vec::new();
    for edge in tx_edge_down(inner, id)? {
        if !candidates.contains(&edge.down) {
            continue;
        }
        if edge.is_tombstone() && !include_deleted {
            continue;
        }
        let node = tx_node(inner, edge.down)?;
        out.push(node.to_node_edge(&edge));
    }
    Ok(out)
}

/// Recursion depth cap shared with hash propagation.
pub(crate) const MAX_DEPTH: u32 = 100;

fn find_descendents(
    inner: &Inner,
    id: NodeID,
    recursive: bool,
    depth: u32,
    out: &mut Vec<NodeEdge>,
) -> Result<(), StoreError> {
    if depth > MAX_DEPTH {
        return Err(StoreError::RecursionLimitExceeded(MAX_DEPTH));
    }

    for edge in tx_edge_down(inner, id)? {
        let node = match tx_node(inner, edge.down) {
            Ok(n) => n,
            Err(StoreError::NodeNotFound(missing)) => {
                log::error!("node {missing} referenced by edge {} not found", edge.id);
                continue;
            }
            Err(e) => return Err(e),
        };
        let ne = node.to_node_edge(&edge);
        let tombstoned = ne.is_tombstone();
        out.push(ne);

        if recursive && !tombstoned {
            find_descendents(inner, edge.down, true, depth + 1, out)?;
        }
    }

    Ok(())
}

pub(crate) fn tx_node(inner: &Inner, id: NodeID) -> Result<Node, StoreError> {
    tree_get(&inner.nodes, &id.as_bytes())?.ok_or(StoreError::NodeNotFound(id))
}

pub(crate) fn tx_nodes(inner: &Inner) -> Result<Vec<Node>, StoreError> {
    let mut out = Vec::new();
    for kv in inner.nodes.iter() {
        let (_, v) = kv.map_err(fatal)?;
        out.push(crate::codec::decode(&v)?);
    }
    Ok(out)
}

pub(crate) fn tx_edges(inner: &Inner) -> Result<Vec<Edge>, StoreError> {
    let mut out = Vec::new();
    for kv in inner.edges.iter() {
        let (_, v) = kv.map_err(fatal)?;
        out.push(crate::codec::decode(&v)?);
    }
    Ok(out)
}

/// Incoming edges of `id`, excluding tombstoned ones. Filters tombstones
/// even for internal hash-propagation traversal: a detached child stops
/// contributing to its former parent's hash.
pub(crate) fn tx_edge_up(inner: &Inner, id: NodeID) -> Result<Vec<Edge>, StoreError> {
    Ok(tx_edges(inner)?
        .into_iter()
        .filter(|e| e.down == id && !e.is_tombstone())
        .collect())
}

/// Outgoing (child) edges of `id`, tombstoned or not — a tombstoned
/// child's hash still folds into its parent's, matching `txEdgeDown`.
pub(crate) fn tx_edge_down(inner: &Inner, id: NodeID) -> Result<Vec<Edge>, StoreError> {
    Ok(tx_edges(inner)?
        .into_iter()
        .filter(|e| e.up == Some(id))
        .collect())
}

pub(crate) fn tx_edge_between(inner: &Inner, up: Option<NodeID>, down: NodeID) -> Result<Edge, StoreError> {
    tx_edges(inner)?
        .into_iter()
        .find(|e| e.up == up && e.down == down)
        .ok_or_else(|| match up {
            Some(p) => StoreError::NodeEdgeNotFound(down, p),
            None => StoreError::RootEdgeNotFound(down),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use siot_data::point::types;
    use siot_data::Point;

    #[tokio::test]
    async fn descendents_skips_tombstoned_unless_included() {
        let store = Store::temporary().unwrap();
        let root = NodeID::new();
        store.node_points(root, vec![]).await.unwrap();
        let child = NodeID::new();
        store
            .node_points(
                child,
                vec![
                    Point::text(types::NODE_TYPE, "sensor"),
                    Point::text(types::ADD_PARENT, root.to_string()),
                ],
            )
            .await
            .unwrap();

        store
            .node_points(child, vec![Point::text(types::REMOVE_PARENT, root.to_string())])
            .await
            .unwrap();

        let visible = store.node_descendents(root, None, false, false).await.unwrap();
        assert!(visible.is_empty());

        let all = store.node_descendents(root, None, false, true).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, child);
    }

    #[tokio::test]
    async fn direct_type_filtered_query_uses_index_and_tracks_retyping() {
        let store = Store::temporary().unwrap();
        let root = NodeID::new();
        store.node_points(root, vec![]).await.unwrap();

        let child = NodeID::new();
        store
            .node_points(
                child,
                vec![
                    Point::text(types::NODE_TYPE, "sensor"),
                    Point::text(types::ADD_PARENT, root.to_string()),
                ],
            )
            .await
            .unwrap();

        let sensors = store.node_descendents(root, Some("sensor"), false, false).await.unwrap();
        assert_eq!(sensors.len(), 1);
        assert_eq!(sensors[0].id, child);

        let gadgets = store.node_descendents(root, Some("gadget"), false, false).await.unwrap();
        assert!(gadgets.is_empty());

        // Retyping must move the node between index buckets: no longer
        // found under its old type, found under its new one.
        store
            .node_points(child, vec![Point::text(types::NODE_TYPE, "gadget")])
            .await
            .unwrap();

        let sensors = store.node_descendents(root, Some("sensor"), false, false).await.unwrap();
        assert!(sensors.is_empty());
        let gadgets = store.node_descendents(root, Some("gadget"), false, false).await.unwrap();
        assert_eq!(gadgets.len(), 1);
        assert_eq!(gadgets[0].id, child);
    }

    #[tokio::test]
    async fn descendents_filters_by_type_and_recurses() {
        let store = Store::temporary().unwrap();
        let root = NodeID::new();
        store.node_points(root, vec![]).await.unwrap();

        let sensor = NodeID::new();
        store
            .node_points(
                sensor,
                vec![
                    Point::text(types::NODE_TYPE, "sensor"),
                    Point::text(types::ADD_PARENT, root.to_string()),
                ],
            )
            .await
            .unwrap();
        let gadget = NodeID::new();
        store
            .node_points(
                gadget,
                vec![
                    Point::text(types::NODE_TYPE, "gadget"),
                    Point::text(types::ADD_PARENT, root.to_string()),
                ],
            )
            .await
            .unwrap();
        let grandchild = NodeID::new();
        store
            .node_points(
                grandchild,
                vec![
                    Point::text(types::NODE_TYPE, "sensor"),
                    Point::text(types::ADD_PARENT, sensor.to_string()),
                ],
            )
            .await
            .unwrap();

        let sensors = store.node_descendents(root, Some("sensor"), true, false).await.unwrap();
        let ids: Vec<_> = sensors.iter().map(|ne| ne.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&sensor));
        assert!(ids.contains(&grandchild));

        let direct_only = store.node_descendents(root, None, false, false).await.unwrap();
        assert_eq!(direct_only.len(), 2);
        assert!(!direct_only.iter().any(|ne| ne.id == grandchild));
    }
}

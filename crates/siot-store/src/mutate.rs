//! The write path: `NodePoints` and `EdgePoints`, with the Merkle-style
//! hash propagation that runs after every mutation: per-transaction
//! node/edge caching, control-point splitting (`addParent`/`removeParent`/
//! `nodeType`), and the recursive hash walk toward the root.

use std::collections::HashMap;

use chrono::Utc;
use siot_data::{edge_hash, Edge, EdgeID, Hash, Meta, Node, NodeID, Point, StoreError};

use crate::codec::{tree_get, tree_put, type_key};
use crate::query::{tx_edge_between, tx_edge_down, tx_edge_up, tx_node, MAX_DEPTH};
use crate::{fatal, Inner, Store, META_KEY};
use siot_data::point::types;

/// A point whose `time` is left at the epoch tells the store "stamp this
/// for me" — equivalent to a caller simply omitting the field.
fn stamp_if_unset(p: &mut Point) {
    if p.time.timestamp() == 0 {
        p.time = Utc::now();
    }
}

/// Per-transaction cache of touched nodes and edges: shared ancestors are
/// fetched once, mutated in place, and written back exactly once at commit.
struct Cache {
    nodes: HashMap<NodeID, NodeRec>,
    edges: HashMap<EdgeID, Edge>,
}

struct NodeRec {
    node: Node,
    up: Vec<EdgeID>,
    down: Vec<EdgeID>,
    /// The node's type as loaded at the start of the transaction, so
    /// `commit` can tell whether a `nodeType` point actually changed it and
    /// the `nodes_by_type` index needs updating.
    orig_type: String,
}

impl Cache {
    fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            edges: HashMap::new(),
        }
    }

    /// Loads `id` and all edges touching it, unless already cached.
    fn load(&mut self, inner: &Inner, id: NodeID) -> Result<(), StoreError> {
        if self.nodes.contains_key(&id) {
            return Ok(());
        }
        let node = tx_node(inner, id)?;
        let up = tx_edge_up(inner, id)?;
        let down = tx_edge_down(inner, id)?;
        let up_ids = up.iter().map(|e| e.id).collect();
        let down_ids = down.iter().map(|e| e.id).collect();
        for e in up.into_iter().chain(down) {
            self.edges.entry(e.id).or_insert(e);
        }
        let orig_type = node.typ.clone();
        self.nodes.insert(
            id,
            NodeRec {
                node,
                up: up_ids,
                down: down_ids,
                orig_type,
            },
        );
        Ok(())
    }

    fn node_mut(&mut self, id: NodeID) -> &mut Node {
        &mut self.nodes.get_mut(&id).expect("node must be cached").node
    }

    /// Ensures `eid` (an edge `parent -> child`) is recorded in both
    /// endpoints' cached edge lists, regardless of which load path first
    /// brought the edge into `edges`.
    fn link(&mut self, parent: NodeID, child: NodeID, eid: EdgeID) {
        let down = &mut self.nodes.get_mut(&parent).expect("node must be cached").down;
        if !down.contains(&eid) {
            down.push(eid);
        }
        let up = &mut self.nodes.get_mut(&child).expect("node must be cached").up;
        if !up.contains(&eid) {
            up.push(eid);
        }
    }

    /// Recomputes `node`'s incoming edges' hashes from its current points
    /// and its down edges' (already computed) hashes.
    fn recompute_hashes(&mut self, id: NodeID) {
        let rec = self.nodes.get(&id).expect("node must be cached");
        let mut child_hashes: Vec<(EdgeID, Hash)> = rec
            .down
            .iter()
            .map(|eid| (*eid, self.edges[eid].hash))
            .collect();
        child_hashes.sort_by_key(|(id, _)| *id);
        let hashes: Vec<Hash> = child_hashes.into_iter().map(|(_, h)| h).collect();
        let node_points = rec.node.points.clone();
        let up_ids = rec.up.clone();

        for eid in up_ids {
            let up_points = self.edges[&eid].points.clone();
            let h = edge_hash(&up_points, &node_points, &hashes);
            self.edges.get_mut(&eid).unwrap().hash = h;
        }
    }
}

/// Walks from `id` toward the root, recomputing every ancestor's incoming
/// edge hash. A node reachable via more than one path (a reconverging
/// DAG: two parents sharing a common ancestor) is deliberately revisited
/// once per path rather than memoized — memoizing on node id alone would
/// let the first path's visit mark a shared ancestor "done" while its
/// hash still reflects a sibling branch's stale down-edge, so the second
/// path's correction would never run. `MAX_DEPTH` alone bounds the walk,
/// same as the original's `processNode`.
fn process_node(inner: &Inner, cache: &mut Cache, id: NodeID, depth: u32) -> Result<(), StoreError> {
    if depth > MAX_DEPTH {
        return Err(StoreError::RecursionLimitExceeded(MAX_DEPTH));
    }

    cache.recompute_hashes(id);

    let up_ids = cache.nodes[&id].up.clone();
    for eid in up_ids {
        if let Some(parent_id) = cache.edges[&eid].up {
            cache.load(inner, parent_id)?;
            process_node(inner, cache, parent_id, depth + 1)?;
        }
    }
    Ok(())
}

impl Store {
    /// Applies `points` to node `id`, creating it (as a new root, or a new
    /// child of the node named by an `addParent` point) if it doesn't
    /// already exist, then propagates hash changes up to the root.
    pub async fn node_points(&self, id: NodeID, points: Vec<Point>) -> Result<(), StoreError> {
        let inner = self.inner.clone();
        let _guard = inner.write_lock.lock().await;
        tokio::task::spawn_blocking(move || do_node_points(&inner, id, points))
            .await
            .map_err(fatal)?
    }

    /// Applies `points` directly to the edge `(up, down)`, without touching
    /// the node's own points, then re-propagates from `down`.
    pub async fn edge_points(
        &self,
        up: Option<NodeID>,
        down: NodeID,
        points: Vec<Point>,
    ) -> Result<(), StoreError> {
        let inner = self.inner.clone();
        let _guard = inner.write_lock.lock().await;
        tokio::task::spawn_blocking(move || do_edge_points(&inner, up, down, points))
            .await
            .map_err(fatal)?
    }
}

fn do_node_points(inner: &Inner, id: NodeID, points: Vec<Point>) -> Result<(), StoreError> {
    let mut cache = Cache::new();
    let meta: Meta = tree_get(&inner.meta, META_KEY)?.unwrap_or_default();

    let is_new = match cache.load(inner, id) {
        Ok(()) => false,
        Err(StoreError::NodeNotFound(_)) => true,
        Err(e) => return Err(e),
    };
    let mut new_root = false;
    if is_new {
        let node = Node { id, typ: String::new(), points: Default::default() };
        match meta.root_id {
            None => {
                new_root = true;
                let root_edge = Edge::new(None, id);
                let root_edge_id = root_edge.id;
                cache.edges.insert(root_edge_id, root_edge);
                cache.nodes.insert(
                    id,
                    NodeRec {
                        node,
                        up: vec![root_edge_id],
                        down: vec![],
                        orig_type: String::new(),
                    },
                );
            }
            Some(_) => {
                let has_add_parent = points.iter().any(|p| p.typ == types::ADD_PARENT);
                if !has_add_parent {
                    return Err(StoreError::MissingAddParent);
                }
                cache.nodes.insert(
                    id,
                    NodeRec {
                        node,
                        up: vec![],
                        down: vec![],
                        orig_type: String::new(),
                    },
                );
            }
        }
    }

    let mut add_parent: Option<NodeID> = None;
    let mut remove_parent: Option<NodeID> = None;

    for mut p in points {
        stamp_if_unset(&mut p);
        match p.typ.as_str() {
            types::ADD_PARENT => {
                add_parent = p.text.parse().ok();
            }
            types::REMOVE_PARENT => {
                remove_parent = p.text.parse().ok();
            }
            types::NODE_TYPE => {
                cache.node_mut(id).typ = p.text.clone();
            }
            _ => {
                cache.node_mut(id).points.process_point(p);
            }
        }
    }

    if let Some(parent_id) = add_parent {
        cache.load(inner, parent_id)?;
        match tx_edge_between(inner, Some(parent_id), id) {
            Ok(edge) => {
                let eid = edge.id;
                let was_tombstoned = edge.is_tombstone();
                cache.edges.entry(eid).or_insert(edge);
                cache.link(parent_id, id, eid);
                if was_tombstoned {
                    cache
                        .edges
                        .get_mut(&eid)
                        .unwrap()
                        .points
                        .process_point(Point::new(types::TOMBSTONE, 0.0));
                }
            }
            // Brand-new edges carry no points at all: there is nothing to
            // clear, so no tombstone point is written.
            Err(_) => {
                let edge = Edge::new(Some(parent_id), id);
                let eid = edge.id;
                cache.edges.insert(eid, edge);
                cache.link(parent_id, id, eid);
            }
        }
    }

    if let Some(parent_id) = remove_parent {
        cache.load(inner, parent_id)?;
        if let Ok(edge) = tx_edge_between(inner, Some(parent_id), id) {
            let eid = edge.id;
            cache.edges.entry(eid).or_insert(edge);
            cache.link(parent_id, id, eid);
            cache
                .edges
                .get_mut(&eid)
                .unwrap()
                .points
                .process_point(Point::new(types::TOMBSTONE, 1.0));
        }
    }

    // A single propagation from `id` reaches every edge touched above: the
    // new/resurrected or tombstoned edge is already in `id`'s cached `up`
    // list, so recomputing from `id` walks through it to the parent (and
    // beyond) exactly as if nothing special had happened.
    process_node(inner, &mut cache, id, 0)?;

    commit(inner, cache, id, if new_root { Some(id) } else { None })
}

fn do_edge_points(
    inner: &Inner,
    up: Option<NodeID>,
    down: NodeID,
    points: Vec<Point>,
) -> Result<(), StoreError> {
    let mut cache = Cache::new();
    cache.load(inner, down)?;
    let edge = tx_edge_between(inner, up, down)?;
    cache.edges.entry(edge.id).or_insert(edge.clone());
    for mut p in points {
        stamp_if_unset(&mut p);
        cache.edges.get_mut(&edge.id).unwrap().points.process_point(p);
    }

    process_node(inner, &mut cache, down, 0)?;

    commit(inner, cache, down, None)
}

/// Flushes the cache: every touched edge (hash or point changes propagate
/// through many ancestors) plus only the one node whose own points
/// changed — a node's `Points` never change as a side effect of hash
/// propagation, only the edge `Hash` values do.
fn commit(inner: &Inner, cache: Cache, target: NodeID, new_root: Option<NodeID>) -> Result<(), StoreError> {
    for (eid, edge) in &cache.edges {
        tree_put(&inner.edges, &eid.as_bytes(), edge)?;
    }
    let target_rec = &cache.nodes[&target];
    let node = &target_rec.node;
    tree_put(&inner.nodes, &target.as_bytes(), node)?;

    // Only `target`'s own `.typ` can have changed this transaction (a
    // `nodeType` point only ever lands on the directly-mutated node), so
    // the index only ever needs touching for this one node.
    if target_rec.orig_type != node.typ {
        if !target_rec.orig_type.is_empty() {
            inner
                .nodes_by_type
                .remove(type_key(&target_rec.orig_type, target))
                .map_err(fatal)?;
        }
        if !node.typ.is_empty() {
            inner
                .nodes_by_type
                .insert(type_key(&node.typ, target), &[])
                .map_err(fatal)?;
        }
    }

    if let Some(root_id) = new_root {
        let mut meta: Meta = tree_get(&inner.meta, META_KEY)?.unwrap_or_default();
        meta.root_id = Some(root_id);
        tree_put(&inner.meta, META_KEY, &meta)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn root_creation() {
        let store = Store::temporary().unwrap();
        let n1 = NodeID::new();
        store
            .node_points(n1, vec![Point::text(types::NODE_TYPE, "device")])
            .await
            .unwrap();

        let node = store.node(n1).await.unwrap();
        assert_eq!(node.typ, "device");

        let up = store.edge_up(n1).await.unwrap();
        assert_eq!(up.len(), 1);
        assert_eq!(up[0].up, None);
    }

    #[tokio::test]
    async fn parent_attach_recomputes_root_hash() {
        let store = Store::temporary().unwrap();
        let n1 = NodeID::new();
        store
            .node_points(n1, vec![Point::text(types::NODE_TYPE, "device")])
            .await
            .unwrap();
        let root_edge_before = store.edge_up(n1).await.unwrap().remove(0);

        let n2 = NodeID::new();
        store
            .node_points(
                n2,
                vec![
                    Point::text(types::NODE_TYPE, "sensor"),
                    Point::text(types::ADD_PARENT, n1.to_string()),
                ],
            )
            .await
            .unwrap();

        let edges = store.edges().await.unwrap();
        let n1_n2 = edges
            .iter()
            .find(|e| e.up == Some(n1) && e.down == n2)
            .expect("edge n1->n2 exists");
        assert!(!n1_n2.is_tombstone());

        let n2_node = store.node(n2).await.unwrap();
        assert_eq!(n2_node.typ, "sensor");

        let root_edge_after = store.edge_up(n1).await.unwrap().remove(0);
        assert_ne!(root_edge_before.hash, root_edge_after.hash);
    }

    #[tokio::test]
    async fn point_update_propagates_to_root() {
        let store = Store::temporary().unwrap();
        let n1 = NodeID::new();
        store.node_points(n1, vec![]).await.unwrap();
        let n2 = NodeID::new();
        store
            .node_points(n2, vec![Point::text(types::ADD_PARENT, n1.to_string())])
            .await
            .unwrap();

        let before = store.edge_up(n1).await.unwrap().remove(0).hash;
        store
            .node_points(n2, vec![Point::new(types::VALUE, 1.0)])
            .await
            .unwrap();
        let after = store.edge_up(n1).await.unwrap().remove(0).hash;

        assert_ne!(before, after);
        let n2_node = store.node(n2).await.unwrap();
        assert_eq!(n2_node.points.value(types::VALUE, "0"), Some(1.0));
    }

    #[tokio::test]
    async fn topology_idempotence_and_removal() {
        let store = Store::temporary().unwrap();
        let n1 = NodeID::new();
        store.node_points(n1, vec![]).await.unwrap();
        let n2 = NodeID::new();
        store
            .node_points(n2, vec![Point::text(types::ADD_PARENT, n1.to_string())])
            .await
            .unwrap();
        // Re-adding the same parent must not create a second edge.
        store
            .node_points(n2, vec![Point::text(types::ADD_PARENT, n1.to_string())])
            .await
            .unwrap();
        let edges: Vec<_> = store
            .edges()
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.up == Some(n1) && e.down == n2)
            .collect();
        assert_eq!(edges.len(), 1);

        store
            .node_points(n2, vec![Point::text(types::REMOVE_PARENT, n1.to_string())])
            .await
            .unwrap();
        let up = store.edge_up(n2).await.unwrap();
        assert!(up.is_empty(), "tombstoned edge must not appear in EdgeUp");
    }

    #[tokio::test]
    async fn re_add_resurrects_rather_than_duplicates() {
        let store = Store::temporary().unwrap();
        let n1 = NodeID::new();
        store.node_points(n1, vec![]).await.unwrap();
        let n2 = NodeID::new();
        store
            .node_points(n2, vec![Point::text(types::ADD_PARENT, n1.to_string())])
            .await
            .unwrap();
        let original_edge_id = store.edge_up(n2).await.unwrap()[0].id;

        store
            .node_points(n2, vec![Point::text(types::REMOVE_PARENT, n1.to_string())])
            .await
            .unwrap();
        store
            .node_points(n2, vec![Point::text(types::ADD_PARENT, n1.to_string())])
            .await
            .unwrap();

        let edges: Vec<_> = store
            .edges()
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.up == Some(n1) && e.down == n2)
            .collect();
        assert_eq!(edges.len(), 1, "resurrection must not create a duplicate edge");
        assert_eq!(edges[0].id, original_edge_id);
        assert!(!edges[0].is_tombstone());
    }

    #[tokio::test]
    async fn second_node_without_add_parent_is_rejected() {
        let store = Store::temporary().unwrap();
        let n1 = NodeID::new();
        store.node_points(n1, vec![]).await.unwrap();

        let n2 = NodeID::new();
        let err = store.node_points(n2, vec![Point::new(types::VALUE, 1.0)]).await;
        assert!(matches!(err, Err(StoreError::MissingAddParent)));
    }

    /// `root` has two children `p1`/`p2`, both of which parent a shared
    /// descendant `x`. Mutating `x` must refresh `root`'s own incoming
    /// edge from both branches' *current* hashes, not whichever branch the
    /// walk happened to visit `root` through first.
    #[tokio::test]
    async fn diamond_propagation_updates_from_every_branch() {
        let store = Store::temporary().unwrap();
        let root = NodeID::new();
        store.node_points(root, vec![]).await.unwrap();

        let p1 = NodeID::new();
        store
            .node_points(p1, vec![Point::text(types::ADD_PARENT, root.to_string())])
            .await
            .unwrap();
        let p2 = NodeID::new();
        store
            .node_points(p2, vec![Point::text(types::ADD_PARENT, root.to_string())])
            .await
            .unwrap();

        let x = NodeID::new();
        store
            .node_points(x, vec![Point::text(types::ADD_PARENT, p1.to_string())])
            .await
            .unwrap();
        store
            .node_points(x, vec![Point::text(types::ADD_PARENT, p2.to_string())])
            .await
            .unwrap();

        store.node_points(x, vec![Point::new(types::VALUE, 42.0)]).await.unwrap();

        let root_edge = store.edge_up(root).await.unwrap().remove(0);
        let root_node = store.node(root).await.unwrap();

        let mut child_edges: Vec<_> = store
            .edges()
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.up == Some(root))
            .collect();
        child_edges.sort_by_key(|e| e.id);
        let child_hashes: Vec<_> = child_edges.iter().map(|e| e.hash).collect();

        let expected = edge_hash(&root_edge.points, &root_node.points, &child_hashes);
        assert_eq!(
            root_edge.hash, expected,
            "root edge hash must reflect both p1's and p2's current down-edge hashes"
        );
    }
}

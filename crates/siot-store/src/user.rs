//! `UserCheck`: credential lookup against nodes of type `user`.
//!
//! Scans nodes of type `user`, keeps every credential match, then prefers
//! the one with the smallest hop-count to the root when more than one node
//! shares an `(email, pass)` pair.

use serde::{Deserialize, Serialize};
use siot_data::point::types;
use siot_data::{NodeID, StoreError};

use crate::query::{tx_edge_up, tx_node, tx_nodes_of_type};
use crate::{fatal, Inner, Store};

const NODE_TYPE_USER: &str = "user";

/// A user node's identity, projected out of its points.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: NodeID,
    pub email: String,
    pub pass: String,
}

impl Store {
    /// Returns the user whose `(email, pass)` points match, preferring the
    /// one closest to the root when several nodes share the same
    /// credentials. `None` if no node matches.
    pub async fn user_check(&self, email: &str, pass: &str) -> Result<Option<User>, StoreError> {
        let inner = self.inner.clone();
        let email = email.to_string();
        let pass = pass.to_string();
        tokio::task::spawn_blocking(move || do_user_check(&inner, &email, &pass))
            .await
            .map_err(fatal)?
    }
}

fn do_user_check(inner: &Inner, email: &str, pass: &str) -> Result<Option<User>, StoreError> {
    let mut best: Option<(u32, User)> = None;

    for id in tx_nodes_of_type(inner, NODE_TYPE_USER)? {
        let node = match tx_node(inner, id) {
            Ok(node) => node,
            Err(StoreError::NodeNotFound(_)) => continue,
            Err(e) => return Err(e),
        };
        let node_email = node.points.text(types::EMAIL, "0").unwrap_or("");
        let node_pass = node.points.text(types::PASS, "0").unwrap_or("");
        if node_email != email || node_pass != pass {
            continue;
        }

        let user = User {
            id: node.id,
            email: node_email.to_string(),
            pass: node_pass.to_string(),
        };
        let dist = min_dist_to_root(inner, node.id)?;
        match &best {
            Some((best_dist, _)) if *best_dist <= dist => {}
            _ => best = Some((dist, user)),
        }
    }

    Ok(best.map(|(_, u)| u))
}

/// Shortest hop-count from `id` to the root, walking non-tombstoned
/// incoming edges. A node with multiple incoming edges takes the shortest
/// of every path.
fn min_dist_to_root(inner: &Inner, id: NodeID) -> Result<u32, StoreError> {
    let root_id = tree_get_root(inner)?;
    count_up(inner, id, 0, root_id)
}

fn tree_get_root(inner: &Inner) -> Result<Option<NodeID>, StoreError> {
    let meta: siot_data::Meta = crate::codec::tree_get(&inner.meta, crate::META_KEY)?.unwrap_or_default();
    Ok(meta.root_id)
}

fn count_up(inner: &Inner, id: NodeID, depth: u32, root_id: Option<NodeID>) -> Result<u32, StoreError> {
    if Some(id) == root_id {
        return Ok(depth);
    }
    if depth > crate::query::MAX_DEPTH {
        return Err(StoreError::RecursionLimitExceeded(crate::query::MAX_DEPTH));
    }

    let ups = tx_edge_up(inner, id)?;
    let mut min = u32::MAX;
    for up in ups {
        if let Some(parent_id) = up.up {
            let d = count_up(inner, parent_id, depth + 1, root_id)?;
            min = min.min(d);
        }
    }
    Ok(min)
}

#[cfg(test)]
mod tests {
    use super::*;
    use siot_data::Point;

    #[tokio::test]
    async fn finds_matching_user() {
        let store = Store::temporary().unwrap();
        let root = NodeID::new();
        store.node_points(root, vec![]).await.unwrap();

        let user = NodeID::new();
        store
            .node_points(
                user,
                vec![
                    Point::text(types::ADD_PARENT, root.to_string()),
                    Point::text(types::NODE_TYPE, "user"),
                    Point::text(types::EMAIL, "a@example.com"),
                    Point::text(types::PASS, "secret"),
                ],
            )
            .await
            .unwrap();

        let found = store.user_check("a@example.com", "secret").await.unwrap();
        assert_eq!(found.map(|u| u.id), Some(user));

        let not_found = store.user_check("a@example.com", "wrong").await.unwrap();
        assert!(not_found.is_none());
    }

    #[tokio::test]
    async fn prefers_node_closest_to_root_on_tie() {
        let store = Store::temporary().unwrap();
        let root = NodeID::new();
        store.node_points(root, vec![]).await.unwrap();

        let near = NodeID::new();
        store
            .node_points(
                near,
                vec![
                    Point::text(types::ADD_PARENT, root.to_string()),
                    Point::text(types::NODE_TYPE, "user"),
                    Point::text(types::EMAIL, "a@example.com"),
                    Point::text(types::PASS, "secret"),
                ],
            )
            .await
            .unwrap();

        let mid = NodeID::new();
        store
            .node_points(
                mid,
                vec![
                    Point::text(types::ADD_PARENT, root.to_string()),
                    Point::text(types::NODE_TYPE, "device"),
                ],
            )
            .await
            .unwrap();
        let far = NodeID::new();
        store
            .node_points(
                far,
                vec![
                    Point::text(types::ADD_PARENT, mid.to_string()),
                    Point::text(types::NODE_TYPE, "user"),
                    Point::text(types::EMAIL, "a@example.com"),
                    Point::text(types::PASS, "secret"),
                ],
            )
            .await
            .unwrap();

        let found = store.user_check("a@example.com", "secret").await.unwrap();
        assert_eq!(found.map(|u| u.id), Some(near));
    }
}

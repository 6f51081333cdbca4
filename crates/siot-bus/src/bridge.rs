//! [`StoreBridge`]: subscribes to every node/edge points subject and the
//! children-query subject, and applies what arrives to a
//! [`siot_store::Store`]. A standalone task the `siot` daemon spawns
//! alongside the store, so the store and the wire transport stay decoupled.

use futures::StreamExt;
use siot_data::{NodeID, Point};
use siot_store::Store;

use crate::bus::ChildrenQuery;
use crate::nats::NatsBus;

/// Wildcard subjects: `*` matches exactly one NATS subject token, so
/// `node.*.points` and `node.*.*.points` disambiguate node-level from
/// edge-level batches by token count alone.
const NODE_POINTS_WILDCARD: &str = "node.*.points";
const EDGE_POINTS_WILDCARD: &str = "node.*.*.points";
const CHILDREN_WILDCARD: &str = "node.*.children";

pub struct StoreBridge {
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl StoreBridge {
    /// Spawns the subscription-handling tasks. Call [`StoreBridge::stop`]
    /// (or drop the value) to tear them down.
    pub async fn start(bus: &NatsBus, store: Store) -> anyhow::Result<Self> {
        let client = bus.client().clone();

        let node_points = {
            let store = store.clone();
            let mut sub = client.subscribe(NODE_POINTS_WILDCARD).await?;
            tokio::spawn(async move {
                while let Some(msg) = sub.next().await {
                    let Some(id) = subject_node_id(&msg.subject, 1) else { continue };
                    match serde_json::from_slice::<Vec<Point>>(&msg.payload) {
                        Ok(points) => {
                            if let Err(e) = store.node_points(id, points).await {
                                log::error!("node_points({id}) failed: {e}");
                            }
                        }
                        Err(e) => log::error!("malformed node points on {}: {e}", msg.subject),
                    }
                }
            })
        };

        let edge_points = {
            let store = store.clone();
            let mut sub = client.subscribe(EDGE_POINTS_WILDCARD).await?;
            tokio::spawn(async move {
                while let Some(msg) = sub.next().await {
                    let parts: Vec<&str> = msg.subject.split('.').collect();
                    let (Some(id), Some(parent)) = (
                        parts.get(1).and_then(|s| s.parse().ok()),
                        parts.get(2).and_then(|s| s.parse().ok()),
                    ) else {
                        continue;
                    };
                    match serde_json::from_slice::<Vec<Point>>(&msg.payload) {
                        Ok(points) => {
                            if let Err(e) = store.edge_points(Some(parent), id, points).await {
                                log::error!("edge_points({parent}->{id}) failed: {e}");
                            }
                        }
                        Err(e) => log::error!("malformed edge points on {}: {e}", msg.subject),
                    }
                }
            })
        };

        let children = {
            let store = store.clone();
            let client = client.clone();
            let mut sub = client.subscribe(CHILDREN_WILDCARD).await?;
            tokio::spawn(async move {
                while let Some(msg) = sub.next().await {
                    let Some(reply) = msg.reply.clone() else { continue };
                    let Some(id) = subject_node_id(&msg.subject, 1) else { continue };
                    let query: ChildrenQuery = match serde_json::from_slice(&msg.payload) {
                        Ok(q) => q,
                        Err(e) => {
                            log::error!("malformed children query on {}: {e}", msg.subject);
                            continue;
                        }
                    };
                    let result = store
                        .node_descendents(id, query.typ.as_deref(), query.recursive, query.include_deleted)
                        .await;
                    let payload = match result {
                        Ok(children) => serde_json::to_vec(&children).unwrap_or_default(),
                        Err(e) => {
                            log::error!("node_descendents({id}) failed: {e}");
                            continue;
                        }
                    };
                    if let Err(e) = client.publish(reply, payload.into()).await {
                        log::error!("failed to reply on children query: {e}");
                    }
                }
            })
        };

        Ok(Self {
            tasks: vec![node_points, edge_points, children],
        })
    }

    /// Aborts every subscription task.
    pub fn stop(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

fn subject_node_id(subject: &str, token_index: usize) -> Option<NodeID> {
    subject.split('.').nth(token_index)?.parse().ok()
}

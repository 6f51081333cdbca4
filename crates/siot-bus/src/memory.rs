//! [`MemoryBus`]: an in-process [`Bus`] double over a real
//! [`siot_store::Store`], for manager/client tests that need store
//! semantics without a NATS server. A faithful in-memory stand-in for the
//! same trait the networked implementation satisfies.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use siot_data::{NodeEdge, NodeID, Point};
use siot_store::Store;
use tokio::sync::{broadcast, mpsc, Mutex};

use crate::bus::{subjects, Bus, ChildrenQuery, Subscription};

const CHANNEL_CAPACITY: usize = 64;

pub struct MemoryBus {
    store: Store,
    channels: Mutex<HashMap<String, broadcast::Sender<Vec<Point>>>>,
}

impl MemoryBus {
    pub fn new(store: Store) -> Arc<Self> {
        Arc::new(Self {
            store,
            channels: Mutex::new(HashMap::new()),
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    async fn publish(&self, subject: String, points: Vec<Point>) {
        let channels = self.channels.lock().await;
        if let Some(tx) = channels.get(&subject) {
            // No subscriber, or a lagging one: both are silently dropped.
            // Messages that arrive while nothing is subscribed are lost.
            let _ = tx.send(points);
        }
    }

    async fn subject_sender(&self, subject: String) -> broadcast::Sender<Vec<Point>> {
        let mut channels = self.channels.lock().await;
        channels
            .entry(subject)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn send_node_points(&self, id: NodeID, points: Vec<Point>) -> anyhow::Result<()> {
        self.store.node_points(id, points.clone()).await?;
        self.publish(subjects::points(id), points).await;
        Ok(())
    }

    async fn send_edge_points(
        &self,
        parent: NodeID,
        id: NodeID,
        points: Vec<Point>,
    ) -> anyhow::Result<()> {
        self.store.edge_points(Some(parent), id, points.clone()).await?;
        self.publish(subjects::edge_points(parent, id), points).await;
        Ok(())
    }

    async fn subscribe_points(&self, id: NodeID) -> anyhow::Result<Subscription> {
        Ok(self.subscribe(subjects::points(id)).await)
    }

    async fn subscribe_edge_points(&self, parent: NodeID, id: NodeID) -> anyhow::Result<Subscription> {
        Ok(self.subscribe(subjects::edge_points(parent, id)).await)
    }

    async fn get_node_children(&self, id: NodeID, query: ChildrenQuery) -> anyhow::Result<Vec<NodeEdge>> {
        Ok(self
            .store
            .node_descendents(id, query.typ.as_deref(), query.recursive, query.include_deleted)
            .await?)
    }
}

impl MemoryBus {
    async fn subscribe(&self, subject: String) -> Subscription {
        let sender = self.subject_sender(subject).await;
        let mut broadcast_rx = sender.subscribe();
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        let forward = tokio::spawn(async move {
            loop {
                match broadcast_rx.recv().await {
                    Ok(points) => {
                        if tx.send(points).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Subscription::new(rx, forward)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use siot_data::point::types;

    #[tokio::test]
    async fn publishes_after_store_commit() {
        let store = Store::temporary().unwrap();
        let bus = MemoryBus::new(store);
        let root = NodeID::new();
        bus.send_node_points(root, vec![Point::text(types::NODE_TYPE, "device")])
            .await
            .unwrap();

        let mut sub = bus.subscribe_points(root).await.unwrap();
        let child = NodeID::new();
        bus.send_node_points(
            child,
            vec![
                Point::text(types::NODE_TYPE, "sensor"),
                Point::text(types::ADD_PARENT, root.to_string()),
            ],
        )
        .await
        .unwrap();
        bus.send_node_points(root, vec![Point::new(types::VALUE, 2.0)])
            .await
            .unwrap();

        let delivered = sub.recv().await.unwrap();
        assert_eq!(delivered[0].typ, types::VALUE);
    }

    #[tokio::test]
    async fn get_node_children_reflects_store() {
        let store = Store::temporary().unwrap();
        let bus = MemoryBus::new(store);
        let root = NodeID::new();
        bus.send_node_points(root, vec![]).await.unwrap();
        let child = NodeID::new();
        bus.send_node_points(
            child,
            vec![
                Point::text(types::NODE_TYPE, "shellyIOConfig"),
                Point::text(types::ADD_PARENT, root.to_string()),
            ],
        )
        .await
        .unwrap();

        let children = bus
            .get_node_children(
                root,
                ChildrenQuery {
                    typ: Some("shellyIOConfig".to_string()),
                    recursive: false,
                    include_deleted: false,
                },
            )
            .await
            .unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, child);
    }
}

//! [`Bus`]: publish/subscribe/query verbs, independent of transport.
//! [`NatsBus`](crate::NatsBus) and [`MemoryBus`](crate::MemoryBus) are its
//! two implementations — a real one and an in-process test double.

use async_trait::async_trait;
use siot_data::{NodeEdge, NodeID, Point};
use tokio::sync::mpsc;

/// Parameters for `GetNodeChildren`, sent as the request payload. NATS
/// subjects carry no query strings, so the filter travels in the message
/// body instead.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct ChildrenQuery {
    #[serde(rename = "type")]
    pub typ: Option<String>,
    pub recursive: bool,
    pub include_deleted: bool,
}

/// A live subscription to a points feed. Dropping it cancels delivery:
/// the forwarding task is aborted, which is how a manager tears down a
/// client's subscriptions on shutdown.
pub struct Subscription {
    rx: mpsc::Receiver<Vec<Point>>,
    forward: tokio::task::JoinHandle<()>,
}

impl Subscription {
    pub(crate) fn new(rx: mpsc::Receiver<Vec<Point>>, forward: tokio::task::JoinHandle<()>) -> Self {
        Self { rx, forward }
    }

    /// Awaits the next point batch. `None` once the bus connection (or the
    /// in-memory double) has shut the feed down.
    pub async fn recv(&mut self) -> Option<Vec<Point>> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.forward.abort();
    }
}

/// The bus contract independent of transport: publish point batches,
/// subscribe to a node's or an edge's feed, and list a node's typed
/// children.
#[async_trait]
pub trait Bus: Send + Sync {
    async fn send_node_points(&self, id: NodeID, points: Vec<Point>) -> anyhow::Result<()>;

    async fn send_edge_points(
        &self,
        parent: NodeID,
        id: NodeID,
        points: Vec<Point>,
    ) -> anyhow::Result<()>;

    async fn subscribe_points(&self, id: NodeID) -> anyhow::Result<Subscription>;

    async fn subscribe_edge_points(&self, parent: NodeID, id: NodeID) -> anyhow::Result<Subscription>;

    async fn get_node_children(&self, id: NodeID, query: ChildrenQuery) -> anyhow::Result<Vec<NodeEdge>>;
}

/// Subject layout. The exact routing keys are an implementation detail;
/// these are ours.
pub mod subjects {
    use siot_data::NodeID;

    pub fn points(id: NodeID) -> String {
        format!("node.{id}.points")
    }

    pub fn edge_points(parent: NodeID, id: NodeID) -> String {
        format!("node.{id}.{parent}.points")
    }

    pub fn children(id: NodeID) -> String {
        format!("node.{id}.children")
    }
}

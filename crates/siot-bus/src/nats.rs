//! [`NatsBus`]: the real [`Bus`] implementation, backed by `async-nats`.

use std::time::Duration;

use async_nats::Client;
use async_trait::async_trait;
use futures::StreamExt;
use siot_data::{NodeEdge, NodeID, Point};
use tokio::sync::mpsc;

use crate::bus::{subjects, Bus, ChildrenQuery, Subscription};

/// `GetNodeChildren` request timeout, consistent with the bound used for
/// outbound HTTP device calls elsewhere in this workspace.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Bounded channel depth for a subscription's forwarding task.
const SUBSCRIPTION_BUFFER: usize = 64;

pub struct NatsBus {
    client: Client,
}

impl NatsBus {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = async_nats::connect(url).await?;
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl Bus for NatsBus {
    async fn send_node_points(&self, id: NodeID, points: Vec<Point>) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(&points)?;
        self.client.publish(subjects::points(id), payload.into()).await?;
        Ok(())
    }

    async fn send_edge_points(
        &self,
        parent: NodeID,
        id: NodeID,
        points: Vec<Point>,
    ) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(&points)?;
        self.client
            .publish(subjects::edge_points(parent, id), payload.into())
            .await?;
        Ok(())
    }

    async fn subscribe_points(&self, id: NodeID) -> anyhow::Result<Subscription> {
        subscribe(&self.client, subjects::points(id)).await
    }

    async fn subscribe_edge_points(&self, parent: NodeID, id: NodeID) -> anyhow::Result<Subscription> {
        subscribe(&self.client, subjects::edge_points(parent, id)).await
    }

    async fn get_node_children(&self, id: NodeID, query: ChildrenQuery) -> anyhow::Result<Vec<NodeEdge>> {
        let payload = serde_json::to_vec(&query)?;
        let reply = tokio::time::timeout(
            REQUEST_TIMEOUT,
            self.client.request(subjects::children(id), payload.into()),
        )
        .await??;
        Ok(serde_json::from_slice(&reply.payload)?)
    }
}

async fn subscribe(client: &Client, subject: String) -> anyhow::Result<Subscription> {
    let mut sub = client.subscribe(subject.clone()).await?;
    let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);

    let forward = tokio::spawn(async move {
        while let Some(msg) = sub.next().await {
            match serde_json::from_slice::<Vec<Point>>(&msg.payload) {
                Ok(points) => {
                    if tx.send(points).await.is_err() {
                        break;
                    }
                }
                Err(e) => log::error!("malformed point batch on {subject}: {e}"),
            }
        }
    });

    Ok(Subscription::new(rx, forward))
}

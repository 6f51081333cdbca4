//! The generic `Manager<T>` supervisor: starts and stops one device client
//! per attached child node, on a periodic scan. Built on the async-task
//! idiom the rest of this workspace uses (bounded channels, a
//! `tokio::select!` loop, `JoinHandle` cancellation via `abort`).
//!
//! A node type's runtime name is supplied once at construction (the
//! `node_type` argument) instead of derived via reflection, since Rust has
//! no runtime struct-tag introspection to drive that dispatch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use siot_bus::{Bus, ChildrenQuery};
use siot_client::{Client, ClientChannels};
use siot_data::codec::NodeConfig;
use siot_data::NodeID;
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio::task::JoinHandle;

/// How often `Start` re-scans for added/removed children.
const SCAN_PERIOD: Duration = Duration::from_secs(5);

/// How long `Stop` waits for client run tasks to exit before giving up and
/// logging instead of blocking process exit.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

/// `(parent_id, node_id)` — the same node under two parents is two
/// independently supervised clients, since edge points differ per parent.
type Key = (NodeID, NodeID);

/// The `(bus, config) -> client` constructor every concrete client exposes
/// (`ShellyIOClient::new`, `UpdateClient::new`, ...).
pub type Constructor<C> =
    Arc<dyn Fn(Arc<dyn Bus>, C) -> (Box<dyn Client>, ClientChannels) + Send + Sync>;

struct LiveClient {
    run_task: JoinHandle<()>,
    points_fwd: JoinHandle<()>,
    edge_fwd: JoinHandle<()>,
    stop_tx: oneshot::Sender<Option<String>>,
}

impl LiveClient {
    /// Cancels subscriptions and signals `Stop`, handing back the
    /// run task's handle for the caller to await with its own deadline.
    fn begin_stop(self, err: Option<String>) -> JoinHandle<()> {
        self.points_fwd.abort();
        self.edge_fwd.abort();
        let _ = self.stop_tx.send(err);
        self.run_task
    }
}

#[derive(Default)]
struct State {
    live: HashMap<Key, LiveClient>,
}

/// Supervises every node of one type under `root`, starting and stopping
/// the matching device client as nodes are attached and detached.
pub struct Manager<C: NodeConfig + Send + 'static> {
    node_type: &'static str,
    bus: Arc<dyn Bus>,
    root: NodeID,
    construct: Constructor<C>,
    state: Mutex<State>,
    stopped: AtomicBool,
    stop_notify: Notify,
}

impl<C: NodeConfig + Send + 'static> Manager<C> {
    pub fn new(node_type: &'static str, bus: Arc<dyn Bus>, root: NodeID, construct: Constructor<C>) -> Self {
        Self {
            node_type,
            bus,
            root,
            construct,
            state: Mutex::new(State::default()),
            stopped: AtomicBool::new(false),
            stop_notify: Notify::new(),
        }
    }

    /// Blocks: an initial scan, then one every [`SCAN_PERIOD`] until
    /// [`Manager::stop`] is called from another task.
    pub async fn start(&self) {
        self.scan().await;
        let mut ticker = tokio::time::interval(SCAN_PERIOD);
        ticker.tick().await; // the first tick fires immediately; already scanned above

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.stopped.load(Ordering::SeqCst) {
                        break;
                    }
                    self.scan().await;
                }
                _ = self.stop_notify.notified() => break,
            }
        }
    }

    /// Cancels every live client's subscriptions, calls `Stop(err)` on
    /// each, and waits up to [`SHUTDOWN_DEADLINE`] for their run tasks to
    /// exit as a group. A client still running past the deadline is
    /// logged, not awaited further.
    pub async fn stop(&self, err: Option<String>) {
        self.stopped.store(true, Ordering::SeqCst);
        self.stop_notify.notify_one();

        let live = {
            let mut state = self.state.lock().await;
            std::mem::take(&mut state.live)
        };

        let joins: Vec<JoinHandle<()>> = live
            .into_values()
            .map(|client| client.begin_stop(err.clone()))
            .collect();

        if tokio::time::timeout(SHUTDOWN_DEADLINE, futures::future::join_all(joins))
            .await
            .is_err()
        {
            log::error!(
                "{}: one or more client run tasks did not exit within the shutdown deadline",
                self.node_type
            );
        }
    }

    /// One scan pass: lists the root's typed children, starts a client for
    /// each one not already live, and stops clients for children no longer
    /// present. Holds a single lock across the whole thing so a concurrent
    /// `stop` sees a coherent snapshot.
    pub async fn scan(&self) {
        let query = ChildrenQuery {
            typ: Some(self.node_type.to_string()),
            recursive: false,
            include_deleted: false,
        };
        let children = match self.bus.get_node_children(self.root, query).await {
            Ok(c) => c,
            Err(e) => {
                log::error!("{}: scan failed to list children: {e}", self.node_type);
                return;
            }
        };

        let mut state = self.state.lock().await;
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }

        let mut seen = std::collections::HashSet::with_capacity(children.len());
        for ne in &children {
            let Some(parent) = ne.parent else {
                log::error!(
                    "{}: child {} has no parent edge, skipping",
                    self.node_type,
                    ne.id
                );
                continue;
            };
            let key = (parent, ne.id);
            seen.insert(key);
            if state.live.contains_key(&key) {
                continue;
            }

            let config = match C::decode(ne) {
                Ok(c) => c,
                Err(e) => {
                    log::error!("{}: decode failed for node {}: {e}", self.node_type, ne.id);
                    continue;
                }
            };

            let (mut client, channels) = (self.construct)(self.bus.clone(), config);
            let ClientChannels {
                points_tx,
                edge_points_tx,
                stop_tx,
            } = channels;

            let sub_points = match self.bus.subscribe_points(ne.id).await {
                Ok(s) => s,
                Err(e) => {
                    log::error!("{}: subscribe_points({}) failed: {e}", self.node_type, ne.id);
                    continue;
                }
            };
            let sub_edge = match self.bus.subscribe_edge_points(parent, ne.id).await {
                Ok(s) => s,
                Err(e) => {
                    log::error!(
                        "{}: subscribe_edge_points({parent}, {}) failed: {e}",
                        self.node_type,
                        ne.id
                    );
                    continue;
                }
            };

            let points_fwd = forward(sub_points, points_tx);
            let edge_fwd = forward(sub_edge, edge_points_tx);
            let run_task = tokio::spawn(async move { client.run().await });

            state.live.insert(
                key,
                LiveClient {
                    run_task,
                    points_fwd,
                    edge_fwd,
                    stop_tx,
                },
            );
        }

        let gone: Vec<Key> = state
            .live
            .keys()
            .filter(|k| !seen.contains(k))
            .copied()
            .collect();
        for key in gone {
            if let Some(client) = state.live.remove(&key) {
                // Non-blocking per-client teardown: the next scan must not
                // stall waiting on a departed client's run task, only the
                // overall `stop` enforces the deadline.
                let run_task = client.begin_stop(None);
                tokio::spawn(async move {
                    if tokio::time::timeout(SHUTDOWN_DEADLINE, run_task).await.is_err() {
                        log::error!("client run task did not exit within the shutdown deadline");
                    }
                });
            }
        }
    }
}

/// Pipes a bus subscription's batches into a client's inbound channel,
/// stopping (and, via `Subscription`'s `Drop`, cancelling the bus
/// subscription) once the client's receiver is gone.
fn forward(mut sub: siot_bus::Subscription, tx: mpsc::Sender<Vec<siot_data::Point>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(batch) = sub.recv().await {
            if tx.send(batch).await.is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use siot_bus::MemoryBus;
    use siot_data::error::DecodeError;
    use siot_data::node::NodeEdge;
    use siot_data::point::{types, Point, Points};
    use siot_store::Store;
    use std::sync::atomic::{AtomicUsize, Ordering as AOrdering};

    #[derive(Clone)]
    struct FakeConfig {
        id: NodeID,
        parent: Option<NodeID>,
    }

    impl NodeConfig for FakeConfig {
        const NODE_TYPE: &'static str = "fakeSensor";

        fn id(&self) -> NodeID {
            self.id
        }

        fn parent(&self) -> Option<NodeID> {
            self.parent
        }

        fn decode(ne: &NodeEdge) -> Result<Self, DecodeError> {
            Ok(Self {
                id: ne.id,
                parent: ne.parent,
            })
        }

        fn merge_point(&mut self, _point: &Point) {}

        fn encode(&self) -> Points {
            Points::new()
        }
    }

    struct FakeClient {
        started: Arc<AtomicUsize>,
        stopped: Arc<AtomicUsize>,
        points_rx: mpsc::Receiver<Vec<Point>>,
        edge_points_rx: mpsc::Receiver<Vec<Point>>,
        stop_rx: oneshot::Receiver<Option<String>>,
    }

    #[async_trait]
    impl Client for FakeClient {
        async fn run(&mut self) {
            self.started.fetch_add(1, AOrdering::SeqCst);
            loop {
                tokio::select! {
                    _ = &mut self.stop_rx => break,
                    Some(_) = self.points_rx.recv() => {}
                    Some(_) = self.edge_points_rx.recv() => {}
                }
            }
            self.stopped.fetch_add(1, AOrdering::SeqCst);
        }
    }

    fn make_manager(
        bus: Arc<MemoryBus>,
        root: NodeID,
        started: Arc<AtomicUsize>,
        stopped: Arc<AtomicUsize>,
    ) -> Manager<FakeConfig> {
        let construct: Constructor<FakeConfig> = Arc::new(move |_bus, _config: FakeConfig| {
            let (channels, receivers) = siot_client::channel_pair();
            let client = FakeClient {
                started: started.clone(),
                stopped: stopped.clone(),
                points_rx: receivers.points_rx,
                edge_points_rx: receivers.edge_points_rx,
                stop_rx: receivers.stop_rx,
            };
            (Box::new(client) as Box<dyn Client>, channels)
        });
        Manager::new("fakeSensor", bus, root, construct)
    }

    #[tokio::test]
    async fn scan_starts_a_client_for_a_new_child() {
        let store = Store::temporary().unwrap();
        let bus = MemoryBus::new(store);
        let root = NodeID::new();
        bus.send_node_points(root, vec![]).await.unwrap();
        let child = NodeID::new();
        bus.send_node_points(
            child,
            vec![
                Point::text(types::NODE_TYPE, "fakeSensor"),
                Point::text(types::ADD_PARENT, root.to_string()),
            ],
        )
        .await
        .unwrap();

        let started = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));
        let manager = make_manager(bus, root, started.clone(), stopped.clone());

        manager.scan().await;
        tokio::task::yield_now().await;
        assert_eq!(started.load(AOrdering::SeqCst), 1);
        assert_eq!(manager.state.lock().await.live.len(), 1);
    }

    #[tokio::test]
    async fn scan_stops_a_removed_child_without_blocking() {
        let store = Store::temporary().unwrap();
        let bus = MemoryBus::new(store);
        let root = NodeID::new();
        bus.send_node_points(root, vec![]).await.unwrap();
        let child = NodeID::new();
        bus.send_node_points(
            child,
            vec![
                Point::text(types::NODE_TYPE, "fakeSensor"),
                Point::text(types::ADD_PARENT, root.to_string()),
            ],
        )
        .await
        .unwrap();

        let started = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));
        let manager = make_manager(bus.clone(), root, started.clone(), stopped.clone());
        manager.scan().await;
        assert_eq!(manager.state.lock().await.live.len(), 1);

        bus.send_node_points(child, vec![Point::text(types::REMOVE_PARENT, root.to_string())])
            .await
            .unwrap();

        manager.scan().await;
        assert_eq!(manager.state.lock().await.live.len(), 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(stopped.load(AOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_joins_every_live_client_within_the_deadline() {
        let store = Store::temporary().unwrap();
        let bus = MemoryBus::new(store);
        let root = NodeID::new();
        bus.send_node_points(root, vec![]).await.unwrap();
        let child = NodeID::new();
        bus.send_node_points(
            child,
            vec![
                Point::text(types::NODE_TYPE, "fakeSensor"),
                Point::text(types::ADD_PARENT, root.to_string()),
            ],
        )
        .await
        .unwrap();

        let started = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));
        let manager = make_manager(bus, root, started.clone(), stopped.clone());
        manager.scan().await;

        manager.stop(None).await;
        assert_eq!(stopped.load(AOrdering::SeqCst), 1);
    }
}

//! The `Client` lifecycle contract: `Run` blocking, `Stop(err)`, and point
//! delivery. Point delivery travels over the channels in [`ClientChannels`]
//! rather than as method calls on a running client, since Rust has no safe
//! way for two tasks to call methods on one `&mut self` concurrently — the
//! manager holds the sending halves, the client's `run` loop holds the
//! receiving halves and selects across them alongside its own timers.

use async_trait::async_trait;
use siot_data::Point;
use tokio::sync::{mpsc, oneshot};

/// Bounded so a manager forwarding a subscription can never block forever
/// on a wedged client; a full channel here means the client is falling
/// behind, which is a client bug, not something the manager should absorb
/// unboundedly.
pub const CHANNEL_CAPACITY: usize = 16;

/// The sending halves a [`crate::client::Client`]'s constructor hands back
/// to whoever supervises it (`siot-manager`, or a test harness driving a
/// client directly).
pub struct ClientChannels {
    pub points_tx: mpsc::Sender<Vec<Point>>,
    pub edge_points_tx: mpsc::Sender<Vec<Point>>,
    /// Delivered at most once; `Some(reason)` distinguishes a supervisor
    /// shutdown from an externally reported failure, mirroring `Stop(err)`.
    pub stop_tx: oneshot::Sender<Option<String>>,
}

/// The receiving halves a concrete `Client` keeps for itself. Public so
/// that test doubles and custom clients built outside this crate (see
/// `siot-manager`'s tests) can assemble a [`Client`] with the same
/// channel wiring the real clients use.
pub struct ClientReceivers {
    pub points_rx: mpsc::Receiver<Vec<Point>>,
    pub edge_points_rx: mpsc::Receiver<Vec<Point>>,
    pub stop_rx: oneshot::Receiver<Option<String>>,
}

pub fn channel_pair() -> (ClientChannels, ClientReceivers) {
    let (points_tx, points_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (edge_points_tx, edge_points_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (stop_tx, stop_rx) = oneshot::channel();
    (
        ClientChannels {
            points_tx,
            edge_points_tx,
            stop_tx,
        },
        ClientReceivers {
            points_rx,
            edge_points_rx,
            stop_rx,
        },
    )
}

/// A device client's run loop. `run` returns only once a stop has been
/// observed and all self-spawned work (downloads, in-flight requests) has
/// been drained.
#[async_trait]
pub trait Client: Send {
    async fn run(&mut self);
}

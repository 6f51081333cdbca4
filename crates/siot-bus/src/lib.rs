//! The bus contract: `SendNodePoint(s)`, `SubscribePoints`/
//! `SubscribeEdgePoints`, and `GetNodeChildren`, plus a
//! [`bridge::StoreBridge`] that drives a [`siot_store::Store`] from bus
//! traffic (kept separate so the store and the wire transport don't know
//! about each other).

pub mod bridge;
pub mod bus;
pub mod memory;
pub mod nats;

pub use bridge::StoreBridge;
pub use bus::{subjects, Bus, ChildrenQuery, Subscription};
pub use memory::MemoryBus;
pub use nats::NatsBus;

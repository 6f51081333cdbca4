//! Device clients: the `Client` lifecycle contract, plus two concrete
//! implementations — a polling HTTP client (Shelly) and the OS-update
//! client. The shape (channels in, `Bus` out, `tokio::select!` run loop)
//! follows the async-task idiom used throughout this workspace.

pub mod client;
pub mod shelly;
pub mod update;

pub use client::{channel_pair, Client, ClientChannels, ClientReceivers};
pub use shelly::{ShellyIOClient, ShellyIo};
pub use update::{Update, UpdateClient};

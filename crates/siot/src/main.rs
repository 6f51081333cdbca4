//! `siotd`: opens the graph store, connects to the bus, and runs the
//! supervisors for every device-client node type. This process exposes no
//! HTTP surface. Config is read from environment variables.

use std::env;
use std::sync::Arc;

use siot_bus::{Bus, NatsBus, StoreBridge};
use siot_client::{Client, ShellyIOClient, ShellyIo, Update, UpdateClient};
use siot_data::point::types;
use siot_data::{NodeID, Point};
use siot_manager::{Constructor, Manager};
use siot_store::Store;

const DEFAULT_DATA_DIR: &str = "./siot-data";
const DEFAULT_NATS_URL: &str = "nats://localhost:4222";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let data_dir = env::var("SIOT_DATA_DIR").unwrap_or_else(|_| DEFAULT_DATA_DIR.to_string());
    let nats_url = env::var("SIOT_NATS_URL").unwrap_or_else(|_| DEFAULT_NATS_URL.to_string());

    let store = Store::open(&data_dir)?;
    let root = bootstrap_root(&store).await?;
    log::info!("siotd starting, root node {root}");

    let nats = NatsBus::connect(&nats_url).await?;
    let bridge = StoreBridge::start(&nats, store.clone()).await?;
    let bus: Arc<dyn Bus> = Arc::new(nats);

    let shelly_manager = Manager::new("shellyIo", bus.clone(), root, shelly_constructor());
    let update_manager = Manager::new("update", bus.clone(), root, update_constructor());

    tokio::select! {
        _ = shelly_manager.start() => {}
        _ = update_manager.start() => {}
        _ = tokio::signal::ctrl_c() => {
            log::info!("shutdown requested");
        }
    }

    shelly_manager.stop(None).await;
    update_manager.stop(None).await;
    bridge.stop();
    Ok(())
}

/// The first-ever node written to a fresh store becomes its root; on
/// every later start `Meta.root_id` is already set and is read back
/// instead.
async fn bootstrap_root(store: &Store) -> anyhow::Result<NodeID> {
    if let Some(root) = store.meta().await?.root_id {
        return Ok(root);
    }
    let root = NodeID::new();
    store
        .node_points(root, vec![Point::text(types::NODE_TYPE, "device")])
        .await?;
    Ok(root)
}

fn shelly_constructor() -> Constructor<ShellyIo> {
    Arc::new(|bus, config| {
        let (client, channels) = ShellyIOClient::new(bus, config);
        (Box::new(client) as Box<dyn Client>, channels)
    })
}

fn update_constructor() -> Constructor<Update> {
    Arc::new(|bus, config| {
        let (client, channels) = UpdateClient::new(bus, config);
        (Box::new(client) as Box<dyn Client>, channels)
    })
}

//! Shelly Gen1/Gen2 polling client. Gen1 talks `/settings` and `/light/0`;
//! Gen2 talks the `/rpc/...` surface; both are driven by the same
//! `ShellyIOClient` run loop, dispatching on [`Gen::of`].

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use siot_data::codec::NodeConfig;
use siot_data::error::DecodeError;
use siot_data::node::NodeEdge;
use siot_data::point::{bool_to_float, types, Point, Points};
use siot_data::NodeID;
use siot_bus::Bus;

use crate::client::{channel_pair, Client, ClientChannels};

/// The device-model strings that select Gen1 vs. Gen2 wire behavior.
pub mod device_type {
    pub const BULB_DUO: &str = "shellyTypeBulbDuo";
    pub const RGBW2: &str = "shellyTypeRGBW2";
    pub const ONE_PM: &str = "shellyType1PM";
    pub const PLUG_US: &str = "shellyTypePlugUS";
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Gen {
    Unknown,
    Gen1,
    Gen2,
}

impl Gen {
    fn of(typ: &str) -> Self {
        match typ {
            device_type::BULB_DUO | device_type::RGBW2 | device_type::ONE_PM => Gen::Gen1,
            device_type::PLUG_US => Gen::Gen2,
            _ => Gen::Unknown,
        }
    }
}

/// Configuration/state of one Shelly device.
#[derive(Clone, Debug, Default)]
pub struct ShellyIo {
    pub id: NodeID,
    pub parent: Option<NodeID>,
    pub description: String,
    pub device_id: String,
    pub typ: String,
    pub ip: String,
}

impl NodeConfig for ShellyIo {
    const NODE_TYPE: &'static str = "shellyIo";

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
            description: ne.points.text(types::DESCRIPTION, "0").unwrap_or("").to_string(),
            device_id: ne.points.text(types::DEVICE_ID, "0").unwrap_or("").to_string(),
            typ: ne.points.text(types::TYPE, "0").unwrap_or("").to_string(),
            ip: ne.points.text(types::IP, "0").unwrap_or("").to_string(),
        })
    }

    fn merge_point(&mut self, point: &Point) {
        match point.typ.as_str() {
            types::DESCRIPTION => self.description = point.text.clone(),
            types::DEVICE_ID => self.device_id = point.text.clone(),
            types::TYPE => self.typ = point.text.clone(),
            types::IP => self.ip = point.text.clone(),
            _ => {}
        }
    }

    fn encode(&self) -> Points {
        Points::from(vec![
            Point::text(types::DESCRIPTION, &self.description),
            Point::text(types::DEVICE_ID, &self.device_id),
            Point::text(types::TYPE, &self.typ),
            Point::text(types::IP, &self.ip),
        ])
    }
}

impl ShellyIo {
    /// Type, optionally suffixed with the user-assigned description.
    fn desc(&self) -> String {
        if self.description.is_empty() {
            self.typ.clone()
        } else {
            format!("{}:{}", self.typ, self.description)
        }
    }
}

#[derive(Deserialize, Default)]
struct Gen1Settings {
    #[serde(default)]
    name: String,
}

#[derive(Deserialize, Default)]
struct Gen2SysConfig {
    #[serde(default)]
    device: Gen2Device,
}

#[derive(Deserialize, Default)]
struct Gen2Device {
    #[serde(default)]
    name: String,
}

#[derive(Deserialize)]
struct Gen2Response {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize, Default)]
struct Gen2SwitchStatus {
    #[serde(default)]
    output: bool,
    #[serde(default)]
    apower: f64,
    #[serde(default)]
    voltage: f64,
    #[serde(default)]
    current: f64,
    #[serde(default)]
    temperature: Gen2Temperature,
}

#[derive(Deserialize, Default)]
struct Gen2Temperature {
    #[serde(rename = "tC", default)]
    t_c: f64,
}

impl Gen2SwitchStatus {
    fn to_points(&self) -> Vec<Point> {
        vec![
            Point::new(types::VALUE, bool_to_float(self.output)),
            Point::new(types::POWER, self.apower),
            Point::new(types::VOLTAGE, self.voltage),
            Point::new(types::CURRENT, self.current),
            Point::new(types::TEMPERATURE, self.temperature.t_c),
        ]
    }
}

#[derive(Deserialize, Default)]
struct Gen1LightStatus {
    #[serde(default)]
    ison: bool,
    #[serde(default)]
    brightness: f64,
    #[serde(default)]
    white: f64,
    #[serde(default)]
    temp: f64,
    #[serde(default)]
    transition: f64,
}

impl Gen1LightStatus {
    fn to_points(&self) -> Vec<Point> {
        vec![
            Point::new(types::VALUE, bool_to_float(self.ison)),
            Point::new(types::BRIGHTNESS, self.brightness),
            Point::new(types::WHITE, self.white),
            Point::new(types::LIGHT_TEMP, self.temp),
            Point::new(types::TRANSITION, self.transition),
        ]
    }
}

const SYNC_CONFIG_PERIOD: Duration = Duration::from_secs(5 * 60);
const SAMPLE_PERIOD: Duration = Duration::from_secs(2);
const CHANGED_WINDOW: chrono::Duration = chrono::Duration::minutes(15);

pub struct ShellyIOClient {
    bus: Arc<dyn Bus>,
    http: reqwest::Client,
    config: ShellyIo,
    points: Points,
    points_rx: tokio::sync::mpsc::Receiver<Vec<Point>>,
    edge_points_rx: tokio::sync::mpsc::Receiver<Vec<Point>>,
    stop_rx: tokio::sync::oneshot::Receiver<Option<String>>,
}

impl ShellyIOClient {
    pub fn new(bus: Arc<dyn Bus>, config: ShellyIo) -> (Self, ClientChannels) {
        let (channels, receivers) = channel_pair();
        let points = config.encode();
        let client = Self {
            bus,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            config,
            points,
            points_rx: receivers.points_rx,
            edge_points_rx: receivers.edge_points_rx,
            stop_rx: receivers.stop_rx,
        };
        (client, channels)
    }

    async fn get_config(&self) -> anyhow::Result<Gen1Settings> {
        match Gen::of(&self.config.typ) {
            Gen::Gen1 => {
                let resp = self
                    .http
                    .get(format!("http://{}/settings", self.config.ip))
                    .send()
                    .await?
                    .error_for_status()?;
                Ok(resp.json().await?)
            }
            Gen::Gen2 => {
                let resp = self
                    .http
                    .get(format!("http://{}/rpc/Sys.GetConfig", self.config.ip))
                    .send()
                    .await?
                    .error_for_status()?;
                let config: Gen2SysConfig = resp.json().await?;
                Ok(Gen1Settings {
                    name: config.device.name,
                })
            }
            Gen::Unknown => anyhow::bail!("unsupported device: {}", self.config.typ),
        }
    }

    async fn set_name(&self, name: &str) -> anyhow::Result<()> {
        match Gen::of(&self.config.typ) {
            Gen::Gen1 => {
                self.http
                    .get(format!("http://{}/settings?name={name}", self.config.ip))
                    .send()
                    .await?
                    .error_for_status()?;
                Ok(())
            }
            Gen::Gen2 => {
                let config = format!(r#"{{"device":{{"name":"{name}"}}}}"#);
                let resp = self
                    .http
                    .get(format!("http://{}/rpc/Sys.Setconfig?config={config}", self.config.ip))
                    .send()
                    .await?
                    .error_for_status()?;
                let ret: Gen2Response = resp.json().await?;
                if ret.code != 0 || !ret.message.is_empty() {
                    anyhow::bail!("error setting shelly device name: {}", ret.message);
                }
                Ok(())
            }
            Gen::Unknown => anyhow::bail!("unsupported device: {}", self.config.typ),
        }
    }

    async fn get_status(&self) -> anyhow::Result<Vec<Point>> {
        match self.config.typ.as_str() {
            device_type::PLUG_US => {
                let resp = self
                    .http
                    .get(format!("http://{}/rpc/Switch.GetStatus?id=0", self.config.ip))
                    .send()
                    .await?
                    .error_for_status()?;
                let status: Gen2SwitchStatus = resp.json().await?;
                Ok(status.to_points())
            }
            device_type::BULB_DUO => {
                let resp = self
                    .http
                    .get(format!("http://{}/light/0", self.config.ip))
                    .send()
                    .await?
                    .error_for_status()?;
                let status: Gen1LightStatus = resp.json().await?;
                Ok(status.to_points())
            }
            _ => Ok(Vec::new()),
        }
    }

    async fn publish_error(&self, err: anyhow::Error) {
        log::error!("{}: {err}", self.config.desc());
        let _ = self
            .bus
            .send_node_points(self.config.id, vec![Point::text(types::ERROR, err.to_string())])
            .await;
    }

    /// Reads the device's own name and reconciles it with the node's
    /// description in whichever direction is empty.
    async fn sync_config(&mut self) {
        let config = match self.get_config().await {
            Ok(c) => c,
            Err(e) => {
                self.publish_error(e).await;
                return;
            }
        };

        if self.config.description.is_empty() && !config.name.is_empty() {
            self.config.description = config.name.clone();
            let _ = self
                .bus
                .send_node_points(self.config.id, vec![Point::text(types::DESCRIPTION, &config.name)])
                .await;
        } else if self.config.description != config.name {
            if let Err(e) = self.set_name(&self.config.description).await {
                self.publish_error(e).await;
            }
        }
    }

    async fn sample(&mut self) {
        let status = match self.get_status().await {
            Ok(p) => p,
            Err(e) => {
                self.publish_error(e).await;
                return;
            }
        };
        let fresh = Points::from(status);
        let changed = self.points.changed_since(&fresh, CHANGED_WINDOW);
        if changed.is_empty() {
            return;
        }
        for p in &changed {
            self.points.process_point(p.clone());
        }
        if let Err(e) = self.bus.send_node_points(self.config.id, changed).await {
            log::error!("{}: error sending sampled points: {e}", self.config.desc());
        }
    }
}

#[async_trait::async_trait]
impl Client for ShellyIOClient {
    async fn run(&mut self) {
        log::info!("starting shelly IO client: {}", self.config.desc());
        self.sync_config().await;

        let mut sync_config_ticker = tokio::time::interval(SYNC_CONFIG_PERIOD);
        sync_config_ticker.tick().await; // consume the immediate first tick
        let mut sample_ticker = tokio::time::interval(SAMPLE_PERIOD);
        sample_ticker.tick().await;

        loop {
            tokio::select! {
                _ = &mut self.stop_rx => break,
                Some(points) = self.points_rx.recv() => {
                    let resync = points.iter().any(|p| p.typ == types::DESCRIPTION);
                    siot_data::codec::merge_points(&mut self.config, &points);
                    if resync {
                        self.sync_config().await;
                    }
                }
                Some(points) = self.edge_points_rx.recv() => {
                    siot_data::codec::merge_edge_points(&mut self.config, &points);
                }
                _ = sync_config_ticker.tick() => self.sync_config().await,
                _ = sample_ticker.tick() => self.sample().await,
            }
        }
        log::info!("stopping shelly IO client: {}", self.config.desc());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_node_edge() -> NodeEdge {
        NodeEdge {
            id: NodeID::new(),
            typ: "shellyIo".to_string(),
            points: Points::from(vec![
                Point::text(types::DESCRIPTION, "kitchen plug"),
                Point::text(types::DEVICE_ID, "shellyplug-abc123"),
                Point::text(types::TYPE, device_type::PLUG_US),
                Point::text(types::IP, "192.168.1.42"),
            ]),
            edge_points: Points::new(),
            parent: Some(NodeID::new()),
            hash: [0u8; 16],
        }
    }

    #[test]
    fn decode_then_encode_roundtrips() {
        let ne = sample_node_edge();
        let config = ShellyIo::decode(&ne).unwrap();
        let encoded = config.encode();
        assert_eq!(encoded.text(types::DESCRIPTION, "0"), Some("kitchen plug"));
        assert_eq!(encoded.text(types::DEVICE_ID, "0"), Some("shellyplug-abc123"));
        assert_eq!(encoded.text(types::TYPE, "0"), Some(device_type::PLUG_US));
        assert_eq!(encoded.text(types::IP, "0"), Some("192.168.1.42"));

        let redecoded = ShellyIo::decode(&NodeEdge { points: encoded, ..ne }).unwrap();
        assert_eq!(redecoded.description, config.description);
        assert_eq!(redecoded.device_id, config.device_id);
        assert_eq!(redecoded.typ, config.typ);
        assert_eq!(redecoded.ip, config.ip);
    }

    #[test]
    fn gen_dispatch_matches_device_type() {
        assert_eq!(Gen::of(device_type::PLUG_US), Gen::Gen2);
        assert_eq!(Gen::of(device_type::BULB_DUO), Gen::Gen1);
        assert_eq!(Gen::of(device_type::RGBW2), Gen::Gen1);
        assert_eq!(Gen::of(device_type::ONE_PM), Gen::Gen1);
        assert_eq!(Gen::of("somethingElse"), Gen::Unknown);
    }

    #[test]
    fn desc_falls_back_to_type_when_description_empty() {
        let config = ShellyIo {
            typ: device_type::PLUG_US.to_string(),
            ..Default::default()
        };
        assert_eq!(config.desc(), device_type::PLUG_US);
    }
}

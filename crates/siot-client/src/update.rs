//! OS update client. Polls a remote index of `.upd` artifacts, optionally
//! auto-downloads newer ones, and can trigger a reboot — the one client in
//! this workspace that talks to the filesystem and the OS instead of a
//! device over HTTP.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use semver::Version;
use siot_data::codec::NodeConfig;
use siot_data::error::DecodeError;
use siot_data::node::NodeEdge;
use siot_data::point::{types, Point, Points};
use siot_data::NodeID;
use siot_bus::Bus;
use tokio::io::AsyncWriteExt;

use crate::client::{channel_pair, Client, ClientChannels};

/// Config/state of one update client. `Refresh`/`AutoDownload`/`AutoReboot`
/// travel as `Point.value != 0` rather than a dedicated boolean wire type,
/// same as everywhere else non-zero-means-true is used in this workspace.
#[derive(Clone, Debug, Default)]
pub struct Update {
    pub id: NodeID,
    pub parent: Option<NodeID>,
    pub description: String,
    pub version_os: String,
    pub uri: String,
    pub os_updates: Vec<String>,
    pub download_os: String,
    pub os_downloaded: String,
    pub prefix: String,
    pub directory: String,
    pub poll_period: i64,
    pub auto_download: bool,
    pub auto_reboot: bool,
}

impl NodeConfig for Update {
    const NODE_TYPE: &'static str = "update";

    fn id(&self) -> NodeID {
        self.id
    }

    fn parent(&self) -> Option<NodeID> {
        self.parent
    }

    fn decode(ne: &NodeEdge) -> Result<Self, DecodeError> {
        let mut os_updates: Vec<(usize, String)> = ne
            .points
            .iter()
            .filter(|p| p.typ == types::OS_UPDATE && !p.is_tombstone())
            .filter_map(|p| p.key.parse::<usize>().ok().map(|k| (k, p.text.clone())))
            .collect();
        os_updates.sort_by_key(|(k, _)| *k);

        Ok(Self {
            id: ne.id,
            parent: ne.parent,
            description: ne.points.text(types::DESCRIPTION, "0").unwrap_or("").to_string(),
            version_os: ne.points.text(types::VERSION_OS, "0").unwrap_or("").to_string(),
            uri: ne.points.text(types::URI, "0").unwrap_or("").to_string(),
            os_updates: os_updates.into_iter().map(|(_, v)| v).collect(),
            download_os: ne.points.text(types::DOWNLOAD_OS, "0").unwrap_or("").to_string(),
            os_downloaded: ne.points.text(types::OS_DOWNLOADED, "0").unwrap_or("").to_string(),
            prefix: ne.points.text(types::PREFIX, "0").unwrap_or("").to_string(),
            directory: ne.points.text(types::DIRECTORY, "0").unwrap_or("").to_string(),
            poll_period: ne.points.value(types::POLL_PERIOD, "0").unwrap_or(0.0) as i64,
            auto_download: ne.points.value(types::AUTO_DOWNLOAD, "0").unwrap_or(0.0) != 0.0,
            auto_reboot: ne.points.value(types::AUTO_REBOOT, "0").unwrap_or(0.0) != 0.0,
        })
    }

    fn merge_point(&mut self, point: &Point) {
        match point.typ.as_str() {
            types::DESCRIPTION => self.description = point.text.clone(),
            types::VERSION_OS => self.version_os = point.text.clone(),
            types::URI => self.uri = point.text.clone(),
            types::OS_UPDATE => {
                if let Ok(idx) = point.key.parse::<usize>() {
                    if point.is_tombstone() {
                        if idx < self.os_updates.len() {
                            self.os_updates.remove(idx);
                        }
                    } else {
                        if idx >= self.os_updates.len() {
                            self.os_updates.resize(idx + 1, String::new());
                        }
                        self.os_updates[idx] = point.text.clone();
                    }
                }
            }
            types::DOWNLOAD_OS => self.download_os = point.text.clone(),
            types::OS_DOWNLOADED => self.os_downloaded = point.text.clone(),
            types::PREFIX => self.prefix = point.text.clone(),
            types::DIRECTORY => self.directory = point.text.clone(),
            types::POLL_PERIOD => self.poll_period = point.value as i64,
            types::AUTO_DOWNLOAD => self.auto_download = point.value != 0.0,
            types::AUTO_REBOOT => self.auto_reboot = point.value != 0.0,
            _ => {}
        }
    }

    fn encode(&self) -> Points {
        let mut pts = vec![
            Point::text(types::DESCRIPTION, &self.description),
            Point::text(types::VERSION_OS, &self.version_os),
            Point::text(types::URI, &self.uri),
            Point::text(types::DOWNLOAD_OS, &self.download_os),
            Point::text(types::OS_DOWNLOADED, &self.os_downloaded),
            Point::text(types::PREFIX, &self.prefix),
            Point::text(types::DIRECTORY, &self.directory),
            Point::new(types::POLL_PERIOD, self.poll_period as f64),
            Point::bool(types::AUTO_DOWNLOAD, self.auto_download),
            Point::bool(types::AUTO_REBOOT, self.auto_reboot),
        ];
        for (i, v) in self.os_updates.iter().enumerate() {
            pts.push(Point::text(types::OS_UPDATE, v).with_key(i.to_string()));
        }
        Points::from(pts)
    }
}

/// Matches `<prefix>_<semver>.upd` filenames.
fn upd_pattern() -> Regex {
    Regex::new(r"^(.*)_(\d+\.\d+\.\d+)\.upd$").expect("static regex")
}

const DEFAULT_POLL_PERIOD_MINUTES: i64 = 30;
const DEFAULT_DIRECTORY: &str = "/data";

pub struct UpdateClient {
    bus: Arc<dyn Bus>,
    http: reqwest::Client,
    config: Update,
    points_rx: tokio::sync::mpsc::Receiver<Vec<Point>>,
    edge_points_rx: tokio::sync::mpsc::Receiver<Vec<Point>>,
    stop_rx: tokio::sync::oneshot::Receiver<Option<String>>,
    download_done_tx: tokio::sync::mpsc::Sender<Result<(), String>>,
    download_done_rx: tokio::sync::mpsc::Receiver<Result<(), String>>,
}

impl UpdateClient {
    pub fn new(bus: Arc<dyn Bus>, config: Update) -> (Self, ClientChannels) {
        let (channels, receivers) = channel_pair();
        let (download_done_tx, download_done_rx) = tokio::sync::mpsc::channel(4);
        let client = Self {
            bus,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            config,
            points_rx: receivers.points_rx,
            edge_points_rx: receivers.edge_points_rx,
            stop_rx: receivers.stop_rx,
            download_done_tx,
            download_done_rx,
        };
        (client, channels)
    }

    async fn set_error(&self, err: Option<String>) {
        let text = err.unwrap_or_default();
        if !text.is_empty() {
            log::error!("update client {}: {text}", self.config.id);
        }
        let _ = self
            .bus
            .send_node_points(self.config.id, vec![Point::text(types::ERROR, text)])
            .await;
    }

    async fn publish(&mut self, points: Vec<Point>) {
        siot_data::codec::merge_points(&mut self.config, &points);
        if let Err(e) = self.bus.send_node_points(self.config.id, points).await {
            log::error!("update client {}: error publishing points: {e}", self.config.id);
        }
    }

    /// Back-fills `prefix`/`directory`/`pollPeriod` when unset, before
    /// anything else runs.
    async fn backfill_defaults(&mut self) {
        if self.config.prefix.is_empty() {
            if let Ok(hostname) = hostname() {
                self.publish(vec![Point::text(types::PREFIX, &hostname)]).await;
            }
        }
        if self.config.directory.is_empty() {
            self.publish(vec![Point::text(types::DIRECTORY, DEFAULT_DIRECTORY)]).await;
        }
        if self.config.poll_period <= 0 {
            self.publish(vec![Point::new(types::POLL_PERIOD, DEFAULT_POLL_PERIOD_MINUTES as f64)])
                .await;
        }
    }

    /// Fetches `<uri>/files.txt`, parses `<prefix>_<semver>.upd` lines, and
    /// publishes the sorted list as indexed `osUpdate` points, tombstoning
    /// whatever no longer fits.
    async fn get_updates(&mut self) -> anyhow::Result<()> {
        let url = format!("{}/files.txt", self.config.uri.trim_end_matches('/'));
        let body = match self.http.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => resp.text().await?,
            Ok(resp) => {
                self.clear_update_list().await;
                anyhow::bail!("error getting updates: {}", resp.status());
            }
            Err(e) => {
                self.clear_update_list().await;
                return Err(e.into());
            }
        };

        let re = upd_pattern();
        let mut versions: Vec<Version> = body
            .lines()
            .filter(|l| l.starts_with(&self.config.prefix))
            .filter_map(|l| re.captures(l))
            .filter(|caps| &caps[1] == self.config.prefix)
            .filter_map(|caps| Version::parse(&caps[2]).ok())
            .collect();
        versions.sort();

        let previous_len = self.config.os_updates.len();
        let mut pts: Vec<Point> = versions
            .iter()
            .enumerate()
            .map(|(i, v)| Point::text(types::OS_UPDATE, v.to_string()).with_key(i.to_string()))
            .collect();
        for i in versions.len()..previous_len {
            pts.push(Point::new(types::OS_UPDATE, 0.0).with_key(i.to_string()).tombstone());
        }
        if !pts.is_empty() {
            self.publish(pts).await;
        }
        Ok(())
    }

    async fn clear_update_list(&mut self) {
        let pts: Vec<Point> = (0..self.config.os_updates.len())
            .map(|i| Point::new(types::OS_UPDATE, 0.0).with_key(i.to_string()).tombstone())
            .collect();
        if !pts.is_empty() {
            self.publish(pts).await;
        }
    }

    /// Scans `directory` for `.upd` files and publishes the newest version
    /// found as `osDownloaded`.
    async fn check_downloads(&mut self) -> anyhow::Result<()> {
        let versions = self.local_versions().await?;
        let newest = versions.last().map(|v| v.to_string()).unwrap_or_default();
        self.publish(vec![Point::text(types::OS_DOWNLOADED, &newest)]).await;
        Ok(())
    }

    async fn local_versions(&self) -> anyhow::Result<Vec<Version>> {
        let re = upd_pattern();
        let mut entries = tokio::fs::read_dir(&self.config.directory).await?;
        let mut versions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(caps) = re.captures(name) else { continue };
            if &caps[1] != self.config.prefix {
                continue;
            }
            if let Ok(v) = Version::parse(&caps[2]) {
                versions.push(v);
            }
        }
        versions.sort();
        Ok(versions)
    }

    /// Deletes every local `.upd` file.
    async fn clean_downloads(&mut self) -> anyhow::Result<()> {
        let mut entries = tokio::fs::read_dir(&self.config.directory).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if name.to_str().map(|n| n.ends_with(".upd")).unwrap_or(false) {
                let _ = tokio::fs::remove_file(entry.path()).await;
            }
        }
        self.publish(vec![Point::text(types::OS_DOWNLOADED, "")]).await;
        self.publish(vec![Point::new(types::DISCARD_DOWNLOAD, 0.0)]).await;
        Ok(())
    }

    /// Spawns the download as a detached task; it reports back over
    /// `download_done_tx` so the run loop (not the task) performs the
    /// follow-up check-downloads/reboot, keeping `&mut self.config` single
    /// owner.
    fn spawn_download(&self, version: String) {
        let bus = self.bus.clone();
        let http = self.http.clone();
        let id = self.config.id;
        let uri = self.config.uri.trim_end_matches('/').to_string();
        let prefix = self.config.prefix.clone();
        let directory = self.config.directory.clone();
        let done_tx = self.download_done_tx.clone();

        tokio::spawn(async move {
            let result = download_one(&http, &uri, &prefix, &directory, &version).await;
            let _ = bus
                .send_node_points(id, vec![Point::text(types::DOWNLOAD_OS, "")])
                .await;
            let _ = done_tx.send(result.map_err(|e| e.to_string())).await;
        });
    }

    async fn auto_download(&mut self) {
        let Some(newest) = self.config.os_updates.last().cloned() else {
            return;
        };
        let (Ok(current), Ok(newest_v)) = (
            Version::parse(&self.config.version_os),
            Version::parse(&newest),
        ) else {
            return;
        };
        if newest_v > current && newest != self.config.os_downloaded && newest != self.config.download_os {
            self.publish(vec![Point::text(types::DOWNLOAD_OS, &newest)]).await;
            self.spawn_download(newest);
        }
    }

    async fn do_reboot(&self) {
        match tokio::process::Command::new("reboot").status().await {
            Ok(_) => log::info!("rebooting..."),
            Err(e) => log::error!("error rebooting: {e}"),
        }
    }
}

async fn download_one(
    http: &reqwest::Client,
    uri: &str,
    prefix: &str,
    directory: &str,
    version: &str,
) -> anyhow::Result<()> {
    let filename = format!("{prefix}_{version}.upd");
    let url = format!("{uri}/{filename}");
    let dest: PathBuf = PathBuf::from(directory).join(&filename);

    let resp = http.get(&url).send().await?.error_for_status()?;
    let bytes = resp.bytes().await?;
    if bytes.is_empty() {
        anyhow::bail!("failed to download: {url}");
    }
    let mut out = tokio::fs::File::create(&dest).await?;
    out.write_all(&bytes).await?;
    Ok(())
}

fn hostname() -> std::io::Result<String> {
    Ok(std::env::var("HOSTNAME")
        .or_else(|_| std::fs::read_to_string("/etc/hostname").map(|s| s.trim().to_string()))
        .unwrap_or_default())
}

/// The `VERSION_ID` line of `/etc/os-release`.
async fn read_os_version() -> Option<String> {
    let content = tokio::fs::read_to_string("/etc/os-release").await.ok()?;
    content.lines().find_map(|l| {
        l.strip_prefix("VERSION_ID=")
            .map(|v| v.trim_matches('"').to_string())
    })
}

#[async_trait::async_trait]
impl Client for UpdateClient {
    async fn run(&mut self) {
        self.backfill_defaults().await;

        self.set_error(None).await;
        if let Err(e) = self.get_updates().await {
            self.set_error(Some(e.to_string())).await;
        }
        if let Err(e) = self.check_downloads().await {
            self.set_error(Some(e.to_string())).await;
        }

        if let Some(version) = read_os_version().await {
            self.publish(vec![Point::text(types::VERSION_OS, &version)]).await;
        }

        if !self.config.download_os.is_empty() {
            self.spawn_download(self.config.download_os.clone());
        }

        if self.config.auto_download {
            self.set_error(None).await;
            if let Err(e) = self.get_updates().await {
                self.set_error(Some(e.to_string())).await;
            } else {
                self.auto_download().await;
            }
        }

        let mut check_ticker =
            tokio::time::interval(Duration::from_secs((self.config.poll_period.max(1) as u64) * 60));
        check_ticker.tick().await;

        loop {
            tokio::select! {
                _ = &mut self.stop_rx => break,
                Some(points) = self.points_rx.recv() => {
                    self.handle_points(points, &mut check_ticker).await;
                }
                Some(points) = self.edge_points_rx.recv() => {
                    siot_data::codec::merge_edge_points(&mut self.config, &points);
                }
                Some(result) = self.download_done_rx.recv() => {
                    if let Err(e) = &result {
                        self.set_error(Some(e.clone())).await;
                    }
                    if let Err(e) = self.check_downloads().await {
                        self.set_error(Some(e.to_string())).await;
                    }
                    if self.config.auto_reboot {
                        tokio::time::sleep(Duration::from_secs(2)).await;
                        self.do_reboot().await;
                    }
                }
                _ = check_ticker.tick() => {
                    self.set_error(None).await;
                    if let Err(e) = self.get_updates().await {
                        self.set_error(Some(e.to_string())).await;
                    } else {
                        if self.config.auto_download {
                            self.auto_download().await;
                        }
                        if let Err(e) = self.check_downloads().await {
                            self.set_error(Some(e.to_string())).await;
                        }
                    }
                }
            }
        }
    }
}

impl UpdateClient {
    async fn handle_points(&mut self, points: Vec<Point>, check_ticker: &mut tokio::time::Interval) {
        for p in &points {
            match p.typ.as_str() {
                types::DOWNLOAD_OS if !p.text.is_empty() => self.spawn_download(p.text.clone()),
                types::DISCARD_DOWNLOAD if p.value != 0.0 => {
                    self.set_error(None).await;
                    if let Err(e) = self.clean_downloads().await {
                        self.set_error(Some(format!("error cleaning downloads: {e}"))).await;
                    }
                    if let Err(e) = self.check_downloads().await {
                        self.set_error(Some(e.to_string())).await;
                    }
                }
                types::REBOOT => {
                    self.publish(vec![Point::new(types::REBOOT, 0.0)]).await;
                    self.do_reboot().await;
                }
                types::REFRESH => {
                    self.publish(vec![Point::new(types::REFRESH, 0.0)]).await;
                    self.set_error(None).await;
                    if let Err(e) = self.get_updates().await {
                        self.set_error(Some(e.to_string())).await;
                    }
                }
                types::POLL_PERIOD => {
                    *check_ticker = tokio::time::interval(Duration::from_secs((p.value.max(1.0) as u64) * 60));
                    check_ticker.tick().await;
                }
                types::AUTO_DOWNLOAD if p.value != 0.0 => {
                    self.set_error(None).await;
                    if let Err(e) = self.get_updates().await {
                        self.set_error(Some(e.to_string())).await;
                    } else {
                        self.auto_download().await;
                    }
                }
                types::PREFIX => {
                    self.set_error(None).await;
                    if let Err(e) = self.clean_downloads().await {
                        self.set_error(Some(format!("error cleaning downloads: {e}"))).await;
                    }
                    if let Err(e) = self.check_downloads().await {
                        self.set_error(Some(e.to_string())).await;
                    }
                    if let Err(e) = self.get_updates().await {
                        self.set_error(Some(e.to_string())).await;
                    }
                }
                types::URI => {
                    self.set_error(None).await;
                    if let Err(e) = self.get_updates().await {
                        self.set_error(Some(e.to_string())).await;
                    }
                }
                _ => {}
            }
        }
        siot_data::codec::merge_points(&mut self.config, &points);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use siot_data::point::types;

    fn sample_node_edge() -> NodeEdge {
        NodeEdge {
            id: NodeID::new(),
            typ: "update".to_string(),
            points: Points::from(vec![
                Point::text(types::PREFIX, "myhost"),
                Point::text(types::DIRECTORY, "/data"),
                Point::new(types::POLL_PERIOD, 30.0),
                Point::text(types::OS_UPDATE, "1.0.0").with_key("0"),
                Point::text(types::OS_UPDATE, "1.2.0").with_key("1"),
            ]),
            edge_points: Points::new(),
            parent: None,
            hash: [0u8; 16],
        }
    }

    #[test]
    fn decode_reads_indexed_os_updates_in_key_order() {
        let config = Update::decode(&sample_node_edge()).unwrap();
        assert_eq!(config.os_updates, vec!["1.0.0", "1.2.0"]);
        assert_eq!(config.poll_period, 30);
        assert_eq!(config.prefix, "myhost");
    }

    #[test]
    fn merge_point_tombstones_indexed_entry() {
        let mut config = Update::decode(&sample_node_edge()).unwrap();
        config.merge_point(&Point::new(types::OS_UPDATE, 0.0).with_key("0").tombstone());
        assert_eq!(config.os_updates, vec!["1.2.0"]);
    }

    #[test]
    fn decode_then_encode_roundtrips() {
        let ne = sample_node_edge();
        let config = Update::decode(&ne).unwrap();
        let encoded = config.encode();
        let redecoded = Update::decode(&NodeEdge { points: encoded, ..ne }).unwrap();
        assert_eq!(redecoded.prefix, config.prefix);
        assert_eq!(redecoded.directory, config.directory);
        assert_eq!(redecoded.poll_period, config.poll_period);
        assert_eq!(redecoded.os_updates, config.os_updates);
    }

    #[test]
    fn upd_pattern_matches_prefixed_semver_filename() {
        let re = upd_pattern();
        let caps = re.captures("myhost_1.2.3.upd").unwrap();
        assert_eq!(&caps[1], "myhost");
        assert_eq!(&caps[2], "1.2.3");
        assert!(re.captures("not-a-match").is_none());
    }
}

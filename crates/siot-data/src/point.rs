//! [`Point`]: a timestamped, typed observation keyed within a node or edge by
//! `(Type, Key)`.

use std::ops::{Deref, DerefMut};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single timestamped observation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// What kind of observation this is, e.g. `"value"`, `"description"`.
    #[serde(rename = "type")]
    pub typ: String,
    /// Distinguishes multiple points of the same `Type` on one node/edge.
    /// Defaults to `"0"`.
    #[serde(default = "default_key")]
    pub key: String,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub value: f64,
    #[serde(default)]
    pub text: String,
    /// Non-zero marks this point (and, on an edge, the edge itself when the
    /// type is `tombstone`) as logically deleted.
    #[serde(default)]
    pub tombstone: i32,
}

fn default_key() -> String {
    "0".to_string()
}

impl Point {
    pub fn new(typ: impl Into<String>, value: f64) -> Self {
        Self {
            typ: typ.into(),
            key: default_key(),
            time: Utc::now(),
            value,
            text: String::new(),
            tombstone: 0,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.time = time;
        self
    }

    /// Marks this point tombstoned (builder-style, for the indexed-list
    /// deletion points the update client sends — see
    /// `siot_client::update::UpdateClient`).
    pub fn tombstone(mut self) -> Self {
        self.tombstone = 1;
        self
    }

    pub fn text(typ: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            typ: typ.into(),
            key: default_key(),
            time: Utc::now(),
            value: 0.0,
            text: text.into(),
            tombstone: 0,
        }
    }

    pub fn bool(typ: impl Into<String>, b: bool) -> Self {
        Self::new(typ, bool_to_float(b))
    }

    pub fn is_tombstone(&self) -> bool {
        self.tombstone != 0
    }

    fn key_eq(&self, other: &Point) -> bool {
        self.typ == other.typ && self.key == other.key
    }
}

pub fn bool_to_float(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

pub fn float_to_bool(v: f64) -> bool {
    v != 0.0
}

/// An ordered, `(Type, Key)`-unique set of [`Point`]s.
///
/// A node's or edge's point list is always kept sorted by `(Type, Key)`, and
/// [`Points::process_point`] implements the "replace if present, else
/// append, then re-sort" update rule every mutation goes through.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Points(pub Vec<Point>);

impl Points {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Replaces the point sharing this point's `(Type, Key)` if one exists,
    /// otherwise appends it, then restores sort order.
    pub fn process_point(&mut self, point: Point) {
        if let Some(existing) = self.0.iter_mut().find(|p| p.key_eq(&point)) {
            *existing = point;
        } else {
            self.0.push(point);
        }
        self.sort();
    }

    pub fn sort(&mut self) {
        self.0.sort_by(|a, b| (&a.typ, &a.key).cmp(&(&b.typ, &b.key)));
    }

    pub fn get(&self, typ: &str, key: &str) -> Option<&Point> {
        self.0.iter().find(|p| p.typ == typ && p.key == key)
    }

    pub fn value(&self, typ: &str, key: &str) -> Option<f64> {
        self.get(typ, key).map(|p| p.value)
    }

    pub fn text(&self, typ: &str, key: &str) -> Option<&str> {
        self.get(typ, key).map(|p| p.text.as_str())
    }

    /// Returns points whose value/text changed since the previous sample, or
    /// whose last update is older than `max_age`. Used by polling device
    /// clients to decide which freshly sampled points are worth publishing
    /// even when nothing changed.
    pub fn changed_since(&self, fresh: &Points, max_age: chrono::Duration) -> Vec<Point> {
        let now = Utc::now();
        let mut out = Vec::new();
        for p in &fresh.0 {
            match self.get(&p.typ, &p.key) {
                Some(old) if old.value == p.value && old.text == p.text => {
                    if now - old.time > max_age {
                        out.push(p.clone());
                    }
                }
                _ => out.push(p.clone()),
            }
        }
        out
    }
}

impl Deref for Points {
    type Target = Vec<Point>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Points {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<Vec<Point>> for Points {
    fn from(mut v: Vec<Point>) -> Self {
        v.sort_by(|a, b| (&a.typ, &a.key).cmp(&(&b.typ, &b.key)));
        Self(v)
    }
}

impl IntoIterator for Points {
    type Item = Point;
    type IntoIter = std::vec::IntoIter<Point>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Points {
    type Item = &'a Point;
    type IntoIter = std::slice::Iter<'a, Point>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// The recognized point types, as flat constants.
pub mod types {
    pub const DESCRIPTION: &str = "description";
    pub const NODE_TYPE: &str = "nodeType";
    pub const ADD_PARENT: &str = "addParent";
    pub const REMOVE_PARENT: &str = "removeParent";
    pub const TOMBSTONE: &str = "tombstone";
    pub const DOWNLOAD_OS: &str = "downloadOS";
    pub const DISCARD_DOWNLOAD: &str = "discardDownload";
    pub const REBOOT: &str = "reboot";
    pub const REFRESH: &str = "refresh";
    pub const POLL_PERIOD: &str = "pollPeriod";
    pub const AUTO_DOWNLOAD: &str = "autoDownload";
    pub const AUTO_REBOOT: &str = "autoReboot";
    pub const PREFIX: &str = "prefix";
    pub const DIRECTORY: &str = "directory";
    pub const URI: &str = "uri";
    pub const OS_UPDATE: &str = "osUpdate";
    pub const OS_DOWNLOADED: &str = "osDownloaded";
    pub const VERSION_OS: &str = "versionOS";
    pub const ERROR: &str = "error";
    pub const VALUE: &str = "value";
    pub const POWER: &str = "power";
    pub const VOLTAGE: &str = "voltage";
    pub const CURRENT: &str = "current";
    pub const TEMPERATURE: &str = "temperature";
    pub const BRIGHTNESS: &str = "brightness";
    pub const WHITE: &str = "white";
    pub const LIGHT_TEMP: &str = "lightTemp";
    pub const TRANSITION: &str = "transition";
    pub const DEVICE_ID: &str = "deviceID";
    pub const IP: &str = "ip";
    pub const TYPE: &str = "type";
    pub const EMAIL: &str = "email";
    pub const PASS: &str = "pass";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_point_replaces_same_key() {
        let mut pts = Points::new();
        pts.process_point(Point::new("value", 1.0));
        pts.process_point(Point::new("value", 2.0));
        assert_eq!(pts.len(), 1);
        assert_eq!(pts.value("value", "0"), Some(2.0));
    }

    #[test]
    fn process_point_appends_distinct_key() {
        let mut pts = Points::new();
        pts.process_point(Point::new("value", 1.0).with_key("0"));
        pts.process_point(Point::new("value", 2.0).with_key("1"));
        assert_eq!(pts.len(), 2);
    }

    #[test]
    fn stays_sorted_by_type_then_key() {
        let mut pts = Points::new();
        pts.process_point(Point::new("voltage", 1.0));
        pts.process_point(Point::new("current", 1.0));
        pts.process_point(Point::new("current", 2.0).with_key("1"));
        let order: Vec<_> = pts.iter().map(|p| (p.typ.as_str(), p.key.as_str())).collect();
        assert_eq!(order, vec![("current", "0"), ("current", "1"), ("voltage", "0")]);
    }
}

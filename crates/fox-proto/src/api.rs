use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Running,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageReply {
    pub status: Status,
    pub message: String,
}

impl MessageReply {
    pub fn success(message: impl Into<String>) -> Self {
        Self { status: Status::Success, message: message.into() }
    }

    pub fn running(message: impl Into<String>) -> Self {
        Self { status: Status::Running, message: message.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self { status: Status::Error, message: message.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedReply {
    pub status: Status,
    pub speed: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrateRequest {
    pub duration: f64,
    #[serde(default = "default_save")]
    pub save: bool,
}

fn default_save() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrateReply {
    pub status: Status,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsRequest {
    pub rotation_duration: f64,
    pub measurement_time: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigBody {
    pub speed: u8,
    pub rotation_duration: f64,
    pub measurement_time: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigReply {
    pub status: Status,
    pub config: ConfigBody,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Peak {
    pub angle: f64,
    pub power: f64,
}

/// Body of `GET /detect/status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectStatus {
    pub car_connected: bool,
    pub sdr_ready: bool,
    pub running: bool,
    pub current_db: Option<f64>,
    pub results: Results,
    pub rotation_duration: f64,
    #[serde(default)]
    pub peak: Option<Peak>,
}

/// Scan results as a JSON object keyed by angle, in sample order.
///
/// Keys are the angle in degrees with two decimals. A plain map type would
/// re-sort the keys as strings, so the entries are kept as a list and written
/// out one by one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Results(pub Vec<(f64, f64)>);

impl Results {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

pub fn angle_key(angle_deg: f64) -> String {
    format!("{:.2}", angle_deg)
}

impl Serialize for Results {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (angle, power) in &self.0 {
            map.serialize_entry(&angle_key(*angle), power)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Results {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ResultsVisitor;

        impl<'de> Visitor<'de> for ResultsVisitor {
            type Value = Results;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of angle strings to power values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Results, A::Error> {
                let mut out = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((key, power)) = access.next_entry::<String, f64>()? {
                    let angle = key.parse::<f64>().map_err(serde::de::Error::custom)?;
                    out.push((angle, power));
                }
                Ok(Results(out))
            }
        }

        deserializer.deserialize_map(ResultsVisitor)
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Named bundle of slicing parameters applied before caller overrides.
///
/// Unknown names deserialize to [`QualityPreset::Medium`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum QualityPreset {
    Low,
    #[default]
    Medium,
    High,
}

impl QualityPreset {
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "low" => Self::Low,
            "high" => Self::High,
            _ => Self::Medium,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl From<String> for QualityPreset {
    fn from(name: String) -> Self {
        Self::from_name(&name)
    }
}

impl std::fmt::Display for QualityPreset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of a print submission.
///
/// `url` accepts either a single string or an array of strings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrintRequest {
    #[serde(rename = "url", default, deserialize_with = "one_or_many")]
    pub model_urls: Vec<String>,
    #[serde(default)]
    pub count: Option<u32>,
    #[serde(default)]
    pub scale: Option<f64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub quality: QualityPreset,
    /// Extrusion temperature; the host default applies when absent.
    #[serde(rename = "temp", default)]
    pub extrusion_temp: Option<f64>,
    #[serde(rename = "slicer_args", default, deserialize_with = "null_as_default")]
    pub slicer_overrides: Map<String, Value>,
}

impl PrintRequest {
    pub fn new<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            model_urls: urls.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        Some(OneOrMany::One(url)) => vec![url],
        Some(OneOrMany::Many(urls)) => urls,
        None => Vec::new(),
    })
}

/// An explicit `null` means the same as an absent field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Holder of the job lock as seen by a status query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum LockState {
    Free,
    Held {
        owner_pid: Option<u32>,
        acquired_at: DateTime<Utc>,
    },
}

impl LockState {
    pub fn is_held(&self) -> bool {
        matches!(self, Self::Held { .. })
    }
}

/// Response for the status endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub log: String,
    /// 0-100, taken from the last progress marker in the log.
    pub progress: u8,
    pub locked: bool,
    /// Pid recorded in the pid file, if a job is running.
    pub pid: Option<u32>,
    pub lock: LockState,
}

//! Domain types shared by the store, the cache and the pipeline stages.
//!
//! Creators arrive from the entity store as loosely-typed rows. The fields the
//! pipeline depends on are modelled explicitly; everything else is preserved
//! in `extra` so a cached creator list round-trips without loss.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Renders a string or integer identifier as a string.
///
/// Returns `None` for null, empty strings and non-scalar values.
pub fn value_to_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Coerces a loosely-typed numeric field to `f64`.
///
/// Absent, null, non-numeric and non-finite values all become `0.0`.
pub fn coerce_number(value: Option<&Value>) -> f64 {
    let parsed = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    // `+ 0.0` folds -0.0 into 0.0.
    parsed.filter(|v| v.is_finite()).map_or(0.0, |v| v + 0.0)
}

/// Deserializes an optional string-or-number identifier into `Option<String>`.
fn deserialize_opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(value_to_id))
}

/// Deserializes a required string-or-number identifier; null becomes empty.
fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(value_to_id).unwrap_or_default())
}

/// Deserializes an optional text column; non-string scalars are stringified.
fn deserialize_opt_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

/// Deserializes a text field leniently: null becomes empty, scalars are stringified.
fn deserialize_lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s,
        Some(other) => other.to_string(),
    })
}

/// Deserializes a magnet type tag; anything other than `cover` is `normal`.
fn deserialize_kind<'de, D>(deserializer: D) -> Result<MagnetKind, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value.as_ref().and_then(Value::as_str) {
        Some(s) if s.trim().eq_ignore_ascii_case("cover") => MagnetKind::Cover,
        _ => MagnetKind::Normal,
    })
}

/// A creator row from the `creator` table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Creator {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator_id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(
        default,
        deserialize_with = "deserialize_opt_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub name: Option<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_opt_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paid_subscribers_est: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub free_subscribers_est: Option<Value>,
    #[serde(
        default,
        deserialize_with = "deserialize_opt_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub creator_signature_image_url: Option<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_opt_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub status: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Creator {
    /// Stable external key: `creator_id`, falling back to `id`.
    pub fn key(&self) -> Option<String> {
        self.creator_id
            .as_ref()
            .and_then(value_to_id)
            .or_else(|| self.id.as_ref().and_then(value_to_id))
    }

    /// Whether `candidate` names this creator by either identifier.
    pub fn matches(&self, candidate: &str) -> bool {
        let candidate = candidate.trim();
        [self.creator_id.as_ref(), self.id.as_ref()]
            .into_iter()
            .flatten()
            .filter_map(value_to_id)
            .any(|id| id == candidate)
    }

    /// Primary ordering key (estimated paid audience).
    pub fn paid_audience(&self) -> f64 {
        coerce_number(self.paid_subscribers_est.as_ref())
    }

    /// Secondary ordering key (estimated free audience).
    pub fn free_audience(&self) -> f64 {
        coerce_number(self.free_subscribers_est.as_ref())
    }

    /// Current status; absent or unrecognised values read as pending.
    pub fn status(&self) -> Status {
        self.status
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(Status::Pending)
    }
}

/// Lifecycle flag persisted on the creator row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Generating,
    Completed,
    Failed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Generating => "generating",
            Status::Completed => "completed",
            Status::Failed => "failed",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Status::Pending),
            "generating" => Ok(Status::Generating),
            "completed" => Ok(Status::Completed),
            "failed" => Ok(Status::Failed),
            other => Err(format!("unknown status '{}'", other)),
        }
    }
}

/// Distinguishes a single rendered magnet from the composed cover image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MagnetKind {
    #[default]
    Normal,
    Cover,
}

impl MagnetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MagnetKind::Normal => "normal",
            MagnetKind::Cover => "cover",
        }
    }
}

impl fmt::Display for MagnetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A magnet as described by the prompt service (`magnet_sku_list` entry).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Magnet {
    #[serde(default, deserialize_with = "deserialize_lenient_string")]
    pub context_id: String,
    #[serde(default, deserialize_with = "deserialize_lenient_string")]
    pub front_name: String,
    #[serde(default, deserialize_with = "deserialize_lenient_string")]
    pub front_style_key: String,
    #[serde(default, deserialize_with = "deserialize_lenient_string")]
    pub front_image_prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub front_logo_url: Option<String>,
    #[serde(default, rename = "type", deserialize_with = "deserialize_kind")]
    pub kind: MagnetKind,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Natural key of a `magnet_image` row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MagnetKey {
    pub creator_id: String,
    pub context_id: String,
    pub kind: MagnetKind,
}

impl MagnetKey {
    pub fn new(creator_id: impl Into<String>, context_id: impl Into<String>, kind: MagnetKind) -> Self {
        Self {
            creator_id: creator_id.into(),
            context_id: context_id.into(),
            kind,
        }
    }
}

impl fmt::Display for MagnetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "creator_id={}, context_id={}, type={}",
            self.creator_id, self.context_id, self.kind
        )
    }
}

/// A row of the `magnet_image` table.
///
/// `None` fields are omitted when serialized, so the same value works as an
/// insert body and as a partial update body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MagnetRecord {
    #[serde(deserialize_with = "deserialize_id")]
    pub creator_id: String,
    #[serde(deserialize_with = "deserialize_id")]
    pub context_id: String,
    #[serde(rename = "type", default)]
    pub kind: MagnetKind,
    #[serde(
        default,
        deserialize_with = "deserialize_opt_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub front_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub front_style_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub front_image_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub front_image_url: Option<String>,
}

impl MagnetRecord {
    pub fn new(key: &MagnetKey) -> Self {
        Self {
            creator_id: key.creator_id.clone(),
            context_id: key.context_id.clone(),
            kind: key.kind,
            ..Default::default()
        }
    }

    pub fn key(&self) -> MagnetKey {
        MagnetKey::new(&self.creator_id, &self.context_id, self.kind)
    }

    /// Overwrites every field that `patch` sets.
    pub fn merge(&mut self, patch: &MagnetRecord) {
        if patch.task_id.is_some() {
            self.task_id = patch.task_id.clone();
        }
        if patch.front_name.is_some() {
            self.front_name = patch.front_name.clone();
        }
        if patch.front_style_key.is_some() {
            self.front_style_key = patch.front_style_key.clone();
        }
        if patch.front_image_prompt.is_some() {
            self.front_image_prompt = patch.front_image_prompt.clone();
        }
        if patch.front_image_url.is_some() {
            self.front_image_url = patch.front_image_url.clone();
        }
    }
}

/// Outreach fields written back onto the creator row after prompt generation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutreachUpdate {
    pub outreach_email_body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A per-sub-item failure recorded inside a stage result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemError {
    pub context_id: String,
    pub error: String,
    #[serde(default)]
    pub attempts: u32,
    /// Set when the failure was not retried.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fatal: bool,
}

impl ItemError {
    pub fn new(context_id: impl Into<String>, error: impl fmt::Display) -> Self {
        Self {
            context_id: context_id.into(),
            error: error.to_string(),
            attempts: 0,
            fatal: false,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn fatal(mut self) -> Self {
        self.fatal = true;
        self
    }
}

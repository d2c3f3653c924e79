//! Flag definitions as loaded into the evaluation cache, plus the
//! per-request evaluation context and result.
//!
//! The serialized form of [`EvalCacheJson`] is shared by the JSON export and
//! by the `json_file` / `json_http` fetchers, so an export can always be
//! read back as a flag source.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type FlagId = u64;
pub type SegmentId = u64;
pub type ConstraintId = u64;
pub type DistributionId = u64;
pub type VariantId = u64;
pub type TagId = u64;

/// Maximum length of a flag or variant key.
pub const KEY_LENGTH_LIMIT: usize = 63;

/// Returns true if `key` is usable as a flag or variant key: lowercase ASCII
/// letters, digits and underscores, starting with a letter.
pub fn is_safe_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    key.len() <= KEY_LENGTH_LIMIT
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Flag {
    pub id: FlagId,
    pub key: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub enabled: bool,
    /// Overrides the entity type of every context evaluated against this flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(default)]
    pub segments: Vec<Segment>,
    #[serde(default)]
    pub variants: Vec<Variant>,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub id: SegmentId,
    #[serde(default)]
    pub flag_id: FlagId,
    #[serde(default)]
    pub description: String,
    /// Lower ranks are evaluated first.
    #[serde(default)]
    pub rank: u32,
    #[serde(default)]
    pub rollout_percent: u32,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    #[serde(default)]
    pub distributions: Vec<Distribution>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    #[serde(default)]
    pub id: ConstraintId,
    #[serde(default)]
    pub segment_id: SegmentId,
    pub property: String,
    /// Kept as text so an unknown operator surfaces when the flag is
    /// prepared rather than failing the whole fetch.
    pub operator: String,
    pub value: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Distribution {
    #[serde(default)]
    pub id: DistributionId,
    #[serde(default)]
    pub segment_id: SegmentId,
    pub variant_id: VariantId,
    #[serde(default)]
    pub variant_key: String,
    /// 0 to 100. All distributions of a segment add up to 100.
    pub percent: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub id: VariantId,
    #[serde(default)]
    pub flag_id: FlagId,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Map<String, Value>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    #[serde(default)]
    pub id: TagId,
    pub value: String,
}

/// The JSON document produced by the cache export and consumed by the
/// file and HTTP fetchers.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalCacheJson {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    pub flags: Vec<Flag>,
}

/// The entity being evaluated and the attributes constraints are tested against.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalContext {
    #[serde(default)]
    pub entity_id: String,
    #[serde(default)]
    pub entity_type: String,
    #[serde(default)]
    pub entity_context: Map<String, Value>,
    #[serde(default)]
    pub enable_debug: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flag_id: Option<FlagId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flag_key: Option<String>,
}

impl EvalContext {
    pub fn new(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            ..Default::default()
        }
    }

    pub fn with_entity_type(mut self, entity_type: impl Into<String>) -> Self {
        self.entity_type = entity_type.into();
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.entity_context.insert(key.into(), value.into());
        self
    }

    pub fn with_flag_id(mut self, flag_id: FlagId) -> Self {
        self.flag_id = Some(flag_id);
        self
    }

    pub fn with_flag_key(mut self, flag_key: impl Into<String>) -> Self {
        self.flag_key = Some(flag_key.into());
        self
    }

    pub fn with_debug(mut self, enable_debug: bool) -> Self {
        self.enable_debug = enable_debug;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvalResult {
    pub flag_id: FlagId,
    pub flag_key: String,
    pub segment_id: Option<SegmentId>,
    pub variant_id: Option<VariantId>,
    pub variant_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant_attachment: Option<Map<String, Value>>,
    pub eval_context: EvalContext,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_debug_log: Option<EvalDebugLog>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalDebugLog {
    pub msg: String,
    pub segment_debug_logs: Vec<SegmentDebugLog>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SegmentDebugLog {
    pub segment_id: SegmentId,
    pub msg: String,
}

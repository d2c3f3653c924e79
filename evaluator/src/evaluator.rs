//! Flag-level evaluation: walks a flag's segments in rank order and
//! returns the first variant assignment.

use std::collections::HashMap;
use std::fmt;

use chrono::Utc;

use crate::segment::{PrepareError, PreparedSegment};
use crate::types::{EvalContext, EvalDebugLog, EvalResult, Flag, FlagId, Variant, VariantId};

/// Identifies a flag by numeric id or by key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum FlagRef {
    Id(FlagId),
    Key(String),
}

impl FlagRef {
    /// Numeric strings are ids, anything else is a key.
    pub fn parse(s: &str) -> Self {
        s.parse().map_or_else(|_| FlagRef::Key(s.to_string()), FlagRef::Id)
    }
}

impl From<FlagId> for FlagRef {
    fn from(id: FlagId) -> Self {
        FlagRef::Id(id)
    }
}

impl From<&str> for FlagRef {
    fn from(key: &str) -> Self {
        FlagRef::Key(key.to_string())
    }
}

impl From<String> for FlagRef {
    fn from(key: String) -> Self {
        FlagRef::Key(key)
    }
}

impl fmt::Display for FlagRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlagRef::Id(id) => write!(f, "{id}"),
            FlagRef::Key(key) => write!(f, "{key:?}"),
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("flag {0} not found")]
    FlagNotFound(FlagRef),
    #[error("evaluation context is missing {0}")]
    EmptyContext(&'static str),
}

/// A flag ready for evaluation: segments sorted by `(rank, id)` with their
/// constraints compiled.
#[derive(Clone, Debug)]
pub struct PreparedFlag {
    flag: Flag,
    segments: Vec<PreparedSegment>,
    variants: HashMap<VariantId, Variant>,
}

impl PreparedFlag {
    pub fn prepare(mut flag: Flag) -> Result<Self, PrepareError> {
        flag.segments.sort_by_key(|s| (s.rank, s.id));
        for segment in &mut flag.segments {
            segment.distributions.sort_by_key(|d| d.variant_id);
        }

        let segments = flag
            .segments
            .iter()
            .map(|s| PreparedSegment::prepare(flag.id, s))
            .collect::<Result<Vec<_>, _>>()?;
        let variants = flag.variants.iter().map(|v| (v.id, v.clone())).collect();

        Ok(Self {
            flag,
            segments,
            variants,
        })
    }

    pub fn flag(&self) -> &Flag {
        &self.flag
    }

    pub fn id(&self) -> FlagId {
        self.flag.id
    }

    pub fn key(&self) -> &str {
        &self.flag.key
    }

    pub fn segments(&self) -> &[PreparedSegment] {
        &self.segments
    }

    pub fn variant(&self, id: VariantId) -> Option<&Variant> {
        self.variants.get(&id)
    }

    pub fn evaluate(&self, context: &EvalContext) -> Result<EvalResult, EvalError> {
        let mut eval_context = context.clone();
        if let Some(entity_type) = self.flag.entity_type.as_deref().filter(|t| !t.is_empty()) {
            eval_context.entity_type = entity_type.to_string();
        }

        if !self.flag.enabled {
            let msg = format!("flag {} is not enabled", self.flag.id);
            return Ok(self.blank_result(eval_context, msg));
        }
        if self.segments.is_empty() {
            let msg = format!("flag {} has no segments", self.flag.id);
            return Ok(self.blank_result(eval_context, msg));
        }
        if context.entity_id.is_empty() {
            return Err(EvalError::EmptyContext("entity id"));
        }

        let mut segment_debug_logs = Vec::new();
        let mut assignment = None;
        for segment in &self.segments {
            match segment.evaluate(&eval_context) {
                Ok(outcome) => {
                    segment_debug_logs.push(outcome.debug_log);
                    if let Some(variant_id) = outcome.variant_id {
                        assignment = Some((segment.segment_id, variant_id));
                        break;
                    }
                }
                Err(err) => {
                    tracing::debug!(
                        flag_id = self.flag.id,
                        error = %err,
                        "segment evaluation failed"
                    );
                    segment_debug_logs.push(err.debug_log());
                }
            }
        }

        let variant = assignment.and_then(|(_, variant_id)| self.variants.get(&variant_id));
        let eval_debug_log = eval_context.enable_debug.then(|| EvalDebugLog {
            msg: String::new(),
            segment_debug_logs,
        });

        Ok(EvalResult {
            flag_id: self.flag.id,
            flag_key: self.flag.key.clone(),
            segment_id: assignment.map(|(segment_id, _)| segment_id),
            variant_id: assignment.map(|(_, variant_id)| variant_id),
            variant_key: variant.map(|v| v.key.clone()),
            variant_attachment: variant.and_then(|v| v.attachment.clone()),
            eval_context,
            timestamp: Utc::now(),
            eval_debug_log,
        })
    }

    /// A result with no assignment. The reason is always reported.
    fn blank_result(&self, eval_context: EvalContext, msg: String) -> EvalResult {
        EvalResult {
            flag_id: self.flag.id,
            flag_key: self.flag.key.clone(),
            segment_id: None,
            variant_id: None,
            variant_key: None,
            variant_attachment: None,
            eval_context,
            timestamp: Utc::now(),
            eval_debug_log: Some(EvalDebugLog {
                msg,
                segment_debug_logs: Vec::new(),
            }),
        }
    }
}

use crate::constraint::{self, ConstraintError, EvaluationError, Expr};
use crate::distribution::{DistributionArray, DistributionError};
use crate::types::{EvalContext, FlagId, Segment, SegmentDebugLog, SegmentId, VariantId};

/// A segment with its constraints compiled and its distribution laid out
/// into bucket ranges.
#[derive(Clone, Debug)]
pub struct PreparedSegment {
    pub segment_id: SegmentId,
    pub rank: u32,
    pub rollout_percent: u32,
    conditions: Expr,
    distribution: DistributionArray,
    salt: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SegmentOutcome {
    /// `None` when the constraints did not match or the entity fell outside
    /// the rollout.
    pub variant_id: Option<VariantId>,
    pub debug_log: SegmentDebugLog,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("segment {segment_id}: {source}")]
pub struct SegmentError {
    pub segment_id: SegmentId,
    #[source]
    pub source: EvaluationError,
}

/// Why a segment could not be prepared for evaluation.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum PrepareError {
    #[error(transparent)]
    Constraint(#[from] ConstraintError),
    #[error("segment {segment_id}: {source}")]
    Distribution {
        segment_id: SegmentId,
        #[source]
        source: DistributionError,
    },
}

impl SegmentError {
    pub fn debug_log(&self) -> SegmentDebugLog {
        SegmentDebugLog {
            segment_id: self.segment_id,
            msg: format!("error evaluating segment: {}", self.source),
        }
    }
}

impl PreparedSegment {
    /// Entities are bucketed with the decimal flag id as salt, so every
    /// segment of a flag places an entity in the same bucket.
    pub fn prepare(flag_id: FlagId, segment: &Segment) -> Result<Self, PrepareError> {
        let distribution = DistributionArray::new(&segment.distributions).map_err(|source| {
            PrepareError::Distribution {
                segment_id: segment.id,
                source,
            }
        })?;
        Ok(Self {
            segment_id: segment.id,
            rank: segment.rank,
            rollout_percent: segment.rollout_percent,
            conditions: constraint::compile_all(&segment.constraints)?,
            distribution,
            salt: flag_id.to_string(),
        })
    }

    pub fn conditions(&self) -> &Expr {
        &self.conditions
    }

    pub fn distribution(&self) -> &DistributionArray {
        &self.distribution
    }

    pub fn evaluate(&self, context: &EvalContext) -> Result<SegmentOutcome, SegmentError> {
        let fail = |source| SegmentError {
            segment_id: self.segment_id,
            source,
        };

        if context.entity_id.is_empty() {
            return Err(fail(EvaluationError::EmptyEntityId));
        }

        if !self.conditions.evaluate(context).map_err(fail)? {
            return Ok(SegmentOutcome {
                variant_id: None,
                debug_log: SegmentDebugLog {
                    segment_id: self.segment_id,
                    msg: format!(
                        "constraints not matched. constraints: {}, entity_context: {}",
                        self.conditions,
                        serde_json::Value::Object(context.entity_context.clone()),
                    ),
                },
            });
        }

        let (variant_id, msg) =
            self.distribution
                .rollout(&context.entity_id, &self.salt, self.rollout_percent);

        Ok(SegmentOutcome {
            variant_id,
            debug_log: SegmentDebugLog {
                segment_id: self.segment_id,
                msg: format!("matched all constraints. {msg}"),
            },
        })
    }
}

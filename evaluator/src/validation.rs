//! Rules an enabled flag is expected to satisfy, e.g. "keys start with a
//! team prefix" or "every enabled flag is tagged".
//!
//! Rules are a closed set, combined with a single `and`/`or`. Failing flags
//! are reported, never rejected: evaluation does not depend on them.

use std::fmt;

use regex::Regex;
use serde::Deserialize;

use crate::types::Flag;

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ValidationRule {
    KeyMatches { pattern: String },
    DescriptionNotEmpty,
    HasTag { tag: String },
    AnyTagMatches { pattern: String },
    MinSegments { count: usize },
    AnyVariantKeyMatches { pattern: String },
    /// Every segment has at least one constraint.
    AllSegmentsConstrained,
}

impl ValidationRule {
    pub fn name(&self) -> &'static str {
        match self {
            ValidationRule::KeyMatches { .. } => "key_matches",
            ValidationRule::DescriptionNotEmpty => "description_not_empty",
            ValidationRule::HasTag { .. } => "has_tag",
            ValidationRule::AnyTagMatches { .. } => "any_tag_matches",
            ValidationRule::MinSegments { .. } => "min_segments",
            ValidationRule::AnyVariantKeyMatches { .. } => "any_variant_key_matches",
            ValidationRule::AllSegmentsConstrained => "all_segments_constrained",
        }
    }
}

impl fmt::Display for ValidationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationRule::KeyMatches { pattern }
            | ValidationRule::AnyTagMatches { pattern }
            | ValidationRule::AnyVariantKeyMatches { pattern } => {
                write!(f, "{}({pattern:?})", self.name())
            }
            ValidationRule::HasTag { tag } => write!(f, "{}({tag:?})", self.name()),
            ValidationRule::MinSegments { count } => write!(f, "{}({count})", self.name()),
            ValidationRule::DescriptionNotEmpty | ValidationRule::AllSegmentsConstrained => {
                f.write_str(self.name())
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ValidationOperation {
    #[default]
    And,
    Or,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct ValidationConfig {
    #[serde(default)]
    pub operation: ValidationOperation,
    #[serde(default)]
    pub rules: Vec<ValidationRule>,
}

#[derive(thiserror::Error, Debug)]
pub enum ValidationError {
    #[error("invalid pattern {pattern:?} in {rule}: {source}")]
    InvalidPattern {
        rule: &'static str,
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("flag {flag_key:?} does not satisfy {}", .failed.join(", "))]
    Failed {
        flag_key: String,
        failed: Vec<String>,
    },
}

enum Check {
    KeyMatches(Regex),
    DescriptionNotEmpty,
    HasTag(String),
    AnyTagMatches(Regex),
    MinSegments(usize),
    AnyVariantKeyMatches(Regex),
    AllSegmentsConstrained,
}

impl Check {
    fn passes(&self, flag: &Flag) -> bool {
        match self {
            Check::KeyMatches(re) => re.is_match(&flag.key),
            Check::DescriptionNotEmpty => !flag.description.trim().is_empty(),
            Check::HasTag(tag) => flag.tags.iter().any(|t| &t.value == tag),
            Check::AnyTagMatches(re) => flag.tags.iter().any(|t| re.is_match(&t.value)),
            Check::MinSegments(count) => flag.segments.len() >= *count,
            Check::AnyVariantKeyMatches(re) => flag.variants.iter().any(|v| re.is_match(&v.key)),
            Check::AllSegmentsConstrained => {
                flag.segments.iter().all(|s| !s.constraints.is_empty())
            }
        }
    }
}

pub struct EnabledFlagValidator {
    operation: ValidationOperation,
    rules: Vec<(ValidationRule, Check)>,
}

impl EnabledFlagValidator {
    pub fn new(config: &ValidationConfig) -> Result<Self, ValidationError> {
        let compile = |rule: &ValidationRule, pattern: &str| {
            Regex::new(pattern).map_err(|source| ValidationError::InvalidPattern {
                rule: rule.name(),
                pattern: pattern.to_string(),
                source,
            })
        };

        let rules = config
            .rules
            .iter()
            .map(|rule| {
                let check = match rule {
                    ValidationRule::KeyMatches { pattern } => {
                        Check::KeyMatches(compile(rule, pattern)?)
                    }
                    ValidationRule::DescriptionNotEmpty => Check::DescriptionNotEmpty,
                    ValidationRule::HasTag { tag } => Check::HasTag(tag.clone()),
                    ValidationRule::AnyTagMatches { pattern } => {
                        Check::AnyTagMatches(compile(rule, pattern)?)
                    }
                    ValidationRule::MinSegments { count } => Check::MinSegments(*count),
                    ValidationRule::AnyVariantKeyMatches { pattern } => {
                        Check::AnyVariantKeyMatches(compile(rule, pattern)?)
                    }
                    ValidationRule::AllSegmentsConstrained => Check::AllSegmentsConstrained,
                };
                Ok((rule.clone(), check))
            })
            .collect::<Result<Vec<_>, ValidationError>>()?;

        Ok(Self {
            operation: config.operation,
            rules,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Applies the rules to `flag` whether or not it is enabled. An empty
    /// rule set accepts everything.
    pub fn check(&self, flag: &Flag) -> Result<(), ValidationError> {
        if self.rules.is_empty() {
            return Ok(());
        }

        let failed: Vec<String> = self
            .rules
            .iter()
            .filter(|(_, check)| !check.passes(flag))
            .map(|(rule, _)| rule.to_string())
            .collect();

        let ok = match self.operation {
            ValidationOperation::And => failed.is_empty(),
            ValidationOperation::Or => failed.len() < self.rules.len(),
        };
        if ok {
            Ok(())
        } else {
            Err(ValidationError::Failed {
                flag_key: flag.key.clone(),
                failed,
            })
        }
    }

    /// Like [`check`](Self::check), but disabled flags always pass.
    pub fn validate(&self, flag: &Flag) -> Result<(), ValidationError> {
        if !flag.enabled {
            return Ok(());
        }
        self.check(flag)
    }
}

//! Deterministic bucketing of entities into variants.
//!
//! An entity id is hashed with CRC32 (IEEE) into one of
//! [`TOTAL_BUCKET_NUM`] buckets. Each variant of a segment owns a
//! contiguous bucket range proportional to its percentage, and a segment's
//! rollout percentage admits the lower part of every range.

use crate::types::{Distribution, VariantId};

pub const TOTAL_BUCKET_NUM: u32 = 1000;
pub const PERCENT_MULTIPLIER: u32 = TOTAL_BUCKET_NUM / 100;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DistributionError {
    #[error("variant {variant_id} has percent {percent}, expected at most 100")]
    PercentOutOfRange { variant_id: VariantId, percent: u32 },
    #[error("distribution percents add up to more than 100")]
    TotalOutOfRange,
}

/// Maps an entity to a bucket in `[0, TOTAL_BUCKET_NUM)`.
pub fn crc32_num(entity_id: &str, salt: &str) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(salt.as_bytes());
    hasher.update(entity_id.as_bytes());
    hasher.finalize() % TOTAL_BUCKET_NUM
}

/// Whether `bucket` in the range `[min, max)` is inside the first
/// `rollout_percent` percent of that range.
pub fn should_rollout(bucket: u32, min: u32, max: u32, rollout_percent: u32) -> bool {
    if rollout_percent == 0 {
        return false;
    }
    if rollout_percent >= 100 {
        return true;
    }
    let offset = i64::from(bucket) - i64::from(min);
    let width = i64::from(max) - i64::from(min);
    100 * offset <= (width - 1) * i64::from(rollout_percent)
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DistributionArray {
    variant_ids: Vec<VariantId>,
    /// Exclusive upper bucket bound of each variant, non-decreasing.
    percents_accumulated: Vec<u32>,
}

impl DistributionArray {
    /// Builds the bucket ranges in ascending variant id order. Percents
    /// must each be at most 100 and add up to at most 100.
    pub fn new(distributions: &[Distribution]) -> Result<Self, DistributionError> {
        let mut sorted: Vec<&Distribution> = distributions.iter().collect();
        sorted.sort_by_key(|d| d.variant_id);

        let mut total = 0;
        let mut array = Self::default();
        for d in sorted {
            if d.percent > 100 {
                return Err(DistributionError::PercentOutOfRange {
                    variant_id: d.variant_id,
                    percent: d.percent,
                });
            }
            total += d.percent * PERCENT_MULTIPLIER;
            if total > TOTAL_BUCKET_NUM {
                return Err(DistributionError::TotalOutOfRange);
            }
            array.variant_ids.push(d.variant_id);
            array.percents_accumulated.push(total);
        }
        Ok(array)
    }

    pub fn is_empty(&self) -> bool {
        self.variant_ids.is_empty()
    }

    pub fn variant_ids(&self) -> &[VariantId] {
        &self.variant_ids
    }

    pub fn percents_accumulated(&self) -> &[u32] {
        &self.percents_accumulated
    }

    /// Picks a variant for `entity_id`. The message describes the decision
    /// for debug logs.
    pub fn rollout(
        &self,
        entity_id: &str,
        salt: &str,
        rollout_percent: u32,
    ) -> (Option<VariantId>, String) {
        if entity_id.is_empty() {
            return (None, "rollout no. empty entity id".to_string());
        }
        self.rollout_bucket(crc32_num(entity_id, salt), rollout_percent)
    }

    pub fn rollout_bucket(&self, bucket: u32, rollout_percent: u32) -> (Option<VariantId>, String) {
        if rollout_percent == 0 {
            return (None, "rollout no. 0% rollout".to_string());
        }
        if self.is_empty() {
            return (None, "rollout no. there's no distribution set".to_string());
        }

        let index = self.percents_accumulated.partition_point(|&p| p <= bucket);
        let Some(&variant_id) = self.variant_ids.get(index) else {
            let total = self.percents_accumulated.last().copied().unwrap_or_default();
            return (
                None,
                format!("rollout no. bucket {bucket} is outside the distribution of {total} buckets"),
            );
        };

        let min = if index == 0 {
            0
        } else {
            self.percents_accumulated[index - 1]
        };
        let max = self.percents_accumulated[index];

        if should_rollout(bucket, min, max, rollout_percent) {
            (
                Some(variant_id),
                format!(
                    "rollout yes. bucket {bucket} in [{min}, {max}) of variant {variant_id}, {rollout_percent}% rollout"
                ),
            )
        } else {
            (
                None,
                format!(
                    "rollout no. bucket {bucket} in [{min}, {max}) of variant {variant_id}, outside {rollout_percent}% rollout"
                ),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn distributions(parts: &[(VariantId, u32)]) -> Vec<Distribution> {
        parts
            .iter()
            .map(|&(variant_id, percent)| Distribution {
                variant_id,
                percent,
                ..Default::default()
            })
            .collect()
    }

    fn array(parts: &[(VariantId, u32)]) -> DistributionArray {
        DistributionArray::new(&distributions(parts)).unwrap()
    }

    #[test]
    fn test_crc32_num() {
        assert_eq!(crc32_num("entity1", "salt1"), 144);
        assert_eq!(crc32_num("entity123", "100"), 585);
        assert_eq!(crc32_num("entity1", "100"), 888);
        assert_eq!(crc32_num("entity2", "100"), 82);
        assert_eq!(crc32_num("entity1", "1"), 773);
    }

    #[test]
    fn test_new_sorts_by_variant_id() {
        let a = array(&[(2, 66), (1, 34)]);
        assert_eq!(a.variant_ids(), &[1, 2]);
        assert_eq!(a.percents_accumulated(), &[340, 1000]);
    }

    #[test]
    fn test_new_rejects_out_of_range_percents() {
        assert_eq!(
            DistributionArray::new(&distributions(&[(1, 500_000_000)])),
            Err(DistributionError::PercentOutOfRange {
                variant_id: 1,
                percent: 500_000_000
            })
        );
        assert_eq!(
            DistributionArray::new(&distributions(&[(1, 60), (2, 50)])),
            Err(DistributionError::TotalOutOfRange)
        );
        assert!(DistributionArray::new(&distributions(&[(1, 40), (2, 60)])).is_ok());
    }

    #[test]
    fn test_rollout_bucket_boundaries() {
        let a = array(&[(1, 34), (2, 66)]);
        assert_eq!(a.rollout_bucket(0, 100).0, Some(1));
        assert_eq!(a.rollout_bucket(339, 100).0, Some(1));
        assert_eq!(a.rollout_bucket(340, 100).0, Some(2));
        assert_eq!(a.rollout_bucket(999, 100).0, Some(2));
    }

    #[test]
    fn test_partial_rollout() {
        // Range [0, 340): 100 * offset <= 339 * 50 admits offsets 0..=169.
        let a = array(&[(1, 34), (2, 66)]);
        assert_eq!(a.rollout_bucket(169, 50).0, Some(1));
        assert_eq!(a.rollout_bucket(170, 50).0, None);
        assert_eq!(a.rollout_bucket(0, 1).0, Some(1));
        assert_eq!(a.rollout_bucket(0, 0).0, None);
    }

    #[test]
    fn test_zero_percent_variant_is_skipped() {
        let a = array(&[(1, 0), (2, 100)]);
        assert_eq!(a.rollout_bucket(0, 100).0, Some(2));
    }

    #[test]
    fn test_empty_and_short_distributions() {
        let (variant, msg) = DistributionArray::default().rollout_bucket(10, 100);
        assert_eq!(variant, None);
        assert!(msg.contains("no distribution"));

        let a = array(&[(1, 50)]);
        assert_eq!(a.rollout_bucket(499, 100).0, Some(1));
        let (variant, msg) = a.rollout_bucket(500, 100);
        assert_eq!(variant, None);
        assert!(msg.contains("outside the distribution"));
    }

    #[test]
    fn test_rollout_empty_entity() {
        let a = array(&[(1, 100)]);
        assert_eq!(a.rollout("", "1", 100).0, None);
        assert_eq!(a.rollout("entity1", "1", 100).0, Some(1));
    }

    proptest! {
        #[test]
        fn test_rollout_is_deterministic(entity in "[a-z0-9_]{1,16}", salt in "[0-9]{1,4}") {
            let a = array(&[(1, 25), (2, 25), (3, 50)]);
            prop_assert_eq!(a.rollout(&entity, &salt, 60), a.rollout(&entity, &salt, 60));
            prop_assert!(crc32_num(&entity, &salt) < TOTAL_BUCKET_NUM);
        }

        #[test]
        fn test_rollout_is_monotonic(bucket in 0u32..1000, low in 0u32..=100, high in 0u32..=100) {
            let (low, high) = if low <= high { (low, high) } else { (high, low) };
            let a = array(&[(1, 30), (2, 70)]);
            if a.rollout_bucket(bucket, low).0.is_some() {
                prop_assert_eq!(a.rollout_bucket(bucket, high).0, a.rollout_bucket(bucket, low).0);
            }
        }

        #[test]
        fn test_full_rollout_always_assigns(bucket in 0u32..1000) {
            let a = array(&[(1, 30), (2, 70)]);
            prop_assert!(a.rollout_bucket(bucket, 100).0.is_some());
        }
    }
}

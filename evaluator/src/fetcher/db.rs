//! Loads flags from the admin database. Every table is read in one query
//! and the rows are stitched together in memory; soft-deleted rows are
//! skipped.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use super::{FetchError, Fetcher};
use crate::types::{Constraint, Distribution, Flag, Segment, Tag, Variant};

const MAX_CONNECTIONS: u32 = 4;

const FLAGS_QUERY: &str = r#"SELECT id, "key", description, enabled, entity_type
    FROM flags WHERE deleted_at IS NULL ORDER BY id"#;
const SEGMENTS_QUERY: &str = r#"SELECT id, flag_id, description, "rank", rollout_percent
    FROM segments WHERE deleted_at IS NULL ORDER BY "rank", id"#;
const CONSTRAINTS_QUERY: &str = r#"SELECT id, segment_id, property, operator, value
    FROM constraints WHERE deleted_at IS NULL ORDER BY id"#;
const DISTRIBUTIONS_QUERY: &str = r#"SELECT id, segment_id, variant_id, variant_key, percent
    FROM distributions WHERE deleted_at IS NULL ORDER BY variant_id"#;
const VARIANTS_QUERY: &str = r#"SELECT id, flag_id, "key", attachment
    FROM variants WHERE deleted_at IS NULL ORDER BY id"#;
const TAGS_QUERY: &str = r#"SELECT ft.flag_id, t.id, t.value
    FROM tags t JOIN flags_tags ft ON ft.tag_id = t.id
    WHERE t.deleted_at IS NULL ORDER BY t.id"#;

#[derive(sqlx::FromRow)]
struct FlagRow {
    id: i64,
    key: String,
    description: Option<String>,
    enabled: bool,
    entity_type: Option<String>,
}

#[derive(sqlx::FromRow)]
struct SegmentRow {
    id: i64,
    flag_id: i64,
    description: Option<String>,
    rank: i64,
    rollout_percent: i64,
}

#[derive(sqlx::FromRow)]
struct ConstraintRow {
    id: i64,
    segment_id: i64,
    property: String,
    operator: String,
    value: String,
}

#[derive(sqlx::FromRow)]
struct DistributionRow {
    id: i64,
    segment_id: i64,
    variant_id: i64,
    variant_key: Option<String>,
    percent: i64,
}

#[derive(sqlx::FromRow)]
struct VariantRow {
    id: i64,
    flag_id: i64,
    key: String,
    attachment: Option<String>,
}

#[derive(sqlx::FromRow)]
struct TagRow {
    flag_id: i64,
    id: i64,
    value: String,
}

fn id(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

fn small(value: i64) -> u32 {
    u32::try_from(value).unwrap_or_default()
}

pub struct DbFetcher {
    pool: SqlitePool,
}

impl DbFetcher {
    pub fn new(pool: SqlitePool) -> Self {
        DbFetcher { pool }
    }

    /// Only SQLite URLs are accepted.
    pub async fn connect(url: &str) -> Result<Self, FetchError> {
        if !url.starts_with("sqlite:") {
            return Err(FetchError::InvalidSource(format!(
                "{url:?} is not a sqlite database url"
            )));
        }
        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect(url)
            .await?;
        Ok(Self::new(pool))
    }
}

#[async_trait]
impl Fetcher for DbFetcher {
    fn name(&self) -> &'static str {
        "db"
    }

    async fn fetch(&self) -> Result<Vec<Flag>, FetchError> {
        let flag_rows: Vec<FlagRow> = sqlx::query_as(FLAGS_QUERY).fetch_all(&self.pool).await?;
        let segment_rows: Vec<SegmentRow> =
            sqlx::query_as(SEGMENTS_QUERY).fetch_all(&self.pool).await?;
        let constraint_rows: Vec<ConstraintRow> =
            sqlx::query_as(CONSTRAINTS_QUERY).fetch_all(&self.pool).await?;
        let distribution_rows: Vec<DistributionRow> =
            sqlx::query_as(DISTRIBUTIONS_QUERY).fetch_all(&self.pool).await?;
        let variant_rows: Vec<VariantRow> =
            sqlx::query_as(VARIANTS_QUERY).fetch_all(&self.pool).await?;
        let tag_rows: Vec<TagRow> = sqlx::query_as(TAGS_QUERY).fetch_all(&self.pool).await?;

        let mut constraints: HashMap<u64, Vec<Constraint>> = HashMap::new();
        for row in constraint_rows {
            constraints.entry(id(row.segment_id)).or_default().push(Constraint {
                id: id(row.id),
                segment_id: id(row.segment_id),
                property: row.property,
                operator: row.operator,
                value: row.value,
            });
        }

        let mut distributions: HashMap<u64, Vec<Distribution>> = HashMap::new();
        for row in distribution_rows {
            distributions.entry(id(row.segment_id)).or_default().push(Distribution {
                id: id(row.id),
                segment_id: id(row.segment_id),
                variant_id: id(row.variant_id),
                variant_key: row.variant_key.unwrap_or_default(),
                percent: small(row.percent),
            });
        }

        let mut segments: HashMap<u64, Vec<Segment>> = HashMap::new();
        for row in segment_rows {
            let segment_id = id(row.id);
            segments.entry(id(row.flag_id)).or_default().push(Segment {
                id: segment_id,
                flag_id: id(row.flag_id),
                description: row.description.unwrap_or_default(),
                rank: small(row.rank),
                rollout_percent: small(row.rollout_percent),
                constraints: constraints.remove(&segment_id).unwrap_or_default(),
                distributions: distributions.remove(&segment_id).unwrap_or_default(),
            });
        }

        let mut variants: HashMap<u64, Vec<Variant>> = HashMap::new();
        for row in variant_rows {
            let attachment = match row.attachment.as_deref().map(str::trim) {
                None | Some("") => None,
                Some(raw) => Some(serde_json::from_str::<Map<String, Value>>(raw)?),
            };
            variants.entry(id(row.flag_id)).or_default().push(Variant {
                id: id(row.id),
                flag_id: id(row.flag_id),
                key: row.key,
                attachment,
            });
        }

        let mut tags: HashMap<u64, Vec<Tag>> = HashMap::new();
        for row in tag_rows {
            tags.entry(id(row.flag_id)).or_default().push(Tag {
                id: id(row.id),
                value: row.value,
            });
        }

        Ok(flag_rows
            .into_iter()
            .map(|row| {
                let flag_id = id(row.id);
                Flag {
                    id: flag_id,
                    key: row.key,
                    description: row.description.unwrap_or_default(),
                    enabled: row.enabled,
                    entity_type: row.entity_type.filter(|t| !t.is_empty()),
                    segments: segments.remove(&flag_id).unwrap_or_default(),
                    variants: variants.remove(&flag_id).unwrap_or_default(),
                    tags: tags.remove(&flag_id).unwrap_or_default(),
                }
            })
            .collect())
    }
}

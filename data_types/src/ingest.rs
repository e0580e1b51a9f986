//! The ingestion request wire format and its strict validation.

use crate::{
    schema::{FieldType, SchemaField},
    StorageTargetId, Timestamp,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use snafu::{ensure, OptionExt, Snafu};
use std::collections::BTreeMap;
use timestore_time::Time;

/// Table used when a request does not name one.
pub const DEFAULT_TABLE_NAME: &str = "records";

/// One ingested row: column name to JSON value.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Validation failures for an [`IngestionRequest`].
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum ValidationError {
    #[snafu(display("dataset slug must not be empty"))]
    EmptySlug,

    #[snafu(display("dataset slug {slug:?} contains unsafe characters"))]
    UnsafeSlug { slug: String },

    #[snafu(display("{what} {value:?} is not a valid identifier"))]
    InvalidIdentifier { what: &'static str, value: String },

    #[snafu(display("schema must declare at least one field"))]
    EmptySchema,

    #[snafu(display("schema declares field {name:?} more than once"))]
    DuplicateField { name: String },

    #[snafu(display("partition time range {value:?} does not parse as RFC 3339: {source}"))]
    UnparseableTimestamp {
        value: String,
        source: chrono::ParseError,
    },

    #[snafu(display("partition time range end {end} precedes start {start}"))]
    TimeRangeInverted { start: String, end: String },

    #[snafu(display(
        "partition time range [{start}, {end}] extends past the shard derived from its start"
    ))]
    TimeRangeCrossesShard { start: String, end: String },

    #[snafu(display("row {row} references column {column:?} not present in the schema"))]
    UnknownColumn { row: usize, column: String },

    #[snafu(display("row {row} column {column:?} is not a valid {expected}: {value}"))]
    TypeMismatch {
        row: usize,
        column: String,
        expected: FieldType,
        value: serde_json::Value,
    },

    #[snafu(display("evolution default references column {column:?} not present in the schema"))]
    UnknownDefaultColumn { column: String },
}

/// Caller-supplied schema plus evolution options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct SchemaDescriptor {
    /// Ordered field list.
    pub fields: Vec<SchemaField>,
    /// Optional evolution options.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evolution: Option<EvolutionOptions>,
}

/// Options controlling additive schema evolution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct EvolutionOptions {
    /// Per-column defaults for backfilling pre-existing rows.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub defaults: BTreeMap<String, serde_json::Value>,
    /// Whether the caller wants a backfill of existing partitions requested.
    #[serde(default)]
    pub backfill: bool,
}

/// The partition addressed by an ingestion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct PartitionDescriptor {
    /// Caller-facing partition key.
    pub key: BTreeMap<String, String>,
    /// Informational attributes recorded alongside the partition.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    /// Time range covered by the rows.
    pub time_range: TimeRange,
}

/// An RFC 3339 time range; `end >= start`, equality allowed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct TimeRange {
    /// Inclusive start.
    pub start: String,
    /// Inclusive end.
    pub end: String,
}

impl TimeRange {
    /// Parse both bounds and check their ordering.
    pub fn parse(&self) -> Result<(Timestamp, Timestamp), ValidationError> {
        let start = parse_rfc3339(&self.start)?;
        let end = parse_rfc3339(&self.end)?;
        ensure!(
            end >= start,
            TimeRangeInvertedSnafu {
                start: self.start.clone(),
                end: self.end.clone(),
            }
        );
        Ok((start, end))
    }
}

/// Parse one RFC 3339 timestamp into a [`Timestamp`].
pub fn parse_rfc3339(value: &str) -> Result<Timestamp, ValidationError> {
    let time = Time::from_rfc3339(value).map_err(|source| ValidationError::UnparseableTimestamp {
        value: value.to_string(),
        source,
    })?;
    Ok(Timestamp::from_time(time))
}

/// The caller performing an ingestion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct Actor {
    /// Caller identity.
    pub id: String,
    /// Granted scopes.
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// A single ingestion request as accepted at the service boundary.
///
/// Unknown fields are rejected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct IngestionRequest {
    /// Slug of the target dataset; the dataset is created on first ingest.
    pub dataset_slug: String,
    /// Human-readable dataset name, used when the dataset is created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset_name: Option<String>,
    /// Explicit storage target; falls back to the dataset default, then the
    /// system default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_target_id: Option<StorageTargetId>,
    /// Logical table within the dataset; defaults to `records`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_name: Option<String>,
    /// Schema of the rows.
    pub schema: SchemaDescriptor,
    /// Partition addressed by the rows.
    pub partition: PartitionDescriptor,
    /// The rows themselves. Bulk-load files omit this and supply rows out
    /// of band.
    #[serde(default)]
    pub rows: Vec<Row>,
    /// Caller-supplied at-most-once token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// The caller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<Actor>,
    /// When the records were received upstream (set by streaming producers).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at: Option<String>,
}

/// The pre-parsed parts of a validated request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedIngestion {
    /// Effective table name.
    pub table_name: String,
    /// Parsed partition start time.
    pub start_time: Timestamp,
    /// Parsed partition end time.
    pub end_time: Timestamp,
}

impl IngestionRequest {
    /// The effective table name.
    pub fn table_name(&self) -> &str {
        self.table_name.as_deref().unwrap_or(DEFAULT_TABLE_NAME)
    }

    /// Validate the request per the service contract: safe slug, valid
    /// identifiers, well-formed time range, rows matching the schema, and
    /// evolution defaults referencing declared columns.
    pub fn validate(&self) -> Result<ValidatedIngestion, ValidationError> {
        ensure!(!self.dataset_slug.is_empty(), EmptySlugSnafu);
        ensure!(
            is_safe_slug(&self.dataset_slug),
            UnsafeSlugSnafu {
                slug: self.dataset_slug.clone()
            }
        );

        let table_name = self.table_name().to_string();
        ensure!(
            is_identifier(&table_name),
            InvalidIdentifierSnafu {
                what: "table name",
                value: table_name.clone(),
            }
        );

        ensure!(!self.schema.fields.is_empty(), EmptySchemaSnafu);
        let mut seen = BTreeMap::new();
        for field in &self.schema.fields {
            ensure!(
                is_identifier(&field.name),
                InvalidIdentifierSnafu {
                    what: "field name",
                    value: field.name.clone(),
                }
            );
            ensure!(
                seen.insert(field.name.as_str(), ()).is_none(),
                DuplicateFieldSnafu {
                    name: field.name.clone()
                }
            );
        }

        if let Some(evolution) = &self.schema.evolution {
            for column in evolution.defaults.keys() {
                seen.get(column.as_str()).context(UnknownDefaultColumnSnafu {
                    column: column.clone(),
                })?;
            }
        }

        let (start_time, end_time) = self.partition.time_range.parse()?;

        validate_rows(&self.schema.fields, &self.rows)?;

        Ok(ValidatedIngestion {
            table_name,
            start_time,
            end_time,
        })
    }

    /// The signature that makes staging this request idempotent.
    ///
    /// Requests carrying an idempotency key hash to the same signature on
    /// replay; keyless requests fall back to hashing the row content so an
    /// identical resubmission is still collapsed.
    pub fn ingestion_signature(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.dataset_slug.as_bytes());
        hasher.update(b"\0");
        hasher.update(self.table_name().as_bytes());
        hasher.update(b"\0");
        for (k, v) in &self.partition.key {
            hasher.update(k.as_bytes());
            hasher.update(b"=");
            hasher.update(v.as_bytes());
            hasher.update(b";");
        }
        hasher.update(self.partition.time_range.start.as_bytes());
        hasher.update(b"..");
        hasher.update(self.partition.time_range.end.as_bytes());
        hasher.update(b"\0");
        match &self.idempotency_key {
            Some(key) => {
                hasher.update(b"key:");
                hasher.update(key.as_bytes());
            }
            None => {
                hasher.update(b"rows:");
                // row content hash; map serialization is deterministic
                // (keys are ordered)
                for row in &self.rows {
                    let serialized =
                        serde_json::to_vec(row).expect("row serialization is infallible");
                    hasher.update(serialized);
                    hasher.update(b"\n");
                }
            }
        }
        crate::schema::hex_digest(hasher)
    }
}

/// Validate each row against the declared schema: no unknown columns, and
/// every present value must match its field type (nulls are allowed).
pub fn validate_rows(fields: &[SchemaField], rows: &[Row]) -> Result<(), ValidationError> {
    let types: BTreeMap<&str, FieldType> = fields
        .iter()
        .map(|f| (f.name.as_str(), f.field_type))
        .collect();

    for (i, row) in rows.iter().enumerate() {
        for (column, value) in row {
            let field_type = types.get(column.as_str()).context(UnknownColumnSnafu {
                row: i,
                column: column.clone(),
            })?;
            ensure!(
                value_matches(*field_type, value),
                TypeMismatchSnafu {
                    row: i,
                    column: column.clone(),
                    expected: *field_type,
                    value: value.clone(),
                }
            );
        }
    }
    Ok(())
}

/// Whether `value` is acceptable for a column of `field_type`.
pub fn value_matches(field_type: FieldType, value: &serde_json::Value) -> bool {
    use serde_json::Value;

    if value.is_null() {
        return true;
    }

    match field_type {
        FieldType::Timestamp => match value {
            Value::String(s) => Time::from_rfc3339(s).is_ok(),
            // epoch milliseconds are accepted from streaming producers
            Value::Number(n) => n.is_i64(),
            _ => false,
        },
        FieldType::String => value.is_string(),
        FieldType::Double => value.is_f64() || value.is_i64() || value.is_u64(),
        FieldType::Integer => value.is_i64() || value.is_u64(),
        FieldType::Boolean => value.is_boolean(),
    }
}

/// Extract a row's value for a timestamp field as a [`Timestamp`].
pub fn row_timestamp(row: &Row, field: &str) -> Option<Timestamp> {
    match row.get(field)? {
        serde_json::Value::String(s) => Time::from_rfc3339(s).ok().map(Timestamp::from_time),
        serde_json::Value::Number(n) => n
            .as_i64()
            .map(|millis| Timestamp::from_time(Time::from_timestamp_millis(millis))),
        _ => None,
    }
}

fn is_safe_slug(slug: &str) -> bool {
    slug.len() <= 120
        && !slug.starts_with('.')
        && slug
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

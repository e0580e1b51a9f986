//! Dataset field schemas and their canonical checksums.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::{Display, Formatter};

/// The closed set of field types an ingestion schema may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    /// An RFC 3339 instant, stored as a microsecond timestamp column.
    Timestamp,
    /// UTF-8 string.
    String,
    /// 64-bit float.
    Double,
    /// 64-bit signed integer.
    Integer,
    /// Boolean.
    Boolean,
}

impl FieldType {
    /// Stable string form, matching the wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timestamp => "timestamp",
            Self::String => "string",
            Self::Double => "double",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
        }
    }
}

impl std::str::FromStr for FieldType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "timestamp" => Ok(Self::Timestamp),
            "string" => Ok(Self::String),
            "double" => Ok(Self::Double),
            "integer" => Ok(Self::Integer),
            "boolean" => Ok(Self::Boolean),
            other => Err(format!("unknown field type: {other}")),
        }
    }
}

impl Display for FieldType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One named, typed field of an ingestion schema.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchemaField {
    /// Field name; also the column name in partition files and the spool.
    pub name: String,
    /// Field type.
    #[serde(rename = "type")]
    pub field_type: FieldType,
}

impl SchemaField {
    /// Convenience constructor.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }
}

/// Canonical hash over an ordered `(name, type)` field list.
///
/// Two schema versions of a dataset are the same iff their checksums match;
/// the checksum is therefore order-sensitive.
pub fn schema_checksum(fields: &[SchemaField]) -> String {
    let mut hasher = Sha256::new();
    for field in fields {
        hasher.update(field.name.as_bytes());
        hasher.update(b":");
        hasher.update(field.field_type.as_str().as_bytes());
        hasher.update(b"\n");
    }
    hex_digest(hasher)
}

/// Finish a hasher into a lowercase hex string.
pub(crate) fn hex_digest(hasher: Sha256) -> String {
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields() -> Vec<SchemaField> {
        vec![
            SchemaField::new("t", FieldType::Timestamp),
            SchemaField::new("v", FieldType::Double),
        ]
    }

    #[test]
    fn checksum_is_stable_and_order_sensitive() {
        let a = schema_checksum(&fields());
        let b = schema_checksum(&fields());
        assert_eq!(a, b);

        let mut reversed = fields();
        reversed.reverse();
        assert_ne!(a, schema_checksum(&reversed));
    }

    #[test]
    fn checksum_changes_with_type() {
        let mut changed = fields();
        changed[1].field_type = FieldType::Integer;
        assert_ne!(schema_checksum(&fields()), schema_checksum(&changed));
    }

    #[test]
    fn field_type_wire_names() {
        let parsed: SchemaField = serde_json::from_str(r#"{"name":"t","type":"timestamp"}"#).unwrap();
        assert_eq!(parsed, SchemaField::new("t", FieldType::Timestamp));

        assert!(serde_json::from_str::<SchemaField>(r#"{"name":"t","type":"uuid"}"#).is_err());
    }
}

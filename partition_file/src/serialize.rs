//! Converting validated rows into self-describing parquet bytes.

use arrow::{
    array::{ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray,
            TimestampMicrosecondArray},
    datatypes::{DataType, Field, Schema, TimeUnit},
    record_batch::RecordBatch,
};
use data_types::{
    ingest::Row, schema::FieldType, ColumnStatistics, SchemaField,
};
use parquet::{
    arrow::ArrowWriter,
    basic::Compression,
    file::{metadata::KeyValue, properties::WriterProperties},
};
use sha2::{Digest, Sha256};
use std::{collections::BTreeMap, sync::Arc};
use thiserror::Error;
use timestore_time::Time;

/// Key under which the partition's descriptive metadata is embedded into the
/// parquet footer.
pub const METADATA_KEY: &str = "timestore.metadata";

/// Errors serializing rows into a partition file. All are permanent; the
/// rows themselves are at fault.
#[derive(Debug, Error)]
pub enum SerializeError {
    /// A row value did not match its declared field type.
    #[error("row {row} column {column:?} is not a valid {expected}: {value}")]
    InvalidValue {
        /// Row index.
        row: usize,
        /// Column name.
        column: String,
        /// Declared type.
        expected: FieldType,
        /// Offending value.
        value: serde_json::Value,
    },

    /// Building the arrow record batch failed.
    #[error("building record batch: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// Writing the parquet bytes failed.
    #[error("writing parquet: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
}

/// The product of serializing one batch of rows.
#[derive(Debug, Clone)]
pub struct SerializedPartition {
    /// The parquet file contents.
    pub bytes: Vec<u8>,
    /// Number of rows written.
    pub row_count: usize,
    /// SHA-256 of `bytes`, lowercase hex.
    pub checksum: String,
    /// Per-column statistics gathered while building the arrays.
    pub column_statistics: BTreeMap<String, ColumnStatistics>,
}

/// SHA-256 of `bytes` as lowercase hex.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// The arrow type a [`FieldType`] maps to.
pub fn arrow_type(field_type: FieldType) -> DataType {
    match field_type {
        FieldType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, None),
        FieldType::String => DataType::Utf8,
        FieldType::Double => DataType::Float64,
        FieldType::Integer => DataType::Int64,
        FieldType::Boolean => DataType::Boolean,
    }
}

/// Serialize `rows` under `fields` into parquet, embedding `file_metadata`
/// into the footer so readers need no side channel to interpret the file.
pub fn serialize_rows(
    fields: &[SchemaField],
    rows: &[Row],
    file_metadata: &serde_json::Value,
) -> Result<SerializedPartition, SerializeError> {
    let arrow_fields: Vec<Field> = fields
        .iter()
        .map(|f| Field::new(&f.name, arrow_type(f.field_type), true))
        .collect();
    let schema = Arc::new(Schema::new(arrow_fields));

    let mut columns: Vec<ArrayRef> = Vec::with_capacity(fields.len());
    let mut column_statistics = BTreeMap::new();
    for field in fields {
        let (array, stats) = build_column(field, rows)?;
        columns.push(array);
        column_statistics.insert(field.name.clone(), stats);
    }

    let batch = RecordBatch::try_new(Arc::clone(&schema), columns)?;

    let props = WriterProperties::builder()
        .set_compression(Compression::ZSTD)
        .set_key_value_metadata(Some(vec![KeyValue {
            key: METADATA_KEY.to_string(),
            value: Some(file_metadata.to_string()),
        }]))
        .build();

    let mut bytes = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut bytes, schema, Some(props))?;
    writer.write(&batch)?;
    writer.close()?;

    let checksum = sha256_hex(&bytes);
    Ok(SerializedPartition {
        bytes,
        row_count: rows.len(),
        checksum,
        column_statistics,
    })
}

fn invalid(row: usize, field: &SchemaField, value: &serde_json::Value) -> SerializeError {
    SerializeError::InvalidValue {
        row,
        column: field.name.clone(),
        expected: field.field_type,
        value: value.clone(),
    }
}

fn build_column(
    field: &SchemaField,
    rows: &[Row],
) -> Result<(ArrayRef, ColumnStatistics), SerializeError> {
    match field.field_type {
        FieldType::Timestamp => {
            let mut values = Vec::with_capacity(rows.len());
            for (i, row) in rows.iter().enumerate() {
                values.push(timestamp_micros(field, i, row)?);
            }
            let stats = numeric_stats(&values, |micros| {
                serde_json::Value::String(Time::from_timestamp_nanos(micros * 1_000).to_rfc3339())
            });
            let array: TimestampMicrosecondArray = values.into_iter().collect();
            Ok((Arc::new(array), stats))
        }
        FieldType::Integer => {
            let mut values = Vec::with_capacity(rows.len());
            for (i, row) in rows.iter().enumerate() {
                let value = match row.get(&field.name) {
                    None | Some(serde_json::Value::Null) => None,
                    Some(v) => Some(v.as_i64().ok_or_else(|| invalid(i, field, v))?),
                };
                values.push(value);
            }
            let stats = numeric_stats(&values, |v| serde_json::json!(v));
            let array: Int64Array = values.into_iter().collect();
            Ok((Arc::new(array), stats))
        }
        FieldType::Double => {
            let mut values = Vec::with_capacity(rows.len());
            for (i, row) in rows.iter().enumerate() {
                let value = match row.get(&field.name) {
                    None | Some(serde_json::Value::Null) => None,
                    Some(v) => Some(v.as_f64().ok_or_else(|| invalid(i, field, v))?),
                };
                values.push(value);
            }
            let stats = float_stats(&values);
            let array: Float64Array = values.into_iter().collect();
            Ok((Arc::new(array), stats))
        }
        FieldType::Boolean => {
            let mut values = Vec::with_capacity(rows.len());
            for (i, row) in rows.iter().enumerate() {
                let value = match row.get(&field.name) {
                    None | Some(serde_json::Value::Null) => None,
                    Some(v) => Some(v.as_bool().ok_or_else(|| invalid(i, field, v))?),
                };
                values.push(value);
            }
            let stats = numeric_stats(&values, |v| serde_json::json!(v));
            let array: BooleanArray = values.into_iter().collect();
            Ok((Arc::new(array), stats))
        }
        FieldType::String => {
            let mut values: Vec<Option<String>> = Vec::with_capacity(rows.len());
            for (i, row) in rows.iter().enumerate() {
                let value = match row.get(&field.name) {
                    None | Some(serde_json::Value::Null) => None,
                    Some(serde_json::Value::String(s)) => Some(s.clone()),
                    Some(v) => return Err(invalid(i, field, v)),
                };
                values.push(value);
            }
            let stats = string_stats(&values);
            let array: StringArray = values.into_iter().collect();
            Ok((Arc::new(array), stats))
        }
    }
}

fn timestamp_micros(field: &SchemaField, i: usize, row: &Row) -> Result<Option<i64>, SerializeError> {
    match row.get(&field.name) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v @ serde_json::Value::String(s)) => Time::from_rfc3339(s)
            .map(|t| Some(t.timestamp_micros()))
            .map_err(|_| invalid(i, field, v)),
        // bare numbers are interpreted as epoch milliseconds
        Some(v @ serde_json::Value::Number(_)) => v
            .as_i64()
            .map(|millis| Some(millis * 1_000))
            .ok_or_else(|| invalid(i, field, v)),
        Some(v) => Err(invalid(i, field, v)),
    }
}

fn numeric_stats<T: Copy + Ord>(
    values: &[Option<T>],
    render: impl Fn(T) -> serde_json::Value,
) -> ColumnStatistics {
    let non_null: Vec<T> = values.iter().filter_map(|v| *v).collect();
    ColumnStatistics {
        min: non_null.iter().min().copied().map(&render),
        max: non_null.iter().max().copied().map(&render),
        null_count: (values.len() - non_null.len()) as i64,
    }
}

fn float_stats(values: &[Option<f64>]) -> ColumnStatistics {
    let non_null: Vec<f64> = values.iter().filter_map(|v| *v).collect();
    let min = non_null.iter().copied().reduce(f64::min);
    let max = non_null.iter().copied().reduce(f64::max);
    ColumnStatistics {
        min: min.map(|v| serde_json::json!(v)),
        max: max.map(|v| serde_json::json!(v)),
        null_count: (values.len() - non_null.len()) as i64,
    }
}

fn string_stats(values: &[Option<String>]) -> ColumnStatistics {
    let non_null: Vec<&String> = values.iter().flatten().collect();
    ColumnStatistics {
        min: non_null.iter().min().map(|v| serde_json::json!(v)),
        max: non_null.iter().max().map(|v| serde_json::json!(v)),
        null_count: (values.len() - non_null.len()) as i64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parquet::arrow::{ArrowReader, ParquetFileArrowReader};

    fn fields() -> Vec<SchemaField> {
        vec![
            SchemaField::new("t", FieldType::Timestamp),
            SchemaField::new("v", FieldType::Double),
            SchemaField::new("tag", FieldType::String),
        ]
    }

    fn rows() -> Vec<Row> {
        let rows = serde_json::json!([
            {"t": "2024-01-01T00:00:00Z", "v": 1.0, "tag": "a"},
            {"t": "2024-01-01T00:04:00Z", "v": 2.5, "tag": null},
        ]);
        serde_json::from_value(rows).unwrap()
    }

    #[test]
    fn serialized_file_is_self_describing() {
        let out = serialize_rows(
            &fields(),
            &rows(),
            &serde_json::json!({"datasetSlug": "obs-1", "tableName": "records"}),
        )
        .unwrap();
        assert_eq!(out.row_count, 2);
        assert_eq!(out.checksum, sha256_hex(&out.bytes));

        let mut reader =
            ParquetFileArrowReader::try_new(bytes::Bytes::from(out.bytes.clone())).unwrap();
        let schema = reader.get_schema().unwrap();
        assert_eq!(schema.fields().len(), 3);
        assert_eq!(
            schema.field(0).data_type(),
            &DataType::Timestamp(TimeUnit::Microsecond, None)
        );

        let batch = reader
            .get_record_reader(1024)
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        assert_eq!(batch.num_rows(), 2);
    }

    #[test]
    fn column_statistics_track_min_max_and_nulls() {
        let out = serialize_rows(&fields(), &rows(), &serde_json::json!({})).unwrap();

        let v = &out.column_statistics["v"];
        assert_eq!(v.min, Some(serde_json::json!(1.0)));
        assert_eq!(v.max, Some(serde_json::json!(2.5)));
        assert_eq!(v.null_count, 0);

        let tag = &out.column_statistics["tag"];
        assert_eq!(tag.min, Some(serde_json::json!("a")));
        assert_eq!(tag.null_count, 1);

        let t = &out.column_statistics["t"];
        assert_eq!(t.min, Some(serde_json::json!("2024-01-01T00:00:00.000Z")));
        assert_eq!(t.max, Some(serde_json::json!("2024-01-01T00:04:00.000Z")));
    }

    #[test]
    fn mismatched_value_is_a_permanent_serialize_error() {
        let mut bad = rows();
        bad[0].insert("v".to_string(), serde_json::json!("nope"));

        let err = serialize_rows(&fields(), &bad, &serde_json::json!({})).unwrap_err();
        assert!(matches!(err, SerializeError::InvalidValue { row: 0, .. }));
    }

    #[test]
    fn identical_input_produces_identical_checksums() {
        let a = serialize_rows(&fields(), &rows(), &serde_json::json!({})).unwrap();
        let b = serialize_rows(&fields(), &rows(), &serde_json::json!({})).unwrap();
        assert_eq!(a.checksum, b.checksum);
    }
}

//! Classification of a proposed ingestion schema against the dataset's
//! current baseline.

use crate::schema::{FieldType, SchemaField};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One column the migration plan will add, with its optional backfill
/// default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnAddition {
    /// Name of the added column.
    pub name: String,
    /// Type of the added column.
    pub field_type: FieldType,
    /// Default value for pre-existing rows, if the caller supplied one.
    pub default: Option<serde_json::Value>,
}

/// The additions required to move existing partitions to the new schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationPlan {
    /// Columns to add, in proposed-schema order.
    pub added_columns: Vec<ColumnAddition>,
}

impl MigrationPlan {
    /// Build the plan for `added` fields, attaching any caller-supplied
    /// per-column defaults.
    pub fn for_additions(
        added: &[SchemaField],
        defaults: &BTreeMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            added_columns: added
                .iter()
                .map(|f| ColumnAddition {
                    name: f.name.clone(),
                    field_type: f.field_type,
                    default: defaults.get(&f.name).cloned(),
                })
                .collect(),
        }
    }
}

/// How a proposed schema relates to the baseline schema of the dataset.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaTransition {
    /// Same ordered `(name, type)` list.
    Identical,
    /// Baseline is a subset (by name, types unchanged) of the proposal; the
    /// remaining fields are additions.
    Additive {
        /// The fields present in the proposal but not in the baseline.
        added: Vec<SchemaField>,
    },
    /// Any type change, removal or rename.
    Breaking {
        /// Human-readable reasons, one per offending field.
        reasons: Vec<String>,
    },
}

impl SchemaTransition {
    /// Whether the transition permits appending to the baseline manifest.
    pub fn is_compatible(&self) -> bool {
        !matches!(self, Self::Breaking { .. })
    }
}

/// Classify `proposed` against `baseline`.
///
/// A rename surfaces as a removal of the old name (breaking); reordering
/// alone is additive with no added fields, since the baseline remains a
/// subset with unchanged types.
pub fn classify(baseline: &[SchemaField], proposed: &[SchemaField]) -> SchemaTransition {
    if baseline == proposed {
        return SchemaTransition::Identical;
    }

    let proposed_by_name: BTreeMap<&str, FieldType> = proposed
        .iter()
        .map(|f| (f.name.as_str(), f.field_type))
        .collect();

    let mut reasons = Vec::new();
    for field in baseline {
        match proposed_by_name.get(field.name.as_str()) {
            None => reasons.push(format!("column {} removed", field.name)),
            Some(new_type) if *new_type != field.field_type => reasons.push(format!(
                "column {} changed type from {} to {}",
                field.name, field.field_type, new_type
            )),
            Some(_) => {}
        }
    }

    if !reasons.is_empty() {
        return SchemaTransition::Breaking { reasons };
    }

    let baseline_names: BTreeMap<&str, ()> =
        baseline.iter().map(|f| (f.name.as_str(), ())).collect();
    let added = proposed
        .iter()
        .filter(|f| !baseline_names.contains_key(f.name.as_str()))
        .cloned()
        .collect();

    SchemaTransition::Additive { added }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn baseline() -> Vec<SchemaField> {
        vec![
            SchemaField::new("t", FieldType::Timestamp),
            SchemaField::new("v", FieldType::Double),
        ]
    }

    #[test]
    fn identical_schema() {
        assert_matches!(
            classify(&baseline(), &baseline()),
            SchemaTransition::Identical
        );
    }

    #[test]
    fn added_column_is_additive() {
        let mut proposed = baseline();
        proposed.push(SchemaField::new("tag", FieldType::String));

        assert_matches!(
            classify(&baseline(), &proposed),
            SchemaTransition::Additive { added } => {
                assert_eq!(added, vec![SchemaField::new("tag", FieldType::String)]);
            }
        );
    }

    #[test]
    fn reorder_without_changes_is_additive_with_no_additions() {
        let mut proposed = baseline();
        proposed.reverse();

        assert_matches!(
            classify(&baseline(), &proposed),
            SchemaTransition::Additive { added } => assert!(added.is_empty())
        );
    }

    #[test]
    fn type_change_is_breaking() {
        let proposed = vec![
            SchemaField::new("t", FieldType::Timestamp),
            SchemaField::new("v", FieldType::Integer),
        ];

        assert_matches!(
            classify(&baseline(), &proposed),
            SchemaTransition::Breaking { reasons } => {
                assert_eq!(reasons, vec!["column v changed type from double to integer"]);
            }
        );
    }

    #[test]
    fn removal_and_rename_are_breaking() {
        let proposed = vec![
            SchemaField::new("t", FieldType::Timestamp),
            SchemaField::new("value", FieldType::Double),
        ];

        assert_matches!(
            classify(&baseline(), &proposed),
            SchemaTransition::Breaking { reasons } => {
                assert_eq!(reasons, vec!["column v removed"]);
            }
        );
    }

    #[test]
    fn migration_plan_carries_defaults() {
        let added = vec![SchemaField::new("tag", FieldType::String)];
        let mut defaults = BTreeMap::new();
        defaults.insert("tag".to_string(), serde_json::json!("unknown"));

        let plan = MigrationPlan::for_additions(&added, &defaults);
        assert_eq!(plan.added_columns.len(), 1);
        assert_eq!(
            plan.added_columns[0].default,
            Some(serde_json::json!("unknown"))
        );
    }
}

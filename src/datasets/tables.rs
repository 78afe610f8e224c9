//! Table layouts for dataset storage.
//!
//! Two static tables (the dataset-type directory and the dataset directory)
//! plus, per distinct dimension group, a tags table and (for calibration
//! types) a calibs table shared by every dataset type with those
//! dimensions. Dynamic table names are a pure function of the group's
//! encoding, so concurrent creators converge on the same table.

use crate::collections::COLLECTION_TABLE;
use crate::database::{FieldSpec, FieldType, ForeignKeySpec, TableSpec};
use crate::dimensions::{DimensionGraph, DimensionUniverse, KeyType};
use crate::error::Result;

pub(crate) const DATASET_TYPE_TABLE: &str = "dataset_type";
pub(crate) const DATASET_TABLE: &str = "dataset";

pub(crate) fn dataset_type_spec() -> TableSpec {
    TableSpec::new(vec![
        FieldSpec::new("dataset_type_id", FieldType::Int).autoincrement(),
        FieldSpec::new("name", FieldType::String),
        FieldSpec::new("storage_class", FieldType::String),
        FieldSpec::new("dimensions_encoded", FieldType::String),
        FieldSpec::new("is_calibration", FieldType::Bool),
        FieldSpec::new("tag_association_table", FieldType::String),
        FieldSpec::new("calibration_association_table", FieldType::String).nullable(),
    ])
    .with_unique(&["name"])
}

pub(crate) fn dataset_spec() -> TableSpec {
    TableSpec::new(vec![
        FieldSpec::new("dataset_id", FieldType::Int).autoincrement(),
        FieldSpec::new("dataset_type_id", FieldType::Int),
        FieldSpec::new("run_id", FieldType::Int),
    ])
    .with_foreign_key(ForeignKeySpec::new(
        DATASET_TYPE_TABLE,
        &["dataset_type_id"],
        &["dataset_type_id"],
    ))
    .with_foreign_key(
        ForeignKeySpec::new(COLLECTION_TABLE, &["run_id"], &["collection_id"]).cascade(),
    )
}

pub(crate) fn tags_table_name(dimensions: &DimensionGraph) -> String {
    format!("dataset_tags_{}", dimensions.encode())
}

pub(crate) fn calibs_table_name(dimensions: &DimensionGraph) -> String {
    format!("dataset_calibs_{}", dimensions.encode())
}

fn association_fields(
    universe: &DimensionUniverse,
    dimensions: &DimensionGraph,
) -> Result<Vec<FieldSpec>> {
    dimensions
        .required()
        .iter()
        .map(|name| {
            let dtype = match universe.key_type(name)? {
                KeyType::Int => FieldType::Int,
                KeyType::String => FieldType::String,
            };
            Ok(FieldSpec::new(name, dtype))
        })
        .collect()
}

fn with_association_keys(spec: TableSpec) -> TableSpec {
    spec.with_foreign_key(
        ForeignKeySpec::new(DATASET_TABLE, &["dataset_id"], &["dataset_id"]).cascade(),
    )
    .with_foreign_key(
        ForeignKeySpec::new(COLLECTION_TABLE, &["collection_id"], &["collection_id"])
            .cascade(),
    )
}

/// Membership of datasets in RUN and TAGGED collections.
///
/// A data ID appears at most once per dataset type and collection.
pub(crate) fn tags_spec(
    universe: &DimensionUniverse,
    dimensions: &DimensionGraph,
) -> Result<TableSpec> {
    let mut fields = vec![
        FieldSpec::new("dataset_type_id", FieldType::Int),
        FieldSpec::new("dataset_id", FieldType::Int).primary_key(),
        FieldSpec::new("collection_id", FieldType::Int).primary_key(),
    ];
    fields.extend(association_fields(universe, dimensions)?);
    let mut unique: Vec<&str> = vec!["dataset_type_id", "collection_id"];
    unique.extend(dimensions.required().iter().map(String::as_str));
    Ok(with_association_keys(TableSpec::new(fields).with_unique(&unique)))
}

/// Validity ranges of datasets in CALIBRATION collections. Overlaps for
/// the same data ID are rejected before insert.
pub(crate) fn calibs_spec(
    universe: &DimensionUniverse,
    dimensions: &DimensionGraph,
) -> Result<TableSpec> {
    let mut fields = vec![
        FieldSpec::new("id", FieldType::Int).autoincrement(),
        FieldSpec::new("dataset_type_id", FieldType::Int),
        FieldSpec::new("dataset_id", FieldType::Int),
        FieldSpec::new("collection_id", FieldType::Int),
    ];
    fields.extend(association_fields(universe, dimensions)?);
    fields.push(FieldSpec::new("validity_begin", FieldType::Timestamp).nullable());
    fields.push(FieldSpec::new("validity_end", FieldType::Timestamp).nullable());
    Ok(with_association_keys(TableSpec::new(fields)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ButlerConfig;

    #[test]
    fn dynamic_tables_are_named_by_dimension_group() {
        let universe = ButlerConfig::default_config().universe().unwrap();
        let a = universe.extract(["visit", "detector"]).unwrap();
        let b = universe.extract(["instrument", "detector", "visit"]).unwrap();
        let c = universe.extract(["instrument", "visit"]).unwrap();
        assert_eq!(tags_table_name(&a), tags_table_name(&b));
        assert_ne!(tags_table_name(&a), tags_table_name(&c));

        let spec = tags_spec(&universe, &a).unwrap();
        assert!(spec.field("detector").is_some());
        assert!(spec.field("physical_filter").is_none());
        assert_eq!(spec.primary_key(), ["dataset_id", "collection_id"]);
    }
}

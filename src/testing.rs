//! Helpers for building small repositories in tests.
//!
//! These favor convenience over realism: related dimensions are linked to
//! whatever value happens to exist first, and secondary keys (such as a
//! detector's full name) are derived from the primary key value.

use crate::config::ButlerConfig;
use crate::database::FieldType;
use crate::datasets::{DatasetId, DatasetRef, DatasetType, FileDataset};
use crate::datastore::{Datastore, TransferMode};
use crate::dimensions::{DataCoordinate, DataIdValue, DimensionElement, KeyType};
use crate::error::{RegistryError, Result};
use crate::registry::Registry;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Mutex;

pub const MOCK_PATH: &str = "mock/path";
pub const MOCK_FORMATTER: &str = "lsst.daf.butler.formatters.json.JsonFormatter";

/// An in-memory repository holding one record per value in `data_ids`.
///
/// `data_ids` maps dimension names to primary key values. Each record's
/// required dimensions point at the first value given for that dimension,
/// and implied dimensions do the same when values were given for them.
pub fn make_test_repo(
    config: Option<ButlerConfig>,
    data_ids: &BTreeMap<String, Vec<Value>>,
) -> Result<Registry> {
    let registry = Registry::in_memory(config.unwrap_or_else(ButlerConfig::default_config))?;
    let universe = registry.universe();

    let mut filled: BTreeMap<&str, Vec<BTreeMap<String, Value>>> = BTreeMap::new();
    let mut firsts: BTreeMap<&str, Value> = BTreeMap::new();
    for (name, values) in data_ids {
        let element = universe.get(name)?;
        let records: Vec<_> = values.iter().map(|v| fill_all_keys(element, v)).collect();
        if let Some(first) = records.first() {
            if let Some(key) = first.get(&element.primary_key().name) {
                firsts.insert(name.as_str(), key.clone());
            }
        }
        filled.insert(name.as_str(), records);
    }

    for (name, records) in &mut filled {
        let element = universe.get(name)?;
        for record in records.iter_mut() {
            for other in element.required() {
                let first = firsts.get(other.as_str()).ok_or_else(|| {
                    RegistryError::invalid(format!("{name} requires values for '{other}'"))
                })?;
                record.insert(other.clone(), first.clone());
            }
            for other in element.implied() {
                if universe.get(other)?.view_of().is_some() {
                    continue;
                }
                if let Some(first) = firsts.get(other.as_str()) {
                    record.insert(other.clone(), first.clone());
                }
            }
        }
    }

    for element in universe.sorted(filled.keys().copied())? {
        if let Some(records) = filled.get(element.name()) {
            registry.insert_dimension_data(element, records.clone())?;
        }
    }
    Ok(registry)
}

/// Register a dataset type built from plain names.
pub fn add_dataset_type(
    registry: &mut Registry,
    name: &str,
    dimensions: &[&str],
    storage_class: &str,
) -> Result<DatasetType> {
    let dataset_type = registry.make_dataset_type(name, dimensions, storage_class, false)?;
    registry.register_dataset_type(&dataset_type)?;
    Ok(dataset_type)
}

/// Add one value of `dimension`, linking unspecified related dimensions to
/// existing values.
///
/// `related` may only name dimensions that `dimension` requires or implies.
/// A record the database rejects is reported as
/// [`RegistryError::DataIdValue`], whose message suggests passing the
/// related keys explicitly.
pub fn add_data_id_value(
    registry: &Registry,
    dimension: &str,
    value: Value,
    related: &BTreeMap<String, Value>,
) -> Result<()> {
    let element = registry.universe().get(dimension)?;
    let allowed: BTreeSet<&String> = element.required().iter().chain(element.implied()).collect();
    let extra: Vec<&String> = related.keys().filter(|k| !allowed.contains(k)).collect();
    if !extra.is_empty() {
        return Err(RegistryError::invalid(format!(
            "unexpected keys {extra:?} not found in {allowed:?}"
        )));
    }

    let mut fields = fill_all_keys(element, &value);
    fields.extend(related.clone());
    fill_relationships(registry, element, &mut fields)?;
    registry
        .sync_dimension_data(element, fields)
        .map_err(|err| {
            if err.is_integrity() {
                RegistryError::DataIdValue {
                    element: dimension.to_string(),
                    source: Box::new(err),
                }
            } else {
                err
            }
        })?;
    Ok(())
}

/// The one data ID matching `partial`.
///
/// Fails unless exactly one data ID over the dimensions `partial` names
/// matches it.
pub fn expand_unique_id(
    registry: &Registry,
    partial: &BTreeMap<String, DataIdValue>,
) -> Result<DataCoordinate> {
    let graph = registry
        .universe()
        .extract(partial.keys().map(String::as_str))?;
    let dimensions: Vec<&str> = graph.required().iter().map(String::as_str).collect();
    let mut matches = registry.query_data_ids(&dimensions, partial)?;
    if matches.len() != 1 {
        return Err(RegistryError::invalid(format!(
            "found {} matches for {partial:?}, expected 1",
            matches.len()
        )));
    }
    Ok(matches.remove(0))
}

/// Primary key, secondary keys and mandatory metadata derived from `value`.
fn fill_all_keys(element: &DimensionElement, value: &Value) -> BTreeMap<String, Value> {
    let mut fields = BTreeMap::new();
    let primary = element.primary_key();
    fields.insert(primary.name.clone(), cast_key(primary.dtype, value));
    for key in element.unique_keys() {
        fields.insert(key.name.clone(), cast_key(key.dtype, value));
    }
    for meta in element.metadata().iter().filter(|m| !m.nullable) {
        fields.insert(meta.name.clone(), cast_field(meta.dtype, value));
    }
    fields
}

fn cast_key(dtype: KeyType, value: &Value) -> Value {
    match dtype {
        KeyType::Int => cast_field(FieldType::Int, value),
        KeyType::String => cast_field(FieldType::String, value),
    }
}

fn cast_field(dtype: FieldType, value: &Value) -> Value {
    match dtype {
        FieldType::Int => match value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .map_or(Value::from(0), Value::from),
            Value::String(s) => Value::from(s.trim().parse::<i64>().unwrap_or(0)),
            Value::Bool(b) => Value::from(i64::from(*b)),
            _ => Value::from(0),
        },
        FieldType::String | FieldType::Timestamp => match value {
            Value::String(s) => Value::from(s.as_str()),
            Value::Null => Value::from(""),
            other => Value::from(other.to_string()),
        },
        FieldType::Bool => Value::from(match value {
            Value::Bool(b) => *b,
            Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
            Value::String(s) => !s.is_empty(),
            _ => false,
        }),
        FieldType::Json => value.clone(),
    }
}

fn fill_relationships(
    registry: &Registry,
    element: &DimensionElement,
    fields: &mut BTreeMap<String, Value>,
) -> Result<()> {
    let universe = registry.universe();
    for other in element.required() {
        if fields.contains_key(other) {
            continue;
        }
        let value = first_value(registry, other)?.ok_or_else(|| {
            RegistryError::invalid(format!("no matching values for {other} found"))
        })?;
        fields.insert(other.clone(), value);
    }
    for other in element.implied() {
        if fields.contains_key(other) || !universe.get(other)?.is_exported() {
            continue;
        }
        if let Some(value) = first_value(registry, other)? {
            fields.insert(other.clone(), value);
        }
    }
    Ok(())
}

fn first_value(registry: &Registry, dimension: &str) -> Result<Option<Value>> {
    Ok(registry
        .query_dimension_records(dimension, &BTreeMap::new())?
        .first()
        .and_then(|record| record.data_id().get(dimension))
        .map(DataIdValue::to_json))
}

/// Datastore that claims every dataset lives at [`MOCK_PATH`] and only
/// remembers what it was asked to ingest.
#[derive(Default)]
pub struct DatastoreMock {
    ingested: Mutex<Vec<FileDataset>>,
}

impl DatastoreMock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ingested(&self) -> Vec<FileDataset> {
        self.ingested
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl Datastore for DatastoreMock {
    fn export(
        &self,
        refs: &[DatasetRef],
        _directory: Option<&Path>,
        _transfer: Option<TransferMode>,
    ) -> Result<Vec<FileDataset>> {
        Ok(refs
            .iter()
            .map(|r| FileDataset::new(vec![r.clone()], MOCK_PATH, Some(MOCK_FORMATTER.to_string())))
            .collect())
    }

    fn ingest(
        &self,
        datasets: &[FileDataset],
        _directory: Option<&Path>,
        _transfer: Option<TransferMode>,
    ) -> Result<()> {
        self.ingested
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend_from_slice(datasets);
        Ok(())
    }

    fn forget(&self, _ids: &[DatasetId]) -> Result<()> {
        Ok(())
    }

    fn knows(&self, dataset: &DatasetRef) -> Result<bool> {
        Ok(dataset.is_resolved())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn repo() -> Registry {
        let data_ids = BTreeMap::from([
            ("instrument".to_string(), vec![json!("notACam")]),
            ("physical_filter".to_string(), vec![json!("k2020")]),
            ("visit".to_string(), vec![json!(101)]),
            ("detector".to_string(), vec![json!(5)]),
        ]);
        make_test_repo(None, &data_ids).unwrap()
    }

    #[test]
    fn test_repo_links_related_dimensions() {
        let registry = repo();
        let detectors = registry
            .query_dimension_records("detector", &BTreeMap::new())
            .unwrap();
        assert_eq!(detectors.len(), 1);
        assert_eq!(detectors[0].get("full_name"), Some(&json!("5")));
        assert_eq!(detectors[0].get("instrument"), Some(&json!("notACam")));

        let visit = expand_unique_id(
            &registry,
            &BTreeMap::from([("visit".to_string(), DataIdValue::Int(101))]),
        )
        .unwrap();
        assert_eq!(visit.get("instrument"), Some(&DataIdValue::from("notACam")));
    }

    #[test]
    fn add_dataset_type_rejects_unknown_names() {
        let mut registry = repo();
        add_dataset_type(&mut registry, "DataType1", &["instrument"], "NumpyArray").unwrap();
        let dimensions = ["instrument", "visit", "detector"];
        add_dataset_type(&mut registry, "DataType2", &dimensions, "NumpyArray").unwrap();
        assert_eq!(registry.query_dataset_types(None).len(), 2);
        let unknown = add_dataset_type(&mut registry, "DataType3", &["4thDimension"], "NumpyArray");
        assert!(unknown.is_err());
        let unstorable =
            add_dataset_type(&mut registry, "DataType3", &["instrument"], "UnstorableType");
        assert!(unstorable.is_err());
    }

    #[test]
    fn add_data_id_value_links_and_validates() {
        let registry = repo();
        add_data_id_value(&registry, "skymap", json!("map"), &BTreeMap::new()).unwrap();
        add_data_id_value(&registry, "tract", json!(42), &BTreeMap::new()).unwrap();
        add_data_id_value(
            &registry,
            "tract",
            json!(43),
            &BTreeMap::from([("skymap".to_string(), json!("map"))]),
        )
        .unwrap();
        for patch in 0..3 {
            for tract in [42, 43] {
                add_data_id_value(
                    &registry,
                    "patch",
                    json!(patch),
                    &BTreeMap::from([("tract".to_string(), json!(tract))]),
                )
                .unwrap();
            }
        }
        let patches = registry
            .query_data_ids(&["patch"], &BTreeMap::new())
            .unwrap();
        assert_eq!(patches.len(), 6);

        let err = add_data_id_value(
            &registry,
            "detector",
            json!(6),
            &BTreeMap::from([("visit".to_string(), json!(101))]),
        )
        .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidArgument(_)), "{err}");

        let err = add_data_id_value(
            &registry,
            "visit",
            json!(102),
            &BTreeMap::from([("physical_filter".to_string(), json!("nonexistent"))]),
        )
        .unwrap_err();
        assert!(matches!(err, RegistryError::DataIdValue { .. }), "{err}");
    }
}

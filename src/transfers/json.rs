//! JSON realization of the export file.
//!
//! A document is `{"description", "version", "data"}` where `data` lists
//! typed entries in replay order. Object keys are written sorted, so equal
//! closures always produce identical bytes.

use super::format::{Entry, ExportDocument, FileEntry, ValidityEntry};
use super::{RepoExportBackend, RepoImportBackend};
use crate::collections::{CollectionRecord, CollectionType};
use crate::datasets::{DatasetAssociation, DatasetRef, DatasetType, FileDataset};
use crate::datastore::{Datastore, TransferMode};
use crate::dimensions::{
    DataCoordinate, DataIdValue, DimensionElement, DimensionGraph, DimensionRecord,
};
use crate::error::{RegistryError, Result};
use crate::registry::Registry;
use crate::schema_loader::EXPORT_SCHEMA;
use crate::timespan::Timespan;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};
use std::path::Path;

pub const EXPORT_VERSION: &str = "1.0.0";

const DEFAULT_DESCRIPTION: &str = "butler repository export";

pub struct JsonRepoExportBackend<W: Write> {
    writer: W,
    description: String,
    data: Vec<Entry>,
    dataset_types: BTreeSet<String>,
}

impl<W: Write> JsonRepoExportBackend<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            description: DEFAULT_DESCRIPTION.to_string(),
            data: Vec::new(),
            dataset_types: BTreeSet::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> RepoExportBackend for JsonRepoExportBackend<W> {
    fn save_dimension_data(
        &mut self,
        element: &DimensionElement,
        records: &[DimensionRecord],
    ) -> Result<()> {
        self.data.push(Entry::Dimension {
            element: element.name().to_string(),
            records: records
                .iter()
                .map(|r| r.fields().clone().into_iter().collect())
                .collect(),
        });
        Ok(())
    }

    fn save_collection(&mut self, record: &CollectionRecord, doc: Option<&str>) -> Result<()> {
        self.data.push(Entry::Collection {
            name: record.name().to_string(),
            collection_type: record.collection_type(),
            doc: doc.map(str::to_string),
            children: record.children().to_vec(),
        });
        Ok(())
    }

    fn save_datasets(
        &mut self,
        dataset_type: &DatasetType,
        run: &str,
        datasets: &[FileDataset],
    ) -> Result<()> {
        if self.dataset_types.insert(dataset_type.name().to_string()) {
            self.data.push(Entry::DatasetType {
                name: dataset_type.name().to_string(),
                dimensions: dataset_type.dimensions().required().to_vec(),
                storage_class: dataset_type.storage_class().name().to_string(),
                is_calibration: dataset_type.is_calibration(),
            });
        }
        let records = datasets
            .iter()
            .map(|file| {
                Ok(FileEntry {
                    dataset_id: file
                        .refs
                        .iter()
                        .map(|r| r.require_resolved().map(|(id, _)| id))
                        .collect::<Result<_>>()?,
                    data_id: file.refs.iter().map(|r| data_id_json(r.data_id())).collect(),
                    path: file.path.clone(),
                    formatter: file.formatter.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        self.data.push(Entry::Dataset {
            dataset_type: dataset_type.name().to_string(),
            run: run.to_string(),
            records,
        });
        Ok(())
    }

    fn save_dataset_associations(
        &mut self,
        collection: &str,
        collection_type: CollectionType,
        associations: &[DatasetAssociation],
    ) -> Result<()> {
        let mut dataset_ids = Vec::new();
        let mut validity_ranges = Vec::new();
        match collection_type {
            CollectionType::Tagged => {
                for association in associations {
                    dataset_ids.push(association.dataset.require_resolved()?.0);
                }
                dataset_ids.sort_unstable();
            }
            CollectionType::Calibration => {
                let mut by_range: BTreeMap<Timespan, Vec<i64>> = BTreeMap::new();
                for association in associations {
                    let timespan = association.timespan.unwrap_or_default();
                    by_range
                        .entry(timespan)
                        .or_default()
                        .push(association.dataset.require_resolved()?.0);
                }
                for (timespan, mut ids) in by_range {
                    ids.sort_unstable();
                    validity_ranges.push(ValidityEntry {
                        begin: bound_text(&timespan.begin),
                        end: bound_text(&timespan.end),
                        dataset_ids: ids,
                    });
                }
            }
            other => {
                return Err(RegistryError::invalid(format!(
                    "{other} collection '{collection}' has no exportable associations"
                )));
            }
        }
        self.data.push(Entry::Associations {
            collection: collection.to_string(),
            collection_type,
            dataset_ids,
            validity_ranges,
        });
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let document = ExportDocument {
            description: self.description.clone(),
            version: EXPORT_VERSION.to_string(),
            data: std::mem::take(&mut self.data),
        };
        // Going through Value sorts every object's keys.
        let value = serde_json::to_value(&document)?;
        serde_json::to_writer_pretty(&mut self.writer, &value)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

fn data_id_json(data_id: &DataCoordinate) -> Map<String, Value> {
    data_id
        .required_values()
        .into_iter()
        .map(|(k, v)| (k, v.to_json()))
        .collect()
}

fn bound_text(bound: &Option<chrono::DateTime<chrono::Utc>>) -> Option<String> {
    Timespan::bound_to_json(*bound).as_str().map(str::to_string)
}

/// Reads an export document written by [`JsonRepoExportBackend`].
pub struct JsonRepoImportBackend {
    document: ExportDocument,
}

impl JsonRepoImportBackend {
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let value: Value = serde_json::from_reader(reader)?;
        Self::from_value(value)
    }

    /// Check the version and the document structure before accepting it.
    pub fn from_value(value: Value) -> Result<Self> {
        if let Some(version) = value.get("version").and_then(Value::as_str) {
            let allowed = EXPORT_SCHEMA.allowed_versions();
            if !allowed.iter().any(|v| v == version) {
                return Err(RegistryError::invalid(format!(
                    "export version {version} is not supported (expected one of {allowed:?})"
                )));
            }
        }
        EXPORT_SCHEMA.validate(&value).map_err(RegistryError::InvalidArgument)?;
        Ok(Self {
            document: serde_json::from_value(value)?,
        })
    }

    pub fn description(&self) -> &str {
        &self.document.description
    }
}

impl RepoImportBackend for JsonRepoImportBackend {
    fn register(&self, registry: &mut Registry) -> Result<()> {
        let mut chains = Vec::new();
        for entry in &self.document.data {
            match entry {
                Entry::DatasetType {
                    name,
                    dimensions,
                    storage_class,
                    is_calibration,
                } => {
                    let dimensions: Vec<&str> = dimensions.iter().map(String::as_str).collect();
                    let dataset_type = registry.make_dataset_type(
                        name,
                        &dimensions,
                        storage_class,
                        *is_calibration,
                    )?;
                    registry.register_dataset_type(&dataset_type)?;
                }
                Entry::Collection {
                    name,
                    collection_type,
                    doc,
                    children,
                } => {
                    registry.register_collection(name, *collection_type, doc.as_deref())?;
                    if *collection_type == CollectionType::Chained {
                        chains.push((name, children));
                    }
                }
                _ => {}
            }
        }
        for (name, children) in chains {
            registry.set_collection_chain(name, children)?;
        }
        Ok(())
    }

    fn load(
        &self,
        registry: &Registry,
        datastore: Option<&dyn Datastore>,
        directory: Option<&Path>,
        transfer: Option<TransferMode>,
        skip_dimensions: &BTreeSet<String>,
    ) -> Result<()> {
        let mut remapped: BTreeMap<i64, DatasetRef> = BTreeMap::new();
        let mut files = Vec::new();
        for entry in &self.document.data {
            match entry {
                Entry::Dimension { element, records } => {
                    if skip_dimensions.contains(element) {
                        continue;
                    }
                    for record in records {
                        registry.sync_dimension_data(element.as_str(), record.clone())?;
                    }
                }
                Entry::Dataset {
                    dataset_type,
                    run,
                    records,
                } => {
                    let graph = registry.get_dataset_type(dataset_type)?.dimensions().clone();
                    let mut old_ids = Vec::new();
                    let mut data_ids = Vec::new();
                    for file in records {
                        if file.dataset_id.len() != file.data_id.len() {
                            return Err(RegistryError::invalid(format!(
                                "file '{}' lists {} dataset ids but {} data IDs",
                                file.path,
                                file.dataset_id.len(),
                                file.data_id.len()
                            )));
                        }
                        for (id, values) in file.dataset_id.iter().zip(&file.data_id) {
                            old_ids.push(*id);
                            data_ids.push(coordinate(&graph, values)?);
                        }
                    }
                    let refs = registry.insert_datasets(dataset_type, &data_ids, run)?;
                    remapped.extend(old_ids.into_iter().zip(refs));
                    for file in records {
                        files.push(FileDataset::new(
                            lookup(&remapped, &file.dataset_id)?,
                            file.path.clone(),
                            file.formatter.clone(),
                        ));
                    }
                }
                Entry::Associations {
                    collection,
                    collection_type,
                    dataset_ids,
                    validity_ranges,
                } => match collection_type {
                    CollectionType::Tagged => {
                        registry.associate(collection, &lookup(&remapped, dataset_ids)?)?;
                    }
                    CollectionType::Calibration => {
                        for range in validity_ranges {
                            let timespan = Timespan::new(
                                parse_bound(range.begin.as_deref())?,
                                parse_bound(range.end.as_deref())?,
                            )?;
                            registry.certify(
                                collection,
                                &lookup(&remapped, &range.dataset_ids)?,
                                timespan,
                            )?;
                        }
                    }
                    other => {
                        return Err(RegistryError::invalid(format!(
                            "associations into {other} collection '{collection}' cannot be imported"
                        )));
                    }
                },
                Entry::Collection { .. } | Entry::DatasetType { .. } => {}
            }
        }
        if let Some(datastore) = datastore {
            datastore.ingest(&files, directory, transfer)?;
        }
        tracing::info!(datasets = remapped.len(), files = files.len(), "loaded export");
        Ok(())
    }
}

fn coordinate(graph: &DimensionGraph, values: &Map<String, Value>) -> Result<DataCoordinate> {
    let values = values
        .iter()
        .map(|(k, v)| {
            DataIdValue::from_json(v).map(|v| (k.clone(), v)).ok_or_else(|| {
                RegistryError::invalid(format!("data ID value {v} for '{k}' is not a key"))
            })
        })
        .collect::<Result<BTreeMap<_, _>>>()?;
    DataCoordinate::standardize(graph, values)
}

fn lookup(remapped: &BTreeMap<i64, DatasetRef>, ids: &[i64]) -> Result<Vec<DatasetRef>> {
    ids.iter()
        .map(|id| {
            remapped.get(id).cloned().ok_or_else(|| {
                RegistryError::invalid(format!(
                    "export refers to dataset {id}, which it does not contain"
                ))
            })
        })
        .collect()
}

fn parse_bound(text: Option<&str>) -> Result<Option<chrono::DateTime<chrono::Utc>>> {
    match text {
        Some(text) => Timespan::parse_bound(text),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_versions_are_rejected() {
        let err = JsonRepoImportBackend::from_value(json!({
            "description": "x",
            "version": "0.1.0",
            "data": []
        }))
        .err()
        .unwrap();
        assert!(err.to_string().contains("0.1.0"), "{err}");
    }

    #[test]
    fn malformed_entries_fail_schema_validation() {
        let err = JsonRepoImportBackend::from_value(json!({
            "description": "x",
            "version": EXPORT_VERSION,
            "data": [{"type": "collection", "name": "run1"}]
        }))
        .err()
        .unwrap();
        assert!(matches!(err, RegistryError::InvalidArgument(_)), "{err}");
    }

    #[test]
    fn empty_exports_are_valid_and_sorted() {
        let mut backend = JsonRepoExportBackend::new(Vec::new()).with_description("empty");
        backend.finish().unwrap();
        let text = String::from_utf8(backend.into_inner()).unwrap();
        let data = text.find("\"data\"").unwrap();
        let description = text.find("\"description\"").unwrap();
        let version = text.find("\"version\"").unwrap();
        assert!(data < description && description < version);

        let import = JsonRepoImportBackend::from_reader(text.as_bytes()).unwrap();
        assert_eq!(import.description(), "empty");
    }
}

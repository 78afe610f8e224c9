use super::refs::{DatasetAssociation, DatasetId, DatasetRef};
use super::types::DatasetType;
use crate::collections::{CollectionManager, CollectionRecord, CollectionType};
use crate::database::{Database, Predicate, Row, Select, Table, int_column, row};
use crate::dimensions::{DataCoordinate, DataIdValue};
use crate::error::{RegistryError, Result};
use crate::timespan::Timespan;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Datasets of one dataset type: insertion into RUNs, TAGGED associations
/// and CALIBRATION certifications, and lookups by data ID.
pub struct DatasetRecordStorage {
    db: Arc<dyn Database>,
    dataset_type: DatasetType,
    dataset_type_id: i64,
    datasets: Table,
    tags: Table,
    calibs: Option<Table>,
}

impl DatasetRecordStorage {
    pub(crate) fn new(
        db: Arc<dyn Database>,
        dataset_type: DatasetType,
        dataset_type_id: i64,
        datasets: Table,
        tags: Table,
        calibs: Option<Table>,
    ) -> Self {
        Self {
            db,
            dataset_type,
            dataset_type_id,
            datasets,
            tags,
            calibs,
        }
    }

    pub fn dataset_type(&self) -> &DatasetType {
        &self.dataset_type
    }

    /// Surrogate id of the dataset type.
    pub fn id(&self) -> i64 {
        self.dataset_type_id
    }

    fn data_id_columns(&self, data_id: &DataCoordinate) -> Result<Row> {
        if data_id.graph() != self.dataset_type.dimensions() {
            return Err(RegistryError::invalid(format!(
                "data ID {data_id} does not match the dimensions of {}",
                self.dataset_type
            )));
        }
        Ok(data_id
            .required_values()
            .into_iter()
            .map(|(k, v)| (k, v.to_json()))
            .collect())
    }

    fn data_id_filter(&self, data_id: &DataCoordinate) -> Result<Vec<Predicate>> {
        Ok(self
            .data_id_columns(data_id)?
            .into_iter()
            .map(|(k, v)| Predicate::Eq(k, v))
            .collect())
    }

    fn check_ref(&self, dataset: &DatasetRef) -> Result<DatasetId> {
        if dataset.dataset_type().name() != self.dataset_type.name() {
            return Err(RegistryError::invalid(format!(
                "dataset {dataset} does not have type '{}'",
                self.dataset_type.name()
            )));
        }
        Ok(dataset.require_resolved()?.0)
    }

    /// Create new datasets owned by `run`.
    pub fn insert(
        &self,
        run: &CollectionRecord,
        data_ids: &[DataCoordinate],
    ) -> Result<Vec<DatasetRef>> {
        require_type(run, CollectionType::Run)?;
        let mut tag_rows = Vec::with_capacity(data_ids.len());
        for data_id in data_ids {
            tag_rows.push(self.data_id_columns(data_id)?);
        }
        let directory_rows = data_ids
            .iter()
            .map(|_| {
                row([
                    ("dataset_type_id", self.dataset_type_id),
                    ("run_id", run.key()),
                ])
            })
            .collect();
        let stored = self.db.insert(&self.datasets, directory_rows)?;
        let ids = stored
            .iter()
            .map(|r| int_column(r, "dataset_id"))
            .collect::<Result<Vec<_>>>()?;

        for (tag, id) in tag_rows.iter_mut().zip(&ids) {
            tag.insert("dataset_type_id".into(), self.dataset_type_id.into());
            tag.insert("dataset_id".into(), (*id).into());
            tag.insert("collection_id".into(), run.key().into());
        }
        if let Err(err) = self.db.insert(&self.tags, tag_rows) {
            let ids_json = ids.iter().map(|id| Value::from(*id)).collect();
            self.db.delete(
                &self.datasets,
                &[Predicate::In("dataset_id".into(), ids_json)],
            )?;
            return Err(match err {
                err if err.is_integrity() => RegistryError::ConflictingDefinition(format!(
                    "a dataset of type '{}' with one of these data IDs already exists in run '{}'",
                    self.dataset_type.name(),
                    run.name()
                )),
                other => other,
            });
        }
        tracing::debug!(
            dataset_type = self.dataset_type.name(),
            run = run.name(),
            count = ids.len(),
            "inserted datasets"
        );
        data_ids
            .iter()
            .zip(ids)
            .map(|(data_id, id)| {
                DatasetRef::resolved(self.dataset_type.clone(), data_id.clone(), id, run.name())
            })
            .collect()
    }

    /// Find the dataset with `data_id` in a non-chained collection.
    ///
    /// CALIBRATION lookups need a timespan and return the dataset whose
    /// validity range overlaps it; more than one match is ambiguous.
    pub fn find(
        &self,
        collections: &CollectionManager,
        collection: &CollectionRecord,
        data_id: &DataCoordinate,
        timespan: Option<&Timespan>,
    ) -> Result<Option<DatasetRef>> {
        let mut filter = self.data_id_filter(data_id)?;
        filter.push(Predicate::Eq("dataset_type_id".into(), self.dataset_type_id.into()));
        filter.push(Predicate::Eq("collection_id".into(), collection.key().into()));
        let rows = match collection.collection_type() {
            CollectionType::Run | CollectionType::Tagged => self.db.query(&Select {
                table: self.tags.clone(),
                filter,
            })?,
            CollectionType::Calibration => {
                let Some(timespan) = timespan else {
                    return Err(RegistryError::invalid(format!(
                        "a timespan is needed to search CALIBRATION collection '{}'",
                        collection.name()
                    )));
                };
                let Some(calibs) = &self.calibs else {
                    return Ok(None);
                };
                let mut matches = Vec::new();
                for r in self.db.query(&Select {
                    table: calibs.clone(),
                    filter,
                })? {
                    if row_timespan(&r)?.overlaps(timespan) {
                        matches.push(r);
                    }
                }
                if matches.len() > 1 {
                    return Err(RegistryError::invalid(format!(
                        "more than one {} dataset for {data_id} in '{}' overlaps {timespan}",
                        self.dataset_type.name(),
                        collection.name()
                    )));
                }
                matches
            }
            CollectionType::Chained => {
                return Err(RegistryError::invalid(format!(
                    "CHAINED collection '{}' must be flattened before searching",
                    collection.name()
                )));
            }
        };
        Ok(self.resolve_rows(collections, &rows)?.into_iter().next())
    }

    /// Every dataset of this type in a non-chained collection.
    pub fn refs_in(
        &self,
        collections: &CollectionManager,
        collection: &CollectionRecord,
    ) -> Result<Vec<DatasetRef>> {
        let table = match collection.collection_type() {
            CollectionType::Run | CollectionType::Tagged => &self.tags,
            CollectionType::Calibration => match &self.calibs {
                Some(calibs) => calibs,
                None => return Ok(Vec::new()),
            },
            CollectionType::Chained => return Ok(Vec::new()),
        };
        let rows = self.db.query(
            &Select::from(table)
                .eq("dataset_type_id", self.dataset_type_id)
                .eq("collection_id", collection.key()),
        )?;
        let mut refs = self.resolve_rows(collections, &rows)?;
        refs.sort();
        refs.dedup();
        Ok(refs)
    }

    /// Resolve a dataset of this type by id from its RUN membership row.
    pub(crate) fn get(
        &self,
        collections: &CollectionManager,
        id: DatasetId,
        run_id: i64,
    ) -> Result<Option<DatasetRef>> {
        let rows = self.db.query(
            &Select::from(&self.tags)
                .eq("dataset_id", id)
                .eq("collection_id", run_id),
        )?;
        Ok(self.resolve_rows(collections, &rows)?.into_iter().next())
    }

    /// Add resolved datasets to a TAGGED collection.
    ///
    /// Re-adding a dataset is a no-op; a different dataset with the same
    /// data ID already in the collection is a conflict.
    pub fn associate(&self, collection: &CollectionRecord, datasets: &[DatasetRef]) -> Result<()> {
        require_type(collection, CollectionType::Tagged)?;
        for dataset in datasets {
            let id = self.check_ref(dataset)?;
            let mut keys = self.data_id_columns(dataset.data_id())?;
            keys.insert("dataset_type_id".into(), self.dataset_type_id.into());
            keys.insert("collection_id".into(), collection.key().into());
            self.db
                .sync(&self.tags, keys, row([("dataset_id", id)]), &["dataset_id"])
                .map_err(|err| match err {
                    RegistryError::SyncConflict { existing, .. } => {
                        RegistryError::ConflictingDefinition(format!(
                            "dataset {existing} already occupies data ID {} of '{}' in '{}'",
                            dataset.data_id(),
                            self.dataset_type.name(),
                            collection.name()
                        ))
                    }
                    other => other,
                })?;
        }
        Ok(())
    }

    pub fn disassociate(
        &self,
        collection: &CollectionRecord,
        datasets: &[DatasetRef],
    ) -> Result<()> {
        require_type(collection, CollectionType::Tagged)?;
        let ids = datasets
            .iter()
            .map(|d| self.check_ref(d).map(Value::from))
            .collect::<Result<Vec<_>>>()?;
        self.db.delete(
            &self.tags,
            &[
                Predicate::Eq("collection_id".into(), collection.key().into()),
                Predicate::In("dataset_id".into(), ids),
            ],
        )?;
        Ok(())
    }

    /// Add resolved datasets to a CALIBRATION collection with a validity
    /// range. Overlapping ranges for one data ID are a conflict.
    pub fn certify(
        &self,
        collection: &CollectionRecord,
        datasets: &[DatasetRef],
        timespan: Timespan,
    ) -> Result<()> {
        require_type(collection, CollectionType::Calibration)?;
        let Some(calibs) = &self.calibs else {
            return Err(RegistryError::invalid(format!(
                "dataset type '{}' is not a calibration type",
                self.dataset_type.name()
            )));
        };
        let mut rows = Vec::with_capacity(datasets.len());
        let mut batch: BTreeSet<BTreeMap<String, DataIdValue>> = BTreeSet::new();
        for dataset in datasets {
            let id = self.check_ref(dataset)?;
            if !batch.insert(dataset.data_id().required_values()) {
                return Err(RegistryError::ConflictingDefinition(format!(
                    "data ID {} is certified more than once over {timespan}",
                    dataset.data_id()
                )));
            }
            let mut filter = self.data_id_filter(dataset.data_id())?;
            filter.push(Predicate::Eq("dataset_type_id".into(), self.dataset_type_id.into()));
            filter.push(Predicate::Eq("collection_id".into(), collection.key().into()));
            for existing in self.db.query(&Select {
                table: calibs.clone(),
                filter,
            })? {
                let existing_span = row_timespan(&existing)?;
                if existing_span.overlaps(&timespan) {
                    return Err(RegistryError::ConflictingDefinition(format!(
                        "validity range {timespan} for {} overlaps {existing_span} already in '{}'",
                        dataset.data_id(),
                        collection.name()
                    )));
                }
            }
            let mut r = self.data_id_columns(dataset.data_id())?;
            r.insert("dataset_type_id".into(), self.dataset_type_id.into());
            r.insert("dataset_id".into(), id.into());
            r.insert("collection_id".into(), collection.key().into());
            r.insert("validity_begin".into(), Timespan::bound_to_json(timespan.begin));
            r.insert("validity_end".into(), Timespan::bound_to_json(timespan.end));
            rows.push(r);
        }
        self.db.insert(calibs, rows)?;
        tracing::debug!(
            dataset_type = self.dataset_type.name(),
            collection = collection.name(),
            count = datasets.len(),
            %timespan,
            "certified datasets"
        );
        Ok(())
    }

    /// Memberships of this type's datasets in the given collections.
    /// CHAINED collections are skipped, not expanded.
    pub fn associations(
        &self,
        collections: &CollectionManager,
        records: &[CollectionRecord],
    ) -> Result<Vec<DatasetAssociation>> {
        let mut result = Vec::new();
        for record in records {
            let table = match record.collection_type() {
                CollectionType::Run | CollectionType::Tagged => &self.tags,
                CollectionType::Calibration => match &self.calibs {
                    Some(calibs) => calibs,
                    None => continue,
                },
                CollectionType::Chained => continue,
            };
            let rows = self.db.query(
                &Select::from(table)
                    .eq("dataset_type_id", self.dataset_type_id)
                    .eq("collection_id", record.key()),
            )?;
            let refs = self.resolve_rows(collections, &rows)?;
            for (dataset, r) in refs.into_iter().zip(&rows) {
                let timespan = match record.collection_type() {
                    CollectionType::Calibration => Some(row_timespan(r)?),
                    _ => None,
                };
                result.push(DatasetAssociation {
                    dataset,
                    collection: record.name().to_string(),
                    timespan,
                });
            }
        }
        result.sort();
        Ok(result)
    }

    /// Turn association rows into resolved refs, preserving row order.
    fn resolve_rows(
        &self,
        collections: &CollectionManager,
        rows: &[Row],
    ) -> Result<Vec<DatasetRef>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<DatasetId> = rows
            .iter()
            .map(|r| int_column(r, "dataset_id"))
            .collect::<Result<_>>()?;
        let runs: BTreeMap<DatasetId, i64> = self
            .db
            .query(
                &Select::from(&self.datasets)
                    .within("dataset_id", ids.iter().map(|id| Value::from(*id))),
            )?
            .iter()
            .map(|r| Ok((int_column(r, "dataset_id")?, int_column(r, "run_id")?)))
            .collect::<Result<_>>()?;

        let graph = self.dataset_type.dimensions();
        rows.iter()
            .zip(ids)
            .map(|(r, id)| {
                let values = graph
                    .required()
                    .iter()
                    .map(|d| {
                        r.get(d)
                            .and_then(DataIdValue::from_json)
                            .map(|v| (d.clone(), v))
                            .ok_or_else(|| {
                                RegistryError::Internal(format!(
                                    "dataset {id} has no value for dimension '{d}'"
                                ))
                            })
                    })
                    .collect::<Result<BTreeMap<_, _>>>()?;
                let data_id = DataCoordinate::standardize(graph, values)?;
                let run_id = runs.get(&id).ok_or_else(|| {
                    RegistryError::Internal(format!("dataset {id} has no directory row"))
                })?;
                let run = collections.find_key(*run_id)?;
                DatasetRef::resolved(self.dataset_type.clone(), data_id, id, run.name())
            })
            .collect()
    }
}

fn require_type(collection: &CollectionRecord, expected: CollectionType) -> Result<()> {
    if collection.collection_type() != expected {
        return Err(RegistryError::invalid(format!(
            "collection '{}' has type {}, expected {expected}",
            collection.name(),
            collection.collection_type()
        )));
    }
    Ok(())
}

fn row_timespan(r: &Row) -> Result<Timespan> {
    Ok(Timespan {
        begin: Timespan::bound_from_json(r.get("validity_begin"))?,
        end: Timespan::bound_from_json(r.get("validity_end"))?,
    })
}

//! The registry: one handle over dimensions, collections, dataset types,
//! datasets and the datastore bookkeeping, all sharing one database.
//!
//! Tables are created in dependency order when a registry is opened:
//! collections, the dataset directories, one table per exported dimension
//! element, then the datastore's location table. Opening an existing
//! database verifies the same layout instead of creating it.

use crate::collections::{CollectionManager, CollectionRecord, CollectionType, glob_match};
use crate::config::ButlerConfig;
use crate::database::{Database, MemoryDatabase, Row, Select, Table};
use crate::datasets::{
    DatasetAssociation, DatasetId, DatasetRef, DatasetType, DatasetTypeStorageManager,
    StorageClassFactory,
};
use crate::datastore::{Datastore, RecordingDatastore};
use crate::dimensions::{
    DataCoordinate, DataIdKey, DataIdValue, DimensionElement, DimensionRecord, DimensionUniverse,
    ElementRef, RecordInput,
};
use crate::error::{RegistryError, Result};
use crate::timespan::Timespan;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

pub struct Registry {
    db: Arc<dyn Database>,
    config: ButlerConfig,
    universe: DimensionUniverse,
    dimension_tables: BTreeMap<String, Table>,
    collections: CollectionManager,
    datasets: DatasetTypeStorageManager,
    datastore: Arc<RecordingDatastore>,
}

impl Registry {
    /// Open (creating where missing) every table the registry needs.
    pub fn new(db: Arc<dyn Database>, config: ButlerConfig) -> Result<Self> {
        config.validate()?;
        let universe = config.universe()?;
        let storage_classes = config.storage_classes()?;

        let collections = CollectionManager::initialize(Arc::clone(&db))?;
        let datasets = DatasetTypeStorageManager::initialize(
            Arc::clone(&db),
            universe.clone(),
            storage_classes,
        )?;
        let mut dimension_tables = BTreeMap::new();
        for element in universe.elements().iter().filter(|e| e.is_exported()) {
            let table = db.ensure_table_exists(element.name(), &universe.table_spec(element)?)?;
            dimension_tables.insert(element.name().to_string(), table);
        }
        let datastore = Arc::new(RecordingDatastore::initialize(Arc::clone(&db))?);
        tracing::debug!(
            dimension_tables = dimension_tables.len(),
            dataset_types = datasets.iter().count(),
            "opened registry"
        );
        Ok(Self {
            db,
            config,
            universe,
            dimension_tables,
            collections,
            datasets,
            datastore,
        })
    }

    /// A registry over a fresh in-process database.
    pub fn in_memory(config: ButlerConfig) -> Result<Self> {
        Self::new(Arc::new(MemoryDatabase::new()), config)
    }

    pub fn config(&self) -> &ButlerConfig {
        &self.config
    }

    pub fn universe(&self) -> &DimensionUniverse {
        &self.universe
    }

    pub fn storage_classes(&self) -> &StorageClassFactory {
        self.datasets.storage_classes()
    }

    pub fn collections(&self) -> &CollectionManager {
        &self.collections
    }

    pub fn dataset_types(&self) -> &DatasetTypeStorageManager {
        &self.datasets
    }

    pub fn datastore(&self) -> Arc<RecordingDatastore> {
        Arc::clone(&self.datastore)
    }

    /// Reload the collection and dataset-type caches from the database.
    pub fn refresh(&mut self) -> Result<()> {
        self.collections.refresh()?;
        self.datasets.refresh()
    }

    // Dimensions

    fn dimension_table(&self, element: &DimensionElement) -> Result<&Table> {
        self.dimension_tables.get(element.name()).ok_or_else(|| {
            RegistryError::invalid(format!(
                "dimension element '{element}' has no records of its own"
            ))
        })
    }

    /// Insert new dimension records; any existing key is an integrity error.
    pub fn insert_dimension_data<I>(&self, element: impl Into<ElementRef>, records: I) -> Result<()>
    where
        I: IntoIterator,
        I::Item: Into<RecordInput>,
    {
        let element = self.universe.resolve(&element.into())?;
        let table = self.dimension_table(element)?;
        let rows = records
            .into_iter()
            .map(|r| {
                self.universe
                    .coerce_record(element, r.into())
                    .map(|record| record.fields().clone())
            })
            .collect::<Result<Vec<Row>>>()?;
        let count = rows.len();
        self.db.insert(table, rows)?;
        tracing::debug!(element = element.name(), count, "inserted dimension records");
        Ok(())
    }

    /// Insert a dimension record unless an identical one exists.
    ///
    /// Returns whether a row was inserted. An existing record with the same
    /// key but different fields is a [`RegistryError::SyncConflict`].
    pub fn sync_dimension_data(
        &self,
        element: impl Into<ElementRef>,
        record: impl Into<RecordInput>,
    ) -> Result<bool> {
        let element = self.universe.resolve(&element.into())?;
        let table = self.dimension_table(element)?;
        let record = self.universe.coerce_record(element, record.into())?;
        let mut key_columns: Vec<&str> = element.required().iter().map(String::as_str).collect();
        key_columns.push(&element.primary_key().name);

        let (keys, compared): (Row, Row) = record
            .fields()
            .clone()
            .into_iter()
            .partition(|(column, _)| key_columns.contains(&column.as_str()));
        let (_, inserted) = self.db.sync(table, keys, compared, &key_columns)?;
        if inserted {
            tracing::debug!(element = element.name(), "synced new dimension record");
        }
        Ok(inserted)
    }

    fn fetch_record(
        &self,
        element: &DimensionElement,
        key: &DataIdKey,
    ) -> Result<Option<DimensionRecord>> {
        let table = self.dimension_table(element)?;
        let mut select = Select::from(table);
        for dim in element.data_id_dimensions() {
            let value = key.get(&dim).ok_or_else(|| {
                RegistryError::invalid(format!("no value for '{dim}' in {element} key"))
            })?;
            let column = if dim == element.name() {
                element.primary_key().name.as_str()
            } else {
                dim.as_str()
            };
            select = select.eq(column, value.to_json());
        }
        self.db
            .query(&select)?
            .into_iter()
            .next()
            .map(|r| self.universe.make_record(element, r))
            .transpose()
    }

    /// Fill in implied values and attach the record of every dimension in
    /// the data ID's graph.
    ///
    /// A dimension whose record does not exist, or an implied value that
    /// contradicts one already in the data ID, is an invalid argument. An
    /// implied value stored as null stays unset.
    pub fn expand_data_id(&self, data_id: &DataCoordinate) -> Result<DataCoordinate> {
        if data_id.has_records() {
            return Ok(data_id.clone());
        }
        let graph = data_id.graph().clone();
        let mut values = data_id.values().clone();
        let mut records: BTreeMap<String, DimensionRecord> = BTreeMap::new();
        // Implied values only become known once the implying record is read,
        // so keep sweeping until a pass learns nothing new.
        loop {
            let mut progressed = false;
            for name in graph.dimensions() {
                let element = self.universe.get(name)?;
                if records.contains_key(name) || !element.is_exported() {
                    continue;
                }
                let Some(key) = element_key(element, &values) else {
                    continue;
                };
                let record = self.fetch_record(element, &key)?.ok_or_else(|| {
                    RegistryError::invalid(format!(
                        "no {name} record exists for {}",
                        show_key(&key)
                    ))
                })?;
                if !merge_implied(&mut values, element, &record) {
                    return Err(RegistryError::invalid(format!(
                        "data ID {data_id} is inconsistent with {name} record {}",
                        show_key(record.data_id())
                    )));
                }
                records.insert(name.clone(), record);
                progressed = true;
            }
            if !progressed {
                break;
            }
        }
        Ok(DataCoordinate::expanded(graph, values, records))
    }

    /// Records of `element` matching every constraint, sorted by data ID.
    ///
    /// Constraint keys may name the element itself or any dimension it
    /// requires or implies.
    pub fn query_dimension_records(
        &self,
        element: impl Into<ElementRef>,
        constraints: &BTreeMap<String, DataIdValue>,
    ) -> Result<Vec<DimensionRecord>> {
        let element = self.universe.resolve(&element.into())?;
        self.records_matching(element, constraints)
    }

    fn records_matching(
        &self,
        element: &DimensionElement,
        constraints: &BTreeMap<String, DataIdValue>,
    ) -> Result<Vec<DimensionRecord>> {
        let table = self.dimension_table(element)?;
        let mut select = Select::from(table);
        for (dim, value) in constraints {
            let column = if dim == element.name() {
                element.primary_key().name.as_str()
            } else if element.required().contains(dim) || element.implied().contains(dim) {
                dim.as_str()
            } else {
                return Err(RegistryError::invalid(format!(
                    "'{dim}' does not constrain {element} records"
                )));
            };
            select = select.eq(column, value.to_json());
        }
        let mut records = self
            .db
            .query(&select)?
            .into_iter()
            .map(|r| self.universe.make_record(element, r))
            .collect::<Result<Vec<_>>>()?;
        records.sort_by(|a, b| a.data_id().cmp(b.data_id()));
        Ok(records)
    }

    /// Every data ID over `dimensions` supported by existing records,
    /// restricted to `constraints`, in sorted order.
    ///
    /// Records of each element in the graph are joined on shared dimension
    /// values, dependencies first.
    pub fn query_data_ids(
        &self,
        dimensions: &[&str],
        constraints: &BTreeMap<String, DataIdValue>,
    ) -> Result<Vec<DataCoordinate>> {
        let graph = self.universe.extract(dimensions.iter().copied())?;
        if let Some(extra) = constraints.keys().find(|k| !graph.contains(k)) {
            return Err(RegistryError::invalid(format!(
                "constraint on '{extra}' is outside the requested dimensions {graph}"
            )));
        }
        let mut partial: Vec<BTreeMap<String, DataIdValue>> = vec![constraints.clone()];
        for name in graph.dimensions() {
            let element = self.universe.get(name)?;
            if !element.is_exported() {
                continue;
            }
            let mut next = Vec::new();
            for assigned in &partial {
                let filter: BTreeMap<String, DataIdValue> = element
                    .data_id_dimensions()
                    .into_iter()
                    .filter_map(|d| assigned.get(&d).map(|v| (d, v.clone())))
                    .collect();
                for record in self.records_matching(element, &filter)? {
                    let mut extended = assigned.clone();
                    extended.extend(record.data_id().clone());
                    if merge_implied(&mut extended, element, &record) {
                        next.push(extended);
                    }
                }
            }
            partial = next;
        }
        let mut result = BTreeSet::new();
        for values in partial {
            if graph.required().iter().all(|d| values.contains_key(d)) {
                result.insert(DataCoordinate::standardize(&graph, values)?);
            }
        }
        Ok(result.into_iter().collect())
    }

    // Dataset types

    /// Build a dataset type against this registry's universe and storage
    /// classes without registering it.
    pub fn make_dataset_type(
        &self,
        name: &str,
        dimensions: &[&str],
        storage_class: &str,
        is_calibration: bool,
    ) -> Result<DatasetType> {
        let graph = self.universe.extract(dimensions.iter().copied())?;
        let storage_class = self.storage_classes().get(storage_class)?.clone();
        DatasetType::new(name, graph, storage_class, is_calibration)
    }

    /// Register a dataset type; returns whether anything was inserted.
    pub fn register_dataset_type(&mut self, dataset_type: &DatasetType) -> Result<bool> {
        let (_, inserted) = self.datasets.register(dataset_type)?;
        Ok(inserted)
    }

    pub fn get_dataset_type(&self, name: &str) -> Result<DatasetType> {
        Ok(self.datasets.get(name)?.dataset_type().clone())
    }

    /// Registered dataset types whose names match `pattern`, sorted by name.
    pub fn query_dataset_types(&self, pattern: Option<&str>) -> Vec<DatasetType> {
        let mut types: Vec<DatasetType> = self
            .datasets
            .iter()
            .filter(|t| pattern.is_none_or(|p| glob_match(p, t.name())))
            .cloned()
            .collect();
        types.sort();
        types
    }

    pub fn remove_dataset_type(&mut self, name: &str) -> Result<()> {
        self.datasets.remove(name)
    }

    // Collections

    /// Create a collection, or verify an existing one has the same type.
    pub fn register_collection(
        &mut self,
        name: &str,
        collection_type: CollectionType,
        doc: Option<&str>,
    ) -> Result<bool> {
        let (_, inserted) = self.collections.register(name, collection_type, doc)?;
        Ok(inserted)
    }

    pub fn register_run(&mut self, name: &str, doc: Option<&str>) -> Result<bool> {
        self.register_collection(name, CollectionType::Run, doc)
    }

    pub fn get_collection_type(&self, name: &str) -> Result<CollectionType> {
        Ok(self.collections.find(name)?.collection_type())
    }

    pub fn get_collection_chain(&self, name: &str) -> Result<Vec<String>> {
        let record = self.collections.find(name)?;
        if record.collection_type() != CollectionType::Chained {
            return Err(RegistryError::invalid(format!(
                "collection '{name}' has type {}, not CHAINED",
                record.collection_type()
            )));
        }
        Ok(record.children().to_vec())
    }

    pub fn set_collection_chain(&mut self, parent: &str, children: &[String]) -> Result<()> {
        self.collections.set_chain(parent, children)
    }

    pub fn get_collection_documentation(&self, name: &str) -> Result<Option<String>> {
        self.collections.find(name)?;
        Ok(self.collections.documentation(name).map(str::to_string))
    }

    pub fn set_collection_documentation(&mut self, name: &str, doc: &str) -> Result<()> {
        self.collections.update_documentation(name, doc)
    }

    /// Delete a collection. Removing a RUN deletes its datasets, their
    /// memberships elsewhere and their datastore records.
    pub fn remove_collection(&mut self, name: &str) -> Result<()> {
        let record = self.collections.find(name)?.clone();
        let owned = match record.collection_type() {
            CollectionType::Run => self.datasets.dataset_ids_in_run(record.key())?,
            _ => Vec::new(),
        };
        self.datastore.forget(&owned)?;
        self.collections.remove(name)?;
        if !owned.is_empty() {
            tracing::info!(run = name, datasets = owned.len(), "removed run and its datasets");
        }
        Ok(())
    }

    pub fn query_collections(
        &self,
        pattern: Option<&str>,
        types: &[CollectionType],
        flatten_chains: bool,
    ) -> Result<Vec<CollectionRecord>> {
        self.collections.query(pattern, types, flatten_chains)
    }

    // Datasets

    /// Create datasets of `dataset_type` in the RUN `run`.
    ///
    /// Data IDs are checked against existing dimension records and reduced
    /// to the dataset type's dimensions.
    pub fn insert_datasets(
        &self,
        dataset_type: &str,
        data_ids: &[DataCoordinate],
        run: &str,
    ) -> Result<Vec<DatasetRef>> {
        let storage = self.datasets.get(dataset_type)?;
        let graph = storage.dataset_type().dimensions();
        let conformed = data_ids
            .iter()
            .map(|data_id| {
                let data_id = data_id.subset(graph)?;
                self.expand_data_id(&data_id)?;
                Ok(data_id)
            })
            .collect::<Result<Vec<_>>>()?;
        let run = self.collections.find(run)?;
        storage.insert(run, &conformed)
    }

    /// Resolve a dataset id, refreshing the dataset-type cache at most once.
    pub fn get_dataset(&mut self, id: DatasetId) -> Result<Option<DatasetRef>> {
        self.datasets.get_dataset_ref(&self.collections, id)
    }

    /// First dataset with `data_id` in the search path `collections`.
    ///
    /// CALIBRATION collections are only searched when a timespan is given.
    pub fn find_dataset(
        &self,
        dataset_type: &str,
        data_id: &DataCoordinate,
        collections: &[String],
        timespan: Option<&Timespan>,
    ) -> Result<Option<DatasetRef>> {
        let storage = self.datasets.get(dataset_type)?;
        let data_id = data_id.subset(storage.dataset_type().dimensions())?;
        for record in self.collections.flatten(collections)? {
            if record.collection_type() == CollectionType::Calibration && timespan.is_none() {
                continue;
            }
            if let Some(found) = storage.find(&self.collections, &record, &data_id, timespan)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    /// Datasets of one type anywhere in `collections`, chains flattened,
    /// each dataset once, sorted.
    pub fn query_datasets(
        &self,
        dataset_type: &str,
        collections: &[String],
    ) -> Result<Vec<DatasetRef>> {
        let storage = self.datasets.get(dataset_type)?;
        let mut found = BTreeSet::new();
        for record in self.collections.flatten(collections)? {
            found.extend(storage.refs_in(&self.collections, &record)?);
        }
        Ok(found.into_iter().collect())
    }

    pub fn associate(&self, collection: &str, refs: &[DatasetRef]) -> Result<()> {
        let record = self.collections.find(collection)?;
        for (name, group) in group_by_type(refs) {
            self.datasets.get(name)?.associate(record, &group)?;
        }
        Ok(())
    }

    pub fn disassociate(&self, collection: &str, refs: &[DatasetRef]) -> Result<()> {
        let record = self.collections.find(collection)?;
        for (name, group) in group_by_type(refs) {
            self.datasets.get(name)?.disassociate(record, &group)?;
        }
        Ok(())
    }

    /// Add datasets to a CALIBRATION collection, valid over `timespan`.
    pub fn certify(&self, collection: &str, refs: &[DatasetRef], timespan: Timespan) -> Result<()> {
        let record = self.collections.find(collection)?;
        for (name, group) in group_by_type(refs) {
            self.datasets.get(name)?.certify(record, &group, timespan)?;
        }
        Ok(())
    }

    /// Memberships of `dataset_type` datasets in the named collections.
    ///
    /// With `flatten_chains` CHAINED collections are replaced by the
    /// collections they resolve to; otherwise they contribute nothing.
    /// An empty `collection_types` allows every type.
    pub fn query_dataset_associations(
        &self,
        dataset_type: &str,
        collections: &[String],
        collection_types: &[CollectionType],
        flatten_chains: bool,
    ) -> Result<Vec<DatasetAssociation>> {
        let storage = self.datasets.get(dataset_type)?;
        let mut records = if flatten_chains {
            self.collections.flatten(collections)?
        } else {
            collections
                .iter()
                .map(|name| self.collections.find(name).cloned())
                .collect::<Result<Vec<_>>>()?
        };
        records.retain(|r| {
            collection_types.is_empty() || collection_types.contains(&r.collection_type())
        });
        storage.associations(&self.collections, &records)
    }

    /// Delete datasets everywhere, including their datastore records.
    pub fn remove_datasets(&self, refs: &[DatasetRef]) -> Result<usize> {
        let ids = refs
            .iter()
            .map(|r| r.require_resolved().map(|(id, _)| id))
            .collect::<Result<Vec<_>>>()?;
        self.datastore.forget(&ids)?;
        let removed = self.datasets.remove_datasets(&ids)?;
        tracing::info!(removed, "removed datasets");
        Ok(removed)
    }
}

/// Values of an element's data-ID dimensions, if all are known.
fn element_key(
    element: &DimensionElement,
    values: &BTreeMap<String, DataIdValue>,
) -> Option<DataIdKey> {
    element
        .data_id_dimensions()
        .into_iter()
        .map(|d| values.get(&d).cloned().map(|v| (d, v)))
        .collect()
}

/// Copy the implied values a record carries into `values`; false when one
/// contradicts a value already present.
fn merge_implied(
    values: &mut BTreeMap<String, DataIdValue>,
    element: &DimensionElement,
    record: &DimensionRecord,
) -> bool {
    for implied in element.implied() {
        let Some(value) = record.get(implied).and_then(DataIdValue::from_json) else {
            continue;
        };
        match values.get(implied) {
            Some(existing) if *existing != value => return false,
            Some(_) => {}
            None => {
                values.insert(implied.clone(), value);
            }
        }
    }
    true
}

fn show_key(key: &DataIdKey) -> String {
    let parts: Vec<String> = key.iter().map(|(k, v)| format!("{k}: {v}")).collect();
    format!("{{{}}}", parts.join(", "))
}

fn group_by_type(refs: &[DatasetRef]) -> BTreeMap<&str, Vec<DatasetRef>> {
    let mut groups: BTreeMap<&str, Vec<DatasetRef>> = BTreeMap::new();
    for dataset in refs {
        groups
            .entry(dataset.dataset_type().name())
            .or_default()
            .push(dataset.clone());
    }
    groups
}

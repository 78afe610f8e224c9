use super::refs::{DatasetId, DatasetRef};
use super::storage::DatasetRecordStorage;
use super::tables::{
    DATASET_TABLE, DATASET_TYPE_TABLE, calibs_spec, calibs_table_name, dataset_spec,
    dataset_type_spec, tags_spec, tags_table_name,
};
use super::types::{DatasetType, StorageClassFactory};
use crate::collections::CollectionManager;
use crate::database::{Database, Predicate, Row, Select, Table, int_column, row, str_column};
use crate::dimensions::{DimensionGraph, DimensionUniverse};
use crate::error::{RegistryError, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Maps dataset types to their storage.
///
/// Everything is served from an in-memory cache loaded in full by
/// [`refresh`](Self::refresh); the only implicit refresh is the single retry
/// in [`get_dataset_ref`](Self::get_dataset_ref). The cache is owned by one
/// session and is not shared between threads.
pub struct DatasetTypeStorageManager {
    db: Arc<dyn Database>,
    universe: DimensionUniverse,
    storage_classes: StorageClassFactory,
    types: Table,
    datasets: Table,
    by_name: BTreeMap<String, Arc<DatasetRecordStorage>>,
    by_id: BTreeMap<i64, Arc<DatasetRecordStorage>>,
    order: Vec<String>,
}

impl DatasetTypeStorageManager {
    /// Create the static tables if needed and load the cache.
    ///
    /// The collection tables must already exist.
    pub fn initialize(
        db: Arc<dyn Database>,
        universe: DimensionUniverse,
        storage_classes: StorageClassFactory,
    ) -> Result<Self> {
        let types = db.ensure_table_exists(DATASET_TYPE_TABLE, &dataset_type_spec())?;
        let datasets = db.ensure_table_exists(DATASET_TABLE, &dataset_spec())?;
        let mut manager = Self {
            db,
            universe,
            storage_classes,
            types,
            datasets,
            by_name: BTreeMap::new(),
            by_id: BTreeMap::new(),
            order: Vec::new(),
        };
        manager.refresh()?;
        Ok(manager)
    }

    pub fn universe(&self) -> &DimensionUniverse {
        &self.universe
    }

    pub fn storage_classes(&self) -> &StorageClassFactory {
        &self.storage_classes
    }

    /// Rebuild both caches from the dataset-type directory, reopening each
    /// type's dynamic tables by name.
    pub fn refresh(&mut self) -> Result<()> {
        let mut rows = self.db.query(&Select::from(&self.types))?;
        rows.sort_by_key(|r| r.get("dataset_type_id").and_then(Value::as_i64));

        let mut by_name = BTreeMap::new();
        let mut by_id = BTreeMap::new();
        let mut order = Vec::with_capacity(rows.len());
        for r in &rows {
            let storage = Arc::new(self.open_storage(r)?);
            let name = storage.dataset_type().name().to_string();
            by_id.insert(storage.id(), Arc::clone(&storage));
            by_name.insert(name.clone(), storage);
            order.push(name);
        }
        tracing::debug!(dataset_types = order.len(), "refreshed dataset type cache");
        self.by_name = by_name;
        self.by_id = by_id;
        self.order = order;
        Ok(())
    }

    fn open_storage(&self, r: &Row) -> Result<DatasetRecordStorage> {
        let name = str_column(r, "name")?;
        let encoded = str_column(r, "dimensions_encoded")?;
        let dimensions = DimensionGraph::decode(encoded, &self.universe)?;
        let storage_class = self.storage_classes.get(str_column(r, "storage_class")?)?.clone();
        let is_calibration = r
            .get("is_calibration")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let dataset_type = DatasetType::new(name, dimensions, storage_class, is_calibration)?;

        let tags_name = str_column(r, "tag_association_table")?;
        let tags = self
            .db
            .get_existing_table(tags_name, &tags_spec(&self.universe, dataset_type.dimensions())?)?
            .ok_or_else(|| {
                RegistryError::Internal(format!(
                    "table '{tags_name}' for dataset type '{name}' does not exist"
                ))
            })?;
        let calibs = match r.get("calibration_association_table").and_then(Value::as_str) {
            Some(calibs_name) => Some(
                self.db
                    .get_existing_table(
                        calibs_name,
                        &calibs_spec(&self.universe, dataset_type.dimensions())?,
                    )?
                    .ok_or_else(|| {
                        RegistryError::Internal(format!(
                            "table '{calibs_name}' for dataset type '{name}' does not exist"
                        ))
                    })?,
            ),
            None => None,
        };
        Ok(DatasetRecordStorage::new(
            Arc::clone(&self.db),
            dataset_type,
            int_column(r, "dataset_type_id")?,
            self.datasets.clone(),
            tags,
            calibs,
        ))
    }

    /// Register a dataset type, or verify an identical registration exists.
    ///
    /// Composite types also register each of their components.
    pub fn register(
        &mut self,
        dataset_type: &DatasetType,
    ) -> Result<(Arc<DatasetRecordStorage>, bool)> {
        if let Some(existing) = self.by_name.get(dataset_type.name()) {
            if existing.dataset_type() != dataset_type {
                return Err(conflict(dataset_type, existing.dataset_type()));
            }
            return Ok((Arc::clone(existing), false));
        }
        self.storage_classes.get(dataset_type.storage_class().name())?;

        let dimensions = dataset_type.dimensions();
        let tags_name = tags_table_name(dimensions);
        let tags = self
            .db
            .ensure_table_exists(&tags_name, &tags_spec(&self.universe, dimensions)?)?;
        let calibs = if dataset_type.is_calibration() {
            Some(self.db.ensure_table_exists(
                &calibs_table_name(dimensions),
                &calibs_spec(&self.universe, dimensions)?,
            )?)
        } else {
            None
        };
        let calibs_name = calibs
            .as_ref()
            .map_or(Value::Null, |t| Value::from(t.name()));

        let compared = row([
            ("storage_class", Value::from(dataset_type.storage_class().name())),
            ("dimensions_encoded", Value::from(dimensions.encode())),
            ("is_calibration", Value::from(dataset_type.is_calibration())),
            ("tag_association_table", Value::from(tags_name)),
            ("calibration_association_table", calibs_name),
        ]);
        let synced = self.db.sync(
            &self.types,
            row([("name", dataset_type.name())]),
            compared,
            &["dataset_type_id"],
        );
        let (r, inserted) = match synced {
            Ok(result) => result,
            Err(RegistryError::SyncConflict { .. }) => {
                // Registered elsewhere since our last refresh.
                self.refresh()?;
                return match self.by_name.get(dataset_type.name()) {
                    Some(existing) => Err(conflict(dataset_type, existing.dataset_type())),
                    None => Err(RegistryError::Internal(format!(
                        "dataset type '{}' conflicts with a row that cannot be loaded",
                        dataset_type.name()
                    ))),
                };
            }
            Err(err) => return Err(err),
        };
        let id = int_column(&r, "dataset_type_id")?;
        if inserted {
            tracing::info!(dataset_type = dataset_type.name(), id, "registered dataset type");
        }

        let storage = Arc::new(DatasetRecordStorage::new(
            Arc::clone(&self.db),
            dataset_type.clone(),
            id,
            self.datasets.clone(),
            tags,
            calibs,
        ));
        self.by_id.insert(id, Arc::clone(&storage));
        self.by_name
            .insert(dataset_type.name().to_string(), Arc::clone(&storage));
        self.order.push(dataset_type.name().to_string());

        if dataset_type.is_composite() {
            for component in dataset_type.components(&self.storage_classes)? {
                self.register(&component)?;
            }
        }
        Ok((storage, inserted))
    }

    /// Cached storage for `name`; never touches the database.
    pub fn find(&self, name: &str) -> Option<Arc<DatasetRecordStorage>> {
        self.by_name.get(name).cloned()
    }

    /// Like [`find`](Self::find) but a missing type is an error.
    pub fn get(&self, name: &str) -> Result<Arc<DatasetRecordStorage>> {
        self.find(name)
            .ok_or_else(|| RegistryError::MissingDatasetType(name.to_string()))
    }

    /// Registered dataset types in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &DatasetType> {
        self.order
            .iter()
            .filter_map(|name| self.by_name.get(name))
            .map(|storage| storage.dataset_type())
    }

    /// Resolve a dataset id to a full reference.
    ///
    /// A dataset whose type is not cached triggers exactly one refresh. A
    /// type still missing afterwards means the foreign key from dataset to
    /// dataset type was violated.
    pub fn get_dataset_ref(
        &mut self,
        collections: &CollectionManager,
        id: DatasetId,
    ) -> Result<Option<DatasetRef>> {
        let rows = self
            .db
            .query(&Select::from(&self.datasets).eq("dataset_id", id))?;
        let Some(r) = rows.first() else {
            return Ok(None);
        };
        let type_id = int_column(r, "dataset_type_id")?;
        let run_id = int_column(r, "run_id")?;
        if !self.by_id.contains_key(&type_id) {
            tracing::debug!(dataset_id = id, type_id, "dataset type not cached; refreshing");
            self.refresh()?;
        }
        let storage = self.by_id.get(&type_id).ok_or_else(|| {
            RegistryError::Internal(format!(
                "dataset {id} refers to dataset type id {type_id}, which does not exist"
            ))
        })?;
        storage.get(collections, id, run_id)
    }

    /// Delete a dataset type. Types that still have datasets are refused.
    pub fn remove(&mut self, name: &str) -> Result<()> {
        let storage = self.get(name)?;
        let in_use = self
            .db
            .query(&Select::from(&self.datasets).eq("dataset_type_id", storage.id()))?;
        if !in_use.is_empty() {
            return Err(RegistryError::invalid(format!(
                "dataset type '{name}' still has {} dataset(s)",
                in_use.len()
            )));
        }
        self.db.delete(
            &self.types,
            &[Predicate::Eq("name".into(), Value::from(name))],
        )?;
        tracing::info!(dataset_type = name, "removed dataset type");
        self.by_name.remove(name);
        self.by_id.remove(&storage.id());
        self.order.retain(|n| n != name);
        Ok(())
    }

    /// Delete datasets by id; their collection memberships go with them.
    pub fn remove_datasets(&self, ids: &[DatasetId]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.db.delete(
            &self.datasets,
            &[Predicate::In(
                "dataset_id".into(),
                ids.iter().map(|id| Value::from(*id)).collect(),
            )],
        )
    }

    /// Ids of every dataset owned by the RUN with key `run_key`.
    pub(crate) fn dataset_ids_in_run(&self, run_key: i64) -> Result<Vec<DatasetId>> {
        self.db
            .query(&Select::from(&self.datasets).eq("run_id", run_key))?
            .iter()
            .map(|r| int_column(r, "dataset_id"))
            .collect()
    }
}

fn conflict(requested: &DatasetType, existing: &DatasetType) -> RegistryError {
    RegistryError::ConflictingDefinition(format!(
        "given dataset type {requested} is inconsistent with database definition {existing}"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collections::CollectionType;
    use crate::config::ButlerConfig;
    use crate::database::MemoryDatabase;
    use crate::dimensions::DataCoordinate;

    struct Fixture {
        db: Arc<MemoryDatabase>,
        collections: CollectionManager,
        manager: DatasetTypeStorageManager,
    }

    fn fixture() -> Fixture {
        let config = ButlerConfig::default_config();
        let db = Arc::new(MemoryDatabase::new());
        let collections = CollectionManager::initialize(db.clone()).unwrap();
        let manager = DatasetTypeStorageManager::initialize(
            db.clone(),
            config.universe().unwrap(),
            config.storage_classes().unwrap(),
        )
        .unwrap();
        Fixture {
            db,
            collections,
            manager,
        }
    }

    fn dataset_type(
        m: &DatasetTypeStorageManager,
        name: &str,
        dims: &[&str],
        class: &str,
    ) -> DatasetType {
        DatasetType::new(
            name,
            m.universe().extract(dims.iter().copied()).unwrap(),
            m.storage_classes().get(class).unwrap().clone(),
            false,
        )
        .unwrap()
    }

    #[test]
    fn registration_is_idempotent() {
        let mut f = fixture();
        let flat = dataset_type(&f.manager, "flat", &["instrument", "detector"], "NumpyArray");
        let (first, inserted) = f.manager.register(&flat).unwrap();
        assert!(inserted);
        let (second, inserted) = f.manager.register(&flat).unwrap();
        assert!(!inserted);
        assert_eq!(first.id(), second.id());
    }

    #[test]
    fn conflicting_definitions_leave_the_original_intact() {
        let mut f = fixture();
        let flat = dataset_type(&f.manager, "flat", &["instrument", "detector"], "NumpyArray");
        f.manager.register(&flat).unwrap();
        let other = dataset_type(&f.manager, "flat", &["instrument"], "NumpyArray");
        let err = f.manager.register(&other).err().unwrap();
        match err {
            RegistryError::ConflictingDefinition(message) => {
                assert!(message.contains("instrument, detector"), "{message}");
                assert!(message.contains("{instrument}"), "{message}");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(f.manager.find("flat").unwrap().dataset_type(), &flat);
    }

    #[test]
    fn conflicts_from_another_session_are_detected() {
        let mut f = fixture();
        let mut other_session = DatasetTypeStorageManager::initialize(
            f.db.clone(),
            f.manager.universe().clone(),
            f.manager.storage_classes().clone(),
        )
        .unwrap();
        let flat = dataset_type(&f.manager, "flat", &["instrument", "detector"], "NumpyArray");
        other_session.register(&flat).unwrap();

        let changed = dataset_type(&f.manager, "flat", &["instrument", "detector"], "Catalog");
        let err = f.manager.register(&changed).err().unwrap();
        assert!(matches!(err, RegistryError::ConflictingDefinition(_)));
    }

    #[test]
    fn composites_register_their_components() {
        let mut f = fixture();
        let calexp = dataset_type(&f.manager, "calexp", &["visit", "detector"], "ExposureF");
        f.manager.register(&calexp).unwrap();
        let mut names: Vec<&str> = f.manager.iter().map(|t| t.name()).collect();
        names.sort();
        assert_eq!(
            names,
            ["calexp", "calexp.image", "calexp.mask", "calexp.variance", "calexp.wcs"]
        );
        assert!(f.manager.find("calexp.wcs").is_some());
    }

    #[test]
    fn refresh_reopens_dynamic_tables() {
        let mut f = fixture();
        let a = dataset_type(&f.manager, "a", &["visit", "detector"], "NumpyArray");
        let b = dataset_type(&f.manager, "b", &["visit", "detector"], "Catalog");
        f.manager.register(&a).unwrap();
        f.manager.register(&b).unwrap();
        let tags: Vec<String> = f
            .db
            .table_names()
            .into_iter()
            .filter(|t| t.starts_with("dataset_tags_"))
            .collect();
        assert_eq!(tags.len(), 1);

        f.manager.refresh().unwrap();
        let mut names: Vec<&str> = f.manager.iter().map(|t| t.name()).collect();
        names.sort();
        assert_eq!(names, ["a", "b"]);
    }

    #[test]
    fn dataset_refs_resolve_after_a_single_refresh() {
        let mut f = fixture();
        let (run, _) = f.collections.register("r1", CollectionType::Run, None).unwrap();
        let mut writer = DatasetTypeStorageManager::initialize(
            f.db.clone(),
            f.manager.universe().clone(),
            f.manager.storage_classes().clone(),
        )
        .unwrap();
        let bias = dataset_type(&writer, "bias", &["instrument", "detector"], "NumpyArray");
        let (storage, _) = writer.register(&bias).unwrap();
        let data_id = DataCoordinate::from_pairs(
            f.manager.universe(),
            [
                ("instrument", crate::dimensions::DataIdValue::from("Cam")),
                ("detector", crate::dimensions::DataIdValue::Int(1)),
            ],
        )
        .unwrap();
        let inserted = storage.insert(&run, &[data_id.clone()]).unwrap();
        let id = inserted[0].id().unwrap();

        assert!(f.manager.find("bias").is_none());
        let resolved = f
            .manager
            .get_dataset_ref(&f.collections, id)
            .unwrap()
            .unwrap();
        assert_eq!(resolved.run(), Some("r1"));
        assert_eq!(resolved.data_id(), &data_id);
        assert!(f.manager.get_dataset_ref(&f.collections, id + 100).unwrap().is_none());
    }

    #[test]
    fn types_with_datasets_cannot_be_removed() {
        let mut f = fixture();
        let (run, _) = f.collections.register("r1", CollectionType::Run, None).unwrap();
        let bias = dataset_type(&f.manager, "bias", &["instrument"], "NumpyArray");
        let (storage, _) = f.manager.register(&bias).unwrap();
        let data_id =
            DataCoordinate::from_pairs(f.manager.universe(), [("instrument", "Cam")]).unwrap();
        let refs = storage.insert(&run, &[data_id]).unwrap();
        assert!(f.manager.remove("bias").is_err());
        f.manager
            .remove_datasets(&[refs[0].id().unwrap()])
            .unwrap();
        f.manager.remove("bias").unwrap();
        assert!(f.manager.find("bias").is_none());
    }
}

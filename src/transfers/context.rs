use super::RepoExportBackend;
use crate::collections::{CollectionRecord, CollectionType, sort_collections};
use crate::datasets::{DatasetAssociation, DatasetId, DatasetRef, DatasetType, FileDataset};
use crate::datastore::{Datastore, TransferMode};
use crate::dimensions::{DataCoordinate, DataIdKey, DimensionRecord, ElementRef, RecordInput};
use crate::error::{RegistryError, Result};
use crate::registry::Registry;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Hook applied to every file description before it is saved.
pub type PathRewrite = dyn Fn(FileDataset) -> FileDataset;

/// Accumulates an export closure and writes it out in a fixed order.
///
/// Everything saved is kept in sorted maps, so the order in which callers
/// save things never shows in the output. [`finish`](Self::finish)
/// consumes the context; nothing can be added after it.
pub struct RepoExportContext<'a, B: RepoExportBackend> {
    registry: &'a Registry,
    datastore: &'a dyn Datastore,
    backend: B,
    directory: Option<PathBuf>,
    transfer: Option<TransferMode>,
    records: BTreeMap<String, BTreeMap<DataIdKey, DimensionRecord>>,
    dataset_ids: BTreeSet<DatasetId>,
    datasets: BTreeMap<String, (DatasetType, BTreeMap<String, Vec<FileDataset>>)>,
    collections: BTreeMap<String, CollectionRecord>,
}

impl<'a, B: RepoExportBackend> RepoExportContext<'a, B> {
    pub fn new(
        registry: &'a Registry,
        datastore: &'a dyn Datastore,
        backend: B,
        directory: Option<&Path>,
        transfer: Option<TransferMode>,
    ) -> Self {
        Self {
            registry,
            datastore,
            backend,
            directory: directory.map(Path::to_path_buf),
            transfer,
            records: BTreeMap::new(),
            dataset_ids: BTreeSet::new(),
            datasets: BTreeMap::new(),
            collections: BTreeMap::new(),
        }
    }

    /// Export a collection's current definition. Saving a name again
    /// replaces the earlier definition.
    pub fn save_collection(&mut self, name: &str) -> Result<()> {
        let record = self.registry.collections().find(name)?.clone();
        self.collections.insert(name.to_string(), record);
        Ok(())
    }

    /// Export dimension records. The first record saved for a data ID wins.
    pub fn save_dimension_data<I>(
        &mut self,
        element: impl Into<ElementRef>,
        records: I,
    ) -> Result<()>
    where
        I: IntoIterator,
        I::Item: Into<RecordInput>,
    {
        let registry = self.registry;
        let universe = registry.universe();
        let element = universe.resolve(&element.into())?;
        if !element.is_exported() {
            return Err(RegistryError::invalid(format!(
                "dimension element '{element}' has no records of its own to export"
            )));
        }
        let records = records
            .into_iter()
            .map(|input| universe.coerce_record(element, input.into()))
            .collect::<Result<Vec<_>>>()?;
        if records.is_empty() {
            return Ok(());
        }
        let store = self.records.entry(element.name().to_string()).or_default();
        for record in records {
            store.entry(record.data_id().clone()).or_insert(record);
        }
        Ok(())
    }

    /// Export the records behind `data_ids`, restricted to `elements`
    /// (every element when empty). Data IDs without records are expanded
    /// first.
    pub fn save_data_ids(
        &mut self,
        data_ids: &[DataCoordinate],
        elements: &[ElementRef],
    ) -> Result<()> {
        let selected = self.select_elements(elements)?;
        for data_id in data_ids {
            let expanded = self.registry.expand_data_id(data_id)?;
            let Some(records) = expanded.records() else {
                continue;
            };
            for (name, record) in records {
                if selected.as_ref().is_some_and(|s| !s.contains(name)) {
                    continue;
                }
                self.records
                    .entry(name.clone())
                    .or_default()
                    .entry(record.data_id().clone())
                    .or_insert_with(|| record.clone());
            }
        }
        Ok(())
    }

    fn select_elements(&self, elements: &[ElementRef]) -> Result<Option<BTreeSet<String>>> {
        if elements.is_empty() {
            return Ok(None);
        }
        let universe = self.registry.universe();
        elements
            .iter()
            .map(|e| universe.resolve(e).map(|e| e.name().to_string()))
            .collect::<Result<BTreeSet<_>>>()
            .map(Some)
    }

    /// Export datasets with their files and the dimension records of their
    /// data IDs.
    ///
    /// Refs are handled in sorted order and a dataset already exported by
    /// this context is skipped. Every ref must be resolved.
    pub fn save_datasets(
        &mut self,
        refs: &[DatasetRef],
        elements: &[ElementRef],
        rewrite: Option<&PathRewrite>,
    ) -> Result<()> {
        let mut sorted: Vec<&DatasetRef> = refs.iter().collect();
        sorted.sort();
        let mut fresh = Vec::new();
        let mut pending = BTreeSet::new();
        for dataset in sorted {
            let (id, _) = dataset.require_resolved()?;
            if !self.dataset_ids.contains(&id) && pending.insert(id) {
                fresh.push(dataset.clone());
            }
        }
        if fresh.is_empty() {
            return Ok(());
        }

        let files = self
            .datastore
            .export(&fresh, self.directory.as_deref(), self.transfer)?;
        for file in files {
            let file = match rewrite {
                Some(rewrite) => rewrite(file),
                None => file,
            };
            let Some(first) = file.refs.first() else {
                continue;
            };
            let (_, run) = first.require_resolved()?;
            let run = run.to_string();
            let dataset_type = first.dataset_type().clone();
            for dataset in &file.refs {
                self.dataset_ids.insert(dataset.require_resolved()?.0);
            }
            self.datasets
                .entry(dataset_type.name().to_string())
                .or_insert_with(|| (dataset_type, BTreeMap::new()))
                .1
                .entry(run)
                .or_default()
                .push(file);
        }

        let data_ids: BTreeSet<DataCoordinate> =
            fresh.iter().map(|d| d.data_id().clone()).collect();
        let data_ids: Vec<DataCoordinate> = data_ids.into_iter().collect();
        self.save_data_ids(&data_ids, elements)
    }

    /// Write everything out and hand back the backend.
    ///
    /// Sections go out in replay order: dimension records by element in
    /// dependency order, collections (including every run an exported
    /// dataset belongs to) with chains after their children, datasets by
    /// type then run, associations by collection.
    pub fn finish(mut self) -> Result<B> {
        let registry = self.registry;
        let universe = registry.universe();
        for element in universe.elements() {
            if let Some(records) = self.records.get(element.name()).filter(|r| !r.is_empty()) {
                let records: Vec<DimensionRecord> = records.values().cloned().collect();
                self.backend.save_dimension_data(element, &records)?;
            }
        }

        let collections = registry.collections();
        let runs: BTreeSet<&String> = self
            .datasets
            .values()
            .flat_map(|(_, runs)| runs.keys())
            .collect();
        for run in runs {
            if !self.collections.contains_key(run) {
                self.collections
                    .insert(run.clone(), collections.find(run)?.clone());
            }
        }

        for record in sort_collections(self.collections.values())? {
            let doc = collections.documentation(record.name());
            self.backend.save_collection(&record, doc)?;
        }

        for (dataset_type, runs) in self.datasets.values() {
            for (run, files) in runs {
                let mut files = files.clone();
                files.sort();
                self.backend.save_datasets(dataset_type, run, &files)?;
            }
        }

        for (collection, associations) in self.associations()? {
            let collection_type = self
                .collections
                .get(&collection)
                .map(CollectionRecord::collection_type)
                .ok_or_else(|| {
                    RegistryError::Internal(format!("association into unexported '{collection}'"))
                })?;
            self.backend
                .save_dataset_associations(&collection, collection_type, &associations)?;
        }

        self.backend.finish()?;
        tracing::info!(
            datasets = self.dataset_ids.len(),
            collections = self.collections.len(),
            elements = self.records.len(),
            "finished export"
        );
        Ok(self.backend)
    }

    /// TAGGED (and, for calibration types, CALIBRATION) memberships of
    /// exported datasets in exported collections, by collection.
    fn associations(&self) -> Result<BTreeMap<String, Vec<DatasetAssociation>>> {
        let names: Vec<String> = self.collections.keys().cloned().collect();
        let mut result: BTreeMap<String, Vec<DatasetAssociation>> = BTreeMap::new();
        for (name, (dataset_type, _)) in &self.datasets {
            let mut types = vec![CollectionType::Tagged];
            if dataset_type.is_calibration() {
                types.push(CollectionType::Calibration);
            }
            for association in self
                .registry
                .query_dataset_associations(name, &names, &types, false)?
            {
                let exported = association
                    .dataset
                    .id()
                    .is_some_and(|id| self.dataset_ids.contains(&id));
                if exported {
                    result
                        .entry(association.collection.clone())
                        .or_default()
                        .push(association);
                }
            }
        }
        for associations in result.values_mut() {
            associations.sort();
        }
        Ok(result)
    }
}

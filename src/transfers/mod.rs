//! Repository export and import.
//!
//! [`RepoExportContext`] decides what belongs in an export and in which
//! order; a [`RepoExportBackend`] decides how it is written. Import is the
//! mirror image: a [`RepoImportBackend`] replays an export into a registry,
//! registering dataset types and collections first and loading records
//! afterwards.

mod context;
mod format;
mod json;

pub use context::{PathRewrite, RepoExportContext};
pub use json::{EXPORT_VERSION, JsonRepoExportBackend, JsonRepoImportBackend};

use crate::collections::{CollectionRecord, CollectionType};
use crate::datasets::{DatasetAssociation, DatasetType, FileDataset};
use crate::datastore::{Datastore, TransferMode};
use crate::dimensions::{DimensionElement, DimensionRecord};
use crate::error::Result;
use crate::registry::Registry;
use std::collections::BTreeSet;
use std::path::Path;

/// Receives an export closure, one section at a time, in replay order.
pub trait RepoExportBackend {
    /// Records of one element, sorted by data ID.
    fn save_dimension_data(
        &mut self,
        element: &DimensionElement,
        records: &[DimensionRecord],
    ) -> Result<()>;

    fn save_collection(&mut self, record: &CollectionRecord, doc: Option<&str>) -> Result<()>;

    /// Files holding datasets of one type in one run, sorted.
    fn save_datasets(
        &mut self,
        dataset_type: &DatasetType,
        run: &str,
        datasets: &[FileDataset],
    ) -> Result<()>;

    /// Memberships of exported datasets in one TAGGED or CALIBRATION
    /// collection, sorted.
    fn save_dataset_associations(
        &mut self,
        collection: &str,
        collection_type: CollectionType,
        associations: &[DatasetAssociation],
    ) -> Result<()>;

    /// Called exactly once, after every other section.
    fn finish(&mut self) -> Result<()>;
}

/// Replays an export into a registry.
pub trait RepoImportBackend {
    /// Register dataset types and collections (chains last).
    fn register(&self, registry: &mut Registry) -> Result<()>;

    /// Insert dimension records, datasets and associations.
    ///
    /// Elements named in `skip_dimensions` are assumed to be present
    /// already. Datasets receive new ids; file locations are handed to
    /// `datastore` when one is given.
    fn load(
        &self,
        registry: &Registry,
        datastore: Option<&dyn Datastore>,
        directory: Option<&Path>,
        transfer: Option<TransferMode>,
        skip_dimensions: &BTreeSet<String>,
    ) -> Result<()>;
}

//! Dataset types, dataset references and their storage.
//!
//! Dataset types that share exactly the same dimensions share one dynamic
//! tags table (and one calibs table for calibration types); the
//! [`DatasetTypeStorageManager`] owns the mapping from each type to that
//! storage and assigns the surrogate ids.

mod manager;
mod refs;
mod storage;
mod tables;
mod types;

pub use manager::DatasetTypeStorageManager;
pub use refs::{DatasetAssociation, DatasetId, DatasetRef, FileDataset};
pub use storage::DatasetRecordStorage;
pub(crate) use tables::DATASET_TABLE;
pub use types::{DatasetType, StorageClass, StorageClassFactory};

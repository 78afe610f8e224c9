//! Metadata registry for a scientific data repository.
//!
//! The registry catalogs datasets by dataset type and by data ID (a set of
//! dimension values such as instrument, visit and detector), groups them
//! into collections, and can write a self-consistent slice of the catalog
//! to an export file that another repository replays. Dataset bytes are out
//! of scope: a [`Datastore`](datastore::Datastore) only reports where files
//! live.
//!
//! [`Registry`] is the facade most callers need. [`Repository`] persists
//! one in a directory, and [`script`] holds the operations behind the
//! `butler` command-line tool.

pub mod collections;
pub mod config;
pub mod database;
pub mod datasets;
pub mod datastore;
pub mod dimensions;
pub mod error;
pub mod registry;
pub mod repository;
mod schema_loader;
pub mod script;
pub mod testing;
pub mod timespan;
pub mod transfers;

pub use collections::{CollectionRecord, CollectionType};
pub use config::ButlerConfig;
pub use datasets::{DatasetAssociation, DatasetId, DatasetRef, DatasetType, FileDataset};
pub use dimensions::{DataCoordinate, DataIdValue, DimensionGraph, DimensionRecord, ElementRef};
pub use error::{RegistryError, Result};
pub use registry::Registry;
pub use repository::Repository;
pub use timespan::Timespan;
pub use transfers::{
    JsonRepoExportBackend, JsonRepoImportBackend, RepoExportBackend, RepoExportContext,
    RepoImportBackend,
};

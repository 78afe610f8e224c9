//! The datastore collaborator: where dataset bytes live.
//!
//! The registry only needs a datastore's bookkeeping: which file holds
//! which dataset and how to describe those files on export and ingest.
//! [`RecordingDatastore`] keeps exactly that bookkeeping, in the registry's
//! own database, without ever reading or writing dataset bytes.

use crate::database::{
    Database, FieldSpec, FieldType, ForeignKeySpec, Predicate, Select, Table, TableSpec, row,
    str_column,
};
use crate::datasets::{DatasetId, DatasetRef, FileDataset};
use crate::error::{RegistryError, Result};
use serde_json::Value;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

/// How files move between a datastore and an external location.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TransferMode {
    #[default]
    Auto,
    Link,
    Symlink,
    Hardlink,
    Relsymlink,
    Copy,
    Move,
    /// Leave files where they are and record absolute paths.
    Direct,
}

impl TransferMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferMode::Auto => "auto",
            TransferMode::Link => "link",
            TransferMode::Symlink => "symlink",
            TransferMode::Hardlink => "hardlink",
            TransferMode::Relsymlink => "relsymlink",
            TransferMode::Copy => "copy",
            TransferMode::Move => "move",
            TransferMode::Direct => "direct",
        }
    }
}

impl FromStr for TransferMode {
    type Err = RegistryError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "auto" => Ok(TransferMode::Auto),
            "link" => Ok(TransferMode::Link),
            "symlink" => Ok(TransferMode::Symlink),
            "hardlink" => Ok(TransferMode::Hardlink),
            "relsymlink" => Ok(TransferMode::Relsymlink),
            "copy" => Ok(TransferMode::Copy),
            "move" => Ok(TransferMode::Move),
            "direct" => Ok(TransferMode::Direct),
            other => Err(RegistryError::invalid(format!(
                "unknown transfer mode '{other}'"
            ))),
        }
    }
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub trait Datastore {
    /// Describe the files holding `refs`, one entry per file, in input
    /// order. Paths are relative to `directory` when one is given.
    fn export(
        &self,
        refs: &[DatasetRef],
        directory: Option<&Path>,
        transfer: Option<TransferMode>,
    ) -> Result<Vec<FileDataset>>;

    /// Take ownership of files described by `datasets`, whose paths are
    /// relative to `directory` when one is given.
    fn ingest(
        &self,
        datasets: &[FileDataset],
        directory: Option<&Path>,
        transfer: Option<TransferMode>,
    ) -> Result<()>;

    /// Drop all knowledge of the given datasets.
    fn forget(&self, ids: &[DatasetId]) -> Result<()>;

    fn knows(&self, dataset: &DatasetRef) -> Result<bool>;
}

const RECORDS_TABLE: &str = "file_datastore_records";

fn records_spec() -> TableSpec {
    TableSpec::new(vec![
        FieldSpec::new("dataset_id", FieldType::Int).primary_key(),
        FieldSpec::new("path", FieldType::String),
        FieldSpec::new("formatter", FieldType::String).nullable(),
    ])
    .with_foreign_key(
        ForeignKeySpec::new(crate::datasets::DATASET_TABLE, &["dataset_id"], &["dataset_id"])
            .cascade(),
    )
}

/// Datastore that records file locations without touching any bytes.
pub struct RecordingDatastore {
    db: Arc<dyn Database>,
    records: Table,
}

impl RecordingDatastore {
    /// Open the location table, creating it on first use. The registry's
    /// dataset tables must already exist.
    pub fn initialize(db: Arc<dyn Database>) -> Result<Self> {
        let records = db.ensure_table_exists(RECORDS_TABLE, &records_spec())?;
        Ok(Self { db, records })
    }

    /// Record where a dataset lives.
    pub fn put(&self, dataset: &DatasetRef, path: &str, formatter: Option<&str>) -> Result<()> {
        let (id, _) = dataset.require_resolved()?;
        self.db.sync(
            &self.records,
            row([("dataset_id", id)]),
            row([
                ("path", Value::from(path)),
                ("formatter", formatter.map_or(Value::Null, Value::from)),
            ]),
            &["dataset_id"],
        )?;
        Ok(())
    }

    /// Path and formatter recorded for `id`.
    pub fn location(&self, id: DatasetId) -> Result<Option<(String, Option<String>)>> {
        let rows = self
            .db
            .query(&Select::from(&self.records).eq("dataset_id", id))?;
        rows.first()
            .map(|r| {
                Ok((
                    str_column(r, "path")?.to_string(),
                    r.get("formatter").and_then(Value::as_str).map(str::to_string),
                ))
            })
            .transpose()
    }
}

impl Datastore for RecordingDatastore {
    fn export(
        &self,
        refs: &[DatasetRef],
        directory: Option<&Path>,
        _transfer: Option<TransferMode>,
    ) -> Result<Vec<FileDataset>> {
        let mut files: Vec<FileDataset> = Vec::new();
        for dataset in refs {
            let (id, _) = dataset.require_resolved()?;
            let (path, formatter) = self
                .location(id)?
                .ok_or(RegistryError::DatasetNotStored(id))?;
            let path = match directory {
                Some(dir) => Path::new(&path)
                    .strip_prefix(dir)
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or(path),
                None => path,
            };
            match files.iter_mut().find(|f| f.path == path) {
                Some(file) => file.refs.push(dataset.clone()),
                None => files.push(FileDataset::new(vec![dataset.clone()], path, formatter)),
            }
        }
        Ok(files)
    }

    fn ingest(
        &self,
        datasets: &[FileDataset],
        directory: Option<&Path>,
        transfer: Option<TransferMode>,
    ) -> Result<()> {
        for file in datasets {
            let path = match (directory, transfer) {
                (Some(dir), Some(TransferMode::Direct) | None) => {
                    dir.join(&file.path).to_string_lossy().into_owned()
                }
                _ => file.path.clone(),
            };
            for dataset in &file.refs {
                self.put(dataset, &path, file.formatter.as_deref())?;
            }
        }
        tracing::debug!(files = datasets.len(), "ingested file datasets");
        Ok(())
    }

    fn forget(&self, ids: &[DatasetId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.db.delete(
            &self.records,
            &[Predicate::In(
                "dataset_id".into(),
                ids.iter().map(|id| Value::from(*id)).collect(),
            )],
        )?;
        Ok(())
    }

    fn knows(&self, dataset: &DatasetRef) -> Result<bool> {
        let Some(id) = dataset.id() else {
            return Ok(false);
        };
        let rows = self
            .db
            .query(&Select::from(&self.records).eq("dataset_id", id))?;
        Ok(!rows.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_modes_round_trip_through_strings() {
        for mode in [
            TransferMode::Auto,
            TransferMode::Link,
            TransferMode::Symlink,
            TransferMode::Hardlink,
            TransferMode::Relsymlink,
            TransferMode::Copy,
            TransferMode::Move,
            TransferMode::Direct,
        ] {
            assert_eq!(mode.as_str().parse::<TransferMode>().unwrap(), mode);
        }
        assert!("teleport".parse::<TransferMode>().is_err());
    }
}

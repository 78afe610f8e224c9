use super::types::DatasetType;
use crate::dimensions::DataCoordinate;
use crate::error::{RegistryError, Result};
use crate::timespan::Timespan;
use std::cmp::Ordering;
use std::fmt;

/// Repository-unique integer dataset identifier.
pub type DatasetId = i64;

/// Reference to one dataset: its type and data ID, plus the id and owning
/// run once it has been resolved against a registry.
#[derive(Clone, Debug)]
pub struct DatasetRef {
    dataset_type: DatasetType,
    data_id: DataCoordinate,
    id: Option<DatasetId>,
    run: Option<String>,
}

impl DatasetRef {
    pub fn unresolved(dataset_type: DatasetType, data_id: DataCoordinate) -> Result<Self> {
        if data_id.graph() != dataset_type.dimensions() {
            return Err(RegistryError::invalid(format!(
                "data ID {data_id} has dimensions {}, but {dataset_type} needs {}",
                data_id.graph(),
                dataset_type.dimensions()
            )));
        }
        Ok(Self {
            dataset_type,
            data_id,
            id: None,
            run: None,
        })
    }

    pub fn resolved(
        dataset_type: DatasetType,
        data_id: DataCoordinate,
        id: DatasetId,
        run: impl Into<String>,
    ) -> Result<Self> {
        let mut r = Self::unresolved(dataset_type, data_id)?;
        r.id = Some(id);
        r.run = Some(run.into());
        Ok(r)
    }

    pub fn dataset_type(&self) -> &DatasetType {
        &self.dataset_type
    }

    pub fn data_id(&self) -> &DataCoordinate {
        &self.data_id
    }

    pub fn id(&self) -> Option<DatasetId> {
        self.id
    }

    pub fn run(&self) -> Option<&str> {
        self.run.as_deref()
    }

    pub fn is_resolved(&self) -> bool {
        self.id.is_some() && self.run.is_some()
    }

    /// The id and run, or an error naming the unresolved reference.
    pub fn require_resolved(&self) -> Result<(DatasetId, &str)> {
        match (self.id, self.run.as_deref()) {
            (Some(id), Some(run)) => Ok((id, run)),
            _ => Err(RegistryError::invalid(format!(
                "dataset reference {self} has no id and run"
            ))),
        }
    }

    /// Same reference with a different (e.g. expanded) data ID.
    pub fn with_data_id(&self, data_id: DataCoordinate) -> Result<Self> {
        let mut r = Self::unresolved(self.dataset_type.clone(), data_id)?;
        r.id = self.id;
        r.run = self.run.clone();
        Ok(r)
    }

    pub fn unresolve(&self) -> Self {
        Self {
            dataset_type: self.dataset_type.clone(),
            data_id: self.data_id.clone(),
            id: None,
            run: None,
        }
    }
}

impl PartialEq for DatasetRef {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for DatasetRef {}

impl PartialOrd for DatasetRef {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DatasetRef {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dataset_type
            .name()
            .cmp(other.dataset_type.name())
            .then_with(|| self.run.cmp(&other.run))
            .then_with(|| self.data_id.cmp(&other.data_id))
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl fmt::Display for DatasetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.dataset_type.name(), self.data_id)?;
        if let Some(id) = self.id {
            write!(f, " (id={id}")?;
            if let Some(run) = &self.run {
                write!(f, ", run={run}")?;
            }
            f.write_str(")")?;
        }
        Ok(())
    }
}

/// A file holding one or more datasets, as produced by datastore export.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileDataset {
    pub refs: Vec<DatasetRef>,
    pub path: String,
    pub formatter: Option<String>,
}

impl FileDataset {
    pub fn new(refs: Vec<DatasetRef>, path: impl Into<String>, formatter: Option<String>) -> Self {
        Self {
            refs,
            path: path.into(),
            formatter,
        }
    }
}

impl PartialOrd for FileDataset {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FileDataset {
    fn cmp(&self, other: &Self) -> Ordering {
        self.refs
            .cmp(&other.refs)
            .then_with(|| self.path.cmp(&other.path))
            .then_with(|| self.formatter.cmp(&other.formatter))
    }
}

/// Membership of a dataset in a collection, with the validity range for
/// CALIBRATION collections.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatasetAssociation {
    pub dataset: DatasetRef,
    pub collection: String,
    pub timespan: Option<Timespan>,
}

impl PartialOrd for DatasetAssociation {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DatasetAssociation {
    fn cmp(&self, other: &Self) -> Ordering {
        self.collection
            .cmp(&other.collection)
            .then_with(|| self.dataset.cmp(&other.dataset))
            .then_with(|| self.timespan.cmp(&other.timespan))
    }
}

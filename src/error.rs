//! Error type shared by every registry component.
//!
//! Variants follow the failure classes a caller has to tell apart: naming
//! conflicts they must resolve, structural problems in collection chains,
//! lookups of things that do not exist, and violations reported by the
//! relational engine.

use serde_json::Value;

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// A definition with the same name already exists and differs.
    #[error("conflicting definition: {0}")]
    ConflictingDefinition(String),

    /// CHAINED collections reference each other in a cycle.
    #[error("apparent cycle in CHAINED collection dependencies involving {names:?}")]
    CollectionCycle { names: Vec<String> },

    #[error("no collection with name '{0}' found")]
    MissingCollection(String),

    #[error("dataset type '{0}' does not exist")]
    MissingDatasetType(String),

    /// Bad caller input: unknown dimension, malformed data ID, wrong
    /// collection type, unresolved dataset reference.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Uniqueness or foreign-key violation reported by the database.
    #[error("integrity violation in table '{table}': {message}")]
    Integrity { table: String, message: String },

    /// Insert-or-verify found an existing row whose compared column differs.
    #[error(
        "existing row in table '{table}' has {column}={existing}, which conflicts with \
         requested value {requested}"
    )]
    SyncConflict {
        table: String,
        column: String,
        existing: Value,
        requested: Value,
    },

    /// A new data ID value could not be synchronized into its dimension table.
    #[error(
        "could not create data ID value for '{element}'; automatic relationship generation \
         may have failed, try passing related keys to assign a specific instrument, filter, etc."
    )]
    DataIdValue {
        element: String,
        #[source]
        source: Box<RegistryError>,
    },

    /// A catalog invariant the database should guarantee does not hold.
    #[error("internal consistency error: {0}")]
    Internal(String),

    #[error("dataset {0} is not known to the datastore")]
    DatasetNotStored(i64),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl RegistryError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn integrity(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Integrity {
            table: table.into(),
            message: message.into(),
        }
    }

    /// True for errors that come from uniqueness or foreign-key enforcement.
    pub fn is_integrity(&self) -> bool {
        matches!(self, Self::Integrity { .. } | Self::SyncConflict { .. })
    }
}

//! Serde model of the export document.

use crate::collections::CollectionType;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ExportDocument {
    pub description: String,
    pub version: String,
    pub data: Vec<Entry>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum Entry {
    Dimension {
        element: String,
        records: Vec<Map<String, Value>>,
    },
    Collection {
        name: String,
        collection_type: CollectionType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        doc: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        children: Vec<String>,
    },
    DatasetType {
        name: String,
        dimensions: Vec<String>,
        storage_class: String,
        #[serde(default)]
        is_calibration: bool,
    },
    Dataset {
        dataset_type: String,
        run: String,
        records: Vec<FileEntry>,
    },
    Associations {
        collection: String,
        collection_type: CollectionType,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        dataset_ids: Vec<i64>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        validity_ranges: Vec<ValidityEntry>,
    },
}

/// One file and the datasets it holds; ids and data IDs are parallel.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct FileEntry {
    pub dataset_id: Vec<i64>,
    pub data_id: Vec<Map<String, Value>>,
    pub path: String,
    #[serde(default)]
    pub formatter: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ValidityEntry {
    pub begin: Option<String>,
    pub end: Option<String>,
    pub dataset_ids: Vec<i64>,
}

use super::coordinate::DataIdValue;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Data ID of a single dimension element: its required dimensions plus itself.
pub type DataIdKey = BTreeMap<String, DataIdValue>;

/// All declared fields of one dimension element at one data ID.
///
/// Built only through `DimensionUniverse::make_record`, which validates the
/// fields, so `fields` always holds every declared column (absent optional
/// values as `null`) and can be written to the element's table directly.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DimensionRecord {
    definition: String,
    data_id: DataIdKey,
    fields: BTreeMap<String, Value>,
}

impl DimensionRecord {
    pub(crate) fn new(
        definition: String,
        data_id: DataIdKey,
        fields: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            definition,
            data_id,
            fields,
        }
    }

    /// Name of the element this record belongs to.
    pub fn definition(&self) -> &str {
        &self.definition
    }

    pub fn data_id(&self) -> &DataIdKey {
        &self.data_id
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field).filter(|v| !v.is_null())
    }
}

/// Either an already-built record or a raw field map still to be validated.
#[derive(Clone, Debug)]
pub enum RecordInput {
    Record(DimensionRecord),
    Fields(BTreeMap<String, Value>),
}

impl From<DimensionRecord> for RecordInput {
    fn from(record: DimensionRecord) -> Self {
        RecordInput::Record(record)
    }
}

impl From<BTreeMap<String, Value>> for RecordInput {
    fn from(fields: BTreeMap<String, Value>) -> Self {
        RecordInput::Fields(fields)
    }
}

impl From<serde_json::Map<String, Value>> for RecordInput {
    fn from(fields: serde_json::Map<String, Value>) -> Self {
        RecordInput::Fields(fields.into_iter().collect())
    }
}

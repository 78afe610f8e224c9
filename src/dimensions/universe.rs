use super::coordinate::DataIdValue;
use super::graph::DimensionGraph;
use super::record::{DataIdKey, DimensionRecord, RecordInput};
use crate::database::{FieldSpec, FieldType, ForeignKeySpec, TableSpec};
use crate::error::{RegistryError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Serialized form of a dimension universe, as found in `butler.json`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DimensionConfig {
    #[serde(default)]
    pub version: u32,
    pub elements: Vec<ElementConfig>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ElementConfig {
    pub name: String,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub implied: Vec<String>,
    pub primary_key: KeyField,
    #[serde(default)]
    pub unique_keys: Vec<KeyField>,
    #[serde(default)]
    pub metadata: Vec<MetadataField>,
    #[serde(default = "default_true")]
    pub has_table: bool,
    #[serde(default)]
    pub view_of: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    Int,
    String,
}

impl KeyType {
    fn field_type(self) -> FieldType {
        match self {
            KeyType::Int => FieldType::Int,
            KeyType::String => FieldType::String,
        }
    }

    fn accepts(self, value: &Value) -> bool {
        self.field_type().accepts(value)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyField {
    pub name: String,
    #[serde(rename = "type")]
    pub dtype: KeyType,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataField {
    pub name: String,
    #[serde(rename = "type")]
    pub dtype: FieldType,
    #[serde(default)]
    pub nullable: bool,
}

/// One named axis of data identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DimensionElement {
    name: String,
    index: usize,
    required: Vec<String>,
    implied: Vec<String>,
    primary_key: KeyField,
    unique_keys: Vec<KeyField>,
    metadata: Vec<MetadataField>,
    has_table: bool,
    view_of: Option<String>,
}

impl DimensionElement {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Position in the universe's dependency order.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Other dimensions needed to identify this one, transitively closed.
    pub fn required(&self) -> &[String] {
        &self.required
    }

    pub fn implied(&self) -> &[String] {
        &self.implied
    }

    pub fn primary_key(&self) -> &KeyField {
        &self.primary_key
    }

    pub fn unique_keys(&self) -> &[KeyField] {
        &self.unique_keys
    }

    pub fn metadata(&self) -> &[MetadataField] {
        &self.metadata
    }

    pub fn has_table(&self) -> bool {
        self.has_table
    }

    pub fn view_of(&self) -> Option<&str> {
        self.view_of.as_deref()
    }

    /// Whether records of this element are stored and exported on their own.
    pub fn is_exported(&self) -> bool {
        self.has_table && self.view_of.is_none()
    }

    /// Dimensions making up this element's data ID, in universe order.
    pub fn data_id_dimensions(&self) -> Vec<String> {
        let mut names = self.required.clone();
        names.push(self.name.clone());
        names
    }
}

impl fmt::Display for DimensionElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Either an element name or an element already resolved against a universe.
///
/// APIs that accept elements take `impl Into<ElementRef>` and resolve once at
/// the boundary with [`DimensionUniverse::resolve`].
#[derive(Clone, Debug)]
pub enum ElementRef {
    Name(String),
    Resolved(DimensionElement),
}

impl From<&str> for ElementRef {
    fn from(name: &str) -> Self {
        ElementRef::Name(name.to_string())
    }
}

impl From<String> for ElementRef {
    fn from(name: String) -> Self {
        ElementRef::Name(name)
    }
}

impl From<&DimensionElement> for ElementRef {
    fn from(element: &DimensionElement) -> Self {
        ElementRef::Resolved(element.clone())
    }
}

/// Immutable graph of dimension definitions.
#[derive(Clone, Debug)]
pub struct DimensionUniverse {
    version: u32,
    elements: Vec<DimensionElement>,
    by_name: BTreeMap<String, usize>,
}

impl DimensionUniverse {
    /// Build a universe, ordering elements so dependencies come first.
    ///
    /// The sort is stable with respect to configuration order, so the same
    /// configuration always yields the same indices (and therefore the same
    /// graph encodings and table names).
    pub fn from_config(config: &DimensionConfig) -> Result<Self> {
        let mut configs: BTreeMap<&str, &ElementConfig> = BTreeMap::new();
        for element in &config.elements {
            if configs.insert(element.name.as_str(), element).is_some() {
                return Err(RegistryError::Config(format!(
                    "duplicate dimension element '{}'",
                    element.name
                )));
            }
        }
        for element in &config.elements {
            for dep in element.required.iter().chain(&element.implied) {
                if !configs.contains_key(dep.as_str()) {
                    return Err(RegistryError::Config(format!(
                        "dimension '{}' depends on unknown dimension '{dep}'",
                        element.name
                    )));
                }
                if dep == &element.name {
                    return Err(RegistryError::Config(format!(
                        "dimension '{}' depends on itself",
                        element.name
                    )));
                }
            }
            if let Some(view) = &element.view_of {
                if !configs.contains_key(view.as_str()) {
                    return Err(RegistryError::Config(format!(
                        "dimension '{}' is a view of unknown element '{view}'",
                        element.name
                    )));
                }
            }
        }

        let mut ordered: Vec<&ElementConfig> = Vec::with_capacity(config.elements.len());
        let mut placed: BTreeSet<&str> = BTreeSet::new();
        while ordered.len() < config.elements.len() {
            let next = config.elements.iter().find(|e| {
                !placed.contains(e.name.as_str())
                    && e.required
                        .iter()
                        .chain(&e.implied)
                        .all(|dep| placed.contains(dep.as_str()))
            });
            let Some(next) = next else {
                let stuck: Vec<&str> = config
                    .elements
                    .iter()
                    .map(|e| e.name.as_str())
                    .filter(|n| !placed.contains(n))
                    .collect();
                return Err(RegistryError::Config(format!(
                    "dependency cycle among dimensions {stuck:?}"
                )));
            };
            placed.insert(next.name.as_str());
            ordered.push(next);
        }

        let by_name: BTreeMap<String, usize> = ordered
            .iter()
            .enumerate()
            .map(|(idx, e)| (e.name.clone(), idx))
            .collect();

        let mut elements: Vec<DimensionElement> = Vec::with_capacity(ordered.len());
        for (index, cfg) in ordered.iter().enumerate() {
            let mut required: BTreeSet<usize> = BTreeSet::new();
            for dep in &cfg.required {
                let dep_idx = by_name[dep];
                required.insert(dep_idx);
                required.extend(elements[dep_idx].required.iter().map(|n| by_name[n]));
            }
            let mut implied: Vec<String> = cfg.implied.clone();
            implied.sort_by_key(|n| by_name[n]);
            elements.push(DimensionElement {
                name: cfg.name.clone(),
                index,
                required: required
                    .into_iter()
                    .map(|i| ordered[i].name.clone())
                    .collect(),
                implied,
                primary_key: cfg.primary_key.clone(),
                unique_keys: cfg.unique_keys.clone(),
                metadata: cfg.metadata.clone(),
                has_table: cfg.has_table,
                view_of: cfg.view_of.clone(),
            });
        }

        if elements.is_empty() {
            return Err(RegistryError::Config(
                "dimension universe has no elements".to_string(),
            ));
        }
        Ok(Self {
            version: config.version,
            elements,
            by_name,
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Elements in dependency order.
    pub fn elements(&self) -> &[DimensionElement] {
        &self.elements
    }

    /// Look up an element; unknown names are an invalid argument.
    pub fn get(&self, name: &str) -> Result<&DimensionElement> {
        self.by_name
            .get(name)
            .map(|idx| &self.elements[*idx])
            .ok_or_else(|| RegistryError::invalid(format!("unknown dimension '{name}'")))
    }

    pub(crate) fn element_at(&self, index: usize) -> Option<&DimensionElement> {
        self.elements.get(index)
    }

    pub fn resolve(&self, element: &ElementRef) -> Result<&DimensionElement> {
        match element {
            ElementRef::Name(name) => self.get(name),
            ElementRef::Resolved(resolved) => {
                let ours = self.get(resolved.name())?;
                if ours != resolved {
                    return Err(RegistryError::invalid(format!(
                        "element '{}' does not belong to this dimension universe",
                        resolved.name()
                    )));
                }
                Ok(ours)
            }
        }
    }

    /// Order element names by dependency; unknown names are an error.
    pub fn sorted<'a, I>(&self, names: I) -> Result<Vec<&DimensionElement>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut elements = names
            .into_iter()
            .map(|n| self.get(n))
            .collect::<Result<Vec<_>>>()?;
        elements.sort_by_key(|e| e.index);
        elements.dedup_by_key(|e| e.index);
        Ok(elements)
    }

    /// Close `names` over required and implied dependencies.
    pub fn extract<'a, I>(&self, names: I) -> Result<DimensionGraph>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut members: BTreeSet<usize> = BTreeSet::new();
        let mut pending: Vec<usize> = names
            .into_iter()
            .map(|n| self.get(n).map(|e| e.index))
            .collect::<Result<_>>()?;
        while let Some(idx) = pending.pop() {
            if !members.insert(idx) {
                continue;
            }
            let element = &self.elements[idx];
            for dep in element.required.iter().chain(&element.implied) {
                pending.push(self.by_name[dep]);
            }
        }
        let implied: BTreeSet<usize> = members
            .iter()
            .flat_map(|idx| self.elements[*idx].implied.iter().map(|n| self.by_name[n]))
            .collect();
        let required: Vec<usize> = members.difference(&implied).copied().collect();

        let mut mask = vec![0u8; self.elements.len().div_ceil(8)];
        for idx in &required {
            mask[idx / 8] |= 1 << (idx % 8);
        }
        let encoded: String = mask.iter().map(|b| format!("{b:02x}")).collect();

        Ok(DimensionGraph::new(
            members.iter().map(|i| self.elements[*i].name.clone()).collect(),
            required.iter().map(|i| self.elements[*i].name.clone()).collect(),
            encoded,
        ))
    }

    pub fn key_type(&self, dimension: &str) -> Result<KeyType> {
        Ok(self.get(dimension)?.primary_key.dtype)
    }

    /// Layout of the table holding an element's records.
    ///
    /// Required dimensions appear as columns named after the dimension and
    /// form the primary key together with the element's own key; each of
    /// them carries a foreign key to the referenced element's table.
    pub fn table_spec(&self, element: &DimensionElement) -> Result<TableSpec> {
        let mut fields = Vec::new();
        for dep in &element.required {
            fields.push(FieldSpec::new(dep, self.key_type(dep)?.field_type()).primary_key());
        }
        fields.push(
            FieldSpec::new(&element.primary_key.name, element.primary_key.dtype.field_type())
                .primary_key(),
        );
        for key in &element.unique_keys {
            fields.push(FieldSpec::new(&key.name, key.dtype.field_type()));
        }
        for dep in &element.implied {
            fields.push(FieldSpec::new(dep, self.key_type(dep)?.field_type()).nullable());
        }
        for meta in &element.metadata {
            let field = FieldSpec::new(&meta.name, meta.dtype);
            fields.push(if meta.nullable { field.nullable() } else { field });
        }

        let mut spec = TableSpec::new(fields);
        for key in &element.unique_keys {
            let mut columns: Vec<&str> = element.required.iter().map(String::as_str).collect();
            columns.push(&key.name);
            spec = spec.with_unique(&columns);
        }
        for dep in element.required.iter().chain(&element.implied) {
            let target = self.get(dep)?;
            if !target.is_exported() {
                continue;
            }
            if !target.required.iter().all(|r| element.required.contains(r)) {
                continue;
            }
            let mut source: Vec<&str> = target.required.iter().map(String::as_str).collect();
            let mut target_cols = source.clone();
            source.push(dep);
            target_cols.push(&target.primary_key.name);
            spec = spec.with_foreign_key(ForeignKeySpec::new(dep, &source, &target_cols));
        }
        Ok(spec)
    }

    /// Validate a field map into a record of `element`.
    pub fn make_record(
        &self,
        element: &DimensionElement,
        mut fields: BTreeMap<String, Value>,
    ) -> Result<DimensionRecord> {
        let err = |msg: String| RegistryError::invalid(format!("{} record: {msg}", element.name));

        let mut declared: BTreeSet<&str> = BTreeSet::new();
        let mut data_id: DataIdKey = BTreeMap::new();

        for dep in &element.required {
            declared.insert(dep);
            let value = fields
                .get(dep)
                .filter(|v| self.key_type(dep).map(|t| t.accepts(v)).unwrap_or(false))
                .ok_or_else(|| err(format!("missing or mistyped required key '{dep}'")))?;
            data_id.insert(dep.clone(), to_key(value)?);
        }
        declared.insert(&element.primary_key.name);
        let pk = fields
            .get(&element.primary_key.name)
            .filter(|v| element.primary_key.dtype.accepts(v))
            .ok_or_else(|| {
                err(format!(
                    "missing or mistyped primary key '{}'",
                    element.primary_key.name
                ))
            })?;
        data_id.insert(element.name.clone(), to_key(pk)?);

        for key in &element.unique_keys {
            declared.insert(&key.name);
            if !fields.get(&key.name).is_some_and(|v| key.dtype.accepts(v)) {
                return Err(err(format!("missing or mistyped key '{}'", key.name)));
            }
        }
        for dep in &element.implied {
            declared.insert(dep);
            let value = fields.entry(dep.clone()).or_insert(Value::Null);
            if !value.is_null() && !self.key_type(dep)?.accepts(value) {
                return Err(err(format!("mistyped implied key '{dep}'")));
            }
        }
        for meta in &element.metadata {
            declared.insert(&meta.name);
            let value = fields.entry(meta.name.clone()).or_insert(Value::Null);
            if value.is_null() {
                if !meta.nullable {
                    return Err(err(format!("missing value for field '{}'", meta.name)));
                }
            } else if !meta.dtype.accepts(value) {
                return Err(err(format!("mistyped value for field '{}'", meta.name)));
            }
        }
        if let Some(unknown) = fields.keys().find(|k| !declared.contains(k.as_str())) {
            return Err(err(format!("unknown field '{unknown}'")));
        }
        Ok(DimensionRecord::new(element.name.clone(), data_id, fields))
    }

    /// Resolve a [`RecordInput`] into a record of `element`.
    ///
    /// Prebuilt records must have been built for the same element.
    pub fn coerce_record(
        &self,
        element: &DimensionElement,
        input: RecordInput,
    ) -> Result<DimensionRecord> {
        match input {
            RecordInput::Fields(fields) => self.make_record(element, fields),
            RecordInput::Record(record) => {
                if record.definition() != element.name {
                    return Err(RegistryError::invalid(format!(
                        "mismatch between element={} and dimension record with definition={}",
                        element.name,
                        record.definition()
                    )));
                }
                Ok(record)
            }
        }
    }
}

fn to_key(value: &Value) -> Result<DataIdValue> {
    DataIdValue::from_json(value)
        .ok_or_else(|| RegistryError::invalid(format!("{value} is not a valid key value")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ButlerConfig;
    use serde_json::json;

    fn universe() -> DimensionUniverse {
        ButlerConfig::default_config().universe().unwrap()
    }

    #[test]
    fn dependencies_precede_dependents() {
        let universe = universe();
        for element in universe.elements() {
            for dep in element.required().iter().chain(element.implied()) {
                assert!(universe.get(dep).unwrap().index() < element.index());
            }
        }
        let sorted = universe.sorted(["detector", "visit", "instrument"]).unwrap();
        assert_eq!(sorted[0].name(), "instrument");
    }

    #[test]
    fn unknown_dimension_is_invalid_argument() {
        let err = universe().get("4thDimension").unwrap_err();
        assert!(matches!(err, RegistryError::InvalidArgument(_)));
    }

    #[test]
    fn cyclic_configuration_is_rejected() {
        let config: DimensionConfig = serde_json::from_value(json!({
            "elements": [
                {"name": "a", "implied": ["b"], "primary_key": {"name": "id", "type": "int"}},
                {"name": "b", "implied": ["a"], "primary_key": {"name": "id", "type": "int"}}
            ]
        }))
        .unwrap();
        let err = DimensionUniverse::from_config(&config).unwrap_err();
        assert!(matches!(err, RegistryError::Config(_)));
    }

    #[test]
    fn make_record_validates_fields() {
        let universe = universe();
        let detector = universe.get("detector").unwrap();
        let fields = |v: Value| -> BTreeMap<String, Value> {
            v.as_object().unwrap().clone().into_iter().collect()
        };

        let record = universe
            .make_record(
                detector,
                fields(json!({"instrument": "notACam", "id": 5, "full_name": "chip_5"})),
            )
            .unwrap();
        assert_eq!(record.data_id()["detector"], DataIdValue::Int(5));
        assert_eq!(record.data_id()["instrument"], DataIdValue::from("notACam"));

        let missing = universe.make_record(detector, fields(json!({"id": 5, "full_name": "x"})));
        assert!(missing.is_err());
        let unknown = universe.make_record(
            detector,
            fields(json!({"instrument": "notACam", "id": 5, "full_name": "x", "color": "red"})),
        );
        assert!(unknown.is_err());
    }

    #[test]
    fn records_for_other_elements_are_rejected() {
        let universe = universe();
        let instrument = universe.get("instrument").unwrap();
        let record = universe
            .make_record(
                instrument,
                BTreeMap::from([("name".to_string(), json!("notACam"))]),
            )
            .unwrap();
        let detector = universe.get("detector").unwrap();
        let err = universe
            .coerce_record(detector, RecordInput::Record(record))
            .unwrap_err();
        assert!(err.to_string().contains("mismatch"));
    }
}

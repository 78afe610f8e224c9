use super::graph::DimensionGraph;
use super::record::DimensionRecord;
use super::universe::DimensionUniverse;
use crate::error::{RegistryError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Primary-key value of one dimension.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DataIdValue {
    Int(i64),
    Str(String),
}

impl DataIdValue {
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(DataIdValue::Int),
            Value::String(s) => Some(DataIdValue::Str(s.clone())),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            DataIdValue::Int(v) => Value::from(*v),
            DataIdValue::Str(s) => Value::from(s.as_str()),
        }
    }
}

impl fmt::Display for DataIdValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataIdValue::Int(v) => write!(f, "{v}"),
            DataIdValue::Str(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for DataIdValue {
    fn from(value: i64) -> Self {
        DataIdValue::Int(value)
    }
}

impl From<&str> for DataIdValue {
    fn from(value: &str) -> Self {
        DataIdValue::Str(value.to_string())
    }
}

impl From<String> for DataIdValue {
    fn from(value: String) -> Self {
        DataIdValue::Str(value)
    }
}

/// Value assignment for the dimensions of a graph.
///
/// Always carries every required value; implied values and full records are
/// optional and filled in by `Registry::expand_data_id`. Equality, hashing
/// and ordering only look at the graph and the required values.
#[derive(Clone, Debug)]
pub struct DataCoordinate {
    graph: DimensionGraph,
    values: BTreeMap<String, DataIdValue>,
    records: Option<BTreeMap<String, DimensionRecord>>,
}

impl DataCoordinate {
    /// Validate `values` against `graph`.
    ///
    /// Every required dimension must be present; keys outside the graph are
    /// rejected so typos surface instead of being silently dropped.
    pub fn standardize(
        graph: &DimensionGraph,
        values: BTreeMap<String, DataIdValue>,
    ) -> Result<Self> {
        if let Some(extra) = values.keys().find(|k| !graph.contains(k)) {
            return Err(RegistryError::invalid(format!(
                "data ID key '{extra}' is not a dimension of {graph}"
            )));
        }
        if let Some(missing) = graph.required().iter().find(|d| !values.contains_key(*d)) {
            return Err(RegistryError::invalid(format!(
                "data ID for {graph} is missing required dimension '{missing}'"
            )));
        }
        Ok(Self {
            graph: graph.clone(),
            values,
            records: None,
        })
    }

    /// Convenience constructor extracting the graph from the key names.
    pub fn from_pairs<I, K, V>(universe: &DimensionUniverse, pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<DataIdValue>,
    {
        let values: BTreeMap<String, DataIdValue> = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let graph = universe.extract(values.keys().map(String::as_str))?;
        Self::standardize(&graph, values)
    }

    pub fn graph(&self) -> &DimensionGraph {
        &self.graph
    }

    /// Restrict to the dimensions of `graph`, dropping any records.
    pub fn subset(&self, graph: &DimensionGraph) -> Result<Self> {
        if graph == &self.graph {
            return Ok(Self {
                graph: self.graph.clone(),
                values: self.values.clone(),
                records: None,
            });
        }
        let values = graph
            .dimensions()
            .iter()
            .filter_map(|d| self.values.get(d).map(|v| (d.clone(), v.clone())))
            .collect();
        Self::standardize(graph, values)
    }

    pub fn get(&self, dimension: &str) -> Option<&DataIdValue> {
        self.values.get(dimension)
    }

    /// Values of the required dimensions only.
    pub fn required_values(&self) -> BTreeMap<String, DataIdValue> {
        self.graph
            .required()
            .iter()
            .filter_map(|d| self.values.get(d).map(|v| (d.clone(), v.clone())))
            .collect()
    }

    /// Every known value, including implied ones once expanded.
    pub fn values(&self) -> &BTreeMap<String, DataIdValue> {
        &self.values
    }

    pub fn has_full(&self) -> bool {
        self.graph
            .dimensions()
            .iter()
            .all(|d| self.values.contains_key(d))
    }

    pub fn has_records(&self) -> bool {
        self.records.is_some()
    }

    pub fn records(&self) -> Option<&BTreeMap<String, DimensionRecord>> {
        self.records.as_ref()
    }

    pub(crate) fn expanded(
        graph: DimensionGraph,
        values: BTreeMap<String, DataIdValue>,
        records: BTreeMap<String, DimensionRecord>,
    ) -> Self {
        Self {
            graph,
            values,
            records: Some(records),
        }
    }
}

impl PartialEq for DataCoordinate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for DataCoordinate {}

impl Hash for DataCoordinate {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.graph.hash(state);
        self.required_values().hash(state);
    }
}

impl PartialOrd for DataCoordinate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DataCoordinate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.graph
            .cmp(&other.graph)
            .then_with(|| self.required_values().cmp(&other.required_values()))
    }
}

impl fmt::Display for DataCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .required_values()
            .iter()
            .map(|(k, v)| format!("{k}: {v}"))
            .collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ButlerConfig;

    fn universe() -> DimensionUniverse {
        ButlerConfig::default_config().universe().unwrap()
    }

    #[test]
    fn standardize_requires_every_required_dimension() {
        let universe = universe();
        let graph = universe.extract(["instrument", "visit", "detector"]).unwrap();
        let err = DataCoordinate::standardize(
            &graph,
            BTreeMap::from([
                ("instrument".to_string(), DataIdValue::from("Cam")),
                ("visit".to_string(), DataIdValue::Int(1)),
            ]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("detector"));
    }

    #[test]
    fn equality_ignores_implied_values() {
        let universe = universe();
        let graph = universe.extract(["instrument", "visit"]).unwrap();
        let minimal = DataCoordinate::standardize(
            &graph,
            BTreeMap::from([
                ("instrument".to_string(), DataIdValue::from("Cam")),
                ("visit".to_string(), DataIdValue::Int(1)),
            ]),
        )
        .unwrap();
        let full = DataCoordinate::standardize(
            &graph,
            BTreeMap::from([
                ("instrument".to_string(), DataIdValue::from("Cam")),
                ("visit".to_string(), DataIdValue::Int(1)),
                ("physical_filter".to_string(), DataIdValue::from("k2020")),
            ]),
        )
        .unwrap();
        assert_eq!(minimal, full);
        assert!(!minimal.has_full());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let universe = universe();
        let err = DataCoordinate::from_pairs(&universe, [("fourth_dimension", 1i64)]).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidArgument(_)));
    }
}

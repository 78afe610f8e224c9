use super::universe::DimensionUniverse;
use crate::error::{RegistryError, Result};
use std::fmt;

/// A set of dimensions closed over their required and implied dependencies.
///
/// Names are kept in universe (dependency) order. `required` is the subset
/// not implied by any other member; it alone identifies a data ID. The
/// canonical encoding is a bitmask over the required members' universe
/// indices, rendered as hex, and is what dataset tables are named after.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DimensionGraph {
    dimensions: Vec<String>,
    required: Vec<String>,
    encoded: String,
}

impl DimensionGraph {
    pub(crate) fn new(dimensions: Vec<String>, required: Vec<String>, encoded: String) -> Self {
        Self {
            dimensions,
            required,
            encoded,
        }
    }

    pub fn dimensions(&self) -> &[String] {
        &self.dimensions
    }

    pub fn required(&self) -> &[String] {
        &self.required
    }

    /// Members that are implied by other members.
    pub fn implied(&self) -> impl Iterator<Item = &String> {
        self.dimensions
            .iter()
            .filter(|d| !self.required.contains(d))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.dimensions.iter().any(|d| d == name)
    }

    pub fn is_empty(&self) -> bool {
        self.dimensions.is_empty()
    }

    pub fn encode(&self) -> &str {
        &self.encoded
    }

    /// Rebuild a graph from [`DimensionGraph::encode`] output.
    pub fn decode(encoded: &str, universe: &DimensionUniverse) -> Result<Self> {
        if encoded.len() % 2 != 0 || !encoded.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(RegistryError::invalid(format!(
                "malformed dimension encoding '{encoded}'"
            )));
        }
        let mut names = Vec::new();
        for (byte_idx, chunk) in encoded.as_bytes().chunks(2).enumerate() {
            let text = std::str::from_utf8(chunk)
                .map_err(|_| RegistryError::invalid("dimension encoding is not ASCII"))?;
            let byte = u8::from_str_radix(text, 16)
                .map_err(|_| RegistryError::invalid(format!("bad hex byte '{text}'")))?;
            for bit in 0..8 {
                if byte & (1 << bit) != 0 {
                    let element = universe.element_at(byte_idx * 8 + bit).ok_or_else(|| {
                        RegistryError::invalid(format!(
                            "dimension encoding '{encoded}' refers to an index outside the universe"
                        ))
                    })?;
                    names.push(element.name().to_string());
                }
            }
        }
        universe.extract(names.iter().map(String::as_str))
    }
}

impl fmt::Display for DimensionGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}", self.required.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use crate::config::ButlerConfig;

    #[test]
    fn closure_adds_implied_dimensions_but_keeps_them_out_of_required() {
        let universe = ButlerConfig::default_config().universe().unwrap();
        let graph = universe.extract(["visit", "detector"]).unwrap();
        assert!(graph.contains("instrument"));
        assert!(graph.contains("physical_filter"));
        assert_eq!(graph.required(), ["instrument", "visit", "detector"]);
        assert!(graph.implied().any(|d| d == "physical_filter"));
    }

    #[test]
    fn encoding_round_trips_through_the_universe() {
        let universe = ButlerConfig::default_config().universe().unwrap();
        let graph = universe
            .extract(["instrument", "visit", "detector"])
            .unwrap();
        let decoded = super::DimensionGraph::decode(graph.encode(), &universe).unwrap();
        assert_eq!(decoded, graph);
        assert!(super::DimensionGraph::decode("zz", &universe).is_err());
    }
}

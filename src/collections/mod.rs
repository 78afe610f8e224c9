//! Named collections of datasets and the ordering of CHAINED collections.
//!
//! A RUN owns the datasets written into it; TAGGED and CALIBRATION
//! collections associate existing datasets (the latter with a validity
//! range); a CHAINED collection is an ordered alias over other collections.
//! Whenever a set of collections has to be created or written out, chains
//! must come after every chain they list, which [`sort_collections`]
//! guarantees deterministically.

mod manager;

pub use manager::CollectionManager;
pub(crate) use manager::COLLECTION_TABLE;

use crate::error::{RegistryError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CollectionType {
    Run,
    Tagged,
    Calibration,
    Chained,
}

impl CollectionType {
    pub const ALL: [CollectionType; 4] = [
        CollectionType::Run,
        CollectionType::Tagged,
        CollectionType::Calibration,
        CollectionType::Chained,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionType::Run => "RUN",
            CollectionType::Tagged => "TAGGED",
            CollectionType::Calibration => "CALIBRATION",
            CollectionType::Chained => "CHAINED",
        }
    }
}

impl FromStr for CollectionType {
    type Err = RegistryError;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_uppercase().as_str() {
            "RUN" => Ok(CollectionType::Run),
            "TAGGED" => Ok(CollectionType::Tagged),
            "CALIBRATION" => Ok(CollectionType::Calibration),
            "CHAINED" => Ok(CollectionType::Chained),
            _ => Err(RegistryError::invalid(format!(
                "unknown collection type '{value}'"
            ))),
        }
    }
}

impl fmt::Display for CollectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for CollectionType {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for CollectionType {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

/// Current definition of one collection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollectionRecord {
    key: i64,
    name: String,
    collection_type: CollectionType,
    children: Vec<String>,
}

impl CollectionRecord {
    pub(crate) fn new(key: i64, name: String, collection_type: CollectionType) -> Self {
        Self {
            key,
            name,
            collection_type,
            children: Vec::new(),
        }
    }

    /// Surrogate key assigned by the database.
    pub fn key(&self) -> i64 {
        self.key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn collection_type(&self) -> CollectionType {
        self.collection_type
    }

    /// Ordered children; empty unless CHAINED.
    pub fn children(&self) -> &[String] {
        &self.children
    }

    pub(crate) fn set_children(&mut self, children: Vec<String>) {
        self.children = children;
    }
}

/// Order collections so every CHAINED collection follows the chains it lists.
///
/// Non-chained collections come first, by name. Chains are then emitted in
/// rounds: each round takes every pending chain none of whose children is a
/// pending chain, sorted by name. A round with nothing to take means the
/// remaining chains form a cycle.
pub fn sort_collections<'a, I>(records: I) -> Result<Vec<CollectionRecord>>
where
    I: IntoIterator<Item = &'a CollectionRecord>,
{
    let mut plain: BTreeMap<&str, &CollectionRecord> = BTreeMap::new();
    let mut pending: BTreeMap<&str, &CollectionRecord> = BTreeMap::new();
    for record in records {
        if record.collection_type == CollectionType::Chained {
            pending.insert(record.name(), record);
        } else {
            plain.insert(record.name(), record);
        }
    }

    let mut result: Vec<CollectionRecord> = plain.into_values().cloned().collect();
    while !pending.is_empty() {
        let unblocked: BTreeSet<&str> = pending
            .values()
            .filter(|r| !r.children.iter().any(|c| pending.contains_key(c.as_str())))
            .map(|r| r.name())
            .collect();
        if unblocked.is_empty() {
            return Err(RegistryError::CollectionCycle {
                names: pending.keys().map(|n| n.to_string()).collect(),
            });
        }
        for name in unblocked {
            if let Some(record) = pending.remove(name) {
                result.push(record.clone());
            }
        }
    }
    Ok(result)
}

/// Shell-style matching with `*` (any run) and `?` (one character).
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while t < text.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, t));
                p += 1;
            }
            Some(c) if *c == '?' || *c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    p = star + 1;
                    t = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(key: i64, name: &str, children: &[&str]) -> CollectionRecord {
        let mut record = CollectionRecord::new(key, name.to_string(), CollectionType::Chained);
        record.set_children(children.iter().map(|c| c.to_string()).collect());
        record
    }

    fn plain(key: i64, name: &str, collection_type: CollectionType) -> CollectionRecord {
        CollectionRecord::new(key, name.to_string(), collection_type)
    }

    fn names(records: &[CollectionRecord]) -> Vec<&str> {
        records.iter().map(|r| r.name()).collect()
    }

    #[test]
    fn chains_follow_their_children() {
        let records = vec![
            chain(1, "outer", &["inner", "run_b"]),
            plain(2, "run_b", CollectionType::Run),
            chain(3, "inner", &["run_a", "tag"]),
            plain(4, "tag", CollectionType::Tagged),
            plain(5, "run_a", CollectionType::Run),
            chain(6, "alpha", &["run_a"]),
        ];
        let sorted = sort_collections(&records).unwrap();
        assert_eq!(
            names(&sorted),
            ["run_a", "run_b", "tag", "alpha", "inner", "outer"]
        );

        let mut reversed = records.clone();
        reversed.reverse();
        assert_eq!(sort_collections(&reversed).unwrap(), sorted);
    }

    #[test]
    fn children_outside_the_set_do_not_block() {
        let records = vec![chain(1, "c", &["not_exported"])];
        assert_eq!(names(&sort_collections(&records).unwrap()), ["c"]);
    }

    #[test]
    fn cycles_are_fatal_and_named() {
        let records = vec![
            chain(1, "A", &["B"]),
            chain(2, "B", &["A"]),
            chain(3, "C", &[]),
        ];
        match sort_collections(&records) {
            Err(RegistryError::CollectionCycle { names }) => assert_eq!(names, ["A", "B"]),
            other => panic!("expected a cycle error, got {other:?}"),
        }
    }

    #[test]
    fn collection_types_parse_case_insensitively() {
        assert_eq!("tagged".parse::<CollectionType>().unwrap(), CollectionType::Tagged);
        assert!("bogus".parse::<CollectionType>().is_err());
        let json = serde_json::to_string(&CollectionType::Calibration).unwrap();
        assert_eq!(json, "\"CALIBRATION\"");
    }

    #[test]
    fn glob_patterns() {
        assert!(glob_match("run*", "run1"));
        assert!(glob_match("*", ""));
        assert!(glob_match("r?n/*/x", "run/abc/x"));
        assert!(!glob_match("run?", "run"));
        assert!(!glob_match("calib*", "run/calib"));
        assert!(glob_match("*calib*", "run/calib/x"));
    }
}

use super::{CollectionRecord, CollectionType, glob_match};
use crate::database::{
    Database, FieldSpec, FieldType, ForeignKeySpec, Predicate, Select, Table, TableSpec,
    int_column, row, str_column,
};
use crate::error::{RegistryError, Result};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

pub(crate) const COLLECTION_TABLE: &str = "collection";
const CHAIN_TABLE: &str = "collection_chain";

fn collection_spec() -> TableSpec {
    TableSpec::new(vec![
        FieldSpec::new("collection_id", FieldType::Int).autoincrement(),
        FieldSpec::new("name", FieldType::String),
        FieldSpec::new("type", FieldType::String),
        FieldSpec::new("doc", FieldType::String).nullable(),
    ])
    .with_unique(&["name"])
}

fn chain_spec() -> TableSpec {
    TableSpec::new(vec![
        FieldSpec::new("parent", FieldType::Int).primary_key(),
        FieldSpec::new("position", FieldType::Int).primary_key(),
        FieldSpec::new("child", FieldType::Int),
    ])
    .with_foreign_key(
        ForeignKeySpec::new(COLLECTION_TABLE, &["parent"], &["collection_id"]).cascade(),
    )
    .with_foreign_key(ForeignKeySpec::new(COLLECTION_TABLE, &["child"], &["collection_id"]))
}

/// Cached view of every collection in the repository.
///
/// Like the dataset-type manager, lookups never touch the database; call
/// [`CollectionManager::refresh`] to observe changes made elsewhere.
pub struct CollectionManager {
    db: Arc<dyn Database>,
    collections: Table,
    chains: Table,
    by_name: BTreeMap<String, CollectionRecord>,
    names_by_key: BTreeMap<i64, String>,
    docs: BTreeMap<String, String>,
}

impl CollectionManager {
    pub fn initialize(db: Arc<dyn Database>) -> Result<Self> {
        let collections = db.ensure_table_exists(COLLECTION_TABLE, &collection_spec())?;
        let chains = db.ensure_table_exists(CHAIN_TABLE, &chain_spec())?;
        let mut manager = Self {
            db,
            collections,
            chains,
            by_name: BTreeMap::new(),
            names_by_key: BTreeMap::new(),
            docs: BTreeMap::new(),
        };
        manager.refresh()?;
        Ok(manager)
    }

    pub fn refresh(&mut self) -> Result<()> {
        let mut by_name = BTreeMap::new();
        let mut names_by_key = BTreeMap::new();
        let mut docs = BTreeMap::new();
        for r in self.db.query(&Select::from(&self.collections))? {
            let key = int_column(&r, "collection_id")?;
            let name = str_column(&r, "name")?.to_string();
            let collection_type = str_column(&r, "type")?.parse()?;
            if let Some(doc) = r.get("doc").and_then(Value::as_str) {
                docs.insert(name.clone(), doc.to_string());
            }
            names_by_key.insert(key, name.clone());
            by_name.insert(name.clone(), CollectionRecord::new(key, name, collection_type));
        }

        let mut links: BTreeMap<i64, Vec<(i64, i64)>> = BTreeMap::new();
        for r in self.db.query(&Select::from(&self.chains))? {
            links
                .entry(int_column(&r, "parent")?)
                .or_default()
                .push((int_column(&r, "position")?, int_column(&r, "child")?));
        }
        for (parent, mut children) in links {
            children.sort();
            let names = children
                .into_iter()
                .map(|(_, child)| lookup_key(&names_by_key, child).cloned())
                .collect::<Result<Vec<_>>>()?;
            let parent_name = lookup_key(&names_by_key, parent)?;
            if let Some(record) = by_name.get_mut(parent_name) {
                record.set_children(names);
            }
        }

        tracing::debug!(collections = by_name.len(), "refreshed collection cache");
        self.by_name = by_name;
        self.names_by_key = names_by_key;
        self.docs = docs;
        Ok(())
    }

    /// Create a collection or verify an existing one has the same type.
    ///
    /// Returns the record and whether it was newly created.
    pub fn register(
        &mut self,
        name: &str,
        collection_type: CollectionType,
        doc: Option<&str>,
    ) -> Result<(CollectionRecord, bool)> {
        if name.is_empty() {
            return Err(RegistryError::invalid("collection names may not be empty"));
        }
        let (r, inserted) = self
            .db
            .sync(
                &self.collections,
                row([("name", name)]),
                row([("type", collection_type.as_str())]),
                &["collection_id"],
            )
            .map_err(|err| match err {
                RegistryError::SyncConflict { existing, .. } => {
                    RegistryError::ConflictingDefinition(format!(
                        "collection '{name}' already exists with type {}, not {collection_type}",
                        existing.as_str().unwrap_or("?")
                    ))
                }
                other => other,
            })?;
        let key = int_column(&r, "collection_id")?;
        if inserted {
            tracing::info!(collection = name, kind = %collection_type, "registered collection");
            if let Some(doc) = doc {
                self.set_documentation(name, key, doc)?;
            }
        }
        let record = CollectionRecord::new(key, name.to_string(), collection_type);
        let record = match self.by_name.get(name) {
            Some(cached) if cached.key() == key => cached.clone(),
            _ => {
                self.names_by_key.insert(key, name.to_string());
                self.by_name.insert(name.to_string(), record.clone());
                record
            }
        };
        Ok((record, inserted))
    }

    pub fn find(&self, name: &str) -> Result<&CollectionRecord> {
        self.by_name
            .get(name)
            .ok_or_else(|| RegistryError::MissingCollection(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn find_key(&self, key: i64) -> Result<&CollectionRecord> {
        let name = lookup_key(&self.names_by_key, key)?;
        self.find(name)
    }

    /// Every cached collection, by name.
    pub fn iter(&self) -> impl Iterator<Item = &CollectionRecord> {
        self.by_name.values()
    }

    /// Delete a collection.
    ///
    /// Removing a RUN deletes the datasets it owns; a collection still listed
    /// by a CHAINED parent cannot be removed.
    pub fn remove(&mut self, name: &str) -> Result<()> {
        let record = self.find(name)?.clone();
        let parents: Vec<&str> = self
            .by_name
            .values()
            .filter(|r| r.children().iter().any(|c| c == name))
            .map(|r| r.name())
            .collect();
        if !parents.is_empty() {
            return Err(RegistryError::invalid(format!(
                "collection '{name}' is still a child of {parents:?}"
            )));
        }
        self.db.delete(
            &self.collections,
            &[Predicate::Eq("collection_id".into(), record.key().into())],
        )?;
        tracing::info!(collection = name, kind = %record.collection_type(), "removed collection");
        self.by_name.remove(name);
        self.names_by_key.remove(&record.key());
        self.docs.remove(name);
        Ok(())
    }

    /// Replace the children of a CHAINED collection.
    pub fn set_chain(&mut self, parent: &str, children: &[String]) -> Result<()> {
        let record = self.find(parent)?.clone();
        if record.collection_type() != CollectionType::Chained {
            return Err(RegistryError::invalid(format!(
                "collection '{parent}' has type {}, not CHAINED",
                record.collection_type()
            )));
        }
        let mut child_keys = Vec::with_capacity(children.len());
        let mut seen = BTreeSet::new();
        for child in children {
            if !seen.insert(child.as_str()) {
                return Err(RegistryError::invalid(format!(
                    "collection '{child}' appears more than once in chain '{parent}'"
                )));
            }
            child_keys.push(self.find(child)?.key());
        }
        if let Some(path) = self.path_to(children, parent) {
            let mut names = path;
            names.push(parent.to_string());
            names.sort();
            names.dedup();
            return Err(RegistryError::CollectionCycle { names });
        }

        let filter = [Predicate::Eq("parent".into(), record.key().into())];
        self.db.delete(&self.chains, &filter)?;
        let rows = child_keys
            .iter()
            .enumerate()
            .map(|(position, child)| {
                row([
                    ("parent", Value::from(record.key())),
                    ("position", Value::from(position as i64)),
                    ("child", Value::from(*child)),
                ])
            })
            .collect();
        self.db.insert(&self.chains, rows)?;
        tracing::debug!(collection = parent, children = children.len(), "updated chain");
        if let Some(cached) = self.by_name.get_mut(parent) {
            cached.set_children(children.to_vec());
        }
        Ok(())
    }

    /// Chain of collection names from one of `start` down to `target`, if any.
    fn path_to(&self, start: &[String], target: &str) -> Option<Vec<String>> {
        let mut stack: Vec<(String, Vec<String>)> = start
            .iter()
            .map(|name| (name.clone(), vec![name.clone()]))
            .collect();
        let mut visited = BTreeSet::new();
        while let Some((name, path)) = stack.pop() {
            if name == target {
                return Some(path);
            }
            if !visited.insert(name.clone()) {
                continue;
            }
            if let Some(record) = self.by_name.get(&name) {
                for child in record.children() {
                    let mut next = path.clone();
                    next.push(child.clone());
                    stack.push((child.clone(), next));
                }
            }
        }
        None
    }

    /// Expand CHAINED collections depth-first into the non-chained
    /// collections they resolve to, keeping the first occurrence of each.
    pub fn flatten(&self, names: &[String]) -> Result<Vec<CollectionRecord>> {
        let mut result = Vec::new();
        let mut seen = BTreeSet::new();
        for name in names {
            self.flatten_into(name, &mut result, &mut seen, &mut Vec::new())?;
        }
        Ok(result)
    }

    fn flatten_into(
        &self,
        name: &str,
        out: &mut Vec<CollectionRecord>,
        seen: &mut BTreeSet<String>,
        active: &mut Vec<String>,
    ) -> Result<()> {
        let record = self.find(name)?;
        if record.collection_type() != CollectionType::Chained {
            if seen.insert(name.to_string()) {
                out.push(record.clone());
            }
            return Ok(());
        }
        if active.iter().any(|a| a == name) {
            let mut names = active.clone();
            names.sort();
            return Err(RegistryError::CollectionCycle { names });
        }
        active.push(name.to_string());
        for child in record.children() {
            self.flatten_into(child, out, seen, active)?;
        }
        active.pop();
        Ok(())
    }

    pub fn documentation(&self, name: &str) -> Option<&str> {
        self.docs.get(name).map(String::as_str)
    }

    pub fn update_documentation(&mut self, name: &str, doc: &str) -> Result<()> {
        let key = self.find(name)?.key();
        self.set_documentation(name, key, doc)
    }

    fn set_documentation(&mut self, name: &str, key: i64, doc: &str) -> Result<()> {
        self.db.update(
            &self.collections,
            &[Predicate::Eq("collection_id".into(), key.into())],
            row([("doc", doc)]),
        )?;
        self.docs.insert(name.to_string(), doc.to_string());
        Ok(())
    }

    /// Collections whose names match `pattern` (all when `None`) and whose
    /// type is in `types` (all when empty), sorted by name. With
    /// `flatten_chains`, matching chains are replaced by what they resolve to.
    pub fn query(
        &self,
        pattern: Option<&str>,
        types: &[CollectionType],
        flatten_chains: bool,
    ) -> Result<Vec<CollectionRecord>> {
        let matching: Vec<String> = self
            .by_name
            .keys()
            .filter(|name| pattern.is_none_or(|p| glob_match(p, name)))
            .cloned()
            .collect();
        let mut records = if flatten_chains {
            self.flatten(&matching)?
        } else {
            matching
                .iter()
                .map(|n| self.find(n).cloned())
                .collect::<Result<Vec<_>>>()?
        };
        records.retain(|r| types.is_empty() || types.contains(&r.collection_type()));
        records.sort_by(|a, b| a.name().cmp(b.name()));
        records.dedup_by(|a, b| a.name() == b.name());
        Ok(records)
    }
}

fn lookup_key(names: &BTreeMap<i64, String>, key: i64) -> Result<&String> {
    names.get(&key).ok_or_else(|| {
        RegistryError::Internal(format!("collection key {key} has no collection row"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MemoryDatabase;

    fn manager() -> CollectionManager {
        CollectionManager::initialize(Arc::new(MemoryDatabase::new())).unwrap()
    }

    #[test]
    fn register_is_idempotent_and_type_checked() {
        let mut m = manager();
        let (first, inserted) = m.register("run1", CollectionType::Run, Some("first run")).unwrap();
        assert!(inserted);
        let (second, inserted) = m.register("run1", CollectionType::Run, None).unwrap();
        assert!(!inserted);
        assert_eq!(first, second);
        assert_eq!(m.documentation("run1"), Some("first run"));

        let err = m.register("run1", CollectionType::Tagged, None).unwrap_err();
        assert!(matches!(err, RegistryError::ConflictingDefinition(_)));
    }

    #[test]
    fn chains_survive_refresh_in_order() {
        let mut m = manager();
        m.register("b", CollectionType::Run, None).unwrap();
        m.register("a", CollectionType::Tagged, None).unwrap();
        m.register("chain", CollectionType::Chained, None).unwrap();
        m.set_chain("chain", &["b".to_string(), "a".to_string()]).unwrap();
        m.refresh().unwrap();
        assert_eq!(m.find("chain").unwrap().children(), ["b", "a"]);
        let flat: Vec<String> = m
            .flatten(&["chain".to_string()])
            .unwrap()
            .iter()
            .map(|r| r.name().to_string())
            .collect();
        assert_eq!(flat, ["b", "a"]);
    }

    #[test]
    fn set_chain_rejects_cycles_and_unknown_children() {
        let mut m = manager();
        m.register("A", CollectionType::Chained, None).unwrap();
        m.register("B", CollectionType::Chained, None).unwrap();
        m.set_chain("A", &["B".to_string()]).unwrap();
        match m.set_chain("B", &["A".to_string()]) {
            Err(RegistryError::CollectionCycle { names }) => assert_eq!(names, ["A", "B"]),
            other => panic!("expected cycle, got {other:?}"),
        }
        assert!(matches!(
            m.set_chain("A", &["nope".to_string()]),
            Err(RegistryError::MissingCollection(_))
        ));
        m.register("r", CollectionType::Run, None).unwrap();
        assert!(m.set_chain("r", &[]).is_err());
    }

    #[test]
    fn chained_children_cannot_be_removed() {
        let mut m = manager();
        m.register("r", CollectionType::Run, None).unwrap();
        m.register("c", CollectionType::Chained, None).unwrap();
        m.set_chain("c", &["r".to_string()]).unwrap();
        assert!(m.remove("r").is_err());
        m.remove("c").unwrap();
        m.remove("r").unwrap();
        assert!(m.iter().next().is_none());
    }

    #[test]
    fn query_filters_by_pattern_and_type() {
        let mut m = manager();
        m.register("run/a", CollectionType::Run, None).unwrap();
        m.register("run/b", CollectionType::Run, None).unwrap();
        m.register("tag", CollectionType::Tagged, None).unwrap();
        m.register("chain", CollectionType::Chained, None).unwrap();
        m.set_chain("chain", &["tag".to_string()]).unwrap();

        let names = |records: Vec<CollectionRecord>| -> Vec<String> {
            records.iter().map(|r| r.name().to_string()).collect()
        };
        assert_eq!(names(m.query(Some("run/*"), &[], false).unwrap()), ["run/a", "run/b"]);
        assert_eq!(
            names(m.query(None, &[CollectionType::Chained], false).unwrap()),
            ["chain"]
        );
        assert_eq!(names(m.query(Some("chain"), &[], true).unwrap()), ["tag"]);
    }
}

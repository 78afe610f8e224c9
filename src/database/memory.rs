//! In-process relational engine.
//!
//! Every operation takes the single state lock for its whole duration, which
//! is what makes `sync` an atomic insert-or-verify. The state serializes to
//! JSON so a repository can live in one file between CLI invocations.

use super::{Database, OnDelete, Predicate, Row, Select, Table, TableSpec};
use crate::error::{RegistryError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tempfile::NamedTempFile;

#[derive(Default)]
pub struct MemoryDatabase {
    state: RwLock<State>,
}

#[derive(Clone, Default, Serialize, Deserialize)]
struct State {
    tables: BTreeMap<String, MemTable>,
}

#[derive(Clone, Serialize, Deserialize)]
struct MemTable {
    spec: TableSpec,
    rows: Vec<Row>,
    next_id: i64,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a database previously written by [`MemoryDatabase::save`].
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let state: State = serde_json::from_reader(BufReader::new(file))?;
        tracing::debug!(path = %path.display(), tables = state.tables.len(), "loaded database");
        Ok(Self {
            state: RwLock::new(state),
        })
    }

    /// Atomically replace `path` with the current contents.
    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let tmp = NamedTempFile::new_in(dir)?;
        {
            let mut writer = BufWriter::new(tmp.as_file());
            serde_json::to_writer(&mut writer, &*self.read())?;
            writer.flush()?;
        }
        tmp.persist(path).map_err(|err| RegistryError::Io(err.error))?;
        Ok(())
    }

    /// Names of all tables, sorted.
    pub fn table_names(&self) -> Vec<String> {
        self.read().tables.keys().cloned().collect()
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|err| err.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(|err| err.into_inner())
    }
}

impl Database for MemoryDatabase {
    fn ensure_table_exists(&self, name: &str, spec: &TableSpec) -> Result<Table> {
        let mut state = self.write();
        if let Some(existing) = state.tables.get(name) {
            if &existing.spec != spec {
                return Err(RegistryError::integrity(
                    name,
                    "table already exists with a different definition",
                ));
            }
            return Ok(Table::new(name));
        }
        for fk in &spec.foreign_keys {
            if fk.table != name && !state.tables.contains_key(&fk.table) {
                return Err(RegistryError::integrity(
                    name,
                    format!("foreign key references unknown table '{}'", fk.table),
                ));
            }
        }
        tracing::debug!(table = name, "creating table");
        state.tables.insert(
            name.to_string(),
            MemTable {
                spec: spec.clone(),
                rows: Vec::new(),
                next_id: 1,
            },
        );
        Ok(Table::new(name))
    }

    fn get_existing_table(&self, name: &str, spec: &TableSpec) -> Result<Option<Table>> {
        let state = self.read();
        match state.tables.get(name) {
            None => Ok(None),
            Some(existing) if &existing.spec == spec => Ok(Some(Table::new(name))),
            Some(_) => Err(RegistryError::integrity(
                name,
                "existing table definition does not match the expected one",
            )),
        }
    }

    fn sync(
        &self,
        table: &Table,
        keys: Row,
        compared: Row,
        returning: &[&str],
    ) -> Result<(Row, bool)> {
        let mut state = self.write();
        let existing = table_ref(&state, table)?
            .rows
            .iter()
            .find(|row| keys.iter().all(|(k, v)| row.get(k).unwrap_or(&Value::Null) == v))
            .cloned();
        if let Some(existing) = existing {
            for (column, requested) in &compared {
                let current = existing.get(column).unwrap_or(&Value::Null);
                if current != requested {
                    return Err(RegistryError::SyncConflict {
                        table: table.name().to_string(),
                        column: column.clone(),
                        existing: current.clone(),
                        requested: requested.clone(),
                    });
                }
            }
            return Ok((project(&existing, returning), false));
        }
        let mut new_row = keys;
        new_row.extend(compared);
        let stored = insert_row(&mut state, table.name(), new_row)?;
        Ok((project(&stored, returning), true))
    }

    fn insert(&self, table: &Table, rows: Vec<Row>) -> Result<Vec<Row>> {
        let mut state = self.write();
        let (rollback_len, rollback_id) = {
            let t = table_ref(&state, table)?;
            (t.rows.len(), t.next_id)
        };
        let mut stored = Vec::with_capacity(rows.len());
        for row in rows {
            match insert_row(&mut state, table.name(), row) {
                Ok(r) => stored.push(r),
                Err(err) => {
                    if let Some(t) = state.tables.get_mut(table.name()) {
                        t.rows.truncate(rollback_len);
                        t.next_id = rollback_id;
                    }
                    return Err(err);
                }
            }
        }
        Ok(stored)
    }

    fn query(&self, select: &Select) -> Result<Vec<Row>> {
        let state = self.read();
        let t = table_ref(&state, &select.table)?;
        Ok(t.rows
            .iter()
            .filter(|row| select.filter.iter().all(|p| p.matches(row)))
            .cloned()
            .collect())
    }

    fn update(&self, table: &Table, filter: &[Predicate], values: Row) -> Result<usize> {
        let mut state = self.write();
        let t = table_mut(&mut state, table)?;
        for (column, value) in &values {
            let field = t.spec.field(column).ok_or_else(|| {
                RegistryError::integrity(table.name(), format!("unknown column '{column}'"))
            })?;
            check_value(table.name(), field, value)?;
        }
        let before = t.rows.clone();
        let mut count = 0;
        for row in t.rows.iter_mut() {
            if filter.iter().all(|p| p.matches(row)) {
                row.extend(values.clone());
                count += 1;
            }
        }
        if let Err(err) = check_all_unique(table.name(), t) {
            t.rows = before;
            return Err(err);
        }
        Ok(count)
    }

    fn delete(&self, table: &Table, filter: &[Predicate]) -> Result<usize> {
        let mut state = self.write();
        let initial: BTreeSet<usize> = table_ref(&state, table)?
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| filter.iter().all(|p| p.matches(row)))
            .map(|(idx, _)| idx)
            .collect();
        let count = initial.len();
        if count == 0 {
            return Ok(0);
        }

        // Plan the full cascade before touching anything so a restrict
        // violation anywhere leaves the state unchanged.
        let mut plan: BTreeMap<String, BTreeSet<usize>> = BTreeMap::new();
        plan.insert(table.name().to_string(), initial.clone());
        let mut pending: Vec<(String, usize)> = initial
            .into_iter()
            .map(|idx| (table.name().to_string(), idx))
            .collect();
        let mut restricted: Vec<(String, String, usize)> = Vec::new();
        while let Some((parent, idx)) = pending.pop() {
            let parent_row = state.tables[&parent].rows[idx].clone();
            for (child_name, child) in &state.tables {
                for fk in child.spec.foreign_keys.iter().filter(|fk| fk.table == parent) {
                    let target: Vec<&Value> = fk
                        .target
                        .iter()
                        .map(|c| parent_row.get(c).unwrap_or(&Value::Null))
                        .collect();
                    for (child_idx, child_row) in child.rows.iter().enumerate() {
                        let references = fk
                            .source
                            .iter()
                            .zip(&target)
                            .all(|(c, v)| child_row.get(c).unwrap_or(&Value::Null) == *v);
                        if !references {
                            continue;
                        }
                        match fk.on_delete {
                            OnDelete::Cascade => {
                                if plan.entry(child_name.clone()).or_default().insert(child_idx) {
                                    pending.push((child_name.clone(), child_idx));
                                }
                            }
                            OnDelete::Restrict => {
                                restricted.push((child_name.clone(), parent.clone(), child_idx))
                            }
                        }
                    }
                }
            }
        }
        for (child, parent, idx) in restricted {
            if !plan.get(&child).is_some_and(|rows| rows.contains(&idx)) {
                return Err(RegistryError::integrity(
                    child,
                    format!("row still references a deleted row of '{parent}'"),
                ));
            }
        }

        for (name, indices) in plan {
            if let Some(t) = state.tables.get_mut(&name) {
                let mut idx = 0;
                t.rows.retain(|_| {
                    let keep = !indices.contains(&idx);
                    idx += 1;
                    keep
                });
            }
        }
        Ok(count)
    }
}

fn table_ref<'a>(state: &'a State, table: &Table) -> Result<&'a MemTable> {
    state
        .tables
        .get(table.name())
        .ok_or_else(|| RegistryError::integrity(table.name(), "no such table"))
}

fn table_mut<'a>(state: &'a mut State, table: &Table) -> Result<&'a mut MemTable> {
    state
        .tables
        .get_mut(table.name())
        .ok_or_else(|| RegistryError::integrity(table.name(), "no such table"))
}

fn project(row: &Row, columns: &[&str]) -> Row {
    columns
        .iter()
        .map(|c| (c.to_string(), row.get(*c).cloned().unwrap_or(Value::Null)))
        .collect()
}

fn check_value(table: &str, field: &super::FieldSpec, value: &Value) -> Result<()> {
    if value.is_null() {
        if field.nullable || field.autoincrement {
            return Ok(());
        }
        return Err(RegistryError::integrity(
            table,
            format!("column '{}' may not be null", field.name),
        ));
    }
    if !field.dtype.accepts(value) {
        return Err(RegistryError::integrity(
            table,
            format!("value {value} has the wrong type for column '{}'", field.name),
        ));
    }
    Ok(())
}

fn insert_row(state: &mut State, name: &str, mut row: Row) -> Result<Row> {
    let t = state
        .tables
        .get(name)
        .ok_or_else(|| RegistryError::integrity(name, "no such table"))?;
    if let Some(unknown) = row.keys().find(|k| t.spec.field(k).is_none()) {
        return Err(RegistryError::integrity(
            name,
            format!("unknown column '{unknown}'"),
        ));
    }
    let mut next_id = t.next_id;
    for field in &t.spec.fields {
        let value = row.entry(field.name.clone()).or_insert(Value::Null);
        if field.autoincrement {
            match value.as_i64() {
                Some(explicit) => next_id = next_id.max(explicit + 1),
                None => {
                    *value = Value::from(next_id);
                    next_id += 1;
                }
            }
        }
        check_value(name, field, value)?;
    }

    let mut constraints = t.spec.unique.clone();
    let pk = t.spec.primary_key();
    if !pk.is_empty() {
        constraints.push(pk);
    }
    for columns in &constraints {
        if t.rows.iter().any(|other| same_key(&row, other, columns)) {
            return Err(RegistryError::integrity(
                name,
                format!("unique constraint on ({}) violated", columns.join(", ")),
            ));
        }
    }

    for fk in &t.spec.foreign_keys {
        let source: Vec<&Value> = fk
            .source
            .iter()
            .map(|c| row.get(c).unwrap_or(&Value::Null))
            .collect();
        if source.iter().any(|v| v.is_null()) {
            continue;
        }
        let target = if fk.table == name {
            t
        } else {
            state.tables.get(&fk.table).ok_or_else(|| {
                RegistryError::integrity(name, format!("missing referenced table '{}'", fk.table))
            })?
        };
        let found = target.rows.iter().any(|candidate| {
            fk.target
                .iter()
                .zip(&source)
                .all(|(c, v)| candidate.get(c).unwrap_or(&Value::Null) == *v)
        });
        if !found {
            return Err(RegistryError::integrity(
                name,
                format!(
                    "foreign key ({}) references a missing row in '{}'",
                    fk.source.join(", "),
                    fk.table
                ),
            ));
        }
    }

    let t = state
        .tables
        .get_mut(name)
        .ok_or_else(|| RegistryError::integrity(name, "no such table"))?;
    t.next_id = next_id;
    t.rows.push(row.clone());
    Ok(row)
}

// NULLs never collide, matching SQL unique-constraint semantics.
fn same_key(a: &Row, b: &Row, columns: &[String]) -> bool {
    columns.iter().all(|c| match (a.get(c), b.get(c)) {
        (Some(x), Some(y)) => !x.is_null() && x == y,
        _ => false,
    })
}

fn check_all_unique(name: &str, t: &MemTable) -> Result<()> {
    let mut constraints = t.spec.unique.clone();
    let pk = t.spec.primary_key();
    if !pk.is_empty() {
        constraints.push(pk);
    }
    for columns in &constraints {
        for (i, a) in t.rows.iter().enumerate() {
            if t.rows[i + 1..].iter().any(|b| same_key(a, b, columns)) {
                return Err(RegistryError::integrity(
                    name,
                    format!("unique constraint on ({}) violated", columns.join(", ")),
                ));
            }
        }
    }
    Ok(())
}

//! Entry points behind the `butler` subcommands.
//!
//! Each function opens the repository at `repo`, performs one operation
//! through the registry API and returns something printable. Functions
//! that modify the repository save it before returning.
//!
//! `where` expressions are reduced to `dimension=value` terms joined by
//! commas, whitespace or `AND`, e.g. `instrument=DummyCam AND visit=42`.

use crate::collections::{CollectionRecord, CollectionType, glob_match};
use crate::config::ButlerConfig;
use crate::datasets::{DatasetRef, DatasetType};
use crate::datastore::{Datastore, TransferMode};
use crate::dimensions::{DataCoordinate, DataIdValue, DimensionUniverse, KeyType};
use crate::error::{RegistryError, Result};
use crate::registry::Registry;
use crate::repository::Repository;
use crate::timespan::Timespan;
use crate::transfers::{JsonRepoImportBackend, RepoImportBackend};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::Path;
use std::str::FromStr;

/// Export file read by `import` when none is named.
pub const DEFAULT_EXPORT_FILE: &str = "export.json";

/// Rows of text under a header, printed as aligned columns.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Table {
    header: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new<I, S>(header: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            header: header.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    pub fn push(&mut self, row: Vec<String>) {
        self.rows.push(row);
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut widths: Vec<usize> = self.header.iter().map(|h| h.chars().count()).collect();
        for row in &self.rows {
            for (i, cell) in row.iter().enumerate() {
                let width = cell.chars().count();
                match widths.get_mut(i) {
                    Some(w) => *w = (*w).max(width),
                    None => widths.push(width),
                }
            }
        }
        let line = |cells: &[String]| {
            let padded: Vec<String> = cells
                .iter()
                .zip(&widths)
                .map(|(cell, width)| format!("{cell:<width$}"))
                .collect();
            padded.join(" ").trim_end().to_string()
        };
        writeln!(f, "{}", line(&self.header))?;
        let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
        writeln!(f, "{}", rule.join(" "))?;
        for row in &self.rows {
            writeln!(f, "{}", line(row))?;
        }
        Ok(())
    }
}

/// How `query-collections` presents CHAINED collections.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChainMode {
    /// One row per collection; chains list their children.
    #[default]
    Table,
    /// Children indented beneath their chains.
    Tree,
    /// Chains replaced by the collections they resolve to.
    Flatten,
}

impl FromStr for ChainMode {
    type Err = RegistryError;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_uppercase().as_str() {
            "TABLE" => Ok(ChainMode::Table),
            "TREE" => Ok(ChainMode::Tree),
            "FLATTEN" => Ok(ChainMode::Flatten),
            _ => Err(RegistryError::invalid(format!(
                "unknown chain display mode '{value}'"
            ))),
        }
    }
}

/// Split comma- or whitespace-separated values into a flat list.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .replace(',', " ")
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

fn split_all(values: &[String]) -> Vec<String> {
    values.iter().flat_map(|v| split_list(v)).collect()
}

/// Turn `where` expressions into typed dimension constraints.
pub fn parse_where(
    universe: &DimensionUniverse,
    expressions: &[String],
) -> Result<BTreeMap<String, DataIdValue>> {
    let mut constraints = BTreeMap::new();
    for term in split_all(expressions) {
        if term.eq_ignore_ascii_case("and") {
            continue;
        }
        let (key, raw) = term.split_once('=').ok_or_else(|| {
            RegistryError::invalid(format!("expected dimension=value, found '{term}'"))
        })?;
        let raw = raw.trim_matches(|c| c == '\'' || c == '"');
        let value = match universe.key_type(key)? {
            KeyType::Int => DataIdValue::Int(raw.parse().map_err(|_| {
                RegistryError::invalid(format!("'{key}' takes integer values, not '{raw}'"))
            })?),
            KeyType::String => DataIdValue::Str(raw.to_string()),
        };
        if let Some(previous) = constraints.insert(key.to_string(), value.clone()) {
            if previous != value {
                return Err(RegistryError::invalid(format!(
                    "'{key}' constrained to both {previous} and {value}"
                )));
            }
        }
    }
    Ok(constraints)
}

fn read_json(path: &Path) -> Result<Value> {
    let text = fs::read_to_string(path)?;
    serde_json::from_str(&text)
        .map_err(|err| RegistryError::Config(format!("parsing {}: {err}", path.display())))
}

/// Create an empty repository, optionally seeded with a partial
/// configuration and a replacement dimension configuration.
pub fn create(
    repo: &Path,
    seed_config: Option<&Path>,
    dimension_config: Option<&Path>,
) -> Result<()> {
    let mut seed = match seed_config {
        Some(path) => read_json(path)?,
        None => Value::Object(Default::default()),
    };
    if let Some(path) = dimension_config {
        let dimensions = read_json(path)?;
        match &mut seed {
            Value::Object(map) => {
                map.insert("dimensions".to_string(), dimensions);
            }
            _ => {
                return Err(RegistryError::Config(
                    "seed configuration must be a JSON object".into(),
                ));
            }
        }
    }
    let config = ButlerConfig::with_seed(seed)?;
    Repository::create(repo, config)?;
    Ok(())
}

/// The repository configuration, or the part selected by `subset`, as
/// pretty-printed JSON.
pub fn config_dump(repo: &Path, subset: Option<&str>) -> Result<String> {
    let repository = Repository::open(repo)?;
    let value = repository.registry().config().subset(subset.unwrap_or(""))?;
    let mut text = serde_json::to_string_pretty(&value)?;
    text.push('\n');
    Ok(text)
}

/// Check registered dataset types against the configuration. Returns one
/// message per problem; an empty list means the repository is valid.
///
/// `dataset_types` restricts the check to the named types (all when
/// empty); types matching an `ignore` pattern are skipped.
pub fn config_validate(
    repo: &Path,
    dataset_types: &[String],
    ignore: &[String],
) -> Result<Vec<String>> {
    let repository = Repository::open(repo)?;
    let registry = repository.registry();
    let wanted = split_all(dataset_types);
    let ignore = split_all(ignore);
    let mut problems = Vec::new();
    for dataset_type in registry.query_dataset_types(None) {
        let name = dataset_type.name();
        if !wanted.is_empty() && !wanted.iter().any(|w| w == name) {
            continue;
        }
        if ignore.iter().any(|pattern| glob_match(pattern, name)) {
            continue;
        }
        let storage_class = dataset_type.storage_class().name();
        if !registry.storage_classes().contains(storage_class) {
            problems.push(format!(
                "{name}: storage class '{storage_class}' is not configured"
            ));
            continue;
        }
        match dataset_type.components(registry.storage_classes()) {
            Ok(components) => {
                for component in components {
                    if registry.get_dataset_type(component.name()).is_err() {
                        problems.push(format!(
                            "{name}: component '{}' is not registered",
                            component.name()
                        ));
                    }
                }
            }
            Err(err) => problems.push(format!("{name}: {err}")),
        }
    }
    for wanted_name in &wanted {
        if registry.get_dataset_type(wanted_name).is_err() {
            problems.push(format!("{wanted_name}: no such dataset type"));
        }
    }
    tracing::debug!(problems = problems.len(), "validated configuration");
    Ok(problems)
}

/// Load an export file (by default `export.json` in `directory`) into the
/// repository.
pub fn import(
    repo: &Path,
    directory: &Path,
    export_file: Option<&Path>,
    transfer: Option<TransferMode>,
    skip_dimensions: &[String],
) -> Result<()> {
    let mut repository = Repository::open(repo)?;
    let path = match export_file {
        Some(path) => path.to_path_buf(),
        None => directory.join(DEFAULT_EXPORT_FILE),
    };
    let backend = JsonRepoImportBackend::from_reader(BufReader::new(File::open(&path)?))?;
    let transfer = match transfer {
        Some(mode) => Some(mode),
        None => repository
            .registry()
            .config()
            .datastore
            .transfer
            .as_deref()
            .map(str::parse)
            .transpose()?,
    };
    let skip: BTreeSet<String> = split_all(skip_dimensions).into_iter().collect();

    backend.register(repository.registry_mut())?;
    let registry = repository.registry();
    let datastore = registry.datastore();
    backend.load(
        registry,
        Some(datastore.as_ref() as &dyn Datastore),
        Some(directory),
        transfer,
        &skip,
    )?;
    repository.save()?;
    tracing::info!(file = %path.display(), "imported export file");
    Ok(())
}

/// Remove a collection. RUN collections take their datasets with them and
/// need both `purge` and `unstore`; `purge` is refused for anything else.
/// With `unstore`, datastore records of datasets reachable from a
/// non-RUN collection are dropped as well.
pub fn prune_collection(repo: &Path, collection: &str, purge: bool, unstore: bool) -> Result<()> {
    let mut repository = Repository::open(repo)?;
    let collection_type = repository.registry().get_collection_type(collection)?;
    if collection_type == CollectionType::Run {
        if !(purge && unstore) {
            return Err(RegistryError::invalid(format!(
                "removing RUN collection '{collection}' deletes its datasets; \
                 pass --purge and --unstore"
            )));
        }
    } else if purge {
        return Err(RegistryError::invalid(format!(
            "--purge only applies to RUN collections; '{collection}' is {collection_type}"
        )));
    } else if unstore {
        let registry = repository.registry();
        let names = vec![collection.to_string()];
        let mut ids = BTreeSet::new();
        for dataset_type in registry.query_dataset_types(None) {
            for dataset in registry.query_datasets(dataset_type.name(), &names)? {
                ids.extend(dataset.id());
            }
        }
        let ids: Vec<_> = ids.into_iter().collect();
        registry.datastore().forget(&ids)?;
    }
    repository.registry_mut().remove_collection(collection)?;
    repository.save()
}

fn matching_collections(
    registry: &Registry,
    globs: &[String],
    types: &[CollectionType],
    flatten: bool,
) -> Result<Vec<CollectionRecord>> {
    let globs = split_all(globs);
    if globs.is_empty() {
        return registry.query_collections(None, types, flatten);
    }
    let mut found = BTreeMap::new();
    for glob in &globs {
        for record in registry.query_collections(Some(glob), types, flatten)? {
            found.insert(record.name().to_string(), record);
        }
    }
    Ok(found.into_values().collect())
}

pub fn query_collections(
    repo: &Path,
    globs: &[String],
    types: &[CollectionType],
    chains: ChainMode,
) -> Result<Table> {
    let repository = Repository::open(repo)?;
    let registry = repository.registry();
    match chains {
        ChainMode::Table => {
            let mut table = Table::new(["Name", "Type", "Definition"]);
            for record in matching_collections(registry, globs, types, false)? {
                table.push(vec![
                    record.name().to_string(),
                    record.collection_type().to_string(),
                    record.children().join(", "),
                ]);
            }
            Ok(table)
        }
        ChainMode::Tree => {
            let mut table = Table::new(["Name", "Type"]);
            for record in matching_collections(registry, globs, types, false)? {
                push_tree(registry, &record, 0, &mut table)?;
            }
            Ok(table)
        }
        ChainMode::Flatten => {
            let mut table = Table::new(["Name", "Type"]);
            for record in matching_collections(registry, globs, types, true)? {
                table.push(vec![
                    record.name().to_string(),
                    record.collection_type().to_string(),
                ]);
            }
            Ok(table)
        }
    }
}

fn push_tree(
    registry: &Registry,
    record: &CollectionRecord,
    depth: usize,
    table: &mut Table,
) -> Result<()> {
    table.push(vec![
        format!("{}{}", "  ".repeat(depth), record.name()),
        record.collection_type().to_string(),
    ]);
    for child in record.children() {
        let child = registry.collections().find(child)?;
        push_tree(registry, child, depth + 1, table)?;
    }
    Ok(())
}

fn matching_dataset_types(registry: &Registry, globs: &[String]) -> Vec<DatasetType> {
    let globs = split_all(globs);
    registry
        .query_dataset_types(None)
        .into_iter()
        .filter(|t| globs.is_empty() || globs.iter().any(|g| glob_match(g, t.name())))
        .collect()
}

/// Registered dataset types; component types only with `components`.
pub fn query_dataset_types(
    repo: &Path,
    globs: &[String],
    verbose: bool,
    components: bool,
) -> Result<Table> {
    let repository = Repository::open(repo)?;
    let mut table = if verbose {
        Table::new(["name", "dimensions", "storage class"])
    } else {
        Table::new(["name"])
    };
    for dataset_type in matching_dataset_types(repository.registry(), globs) {
        if dataset_type.is_component() && !components {
            continue;
        }
        let mut row = vec![dataset_type.name().to_string()];
        if verbose {
            row.push(dataset_type.dimensions().to_string());
            row.push(dataset_type.storage_class().name().to_string());
        }
        table.push(row);
    }
    Ok(table)
}

pub fn remove_dataset_type(repo: &Path, name: &str) -> Result<()> {
    let mut repository = Repository::open(repo)?;
    repository.registry_mut().remove_dataset_type(name)?;
    repository.save()
}

/// Collections named by `expressions` in search order: literal names stay
/// where they are, glob patterns expand to their sorted matches. No
/// expressions means every collection.
fn search_path(registry: &Registry, expressions: &[String]) -> Result<Vec<String>> {
    let expressions = split_all(expressions);
    if expressions.is_empty() {
        return Ok(registry
            .query_collections(None, &[], false)?
            .iter()
            .map(|r| r.name().to_string())
            .collect());
    }
    let mut names = Vec::new();
    for expression in expressions {
        if expression.contains(['*', '?']) {
            for record in registry.query_collections(Some(&expression), &[], false)? {
                names.push(record.name().to_string());
            }
        } else {
            names.push(expression);
        }
    }
    let mut seen = BTreeSet::new();
    names.retain(|n| seen.insert(n.clone()));
    Ok(names)
}

/// Whether an expanded data ID agrees with every constraint it can see.
fn satisfies(data_id: &DataCoordinate, constraints: &BTreeMap<String, DataIdValue>) -> bool {
    constraints
        .iter()
        .all(|(dim, value)| data_id.get(dim).is_none_or(|v| v == value))
}

fn filter_refs(
    registry: &Registry,
    refs: Vec<DatasetRef>,
    constraints: &BTreeMap<String, DataIdValue>,
) -> Result<Vec<DatasetRef>> {
    if constraints.is_empty() {
        return Ok(refs);
    }
    let mut kept = Vec::new();
    for dataset in refs {
        if satisfies(&registry.expand_data_id(dataset.data_id())?, constraints) {
            kept.push(dataset);
        }
    }
    Ok(kept)
}

/// Options shared by the dataset-selecting commands.
#[derive(Clone, Debug, Default)]
pub struct DatasetQuery {
    pub dataset_types: Vec<String>,
    pub collections: Vec<String>,
    pub where_: Vec<String>,
    pub find_first: bool,
}

fn select_datasets(registry: &Registry, query: &DatasetQuery) -> Result<Vec<DatasetRef>> {
    let constraints = parse_where(registry.universe(), &query.where_)?;
    let collections = search_path(registry, &query.collections)?;
    if query.find_first && split_all(&query.collections).iter().any(|c| c.contains(['*', '?'])) {
        return Err(RegistryError::invalid(
            "--find-first needs an ordered list of collections, not patterns",
        ));
    }
    let mut selected = Vec::new();
    for dataset_type in matching_dataset_types(registry, &query.dataset_types) {
        let refs = if query.find_first {
            let mut first: BTreeMap<DataCoordinate, DatasetRef> = BTreeMap::new();
            for record in registry.collections().flatten(&collections)? {
                let path = vec![record.name().to_string()];
                for dataset in registry.query_datasets(dataset_type.name(), &path)? {
                    first.entry(dataset.data_id().clone()).or_insert(dataset);
                }
            }
            first.into_values().collect()
        } else {
            registry.query_datasets(dataset_type.name(), &collections)?
        };
        selected.extend(filter_refs(registry, refs, &constraints)?);
    }
    Ok(selected)
}

/// Datasets matching the query, one table per dataset type.
pub fn query_datasets(repo: &Path, query: &DatasetQuery, show_uri: bool) -> Result<Vec<Table>> {
    let repository = Repository::open(repo)?;
    let registry = repository.registry();
    let datastore = registry.datastore();
    let mut by_type: BTreeMap<String, Vec<DatasetRef>> = BTreeMap::new();
    for dataset in select_datasets(registry, query)? {
        by_type
            .entry(dataset.dataset_type().name().to_string())
            .or_default()
            .push(dataset);
    }
    let mut tables = Vec::new();
    for (name, refs) in by_type {
        let dimensions: Vec<String> = registry
            .get_dataset_type(&name)?
            .dimensions()
            .required()
            .to_vec();
        let mut header = vec!["type".to_string(), "run".to_string(), "id".to_string()];
        header.extend(dimensions.iter().cloned());
        if show_uri {
            header.push("URI".to_string());
        }
        let mut table = Table::new(header);
        for dataset in refs {
            let (id, run) = dataset.require_resolved()?;
            let mut row = vec![name.clone(), run.to_string(), id.to_string()];
            for dim in &dimensions {
                row.push(dataset.data_id().get(dim).map(ToString::to_string).unwrap_or_default());
            }
            if show_uri {
                row.push(datastore.location(id)?.map(|(path, _)| path).unwrap_or_default());
            }
            table.push(row);
        }
        tables.push(table);
    }
    Ok(tables)
}

/// Certify datasets of one type found in `input_collection` into the
/// CALIBRATION collection `output_collection`, creating it if needed.
///
/// Unless `search_all_inputs` is set, a CHAINED input is narrowed to its
/// first child. Unbounded ends are written as `None`.
pub fn certify_calibrations(
    repo: &Path,
    input_collection: &str,
    output_collection: &str,
    dataset_type: &str,
    begin: Option<&str>,
    end: Option<&str>,
    search_all_inputs: bool,
) -> Result<usize> {
    let mut repository = Repository::open(repo)?;
    let timespan = Timespan::new(
        begin.map(Timespan::parse_bound).transpose()?.flatten(),
        end.map(Timespan::parse_bound).transpose()?.flatten(),
    )?;
    let registry = repository.registry();
    let mut input = input_collection.to_string();
    if !search_all_inputs && registry.get_collection_type(&input)? == CollectionType::Chained {
        if let Some(first) = registry.get_collection_chain(&input)?.into_iter().next() {
            input = first;
        }
    }
    let refs = registry.query_datasets(dataset_type, &[input.clone()])?;
    if refs.is_empty() {
        return Err(RegistryError::invalid(format!(
            "no inputs found for dataset type '{dataset_type}' in {input}"
        )));
    }
    repository
        .registry_mut()
        .register_collection(output_collection, CollectionType::Calibration, None)?;
    repository
        .registry()
        .certify(output_collection, &refs, timespan)?;
    repository.save()?;
    Ok(refs.len())
}

/// Data IDs over `dimensions` supported by dimension records. With
/// `datasets`, only data IDs of existing datasets of those types (in
/// `collections`) are kept.
pub fn query_data_ids(
    repo: &Path,
    dimensions: &[String],
    datasets: &[String],
    collections: &[String],
    where_: &[String],
) -> Result<Table> {
    let repository = Repository::open(repo)?;
    let registry = repository.registry();
    let dimensions = split_all(dimensions);
    let names: Vec<&str> = dimensions.iter().map(String::as_str).collect();
    let constraints = parse_where(registry.universe(), where_)?;
    let graph = registry.universe().extract(names.iter().copied())?;
    let mut data_ids = registry.query_data_ids(&names, &constraints)?;

    if !split_all(datasets).is_empty() {
        let query = DatasetQuery {
            dataset_types: datasets.to_vec(),
            collections: collections.to_vec(),
            ..DatasetQuery::default()
        };
        let found: Vec<DatasetRef> = select_datasets(registry, &query)?;
        data_ids.retain(|data_id| {
            found.iter().any(|dataset| {
                dataset
                    .data_id()
                    .values()
                    .iter()
                    .all(|(dim, value)| data_id.get(dim).is_none_or(|v| v == value))
            })
        });
    }

    let mut table = Table::new(graph.required().iter().cloned());
    for data_id in data_ids {
        table.push(
            graph
                .required()
                .iter()
                .map(|dim| data_id.get(dim).map(ToString::to_string).unwrap_or_default())
                .collect(),
        );
    }
    Ok(table)
}

fn cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Records of one dimension element matching `where_`.
pub fn query_dimension_records(repo: &Path, element: &str, where_: &[String]) -> Result<Table> {
    let repository = Repository::open(repo)?;
    let registry = repository.registry();
    let element = registry.universe().get(element)?.clone();
    let constraints = parse_where(registry.universe(), where_)?;

    let mut columns: Vec<String> = element.required().to_vec();
    columns.push(element.primary_key().name.clone());
    columns.extend(element.unique_keys().iter().map(|k| k.name.clone()));
    columns.extend(element.implied().iter().cloned());
    columns.extend(element.metadata().iter().map(|m| m.name.clone()));

    let mut table = Table::new(columns.iter().cloned());
    for record in registry.query_dimension_records(&element, &constraints)? {
        table.push(
            columns
                .iter()
                .map(|c| record.get(c).map(cell).unwrap_or_default())
                .collect(),
        );
    }
    Ok(table)
}

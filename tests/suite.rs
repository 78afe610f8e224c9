// Integration suite for the registry: export/import round trips, export
// determinism, collection chains, cache refresh and the `butler` binary.
mod support;

use anyhow::{Context, Result};
use butler_registry::collections::sort_collections;
use butler_registry::database::MemoryDatabase;
use butler_registry::datastore::Datastore;
use butler_registry::testing::{DatastoreMock, MOCK_PATH, add_data_id_value};
use butler_registry::{
    ButlerConfig, CollectionType, DataCoordinate, DataIdValue, DatasetRef, ElementRef,
    FileDataset, JsonRepoExportBackend, JsonRepoImportBackend, Registry, RegistryError,
    RepoExportContext, RepoImportBackend, Repository, Timespan,
};
use butler_registry::transfers::PathRewrite;
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::process::Command;
use std::sync::Arc;
use support::{
    add_calexps, butler_binary, export_with_mock, import_text, populated_registry, run_command,
    visit_detector,
};
use tempfile::TempDir;

fn entries_of_type<'a>(document: &'a Value, kind: &str) -> Vec<&'a Value> {
    document["data"]
        .as_array()
        .map(|data| data.iter().filter(|e| e["type"] == kind).collect())
        .unwrap_or_default()
}

fn detector_id(registry: &Registry, detector: i64) -> Result<DataCoordinate> {
    Ok(DataCoordinate::from_pairs(
        registry.universe(),
        [
            ("instrument", DataIdValue::from(support::INSTRUMENT)),
            ("detector", DataIdValue::from(detector)),
        ],
    )?)
}

// Exporting three calexps from one run and importing them elsewhere yields
// the same datasets under the same run, with no duplicate dataset types.
#[test]
fn export_import_round_trip() -> Result<()> {
    let mut source = populated_registry()?;
    let refs = add_calexps(&mut source, "r1")?;
    let text = export_with_mock(&source, &refs, &[])?;

    let document: Value = serde_json::from_str(&text)?;
    assert_eq!(entries_of_type(&document, "dataset_type").len(), 1);
    let collections = entries_of_type(&document, "collection");
    assert_eq!(collections.len(), 1);
    assert_eq!(collections[0]["name"], "r1");
    assert_eq!(collections[0]["collection_type"], "RUN");

    let mut target = Registry::in_memory(ButlerConfig::default_config())?;
    let datastore = DatastoreMock::new();
    import_text(&mut target, &text, Some(&datastore as &dyn Datastore))?;

    let imported = target.query_datasets("calexp", &["r1".to_string()])?;
    assert_eq!(imported.len(), 3);
    let expected: BTreeSet<_> = refs.iter().map(|r| r.data_id().clone()).collect();
    let found: BTreeSet<_> = imported.iter().map(|r| r.data_id().clone()).collect();
    assert_eq!(found, expected);
    assert!(imported.iter().all(|r| r.run() == Some("r1")));
    assert_eq!(
        target.get_dataset_type("calexp")?,
        source.get_dataset_type("calexp")?
    );
    assert_eq!(
        target.query_dataset_types(None).len(),
        source.query_dataset_types(None).len()
    );

    let ingested = datastore.ingested();
    assert_eq!(ingested.len(), 3);
    assert!(ingested.iter().all(|f| f.path == MOCK_PATH));
    Ok(())
}

// Replaying the registration half of an import twice changes nothing, and
// dimension records arrive once.
#[test]
fn repeated_import_registration_is_idempotent() -> Result<()> {
    let mut source = populated_registry()?;
    let refs = add_calexps(&mut source, "r1")?;
    let text = export_with_mock(&source, &refs, &[])?;

    let mut target = Registry::in_memory(ButlerConfig::default_config())?;
    import_text(&mut target, &text, None)?;
    assert_eq!(target.query_dimension_records("visit", &BTreeMap::new())?.len(), 1);
    assert_eq!(target.query_dimension_records("detector", &BTreeMap::new())?.len(), 3);

    let types = target.query_dataset_types(None);
    let import = JsonRepoImportBackend::from_reader(text.as_bytes())?;
    import.register(&mut target)?;
    assert_eq!(target.query_dataset_types(None), types);
    assert_eq!(target.query_collections(None, &[], false)?.len(), 1);
    Ok(())
}

// Two sessions given the same refs and collections in different orders
// write byte-identical documents.
#[test]
fn export_is_deterministic() -> Result<()> {
    let mut registry = populated_registry()?;
    let mut refs = add_calexps(&mut registry, "r1")?;
    registry.register_collection("tagged", CollectionType::Tagged, Some("picked by hand"))?;
    registry.associate("tagged", &refs[..2])?;
    registry.register_collection("chain", CollectionType::Chained, None)?;
    registry.set_collection_chain("chain", &["tagged".to_string(), "r1".to_string()])?;

    let first = export_with_mock(&registry, &refs, &["chain", "tagged", "r1"])?;
    refs.reverse();
    let second = export_with_mock(&registry, &refs, &["r1", "tagged", "chain"])?;
    assert_eq!(first, second);

    let document: Value = serde_json::from_str(&first)?;
    let names: Vec<&str> = entries_of_type(&document, "collection")
        .iter()
        .filter_map(|c| c["name"].as_str())
        .collect();
    assert_eq!(names, vec!["r1", "tagged", "chain"]);
    Ok(())
}

// Saving overlapping ref sets in several calls exports the same closure as
// saving their union once.
#[test]
fn save_datasets_is_idempotent() -> Result<()> {
    let mut registry = populated_registry()?;
    let refs = add_calexps(&mut registry, "r1")?;
    let datastore = DatastoreMock::new();

    let union = support::export_text(&registry, &datastore, &refs, &[])?;

    let backend = JsonRepoExportBackend::new(Vec::new()).with_description("test export");
    let mut context = RepoExportContext::new(&registry, &datastore, backend, None, None);
    context.save_datasets(&refs[..2], &[], None)?;
    context.save_datasets(&refs[1..], &[], None)?;
    context.save_datasets(&refs, &[], None)?;
    let pieces = String::from_utf8(context.finish()?.into_inner())?;

    assert_eq!(union, pieces);
    Ok(())
}

// Unresolved refs cannot be exported.
#[test]
fn exporting_unresolved_refs_fails() -> Result<()> {
    let mut registry = populated_registry()?;
    let refs = add_calexps(&mut registry, "r1")?;
    let unresolved: Vec<DatasetRef> = refs.iter().map(DatasetRef::unresolve).collect();
    let err = export_with_mock(&registry, &unresolved, &[]).unwrap_err();
    let err = err.downcast::<RegistryError>()?;
    assert!(matches!(err, RegistryError::InvalidArgument(_)), "{err}");
    Ok(())
}

fn detector_fields(detector: i64, full_name: &str) -> BTreeMap<String, Value> {
    BTreeMap::from([
        ("instrument".to_string(), json!(support::INSTRUMENT)),
        ("id".to_string(), json!(detector)),
        ("full_name".to_string(), json!(full_name)),
    ])
}

fn dimension_sections(document: &Value) -> BTreeMap<String, Vec<Value>> {
    entries_of_type(document, "dimension")
        .into_iter()
        .map(|e| {
            let records = e["records"].as_array().cloned().unwrap_or_default();
            (e["element"].as_str().unwrap_or_default().to_string(), records)
        })
        .collect()
}

// The first record saved for a data ID is the one exported.
#[test]
fn dimension_data_keeps_first_record() -> Result<()> {
    let registry = populated_registry()?;
    let datastore = DatastoreMock::new();
    let backend = JsonRepoExportBackend::new(Vec::new());
    let mut context = RepoExportContext::new(&registry, &datastore, backend, None, None);
    context.save_dimension_data("detector", [detector_fields(9, "first")])?;
    context.save_dimension_data("detector", [detector_fields(9, "second")])?;
    let text = String::from_utf8(context.finish()?.into_inner())?;

    let sections = dimension_sections(&serde_json::from_str(&text)?);
    assert_eq!(sections.keys().collect::<Vec<_>>(), ["detector"]);
    assert_eq!(sections["detector"].len(), 1);
    assert_eq!(sections["detector"][0]["id"], 9);
    assert_eq!(sections["detector"][0]["full_name"], "first");
    Ok(())
}

// A record of the wrong element is rejected, and neither it nor an empty
// save leaves anything behind in the export.
#[test]
fn rejected_dimension_data_leaves_no_section() -> Result<()> {
    let mut registry = populated_registry()?;
    let refs = add_calexps(&mut registry, "r1")?;
    let datastore = DatastoreMock::new();
    let detector = registry.universe().get("detector")?;
    let record = registry
        .universe()
        .make_record(detector, detector_fields(9, "first"))?;

    let backend = JsonRepoExportBackend::new(Vec::new()).with_description("test export");
    let mut context = RepoExportContext::new(&registry, &datastore, backend, None, None);
    let err = context
        .save_dimension_data("visit", [record])
        .unwrap_err();
    assert!(matches!(err, RegistryError::InvalidArgument(_)), "{err}");
    assert!(err.to_string().contains("definition=detector"), "{err}");
    context.save_dimension_data("visit", Vec::<BTreeMap<String, Value>>::new())?;
    context.save_datasets(&refs, &[], None)?;
    let text = String::from_utf8(context.finish()?.into_inner())?;

    assert_eq!(text, support::export_text(&registry, &datastore, &refs, &[])?);
    let sections = dimension_sections(&serde_json::from_str(&text)?);
    assert!(sections.values().all(|records| !records.is_empty()));
    assert!(
        sections["detector"].iter().all(|r| r["id"] != 9),
        "rejected record was exported"
    );
    Ok(())
}

// Restricting elements exports only those records for the saved datasets.
#[test]
fn element_filter_limits_dimension_records() -> Result<()> {
    let mut registry = populated_registry()?;
    let refs = add_calexps(&mut registry, "r1")?;
    let datastore = DatastoreMock::new();

    let backend = JsonRepoExportBackend::new(Vec::new());
    let mut context = RepoExportContext::new(&registry, &datastore, backend, None, None);
    context.save_datasets(&refs, &[ElementRef::from("detector")], None)?;
    let text = String::from_utf8(context.finish()?.into_inner())?;
    let sections = dimension_sections(&serde_json::from_str(&text)?);
    assert_eq!(sections.keys().collect::<Vec<_>>(), ["detector"]);
    assert_eq!(sections["detector"].len(), 3);

    let backend = JsonRepoExportBackend::new(Vec::new());
    let mut context = RepoExportContext::new(&registry, &datastore, backend, None, None);
    let data_ids = vec![visit_detector(&registry, 2, 1)?];
    context.save_data_ids(&data_ids, &[ElementRef::from("visit")])?;
    let text = String::from_utf8(context.finish()?.into_inner())?;
    let sections = dimension_sections(&serde_json::from_str(&text)?);
    assert_eq!(sections.keys().collect::<Vec<_>>(), ["visit"]);
    assert_eq!(sections["visit"][0]["id"], 2);
    Ok(())
}

// The rewrite hook sees every file before it is filed for export.
#[test]
fn rewrite_changes_exported_paths() -> Result<()> {
    let mut registry = populated_registry()?;
    let refs = add_calexps(&mut registry, "r1")?;
    let datastore = DatastoreMock::new();
    let rewrite = |mut file: FileDataset| {
        file.path = format!("moved/{}", file.path);
        file
    };

    let backend = JsonRepoExportBackend::new(Vec::new());
    let mut context = RepoExportContext::new(&registry, &datastore, backend, None, None);
    context.save_datasets(&refs, &[], Some(&rewrite as &PathRewrite))?;
    let text = String::from_utf8(context.finish()?.into_inner())?;

    let document: Value = serde_json::from_str(&text)?;
    let datasets = entries_of_type(&document, "dataset");
    assert_eq!(datasets.len(), 1);
    let paths: Vec<&Value> = datasets[0]["records"]
        .as_array()
        .context("dataset records")?
        .iter()
        .map(|r| &r["path"])
        .collect();
    assert_eq!(paths.len(), 3);
    let expected = format!("moved/{MOCK_PATH}");
    assert!(paths.iter().all(|p| *p == expected.as_str()), "{paths:?}");
    Ok(())
}

// Associations only reach the export for collections saved explicitly.
#[test]
fn associations_are_scoped_to_saved_collections() -> Result<()> {
    let mut registry = populated_registry()?;
    let refs = add_calexps(&mut registry, "r1")?;
    registry.register_collection("tagged", CollectionType::Tagged, None)?;
    registry.associate("tagged", &refs)?;

    let without = export_with_mock(&registry, &refs, &[])?;
    let document: Value = serde_json::from_str(&without)?;
    assert!(entries_of_type(&document, "associations").is_empty());
    assert!(!without.contains("\"tagged\""));

    let with = export_with_mock(&registry, &refs[..1], &["tagged"])?;
    let document: Value = serde_json::from_str(&with)?;
    let associations = entries_of_type(&document, "associations");
    assert_eq!(associations.len(), 1);
    assert_eq!(associations[0]["collection"], "tagged");
    // Only the one exported dataset is listed.
    assert_eq!(associations[0]["dataset_ids"], json!([refs[0].id()]));
    Ok(())
}

// CALIBRATION memberships keep their validity ranges through a round trip.
#[test]
fn calibration_validity_ranges_round_trip() -> Result<()> {
    let mut registry = populated_registry()?;
    let flat = registry.make_dataset_type("flat", &["instrument", "detector"], "ImageF", true)?;
    registry.register_dataset_type(&flat)?;
    registry.register_run("calib/raw", None)?;
    let data_ids = (1..=2)
        .map(|detector| detector_id(&registry, detector))
        .collect::<Result<Vec<_>>>()?;
    let refs = registry.insert_datasets("flat", &data_ids, "calib/raw")?;
    registry.register_collection("calib", CollectionType::Calibration, None)?;
    let timespan = Timespan::new(
        Timespan::parse_bound("2020-01-01T00:00:00Z")?,
        Timespan::parse_bound("2021-01-01T00:00:00Z")?,
    )?;
    registry.certify("calib", &refs, timespan)?;

    let text = export_with_mock(&registry, &refs, &["calib"])?;
    let mut target = Registry::in_memory(ButlerConfig::default_config())?;
    import_text(&mut target, &text, None)?;

    let associations =
        target.query_dataset_associations("flat", &["calib".to_string()], &[], false)?;
    assert_eq!(associations.len(), 2);
    assert!(associations.iter().all(|a| a.timespan == Some(timespan)));

    let found = target.find_dataset(
        "flat",
        &data_ids[0],
        &["calib".to_string()],
        Some(&Timespan::new(
            Timespan::parse_bound("2020-06-01T00:00:00Z")?,
            Timespan::parse_bound("2020-06-02T00:00:00Z")?,
        )?),
    )?;
    assert!(found.is_some());
    Ok(())
}

// A chain that would close a loop is rejected and names the collections
// involved; sorting accepts any acyclic set.
#[test]
fn chain_cycles_are_rejected() -> Result<()> {
    let mut registry = Registry::in_memory(ButlerConfig::default_config())?;
    registry.register_collection("A", CollectionType::Chained, None)?;
    registry.register_collection("B", CollectionType::Chained, None)?;
    registry.register_run("run", None)?;
    registry.set_collection_chain("A", &["B".to_string()])?;
    registry.set_collection_chain("B", &["run".to_string()])?;

    let err = registry
        .set_collection_chain("B", &["A".to_string()])
        .unwrap_err();
    match err {
        RegistryError::CollectionCycle { names } => {
            assert!(names.contains(&"A".to_string()) && names.contains(&"B".to_string()));
        }
        other => panic!("expected a cycle error, got {other}"),
    }
    assert_eq!(registry.get_collection_chain("B")?, vec!["run".to_string()]);

    let records: Vec<_> = registry.query_collections(None, &[], false)?;
    let sorted = sort_collections(records.iter())?;
    let names: Vec<&str> = sorted.iter().map(|r| r.name()).collect();
    assert_eq!(names, vec!["run", "B", "A"]);
    Ok(())
}

// A registry that has not seen a dataset type yet resolves datasets of that
// type by refreshing its cache once.
#[test]
fn get_dataset_refreshes_stale_caches() -> Result<()> {
    let db = Arc::new(MemoryDatabase::new());
    let config = ButlerConfig::default_config();
    let mut writer = Registry::new(db.clone(), config.clone())?;
    add_data_id_value(&writer, "instrument", json!(support::INSTRUMENT), &BTreeMap::new())?;
    add_data_id_value(&writer, "physical_filter", json!("d-r"), &BTreeMap::new())?;
    add_data_id_value(&writer, "visit", json!(1), &BTreeMap::new())?;
    for detector in 1..=3 {
        add_data_id_value(&writer, "detector", json!(detector), &BTreeMap::new())?;
    }
    writer.register_run("r1", None)?;

    let mut reader = Registry::new(db, config)?;
    let refs = add_calexps(&mut writer, "r1")?;
    assert!(reader.dataset_types().find("calexp").is_none());

    let id = refs[0].id().context("inserted refs are resolved")?;
    let found = reader.get_dataset(id)?.context("dataset should resolve")?;
    assert_eq!(found, refs[0]);
    assert!(reader.dataset_types().find("calexp").is_some());
    assert!(reader.get_dataset(id + 1000)?.is_none());
    Ok(())
}

// Removing a RUN removes its datasets; other collections keep theirs.
#[test]
fn removing_a_run_removes_its_datasets() -> Result<()> {
    let mut registry = populated_registry()?;
    add_calexps(&mut registry, "r1")?;
    registry.register_run("r2", None)?;
    let data_id = visit_detector(&registry, 2, 1)?;
    registry.insert_datasets("calexp", &[data_id], "r2")?;

    registry.remove_collection("r1")?;
    assert!(registry.get_collection_type("r1").is_err());
    let remaining = registry.query_datasets("calexp", &["r2".to_string()])?;
    assert_eq!(remaining.len(), 1);
    assert!(registry.remove_dataset_type("calexp").is_err());
    registry.remove_collection("r2")?;
    registry.remove_dataset_type("calexp")?;
    assert!(registry.get_dataset_type("calexp").is_err());
    Ok(())
}

fn butler(args: &[&str]) -> Result<String> {
    let mut cmd = Command::new(butler_binary());
    cmd.args(args).env_remove("RUST_LOG");
    let output = run_command(cmd)?;
    Ok(String::from_utf8(output.stdout)?)
}

// Drives the binary: create a repository, import an export file, query it,
// certify calibrations and prune collections.
#[test]
fn butler_cli_round_trip() -> Result<()> {
    let temp = TempDir::new()?;
    let source_root = temp.path().join("source");
    let target_root = temp.path().join("target");
    let export_dir = temp.path().join("export");
    std::fs::create_dir_all(&export_dir)?;

    {
        let mut repo = Repository::create(&source_root, ButlerConfig::default_config())?;
        let registry = repo.registry_mut();
        add_data_id_value(registry, "instrument", json!(support::INSTRUMENT), &BTreeMap::new())?;
        add_data_id_value(registry, "physical_filter", json!("d-r"), &BTreeMap::new())?;
        add_data_id_value(registry, "visit", json!(1), &BTreeMap::new())?;
        for detector in 1..=3 {
            add_data_id_value(registry, "detector", json!(detector), &BTreeMap::new())?;
        }
        let mut refs = add_calexps(registry, "r1")?;
        let flat = registry.make_dataset_type("flat", &["instrument", "detector"], "ImageF", true)?;
        registry.register_dataset_type(&flat)?;
        let flats = (1..=3)
            .map(|detector| detector_id(registry, detector))
            .collect::<Result<Vec<_>>>()?;
        refs.extend(registry.insert_datasets("flat", &flats, "r1")?);
        let datastore = registry.datastore();
        for dataset in &refs {
            let (id, _) = dataset.require_resolved()?;
            let name = dataset.dataset_type().name();
            datastore.put(dataset, &format!("{name}/{id}.fits"), None)?;
        }
        let text = support::export_text(registry, datastore.as_ref(), &refs, &[])?;
        std::fs::write(export_dir.join("export.json"), text)?;
        repo.save()?;
    }

    butler(&["create", target_root.to_str().context("utf-8 path")?])?;
    let target = target_root.to_str().context("utf-8 path")?;
    let export = export_dir.to_str().context("utf-8 path")?;
    butler(&["import", target, export])?;

    let types = butler(&["query-dataset-types", target, "--verbose"])?;
    assert!(types.contains("calexp"), "{types}");
    assert!(!types.contains("calexp.wcs"), "{types}");

    let datasets = butler(&[
        "query-datasets",
        target,
        "calexp",
        "--collections",
        "r1",
        "--where",
        "detector=2",
        "--show-uri",
    ])?;
    let rows: Vec<&str> = datasets.lines().skip(2).collect();
    assert_eq!(rows.len(), 1, "{datasets}");
    assert!(rows[0].contains("calexp/"), "{datasets}");

    let data_ids = butler(&["query-data-ids", target, "visit", "detector"])?;
    assert_eq!(data_ids.lines().count(), 5, "{data_ids}");

    butler(&[
        "certify-calibrations",
        target,
        "r1",
        "calib",
        "flat",
        "--begin-date",
        "2020-01-01T00:00:00Z",
    ])?;
    let collections = butler(&["query-collections", target])?;
    assert!(collections.contains("CALIBRATION"), "{collections}");
    let calibs = butler(&["query-datasets", target, "flat", "--collections", "calib"])?;
    assert_eq!(calibs.lines().count(), 5, "{calibs}");

    let mut cmd = Command::new(butler_binary());
    cmd.args(["prune-collection", target, "r1"]);
    assert!(run_command(cmd).is_err(), "RUN removal needs --purge and --unstore");
    butler(&["prune-collection", target, "calib"])?;
    butler(&["prune-collection", target, "r1", "--purge", "--unstore"])?;
    let collections = butler(&["query-collections", target])?;
    assert!(collections.contains("No results"), "{collections}");

    let dumped = butler(&["config-dump", target, "--subset", ".datastore.transfer"])?;
    assert_eq!(dumped.trim(), "\"auto\"");
    butler(&["config-validate", target, "--quiet"])?;
    Ok(())
}

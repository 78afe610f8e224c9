#![allow(dead_code)]

use anyhow::{Context, Result, bail};
use butler_registry::datastore::Datastore;
use butler_registry::testing::{DatastoreMock, add_dataset_type, make_test_repo};
use butler_registry::{
    DataCoordinate, DataIdValue, DatasetRef, JsonRepoExportBackend, JsonRepoImportBackend, Registry,
    RepoExportContext, RepoImportBackend,
};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::process::{Command, Output};

pub const INSTRUMENT: &str = "DummyCam";

pub fn butler_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_butler"))
}

pub fn run_command(mut cmd: Command) -> Result<Output> {
    let output = cmd
        .output()
        .with_context(|| format!("failed to run command: {:?}", cmd))?;
    if output.status.success() {
        Ok(output)
    } else {
        bail!(
            "command {:?} failed: status {:?}\nstdout: {}\nstderr: {}",
            cmd,
            output.status.code(),
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        )
    }
}

/// One instrument with a filter, two visits and three detectors.
pub fn populated_registry() -> Result<Registry> {
    let data_ids = BTreeMap::from([
        ("instrument".to_string(), vec![json!(INSTRUMENT)]),
        ("physical_filter".to_string(), vec![json!("d-r")]),
        ("visit".to_string(), vec![json!(1), json!(2)]),
        ("detector".to_string(), vec![json!(1), json!(2), json!(3)]),
    ]);
    Ok(make_test_repo(None, &data_ids)?)
}

pub fn visit_detector(registry: &Registry, visit: i64, detector: i64) -> Result<DataCoordinate> {
    Ok(DataCoordinate::from_pairs(
        registry.universe(),
        [
            ("instrument", DataIdValue::from(INSTRUMENT)),
            ("visit", DataIdValue::from(visit)),
            ("detector", DataIdValue::from(detector)),
        ],
    )?)
}

/// Register `calexp` and put one dataset per detector of visit 1 in `run`.
pub fn add_calexps(registry: &mut Registry, run: &str) -> Result<Vec<DatasetRef>> {
    add_dataset_type(registry, "calexp", &["instrument", "visit", "detector"], "ExposureF")?;
    registry.register_run(run, None)?;
    let data_ids = (1..=3)
        .map(|detector| visit_detector(registry, 1, detector))
        .collect::<Result<Vec<_>>>()?;
    Ok(registry.insert_datasets("calexp", &data_ids, run)?)
}

/// Export `refs` and `collections` through the JSON backend and return the
/// document text.
pub fn export_text(
    registry: &Registry,
    datastore: &dyn Datastore,
    refs: &[DatasetRef],
    collections: &[&str],
) -> Result<String> {
    let backend = JsonRepoExportBackend::new(Vec::new()).with_description("test export");
    let mut context = RepoExportContext::new(registry, datastore, backend, None, None);
    for name in collections {
        context.save_collection(name)?;
    }
    context.save_datasets(refs, &[], None)?;
    let backend = context.finish()?;
    Ok(String::from_utf8(backend.into_inner())?)
}

pub fn export_with_mock(
    registry: &Registry,
    refs: &[DatasetRef],
    collections: &[&str],
) -> Result<String> {
    export_text(registry, &DatastoreMock::new(), refs, collections)
}

/// Replay an export document into `registry`.
pub fn import_text(
    registry: &mut Registry,
    text: &str,
    datastore: Option<&dyn Datastore>,
) -> Result<()> {
    let import = JsonRepoImportBackend::from_reader(text.as_bytes())?;
    import.register(registry)?;
    import.load(registry, datastore, None, None, &BTreeSet::new())?;
    Ok(())
}

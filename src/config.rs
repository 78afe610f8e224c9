//! Repository configuration (`butler.json`).
//!
//! A configuration is checked against the bundled JSON Schema before it is
//! deserialized, and then semantically (the dimension universe must build and
//! every storage-class component must name a known storage class).

use crate::datasets::StorageClassFactory;
use crate::dimensions::{DimensionConfig, DimensionUniverse};
use crate::error::{RegistryError, Result};
use crate::schema_loader::CONFIG_SCHEMA;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

/// File name of the configuration inside a repository root.
pub const CONFIG_FILE: &str = "butler.json";

const DEFAULT_CONFIG: &str = include_str!("../config/default.json");

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ButlerConfig {
    pub dimensions: DimensionConfig,
    #[serde(default)]
    pub storage_classes: BTreeMap<String, StorageClassConfig>,
    #[serde(default)]
    pub datastore: DatastoreConfig,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageClassConfig {
    /// Component name to the storage class of that component.
    #[serde(default)]
    pub components: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatastoreConfig {
    #[serde(default)]
    pub root: Option<String>,
    /// Default transfer mode for imports, e.g. `auto` or `copy`.
    #[serde(default)]
    pub transfer: Option<String>,
}

impl ButlerConfig {
    /// The bundled default configuration.
    pub fn default_config() -> Self {
        static DEFAULT: OnceLock<ButlerConfig> = OnceLock::new();
        DEFAULT
            .get_or_init(|| {
                serde_json::from_str(DEFAULT_CONFIG)
                    .expect("bundled default configuration deserializes")
            })
            .clone()
    }

    /// Validate a JSON document and deserialize it.
    pub fn from_value(value: Value) -> Result<Self> {
        CONFIG_SCHEMA.validate(&value).map_err(RegistryError::Config)?;
        let config: ButlerConfig = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&text).map_err(|err| {
            RegistryError::Config(format!("parsing {}: {err}", path.display()))
        })?;
        Self::from_value(value)
            .map_err(|err| RegistryError::Config(format!("{}: {err}", path.display())))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut text = serde_json::to_string_pretty(self)?;
        text.push('\n');
        fs::write(path, text)?;
        Ok(())
    }

    /// Overlay `seed` on the default configuration; objects merge key by
    /// key, anything else replaces.
    pub fn with_seed(seed: Value) -> Result<Self> {
        let mut base = serde_json::to_value(Self::default_config())?;
        merge(&mut base, seed);
        Self::from_value(base)
    }

    pub fn universe(&self) -> Result<DimensionUniverse> {
        DimensionUniverse::from_config(&self.dimensions)
    }

    pub fn storage_classes(&self) -> Result<StorageClassFactory> {
        StorageClassFactory::from_config(&self.storage_classes)
    }

    /// Semantic checks that the schema cannot express.
    pub fn validate(&self) -> Result<()> {
        self.universe()?;
        self.storage_classes()?;
        if let Some(transfer) = &self.datastore.transfer {
            transfer.parse::<crate::datastore::TransferMode>()?;
        }
        Ok(())
    }

    /// Select part of the configuration with a dotted path such as
    /// `.datastore.root`. The first character is the separator; an empty
    /// selector returns everything.
    pub fn subset(&self, selector: &str) -> Result<Value> {
        let value = serde_json::to_value(self)?;
        let mut chars = selector.chars();
        let Some(separator) = chars.next() else {
            return Ok(value);
        };
        let rest = chars.as_str();
        if rest.is_empty() {
            return Ok(value);
        }
        let mut current = &value;
        for key in rest.split(separator) {
            current = match current {
                Value::Object(map) => map.get(key),
                Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            }
            .ok_or_else(|| {
                RegistryError::invalid(format!(
                    "configuration has no entry '{key}' in '{selector}'"
                ))
            })?;
        }
        Ok(current.clone())
    }
}

fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bundled_default_passes_validation() {
        let value: Value = serde_json::from_str(DEFAULT_CONFIG).unwrap();
        let config = ButlerConfig::from_value(value).unwrap();
        assert_eq!(config, ButlerConfig::default_config());
        let universe = config.universe().unwrap();
        assert!(universe.get("patch").is_ok());
    }

    #[test]
    fn schema_violations_are_config_errors() {
        let err = ButlerConfig::from_value(json!({"dimensions": {"elements": []}, "extra": 1}))
            .unwrap_err();
        assert!(matches!(err, RegistryError::Config(_)));
    }

    #[test]
    fn subset_follows_dotted_paths() {
        let config = ButlerConfig::default_config();
        assert_eq!(config.subset(".datastore.transfer").unwrap(), json!("auto"));
        assert_eq!(
            config.subset(".dimensions.elements.0.name").unwrap(),
            json!("instrument")
        );
        assert!(config.subset(".datastore.nope").is_err());
        assert!(config.subset("").unwrap().get("dimensions").is_some());
    }

    #[test]
    fn seed_overrides_merge_into_defaults() {
        let config = ButlerConfig::with_seed(json!({"datastore": {"root": "/data"}})).unwrap();
        assert_eq!(config.datastore.root.as_deref(), Some("/data"));
        assert_eq!(config.datastore.transfer.as_deref(), Some("auto"));
        assert!(!config.dimensions.elements.is_empty());
    }

    #[test]
    fn unknown_component_storage_class_is_rejected() {
        let err = ButlerConfig::with_seed(json!({
            "storage_classes": {"Broken": {"components": {"a": "Missing"}}}
        }))
        .unwrap_err();
        assert!(matches!(err, RegistryError::Config(_)));
    }
}

//! JSON Schemas bundled into the binary.
//!
//! Configuration files and export documents are checked against a schema
//! before they are deserialized, so structural mistakes are reported with
//! every offending path instead of the first serde error. Schemas are parsed
//! once and kept for the life of the process.

use jsonschema::JSONSchema;
use serde_json::Value;
use std::sync::OnceLock;

pub(crate) struct BundledSchema {
    name: &'static str,
    source: &'static str,
    parsed: OnceLock<Result<Value, String>>,
}

pub(crate) static CONFIG_SCHEMA: BundledSchema = BundledSchema::new(
    "butler configuration",
    include_str!("../schema/butler_config.schema.json"),
);

pub(crate) static EXPORT_SCHEMA: BundledSchema = BundledSchema::new(
    "repository export",
    include_str!("../schema/repo_export.schema.json"),
);

impl BundledSchema {
    const fn new(name: &'static str, source: &'static str) -> Self {
        Self {
            name,
            source,
            parsed: OnceLock::new(),
        }
    }

    fn raw(&'static self) -> Result<&'static Value, String> {
        self.parsed
            .get_or_init(|| {
                serde_json::from_str(self.source)
                    .map_err(|err| format!("parsing bundled {} schema: {err}", self.name))
            })
            .as_ref()
            .map_err(Clone::clone)
    }

    fn compile(&'static self) -> Result<JSONSchema, String> {
        let raw = self.raw()?;
        JSONSchema::compile(raw)
            .map_err(|err| format!("compiling bundled {} schema: {err}", self.name))
    }

    /// Versions the schema accepts, read from `/properties/version/enum`.
    pub(crate) fn allowed_versions(&'static self) -> Vec<String> {
        self.raw()
            .ok()
            .and_then(|schema| schema.pointer("/properties/version/enum"))
            .and_then(Value::as_array)
            .map(|values| {
                values
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Validate `instance`, returning every violation joined by newlines.
    pub(crate) fn validate(&'static self, instance: &Value) -> Result<(), String> {
        let compiled = self.compile()?;
        if let Err(errors) = compiled.validate(instance) {
            let details = errors
                .map(|err| {
                    let path = err.instance_path.to_string();
                    if path.is_empty() {
                        err.to_string()
                    } else {
                        format!("{path}: {err}")
                    }
                })
                .collect::<Vec<_>>()
                .join("\n");
            return Err(format!("{} failed validation:\n{details}", self.name));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bundled_schemas_compile() {
        CONFIG_SCHEMA.compile().unwrap();
        EXPORT_SCHEMA.compile().unwrap();
        assert!(EXPORT_SCHEMA.allowed_versions().contains(&"1.0.0".to_string()));
    }

    #[test]
    fn violations_are_reported_with_their_path() {
        let err = CONFIG_SCHEMA
            .validate(&json!({"dimensions": {"elements": [{"name": "x"}]}}))
            .unwrap_err();
        assert!(err.contains("primary_key"), "{err}");
    }
}

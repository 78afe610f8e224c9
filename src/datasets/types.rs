use crate::config::StorageClassConfig;
use crate::dimensions::DimensionGraph;
use crate::error::{RegistryError, Result};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Named in-memory representation of a dataset, possibly with components.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageClass {
    name: String,
    components: BTreeMap<String, String>,
}

impl StorageClass {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            components: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Component name to the storage class name of that component.
    pub fn components(&self) -> &BTreeMap<String, String> {
        &self.components
    }

    pub fn is_composite(&self) -> bool {
        !self.components.is_empty()
    }
}

/// Every storage class a repository knows about.
#[derive(Clone, Debug, Default)]
pub struct StorageClassFactory {
    classes: BTreeMap<String, StorageClass>,
}

impl StorageClassFactory {
    pub fn from_config(config: &BTreeMap<String, StorageClassConfig>) -> Result<Self> {
        let mut classes = BTreeMap::new();
        for (name, entry) in config {
            for (component, target) in &entry.components {
                if !config.contains_key(target) {
                    return Err(RegistryError::Config(format!(
                        "component '{component}' of storage class '{name}' uses unknown \
                         storage class '{target}'"
                    )));
                }
            }
            classes.insert(
                name.clone(),
                StorageClass {
                    name: name.clone(),
                    components: entry.components.clone(),
                },
            );
        }
        Ok(Self { classes })
    }

    pub fn get(&self, name: &str) -> Result<&StorageClass> {
        self.classes
            .get(name)
            .ok_or_else(|| RegistryError::invalid(format!("unknown storage class '{name}'")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.classes.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.classes.keys().map(String::as_str)
    }
}

/// Named kind of dataset: its dimensions and storage class.
///
/// Two dataset types are equal when name, dimensions, storage class and
/// calibration flag all match; ordering is by name only, which is unique
/// within a repository.
#[derive(Clone, Debug)]
pub struct DatasetType {
    name: String,
    dimensions: DimensionGraph,
    storage_class: StorageClass,
    is_calibration: bool,
}

impl DatasetType {
    pub fn new(
        name: impl Into<String>,
        dimensions: DimensionGraph,
        storage_class: StorageClass,
        is_calibration: bool,
    ) -> Result<Self> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self {
            name,
            dimensions,
            storage_class,
            is_calibration,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dimensions(&self) -> &DimensionGraph {
        &self.dimensions
    }

    pub fn storage_class(&self) -> &StorageClass {
        &self.storage_class
    }

    pub fn is_calibration(&self) -> bool {
        self.is_calibration
    }

    pub fn is_composite(&self) -> bool {
        self.storage_class.is_composite()
    }

    pub fn is_component(&self) -> bool {
        self.name.contains('.')
    }

    /// Name without any component suffix.
    pub fn parent_name(&self) -> &str {
        self.name.split('.').next().unwrap_or(&self.name)
    }

    /// Dataset type of one component of this composite.
    pub fn make_component(
        &self,
        component: &str,
        storage_classes: &StorageClassFactory,
    ) -> Result<Self> {
        let class_name = self.storage_class.components.get(component).ok_or_else(|| {
            RegistryError::invalid(format!(
                "dataset type '{}' has no component '{component}'",
                self.name
            ))
        })?;
        DatasetType::new(
            format!("{}.{component}", self.name),
            self.dimensions.clone(),
            storage_classes.get(class_name)?.clone(),
            self.is_calibration,
        )
    }

    /// Dataset types of every declared component, in component-name order.
    pub fn components(&self, storage_classes: &StorageClassFactory) -> Result<Vec<Self>> {
        self.storage_class
            .components
            .keys()
            .map(|component| self.make_component(component, storage_classes))
            .collect()
    }
}

fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.split('.').all(|part| {
            let mut chars = part.chars();
            chars
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        });
    if valid {
        Ok(())
    } else {
        Err(RegistryError::invalid(format!(
            "dataset type name '{name}' is not a valid identifier"
        )))
    }
}

impl PartialEq for DatasetType {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.dimensions == other.dimensions
            && self.storage_class.name == other.storage_class.name
            && self.is_calibration == other.is_calibration
    }
}

impl Eq for DatasetType {}

impl PartialOrd for DatasetType {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DatasetType {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name
            .cmp(&other.name)
            .then_with(|| self.dimensions.cmp(&other.dimensions))
            .then_with(|| self.storage_class.name.cmp(&other.storage_class.name))
            .then_with(|| self.is_calibration.cmp(&other.is_calibration))
    }
}

impl fmt::Display for DatasetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DatasetType({}, {}, {}",
            self.name, self.dimensions, self.storage_class.name
        )?;
        if self.is_calibration {
            f.write_str(", calibration")?;
        }
        f.write_str(")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ButlerConfig;

    #[test]
    fn equality_is_structural() {
        let config = ButlerConfig::default_config();
        let universe = config.universe().unwrap();
        let classes = config.storage_classes().unwrap();
        let dims = universe.extract(["instrument", "visit"]).unwrap();
        let exposure = classes.get("ExposureF").unwrap();
        let a = DatasetType::new("calexp", dims.clone(), exposure.clone(), false).unwrap();
        let b = DatasetType::new("calexp", dims.clone(), exposure.clone(), false).unwrap();
        let c = DatasetType::new("calexp", dims, classes.get("NumpyArray").unwrap().clone(), false)
            .unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn components_follow_the_storage_class() {
        let config = ButlerConfig::default_config();
        let universe = config.universe().unwrap();
        let classes = config.storage_classes().unwrap();
        let dims = universe.extract(["instrument", "visit", "detector"]).unwrap();
        let exposure = classes.get("ExposureF").unwrap().clone();
        let calexp = DatasetType::new("calexp", dims, exposure, false).unwrap();
        let names: Vec<String> = calexp
            .components(&classes)
            .unwrap()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        assert_eq!(names, ["calexp.image", "calexp.mask", "calexp.variance", "calexp.wcs"]);
        let wcs = calexp.make_component("wcs", &classes).unwrap();
        assert!(wcs.is_component());
        assert_eq!(wcs.parent_name(), "calexp");
        assert!(calexp.make_component("psf", &classes).is_err());
    }

    #[test]
    fn names_must_be_identifiers() {
        let config = ButlerConfig::default_config();
        let universe = config.universe().unwrap();
        let dims = universe.extract(["instrument"]).unwrap();
        for bad in ["", "1abc", "a-b", "a..b"] {
            assert!(DatasetType::new(bad, dims.clone(), StorageClass::new("X"), false).is_err());
        }
    }
}

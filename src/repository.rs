//! A registry persisted in a directory.
//!
//! The directory holds `butler.json` (the configuration) and
//! `registry.json` (every table of the in-process database, datastore
//! locations included). Changes only reach disk through
//! [`Repository::save`].

use crate::config::{ButlerConfig, CONFIG_FILE};
use crate::database::{Database, MemoryDatabase};
use crate::error::{RegistryError, Result};
use crate::registry::Registry;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const REGISTRY_FILE: &str = "registry.json";

pub struct Repository {
    root: PathBuf,
    db: Arc<MemoryDatabase>,
    registry: Registry,
}

impl Repository {
    /// Create an empty repository; `root` must not already hold one.
    pub fn create(root: &Path, config: ButlerConfig) -> Result<Self> {
        if root.join(CONFIG_FILE).exists() {
            return Err(RegistryError::invalid(format!(
                "a repository already exists at {}",
                root.display()
            )));
        }
        fs::create_dir_all(root)?;
        config.save(&root.join(CONFIG_FILE))?;
        let repo = Self::assemble(root, Arc::new(MemoryDatabase::new()), config)?;
        repo.save()?;
        tracing::info!(root = %root.display(), "created repository");
        Ok(repo)
    }

    pub fn open(root: &Path) -> Result<Self> {
        let config_path = root.join(CONFIG_FILE);
        if !config_path.is_file() {
            return Err(RegistryError::invalid(format!(
                "no repository found at {} (missing {CONFIG_FILE})",
                root.display()
            )));
        }
        let config = ButlerConfig::load(&config_path)?;
        let registry_path = root.join(REGISTRY_FILE);
        let db = if registry_path.is_file() {
            MemoryDatabase::load(&registry_path)?
        } else {
            MemoryDatabase::new()
        };
        Self::assemble(root, Arc::new(db), config)
    }

    fn assemble(root: &Path, db: Arc<MemoryDatabase>, config: ButlerConfig) -> Result<Self> {
        let shared: Arc<dyn Database> = db.clone();
        let registry = Registry::new(shared, config)?;
        Ok(Self {
            root: root.to_path_buf(),
            db,
            registry,
        })
    }

    /// Write the database back to `registry.json`.
    pub fn save(&self) -> Result<()> {
        self.db.save(&self.root.join(REGISTRY_FILE))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }
}

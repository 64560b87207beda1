//! A store directory on disk.
//!
//! ```text
//! <dir>/
//!   schema.json   SchemaDef (types and attributes)
//!   revkb.json    KbConfig (optional; defaults apply)
//!   revkb.wal     write-ahead log of the backing database
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use revkb_store::{KbConfig, KnowledgeBase, MemoryDatabase, Schema, SchemaDef, TypeDescriptor};

pub const SCHEMA_FILE: &str = "schema.json";
pub const CONFIG_FILE: &str = "revkb.json";
pub const WAL_FILE: &str = "revkb.wal";

pub struct StoreDir {
    root: PathBuf,
}

impl StoreDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn schema_path(&self) -> PathBuf {
        self.root.join(SCHEMA_FILE)
    }

    fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    /// Create the directory with a schema (the given file or a demo schema)
    /// and a default config. Refuses to overwrite an existing store.
    pub fn init(&self, schema_source: Option<&Path>) -> Result<SchemaDef> {
        if self.schema_path().exists() {
            return Err(anyhow!(
                "{} already contains a store",
                self.root.display()
            ));
        }
        fs::create_dir_all(&self.root)
            .with_context(|| format!("creating {}", self.root.display()))?;

        let def = match schema_source {
            Some(path) => {
                let text = fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                serde_json::from_str(&text)
                    .with_context(|| format!("parsing {}", path.display()))?
            }
            None => demo_schema(),
        };
        // validate before anything lands on disk
        Schema::from_def(def.clone())?;

        fs::write(self.schema_path(), serde_json::to_string_pretty(&def)?)?;
        if !self.config_path().exists() {
            fs::write(
                self.config_path(),
                serde_json::to_string_pretty(&KbConfig::default())?,
            )?;
        }
        Ok(def)
    }

    pub fn config(&self) -> Result<KbConfig> {
        let path = self.config_path();
        if !path.exists() {
            return Ok(KbConfig::default());
        }
        KbConfig::from_json_file(&path).with_context(|| format!("loading {}", path.display()))
    }

    pub fn wal_path(&self, config: &KbConfig) -> PathBuf {
        match &config.wal_path {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => self.root.join(path),
            None => self.root.join(WAL_FILE),
        }
    }

    /// Recover the database from the WAL and open a knowledge base on it.
    pub fn open(&self) -> Result<Arc<KnowledgeBase>> {
        let schema_path = self.schema_path();
        if !schema_path.exists() {
            return Err(anyhow!(
                "{} is not a store directory (run `revkb init` first)",
                self.root.display()
            ));
        }
        let schema = Schema::from_json_file(&schema_path)?;
        let config = self.config()?;
        let wal = self.wal_path(&config);
        let db = MemoryDatabase::open(&wal, config.sync_wal)
            .with_context(|| format!("opening {}", wal.display()))?;
        tracing::debug!(dir = %self.root.display(), wal = %wal.display(), "store opened");
        Ok(KnowledgeBase::open_shared(&db, schema, config)?)
    }
}

fn demo_schema() -> SchemaDef {
    SchemaDef {
        types: vec![
            TypeDescriptor::new("User").primitive("name"),
            TypeDescriptor::new("Doc")
                .primitive("title")
                .primitive("status")
                .global_reference("author", "User"),
            TypeDescriptor::new("Comment")
                .primitive("text")
                .veto_reference("doc", "Doc"),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn init_writes_schema_and_config_once() {
        let dir = tempdir().unwrap();
        let store = StoreDir::new(dir.path().join("kb"));

        let def = store.init(None).unwrap();
        assert_eq!(def.types.len(), 3);
        assert!(store.root().join(SCHEMA_FILE).exists());
        assert!(store.root().join(CONFIG_FILE).exists());
        assert!(store.init(None).is_err());

        let kb = store.open().unwrap();
        assert_eq!(kb.last_local_revision().0, 0);
        assert!(store.root().join(WAL_FILE).exists());
    }

    #[test]
    fn relative_wal_paths_resolve_inside_the_directory() {
        let store = StoreDir::new("/tmp/somewhere");
        let config = KbConfig {
            wal_path: Some(PathBuf::from("logs/kb.wal")),
            ..KbConfig::default()
        };
        assert_eq!(
            store.wal_path(&config),
            PathBuf::from("/tmp/somewhere/logs/kb.wal")
        );
        assert_eq!(
            store.wal_path(&KbConfig::default()),
            PathBuf::from("/tmp/somewhere").join(WAL_FILE)
        );
    }

    #[test]
    fn opening_a_plain_directory_fails() {
        let dir = tempdir().unwrap();
        assert!(StoreDir::new(dir.path()).open().is_err());
    }
}

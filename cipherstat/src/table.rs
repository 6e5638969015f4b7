//! On-disk layout of encrypted tables.
//!
//! A table is a directory: `metadata.json` describing the schema, profile
//! and block layout, a `blocks/` directory with one ciphertext file per
//! column block, and a `validity/` directory with the per-block row-validity
//! ciphertexts. Publication is atomic at the directory level: everything is
//! written into a staging directory next to the target and renamed into
//! place, so readers never observe a half-written table.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use cipherstat_he::{
    wire::{atomic_write, ciphertext_from_bytes, ciphertext_to_bytes},
    Ciphertext, Profile,
};

use crate::codec::Dictionary;
use crate::error::{PipelineError, PipelineResult};
use crate::schema::Schema;

pub const METADATA_FILE: &str = "metadata.json";
pub const BLOCKS_DIR: &str = "blocks";
pub const VALIDITY_DIR: &str = "validity";

/// Everything about an encrypted table except the ciphertexts themselves.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TableMetadata {
    pub schema: Schema,
    pub profile: String,
    /// Digest of the parameter set the table was encrypted under; checked
    /// against the resolved profile on open.
    pub params_hash: String,
    pub key_id: String,
    pub rows: usize,
    pub block_count: usize,
    pub slots_per_block: usize,
    /// Categorical dictionaries by column name.
    pub dictionaries: BTreeMap<String, Dictionary>,
    pub created_at: DateTime<Utc>,
}

impl TableMetadata {
    pub fn profile(&self) -> PipelineResult<&'static Profile> {
        let profile = Profile::resolve_str(&self.profile)?;
        if profile.params_hash() != self.params_hash {
            return Err(PipelineError::InvalidTable(format!(
                "table was encrypted under profile {} with parameter hash {}, \
                 current registry has {}",
                self.profile,
                self.params_hash,
                profile.params_hash()
            )));
        }
        Ok(profile)
    }

    pub fn dictionary(&self, column: &str) -> Option<&Dictionary> {
        self.dictionaries.get(column)
    }
}

/// A fully encrypted table ready for publication.
#[derive(Debug)]
pub struct EncryptedTable {
    pub metadata: TableMetadata,
    /// Column name -> one ciphertext per block, in block order.
    pub columns: BTreeMap<String, Vec<Ciphertext>>,
    /// One validity ciphertext per block: 1.0 in live row slots, 0.0 in
    /// padding slots.
    pub validity: Vec<Ciphertext>,
}

fn block_file(column: &str, index: usize) -> String {
    format!("{column}_{index:05}.ct")
}

fn validity_file(index: usize) -> String {
    format!("{index:05}.ct")
}

/// Read-only handle on a published table directory.
#[derive(Debug)]
pub struct TableStore {
    dir: PathBuf,
    metadata: TableMetadata,
}

impl TableStore {
    /// Write `table` into `dir` via a staging directory and a final rename.
    ///
    /// Fails if `dir` already exists; tables are immutable once published.
    pub fn publish(dir: &Path, table: &EncryptedTable) -> PipelineResult<()> {
        if dir.exists() {
            return Err(PipelineError::InvalidTable(format!(
                "table directory {} already exists",
                dir.display()
            )));
        }
        let parent = dir.parent().unwrap_or_else(|| Path::new("."));
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "table".to_string());
        let staging = parent.join(format!(".{name}.staging"));
        if staging.exists() {
            fs::remove_dir_all(&staging).map_err(|e| {
                PipelineError::io(format!("clearing stale staging {}", staging.display()), e)
            })?;
        }

        let result = Self::write_staging(&staging, table);
        if let Err(e) = result {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }
        fs::rename(&staging, dir).map_err(|e| {
            let _ = fs::remove_dir_all(&staging);
            PipelineError::io(format!("publishing table {}", dir.display()), e)
        })?;
        info!(
            table = %table.metadata.schema.name,
            rows = table.metadata.rows,
            blocks = table.metadata.block_count,
            dir = %dir.display(),
            "published encrypted table"
        );
        Ok(())
    }

    fn write_staging(staging: &Path, table: &EncryptedTable) -> PipelineResult<()> {
        let blocks_dir = staging.join(BLOCKS_DIR);
        let validity_dir = staging.join(VALIDITY_DIR);
        for d in [staging, &blocks_dir, &validity_dir] {
            fs::create_dir_all(d)
                .map_err(|e| PipelineError::io(format!("creating {}", d.display()), e))?;
        }

        let meta = serde_json::to_vec_pretty(&table.metadata)
            .map_err(|e| PipelineError::InvalidTable(format!("encoding metadata: {e}")))?;
        atomic_write(&staging.join(METADATA_FILE), &meta)?;

        for (column, blocks) in &table.columns {
            if blocks.len() != table.metadata.block_count {
                return Err(PipelineError::InvalidTable(format!(
                    "column {column:?} has {} blocks, metadata declares {}",
                    blocks.len(),
                    table.metadata.block_count
                )));
            }
            for (i, ct) in blocks.iter().enumerate() {
                atomic_write(&blocks_dir.join(block_file(column, i)), &ciphertext_to_bytes(ct)?)?;
            }
        }
        if table.validity.len() != table.metadata.block_count {
            return Err(PipelineError::InvalidTable(format!(
                "{} validity blocks for {} data blocks",
                table.validity.len(),
                table.metadata.block_count
            )));
        }
        for (i, ct) in table.validity.iter().enumerate() {
            atomic_write(&validity_dir.join(validity_file(i)), &ciphertext_to_bytes(ct)?)?;
        }
        Ok(())
    }

    /// Open a published table, validating its metadata.
    pub fn open(dir: &Path) -> PipelineResult<TableStore> {
        let meta_path = dir.join(METADATA_FILE);
        let bytes = fs::read(&meta_path)
            .map_err(|e| PipelineError::io(format!("reading {}", meta_path.display()), e))?;
        let metadata: TableMetadata = serde_json::from_slice(&bytes)
            .map_err(|e| PipelineError::InvalidTable(format!("{}: {e}", meta_path.display())))?;
        metadata.schema.validate()?;
        metadata.profile()?;
        Ok(TableStore {
            dir: dir.to_path_buf(),
            metadata,
        })
    }

    pub fn metadata(&self) -> &TableMetadata {
        &self.metadata
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load all blocks of one column, in block order.
    pub fn load_column(&self, column: &str) -> PipelineResult<Vec<Ciphertext>> {
        self.metadata.schema.require_column(column)?;
        (0..self.metadata.block_count)
            .map(|i| self.load_ciphertext(&self.dir.join(BLOCKS_DIR).join(block_file(column, i))))
            .collect()
    }

    /// Load the per-block validity ciphertexts.
    pub fn load_validity(&self) -> PipelineResult<Vec<Ciphertext>> {
        (0..self.metadata.block_count)
            .map(|i| self.load_ciphertext(&self.dir.join(VALIDITY_DIR).join(validity_file(i))))
            .collect()
    }

    fn load_ciphertext(&self, path: &Path) -> PipelineResult<Ciphertext> {
        let bytes = fs::read(path)
            .map_err(|e| PipelineError::io(format!("reading block {}", path.display()), e))?;
        let ct = ciphertext_from_bytes(&bytes)?;
        if ct.key_id != self.metadata.key_id {
            return Err(PipelineError::InvalidTable(format!(
                "block {} was encrypted under key {}, table metadata says {}",
                path.display(),
                ct.key_id,
                self.metadata.key_id
            )));
        }
        Ok(ct)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cipherstat_he::{KeyManager, LatticeBackend, MockCkksBackend, Plaintext, ProfileId};

    fn sample_table(dir: &Path) -> (EncryptedTable, MockCkksBackend) {
        let profile = Profile::resolve(ProfileId::T);
        let backend = MockCkksBackend::new(profile);
        let keys = KeyManager::keygen(&backend, &dir.join("keys"), false).unwrap();
        let enc = |slots: Vec<f64>| {
            backend
                .encrypt(&keys.public, &Plaintext::new(ProfileId::T, slots))
                .unwrap()
        };
        let mut columns = BTreeMap::new();
        columns.insert(
            "age".to_string(),
            vec![enc(vec![30.0, 40.0, 50.0, 0.0, 0.0, 0.0, 0.0, 0.0])],
        );
        let validity = vec![enc(vec![1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0])];
        let schema: Schema = serde_json::from_value(serde_json::json!({
            "name": "people",
            "columns": [{"name": "age", "type": "integer"}]
        }))
        .unwrap();
        let metadata = TableMetadata {
            schema,
            profile: "T".to_string(),
            params_hash: profile.params_hash(),
            key_id: keys.secret.key_id.clone(),
            rows: 3,
            block_count: 1,
            slots_per_block: profile.slots,
            dictionaries: BTreeMap::new(),
            created_at: Utc::now(),
        };
        (
            EncryptedTable {
                metadata,
                columns,
                validity,
            },
            backend,
        )
    }

    #[test]
    fn publish_then_open_round_trips_metadata_and_blocks() {
        let tmp = tempfile::tempdir().unwrap();
        let (table, _) = sample_table(tmp.path());
        let dir = tmp.path().join("people.table");
        TableStore::publish(&dir, &table).unwrap();

        let store = TableStore::open(&dir).unwrap();
        assert_eq!(store.metadata().rows, 3);
        assert_eq!(store.metadata().key_id, table.metadata.key_id);
        let blocks = store.load_column("age").unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(store.load_validity().unwrap().len(), 1);
        // No staging droppings next to the published directory.
        let names: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().all(|n| !n.contains("staging")));
    }

    #[test]
    fn publish_refuses_existing_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let (table, _) = sample_table(tmp.path());
        let dir = tmp.path().join("people.table");
        TableStore::publish(&dir, &table).unwrap();
        let err = TableStore::publish(&dir, &table).unwrap_err();
        assert!(err.to_string().starts_with("InvalidTable"));
    }

    #[test]
    fn stale_staging_leftovers_never_reach_the_published_table() {
        let tmp = tempfile::tempdir().unwrap();
        let (table, _) = sample_table(tmp.path());
        let dir = tmp.path().join("people.table");

        // A crashed earlier publish left a half-populated staging directory.
        let staging = tmp.path().join(".people.table.staging");
        fs::create_dir_all(staging.join(BLOCKS_DIR)).unwrap();
        fs::write(staging.join(METADATA_FILE), b"half-written junk").unwrap();

        // The target never appeared, so readers see no table at all.
        assert!(!dir.exists());
        assert!(TableStore::open(&dir).is_err());

        // A fresh publish succeeds and carries none of the leftovers.
        TableStore::publish(&dir, &table).unwrap();
        let store = TableStore::open(&dir).unwrap();
        assert_eq!(store.metadata().rows, 3);
        assert_eq!(store.load_column("age").unwrap().len(), 1);
        assert!(!staging.exists());
    }

    #[test]
    fn tampered_params_hash_is_rejected_on_open() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut table, _) = sample_table(tmp.path());
        table.metadata.params_hash = "0000".to_string();
        let dir = tmp.path().join("people.table");
        TableStore::publish(&dir, &table).unwrap();
        let err = TableStore::open(&dir).unwrap_err();
        assert!(err.to_string().starts_with("InvalidTable"));
    }

    #[test]
    fn missing_column_load_is_column_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let (table, _) = sample_table(tmp.path());
        let dir = tmp.path().join("people.table");
        TableStore::publish(&dir, &table).unwrap();
        let store = TableStore::open(&dir).unwrap();
        let err = store.load_column("height").unwrap_err();
        assert!(err.to_string().starts_with("ColumnNotFound"));
    }
}

//! Keyless artifact inspection.
//!
//! Identifies an artifact by its magic (or by being a table directory) and
//! reports only header fields. Inspection never touches ciphertext payloads
//! or key blobs, and is safe to run on artifacts produced under keys the
//! operator does not hold.

use std::fmt;
use std::fs;
use std::path::Path;

use cipherstat_he::{
    keys::{inspect_key_file, KeyFileHeader},
    wire::{ciphertext_header_from_bytes, CiphertextHeader, CIPHERTEXT_MAGIC, KEY_MAGIC, RESULT_MAGIC},
    HeError,
};

use crate::error::{PipelineError, PipelineResult};
use crate::result::{result_header_from_bytes, ResultHeader};
use crate::table::TableStore;

/// What an artifact turned out to be, with its public header fields.
#[derive(Clone, Debug)]
pub enum ArtifactReport {
    Key(KeyFileHeader),
    Ciphertext(CiphertextHeader),
    Result(ResultHeader),
    Table {
        name: String,
        profile: String,
        key_id: String,
        rows: usize,
        block_count: usize,
        columns: Vec<String>,
    },
}

impl fmt::Display for ArtifactReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactReport::Key(h) => write!(
                f,
                "key file: kind={}, profile={}, key_id={}",
                h.kind, h.profile, h.key_id
            ),
            ArtifactReport::Ciphertext(h) => write!(
                f,
                "ciphertext: profile={}, key_id={}, level={}, slots={}",
                h.profile, h.key_id, h.level, h.slot_count
            ),
            ArtifactReport::Result(h) => write!(
                f,
                "result: job={}, operation={}, profile={}, rows={}, params_hash={}, created_at={}",
                h.job_id, h.operation, h.profile, h.rows, h.params_hash, h.created_at
            ),
            ArtifactReport::Table {
                name,
                profile,
                key_id,
                rows,
                block_count,
                columns,
            } => write!(
                f,
                "table {name}: profile={profile}, key_id={key_id}, rows={rows}, \
                 blocks={block_count}, columns=[{}]",
                columns.join(", ")
            ),
        }
    }
}

/// Identify and summarize the artifact at `path`.
pub fn inspect(path: &Path) -> PipelineResult<ArtifactReport> {
    if path.is_dir() {
        let store = TableStore::open(path)?;
        let metadata = store.metadata();
        return Ok(ArtifactReport::Table {
            name: metadata.schema.name.clone(),
            profile: metadata.profile.clone(),
            key_id: metadata.key_id.clone(),
            rows: metadata.rows,
            block_count: metadata.block_count,
            columns: metadata.schema.columns.iter().map(|c| c.name.clone()).collect(),
        });
    }

    let bytes = fs::read(path)
        .map_err(|e| PipelineError::io(format!("reading artifact {}", path.display()), e))?;
    let magic: &[u8] = bytes.get(..4).unwrap_or(&bytes);
    if magic == KEY_MAGIC.as_slice() {
        Ok(ArtifactReport::Key(inspect_key_file(path)?))
    } else if magic == CIPHERTEXT_MAGIC.as_slice() {
        Ok(ArtifactReport::Ciphertext(ciphertext_header_from_bytes(&bytes)?))
    } else if magic == RESULT_MAGIC.as_slice() {
        Ok(ArtifactReport::Result(result_header_from_bytes(&bytes)?))
    } else {
        Err(PipelineError::He(HeError::corrupt_artifact(format!(
            "{} carries no known artifact magic",
            path.display()
        ))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cipherstat_he::{KeyManager, LatticeBackend, MockCkksBackend, Plaintext, Profile, ProfileId};
    use cipherstat_he::wire::{atomic_write, ciphertext_to_bytes};

    #[test]
    fn key_files_are_identified_without_exposing_material() {
        let backend = MockCkksBackend::new(Profile::resolve(ProfileId::T));
        let dir = tempfile::tempdir().unwrap();
        KeyManager::keygen(&backend, dir.path(), false).unwrap();

        let report = inspect(&dir.path().join("secret.key")).unwrap();
        let rendered = report.to_string();
        assert!(rendered.contains("kind=secret"));
        assert!(rendered.contains("profile=T"));

        let report = inspect(&dir.path().join("eval.key")).unwrap();
        assert!(report.to_string().contains("kind=eval"));
    }

    #[test]
    fn ciphertext_headers_are_reported() {
        let backend = MockCkksBackend::new(Profile::resolve(ProfileId::T));
        let keys = backend.keygen().unwrap();
        let ct = backend
            .encrypt(&keys.public, &Plaintext::new(ProfileId::T, vec![1.0; 8]))
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("block.ct");
        atomic_write(&path, &ciphertext_to_bytes(&ct).unwrap()).unwrap();

        let report = inspect(&path).unwrap();
        match report {
            ArtifactReport::Ciphertext(h) => {
                assert_eq!(h.profile, "T");
                assert_eq!(h.slot_count, 8);
            }
            other => panic!("expected ciphertext report, got {other}"),
        }
    }

    #[test]
    fn unknown_magic_is_corrupt_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stray.bin");
        std::fs::write(&path, b"random junk").unwrap();
        let err = inspect(&path).unwrap_err();
        assert!(err.to_string().starts_with("CorruptArtifact"));
    }

    #[test]
    fn inspection_is_idempotent() {
        let backend = MockCkksBackend::new(Profile::resolve(ProfileId::T));
        let dir = tempfile::tempdir().unwrap();
        KeyManager::keygen(&backend, dir.path(), false).unwrap();
        let path = dir.path().join("public.key");
        let before = std::fs::read(&path).unwrap();
        inspect(&path).unwrap();
        inspect(&path).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }
}

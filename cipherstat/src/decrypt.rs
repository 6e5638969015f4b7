//! Decryption of job results and table columns, with noise flagging.
//!
//! Approximate-arithmetic schemes can hand back numerically valid garbage
//! when a circuit exhausted its precision, or when the wrong key was used.
//! Any decrypted aggregate whose magnitude exceeds the profile's noise
//! bound is therefore reported as undefined (JSON `null`) instead of a
//! number.

use std::path::Path;

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use cipherstat_he::{wire::atomic_write, HeError, LatticeBackend, SecretKey};

use crate::error::{PipelineError, PipelineResult};
use crate::jobs::Operation;
use crate::result::JobResult;
use crate::table::TableStore;

/// Plaintext view of one evaluated job: one entry per slot, in slot order.
#[derive(Clone, Debug, Serialize)]
pub struct DecryptedResult {
    pub job_id: String,
    pub operation: String,
    pub profile: String,
    pub rows: usize,
    /// Per-slot values; `None` where the slot failed the noise-bound check.
    pub slots: Vec<Option<f64>>,
}

impl DecryptedResult {
    /// The aggregate lives in slot 0 by construction.
    pub fn aggregate(&self) -> Option<f64> {
        self.slots.first().copied().flatten()
    }

    /// Persist as a JSON file, atomically. Flagged slots render as `null`.
    pub fn save(&self, path: &Path) -> PipelineResult<()> {
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| PipelineError::Encoding(format!("decrypted result: {e}")))?;
        atomic_write(path, &bytes)?;
        Ok(())
    }
}

pub struct Decryptor<'a> {
    backend: &'a dyn LatticeBackend,
    secret: &'a SecretKey,
}

impl<'a> Decryptor<'a> {
    pub fn new(backend: &'a dyn LatticeBackend, secret: &'a SecretKey) -> PipelineResult<Self> {
        let profile = backend.profile();
        if secret.profile != profile.id {
            return Err(PipelineError::He(HeError::profile_mismatch(
                profile.id,
                secret.profile,
                "secret key handed to decryptor",
            )));
        }
        Ok(Self { backend, secret })
    }

    /// Decrypt a result's aggregate slot, flagging values outside the noise
    /// bound as undefined.
    pub fn decrypt_result(&self, result: &JobResult) -> PipelineResult<DecryptedResult> {
        let profile = self.backend.profile();
        if result.profile != profile.id.to_string() {
            return Err(PipelineError::He(HeError::profile_mismatch(
                profile.id,
                &result.profile,
                "result artifact",
            )));
        }
        if result.params_hash != profile.params_hash() {
            return Err(PipelineError::He(HeError::corrupt_artifact(format!(
                "result was produced under parameter hash {}, registry has {}",
                result.params_hash,
                profile.params_hash()
            ))));
        }

        let pt = self.backend.decrypt(self.secret, &result.ciphertext)?;
        let bound = profile.noise_bound();
        let mut flagged = 0usize;
        let slots: Vec<Option<f64>> = pt
            .slots
            .iter()
            .map(|&raw| {
                if raw.is_finite() && raw.abs() <= bound {
                    // Stdev circuits ship the variance; take the root here.
                    // Small negative values are approximation residue.
                    if result.operation == Operation::Stdev {
                        Some(raw.max(0.0).sqrt())
                    } else {
                        Some(raw)
                    }
                } else {
                    flagged += 1;
                    None
                }
            })
            .collect();
        if flagged > 0 {
            warn!(
                job = %result.job_id,
                flagged,
                bound,
                "decrypted slots exceed noise bound, reporting undefined"
            );
        }
        info!(job = %result.job_id, operation = %result.operation, flagged, "decrypted result");
        Ok(DecryptedResult {
            job_id: result.job_id.clone(),
            operation: result.operation.as_str().to_string(),
            profile: result.profile.clone(),
            rows: result.rows,
            slots,
        })
    }

    /// Decrypt and decode one column of a published table back to raw
    /// values, using the schema and dictionaries in its metadata.
    pub fn decrypt_column(&self, store: &TableStore, column: &str) -> PipelineResult<Vec<Value>> {
        let metadata = store.metadata();
        let table_profile = metadata.profile()?;
        let profile = self.backend.profile();
        if table_profile.id != profile.id {
            return Err(PipelineError::He(HeError::profile_mismatch(
                profile.id,
                table_profile.id,
                "table under decryption",
            )));
        }
        let schema_column = metadata.schema.require_column(column)?;
        let codec = crate::codec::SchemaCodec::new(profile);

        let mut slots = Vec::with_capacity(metadata.rows);
        for ct in store.load_column(column)? {
            let pt = self.backend.decrypt(self.secret, &ct)?;
            slots.extend(pt.slots);
        }
        codec.decode_column(
            schema_column,
            metadata.dictionary(column),
            &slots,
            metadata.rows,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cipherstat_he::{Ciphertext, MockCkksBackend, Profile, ProfileId};
    use chrono::Utc;
    use serde_json::json;

    use crate::codec::RawTable;
    use crate::encrypt::Encryptor;
    use crate::jobs::Operation;
    use crate::schema::Schema;
    use crate::table::TableStore;

    fn result_with_slot0(backend: &MockCkksBackend, key_id: &str, value: f64) -> JobResult {
        let profile = backend.profile();
        let mut payload = vec![0.0; profile.slots];
        payload[0] = value;
        JobResult {
            job_id: "job-1".to_string(),
            operation: Operation::Sum,
            profile: profile.id.to_string(),
            params_hash: profile.params_hash(),
            rows: 3,
            created_at: Utc::now(),
            ciphertext: Ciphertext {
                profile: profile.id,
                key_id: key_id.to_string(),
                level: 5,
                scale: profile.scale(),
                payload,
            },
        }
    }

    #[test]
    fn in_bound_aggregate_decrypts_to_a_number() {
        let backend = MockCkksBackend::new(Profile::resolve(ProfileId::T));
        let keys = backend.keygen().unwrap();
        let decryptor = Decryptor::new(&backend, &keys.secret).unwrap();
        let result = result_with_slot0(&backend, &keys.secret.key_id, 120.0);
        let decrypted = decryptor.decrypt_result(&result).unwrap();
        assert_eq!(decrypted.aggregate(), Some(120.0));
        assert_eq!(decrypted.slots.len(), backend.profile().slots);
        assert_eq!(decrypted.operation, "sum");
    }

    #[test]
    fn stdev_result_decrypts_to_the_square_root() {
        let backend = MockCkksBackend::new(Profile::resolve(ProfileId::T));
        let keys = backend.keygen().unwrap();
        let decryptor = Decryptor::new(&backend, &keys.secret).unwrap();
        let mut result = result_with_slot0(&backend, &keys.secret.key_id, 64.0);
        result.operation = Operation::Stdev;
        let decrypted = decryptor.decrypt_result(&result).unwrap();
        assert_eq!(decrypted.aggregate(), Some(8.0));
        assert_eq!(decrypted.operation, "stdev");
    }

    #[test]
    fn decrypted_result_saves_as_json_with_null_slots() {
        let backend = MockCkksBackend::new(Profile::resolve(ProfileId::T));
        let keys = backend.keygen().unwrap();
        let decryptor = Decryptor::new(&backend, &keys.secret).unwrap();
        let huge = backend.profile().noise_bound() * 8.0;
        let result = result_with_slot0(&backend, &keys.secret.key_id, huge);
        let decrypted = decryptor.decrypt_result(&result).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job-1.json");
        decrypted.save(&path).unwrap();
        let rendered: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(rendered["job_id"], "job-1");
        assert_eq!(
            rendered["slots"].as_array().unwrap().len(),
            backend.profile().slots
        );
        assert_eq!(rendered["slots"][0], serde_json::Value::Null);
        assert!(rendered["slots"][1].is_number());
        // Atomic write leaves no temp droppings.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn out_of_bound_aggregate_is_undefined_not_an_error() {
        let backend = MockCkksBackend::new(Profile::resolve(ProfileId::T));
        let keys = backend.keygen().unwrap();
        let decryptor = Decryptor::new(&backend, &keys.secret).unwrap();
        let huge = backend.profile().noise_bound() * 8.0;
        let result = result_with_slot0(&backend, &keys.secret.key_id, huge);
        let decrypted = decryptor.decrypt_result(&result).unwrap();
        assert_eq!(decrypted.aggregate(), None);
        // The undefined slot renders as JSON null; the clean slots stay numeric.
        let rendered = serde_json::to_value(&decrypted).unwrap();
        assert_eq!(rendered["slots"][0], serde_json::Value::Null);
        assert!(rendered["slots"][1].is_number());
    }

    #[test]
    fn wrong_key_decryption_lands_outside_the_noise_bound() {
        let backend = MockCkksBackend::new(Profile::resolve(ProfileId::T));
        let keys = backend.keygen().unwrap();
        let other = backend.keygen().unwrap();
        let decryptor = Decryptor::new(&backend, &other.secret).unwrap();
        let result = result_with_slot0(&backend, &keys.secret.key_id, 120.0);
        let decrypted = decryptor.decrypt_result(&result).unwrap();
        assert_eq!(decrypted.aggregate(), None);
    }

    #[test]
    fn stale_params_hash_is_rejected() {
        let backend = MockCkksBackend::new(Profile::resolve(ProfileId::T));
        let keys = backend.keygen().unwrap();
        let decryptor = Decryptor::new(&backend, &keys.secret).unwrap();
        let mut result = result_with_slot0(&backend, &keys.secret.key_id, 120.0);
        result.params_hash = "ffff".to_string();
        let err = decryptor.decrypt_result(&result).unwrap_err();
        assert!(err.to_string().starts_with("CorruptArtifact"));
    }

    #[test]
    fn table_column_round_trips_through_decryption() {
        let backend = MockCkksBackend::new(Profile::resolve(ProfileId::T));
        let keys = backend.keygen().unwrap();
        let schema: Schema = serde_json::from_value(json!({
            "name": "people",
            "columns": [
                {"name": "age", "type": "integer"},
                {"name": "country", "type": "categorical", "categories": ["US", "DE"]}
            ]
        }))
        .unwrap();
        let raw: RawTable = serde_json::from_value(json!({
            "columns": [
                {"name": "age", "values": [30, 40, 50]},
                {"name": "country", "values": ["US", "DE", "US"]}
            ]
        }))
        .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let encryptor = Encryptor::new(&backend, &keys.public).unwrap();
        let table = encryptor.encrypt_table(&schema, &raw).unwrap();
        let table_dir = dir.path().join("people.table");
        TableStore::publish(&table_dir, &table).unwrap();
        let store = TableStore::open(&table_dir).unwrap();

        let decryptor = Decryptor::new(&backend, &keys.secret).unwrap();
        let ages = decryptor.decrypt_column(&store, "age").unwrap();
        assert_eq!(ages, vec![json!(30), json!(40), json!(50)]);
        let countries = decryptor.decrypt_column(&store, "country").unwrap();
        assert_eq!(countries, vec![json!("US"), json!("DE"), json!("US")]);
    }
}

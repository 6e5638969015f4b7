//! Table encryption: raw columnar data in, a publishable
//! [`EncryptedTable`](crate::table::EncryptedTable) out.
//!
//! Rows are packed `profile.slots` at a time into per-column ciphertext
//! blocks. The last block is zero-padded, and a parallel validity ciphertext
//! per block carries 1.0 in live row slots and 0.0 in padding slots so that
//! counting aggregations never see phantom rows.

use std::collections::BTreeMap;

use chrono::Utc;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use cipherstat_he::{LatticeBackend, Plaintext, PublicKey};

use crate::codec::{Dictionary, RawTable, SchemaCodec};
use crate::error::{PipelineError, PipelineResult};
use crate::schema::Schema;
use crate::table::{EncryptedTable, TableMetadata};

pub struct Encryptor<'a> {
    backend: &'a dyn LatticeBackend,
    public: &'a PublicKey,
}

impl<'a> Encryptor<'a> {
    pub fn new(backend: &'a dyn LatticeBackend, public: &'a PublicKey) -> PipelineResult<Self> {
        let profile = backend.profile();
        if public.profile != profile.id {
            return Err(PipelineError::He(cipherstat_he::HeError::profile_mismatch(
                profile.id,
                public.profile,
                "public key handed to encryptor",
            )));
        }
        Ok(Self { backend, public })
    }

    /// Encode and encrypt `raw` per `schema`. Every schema column must be
    /// present in the raw table with the same row count; raw columns the
    /// schema does not declare are skipped.
    pub fn encrypt_table(&self, schema: &Schema, raw: &RawTable) -> PipelineResult<EncryptedTable> {
        schema.validate()?;
        let profile = self.backend.profile();
        let codec = SchemaCodec::new(profile);

        let rows = self.expected_rows(schema, raw)?;
        if rows == 0 {
            return Err(PipelineError::InvalidTable(
                "raw table has no rows".to_string(),
            ));
        }
        for raw_col in &raw.columns {
            if schema.column(&raw_col.name).is_none() {
                warn!(column = %raw_col.name, "raw column not declared by schema, skipping");
            }
        }

        let block_count = rows.div_ceil(profile.slots);
        let mut dictionaries = BTreeMap::new();
        let mut column_blocks: Vec<(String, Vec<Vec<f64>>)> = Vec::new();
        for column in &schema.columns {
            let raw_col = raw.column(&column.name).ok_or_else(|| {
                PipelineError::SchemaColumnMissing {
                    schema: schema.name.clone(),
                    column: column.name.clone(),
                }
            })?;
            if raw_col.values.len() != rows {
                return Err(PipelineError::RowCountMismatch {
                    column: column.name.clone(),
                    expected: rows,
                    found: raw_col.values.len(),
                });
            }
            let encoded = codec.encode_column(column, &raw_col.values)?;
            if let Some(dict) = encoded.dictionary {
                dictionaries.insert(column.name.clone(), dict);
            }
            column_blocks.push((column.name.clone(), pack_blocks(&encoded.slots, profile.slots)));
            debug!(column = %column.name, rows, blocks = block_count, "encoded column");
        }

        let validity_slots: Vec<Vec<f64>> = pack_blocks(&vec![1.0; rows], profile.slots);

        // Ciphertext blocks are independent; encrypt them in parallel.
        let columns: BTreeMap<String, Vec<_>> = column_blocks
            .into_par_iter()
            .map(|(name, blocks)| {
                let cts = blocks
                    .into_iter()
                    .map(|slots| {
                        self.backend
                            .encrypt(self.public, &Plaintext::new(profile.id, slots))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok((name, cts))
            })
            .collect::<PipelineResult<_>>()?;
        let validity = validity_slots
            .into_par_iter()
            .map(|slots| self.backend.encrypt(self.public, &Plaintext::new(profile.id, slots)))
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            table = %schema.name,
            rows,
            blocks = block_count,
            columns = schema.columns.len(),
            profile = %profile.id,
            "encrypted table"
        );
        Ok(EncryptedTable {
            metadata: TableMetadata {
                schema: schema.clone(),
                profile: profile.id.to_string(),
                params_hash: profile.params_hash(),
                key_id: self.public.key_id.clone(),
                rows,
                block_count,
                slots_per_block: profile.slots,
                dictionaries,
                created_at: Utc::now(),
            },
            columns,
            validity,
        })
    }

    fn expected_rows(&self, schema: &Schema, raw: &RawTable) -> PipelineResult<usize> {
        let first = &schema.columns[0];
        let raw_col = raw
            .column(&first.name)
            .ok_or_else(|| PipelineError::SchemaColumnMissing {
                schema: schema.name.clone(),
                column: first.name.clone(),
            })?;
        Ok(raw_col.values.len())
    }
}

/// Split `values` into `slot_count`-sized chunks, zero-padding the tail.
fn pack_blocks(values: &[f64], slot_count: usize) -> Vec<Vec<f64>> {
    values
        .chunks(slot_count)
        .map(|chunk| {
            let mut block = chunk.to_vec();
            block.resize(slot_count, 0.0);
            block
        })
        .collect()
}

//! Encrypted job result artifacts.
//!
//! A result file carries a readable header (job id, operation, profile and
//! parameter digest) followed by the encrypted aggregate, so inspection
//! tooling can describe a result without the secret key.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};

use cipherstat_he::{
    wire::{
        atomic_write, ciphertext_from_bytes, ciphertext_to_bytes, Reader, Writer, RESULT_MAGIC,
    },
    Ciphertext, HeError,
};

use crate::error::{PipelineError, PipelineResult};
use crate::jobs::Operation;

/// An evaluated job's encrypted output plus its provenance header.
#[derive(Clone, Debug)]
pub struct JobResult {
    pub job_id: String,
    pub operation: Operation,
    pub profile: String,
    pub params_hash: String,
    /// Live rows the aggregate ranges over; needed to interpret averages.
    pub rows: usize,
    pub created_at: DateTime<Utc>,
    pub ciphertext: Ciphertext,
}

/// Header fields of a result file, readable without key material.
#[derive(Clone, Debug, PartialEq)]
pub struct ResultHeader {
    pub job_id: String,
    pub operation: String,
    pub profile: String,
    pub params_hash: String,
    pub rows: u64,
    pub created_at: String,
}

impl JobResult {
    pub fn to_bytes(&self) -> PipelineResult<Vec<u8>> {
        let mut w = Writer::new(RESULT_MAGIC);
        w.string(&self.job_id)?;
        w.string(self.operation.as_str())?;
        w.string(&self.profile)?;
        w.string(&self.params_hash)?;
        w.u64(self.rows as u64);
        w.string(&self.created_at.to_rfc3339())?;
        w.bytes(&ciphertext_to_bytes(&self.ciphertext)?);
        Ok(w.finish())
    }

    pub fn from_bytes(bytes: &[u8]) -> PipelineResult<JobResult> {
        let mut r = Reader::new(bytes);
        let header = read_header(&mut r)?;
        let ct_bytes = r.bytes()?;
        let ciphertext = ciphertext_from_bytes(&ct_bytes)?;
        let operation = Operation::parse(&header.operation)?;
        let created_at = DateTime::parse_from_rfc3339(&header.created_at)
            .map_err(|e| {
                PipelineError::He(HeError::corrupt_artifact(format!(
                    "bad result timestamp: {e}"
                )))
            })?
            .with_timezone(&Utc);
        Ok(JobResult {
            job_id: header.job_id,
            operation,
            profile: header.profile,
            params_hash: header.params_hash,
            rows: header.rows as usize,
            created_at,
            ciphertext,
        })
    }

    pub fn save(&self, path: &Path) -> PipelineResult<()> {
        atomic_write(path, &self.to_bytes()?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> PipelineResult<JobResult> {
        let bytes = fs::read(path)
            .map_err(|e| PipelineError::io(format!("reading result {}", path.display()), e))?;
        Self::from_bytes(&bytes)
    }
}

fn read_header(r: &mut Reader<'_>) -> PipelineResult<ResultHeader> {
    r.magic(RESULT_MAGIC)?;
    r.version()?;
    Ok(ResultHeader {
        job_id: r.string()?,
        operation: r.string()?,
        profile: r.string()?,
        params_hash: r.string()?,
        rows: r.u64()?,
        created_at: r.string()?,
    })
}

/// Parse only the header of a result blob.
pub fn result_header_from_bytes(bytes: &[u8]) -> PipelineResult<ResultHeader> {
    read_header(&mut Reader::new(bytes))
}

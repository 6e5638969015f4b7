//! Encrypted-analytics pipeline: schema-driven encryption of columnar data
//! and evaluation of aggregation jobs over the ciphertexts, on top of the
//! `cipherstat-he` capability layer.

pub mod codec;
pub mod config;
pub mod decrypt;
pub mod encrypt;
pub mod engine;
pub mod error;
pub mod inspect;
pub mod jobs;
pub mod privacy;
pub mod result;
pub mod schema;
pub mod table;

pub use codec::{Dictionary, RawTable, SchemaCodec};
pub use config::Config;
pub use decrypt::{DecryptedResult, Decryptor};
pub use encrypt::Encryptor;
pub use engine::JobEngine;
pub use error::{PipelineError, PipelineResult};
pub use inspect::{inspect, ArtifactReport};
pub use jobs::{Comparator, Condition, Job, JobState, Operation};
pub use privacy::{Policy, Release};
pub use result::JobResult;
pub use schema::{Column, ColumnType, Schema};
pub use table::{EncryptedTable, TableMetadata, TableStore};

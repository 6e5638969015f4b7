use thiserror::Error;

use cipherstat_he::HeError;

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Pipeline-level error taxonomy.
///
/// Variants render with a stable kind prefix so scripts and the wrapper can
/// pattern-match failures; HE-layer errors pass through transparently with
/// their own prefixes.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    He(#[from] HeError),

    #[error("SchemaColumnMissing: raw table lacks column {column:?} declared by schema {schema:?}")]
    SchemaColumnMissing { schema: String, column: String },

    #[error("RowCountMismatch: column {column:?} has {found} rows, expected {expected}")]
    RowCountMismatch {
        column: String,
        expected: usize,
        found: usize,
    },

    #[error("EncodingOverflow: value {value} in column {column:?} exceeds plaintext bound {bound}")]
    EncodingOverflow {
        column: String,
        value: f64,
        bound: f64,
    },

    #[error("UnknownCategory: value {value:?} not in dictionary of column {column:?}")]
    UnknownCategory { column: String, value: String },

    #[error("UnknownOperation: {0:?} is not a recognized job operation")]
    UnknownOperation(String),

    #[error("ColumnNotFound: {column:?} does not exist in schema {schema:?}")]
    ColumnNotFound { schema: String, column: String },

    #[error("InvalidSchema: {0}")]
    InvalidSchema(String),

    #[error("InvalidJob: {0}")]
    InvalidJob(String),

    #[error("InvalidTable: {0}")]
    InvalidTable(String),

    #[error("EncodingFailure: {0}")]
    Encoding(String),

    #[error("Cancelled: job evaluation cancelled between reduction steps")]
    Cancelled,

    #[error("IOFailure: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

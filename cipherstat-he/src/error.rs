use std::path::PathBuf;

use thiserror::Error;

pub type HeResult<T> = Result<T, HeError>;

/// Error taxonomy for the HE capability layer.
///
/// Every variant renders with a stable kind prefix (`"UnknownProfile: …"`)
/// so downstream tooling can pattern-match failures.
#[derive(Debug, Error)]
pub enum HeError {
    #[error("UnknownProfile: no parameter profile registered under {0:?}")]
    UnknownProfile(String),

    #[error("ProfileMismatch: expected profile {expected}, found {found} ({context})")]
    ProfileMismatch {
        expected: String,
        found: String,
        context: String,
    },

    #[error("KeyExistsConflict: key material already present at {}", path.display())]
    KeyExistsConflict { path: PathBuf },

    #[error("CorruptKeyMaterial: {reason}")]
    CorruptKeyMaterial { reason: String },

    #[error("CorruptArtifact: {reason}")]
    CorruptArtifact { reason: String },

    #[error("SlotLayoutMismatch: {reason}")]
    SlotLayoutMismatch { reason: String },

    #[error("DepthBudgetExceeded: operation needs {needed} multiplicative levels, {available} available")]
    DepthBudgetExceeded { needed: usize, available: usize },

    #[error("OversizeField: string field of {len} bytes exceeds the {limit}-byte length prefix")]
    OversizeField { len: usize, limit: usize },

    #[error("IOFailure: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl HeError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn corrupt(reason: impl Into<String>) -> Self {
        Self::CorruptKeyMaterial {
            reason: reason.into(),
        }
    }

    pub fn corrupt_artifact(reason: impl Into<String>) -> Self {
        Self::CorruptArtifact {
            reason: reason.into(),
        }
    }

    pub fn profile_mismatch(
        expected: impl ToString,
        found: impl ToString,
        context: impl Into<String>,
    ) -> Self {
        Self::ProfileMismatch {
            expected: expected.to_string(),
            found: found.to_string(),
            context: context.into(),
        }
    }
}

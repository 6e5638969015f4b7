//! Release-policy enforcement over decrypted results.
//!
//! Evaluation is blind; this layer runs after decryption and decides
//! whether a plaintext aggregate may be released. Aggregates over groups
//! smaller than a minimum are suppressed (k-anonymity), and numeric output
//! is rounded to a bounded number of decimal places so a result cannot
//! leak more precision than the policy allows.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::decrypt::DecryptedResult;
use crate::error::{PipelineError, PipelineResult};
use crate::jobs::Operation;

/// Rules governing what a decrypted aggregate may disclose.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    pub id: String,
    /// Smallest group an aggregate may range over.
    pub min_count: usize,
    /// Decimal places kept when rounding is enabled.
    pub max_precision: u32,
    pub suppress_small_groups: bool,
    pub rounding_enabled: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            id: "default".to_string(),
            min_count: 5,
            max_precision: 4,
            suppress_small_groups: true,
            rounding_enabled: true,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Violation {
    pub rule: &'static str,
    pub message: String,
}

/// Outcome of applying a [`Policy`] to one decrypted result.
#[derive(Clone, Debug, Serialize)]
pub struct Release {
    pub job_id: String,
    pub operation: String,
    pub policy: String,
    pub approved: bool,
    /// The policy-compliant aggregate; absent when suppressed or undefined.
    pub value: Option<f64>,
    pub violations: Vec<Violation>,
}

impl Policy {
    /// Load a policy from a JSON file; absent fields keep their defaults.
    pub fn load(path: &Path) -> PipelineResult<Policy> {
        let bytes = fs::read(path)
            .map_err(|e| PipelineError::io(format!("reading policy {}", path.display()), e))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| PipelineError::Encoding(format!("{}: {e}", path.display())))
    }

    /// Decide whether `decrypted` may be released, and with what value.
    pub fn apply(&self, decrypted: &DecryptedResult) -> Release {
        let mut violations = Vec::new();
        let value = decrypted.aggregate();

        if self.suppress_small_groups {
            match self.group_size(decrypted) {
                Some(group) if group < self.min_count => violations.push(Violation {
                    rule: "min_count",
                    message: format!(
                        "aggregate ranges over {group} rows, policy requires at least {}",
                        self.min_count
                    ),
                }),
                Some(_) => {}
                None => violations.push(Violation {
                    rule: "min_count",
                    message: "group size is undefined, cannot verify the minimum".to_string(),
                }),
            }
        }
        if value.is_none() {
            violations.push(Violation {
                rule: "noise_bound",
                message: "aggregate failed the noise-bound check".to_string(),
            });
        }

        let approved = violations.is_empty();
        let released = if approved {
            value.map(|v| self.round(v))
        } else {
            warn!(
                job = %decrypted.job_id,
                policy = %self.id,
                violations = violations.len(),
                "suppressing result under release policy"
            );
            None
        };
        Release {
            job_id: decrypted.job_id.clone(),
            operation: decrypted.operation.clone(),
            policy: self.id.clone(),
            approved,
            value: released,
            violations,
        }
    }

    /// Rows the aggregate ranges over. Count operations disclose their own
    /// group size; everything else ranges over the full table.
    fn group_size(&self, decrypted: &DecryptedResult) -> Option<usize> {
        match Operation::parse(&decrypted.operation) {
            Ok(Operation::Count | Operation::FilterCount) => decrypted
                .aggregate()
                .map(|count| count.round().max(0.0) as usize),
            _ => Some(decrypted.rows),
        }
    }

    fn round(&self, value: f64) -> f64 {
        if !self.rounding_enabled {
            return value;
        }
        let scale = 10f64.powi(self.max_precision as i32);
        (value * scale).round() / scale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decrypted(operation: &str, rows: usize, aggregate: Option<f64>) -> DecryptedResult {
        let mut slots = vec![Some(0.0); 8];
        slots[0] = aggregate;
        DecryptedResult {
            job_id: "job-1".to_string(),
            operation: operation.to_string(),
            profile: "T".to_string(),
            rows,
            slots,
        }
    }

    #[test]
    fn small_filtered_counts_are_suppressed() {
        let policy = Policy::default();
        let release = policy.apply(&decrypted("filter_count", 1000, Some(3.0)));
        assert!(!release.approved);
        assert_eq!(release.value, None);
        assert_eq!(release.violations[0].rule, "min_count");
    }

    #[test]
    fn approved_numeric_results_are_rounded() {
        let policy = Policy {
            max_precision: 2,
            ..Policy::default()
        };
        let release = policy.apply(&decrypted("avg", 100, Some(66.66666)));
        assert!(release.approved);
        assert_eq!(release.value, Some(66.67));
    }

    #[test]
    fn rounding_can_be_disabled() {
        let policy = Policy {
            rounding_enabled: false,
            ..Policy::default()
        };
        let release = policy.apply(&decrypted("sum", 100, Some(120.123456789)));
        assert_eq!(release.value, Some(120.123456789));
    }

    #[test]
    fn undefined_aggregates_never_release() {
        let policy = Policy::default();
        let release = policy.apply(&decrypted("sum", 100, None));
        assert!(!release.approved);
        assert!(release
            .violations
            .iter()
            .any(|v| v.rule == "noise_bound"));
    }

    #[test]
    fn small_tables_fail_numeric_aggregates_too() {
        let policy = Policy::default();
        let release = policy.apply(&decrypted("avg", 3, Some(40.0)));
        assert!(!release.approved);
    }

    #[test]
    fn partial_policy_files_fill_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.json");
        std::fs::write(&path, br#"{"id": "strict", "min_count": 25}"#).unwrap();
        let policy = Policy::load(&path).unwrap();
        assert_eq!(policy.id, "strict");
        assert_eq!(policy.min_count, 25);
        assert_eq!(policy.max_precision, 4);
        assert!(policy.rounding_enabled);
    }
}

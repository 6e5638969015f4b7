//! Job descriptions and their lifecycle states.
//!
//! A job arrives as JSON naming an operation, a table, an optional target
//! column and zero or more filter conditions. The operation is kept as a
//! free string during deserialization so that an unrecognized name surfaces
//! as `UnknownOperation` rather than a serde parse error.

use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PipelineError, PipelineResult};

/// Aggregations the engine evaluates. `Filter*` variants apply the job's
/// conditions as an encrypted mask first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Sum,
    Count,
    Avg,
    Var,
    /// Evaluates as `var`; the square root is applied after decryption.
    Stdev,
    FilterSum,
    FilterCount,
    FilterAvg,
}

impl Operation {
    pub fn parse(s: &str) -> PipelineResult<Operation> {
        match s {
            "sum" => Ok(Operation::Sum),
            "count" => Ok(Operation::Count),
            "avg" => Ok(Operation::Avg),
            "var" => Ok(Operation::Var),
            "stdev" => Ok(Operation::Stdev),
            "filter_sum" => Ok(Operation::FilterSum),
            "filter_count" => Ok(Operation::FilterCount),
            "filter_avg" => Ok(Operation::FilterAvg),
            other => Err(PipelineError::UnknownOperation(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Sum => "sum",
            Operation::Count => "count",
            Operation::Avg => "avg",
            Operation::Var => "var",
            Operation::Stdev => "stdev",
            Operation::FilterSum => "filter_sum",
            Operation::FilterCount => "filter_count",
            Operation::FilterAvg => "filter_avg",
        }
    }

    pub fn is_filtered(&self) -> bool {
        matches!(
            self,
            Operation::FilterSum | Operation::FilterCount | Operation::FilterAvg
        )
    }

    /// Whether the operation aggregates values of a target column (as
    /// opposed to only counting rows).
    pub fn needs_target(&self) -> bool {
        !matches!(self, Operation::Count | Operation::FilterCount)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "<")]
    Lt,
}

impl Comparator {
    /// Equality comparators evaluate through the polynomial equality kernel;
    /// the rest go through the deeper sign-iteration kernel.
    pub fn is_equality(&self) -> bool {
        matches!(self, Comparator::Eq | Comparator::Ne)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Comparator::Eq => "==",
            Comparator::Ne => "!=",
            Comparator::Ge => ">=",
            Comparator::Gt => ">",
            Comparator::Le => "<=",
            Comparator::Lt => "<",
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One filter clause: `column <comparator> value`. Clauses are ANDed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Condition {
    pub column: String,
    pub comparator: Comparator,
    pub value: Value,
}

/// A parsed, structurally valid job. Column existence and types are checked
/// later against the target table's schema.
#[derive(Clone, Debug)]
pub struct Job {
    pub id: String,
    pub operation: Operation,
    pub table: String,
    pub target_column: Option<String>,
    pub conditions: Vec<Condition>,
}

#[derive(Deserialize)]
struct JobSpec {
    id: String,
    operation: String,
    table: String,
    #[serde(default)]
    target_column: Option<String>,
    #[serde(default)]
    conditions: Vec<Condition>,
}

impl Job {
    pub fn from_json(bytes: &[u8]) -> PipelineResult<Job> {
        let spec: JobSpec = serde_json::from_slice(bytes)
            .map_err(|e| PipelineError::InvalidJob(e.to_string()))?;
        let operation = Operation::parse(&spec.operation)?;
        let job = Job {
            id: spec.id,
            operation,
            table: spec.table,
            target_column: spec.target_column,
            conditions: spec.conditions,
        };
        job.validate()?;
        Ok(job)
    }

    pub fn load(path: &Path) -> PipelineResult<Job> {
        let bytes = fs::read(path)
            .map_err(|e| PipelineError::io(format!("reading job {}", path.display()), e))?;
        Self::from_json(&bytes)
    }

    fn validate(&self) -> PipelineResult<()> {
        if self.id.is_empty() {
            return Err(PipelineError::InvalidJob("job id cannot be empty".to_string()));
        }
        if self.table.is_empty() {
            return Err(PipelineError::InvalidJob(format!(
                "job {:?} names no table",
                self.id
            )));
        }
        if self.operation.needs_target() && self.target_column.is_none() {
            return Err(PipelineError::InvalidJob(format!(
                "operation {} requires a target_column",
                self.operation
            )));
        }
        if self.operation.is_filtered() && self.conditions.is_empty() {
            return Err(PipelineError::InvalidJob(format!(
                "operation {} requires at least one condition",
                self.operation
            )));
        }
        if !self.operation.is_filtered() && !self.conditions.is_empty() {
            return Err(PipelineError::InvalidJob(format!(
                "operation {} takes no conditions",
                self.operation
            )));
        }
        Ok(())
    }
}

/// Lifecycle of one job run. Transitions are strictly forward; `Failed`
/// records the phase that aborted the run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobState {
    Parse,
    Resolve,
    Evaluate,
    Finalize,
    Done,
    Failed { phase: &'static str },
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Parse => write!(f, "parse"),
            JobState::Resolve => write!(f, "resolve"),
            JobState::Evaluate => write!(f, "evaluate"),
            JobState::Finalize => write!(f, "finalize"),
            JobState::Done => write!(f, "done"),
            JobState::Failed { phase } => write!(f, "failed({phase})"),
        }
    }
}

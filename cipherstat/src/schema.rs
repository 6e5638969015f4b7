//! Table schemas: named, typed columns that drive both encoding and job
//! column resolution.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    #[serde(rename = "integer")]
    Integer,
    #[serde(rename = "fixed-point")]
    FixedPoint,
    #[serde(rename = "categorical")]
    Categorical,
}

/// One column declaration, including its encoding parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ColumnType,
    /// Fixed-point precision: values are quantised to steps of
    /// `2^-fraction_bits`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fraction_bits: Option<u32>,
    /// Pre-supplied categorical dictionary. When absent the dictionary is
    /// built at encode time from the observed values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub categories: Option<Vec<String>>,
    /// Escape hatch for unseen categorical values. Without it, encoding an
    /// unknown category fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_category: Option<String>,
    /// Value span, used to normalise comparator operands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_value: Option<f64>,
}

impl Column {
    /// Smallest distinguishable difference between two values of this column.
    pub fn step(&self) -> f64 {
        match self.ty {
            ColumnType::Integer | ColumnType::Categorical => 1.0,
            ColumnType::FixedPoint => (-(self.fraction_bits.unwrap_or(0) as f64)).exp2(),
        }
    }

    /// Declared value span, when the schema provides one.
    pub fn span(&self) -> Option<f64> {
        match (self.min_value, self.max_value) {
            (Some(lo), Some(hi)) if hi > lo => Some(hi - lo),
            _ => None,
        }
    }

    fn validate(&self) -> PipelineResult<()> {
        if self.name.is_empty() {
            return Err(PipelineError::InvalidSchema(
                "column name cannot be empty".to_string(),
            ));
        }
        match self.ty {
            ColumnType::Integer => {}
            ColumnType::FixedPoint => {
                if self.fraction_bits.is_none() {
                    return Err(PipelineError::InvalidSchema(format!(
                        "fixed-point column {:?} must declare fraction_bits",
                        self.name
                    )));
                }
            }
            ColumnType::Categorical => {
                if let (Some(cats), Some(default)) = (&self.categories, &self.default_category) {
                    if !cats.contains(default) {
                        return Err(PipelineError::InvalidSchema(format!(
                            "default_category {:?} of column {:?} is not among its categories",
                            default, self.name
                        )));
                    }
                }
            }
        }
        if let (Some(lo), Some(hi)) = (self.min_value, self.max_value) {
            if hi <= lo {
                return Err(PipelineError::InvalidSchema(format!(
                    "column {:?} declares an empty value range [{lo}, {hi}]",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// Immutable table descriptor. Column names are unique.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Schema {
    pub name: String,
    pub columns: Vec<Column>,
}

impl Schema {
    pub fn validate(&self) -> PipelineResult<()> {
        if self.name.is_empty() {
            return Err(PipelineError::InvalidSchema(
                "table name cannot be empty".to_string(),
            ));
        }
        if self.columns.is_empty() {
            return Err(PipelineError::InvalidSchema(
                "schema must declare at least one column".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for col in &self.columns {
            col.validate()?;
            if !seen.insert(col.name.as_str()) {
                return Err(PipelineError::InvalidSchema(format!(
                    "duplicate column name {:?}",
                    col.name
                )));
            }
        }
        Ok(())
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Column lookup that fails with the job-facing `ColumnNotFound` kind.
    pub fn require_column(&self, name: &str) -> PipelineResult<&Column> {
        self.column(name).ok_or_else(|| PipelineError::ColumnNotFound {
            schema: self.name.clone(),
            column: name.to_string(),
        })
    }

    pub fn load(path: &Path) -> PipelineResult<Schema> {
        let bytes = fs::read(path)
            .map_err(|e| PipelineError::io(format!("reading schema {}", path.display()), e))?;
        let schema: Schema = serde_json::from_slice(&bytes)
            .map_err(|e| PipelineError::InvalidSchema(format!("{}: {e}", path.display())))?;
        schema.validate()?;
        Ok(schema)
    }
}

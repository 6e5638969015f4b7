//! Schema-driven encoding between raw cell values and plaintext slot
//! vectors, plus the inverse applied after decryption.
//!
//! Integers map directly into the plaintext space; fixed-point values are
//! quantised to the column's fractional step; categoricals go through a
//! per-column dictionary with 1-based codes (code 0 is reserved for
//! padding slots).

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use cipherstat_he::Profile;

use crate::error::{PipelineError, PipelineResult};
use crate::schema::{Column, ColumnType};

/// Raw tabular input, one value list per column.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RawTable {
    pub columns: Vec<RawColumn>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RawColumn {
    pub name: String,
    pub values: Vec<Value>,
}

impl RawTable {
    pub fn load(path: &Path) -> PipelineResult<RawTable> {
        let bytes = fs::read(path)
            .map_err(|e| PipelineError::io(format!("reading raw table {}", path.display()), e))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| PipelineError::InvalidTable(format!("{}: {e}", path.display())))
    }

    pub fn column(&self, name: &str) -> Option<&RawColumn> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Per-column categorical dictionary; codes are 1-based positions.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Dictionary {
    pub labels: Vec<String>,
}

impl Dictionary {
    pub fn from_labels(labels: Vec<String>) -> Self {
        Self { labels }
    }

    pub fn code(&self, label: &str) -> Option<usize> {
        self.labels.iter().position(|l| l == label).map(|i| i + 1)
    }

    pub fn label(&self, code: usize) -> Option<&str> {
        if code == 0 {
            return None;
        }
        self.labels.get(code - 1).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Result of encoding one raw column: the slot values for `rows` cells and,
/// for categoricals, the dictionary that was used or built.
#[derive(Clone, Debug)]
pub struct EncodedColumn {
    pub slots: Vec<f64>,
    pub dictionary: Option<Dictionary>,
}

/// Maps raw cells to plaintext slots and back, per the table schema.
pub struct SchemaCodec<'a> {
    profile: &'a Profile,
}

impl<'a> SchemaCodec<'a> {
    pub fn new(profile: &'a Profile) -> Self {
        Self { profile }
    }

    pub fn encode_column(&self, column: &Column, values: &[Value]) -> PipelineResult<EncodedColumn> {
        match column.ty {
            ColumnType::Integer | ColumnType::FixedPoint => {
                let mut slots = Vec::with_capacity(values.len());
                for value in values {
                    slots.push(self.encode_numeric(column, value)?);
                }
                Ok(EncodedColumn {
                    slots,
                    dictionary: None,
                })
            }
            ColumnType::Categorical => {
                let mut dict = Dictionary::from_labels(
                    column.categories.clone().unwrap_or_default(),
                );
                let supplied = column.categories.is_some();
                let mut slots = Vec::with_capacity(values.len());
                for value in values {
                    let label = cell_as_str(column, value)?;
                    let code = match dict.code(&label) {
                        Some(code) => code,
                        None if !supplied => {
                            dict.labels.push(label);
                            dict.labels.len()
                        }
                        None => match &column.default_category {
                            Some(default) => dict.code(default).ok_or_else(|| {
                                PipelineError::UnknownCategory {
                                    column: column.name.clone(),
                                    value: default.clone(),
                                }
                            })?,
                            None => {
                                return Err(PipelineError::UnknownCategory {
                                    column: column.name.clone(),
                                    value: label,
                                })
                            }
                        },
                    };
                    slots.push(code as f64);
                }
                Ok(EncodedColumn {
                    slots,
                    dictionary: Some(dict),
                })
            }
        }
    }

    /// Inverse of [`encode_column`](Self::encode_column); decodes the first
    /// `rows` slots, ignoring padding.
    pub fn decode_column(
        &self,
        column: &Column,
        dictionary: Option<&Dictionary>,
        slots: &[f64],
        rows: usize,
    ) -> PipelineResult<Vec<Value>> {
        let mut out = Vec::with_capacity(rows);
        for slot in slots.iter().take(rows) {
            out.push(match column.ty {
                ColumnType::Integer => Value::from(slot.round() as i64),
                ColumnType::FixedPoint => {
                    let step = column.step();
                    Value::from((slot / step).round() * step)
                }
                ColumnType::Categorical => {
                    let code = slot.round() as usize;
                    let dict = dictionary.ok_or_else(|| {
                        PipelineError::InvalidTable(format!(
                            "no dictionary stored for categorical column {:?}",
                            column.name
                        ))
                    })?;
                    match dict.label(code) {
                        Some(label) => Value::from(label),
                        None => Value::Null,
                    }
                }
            });
        }
        Ok(out)
    }

    /// Encode a job condition literal against a column, using the table's
    /// dictionary for categoricals.
    pub fn encode_literal(
        &self,
        column: &Column,
        dictionary: Option<&Dictionary>,
        value: &Value,
    ) -> PipelineResult<f64> {
        match column.ty {
            ColumnType::Integer | ColumnType::FixedPoint => self.encode_numeric(column, value),
            ColumnType::Categorical => {
                let label = cell_as_str(column, value)?;
                let dict = dictionary.ok_or_else(|| PipelineError::UnknownCategory {
                    column: column.name.clone(),
                    value: label.clone(),
                })?;
                dict.code(&label)
                    .map(|c| c as f64)
                    .ok_or_else(|| PipelineError::UnknownCategory {
                        column: column.name.clone(),
                        value: label,
                    })
            }
        }
    }

    fn encode_numeric(&self, column: &Column, value: &Value) -> PipelineResult<f64> {
        let raw = cell_as_f64(column, value)?;
        let encoded = match column.ty {
            ColumnType::Integer => {
                if raw.fract() != 0.0 {
                    return Err(PipelineError::InvalidTable(format!(
                        "non-integer value {raw} in integer column {:?}",
                        column.name
                    )));
                }
                raw
            }
            ColumnType::FixedPoint => {
                let step = column.step();
                (raw / step).round() * step
            }
            ColumnType::Categorical => unreachable!("categoricals handled by caller"),
        };
        let bound = self.profile.plain_bound();
        if encoded.abs() > bound {
            return Err(PipelineError::EncodingOverflow {
                column: column.name.clone(),
                value: raw,
                bound,
            });
        }
        Ok(encoded)
    }
}

fn cell_as_f64(column: &Column, value: &Value) -> PipelineResult<f64> {
    match value {
        Value::Number(n) => n.as_f64().ok_or_else(|| {
            PipelineError::InvalidTable(format!(
                "unrepresentable number in column {:?}",
                column.name
            ))
        }),
        Value::String(s) => s.parse::<f64>().map_err(|_| {
            PipelineError::InvalidTable(format!(
                "non-numeric value {s:?} in numeric column {:?}",
                column.name
            ))
        }),
        other => Err(PipelineError::InvalidTable(format!(
            "unsupported cell {other} in numeric column {:?}",
            column.name
        ))),
    }
}

fn cell_as_str(column: &Column, value: &Value) -> PipelineResult<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(PipelineError::InvalidTable(format!(
            "unsupported cell {other} in categorical column {:?}",
            column.name
        ))),
    }
}

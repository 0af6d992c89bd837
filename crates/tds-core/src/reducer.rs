//! Reducer specifications for the group-by driver
//!
//! A reducer is configuration, not code: the group-by driver instantiates a
//! fresh reducer per group from a [`ReducerSpec`], loaded from a YAML file
//! (`-f FILE`) or the `-C name[:column]` shorthand. The concrete
//! implementations and the factory live in `tds-tx`.

use serde::{Deserialize, Serialize};

use crate::error::TdsError;

/// Declarative description of a per-group reducer.
///
/// # Example YAML
///
/// ```yaml
/// type: mean
/// column: delay
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ReducerSpec {
    /// Emit one row per group holding the row count in column `n`.
    Count,

    /// Emit one row with the sum of a numeric column, as column `sum`.
    Sum { column: String },

    /// Emit one row with mean and count of a numeric column, as columns
    /// `mean` and `n`.
    Mean { column: String },

    /// Emit one row with the minimum of a column under numeric order, as
    /// column `min`.
    Min { column: String },

    /// Emit one row with the maximum of a column under numeric order, as
    /// column `max`.
    Max { column: String },

    /// Emit the first row of each group unchanged.
    First,

    /// Emit the last row of each group unchanged.
    Last,

    /// Emit every row of each group unchanged.
    Identity,
}

impl ReducerSpec {
    /// Parse the `-C` shorthand: a reducer name, optionally `:column` for
    /// the reducers that take one.
    pub fn parse_code(code: &str) -> Result<Self, TdsError> {
        let (name, column) = match code.split_once(':') {
            Some((name, column)) if !column.is_empty() => (name, Some(column)),
            Some(_) => {
                return Err(TdsError::Config(format!(
                    "reducer code {code:?} has an empty column"
                )))
            }
            None => (code, None),
        };
        let need = |what: &str| -> Result<String, TdsError> {
            column.map(str::to_string).ok_or_else(|| {
                TdsError::Config(format!("reducer {what} needs a column, e.g. {what}:amount"))
            })
        };
        match name {
            "count" => Ok(Self::Count),
            "sum" => Ok(Self::Sum { column: need("sum")? }),
            "mean" => Ok(Self::Mean { column: need("mean")? }),
            "min" => Ok(Self::Min { column: need("min")? }),
            "max" => Ok(Self::Max { column: need("max")? }),
            "first" => Ok(Self::First),
            "last" => Ok(Self::Last),
            "identity" => Ok(Self::Identity),
            other => Err(TdsError::Config(format!("unknown reducer {other:?}"))),
        }
    }

    /// Shorthand rendering, for provenance comments.
    pub fn describe(&self) -> String {
        match self {
            Self::Count => "count".into(),
            Self::Sum { column } => format!("sum:{column}"),
            Self::Mean { column } => format!("mean:{column}"),
            Self::Min { column } => format!("min:{column}"),
            Self::Max { column } => format!("max:{column}"),
            Self::First => "first".into(),
            Self::Last => "last".into(),
            Self::Identity => "identity".into(),
        }
    }
}

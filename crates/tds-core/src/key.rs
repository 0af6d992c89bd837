//! Sort keys: per-column comparator and direction
//!
//! A [`KeySpec`] is the parsed form of the interspersed key arguments the
//! tools accept (`-n cid -N cname`): an ordered list of columns, each with
//! its own comparator (lexical or numeric) and direction. Specs are resolved
//! against a schema exactly once, at operator setup, into a [`ResolvedKey`]
//! holding integer indices; per-row comparison never touches column names.

use std::cmp::Ordering;

use crate::error::TdsError;
use crate::schema::Schema;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Lexical,
    Numeric,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

/// One key column with its comparison rules.
#[derive(Debug, Clone)]
pub struct KeyColumn {
    pub name: String,
    pub comparator: Comparator,
    pub direction: Direction,
}

/// An ordered list of key columns. Earlier columns dominate; remaining ties
/// are left to the caller (sort and merge preserve input order).
#[derive(Debug, Clone)]
pub struct KeySpec {
    columns: Vec<KeyColumn>,
}

impl KeySpec {
    pub fn new(columns: Vec<KeyColumn>) -> Result<Self, TdsError> {
        if columns.is_empty() {
            return Err(TdsError::Config("no key columns given".into()));
        }
        Ok(Self { columns })
    }

    /// Shorthand for a single ascending lexical column.
    pub fn lexical(name: impl Into<String>) -> Self {
        Self {
            columns: vec![KeyColumn {
                name: name.into(),
                comparator: Comparator::Lexical,
                direction: Direction::Ascending,
            }],
        }
    }

    /// Parse interspersed key arguments.
    ///
    /// `-n`/`-N` select numeric/lexical and `-r`/`-R` descending/ascending
    /// for the column names that follow, so `-n cid -N -r cname` sorts
    /// `cid` numerically ascending, then `cname` lexically descending.
    pub fn parse<I, S>(args: I) -> Result<Self, TdsError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut comparator = Comparator::Lexical;
        let mut direction = Direction::Ascending;
        let mut columns = Vec::new();
        for arg in args {
            match arg.as_ref() {
                "-n" => comparator = Comparator::Numeric,
                "-N" => comparator = Comparator::Lexical,
                "-r" => direction = Direction::Descending,
                "-R" => direction = Direction::Ascending,
                flag if flag.starts_with('-') && flag.len() > 1 => {
                    return Err(TdsError::Config(format!("unknown key flag {flag:?}")));
                }
                name => columns.push(KeyColumn {
                    name: name.to_string(),
                    comparator,
                    direction,
                }),
            }
        }
        Self::new(columns)
    }

    pub fn columns(&self) -> &[KeyColumn] {
        &self.columns
    }

    /// Column names in key order, for building join output schemas.
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Render the spec the way it was given, for provenance comments.
    pub fn describe(&self) -> String {
        let mut out = Vec::new();
        let mut comparator = Comparator::Lexical;
        let mut direction = Direction::Ascending;
        for col in &self.columns {
            if col.comparator != comparator {
                comparator = col.comparator;
                out.push(match comparator {
                    Comparator::Numeric => "-n",
                    Comparator::Lexical => "-N",
                });
            }
            if col.direction != direction {
                direction = col.direction;
                out.push(match direction {
                    Direction::Descending => "-r",
                    Direction::Ascending => "-R",
                });
            }
            out.push(&col.name);
        }
        out.join(" ")
    }

    /// Fix column positions against a schema.
    pub fn resolve(&self, schema: &Schema) -> Result<ResolvedKey, TdsError> {
        let mut columns = Vec::with_capacity(self.columns.len());
        for col in &self.columns {
            columns.push((schema.require_col(&col.name)?, col.clone()));
        }
        Ok(ResolvedKey { columns })
    }
}

/// A key spec bound to a schema: all per-row access goes through the
/// precomputed indices.
#[derive(Debug, Clone)]
pub struct ResolvedKey {
    columns: Vec<(usize, KeyColumn)>,
}

impl ResolvedKey {
    /// Compare two rows under the spec. Columns apply in order; the first
    /// non-equal column decides.
    pub fn compare(&self, a: &[String], b: &[String]) -> Ordering {
        for (idx, col) in &self.columns {
            let ord = match col.comparator {
                Comparator::Lexical => a[*idx].cmp(&b[*idx]),
                Comparator::Numeric => numeric_cmp(&a[*idx], &b[*idx]),
            };
            let ord = match col.direction {
                Direction::Ascending => ord,
                Direction::Descending => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    /// Compare rows from two differently-shaped streams sharing this key
    /// spec: `self` indexes `a`, `other` indexes `b`. Used by merge-join,
    /// where the key columns sit at different positions on each side.
    pub fn compare_across(&self, a: &[String], other: &ResolvedKey, b: &[String]) -> Ordering {
        for ((ai, col), (bi, _)) in self.columns.iter().zip(&other.columns) {
            let ord = match col.comparator {
                Comparator::Lexical => a[*ai].cmp(&b[*bi]),
                Comparator::Numeric => numeric_cmp(&a[*ai], &b[*bi]),
            };
            let ord = match col.direction {
                Direction::Ascending => ord,
                Direction::Descending => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    /// Name of the first column on which the rows differ, for ordering
    /// error messages.
    pub fn deciding_column(&self, a: &[String], b: &[String]) -> Option<&str> {
        for (idx, col) in &self.columns {
            let ord = match col.comparator {
                Comparator::Lexical => a[*idx].cmp(&b[*idx]),
                Comparator::Numeric => numeric_cmp(&a[*idx], &b[*idx]),
            };
            if ord != Ordering::Equal {
                return Some(&col.name);
            }
        }
        None
    }

    /// Project a row onto the key columns.
    pub fn project<'r>(&self, row: &'r [String]) -> Vec<&'r str> {
        self.columns.iter().map(|(i, _)| row[*i].as_str()).collect()
    }

    pub fn indices(&self) -> Vec<usize> {
        self.columns.iter().map(|(i, _)| *i).collect()
    }
}

/// Total numeric order over string fields: unparsable fields (nulls
/// included) sort before every number and compare bytewise among
/// themselves.
pub fn numeric_cmp(a: &str, b: &str) -> Ordering {
    match (a.parse::<f64>(), b.parse::<f64>()) {
        (Ok(x), Ok(y)) => x.total_cmp(&y),
        (Ok(_), Err(_)) => Ordering::Greater,
        (Err(_), Ok(_)) => Ordering::Less,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

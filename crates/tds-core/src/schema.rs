//! Stream schema and the flat-text wire codec
//!
//! Every TDS stream opens with a header line declaring its field separator
//! and column names:
//!
//! ```text
//! #tds -F C cid cname
//! 10,pascal
//! 11,numanal
//! # a comment, preserved verbatim
//! ```
//!
//! [`Schema`] owns both sides of the codec: parsing and formatting the
//! header line, splitting and joining rows, and the field-safing rules that
//! keep embedded separator characters from corrupting arity. Rows travel
//! in memory as plain `Vec<String>`; the empty-value token (default `-`)
//! exists only on the wire, with the empty string as the in-memory null.

use std::borrow::Cow;

use crate::error::TdsError;

/// Reserved first token of every header line.
pub const STREAM_MARKER: &str = "#tds";

/// Lines starting with this character (other than the header) are comments.
pub const COMMENT_PREFIX: char = '#';

/// Wire rendering of a null field unless the header overrides it.
pub const DEFAULT_EMPTY: &str = "-";

/// Field separator codes, as written in the header after `-F`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Separator {
    /// No code given: whitespace runs on read, a single tab on write.
    Default,
    /// `D`: single tab.
    Tab,
    /// `S`: single space.
    Space,
    /// `s`: one or more spaces on read, a single space on write.
    Spaces,
    /// `t`: literal tab.
    TabChar,
    /// `C`: comma; line-based, no quoting.
    Comma,
    /// `W`: any whitespace run. Read only; writes fall back to one space.
    Whitespace,
}

impl Separator {
    /// Parse a header separator code.
    pub fn from_code(code: &str) -> Result<Self, TdsError> {
        match code {
            "D" => Ok(Self::Tab),
            "S" => Ok(Self::Space),
            "s" => Ok(Self::Spaces),
            "t" => Ok(Self::TabChar),
            "C" => Ok(Self::Comma),
            "W" => Ok(Self::Whitespace),
            other => Err(TdsError::Schema(format!(
                "unknown field separator code {other:?}"
            ))),
        }
    }

    /// The code written back into a header, if any.
    pub fn code(&self) -> Option<char> {
        match self {
            Self::Default => None,
            Self::Tab => Some('D'),
            Self::Space => Some('S'),
            Self::Spaces => Some('s'),
            Self::TabChar => Some('t'),
            Self::Comma => Some('C'),
            Self::Whitespace => Some('W'),
        }
    }

    /// Separator emitted between fields on write.
    fn write_str(&self) -> &'static str {
        match self {
            Self::Default | Self::Tab | Self::TabChar => "\t",
            Self::Space | Self::Spaces | Self::Whitespace => " ",
            Self::Comma => ",",
        }
    }

    /// Split one data line into raw fields.
    fn split<'a>(&self, line: &'a str) -> Vec<&'a str> {
        match self {
            Self::Default | Self::Whitespace => line.split_whitespace().collect(),
            Self::Spaces => line.split(' ').filter(|f| !f.is_empty()).collect(),
            Self::Tab | Self::TabChar => line.split('\t').collect(),
            Self::Space => line.split(' ').collect(),
            Self::Comma => line.split(',').collect(),
        }
    }

    /// Whether `c` would be (mis)read as a separator inside a field.
    ///
    /// Safing is governed by the read side: the default separator writes
    /// tabs but reads any whitespace, so any whitespace inside a field
    /// breaks round-trip.
    fn hazard(&self, c: char) -> bool {
        match self {
            Self::Default | Self::Whitespace => c.is_whitespace(),
            Self::Spaces | Self::Space => c == ' ' || c == '\n' || c == '\r',
            Self::Tab | Self::TabChar => c == '\t' || c == '\n' || c == '\r',
            Self::Comma => c == ',' || c == '\n' || c == '\r',
        }
    }
}

/// The declaration a stream's header carries: separator code, ordered
/// column names, and the empty-value token.
///
/// Two streams are compatible when separator and columns agree; the empty
/// token is a rendering concern and does not affect compatibility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    separator: Separator,
    columns: Vec<String>,
    empty: String,
}

impl Schema {
    /// Build a schema, rejecting duplicate or empty column names.
    pub fn new<S: Into<String>>(
        separator: Separator,
        columns: Vec<S>,
    ) -> Result<Self, TdsError> {
        let columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        if columns.is_empty() {
            return Err(TdsError::Schema("header declares no columns".into()));
        }
        for (i, c) in columns.iter().enumerate() {
            if c.is_empty() {
                return Err(TdsError::Schema("empty column name".into()));
            }
            if columns[..i].contains(c) {
                return Err(TdsError::Schema(format!("duplicate column {c:?}")));
            }
        }
        Ok(Self {
            separator,
            columns,
            empty: DEFAULT_EMPTY.to_string(),
        })
    }

    /// Replace the empty-value token (`-E` in the header).
    pub fn with_empty(mut self, token: impl Into<String>) -> Self {
        self.empty = token.into();
        self
    }

    pub fn separator(&self) -> Separator {
        self.separator
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn empty_token(&self) -> &str {
        &self.empty
    }

    /// Number of fields every row must carry.
    pub fn arity(&self) -> usize {
        self.columns.len()
    }

    /// Position of a column, if declared.
    pub fn col_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Position of a column that must exist.
    pub fn require_col(&self, name: &str) -> Result<usize, TdsError> {
        self.col_index(name).ok_or_else(|| {
            TdsError::Schema(format!(
                "no column {name:?} in [{}]",
                self.columns.join(", ")
            ))
        })
    }

    /// Separator and column list agree; merge and concat require this.
    pub fn compatible(&self, other: &Schema) -> bool {
        self.separator == other.separator && self.columns == other.columns
    }

    /// True for any non-header line that carries no row semantics.
    pub fn is_comment(line: &str) -> bool {
        line.starts_with(COMMENT_PREFIX)
    }

    /// Parse a header line: `#tds [-F code] [-E token] col1 ... colN`.
    ///
    /// The header itself is always whitespace-separated regardless of the
    /// separator it declares for the data rows.
    pub fn parse_header(line: &str) -> Result<Self, TdsError> {
        let mut tokens = line.split_whitespace();
        match tokens.next() {
            Some(STREAM_MARKER) => {}
            _ => {
                return Err(TdsError::Schema(format!(
                    "not a stream header (expected {STREAM_MARKER}): {line:?}"
                )))
            }
        }
        let mut separator = Separator::Default;
        let mut empty: Option<String> = None;
        let mut columns: Vec<&str> = Vec::new();
        while let Some(tok) = tokens.next() {
            match tok {
                "-F" if columns.is_empty() => {
                    let code = tokens.next().ok_or_else(|| {
                        TdsError::Schema("header -F without a code".into())
                    })?;
                    separator = Separator::from_code(code)?;
                }
                "-E" if columns.is_empty() => {
                    let tok = tokens.next().ok_or_else(|| {
                        TdsError::Schema("header -E without a token".into())
                    })?;
                    empty = Some(tok.to_string());
                }
                _ => columns.push(tok),
            }
        }
        let mut schema = Schema::new(separator, columns)?;
        if let Some(empty) = empty {
            schema = schema.with_empty(empty);
        }
        Ok(schema)
    }

    /// Render the header line, without a trailing newline.
    pub fn header_line(&self) -> String {
        let mut line = String::from(STREAM_MARKER);
        if let Some(code) = self.separator.code() {
            line.push_str(" -F ");
            line.push(code);
        }
        if self.empty != DEFAULT_EMPTY {
            line.push_str(" -E ");
            line.push_str(&self.empty);
        }
        for col in &self.columns {
            line.push(' ');
            line.push_str(col);
        }
        line
    }

    /// Split a data line into a row, mapping the empty token to the
    /// in-memory null and enforcing arity.
    pub fn parse_row(&self, line: &str) -> Result<Vec<String>, TdsError> {
        let fields = self.separator.split(line);
        if fields.len() != self.arity() {
            return Err(TdsError::Schema(format!(
                "row has {} fields, header declares {}: {line:?}",
                fields.len(),
                self.arity()
            )));
        }
        Ok(fields
            .into_iter()
            .map(|f| {
                if f == self.empty {
                    String::new()
                } else {
                    f.to_string()
                }
            })
            .collect())
    }

    /// Join a row into a data line, safing fields and rendering nulls as
    /// the empty token. Arity mismatches are the writer's fault and fatal.
    pub fn format_row(&self, row: &[String]) -> Result<String, TdsError> {
        if row.len() != self.arity() {
            return Err(TdsError::Schema(format!(
                "writer produced {} fields, header declares {}",
                row.len(),
                self.arity()
            )));
        }
        let sep = self.separator.write_str();
        let mut line = String::new();
        for (i, field) in row.iter().enumerate() {
            if i > 0 {
                line.push_str(sep);
            }
            line.push_str(&self.safe_field(field));
        }
        Ok(line)
    }

    /// Rewrite a field so the read side cannot split it: runs of separator
    /// characters (and newlines) collapse to the empty token, and a null
    /// field becomes the token itself.
    pub fn safe_field<'a>(&'a self, field: &'a str) -> Cow<'a, str> {
        if field.is_empty() {
            return Cow::Borrowed(&self.empty);
        }
        if !field.chars().any(|c| self.separator.hazard(c)) {
            return Cow::Borrowed(field);
        }
        let mut safe = String::with_capacity(field.len());
        let mut in_run = false;
        for c in field.chars() {
            if self.separator.hazard(c) {
                if !in_run {
                    safe.push_str(&self.empty);
                    in_run = true;
                }
            } else {
                safe.push(c);
                in_run = false;
            }
        }
        Cow::Owned(safe)
    }
}

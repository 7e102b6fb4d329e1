//! SQL statement frames
//!
//! A statement travels as its `?`-template plus typed parameters:
//!
//! ```text
//! SqlStatement { statement = 1 (string), parameters = 2 (repeated SqlParameter) }
//! SqlParameter { string = 1, integer = 2 (uint64), double = 3 (fixed64),
//!                blob = 4, null = 5 (bool) }
//! ```

use sigbak_core::{SigbakError, SigbakResult};

use crate::wire::{fields, FieldWriter};

const STATEMENT: u32 = 1;
const PARAMETERS: u32 = 2;

const PARAM_STRING: u32 = 1;
const PARAM_INTEGER: u32 = 2;
const PARAM_DOUBLE: u32 = 3;
const PARAM_BLOB: u32 = 4;
const PARAM_NULL: u32 = 5;

#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Text(String),
    Integer(i64),
    Double(f64),
    Blob(Vec<u8>),
    Null,
}

impl SqlParam {
    fn decode(buf: &[u8]) -> SigbakResult<Self> {
        // The last recognised field wins; an empty parameter is NULL.
        let mut param = SqlParam::Null;
        for field in fields(buf) {
            let field = field?;
            param = match (field.number, field.value) {
                (PARAM_STRING, v) => SqlParam::Text(v.as_string().ok_or_else(|| bad(PARAM_STRING))?),
                (PARAM_INTEGER, v) => SqlParam::Integer(v.as_u64().ok_or_else(|| bad(PARAM_INTEGER))? as i64),
                (PARAM_DOUBLE, v) => SqlParam::Double(v.as_f64().ok_or_else(|| bad(PARAM_DOUBLE))?),
                (PARAM_BLOB, v) => SqlParam::Blob(v.as_bytes().ok_or_else(|| bad(PARAM_BLOB))?.to_vec()),
                (PARAM_NULL, _) => SqlParam::Null,
                (other, _) => {
                    tracing::trace!(field = other, "ignoring unknown SqlParameter field");
                    param
                }
            };
        }
        Ok(param)
    }

    fn encode(&self) -> Vec<u8> {
        let mut w = FieldWriter::new();
        match self {
            SqlParam::Text(s) => w.string(PARAM_STRING, s),
            SqlParam::Integer(i) => w.varint(PARAM_INTEGER, *i as u64),
            SqlParam::Double(d) => w.fixed64(PARAM_DOUBLE, d.to_le_bytes()),
            SqlParam::Blob(b) => w.bytes(PARAM_BLOB, b),
            SqlParam::Null => w.bool(PARAM_NULL, true),
        };
        w.finish()
    }

    /// SQL literal for this value.
    pub fn to_sql_literal(&self) -> String {
        match self {
            SqlParam::Text(s) => format!("'{}'", s.replace('\'', "''")),
            SqlParam::Integer(i) => i.to_string(),
            SqlParam::Double(d) => format_double(*d),
            SqlParam::Blob(b) => format!("X'{}'", hex::encode_upper(b)),
            SqlParam::Null => "NULL".to_string(),
        }
    }
}

fn bad(field: u32) -> SigbakError {
    SigbakError::ParseFailure(format!("SqlParameter field {field} has the wrong wire type"))
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlStatementFrame {
    pub statement: String,
    pub parameters: Vec<SqlParam>,
}

impl SqlStatementFrame {
    pub fn new(statement: impl Into<String>, parameters: Vec<SqlParam>) -> Self {
        Self {
            statement: statement.into(),
            parameters,
        }
    }

    pub fn decode(buf: &[u8]) -> SigbakResult<Self> {
        let mut frame = Self::default();
        for field in fields(buf) {
            let field = field?;
            match field.number {
                STATEMENT => {
                    frame.statement = field.value.as_string().ok_or_else(|| {
                        SigbakError::ParseFailure("statement is not length-delimited".into())
                    })?
                }
                PARAMETERS => {
                    let bytes = field.value.as_bytes().ok_or_else(|| {
                        SigbakError::ParseFailure("parameter is not length-delimited".into())
                    })?;
                    frame.parameters.push(SqlParam::decode(bytes)?);
                }
                other => tracing::trace!(field = other, "ignoring unknown SqlStatement field"),
            }
        }
        Ok(frame)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = FieldWriter::new();
        w.string(STATEMENT, &self.statement);
        for param in &self.parameters {
            w.bytes(PARAMETERS, &param.encode());
        }
        w.finish()
    }

    /// The statement with every `?` replaced by its parameter as a literal.
    ///
    /// Returns an empty string when the placeholder and parameter counts
    /// disagree.
    pub fn build_statement(&self) -> String {
        if self.parameters.is_empty() {
            return self.statement.clone();
        }

        let placeholders = self.statement.matches('?').count();
        if placeholders != self.parameters.len() {
            tracing::warn!(
                statement = %self.statement,
                placeholders,
                parameters = self.parameters.len(),
                "placeholder count does not match parameter count"
            );
            return String::new();
        }

        let mut out = String::with_capacity(self.statement.len() + 16 * placeholders);
        let mut rest = self.statement.as_str();
        for param in &self.parameters {
            let Some(pos) = rest.find('?') else {
                return String::new();
            };
            out.push_str(&rest[..pos]);
            out.push_str(&param.to_sql_literal());
            rest = &rest[pos + 1..];
        }
        out.push_str(rest);
        out
    }

    /// Table named by a `CREATE TABLE` or `INSERT INTO` statement.
    pub fn table_name(&self) -> Option<&str> {
        let upper = self.statement.get(..12)?.to_ascii_uppercase();
        let rest = if upper.starts_with("CREATE TABLE") {
            &self.statement[12..]
        } else if upper.starts_with("INSERT INTO") {
            &self.statement[11..]
        } else {
            return None;
        };
        rest.trim_start()
            .split(|c: char| c.is_whitespace() || c == '(')
            .next()
            .map(|name| name.trim_matches(|c| c == '"' || c == '`' || c == '\''))
            .filter(|name| !name.is_empty())
    }

    pub fn is_create_table(&self) -> bool {
        self.statement
            .get(..12)
            .is_some_and(|s| s.eq_ignore_ascii_case("CREATE TABLE"))
    }

    /// SQLite's own bookkeeping tables cannot be created by hand.
    pub fn creates_internal_table(&self) -> bool {
        self.is_create_table() && self.table_name().is_some_and(|t| t.starts_with("sqlite_"))
    }
}

/// Format a double like C's `%.17g`, always with a period.
pub fn format_double(value: f64) -> String {
    const PRECISION: i32 = 17;

    if value.is_nan() {
        return "nan".into();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf".into() } else { "-inf".into() };
    }

    let sci = format!("{:.*e}", (PRECISION - 1) as usize, value);
    let (mantissa, exponent) = match sci.split_once('e') {
        Some((m, e)) => (m, e.parse::<i32>().unwrap_or(0)),
        None => (sci.as_str(), 0),
    };

    if (-4..PRECISION).contains(&exponent) {
        let fixed = format!("{:.*}", (PRECISION - 1 - exponent) as usize, value);
        trim_fraction(&fixed).to_string()
    } else {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{}e{sign}{:02}", trim_fraction(mantissa), exponent.abs())
    }
}

fn trim_fraction(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}

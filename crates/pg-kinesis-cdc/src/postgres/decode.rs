//! Parser for the `test_decoding` output plugin.
//!
//! One WAL message is one line of text: either a transaction marker
//! (`BEGIN 693` / `COMMIT 693`) or a row change:
//!
//! ```text
//! table public.users: INSERT: id[integer]:7 name[text]:'a'
//! table public.users: UPDATE: old-key: id[integer]:1 new-tuple: id[integer]:1 name[text]:'b'
//! table public.users: DELETE: id[integer]:1
//! ```
//!
//! Parsing is two-phase so that filtered-out tables never pay for a
//! column scan: [`parse_prelude`] extracts the operation and relation
//! only; [`parse_columns`] walks the column data and is invoked solely
//! for events the filter keeps.
//!
//! Values may be quoted (`'...'` with `''` escapes) or bare tokens; type
//! annotations sit in brackets and may themselves contain brackets
//! (`tags[integer[]]`). Identifiers may be double-quoted. `old-key:` and
//! `new-tuple:` switch the target tuple inside UPDATE messages;
//! `(no-tuple-data)` stands for a DELETE without a replica identity.

use crate::common::{ColumnValue, Operation, RowChange};
use thiserror::Error;

/// Parse failure; the driver wraps it with the original payload.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct DecodeError {
    message: String,
}

impl DecodeError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Result of the first parse phase.
#[derive(Debug, PartialEq, Eq)]
pub enum Prelude<'a> {
    /// Transaction start marker; dropped before filtering.
    Begin,
    /// Transaction commit marker; dropped before filtering.
    Commit,
    /// A row change on `relation`.
    Row(RowPrelude<'a>),
}

/// Operation and relation of a row change, with the unparsed column data.
#[derive(Debug, PartialEq, Eq)]
pub struct RowPrelude<'a> {
    pub op: Operation,
    /// Schema-qualified relation exactly as printed by the plugin
    /// (quoted identifiers keep their quotes).
    pub relation: &'a str,
    columns: &'a str,
}

/// Extract operation and relation without scanning column data.
pub fn parse_prelude(payload: &str) -> Result<Prelude<'_>, DecodeError> {
    let payload = payload.trim_end();

    if payload == "BEGIN" || payload.starts_with("BEGIN ") {
        return Ok(Prelude::Begin);
    }
    if payload == "COMMIT" || payload.starts_with("COMMIT ") {
        return Ok(Prelude::Commit);
    }

    let rest = payload
        .strip_prefix("table ")
        .ok_or_else(|| DecodeError::new("expected a transaction marker or a table change"))?;

    // The relation may contain quoted identifiers with embedded colons;
    // the terminating colon is the first one outside double quotes.
    let mut in_quotes = false;
    let mut relation_end = None;
    for (i, b) in rest.bytes().enumerate() {
        match b {
            b'"' => in_quotes = !in_quotes,
            b':' if !in_quotes => {
                relation_end = Some(i);
                break;
            }
            _ => {}
        }
    }
    let relation_end =
        relation_end.ok_or_else(|| DecodeError::new("missing ':' after relation name"))?;
    let relation = &rest[..relation_end];
    if relation.is_empty() {
        return Err(DecodeError::new("empty relation name"));
    }

    let after_relation = rest[relation_end + 1..].trim_start();
    let op_end = after_relation
        .find(':')
        .ok_or_else(|| DecodeError::new("missing ':' after operation"))?;
    let op = match &after_relation[..op_end] {
        "INSERT" => Operation::Insert,
        "UPDATE" => Operation::Update,
        "DELETE" => Operation::Delete,
        other => {
            return Err(DecodeError::new(format!(
                "unsupported operation {other:?}"
            )))
        }
    };

    Ok(Prelude::Row(RowPrelude {
        op,
        relation,
        columns: after_relation[op_end + 1..].trim_start(),
    }))
}

/// Parse the column data of a row change. Only called for events the
/// table filter keeps.
pub fn parse_columns(prelude: &RowPrelude<'_>) -> Result<RowChange, DecodeError> {
    #[derive(Clone, Copy)]
    enum Target {
        Current,
        Old,
    }

    let mut row = RowChange::default();
    let mut target = Target::Current;
    let mut rest = prelude.columns;

    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            break;
        }

        if let Some(r) = rest.strip_prefix("old-key:") {
            target = Target::Old;
            rest = r;
            continue;
        }
        if let Some(r) = rest.strip_prefix("new-tuple:") {
            target = Target::Current;
            rest = r;
            continue;
        }
        if let Some(r) = rest.strip_prefix("(no-tuple-data)") {
            rest = r;
            continue;
        }

        let (name, value, r) = parse_column(rest)?;
        match target {
            Target::Current => row.current.insert(name, value),
            Target::Old => row.old.insert(name, value),
        };
        rest = r;
    }

    Ok(row)
}

/// Parse one `name[type]:value` column; returns the remainder.
fn parse_column(s: &str) -> Result<(String, ColumnValue, &str), DecodeError> {
    let (name, after_name) = if let Some(quoted) = s.strip_prefix('"') {
        let (name, rest) = scan_quoted(quoted, b'"')
            .ok_or_else(|| DecodeError::new("unterminated quoted column name"))?;
        (name, rest)
    } else {
        let bracket = s
            .find('[')
            .ok_or_else(|| DecodeError::new("missing '[' before column type"))?;
        (s[..bracket].to_string(), &s[bracket..])
    };
    if name.is_empty() {
        return Err(DecodeError::new("empty column name"));
    }

    let after_bracket = after_name
        .strip_prefix('[')
        .ok_or_else(|| DecodeError::new("missing '[' before column type"))?;
    // Array types print as e.g. `integer[]`; the annotation ends at the
    // first `]:` sequence, not the first `]`.
    let type_end = after_bracket
        .find("]:")
        .ok_or_else(|| DecodeError::new("missing ']:' after column type"))?;
    let sql_type = &after_bracket[..type_end];
    if sql_type.is_empty() {
        return Err(DecodeError::new("empty column type"));
    }

    let value_text = &after_bracket[type_end + 2..];
    if let Some(quoted) = value_text.strip_prefix('\'') {
        let (value, rest) = scan_quoted(quoted, b'\'')
            .ok_or_else(|| DecodeError::new("unterminated quoted value"))?;
        Ok((name, ColumnValue::new(value, sql_type, true), rest))
    } else {
        let end = value_text
            .find(' ')
            .unwrap_or(value_text.len());
        let value = &value_text[..end];
        if value.is_empty() {
            return Err(DecodeError::new("empty column value"));
        }
        Ok((
            name,
            ColumnValue::new(value, sql_type, false),
            &value_text[end..],
        ))
    }
}

/// Scan a quoted run starting just after the opening quote. A doubled
/// quote is an escaped literal. Returns the unescaped text and the
/// remainder after the closing quote.
fn scan_quoted(s: &str, quote: u8) -> Option<(String, &str)> {
    let bytes = s.as_bytes();
    let mut out = String::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == quote {
            if bytes.get(i + 1) == Some(&quote) {
                out.push(quote as char);
                i += 2;
                continue;
            }
            return Some((out, &s[i + 1..]));
        }
        let ch = s[i..].chars().next()?;
        out.push(ch);
        i += ch.len_utf8();
    }
    None
}

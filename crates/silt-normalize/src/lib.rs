//! Row normalization: turns loose raw records into the stable,
//! warehouse-safe shape declared by a source descriptor.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value as JsonValue;
use silt_core::{ColumnSpec, ColumnType, MissingPolicy, Record, SourceDescriptor, Value};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "silt-normalize";

#[derive(Debug, Error)]
pub enum RowError {
    #[error("required field {field} has no usable value")]
    MissingRequired { field: String },
    #[error("field {field}: cannot coerce {found} to {wanted}")]
    Coerce {
        field: String,
        found: &'static str,
        wanted: &'static str,
    },
    #[error("merge key {field} is null")]
    NullKeyField { field: String },
}

/// Target shape for one source's normalized records: declared columns,
/// rename map (keyed by normalized raw name), and merge key fields.
#[derive(Debug, Clone)]
pub struct RowShape {
    columns: Vec<ColumnSpec>,
    renames: Vec<(String, String)>,
    key_fields: Vec<String>,
}

impl RowShape {
    pub fn from_descriptor(descriptor: &SourceDescriptor) -> Self {
        Self {
            columns: descriptor.columns.clone(),
            renames: descriptor
                .renames
                .iter()
                .map(|(raw, col)| (normalize_field_name(raw), col.clone()))
                .collect(),
            key_fields: descriptor
                .key_fields()
                .map(<[String]>::to_vec)
                .unwrap_or_default(),
        }
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    fn column_name_for(&self, normalized_raw: &str) -> String {
        self.renames
            .iter()
            .find(|(raw, _)| raw == normalized_raw)
            .map(|(_, col)| col.clone())
            .unwrap_or_else(|| normalized_raw.to_string())
    }
}

/// Lower-case a raw field name and replace whitespace and hyphens with
/// underscores, satisfying warehouse identifier constraints.
pub fn normalize_field_name(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| {
            if c.is_whitespace() || c == '-' {
                '_'
            } else {
                c.to_ascii_lowercase()
            }
        })
        .collect()
}

/// Normalize one raw record against the shape. Malformed values in nullable
/// columns are replaced with the column's missing default and logged;
/// a required column that cannot be produced fails the row, as does a null
/// merge key.
pub fn normalize_record(raw: &Record, shape: &RowShape) -> Result<Record, RowError> {
    let mut staged = Record::new();
    for (name, value) in raw.iter() {
        let normalized = normalize_field_name(name);
        staged.insert(shape.column_name_for(&normalized), value.clone());
    }

    let mut out = Record::new();
    for column in &shape.columns {
        let value = match staged.remove(&column.name) {
            None => missing_value(column)?,
            Some(value) if is_absent(&value, column.column_type) => missing_value(column)?,
            Some(value) => match coerce(&value, column.column_type) {
                Ok(coerced) => coerced,
                Err(found) if column.nullable => {
                    warn!(
                        field = %column.name,
                        found,
                        wanted = type_label(column.column_type),
                        "malformed field value replaced with missing default"
                    );
                    missing_value(column)?
                }
                Err(found) => {
                    return Err(RowError::Coerce {
                        field: column.name.clone(),
                        found,
                        wanted: type_label(column.column_type),
                    })
                }
            },
        };
        out.insert(column.name.clone(), value);
    }

    for key in &shape.key_fields {
        if out.get(key).map(Value::is_null).unwrap_or(true) {
            return Err(RowError::NullKeyField { field: key.clone() });
        }
    }
    Ok(out)
}

/// Empty text counts as absent for every non-text column; for text columns
/// it is a legitimate value.
fn is_absent(value: &Value, target: ColumnType) -> bool {
    match value {
        Value::Null => true,
        Value::Text(s) if target != ColumnType::Text => s.trim().is_empty(),
        _ => false,
    }
}

fn missing_value(column: &ColumnSpec) -> Result<Value, RowError> {
    let value = match column.missing {
        MissingPolicy::Null => Value::Null,
        MissingPolicy::EmptyText => Value::Text(String::new()),
        MissingPolicy::False => Value::Bool(false),
    };
    if value.is_null() && !column.nullable {
        return Err(RowError::MissingRequired {
            field: column.name.clone(),
        });
    }
    Ok(value)
}

fn type_label(ty: ColumnType) -> &'static str {
    match ty {
        ColumnType::Bool => "bool",
        ColumnType::Int => "int",
        ColumnType::Float => "float",
        ColumnType::Text => "text",
        ColumnType::Timestamp => "timestamp",
        ColumnType::Date => "date",
        ColumnType::TextList => "text_list",
        ColumnType::Json => "json",
    }
}

/// Coerce a raw value into a column type. The error side carries the raw
/// type name for diagnostics; list/json targets never fail (defensive
/// decoding yields an empty list instead).
fn coerce(value: &Value, target: ColumnType) -> Result<Value, &'static str> {
    match target {
        ColumnType::Bool => coerce_bool(value),
        ColumnType::Int => coerce_int(value),
        ColumnType::Float => coerce_float(value),
        ColumnType::Text => Ok(coerce_text(value)),
        ColumnType::Timestamp => coerce_timestamp(value),
        ColumnType::Date => coerce_date(value),
        ColumnType::TextList => Ok(coerce_text_list(value)),
        ColumnType::Json => Ok(coerce_json(value)),
    }
}

fn coerce_bool(value: &Value) -> Result<Value, &'static str> {
    match value {
        Value::Bool(_) => Ok(value.clone()),
        Value::Text(s) => parse_bool_text(s)
            .map(Value::Bool)
            .ok_or(value.type_name()),
        _ => Err(value.type_name()),
    }
}

pub fn parse_bool_text(text: &str) -> Option<bool> {
    let trimmed = text.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        Some(true)
    } else if trimmed.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

/// Strip decorations seen around numeric text in the wild: surrounding
/// parentheses and thousands separators.
fn clean_numeric_text(text: &str) -> String {
    let trimmed = text.trim();
    let trimmed = trimmed
        .strip_prefix('(')
        .and_then(|t| t.strip_suffix(')'))
        .unwrap_or(trimmed);
    trimmed.replace(',', "")
}

fn coerce_int(value: &Value) -> Result<Value, &'static str> {
    match value {
        Value::Int(_) => Ok(value.clone()),
        Value::Float(f) if f.fract() == 0.0 => Ok(Value::Int(*f as i64)),
        Value::Text(s) => {
            let cleaned = clean_numeric_text(s);
            if let Ok(i) = cleaned.parse::<i64>() {
                return Ok(Value::Int(i));
            }
            match cleaned.parse::<f64>() {
                Ok(f) if f.fract() == 0.0 => Ok(Value::Int(f as i64)),
                _ => Err(value.type_name()),
            }
        }
        _ => Err(value.type_name()),
    }
}

fn coerce_float(value: &Value) -> Result<Value, &'static str> {
    match value {
        Value::Float(_) => Ok(value.clone()),
        Value::Int(i) => Ok(Value::Float(*i as f64)),
        Value::Text(s) => clean_numeric_text(s)
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| value.type_name()),
        _ => Err(value.type_name()),
    }
}

fn coerce_text(value: &Value) -> Value {
    match value {
        Value::Text(_) => value.clone(),
        Value::Bool(b) => Value::Text(b.to_string()),
        Value::Int(i) => Value::Text(i.to_string()),
        Value::Float(f) => Value::Text(f.to_string()),
        Value::Timestamp(ts) => Value::Text(ts.to_rfc3339()),
        Value::Date(d) => Value::Text(d.to_string()),
        Value::TextList(_) | Value::Json(_) | Value::Null => Value::Text(
            serde_json::to_string(value).unwrap_or_default(),
        ),
    }
}

fn coerce_timestamp(value: &Value) -> Result<Value, &'static str> {
    match value {
        Value::Timestamp(_) => Ok(value.clone()),
        Value::Text(s) => parse_timestamp_text(s)
            .map(Value::Timestamp)
            .ok_or(value.type_name()),
        _ => Err(value.type_name()),
    }
}

/// ISO-8601 with an explicit offset or a trailing `Z`; a bare
/// `YYYY-MM-DDTHH:MM:SS` (or space-separated) is taken as UTC.
pub fn parse_timestamp_text(text: &str) -> Option<DateTime<Utc>> {
    let trimmed = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc));
        }
    }
    None
}

fn coerce_date(value: &Value) -> Result<Value, &'static str> {
    match value {
        Value::Date(_) => Ok(value.clone()),
        Value::Timestamp(ts) => Ok(Value::Date(ts.date_naive())),
        Value::Text(s) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
            .map(Value::Date)
            .map_err(|_| value.type_name()),
        _ => Err(value.type_name()),
    }
}

fn coerce_text_list(value: &Value) -> Value {
    match value {
        Value::TextList(_) => value.clone(),
        Value::Text(s) => Value::TextList(
            decode_literal_list(s)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|item| match item {
                            JsonValue::String(s) => Some(s.clone()),
                            JsonValue::Number(n) => Some(n.to_string()),
                            JsonValue::Bool(b) => Some(b.to_string()),
                            _ => None,
                        })
                        .collect()
                })
                .unwrap_or_default(),
        ),
        Value::Json(JsonValue::Array(items)) => Value::TextList(
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect(),
        ),
        _ => Value::TextList(Vec::new()),
    }
}

fn coerce_json(value: &Value) -> Value {
    match value {
        Value::Json(_) => value.clone(),
        Value::TextList(items) => Value::Json(JsonValue::Array(
            items.iter().map(|s| JsonValue::String(s.clone())).collect(),
        )),
        Value::Text(s) => Value::Json(JsonValue::Array(
            decode_literal_list(s).unwrap_or_default(),
        )),
        _ => Value::Json(JsonValue::Array(Vec::new())),
    }
}

/// Decode a stringified list, accepting JSON first and a Python-style repr
/// (single quotes, `True`/`False`/`None`) as a fallback. `None` when the
/// text is not a list at all; callers substitute an empty list.
pub fn decode_literal_list(text: &str) -> Option<Vec<JsonValue>> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Some(Vec::new());
    }
    if let Ok(JsonValue::Array(items)) = serde_json::from_str(trimmed) {
        return Some(items);
    }
    if let Ok(JsonValue::Array(items)) = serde_json::from_str(&pythonish_to_json(trimmed)) {
        return Some(items);
    }
    None
}

/// Best-effort rewrite of a Python literal repr into JSON: single-quoted
/// strings become double-quoted, `True`/`False`/`None` become JSON
/// keywords. Anything it cannot rewrite simply fails the later JSON parse.
fn pythonish_to_json(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    let mut in_string = false;
    let mut quote = '\0';
    while let Some(c) = chars.next() {
        if in_string {
            if c == '\\' {
                out.push(c);
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            } else if c == quote {
                in_string = false;
                out.push('"');
            } else if c == '"' {
                out.push_str("\\\"");
            } else {
                out.push(c);
            }
            continue;
        }
        match c {
            '\'' | '"' => {
                in_string = true;
                quote = c;
                out.push('"');
            }
            _ if c.is_ascii_alphabetic() => {
                let mut word = String::new();
                word.push(c);
                while let Some(&next) = chars.peek() {
                    if next.is_ascii_alphanumeric() || next == '_' {
                        word.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match word.as_str() {
                    "True" => out.push_str("true"),
                    "False" => out.push_str("false"),
                    "None" => out.push_str("null"),
                    _ => out.push_str(&word),
                }
            }
            _ => out.push(c),
        }
    }
    out
}

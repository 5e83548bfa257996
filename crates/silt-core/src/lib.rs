//! Core domain model for silt: loosely-typed records, per-source column
//! shapes, and source descriptors.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "silt-core";

/// A single field value as read from a source or produced by normalization.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Date(NaiveDate),
    TextList(Vec<String>),
    Json(JsonValue),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Timestamp(_) => "timestamp",
            Value::Date(_) => "date",
            Value::TextList(_) => "text_list",
            Value::Json(_) => "json",
        }
    }
}

/// One row: an ordered mapping from field name to value. The field set is
/// fixed per source once normalized.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Record(BTreeMap<String, Value>);

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.0.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.0.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Record {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Warehouse-facing column type, pre-declared per source so that all-null
/// early batches cannot destabilize the destination schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Bool,
    Int,
    Float,
    Text,
    Timestamp,
    Date,
    TextList,
    Json,
}

/// What a normalized record carries when the raw row has no usable value.
/// Fixed per column, never inferred at runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingPolicy {
    #[default]
    Null,
    EmptyText,
    False,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default = "default_true")]
    pub nullable: bool,
    #[serde(default)]
    pub missing: MissingPolicy,
}

fn default_true() -> bool {
    true
}

/// Load mode for one source's destination table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum WriteDisposition {
    /// Rows are added without looking at prior contents; duplicates across
    /// runs are expected.
    Append,
    /// Prior table contents are discarded and rewritten each run.
    Replace,
    /// Rows are upserted by key; within one run the later record wins.
    Merge { key_fields: Vec<String> },
}

/// Pagination scheme for a JSON API source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Paging {
    #[default]
    Single,
    /// One request per id; `{id}` in the url is substituted. Both bounds
    /// inclusive.
    IdRange { start: u64, end: u64 },
}

/// Where the logical entities live inside a JSON response body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityShape {
    #[default]
    RootArray,
    /// Top-level object whose entries are the entities; the entry key is
    /// injected into each record under `key_field`.
    KeyedObject { key_field: String },
    SingleObject,
}

/// Pulls one field out of an entity by JSON pointer. With `item_pointer`
/// the pointer must target an array of objects and the projection yields a
/// text list with one element per item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Projection {
    pub field: String,
    pub pointer: String,
    #[serde(default)]
    pub item_pointer: Option<String>,
}

/// One extracted field of a scraped listing item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorField {
    pub field: String,
    pub selector: String,
    /// Attribute to read instead of the element text.
    #[serde(default)]
    pub attr: Option<String>,
}

/// How raw records are produced for one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReadStrategy {
    /// Header-carrying delimited text file under the staging directory.
    DelimitedFile { path: String },
    /// `SELECT *` over one table of the upstream relational database.
    PostgresTable { table: String },
    /// One or more JSON requests through the retrying fetcher.
    JsonApi {
        url: String,
        #[serde(default)]
        params: BTreeMap<String, String>,
        #[serde(default)]
        paging: Paging,
        #[serde(default)]
        entities: EntityShape,
        #[serde(default)]
        projections: Vec<Projection>,
        /// Header name to carry the source's API key, when it needs one.
        #[serde(default)]
        api_key_header: Option<String>,
    },
    /// Scraped search-results listing. Not restartable: two runs may see
    /// different site content.
    HtmlListing {
        url: String,
        base_url: String,
        #[serde(default = "default_page_param")]
        page_param: String,
        #[serde(default = "default_max_pages")]
        max_pages: u32,
        item_selector: String,
        fields: Vec<SelectorField>,
        /// Field used for within-run dedup by canonicalized item URL.
        link_field: String,
    },
}

fn default_page_param() -> String {
    "page".to_string()
}

fn default_max_pages() -> u32 {
    5
}

fn default_chunk_rows() -> usize {
    5_000
}

/// Static metadata describing how one external source is read and loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub name: String,
    /// Destination dataset (database) and table.
    pub dataset: String,
    pub table: String,
    pub strategy: ReadStrategy,
    pub disposition: WriteDisposition,
    pub columns: Vec<ColumnSpec>,
    /// Raw field name -> declared column name.
    #[serde(default)]
    pub renames: BTreeMap<String, String>,
    /// Stop reading after this many rows.
    #[serde(default)]
    pub row_limit: Option<u64>,
    #[serde(default = "default_chunk_rows")]
    pub chunk_rows: usize,
}

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("source {source}: no columns declared")]
    EmptyColumns { source: String },
    #[error("source {source}: column {column} declared twice")]
    DuplicateColumn { source: String, column: String },
    #[error("source {source}: merge disposition without key fields")]
    NoKeyFields { source: String },
    #[error("source {source}: key field {field} is not a declared column")]
    UnknownKeyField { source: String, field: String },
    #[error("source {source}: key field {field} must be declared non-nullable")]
    NullableKeyField { source: String, field: String },
    #[error("source {source}: rename target {field} is not a declared column")]
    UnknownRenameTarget { source: String, field: String },
}

impl SourceDescriptor {
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Key fields for merge-disposition sources, `None` otherwise.
    pub fn key_fields(&self) -> Option<&[String]> {
        match &self.disposition {
            WriteDisposition::Merge { key_fields } => Some(key_fields),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<(), DescriptorError> {
        if self.columns.is_empty() {
            return Err(DescriptorError::EmptyColumns {
                source: self.name.clone(),
            });
        }
        for (i, col) in self.columns.iter().enumerate() {
            if self.columns[..i].iter().any(|c| c.name == col.name) {
                return Err(DescriptorError::DuplicateColumn {
                    source: self.name.clone(),
                    column: col.name.clone(),
                });
            }
        }
        if let WriteDisposition::Merge { key_fields } = &self.disposition {
            if key_fields.is_empty() {
                return Err(DescriptorError::NoKeyFields {
                    source: self.name.clone(),
                });
            }
            for field in key_fields {
                match self.column(field) {
                    None => {
                        return Err(DescriptorError::UnknownKeyField {
                            source: self.name.clone(),
                            field: field.clone(),
                        })
                    }
                    Some(col) if col.nullable => {
                        return Err(DescriptorError::NullableKeyField {
                            source: self.name.clone(),
                            field: field.clone(),
                        })
                    }
                    Some(_) => {}
                }
            }
        }
        for target in self.renames.values() {
            if self.column(target).is_none() {
                return Err(DescriptorError::UnknownRenameTarget {
                    source: self.name.clone(),
                    field: target.clone(),
                });
            }
        }
        Ok(())
    }
}

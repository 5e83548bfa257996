//! Source readers: lazy, chunked raw-record sequences over delimited files,
//! Postgres tables, JSON APIs, and scraped HTML listings.

use std::collections::HashSet;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html, Selector};
use serde_json::Value as JsonValue;
use silt_core::{EntityShape, Paging, Projection, Record, SelectorField, Value};
use silt_staging::{FetchError, HttpFetcher};
use sqlx::postgres::{PgConnectOptions, PgRow};
use sqlx::types::BigDecimal;
use sqlx::{Column, Connection, PgConnection, Row, TypeInfo};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "silt-readers";

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error("invalid response body: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unexpected response shape: {0}")]
    Shape(String),
    #[error("invalid selector {selector}: {message}")]
    Selector { selector: String, message: String },
    #[error("column {column} has unsupported database type {type_name}")]
    UnsupportedColumn { column: String, type_name: String },
}

/// A lazy, finite sequence of raw records, pulled in bounded chunks.
/// Chunk boundaries are invisible to the loader.
#[async_trait]
pub trait SourceReader: Send {
    /// Next chunk of raw records; `None` once the source is exhausted.
    async fn next_chunk(&mut self) -> Result<Option<Vec<Record>>, ReadError>;

    /// Whether re-running this reader observes the same data.
    fn restartable(&self) -> bool {
        true
    }
}

/// Remaining row allowance under a descriptor's row-count ceiling.
#[derive(Debug, Clone, Copy)]
struct RowBudget {
    remaining: Option<u64>,
}

impl RowBudget {
    fn new(limit: Option<u64>) -> Self {
        Self { remaining: limit }
    }

    fn is_exhausted(&self) -> bool {
        matches!(self.remaining, Some(0))
    }

    /// Trim `rows` to the allowance and account for what passed through.
    fn admit(&mut self, rows: &mut Vec<Record>) {
        if let Some(remaining) = self.remaining.as_mut() {
            if (rows.len() as u64) > *remaining {
                rows.truncate(*remaining as usize);
            }
            *remaining -= rows.len() as u64;
        }
    }
}

fn non_empty(rows: Vec<Record>) -> Option<Vec<Record>> {
    if rows.is_empty() {
        None
    } else {
        Some(rows)
    }
}

// ---------------------------------------------------------------------------
// Delimited files

/// Streams a header-carrying delimited text file from the staging area, one
/// raw all-text record per line.
pub struct DelimitedFileReader {
    headers: Vec<String>,
    records: csv::StringRecordsIntoIter<std::fs::File>,
    chunk_rows: usize,
    budget: RowBudget,
}

impl DelimitedFileReader {
    pub fn open(
        path: &Path,
        chunk_rows: usize,
        row_limit: Option<u64>,
    ) -> Result<Self, ReadError> {
        if !path.exists() {
            return Err(ReadError::NotFound(path.display().to_string()));
        }
        let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
        let headers = reader.headers()?.iter().map(str::to_string).collect();
        Ok(Self {
            headers,
            records: reader.into_records(),
            chunk_rows: chunk_rows.max(1),
            budget: RowBudget::new(row_limit),
        })
    }
}

#[async_trait]
impl SourceReader for DelimitedFileReader {
    async fn next_chunk(&mut self) -> Result<Option<Vec<Record>>, ReadError> {
        if self.budget.is_exhausted() {
            return Ok(None);
        }
        let mut rows = Vec::with_capacity(self.chunk_rows);
        while rows.len() < self.chunk_rows {
            let Some(line) = self.records.next() else {
                break;
            };
            let line = line?;
            let record = self
                .headers
                .iter()
                .zip(line.iter())
                .map(|(name, field)| (name.clone(), Value::Text(field.to_string())))
                .collect();
            rows.push(record);
        }
        self.budget.admit(&mut rows);
        Ok(non_empty(rows))
    }
}

// ---------------------------------------------------------------------------
// Postgres tables

/// Connection parameters for the upstream relational database, passed in
/// explicitly so readers stay constructible from test fixtures.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub dbname: String,
}

impl PostgresConfig {
    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.dbname)
    }
}

/// Reads one table wholesale (`SELECT *`), decoding each column by its
/// database type. The connection is opened per run and released whether or
/// not iteration completes.
pub struct PostgresTableReader {
    config: PostgresConfig,
    table: String,
    chunk_rows: usize,
    budget: RowBudget,
    buffered: Option<std::vec::IntoIter<Record>>,
}

impl PostgresTableReader {
    pub fn new(
        config: PostgresConfig,
        table: impl Into<String>,
        chunk_rows: usize,
        row_limit: Option<u64>,
    ) -> Self {
        Self {
            config,
            table: table.into(),
            chunk_rows: chunk_rows.max(1),
            budget: RowBudget::new(row_limit),
            buffered: None,
        }
    }

    async fn fetch_all_rows(&mut self) -> Result<Vec<Record>, ReadError> {
        let mut conn = PgConnection::connect_with(&self.config.connect_options()).await?;
        let sql = format!("SELECT * FROM {}", quote_pg_identifier(&self.table));
        let result = sqlx::query(&sql).fetch_all(&mut conn).await;
        let closed = conn.close().await;
        let rows = result?;
        closed?;
        rows.iter().map(pg_row_to_record).collect()
    }
}

#[async_trait]
impl SourceReader for PostgresTableReader {
    async fn next_chunk(&mut self) -> Result<Option<Vec<Record>>, ReadError> {
        if self.buffered.is_none() {
            let rows = self.fetch_all_rows().await?;
            self.buffered = Some(rows.into_iter());
        }
        let buffered = self.buffered.as_mut().expect("buffer just filled");
        if self.budget.is_exhausted() {
            return Ok(None);
        }
        let mut rows: Vec<Record> = buffered.take(self.chunk_rows).collect();
        self.budget.admit(&mut rows);
        Ok(non_empty(rows))
    }
}

fn quote_pg_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn pg_row_to_record(row: &PgRow) -> Result<Record, ReadError> {
    let mut record = Record::new();
    for col in row.columns() {
        let idx = col.ordinal();
        let type_name = col.type_info().name();
        let value = match type_name {
            "BOOL" => row.try_get::<Option<bool>, _>(idx)?.map(Value::Bool),
            "INT2" => row
                .try_get::<Option<i16>, _>(idx)?
                .map(|v| Value::Int(v.into())),
            "INT4" => row
                .try_get::<Option<i32>, _>(idx)?
                .map(|v| Value::Int(v.into())),
            "INT8" => row.try_get::<Option<i64>, _>(idx)?.map(Value::Int),
            "FLOAT4" => row
                .try_get::<Option<f32>, _>(idx)?
                .map(|v| Value::Float(v.into())),
            "FLOAT8" => row.try_get::<Option<f64>, _>(idx)?.map(Value::Float),
            "NUMERIC" => row
                .try_get::<Option<BigDecimal>, _>(idx)?
                .and_then(|v| v.to_string().parse::<f64>().ok())
                .map(Value::Float),
            "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => row
                .try_get::<Option<String>, _>(idx)?
                .map(Value::Text),
            "TIMESTAMP" => row
                .try_get::<Option<chrono::NaiveDateTime>, _>(idx)?
                .map(|v| Value::Timestamp(DateTime::<Utc>::from_naive_utc_and_offset(v, Utc))),
            "TIMESTAMPTZ" => row
                .try_get::<Option<DateTime<Utc>>, _>(idx)?
                .map(Value::Timestamp),
            "DATE" => row
                .try_get::<Option<chrono::NaiveDate>, _>(idx)?
                .map(Value::Date),
            "UUID" => row
                .try_get::<Option<sqlx::types::Uuid>, _>(idx)?
                .map(|v| Value::Text(v.to_string())),
            "JSON" | "JSONB" => row
                .try_get::<Option<JsonValue>, _>(idx)?
                .map(Value::Json),
            other => {
                return Err(ReadError::UnsupportedColumn {
                    column: col.name().to_string(),
                    type_name: other.to_string(),
                })
            }
        };
        record.insert(col.name(), value.unwrap_or(Value::Null));
    }
    Ok(record)
}

// ---------------------------------------------------------------------------
// JSON APIs

/// Request/extraction settings for one JSON API source, with any API key
/// already resolved into a concrete header.
#[derive(Debug, Clone)]
pub struct JsonApiConfig {
    pub url: String,
    pub params: Vec<(String, String)>,
    pub paging: Paging,
    pub entities: EntityShape,
    pub projections: Vec<Projection>,
    pub headers: Vec<(String, String)>,
}

#[derive(Clone, Copy)]
enum ApiCursor {
    Pending,
    NextId(u64),
    Done,
}

/// Fetches one or more pages through the retrying fetcher and flattens each
/// logical entity into a raw record.
pub struct JsonApiReader {
    fetcher: HttpFetcher,
    source: String,
    config: JsonApiConfig,
    cursor: ApiCursor,
    chunk_rows: usize,
    budget: RowBudget,
    buffered: Vec<Record>,
}

impl JsonApiReader {
    pub fn new(
        fetcher: HttpFetcher,
        source: impl Into<String>,
        config: JsonApiConfig,
        chunk_rows: usize,
        row_limit: Option<u64>,
    ) -> Self {
        let cursor = match config.paging {
            Paging::Single => ApiCursor::Pending,
            Paging::IdRange { start, .. } => ApiCursor::NextId(start),
        };
        Self {
            fetcher,
            source: source.into(),
            config,
            cursor,
            chunk_rows: chunk_rows.max(1),
            budget: RowBudget::new(row_limit),
            buffered: Vec::new(),
        }
    }

    async fn fetch_json(&self, url: &str) -> Result<JsonValue, ReadError> {
        let response = self
            .fetcher
            .fetch_bytes(&self.source, url, &self.config.params, &self.config.headers)
            .await
            .map_err(|err| {
                if err.is_not_found() {
                    ReadError::NotFound(url.to_string())
                } else {
                    ReadError::Fetch(err)
                }
            })?;
        Ok(serde_json::from_slice(&response.body)?)
    }

    async fn fill_buffer(&mut self) -> Result<(), ReadError> {
        match self.cursor {
            ApiCursor::Done => {}
            ApiCursor::Pending => {
                let body = self.fetch_json(&self.config.url).await?;
                self.buffered =
                    entity_records(&body, &self.config.entities, &self.config.projections)?;
                self.cursor = ApiCursor::Done;
            }
            ApiCursor::NextId(next) => {
                let Paging::IdRange { end, .. } = &self.config.paging else {
                    unreachable!("id cursor only exists for id-range paging");
                };
                let end = *end;
                let mut id = next;
                while self.buffered.len() < self.chunk_rows && id <= end {
                    let url = self.config.url.replace("{id}", &id.to_string());
                    let body = self.fetch_json(&url).await?;
                    let records =
                        entity_records(&body, &self.config.entities, &self.config.projections)?;
                    self.buffered.extend(records);
                    id += 1;
                }
                self.cursor = if id > end {
                    ApiCursor::Done
                } else {
                    ApiCursor::NextId(id)
                };
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SourceReader for JsonApiReader {
    async fn next_chunk(&mut self) -> Result<Option<Vec<Record>>, ReadError> {
        if self.budget.is_exhausted() {
            return Ok(None);
        }
        if self.buffered.is_empty() {
            self.fill_buffer().await?;
        }
        let take = self.buffered.len().min(self.chunk_rows);
        let mut rows: Vec<Record> = self.buffered.drain(..take).collect();
        self.budget.admit(&mut rows);
        Ok(non_empty(rows))
    }
}

/// Split a JSON response body into one raw record per logical entity.
pub fn entity_records(
    body: &JsonValue,
    entities: &EntityShape,
    projections: &[Projection],
) -> Result<Vec<Record>, ReadError> {
    match entities {
        EntityShape::RootArray => {
            let items = body
                .as_array()
                .ok_or_else(|| ReadError::Shape("expected a top-level array".to_string()))?;
            Ok(items
                .iter()
                .map(|item| entity_record(item, projections))
                .collect())
        }
        EntityShape::KeyedObject { key_field } => {
            let entries = body
                .as_object()
                .ok_or_else(|| ReadError::Shape("expected a top-level object".to_string()))?;
            Ok(entries
                .iter()
                .map(|(key, value)| {
                    let mut record = entity_record(value, projections);
                    record.insert(key_field.clone(), Value::Text(key.clone()));
                    record
                })
                .collect())
        }
        EntityShape::SingleObject => Ok(vec![entity_record(body, projections)]),
    }
}

fn entity_record(entity: &JsonValue, projections: &[Projection]) -> Record {
    if projections.is_empty() {
        let mut record = Record::new();
        flatten_entity("", entity, &mut record);
        return record;
    }
    projections
        .iter()
        .map(|p| (p.field.clone(), project_value(entity, p)))
        .collect()
}

fn project_value(entity: &JsonValue, projection: &Projection) -> Value {
    let Some(target) = entity.pointer(&projection.pointer) else {
        return Value::Null;
    };
    match &projection.item_pointer {
        None => json_to_value(target),
        Some(item_pointer) => {
            let Some(items) = target.as_array() else {
                return Value::Null;
            };
            Value::TextList(
                items
                    .iter()
                    .filter_map(|item| item.pointer(item_pointer))
                    .filter_map(json_scalar_to_string)
                    .collect(),
            )
        }
    }
}

/// Flatten a JSON entity into a record: nested objects join path segments
/// with `_`, scalar arrays become text lists, object arrays stay JSON.
fn flatten_entity(prefix: &str, value: &JsonValue, record: &mut Record) {
    match value {
        JsonValue::Object(entries) => {
            for (key, nested) in entries {
                let name = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}_{key}")
                };
                match nested {
                    JsonValue::Object(_) => flatten_entity(&name, nested, record),
                    other => {
                        record.insert(name, json_to_value(other));
                    }
                }
            }
        }
        other => {
            let name = if prefix.is_empty() { "value" } else { prefix };
            record.insert(name, json_to_value(other));
        }
    }
}

fn json_to_value(value: &JsonValue) -> Value {
    match value {
        JsonValue::Null => Value::Null,
        JsonValue::Bool(b) => Value::Bool(*b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                Value::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        JsonValue::String(s) => Value::Text(s.clone()),
        JsonValue::Array(items) => {
            if items.iter().all(|i| !i.is_object() && !i.is_array()) {
                Value::TextList(items.iter().filter_map(json_scalar_to_string).collect())
            } else {
                Value::Json(value.clone())
            }
        }
        JsonValue::Object(_) => Value::Json(value.clone()),
    }
}

fn json_scalar_to_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Scraped HTML listings

/// Selector/extraction settings for one scraped listing source.
#[derive(Debug, Clone)]
pub struct HtmlListingConfig {
    pub url: String,
    pub base_url: String,
    pub page_param: String,
    pub max_pages: u32,
    pub item_selector: String,
    pub fields: Vec<SelectorField>,
    pub link_field: String,
}

/// Walks a paginated search-results listing, one page per chunk. Items are
/// deduplicated within the run by canonicalized URL, a broken item is
/// skipped rather than failing the run, and the page loop stops as soon as
/// a page contributes nothing new. No retries on this path, and two runs
/// may observe different site content.
pub struct HtmlListingReader {
    fetcher: HttpFetcher,
    source: String,
    config: HtmlListingConfig,
    page: u32,
    seen: HashSet<String>,
    budget: RowBudget,
    done: bool,
}

impl HtmlListingReader {
    pub fn new(
        fetcher: HttpFetcher,
        source: impl Into<String>,
        config: HtmlListingConfig,
        row_limit: Option<u64>,
    ) -> Self {
        Self {
            fetcher,
            source: source.into(),
            config,
            page: 1,
            seen: HashSet::new(),
            budget: RowBudget::new(row_limit),
            done: false,
        }
    }

    fn page_url(&self) -> String {
        if self.page == 1 {
            return self.config.url.clone();
        }
        let separator = if self.config.url.contains('?') { '&' } else { '?' };
        format!(
            "{}{}{}={}",
            self.config.url, separator, self.config.page_param, self.page
        )
    }
}

#[async_trait]
impl SourceReader for HtmlListingReader {
    async fn next_chunk(&mut self) -> Result<Option<Vec<Record>>, ReadError> {
        if self.done || self.budget.is_exhausted() || self.page > self.config.max_pages {
            return Ok(None);
        }
        let url = self.page_url();
        let response = self.fetcher.fetch_bytes(&self.source, &url, &[], &[]).await?;
        let html = String::from_utf8_lossy(&response.body).into_owned();
        self.page += 1;

        let mut rows = parse_listing_page(&html, &self.config, &mut self.seen)?;
        if rows.is_empty() {
            // A page with nothing new means the listing went stale.
            self.done = true;
            return Ok(None);
        }
        self.budget.admit(&mut rows);
        Ok(non_empty(rows))
    }

    fn restartable(&self) -> bool {
        false
    }
}

/// Extract new listing records from one page of HTML, updating the in-run
/// dedup set.
pub fn parse_listing_page(
    html: &str,
    config: &HtmlListingConfig,
    seen: &mut HashSet<String>,
) -> Result<Vec<Record>, ReadError> {
    let item_selector = parse_selector(&config.item_selector)?;
    let field_selectors = config
        .fields
        .iter()
        .map(|f| Ok((f, parse_selector(&f.selector)?)))
        .collect::<Result<Vec<_>, ReadError>>()?;

    let document = Html::parse_document(html);
    let mut rows = Vec::new();
    for item in document.select(&item_selector) {
        let mut record = Record::new();
        let mut link = None;
        for (field, selector) in &field_selectors {
            let value = extract_item_field(&item, selector, field.attr.as_deref());
            if field.field == config.link_field {
                link = value.clone();
            }
            record.insert(
                field.field.clone(),
                value.map(Value::Text).unwrap_or(Value::Null),
            );
        }
        let Some(href) = link else {
            // A card without its link cannot be deduplicated; skip it.
            debug!(source_field = %config.link_field, "skipping listing item without a link");
            continue;
        };
        let canonical = canonicalize_url(&config.base_url, &href);
        if !seen.insert(canonical.clone()) {
            continue;
        }
        record.insert(config.link_field.clone(), Value::Text(canonical));
        rows.push(record);
    }
    Ok(rows)
}

fn parse_selector(selector: &str) -> Result<Selector, ReadError> {
    Selector::parse(selector).map_err(|err| ReadError::Selector {
        selector: selector.to_string(),
        message: err.to_string(),
    })
}

fn extract_item_field(
    item: &ElementRef<'_>,
    selector: &Selector,
    attr: Option<&str>,
) -> Option<String> {
    let element = item.select(selector).next()?;
    let raw = match attr {
        Some(attr) => element.value().attr(attr)?.to_string(),
        None => element.text().collect::<String>(),
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Make scraped hrefs absolute: protocol-relative links gain `https:`,
/// rooted paths are joined onto the listing's base URL.
pub fn canonicalize_url(base_url: &str, href: &str) -> String {
    if href.starts_with("//") {
        return format!("https:{href}");
    }
    if href.starts_with('/') {
        return format!("{}{}", base_url.trim_end_matches('/'), href);
    }
    href.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_csv(dir: &tempfile::TempDir, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).expect("create csv");
        file.write_all(contents.as_bytes()).expect("write csv");
        path
    }

    #[tokio::test]
    async fn delimited_file_reader_yields_header_named_chunks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut contents = String::from("StoreId,City\n");
        for i in 0..10 {
            contents.push_str(&format!("s{i},manila\n"));
        }
        let path = write_csv(&dir, "restos.csv", &contents);

        let mut reader = DelimitedFileReader::open(&path, 4, None).expect("open");
        let mut sizes = Vec::new();
        while let Some(chunk) = reader.next_chunk().await.expect("chunk") {
            assert!(chunk
                .iter()
                .all(|r| r.contains("StoreId") && r.contains("City")));
            sizes.push(chunk.len());
        }
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    #[tokio::test]
    async fn delimited_file_reader_honors_row_ceiling() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_csv(&dir, "big.csv", "a,b\n1,2\n3,4\n5,6\n7,8\n");

        let mut reader = DelimitedFileReader::open(&path, 10, Some(3)).expect("open");
        let chunk = reader.next_chunk().await.expect("chunk").expect("rows");
        assert_eq!(chunk.len(), 3);
        assert!(reader.next_chunk().await.expect("chunk").is_none());
    }

    #[test]
    fn missing_file_is_a_not_found_error() {
        let err = DelimitedFileReader::open(Path::new("/nonexistent/x.csv"), 10, None)
            .err()
            .expect("error");
        assert!(matches!(err, ReadError::NotFound(_)));
    }

    #[test]
    fn keyed_object_entities_carry_the_entry_key() {
        let body = serde_json::json!({
            "0": { "day": { "description": "Sunny", "image": "http://x/0d.png" },
                   "night": { "description": "Clear", "image": "http://x/0n.png" } },
            "61": { "day": { "description": "Light Rain", "image": "http://x/61d.png" },
                    "night": { "description": "Light Rain", "image": "http://x/61n.png" } }
        });
        let records = entity_records(
            &body,
            &EntityShape::KeyedObject {
                key_field: "weather_code".into(),
            },
            &[],
        )
        .expect("records");
        assert_eq!(records.len(), 2);
        let sunny = records
            .iter()
            .find(|r| r.get("weather_code") == Some(&Value::Text("0".into())))
            .expect("code 0");
        assert_eq!(
            sunny.get("day_description"),
            Some(&Value::Text("Sunny".into()))
        );
        assert_eq!(
            sunny.get("night_image"),
            Some(&Value::Text("http://x/0n.png".into()))
        );
    }

    #[test]
    fn projections_pull_scalars_and_item_lists() {
        let body = serde_json::json!({
            "id": 1,
            "name": "bulbasaur",
            "types": [
                { "slot": 1, "type": { "name": "grass" } },
                { "slot": 2, "type": { "name": "poison" } }
            ],
            "sprites": { "front_default": "http://img/1.png" }
        });
        let projections = vec![
            Projection {
                field: "id".into(),
                pointer: "/id".into(),
                item_pointer: None,
            },
            Projection {
                field: "types".into(),
                pointer: "/types".into(),
                item_pointer: Some("/type/name".into()),
            },
            Projection {
                field: "sprite_url".into(),
                pointer: "/sprites/front_default".into(),
                item_pointer: None,
            },
            Projection {
                field: "habitat".into(),
                pointer: "/habitat/name".into(),
                item_pointer: None,
            },
        ];
        let records =
            entity_records(&body, &EntityShape::SingleObject, &projections).expect("records");
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.get("id"), Some(&Value::Int(1)));
        assert_eq!(
            record.get("types"),
            Some(&Value::TextList(vec!["grass".into(), "poison".into()]))
        );
        assert_eq!(
            record.get("sprite_url"),
            Some(&Value::Text("http://img/1.png".into()))
        );
        assert_eq!(record.get("habitat"), Some(&Value::Null));
    }

    #[test]
    fn root_array_flattening_keeps_scalar_lists() {
        let body = serde_json::json!([
            { "id": "bitcoin", "current_price": 67000.5, "tags": ["layer-1", "pow"] }
        ]);
        let records = entity_records(&body, &EntityShape::RootArray, &[]).expect("records");
        assert_eq!(records[0].get("id"), Some(&Value::Text("bitcoin".into())));
        assert_eq!(
            records[0].get("current_price"),
            Some(&Value::Float(67000.5))
        );
        assert_eq!(
            records[0].get("tags"),
            Some(&Value::TextList(vec!["layer-1".into(), "pow".into()]))
        );
    }

    fn listing_config() -> HtmlListingConfig {
        HtmlListingConfig {
            url: "https://shop.test/catalog?q=keyboard".into(),
            base_url: "https://shop.test".into(),
            page_param: "page".into(),
            max_pages: 5,
            item_selector: "div.product".into(),
            fields: vec![
                SelectorField {
                    field: "name".into(),
                    selector: "a.title".into(),
                    attr: Some("title".into()),
                },
                SelectorField {
                    field: "price".into(),
                    selector: "span.price".into(),
                    attr: None,
                },
                SelectorField {
                    field: "url".into(),
                    selector: "a.title".into(),
                    attr: Some("href".into()),
                },
            ],
            link_field: "url".into(),
        }
    }

    #[test]
    fn listing_items_are_deduplicated_across_overlapping_pages() {
        let page_one = r#"
            <div class="product"><a class="title" title="Keyb A" href="/item/a"></a><span class="price">100</span></div>
            <div class="product"><a class="title" title="Keyb B" href="//shop.test/item/b"></a><span class="price">200</span></div>
        "#;
        let page_two = r#"
            <div class="product"><a class="title" title="Keyb B" href="//shop.test/item/b"></a><span class="price">200</span></div>
            <div class="product"><a class="title" title="Keyb C" href="/item/c"></a><span class="price">300</span></div>
        "#;
        let config = listing_config();
        let mut seen = HashSet::new();

        let first = parse_listing_page(page_one, &config, &mut seen).expect("page one");
        assert_eq!(first.len(), 2);
        assert_eq!(
            first[0].get("url"),
            Some(&Value::Text("https://shop.test/item/a".into()))
        );
        assert_eq!(
            first[1].get("url"),
            Some(&Value::Text("https://shop.test/item/b".into()))
        );

        let second = parse_listing_page(page_two, &config, &mut seen).expect("page two");
        assert_eq!(second.len(), 1);
        assert_eq!(
            second[0].get("url"),
            Some(&Value::Text("https://shop.test/item/c".into()))
        );
    }

    #[test]
    fn listing_item_without_link_is_skipped_not_fatal() {
        let html = r#"
            <div class="product"><span class="price">999</span></div>
            <div class="product"><a class="title" title="Keyb D" href="/item/d"></a><span class="price">400</span></div>
        "#;
        let config = listing_config();
        let mut seen = HashSet::new();
        let rows = parse_listing_page(html, &config, &mut seen).expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("name"), Some(&Value::Text("Keyb D".into())));
    }

    #[test]
    fn canonical_urls_are_absolute() {
        assert_eq!(
            canonicalize_url("https://shop.test", "//shop.test/item/a"),
            "https://shop.test/item/a"
        );
        assert_eq!(
            canonicalize_url("https://shop.test/", "/item/b"),
            "https://shop.test/item/b"
        );
        assert_eq!(
            canonicalize_url("https://shop.test", "https://other.test/c"),
            "https://other.test/c"
        );
    }
}

//! Ingestion policies, warehouse destinations, parquet run snapshots, and
//! the per-source run driver.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, BooleanArray, Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use silt_core::{ColumnSpec, ColumnType, Record, SourceDescriptor, Value, WriteDisposition};
use silt_normalize::{normalize_record, RowShape};
use silt_readers::{
    DelimitedFileReader, HtmlListingConfig, HtmlListingReader, JsonApiConfig, JsonApiReader,
    PostgresConfig, PostgresTableReader, SourceReader,
};
use silt_staging::{BackoffPolicy, HttpClientConfig, HttpFetcher, StagedPayload, StagingStore};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "silt-load";

/// Version column carried by merge tables so the warehouse collapse keeps
/// the last-written record per key.
pub const LOAD_SEQ_COLUMN: &str = "_load_seq";

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("warehouse error: {0}")]
    Warehouse(#[from] clickhouse::error::Error),
    #[error("record is missing merge key {field}")]
    MissingKey { field: String },
    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot encoding error: {0}")]
    Arrow(#[from] arrow_schema::ArrowError),
    #[error("snapshot write error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
    #[error("snapshot manifest error: {0}")]
    Manifest(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Ingestion policy helpers

fn key_component(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(b.to_string()),
        Value::Int(i) => Some(i.to_string()),
        Value::Float(f) => Some(f.to_string()),
        Value::Text(s) => Some(s.clone()),
        Value::Timestamp(ts) => Some(ts.to_rfc3339()),
        Value::Date(d) => Some(d.to_string()),
        Value::TextList(_) | Value::Json(_) => serde_json::to_string(value).ok(),
    }
}

/// Render a record's merge key. The normalizer guarantees key presence, so
/// a missing component here is a programming error surfaced as `LoadError`.
pub fn record_key(record: &Record, key_fields: &[String]) -> Result<String, LoadError> {
    let mut parts = Vec::with_capacity(key_fields.len());
    for field in key_fields {
        let component = record
            .get(field)
            .and_then(key_component)
            .ok_or_else(|| LoadError::MissingKey {
                field: field.clone(),
            })?;
        parts.push(component);
    }
    Ok(parts.join("\u{1}"))
}

/// Collapse same-key records within one batch: the later record in stream
/// order wins, keeping the position of the first occurrence.
pub fn collapse_last_write_wins(
    rows: Vec<Record>,
    key_fields: &[String],
) -> Result<Vec<Record>, LoadError> {
    let mut out: Vec<Record> = Vec::with_capacity(rows.len());
    let mut index: HashMap<String, usize> = HashMap::new();
    for row in rows {
        let key = record_key(&row, key_fields)?;
        match index.get(&key) {
            Some(&slot) => out[slot] = row,
            None => {
                index.insert(key, out.len());
                out.push(row);
            }
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Destinations

/// Where normalized chunks land. `prepare` is called once per source run
/// before the first chunk.
#[async_trait]
pub trait Destination: Send {
    async fn prepare(&mut self, descriptor: &SourceDescriptor) -> Result<(), LoadError>;
    async fn write_chunk(
        &mut self,
        descriptor: &SourceDescriptor,
        rows: &[Record],
    ) -> Result<u64, LoadError>;
}

#[async_trait]
impl Destination for Box<dyn Destination> {
    async fn prepare(&mut self, descriptor: &SourceDescriptor) -> Result<(), LoadError> {
        (**self).prepare(descriptor).await
    }

    async fn write_chunk(
        &mut self,
        descriptor: &SourceDescriptor,
        rows: &[Record],
    ) -> Result<u64, LoadError> {
        (**self).write_chunk(descriptor, rows).await
    }
}

/// ClickHouse connection settings for the downstream warehouse.
#[derive(Debug, Clone)]
pub struct ClickHouseConfig {
    pub url: String,
    pub user: String,
    pub password: String,
    /// Default database for the connection; tables live in per-source
    /// dataset databases.
    pub database: String,
}

impl ClickHouseConfig {
    pub fn client(&self) -> clickhouse::Client {
        clickhouse::Client::default()
            .with_url(self.url.clone())
            .with_user(self.user.clone())
            .with_password(self.password.clone())
            .with_database(self.database.clone())
    }
}

fn ch_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "\\`"))
}

fn quoted(text: &str) -> String {
    format!("'{}'", text.replace('\\', "\\\\").replace('\'', "\\'"))
}

fn literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) if f.is_finite() => f.to_string(),
        Value::Float(_) => "NULL".to_string(),
        Value::Text(s) => quoted(s),
        Value::Timestamp(ts) => format!("'{}'", ts.format("%Y-%m-%d %H:%M:%S")),
        Value::Date(d) => format!("'{d}'"),
        Value::TextList(items) => format!(
            "[{}]",
            items.iter().map(|s| quoted(s)).collect::<Vec<_>>().join(", ")
        ),
        Value::Json(v) => quoted(&serde_json::to_string(v).unwrap_or_default()),
    }
}

fn column_ddl(spec: &ColumnSpec) -> String {
    let base = match spec.column_type {
        ColumnType::Bool => "Bool",
        ColumnType::Int => "Int64",
        ColumnType::Float => "Float64",
        ColumnType::Text => "String",
        ColumnType::Timestamp => "DateTime('UTC')",
        ColumnType::Date => "Date32",
        ColumnType::TextList => "Array(String)",
        ColumnType::Json => "String",
    };
    // Array columns cannot be Nullable; an empty array stands in.
    let declared = if spec.nullable && spec.column_type != ColumnType::TextList {
        format!("Nullable({base})")
    } else {
        base.to_string()
    };
    format!("{} {}", ch_ident(&spec.name), declared)
}

pub fn qualified_table(descriptor: &SourceDescriptor) -> String {
    format!(
        "{}.{}",
        ch_ident(&descriptor.dataset),
        ch_ident(&descriptor.table)
    )
}

pub fn create_database_sql(dataset: &str) -> String {
    format!("CREATE DATABASE IF NOT EXISTS {}", ch_ident(dataset))
}

/// Table DDL with column types pre-declared from the descriptor. Merge
/// tables use a ReplacingMergeTree versioned by the load sequence so the
/// engine collapse mirrors last-write-in-stream-order.
pub fn create_table_sql(descriptor: &SourceDescriptor) -> String {
    let mut columns: Vec<String> = descriptor.columns.iter().map(column_ddl).collect();
    let (engine, order_by) = match descriptor.key_fields() {
        Some(keys) => {
            columns.push(format!("{} UInt64", ch_ident(LOAD_SEQ_COLUMN)));
            let order = keys
                .iter()
                .map(|k| ch_ident(k))
                .collect::<Vec<_>>()
                .join(", ");
            (
                format!("ReplacingMergeTree({})", ch_ident(LOAD_SEQ_COLUMN)),
                format!("({order})"),
            )
        }
        None => ("MergeTree".to_string(), "tuple()".to_string()),
    };
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({}) ENGINE = {} ORDER BY {}",
        qualified_table(descriptor),
        columns.join(", "),
        engine,
        order_by
    )
}

pub fn truncate_sql(descriptor: &SourceDescriptor) -> String {
    format!("TRUNCATE TABLE IF EXISTS {}", qualified_table(descriptor))
}

/// Render one batched INSERT with escaped literals; `None` for an empty
/// chunk. Bumps the load sequence per row for merge tables.
pub fn insert_sql(
    descriptor: &SourceDescriptor,
    rows: &[Record],
    next_seq: &mut u64,
) -> Option<String> {
    if rows.is_empty() {
        return None;
    }
    let merge = descriptor.key_fields().is_some();
    let mut columns: Vec<String> = descriptor
        .columns
        .iter()
        .map(|c| ch_ident(&c.name))
        .collect();
    if merge {
        columns.push(ch_ident(LOAD_SEQ_COLUMN));
    }
    let mut tuples = Vec::with_capacity(rows.len());
    for row in rows {
        let mut values: Vec<String> = descriptor
            .columns
            .iter()
            .map(|c| literal(row.get(&c.name).unwrap_or(&Value::Null)))
            .collect();
        if merge {
            values.push(next_seq.to_string());
            *next_seq += 1;
        }
        tuples.push(format!("({})", values.join(", ")));
    }
    Some(format!(
        "INSERT INTO {} ({}) VALUES {}",
        qualified_table(descriptor),
        columns.join(", "),
        tuples.join(", ")
    ))
}

/// Loads normalized chunks into ClickHouse. The dataset database and the
/// table (with pre-declared column types) are ensured per run; replace
/// sources are truncated before their first chunk.
pub struct ClickHouseDestination {
    client: clickhouse::Client,
    next_seq: u64,
}

impl ClickHouseDestination {
    pub fn new(config: &ClickHouseConfig) -> Self {
        // Microsecond wall-clock base keeps later runs winning the
        // ReplacingMergeTree collapse across process restarts.
        let base = Utc::now().timestamp_micros().max(0) as u64;
        Self {
            client: config.client(),
            next_seq: base,
        }
    }
}

#[async_trait]
impl Destination for ClickHouseDestination {
    async fn prepare(&mut self, descriptor: &SourceDescriptor) -> Result<(), LoadError> {
        self.client
            .query(&create_database_sql(&descriptor.dataset))
            .execute()
            .await?;
        self.client
            .query(&create_table_sql(descriptor))
            .execute()
            .await?;
        if descriptor.disposition == WriteDisposition::Replace {
            self.client
                .query(&truncate_sql(descriptor))
                .execute()
                .await?;
        }
        Ok(())
    }

    async fn write_chunk(
        &mut self,
        descriptor: &SourceDescriptor,
        rows: &[Record],
    ) -> Result<u64, LoadError> {
        let Some(sql) = insert_sql(descriptor, rows, &mut self.next_seq) else {
            return Ok(0);
        };
        self.client.query(&sql).execute().await?;
        Ok(rows.len() as u64)
    }
}

#[derive(Debug, Default)]
struct MemoryTable {
    rows: Vec<Record>,
    key_fields: Option<Vec<String>>,
    index: HashMap<String, usize>,
}

/// In-process destination applying the same three ingestion policies;
/// backs the property tests and `--dry-run`.
#[derive(Debug, Default)]
pub struct MemoryDestination {
    tables: BTreeMap<String, MemoryTable>,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    fn table_name(descriptor: &SourceDescriptor) -> String {
        format!("{}.{}", descriptor.dataset, descriptor.table)
    }

    pub fn row_count(&self, dataset: &str, table: &str) -> usize {
        self.tables
            .get(&format!("{dataset}.{table}"))
            .map(|t| t.rows.len())
            .unwrap_or(0)
    }

    pub fn rows(&self, dataset: &str, table: &str) -> &[Record] {
        self.tables
            .get(&format!("{dataset}.{table}"))
            .map(|t| t.rows.as_slice())
            .unwrap_or(&[])
    }
}

#[async_trait]
impl Destination for MemoryDestination {
    async fn prepare(&mut self, descriptor: &SourceDescriptor) -> Result<(), LoadError> {
        let table = self
            .tables
            .entry(Self::table_name(descriptor))
            .or_default();
        table.key_fields = descriptor.key_fields().map(<[String]>::to_vec);
        if descriptor.disposition == WriteDisposition::Replace {
            table.rows.clear();
            table.index.clear();
        }
        Ok(())
    }

    async fn write_chunk(
        &mut self,
        descriptor: &SourceDescriptor,
        rows: &[Record],
    ) -> Result<u64, LoadError> {
        let table = self
            .tables
            .entry(Self::table_name(descriptor))
            .or_default();
        match table.key_fields.clone() {
            None => table.rows.extend(rows.iter().cloned()),
            Some(keys) => {
                for row in rows {
                    let key = record_key(row, &keys)?;
                    match table.index.get(&key) {
                        Some(&slot) => table.rows[slot] = row.clone(),
                        None => {
                            table.index.insert(key, table.rows.len());
                            table.rows.push(row.clone());
                        }
                    }
                }
            }
        }
        Ok(rows.len() as u64)
    }
}

// ---------------------------------------------------------------------------
// Parquet run snapshots

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub files: Vec<SnapshotFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Columnar snapshot of one run's normalized rows, written batch-by-batch
/// so chunked sources never materialize fully in memory.
pub struct SnapshotWriter {
    writer: ArrowWriter<File>,
    schema: Arc<Schema>,
    columns: Vec<ColumnSpec>,
    path: PathBuf,
}

impl SnapshotWriter {
    pub fn create(run_dir: &Path, descriptor: &SourceDescriptor) -> Result<Self, LoadError> {
        std::fs::create_dir_all(run_dir)?;
        let fields: Vec<ArrowField> = descriptor
            .columns
            .iter()
            .map(|c| ArrowField::new(c.name.clone(), arrow_type(c.column_type), c.nullable))
            .collect();
        let schema = Arc::new(Schema::new(fields));
        let path = run_dir.join(format!("{}.parquet", descriptor.table));
        let file = File::create(&path)?;
        let writer = ArrowWriter::try_new(file, schema.clone(), None)?;
        Ok(Self {
            writer,
            schema,
            columns: descriptor.columns.clone(),
            path,
        })
    }

    pub fn write_rows(&mut self, rows: &[Record]) -> Result<(), LoadError> {
        if rows.is_empty() {
            return Ok(());
        }
        let arrays: Vec<ArrayRef> = self
            .columns
            .iter()
            .map(|column| column_array(column, rows))
            .collect();
        let batch = RecordBatch::try_new(self.schema.clone(), arrays)?;
        self.writer.write(&batch)?;
        Ok(())
    }

    pub fn finish(self) -> Result<PathBuf, LoadError> {
        self.writer.close()?;
        Ok(self.path)
    }
}

fn arrow_type(column_type: ColumnType) -> DataType {
    match column_type {
        ColumnType::Int => DataType::Int64,
        ColumnType::Float => DataType::Float64,
        ColumnType::Bool => DataType::Boolean,
        _ => DataType::Utf8,
    }
}

fn column_array(column: &ColumnSpec, rows: &[Record]) -> ArrayRef {
    match column.column_type {
        ColumnType::Int => {
            let cells: Vec<Option<i64>> = rows
                .iter()
                .map(|r| match r.get(&column.name) {
                    Some(Value::Int(i)) => Some(*i),
                    _ => None,
                })
                .collect();
            Arc::new(Int64Array::from(cells))
        }
        ColumnType::Float => {
            let cells: Vec<Option<f64>> = rows
                .iter()
                .map(|r| match r.get(&column.name) {
                    Some(Value::Float(f)) => Some(*f),
                    Some(Value::Int(i)) => Some(*i as f64),
                    _ => None,
                })
                .collect();
            Arc::new(Float64Array::from(cells))
        }
        ColumnType::Bool => {
            let cells: Vec<Option<bool>> = rows
                .iter()
                .map(|r| match r.get(&column.name) {
                    Some(Value::Bool(b)) => Some(*b),
                    _ => None,
                })
                .collect();
            Arc::new(BooleanArray::from(cells))
        }
        _ => {
            let cells: Vec<Option<String>> = rows
                .iter()
                .map(|r| text_cell(r.get(&column.name)))
                .collect();
            Arc::new(StringArray::from(cells))
        }
    }
}

fn text_cell(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::Text(s) => Some(s.clone()),
        Value::Timestamp(ts) => Some(ts.to_rfc3339()),
        Value::Date(d) => Some(d.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Int(i) => Some(i.to_string()),
        Value::Float(f) => Some(f.to_string()),
        other @ (Value::TextList(_) | Value::Json(_)) => serde_json::to_string(other).ok(),
    }
}

fn manifest_entry(name: &str, run_dir: &Path, path: &Path) -> Result<SnapshotFile, LoadError> {
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let relative = path
        .strip_prefix(run_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(SnapshotFile {
        name: name.to_string(),
        path: relative,
        sha256,
        bytes: bytes.len() as u64,
    })
}

pub fn write_manifest(run_dir: &Path, files: Vec<SnapshotFile>) -> Result<PathBuf, LoadError> {
    let manifest = SnapshotManifest {
        schema_version: 1,
        files,
    };
    let manifest_path = run_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest)?;
    std::fs::write(&manifest_path, bytes)?;
    Ok(manifest_path)
}

// ---------------------------------------------------------------------------
// Configuration & registry

/// All external configuration, resolved once at the edge so every
/// component below receives explicit values.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub clickhouse: ClickHouseConfig,
    pub postgres: PostgresConfig,
    pub staging_dir: PathBuf,
    pub snapshots_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    /// API keys by source name, from `SILT_API_KEY_<SOURCE>` variables.
    pub api_keys: BTreeMap<String, String>,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let mut api_keys = BTreeMap::new();
        for (name, value) in std::env::vars() {
            if let Some(source) = name.strip_prefix("SILT_API_KEY_") {
                api_keys.insert(source.to_ascii_lowercase(), value);
            }
        }
        Self {
            clickhouse: ClickHouseConfig {
                url: std::env::var("SILT_CLICKHOUSE_URL")
                    .unwrap_or_else(|_| "http://localhost:8123".to_string()),
                user: std::env::var("SILT_CLICKHOUSE_USER")
                    .unwrap_or_else(|_| "default".to_string()),
                password: std::env::var("SILT_CLICKHOUSE_PASSWORD").unwrap_or_default(),
                database: std::env::var("SILT_CLICKHOUSE_DATABASE")
                    .unwrap_or_else(|_| "default".to_string()),
            },
            postgres: PostgresConfig {
                host: std::env::var("POSTGRES_HOST").unwrap_or_else(|_| "localhost".to_string()),
                port: std::env::var("POSTGRES_PORT")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(5432),
                user: std::env::var("POSTGRES_USER").unwrap_or_else(|_| "postgres".to_string()),
                password: std::env::var("POSTGRES_PASSWORD").unwrap_or_default(),
                dbname: std::env::var("POSTGRES_DB").unwrap_or_else(|_| "postgres".to_string()),
            },
            staging_dir: std::env::var("SILT_STAGING_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./staging")),
            snapshots_dir: std::env::var("SILT_SNAPSHOTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./snapshots")),
            user_agent: std::env::var("SILT_USER_AGENT")
                .unwrap_or_else(|_| "silt-loader/0.1".to_string()),
            http_timeout_secs: std::env::var("SILT_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            api_keys,
        }
    }

    pub fn api_key_for(&self, source: &str) -> Option<&str> {
        self.api_keys.get(source).map(String::as_str)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceDescriptor>,
}

impl SourceRegistry {
    pub fn source(&self, name: &str) -> Option<&SourceDescriptor> {
        self.sources.iter().find(|s| s.name == name)
    }
}

pub fn load_registry(path: &Path) -> Result<SourceRegistry> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let registry: SourceRegistry =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    for (i, source) in registry.sources.iter().enumerate() {
        if registry.sources[..i].iter().any(|s| s.name == source.name) {
            anyhow::bail!("duplicate source name {} in {}", source.name, path.display());
        }
        source
            .validate()
            .with_context(|| format!("validating source {}", source.name))?;
    }
    Ok(registry)
}

/// Download a remote payload to its fixed staging path, where the
/// delimited-file sources read from. Unchanged payloads are detected by
/// hash and left alone.
pub async fn stage_remote_file(
    config: &PipelineConfig,
    relative_path: &str,
    url: &str,
) -> Result<StagedPayload> {
    let fetcher = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        backoff: BackoffPolicy::default(),
    })?;
    let response = fetcher
        .fetch_bytes(relative_path, url, &[], &[])
        .await
        .with_context(|| format!("fetching {url}"))?;
    let store = StagingStore::new(config.staging_dir.clone());
    let staged = store.store_bytes(relative_path, &response.body).await?;
    info!(
        url,
        path = %staged.absolute_path.display(),
        bytes = staged.byte_size,
        deduplicated = staged.deduplicated,
        "staged remote payload"
    );
    Ok(staged)
}

// ---------------------------------------------------------------------------
// Run driver

fn build_reader(
    descriptor: &SourceDescriptor,
    config: &PipelineConfig,
) -> Result<Box<dyn SourceReader>> {
    let reader: Box<dyn SourceReader> = match &descriptor.strategy {
        silt_core::ReadStrategy::DelimitedFile { path } => {
            let staging = StagingStore::new(config.staging_dir.clone());
            Box::new(DelimitedFileReader::open(
                &staging.resolve(path),
                descriptor.chunk_rows,
                descriptor.row_limit,
            )?)
        }
        silt_core::ReadStrategy::PostgresTable { table } => Box::new(PostgresTableReader::new(
            config.postgres.clone(),
            table.clone(),
            descriptor.chunk_rows,
            descriptor.row_limit,
        )),
        silt_core::ReadStrategy::JsonApi {
            url,
            params,
            paging,
            entities,
            projections,
            api_key_header,
        } => {
            let fetcher = HttpFetcher::new(HttpClientConfig {
                timeout: Duration::from_secs(config.http_timeout_secs),
                user_agent: Some(config.user_agent.clone()),
                backoff: BackoffPolicy::default(),
            })?;
            let mut headers = Vec::new();
            if let Some(header) = api_key_header {
                match config.api_key_for(&descriptor.name) {
                    Some(key) => headers.push((header.clone(), key.to_string())),
                    None => warn!(
                        source = %descriptor.name,
                        header,
                        "api key header configured but no key found in environment"
                    ),
                }
            }
            Box::new(JsonApiReader::new(
                fetcher,
                descriptor.name.clone(),
                JsonApiConfig {
                    url: url.clone(),
                    params: params.clone().into_iter().collect(),
                    paging: paging.clone(),
                    entities: entities.clone(),
                    projections: projections.clone(),
                    headers,
                },
                descriptor.chunk_rows,
                descriptor.row_limit,
            ))
        }
        silt_core::ReadStrategy::HtmlListing {
            url,
            base_url,
            page_param,
            max_pages,
            item_selector,
            fields,
            link_field,
        } => {
            // Scrape fetches are never retried; a flaky page is stale data,
            // not a transient fault.
            let fetcher = HttpFetcher::new(HttpClientConfig {
                timeout: Duration::from_secs(config.http_timeout_secs),
                user_agent: Some(config.user_agent.clone()),
                backoff: BackoffPolicy::none(),
            })?;
            Box::new(HtmlListingReader::new(
                fetcher,
                descriptor.name.clone(),
                HtmlListingConfig {
                    url: url.clone(),
                    base_url: base_url.clone(),
                    page_param: page_param.clone(),
                    max_pages: *max_pages,
                    item_selector: item_selector.clone(),
                    fields: fields.clone(),
                    link_field: link_field.clone(),
                },
                descriptor.row_limit,
            ))
        }
    };
    Ok(reader)
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub source: String,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub restartable: bool,
    pub rows_read: u64,
    pub rows_loaded: u64,
    pub rows_skipped: u64,
    pub chunks: u64,
    pub snapshot_dir: Option<String>,
}

/// Sequential read -> normalize -> load driver. One source's run completes
/// before the next begins; a failed run aborts with the chunks already
/// loaded left in place.
pub struct Pipeline<D: Destination> {
    config: PipelineConfig,
    destination: D,
    snapshots: bool,
}

impl<D: Destination> Pipeline<D> {
    pub fn new(config: PipelineConfig, destination: D) -> Self {
        Self {
            config,
            destination,
            snapshots: true,
        }
    }

    pub fn with_snapshots(mut self, enabled: bool) -> Self {
        self.snapshots = enabled;
        self
    }

    pub fn destination(&self) -> &D {
        &self.destination
    }

    pub async fn run_source(&mut self, descriptor: &SourceDescriptor) -> Result<RunSummary> {
        descriptor.validate()?;
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(source = %descriptor.name, %run_id, "starting source run");

        let shape = RowShape::from_descriptor(descriptor);
        let mut reader = build_reader(descriptor, &self.config)?;
        let restartable = reader.restartable();
        self.destination.prepare(descriptor).await?;

        let run_dir = self.config.snapshots_dir.join(run_id.to_string());
        let mut snapshot = if self.snapshots {
            Some(SnapshotWriter::create(&run_dir, descriptor)?)
        } else {
            None
        };

        let mut rows_read = 0u64;
        let mut rows_loaded = 0u64;
        let mut rows_skipped = 0u64;
        let mut chunks = 0u64;

        while let Some(chunk) = reader.next_chunk().await? {
            rows_read += chunk.len() as u64;
            let mut normalized = Vec::with_capacity(chunk.len());
            for raw in &chunk {
                match normalize_record(raw, &shape) {
                    Ok(record) => normalized.push(record),
                    Err(err) => {
                        rows_skipped += 1;
                        warn!(source = %descriptor.name, %err, "skipping row that failed normalization");
                    }
                }
            }
            let ready = match descriptor.key_fields() {
                Some(keys) => collapse_last_write_wins(normalized, keys)?,
                None => normalized,
            };
            if ready.is_empty() {
                continue;
            }
            if let Some(writer) = snapshot.as_mut() {
                writer.write_rows(&ready)?;
            }
            rows_loaded += self.destination.write_chunk(descriptor, &ready).await?;
            chunks += 1;
        }

        let snapshot_dir = match snapshot {
            Some(writer) => {
                let parquet_path = writer.finish()?;
                let entry = manifest_entry(&descriptor.table, &run_dir, &parquet_path)?;
                write_manifest(&run_dir, vec![entry])?;
                Some(run_dir.display().to_string())
            }
            None => None,
        };

        let summary = RunSummary {
            source: descriptor.name.clone(),
            run_id,
            started_at,
            finished_at: Utc::now(),
            restartable,
            rows_read,
            rows_loaded,
            rows_skipped,
            chunks,
            snapshot_dir,
        };
        info!(
            source = %summary.source,
            rows_read = summary.rows_read,
            rows_loaded = summary.rows_loaded,
            rows_skipped = summary.rows_skipped,
            chunks = summary.chunks,
            "source run complete"
        );
        Ok(summary)
    }

    /// Run every source in the registry, strictly one after another. The
    /// first failing source aborts the whole run.
    pub async fn run_all(&mut self, registry: &SourceRegistry) -> Result<Vec<RunSummary>> {
        let mut summaries = Vec::with_capacity(registry.sources.len());
        for descriptor in &registry.sources {
            match self.run_source(descriptor).await {
                Ok(summary) => summaries.push(summary),
                Err(err) => {
                    error!(source = %descriptor.name, %err, "source run failed");
                    return Err(err.context(format!("source {} run failed", descriptor.name)));
                }
            }
        }
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use silt_core::{MissingPolicy, Paging, ReadStrategy};
    use std::io::Write;

    fn text_column(name: &str, nullable: bool) -> ColumnSpec {
        ColumnSpec {
            name: name.into(),
            column_type: ColumnType::Text,
            nullable,
            missing: MissingPolicy::Null,
        }
    }

    fn file_descriptor(
        name: &str,
        path: &str,
        disposition: WriteDisposition,
        columns: Vec<ColumnSpec>,
    ) -> SourceDescriptor {
        SourceDescriptor {
            name: name.into(),
            dataset: "testdata".into(),
            table: name.into(),
            strategy: ReadStrategy::DelimitedFile { path: path.into() },
            disposition,
            columns,
            renames: BTreeMap::new(),
            row_limit: None,
            chunk_rows: 3,
        }
    }

    fn test_config(staging: &Path, snapshots: &Path) -> PipelineConfig {
        PipelineConfig {
            clickhouse: ClickHouseConfig {
                url: "http://localhost:8123".into(),
                user: "default".into(),
                password: String::new(),
                database: "default".into(),
            },
            postgres: PostgresConfig {
                host: "localhost".into(),
                port: 5432,
                user: "postgres".into(),
                password: String::new(),
                dbname: "postgres".into(),
            },
            staging_dir: staging.to_path_buf(),
            snapshots_dir: snapshots.to_path_buf(),
            user_agent: "silt-test/0".into(),
            http_timeout_secs: 5,
            api_keys: BTreeMap::new(),
        }
    }

    fn write_staged(staging: &Path, relative: &str, contents: &str) {
        let path = staging.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut file = std::fs::File::create(path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
    }

    fn record(pairs: &[(&str, Value)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn same_key_in_one_batch_keeps_the_later_record() {
        let keys = vec!["id".to_string()];
        let rows = vec![
            record(&[("id", Value::Text("a".into())), ("v", Value::Int(1))]),
            record(&[("id", Value::Text("b".into())), ("v", Value::Int(2))]),
            record(&[("id", Value::Text("a".into())), ("v", Value::Int(3))]),
        ];
        let collapsed = collapse_last_write_wins(rows, &keys).unwrap();
        assert_eq!(collapsed.len(), 2);
        assert_eq!(collapsed[0].get("v"), Some(&Value::Int(3)));
        assert_eq!(collapsed[1].get("v"), Some(&Value::Int(2)));
    }

    #[tokio::test]
    async fn merge_runs_are_idempotent() {
        let staging = tempfile::tempdir().unwrap();
        let snapshots = tempfile::tempdir().unwrap();
        write_staged(
            staging.path(),
            "codes.csv",
            "code,label\n1,one\n2,two\n3,three\n",
        );
        let descriptor = file_descriptor(
            "codes",
            "codes.csv",
            WriteDisposition::Merge {
                key_fields: vec!["code".into()],
            },
            vec![text_column("code", false), text_column("label", true)],
        );
        let config = test_config(staging.path(), snapshots.path());
        let mut pipeline = Pipeline::new(config, MemoryDestination::new()).with_snapshots(false);

        let first = pipeline.run_source(&descriptor).await.unwrap();
        assert_eq!(first.rows_read, 3);
        assert_eq!(pipeline.destination().row_count("testdata", "codes"), 3);

        pipeline.run_source(&descriptor).await.unwrap();
        assert_eq!(pipeline.destination().row_count("testdata", "codes"), 3);
    }

    #[tokio::test]
    async fn append_runs_double_the_row_count() {
        let staging = tempfile::tempdir().unwrap();
        let snapshots = tempfile::tempdir().unwrap();
        write_staged(staging.path(), "reviews.csv", "uuid,text\na,ok\nb,bad\n");
        let descriptor = file_descriptor(
            "reviews",
            "reviews.csv",
            WriteDisposition::Append,
            vec![text_column("uuid", true), text_column("text", true)],
        );
        let config = test_config(staging.path(), snapshots.path());
        let mut pipeline = Pipeline::new(config, MemoryDestination::new()).with_snapshots(false);

        pipeline.run_source(&descriptor).await.unwrap();
        pipeline.run_source(&descriptor).await.unwrap();
        assert_eq!(pipeline.destination().row_count("testdata", "reviews"), 4);
    }

    #[tokio::test]
    async fn replace_runs_discard_prior_contents() {
        let staging = tempfile::tempdir().unwrap();
        let snapshots = tempfile::tempdir().unwrap();
        write_staged(staging.path(), "cars.csv", "name,mpg\nchevy,18\nbuick,15\n");
        let descriptor = file_descriptor(
            "cars",
            "cars.csv",
            WriteDisposition::Replace,
            vec![text_column("name", true), text_column("mpg", true)],
        );
        let config = test_config(staging.path(), snapshots.path());
        let mut pipeline = Pipeline::new(config, MemoryDestination::new()).with_snapshots(false);

        pipeline.run_source(&descriptor).await.unwrap();
        pipeline.run_source(&descriptor).await.unwrap();
        assert_eq!(pipeline.destination().row_count("testdata", "cars"), 2);
    }

    #[tokio::test]
    async fn merge_source_with_in_run_duplicates_keeps_later_values() {
        let staging = tempfile::tempdir().unwrap();
        let snapshots = tempfile::tempdir().unwrap();
        write_staged(
            staging.path(),
            "prices.csv",
            "id,price\nbitcoin,100\nbitcoin,200\n",
        );
        let descriptor = file_descriptor(
            "prices",
            "prices.csv",
            WriteDisposition::Merge {
                key_fields: vec!["id".into()],
            },
            vec![text_column("id", false), text_column("price", true)],
        );
        let config = test_config(staging.path(), snapshots.path());
        let mut pipeline = Pipeline::new(config, MemoryDestination::new()).with_snapshots(false);

        pipeline.run_source(&descriptor).await.unwrap();
        let rows = pipeline.destination().rows("testdata", "prices");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("price"), Some(&Value::Text("200".into())));
    }

    #[tokio::test]
    async fn bad_rows_are_skipped_and_counted_while_the_run_continues() {
        let staging = tempfile::tempdir().unwrap();
        let snapshots = tempfile::tempdir().unwrap();
        let mut contents = String::from("id,price\n");
        for i in 0..10 {
            contents.push_str(&format!("{i},{i}.50\n"));
        }
        contents.push_str(",missing-key\n");
        write_staged(staging.path(), "mixed.csv", &contents);
        let descriptor = file_descriptor(
            "mixed",
            "mixed.csv",
            WriteDisposition::Merge {
                key_fields: vec!["id".into()],
            },
            vec![
                ColumnSpec {
                    name: "id".into(),
                    column_type: ColumnType::Int,
                    nullable: false,
                    missing: MissingPolicy::Null,
                },
                text_column("price", true),
            ],
        );
        let config = test_config(staging.path(), snapshots.path());
        let mut pipeline = Pipeline::new(config, MemoryDestination::new()).with_snapshots(false);

        let summary = pipeline.run_source(&descriptor).await.unwrap();
        assert_eq!(summary.rows_read, 11);
        assert_eq!(summary.rows_skipped, 1);
        assert_eq!(pipeline.destination().row_count("testdata", "mixed"), 10);
    }

    #[tokio::test]
    async fn snapshots_write_parquet_and_manifest() {
        let staging = tempfile::tempdir().unwrap();
        let snapshots = tempfile::tempdir().unwrap();
        write_staged(staging.path(), "cars.csv", "name,mpg\nchevy,18\n");
        let descriptor = file_descriptor(
            "cars",
            "cars.csv",
            WriteDisposition::Replace,
            vec![text_column("name", true), text_column("mpg", true)],
        );
        let config = test_config(staging.path(), snapshots.path());
        let mut pipeline = Pipeline::new(config, MemoryDestination::new());

        let summary = pipeline.run_source(&descriptor).await.unwrap();
        let run_dir = PathBuf::from(summary.snapshot_dir.expect("snapshot dir"));
        let parquet = run_dir.join("cars.parquet");
        assert!(parquet.exists());
        let manifest: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(run_dir.join("manifest.json")).unwrap())
                .unwrap();
        let file = &manifest["files"][0];
        assert_eq!(file["name"], "cars");
        assert_eq!(file["sha256"].as_str().unwrap().len(), 64);
        assert!(file["bytes"].as_u64().unwrap() > 0);
    }

    #[test]
    fn merge_tables_get_a_versioned_replacing_engine() {
        let descriptor = SourceDescriptor {
            name: "market_price".into(),
            dataset: "btc".into(),
            table: "market_price".into(),
            strategy: ReadStrategy::JsonApi {
                url: "https://api.example.test".into(),
                params: BTreeMap::new(),
                paging: Paging::Single,
                entities: Default::default(),
                projections: Vec::new(),
                api_key_header: None,
            },
            disposition: WriteDisposition::Merge {
                key_fields: vec!["id".into(), "last_updated".into()],
            },
            columns: vec![
                text_column("id", false),
                ColumnSpec {
                    name: "last_updated".into(),
                    column_type: ColumnType::Timestamp,
                    nullable: false,
                    missing: MissingPolicy::Null,
                },
                ColumnSpec {
                    name: "current_price".into(),
                    column_type: ColumnType::Float,
                    nullable: true,
                    missing: MissingPolicy::Null,
                },
            ],
            renames: BTreeMap::new(),
            row_limit: None,
            chunk_rows: 100,
        };
        let ddl = create_table_sql(&descriptor);
        assert!(ddl.contains("CREATE TABLE IF NOT EXISTS `btc`.`market_price`"));
        assert!(ddl.contains("ENGINE = ReplacingMergeTree(`_load_seq`)"));
        assert!(ddl.contains("ORDER BY (`id`, `last_updated`)"));
        assert!(ddl.contains("`id` String"));
        assert!(ddl.contains("`current_price` Nullable(Float64)"));

        let append = file_descriptor(
            "reviews",
            "reviews.csv",
            WriteDisposition::Append,
            vec![text_column("uuid", true)],
        );
        let ddl = create_table_sql(&append);
        assert!(ddl.contains("ENGINE = MergeTree ORDER BY tuple()"));
        assert!(!ddl.contains(LOAD_SEQ_COLUMN));
    }

    #[test]
    fn insert_literals_are_escaped_and_sequenced() {
        let descriptor = file_descriptor(
            "notes",
            "notes.csv",
            WriteDisposition::Merge {
                key_fields: vec!["id".into()],
            },
            vec![text_column("id", false), text_column("note", true)],
        );
        let rows = vec![
            record(&[
                ("id", Value::Text("a".into())),
                ("note", Value::Text("it's 'fine'".into())),
            ]),
            record(&[("id", Value::Text("b".into())), ("note", Value::Null)]),
        ];
        let mut seq = 7;
        let sql = insert_sql(&descriptor, &rows, &mut seq).unwrap();
        assert!(sql.starts_with("INSERT INTO `testdata`.`notes` (`id`, `note`, `_load_seq`) VALUES"));
        assert!(sql.contains("'it\\'s \\'fine\\''"));
        assert!(sql.contains("('a', 'it\\'s \\'fine\\'', 7)"));
        assert!(sql.contains("('b', NULL, 8)"));
        assert_eq!(seq, 9);

        assert!(insert_sql(&descriptor, &[], &mut seq).is_none());
    }

    #[test]
    fn registry_yaml_parses_and_validates() {
        let yaml = r#"
sources:
  - name: wmo_codes
    dataset: meteo
    table: wmo_codes
    strategy:
      kind: json_api
      url: https://example.test/descriptions.json
      entities:
        kind: keyed_object
        key_field: weather_code
    disposition:
      mode: merge
      key_fields: [weather_code]
    columns:
      - { name: weather_code, type: int, nullable: false }
      - { name: day_description, type: text }
  - name: products
    dataset: lazada_products
    table: products
    strategy:
      kind: html_listing
      url: https://shop.test/catalog?q=keyboard
      base_url: https://shop.test
      item_selector: "div.product"
      link_field: url
      fields:
        - { field: name, selector: "a.title", attr: title }
        - { field: url, selector: "a.title", attr: href }
    disposition:
      mode: append
    columns:
      - { name: name, type: text }
      - { name: url, type: text, nullable: false }
"#;
        let registry: SourceRegistry = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(registry.sources.len(), 2);
        for source in &registry.sources {
            source.validate().unwrap();
        }
        assert!(registry.source("wmo_codes").is_some());
        assert!(registry.source("nope").is_none());
    }
}

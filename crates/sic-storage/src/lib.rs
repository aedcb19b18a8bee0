//! HTTP fetch, CSV record file, and remote table clients for the SIC pipelines.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{StatusCode, Url};
use sic_core::{ClassificationRecord, CSV_HEADER};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "sic-storage";

/// Upper bound on how much of an error response body is kept for diagnostics.
const ERROR_BODY_PREVIEW: usize = 200;

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Single-shot page fetcher. There is no retry: a failed fetch ends the run.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_text(&self, run_id: Uuid, url: &str) -> Result<FetchedPage, FetchError> {
        let span = info_span!("http_fetch", %run_id, url);
        self.fetch_once(url).instrument(span).await
    }

    async fn fetch_once(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();

        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = resp.text().await?;
        debug!(bytes = body.len(), "fetched page");
        Ok(FetchedPage {
            status,
            final_url,
            body,
        })
    }
}

#[derive(Debug, Error)]
pub enum RecordFileError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("csv error on {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("unexpected header in {path}: found [{found}], expected [{expected}]", expected = CSV_HEADER.join(","))]
    Header { path: PathBuf, found: String },
}

/// The CSV handoff between the extractor and the synchronizer.
#[derive(Debug, Clone)]
pub struct RecordFile {
    path: PathBuf,
}

impl RecordFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write all records via a temp file and rename, so readers never observe
    /// a partially written table.
    pub async fn write_all(&self, records: &[ClassificationRecord]) -> Result<usize, RecordFileError> {
        let bytes = encode_records(records).map_err(|source| RecordFileError::Csv {
            path: self.path.clone(),
            source,
        })?;

        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).await.map_err(|source| self.io_error(source))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        if let Err(source) = write_then_rename(&temp_path, &self.path, &bytes).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(self.io_error(source));
        }
        Ok(records.len())
    }

    pub async fn read_all(&self) -> Result<Vec<ClassificationRecord>, RecordFileError> {
        let bytes = fs::read(&self.path).await.map_err(|source| self.io_error(source))?;
        decode_records(&bytes).map_err(|err| match err {
            DecodeError::Csv(source) => RecordFileError::Csv {
                path: self.path.clone(),
                source,
            },
            DecodeError::Header(found) => RecordFileError::Header {
                path: self.path.clone(),
                found,
            },
        })
    }

    fn io_error(&self, source: std::io::Error) -> RecordFileError {
        RecordFileError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

async fn write_then_rename(temp_path: &Path, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(temp_path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    drop(file);
    fs::rename(temp_path, path).await
}

/// Serialize records with the fixed header, which is written even when there
/// are no rows.
pub fn encode_records(records: &[ClassificationRecord]) -> Result<Vec<u8>, csv::Error> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer.write_record(CSV_HEADER)?;
    for record in records {
        writer.serialize(record)?;
    }
    writer
        .into_inner()
        .map_err(|err| csv::Error::from(err.into_error()))
}

#[derive(Debug)]
enum DecodeError {
    Csv(csv::Error),
    Header(String),
}

fn decode_records(bytes: &[u8]) -> Result<Vec<ClassificationRecord>, DecodeError> {
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(bytes);
    let headers = reader.headers().map_err(DecodeError::Csv)?;
    if !headers.iter().eq(CSV_HEADER.iter().copied()) {
        return Err(DecodeError::Header(headers.iter().collect::<Vec<_>>().join(",")));
    }
    reader
        .deserialize()
        .collect::<Result<Vec<ClassificationRecord>, _>>()
        .map_err(DecodeError::Csv)
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid store endpoint {0:?}")]
    InvalidEndpoint(String),
    #[error("invalid table or column identifier {0:?}")]
    InvalidIdentifier(String),
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("store responded with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub rows_processed: usize,
}

/// Remote table that the synchronizer writes into. The table must already
/// exist; implementations never create or alter schema.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    fn backend(&self) -> &'static str;

    /// Bounded read used only to prove the table is reachable.
    async fn probe(&self, table: &str) -> Result<(), StoreError>;

    /// Insert new rows and overwrite existing rows matching on `on_conflict`.
    async fn upsert(
        &self,
        table: &str,
        rows: &[ClassificationRecord],
        on_conflict: &str,
    ) -> Result<UpsertOutcome, StoreError>;
}

/// Accept plain SQL identifiers only; anything else never reaches a URL or
/// statement.
pub fn validate_identifier(name: &str) -> Result<&str, StoreError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid && name.len() <= 63 {
        Ok(name)
    } else {
        Err(StoreError::InvalidIdentifier(name.to_string()))
    }
}

/// Supabase/PostgREST table client authenticated with a static key.
#[derive(Debug, Clone)]
pub struct PostgrestStore {
    client: reqwest::Client,
    rest_base: Url,
}

impl PostgrestStore {
    pub fn new(endpoint: &str, api_key: &str, timeout: Duration) -> Result<Self, StoreError> {
        let rest_base = rest_base_url(endpoint)?;

        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(api_key)
            .map_err(|_| StoreError::InvalidEndpoint("api key is not a valid header value".into()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| StoreError::InvalidEndpoint("api key is not a valid header value".into()))?;
        headers.insert("apikey", key);
        headers.insert(AUTHORIZATION, bearer);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;
        Ok(Self { client, rest_base })
    }

    pub fn table_url(&self, table: &str) -> Result<Url, StoreError> {
        let table = validate_identifier(table)?;
        self.rest_base
            .join(table)
            .map_err(|_| StoreError::InvalidIdentifier(table.to_string()))
    }
}

fn rest_base_url(endpoint: &str) -> Result<Url, StoreError> {
    let trimmed = endpoint.trim().trim_end_matches('/');
    let url = Url::parse(&format!("{trimmed}/rest/v1/"))
        .map_err(|_| StoreError::InvalidEndpoint(endpoint.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        _ => Err(StoreError::InvalidEndpoint(endpoint.to_string())),
    }
}

async fn error_for_status(resp: reqwest::Response) -> Result<reqwest::Response, StoreError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(StoreError::Status {
        status: status.as_u16(),
        body: body.chars().take(ERROR_BODY_PREVIEW).collect(),
    })
}

#[async_trait]
impl RemoteStore for PostgrestStore {
    fn backend(&self) -> &'static str {
        "postgrest"
    }

    async fn probe(&self, table: &str) -> Result<(), StoreError> {
        let url = self.table_url(table)?;
        let resp = self
            .client
            .get(url)
            .query(&[("select", "*"), ("limit", "1")])
            .send()
            .await?;
        error_for_status(resp).await?;
        Ok(())
    }

    async fn upsert(
        &self,
        table: &str,
        rows: &[ClassificationRecord],
        on_conflict: &str,
    ) -> Result<UpsertOutcome, StoreError> {
        let url = self.table_url(table)?;
        let on_conflict = validate_identifier(on_conflict)?;
        let resp = self
            .client
            .post(url)
            .query(&[("on_conflict", on_conflict)])
            .header("Prefer", "resolution=merge-duplicates,return=representation")
            .json(rows)
            .send()
            .await?;
        let resp = error_for_status(resp).await?;
        let returned: Vec<serde_json::Value> = resp.json().await?;
        Ok(UpsertOutcome {
            rows_processed: returned.len(),
        })
    }
}

/// Direct Postgres client for the same table, for deployments that expose the
/// database rather than a REST gateway.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(database_url: &str, timeout: Duration) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(timeout)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }
}

/// Build the upsert statement for the record columns. Every non-key column is
/// overwritten from the incoming row.
pub fn upsert_statement<'a>(
    table: &str,
    rows: &'a [ClassificationRecord],
    on_conflict: &str,
) -> Result<QueryBuilder<'a, Postgres>, StoreError> {
    let table = validate_identifier(table)?;
    let on_conflict = validate_identifier(on_conflict)?;
    if !CSV_HEADER.contains(&on_conflict) {
        return Err(StoreError::InvalidIdentifier(on_conflict.to_string()));
    }

    let mut builder = QueryBuilder::new(format!(
        "INSERT INTO {table} ({}) ",
        CSV_HEADER.join(", ")
    ));
    builder.push_values(rows, |mut row, record| {
        row.push_bind(record.code.as_str())
            .push_bind(record.description.as_str())
            .push_bind(record.section.as_str())
            .push_bind(record.section_title.as_str());
    });

    let updates = CSV_HEADER
        .iter()
        .filter(|column| **column != on_conflict)
        .map(|column| format!("{column} = EXCLUDED.{column}"))
        .collect::<Vec<_>>()
        .join(", ");
    builder.push(format!(" ON CONFLICT ({on_conflict}) DO UPDATE SET {updates}"));
    Ok(builder)
}

#[async_trait]
impl RemoteStore for PostgresStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn probe(&self, table: &str) -> Result<(), StoreError> {
        let table = validate_identifier(table)?;
        let sql = format!("SELECT 1 FROM {table} LIMIT 1");
        sqlx::query(&sql).fetch_optional(&self.pool).await?;
        Ok(())
    }

    async fn upsert(
        &self,
        table: &str,
        rows: &[ClassificationRecord],
        on_conflict: &str,
    ) -> Result<UpsertOutcome, StoreError> {
        if rows.is_empty() {
            return Ok(UpsertOutcome { rows_processed: 0 });
        }
        let mut builder = upsert_statement(table, rows, on_conflict)?;
        let result = builder.build().execute(&self.pool).await?;
        Ok(UpsertOutcome {
            rows_processed: result.rows_affected() as usize,
        })
    }
}

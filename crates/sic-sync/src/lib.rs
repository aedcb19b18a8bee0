//! Extract and synchronize pipelines for the SIC code table.
//!
//! The two pipelines never share process state. `run_extract_once` writes the
//! CSV handoff file and `run_sync_once` reads it back and upserts it in batches.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sic_adapters::{adapter_for_source, AdapterContext, COMPANIES_HOUSE_SIC_URL, COMPANIES_HOUSE_SOURCE_ID};
use sic_core::{ClassificationRecord, SectionTally};
use sic_storage::{
    HttpClientConfig, HttpFetcher, PostgresStore, PostgrestStore, RecordFile, RemoteStore, StoreError,
};
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "sic-sync";

pub const DEFAULT_CSV_PATH: &str = "sic_codes.csv";
pub const DEFAULT_TABLE: &str = "sic_codes";
pub const CONFLICT_KEY: &str = "sic_code";
pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_BATCH_PAUSE: Duration = Duration::from_secs(1);

const DEFAULT_USER_AGENT: &str = "sic-codes-bot/0.1";
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{} must be set (create a .env file with the required variables)", .vars.join(" and "))]
    Missing { vars: Vec<&'static str> },
    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

fn lookup_or<F>(lookup: &F, var: &str, default: &str) -> String
where
    F: Fn(&str) -> Option<String>,
{
    lookup(var)
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_number<F>(lookup: &F, var: &'static str, default: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var).filter(|v| !v.trim().is_empty()) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
            var,
            value,
            reason: "expected a non-negative integer".to_string(),
        }),
    }
}

fn env_lookup(var: &str) -> Option<String> {
    std::env::var(var).ok()
}

#[derive(Debug, Clone)]
pub struct ExtractConfig {
    pub source_url: String,
    pub csv_path: PathBuf,
    pub user_agent: String,
    pub http_timeout: Duration,
}

impl ExtractConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            source_url: lookup_or(&lookup, "SIC_SOURCE_URL", COMPANIES_HOUSE_SIC_URL),
            csv_path: PathBuf::from(lookup_or(&lookup, "SIC_CSV_PATH", DEFAULT_CSV_PATH)),
            user_agent: lookup_or(&lookup, "SIC_USER_AGENT", DEFAULT_USER_AGENT),
            http_timeout: Duration::from_secs(parse_number(
                &lookup,
                "SIC_HTTP_TIMEOUT_SECS",
                DEFAULT_HTTP_TIMEOUT_SECS,
            )?),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Postgrest,
    Postgres,
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Postgrest => f.write_str("postgrest"),
            Self::Postgres => f.write_str("postgres"),
        }
    }
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgrest" | "supabase" => Ok(Self::Postgrest),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            other => Err(format!("unknown store backend {other:?} (expected postgrest or postgres)")),
        }
    }
}

/// Secrets for the configured backend. Debug output never shows them.
#[derive(Clone)]
pub enum StoreCredentials {
    Postgrest { url: String, key: String },
    Postgres { database_url: String },
}

impl fmt::Debug for StoreCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Postgrest { url, .. } => f
                .debug_struct("Postgrest")
                .field("url", url)
                .field("key", &"<redacted>")
                .finish(),
            Self::Postgres { .. } => f
                .debug_struct("Postgres")
                .field("database_url", &"<redacted>")
                .finish(),
        }
    }
}

impl StoreCredentials {
    pub fn backend(&self) -> StoreBackend {
        match self {
            Self::Postgrest { .. } => StoreBackend::Postgrest,
            Self::Postgres { .. } => StoreBackend::Postgres,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub credentials: StoreCredentials,
    pub csv_path: PathBuf,
    pub table: String,
    pub batch_size: usize,
    pub batch_pause: Duration,
    pub http_timeout: Duration,
}

impl SyncConfig {
    pub fn from_env(backend: StoreBackend) -> Result<Self, ConfigError> {
        Self::from_lookup(backend, env_lookup)
    }

    pub fn from_lookup<F>(backend: StoreBackend, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |var: &'static str| lookup(var).filter(|v| !v.trim().is_empty());

        let credentials = match backend {
            StoreBackend::Postgrest => {
                let url = required("SUPABASE_URL");
                let key = required("SUPABASE_KEY");
                match (url, key) {
                    (Some(url), Some(key)) => StoreCredentials::Postgrest { url, key },
                    (url, key) => {
                        let mut vars = Vec::new();
                        if url.is_none() {
                            vars.push("SUPABASE_URL");
                        }
                        if key.is_none() {
                            vars.push("SUPABASE_KEY");
                        }
                        return Err(ConfigError::Missing { vars });
                    }
                }
            }
            StoreBackend::Postgres => match required("DATABASE_URL") {
                Some(database_url) => StoreCredentials::Postgres { database_url },
                None => {
                    return Err(ConfigError::Missing {
                        vars: vec!["DATABASE_URL"],
                    })
                }
            },
        };

        let batch_size = parse_number(&lookup, "SIC_BATCH_SIZE", DEFAULT_BATCH_SIZE as u64)? as usize;
        if batch_size == 0 {
            return Err(ConfigError::Invalid {
                var: "SIC_BATCH_SIZE",
                value: "0".to_string(),
                reason: "batch size must be at least 1".to_string(),
            });
        }

        Ok(Self {
            credentials,
            csv_path: PathBuf::from(lookup_or(&lookup, "SIC_CSV_PATH", DEFAULT_CSV_PATH)),
            table: lookup_or(&lookup, "SIC_TABLE", DEFAULT_TABLE),
            batch_size,
            batch_pause: Duration::from_millis(parse_number(
                &lookup,
                "SIC_BATCH_PAUSE_MS",
                DEFAULT_BATCH_PAUSE.as_millis() as u64,
            )?),
            http_timeout: Duration::from_secs(parse_number(
                &lookup,
                "SIC_HTTP_TIMEOUT_SECS",
                DEFAULT_HTTP_TIMEOUT_SECS,
            )?),
        })
    }

    pub fn options(&self) -> SyncOptions {
        SyncOptions {
            table: self.table.clone(),
            on_conflict: CONFLICT_KEY.to_string(),
            batch_size: self.batch_size,
            batch_pause: self.batch_pause,
        }
    }
}

/// Build the store client for the configured backend. Failures here are
/// initialization errors; nothing has been read or written yet.
pub async fn connect_store(config: &SyncConfig) -> Result<Arc<dyn RemoteStore>, StoreError> {
    match &config.credentials {
        StoreCredentials::Postgrest { url, key } => {
            info!(url = %url, "connecting to PostgREST endpoint");
            Ok(Arc::new(PostgrestStore::new(url, key, config.http_timeout)?))
        }
        StoreCredentials::Postgres { database_url } => {
            info!("connecting to Postgres");
            Ok(Arc::new(PostgresStore::connect(database_url, config.http_timeout).await?))
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source_url: String,
    pub csv_path: String,
    pub records: usize,
    pub tally: SectionTally,
}

/// Fetch, parse, classify, and write the CSV. Any failure ends the run before
/// the file is touched.
pub async fn run_extract_once(config: &ExtractConfig) -> Result<ExtractRunSummary> {
    let ctx = AdapterContext::new();
    let span = info_span!("extract", run_id = %ctx.run_id);
    extract_with_context(config, ctx).instrument(span).await
}

async fn extract_with_context(config: &ExtractConfig, ctx: AdapterContext) -> Result<ExtractRunSummary> {
    let adapter = adapter_for_source(COMPANIES_HOUSE_SOURCE_ID, Some(config.source_url.as_str()))
        .with_context(|| format!("no adapter registered for {COMPANIES_HOUSE_SOURCE_ID}"))?;
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: config.http_timeout,
        user_agent: Some(config.user_agent.clone()),
    })?;

    info!(url = %config.source_url, "fetching SIC codes");
    let page = adapter.fetch(&http, &ctx).await?;
    let extraction = adapter.parse(&page.body)?;

    let file = RecordFile::new(&config.csv_path);
    let written = file
        .write_all(&extraction.records)
        .await
        .with_context(|| format!("writing {}", config.csv_path.display()))?;
    info!(records = written, path = %config.csv_path.display(), "saved SIC codes");

    Ok(ExtractRunSummary {
        run_id: ctx.run_id,
        started_at: ctx.started_at,
        finished_at: Utc::now(),
        source_url: page.final_url,
        csv_path: config.csv_path.display().to_string(),
        records: written,
        tally: extraction.tally,
    })
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(
        "table {table:?} might not exist or is not accessible: {source}; \
         create it with the table schema script before syncing"
    )]
    TableUnavailable {
        table: String,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub table: String,
    pub on_conflict: String,
    pub batch_size: usize,
    pub batch_pause: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            table: DEFAULT_TABLE.to_string(),
            on_conflict: CONFLICT_KEY.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            batch_pause: DEFAULT_BATCH_PAUSE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BatchOutcome {
    Uploaded { rows_processed: usize },
    Failed { error: String, sample: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    /// 1-based position of the batch in the run.
    pub ordinal: usize,
    pub size: usize,
    pub outcome: BatchOutcome,
}

impl BatchReport {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, BatchOutcome::Uploaded { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Completed,
    CompletedWithFailures,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub backend: String,
    pub table: String,
    pub total_records: usize,
    pub total_batches: usize,
    pub successful_batches: usize,
    pub failed_batches: usize,
    pub batches: Vec<BatchReport>,
}

impl SyncRunSummary {
    pub fn status(&self) -> SyncStatus {
        if self.failed_batches == 0 {
            SyncStatus::Completed
        } else {
            SyncStatus::CompletedWithFailures
        }
    }
}

/// Batched, keyed upserts into one remote table. Every batch is attempted
/// exactly once per run; a failed batch is reported and the loop moves on.
pub struct Synchronizer {
    store: Arc<dyn RemoteStore>,
    options: SyncOptions,
}

impl Synchronizer {
    pub fn new(store: Arc<dyn RemoteStore>, options: SyncOptions) -> Self {
        let options = SyncOptions {
            batch_size: options.batch_size.max(1),
            ..options
        };
        Self { store, options }
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    pub async fn check_table(&self) -> Result<(), SyncError> {
        match self.store.probe(&self.options.table).await {
            Ok(()) => {
                info!(table = %self.options.table, "table exists and is accessible");
                Ok(())
            }
            Err(source) => {
                error!(table = %self.options.table, error = %source, "table check failed");
                Err(SyncError::TableUnavailable {
                    table: self.options.table.clone(),
                    source,
                })
            }
        }
    }

    /// Table check followed by the batch loop. A failed check aborts before
    /// any upload.
    pub async fn run(&self, records: &[ClassificationRecord]) -> Result<SyncRunSummary, SyncError> {
        self.check_table().await?;
        Ok(self.upload(records).await)
    }

    /// The batch loop alone. Assumes the table check already passed.
    pub async fn upload(&self, records: &[ClassificationRecord]) -> SyncRunSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let batch_size = self.options.batch_size;
        let total_batches = records.len().div_ceil(batch_size);
        info!(%run_id, total_records = records.len(), total_batches, "starting upload");

        let mut batches = Vec::with_capacity(total_batches);
        for (index, batch) in records.chunks(batch_size).enumerate() {
            if index > 0 && !self.options.batch_pause.is_zero() {
                tokio::time::sleep(self.options.batch_pause).await;
            }

            let ordinal = index + 1;
            info!(batch = ordinal, total_batches, size = batch.len(), "uploading batch");
            let outcome = match self
                .store
                .upsert(&self.options.table, batch, &self.options.on_conflict)
                .await
            {
                Ok(result) => {
                    info!(
                        batch = ordinal,
                        rows_processed = result.rows_processed,
                        "batch uploaded"
                    );
                    BatchOutcome::Uploaded {
                        rows_processed: result.rows_processed,
                    }
                }
                Err(err) => {
                    let sample = batch.first().map(sample_json).unwrap_or_default();
                    warn!(batch = ordinal, error = %err, sample = %sample, "batch upload failed");
                    BatchOutcome::Failed {
                        error: err.to_string(),
                        sample,
                    }
                }
            };
            batches.push(BatchReport {
                ordinal,
                size: batch.len(),
                outcome,
            });
        }

        let successful_batches = batches.iter().filter(|b| b.succeeded()).count();
        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            backend: self.store.backend().to_string(),
            table: self.options.table.clone(),
            total_records: records.len(),
            total_batches,
            successful_batches,
            failed_batches: batches.len() - successful_batches,
            batches,
        };
        info!(
            %run_id,
            successful = summary.successful_batches,
            failed = summary.failed_batches,
            "upload finished"
        );
        summary
    }
}

fn sample_json(record: &ClassificationRecord) -> String {
    serde_json::to_string(record).unwrap_or_else(|_| record.code.clone())
}

/// Check the table, then read the CSV and upload it in batches.
pub async fn run_sync_once(config: &SyncConfig) -> Result<SyncRunSummary> {
    let store = connect_store(config)
        .await
        .context("initializing remote store client")?;
    let synchronizer = Synchronizer::new(store, config.options());
    run_sync_with(&synchronizer, &RecordFile::new(&config.csv_path)).await
}

pub async fn run_sync_with(synchronizer: &Synchronizer, file: &RecordFile) -> Result<SyncRunSummary> {
    synchronizer.check_table().await?;

    let records = file
        .read_all()
        .await
        .with_context(|| format!("reading {}", file.path().display()))?;
    info!(records = records.len(), path = %file.path().display(), "found SIC codes to upload");

    Ok(synchronizer.upload(&records).await)
}

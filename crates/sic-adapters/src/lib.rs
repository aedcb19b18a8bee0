//! Source adapter contract and the Companies House SIC table adapter.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html, Selector};
use sic_core::{ClassificationRecord, SectionTally};
use sic_storage::{FetchError, FetchedPage, HttpFetcher};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "sic-adapters";

pub const COMPANIES_HOUSE_SOURCE_ID: &str = "companies-house";
pub const COMPANIES_HOUSE_SIC_URL: &str = "https://resources.companieshouse.gov.uk/sic/";

/// Code cells longer than this are prose, not codes.
pub const MAX_CODE_LEN: usize = 10;

/// Marker carried by section header rows inside the table body.
pub const SECTION_HEADER_MARKER: &str = "Section";

const PROGRESS_EVERY: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
        }
    }
}

impl Default for AdapterContext {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("error fetching the source page: {0}")]
    Fetch(#[from] FetchError),
    #[error("could not find the SIC codes table; page structure may have changed")]
    TableNotFound,
    #[error("no SIC codes were found; page structure may have changed")]
    NoRecords,
    #[error("invalid selector {selector:?}: {message}")]
    Selector { selector: String, message: String },
}

impl ExtractError {
    /// Parse-level failures, as opposed to network-level ones.
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::TableNotFound | Self::NoRecords)
    }
}

/// Records pulled from one page, in source order, plus their section counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    pub records: Vec<ClassificationRecord>,
    pub tally: SectionTally,
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;

    fn source_url(&self) -> &str;

    async fn fetch(&self, http: &HttpFetcher, ctx: &AdapterContext) -> Result<FetchedPage, ExtractError> {
        Ok(http.fetch_text(ctx.run_id, self.source_url()).await?)
    }

    fn parse(&self, html: &str) -> Result<Extraction, ExtractError>;
}

#[derive(Debug, Clone)]
pub struct CompaniesHouseSicAdapter {
    url: String,
}

impl CompaniesHouseSicAdapter {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl Default for CompaniesHouseSicAdapter {
    fn default() -> Self {
        Self::new(COMPANIES_HOUSE_SIC_URL)
    }
}

#[async_trait]
impl SourceAdapter for CompaniesHouseSicAdapter {
    fn source_id(&self) -> &'static str {
        COMPANIES_HOUSE_SOURCE_ID
    }

    fn source_url(&self) -> &str {
        &self.url
    }

    fn parse(&self, html: &str) -> Result<Extraction, ExtractError> {
        let rows = parse_table_rows(html)?;
        extract_records(&rows)
    }
}

pub fn adapter_for_source(source_id: &str, url: Option<&str>) -> Option<Box<dyn SourceAdapter>> {
    match source_id {
        COMPANIES_HOUSE_SOURCE_ID => Some(Box::new(
            url.map(CompaniesHouseSicAdapter::new).unwrap_or_default(),
        )),
        _ => None,
    }
}

fn selector(css: &str) -> Result<Selector, ExtractError> {
    Selector::parse(css).map_err(|e| ExtractError::Selector {
        selector: css.to_string(),
        message: e.to_string(),
    })
}

fn cell_text(cell: ElementRef<'_>) -> String {
    cell.text().collect::<String>().trim().to_string()
}

/// Collect the trimmed `<td>` texts of every row in the first table on the
/// page. Header rows built from `<th>` come back with no cells.
pub fn parse_table_rows(html: &str) -> Result<Vec<Vec<String>>, ExtractError> {
    let document = Html::parse_document(html);
    let table_sel = selector("table")?;
    let row_sel = selector("tr")?;
    let cell_sel = selector("td")?;

    let table = document
        .select(&table_sel)
        .next()
        .ok_or(ExtractError::TableNotFound)?;

    Ok(table
        .select(&row_sel)
        .map(|row| row.select(&cell_sel).map(cell_text).collect())
        .collect())
}

/// Split a two-cell row into `(code, description)` when it is a data row.
pub fn accept_row(cells: &[String]) -> Option<(&str, &str)> {
    let [code, description] = cells else {
        return None;
    };
    if code.is_empty() || code.contains(SECTION_HEADER_MARKER) || code.chars().count() > MAX_CODE_LEN {
        return None;
    }
    Some((code.as_str(), description.as_str()))
}

/// Turn parsed rows into classified records. An empty result is a structural
/// failure, never an empty success.
pub fn extract_records(rows: &[Vec<String>]) -> Result<Extraction, ExtractError> {
    let mut extraction = Extraction::default();

    for (code, description) in rows.iter().filter_map(|cells| accept_row(cells)) {
        let record = ClassificationRecord::classified(code, description);
        extraction.tally.record(&record.section);
        extraction.records.push(record);

        if extraction.records.len() % PROGRESS_EVERY == 0 {
            info!(processed = extraction.records.len(), "processed SIC codes so far");
        }
    }

    if extraction.records.is_empty() {
        return Err(ExtractError::NoRecords);
    }
    Ok(extraction)
}

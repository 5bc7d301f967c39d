//! Batch ingestion pipeline: tabular rows in, deduplicated and enriched
//! records committed to the catalog store, snapshot export out.
//!
//! The store-side pre-filter is an optimization that avoids wasted
//! generation calls; the storage-level unique index remains the backstop,
//! so a row turning into a duplicate between staging and commit is still
//! rejected and counted.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

use anyhow::{bail, Context, Result};
use calamine::Reader;
use chrono::{DateTime, Utc};
use pce_core::{
    normalize, ProductRecord, IMAGE_FIELD, LONG_DESCRIPTION_FIELD, SHORT_DESCRIPTION_FIELD,
};
use pce_enrich::{Enricher, Enrichment, EnrichmentKind};
use pce_store::CatalogStore;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use strsim::jaro_winkler;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pce-ingest";

#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Input column holding the deduplication key.
    pub identifier_column: String,
    /// Cap on candidates per run; 0 disables the cap.
    pub batch_limit: usize,
    pub kinds: Vec<EnrichmentKind>,
    /// Advisory-only similarity threshold; flagged rows still proceed.
    pub near_duplicate_threshold: f64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            identifier_column: "Item Description".to_string(),
            batch_limit: 25,
            kinds: vec![
                EnrichmentKind::ShortDescription,
                EnrichmentKind::LongDescription,
            ],
            near_duplicate_threshold: 0.92,
        }
    }
}

impl IngestConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            identifier_column: std::env::var("PCE_IDENTIFIER_COLUMN")
                .unwrap_or(defaults.identifier_column),
            batch_limit: std::env::var("PCE_BATCH_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.batch_limit),
            kinds: std::env::var("PCE_GENERATE")
                .ok()
                .map(|v| v.split(',').filter_map(|k| k.parse().ok()).collect())
                .filter(|kinds: &Vec<EnrichmentKind>| !kinds.is_empty())
                .unwrap_or(defaults.kinds),
            near_duplicate_threshold: std::env::var("PCE_NEAR_DUPLICATE_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.near_duplicate_threshold),
        }
    }
}

/// Parsed rows from one uploaded file, before filtering. Cells that are
/// empty after trimming are omitted from the row maps.
#[derive(Debug, Clone, Default)]
pub struct TabularBatch {
    pub columns: Vec<String>,
    pub rows: Vec<BTreeMap<String, JsonValue>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RowStatus {
    MissingIdentifier,
    DuplicateAtFilter,
    OverBatchLimit,
    EnrichmentFailed { reason: String },
    Inserted,
    RejectedAtCommit,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowReport {
    pub identifier: String,
    pub status: RowStatus,
    /// Closest existing identifier when similarity crossed the advisory
    /// threshold without being an exact normalized match.
    pub near_duplicate_of: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CandidateRow {
    pub record: ProductRecord,
    pub near_duplicate_of: Option<String>,
}

/// Enriched rows held in memory, not yet persisted. Commit is a separate,
/// explicit step; an interrupted run loses only this transient state.
#[derive(Debug)]
pub struct StagedBatch {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub source_file: String,
    pub rows_parsed: usize,
    pub columns_dropped: Vec<String>,
    pub store_degraded: bool,
    pub reports: Vec<RowReport>,
    pub staged: Vec<CandidateRow>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source_file: String,
    pub store_degraded: bool,
    pub rows_parsed: usize,
    pub columns_dropped: Vec<String>,
    pub missing_identifier: usize,
    pub duplicates_at_filter: usize,
    pub over_batch_limit: usize,
    pub enrichment_failures: usize,
    pub inserted: usize,
    pub rejected_at_commit: usize,
    pub rows: Vec<RowReport>,
}

impl IngestSummary {
    fn count(reports: &[RowReport], matcher: impl Fn(&RowStatus) -> bool) -> usize {
        reports.iter().filter(|r| matcher(&r.status)).count()
    }
}

pub struct IngestPipeline {
    store: Box<dyn CatalogStore>,
    enricher: Box<dyn Enricher>,
    config: IngestConfig,
}

impl IngestPipeline {
    pub fn new(
        store: Box<dyn CatalogStore>,
        enricher: Box<dyn Enricher>,
        config: IngestConfig,
    ) -> Self {
        Self {
            store,
            enricher,
            config,
        }
    }

    /// Loaded → Filtered → Capped → Enriched. Duplicate detection runs once
    /// here, against the store state at this instant.
    pub async fn stage(&mut self, input: &Path) -> Result<StagedBatch> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let mut batch = load_rows(input)?;
        let columns_dropped = drop_empty_columns(&mut batch);
        let rows_parsed = batch.rows.len();

        let store_degraded = !self.store.health().is_available();
        if store_degraded {
            warn!(%run_id, "catalog store unavailable; filtering against an empty view");
        }
        let existing = self.store.get_all().context("scanning catalog store")?;
        let existing_norms: HashSet<String> = existing
            .iter()
            .map(|record| record.normalized_identifier())
            .collect();

        let mut reports = Vec::new();
        let mut candidates = Vec::new();
        for mut fields in batch.rows {
            let identifier = fields
                .remove(&self.config.identifier_column)
                .map(|value| value_to_text(&value))
                .unwrap_or_default();
            let normalized = normalize(&identifier);
            if normalized.is_empty() {
                reports.push(RowReport {
                    identifier,
                    status: RowStatus::MissingIdentifier,
                    near_duplicate_of: None,
                });
                continue;
            }
            if existing_norms.contains(&normalized) {
                reports.push(RowReport {
                    identifier,
                    status: RowStatus::DuplicateAtFilter,
                    near_duplicate_of: None,
                });
                continue;
            }
            let near_duplicate_of = nearest_existing(
                &normalized,
                &existing,
                self.config.near_duplicate_threshold,
            );
            if let Some(close_to) = &near_duplicate_of {
                warn!(identifier = %identifier, %close_to, "near-duplicate identifier; row kept, flagged");
            }
            candidates.push(CandidateRow {
                record: ProductRecord { identifier, fields },
                near_duplicate_of,
            });
        }

        if self.config.batch_limit > 0 && candidates.len() > self.config.batch_limit {
            for dropped in candidates.split_off(self.config.batch_limit) {
                reports.push(RowReport {
                    identifier: dropped.record.identifier,
                    status: RowStatus::OverBatchLimit,
                    near_duplicate_of: dropped.near_duplicate_of,
                });
            }
        }

        // Strictly sequential generation calls; the cap above is the
        // backpressure mechanism. One failed row never aborts the batch.
        let mut staged = Vec::new();
        for candidate in candidates {
            match self
                .enricher
                .enrich(&candidate.record, &self.config.kinds)
                .await
            {
                Ok(enrichment) => {
                    let mut record = candidate.record;
                    apply_enrichment(&mut record, enrichment);
                    staged.push(CandidateRow {
                        record,
                        near_duplicate_of: candidate.near_duplicate_of,
                    });
                }
                Err(err) => {
                    warn!(
                        identifier = %candidate.record.identifier,
                        error = %err,
                        "enrichment failed; row recorded and skipped"
                    );
                    reports.push(RowReport {
                        identifier: candidate.record.identifier,
                        status: RowStatus::EnrichmentFailed {
                            reason: err.to_string(),
                        },
                        near_duplicate_of: candidate.near_duplicate_of,
                    });
                }
            }
        }

        info!(%run_id, rows_parsed, staged = staged.len(), "batch staged");
        Ok(StagedBatch {
            run_id,
            started_at,
            source_file: input.display().to_string(),
            rows_parsed,
            columns_dropped,
            store_degraded,
            reports,
            staged,
        })
    }

    /// Commit staged rows one insert at a time. The set may have drifted
    /// since staging; the unique index decides, and the split is reported.
    pub fn commit(&mut self, staged: StagedBatch) -> Result<IngestSummary> {
        let StagedBatch {
            run_id,
            started_at,
            source_file,
            rows_parsed,
            columns_dropped,
            store_degraded,
            mut reports,
            staged,
        } = staged;

        for row in staged {
            let inserted = self
                .store
                .insert(&row.record)
                .context("inserting staged record")?;
            reports.push(RowReport {
                identifier: row.record.identifier,
                status: if inserted {
                    RowStatus::Inserted
                } else {
                    RowStatus::RejectedAtCommit
                },
                near_duplicate_of: row.near_duplicate_of,
            });
        }

        let summary = IngestSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            source_file,
            store_degraded,
            rows_parsed,
            columns_dropped,
            missing_identifier: IngestSummary::count(&reports, |s| {
                matches!(s, RowStatus::MissingIdentifier)
            }),
            duplicates_at_filter: IngestSummary::count(&reports, |s| {
                matches!(s, RowStatus::DuplicateAtFilter)
            }),
            over_batch_limit: IngestSummary::count(&reports, |s| {
                matches!(s, RowStatus::OverBatchLimit)
            }),
            enrichment_failures: IngestSummary::count(&reports, |s| {
                matches!(s, RowStatus::EnrichmentFailed { .. })
            }),
            inserted: IngestSummary::count(&reports, |s| matches!(s, RowStatus::Inserted)),
            rejected_at_commit: IngestSummary::count(&reports, |s| {
                matches!(s, RowStatus::RejectedAtCommit)
            }),
            rows: reports,
        };
        info!(
            run_id = %summary.run_id,
            inserted = summary.inserted,
            rejected = summary.rejected_at_commit,
            "batch committed"
        );
        Ok(summary)
    }

    pub async fn run(&mut self, input: &Path) -> Result<IngestSummary> {
        let staged = self.stage(input).await?;
        self.commit(staged)
    }
}

fn apply_enrichment(record: &mut ProductRecord, enrichment: Enrichment) {
    if let Some(image) = enrichment.image {
        record
            .fields
            .insert(IMAGE_FIELD.to_string(), JsonValue::String(image));
    }
    if let Some(short) = enrichment.short_description {
        record
            .fields
            .insert(SHORT_DESCRIPTION_FIELD.to_string(), JsonValue::String(short));
    }
    if let Some(long) = enrichment.long_description {
        record
            .fields
            .insert(LONG_DESCRIPTION_FIELD.to_string(), JsonValue::String(long));
    }
}

/// Loose key used only for the advisory similarity check: ASCII lowercase,
/// alphanumeric runs joined by single spaces.
fn loose_key(input: &str) -> String {
    input
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn nearest_existing(
    normalized: &str,
    existing: &[ProductRecord],
    threshold: f64,
) -> Option<String> {
    if existing.is_empty() || threshold >= 1.0 {
        return None;
    }
    let key = loose_key(normalized);
    let mut best: Option<(f64, &ProductRecord)> = None;
    for record in existing {
        let score = jaro_winkler(&key, &loose_key(&record.normalized_identifier()));
        if score >= threshold && best.map_or(true, |(top, _)| score > top) {
            best = Some((score, record));
        }
    }
    best.map(|(_, record)| record.identifier.clone())
}

// ------------------------------
// Tabular input
// ------------------------------

pub fn load_rows(path: &Path) -> Result<TabularBatch> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match extension.as_str() {
        "csv" => load_csv(path),
        "xlsx" | "xls" | "ods" => load_excel(path),
        other => bail!(
            "unsupported input format `{other}` for {} (expected csv, xlsx, xls, or ods)",
            path.display()
        ),
    }
}

fn load_csv(path: &Path) -> Result<TabularBatch> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let columns: Vec<String> = reader
        .headers()
        .with_context(|| format!("reading header of {}", path.display()))?
        .iter()
        .map(|header| header.trim().to_string())
        .collect();

    let mut rows = Vec::new();
    for result in reader.records() {
        let record = result.with_context(|| format!("reading row of {}", path.display()))?;
        let mut fields = BTreeMap::new();
        for (idx, cell) in record.iter().enumerate() {
            let Some(column) = columns.get(idx) else {
                continue;
            };
            if column.is_empty() {
                continue;
            }
            let value = parse_cell(cell);
            if !value.is_null() {
                fields.insert(column.clone(), value);
            }
        }
        if !fields.is_empty() {
            rows.push(fields);
        }
    }
    Ok(TabularBatch {
        columns: columns.into_iter().filter(|c| !c.is_empty()).collect(),
        rows,
    })
}

fn load_excel(path: &Path) -> Result<TabularBatch> {
    let mut workbook = calamine::open_workbook_auto(path)
        .with_context(|| format!("opening workbook {}", path.display()))?;
    let names: Vec<String> = workbook.sheet_names();
    let Some(sheet) = names.first().cloned() else {
        bail!("workbook {} has no sheets", path.display());
    };
    let range = workbook
        .worksheet_range(&sheet)
        .map_err(|err| anyhow::anyhow!("reading sheet `{sheet}` of {}: {err}", path.display()))?;

    let mut rows_iter = range.rows();
    let Some(header_row) = rows_iter.next() else {
        return Ok(TabularBatch::default());
    };
    let columns: Vec<String> = header_row
        .iter()
        .map(|cell| cell_to_text(cell).trim().to_string())
        .collect();

    let mut rows = Vec::new();
    for row in rows_iter {
        let mut fields = BTreeMap::new();
        for (idx, cell) in row.iter().enumerate() {
            let Some(column) = columns.get(idx) else {
                continue;
            };
            if column.is_empty() {
                continue;
            }
            let value = cell_to_value(cell);
            if !value.is_null() {
                fields.insert(column.clone(), value);
            }
        }
        if !fields.is_empty() {
            rows.push(fields);
        }
    }
    Ok(TabularBatch {
        columns: columns.into_iter().filter(|c| !c.is_empty()).collect(),
        rows,
    })
}

fn parse_cell(cell: &str) -> JsonValue {
    let trimmed = cell.trim();
    if trimmed.is_empty() {
        return JsonValue::Null;
    }
    if let Ok(int) = trimmed.parse::<i64>() {
        return JsonValue::from(int);
    }
    if let Ok(float) = trimmed.parse::<f64>() {
        if float.is_finite() {
            return JsonValue::from(float);
        }
    }
    JsonValue::String(trimmed.to_string())
}

fn cell_to_value(cell: &calamine::DataType) -> JsonValue {
    use calamine::DataType as D;
    match cell {
        D::Empty => JsonValue::Null,
        D::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                JsonValue::Null
            } else {
                JsonValue::String(trimmed.to_string())
            }
        }
        D::Float(f) => {
            if f.fract() == 0.0 {
                JsonValue::from(*f as i64)
            } else {
                JsonValue::from(*f)
            }
        }
        D::Int(i) => JsonValue::from(*i),
        D::Bool(b) => JsonValue::Bool(*b),
        D::Error(e) => JsonValue::String(format!("#ERR:{e:?}")),
        other => JsonValue::String(format!("{other}")),
    }
}

fn cell_to_text(cell: &calamine::DataType) -> String {
    value_to_text(&cell_to_value(cell))
}

fn value_to_text(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.clone(),
        JsonValue::Bool(b) => {
            if *b {
                "TRUE".to_string()
            } else {
                "FALSE".to_string()
            }
        }
        JsonValue::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Drop columns that carry no value in any row (schema cleanup on load).
fn drop_empty_columns(batch: &mut TabularBatch) -> Vec<String> {
    let used: HashSet<String> = batch
        .rows
        .iter()
        .flat_map(|row| row.keys().cloned())
        .collect();
    let mut dropped = Vec::new();
    batch.columns.retain(|column| {
        if used.contains(column) {
            true
        } else {
            dropped.push(column.clone());
            false
        }
    });
    dropped
}

// ------------------------------
// Snapshot export
// ------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ExportReport {
    pub path: String,
    pub rows: usize,
    pub bytes: u64,
    pub sha256: String,
    pub store_degraded: bool,
}

/// Write the full store as CSV: one row per record, identifier column
/// first, then the union of field names across records, sorted.
pub fn export_csv(
    store: &dyn CatalogStore,
    identifier_column: &str,
    out_path: &Path,
) -> Result<ExportReport> {
    let records = store
        .get_all()
        .context("scanning catalog store for export")?;
    let mut columns: BTreeSet<String> = BTreeSet::new();
    for record in &records {
        columns.extend(record.fields.keys().cloned());
    }

    let mut writer = csv::Writer::from_path(out_path)
        .with_context(|| format!("creating {}", out_path.display()))?;
    let mut header = Vec::with_capacity(columns.len() + 1);
    header.push(identifier_column.to_string());
    header.extend(columns.iter().cloned());
    writer
        .write_record(&header)
        .context("writing export header")?;

    for record in &records {
        let mut row = Vec::with_capacity(header.len());
        row.push(record.identifier.clone());
        for column in &columns {
            row.push(
                record
                    .fields
                    .get(column)
                    .map(value_to_text)
                    .unwrap_or_default(),
            );
        }
        writer.write_record(&row).context("writing export row")?;
    }
    writer.flush().context("flushing export")?;

    let bytes =
        std::fs::read(out_path).with_context(|| format!("reading back {}", out_path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(ExportReport {
        path: out_path.display().to_string(),
        rows: records.len(),
        bytes: bytes.len() as u64,
        sha256: hex::encode(hasher.finalize()),
        store_degraded: !store.health().is_available(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pce_enrich::{EnrichError, TemplateEnricher};
    use pce_store::{FailClosedStore, SqliteCatalogStore};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingEnricher {
        calls: Arc<AtomicUsize>,
        fail_for: HashSet<String>,
    }

    impl CountingEnricher {
        fn new(fail_for: &[&str]) -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    calls: calls.clone(),
                    fail_for: fail_for.iter().map(|s| s.to_string()).collect(),
                },
                calls,
            )
        }
    }

    #[async_trait]
    impl Enricher for CountingEnricher {
        async fn enrich(
            &self,
            record: &ProductRecord,
            kinds: &[EnrichmentKind],
        ) -> Result<Enrichment, EnrichError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_for.contains(record.identifier.trim()) {
                return Err(EnrichError::EmptyPayload);
            }
            TemplateEnricher.enrich(record, kinds).await
        }
    }

    /// Simulates another session inserting one identifier between staging
    /// and commit, through a second connection to the same database.
    struct RacingEnricher {
        db_path: PathBuf,
        race_on: String,
    }

    #[async_trait]
    impl Enricher for RacingEnricher {
        async fn enrich(
            &self,
            record: &ProductRecord,
            kinds: &[EnrichmentKind],
        ) -> Result<Enrichment, EnrichError> {
            if record.identifier == self.race_on {
                let mut other =
                    SqliteCatalogStore::open(&self.db_path).expect("second store handle");
                other
                    .insert(&ProductRecord::new(record.identifier.clone()))
                    .expect("concurrent insert");
            }
            TemplateEnricher.enrich(record, kinds).await
        }
    }

    fn write_input(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, contents).expect("write input file");
        path
    }

    fn pipeline_with(
        store: SqliteCatalogStore,
        enricher: Box<dyn Enricher>,
        config: IngestConfig,
    ) -> IngestPipeline {
        IngestPipeline::new(
            Box::new(FailClosedStore::from_store(store)),
            enricher,
            config,
        )
    }

    fn default_config() -> IngestConfig {
        IngestConfig {
            batch_limit: 0,
            ..IngestConfig::default()
        }
    }

    #[tokio::test]
    async fn existing_identifiers_are_filtered_case_and_trim_insensitively() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = write_input(
            dir.path(),
            "upload.csv",
            "Item Description,Price\nRed Mug,10\nBlue Plate,8\n RED MUG ,12\n",
        );

        let mut seed = SqliteCatalogStore::in_memory().expect("store");
        seed.insert(&ProductRecord::new("red mug")).unwrap();

        let (enricher, calls) = CountingEnricher::new(&[]);
        let mut pipeline = pipeline_with(seed, Box::new(enricher), default_config());
        let summary = pipeline.run(&input).await.expect("run");

        assert_eq!(summary.rows_parsed, 3);
        assert_eq!(summary.duplicates_at_filter, 2);
        assert_eq!(summary.inserted, 1);
        // N rows, M already present: exactly N - M generation attempts.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn one_failing_row_never_aborts_the_batch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = write_input(
            dir.path(),
            "upload.csv",
            "Item Description\nRed Mug\nBlue Plate\nGreen Bowl\n",
        );

        let (enricher, _) = CountingEnricher::new(&["Blue Plate"]);
        let mut pipeline = pipeline_with(
            SqliteCatalogStore::in_memory().expect("store"),
            Box::new(enricher),
            default_config(),
        );
        let summary = pipeline.run(&input).await.expect("run");

        assert_eq!(summary.enrichment_failures, 1);
        assert_eq!(summary.inserted, 2);
        assert!(summary.rows.iter().any(|r| {
            r.identifier == "Blue Plate" && matches!(r.status, RowStatus::EnrichmentFailed { .. })
        }));
    }

    #[tokio::test]
    async fn all_empty_columns_and_missing_identifiers_are_dropped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = write_input(
            dir.path(),
            "upload.csv",
            "Item Description,Price,Notes\nRed Mug,10,\n,5,\nBlue Plate,,\n",
        );

        let (enricher, _) = CountingEnricher::new(&[]);
        let mut pipeline = pipeline_with(
            SqliteCatalogStore::in_memory().expect("store"),
            Box::new(enricher),
            default_config(),
        );
        let summary = pipeline.run(&input).await.expect("run");

        assert_eq!(summary.columns_dropped, vec!["Notes".to_string()]);
        assert_eq!(summary.missing_identifier, 1);
        assert_eq!(summary.inserted, 2);
    }

    #[tokio::test]
    async fn candidates_are_capped_by_the_batch_limit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = write_input(
            dir.path(),
            "upload.csv",
            "Item Description\nA\nB\nC\nD\nE\n",
        );

        let (enricher, calls) = CountingEnricher::new(&[]);
        let config = IngestConfig {
            batch_limit: 2,
            ..IngestConfig::default()
        };
        let mut pipeline = pipeline_with(
            SqliteCatalogStore::in_memory().expect("store"),
            Box::new(enricher),
            config,
        );
        let summary = pipeline.run(&input).await.expect("run");

        assert_eq!(summary.over_batch_limit, 3);
        assert_eq!(summary.inserted, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn drift_between_staging_and_commit_is_rejected_by_the_unique_index() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("catalog.db");
        let input = write_input(
            dir.path(),
            "upload.csv",
            "Item Description\nRed Mug\nBlue Plate\n",
        );

        let store = SqliteCatalogStore::open(&db_path).expect("store");
        let enricher = RacingEnricher {
            db_path: db_path.clone(),
            race_on: "Blue Plate".to_string(),
        };
        let mut pipeline = pipeline_with(store, Box::new(enricher), default_config());
        let summary = pipeline.run(&input).await.expect("run");

        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.rejected_at_commit, 1);
        assert!(summary.rows.iter().any(|r| {
            r.identifier == "Blue Plate" && r.status == RowStatus::RejectedAtCommit
        }));
    }

    #[tokio::test]
    async fn near_duplicates_are_flagged_but_still_ingested() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = write_input(dir.path(), "upload.csv", "Item Description\nRed Mugs\n");

        let mut seed = SqliteCatalogStore::in_memory().expect("store");
        seed.insert(&ProductRecord::new("Red Mug")).unwrap();

        let (enricher, _) = CountingEnricher::new(&[]);
        let mut pipeline = pipeline_with(seed, Box::new(enricher), default_config());
        let summary = pipeline.run(&input).await.expect("run");

        assert_eq!(summary.inserted, 1);
        let report = summary
            .rows
            .iter()
            .find(|r| r.identifier == "Red Mugs")
            .expect("row report");
        assert_eq!(report.near_duplicate_of.as_deref(), Some("Red Mug"));
    }

    #[tokio::test]
    async fn unreachable_store_degrades_instead_of_failing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = write_input(dir.path(), "upload.csv", "Item Description\nRed Mug\n");
        let bad_path = dir.path().join("no-such-dir").join("catalog.db");

        let (enricher, calls) = CountingEnricher::new(&[]);
        let mut pipeline = IngestPipeline::new(
            Box::new(FailClosedStore::open(&bad_path)),
            Box::new(enricher),
            default_config(),
        );
        let summary = pipeline.run(&input).await.expect("run");

        assert!(summary.store_degraded);
        assert_eq!(summary.inserted, 0);
        assert_eq!(summary.rejected_at_commit, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsupported_extension_is_an_input_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = write_input(dir.path(), "upload.pdf", "not tabular");
        assert!(load_rows(&input).is_err());
    }

    #[test]
    fn export_writes_the_union_of_columns() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = SqliteCatalogStore::in_memory().expect("store");
        store
            .insert(&ProductRecord::new("red mug").with_field("price", 12))
            .unwrap();
        store
            .insert(&ProductRecord::new("blue plate").with_field("stock", 4))
            .unwrap();

        let out = dir.path().join("snapshot.csv");
        let report = export_csv(&store, "Item Description", &out).expect("export");

        assert_eq!(report.rows, 2);
        assert_eq!(report.sha256.len(), 64);
        assert!(!report.store_degraded);

        let contents = std::fs::read_to_string(&out).expect("read snapshot");
        let mut lines = contents.lines();
        assert_eq!(lines.next(), Some("Item Description,price,stock"));
        assert_eq!(lines.next(), Some("red mug,12,"));
        assert_eq!(lines.next(), Some("blue plate,,4"));
    }

    #[test]
    fn loose_key_collapses_punctuation_and_case() {
        assert_eq!(loose_key("Red-Mug  (large)"), "red mug large");
        assert_eq!(loose_key("  red mug "), "red mug");
    }

    #[test]
    fn cell_parsing_keeps_numbers_and_drops_blanks() {
        assert_eq!(parse_cell(" 12 "), JsonValue::from(12));
        assert_eq!(parse_cell("12.5"), JsonValue::from(12.5));
        assert_eq!(parse_cell("  "), JsonValue::Null);
        assert_eq!(parse_cell("mug"), JsonValue::String("mug".to_string()));
    }
}

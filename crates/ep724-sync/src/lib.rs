//! Weekly EP724 sync: clean the source workbook, reshape it into series and
//! observation tables, export them, and load them into Postgres.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use ep724_adapters::{
    availability, latest_link, read_workbook, read_workbook_bytes, FetchedRelease, FixtureSource, LinkPolicy,
    LinkRules, ReleaseSource, StbSource, StbSourceConfig, DEFAULT_LINK_MARKER,
    DEFAULT_LISTING_URL,
};
use ep724_core::{
    format_ds, parse_ds, sanitize_key, Cell, CleanedRow, CleanedTable, DateError,
    ObservationRecord, RawTable, SeriesRecord, CLASSIFICATION, COL_CATEGORY_NO, COL_MEASURE,
    COL_RAILROAD_REGION, COL_SUB_VARIABLE, COL_VARIABLE, OBSERVATION_KEY, SERIES_FIELD_SCHEMA,
    SERIES_FREQUENCY, SERIES_SOURCE_NAME,
};
use ep724_storage::{content_hash, write_atomic, FetcherConfig, HttpFetcher, ReleaseArchive};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ep724-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub listing_url: String,
    pub link_rules: LinkRules,
    pub fixture_dir: Option<PathBuf>,
    pub database_url: Option<String>,
    pub artifacts_dir: PathBuf,
    pub output_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from any key lookup; unset keys fall back to defaults.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let policy = match var("EP724_LINK_POLICY") {
            Some(v) => v.parse::<LinkPolicy>().context("parsing EP724_LINK_POLICY")?,
            None => LinkPolicy::default(),
        };
        Ok(Self {
            listing_url: var("EP724_LISTING_URL").unwrap_or_else(|| DEFAULT_LISTING_URL.to_string()),
            link_rules: LinkRules {
                marker: var("EP724_LINK_MARKER").unwrap_or_else(|| DEFAULT_LINK_MARKER.to_string()),
                policy,
                ..LinkRules::default()
            },
            fixture_dir: var("EP724_FIXTURE_DIR").map(PathBuf::from),
            database_url: var("DATABASE_URL").filter(|v| !v.is_empty()),
            artifacts_dir: var("ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./artifacts")),
            output_dir: var("EP724_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./runs")),
            user_agent: var("EP724_USER_AGENT").unwrap_or_else(|| "ep724-etl/0.1".to_string()),
            http_timeout_secs: var("EP724_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
        })
    }

    pub fn run_dir(&self, target_date: NaiveDate) -> PathBuf {
        self.output_dir.join(format_ds(target_date))
    }
}

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("source table has no column {column:?}")]
    MissingColumn { column: String },
    #[error(transparent)]
    Date(#[from] DateError),
}

fn require_column(raw: &RawTable, name: &str) -> Result<usize, TransformError> {
    raw.column_index(name)
        .ok_or_else(|| TransformError::MissingColumn {
            column: name.to_string(),
        })
}

/// Integer category number, truncating fractional spreadsheet numbers.
pub fn coerce_category(cell: &Cell) -> Option<i64> {
    let n = match cell {
        Cell::Number(n) => *n,
        Cell::Text(s) => s.trim().parse::<f64>().ok()?,
        Cell::Bool(b) => return Some(i64::from(*b)),
        Cell::Empty | Cell::Date(_) => return None,
    };
    n.is_finite().then(|| n.trunc() as i64)
}

/// `sr_name` for a row: sanitized region, variable, sub-variable and category
/// joined with `_`, with every literal `nan` removed afterwards.
pub fn synthetic_key(region: &Cell, variable: &Cell, sub_variable: &Cell, category_no: i64) -> String {
    let joined = format!(
        "{}_{}_{}_{}",
        sanitize_key(&region.key_text()),
        sanitize_key(&variable.key_text()),
        sanitize_key(&sub_variable.key_text()),
        sanitize_key(&category_no.to_string()),
    );
    sanitize_key(&joined.replace("nan", ""))
}

/// Normalize headers, drop rows without a category number, derive `sr_name`
/// and keep the first row for each key.
pub fn clean_table(mut raw: RawTable) -> Result<CleanedTable, TransformError> {
    for header in &mut raw.headers {
        if header.contains(['\r', '\n']) {
            *header = header.replace(['\r', '\n'], "");
        }
    }

    let region = require_column(&raw, COL_RAILROAD_REGION)?;
    let variable = require_column(&raw, COL_VARIABLE)?;
    let sub_variable = require_column(&raw, COL_SUB_VARIABLE)?;
    let category = require_column(&raw, COL_CATEGORY_NO)?;
    let measure = require_column(&raw, COL_MEASURE)?;
    let categorical = [region, variable, sub_variable, category, measure];

    let value_columns = raw
        .headers
        .iter()
        .enumerate()
        .filter(|(idx, _)| !categorical.contains(idx))
        .map(|(idx, header)| (idx, header.clone()))
        .collect::<Vec<_>>();

    let mut seen = HashSet::new();
    let mut rows = Vec::new();
    let mut null_categories = 0usize;
    let mut duplicates = 0usize;

    for r in 0..raw.len() {
        let Some(category_no) = coerce_category(raw.cell(r, category)) else {
            null_categories += 1;
            continue;
        };
        let sr_name = synthetic_key(
            raw.cell(r, region),
            raw.cell(r, variable),
            raw.cell(r, sub_variable),
            category_no,
        );
        if !seen.insert(sr_name.clone()) {
            duplicates += 1;
            debug!(%sr_name, row = r, "dropping duplicate synthetic key");
            continue;
        }

        let mut values = BTreeMap::new();
        for (idx, header) in &value_columns {
            values
                .entry(header.clone())
                .or_insert_with(|| raw.cell(r, *idx).clone());
        }

        rows.push(CleanedRow {
            sr_name,
            railroad_region: raw.cell(r, region).as_text(),
            variable: raw.cell(r, variable).as_text(),
            sub_variable: raw.cell(r, sub_variable).as_text(),
            category_no,
            measure: raw.cell(r, measure).as_text(),
            values,
        });
    }

    info!(
        input_rows = raw.len(),
        null_categories,
        duplicates,
        cleaned_rows = rows.len(),
        "cleaned source table"
    );

    Ok(CleanedTable {
        value_columns: value_columns.into_iter().map(|(_, h)| h).collect(),
        rows,
    })
}

/// Float parsing that also accepts `_` between digits, as in `1_234`.
fn parse_float(text: &str) -> Option<f64> {
    let text = text.trim();
    if !text.contains('_') {
        return text.parse().ok();
    }
    let b = text.as_bytes();
    let grouped = b.iter().enumerate().all(|(i, &c)| {
        c != b'_'
            || (i > 0
                && b[i - 1].is_ascii_digit()
                && b.get(i + 1).is_some_and(u8::is_ascii_digit))
    });
    if !grouped {
        return None;
    }
    text.replace('_', "").parse().ok()
}

/// Numeric value of a report cell, repairing thousands separators.
///
/// Anything that still does not parse (placeholders like `N/A` or `.`) and
/// non-finite numbers come back as `None`.
pub fn clean_value(cell: &Cell) -> Option<f64> {
    let parsed = match cell {
        Cell::Number(n) => Some(*n),
        Cell::Text(s) => parse_float(s).or_else(|| {
            if s.contains(',') {
                let stripped = s.replace(',', "");
                debug!(raw = %s, %stripped, "stripping thousands separators");
                parse_float(&stripped)
            } else {
                debug!(raw = %s, "non-numeric value treated as missing");
                None
            }
        }),
        Cell::Empty | Cell::Bool(_) | Cell::Date(_) => None,
    };
    parsed.filter(|v| v.is_finite())
}

/// Unpivot the `target_date` column into one observation per cleaned row.
pub fn build_observations(
    cleaned: &CleanedTable,
    target_date: &str,
    release_date: &str,
) -> Result<Vec<ObservationRecord>, TransformError> {
    let target = parse_ds(target_date)?;
    let release = parse_ds(release_date)?;
    let column = format_ds(target);
    if !cleaned.has_column(&column) {
        return Err(TransformError::MissingColumn { column });
    }

    info!(rows = cleaned.len(), ob_obs_date = %column, "unpivoting target date column");
    let observations = cleaned
        .rows
        .iter()
        .filter_map(|row| {
            let value = row.values.get(&column).and_then(clean_value)?;
            Some(ObservationRecord {
                sr_name: row.sr_name.clone(),
                cl_name: CLASSIFICATION.to_string(),
                key: OBSERVATION_KEY.to_string(),
                ob_obs_date: target,
                value,
                ob_release_date: release,
            })
        })
        .collect::<Vec<_>>();

    info!(
        observations = observations.len(),
        dropped = cleaned.len() - observations.len(),
        "built observations"
    );
    Ok(observations)
}

fn description_segment(value: &Option<String>) -> &str {
    match value.as_deref() {
        None | Some("nan") => "",
        Some(v) => v,
    }
}

pub fn describe_series(row: &CleanedRow) -> String {
    format!(
        "Railroad_Region : {}, Variable : {}, SubVariable : {}, Measure : {}",
        description_segment(&row.railroad_region),
        description_segment(&row.variable),
        description_segment(&row.sub_variable),
        description_segment(&row.measure),
    )
}

/// One series metadata record per cleaned row.
pub fn build_series(cleaned: &CleanedTable) -> Vec<SeriesRecord> {
    cleaned
        .rows
        .iter()
        .map(|row| SeriesRecord {
            sr_desc: describe_series(row),
            sn_name: SERIES_SOURCE_NAME.to_string(),
            cl_name: CLASSIFICATION.to_string(),
            fr_name: SERIES_FREQUENCY.to_string(),
            sr_field: SERIES_FIELD_SCHEMA.to_string(),
            sr_name: row.sr_name.clone(),
            railroad_region: row.railroad_region.clone(),
            variable: row.variable.clone(),
            sub_variable: row.sub_variable.clone(),
            measure: row.measure.clone(),
            category_no: row.category_no,
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct TransformedTables {
    pub cleaned_rows: usize,
    pub series: Vec<SeriesRecord>,
    pub observations: Vec<ObservationRecord>,
}

pub fn transform_table(raw: RawTable, target_date: &str, release_date: &str) -> Result<TransformedTables> {
    let cleaned = clean_table(raw).context("cleaning source table")?;
    let observations = build_observations(&cleaned, target_date, release_date)
        .context("building observations")?;
    let series = build_series(&cleaned);
    Ok(TransformedTables {
        cleaned_rows: cleaned.len(),
        series,
        observations,
    })
}

pub fn transform_workbook(
    source_path: &Path,
    target_date: &str,
    release_date: &str,
) -> Result<TransformedTables> {
    let raw = read_workbook(source_path)
        .with_context(|| format!("reading workbook {}", source_path.display()))?;
    transform_table(raw, target_date, release_date)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub target_date: NaiveDate,
    pub release_date: NaiveDate,
    pub source_path: String,
    pub source_date: Option<NaiveDate>,
    pub source_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunDelta {
    pub run: RunRecord,
    pub series: Vec<SeriesRecord>,
    pub observations: Vec<ObservationRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: usize,
}

#[derive(Debug, Clone)]
pub struct RunOutputs {
    pub delta_path: PathBuf,
    pub manifest_path: PathBuf,
}

pub const DELTA_FILE: &str = "delta.json";

pub async fn write_run_outputs(run_dir: &Path, delta: &RunDelta) -> Result<RunOutputs> {
    fs::create_dir_all(run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let delta_path = run_dir.join(DELTA_FILE);
    let bytes = serde_json::to_vec_pretty(delta).context("serializing run delta")?;
    write_atomic(&delta_path, &bytes, true).await?;

    let snapshots = [
        (
            "observations",
            observations_parquet(&delta.observations)?,
            delta.observations.len(),
        ),
        ("series", series_parquet(&delta.series)?, delta.series.len()),
    ];
    let mut files = Vec::with_capacity(snapshots.len());
    for (name, bytes, rows) in snapshots {
        let rel = format!("snapshots/{name}.parquet");
        write_atomic(&run_dir.join(&rel), &bytes, true).await?;
        files.push(ParquetManifestFile {
            name: name.to_string(),
            path: rel,
            sha256: content_hash(&bytes),
            bytes: bytes.len() as u64,
            rows,
        });
    }

    let manifest = ParquetManifest {
        schema_version: 1,
        files,
    };
    let manifest_path = run_dir.join("snapshots/manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    write_atomic(&manifest_path, &bytes, true).await?;

    Ok(RunOutputs {
        delta_path,
        manifest_path,
    })
}

pub async fn read_run_delta(run_dir: &Path) -> Result<RunDelta> {
    let path = run_dir.join(DELTA_FILE);
    let text = fs::read_to_string(&path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Encode `batch` as a complete in-memory parquet file.
fn parquet_bytes(batch: RecordBatch) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut writer =
        ArrowWriter::try_new(&mut buf, batch.schema(), None).context("opening parquet writer")?;
    writer.write(&batch).context("writing record batch")?;
    writer.close().context("closing parquet writer")?;
    Ok(buf)
}

fn observations_parquet(observations: &[ObservationRecord]) -> Result<Vec<u8>> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("sr_name", DataType::Utf8, false),
        ArrowField::new("cl_name", DataType::Utf8, false),
        ArrowField::new("key", DataType::Utf8, false),
        ArrowField::new("ob_obs_date", DataType::Utf8, false),
        ArrowField::new("value", DataType::Float64, false),
        ArrowField::new("ob_release_date", DataType::Utf8, false),
    ]));

    let sr_names = StringArray::from(
        observations
            .iter()
            .map(|o| o.sr_name.as_str())
            .collect::<Vec<_>>(),
    );
    let cl_names = StringArray::from(
        observations
            .iter()
            .map(|o| o.cl_name.as_str())
            .collect::<Vec<_>>(),
    );
    let keys = StringArray::from(observations.iter().map(|o| o.key.as_str()).collect::<Vec<_>>());
    let obs_dates = StringArray::from(
        observations
            .iter()
            .map(|o| format_ds(o.ob_obs_date))
            .collect::<Vec<_>>(),
    );
    let values = Float64Array::from(observations.iter().map(|o| o.value).collect::<Vec<_>>());
    let release_dates = StringArray::from(
        observations
            .iter()
            .map(|o| format_ds(o.ob_release_date))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(sr_names),
            Arc::new(cl_names),
            Arc::new(keys),
            Arc::new(obs_dates),
            Arc::new(values),
            Arc::new(release_dates),
        ],
    )
    .context("building observations record batch")?;
    parquet_bytes(batch)
}

fn series_parquet(series: &[SeriesRecord]) -> Result<Vec<u8>> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("sr_desc", DataType::Utf8, false),
        ArrowField::new("sn_name", DataType::Utf8, false),
        ArrowField::new("cl_name", DataType::Utf8, false),
        ArrowField::new("fr_name", DataType::Utf8, false),
        ArrowField::new("sr_field", DataType::Utf8, false),
        ArrowField::new("sr_name", DataType::Utf8, false),
        ArrowField::new("railroad_region", DataType::Utf8, true),
        ArrowField::new("variable", DataType::Utf8, true),
        ArrowField::new("sub_variable", DataType::Utf8, true),
        ArrowField::new("measure", DataType::Utf8, true),
        ArrowField::new("category_no", DataType::Int64, false),
    ]));

    let required = |f: fn(&SeriesRecord) -> &str| {
        StringArray::from(series.iter().map(f).collect::<Vec<_>>())
    };
    let optional = |f: fn(&SeriesRecord) -> Option<&str>| {
        StringArray::from(series.iter().map(f).collect::<Vec<_>>())
    };
    let category_nos = Int64Array::from(series.iter().map(|s| s.category_no).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(required(|s| s.sr_desc.as_str())),
            Arc::new(required(|s| s.sn_name.as_str())),
            Arc::new(required(|s| s.cl_name.as_str())),
            Arc::new(required(|s| s.fr_name.as_str())),
            Arc::new(required(|s| s.sr_field.as_str())),
            Arc::new(required(|s| s.sr_name.as_str())),
            Arc::new(optional(|s| s.railroad_region.as_deref())),
            Arc::new(optional(|s| s.variable.as_deref())),
            Arc::new(optional(|s| s.sub_variable.as_deref())),
            Arc::new(optional(|s| s.measure.as_deref())),
            Arc::new(category_nos),
        ],
    )
    .context("building series record batch")?;
    parquet_bytes(batch)
}

/// Destination for the two output tables.
#[async_trait]
pub trait TableLoader: Send + Sync {
    fn name(&self) -> &'static str;
    async fn load_series(&self, series: &[SeriesRecord]) -> Result<u64>;
    async fn load_observations(&self, observations: &[ObservationRecord]) -> Result<u64>;
}

/// Used when no database is configured; outputs stay on disk only.
#[derive(Debug, Default)]
pub struct NoopLoader;

#[async_trait]
impl TableLoader for NoopLoader {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn load_series(&self, _series: &[SeriesRecord]) -> Result<u64> {
        Ok(0)
    }

    async fn load_observations(&self, _observations: &[ObservationRecord]) -> Result<u64> {
        Ok(0)
    }
}

#[derive(Debug, Clone)]
pub struct PgLoader {
    pool: PgPool,
}

impl PgLoader {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running migrations")?;
        Ok(())
    }
}

#[async_trait]
impl TableLoader for PgLoader {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn load_series(&self, series: &[SeriesRecord]) -> Result<u64> {
        let mut tx = self.pool.begin().await.context("starting series transaction")?;
        let mut affected = 0u64;
        for s in series {
            let result = sqlx::query(
                r#"
                INSERT INTO series (
                    sr_name, sr_desc, sn_name, cl_name, fr_name, sr_field,
                    railroad_region, variable, sub_variable, measure, category_no
                )
                VALUES ($1, $2, $3, $4, $5, $6::jsonb, $7, $8, $9, $10, $11)
                ON CONFLICT (sr_name) DO UPDATE
                   SET sr_desc = EXCLUDED.sr_desc,
                       sn_name = EXCLUDED.sn_name,
                       cl_name = EXCLUDED.cl_name,
                       fr_name = EXCLUDED.fr_name,
                       sr_field = EXCLUDED.sr_field,
                       railroad_region = EXCLUDED.railroad_region,
                       variable = EXCLUDED.variable,
                       sub_variable = EXCLUDED.sub_variable,
                       measure = EXCLUDED.measure,
                       category_no = EXCLUDED.category_no,
                       updated_at = NOW()
                "#,
            )
            .bind(&s.sr_name)
            .bind(&s.sr_desc)
            .bind(&s.sn_name)
            .bind(&s.cl_name)
            .bind(&s.fr_name)
            .bind(&s.sr_field)
            .bind(&s.railroad_region)
            .bind(&s.variable)
            .bind(&s.sub_variable)
            .bind(&s.measure)
            .bind(s.category_no)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("upserting series {}", s.sr_name))?;
            affected += result.rows_affected();
        }
        tx.commit().await.context("committing series")?;
        Ok(affected)
    }

    async fn load_observations(&self, observations: &[ObservationRecord]) -> Result<u64> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("starting observations transaction")?;
        let mut affected = 0u64;
        for o in observations {
            let result = sqlx::query(
                r#"
                INSERT INTO observations (sr_name, cl_name, key, ob_obs_date, value, ob_release_date)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (sr_name, key, ob_obs_date) DO UPDATE
                   SET cl_name = EXCLUDED.cl_name,
                       value = EXCLUDED.value,
                       ob_release_date = EXCLUDED.ob_release_date,
                       loaded_at = NOW()
                "#,
            )
            .bind(&o.sr_name)
            .bind(&o.cl_name)
            .bind(&o.key)
            .bind(o.ob_obs_date)
            .bind(o.value)
            .bind(o.ob_release_date)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("upserting observation {} {}", o.sr_name, o.ob_obs_date))?;
            affected += result.rows_affected();
        }
        tx.commit().await.context("committing observations")?;
        Ok(affected)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadSummary {
    pub loader: String,
    pub series_rows: u64,
    pub observation_rows: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub target_date: NaiveDate,
    pub source_date: NaiveDate,
    pub source_url: String,
    pub cleaned_rows: usize,
    pub series_rows: usize,
    pub observation_rows: usize,
    pub run_dir: String,
    pub parquet_manifest: String,
    pub load: LoadSummary,
}

#[derive(Debug, Clone, Serialize)]
pub enum SyncOutcome {
    /// The newest published release predates the target date.
    NotYetAvailable {
        target_date: NaiveDate,
        latest_date: NaiveDate,
    },
    Completed(SyncRunSummary),
}

pub struct SyncPipeline {
    config: SyncConfig,
    archive: ReleaseArchive,
    http: HttpFetcher,
    source: Box<dyn ReleaseSource>,
    loader: Box<dyn TableLoader>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let archive = ReleaseArchive::new(config.artifacts_dir.clone());
        let http = HttpFetcher::new(FetcherConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        let source: Box<dyn ReleaseSource> = match &config.fixture_dir {
            Some(dir) => Box::new(FixtureSource::from_dir(dir, config.link_rules.clone())),
            None => Box::new(StbSource::new(StbSourceConfig {
                listing_url: config.listing_url.clone(),
                rules: config.link_rules.clone(),
            })),
        };
        Ok(Self {
            config,
            archive,
            http,
            source,
            loader: Box::<NoopLoader>::default(),
        })
    }

    pub fn with_source(mut self, source: Box<dyn ReleaseSource>) -> Self {
        self.source = source;
        self
    }

    pub fn with_loader(mut self, loader: Box<dyn TableLoader>) -> Self {
        self.loader = loader;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn check_availability(&self, target_date: &str) -> Result<bool> {
        let available =
            ep724_adapters::check_availability(self.source.as_ref(), &self.http, target_date)
                .await
                .context("checking release availability")?;
        Ok(available)
    }

    /// Download the latest release to `target_path` and archive a copy.
    pub async fn fetch(&self, target_path: &Path) -> Result<FetchedRelease> {
        let release = ep724_adapters::fetch_latest(self.source.as_ref(), &self.http, target_path)
            .await
            .context("fetching latest release")?;
        self.archive_release(&release).await?;
        Ok(release)
    }

    async fn archive_release(&self, release: &FetchedRelease) -> Result<()> {
        let archived = self
            .archive
            .archive(Utc::now(), self.source.source_id(), &release.extension, &release.bytes)
            .await?;
        debug!(
            path = %archived.path.display(),
            already_present = archived.already_present,
            "archived release workbook"
        );
        Ok(())
    }

    /// Load series first, then observations.
    pub async fn load(&self, delta: &RunDelta) -> Result<LoadSummary> {
        let series_rows = self
            .loader
            .load_series(&delta.series)
            .await
            .context("loading series")?;
        let observation_rows = self
            .loader
            .load_observations(&delta.observations)
            .await
            .context("loading observations")?;
        info!(
            loader = self.loader.name(),
            series_rows, observation_rows, "loaded run tables"
        );
        Ok(LoadSummary {
            loader: self.loader.name().to_string(),
            series_rows,
            observation_rows,
        })
    }

    pub async fn load_run_dir(&self, run_dir: &Path) -> Result<LoadSummary> {
        let delta = read_run_delta(run_dir).await?;
        self.load(&delta).await
    }

    pub async fn run_once(&self, target_date: &str, release_date: &str) -> Result<SyncOutcome> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let target = parse_ds(target_date).context("parsing target date")?;
        let release_day = parse_ds(release_date).context("parsing release date")?;

        let link = latest_link(self.source.as_ref(), &self.http)
            .await
            .context("resolving latest release")?;
        if !availability(target, link.date) {
            return Ok(SyncOutcome::NotYetAvailable {
                target_date: target,
                latest_date: link.date,
            });
        }
        info!(%run_id, latest_date = %link.date, file_link = %link.href, "resolved latest release");

        let release = self
            .source
            .fetch_release(&self.http, &link)
            .await
            .context("downloading release workbook")?;
        let run_dir = self.config.run_dir(target);
        let workbook_path = run_dir.join(format!("{}.{}", format_ds(target), release.extension));
        write_atomic(&workbook_path, &release.bytes, true).await?;
        self.archive_release(&release).await?;

        let raw = read_workbook_bytes(&release.bytes).context("reading downloaded workbook")?;
        let tables = transform_table(raw, target_date, release_date)?;
        if tables.observations.is_empty() {
            warn!(%run_id, "no observations survived value cleanup");
        }

        let delta = RunDelta {
            run: RunRecord {
                run_id,
                started_at,
                finished_at: Utc::now(),
                target_date: target,
                release_date: release_day,
                source_path: workbook_path.display().to_string(),
                source_date: Some(link.date),
                source_url: Some(release.url.clone()),
            },
            series: tables.series,
            observations: tables.observations,
        };
        let outputs = write_run_outputs(&run_dir, &delta).await?;
        let load = self.load(&delta).await?;

        Ok(SyncOutcome::Completed(SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            target_date: target,
            source_date: link.date,
            source_url: release.url,
            cleaned_rows: tables.cleaned_rows,
            series_rows: delta.series.len(),
            observation_rows: delta.observations.len(),
            run_dir: run_dir.display().to_string(),
            parquet_manifest: outputs.manifest_path.display().to_string(),
            load,
        }))
    }
}

/// Transform a local workbook into a run directory without downloading or loading.
pub async fn transform_to_run_dir(
    source_path: &Path,
    target_date: &str,
    release_date: &str,
    run_dir: &Path,
) -> Result<(RunDelta, RunOutputs)> {
    let started_at = Utc::now();
    let tables = transform_workbook(source_path, target_date, release_date)?;
    let delta = RunDelta {
        run: RunRecord {
            run_id: Uuid::new_v4(),
            started_at,
            finished_at: Utc::now(),
            target_date: parse_ds(target_date)?,
            release_date: parse_ds(release_date)?,
            source_path: source_path.display().to_string(),
            source_date: None,
            source_url: None,
        },
        series: tables.series,
        observations: tables.observations,
    };
    let outputs = write_run_outputs(run_dir, &delta).await?;
    Ok((delta, outputs))
}

/// Pipeline wired from the environment, with Postgres loading when `DATABASE_URL` is set.
pub async fn pipeline_from_env() -> Result<SyncPipeline> {
    let config = SyncConfig::from_env()?;
    let loader: Option<PgLoader> = match &config.database_url {
        Some(url) => Some(PgLoader::connect(url).await?),
        None => None,
    };
    let pipeline = SyncPipeline::new(config)?;
    Ok(match loader {
        Some(loader) => pipeline.with_loader(Box::new(loader)),
        None => pipeline,
    })
}

pub async fn run_sync_once_from_env(target_date: &str, release_date: &str) -> Result<SyncOutcome> {
    pipeline_from_env().await?.run_once(target_date, release_date).await
}

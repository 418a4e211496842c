//! Core domain model for the STB EP724 rail service ingestion job.

use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "ep724-core";

/// Classification label stamped on every series and observation row.
pub const CLASSIFICATION: &str = "ep724";
/// Discriminator for the single numeric field carried by each observation.
pub const OBSERVATION_KEY: &str = "value";
pub const SERIES_FREQUENCY: &str = "weekly";
pub const SERIES_SOURCE_NAME: &str = "unknown";
/// Field schema literal stored verbatim in `sr_field`.
pub const SERIES_FIELD_SCHEMA: &str =
    r#"[{"desc": "Value", "name": "value", "type": "number", "units": "unit"}]"#;

pub const COL_RAILROAD_REGION: &str = "Railroad/Region";
pub const COL_VARIABLE: &str = "Variable";
pub const COL_SUB_VARIABLE: &str = "Sub-Variable";
pub const COL_CATEGORY_NO: &str = "Category No.";
pub const COL_MEASURE: &str = "Measure";

/// Invocation dates (`target_date`, `release_date`) and canonical date headers.
pub const DS_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DateError {
    #[error("invalid date {input:?}: expected format {format}")]
    Invalid { input: String, format: &'static str },
}

/// Parse a `YYYY-MM-DD` date string handed over by the orchestrator.
pub fn parse_ds(input: &str) -> Result<NaiveDate, DateError> {
    NaiveDate::parse_from_str(input.trim(), DS_FORMAT).map_err(|_| DateError::Invalid {
        input: input.to_string(),
        format: DS_FORMAT,
    })
}

pub fn format_ds(date: NaiveDate) -> String {
    date.format(DS_FORMAT).to_string()
}

/// Recognize header text that denotes a reporting date.
///
/// Accepts `YYYY-MM-DD`, `YYYY-MM-DD HH:MM:SS` and `M/D/YYYY`.
pub fn parse_date_header(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    NaiveDate::parse_from_str(text, DS_FORMAT)
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|dt| dt.date())
        })
        .or_else(|| NaiveDate::parse_from_str(text, "%m/%d/%Y").ok())
}

/// Lowercase `input` into a safe key token.
///
/// Every run of characters that are neither ASCII alphanumeric nor `_` collapses
/// into a single `_`; such runs at either end are dropped. Underscores already
/// present are kept as-is, so the function is idempotent.
pub fn sanitize_key(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_separator = false;
    for ch in input.chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            if pending_separator && !out.is_empty() {
                out.push('_');
            }
            pending_separator = false;
            out.push(ch);
        } else {
            pending_separator = true;
        }
    }
    out
}

/// One spreadsheet cell as read from the source workbook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Cell {
    #[default]
    Empty,
    Text(String),
    Number(f64),
    Bool(bool),
    Date(NaiveDate),
}

impl Cell {
    pub fn is_null(&self) -> bool {
        match self {
            Cell::Empty => true,
            Cell::Number(n) => n.is_nan(),
            _ => false,
        }
    }

    /// Text rendering of a non-null cell; `None` for null cells.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Cell::Empty => None,
            Cell::Number(n) if n.is_nan() => None,
            Cell::Text(s) => Some(s.clone()),
            Cell::Number(n) => Some(format_number(*n)),
            Cell::Bool(b) => Some(if *b { "True" } else { "False" }.to_string()),
            Cell::Date(d) => Some(format_ds(*d)),
        }
    }

    /// Text used when building synthetic keys; null cells render as `"nan"`.
    pub fn key_text(&self) -> String {
        self.as_text().unwrap_or_else(|| "nan".to_string())
    }
}

fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e16 {
        format!("{n:.1}")
    } else {
        n.to_string()
    }
}

/// The first worksheet of a source workbook: one header row plus data rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl RawTable {
    pub fn new(headers: Vec<String>, rows: Vec<Vec<Cell>>) -> Self {
        Self { headers, rows }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn cell(&self, row: usize, column: usize) -> &Cell {
        static EMPTY: Cell = Cell::Empty;
        self.rows
            .get(row)
            .and_then(|r| r.get(column))
            .unwrap_or(&EMPTY)
    }
}

/// A source row that survived cleaning, carrying its synthetic key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanedRow {
    pub sr_name: String,
    pub railroad_region: Option<String>,
    pub variable: Option<String>,
    pub sub_variable: Option<String>,
    pub category_no: i64,
    pub measure: Option<String>,
    /// Every non-categorical column keyed by its header.
    pub values: BTreeMap<String, Cell>,
}

/// Cleaned table: unique `sr_name` per row, no null category numbers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanedTable {
    pub value_columns: Vec<String>,
    pub rows: Vec<CleanedRow>,
}

impl CleanedTable {
    pub fn has_column(&self, header: &str) -> bool {
        self.value_columns.iter().any(|c| c == header)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// One row of the observation output table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationRecord {
    pub sr_name: String,
    pub cl_name: String,
    pub key: String,
    pub ob_obs_date: NaiveDate,
    pub value: f64,
    pub ob_release_date: NaiveDate,
}

/// One row of the series metadata output table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesRecord {
    pub sr_desc: String,
    pub sn_name: String,
    pub cl_name: String,
    pub fr_name: String,
    pub sr_field: String,
    pub sr_name: String,
    pub railroad_region: Option<String>,
    pub variable: Option<String>,
    pub sub_variable: Option<String>,
    pub measure: Option<String>,
    pub category_no: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_key_normalizes_case_and_punctuation() {
        assert_eq!(sanitize_key("Eastern"), "eastern");
        assert_eq!(sanitize_key("Cars Online - Total"), "cars_online_total");
        assert_eq!(sanitize_key("  Carloads (Weekly) "), "carloads_weekly");
        assert_eq!(sanitize_key("BNSF/Western"), "bnsf_western");
        assert_eq!(sanitize_key("5"), "5");
        assert_eq!(sanitize_key(""), "");
        assert_eq!(sanitize_key("Überfahrt"), "berfahrt");
    }

    #[test]
    fn sanitize_key_keeps_existing_underscores_and_is_idempotent() {
        assert_eq!(sanitize_key("eastern_carloads__5"), "eastern_carloads__5");
        for input in ["Cars Online - Total", "a_ b", "x__y", "Dwell (hrs.)"] {
            let once = sanitize_key(input);
            assert_eq!(sanitize_key(&once), once);
        }
    }

    #[test]
    fn ds_parsing_round_trips_and_rejects_other_formats() {
        let date = parse_ds("2022-06-15").unwrap();
        assert_eq!(format_ds(date), "2022-06-15");
        assert!(matches!(parse_ds("06-15-22"), Err(DateError::Invalid { .. })));
    }

    #[test]
    fn date_headers_accept_common_spellings() {
        let expected = NaiveDate::from_ymd_opt(2022, 6, 15);
        assert_eq!(parse_date_header("2022-06-15"), expected);
        assert_eq!(parse_date_header("2022-06-15 00:00:00"), expected);
        assert_eq!(parse_date_header("6/15/2022"), expected);
        assert_eq!(parse_date_header("Measure"), None);
    }

    #[test]
    fn cell_text_mirrors_spreadsheet_rendering() {
        assert_eq!(Cell::Empty.as_text(), None);
        assert_eq!(Cell::Number(f64::NAN).as_text(), None);
        assert_eq!(Cell::Number(5.0).as_text().as_deref(), Some("5.0"));
        assert_eq!(Cell::Number(20.5).as_text().as_deref(), Some("20.5"));
        assert_eq!(Cell::Empty.key_text(), "nan");
        assert!(Cell::Number(f64::NAN).is_null());
        assert!(!Cell::Text(String::new()).is_null());
    }

    #[test]
    fn field_schema_literal_is_valid_json() {
        let fields: serde_json::Value = serde_json::from_str(SERIES_FIELD_SCHEMA).unwrap();
        assert_eq!(
            fields,
            serde_json::json!([
                {"desc": "Value", "name": "value", "type": "number", "units": "unit"}
            ])
        );
    }
}

//! STB rail service data source: listing-page link resolution, availability
//! checks, release download and workbook reading.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Context;
use async_trait::async_trait;
use calamine::{open_workbook_auto, open_workbook_auto_from_rs, Data, DataType, Range, Reader};
use chrono::NaiveDate;
use ep724_core::{format_ds, parse_date_header, parse_ds, Cell, DateError, RawTable};
use ep724_storage::{write_atomic, FetchError, HttpFetcher};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "ep724-adapters";

pub const STB_SOURCE_ID: &str = "stb-ep724";
pub const DEFAULT_LISTING_URL: &str =
    "https://www.stb.gov/reports-data/rail-service-data/#railroads-tab-content-1-";
pub const DEFAULT_LINK_MARKER: &str = "/All Class 1 Railroads/";

/// Which matching anchor on the listing page counts as the latest release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkPolicy {
    /// First matching anchor in document order. The listing is published
    /// newest-first, so this tracks the newest file as long as that holds.
    #[default]
    FirstMatch,
    /// Maximum parsed date across all matching anchors.
    LatestDate,
}

impl FromStr for LinkPolicy {
    type Err = AdapterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first" | "first_match" => Ok(Self::FirstMatch),
            "latest" | "latest_date" => Ok(Self::LatestDate),
            other => Err(AdapterError::Message(format!("unknown link policy {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkRules {
    /// Substring an href must contain to be considered a release link.
    pub marker: String,
    /// Fixed-width annotation trailing the date in the anchor text.
    pub date_suffix_len: usize,
    pub date_format: String,
    pub policy: LinkPolicy,
}

impl Default for LinkRules {
    fn default() -> Self {
        Self {
            marker: DEFAULT_LINK_MARKER.to_string(),
            date_suffix_len: 5,
            date_format: "%m-%d-%y".to_string(),
            policy: LinkPolicy::FirstMatch,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedLink {
    pub date: NaiveDate,
    pub href: String,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct FetchedRelease {
    pub link: ResolvedLink,
    pub url: String,
    pub extension: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("release link not found: no anchor href contains {marker:?}")]
    LinkNotFound { marker: String },
    #[error("anchor text {text:?} for {href} does not carry a {format} date")]
    LinkDate {
        text: String,
        href: String,
        format: String,
    },
    #[error("invalid release url {href:?}: {source}")]
    InvalidUrl {
        href: String,
        #[source]
        source: url::ParseError,
    },
    #[error("workbook has no worksheet with a header row")]
    EmptyWorkbook,
    #[error(transparent)]
    Workbook(#[from] calamine::Error),
    #[error(transparent)]
    Date(#[from] DateError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// A place release workbooks are published.
#[async_trait]
pub trait ReleaseSource: Send + Sync {
    fn source_id(&self) -> &'static str;
    fn rules(&self) -> &LinkRules;

    async fn fetch_listing(&self, http: &HttpFetcher) -> Result<String, AdapterError>;

    async fn fetch_release(
        &self,
        http: &HttpFetcher,
        link: &ResolvedLink,
    ) -> Result<FetchedRelease, AdapterError>;
}

#[derive(Debug, Clone)]
pub struct StbSourceConfig {
    pub listing_url: String,
    pub rules: LinkRules,
}

impl Default for StbSourceConfig {
    fn default() -> Self {
        Self {
            listing_url: DEFAULT_LISTING_URL.to_string(),
            rules: LinkRules::default(),
        }
    }
}

/// The live STB website.
#[derive(Debug, Clone, Default)]
pub struct StbSource {
    config: StbSourceConfig,
}

impl StbSource {
    pub fn new(config: StbSourceConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ReleaseSource for StbSource {
    fn source_id(&self) -> &'static str {
        STB_SOURCE_ID
    }

    fn rules(&self) -> &LinkRules {
        &self.config.rules
    }

    async fn fetch_listing(&self, http: &HttpFetcher) -> Result<String, AdapterError> {
        let resp = http.get(&self.config.listing_url).await?;
        Ok(resp.text())
    }

    async fn fetch_release(
        &self,
        http: &HttpFetcher,
        link: &ResolvedLink,
    ) -> Result<FetchedRelease, AdapterError> {
        let url = absolute_url(&self.config.listing_url, &link.href)?;
        let resp = http.get(&url).await?;
        Ok(FetchedRelease {
            link: link.clone(),
            url: resp.url,
            extension: release_extension(&link.href),
            bytes: resp.body,
        })
    }
}

/// A captured listing page plus a directory of release workbooks, for offline runs.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    listing_path: PathBuf,
    release_dir: PathBuf,
    rules: LinkRules,
}

impl FixtureSource {
    pub fn new(listing_path: impl Into<PathBuf>, release_dir: impl Into<PathBuf>, rules: LinkRules) -> Self {
        Self {
            listing_path: listing_path.into(),
            release_dir: release_dir.into(),
            rules,
        }
    }

    /// `<dir>/listing.html` with workbooks alongside it.
    pub fn from_dir(dir: impl AsRef<Path>, rules: LinkRules) -> Self {
        let dir = dir.as_ref();
        Self::new(dir.join("listing.html"), dir, rules)
    }
}

#[async_trait]
impl ReleaseSource for FixtureSource {
    fn source_id(&self) -> &'static str {
        STB_SOURCE_ID
    }

    fn rules(&self) -> &LinkRules {
        &self.rules
    }

    async fn fetch_listing(&self, _http: &HttpFetcher) -> Result<String, AdapterError> {
        let text = tokio::fs::read_to_string(&self.listing_path)
            .await
            .with_context(|| format!("reading {}", self.listing_path.display()))?;
        Ok(text)
    }

    async fn fetch_release(
        &self,
        _http: &HttpFetcher,
        link: &ResolvedLink,
    ) -> Result<FetchedRelease, AdapterError> {
        let file_name = link.href.rsplit('/').next().unwrap_or(link.href.as_str());
        let path = self.release_dir.join(file_name);
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading fixture release {}", path.display()))?;
        Ok(FetchedRelease {
            link: link.clone(),
            url: path.display().to_string(),
            extension: release_extension(&link.href),
            bytes,
        })
    }
}

/// Parse the date carried by a release anchor's visible text.
pub fn parse_link_date(text: &str, rules: &LinkRules) -> Option<NaiveDate> {
    let text = text.trim();
    let keep = text.chars().count().checked_sub(rules.date_suffix_len)?;
    let date_text = text.chars().take(keep).collect::<String>();
    NaiveDate::parse_from_str(&date_text, &rules.date_format).ok()
}

fn link_from_anchor(href: String, text: String, rules: &LinkRules) -> Result<ResolvedLink, AdapterError> {
    match parse_link_date(&text, rules) {
        Some(date) => Ok(ResolvedLink { date, href, text }),
        None => Err(AdapterError::LinkDate {
            text,
            href,
            format: rules.date_format.clone(),
        }),
    }
}

/// Find the latest release link on the listing page.
pub fn resolve_latest(listing_html: &str, rules: &LinkRules) -> Result<ResolvedLink, AdapterError> {
    let document = Html::parse_document(listing_html);
    let anchors = Selector::parse("a").map_err(|e| AdapterError::Message(e.to_string()))?;
    let mut candidates = document.select(&anchors).filter_map(|a| {
        let href = a.value().attr("href")?;
        href.contains(rules.marker.as_str())
            .then(|| (href.to_string(), a.text().collect::<String>()))
    });
    let not_found = || AdapterError::LinkNotFound {
        marker: rules.marker.clone(),
    };

    match rules.policy {
        LinkPolicy::FirstMatch => {
            let (href, text) = candidates.next().ok_or_else(not_found)?;
            link_from_anchor(href, text, rules)
        }
        LinkPolicy::LatestDate => {
            let mut best: Option<ResolvedLink> = None;
            for (href, text) in candidates {
                let link = link_from_anchor(href, text, rules)?;
                if best.as_ref().map_or(true, |b| link.date > b.date) {
                    best = Some(link);
                }
            }
            best.ok_or_else(not_found)
        }
    }
}

/// `true` iff the latest published date is on or after `target`.
pub fn availability(target: NaiveDate, latest: NaiveDate) -> bool {
    let available = latest >= target;
    if available {
        info!(
            target_date = %target,
            latest_date = %latest,
            "latest release covers target date; new data available"
        );
    } else {
        info!(
            target_date = %target,
            latest_date = %latest,
            "latest release predates target date; waiting for new data"
        );
    }
    available
}

pub fn is_available(
    target_date: &str,
    listing_html: &str,
    rules: &LinkRules,
) -> Result<bool, AdapterError> {
    let target = parse_ds(target_date)?;
    let latest = resolve_latest(listing_html, rules)?;
    Ok(availability(target, latest.date))
}

pub async fn latest_link(
    source: &dyn ReleaseSource,
    http: &HttpFetcher,
) -> Result<ResolvedLink, AdapterError> {
    let listing = source.fetch_listing(http).await?;
    resolve_latest(&listing, source.rules())
}

pub async fn check_availability(
    source: &dyn ReleaseSource,
    http: &HttpFetcher,
    target_date: &str,
) -> Result<bool, AdapterError> {
    let target = parse_ds(target_date)?;
    let latest = latest_link(source, http).await?;
    Ok(availability(target, latest.date))
}

/// Download the latest release and write it to `target_path`.
pub async fn fetch_latest(
    source: &dyn ReleaseSource,
    http: &HttpFetcher,
    target_path: &Path,
) -> Result<FetchedRelease, AdapterError> {
    let link = latest_link(source, http).await?;
    info!(latest_date = %link.date, file_link = %link.href, "resolved latest release");
    let release = source.fetch_release(http, &link).await?;
    write_atomic(target_path, &release.bytes, true).await?;
    info!(
        path = %target_path.display(),
        bytes = release.bytes.len(),
        "downloaded release workbook"
    );
    Ok(release)
}

pub fn absolute_url(base: &str, href: &str) -> Result<String, AdapterError> {
    let base = url::Url::parse(base).map_err(|source| AdapterError::InvalidUrl {
        href: base.to_string(),
        source,
    })?;
    base.join(href)
        .map(|u| u.to_string())
        .map_err(|source| AdapterError::InvalidUrl {
            href: href.to_string(),
            source,
        })
}

pub fn release_extension(href: &str) -> String {
    let name = href.rsplit('/').next().unwrap_or(href);
    let name = name.split(['?', '#']).next().unwrap_or(name);
    match name.rsplit_once('.') {
        Some((_, ext)) if ext.eq_ignore_ascii_case("xls") => "xls".to_string(),
        _ => "xlsx".to_string(),
    }
}

pub fn read_workbook(path: impl AsRef<Path>) -> Result<RawTable, AdapterError> {
    let path = path.as_ref();
    let mut workbook = open_workbook_auto(path)?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or(AdapterError::EmptyWorkbook)??;
    let table = range_to_table(&range)?;
    debug!(path = %path.display(), rows = table.len(), columns = table.headers.len(), "read workbook");
    Ok(table)
}

pub fn read_workbook_bytes(bytes: &[u8]) -> Result<RawTable, AdapterError> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or(AdapterError::EmptyWorkbook)??;
    range_to_table(&range)
}

fn range_to_table(range: &Range<Data>) -> Result<RawTable, AdapterError> {
    let mut rows = range.rows();
    let headers = rows
        .next()
        .ok_or(AdapterError::EmptyWorkbook)?
        .iter()
        .map(header_text)
        .collect::<Vec<_>>();
    let rows = rows
        .map(|row| row.iter().map(data_to_cell).collect::<Vec<_>>())
        .filter(|row| !row.iter().all(Cell::is_null))
        .collect();
    Ok(RawTable::new(headers, rows))
}

fn header_text(cell: &Data) -> String {
    match cell {
        Data::DateTime(_) | Data::DateTimeIso(_) => cell
            .as_date()
            .map(format_ds)
            .unwrap_or_else(|| cell.to_string()),
        Data::String(s) => parse_date_header(s)
            .map(format_ds)
            .unwrap_or_else(|| s.clone()),
        Data::Empty => String::new(),
        other => other.to_string(),
    }
}

fn data_to_cell(cell: &Data) -> Cell {
    match cell {
        Data::Int(i) => Cell::Number(*i as f64),
        Data::Float(f) => Cell::Number(*f),
        Data::String(s) => Cell::Text(s.clone()),
        Data::Bool(b) => Cell::Bool(*b),
        Data::DateTime(_) => cell.as_date().map(Cell::Date).unwrap_or(Cell::Empty),
        Data::DateTimeIso(s) => cell
            .as_date()
            .map(Cell::Date)
            .unwrap_or_else(|| Cell::Text(s.clone())),
        Data::DurationIso(s) => Cell::Text(s.clone()),
        Data::Error(_) | Data::Empty => Cell::Empty,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(anchors: &[(&str, &str)]) -> String {
        let items = anchors
            .iter()
            .map(|(href, text)| format!("<li><a href=\"{href}\">{text}</a></li>"))
            .collect::<String>();
        format!("<html><body><a>no href</a><ul>{items}</ul></body></html>")
    }

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn first_matching_anchor_wins_in_document_order() {
        let html = listing(&[
            ("/reports/BNSF/EP724-06-22-22.xlsx", "06-22-22.xlsx"),
            ("/u/All Class 1 Railroads/EP724-06-08-22.xlsx", "06-08-22.xlsx"),
            ("/u/All Class 1 Railroads/EP724-06-15-22.xlsx", "06-15-22.xlsx"),
        ]);
        let link = resolve_latest(&html, &LinkRules::default()).unwrap();
        assert_eq!(link.date, ymd(2022, 6, 8));
        assert_eq!(link.href, "/u/All Class 1 Railroads/EP724-06-08-22.xlsx");
    }

    #[test]
    fn latest_date_policy_picks_maximum_date() {
        let html = listing(&[
            ("/u/All Class 1 Railroads/a.xlsx", "06-08-22.xlsx"),
            ("/u/All Class 1 Railroads/b.xlsx", "06-15-22.xlsx"),
            ("/u/All Class 1 Railroads/c.xlsx", "06-01-22.xlsx"),
        ]);
        let rules = LinkRules {
            policy: LinkPolicy::LatestDate,
            ..LinkRules::default()
        };
        let link = resolve_latest(&html, &rules).unwrap();
        assert_eq!(link.date, ymd(2022, 6, 15));
        assert_eq!(link.href, "/u/All Class 1 Railroads/b.xlsx");
    }

    #[test]
    fn latest_date_ties_go_to_earliest_anchor() {
        let html = listing(&[
            ("/u/All Class 1 Railroads/a.xlsx", "06-15-22.xlsx"),
            ("/u/All Class 1 Railroads/b.xlsx", "06-15-22.xlsx"),
        ]);
        let rules = LinkRules {
            policy: LinkPolicy::LatestDate,
            ..LinkRules::default()
        };
        let link = resolve_latest(&html, &rules).unwrap();
        assert_eq!(link.href, "/u/All Class 1 Railroads/a.xlsx");
    }

    #[test]
    fn undated_anchor_only_fails_the_latest_date_policy() {
        let html = listing(&[
            ("/u/All Class 1 Railroads/a.xlsx", "06-15-22.xlsx"),
            ("/u/All Class 1 Railroads/archive", "Archive"),
        ]);
        let first = resolve_latest(&html, &LinkRules::default()).unwrap();
        assert_eq!(first.href, "/u/All Class 1 Railroads/a.xlsx");

        let latest = LinkRules {
            policy: LinkPolicy::LatestDate,
            ..LinkRules::default()
        };
        let err = resolve_latest(&html, &latest).unwrap_err();
        assert!(matches!(err, AdapterError::LinkDate { ref text, .. } if text == "Archive"));
    }

    #[test]
    fn missing_link_is_not_found() {
        let html = listing(&[("/reports/BNSF/x.xlsx", "06-15-22.xlsx")]);
        let err = resolve_latest(&html, &LinkRules::default()).unwrap_err();
        assert!(matches!(err, AdapterError::LinkNotFound { .. }));
    }

    #[test]
    fn anchor_text_must_carry_a_date() {
        let html = listing(&[("/u/All Class 1 Railroads/x.xlsx", "Download")]);
        let err = resolve_latest(&html, &LinkRules::default()).unwrap_err();
        assert!(matches!(err, AdapterError::LinkDate { .. }));
    }

    #[test]
    fn link_date_drops_fixed_suffix() {
        let rules = LinkRules::default();
        assert_eq!(parse_link_date("06-15-22.xlsx", &rules), Some(ymd(2022, 6, 15)));
        assert_eq!(parse_link_date(" 12-31-21 XLSX\n", &rules), Some(ymd(2021, 12, 31)));
        assert_eq!(parse_link_date("xlsx", &rules), None);
    }

    #[test]
    fn availability_compares_target_with_latest() {
        let html = listing(&[("/u/All Class 1 Railroads/x.xlsx", "06-15-22.xlsx")]);
        let rules = LinkRules::default();
        assert!(is_available("2022-06-15", &html, &rules).unwrap());
        assert!(is_available("2022-06-08", &html, &rules).unwrap());
        assert!(!is_available("2022-06-22", &html, &rules).unwrap());
        assert!(matches!(
            is_available("06/22/2022", &html, &rules),
            Err(AdapterError::Date(_))
        ));
    }

    #[test]
    fn release_urls_resolve_against_listing_page() {
        let url = absolute_url(
            DEFAULT_LISTING_URL,
            "/wp-content/uploads/All Class 1 Railroads/EP724-06-15-22.xlsx",
        )
        .unwrap();
        assert_eq!(
            url,
            "https://www.stb.gov/wp-content/uploads/All%20Class%201%20Railroads/EP724-06-15-22.xlsx"
        );
        assert_eq!(release_extension("/a/b/EP724.XLS"), "xls");
        assert_eq!(release_extension("/a/b/EP724.xlsx?v=2"), "xlsx");
        assert_eq!(release_extension("/a/b/download"), "xlsx");
    }

    #[test]
    fn link_policy_parses_from_config_strings() {
        assert_eq!("first".parse::<LinkPolicy>().unwrap(), LinkPolicy::FirstMatch);
        assert_eq!("Latest".parse::<LinkPolicy>().unwrap(), LinkPolicy::LatestDate);
        assert!("newest".parse::<LinkPolicy>().is_err());
    }

    #[test]
    fn workbook_cells_map_to_domain_cells() {
        assert_eq!(data_to_cell(&Data::Int(5)), Cell::Number(5.0));
        assert_eq!(data_to_cell(&Data::String("1,200".into())), Cell::Text("1,200".into()));
        assert_eq!(data_to_cell(&Data::Empty), Cell::Empty);
        assert_eq!(
            data_to_cell(&Data::DateTimeIso("2022-06-15".into())),
            Cell::Date(ymd(2022, 6, 15))
        );
        assert_eq!(header_text(&Data::String("2022-06-15 00:00:00".into())), "2022-06-15");
        assert_eq!(header_text(&Data::String("Railroad/\nRegion".into())), "Railroad/\nRegion");
    }
}

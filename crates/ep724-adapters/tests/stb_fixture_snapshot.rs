use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use ep724_adapters::{
    check_availability, fetch_latest, read_workbook, read_workbook_bytes, resolve_latest,
    FixtureSource, LinkRules,
};
use ep724_core::Cell;
use ep724_storage::{FetcherConfig, HttpFetcher};

fn fixture_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/stb/sample")
}

#[test]
fn listing_fixture_resolves_all_class_1_release() {
    let html = std::fs::read_to_string(fixture_dir().join("listing.html")).unwrap();
    let link = resolve_latest(&html, &LinkRules::default()).unwrap();
    assert_eq!(link.date, NaiveDate::from_ymd_opt(2022, 6, 15).unwrap());
    assert_eq!(
        link.href,
        "/wp-content/uploads/All Class 1 Railroads/EP724-06-15-22.xlsx"
    );
}

#[test]
fn workbook_fixture_reads_header_and_rows() {
    let table = read_workbook(fixture_dir().join("EP724-06-15-22.xlsx")).unwrap();
    assert_eq!(
        table.headers,
        vec![
            "Railroad/\nRegion",
            "Variable",
            "Sub-Variable",
            "Category No.",
            "Measure",
            "2022-06-08",
            "2022-06-15",
        ]
    );
    assert_eq!(table.len(), 7);
    assert_eq!(table.cell(0, 0), &Cell::Text("BNSF".into()));
    assert_eq!(table.cell(0, 3), &Cell::Number(1.0));
    assert_eq!(table.cell(0, 6), &Cell::Text("1,250".into()));
    assert_eq!(table.cell(3, 2), &Cell::Empty);
    assert_eq!(table.cell(4, 3), &Cell::Empty);
}

#[test]
fn workbook_bytes_read_like_the_file() {
    let path = fixture_dir().join("EP724-06-15-22.xlsx");
    let from_bytes = read_workbook_bytes(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(from_bytes, read_workbook(&path).unwrap());
    assert_eq!(from_bytes.headers[6], "2022-06-15");
    assert_eq!(from_bytes.cell(2, 6), &Cell::Number(21.3));

    assert!(read_workbook_bytes(b"not a workbook").is_err());
}

#[tokio::test]
async fn fixture_source_downloads_latest_release() {
    let http = HttpFetcher::new(FetcherConfig::default()).unwrap();
    let source = FixtureSource::from_dir(fixture_dir(), LinkRules::default());
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("drop/2022-06-15.xlsx");

    let release = fetch_latest(&source, &http, &target).await.unwrap();

    assert_eq!(release.extension, "xlsx");
    assert_eq!(release.link.date, NaiveDate::from_ymd_opt(2022, 6, 15).unwrap());
    let expected = std::fs::read(fixture_dir().join("EP724-06-15-22.xlsx")).unwrap();
    assert_eq!(std::fs::read(&target).unwrap(), expected);
}

#[tokio::test]
async fn fixture_source_reports_availability() {
    let http = HttpFetcher::new(FetcherConfig::default()).unwrap();
    let source = FixtureSource::from_dir(fixture_dir(), LinkRules::default());

    assert!(check_availability(&source, &http, "2022-06-15").await.unwrap());
    assert!(!check_availability(&source, &http, "2022-06-22").await.unwrap());
}

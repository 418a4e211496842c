//! Release archive, atomic file writes and the retrying HTTP client used to
//! download EP724 listing pages and workbooks.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ep724-storage";

/// Lowercase hex sha256 of `bytes`.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[derive(Debug, Clone)]
pub struct ArchivedFile {
    pub hash: String,
    pub relative_path: PathBuf,
    pub path: PathBuf,
    pub size: usize,
    /// Identical bytes were already archived under the same path.
    pub already_present: bool,
}

/// Every downloaded workbook, addressed by `<stamp>/<source>/<sha256>.<ext>`.
#[derive(Debug, Clone)]
pub struct ReleaseArchive {
    root: PathBuf,
}

impl ReleaseArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn archive_path(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        hash: &str,
        extension: &str,
    ) -> PathBuf {
        let ext = match extension.trim().trim_start_matches('.') {
            "" => "bin",
            ext => ext,
        };
        let mut path = PathBuf::from(fetched_at.format("%Y%m%d_%H%M%S").to_string());
        path.push(source_id);
        path.push(format!("{hash}.{ext}"));
        path
    }

    pub async fn archive(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedFile> {
        let hash = content_hash(bytes);
        let relative_path = self.archive_path(fetched_at, source_id, &hash, extension);
        let path = self.root.join(&relative_path);

        let already_present = if fs::try_exists(&path)
            .await
            .with_context(|| format!("checking archive path {}", path.display()))?
        {
            true
        } else {
            !write_atomic(&path, bytes, false).await?
        };

        Ok(ArchivedFile {
            hash,
            relative_path,
            path,
            size: bytes.len(),
            already_present,
        })
    }
}

/// Write `bytes` to `dest` through a sibling temp file and a rename.
///
/// Returns `false` when `overwrite` is off and `dest` already exists.
pub async fn write_atomic(dest: &Path, bytes: &[u8], overwrite: bool) -> anyhow::Result<bool> {
    let dir = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating directory {}", dir.display()))?;

    let tmp = dir.join(format!(".{}.partial", Uuid::new_v4().simple()));
    {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp)
            .await
            .with_context(|| format!("creating {}", tmp.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("syncing {}", tmp.display()))?;
    }

    if !overwrite && fs::try_exists(dest).await.unwrap_or(false) {
        fs::remove_file(&tmp).await.ok();
        return Ok(false);
    }

    if let Err(err) = fs::rename(&tmp, dest).await {
        fs::remove_file(&tmp).await.ok();
        return Err(err)
            .with_context(|| format!("moving {} into place at {}", tmp.display(), dest.display()));
    }
    Ok(true)
}

/// 5xx and 429 are worth another attempt.
pub fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

pub fn is_transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

/// Exponential backoff between attempts, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Wait before retry number `retry` (zero-based).
    pub fn delay(&self, retry: u32) -> Duration {
        2u32.checked_pow(retry)
            .map(|factor| self.initial_delay.saturating_mul(factor))
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Download {
    /// URL after redirects.
    pub url: String,
    pub body: Vec<u8>,
}

impl Download {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} answered with http status {status}")]
    Status { url: String, status: u16 },
}

enum Attempt {
    Done(Download),
    Retry(String),
    Fail(FetchError),
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: FetcherConfig) -> anyhow::Result<Self> {
        let builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .gzip(true)
            .brotli(true);
        let builder = match config.user_agent {
            Some(agent) => builder.user_agent(agent),
            None => builder,
        };
        Ok(Self {
            client: builder.build().context("building http client")?,
            retry: config.retry,
        })
    }

    /// GET `url`, retrying transient failures per the configured policy.
    pub async fn get(&self, url: &str) -> Result<Download, FetchError> {
        async {
            let mut retry = 0;
            loop {
                match self.attempt(url, retry < self.retry.retries).await {
                    Attempt::Done(download) => {
                        debug!(bytes = download.body.len(), "download complete");
                        return Ok(download);
                    }
                    Attempt::Fail(err) => return Err(err),
                    Attempt::Retry(reason) => {
                        let wait = self.retry.delay(retry);
                        warn!(%reason, retry, wait_ms = wait.as_millis() as u64, "retrying request");
                        tokio::time::sleep(wait).await;
                        retry += 1;
                    }
                }
            }
        }
        .instrument(info_span!("http_fetch", url))
        .await
    }

    async fn attempt(&self, url: &str, may_retry: bool) -> Attempt {
        let transport = |source| FetchError::Transport {
            url: url.to_string(),
            source,
        };
        let resp = match self.client.get(url).send().await {
            Ok(resp) => resp,
            Err(err) if may_retry && is_transient_error(&err) => return Attempt::Retry(err.to_string()),
            Err(err) => return Attempt::Fail(transport(err)),
        };

        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            if may_retry && is_transient_status(status) {
                return Attempt::Retry(format!("status {status}"));
            }
            return Attempt::Fail(FetchError::Status {
                url: final_url,
                status: status.as_u16(),
            });
        }

        match resp.bytes().await {
            Ok(body) => Attempt::Done(Download {
                url: final_url,
                body: body.to_vec(),
            }),
            Err(err) => Attempt::Fail(transport(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_hex_sha256() {
        assert_eq!(
            content_hash(b"ep724"),
            hex::encode(Sha256::digest(b"ep724"))
        );
        assert_eq!(
            content_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn archive_path_is_stamped_and_normalizes_extension() {
        let archive = ReleaseArchive::new("/tmp/archive");
        let at = DateTime::parse_from_rfc3339("2022-06-15T17:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            archive.archive_path(at, "stb-ep724", "abc", ".xlsx"),
            PathBuf::from("20220615_170000/stb-ep724/abc.xlsx")
        );
        assert_eq!(
            archive.archive_path(at, "stb-ep724", "abc", ""),
            PathBuf::from("20220615_170000/stb-ep724/abc.bin")
        );
    }

    #[tokio::test]
    async fn same_workbook_is_archived_once() {
        let dir = tempfile::tempdir().unwrap();
        let archive = ReleaseArchive::new(dir.path());
        let at = Utc::now();

        let first = archive
            .archive(at, "stb-ep724", "xlsx", b"PK\x03\x04workbook")
            .await
            .unwrap();
        let again = archive
            .archive(at, "stb-ep724", "xlsx", b"PK\x03\x04workbook")
            .await
            .unwrap();

        assert!(!first.already_present);
        assert!(again.already_present);
        assert_eq!(first.path, again.path);
        assert_eq!(first.size, 12);
        assert_eq!(std::fs::read(&first.path).unwrap(), b"PK\x03\x04workbook");
    }

    #[tokio::test]
    async fn atomic_write_creates_parents_and_respects_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("runs/2022-06-15/2022-06-15.xlsx");

        assert!(write_atomic(&dest, b"first", false).await.unwrap());
        assert!(!write_atomic(&dest, b"second", false).await.unwrap());
        assert_eq!(std::fs::read(&dest).unwrap(), b"first");

        assert!(write_atomic(&dest, b"third", true).await.unwrap());
        assert_eq!(std::fs::read(&dest).unwrap(), b"third");

        let leftovers = std::fs::read_dir(dest.parent().unwrap())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".partial"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn retry_delay_doubles_up_to_the_cap() {
        let policy = RetryPolicy {
            retries: 5,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(1),
        };
        let delays = (0..4).map(|r| policy.delay(r)).collect::<Vec<_>>();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(250),
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(1),
            ]
        );
        assert_eq!(policy.delay(40), Duration::from_secs(1));
    }

    #[test]
    fn only_server_errors_and_throttling_are_transient() {
        assert!(is_transient_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_transient_status(StatusCode::NOT_FOUND));
        assert!(!is_transient_status(StatusCode::FORBIDDEN));
    }
}

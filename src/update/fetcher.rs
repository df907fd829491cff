//! Resumable bundle downloads
//!
//! Archives are streamed into `downloads/<key>.part`, where the key is
//! derived from the URL. The partial file's length is the resume offset for
//! the next attempt, so an interrupted download continues with a `Range`
//! request instead of starting over. Only a complete, fsynced archive is
//! renamed to `downloads/<key>.zip` and handed to the caller.

use futures::StreamExt;
use rand::Rng;
use reqwest::header::{CONTENT_RANGE, RANGE, RETRY_AFTER};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::FetchConfig;
use crate::core::error::{ErrorRecovery, UpdateError, UpdateResult};
use crate::store::sync_dir;

/// Minimum interval between two progress reports
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Longest `Retry-After` honoured before a retry
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(300);

/// Download progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchProgress {
    pub downloaded: u64,
    /// `None` when the server did not announce a length
    pub total: Option<u64>,
}

/// Progress sink used during a fetch
pub type ProgressFn = dyn Fn(FetchProgress) + Send + Sync;

/// Downloads bundle archives with resume, retry and cancellation
pub struct Fetcher {
    client: reqwest::Client,
    downloads_dir: PathBuf,
    config: FetchConfig,
}

impl Fetcher {
    pub fn new(client: reqwest::Client, downloads_dir: impl Into<PathBuf>, config: FetchConfig) -> Self {
        Self {
            client,
            downloads_dir: downloads_dir.into(),
            config,
        }
    }

    /// HTTP client configured with the fetch timeouts
    pub fn build_client(config: &FetchConfig, app_version: Option<&str>) -> UpdateResult<reqwest::Client> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .user_agent(format!(
                "hot-updater/{} (app {})",
                env!("CARGO_PKG_VERSION"),
                app_version.unwrap_or("unknown")
            ))
            .build()
            .map_err(|e| UpdateError::Config(format!("http client: {}", e)))?;
        Ok(client)
    }

    pub fn downloads_dir(&self) -> &Path {
        &self.downloads_dir
    }

    /// Stable file name stem for a URL
    pub fn download_key(url: &str) -> String {
        let digest = format!("{:x}", Sha256::digest(url.as_bytes()));
        digest[..16].to_string()
    }

    pub fn partial_path(&self, url: &str) -> PathBuf {
        self.downloads_dir
            .join(format!("{}.part", Self::download_key(url)))
    }

    pub fn archive_path(&self, url: &str) -> PathBuf {
        self.downloads_dir
            .join(format!("{}.zip", Self::download_key(url)))
    }

    /// Download `zip_url` and return the path of the complete archive
    ///
    /// Transient failures are retried with exponential backoff. On
    /// cancellation the partial file is removed.
    pub async fn fetch(
        &self,
        zip_url: &str,
        cancel: &CancellationToken,
        progress: Option<&ProgressFn>,
    ) -> UpdateResult<PathBuf> {
        let url = parse_url(zip_url)?;
        tokio::fs::create_dir_all(&self.downloads_dir).await?;

        let partial = self.partial_path(zip_url);
        let target = self.archive_path(zip_url);
        if target.exists() {
            // leftover from an earlier run, contents unknown
            tokio::fs::remove_file(&target).await?;
        }

        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                remove_if_exists(&partial).await;
                return Err(UpdateError::Cancelled);
            }

            match self.download_once(&url, &partial, cancel, progress).await {
                Ok(()) => break,
                Err(UpdateError::Cancelled) => {
                    remove_if_exists(&partial).await;
                    return Err(UpdateError::Cancelled);
                }
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    let delay = self.backoff_delay(attempt, &e);
                    warn!(
                        "Download attempt {}/{} for {} failed: {} (retrying in {:?})",
                        attempt + 1,
                        self.config.max_retries + 1,
                        zip_url,
                        e,
                        delay
                    );
                    attempt += 1;
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            remove_if_exists(&partial).await;
                            return Err(UpdateError::Cancelled);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    warn!("Download of {} failed: {}", zip_url, e);
                    return Err(e);
                }
            }
        }

        tokio::fs::rename(&partial, &target).await?;
        sync_dir(&self.downloads_dir)?;
        info!("Downloaded {} to {}", zip_url, target.display());
        Ok(target)
    }

    /// One request, resuming from the current partial length
    async fn download_once(
        &self,
        url: &reqwest::Url,
        partial: &Path,
        cancel: &CancellationToken,
        progress: Option<&ProgressFn>,
    ) -> UpdateResult<()> {
        let offset = match tokio::fs::metadata(partial).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };

        let mut request = self.client.get(url.clone());
        if offset > 0 {
            debug!("Resuming download from byte {}", offset);
            request = request.header(RANGE, format!("bytes={}-", offset));
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(UpdateError::Cancelled),
            response = request.send() => response?,
        };

        let status = response.status();
        let (mut file, mut downloaded, total) = if status == StatusCode::PARTIAL_CONTENT && offset > 0 {
            let range_start = response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range);
            match range_start {
                Some((start, total)) if start == offset => {
                    let total = total.or_else(|| response.content_length().map(|l| l + offset));
                    let file = OpenOptions::new().append(true).open(partial).await?;
                    (file, offset, total)
                }
                _ => {
                    remove_if_exists(partial).await;
                    return Err(UpdateError::Network(
                        "server resumed at an unexpected offset".to_string(),
                    ));
                }
            }
        } else if status == StatusCode::RANGE_NOT_SATISFIABLE {
            remove_if_exists(partial).await;
            return Err(UpdateError::Network(
                "partial download rejected by server, restarting".to_string(),
            ));
        } else if status.is_success() {
            if offset > 0 {
                debug!("Server ignored range request, restarting download");
            }
            let file = File::create(partial).await?;
            (file, 0, response.content_length())
        } else if status == StatusCode::TOO_MANY_REQUESTS {
            // only the delta-seconds form; an HTTP date falls back to the default
            let retry_after_secs = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            return Err(UpdateError::RateLimited { retry_after_secs });
        } else {
            return Err(UpdateError::HttpStatus {
                status: status.as_u16(),
            });
        };

        let mut stream = response.bytes_stream();
        let mut last_report = Instant::now();

        let streamed: UpdateResult<()> = async {
            loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => return Err(UpdateError::Cancelled),
                    chunk = stream.next() => chunk,
                };
                let Some(chunk) = chunk else { return Ok(()) };
                let chunk = chunk?;
                file.write_all(&chunk).await?;
                downloaded += chunk.len() as u64;

                if let Some(report) = progress {
                    if last_report.elapsed() >= PROGRESS_INTERVAL {
                        last_report = Instant::now();
                        report(FetchProgress { downloaded, total });
                    }
                }
            }
        }
        .await;

        // the next attempt resumes from the file length
        file.flush().await?;
        streamed?;
        file.sync_all().await?;

        if let Some(total) = total {
            if downloaded < total {
                return Err(UpdateError::Network(format!(
                    "connection closed after {} of {} bytes",
                    downloaded, total
                )));
            }
        }

        if let Some(report) = progress {
            report(FetchProgress { downloaded, total });
        }
        Ok(())
    }

    /// Delay before retry number `attempt + 1`
    ///
    /// A rate-limited response waits at least as long as the server asked,
    /// up to [`MAX_RETRY_AFTER`].
    pub fn backoff_delay(&self, attempt: u32, error: &UpdateError) -> Duration {
        let base = self.config.backoff_base_ms;
        let exp = base.saturating_mul(1u64 << attempt.min(20));
        let capped = exp.min(self.config.backoff_max_ms);
        let jitter = if capped >= 4 {
            rand::thread_rng().gen_range(0..=capped / 4)
        } else {
            0
        };
        let delay = Duration::from_millis(capped + jitter);

        match error {
            UpdateError::RateLimited { .. } | UpdateError::HttpStatus { status: 429 } => {
                let floor = Duration::from_millis(error.retry_delay_ms().unwrap_or(0));
                delay.max(floor.min(MAX_RETRY_AFTER))
            }
            _ => delay,
        }
    }

    /// Remove the partial and completed downloads for `url`
    pub async fn discard(&self, url: &str) {
        remove_if_exists(&self.partial_path(url)).await;
        remove_if_exists(&self.archive_path(url)).await;
    }

    /// Remove every `.part` file left by earlier runs
    pub async fn cleanup_partials(&self) -> UpdateResult<usize> {
        if !self.downloads_dir.exists() {
            return Ok(0);
        }

        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.downloads_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map(|e| e == "part").unwrap_or(false) {
                tokio::fs::remove_file(&path).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!("Removed {} stale partial download(s)", removed);
        }
        Ok(removed)
    }
}

fn parse_url(zip_url: &str) -> UpdateResult<reqwest::Url> {
    let url = reqwest::Url::parse(zip_url)
        .map_err(|e| UpdateError::InvalidUrl(format!("{}: {}", zip_url, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(UpdateError::InvalidUrl(format!(
            "unsupported scheme {}: {}",
            other, zip_url
        ))),
    }
}

/// Parse `bytes <start>-<end>/<total>` into `(start, total)`
fn parse_content_range(value: &str) -> Option<(u64, Option<u64>)> {
    let rest = value.trim().strip_prefix("bytes ")?;
    let (range, total) = rest.split_once('/')?;
    let (start, _end) = range.split_once('-')?;
    let start = start.trim().parse().ok()?;
    let total = total.trim().parse().ok();
    Some((start, total))
}

async fn remove_if_exists(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

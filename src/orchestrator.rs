//! Main orchestration logic for fetching chunks and installing builds.

use crate::assemble::assemble_files;
use crate::download::download_chunk;
use crate::error::{ChunkSyncError, Result};
use crate::progress::ProgressSink;
use crate::types::{CdnMirror, ChunkInfo, DownloadConfig, Manifest};
use crate::verify::verify_cached_chunk;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_retry2::{Retry, RetryError};
use tracing::{error, info, warn};

/// One chunk together with the URLs it may be fetched from, in preference order.
#[derive(Debug, Clone)]
pub struct ChunkJob {
    pub info: ChunkInfo,
    pub urls: Vec<String>,
}

impl ChunkJob {
    /// Builds the per-mirror URLs for `info` under `chunk_dir`.
    pub fn for_mirrors(info: ChunkInfo, chunk_dir: &str, mirrors: &[CdnMirror]) -> Self {
        let urls = mirrors.iter().map(|m| m.url_for(&info, chunk_dir)).collect();
        Self { info, urls }
    }
}

/// Summary of a chunk download run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadReport {
    /// Chunks fetched over the network.
    pub downloaded: usize,
    /// Chunks already cached and verified.
    pub reused: usize,
}

/// Summary of a full install.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
    pub chunks: DownloadReport,
    pub files: usize,
    pub installed_bytes: u64,
}

enum ChunkOutcome {
    Downloaded,
    Reused,
}

/// Fetches chunk sets into a GUID-keyed cache and drives full installs.
///
/// # Example
///
/// ```no_run
/// use chunksync::{CdnMirror, DownloadConfig, DownloadOrchestrator, DownloadProgress, Manifest};
/// use std::path::Path;
/// use std::sync::Arc;
///
/// # async fn example(manifest: Manifest) -> Result<(), Box<dyn std::error::Error>> {
/// let orchestrator = DownloadOrchestrator::new(DownloadConfig::default())?;
/// let mirrors = vec![CdnMirror::new("https://cdn.example.com")];
/// let progress = Arc::new(DownloadProgress::new());
/// orchestrator
///     .install(&manifest, &mirrors, Path::new("./game"), progress)
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct DownloadOrchestrator {
    client: reqwest::Client,
    config: DownloadConfig,
}

impl DownloadOrchestrator {
    /// Creates an orchestrator with its own HTTP client using the configured timeouts.
    pub fn new(config: DownloadConfig) -> Result<Self> {
        let client = build_client(&config)?;
        Ok(Self { client, config })
    }

    /// Creates an orchestrator that shares an existing client.
    pub fn with_client(client: reqwest::Client, config: DownloadConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Delays slept between consecutive attempts of one chunk: `base`, `2·base`, ...
    /// There is one fewer delay than `max_attempts`.
    pub fn retry_schedule(&self) -> Vec<Duration> {
        let base = self.config.retry_base_delay_ms;
        (0..self.config.max_attempts.saturating_sub(1))
            .map(|n| Duration::from_millis(base.saturating_mul(1u64 << n.min(32))))
            .collect()
    }

    /// Fetches every chunk from the CDN mirrors into the configured cache directory.
    pub async fn download_from_mirrors(
        &self,
        chunks: &[ChunkInfo],
        chunk_dir: &str,
        mirrors: &[CdnMirror],
        progress: Arc<dyn ProgressSink>,
    ) -> Result<DownloadReport> {
        let jobs = chunks
            .iter()
            .map(|c| ChunkJob::for_mirrors(c.clone(), chunk_dir, mirrors))
            .collect();
        self.download_chunks(jobs, &self.config.cache_dir, progress)
            .await
    }

    /// Downloads `jobs` into `cache_dir` in batches of `max_concurrent_downloads`.
    ///
    /// Cancellation is checked before each batch. All tasks of a batch are joined
    /// before a failure is reported; chunks finished so far stay in the cache.
    pub async fn download_chunks(
        &self,
        jobs: Vec<ChunkJob>,
        cache_dir: &Path,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<DownloadReport> {
        if let Some(job) = jobs.iter().find(|j| j.urls.is_empty()) {
            return Err(ChunkSyncError::MissingData(format!(
                "no download URL for chunk {}",
                job.info.guid
            )));
        }
        tokio::fs::create_dir_all(cache_dir).await?;

        let total = jobs.len();
        let batch_size = self.config.max_concurrent_downloads.max(1);
        let schedule = self.retry_schedule();
        let mut report = DownloadReport::default();
        info!(
            "📦 Fetching {} chunks into {} ({} at a time)",
            total,
            cache_dir.display(),
            batch_size
        );

        for (batch_idx, batch) in jobs.chunks(batch_size).enumerate() {
            if !progress.is_active() {
                warn!("Download cancelled before batch {}", batch_idx);
                return Err(ChunkSyncError::Cancelled);
            }

            let tasks: Vec<_> = batch
                .iter()
                .map(|job| {
                    let ctx = ChunkTask {
                        client: self.client.clone(),
                        job: job.clone(),
                        cache_dir: cache_dir.to_path_buf(),
                        schedule: schedule.clone(),
                        skip_verify: self.config.skip_verify,
                        progress: Arc::clone(&progress),
                    };
                    tokio::spawn(ctx.run())
                })
                .collect();

            let mut first_error = None;
            for task in tasks {
                match task.await {
                    Ok(Ok(ChunkOutcome::Downloaded)) => report.downloaded += 1,
                    Ok(Ok(ChunkOutcome::Reused)) => report.reused += 1,
                    Ok(Err(e)) => {
                        error!("Chunk task failed: {}", e);
                        first_error.get_or_insert(e);
                    }
                    Err(e) => {
                        error!("Task join error: {}", e);
                        first_error.get_or_insert(ChunkSyncError::IoError(
                            std::io::Error::other(format!("Task join error: {}", e)),
                        ));
                    }
                }
            }
            if let Some(e) = first_error {
                progress.set_status("Download failed");
                return Err(e);
            }

            let done = report.downloaded + report.reused;
            progress.set_status(&format!("Downloaded {}/{} chunks", done, total));
        }

        info!(
            "✅ Chunks ready: {} downloaded, {} reused from cache",
            report.downloaded, report.reused
        );
        Ok(report)
    }

    /// Cache subdirectory that stages chunks for installing `manifest` into
    /// `install_dir`.
    ///
    /// Each destination gets its own directory, so installs sharing one cache never
    /// remove each other's chunks, while an interrupted install resumes from what it
    /// already fetched.
    pub fn staging_dir(&self, manifest: &Manifest, install_dir: &Path) -> PathBuf {
        let app: String = manifest
            .meta
            .app_name
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .take(48)
            .collect();
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(install_dir.to_string_lossy().as_bytes());
        hasher.update(manifest.meta.build_version.as_bytes());
        let name = if app.is_empty() { "build" } else { app.as_str() };
        self.config
            .cache_dir
            .join(format!("{}-{:08x}", name, hasher.finalize()))
    }

    /// Full install: fetch every required chunk into this install's staging
    /// directory, assemble all files under `install_dir`, then delete that staging
    /// directory.
    pub async fn install(
        &self,
        manifest: &Manifest,
        mirrors: &[CdnMirror],
        install_dir: &Path,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<InstallReport> {
        manifest.validate()?;
        let chunks = manifest.required_chunks();
        info!(
            "🚀 Installing {} files ({} bytes) from {} chunks ({} bytes to fetch)",
            manifest.file_manifest_list.len(),
            manifest.total_installed_size(),
            chunks.len(),
            manifest.total_download_size()
        );

        let staging = self.staging_dir(manifest, install_dir);
        let jobs = chunks
            .into_iter()
            .map(|c| ChunkJob::for_mirrors(c, manifest.chunk_dir(), mirrors))
            .collect();

        progress.set_status("Downloading chunks");
        let report = self
            .download_chunks(jobs, &staging, Arc::clone(&progress))
            .await?;

        progress.set_status("Assembling files");
        let installed_bytes = assemble_files(
            &manifest.file_manifest_list,
            &staging,
            install_dir,
            self.config.verify_files,
            progress.as_ref(),
        )
        .await?;

        if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
            warn!("Failed to remove chunk staging {}: {}", staging.display(), e);
        }

        progress.set_status("Install complete");
        Ok(InstallReport {
            chunks: report,
            files: manifest.file_manifest_list.len(),
            installed_bytes,
        })
    }
}

/// Builds the shared HTTP client with connect and request timeouts.
pub(crate) fn build_client(config: &DownloadConfig) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .connect_timeout(config.connect_timeout)
        .timeout(config.request_timeout)
        .build()?)
}

/// Everything one spawned chunk task owns.
struct ChunkTask {
    client: reqwest::Client,
    job: ChunkJob,
    cache_dir: PathBuf,
    schedule: Vec<Duration>,
    skip_verify: bool,
    progress: Arc<dyn ProgressSink>,
}

impl ChunkTask {
    async fn run(self) -> Result<ChunkOutcome> {
        let info = &self.job.info;
        let cached = self.cache_dir.join(info.guid.to_string());
        if verify_cached_chunk(&cached, info, self.skip_verify).await? {
            self.progress.add_bytes(info.file_size);
            return Ok(ChunkOutcome::Reused);
        }

        let attempts = self.schedule.len() + 1;
        let mut attempt = 0usize;
        Retry::spawn(self.schedule.clone(), || {
            attempt += 1;
            let current = attempt;
            let task = &self;
            async move {
                match task.try_mirrors().await {
                    Ok(()) => Ok(ChunkOutcome::Downloaded),
                    Err(e) if e.is_retriable() => {
                        warn!(
                            "Chunk {} failed (attempt {}/{}): {}",
                            task.job.info.guid, current, attempts, e
                        );
                        RetryError::to_transient(e)
                    }
                    Err(e) => {
                        error!("Chunk {} failed permanently: {}", task.job.info.guid, e);
                        RetryError::to_permanent(e)
                    }
                }
            }
        })
        .await
    }

    /// One attempt: every mirror in order, first success wins.
    async fn try_mirrors(&self) -> Result<()> {
        let mut last_error = None;
        for (idx, url) in self.job.urls.iter().enumerate() {
            match download_chunk(
                &self.client,
                url,
                &self.cache_dir,
                &self.job.info,
                self.progress.as_ref(),
            )
            .await
            {
                Ok(_) => return Ok(()),
                Err(e) => {
                    if idx + 1 < self.job.urls.len() {
                        warn!(
                            "Mirror {} failed for chunk {}: {}, trying next",
                            url, self.job.info.guid, e
                        );
                    }
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            ChunkSyncError::MissingData(format!("no mirrors for chunk {}", self.job.info.guid))
        }))
    }
}

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug, warn};

use crate::Result;
use crate::cloud::CloudClient;
use crate::config::remote_join;
use crate::model::{DataType, OperationState, StepOutput, format_size};
use crate::slice::{SliceOutcome, SliceReporter};

const DEFAULT_TICK: Duration = Duration::from_millis(500);

/// Moves archives to and from a [`CloudClient`], keeping the slice record's
/// `content` up to date while the transfer runs.
#[derive(Clone)]
pub struct TransferGateway {
    client: Arc<dyn CloudClient>,
    tick: Duration,
}

/// Result of fetching one slice archive.
#[derive(Debug)]
pub enum Download {
    Ready(PathBuf),
    /// Nothing to restore; the outcome classifies why.
    Unavailable(SliceOutcome),
}

#[derive(Default)]
struct Counters {
    done: AtomicU64,
    total: AtomicU64,
}

impl Counters {
    fn update(&self, done: u64, total: u64) {
        self.done.store(done, Ordering::Relaxed);
        self.total.store(total, Ordering::Relaxed);
    }

    fn percent(&self) -> u64 {
        let total = self.total.load(Ordering::Relaxed);
        if total == 0 {
            return 0;
        }
        (self.done.load(Ordering::Relaxed).saturating_mul(100) / total).min(100)
    }
}

impl TransferGateway {
    pub fn new(client: Arc<dyn CloudClient>) -> Self {
        Self {
            client,
            tick: DEFAULT_TICK,
        }
    }

    /// Interval at which transfer progress is written to the slice record.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn client(&self) -> &Arc<dyn CloudClient> {
        &self.client
    }

    /// Uploads a finished archive. The slice goes DONE → UPLOADING → DONE even when
    /// the transfer fails; the failure only lands in the log and the returned output.
    pub async fn upload_slice(
        &self,
        reporter: &mut SliceReporter<'_>,
        archive: &Path,
        remote_dir: &str,
    ) -> Result<StepOutput> {
        reporter.transition(OperationState::Uploading).await?;
        reporter.set_content("0%").await?;

        let counters = Counters::default();
        let on_progress = |done: u64, total: u64| counters.update(done, total);
        let mut upload = self.client.upload(archive, remote_dir, &on_progress);
        let mut ticker = tokio::time::interval(self.tick);
        ticker.tick().await;
        let result = loop {
            tokio::select! {
                res = &mut upload => break res,
                _ = ticker.tick() => {
                    reporter.set_content(format!("{}%", counters.percent())).await?;
                }
            }
        };

        let out = match result {
            Ok(()) => {
                debug!(
                    event = "cloud.upload.finish",
                    provider = self.client.provider(),
                    path = %archive.display(),
                    remote_dir,
                    "cloud.upload.finish"
                );
                reporter.set_content("100%").await?;
                StepOutput::line(
                    true,
                    format!("Uploaded {} to {remote_dir}.", archive.display()),
                )
            }
            Err(e) => {
                warn!(
                    event = "io.cloud.upload_failed",
                    provider = self.client.provider(),
                    path = %archive.display(),
                    remote_dir,
                    error = %e,
                    "io.cloud.upload_failed"
                );
                StepOutput::line(
                    false,
                    format!("Failed to upload {}: {e}", archive.display()),
                )
            }
        };
        reporter.append_log(&out.lines);
        reporter.transition(OperationState::Done).await?;
        Ok(out)
    }

    /// Fetches `{remote_dir}/{file_name}` into a freshly cleared `staging_dir`.
    /// The slice goes PENDING → DOWNLOADING; the caller applies the final outcome.
    pub async fn download_slice(
        &self,
        reporter: &mut SliceReporter<'_>,
        remote_dir: &str,
        file_name: &str,
        staging_dir: &Path,
    ) -> Result<Download> {
        let data_type = reporter.data_type();
        let remote_path = remote_join(remote_dir, file_name);
        reporter.transition(OperationState::Downloading).await?;

        match tokio::fs::remove_dir_all(staging_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::create_dir_all(staging_dir).await?;

        let exists = match self.client.exists(&remote_path).await {
            Ok(exists) => exists,
            Err(e) => {
                warn!(
                    event = "io.cloud.exists_failed",
                    provider = self.client.provider(),
                    remote_path = %remote_path,
                    error = %e,
                    "io.cloud.exists_failed"
                );
                false
            }
        };
        if !exists {
            return Ok(Download::Unavailable(missing_remote(data_type, &remote_path)));
        }

        let counters = Counters::default();
        let on_progress = |done: u64, total: u64| counters.update(done, total);
        let mut download = self
            .client
            .download(&remote_path, staging_dir, &on_progress);
        let mut ticker = tokio::time::interval(self.tick);
        ticker.tick().await;
        let result = loop {
            tokio::select! {
                res = &mut download => break res,
                _ = ticker.tick() => {
                    let done = counters.done.load(Ordering::Relaxed);
                    reporter.set_content(format_size(done)).await?;
                }
            }
        };

        match result {
            Ok(path) => {
                let done = counters.done.load(Ordering::Relaxed);
                reporter.set_content(format_size(done)).await?;
                debug!(
                    event = "cloud.download.finish",
                    provider = self.client.provider(),
                    remote_path = %remote_path,
                    bytes = done,
                    "cloud.download.finish"
                );
                Ok(Download::Ready(path))
            }
            Err(e) => {
                warn!(
                    event = "io.cloud.download_failed",
                    provider = self.client.provider(),
                    remote_path = %remote_path,
                    error = %e,
                    "io.cloud.download_failed"
                );
                Ok(Download::Unavailable(SliceOutcome::failed(
                    data_type,
                    0,
                    vec![format!("Failed to download {remote_path}: {e}")],
                )))
            }
        }
    }
}

/// USER and APK are needed for a usable restore; the rest may be missing remotely.
fn missing_remote(data_type: DataType, remote_path: &str) -> SliceOutcome {
    match data_type {
        DataType::User | DataType::Apk => SliceOutcome::failed(
            data_type,
            0,
            vec![format!(
                "Failed to connect to cloud or file not exist: {remote_path}"
            )],
        ),
        _ => SliceOutcome::absent(
            data_type,
            format!("Failed to connect to cloud or file not exist, skip: {remote_path}"),
        ),
    }
}

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

use crate::Result;
use crate::archive::{ArchiveCodec, ArchiveSource, CompressionParams, ExtractOptions, TarCodec};
use crate::config::Settings;
use crate::model::{DataType, ItemId, StepOutput};
use crate::package_manager::PackageManager;
use crate::progress::{ArchiveProgress, ProgressSink, TaskProgress};
use crate::record_store::RecordStore;
use crate::security::{ContextRestorer, SecurityContext};
use crate::verify::IntegrityVerifier;

/// Exclusive per-directory locks; one worker owns an archive directory at a time.
/// An entry lives only while someone holds or waits for its lock.
#[derive(Debug, Default)]
pub struct DirLocks {
    inner: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

/// Held lock on one directory; releasing the last holder drops the map entry.
pub struct DirGuard<'a> {
    locks: &'a DirLocks,
    dir: PathBuf,
    guard: Option<OwnedMutexGuard<()>>,
}

impl DirLocks {
    pub async fn lock(&self, dir: &Path) -> DirGuard<'_> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(dir.to_path_buf()).or_default().clone()
        };
        let guard = lock.lock_owned().await;
        DirGuard {
            locks: self,
            dir: dir.to_path_buf(),
            guard: Some(guard),
        }
    }

    /// Directories currently locked or waited on.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for DirGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut map = self.locks.inner.lock().unwrap_or_else(|e| e.into_inner());
        // Clones are only taken under the map lock, so a count of one means
        // nobody else holds or waits for this directory.
        if map
            .get(&self.dir)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            map.remove(&self.dir);
        }
    }
}

/// Everything an orchestrator needs, passed explicitly instead of held in globals.
pub struct EngineContext {
    pub settings: Settings,
    pub store: Arc<dyn RecordStore>,
    pub packages: Arc<dyn PackageManager>,
    pub security: Arc<dyn SecurityContext>,
    pub codec: Arc<dyn ArchiveCodec>,
    pub progress: Option<Arc<dyn ProgressSink>>,
    pub locks: DirLocks,
}

impl EngineContext {
    pub fn new(
        settings: Settings,
        store: Arc<dyn RecordStore>,
        packages: Arc<dyn PackageManager>,
        security: Arc<dyn SecurityContext>,
    ) -> Self {
        Self {
            settings,
            store,
            packages,
            security,
            codec: Arc::new(TarCodec::new()),
            progress: None,
            locks: DirLocks::default(),
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn ArchiveCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn verifier(&self) -> IntegrityVerifier {
        IntegrityVerifier::new(self.codec.clone(), self.settings.compression_test)
    }

    pub(crate) fn progress_sink(&self) -> Option<&dyn ProgressSink> {
        self.progress.as_deref()
    }

    fn archive_progress(
        &self,
        item: &ItemId,
        data_type: DataType,
        phase: &'static str,
        total: Option<u64>,
    ) -> impl Fn(ArchiveProgress) + Send + 'static {
        let sink = self.progress.clone();
        let item_id = item.to_string();
        move |p: ArchiveProgress| {
            if let Some(sink) = &sink {
                sink.on_progress(TaskProgress {
                    item_id: item_id.clone(),
                    data_type: Some(data_type),
                    phase: phase.to_string(),
                    bytes_done: Some(p.bytes_processed),
                    bytes_total: total,
                    throughput_bps: Some(p.throughput_bps),
                });
            }
        }
    }

    /// Compresses then runs the deleting integrity test. Output lines of both steps.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn compress_and_verify(
        &self,
        item: &ItemId,
        data_type: DataType,
        source: ArchiveSource,
        dst: PathBuf,
        exclusions: Vec<String>,
        params: CompressionParams,
        total: u64,
    ) -> Result<StepOutput> {
        let codec = self.codec.clone();
        let verifier = self.verifier();
        let follow_symlinks = self.settings.follow_symlinks;
        let on_progress = self.archive_progress(item, data_type, "archive.compress", Some(total));
        let out = tokio::task::spawn_blocking(move || {
            let mut out = codec.compress(
                &source,
                &dst,
                &exclusions,
                follow_symlinks,
                params,
                &on_progress,
            );
            if !out.success {
                return out;
            }
            let tested = verifier.test_archive(&dst, params);
            out.success = tested.success;
            out.lines.extend(tested.lines);
            out
        })
        .await?;
        Ok(out)
    }

    /// Integrity test that leaves the archive in place.
    pub(crate) async fn check_archive(
        &self,
        src: PathBuf,
        params: CompressionParams,
    ) -> Result<StepOutput> {
        let verifier = self.verifier();
        Ok(tokio::task::spawn_blocking(move || verifier.check_archive(&src, params)).await?)
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn decompress(
        &self,
        item: &ItemId,
        data_type: DataType,
        src: PathBuf,
        dst_dir: PathBuf,
        exclusions: Vec<String>,
        options: ExtractOptions,
        params: CompressionParams,
    ) -> Result<StepOutput> {
        let codec = self.codec.clone();
        let on_progress = self.archive_progress(item, data_type, "archive.decompress", None);
        Ok(tokio::task::spawn_blocking(move || {
            codec.decompress(&src, &dst_dir, &exclusions, options, params, &on_progress)
        })
        .await?)
    }

    pub(crate) async fn capture_context(&self, path: PathBuf) -> Result<Option<String>> {
        let security = self.security.clone();
        let fallback = self.settings.context.clone();
        Ok(tokio::task::spawn_blocking(move || {
            ContextRestorer::new(security.as_ref(), &fallback).capture(&path)
        })
        .await?)
    }

    pub(crate) async fn owner(&self, path: PathBuf) -> Result<std::io::Result<(u32, u32)>> {
        let security = self.security.clone();
        Ok(tokio::task::spawn_blocking(move || security.owner(&path)).await?)
    }

    pub(crate) async fn restore_context(
        &self,
        dst: PathBuf,
        parent: PathBuf,
        uid: u32,
        gid: u32,
        captured: Option<String>,
    ) -> Result<StepOutput> {
        let security = self.security.clone();
        let fallback = self.settings.context.clone();
        Ok(tokio::task::spawn_blocking(move || {
            ContextRestorer::new(security.as_ref(), &fallback).restore(
                &dst,
                &parent,
                uid,
                gid,
                captured.as_deref(),
            )
        })
        .await?)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn dir_locks_are_exclusive_per_directory() {
        let locks = Arc::new(DirLocks::default());
        let a = locks.lock(Path::new("/backup/a")).await;
        let _b = locks.lock(Path::new("/backup/b")).await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(Path::new("/backup/a")).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        drop(a);
        tokio::time::timeout(Duration::from_secs(5), contender)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn released_dirs_leave_no_entry_behind() {
        let locks = DirLocks::default();
        for i in 0..100 {
            let _guard = locks.lock(&PathBuf::from(format!("/backup/{i}"))).await;
        }
        assert!(locks.is_empty());

        let held = locks.lock(Path::new("/backup/a")).await;
        {
            let _other = locks.lock(Path::new("/backup/b")).await;
            assert_eq!(locks.len(), 2);
        }
        assert_eq!(locks.len(), 1);
        drop(held);
        assert!(locks.is_empty());
    }
}

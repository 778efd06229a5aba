use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::Result;
use crate::archive::{ArchiveSource, ExtractOptions};
use crate::config::AppTree;
use crate::engine::EngineContext;
use crate::model::{DataType, ItemId, MediumItem, OperationState, archive_dst};
use crate::packages::{ItemOptions, path_exists, remove_quietly};
use crate::size::measure;
use crate::slice::{ItemReport, SliceOutcome, SliceReporter};
use crate::transfer::Download;

/// Medium items are a single slice, recorded under this data type.
const MEDIUM_SLICE: DataType = DataType::Media;
const BACKUP_OUTPUT_PATTERN: &str = "Backup_*";

/// Backup and restore of arbitrary directory trees.
#[derive(Clone)]
pub struct MediumOrchestrator {
    ctx: Arc<EngineContext>,
}

/// `src` split into the directory the archive is rooted at and the entry name.
fn split_source(src: &Path) -> Option<(PathBuf, String)> {
    let parent = src.parent()?;
    let name = src.file_name()?.to_str()?;
    Some((parent.to_path_buf(), name.to_string()))
}

impl MediumOrchestrator {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// `Backup_*` below the root plus the backup directory itself when it lives
    /// inside the tree. The root entry is never excluded, whatever its name.
    fn exclusions(&self, parent: &Path, src: &Path) -> Vec<String> {
        let mut exclusions = Vec::new();
        if let Some(root) = src.file_name().and_then(|n| n.to_str()) {
            exclusions.push(format!("{root}/**/{BACKUP_OUTPUT_PATTERN}"));
        }
        let backup_dir = &self.ctx.settings.backup_dir;
        if backup_dir.starts_with(src)
            && backup_dir != src
            && let Ok(rel) = backup_dir.strip_prefix(parent)
            && let Some(rel) = rel.to_str()
        {
            exclusions.push(rel.to_string());
        }
        exclusions
    }

    pub async fn backup(
        &self,
        run_id: &str,
        item: &MediumItem,
        options: ItemOptions<'_>,
    ) -> Result<ItemReport> {
        let item_id = item.id();
        let dst_dir = self.ctx.settings.medium_archive_dir(item);
        let _guard = self.ctx.locks.lock(&dst_dir).await;
        tokio::fs::create_dir_all(&dst_dir).await?;
        info!(
            event = "item.start",
            run_id,
            item_id = %item_id,
            kind = "backup",
            dst_dir = %dst_dir.display(),
            "item.start"
        );

        let mut reporter = SliceReporter::new(
            self.ctx.store.as_ref(),
            self.ctx.progress_sink(),
            run_id,
            &item_id,
            MEDIUM_SLICE,
        );
        reporter.begin().await?;

        let mut report = ItemReport::new(item_id.clone());
        if options.is_cancelled() {
            report.cancelled = true;
            return Ok(report);
        }

        let previous = match self.ctx.store.previous_bytes(&item_id, MEDIUM_SLICE).await? {
            Some(bytes) => Some(bytes),
            None => (item.recorded_bytes > 0).then_some(item.recorded_bytes),
        };
        let mut outcome = self
            .backup_slice(item, &item_id, &mut reporter, &dst_dir, previous)
            .await?;
        reporter.apply(&outcome).await?;

        if let Some(gateway) = options.gateway
            && outcome.state == OperationState::Done
        {
            let archive = archive_dst(&dst_dir, MEDIUM_SLICE, item.compression);
            let remote_dir = self.ctx.settings.medium_remote_dir(item);
            let out = gateway
                .upload_slice(&mut reporter, &archive, &remote_dir)
                .await?;
            outcome.transfer_failed = !out.success;
            outcome.log.extend(out.lines);
        }

        report.slices.push(outcome);
        info!(
            event = "item.finish",
            run_id,
            item_id = %item_id,
            kind = "backup",
            succeeded = report.succeeded(),
            "item.finish"
        );
        Ok(report)
    }

    async fn backup_slice(
        &self,
        item: &MediumItem,
        item_id: &ItemId,
        reporter: &mut SliceReporter<'_>,
        dst_dir: &Path,
        previous: Option<u64>,
    ) -> Result<SliceOutcome> {
        let dt = MEDIUM_SLICE;
        if !item.selected {
            return Ok(SliceOutcome::unselected(dt));
        }

        let src = item.path.as_path();
        if !path_exists(src).await {
            return Ok(SliceOutcome::failed(
                dt,
                0,
                vec![format!("Not exist: {}", src.display())],
            ));
        }
        let Some((parent, name)) = split_source(src) else {
            return Ok(SliceOutcome::failed(
                dt,
                0,
                vec![format!("Cannot archive {}: no file name.", src.display())],
            ));
        };

        let bytes = measure(src.to_path_buf()).await?;
        reporter.processing(bytes).await?;

        let dst = archive_dst(dst_dir, dt, item.compression);
        if previous == Some(bytes) && path_exists(&dst).await {
            return Ok(SliceOutcome::unchanged(dt, bytes));
        }

        let exclusions = self.exclusions(&parent, src);
        let params = self.ctx.settings.compression_params(item.compression);
        let source = ArchiveSource::Tree {
            src_dir: parent,
            src_name: name,
        };
        let out = self
            .ctx
            .compress_and_verify(item_id, dt, source, dst.clone(), exclusions, params, bytes)
            .await?;
        if !out.success {
            return Ok(SliceOutcome::failed(dt, bytes, out.lines));
        }
        let archive_bytes = tokio::fs::metadata(&dst).await.map(|m| m.len()).unwrap_or(0);
        Ok(SliceOutcome::done(dt, bytes, out.lines)
            .with_record_bytes(bytes)
            .with_archive_bytes(archive_bytes))
    }

    pub async fn restore(
        &self,
        run_id: &str,
        item: &MediumItem,
        options: ItemOptions<'_>,
    ) -> Result<ItemReport> {
        let item_id = item.id();
        let src_dir = self.ctx.settings.medium_archive_dir(item);
        let _guard = self.ctx.locks.lock(&src_dir).await;
        info!(
            event = "item.start",
            run_id,
            item_id = %item_id,
            kind = "restore",
            src_dir = %src_dir.display(),
            "item.start"
        );

        let mut reporter = SliceReporter::new(
            self.ctx.store.as_ref(),
            self.ctx.progress_sink(),
            run_id,
            &item_id,
            MEDIUM_SLICE,
        );
        reporter.begin().await?;

        let mut report = ItemReport::new(item_id.clone());
        if options.is_cancelled() {
            report.cancelled = true;
            return Ok(report);
        }

        let outcome = if !item.selected {
            SliceOutcome::unselected(MEDIUM_SLICE)
        } else {
            let file_name = format!("{}.{}", MEDIUM_SLICE.as_str(), item.compression.suffix());
            match options.gateway {
                Some(gateway) => {
                    let remote_dir = self.ctx.settings.medium_remote_dir(item);
                    let staging = self.ctx.settings.download_staging_dir(item_id.as_str());
                    let downloaded = gateway
                        .download_slice(&mut reporter, &remote_dir, &file_name, &staging)
                        .await?;
                    let outcome = match downloaded {
                        Download::Ready(path) => {
                            self.restore_slice(item, &item_id, &mut reporter, &path)
                                .await?
                        }
                        Download::Unavailable(outcome) => outcome,
                    };
                    remove_quietly(&staging).await;
                    outcome
                }
                None => {
                    let src = src_dir.join(&file_name);
                    self.restore_slice(item, &item_id, &mut reporter, &src)
                        .await?
                }
            }
        };
        reporter.apply(&outcome).await?;
        debug!(
            event = "slice.finish",
            run_id,
            item_id = %item_id,
            data_type = MEDIUM_SLICE.as_str(),
            state = outcome.state.as_str(),
            code = outcome.code,
            "slice.finish"
        );
        report.slices.push(outcome);

        info!(
            event = "item.finish",
            run_id,
            item_id = %item_id,
            kind = "restore",
            succeeded = report.succeeded(),
            "item.finish"
        );
        Ok(report)
    }

    async fn restore_slice(
        &self,
        item: &MediumItem,
        item_id: &ItemId,
        reporter: &mut SliceReporter<'_>,
        src: &Path,
    ) -> Result<SliceOutcome> {
        let dt = MEDIUM_SLICE;
        if !path_exists(src).await {
            return Ok(SliceOutcome::failed(
                dt,
                0,
                vec![format!("Not exist: {}", src.display())],
            ));
        }
        let Some((parent, _)) = split_source(&item.path) else {
            return Ok(SliceOutcome::failed(
                dt,
                0,
                vec![format!("Cannot restore {}: no file name.", item.path.display())],
            ));
        };

        let bytes = measure(src.to_path_buf()).await?;
        reporter.processing(bytes).await?;

        let params = self.ctx.settings.compression_params(item.compression);
        let mut log = Vec::new();
        let checked = self.ctx.check_archive(src.to_path_buf(), params).await?;
        log.extend(checked.lines);
        if !checked.success {
            return Ok(SliceOutcome::failed(dt, bytes, log));
        }

        let app_tree = self.ctx.settings.layout.app_tree(&item.path);
        let captured = match &app_tree {
            Some(tree) => {
                let context = self
                    .ctx
                    .capture_context(tree.root.join(&tree.package_name))
                    .await?;
                if let Some(context) = &context {
                    log.push(format!("Original context: {context}"));
                }
                context
            }
            None => None,
        };

        if let Err(e) = tokio::fs::create_dir_all(&parent).await {
            log.push(format!("Failed to create {}: {e}", parent.display()));
            return Ok(SliceOutcome::failed(dt, bytes, log));
        }
        let extracted = self
            .ctx
            .decompress(
                item_id,
                dt,
                src.to_path_buf(),
                parent.clone(),
                self.exclusions(&parent, &item.path),
                ExtractOptions {
                    clear_destination: self.ctx.settings.clean_restoring,
                    merge: false,
                },
                params,
            )
            .await?;
        log.extend(extracted.lines);
        if !extracted.success {
            return Ok(SliceOutcome::failed(dt, bytes, log));
        }

        if let Some(tree) = app_tree {
            let restored = self.restore_app_tree(&tree, captured, &mut log).await?;
            if !restored {
                return Ok(SliceOutcome::failed(dt, bytes, log));
            }
        }
        Ok(SliceOutcome::done(dt, bytes, log))
    }

    /// Hands a restored tree that lives inside an app's data back to that app.
    async fn restore_app_tree(
        &self,
        tree: &AppTree,
        captured: Option<String>,
        log: &mut Vec<String>,
    ) -> Result<bool> {
        let pkg = tree.package_name.as_str();
        let uid = match self.ctx.packages.uid(pkg, tree.user_id).await {
            Ok(Some(uid)) => uid,
            Ok(None) => {
                log.push(format!("Failed to get uid of {pkg}."));
                return Ok(false);
            }
            Err(e) => {
                warn!(event = "pm.uid_failed", package = pkg, error = %e, "pm.uid_failed");
                log.push(format!("Failed to get uid of {pkg}."));
                return Ok(false);
            }
        };
        let gid = if tree.data_type.is_shared_storage() {
            match self.ctx.owner(tree.root.clone()).await? {
                Ok((_, gid)) => gid,
                Err(e) => {
                    log.push(format!("Failed to get group of {}: {e}", tree.root.display()));
                    return Ok(false);
                }
            }
        } else {
            uid
        };

        let restored = self
            .ctx
            .restore_context(
                tree.root.join(pkg),
                tree.root.clone(),
                uid,
                gid,
                captured,
            )
            .await?;
        log.extend(restored.lines);
        Ok(restored.success)
    }
}

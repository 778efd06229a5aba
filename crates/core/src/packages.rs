use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::archive::{ArchiveSource, ExtractOptions};
use crate::config::remote_join;
use crate::engine::EngineContext;
use crate::model::{DataType, ItemId, OperationState, PackageItem, StepOutput, archive_dst};
use crate::package_config::{
    PACKAGE_CONFIG_FILE, PackageConfig, package_config_path, read_package_config,
    write_package_config,
};
use crate::size::measure;
use crate::slice::{ItemReport, SliceOutcome, SliceReporter};
use crate::transfer::{Download, TransferGateway};
use crate::{Error, Result};

const APK_PATTERN: &str = "*.apk";

/// Per-item knobs shared by both orchestrators.
#[derive(Clone, Copy, Default)]
pub struct ItemOptions<'a> {
    /// Honored between slices only.
    pub cancel: Option<&'a CancellationToken>,
    /// Upload finished archives (backup) or fetch them first (restore).
    pub gateway: Option<&'a TransferGateway>,
}

impl ItemOptions<'_> {
    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_some_and(CancellationToken::is_cancelled)
    }
}

pub(crate) async fn path_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

pub(crate) async fn recreate_dir(dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    tokio::fs::create_dir_all(dir).await?;
    Ok(())
}

pub(crate) async fn remove_quietly(path: &Path) {
    let res = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(_) => return,
    };
    if let Err(e) = res {
        warn!(
            event = "io.fs.remove_failed",
            path = %path.display(),
            error = %e,
            "io.fs.remove_failed"
        );
    }
}

/// Backup and restore of application packages, six slices per item.
#[derive(Clone)]
pub struct PackageOrchestrator {
    ctx: Arc<EngineContext>,
}

impl PackageOrchestrator {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    fn layout_root(&self, item: &PackageItem, data_type: DataType) -> Result<PathBuf> {
        self.ctx
            .settings
            .layout
            .root(data_type, item.user_id)
            .ok_or_else(|| Error::InvalidConfig {
                message: format!("no layout root for data type {data_type}"),
            })
    }

    fn selects(&self, item: &PackageItem, data_type: DataType) -> bool {
        self.ctx
            .settings
            .selection_type
            .selects(&item.selection, data_type)
    }

    /// Store first; the item's own table covers records made before the store existed.
    async fn previous_bytes(
        &self,
        item: &PackageItem,
        id: &ItemId,
        dt: DataType,
    ) -> Result<Option<u64>> {
        if let Some(bytes) = self.ctx.store.previous_bytes(id, dt).await? {
            return Ok(Some(bytes));
        }
        let recorded = item.recorded.get(dt);
        Ok((recorded > 0).then_some(recorded))
    }

    pub async fn backup(
        &self,
        run_id: &str,
        item: &PackageItem,
        options: ItemOptions<'_>,
    ) -> Result<ItemReport> {
        let item_id = item.id();
        let dst_dir = self.ctx.settings.package_archive_dir(item);
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

        let store = self.ctx.store.as_ref();
        let progress = self.ctx.progress_sink();
        let mut reporters = Vec::with_capacity(DataType::PACKAGE_SLICES.len());
        for dt in DataType::PACKAGE_SLICES {
            let mut reporter = SliceReporter::new(store, progress, run_id, &item_id, dt);
            reporter.begin().await?;
            reporters.push(reporter);
        }

        let remote_dir = self.ctx.settings.package_remote_dir(item);
        let mut report = ItemReport::new(item_id.clone());
        if self.ctx.settings.kill_app && !options.is_cancelled() {
            self.force_stop(item, &mut report.log).await;
        }
        for reporter in &mut reporters {
            if options.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let dt = reporter.data_type();
            debug!(
                event = "slice.start",
                run_id,
                item_id = %item_id,
                data_type = dt.as_str(),
                "slice.start"
            );

            let previous = self.previous_bytes(item, &item_id, dt).await?;
            let mut outcome = self
                .backup_slice(item, &item_id, reporter, &dst_dir, previous)
                .await?;
            reporter.apply(&outcome).await?;

            if let Some(gateway) = options.gateway
                && outcome.state == OperationState::Done
            {
                let archive = archive_dst(&dst_dir, dt, item.compression);
                let out = gateway.upload_slice(reporter, &archive, &remote_dir).await?;
                outcome.transfer_failed = !out.success;
                outcome.log.extend(out.lines);
            }

            debug!(
                event = "slice.finish",
                run_id,
                item_id = %item_id,
                data_type = dt.as_str(),
                state = outcome.state.as_str(),
                code = outcome.code,
                "slice.finish"
            );
            report.slices.push(outcome);
        }

        if !report.cancelled {
            self.save_package_config(item, &mut report, &dst_dir, &remote_dir, options.gateway)
                .await;
        }

        info!(
            event = "item.finish",
            run_id,
            item_id = %item_id,
            kind = "backup",
            succeeded = report.succeeded(),
            cancelled = report.cancelled,
            "item.finish"
        );
        Ok(report)
    }

    async fn backup_slice(
        &self,
        item: &PackageItem,
        item_id: &ItemId,
        reporter: &mut SliceReporter<'_>,
        dst_dir: &Path,
        previous: Option<u64>,
    ) -> Result<SliceOutcome> {
        let dt = reporter.data_type();
        if !self.selects(item, dt) {
            return Ok(SliceOutcome::unselected(dt));
        }

        let pkg = item.package_name.as_str();
        let (source, src, exclusions) = match dt {
            DataType::Apk => {
                let dir = match self.ctx.packages.installed_source_dir(pkg, item.user_id).await {
                    Ok(Some(dir)) => dir,
                    Ok(None) => {
                        return Ok(SliceOutcome::failed(
                            dt,
                            0,
                            vec![format!("Failed to get apk path of {pkg}.")],
                        ));
                    }
                    Err(e) => {
                        warn!(event = "pm.path_failed", package = pkg, error = %e, "pm.path_failed");
                        return Ok(SliceOutcome::failed(
                            dt,
                            0,
                            vec![format!("Failed to get apk path of {pkg}."), e.to_string()],
                        ));
                    }
                };
                let source = ArchiveSource::CurrentDir {
                    dir: dir.clone(),
                    pattern: APK_PATTERN.to_string(),
                };
                (source, dir, Vec::new())
            }
            _ => {
                let root = self.layout_root(item, dt)?;
                let src = root.join(pkg);
                let source = ArchiveSource::Tree {
                    src_dir: root,
                    src_name: pkg.to_string(),
                };
                (source, src, dt.exclusions(pkg))
            }
        };

        if !path_exists(&src).await {
            let src = src.display();
            return Ok(if dt.is_mandatory() {
                SliceOutcome::failed(dt, 0, vec![format!("Not exist: {src}")])
            } else {
                SliceOutcome::absent(dt, format!("Not exist and skip: {src}"))
            });
        }

        let bytes = measure(src).await?;
        reporter.processing(bytes).await?;

        let dst = archive_dst(dst_dir, dt, item.compression);
        if previous == Some(bytes) && path_exists(&dst).await {
            return Ok(SliceOutcome::unchanged(dt, bytes));
        }

        let params = self.ctx.settings.compression_params(item.compression);
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
        item: &PackageItem,
        options: ItemOptions<'_>,
    ) -> Result<ItemReport> {
        let item_id = item.id();
        let src_dir = self.ctx.settings.package_archive_dir(item);
        let _guard = self.ctx.locks.lock(&src_dir).await;
        info!(
            event = "item.start",
            run_id,
            item_id = %item_id,
            kind = "restore",
            src_dir = %src_dir.display(),
            "item.start"
        );

        let store = self.ctx.store.as_ref();
        let progress = self.ctx.progress_sink();
        let mut reporters = Vec::with_capacity(DataType::PACKAGE_SLICES.len());
        for dt in DataType::PACKAGE_SLICES {
            let mut reporter = SliceReporter::new(store, progress, run_id, &item_id, dt);
            reporter.begin().await?;
            reporters.push(reporter);
        }

        let remote_dir = self.ctx.settings.package_remote_dir(item);
        let staging = self.ctx.settings.download_staging_dir(item_id.as_str());
        let mut report = ItemReport::new(item_id.clone());
        if self.ctx.settings.kill_app && !options.is_cancelled() {
            self.force_stop(item, &mut report.log).await;
        }
        let mut aborted = false;
        for reporter in &mut reporters {
            if options.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let dt = reporter.data_type();
            debug!(
                event = "slice.start",
                run_id,
                item_id = %item_id,
                data_type = dt.as_str(),
                "slice.start"
            );

            let outcome = if aborted {
                SliceOutcome::aborted(
                    dt,
                    format!("Skipped: {} is not installed.", item.package_name),
                )
            } else if !self.selects(item, dt) {
                SliceOutcome::unselected(dt)
            } else {
                let file_name = format!("{}.{}", dt.as_str(), item.compression.suffix());
                let mut outcome = match options.gateway {
                    Some(gateway) => {
                        let downloaded = gateway
                            .download_slice(reporter, &remote_dir, &file_name, &staging)
                            .await?;
                        let outcome = match downloaded {
                            Download::Ready(path) => {
                                self.restore_slice(item, &item_id, reporter, &path).await?
                            }
                            Download::Unavailable(outcome) => outcome,
                        };
                        remove_quietly(&staging).await;
                        outcome
                    }
                    None => {
                        let src = src_dir.join(&file_name);
                        self.restore_slice(item, &item_id, reporter, &src).await?
                    }
                };
                if dt == DataType::Apk {
                    outcome = self.confirm_installed(item, outcome).await;
                }
                outcome
            };

            reporter.apply(&outcome).await?;
            aborted |= outcome.abort_item;
            debug!(
                event = "slice.finish",
                run_id,
                item_id = %item_id,
                data_type = dt.as_str(),
                state = outcome.state.as_str(),
                code = outcome.code,
                "slice.finish"
            );
            report.slices.push(outcome);
        }

        let settings = &self.ctx.settings;
        if !report.cancelled && !aborted && (settings.restore_permissions || settings.restore_ssaid)
        {
            self.apply_package_config(
                item,
                &mut report,
                &src_dir,
                &remote_dir,
                &staging,
                options.gateway,
            )
            .await;
        }

        info!(
            event = "item.finish",
            run_id,
            item_id = %item_id,
            kind = "restore",
            succeeded = report.succeeded(),
            cancelled = report.cancelled,
            "item.finish"
        );
        Ok(report)
    }

    async fn force_stop(&self, item: &PackageItem, log: &mut Vec<String>) {
        let pkg = item.package_name.as_str();
        let out = self.ctx.packages.force_stop(pkg, item.user_id).await;
        if out.success {
            log.push(format!("Stopped {pkg}."));
        } else {
            warn!(
                event = "pm.force_stop_failed",
                package = pkg,
                user_id = item.user_id,
                "pm.force_stop_failed"
            );
            log.push(format!("Failed to stop {pkg}."));
            log.extend(out.lines);
        }
    }

    /// Captures permissions and SSAID and, when every slice succeeded, writes them
    /// with the recorded sizes next to the archives (and to the remote).
    async fn save_package_config(
        &self,
        item: &PackageItem,
        report: &mut ItemReport,
        dst_dir: &Path,
        remote_dir: &str,
        gateway: Option<&TransferGateway>,
    ) {
        let pkg = item.package_name.as_str();
        let packages = &self.ctx.packages;
        let mut config = PackageConfig::new(item);
        report.apply_recorded(&mut config.recorded);

        match packages.runtime_permissions(pkg, item.user_id).await {
            Ok(permissions) => {
                report
                    .log
                    .push(format!("Permissions size: {}.", permissions.len()));
                config.permissions = permissions;
            }
            Err(e) => {
                warn!(
                    event = "pm.permissions_failed",
                    package = pkg,
                    error = %e,
                    "pm.permissions_failed"
                );
                report.log.push(format!("Failed to get permissions of {pkg}."));
            }
        }
        match packages.uid(pkg, item.user_id).await {
            Ok(Some(uid)) => {
                config.uid = Some(uid);
                match packages.ssaid(pkg, item.user_id, uid).await {
                    Ok(Some(ssaid)) => {
                        report.log.push(format!("Ssaid: {ssaid}"));
                        config.ssaid = Some(ssaid);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(
                            event = "pm.ssaid_failed",
                            package = pkg,
                            error = %e,
                            "pm.ssaid_failed"
                        );
                        report.log.push(format!("Failed to get ssaid of {pkg}."));
                    }
                }
            }
            Ok(None) => report.log.push(format!("Failed to get uid of {pkg}.")),
            Err(e) => {
                warn!(event = "pm.uid_failed", package = pkg, error = %e, "pm.uid_failed");
                report.log.push(format!("Failed to get uid of {pkg}."));
            }
        }

        if !report.succeeded() {
            return;
        }
        let path = match write_package_config(dst_dir, &config).await {
            Ok(path) => path,
            Err(e) => {
                warn!(
                    event = "io.package_config.write_failed",
                    dir = %dst_dir.display(),
                    error = %e,
                    "io.package_config.write_failed"
                );
                report.log.push(format!("Failed to save {PACKAGE_CONFIG_FILE}: {e}"));
                return;
            }
        };
        if let Some(gateway) = gateway
            && let Err(e) = gateway.client().upload(&path, remote_dir, &|_: u64, _: u64| {}).await
        {
            warn!(
                event = "io.cloud.upload_failed",
                provider = gateway.client().provider(),
                path = %path.display(),
                remote_dir,
                error = %e,
                "io.cloud.upload_failed"
            );
            report.log.push(format!("Failed to upload {}: {e}", path.display()));
        }
    }

    async fn load_package_config(
        &self,
        src_dir: &Path,
        remote_dir: &str,
        staging: &Path,
        gateway: Option<&TransferGateway>,
    ) -> Result<Option<PackageConfig>> {
        let Some(gateway) = gateway else {
            return read_package_config(&package_config_path(src_dir)).await;
        };
        let client = gateway.client();
        let remote_path = remote_join(remote_dir, PACKAGE_CONFIG_FILE);
        if !client.exists(&remote_path).await? {
            return Ok(None);
        }
        recreate_dir(staging).await?;
        let loaded = match client.download(&remote_path, staging, &|_: u64, _: u64| {}).await {
            Ok(path) => read_package_config(&path).await,
            Err(e) => Err(e),
        };
        remove_quietly(staging).await;
        loaded
    }

    /// Puts runtime permissions and the SSAID recorded at backup time back.
    /// Failures are logged on the item; the slices have already succeeded or not.
    async fn apply_package_config(
        &self,
        item: &PackageItem,
        report: &mut ItemReport,
        src_dir: &Path,
        remote_dir: &str,
        staging: &Path,
        gateway: Option<&TransferGateway>,
    ) {
        let pkg = item.package_name.as_str();
        let config = match self
            .load_package_config(src_dir, remote_dir, staging, gateway)
            .await
        {
            Ok(Some(config)) => config,
            Ok(None) => {
                report
                    .log
                    .push("No package config, skip permissions and ssaid.".to_string());
                return;
            }
            Err(e) => {
                warn!(
                    event = "package_config.read_failed",
                    package = pkg,
                    error = %e,
                    "package_config.read_failed"
                );
                report.log.push(format!("Failed to read {PACKAGE_CONFIG_FILE}: {e}"));
                return;
            }
        };

        let packages = &self.ctx.packages;
        let uid = match packages.uid(pkg, item.user_id).await {
            Ok(Some(uid)) => uid,
            _ => {
                report.log.push(format!("Failed to get uid of {pkg}."));
                return;
            }
        };

        if self.ctx.settings.restore_permissions {
            report
                .log
                .push(format!("Permissions size: {}.", config.permissions.len()));
            for permission in &config.permissions {
                let out = packages
                    .set_permission(pkg, item.user_id, permission)
                    .await;
                if !out.success {
                    let verb = if permission.granted { "grant" } else { "revoke" };
                    report
                        .log
                        .push(format!("Failed to {verb} {}.", permission.name));
                    report.log.extend(out.lines);
                }
            }
        }

        if self.ctx.settings.restore_ssaid {
            match config.ssaid.as_deref().filter(|s| !s.is_empty()) {
                Some(ssaid) => {
                    report.log.push(format!("Ssaid: {ssaid}"));
                    let out = packages.set_ssaid(pkg, item.user_id, uid, ssaid).await;
                    report.log.extend(out.lines);
                }
                None => report.log.push("Ssaid is empty, skip.".to_string()),
            }
        }
    }

    async fn restore_slice(
        &self,
        item: &PackageItem,
        item_id: &ItemId,
        reporter: &mut SliceReporter<'_>,
        src: &Path,
    ) -> Result<SliceOutcome> {
        match reporter.data_type() {
            DataType::Apk => self.restore_apk(item, item_id, reporter, src).await,
            _ => self.restore_data(item, item_id, reporter, src).await,
        }
    }

    /// Re-queries the package manager; without an installed package the rest of
    /// the item is pointless.
    async fn confirm_installed(&self, item: &PackageItem, outcome: SliceOutcome) -> SliceOutcome {
        let pkg = item.package_name.as_str();
        let installed = match self.ctx.packages.query_installed(pkg, item.user_id).await {
            Ok(installed) => installed,
            Err(e) => {
                warn!(event = "pm.query_failed", package = pkg, error = %e, "pm.query_failed");
                false
            }
        };
        if installed {
            return outcome;
        }

        warn!(
            event = "restore.package_missing",
            package = pkg,
            user_id = item.user_id,
            "restore.package_missing"
        );
        let mut log = outcome.log;
        log.push(format!(
            "Package {pkg} is not installed, aborting the remaining slices."
        ));
        let mut failed = SliceOutcome::failed(outcome.data_type, outcome.bytes, log);
        failed.abort_item = true;
        failed
    }

    async fn restore_apk(
        &self,
        item: &PackageItem,
        item_id: &ItemId,
        reporter: &mut SliceReporter<'_>,
        src: &Path,
    ) -> Result<SliceOutcome> {
        let dt = DataType::Apk;
        if !path_exists(src).await {
            return Ok(SliceOutcome::failed(
                dt,
                0,
                vec![format!("Not exist: {}", src.display())],
            ));
        }

        let bytes = measure(src.to_path_buf()).await?;
        reporter.processing(bytes).await?;

        let params = self.ctx.settings.compression_params(item.compression);
        let mut log = Vec::new();
        let checked = self.ctx.check_archive(src.to_path_buf(), params).await?;
        log.extend(checked.lines);
        if !checked.success {
            return Ok(SliceOutcome::failed(dt, bytes, log));
        }

        let scratch = self.ctx.settings.apk_scratch_dir(item);
        if let Err(e) = recreate_dir(&scratch).await {
            log.push(format!("Failed to prepare {}: {e}", scratch.display()));
            return Ok(SliceOutcome::failed(dt, bytes, log));
        }
        let extracted = self
            .ctx
            .decompress(
                item_id,
                dt,
                src.to_path_buf(),
                scratch.clone(),
                Vec::new(),
                ExtractOptions {
                    clear_destination: false,
                    merge: true,
                },
                params,
            )
            .await?;
        log.extend(extracted.lines);
        if !extracted.success {
            remove_quietly(&scratch).await;
            return Ok(SliceOutcome::failed(dt, bytes, log));
        }

        let installed = match list_apks(&scratch).await {
            Ok(apks) => match apks.as_slice() {
                [] => StepOutput::line(false, format!("{} is empty.", scratch.display())),
                [apk] => self.ctx.packages.install(item.user_id, apk).await,
                _ => self.install_session(item.user_id, &apks).await,
            },
            Err(e) => StepOutput::line(false, format!("Failed to list {}: {e}", scratch.display())),
        };
        log.extend(installed.lines);
        remove_quietly(&scratch).await;

        Ok(if installed.success {
            SliceOutcome::done(dt, bytes, log)
        } else {
            SliceOutcome::failed(dt, bytes, log)
        })
    }

    /// Split APKs go through one install session: create, write each part, commit.
    async fn install_session(&self, user_id: u32, apks: &[PathBuf]) -> StepOutput {
        let session = match self.ctx.packages.create_session(user_id).await {
            Ok(session) => session,
            Err(e) => {
                return StepOutput::failed(vec![
                    "Failed to get install session.".to_string(),
                    e.to_string(),
                ]);
            }
        };

        let mut lines = Vec::new();
        for apk in apks {
            let written = self.ctx.packages.write_session(&session, apk).await;
            lines.extend(written.lines);
            if !written.success {
                return StepOutput::failed(lines);
            }
        }
        let committed = self.ctx.packages.commit_session(&session).await;
        lines.extend(committed.lines);
        StepOutput {
            success: committed.success,
            lines,
        }
    }

    async fn restore_data(
        &self,
        item: &PackageItem,
        item_id: &ItemId,
        reporter: &mut SliceReporter<'_>,
        src: &Path,
    ) -> Result<SliceOutcome> {
        let dt = reporter.data_type();
        let pkg = item.package_name.as_str();
        if !path_exists(src).await {
            let src = src.display();
            return Ok(if dt.is_mandatory() {
                SliceOutcome::failed(dt, 0, vec![format!("Not exist: {src}")])
            } else {
                SliceOutcome::absent(dt, format!("Not exist and skip: {src}"))
            });
        }

        let bytes = measure(src.to_path_buf()).await?;
        reporter.processing(bytes).await?;

        let params = self.ctx.settings.compression_params(item.compression);
        let mut log = Vec::new();
        let checked = self.ctx.check_archive(src.to_path_buf(), params).await?;
        log.extend(checked.lines);
        if !checked.success {
            return Ok(SliceOutcome::failed(dt, bytes, log));
        }

        let root = self.layout_root(item, dt)?;
        let dst = root.join(pkg);
        let captured = self.ctx.capture_context(dst.clone()).await?;
        if let Some(context) = &captured {
            log.push(format!("Original context: {context}"));
        }
        if let Err(e) = tokio::fs::create_dir_all(&root).await {
            log.push(format!("Failed to create {}: {e}", root.display()));
            return Ok(SliceOutcome::failed(dt, bytes, log));
        }

        let extracted = self
            .ctx
            .decompress(
                item_id,
                dt,
                src.to_path_buf(),
                root.clone(),
                dt.exclusions(pkg),
                ExtractOptions {
                    clear_destination: self.ctx.settings.clean_restoring,
                    merge: true,
                },
                params,
            )
            .await?;
        log.extend(extracted.lines);
        if !extracted.success {
            return Ok(SliceOutcome::failed(dt, bytes, log));
        }

        let uid = match self.ctx.packages.uid(pkg, item.user_id).await {
            Ok(Some(uid)) => uid,
            Ok(None) => {
                log.push(format!("Failed to get uid of {pkg}."));
                return Ok(SliceOutcome::failed(dt, bytes, log));
            }
            Err(e) => {
                warn!(event = "pm.uid_failed", package = pkg, error = %e, "pm.uid_failed");
                log.push(format!("Failed to get uid of {pkg}."));
                return Ok(SliceOutcome::failed(dt, bytes, log));
            }
        };
        let gid = if dt.is_shared_storage() {
            match self.ctx.owner(root.clone()).await? {
                Ok((_, gid)) => gid,
                Err(e) => {
                    log.push(format!("Failed to get group of {}: {e}", root.display()));
                    return Ok(SliceOutcome::failed(dt, bytes, log));
                }
            }
        } else {
            uid
        };

        let restored = self
            .ctx
            .restore_context(dst, root, uid, gid, captured)
            .await?;
        log.extend(restored.lines);
        Ok(if restored.success {
            SliceOutcome::done(dt, bytes, log)
        } else {
            SliceOutcome::failed(dt, bytes, log)
        })
    }
}

async fn list_apks(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut apks = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_file() && path.extension().is_some_and(|ext| ext == "apk")
        {
            apks.push(path);
        }
    }
    apks.sort();
    Ok(apks)
}

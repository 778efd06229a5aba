use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::Result;
use crate::engine::EngineContext;
use crate::medium::MediumOrchestrator;
use crate::model::{ItemId, MediumItem, PackageItem};
use crate::packages::{ItemOptions, PackageOrchestrator};
use crate::slice::ItemReport;
use crate::transfer::TransferGateway;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    Backup,
    Restore,
}

impl RunKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Backup => "backup",
            Self::Restore => "restore",
        }
    }
}

#[derive(Clone, Default)]
pub struct RunOptions {
    pub cancel: Option<CancellationToken>,
    pub gateway: Option<TransferGateway>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl RunSummary {
    pub fn tally(items: &[ItemReport]) -> Self {
        let mut summary = Self::default();
        for item in items {
            if item.cancelled {
                summary.cancelled += 1;
            } else if item.succeeded() {
                summary.succeeded += 1;
            } else {
                summary.failed += 1;
            }
        }
        summary
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub kind: RunKind,
    /// In input order.
    pub items: Vec<ItemReport>,
    pub summary: RunSummary,
}

#[derive(Clone)]
enum Target {
    Package(PackageItem),
    Medium(MediumItem),
}

impl Target {
    fn id(&self) -> ItemId {
        match self {
            Self::Package(item) => item.id(),
            Self::Medium(item) => item.id(),
        }
    }
}

/// Runs items through the orchestrators, up to `parallel_items` at a time.
/// Slices of one item always run sequentially inside that item's worker.
#[derive(Clone)]
pub struct Engine {
    ctx: Arc<EngineContext>,
}

impl Engine {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub fn packages(&self) -> PackageOrchestrator {
        PackageOrchestrator::new(self.ctx.clone())
    }

    pub fn media(&self) -> MediumOrchestrator {
        MediumOrchestrator::new(self.ctx.clone())
    }

    pub async fn backup_packages(
        &self,
        run_id: &str,
        items: Vec<PackageItem>,
        options: RunOptions,
    ) -> Result<RunReport> {
        let targets = items.into_iter().map(Target::Package).collect();
        self.run(run_id, RunKind::Backup, targets, options).await
    }

    pub async fn restore_packages(
        &self,
        run_id: &str,
        items: Vec<PackageItem>,
        options: RunOptions,
    ) -> Result<RunReport> {
        let targets = items.into_iter().map(Target::Package).collect();
        self.run(run_id, RunKind::Restore, targets, options).await
    }

    pub async fn backup_media(
        &self,
        run_id: &str,
        items: Vec<MediumItem>,
        options: RunOptions,
    ) -> Result<RunReport> {
        let targets = items.into_iter().map(Target::Medium).collect();
        self.run(run_id, RunKind::Backup, targets, options).await
    }

    pub async fn restore_media(
        &self,
        run_id: &str,
        items: Vec<MediumItem>,
        options: RunOptions,
    ) -> Result<RunReport> {
        let targets = items.into_iter().map(Target::Medium).collect();
        self.run(run_id, RunKind::Restore, targets, options).await
    }

    async fn run(
        &self,
        run_id: &str,
        kind: RunKind,
        targets: Vec<Target>,
        options: RunOptions,
    ) -> Result<RunReport> {
        info!(
            event = "run.start",
            kind = kind.as_str(),
            run_id,
            items = targets.len(),
            parallel_items = self.ctx.settings.parallel_items,
            "run.start"
        );

        let permits = usize::try_from(self.ctx.settings.parallel_items.max(1)).unwrap_or(1);
        let semaphore = Arc::new(Semaphore::new(permits));
        let mut tasks = JoinSet::new();
        for (index, target) in targets.into_iter().enumerate() {
            let engine = self.clone();
            let semaphore = semaphore.clone();
            let options = options.clone();
            let run_id = run_id.to_string();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let report = engine.run_one(&run_id, kind, &target, &options).await;
                (index, report)
            });
        }

        let mut reports = Vec::new();
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let (index, report) = joined?;
            match report {
                Ok(report) => reports.push((index, report)),
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        if let Some(e) = first_error {
            tracing::error!(
                event = "run.failed",
                kind = kind.as_str(),
                run_id,
                error = %e,
                "run.failed"
            );
            return Err(e);
        }
        reports.sort_by_key(|(index, _)| *index);
        let items: Vec<ItemReport> = reports.into_iter().map(|(_, report)| report).collect();
        let summary = RunSummary::tally(&items);

        info!(
            event = "run.finish",
            kind = kind.as_str(),
            run_id,
            succeeded = summary.succeeded,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "run.finish"
        );
        Ok(RunReport {
            run_id: run_id.to_string(),
            kind,
            items,
            summary,
        })
    }

    async fn run_one(
        &self,
        run_id: &str,
        kind: RunKind,
        target: &Target,
        options: &RunOptions,
    ) -> Result<ItemReport> {
        if let Some(cancel) = &options.cancel
            && cancel.is_cancelled()
        {
            let mut report = ItemReport::new(target.id());
            report.cancelled = true;
            return Ok(report);
        }

        let item_options = ItemOptions {
            cancel: options.cancel.as_ref(),
            gateway: options.gateway.as_ref(),
        };
        match (kind, target) {
            (RunKind::Backup, Target::Package(item)) => {
                self.packages().backup(run_id, item, item_options).await
            }
            (RunKind::Restore, Target::Package(item)) => {
                self.packages().restore(run_id, item, item_options).await
            }
            (RunKind::Backup, Target::Medium(item)) => {
                self.media().backup(run_id, item, item_options).await
            }
            (RunKind::Restore, Target::Medium(item)) => {
                self.media().restore(run_id, item, item_options).await
            }
        }
    }
}

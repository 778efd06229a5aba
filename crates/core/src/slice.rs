use serde::Serialize;
use tracing::debug;

use crate::model::{DataType, ItemId, OperationRecord, OperationState, SliceBytes};
use crate::progress::{ProgressSink, TaskProgress};
use crate::record_store::RecordStore;
use crate::{Error, Result};

pub const CODE_OK: i32 = 0;
/// Fatal failure of a slice.
pub const CODE_FAILED: i32 = -1;
/// Optional slice not present; recorded as a skip.
pub const CODE_ABSENT: i32 = -2;

/// Result of one slice function. Persisted by [`SliceReporter::apply`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SliceOutcome {
    pub data_type: DataType,
    pub state: OperationState,
    pub code: i32,
    /// Source size on backup, archive size on restore.
    pub bytes: u64,
    /// Size of the produced archive, for display.
    pub archive_bytes: Option<u64>,
    /// New recorded size for change detection; set only by a verified backup.
    pub record_bytes: Option<u64>,
    pub log: Vec<String>,
    /// Stops the remaining slices of the item.
    pub abort_item: bool,
    /// The local result stands but moving it to or from the remote failed.
    pub transfer_failed: bool,
}

impl SliceOutcome {
    fn new(data_type: DataType, state: OperationState, code: i32, bytes: u64) -> Self {
        Self {
            data_type,
            state,
            code,
            bytes,
            archive_bytes: None,
            record_bytes: None,
            log: Vec::new(),
            abort_item: false,
            transfer_failed: false,
        }
    }

    pub fn unselected(data_type: DataType) -> Self {
        Self::new(data_type, OperationState::Skip, CODE_OK, 0)
    }

    pub fn absent(data_type: DataType, line: impl Into<String>) -> Self {
        let mut outcome = Self::new(data_type, OperationState::Skip, CODE_ABSENT, 0);
        outcome.log.push(line.into());
        outcome
    }

    /// Not attempted because an earlier slice stopped the item.
    pub fn aborted(data_type: DataType, line: impl Into<String>) -> Self {
        let mut outcome = Self::new(data_type, OperationState::Skip, CODE_OK, 0);
        outcome.log.push(line.into());
        outcome
    }

    pub fn unchanged(data_type: DataType, bytes: u64) -> Self {
        let mut outcome = Self::new(data_type, OperationState::Skip, CODE_OK, bytes);
        outcome.log.push("Data has not changed.".to_string());
        outcome
    }

    pub fn failed(data_type: DataType, bytes: u64, log: Vec<String>) -> Self {
        let mut outcome = Self::new(data_type, OperationState::Error, CODE_FAILED, bytes);
        outcome.log = log;
        outcome
    }

    pub fn done(data_type: DataType, bytes: u64, log: Vec<String>) -> Self {
        let mut outcome = Self::new(data_type, OperationState::Done, CODE_OK, bytes);
        outcome.log = log;
        outcome
    }

    pub fn with_record_bytes(mut self, bytes: u64) -> Self {
        self.record_bytes = Some(bytes);
        self
    }

    pub fn with_archive_bytes(mut self, bytes: u64) -> Self {
        self.archive_bytes = Some(bytes);
        self
    }

    pub fn is_error(&self) -> bool {
        self.state == OperationState::Error
    }
}

/// Per-item result: one outcome per processed slice, in processing order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemReport {
    pub item_id: ItemId,
    pub slices: Vec<SliceOutcome>,
    pub cancelled: bool,
    /// Item-level steps outside any slice: force-stop, permissions, SSAID, config.
    pub log: Vec<String>,
}

impl ItemReport {
    pub fn new(item_id: ItemId) -> Self {
        Self {
            item_id,
            slices: Vec::new(),
            cancelled: false,
            log: Vec::new(),
        }
    }

    pub fn slice(&self, data_type: DataType) -> Option<&SliceOutcome> {
        self.slices.iter().find(|s| s.data_type == data_type)
    }

    pub fn succeeded(&self) -> bool {
        !self.cancelled && !self.slices.iter().any(SliceOutcome::is_error)
    }

    /// Copies newly recorded sizes into an item's byte table.
    pub fn apply_recorded(&self, recorded: &mut SliceBytes) {
        for slice in &self.slices {
            if let Some(bytes) = slice.record_bytes {
                recorded.set(slice.data_type, bytes);
            }
        }
    }
}

/// Owns one slice's [`OperationRecord`] for a run and persists every change.
pub struct SliceReporter<'a> {
    store: &'a dyn RecordStore,
    progress: Option<&'a dyn ProgressSink>,
    run_id: &'a str,
    item: &'a ItemId,
    data_type: DataType,
    record: OperationRecord,
}

impl<'a> SliceReporter<'a> {
    pub fn new(
        store: &'a dyn RecordStore,
        progress: Option<&'a dyn ProgressSink>,
        run_id: &'a str,
        item: &'a ItemId,
        data_type: DataType,
    ) -> Self {
        Self {
            store,
            progress,
            run_id,
            item,
            data_type,
            record: OperationRecord::default(),
        }
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn record(&self) -> &OperationRecord {
        &self.record
    }

    /// Persists the initial PENDING record.
    pub async fn begin(&mut self) -> Result<()> {
        self.persist().await
    }

    fn check_transition(&self, next: OperationState) -> Result<()> {
        let current = self.record.state;
        if !current.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: current,
                to: next,
            });
        }
        Ok(())
    }

    pub async fn transition(&mut self, next: OperationState) -> Result<()> {
        self.check_transition(next)?;
        self.record.state = next;
        self.persist().await
    }

    pub async fn processing(&mut self, bytes: u64) -> Result<()> {
        self.check_transition(OperationState::Processing)?;
        self.record.bytes = bytes;
        self.transition(OperationState::Processing).await
    }

    pub async fn set_content(&mut self, content: impl Into<String>) -> Result<()> {
        self.record.content = Some(content.into());
        self.persist().await
    }

    pub fn append_log(&mut self, lines: &[String]) {
        for line in lines {
            if !self.record.log.is_empty() {
                self.record.log.push('\n');
            }
            self.record.log.push_str(line);
        }
    }

    /// Applies a finished outcome: final state, bytes and log, then the recorded
    /// size when the outcome carries one.
    pub async fn apply(&mut self, outcome: &SliceOutcome) -> Result<()> {
        self.check_transition(outcome.state)?;
        self.append_log(&outcome.log);
        self.record.bytes = outcome.bytes;
        self.transition(outcome.state).await?;
        if let Some(bytes) = outcome.record_bytes {
            self.store
                .record_bytes(self.item, self.data_type, bytes)
                .await?;
        }
        Ok(())
    }

    async fn persist(&self) -> Result<()> {
        debug!(
            event = "slice.state",
            run_id = self.run_id,
            item_id = %self.item,
            data_type = self.data_type.as_str(),
            state = self.record.state.as_str(),
            bytes = self.record.bytes,
            "slice.state"
        );
        self.store
            .upsert_operation(self.run_id, self.item, self.data_type, &self.record)
            .await?;
        if let Some(sink) = self.progress {
            sink.on_progress(TaskProgress {
                item_id: self.item.to_string(),
                data_type: Some(self.data_type),
                phase: format!("slice.{}", self.record.state.as_str()),
                bytes_done: None,
                bytes_total: Some(self.record.bytes),
                throughput_bps: None,
            });
        }
        Ok(())
    }
}

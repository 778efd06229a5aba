use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use tokio::sync::Mutex;

use crate::Result;
use crate::model::{DataType, ItemId, OperationRecord, OperationState};

/// Durable per-slice state: the size recorded by the last successful backup
/// and the operation record of every run. Implementations make each call an
/// atomic upsert.
pub trait RecordStore: Send + Sync {
    fn previous_bytes<'a>(
        &'a self,
        item: &'a ItemId,
        data_type: DataType,
    ) -> Pin<Box<dyn Future<Output = Result<Option<u64>>> + Send + 'a>>;

    fn record_bytes<'a>(
        &'a self,
        item: &'a ItemId,
        data_type: DataType,
        bytes: u64,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    fn upsert_operation<'a>(
        &'a self,
        run_id: &'a str,
        item: &'a ItemId,
        data_type: DataType,
        record: &'a OperationRecord,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    fn operation<'a>(
        &'a self,
        run_id: &'a str,
        item: &'a ItemId,
        data_type: DataType,
    ) -> Pin<Box<dyn Future<Output = Result<Option<OperationRecord>>> + Send + 'a>>;
}

type OperationKey = (String, ItemId, DataType);

#[derive(Debug, Default)]
struct InMemoryRecords {
    bytes: HashMap<(ItemId, DataType), u64>,
    operations: HashMap<OperationKey, OperationRecord>,
    history: Vec<(OperationKey, OperationState)>,
}

/// Record store kept in memory; also remembers every persisted state so tests
/// can replay a slice's transitions.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    inner: Mutex<InMemoryRecords>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// States persisted for one slice of one run, oldest first.
    pub async fn states(
        &self,
        run_id: &str,
        item: &ItemId,
        data_type: DataType,
    ) -> Vec<OperationState> {
        let key = (run_id.to_string(), item.clone(), data_type);
        self.inner
            .lock()
            .await
            .history
            .iter()
            .filter(|(k, _)| *k == key)
            .map(|(_, state)| *state)
            .collect()
    }

    pub async fn write_count(&self) -> usize {
        self.inner.lock().await.history.len()
    }
}

impl RecordStore for InMemoryRecordStore {
    fn previous_bytes<'a>(
        &'a self,
        item: &'a ItemId,
        data_type: DataType,
    ) -> Pin<Box<dyn Future<Output = Result<Option<u64>>> + Send + 'a>> {
        Box::pin(async move {
            Ok(self
                .inner
                .lock()
                .await
                .bytes
                .get(&(item.clone(), data_type))
                .copied())
        })
    }

    fn record_bytes<'a>(
        &'a self,
        item: &'a ItemId,
        data_type: DataType,
        bytes: u64,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.inner
                .lock()
                .await
                .bytes
                .insert((item.clone(), data_type), bytes);
            Ok(())
        })
    }

    fn upsert_operation<'a>(
        &'a self,
        run_id: &'a str,
        item: &'a ItemId,
        data_type: DataType,
        record: &'a OperationRecord,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let key = (run_id.to_string(), item.clone(), data_type);
            let mut inner = self.inner.lock().await;
            inner.history.push((key.clone(), record.state));
            inner.operations.insert(key, record.clone());
            Ok(())
        })
    }

    fn operation<'a>(
        &'a self,
        run_id: &'a str,
        item: &'a ItemId,
        data_type: DataType,
    ) -> Pin<Box<dyn Future<Output = Result<Option<OperationRecord>>> + Send + 'a>> {
        Box::pin(async move {
            let key = (run_id.to_string(), item.clone(), data_type);
            Ok(self.inner.lock().await.operations.get(&key).cloned())
        })
    }
}

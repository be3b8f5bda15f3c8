//! In-memory stores for tests and offline runs.
//!
//! Both stores are [`Clone`] handles over shared state, so a test can keep a handle for
//! inspection and failure injection while the benchmark owns a boxed copy. A
//! [`SimulatedProcessor`] attached to the [`InMemoryArtifactStore`] stands in for the downstream
//! pipeline: every accepted upload produces a completion record after a fixed delay.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use crate::common::{
    ArtifactStore, CompletionRecord, CompletionStore, MAX_BATCH_DELETE, StoreError, StoreResult,
};
use crate::key::ArtifactKey;

#[derive(Debug, Default)]
struct ArtifactState {
    objects: HashMap<String, (String, Bytes)>,
    fail_uploads: bool,
}

/// An [`ArtifactStore`] that keeps uploads in a `HashMap`.
#[derive(Debug, Clone, Default)]
pub struct InMemoryArtifactStore {
    state: Arc<Mutex<ArtifactState>>,
    upload_delay: Duration,
    processor: Option<SimulatedProcessor>,
}

impl InMemoryArtifactStore {
    /// Creates an empty store without a processor attached.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every upload by `delay` before it is accepted.
    pub fn with_upload_delay(mut self, delay: Duration) -> Self {
        self.upload_delay = delay;
        self
    }

    /// Hands every accepted upload to `processor`.
    pub fn with_processor(mut self, processor: SimulatedProcessor) -> Self {
        self.processor = Some(processor);
        self
    }

    /// Makes all subsequent uploads fail (or succeed again).
    pub fn fail_uploads(&self, fail: bool) {
        self.state.lock().unwrap().fail_uploads = fail;
    }

    /// Returns the stored body and content type for `key`, if present.
    pub fn get_stored(&self, key: &str) -> Option<(String, Bytes)> {
        self.state.lock().unwrap().objects.get(key).cloned()
    }

    /// Returns the keys of all stored objects.
    pub fn keys(&self) -> Vec<String> {
        self.state.lock().unwrap().objects.keys().cloned().collect()
    }

    /// Returns the number of stored objects.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().objects.len()
    }

    /// Returns `true` if nothing has been uploaded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn put(&self, key: &str, body: Bytes, content_type: &str) -> StoreResult<()> {
        if !self.upload_delay.is_zero() {
            tokio::time::sleep(self.upload_delay).await;
        }

        {
            let mut state = self.state.lock().unwrap();
            if state.fail_uploads {
                return Err(StoreError::Upload {
                    context: format!("memory://{key}"),
                    cause: "upload rejected".into(),
                });
            }
            state
                .objects
                .insert(key.to_owned(), (content_type.to_owned(), body));
        }

        if let Some(processor) = &self.processor {
            processor.accept(key);
        }

        Ok(())
    }
}

#[derive(Debug, Default)]
struct CompletionState {
    records: BTreeMap<String, CompletionRecord>,
    failing_lookups: usize,
    fail_scans: bool,
    fail_deletes: bool,
    lookups: usize,
    delete_batches: Vec<usize>,
}

/// A [`CompletionStore`] that keeps records in an ordered map.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCompletionStore {
    state: Arc<Mutex<CompletionState>>,
    lookup_delay: Duration,
}

impl InMemoryCompletionStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every lookup by `delay`. The record is read once the delay has passed.
    pub fn with_lookup_delay(mut self, delay: Duration) -> Self {
        self.lookup_delay = delay;
        self
    }

    /// Stores or replaces a record.
    pub fn insert(&self, record: CompletionRecord) {
        self.state
            .lock()
            .unwrap()
            .records
            .insert(record.id.clone(), record);
    }

    /// Returns `true` if a record exists for `id`.
    pub fn contains(&self, id: &str) -> bool {
        self.state.lock().unwrap().records.contains_key(id)
    }

    /// Returns the number of stored records.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().records.len()
    }

    /// Returns `true` if no records are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Makes the next `count` lookups fail with a transport error.
    pub fn fail_next_lookups(&self, count: usize) {
        self.state.lock().unwrap().failing_lookups = count;
    }

    /// Makes enumeration of stored ids fail (or succeed again).
    pub fn fail_scans(&self, fail: bool) {
        self.state.lock().unwrap().fail_scans = fail;
    }

    /// Makes batch deletes fail (or succeed again).
    pub fn fail_deletes(&self, fail: bool) {
        self.state.lock().unwrap().fail_deletes = fail;
    }

    /// Returns the number of lookups served so far, failed ones included.
    pub fn lookup_count(&self) -> usize {
        self.state.lock().unwrap().lookups
    }

    /// Returns the size of every batch delete issued so far, in call order.
    pub fn delete_batches(&self) -> Vec<usize> {
        self.state.lock().unwrap().delete_batches.clone()
    }
}

#[async_trait::async_trait]
impl CompletionStore for InMemoryCompletionStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, id: &str) -> StoreResult<Option<CompletionRecord>> {
        if !self.lookup_delay.is_zero() {
            tokio::time::sleep(self.lookup_delay).await;
        }

        let mut state = self.state.lock().unwrap();
        state.lookups += 1;

        if state.failing_lookups > 0 {
            state.failing_lookups -= 1;
            return Err(StoreError::Lookup {
                context: format!("memory[{id}]"),
                cause: "lookup rejected".into(),
            });
        }

        Ok(state.records.get(id).cloned())
    }

    async fn list_ids(&self) -> StoreResult<Vec<String>> {
        let state = self.state.lock().unwrap();
        if state.fail_scans {
            return Err(StoreError::Scan {
                context: "memory".to_owned(),
                cause: "scan rejected".into(),
            });
        }
        Ok(state.records.keys().cloned().collect())
    }

    async fn batch_delete(&self, ids: &[String]) -> StoreResult<()> {
        if ids.len() > MAX_BATCH_DELETE {
            return Err(StoreError::BatchTooLarge { len: ids.len() });
        }

        let mut state = self.state.lock().unwrap();
        if state.fail_deletes {
            return Err(StoreError::Delete {
                context: "memory".to_owned(),
                cause: "delete rejected".into(),
            });
        }

        state.delete_batches.push(ids.len());
        for id in ids {
            state.records.remove(id);
        }
        Ok(())
    }
}

/// Stand-in for the downstream processor.
///
/// For every accepted artifact key, writes a completion record into the attached
/// [`InMemoryCompletionStore`] once `delay` has passed. The reported processing time equals the
/// delay. Keys that do not carry a trial id are ignored.
#[derive(Debug, Clone)]
pub struct SimulatedProcessor {
    completions: InMemoryCompletionStore,
    delay: Duration,
    report_processing_time: bool,
    drop_every: Option<usize>,
    accepted: Arc<AtomicUsize>,
}

impl SimulatedProcessor {
    /// Creates a processor that completes every artifact after `delay`.
    pub fn new(completions: InMemoryCompletionStore, delay: Duration) -> Self {
        Self {
            completions,
            delay,
            report_processing_time: true,
            drop_every: None,
            accepted: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Omits `processing_time_ms` from the written records.
    pub fn without_processing_time(mut self) -> Self {
        self.report_processing_time = false;
        self
    }

    /// Silently drops every `nth` artifact, so no completion record is ever written for it.
    pub fn drop_every(mut self, nth: usize) -> Self {
        self.drop_every = Some(nth.max(1));
        self
    }

    fn accept(&self, key: &str) {
        let Some(id) = ArtifactKey::trial_id(key) else {
            tracing::warn!(key, "simulated processor cannot extract a trial id");
            return;
        };

        let sequence = self.accepted.fetch_add(1, Ordering::Relaxed) + 1;
        if self.drop_every.is_some_and(|nth| sequence % nth == 0) {
            tracing::debug!(id, "simulated processor dropping artifact");
            return;
        }

        let mut record = CompletionRecord::new(id);
        record.status = Some("completed".to_owned());
        if self.report_processing_time {
            record = record.with_processing_time(self.delay.as_secs_f64() * 1000.0);
        }

        let completions = self.completions.clone();
        let delay = self.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            completions.insert(record);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clear_all_chunks_batches() {
        let store = InMemoryCompletionStore::new();
        for i in 0..57 {
            store.insert(CompletionRecord::new(format!("id{i:02}")));
        }

        let deleted = store.clear_all().await.unwrap();

        assert_eq!(deleted, 57);
        assert_eq!(store.delete_batches(), vec![25, 25, 7]);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn clear_all_on_empty_store_issues_no_batches() {
        let store = InMemoryCompletionStore::new();
        assert_eq!(store.clear_all().await.unwrap(), 0);
        assert!(store.delete_batches().is_empty());
    }

    #[tokio::test]
    async fn rejects_oversized_batches() {
        let store = InMemoryCompletionStore::new();
        let ids: Vec<_> = (0..26).map(|i| i.to_string()).collect();

        let result = store.batch_delete(&ids).await;
        assert!(matches!(result, Err(StoreError::BatchTooLarge { len: 26 })));
    }

    #[tokio::test]
    async fn absent_record_is_not_an_error() {
        let store = InMemoryCompletionStore::new();
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn injected_lookup_failures_are_transient() {
        let store = InMemoryCompletionStore::new();
        store.insert(CompletionRecord::new("abc"));
        store.fail_next_lookups(2);

        assert!(store.get("abc").await.is_err());
        assert!(store.get("abc").await.is_err());
        assert!(store.get("abc").await.unwrap().is_some());
        assert_eq!(store.lookup_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn processor_completes_uploads_after_delay() {
        let completions = InMemoryCompletionStore::new();
        let processor = SimulatedProcessor::new(completions.clone(), Duration::from_millis(300));
        let artifacts = InMemoryArtifactStore::new().with_processor(processor);

        let key = ArtifactKey::new("abcd1234", 1);
        artifacts
            .put(key.as_str(), Bytes::from_static(b"{}"), "application/json")
            .await
            .unwrap();

        assert!(!completions.contains("abcd1234"));
        tokio::time::sleep(Duration::from_millis(301)).await;

        let record = completions.get("abcd1234").await.unwrap().unwrap();
        assert_eq!(record.processing_time_ms, Some(300.0));
        assert_eq!(record.status.as_deref(), Some("completed"));
    }

    #[tokio::test(start_paused = true)]
    async fn processor_drops_every_nth_artifact() {
        let completions = InMemoryCompletionStore::new();
        let processor =
            SimulatedProcessor::new(completions.clone(), Duration::from_millis(10)).drop_every(2);
        let artifacts = InMemoryArtifactStore::new().with_processor(processor);

        for id in ["aaaa0001", "aaaa0002", "aaaa0003", "aaaa0004"] {
            let key = ArtifactKey::new(id, 7);
            artifacts.put(key.as_str(), Bytes::new(), "text/plain").await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(artifacts.len(), 4);
        assert!(completions.contains("aaaa0001"));
        assert!(!completions.contains("aaaa0002"));
        assert!(completions.contains("aaaa0003"));
        assert!(!completions.contains("aaaa0004"));
    }

    #[tokio::test(start_paused = true)]
    async fn lookup_delay_reads_state_after_sleeping() {
        let store = InMemoryCompletionStore::new().with_lookup_delay(Duration::from_millis(500));
        let lookup = store.get("late");

        let writer = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            store.insert(CompletionRecord::new("late"));
        };
        let (found, ()) = tokio::join!(lookup, writer);

        assert!(found.unwrap().is_some());
        assert_eq!(store.lookup_count(), 1);
    }

    #[tokio::test]
    async fn failed_upload_is_not_stored() {
        let artifacts = InMemoryArtifactStore::new();
        artifacts.fail_uploads(true);

        let result = artifacts.put("logs/x.json", Bytes::new(), "text/plain").await;

        assert!(matches!(result, Err(StoreError::Upload { .. })));
        assert!(artifacts.is_empty());
    }
}

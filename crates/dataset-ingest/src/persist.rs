// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Batched, strictly ordered metadata persistence.
//!
//! Records accumulate until a batch is full. Each full batch is handed to a
//! background task that first awaits the task of the previous batch, so
//! batches reach the database in enqueue order and never overlap. Once a
//! batch fails, every later batch in the chain is skipped and the error
//! surfaces from [`PersistenceQueue::flush`].

use crate::{Error, ImageRecord, MetadataStore};
use log::{debug, error};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};
use tokio::task::JoinHandle;

#[derive(Default)]
struct QueueState {
    pending: Vec<ImageRecord>,
    tail: Option<JoinHandle<Result<(), Error>>>,
}

pub struct PersistenceQueue {
    db: Arc<dyn MetadataStore>,
    table: String,
    batch_size: usize,
    state: Mutex<QueueState>,
    failed: Arc<AtomicBool>,
    persisted: Arc<AtomicUsize>,
}

impl std::fmt::Debug for PersistenceQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceQueue")
            .field("table", &self.table)
            .field("batch_size", &self.batch_size)
            .field("persisted", &self.persisted())
            .field("failed", &self.has_failed())
            .finish()
    }
}

impl PersistenceQueue {
    pub fn new(db: Arc<dyn MetadataStore>, table: &str, batch_size: usize) -> Self {
        Self {
            db,
            table: table.to_string(),
            batch_size: batch_size.max(1),
            state: Mutex::new(QueueState::default()),
            failed: Arc::new(AtomicBool::new(false)),
            persisted: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether any batch has failed to insert.
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Records confirmed inserted so far.
    pub fn persisted(&self) -> usize {
        self.persisted.load(Ordering::SeqCst)
    }

    /// Records waiting for their batch to fill.
    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    /// Add a record. A full batch is scheduled immediately; this call never
    /// waits for the insert itself. Must be called within a Tokio runtime.
    pub fn enqueue(&self, record: ImageRecord) {
        let mut state = self.lock();
        state.pending.push(record);
        if state.pending.len() >= self.batch_size {
            let batch = std::mem::take(&mut state.pending);
            self.chain(&mut state, batch);
        }
    }

    fn chain(&self, state: &mut QueueState, batch: Vec<ImageRecord>) {
        let previous = state.tail.take();
        let db = self.db.clone();
        let table = self.table.clone();
        let failed = self.failed.clone();
        let persisted = self.persisted.clone();

        debug!("Scheduling batch of {} records", batch.len());
        state.tail = Some(tokio::spawn(insert_after(
            previous, db, table, batch, failed, persisted,
        )));
    }

    /// Submit any partial batch and wait for every scheduled batch.
    ///
    /// Returns the total number of records persisted by this queue.
    pub async fn flush(&self) -> Result<usize, Error> {
        let tail = {
            let mut state = self.lock();
            if !state.pending.is_empty() {
                let batch = std::mem::take(&mut state.pending);
                self.chain(&mut state, batch);
            }
            state.tail.take()
        };

        if let Some(tail) = tail {
            tail.await??;
        }
        Ok(self.persisted())
    }
}

/// Wait for the previous batch, then insert `batch` unless it failed.
async fn insert_after(
    previous: Option<JoinHandle<Result<(), Error>>>,
    db: Arc<dyn MetadataStore>,
    table: String,
    batch: Vec<ImageRecord>,
    failed: Arc<AtomicBool>,
    persisted: Arc<AtomicUsize>,
) -> Result<(), Error> {
    if let Some(previous) = previous {
        previous.await??;
    }
    match db.insert_many(&table, &batch).await {
        Ok(()) => {
            persisted.fetch_add(batch.len(), Ordering::SeqCst);
            debug!("Inserted {} records into {}", batch.len(), table);
            Ok(())
        }
        Err(err) => {
            error!("Insert of {} records into {} failed: {}", batch.len(), table, err);
            failed.store(true, Ordering::SeqCst);
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ProcessingStatus, STEP_IMAGES_TABLE};
    use async_trait::async_trait;
    use std::time::Duration;

    fn record(name: &str) -> ImageRecord {
        ImageRecord {
            step_id: "step".into(),
            image_url: format!("memory://{}", name),
            thumbnail_url: format!("memory://{}", name),
            display_url: format!("memory://{}", name),
            image_name: name.into(),
            file_size: 1,
            image_group: "Training".into(),
            processing_status: ProcessingStatus::Completed,
            no_annotations_needed: false,
            annotations: None,
        }
    }

    /// Inserts slow down for earlier batches and can fail on a given call.
    #[derive(Default)]
    struct Recorder {
        batches: Mutex<Vec<Vec<String>>>,
        calls: AtomicUsize,
        fail_on: Option<usize>,
    }

    impl Recorder {
        fn batches(&self) -> Vec<Vec<String>> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MetadataStore for Recorder {
        async fn insert_many(&self, _table: &str, records: &[ImageRecord]) -> Result<(), Error> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let delay = 100u64.saturating_sub(call as u64 * 30);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            if self.fail_on == Some(call) {
                return Err(Error::Database("insert rejected".into()));
            }
            self.batches
                .lock()
                .unwrap()
                .push(records.iter().map(|r| r.image_name.clone()).collect());
            Ok(())
        }

        async fn update(
            &self,
            _table: &str,
            _id: &str,
            _patch: &serde_json::Value,
        ) -> Result<(), Error> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_arrive_in_enqueue_order() {
        let db = Arc::new(Recorder::default());
        let queue = PersistenceQueue::new(db.clone(), STEP_IMAGES_TABLE, 2);

        for i in 0..7 {
            queue.enqueue(record(&format!("{}.png", i)));
        }
        assert_eq!(queue.pending(), 1);

        assert_eq!(queue.flush().await.unwrap(), 7);
        assert_eq!(
            db.batches(),
            [
                vec!["0.png", "1.png"],
                vec!["2.png", "3.png"],
                vec!["4.png", "5.png"],
                vec!["6.png"],
            ]
        );
        assert!(!queue.has_failed());
    }

    #[tokio::test]
    async fn test_full_batch_is_scheduled_without_flush() {
        let db = Arc::new(crate::MemoryMetadataStore::new());
        let queue = PersistenceQueue::new(db.clone(), STEP_IMAGES_TABLE, 2);

        queue.enqueue(record("a.png"));
        queue.enqueue(record("b.png"));
        queue.enqueue(record("c.png"));

        for _ in 0..100 {
            if db.insert_calls() == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(db.insert_calls(), 1);
        assert_eq!(db.records(STEP_IMAGES_TABLE).len(), 2);

        queue.flush().await.unwrap();
        assert_eq!(db.records(STEP_IMAGES_TABLE).len(), 3);
        assert_eq!(db.insert_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_skips_later_batches() {
        let db = Arc::new(Recorder {
            fail_on: Some(1),
            ..Default::default()
        });
        let queue = PersistenceQueue::new(db.clone(), STEP_IMAGES_TABLE, 1);

        for name in ["a.png", "b.png", "c.png"] {
            queue.enqueue(record(name));
        }
        let result = queue.flush().await;
        assert!(matches!(result, Err(Error::Database(_))));
        assert!(queue.has_failed());
        assert_eq!(db.batches(), [vec!["a.png"]]);
        assert_eq!(db.calls.load(Ordering::SeqCst), 2);
        assert_eq!(queue.persisted(), 1);
    }

    #[tokio::test]
    async fn test_flush_on_empty_queue() {
        let db = Arc::new(crate::MemoryMetadataStore::new());
        let queue = PersistenceQueue::new(db.clone(), STEP_IMAGES_TABLE, 10);
        assert_eq!(queue.flush().await.unwrap(), 0);
        assert_eq!(db.insert_calls(), 0);
    }
}

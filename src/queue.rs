//! Bounded, dedupe-by-key job queue and its single consuming worker.
//!
//! A process-wide lock guards only the dedupe key sets and counters, never
//! held across I/O, and the worker polls with a short timeout so it can
//! observe a stop signal promptly without blocking forever on an empty
//! queue.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};

use crate::catalog::CatalogWriter;
use crate::parsers::text::TextNormalizer;
use crate::parsers::ParserRegistry;
use crate::receiver::ReceiverReader;
use crate::storage::StorageClient;
use crate::sync::SyncEngine;

const POLL_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct QueueJob {
    pub receiver_db: String,
    pub catalog_db: String,
    pub parser_name: String,
    pub batch_size: u32,
    pub max_batches: u32,
    pub run_id: Option<String>,
    pub source: Option<String>,
}

impl QueueJob {
    /// `(trim(receiver_db), trim(catalog_db), lower(parser_name or "fixprice"))`.
    pub fn dedupe_key(&self) -> String {
        let parser = if self.parser_name.trim().is_empty() {
            "fixprice"
        } else {
            self.parser_name.trim()
        };
        format!("{}|{}|{}", self.receiver_db.trim(), self.catalog_db.trim(), parser.to_lowercase())
    }
}

enum QueueMessage {
    Job(QueueJob),
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueResult {
    pub accepted: bool,
    pub duplicate: bool,
    pub reason: &'static str,
    pub queue_size: usize,
    pub key: String,
}

#[derive(Debug, Clone, Default)]
pub struct QueueSnapshot {
    pub running: bool,
    pub queue_size: usize,
    pub pending: usize,
    pub active: usize,
    pub total_enqueued: u64,
    pub total_duplicates: u64,
    pub total_processed: u64,
    pub total_failed: u64,
}

struct QueueState {
    pending: HashSet<String>,
    active: HashSet<String>,
    total_enqueued: u64,
    total_duplicates: u64,
    total_processed: u64,
    total_failed: u64,
    running: bool,
}

pub struct JobQueue {
    state: Mutex<QueueState>,
    sender: mpsc::Sender<QueueMessage>,
    receiver: Mutex<Option<mpsc::Receiver<QueueMessage>>>,
    max_queue_size: usize,
}

impl JobQueue {
    pub fn new(max_queue_size: usize) -> Self {
        let bound = max_queue_size.max(1);
        let (sender, receiver) = mpsc::channel(bound);
        Self {
            state: Mutex::new(QueueState {
                pending: HashSet::new(),
                active: HashSet::new(),
                total_enqueued: 0,
                total_duplicates: 0,
                total_processed: 0,
                total_failed: 0,
                running: true,
            }),
            sender,
            receiver: Mutex::new(Some(receiver)),
            max_queue_size: bound,
        }
    }

    fn queue_size(&self) -> usize {
        self.max_queue_size - self.sender.capacity()
    }

    /// Non-blocking admission. Never performs I/O while holding the lock.
    pub fn enqueue(&self, job: QueueJob) -> EnqueueResult {
        let key = job.dedupe_key();

        {
            let mut state = self.state.lock().unwrap();
            if state.pending.contains(&key) || state.active.contains(&key) {
                state.total_duplicates += 1;
                drop(state);
                crate::metrics::queue::rejected_duplicate();
                return EnqueueResult {
                    accepted: false,
                    duplicate: true,
                    reason: "duplicate",
                    queue_size: self.queue_size(),
                    key,
                };
            }
            state.pending.insert(key.clone());
        }

        match self.sender.try_send(QueueMessage::Job(job)) {
            Ok(()) => {
                let mut state = self.state.lock().unwrap();
                state.total_enqueued += 1;
                drop(state);
                crate::metrics::queue::enqueued();
                let queue_size = self.queue_size();
                crate::metrics::queue::depth(queue_size);
                EnqueueResult { accepted: true, duplicate: false, reason: "accepted", queue_size, key }
            }
            Err(_) => {
                let mut state = self.state.lock().unwrap();
                state.pending.remove(&key);
                drop(state);
                crate::metrics::queue::rejected_full();
                EnqueueResult { accepted: false, duplicate: false, reason: "queue_full", queue_size: self.max_queue_size, key }
            }
        }
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.state.lock().unwrap();
        QueueSnapshot {
            running: state.running,
            queue_size: self.queue_size(),
            pending: state.pending.len(),
            active: state.active.len(),
            total_enqueued: state.total_enqueued,
            total_duplicates: state.total_duplicates,
            total_processed: state.total_processed,
            total_failed: state.total_failed,
        }
    }

    fn mark_active(&self, key: &str) {
        let mut state = self.state.lock().unwrap();
        state.pending.remove(key);
        state.active.insert(key.to_string());
    }

    fn mark_processed(&self, key: &str) {
        let mut state = self.state.lock().unwrap();
        state.active.remove(key);
        state.total_processed += 1;
    }

    fn mark_failed(&self, key: &str) {
        let mut state = self.state.lock().unwrap();
        state.active.remove(key);
        state.total_failed += 1;
    }

    fn mark_stopped(&self) {
        self.state.lock().unwrap().running = false;
    }

    fn take_receiver(&self) -> mpsc::Receiver<QueueMessage> {
        self.receiver.lock().unwrap().take().expect("worker receiver taken exactly once")
    }

    fn push_stop_sentinel(&self) {
        let _ = self.sender.try_send(QueueMessage::Stop);
    }
}

/// Drains `queue` one job at a time, strictly sequentially, independent of
/// the HTTP server's task.
pub struct Worker {
    handle: Option<tokio::task::JoinHandle<()>>,
    stop_notify: Arc<Notify>,
    queue: Arc<JobQueue>,
}

impl Worker {
    pub fn spawn(
        queue: Arc<JobQueue>,
        registry: Arc<ParserRegistry>,
        normalizer: Arc<dyn TextNormalizer>,
        storage: Option<Arc<StorageClient>>,
    ) -> Self {
        let stop_notify = Arc::new(Notify::new());
        let loop_queue = queue.clone();
        let loop_stop_notify = stop_notify.clone();
        let receiver = queue.take_receiver();

        let handle = tokio::spawn(async move {
            Self::run_loop(loop_queue, registry, normalizer, storage, receiver, loop_stop_notify).await;
        });

        Self { handle: Some(handle), stop_notify, queue }
    }

    async fn run_loop(
        queue: Arc<JobQueue>,
        registry: Arc<ParserRegistry>,
        normalizer: Arc<dyn TextNormalizer>,
        storage: Option<Arc<StorageClient>>,
        mut receiver: mpsc::Receiver<QueueMessage>,
        stop_notify: Arc<Notify>,
    ) {
        loop {
            let message = tokio::select! {
                _ = stop_notify.notified() => break,
                polled = tokio::time::timeout(POLL_TIMEOUT, receiver.recv()) => {
                    match polled {
                        Ok(Some(message)) => message,
                        Ok(None) => break,
                        Err(_elapsed) => continue,
                    }
                }
            };

            let job = match message {
                QueueMessage::Stop => break,
                QueueMessage::Job(job) => job,
            };

            let key = job.dedupe_key();
            queue.mark_active(&key);
            let span = tracing::info_span!("sync_job", job_key = %key, parser_name = %job.parser_name);
            let _enter = span.enter();

            match Self::run_job(&job, &registry, normalizer.as_ref(), storage.as_deref()).await {
                Ok(outcome) => {
                    tracing::info!(batches = outcome.batches, records = outcome.records, "job completed");
                    queue.mark_processed(&key);
                    crate::metrics::queue::completed();
                }
                Err(error) => {
                    tracing::error!(error = %error, "job failed");
                    queue.mark_failed(&key);
                    crate::metrics::queue::failed();
                }
            }
        }

        queue.mark_stopped();
    }

    async fn run_job(
        job: &QueueJob,
        registry: &ParserRegistry,
        normalizer: &dyn TextNormalizer,
        storage: Option<&StorageClient>,
    ) -> anyhow::Result<crate::sync::SyncOutcome> {
        let receiver = ReceiverReader::open(&job.receiver_db)?;
        let mut catalog = CatalogWriter::open(&job.catalog_db)?;
        let mut engine = SyncEngine::new(&receiver, &mut catalog, registry, normalizer, storage, job.parser_name.clone());
        engine.run(job.batch_size.max(1), job.max_batches, None).await
    }

    /// Signals shutdown via an event AND a sentinel enqueue, then joins
    /// with `timeout`. In-flight work runs to completion; it is not
    /// cancelled mid-batch.
    pub async fn stop(mut self, timeout: Duration) {
        self.stop_notify.notify_one();
        self.queue.push_stop_sentinel();
        if let Some(handle) = self.handle.take() {
            let _ = tokio::time::timeout(timeout, handle).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(receiver_db: &str, catalog_db: &str, parser: &str) -> QueueJob {
        QueueJob {
            receiver_db: receiver_db.to_string(),
            catalog_db: catalog_db.to_string(),
            parser_name: parser.to_string(),
            batch_size: 250,
            max_batches: 0,
            run_id: None,
            source: None,
        }
    }

    #[test]
    fn dedupe_key_trims_and_lowercases_and_defaults_parser() {
        let a = job(" r.db ", " c.db ", "");
        assert_eq!(a.dedupe_key(), "r.db|c.db|fixprice");
        let b = job("r.db", "c.db", "FixPrice");
        assert_eq!(a.dedupe_key(), b.dedupe_key());
    }

    #[test]
    fn second_enqueue_of_same_key_is_a_duplicate() {
        let queue = JobQueue::new(10);
        let first = queue.enqueue(job("r.db", "c.db", "fixprice"));
        assert!(first.accepted);
        assert!(!first.duplicate);

        let second = queue.enqueue(job("r.db", "c.db", "fixprice"));
        assert!(!second.accepted);
        assert!(second.duplicate);
        assert_eq!(second.reason, "duplicate");

        let snapshot = queue.snapshot();
        assert_eq!(snapshot.pending, 1);
        assert_eq!(snapshot.total_enqueued, 1);
        assert_eq!(snapshot.total_duplicates, 1);
    }

    #[test]
    fn distinct_keys_both_admit() {
        let queue = JobQueue::new(10);
        let a = queue.enqueue(job("r1.db", "c.db", "fixprice"));
        let b = queue.enqueue(job("r2.db", "c.db", "fixprice"));
        assert!(a.accepted && b.accepted);
        assert_eq!(queue.snapshot().pending, 2);
    }

    #[test]
    fn full_queue_rejects_and_releases_pending_key() {
        let queue = JobQueue::new(1);
        let first = queue.enqueue(job("r1.db", "c.db", "fixprice"));
        assert!(first.accepted);

        let second = queue.enqueue(job("r2.db", "c.db", "fixprice"));
        assert!(!second.accepted);
        assert!(!second.duplicate);
        assert_eq!(second.reason, "queue_full");

        // The rejected key must not linger in `pending`.
        let retry = queue.enqueue(job("r2.db", "c.db", "fixprice"));
        assert_eq!(retry.reason, "queue_full");
    }
}

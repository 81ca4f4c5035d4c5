//! Ingestion pipeline: crawl records in, catalog and index updates out.
//!
//! A fixed pool of OS threads pulls [`CrawlRecord`]s from one bounded
//! channel. Blocking on that channel is the only place a worker waits, and
//! the number of waiting workers is what the shard reports as its
//! availability.
//!
//! ## Shutdown
//!
//! Dropping the pipeline closes a dedicated shutdown channel. Each worker
//! notices it before its next dequeue and exits after the record in hand.

mod record;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, Receiver, Sender, TryRecvError};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, trace, warn};

use crate::catalog::Document;
use crate::cluster::Coordinator;
use crate::error::IngestError;
use crate::state::{ShardState, SharedState};

pub use record::{BacklinkRecord, CrawlRecord, PageRecord, BACKLINK_TAG};

/// What applying one record changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Applied {
    /// Documents created (page or placeholders).
    pub documents_created: usize,
    /// Words inserted into the index.
    pub words_indexed: usize,
    /// Backlinks appended.
    pub backlinks_added: usize,
}

/// Apply one record to `state`, allocating ids from `coordinator` as needed.
///
/// An allocation failure aborts the rest of the record; earlier effects stay.
pub fn apply_record(
    state: &ShardState,
    coordinator: &dyn Coordinator,
    record: CrawlRecord,
) -> Result<Applied, IngestError> {
    match record {
        CrawlRecord::Page(page) => apply_page(state, coordinator, page),
        CrawlRecord::Backlinks(links) => apply_backlinks(state, coordinator, links),
    }
}

fn apply_page(
    state: &ShardState,
    coordinator: &dyn Coordinator,
    page: PageRecord,
) -> Result<Applied, IngestError> {
    let mut applied = Applied::default();
    let admission = state.catalog.get_or_insert_with(&page.url, || {
        let id = coordinator.allocate_next_document_id()?;
        Ok(Document::new(
            page.url.as_str(),
            id,
            page.title.clone(),
            page.description.clone(),
        ))
    })?;

    if admission.created {
        applied.documents_created += 1;
    } else {
        state
            .catalog
            .complete(admission.id, &page.title, &page.description);
    }

    for word in page.words.iter().filter(|w| !w.is_empty()) {
        state.index.insert(word, admission.id)?;
        applied.words_indexed += 1;
    }
    Ok(applied)
}

fn apply_backlinks(
    state: &ShardState,
    coordinator: &dyn Coordinator,
    links: BacklinkRecord,
) -> Result<Applied, IngestError> {
    let mut applied = Applied::default();
    let mut admit = |url: &str| {
        let admission = state.catalog.get_or_insert_with(url, || {
            Ok(Document::placeholder(url, coordinator.allocate_next_document_id()?))
        })?;
        applied.documents_created += admission.created as usize;
        Ok::<_, IngestError>(admission.id)
    };

    let father = admit(&links.father_url)?;
    let mut children = Vec::with_capacity(links.child_urls.len());
    for child_url in &links.child_urls {
        children.push(admit(child_url)?);
    }
    for child in children {
        if state.catalog.append_backlink(child, father) {
            applied.backlinks_added += 1;
        }
    }
    Ok(applied)
}

/// Counters kept by the pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    /// Records applied successfully.
    pub processed: u64,
    /// Records that failed.
    pub failed: u64,
    /// Records submitted but not yet finished.
    pub pending: usize,
}

struct WorkerShared {
    state: SharedState,
    coordinator: Arc<dyn Coordinator>,
    worker_count: usize,
    idle: AtomicUsize,
    processed: AtomicU64,
    failed: AtomicU64,
    pending: Mutex<usize>,
    drained: Condvar,
}

impl WorkerShared {
    fn finish_one(&self) {
        let mut pending = self.pending.lock();
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.drained.notify_all();
        }
    }
}

/// A running worker pool.
pub struct IngestionPipeline {
    records: Sender<CrawlRecord>,
    shutdown: Option<Sender<()>>,
    workers: Vec<JoinHandle<()>>,
    shared: Arc<WorkerShared>,
}

impl IngestionPipeline {
    /// Spawn `worker_count` workers reading from a queue of `queue_depth` records.
    pub fn start(
        worker_count: usize,
        queue_depth: usize,
        state: SharedState,
        coordinator: Arc<dyn Coordinator>,
    ) -> Result<Self, IngestError> {
        let worker_count = worker_count.max(1);
        let (records, inbox) = bounded(queue_depth.max(1));
        let (shutdown, stop) = bounded::<()>(0);
        let shared = Arc::new(WorkerShared {
            state,
            coordinator,
            worker_count,
            idle: AtomicUsize::new(0),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            pending: Mutex::new(0),
            drained: Condvar::new(),
        });

        info!("Starting {} ingestion workers", worker_count);
        let mut pipeline = Self {
            records,
            shutdown: Some(shutdown),
            workers: Vec::with_capacity(worker_count),
            shared: Arc::clone(&shared),
        };
        for worker_id in 0..worker_count {
            let inbox = inbox.clone();
            let stop = stop.clone();
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("ingest-{}", worker_id))
                .spawn(move || worker_loop(worker_id, inbox, stop, shared))?;
            pipeline.workers.push(handle);
        }
        Ok(pipeline)
    }

    /// Queue a record, blocking while the queue is full.
    pub fn submit(&self, record: CrawlRecord) -> Result<(), IngestError> {
        *self.shared.pending.lock() += 1;
        if self.records.send(record).is_err() {
            self.shared.finish_one();
            return Err(IngestError::Closed);
        }
        Ok(())
    }

    /// Parse a delimited crawl message and queue it.
    pub fn submit_message(&self, message: &str, delimiter: char) -> Result<(), IngestError> {
        self.submit(CrawlRecord::parse(message, delimiter)?)
    }

    /// Fraction of workers currently waiting for work, in `0.0..=1.0`.
    pub fn availability(&self) -> f64 {
        let idle = self.shared.idle.load(Ordering::Relaxed);
        idle.min(self.shared.worker_count) as f64 / self.shared.worker_count as f64
    }

    /// Number of worker threads.
    pub fn worker_count(&self) -> usize {
        self.shared.worker_count
    }

    /// Block until every submitted record has been handled or `timeout` passes.
    ///
    /// Returns whether the queue drained.
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut pending = self.shared.pending.lock();
        while *pending > 0 {
            if self.shared.drained.wait_until(&mut pending, deadline).timed_out() {
                return *pending == 0;
            }
        }
        true
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> IngestStats {
        IngestStats {
            processed: self.shared.processed.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
            pending: *self.shared.pending.lock(),
        }
    }

    /// Stop the workers and wait for them to exit.
    ///
    /// Records still queued are dropped. The work happens in `Drop`, so
    /// letting the pipeline go out of scope is equivalent.
    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for IngestionPipeline {
    fn drop(&mut self) {
        self.shutdown.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("ingestion worker panicked");
            }
        }
        debug!(stats = ?self.stats(), "ingestion pipeline stopped");
    }
}

fn worker_loop(
    worker_id: usize,
    inbox: Receiver<CrawlRecord>,
    stop: Receiver<()>,
    shared: Arc<WorkerShared>,
) {
    trace!("Worker {} started", worker_id);
    loop {
        if matches!(stop.try_recv(), Err(TryRecvError::Disconnected)) {
            break;
        }

        shared.idle.fetch_add(1, Ordering::Relaxed);
        let next = select! {
            recv(inbox) -> record => record.ok(),
            recv(stop) -> _ => None,
        };
        shared.idle.fetch_sub(1, Ordering::Relaxed);

        let Some(record) = next else {
            break;
        };

        let state = shared.state.load_full();
        match apply_record(&state, shared.coordinator.as_ref(), record) {
            Ok(applied) => {
                shared.processed.fetch_add(1, Ordering::Relaxed);
                trace!(worker_id, ?applied, "record applied");
            }
            Err(e) => {
                shared.failed.fetch_add(1, Ordering::Relaxed);
                warn!(worker_id, error = %e, "record dropped");
            }
        }
        shared.finish_one();
    }
    trace!("Worker {} stopped", worker_id);
}

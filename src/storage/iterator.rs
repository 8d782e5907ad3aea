//! Streaming item iterator fed by a background producer task.
//!
//! The producer downloads multiget batches and appends parsed items to a
//! shared queue; the consumer pops them from `next_item`. End-of-stream and
//! download failure travel as an explicit status next to the queue, a
//! closed channel alone could not distinguish the two.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Duration;

use crate::error::DavResult;
use crate::item::PimItem;

/// Number of hrefs per multiget request issued by the producer.
pub const BATCH_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    /// Producer still running, more items may arrive.
    Running,
    /// All batches delivered.
    End,
    /// Download failed; no further items will arrive.
    Error,
}

struct StreamState {
    queue: VecDeque<PimItem>,
    status: StreamStatus,
}

struct StreamShared {
    state: std::sync::Mutex<StreamState>,
    notify: Notify,
    paused: AtomicBool,
    cancelled: AtomicBool,
}

impl StreamShared {
    fn new(status: StreamStatus) -> Self {
        Self {
            state: std::sync::Mutex::new(StreamState {
                queue: VecDeque::new(),
                status,
            }),
            notify: Notify::new(),
            paused: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        }
    }
}

/// Producer side: fetches one batch of `(uri, etag)` pairs into parsed
/// items.
#[async_trait]
pub trait BatchFetcher: Send + 'static {
    async fn fetch(&mut self, batch: &[crate::carddav::ItemMetadata]) -> DavResult<Vec<PimItem>>;
}

/// Consumer handle of a streaming download.
///
/// Cloning shares the underlying stream; storages keep a clone to forward
/// `suspend`/`resume`/`cancel` while the sync engine consumes items.
#[derive(Clone)]
pub struct ItemStream {
    shared: Arc<StreamShared>,
    total: usize,
}

impl ItemStream {
    /// Spawn the background producer over the given item listing.
    ///
    /// The producer observes `paused` and `cancelled` between batches only;
    /// an in-flight multiget always completes first.
    pub fn spawn(metadata: Vec<crate::carddav::ItemMetadata>, mut fetcher: Box<dyn BatchFetcher>) -> ItemStream {
        let total = metadata.len();
        let shared = Arc::new(StreamShared::new(StreamStatus::Running));

        let producer = Arc::clone(&shared);
        tokio::spawn(async move {
            for batch in metadata.chunks(BATCH_SIZE) {
                while producer.paused.load(Ordering::Acquire)
                    && !producer.cancelled.load(Ordering::Acquire)
                {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                if producer.cancelled.load(Ordering::Acquire) {
                    producer.notify.notify_one();
                    return;
                }

                match fetcher.fetch(batch).await {
                    Ok(items) => {
                        let mut state = producer.state.lock().unwrap();
                        state.queue.extend(items);
                        drop(state);
                        producer.notify.notify_one();
                    }
                    Err(err) => {
                        tracing::warn!("batch download failed: {err}");
                        producer.state.lock().unwrap().status = StreamStatus::Error;
                        producer.notify.notify_one();
                        return;
                    }
                }
            }
            producer.state.lock().unwrap().status = StreamStatus::End;
            producer.notify.notify_one();
        });

        ItemStream { shared, total }
    }

    /// Stream over already-materialized items, used by in-memory stores.
    pub fn from_items(items: Vec<PimItem>) -> ItemStream {
        let total = items.len();
        let shared = Arc::new(StreamShared::new(StreamStatus::End));
        shared.state.lock().unwrap().queue.extend(items);
        ItemStream { shared, total }
    }

    /// Pop the next item, waiting for the producer when the queue is
    /// empty. Returns `None` forever once the stream ended, failed or was
    /// cancelled.
    pub async fn next_item(&self) -> Option<PimItem> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut state = self.shared.state.lock().unwrap();
                if self.shared.cancelled.load(Ordering::Acquire)
                    || state.status == StreamStatus::Error
                {
                    return None;
                }
                if let Some(item) = state.queue.pop_front() {
                    return Some(item);
                }
                if state.status == StreamStatus::End {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Total number of items the producer will deliver.
    pub fn total(&self) -> usize {
        self.total
    }

    pub fn status(&self) -> StreamStatus {
        self.shared.state.lock().unwrap().status
    }

    pub fn is_finished(&self) -> bool {
        self.status() != StreamStatus::Running
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    pub fn suspend(&self) {
        self.shared.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::Release);
    }

    /// Cooperative cancellation: the producer terminates after the
    /// in-flight batch, the consumer wakes up and observes the flag.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::Release);
        self.shared.notify.notify_one();
    }
}

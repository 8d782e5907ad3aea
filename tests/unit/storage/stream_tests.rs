use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use pim_dav_sync::carddav::ItemMetadata;
use pim_dav_sync::error::{DavError, DavResult};
use pim_dav_sync::item::PimItem;
use pim_dav_sync::storage::iterator::BatchFetcher;
use pim_dav_sync::storage::{BATCH_SIZE, ItemStream, StreamStatus};
use tokio::sync::Semaphore;
use tokio::time::{Duration, timeout};

use crate::support::contact;

fn listing(count: usize) -> Vec<ItemMetadata> {
    (0..count)
        .map(|i| ItemMetadata {
            uri: format!("/cards/{i:04}.vcf"),
            etag: format!("\"etag-{i}\""),
        })
        .collect()
}

/// Fetcher that materializes one dummy item per requested href, gated by a
/// semaphore so tests control when each batch may complete.
struct GatedFetcher {
    gate: Arc<Semaphore>,
    calls: Arc<AtomicUsize>,
    fail_on_call: Option<usize>,
}

#[async_trait]
impl BatchFetcher for GatedFetcher {
    async fn fetch(&mut self, batch: &[ItemMetadata]) -> DavResult<Vec<PimItem>> {
        self.gate.acquire().await.expect("gate open").forget();
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on_call == Some(call) {
            return Err(DavError::Network("injected failure".to_string()));
        }
        Ok(batch
            .iter()
            .map(|m| {
                let mut item = contact("Doe", "John", "555");
                item.set_id(m.uri.clone(), false);
                item.set_revision(m.etag.clone());
                item
            })
            .collect())
    }
}

fn fetcher(
    permits: usize,
    fail_on_call: Option<usize>,
) -> (Box<GatedFetcher>, Arc<Semaphore>, Arc<AtomicUsize>) {
    let gate = Arc::new(Semaphore::new(permits));
    let calls = Arc::new(AtomicUsize::new(0));
    (
        Box::new(GatedFetcher {
            gate: Arc::clone(&gate),
            calls: Arc::clone(&calls),
            fail_on_call,
        }),
        gate,
        calls,
    )
}

#[tokio::test]
async fn items_arrive_in_submission_order() {
    let total = BATCH_SIZE + 50;
    let (fetcher, _gate, _calls) = fetcher(Semaphore::MAX_PERMITS, None);
    let stream = ItemStream::spawn(listing(total), fetcher);
    assert_eq!(stream.total(), total);

    for i in 0..total {
        let item = timeout(Duration::from_secs(5), stream.next_item())
            .await
            .expect("no stall")
            .expect("item available");
        assert_eq!(item.id(), format!("/cards/{i:04}.vcf"));
    }
    assert!(stream.next_item().await.is_none());
    assert!(stream.next_item().await.is_none());
    assert_eq!(stream.status(), StreamStatus::End);
}

#[tokio::test]
async fn from_items_ends_after_draining() {
    let stream = ItemStream::from_items(vec![contact("Doe", "John", "1")]);
    assert_eq!(stream.total(), 1);
    assert!(stream.next_item().await.is_some());
    assert!(stream.next_item().await.is_none());
    assert!(stream.next_item().await.is_none());
}

#[tokio::test]
async fn fetch_failure_surfaces_as_error_status() {
    let total = BATCH_SIZE + 10;
    let (fetcher, _gate, _calls) = fetcher(Semaphore::MAX_PERMITS, Some(2));
    let stream = ItemStream::spawn(listing(total), fetcher);

    let mut received = 0usize;
    while timeout(Duration::from_secs(5), stream.next_item())
        .await
        .expect("no stall")
        .is_some()
    {
        received += 1;
    }
    // only the first batch made it through
    assert!(received <= BATCH_SIZE);
    assert_eq!(stream.status(), StreamStatus::Error);
    assert!(stream.next_item().await.is_none());
}

#[tokio::test]
async fn cancellation_stops_the_producer_between_batches() {
    let total = 3 * BATCH_SIZE;
    let (fetcher, gate, calls) = fetcher(0, None);
    let stream = ItemStream::spawn(listing(total), fetcher);

    // let the first multiget complete and take one item
    gate.add_permits(1);
    let first = timeout(Duration::from_secs(5), stream.next_item())
        .await
        .expect("no stall")
        .expect("first item");
    assert_eq!(first.id(), "/cards/0000.vcf");

    stream.cancel();
    assert!(stream.next_item().await.is_none());
    assert!(stream.next_item().await.is_none());

    // even with the gate wide open the producer issues at most the batch
    // that was already in flight
    gate.add_permits(16);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(calls.load(Ordering::SeqCst) <= 2);
    assert!(stream.is_cancelled());
}

#[tokio::test]
async fn suspend_pauses_the_producer_until_resume() {
    let total = 3 * BATCH_SIZE;
    let (fetcher, gate, calls) = fetcher(0, None);
    let stream = ItemStream::spawn(listing(total), fetcher);

    gate.add_permits(1);
    let _ = timeout(Duration::from_secs(5), stream.next_item())
        .await
        .expect("no stall")
        .expect("first item");

    stream.suspend();
    gate.add_permits(16);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(calls.load(Ordering::SeqCst) <= 2);

    stream.resume();
    let mut received = 1usize;
    while timeout(Duration::from_secs(5), stream.next_item())
        .await
        .expect("no stall")
        .is_some()
    {
        received += 1;
    }
    assert_eq!(received, total);
    assert_eq!(stream.status(), StreamStatus::End);
}

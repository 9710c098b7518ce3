//! # Batch Decode Queue
//!
//! The handoff between the change-feed poller and decoding. The poller pushes
//! raw pages, one dedicated `DecodeWorker` drains them in FIFO order, decodes
//! every listing and fans the decoded batch out to the query registry.
//!
//! ## Key Design Principles:
//! - **Explicit backpressure choice**: `QueuePolicy::Bounded(n)` makes the
//!   producer wait for capacity. `QueuePolicy::Unbounded` never blocks the
//!   producer; the `BacklogGuard` is what reports a growing backlog.
//! - **Per-listing isolation**: a listing that fails structural validation (or
//!   makes the decoder panic) is dropped and counted. The rest of its batch is
//!   still delivered.
//! - **Order**: decode and fan-out run inline in the single worker, so the
//!   registry sees batches in the order the feed produced them and last write
//!   wins by feed order.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::monitor::{BacklogGuard, IngestCounters};
use crate::core::registry::{FanOutReport, QueryMatchRegistry};
use crate::decode::{DecodeContext, ListingDecoder};
use crate::error::{contain_panic, IngestError, IngestResult};
use crate::model::feed_page::RawBatch;
use crate::model::listing::Listing;

/// Capacity policy of the decode queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "capacity", rename_all = "camelCase")]
pub enum QueuePolicy {
    /// Producer awaits free capacity once `n` batches are waiting.
    Bounded(usize),
    /// No capacity limit. Growth is only monitored.
    Unbounded,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        QueuePolicy::Bounded(16)
    }
}

enum SenderInner {
    Bounded(mpsc::Sender<RawBatch>),
    Unbounded(mpsc::UnboundedSender<RawBatch>),
}

enum ReceiverInner {
    Bounded(mpsc::Receiver<RawBatch>),
    Unbounded(mpsc::UnboundedReceiver<RawBatch>),
}

/// Producing half of the decode queue.
#[derive(Clone)]
pub struct BatchSender {
    inner: Arc<SenderInner>,
    backlog: Arc<BacklogGuard>,
}

/// Consuming half of the decode queue.
pub struct BatchReceiver {
    inner: ReceiverInner,
    backlog: Arc<BacklogGuard>,
}

/// Creates a decode queue with the given policy. Both halves share `backlog`.
pub fn batch_queue(policy: QueuePolicy, backlog: Arc<BacklogGuard>) -> (BatchSender, BatchReceiver) {
    let (tx, rx) = match policy {
        QueuePolicy::Bounded(capacity) => {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            (SenderInner::Bounded(tx), ReceiverInner::Bounded(rx))
        }
        QueuePolicy::Unbounded => {
            let (tx, rx) = mpsc::unbounded_channel();
            (SenderInner::Unbounded(tx), ReceiverInner::Unbounded(rx))
        }
    };
    (
        BatchSender {
            inner: Arc::new(tx),
            backlog: Arc::clone(&backlog),
        },
        BatchReceiver { inner: rx, backlog },
    )
}

impl BatchSender {
    /// Enqueues a batch. With a bounded policy this waits for capacity.
    pub async fn push(&self, batch: RawBatch) -> IngestResult<()> {
        let count = batch.listing_count() as u64;
        if !self.backlog.increment(count) {
            log::warn!(
                "Decode backlog at {} listing(s), above threshold {} ({:.0}%)",
                self.backlog.pending(),
                self.backlog.threshold(),
                self.backlog.usage_percent()
            );
        }

        let sent = match self.inner.as_ref() {
            SenderInner::Bounded(tx) => tx.send(batch).await.is_ok(),
            SenderInner::Unbounded(tx) => tx.send(batch).is_ok(),
        };
        if !sent {
            self.backlog.decrement(count);
            return Err(IngestError::QueueClosed);
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        match self.inner.as_ref() {
            SenderInner::Bounded(tx) => tx.is_closed(),
            SenderInner::Unbounded(tx) => tx.is_closed(),
        }
    }

    pub fn backlog(&self) -> &BacklogGuard {
        &self.backlog
    }
}

impl BatchReceiver {
    /// Next batch in FIFO order, `None` once every sender is gone and the queue
    /// is drained.
    pub async fn recv(&mut self) -> Option<RawBatch> {
        let batch = match &mut self.inner {
            ReceiverInner::Bounded(rx) => rx.recv().await,
            ReceiverInner::Unbounded(rx) => rx.recv().await,
        }?;
        self.backlog.decrement(batch.listing_count() as u64);
        Some(batch)
    }
}

/// The single consumer of the decode queue.
pub struct DecodeWorker {
    rx: BatchReceiver,
    decoder: Arc<dyn ListingDecoder>,
    registry: Arc<QueryMatchRegistry>,
    counters: Arc<IngestCounters>,
}

impl DecodeWorker {
    pub fn new(
        rx: BatchReceiver,
        decoder: Arc<dyn ListingDecoder>,
        registry: Arc<QueryMatchRegistry>,
        counters: Arc<IngestCounters>,
    ) -> Self {
        Self {
            rx,
            decoder,
            registry,
            counters,
        }
    }

    /// Drains the queue until it closes or `cancel` fires. Cancellation is
    /// checked between queue waits; a batch being processed is finished first.
    pub async fn run(mut self, cancel: CancellationToken) {
        log::info!("Decode worker started");
        loop {
            let batch = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    log::info!("Decode worker cancelled");
                    break;
                }
                next = self.rx.recv() => match next {
                    Some(batch) => batch,
                    None => {
                        log::info!("Decode queue closed");
                        break;
                    }
                },
            };
            self.process(&batch);
        }
        log::info!("Decode worker stopped");
    }

    /// Decodes one batch and fans it out. Returns the fan-out report.
    pub fn process(&self, batch: &RawBatch) -> FanOutReport {
        let (listings, dropped) = decode_batch(self.decoder.as_ref(), batch);

        IngestCounters::add(&self.counters.batches_decoded, 1);
        IngestCounters::add(&self.counters.listings_decoded, listings.len() as u64);
        IngestCounters::add(&self.counters.listings_dropped, dropped as u64);

        log::debug!(
            "Decoded batch {} -> {}: {} listing(s), {} dropped",
            batch.cursor,
            batch.next_cursor,
            listings.len(),
            dropped
        );

        if listings.is_empty() {
            return FanOutReport::default();
        }
        self.registry.ingest(&listings)
    }
}

/// Decodes every item of a batch. Returns the decoded listings and the number
/// of items that were dropped.
pub fn decode_batch(decoder: &dyn ListingDecoder, batch: &RawBatch) -> (Vec<Listing>, usize) {
    let mut listings = Vec::with_capacity(batch.listing_count());
    let mut dropped = 0usize;

    for group in &batch.groups {
        let context = DecodeContext::from_group(group).with_origin(format!("feed@{}", batch.cursor));
        for raw in &group.items {
            match contain_panic(|| decoder.decode(raw, &context), IngestError::Decode) {
                Ok(listing) if !listing.id.is_empty() => listings.push(listing),
                Ok(_) => {
                    dropped += 1;
                    log::debug!("Dropping listing without identity hash in group {}", group.id);
                }
                Err(e) => {
                    dropped += 1;
                    log::debug!("Dropping listing in group {}: {}", group.id, e);
                }
            }
        }
    }
    (listings, dropped)
}

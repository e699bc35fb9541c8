//! Inbound delivery event feed.
//!
//! Provider webhooks publish into a bounded channel; a background consumer
//! batches events and hands them to a `DeliveryEventHandler`, flushing when
//! the batch fills or the flush interval elapses.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use campaign_core::config::FeedConfig;
use campaign_core::{CampaignError, CampaignResult};

use crate::events::DeliveryEvent;

#[async_trait]
pub trait DeliveryEventHandler: Send + Sync {
    async fn handle_batch(&self, events: Vec<DeliveryEvent>);
}

/// Producer side of the feed. Cheap to clone.
#[derive(Clone)]
pub struct DeliveryEventFeed {
    sender: mpsc::Sender<DeliveryEvent>,
}

impl DeliveryEventFeed {
    /// Spawns the batch consumer. It drains whatever is queued and exits when
    /// `shutdown` fires or every sender has been dropped.
    pub fn spawn(
        config: &FeedConfig,
        handler: Arc<dyn DeliveryEventHandler>,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(config.channel_capacity.max(1));
        let consumer = BatchConsumer {
            handler,
            batch_size: config.batch_size.max(1),
            flush_interval: Duration::from_millis(config.flush_interval_ms.max(1)),
        };
        let handle = tokio::spawn(consumer.run(receiver, shutdown));
        info!(
            capacity = config.channel_capacity,
            batch_size = config.batch_size,
            "Delivery event feed started"
        );
        (Self { sender }, handle)
    }

    /// Non-blocking publish. Drops the event when the channel is full.
    pub fn publish(&self, event: DeliveryEvent) -> CampaignResult<()> {
        self.sender.try_send(event).map_err(|e| {
            metrics::counter!("feed.dropped").increment(1);
            warn!("Delivery event dropped: {}", e);
            CampaignError::Internal(anyhow::anyhow!("delivery event feed: {e}"))
        })
    }

    /// Publishes, waiting for channel capacity.
    pub async fn publish_wait(&self, event: DeliveryEvent) -> CampaignResult<()> {
        self.sender
            .send(event)
            .await
            .map_err(|_| CampaignError::Internal(anyhow::anyhow!("delivery event feed closed")))
    }
}

struct BatchConsumer {
    handler: Arc<dyn DeliveryEventHandler>,
    batch_size: usize,
    flush_interval: Duration,
}

impl BatchConsumer {
    async fn run(self, mut receiver: mpsc::Receiver<DeliveryEvent>, shutdown: CancellationToken) {
        let mut buffer: Vec<DeliveryEvent> = Vec::with_capacity(self.batch_size);
        let mut interval = tokio::time::interval(self.flush_interval);

        loop {
            tokio::select! {
                maybe = receiver.recv() => match maybe {
                    Some(event) => {
                        buffer.push(event);
                        if buffer.len() >= self.batch_size {
                            self.flush(&mut buffer).await;
                        }
                    }
                    None => break,
                },
                _ = interval.tick() => {
                    if !buffer.is_empty() {
                        self.flush(&mut buffer).await;
                    }
                }
                _ = shutdown.cancelled() => {
                    receiver.close();
                    while let Some(event) = receiver.recv().await {
                        buffer.push(event);
                    }
                    break;
                }
            }
        }

        if !buffer.is_empty() {
            self.flush(&mut buffer).await;
        }
        info!("Delivery event feed stopped");
    }

    async fn flush(&self, buffer: &mut Vec<DeliveryEvent>) {
        let batch = std::mem::replace(buffer, Vec::with_capacity(self.batch_size));
        debug!(count = batch.len(), "Flushing delivery event batch");
        self.handler.handle_batch(batch).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::DeliveryEventKind;
    use chrono::Utc;
    use parking_lot::Mutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct Collect {
        batches: Mutex<Vec<Vec<DeliveryEvent>>>,
    }

    #[async_trait]
    impl DeliveryEventHandler for Collect {
        async fn handle_batch(&self, events: Vec<DeliveryEvent>) {
            self.batches.lock().push(events);
        }
    }

    fn event() -> DeliveryEvent {
        DeliveryEvent::new(Uuid::new_v4(), Uuid::new_v4(), DeliveryEventKind::Opened, Utc::now())
    }

    fn config(batch_size: usize) -> FeedConfig {
        FeedConfig {
            channel_capacity: 16,
            batch_size,
            flush_interval_ms: 60_000,
        }
    }

    #[tokio::test]
    async fn test_full_batch_is_flushed() {
        let handler = Arc::new(Collect::default());
        let shutdown = CancellationToken::new();
        let (feed, handle) = DeliveryEventFeed::spawn(&config(2), handler.clone(), shutdown.clone());

        feed.publish_wait(event()).await.unwrap();
        feed.publish_wait(event()).await.unwrap();
        feed.publish_wait(event()).await.unwrap();
        drop(feed);
        handle.await.unwrap();

        let batches = handler.batches.lock();
        let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 1]);
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue() {
        let handler = Arc::new(Collect::default());
        let shutdown = CancellationToken::new();
        let (feed, handle) = DeliveryEventFeed::spawn(&config(100), handler.clone(), shutdown.clone());

        for _ in 0..5 {
            feed.publish(event()).unwrap();
        }
        shutdown.cancel();
        handle.await.unwrap();

        let total: usize = handler.batches.lock().iter().map(Vec::len).sum();
        assert_eq!(total, 5);
    }

    #[tokio::test]
    async fn test_publish_after_close_fails() {
        let handler = Arc::new(Collect::default());
        let shutdown = CancellationToken::new();
        let (feed, handle) = DeliveryEventFeed::spawn(&config(10), handler, shutdown.clone());
        shutdown.cancel();
        handle.await.unwrap();
        assert!(feed.publish(event()).is_err());
    }
}

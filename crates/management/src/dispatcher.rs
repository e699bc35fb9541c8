//! Bounded campaign dispatch — fans a roster out to the transport under a
//! shared concurrency limit and records each outcome on the tracker.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use campaign_core::config::DispatchConfig;
use campaign_core::event_bus::{make_event, EventSink};
use campaign_core::types::EngineEventType;
use campaign_core::Clock;
use campaign_delivery::{
    dispatch_with_retry, DeliveryEvent, DeliveryEventKind, DeliveryTracker, DispatchResult,
    OutboundMessage, Recipient, RetryPolicy, Transport,
};

use crate::models::{Campaign, DispatchSummary};

enum Outcome {
    Accepted,
    Failed,
    Skipped,
}

pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    tracker: Arc<DeliveryTracker>,
    clock: Arc<dyn Clock>,
    event_sink: Arc<dyn EventSink>,
    permits: Arc<Semaphore>,
    /// Recipients currently handed to the transport. A resumed pass skips
    /// them while the pass that claimed them is still finishing.
    in_flight: Arc<DashMap<Uuid, ()>>,
    send_timeout: Duration,
    policy: RetryPolicy,
}

impl Dispatcher {
    pub fn new(
        config: &DispatchConfig,
        transport: Arc<dyn Transport>,
        tracker: Arc<DeliveryTracker>,
        clock: Arc<dyn Clock>,
        event_sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            transport,
            tracker,
            clock,
            event_sink,
            permits: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            in_flight: Arc::new(DashMap::new()),
            send_timeout: Duration::from_millis(config.send_timeout_ms),
            policy: RetryPolicy::from_dispatch(config),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn is_in_flight(&self, recipient_id: Uuid) -> bool {
        self.in_flight.contains_key(&recipient_id)
    }

    /// Sends to every recipient in `recipients` that is still pending.
    /// Once `stop` fires no new send starts; sends already handed to the
    /// transport run to completion and are recorded.
    pub async fn dispatch(
        &self,
        campaign: &Campaign,
        recipients: Vec<Recipient>,
        stop: CancellationToken,
    ) -> DispatchSummary {
        let mut summary = DispatchSummary::default();
        let mut tasks: JoinSet<Outcome> = JoinSet::new();

        for recipient in recipients.into_iter().filter(Recipient::is_pending) {
            let permit = tokio::select! {
                biased;
                _ = stop.cancelled() => None,
                permit = self.permits.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                summary.skipped += 1;
                continue;
            };
            if self.in_flight.insert(recipient.id, ()).is_some() {
                summary.skipped += 1;
                continue;
            }
            // The snapshot may be stale by the time the claim is taken.
            let still_pending = self
                .tracker
                .get_recipient(recipient.id)
                .is_some_and(|r| r.is_pending());
            if !still_pending {
                self.in_flight.remove(&recipient.id);
                continue;
            }

            let message = OutboundMessage {
                message_id: recipient.id,
                store_id: campaign.store_id,
                campaign_id: Some(campaign.id),
                to: recipient.address.clone(),
                from_name: campaign.sender.name.clone(),
                from_address: campaign.sender.address.clone(),
                subject: campaign.subject.clone(),
                content_ref: campaign.content_ref.clone(),
                offer_code: None,
            };
            let transport = self.transport.clone();
            let tracker = self.tracker.clone();
            let clock = self.clock.clone();
            let sink = self.event_sink.clone();
            let policy = self.policy.clone();
            let send_timeout = self.send_timeout;
            let stop = stop.clone();
            let in_flight = self.in_flight.clone();

            tasks.spawn(async move {
                let _permit = permit;
                let outcome = if stop.is_cancelled() {
                    Outcome::Skipped
                } else {
                    let result =
                        dispatch_with_retry(transport.as_ref(), &message, send_timeout, &policy)
                            .await;
                    record(&tracker, sink.as_ref(), clock.as_ref(), &message, result)
                };
                in_flight.remove(&message.message_id);
                outcome
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Outcome::Accepted) => summary.accepted += 1,
                Ok(Outcome::Failed) => summary.failed += 1,
                Ok(Outcome::Skipped) => summary.skipped += 1,
                Err(e) => error!(error = %e, "Dispatch task panicked"),
            }
        }

        info!(
            campaign_id = %campaign.id,
            accepted = summary.accepted,
            failed = summary.failed,
            skipped = summary.skipped,
            "Dispatch pass finished"
        );
        summary
    }
}

fn record(
    tracker: &DeliveryTracker,
    sink: &dyn EventSink,
    clock: &dyn Clock,
    message: &OutboundMessage,
    result: DispatchResult,
) -> Outcome {
    let Some(campaign_id) = message.campaign_id else {
        return Outcome::Skipped;
    };
    let now = clock.now();
    match result {
        DispatchResult::Accepted {
            provider_message_id,
            attempts,
        } => {
            tracker.set_provider_message_id(message.message_id, provider_message_id);
            let sent = DeliveryEvent::new(campaign_id, message.message_id, DeliveryEventKind::Sent, now);
            if let Err(e) = tracker.ingest(&sent) {
                warn!(recipient_id = %message.message_id, error = %e, "Failed to record send");
            }
            debug!(recipient_id = %message.message_id, attempts, "Recipient dispatched");
            sink.emit(make_event(
                EngineEventType::RecipientDispatched,
                message.store_id,
                message.message_id,
                None,
            ));
            Outcome::Accepted
        }
        DispatchResult::Failed { reason, attempts } => {
            warn!(
                recipient_id = %message.message_id,
                attempts,
                reason = %reason,
                "Recipient delivery failed"
            );
            if let Err(e) = tracker.mark_failed(message.message_id, reason.clone(), now) {
                warn!(recipient_id = %message.message_id, error = %e, "Failed to record failure");
            }
            sink.emit(make_event(
                EngineEventType::RecipientFailed,
                message.store_id,
                message.message_id,
                Some(reason),
            ));
            Outcome::Failed
        }
    }
}

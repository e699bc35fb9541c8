use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use campaign_analytics::{CampaignReport, StoreOverview};
use campaign_core::config::AppConfig;
use campaign_core::event_bus::EventSink;
use campaign_core::records::record_suppression;
use campaign_core::{CampaignResult, Clock, CustomerId, CustomerStore, StoreId};
use campaign_delivery::{
    DeliveryEvent, DeliveryEventHandler, DeliveryEventKind, DeliveryTracker, IngestOutcome,
    Recipient, Transport,
};
use campaign_management::{
    Campaign, CampaignManager, CreateCampaignRequest, RunDueReport, ScheduleRequest,
    TargetAudience, UpdateCampaignRequest,
};
use campaign_recovery::{
    AbandonedCart, AbandonmentOutcome, AbandonmentRequest, CreateSequenceRequest, Enrollment,
    EnrollmentStatus, RecoveryScheduler, RecoverySequence, RecoveryStats, TickReport,
};
use campaign_segmentation::{
    CreateSegmentRequest, CriteriaGroup, Segment, SegmentationEngine, UpdateSegmentRequest,
};

/// What one scheduler tick did across campaigns and recovery.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineTick {
    pub campaigns: RunDueReport,
    pub recovery: TickReport,
}

/// The outreach engine. Every operation is scoped by store id.
pub struct OutreachEngine {
    config: AppConfig,
    customers: Arc<dyn CustomerStore>,
    segments: Arc<SegmentationEngine>,
    tracker: Arc<DeliveryTracker>,
    campaigns: Arc<CampaignManager>,
    recovery: RecoveryScheduler,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for OutreachEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutreachEngine")
            .field("node_id", &self.config.node_id)
            .field("campaigns", &self.campaigns.campaign_count())
            .field("recovery", &self.recovery)
            .finish()
    }
}

impl OutreachEngine {
    pub fn new(
        config: AppConfig,
        customers: Arc<dyn CustomerStore>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        event_sink: Arc<dyn EventSink>,
    ) -> Self {
        let segments = Arc::new(
            SegmentationEngine::new(customers.clone(), clock.clone())
                .with_event_sink(event_sink.clone())
                .with_query_timeout(Duration::from_millis(config.resolution.timeout_ms)),
        );
        let tracker = Arc::new(DeliveryTracker::new());
        let campaigns = Arc::new(CampaignManager::new(
            &config,
            segments.clone(),
            customers.clone(),
            tracker.clone(),
            transport.clone(),
            clock.clone(),
            event_sink.clone(),
        ));
        let recovery =
            RecoveryScheduler::new(&config, transport, clock.clone()).with_event_sink(event_sink);
        info!(node_id = %config.node_id, "Outreach engine initialized");
        Self {
            config,
            customers,
            segments,
            tracker,
            campaigns,
            recovery,
            clock,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn campaigns(&self) -> &Arc<CampaignManager> {
        &self.campaigns
    }

    pub fn recovery(&self) -> &RecoveryScheduler {
        &self.recovery
    }

    pub fn tracker(&self) -> &Arc<DeliveryTracker> {
        &self.tracker
    }

    pub fn segments(&self) -> &Arc<SegmentationEngine> {
        &self.segments
    }

    // ─── Segments ─────────────────────────────────────────────────────────

    pub async fn create_segment(
        &self,
        store_id: StoreId,
        req: CreateSegmentRequest,
    ) -> CampaignResult<Segment> {
        self.segments.create_segment(store_id, req).await
    }

    pub fn get_segment(&self, store_id: StoreId, id: Uuid) -> CampaignResult<Segment> {
        self.segments.get_segment(store_id, id)
    }

    pub fn list_segments(&self, store_id: StoreId) -> Vec<Segment> {
        self.segments.list_segments(store_id)
    }

    pub async fn update_segment(
        &self,
        store_id: StoreId,
        id: Uuid,
        req: UpdateSegmentRequest,
    ) -> CampaignResult<Segment> {
        self.segments.update_segment(store_id, id, req).await
    }

    pub fn delete_segment(&self, store_id: StoreId, id: Uuid) -> CampaignResult<()> {
        self.segments.delete_segment(store_id, id)
    }

    pub async fn recalculate_segment(&self, store_id: StoreId, id: Uuid) -> CampaignResult<Segment> {
        self.segments.recalculate(store_id, id).await
    }

    pub async fn segment_members(
        &self,
        store_id: StoreId,
        id: Uuid,
    ) -> CampaignResult<BTreeSet<CustomerId>> {
        self.segments.members(store_id, id).await
    }

    /// Ad-hoc criteria preview without saving a segment.
    pub async fn evaluate_criteria(
        &self,
        store_id: StoreId,
        criteria: &CriteriaGroup,
    ) -> CampaignResult<BTreeSet<CustomerId>> {
        self.segments.evaluate(store_id, criteria).await
    }

    // ─── Campaigns ────────────────────────────────────────────────────────

    /// Creates a draft, then sends it or schedules it when the request asks
    /// for that. If the follow-up step fails the draft is discarded and the
    /// error returned.
    pub async fn create_campaign(
        &self,
        store_id: StoreId,
        req: CreateCampaignRequest,
    ) -> CampaignResult<Campaign> {
        let send_immediately = req.send_immediately;
        let scheduled_at = req.scheduled_at;
        let campaign = self.campaigns.create_campaign(store_id, req)?;

        let follow_up = if send_immediately {
            self.campaigns.send_now(store_id, campaign.id).await
        } else if let Some(at) = scheduled_at {
            self.campaigns
                .schedule(store_id, campaign.id, ScheduleRequest::At { at })
                .await
        } else {
            return Ok(campaign);
        };

        match follow_up {
            Ok(campaign) => Ok(campaign),
            Err(e) => {
                warn!(campaign_id = %campaign.id, error = %e, "Discarding draft after failed start");
                if let Err(cleanup) = self.campaigns.delete_campaign(store_id, campaign.id).await {
                    warn!(campaign_id = %campaign.id, error = %cleanup, "Failed to discard draft");
                }
                Err(e)
            }
        }
    }

    pub fn get_campaign(&self, store_id: StoreId, id: Uuid) -> CampaignResult<Campaign> {
        self.campaigns.get_campaign(store_id, id)
    }

    pub fn list_campaigns(&self, store_id: StoreId) -> Vec<Campaign> {
        self.campaigns.list_campaigns(store_id)
    }

    pub async fn update_campaign(
        &self,
        store_id: StoreId,
        id: Uuid,
        req: UpdateCampaignRequest,
    ) -> CampaignResult<Campaign> {
        self.campaigns.update_campaign(store_id, id, req).await
    }

    pub async fn delete_campaign(&self, store_id: StoreId, id: Uuid) -> CampaignResult<()> {
        self.campaigns.delete_campaign(store_id, id).await
    }

    pub async fn estimate_recipients(
        &self,
        store_id: StoreId,
        audience: &TargetAudience,
    ) -> CampaignResult<u64> {
        self.campaigns.estimate_recipients(store_id, audience).await
    }

    pub async fn schedule_campaign(
        &self,
        store_id: StoreId,
        id: Uuid,
        req: ScheduleRequest,
    ) -> CampaignResult<Campaign> {
        self.campaigns.schedule(store_id, id, req).await
    }

    pub async fn send_now(&self, store_id: StoreId, id: Uuid) -> CampaignResult<Campaign> {
        self.campaigns.send_now(store_id, id).await
    }

    pub async fn pause_campaign(&self, store_id: StoreId, id: Uuid) -> CampaignResult<Campaign> {
        self.campaigns.pause(store_id, id).await
    }

    pub async fn resume_campaign(&self, store_id: StoreId, id: Uuid) -> CampaignResult<Campaign> {
        self.campaigns.resume(store_id, id).await
    }

    pub async fn cancel_campaign(&self, store_id: StoreId, id: Uuid) -> CampaignResult<Campaign> {
        self.campaigns.cancel(store_id, id).await
    }

    pub fn recipients(&self, store_id: StoreId, id: Uuid) -> CampaignResult<Vec<Recipient>> {
        self.campaigns.recipients(store_id, id)
    }

    // ─── Delivery events ──────────────────────────────────────────────────

    /// Applies one provider event. An unsubscribe also lands on the store's
    /// suppression list and closes the address's recovery enrollments.
    ///
    /// Both follow-ups are idempotent and run on redelivered unsubscribes
    /// too, so a suppression write that failed is completed by the retry.
    pub async fn ingest_event(
        &self,
        store_id: StoreId,
        event: &DeliveryEvent,
    ) -> CampaignResult<IngestOutcome> {
        let outcome = self.campaigns.apply_event(store_id, event)?;
        if event.kind == DeliveryEventKind::Unsubscribed {
            let address = outcome.recipient.address.clone();
            let closed = self.recovery.unsubscribe_address(store_id, &address);
            record_suppression(
                self.customers.as_ref(),
                store_id,
                &address,
                Duration::from_millis(self.config.resolution.timeout_ms),
            )
            .await?;
            if outcome.duplicate && closed.is_empty() {
                debug!(store_id = %store_id, campaign_id = %event.campaign_id, "Unsubscribe reapplied");
            } else {
                info!(
                    store_id = %store_id,
                    campaign_id = %event.campaign_id,
                    enrollments_closed = closed.len(),
                    "Recorded unsubscribe"
                );
            }
        }
        Ok(outcome)
    }

    // ─── Analytics ────────────────────────────────────────────────────────

    pub fn campaign_report(&self, store_id: StoreId, id: Uuid) -> CampaignResult<CampaignReport> {
        self.campaigns.campaign_report(store_id, id)
    }

    pub fn store_overview(&self, store_id: StoreId) -> StoreOverview {
        self.campaigns.store_overview(store_id)
    }

    // ─── Recovery ─────────────────────────────────────────────────────────

    pub fn create_sequence(
        &self,
        store_id: StoreId,
        req: CreateSequenceRequest,
    ) -> CampaignResult<RecoverySequence> {
        self.recovery.create_sequence(store_id, req)
    }

    pub fn activate_sequence(&self, store_id: StoreId, id: Uuid) -> CampaignResult<RecoverySequence> {
        self.recovery.activate_sequence(store_id, id)
    }

    pub fn deactivate_sequence(
        &self,
        store_id: StoreId,
        id: Uuid,
    ) -> CampaignResult<RecoverySequence> {
        self.recovery.deactivate_sequence(store_id, id)
    }

    pub fn get_sequence(&self, store_id: StoreId, id: Uuid) -> CampaignResult<RecoverySequence> {
        self.recovery.get_sequence(store_id, id)
    }

    pub fn list_sequences(&self, store_id: StoreId) -> Vec<RecoverySequence> {
        self.recovery.list_sequences(store_id)
    }

    pub fn delete_sequence(&self, store_id: StoreId, id: Uuid) -> CampaignResult<()> {
        self.recovery.delete_sequence(store_id, id)
    }

    pub fn record_abandonment(
        &self,
        store_id: StoreId,
        req: AbandonmentRequest,
    ) -> CampaignResult<AbandonmentOutcome> {
        self.recovery.record_abandonment(store_id, req)
    }

    pub fn mark_order_completed(
        &self,
        store_id: StoreId,
        address: &str,
        at: DateTime<Utc>,
    ) -> Vec<AbandonedCart> {
        self.recovery.mark_order_completed(store_id, address, at)
    }

    pub fn pause_enrollment(&self, store_id: StoreId, id: Uuid) -> CampaignResult<Enrollment> {
        self.recovery.pause(store_id, id)
    }

    pub fn resume_enrollment(&self, store_id: StoreId, id: Uuid) -> CampaignResult<Enrollment> {
        self.recovery.resume(store_id, id)
    }

    /// Closes the enrollment and suppresses the address for the store.
    pub async fn unsubscribe_enrollment(
        &self,
        store_id: StoreId,
        id: Uuid,
    ) -> CampaignResult<Enrollment> {
        let enrollment = self.recovery.unsubscribe(store_id, id)?;
        record_suppression(
            self.customers.as_ref(),
            store_id,
            &enrollment.customer_address,
            Duration::from_millis(self.config.resolution.timeout_ms),
        )
        .await?;
        Ok(enrollment)
    }

    pub fn restart_enrollment(&self, store_id: StoreId, id: Uuid) -> CampaignResult<Enrollment> {
        self.recovery.restart(store_id, id)
    }

    pub async fn dispatch_enrollment_now(
        &self,
        store_id: StoreId,
        id: Uuid,
    ) -> CampaignResult<Enrollment> {
        self.recovery.dispatch_now(store_id, id).await
    }

    pub fn get_enrollment(&self, store_id: StoreId, id: Uuid) -> CampaignResult<Enrollment> {
        self.recovery.get_enrollment(store_id, id)
    }

    pub fn list_enrollments(
        &self,
        store_id: StoreId,
        status: Option<EnrollmentStatus>,
    ) -> Vec<Enrollment> {
        self.recovery.list_enrollments(store_id, status)
    }

    pub fn get_cart(&self, store_id: StoreId, id: Uuid) -> CampaignResult<AbandonedCart> {
        self.recovery.get_cart(store_id, id)
    }

    pub fn list_carts(&self, store_id: StoreId) -> Vec<AbandonedCart> {
        self.recovery.list_carts(store_id)
    }

    pub fn recovery_stats(&self, store_id: StoreId) -> RecoveryStats {
        self.recovery.stats(store_id)
    }

    // ─── Scheduling ───────────────────────────────────────────────────────

    /// Starts due campaigns and advances due recovery steps.
    pub async fn tick(&self, now: DateTime<Utc>) -> EngineTick {
        let campaigns = self.campaigns.run_due(now).await;
        let recovery = self.recovery.tick(now).await;
        EngineTick {
            campaigns,
            recovery,
        }
    }

    /// `tick` at the engine clock's current time.
    pub async fn tick_now(&self) -> EngineTick {
        self.tick(self.clock.now()).await
    }
}

#[async_trait]
impl DeliveryEventHandler for OutreachEngine {
    async fn handle_batch(&self, events: Vec<DeliveryEvent>) {
        let total = events.len();
        let mut applied = 0usize;
        for event in events {
            let Some(store_id) = self.campaigns.store_of(event.campaign_id) else {
                warn!(
                    campaign_id = %event.campaign_id,
                    recipient_id = %event.recipient_id,
                    "Delivery event for unknown campaign"
                );
                continue;
            };
            match self.ingest_event(store_id, &event).await {
                Ok(_) => applied += 1,
                Err(e) => warn!(
                    campaign_id = %event.campaign_id,
                    recipient_id = %event.recipient_id,
                    kind = event.kind.as_str(),
                    error = %e,
                    "Failed to apply delivery event"
                ),
            }
        }
        debug!(total, applied, "Applied delivery event batch");
    }
}

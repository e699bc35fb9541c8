//! Campaign lifecycle manager — CRUD, scheduling, roster freeze, dispatch
//! and reporting for store-scoped campaigns.
//!
//! Every status change runs under the campaign's async mutex, so two
//! scheduler ticks can never both start the same campaign. Counters are
//! only ever written from the delivery tracker's fold.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use campaign_analytics::{CampaignReport, CampaignSnapshot, StoreOverview};
use campaign_core::clock::{parse_timezone, resolve_local_time};
use campaign_core::config::SchedulerConfig;
use campaign_core::event_bus::{make_event, noop_sink, EventSink};
use campaign_core::types::EngineEventType;
use campaign_core::{
    AppConfig, CampaignError, CampaignResult, Clock, CustomerStore, DeliveryCounters, StoreId,
};
use campaign_delivery::{
    DeliveryEvent, DeliveryTracker, IngestOutcome, Recipient, RecipientSeed, RetryPolicy,
    Transport,
};
use campaign_segmentation::SegmentationEngine;

use crate::dispatcher::Dispatcher;
use crate::lifecycle::{check_transition, CampaignTrigger};
use crate::models::*;
use crate::resolver::RecipientResolver;
use crate::store::CampaignStore;

pub const CANCELLED_REASON: &str = "campaign cancelled";

/// A running dispatch pass. The id tells a finished pass apart from a
/// newer one registered for the same campaign after a pause and resume.
#[derive(Clone)]
struct ActivePass {
    pass_id: Uuid,
    stop: CancellationToken,
}

impl ActivePass {
    fn new() -> Self {
        Self {
            pass_id: Uuid::new_v4(),
            stop: CancellationToken::new(),
        }
    }
}

/// Outcome of trying to start one due scheduled campaign.
enum DueStart {
    Started(ActivePass),
    Retrying,
    Paused,
    NotDue,
}

pub struct CampaignManager {
    store: CampaignStore,
    segments: Arc<SegmentationEngine>,
    resolver: RecipientResolver,
    tracker: Arc<DeliveryTracker>,
    dispatcher: Dispatcher,
    clock: Arc<dyn Clock>,
    event_sink: Arc<dyn EventSink>,
    /// Campaigns with a dispatch pass running.
    active: DashMap<Uuid, ActivePass>,
    scheduler: SchedulerConfig,
    resolution_policy: RetryPolicy,
    overview_window_days: u32,
}

impl CampaignManager {
    pub fn new(
        config: &AppConfig,
        segments: Arc<SegmentationEngine>,
        customers: Arc<dyn CustomerStore>,
        tracker: Arc<DeliveryTracker>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        event_sink: Arc<dyn EventSink>,
    ) -> Self {
        let resolver = RecipientResolver::new(
            segments.clone(),
            customers,
            clock.clone(),
            Duration::from_millis(config.resolution.timeout_ms),
        );
        let dispatcher = Dispatcher::new(
            &config.dispatch,
            transport,
            tracker.clone(),
            clock.clone(),
            event_sink.clone(),
        );
        info!(
            max_concurrency = config.dispatch.max_concurrency,
            shard = config.scheduler.shard_index,
            shards = config.scheduler.shard_count,
            "Campaign manager initialized"
        );
        Self {
            store: CampaignStore::new(),
            segments,
            resolver,
            tracker,
            dispatcher,
            clock,
            event_sink,
            active: DashMap::new(),
            scheduler: config.scheduler.clone(),
            resolution_policy: RetryPolicy::from_resolution(&config.resolution),
            overview_window_days: config.analytics.overview_window_days,
        }
    }

    /// Manager with default config and no event sink.
    pub fn with_defaults(
        segments: Arc<SegmentationEngine>,
        customers: Arc<dyn CustomerStore>,
        tracker: Arc<DeliveryTracker>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::new(
            &AppConfig::default(),
            segments,
            customers,
            tracker,
            transport,
            clock,
            noop_sink(),
        )
    }

    pub fn with_dispatch_policy(mut self, policy: RetryPolicy) -> Self {
        self.dispatcher = self.dispatcher.with_policy(policy);
        self
    }

    // ─── CRUD ──────────────────────────────────────────────────────────────

    pub fn create_campaign(
        &self,
        store_id: StoreId,
        req: CreateCampaignRequest,
    ) -> CampaignResult<Campaign> {
        self.validate_content(&req.name, &req.subject, &req.content_ref, &req.sender)?;
        self.validate_audience(store_id, &req.audience)?;
        let timezone = req.timezone.unwrap_or_else(|| "UTC".to_string());
        parse_timezone(&timezone)?;
        if req.send_immediately && req.scheduled_at.is_some() {
            return Err(CampaignError::validation(
                "a campaign cannot both send immediately and be scheduled",
            ));
        }

        let now = self.clock.now();
        let campaign = Campaign {
            id: Uuid::new_v4(),
            store_id,
            name: req.name,
            subject: req.subject,
            content_ref: req.content_ref,
            sender: req.sender,
            audience: req.audience,
            status: CampaignStatus::Draft,
            send_immediately: req.send_immediately,
            scheduled_at: req.scheduled_at,
            timezone,
            estimated_recipients: 0,
            counters: DeliveryCounters::default(),
            status_reason: None,
            resolution_attempts: 0,
            next_resolution_at: None,
            created_at: now,
            updated_at: now,
            sent_at: None,
        };
        self.store.insert(campaign.clone());
        info!(
            campaign_id = %campaign.id,
            store_id = %store_id,
            name = %campaign.name,
            "Created campaign"
        );
        self.event_sink.emit(make_event(
            EngineEventType::CampaignCreated,
            store_id,
            campaign.id,
            None,
        ));
        Ok(campaign)
    }

    pub fn get_campaign(&self, store_id: StoreId, id: Uuid) -> CampaignResult<Campaign> {
        self.store.get(store_id, id)
    }

    /// Newest first.
    pub fn list_campaigns(&self, store_id: StoreId) -> Vec<Campaign> {
        self.store.list(store_id)
    }

    /// Edits a draft. Any other status is refused.
    pub async fn update_campaign(
        &self,
        store_id: StoreId,
        id: Uuid,
        req: UpdateCampaignRequest,
    ) -> CampaignResult<Campaign> {
        let lock = self.store.lock_for(id);
        let _guard = lock.lock().await;

        let current = self.store.get(store_id, id)?;
        if current.status != CampaignStatus::Draft {
            return Err(CampaignError::invalid_transition("campaign", current.status, "update"));
        }
        self.validate_content(
            req.name.as_deref().unwrap_or(&current.name),
            req.subject.as_deref().unwrap_or(&current.subject),
            req.content_ref.as_deref().unwrap_or(&current.content_ref),
            req.sender.as_ref().unwrap_or(&current.sender),
        )?;
        if let Some(audience) = &req.audience {
            self.validate_audience(store_id, audience)?;
        }
        if let Some(timezone) = &req.timezone {
            parse_timezone(timezone)?;
        }

        let now = self.clock.now();
        let campaign = self.store.update(store_id, id, |c| {
            if let Some(name) = req.name {
                c.name = name;
            }
            if let Some(subject) = req.subject {
                c.subject = subject;
            }
            if let Some(content_ref) = req.content_ref {
                c.content_ref = content_ref;
            }
            if let Some(sender) = req.sender {
                c.sender = sender;
            }
            if let Some(audience) = req.audience {
                c.audience = audience;
            }
            if let Some(timezone) = req.timezone {
                c.timezone = timezone;
            }
            c.updated_at = now;
            Ok(())
        })?;
        info!(campaign_id = %id, "Updated campaign");
        Ok(campaign)
    }

    /// Deletes a campaign and its recipients. Refused while sending.
    pub async fn delete_campaign(&self, store_id: StoreId, id: Uuid) -> CampaignResult<()> {
        let lock = self.store.lock_for(id);
        let _guard = lock.lock().await;

        let campaign = self.store.get(store_id, id)?;
        if campaign.status == CampaignStatus::Sending {
            return Err(CampaignError::invalid_transition("campaign", campaign.status, "delete"));
        }
        self.store.remove(store_id, id)?;
        if let Some((_, pass)) = self.active.remove(&id) {
            pass.stop.cancel();
        }
        let removed = self.tracker.remove_campaign(id);
        info!(campaign_id = %id, recipients = removed, "Deleted campaign");
        self.event_sink.emit(make_event(
            EngineEventType::CampaignDeleted,
            store_id,
            id,
            None,
        ));
        Ok(())
    }

    pub async fn estimate_recipients(
        &self,
        store_id: StoreId,
        audience: &TargetAudience,
    ) -> CampaignResult<u64> {
        self.validate_audience(store_id, audience)?;
        self.resolver.estimate(store_id, audience).await
    }

    // ─── Lifecycle ─────────────────────────────────────────────────────────

    /// Moves a draft to `scheduled`. The time must be in the future and the
    /// audience must currently resolve to at least one recipient.
    pub async fn schedule(
        &self,
        store_id: StoreId,
        id: Uuid,
        req: ScheduleRequest,
    ) -> CampaignResult<Campaign> {
        let lock = self.store.lock_for(id);
        let _guard = lock.lock().await;

        let campaign = self.store.get(store_id, id)?;
        check_transition(campaign.status, CampaignTrigger::Schedule)?;

        let (scheduled_at, timezone) = match req {
            ScheduleRequest::At { at } => (at, campaign.timezone.clone()),
            ScheduleRequest::Local { at, timezone } => {
                let timezone = timezone.unwrap_or_else(|| campaign.timezone.clone());
                (resolve_local_time(at, &timezone)?, timezone)
            }
        };
        if scheduled_at <= self.clock.now() {
            return Err(CampaignError::validation(format!(
                "scheduled time {scheduled_at} is not in the future"
            )));
        }
        let estimate = self.resolver.estimate(store_id, &campaign.audience).await?;
        if estimate == 0 {
            return Err(CampaignError::validation("audience resolves to no recipients"));
        }

        self.transition(store_id, id, CampaignTrigger::Schedule, None, |c| {
            c.scheduled_at = Some(scheduled_at);
            c.timezone = timezone;
            c.estimated_recipients = estimate;
            c.resolution_attempts = 0;
            c.next_resolution_at = None;
        })
    }

    /// Freezes the roster and dispatches now. Returns once the dispatch pass
    /// has finished or was stopped.
    pub async fn send_now(&self, store_id: StoreId, id: Uuid) -> CampaignResult<Campaign> {
        let pass = {
            let lock = self.store.lock_for(id);
            let _guard = lock.lock().await;

            let campaign = self.store.get(store_id, id)?;
            check_transition(campaign.status, CampaignTrigger::SendNow)?;
            let seeds = self.resolver.resolve(store_id, &campaign.audience).await?;
            if seeds.is_empty() {
                return Err(CampaignError::validation("audience resolves to no recipients"));
            }
            self.freeze_roster(&campaign, seeds)?;
            self.start_sending(store_id, id, CampaignTrigger::SendNow)?
        };
        self.run_dispatch(store_id, id, pass).await
    }

    /// Stops further dispatch. Recipients already handed to the transport
    /// are not rolled back.
    pub async fn pause(&self, store_id: StoreId, id: Uuid) -> CampaignResult<Campaign> {
        let lock = self.store.lock_for(id);
        let _guard = lock.lock().await;

        let campaign = self.transition(store_id, id, CampaignTrigger::Pause, None, |_| {})?;
        if let Some((_, pass)) = self.active.remove(&id) {
            pass.stop.cancel();
        }
        Ok(campaign)
    }

    /// Resumes a paused campaign, dispatching only still-pending recipients.
    /// A campaign paused before its roster existed freezes it now.
    pub async fn resume(&self, store_id: StoreId, id: Uuid) -> CampaignResult<Campaign> {
        let pass = {
            let lock = self.store.lock_for(id);
            let _guard = lock.lock().await;

            let campaign = self.store.get(store_id, id)?;
            check_transition(campaign.status, CampaignTrigger::Resume)?;
            if !self.tracker.has_roster(id) {
                let seeds = self.resolver.resolve(store_id, &campaign.audience).await?;
                if seeds.is_empty() {
                    return Err(CampaignError::validation("audience resolves to no recipients"));
                }
                self.freeze_roster(&campaign, seeds)?;
            }
            self.start_sending(store_id, id, CampaignTrigger::Resume)?
        };
        self.run_dispatch(store_id, id, pass).await
    }

    /// Cancels the campaign. Recipients not yet dispatched are marked failed.
    pub async fn cancel(&self, store_id: StoreId, id: Uuid) -> CampaignResult<Campaign> {
        let lock = self.store.lock_for(id);
        let _guard = lock.lock().await;

        self.transition(
            store_id,
            id,
            CampaignTrigger::Cancel,
            Some(CANCELLED_REASON.to_string()),
            |_| {},
        )?;
        if let Some((_, pass)) = self.active.remove(&id) {
            pass.stop.cancel();
        }
        let now = self.clock.now();
        let mut failed = 0usize;
        for recipient in self.tracker.pending(id) {
            if self.dispatcher.is_in_flight(recipient.id) {
                continue;
            }
            if self.tracker.mark_failed(recipient.id, CANCELLED_REASON, now).is_ok() {
                failed += 1;
            }
        }
        debug!(campaign_id = %id, failed, "Marked undispatched recipients failed");
        self.refresh_counters(store_id, id)
    }

    // ─── Scheduler ─────────────────────────────────────────────────────────

    /// One scheduler tick: starts due scheduled campaigns owned by this
    /// shard and finishes or re-dispatches `sending` campaigns whose dispatch
    /// pass is no longer running.
    pub async fn run_due(&self, now: DateTime<Utc>) -> RunDueReport {
        let mut report = RunDueReport::default();

        for campaign in self.store.with_status(CampaignStatus::Scheduled) {
            if !self.scheduler.owns(&campaign.id) || !is_due(&campaign, now) {
                continue;
            }
            match self.start_due(campaign.store_id, campaign.id, now).await {
                Ok(DueStart::Started(pass)) => {
                    report.started.push(campaign.id);
                    match self.run_dispatch(campaign.store_id, campaign.id, pass).await {
                        Ok(c) if c.status == CampaignStatus::Sent => report.completed.push(c.id),
                        Ok(_) => {}
                        Err(e) => warn!(campaign_id = %campaign.id, error = %e, "Dispatch failed"),
                    }
                }
                Ok(DueStart::Retrying) => report.retrying.push(campaign.id),
                Ok(DueStart::Paused) => report.paused.push(campaign.id),
                Ok(DueStart::NotDue) => {}
                Err(e) => warn!(campaign_id = %campaign.id, error = %e, "Failed to start campaign"),
            }
        }

        for campaign in self.store.with_status(CampaignStatus::Sending) {
            if !self.scheduler.owns(&campaign.id) {
                continue;
            }
            let pass = match self.active.entry(campaign.id) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(slot) => slot.insert(ActivePass::new()).clone(),
            };
            match self.run_dispatch(campaign.store_id, campaign.id, pass).await {
                Ok(c) if c.status == CampaignStatus::Sent => report.completed.push(c.id),
                Ok(_) => {}
                Err(e) => warn!(campaign_id = %campaign.id, error = %e, "Dispatch failed"),
            }
        }

        if !report.is_empty() {
            info!(
                started = report.started.len(),
                retrying = report.retrying.len(),
                paused = report.paused.len(),
                completed = report.completed.len(),
                "Campaign scheduler tick"
            );
        }
        report
    }

    async fn start_due(
        &self,
        store_id: StoreId,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> CampaignResult<DueStart> {
        let lock = self.store.lock_for(id);
        let _guard = lock.lock().await;

        let campaign = self.store.get(store_id, id)?;
        if campaign.status != CampaignStatus::Scheduled || !is_due(&campaign, now) {
            return Ok(DueStart::NotDue);
        }

        let seeds = match self.resolver.resolve(store_id, &campaign.audience).await {
            Ok(seeds) => seeds,
            Err(e) => {
                let attempts = campaign.resolution_attempts + 1;
                if self.resolution_policy.should_retry(attempts) {
                    let delay = self.resolution_policy.delay_for(attempts);
                    let retry_at = now
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::seconds(60));
                    warn!(
                        campaign_id = %id,
                        attempt = attempts,
                        retry_at = %retry_at,
                        error = %e,
                        "Recipient resolution failed, will retry"
                    );
                    self.store.update(store_id, id, |c| {
                        c.resolution_attempts = attempts;
                        c.next_resolution_at = Some(retry_at);
                        c.status_reason = Some(e.to_string());
                        c.updated_at = now;
                        Ok(())
                    })?;
                    return Ok(DueStart::Retrying);
                }
                self.transition(
                    store_id,
                    id,
                    CampaignTrigger::ResolutionExhausted,
                    Some(format!("resolution_exhausted: {e}")),
                    |c| {
                        c.resolution_attempts = attempts;
                        c.next_resolution_at = None;
                    },
                )?;
                return Ok(DueStart::Paused);
            }
        };

        if seeds.is_empty() {
            self.transition(
                store_id,
                id,
                CampaignTrigger::NoRecipients,
                Some("no_recipients".to_string()),
                |_| {},
            )?;
            return Ok(DueStart::Paused);
        }

        self.freeze_roster(&campaign, seeds)?;
        Ok(DueStart::Started(self.start_sending(
            store_id,
            id,
            CampaignTrigger::ScheduleDue,
        )?))
    }

    // ─── Delivery & reporting ──────────────────────────────────────────────

    pub fn recipients(&self, store_id: StoreId, id: Uuid) -> CampaignResult<Vec<Recipient>> {
        self.store.get(store_id, id)?;
        Ok(self.tracker.recipients(id))
    }

    /// Ingests a delivery event for one of the store's campaigns and refreshes
    /// the campaign counters.
    pub fn apply_event(&self, store_id: StoreId, event: &DeliveryEvent) -> CampaignResult<IngestOutcome> {
        self.store.get(store_id, event.campaign_id)?;
        let outcome = self.tracker.ingest(event)?;
        self.refresh_counters(store_id, event.campaign_id)?;
        if !outcome.duplicate {
            self.event_sink.emit(make_event(
                EngineEventType::DeliveryEventIngested,
                store_id,
                event.recipient_id,
                Some(event.kind.as_str().to_string()),
            ));
        }
        Ok(outcome)
    }

    pub fn campaign_report(&self, store_id: StoreId, id: Uuid) -> CampaignResult<CampaignReport> {
        let campaign = self.refresh_counters(store_id, id)?;
        Ok(CampaignReport::new(
            campaign.id,
            campaign.name,
            campaign.status.as_str(),
            campaign.counters,
            self.clock.now(),
        ))
    }

    pub fn store_overview(&self, store_id: StoreId) -> StoreOverview {
        let snapshots: Vec<CampaignSnapshot> = self
            .store
            .list(store_id)
            .into_iter()
            .filter_map(|c| self.refresh_counters(store_id, c.id).ok())
            .map(|c| CampaignSnapshot {
                campaign_id: c.id,
                status: c.status.as_str().to_string(),
                created_at: c.created_at,
                counters: c.counters,
            })
            .collect();
        StoreOverview::build(store_id, snapshots, self.clock.now(), self.overview_window_days)
    }

    /// Writes the tracker's current fold into the stored campaign.
    pub fn refresh_counters(&self, store_id: StoreId, id: Uuid) -> CampaignResult<Campaign> {
        let fold = self.tracker.counters(id);
        self.store.update(store_id, id, |c| {
            c.counters.absorb(&fold);
            Ok(())
        })
    }

    /// Store owning `campaign_id`. Used to scope inbound provider events,
    /// which carry only campaign and recipient ids.
    pub fn store_of(&self, campaign_id: Uuid) -> Option<StoreId> {
        self.store.store_of(campaign_id)
    }

    pub fn campaign_count(&self) -> usize {
        self.store.len()
    }

    pub fn segments(&self) -> &Arc<SegmentationEngine> {
        &self.segments
    }

    // ─── Internals ─────────────────────────────────────────────────────────

    /// Validates and applies `trigger`, then `extra`, as one atomic update.
    fn transition<F>(
        &self,
        store_id: StoreId,
        id: Uuid,
        trigger: CampaignTrigger,
        reason: Option<String>,
        extra: F,
    ) -> CampaignResult<Campaign>
    where
        F: FnOnce(&mut Campaign),
    {
        let now = self.clock.now();
        let mut from = CampaignStatus::Draft;
        let campaign = self.store.update(store_id, id, |c| {
            let transition = check_transition(c.status, trigger)?;
            from = c.status;
            c.status = transition.to;
            c.status_reason = reason;
            c.updated_at = now;
            if transition.to == CampaignStatus::Sent {
                c.sent_at = Some(now);
            }
            extra(c);
            Ok(())
        })?;
        info!(
            campaign_id = %id,
            from = %from,
            to = %campaign.status,
            trigger = trigger.as_str(),
            "Campaign transitioned"
        );
        self.event_sink.emit(make_event(
            EngineEventType::CampaignTransitioned,
            store_id,
            id,
            Some(format!("{}->{}", from, campaign.status)),
        ));
        Ok(campaign)
    }

    fn freeze_roster(
        &self,
        campaign: &Campaign,
        seeds: Vec<RecipientSeed>,
    ) -> CampaignResult<()> {
        let recipients =
            self.tracker
                .register_roster(campaign.id, campaign.store_id, seeds, self.clock.now())?;
        self.event_sink.emit(make_event(
            EngineEventType::RosterFrozen,
            campaign.store_id,
            campaign.id,
            Some(recipients.len().to_string()),
        ));
        Ok(())
    }

    /// Moves to `sending` and registers a fresh stop token. Caller holds the
    /// campaign lock.
    fn start_sending(
        &self,
        store_id: StoreId,
        id: Uuid,
        trigger: CampaignTrigger,
    ) -> CampaignResult<ActivePass> {
        let roster_size = self.tracker.recipients(id).len() as u64;
        let fold = self.tracker.counters(id);
        // Registered before the status flips so the orphan sweep in a
        // concurrent `run_due` never sees `sending` without a pass.
        let pass = ActivePass::new();
        self.active.insert(id, pass.clone());
        let started = self.transition(store_id, id, trigger, None, |c| {
            c.estimated_recipients = roster_size;
            c.next_resolution_at = None;
            c.counters.absorb(&fold);
        });
        if let Err(e) = started {
            self.active
                .remove_if(&id, |_, active| active.pass_id == pass.pass_id);
            return Err(e);
        }
        Ok(pass)
    }

    /// Runs one dispatch pass, then completes the campaign if nothing is
    /// left pending and it is still `sending`.
    async fn run_dispatch(
        &self,
        store_id: StoreId,
        id: Uuid,
        pass: ActivePass,
    ) -> CampaignResult<Campaign> {
        let campaign = self.store.get(store_id, id)?;
        let pending = self.tracker.pending(id);
        if !pending.is_empty() {
            self.dispatcher.dispatch(&campaign, pending, pass.stop.clone()).await;
        }

        let lock = self.store.lock_for(id);
        let _guard = lock.lock().await;
        self.active
            .remove_if(&id, |_, active| active.pass_id == pass.pass_id);

        let campaign = self.refresh_counters(store_id, id)?;
        if campaign.status == CampaignStatus::Sending
            && !pass.stop.is_cancelled()
            && self.tracker.pending_count(id) == 0
        {
            return self.transition(store_id, id, CampaignTrigger::AllDispatched, None, |_| {});
        }
        Ok(campaign)
    }

    fn validate_content(
        &self,
        name: &str,
        subject: &str,
        content_ref: &str,
        sender: &Sender,
    ) -> CampaignResult<()> {
        if name.trim().is_empty() {
            return Err(CampaignError::validation("campaign name is required"));
        }
        if subject.trim().is_empty() {
            return Err(CampaignError::validation("campaign subject is required"));
        }
        if content_ref.trim().is_empty() {
            return Err(CampaignError::validation("campaign content reference is required"));
        }
        if sender.name.trim().is_empty() || !is_valid_address(&sender.address) {
            return Err(CampaignError::validation(format!(
                "invalid sender '{} <{}>'",
                sender.name, sender.address
            )));
        }
        Ok(())
    }

    fn validate_audience(&self, store_id: StoreId, audience: &TargetAudience) -> CampaignResult<()> {
        if audience.is_empty() {
            return Err(CampaignError::validation(
                "audience needs at least one segment or criteria",
            ));
        }
        if let Some(criteria) = &audience.criteria {
            criteria.validate()?;
        }
        for segment_id in &audience.segment_ids {
            if !self.segments.exists(store_id, *segment_id) {
                return Err(CampaignError::validation(format!(
                    "segment {segment_id} does not exist in this store"
                )));
            }
        }
        Ok(())
    }
}

fn is_due(campaign: &Campaign, now: DateTime<Utc>) -> bool {
    let scheduled = campaign.scheduled_at.is_some_and(|at| at <= now);
    let retry_ready = campaign.next_resolution_at.map_or(true, |at| at <= now);
    scheduled && retry_ready
}

fn is_valid_address(address: &str) -> bool {
    let address = address.trim();
    match address.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !address.contains(char::is_whitespace)
        }
        None => false,
    }
}

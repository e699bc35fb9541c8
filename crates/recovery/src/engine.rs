use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use campaign_analytics::rate;
use campaign_core::config::{AppConfig, SchedulerConfig};
use campaign_core::event_bus::{make_event, noop_sink, EventSink};
use campaign_core::types::{normalize_address, EngineEventType};
use campaign_core::{CampaignError, CampaignResult, Clock, StoreId};
use campaign_delivery::{dispatch_with_retry, DispatchResult, OutboundMessage, RetryPolicy, Transport};

use crate::evaluator::{RecoveryEvaluator, StepDecision};
use crate::state_machine::{check_transition, EnrollmentTrigger};
use crate::types::{
    AbandonedCart, AbandonmentOutcome, AbandonmentRequest, CreateSequenceRequest, Enrollment,
    EnrollmentStatus, RecoverySequence, RecoveryStats, RecoveryStep, RecoveryTrigger, TickReport,
};

/// A claimed step, ready to hand to the transport.
struct StepJob {
    enrollment_id: Uuid,
    store_id: StoreId,
    cart_id: Uuid,
    step: usize,
    step_count: usize,
    message: OutboundMessage,
}

enum StepOutcome {
    Dispatched,
    Failed,
}

/// Recovery orchestration — sequences, abandoned carts and the enrollments
/// that walk customers through delayed follow-up steps.
#[derive(Clone)]
pub struct RecoveryScheduler {
    sequences: Arc<DashMap<Uuid, RecoverySequence>>,
    /// The one active sequence per (store, trigger).
    active_sequences: Arc<DashMap<(StoreId, RecoveryTrigger), Uuid>>,
    carts: Arc<DashMap<Uuid, AbandonedCart>>,
    enrollments: Arc<DashMap<Uuid, Enrollment>>,
    /// (sequence, address) -> open enrollment. Never locked while an
    /// `enrollments` guard is held.
    open_slots: Arc<DashMap<(Uuid, String), Uuid>>,
    evaluator: RecoveryEvaluator,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    event_sink: Arc<dyn EventSink>,
    shard: SchedulerConfig,
    permits: Arc<Semaphore>,
    send_timeout: Duration,
    policy: RetryPolicy,
}

impl std::fmt::Debug for RecoveryScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryScheduler")
            .field("sequences", &self.sequences.len())
            .field("carts", &self.carts.len())
            .field("enrollments", &self.enrollments.len())
            .finish()
    }
}

impl RecoveryScheduler {
    pub fn new(config: &AppConfig, transport: Arc<dyn Transport>, clock: Arc<dyn Clock>) -> Self {
        Self {
            sequences: Arc::new(DashMap::new()),
            active_sequences: Arc::new(DashMap::new()),
            carts: Arc::new(DashMap::new()),
            enrollments: Arc::new(DashMap::new()),
            open_slots: Arc::new(DashMap::new()),
            evaluator: RecoveryEvaluator::new(),
            transport,
            clock,
            event_sink: noop_sink(),
            shard: config.scheduler.clone(),
            permits: Arc::new(Semaphore::new(config.recovery.max_concurrency.max(1))),
            send_timeout: Duration::from_millis(config.dispatch.send_timeout_ms),
            policy: RetryPolicy::from_dispatch(&config.dispatch),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    // ─── Sequences ──────────────────────────────────────────────────────

    pub fn create_sequence(
        &self,
        store_id: StoreId,
        request: CreateSequenceRequest,
    ) -> CampaignResult<RecoverySequence> {
        if request.name.trim().is_empty() {
            return Err(CampaignError::validation("sequence name is required"));
        }
        if !request.from_address.contains('@') {
            return Err(CampaignError::validation(format!(
                "invalid sender address: {}",
                request.from_address
            )));
        }
        validate_steps(&request.steps)?;

        let now = self.clock.now();
        let sequence = RecoverySequence {
            id: Uuid::new_v4(),
            store_id,
            name: request.name,
            trigger: request.trigger,
            steps: request.steps,
            from_name: request.from_name,
            from_address: request.from_address,
            is_active: false,
            created_at: now,
            updated_at: now,
        };
        info!(
            sequence_id = %sequence.id,
            name = %sequence.name,
            trigger = sequence.trigger.as_str(),
            steps = sequence.steps.len(),
            "Creating recovery sequence"
        );
        self.sequences.insert(sequence.id, sequence.clone());

        if request.activate {
            return self.activate_sequence(store_id, sequence.id);
        }
        Ok(sequence)
    }

    /// Makes `id` the active sequence for its trigger, deactivating the
    /// previous one.
    pub fn activate_sequence(&self, store_id: StoreId, id: Uuid) -> CampaignResult<RecoverySequence> {
        let trigger = self.get_sequence(store_id, id)?.trigger;
        let now = self.clock.now();

        let mut slot = self.active_sequences.entry((store_id, trigger)).or_insert(id);
        let previous = std::mem::replace(slot.value_mut(), id);
        if previous != id {
            if let Some(mut prev) = self.sequences.get_mut(&previous) {
                prev.is_active = false;
                prev.updated_at = now;
            }
        }
        let activated = self.sequences.get_mut(&id).map(|mut s| {
            s.is_active = true;
            s.updated_at = now;
            s.clone()
        });
        drop(slot);

        match activated {
            Some(sequence) => {
                info!(sequence_id = %id, replaced = %previous, "Activated recovery sequence");
                Ok(sequence)
            }
            None => {
                // Deleted between the lookup and the activation.
                self.active_sequences
                    .remove_if(&(store_id, trigger), |_, active| *active == id);
                Err(CampaignError::not_found("sequence", id))
            }
        }
    }

    pub fn deactivate_sequence(
        &self,
        store_id: StoreId,
        id: Uuid,
    ) -> CampaignResult<RecoverySequence> {
        let trigger = self.get_sequence(store_id, id)?.trigger;
        self.active_sequences
            .remove_if(&(store_id, trigger), |_, active| *active == id);
        let mut entry = self
            .sequences
            .get_mut(&id)
            .ok_or_else(|| CampaignError::not_found("sequence", id))?;
        entry.is_active = false;
        entry.updated_at = self.clock.now();
        info!(sequence_id = %id, "Deactivated recovery sequence");
        Ok(entry.clone())
    }

    pub fn get_sequence(&self, store_id: StoreId, id: Uuid) -> CampaignResult<RecoverySequence> {
        self.sequences
            .get(&id)
            .filter(|s| s.store_id == store_id)
            .map(|s| s.clone())
            .ok_or_else(|| CampaignError::not_found("sequence", id))
    }

    pub fn list_sequences(&self, store_id: StoreId) -> Vec<RecoverySequence> {
        let mut sequences: Vec<RecoverySequence> = self
            .sequences
            .iter()
            .filter(|s| s.store_id == store_id)
            .map(|s| s.value().clone())
            .collect();
        sequences.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sequences
    }

    /// Refused while any active or paused enrollment references the sequence.
    pub fn delete_sequence(&self, store_id: StoreId, id: Uuid) -> CampaignResult<()> {
        let sequence = self.get_sequence(store_id, id)?;
        let open = self
            .enrollments
            .iter()
            .filter(|e| e.sequence_id == id && e.status.is_open())
            .count();
        if open > 0 {
            return Err(CampaignError::validation(format!(
                "sequence {id} has {open} open enrollments"
            )));
        }
        self.active_sequences
            .remove_if(&(store_id, sequence.trigger), |_, active| *active == id);
        self.sequences.remove(&id);
        info!(sequence_id = %id, "Deleted recovery sequence");
        Ok(())
    }

    // ─── Carts ──────────────────────────────────────────────────────────

    /// Records the cart and enrolls the customer in the active sequence for
    /// the trigger, unless they already hold an open enrollment on it.
    pub fn record_abandonment(
        &self,
        store_id: StoreId,
        request: AbandonmentRequest,
    ) -> CampaignResult<AbandonmentOutcome> {
        let address = normalize_address(&request.customer_address);
        if !address.contains('@') {
            return Err(CampaignError::validation(format!(
                "invalid customer address: {}",
                request.customer_address
            )));
        }
        for item in &request.items {
            if item.quantity == 0 {
                return Err(CampaignError::validation(format!(
                    "item {} has zero quantity",
                    item.sku
                )));
            }
            if !item.unit_price.is_finite() || item.unit_price < 0.0 {
                return Err(CampaignError::validation(format!(
                    "item {} has an invalid price",
                    item.sku
                )));
            }
        }

        let now = self.clock.now();
        let cart = AbandonedCart {
            id: Uuid::new_v4(),
            store_id,
            customer_address: address,
            customer_id: request.customer_id,
            trigger: request.trigger,
            total_value: request.items.iter().map(|i| i.line_total()).sum(),
            items: request.items,
            abandoned_at: request.abandoned_at.unwrap_or(now),
            recovered: false,
            recovered_at: None,
            recovery_attempts: 0,
            last_reminder_sent_at: None,
        };
        self.carts.insert(cart.id, cart.clone());
        info!(
            cart_id = %cart.id,
            store_id = %store_id,
            value = cart.total_value,
            "Recorded abandoned cart"
        );
        self.event_sink.emit(make_event(
            EngineEventType::CartAbandoned,
            store_id,
            cart.id,
            Some(cart.trigger.as_str().to_string()),
        ));

        let enrollment = self.enroll(&cart, now);
        Ok(AbandonmentOutcome { cart, enrollment })
    }

    fn enroll(&self, cart: &AbandonedCart, now: DateTime<Utc>) -> Option<Enrollment> {
        let sequence_id = *self.active_sequences.get(&(cart.store_id, cart.trigger))?;
        let enrollment = Enrollment {
            id: Uuid::new_v4(),
            store_id: cart.store_id,
            sequence_id,
            cart_id: cart.id,
            customer_address: cart.customer_address.clone(),
            current_step: 0,
            enrolled_at: cart.abandoned_at,
            status: EnrollmentStatus::Active,
            dispatched_steps: Default::default(),
            in_flight_step: None,
            last_reminder_sent_at: None,
            offer_issued_at: None,
            status_reason: None,
            updated_at: now,
        };

        if !self.claim_slot(sequence_id, &enrollment.customer_address, enrollment.id) {
            debug!(
                sequence_id = %sequence_id,
                cart_id = %cart.id,
                "Address already enrolled on sequence"
            );
            return None;
        }
        self.enrollments.insert(enrollment.id, enrollment.clone());
        info!(
            enrollment_id = %enrollment.id,
            sequence_id = %sequence_id,
            cart_id = %cart.id,
            "Enrolled customer in recovery sequence"
        );
        self.event_sink.emit(make_event(
            EngineEventType::EnrollmentCreated,
            cart.store_id,
            enrollment.id,
            Some(sequence_id.to_string()),
        ));
        Some(enrollment)
    }

    /// Marks the address's unrecovered carts abandoned at or before `at` as
    /// recovered. Enrollments on them complete at their next due step.
    pub fn mark_order_completed(
        &self,
        store_id: StoreId,
        address: &str,
        at: DateTime<Utc>,
    ) -> Vec<AbandonedCart> {
        let address = normalize_address(address);
        let mut recovered = Vec::new();
        for mut cart in self.carts.iter_mut() {
            if cart.store_id != store_id
                || cart.customer_address != address
                || cart.recovered
                || cart.abandoned_at > at
            {
                continue;
            }
            cart.recovered = true;
            cart.recovered_at = Some(at);
            recovered.push(cart.clone());
        }
        for cart in &recovered {
            info!(cart_id = %cart.id, value = cart.total_value, "Cart recovered");
            self.event_sink.emit(make_event(
                EngineEventType::CartRecovered,
                store_id,
                cart.id,
                None,
            ));
        }
        recovered
    }

    pub fn get_cart(&self, store_id: StoreId, id: Uuid) -> CampaignResult<AbandonedCart> {
        self.carts
            .get(&id)
            .filter(|c| c.store_id == store_id)
            .map(|c| c.clone())
            .ok_or_else(|| CampaignError::not_found("cart", id))
    }

    /// Newest first.
    pub fn list_carts(&self, store_id: StoreId) -> Vec<AbandonedCart> {
        let mut carts: Vec<AbandonedCart> = self
            .carts
            .iter()
            .filter(|c| c.store_id == store_id)
            .map(|c| c.value().clone())
            .collect();
        carts.sort_by(|a, b| b.abandoned_at.cmp(&a.abandoned_at));
        carts
    }

    // ─── Tick ───────────────────────────────────────────────────────────

    /// Advances every due enrollment this shard owns. Steps are claimed
    /// before any await, so overlapping ticks never send a step twice.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        let candidates: Vec<Uuid> = self
            .enrollments
            .iter()
            .filter(|e| {
                e.status == EnrollmentStatus::Active
                    && e.in_flight_step.is_none()
                    && self.shard.owns(&e.id)
            })
            .map(|e| e.id)
            .collect();

        let mut jobs = Vec::new();
        for id in candidates {
            if let Some(job) = self.advance(id, now, &mut report) {
                jobs.push(job);
            }
        }

        let mut tasks: JoinSet<StepOutcome> = JoinSet::new();
        for job in jobs {
            let permit = match self.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!(error = %e, "Recovery permits closed");
                    self.release_claim(job.enrollment_id);
                    continue;
                }
            };
            let this = self.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let result = dispatch_with_retry(
                    this.transport.as_ref(),
                    &job.message,
                    this.send_timeout,
                    &this.policy,
                )
                .await;
                this.complete_step(&job, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(StepOutcome::Dispatched) => report.dispatched += 1,
                Ok(StepOutcome::Failed) => report.failed += 1,
                Err(e) => error!(error = %e, "Recovery step task panicked"),
            }
        }

        if !report.is_empty() {
            info!(
                dispatched = report.dispatched,
                skipped = report.skipped,
                completed = report.completed,
                failed = report.failed,
                "Recovery tick finished"
            );
        }
        report
    }

    /// Walks one enrollment forward through completions and skips until it
    /// waits or claims a step to send.
    fn advance(&self, id: Uuid, now: DateTime<Utc>, report: &mut TickReport) -> Option<StepJob> {
        let (sequence_id, cart_id) = self.enrollments.get(&id).map(|e| (e.sequence_id, e.cart_id))?;
        let Some(sequence) = self.sequences.get(&sequence_id).map(|s| s.clone()) else {
            warn!(enrollment_id = %id, sequence_id = %sequence_id, "Enrollment references a missing sequence");
            return None;
        };
        let cart_recovered = self.carts.get(&cart_id).is_some_and(|c| c.recovered);

        let mut closed = None;
        let job = {
            let mut entry = self.enrollments.get_mut(&id)?;
            loop {
                match self.evaluator.evaluate(&entry, &sequence, cart_recovered, now) {
                    StepDecision::Idle | StepDecision::Wait { .. } => break None,
                    StepDecision::Complete(trigger) => {
                        let reason = match trigger {
                            EnrollmentTrigger::CartRecovered => "cart_recovered",
                            _ => "sequence_finished",
                        };
                        if self.apply(&mut entry, trigger, Some(reason.into()), now).is_ok() {
                            report.completed += 1;
                            closed = Some(entry.clone());
                        }
                        break None;
                    }
                    StepDecision::Skip { step, reason } => {
                        debug!(enrollment_id = %id, step, ?reason, "Skipping recovery step");
                        entry.current_step = step + 1;
                        entry.updated_at = now;
                        report.skipped += 1;
                    }
                    StepDecision::Dispatch { step } => {
                        entry.in_flight_step = Some(step);
                        entry.updated_at = now;
                        break Some(self.job_for(&entry, &sequence, step));
                    }
                }
            }
        };
        if let Some(enrollment) = closed {
            self.release_slot(&enrollment);
        }
        job
    }

    fn job_for(&self, enrollment: &Enrollment, sequence: &RecoverySequence, step: usize) -> StepJob {
        let definition = &sequence.steps[step];
        StepJob {
            enrollment_id: enrollment.id,
            store_id: enrollment.store_id,
            cart_id: enrollment.cart_id,
            step,
            step_count: sequence.steps.len(),
            message: OutboundMessage {
                message_id: Uuid::new_v4(),
                store_id: enrollment.store_id,
                campaign_id: None,
                to: enrollment.customer_address.clone(),
                from_name: sequence.from_name.clone(),
                from_address: sequence.from_address.clone(),
                subject: definition.subject.clone(),
                content_ref: definition.content_ref.clone(),
                offer_code: definition.offer.as_ref().map(|o| o.code.clone()),
            },
        }
    }

    /// Records a finished send. A step that was accepted always gets its
    /// marker, even if the enrollment was paused or unsubscribed meanwhile.
    fn complete_step(&self, job: &StepJob, result: DispatchResult) -> StepOutcome {
        let now = self.clock.now();
        let mut closed = None;
        let outcome = {
            let Some(mut entry) = self.enrollments.get_mut(&job.enrollment_id) else {
                warn!(enrollment_id = %job.enrollment_id, "Enrollment vanished during dispatch");
                return StepOutcome::Failed;
            };
            entry.in_flight_step = None;
            entry.updated_at = now;
            match result {
                DispatchResult::Accepted { attempts, .. } => {
                    entry.dispatched_steps.insert(job.step);
                    entry.last_reminder_sent_at = Some(now);
                    if job.message.offer_code.is_some() && entry.offer_issued_at.is_none() {
                        entry.offer_issued_at = Some(now);
                    }
                    if entry.current_step == job.step {
                        entry.current_step += 1;
                    }
                    debug!(enrollment_id = %job.enrollment_id, step = job.step, attempts, "Recovery step sent");
                    if entry.status == EnrollmentStatus::Active
                        && entry.current_step >= job.step_count
                        && self
                            .apply(
                                &mut entry,
                                EnrollmentTrigger::SequenceFinished,
                                Some("sequence_finished".into()),
                                now,
                            )
                            .is_ok()
                    {
                        closed = Some(entry.clone());
                    }
                    StepOutcome::Dispatched
                }
                DispatchResult::Failed { reason, attempts } => {
                    warn!(
                        enrollment_id = %job.enrollment_id,
                        step = job.step,
                        attempts,
                        reason = %reason,
                        "Recovery step failed"
                    );
                    if entry.status == EnrollmentStatus::Active
                        && self
                            .apply(&mut entry, EnrollmentTrigger::DispatchFailed, Some(reason), now)
                            .is_ok()
                    {
                        closed = Some(entry.clone());
                    }
                    StepOutcome::Failed
                }
            }
        };

        if matches!(outcome, StepOutcome::Dispatched) {
            if let Some(mut cart) = self.carts.get_mut(&job.cart_id) {
                cart.recovery_attempts += 1;
                cart.last_reminder_sent_at = Some(now);
            }
            metrics::counter!("recovery.steps_dispatched").increment(1);
            self.event_sink.emit(make_event(
                EngineEventType::RecoveryStepDispatched,
                job.store_id,
                job.enrollment_id,
                Some(format!("step {}", job.step)),
            ));
        }
        if let Some(enrollment) = closed {
            self.release_slot(&enrollment);
        }
        outcome
    }

    fn release_claim(&self, enrollment_id: Uuid) {
        if let Some(mut entry) = self.enrollments.get_mut(&enrollment_id) {
            entry.in_flight_step = None;
        }
    }

    // ─── Operator actions ───────────────────────────────────────────────

    pub fn pause(&self, store_id: StoreId, id: Uuid) -> CampaignResult<Enrollment> {
        self.transition(store_id, id, EnrollmentTrigger::Pause, Some("paused by operator".into()))
    }

    pub fn resume(&self, store_id: StoreId, id: Uuid) -> CampaignResult<Enrollment> {
        self.transition(store_id, id, EnrollmentTrigger::Resume, None)
    }

    pub fn unsubscribe(&self, store_id: StoreId, id: Uuid) -> CampaignResult<Enrollment> {
        self.transition(store_id, id, EnrollmentTrigger::Unsubscribe, Some("unsubscribed".into()))
    }

    /// Unsubscribes every enrollment of `address` in the store that has not
    /// already unsubscribed.
    pub fn unsubscribe_address(&self, store_id: StoreId, address: &str) -> Vec<Enrollment> {
        let address = normalize_address(address);
        let ids: Vec<Uuid> = self
            .enrollments
            .iter()
            .filter(|e| {
                e.store_id == store_id
                    && e.customer_address == address
                    && e.status != EnrollmentStatus::Unsubscribed
            })
            .map(|e| e.id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.unsubscribe(store_id, id).ok())
            .collect()
    }

    /// Starts the sequence over from step 0 with a fresh `enrolled_at`. The
    /// issued-offer marker is kept.
    pub fn restart(&self, store_id: StoreId, id: Uuid) -> CampaignResult<Enrollment> {
        let current = self.get_enrollment(store_id, id)?;
        check_transition(current.status, EnrollmentTrigger::Restart)?;
        if current.in_flight_step.is_some() {
            return Err(CampaignError::validation(format!(
                "enrollment {id} has a step in flight"
            )));
        }
        let holds_slot = current.status.is_open();
        if !holds_slot && !self.claim_slot(current.sequence_id, &current.customer_address, id) {
            return Err(CampaignError::validation(format!(
                "{} is already enrolled in sequence {}",
                current.customer_address, current.sequence_id
            )));
        }

        let restarted = self.reset_to_first_step(id);

        if restarted.is_err() && !holds_slot {
            self.open_slots
                .remove_if(&(current.sequence_id, current.customer_address.clone()), |_, v| *v == id);
        }
        restarted
    }

    fn reset_to_first_step(&self, id: Uuid) -> CampaignResult<Enrollment> {
        let now = self.clock.now();
        let mut entry = self
            .enrollments
            .get_mut(&id)
            .ok_or_else(|| CampaignError::not_found("enrollment", id))?;
        if entry.in_flight_step.is_some() {
            return Err(CampaignError::validation(format!(
                "enrollment {id} has a step in flight"
            )));
        }
        self.apply(&mut entry, EnrollmentTrigger::Restart, None, now)?;
        entry.current_step = 0;
        entry.enrolled_at = now;
        entry.dispatched_steps.clear();
        Ok(entry.clone())
    }

    /// Sends the current step immediately, regardless of its delay.
    pub async fn dispatch_now(&self, store_id: StoreId, id: Uuid) -> CampaignResult<Enrollment> {
        let current = self.get_enrollment(store_id, id)?;
        let sequence = self
            .sequences
            .get(&current.sequence_id)
            .map(|s| s.clone())
            .ok_or_else(|| CampaignError::not_found("sequence", current.sequence_id))?;

        let job = {
            let mut entry = self
                .enrollments
                .get_mut(&id)
                .ok_or_else(|| CampaignError::not_found("enrollment", id))?;
            if entry.status != EnrollmentStatus::Active {
                return Err(CampaignError::invalid_transition(
                    "enrollment",
                    entry.status,
                    "dispatch_now",
                ));
            }
            if entry.in_flight_step.is_some() {
                return Err(CampaignError::validation(format!(
                    "enrollment {id} has a step in flight"
                )));
            }
            if entry.current_step >= sequence.steps.len() {
                return Err(CampaignError::invalid_transition(
                    "enrollment",
                    "finished",
                    "dispatch_now",
                ));
            }
            if let Some(reason) = self.evaluator.skip_reason(&entry, &sequence) {
                return Err(CampaignError::invalid_transition(
                    "enrollment",
                    format!("{reason:?}"),
                    "dispatch_now",
                ));
            }
            let step = entry.current_step;
            entry.in_flight_step = Some(step);
            entry.updated_at = self.clock.now();
            self.job_for(&entry, &sequence, step)
        };

        let permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                self.release_claim(id);
                return Err(CampaignError::Internal(e.into()));
            }
        };
        info!(enrollment_id = %id, step = job.step, "Dispatching recovery step on demand");
        let result =
            dispatch_with_retry(self.transport.as_ref(), &job.message, self.send_timeout, &self.policy)
                .await;
        drop(permit);
        self.complete_step(&job, result);
        self.get_enrollment(store_id, id)
    }

    // ─── Queries ────────────────────────────────────────────────────────

    pub fn get_enrollment(&self, store_id: StoreId, id: Uuid) -> CampaignResult<Enrollment> {
        self.enrollments
            .get(&id)
            .filter(|e| e.store_id == store_id)
            .map(|e| e.clone())
            .ok_or_else(|| CampaignError::not_found("enrollment", id))
    }

    pub fn list_enrollments(
        &self,
        store_id: StoreId,
        status: Option<EnrollmentStatus>,
    ) -> Vec<Enrollment> {
        let mut enrollments: Vec<Enrollment> = self
            .enrollments
            .iter()
            .filter(|e| e.store_id == store_id && status.map_or(true, |s| e.status == s))
            .map(|e| e.value().clone())
            .collect();
        enrollments.sort_by(|a, b| a.enrolled_at.cmp(&b.enrolled_at));
        enrollments
    }

    pub fn stats(&self, store_id: StoreId) -> RecoveryStats {
        let mut carts_abandoned = 0u64;
        let mut carts_recovered = 0u64;
        let mut abandoned_value = 0.0;
        let mut recovered_value = 0.0;
        let mut reminders_sent = 0u64;
        for cart in self.carts.iter().filter(|c| c.store_id == store_id) {
            carts_abandoned += 1;
            abandoned_value += cart.total_value;
            reminders_sent += u64::from(cart.recovery_attempts);
            if cart.recovered {
                carts_recovered += 1;
                recovered_value += cart.total_value;
            }
        }

        let mut enrollments_by_status = BTreeMap::new();
        for enrollment in self.enrollments.iter().filter(|e| e.store_id == store_id) {
            *enrollments_by_status
                .entry(enrollment.status.as_str().to_string())
                .or_insert(0u64) += 1;
        }

        RecoveryStats {
            store_id,
            carts_abandoned,
            carts_recovered,
            abandoned_value,
            recovered_value,
            recovery_rate: rate(carts_recovered, carts_abandoned),
            reminders_sent,
            enrollments_by_status,
        }
    }

    // ─── Internals ──────────────────────────────────────────────────────

    fn transition(
        &self,
        store_id: StoreId,
        id: Uuid,
        trigger: EnrollmentTrigger,
        reason: Option<String>,
    ) -> CampaignResult<Enrollment> {
        let now = self.clock.now();
        let updated = {
            let mut entry = self
                .enrollments
                .get_mut(&id)
                .filter(|e| e.store_id == store_id)
                .ok_or_else(|| CampaignError::not_found("enrollment", id))?;
            self.apply(&mut entry, trigger, reason, now)?;
            entry.clone()
        };
        if !updated.status.is_open() {
            self.release_slot(&updated);
        }
        Ok(updated)
    }

    /// Checks and applies one transition in place. Nothing changes on error.
    fn apply(
        &self,
        enrollment: &mut Enrollment,
        trigger: EnrollmentTrigger,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> CampaignResult<()> {
        let transition = check_transition(enrollment.status, trigger)?;
        enrollment.status = transition.to;
        enrollment.status_reason = reason;
        enrollment.updated_at = now;
        info!(
            enrollment_id = %enrollment.id,
            from = %transition.from,
            to = %transition.to,
            trigger = trigger.as_str(),
            "Enrollment transitioned"
        );
        self.event_sink.emit(make_event(
            EngineEventType::EnrollmentTransitioned,
            enrollment.store_id,
            enrollment.id,
            Some(format!("{}->{}", transition.from, transition.to)),
        ));
        Ok(())
    }

    fn claim_slot(&self, sequence_id: Uuid, address: &str, enrollment_id: Uuid) -> bool {
        match self.open_slots.entry((sequence_id, address.to_string())) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(enrollment_id);
                true
            }
        }
    }

    fn release_slot(&self, enrollment: &Enrollment) {
        self.open_slots.remove_if(
            &(enrollment.sequence_id, enrollment.customer_address.clone()),
            |_, holder| *holder == enrollment.id,
        );
    }
}

fn validate_steps(steps: &[RecoveryStep]) -> CampaignResult<()> {
    if steps.is_empty() {
        return Err(CampaignError::validation("a sequence needs at least one step"));
    }
    let mut previous_delay = 0;
    for (index, step) in steps.iter().enumerate() {
        if step.subject.trim().is_empty() {
            return Err(CampaignError::validation(format!("step {index} has no subject")));
        }
        if step.content_ref.trim().is_empty() {
            return Err(CampaignError::validation(format!("step {index} has no content")));
        }
        if step.delay_secs < previous_delay {
            return Err(CampaignError::validation(format!(
                "step {index} delay {}s is shorter than the previous step",
                step.delay_secs
            )));
        }
        if let Some(offer) = &step.offer {
            if offer.code.trim().is_empty() || !(offer.percent_off > 0.0 && offer.percent_off <= 100.0)
            {
                return Err(CampaignError::validation(format!(
                    "step {index} has an invalid offer"
                )));
            }
        }
        previous_delay = step.delay_secs;
    }
    Ok(())
}

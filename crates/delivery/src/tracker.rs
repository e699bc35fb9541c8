//! Delivery tracker — owns campaign rosters and folds inbound delivery
//! events into recipient state.
//!
//! Ingestion is idempotent and commutative: each event carries a natural
//! key, timestamps only move toward first/last occurrence, and statuses merge
//! by rank. Campaign counters are recomputed from recipient state on demand.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use campaign_core::{CampaignError, CampaignResult, DeliveryCounters, StoreId};

use crate::events::{DeliveryEvent, DeliveryEventKind};
use crate::recipient::{earliest, latest, Recipient, RecipientSeed, RecipientStatus};

/// Result of ingesting one event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestOutcome {
    pub recipient: Recipient,
    pub previous_status: RecipientStatus,
    /// The event's natural key had already been applied.
    pub duplicate: bool,
}

impl IngestOutcome {
    pub fn status_changed(&self) -> bool {
        self.previous_status != self.recipient.status
    }
}

pub struct DeliveryTracker {
    recipients: DashMap<Uuid, Recipient>,
    /// Frozen recipient ids per campaign, in roster order.
    rosters: DashMap<Uuid, Vec<Uuid>>,
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self {
            recipients: DashMap::new(),
            rosters: DashMap::new(),
        }
    }

    /// Freezes a campaign's roster. Fails if one already exists.
    pub fn register_roster(
        &self,
        campaign_id: Uuid,
        store_id: StoreId,
        seeds: Vec<RecipientSeed>,
        at: DateTime<Utc>,
    ) -> CampaignResult<Vec<Recipient>> {
        match self.rosters.entry(campaign_id) {
            Entry::Occupied(_) => Err(CampaignError::validation(format!(
                "roster for campaign {campaign_id} is already frozen"
            ))),
            Entry::Vacant(slot) => {
                let recipients: Vec<Recipient> = seeds
                    .into_iter()
                    .map(|seed| Recipient::new(campaign_id, store_id, seed, at))
                    .collect();
                let ids = recipients.iter().map(|r| r.id).collect();
                for r in &recipients {
                    self.recipients.insert(r.id, r.clone());
                }
                slot.insert(ids);
                info!(
                    campaign_id = %campaign_id,
                    recipients = recipients.len(),
                    "Roster frozen"
                );
                Ok(recipients)
            }
        }
    }

    pub fn has_roster(&self, campaign_id: Uuid) -> bool {
        self.rosters.contains_key(&campaign_id)
    }

    pub fn get_recipient(&self, recipient_id: Uuid) -> Option<Recipient> {
        self.recipients.get(&recipient_id).map(|r| r.clone())
    }

    /// Recipients of a campaign in roster order.
    pub fn recipients(&self, campaign_id: Uuid) -> Vec<Recipient> {
        let ids = match self.rosters.get(&campaign_id) {
            Some(ids) => ids.clone(),
            None => return Vec::new(),
        };
        ids.iter()
            .filter_map(|id| self.recipients.get(id).map(|r| r.clone()))
            .collect()
    }

    pub fn pending(&self, campaign_id: Uuid) -> Vec<Recipient> {
        self.recipients(campaign_id)
            .into_iter()
            .filter(Recipient::is_pending)
            .collect()
    }

    pub fn pending_count(&self, campaign_id: Uuid) -> usize {
        self.pending(campaign_id).len()
    }

    /// Applies one delivery event. Replaying an event leaves counters
    /// unchanged and only widens first/last occurrence timestamps.
    pub fn ingest(&self, event: &DeliveryEvent) -> CampaignResult<IngestOutcome> {
        let mut entry = self
            .recipients
            .get_mut(&event.recipient_id)
            .filter(|r| r.campaign_id == event.campaign_id)
            .ok_or_else(|| CampaignError::not_found("recipient", event.recipient_id))?;
        let recipient = entry.value_mut();
        let previous_status = recipient.status;
        let duplicate = !recipient.applied_keys.insert(event.natural_key());
        let at = event.occurred_at;

        match event.kind {
            DeliveryEventKind::Sent => recipient.sent_at = earliest(recipient.sent_at, at),
            DeliveryEventKind::Delivered => {
                recipient.delivered_at = earliest(recipient.delivered_at, at)
            }
            DeliveryEventKind::Opened => {
                recipient.first_opened_at = earliest(recipient.first_opened_at, at);
                recipient.last_opened_at = latest(recipient.last_opened_at, at);
            }
            DeliveryEventKind::Clicked => {
                recipient.first_clicked_at = earliest(recipient.first_clicked_at, at);
                recipient.last_clicked_at = latest(recipient.last_clicked_at, at);
                if let Some(link) = &event.link {
                    recipient.clicked_links.insert(link.clone());
                }
            }
            DeliveryEventKind::Bounced => recipient.bounced_at = earliest(recipient.bounced_at, at),
            DeliveryEventKind::Unsubscribed => {
                recipient.unsubscribed_at = earliest(recipient.unsubscribed_at, at)
            }
        }
        recipient.status = recipient.status.merge(event.kind.status());

        if duplicate {
            metrics::counter!("delivery.duplicate_events").increment(1);
        } else {
            metrics::counter!("delivery.events_ingested", "kind" => event.kind.as_str())
                .increment(1);
        }
        debug!(
            recipient_id = %recipient.id,
            kind = event.kind.as_str(),
            duplicate,
            status = %recipient.status,
            "Ingested delivery event"
        );

        Ok(IngestOutcome {
            recipient: recipient.clone(),
            previous_status,
            duplicate,
        })
    }

    /// Marks a single recipient failed. The first failure reason is kept.
    pub fn mark_failed(
        &self,
        recipient_id: Uuid,
        reason: impl Into<String>,
        at: DateTime<Utc>,
    ) -> CampaignResult<Recipient> {
        let mut entry = self
            .recipients
            .get_mut(&recipient_id)
            .ok_or_else(|| CampaignError::not_found("recipient", recipient_id))?;
        let recipient = entry.value_mut();
        recipient.failed_at = earliest(recipient.failed_at, at);
        if recipient.failure_reason.is_none() {
            recipient.failure_reason = Some(reason.into());
        }
        recipient.status = recipient.status.merge(RecipientStatus::Failed);
        Ok(recipient.clone())
    }

    pub fn set_provider_message_id(&self, recipient_id: Uuid, provider_message_id: String) {
        if let Some(mut r) = self.recipients.get_mut(&recipient_id) {
            if r.provider_message_id.is_none() {
                r.provider_message_id = Some(provider_message_id);
            }
        }
    }

    /// Campaign counters folded from recipient state.
    pub fn counters(&self, campaign_id: Uuid) -> DeliveryCounters {
        let mut counters = DeliveryCounters::default();
        for r in self.recipients(campaign_id) {
            counters.total_recipients += 1;
            counters.total_sent += u64::from(r.reached_sent());
            counters.total_delivered += u64::from(r.reached_delivered());
            counters.total_opened += u64::from(r.reached_opened());
            counters.total_clicked += u64::from(r.first_clicked_at.is_some());
            counters.total_bounced += u64::from(r.bounced_at.is_some());
            counters.total_unsubscribed += u64::from(r.unsubscribed_at.is_some());
            counters.total_failed += u64::from(r.failed_at.is_some());
            counters.total_delivery_reports += u64::from(r.delivered_at.is_some());
        }
        counters
    }

    /// Drops a campaign's roster and recipients. Returns how many were removed.
    pub fn remove_campaign(&self, campaign_id: Uuid) -> usize {
        let Some((_, ids)) = self.rosters.remove(&campaign_id) else {
            return 0;
        };
        for id in &ids {
            self.recipients.remove(id);
        }
        info!(campaign_id = %campaign_id, removed = ids.len(), "Removed campaign recipients");
        ids.len()
    }
}

impl Default for DeliveryTracker {
    fn default() -> Self {
        Self::new()
    }
}

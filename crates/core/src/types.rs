use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Owning store (tenant). Threaded explicitly through every engine call.
pub type StoreId = Uuid;

/// Customer identifier as issued by the record store.
pub type CustomerId = String;

/// Aggregated customer record as returned by the record store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerRecord {
    pub id: CustomerId,
    pub store_id: StoreId,
    pub email: String,
    #[serde(default)]
    pub total_spent: f64,
    #[serde(default)]
    pub order_count: u32,
    pub last_purchase_at: Option<DateTime<Utc>>,
    pub signed_up_at: Option<DateTime<Utc>>,
    pub location: Option<String>,
    pub country: Option<String>,
    /// Historical open rate across past campaigns, 0.0..=1.0.
    #[serde(default)]
    pub open_rate: f64,
    /// Historical click rate across past campaigns, 0.0..=1.0.
    #[serde(default)]
    pub click_rate: f64,
    #[serde(default = "default_subscribed")]
    pub subscribed: bool,
}

fn default_subscribed() -> bool {
    true
}

impl CustomerRecord {
    pub fn new(store_id: StoreId, id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            store_id,
            email: email.into(),
            total_spent: 0.0,
            order_count: 0,
            last_purchase_at: None,
            signed_up_at: None,
            location: None,
            country: None,
            open_rate: 0.0,
            click_rate: 0.0,
            subscribed: true,
        }
    }
}

/// Lowercased, trimmed address used for deduplication and suppression.
pub fn normalize_address(address: &str) -> String {
    address.trim().to_ascii_lowercase()
}

/// Campaign-level delivery counters, always derived from recipient state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryCounters {
    pub total_recipients: u64,
    pub total_sent: u64,
    pub total_delivered: u64,
    pub total_opened: u64,
    pub total_clicked: u64,
    pub total_bounced: u64,
    pub total_unsubscribed: u64,
    pub total_failed: u64,
    /// Recipients the transport explicitly reported as delivered. Opens and
    /// clicks imply delivery but do not count here.
    #[serde(default)]
    pub total_delivery_reports: u64,
}

impl DeliveryCounters {
    /// Denominator for open, click and unsubscribe rates: delivered
    /// recipients, or sent recipients while no delivery has been reported.
    pub fn engagement_base(&self) -> u64 {
        if self.total_delivery_reports == 0 {
            self.total_sent.max(self.total_delivered)
        } else {
            self.total_delivered
        }
    }

    /// Field-wise sum, used for store-level rollups.
    pub fn accumulate(&mut self, other: &DeliveryCounters) {
        self.total_recipients += other.total_recipients;
        self.total_sent += other.total_sent;
        self.total_delivered += other.total_delivered;
        self.total_opened += other.total_opened;
        self.total_clicked += other.total_clicked;
        self.total_bounced += other.total_bounced;
        self.total_unsubscribed += other.total_unsubscribed;
        self.total_failed += other.total_failed;
        self.total_delivery_reports += other.total_delivery_reports;
    }

    /// Field-wise maximum. Keeps stored counters non-decreasing when folds
    /// computed concurrently are written back out of order.
    pub fn absorb(&mut self, fold: &DeliveryCounters) {
        self.total_recipients = self.total_recipients.max(fold.total_recipients);
        self.total_sent = self.total_sent.max(fold.total_sent);
        self.total_delivered = self.total_delivered.max(fold.total_delivered);
        self.total_opened = self.total_opened.max(fold.total_opened);
        self.total_clicked = self.total_clicked.max(fold.total_clicked);
        self.total_bounced = self.total_bounced.max(fold.total_bounced);
        self.total_unsubscribed = self.total_unsubscribed.max(fold.total_unsubscribed);
        self.total_failed = self.total_failed.max(fold.total_failed);
        self.total_delivery_reports = self.total_delivery_reports.max(fold.total_delivery_reports);
    }

    /// True when no counter in `self` is lower than in `previous`.
    pub fn dominates(&self, previous: &DeliveryCounters) -> bool {
        self.total_recipients >= previous.total_recipients
            && self.total_sent >= previous.total_sent
            && self.total_delivered >= previous.total_delivered
            && self.total_opened >= previous.total_opened
            && self.total_clicked >= previous.total_clicked
            && self.total_bounced >= previous.total_bounced
            && self.total_unsubscribed >= previous.total_unsubscribed
            && self.total_failed >= previous.total_failed
            && self.total_delivery_reports >= previous.total_delivery_reports
    }
}

/// Engine notification emitted to the event sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    pub event_id: Uuid,
    pub event_type: EngineEventType,
    pub store_id: StoreId,
    /// Id of the campaign, segment, enrollment or cart the event concerns.
    pub subject_id: String,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EngineEventType {
    SegmentCreated,
    SegmentRecalculated,
    CampaignCreated,
    CampaignDeleted,
    CampaignTransitioned,
    RosterFrozen,
    RecipientDispatched,
    RecipientFailed,
    DeliveryEventIngested,
    CartAbandoned,
    CartRecovered,
    EnrollmentCreated,
    RecoveryStepDispatched,
    EnrollmentTransitioned,
}

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use campaign_core::{CustomerId, StoreId};

/// What starts a recovery sequence for a customer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryTrigger {
    CartAbandoned,
    BrowseAbandoned,
}

impl RecoveryTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CartAbandoned => "cart_abandoned",
            Self::BrowseAbandoned => "browse_abandoned",
        }
    }
}

/// A discount attached to a step. Issued at most once per enrollment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscountOffer {
    pub code: String,
    pub percent_off: f64,
}

/// A single delayed message within a sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryStep {
    /// Seconds after the enrollment's trigger time.
    pub delay_secs: u64,
    pub subject: String,
    pub content_ref: String,
    #[serde(default)]
    pub offer: Option<DiscountOffer>,
}

/// An ordered, delayed follow-up sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverySequence {
    pub id: Uuid,
    pub store_id: StoreId,
    pub name: String,
    pub trigger: RecoveryTrigger,
    pub steps: Vec<RecoveryStep>,
    pub from_name: String,
    pub from_address: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSequenceRequest {
    pub name: String,
    pub trigger: RecoveryTrigger,
    pub steps: Vec<RecoveryStep>,
    pub from_name: String,
    pub from_address: String,
    /// Activate on creation, replacing any active sequence for the trigger.
    #[serde(default)]
    pub activate: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartItem {
    pub sku: String,
    pub name: String,
    pub quantity: u32,
    pub unit_price: f64,
}

impl CartItem {
    pub fn line_total(&self) -> f64 {
        self.unit_price * f64::from(self.quantity)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbandonedCart {
    pub id: Uuid,
    pub store_id: StoreId,
    pub customer_address: String,
    #[serde(default)]
    pub customer_id: Option<CustomerId>,
    pub trigger: RecoveryTrigger,
    pub items: Vec<CartItem>,
    pub total_value: f64,
    pub abandoned_at: DateTime<Utc>,
    pub recovered: bool,
    pub recovered_at: Option<DateTime<Utc>>,
    pub recovery_attempts: u32,
    pub last_reminder_sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbandonmentRequest {
    pub customer_address: String,
    #[serde(default)]
    pub customer_id: Option<CustomerId>,
    #[serde(default)]
    pub items: Vec<CartItem>,
    /// Defaults to the current time.
    #[serde(default)]
    pub abandoned_at: Option<DateTime<Utc>>,
    #[serde(default = "default_trigger")]
    pub trigger: RecoveryTrigger,
}

fn default_trigger() -> RecoveryTrigger {
    RecoveryTrigger::CartAbandoned
}

impl AbandonmentRequest {
    pub fn cart(address: impl Into<String>, items: Vec<CartItem>) -> Self {
        Self {
            customer_address: address.into(),
            customer_id: None,
            items,
            abandoned_at: None,
            trigger: RecoveryTrigger::CartAbandoned,
        }
    }

    pub fn at(mut self, abandoned_at: DateTime<Utc>) -> Self {
        self.abandoned_at = Some(abandoned_at);
        self
    }
}

/// Status of an enrollment within its sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Active,
    Paused,
    Completed,
    Unsubscribed,
    Failed,
}

impl EnrollmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Unsubscribed => "unsubscribed",
            Self::Failed => "failed",
        }
    }

    /// Active and paused enrollments still hold the customer's slot on the
    /// sequence.
    pub fn is_open(self) -> bool {
        matches!(self, Self::Active | Self::Paused)
    }
}

impl std::fmt::Display for EnrollmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A customer's position within a recovery sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: Uuid,
    pub store_id: StoreId,
    pub sequence_id: Uuid,
    pub cart_id: Uuid,
    pub customer_address: String,
    pub current_step: usize,
    pub enrolled_at: DateTime<Utc>,
    pub status: EnrollmentStatus,
    /// Steps already handed to the transport. Never re-sent.
    pub dispatched_steps: BTreeSet<usize>,
    /// Step claimed by a tick or `dispatch_now` and not yet finished.
    pub in_flight_step: Option<usize>,
    pub last_reminder_sent_at: Option<DateTime<Utc>>,
    /// Survives restarts so an offer is issued at most once.
    pub offer_issued_at: Option<DateTime<Utc>>,
    pub status_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Result of recording an abandonment. `enrollment` is `None` when no
/// sequence is active for the trigger or the address is already enrolled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbandonmentOutcome {
    pub cart: AbandonedCart,
    pub enrollment: Option<Enrollment>,
}

/// Counts from one scheduler tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    pub dispatched: u64,
    pub skipped: u64,
    pub completed: u64,
    pub failed: u64,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        self.dispatched == 0 && self.skipped == 0 && self.completed == 0 && self.failed == 0
    }
}

/// Per-store recovery statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryStats {
    pub store_id: StoreId,
    pub carts_abandoned: u64,
    pub carts_recovered: u64,
    pub abandoned_value: f64,
    pub recovered_value: f64,
    pub recovery_rate: f64,
    pub reminders_sent: u64,
    pub enrollments_by_status: BTreeMap<String, u64>,
}

//! Recipient records and the monotonic per-recipient status order.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use campaign_core::{CustomerId, StoreId};

/// Per-recipient delivery status.
///
/// Progression is `pending < sent < delivered < opened < clicked`.
/// `failed`, `bounced` and `unsubscribed` are terminal and absorb every
/// progression status; between terminals the higher rank wins, so the final
/// status does not depend on event arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientStatus {
    Pending,
    Sent,
    Delivered,
    Opened,
    Clicked,
    Failed,
    Bounced,
    Unsubscribed,
}

impl RecipientStatus {
    pub const fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Sent => 1,
            Self::Delivered => 2,
            Self::Opened => 3,
            Self::Clicked => 4,
            Self::Failed => 5,
            Self::Bounced => 6,
            Self::Unsubscribed => 7,
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Bounced | Self::Unsubscribed)
    }

    /// Status after observing `incoming` while in `self`.
    pub fn merge(self, incoming: RecipientStatus) -> RecipientStatus {
        match (self.is_terminal(), incoming.is_terminal()) {
            (true, false) => self,
            (false, true) => incoming,
            _ if incoming.rank() > self.rank() => incoming,
            _ => self,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Opened => "opened",
            Self::Clicked => "clicked",
            Self::Failed => "failed",
            Self::Bounced => "bounced",
            Self::Unsubscribed => "unsubscribed",
        }
    }
}

impl fmt::Display for RecipientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved audience member, before a recipient record exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientSeed {
    pub customer_id: Option<CustomerId>,
    pub address: String,
}

/// One addressed instance of a campaign's delivery. Timestamps are only
/// ever set, never cleared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub store_id: StoreId,
    pub customer_id: Option<CustomerId>,
    pub address: String,
    pub status: RecipientStatus,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub first_opened_at: Option<DateTime<Utc>>,
    pub last_opened_at: Option<DateTime<Utc>>,
    pub first_clicked_at: Option<DateTime<Utc>>,
    pub last_clicked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub clicked_links: BTreeSet<String>,
    pub bounced_at: Option<DateTime<Utc>>,
    pub unsubscribed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub provider_message_id: Option<String>,
    /// Natural keys of events already applied.
    #[serde(default)]
    pub applied_keys: BTreeSet<String>,
}

impl Recipient {
    pub fn new(campaign_id: Uuid, store_id: StoreId, seed: RecipientSeed, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            campaign_id,
            store_id,
            customer_id: seed.customer_id,
            address: seed.address,
            status: RecipientStatus::Pending,
            created_at: at,
            sent_at: None,
            delivered_at: None,
            first_opened_at: None,
            last_opened_at: None,
            first_clicked_at: None,
            last_clicked_at: None,
            clicked_links: BTreeSet::new(),
            bounced_at: None,
            unsubscribed_at: None,
            failed_at: None,
            failure_reason: None,
            provider_message_id: None,
            applied_keys: BTreeSet::new(),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == RecipientStatus::Pending
    }

    pub fn reached_delivered(&self) -> bool {
        self.delivered_at.is_some() || self.reached_opened()
    }

    /// A click implies the message was opened.
    pub fn reached_opened(&self) -> bool {
        self.first_opened_at.is_some() || self.first_clicked_at.is_some()
    }

    pub fn reached_sent(&self) -> bool {
        self.sent_at.is_some()
            || self.reached_delivered()
            || self.bounced_at.is_some()
            || self.unsubscribed_at.is_some()
    }
}

/// Keeps the earliest of two optional timestamps.
pub(crate) fn earliest(current: Option<DateTime<Utc>>, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    Some(current.map_or(at, |c| c.min(at)))
}

/// Keeps the latest of two optional timestamps.
pub(crate) fn latest(current: Option<DateTime<Utc>>, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    Some(current.map_or(at, |c| c.max(at)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use RecipientStatus::*;

    #[test]
    fn test_progression_is_monotonic() {
        assert_eq!(Pending.merge(Sent), Sent);
        assert_eq!(Delivered.merge(Sent), Delivered);
        assert_eq!(Opened.merge(Clicked), Clicked);
        assert_eq!(Clicked.merge(Opened), Clicked);
    }

    #[test]
    fn test_terminal_states_absorb() {
        assert_eq!(Delivered.merge(Bounced), Bounced);
        assert_eq!(Unsubscribed.merge(Opened), Unsubscribed);
        assert_eq!(Failed.merge(Delivered), Failed);
        assert_eq!(Pending.merge(Failed), Failed);
    }

    #[test]
    fn test_terminal_merge_is_order_independent() {
        for a in [Failed, Bounced, Unsubscribed] {
            for b in [Failed, Bounced, Unsubscribed] {
                assert_eq!(Sent.merge(a).merge(b), Sent.merge(b).merge(a));
            }
        }
    }

    #[test]
    fn test_click_implies_open_and_delivery() {
        let seed = RecipientSeed {
            customer_id: None,
            address: "a@x.com".into(),
        };
        let mut r = Recipient::new(Uuid::new_v4(), Uuid::new_v4(), seed, Utc::now());
        assert!(!r.reached_sent());
        r.first_clicked_at = Some(Utc::now());
        assert!(r.reached_opened());
        assert!(r.reached_delivered());
        assert!(r.reached_sent());
    }
}

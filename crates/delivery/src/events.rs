//! Inbound delivery events reported by the transport.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::recipient::RecipientStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryEventKind {
    Sent,
    Delivered,
    Opened,
    Clicked,
    Bounced,
    Unsubscribed,
}

impl DeliveryEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Opened => "opened",
            Self::Clicked => "clicked",
            Self::Bounced => "bounced",
            Self::Unsubscribed => "unsubscribed",
        }
    }

    pub fn status(self) -> RecipientStatus {
        match self {
            Self::Sent => RecipientStatus::Sent,
            Self::Delivered => RecipientStatus::Delivered,
            Self::Opened => RecipientStatus::Opened,
            Self::Clicked => RecipientStatus::Clicked,
            Self::Bounced => RecipientStatus::Bounced,
            Self::Unsubscribed => RecipientStatus::Unsubscribed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryEvent {
    pub campaign_id: Uuid,
    pub recipient_id: Uuid,
    pub kind: DeliveryEventKind,
    pub occurred_at: DateTime<Utc>,
    /// Clicked link, for `clicked` events.
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl DeliveryEvent {
    pub fn new(
        campaign_id: Uuid,
        recipient_id: Uuid,
        kind: DeliveryEventKind,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            campaign_id,
            recipient_id,
            kind,
            occurred_at,
            link: None,
            metadata: None,
        }
    }

    pub fn clicked(
        campaign_id: Uuid,
        recipient_id: Uuid,
        link: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            link: Some(link.into()),
            ..Self::new(campaign_id, recipient_id, DeliveryEventKind::Clicked, occurred_at)
        }
    }

    /// Deduplication key: recipient + kind, plus the link for clicks.
    pub fn natural_key(&self) -> String {
        match (self.kind, &self.link) {
            (DeliveryEventKind::Clicked, Some(link)) => {
                format!("{}:{}:{}", self.recipient_id, self.kind.as_str(), link)
            }
            _ => format!("{}:{}", self.recipient_id, self.kind.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_natural_key_includes_link_for_clicks() {
        let c = Uuid::new_v4();
        let r = Uuid::new_v4();
        let now = Utc::now();
        let a = DeliveryEvent::clicked(c, r, "https://shop/a", now);
        let b = DeliveryEvent::clicked(c, r, "https://shop/b", now);
        let open = DeliveryEvent::new(c, r, DeliveryEventKind::Opened, now);
        let open_later = DeliveryEvent::new(c, r, DeliveryEventKind::Opened, now + chrono::Duration::hours(1));
        assert_ne!(a.natural_key(), b.natural_key());
        assert_eq!(open.natural_key(), open_later.natural_key());
    }
}

//! Campaign domain types — campaigns, audiences, senders and requests.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use campaign_core::{DeliveryCounters, StoreId};
use campaign_segmentation::CriteriaGroup;

// ─── Campaign ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub store_id: StoreId,
    pub name: String,
    pub subject: String,
    pub content_ref: String,
    pub sender: Sender,
    pub audience: TargetAudience,
    pub status: CampaignStatus,
    pub send_immediately: bool,
    pub scheduled_at: Option<DateTime<Utc>>,
    /// IANA zone the schedule was expressed in.
    pub timezone: String,
    pub estimated_recipients: u64,
    pub counters: DeliveryCounters,
    pub status_reason: Option<String>,
    pub resolution_attempts: u32,
    pub next_resolution_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Sending,
    Sent,
    Paused,
    Cancelled,
}

impl CampaignStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Scheduled => "scheduled",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::Cancelled)
    }
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    pub name: String,
    pub address: String,
}

/// Who a campaign targets: the union of the referenced segments and any
/// ad-hoc criteria, minus unsubscribed addresses unless included.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetAudience {
    #[serde(default)]
    pub segment_ids: Vec<Uuid>,
    #[serde(default)]
    pub criteria: Option<CriteriaGroup>,
    #[serde(default)]
    pub include_unsubscribed: bool,
}

impl TargetAudience {
    pub fn segments(ids: Vec<Uuid>) -> Self {
        Self {
            segment_ids: ids,
            ..Default::default()
        }
    }

    pub fn criteria(criteria: CriteriaGroup) -> Self {
        Self {
            criteria: Some(criteria),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.segment_ids.is_empty() && self.criteria.is_none()
    }
}

// ─── Requests ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCampaignRequest {
    pub name: String,
    pub subject: String,
    pub content_ref: String,
    pub sender: Sender,
    pub audience: TargetAudience,
    #[serde(default)]
    pub send_immediately: bool,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateCampaignRequest {
    pub name: Option<String>,
    pub subject: Option<String>,
    pub content_ref: Option<String>,
    pub sender: Option<Sender>,
    pub audience: Option<TargetAudience>,
    pub timezone: Option<String>,
}

/// When a scheduled campaign should start.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleRequest {
    At { at: DateTime<Utc> },
    /// Wall-clock time in the store's zone; falls back to the campaign's
    /// timezone when none is given.
    Local {
        at: NaiveDateTime,
        #[serde(default)]
        timezone: Option<String>,
    },
}

/// What a scheduler tick did.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunDueReport {
    pub started: Vec<Uuid>,
    pub retrying: Vec<Uuid>,
    pub paused: Vec<Uuid>,
    pub completed: Vec<Uuid>,
}

impl RunDueReport {
    pub fn is_empty(&self) -> bool {
        self.started.is_empty()
            && self.retrying.is_empty()
            && self.paused.is_empty()
            && self.completed.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchSummary {
    pub accepted: u64,
    pub failed: u64,
    /// Recipients left pending because dispatch was stopped.
    pub skipped: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_request_json() {
        let req: ScheduleRequest = serde_json::from_value(serde_json::json!({
            "kind": "local",
            "at": "2026-03-10T09:00:00"
        }))
        .unwrap();
        assert!(matches!(req, ScheduleRequest::Local { timezone: None, .. }));
    }

    #[test]
    fn test_audience_is_empty() {
        assert!(TargetAudience::default().is_empty());
        assert!(!TargetAudience::segments(vec![Uuid::new_v4()]).is_empty());
    }
}

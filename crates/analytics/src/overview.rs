//! Store overview — counters summed over campaigns created in a trailing
//! window, plus campaign counts by status.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use campaign_core::{DeliveryCounters, StoreId};

use crate::rates::CampaignRates;

/// The slice of a campaign the overview needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignSnapshot {
    pub campaign_id: Uuid,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub counters: DeliveryCounters,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreOverview {
    pub store_id: StoreId,
    pub window_days: u32,
    pub window_start: DateTime<Utc>,
    pub total_campaigns: u64,
    pub campaigns_by_status: BTreeMap<String, u64>,
    pub totals: DeliveryCounters,
    pub rates: CampaignRates,
    pub rates_percent: CampaignRates,
    pub generated_at: DateTime<Utc>,
}

impl StoreOverview {
    /// Campaigns with `created_at > now - window_days` are included, each once.
    pub fn build<I>(store_id: StoreId, campaigns: I, now: DateTime<Utc>, window_days: u32) -> Self
    where
        I: IntoIterator<Item = CampaignSnapshot>,
    {
        let window_start = now - Duration::days(i64::from(window_days));
        let mut seen = std::collections::HashSet::new();
        let mut totals = DeliveryCounters::default();
        let mut campaigns_by_status: BTreeMap<String, u64> = BTreeMap::new();

        for campaign in campaigns {
            if campaign.created_at <= window_start || !seen.insert(campaign.campaign_id) {
                continue;
            }
            totals.accumulate(&campaign.counters);
            *campaigns_by_status.entry(campaign.status).or_insert(0) += 1;
        }

        let rates = CampaignRates::from_counters(&totals);
        debug!(store_id = %store_id, campaigns = seen.len(), "Built store overview");

        Self {
            store_id,
            window_days,
            window_start,
            total_campaigns: seen.len() as u64,
            campaigns_by_status,
            totals,
            rates,
            rates_percent: rates.as_percentages(),
            generated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(status: &str, age_days: i64, now: DateTime<Utc>, delivered: u64, opened: u64) -> CampaignSnapshot {
        CampaignSnapshot {
            campaign_id: Uuid::new_v4(),
            status: status.into(),
            created_at: now - Duration::days(age_days),
            counters: DeliveryCounters {
                total_recipients: delivered,
                total_sent: delivered,
                total_delivered: delivered,
                total_opened: opened,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_window_excludes_old_campaigns() {
        let now = Utc::now();
        let campaigns = vec![
            snapshot("sent", 2, now, 10, 5),
            snapshot("sent", 29, now, 10, 1),
            snapshot("sent", 30, now, 100, 100),
            snapshot("draft", 45, now, 0, 0),
        ];
        let overview = StoreOverview::build(Uuid::new_v4(), campaigns, now, 30);
        assert_eq!(overview.total_campaigns, 2);
        assert_eq!(overview.totals.total_delivered, 20);
        assert_eq!(overview.totals.total_opened, 6);
        assert_eq!(overview.rates_percent.open_rate, 30.0);
        assert_eq!(overview.campaigns_by_status.get("sent"), Some(&2));
        assert!(overview.campaigns_by_status.get("draft").is_none());
    }

    #[test]
    fn test_campaign_counted_once() {
        let now = Utc::now();
        let one = snapshot("sending", 1, now, 4, 2);
        let overview = StoreOverview::build(Uuid::new_v4(), vec![one.clone(), one], now, 30);
        assert_eq!(overview.total_campaigns, 1);
        assert_eq!(overview.totals.total_delivered, 4);
    }

    #[test]
    fn test_empty_store() {
        let overview = StoreOverview::build(Uuid::new_v4(), Vec::new(), Utc::now(), 30);
        assert_eq!(overview.total_campaigns, 0);
        assert_eq!(overview.rates.open_rate, 0.0);
    }
}

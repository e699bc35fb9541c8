//! Engagement rates derived from campaign delivery counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use campaign_core::DeliveryCounters;

/// `numerator / denominator`, or 0 when the denominator is 0.
pub fn rate(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Fraction to percentage, rounded to two decimals.
pub fn to_percent(fraction: f64) -> f64 {
    (fraction * 10_000.0).round() / 100.0
}

/// Rates as fractions in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CampaignRates {
    pub delivery_rate: f64,
    pub open_rate: f64,
    pub click_rate: f64,
    pub click_to_open_rate: f64,
    pub bounce_rate: f64,
    pub unsubscribe_rate: f64,
}

impl CampaignRates {
    pub fn from_counters(c: &DeliveryCounters) -> Self {
        let base = c.engagement_base();
        Self {
            delivery_rate: rate(c.total_delivered, c.total_recipients),
            open_rate: rate(c.total_opened, base),
            click_rate: rate(c.total_clicked, base),
            click_to_open_rate: rate(c.total_clicked, c.total_opened),
            bounce_rate: rate(c.total_bounced, c.total_recipients),
            unsubscribe_rate: rate(c.total_unsubscribed, base),
        }
    }

    pub fn as_percentages(&self) -> Self {
        Self {
            delivery_rate: to_percent(self.delivery_rate),
            open_rate: to_percent(self.open_rate),
            click_rate: to_percent(self.click_rate),
            click_to_open_rate: to_percent(self.click_to_open_rate),
            bounce_rate: to_percent(self.bounce_rate),
            unsubscribe_rate: to_percent(self.unsubscribe_rate),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignReport {
    pub campaign_id: Uuid,
    pub name: String,
    pub status: String,
    pub counters: DeliveryCounters,
    pub rates: CampaignRates,
    pub rates_percent: CampaignRates,
    pub generated_at: DateTime<Utc>,
}

impl CampaignReport {
    pub fn new(
        campaign_id: Uuid,
        name: impl Into<String>,
        status: impl Into<String>,
        counters: DeliveryCounters,
        generated_at: DateTime<Utc>,
    ) -> Self {
        let rates = CampaignRates::from_counters(&counters);
        Self {
            campaign_id,
            name: name.into(),
            status: status.into(),
            counters,
            rates,
            rates_percent: rates.as_percentages(),
            generated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_is_zero_safe() {
        assert_eq!(rate(0, 0), 0.0);
        assert_eq!(rate(7, 0), 0.0);
        assert_eq!(rate(5, 10), 0.5);
    }

    #[test]
    fn test_percent_rounding() {
        assert_eq!(to_percent(0.5), 50.0);
        assert_eq!(to_percent(1.0 / 3.0), 33.33);
        assert_eq!(to_percent(2.0 / 3.0), 66.67);
    }

    #[test]
    fn test_open_rate_without_deliveries() {
        let counters = DeliveryCounters {
            total_recipients: 4,
            total_sent: 4,
            ..Default::default()
        };
        let rates = CampaignRates::from_counters(&counters);
        assert_eq!(rates.open_rate, 0.0);
        assert_eq!(rates.click_to_open_rate, 0.0);
        assert_eq!(rates.delivery_rate, 0.0);
    }

    #[test]
    fn test_report_rates() {
        let counters = DeliveryCounters {
            total_recipients: 10,
            total_sent: 10,
            total_delivered: 10,
            total_opened: 5,
            total_clicked: 2,
            total_bounced: 0,
            total_unsubscribed: 1,
            total_failed: 0,
            total_delivery_reports: 10,
        };
        let report = CampaignReport::new(Uuid::new_v4(), "Spring", "sent", counters, Utc::now());
        assert_eq!(report.rates.open_rate, 0.5);
        assert_eq!(report.rates_percent.open_rate, 50.0);
        assert_eq!(report.rates_percent.click_to_open_rate, 40.0);
        assert_eq!(report.rates_percent.unsubscribe_rate, 10.0);
    }

    #[test]
    fn test_open_rate_falls_back_to_sent_without_delivery_reports() {
        // Two sent, one opened; the open implies one delivery.
        let mut counters = DeliveryCounters {
            total_recipients: 2,
            total_sent: 2,
            total_delivered: 1,
            total_opened: 1,
            ..Default::default()
        };
        assert_eq!(CampaignRates::from_counters(&counters).open_rate, 0.5);

        // Once the transport reports deliveries, they are the base.
        counters.total_delivery_reports = 1;
        assert_eq!(CampaignRates::from_counters(&counters).open_rate, 1.0);
    }
}

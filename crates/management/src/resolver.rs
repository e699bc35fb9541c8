//! Recipient resolver — turns a campaign audience into a deduplicated,
//! ordered list of deliverable addresses.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use campaign_core::records::{fetch_customers, fetch_unsubscribed};
use campaign_core::types::normalize_address;
use campaign_core::{
    CampaignError, CampaignResult, Clock, CustomerId, CustomerRecord, CustomerStore, StoreId,
};
use campaign_delivery::RecipientSeed;
use campaign_segmentation::{match_records, SegmentationEngine};

use crate::models::TargetAudience;

pub struct RecipientResolver {
    segments: Arc<SegmentationEngine>,
    customers: Arc<dyn CustomerStore>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl RecipientResolver {
    pub fn new(
        segments: Arc<SegmentationEngine>,
        customers: Arc<dyn CustomerStore>,
        clock: Arc<dyn Clock>,
        timeout: Duration,
    ) -> Self {
        Self {
            segments,
            customers,
            clock,
            timeout,
        }
    }

    /// Resolves `audience` against one consistent read of the store's
    /// customers. Segments contribute in reference order, then ad-hoc
    /// criteria; the first occurrence of an address wins.
    pub async fn resolve(
        &self,
        store_id: StoreId,
        audience: &TargetAudience,
    ) -> CampaignResult<Vec<RecipientSeed>> {
        if audience.is_empty() {
            return Err(CampaignError::validation("audience is empty"));
        }
        let records = fetch_customers(self.customers.as_ref(), store_id, self.timeout).await?;
        let suppressed = if audience.include_unsubscribed {
            HashSet::new()
        } else {
            fetch_unsubscribed(self.customers.as_ref(), store_id, self.timeout).await?
        };

        let mut member_sets: Vec<BTreeSet<CustomerId>> = Vec::new();
        for segment_id in &audience.segment_ids {
            member_sets.push(self.segments.members_from(store_id, *segment_id, &records)?);
        }
        if let Some(criteria) = &audience.criteria {
            criteria.validate()?;
            member_sets.push(match_records(criteria, &records, self.clock.now()));
        }

        let by_id: HashMap<&str, &CustomerRecord> =
            records.iter().map(|r| (r.id.as_str(), r)).collect();
        let mut seen = HashSet::new();
        let mut seeds = Vec::new();
        for customer_id in member_sets.iter().flatten() {
            let Some(record) = by_id.get(customer_id.as_str()) else {
                // Static snapshots can reference customers deleted since.
                continue;
            };
            let address = normalize_address(&record.email);
            if address.is_empty() {
                continue;
            }
            if !audience.include_unsubscribed
                && (!record.subscribed || suppressed.contains(&address))
            {
                continue;
            }
            if seen.insert(address.clone()) {
                seeds.push(RecipientSeed {
                    customer_id: Some(record.id.clone()),
                    address,
                });
            }
        }

        debug!(
            store_id = %store_id,
            segments = audience.segment_ids.len(),
            recipients = seeds.len(),
            "Resolved recipients"
        );
        Ok(seeds)
    }

    pub async fn estimate(&self, store_id: StoreId, audience: &TargetAudience) -> CampaignResult<u64> {
        Ok(self.resolve(store_id, audience).await?.len() as u64)
    }
}

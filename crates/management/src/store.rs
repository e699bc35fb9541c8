//! In-memory campaign store backed by DashMap.
//!
//! Production: replace with a transactional store. This provides the same
//! API surface for development and testing. Every read and write is scoped
//! by store id; a campaign owned by another store is reported as not found.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use campaign_core::{CampaignError, CampaignResult, StoreId};

use crate::models::{Campaign, CampaignStatus};

pub struct CampaignStore {
    campaigns: DashMap<Uuid, Campaign>,
    /// Serializes roster freeze and status transitions per campaign.
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl CampaignStore {
    pub fn new() -> Self {
        Self {
            campaigns: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    pub fn insert(&self, campaign: Campaign) {
        self.locks
            .entry(campaign.id)
            .or_insert_with(|| Arc::new(Mutex::new(())));
        self.campaigns.insert(campaign.id, campaign);
    }

    pub fn get(&self, store_id: StoreId, id: Uuid) -> CampaignResult<Campaign> {
        self.campaigns
            .get(&id)
            .filter(|c| c.store_id == store_id)
            .map(|c| c.clone())
            .ok_or_else(|| CampaignError::not_found("campaign", id))
    }

    /// Owning store of a campaign, for callers that only hold its id.
    pub fn store_of(&self, id: Uuid) -> Option<StoreId> {
        self.campaigns.get(&id).map(|c| c.store_id)
    }

    /// Applies `f` to the stored campaign under its map entry lock. `f` must
    /// check before it mutates: an error leaves whatever it already wrote.
    pub fn update<F>(&self, store_id: StoreId, id: Uuid, f: F) -> CampaignResult<Campaign>
    where
        F: FnOnce(&mut Campaign) -> CampaignResult<()>,
    {
        let mut entry = self
            .campaigns
            .get_mut(&id)
            .filter(|c| c.store_id == store_id)
            .ok_or_else(|| CampaignError::not_found("campaign", id))?;
        f(entry.value_mut())?;
        Ok(entry.clone())
    }

    pub fn list(&self, store_id: StoreId) -> Vec<Campaign> {
        let mut campaigns: Vec<Campaign> = self
            .campaigns
            .iter()
            .filter(|c| c.store_id == store_id)
            .map(|c| c.value().clone())
            .collect();
        campaigns.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        campaigns
    }

    /// Campaigns across all stores in the given status.
    pub fn with_status(&self, status: CampaignStatus) -> Vec<Campaign> {
        self.campaigns
            .iter()
            .filter(|c| c.status == status)
            .map(|c| c.value().clone())
            .collect()
    }

    pub fn remove(&self, store_id: StoreId, id: Uuid) -> CampaignResult<Campaign> {
        let (_, campaign) = self
            .campaigns
            .remove_if(&id, |_, c| c.store_id == store_id)
            .ok_or_else(|| CampaignError::not_found("campaign", id))?;
        self.locks.remove(&id);
        Ok(campaign)
    }

    pub fn lock_for(&self, id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.campaigns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.campaigns.is_empty()
    }
}

impl Default for CampaignStore {
    fn default() -> Self {
        Self::new()
    }
}

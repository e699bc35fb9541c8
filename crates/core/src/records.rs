//! Customer record store interface and an in-memory implementation.
//!
//! Production deployments back this with the storefront database; the
//! in-memory store provides the same surface for development and testing.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::info;

use crate::error::{CampaignError, CampaignResult};
use crate::types::{normalize_address, CustomerRecord, StoreId};

/// Customer/record store queried by segment evaluation and recipient resolution.
#[async_trait]
pub trait CustomerStore: Send + Sync {
    /// All customers owned by `store_id`, with their aggregate fields.
    async fn customers(&self, store_id: StoreId) -> CampaignResult<Vec<CustomerRecord>>;

    /// Normalized addresses on the store's suppression list.
    async fn unsubscribed_addresses(&self, store_id: StoreId) -> CampaignResult<HashSet<String>>;

    /// Adds an address to the store's suppression list.
    async fn record_unsubscribe(&self, store_id: StoreId, address: &str) -> CampaignResult<()>;
}

/// Fetches a store's customers, bounded by `timeout`.
pub async fn fetch_customers(
    source: &dyn CustomerStore,
    store_id: StoreId,
    timeout: Duration,
) -> CampaignResult<Vec<CustomerRecord>> {
    match tokio::time::timeout(timeout, source.customers(store_id)).await {
        Ok(result) => result.map_err(into_resolution_failure),
        Err(_) => Err(CampaignError::ResolutionFailure(format!(
            "customer query timed out after {}ms",
            timeout.as_millis()
        ))),
    }
}

/// Fetches a store's suppression list, bounded by `timeout`.
pub async fn fetch_unsubscribed(
    source: &dyn CustomerStore,
    store_id: StoreId,
    timeout: Duration,
) -> CampaignResult<HashSet<String>> {
    match tokio::time::timeout(timeout, source.unsubscribed_addresses(store_id)).await {
        Ok(result) => result.map_err(into_resolution_failure),
        Err(_) => Err(CampaignError::ResolutionFailure(format!(
            "suppression query timed out after {}ms",
            timeout.as_millis()
        ))),
    }
}

/// Adds an address to a store's suppression list, bounded by `timeout`.
pub async fn record_suppression(
    source: &dyn CustomerStore,
    store_id: StoreId,
    address: &str,
    timeout: Duration,
) -> CampaignResult<()> {
    match tokio::time::timeout(timeout, source.record_unsubscribe(store_id, address)).await {
        Ok(result) => result.map_err(into_resolution_failure),
        Err(_) => Err(CampaignError::ResolutionFailure(format!(
            "suppression update timed out after {}ms",
            timeout.as_millis()
        ))),
    }
}

fn into_resolution_failure(err: CampaignError) -> CampaignError {
    match err {
        CampaignError::ResolutionFailure(_) => err,
        other => CampaignError::ResolutionFailure(other.to_string()),
    }
}

/// Thread-safe in-memory customer store backed by `DashMap`.
pub struct InMemoryCustomerStore {
    customers: DashMap<StoreId, Vec<CustomerRecord>>,
    suppressed: DashMap<StoreId, HashSet<String>>,
    available: AtomicBool,
}

impl InMemoryCustomerStore {
    pub fn new() -> Self {
        Self {
            customers: DashMap::new(),
            suppressed: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Inserts or replaces a customer (matched by id within its store).
    pub fn upsert(&self, record: CustomerRecord) {
        let mut list = self.customers.entry(record.store_id).or_default();
        if let Some(existing) = list.iter_mut().find(|c| c.id == record.id) {
            *existing = record;
        } else {
            list.push(record);
        }
    }

    pub fn remove(&self, store_id: StoreId, customer_id: &str) -> bool {
        self.customers
            .get_mut(&store_id)
            .map(|mut list| {
                let before = list.len();
                list.retain(|c| c.id != customer_id);
                before != list.len()
            })
            .unwrap_or(false)
    }

    pub fn customer_count(&self, store_id: StoreId) -> usize {
        self.customers.get(&store_id).map(|l| l.len()).unwrap_or(0)
    }

    /// Simulates an outage: every query fails while unavailable.
    pub fn set_available(&self, available: bool) {
        info!(available, "customer store availability changed");
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> CampaignResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CampaignError::ResolutionFailure(
                "customer store unavailable".into(),
            ))
        }
    }
}

impl Default for InMemoryCustomerStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CustomerStore for InMemoryCustomerStore {
    async fn customers(&self, store_id: StoreId) -> CampaignResult<Vec<CustomerRecord>> {
        self.check_available()?;
        Ok(self
            .customers
            .get(&store_id)
            .map(|l| l.clone())
            .unwrap_or_default())
    }

    async fn unsubscribed_addresses(&self, store_id: StoreId) -> CampaignResult<HashSet<String>> {
        self.check_available()?;
        Ok(self
            .suppressed
            .get(&store_id)
            .map(|s| s.clone())
            .unwrap_or_default())
    }

    async fn record_unsubscribe(&self, store_id: StoreId, address: &str) -> CampaignResult<()> {
        self.check_available()?;
        let normalized = normalize_address(address);
        if let Some(mut list) = self.customers.get_mut(&store_id) {
            for customer in list.iter_mut() {
                if normalize_address(&customer.email) == normalized {
                    customer.subscribed = false;
                }
            }
        }
        self.suppressed
            .entry(store_id)
            .or_default()
            .insert(normalized);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_upsert_replaces_by_id() {
        let store = InMemoryCustomerStore::new();
        let store_id = Uuid::new_v4();
        store.upsert(CustomerRecord::new(store_id, "c1", "a@x.com"));
        let mut updated = CustomerRecord::new(store_id, "c1", "a@x.com");
        updated.total_spent = 42.0;
        store.upsert(updated);

        let customers = store.customers(store_id).await.unwrap();
        assert_eq!(customers.len(), 1);
        assert_eq!(customers[0].total_spent, 42.0);
    }

    #[tokio::test]
    async fn test_stores_are_isolated() {
        let store = InMemoryCustomerStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store.upsert(CustomerRecord::new(a, "c1", "a@x.com"));
        assert!(store.customers(b).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_record_unsubscribe_flags_customer() {
        let store = InMemoryCustomerStore::new();
        let store_id = Uuid::new_v4();
        store.upsert(CustomerRecord::new(store_id, "c1", "Bob@X.com"));
        store.record_unsubscribe(store_id, "bob@x.COM").await.unwrap();

        let customers = store.customers(store_id).await.unwrap();
        assert!(!customers[0].subscribed);
        let suppressed = store.unsubscribed_addresses(store_id).await.unwrap();
        assert!(suppressed.contains("bob@x.com"));
    }

    struct SlowStore;

    #[async_trait]
    impl CustomerStore for SlowStore {
        async fn customers(&self, _store_id: StoreId) -> CampaignResult<Vec<CustomerRecord>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Vec::new())
        }

        async fn unsubscribed_addresses(
            &self,
            _store_id: StoreId,
        ) -> CampaignResult<HashSet<String>> {
            Ok(HashSet::new())
        }

        async fn record_unsubscribe(&self, _store_id: StoreId, _address: &str) -> CampaignResult<()> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_customers_times_out() {
        let err = fetch_customers(&SlowStore, Uuid::new_v4(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, CampaignError::ResolutionFailure(msg) if msg.contains("timed out")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_suppression_times_out() {
        let err = record_suppression(&SlowStore, Uuid::new_v4(), "a@x.com", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, CampaignError::ResolutionFailure(msg) if msg.contains("timed out")));
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_resolution() {
        let store = InMemoryCustomerStore::new();
        store.set_available(false);
        let err = store.customers(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, CampaignError::ResolutionFailure(_)));
    }
}

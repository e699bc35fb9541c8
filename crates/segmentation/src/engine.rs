//! Core segmentation engine — stores segment definitions and evaluates
//! membership against the customer record store.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use campaign_core::event_bus::{make_event, noop_sink, EventSink};
use campaign_core::records::fetch_customers;
use campaign_core::types::EngineEventType;
use campaign_core::{
    CampaignError, CampaignResult, Clock, CustomerId, CustomerRecord, CustomerStore, StoreId,
};

use crate::computed::CustomerFacts;
use crate::predicates::CriteriaGroup;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub id: Uuid,
    pub store_id: StoreId,
    pub name: String,
    pub description: Option<String>,
    pub segment_type: SegmentType,
    pub criteria: CriteriaGroup,
    pub is_dynamic: bool,
    pub member_count: u64,
    pub last_calculated_at: Option<DateTime<Utc>>,
    /// Frozen membership of a static segment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub members: Option<BTreeSet<CustomerId>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentType {
    Behavioral,
    Demographic,
    Transactional,
    Engagement,
    Custom,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSegmentRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub segment_type: SegmentType,
    pub criteria: CriteriaGroup,
    #[serde(default = "default_dynamic")]
    pub is_dynamic: bool,
}

fn default_dynamic() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateSegmentRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub segment_type: Option<SegmentType>,
    pub criteria: Option<CriteriaGroup>,
    pub is_dynamic: Option<bool>,
}

/// Matches `records` against `criteria` at `now`.
pub fn match_records(
    criteria: &CriteriaGroup,
    records: &[CustomerRecord],
    now: DateTime<Utc>,
) -> BTreeSet<CustomerId> {
    records
        .iter()
        .filter(|r| criteria.matches(&CustomerFacts::new(r), now))
        .map(|r| r.id.clone())
        .collect()
}

pub struct SegmentationEngine {
    segments: DashMap<Uuid, Segment>,
    customers: Arc<dyn CustomerStore>,
    clock: Arc<dyn Clock>,
    event_sink: Arc<dyn EventSink>,
    query_timeout: Duration,
}

impl SegmentationEngine {
    pub fn new(customers: Arc<dyn CustomerStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            segments: DashMap::new(),
            customers,
            clock,
            event_sink: noop_sink(),
            query_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// Evaluates ad-hoc criteria against the store's current customers.
    pub async fn evaluate(
        &self,
        store_id: StoreId,
        criteria: &CriteriaGroup,
    ) -> CampaignResult<BTreeSet<CustomerId>> {
        criteria.validate()?;
        let records = self.load_customers(store_id).await?;
        Ok(match_records(criteria, &records, self.clock.now()))
    }

    pub async fn create_segment(
        &self,
        store_id: StoreId,
        req: CreateSegmentRequest,
    ) -> CampaignResult<Segment> {
        if req.name.trim().is_empty() {
            return Err(CampaignError::validation("segment name is required"));
        }
        req.criteria.validate()?;

        let now = self.clock.now();
        let mut segment = Segment {
            id: Uuid::new_v4(),
            store_id,
            name: req.name,
            description: req.description,
            segment_type: req.segment_type,
            criteria: req.criteria,
            is_dynamic: req.is_dynamic,
            member_count: 0,
            last_calculated_at: None,
            members: None,
            created_at: now,
            updated_at: now,
        };

        // Static segments snapshot at creation; a failed snapshot creates nothing.
        let records = self.load_customers(store_id).await?;
        let members = match_records(&segment.criteria, &records, now);
        segment.member_count = members.len() as u64;
        segment.last_calculated_at = Some(now);
        if !segment.is_dynamic {
            segment.members = Some(members);
        }

        info!(
            segment_id = %segment.id,
            store_id = %store_id,
            name = %segment.name,
            dynamic = segment.is_dynamic,
            members = segment.member_count,
            "Created segment"
        );
        self.event_sink.emit(make_event(
            EngineEventType::SegmentCreated,
            store_id,
            segment.id,
            None,
        ));
        self.segments.insert(segment.id, segment.clone());
        Ok(segment)
    }

    pub fn get_segment(&self, store_id: StoreId, id: Uuid) -> CampaignResult<Segment> {
        self.segments
            .get(&id)
            .filter(|s| s.store_id == store_id)
            .map(|s| s.clone())
            .ok_or_else(|| CampaignError::not_found("segment", id))
    }

    pub fn list_segments(&self, store_id: StoreId) -> Vec<Segment> {
        let mut segments: Vec<Segment> = self
            .segments
            .iter()
            .filter(|s| s.store_id == store_id)
            .map(|s| s.value().clone())
            .collect();
        segments.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        segments
    }

    pub fn exists(&self, store_id: StoreId, id: Uuid) -> bool {
        self.segments
            .get(&id)
            .map(|s| s.store_id == store_id)
            .unwrap_or(false)
    }

    /// Updates a segment definition. A static segment keeps its snapshot
    /// until `recalculate` is called; a dynamic segment turned static takes
    /// its first snapshot here.
    pub async fn update_segment(
        &self,
        store_id: StoreId,
        id: Uuid,
        req: UpdateSegmentRequest,
    ) -> CampaignResult<Segment> {
        if let Some(criteria) = &req.criteria {
            criteria.validate()?;
        }
        if matches!(&req.name, Some(name) if name.trim().is_empty()) {
            return Err(CampaignError::validation("segment name is required"));
        }

        let current = self.get_segment(store_id, id)?;
        let becomes_static = current.is_dynamic && req.is_dynamic == Some(false);
        let records = if becomes_static {
            Some(self.load_customers(store_id).await?)
        } else {
            None
        };

        let now = self.clock.now();
        let mut entry = self
            .segments
            .get_mut(&id)
            .filter(|s| s.store_id == store_id)
            .ok_or_else(|| CampaignError::not_found("segment", id))?;
        let segment = entry.value_mut();
        if let Some(name) = req.name {
            segment.name = name;
        }
        if let Some(description) = req.description {
            segment.description = Some(description);
        }
        if let Some(segment_type) = req.segment_type {
            segment.segment_type = segment_type;
        }
        if let Some(criteria) = req.criteria {
            segment.criteria = criteria;
        }
        match (req.is_dynamic, records) {
            (Some(false), Some(records)) => {
                let members = match_records(&segment.criteria, &records, now);
                segment.member_count = members.len() as u64;
                segment.last_calculated_at = Some(now);
                segment.members = Some(members);
                segment.is_dynamic = false;
            }
            (Some(true), _) => {
                segment.members = None;
                segment.is_dynamic = true;
            }
            _ => {}
        }
        segment.updated_at = now;
        info!(segment_id = %id, dynamic = segment.is_dynamic, "Updated segment");
        Ok(segment.clone())
    }

    pub fn delete_segment(&self, store_id: StoreId, id: Uuid) -> CampaignResult<()> {
        self.segments
            .remove_if(&id, |_, s| s.store_id == store_id)
            .ok_or_else(|| CampaignError::not_found("segment", id))?;
        info!(segment_id = %id, "Deleted segment");
        Ok(())
    }

    /// Re-runs the criteria and, for static segments, replaces the snapshot.
    pub async fn recalculate(&self, store_id: StoreId, id: Uuid) -> CampaignResult<Segment> {
        let criteria = self.get_segment(store_id, id)?.criteria;
        let records = self.load_customers(store_id).await?;
        let now = self.clock.now();
        let members = match_records(&criteria, &records, now);

        let mut entry = self
            .segments
            .get_mut(&id)
            .ok_or_else(|| CampaignError::not_found("segment", id))?;
        let segment = entry.value_mut();
        segment.member_count = members.len() as u64;
        segment.last_calculated_at = Some(now);
        if !segment.is_dynamic {
            segment.members = Some(members);
        }
        info!(segment_id = %id, members = segment.member_count, "Recalculated segment");
        self.event_sink.emit(make_event(
            EngineEventType::SegmentRecalculated,
            store_id,
            id,
            Some(segment.member_count.to_string()),
        ));
        Ok(segment.clone())
    }

    /// Current membership: the snapshot for static segments, a fresh
    /// evaluation for dynamic ones.
    pub async fn members(&self, store_id: StoreId, id: Uuid) -> CampaignResult<BTreeSet<CustomerId>> {
        let segment = self.get_segment(store_id, id)?;
        if !segment.is_dynamic {
            return Ok(segment.members.unwrap_or_default());
        }
        let records = self.load_customers(store_id).await?;
        self.members_from(store_id, id, &records)
    }

    /// Membership using an already-fetched customer list, so a resolver can
    /// evaluate several segments against one consistent read.
    pub fn members_from(
        &self,
        store_id: StoreId,
        id: Uuid,
        records: &[CustomerRecord],
    ) -> CampaignResult<BTreeSet<CustomerId>> {
        let mut entry = self
            .segments
            .get_mut(&id)
            .filter(|s| s.store_id == store_id)
            .ok_or_else(|| CampaignError::not_found("segment", id))?;
        let segment = entry.value_mut();
        if !segment.is_dynamic {
            return Ok(segment.members.clone().unwrap_or_default());
        }
        let now = self.clock.now();
        let members = match_records(&segment.criteria, records, now);
        segment.member_count = members.len() as u64;
        segment.last_calculated_at = Some(now);
        debug!(segment_id = %id, members = members.len(), "Evaluated dynamic segment");
        Ok(members)
    }

    async fn load_customers(&self, store_id: StoreId) -> CampaignResult<Vec<CustomerRecord>> {
        fetch_customers(self.customers.as_ref(), store_id, self.query_timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predicates::{NumericAttribute, NumericCondition, Predicate};
    use campaign_core::{InMemoryCustomerStore, ManualClock};

    fn big_spenders() -> CriteriaGroup {
        CriteriaGroup::all(vec![Predicate::Numeric {
            attribute: NumericAttribute::TotalSpent,
            condition: NumericCondition::GreaterThan { value: 500.0 },
        }])
    }

    fn setup() -> (Arc<InMemoryCustomerStore>, SegmentationEngine, StoreId) {
        let store = Arc::new(InMemoryCustomerStore::new());
        let store_id = Uuid::new_v4();
        for (id, spent) in [("alice", 600.0), ("bob", 400.0), ("carol", 1000.0)] {
            let mut c = CustomerRecord::new(store_id, id, format!("{id}@x.com"));
            c.total_spent = spent;
            store.upsert(c);
        }
        let engine = SegmentationEngine::new(store.clone(), Arc::new(ManualClock::new(Utc::now())));
        (store, engine, store_id)
    }

    fn request(dynamic: bool) -> CreateSegmentRequest {
        CreateSegmentRequest {
            name: "Big Spenders".into(),
            description: None,
            segment_type: SegmentType::Transactional,
            criteria: big_spenders(),
            is_dynamic: dynamic,
        }
    }

    #[tokio::test]
    async fn test_big_spenders() {
        let (_, engine, store_id) = setup();
        let members = engine.evaluate(store_id, &big_spenders()).await.unwrap();
        let expected: BTreeSet<String> = ["alice", "carol"].iter().map(|s| s.to_string()).collect();
        assert_eq!(members, expected);
    }

    #[tokio::test]
    async fn test_static_segment_is_frozen_until_recalculated() {
        let (store, engine, store_id) = setup();
        let segment = engine.create_segment(store_id, request(false)).await.unwrap();
        assert_eq!(segment.member_count, 2);

        let mut dave = CustomerRecord::new(store_id, "dave", "dave@x.com");
        dave.total_spent = 900.0;
        store.upsert(dave);

        assert_eq!(engine.members(store_id, segment.id).await.unwrap().len(), 2);
        let recalculated = engine.recalculate(store_id, segment.id).await.unwrap();
        assert_eq!(recalculated.member_count, 3);
        assert_eq!(engine.members(store_id, segment.id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_dynamic_segment_reevaluates() {
        let (store, engine, store_id) = setup();
        let segment = engine.create_segment(store_id, request(true)).await.unwrap();
        assert!(segment.members.is_none());

        let mut dave = CustomerRecord::new(store_id, "dave", "dave@x.com");
        dave.total_spent = 900.0;
        store.upsert(dave);

        let members = engine.members(store_id, segment.id).await.unwrap();
        assert!(members.contains("dave"));
        assert_eq!(engine.get_segment(store_id, segment.id).unwrap().member_count, 3);
    }

    #[tokio::test]
    async fn test_segments_are_store_scoped() {
        let (_, engine, store_id) = setup();
        let segment = engine.create_segment(store_id, request(true)).await.unwrap();
        let other = Uuid::new_v4();
        assert!(engine.get_segment(other, segment.id).is_err());
        assert!(engine.delete_segment(other, segment.id).is_err());
        assert!(engine.list_segments(other).is_empty());
        assert!(engine.delete_segment(store_id, segment.id).is_ok());
    }

    #[tokio::test]
    async fn test_switching_to_static_takes_snapshot() {
        let (store, engine, store_id) = setup();
        let segment = engine.create_segment(store_id, request(true)).await.unwrap();
        let updated = engine
            .update_segment(
                store_id,
                segment.id,
                UpdateSegmentRequest {
                    is_dynamic: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.members.as_ref().map(|m| m.len()), Some(2));

        let mut dave = CustomerRecord::new(store_id, "dave", "dave@x.com");
        dave.total_spent = 900.0;
        store.upsert(dave);
        assert_eq!(engine.members(store_id, segment.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_criteria_creates_nothing() {
        let (_, engine, store_id) = setup();
        let mut req = request(false);
        req.criteria = CriteriaGroup::all(vec![]);
        let err = engine.create_segment(store_id, req).await.unwrap_err();
        assert!(err.is_validation());
        assert!(engine.list_segments(store_id).is_empty());
    }

    #[tokio::test]
    async fn test_store_outage_is_resolution_failure() {
        let (store, engine, store_id) = setup();
        store.set_available(false);
        let err = engine.evaluate(store_id, &big_spenders()).await.unwrap_err();
        assert!(matches!(err, CampaignError::ResolutionFailure(_)));
    }
}

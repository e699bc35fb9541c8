//! Segment builder — fluent API for constructing segment requests.

use chrono::{DateTime, Utc};

use crate::engine::{CreateSegmentRequest, SegmentType};
use crate::predicates::{
    CategoricalAttribute, CriteriaGroup, EngagementLevel, EngagementMetric, LogicalOperator,
    MembershipCondition, NumericAttribute, NumericCondition, Predicate, TemporalAttribute,
    TemporalCondition,
};

pub struct SegmentBuilder {
    name: String,
    description: Option<String>,
    segment_type: SegmentType,
    predicates: Vec<Predicate>,
    groups: Vec<CriteriaGroup>,
    operator: LogicalOperator,
    is_dynamic: bool,
}

impl SegmentBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            segment_type: SegmentType::Custom,
            predicates: Vec::new(),
            groups: Vec::new(),
            operator: LogicalOperator::And,
            is_dynamic: true,
        }
    }

    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    pub fn segment_type(mut self, st: SegmentType) -> Self {
        self.segment_type = st;
        self
    }

    pub fn with_or(mut self) -> Self {
        self.operator = LogicalOperator::Or;
        self
    }

    /// Freeze membership at creation instead of re-evaluating on every read.
    pub fn static_snapshot(mut self) -> Self {
        self.is_dynamic = false;
        self
    }

    pub fn numeric(mut self, attribute: NumericAttribute, condition: NumericCondition) -> Self {
        self.predicates.push(Predicate::Numeric {
            attribute,
            condition,
        });
        self
    }

    pub fn spent_more_than(self, value: f64) -> Self {
        self.numeric(
            NumericAttribute::TotalSpent,
            NumericCondition::GreaterThan { value },
        )
    }

    pub fn orders_between(self, min: u32, max: u32) -> Self {
        self.numeric(
            NumericAttribute::OrderCount,
            NumericCondition::Between {
                min: f64::from(min),
                max: f64::from(max),
            },
        )
    }

    pub fn purchased_within_days(mut self, days: u32) -> Self {
        self.predicates.push(Predicate::Temporal {
            attribute: TemporalAttribute::LastPurchase,
            condition: TemporalCondition::WithinDays { days },
        });
        self
    }

    pub fn inactive_for_days(mut self, days: u32) -> Self {
        self.predicates.push(Predicate::Temporal {
            attribute: TemporalAttribute::LastPurchase,
            condition: TemporalCondition::MoreThanDays { days },
        });
        self
    }

    pub fn signed_up_between(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.predicates.push(Predicate::Temporal {
            attribute: TemporalAttribute::SignedUp,
            condition: TemporalCondition::BetweenDates { start, end },
        });
        self
    }

    pub fn located_in<I, S>(mut self, locations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.predicates.push(Predicate::Membership {
            attribute: CategoricalAttribute::Location,
            condition: MembershipCondition::In {
                values: locations.into_iter().map(Into::into).collect(),
            },
        });
        self
    }

    pub fn not_in_country<I, S>(mut self, countries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.predicates.push(Predicate::Membership {
            attribute: CategoricalAttribute::Country,
            condition: MembershipCondition::NotIn {
                values: countries.into_iter().map(Into::into).collect(),
            },
        });
        self
    }

    pub fn engagement(mut self, metric: EngagementMetric, level: EngagementLevel) -> Self {
        self.predicates.push(Predicate::Engagement { metric, level });
        self
    }

    pub fn group(mut self, group: CriteriaGroup) -> Self {
        self.groups.push(group);
        self
    }

    pub fn criteria(&self) -> CriteriaGroup {
        CriteriaGroup {
            operator: self.operator,
            predicates: self.predicates.clone(),
            groups: self.groups.clone(),
        }
    }

    pub fn build(self) -> CreateSegmentRequest {
        let criteria = self.criteria();
        CreateSegmentRequest {
            name: self.name,
            description: self.description,
            segment_type: self.segment_type,
            criteria,
            is_dynamic: self.is_dynamic,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_collects_predicates() {
        let req = SegmentBuilder::new("Lapsed VIPs")
            .segment_type(SegmentType::Behavioral)
            .spent_more_than(1000.0)
            .inactive_for_days(90)
            .static_snapshot()
            .build();
        assert_eq!(req.criteria.predicates.len(), 2);
        assert_eq!(req.criteria.operator, LogicalOperator::And);
        assert!(!req.is_dynamic);
        assert!(req.criteria.validate().is_ok());
    }

    #[test]
    fn test_builder_without_predicates_fails_validation() {
        let req = SegmentBuilder::new("Nobody").with_or().build();
        assert!(req.criteria.validate().is_err());
    }
}

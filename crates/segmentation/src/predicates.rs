//! Criteria types, validation and evaluation logic for segment predicates.
//!
//! Bounds of `between` and `between_dates` are inclusive at both ends.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use campaign_core::{CampaignError, CampaignResult};

use crate::computed::CustomerFacts;

/// Engagement thresholds. Fixed so repeated evaluations are deterministic.
pub const HIGH_OPEN_RATE: f64 = 0.25;
pub const MEDIUM_OPEN_RATE: f64 = 0.10;
pub const HIGH_CLICK_RATE: f64 = 0.05;
pub const MEDIUM_CLICK_RATE: f64 = 0.02;

const NUMERIC_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriteriaGroup {
    #[serde(default)]
    pub operator: LogicalOperator,
    #[serde(default)]
    pub predicates: Vec<Predicate>,
    #[serde(default)]
    pub groups: Vec<CriteriaGroup>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalOperator {
    #[default]
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Predicate {
    Numeric {
        attribute: NumericAttribute,
        condition: NumericCondition,
    },
    Temporal {
        attribute: TemporalAttribute,
        condition: TemporalCondition,
    },
    Membership {
        attribute: CategoricalAttribute,
        condition: MembershipCondition,
    },
    Engagement {
        metric: EngagementMetric,
        level: EngagementLevel,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumericAttribute {
    TotalSpent,
    OrderCount,
    AverageOrderValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "operator")]
pub enum NumericCondition {
    GreaterThan { value: f64 },
    LessThan { value: f64 },
    Equals { value: f64 },
    Between { min: f64, max: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemporalAttribute {
    LastPurchase,
    SignedUp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "operator")]
pub enum TemporalCondition {
    /// `ts >= now - days`.
    WithinDays { days: u32 },
    /// `ts < now - days`.
    MoreThanDays { days: u32 },
    BetweenDates {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoricalAttribute {
    Location,
    Country,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "operator")]
pub enum MembershipCondition {
    In { values: Vec<String> },
    NotIn { values: Vec<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngagementMetric {
    OpenRate,
    ClickRate,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngagementLevel {
    High,
    Medium,
    Low,
}

impl EngagementLevel {
    pub fn for_open_rate(rate: f64) -> Self {
        if rate >= HIGH_OPEN_RATE {
            Self::High
        } else if rate >= MEDIUM_OPEN_RATE {
            Self::Medium
        } else {
            Self::Low
        }
    }

    pub fn for_click_rate(rate: f64) -> Self {
        if rate >= HIGH_CLICK_RATE {
            Self::High
        } else if rate >= MEDIUM_CLICK_RATE {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

impl CriteriaGroup {
    pub fn all(predicates: Vec<Predicate>) -> Self {
        Self {
            operator: LogicalOperator::And,
            predicates,
            groups: Vec::new(),
        }
    }

    pub fn any(predicates: Vec<Predicate>) -> Self {
        Self {
            operator: LogicalOperator::Or,
            predicates,
            groups: Vec::new(),
        }
    }

    /// Parses and validates criteria from JSON. Missing operator fields are
    /// reported as validation errors.
    pub fn from_json(value: serde_json::Value) -> CampaignResult<Self> {
        let group: CriteriaGroup = serde_json::from_value(value)
            .map_err(|e| CampaignError::validation(format!("malformed criteria: {e}")))?;
        group.validate()?;
        Ok(group)
    }

    /// Rejects criteria that cannot be evaluated unambiguously.
    pub fn validate(&self) -> CampaignResult<()> {
        if self.predicates.is_empty() && self.groups.is_empty() {
            return Err(CampaignError::validation("criteria group is empty"));
        }
        for predicate in &self.predicates {
            predicate.validate()?;
        }
        for group in &self.groups {
            group.validate()?;
        }
        Ok(())
    }

    pub fn matches(&self, facts: &CustomerFacts<'_>, now: DateTime<Utc>) -> bool {
        match self.operator {
            LogicalOperator::And => {
                self.predicates.iter().all(|p| p.matches(facts, now))
                    && self.groups.iter().all(|g| g.matches(facts, now))
            }
            LogicalOperator::Or => {
                self.predicates.iter().any(|p| p.matches(facts, now))
                    || self.groups.iter().any(|g| g.matches(facts, now))
            }
        }
    }
}

impl Predicate {
    pub fn validate(&self) -> CampaignResult<()> {
        match self {
            Predicate::Numeric { attribute, condition } => match condition {
                NumericCondition::GreaterThan { value }
                | NumericCondition::LessThan { value }
                | NumericCondition::Equals { value } => check_finite(*attribute, *value),
                NumericCondition::Between { min, max } => {
                    check_finite(*attribute, *min)?;
                    check_finite(*attribute, *max)?;
                    if min > max {
                        return Err(CampaignError::validation(format!(
                            "{attribute:?} between has min {min} greater than max {max}"
                        )));
                    }
                    Ok(())
                }
            },
            Predicate::Temporal { condition, .. } => match condition {
                TemporalCondition::BetweenDates { start, end } if start > end => Err(
                    CampaignError::validation(format!("between_dates start {start} is after end {end}")),
                ),
                _ => Ok(()),
            },
            Predicate::Membership { attribute, condition } => {
                let values = match condition {
                    MembershipCondition::In { values } | MembershipCondition::NotIn { values } => {
                        values
                    }
                };
                if values.is_empty() {
                    return Err(CampaignError::validation(format!(
                        "{attribute:?} membership list is empty"
                    )));
                }
                if values.iter().any(|v| v.trim().is_empty()) {
                    return Err(CampaignError::validation(format!(
                        "{attribute:?} membership list contains a blank value"
                    )));
                }
                Ok(())
            }
            Predicate::Engagement { .. } => Ok(()),
        }
    }

    pub fn matches(&self, facts: &CustomerFacts<'_>, now: DateTime<Utc>) -> bool {
        match self {
            Predicate::Numeric { attribute, condition } => {
                compare_number(facts.numeric(*attribute), condition)
            }
            Predicate::Temporal { attribute, condition } => facts
                .timestamp(*attribute)
                .map(|ts| compare_timestamp(ts, condition, now))
                .unwrap_or(false),
            Predicate::Membership { attribute, condition } => {
                let actual = facts.category(*attribute);
                match condition {
                    MembershipCondition::In { values } => {
                        actual.map_or(false, |a| contains_ignore_case(values, a))
                    }
                    MembershipCondition::NotIn { values } => {
                        actual.map_or(true, |a| !contains_ignore_case(values, a))
                    }
                }
            }
            Predicate::Engagement { metric, level } => {
                let open = EngagementLevel::for_open_rate(facts.record.open_rate);
                let click = EngagementLevel::for_click_rate(facts.record.click_rate);
                match metric {
                    EngagementMetric::OpenRate => open == *level,
                    EngagementMetric::ClickRate => click == *level,
                    EngagementMetric::Both => open == *level && click == *level,
                }
            }
        }
    }
}

fn check_finite(attribute: NumericAttribute, value: f64) -> CampaignResult<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(CampaignError::validation(format!(
            "{attribute:?} comparison value must be a finite number"
        )))
    }
}

pub fn compare_number(actual: f64, condition: &NumericCondition) -> bool {
    match condition {
        NumericCondition::GreaterThan { value } => actual > *value,
        NumericCondition::LessThan { value } => actual < *value,
        NumericCondition::Equals { value } => (actual - value).abs() < NUMERIC_EPSILON,
        NumericCondition::Between { min, max } => actual >= *min && actual <= *max,
    }
}

pub fn compare_timestamp(
    ts: DateTime<Utc>,
    condition: &TemporalCondition,
    now: DateTime<Utc>,
) -> bool {
    match condition {
        TemporalCondition::WithinDays { days } => ts >= now - Duration::days(i64::from(*days)),
        TemporalCondition::MoreThanDays { days } => ts < now - Duration::days(i64::from(*days)),
        TemporalCondition::BetweenDates { start, end } => ts >= *start && ts <= *end,
    }
}

fn contains_ignore_case(values: &[String], actual: &str) -> bool {
    values.iter().any(|v| v.trim().eq_ignore_ascii_case(actual.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use campaign_core::CustomerRecord;
    use uuid::Uuid;

    fn customer(spent: f64, orders: u32) -> CustomerRecord {
        let mut c = CustomerRecord::new(Uuid::nil(), "c", "c@example.com");
        c.total_spent = spent;
        c.order_count = orders;
        c
    }

    fn spent(condition: NumericCondition) -> Predicate {
        Predicate::Numeric {
            attribute: NumericAttribute::TotalSpent,
            condition,
        }
    }

    #[test]
    fn test_between_is_inclusive() {
        let c = customer(100.0, 1);
        let facts = CustomerFacts::new(&c);
        let now = Utc::now();
        assert!(spent(NumericCondition::Between { min: 100.0, max: 200.0 }).matches(&facts, now));
        assert!(spent(NumericCondition::Between { min: 50.0, max: 100.0 }).matches(&facts, now));
        assert!(!spent(NumericCondition::Between { min: 100.5, max: 200.0 }).matches(&facts, now));
    }

    #[test]
    fn test_within_days_includes_day_n() {
        let now = Utc::now();
        let mut c = customer(0.0, 0);
        c.last_purchase_at = Some(now - Duration::days(7));
        let facts = CustomerFacts::new(&c);
        let within = Predicate::Temporal {
            attribute: TemporalAttribute::LastPurchase,
            condition: TemporalCondition::WithinDays { days: 7 },
        };
        let more_than = Predicate::Temporal {
            attribute: TemporalAttribute::LastPurchase,
            condition: TemporalCondition::MoreThanDays { days: 7 },
        };
        assert!(within.matches(&facts, now));
        assert!(!more_than.matches(&facts, now));
        // One second later the purchase is outside the window.
        assert!(!within.matches(&facts, now + Duration::seconds(1)));
        assert!(more_than.matches(&facts, now + Duration::seconds(1)));
    }

    #[test]
    fn test_missing_timestamp_never_matches() {
        let c = customer(0.0, 0);
        let facts = CustomerFacts::new(&c);
        let p = Predicate::Temporal {
            attribute: TemporalAttribute::SignedUp,
            condition: TemporalCondition::MoreThanDays { days: 1 },
        };
        assert!(!p.matches(&facts, Utc::now()));
    }

    #[test]
    fn test_membership_case_insensitive_and_missing() {
        let mut c = customer(0.0, 0);
        c.location = Some("Berlin".into());
        let facts = CustomerFacts::new(&c);
        let now = Utc::now();
        let in_list = Predicate::Membership {
            attribute: CategoricalAttribute::Location,
            condition: MembershipCondition::In {
                values: vec!["berlin".into(), "Paris".into()],
            },
        };
        assert!(in_list.matches(&facts, now));

        let nowhere = customer(0.0, 0);
        let facts = CustomerFacts::new(&nowhere);
        assert!(!in_list.matches(&facts, now));
        let not_in = Predicate::Membership {
            attribute: CategoricalAttribute::Location,
            condition: MembershipCondition::NotIn {
                values: vec!["Berlin".into()],
            },
        };
        assert!(not_in.matches(&facts, now));
    }

    #[test]
    fn test_engagement_thresholds() {
        assert_eq!(EngagementLevel::for_open_rate(0.25), EngagementLevel::High);
        assert_eq!(EngagementLevel::for_open_rate(0.10), EngagementLevel::Medium);
        assert_eq!(EngagementLevel::for_open_rate(0.0999), EngagementLevel::Low);
        assert_eq!(EngagementLevel::for_click_rate(0.05), EngagementLevel::High);
        assert_eq!(EngagementLevel::for_click_rate(0.02), EngagementLevel::Medium);
        assert_eq!(EngagementLevel::for_click_rate(0.01), EngagementLevel::Low);

        let mut c = customer(0.0, 0);
        c.open_rate = 0.30;
        c.click_rate = 0.01;
        let facts = CustomerFacts::new(&c);
        let both_high = Predicate::Engagement {
            metric: EngagementMetric::Both,
            level: EngagementLevel::High,
        };
        let open_high = Predicate::Engagement {
            metric: EngagementMetric::OpenRate,
            level: EngagementLevel::High,
        };
        assert!(!both_high.matches(&facts, Utc::now()));
        assert!(open_high.matches(&facts, Utc::now()));
    }

    #[test]
    fn test_or_group_with_nested_and() {
        let c = customer(50.0, 5);
        let facts = CustomerFacts::new(&c);
        let group = CriteriaGroup {
            operator: LogicalOperator::Or,
            predicates: vec![spent(NumericCondition::GreaterThan { value: 500.0 })],
            groups: vec![CriteriaGroup::all(vec![Predicate::Numeric {
                attribute: NumericAttribute::OrderCount,
                condition: NumericCondition::Equals { value: 5.0 },
            }])],
        };
        assert!(group.matches(&facts, Utc::now()));
    }

    #[test]
    fn test_validation_rejects_empty_and_inverted() {
        let empty = CriteriaGroup::all(vec![]);
        assert!(empty.validate().unwrap_err().is_validation());

        let inverted = CriteriaGroup::all(vec![spent(NumericCondition::Between {
            min: 10.0,
            max: 1.0,
        })]);
        assert!(inverted.validate().is_err());

        let nan = CriteriaGroup::all(vec![spent(NumericCondition::GreaterThan { value: f64::NAN })]);
        assert!(nan.validate().is_err());

        let blank = CriteriaGroup::all(vec![Predicate::Membership {
            attribute: CategoricalAttribute::Country,
            condition: MembershipCondition::In { values: vec![] },
        }]);
        assert!(blank.validate().is_err());
    }

    #[test]
    fn test_from_json_missing_operator_fields() {
        let missing_value = serde_json::json!({
            "predicates": [{
                "kind": "numeric",
                "attribute": "total_spent",
                "condition": {"operator": "greater_than"}
            }]
        });
        let err = CriteriaGroup::from_json(missing_value).unwrap_err();
        assert!(err.is_validation());

        let ok = serde_json::json!({
            "operator": "and",
            "predicates": [{
                "kind": "numeric",
                "attribute": "total_spent",
                "condition": {"operator": "greater_than", "value": 500}
            }]
        });
        let group = CriteriaGroup::from_json(ok).unwrap();
        assert_eq!(group.predicates.len(), 1);
    }
}

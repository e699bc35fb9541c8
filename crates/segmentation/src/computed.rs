//! Computed properties — attributes derived from a customer's raw aggregates.

use chrono::{DateTime, Utc};

use campaign_core::CustomerRecord;

use crate::predicates::{CategoricalAttribute, NumericAttribute, TemporalAttribute};

/// A customer record plus the attributes derived from it.
#[derive(Debug, Clone, Copy)]
pub struct CustomerFacts<'a> {
    pub record: &'a CustomerRecord,
    pub average_order_value: f64,
}

impl<'a> CustomerFacts<'a> {
    pub fn new(record: &'a CustomerRecord) -> Self {
        Self {
            record,
            average_order_value: average_order_value(record),
        }
    }

    pub fn numeric(&self, attribute: NumericAttribute) -> f64 {
        match attribute {
            NumericAttribute::TotalSpent => self.record.total_spent,
            NumericAttribute::OrderCount => f64::from(self.record.order_count),
            NumericAttribute::AverageOrderValue => self.average_order_value,
        }
    }

    pub fn timestamp(&self, attribute: TemporalAttribute) -> Option<DateTime<Utc>> {
        match attribute {
            TemporalAttribute::LastPurchase => self.record.last_purchase_at,
            TemporalAttribute::SignedUp => self.record.signed_up_at,
        }
    }

    pub fn category(&self, attribute: CategoricalAttribute) -> Option<&'a str> {
        match attribute {
            CategoricalAttribute::Location => self.record.location.as_deref(),
            CategoricalAttribute::Country => self.record.country.as_deref(),
        }
    }
}

/// `total_spent / order_count`, or 0 for customers without orders.
pub fn average_order_value(record: &CustomerRecord) -> f64 {
    if record.order_count == 0 {
        0.0
    } else {
        record.total_spent / f64::from(record.order_count)
    }
}

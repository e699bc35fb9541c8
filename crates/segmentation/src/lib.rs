//! Segment evaluation — typed customer criteria, derived attributes, and
//! static/dynamic segment membership.

pub mod builder;
pub mod computed;
pub mod engine;
pub mod predicates;

pub use builder::SegmentBuilder;
pub use computed::CustomerFacts;
pub use engine::{
    match_records, CreateSegmentRequest, Segment, SegmentType, SegmentationEngine,
    UpdateSegmentRequest,
};
pub use predicates::CriteriaGroup;

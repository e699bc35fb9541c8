//! Outreach engine — wires segmentation, campaign management, delivery
//! tracking, recovery and analytics behind one store-scoped facade, plus the
//! background scheduler loop.

pub mod engine;
pub mod scheduler;

pub use engine::{EngineTick, OutreachEngine};
pub use scheduler::SchedulerLoop;

//! Cart recovery — delayed, multi-step follow-up sequences for abandoned
//! carts and browse sessions.

pub mod engine;
pub mod evaluator;
pub mod state_machine;
pub mod types;

pub use engine::RecoveryScheduler;
pub use evaluator::{RecoveryEvaluator, SkipReason, StepDecision};
pub use state_machine::{check_transition, EnrollmentTrigger};
pub use types::{
    AbandonedCart, AbandonmentOutcome, AbandonmentRequest, CartItem, CreateSequenceRequest,
    DiscountOffer, Enrollment, EnrollmentStatus, RecoverySequence, RecoveryStats, RecoveryStep,
    RecoveryTrigger, TickReport,
};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::state_machine::EnrollmentTrigger;
use crate::types::{Enrollment, EnrollmentStatus, RecoverySequence};

/// Why a due step advances without being sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyDispatched,
    OfferAlreadyIssued,
}

/// What a tick should do with an enrollment right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepDecision {
    /// Not active, or a step is already claimed.
    Idle,
    Wait { due_at: DateTime<Utc> },
    Complete(EnrollmentTrigger),
    Skip { step: usize, reason: SkipReason },
    Dispatch { step: usize },
}

/// Decides the next move for an enrollment against its sequence and cart.
#[derive(Debug, Clone, Default)]
pub struct RecoveryEvaluator;

impl RecoveryEvaluator {
    pub fn new() -> Self {
        Self
    }

    pub fn evaluate(
        &self,
        enrollment: &Enrollment,
        sequence: &RecoverySequence,
        cart_recovered: bool,
        now: DateTime<Utc>,
    ) -> StepDecision {
        if enrollment.status != EnrollmentStatus::Active || enrollment.in_flight_step.is_some() {
            return StepDecision::Idle;
        }
        let Some(step) = sequence.steps.get(enrollment.current_step) else {
            return StepDecision::Complete(EnrollmentTrigger::SequenceFinished);
        };

        let due_at = step_due_at(enrollment.enrolled_at, step.delay_secs);
        if now < due_at {
            return StepDecision::Wait { due_at };
        }
        if cart_recovered {
            debug!(enrollment_id = %enrollment.id, "Cart recovered before step was due");
            return StepDecision::Complete(EnrollmentTrigger::CartRecovered);
        }
        match self.skip_reason(enrollment, sequence) {
            Some(reason) => StepDecision::Skip {
                step: enrollment.current_step,
                reason,
            },
            None => StepDecision::Dispatch {
                step: enrollment.current_step,
            },
        }
    }

    /// A step is never sent twice, and an offer never issued twice.
    pub fn skip_reason(
        &self,
        enrollment: &Enrollment,
        sequence: &RecoverySequence,
    ) -> Option<SkipReason> {
        let index = enrollment.current_step;
        let step = sequence.steps.get(index)?;
        if enrollment.dispatched_steps.contains(&index) {
            Some(SkipReason::AlreadyDispatched)
        } else if step.offer.is_some() && enrollment.offer_issued_at.is_some() {
            Some(SkipReason::OfferAlreadyIssued)
        } else {
            None
        }
    }
}

/// Delays past a century are treated as a century.
const MAX_DELAY_SECS: u64 = 100 * 365 * 24 * 3600;

pub fn step_due_at(enrolled_at: DateTime<Utc>, delay_secs: u64) -> DateTime<Utc> {
    enrolled_at + Duration::seconds(delay_secs.min(MAX_DELAY_SECS) as i64)
}

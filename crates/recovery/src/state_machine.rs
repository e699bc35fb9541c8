use serde::{Deserialize, Serialize};

use campaign_core::{CampaignError, CampaignResult};

use crate::types::EnrollmentStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentTrigger {
    Pause,
    Resume,
    Unsubscribe,
    SequenceFinished,
    CartRecovered,
    DispatchFailed,
    Restart,
}

impl EnrollmentTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Unsubscribe => "unsubscribe",
            Self::SequenceFinished => "sequence_finished",
            Self::CartRecovered => "cart_recovered",
            Self::DispatchFailed => "dispatch_failed",
            Self::Restart => "restart",
        }
    }
}

/// Describes a single valid state transition for an enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: EnrollmentStatus,
    pub to: EnrollmentStatus,
    pub trigger: EnrollmentTrigger,
}

const fn t(
    from: EnrollmentStatus,
    to: EnrollmentStatus,
    trigger: EnrollmentTrigger,
) -> StateTransition {
    StateTransition { from, to, trigger }
}

use EnrollmentStatus::*;
use EnrollmentTrigger::*;

/// Unsubscribed has no exits.
pub const TRANSITIONS: &[StateTransition] = &[
    // Active ->
    t(Active, Paused, Pause),
    t(Active, Completed, SequenceFinished),
    t(Active, Completed, CartRecovered),
    t(Active, Failed, DispatchFailed),
    t(Active, Unsubscribed, Unsubscribe),
    // Paused ->
    t(Paused, Active, Resume),
    t(Paused, Active, Restart),
    t(Paused, Unsubscribed, Unsubscribe),
    // Completed ->
    t(Completed, Active, Restart),
    t(Completed, Unsubscribed, Unsubscribe),
    // Failed ->
    t(Failed, Active, Restart),
    t(Failed, Unsubscribed, Unsubscribe),
];

pub fn check_transition(
    from: EnrollmentStatus,
    trigger: EnrollmentTrigger,
) -> CampaignResult<StateTransition> {
    TRANSITIONS
        .iter()
        .find(|tr| tr.from == from && tr.trigger == trigger)
        .copied()
        .ok_or_else(|| CampaignError::invalid_transition("enrollment", from, trigger.as_str()))
}

pub fn can_transition(from: EnrollmentStatus, to: EnrollmentStatus) -> bool {
    TRANSITIONS.iter().any(|tr| tr.from == from && tr.to == to)
}

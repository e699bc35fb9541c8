//! Campaign send lifecycle — the finite set of legal status transitions.

use serde::{Deserialize, Serialize};

use campaign_core::{CampaignError, CampaignResult};

use crate::models::CampaignStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignTrigger {
    Schedule,
    SendNow,
    ScheduleDue,
    Cancel,
    Pause,
    Resume,
    AllDispatched,
    ResolutionExhausted,
    NoRecipients,
}

impl CampaignTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Schedule => "schedule",
            Self::SendNow => "send_now",
            Self::ScheduleDue => "schedule_due",
            Self::Cancel => "cancel",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::AllDispatched => "all_dispatched",
            Self::ResolutionExhausted => "resolution_exhausted",
            Self::NoRecipients => "no_recipients",
        }
    }
}

/// One permitted transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: CampaignStatus,
    pub to: CampaignStatus,
    pub trigger: CampaignTrigger,
}

const fn t(from: CampaignStatus, to: CampaignStatus, trigger: CampaignTrigger) -> StateTransition {
    StateTransition { from, to, trigger }
}

use CampaignStatus::*;
use CampaignTrigger::*;

pub const TRANSITIONS: &[StateTransition] = &[
    // Draft ->
    t(Draft, Scheduled, Schedule),
    t(Draft, Sending, SendNow),
    t(Draft, Cancelled, Cancel),
    // Scheduled ->
    t(Scheduled, Sending, ScheduleDue),
    t(Scheduled, Cancelled, Cancel),
    t(Scheduled, Paused, ResolutionExhausted),
    t(Scheduled, Paused, NoRecipients),
    // Sending ->
    t(Sending, Sent, AllDispatched),
    t(Sending, Paused, Pause),
    t(Sending, Cancelled, Cancel),
    // Paused ->
    t(Paused, Sending, Resume),
    t(Paused, Cancelled, Cancel),
];

/// Returns the matching transition, or `InvalidTransition` without any
/// state having changed.
pub fn check_transition(
    from: CampaignStatus,
    trigger: CampaignTrigger,
) -> CampaignResult<StateTransition> {
    TRANSITIONS
        .iter()
        .find(|tr| tr.from == from && tr.trigger == trigger)
        .copied()
        .ok_or_else(|| CampaignError::invalid_transition("campaign", from, trigger.as_str()))
}

pub fn can_transition(from: CampaignStatus, to: CampaignStatus) -> bool {
    TRANSITIONS.iter().any(|tr| tr.from == from && tr.to == to)
}

use thiserror::Error;

pub type CampaignResult<T> = Result<T, CampaignError>;

#[derive(Error, Debug)]
pub enum CampaignError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed criteria or missing required fields. Raised before any state change.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Illegal lifecycle move. The entity keeps its current state.
    #[error("Invalid {entity} transition from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    /// Recipient or segment evaluation could not complete.
    #[error("Resolution failure: {0}")]
    ResolutionFailure(String),

    /// The transport rejected a single recipient.
    #[error("Delivery failure for {recipient}: {reason}")]
    DeliveryFailure { recipient: String, reason: String },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CampaignError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn invalid_transition(
        entity: &'static str,
        from: impl ToString,
        to: impl ToString,
    ) -> Self {
        Self::InvalidTransition {
            entity,
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, Self::InvalidTransition { .. })
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_message() {
        let err = CampaignError::invalid_transition("campaign", "sent", "sending");
        assert!(err.is_invalid_transition());
        assert_eq!(err.to_string(), "Invalid campaign transition from sent to sending");
    }

    #[test]
    fn test_not_found_message() {
        let err = CampaignError::not_found("segment", "abc");
        assert_eq!(err.to_string(), "segment abc not found");
    }
}

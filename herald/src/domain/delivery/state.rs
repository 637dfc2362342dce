//! Delivery record state machine.

use serde::{Deserialize, Serialize};

use crate::Error;

/// Delivery record states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    /// Created, not yet handed to a provider.
    #[default]
    Pending,
    /// Claimed by a worker. Covers in-flight calls, scheduled retries and
    /// submissions awaiting provider confirmation.
    InProgress,
    /// Provider confirmed delivery.
    Success,
    /// Terminal failure or retries exhausted.
    Failed,
    /// Provider reported the recipient address as undeliverable.
    Bounced,
    /// Cancelled before reaching a terminal provider outcome.
    Cancelled,
    /// Dropped by the preference gate.
    Skipped,
}

impl DeliveryStatus {
    /// Convert to database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Bounced => "BOUNCED",
            Self::Cancelled => "CANCELLED",
            Self::Skipped => "SKIPPED",
        }
    }

    /// Parse from database string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "IN_PROGRESS" => Some(Self::InProgress),
            "SUCCESS" => Some(Self::Success),
            "FAILED" => Some(Self::Failed),
            "BOUNCED" => Some(Self::Bounced),
            "CANCELLED" => Some(Self::Cancelled),
            "SKIPPED" => Some(Self::Skipped),
            _ => None,
        }
    }

    /// All states, in lifecycle order.
    pub fn all() -> [DeliveryStatus; 7] {
        [
            Self::Pending,
            Self::InProgress,
            Self::Success,
            Self::Failed,
            Self::Bounced,
            Self::Cancelled,
            Self::Skipped,
        ]
    }

    /// Terminal states accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::InProgress)
    }

    /// Validate a state transition.
    pub fn can_transition_to(&self, target: DeliveryStatus) -> bool {
        use DeliveryStatus::*;

        match (self, target) {
            // Deferral keeps a pending record pending
            (Pending, Pending | InProgress | Failed | Skipped | Cancelled) => true,

            // Resume, retry scheduling and confirmation polling stay in progress
            (InProgress, InProgress | Success | Failed | Bounced | Cancelled) => true,

            _ => false,
        }
    }

    /// Attempt to transition to a new state.
    pub fn transition_to(&self, target: DeliveryStatus) -> Result<DeliveryStatus, Error> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(Error::InvalidStateTransition {
                from: self.as_str().to_string(),
                to: target.as_str().to_string(),
            })
        }
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_str() {
        for status in DeliveryStatus::all() {
            assert_eq!(DeliveryStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(DeliveryStatus::parse("pending"), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!DeliveryStatus::Pending.is_terminal());
        assert!(!DeliveryStatus::InProgress.is_terminal());
        assert!(DeliveryStatus::Success.is_terminal());
        assert!(DeliveryStatus::Failed.is_terminal());
        assert!(DeliveryStatus::Bounced.is_terminal());
        assert!(DeliveryStatus::Cancelled.is_terminal());
        assert!(DeliveryStatus::Skipped.is_terminal());
    }

    #[test]
    fn test_terminal_states_reject_every_transition() {
        for from in DeliveryStatus::all().into_iter().filter(|s| s.is_terminal()) {
            for to in DeliveryStatus::all() {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_valid_transitions() {
        assert!(DeliveryStatus::Pending.can_transition_to(DeliveryStatus::InProgress));
        assert!(DeliveryStatus::Pending.can_transition_to(DeliveryStatus::Skipped));
        assert!(DeliveryStatus::InProgress.can_transition_to(DeliveryStatus::Success));
        assert!(DeliveryStatus::InProgress.can_transition_to(DeliveryStatus::Bounced));
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!DeliveryStatus::Pending.can_transition_to(DeliveryStatus::Success));
        assert!(!DeliveryStatus::Pending.can_transition_to(DeliveryStatus::Bounced));
        assert!(!DeliveryStatus::InProgress.can_transition_to(DeliveryStatus::Pending));
        assert!(!DeliveryStatus::InProgress.can_transition_to(DeliveryStatus::Skipped));
    }

    #[test]
    fn test_transition_to_error() {
        let err = DeliveryStatus::Success
            .transition_to(DeliveryStatus::InProgress)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
        assert!(err.to_string().contains("SUCCESS"));
    }
}

use serde::{Deserialize, Serialize};
use switchboard_traits::ChannelError;

/// Lifecycle state of a dispatch operation.
///
/// Ordered: an operation only ever moves forward through
/// `Preparing < Pending < Approving < Dispatching < Claimed`.
/// `Invalidated` can be entered from any state and is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Preparing,
    Pending,
    Approving,
    Dispatching,
    Claimed,
    Invalidated,
}

impl OperationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Preparing => "preparing",
            Self::Pending => "pending",
            Self::Approving => "approving",
            Self::Dispatching => "dispatching",
            Self::Claimed => "claimed",
            Self::Invalidated => "invalidated",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Claimed | Self::Invalidated)
    }
}

impl std::fmt::Display for OperationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event emitted by a single dispatch operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationEvent {
    /// Reached PENDING; handlers may inspect the operation.
    Ready,
    /// Left APPROVING through `approve()`.
    Approved,
    Claimed,
    Invalidated(ChannelError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_order() {
        assert!(OperationState::Preparing < OperationState::Pending);
        assert!(OperationState::Pending < OperationState::Approving);
        assert!(OperationState::Approving < OperationState::Dispatching);
        assert!(OperationState::Dispatching < OperationState::Claimed);
    }

    #[test]
    fn test_terminal_states() {
        assert!(OperationState::Claimed.is_terminal());
        assert!(OperationState::Invalidated.is_terminal());
        assert!(!OperationState::Dispatching.is_terminal());
    }
}

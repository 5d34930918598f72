// src/engine/state.rs
use std::fmt;

/// Lifecycle of a mining session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MiningState {
    Stopped,
    Starting,
    Mining,
    /// Held by the user or by battery protection
    Paused,
    /// Held by thermal protection until the cooldown runs out
    Throttled,
    /// Terminal until the session is stopped and started again
    Error(String),
}

impl MiningState {
    /// True while workers exist, whether hashing or held
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            MiningState::Mining | MiningState::Paused | MiningState::Throttled
        )
    }

    /// Whether the orchestrator may move from `self` to `next`
    ///
    /// Stopping and failing are allowed from anywhere. A cooldown that
    /// ends while another hold is active lands in `Paused`.
    pub fn can_transition_to(&self, next: &MiningState) -> bool {
        use MiningState::*;
        match (self, next) {
            (_, Stopped) | (_, Error(_)) => true,
            (Stopped, Starting) | (Starting, Mining) => true,
            (Mining, Paused) | (Paused, Mining) => true,
            (Mining, Throttled) | (Throttled, Mining) | (Throttled, Paused) => true,
            _ => false,
        }
    }
}

impl fmt::Display for MiningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MiningState::Stopped => write!(f, "stopped"),
            MiningState::Starting => write!(f, "starting"),
            MiningState::Mining => write!(f, "mining"),
            MiningState::Paused => write!(f, "paused"),
            MiningState::Throttled => write!(f, "throttled"),
            MiningState::Error(reason) => write!(f, "error ({})", reason),
        }
    }
}

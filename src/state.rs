use std::fmt;

/// Per-pair monitoring state.
///
/// Both the periodic scan and the event-driven fast path drive the same
/// transitions, guarded by a compare-and-swap on the tracked entry, so a
/// pair can never be terminated twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PairState {
    /// Both processes last observed alive.
    Active = 0,
    /// Main gone; a termination attempt on the child is in flight.
    Terminating = 1,
    /// Terminal; the pair has been dropped from the tracked set.
    Removed = 2,
}

impl PairState {
    pub(crate) fn from_u8(raw: u8) -> PairState {
        match raw {
            0 => PairState::Active,
            1 => PairState::Terminating,
            _ => PairState::Removed,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == PairState::Removed
    }

    pub(crate) fn can_transition_to(self, next: PairState) -> bool {
        use PairState::*;
        matches!(
            (self, next),
            (Active, Terminating)
                | (Active, Removed)
                // Termination failed; retried on the next check.
                | (Terminating, Active)
                | (Terminating, Removed)
        )
    }
}

impl fmt::Display for PairState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PairState::Active => write!(f, "active"),
            PairState::Terminating => write!(f, "terminating"),
            PairState::Removed => write!(f, "removed"),
        }
    }
}

use serde::Serialize;

use crate::state::SharedPhase;

/// Shared session phase as exposed to the UI.
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum VisibleSharedPhase {
    /// Waiting room.
    Waiting,
    /// A round is being played.
    Playing {
        /// Current round, 1-based.
        round: u32,
        /// Total rounds of the session.
        total: u32,
    },
    /// Session over.
    Finished,
}

impl From<&SharedPhase> for VisibleSharedPhase {
    fn from(value: &SharedPhase) -> Self {
        match value {
            SharedPhase::Waiting => VisibleSharedPhase::Waiting,
            SharedPhase::Playing { round, total } => VisibleSharedPhase::Playing {
                round: *round,
                total: *total,
            },
            SharedPhase::Finished => VisibleSharedPhase::Finished,
        }
    }
}

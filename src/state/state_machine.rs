use std::time::Instant;

use thiserror::Error;
use uuid::Uuid;

use crate::dao::models::SessionStatus;
use crate::state::session::Session;

/// Phase of a session as observed collectively by every client through the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharedPhase {
    /// Lobby: players join, nothing is being played yet.
    Waiting,
    /// Rounds are being played.
    Playing {
        /// Current round, 1-based.
        round: u32,
        /// Fixed number of rounds of the session.
        total: u32,
    },
    /// Terminal phase.
    Finished,
}

impl SharedPhase {
    /// Phase described by a session row.
    pub fn of(session: &Session) -> Self {
        match session.status {
            SessionStatus::Waiting => SharedPhase::Waiting,
            SessionStatus::Playing => SharedPhase::Playing {
                round: session.current_round,
                total: session.total_rounds,
            },
            SessionStatus::Finished => SharedPhase::Finished,
        }
    }

    /// Ordering key: status first, then round.
    fn rank(&self) -> (u8, u32) {
        match self {
            SharedPhase::Waiting => (0, 0),
            SharedPhase::Playing { round, .. } => (1, *round),
            SharedPhase::Finished => (2, 0),
        }
    }

    /// Whether moving from `self` to `next` goes forward.
    pub fn precedes(&self, next: &SharedPhase) -> bool {
        self.rank() < next.rank()
    }
}

/// Host-driven events that move the shared phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharedEvent {
    /// Host starts the game.
    Start,
    /// Host moves on to the next round.
    AdvanceRound,
    /// Any participant ends the session.
    Finish,
}

/// Error returned when attempting to apply an invalid transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition: {event:?} cannot be applied while in {from:?}")]
pub struct InvalidTransition {
    /// The phase the state machine was in when the invalid event was received.
    pub from: SharedPhase,
    /// The event that cannot be applied from this phase.
    pub event: SharedEvent,
}

/// Errors that can occur when planning a state machine transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    /// A transition is already pending and must be applied or aborted.
    AlreadyPending,
    /// The requested transition is not valid from the current phase.
    InvalidTransition(InvalidTransition),
}

/// Errors that can occur when applying a planned state machine transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    /// No transition is currently pending.
    NoPending,
    /// Plan ID does not match the pending plan.
    IdMismatch {
        /// Expected plan ID.
        expected: PlanId,
        /// Provided plan ID.
        got: PlanId,
    },
    /// A remote update moved the phase somewhere the plan did not lead.
    PhaseMismatch {
        /// Phase when plan was created.
        expected: SharedPhase,
        /// Current phase.
        actual: SharedPhase,
    },
}

/// Errors that can occur when aborting a planned state machine transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortError {
    /// No transition is currently pending.
    NoPending,
    /// Plan ID does not match the pending plan.
    IdMismatch {
        /// Expected plan ID.
        expected: PlanId,
        /// Provided plan ID.
        got: PlanId,
    },
}

/// Unique identifier for a planned state transition.
pub type PlanId = Uuid;

/// A planned transition that has been validated but not yet applied.
#[derive(Debug, Clone)]
pub struct Plan {
    /// Unique identifier for this plan.
    pub id: PlanId,
    /// Phase the state machine is currently in.
    pub from: SharedPhase,
    /// Phase the state machine will transition to.
    pub to: SharedPhase,
    /// Event that triggered this transition.
    pub event: SharedEvent,
    /// Timestamp when this plan was created.
    pub pending_since: Instant,
}

/// Snapshot of the current state machine state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Current phase of the state machine.
    pub phase: SharedPhase,
    /// Incremented on every applied transition or accepted remote update.
    pub version: usize,
    /// Pending transition phase, if a transition is planned but not yet applied.
    pub pending: Option<SharedPhase>,
}

/// Local mirror of the shared session phase.
///
/// Local writes go through plan/apply/abort. Remote observations go through
/// [`SharedPhaseMachine::reconcile`], which only ever moves forward.
#[derive(Debug, Clone)]
pub struct SharedPhaseMachine {
    phase: SharedPhase,
    total_rounds: u32,
    version: usize,
    pending: Option<Plan>,
}

impl SharedPhaseMachine {
    /// Machine for a fresh session in the waiting room.
    pub fn new(total_rounds: u32) -> Self {
        Self {
            phase: SharedPhase::Waiting,
            total_rounds,
            version: 0,
            pending: None,
        }
    }

    /// Machine mirroring an existing session.
    pub fn adopt(session: &Session) -> Self {
        Self {
            phase: SharedPhase::of(session),
            total_rounds: session.total_rounds,
            version: 0,
            pending: None,
        }
    }

    /// Inspect the current phase.
    pub fn phase(&self) -> SharedPhase {
        self.phase
    }

    /// Create a snapshot of the current state machine state.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            phase: self.phase,
            version: self.version,
            pending: self.pending.as_ref().map(|plan| plan.to),
        }
    }

    /// Plan a transition by validating that the event can be applied from the current phase.
    pub fn plan(&mut self, event: SharedEvent) -> Result<Plan, PlanError> {
        if self.pending.is_some() {
            return Err(PlanError::AlreadyPending);
        }

        let next = self
            .compute_transition(event)
            .map_err(PlanError::InvalidTransition)?;

        let plan = Plan {
            id: Uuid::new_v4(),
            from: self.phase,
            to: next,
            event,
            pending_since: Instant::now(),
        };

        self.pending = Some(plan.clone());

        Ok(plan)
    }

    /// Apply a planned transition. Succeeds as well when the remote echo of
    /// the same write was reconciled while the plan was pending.
    pub fn apply(&mut self, plan_id: PlanId) -> Result<SharedPhase, ApplyError> {
        let plan = self.pending.take().ok_or(ApplyError::NoPending)?;

        if plan.id != plan_id {
            let expected_plan_id = plan.id;
            self.pending = Some(plan);
            return Err(ApplyError::IdMismatch {
                expected: expected_plan_id,
                got: plan_id,
            });
        }

        if self.phase == plan.to {
            return Ok(self.phase);
        }

        if self.phase != plan.from {
            return Err(ApplyError::PhaseMismatch {
                expected: plan.from,
                actual: self.phase,
            });
        }

        self.phase = plan.to;
        self.version += 1;

        Ok(self.phase)
    }

    /// Abort a planned transition without applying it.
    pub fn abort(&mut self, plan_id: PlanId) -> Result<(), AbortError> {
        let plan = self.pending.as_ref().ok_or(AbortError::NoPending)?;

        if plan.id != plan_id {
            return Err(AbortError::IdMismatch {
                expected: plan.id,
                got: plan_id,
            });
        }

        self.pending = None;
        Ok(())
    }

    /// Fold a phase observed in the store into the machine. Returns `false`
    /// for stale or out-of-order observations, which are ignored.
    pub fn reconcile(&mut self, observed: SharedPhase) -> bool {
        if !self.phase.precedes(&observed) {
            return false;
        }
        if let SharedPhase::Playing { total, .. } = observed {
            self.total_rounds = total;
        }
        self.phase = observed;
        self.version += 1;
        true
    }

    fn compute_transition(&self, event: SharedEvent) -> Result<SharedPhase, InvalidTransition> {
        let next = match (self.phase, event) {
            (SharedPhase::Waiting, SharedEvent::Start) => SharedPhase::Playing {
                round: 1,
                total: self.total_rounds,
            },
            (SharedPhase::Playing { round, total }, SharedEvent::AdvanceRound) if round < total => {
                SharedPhase::Playing {
                    round: round + 1,
                    total,
                }
            }
            (SharedPhase::Waiting | SharedPhase::Playing { .. }, SharedEvent::Finish) => {
                SharedPhase::Finished
            }
            (from, event) => return Err(InvalidTransition { from, event }),
        };

        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(sm: &mut SharedPhaseMachine, event: SharedEvent) -> SharedPhase {
        let plan = sm.plan(event).unwrap();
        sm.apply(plan.id).unwrap()
    }

    #[test]
    fn initial_state_is_waiting() {
        let sm = SharedPhaseMachine::new(3);
        assert_eq!(sm.phase(), SharedPhase::Waiting);
    }

    #[test]
    fn full_happy_path_through_session() {
        let mut sm = SharedPhaseMachine::new(2);

        assert_eq!(
            apply(&mut sm, SharedEvent::Start),
            SharedPhase::Playing { round: 1, total: 2 }
        );
        assert_eq!(
            apply(&mut sm, SharedEvent::AdvanceRound),
            SharedPhase::Playing { round: 2, total: 2 }
        );
        assert_eq!(apply(&mut sm, SharedEvent::Finish), SharedPhase::Finished);
        assert_eq!(sm.snapshot().version, 3);
    }

    #[test]
    fn cannot_advance_past_last_round() {
        let mut sm = SharedPhaseMachine::new(1);
        apply(&mut sm, SharedEvent::Start);

        let err = sm.plan(SharedEvent::AdvanceRound).unwrap_err();
        assert_eq!(
            err,
            PlanError::InvalidTransition(InvalidTransition {
                from: SharedPhase::Playing { round: 1, total: 1 },
                event: SharedEvent::AdvanceRound,
            })
        );
    }

    #[test]
    fn finished_is_terminal() {
        let mut sm = SharedPhaseMachine::new(3);
        apply(&mut sm, SharedEvent::Finish);
        assert!(sm.plan(SharedEvent::Start).is_err());
        assert!(sm.plan(SharedEvent::Finish).is_err());
    }

    #[test]
    fn reconcile_ignores_stale_updates() {
        let mut sm = SharedPhaseMachine::new(5);
        assert!(sm.reconcile(SharedPhase::Playing { round: 3, total: 5 }));
        assert!(!sm.reconcile(SharedPhase::Playing { round: 2, total: 5 }));
        assert!(!sm.reconcile(SharedPhase::Waiting));
        assert!(!sm.reconcile(SharedPhase::Playing { round: 3, total: 5 }));
        assert_eq!(sm.phase(), SharedPhase::Playing { round: 3, total: 5 });
        assert!(sm.reconcile(SharedPhase::Finished));
        assert!(!sm.reconcile(SharedPhase::Playing { round: 4, total: 5 }));
    }

    #[test]
    fn apply_accepts_remote_echo() {
        let mut sm = SharedPhaseMachine::new(3);
        let plan = sm.plan(SharedEvent::Start).unwrap();
        assert!(sm.reconcile(SharedPhase::Playing { round: 1, total: 3 }));
        assert_eq!(
            sm.apply(plan.id).unwrap(),
            SharedPhase::Playing { round: 1, total: 3 }
        );
    }

    #[test]
    fn apply_rejects_diverged_phase() {
        let mut sm = SharedPhaseMachine::new(3);
        let plan = sm.plan(SharedEvent::Start).unwrap();
        assert!(sm.reconcile(SharedPhase::Finished));
        assert!(matches!(
            sm.apply(plan.id),
            Err(ApplyError::PhaseMismatch { .. })
        ));
    }

    #[test]
    fn abort_clears_pending() {
        let mut sm = SharedPhaseMachine::new(3);
        let plan = sm.plan(SharedEvent::Start).unwrap();
        assert_eq!(sm.plan(SharedEvent::Finish).unwrap_err(), PlanError::AlreadyPending);
        sm.abort(plan.id).unwrap();
        assert!(sm.pending.is_none());
        assert_eq!(sm.phase(), SharedPhase::Waiting);
    }
}

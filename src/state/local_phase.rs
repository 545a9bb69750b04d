use serde::Serialize;
use thiserror::Error;

/// Per-client presentation phase layered on top of the shared session phase.
/// Never written to the store; two clients may disagree for up to one round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalPhase {
    /// Rules screen before the first round.
    #[default]
    Intro,
    /// Answering the current round.
    Playing,
    /// Own answer is in, waiting for the others.
    Waiting,
    /// Round answers are shown.
    Reveal,
    /// Between rounds.
    Transition,
    /// Final scores.
    Results,
}

/// Inputs of the local phase machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalEvent {
    /// Player dismissed the intro.
    Begin,
    /// Own action was submitted.
    Submitted,
    /// Local countdown ran out.
    TimerExpired,
    /// Every player submitted for the round.
    AllSubmitted,
    /// Reveal animation finished.
    RevealFinished,
    /// A round started in the shared session.
    RoundStarted,
    /// The shared session finished.
    SessionFinished,
}

/// Event not applicable in the current local phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("local event {event:?} does not apply in {from:?}")]
pub struct InvalidLocalTransition {
    /// Phase when the event arrived.
    pub from: LocalPhase,
    /// Rejected event.
    pub event: LocalEvent,
}

/// Intro, then playing, waiting, reveal and transition per round, then results.
#[derive(Debug, Clone, Default)]
pub struct LocalPhaseMachine {
    phase: LocalPhase,
}

impl LocalPhaseMachine {
    /// Machine at the intro screen.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current phase.
    pub fn phase(&self) -> LocalPhase {
        self.phase
    }

    /// Feed an event and return the resulting phase.
    pub fn handle(&mut self, event: LocalEvent) -> Result<LocalPhase, InvalidLocalTransition> {
        use LocalEvent::*;
        use LocalPhase::*;

        let next = match (self.phase, event) {
            (Results, _) => return Err(InvalidLocalTransition { from: Results, event }),
            (_, SessionFinished) => Results,
            (_, RoundStarted) => Playing,
            (Intro, Begin) => Playing,
            (Playing, Submitted) => Waiting,
            (Playing | Waiting, TimerExpired | AllSubmitted) => Reveal,
            (Reveal, RevealFinished) => Transition,
            (from, event) => return Err(InvalidLocalTransition { from, event }),
        };

        self.phase = next;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_cycle() {
        let mut sm = LocalPhaseMachine::new();
        assert_eq!(sm.handle(LocalEvent::Begin), Ok(LocalPhase::Playing));
        assert_eq!(sm.handle(LocalEvent::Submitted), Ok(LocalPhase::Waiting));
        assert_eq!(sm.handle(LocalEvent::AllSubmitted), Ok(LocalPhase::Reveal));
        assert_eq!(sm.handle(LocalEvent::RevealFinished), Ok(LocalPhase::Transition));
        assert_eq!(sm.handle(LocalEvent::RoundStarted), Ok(LocalPhase::Playing));
        assert_eq!(sm.handle(LocalEvent::TimerExpired), Ok(LocalPhase::Reveal));
        assert_eq!(sm.handle(LocalEvent::SessionFinished), Ok(LocalPhase::Results));
    }

    #[test]
    fn remote_round_start_skips_intro() {
        let mut sm = LocalPhaseMachine::new();
        assert_eq!(sm.handle(LocalEvent::RoundStarted), Ok(LocalPhase::Playing));
    }

    #[test]
    fn results_is_terminal() {
        let mut sm = LocalPhaseMachine::new();
        sm.handle(LocalEvent::SessionFinished).unwrap();
        assert!(sm.handle(LocalEvent::RoundStarted).is_err());
        assert_eq!(sm.phase(), LocalPhase::Results);
    }

    #[test]
    fn submit_outside_playing_is_rejected() {
        let mut sm = LocalPhaseMachine::new();
        let err = sm.handle(LocalEvent::Submitted).unwrap_err();
        assert_eq!(err.from, LocalPhase::Intro);
        assert_eq!(sm.phase(), LocalPhase::Intro);
    }
}

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;
use validator::Validate;

use crate::{
    dto::{format_system_time, phase::VisibleSharedPhase, validation::validate_action_payload},
    services::controller::ControllerView,
    state::{
        ConnectionHealth,
        local_phase::LocalPhase,
        session::{
            Action, ActionKind, GameType, Player, PlayerStatus, Session, SessionStatus, Team,
        },
        teams::TeamTotals,
    },
};

/// Parameters for a brand-new session.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CreateSessionRequest {
    /// Event the session belongs to.
    pub event_id: Uuid,
    /// Game played in the session.
    pub game_type: GameType,
    /// User creating and hosting the session.
    pub host_id: Uuid,
    /// Number of rounds before the session finishes.
    #[validate(range(min = 1, max = 20))]
    pub total_rounds: u32,
    /// Free-form game settings stored with the session.
    #[serde(default)]
    pub config: Map<String, Value>,
}

/// A player submission for one round.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct SubmitActionRequest {
    /// Session the action is submitted to.
    pub session_id: Uuid,
    /// Submitting user.
    pub user_id: Uuid,
    /// Round the action answers (1-based).
    #[validate(range(min = 1))]
    pub round: u32,
    /// Kind of the submission.
    pub kind: ActionKind,
    /// Game-specific content, non-null and at most 4 KiB once serialized.
    #[validate(custom(function = "validate_action_payload"))]
    pub payload: Value,
}

/// Session row with RFC 3339 timestamps.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    /// Session identifier.
    pub id: String,
    /// Event identifier.
    pub event_id: String,
    /// Game played.
    pub game_type: GameType,
    /// Hosting user.
    pub host_id: String,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Round in progress (1-based).
    pub current_round: u32,
    /// Total number of rounds.
    pub total_rounds: u32,
    /// Creation time.
    pub created_at: String,
    /// Time the host started the game.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    /// Time the session finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
}

/// Player row joined with the profile's display name.
#[derive(Debug, Clone, Serialize)]
pub struct PlayerSummary {
    /// Player's user identifier.
    pub user_id: String,
    /// Name shown on screen.
    pub display_name: String,
    /// Assigned team, if any.
    pub team: Option<Team>,
    /// Accumulated score.
    pub score: u32,
    /// Accumulated chips.
    pub chips: u32,
    /// Player lifecycle status.
    pub status: PlayerStatus,
}

/// One revealed action.
#[derive(Debug, Clone, Serialize)]
pub struct ActionSummary {
    /// Action identifier.
    pub id: String,
    /// Submitting user.
    pub user_id: String,
    /// Round of the action.
    pub round: u32,
    /// Kind of the submission.
    pub kind: ActionKind,
    /// Game-specific content.
    pub payload: Value,
    /// Submission time.
    pub created_at: String,
}

/// Serializable rendition of a controller view, e.g. for logging or a debug overlay.
#[derive(Debug, Clone, Serialize)]
pub struct ControllerSummary {
    /// Followed session, if any.
    pub session: Option<SessionSummary>,
    /// Shared phase of the session.
    pub phase: Option<VisibleSharedPhase>,
    /// Screen-level phase of the device.
    pub local_phase: LocalPhase,
    /// Whether the viewer hosts the session.
    pub is_host: bool,
    /// Players in join order.
    pub players: Vec<PlayerSummary>,
    /// Current round's actions after the submission policy.
    pub revealed: Vec<ActionSummary>,
    /// Score and chip sums per team.
    pub team_totals: TeamTotals,
    /// Store connection health.
    pub health: ConnectionHealth,
    /// Last operation failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&Session> for SessionSummary {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id.to_string(),
            event_id: session.event_id.to_string(),
            game_type: session.game_type,
            host_id: session.host_id.to_string(),
            status: session.status,
            current_round: session.current_round,
            total_rounds: session.total_rounds,
            created_at: format_system_time(session.created_at),
            started_at: session.started_at.map(format_system_time),
            finished_at: session.finished_at.map(format_system_time),
        }
    }
}

impl From<&Player> for PlayerSummary {
    fn from(player: &Player) -> Self {
        Self {
            user_id: player.user_id.to_string(),
            display_name: player.display_name(),
            team: player.team,
            score: player.score,
            chips: player.chips,
            status: player.status,
        }
    }
}

impl From<&Action> for ActionSummary {
    fn from(action: &Action) -> Self {
        Self {
            id: action.id.to_string(),
            user_id: action.user_id.to_string(),
            round: action.round,
            kind: action.kind,
            payload: action.payload.clone(),
            created_at: format_system_time(action.created_at),
        }
    }
}

impl From<&ControllerView> for ControllerSummary {
    fn from(view: &ControllerView) -> Self {
        Self {
            session: view.session.as_ref().map(Into::into),
            phase: view.shared_phase.as_ref().map(Into::into),
            local_phase: view.local_phase,
            is_host: view.is_host,
            players: view.players.iter().map(Into::into).collect(),
            revealed: view.revealed.iter().map(Into::into).collect(),
            team_totals: view.team_totals,
            health: view.health,
            error: view.error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn request(total_rounds: u32) -> CreateSessionRequest {
        CreateSessionRequest {
            event_id: Uuid::new_v4(),
            game_type: GameType::MostLikelyTo,
            host_id: Uuid::new_v4(),
            total_rounds,
            config: Map::new(),
        }
    }

    #[test]
    fn round_count_must_be_in_range() {
        assert!(request(1).validate().is_ok());
        assert!(request(20).validate().is_ok());
        assert!(request(0).validate().is_err());
        assert!(request(21).validate().is_err());
    }

    #[test]
    fn submit_request_rejects_null_payload_and_round_zero() {
        let mut submit = SubmitActionRequest {
            session_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            round: 1,
            kind: ActionKind::Vote,
            payload: json!({"target": "b"}),
        };
        assert!(submit.validate().is_ok());

        submit.payload = Value::Null;
        assert!(submit.validate().is_err());

        submit.payload = json!({"target": "b"});
        submit.round = 0;
        assert!(submit.validate().is_err());
    }

    #[test]
    fn create_request_reads_snake_case_game_type() {
        let parsed: CreateSessionRequest = serde_json::from_value(json!({
            "event_id": Uuid::nil(),
            "game_type": "two_truths_one_lie",
            "host_id": Uuid::nil(),
            "total_rounds": 3
        }))
        .unwrap();
        assert_eq!(parsed.game_type, GameType::TwoTruthsOneLie);
        assert!(parsed.config.is_empty());
    }
}

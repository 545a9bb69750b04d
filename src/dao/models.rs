use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::SystemTime;
use uuid::Uuid;

/// The seven party games a session can run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GameType {
    /// Answer the question or drink.
    TruthOrDrink,
    /// Vote for the player most likely to do something.
    MostLikelyTo,
    /// Spot the lie among three statements.
    TwoTruthsOneLie,
    /// Admit what you have done.
    NeverHaveIEver,
    /// One player answers everyone's questions.
    HotSeat,
    /// Anonymous confessions, guessed by the table.
    Confessions,
    /// Pick one of two options.
    WouldYouRather,
}

impl GameType {
    /// Every game on the roster, in menu order.
    pub const ALL: [GameType; 7] = [
        GameType::TruthOrDrink,
        GameType::MostLikelyTo,
        GameType::TwoTruthsOneLie,
        GameType::NeverHaveIEver,
        GameType::HotSeat,
        GameType::Confessions,
        GameType::WouldYouRather,
    ];

    /// Wire name of the game, identical to its serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            GameType::TruthOrDrink => "truth_or_drink",
            GameType::MostLikelyTo => "most_likely_to",
            GameType::TwoTruthsOneLie => "two_truths_one_lie",
            GameType::NeverHaveIEver => "never_have_i_ever",
            GameType::HotSeat => "hot_seat",
            GameType::Confessions => "confessions",
            GameType::WouldYouRather => "would_you_rather",
        }
    }

    /// Kind of action a player typically submits in this game.
    pub fn primary_action(&self) -> ActionKind {
        match self {
            GameType::TruthOrDrink | GameType::WouldYouRather => ActionKind::Choice,
            GameType::MostLikelyTo => ActionKind::Vote,
            GameType::TwoTruthsOneLie => ActionKind::Guess,
            GameType::NeverHaveIEver | GameType::HotSeat => ActionKind::Answer,
            GameType::Confessions => ActionKind::Confession,
        }
    }
}

/// Lifecycle status of a session. Variants are ordered by progression.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Created, players are joining.
    #[default]
    Waiting,
    /// Started by the host; rounds are running.
    Playing,
    /// Last round played or ended early.
    Finished,
}

impl SessionStatus {
    /// Wire name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Waiting => "waiting",
            SessionStatus::Playing => "playing",
            SessionStatus::Finished => "finished",
        }
    }

    /// Statuses of a session that can still be joined or played.
    pub const ACTIVE: [SessionStatus; 2] = [SessionStatus::Waiting, SessionStatus::Playing];
}

/// Membership status of a player. Variants are ordered by progression.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum PlayerStatus {
    /// In the waiting room.
    #[default]
    Joined,
    /// Marked ready by the player.
    Ready,
    /// Taking part in a running game.
    Playing,
    /// The session finished.
    Finished,
}

impl PlayerStatus {
    /// Wire name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            PlayerStatus::Joined => "joined",
            PlayerStatus::Ready => "ready",
            PlayerStatus::Playing => "playing",
            PlayerStatus::Finished => "finished",
        }
    }
}

/// Team a player can be assigned to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Team {
    /// Male players.
    Men,
    /// Female players.
    Women,
}

impl Team {
    /// Wire name of the team.
    pub fn as_str(&self) -> &'static str {
        match self {
            Team::Men => "men",
            Team::Women => "women",
        }
    }
}

/// Gender attribute carried by the profile collaborator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    /// Assigned to [`Team::Men`].
    Male,
    /// Assigned to [`Team::Women`].
    Female,
    /// Unknown or unspecified; left unassigned.
    #[default]
    #[serde(other)]
    Other,
}

/// Kind of input a player submits for a round.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Free-text or yes/no answer.
    Answer,
    /// Vote for another player.
    Vote,
    /// Pick among fixed options.
    Choice,
    /// Guess about another player's statement.
    Guess,
    /// Anonymous confession.
    Confession,
}

/// Session row persisted by the storage layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionEntity {
    /// Primary key of the session.
    pub id: Uuid,
    /// Event the game night belongs to.
    pub event_id: Uuid,
    /// Which of the seven games is being played.
    pub game_type: GameType,
    /// Player holding the privileged operations.
    pub host_id: Uuid,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Current round, 1-based.
    pub current_round: u32,
    /// Fixed number of rounds chosen at creation.
    pub total_rounds: u32,
    /// Free-form per-game configuration.
    #[serde(default)]
    pub config: Map<String, Value>,
    /// Creation timestamp.
    pub created_at: SystemTime,
    /// Set once the host starts the game.
    pub started_at: Option<SystemTime>,
    /// Set once the session finished.
    pub finished_at: Option<SystemTime>,
}

/// Partial update applied to a session row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionPatch {
    /// New status.
    pub status: Option<SessionStatus>,
    /// New current round.
    pub current_round: Option<u32>,
    /// Start timestamp to set.
    pub started_at: Option<SystemTime>,
    /// Finish timestamp to set.
    pub finished_at: Option<SystemTime>,
}

impl SessionPatch {
    /// Apply the populated fields onto `session`.
    pub fn apply_to(&self, session: &mut SessionEntity) {
        if let Some(status) = self.status {
            session.status = status;
        }
        if let Some(round) = self.current_round {
            session.current_round = round;
        }
        if self.started_at.is_some() {
            session.started_at = self.started_at;
        }
        if self.finished_at.is_some() {
            session.finished_at = self.finished_at;
        }
    }
}

/// Player membership row, unique per (session, user).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlayerEntity {
    /// Session joined.
    pub session_id: Uuid,
    /// Joined user.
    pub user_id: Uuid,
    /// Assigned team, if any.
    pub team: Option<Team>,
    /// Accumulated score.
    pub score: u32,
    /// Accumulated chips.
    pub chips: u32,
    /// Membership status.
    pub status: PlayerStatus,
    /// Join timestamp; listings are ordered by it.
    pub joined_at: SystemTime,
}

/// Partial update applied to a player row.
///
/// `team` is doubly optional so a patch can clear an assignment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlayerPatch {
    /// Team to set; `Some(None)` clears it.
    pub team: Option<Option<Team>>,
    /// Absolute score to set.
    pub score: Option<u32>,
    /// Absolute chips to set.
    pub chips: Option<u32>,
    /// New status.
    pub status: Option<PlayerStatus>,
}

impl PlayerPatch {
    /// Apply the populated fields onto `player`.
    pub fn apply_to(&self, player: &mut PlayerEntity) {
        if let Some(team) = self.team {
            player.team = team;
        }
        if let Some(score) = self.score {
            player.score = score;
        }
        if let Some(chips) = self.chips {
            player.chips = chips;
        }
        if let Some(status) = self.status {
            player.status = status;
        }
    }
}

/// Display profile owned by the identity collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileEntity {
    /// Owner of the profile.
    pub user_id: Uuid,
    /// Name shown to other players.
    pub display_name: String,
    /// Drives gender-based team assignment.
    #[serde(default)]
    pub gender: Gender,
    /// Optional picture URL.
    pub avatar_url: Option<String>,
}

/// Player row joined with its display profile, as returned by player listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerRecord {
    /// Membership row.
    pub player: PlayerEntity,
    /// Profile of the user, when one exists.
    pub profile: Option<ProfileEntity>,
}

/// Append-only action row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionEntity {
    /// Primary key of the action.
    pub id: Uuid,
    /// Session the action belongs to.
    pub session_id: Uuid,
    /// Round the action answers.
    pub round: u32,
    /// Submitting user.
    pub user_id: Uuid,
    /// Kind of the submission.
    pub kind: ActionKind,
    /// Game-specific payload, e.g. `{"target": "<user id>"}` for a vote.
    pub payload: Value,
    /// Stamped by the store on insert.
    pub created_at: SystemTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn game_type_wire_names_match_serde() {
        for game in GameType::ALL {
            let encoded = serde_json::to_value(game).unwrap();
            assert_eq!(encoded, Value::String(game.as_str().to_owned()));
        }
    }

    #[test]
    fn unknown_gender_falls_back_to_other() {
        let gender: Gender = serde_json::from_str("\"nonbinary\"").unwrap();
        assert_eq!(gender, Gender::Other);
    }

    #[test]
    fn statuses_are_ordered_by_progression() {
        assert!(SessionStatus::Waiting < SessionStatus::Playing);
        assert!(SessionStatus::Playing < SessionStatus::Finished);
        assert!(PlayerStatus::Joined < PlayerStatus::Ready);
        assert!(PlayerStatus::Playing < PlayerStatus::Finished);
    }

    #[test]
    fn player_patch_can_clear_team() {
        let mut player = PlayerEntity {
            session_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            team: Some(Team::Men),
            score: 3,
            chips: 1,
            status: PlayerStatus::Playing,
            joined_at: SystemTime::now(),
        };
        PlayerPatch {
            team: Some(None),
            ..Default::default()
        }
        .apply_to(&mut player);
        assert_eq!(player.team, None);
        assert_eq!(player.score, 3);
    }
}

//! Domain view of sessions, players and actions as the controller sees them.

use std::time::SystemTime;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub use crate::dao::models::{
    ActionKind, GameType, Gender, PlayerStatus, SessionStatus, Team,
};
use crate::dao::models::{ActionEntity, PlayerEntity, PlayerRecord, ProfileEntity, SessionEntity};

/// Identifier of a session.
pub type SessionId = Uuid;
/// Identifier of the event (game night) a session belongs to.
pub type EventId = Uuid;
/// Opaque identifier of an authenticated user.
pub type UserId = Uuid;
/// Identifier of a submitted action.
pub type ActionId = Uuid;

/// One play-through of a game within an event.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    /// Session identifier.
    pub id: SessionId,
    /// Owning event.
    pub event_id: EventId,
    /// Game being played.
    pub game_type: GameType,
    /// Player allowed to start, advance and assign teams.
    pub host_id: UserId,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Current round, 1-based.
    pub current_round: u32,
    /// Number of rounds fixed at creation.
    pub total_rounds: u32,
    /// Free-form game configuration.
    pub config: Map<String, Value>,
    /// Creation time.
    pub created_at: SystemTime,
    /// Start time, once started.
    pub started_at: Option<SystemTime>,
    /// Finish time, once finished.
    pub finished_at: Option<SystemTime>,
}

impl Session {
    /// Whether the current round is the last one.
    pub fn is_last_round(&self) -> bool {
        self.current_round >= self.total_rounds
    }
}

impl From<SessionEntity> for Session {
    fn from(value: SessionEntity) -> Self {
        Self {
            id: value.id,
            event_id: value.event_id,
            game_type: value.game_type,
            host_id: value.host_id,
            status: value.status,
            current_round: value.current_round,
            total_rounds: value.total_rounds,
            config: value.config,
            created_at: value.created_at,
            started_at: value.started_at,
            finished_at: value.finished_at,
        }
    }
}

/// Display data joined in from the profile collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    /// Name shown to other players.
    pub display_name: String,
    /// Gender attribute used for team assignment.
    pub gender: Gender,
    /// Optional avatar location.
    pub avatar_url: Option<String>,
}

impl From<ProfileEntity> for Profile {
    fn from(value: ProfileEntity) -> Self {
        Self {
            display_name: value.display_name,
            gender: value.gender,
            avatar_url: value.avatar_url,
        }
    }
}

/// A user's membership in a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Player {
    /// Owning session.
    pub session_id: SessionId,
    /// Member.
    pub user_id: UserId,
    /// Assigned team, if any.
    pub team: Option<Team>,
    /// Accumulated score.
    pub score: u32,
    /// Accumulated chips.
    pub chips: u32,
    /// Membership status.
    pub status: PlayerStatus,
    /// Join time, used for turn order.
    pub joined_at: SystemTime,
    /// Display profile when the collaborator knows the user.
    pub profile: Option<Profile>,
}

impl Player {
    /// Gender from the profile, `Other` when no profile is known.
    pub fn gender(&self) -> Gender {
        self.profile
            .as_ref()
            .map(|profile| profile.gender)
            .unwrap_or_default()
    }

    /// Name to show for the player.
    pub fn display_name(&self) -> String {
        match &self.profile {
            Some(profile) => profile.display_name.clone(),
            None => {
                let id = self.user_id.simple().to_string();
                format!("player-{}", &id[..6])
            }
        }
    }
}

impl From<PlayerRecord> for Player {
    fn from(value: PlayerRecord) -> Self {
        let PlayerRecord { player, profile } = value;
        Self {
            profile: profile.map(Into::into),
            ..Player::from(player)
        }
    }
}

impl From<PlayerEntity> for Player {
    fn from(value: PlayerEntity) -> Self {
        Self {
            session_id: value.session_id,
            user_id: value.user_id,
            team: value.team,
            score: value.score,
            chips: value.chips,
            status: value.status,
            joined_at: value.joined_at,
            profile: None,
        }
    }
}

/// A single submission for a round.
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    /// Action identifier.
    pub id: ActionId,
    /// Owning session.
    pub session_id: SessionId,
    /// Round the action belongs to.
    pub round: u32,
    /// Submitter.
    pub user_id: UserId,
    /// Kind of submission.
    pub kind: ActionKind,
    /// Game-specific payload.
    pub payload: Value,
    /// Store-assigned creation time.
    pub created_at: SystemTime,
}

impl From<ActionEntity> for Action {
    fn from(value: ActionEntity) -> Self {
        Self {
            id: value.id,
            session_id: value.session_id,
            round: value.round,
            user_id: value.user_id,
            kind: value.kind,
            payload: value.payload,
            created_at: value.created_at,
        }
    }
}

/// How repeated submissions from the same user in one round are treated.
///
/// Storage stays append-only in every mode; the policy only decides what a
/// client accepts and reveals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionPolicy {
    /// Reveal the latest action of each user.
    #[default]
    LatestWins,
    /// Reveal every action.
    AppendAll,
    /// Refuse a second submission from the same user.
    FirstOnly,
}

impl SubmissionPolicy {
    /// Actions to reveal for a round, in submission order.
    pub fn reveal<'a>(&self, actions: impl IntoIterator<Item = &'a Action>) -> Vec<Action> {
        let mut ordered: Vec<&Action> = actions.into_iter().collect();
        ordered.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        match self {
            SubmissionPolicy::AppendAll => ordered.into_iter().cloned().collect(),
            SubmissionPolicy::LatestWins => {
                let mut latest: IndexMap<UserId, &Action> = IndexMap::new();
                for action in ordered {
                    latest.shift_remove(&action.user_id);
                    latest.insert(action.user_id, action);
                }
                latest.into_values().cloned().collect()
            }
            SubmissionPolicy::FirstOnly => {
                let mut first: IndexMap<UserId, &Action> = IndexMap::new();
                for action in ordered {
                    first.entry(action.user_id).or_insert(action);
                }
                first.into_values().cloned().collect()
            }
        }
    }

    /// Whether `user_id` may submit again given the actions already seen.
    pub fn accepts<'a>(
        &self,
        user_id: UserId,
        mut actions: impl Iterator<Item = &'a Action>,
    ) -> bool {
        match self {
            SubmissionPolicy::FirstOnly => !actions.any(|action| action.user_id == user_id),
            SubmissionPolicy::LatestWins | SubmissionPolicy::AppendAll => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    fn action(user_id: UserId, offset_ms: u64, answer: &str) -> Action {
        Action {
            id: Uuid::new_v4(),
            session_id: Uuid::nil(),
            round: 1,
            user_id,
            kind: ActionKind::Answer,
            payload: json!({ "answer": answer }),
            created_at: SystemTime::UNIX_EPOCH + Duration::from_millis(offset_ms),
        }
    }

    #[test]
    fn latest_wins_keeps_last_submission_per_user() {
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let actions = [
            action(alice, 1, "a1"),
            action(bob, 2, "b1"),
            action(alice, 3, "a2"),
        ];

        let revealed = SubmissionPolicy::LatestWins.reveal(&actions);
        assert_eq!(revealed.len(), 2);
        assert_eq!(revealed[0].user_id, bob);
        assert_eq!(revealed[1].payload, json!({ "answer": "a2" }));
    }

    #[test]
    fn first_only_keeps_first_and_refuses_more() {
        let alice = Uuid::new_v4();
        let actions = [action(alice, 5, "late"), action(alice, 1, "early")];

        let revealed = SubmissionPolicy::FirstOnly.reveal(&actions);
        assert_eq!(revealed.len(), 1);
        assert_eq!(revealed[0].payload, json!({ "answer": "early" }));
        assert!(!SubmissionPolicy::FirstOnly.accepts(alice, actions.iter()));
        assert!(SubmissionPolicy::FirstOnly.accepts(Uuid::new_v4(), actions.iter()));
    }

    #[test]
    fn append_all_reveals_everything_in_order() {
        let alice = Uuid::new_v4();
        let actions = [action(alice, 2, "second"), action(alice, 1, "first")];

        let revealed = SubmissionPolicy::AppendAll.reveal(&actions);
        assert_eq!(revealed.len(), 2);
        assert_eq!(revealed[0].payload, json!({ "answer": "first" }));
    }

    #[test]
    fn player_without_profile_has_other_gender() {
        let player = Player::from(PlayerEntity {
            session_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            team: None,
            score: 0,
            chips: 0,
            status: PlayerStatus::Joined,
            joined_at: SystemTime::now(),
        });
        assert_eq!(player.gender(), Gender::Other);
        assert!(player.display_name().starts_with("player-"));
    }
}

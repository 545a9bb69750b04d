//! Typed operations over the session store. No retries at this layer.

use std::{sync::Arc, time::SystemTime};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;
use validator::Validate;

use crate::{
    dao::{
        models::{
            ActionEntity, PlayerEntity, PlayerPatch, PlayerStatus, SessionEntity, SessionPatch,
            SessionStatus,
        },
        session_store::SessionStore,
        storage::StorageError,
    },
    dto::session::{CreateSessionRequest, SubmitActionRequest},
    error::ServiceError,
    state::{
        SharedContext,
        session::{Action, ActionKind, GameType, Player, Session, Team},
        teams::assign_by_gender,
    },
};

/// How a score increment reaches the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreUpdateMode {
    /// Read the row, add locally, write the sum back. Two round trips;
    /// concurrent increments can overwrite each other.
    ReadModifyWrite,
    /// Single store-side increment.
    #[default]
    Atomic,
}

/// Session, player and action operations used by controllers.
#[derive(Clone)]
pub struct SessionRepository {
    context: SharedContext,
    score_updates: ScoreUpdateMode,
}

impl SessionRepository {
    /// Repository using the score update mode from the configuration.
    pub fn new(context: SharedContext) -> Self {
        let score_updates = context.config().score_updates;
        Self {
            context,
            score_updates,
        }
    }

    /// Override the score update mode.
    pub fn with_score_updates(mut self, mode: ScoreUpdateMode) -> Self {
        self.score_updates = mode;
        self
    }

    /// Shared context the repository reads its store from.
    pub fn context(&self) -> &SharedContext {
        &self.context
    }

    async fn store(&self) -> Result<Arc<dyn SessionStore>, ServiceError> {
        self.context.require_store().await
    }

    /// Create a waiting session at round 1. The host still has to join.
    pub async fn create_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<Session, ServiceError> {
        request.validate()?;

        let entity = SessionEntity {
            id: Uuid::new_v4(),
            event_id: request.event_id,
            game_type: request.game_type,
            host_id: request.host_id,
            status: SessionStatus::Waiting,
            current_round: 1,
            total_rounds: request.total_rounds,
            config: request.config,
            created_at: SystemTime::now(),
            started_at: None,
            finished_at: None,
        };

        self.store().await?.insert_session(entity.clone()).await?;
        info!(
            session_id = %entity.id,
            event_id = %entity.event_id,
            game_type = entity.game_type.as_str(),
            total_rounds = entity.total_rounds,
            "session created"
        );
        Ok(entity.into())
    }

    /// Add `user_id` to the session. A second join yields [`ServiceError::AlreadyJoined`].
    pub async fn join_session(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        team: Option<Team>,
    ) -> Result<(), ServiceError> {
        let player = PlayerEntity {
            session_id,
            user_id,
            team,
            score: 0,
            chips: 0,
            status: PlayerStatus::Joined,
            joined_at: SystemTime::now(),
        };

        match self.store().await?.insert_player(player).await {
            Ok(()) => {
                info!(%session_id, %user_id, "player joined session");
                Ok(())
            }
            Err(StorageError::DuplicateKey { .. }) => {
                debug!(%session_id, %user_id, "player already joined");
                Err(ServiceError::AlreadyJoined)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Newest waiting or playing session of the event. Failures read as absence.
    pub async fn get_active_session(
        &self,
        event_id: Uuid,
        game_type: Option<GameType>,
    ) -> Option<Session> {
        let store = match self.store().await {
            Ok(store) => store,
            Err(err) => {
                warn!(%event_id, error = %err, "cannot look up active session");
                return None;
            }
        };

        match store
            .find_latest_session(event_id, game_type, SessionStatus::ACTIVE.to_vec())
            .await
        {
            Ok(session) => session.map(Into::into),
            Err(err) => {
                warn!(%event_id, error = %err, "active session lookup failed");
                None
            }
        }
    }

    /// Session by id.
    pub async fn get_session(&self, session_id: Uuid) -> Result<Option<Session>, ServiceError> {
        let session = self.store().await?.find_session(session_id).await?;
        Ok(session.map(Into::into))
    }

    /// Every player of the session with its profile, in join order.
    pub async fn get_players(&self, session_id: Uuid) -> Result<Vec<Player>, ServiceError> {
        let records = self.store().await?.list_players(session_id).await?;
        Ok(records.into_iter().map(Into::into).collect())
    }

    /// Set the session to playing.
    pub async fn start_game(&self, session_id: Uuid) -> Result<Session, ServiceError> {
        let patch = SessionPatch {
            status: Some(SessionStatus::Playing),
            started_at: Some(SystemTime::now()),
            ..Default::default()
        };
        self.patch_session(session_id, patch).await
    }

    /// Set `current_round` to `current_round + 1`. No bound check.
    pub async fn advance_round(
        &self,
        session_id: Uuid,
        current_round: u32,
    ) -> Result<Session, ServiceError> {
        let patch = SessionPatch {
            current_round: Some(current_round.saturating_add(1)),
            ..Default::default()
        };
        self.patch_session(session_id, patch).await
    }

    /// Set the session to finished.
    pub async fn end_game(&self, session_id: Uuid) -> Result<Session, ServiceError> {
        let patch = SessionPatch {
            status: Some(SessionStatus::Finished),
            finished_at: Some(SystemTime::now()),
            ..Default::default()
        };
        self.patch_session(session_id, patch).await
    }

    async fn patch_session(
        &self,
        session_id: Uuid,
        patch: SessionPatch,
    ) -> Result<Session, ServiceError> {
        let updated = self
            .store()
            .await?
            .update_session(session_id, patch.clone())
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("session {session_id}")))?;

        debug!(
            %session_id,
            status = updated.status.as_str(),
            round = updated.current_round,
            ?patch,
            "session updated"
        );
        Ok(updated.into())
    }

    /// Append an action for `round`.
    pub async fn submit_action(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        round: u32,
        kind: ActionKind,
        payload: Value,
    ) -> Result<Action, ServiceError> {
        let request = SubmitActionRequest {
            session_id,
            user_id,
            round,
            kind,
            payload,
        };
        request.validate()?;

        let entity = ActionEntity {
            id: Uuid::new_v4(),
            session_id: request.session_id,
            round: request.round,
            user_id: request.user_id,
            kind: request.kind,
            payload: request.payload,
            created_at: SystemTime::now(),
        };
        let stored = self.store().await?.insert_action(entity).await?;
        debug!(%session_id, %user_id, round, action_id = %stored.id, "action submitted");
        Ok(stored.into())
    }

    /// Actions of exactly this session and round.
    pub async fn get_round_actions(
        &self,
        session_id: Uuid,
        round: u32,
    ) -> Result<Vec<Action>, ServiceError> {
        let actions = self.store().await?.list_actions(session_id, round).await?;
        Ok(actions.into_iter().map(Into::into).collect())
    }

    /// Add the deltas to the player's score and chips.
    pub async fn update_player_score(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        score_delta: u32,
        chips_delta: u32,
    ) -> Result<(), ServiceError> {
        let store = self.store().await?;
        let updated = match self.score_updates {
            ScoreUpdateMode::Atomic => {
                store
                    .increment_player_score(session_id, user_id, score_delta, chips_delta)
                    .await?
            }
            ScoreUpdateMode::ReadModifyWrite => {
                let Some(current) = store.find_player(session_id, user_id).await? else {
                    return Err(player_not_found(session_id, user_id));
                };
                let patch = PlayerPatch {
                    score: Some(current.score.saturating_add(score_delta)),
                    chips: Some(current.chips.saturating_add(chips_delta)),
                    ..Default::default()
                };
                store.update_player(session_id, user_id, patch).await?
            }
        };

        let player = updated.ok_or_else(|| player_not_found(session_id, user_id))?;
        debug!(
            %session_id,
            %user_id,
            score = player.score,
            chips = player.chips,
            mode = ?self.score_updates,
            "player score updated"
        );
        Ok(())
    }

    /// Move the player's status forward. Never regresses; a lower status is a no-op.
    pub async fn set_player_status(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        status: PlayerStatus,
    ) -> Result<(), ServiceError> {
        let store = self.store().await?;
        let Some(current) = store.find_player(session_id, user_id).await? else {
            return Err(player_not_found(session_id, user_id));
        };
        if current.status >= status {
            return Ok(());
        }

        let patch = PlayerPatch {
            status: Some(status),
            ..Default::default()
        };
        store.update_player(session_id, user_id, patch).await?;
        debug!(%session_id, %user_id, status = status.as_str(), "player status updated");
        Ok(())
    }

    /// Assign men/women from each player's gender and write the teams back.
    /// Returns the refreshed player set.
    pub async fn assign_teams_by_gender(
        &self,
        session_id: Uuid,
    ) -> Result<Vec<Player>, ServiceError> {
        let players = self.get_players(session_id).await?;
        let store = self.store().await?;

        for (user_id, team) in assign_by_gender(&players) {
            let patch = PlayerPatch {
                team: Some(team),
                ..Default::default()
            };
            store.update_player(session_id, user_id, patch).await?;
        }

        let refreshed = self.get_players(session_id).await?;
        info!(%session_id, players = refreshed.len(), "teams assigned by gender");
        Ok(refreshed)
    }

    /// Put one player on `team`, or clear the assignment.
    pub async fn reassign_team(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        team: Option<Team>,
    ) -> Result<(), ServiceError> {
        let patch = PlayerPatch {
            team: Some(team),
            ..Default::default()
        };
        self.store()
            .await?
            .update_player(session_id, user_id, patch)
            .await?
            .ok_or_else(|| player_not_found(session_id, user_id))?;
        Ok(())
    }
}

fn player_not_found(session_id: Uuid, user_id: Uuid) -> ServiceError {
    ServiceError::NotFound(format!("player {user_id} in session {session_id}"))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{Map, json};

    use super::*;
    use crate::{
        config::AppConfig,
        dao::{models::{Gender, ProfileEntity}, session_store::memory::MemorySessionStore},
        state::SyncContext,
    };

    fn repository(store: MemorySessionStore) -> SessionRepository {
        SessionRepository::new(SyncContext::with_store(
            AppConfig::default(),
            Arc::new(store),
        ))
    }

    async fn session(repo: &SessionRepository, total_rounds: u32) -> Session {
        repo.create_session(CreateSessionRequest {
            event_id: Uuid::new_v4(),
            game_type: GameType::MostLikelyTo,
            host_id: Uuid::new_v4(),
            total_rounds,
            config: Map::new(),
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn create_session_starts_waiting_at_round_one() {
        let repo = repository(MemorySessionStore::new());
        let created = session(&repo, 5).await;

        assert_eq!(created.status, SessionStatus::Waiting);
        assert_eq!(created.current_round, 1);
        assert_eq!(created.total_rounds, 5);
        assert_eq!(repo.get_session(created.id).await.unwrap(), Some(created));
    }

    #[tokio::test]
    async fn create_session_rejects_zero_rounds() {
        let repo = repository(MemorySessionStore::new());
        let err = repo
            .create_session(CreateSessionRequest {
                event_id: Uuid::new_v4(),
                game_type: GameType::HotSeat,
                host_id: Uuid::new_v4(),
                total_rounds: 0,
                config: Map::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn repeated_join_keeps_one_player() {
        let repo = repository(MemorySessionStore::new());
        let created = session(&repo, 3).await;
        let user = Uuid::new_v4();

        repo.join_session(created.id, user, None).await.unwrap();
        for _ in 0..3 {
            let err = repo.join_session(created.id, user, None).await.unwrap_err();
            assert!(matches!(err, ServiceError::AlreadyJoined));
        }
        assert_eq!(repo.get_players(created.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn active_session_lookup_never_errors() {
        let store = MemorySessionStore::new();
        let repo = repository(store.clone());
        assert!(repo.get_active_session(Uuid::new_v4(), None).await.is_none());

        store.set_online(false);
        assert!(repo.get_active_session(Uuid::new_v4(), None).await.is_none());

        let degraded = SessionRepository::new(SyncContext::new(AppConfig::default()));
        assert!(degraded.get_active_session(Uuid::new_v4(), None).await.is_none());
    }

    #[tokio::test]
    async fn advance_round_has_no_bound_check() {
        let repo = repository(MemorySessionStore::new());
        let created = session(&repo, 5).await;
        repo.start_game(created.id).await.unwrap();

        let advanced = repo.advance_round(created.id, 5).await.unwrap();
        assert_eq!(advanced.current_round, 6);
    }

    #[tokio::test]
    async fn round_actions_are_isolated_and_payload_survives() {
        let repo = repository(MemorySessionStore::new());
        let first = session(&repo, 3).await;
        let second = session(&repo, 3).await;
        let user = Uuid::new_v4();
        let payload = json!({"target": Uuid::nil(), "nested": {"list": [1, 2, 3], "flag": true}});

        repo.submit_action(first.id, user, 1, ActionKind::Vote, payload.clone())
            .await
            .unwrap();
        repo.submit_action(first.id, user, 2, ActionKind::Vote, json!({"target": "x"}))
            .await
            .unwrap();
        repo.submit_action(second.id, user, 1, ActionKind::Vote, json!({"target": "y"}))
            .await
            .unwrap();

        let round_one = repo.get_round_actions(first.id, 1).await.unwrap();
        assert_eq!(round_one.len(), 1);
        assert_eq!(round_one[0].payload, payload);
        assert!(round_one.iter().all(|a| a.session_id == first.id && a.round == 1));
    }

    #[tokio::test]
    async fn atomic_score_updates_accumulate() {
        let repo = repository(MemorySessionStore::with_latency(Duration::from_millis(10)));
        let created = session(&repo, 3).await;
        let user = Uuid::new_v4();
        repo.join_session(created.id, user, None).await.unwrap();

        let (a, b) = tokio::join!(
            repo.update_player_score(created.id, user, 5, 1),
            repo.update_player_score(created.id, user, 5, 1),
        );
        a.unwrap();
        b.unwrap();

        let players = repo.get_players(created.id).await.unwrap();
        assert_eq!(players[0].score, 10);
        assert_eq!(players[0].chips, 2);
    }

    #[tokio::test]
    async fn read_modify_write_loses_concurrent_update() {
        let repo = repository(MemorySessionStore::with_latency(Duration::from_millis(10)))
            .with_score_updates(ScoreUpdateMode::ReadModifyWrite);
        let created = session(&repo, 3).await;
        let user = Uuid::new_v4();
        repo.join_session(created.id, user, None).await.unwrap();

        // Both reads land before either write.
        let (a, b) = tokio::join!(
            repo.update_player_score(created.id, user, 5, 0),
            repo.update_player_score(created.id, user, 5, 0),
        );
        a.unwrap();
        b.unwrap();

        let players = repo.get_players(created.id).await.unwrap();
        assert!(players[0].score < 10, "expected a lost update, got {}", players[0].score);
        assert_eq!(players[0].score, 5);

        // Sequential updates are monotonic.
        repo.update_player_score(created.id, user, 2, 0).await.unwrap();
        let players = repo.get_players(created.id).await.unwrap();
        assert_eq!(players[0].score, 7);
    }

    #[tokio::test]
    async fn player_status_never_regresses() {
        let repo = repository(MemorySessionStore::new());
        let created = session(&repo, 3).await;
        let user = Uuid::new_v4();
        repo.join_session(created.id, user, None).await.unwrap();

        repo.set_player_status(created.id, user, PlayerStatus::Playing)
            .await
            .unwrap();
        repo.set_player_status(created.id, user, PlayerStatus::Ready)
            .await
            .unwrap();

        let players = repo.get_players(created.id).await.unwrap();
        assert_eq!(players[0].status, PlayerStatus::Playing);
    }

    #[tokio::test]
    async fn gender_assignment_writes_teams_back() {
        let store = MemorySessionStore::new();
        let repo = repository(store.clone());
        let created = session(&repo, 3).await;

        let genders = [Gender::Male, Gender::Female, Gender::Male, Gender::Female, Gender::Male];
        let mut users = Vec::new();
        for (n, gender) in genders.into_iter().enumerate() {
            let user = Uuid::new_v4();
            store.put_profile(ProfileEntity {
                user_id: user,
                display_name: format!("p{}", n + 1),
                gender,
                avatar_url: None,
            });
            repo.join_session(created.id, user, None).await.unwrap();
            users.push(user);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let players = repo.assign_teams_by_gender(created.id).await.unwrap();
        let men: Vec<Uuid> = players
            .iter()
            .filter(|p| p.team == Some(Team::Men))
            .map(|p| p.user_id)
            .collect();
        let women: Vec<Uuid> = players
            .iter()
            .filter(|p| p.team == Some(Team::Women))
            .map(|p| p.user_id)
            .collect();
        assert_eq!(men, vec![users[0], users[2], users[4]]);
        assert_eq!(women, vec![users[1], users[3]]);

        let again = repo.assign_teams_by_gender(created.id).await.unwrap();
        assert_eq!(again, players);
    }

    #[tokio::test]
    async fn reassign_team_can_clear() {
        let repo = repository(MemorySessionStore::new());
        let created = session(&repo, 3).await;
        let user = Uuid::new_v4();
        repo.join_session(created.id, user, Some(Team::Men)).await.unwrap();

        repo.reassign_team(created.id, user, None).await.unwrap();
        assert_eq!(repo.get_players(created.id).await.unwrap()[0].team, None);

        let err = repo
            .reassign_team(created.id, Uuid::new_v4(), Some(Team::Women))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn degraded_context_refuses_writes() {
        let repo = SessionRepository::new(SyncContext::new(AppConfig::default()));
        let err = repo.end_game(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, ServiceError::Degraded));
    }
}

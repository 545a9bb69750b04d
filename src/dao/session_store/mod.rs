/// In-process backend used by tests and the demo.
pub mod memory;
/// MongoDB backend.
#[cfg(feature = "mongo-store")]
pub mod mongodb;

use std::pin::Pin;

use crate::dao::models::{
    ActionEntity, GameType, PlayerEntity, PlayerPatch, PlayerRecord, SessionEntity, SessionPatch,
    SessionStatus,
};
use crate::dao::storage::StorageResult;
use futures::{Stream, future::BoxFuture};
use uuid::Uuid;

/// Stream of row changes delivered by a store subscription.
///
/// The stream ends when the underlying connection drops.
pub type ChangeStream<T> = Pin<Box<dyn Stream<Item = StorageResult<T>> + Send>>;

/// Abstraction over the hosted store backing sessions, players and actions.
pub trait SessionStore: Send + Sync {
    fn insert_session(&self, session: SessionEntity) -> BoxFuture<'static, StorageResult<()>>;
    fn find_session(&self, id: Uuid) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>>;
    /// Most recently created session of the event whose status is one of `statuses`.
    fn find_latest_session(
        &self,
        event_id: Uuid,
        game_type: Option<GameType>,
        statuses: Vec<SessionStatus>,
    ) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>>;
    /// Apply `patch` and return the updated row, `None` when it does not exist.
    fn update_session(
        &self,
        id: Uuid,
        patch: SessionPatch,
    ) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>>;
    fn watch_session(&self, id: Uuid)
    -> BoxFuture<'static, StorageResult<ChangeStream<SessionEntity>>>;

    /// Insert a player; a second row for the same (session, user) fails with
    /// [`StorageError::DuplicateKey`](crate::dao::storage::StorageError::DuplicateKey).
    fn insert_player(&self, player: PlayerEntity) -> BoxFuture<'static, StorageResult<()>>;
    fn list_players(&self, session_id: Uuid)
    -> BoxFuture<'static, StorageResult<Vec<PlayerRecord>>>;
    fn find_player(
        &self,
        session_id: Uuid,
        user_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Option<PlayerEntity>>>;
    fn update_player(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        patch: PlayerPatch,
    ) -> BoxFuture<'static, StorageResult<Option<PlayerEntity>>>;
    /// Add the deltas to score and chips in a single store operation.
    fn increment_player_score(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        score_delta: u32,
        chips_delta: u32,
    ) -> BoxFuture<'static, StorageResult<Option<PlayerEntity>>>;
    fn watch_players(
        &self,
        session_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<ChangeStream<PlayerEntity>>>;

    /// Append an action. The store stamps `created_at` and returns the stored row.
    fn insert_action(&self, action: ActionEntity) -> BoxFuture<'static, StorageResult<ActionEntity>>;
    fn list_actions(
        &self,
        session_id: Uuid,
        round: u32,
    ) -> BoxFuture<'static, StorageResult<Vec<ActionEntity>>>;
    /// Insert notifications for actions of one round of one session.
    fn watch_actions(
        &self,
        session_id: Uuid,
        round: u32,
    ) -> BoxFuture<'static, StorageResult<ChangeStream<ActionEntity>>>;

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>>;
    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>>;
}

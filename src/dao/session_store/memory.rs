//! In-process session store with a broadcast change feed.
//!
//! Backs tests and the offline demo. It mirrors the semantics the hosted store
//! offers: unique player keys, append-only actions, per-row last-write-wins and
//! change streams that end when the connection drops.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, SystemTime},
};

use dashmap::{DashMap, mapref::entry::Entry};
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::{
    sync::{RwLock, broadcast},
    time::sleep,
};
use tokio_stream::{
    StreamExt,
    wrappers::{BroadcastStream, errors::BroadcastStreamRecvError},
};
use tracing::debug;
use uuid::Uuid;

use super::{ChangeStream, SessionStore};
use crate::dao::{
    models::{
        ActionEntity, GameType, PlayerEntity, PlayerPatch, PlayerRecord, ProfileEntity,
        SessionEntity, SessionPatch, SessionStatus,
    },
    storage::{StorageError, StorageResult},
};

const CHANGE_FEED_CAPACITY: usize = 256;

/// Failures specific to the in-memory backend.
#[derive(Debug, Error)]
pub enum MemoryStoreError {
    /// Switched off with `set_online(false)`.
    #[error("memory store is offline")]
    Offline,
}

impl From<MemoryStoreError> for StorageError {
    fn from(err: MemoryStoreError) -> Self {
        StorageError::unavailable(err.to_string(), err)
    }
}

#[derive(Debug, Clone)]
enum StoreChange {
    Session(SessionEntity),
    Player(PlayerEntity),
    Action(ActionEntity),
}

/// Session store living entirely in memory. Cloning shares the same tables.
#[derive(Clone)]
pub struct MemorySessionStore {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    sessions: DashMap<Uuid, SessionEntity>,
    players: DashMap<(Uuid, Uuid), PlayerEntity>,
    actions: DashMap<Uuid, Vec<ActionEntity>>,
    profiles: DashMap<Uuid, ProfileEntity>,
    changes: RwLock<broadcast::Sender<StoreChange>>,
    online: AtomicBool,
    latency: Option<Duration>,
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySessionStore {
    /// Create an empty, online store.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create a store that waits `latency` after every operation, emulating a
    /// network round trip so interleavings between clients become observable.
    pub fn with_latency(latency: Duration) -> Self {
        Self::build(Some(latency))
    }

    fn build(latency: Option<Duration>) -> Self {
        let (sender, _receiver) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            inner: Arc::new(MemoryInner {
                sessions: DashMap::new(),
                players: DashMap::new(),
                actions: DashMap::new(),
                profiles: DashMap::new(),
                changes: RwLock::new(sender),
                online: AtomicBool::new(true),
                latency,
            }),
        }
    }

    /// Register or replace the display profile of a user.
    pub fn put_profile(&self, profile: ProfileEntity) {
        self.inner.profiles.insert(profile.user_id, profile);
    }

    /// Toggle connectivity. While offline every operation fails as unavailable.
    pub fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::SeqCst);
    }

    /// Drop the current change feed so every open stream ends, as a lost
    /// connection would. New subscriptions get a fresh feed.
    pub async fn sever_streams(&self) {
        let (sender, _receiver) = broadcast::channel(CHANGE_FEED_CAPACITY);
        let mut guard = self.inner.changes.write().await;
        *guard = sender;
        debug!("memory store change streams severed");
    }
}

impl MemoryInner {
    fn ensure_online(&self) -> StorageResult<()> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(MemoryStoreError::Offline.into())
        }
    }

    async fn round_trip(&self) {
        if let Some(latency) = self.latency {
            sleep(latency).await;
        }
    }

    async fn publish(&self, change: StoreChange) {
        let guard = self.changes.read().await;
        let _ = guard.send(change);
    }

    async fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.read().await.subscribe()
    }

    fn player_record(&self, player: PlayerEntity) -> PlayerRecord {
        let profile = self
            .profiles
            .get(&player.user_id)
            .map(|entry| entry.value().clone());
        PlayerRecord { player, profile }
    }
}

fn change_stream<T, F>(receiver: broadcast::Receiver<StoreChange>, mut select: F) -> ChangeStream<T>
where
    T: Send + 'static,
    F: FnMut(StoreChange) -> Option<T> + Send + 'static,
{
    let stream = BroadcastStream::new(receiver).filter_map(move |item| match item {
        Ok(change) => select(change).map(Ok),
        Err(BroadcastStreamRecvError::Lagged(skipped)) => Some(Err(StorageError::Lagged { skipped })),
    });
    Box::pin(stream)
}

impl MemoryInner {
    async fn insert_session(&self, session: SessionEntity) -> StorageResult<()> {
        self.ensure_online()?;
        match self.sessions.entry(session.id) {
            Entry::Occupied(_) => {
                return Err(StorageError::DuplicateKey {
                    collection: "sessions",
                    key: session.id.to_string(),
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(session.clone());
            }
        }
        self.publish(StoreChange::Session(session)).await;
        self.round_trip().await;
        Ok(())
    }

    async fn find_session(&self, id: Uuid) -> StorageResult<Option<SessionEntity>> {
        self.ensure_online()?;
        let found = self.sessions.get(&id).map(|entry| entry.value().clone());
        self.round_trip().await;
        Ok(found)
    }

    async fn find_latest_session(
        &self,
        event_id: Uuid,
        game_type: Option<GameType>,
        statuses: Vec<SessionStatus>,
    ) -> StorageResult<Option<SessionEntity>> {
        self.ensure_online()?;
        let latest = self
            .sessions
            .iter()
            .filter(|entry| {
                let session = entry.value();
                session.event_id == event_id
                    && game_type.is_none_or(|game| session.game_type == game)
                    && statuses.contains(&session.status)
            })
            .map(|entry| entry.value().clone())
            .max_by_key(|session| session.created_at);
        self.round_trip().await;
        Ok(latest)
    }

    async fn update_session(
        &self,
        id: Uuid,
        patch: SessionPatch,
    ) -> StorageResult<Option<SessionEntity>> {
        self.ensure_online()?;
        let updated = self.sessions.get_mut(&id).map(|mut entry| {
            patch.apply_to(entry.value_mut());
            entry.value().clone()
        });
        if let Some(session) = &updated {
            self.publish(StoreChange::Session(session.clone())).await;
        }
        self.round_trip().await;
        Ok(updated)
    }

    async fn insert_player(&self, player: PlayerEntity) -> StorageResult<()> {
        self.ensure_online()?;
        match self.players.entry((player.session_id, player.user_id)) {
            Entry::Occupied(_) => {
                return Err(StorageError::DuplicateKey {
                    collection: "players",
                    key: format!("{}:{}", player.session_id, player.user_id),
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(player.clone());
            }
        }
        self.publish(StoreChange::Player(player)).await;
        self.round_trip().await;
        Ok(())
    }

    async fn list_players(&self, session_id: Uuid) -> StorageResult<Vec<PlayerRecord>> {
        self.ensure_online()?;
        let mut players: Vec<PlayerEntity> = self
            .players
            .iter()
            .filter(|entry| entry.key().0 == session_id)
            .map(|entry| entry.value().clone())
            .collect();
        players.sort_by_key(|player| (player.joined_at, player.user_id));
        let records: Vec<PlayerRecord> = players
            .into_iter()
            .map(|player| self.player_record(player))
            .collect();
        self.round_trip().await;
        Ok(records)
    }

    async fn find_player(
        &self,
        session_id: Uuid,
        user_id: Uuid,
    ) -> StorageResult<Option<PlayerEntity>> {
        self.ensure_online()?;
        let found = self
            .players
            .get(&(session_id, user_id))
            .map(|entry| entry.value().clone());
        self.round_trip().await;
        Ok(found)
    }

    async fn update_player(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        patch: PlayerPatch,
    ) -> StorageResult<Option<PlayerEntity>> {
        self.ensure_online()?;
        let updated = self
            .players
            .get_mut(&(session_id, user_id))
            .map(|mut entry| {
                patch.apply_to(entry.value_mut());
                entry.value().clone()
            });
        if let Some(player) = &updated {
            self.publish(StoreChange::Player(player.clone())).await;
        }
        self.round_trip().await;
        Ok(updated)
    }

    async fn increment_player_score(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        score_delta: u32,
        chips_delta: u32,
    ) -> StorageResult<Option<PlayerEntity>> {
        self.ensure_online()?;
        let updated = self
            .players
            .get_mut(&(session_id, user_id))
            .map(|mut entry| {
                let player = entry.value_mut();
                player.score = player.score.saturating_add(score_delta);
                player.chips = player.chips.saturating_add(chips_delta);
                player.clone()
            });
        if let Some(player) = &updated {
            self.publish(StoreChange::Player(player.clone())).await;
        }
        self.round_trip().await;
        Ok(updated)
    }

    async fn insert_action(&self, mut action: ActionEntity) -> StorageResult<ActionEntity> {
        self.ensure_online()?;
        action.created_at = SystemTime::now();
        self.actions
            .entry(action.session_id)
            .or_default()
            .push(action.clone());
        self.publish(StoreChange::Action(action.clone())).await;
        self.round_trip().await;
        Ok(action)
    }

    async fn list_actions(&self, session_id: Uuid, round: u32) -> StorageResult<Vec<ActionEntity>> {
        self.ensure_online()?;
        let actions: Vec<ActionEntity> = self
            .actions
            .get(&session_id)
            .map(|entry| {
                entry
                    .value()
                    .iter()
                    .filter(|action| action.round == round)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        self.round_trip().await;
        Ok(actions)
    }

    async fn watch<T, F>(&self, select: F) -> StorageResult<ChangeStream<T>>
    where
        T: Send + 'static,
        F: FnMut(StoreChange) -> Option<T> + Send + 'static,
    {
        self.ensure_online()?;
        let receiver = self.subscribe().await;
        Ok(change_stream(receiver, select))
    }
}

impl SessionStore for MemorySessionStore {
    fn insert_session(&self, session: SessionEntity) -> BoxFuture<'static, StorageResult<()>> {
        let inner = self.inner.clone();
        Box::pin(async move { inner.insert_session(session).await })
    }

    fn find_session(&self, id: Uuid) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
        let inner = self.inner.clone();
        Box::pin(async move { inner.find_session(id).await })
    }

    fn find_latest_session(
        &self,
        event_id: Uuid,
        game_type: Option<GameType>,
        statuses: Vec<SessionStatus>,
    ) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            inner
                .find_latest_session(event_id, game_type, statuses)
                .await
        })
    }

    fn update_session(
        &self,
        id: Uuid,
        patch: SessionPatch,
    ) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
        let inner = self.inner.clone();
        Box::pin(async move { inner.update_session(id, patch).await })
    }

    fn watch_session(
        &self,
        id: Uuid,
    ) -> BoxFuture<'static, StorageResult<ChangeStream<SessionEntity>>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            inner
                .watch(move |change| match change {
                    StoreChange::Session(session) if session.id == id => Some(session),
                    _ => None,
                })
                .await
        })
    }

    fn insert_player(&self, player: PlayerEntity) -> BoxFuture<'static, StorageResult<()>> {
        let inner = self.inner.clone();
        Box::pin(async move { inner.insert_player(player).await })
    }

    fn list_players(
        &self,
        session_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Vec<PlayerRecord>>> {
        let inner = self.inner.clone();
        Box::pin(async move { inner.list_players(session_id).await })
    }

    fn find_player(
        &self,
        session_id: Uuid,
        user_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Option<PlayerEntity>>> {
        let inner = self.inner.clone();
        Box::pin(async move { inner.find_player(session_id, user_id).await })
    }

    fn update_player(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        patch: PlayerPatch,
    ) -> BoxFuture<'static, StorageResult<Option<PlayerEntity>>> {
        let inner = self.inner.clone();
        Box::pin(async move { inner.update_player(session_id, user_id, patch).await })
    }

    fn increment_player_score(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        score_delta: u32,
        chips_delta: u32,
    ) -> BoxFuture<'static, StorageResult<Option<PlayerEntity>>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            inner
                .increment_player_score(session_id, user_id, score_delta, chips_delta)
                .await
        })
    }

    fn watch_players(
        &self,
        session_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<ChangeStream<PlayerEntity>>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            inner
                .watch(move |change| match change {
                    StoreChange::Player(player) if player.session_id == session_id => Some(player),
                    _ => None,
                })
                .await
        })
    }

    fn insert_action(&self, action: ActionEntity) -> BoxFuture<'static, StorageResult<ActionEntity>> {
        let inner = self.inner.clone();
        Box::pin(async move { inner.insert_action(action).await })
    }

    fn list_actions(
        &self,
        session_id: Uuid,
        round: u32,
    ) -> BoxFuture<'static, StorageResult<Vec<ActionEntity>>> {
        let inner = self.inner.clone();
        Box::pin(async move { inner.list_actions(session_id, round).await })
    }

    fn watch_actions(
        &self,
        session_id: Uuid,
        round: u32,
    ) -> BoxFuture<'static, StorageResult<ChangeStream<ActionEntity>>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            inner
                .watch(move |change| match change {
                    StoreChange::Action(action)
                        if action.session_id == session_id && action.round == round =>
                    {
                        Some(action)
                    }
                    _ => None,
                })
                .await
        })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let inner = self.inner.clone();
        Box::pin(async move { inner.ensure_online() })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        let inner = self.inner.clone();
        Box::pin(async move { inner.ensure_online() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dao::models::{ActionKind, PlayerStatus};
    use serde_json::json;
    use tokio::time::timeout;

    fn session(event_id: Uuid, created_at: SystemTime, status: SessionStatus) -> SessionEntity {
        SessionEntity {
            id: Uuid::new_v4(),
            event_id,
            game_type: GameType::HotSeat,
            host_id: Uuid::new_v4(),
            status,
            current_round: 1,
            total_rounds: 3,
            config: Default::default(),
            created_at,
            started_at: None,
            finished_at: None,
        }
    }

    fn player(session_id: Uuid, user_id: Uuid) -> PlayerEntity {
        PlayerEntity {
            session_id,
            user_id,
            team: None,
            score: 0,
            chips: 0,
            status: PlayerStatus::Joined,
            joined_at: SystemTime::now(),
        }
    }

    #[tokio::test]
    async fn latest_session_skips_finished_and_other_events() {
        let store = MemorySessionStore::new();
        let event_id = Uuid::new_v4();
        let base = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);

        let older = session(event_id, base, SessionStatus::Playing);
        let finished = session(event_id, base + Duration::from_secs(20), SessionStatus::Finished);
        let newer = session(event_id, base + Duration::from_secs(10), SessionStatus::Waiting);
        let foreign = session(Uuid::new_v4(), base + Duration::from_secs(30), SessionStatus::Waiting);
        for row in [&older, &finished, &newer, &foreign] {
            store.insert_session(row.clone()).await.unwrap();
        }

        let found = store
            .find_latest_session(event_id, None, SessionStatus::ACTIVE.to_vec())
            .await
            .unwrap();
        assert_eq!(found.map(|s| s.id), Some(newer.id));
    }

    #[tokio::test]
    async fn duplicate_player_is_rejected() {
        let store = MemorySessionStore::new();
        let session_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();

        store.insert_player(player(session_id, user_id)).await.unwrap();
        let err = store
            .insert_player(player(session_id, user_id))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::DuplicateKey { collection: "players", .. }));
    }

    #[tokio::test]
    async fn offline_store_reports_unavailable() {
        let store = MemorySessionStore::new();
        store.set_online(false);
        let err = store.find_session(Uuid::new_v4()).await.unwrap_err();
        assert!(err.is_unavailable());
        assert!(store.health_check().await.is_err());

        store.set_online(true);
        assert!(store.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn action_stream_only_delivers_matching_round() {
        let store = MemorySessionStore::new();
        let session_id = Uuid::new_v4();
        let mut stream = store.watch_actions(session_id, 2).await.unwrap();

        for round in [1, 2] {
            store
                .insert_action(ActionEntity {
                    id: Uuid::new_v4(),
                    session_id,
                    round,
                    user_id: Uuid::new_v4(),
                    kind: ActionKind::Answer,
                    payload: json!({ "round": round }),
                    created_at: SystemTime::UNIX_EPOCH,
                })
                .await
                .unwrap();
        }

        let delivered = timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(delivered.round, 2);
        assert_ne!(delivered.created_at, SystemTime::UNIX_EPOCH);
    }

    #[tokio::test]
    async fn severing_ends_open_streams() {
        let store = MemorySessionStore::new();
        let mut stream = store.watch_session(Uuid::new_v4()).await.unwrap();
        store.sever_streams().await;
        let next = timeout(Duration::from_secs(1), stream.next()).await.unwrap();
        assert!(next.is_none());
    }
}

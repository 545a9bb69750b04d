//! Change-notification subscriptions scoped to a session.
//!
//! Every subscription runs a forwarder task that pulls the store's change
//! stream and invokes the registered callback. A watchdog reopens streams
//! that ended or stayed silent for too long and resyncs the callback with the
//! current rows, so events missed while disconnected are recovered.

use std::{
    fmt,
    future::Future,
    sync::{
        Arc, OnceLock, Weak,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use futures::StreamExt;
use tokio::{
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    dao::{
        models::{ActionEntity, PlayerEntity, SessionEntity},
        repository::SessionRepository,
        session_store::ChangeStream,
        storage::StorageError,
    },
    error::ServiceError,
    state::{
        ConnectionHealth,
        session::{Action, Player, Session, SessionId},
    },
};

/// Callback receiving the full session row on every change.
pub type SessionCallback = Arc<dyn Fn(Session) + Send + Sync>;
/// Callback receiving the full player set whenever any player row changes.
pub type PlayersCallback = Arc<dyn Fn(Vec<Player>) + Send + Sync>;
/// Callback receiving each newly inserted action.
pub type ActionCallback = Arc<dyn Fn(Action) + Send + Sync>;

/// Opaque handle returned by the subscribe operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(Uuid);

/// What a subscription listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionScope {
    /// The session row.
    Session(SessionId),
    /// Every player row of the session.
    Players(SessionId),
    /// Action inserts of one round.
    Actions {
        /// Session of the actions.
        session_id: SessionId,
        /// Round of the actions.
        round: u32,
    },
}

#[derive(Clone)]
enum Feed {
    Session {
        session_id: SessionId,
        on_change: SessionCallback,
    },
    Players {
        session_id: SessionId,
        on_change: PlayersCallback,
    },
    Actions {
        session_id: SessionId,
        round: u32,
        on_action: ActionCallback,
    },
}

impl fmt::Debug for Feed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.scope(), f)
    }
}

impl Feed {
    fn scope(&self) -> SubscriptionScope {
        match self {
            Feed::Session { session_id, .. } => SubscriptionScope::Session(*session_id),
            Feed::Players { session_id, .. } => SubscriptionScope::Players(*session_id),
            Feed::Actions {
                session_id, round, ..
            } => SubscriptionScope::Actions {
                session_id: *session_id,
                round: *round,
            },
        }
    }

    /// Deliver the current rows of the scope.
    async fn resync(&self, repository: &SessionRepository) {
        let result = match self {
            Feed::Session {
                session_id,
                on_change,
            } => repository.get_session(*session_id).await.map(|session| {
                if let Some(session) = session {
                    on_change(session);
                }
            }),
            Feed::Players {
                session_id,
                on_change,
            } => repository
                .get_players(*session_id)
                .await
                .map(|players| on_change(players)),
            Feed::Actions {
                session_id,
                round,
                on_action,
            } => repository
                .get_round_actions(*session_id, *round)
                .await
                .map(|actions| actions.into_iter().for_each(|action| on_action(action))),
        };

        if let Err(err) = result {
            warn!(scope = ?self.scope(), error = %err, "subscription resync failed");
        }
    }
}

/// Last time a subscription saw traffic, in milliseconds since the multiplexer started.
#[derive(Clone)]
struct ActivityClock {
    epoch: Instant,
    last_ms: Arc<AtomicU64>,
}

impl ActivityClock {
    fn new(epoch: Instant) -> Self {
        let clock = Self {
            epoch,
            last_ms: Arc::new(AtomicU64::new(0)),
        };
        clock.touch();
        clock
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn touch(&self) {
        self.last_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = self.last_ms.load(Ordering::Relaxed);
        Duration::from_millis(self.now_ms().saturating_sub(last))
    }
}

struct Subscription {
    feed: Feed,
    clock: ActivityClock,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    fn is_open(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

/// Registry of open subscriptions. Cloning shares the registry.
#[derive(Clone)]
pub struct SubscriptionMultiplexer {
    inner: Arc<MultiplexerInner>,
}

struct MultiplexerInner {
    repository: SessionRepository,
    subscriptions: DashMap<Uuid, Subscription>,
    epoch: Instant,
    failed_sweeps: AtomicU32,
    watchdog: OnceLock<JoinHandle<()>>,
}

impl Drop for MultiplexerInner {
    fn drop(&mut self) {
        if let Some(watchdog) = self.watchdog.get() {
            watchdog.abort();
        }
        for entry in self.subscriptions.iter() {
            if let Some(task) = &entry.value().task {
                task.abort();
            }
        }
    }
}

impl SubscriptionMultiplexer {
    /// Multiplexer reading through `repository`.
    pub fn new(repository: SessionRepository) -> Self {
        Self {
            inner: Arc::new(MultiplexerInner {
                repository,
                subscriptions: DashMap::new(),
                epoch: Instant::now(),
                failed_sweeps: AtomicU32::new(0),
                watchdog: OnceLock::new(),
            }),
        }
    }

    /// Invoke `on_change` with the full session whenever it changes.
    pub async fn subscribe_to_session<F>(&self, session_id: SessionId, on_change: F) -> SubscriptionHandle
    where
        F: Fn(Session) + Send + Sync + 'static,
    {
        self.register(Feed::Session {
            session_id,
            on_change: Arc::new(on_change),
        })
        .await
    }

    /// Invoke `on_change` with the full player set whenever any player row changes.
    pub async fn subscribe_to_players<F>(&self, session_id: SessionId, on_change: F) -> SubscriptionHandle
    where
        F: Fn(Vec<Player>) + Send + Sync + 'static,
    {
        self.register(Feed::Players {
            session_id,
            on_change: Arc::new(on_change),
        })
        .await
    }

    /// Invoke `on_action` once per action inserted for `round`. Historical
    /// actions are not replayed; fetch them separately on round entry.
    pub async fn subscribe_to_actions<F>(
        &self,
        session_id: SessionId,
        round: u32,
        on_action: F,
    ) -> SubscriptionHandle
    where
        F: Fn(Action) + Send + Sync + 'static,
    {
        self.register(Feed::Actions {
            session_id,
            round,
            on_action: Arc::new(on_action),
        })
        .await
    }

    /// Release the subscription. Unknown or already released handles are ignored.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        if let Some((_, subscription)) = self.inner.subscriptions.remove(&handle.0) {
            if let Some(task) = subscription.task {
                task.abort();
            }
            debug!(scope = ?subscription.feed.scope(), "unsubscribed");
        }
    }

    /// Release every handle in `handles`.
    pub fn unsubscribe_all(&self, handles: impl IntoIterator<Item = SubscriptionHandle>) {
        for handle in handles {
            self.unsubscribe(handle);
        }
    }

    /// Scope of a registered subscription.
    pub fn scope(&self, handle: SubscriptionHandle) -> Option<SubscriptionScope> {
        self.inner
            .subscriptions
            .get(&handle.0)
            .map(|entry| entry.value().feed.scope())
    }

    /// Whether the handle's stream is currently delivering.
    pub fn is_open(&self, handle: SubscriptionHandle) -> bool {
        self.inner
            .subscriptions
            .get(&handle.0)
            .is_some_and(|entry| entry.value().is_open())
    }

    /// Number of registered subscriptions, open or awaiting reopen.
    pub fn active_count(&self) -> usize {
        self.inner.subscriptions.len()
    }

    /// Start the periodic idle watchdog. Calling it again is a no-op.
    pub fn spawn_watchdog(&self) {
        if self.inner.watchdog.get().is_some() {
            return;
        }

        let period = self
            .inner
            .repository
            .context()
            .config()
            .watchdog_interval;
        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(run_watchdog(weak, period));
        if let Err(duplicate) = self.inner.watchdog.set(task) {
            duplicate.abort();
        }
    }

    /// Reopen every subscription whose stream ended or stayed idle longer
    /// than the configured threshold, then resync it. Returns how many were
    /// reopened.
    pub async fn resubscribe_stale(&self) -> usize {
        let context = self.inner.repository.context().clone();
        let idle_after = context.config().idle_resubscribe_after;

        let stale: Vec<(Uuid, Feed, ActivityClock)> = self
            .inner
            .subscriptions
            .iter()
            .filter(|entry| {
                let subscription = entry.value();
                !subscription.is_open() || subscription.clock.idle_for() >= idle_after
            })
            .map(|entry| {
                let subscription = entry.value();
                (
                    *entry.key(),
                    subscription.feed.clone(),
                    subscription.clock.clone(),
                )
            })
            .collect();

        if stale.is_empty() {
            return 0;
        }

        let mut reopened = 0;
        let mut failed = 0;
        for (id, feed, clock) in stale {
            let task = match self.open(&feed, &clock).await {
                Ok(task) => task,
                Err(ServiceError::Degraded) => {
                    debug!(scope = ?feed.scope(), "no store installed; subscription stays closed");
                    continue;
                }
                Err(err) => {
                    warn!(scope = ?feed.scope(), error = %err, "failed to reopen subscription");
                    failed += 1;
                    continue;
                }
            };

            let mut pending = Some(task);
            if let Some(mut entry) = self.inner.subscriptions.get_mut(&id) {
                if let Some(previous) = entry.task.take() {
                    previous.abort();
                }
                entry.task = pending.take();
            }
            if let Some(orphan) = pending {
                // Unsubscribed while reopening.
                orphan.abort();
                continue;
            }

            clock.touch();
            feed.resync(&self.inner.repository).await;
            reopened += 1;
        }

        if failed > 0 {
            let attempt = self.inner.failed_sweeps.fetch_add(1, Ordering::SeqCst) + 1;
            context.update_health(ConnectionHealth::Reconnecting { attempt });
        } else if self.inner.failed_sweeps.swap(0, Ordering::SeqCst) > 0 {
            info!(reopened, "subscriptions restored");
            context.update_health(ConnectionHealth::Connected);
        }

        reopened
    }

    async fn register(&self, feed: Feed) -> SubscriptionHandle {
        let id = Uuid::new_v4();
        let clock = ActivityClock::new(self.inner.epoch);
        let task = match self.open(&feed, &clock).await {
            Ok(task) => Some(task),
            Err(err) => {
                warn!(scope = ?feed.scope(), error = %err, "subscription not opened; watchdog will retry");
                None
            }
        };

        debug!(scope = ?feed.scope(), open = task.is_some(), "subscribed");
        self.inner
            .subscriptions
            .insert(id, Subscription { feed, clock, task });
        SubscriptionHandle(id)
    }

    async fn open(&self, feed: &Feed, clock: &ActivityClock) -> Result<JoinHandle<()>, ServiceError> {
        let store = self.inner.repository.context().require_store().await?;
        let repository = self.inner.repository.clone();

        let task = match feed {
            Feed::Session {
                session_id,
                on_change,
            } => {
                let stream = store.watch_session(*session_id).await?;
                let on_change = on_change.clone();
                spawn_forwarder(stream, clock.clone(), feed.clone(), repository, move |entity: SessionEntity| {
                    on_change(entity.into());
                    async {}
                })
            }
            Feed::Players {
                session_id,
                on_change,
            } => {
                let stream = store.watch_players(*session_id).await?;
                let session_id = *session_id;
                let on_change = on_change.clone();
                let fetcher = repository.clone();
                spawn_forwarder(stream, clock.clone(), feed.clone(), repository, move |_: PlayerEntity| {
                    let fetcher = fetcher.clone();
                    let on_change = on_change.clone();
                    async move {
                        match fetcher.get_players(session_id).await {
                            Ok(players) => on_change(players),
                            Err(err) => {
                                warn!(%session_id, error = %err, "failed to refetch players after change")
                            }
                        }
                    }
                })
            }
            Feed::Actions {
                session_id,
                round,
                on_action,
            } => {
                let stream = store.watch_actions(*session_id, *round).await?;
                let on_action = on_action.clone();
                spawn_forwarder(stream, clock.clone(), feed.clone(), repository, move |entity: ActionEntity| {
                    on_action(entity.into());
                    async {}
                })
            }
        };

        Ok(task)
    }
}

fn spawn_forwarder<T, F, Fut>(
    mut stream: ChangeStream<T>,
    clock: ActivityClock,
    feed: Feed,
    repository: SessionRepository,
    mut deliver: F,
) -> JoinHandle<()>
where
    T: Send + 'static,
    F: FnMut(T) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        while let Some(item) = stream.next().await {
            clock.touch();
            match item {
                Ok(change) => deliver(change).await,
                Err(StorageError::Lagged { skipped }) => {
                    warn!(scope = ?feed.scope(), skipped, "subscription lagged; resyncing");
                    feed.resync(&repository).await;
                }
                Err(err) => {
                    warn!(scope = ?feed.scope(), error = %err, "subscription stream failed");
                    break;
                }
            }
        }
        debug!(scope = ?feed.scope(), "subscription stream ended");
    })
}

async fn run_watchdog(inner: Weak<MultiplexerInner>, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let multiplexer = SubscriptionMultiplexer { inner };
        let reopened = multiplexer.resubscribe_stale().await;
        if reopened > 0 {
            debug!(reopened, "watchdog reopened subscriptions");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::{Map, json};
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use super::*;
    use crate::{
        config::AppConfig,
        dao::{models::PlayerStatus, session_store::memory::MemorySessionStore},
        dto::session::CreateSessionRequest,
        state::{
            SyncContext,
            session::{ActionKind, GameType},
        },
    };

    const WAIT: Duration = Duration::from_secs(2);

    fn setup(config: AppConfig) -> (MemorySessionStore, SessionRepository, SubscriptionMultiplexer) {
        let store = MemorySessionStore::new();
        let repository =
            SessionRepository::new(SyncContext::with_store(config, Arc::new(store.clone())));
        let multiplexer = SubscriptionMultiplexer::new(repository.clone());
        (store, repository, multiplexer)
    }

    async fn create(repository: &SessionRepository) -> Session {
        repository
            .create_session(CreateSessionRequest {
                event_id: Uuid::new_v4(),
                game_type: GameType::NeverHaveIEver,
                host_id: Uuid::new_v4(),
                total_rounds: 3,
                config: Map::new(),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn session_changes_are_delivered() {
        let (_store, repository, multiplexer) = setup(AppConfig::default());
        let session = create(&repository).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = multiplexer
            .subscribe_to_session(session.id, move |s| {
                let _ = tx.send(s);
            })
            .await;
        assert!(multiplexer.is_open(handle));

        repository.start_game(session.id).await.unwrap();
        let seen = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(seen.status, crate::state::session::SessionStatus::Playing);
    }

    #[tokio::test]
    async fn player_change_delivers_full_set() {
        let (_store, repository, multiplexer) = setup(AppConfig::default());
        let session = create(&repository).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        multiplexer
            .subscribe_to_players(session.id, move |players| {
                let _ = tx.send(players);
            })
            .await;

        repository.join_session(session.id, Uuid::new_v4(), None).await.unwrap();
        repository.join_session(session.id, Uuid::new_v4(), None).await.unwrap();

        let mut last = Vec::new();
        while last.len() < 2 {
            last = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        }
        assert!(last.iter().all(|p| p.status == PlayerStatus::Joined));
    }

    #[tokio::test]
    async fn action_feed_is_scoped_to_round() {
        let (_store, repository, multiplexer) = setup(AppConfig::default());
        let session = create(&repository).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        multiplexer
            .subscribe_to_actions(session.id, 2, move |action| {
                let _ = tx.send(action);
            })
            .await;

        let user = Uuid::new_v4();
        repository
            .submit_action(session.id, user, 1, ActionKind::Answer, json!("one"))
            .await
            .unwrap();
        repository
            .submit_action(session.id, user, 2, ActionKind::Answer, json!("two"))
            .await
            .unwrap();

        let action = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(action.round, 2);
        assert_eq!(action.payload, json!("two"));
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let (_store, repository, multiplexer) = setup(AppConfig::default());
        let session = create(&repository).await;
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        let handle = multiplexer
            .subscribe_to_session(session.id, move |_| {
                if let Ok(mut calls) = counter.lock() {
                    *calls += 1;
                }
            })
            .await;

        multiplexer.unsubscribe(handle);
        multiplexer.unsubscribe(handle);
        multiplexer.unsubscribe_all([handle, handle]);
        assert_eq!(multiplexer.active_count(), 0);
        assert!(!multiplexer.is_open(handle));

        repository.start_game(session.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn severed_stream_is_reopened_and_resynced() {
        let (store, repository, multiplexer) = setup(AppConfig::default());
        let session = create(&repository).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = multiplexer
            .subscribe_to_session(session.id, move |s| {
                let _ = tx.send(s);
            })
            .await;

        store.sever_streams().await;
        timeout(WAIT, async {
            while multiplexer.is_open(handle) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // Missed while disconnected.
        repository.start_game(session.id).await.unwrap();
        assert_eq!(multiplexer.resubscribe_stale().await, 1);
        assert!(multiplexer.is_open(handle));

        let resynced = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(resynced.status, crate::state::session::SessionStatus::Playing);

        repository.advance_round(session.id, 1).await.unwrap();
        let live = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(live.current_round, 2);
    }

    #[tokio::test]
    async fn idle_streams_are_refreshed() {
        let config = AppConfig {
            idle_resubscribe_after: Duration::from_millis(20),
            ..AppConfig::default()
        };
        let (_store, repository, multiplexer) = setup(config);
        let session = create(&repository).await;
        let handle = multiplexer.subscribe_to_session(session.id, |_| {}).await;

        assert_eq!(multiplexer.resubscribe_stale().await, 0);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(multiplexer.resubscribe_stale().await, 1);
        assert!(multiplexer.is_open(handle));
        assert_eq!(multiplexer.scope(handle), Some(SubscriptionScope::Session(session.id)));
    }

    #[tokio::test]
    async fn failed_reopen_reports_reconnecting() {
        let (store, repository, multiplexer) = setup(AppConfig::default());
        let session = create(&repository).await;
        let handle = multiplexer.subscribe_to_session(session.id, |_| {}).await;
        let context = repository.context().clone();

        store.set_online(false);
        store.sever_streams().await;
        timeout(WAIT, async {
            while multiplexer.is_open(handle) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(multiplexer.resubscribe_stale().await, 0);
        assert_eq!(context.health(), ConnectionHealth::Reconnecting { attempt: 1 });

        store.set_online(true);
        assert_eq!(multiplexer.resubscribe_stale().await, 1);
        assert_eq!(context.health(), ConnectionHealth::Connected);
    }

    #[tokio::test]
    async fn subscription_opened_while_degraded_waits_for_store() {
        let context = SyncContext::new(AppConfig::default());
        let repository = SessionRepository::new(context.clone());
        let multiplexer = SubscriptionMultiplexer::new(repository.clone());

        let handle = multiplexer.subscribe_to_session(Uuid::new_v4(), |_| {}).await;
        assert!(!multiplexer.is_open(handle));
        assert_eq!(multiplexer.resubscribe_stale().await, 0);

        context.install_store(Arc::new(MemorySessionStore::new())).await;
        assert_eq!(multiplexer.resubscribe_stale().await, 1);
        assert!(multiplexer.is_open(handle));
    }
}

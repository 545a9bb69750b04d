//! Per-client driver of one game session.
//!
//! A controller discovers the event's active session, joins it, keeps a local
//! mirror of the session row, the player set and the current round's actions,
//! and exposes the host transitions. Remote updates arrive through the
//! multiplexer and are applied in order by a single pump task; the host's own
//! writes go through the [`PhaseCoordinator`] so a transition is never planned
//! twice. Every change republishes a [`ControllerView`] on a `watch` channel.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use indexmap::IndexMap;
use serde_json::{Map, Value};
use tokio::{
    sync::{Mutex, RwLock, mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    config::AppConfig,
    dao::repository::SessionRepository,
    dto::session::CreateSessionRequest,
    error::ServiceError,
    services::{
        identity::UserIdProvider,
        multiplexer::{SubscriptionHandle, SubscriptionMultiplexer},
    },
    state::{
        ConnectionHealth, PhaseCoordinator, SharedEvent, SharedPhase,
        local_phase::{InvalidLocalTransition, LocalEvent, LocalPhase, LocalPhaseMachine},
        session::{
            Action, ActionId, ActionKind, EventId, GameType, Player, PlayerStatus, Session,
            SessionId, SessionStatus, SubmissionPolicy, UserId,
        },
        teams::{TeamTotals, Teams, TurnOrder},
    },
};

/// Knobs of a controller, usually derived from [`AppConfig`].
#[derive(Debug, Clone, Copy)]
pub struct ControllerOptions {
    /// Join the discovered session on mount.
    pub auto_join: bool,
    /// How multiple submissions of one player in a round are treated.
    pub submission_policy: SubmissionPolicy,
    /// Upper bound for a host transition's store write.
    pub transition_timeout: Option<Duration>,
}

impl ControllerOptions {
    /// Take the controller knobs from the runtime configuration.
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            auto_join: config.auto_join,
            submission_policy: config.submission_policy,
            transition_timeout: config.transition_timeout,
        }
    }
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// What the host asked [`GameSessionController::advance`] to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundAdvance {
    /// Moved to this round.
    NextRound(u32),
    /// The last round was played; the session is finished.
    Finished,
}

/// Everything a screen renders, recomputed on every change.
#[derive(Debug, Clone, Default)]
pub struct ControllerView {
    /// Session this client follows, if any.
    pub session: Option<Session>,
    /// Shared phase reconciled from the session row.
    pub shared_phase: Option<SharedPhase>,
    /// Screen-level phase of this device.
    pub local_phase: LocalPhase,
    /// Signed-in user, if any.
    pub user_id: Option<UserId>,
    /// Whether the signed-in user hosts the session.
    pub is_host: bool,
    /// This client's own player row, once joined.
    pub current_player: Option<Player>,
    /// Players of the session in join order.
    pub players: Vec<Player>,
    /// Buffered actions of the current round, in arrival order.
    pub actions: Vec<Action>,
    /// Actions after the submission policy, in submission order.
    pub revealed: Vec<Action>,
    /// Score and chip sums per team.
    pub team_totals: TeamTotals,
    /// Every player has an action in the current round.
    pub all_submitted: bool,
    /// Store connection as last reported by the supervisor.
    pub health: ConnectionHealth,
    /// An operation is in flight.
    pub loading: bool,
    /// Last operation failure, cleared by the next success.
    pub error: Option<String>,
}

impl ControllerView {
    /// Whether the current round is the session's last.
    pub fn is_last_round(&self) -> bool {
        self.session.as_ref().is_some_and(Session::is_last_round)
    }

    /// Whether `index` is the last position of the player list.
    pub fn is_last_player(&self, index: usize) -> bool {
        !self.players.is_empty() && index + 1 == self.players.len()
    }

    /// Men/women/unassigned split of the players.
    pub fn teams(&self) -> Teams {
        Teams::partition(&self.players)
    }

    /// Player whose turn it is in a hot-seat round.
    pub fn hot_seat(&self) -> Option<UserId> {
        let session = self.session.as_ref()?;
        TurnOrder::from_players(&self.players).player_for_round(session.current_round)
    }
}

enum ControllerEvent {
    SessionChanged(Session),
    PlayersChanged(Vec<Player>),
    ActionInserted(Action),
}

#[derive(Default)]
struct Subscriptions {
    session: Option<SubscriptionHandle>,
    players: Option<SubscriptionHandle>,
    actions: Option<(u32, SubscriptionHandle)>,
}

impl Subscriptions {
    fn drain(&mut self) -> Vec<SubscriptionHandle> {
        let mut handles = Vec::with_capacity(3);
        handles.extend(self.session.take());
        handles.extend(self.players.take());
        handles.extend(self.actions.take().map(|(_, handle)| handle));
        handles
    }
}

#[derive(Default)]
struct ControllerState {
    session: Option<Session>,
    players: IndexMap<UserId, Player>,
    actions: IndexMap<ActionId, Action>,
    local: LocalPhaseMachine,
    loading: bool,
    error: Option<String>,
    subscriptions: Subscriptions,
    mounted: bool,
}

impl ControllerState {
    fn session_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(|session| session.id)
    }

    fn playing_round(&self) -> Option<(SessionId, u32)> {
        self.session
            .as_ref()
            .filter(|session| session.status == SessionStatus::Playing)
            .map(|session| (session.id, session.current_round))
    }

    fn is_member(&self, user_id: Option<UserId>) -> bool {
        user_id.is_some_and(|user_id| self.players.contains_key(&user_id))
    }

    fn all_submitted(&self) -> bool {
        !self.players.is_empty()
            && self
                .players
                .keys()
                .all(|user_id| self.actions.values().any(|a| a.user_id == *user_id))
    }

    fn nudge_local(&mut self, event: LocalEvent) {
        if let Err(err) = self.local.handle(event) {
            debug!(error = %err, "local event ignored");
        }
    }

    /// Buffer actions of the current round, dropping duplicates and stragglers.
    fn record_actions(&mut self, actions: impl IntoIterator<Item = Action>) {
        let Some((session_id, round)) = self.playing_round() else {
            return;
        };
        let before = self.all_submitted();
        for action in actions {
            if action.session_id == session_id && action.round == round {
                self.actions.entry(action.id).or_insert(action);
            }
        }
        if !before && self.all_submitted() {
            self.nudge_local(LocalEvent::AllSubmitted);
        }
    }

    fn replace_players(&mut self, players: Vec<Player>) {
        let before = self.all_submitted();
        self.players = players
            .into_iter()
            .map(|player| (player.user_id, player))
            .collect();
        if !before && self.all_submitted() {
            self.nudge_local(LocalEvent::AllSubmitted);
        }
    }
}

struct ControllerInner {
    repository: SessionRepository,
    multiplexer: SubscriptionMultiplexer,
    identity: Arc<dyn UserIdProvider>,
    event_id: EventId,
    game_type: GameType,
    options: ControllerOptions,
    phase: PhaseCoordinator,
    state: RwLock<ControllerState>,
    view: watch::Sender<ControllerView>,
    events: mpsc::UnboundedSender<ControllerEvent>,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<ControllerEvent>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Drives one client through the lifecycle of a game session.
#[derive(Clone)]
pub struct GameSessionController {
    inner: Arc<ControllerInner>,
}

impl GameSessionController {
    /// Build an idle controller; nothing is read or subscribed before [`Self::mount`].
    pub fn new(
        repository: SessionRepository,
        multiplexer: SubscriptionMultiplexer,
        identity: Arc<dyn UserIdProvider>,
        event_id: EventId,
        game_type: GameType,
        options: ControllerOptions,
    ) -> Self {
        let (events, inbox) = mpsc::unbounded_channel();
        let (view, _rx) = watch::channel(ControllerView::default());
        Self {
            inner: Arc::new(ControllerInner {
                repository,
                multiplexer,
                identity,
                event_id,
                game_type,
                phase: PhaseCoordinator::new(options.transition_timeout),
                options,
                state: RwLock::new(ControllerState::default()),
                view,
                events,
                inbox: Mutex::new(Some(inbox)),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Discover the event's active session, adopt it and, when configured,
    /// join it. Never creates a session; returns `None` when there is none.
    pub async fn mount(&self) -> Result<Option<Session>, ServiceError> {
        let inner = &self.inner;
        inner.ensure_running().await?;
        inner.multiplexer.spawn_watchdog();
        inner.set_loading(true).await;
        let result = inner.discover().await;
        inner.set_loading(false).await;
        inner.settle(result).await
    }

    /// Create a session for the event with this client as host, join it and
    /// adopt it.
    pub async fn create_session(&self, total_rounds: u32) -> Result<Session, ServiceError> {
        let result = self.inner.create(total_rounds).await;
        self.inner.settle(result).await
    }

    /// Join the adopted session. Joining twice is a no-op.
    pub async fn join_session(&self) -> Result<(), ServiceError> {
        let result = self.inner.join().await;
        self.inner.settle(result).await
    }

    /// Start the game. Ignored for non-hosts.
    pub async fn start(&self) -> Result<(), ServiceError> {
        let inner = &self.inner;
        let Some(session) = inner.hosted_session().await else {
            debug!("start ignored; not the host");
            return Ok(());
        };
        let result = inner
            .phase
            .run_transition(SharedEvent::Start, |_| {
                inner.repository.start_game(session.id)
            })
            .await;
        let result = match result {
            Ok((updated, _)) => {
                inner.observe_session(updated).await;
                Ok(())
            }
            Err(err) => Err(err),
        };
        inner.settle(result).await
    }

    /// Submit this client's answer for the current round. Returns `None`
    /// when the client is not a member of the session.
    pub async fn submit_answer(
        &self,
        kind: ActionKind,
        payload: Value,
    ) -> Result<Option<Action>, ServiceError> {
        let result = self.inner.submit(kind, payload).await;
        self.inner.settle(result).await
    }

    /// Move to the next round. Ignored for non-hosts; refused past the last round.
    pub async fn next_round(&self) -> Result<Option<u32>, ServiceError> {
        let result = self.inner.next_round().await;
        self.inner.settle(result).await
    }

    /// Next round, or finish when the last round was just played. `None` for
    /// non-hosts; refused outside the playing status.
    pub async fn advance(&self) -> Result<Option<RoundAdvance>, ServiceError> {
        let Some(session) = self.inner.hosted_session().await else {
            return Ok(None);
        };
        if session.status != SessionStatus::Playing {
            let err = ServiceError::InvalidState("rounds only advance while playing".into());
            return self.inner.settle(Err(err)).await;
        }
        if session.is_last_round() {
            self.finish().await?;
            return Ok(Some(RoundAdvance::Finished));
        }
        Ok(self.next_round().await?.map(RoundAdvance::NextRound))
    }

    /// Finish the session. Any participant may call this; finishing twice is a no-op.
    pub async fn finish(&self) -> Result<(), ServiceError> {
        let result = self.inner.finish().await;
        self.inner.settle(result).await
    }

    /// Add to this client's score and chips in the background. Failures are
    /// logged and never surfaced.
    pub fn add_score(&self, points: u32, chips: u32) -> JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let Some(user_id) = inner.user_id() else {
                debug!("score update skipped; identity unresolved");
                return;
            };
            let session_id = {
                let state = inner.state.read().await;
                match state.session_id() {
                    Some(session_id) if state.is_member(Some(user_id)) => session_id,
                    _ => {
                        debug!(%user_id, "score update skipped; not a member");
                        return;
                    }
                }
            };
            if let Err(err) = inner
                .repository
                .update_player_score(session_id, user_id, points, chips)
                .await
            {
                warn!(%session_id, %user_id, error = %err, "score update failed");
            }
        })
    }

    /// Split players into men and women teams. Ignored for non-hosts.
    pub async fn assign_teams(&self) -> Result<(), ServiceError> {
        let inner = &self.inner;
        let Some(session) = inner.hosted_session().await else {
            return Ok(());
        };
        let result = match inner.repository.assign_teams_by_gender(session.id).await {
            Ok(players) => {
                inner.state.write().await.replace_players(players);
                inner.publish_view().await;
                Ok(())
            }
            Err(err) => Err(err),
        };
        inner.settle(result).await
    }

    /// Mark this client's player as ready.
    pub async fn mark_ready(&self) -> Result<(), ServiceError> {
        let result = self.inner.mark_ready().await;
        self.inner.settle(result).await
    }

    /// Feed a screen-driven event to the local phase machine.
    pub async fn local_event(&self, event: LocalEvent) -> Result<LocalPhase, InvalidLocalTransition> {
        let outcome = self.inner.state.write().await.local.handle(event);
        self.inner.publish_view().await;
        outcome
    }

    /// Release every subscription and stop background work. In-flight writes
    /// still complete but their results are no longer applied. The controller
    /// cannot be mounted again.
    pub async fn unmount(&self) {
        let inner = &self.inner;
        let handles = {
            let mut state = inner.state.write().await;
            state.mounted = false;
            state.subscriptions.drain()
        };
        inner.multiplexer.unsubscribe_all(handles);
        for task in inner.tasks.lock().await.drain(..) {
            task.abort();
        }
        info!(event_id = %inner.event_id, "controller unmounted");
    }

    /// Latest view.
    pub fn view(&self) -> ControllerView {
        self.inner.view.borrow().clone()
    }

    /// Receive every republished view.
    pub fn subscribe(&self) -> watch::Receiver<ControllerView> {
        self.inner.view.subscribe()
    }

    /// See [`ControllerView::is_host`].
    pub fn is_host(&self) -> bool {
        self.inner.view.borrow().is_host
    }

    /// This client's own player row, once joined.
    pub fn current_player(&self) -> Option<Player> {
        self.inner.view.borrow().current_player.clone()
    }

    /// See [`ControllerView::teams`].
    pub fn teams(&self) -> Teams {
        self.inner.view.borrow().teams()
    }

    /// Score and chip sums per team.
    pub fn team_totals(&self) -> TeamTotals {
        self.inner.view.borrow().team_totals
    }

    /// See [`ControllerView::is_last_round`].
    pub fn is_last_round(&self) -> bool {
        self.inner.view.borrow().is_last_round()
    }

    /// See [`ControllerView::is_last_player`].
    pub fn is_last_player(&self, index: usize) -> bool {
        self.inner.view.borrow().is_last_player(index)
    }

    /// See [`ControllerView::hot_seat`].
    pub fn hot_seat(&self) -> Option<UserId> {
        self.inner.view.borrow().hot_seat()
    }

    /// Whether every player submitted in the current round.
    pub fn all_submitted(&self) -> bool {
        self.inner.view.borrow().all_submitted
    }

    /// Current round's actions after the submission policy.
    pub fn revealed_actions(&self) -> Vec<Action> {
        self.inner.view.borrow().revealed.clone()
    }
}

impl ControllerInner {
    fn user_id(&self) -> Option<UserId> {
        self.identity.current_user_id()
    }

    /// Start the event pump and the health and identity followers on first use.
    async fn ensure_running(self: &Arc<Self>) -> Result<(), ServiceError> {
        let Some(inbox) = self.inbox.lock().await.take() else {
            let tasks = self.tasks.lock().await;
            if tasks.is_empty() {
                return Err(ServiceError::InvalidState(
                    "controller was unmounted".into(),
                ));
            }
            return Ok(());
        };

        let pump = tokio::spawn(run_pump(Arc::downgrade(self), inbox));
        let health = tokio::spawn(follow_health(
            Arc::downgrade(self),
            self.repository.context().health_watcher(),
        ));
        self.tasks.lock().await.extend([pump, health]);
        if let Some(changes) = self.identity.changes() {
            let identity = tokio::spawn(follow_identity(Arc::downgrade(self), changes));
            self.tasks.lock().await.push(identity);
        }
        self.state.write().await.mounted = true;
        Ok(())
    }

    async fn settle<T>(&self, result: Result<T, ServiceError>) -> Result<T, ServiceError> {
        match result {
            Ok(value) => {
                let cleared = self.state.write().await.error.take().is_some();
                if cleared {
                    self.publish_view().await;
                }
                Ok(value)
            }
            Err(err) if err.is_benign() => Err(err),
            Err(err) => {
                warn!(event_id = %self.event_id, error = %err, "controller operation failed");
                self.state.write().await.error = Some(err.to_string());
                self.publish_view().await;
                Err(err)
            }
        }
    }

    async fn set_loading(&self, loading: bool) {
        self.state.write().await.loading = loading;
        self.publish_view().await;
    }

    async fn publish_view(&self) {
        let view = {
            let state = self.state.read().await;
            self.build_view(&state)
        };
        self.view.send_replace(view);
    }

    fn build_view(&self, state: &ControllerState) -> ControllerView {
        let user_id = self.user_id();
        let players: Vec<Player> = state.players.values().cloned().collect();
        let actions: Vec<Action> = state.actions.values().cloned().collect();
        ControllerView {
            shared_phase: state.session.as_ref().map(SharedPhase::of),
            is_host: matches!((&state.session, user_id), (Some(s), Some(u)) if s.host_id == u),
            current_player: user_id.and_then(|u| state.players.get(&u).cloned()),
            team_totals: TeamTotals::from_players(&players),
            revealed: self.options.submission_policy.reveal(&actions),
            all_submitted: state.all_submitted(),
            session: state.session.clone(),
            local_phase: state.local.phase(),
            health: self.repository.context().health(),
            loading: state.loading,
            error: state.error.clone(),
            user_id,
            players,
            actions,
        }
    }

    async fn hosted_session(&self) -> Option<Session> {
        let user_id = self.user_id()?;
        let state = self.state.read().await;
        state
            .session
            .clone()
            .filter(|session| session.host_id == user_id)
    }

    async fn discover(&self) -> Result<Option<Session>, ServiceError> {
        let Some(session) = self
            .repository
            .get_active_session(self.event_id, Some(self.game_type))
            .await
        else {
            info!(event_id = %self.event_id, "no active session; waiting for a host");
            return Ok(None);
        };

        self.adopt(session.clone()).await?;
        if self.options.auto_join {
            self.join().await?;
        }
        Ok(Some(session))
    }

    async fn create(self: &Arc<Self>, total_rounds: u32) -> Result<Session, ServiceError> {
        let Some(user_id) = self.user_id() else {
            return Err(ServiceError::InvalidState(
                "cannot create a session before sign-in".into(),
            ));
        };
        self.ensure_running().await?;

        let session = self
            .repository
            .create_session(CreateSessionRequest {
                event_id: self.event_id,
                game_type: self.game_type,
                host_id: user_id,
                total_rounds,
                config: Map::new(),
            })
            .await?;
        match self.repository.join_session(session.id, user_id, None).await {
            Ok(()) | Err(ServiceError::AlreadyJoined) => {}
            Err(err) => return Err(err),
        }
        self.adopt(session.clone()).await?;
        Ok(session)
    }

    /// Replace the mirror with `session` and open its feeds.
    async fn adopt(&self, session: Session) -> Result<(), ServiceError> {
        let players = self.repository.get_players(session.id).await?;
        let actions = if session.status == SessionStatus::Playing {
            self.repository
                .get_round_actions(session.id, session.current_round)
                .await?
        } else {
            Vec::new()
        };
        self.phase.adopt(&session).await;

        let stale = {
            let mut state = self.state.write().await;
            let stale = state.subscriptions.drain();
            state.local = LocalPhaseMachine::new();
            match session.status {
                SessionStatus::Playing => state.nudge_local(LocalEvent::RoundStarted),
                SessionStatus::Finished => state.nudge_local(LocalEvent::SessionFinished),
                SessionStatus::Waiting => {}
            }
            state.session = Some(session.clone());
            state.actions.clear();
            state.replace_players(players);
            state.record_actions(actions);
            stale
        };
        self.multiplexer.unsubscribe_all(stale);

        self.open_session_feeds(session.id).await;
        if session.status == SessionStatus::Playing {
            self.open_action_feed(session.id, session.current_round).await;
        }
        info!(
            session_id = %session.id,
            status = session.status.as_str(),
            round = session.current_round,
            "session adopted"
        );
        self.publish_view().await;
        Ok(())
    }

    async fn open_session_feeds(&self, session_id: SessionId) {
        let events = self.events.clone();
        let session_handle = self
            .multiplexer
            .subscribe_to_session(session_id, move |session| {
                let _ = events.send(ControllerEvent::SessionChanged(session));
            })
            .await;
        let events = self.events.clone();
        let players_handle = self
            .multiplexer
            .subscribe_to_players(session_id, move |players| {
                let _ = events.send(ControllerEvent::PlayersChanged(players));
            })
            .await;

        let mut state = self.state.write().await;
        if state.mounted && state.session_id() == Some(session_id) {
            let replaced = [
                state.subscriptions.session.replace(session_handle),
                state.subscriptions.players.replace(players_handle),
            ];
            self.multiplexer.unsubscribe_all(replaced.into_iter().flatten());
        } else {
            self.multiplexer
                .unsubscribe_all([session_handle, players_handle]);
        }
    }

    async fn open_action_feed(&self, session_id: SessionId, round: u32) {
        let events = self.events.clone();
        let handle = self
            .multiplexer
            .subscribe_to_actions(session_id, round, move |action| {
                let _ = events.send(ControllerEvent::ActionInserted(action));
            })
            .await;

        let mut state = self.state.write().await;
        if state.mounted && state.playing_round() == Some((session_id, round)) {
            if let Some((_, previous)) = state.subscriptions.actions.replace((round, handle)) {
                self.multiplexer.unsubscribe(previous);
            }
        } else {
            self.multiplexer.unsubscribe(handle);
        }
    }

    async fn join(&self) -> Result<(), ServiceError> {
        let Some(user_id) = self.user_id() else {
            debug!("identity unresolved; join deferred");
            return Ok(());
        };
        let session_id = {
            let state = self.state.read().await;
            let Some(session_id) = state.session_id() else {
                return Err(ServiceError::InvalidState("no session to join".into()));
            };
            if state.is_member(Some(user_id)) {
                return Ok(());
            }
            session_id
        };

        match self.repository.join_session(session_id, user_id, None).await {
            Ok(()) | Err(ServiceError::AlreadyJoined) => {}
            Err(err) => return Err(err),
        }
        self.refresh_players(session_id).await
    }

    async fn refresh_players(&self, session_id: SessionId) -> Result<(), ServiceError> {
        let players = self.repository.get_players(session_id).await?;
        {
            let mut state = self.state.write().await;
            if state.session_id() != Some(session_id) {
                return Ok(());
            }
            state.replace_players(players);
        }
        self.publish_view().await;
        Ok(())
    }

    async fn submit(&self, kind: ActionKind, payload: Value) -> Result<Option<Action>, ServiceError> {
        let Some(user_id) = self.user_id() else {
            return Ok(None);
        };
        let (session_id, round) = {
            let state = self.state.read().await;
            if !state.is_member(Some(user_id)) {
                debug!(%user_id, "submission ignored; not a member");
                return Ok(None);
            }
            let Some(playing) = state.playing_round() else {
                return Err(ServiceError::InvalidState(
                    "answers are only accepted while playing".into(),
                ));
            };
            if !self
                .options
                .submission_policy
                .accepts(user_id, state.actions.values())
            {
                return Err(ServiceError::InvalidState(
                    "answer already submitted this round".into(),
                ));
            }
            playing
        };

        let action = self
            .repository
            .submit_action(session_id, user_id, round, kind, payload)
            .await?;
        {
            let mut state = self.state.write().await;
            state.nudge_local(LocalEvent::Submitted);
            state.record_actions([action.clone()]);
        }
        self.publish_view().await;
        Ok(Some(action))
    }

    async fn next_round(&self) -> Result<Option<u32>, ServiceError> {
        let Some(session) = self.hosted_session().await else {
            debug!("next round ignored; not the host");
            return Ok(None);
        };
        let (updated, _) = self
            .phase
            .run_transition(SharedEvent::AdvanceRound, |_| {
                self.repository
                    .advance_round(session.id, session.current_round)
            })
            .await?;
        let round = updated.current_round;
        self.observe_session(updated).await;
        Ok(Some(round))
    }

    async fn finish(&self) -> Result<(), ServiceError> {
        let session_id = {
            let state = self.state.read().await;
            match &state.session {
                None => return Err(ServiceError::InvalidState("no session to finish".into())),
                Some(session) if session.status == SessionStatus::Finished => return Ok(()),
                Some(session) => session.id,
            }
        };

        let result = self
            .phase
            .run_transition(SharedEvent::Finish, |_| {
                self.repository.end_game(session_id)
            })
            .await;
        match result {
            Ok((updated, _)) => {
                self.observe_session(updated).await;
                Ok(())
            }
            Err(err) => {
                // Someone else finished first.
                if self.phase.phase().await == SharedPhase::Finished {
                    return Ok(());
                }
                Err(err)
            }
        }
    }

    async fn mark_ready(&self) -> Result<(), ServiceError> {
        let Some(user_id) = self.user_id() else {
            return Ok(());
        };
        let session_id = {
            let state = self.state.read().await;
            match state.session_id() {
                Some(session_id) if state.is_member(Some(user_id)) => session_id,
                _ => return Ok(()),
            }
        };
        self.repository
            .set_player_status(session_id, user_id, PlayerStatus::Ready)
            .await?;
        self.refresh_players(session_id).await
    }

    async fn handle_event(&self, event: ControllerEvent) {
        match event {
            ControllerEvent::SessionChanged(session) => self.observe_session(session).await,
            ControllerEvent::PlayersChanged(players) => {
                {
                    let mut state = self.state.write().await;
                    let Some(session_id) = state.session_id() else {
                        return;
                    };
                    if players.iter().any(|player| player.session_id != session_id) {
                        return;
                    }
                    state.replace_players(players);
                }
                self.publish_view().await;
            }
            ControllerEvent::ActionInserted(action) => {
                self.state.write().await.record_actions([action]);
                self.publish_view().await;
            }
        }
    }

    /// Fold a session row in. Only forward phase moves are accepted; a round
    /// change clears the buffer, moves the action feed and refetches the
    /// round's actions.
    async fn observe_session(&self, incoming: Session) {
        let (from, to, mounted) = {
            let mut state = self.state.write().await;
            let Some(current) = state.session.as_ref() else {
                return;
            };
            if current.id != incoming.id {
                return;
            }
            let from = SharedPhase::of(current);
            let to = SharedPhase::of(&incoming);
            if !from.precedes(&to) {
                debug!(session_id = %incoming.id, ?from, ?to, "stale session update ignored");
                return;
            }
            state.session = Some(incoming.clone());
            match to {
                SharedPhase::Playing { .. } => {
                    state.actions.clear();
                    state.nudge_local(LocalEvent::RoundStarted);
                }
                SharedPhase::Finished => state.nudge_local(LocalEvent::SessionFinished),
                SharedPhase::Waiting => {}
            }
            (from, to, state.mounted)
        };
        self.phase.reconcile(&incoming).await;
        info!(session_id = %incoming.id, ?from, ?to, "session advanced");

        match to {
            SharedPhase::Playing { round, .. } => {
                if mounted {
                    self.open_action_feed(incoming.id, round).await;
                }
                match self.repository.get_round_actions(incoming.id, round).await {
                    Ok(actions) => self.state.write().await.record_actions(actions),
                    Err(err) => warn!(session_id = %incoming.id, round, error = %err, "round refetch failed"),
                }
                if from == SharedPhase::Waiting {
                    self.sync_own_status(incoming.id, PlayerStatus::Playing).await;
                }
            }
            SharedPhase::Finished => {
                self.sync_own_status(incoming.id, PlayerStatus::Finished).await;
            }
            SharedPhase::Waiting => {}
        }
        self.publish_view().await;
    }

    async fn sync_own_status(&self, session_id: SessionId, status: PlayerStatus) {
        let Some(user_id) = self.user_id() else {
            return;
        };
        if !self.state.read().await.is_member(Some(user_id)) {
            return;
        }
        if let Err(err) = self
            .repository
            .set_player_status(session_id, user_id, status)
            .await
        {
            warn!(%session_id, %user_id, status = status.as_str(), error = %err, "status update failed");
        }
    }
}

impl Drop for ControllerInner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
        let handles = self.state.get_mut().subscriptions.drain();
        self.multiplexer.unsubscribe_all(handles);
    }
}

async fn run_pump(
    inner: Weak<ControllerInner>,
    mut inbox: mpsc::UnboundedReceiver<ControllerEvent>,
) {
    while let Some(event) = inbox.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle_event(event).await;
    }
}

async fn follow_health(
    inner: Weak<ControllerInner>,
    mut health: watch::Receiver<ConnectionHealth>,
) {
    while health.changed().await.is_ok() {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.publish_view().await;
    }
}

/// Once the user signs in, finish the discovery and join that were deferred.
async fn follow_identity(
    inner: Weak<ControllerInner>,
    mut identity: watch::Receiver<Option<UserId>>,
) {
    while identity.changed().await.is_ok() {
        let signed_in = identity.borrow_and_update().is_some();
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if signed_in && inner.options.auto_join {
            let adopted = inner.state.read().await.session.is_some();
            let result = if adopted {
                inner.join().await
            } else {
                inner.discover().await.map(|_| ())
            };
            let _ = inner.settle(result).await;
        }
        inner.publish_view().await;
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::{
        dao::session_store::{SessionStore, memory::MemorySessionStore},
        services::identity::{StaticIdentity, WatchIdentity},
        state::SyncContext,
    };

    struct Table {
        repository: SessionRepository,
        multiplexer: SubscriptionMultiplexer,
        event_id: EventId,
    }

    impl Table {
        fn new(policy: SubmissionPolicy) -> Self {
            let config = AppConfig {
                submission_policy: policy,
                ..AppConfig::default()
            };
            let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
            let repository = SessionRepository::new(SyncContext::with_store(config, store));
            Self {
                multiplexer: SubscriptionMultiplexer::new(repository.clone()),
                repository,
                event_id: Uuid::new_v4(),
            }
        }

        fn seat(&self, user_id: Option<UserId>) -> GameSessionController {
            let identity: Arc<dyn UserIdProvider> = match user_id {
                Some(user_id) => Arc::new(StaticIdentity::new(user_id)),
                None => Arc::new(StaticIdentity::anonymous()),
            };
            self.seat_with(identity)
        }

        fn seat_with(&self, identity: Arc<dyn UserIdProvider>) -> GameSessionController {
            GameSessionController::new(
                self.repository.clone(),
                self.multiplexer.clone(),
                identity,
                self.event_id,
                GameType::HotSeat,
                ControllerOptions::from_config(self.repository.context().config()),
            )
        }
    }

    async fn wait_until(
        controller: &GameSessionController,
        predicate: impl FnMut(&ControllerView) -> bool,
    ) -> ControllerView {
        let mut rx = controller.subscribe();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(predicate))
            .await
            .expect("view condition not reached")
            .expect("view channel closed")
            .clone()
    }

    #[tokio::test]
    async fn mount_without_session_stays_unjoined() {
        let table = Table::new(SubmissionPolicy::LatestWins);
        let controller = table.seat(Some(Uuid::new_v4()));

        assert!(controller.mount().await.unwrap().is_none());

        let view = controller.view();
        assert!(view.session.is_none());
        assert!(!view.loading);
        assert!(view.error.is_none());
        assert!(
            table
                .repository
                .get_active_session(table.event_id, None)
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn anonymous_client_defers_join() {
        let table = Table::new(SubmissionPolicy::LatestWins);
        let host = table.seat(Some(Uuid::new_v4()));
        let session = host.create_session(3).await.unwrap();

        let guest = table.seat(None);
        guest.mount().await.unwrap();

        let players = table.repository.get_players(session.id).await.unwrap();
        assert_eq!(players.len(), 1);
        assert!(guest.current_player().is_none());
        assert!(guest.submit_answer(ActionKind::Vote, json!({"choice": 1})).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn non_host_cannot_start() {
        let table = Table::new(SubmissionPolicy::LatestWins);
        let host = table.seat(Some(Uuid::new_v4()));
        let session = host.create_session(3).await.unwrap();
        let guest = table.seat(Some(Uuid::new_v4()));
        guest.mount().await.unwrap();

        guest.start().await.unwrap();
        assert_eq!(guest.next_round().await.unwrap(), None);
        assert_eq!(guest.advance().await.unwrap(), None);

        let stored = table.repository.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Waiting);
    }

    #[tokio::test]
    async fn submission_outside_play_is_rejected() {
        let table = Table::new(SubmissionPolicy::LatestWins);
        let host = table.seat(Some(Uuid::new_v4()));
        host.create_session(3).await.unwrap();

        let err = host
            .submit_answer(ActionKind::Vote, json!({"choice": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidState(_)));
        assert!(host.view().error.is_some());
    }

    #[tokio::test]
    async fn first_only_policy_refuses_second_answer() {
        let table = Table::new(SubmissionPolicy::FirstOnly);
        let host = table.seat(Some(Uuid::new_v4()));
        host.create_session(2).await.unwrap();
        host.start().await.unwrap();

        host.submit_answer(ActionKind::Vote, json!({"choice": 1}))
            .await
            .unwrap();
        let err = host
            .submit_answer(ActionKind::Vote, json!({"choice": 2}))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidState(_)));
        assert_eq!(host.revealed_actions().len(), 1);
    }

    #[tokio::test]
    async fn latest_answer_wins_in_reveal() {
        let table = Table::new(SubmissionPolicy::LatestWins);
        let host = table.seat(Some(Uuid::new_v4()));
        host.create_session(2).await.unwrap();
        host.start().await.unwrap();

        host.submit_answer(ActionKind::Vote, json!({"choice": 1}))
            .await
            .unwrap();
        host.submit_answer(ActionKind::Vote, json!({"choice": 2}))
            .await
            .unwrap();

        let revealed = host.revealed_actions();
        assert_eq!(revealed.len(), 1);
        assert_eq!(revealed[0].payload, json!({"choice": 2}));
        assert!(host.all_submitted());
    }

    #[tokio::test]
    async fn stale_round_update_is_ignored() {
        let table = Table::new(SubmissionPolicy::LatestWins);
        let host = table.seat(Some(Uuid::new_v4()));
        let session = host.create_session(3).await.unwrap();
        host.start().await.unwrap();
        host.next_round().await.unwrap();
        assert_eq!(host.view().session.unwrap().current_round, 2);

        let mut stale = session.clone();
        stale.status = SessionStatus::Playing;
        stale.current_round = 1;
        host.inner.observe_session(stale).await;

        assert_eq!(host.view().session.unwrap().current_round, 2);
        assert_eq!(
            host.view().shared_phase,
            Some(SharedPhase::Playing { round: 2, total: 3 })
        );
    }

    #[tokio::test]
    async fn next_round_refuses_past_total() {
        let table = Table::new(SubmissionPolicy::LatestWins);
        let host = table.seat(Some(Uuid::new_v4()));
        let session = host.create_session(1).await.unwrap();
        host.start().await.unwrap();
        assert!(host.is_last_round());

        let err = host.next_round().await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidState(_)));
        let stored = table.repository.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(stored.current_round, 1);
    }

    #[tokio::test]
    async fn refused_next_round_keeps_round_actions() {
        let table = Table::new(SubmissionPolicy::LatestWins);
        let host = table.seat(Some(Uuid::new_v4()));
        host.create_session(1).await.unwrap();
        host.start().await.unwrap();
        host.submit_answer(ActionKind::Vote, json!({"choice": 1}))
            .await
            .unwrap();
        let before = host.revealed_actions();
        assert_eq!(before.len(), 1);

        assert!(host.next_round().await.is_err());

        let view = host.view();
        assert_eq!(view.session.unwrap().current_round, 1);
        assert_eq!(view.actions.len(), 1);
        assert_eq!(host.revealed_actions(), before);
        assert!(host.all_submitted());
    }

    #[tokio::test]
    async fn advance_in_waiting_room_is_refused() {
        let table = Table::new(SubmissionPolicy::LatestWins);
        let host = table.seat(Some(Uuid::new_v4()));
        let session = host.create_session(1).await.unwrap();

        let err = host.advance().await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidState(_)));

        let stored = table.repository.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Waiting);
        assert!(stored.started_at.is_none());
        assert!(stored.finished_at.is_none());
    }

    #[tokio::test]
    async fn late_sign_in_joins_discovered_session() {
        let table = Table::new(SubmissionPolicy::LatestWins);
        let host = table.seat(Some(Uuid::new_v4()));
        let session = host.create_session(3).await.unwrap();

        let (handle, identity) = WatchIdentity::channel();
        let guest = table.seat_with(Arc::new(identity));
        guest.mount().await.unwrap();
        assert!(guest.current_player().is_none());

        let guest_id = Uuid::new_v4();
        handle.sign_in(guest_id);

        let view = wait_until(&guest, |v| v.current_player.is_some()).await;
        assert_eq!(view.current_player.map(|p| p.user_id), Some(guest_id));
        let players = table.repository.get_players(session.id).await.unwrap();
        assert!(players.iter().any(|p| p.user_id == guest_id));
    }

    #[tokio::test]
    async fn late_sign_in_discovers_when_nothing_was_adopted() {
        let table = Table::new(SubmissionPolicy::LatestWins);
        let (handle, identity) = WatchIdentity::channel();
        let guest = table.seat_with(Arc::new(identity));
        guest.mount().await.unwrap();
        assert!(guest.view().session.is_none());

        let host = table.seat(Some(Uuid::new_v4()));
        let session = host.create_session(2).await.unwrap();
        handle.sign_in(Uuid::new_v4());

        let view = wait_until(&guest, |v| v.current_player.is_some()).await;
        assert_eq!(view.session.map(|s| s.id), Some(session.id));
    }

    #[tokio::test]
    async fn finish_is_idempotent_and_reaches_results() {
        let table = Table::new(SubmissionPolicy::LatestWins);
        let host = table.seat(Some(Uuid::new_v4()));
        host.create_session(2).await.unwrap();
        host.start().await.unwrap();

        host.finish().await.unwrap();
        host.finish().await.unwrap();

        let view = host.view();
        assert_eq!(view.shared_phase, Some(SharedPhase::Finished));
        assert_eq!(view.local_phase, LocalPhase::Results);
        let me = wait_until(&host, |v| {
            v.current_player
                .as_ref()
                .is_some_and(|p| p.status == PlayerStatus::Finished)
        })
        .await;
        assert!(me.current_player.is_some());
    }

    #[tokio::test]
    async fn unmounted_controller_cannot_remount() {
        let table = Table::new(SubmissionPolicy::LatestWins);
        let controller = table.seat(Some(Uuid::new_v4()));
        controller.mount().await.unwrap();
        controller.unmount().await;

        let err = controller.mount().await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidState(_)));
    }
}

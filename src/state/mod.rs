/// Per-device screen phases.
pub mod local_phase;
/// Domain session, player and action types.
pub mod session;
/// Shared phase machine with plan/apply/abort.
pub mod state_machine;
/// Team partition, totals and turn order.
pub mod teams;

use std::{future::Future, sync::Arc, time::Duration};

use serde::Serialize;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::time::timeout;
use tracing::warn;

use crate::{config::AppConfig, dao::session_store::SessionStore, error::ServiceError};

pub use self::state_machine::{
    AbortError, ApplyError, Plan, PlanError, PlanId, SharedEvent, SharedPhase, Snapshot,
};
use self::{session::Session, state_machine::SharedPhaseMachine};

/// Context handle shared by the repository, supervisor and controllers.
pub type SharedContext = Arc<SyncContext>;
/// Timeout of a transition's apply step when the caller sets none.
pub const DEFAULT_TRANSITION_TIMEOUT: Duration = Duration::from_secs(5);

/// Health of the link to the session store, as surfaced to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionHealth {
    /// Store reachable and streams delivering.
    Connected,
    /// Store or streams failed; recovery is in progress.
    Reconnecting {
        /// Consecutive failed recovery attempts.
        attempt: u32,
    },
    /// No store installed.
    #[default]
    Disconnected,
}

/// Process-wide handles shared by repositories, multiplexers and controllers.
pub struct SyncContext {
    store: RwLock<Option<Arc<dyn SessionStore>>>,
    health: watch::Sender<ConnectionHealth>,
    config: AppConfig,
}

impl SyncContext {
    /// Context without a store. It stays degraded until one is installed.
    pub fn new(config: AppConfig) -> SharedContext {
        let (health, _rx) = watch::channel(ConnectionHealth::Disconnected);
        Arc::new(Self {
            store: RwLock::new(None),
            health,
            config,
        })
    }

    /// Context with a store installed from the start.
    pub fn with_store(config: AppConfig, store: Arc<dyn SessionStore>) -> SharedContext {
        let (health, _rx) = watch::channel(ConnectionHealth::Connected);
        Arc::new(Self {
            store: RwLock::new(Some(store)),
            health,
            config,
        })
    }

    /// Runtime configuration.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Obtain a handle to the current store, if one is installed.
    pub async fn store(&self) -> Option<Arc<dyn SessionStore>> {
        let guard = self.store.read().await;
        guard.as_ref().cloned()
    }

    /// Current store or [`ServiceError::Degraded`].
    pub async fn require_store(&self) -> Result<Arc<dyn SessionStore>, ServiceError> {
        self.store().await.ok_or(ServiceError::Degraded)
    }

    /// Install a store implementation and leave degraded mode.
    pub async fn install_store(&self, store: Arc<dyn SessionStore>) {
        {
            let mut guard = self.store.write().await;
            *guard = Some(store);
        }
        self.update_health(ConnectionHealth::Connected);
    }

    /// Remove the current store and enter degraded mode.
    pub async fn clear_store(&self) {
        {
            let mut guard = self.store.write().await;
            guard.take();
        }
        self.update_health(ConnectionHealth::Disconnected);
    }

    /// Whether no store is installed.
    pub async fn is_degraded(&self) -> bool {
        let guard = self.store.read().await;
        guard.is_none()
    }

    /// Last published connection health.
    pub fn health(&self) -> ConnectionHealth {
        *self.health.borrow()
    }

    /// Subscribe to connection health updates.
    pub fn health_watcher(&self) -> watch::Receiver<ConnectionHealth> {
        self.health.subscribe()
    }

    /// Publish `value` when it differs from the current health.
    pub fn update_health(&self, value: ConnectionHealth) {
        self.health.send_if_modified(|current| {
            if *current == value {
                return false;
            }
            *current = value;
            true
        });
    }
}

/// Serializes host transitions of one client against its shared phase mirror.
pub struct PhaseCoordinator {
    machine: RwLock<SharedPhaseMachine>,
    transition_gate: Mutex<()>,
    transition_timeout: Option<Duration>,
}

impl PhaseCoordinator {
    /// Coordinator with no adopted session.
    pub fn new(transition_timeout: Option<Duration>) -> Self {
        Self {
            machine: RwLock::new(SharedPhaseMachine::new(1)),
            transition_gate: Mutex::new(()),
            transition_timeout,
        }
    }

    /// Reset the mirror to `session`.
    pub async fn adopt(&self, session: &Session) {
        let mut sm = self.machine.write().await;
        *sm = SharedPhaseMachine::adopt(session);
    }

    /// Fold a remote session update in. Returns `false` when it was stale.
    pub async fn reconcile(&self, session: &Session) -> bool {
        let mut sm = self.machine.write().await;
        sm.reconcile(SharedPhase::of(session))
    }

    /// Current mirrored phase.
    pub async fn phase(&self) -> SharedPhase {
        self.machine.read().await.phase()
    }

    /// Phase and pending plan, read together.
    pub async fn snapshot(&self) -> Snapshot {
        let sm = self.machine.read().await;
        sm.snapshot()
    }

    async fn plan_transition(&self, event: SharedEvent) -> Result<Plan, PlanError> {
        let mut sm = self.machine.write().await;
        sm.plan(event)
    }

    async fn apply_planned_transition(&self, plan_id: PlanId) -> Result<SharedPhase, ApplyError> {
        let mut sm = self.machine.write().await;
        sm.apply(plan_id)
    }

    async fn abort_transition(&self, plan_id: PlanId) -> Result<(), AbortError> {
        let mut sm = self.machine.write().await;
        sm.abort(plan_id)
    }

    /// Plan `event`, run the store write, then apply on success or abort on
    /// failure or timeout. Only one transition runs at a time.
    pub async fn run_transition<F, Fut, T>(
        &self,
        event: SharedEvent,
        work: F,
    ) -> Result<(T, SharedPhase), ServiceError>
    where
        F: FnOnce(Plan) -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let gate = self.transition_gate.lock().await;
        let plan = self.plan_transition(event).await?;
        let plan_id = plan.id;

        let work_future = work(plan);
        let outcome = if let Some(limit) = self.transition_timeout {
            match timeout(limit, work_future).await {
                Ok(result) => result,
                Err(_) => {
                    if let Err(abort_err) = self.abort_transition(plan_id).await {
                        warn!(
                            event = ?event,
                            plan_id = %plan_id,
                            error = ?abort_err,
                            "failed to abort transition after timeout"
                        );
                    }
                    drop(gate);
                    return Err(ServiceError::Timeout);
                }
            }
        } else {
            work_future.await
        };

        match outcome {
            Ok(value) => {
                let next = self.apply_planned_transition(plan_id).await?;
                drop(gate);
                Ok((value, next))
            }
            Err(err) => {
                if let Err(abort_err) = self.abort_transition(plan_id).await {
                    warn!(
                        event = ?event,
                        plan_id = %plan_id,
                        error = ?abort_err,
                        "failed to abort transition after work error"
                    );
                }
                drop(gate);
                Err(err)
            }
        }
    }
}

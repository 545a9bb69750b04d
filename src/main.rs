//! Demo game night: one host and a few guests play a round of "most likely to"
//! against the session store, then the host's view is printed as JSON.

use std::{collections::HashMap, env, sync::Arc, time::Duration};

use anyhow::{Context, bail};
use rand::seq::IndexedRandom;
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use rizzk_game_sync::{
    config::AppConfig,
    dao::{
        models::{Gender, ProfileEntity},
        repository::SessionRepository,
        session_store::{SessionStore, memory::MemorySessionStore},
    },
    dto::session::ControllerSummary,
    services::{
        controller::{ControllerOptions, ControllerView, GameSessionController, RoundAdvance},
        identity::{StaticIdentity, UserIdProvider},
        multiplexer::SubscriptionMultiplexer,
    },
    state::{SharedContext, SharedPhase, SyncContext, session::GameType},
};

const NAMES: [&str; 8] = [
    "Ava", "Ben", "Chloe", "Dan", "Eve", "Finn", "Gia", "Hugo",
];
const VIEW_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = AppConfig::load();
    let players = env_number("PLAYERS", 4).clamp(2, NAMES.len());
    let rounds = env_number("ROUNDS", config.default_total_rounds as usize) as u32;

    let users: Vec<Uuid> = (0..players).map(|_| Uuid::new_v4()).collect();
    let context = open_context(config, &users).await?;

    tokio::select! {
        result = play(context, users, rounds) => result,
        _ = shutdown_signal() => {
            warn!("interrupted; leaving the table");
            Ok(())
        }
    }
}

async fn play(context: SharedContext, users: Vec<Uuid>, rounds: u32) -> anyhow::Result<()> {
    let repository = SessionRepository::new(context.clone())
        .with_score_updates(context.config().score_updates);
    let multiplexer = SubscriptionMultiplexer::new(repository.clone());
    let options = ControllerOptions::from_config(context.config());
    let event_id = Uuid::new_v4();

    let seats: Vec<GameSessionController> = users
        .iter()
        .map(|user_id| {
            let identity: Arc<dyn UserIdProvider> = Arc::new(StaticIdentity::new(*user_id));
            GameSessionController::new(
                repository.clone(),
                multiplexer.clone(),
                identity,
                event_id,
                GameType::MostLikelyTo,
                options,
            )
        })
        .collect();
    let Some((host, guests)) = seats.split_first() else {
        bail!("no players at the table");
    };

    let session = host
        .create_session(rounds)
        .await
        .context("creating session")?;
    info!(session_id = %session.id, rounds, "session created");
    for guest in guests {
        guest.mount().await.context("guest mount")?;
        guest.mark_ready().await.context("guest ready")?;
    }
    wait_for(host, |view| view.players.len() == users.len()).await?;
    host.assign_teams().await.context("assigning teams")?;
    host.start().await.context("starting game")?;

    loop {
        let round = match host.view().session {
            Some(session) => session.current_round,
            None => bail!("host lost the session"),
        };
        for seat in &seats {
            wait_for(seat, |view| {
                matches!(view.shared_phase, Some(SharedPhase::Playing { round: r, .. }) if r == round)
            })
            .await?;
            let pick = users.choose(&mut rand::rng()).copied().unwrap_or_default();
            seat.submit_answer(GameType::MostLikelyTo.primary_action(), json!({ "pick": pick }))
                .await
                .context("submitting vote")?;
        }
        let view = wait_for(host, |view| view.all_submitted).await?;

        if let Some(winner) = most_picked(&view) {
            if let Some(index) = users.iter().position(|user| *user == winner) {
                // Only the winner's own client may score for them.
                let _ = seats[index].add_score(1, 2).await;
            }
            info!(round, %winner, "round decided");
        }

        match host.advance().await.context("advancing")? {
            Some(RoundAdvance::NextRound(next)) => info!(round = next, "next round"),
            Some(RoundAdvance::Finished) | None => break,
        }
    }

    for seat in &seats {
        wait_for(seat, |view| view.shared_phase == Some(SharedPhase::Finished)).await?;
    }
    let recap = ControllerSummary::from(&host.view());
    println!("{}", serde_json::to_string_pretty(&recap)?);

    for seat in &seats {
        seat.unmount().await;
    }
    Ok(())
}

fn most_picked(view: &ControllerView) -> Option<Uuid> {
    let mut tally: HashMap<Uuid, u32> = HashMap::new();
    for action in &view.revealed {
        let Some(pick) = action
            .payload
            .get("pick")
            .and_then(|value| value.as_str())
            .and_then(|value| Uuid::parse_str(value).ok())
        else {
            continue;
        };
        *tally.entry(pick).or_default() += 1;
    }
    tally
        .into_iter()
        .max_by_key(|(user, votes)| (*votes, *user))
        .map(|(user, _)| user)
}

async fn wait_for(
    controller: &GameSessionController,
    predicate: impl FnMut(&ControllerView) -> bool,
) -> anyhow::Result<ControllerView> {
    let mut rx = controller.subscribe();
    let view = tokio::time::timeout(VIEW_TIMEOUT, rx.wait_for(predicate))
        .await
        .context("timed out waiting for the table")?
        .context("controller dropped")?
        .clone();
    Ok(view)
}

/// In-memory store seeded with profiles, or MongoDB when `MONGO_URI` is set.
async fn open_context(config: AppConfig, users: &[Uuid]) -> anyhow::Result<SharedContext> {
    if let Some(context) = open_mongo_context(&config).await? {
        return Ok(context);
    }

    let store = MemorySessionStore::new();
    for (index, user_id) in users.iter().enumerate() {
        store.put_profile(ProfileEntity {
            user_id: *user_id,
            display_name: NAMES[index % NAMES.len()].to_owned(),
            gender: if index % 2 == 0 {
                Gender::Female
            } else {
                Gender::Male
            },
            avatar_url: None,
        });
    }
    info!(players = users.len(), "using in-memory session store");
    Ok(SyncContext::with_store(
        config,
        Arc::new(store) as Arc<dyn SessionStore>,
    ))
}

#[cfg(feature = "mongo-store")]
async fn open_mongo_context(config: &AppConfig) -> anyhow::Result<Option<SharedContext>> {
    use rizzk_game_sync::{
        dao::{
            session_store::mongodb::{MongoConfig, MongoSessionStore},
            storage::StorageError,
        },
        services::storage_supervisor,
        state::ConnectionHealth,
    };

    if env::var("MONGO_URI").is_err() {
        return Ok(None);
    }

    let context = SyncContext::new(config.clone());
    tokio::spawn(storage_supervisor::run(context.clone(), || async {
        let config = MongoConfig::from_env().await?;
        let store = MongoSessionStore::connect(config).await?;
        Ok::<_, StorageError>(Arc::new(store) as Arc<dyn SessionStore>)
    }));

    let mut health = context.health_watcher();
    tokio::time::timeout(
        VIEW_TIMEOUT,
        health.wait_for(|h| *h == ConnectionHealth::Connected),
    )
    .await
    .context("timed out connecting to MongoDB")?
    .context("health channel closed")?;
    info!("using MongoDB session store");
    Ok(Some(context))
}

#[cfg(not(feature = "mongo-store"))]
async fn open_mongo_context(_config: &AppConfig) -> anyhow::Result<Option<SharedContext>> {
    Ok(None)
}

fn env_number(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

/// Configure tracing subscribers so logs include spans by default.
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,rizzk_game_sync=debug".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

//! Runtime configuration of the sync layer: watchdog timings, transition
//! timeout, score update mode and submission policy.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use serde::Deserialize;
use tracing::{info, warn};

use crate::{dao::repository::ScoreUpdateMode, state::session::SubmissionPolicy};

/// Default location on disk where the JSON configuration is looked up.
const DEFAULT_CONFIG_PATH: &str = "config/sync.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "RIZZK_SYNC_CONFIG_PATH";

const DEFAULT_IDLE_RESUBSCRIBE: Duration = Duration::from_secs(30);
const DEFAULT_WATCHDOG_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_TRANSITION_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_TOTAL_ROUNDS: u32 = 5;

#[derive(Debug, Clone)]
/// Immutable runtime configuration shared across the crate.
pub struct AppConfig {
    /// A stream silent for longer than this is reopened and resynced.
    pub idle_resubscribe_after: Duration,
    /// How often the watchdog inspects subscriptions.
    pub watchdog_interval: Duration,
    /// Upper bound for a host transition write. `None` disables the limit.
    pub transition_timeout: Option<Duration>,
    /// How score increments reach the store.
    pub score_updates: ScoreUpdateMode,
    /// Treatment of repeated submissions within a round.
    pub submission_policy: SubmissionPolicy,
    /// Join the discovered session automatically on mount.
    pub auto_join: bool,
    /// Rounds used when a caller does not pick a count.
    pub default_total_rounds: u32,
}

impl AppConfig {
    /// Load the configuration from disk, falling back to built-in defaults.
    pub fn load() -> Self {
        let path = resolve_config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<RawConfig>(&contents) {
                Ok(raw) => {
                    let app_config: Self = raw.into();
                    info!(
                        path = %path.display(),
                        score_updates = ?app_config.score_updates,
                        submission_policy = ?app_config.submission_policy,
                        "loaded sync config"
                    );
                    app_config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            idle_resubscribe_after: DEFAULT_IDLE_RESUBSCRIBE,
            watchdog_interval: DEFAULT_WATCHDOG_INTERVAL,
            transition_timeout: Some(DEFAULT_TRANSITION_TIMEOUT),
            score_updates: ScoreUpdateMode::default(),
            submission_policy: SubmissionPolicy::default(),
            auto_join: true,
            default_total_rounds: DEFAULT_TOTAL_ROUNDS,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
/// JSON representation of the configuration file located at [`DEFAULT_CONFIG_PATH`].
struct RawConfig {
    idle_resubscribe_after_ms: Option<u64>,
    watchdog_interval_ms: Option<u64>,
    transition_timeout_ms: Option<u64>,
    score_updates: Option<ScoreUpdateMode>,
    submission_policy: Option<SubmissionPolicy>,
    auto_join: Option<bool>,
    default_total_rounds: Option<u32>,
}

impl From<RawConfig> for AppConfig {
    fn from(value: RawConfig) -> Self {
        let defaults = AppConfig::default();
        Self {
            idle_resubscribe_after: value
                .idle_resubscribe_after_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.idle_resubscribe_after),
            watchdog_interval: value
                .watchdog_interval_ms
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.watchdog_interval),
            // Zero disables the limit.
            transition_timeout: match value.transition_timeout_ms {
                Some(0) => None,
                Some(ms) => Some(Duration::from_millis(ms)),
                None => defaults.transition_timeout,
            },
            score_updates: value.score_updates.unwrap_or(defaults.score_updates),
            submission_policy: value
                .submission_policy
                .unwrap_or(defaults.submission_policy),
            auto_join: value.auto_join.unwrap_or(defaults.auto_join),
            default_total_rounds: value
                .default_total_rounds
                .filter(|rounds| (1..=20).contains(rounds))
                .unwrap_or(defaults.default_total_rounds),
        }
    }
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

use mongodb::bson::{Bson, DateTime, Document, doc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::dao::models::{
    ActionEntity, ActionKind, GameType, PlayerEntity, PlayerPatch, PlayerStatus, ProfileEntity,
    SessionEntity, SessionPatch, SessionStatus, Team,
};

use super::error::MongoDaoError;

pub const SESSION_COLLECTION_NAME: &str = "sessions";
pub const PLAYER_COLLECTION_NAME: &str = "players";
pub const ACTION_COLLECTION_NAME: &str = "actions";
pub const PROFILE_COLLECTION_NAME: &str = "profiles";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoSessionDocument {
    #[serde(rename = "_id")]
    id: String,
    event_id: String,
    game_type: GameType,
    host_id: String,
    status: SessionStatus,
    current_round: i64,
    total_rounds: i64,
    #[serde(default)]
    config: Map<String, Value>,
    created_at: DateTime,
    started_at: Option<DateTime>,
    finished_at: Option<DateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoPlayerDocument {
    #[serde(rename = "_id")]
    id: String,
    session_id: String,
    user_id: String,
    team: Option<Team>,
    score: i64,
    chips: i64,
    status: PlayerStatus,
    joined_at: DateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoActionDocument {
    #[serde(rename = "_id")]
    id: String,
    session_id: String,
    round: i64,
    user_id: String,
    kind: ActionKind,
    payload: Value,
    created_at: DateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoProfileDocument {
    #[serde(rename = "_id")]
    id: String,
    display_name: String,
    #[serde(default)]
    gender: crate::dao::models::Gender,
    avatar_url: Option<String>,
}

impl From<SessionEntity> for MongoSessionDocument {
    fn from(value: SessionEntity) -> Self {
        Self {
            id: value.id.to_string(),
            event_id: value.event_id.to_string(),
            game_type: value.game_type,
            host_id: value.host_id.to_string(),
            status: value.status,
            current_round: i64::from(value.current_round),
            total_rounds: i64::from(value.total_rounds),
            config: value.config,
            created_at: DateTime::from_system_time(value.created_at),
            started_at: value.started_at.map(DateTime::from_system_time),
            finished_at: value.finished_at.map(DateTime::from_system_time),
        }
    }
}

impl TryFrom<MongoSessionDocument> for SessionEntity {
    type Error = MongoDaoError;

    fn try_from(value: MongoSessionDocument) -> Result<Self, Self::Error> {
        let corrupt = |source| MongoDaoError::CorruptDocument {
            collection: SESSION_COLLECTION_NAME,
            id: value.id.clone(),
            source,
        };
        Ok(Self {
            id: Uuid::parse_str(&value.id).map_err(corrupt)?,
            event_id: Uuid::parse_str(&value.event_id).map_err(corrupt)?,
            game_type: value.game_type,
            host_id: Uuid::parse_str(&value.host_id).map_err(corrupt)?,
            status: value.status,
            current_round: clamp_u32(value.current_round),
            total_rounds: clamp_u32(value.total_rounds),
            config: value.config.clone(),
            created_at: value.created_at.to_system_time(),
            started_at: value.started_at.map(DateTime::to_system_time),
            finished_at: value.finished_at.map(DateTime::to_system_time),
        })
    }
}

impl From<PlayerEntity> for MongoPlayerDocument {
    fn from(value: PlayerEntity) -> Self {
        Self {
            id: player_key(value.session_id, value.user_id),
            session_id: value.session_id.to_string(),
            user_id: value.user_id.to_string(),
            team: value.team,
            score: i64::from(value.score),
            chips: i64::from(value.chips),
            status: value.status,
            joined_at: DateTime::from_system_time(value.joined_at),
        }
    }
}

impl MongoPlayerDocument {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }
}

impl TryFrom<MongoPlayerDocument> for PlayerEntity {
    type Error = MongoDaoError;

    fn try_from(value: MongoPlayerDocument) -> Result<Self, Self::Error> {
        let corrupt = |source| MongoDaoError::CorruptDocument {
            collection: PLAYER_COLLECTION_NAME,
            id: value.id.clone(),
            source,
        };
        Ok(Self {
            session_id: Uuid::parse_str(&value.session_id).map_err(corrupt)?,
            user_id: Uuid::parse_str(&value.user_id).map_err(corrupt)?,
            team: value.team,
            score: clamp_u32(value.score),
            chips: clamp_u32(value.chips),
            status: value.status,
            joined_at: value.joined_at.to_system_time(),
        })
    }
}

impl From<ActionEntity> for MongoActionDocument {
    fn from(value: ActionEntity) -> Self {
        Self {
            id: value.id.to_string(),
            session_id: value.session_id.to_string(),
            round: i64::from(value.round),
            user_id: value.user_id.to_string(),
            kind: value.kind,
            payload: value.payload,
            created_at: DateTime::from_system_time(value.created_at),
        }
    }
}

impl TryFrom<MongoActionDocument> for ActionEntity {
    type Error = MongoDaoError;

    fn try_from(value: MongoActionDocument) -> Result<Self, Self::Error> {
        let corrupt = |source| MongoDaoError::CorruptDocument {
            collection: ACTION_COLLECTION_NAME,
            id: value.id.clone(),
            source,
        };
        Ok(Self {
            id: Uuid::parse_str(&value.id).map_err(corrupt)?,
            session_id: Uuid::parse_str(&value.session_id).map_err(corrupt)?,
            round: clamp_u32(value.round),
            user_id: Uuid::parse_str(&value.user_id).map_err(corrupt)?,
            kind: value.kind,
            payload: value.payload.clone(),
            created_at: value.created_at.to_system_time(),
        })
    }
}

impl TryFrom<MongoProfileDocument> for ProfileEntity {
    type Error = MongoDaoError;

    fn try_from(value: MongoProfileDocument) -> Result<Self, Self::Error> {
        let user_id =
            Uuid::parse_str(&value.id).map_err(|source| MongoDaoError::CorruptDocument {
                collection: PROFILE_COLLECTION_NAME,
                id: value.id.clone(),
                source,
            })?;
        Ok(Self {
            user_id,
            display_name: value.display_name,
            gender: value.gender,
            avatar_url: value.avatar_url,
        })
    }
}

/// Composite primary key of a player document.
pub fn player_key(session_id: Uuid, user_id: Uuid) -> String {
    format!("{session_id}:{user_id}")
}

pub fn doc_id(id: impl Into<String>) -> Document {
    doc! {"_id": id.into()}
}

/// Translate a session patch into a `$set` document.
pub fn session_set(patch: &SessionPatch) -> Document {
    let mut set = Document::new();
    if let Some(status) = patch.status {
        set.insert("status", status.as_str());
    }
    if let Some(round) = patch.current_round {
        set.insert("current_round", i64::from(round));
    }
    if let Some(started_at) = patch.started_at {
        set.insert("started_at", DateTime::from_system_time(started_at));
    }
    if let Some(finished_at) = patch.finished_at {
        set.insert("finished_at", DateTime::from_system_time(finished_at));
    }
    set
}

/// Translate a player patch into a `$set` document.
pub fn player_set(patch: &PlayerPatch) -> Document {
    let mut set = Document::new();
    if let Some(team) = patch.team {
        let value = match team {
            Some(team) => Bson::String(team.as_str().to_owned()),
            None => Bson::Null,
        };
        set.insert("team", value);
    }
    if let Some(score) = patch.score {
        set.insert("score", i64::from(score));
    }
    if let Some(chips) = patch.chips {
        set.insert("chips", i64::from(chips));
    }
    if let Some(status) = patch.status {
        set.insert("status", status.as_str());
    }
    set
}

fn clamp_u32(value: i64) -> u32 {
    value.clamp(0, i64::from(u32::MAX)) as u32
}

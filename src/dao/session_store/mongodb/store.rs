use std::{collections::HashMap, sync::Arc, time::SystemTime};

use futures::{StreamExt, TryStreamExt, future::BoxFuture};
use mongodb::{
    Collection, Database, IndexModel,
    bson::{Document, doc},
    change_stream::{ChangeStream as MongoChangeStream, event::ChangeStreamEvent},
    options::{FullDocumentType, IndexOptions, ReturnDocument},
};
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use super::{
    config::MongoConfig,
    connection::establish_connection,
    error::{MongoDaoError, MongoResult, is_duplicate_key},
    models::{
        ACTION_COLLECTION_NAME, MongoActionDocument, MongoPlayerDocument, MongoProfileDocument,
        MongoSessionDocument, PLAYER_COLLECTION_NAME, PROFILE_COLLECTION_NAME,
        SESSION_COLLECTION_NAME, doc_id, player_key, player_set, session_set,
    },
};
use crate::dao::{
    models::{
        ActionEntity, GameType, PlayerEntity, PlayerPatch, PlayerRecord, ProfileEntity,
        SessionEntity, SessionPatch, SessionStatus,
    },
    session_store::{ChangeStream, SessionStore},
    storage::{StorageError, StorageResult},
};

/// Session store backed by MongoDB collections and change streams.
///
/// Change streams require the deployment to run as a replica set.
#[derive(Clone)]
pub struct MongoSessionStore {
    inner: Arc<MongoInner>,
}

struct MongoInner {
    database: RwLock<Database>,
    config: MongoConfig,
}

impl MongoInner {
    async fn ping(&self) -> MongoResult<()> {
        let database = self.database.read().await.clone();

        database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|source| MongoDaoError::HealthPing { source })?;
        Ok(())
    }

    async fn reconnect(&self) -> MongoResult<()> {
        let database =
            establish_connection(&self.config.options, &self.config.database_name).await?;
        let mut guard = self.database.write().await;
        *guard = database;
        Ok(())
    }
}

impl MongoSessionStore {
    /// Establish a connection to MongoDB and ensure indexes are present.
    pub async fn connect(config: MongoConfig) -> MongoResult<Self> {
        let database = establish_connection(&config.options, &config.database_name).await?;

        let inner = Arc::new(MongoInner {
            database: RwLock::new(database),
            config,
        });

        let store = Self { inner };
        store.ensure_indexes().await?;
        Ok(store)
    }

    async fn ensure_indexes(&self) -> MongoResult<()> {
        let database = self.database().await;

        let player_index = IndexModel::builder()
            .keys(doc! {"session_id": 1, "user_id": 1})
            .options(
                IndexOptions::builder()
                    .name(Some("player_session_user_idx".to_owned()))
                    .unique(Some(true))
                    .build(),
            )
            .build();
        database
            .collection::<Document>(PLAYER_COLLECTION_NAME)
            .create_index(player_index)
            .await
            .map_err(|source| MongoDaoError::EnsureIndex {
                collection: PLAYER_COLLECTION_NAME,
                index: "session_id,user_id",
                source,
            })?;

        let session_index = IndexModel::builder()
            .keys(doc! {"event_id": 1, "created_at": -1})
            .options(
                IndexOptions::builder()
                    .name(Some("session_event_idx".to_owned()))
                    .build(),
            )
            .build();
        database
            .collection::<Document>(SESSION_COLLECTION_NAME)
            .create_index(session_index)
            .await
            .map_err(|source| MongoDaoError::EnsureIndex {
                collection: SESSION_COLLECTION_NAME,
                index: "event_id,created_at",
                source,
            })?;

        let action_index = IndexModel::builder()
            .keys(doc! {"session_id": 1, "round": 1})
            .options(
                IndexOptions::builder()
                    .name(Some("action_round_idx".to_owned()))
                    .build(),
            )
            .build();
        database
            .collection::<Document>(ACTION_COLLECTION_NAME)
            .create_index(action_index)
            .await
            .map_err(|source| MongoDaoError::EnsureIndex {
                collection: ACTION_COLLECTION_NAME,
                index: "session_id,round",
                source,
            })?;

        Ok(())
    }

    async fn database(&self) -> Database {
        self.inner.database.read().await.clone()
    }

    async fn sessions(&self) -> Collection<MongoSessionDocument> {
        self.database().await.collection(SESSION_COLLECTION_NAME)
    }

    async fn players(&self) -> Collection<MongoPlayerDocument> {
        self.database().await.collection(PLAYER_COLLECTION_NAME)
    }

    async fn actions(&self) -> Collection<MongoActionDocument> {
        self.database().await.collection(ACTION_COLLECTION_NAME)
    }

    async fn profiles(&self) -> Collection<MongoProfileDocument> {
        self.database().await.collection(PROFILE_COLLECTION_NAME)
    }

    async fn insert_session(&self, session: SessionEntity) -> MongoResult<()> {
        let key = session.id.to_string();
        let document: MongoSessionDocument = session.into();
        self.sessions()
            .await
            .insert_one(&document)
            .await
            .map_err(|source| write_error(SESSION_COLLECTION_NAME, key, source))?;
        Ok(())
    }

    async fn find_session(&self, id: Uuid) -> MongoResult<Option<SessionEntity>> {
        self.sessions()
            .await
            .find_one(doc_id(id.to_string()))
            .await
            .map_err(|source| query_error("load session", SESSION_COLLECTION_NAME, source))?
            .map(SessionEntity::try_from)
            .transpose()
    }

    async fn find_latest_session(
        &self,
        event_id: Uuid,
        game_type: Option<GameType>,
        statuses: Vec<SessionStatus>,
    ) -> MongoResult<Option<SessionEntity>> {
        let statuses: Vec<&str> = statuses.iter().map(SessionStatus::as_str).collect();
        let mut filter = doc! {
            "event_id": event_id.to_string(),
            "status": { "$in": statuses },
        };
        if let Some(game_type) = game_type {
            filter.insert("game_type", game_type.as_str());
        }

        self.sessions()
            .await
            .find_one(filter)
            .sort(doc! {"created_at": -1})
            .await
            .map_err(|source| query_error("find active session", SESSION_COLLECTION_NAME, source))?
            .map(SessionEntity::try_from)
            .transpose()
    }

    async fn update_session(
        &self,
        id: Uuid,
        patch: SessionPatch,
    ) -> MongoResult<Option<SessionEntity>> {
        let set = session_set(&patch);
        if set.is_empty() {
            return self.find_session(id).await;
        }

        self.sessions()
            .await
            .find_one_and_update(doc_id(id.to_string()), doc! {"$set": set})
            .return_document(ReturnDocument::After)
            .await
            .map_err(|source| query_error("update session", SESSION_COLLECTION_NAME, source))?
            .map(SessionEntity::try_from)
            .transpose()
    }

    async fn insert_player(&self, player: PlayerEntity) -> MongoResult<()> {
        let key = player_key(player.session_id, player.user_id);
        let document: MongoPlayerDocument = player.into();
        self.players()
            .await
            .insert_one(&document)
            .await
            .map_err(|source| write_error(PLAYER_COLLECTION_NAME, key, source))?;
        Ok(())
    }

    async fn list_players(&self, session_id: Uuid) -> MongoResult<Vec<PlayerRecord>> {
        let documents: Vec<MongoPlayerDocument> = self
            .players()
            .await
            .find(doc! {"session_id": session_id.to_string()})
            .sort(doc! {"joined_at": 1, "user_id": 1})
            .await
            .map_err(|source| query_error("list players", PLAYER_COLLECTION_NAME, source))?
            .try_collect()
            .await
            .map_err(|source| query_error("list players", PLAYER_COLLECTION_NAME, source))?;

        let user_ids: Vec<String> = documents
            .iter()
            .map(|document| document.user_id().to_owned())
            .collect();
        let profiles = self.load_profiles(user_ids).await?;

        documents
            .into_iter()
            .map(|document| {
                let player = PlayerEntity::try_from(document)?;
                let profile = profiles.get(&player.user_id).cloned();
                Ok(PlayerRecord { player, profile })
            })
            .collect()
    }

    async fn load_profiles(&self, user_ids: Vec<String>) -> MongoResult<HashMap<Uuid, ProfileEntity>> {
        if user_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let documents: Vec<MongoProfileDocument> = self
            .profiles()
            .await
            .find(doc! {"_id": {"$in": user_ids}})
            .await
            .map_err(|source| query_error("load profiles", PROFILE_COLLECTION_NAME, source))?
            .try_collect()
            .await
            .map_err(|source| query_error("load profiles", PROFILE_COLLECTION_NAME, source))?;

        let mut profiles = HashMap::with_capacity(documents.len());
        for document in documents {
            match ProfileEntity::try_from(document) {
                Ok(profile) => {
                    profiles.insert(profile.user_id, profile);
                }
                // A broken profile only costs the display data, not the player.
                Err(err) => warn!(error = %err, "skipping unreadable profile"),
            }
        }
        Ok(profiles)
    }

    async fn find_player(&self, session_id: Uuid, user_id: Uuid) -> MongoResult<Option<PlayerEntity>> {
        self.players()
            .await
            .find_one(doc_id(player_key(session_id, user_id)))
            .await
            .map_err(|source| query_error("load player", PLAYER_COLLECTION_NAME, source))?
            .map(PlayerEntity::try_from)
            .transpose()
    }

    async fn modify_player(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        update: Document,
        operation: &'static str,
    ) -> MongoResult<Option<PlayerEntity>> {
        self.players()
            .await
            .find_one_and_update(doc_id(player_key(session_id, user_id)), update)
            .return_document(ReturnDocument::After)
            .await
            .map_err(|source| query_error(operation, PLAYER_COLLECTION_NAME, source))?
            .map(PlayerEntity::try_from)
            .transpose()
    }

    async fn update_player(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        patch: PlayerPatch,
    ) -> MongoResult<Option<PlayerEntity>> {
        let set = player_set(&patch);
        if set.is_empty() {
            return self.find_player(session_id, user_id).await;
        }
        self.modify_player(session_id, user_id, doc! {"$set": set}, "update player")
            .await
    }

    async fn increment_player_score(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        score_delta: u32,
        chips_delta: u32,
    ) -> MongoResult<Option<PlayerEntity>> {
        let update = doc! {
            "$inc": {
                "score": i64::from(score_delta),
                "chips": i64::from(chips_delta),
            }
        };
        self.modify_player(session_id, user_id, update, "increment score")
            .await
    }

    async fn insert_action(&self, mut action: ActionEntity) -> MongoResult<ActionEntity> {
        action.created_at = SystemTime::now();
        let key = action.id.to_string();
        let document: MongoActionDocument = action.clone().into();
        self.actions()
            .await
            .insert_one(&document)
            .await
            .map_err(|source| write_error(ACTION_COLLECTION_NAME, key, source))?;
        Ok(action)
    }

    async fn list_actions(&self, session_id: Uuid, round: u32) -> MongoResult<Vec<ActionEntity>> {
        let documents: Vec<MongoActionDocument> = self
            .actions()
            .await
            .find(doc! {"session_id": session_id.to_string(), "round": i64::from(round)})
            .sort(doc! {"created_at": 1})
            .await
            .map_err(|source| query_error("list actions", ACTION_COLLECTION_NAME, source))?
            .try_collect()
            .await
            .map_err(|source| query_error("list actions", ACTION_COLLECTION_NAME, source))?;

        documents.into_iter().map(ActionEntity::try_from).collect()
    }

    async fn watch_collection<D, T>(
        &self,
        collection: Collection<D>,
        name: &'static str,
        pipeline: Vec<Document>,
    ) -> MongoResult<ChangeStream<T>>
    where
        D: DeserializeOwned + Unpin + Send + Sync + 'static,
        T: TryFrom<D, Error = MongoDaoError> + Send + 'static,
    {
        let changes = collection
            .watch()
            .pipeline(pipeline)
            .full_document(FullDocumentType::UpdateLookup)
            .await
            .map_err(|source| MongoDaoError::ChangeStream {
                collection: name,
                source,
            })?;
        Ok(forward_changes(changes, name))
    }

    async fn watch_session(&self, id: Uuid) -> MongoResult<ChangeStream<SessionEntity>> {
        let pipeline = vec![doc! {
            "$match": {
                "documentKey._id": id.to_string(),
                "operationType": { "$in": ["insert", "update", "replace"] },
            }
        }];
        let collection = self.sessions().await;
        self.watch_collection(collection, SESSION_COLLECTION_NAME, pipeline)
            .await
    }

    async fn watch_players(&self, session_id: Uuid) -> MongoResult<ChangeStream<PlayerEntity>> {
        let pipeline = vec![doc! {
            "$match": {
                "fullDocument.session_id": session_id.to_string(),
                "operationType": { "$in": ["insert", "update", "replace"] },
            }
        }];
        let collection = self.players().await;
        self.watch_collection(collection, PLAYER_COLLECTION_NAME, pipeline)
            .await
    }

    async fn watch_actions(&self, session_id: Uuid, round: u32) -> MongoResult<ChangeStream<ActionEntity>> {
        let pipeline = vec![doc! {
            "$match": {
                "operationType": "insert",
                "fullDocument.session_id": session_id.to_string(),
                "fullDocument.round": i64::from(round),
            }
        }];
        let collection = self.actions().await;
        self.watch_collection(collection, ACTION_COLLECTION_NAME, pipeline)
            .await
    }
}

/// Adapt a driver change stream into entity notifications. The stream ends
/// after the first driver error so the caller resubscribes.
fn forward_changes<D, T>(
    changes: MongoChangeStream<ChangeStreamEvent<D>>,
    collection: &'static str,
) -> ChangeStream<T>
where
    D: DeserializeOwned + Unpin + Send + Sync + 'static,
    T: TryFrom<D, Error = MongoDaoError> + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut changes = Box::pin(changes);
        while let Some(event) = changes.next().await {
            match event {
                Ok(event) => {
                    let Some(document) = event.full_document else {
                        continue;
                    };
                    match T::try_from(document) {
                        Ok(entity) => yield Ok(entity),
                        Err(err) => warn!(collection, error = %err, "dropping unreadable change"),
                    }
                }
                Err(source) => {
                    yield Err(StorageError::from(MongoDaoError::ChangeStream { collection, source }));
                    break;
                }
            }
        }
    };
    Box::pin(stream)
}

fn query_error(
    operation: &'static str,
    collection: &'static str,
    source: mongodb::error::Error,
) -> MongoDaoError {
    MongoDaoError::Query {
        operation,
        collection,
        source,
    }
}

fn write_error(collection: &'static str, key: String, source: mongodb::error::Error) -> MongoDaoError {
    if is_duplicate_key(&source) {
        MongoDaoError::DuplicateKey { collection, key }
    } else {
        query_error("insert", collection, source)
    }
}

impl SessionStore for MongoSessionStore {
    fn insert_session(&self, session: SessionEntity) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.insert_session(session).await.map_err(Into::into) })
    }

    fn find_session(&self, id: Uuid) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
        let store = self.clone();
        Box::pin(async move { store.find_session(id).await.map_err(Into::into) })
    }

    fn find_latest_session(
        &self,
        event_id: Uuid,
        game_type: Option<GameType>,
        statuses: Vec<SessionStatus>,
    ) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .find_latest_session(event_id, game_type, statuses)
                .await
                .map_err(Into::into)
        })
    }

    fn update_session(
        &self,
        id: Uuid,
        patch: SessionPatch,
    ) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
        let store = self.clone();
        Box::pin(async move { store.update_session(id, patch).await.map_err(Into::into) })
    }

    fn watch_session(
        &self,
        id: Uuid,
    ) -> BoxFuture<'static, StorageResult<ChangeStream<SessionEntity>>> {
        let store = self.clone();
        Box::pin(async move { store.watch_session(id).await.map_err(Into::into) })
    }

    fn insert_player(&self, player: PlayerEntity) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.insert_player(player).await.map_err(Into::into) })
    }

    fn list_players(
        &self,
        session_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Vec<PlayerRecord>>> {
        let store = self.clone();
        Box::pin(async move { store.list_players(session_id).await.map_err(Into::into) })
    }

    fn find_player(
        &self,
        session_id: Uuid,
        user_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Option<PlayerEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .find_player(session_id, user_id)
                .await
                .map_err(Into::into)
        })
    }

    fn update_player(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        patch: PlayerPatch,
    ) -> BoxFuture<'static, StorageResult<Option<PlayerEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .update_player(session_id, user_id, patch)
                .await
                .map_err(Into::into)
        })
    }

    fn increment_player_score(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        score_delta: u32,
        chips_delta: u32,
    ) -> BoxFuture<'static, StorageResult<Option<PlayerEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .increment_player_score(session_id, user_id, score_delta, chips_delta)
                .await
                .map_err(Into::into)
        })
    }

    fn watch_players(
        &self,
        session_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<ChangeStream<PlayerEntity>>> {
        let store = self.clone();
        Box::pin(async move { store.watch_players(session_id).await.map_err(Into::into) })
    }

    fn insert_action(&self, action: ActionEntity) -> BoxFuture<'static, StorageResult<ActionEntity>> {
        let store = self.clone();
        Box::pin(async move { store.insert_action(action).await.map_err(Into::into) })
    }

    fn list_actions(
        &self,
        session_id: Uuid,
        round: u32,
    ) -> BoxFuture<'static, StorageResult<Vec<ActionEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .list_actions(session_id, round)
                .await
                .map_err(Into::into)
        })
    }

    fn watch_actions(
        &self,
        session_id: Uuid,
        round: u32,
    ) -> BoxFuture<'static, StorageResult<ChangeStream<ActionEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .watch_actions(session_id, round)
                .await
                .map_err(Into::into)
        })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.inner.ping().await.map_err(Into::into) })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.inner.reconnect().await.map_err(Into::into) })
    }
}

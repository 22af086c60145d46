//! services/api/src/web/testing.rs
//!
//! Shared in-memory port implementations used by the web-layer tests.

use crate::config::Config;
use crate::music::MusicQueryProcessor;
use crate::web::protocol::ServerMessage;
use crate::web::rooms::RoomManager;
use crate::web::state::{ActiveGenerations, AppState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lm_chat_core::domain::{Chat, ChatKind, Message, User, UserCredentials};
use lm_chat_core::ports::{
    DatabaseService, GenerationOptions, LanguageModelService, MusicCatalogService, PortError,
    PortResult, TokenStream,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

pub(crate) fn test_config() -> Config {
    Config {
        bind_address: "127.0.0.1:0".parse().unwrap(),
        database_url: String::new(),
        log_level: tracing::Level::INFO,
        lm_studio_url: "http://localhost:1234/v1".to_string(),
        lm_model: "local-model".to_string(),
        lm_api_key: "lm-studio".to_string(),
        allowed_origin: "http://localhost:3000".to_string(),
    }
}

pub(crate) fn test_state(
    db: Arc<dyn DatabaseService>,
    lm: Arc<dyn LanguageModelService>,
    catalog: Arc<dyn MusicCatalogService>,
) -> Arc<AppState> {
    Arc::new(AppState {
        config: Arc::new(test_config()),
        db,
        lm: lm.clone(),
        catalog,
        music: MusicQueryProcessor::new(lm),
        rooms: RoomManager::default(),
        generations: ActiveGenerations::default(),
    })
}

/// Collects everything currently queued on a room subscription.
pub(crate) fn drain(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

//=========================================================================================
// In-memory conversation store
//=========================================================================================

/// A conversation store backed by vectors: enough of `DatabaseService` for the
/// streaming core, with the auth surface left unimplemented.
#[derive(Default)]
pub(crate) struct MemoryStore {
    owned: Mutex<HashSet<(Uuid, Uuid)>>,
    messages: Mutex<Vec<Message>>,
}

impl MemoryStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_chat(self, chat_id: Uuid, user_id: Uuid) -> Self {
        self.owned.lock().unwrap().insert((chat_id, user_id));
        self
    }

    pub(crate) fn stored_messages(&self) -> Vec<Message> {
        self.messages.lock().unwrap().clone()
    }
}

fn not_exercised<T>() -> PortResult<T> {
    Err(PortError::Unexpected(
        "not exercised by this test double".to_string(),
    ))
}

#[async_trait]
impl DatabaseService for MemoryStore {
    async fn create_user(&self, _: &str, _: &str) -> PortResult<User> {
        not_exercised()
    }

    async fn get_user_by_username(&self, _: &str) -> PortResult<Option<UserCredentials>> {
        not_exercised()
    }

    async fn create_auth_session(&self, _: &str, _: Uuid, _: DateTime<Utc>) -> PortResult<()> {
        not_exercised()
    }

    async fn validate_auth_session(&self, _: &str) -> PortResult<Uuid> {
        not_exercised()
    }

    async fn delete_auth_session(&self, _: &str) -> PortResult<()> {
        not_exercised()
    }

    async fn create_chat(&self, _: Uuid, _: Option<&str>, _: ChatKind) -> PortResult<Chat> {
        not_exercised()
    }

    async fn list_chats(&self, _: Uuid) -> PortResult<Vec<Chat>> {
        not_exercised()
    }

    async fn get_chat(&self, chat_id: Uuid, user_id: Uuid) -> PortResult<Option<Chat>> {
        let owned = self.owned.lock().unwrap().contains(&(chat_id, user_id));
        Ok(owned.then(|| Chat {
            id: chat_id,
            title: "Test chat".to_string(),
            created_at: Utc::now(),
            user_id,
            kind: ChatKind::General,
        }))
    }

    async fn rename_chat(&self, _: Uuid, _: Uuid, _: &str) -> PortResult<bool> {
        not_exercised()
    }

    async fn delete_chat(&self, _: Uuid, _: Uuid) -> PortResult<bool> {
        not_exercised()
    }

    async fn add_message(
        &self,
        chat_id: Uuid,
        content: &str,
        is_user: bool,
    ) -> PortResult<Message> {
        let message = Message {
            id: Uuid::new_v4(),
            chat_id,
            content: content.to_string(),
            created_at: Utc::now(),
            is_user,
        };
        self.messages.lock().unwrap().push(message.clone());
        Ok(message)
    }

    async fn list_messages(&self, chat_id: Uuid) -> PortResult<Vec<Message>> {
        Ok(self
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.chat_id == chat_id)
            .cloned()
            .collect())
    }

    async fn update_message_content(&self, message_id: Uuid, content: &str) -> PortResult<()> {
        let mut messages = self.messages.lock().unwrap();
        match messages.iter_mut().find(|m| m.id == message_id) {
            Some(message) => {
                message.content = content.to_string();
                Ok(())
            }
            None => Err(PortError::NotFound(format!(
                "Message {} not found",
                message_id
            ))),
        }
    }
}

//=========================================================================================
// Language-model doubles
//=========================================================================================

/// Streams a fixed fragment script; `generate` is not available.
pub(crate) struct StreamLm {
    fragments: Vec<Result<String, String>>,
}

impl StreamLm {
    pub(crate) fn ok(fragments: &[&str]) -> Self {
        Self {
            fragments: fragments.iter().map(|f| Ok(f.to_string())).collect(),
        }
    }

    pub(crate) fn with_script(fragments: Vec<Result<String, String>>) -> Self {
        Self { fragments }
    }
}

#[async_trait]
impl LanguageModelService for StreamLm {
    async fn generate(&self, _: &str, _: GenerationOptions) -> PortResult<String> {
        not_exercised()
    }

    async fn generate_stream(&self, _: &str, _: GenerationOptions) -> PortResult<TokenStream> {
        let items: Vec<PortResult<String>> = self
            .fragments
            .iter()
            .cloned()
            .map(|r| r.map_err(PortError::Backend))
            .collect();
        Ok(Box::pin(futures::stream::iter(items)))
    }
}

/// Streams whatever the test pushes through a channel, so the test controls
/// fragment pacing.
pub(crate) struct ChannelLm {
    rx: Mutex<Option<mpsc::UnboundedReceiver<PortResult<String>>>>,
}

impl ChannelLm {
    pub(crate) fn new() -> (Self, mpsc::UnboundedSender<PortResult<String>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                rx: Mutex::new(Some(rx)),
            },
            tx,
        )
    }
}

#[async_trait]
impl LanguageModelService for ChannelLm {
    async fn generate(&self, _: &str, _: GenerationOptions) -> PortResult<String> {
        not_exercised()
    }

    async fn generate_stream(&self, _: &str, _: GenerationOptions) -> PortResult<TokenStream> {
        let mut rx = self
            .rx
            .lock()
            .unwrap()
            .take()
            .expect("channel stream opened twice");
        Ok(Box::pin(async_stream::stream! {
            while let Some(item) = rx.recv().await {
                yield item;
            }
        }))
    }
}

/// Scripts the two-call music pipeline: translation reply, rendering reply,
/// and the fragments of the final streamed answer.
pub(crate) struct MusicLm {
    pub(crate) sql: String,
    pub(crate) rendering: String,
    pub(crate) fragments: Vec<String>,
    pub(crate) last_stream_prompt: Mutex<Option<String>>,
}

impl MusicLm {
    pub(crate) fn new(sql: &str, rendering: &str, fragments: &[&str]) -> Self {
        Self {
            sql: sql.to_string(),
            rendering: rendering.to_string(),
            fragments: fragments.iter().map(|f| f.to_string()).collect(),
            last_stream_prompt: Mutex::new(None),
        }
    }
}

#[async_trait]
impl LanguageModelService for MusicLm {
    async fn generate(&self, prompt: &str, _: GenerationOptions) -> PortResult<String> {
        if prompt.starts_with("Convert the following natural language query") {
            Ok(self.sql.clone())
        } else if prompt.starts_with("Convert these music database results") {
            Ok(self.rendering.clone())
        } else {
            Err(PortError::Unexpected(format!(
                "unscripted prompt: {}",
                prompt
            )))
        }
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        _: GenerationOptions,
    ) -> PortResult<TokenStream> {
        *self.last_stream_prompt.lock().unwrap() = Some(prompt.to_string());
        let items: Vec<PortResult<String>> =
            self.fragments.iter().cloned().map(Ok).collect();
        Ok(Box::pin(futures::stream::iter(items)))
    }
}

//=========================================================================================
// Music catalog double
//=========================================================================================

/// Returns fixed rows and records every statement it was asked to run.
pub(crate) struct RecordingCatalog {
    rows: Vec<serde_json::Value>,
    queries: Mutex<Vec<String>>,
}

impl RecordingCatalog {
    pub(crate) fn new(rows: Vec<serde_json::Value>) -> Self {
        Self {
            rows,
            queries: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn executed(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl MusicCatalogService for RecordingCatalog {
    async fn execute_query(&self, sql: &str) -> PortResult<Vec<serde_json::Value>> {
        self.queries.lock().unwrap().push(sql.to_string());
        Ok(self.rows.clone())
    }
}

//! crates/lm_chat_core/src/ports.rs
//!
//! Defines the service contracts (traits) for the application's core logic.
//! These traits form the boundary of the hexagonal architecture, allowing the core
//! to be independent of specific external implementations like databases or APIs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use std::pin::Pin;
use uuid::Uuid;

use crate::domain::{Chat, ChatKind, Message, User, UserCredentials};

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
/// This abstracts away the specific errors from external services (e.g., database, network).
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
    #[error("Unauthorized")]
    Unauthorized,
    /// The language-model endpoint failed (network error, non-success status,
    /// or a response envelope with no usable content). Never retried here.
    #[error("Language model backend error: {0}")]
    Backend(String),
    /// A generated query failed the read-only allowlist/denylist check and
    /// was never executed.
    #[error("Unsafe generated query: {0}")]
    UnsafeQuery(String),
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

/// A lazily-produced sequence of text fragments from a streaming generation.
/// Forward-only and non-restartable; dropping it closes the underlying
/// connection.
pub type TokenStream = Pin<Box<dyn Stream<Item = PortResult<String>> + Send>>;

/// Sampling parameters for a generation request.
#[derive(Debug, Clone, Copy)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 2000,
            top_p: 0.95,
        }
    }
}

//=========================================================================================
// Service Ports (Traits)
//=========================================================================================

#[async_trait]
pub trait DatabaseService: Send + Sync {
    // --- Auth Methods ---
    async fn create_user(&self, username: &str, password_hash: &str) -> PortResult<User>;

    async fn get_user_by_username(&self, username: &str) -> PortResult<Option<UserCredentials>>;

    async fn create_auth_session(
        &self,
        session_id: &str,
        user_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> PortResult<()>;

    async fn validate_auth_session(&self, session_id: &str) -> PortResult<Uuid>;

    async fn delete_auth_session(&self, session_id: &str) -> PortResult<()>;

    // --- Chat Management ---
    /// Creates a chat. Without an explicit title a default one is generated
    /// from the current local date and time.
    async fn create_chat(
        &self,
        user_id: Uuid,
        title: Option<&str>,
        kind: ChatKind,
    ) -> PortResult<Chat>;

    /// All chats of a user, newest first.
    async fn list_chats(&self, user_id: Uuid) -> PortResult<Vec<Chat>>;

    /// Fetches a chat only if it belongs to the given user. An ownership
    /// mismatch is absence, not an error; callers treat it as not-found.
    async fn get_chat(&self, chat_id: Uuid, user_id: Uuid) -> PortResult<Option<Chat>>;

    /// Returns false (and changes nothing) when the chat is not owned.
    async fn rename_chat(&self, chat_id: Uuid, user_id: Uuid, new_title: &str)
        -> PortResult<bool>;

    /// Returns false when the chat is not owned. Deletion cascades to all of
    /// the chat's messages.
    async fn delete_chat(&self, chat_id: Uuid, user_id: Uuid) -> PortResult<bool>;

    // --- Message Management ---
    async fn add_message(&self, chat_id: Uuid, content: &str, is_user: bool)
        -> PortResult<Message>;

    /// Messages of a chat, chronological by creation time.
    async fn list_messages(&self, chat_id: Uuid) -> PortResult<Vec<Message>>;

    /// Overwrites a message's content. Only assistant messages are ever
    /// mutated, repeatedly, as their generation stream accumulates.
    async fn update_message_content(&self, message_id: Uuid, content: &str) -> PortResult<()>;
}

#[async_trait]
pub trait LanguageModelService: Send + Sync {
    /// Generates a complete response for the prompt.
    async fn generate(&self, prompt: &str, options: GenerationOptions) -> PortResult<String>;

    /// Opens a streaming generation over the prompt. Each item is a non-empty
    /// text fragment; the stream ends when the backend signals completion.
    /// Malformed individual frames are skipped, not surfaced.
    async fn generate_stream(
        &self,
        prompt: &str,
        options: GenerationOptions,
    ) -> PortResult<TokenStream>;
}

#[async_trait]
pub trait MusicCatalogService: Send + Sync {
    /// Executes an already-vetted read-only statement against the music
    /// catalog and returns the rows as field-mappings.
    async fn execute_query(&self, sql: &str) -> PortResult<Vec<serde_json::Value>>;
}

//! crates/lm_chat_core/src/domain.rs
//!
//! Defines the pure, core data structures for the application.
//! These structs are independent of any database or serialization format.

use chrono::{DateTime, Utc};
use uuid::Uuid;

// Represents a user - used throughout app
#[derive(Debug, Clone)]
pub struct User {
    pub id: Uuid,
    pub username: String,
}

// Only used internally for login/register - contains sensitive data
#[derive(Debug, Clone)]
pub struct UserCredentials {
    pub id: Uuid,
    pub username: String,
    pub password_hash: String,
}

// Represents a browser login session (auth cookie)
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub id: String,
    pub user_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// The kind discriminator of a conversation. Music chats route through the
/// natural-language-to-SQL gate before generation; everything else goes
/// straight to the language model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChatKind {
    #[default]
    General,
    Music,
}

impl ChatKind {
    /// Parses a wire/database name. Anything that is not "music" is a
    /// general chat.
    pub fn from_name(name: &str) -> Self {
        if name == "music" {
            ChatKind::Music
        } else {
            ChatKind::General
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChatKind::General => "general",
            ChatKind::Music => "music",
        }
    }
}

/// A conversation thread owned by a user.
#[derive(Debug, Clone)]
pub struct Chat {
    pub id: Uuid,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub user_id: Uuid,
    pub kind: ChatKind,
}

/// One turn in a conversation. Assistant-authored messages are created empty
/// and overwritten as the generation stream progresses; user-authored
/// messages are immutable once stored.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub is_user: bool,
}

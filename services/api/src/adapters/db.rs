//! services/api/src/adapters/db.rs
//!
//! This module contains the database adapter, which is the concrete implementation
//! of the `DatabaseService` and `MusicCatalogService` ports from the `core` crate.
//! It handles all interactions with the PostgreSQL database using `sqlx`.

use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use lm_chat_core::domain::{Chat, ChatKind, Message, User, UserCredentials};
use lm_chat_core::ports::{DatabaseService, MusicCatalogService, PortError, PortResult};
use sqlx::postgres::PgRow;
use sqlx::{Column, FromRow, PgPool, Row};
use uuid::Uuid;

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A database adapter that implements the `DatabaseService` and
/// `MusicCatalogService` ports.
#[derive(Clone)]
pub struct DbAdapter {
    pool: PgPool,
}

impl DbAdapter {
    /// Creates a new `DbAdapter`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// A helper function to run database migrations at startup.
    pub async fn run_migrations(&self) -> Result<(), sqlx::Error> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

/// Default title for a chat created without one: the local creation time to
/// minute precision.
fn default_chat_title(now: DateTime<Local>) -> String {
    format!("Chat {}", now.format("%Y-%m-%d %H:%M"))
}

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================

#[derive(FromRow)]
struct UserRecord {
    id: Uuid,
    username: String,
}
impl UserRecord {
    fn to_domain(self) -> User {
        User {
            id: self.id,
            username: self.username,
        }
    }
}

#[derive(FromRow)]
struct CredentialsRecord {
    id: Uuid,
    username: String,
    password_hash: String,
}
impl CredentialsRecord {
    fn to_domain(self) -> UserCredentials {
        UserCredentials {
            id: self.id,
            username: self.username,
            password_hash: self.password_hash,
        }
    }
}

#[derive(FromRow)]
struct AuthSessionRecord {
    user_id: Uuid,
    expires_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct ChatRecord {
    id: Uuid,
    title: String,
    created_at: DateTime<Utc>,
    user_id: Uuid,
    chat_type: String,
}
impl ChatRecord {
    fn to_domain(self) -> Chat {
        Chat {
            id: self.id,
            title: self.title,
            created_at: self.created_at,
            user_id: self.user_id,
            kind: ChatKind::from_name(&self.chat_type),
        }
    }
}

#[derive(FromRow)]
struct MessageRecord {
    id: Uuid,
    chat_id: Uuid,
    content: String,
    created_at: DateTime<Utc>,
    is_user: bool,
}
impl MessageRecord {
    fn to_domain(self) -> Message {
        Message {
            id: self.id,
            chat_id: self.chat_id,
            content: self.content,
            created_at: self.created_at,
            is_user: self.is_user,
        }
    }
}

//=========================================================================================
// `DatabaseService` Trait Implementation
//=========================================================================================

#[async_trait]
impl DatabaseService for DbAdapter {
    async fn create_user(&self, username: &str, password_hash: &str) -> PortResult<User> {
        let record = sqlx::query_as::<_, UserRecord>(
            "INSERT INTO users (id, username, password_hash) VALUES ($1, $2, $3) \
             RETURNING id, username",
        )
        .bind(Uuid::new_v4())
        .bind(username)
        .bind(password_hash)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                PortError::Unexpected(format!("Username '{}' already exists", username))
            }
            _ => PortError::Unexpected(e.to_string()),
        })?;

        Ok(record.to_domain())
    }

    async fn get_user_by_username(&self, username: &str) -> PortResult<Option<UserCredentials>> {
        let record = sqlx::query_as::<_, CredentialsRecord>(
            "SELECT id, username, password_hash FROM users WHERE username = $1",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| PortError::Unexpected(e.to_string()))?;

        Ok(record.map(CredentialsRecord::to_domain))
    }

    async fn create_auth_session(
        &self,
        session_id: &str,
        user_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> PortResult<()> {
        sqlx::query("INSERT INTO auth_sessions (id, user_id, expires_at) VALUES ($1, $2, $3)")
            .bind(session_id)
            .bind(user_id)
            .bind(expires_at)
            .execute(&self.pool)
            .await
            .map_err(|e| PortError::Unexpected(e.to_string()))?;
        Ok(())
    }

    async fn validate_auth_session(&self, session_id: &str) -> PortResult<Uuid> {
        let record = sqlx::query_as::<_, AuthSessionRecord>(
            "SELECT user_id, expires_at FROM auth_sessions WHERE id = $1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| PortError::Unexpected(e.to_string()))?;

        match record {
            Some(session) if session.expires_at > Utc::now() => Ok(session.user_id),
            _ => Err(PortError::Unauthorized),
        }
    }

    async fn delete_auth_session(&self, session_id: &str) -> PortResult<()> {
        sqlx::query("DELETE FROM auth_sessions WHERE id = $1")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(|e| PortError::Unexpected(e.to_string()))?;
        Ok(())
    }

    async fn create_chat(
        &self,
        user_id: Uuid,
        title: Option<&str>,
        kind: ChatKind,
    ) -> PortResult<Chat> {
        let title = match title {
            Some(t) => t.to_string(),
            None => default_chat_title(Local::now()),
        };

        let record = sqlx::query_as::<_, ChatRecord>(
            "INSERT INTO chats (id, title, user_id, chat_type) VALUES ($1, $2, $3, $4) \
             RETURNING id, title, created_at, user_id, chat_type",
        )
        .bind(Uuid::new_v4())
        .bind(&title)
        .bind(user_id)
        .bind(kind.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| PortError::Unexpected(e.to_string()))?;

        Ok(record.to_domain())
    }

    async fn list_chats(&self, user_id: Uuid) -> PortResult<Vec<Chat>> {
        let records = sqlx::query_as::<_, ChatRecord>(
            "SELECT id, title, created_at, user_id, chat_type FROM chats \
             WHERE user_id = $1 ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PortError::Unexpected(e.to_string()))?;

        Ok(records.into_iter().map(ChatRecord::to_domain).collect())
    }

    async fn get_chat(&self, chat_id: Uuid, user_id: Uuid) -> PortResult<Option<Chat>> {
        let record = sqlx::query_as::<_, ChatRecord>(
            "SELECT id, title, created_at, user_id, chat_type FROM chats \
             WHERE id = $1 AND user_id = $2",
        )
        .bind(chat_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| PortError::Unexpected(e.to_string()))?;

        Ok(record.map(ChatRecord::to_domain))
    }

    async fn rename_chat(
        &self,
        chat_id: Uuid,
        user_id: Uuid,
        new_title: &str,
    ) -> PortResult<bool> {
        let result = sqlx::query("UPDATE chats SET title = $1 WHERE id = $2 AND user_id = $3")
            .bind(new_title)
            .bind(chat_id)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(|e| PortError::Unexpected(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_chat(&self, chat_id: Uuid, user_id: Uuid) -> PortResult<bool> {
        // Messages go with the chat via ON DELETE CASCADE.
        let result = sqlx::query("DELETE FROM chats WHERE id = $1 AND user_id = $2")
            .bind(chat_id)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(|e| PortError::Unexpected(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn add_message(
        &self,
        chat_id: Uuid,
        content: &str,
        is_user: bool,
    ) -> PortResult<Message> {
        let record = sqlx::query_as::<_, MessageRecord>(
            "INSERT INTO messages (id, chat_id, content, is_user) VALUES ($1, $2, $3, $4) \
             RETURNING id, chat_id, content, created_at, is_user",
        )
        .bind(Uuid::new_v4())
        .bind(chat_id)
        .bind(content)
        .bind(is_user)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| PortError::Unexpected(e.to_string()))?;

        Ok(record.to_domain())
    }

    async fn list_messages(&self, chat_id: Uuid) -> PortResult<Vec<Message>> {
        let records = sqlx::query_as::<_, MessageRecord>(
            "SELECT id, chat_id, content, created_at, is_user FROM messages \
             WHERE chat_id = $1 ORDER BY created_at ASC",
        )
        .bind(chat_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PortError::Unexpected(e.to_string()))?;

        Ok(records.into_iter().map(MessageRecord::to_domain).collect())
    }

    async fn update_message_content(&self, message_id: Uuid, content: &str) -> PortResult<()> {
        sqlx::query("UPDATE messages SET content = $1 WHERE id = $2")
            .bind(content)
            .bind(message_id)
            .execute(&self.pool)
            .await
            .map_err(|e| PortError::Unexpected(e.to_string()))?;
        Ok(())
    }
}

//=========================================================================================
// `MusicCatalogService` Trait Implementation
//=========================================================================================

#[async_trait]
impl MusicCatalogService for DbAdapter {
    /// Executes a vetted read-only statement and returns each row as a JSON
    /// object keyed by column name. The statement is dynamic, so columns are
    /// decoded by trial against the types the music schema can produce.
    async fn execute_query(&self, sql: &str) -> PortResult<Vec<serde_json::Value>> {
        let rows = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| PortError::Unexpected(format!("Database error: {}", e)))?;

        Ok(rows.iter().map(row_to_json).collect())
    }
}

fn row_to_json(row: &PgRow) -> serde_json::Value {
    let mut object = serde_json::Map::new();
    for (index, column) in row.columns().iter().enumerate() {
        let value = if let Ok(v) = row.try_get::<Option<String>, _>(index) {
            v.map(serde_json::Value::String)
                .unwrap_or(serde_json::Value::Null)
        } else if let Ok(v) = row.try_get::<Option<i32>, _>(index) {
            v.map(|n| serde_json::Value::Number(n.into()))
                .unwrap_or(serde_json::Value::Null)
        } else if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
            v.map(|n| serde_json::Value::Number(n.into()))
                .unwrap_or(serde_json::Value::Null)
        } else if let Ok(v) = row.try_get::<Option<f64>, _>(index) {
            v.and_then(serde_json::Number::from_f64)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null)
        } else if let Ok(v) = row.try_get::<Option<bool>, _>(index) {
            v.map(serde_json::Value::Bool)
                .unwrap_or(serde_json::Value::Null)
        } else {
            serde_json::Value::Null
        };
        object.insert(column.name().to_string(), value);
    }
    serde_json::Value::Object(object)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn default_title_is_local_time_to_the_minute() {
        let at = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 42).unwrap();
        assert_eq!(default_chat_title(at), "Chat 2024-03-09 14:05");
    }
}

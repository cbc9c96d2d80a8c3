//! Chat session history
//!
//! Sessions belong to one user. Every lookup is scoped by the owner's id, so
//! a session id from another account reads as missing.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chatmeter_billing::{StoreError, StoreResult};
use chatmeter_shared::Clock;
use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::upstream::{ChatMessage, Role};

pub const DEFAULT_SESSION_TITLE: &str = "New Chat";
pub const MAX_TITLE_CHARS: usize = 200;
pub const SESSION_LIST_LIMIT: i64 = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredMessage {
    pub id: Uuid,
    pub session_id: Uuid,
    pub role: Role,
    pub content: String,
    pub model_used: Option<String>,
    pub tokens_used: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub role: Role,
    pub content: String,
    pub model_used: Option<String>,
    pub tokens_used: i64,
}

impl NewMessage {
    pub fn from_chat(message: &ChatMessage) -> Self {
        Self {
            role: message.role,
            content: message.content.clone(),
            model_used: None,
            tokens_used: 0,
        }
    }
}

#[async_trait]
pub trait ChatHistoryStore: Send + Sync {
    async fn create_session(
        &self,
        user_id: Uuid,
        title: &str,
        now: OffsetDateTime,
    ) -> StoreResult<ChatSession>;

    /// Most recently updated first
    async fn list_sessions(&self, user_id: Uuid, limit: i64) -> StoreResult<Vec<ChatSession>>;

    async fn get_session(&self, user_id: Uuid, session_id: Uuid)
        -> StoreResult<Option<ChatSession>>;

    async fn rename_session(
        &self,
        user_id: Uuid,
        session_id: Uuid,
        title: &str,
        now: OffsetDateTime,
    ) -> StoreResult<Option<ChatSession>>;

    /// Removes the session and its messages. `false` when nothing matched.
    async fn delete_session(&self, user_id: Uuid, session_id: Uuid) -> StoreResult<bool>;

    /// Appends in order and touches the session. `false` when the session is
    /// missing or not owned by `user_id`.
    async fn append_messages(
        &self,
        user_id: Uuid,
        session_id: Uuid,
        messages: &[NewMessage],
        now: OffsetDateTime,
    ) -> StoreResult<bool>;

    /// Oldest first; `None` when the session is missing or not owned
    async fn messages(
        &self,
        user_id: Uuid,
        session_id: Uuid,
    ) -> StoreResult<Option<Vec<StoredMessage>>>;
}

// =============================================================================
// In-memory store
// =============================================================================

#[derive(Default)]
pub struct InMemoryHistory {
    sessions: RwLock<HashMap<Uuid, (ChatSession, Vec<StoredMessage>)>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatHistoryStore for InMemoryHistory {
    async fn create_session(
        &self,
        user_id: Uuid,
        title: &str,
        now: OffsetDateTime,
    ) -> StoreResult<ChatSession> {
        let session = ChatSession {
            id: Uuid::new_v4(),
            user_id,
            title: title.to_string(),
            created_at: now,
            updated_at: now,
        };
        self.sessions
            .write()
            .await
            .insert(session.id, (session.clone(), Vec::new()));
        Ok(session)
    }

    async fn list_sessions(&self, user_id: Uuid, limit: i64) -> StoreResult<Vec<ChatSession>> {
        let sessions = self.sessions.read().await;
        let mut owned: Vec<ChatSession> = sessions
            .values()
            .filter(|(s, _)| s.user_id == user_id)
            .map(|(s, _)| s.clone())
            .collect();
        owned.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        owned.truncate(usize::try_from(limit.max(0)).unwrap_or(usize::MAX));
        Ok(owned)
    }

    async fn get_session(
        &self,
        user_id: Uuid,
        session_id: Uuid,
    ) -> StoreResult<Option<ChatSession>> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .get(&session_id)
            .filter(|(s, _)| s.user_id == user_id)
            .map(|(s, _)| s.clone()))
    }

    async fn rename_session(
        &self,
        user_id: Uuid,
        session_id: Uuid,
        title: &str,
        now: OffsetDateTime,
    ) -> StoreResult<Option<ChatSession>> {
        let mut sessions = self.sessions.write().await;
        Ok(sessions
            .get_mut(&session_id)
            .filter(|(s, _)| s.user_id == user_id)
            .map(|(s, _)| {
                s.title = title.to_string();
                s.updated_at = now;
                s.clone()
            }))
    }

    async fn delete_session(&self, user_id: Uuid, session_id: Uuid) -> StoreResult<bool> {
        let mut sessions = self.sessions.write().await;
        let owned = sessions
            .get(&session_id)
            .is_some_and(|(s, _)| s.user_id == user_id);
        if owned {
            sessions.remove(&session_id);
        }
        Ok(owned)
    }

    async fn append_messages(
        &self,
        user_id: Uuid,
        session_id: Uuid,
        messages: &[NewMessage],
        now: OffsetDateTime,
    ) -> StoreResult<bool> {
        let mut sessions = self.sessions.write().await;
        let Some((session, stored)) = sessions
            .get_mut(&session_id)
            .filter(|(s, _)| s.user_id == user_id)
        else {
            return Ok(false);
        };

        stored.extend(messages.iter().map(|m| StoredMessage {
            id: Uuid::new_v4(),
            session_id,
            role: m.role,
            content: m.content.clone(),
            model_used: m.model_used.clone(),
            tokens_used: m.tokens_used,
            created_at: now,
        }));
        session.updated_at = now;
        Ok(true)
    }

    async fn messages(
        &self,
        user_id: Uuid,
        session_id: Uuid,
    ) -> StoreResult<Option<Vec<StoredMessage>>> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .get(&session_id)
            .filter(|(s, _)| s.user_id == user_id)
            .map(|(_, m)| m.clone()))
    }
}

// =============================================================================
// Postgres store
// =============================================================================

const SESSION_COLUMNS: &str = "id, user_id, title, created_at, updated_at";

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: Uuid,
    user_id: Uuid,
    title: String,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl From<SessionRow> for ChatSession {
    fn from(row: SessionRow) -> Self {
        ChatSession {
            id: row.id,
            user_id: row.user_id,
            title: row.title,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: Uuid,
    session_id: Uuid,
    role: String,
    content: String,
    model_used: Option<String>,
    tokens_used: i64,
    created_at: OffsetDateTime,
}

impl TryFrom<MessageRow> for StoredMessage {
    type Error = StoreError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        Ok(StoredMessage {
            id: row.id,
            session_id: row.session_id,
            role: row.role.parse().map_err(StoreError::Malformed)?,
            content: row.content,
            model_used: row.model_used,
            tokens_used: row.tokens_used,
            created_at: row.created_at,
        })
    }
}

/// History over the `chat_sessions` and `chat_messages` tables
#[derive(Clone)]
pub struct PgHistory {
    pool: PgPool,
}

impl PgHistory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChatHistoryStore for PgHistory {
    async fn create_session(
        &self,
        user_id: Uuid,
        title: &str,
        now: OffsetDateTime,
    ) -> StoreResult<ChatSession> {
        let row: SessionRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO chat_sessions (id, user_id, title, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $4)
            RETURNING {}
            "#,
            SESSION_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(title)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    async fn list_sessions(&self, user_id: Uuid, limit: i64) -> StoreResult<Vec<ChatSession>> {
        let rows: Vec<SessionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM chat_sessions WHERE user_id = $1 ORDER BY updated_at DESC LIMIT $2",
            SESSION_COLUMNS
        ))
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(ChatSession::from).collect())
    }

    async fn get_session(
        &self,
        user_id: Uuid,
        session_id: Uuid,
    ) -> StoreResult<Option<ChatSession>> {
        let row: Option<SessionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM chat_sessions WHERE id = $1 AND user_id = $2",
            SESSION_COLUMNS
        ))
        .bind(session_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(ChatSession::from))
    }

    async fn rename_session(
        &self,
        user_id: Uuid,
        session_id: Uuid,
        title: &str,
        now: OffsetDateTime,
    ) -> StoreResult<Option<ChatSession>> {
        let row: Option<SessionRow> = sqlx::query_as(&format!(
            r#"
            UPDATE chat_sessions SET title = $3, updated_at = $4
            WHERE id = $1 AND user_id = $2
            RETURNING {}
            "#,
            SESSION_COLUMNS
        ))
        .bind(session_id)
        .bind(user_id)
        .bind(title)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(ChatSession::from))
    }

    async fn delete_session(&self, user_id: Uuid, session_id: Uuid) -> StoreResult<bool> {
        // Messages go with the session (ON DELETE CASCADE)
        let result = sqlx::query("DELETE FROM chat_sessions WHERE id = $1 AND user_id = $2")
            .bind(session_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn append_messages(
        &self,
        user_id: Uuid,
        session_id: Uuid,
        messages: &[NewMessage],
        now: OffsetDateTime,
    ) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;

        let touched = sqlx::query(
            "UPDATE chat_sessions SET updated_at = $3 WHERE id = $1 AND user_id = $2",
        )
        .bind(session_id)
        .bind(user_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if touched.rows_affected() == 0 {
            return Ok(false);
        }

        for message in messages {
            sqlx::query(
                r#"
                INSERT INTO chat_messages
                    (id, session_id, role, content, model_used, tokens_used, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(session_id)
            .bind(message.role.as_str())
            .bind(&message.content)
            .bind(&message.model_used)
            .bind(message.tokens_used)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn messages(
        &self,
        user_id: Uuid,
        session_id: Uuid,
    ) -> StoreResult<Option<Vec<StoredMessage>>> {
        if self.get_session(user_id, session_id).await?.is_none() {
            return Ok(None);
        }

        let rows: Vec<MessageRow> = sqlx::query_as(
            r#"
            SELECT id, session_id, role, content, model_used, tokens_used, created_at
            FROM chat_messages
            WHERE session_id = $1
            ORDER BY seq ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(StoredMessage::try_from)
            .collect::<StoreResult<Vec<_>>>()
            .map(Some)
    }
}

// =============================================================================
// Service
// =============================================================================

/// Owner-scoped history operations with title rules applied
#[derive(Clone)]
pub struct ChatHistory {
    store: Arc<dyn ChatHistoryStore>,
    clock: Arc<dyn Clock>,
}

impl ChatHistory {
    pub fn new(store: Arc<dyn ChatHistoryStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn create_session(
        &self,
        user_id: Uuid,
        title: Option<&str>,
    ) -> ApiResult<ChatSession> {
        let title = normalize_title(title)?;
        Ok(self
            .store
            .create_session(user_id, &title, self.clock.now())
            .await?)
    }

    pub async fn list_sessions(&self, user_id: Uuid) -> ApiResult<Vec<ChatSession>> {
        Ok(self.store.list_sessions(user_id, SESSION_LIST_LIMIT).await?)
    }

    pub async fn session(&self, user_id: Uuid, session_id: Uuid) -> ApiResult<ChatSession> {
        self.store
            .get_session(user_id, session_id)
            .await?
            .ok_or_else(session_not_found)
    }

    pub async fn rename_session(
        &self,
        user_id: Uuid,
        session_id: Uuid,
        title: &str,
    ) -> ApiResult<ChatSession> {
        let title = normalize_title(Some(title))?;
        self.store
            .rename_session(user_id, session_id, &title, self.clock.now())
            .await?
            .ok_or_else(session_not_found)
    }

    pub async fn delete_session(&self, user_id: Uuid, session_id: Uuid) -> ApiResult<()> {
        if self.store.delete_session(user_id, session_id).await? {
            Ok(())
        } else {
            Err(session_not_found())
        }
    }

    pub async fn messages(&self, user_id: Uuid, session_id: Uuid) -> ApiResult<Vec<StoredMessage>> {
        self.store
            .messages(user_id, session_id)
            .await?
            .ok_or_else(session_not_found)
    }

    /// Persist one completed turn. Best-effort: the reply has already been
    /// produced, so a failure is logged and reported as `false`.
    pub async fn record_turn(
        &self,
        user_id: Uuid,
        session_id: Uuid,
        turn: &[NewMessage],
    ) -> bool {
        match self
            .store
            .append_messages(user_id, session_id, turn, self.clock.now())
            .await
        {
            Ok(true) => true,
            Ok(false) => {
                tracing::warn!(session_id = %session_id, "chat session vanished before the turn was saved");
                false
            }
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "failed to save chat turn");
                false
            }
        }
    }
}

fn session_not_found() -> ApiError {
    ApiError::NotFound("Chat session".to_string())
}

fn normalize_title(title: Option<&str>) -> ApiResult<String> {
    let title = title.map(str::trim).filter(|t| !t.is_empty());
    match title {
        None => Ok(DEFAULT_SESSION_TITLE.to_string()),
        Some(t) if t.chars().count() > MAX_TITLE_CHARS => Err(ApiError::Validation(format!(
            "Session title must be at most {} characters",
            MAX_TITLE_CHARS
        ))),
        Some(t) => Ok(t.to_string()),
    }
}

use std::path::PathBuf;

use async_trait::async_trait;
#[cfg(feature = "persistence")]
use sqlx::{sqlite::SqlitePoolOptions, Row, SqlitePool};
use tokio::sync::RwLock;
use tokio::{fs, io::AsyncWriteExt};

use crate::error::{Result, TetherError};
use crate::message::Message;

/// Generic persistence contract for conversation history.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn load(&self) -> Result<Vec<Message>>;
    async fn append(&self, message: &Message) -> Result<()>;
    async fn clear(&self) -> Result<()>;
}

#[derive(Default)]
pub struct InMemoryConversationStore {
    messages: RwLock<Vec<Message>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn load(&self) -> Result<Vec<Message>> {
        Ok(self.messages.read().await.clone())
    }

    async fn append(&self, message: &Message) -> Result<()> {
        self.messages.write().await.push(message.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.messages.write().await.clear();
        Ok(())
    }
}

/// A JSONL store: one serialized message per line.
pub struct FileConversationStore {
    path: PathBuf,
}

impl FileConversationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ConversationStore for FileConversationStore {
    async fn load(&self) -> Result<Vec<Message>> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(TetherError::Storage(format!(
                    "failed to read transcript `{}`: {err}",
                    self.path.display()
                )))
            }
        };

        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|err| {
                    TetherError::Storage(format!(
                        "corrupt transcript line in `{}`: {err}",
                        self.path.display()
                    ))
                })
            })
            .collect()
    }

    async fn append(&self, message: &Message) -> Result<()> {
        let mut serialized = serde_json::to_string(message)?;
        serialized.push('\n');
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|err| {
                TetherError::Storage(format!("failed to open `{}`: {err}", self.path.display()))
            })?
            .write_all(serialized.as_bytes())
            .await
            .map_err(|err| TetherError::Storage(format!("failed to persist message: {err}")))
    }

    async fn clear(&self) -> Result<()> {
        fs::remove_file(&self.path)
            .await
            .or_else(|err| {
                if err.kind() == std::io::ErrorKind::NotFound {
                    Ok(())
                } else {
                    Err(err)
                }
            })
            .map_err(|err| {
                TetherError::Storage(format!("failed clearing `{}`: {err}", self.path.display()))
            })
    }
}

/// SQLite-backed history. One database holds many conversations, keyed by session id.
#[cfg(feature = "persistence")]
#[derive(Clone)]
pub struct SqlConversationStore {
    pool: SqlitePool,
    session_id: String,
}

#[cfg(feature = "persistence")]
impl SqlConversationStore {
    pub const DEFAULT_SESSION: &'static str = "default";

    const SCHEMA: [&'static str; 2] = [
        r#"
        CREATE TABLE IF NOT EXISTS conversation_messages (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL,
            role TEXT NOT NULL,
            tool_call_id TEXT,
            payload TEXT NOT NULL
        )
        "#,
        "CREATE INDEX IF NOT EXISTS conversation_messages_session \
         ON conversation_messages (session_id, seq)",
    ];

    /// Opens (and migrates) the database; the store starts on the default session.
    pub async fn connect(connection_url: impl AsRef<str>) -> Result<Self> {
        let url = connection_url.as_ref();
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(url)
            .await
            .map_err(|err| sql_error(&format!("connecting to `{url}`"), err))?;

        for statement in Self::SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(|err| sql_error("initializing schema", err))?;
        }

        Ok(Self {
            pool,
            session_id: Self::DEFAULT_SESSION.to_string(),
        })
    }

    /// A handle on another conversation in the same database.
    pub fn for_session(&self, session_id: impl Into<String>) -> Self {
        Self {
            pool: self.pool.clone(),
            session_id: session_id.into(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Session ids with at least one stored message, sorted.
    pub async fn sessions(&self) -> Result<Vec<String>> {
        sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT session_id FROM conversation_messages ORDER BY session_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|err| sql_error("listing sessions", err))
    }
}

#[cfg(feature = "persistence")]
fn sql_error(context: &str, err: sqlx::Error) -> TetherError {
    TetherError::Storage(format!("sqlite store failed {context}: {err}"))
}

#[cfg(feature = "persistence")]
#[async_trait]
impl ConversationStore for SqlConversationStore {
    async fn load(&self) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT payload FROM conversation_messages WHERE session_id = ? ORDER BY seq",
        )
        .bind(self.session_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|err| sql_error("loading messages", err))?;

        rows.iter()
            .map(|row| {
                let payload: String = row
                    .try_get("payload")
                    .map_err(|err| sql_error("decoding a row", err))?;
                serde_json::from_str(&payload).map_err(|err| {
                    TetherError::Storage(format!(
                        "invalid message in session `{}`: {err}",
                        self.session_id
                    ))
                })
            })
            .collect()
    }

    async fn append(&self, message: &Message) -> Result<()> {
        let role = serde_json::to_value(message.role)?;
        sqlx::query(
            "INSERT INTO conversation_messages (session_id, role, tool_call_id, payload) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(self.session_id.as_str())
        .bind(role.as_str().unwrap_or_default().to_string())
        .bind(message.tool_call_id.clone())
        .bind(serde_json::to_string(message)?)
        .execute(&self.pool)
        .await
        .map_err(|err| sql_error("writing a message", err))?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM conversation_messages WHERE session_id = ?")
            .bind(self.session_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|err| sql_error("clearing messages", err))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Role, ToolCall};
    use tempfile::tempdir;

    #[tokio::test]
    async fn memory_store_keeps_order() {
        let store = InMemoryConversationStore::new();
        store.append(&Message::user("one")).await.unwrap();
        store.append(&Message::assistant("two")).await.unwrap();
        let loaded = store.load().await.unwrap();
        assert_eq!(loaded[1].content, "two");
        store.clear().await.unwrap();
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_store_persists_tool_exchanges() {
        let dir = tempdir().unwrap();
        let store = FileConversationStore::new(dir.path().join("history.jsonl"));
        assert!(store.load().await.unwrap().is_empty());

        let call = Message::assistant_with_tool_calls(
            "",
            vec![ToolCall::new("a", "calc", serde_json::json!({"expr": "2+2"}))],
        );
        store.append(&Message::user("hello")).await.unwrap();
        store.append(&call).await.unwrap();
        store.append(&Message::tool_result("a", "4")).await.unwrap();

        let reopened = FileConversationStore::new(dir.path().join("history.jsonl"));
        let loaded = reopened.load().await.unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[0].role, Role::User);
        assert_eq!(loaded[1], call);
        assert_eq!(loaded[2].tool_call_id.as_deref(), Some("a"));

        reopened.clear().await.unwrap();
        assert!(reopened.load().await.unwrap().is_empty());
        reopened.clear().await.unwrap();
    }

    #[tokio::test]
    async fn file_store_reports_corrupt_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.jsonl");
        std::fs::write(&path, "{not json}\n").unwrap();
        let err = FileConversationStore::new(path).load().await.unwrap_err();
        assert!(matches!(err, TetherError::Storage(_)));
    }

    #[cfg(feature = "persistence")]
    #[tokio::test]
    async fn sqlite_sessions_are_isolated() {
        let store = SqlConversationStore::connect("sqlite::memory:")
            .await
            .unwrap();
        let other = store.for_session("project-b");
        assert_eq!(store.session_id(), SqlConversationStore::DEFAULT_SESSION);

        store.append(&Message::user("hi from a")).await.unwrap();
        other.append(&Message::user("hi from b")).await.unwrap();
        other
            .append(&Message::tool_result("call_1", "done"))
            .await
            .unwrap();

        assert_eq!(store.load().await.unwrap().len(), 1);
        let loaded = other.load().await.unwrap();
        assert_eq!(loaded[0].content, "hi from b");
        assert_eq!(loaded[1].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(
            store.sessions().await.unwrap(),
            vec!["default".to_string(), "project-b".to_string()]
        );

        other.clear().await.unwrap();
        assert!(other.load().await.unwrap().is_empty());
        assert_eq!(store.load().await.unwrap()[0].content, "hi from a");
    }
}

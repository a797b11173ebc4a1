use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use tracing::{info, warn};

use super::error::{RepositoryError, RepositoryResult};
use super::live_query::{LiveQueryHub, Subscription};
use super::thread_repository::{BoxFuture, MessagesCallback, ThreadRepository, ThreadsCallback};
use crate::torgon::models::{Attachment, Message, ModelParams, Thread};

/// Migrations applied in order. Each entry is (version, sql).
/// To add a new migration: append a tuple with the next version number and its SQL.
/// Never edit or remove existing entries, existing databases depend on them.
const MIGRATIONS: &[(i64, &str)] = &[(
    1,
    "CREATE TABLE IF NOT EXISTS threads (
        id              TEXT    PRIMARY KEY,
        title           TEXT    NOT NULL DEFAULT '',
        created_at      INTEGER NOT NULL DEFAULT 0,
        last_message_at INTEGER
    );
    CREATE TABLE IF NOT EXISTS messages (
        id           TEXT    PRIMARY KEY,
        thread_id    TEXT    NOT NULL,
        role         TEXT    NOT NULL,
        content      TEXT    NOT NULL DEFAULT '',
        status       TEXT    NOT NULL,
        created_at   INTEGER NOT NULL DEFAULT 0,
        attachments  TEXT    NOT NULL DEFAULT '[]',
        model_params TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_messages_thread_id
        ON messages (thread_id, created_at);",
)];

const MESSAGE_COLUMNS: &str =
    "id, thread_id, role, content, status, created_at, attachments, model_params";

/// SQLite-backed store for threads and messages.
///
/// Uses WAL journal mode for concurrent reads during background saves.
/// `SqlitePool` is internally reference-counted and cheap to clone.
/// Messages are ordered by `created_at`, then by `rowid` (an upsert keeps the
/// original row, so re-saving a streaming message never reorders it).
#[derive(Clone)]
pub struct ThreadSqliteRepository {
    pool: SqlitePool,
    hub: LiveQueryHub,
}

impl ThreadSqliteRepository {
    /// Open (or create) the database at the platform-specific config path.
    pub async fn new() -> RepositoryResult<Self> {
        Self::open(&Self::default_path()?).await
    }

    pub async fn open(db_path: &Path) -> RepositoryResult<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::run_migrations(&pool).await?;

        info!(path = %db_path.display(), "Opened SQLite chat database");

        Ok(Self {
            pool,
            hub: LiveQueryHub::new(),
        })
    }

    pub fn default_path() -> RepositoryResult<PathBuf> {
        dirs::config_dir()
            .ok_or_else(|| RepositoryError::InitializationError {
                message: "Cannot find config directory".into(),
            })
            .map(|p| p.join("torgon").join("chat.db"))
    }

    /// Create the schema_version table if absent, then apply any pending migrations.
    async fn run_migrations(pool: &SqlitePool) -> RepositoryResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER NOT NULL
            )",
        )
        .execute(pool)
        .await?;

        sqlx::query("INSERT INTO schema_version (version) SELECT 0 WHERE NOT EXISTS (SELECT 1 FROM schema_version)")
            .execute(pool)
            .await?;

        let current: i64 = sqlx::query_scalar("SELECT version FROM schema_version")
            .fetch_one(pool)
            .await?;

        for (version, sql) in MIGRATIONS {
            if *version > current {
                info!(version, "Applying schema migration");
                // sqlx doesn't support multiple statements in a single query call.
                for statement in sql.split(';') {
                    let trimmed = statement.trim();
                    if !trimmed.is_empty() {
                        sqlx::query(trimmed).execute(pool).await?;
                    }
                }
                sqlx::query("UPDATE schema_version SET version = ?")
                    .bind(version)
                    .execute(pool)
                    .await?;
            }
        }

        Ok(())
    }

    async fn fetch_messages(pool: &SqlitePool, thread_id: &str) -> RepositoryResult<Vec<Message>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE thread_id = ?
             ORDER BY created_at ASC, rowid ASC"
        ))
        .bind(thread_id)
        .fetch_all(pool)
        .await?;

        rows.iter().map(message_from_row).collect()
    }

    async fn fetch_threads(pool: &SqlitePool) -> RepositoryResult<Vec<Thread>> {
        let rows = sqlx::query(
            "SELECT id, title, created_at, last_message_at
             FROM threads
             ORDER BY COALESCE(last_message_at, created_at) DESC",
        )
        .fetch_all(pool)
        .await?;

        rows.iter().map(thread_from_row).collect()
    }

    async fn notify_messages(&self, thread_id: &str) {
        let revision = self.hub.next_revision();
        if !self.hub.has_message_listeners(thread_id) {
            return;
        }
        match Self::fetch_messages(&self.pool, thread_id).await {
            Ok(snapshot) => self.hub.publish_messages(thread_id, revision, snapshot),
            Err(e) => warn!(thread_id = %thread_id, error = ?e, "Failed to refresh message live query"),
        }
    }

    async fn notify_threads(&self) {
        let revision = self.hub.next_revision();
        if !self.hub.has_thread_listeners() {
            return;
        }
        match Self::fetch_threads(&self.pool).await {
            Ok(snapshot) => self.hub.publish_threads(revision, snapshot),
            Err(e) => warn!(error = ?e, "Failed to refresh thread live query"),
        }
    }
}

fn micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

fn from_micros(value: i64) -> RepositoryResult<DateTime<Utc>> {
    DateTime::from_timestamp_micros(value).ok_or_else(|| RepositoryError::InvalidData {
        message: format!("timestamp out of range: {}", value),
    })
}

fn message_from_row(row: &SqliteRow) -> RepositoryResult<Message> {
    let role: String = row.try_get("role")?;
    let status: String = row.try_get("status")?;
    let attachments: String = row.try_get("attachments")?;
    let model_params: Option<String> = row.try_get("model_params")?;

    Ok(Message {
        id: row.try_get("id")?,
        thread_id: row.try_get("thread_id")?,
        role: role
            .parse()
            .map_err(|message| RepositoryError::InvalidData { message })?,
        content: row.try_get("content")?,
        status: status
            .parse()
            .map_err(|message| RepositoryError::InvalidData { message })?,
        created_at: from_micros(row.try_get("created_at")?)?,
        attachments: serde_json::from_str::<Vec<Attachment>>(&attachments)?,
        model_params: model_params
            .map(|json| serde_json::from_str::<ModelParams>(&json))
            .transpose()?,
    })
}

fn thread_from_row(row: &SqliteRow) -> RepositoryResult<Thread> {
    let last_message_at: Option<i64> = row.try_get("last_message_at")?;
    Ok(Thread {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        created_at: from_micros(row.try_get("created_at")?)?,
        last_message_at: last_message_at.map(from_micros).transpose()?,
    })
}

impl ThreadRepository for ThreadSqliteRepository {
    fn get_messages_by_thread_id(
        &self,
        thread_id: &str,
    ) -> BoxFuture<'static, RepositoryResult<Vec<Message>>> {
        let pool = self.pool.clone();
        let thread_id = thread_id.to_string();
        Box::pin(async move { Self::fetch_messages(&pool, &thread_id).await })
    }

    fn get_message(&self, id: &str) -> BoxFuture<'static, RepositoryResult<Option<Message>>> {
        let pool = self.pool.clone();
        let id = id.to_string();
        Box::pin(async move {
            let row = sqlx::query(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"))
                .bind(&id)
                .fetch_optional(&pool)
                .await?;
            row.as_ref().map(message_from_row).transpose()
        })
    }

    fn save_message(&self, message: Message) -> BoxFuture<'static, RepositoryResult<()>> {
        let repo = self.clone();
        Box::pin(async move {
            let attachments = serde_json::to_string(&message.attachments)?;
            let model_params = message
                .model_params
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;

            sqlx::query(
                "INSERT INTO messages
                    (id, thread_id, role, content, status, created_at, attachments, model_params)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                    thread_id    = excluded.thread_id,
                    role         = excluded.role,
                    content      = excluded.content,
                    status       = excluded.status,
                    created_at   = excluded.created_at,
                    attachments  = excluded.attachments,
                    model_params = excluded.model_params",
            )
            .bind(&message.id)
            .bind(&message.thread_id)
            .bind(message.role.as_str())
            .bind(&message.content)
            .bind(message.status.as_str())
            .bind(micros(message.created_at))
            .bind(&attachments)
            .bind(&model_params)
            .execute(&repo.pool)
            .await?;

            repo.notify_messages(&message.thread_id).await;
            Ok(())
        })
    }

    fn delete_thread_with_messages(
        &self,
        thread_id: &str,
    ) -> BoxFuture<'static, RepositoryResult<()>> {
        let repo = self.clone();
        let thread_id = thread_id.to_string();
        Box::pin(async move {
            let mut tx = repo.pool.begin().await?;
            sqlx::query("DELETE FROM messages WHERE thread_id = ?")
                .bind(&thread_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM threads WHERE id = ?")
                .bind(&thread_id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;

            repo.notify_messages(&thread_id).await;
            repo.notify_threads().await;
            Ok(())
        })
    }

    fn get_thread_by_id(&self, id: &str) -> BoxFuture<'static, RepositoryResult<Option<Thread>>> {
        let pool = self.pool.clone();
        let id = id.to_string();
        Box::pin(async move {
            let row = sqlx::query(
                "SELECT id, title, created_at, last_message_at FROM threads WHERE id = ?",
            )
            .bind(&id)
            .fetch_optional(&pool)
            .await?;
            row.as_ref().map(thread_from_row).transpose()
        })
    }

    fn list_threads(&self) -> BoxFuture<'static, RepositoryResult<Vec<Thread>>> {
        let pool = self.pool.clone();
        Box::pin(async move { Self::fetch_threads(&pool).await })
    }

    fn save_thread(&self, thread: Thread) -> BoxFuture<'static, RepositoryResult<()>> {
        let repo = self.clone();
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO threads (id, title, created_at, last_message_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                    title           = excluded.title,
                    last_message_at = excluded.last_message_at",
            )
            .bind(&thread.id)
            .bind(&thread.title)
            .bind(micros(thread.created_at))
            .bind(thread.last_message_at.map(micros))
            .execute(&repo.pool)
            .await?;

            repo.notify_threads().await;
            Ok(())
        })
    }

    /// Must be called from within a tokio runtime: the initial snapshot is
    /// loaded on a spawned task.
    fn subscribe_to_messages(&self, thread_id: &str, callback: MessagesCallback) -> Subscription {
        let revision = self.hub.current_revision();
        let subscription = self.hub.watch_messages(thread_id, callback);

        let id = subscription.id();
        let hub = self.hub.clone();
        let pool = self.pool.clone();
        let thread_id = thread_id.to_string();
        tokio::spawn(async move {
            match Self::fetch_messages(&pool, &thread_id).await {
                Ok(snapshot) => hub.deliver_initial_messages(id, revision, snapshot),
                Err(e) => warn!(thread_id = %thread_id, error = ?e, "Initial message query failed"),
            }
        });

        subscription
    }

    fn subscribe_to_threads(&self, callback: ThreadsCallback) -> Subscription {
        let revision = self.hub.current_revision();
        let subscription = self.hub.watch_threads(callback);

        let id = subscription.id();
        let hub = self.hub.clone();
        let pool = self.pool.clone();
        tokio::spawn(async move {
            match Self::fetch_threads(&pool).await {
                Ok(snapshot) => hub.deliver_initial_threads(id, revision, snapshot),
                Err(e) => warn!(error = ?e, "Initial thread query failed"),
            }
        });

        subscription
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torgon::models::{MessageRole, MessageStatus};

    async fn open_temp() -> (tempfile::TempDir, ThreadSqliteRepository) {
        let dir = tempfile::tempdir().unwrap();
        let repo = ThreadSqliteRepository::open(&dir.path().join("chat.db"))
            .await
            .unwrap();
        (dir, repo)
    }

    #[tokio::test]
    async fn test_message_roundtrip_with_attachments() {
        let (_dir, repo) = open_temp().await;

        let mut msg = Message::new("t1", MessageRole::User, "see file", MessageStatus::Done);
        msg.add_attachment(Attachment::new("a.bin", "application/octet-stream", vec![0, 159, 255]));
        msg.model_params = Some(ModelParams {
            temperature: 0.5,
            top_p: 1.0,
        });
        repo.save_message(msg.clone()).await.unwrap();

        let loaded = repo.get_message(&msg.id).await.unwrap().unwrap();
        assert_eq!(loaded.attachments, msg.attachments);
        assert_eq!(loaded.model_params, msg.model_params);
        assert_eq!(loaded.status, MessageStatus::Done);
        assert_eq!(loaded.created_at.timestamp_micros(), msg.created_at.timestamp_micros());
    }

    #[tokio::test]
    async fn test_upsert_keeps_position() {
        let (_dir, repo) = open_temp().await;

        let mut placeholder = Message::assistant_placeholder("t1");
        let mut user = Message::new("t1", MessageRole::User, "q", MessageStatus::Done);
        user.created_at = placeholder.created_at;

        repo.save_message(placeholder.clone()).await.unwrap();
        repo.save_message(user.clone()).await.unwrap();

        placeholder.append_chunk("answer").unwrap();
        repo.save_message(placeholder.clone()).await.unwrap();

        let loaded = repo.get_messages_by_thread_id("t1").await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, placeholder.id);
        assert_eq!(loaded[0].content, "answer");
        assert_eq!(loaded[1].id, user.id);
    }

    #[tokio::test]
    async fn test_thread_save_rename_and_delete() {
        let (_dir, repo) = open_temp().await;

        let mut thread = Thread::new("New Thread");
        repo.save_thread(thread.clone()).await.unwrap();
        thread.rename("Renamed").unwrap();
        thread.update_last_message_time();
        repo.save_thread(thread.clone()).await.unwrap();
        repo.save_message(Message::new(&thread.id, MessageRole::User, "x", MessageStatus::Done))
            .await
            .unwrap();

        let threads = repo.list_threads().await.unwrap();
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].title, "Renamed");
        assert!(threads[0].last_message_at.is_some());

        repo.delete_thread_with_messages(&thread.id).await.unwrap();
        assert!(repo.get_thread_by_id(&thread.id).await.unwrap().is_none());
        assert!(repo.get_messages_by_thread_id(&thread.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_live_query_sees_writes() {
        let (_dir, repo) = open_temp().await;

        let seen = std::sync::Arc::new(parking_lot::Mutex::new(Vec::<usize>::new()));
        let sink = seen.clone();
        let _subscription =
            repo.subscribe_to_messages("t1", Box::new(move |messages| sink.lock().push(messages.len())));

        repo.save_message(Message::new("t1", MessageRole::User, "a", MessageStatus::Done))
            .await
            .unwrap();

        assert_eq!(seen.lock().last().copied(), Some(1));
    }
}

pub mod schema;
pub mod types;

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::llm::Message;
use types::{DocumentRecord, Slug};

/// Ordered schema migrations. Applied versions are recorded in `migrations`.
const MIGRATIONS: &[(i64, &str)] = &[
    (
        1,
        "CREATE TABLE documents (
            id INTEGER PRIMARY KEY,
            slug TEXT NOT NULL UNIQUE,
            content TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );",
    ),
    (
        2,
        "CREATE TABLE conversations (
            id TEXT PRIMARY KEY,
            messages TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );",
    ),
];

fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// SQLite-backed store for the singleton documents and conversation history.
///
/// Every statement runs on the blocking pool behind one connection mutex, so
/// a read never observes a half-applied upsert.
pub struct DocumentStore {
    conn: Arc<Mutex<Connection>>,
}

impl DocumentStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {:?}", path))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("Failed to enable WAL")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        migrate(&conn).context("Failed to migrate schema")?;
        seed_defaults(&conn).context("Failed to seed default documents")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| anyhow!("document store lock poisoned"))?;
            f(&guard).map_err(anyhow::Error::from)
        })
        .await
        .context("document store task failed")?
    }

    /// Current content of `slug`, or an empty string if it was never written.
    pub async fn read(&self, slug: Slug) -> Result<String> {
        let content = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT content FROM documents WHERE slug = ?1",
                    params![slug.as_str()],
                    |row| row.get::<_, String>(0),
                )
                .optional()
            })
            .await?;
        Ok(content.unwrap_or_default())
    }

    pub async fn record(&self, slug: Slug) -> Result<Option<DocumentRecord>> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT content, created_at, updated_at FROM documents WHERE slug = ?1",
                params![slug.as_str()],
                |row| {
                    Ok(DocumentRecord {
                        slug,
                        content: row.get(0)?,
                        created_at: row.get(1)?,
                        updated_at: row.get(2)?,
                    })
                },
            )
            .optional()
        })
        .await
    }

    /// Insert or replace the content of `slug` in one statement.
    pub async fn upsert(&self, slug: Slug, content: &str) -> Result<()> {
        let content = content.to_string();
        let len = content.len();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO documents (slug, content, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)
                 ON CONFLICT(slug) DO UPDATE SET
                    content = excluded.content,
                    updated_at = excluded.updated_at",
                params![slug.as_str(), content, now_timestamp()],
            )
        })
        .await?;
        debug!(slug = %slug, size = len, "document upserted");
        Ok(())
    }

    /// Validate `content` against the schema of `slug`, then upsert it.
    /// A rejected document surfaces as a [`schema::SchemaError`] inside the
    /// returned error and leaves the stored content untouched.
    pub async fn import(&self, slug: Slug, content: &str) -> Result<()> {
        schema::validate_content(slug, content)?;
        self.upsert(slug, content).await?;
        info!(slug = %slug, size = content.len(), "document imported");
        Ok(())
    }

    /// Stored history for a conversation, empty if the id is new.
    pub async fn load_conversation(&self, id: &str) -> Result<Vec<Message>> {
        let id_owned = id.to_string();
        let raw = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT messages FROM conversations WHERE id = ?1",
                    params![id_owned],
                    |row| row.get::<_, String>(0),
                )
                .optional()
            })
            .await?;

        match raw {
            Some(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("Corrupt history for conversation {}", id)),
            None => Ok(Vec::new()),
        }
    }

    pub async fn save_conversation(&self, id: &str, messages: &[Message]) -> Result<()> {
        let raw = serde_json::to_string(messages).context("serialize conversation")?;
        let id_owned = id.to_string();
        let count = messages.len();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO conversations (id, messages, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)
                 ON CONFLICT(id) DO UPDATE SET
                    messages = excluded.messages,
                    updated_at = excluded.updated_at",
                params![id_owned, raw, now_timestamp()],
            )
        })
        .await?;
        debug!(conversation_id = %id, messages = count, "conversation saved");
        Ok(())
    }
}

fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS migrations (version INTEGER PRIMARY KEY)")?;
    let current: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM migrations",
        [],
        |row| row.get(0),
    )?;

    for (version, sql) in MIGRATIONS {
        if *version > current {
            conn.execute_batch(sql)?;
            conn.execute(
                "INSERT INTO migrations (version) VALUES (?1)",
                params![version],
            )?;
            info!(version, "Applied schema migration");
        }
    }
    Ok(())
}

fn seed_defaults(conn: &Connection) -> rusqlite::Result<()> {
    let now = now_timestamp();
    for slug in Slug::SEEDED {
        conn.execute(
            "INSERT INTO documents (slug, content, created_at, updated_at)
             VALUES (?1, '', ?2, ?2)
             ON CONFLICT(slug) DO NOTHING",
            params![slug.as_str(), now],
        )?;
    }
    Ok(())
}

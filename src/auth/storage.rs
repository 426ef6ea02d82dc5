// Durable session storage (SQLite or in-memory)

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::types::PersistedSession;

/// Key under which the session record lives in `auth_kv`
const SESSION_KEY: &str = "pickup:session";

/// Backend that keeps the session across restarts
pub trait TokenStorage: Send + Sync {
    /// Load the last saved session, if any
    fn load(&self) -> Result<Option<PersistedSession>>;

    /// Replace the saved session
    fn save(&self, session: &PersistedSession) -> Result<()>;
}

/// Session storage in a SQLite key/value table
pub struct SqliteTokenStorage {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteTokenStorage {
    /// Open (or create) the session database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create session directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database: {}", path.display()))?;
        Self::init(conn, Some(path.to_path_buf()))
    }

    /// Open a throwaway in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite")?;
        Self::init(conn, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS auth_kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            [],
        )
        .context("Failed to create auth_kv table")?;

        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Database location, `None` for in-memory storage
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn connection(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl TokenStorage for SqliteTokenStorage {
    fn load(&self) -> Result<Option<PersistedSession>> {
        let conn = self.connection();
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM auth_kv WHERE key = ?",
                [SESSION_KEY],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to load session from SQLite")?;

        value
            .map(|json| {
                serde_json::from_str(&json).context("Failed to parse session data from SQLite")
            })
            .transpose()
    }

    fn save(&self, session: &PersistedSession) -> Result<()> {
        let json = serde_json::to_string(session).context("Failed to serialize session")?;
        let conn = self.connection();
        conn.execute(
            "INSERT INTO auth_kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            [SESSION_KEY, json.as_str()],
        )
        .context("Failed to save session to SQLite")?;
        Ok(())
    }
}

/// Process-local session storage
#[derive(Default)]
pub struct MemoryTokenStorage {
    session: Mutex<Option<PersistedSession>>,
}

impl MemoryTokenStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with a previously saved session
    pub fn with_session(session: PersistedSession) -> Self {
        Self {
            session: Mutex::new(Some(session)),
        }
    }
}

impl TokenStorage for MemoryTokenStorage {
    fn load(&self) -> Result<Option<PersistedSession>> {
        let session = self.session.lock().unwrap_or_else(|p| p.into_inner());
        Ok(session.clone())
    }

    fn save(&self, session: &PersistedSession) -> Result<()> {
        let mut slot = self.session.lock().unwrap_or_else(|p| p.into_inner());
        *slot = Some(session.clone());
        Ok(())
    }
}

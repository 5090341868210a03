//! Session persistence trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{AccessToken, Session};

/// Trait for session persistence backends.
pub trait TokenStorage: Send + Sync {
  /// Load the persisted session, if any.
  fn load(&self) -> Result<Option<Session>>;

  /// Persist a session, replacing any previous one.
  fn save(&self, session: &Session) -> Result<()>;

  /// Forget the persisted session.
  fn clear(&self) -> Result<()>;
}

/// Storage implementation that doesn't persist anything.
/// The session lives only as long as the process.
pub struct NoopTokenStorage;

impl TokenStorage for NoopTokenStorage {
  fn load(&self) -> Result<Option<Session>> {
    Ok(None)
  }

  fn save(&self, _session: &Session) -> Result<()> {
    Ok(())
  }

  fn clear(&self) -> Result<()> {
    Ok(())
  }
}

/// SQLite-based session storage.
pub struct SqliteTokenStorage {
  conn: Mutex<Connection>,
}

impl SqliteTokenStorage {
  /// Open the session database at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open (or create) the session database at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create session directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open session database at {}: {}", path.display(), e))?;

    conn
      .execute_batch(SESSION_SCHEMA)
      .map_err(|e| eyre!("Failed to run session migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("flowto").join("session.db"))
  }
}

/// Single-row table: there is at most one session per client.
const SESSION_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS session (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    token TEXT NOT NULL,
    issued_at TEXT NOT NULL,
    expires_at TEXT
);
"#;

impl TokenStorage for SqliteTokenStorage {
  fn load(&self) -> Result<Option<Session>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row: Option<(String, String, Option<String>)> = conn
      .query_row(
        "SELECT token, issued_at, expires_at FROM session WHERE id = 1",
        [],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read session: {}", e))?;

    let Some((token, issued_at, expires_at)) = row else {
      return Ok(None);
    };

    Ok(Some(Session {
      token: AccessToken::new(token),
      issued_at: parse_datetime(&issued_at)?,
      expires_at: expires_at.as_deref().map(parse_datetime).transpose()?,
    }))
  }

  fn save(&self, session: &Session) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO session (id, token, issued_at, expires_at) VALUES (1, ?, ?, ?)",
        params![
          session.token.as_str(),
          session.issued_at.to_rfc3339(),
          session.expires_at.map(|t| t.to_rfc3339()),
        ],
      )
      .map_err(|e| eyre!("Failed to store session: {}", e))?;

    Ok(())
  }

  fn clear(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM session", [])
      .map_err(|e| eyre!("Failed to clear session: {}", e))?;

    Ok(())
  }
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use tether_core::ids::{AccountId, SessionId};

use crate::database::Database;
use crate::error::StoreError;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionRow {
    pub id: SessionId,
    pub account_id: AccountId,
    pub browser: String,
    pub os: Option<String>,
    pub arch: Option<String>,
    pub created_at: String,
    pub last_connected_at: Option<String>,
}

pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Make sure the owning account row exists. Account management lives in
    /// the HTTP layer; this only satisfies the foreign keys.
    pub fn ensure_account(&self, account_id: &AccountId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO accounts (id, created_at) VALUES (?1, ?2)",
                rusqlite::params![account_id.as_str(), Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    /// Resolve a session during the ID handshake: return the existing row
    /// when the client reconnects, create it on first contact, and refuse
    /// a session id that belongs to a different account.
    #[instrument(skip(self), fields(session_id = %id, account_id = %account_id))]
    pub fn bind(
        &self,
        id: &SessionId,
        account_id: &AccountId,
        browser: &str,
        os: Option<&str>,
        arch: Option<&str>,
    ) -> Result<SessionRow, StoreError> {
        if let Some(existing) = self.find(id)? {
            if existing.account_id != *account_id {
                return Err(StoreError::NotFound(format!("session {id}")));
            }
            return Ok(existing);
        }

        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, account_id, browser, os, arch, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![id.as_str(), account_id.as_str(), browser, os, arch, now],
            )?;
            Ok(SessionRow {
                id: id.clone(),
                account_id: account_id.clone(),
                browser: browser.to_string(),
                os: os.map(String::from),
                arch: arch.map(String::from),
                created_at: now,
                last_connected_at: None,
            })
        })
    }

    /// Get a session by id.
    pub fn get(&self, id: &SessionId) -> Result<SessionRow, StoreError> {
        self.find(id)?
            .ok_or_else(|| StoreError::NotFound(format!("session {id}")))
    }

    fn find(&self, id: &SessionId) -> Result<Option<SessionRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, account_id, browser, os, arch, created_at, last_connected_at
                 FROM sessions WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_session(row)?)),
                None => Ok(None),
            }
        })
    }

    /// Record a liveness timestamp. Called through the heartbeat throttle,
    /// never directly from the frame loop.
    pub fn touch_last_connected(&self, id: &SessionId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE sessions SET last_connected_at = ?1 WHERE id = ?2",
                rusqlite::params![Utc::now().to_rfc3339(), id.as_str()],
            )?;
            Ok(())
        })
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<SessionRow, StoreError> {
    Ok(SessionRow {
        id: SessionId::from_raw(row.get::<_, String>(0)?),
        account_id: AccountId::from_raw(row.get::<_, String>(1)?),
        browser: row.get(2)?,
        os: row.get(3)?,
        arch: row.get(4)?,
        created_at: row.get(5)?,
        last_connected_at: row.get(6)?,
    })
}

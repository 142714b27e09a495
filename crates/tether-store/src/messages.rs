//! Durable per-session backlog of undelivered sync frames.
//!
//! The queue coalesces instead of growing: an update or move aimed at an
//! entity whose creation is still queued folds into the queued creation's
//! payload (the target session has not materialized the entity, so there
//! is nothing to update independently), and a delete of a still-queued
//! creation cancels it outright. This bounds the backlog to roughly one
//! row per live entity per session.
//!
//! Status only ever moves pending → sent.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use tether_core::ids::{AccountId, EntityId, MessageId, SessionId};
use tether_core::protocol::Frame;

use crate::database::Database;
use crate::error::StoreError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingStatus {
    Pending,
    Sent,
}

impl std::fmt::Display for PendingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Sent => write!(f, "sent"),
        }
    }
}

impl std::str::FromStr for PendingStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            other => Err(format!("unknown message status: {other}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PendingMessageRow {
    pub id: MessageId,
    pub account_id: AccountId,
    pub session_id: SessionId,
    pub kind: String,
    pub payload: serde_json::Value,
    pub status: PendingStatus,
    pub created_at: String,
    pub sent_at: Option<String>,
}

/// What `enqueue` did with the frame.
#[derive(Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new backlog row was written.
    Inserted(MessageId),
    /// The frame was folded into an already-queued creation.
    Merged(MessageId),
    /// The frame cancelled a queued creation; nothing remains queued.
    Cancelled(MessageId),
}

pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Queue a frame for later delivery, applying the coalescing rules.
    #[instrument(skip(self, frame), fields(session_id = %session_id, kind = frame.kind()))]
    pub fn enqueue(
        &self,
        account_id: &AccountId,
        session_id: &SessionId,
        frame: &Frame,
    ) -> Result<EnqueueOutcome, StoreError> {
        self.db.with_conn(|conn| {
            match frame {
                Frame::BookmarksUpdate(p) => {
                    if let Some((row_id, mut payload)) =
                        find_pending_create(conn, account_id, session_id, &p.id)?
                    {
                        if let Some(title) = &p.changes.title {
                            payload["title"] = serde_json::Value::String(title.clone());
                        }
                        if let Some(url) = &p.changes.url {
                            payload["url"] = serde_json::Value::String(url.clone());
                        }
                        write_payload(conn, &row_id, &payload)?;
                        return Ok(EnqueueOutcome::Merged(row_id));
                    }
                }
                Frame::BookmarksMove(p) => {
                    if let Some((row_id, mut payload)) =
                        find_pending_create(conn, account_id, session_id, &p.id)?
                    {
                        if let Some(index) = p.destination.index {
                            payload["index"] = serde_json::Value::from(index);
                        }
                        if let Some(parent) = &p.destination.parent_id {
                            payload["parentId"] =
                                serde_json::Value::String(parent.as_str().to_string());
                        }
                        write_payload(conn, &row_id, &payload)?;
                        return Ok(EnqueueOutcome::Merged(row_id));
                    }
                }
                Frame::BookmarksRemove(p) => {
                    if let Some((row_id, _)) =
                        find_pending_create(conn, account_id, session_id, &p.id)?
                    {
                        // Created and removed before ever syncing: nothing to send
                        let _ = conn.execute(
                            "DELETE FROM pending_messages WHERE id = ?1",
                            [row_id.as_str()],
                        )?;
                        return Ok(EnqueueOutcome::Cancelled(row_id));
                    }
                }
                _ => {}
            }

            let id = MessageId::new();
            conn.execute(
                "INSERT INTO pending_messages (id, account_id, session_id, kind, payload,
                                               status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6)",
                rusqlite::params![
                    id.as_str(),
                    account_id.as_str(),
                    session_id.as_str(),
                    frame.kind(),
                    frame.payload_value().to_string(),
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(EnqueueOutcome::Inserted(id))
        })
    }

    /// All still-pending rows for a session, oldest first.
    pub fn pending_for_session(
        &self,
        account_id: &AccountId,
        session_id: &SessionId,
    ) -> Result<Vec<PendingMessageRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, account_id, session_id, kind, payload, status, created_at, sent_at
                 FROM pending_messages
                 WHERE account_id = ?1 AND session_id = ?2 AND status = 'pending'
                 ORDER BY created_at, id",
            )?;
            let mut rows = stmt.query(rusqlite::params![
                account_id.as_str(),
                session_id.as_str()
            ])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_message(row)?);
            }
            Ok(results)
        })
    }

    /// Transition a message pending → sent. The reverse never happens; a
    /// second call is a no-op and returns `false`.
    pub fn mark_sent(&self, id: &MessageId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE pending_messages SET status = 'sent', sent_at = ?1
                 WHERE id = ?2 AND status = 'pending'",
                rusqlite::params![Utc::now().to_rfc3339(), id.as_str()],
            )?;
            Ok(changed > 0)
        })
    }

    /// Rewrite queued payloads that name `old` as a parent or move
    /// destination to name `new` instead. Rows already sent are left
    /// untouched — the remote session resolved the parent in its own id
    /// space. Returns the ids of rewritten rows so they can be redelivered.
    #[instrument(skip(self), fields(session_id = %session_id, old = %old, new = %new))]
    pub fn rewrite_parent_targets(
        &self,
        account_id: &AccountId,
        session_id: &SessionId,
        old: &EntityId,
        new: &EntityId,
    ) -> Result<Vec<MessageId>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, kind, payload FROM pending_messages
                 WHERE account_id = ?1 AND session_id = ?2 AND status = 'pending'",
            )?;
            let rows: Vec<(String, String, String)> = stmt
                .query_map(
                    rusqlite::params![account_id.as_str(), session_id.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )?
                .collect::<Result<_, _>>()?;

            let mut rewritten = Vec::new();
            for (id, kind, raw) in rows {
                let mut payload: serde_json::Value = serde_json::from_str(&raw)?;
                let target = match kind.as_str() {
                    "BOOKMARKS_CREATE" => payload.get_mut("parentId"),
                    "BOOKMARKS_MOVE" => payload
                        .get_mut("destination")
                        .and_then(|d| d.get_mut("parentId")),
                    _ => None,
                };
                let Some(slot) = target else { continue };
                if slot.as_str() != Some(old.as_str()) {
                    continue;
                }
                *slot = serde_json::Value::String(new.as_str().to_string());
                conn.execute(
                    "UPDATE pending_messages SET payload = ?1 WHERE id = ?2",
                    rusqlite::params![payload.to_string(), id],
                )?;
                rewritten.push(MessageId::from_raw(id));
            }
            Ok(rewritten)
        })
    }

    /// Look up a message by id regardless of status.
    pub fn get(&self, id: &MessageId) -> Result<Option<PendingMessageRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, account_id, session_id, kind, payload, status, created_at, sent_at
                 FROM pending_messages WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_message(row)?)),
                None => Ok(None),
            }
        })
    }
}

/// Find the still-pending creation row for an entity, if any.
fn find_pending_create(
    conn: &rusqlite::Connection,
    account_id: &AccountId,
    session_id: &SessionId,
    entity_id: &EntityId,
) -> Result<Option<(MessageId, serde_json::Value)>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, payload FROM pending_messages
         WHERE account_id = ?1 AND session_id = ?2 AND status = 'pending'
           AND kind = 'BOOKMARKS_CREATE'",
    )?;
    let rows: Vec<(String, String)> = stmt
        .query_map(
            rusqlite::params![account_id.as_str(), session_id.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?
        .collect::<Result<_, _>>()?;

    for (id, raw) in rows {
        let payload: serde_json::Value = serde_json::from_str(&raw)?;
        if payload["id"].as_str() == Some(entity_id.as_str()) {
            return Ok(Some((MessageId::from_raw(id), payload)));
        }
    }
    Ok(None)
}

fn write_payload(
    conn: &rusqlite::Connection,
    id: &MessageId,
    payload: &serde_json::Value,
) -> Result<(), StoreError> {
    let _ = conn.execute(
        "UPDATE pending_messages SET payload = ?1 WHERE id = ?2",
        rusqlite::params![payload.to_string(), id.as_str()],
    )?;
    Ok(())
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<PendingMessageRow, StoreError> {
    let status_raw: String = row.get(5)?;
    let status = status_raw
        .parse()
        .map_err(|e: String| StoreError::Database(e))?;
    let payload_raw: String = row.get(4)?;
    Ok(PendingMessageRow {
        id: MessageId::from_raw(row.get::<_, String>(0)?),
        account_id: AccountId::from_raw(row.get::<_, String>(1)?),
        session_id: SessionId::from_raw(row.get::<_, String>(2)?),
        kind: row.get(3)?,
        payload: serde_json::from_str(&payload_raw)?,
        status,
        created_at: row.get(6)?,
        sent_at: row.get(7)?,
    })
}

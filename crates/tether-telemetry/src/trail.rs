//! Durable trail of sync-engine warnings and failures.
//!
//! When a session complains that a bookmark never arrived, the question is
//! always "what happened to *that* session" — so warn+ events are stored
//! with their sync identifiers (session, connection, frame kind) pulled
//! into real columns and queried per session, newest first. Whatever else
//! an event carried lands in a detail column as JSON. Everything below
//! WARN stays on stdout.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// One persisted trail entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrailRecord {
    pub id: i64,
    pub at: String,
    pub level: String,
    pub target: String,
    pub message: String,
    /// Session the event concerned, when the emit site knew it.
    pub session_id: Option<String>,
    pub connection_id: Option<String>,
    /// Frame kind being handled when things went wrong.
    pub kind: Option<String>,
    /// Remaining event fields, as JSON.
    pub detail: Option<String>,
}

/// SQLite-backed store for the trail.
pub struct SyncTrail {
    conn: Mutex<Connection>,
}

impl SyncTrail {
    pub fn open(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS sync_trail (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 at TEXT NOT NULL,
                 level TEXT NOT NULL,
                 target TEXT NOT NULL,
                 message TEXT NOT NULL,
                 session_id TEXT,
                 connection_id TEXT,
                 kind TEXT,
                 detail TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_trail_session ON sync_trail(session_id);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn record(&self, fields: &SyncFields, level: &str, target: &str) {
        let detail = if fields.rest.is_empty() {
            None
        } else {
            serde_json::to_string(&fields.rest).ok()
        };
        let conn = self.conn.lock();
        let _ = conn.execute(
            "INSERT INTO sync_trail (at, level, target, message, session_id, connection_id,
                                     kind, detail)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                Utc::now().to_rfc3339(),
                level,
                target,
                fields.message.as_deref().unwrap_or(""),
                fields.session_id,
                fields.connection_id,
                fields.kind,
                detail,
            ],
        );
    }

    /// Trail entries concerning one session, newest first.
    pub fn for_session(
        &self,
        session_id: &str,
        limit: u32,
    ) -> Result<Vec<TrailRecord>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, at, level, target, message, session_id, connection_id, kind, detail
             FROM sync_trail WHERE session_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![session_id, limit], map_record)?;
        rows.collect()
    }

    /// Most recent entries across every session.
    pub fn recent(&self, limit: u32) -> Result<Vec<TrailRecord>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, at, level, target, message, session_id, connection_id, kind, detail
             FROM sync_trail ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit], map_record)?;
        rows.collect()
    }

    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM sync_trail", [], |row| row.get(0))
    }
}

fn map_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<TrailRecord> {
    Ok(TrailRecord {
        id: row.get(0)?,
        at: row.get(1)?,
        level: row.get(2)?,
        target: row.get(3)?,
        message: row.get(4)?,
        session_id: row.get(5)?,
        connection_id: row.get(6)?,
        kind: row.get(7)?,
        detail: row.get(8)?,
    })
}

/// tracing layer feeding warn+ events into the trail.
pub struct TrailLayer {
    trail: Arc<SyncTrail>,
}

impl TrailLayer {
    pub fn new(trail: Arc<SyncTrail>) -> Self {
        Self { trail }
    }
}

/// Pulls the sync identifiers out of an event; the rest is kept as JSON.
#[derive(Default)]
struct SyncFields {
    message: Option<String>,
    session_id: Option<String>,
    connection_id: Option<String>,
    kind: Option<String>,
    rest: serde_json::Map<String, serde_json::Value>,
}

impl SyncFields {
    fn claim(&mut self, name: &str, value: String) {
        match name {
            "message" => self.message = Some(value),
            "session_id" => self.session_id = Some(value),
            "connection_id" => self.connection_id = Some(value),
            "kind" => self.kind = Some(value),
            _ => {
                let _ = self
                    .rest
                    .insert(name.to_string(), serde_json::Value::String(value));
            }
        }
    }
}

impl Visit for SyncFields {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.claim(field.name(), value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        // Display-formatted ids arrive here; strip the debug quotes
        let raw = format!("{value:?}");
        self.claim(field.name(), raw.trim_matches('"').to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        let _ = self
            .rest
            .insert(field.name().to_string(), serde_json::Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        let _ = self
            .rest
            .insert(field.name().to_string(), serde_json::Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        let _ = self
            .rest
            .insert(field.name().to_string(), serde_json::Value::Bool(value));
    }
}

impl<S> Layer<S> for TrailLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > tracing::Level::WARN {
            return;
        }

        let mut fields = SyncFields::default();
        event.record(&mut fields);
        self.trail.record(
            &fields,
            &level.to_string().to_uppercase(),
            event.metadata().target(),
        );
    }
}

//! Visit-history persistence.
//!
//! History rows are append-only per (account, session). Delivery is
//! at-least-once, so inserts are keyed on (account, session, item id,
//! visit time) and redelivered batches collapse into the existing rows.

use tracing::instrument;
use uuid::Uuid;

use tether_core::ids::{AccountId, SessionId};
use tether_core::protocol::VisitRecord;

use crate::database::Database;
use crate::error::StoreError;

pub struct HistoryRepo {
    db: Database,
}

impl HistoryRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Store a batch of visit records. Returns how many rows were actually
    /// inserted; duplicates of already-stored visits are ignored.
    #[instrument(skip(self, items), fields(session_id = %session_id, batch = items.len()))]
    pub fn insert_batch(
        &self,
        account_id: &AccountId,
        session_id: &SessionId,
        items: &[VisitRecord],
    ) -> Result<usize, StoreError> {
        self.db.with_tx(|tx| {
            let mut inserted = 0;
            for item in items {
                let record_id = format!("vis_{}", Uuid::now_v7());
                // Browsers report fractional epoch millis; clients floor them,
                // we floor again so the dedup key is stable.
                let visit_time = item.last_visit_time.map(|t| t as i64);
                inserted += tx.execute(
                    "INSERT INTO history_items (record_id, account_id, session_id, item_id,
                                                url, title, last_visit_time, visit_count,
                                                typed_count)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                     ON CONFLICT (account_id, session_id, item_id, last_visit_time) DO NOTHING",
                    rusqlite::params![
                        record_id,
                        account_id.as_str(),
                        session_id.as_str(),
                        item.id,
                        item.url,
                        item.title,
                        visit_time,
                        item.visit_count,
                        item.typed_count,
                    ],
                )?;
            }
            Ok(inserted)
        })
    }

    /// Delete every visit of the given urls for a session.
    pub fn delete_urls(
        &self,
        account_id: &AccountId,
        session_id: &SessionId,
        urls: &[String],
    ) -> Result<usize, StoreError> {
        self.db.with_tx(|tx| {
            let mut deleted = 0;
            for url in urls {
                deleted += tx.execute(
                    "DELETE FROM history_items
                     WHERE account_id = ?1 AND session_id = ?2 AND url = ?3",
                    rusqlite::params![account_id.as_str(), session_id.as_str(), url],
                )?;
            }
            Ok(deleted)
        })
    }

    /// Delete a session's entire history.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn delete_all(
        &self,
        account_id: &AccountId,
        session_id: &SessionId,
    ) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM history_items WHERE account_id = ?1 AND session_id = ?2",
                rusqlite::params![account_id.as_str(), session_id.as_str()],
            )?;
            Ok(deleted)
        })
    }

    /// Number of stored visits for a session.
    pub fn count(
        &self,
        account_id: &AccountId,
        session_id: &SessionId,
    ) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            let count = conn.query_row(
                "SELECT COUNT(*) FROM history_items WHERE account_id = ?1 AND session_id = ?2",
                rusqlite::params![account_id.as_str(), session_id.as_str()],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::SessionRepo;

    fn setup() -> (HistoryRepo, AccountId, SessionId) {
        let db = Database::in_memory().unwrap();
        let sessions = SessionRepo::new(db.clone());
        let account = AccountId::new();
        let session = SessionId::new();
        sessions.ensure_account(&account).unwrap();
        sessions
            .bind(&session, &account, "chrome", None, None)
            .unwrap();
        (HistoryRepo::new(db), account, session)
    }

    fn visit(id: &str, url: &str, time: f64) -> VisitRecord {
        VisitRecord {
            id: id.into(),
            url: Some(url.into()),
            title: Some("page".into()),
            last_visit_time: Some(time),
            visit_count: Some(1),
            typed_count: Some(0),
        }
    }

    #[test]
    fn insert_batch_stores_rows() {
        let (repo, account, session) = setup();
        let items = vec![
            visit("1", "https://a", 1_718_000_000_000.0),
            visit("2", "https://b", 1_718_000_000_500.0),
        ];
        assert_eq!(repo.insert_batch(&account, &session, &items).unwrap(), 2);
        assert_eq!(repo.count(&account, &session).unwrap(), 2);
    }

    #[test]
    fn redelivered_batch_is_idempotent() {
        let (repo, account, session) = setup();
        let items = vec![visit("1", "https://a", 1_718_000_000_000.0)];
        assert_eq!(repo.insert_batch(&account, &session, &items).unwrap(), 1);
        // At-least-once delivery replays the same batch
        assert_eq!(repo.insert_batch(&account, &session, &items).unwrap(), 0);
        assert_eq!(repo.count(&account, &session).unwrap(), 1);
    }

    #[test]
    fn new_visit_of_same_item_is_a_new_row() {
        let (repo, account, session) = setup();
        repo.insert_batch(&account, &session, &[visit("1", "https://a", 1_000.0)])
            .unwrap();
        let inserted = repo
            .insert_batch(&account, &session, &[visit("1", "https://a", 2_000.0)])
            .unwrap();
        assert_eq!(inserted, 1);
        assert_eq!(repo.count(&account, &session).unwrap(), 2);
    }

    #[test]
    fn fractional_visit_times_dedup_after_floor() {
        let (repo, account, session) = setup();
        repo.insert_batch(&account, &session, &[visit("1", "https://a", 1_000.4)])
            .unwrap();
        let inserted = repo
            .insert_batch(&account, &session, &[visit("1", "https://a", 1_000.9)])
            .unwrap();
        assert_eq!(inserted, 0);
    }

    #[test]
    fn delete_urls_scopes_to_session() {
        let (repo, account, session) = setup();
        repo.insert_batch(
            &account,
            &session,
            &[
                visit("1", "https://a", 1_000.0),
                visit("2", "https://b", 2_000.0),
            ],
        )
        .unwrap();

        let deleted = repo
            .delete_urls(&account, &session, &["https://a".into()])
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(repo.count(&account, &session).unwrap(), 1);
    }

    #[test]
    fn delete_all_clears_session_history() {
        let (repo, account, session) = setup();
        repo.insert_batch(
            &account,
            &session,
            &[
                visit("1", "https://a", 1_000.0),
                visit("2", "https://b", 2_000.0),
            ],
        )
        .unwrap();
        assert_eq!(repo.delete_all(&account, &session).unwrap(), 2);
        assert_eq!(repo.count(&account, &session).unwrap(), 0);
    }

    #[test]
    fn delete_unknown_url_affects_zero_rows() {
        let (repo, account, session) = setup();
        let deleted = repo
            .delete_urls(&account, &session, &["https://ghost".into()])
            .unwrap();
        assert_eq!(deleted, 0);
    }
}

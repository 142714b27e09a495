//! Open-tab snapshots.
//!
//! Each TABS_ADD frame is a full picture of a session's open tabs at one
//! instant; every row of the batch shares a snapshot timestamp so readers
//! can group by (snapshot, window).

use chrono::Utc;
use tracing::instrument;
use uuid::Uuid;

use tether_core::ids::{AccountId, SessionId};
use tether_core::protocol::TabRecord;

use crate::database::Database;
use crate::error::StoreError;

pub struct TabsRepo {
    db: Database,
}

impl TabsRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Store one snapshot batch. Returns the number of rows written.
    #[instrument(skip(self, tabs), fields(session_id = %session_id, batch = tabs.len()))]
    pub fn insert_snapshot(
        &self,
        account_id: &AccountId,
        session_id: &SessionId,
        tabs: &[TabRecord],
    ) -> Result<usize, StoreError> {
        let snapshot_at = Utc::now().to_rfc3339();
        self.db.with_tx(|tx| {
            let mut stored = 0;
            for tab in tabs {
                let record_id = format!("tab_{}", Uuid::now_v7());
                stored += tx.execute(
                    "INSERT INTO tabs (record_id, account_id, session_id, snapshot_at, tab_id,
                                       window_id, position, url, title, fav_icon_url, pinned,
                                       incognito, last_accessed, opener_tab_id)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                    rusqlite::params![
                        record_id,
                        account_id.as_str(),
                        session_id.as_str(),
                        snapshot_at,
                        tab.id,
                        tab.window_id,
                        tab.index,
                        tab.url,
                        tab.title,
                        tab.fav_icon_url,
                        tab.pinned,
                        tab.incognito,
                        tab.last_accessed.map(|t| t as i64),
                        tab.opener_tab_id,
                    ],
                )?;
            }
            Ok(stored)
        })
    }

    /// Distinct snapshot timestamps recorded for a session, newest first.
    pub fn snapshots(
        &self,
        account_id: &AccountId,
        session_id: &SessionId,
    ) -> Result<Vec<String>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT snapshot_at FROM tabs
                 WHERE account_id = ?1 AND session_id = ?2
                 ORDER BY snapshot_at DESC",
            )?;
            let rows = stmt.query_map(
                rusqlite::params![account_id.as_str(), session_id.as_str()],
                |row| row.get(0),
            )?;
            Ok(rows.collect::<Result<_, _>>()?)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::SessionRepo;

    fn setup() -> (TabsRepo, AccountId, SessionId) {
        let db = Database::in_memory().unwrap();
        let sessions = SessionRepo::new(db.clone());
        let account = AccountId::new();
        let session = SessionId::new();
        sessions.ensure_account(&account).unwrap();
        sessions
            .bind(&session, &account, "chrome", None, None)
            .unwrap();
        (TabsRepo::new(db), account, session)
    }

    fn tab(id: i64, window: i64, url: &str) -> TabRecord {
        TabRecord {
            fav_icon_url: None,
            id: Some(id),
            incognito: false,
            index: 0,
            last_accessed: Some(1_718_000_000_000.0),
            opener_tab_id: None,
            pinned: false,
            title: Some("tab".into()),
            url: Some(url.into()),
            window_id: window,
        }
    }

    #[test]
    fn snapshot_batch_shares_timestamp() {
        let (repo, account, session) = setup();
        let stored = repo
            .insert_snapshot(
                &account,
                &session,
                &[tab(1, 10, "https://a"), tab(2, 10, "https://b")],
            )
            .unwrap();
        assert_eq!(stored, 2);

        let snapshots = repo.snapshots(&account, &session).unwrap();
        assert_eq!(snapshots.len(), 1);
    }

    #[test]
    fn later_snapshot_is_distinct() {
        let (repo, account, session) = setup();
        repo.insert_snapshot(&account, &session, &[tab(1, 10, "https://a")])
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        repo.insert_snapshot(&account, &session, &[tab(1, 10, "https://a")])
            .unwrap();

        let snapshots = repo.snapshots(&account, &session).unwrap();
        assert_eq!(snapshots.len(), 2);
    }

    #[test]
    fn empty_snapshot_stores_nothing() {
        let (repo, account, session) = setup();
        assert_eq!(repo.insert_snapshot(&account, &session, &[]).unwrap(), 0);
        assert!(repo.snapshots(&account, &session).unwrap().is_empty());
    }
}

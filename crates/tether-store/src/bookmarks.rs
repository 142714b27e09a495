//! Bookmark tree persistence.
//!
//! Bookmarks are scoped by (account, session) and unique on the
//! client-assigned entity id within that scope. The parent link is a
//! composite self-reference on the same triple; deleting a folder clears
//! its children's parent links instead of cascading, and swapping a
//! temporary entity id for a final one bridges the children through NULL
//! inside a single transaction so the constraint never sees a dangling
//! parent.

use serde::{Deserialize, Serialize};
use tracing::instrument;
use uuid::Uuid;

use tether_core::ids::{AccountId, EntityId, SessionId};
use tether_core::protocol::{BookmarkChanges, BookmarkNode, MoveDestination};

use crate::database::Database;
use crate::error::StoreError;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BookmarkRow {
    pub record_id: String,
    pub account_id: AccountId,
    pub session_id: SessionId,
    pub entity_id: EntityId,
    pub parent_id: Option<EntityId>,
    pub position: Option<i64>,
    pub title: String,
    pub url: Option<String>,
    pub date_added: Option<i64>,
    pub date_group_modified: Option<i64>,
    pub date_last_used: Option<i64>,
}

/// Result of an entity-id swap: the surviving record and how many child
/// rows were re-pointed at the new id.
#[derive(Debug)]
pub struct IdSwap {
    pub record_id: String,
    pub children_repointed: usize,
}

pub struct BookmarkRepo {
    db: Database,
}

impl BookmarkRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Store a forest of bookmark nodes, parents before children.
    ///
    /// Traversal is iterative with an explicit stack — browser trees can be
    /// arbitrarily deep. Re-sent nodes are ignored via the uniqueness key.
    #[instrument(skip(self, roots), fields(account_id = %account_id, session_id = %session_id))]
    pub fn insert_tree(
        &self,
        account_id: &AccountId,
        session_id: &SessionId,
        roots: &[BookmarkNode],
    ) -> Result<usize, StoreError> {
        self.db.with_tx(|tx| {
            let mut stored = 0;
            let mut stack: Vec<&BookmarkNode> = roots.iter().rev().collect();
            while let Some(node) = stack.pop() {
                stored += insert_node(tx, account_id, session_id, node)?;
                stack.extend(node.children.iter().rev());
            }
            Ok(stored)
        })
    }

    /// Store a single node. Ignored if the entity id is already present.
    pub fn insert_node(
        &self,
        account_id: &AccountId,
        session_id: &SessionId,
        node: &BookmarkNode,
    ) -> Result<usize, StoreError> {
        self.db
            .with_conn(|conn| insert_node(conn, account_id, session_id, node))
    }

    /// Apply changed fields to a bookmark. Returns the number of affected
    /// rows (zero when the entity is unknown).
    pub fn update(
        &self,
        account_id: &AccountId,
        session_id: &SessionId,
        entity_id: &EntityId,
        changes: &BookmarkChanges,
    ) -> Result<usize, StoreError> {
        let mut sets: Vec<String> = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        if let Some(title) = &changes.title {
            sets.push(format!("title = ?{}", params.len() + 1));
            params.push(Box::new(title.clone()));
        }
        if let Some(url) = &changes.url {
            sets.push(format!("url = ?{}", params.len() + 1));
            params.push(Box::new(url.clone()));
        }
        if sets.is_empty() {
            return Ok(0);
        }

        let sql = format!(
            "UPDATE bookmarks SET {} WHERE account_id = ?{} AND session_id = ?{} AND entity_id = ?{}",
            sets.join(", "),
            params.len() + 1,
            params.len() + 2,
            params.len() + 3,
        );
        params.push(Box::new(account_id.as_str().to_string()));
        params.push(Box::new(session_id.as_str().to_string()));
        params.push(Box::new(entity_id.as_str().to_string()));

        self.db.with_conn(|conn| {
            let param_refs: Vec<&dyn rusqlite::types::ToSql> =
                params.iter().map(Box::as_ref).collect();
            let changed = conn.execute(&sql, param_refs.as_slice())?;
            Ok(changed)
        })
    }

    /// Move a bookmark to a new position and/or parent.
    pub fn relocate(
        &self,
        account_id: &AccountId,
        session_id: &SessionId,
        entity_id: &EntityId,
        destination: &MoveDestination,
    ) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let changed = match (&destination.parent_id, destination.index) {
                (Some(parent), Some(index)) => conn.execute(
                    "UPDATE bookmarks SET parent_id = ?1, position = ?2
                     WHERE account_id = ?3 AND session_id = ?4 AND entity_id = ?5",
                    rusqlite::params![
                        parent.as_str(),
                        index,
                        account_id.as_str(),
                        session_id.as_str(),
                        entity_id.as_str()
                    ],
                )?,
                (Some(parent), None) => conn.execute(
                    "UPDATE bookmarks SET parent_id = ?1
                     WHERE account_id = ?2 AND session_id = ?3 AND entity_id = ?4",
                    rusqlite::params![
                        parent.as_str(),
                        account_id.as_str(),
                        session_id.as_str(),
                        entity_id.as_str()
                    ],
                )?,
                (None, Some(index)) => conn.execute(
                    "UPDATE bookmarks SET position = ?1
                     WHERE account_id = ?2 AND session_id = ?3 AND entity_id = ?4",
                    rusqlite::params![
                        index,
                        account_id.as_str(),
                        session_id.as_str(),
                        entity_id.as_str()
                    ],
                )?,
                (None, None) => 0,
            };
            Ok(changed)
        })
    }

    /// Delete a bookmark. Children of a deleted folder survive with their
    /// parent link cleared. Unknown entity ids affect zero rows.
    #[instrument(skip(self), fields(session_id = %session_id, entity_id = %entity_id))]
    pub fn remove(
        &self,
        account_id: &AccountId,
        session_id: &SessionId,
        entity_id: &EntityId,
    ) -> Result<usize, StoreError> {
        self.db.with_tx(|tx| {
            tx.execute(
                "UPDATE bookmarks SET parent_id = NULL
                 WHERE account_id = ?1 AND session_id = ?2 AND parent_id = ?3",
                rusqlite::params![account_id.as_str(), session_id.as_str(), entity_id.as_str()],
            )?;
            let deleted = tx.execute(
                "DELETE FROM bookmarks
                 WHERE account_id = ?1 AND session_id = ?2 AND entity_id = ?3",
                rusqlite::params![account_id.as_str(), session_id.as_str(), entity_id.as_str()],
            )?;
            Ok(deleted)
        })
    }

    /// Swap a temporary entity id for the final id the owning session
    /// assigned, atomically.
    ///
    /// Children pointing at the old id are bridged through NULL while the
    /// entity's own id changes, then re-pointed at the new id before the
    /// transaction commits. On any failure the transaction rolls back and
    /// the previous id stays authoritative.
    #[instrument(skip(self), fields(session_id = %session_id, previous_id = %previous_id, new_id = %new_id))]
    pub fn reassign_id(
        &self,
        account_id: &AccountId,
        session_id: &SessionId,
        previous_id: &EntityId,
        new_id: &EntityId,
    ) -> Result<IdSwap, StoreError> {
        self.db.with_tx(|tx| {
            let record_id: String = {
                let mut stmt = tx.prepare(
                    "SELECT record_id FROM bookmarks
                     WHERE account_id = ?1 AND session_id = ?2 AND entity_id = ?3",
                )?;
                let mut rows = stmt.query(rusqlite::params![
                    account_id.as_str(),
                    session_id.as_str(),
                    previous_id.as_str()
                ])?;
                match rows.next()? {
                    Some(row) => row.get(0)?,
                    None => return Err(StoreError::NotFound(format!("bookmark {previous_id}"))),
                }
            };

            let bridged: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT record_id FROM bookmarks
                     WHERE account_id = ?1 AND session_id = ?2 AND parent_id = ?3",
                )?;
                let rows = stmt.query_map(
                    rusqlite::params![
                        account_id.as_str(),
                        session_id.as_str(),
                        previous_id.as_str()
                    ],
                    |row| row.get(0),
                )?;
                rows.collect::<Result<_, _>>()?
            };

            for child in &bridged {
                tx.execute(
                    "UPDATE bookmarks SET parent_id = NULL WHERE record_id = ?1",
                    [child],
                )?;
            }

            tx.execute(
                "UPDATE bookmarks SET entity_id = ?1 WHERE record_id = ?2",
                rusqlite::params![new_id.as_str(), record_id],
            )?;

            for child in &bridged {
                tx.execute(
                    "UPDATE bookmarks SET parent_id = ?1 WHERE record_id = ?2",
                    rusqlite::params![new_id.as_str(), child],
                )?;
            }

            Ok(IdSwap {
                record_id,
                children_repointed: bridged.len(),
            })
        })
    }

    /// Look up a bookmark by entity id.
    pub fn get(
        &self,
        account_id: &AccountId,
        session_id: &SessionId,
        entity_id: &EntityId,
    ) -> Result<Option<BookmarkRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT record_id, account_id, session_id, entity_id, parent_id, position,
                        title, url, date_added, date_group_modified, date_last_used
                 FROM bookmarks
                 WHERE account_id = ?1 AND session_id = ?2 AND entity_id = ?3",
            )?;
            let mut rows = stmt.query(rusqlite::params![
                account_id.as_str(),
                session_id.as_str(),
                entity_id.as_str()
            ])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_bookmark(row)?)),
                None => Ok(None),
            }
        })
    }

    /// List the direct children of an entity.
    pub fn children_of(
        &self,
        account_id: &AccountId,
        session_id: &SessionId,
        parent_id: &EntityId,
    ) -> Result<Vec<BookmarkRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT record_id, account_id, session_id, entity_id, parent_id, position,
                        title, url, date_added, date_group_modified, date_last_used
                 FROM bookmarks
                 WHERE account_id = ?1 AND session_id = ?2 AND parent_id = ?3
                 ORDER BY position",
            )?;
            let mut rows = stmt.query(rusqlite::params![
                account_id.as_str(),
                session_id.as_str(),
                parent_id.as_str()
            ])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_bookmark(row)?);
            }
            Ok(results)
        })
    }
}

fn insert_node(
    conn: &rusqlite::Connection,
    account_id: &AccountId,
    session_id: &SessionId,
    node: &BookmarkNode,
) -> Result<usize, StoreError> {
    let record_id = format!("bmk_{}", Uuid::now_v7());
    let changed = conn.execute(
        "INSERT INTO bookmarks (record_id, account_id, session_id, entity_id, parent_id,
                                position, title, url, date_added, date_group_modified,
                                date_last_used)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT (account_id, session_id, entity_id) DO NOTHING",
        rusqlite::params![
            record_id,
            account_id.as_str(),
            session_id.as_str(),
            node.id.as_str(),
            node.parent_id.as_ref().map(EntityId::as_str),
            node.index,
            node.title,
            node.url,
            node.date_added,
            node.date_group_modified,
            node.date_last_used,
        ],
    )?;
    Ok(changed)
}

fn row_to_bookmark(row: &rusqlite::Row<'_>) -> Result<BookmarkRow, StoreError> {
    Ok(BookmarkRow {
        record_id: row.get(0)?,
        account_id: AccountId::from_raw(row.get::<_, String>(1)?),
        session_id: SessionId::from_raw(row.get::<_, String>(2)?),
        entity_id: EntityId::from_raw(row.get::<_, String>(3)?),
        parent_id: row.get::<_, Option<String>>(4)?.map(EntityId::from_raw),
        position: row.get(5)?,
        title: row.get(6)?,
        url: row.get(7)?,
        date_added: row.get(8)?,
        date_group_modified: row.get(9)?,
        date_last_used: row.get(10)?,
    })
}

//! Dependency-safe backlog replay order.
//!
//! A queued creation or move must not reach a session before the creation
//! of the parent it names: the session would have nowhere to hang the
//! node. Rows held back stay pending and become eligible on a later flush
//! trigger, normally after the parent's creation flushes and its id
//! assignment rewrites the child's payload.

use std::collections::HashSet;

use tether_store::messages::PendingMessageRow;

/// Select the rows of a session's backlog that may replay now.
///
/// A creation whose declared parent is itself a still-queued creation is
/// excluded, as is a move whose destination parent is. No other ordering
/// is enforced — siblings, deletes and unrelated entities replay in any
/// order.
pub fn filter_deliverable(rows: &[PendingMessageRow]) -> Vec<&PendingMessageRow> {
    let queued_creates: HashSet<&str> = rows
        .iter()
        .filter(|row| row.kind == "BOOKMARKS_CREATE")
        .filter_map(|row| row.payload.get("id").and_then(|v| v.as_str()))
        .collect();

    rows.iter()
        .filter(|row| match row.kind.as_str() {
            "BOOKMARKS_CREATE" => row
                .payload
                .get("parentId")
                .and_then(|v| v.as_str())
                .is_none_or(|parent| !queued_creates.contains(parent)),
            "BOOKMARKS_MOVE" => row
                .payload
                .get("destination")
                .and_then(|d| d.get("parentId"))
                .and_then(|v| v.as_str())
                .is_none_or(|parent| !queued_creates.contains(parent)),
            _ => true,
        })
        .collect()
}

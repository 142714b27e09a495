//! Temporary → final id reconciliation.
//!
//! When a session reports that it materialized a server-proposed entity
//! (BOOKMARKS_SETID), three things happen in order: the stored tree swaps
//! the id atomically, queued payloads still naming the old id as a parent
//! or move destination are rewritten, and the rewritten rows — now past
//! the dependency filter — are pushed back through the dispatcher.

use std::sync::Arc;

use tracing::{info, instrument};

use tether_core::ids::{AccountId, EntityId, SessionId};
use tether_store::bookmarks::BookmarkRepo;
use tether_store::error::StoreError;
use tether_store::messages::MessageRepo;

use crate::dispatcher::{Dispatcher, FlushSummary};

#[derive(Debug)]
pub struct ReconcileSummary {
    /// Child rows re-pointed at the new id inside the swap transaction.
    pub children_repointed: usize,
    /// Queued payloads rewritten to name the new id.
    pub messages_rewritten: usize,
    /// Outcome of the follow-up backlog flush.
    pub flush: FlushSummary,
}

pub struct Reconciler {
    bookmarks: BookmarkRepo,
    messages: MessageRepo,
    dispatcher: Arc<Dispatcher>,
}

impl Reconciler {
    pub fn new(bookmarks: BookmarkRepo, messages: MessageRepo, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            bookmarks,
            messages,
            dispatcher,
        }
    }

    /// Apply a session-reported id assignment.
    ///
    /// The store swap commits (or rolls back) before any queued payload is
    /// touched, so a failure here leaves the previous id authoritative and
    /// the backlog unmodified. Rows already sent are never rewritten — the
    /// remote side resolved the parent in its own id space.
    #[instrument(skip(self), fields(session_id = %session_id, previous_id = %previous_id, new_id = %new_id))]
    pub fn apply(
        &self,
        account_id: &AccountId,
        session_id: &SessionId,
        previous_id: &EntityId,
        new_id: &EntityId,
    ) -> Result<ReconcileSummary, StoreError> {
        let swap = self
            .bookmarks
            .reassign_id(account_id, session_id, previous_id, new_id)?;

        let rewritten =
            self.messages
                .rewrite_parent_targets(account_id, session_id, previous_id, new_id)?;

        let flush = self.dispatcher.flush(account_id, session_id)?;

        info!(
            session_id = %session_id,
            children = swap.children_repointed,
            rewritten = rewritten.len(),
            redelivered = flush.delivered,
            "id reconciled"
        );

        Ok(ReconcileSummary {
            children_repointed: swap.children_repointed,
            messages_rewritten: rewritten.len(),
            flush,
        })
    }
}

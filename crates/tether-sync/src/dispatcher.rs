//! Message dispatcher — the facade everything else pushes frames through.
//!
//! A fresh frame goes to the live connection when one exists and the send
//! sticks; otherwise it lands in the durable queue (where it may coalesce
//! with earlier rows). A backlog retry only ever flips its existing row to
//! sent — it never creates a second row. Delivery failure is never
//! surfaced to the caller; the only error out of here is the store itself
//! failing.
//!
//! Delivery is at-least-once: a send that reaches the socket but is lost
//! downstream can be replayed later, which entity handlers tolerate by
//! being idempotent on entity ids.

use std::sync::Arc;

use tracing::{debug, info, instrument};

use tether_core::ids::{AccountId, MessageId, SessionId};
use tether_core::protocol::Frame;
use tether_store::error::StoreError;
use tether_store::messages::{EnqueueOutcome, MessageRepo, PendingMessageRow};

use crate::registry::ConnectionRegistry;
use crate::replay;

/// Where a fresh frame ended up.
#[derive(Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Reached the live connection's outbound queue.
    Sent,
    /// Persisted as a new backlog row.
    Queued(MessageId),
    /// Folded into an existing backlog row.
    Coalesced(MessageId),
    /// Cancelled a queued creation; nothing remains to deliver.
    Cancelled(MessageId),
}

/// Result of replaying a session's backlog.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct FlushSummary {
    /// Rows delivered and marked sent.
    pub delivered: usize,
    /// Rows held back by the dependency filter.
    pub held: usize,
    /// Eligible rows whose send failed; they stay pending.
    pub failed: usize,
}

pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
    messages: MessageRepo,
}

impl Dispatcher {
    pub fn new(registry: Arc<ConnectionRegistry>, messages: MessageRepo) -> Self {
        Self { registry, messages }
    }

    /// Push a fresh frame toward a session. Never drops it: a missing or
    /// failing live connection degrades to the durable queue.
    #[instrument(skip(self, frame), fields(session_id = %session_id, kind = frame.kind()))]
    pub fn deliver(
        &self,
        account_id: &AccountId,
        session_id: &SessionId,
        frame: &Frame,
    ) -> Result<DeliveryOutcome, StoreError> {
        if let Some(handle) = self.registry.lookup(session_id) {
            let text = serde_json::to_string(frame)?;
            if handle.send(text) {
                return Ok(DeliveryOutcome::Sent);
            }
            debug!(session_id = %session_id, "live send failed, queueing");
        }

        match self.messages.enqueue(account_id, session_id, frame)? {
            EnqueueOutcome::Inserted(id) => Ok(DeliveryOutcome::Queued(id)),
            EnqueueOutcome::Merged(id) => Ok(DeliveryOutcome::Coalesced(id)),
            EnqueueOutcome::Cancelled(id) => Ok(DeliveryOutcome::Cancelled(id)),
        }
    }

    /// Retry one persisted backlog row. On success the row flips to sent;
    /// on failure it stays pending for the next flush trigger. No new row
    /// either way.
    pub fn redeliver(&self, row: &PendingMessageRow) -> Result<bool, StoreError> {
        let Some(handle) = self.registry.lookup(&row.session_id) else {
            return Ok(false);
        };
        if handle.send(Frame::wire_text(&row.kind, &row.payload)) {
            let _ = self.messages.mark_sent(&row.id)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Replay a session's backlog: everything still pending, minus the
    /// rows the dependency filter holds back.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn flush(
        &self,
        account_id: &AccountId,
        session_id: &SessionId,
    ) -> Result<FlushSummary, StoreError> {
        let rows = self.messages.pending_for_session(account_id, session_id)?;
        let eligible = replay::filter_deliverable(&rows);

        let mut summary = FlushSummary {
            held: rows.len() - eligible.len(),
            ..Default::default()
        };
        for row in eligible {
            if self.redeliver(row)? {
                summary.delivered += 1;
            } else {
                summary.failed += 1;
            }
        }

        if summary.delivered + summary.held + summary.failed > 0 {
            info!(
                session_id = %session_id,
                delivered = summary.delivered,
                held = summary.held,
                failed = summary.failed,
                "backlog flush"
            );
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::ids::{ConnectionId, EntityId};
    use tether_core::protocol::{BookmarkNode, BookmarksRemovePayload};
    use tether_store::sessions::SessionRepo;
    use tether_store::Database;
    use tokio::sync::mpsc;

    use crate::registry::{SessionHandle, WsOutbound};

    struct Fixture {
        dispatcher: Dispatcher,
        registry: Arc<ConnectionRegistry>,
        messages: MessageRepo,
        account: AccountId,
        session: SessionId,
    }

    fn setup() -> Fixture {
        let db = Database::in_memory().unwrap();
        let sessions = SessionRepo::new(db.clone());
        let account = AccountId::new();
        let session = SessionId::new();
        sessions.ensure_account(&account).unwrap();
        sessions
            .bind(&session, &account, "chrome", None, None)
            .unwrap();

        let registry = Arc::new(ConnectionRegistry::new());
        let dispatcher = Dispatcher::new(Arc::clone(&registry), MessageRepo::new(db.clone()));
        Fixture {
            dispatcher,
            registry,
            messages: MessageRepo::new(db),
            account,
            session,
        }
    }

    fn connect(fx: &Fixture, queue: usize) -> mpsc::Receiver<WsOutbound> {
        let (tx, rx) = mpsc::channel(queue);
        fx.registry.register(
            fx.session.clone(),
            SessionHandle::new(ConnectionId::new(), tx),
        );
        rx
    }

    fn create_frame(id: &str, parent: Option<&str>) -> Frame {
        Frame::BookmarksCreate(BookmarkNode {
            id: EntityId::from_raw(id),
            parent_id: parent.map(EntityId::from_raw),
            index: Some(0),
            title: "bookmark".into(),
            url: None,
            date_added: None,
            date_group_modified: None,
            date_last_used: None,
            children: Vec::new(),
        })
    }

    fn remove_frame(id: &str) -> Frame {
        Frame::BookmarksRemove(BookmarksRemovePayload {
            id: EntityId::from_raw(id),
        })
    }

    #[test]
    fn live_delivery_creates_no_rows() {
        let fx = setup();
        let mut rx = connect(&fx, 8);

        let outcome = fx
            .dispatcher
            .deliver(&fx.account, &fx.session, &create_frame("42", None))
            .unwrap();
        assert_eq!(outcome, DeliveryOutcome::Sent);

        let WsOutbound::Text(text) = rx.try_recv().unwrap() else {
            panic!("expected text");
        };
        assert!(text.contains("BOOKMARKS_CREATE"));

        assert!(fx
            .messages
            .pending_for_session(&fx.account, &fx.session)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn offline_delivery_persists_exactly_one_row() {
        let fx = setup();
        let outcome = fx
            .dispatcher
            .deliver(&fx.account, &fx.session, &create_frame("42", None))
            .unwrap();
        assert!(matches!(outcome, DeliveryOutcome::Queued(_)));

        let pending = fx
            .messages
            .pending_for_session(&fx.account, &fx.session)
            .unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn failed_live_send_degrades_to_queue() {
        let fx = setup();
        let _rx = connect(&fx, 1);

        // Fill the single-slot queue, then deliver again
        assert_eq!(
            fx.dispatcher
                .deliver(&fx.account, &fx.session, &create_frame("1", None))
                .unwrap(),
            DeliveryOutcome::Sent
        );
        let outcome = fx
            .dispatcher
            .deliver(&fx.account, &fx.session, &create_frame("2", None))
            .unwrap();
        assert!(matches!(outcome, DeliveryOutcome::Queued(_)));
    }

    #[test]
    fn offline_remove_cancels_queued_create() {
        let fx = setup();
        fx.dispatcher
            .deliver(&fx.account, &fx.session, &create_frame("42", None))
            .unwrap();
        let outcome = fx
            .dispatcher
            .deliver(&fx.account, &fx.session, &remove_frame("42"))
            .unwrap();
        assert!(matches!(outcome, DeliveryOutcome::Cancelled(_)));

        assert!(fx
            .messages
            .pending_for_session(&fx.account, &fx.session)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn flush_delivers_backlog_and_marks_sent() {
        let fx = setup();
        fx.dispatcher
            .deliver(&fx.account, &fx.session, &create_frame("1", None))
            .unwrap();
        fx.dispatcher
            .deliver(&fx.account, &fx.session, &remove_frame("9"))
            .unwrap();

        let mut rx = connect(&fx, 8);
        let summary = fx.dispatcher.flush(&fx.account, &fx.session).unwrap();
        assert_eq!(summary.delivered, 2);
        assert_eq!(summary.held, 0);
        assert_eq!(summary.failed, 0);

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert!(fx
            .messages
            .pending_for_session(&fx.account, &fx.session)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn flush_holds_child_create_behind_parent() {
        let fx = setup();
        fx.dispatcher
            .deliver(&fx.account, &fx.session, &create_frame("tmp_f", None))
            .unwrap();
        fx.dispatcher
            .deliver(&fx.account, &fx.session, &create_frame("tmp_b", Some("tmp_f")))
            .unwrap();

        let mut rx = connect(&fx, 8);
        let summary = fx.dispatcher.flush(&fx.account, &fx.session).unwrap();
        assert_eq!(summary.delivered, 1);
        assert_eq!(summary.held, 1);

        let WsOutbound::Text(text) = rx.try_recv().unwrap() else {
            panic!("expected text");
        };
        assert!(text.contains("tmp_f"));
        assert!(rx.try_recv().is_err());

        // Held row is still pending for the next trigger
        let pending = fx
            .messages
            .pending_for_session(&fx.account, &fx.session)
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload["id"], "tmp_b");
    }

    #[test]
    fn flush_with_no_connection_leaves_rows_pending() {
        let fx = setup();
        fx.dispatcher
            .deliver(&fx.account, &fx.session, &create_frame("1", None))
            .unwrap();

        let summary = fx.dispatcher.flush(&fx.account, &fx.session).unwrap();
        assert_eq!(summary.delivered, 0);
        assert_eq!(summary.failed, 1);

        let pending = fx
            .messages
            .pending_for_session(&fx.account, &fx.session)
            .unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn redeliver_failure_keeps_row_pending() {
        let fx = setup();
        fx.dispatcher
            .deliver(&fx.account, &fx.session, &create_frame("1", None))
            .unwrap();
        let _rx = connect(&fx, 1);

        // Occupy the only queue slot so the retry send fails
        let handle = fx.registry.lookup(&fx.session).unwrap();
        assert!(handle.send("filler".into()));

        let summary = fx.dispatcher.flush(&fx.account, &fx.session).unwrap();
        assert_eq!(summary.delivered, 0);
        assert_eq!(summary.failed, 1);
        assert_eq!(
            fx.messages
                .pending_for_session(&fx.account, &fx.session)
                .unwrap()
                .len(),
            1
        );
    }
}

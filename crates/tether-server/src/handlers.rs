//! Frame dispatch: the AUTH → ID handshake state machine and the entity
//! handlers behind it.
//!
//! Error surface follows three rules: an unparseable frame is logged and
//! dropped with the connection left open; a frame that requires an
//! authenticated, bound session gets an explicit unauthorized signal when
//! there is none; a handler failure on a live connection is logged and
//! answered with a generic error signal.

use std::sync::Arc;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tether_core::ids::{AccountId, SessionId};
use tether_core::protocol::{Frame, IdPayload};
use tether_store::bookmarks::BookmarkRepo;
use tether_store::error::StoreError;
use tether_store::history::HistoryRepo;
use tether_store::messages::MessageRepo;
use tether_store::sessions::SessionRepo;
use tether_store::tabs::TabsRepo;
use tether_store::Database;
use tether_sync::{ConnectionRegistry, Dispatcher, Reconciler};

use crate::auth::TokenKeeper;
use crate::connection::ConnectionState;

/// Everything the frame handlers need, shared across connections.
pub struct EngineState {
    pub registry: Arc<ConnectionRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub reconciler: Reconciler,
    pub sessions: SessionRepo,
    pub bookmarks: BookmarkRepo,
    pub history: HistoryRepo,
    pub tabs: TabsRepo,
    pub tokens: TokenKeeper,
}

impl EngineState {
    pub fn new(db: Database, tokens: TokenKeeper) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            MessageRepo::new(db.clone()),
        ));
        let reconciler = Reconciler::new(
            BookmarkRepo::new(db.clone()),
            MessageRepo::new(db.clone()),
            Arc::clone(&dispatcher),
        );
        Self {
            registry,
            dispatcher,
            reconciler,
            sessions: SessionRepo::new(db.clone()),
            bookmarks: BookmarkRepo::new(db.clone()),
            history: HistoryRepo::new(db.clone()),
            tabs: TabsRepo::new(db),
            tokens,
        }
    }
}

/// Handle one inbound frame. Runs to completion before the caller reads
/// the next frame, preserving per-connection ordering.
pub fn handle_frame(conn: &mut ConnectionState, raw: &str, engine: &EngineState) {
    let frame: Frame = match serde_json::from_str(raw) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(connection_id = %conn.id, error = %e, "dropping unparseable frame");
            return;
        }
    };
    let kind = frame.kind();

    match frame {
        Frame::Auth(payload) => {
            match engine.tokens.verify(&payload.token) {
                Some(account) => {
                    conn.authenticate(account);
                    let _ = conn.send_frame(&Frame::AuthSuccess);
                }
                None => warn!(connection_id = %conn.id, "auth token rejected"),
            }
        }

        Frame::Id(payload) => on_id(conn, engine, payload),

        Frame::Ping(_) => {}

        Frame::BookmarksAdd(payload) => with_session(conn, kind, |account, session| {
            let stored = engine
                .bookmarks
                .insert_tree(account, session, &payload.bookmarks)?;
            debug!(session_id = %session, stored, "bookmark tree stored");
            Ok(())
        }),

        Frame::BookmarksUpdate(payload) => with_session(conn, kind, |account, session| {
            let _ = engine
                .bookmarks
                .update(account, session, &payload.id, &payload.changes)?;
            Ok(())
        }),

        Frame::BookmarksMove(payload) => with_session(conn, kind, |account, session| {
            let _ = engine
                .bookmarks
                .relocate(account, session, &payload.id, &payload.destination)?;
            Ok(())
        }),

        Frame::BookmarksRemove(payload) => with_session(conn, kind, |account, session| {
            // Unknown ids fall through as zero affected rows, not an error
            let _ = engine.bookmarks.remove(account, session, &payload.id)?;
            Ok(())
        }),

        Frame::BookmarksSetId(payload) => with_session(conn, kind, |account, session| {
            let _ = engine.reconciler.apply(
                account,
                session,
                &payload.previous_id,
                &payload.new_id,
            )?;
            Ok(())
        }),

        Frame::HistoryAdd(items) => with_session(conn, kind, |account, session| {
            let _ = engine.history.insert_batch(account, session, &items)?;
            Ok(())
        }),

        Frame::HistoryDelete(payload) => with_session(conn, kind, |account, session| {
            if payload.all_history {
                let _ = engine.history.delete_all(account, session)?;
            } else if let Some(urls) = &payload.urls {
                let _ = engine.history.delete_urls(account, session, urls)?;
            }
            Ok(())
        }),

        Frame::TabsAdd(tabs) => with_session(conn, kind, |account, session| {
            let _ = engine.tabs.insert_snapshot(account, session, &tabs)?;
            Ok(())
        }),

        // Server-to-client kinds arriving inbound
        _ => debug!(connection_id = %conn.id, kind, "unexpected frame"),
    }

    touch_liveness(conn, engine);
}

/// ID handshake: resolve or create the session, register the live
/// connection, replay the backlog, then invite initial uploads.
fn on_id(conn: &mut ConnectionState, engine: &EngineState, payload: IdPayload) {
    let Some(account) = conn.account().cloned() else {
        let _ = conn.send_frame(&Frame::error("Unauthorized"));
        return;
    };
    if Uuid::parse_str(&payload.id).is_err() {
        warn!(connection_id = %conn.id, "session id is not a uuid, ignoring");
        return;
    }

    let session_id = SessionId::from_raw(payload.id);
    let bound = engine
        .sessions
        .ensure_account(&account)
        .and_then(|()| {
            engine.sessions.bind(
                &session_id,
                &account,
                &payload.browser,
                payload.os.as_deref(),
                payload.arch.as_deref(),
            )
        });
    let session = match bound {
        Ok(row) => row,
        Err(e) => {
            error!(connection_id = %conn.id, error = %e, "session bind failed");
            let _ = conn.send_frame(&Frame::Error(Default::default()));
            return;
        }
    };

    conn.bind(session.id.clone());
    engine
        .registry
        .register(session.id.clone(), conn.session_handle());
    let _ = conn.send_frame(&Frame::IdSuccess);
    info!(connection_id = %conn.id, session_id = %session.id, "session bound");

    // Replay whatever queued while this session was away. A failure here
    // is not fatal to the connection; the rows stay pending.
    if let Err(e) = engine.dispatcher.flush(&account, &session.id) {
        error!(session_id = %session.id, error = %e, "backlog flush failed");
    }

    let _ = conn.send_frame(&Frame::HistoryInit);
}

/// Run an entity handler for a bound connection, or answer unauthorized.
fn with_session<F>(conn: &ConnectionState, kind: &'static str, op: F)
where
    F: FnOnce(&AccountId, &SessionId) -> Result<(), StoreError>,
{
    let Some((account, session)) = conn.bound() else {
        let _ = conn.send_frame(&Frame::error("Unauthorized"));
        return;
    };
    if let Err(e) = op(account, session) {
        error!(connection_id = %conn.id, session_id = %session, kind, error = %e, "handler failed");
        let _ = conn.send_frame(&Frame::Error(Default::default()));
    }
}

/// Any frame proves liveness; the per-connection throttle decides whether
/// this one also produces a durable write.
fn touch_liveness(conn: &ConnectionState, engine: &EngineState) {
    let Some((_, session)) = conn.bound() else {
        return;
    };
    if conn.liveness_write_due() {
        if let Err(e) = engine.sessions.touch_last_connected(session) {
            warn!(session_id = %session, error = %e, "liveness write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tether_core::ids::EntityId;
    use tether_core::protocol::{BookmarkNode, BookmarksSetIdPayload};
    use tether_sync::registry::WsOutbound;
    use tokio::sync::mpsc;

    struct Fixture {
        engine: EngineState,
        account: AccountId,
        token: String,
    }

    fn setup() -> Fixture {
        let db = Database::in_memory().unwrap();
        let tokens = TokenKeeper::new("test-secret");
        let account = AccountId::new();
        let token = tokens.mint(&account).unwrap();
        Fixture {
            engine: EngineState::new(db, tokens),
            account,
            token,
        }
    }

    fn make_conn() -> (ConnectionState, mpsc::Receiver<WsOutbound>) {
        let (tx, rx) = mpsc::channel(32);
        (ConnectionState::new(tx, Duration::from_secs(30)), rx)
    }

    fn recv_frame(rx: &mut mpsc::Receiver<WsOutbound>) -> Frame {
        match rx.try_recv().expect("expected an outbound frame") {
            WsOutbound::Text(text) => serde_json::from_str(&text).unwrap(),
            WsOutbound::Close => panic!("unexpected close"),
        }
    }

    fn send(conn: &mut ConnectionState, engine: &EngineState, frame: &Frame) {
        let raw = serde_json::to_string(frame).unwrap();
        handle_frame(conn, &raw, engine);
    }

    fn session_uuid() -> String {
        Uuid::now_v7().to_string()
    }

    fn handshake(
        fx: &Fixture,
        conn: &mut ConnectionState,
        rx: &mut mpsc::Receiver<WsOutbound>,
        session_uuid: &str,
    ) {
        send(
            conn,
            &fx.engine,
            &Frame::Auth(tether_core::protocol::AuthPayload {
                token: fx.token.clone(),
            }),
        );
        assert_eq!(recv_frame(rx), Frame::AuthSuccess);

        send(
            conn,
            &fx.engine,
            &Frame::Id(IdPayload {
                id: session_uuid.into(),
                browser: "chrome".into(),
                os: Some("linux".into()),
                arch: Some("x86_64".into()),
            }),
        );
    }

    #[test]
    fn malformed_frame_is_dropped_silently() {
        let fx = setup();
        let (mut conn, mut rx) = make_conn();
        handle_frame(&mut conn, "{not json", &fx.engine);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn entity_frame_before_auth_gets_unauthorized() {
        let fx = setup();
        let (mut conn, mut rx) = make_conn();
        send(
            &mut conn,
            &fx.engine,
            &Frame::HistoryAdd(Vec::new()),
        );
        let Frame::Error(payload) = recv_frame(&mut rx) else {
            panic!("expected error frame");
        };
        assert_eq!(payload.message.as_deref(), Some("Unauthorized"));
    }

    #[test]
    fn id_before_auth_gets_unauthorized() {
        let fx = setup();
        let (mut conn, mut rx) = make_conn();
        send(
            &mut conn,
            &fx.engine,
            &Frame::Id(IdPayload {
                id: session_uuid(),
                browser: "chrome".into(),
                os: None,
                arch: None,
            }),
        );
        let Frame::Error(payload) = recv_frame(&mut rx) else {
            panic!("expected error frame");
        };
        assert_eq!(payload.message.as_deref(), Some("Unauthorized"));
    }

    #[test]
    fn invalid_token_gets_no_reply() {
        let fx = setup();
        let (mut conn, mut rx) = make_conn();
        send(
            &mut conn,
            &fx.engine,
            &Frame::Auth(tether_core::protocol::AuthPayload {
                token: "bogus".into(),
            }),
        );
        assert!(rx.try_recv().is_err());
        assert!(conn.account().is_none());
    }

    #[test]
    fn handshake_binds_session_and_registers_connection() {
        let fx = setup();
        let (mut conn, mut rx) = make_conn();
        let sid = session_uuid();
        handshake(&fx, &mut conn, &mut rx, &sid);

        assert_eq!(recv_frame(&mut rx), Frame::IdSuccess);
        assert_eq!(recv_frame(&mut rx), Frame::HistoryInit);
        assert!(conn.is_bound());

        let session = SessionId::from_raw(sid);
        assert!(fx.engine.registry.lookup(&session).is_some());
        let row = fx.engine.sessions.get(&session).unwrap();
        assert_eq!(row.account_id, fx.account);
        assert_eq!(row.browser, "chrome");
    }

    #[test]
    fn non_uuid_session_id_is_ignored() {
        let fx = setup();
        let (mut conn, mut rx) = make_conn();
        send(
            &mut conn,
            &fx.engine,
            &Frame::Auth(tether_core::protocol::AuthPayload {
                token: fx.token.clone(),
            }),
        );
        assert_eq!(recv_frame(&mut rx), Frame::AuthSuccess);

        send(
            &mut conn,
            &fx.engine,
            &Frame::Id(IdPayload {
                id: "not-a-uuid".into(),
                browser: "chrome".into(),
                os: None,
                arch: None,
            }),
        );
        assert!(rx.try_recv().is_err());
        assert!(!conn.is_bound());
    }

    #[test]
    fn foreign_session_id_gets_error() {
        let fx = setup();
        let sid = session_uuid();

        // Another account claims the session id first
        let other_account = AccountId::new();
        fx.engine.sessions.ensure_account(&other_account).unwrap();
        fx.engine
            .sessions
            .bind(
                &SessionId::from_raw(sid.clone()),
                &other_account,
                "chrome",
                None,
                None,
            )
            .unwrap();

        let (mut conn, mut rx) = make_conn();
        handshake(&fx, &mut conn, &mut rx, &sid);
        let Frame::Error(_) = recv_frame(&mut rx) else {
            panic!("expected error frame");
        };
        assert!(!conn.is_bound());
    }

    #[test]
    fn handshake_replays_backlog_before_history_init() {
        let fx = setup();
        let sid = session_uuid();
        let session = SessionId::from_raw(sid.clone());

        // Queue a frame for the offline session
        fx.engine.sessions.ensure_account(&fx.account).unwrap();
        fx.engine
            .sessions
            .bind(&session, &fx.account, "chrome", None, None)
            .unwrap();
        fx.engine
            .dispatcher
            .deliver(
                &fx.account,
                &session,
                &Frame::BookmarksCreate(BookmarkNode {
                    id: EntityId::temporary(),
                    parent_id: None,
                    index: Some(0),
                    title: "queued while away".into(),
                    url: None,
                    date_added: None,
                    date_group_modified: None,
                    date_last_used: None,
                    children: Vec::new(),
                }),
            )
            .unwrap();

        let (mut conn, mut rx) = make_conn();
        handshake(&fx, &mut conn, &mut rx, &sid);

        assert_eq!(recv_frame(&mut rx), Frame::IdSuccess);
        let Frame::BookmarksCreate(node) = recv_frame(&mut rx) else {
            panic!("expected the queued creation");
        };
        assert_eq!(node.title, "queued while away");
        assert_eq!(recv_frame(&mut rx), Frame::HistoryInit);
    }

    #[test]
    fn bookmarks_add_persists_tree() {
        let fx = setup();
        let (mut conn, mut rx) = make_conn();
        let sid = session_uuid();
        handshake(&fx, &mut conn, &mut rx, &sid);
        let _ = recv_frame(&mut rx); // ID_SUCCESS
        let _ = recv_frame(&mut rx); // HISTORY_INIT

        let raw = r#"{"type":"BOOKMARKS_ADD","payload":{"bookmarks":[{"id":"1","title":"bar","children":[{"id":"2","parentId":"1","index":0,"title":"docs","url":"https://d"}]}]}}"#;
        handle_frame(&mut conn, raw, &fx.engine);
        assert!(rx.try_recv().is_err(), "no reply expected");

        let session = SessionId::from_raw(sid);
        let stored = fx
            .engine
            .bookmarks
            .get(&fx.account, &session, &EntityId::from_raw("2"))
            .unwrap()
            .unwrap();
        assert_eq!(stored.title, "docs");
    }

    #[test]
    fn setid_frame_runs_reconciliation() {
        let fx = setup();
        let (mut conn, mut rx) = make_conn();
        let sid = session_uuid();
        handshake(&fx, &mut conn, &mut rx, &sid);
        let _ = recv_frame(&mut rx);
        let _ = recv_frame(&mut rx);

        let session = SessionId::from_raw(sid);
        let tmp = EntityId::temporary();
        fx.engine
            .bookmarks
            .insert_node(
                &fx.account,
                &session,
                &BookmarkNode {
                    id: tmp.clone(),
                    parent_id: None,
                    index: Some(0),
                    title: "proposed".into(),
                    url: None,
                    date_added: None,
                    date_group_modified: None,
                    date_last_used: None,
                    children: Vec::new(),
                },
            )
            .unwrap();

        send(
            &mut conn,
            &fx.engine,
            &Frame::BookmarksSetId(BookmarksSetIdPayload {
                previous_id: tmp.clone(),
                new_id: EntityId::from_raw("417"),
            }),
        );
        assert!(rx.try_recv().is_err(), "no reply expected");

        assert!(fx
            .engine
            .bookmarks
            .get(&fx.account, &session, &tmp)
            .unwrap()
            .is_none());
        assert!(fx
            .engine
            .bookmarks
            .get(&fx.account, &session, &EntityId::from_raw("417"))
            .unwrap()
            .is_some());
    }

    #[test]
    fn setid_for_unknown_entity_reports_error() {
        let fx = setup();
        let (mut conn, mut rx) = make_conn();
        handshake(&fx, &mut conn, &mut rx, &session_uuid());
        let _ = recv_frame(&mut rx);
        let _ = recv_frame(&mut rx);

        send(
            &mut conn,
            &fx.engine,
            &Frame::BookmarksSetId(BookmarksSetIdPayload {
                previous_id: EntityId::from_raw("ghost"),
                new_id: EntityId::from_raw("417"),
            }),
        );
        let Frame::Error(payload) = recv_frame(&mut rx) else {
            panic!("expected error frame");
        };
        assert!(payload.message.is_none());
    }

    #[test]
    fn history_lifecycle_via_frames() {
        let fx = setup();
        let (mut conn, mut rx) = make_conn();
        let sid = session_uuid();
        handshake(&fx, &mut conn, &mut rx, &sid);
        let _ = recv_frame(&mut rx);
        let _ = recv_frame(&mut rx);
        let session = SessionId::from_raw(sid);

        let raw = r#"{"type":"HISTORY_ADD","payload":[{"id":"9","url":"https://a","lastVisitTime":1718000000000}]}"#;
        handle_frame(&mut conn, raw, &fx.engine);
        assert_eq!(fx.engine.history.count(&fx.account, &session).unwrap(), 1);

        let raw = r#"{"type":"HISTORY_DELETE","payload":{"allHistory":true}}"#;
        handle_frame(&mut conn, raw, &fx.engine);
        assert_eq!(fx.engine.history.count(&fx.account, &session).unwrap(), 0);
    }

    #[test]
    fn tabs_add_stores_snapshot() {
        let fx = setup();
        let (mut conn, mut rx) = make_conn();
        let sid = session_uuid();
        handshake(&fx, &mut conn, &mut rx, &sid);
        let _ = recv_frame(&mut rx);
        let _ = recv_frame(&mut rx);
        let session = SessionId::from_raw(sid);

        let raw = r#"{"type":"TABS_ADD","payload":[{"id":5,"incognito":false,"index":0,"pinned":false,"windowId":1,"url":"https://t"}]}"#;
        handle_frame(&mut conn, raw, &fx.engine);
        assert_eq!(
            fx.engine.tabs.snapshots(&fx.account, &session).unwrap().len(),
            1
        );
    }

    #[test]
    fn ping_produces_no_reply() {
        let fx = setup();
        let (mut conn, mut rx) = make_conn();
        handle_frame(&mut conn, r#"{"type":"PING","payload":{"message":"ping"}}"#, &fx.engine);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn handshake_records_liveness() {
        let fx = setup();
        let (mut conn, mut rx) = make_conn();
        let sid = session_uuid();
        handshake(&fx, &mut conn, &mut rx, &sid);

        let session = SessionId::from_raw(sid);
        let row = fx.engine.sessions.get(&session).unwrap();
        assert!(row.last_connected_at.is_some());
    }
}

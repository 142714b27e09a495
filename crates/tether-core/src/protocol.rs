//! Wire protocol: one JSON object per WebSocket text frame,
//! `{"type": <kind>, "payload": <kind-specific>}`.
//!
//! Every frame the engine consumes or produces is a variant here, so
//! dispatch at the connection boundary is exhaustive. Field names follow
//! the browser extension APIs (camelCase on the wire).

use serde::{Deserialize, Serialize};

use crate::ids::EntityId;

/// A single wire frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Frame {
    // Handshake
    #[serde(rename = "AUTH")]
    Auth(AuthPayload),
    #[serde(rename = "ID")]
    Id(IdPayload),

    // Bookmarks
    #[serde(rename = "BOOKMARKS_ADD")]
    BookmarksAdd(BookmarksAddPayload),
    #[serde(rename = "BOOKMARKS_CREATE")]
    BookmarksCreate(BookmarkNode),
    #[serde(rename = "BOOKMARKS_UPDATE")]
    BookmarksUpdate(BookmarksUpdatePayload),
    #[serde(rename = "BOOKMARKS_MOVE")]
    BookmarksMove(BookmarksMovePayload),
    #[serde(rename = "BOOKMARKS_REMOVE")]
    BookmarksRemove(BookmarksRemovePayload),
    #[serde(rename = "BOOKMARKS_SETID")]
    BookmarksSetId(BookmarksSetIdPayload),

    // History
    #[serde(rename = "HISTORY_ADD")]
    HistoryAdd(Vec<VisitRecord>),
    #[serde(rename = "HISTORY_DELETE")]
    HistoryDelete(HistoryDeletePayload),
    #[serde(rename = "HISTORY_REMOVE")]
    HistoryRemove(HistoryRemovePayload),

    // Tabs
    #[serde(rename = "TABS_ADD")]
    TabsAdd(Vec<TabRecord>),

    // Signals
    #[serde(rename = "PING")]
    Ping(Option<serde_json::Value>),
    #[serde(rename = "AUTH_SUCCESS")]
    AuthSuccess,
    #[serde(rename = "ID_SUCCESS")]
    IdSuccess,
    #[serde(rename = "HISTORY_INIT")]
    HistoryInit,
    #[serde(rename = "SESSION_REMOVE")]
    SessionRemove,
    #[serde(rename = "ERROR")]
    Error(ErrorPayload),
}

impl Frame {
    /// Wire name of this frame's kind, as persisted in the backlog.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth(_) => "AUTH",
            Self::Id(_) => "ID",
            Self::BookmarksAdd(_) => "BOOKMARKS_ADD",
            Self::BookmarksCreate(_) => "BOOKMARKS_CREATE",
            Self::BookmarksUpdate(_) => "BOOKMARKS_UPDATE",
            Self::BookmarksMove(_) => "BOOKMARKS_MOVE",
            Self::BookmarksRemove(_) => "BOOKMARKS_REMOVE",
            Self::BookmarksSetId(_) => "BOOKMARKS_SETID",
            Self::HistoryAdd(_) => "HISTORY_ADD",
            Self::HistoryDelete(_) => "HISTORY_DELETE",
            Self::HistoryRemove(_) => "HISTORY_REMOVE",
            Self::TabsAdd(_) => "TABS_ADD",
            Self::Ping(_) => "PING",
            Self::AuthSuccess => "AUTH_SUCCESS",
            Self::IdSuccess => "ID_SUCCESS",
            Self::HistoryInit => "HISTORY_INIT",
            Self::SessionRemove => "SESSION_REMOVE",
            Self::Error(_) => "ERROR",
        }
    }

    /// The payload half of the envelope, `Null` for signal frames.
    pub fn payload_value(&self) -> serde_json::Value {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(mut obj)) => {
                obj.remove("payload").unwrap_or(serde_json::Value::Null)
            }
            _ => serde_json::Value::Null,
        }
    }

    /// Rebuild a frame from a persisted (kind, payload) pair.
    pub fn from_parts(
        kind: &str,
        payload: serde_json::Value,
    ) -> Result<Self, serde_json::Error> {
        serde_json::from_value(serde_json::json!({ "type": kind, "payload": payload }))
    }

    /// Serialize the `{"type": ..., "payload": ...}` envelope from parts
    /// without requiring the payload to deserialize into a typed frame.
    pub fn wire_text(kind: &str, payload: &serde_json::Value) -> String {
        serde_json::json!({ "type": kind, "payload": payload }).to_string()
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(ErrorPayload {
            message: Some(message.into()),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuthPayload {
    pub token: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdPayload {
    /// Client-generated session uuid, stable across reconnects.
    pub id: String,
    pub browser: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
}

/// One node of a bookmark tree. Inbound trees can be arbitrarily deep;
/// outbound creation frames carry a single childless node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookmarkNode {
    pub id: EntityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<i64>,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_added: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_group_modified: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_last_used: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<BookmarkNode>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BookmarksAddPayload {
    pub bookmarks: Vec<BookmarkNode>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BookmarkChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BookmarksUpdatePayload {
    pub id: EntityId,
    pub changes: BookmarkChanges,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveDestination {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_index: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_parent_id: Option<EntityId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BookmarksMovePayload {
    pub id: EntityId,
    pub destination: MoveDestination,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BookmarksRemovePayload {
    pub id: EntityId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookmarksSetIdPayload {
    pub previous_id: EntityId,
    pub new_id: EntityId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitRecord {
    /// The browser's own id for the history entry.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Epoch milliseconds; browsers report fractional values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_visit_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visit_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typed_count: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryDeletePayload {
    pub all_history: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryRemovePayload {
    pub url: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fav_icon_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub incognito: bool,
    pub index: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_accessed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opener_tab_id: Option<i64>,
    pub pinned: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub window_id: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

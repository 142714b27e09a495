/// SQL DDL for the tether store.
/// WAL mode + foreign keys enabled at connection time.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
    browser TEXT NOT NULL,
    os TEXT,
    arch TEXT,
    created_at TEXT NOT NULL,
    last_connected_at TEXT
);

CREATE TABLE IF NOT EXISTS bookmarks (
    record_id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL,
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    entity_id TEXT NOT NULL,
    parent_id TEXT,
    position INTEGER,
    title TEXT NOT NULL,
    url TEXT,
    date_added INTEGER,
    date_group_modified INTEGER,
    date_last_used INTEGER,
    UNIQUE (account_id, session_id, entity_id),
    -- no ON DELETE action: the delete path clears children's parent links
    -- in the same transaction before removing a folder row
    FOREIGN KEY (account_id, session_id, parent_id)
        REFERENCES bookmarks (account_id, session_id, entity_id)
);

CREATE TABLE IF NOT EXISTS history_items (
    record_id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL,
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    item_id TEXT NOT NULL,
    url TEXT,
    title TEXT,
    last_visit_time INTEGER,
    visit_count INTEGER,
    typed_count INTEGER,
    UNIQUE (account_id, session_id, item_id, last_visit_time)
);

CREATE TABLE IF NOT EXISTS tabs (
    record_id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL,
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    snapshot_at TEXT NOT NULL,
    tab_id INTEGER,
    window_id INTEGER NOT NULL,
    position INTEGER NOT NULL,
    url TEXT,
    title TEXT,
    fav_icon_url TEXT,
    pinned INTEGER NOT NULL DEFAULT 0,
    incognito INTEGER NOT NULL DEFAULT 0,
    last_accessed INTEGER,
    opener_tab_id INTEGER
);

CREATE TABLE IF NOT EXISTS pending_messages (
    id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL,
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    created_at TEXT NOT NULL,
    sent_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_sessions_account ON sessions(account_id);
CREATE INDEX IF NOT EXISTS idx_bookmarks_scope ON bookmarks(account_id, session_id);
CREATE INDEX IF NOT EXISTS idx_bookmarks_parent ON bookmarks(account_id, session_id, parent_id);
CREATE INDEX IF NOT EXISTS idx_history_scope ON history_items(account_id, session_id);
CREATE INDEX IF NOT EXISTS idx_history_url ON history_items(account_id, session_id, url);
CREATE INDEX IF NOT EXISTS idx_tabs_snapshot ON tabs(account_id, session_id, snapshot_at);
CREATE INDEX IF NOT EXISTS idx_pending_session ON pending_messages(session_id, status);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;

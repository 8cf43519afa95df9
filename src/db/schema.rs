/// Schema for all durable tables.
pub const SCHEMA: &str = r#"
-- Named caches currently known to this installation
CREATE TABLE IF NOT EXISTS cache_names (
    cache_name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

-- Request -> response pairs; seq gives insertion order for FIFO eviction
CREATE TABLE IF NOT EXISTS cache_entries (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    cache_name TEXT NOT NULL,
    cache_key TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL,
    timestamp TEXT,
    max_age INTEGER,
    UNIQUE (cache_name, cache_key),
    FOREIGN KEY (cache_name) REFERENCES cache_names(cache_name) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_name_seq
    ON cache_entries(cache_name, seq);

-- Background sync tasks
CREATE TABLE IF NOT EXISTS sync_tasks (
    id TEXT PRIMARY KEY,
    tag TEXT NOT NULL,
    url TEXT NOT NULL,
    method TEXT NOT NULL,
    payload TEXT,
    entity_id TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL,
    retry_delay_ms INTEGER NOT NULL,
    status TEXT NOT NULL,
    last_error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sync_tasks_tag_status ON sync_tasks(tag, status);
CREATE INDEX IF NOT EXISTS idx_sync_tasks_entity ON sync_tasks(entity_id);

-- Local chart records
CREATE TABLE IF NOT EXISTS charts (
    local_id TEXT PRIMARY KEY,
    server_id TEXT,
    dirty INTEGER NOT NULL,
    synced INTEGER NOT NULL,
    data TEXT NOT NULL,
    params TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_charts_dirty ON charts(dirty);

-- Small key/value area: counters and shared cross-context state
CREATE TABLE IF NOT EXISTS sync_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

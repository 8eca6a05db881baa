use std::str::FromStr as _;

use anyhow::{Context as _, Result};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    SqlitePool,
};

/// The database connection pool shared by every route.
pub type Db = SqlitePool;

/// Open (creating if missing) the database at `url` and bring its schema up to date.
#[tracing::instrument(skip_all)]
pub async fn establish_pool(url: &str) -> Result<Db> {
    tracing::debug!("establishing database connection pool");
    let opts = SqliteConnectOptions::from_str(url)
        .with_context(|| format!("failed to parse database url {url:?}"))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(opts)
        .await
        .context("failed to connect to SQLite database")?;

    migrate(&pool).await?;
    Ok(pool)
}

/// Ensure every table exists. Idempotent.
pub async fn migrate(db: &Db) -> Result<()> {
    _ = sqlx::raw_sql(SCHEMA)
        .execute(db)
        .await
        .context("failed to create tables")?;
    Ok(())
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    email TEXT NOT NULL UNIQUE,
    role TEXT NOT NULL,
    longitude REAL,
    latitude REAL,
    is_active INTEGER NOT NULL DEFAULT 1,
    skills TEXT NOT NULL DEFAULT '[]',
    phone TEXT,
    token_hash TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_users_location ON users(latitude, longitude);
CREATE INDEX IF NOT EXISTS idx_users_role ON users(role, is_active);

CREATE TABLE IF NOT EXISTS disasters (
    id TEXT PRIMARY KEY NOT NULL,
    title TEXT NOT NULL,
    description TEXT NOT NULL,
    disaster_type TEXT NOT NULL,
    severity TEXT NOT NULL,
    longitude REAL NOT NULL,
    latitude REAL NOT NULL,
    address TEXT,
    city TEXT,
    state TEXT,
    country TEXT,
    photos TEXT NOT NULL DEFAULT '[]',
    reported_by TEXT NOT NULL REFERENCES users(id),
    status TEXT NOT NULL,
    verified_by TEXT REFERENCES users(id),
    verified_at TEXT,
    resolved_at TEXT,
    affected_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_disasters_location ON disasters(latitude, longitude);
CREATE INDEX IF NOT EXISTS idx_disasters_status ON disasters(status, created_at);

CREATE TABLE IF NOT EXISTS help_requests (
    id TEXT PRIMARY KEY NOT NULL,
    disaster_id TEXT NOT NULL REFERENCES disasters(id),
    requested_by TEXT NOT NULL REFERENCES users(id),
    request_types TEXT NOT NULL,
    description TEXT NOT NULL,
    urgency TEXT NOT NULL,
    longitude REAL NOT NULL,
    latitude REAL NOT NULL,
    address TEXT,
    city TEXT,
    state TEXT,
    country TEXT,
    status TEXT NOT NULL,
    matched_volunteer TEXT REFERENCES users(id),
    matched_at TEXT,
    completed_at TEXT,
    verified_by TEXT REFERENCES users(id),
    verified_at TEXT,
    quantity TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_help_requests_location ON help_requests(latitude, longitude);
CREATE INDEX IF NOT EXISTS idx_help_requests_disaster ON help_requests(disaster_id, status);

CREATE TABLE IF NOT EXISTS alerts (
    id TEXT PRIMARY KEY NOT NULL,
    title TEXT NOT NULL,
    message TEXT NOT NULL,
    alert_type TEXT NOT NULL,
    priority TEXT NOT NULL,
    disaster_id TEXT REFERENCES disasters(id),
    region_longitude REAL,
    region_latitude REAL,
    region_radius_km REAL,
    sent_by TEXT NOT NULL REFERENCES users(id),
    sent_via TEXT NOT NULL,
    sent_at TEXT NOT NULL,
    expires_at TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_alerts_created ON alerts(created_at);

-- Point-in-time recipients of an alert. No rows means a public alert.
CREATE TABLE IF NOT EXISTS alert_targets (
    alert_id TEXT NOT NULL REFERENCES alerts(id),
    user_id TEXT NOT NULL REFERENCES users(id),
    PRIMARY KEY (alert_id, user_id)
);
CREATE INDEX IF NOT EXISTS idx_alert_targets_user ON alert_targets(user_id);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY NOT NULL,
    sender TEXT NOT NULL REFERENCES users(id),
    receiver TEXT NOT NULL REFERENCES users(id),
    help_request_id TEXT REFERENCES help_requests(id),
    content TEXT NOT NULL,
    is_read INTEGER NOT NULL DEFAULT 0,
    read_at TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_pair ON messages(sender, receiver, created_at);
CREATE INDEX IF NOT EXISTS idx_messages_receiver ON messages(receiver, created_at);

CREATE TABLE IF NOT EXISTS organizations (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL UNIQUE,
    description TEXT,
    email TEXT NOT NULL UNIQUE,
    phone TEXT,
    website TEXT,
    is_verified INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS donation_events (
    id TEXT PRIMARY KEY NOT NULL,
    title TEXT NOT NULL,
    description TEXT NOT NULL,
    target_amount REAL NOT NULL DEFAULT 0,
    target_items TEXT NOT NULL DEFAULT '{}',
    collected_amount REAL NOT NULL DEFAULT 0,
    collected_items TEXT NOT NULL DEFAULT '{}',
    created_by TEXT NOT NULL REFERENCES users(id),
    organization_id TEXT REFERENCES organizations(id),
    status TEXT NOT NULL,
    start_date TEXT NOT NULL,
    end_date TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS donations (
    id TEXT PRIMARY KEY NOT NULL,
    donor TEXT NOT NULL REFERENCES users(id),
    donation_type TEXT NOT NULL,
    amount REAL NOT NULL DEFAULT 0,
    item_description TEXT,
    quantity INTEGER NOT NULL DEFAULT 1,
    event_id TEXT REFERENCES donation_events(id),
    status TEXT NOT NULL,
    transaction_id TEXT,
    delivery_address TEXT,
    notes TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_donations_event ON donations(event_id, status);

CREATE TABLE IF NOT EXISTS feedback (
    id TEXT PRIMARY KEY NOT NULL,
    from_user TEXT NOT NULL REFERENCES users(id),
    target_type TEXT NOT NULL,
    target_id TEXT NOT NULL,
    help_request_id TEXT REFERENCES help_requests(id),
    rating INTEGER NOT NULL CHECK (rating BETWEEN 1 AND 5),
    comment TEXT NOT NULL,
    category TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (from_user, target_type, target_id)
);

CREATE TABLE IF NOT EXISTS announcements (
    id TEXT PRIMARY KEY NOT NULL,
    title TEXT NOT NULL,
    content TEXT NOT NULL,
    category TEXT NOT NULL,
    created_by TEXT NOT NULL REFERENCES users(id),
    is_published INTEGER NOT NULL DEFAULT 0,
    published_at TEXT,
    created_at TEXT NOT NULL
);
";

/// A fresh opaque record id.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

//! Cumulative schema steps for the local store.
//!
//! Each entry in `STEPS` upgrades the database from version `n` to `n + 1`.
//! Steps are never edited once released; new collections get a new step.

use color_eyre::{eyre::eyre, Result};
use rusqlite::Connection;
use tracing::debug;

/// Current schema version.
pub const VERSION: u32 = 4;

/// Version 1: restaurant list and detail records, keyed by id (`-1` for the list).
const V1_RESTAURANTS: &str = r#"
CREATE TABLE IF NOT EXISTS restaurants (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Version 2: reviews with a secondary index on the owning restaurant.
const V2_REVIEWS: &str = r#"
CREATE TABLE IF NOT EXISTS reviews (
    key INTEGER PRIMARY KEY,
    restaurant_id INTEGER,
    value TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_reviews_restaurant_id ON reviews(restaurant_id);
"#;

/// Version 3: queued mutations, auto-assigned monotonic keys.
const V3_PENDING: &str = r#"
CREATE TABLE IF NOT EXISTS pending (
    key INTEGER PRIMARY KEY AUTOINCREMENT,
    value TEXT NOT NULL
);
"#;

/// Version 4: named static asset caches and their install fingerprints.
const V4_ASSETS: &str = r#"
CREATE TABLE IF NOT EXISTS assets (
    cache_name TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    status_text TEXT NOT NULL,
    content_type TEXT,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (cache_name, url)
);

CREATE TABLE IF NOT EXISTS asset_caches (
    cache_name TEXT PRIMARY KEY,
    fingerprint TEXT NOT NULL,
    installed_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

const STEPS: [&str; VERSION as usize] = [V1_RESTAURANTS, V2_REVIEWS, V3_PENDING, V4_ASSETS];

/// Apply every step between `old` (exclusive) and `new` (inclusive), in order.
pub fn upgrade(conn: &Connection, old: u32, new: u32) -> Result<()> {
  for version in (old + 1)..=new {
    let step = STEPS
      .get(version as usize - 1)
      .ok_or_else(|| eyre!("No schema step for version {}", version))?;

    conn
      .execute_batch(step)
      .map_err(|e| eyre!("Failed to apply schema version {}: {}", version, e))?;

    debug!(version, "Applied schema step");
  }

  Ok(())
}

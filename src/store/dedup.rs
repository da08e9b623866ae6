use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::Connection;
use tokio::sync::Mutex;
use tracing::info;

use crate::platform::PlatformKind;

/// Idempotency filter over (event id, platform) pairs.
///
/// Chat backends deliver at-least-once; this store turns the pipeline into
/// at-most-once per event id. A record's presence is the whole signal, its
/// content is never read back.
#[derive(Clone)]
pub struct EventDedupStore {
    conn: Arc<Mutex<Connection>>,
}

impl EventDedupStore {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Record the event id and report whether it had been seen before.
    ///
    /// Events without an id cannot be deduplicated and always come back as
    /// unseen. The check and the insert are a single `INSERT OR IGNORE`, so
    /// two racing deliveries of the same id cannot both observe `false`.
    pub async fn register(
        &self,
        event_id: Option<&str>,
        platform: PlatformKind,
    ) -> Result<bool> {
        let Some(event_id) = event_id else {
            return Ok(false);
        };

        let conn = self.conn.lock().await;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO seen_events (event_id, platform) VALUES (?1, ?2)",
                rusqlite::params![event_id, platform.to_string()],
            )
            .context("Failed to register event")?;

        Ok(inserted == 0)
    }

    /// Drop dedup records older than the given number of days.
    ///
    /// Redelivery windows on every supported platform are far shorter than
    /// any sane retention, so pruning old markers cannot reintroduce
    /// duplicates.
    pub async fn prune_older_than_days(&self, days: u32) -> Result<usize> {
        let conn = self.conn.lock().await;
        let removed = conn
            .execute(
                "DELETE FROM seen_events WHERE seen_at < datetime('now', ?1)",
                rusqlite::params![format!("-{days} days")],
            )
            .context("Failed to prune dedup records")?;

        if removed > 0 {
            info!("Pruned {} dedup records older than {} days", removed, days);
        }
        Ok(removed)
    }
}

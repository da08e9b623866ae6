use std::sync::Arc;

use anyhow::{bail, Context, Result};
use rusqlite::Connection;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

/// Serialized payloads above this length are rejected rather than truncated.
const MAX_PAYLOAD_CHARS: usize = 10_000;

/// Opaque-token to keyboard-payload mapping.
///
/// Button callback fields are tiny on most platforms, so outbound keyboards
/// never carry their real payload; they carry a token minted here, resolved
/// back on the next interaction. Tokens are write-once, read-many and never
/// expire.
#[derive(Clone)]
pub struct CallbackTokenStore {
    conn: Arc<Mutex<Connection>>,
}

impl CallbackTokenStore {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Persist a payload under a fresh random token and return the token.
    pub async fn add(&self, payload: &serde_json::Value) -> Result<String> {
        let serialized = serde_json::to_string(payload).context("Failed to encode payload")?;
        if serialized.len() > MAX_PAYLOAD_CHARS {
            bail!(
                "callback payload too large: {} > {} chars",
                serialized.len(),
                MAX_PAYLOAD_CHARS
            );
        }

        let token = Uuid::new_v4().to_string();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO callback_tokens (token, payload) VALUES (?1, ?2)",
            rusqlite::params![&token, &serialized],
        )
        .context("Failed to store callback token")?;

        Ok(token)
    }

    /// Resolve a token back to its payload.
    ///
    /// Unknown tokens and stored values that no longer parse both yield
    /// `None`; corruption is logged, never propagated.
    pub async fn get(&self, token: &str) -> Result<Option<serde_json::Value>> {
        let conn = self.conn.lock().await;
        let stored: String = match conn.query_row(
            "SELECT payload FROM callback_tokens WHERE token = ?1",
            rusqlite::params![token],
            |row| row.get(0),
        ) {
            Ok(payload) => payload,
            // An absent row is the expected "unknown token" case; anything
            // else is a real storage failure.
            Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
            Err(e) => return Err(e).context("Failed to load callback token"),
        };

        match serde_json::from_str(&stored) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!("Discarding undecodable payload for token {}: {}", token, e);
                Ok(None)
            }
        }
    }
}

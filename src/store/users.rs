use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::Connection;
use tokio::sync::Mutex;

use crate::platform::PlatformKind;

/// Per-user conversation state.
///
/// `uid` is the sole identity key; a user on two platforms is two records.
/// Records are created lazily on first contact and never deleted.
#[derive(Debug, Clone, PartialEq)]
pub struct UserRecord {
    pub uid: String,
    pub user_id: String,
    pub platform: PlatformKind,
    /// Name of the step the user is currently on, `None` before first
    /// transition.
    pub step: Option<String>,
}

impl UserRecord {
    pub fn uid_for(user_id: &str, platform: PlatformKind) -> String {
        format!("{platform}:{user_id}")
    }
}

/// Get-or-create and update of `UserRecord`s.
///
/// Concurrent calls for the same user are not serialized here; the engine
/// holds a per-user lock around its read-transition-write sequence.
#[derive(Clone)]
pub struct UserStore {
    conn: Arc<Mutex<Connection>>,
}

impl UserStore {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Look up a user by platform pair, inserting a fresh record with no
    /// current step when absent.
    pub async fn get(&self, user_id: &str, platform: PlatformKind) -> Result<UserRecord> {
        let uid = UserRecord::uid_for(user_id, platform);
        let conn = self.conn.lock().await;

        // INSERT OR IGNORE keeps a concurrent first contact from failing on
        // the primary key; whoever loses the race re-reads the same row.
        conn.execute(
            "INSERT OR IGNORE INTO users (uid, user_id, platform, step) VALUES (?1, ?2, ?3, NULL)",
            rusqlite::params![&uid, user_id, platform.to_string()],
        )
        .context("Failed to create user")?;

        let user = conn
            .query_row(
                "SELECT uid, user_id, platform, step FROM users WHERE uid = ?1",
                rusqlite::params![&uid],
                parse_user_row,
            )
            .context("Failed to load user")?;

        Ok(user)
    }

    /// Full-record update keyed by uid. Last writer wins.
    pub async fn save(&self, user: &UserRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE users SET user_id = ?2, platform = ?3, step = ?4 WHERE uid = ?1",
            rusqlite::params![
                &user.uid,
                &user.user_id,
                user.platform.to_string(),
                &user.step,
            ],
        )
        .context("Failed to save user")?;
        Ok(())
    }
}

fn parse_user_row(row: &rusqlite::Row) -> rusqlite::Result<UserRecord> {
    let platform: String = row.get(2)?;
    Ok(UserRecord {
        uid: row.get(0)?,
        user_id: row.get(1)?,
        platform: PlatformKind::from_str(&platform).unwrap_or(PlatformKind::Telegram),
        step: row.get(3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[tokio::test]
    async fn test_lazy_creation() {
        let store = Store::open_in_memory().unwrap();
        let users = UserStore::new(store.connection());

        let user = users.get("42", PlatformKind::Telegram).await.unwrap();
        assert_eq!(user.uid, "tg:42");
        assert_eq!(user.user_id, "42");
        assert_eq!(user.platform, PlatformKind::Telegram);
        assert_eq!(user.step, None);
    }

    #[tokio::test]
    async fn test_get_twice_returns_same_record() {
        let store = Store::open_in_memory().unwrap();
        let users = UserStore::new(store.connection());

        let first = users.get("42", PlatformKind::Vk).await.unwrap();
        let second = users.get("42", PlatformKind::Vk).await.unwrap();
        assert_eq!(first, second);

        let count: i64 = {
            let conn = store.connection();
            let conn = conn.lock().await;
            conn.query_row("SELECT count(*) FROM users", [], |row| row.get(0))
                .unwrap()
        };
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_same_id_on_two_platforms_is_two_users() {
        let store = Store::open_in_memory().unwrap();
        let users = UserStore::new(store.connection());

        let tg = users.get("7", PlatformKind::Telegram).await.unwrap();
        let vk = users.get("7", PlatformKind::Vk).await.unwrap();
        assert_ne!(tg.uid, vk.uid);
    }

    #[tokio::test]
    async fn test_save_updates_step() {
        let store = Store::open_in_memory().unwrap();
        let users = UserStore::new(store.connection());

        let mut user = users.get("42", PlatformKind::Slack).await.unwrap();
        user.step = Some("start".to_string());
        users.save(&user).await.unwrap();

        let reloaded = users.get("42", PlatformKind::Slack).await.unwrap();
        assert_eq!(reloaded.step.as_deref(), Some("start"));
    }
}

//! State Tracker
//!
//! Durable election state for one member: the current term, the vote cast
//! in that term and the replication watermarks. A restarted member reloads
//! these so it never votes twice in a term and never moves its term
//! backwards.

use std::path::PathBuf;
use rusqlite::{Connection, OptionalExtension, params};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::replication::LogPosition;
use crate::topology::{MemberId, Term};

/// Persistent state tracker backed by SQLite
pub struct StateTracker {
    /// Database connection (rusqlite connections are not Sync)
    conn: Mutex<Connection>,
    /// Member this state belongs to
    member_id: MemberId,
}

impl StateTracker {
    /// Create or open the state database in `data_dir`
    pub fn new(data_dir: PathBuf, member_id: MemberId) -> Result<Self> {
        std::fs::create_dir_all(&data_dir)?;
        let conn = Connection::open(data_dir.join("state.db"))?;
        Self::with_connection(conn, member_id)
    }

    /// Non-durable tracker, for simulations and tests
    pub fn in_memory(member_id: MemberId) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, member_id)
    }

    fn with_connection(conn: Connection, member_id: MemberId) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS member_state (
                key TEXT PRIMARY KEY,
                value_int INTEGER,
                value_text TEXT,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            member_id,
        })
    }

    async fn get_int(&self, key: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock().await;
        let value = conn
            .query_row(
                "SELECT value_int FROM member_state WHERE key = ?1",
                params![key],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()
            .map_err(|e| Error::State(format!("Failed to read {}: {}", key, e)))?;
        Ok(value.flatten())
    }

    async fn set_int(&self, key: &str, value: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO member_state (key, value_int) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value_int = ?2, updated_at = CURRENT_TIMESTAMP
            "#,
            params![key, value],
        )?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM member_state WHERE key = ?1", params![key])?;
        Ok(())
    }

    /// Get the current term (0 before the first election)
    pub async fn current_term(&self) -> Result<Term> {
        Ok(self.get_int("current_term").await?.unwrap_or(0) as Term)
    }

    /// Set the current term
    pub async fn set_current_term(&self, term: Term) -> Result<()> {
        self.set_int("current_term", term as i64).await
    }

    /// Get the vote cast, as (term, candidate)
    pub async fn voted_for(&self) -> Result<Option<(Term, MemberId)>> {
        let conn = self.conn.lock().await;
        let result = conn
            .query_row(
                "SELECT value_int, value_text FROM member_state WHERE key = 'voted_for'",
                [],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .map_err(|e| Error::State(format!("Failed to get voted_for: {}", e)))?;

        match result {
            Some((term, candidate)) => {
                let candidate = candidate
                    .parse::<MemberId>()
                    .map_err(|e| Error::State(format!("Corrupt voted_for entry: {}", e)))?;
                Ok(Some((term as Term, candidate)))
            }
            None => Ok(None),
        }
    }

    /// Record the vote cast in `term`, or clear it
    pub async fn set_voted_for(&self, vote: Option<(Term, MemberId)>) -> Result<()> {
        match vote {
            Some((term, candidate)) => {
                let conn = self.conn.lock().await;
                conn.execute(
                    r#"
                    INSERT INTO member_state (key, value_int, value_text) VALUES ('voted_for', ?1, ?2)
                    ON CONFLICT(key) DO UPDATE SET value_int = ?1, value_text = ?2,
                        updated_at = CURRENT_TIMESTAMP
                    "#,
                    params![term as i64, candidate.to_string()],
                )?;
                Ok(())
            }
            None => self.delete("voted_for").await,
        }
    }

    /// Get the last known primary
    pub async fn current_primary(&self) -> Result<Option<MemberId>> {
        Ok(self.get_int("current_primary").await?.map(|id| id as MemberId))
    }

    /// Set the last known primary
    pub async fn set_current_primary(&self, primary: Option<MemberId>) -> Result<()> {
        match primary {
            Some(id) => self.set_int("current_primary", id as i64).await,
            None => self.delete("current_primary").await,
        }
    }

    /// Get the last applied log position
    pub async fn last_applied_position(&self) -> Result<LogPosition> {
        Ok(self.get_int("last_applied_position").await?.unwrap_or(0) as LogPosition)
    }

    /// Set the last applied log position
    pub async fn set_last_applied_position(&self, position: LogPosition) -> Result<()> {
        self.set_int("last_applied_position", position as i64).await
    }

    /// Get the majority-committed log position
    pub async fn commit_position(&self) -> Result<LogPosition> {
        Ok(self.get_int("commit_position").await?.unwrap_or(0) as LogPosition)
    }

    /// Set the majority-committed log position
    pub async fn set_commit_position(&self, position: LogPosition) -> Result<()> {
        self.set_int("commit_position", position as i64).await
    }

    /// Member this state belongs to
    pub fn member_id(&self) -> MemberId {
        self.member_id
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::State(format!("SQLite error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_state_tracker_basic() {
        let dir = tempdir().unwrap();
        let tracker = StateTracker::new(dir.path().to_path_buf(), 0).unwrap();

        assert_eq!(tracker.current_term().await.unwrap(), 0);
        tracker.set_current_term(5).await.unwrap();
        assert_eq!(tracker.current_term().await.unwrap(), 5);

        assert_eq!(tracker.last_applied_position().await.unwrap(), 0);
        tracker.set_last_applied_position(100).await.unwrap();
        assert_eq!(tracker.last_applied_position().await.unwrap(), 100);

        tracker.set_commit_position(90).await.unwrap();
        assert_eq!(tracker.commit_position().await.unwrap(), 90);
    }

    #[tokio::test]
    async fn test_voted_for() {
        let tracker = StateTracker::in_memory(1).unwrap();

        assert!(tracker.voted_for().await.unwrap().is_none());

        tracker.set_voted_for(Some((3, 0))).await.unwrap();
        assert_eq!(tracker.voted_for().await.unwrap(), Some((3, 0)));

        tracker.set_voted_for(Some((4, 1))).await.unwrap();
        assert_eq!(tracker.voted_for().await.unwrap(), Some((4, 1)));

        tracker.set_voted_for(None).await.unwrap();
        assert!(tracker.voted_for().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let tracker = StateTracker::new(dir.path().to_path_buf(), 2).unwrap();
            tracker.set_current_term(7).await.unwrap();
            tracker.set_voted_for(Some((7, 0))).await.unwrap();
            tracker.set_current_primary(Some(0)).await.unwrap();
        }

        let tracker = StateTracker::new(dir.path().to_path_buf(), 2).unwrap();
        assert_eq!(tracker.current_term().await.unwrap(), 7);
        assert_eq!(tracker.voted_for().await.unwrap(), Some((7, 0)));
        assert_eq!(tracker.current_primary().await.unwrap(), Some(0));
        assert_eq!(tracker.member_id(), 2);
    }
}

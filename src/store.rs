//! Durable, crash-safe persistence for all §3 entities. The sole serialization
//! point for concurrent mutation: a single `rusqlite::Connection` behind a mutex.

use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};

use crate::model::{Closure, DisputeAttempt, ObservedPipe, RecordedEvent, SignatureState, Snapshot};

pub const SCHEMA_VERSION: u32 = 1;

pub struct Store {
    conn: Mutex<Connection>,
    max_recent_events: usize,
}

pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl Store {
    /// Opens (or creates) the backing sqlite file, applies schema migrations, and
    /// primes it for use. Durability: rollback journal + `synchronous=FULL` so a
    /// SIGKILL between requests cannot corrupt or silently drop committed writes.
    pub fn load(path: impl AsRef<Path>, max_recent_events: usize) -> rusqlite::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    rusqlite::Error::SqliteFailure(
                        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CANTOPEN),
                        Some(format!("failed to create db directory {}: {e}", parent.display())),
                    )
                })?;
            }
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS schema_meta (version INTEGER NOT NULL);
            CREATE TABLE IF NOT EXISTS observed_pipes (
                contract_id TEXT NOT NULL,
                pipe_id TEXT NOT NULL,
                data TEXT NOT NULL,
                PRIMARY KEY (contract_id, pipe_id)
            );
            CREATE TABLE IF NOT EXISTS closures (
                pipe_id TEXT PRIMARY KEY,
                data TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS signature_states (
                contract_id TEXT NOT NULL,
                pipe_id TEXT NOT NULL,
                for_principal TEXT NOT NULL,
                data TEXT NOT NULL,
                PRIMARY KEY (contract_id, pipe_id, for_principal)
            );
            CREATE TABLE IF NOT EXISTS dispute_attempts (
                attempt_id TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL,
                data TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS recorded_events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                data TEXT NOT NULL
            );
            ",
        )?;

        let version: Option<u32> = conn
            .query_row("SELECT version FROM schema_meta LIMIT 1", [], |r| r.get(0))
            .optional()?;
        if version.is_none() {
            conn.execute(
                "INSERT INTO schema_meta (version) VALUES (?1)",
                params![SCHEMA_VERSION],
            )?;
        }

        Ok(Self {
            conn: Mutex::new(conn),
            max_recent_events,
        })
    }

    pub fn get_snapshot(&self) -> rusqlite::Result<Snapshot> {
        Ok(Snapshot {
            version: SCHEMA_VERSION,
            updated_at: now_unix(),
            observed_pipes: self.list_observed_pipes()?,
            closures: self.list_closures()?,
            signature_states: self.list_signature_states()?,
            dispute_attempts: self.list_dispute_attempts(None)?,
            recent_events: self.list_recent_events()?,
        })
    }

    pub fn set_observed_pipe(&self, record: &ObservedPipe) -> rusqlite::Result<()> {
        let conn = self.conn.lock().unwrap();
        let data = serde_json::to_string(record).expect("ObservedPipe is always serializable");
        conn.execute(
            "INSERT INTO observed_pipes (contract_id, pipe_id, data) VALUES (?1, ?2, ?3)
             ON CONFLICT(contract_id, pipe_id) DO UPDATE SET data = excluded.data",
            params![record.contract_id, record.pipe_id, data],
        )?;
        tracing::debug!(pipe_id = %record.pipe_id, contract_id = %record.contract_id, "observed pipe upserted");
        Ok(())
    }

    pub fn get_observed_pipe(&self, contract_id: &str, pipe_id: &str) -> rusqlite::Result<Option<ObservedPipe>> {
        let conn = self.conn.lock().unwrap();
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM observed_pipes WHERE contract_id = ?1 AND pipe_id = ?2",
                params![contract_id, pipe_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(data.map(|d| serde_json::from_str(&d).expect("stored ObservedPipe is valid json")))
    }

    pub fn list_observed_pipes(&self) -> rusqlite::Result<Vec<ObservedPipe>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT data FROM observed_pipes")?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?).expect("stored ObservedPipe is valid json"));
        }
        Ok(out)
    }

    pub fn set_closure(&self, record: &Closure) -> rusqlite::Result<()> {
        let conn = self.conn.lock().unwrap();
        let data = serde_json::to_string(record).expect("Closure is always serializable");
        conn.execute(
            "INSERT INTO closures (pipe_id, data) VALUES (?1, ?2)
             ON CONFLICT(pipe_id) DO UPDATE SET data = excluded.data",
            params![record.pipe_id, data],
        )?;
        tracing::debug!(pipe_id = %record.pipe_id, "closure upserted");
        Ok(())
    }

    pub fn delete_closure(&self, pipe_id: &str) -> rusqlite::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM closures WHERE pipe_id = ?1", params![pipe_id])?;
        tracing::debug!(pipe_id = %pipe_id, "closure deleted");
        Ok(())
    }

    pub fn get_closure(&self, pipe_id: &str) -> rusqlite::Result<Option<Closure>> {
        let conn = self.conn.lock().unwrap();
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM closures WHERE pipe_id = ?1",
                params![pipe_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(data.map(|d| serde_json::from_str(&d).expect("stored Closure is valid json")))
    }

    pub fn list_closures(&self) -> rusqlite::Result<Vec<Closure>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT data FROM closures")?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?).expect("stored Closure is valid json"));
        }
        out.sort_by(|a: &Closure, b: &Closure| {
            a.expires_at
                .unwrap_or(u64::MAX)
                .cmp(&b.expires_at.unwrap_or(u64::MAX))
                .then_with(|| a.pipe_id.cmp(&b.pipe_id))
        });
        Ok(out)
    }

    pub fn set_signature_state(&self, record: &SignatureState) -> rusqlite::Result<()> {
        let conn = self.conn.lock().unwrap();
        let data = serde_json::to_string(record).expect("SignatureState is always serializable");
        conn.execute(
            "INSERT INTO signature_states (contract_id, pipe_id, for_principal, data)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(contract_id, pipe_id, for_principal) DO UPDATE SET data = excluded.data",
            params![record.contract_id, record.pipe_id, record.for_principal, data],
        )?;
        tracing::debug!(pipe_id = %record.pipe_id, for_principal = %record.for_principal, nonce = record.nonce, "signature state upserted");
        Ok(())
    }

    pub fn get_signature_state(
        &self,
        contract_id: &str,
        pipe_id: &str,
        for_principal: &str,
    ) -> rusqlite::Result<Option<SignatureState>> {
        let conn = self.conn.lock().unwrap();
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM signature_states WHERE contract_id = ?1 AND pipe_id = ?2 AND for_principal = ?3",
                params![contract_id, pipe_id, for_principal],
                |r| r.get(0),
            )
            .optional()?;
        Ok(data.map(|d| serde_json::from_str(&d).expect("stored SignatureState is valid json")))
    }

    pub fn get_signature_states_for_pipe(
        &self,
        contract_id: &str,
        pipe_id: &str,
    ) -> rusqlite::Result<Vec<SignatureState>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT data FROM signature_states WHERE contract_id = ?1 AND pipe_id = ?2",
        )?;
        let rows = stmt.query_map(params![contract_id, pipe_id], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?).expect("stored SignatureState is valid json"));
        }
        Ok(out)
    }

    pub fn list_signature_states(&self) -> rusqlite::Result<Vec<SignatureState>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT data FROM signature_states")?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?).expect("stored SignatureState is valid json"));
        }
        out.sort_by_key(|s: &SignatureState| std::cmp::Reverse(s.nonce));
        Ok(out)
    }

    pub fn set_dispute_attempt(&self, record: &DisputeAttempt) -> rusqlite::Result<()> {
        let conn = self.conn.lock().unwrap();
        let data = serde_json::to_string(record).expect("DisputeAttempt is always serializable");
        conn.execute(
            "INSERT INTO dispute_attempts (attempt_id, created_at, data) VALUES (?1, ?2, ?3)
             ON CONFLICT(attempt_id) DO UPDATE SET data = excluded.data, created_at = excluded.created_at",
            params![record.attempt_id, record.created_at as i64, data],
        )?;
        tracing::debug!(attempt_id = %record.attempt_id, success = record.success, "dispute attempt recorded");
        Ok(())
    }

    pub fn get_dispute_attempt(&self, attempt_id: &str) -> rusqlite::Result<Option<DisputeAttempt>> {
        let conn = self.conn.lock().unwrap();
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM dispute_attempts WHERE attempt_id = ?1",
                params![attempt_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(data.map(|d| serde_json::from_str(&d).expect("stored DisputeAttempt is valid json")))
    }

    pub fn list_dispute_attempts(&self, limit: Option<usize>) -> rusqlite::Result<Vec<DisputeAttempt>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT data FROM dispute_attempts ORDER BY created_at DESC")?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?).expect("stored DisputeAttempt is valid json"));
        }
        if let Some(limit) = limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    pub fn record_event(&self, record: &RecordedEvent) -> rusqlite::Result<()> {
        let conn = self.conn.lock().unwrap();
        let data = serde_json::to_string(record).expect("RecordedEvent is always serializable");
        conn.execute("INSERT INTO recorded_events (data) VALUES (?1)", params![data])?;
        // Evict oldest entries beyond the bounded ring size, in the same critical section.
        conn.execute(
            "DELETE FROM recorded_events WHERE seq IN (
                SELECT seq FROM recorded_events ORDER BY seq DESC LIMIT -1 OFFSET ?1
            )",
            params![self.max_recent_events as i64],
        )?;
        Ok(())
    }

    pub fn list_recent_events(&self) -> rusqlite::Result<Vec<RecordedEvent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT data FROM recorded_events ORDER BY seq DESC")?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?).expect("stored RecordedEvent is valid json"));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PipeKey;

    fn sample_pipe(contract_id: &str, pipe_id: &str) -> ObservedPipe {
        ObservedPipe {
            contract_id: contract_id.to_string(),
            pipe_id: pipe_id.to_string(),
            key: PipeKey::canonicalize("SP1", "SP2", None),
            balance_low: "0".to_string(),
            balance_high: "0".to_string(),
            pending_low: None,
            pending_high: None,
            expires_at: None,
            nonce: 0,
            closer: None,
            event: "fund-pipe".to_string(),
            txid: None,
            block_height: None,
            updated_at: now_unix(),
        }
    }

    #[test]
    fn upsert_and_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::load(dir.path().join("t.db"), 10).unwrap();
        let pipe = sample_pipe("SP0.contract", "abc");
        store.set_observed_pipe(&pipe).unwrap();
        let got = store.get_observed_pipe("SP0.contract", "abc").unwrap().unwrap();
        assert_eq!(got.balance_low, "0");
    }

    #[test]
    fn ring_buffer_evicts_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::load(dir.path().join("t.db"), 3).unwrap();
        for i in 0..10 {
            store
                .record_event(&RecordedEvent {
                    seq: 0,
                    contract_id: "c".to_string(),
                    pipe_id: None,
                    event: format!("e{i}"),
                    txid: None,
                    block_height: None,
                    recorded_at: now_unix(),
                    raw: None,
                })
                .unwrap();
        }
        let events = store.list_recent_events().unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].event, "e9");
        assert_eq!(events[2].event, "e7");
    }

    #[test]
    fn restart_durability() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");
        {
            let store = Store::load(&path, 10).unwrap();
            store.set_observed_pipe(&sample_pipe("SP0.c", "pid")).unwrap();
        }
        let store = Store::load(&path, 10).unwrap();
        let snap = store.get_snapshot().unwrap();
        assert_eq!(snap.observed_pipes.len(), 1);
    }
}

use std::collections::{BTreeMap, HashMap};

use rusqlite::{params, Connection, OptionalExtension};
use teller_config::Config;
use teller_contracts::{SubmissionRecord, SubmissionStatus};

#[derive(Default)]
pub struct MemoryStore {
    submissions: BTreeMap<String, SubmissionRecord>,
    by_action: HashMap<String, String>,
}

pub struct SqliteStore {
    conn: Connection,
}

/// Submission records, keyed by transaction hash and by action id.
pub enum StoreBackend {
    Memory(MemoryStore),
    Sqlite(SqliteStore),
}

impl StoreBackend {
    pub fn from_config(cfg: &Config) -> Result<Self, String> {
        if cfg.store.kind == "sqlite" {
            let sqlite_path = cfg
                .store
                .sqlite_path
                .clone()
                .ok_or_else(|| "store.sqlite_path is required for sqlite store".to_string())?;
            Ok(StoreBackend::Sqlite(SqliteStore::new(&sqlite_path)?))
        } else {
            Ok(StoreBackend::Memory(MemoryStore::default()))
        }
    }

    pub fn get_submission(&self, tx_hash: &str) -> Option<SubmissionRecord> {
        match self {
            StoreBackend::Memory(store) => store.submissions.get(tx_hash).cloned(),
            StoreBackend::Sqlite(store) => store.get_submission(tx_hash).ok().flatten(),
        }
    }

    pub fn find_by_action(&self, action_id: &str) -> Option<SubmissionRecord> {
        match self {
            StoreBackend::Memory(store) => store
                .by_action
                .get(action_id)
                .and_then(|tx| store.submissions.get(tx))
                .cloned(),
            StoreBackend::Sqlite(store) => store.find_by_action(action_id).ok().flatten(),
        }
    }

    pub fn save_submission(&mut self, record: &SubmissionRecord) -> Result<(), String> {
        match self {
            StoreBackend::Memory(store) => {
                store
                    .by_action
                    .insert(record.action_id.clone(), record.tx_hash.clone());
                store
                    .submissions
                    .insert(record.tx_hash.clone(), record.clone());
                Ok(())
            }
            StoreBackend::Sqlite(store) => store.save_submission(record),
        }
    }

    /// Reads, changes and writes back one record in a single step, so
    /// concurrent updates touching different fields both survive.
    pub fn update_submission<F>(
        &mut self,
        tx_hash: &str,
        change: F,
    ) -> Result<Option<SubmissionRecord>, String>
    where
        F: FnOnce(&mut SubmissionRecord),
    {
        let Some(mut record) = self.get_submission(tx_hash) else {
            return Ok(None);
        };
        change(&mut record);
        self.save_submission(&record)?;
        Ok(Some(record))
    }

    /// Submissions whose outcome has not been observed yet.
    pub fn unsettled(&self) -> Result<Vec<SubmissionRecord>, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store
                .submissions
                .values()
                .filter(|r| !r.status.is_terminal())
                .cloned()
                .collect()),
            StoreBackend::Sqlite(store) => store.unsettled(),
        }
    }
}

impl SqliteStore {
    pub fn new(path: &str) -> Result<Self, String> {
        let conn = Connection::open(path).map_err(|e| e.to_string())?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS submissions (
                tx_hash TEXT PRIMARY KEY,
                action_id TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL,
                record_json TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            ",
        )
        .map_err(|e| e.to_string())?;
        Ok(Self { conn })
    }

    fn decode(json: Option<String>) -> Result<Option<SubmissionRecord>, String> {
        match json {
            Some(v) => serde_json::from_str(&v).map(Some).map_err(|e| e.to_string()),
            None => Ok(None),
        }
    }

    fn get_submission(&self, tx_hash: &str) -> Result<Option<SubmissionRecord>, String> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT record_json FROM submissions WHERE tx_hash = ?1",
                params![tx_hash],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| e.to_string())?;
        Self::decode(json)
    }

    fn find_by_action(&self, action_id: &str) -> Result<Option<SubmissionRecord>, String> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT record_json FROM submissions WHERE action_id = ?1",
                params![action_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| e.to_string())?;
        Self::decode(json)
    }

    fn save_submission(&mut self, record: &SubmissionRecord) -> Result<(), String> {
        let json = serde_json::to_string(record).map_err(|e| e.to_string())?;
        self.conn
            .execute(
                "
                INSERT INTO submissions(tx_hash, action_id, status, record_json, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(tx_hash) DO UPDATE SET
                    status=excluded.status,
                    record_json=excluded.record_json,
                    updated_at=excluded.updated_at
                ",
                params![
                    record.tx_hash,
                    record.action_id,
                    record.status.as_str(),
                    json,
                    record.updated_at
                ],
            )
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    fn unsettled(&self) -> Result<Vec<SubmissionRecord>, String> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT record_json FROM submissions WHERE status IN ('in_flight', 'unknown') ORDER BY tx_hash",
            )
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| e.to_string())?;
        let mut out = Vec::new();
        for row in rows {
            let json = row.map_err(|e| e.to_string())?;
            out.push(serde_json::from_str(&json).map_err(|e| e.to_string())?);
        }
        Ok(out)
    }
}

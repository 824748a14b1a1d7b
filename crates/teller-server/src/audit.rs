use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use teller_kernel::sha256_hex;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Append-only JSONL audit log. Each line carries the hash of the previous
/// line, so any edit breaks the chain.
pub struct AuditJsonl {
    file: Arc<Mutex<tokio::fs::File>>,
    sqlite: Option<Arc<Mutex<Connection>>>,
    last_hash: Arc<Mutex<Option<String>>>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AuditRecord {
    pub audit_id: String,
    pub session_id: String,
    pub correlation_id: String,
    pub stage: String,
    pub result: String,
    pub code: String,
    pub ts: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_hash: Option<String>,
    pub record_hash: String,
}

impl AuditRecord {
    pub fn new(
        session_id: &str,
        correlation_id: &str,
        stage: &str,
        result: &str,
        code: &str,
    ) -> Self {
        Self {
            audit_id: format!("audit_{}", uuid::Uuid::new_v4().as_simple()),
            session_id: session_id.to_string(),
            correlation_id: correlation_id.to_string(),
            stage: stage.to_string(),
            result: result.to_string(),
            code: code.to_string(),
            ts: Utc::now().to_rfc3339(),
            detail: None,
            prev_hash: None,
            record_hash: String::new(),
        }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }

    /// Hash over the record with `record_hash` blanked. `prev_hash` is part
    /// of the sealed content.
    fn seal(&self) -> Result<String, serde_json::Error> {
        let mut unsealed = self.clone();
        unsealed.record_hash.clear();
        Ok(sha256_hex(serde_json::to_string(&unsealed)?.as_bytes()))
    }
}

impl AuditJsonl {
    pub async fn new(path: &str, sqlite_path: Option<&str>) -> Result<Self, String> {
        let last_hash = std::fs::read_to_string(path).ok().and_then(|text| {
            text.lines().rev().find_map(|line| {
                serde_json::from_str::<Value>(line).ok().and_then(|v| {
                    v.get("record_hash")
                        .and_then(|hash| hash.as_str())
                        .map(|s| s.to_string())
                })
            })
        });

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| e.to_string())?;

        let sqlite = match sqlite_path {
            Some(path) => {
                let conn = Connection::open(path).map_err(|e| e.to_string())?;
                conn.execute_batch(
                    "
                    CREATE TABLE IF NOT EXISTS audit_records (
                        audit_id TEXT PRIMARY KEY,
                        session_id TEXT NOT NULL,
                        correlation_id TEXT NOT NULL,
                        stage TEXT NOT NULL,
                        result TEXT NOT NULL,
                        code TEXT NOT NULL,
                        ts TEXT NOT NULL,
                        record_json TEXT NOT NULL
                    );
                    ",
                )
                .map_err(|e| e.to_string())?;
                Some(Arc::new(Mutex::new(conn)))
            }
            None => None,
        };

        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            sqlite,
            last_hash: Arc::new(Mutex::new(last_hash)),
        })
    }

    /// Best effort: a failed write is logged and never fails the caller.
    pub async fn append(&self, mut rec: AuditRecord) {
        let mut last_hash = self.last_hash.lock().await;
        rec.prev_hash = last_hash.clone();
        match rec.seal() {
            Ok(hash) => rec.record_hash = hash,
            Err(e) => {
                tracing::warn!(error = %e, "audit record not serializable");
                return;
            }
        }
        let line = match serde_json::to_string(&rec) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "audit record not serializable");
                return;
            }
        };

        let mut file = self.file.lock().await;
        let written = async {
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
            file.flush().await
        }
        .await;
        if let Err(e) = written {
            tracing::warn!(error = %e, stage = %rec.stage, "audit append failed");
            return;
        }
        *last_hash = Some(rec.record_hash.clone());
        drop(file);
        drop(last_hash);

        if let Some(sqlite) = &self.sqlite {
            let conn = sqlite.lock().await;
            if let Err(e) = conn.execute(
                "
                INSERT OR REPLACE INTO audit_records
                (audit_id, session_id, correlation_id, stage, result, code, ts, record_json)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ",
                params![
                    rec.audit_id,
                    rec.session_id,
                    rec.correlation_id,
                    rec.stage,
                    rec.result,
                    rec.code,
                    rec.ts,
                    line
                ],
            ) {
                tracing::warn!(error = %e, "audit sqlite mirror failed");
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainReport {
    pub records: usize,
    pub sessions: BTreeSet<String>,
    pub head: Option<String>,
}

impl fmt::Display for ChainReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "audit chain verified: {} records across {} sessions",
            self.records,
            self.sessions.len()
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("audit log unreadable: {0}")]
    Unreadable(String),
    #[error("line {line}: not an audit record ({detail})")]
    Malformed { line: usize, detail: String },
    #[error("line {line} ({stage}/{code}, session {session}): {reason}")]
    Broken {
        line: usize,
        session: String,
        stage: String,
        code: String,
        reason: String,
    },
}

/// Walks the log from its first line. The first record must not point back,
/// every later record must point at its predecessor, and every record must
/// hash to what it claims.
pub fn verify_audit_chain(path: &str) -> Result<ChainReport, ChainError> {
    let text = std::fs::read_to_string(path).map_err(|e| ChainError::Unreadable(e.to_string()))?;
    let mut report = ChainReport {
        records: 0,
        sessions: BTreeSet::new(),
        head: None,
    };

    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let line_no = idx + 1;
        let rec: AuditRecord = serde_json::from_str(line).map_err(|e| ChainError::Malformed {
            line: line_no,
            detail: e.to_string(),
        })?;
        let broken = |reason: String| ChainError::Broken {
            line: line_no,
            session: if rec.session_id.is_empty() {
                "-".to_string()
            } else {
                rec.session_id.clone()
            },
            stage: rec.stage.clone(),
            code: rec.code.clone(),
            reason,
        };

        match (&report.head, &rec.prev_hash) {
            (None, Some(claimed)) => {
                return Err(broken(format!("first record points back at {claimed}")));
            }
            (Some(head), claimed) if claimed.as_ref() != Some(head) => {
                return Err(broken(format!(
                    "links to {} but the previous record is {head}",
                    claimed.as_deref().unwrap_or("nothing")
                )));
            }
            _ => {}
        }
        let sealed = rec
            .seal()
            .map_err(|e| broken(format!("cannot re-derive hash: {e}")))?;
        if sealed != rec.record_hash {
            return Err(broken(format!(
                "content was altered (hash {sealed}, recorded {})",
                rec.record_hash
            )));
        }

        if !rec.session_id.is_empty() {
            report.sessions.insert(rec.session_id.clone());
        }
        report.head = Some(rec.record_hash);
        report.records += 1;
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_path(name: &str) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        std::env::temp_dir()
            .join(format!("teller-{name}-{nanos}.jsonl"))
            .to_string_lossy()
            .to_string()
    }

    #[tokio::test]
    async fn chain_survives_reopen_and_detects_tampering() {
        let path = temp_path("audit");
        {
            let audit = AuditJsonl::new(&path, None).await.unwrap();
            audit
                .append(AuditRecord::new("s1", "act_1", "gate", "pending", "gate.pending"))
                .await;
        }
        let audit = AuditJsonl::new(&path, None).await.unwrap();
        audit
            .append(
                AuditRecord::new("s1", "act_1", "gate", "cancelled", "gate.cancelled")
                    .with_detail(json!({"function": "tradeNFT"})),
            )
            .await;
        let report = verify_audit_chain(&path).unwrap();
        assert_eq!(report.records, 2);
        assert_eq!(report.to_string(), "audit chain verified: 2 records across 1 sessions");

        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, text.replacen("cancelled", "confirmed", 1)).unwrap();
        match verify_audit_chain(&path).unwrap_err() {
            ChainError::Broken {
                line,
                session,
                stage,
                ..
            } => {
                assert_eq!(line, 2);
                assert_eq!(session, "s1");
                assert_eq!(stage, "gate");
            }
            other => panic!("expected a broken link, got {other:?}"),
        }
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn truncated_head_is_reported_as_a_dangling_first_record() {
        let path = temp_path("audit-head");
        let audit = AuditJsonl::new(&path, None).await.unwrap();
        audit
            .append(AuditRecord::new("s1", "act_1", "gate", "pending", "gate.pending"))
            .await;
        audit
            .append(AuditRecord::new("s2", "act_2", "execute", "submitted", "ledger.submitted"))
            .await;

        let text = std::fs::read_to_string(&path).unwrap();
        let second = text.lines().nth(1).unwrap().to_string();
        std::fs::write(&path, format!("{second}\n")).unwrap();
        let err = verify_audit_chain(&path).unwrap_err();
        assert!(
            matches!(&err, ChainError::Broken { line: 1, session, .. } if session == "s2"),
            "{err}"
        );
        assert!(err.to_string().contains("first record points back"));
        let _ = std::fs::remove_file(path);
    }
}

//! Audit trail for booking operations.
//!
//! Recording is best effort: a failed write is logged by the engine and never
//! undoes the booking operation that produced it.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use ulid::Ulid;

use crate::model::Ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    BookingCreate,
    BookingApprove,
    BookingReject,
    BookingAssignVehicle,
    BookingAssignDriver,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    pub actor_id: Ulid,
    pub action: AuditAction,
    pub metadata: serde_json::Value,
    pub at: Ms,
}

#[derive(Debug)]
pub enum AuditError {
    Io(std::io::Error),
    Encode(serde_json::Error),
}

impl std::fmt::Display for AuditError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditError::Io(e) => write!(f, "audit write failed: {e}"),
            AuditError::Encode(e) => write!(f, "audit encode failed: {e}"),
        }
    }
}

impl std::error::Error for AuditError {}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: AuditEntry) -> Result<(), AuditError>;
}

/// Emits audit entries on the `audit` tracing target.
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, entry: AuditEntry) -> Result<(), AuditError> {
        let metadata = serde_json::to_string(&entry.metadata).map_err(AuditError::Encode)?;
        tracing::info!(
            target: "audit",
            actor = %entry.actor_id,
            action = ?entry.action,
            at = entry.at,
            %metadata,
            "booking audit"
        );
        Ok(())
    }
}

/// Appends one JSON object per line to a file.
pub struct JsonlAuditLog {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
}

impl JsonlAuditLog {
    pub async fn open(path: &Path) -> std::io::Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AuditSink for JsonlAuditLog {
    async fn record(&self, entry: AuditEntry) -> Result<(), AuditError> {
        let mut line = serde_json::to_vec(&entry).map_err(AuditError::Encode)?;
        line.push(b'\n');
        let mut file = self.file.lock().await;
        file.write_all(&line).await.map_err(AuditError::Io)?;
        file.flush().await.map_err(AuditError::Io)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("fleetbook_test_audit");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[test]
    fn action_names_match_log_format() {
        let json = serde_json::to_string(&AuditAction::BookingAssignVehicle).unwrap();
        assert_eq!(json, "\"BOOKING_ASSIGN_VEHICLE\"");
    }

    #[tokio::test]
    async fn jsonl_appends_one_line_per_entry() {
        let path = tmp_path("audit.jsonl");
        let log = JsonlAuditLog::open(&path).await.unwrap();
        let actor = Ulid::new();
        for action in [AuditAction::BookingCreate, AuditAction::BookingApprove] {
            log.record(AuditEntry {
                actor_id: actor,
                action,
                metadata: serde_json::json!({ "booking_id": "x" }),
                at: 1,
            })
            .await
            .unwrap();
        }

        let raw = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<serde_json::Value> = raw
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["action"], "BOOKING_APPROVE");
        assert_eq!(lines[0]["actor_id"], actor.to_string());

        let _ = std::fs::remove_file(&path);
    }
}

use aimatch_core::{Paths, Result, TaskId, TaskStatus};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use tracing::error;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    TaskVerdict {
        task_id: TaskId,
        status: TaskStatus,
        timestamp_ms: i64,
        duration_ms: Option<u64>,
    },
    TaskFailed {
        task_id: TaskId,
        error: String,
        session_lost: bool,
        timestamp_ms: i64,
    },
    RateLimited {
        task_id: TaskId,
        cooldown_secs: u64,
        timestamp_ms: i64,
    },
    SessionRestarted {
        succeeded: bool,
        error: Option<String>,
        timestamp_ms: i64,
    },
    SyncCompleted {
        direction: String,
        count: usize,
        error: Option<String>,
        timestamp_ms: i64,
    },
}

/// Append-only JSONL audit trail, one file per UTC day.
#[derive(Debug, Clone)]
pub struct AuditLogger {
    paths: Paths,
}

impl AuditLogger {
    pub fn new(paths: Paths) -> Self {
        Self { paths }
    }

    pub fn log_verdict(&self, task_id: TaskId, status: TaskStatus, duration_ms: Option<u64>) -> Result<()> {
        self.write_event(AuditEvent::TaskVerdict {
            task_id,
            status,
            timestamp_ms: Utc::now().timestamp_millis(),
            duration_ms,
        })
    }

    pub fn log_failure(&self, task_id: TaskId, error: &str, session_lost: bool) -> Result<()> {
        self.write_event(AuditEvent::TaskFailed {
            task_id,
            error: error.to_string(),
            session_lost,
            timestamp_ms: Utc::now().timestamp_millis(),
        })
    }

    pub fn log_rate_limited(&self, task_id: TaskId, cooldown_secs: u64) -> Result<()> {
        self.write_event(AuditEvent::RateLimited {
            task_id,
            cooldown_secs,
            timestamp_ms: Utc::now().timestamp_millis(),
        })
    }

    pub fn log_session_restart(&self, succeeded: bool, error: Option<String>) -> Result<()> {
        self.write_event(AuditEvent::SessionRestarted {
            succeeded,
            error,
            timestamp_ms: Utc::now().timestamp_millis(),
        })
    }

    pub fn log_sync(&self, direction: &str, count: usize, error: Option<String>) -> Result<()> {
        self.write_event(AuditEvent::SyncCompleted {
            direction: direction.to_string(),
            count,
            error,
            timestamp_ms: Utc::now().timestamp_millis(),
        })
    }

    fn write_event(&self, event: AuditEvent) -> Result<()> {
        let log_file = self.current_log_file_path();

        if let Some(parent) = log_file.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)?;

        let json = serde_json::to_string(&event)?;
        writeln!(file, "{}", json)?;

        Ok(())
    }

    fn current_log_file_path(&self) -> PathBuf {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        self.paths.audit_dir().join(format!("{}.jsonl", today))
    }

    /// Read audit events from a specific date (`YYYY-MM-DD`).
    pub fn read_events(&self, date: &str) -> Result<Vec<AuditEvent>> {
        let log_file = self.paths.audit_dir().join(format!("{}.jsonl", date));

        if !log_file.exists() {
            return Ok(Vec::new());
        }

        let content = std::fs::read_to_string(&log_file)?;
        let mut events = Vec::new();

        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditEvent>(line) {
                Ok(event) => events.push(event),
                Err(e) => {
                    error!(error = %e, line = %line, "Failed to parse audit event");
                }
            }
        }

        Ok(events)
    }

    pub fn read_today(&self) -> Result<Vec<AuditEvent>> {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        self.read_events(&today)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_audit_logger() {
        let temp_dir = TempDir::new().unwrap();
        let paths = Paths::with_base(temp_dir.path().to_path_buf());
        let logger = AuditLogger::new(paths);

        logger.log_verdict(TaskId(7), TaskStatus::Ignored, Some(1200)).unwrap();
        logger.log_rate_limited(TaskId(8), 7200).unwrap();

        let events = logger.read_today().unwrap();
        assert_eq!(events.len(), 2);

        match &events[0] {
            AuditEvent::TaskVerdict { task_id, status, .. } => {
                assert_eq!(*task_id, TaskId(7));
                assert_eq!(*status, TaskStatus::Ignored);
            }
            _ => panic!("Expected TaskVerdict event"),
        }
        assert!(matches!(events[1], AuditEvent::RateLimited { cooldown_secs: 7200, .. }));
    }

    #[test]
    fn test_missing_day_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let logger = AuditLogger::new(Paths::with_base(temp_dir.path().to_path_buf()));
        assert!(logger.read_events("1999-01-01").unwrap().is_empty());
    }
}

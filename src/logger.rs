//! Transfer event log sinks

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::progress::ProgressSnapshot;
use crate::transfer::{TransferEvent, TransferOutcome};

pub trait Logger: Send + Sync {
    fn transfer_started(&self, _source: &str, _destination: &str) {}
    fn transfer_finished(&self, _event: &TransferEvent) {}
    fn enumeration_error(&self, _rel_path: &str, _msg: &str) {}
    fn run_completed(&self, _totals: &ProgressSnapshot, _seconds: f64) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

/// Timestamped line-per-event text log.
pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())
            .map_err(|e| crate::error::TransferError::io(path.as_ref(), e))?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        let mut f = self.file.lock();
        let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
    }
}

impl Logger for TextLogger {
    fn transfer_started(&self, source: &str, destination: &str) {
        self.line(&format!("START src={source} dst={destination}"));
    }

    fn transfer_finished(&self, event: &TransferEvent) {
        let outcome = match event.outcome {
            TransferOutcome::Completed => "DONE",
            TransferOutcome::Skipped => "SKIP",
            TransferOutcome::Failed => "FAIL",
        };
        match &event.error {
            Some(e) => self.line(&format!(
                "{outcome} src={} dst={} err={e}",
                event.source, event.destination
            )),
            None => self.line(&format!(
                "{outcome} src={} dst={}",
                event.source, event.destination
            )),
        }
    }

    fn enumeration_error(&self, rel_path: &str, msg: &str) {
        self.line(&format!("ENUM-ERROR rel={rel_path} msg={msg}"));
    }

    fn run_completed(&self, totals: &ProgressSnapshot, seconds: f64) {
        self.line(&format!(
            "COMPLETED files={} skipped={} failed={} bytes={} seconds={seconds:.3}",
            totals.files_transferred, totals.files_skipped, totals.files_failed, totals.bytes
        ));
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct TransferLogRecord {
    pub timestamp: String,
    pub source: String,
    pub destination: String,
    pub outcome: String,
    pub error: Option<String>,
}

/// One JSON record per terminal transfer event, append-only.
pub struct JsonlLogger {
    file: Mutex<File>,
}

impl JsonlLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())
            .map_err(|e| crate::error::TransferError::io(path.as_ref(), e))?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }
}

impl Logger for JsonlLogger {
    fn transfer_finished(&self, event: &TransferEvent) {
        let record = TransferLogRecord {
            timestamp: event.end_time.to_rfc3339(),
            source: event.source.clone(),
            destination: event.destination.clone(),
            outcome: match event.outcome {
                TransferOutcome::Completed => "completed".to_string(),
                TransferOutcome::Skipped => "skipped".to_string(),
                TransferOutcome::Failed => "failed".to_string(),
            },
            error: event.error.clone(),
        };
        let mut f = self.file.lock();
        if serde_json::to_writer(&mut *f, &record).is_ok() {
            let _ = f.write_all(b"\n");
            let _ = f.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufRead;

    fn sample_event(outcome: TransferOutcome) -> TransferEvent {
        TransferEvent {
            source: "file:///tmp/a".into(),
            destination: "https://e/c/a".into(),
            start_time: Utc::now(),
            end_time: Utc::now(),
            outcome,
            error: None,
        }
    }

    #[test]
    fn jsonl_records_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let logger = JsonlLogger::new(&path).unwrap();
        logger.transfer_finished(&sample_event(TransferOutcome::Completed));
        logger.transfer_finished(&sample_event(TransferOutcome::Skipped));

        let file = std::fs::File::open(&path).unwrap();
        let records: Vec<TransferLogRecord> = std::io::BufReader::new(file)
            .lines()
            .map(|l| serde_json::from_str(&l.unwrap()).unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].outcome, "completed");
        assert_eq!(records[1].outcome, "skipped");
    }

    #[test]
    fn text_logger_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.txt");
        let logger = TextLogger::new(&path).unwrap();
        logger.transfer_started("src", "dst");
        logger.transfer_finished(&sample_event(TransferOutcome::Failed));
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("START src=src dst=dst"));
        assert!(text.contains("FAIL"));
    }
}

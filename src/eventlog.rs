//! Append-only NDJSON event log, one file per call.
//!
//! The file is opened lazily on first write and closed exactly once; writes
//! after close are dropped.  Records always carry `timestamp`, `streamId`,
//! `callId` and `event`, with per-event fields merged in.

use serde_json::{Map, Value};
use std::path::PathBuf;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, error};

pub struct EventLog {
    dir: PathBuf,
    stream_sid: String,
    call_sid: String,
    writer: Option<BufWriter<File>>,
    closed: bool,
}

impl EventLog {
    pub fn new(dir: PathBuf, stream_sid: &str, call_sid: &str) -> Self {
        Self {
            dir,
            stream_sid: stream_sid.to_string(),
            call_sid: call_sid.to_string(),
            writer: None,
            closed: false,
        }
    }

    /// Append one event record.  `fields` must be a JSON object (or Null for
    /// no extra fields); best-effort, never propagates I/O failures.
    pub async fn write(&mut self, event: &str, fields: Value) {
        if self.closed {
            debug!(event, "event log already closed; record dropped");
            return;
        }
        let mut record = Map::new();
        let ts = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();
        record.insert("timestamp".to_string(), Value::String(ts));
        record.insert(
            "streamId".to_string(),
            Value::String(self.stream_sid.clone()),
        );
        record.insert("callId".to_string(), Value::String(self.call_sid.clone()));
        record.insert("event".to_string(), Value::String(event.to_string()));
        if let Value::Object(extra) = fields {
            record.extend(extra);
        }

        let writer = match self.writer_mut().await {
            Some(w) => w,
            None => return,
        };
        let mut line = Value::Object(record).to_string();
        line.push('\n');
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            error!(error=%e, "failed to append event log record");
        }
    }

    async fn writer_mut(&mut self) -> Option<&mut BufWriter<File>> {
        if self.writer.is_none() {
            if let Err(e) = fs::create_dir_all(&self.dir).await {
                error!(error=%e, dir=?self.dir, "failed to create event log directory");
                return None;
            }
            let path = self.dir.join(format!("{}.ndjson", self.call_sid));
            match OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
            {
                Ok(f) => self.writer = Some(BufWriter::new(f)),
                Err(e) => {
                    error!(error=%e, path=?path, "failed to open event log file");
                    return None;
                }
            }
        }
        self.writer.as_mut()
    }

    /// Flush and close.  Idempotent; later `write` calls become no-ops.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(mut w) = self.writer.take() {
            if let Err(e) = w.flush().await {
                error!(error=%e, "failed to flush event log");
            }
            if let Err(e) = w.shutdown().await {
                error!(error=%e, "failed to close event log");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn writes_records_and_closes_once() {
        let dir = std::env::temp_dir().join(format!("eventlog-test-{}", uuid::Uuid::new_v4()));
        let mut log = EventLog::new(dir.clone(), "MZ1", "CA1");
        log.write("start", json!({"tenantId": "t1"})).await;
        log.write("vad_event", json!({"kind": "speech_started"}))
            .await;
        log.close().await;
        assert!(log.is_closed());
        // second close is a no-op
        log.close().await;
        // writes after close are dropped
        log.write("stop", Value::Null).await;

        let content = tokio::fs::read_to_string(dir.join("CA1.ndjson"))
            .await
            .unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "start");
        assert_eq!(first["streamId"], "MZ1");
        assert_eq!(first["callId"], "CA1");
        assert_eq!(first["tenantId"], "t1");
        assert!(first["timestamp"].as_str().unwrap().contains('T'));
        tokio::fs::remove_dir_all(dir).await.unwrap();
    }
}

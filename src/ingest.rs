//! Event stream input.
//!
//! Traces are stored as JSON lines, one [`TraceEvent`] per line, already in
//! timestamp order. Converting raw ftrace text into this form happens upstream.
//!
//! Binder events may be written either decoded (`"type":"binder"`) or with the
//! tracepoint's raw fields (`"type":"binder_transaction"`), which are decoded
//! here through [`RawBinderTransaction`].

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use serde_json::Value;

use crate::events::{BinderTransaction, RawBinderTransaction, TraceEvent};

/// Type tag of a binder line carrying raw tracepoint fields.
pub const RAW_BINDER_TYPE: &str = "binder_transaction";

/// Decode one line into an event.
pub fn decode_line(text: &str) -> Result<TraceEvent> {
    let value: Value = serde_json::from_str(text)?;
    if value.get("type").and_then(Value::as_str) == Some(RAW_BINDER_TYPE) {
        let raw: RawBinderTransaction = serde_json::from_value(value)?;
        return Ok(TraceEvent::Binder(BinderTransaction::from(raw)));
    }
    Ok(serde_json::from_value(value)?)
}

/// Lazily decodes events from a JSON-lines source.
pub struct EventReader<R> {
    reader: R,
    line: String,
    line_no: usize,
}

impl<R: BufRead> EventReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
            line_no: 0,
        }
    }
}

impl EventReader<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open event stream {}", path.display()))?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: BufRead> Iterator for EventReader<R> {
    type Item = Result<TraceEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.line.clear();
            self.line_no += 1;
            match self.reader.read_line(&mut self.line) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(e) => {
                    return Some(
                        Err(e).with_context(|| format!("Failed to read line {}", self.line_no)),
                    )
                }
            }

            let text = self.line.trim();
            if text.is_empty() {
                continue;
            }
            return Some(
                decode_line(text)
                    .with_context(|| format!("Invalid event on line {}", self.line_no)),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    use crate::events::BinderKind;

    #[test]
    fn test_reads_events_and_skips_blank_lines() {
        let input = r#"{"type":"cpu_idle","ts":1,"cpu":0,"state":1}

{"type":"gpu_util","ts":2,"freq":177000000,"util":12.5}
"#;
        let events: Vec<TraceEvent> = EventReader::new(Cursor::new(input))
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].ts(), 2);
    }

    #[test]
    fn test_bad_line_reports_line_number() {
        let input = "{\"type\":\"cpu_idle\",\"ts\":1,\"cpu\":0,\"state\":1}\n{\"type\":\"bogus\"}\n";
        let mut reader = EventReader::new(Cursor::new(input));
        assert!(reader.next().unwrap().is_ok());
        let err = reader.next().unwrap().unwrap_err();
        assert!(err.to_string().contains("line 2"));
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_raw_binder_fields_are_decoded() {
        let input = r#"{"type":"binder_transaction","ts":10,"cpu":1,"pid":100,"reply":0,"flags":0,"code":3,"to_proc":200,"to_thread":0}
{"type":"binder_transaction","ts":11,"cpu":1,"pid":100,"reply":0,"flags":1,"to_proc":200,"to_thread":201}
{"type":"binder_transaction","ts":12,"cpu":4,"pid":201,"reply":1,"flags":1,"to_proc":100}
"#;
        let events: Vec<TraceEvent> = EventReader::new(Cursor::new(input))
            .collect::<Result<_>>()
            .unwrap();
        let txs: Vec<&BinderTransaction> = events
            .iter()
            .map(|e| match e {
                TraceEvent::Binder(tx) => tx,
                other => panic!("unexpected event {other:?}"),
            })
            .collect();

        assert_eq!((txs[0].kind, txs[0].target_pid, txs[0].code), (BinderKind::Call, 200, 3));
        assert_eq!((txs[1].kind, txs[1].target_pid), (BinderKind::Async, 201));
        assert_eq!((txs[2].kind, txs[2].target_pid), (BinderKind::Reply, 100));
    }

    #[test]
    fn test_raw_binder_missing_field_is_rejected() {
        let input = "{\"type\":\"binder_transaction\",\"ts\":10,\"cpu\":1,\"pid\":100}\n";
        let err = EventReader::new(Cursor::new(input)).next().unwrap().unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }
}

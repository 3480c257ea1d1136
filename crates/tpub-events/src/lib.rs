//! Event logging for tpub runs.
//!
//! An append-only JSONL log of version bumps, affected-set computations and
//! worker pool activity, with filtering by package.
//!
//! # Example
//!
//! ```
//! use tpub_events::EventLog;
//! use tpub_types::{EventType, PublishEvent};
//!
//! let mut log = EventLog::new();
//! log.record(PublishEvent::now(
//!     EventType::VersionBumped { version: "3.5.1".to_string() },
//!     "jquery@3",
//! ));
//! assert_eq!(log.events_for_package("jquery@3").len(), 1);
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tpub_types::{EventType, PublishEvent};

/// Default events file name
pub const EVENTS_FILE: &str = "events.jsonl";

/// Get the events file path for a state directory
pub fn events_path(state_dir: &Path) -> PathBuf {
    state_dir.join(EVENTS_FILE)
}

/// In-memory buffer of events, flushed to disk with [`EventLog::write_to_file`].
#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<PublishEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn record(&mut self, event: PublishEvent) {
        self.events.push(event);
    }

    /// Append all recorded events to `path`, one JSON object per line.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create events dir {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open events file {}", path.display()))?;

        let mut writer = BufWriter::new(file);
        for event in &self.events {
            let line = serde_json::to_string(event).context("failed to serialize event to JSON")?;
            writeln!(writer, "{line}").context("failed to write event line")?;
        }
        writer.flush().context("failed to flush events file")?;

        Ok(())
    }

    /// Read all events from a JSONL file. Blank lines are skipped; a missing
    /// file is an empty log.
    pub fn read_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }

        let file = File::open(path)
            .with_context(|| format!("failed to open events file {}", path.display()))?;

        let mut events = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| {
                format!("failed to read line from events file {}", path.display())
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let event: PublishEvent = serde_json::from_str(&line).with_context(|| {
                format!("failed to parse event JSON at {}:{}", path.display(), index + 1)
            })?;
            events.push(event);
        }

        Ok(Self { events })
    }

    pub fn events_for_package(&self, package: &str) -> Vec<&PublishEvent> {
        self.events.iter().filter(|e| e.package == package).collect()
    }

    /// Packages whose job was given up on after crash recovery, in log order.
    pub fn crashed_packages(&self) -> Vec<&str> {
        self.events
            .iter()
            .filter(|e| matches!(e.event_type, EventType::JobCrashed { .. }))
            .map(|e| e.package.as_str())
            .collect()
    }

    pub fn all_events(&self) -> &[PublishEvent] {
        &self.events
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use insta::assert_snapshot;
    use tempfile::tempdir;
    use tpub_types::CrashRecoveryState;

    fn bumped(package: &str) -> PublishEvent {
        PublishEvent::now(
            EventType::VersionBumped {
                version: "1.0.1".to_string(),
            },
            package,
        )
    }

    #[test]
    fn new_event_log_is_empty() {
        let log = EventLog::new();
        assert!(log.is_empty());
        assert_eq!(log.len(), 0);
    }

    #[test]
    fn events_for_package_filters_correctly() {
        let mut log = EventLog::new();
        log.record(bumped("a@1"));
        log.record(bumped("b@1"));
        log.record(bumped("a@2"));

        assert_eq!(log.events_for_package("a@1").len(), 1);
        assert_eq!(log.events_for_package("b@1").len(), 1);
        assert!(log.events_for_package("c@1").is_empty());
    }

    #[test]
    fn write_appends_across_logs() {
        let td = tempdir().expect("tempdir");
        let path = events_path(&td.path().join("state"));

        let mut first = EventLog::new();
        first.record(bumped("a@1"));
        first.write_to_file(&path).expect("write first");

        let mut second = EventLog::new();
        second.record(bumped("b@1"));
        second.write_to_file(&path).expect("write second");

        let content = fs::read_to_string(&path).expect("read");
        assert_eq!(content.lines().count(), 2);

        let loaded = EventLog::read_from_file(&path).expect("load");
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.all_events()[1].package, "b@1");
    }

    #[test]
    fn read_missing_file_is_empty() {
        let td = tempdir().expect("tempdir");
        let loaded = EventLog::read_from_file(&td.path().join("nope.jsonl")).expect("read");
        assert!(loaded.is_empty());
    }

    #[test]
    fn read_skips_blank_lines_and_reports_bad_ones() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join(EVENTS_FILE);

        let mut log = EventLog::new();
        log.record(bumped("a@1"));
        log.write_to_file(&path).expect("write");
        let mut content = fs::read_to_string(&path).expect("read");
        content.push('\n');
        fs::write(&path, &content).expect("rewrite");
        assert_eq!(EventLog::read_from_file(&path).expect("load").len(), 1);

        content.push_str("{ nope\n");
        fs::write(&path, &content).expect("rewrite");
        let err = EventLog::read_from_file(&path).unwrap_err();
        assert!(format!("{err:#}").contains(":3"));
    }

    #[test]
    fn crashed_packages_lists_job_crashes_only() {
        let mut log = EventLog::new();
        log.record(PublishEvent::now(
            EventType::WorkerCrashed {
                worker: 0,
                state: CrashRecoveryState::Retry,
            },
            "big@1",
        ));
        log.record(PublishEvent::now(EventType::JobCrashed { worker: 0 }, "big@1"));
        log.record(PublishEvent::now(EventType::JobSucceeded { worker: 1 }, "small@1"));

        assert_eq!(log.crashed_packages(), vec!["big@1"]);
    }

    #[test]
    fn event_line_format() {
        let event = PublishEvent {
            timestamp: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
            event_type: EventType::WorkerCrashed {
                worker: 1,
                state: CrashRecoveryState::RetryWithMoreMemory,
            },
            package: "jquery@3".to_string(),
        };
        assert_snapshot!(
            serde_json::to_string(&event).expect("serialize"),
            @r#"{"timestamp":"2024-01-02T03:04:05Z","event_type":{"type":"worker_crashed","worker":1,"state":"retry_with_more_memory"},"package":"jquery@3"}"#
        );
    }

    #[test]
    fn clear_removes_all_events() {
        let mut log = EventLog::new();
        log.record(bumped("a@1"));
        log.clear();
        assert!(log.is_empty());
    }
}

//! SR-012: Append-only JSONL run event log.
//!
//! One file per run, `<log-dir>/<run-id>.jsonl`, one `TimestampedEvent` per
//! line. Workers append concurrently; the file handle sits behind a mutex
//! so lines never interleave.

use crate::core::types::{RunEvent, TimestampedEvent};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// UTC timestamp, `YYYY-MM-DDTHH:MM:SSZ`.
pub fn now_iso8601() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format_iso8601(secs)
}

fn format_iso8601(epoch_secs: u64) -> String {
    let (y, m, d) = civil_from_days((epoch_secs / 86_400) as i64);
    let rem = epoch_secs % 86_400;
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        y,
        m,
        d,
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60
    )
}

/// Days since 1970-01-01 to a proleptic Gregorian (year, month, day).
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let y = yoe + era * 400 + i64::from(m <= 2);
    (y, m, d)
}

/// Generate a run ID.
pub fn generate_run_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("run-{:012x}", nanos & 0xFFFF_FFFF_FFFF)
}

/// Event log file for a run.
pub fn event_log_path(log_dir: &Path, run_id: &str) -> PathBuf {
    log_dir.join(format!("{}.jsonl", run_id))
}

/// An open run event log.
#[derive(Debug)]
pub struct EventLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl EventLog {
    /// Create `log_dir` if needed and open the run's log for append.
    pub fn open(log_dir: &Path, run_id: &str) -> Result<Self, String> {
        std::fs::create_dir_all(log_dir)
            .map_err(|e| format!("cannot create log dir {}: {}", log_dir.display(), e))?;
        let path = event_log_path(log_dir, run_id);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| format!("cannot open event log {}: {}", path.display(), e))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event as a single line.
    pub fn append(&self, event: RunEvent) -> Result<(), String> {
        let te = TimestampedEvent {
            ts: now_iso8601(),
            event,
        };
        let json = serde_json::to_string(&te).map_err(|e| format!("JSON serialize error: {}", e))?;
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        writeln!(file, "{}", json).map_err(|e| format!("write error: {}", e))
    }
}

/// Read back every event of a log.
pub fn read_events(path: &Path) -> Result<Vec<TimestampedEvent>, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read event log {}: {}", path.display(), e))?;
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(|e| format!("bad event line: {}", e)))
        .collect()
}

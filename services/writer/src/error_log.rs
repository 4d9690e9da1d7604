//! Local error log for undeliverable batches.
//!
//! A batch that exhausts its write retries is appended here as JSON lines
//! and the writer advances. The file is an operator tool: replay is a
//! manual `INSERT` away and nothing in the hot path ever waits on it.

use std::io::Write;
use std::path::PathBuf;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::error;
use types::time::{format_millis, now_millis};

pub struct ErrorLog {
    path: PathBuf,
    file: Mutex<Option<std::fs::File>>,
}

impl ErrorLog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            file: Mutex::new(None),
        }
    }

    /// Append a failed batch. Logging failures are reported but never
    /// propagate; losing the error log must not take the writer down.
    pub fn append(&self, table: &str, reason: &str, rows: &[Value]) {
        let entry = json!({
            "logged_at": format_millis(now_millis()),
            "table": table,
            "reason": reason,
            "rows": rows,
        });
        let mut guard = self.file.lock();
        if guard.is_none() {
            match std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
            {
                Ok(file) => *guard = Some(file),
                Err(e) => {
                    error!(path = %self.path.display(), error = %e, "cannot open error log");
                    return;
                }
            }
        }
        if let Some(file) = guard.as_mut() {
            if let Err(e) = writeln!(file, "{entry}") {
                error!(error = %e, "error log write failed");
                *guard = None;
            }
        }
    }
}

//! Persisted replication watermarks.
//!
//! One small JSON file, `{table: "YYYY-MM-DD HH:MM:SS.mmm"}`, flushed
//! after each successful window via write-new-file-plus-rename so a crash
//! mid-write leaves the previous file intact. Tables absent from the file
//! start at the caller's default (`now - cold_retention`).

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use types::time::{format_millis, parse_millis};

pub struct WatermarkStore {
    path: PathBuf,
    marks: BTreeMap<String, DateTime<Utc>>,
}

impl WatermarkStore {
    /// Load from disk; a missing or unreadable file starts empty.
    pub fn load(path: PathBuf) -> Self {
        let marks = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<BTreeMap<String, String>>(&content) {
                Ok(raw) => raw
                    .into_iter()
                    .filter_map(|(table, ts)| match parse_millis(&ts) {
                        Ok(ts) => Some((table, ts)),
                        Err(e) => {
                            warn!(table, error = %e, "discarding unparseable watermark");
                            None
                        }
                    })
                    .collect(),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "watermark file corrupt, starting fresh");
                    BTreeMap::new()
                }
            },
            Err(_) => {
                info!(path = %path.display(), "no watermark file, starting from defaults");
                BTreeMap::new()
            }
        };
        Self { path, marks }
    }

    /// Watermark for a table, or the supplied default when none is
    /// recorded yet.
    pub fn get(&self, table: &str, default: DateTime<Utc>) -> DateTime<Utc> {
        self.marks.get(table).copied().unwrap_or(default)
    }

    /// Advance a table's watermark and persist the whole file
    /// crash-safely.
    pub fn advance(&mut self, table: &str, to: DateTime<Utc>) -> std::io::Result<()> {
        self.marks.insert(table.to_string(), to);
        self.persist()
    }

    fn persist(&self) -> std::io::Result<()> {
        let raw: BTreeMap<&String, String> = self
            .marks
            .iter()
            .map(|(table, ts)| (table, format_millis(*ts)))
            .collect();
        let body = serde_json::to_string_pretty(&raw)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn snapshot(&self) -> &BTreeMap<String, DateTime<Utc>> {
        &self.marks
    }
}

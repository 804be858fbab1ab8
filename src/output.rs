//! Sinks that consume the periodic metric snapshots: a live console table and
//! a flat file with an appended, timestamped error log.

use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::{self, Write as _};
use std::path::Path;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::error;

use crate::metrics::{wall_clock_string, ErrorTable, HEADINGS};

const SEPARATOR: &str =
    "----------------------------------------------------------------------------------";

#[async_trait]
pub trait Printer: Send + Sync {
    fn update_table_and_logs(&self, row: &[String], errors: &ErrorTable);

    /// Blocks for sinks that own the calling context (the live console).
    async fn start(&self);

    fn stop(&self);
}

fn render_rows(row: &[String]) -> (String, String) {
    let mut heads = String::new();
    let mut values = String::new();
    for (heading, value) in HEADINGS.iter().zip(row) {
        let width = heading.len().max(value.len()) + 2;
        let _ = write!(heads, "{heading:<width$}");
        let _ = write!(values, "{value:<width$}");
    }
    (heads, values)
}

/// Reprints the stats table and the deduplicated error feed on every update.
#[derive(Default)]
pub struct ConsoleOutput;

impl ConsoleOutput {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Printer for ConsoleOutput {
    fn update_table_and_logs(&self, row: &[String], errors: &ErrorTable) {
        let (heads, values) = render_rows(row);
        let mut out = format!("{heads}\n{values}\n");
        errors.for_each(|msg, count| {
            if count > 1 {
                let _ = writeln!(out, "{msg} ({count})");
            } else {
                let _ = writeln!(out, "{msg}");
            }
        });
        println!("{out}");
    }

    async fn start(&self) {
        // The run ends via the interrupt handler, not by the console closing.
        std::future::pending::<()>().await;
    }

    fn stop(&self) {}
}

/// Appends aligned stat rows plus a timestamped error log to a file.
pub struct FileOutput {
    file: Mutex<File>,
}

impl FileOutput {
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

#[async_trait]
impl Printer for FileOutput {
    fn update_table_and_logs(&self, row: &[String], errors: &ErrorTable) {
        let (heads, values) = render_rows(row);
        let mut out = format!("{heads}\n{values}\n");

        let now = wall_clock_string();
        errors.for_each(|msg, count| {
            if count > 1 {
                let _ = writeln!(out, "{now} {msg} ({count})");
            } else {
                let _ = writeln!(out, "{now} {msg}");
            }
        });
        out.push_str(SEPARATOR);
        out.push('\n');

        if let Err(err) = self.file.lock().write_all(out.as_bytes()) {
            error!("error while writing to the output file: {err}");
        }
    }

    async fn start(&self) {}

    fn stop(&self) {
        if let Err(err) = self.file.lock().flush() {
            error!("error while flushing the output file: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_output_writes_table_and_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.out");

        let output = FileOutput::create(&path).unwrap();
        let errors = ErrorTable::default();
        errors.add("dial error");
        errors.add("dial error");

        let row: Vec<String> = (0..HEADINGS.len()).map(|i| i.to_string()).collect();
        output.update_table_and_logs(&row, &errors);
        output.stop();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("Total"));
        assert!(contents.contains("Uptime"));
        assert!(contents.contains("dial error (2)"));
        assert!(contents.contains(SEPARATOR));
    }

    #[test]
    fn rows_align_headings_and_values() {
        let row: Vec<String> = HEADINGS.iter().map(|_| "x".to_owned()).collect();
        let (heads, values) = render_rows(&row);
        assert_eq!(heads.len(), values.len());
        assert!(heads.starts_with("Total"));
        assert!(values.starts_with('x'));
    }
}

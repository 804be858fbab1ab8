//! Run-wide counters, latency histograms and the deduplicated error feed.
//!
//! One `Metrics` instance is created per run and shared by every worker; all
//! hot-path updates are atomic increments or a short histogram lock. Snapshots
//! are taken at render time and are a point-in-time view only.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use hdrhistogram::Histogram;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;

use crate::output::Printer;

pub const TOTAL_CONNECTIONS: &str = "Total";
pub const ACTIVE_CONNECTIONS: &str = "Active";
pub const DROPPED_CONNECTIONS: &str = "Dropped";
pub const TOTAL_SENT_MESSAGES: &str = "M-Sent";
pub const TOTAL_RECEIVED_MESSAGES: &str = "M-Received";
pub const TOTAL_FAILED_MESSAGES: &str = "M-Failed";
pub const CONNECTION_MEAN_TIME: &str = "C-Mean";
pub const CONNECTION_P95_TIME: &str = "C-P95";
pub const CONNECTION_P99_TIME: &str = "C-P99";
pub const MESSAGE_MEAN_TIME: &str = "M-Mean";
pub const MESSAGE_P95_TIME: &str = "M-P95";
pub const MESSAGE_P99_TIME: &str = "M-P99";
pub const START_TIME: &str = "StartTime";
pub const UPTIME: &str = "Uptime";

pub const HEADINGS: [&str; 14] = [
    TOTAL_CONNECTIONS,
    ACTIVE_CONNECTIONS,
    DROPPED_CONNECTIONS,
    TOTAL_SENT_MESSAGES,
    TOTAL_RECEIVED_MESSAGES,
    TOTAL_FAILED_MESSAGES,
    CONNECTION_MEAN_TIME,
    CONNECTION_P95_TIME,
    CONNECTION_P99_TIME,
    MESSAGE_MEAN_TIME,
    MESSAGE_P95_TIME,
    MESSAGE_P99_TIME,
    START_TIME,
    UPTIME,
];

const P95: f64 = 0.95;
const P99: f64 = 0.99;
const DRAIN_POLL: Duration = Duration::from_millis(200);

/// Distinct error strings with occurrence counts, kept in first-seen order.
#[derive(Default)]
pub struct ErrorTable {
    inner: RwLock<ErrorTableInner>,
}

#[derive(Default)]
struct ErrorTableInner {
    counts: HashMap<String, u64>,
    order: Vec<String>,
}

impl ErrorTable {
    pub fn add(&self, msg: &str) {
        let mut inner = self.inner.write();
        if !inner.counts.contains_key(msg) {
            inner.order.push(msg.to_owned());
        }
        *inner.counts.entry(msg.to_owned()).or_insert(0) += 1;
    }

    pub fn for_each(&self, mut f: impl FnMut(&str, u64)) {
        let inner = self.inner.read();
        for msg in &inner.order {
            f(msg, inner.counts[msg.as_str()]);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().order.is_empty()
    }
}

/// Shared buffer the tracing subscriber writes into so that log lines can be
/// folded into the error table by the drain task.
#[derive(Clone, Default)]
pub struct LogBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl LogBuffer {
    /// Takes every complete line out of the buffer, leaving any partial
    /// trailing write in place.
    pub fn drain_lines(&self) -> Vec<String> {
        let mut buf = self.inner.lock();
        let Some(last_newline) = buf.iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };
        let rest = buf.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut *buf, rest);
        drop(buf);

        complete
            .split(|&b| b == b'\n')
            .filter(|line| !line.is_empty())
            .map(|line| String::from_utf8_lossy(line).into_owned())
            .collect()
    }
}

impl io::Write for LogBuffer {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.inner.lock().extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// `HH:MM:SS.mmm` timestamps (UTC), matching what `strip_time_prefix` removes.
#[derive(Clone, Copy, Default)]
pub struct WallClock;

impl FormatTime for WallClock {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        let since = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let secs = since.as_secs() % 86_400;
        write!(
            w,
            "{:02}:{:02}:{:02}.{:03}",
            secs / 3600,
            secs % 3600 / 60,
            secs % 60,
            since.subsec_millis()
        )
    }
}

pub(crate) fn wall_clock_string() -> String {
    let since = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let secs = since.as_secs() % 86_400;
    format!("{:02}:{:02}:{:02}", secs / 3600, secs % 3600 / 60, secs % 60)
}

/// Strips the fixed-width `HH:MM:SS.mmm ` prefix a log line carries, so the
/// same error repeated at different times dedupes to one table entry.
pub fn strip_time_prefix(line: &str) -> &str {
    let b = line.as_bytes();
    let digits = [0usize, 1, 3, 4, 6, 7, 9, 10, 11];
    if b.len() >= 13
        && b[2] == b':'
        && b[5] == b':'
        && b[8] == b'.'
        && b[12] == b' '
        && digits.iter().all(|&i| b[i].is_ascii_digit())
    {
        &line[13..]
    } else {
        line
    }
}

pub struct Metrics {
    total_conns: u64,
    active: AtomicI64,
    dropped: AtomicU64,
    sent: AtomicU64,
    received: AtomicU64,
    failed: AtomicU64,
    connect_time: Mutex<Histogram<u64>>,
    message_time: Mutex<Histogram<u64>>,
    errors: ErrorTable,
    start: Instant,
    start_str: String,
}

impl Metrics {
    pub fn new(total_conns: u64) -> Arc<Self> {
        Arc::new(Self {
            total_conns,
            active: AtomicI64::new(0),
            dropped: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            // Microsecond samples, clamped at 60s by saturating_record.
            connect_time: Mutex::new(Histogram::new_with_bounds(1, 60_000_000, 3).unwrap()),
            message_time: Mutex::new(Histogram::new_with_bounds(1, 60_000_000, 3).unwrap()),
            errors: ErrorTable::default(),
            start: Instant::now(),
            start_str: wall_clock_string(),
        })
    }

    pub fn incr_active_connections(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decr_active_connections(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn incr_dropped_connections(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_sent_messages(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_received_messages(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_failed_messages(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_connect_time(&self, elapsed: Duration) {
        self.connect_time
            .lock()
            .saturating_record(elapsed.as_micros() as u64);
    }

    pub fn observe_message_time(&self, elapsed: Duration) {
        self.message_time
            .lock()
            .saturating_record(elapsed.as_micros() as u64);
    }

    pub fn total_connections(&self) -> u64 {
        self.total_conns
    }

    pub fn active_connections(&self) -> i64 {
        self.active.load(Ordering::Relaxed)
    }

    pub fn dropped_connections(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn sent_messages(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn received_messages(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn failed_messages(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> &ErrorTable {
        &self.errors
    }

    /// Renders the current snapshot in the order of the requested headings;
    /// unknown headings are skipped.
    pub fn get_table(&self, headings: &[&str]) -> Vec<String> {
        let connect = self.connect_time.lock();
        let message = self.message_time.lock();

        let mut row = Vec::with_capacity(headings.len());
        for &heading in headings {
            match heading {
                TOTAL_CONNECTIONS => row.push(self.total_conns.to_string()),
                ACTIVE_CONNECTIONS => {
                    row.push(format_share(self.active_connections(), self.total_conns));
                }
                DROPPED_CONNECTIONS => {
                    row.push(format_share(
                        self.dropped_connections() as i64,
                        self.total_conns,
                    ));
                }
                TOTAL_SENT_MESSAGES => row.push(self.sent_messages().to_string()),
                TOTAL_RECEIVED_MESSAGES => row.push(self.received_messages().to_string()),
                TOTAL_FAILED_MESSAGES => row.push(self.failed_messages().to_string()),
                CONNECTION_MEAN_TIME => row.push(format_micros(connect.mean())),
                CONNECTION_P95_TIME => {
                    row.push(format_micros(connect.value_at_quantile(P95) as f64));
                }
                CONNECTION_P99_TIME => {
                    row.push(format_micros(connect.value_at_quantile(P99) as f64));
                }
                MESSAGE_MEAN_TIME => row.push(format_micros(message.mean())),
                MESSAGE_P95_TIME => {
                    row.push(format_micros(message.value_at_quantile(P95) as f64));
                }
                MESSAGE_P99_TIME => {
                    row.push(format_micros(message.value_at_quantile(P99) as f64));
                }
                START_TIME => row.push(self.start_str.clone()),
                UPTIME => {
                    let uptime = Duration::from_secs(self.start.elapsed().as_secs());
                    row.push(humantime::format_duration(uptime).to_string());
                }
                _ => {}
            }
        }
        row
    }

    /// Plain `heading,value` dump for post-run capture, bypassing the sink.
    pub fn print_final(&self) {
        let values = self.get_table(&HEADINGS);
        for (heading, value) in HEADINGS.iter().zip(values) {
            println!("{heading},{value}");
        }
    }

    /// Pushes a rendered snapshot plus the error table to the sink on a fixed tick.
    pub fn spawn_render_loop(
        self: &Arc<Self>,
        printer: Arc<dyn Printer>,
        every: Duration,
    ) -> JoinHandle<()> {
        let metrics = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(every);
            loop {
                ticker.tick().await;
                printer.update_table_and_logs(&metrics.get_table(&HEADINGS), metrics.errors());
            }
        })
    }

    /// Folds log lines from the shared buffer into the error table so ambient
    /// ERROR/DEBUG output surfaces in the dashboard.
    pub fn spawn_error_drain(self: &Arc<Self>, logs: LogBuffer) -> JoinHandle<()> {
        let metrics = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                for line in logs.drain_lines() {
                    metrics.errors.add(strip_time_prefix(&line));
                }
                sleep(DRAIN_POLL).await;
            }
        })
    }
}

fn format_share(value: i64, total: u64) -> String {
    if total == 0 {
        return "0.00%".to_owned();
    }
    let percentage = (value as f64 / total as f64) * 100.0;
    format!("{value} ({percentage:.2}%)")
}

fn format_micros(micros: f64) -> String {
    let rounded = Duration::from_millis((micros / 1000.0).round() as u64);
    humantime::format_duration(rounded).to_string()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn error_table_keeps_first_seen_order_and_counts() {
        let table = ErrorTable::default();
        for msg in ["E1", "E2", "E1", "E3", "E1"] {
            table.add(msg);
        }

        let mut seen = Vec::new();
        table.for_each(|msg, count| seen.push((msg.to_owned(), count)));
        assert_eq!(
            seen,
            vec![
                ("E1".to_owned(), 3),
                ("E2".to_owned(), 1),
                ("E3".to_owned(), 1)
            ]
        );
    }

    #[test]
    fn zero_sample_snapshot_is_zero_valued() {
        let metrics = Metrics::new(10);
        let row = metrics.get_table(&[
            CONNECTION_MEAN_TIME,
            CONNECTION_P95_TIME,
            CONNECTION_P99_TIME,
            MESSAGE_MEAN_TIME,
            MESSAGE_P95_TIME,
            MESSAGE_P99_TIME,
        ]);
        assert_eq!(row, vec!["0s"; 6]);
    }

    #[test]
    fn percentiles_are_monotonic_once_sampled() {
        let metrics = Metrics::new(1);
        for ms in [5u64, 10, 20, 40, 80, 160] {
            metrics.observe_connect_time(Duration::from_millis(ms));
        }
        let connect = metrics.connect_time.lock();
        let mean = connect.mean();
        let p95 = connect.value_at_quantile(P95) as f64;
        let p99 = connect.value_at_quantile(P99) as f64;
        assert!(mean > 0.0);
        assert!(p95 <= p99);
        assert!(mean <= p99);
    }

    #[test]
    fn unknown_headings_are_skipped() {
        let metrics = Metrics::new(3);
        let row = metrics.get_table(&["Nope", TOTAL_CONNECTIONS, "AlsoNope"]);
        assert_eq!(row, vec!["3".to_owned()]);
    }

    #[test]
    fn counters_render_with_share_of_total() {
        let metrics = Metrics::new(4);
        metrics.incr_active_connections();
        metrics.incr_active_connections();
        metrics.incr_dropped_connections();
        metrics.incr_sent_messages();

        let row = metrics.get_table(&[
            ACTIVE_CONNECTIONS,
            DROPPED_CONNECTIONS,
            TOTAL_SENT_MESSAGES,
        ]);
        assert_eq!(row, vec!["2 (50.00%)", "1 (25.00%)", "1"]);
    }

    #[test]
    fn strip_time_prefix_only_matches_the_fixed_format() {
        assert_eq!(
            strip_time_prefix("12:34:56.789 ERROR dial error"),
            "ERROR dial error"
        );
        assert_eq!(strip_time_prefix("no timestamp here"), "no timestamp here");
        assert_eq!(strip_time_prefix("12:34:56 short"), "12:34:56 short");
        assert_eq!(strip_time_prefix(""), "");
    }

    #[test]
    fn log_buffer_drains_only_complete_lines() {
        let logs = LogBuffer::default();
        let mut writer = logs.clone();
        write!(writer, "first line\nsecond li").unwrap();

        assert_eq!(logs.drain_lines(), vec!["first line".to_owned()]);
        assert!(logs.drain_lines().is_empty());

        write!(writer, "ne\n").unwrap();
        assert_eq!(logs.drain_lines(), vec!["second line".to_owned()]);
    }
}

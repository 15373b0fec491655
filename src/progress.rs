//! Progress reporting and cooperative cancellation.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

/// Receives byte counts and status text from long-running operations.
///
/// Implementations must be cheap to call from many tasks at once. Returning `false`
/// from [`is_active`](ProgressSink::is_active) asks the operation to stop at the next
/// batch boundary.
pub trait ProgressSink: Send + Sync {
    fn add_bytes(&self, bytes: u64);

    fn set_status(&self, status: &str);

    fn is_active(&self) -> bool {
        true
    }
}

/// In-memory progress tracker with a cancel switch.
#[derive(Debug)]
pub struct DownloadProgress {
    bytes: AtomicU64,
    active: AtomicBool,
    status: Mutex<String>,
}

impl DownloadProgress {
    pub fn new() -> Self {
        Self {
            bytes: AtomicU64::new(0),
            active: AtomicBool::new(true),
            status: Mutex::new(String::new()),
        }
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> String {
        match self.status.lock() {
            Ok(status) => status.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Requests cancellation; running batches finish, no new batch starts.
    pub fn cancel(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

impl Default for DownloadProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for DownloadProgress {
    fn add_bytes(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn set_status(&self, status: &str) {
        let mut guard = match self.status.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.clear();
        guard.push_str(status);
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// Terminal progress bar for the CLI.
pub struct ProgressBarSink {
    bar: indicatif::ProgressBar,
    tracker: DownloadProgress,
}

impl ProgressBarSink {
    /// Byte-based bar sized to `total_bytes`.
    pub fn new(total_bytes: u64) -> Self {
        let bar = indicatif::ProgressBar::new(total_bytes);
        let style = indicatif::ProgressStyle::default_bar()
            .template("{spinner:.cyan} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg} | {elapsed_precise} elapsed, ETA {eta_precise}")
            .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
            .progress_chars("█▓▒░ ");
        bar.set_style(style);
        Self {
            bar,
            tracker: DownloadProgress::new(),
        }
    }

    pub fn cancel(&self) {
        self.tracker.cancel();
    }

    pub fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }
}

impl ProgressSink for ProgressBarSink {
    fn add_bytes(&self, bytes: u64) {
        self.tracker.add_bytes(bytes);
        self.bar.inc(bytes);
    }

    fn set_status(&self, status: &str) {
        self.tracker.set_status(status);
        self.bar.set_message(status.to_string());
    }

    fn is_active(&self) -> bool {
        self.tracker.is_active()
    }
}

//! Progress reporting, cancellation and pass results shared by every
//! long-running scan (index walk, deleted-entry scoring, carving, sweep).

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Cooperative stop signal, cloned into every worker of a pass
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanStage {
    IndexScan,
    DeletedEntries,
    SignatureCarve,
    BadSectorSweep,
    Extraction,
}

impl std::fmt::Display for ScanStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanStage::IndexScan => write!(f, "index scan"),
            ScanStage::DeletedEntries => write!(f, "deleted entries"),
            ScanStage::SignatureCarve => write!(f, "signature carve"),
            ScanStage::BadSectorSweep => write!(f, "bad-sector sweep"),
            ScanStage::Extraction => write!(f, "extraction"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanProgress {
    pub stage: ScanStage,
    pub scanned_units: u64,
    pub total_units: u64,
    pub found_count: u64,
}

impl ScanProgress {
    pub fn percent(&self) -> f32 {
        if self.total_units == 0 {
            return 100.0;
        }
        (self.scanned_units as f32 / self.total_units as f32 * 100.0).min(100.0)
    }
}

pub type ProgressSink = Arc<dyn Fn(ScanProgress) + Send + Sync>;

/// Result of one batch pass: whatever was found, plus how many units were
/// skipped because they could not be read or parsed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassReport<T> {
    pub items: Vec<T>,
    pub skipped_units: u64,
    pub cancelled: bool,
}

impl<T> PassReport<T> {
    pub fn new(items: Vec<T>, skipped_units: u64, cancelled: bool) -> Self {
        Self {
            items,
            skipped_units,
            cancelled,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), 0, false)
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> PassReport<U> {
        PassReport {
            items: self.items.into_iter().map(f).collect(),
            skipped_units: self.skipped_units,
            cancelled: self.cancelled,
        }
    }
}

impl<T> Default for PassReport<T> {
    fn default() -> Self {
        Self::empty()
    }
}

/// Throttled progress emitter, safe to share between rayon workers.
///
/// Emits when at least `interval` units have been scanned since the last
/// emission, and once more from `finish`.
pub struct ProgressReporter {
    sink: Option<ProgressSink>,
    stage: ScanStage,
    total_units: u64,
    interval: u64,
    scanned: AtomicU64,
    found: AtomicU64,
    last_emitted: AtomicU64,
}

impl ProgressReporter {
    pub fn new(sink: Option<ProgressSink>, stage: ScanStage, total_units: u64, interval: u64) -> Self {
        Self {
            sink,
            stage,
            total_units,
            interval: interval.max(1),
            scanned: AtomicU64::new(0),
            found: AtomicU64::new(0),
            last_emitted: AtomicU64::new(0),
        }
    }

    pub fn advance(&self, units: u64, found: u64) {
        let scanned = self.scanned.fetch_add(units, Ordering::Relaxed) + units;
        if found > 0 {
            self.found.fetch_add(found, Ordering::Relaxed);
        }

        let last = self.last_emitted.load(Ordering::Relaxed);
        if scanned.saturating_sub(last) >= self.interval
            && self
                .last_emitted
                .compare_exchange(last, scanned, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            self.emit(scanned);
        }
    }

    pub fn finish(&self) {
        self.emit(self.scanned.load(Ordering::Relaxed));
    }

    pub fn found(&self) -> u64 {
        self.found.load(Ordering::Relaxed)
    }

    fn emit(&self, scanned: u64) {
        if let Some(sink) = &self.sink {
            sink(ScanProgress {
                stage: self.stage,
                scanned_units: scanned.min(self.total_units),
                total_units: self.total_units,
                found_count: self.found.load(Ordering::Relaxed),
            });
        }
    }
}

/// Run `f` on a dedicated pool when a worker count is configured, otherwise
/// on the global rayon pool.
pub fn run_with_workers<R, F>(workers: Option<usize>, f: F) -> R
where
    R: Send,
    F: FnOnce() -> R + Send,
{
    match workers {
        Some(n) if n > 0 => match rayon::ThreadPoolBuilder::new().num_threads(n).build() {
            Ok(pool) => pool.install(f),
            Err(e) => {
                tracing::warn!("Could not build a {}-thread pool ({}), using the global pool", n, e);
                f()
            }
        },
        _ => f(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_cancellation_is_shared_between_clones() {
        let token = CancellationToken::new();
        let worker = token.clone();
        assert!(!worker.is_cancelled());
        token.cancel();
        assert!(worker.is_cancelled());
    }

    #[test]
    fn test_reporter_throttles_emissions() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let sink: ProgressSink = Arc::new(move |p: ScanProgress| {
            sink_seen.lock().unwrap().push(p.scanned_units);
        });

        let reporter = ProgressReporter::new(Some(sink), ScanStage::SignatureCarve, 100, 10);
        for _ in 0..25 {
            reporter.advance(1, 0);
        }
        reporter.finish();

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec![10, 20, 25]);
    }

    #[test]
    fn test_progress_percent() {
        let p = ScanProgress {
            stage: ScanStage::BadSectorSweep,
            scanned_units: 50,
            total_units: 200,
            found_count: 0,
        };
        assert_eq!(p.percent(), 25.0);
    }

    #[test]
    fn test_run_with_workers_uses_requested_pool() {
        let threads = run_with_workers(Some(2), rayon::current_num_threads);
        assert_eq!(threads, 2);
    }
}

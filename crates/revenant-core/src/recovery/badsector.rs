//! Bad-sector sweep over a block source.
//!
//! Units are read in parallel batches. A batch that reads cleanly and fast
//! is accepted whole; otherwise each unit is re-read on its own with retry
//! and exponential backoff for transient errors, and classified as
//! unreadable or slow.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::error::FsError;
use crate::fs::common::BlockSource;
use crate::recovery::{
    engine::ScanContext,
    progress::{PassReport, ScanStage},
};
use crate::{BadSectorInfo, BadSectorKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BadSectorOptions {
    /// Attempts per unit for transient errors
    pub max_retries: u8,
    /// Sweep unit in bytes; `None` uses the filesystem cluster size
    pub unit_size: Option<u32>,
    /// Reads slower than this are reported as `SlowReadable`
    pub slow_read_threshold_ms: u64,
    pub batch_units: u64,
    /// Base backoff, multiplied by 4 per retry
    pub retry_delay_ms: u64,
}

impl Default for BadSectorOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            unit_size: None,
            slow_read_threshold_ms: 500,
            batch_units: 64,
            retry_delay_ms: 100,
        }
    }
}

enum UnitRead {
    Good { latency: Duration },
    Failed { attempts: u8, error: FsError },
}

pub struct SectorSweeper<'a> {
    source: &'a dyn BlockSource,
    cluster_size: u64,
    unit_size: u64,
    /// Length of the short leading unit that aligns later units to the
    /// cluster origin; zero when the origin is already aligned
    lead: u64,
    options: BadSectorOptions,
}

impl<'a> SectorSweeper<'a> {
    pub fn new(source: &'a dyn BlockSource, cluster_size: u32, options: BadSectorOptions) -> Self {
        let cluster_size = cluster_size.max(1) as u64;
        let unit_size = options.unit_size.map_or(cluster_size, |u| u.max(1) as u64);
        Self {
            source,
            cluster_size,
            unit_size,
            lead: 0,
            options,
        }
    }

    /// Align units to a cluster region starting `origin` bytes into the
    /// source, so no unit straddles two clusters of that region
    pub fn with_cluster_origin(mut self, origin: u64) -> Self {
        self.lead = origin % self.unit_size;
        self
    }

    pub fn unit_size(&self) -> u64 {
        self.unit_size
    }

    fn total_units(&self) -> u64 {
        let size = self.source.size();
        if self.lead == 0 || size <= self.lead {
            return size.div_ceil(self.unit_size);
        }
        1 + (size - self.lead).div_ceil(self.unit_size)
    }

    /// Byte range of unit `unit`, clipped to the source
    fn unit_range(&self, unit: u64) -> (u64, u64) {
        let size = self.source.size();
        let (start, len) = match (self.lead, unit) {
            (0, _) => (unit * self.unit_size, self.unit_size),
            (lead, 0) => (0, lead),
            (lead, _) => (lead + (unit - 1) * self.unit_size, self.unit_size),
        };
        (start, len.min(size.saturating_sub(start)))
    }

    /// Sweep the whole source; returns findings sorted by offset
    pub fn sweep(&self, ctx: &ScanContext) -> PassReport<BadSectorInfo> {
        let total_units = self.total_units();
        let batch_units = self.options.batch_units.max(1);
        let batch_count = total_units.div_ceil(batch_units);

        tracing::info!(
            "Bad-sector sweep of {} ({} units of {} bytes)",
            self.source.describe(),
            total_units,
            self.unit_size
        );

        let reporter = ctx.reporter(ScanStage::BadSectorSweep, total_units);
        let batches: Vec<Vec<BadSectorInfo>> = (0..batch_count)
            .into_par_iter()
            .map(|batch| {
                if ctx.cancel.is_cancelled() {
                    return Vec::new();
                }
                let first = batch * batch_units;
                let count = batch_units.min(total_units - first);
                let found = self.sweep_batch(first, count);
                reporter.advance(count, found.len() as u64);
                found
            })
            .collect();
        reporter.finish();

        let mut findings: Vec<BadSectorInfo> = batches.into_iter().flatten().collect();
        findings.sort_by_key(|b| b.offset);

        let cancelled = ctx.cancel.is_cancelled();
        let unreadable = findings
            .iter()
            .filter(|b| b.kind == BadSectorKind::Unreadable)
            .count();
        tracing::info!(
            "Sweep finished: {} unreadable, {} slow{}",
            unreadable,
            findings.len() - unreadable,
            if cancelled { " (cancelled)" } else { "" }
        );

        let skipped = unreadable as u64;
        PassReport::new(findings, skipped, cancelled)
    }

    fn sweep_batch(&self, first: u64, count: u64) -> Vec<BadSectorInfo> {
        let (offset, _) = self.unit_range(first);
        let (last_start, last_len) = self.unit_range(first + count - 1);
        let len = (last_start + last_len - offset) as usize;
        let threshold = Duration::from_millis(self.options.slow_read_threshold_ms);

        let started = Instant::now();
        if self.source.read_at(offset, len).is_ok() && started.elapsed() <= threshold {
            return Vec::new();
        }

        (first..first + count)
            .filter_map(|unit| self.check_unit(unit, threshold))
            .collect()
    }

    fn check_unit(&self, unit: u64, threshold: Duration) -> Option<BadSectorInfo> {
        let (offset, length) = self.unit_range(unit);
        let cluster = offset / self.cluster_size;

        match self.read_unit_with_retry(offset, length as usize) {
            UnitRead::Good { latency } if latency > threshold => {
                tracing::debug!("Slow read at {:#x}: {} ms", offset, latency.as_millis());
                Some(BadSectorInfo {
                    offset,
                    length: length as u32,
                    cluster,
                    kind: BadSectorKind::SlowReadable,
                    attempts: 1,
                    latency_ms: Some(latency.as_millis() as u64),
                })
            }
            UnitRead::Good { .. } => None,
            UnitRead::Failed { attempts, error } => {
                tracing::warn!("Unreadable unit at {:#x} after {} attempts: {}", offset, attempts, error);
                Some(BadSectorInfo::unreadable(offset, length as u32, cluster, attempts))
            }
        }
    }

    fn read_unit_with_retry(&self, offset: u64, len: usize) -> UnitRead {
        let max_retries = self.options.max_retries.max(1);
        let mut attempt = 0u8;
        loop {
            let started = Instant::now();
            match self.source.read_at(offset, len) {
                Ok(_) => {
                    return UnitRead::Good {
                        latency: started.elapsed(),
                    }
                }
                Err(e) if is_transient_error(&e) && attempt + 1 < max_retries => {
                    let delay = self.options.retry_delay_ms * 4u64.pow(attempt as u32);
                    std::thread::sleep(Duration::from_millis(delay));
                    attempt += 1;
                }
                Err(error) => {
                    return UnitRead::Failed {
                        attempts: attempt + 1,
                        error,
                    }
                }
            }
        }
    }
}

/// Errors worth retrying
fn is_transient_error(e: &FsError) -> bool {
    match e {
        FsError::Io { source, .. } => matches!(
            source.kind(),
            std::io::ErrorKind::Interrupted
                | std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::WouldBlock
        ),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FsResult;
    use crate::fs::common::{FaultySource, MemorySource};
    use crate::recovery::engine::RecoveryConfig;
    use std::sync::atomic::{AtomicU32, Ordering};

    const CS: u32 = 4096;

    #[test]
    fn test_unreadable_cluster_recorded_and_sweep_completes() {
        let inner = MemorySource::new(vec![0u8; 32 * CS as usize]).into_shared();
        let source = FaultySource::with_bad_clusters(inner, &[12], CS);
        let ctx = ScanContext::default();

        let report = SectorSweeper::new(&source, CS, BadSectorOptions::default()).sweep(&ctx);
        assert!(!report.cancelled);
        assert_eq!(report.items.len(), 1);
        let bad = &report.items[0];
        assert_eq!(bad.cluster, 12);
        assert_eq!(bad.offset, 12 * CS as u64);
        assert_eq!(bad.kind, BadSectorKind::Unreadable);
        assert_eq!(bad.attempts, 1);
    }

    #[test]
    fn test_sector_units_and_short_tail() {
        let inner = MemorySource::new(vec![0u8; 8 * 512 + 100]).into_shared();
        let source = FaultySource::new(inner, vec![8 * 512..8 * 512 + 100]);
        let options = BadSectorOptions {
            unit_size: Some(512),
            batch_units: 3,
            ..Default::default()
        };
        let report = SectorSweeper::new(&source, CS, options).sweep(&ScanContext::default());
        assert_eq!(report.items.len(), 1);
        assert_eq!(report.items[0].offset, 8 * 512);
        assert_eq!(report.items[0].length, 100);
        assert_eq!(report.items[0].cluster, 1);
    }

    struct Flaky {
        inner: MemorySource,
        failures_left: AtomicU32,
    }

    impl BlockSource for Flaky {
        fn read_at(&self, offset: u64, len: usize) -> FsResult<Vec<u8>> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(FsError::io(
                    offset,
                    std::io::Error::new(std::io::ErrorKind::Interrupted, "interrupted"),
                ));
            }
            self.inner.read_at(offset, len)
        }

        fn size(&self) -> u64 {
            self.inner.size()
        }
    }

    #[test]
    fn test_transient_errors_are_retried() {
        // One failure for the batch read, one for the first unit attempt
        let source = Flaky {
            inner: MemorySource::new(vec![0u8; CS as usize]),
            failures_left: AtomicU32::new(2),
        };
        let options = BadSectorOptions {
            retry_delay_ms: 1,
            ..Default::default()
        };
        let report = SectorSweeper::new(&source, CS, options).sweep(&ScanContext::default());
        assert!(report.items.is_empty());
    }

    #[test]
    fn test_cancelled_sweep_is_flagged() {
        let source = MemorySource::new(vec![0u8; 16 * CS as usize]);
        let ctx = ScanContext::new(RecoveryConfig::default());
        ctx.cancel.cancel();
        let report = SectorSweeper::new(&source, CS, BadSectorOptions::default()).sweep(&ctx);
        assert!(report.cancelled);
        assert!(report.items.is_empty());
    }

    #[test]
    fn test_units_align_to_cluster_origin() {
        // clusters start 1536 bytes in; the bad sector is the first of cluster 2
        let origin = 1536u64;
        let bad = origin + 2 * 1024;
        let inner = MemorySource::new(vec![0u8; (origin + 8 * 1024) as usize]).into_shared();
        let source = FaultySource::new(inner, vec![bad..bad + 512]);

        let report = SectorSweeper::new(&source, 1024, BadSectorOptions::default())
            .with_cluster_origin(origin)
            .sweep(&ScanContext::default());
        assert_eq!(report.items.len(), 1);
        assert_eq!(report.items[0].offset, bad);
        assert_eq!(report.items[0].length, 1024);
    }

    #[test]
    fn test_leading_unit_before_origin_is_swept() {
        let inner = MemorySource::new(vec![0u8; 1536 + 4 * 1024]).into_shared();
        let source = FaultySource::new(inner, vec![100..101]);

        let report = SectorSweeper::new(&source, 1024, BadSectorOptions::default())
            .with_cluster_origin(1536)
            .sweep(&ScanContext::default());
        assert_eq!(report.items.len(), 1);
        assert_eq!(report.items[0].offset, 0);
        assert_eq!(report.items[0].length, 512);
    }
}

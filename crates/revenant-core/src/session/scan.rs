//! One scan of one target: open the source, run the configured passes,
//! then snapshot everything into a `RecoverySession`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::fs::common::{open_source, SharedSource};
use crate::fs::{open_filesystem, FileSystem};
use crate::recovery::{
    carver::{dedup_carved, Carver},
    clusters::unreadable_clusters,
    engine::ScanContext,
    progress::{run_with_workers, PassReport},
};
use crate::{
    BadSectorInfo, DeletedFileEntry, EntrySource, FileSystemType, RecoverySession, ScanMode, SessionMetadata,
};

/// Caller-owned state of a scan. Independent sessions never share state,
/// so several targets can be scanned side by side.
pub struct ScanSession {
    id: Uuid,
    created_at: DateTime<Utc>,
    device_path: PathBuf,
    device_size: u64,
    ctx: ScanContext,
    fs: Box<dyn FileSystem>,
    entries: Vec<DeletedFileEntry>,
    bad_sectors: Vec<BadSectorInfo>,
    skipped_units: u64,
    cancelled: bool,
    elapsed: Duration,
}

impl ScanSession {
    /// Open an image or device and load the filesystem found on it
    pub fn open(path: impl AsRef<Path>, ctx: ScanContext) -> Result<Self> {
        let path = path.as_ref();
        let source = open_source(path).with_context(|| format!("Failed to open {}", path.display()))?;
        Self::from_source(source, path.to_path_buf(), ctx)
    }

    pub fn from_source(source: SharedSource, device_path: PathBuf, ctx: ScanContext) -> Result<Self> {
        let started = Instant::now();
        let device_size = source.size();
        let fs = open_filesystem(source, &ctx)
            .with_context(|| format!("Failed to load filesystem on {}", device_path.display()))?;

        Ok(Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            device_path,
            device_size,
            ctx,
            fs,
            entries: Vec::new(),
            bad_sectors: Vec::new(),
            skipped_units: 0,
            cancelled: false,
            elapsed: started.elapsed(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn filesystem(&self) -> &dyn FileSystem {
        self.fs.as_ref()
    }

    pub fn context(&self) -> &ScanContext {
        &self.ctx
    }

    pub fn entries(&self) -> &[DeletedFileEntry] {
        &self.entries
    }

    pub fn bad_sectors(&self) -> &[BadSectorInfo] {
        &self.bad_sectors
    }

    /// Run the passes the configured mode asks for
    pub fn run(&mut self) -> Result<()> {
        let started = Instant::now();
        let mode = self.ctx.config.scan_mode;
        tracing::info!(
            "Session {}: {} scan of {} ({})",
            self.id,
            mode,
            self.device_path.display(),
            self.fs.filesystem_type()
        );

        if self.ctx.config.sweep_bad_sectors {
            self.sweep_bad_sectors()?;
        }

        // A raw reader's deleted-entry scan already is a carve
        let raw = self.fs.filesystem_type() == FileSystemType::Raw;
        match mode {
            ScanMode::Indexed => self.run_indexed()?,
            ScanMode::Deep => self.run_carve(false)?,
            ScanMode::Combined if raw => self.run_carve(false)?,
            ScanMode::Combined => {
                self.run_indexed()?;
                if !self.cancelled {
                    self.run_carve(true)?;
                }
            }
        }
        self.finalize_entries();

        self.elapsed += started.elapsed();
        tracing::info!(
            "Session {}: {} entries, {} recoverable, {} skipped units in {:?}{}",
            self.id,
            self.entries.len(),
            self.entries.iter().filter(|e| e.is_recoverable()).count(),
            self.skipped_units,
            self.elapsed,
            if self.cancelled { " (cancelled)" } else { "" }
        );
        Ok(())
    }

    /// Sweep the source and remember its unreadable clusters so later
    /// passes classify entries touching them as corrupted
    pub fn sweep_bad_sectors(&mut self) -> Result<()> {
        let report = self.fs.scan_bad_sectors(&self.ctx).context("Bad-sector sweep failed")?;
        let cs = self.fs.cluster_size()?;
        let bad = unreadable_clusters(&report.items, cs, self.fs.cluster_origin()?);
        if !bad.is_empty() {
            tracing::warn!("{} clusters are unreadable", bad.len());
        }
        self.ctx.bad_clusters.extend(bad);
        self.cancelled |= report.cancelled;
        self.bad_sectors = report.items;
        Ok(())
    }

    fn run_indexed(&mut self) -> Result<()> {
        let report = self.fs.scan_deleted(&self.ctx).context("Deleted-entry scan failed")?;
        self.absorb(report);
        Ok(())
    }

    /// Carve the source. After an indexed pass, carved hits starting in a
    /// cluster a metadata entry already covers are dropped.
    fn run_carve(&mut self, after_indexed: bool) -> Result<()> {
        let source = self.fs.source()?;
        let cs = self.fs.cluster_size()?;
        let carver = Carver::new(source.as_ref(), cs, self.ctx.config.carve_catalog())
            .with_cluster_map(self.fs.cluster_map()?);
        let report = run_with_workers(self.ctx.config.workers, || carver.scan(&self.ctx));

        let mut carved = report.items;
        if after_indexed {
            let explained: HashSet<u64> = self
                .entries
                .iter()
                .flat_map(|e| e.fragmented_clusters.iter().copied())
                .collect();
            let before = carved.len();
            carved.retain(|e| e.fragmented_clusters.first().map_or(true, |c| !explained.contains(c)));
            if carved.len() != before {
                tracing::debug!("{} carved hits already explained by metadata", before - carved.len());
            }
        }
        let carved = dedup_carved(carved, source.as_ref(), cs);

        self.absorb(PassReport::new(carved, report.skipped_units, report.cancelled));
        Ok(())
    }

    fn absorb(&mut self, report: PassReport<DeletedFileEntry>) {
        self.entries.extend(report.items);
        self.skipped_units += report.skipped_units;
        self.cancelled |= report.cancelled;
    }

    /// Apply the probability floor, order metadata entries before carved
    /// ones, and number entries from 1
    fn finalize_entries(&mut self) {
        let floor = self.ctx.config.min_probability;
        if floor > 0.0 {
            let before = self.entries.len();
            self.entries.retain(|e| e.recovery_probability >= floor);
            tracing::debug!("{} entries below probability {}", before - self.entries.len(), floor);
        }

        self.entries.sort_by_key(|e| match e.source {
            EntrySource::Metadata { record_number } => (0, record_number),
            EntrySource::Carved { start_offset, .. } => (1, start_offset),
        });
        for (i, entry) in self.entries.iter_mut().enumerate() {
            entry.id = i as u64 + 1;
        }
    }

    /// Snapshot of everything found so far
    pub fn finish(self) -> RecoverySession {
        let recoverable = self.entries.iter().filter(|e| e.is_recoverable()).count();
        let metadata = SessionMetadata {
            device_size: self.device_size,
            partition_offset: self.fs.cluster_origin().unwrap_or(0),
            filesystem_size: self.fs.source().map_or(self.device_size, |s| s.size()),
            cluster_size: self.fs.cluster_size().unwrap_or(0),
            scan_duration_ms: self.elapsed.as_millis() as u64,
            files_found: self.entries.len() as u32,
            recoverable_files: recoverable as u32,
        };

        RecoverySession {
            id: self.id,
            fs_type: self.fs.filesystem_type(),
            device_path: self.device_path,
            created_at: self.created_at,
            mode: self.ctx.config.scan_mode,
            entries: self.entries,
            bad_sectors: self.bad_sectors,
            skipped_units: self.skipped_units,
            cancelled: self.cancelled,
            metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::common::{FaultySource, MemorySource};
    use crate::fs::fat::builder::{FatImageBuilder, ROOT};
    use crate::recovery::engine::RecoveryConfig;
    use crate::RecoveryStatus;
    use std::sync::Arc;

    const JPEG: [u8; 4] = [0xFF, 0xD8, 0xFF, 0xE0];

    fn fat_image() -> FatImageBuilder {
        let mut image = FatImageBuilder::fat32(4096, 128);
        image.add_file(ROOT, "LIVE.TXT", b"still here");
        let mut photo = JPEG.to_vec();
        photo.resize(4096, 0x22);
        image.add_deleted_file(ROOT, "deleted.jpg", &photo);
        // an orphaned JPEG no directory entry describes
        let orphan = image.allocate(1, false);
        image.write(orphan, &JPEG);
        image
    }

    fn session(image: &FatImageBuilder, config: RecoveryConfig) -> ScanSession {
        let source = MemorySource::new(image.build()).into_shared();
        ScanSession::from_source(source, PathBuf::from("test.img"), ScanContext::new(config)).unwrap()
    }

    fn config(mode: ScanMode) -> RecoveryConfig {
        RecoveryConfig {
            scan_mode: mode,
            ..Default::default()
        }
    }

    #[test]
    fn test_indexed_mode_finds_metadata_entries_only() {
        let mut scan = session(&fat_image(), config(ScanMode::Indexed));
        scan.run().unwrap();
        let result = scan.finish();
        assert_eq!(result.fs_type, FileSystemType::Fat);
        assert_eq!(result.entries.len(), 1);
        assert_eq!(result.entries[0].file.name, "deleted.jpg");
        assert_eq!(result.entries[0].id, 1);
    }

    #[test]
    fn test_combined_mode_adds_unexplained_carves() {
        let image = fat_image();
        let mut scan = session(&image, config(ScanMode::Combined));
        scan.run().unwrap();
        let result = scan.finish();

        assert_eq!(result.entries.len(), 2);
        assert!(matches!(result.entries[0].source, EntrySource::Metadata { .. }));
        assert!(matches!(result.entries[1].source, EntrySource::Carved { .. }));
        assert_eq!(result.entries[1].signature_type.as_deref(), Some("JPEG"));
        assert_eq!(
            result.entries.iter().map(|e| e.id).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(result.metadata.partition_offset, image.data_offset());
        assert_eq!(result.metadata.cluster_size, 4096);
        assert_eq!(result.metadata.files_found, 2);
    }

    #[test]
    fn test_deep_mode_carves_everything() {
        let mut scan = session(&fat_image(), config(ScanMode::Deep));
        scan.run().unwrap();
        let result = scan.finish();
        assert_eq!(result.entries.len(), 2);
        assert!(result
            .entries
            .iter()
            .all(|e| matches!(e.source, EntrySource::Carved { .. })));
    }

    #[test]
    fn test_min_probability_drops_weak_entries() {
        let mut cfg = config(ScanMode::Combined);
        cfg.min_probability = 0.9;
        let mut scan = session(&fat_image(), cfg);
        scan.run().unwrap();
        let result = scan.finish();
        assert_eq!(result.entries.len(), 1);
        assert!(matches!(result.entries[0].source, EntrySource::Metadata { .. }));
    }

    #[test]
    fn test_sweep_feeds_scoring() {
        let image = fat_image();
        // LIVE.TXT takes FAT cluster 3, deleted.jpg cluster 4
        let bad = image.cluster_offset(4);
        let inner = MemorySource::new(image.build()).into_shared();
        let source: SharedSource = Arc::new(FaultySource::new(inner, vec![bad..bad + 512]));

        let mut cfg = config(ScanMode::Indexed);
        cfg.sweep_bad_sectors = true;
        cfg.bad_sectors.retry_delay_ms = 0;
        let mut scan = ScanSession::from_source(source, PathBuf::from("bad.img"), ScanContext::new(cfg)).unwrap();
        scan.run().unwrap();
        let result = scan.finish();

        assert_eq!(result.bad_sectors.len(), 1);
        assert_eq!(result.entries[0].recovery_status, RecoveryStatus::Corrupted);
        assert_eq!(result.entries[0].recovery_probability, 0.0);
    }
}

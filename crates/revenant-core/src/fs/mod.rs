/// Filesystem contract, detection, and the concrete readers
use std::borrow::Cow;
use std::io::Write;
use std::path::Path;

pub mod common;
pub mod fat;
pub mod ntfs;
pub mod raw;

use crate::error::{FsError, FsResult};
use crate::health::DiskHealthInfo;
use crate::recovery::{
    badsector::SectorSweeper,
    clusters::ClusterMap,
    engine::{extract_entry, ExtractionOutcome, ScanContext},
    progress::{run_with_workers, PassReport},
    verify::HashAlgorithm,
};
use crate::{BadSectorInfo, DeletedFileEntry, DirectoryEntry, FileEntry, FileSystemType};
use common::{BlockSource, SharedSource};

/// What every filesystem reader offers once bound to a block source.
///
/// All read operations fail with `NotLoaded` until `load` has succeeded;
/// a second `load` fails with `AlreadyLoaded`.
pub trait FileSystem: Send + Sync {
    fn filesystem_type(&self) -> FileSystemType;

    fn load(&mut self, source: SharedSource) -> FsResult<()> {
        self.load_with(source, &ScanContext::default())
    }

    /// Load with progress reporting, cancellation and worker settings
    fn load_with(&mut self, source: SharedSource, ctx: &ScanContext) -> FsResult<()>;

    fn is_loaded(&self) -> bool;

    /// Cluster-addressed view of the volume; cluster `n` starts at byte
    /// `n * cluster_size` of this source
    fn source(&self) -> FsResult<&SharedSource>;

    /// The whole source passed to `load`, metadata regions included
    fn volume(&self) -> FsResult<&SharedSource> {
        self.source()
    }

    /// Byte offset of cluster 0 within the source passed to `load`
    fn cluster_origin(&self) -> FsResult<u64> {
        self.source().map(|_| 0)
    }

    fn cluster_size(&self) -> FsResult<u32>;

    fn total_clusters(&self) -> FsResult<u64>;

    /// Ownership of clusters by live entries
    fn cluster_map(&self) -> FsResult<&ClusterMap>;

    /// Subdirectories of `path`, each with its full subtree
    fn list_directories(&self, path: &str) -> FsResult<Vec<DirectoryEntry>>;

    fn list_files(&self, path: &str) -> FsResult<Vec<FileEntry>>;

    fn read_file(&self, path: &str) -> FsResult<Vec<u8>>;

    fn directory_tree(&self) -> FsResult<DirectoryEntry>;

    /// Deleted entries with recovery scoring; partial on cancellation
    fn scan_deleted(&self, ctx: &ScanContext) -> FsResult<PassReport<DeletedFileEntry>>;

    fn scan_for_deleted_files(&self) -> FsResult<Vec<DeletedFileEntry>> {
        Ok(self.scan_deleted(&ScanContext::default())?.items)
    }

    fn recover_file_detailed(
        &self,
        entry: &DeletedFileEntry,
        dest: &mut dyn Write,
        extra_hashes: &[HashAlgorithm],
    ) -> FsResult<ExtractionOutcome> {
        extract_entry(self.source()?.as_ref(), self.cluster_size()?, entry, dest, extra_hashes)
    }

    /// `Ok(false)` for partial or impossible extraction; only state errors
    /// (`NotLoaded`) are returned as `Err`
    fn recover_file(&self, entry: &DeletedFileEntry, dest: &mut dyn Write) -> FsResult<bool> {
        match self.recover_file_detailed(entry, dest, &[]) {
            Ok(outcome) => Ok(outcome.complete),
            Err(FsError::NotLoaded) => Err(FsError::NotLoaded),
            Err(e) => {
                tracing::warn!("Recovery of entry {} failed: {}", entry.id, e);
                Ok(false)
            }
        }
    }

    fn recover_file_to_path(&self, entry: &DeletedFileEntry, path: &Path) -> FsResult<bool> {
        let file = std::fs::File::create(path).map_err(|e| FsError::destination(path, e))?;
        let mut out = std::io::BufWriter::new(file);
        self.recover_file(entry, &mut out)
    }

    /// Sweep the whole volume. Finding offsets are volume-relative; units
    /// are aligned to `cluster_origin`.
    fn scan_bad_sectors(&self, ctx: &ScanContext) -> FsResult<PassReport<BadSectorInfo>> {
        let volume = self.volume()?;
        let sweeper = SectorSweeper::new(volume.as_ref(), self.cluster_size()?, ctx.config.bad_sectors.clone())
            .with_cluster_origin(self.cluster_origin()?);
        Ok(run_with_workers(ctx.config.workers, || sweeper.sweep(ctx)))
    }

    fn scan_for_bad_sectors(&self) -> FsResult<Vec<BadSectorInfo>> {
        Ok(self.scan_bad_sectors(&ScanContext::default())?.items)
    }

    /// Sweep the source and fold the findings into `telemetry`, or into an
    /// unknown-drive view when no telemetry is available
    fn get_disk_health(&self, telemetry: Option<DiskHealthInfo>) -> FsResult<DiskHealthInfo> {
        let findings = self.scan_for_bad_sectors()?;
        Ok(telemetry.unwrap_or_default().merge_bad_sectors(&findings))
    }

    /// Concatenated content of `clusters`, in order
    fn read_clusters(&self, clusters: &[u64]) -> FsResult<Vec<u8>> {
        let source = self.source()?;
        let cs = self.cluster_size()?;
        let mut out = Vec::with_capacity(clusters.len() * cs as usize);
        for &cluster in clusters {
            out.extend(source.read_cluster(cluster, cs)?);
        }
        Ok(out)
    }
}

/// The cluster map to score against: the filesystem's own, plus any bad
/// clusters the context carries from an earlier sweep
pub(crate) fn scoring_map<'a>(map: &'a ClusterMap, ctx: &ScanContext) -> Cow<'a, ClusterMap> {
    if ctx.bad_clusters.is_empty() {
        Cow::Borrowed(map)
    } else {
        let mut merged = map.clone();
        merged.merge_bad_clusters(ctx.bad_clusters.iter().copied());
        Cow::Owned(merged)
    }
}

/// Identify the filesystem from its boot sector. Anything unrecognized is raw.
pub fn detect_filesystem(source: &dyn BlockSource) -> FsResult<FileSystemType> {
    if source.size() < 512 {
        return Ok(FileSystemType::Raw);
    }
    let sector = source.read_at(0, 512)?;

    if ntfs::is_ntfs_boot_sector(&sector) {
        return Ok(FileSystemType::Ntfs);
    }
    if fat::is_fat_boot_sector(&sector) {
        return Ok(FileSystemType::Fat);
    }
    Ok(FileSystemType::Raw)
}

/// Detect and load the matching reader
pub fn open_filesystem(source: SharedSource, ctx: &ScanContext) -> FsResult<Box<dyn FileSystem>> {
    let fs_type = detect_filesystem(source.as_ref())?;
    tracing::info!("Detected {} filesystem on {}", fs_type, source.describe());

    let mut fs: Box<dyn FileSystem> = match fs_type {
        FileSystemType::Ntfs => Box::new(ntfs::NtfsFileSystem::new()),
        FileSystemType::Fat => Box::new(fat::FatFileSystem::new()),
        FileSystemType::Raw => Box::new(raw::RawFileSystem::new()),
    };
    fs.load_with(source, ctx)?;
    Ok(fs)
}

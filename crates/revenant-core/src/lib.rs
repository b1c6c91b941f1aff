use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub mod error;
pub mod fs;
pub mod health;
pub mod recovery;
pub mod session;

pub use error::{FsError, FsResult};
pub use fs::{detect_filesystem, open_filesystem, FileSystem};
pub use health::DiskHealthInfo;
pub use recovery::{
    CancellationToken, ExtractionOutcome, HashAlgorithm, PassReport, RecoveryConfig, ScanContext,
    ScanProgress, ScanStage, ScoringPolicy, SignatureCatalog, SignatureCategory,
};
pub use session::{ScanSession, SessionManager};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileSystemType {
    Ntfs,
    Fat,
    Raw,
}

impl std::fmt::Display for FileSystemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileSystemType::Ntfs => write!(f, "NTFS"),
            FileSystemType::Fat => write!(f, "FAT"),
            FileSystemType::Raw => write!(f, "raw"),
        }
    }
}

impl FileSystemType {
    /// Stable lower-case key used in persisted sessions
    pub fn as_str(&self) -> &'static str {
        match self {
            FileSystemType::Ntfs => "ntfs",
            FileSystemType::Fat => "fat",
            FileSystemType::Raw => "raw",
        }
    }
}

impl std::str::FromStr for FileSystemType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ntfs" => Ok(FileSystemType::Ntfs),
            "fat" | "fat12" | "fat16" | "fat32" => Ok(FileSystemType::Fat),
            "raw" => Ok(FileSystemType::Raw),
            other => Err(format!("unknown filesystem type '{}'", other)),
        }
    }
}

/// Which passes a scan runs
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanMode {
    /// Metadata only
    Indexed,
    /// Signature carving only
    Deep,
    /// Metadata, then carving for whatever metadata did not explain
    Combined,
}

impl std::fmt::Display for ScanMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanMode::Indexed => write!(f, "indexed"),
            ScanMode::Deep => write!(f, "deep"),
            ScanMode::Combined => write!(f, "combined"),
        }
    }
}

impl std::str::FromStr for ScanMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "indexed" | "quick" => Ok(ScanMode::Indexed),
            "deep" | "carve" => Ok(ScanMode::Deep),
            "combined" | "full" => Ok(ScanMode::Combined),
            other => Err(format!("unknown scan mode '{}'", other)),
        }
    }
}

/// Snapshot of one live file's metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    pub accessed: Option<DateTime<Utc>>,
    /// DOS-style attribute bits
    pub attributes: u32,
}

impl FileEntry {
    pub fn named(name: String) -> Self {
        Self {
            name,
            ..Default::default()
        }
    }
}

/// A directory and everything below it, built fresh per listing call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub name: String,
    pub path: String,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    pub accessed: Option<DateTime<Utc>>,
    pub is_root: bool,
    pub files: Vec<FileEntry>,
    pub directories: Vec<DirectoryEntry>,
}

impl DirectoryEntry {
    /// Files in this directory and all subdirectories
    pub fn file_count(&self) -> usize {
        self.files.len() + self.directories.iter().map(|d| d.file_count()).sum::<usize>()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecoveryStatus {
    Recoverable,
    Fragmented,
    Overwritten,
    Corrupted,
}

impl std::fmt::Display for RecoveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RecoveryStatus::Recoverable => "recoverable",
            RecoveryStatus::Fragmented => "fragmented",
            RecoveryStatus::Overwritten => "overwritten",
            RecoveryStatus::Corrupted => "corrupted",
        };
        f.write_str(s)
    }
}

/// Where a deleted entry was found, and what a later extraction needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntrySource {
    Metadata { record_number: u64 },
    Carved { start_offset: u64, estimated_length: u64 },
}

/// A sparse stretch inside a cluster list: `length` zero clusters before
/// the allocated cluster at index `position`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SparseGap {
    pub position: u64,
    pub length: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletedFileEntry {
    pub id: u64,
    #[serde(flatten)]
    pub file: FileEntry,
    pub is_deleted: bool,
    pub recovery_status: RecoveryStatus,
    pub recovery_probability: f32,
    /// Absolute clusters in extraction order
    pub fragmented_clusters: Vec<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sparse_gaps: Vec<SparseGap>,
    /// Content stored inside the metadata record itself
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resident_data: Option<Vec<u8>>,
    pub signature_type: Option<String>,
    pub source: EntrySource,
    pub run_count: usize,
}

impl DeletedFileEntry {
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.recovery_status,
            RecoveryStatus::Recoverable | RecoveryStatus::Fragmented
        )
    }

    /// Every cluster slot in extraction order; sparse slots are `None`
    pub fn cluster_slots(&self) -> impl Iterator<Item = Option<u64>> + '_ {
        let mut clusters = self.fragmented_clusters.iter().copied();
        let mut gaps = self.sparse_gaps.iter().peekable();
        let mut position = 0u64;
        let mut zeros_left = 0u64;
        std::iter::from_fn(move || {
            if zeros_left == 0 {
                if let Some(gap) = gaps.next_if(|g| g.position == position) {
                    zeros_left = gap.length;
                }
            }
            let slot = if zeros_left > 0 {
                zeros_left -= 1;
                Some(None)
            } else {
                clusters.next().map(Some)
            };
            position += 1;
            slot
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BadSectorKind {
    Unreadable,
    SlowReadable,
    /// Known only from external drive telemetry
    Reallocated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BadSectorInfo {
    /// Byte offset of the unit within the swept volume
    pub offset: u64,
    pub length: u32,
    /// `offset` in cluster-size units of the volume
    pub cluster: u64,
    pub kind: BadSectorKind,
    pub attempts: u8,
    pub latency_ms: Option<u64>,
}

impl BadSectorInfo {
    pub fn unreadable(offset: u64, length: u32, cluster: u64, attempts: u8) -> Self {
        Self {
            offset,
            length,
            cluster,
            kind: BadSectorKind::Unreadable,
            attempts,
            latency_ms: None,
        }
    }
}

/// Persisted result of one scan; enough to extract later without
/// re-scanning the source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverySession {
    pub id: Uuid,
    pub fs_type: FileSystemType,
    pub device_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub mode: ScanMode,
    pub entries: Vec<DeletedFileEntry>,
    pub bad_sectors: Vec<BadSectorInfo>,
    pub skipped_units: u64,
    pub cancelled: bool,
    pub metadata: SessionMetadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub device_size: u64,
    /// Byte offset of cluster 0 inside the source: the data region for
    /// FAT, zero for NTFS and raw
    pub partition_offset: u64,
    /// Length of the cluster-addressed window
    pub filesystem_size: u64,
    pub cluster_size: u32,
    pub scan_duration_ms: u64,
    pub files_found: u32,
    pub recoverable_files: u32,
}

impl RecoverySession {
    pub fn entry(&self, id: u64) -> Option<&DeletedFileEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn recoverable_entries(&self) -> impl Iterator<Item = &DeletedFileEntry> {
        self.entries.iter().filter(|e| e.is_recoverable())
    }
}

/// Scan an image with the given configuration and return the session
pub fn scan_image(image_path: &Path, config: RecoveryConfig) -> Result<RecoverySession> {
    let ctx = ScanContext::new(config);
    let mut scan = ScanSession::open(image_path, ctx)?;
    scan.run()?;
    Ok(scan.finish())
}

/// Extract entries of a saved session into `output_dir`. With no ids, every
/// recoverable entry is extracted.
pub fn recover_files(
    image_path: &Path,
    session: &RecoverySession,
    output_dir: &Path,
    file_ids: Option<&[u64]>,
    extra_hashes: &[HashAlgorithm],
) -> Result<RecoveryReport> {
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create {}", output_dir.display()))?;

    let source = fs::common::open_source(image_path)
        .with_context(|| format!("Failed to open {}", image_path.display()))?;
    let source: fs::common::SharedSource = if session.metadata.partition_offset > 0 {
        let extent = fs::common::BlockExtent::new(
            session.metadata.partition_offset,
            session.metadata.filesystem_size,
            session.metadata.cluster_size,
        );
        std::sync::Arc::new(fs::common::ExtentSource::new(source, extent)?)
    } else {
        source
    };

    let selected: Vec<&DeletedFileEntry> = match file_ids {
        Some(ids) => session.entries.iter().filter(|e| ids.contains(&e.id)).collect(),
        None => session.recoverable_entries().collect(),
    };

    tracing::info!(
        "Starting recovery of {} files to {}",
        selected.len(),
        output_dir.display()
    );

    let mut report = RecoveryReport {
        total_files: selected.len(),
        output_directory: output_dir.to_path_buf(),
        ..Default::default()
    };

    for entry in selected {
        let recovered_path = generate_recovery_path(output_dir, entry);
        let result = recovery::extract_to_path(
            source.as_ref(),
            session.metadata.cluster_size,
            entry,
            &recovered_path,
            extra_hashes,
        );

        let (state, outcome) = match result {
            Ok(outcome) if outcome.complete => {
                report.recovered_files += 1;
                (ExtractionState::Complete, Some(outcome))
            }
            Ok(outcome) => {
                report.partial_files += 1;
                (ExtractionState::Partial, Some(outcome))
            }
            Err(e) => {
                report.failed_files += 1;
                tracing::warn!("Failed to recover file ID {}: {}", entry.id, e);
                (ExtractionState::Failed(e.to_string()), None)
            }
        };

        let bytes_recovered = outcome.as_ref().map_or(0, |o| o.bytes_written);
        report.total_bytes_recovered += bytes_recovered;
        report.recovery_details.push(FileRecoveryResult {
            file_id: entry.id,
            original_path: entry.file.path.clone(),
            recovered_path,
            size: entry.file.size,
            bytes_recovered,
            state,
            recovery_probability: entry.recovery_probability,
            outcome,
        });
    }

    tracing::info!(
        "Recovery complete: {}/{} files recovered ({} partial), {} bytes total",
        report.recovered_files,
        report.total_files,
        report.partial_files,
        report.total_bytes_recovered
    );

    Ok(report)
}

/// Output path for an entry: its own name, prefixed with the id so two
/// deleted files with the same name never collide
fn generate_recovery_path(output_dir: &Path, entry: &DeletedFileEntry) -> PathBuf {
    let name: String = entry
        .file
        .name
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | ':' | '\0') { '_' } else { c })
        .collect();
    let name = if name.is_empty() || name == "Unknown" {
        let ext = entry
            .signature_type
            .as_deref()
            .and_then(|id| SignatureCatalog::builtin().get(id).map(|s| s.extension))
            .unwrap_or("dat");
        format!("recovered_file.{}", ext)
    } else {
        name
    };
    output_dir.join(format!("{}_{}", entry.id, name))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub total_files: usize,
    pub recovered_files: usize,
    pub partial_files: usize,
    pub failed_files: usize,
    pub total_bytes_recovered: u64,
    pub output_directory: PathBuf,
    pub recovery_details: Vec<FileRecoveryResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecoveryResult {
    pub file_id: u64,
    pub original_path: String,
    pub recovered_path: PathBuf,
    pub size: u64,
    pub bytes_recovered: u64,
    pub state: ExtractionState,
    pub recovery_probability: f32,
    pub outcome: Option<ExtractionOutcome>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExtractionState {
    Complete,
    /// Written, but some clusters were unreadable and zero-filled
    Partial,
    Failed(String),
}

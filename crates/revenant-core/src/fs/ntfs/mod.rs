//! NTFS reader: boot sector, MFT walk, directory tree and deleted-record scan.
//!
//! The MFT is located through record 0's own `$DATA` runs so a fragmented
//! MFT is followed. Slots are parsed independently and in parallel; a
//! corrupt slot is logged and counted, never fatal.

pub mod record;
pub mod runs;
pub mod tree;

use nom::{
    bytes::complete::{tag, take},
    number::complete::{le_i8, le_u16, le_u64, le_u8},
    IResult,
};
use rayon::prelude::*;
use std::borrow::Cow;

use crate::error::{FsError, FsResult};
use crate::fs::common::{BlockSource, SharedSource};
use crate::fs::{scoring_map, FileSystem};
use crate::recovery::{
    clusters::ClusterMap,
    engine::{RecoveryCandidate, RecoveryEngine, ScanContext},
    progress::{run_with_workers, PassReport, ScanStage},
    signatures::SignatureCatalog,
};
use crate::{DeletedFileEntry, DirectoryEntry, FileEntry, FileSystemType};
use record::MftRecord;
use runs::DataRun;
use tree::{DirectoryTree, ROOT_RECORD};

/// Update sequence stride
const FIXUP_STRIDE: usize = 512;
/// Records read per parallel batch during the MFT walk
const RECORD_BATCH: u64 = 256;
/// Largest cluster NTFS formats (2 MiB)
const MAX_CLUSTER_SIZE: u32 = 2 << 20;
const MAX_RECORD_SIZE: u32 = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NtfsBootSector {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u32,
    pub total_sectors: u64,
    pub mft_lcn: u64,
    pub mft_mirror_lcn: u64,
    pub clusters_per_record: i8,
    pub serial_number: u64,
}

impl NtfsBootSector {
    pub fn parse(sector: &[u8]) -> FsResult<Self> {
        let (_, boot) = parse_boot_sector(sector)
            .map_err(|_| FsError::InvalidFormat("not an NTFS boot sector".into()))?;

        if !matches!(boot.bytes_per_sector, 256 | 512 | 1024 | 2048 | 4096) {
            return Err(FsError::InvalidFormat(format!(
                "invalid bytes per sector: {}",
                boot.bytes_per_sector
            )));
        }
        if boot.sectors_per_cluster == 0 || boot.total_sectors == 0 {
            return Err(FsError::InvalidFormat("zero cluster geometry".into()));
        }
        match (boot.bytes_per_sector as u32).checked_mul(boot.sectors_per_cluster) {
            Some(cs) if cs <= MAX_CLUSTER_SIZE => {}
            _ => {
                return Err(FsError::InvalidFormat(format!(
                    "cluster size out of range: {} sectors of {} bytes",
                    boot.sectors_per_cluster, boot.bytes_per_sector
                )))
            }
        }
        if boot.total_sectors.checked_mul(boot.bytes_per_sector as u64).is_none() {
            return Err(FsError::InvalidFormat(format!(
                "volume size overflows: {} sectors",
                boot.total_sectors
            )));
        }
        if boot.record_size() < FIXUP_STRIDE as u32 || boot.record_size() > MAX_RECORD_SIZE {
            return Err(FsError::InvalidFormat(format!(
                "invalid MFT record size: {}",
                boot.record_size()
            )));
        }
        Ok(boot)
    }

    /// Saturates on geometry `parse` would have rejected
    pub fn cluster_size(&self) -> u32 {
        (self.bytes_per_sector as u32).saturating_mul(self.sectors_per_cluster)
    }

    /// Positive values count clusters, negative ones give 2^-n bytes
    pub fn record_size(&self) -> u32 {
        if self.clusters_per_record > 0 {
            (self.clusters_per_record as u32).saturating_mul(self.cluster_size())
        } else {
            1u32.checked_shl((-(self.clusters_per_record as i32)) as u32).unwrap_or(0)
        }
    }

    pub fn volume_size(&self) -> u64 {
        self.total_sectors.saturating_mul(self.bytes_per_sector as u64)
    }

    pub fn total_clusters(&self) -> u64 {
        self.total_sectors / self.sectors_per_cluster as u64
    }
}

fn parse_boot_sector(input: &[u8]) -> IResult<&[u8], NtfsBootSector> {
    let (input, _jump) = take(3usize)(input)?;
    let (input, _oem) = tag(&b"NTFS    "[..])(input)?;
    let (input, bytes_per_sector) = le_u16(input)?;
    let (input, raw_spc) = le_u8(input)?;
    let (input, _bpb) = take(0x28usize - 0x0E)(input)?;
    let (input, total_sectors) = le_u64(input)?;
    let (input, mft_lcn) = le_u64(input)?;
    let (input, mft_mirror_lcn) = le_u64(input)?;
    let (input, clusters_per_record) = le_i8(input)?;
    let (input, _) = take(3usize)(input)?;
    let (input, _clusters_per_index) = le_i8(input)?;
    let (input, _) = take(3usize)(input)?;
    let (input, serial_number) = le_u64(input)?;

    // Values above 0x80 encode 2^(256 - v) on large-cluster volumes
    let sectors_per_cluster = if raw_spc > 0x80 {
        1u32 << (256 - raw_spc as u32).min(31)
    } else {
        raw_spc as u32
    };

    Ok((
        input,
        NtfsBootSector {
            bytes_per_sector,
            sectors_per_cluster,
            total_sectors,
            mft_lcn,
            mft_mirror_lcn,
            clusters_per_record,
            serial_number,
        },
    ))
}

pub fn is_ntfs_boot_sector(sector: &[u8]) -> bool {
    sector.get(3..11) == Some(&b"NTFS    "[..])
}

/// Read `len` bytes of a non-resident stream starting at logical `offset`,
/// following its runs. Sparse runs read as zeros.
pub fn read_stream(
    source: &dyn BlockSource,
    runs: &[DataRun],
    cluster_size: u32,
    offset: u64,
    len: usize,
) -> FsResult<Vec<u8>> {
    let cs = cluster_size as u64;
    let covered = runs::total_clusters(runs).saturating_mul(cs);
    let end = match offset.checked_add(len as u64) {
        Some(end) if end <= covered => end,
        _ => {
            return Err(FsError::InvalidFormat(format!(
                "{} bytes at stream offset {} exceed the {} bytes its runs cover",
                len, offset, covered
            )))
        }
    };
    // Bound every touched extent by the source before allocating
    let mut run_start = 0u64;
    for run in runs {
        let run_end = run_start.saturating_add(run.length.saturating_mul(cs));
        if let (Some(lcn), true) = (run.start_cluster, run_end > offset && run_start < end) {
            let to = end.min(run_end) - run_start;
            let physical_end = lcn.checked_mul(cs).and_then(|p| p.checked_add(to));
            match physical_end {
                Some(e) if e <= source.size() => {}
                _ => {
                    return Err(FsError::OutOfRange {
                        offset: lcn.saturating_mul(cs),
                        len: to as usize,
                        size: source.size(),
                    })
                }
            }
        }
        if run_end >= end {
            break;
        }
        run_start = run_end;
    }

    let mut out = Vec::with_capacity(len);
    let mut run_start = 0u64;

    for run in runs {
        let run_end = run_start.saturating_add(run.length.saturating_mul(cs));
        if run_end > offset && run_start < end {
            let from = offset.max(run_start);
            let to = end.min(run_end);
            let piece = (to - from) as usize;
            match run.start_cluster {
                Some(lcn) => out.extend(source.read_at(lcn * cs + (from - run_start), piece)?),
                None => out.resize(out.len() + piece, 0),
            }
        }
        if run_end >= end {
            break;
        }
        run_start = run_end;
    }

    if out.len() < len {
        return Err(FsError::InvalidFormat(format!(
            "stream ends at {} bytes, {} requested",
            offset + out.len() as u64,
            end
        )));
    }
    Ok(out)
}

struct NtfsState {
    source: SharedSource,
    boot: NtfsBootSector,
    /// Sorted by record number
    records: Vec<MftRecord>,
    tree: DirectoryTree,
    cluster_map: ClusterMap,
    skipped_records: u64,
    load_cancelled: bool,
}

impl NtfsState {
    fn record(&self, number: u64) -> Option<&MftRecord> {
        self.records
            .binary_search_by_key(&number, |r| r.record_number)
            .ok()
            .map(|i| &self.records[i])
    }

    fn parent_path(&self, record: &MftRecord) -> Option<String> {
        let parent = record.parent_record()?;
        if parent == ROOT_RECORD {
            return Some("/".into());
        }
        if !self.tree.is_directory(parent) {
            return None;
        }
        self.tree.file_entry(parent).map(|e| e.path.clone())
    }
}

#[derive(Default)]
pub struct NtfsFileSystem {
    state: Option<NtfsState>,
}

impl NtfsFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> FsResult<&NtfsState> {
        self.state.as_ref().ok_or(FsError::NotLoaded)
    }

    pub fn boot_sector(&self) -> FsResult<&NtfsBootSector> {
        Ok(&self.state()?.boot)
    }

    /// Every parsed record, live and deleted
    pub fn records(&self) -> FsResult<&[MftRecord]> {
        Ok(&self.state()?.records)
    }

    /// Slots that failed to parse during load
    pub fn skipped_records(&self) -> FsResult<u64> {
        Ok(self.state()?.skipped_records)
    }

    /// The MFT's extent and slot count, from record 0 when it is readable
    fn locate_mft(
        source: &dyn BlockSource,
        boot: &NtfsBootSector,
        max_records: u64,
    ) -> FsResult<(Vec<DataRun>, u64)> {
        let cs = boot.cluster_size() as u64;
        let record_size = boot.record_size() as u64;
        let mft_offset = boot
            .mft_lcn
            .checked_mul(cs)
            .ok_or_else(|| FsError::InvalidFormat(format!("MFT cluster {} is out of range", boot.mft_lcn)))?;
        let slot_limit = max_records.min(source.size() / record_size);

        let record_zero = source
            .read_at(mft_offset, record_size as usize)
            .and_then(|raw| MftRecord::parse(&raw, 0, FIXUP_STRIDE));
        match record_zero {
            Ok(Some(record)) => {
                if let Some(data) = record.data().filter(|d| !d.resident && !d.runs.is_empty()) {
                    let covered = runs::total_clusters(&data.runs).saturating_mul(cs);
                    let declared = if data.real_size > 0 { data.real_size } else { covered };
                    let count = (declared.min(covered) / record_size).min(slot_limit);
                    return Ok((data.runs.clone(), count));
                }
                tracing::warn!("$MFT record has no usable $DATA runs, assuming a contiguous MFT");
            }
            Ok(None) => tracing::warn!("$MFT record slot is empty, assuming a contiguous MFT"),
            Err(e) => tracing::warn!("$MFT record unreadable ({}), assuming a contiguous MFT", e),
        }

        let available = source.size().saturating_sub(mft_offset) / record_size;
        let count = available.min(slot_limit);
        let clusters = (count * record_size).div_ceil(cs);
        Ok((vec![DataRun::new(boot.mft_lcn, clusters)], count))
    }

    fn parse_batch(
        source: &dyn BlockSource,
        runs: &[DataRun],
        boot: &NtfsBootSector,
        first: u64,
        count: u64,
    ) -> (Vec<MftRecord>, u64) {
        let record_size = boot.record_size() as u64;
        let cs = boot.cluster_size();
        let mut records = Vec::new();
        let mut skipped = 0;
        let mut unreadable = 0;

        let mut parse_slot = |raw: &[u8], number: u64| match MftRecord::parse(raw, number, FIXUP_STRIDE) {
            Ok(Some(record)) => records.push(record),
            Ok(None) => {}
            Err(e) => {
                tracing::debug!("Skipping MFT slot {}: {}", number, e);
                skipped += 1;
            }
        };

        match read_stream(source, runs, cs, first * record_size, (count * record_size) as usize) {
            Ok(buffer) => {
                for (i, raw) in buffer.chunks_exact(record_size as usize).enumerate() {
                    parse_slot(raw, first + i as u64);
                }
            }
            Err(_) => {
                for number in first..first + count {
                    match read_stream(source, runs, cs, number * record_size, record_size as usize) {
                        Ok(raw) => parse_slot(&raw, number),
                        Err(e) => {
                            tracing::debug!("MFT slot {} unreadable: {}", number, e);
                            unreadable += 1;
                        }
                    }
                }
            }
        }
        (records, skipped + unreadable)
    }
}

impl FileSystem for NtfsFileSystem {
    fn filesystem_type(&self) -> FileSystemType {
        FileSystemType::Ntfs
    }

    fn load_with(&mut self, source: SharedSource, ctx: &ScanContext) -> FsResult<()> {
        if self.state.is_some() {
            return Err(FsError::AlreadyLoaded);
        }

        let sector = source.read_at(0, 512)?;
        let boot = NtfsBootSector::parse(&sector)?;
        tracing::info!(
            "NTFS volume: {} bytes, cluster size {}, record size {}, MFT at cluster {}",
            boot.volume_size(),
            boot.cluster_size(),
            boot.record_size(),
            boot.mft_lcn
        );

        let (mft_runs, record_count) = Self::locate_mft(source.as_ref(), &boot, ctx.config.max_mft_records)?;
        let batch_count = record_count.div_ceil(RECORD_BATCH);
        let reporter = ctx.reporter(ScanStage::IndexScan, record_count);

        let batches: Vec<(Vec<MftRecord>, u64)> = run_with_workers(ctx.config.workers, || {
            (0..batch_count)
                .into_par_iter()
                .map(|batch| {
                    if ctx.cancel.is_cancelled() {
                        return (Vec::new(), 0);
                    }
                    let first = batch * RECORD_BATCH;
                    let count = RECORD_BATCH.min(record_count - first);
                    let result = Self::parse_batch(source.as_ref(), &mft_runs, &boot, first, count);
                    reporter.advance(count, result.0.len() as u64);
                    result
                })
                .collect()
        });
        reporter.finish();

        let mut records = Vec::new();
        let mut skipped_records = 0;
        for (batch, skipped) in batches {
            records.extend(batch);
            skipped_records += skipped;
        }
        records.sort_by_key(|r| r.record_number);

        let load_cancelled = ctx.cancel.is_cancelled();
        if skipped_records > 0 {
            tracing::warn!("Skipped {} corrupt MFT slots", skipped_records);
        }
        if load_cancelled {
            tracing::warn!("MFT walk cancelled after {} records", records.len());
        }

        let tree = DirectoryTree::build(&records);
        let mut cluster_map = ClusterMap::new(boot.total_clusters());
        for record in records.iter().filter(|r| r.is_in_use()) {
            let owner = if record.base_record != 0 {
                record.base_record
            } else {
                record.record_number
            };
            let Some(data) = record.data() else { continue };
            for run in &data.runs {
                if let Some(lcn) = run.start_cluster {
                    cluster_map.insert_run(lcn, run.length, owner);
                }
            }
        }

        tracing::info!(
            "Parsed {} MFT records ({} in the directory tree, {} allocated clusters)",
            records.len(),
            tree.len(),
            cluster_map.allocated_cluster_count()
        );

        self.state = Some(NtfsState {
            source,
            boot,
            records,
            tree,
            cluster_map,
            skipped_records,
            load_cancelled,
        });
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.state.is_some()
    }

    fn source(&self) -> FsResult<&SharedSource> {
        Ok(&self.state()?.source)
    }

    fn cluster_size(&self) -> FsResult<u32> {
        Ok(self.state()?.boot.cluster_size())
    }

    fn total_clusters(&self) -> FsResult<u64> {
        Ok(self.state()?.boot.total_clusters())
    }

    fn cluster_map(&self) -> FsResult<&ClusterMap> {
        Ok(&self.state()?.cluster_map)
    }

    fn list_directories(&self, path: &str) -> FsResult<Vec<DirectoryEntry>> {
        self.state()?.tree.list_directories(path)
    }

    fn list_files(&self, path: &str) -> FsResult<Vec<FileEntry>> {
        self.state()?.tree.list_files(path)
    }

    fn directory_tree(&self) -> FsResult<DirectoryEntry> {
        Ok(self.state()?.tree.root())
    }

    fn read_file(&self, path: &str) -> FsResult<Vec<u8>> {
        let state = self.state()?;
        let number = state.tree.resolve(path)?;
        if state.tree.is_directory(number) || number == ROOT_RECORD {
            return Err(FsError::PathNotFound(path.to_string()));
        }
        let record = state
            .record(number)
            .ok_or_else(|| FsError::PathNotFound(path.to_string()))?;

        let Some(data) = record.data() else {
            return Ok(Vec::new());
        };
        if data.compressed || data.encrypted {
            return Err(FsError::InvalidFormat(format!(
                "{} has a compressed or encrypted stream",
                path
            )));
        }
        if let Some(inline) = &data.resident_data {
            let len = (data.real_size as usize).min(inline.len());
            return Ok(inline[..len].to_vec());
        }
        let cs = state.boot.cluster_size() as u64;
        let covered = runs::total_clusters(&data.runs).saturating_mul(cs);
        let len = usize::try_from(data.real_size)
            .ok()
            .filter(|_| data.real_size <= covered)
            .ok_or_else(|| {
                FsError::InvalidFormat(format!(
                    "{} declares {} bytes but its runs cover {}",
                    path, data.real_size, covered
                ))
            })?;
        read_stream(state.source.as_ref(), &data.runs, state.boot.cluster_size(), 0, len)
    }

    fn scan_deleted(&self, ctx: &ScanContext) -> FsResult<PassReport<DeletedFileEntry>> {
        let state = self.state()?;
        let candidates: Vec<RecoveryCandidate> = state
            .records
            .iter()
            .filter(|r| r.is_deleted() && !r.is_system_file() && r.base_record == 0)
            .map(|r| RecoveryCandidate::from_mft(r, state.parent_path(r).as_deref()))
            .collect();

        tracing::info!("Scoring {} deleted MFT records", candidates.len());

        let map: Cow<'_, ClusterMap> = scoring_map(&state.cluster_map, ctx);
        let catalog = SignatureCatalog::builtin();
        let engine = RecoveryEngine::new(
            state.source.as_ref(),
            state.boot.cluster_size(),
            &ctx.config.scoring,
            &catalog,
            &map,
        );
        let mut report = run_with_workers(ctx.config.workers, || engine.evaluate_all(candidates, ctx));
        report.skipped_units += state.skipped_records;
        report.cancelled |= state.load_cancelled;

        tracing::info!(
            "Found {} eligible deleted files ({} recoverable)",
            report.items.len(),
            report.items.iter().filter(|e| e.is_recoverable()).count()
        );
        Ok(report)
    }
}

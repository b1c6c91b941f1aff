//! FAT12/16/32 reader
//!
//! Clusters are addressed relative to the data region: cluster index `n`
//! is FAT cluster `n + 2`, and `source()` is a window starting at the data
//! region so carving, sweeps and extraction work unchanged on FAT volumes.
//!
//! Deleted entries keep their start cluster and size but lose their chain,
//! so their content is assumed contiguous from the start cluster.

pub mod builder;
pub mod directory;
pub mod table;

use byteorder::{LittleEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Cursor;
use std::sync::Arc;

use crate::error::{FsError, FsResult};
use crate::fs::common::{BlockExtent, ExtentSource, SharedSource};
use crate::fs::ntfs::runs::DataRun;
use crate::fs::{scoring_map, FileSystem};
use crate::recovery::{
    clusters::ClusterMap,
    engine::{CandidateData, RecoveryCandidate, RecoveryEngine, ScanContext},
    progress::{run_with_workers, PassReport, ScanStage},
    signatures::SignatureCatalog,
};
use crate::{DeletedFileEntry, DirectoryEntry, EntrySource, FileEntry, FileSystemType};
use directory::{parse_directory, FatDirEntry, ENTRY_SIZE};
use table::FatTable;

/// Clusters below this count are FAT12
const FAT12_MAX_CLUSTERS: u32 = 4085;
/// Largest directory the format allows (65536 entries)
const MAX_DIRECTORY_BYTES: usize = 65536 * ENTRY_SIZE;
/// Owner recorded for allocated clusters no live entry claims
const LOST_CHAIN_OWNER: u64 = u64::MAX;
const ROOT_NODE: usize = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FatVariant {
    Fat12,
    Fat16,
    Fat32,
}

impl std::fmt::Display for FatVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FatVariant::Fat12 => write!(f, "FAT12"),
            FatVariant::Fat16 => write!(f, "FAT16"),
            FatVariant::Fat32 => write!(f, "FAT32"),
        }
    }
}

/// BIOS parameter block fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatBootSector {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub num_fats: u8,
    pub root_entry_count: u16,
    pub total_sectors: u32,
    /// Sectors per FAT copy
    pub fat_size: u32,
    /// FAT32 only
    pub root_cluster: u32,
    pub variant: FatVariant,
}

impl FatBootSector {
    pub fn parse(sector: &[u8]) -> FsResult<Self> {
        if sector.len() < 512 {
            return Err(FsError::InvalidFormat("FAT boot sector too short".into()));
        }
        let boot = Self::read_fields(sector)
            .map_err(|e| FsError::InvalidFormat(format!("truncated FAT boot sector: {}", e)))?;

        if !matches!(boot.bytes_per_sector, 512 | 1024 | 2048 | 4096) {
            return Err(FsError::InvalidFormat(format!(
                "invalid bytes per sector: {}",
                boot.bytes_per_sector
            )));
        }
        if !boot.sectors_per_cluster.is_power_of_two() {
            return Err(FsError::InvalidFormat(format!(
                "invalid sectors per cluster: {}",
                boot.sectors_per_cluster
            )));
        }
        if boot.reserved_sectors == 0 || boot.num_fats == 0 || boot.fat_size == 0 || boot.total_sectors == 0 {
            return Err(FsError::InvalidFormat("zero FAT geometry".into()));
        }
        if boot.first_data_sector() >= boot.total_sectors as u64 {
            return Err(FsError::InvalidFormat("data region starts past the volume end".into()));
        }
        if boot.variant == FatVariant::Fat32 && boot.root_cluster < 2 {
            return Err(FsError::InvalidFormat(format!(
                "invalid FAT32 root cluster: {}",
                boot.root_cluster
            )));
        }
        Ok(boot)
    }

    fn read_fields(sector: &[u8]) -> std::io::Result<Self> {
        let mut cursor = Cursor::new(&sector[0x0B..]);
        let bytes_per_sector = cursor.read_u16::<LittleEndian>()?;
        let sectors_per_cluster = cursor.read_u8()?;
        let reserved_sectors = cursor.read_u16::<LittleEndian>()?;
        let num_fats = cursor.read_u8()?;
        let root_entry_count = cursor.read_u16::<LittleEndian>()?;
        let total_sectors_16 = cursor.read_u16::<LittleEndian>()?;
        let _media = cursor.read_u8()?;
        let fat_size_16 = cursor.read_u16::<LittleEndian>()?;
        let _sectors_per_track = cursor.read_u16::<LittleEndian>()?;
        let _heads = cursor.read_u16::<LittleEndian>()?;
        let _hidden_sectors = cursor.read_u32::<LittleEndian>()?;
        let total_sectors_32 = cursor.read_u32::<LittleEndian>()?;
        let fat_size_32 = cursor.read_u32::<LittleEndian>()?;
        let _ext_flags = cursor.read_u16::<LittleEndian>()?;
        let _fs_version = cursor.read_u16::<LittleEndian>()?;
        let root_cluster = cursor.read_u32::<LittleEndian>()?;

        let total_sectors = if total_sectors_16 != 0 {
            total_sectors_16 as u32
        } else {
            total_sectors_32
        };
        // A zero 16-bit FAT size marks the FAT32 BPB layout
        let (fat_size, is_fat32) = if fat_size_16 == 0 {
            (fat_size_32, true)
        } else {
            (fat_size_16 as u32, false)
        };

        let mut boot = Self {
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors,
            num_fats,
            root_entry_count,
            total_sectors,
            fat_size,
            root_cluster: if is_fat32 { root_cluster } else { 0 },
            variant: FatVariant::Fat32,
        };
        if !is_fat32 {
            boot.variant = if boot.cluster_count() < FAT12_MAX_CLUSTERS as u64 {
                FatVariant::Fat12
            } else {
                FatVariant::Fat16
            };
        }
        Ok(boot)
    }

    pub fn cluster_size(&self) -> u32 {
        self.bytes_per_sector as u32 * self.sectors_per_cluster as u32
    }

    pub fn fat_offset(&self) -> u64 {
        self.reserved_sectors as u64 * self.bytes_per_sector as u64
    }

    pub fn fat_bytes(&self) -> u64 {
        self.fat_size as u64 * self.bytes_per_sector as u64
    }

    fn root_dir_sectors(&self) -> u64 {
        (self.root_entry_count as u64 * ENTRY_SIZE as u64).div_ceil(self.bytes_per_sector.max(1) as u64)
    }

    fn first_data_sector(&self) -> u64 {
        self.reserved_sectors as u64 + self.num_fats as u64 * self.fat_size as u64 + self.root_dir_sectors()
    }

    /// Fixed root directory region (FAT12/16)
    pub fn root_dir_offset(&self) -> u64 {
        self.fat_offset() + self.num_fats as u64 * self.fat_bytes()
    }

    pub fn root_dir_bytes(&self) -> u64 {
        self.root_entry_count as u64 * ENTRY_SIZE as u64
    }

    /// Byte offset of FAT cluster 2
    pub fn data_offset(&self) -> u64 {
        self.first_data_sector() * self.bytes_per_sector as u64
    }

    pub fn cluster_count(&self) -> u64 {
        let data_sectors = (self.total_sectors as u64).saturating_sub(self.first_data_sector());
        data_sectors / self.sectors_per_cluster.max(1) as u64
    }

    pub fn volume_size(&self) -> u64 {
        self.total_sectors as u64 * self.bytes_per_sector as u64
    }
}

/// FAT32 carries its type label at 82; FAT12/16 at 54 with the boot signature
pub fn is_fat_boot_sector(sector: &[u8]) -> bool {
    if sector.get(82..90) == Some(&b"FAT32   "[..]) {
        return true;
    }
    let label = sector.get(54..62);
    let signed = sector.get(510..512) == Some(&[0x55, 0xAA][..]);
    signed && (label == Some(&b"FAT16   "[..]) || label == Some(&b"FAT12   "[..]))
}

/// Where a directory's entries live
#[derive(Debug, Clone)]
enum DirLocation {
    /// FAT12/16 root region, volume-relative
    Fixed { offset: u64, length: u64 },
    /// FAT cluster chain
    Chain(Vec<u32>),
}

#[derive(Debug, Clone)]
struct FatNode {
    entry: FileEntry,
    is_directory: bool,
    first_cluster: u32,
    children: Vec<usize>,
}

#[derive(Debug, Clone)]
struct DeletedDirEntry {
    /// Volume byte offset of the short entry / 32
    id: u64,
    parent_path: String,
    entry: FatDirEntry,
}

struct FatState {
    volume: SharedSource,
    data: SharedSource,
    boot: FatBootSector,
    table: FatTable,
    nodes: Vec<FatNode>,
    /// (parent node, lower-cased name) -> node
    by_name: HashMap<(usize, String), usize>,
    deleted: Vec<DeletedDirEntry>,
    cluster_map: ClusterMap,
    skipped_directories: u64,
    load_cancelled: bool,
}

impl FatState {
    fn read_directory(&self, location: &DirLocation) -> (Vec<u8>, bool) {
        match location {
            DirLocation::Fixed { offset, length } => match self.volume.read_at(*offset, *length as usize) {
                Ok(bytes) => (bytes, true),
                Err(e) => {
                    tracing::warn!("Root directory region unreadable: {}", e);
                    (Vec::new(), false)
                }
            },
            DirLocation::Chain(chain) => {
                let cs = self.boot.cluster_size();
                let mut bytes = Vec::with_capacity(chain.len() * cs as usize);
                for &cluster in chain {
                    match self.data.read_cluster(cluster as u64 - 2, cs) {
                        Ok(chunk) => bytes.extend(chunk),
                        Err(e) => {
                            tracing::warn!("Directory cluster {} unreadable: {}", cluster, e);
                            return (bytes, false);
                        }
                    }
                }
                (bytes, true)
            }
        }
    }

    /// Volume byte offset of the `index`-th entry of a directory
    fn entry_offset(&self, location: &DirLocation, index: usize) -> u64 {
        let byte = (index * ENTRY_SIZE) as u64;
        match location {
            DirLocation::Fixed { offset, .. } => offset + byte,
            DirLocation::Chain(chain) => {
                let cs = self.boot.cluster_size() as u64;
                let cluster = chain.get((byte / cs) as usize).copied().unwrap_or(2);
                self.boot.data_offset() + (cluster as u64 - 2) * cs + byte % cs
            }
        }
    }

    fn chain_location(&self, first_cluster: u32) -> DirLocation {
        let max_clusters = MAX_DIRECTORY_BYTES / self.boot.cluster_size() as usize;
        let mut chain = self.table.get_chain(first_cluster);
        chain.truncate(max_clusters.max(1));
        DirLocation::Chain(chain)
    }

    fn add_chain_to_map(&mut self, first_cluster: u32, owner: u64) -> u64 {
        let chain = self.table.get_chain(first_cluster);
        let mut run: Option<(u64, u64)> = None;
        for index in chain.iter().map(|&c| c as u64 - 2) {
            run = match run {
                Some((start, len)) if start + len == index => Some((start, len + 1)),
                Some((start, len)) => {
                    self.cluster_map.insert_run(start, len, owner);
                    Some((index, 1))
                }
                None => Some((index, 1)),
            };
        }
        if let Some((start, len)) = run {
            self.cluster_map.insert_run(start, len, owner);
        }
        chain.len() as u64
    }

    fn walk(&mut self, ctx: &ScanContext) {
        let allocated: u64 = self.table.allocated_runs().iter().map(|(_, len)| *len as u64).sum();
        let reporter = ctx.reporter(ScanStage::IndexScan, allocated);

        let root_location = match self.boot.variant {
            FatVariant::Fat32 => self.chain_location(self.boot.root_cluster),
            _ => DirLocation::Fixed {
                offset: self.boot.root_dir_offset(),
                length: self.boot.root_dir_bytes(),
            },
        };
        if self.boot.variant == FatVariant::Fat32 {
            let walked = self.add_chain_to_map(self.boot.root_cluster, ROOT_NODE as u64);
            reporter.advance(walked, 0);
        }

        let mut queue = VecDeque::from([(ROOT_NODE, root_location)]);
        let mut visited: HashSet<u32> = HashSet::from([self.boot.root_cluster]);
        while let Some((node, location)) = queue.pop_front() {
            if ctx.cancel.is_cancelled() {
                self.load_cancelled = true;
                tracing::warn!("FAT directory walk cancelled");
                break;
            }
            let (raw, complete) = self.read_directory(&location);
            if !complete {
                self.skipped_directories += 1;
            }

            let parent_path = self.nodes[node].entry.path.clone();
            let mut found = 0;
            for entry in parse_directory(&raw) {
                if entry.is_volume_label() || entry.is_dot_entry() {
                    continue;
                }
                let id = self.entry_offset(&location, entry.index) / ENTRY_SIZE as u64;
                if entry.is_deleted {
                    self.deleted.push(DeletedDirEntry {
                        id,
                        parent_path: parent_path.clone(),
                        entry,
                    });
                    continue;
                }

                found += 1;
                let child = self.nodes.len();
                let path = join_path(&parent_path, &entry.name);
                self.by_name.insert((node, entry.name.to_lowercase()), child);
                self.nodes.push(FatNode {
                    entry: FileEntry {
                        name: entry.name.clone(),
                        path,
                        size: if entry.is_directory() { 0 } else { entry.size as u64 },
                        created: entry.created,
                        modified: entry.modified,
                        accessed: entry.accessed,
                        attributes: entry.attributes as u32,
                    },
                    is_directory: entry.is_directory(),
                    first_cluster: entry.first_cluster,
                    children: Vec::new(),
                });
                self.nodes[node].children.push(child);

                if entry.first_cluster >= 2 {
                    let walked = self.add_chain_to_map(entry.first_cluster, id);
                    reporter.advance(walked, 0);
                    if entry.is_directory() && visited.insert(entry.first_cluster) {
                        queue.push_back((child, self.chain_location(entry.first_cluster)));
                    }
                }
            }
            reporter.advance(0, found);
        }
        reporter.finish();

        // Chains no live entry reaches still hold data
        let mut lost = 0;
        for (start, length) in self.table.allocated_runs() {
            for cluster in start..start + length {
                let index = cluster as u64 - 2;
                if !self.cluster_map.is_attributed(index) {
                    self.cluster_map.insert_run(index, 1, LOST_CHAIN_OWNER);
                    lost += 1;
                }
            }
        }
        if lost > 0 {
            tracing::debug!("{} allocated clusters belong to no live entry", lost);
        }
        for cluster in 2..self.table.len() as u32 {
            if self.table.is_bad(cluster) {
                self.cluster_map.mark_bad(cluster as u64 - 2);
            }
        }
    }

    fn resolve(&self, path: &str) -> FsResult<usize> {
        let mut current = ROOT_NODE;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            current = *self
                .by_name
                .get(&(current, component.to_lowercase()))
                .ok_or_else(|| FsError::PathNotFound(path.to_string()))?;
        }
        Ok(current)
    }

    fn resolve_directory(&self, path: &str) -> FsResult<usize> {
        let node = self.resolve(path)?;
        if !self.nodes[node].is_directory {
            return Err(FsError::PathNotFound(path.to_string()));
        }
        Ok(node)
    }

    fn materialize(&self, node: usize) -> DirectoryEntry {
        let current = &self.nodes[node];
        let mut entry = DirectoryEntry {
            name: current.entry.name.clone(),
            path: current.entry.path.clone(),
            created: current.entry.created,
            modified: current.entry.modified,
            accessed: current.entry.accessed,
            is_root: node == ROOT_NODE,
            files: Vec::new(),
            directories: Vec::new(),
        };
        for &child in &current.children {
            if self.nodes[child].is_directory {
                entry.directories.push(self.materialize(child));
            } else {
                entry.files.push(self.nodes[child].entry.clone());
            }
        }
        entry
    }

    /// Deleted short entry to recovery candidate; the start cluster and
    /// size give a contiguous run
    fn candidate(&self, deleted: &DeletedDirEntry) -> RecoveryCandidate {
        let entry = &deleted.entry;
        let cs = self.boot.cluster_size() as u64;
        let total = self.boot.cluster_count();

        let data = (entry.first_cluster >= 2 && entry.size > 0 && ((entry.first_cluster - 2) as u64) < total)
            .then(|| {
                let start = (entry.first_cluster - 2) as u64;
                let needed = (entry.size as u64).div_ceil(cs);
                CandidateData {
                    runs: vec![DataRun::new(start, needed.min(total - start))],
                    resident_data: None,
                    compressed: false,
                    encrypted: false,
                }
            });

        RecoveryCandidate {
            id: deleted.id,
            source: EntrySource::Metadata { record_number: deleted.id },
            file: FileEntry {
                name: entry.name.clone(),
                path: join_path(&deleted.parent_path, &entry.name),
                size: entry.size as u64,
                created: entry.created,
                modified: entry.modified,
                accessed: entry.accessed,
                attributes: entry.attributes as u32,
            },
            has_standard_information: entry.created.is_some() || entry.modified.is_some(),
            has_file_name: entry.has_long_name,
            data,
            owner: None,
        }
    }
}

fn join_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

#[derive(Default)]
pub struct FatFileSystem {
    state: Option<FatState>,
}

impl FatFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> FsResult<&FatState> {
        self.state.as_ref().ok_or(FsError::NotLoaded)
    }

    pub fn boot_sector(&self) -> FsResult<&FatBootSector> {
        Ok(&self.state()?.boot)
    }

    pub fn table(&self) -> FsResult<&FatTable> {
        Ok(&self.state()?.table)
    }

    /// Directories that could be read only partially during load
    pub fn skipped_directories(&self) -> FsResult<u64> {
        Ok(self.state()?.skipped_directories)
    }

    /// First readable FAT copy
    fn read_table(volume: &SharedSource, boot: &FatBootSector) -> FsResult<FatTable> {
        let entries = (boot.cluster_count() + 2) as usize;
        let mut last_error = None;
        for copy in 0..boot.num_fats as u64 {
            let offset = boot.fat_offset() + copy * boot.fat_bytes();
            match volume.read_at(offset, boot.fat_bytes() as usize) {
                Ok(bytes) => return Ok(FatTable::parse(&bytes, boot.variant, entries)),
                Err(e) => {
                    tracing::warn!("FAT copy {} unreadable: {}", copy, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| FsError::InvalidFormat("no FAT copies".into())))
    }
}

impl FileSystem for FatFileSystem {
    fn filesystem_type(&self) -> FileSystemType {
        FileSystemType::Fat
    }

    fn load_with(&mut self, source: SharedSource, ctx: &ScanContext) -> FsResult<()> {
        if self.state.is_some() {
            return Err(FsError::AlreadyLoaded);
        }

        let sector = source.read_at(0, 512)?;
        let boot = FatBootSector::parse(&sector)?;
        let cs = boot.cluster_size();
        tracing::info!(
            "{} volume: {} bytes, cluster size {}, {} clusters, data at {:#x}",
            boot.variant,
            boot.volume_size(),
            cs,
            boot.cluster_count(),
            boot.data_offset()
        );

        let table = Self::read_table(&source, &boot)?;

        let available = source.size().saturating_sub(boot.data_offset()) / cs as u64;
        let clusters = boot.cluster_count().min(available);
        if clusters < boot.cluster_count() {
            tracing::warn!(
                "Image holds {} of {} data clusters, the volume is truncated",
                clusters,
                boot.cluster_count()
            );
        }
        let extent = BlockExtent::new(boot.data_offset(), clusters * cs as u64, cs);
        let data: SharedSource = Arc::new(ExtentSource::new(source.clone(), extent)?);

        let root = FatNode {
            entry: FileEntry {
                path: "/".into(),
                ..FileEntry::named(String::new())
            },
            is_directory: true,
            first_cluster: boot.root_cluster,
            children: Vec::new(),
        };
        let mut state = FatState {
            volume: source,
            data,
            boot,
            table,
            nodes: vec![root],
            by_name: HashMap::new(),
            deleted: Vec::new(),
            cluster_map: ClusterMap::new(boot.cluster_count()),
            skipped_directories: 0,
            load_cancelled: false,
        };
        state.walk(ctx);

        tracing::info!(
            "Walked {} live entries and {} deleted entries ({} allocated clusters)",
            state.nodes.len() - 1,
            state.deleted.len(),
            state.cluster_map.allocated_cluster_count()
        );
        if state.skipped_directories > 0 {
            tracing::warn!("{} directories were only partially readable", state.skipped_directories);
        }

        self.state = Some(state);
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.state.is_some()
    }

    fn source(&self) -> FsResult<&SharedSource> {
        Ok(&self.state()?.data)
    }

    fn volume(&self) -> FsResult<&SharedSource> {
        Ok(&self.state()?.volume)
    }

    fn cluster_origin(&self) -> FsResult<u64> {
        Ok(self.state()?.boot.data_offset())
    }

    fn cluster_size(&self) -> FsResult<u32> {
        Ok(self.state()?.boot.cluster_size())
    }

    fn total_clusters(&self) -> FsResult<u64> {
        Ok(self.state()?.boot.cluster_count())
    }

    fn cluster_map(&self) -> FsResult<&ClusterMap> {
        Ok(&self.state()?.cluster_map)
    }

    fn list_directories(&self, path: &str) -> FsResult<Vec<DirectoryEntry>> {
        let state = self.state()?;
        let node = state.resolve_directory(path)?;
        Ok(state.nodes[node]
            .children
            .iter()
            .filter(|c| state.nodes[**c].is_directory)
            .map(|c| state.materialize(*c))
            .collect())
    }

    fn list_files(&self, path: &str) -> FsResult<Vec<FileEntry>> {
        let state = self.state()?;
        let node = state.resolve_directory(path)?;
        Ok(state.nodes[node]
            .children
            .iter()
            .map(|c| &state.nodes[*c])
            .filter(|n| !n.is_directory)
            .map(|n| n.entry.clone())
            .collect())
    }

    fn directory_tree(&self) -> FsResult<DirectoryEntry> {
        Ok(self.state()?.materialize(ROOT_NODE))
    }

    fn read_file(&self, path: &str) -> FsResult<Vec<u8>> {
        let state = self.state()?;
        let node = &state.nodes[state.resolve(path)?];
        if node.is_directory {
            return Err(FsError::PathNotFound(path.to_string()));
        }
        let size = node.entry.size as usize;
        if size == 0 {
            return Ok(Vec::new());
        }

        let cs = state.boot.cluster_size();
        let chain = state.table.get_chain(node.first_cluster);
        if chain.len() < size.div_ceil(cs as usize) {
            return Err(FsError::InvalidFormat(format!(
                "cluster chain of {} covers {} of {} bytes",
                path,
                chain.len() * cs as usize,
                size
            )));
        }
        let mut out = Vec::with_capacity(size);
        for &cluster in &chain {
            if out.len() >= size {
                break;
            }
            out.extend(state.data.read_cluster(cluster as u64 - 2, cs)?);
        }
        out.truncate(size);
        Ok(out)
    }

    fn scan_deleted(&self, ctx: &ScanContext) -> FsResult<PassReport<DeletedFileEntry>> {
        let state = self.state()?;
        let candidates: Vec<RecoveryCandidate> = state
            .deleted
            .iter()
            .filter(|d| !d.entry.is_directory())
            .map(|d| state.candidate(d))
            .collect();

        tracing::info!("Scoring {} deleted directory entries", candidates.len());

        let map: Cow<'_, ClusterMap> = scoring_map(&state.cluster_map, ctx);
        let catalog = SignatureCatalog::builtin();
        let engine = RecoveryEngine::new(
            state.data.as_ref(),
            state.boot.cluster_size(),
            &ctx.config.scoring,
            &catalog,
            &map,
        );
        let mut report = run_with_workers(ctx.config.workers, || engine.evaluate_all(candidates, ctx));
        report.skipped_units += state.skipped_directories;
        report.cancelled |= state.load_cancelled;

        tracing::info!(
            "Found {} eligible deleted files ({} recoverable)",
            report.items.len(),
            report.items.iter().filter(|e| e.is_recoverable()).count()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::builder::{FatImageBuilder, ROOT};
    use super::*;
    use crate::fs::common::{FaultySource, MemorySource};
    use crate::fs::detect_filesystem;
    use crate::recovery::clusters::unreadable_clusters;
    use crate::RecoveryStatus;

    const JPEG: [u8; 4] = [0xFF, 0xD8, 0xFF, 0xE0];

    fn sample() -> FatImageBuilder {
        let mut image = FatImageBuilder::fat32(4096, 256);
        image.add_file(ROOT, "README.TXT", b"read me");
        let docs = image.add_dir(ROOT, "Documents");
        image.add_file(docs, "quarterly report.txt", &vec![b'q'; 6000]);
        let mut photo = JPEG.to_vec();
        photo.resize(5000, 0x11);
        image.add_deleted_file(docs, "holiday.jpg", &photo);
        image
    }

    fn loaded(image: &FatImageBuilder) -> FatFileSystem {
        let mut fs = FatFileSystem::new();
        fs.load(MemorySource::new(image.build()).into_shared()).unwrap();
        fs
    }

    #[test]
    fn test_detect_and_geometry() {
        let image = sample();
        let bytes = image.build();
        assert!(is_fat_boot_sector(&bytes[..512]));
        assert_eq!(
            detect_filesystem(&MemorySource::new(bytes.clone())).unwrap(),
            FileSystemType::Fat
        );

        let boot = FatBootSector::parse(&bytes[..512]).unwrap();
        assert_eq!(boot.variant, FatVariant::Fat32);
        assert_eq!(boot.cluster_size(), 4096);
        assert_eq!(boot.cluster_count(), 256);
        assert_eq!(boot.data_offset(), image.data_offset());
        assert!(FatBootSector::parse(&[0u8; 512]).is_err());
    }

    #[test]
    fn test_fat16_variant_by_cluster_count() {
        let mut image = FatImageBuilder::fat16(512, 4200);
        image.add_file(ROOT, "A.TXT", b"fat16");
        let bytes = image.build();
        assert_eq!(FatBootSector::parse(&bytes[..512]).unwrap().variant, FatVariant::Fat16);

        let mut fs = FatFileSystem::new();
        fs.load(MemorySource::new(bytes).into_shared()).unwrap();
        assert_eq!(fs.read_file("/a.txt").unwrap(), b"fat16");
    }

    #[test]
    fn test_listing_and_reads() {
        let fs = loaded(&sample());
        let root = fs.list_files("/").unwrap();
        assert_eq!(root.len(), 1);
        assert_eq!(root[0].name, "README.TXT");

        let dirs = fs.list_directories("/").unwrap();
        assert_eq!(dirs.len(), 1);
        assert_eq!(dirs[0].path, "/Documents");
        assert_eq!(dirs[0].files[0].name, "quarterly report.txt");

        let report = fs.read_file("/documents/QUARTERLY REPORT.TXT").unwrap();
        assert_eq!(report.len(), 6000);
        assert!(report.iter().all(|b| *b == b'q'));
        assert_eq!(fs.read_file("/README.TXT").unwrap(), b"read me");
        assert!(matches!(fs.read_file("/Documents"), Err(FsError::PathNotFound(_))));
        assert!(matches!(fs.list_files("/README.TXT"), Err(FsError::PathNotFound(_))));

        let tree = fs.directory_tree().unwrap();
        assert!(tree.is_root);
        assert_eq!(tree.file_count(), 2);
    }

    #[test]
    fn test_deleted_entry_is_recoverable_and_extracts() {
        let image = sample();
        let fs = loaded(&image);
        let entries = fs.scan_for_deleted_files().unwrap();
        assert_eq!(entries.len(), 1);

        let photo = &entries[0];
        assert_eq!(photo.file.name, "holiday.jpg");
        assert_eq!(photo.file.path, "/Documents/holiday.jpg");
        assert_eq!(photo.signature_type.as_deref(), Some("JPEG"));
        assert_eq!(photo.recovery_status, RecoveryStatus::Recoverable);
        assert_eq!(photo.fragmented_clusters.len(), 2);

        let mut out = Vec::new();
        assert!(fs.recover_file(photo, &mut out).unwrap());
        assert_eq!(out.len(), 5000);
        assert_eq!(&out[..4], &JPEG);
        assert_eq!(fs.cluster_origin().unwrap(), image.data_offset());
    }

    #[test]
    fn test_deleted_entry_over_live_clusters_is_overwritten() {
        let mut image = FatImageBuilder::fat32(4096, 128);
        let live = image.add_file(ROOT, "KEEP.BIN", &[0xAB; 4096]);
        image.add_deleted_entry(ROOT, "gone.bin", live, 4096);
        let fs = loaded(&image);

        let entries = fs.scan_for_deleted_files().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].recovery_status, RecoveryStatus::Overwritten);
        assert_eq!(entries[0].recovery_probability, 0.0);
    }

    #[test]
    fn test_deleted_entry_without_clusters_is_ineligible() {
        let mut image = FatImageBuilder::fat32(4096, 64);
        image.add_deleted_entry(ROOT, "EMPTY.TXT", 0, 0);
        let fs = loaded(&image);
        assert!(fs.scan_for_deleted_files().unwrap().is_empty());
    }

    #[test]
    fn test_bad_data_cluster_marks_deleted_entry_corrupted() {
        let image = sample();
        let fs = loaded(&image);
        let photo = fs.scan_for_deleted_files().unwrap().remove(0);

        let ctx = ScanContext::default().with_bad_clusters([photo.fragmented_clusters[1]]);
        let report = fs.scan_deleted(&ctx).unwrap();
        assert_eq!(report.items[0].recovery_status, RecoveryStatus::Corrupted);
    }

    #[test]
    fn test_unreadable_subdirectory_is_counted() {
        let image = sample();
        // root is cluster 2, README.TXT 3, Documents 4
        let docs_offset = image.cluster_offset(4);
        let bytes = MemorySource::new(image.build()).into_shared();
        let faulty = FaultySource::new(bytes, vec![docs_offset..docs_offset + 512]);

        let mut fs = FatFileSystem::new();
        fs.load(Arc::new(faulty)).unwrap();
        assert_eq!(fs.skipped_directories().unwrap(), 1);
        assert!(fs.list_files("/Documents").unwrap().is_empty());
        assert_eq!(fs.read_file("/README.TXT").unwrap(), b"read me");
    }

    #[test]
    fn test_sweep_covers_the_allocation_table() {
        let image = sample();
        let bytes = image.build();
        let fat_offset = FatBootSector::parse(&bytes[..512]).unwrap().fat_offset();
        let faulty = FaultySource::new(
            MemorySource::new(bytes).into_shared(),
            vec![fat_offset..fat_offset + 512],
        );

        let mut fs = FatFileSystem::new();
        fs.load(Arc::new(faulty)).unwrap();
        assert_eq!(fs.read_file("/README.TXT").unwrap(), b"read me");

        let mut config = crate::RecoveryConfig::default();
        config.bad_sectors.retry_delay_ms = 0;
        let report = fs.scan_bad_sectors(&ScanContext::new(config)).unwrap();
        assert_eq!(report.items.len(), 1);
        let finding = &report.items[0];
        assert!(finding.offset <= fat_offset && fat_offset < finding.offset + finding.length as u64);
        assert!(finding.offset + finding.length as u64 <= image.data_offset());

        let origin = fs.cluster_origin().unwrap();
        assert!(unreadable_clusters(&report.items, 4096, origin).is_empty());
        assert_eq!(fs.get_disk_health(None).unwrap().bad_sector_count, 1);
    }

    #[test]
    fn test_not_loaded() {
        let fs = FatFileSystem::new();
        assert!(matches!(fs.list_files("/"), Err(FsError::NotLoaded)));
        assert!(matches!(fs.scan_for_deleted_files(), Err(FsError::NotLoaded)));
        assert!(matches!(fs.cluster_origin(), Err(FsError::NotLoaded)));
    }
}

//! Reader for media with no recognizable filesystem. There is no tree to
//! list; the deleted-file scan is a signature carve over the whole source.

use crate::error::{FsError, FsResult};
use crate::fs::common::SharedSource;
use crate::fs::FileSystem;
use crate::recovery::{
    carver::Carver,
    clusters::ClusterMap,
    engine::ScanContext,
    progress::{run_with_workers, PassReport},
};
use crate::{DeletedFileEntry, DirectoryEntry, FileEntry, FileSystemType};

/// Allocation unit assumed when nothing on the medium says otherwise
pub const DEFAULT_CLUSTER_SIZE: u32 = 4096;

struct RawState {
    source: SharedSource,
    cluster_map: ClusterMap,
}

pub struct RawFileSystem {
    cluster_size: u32,
    state: Option<RawState>,
}

impl Default for RawFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl RawFileSystem {
    pub fn new() -> Self {
        Self::with_cluster_size(DEFAULT_CLUSTER_SIZE)
    }

    pub fn with_cluster_size(cluster_size: u32) -> Self {
        Self {
            cluster_size: cluster_size.max(1),
            state: None,
        }
    }

    fn state(&self) -> FsResult<&RawState> {
        self.state.as_ref().ok_or(FsError::NotLoaded)
    }

    fn is_root(path: &str) -> bool {
        path.split('/').all(|c| c.is_empty())
    }
}

impl FileSystem for RawFileSystem {
    fn filesystem_type(&self) -> FileSystemType {
        FileSystemType::Raw
    }

    fn load_with(&mut self, source: SharedSource, _ctx: &ScanContext) -> FsResult<()> {
        if self.state.is_some() {
            return Err(FsError::AlreadyLoaded);
        }
        let clusters = source.size() / self.cluster_size as u64;
        tracing::info!(
            "Raw medium {}: {} bytes, {} units of {} bytes",
            source.describe(),
            source.size(),
            clusters,
            self.cluster_size
        );
        self.state = Some(RawState {
            source,
            cluster_map: ClusterMap::new(clusters),
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
        self.state()?;
        Ok(self.cluster_size)
    }

    fn total_clusters(&self) -> FsResult<u64> {
        Ok(self.state()?.cluster_map.cluster_count())
    }

    /// Always empty: nothing is attributed on a raw medium
    fn cluster_map(&self) -> FsResult<&ClusterMap> {
        Ok(&self.state()?.cluster_map)
    }

    fn list_directories(&self, path: &str) -> FsResult<Vec<DirectoryEntry>> {
        self.state()?;
        if Self::is_root(path) {
            Ok(Vec::new())
        } else {
            Err(FsError::PathNotFound(path.to_string()))
        }
    }

    fn list_files(&self, path: &str) -> FsResult<Vec<FileEntry>> {
        self.state()?;
        if Self::is_root(path) {
            Ok(Vec::new())
        } else {
            Err(FsError::PathNotFound(path.to_string()))
        }
    }

    fn read_file(&self, path: &str) -> FsResult<Vec<u8>> {
        self.state()?;
        Err(FsError::PathNotFound(path.to_string()))
    }

    fn directory_tree(&self) -> FsResult<DirectoryEntry> {
        self.state()?;
        Ok(DirectoryEntry {
            path: "/".into(),
            is_root: true,
            ..Default::default()
        })
    }

    fn scan_deleted(&self, ctx: &ScanContext) -> FsResult<PassReport<DeletedFileEntry>> {
        let state = self.state()?;
        let carver = Carver::new(state.source.as_ref(), self.cluster_size, ctx.config.carve_catalog())
            .with_cluster_map(&state.cluster_map);
        Ok(run_with_workers(ctx.config.workers, || carver.scan(ctx)))
    }
}

/// Common types and utilities for raw storage access
use memmap2::MmapOptions;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{FsError, FsResult};

/// Random-access, read-only byte source (device or image).
///
/// Every read carries its own offset; implementations hold no cursor and
/// must tolerate concurrent readers.
pub trait BlockSource: Send + Sync {
    /// Read exactly `len` bytes starting at `offset`
    fn read_at(&self, offset: u64, len: usize) -> FsResult<Vec<u8>>;

    /// Total addressable size in bytes
    fn size(&self) -> u64;

    /// Human-readable origin, used in logs and persisted sessions
    fn describe(&self) -> String {
        "block source".to_string()
    }

    /// Read one allocation unit
    fn read_cluster(&self, cluster: u64, cluster_size: u32) -> FsResult<Vec<u8>> {
        self.read_at(cluster * cluster_size as u64, cluster_size as usize)
    }
}

pub type SharedSource = Arc<dyn BlockSource>;

fn check_range(offset: u64, len: usize, size: u64) -> FsResult<()> {
    let end = offset.checked_add(len as u64);
    match end {
        Some(end) if end <= size => Ok(()),
        _ => Err(FsError::OutOfRange { offset, len, size }),
    }
}

/// Open an image file or device, preferring a memory map and falling back
/// to positional reads when the target cannot be mapped (block devices
/// report a zero length through metadata).
pub fn open_source(path: impl AsRef<Path>) -> FsResult<SharedSource> {
    let path = path.as_ref();
    match MmapSource::open(path) {
        Ok(source) if source.size() > 0 => Ok(Arc::new(source)),
        Ok(_) | Err(_) => {
            tracing::debug!("memory map unavailable for {}, using positional reads", path.display());
            Ok(Arc::new(FileSource::open(path)?))
        }
    }
}

/// A memory-mapped image file for efficient large file access
pub struct MmapSource {
    _file: File,
    mmap: memmap2::Mmap,
    path: PathBuf,
}

impl MmapSource {
    pub fn open<P: AsRef<Path>>(path: P) -> FsResult<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| FsError::io(0, e))?;

        let mmap = unsafe { MmapOptions::new().map(&file) }.map_err(|e| FsError::io(0, e))?;

        Ok(MmapSource {
            _file: file,
            mmap,
            path: path.to_path_buf(),
        })
    }

    /// Borrow a slice without copying
    pub fn slice(&self, offset: u64, len: usize) -> FsResult<&[u8]> {
        check_range(offset, len, self.size())?;
        let start = offset as usize;
        Ok(&self.mmap[start..start + len])
    }
}

impl BlockSource for MmapSource {
    fn read_at(&self, offset: u64, len: usize) -> FsResult<Vec<u8>> {
        self.slice(offset, len).map(|s| s.to_vec())
    }

    fn size(&self) -> u64 {
        self.mmap.len() as u64
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Positional reads against an open file handle (no shared cursor)
pub struct FileSource {
    file: File,
    size: u64,
    path: PathBuf,
}

impl FileSource {
    pub fn open<P: AsRef<Path>>(path: P) -> FsResult<Self> {
        use std::io::{Seek, SeekFrom};

        let path = path.as_ref();
        let mut file = File::open(path).map_err(|e| FsError::io(0, e))?;
        let size = file.seek(SeekFrom::End(0)).map_err(|e| FsError::io(0, e))?;

        Ok(Self {
            file,
            size,
            path: path.to_path_buf(),
        })
    }

    #[cfg(unix)]
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.read_exact_at(buf, offset)
    }

    #[cfg(windows)]
    fn read_exact_at(&self, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
        use std::os::windows::fs::FileExt;
        while !buf.is_empty() {
            match self.file.seek_read(buf, offset)? {
                0 => return Err(std::io::ErrorKind::UnexpectedEof.into()),
                n => {
                    buf = &mut buf[n..];
                    offset += n as u64;
                }
            }
        }
        Ok(())
    }
}

impl BlockSource for FileSource {
    fn read_at(&self, offset: u64, len: usize) -> FsResult<Vec<u8>> {
        check_range(offset, len, self.size)?;
        let mut buf = vec![0u8; len];
        self.read_exact_at(&mut buf, offset)
            .map_err(|e| FsError::io(offset, e))?;
        Ok(buf)
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Owned in-memory image
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    data: Vec<u8>,
}

impl MemorySource {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn into_shared(self) -> SharedSource {
        Arc::new(self)
    }
}

impl BlockSource for MemorySource {
    fn read_at(&self, offset: u64, len: usize) -> FsResult<Vec<u8>> {
        check_range(offset, len, self.size())?;
        let start = offset as usize;
        Ok(self.data[start..start + len].to_vec())
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn describe(&self) -> String {
        format!("memory ({} bytes)", self.data.len())
    }
}

/// Immutable descriptor of a byte window over a source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockExtent {
    pub offset: u64,
    pub length: u64,
    pub cluster_size: u32,
}

impl BlockExtent {
    pub fn new(offset: u64, length: u64, cluster_size: u32) -> Self {
        Self {
            offset,
            length,
            cluster_size,
        }
    }

    /// Extent covering a whole source
    pub fn whole(source: &dyn BlockSource, cluster_size: u32) -> Self {
        Self::new(0, source.size(), cluster_size)
    }

    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    pub fn cluster_count(&self) -> u64 {
        if self.cluster_size == 0 {
            return 0;
        }
        self.length / self.cluster_size as u64
    }

    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.offset && offset < self.end()
    }
}

/// A window of another source, e.g. one partition of a whole-disk image.
/// Offsets passed to `read_at` are relative to the window start.
pub struct ExtentSource {
    inner: SharedSource,
    extent: BlockExtent,
}

impl ExtentSource {
    pub fn new(inner: SharedSource, extent: BlockExtent) -> FsResult<Self> {
        check_range(extent.offset, 0, inner.size())?;
        if extent.end() > inner.size() {
            return Err(FsError::OutOfRange {
                offset: extent.offset,
                len: extent.length as usize,
                size: inner.size(),
            });
        }
        Ok(Self { inner, extent })
    }

    pub fn extent(&self) -> BlockExtent {
        self.extent
    }
}

impl BlockSource for ExtentSource {
    fn read_at(&self, offset: u64, len: usize) -> FsResult<Vec<u8>> {
        check_range(offset, len, self.extent.length)?;
        self.inner.read_at(self.extent.offset + offset, len)
    }

    fn size(&self) -> u64 {
        self.extent.length
    }

    fn describe(&self) -> String {
        format!(
            "{} [{:#x}..{:#x}]",
            self.inner.describe(),
            self.extent.offset,
            self.extent.end()
        )
    }
}

/// Wraps a source and fails every read that touches one of the configured
/// byte ranges, simulating unreadable media for sweep and extraction tests.
pub struct FaultySource {
    inner: SharedSource,
    bad_ranges: Vec<Range<u64>>,
}

impl FaultySource {
    pub fn new(inner: SharedSource, bad_ranges: Vec<Range<u64>>) -> Self {
        Self { inner, bad_ranges }
    }

    /// Mark whole clusters as unreadable
    pub fn with_bad_clusters(inner: SharedSource, clusters: &[u64], cluster_size: u32) -> Self {
        let cs = cluster_size as u64;
        let ranges = clusters.iter().map(|c| c * cs..(c + 1) * cs).collect();
        Self::new(inner, ranges)
    }
}

impl BlockSource for FaultySource {
    fn read_at(&self, offset: u64, len: usize) -> FsResult<Vec<u8>> {
        let end = offset + len as u64;
        if self
            .bad_ranges
            .iter()
            .any(|r| offset < r.end && end > r.start)
        {
            return Err(FsError::io(
                offset,
                std::io::Error::new(std::io::ErrorKind::Other, "simulated media error"),
            ));
        }
        self.inner.read_at(offset, len)
    }

    fn size(&self) -> u64 {
        self.inner.size()
    }

    fn describe(&self) -> String {
        format!("faulty({})", self.inner.describe())
    }
}

/// Decode UTF-16LE name bytes, dropping trailing NULs and 0xFFFF padding
pub fn decode_utf16_name(utf16_data: &[u8]) -> String {
    let mut end = utf16_data.len() & !1;
    while end >= 2
        && ((utf16_data[end - 2] == 0 && utf16_data[end - 1] == 0)
            || (utf16_data[end - 2] == 0xFF && utf16_data[end - 1] == 0xFF))
    {
        end -= 2;
    }

    let (decoded, _encoding, _had_errors) = encoding_rs::UTF_16LE.decode(&utf16_data[..end]);
    decoded.into_owned()
}

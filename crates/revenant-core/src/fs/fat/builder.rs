//! Builder for synthetic FAT16/FAT32 volumes, used by unit and integration
//! tests. Every directory occupies a single cluster (the FAT16 root uses
//! the fixed 512-entry region) and file content is laid out contiguously.

use byteorder::{ByteOrder, LittleEndian};
use std::collections::BTreeMap;

use super::directory::{
    encode_fat_datetime, short_name_checksum, ATTR_ARCHIVE, ATTR_DIRECTORY, ATTR_LONG_NAME, ENTRY_DELETED,
};
use super::FatVariant;

/// Parent handle for entries placed in the root directory
pub const ROOT: u32 = 0;

const BYTES_PER_SECTOR: u32 = 512;
const FAT16_ROOT_ENTRIES: u32 = 512;
const FAT32_ROOT_CLUSTER: u32 = 2;
const EOC: u32 = 0x0FFF_FFFF;

pub struct FatImageBuilder {
    variant: FatVariant,
    cluster_size: u32,
    cluster_count: u32,
    fat: Vec<u32>,
    /// Directory entries keyed by directory cluster (`ROOT` for the root)
    directories: BTreeMap<u32, Vec<[u8; 32]>>,
    content: Vec<(u32, Vec<u8>)>,
    next_free: u32,
    alias_counter: u32,
}

impl FatImageBuilder {
    /// FAT16 needs at least 4085 clusters to be recognized as such
    pub fn fat16(cluster_size: u32, cluster_count: u32) -> Self {
        Self::new(FatVariant::Fat16, cluster_size, cluster_count)
    }

    pub fn fat32(cluster_size: u32, cluster_count: u32) -> Self {
        Self::new(FatVariant::Fat32, cluster_size, cluster_count)
    }

    fn new(variant: FatVariant, cluster_size: u32, cluster_count: u32) -> Self {
        assert!(cluster_size >= BYTES_PER_SECTOR && cluster_size.is_power_of_two());
        let mut fat = vec![0u32; cluster_count as usize + 2];
        fat[0] = 0x0FFF_FFF8;
        fat[1] = EOC;

        let mut builder = Self {
            variant,
            cluster_size,
            cluster_count,
            fat,
            directories: BTreeMap::from([(ROOT, Vec::new())]),
            content: Vec::new(),
            next_free: 2,
            alias_counter: 0,
        };
        if variant == FatVariant::Fat32 {
            let root = builder.allocate(1, true);
            debug_assert_eq!(root, FAT32_ROOT_CLUSTER);
        }
        builder
    }

    pub fn cluster_size(&self) -> u32 {
        self.cluster_size
    }

    fn reserved_sectors(&self) -> u32 {
        match self.variant {
            FatVariant::Fat32 => 32,
            _ => 4,
        }
    }

    fn fat_sectors(&self) -> u32 {
        let width = match self.variant {
            FatVariant::Fat32 => 4,
            _ => 2,
        };
        ((self.cluster_count + 2) * width).div_ceil(BYTES_PER_SECTOR)
    }

    fn root_dir_sectors(&self) -> u32 {
        match self.variant {
            FatVariant::Fat32 => 0,
            _ => FAT16_ROOT_ENTRIES * 32 / BYTES_PER_SECTOR,
        }
    }

    /// Byte offset of data cluster 2
    pub fn data_offset(&self) -> u64 {
        ((self.reserved_sectors() + 2 * self.fat_sectors() + self.root_dir_sectors()) * BYTES_PER_SECTOR) as u64
    }

    /// Byte offset of a FAT cluster within the image
    pub fn cluster_offset(&self, cluster: u32) -> u64 {
        self.data_offset() + (cluster as u64 - 2) * self.cluster_size as u64
    }

    /// Reserve `count` clusters; the chain is written to the FAT when
    /// `link` is set, otherwise the clusters stay free
    pub fn allocate(&mut self, count: u32, link: bool) -> u32 {
        let start = self.next_free;
        assert!(
            start + count <= self.cluster_count + 2,
            "volume too small for {} more clusters",
            count
        );
        self.next_free += count;
        if link {
            for cluster in start..start + count {
                self.fat[cluster as usize] = if cluster + 1 == start + count { EOC } else { cluster + 1 };
            }
        }
        start
    }

    /// Link an arbitrary chain, e.g. a fragmented file
    pub fn link_chain(&mut self, clusters: &[u32]) {
        for pair in clusters.windows(2) {
            self.fat[pair[0] as usize] = pair[1];
        }
        if let Some(&last) = clusters.last() {
            self.fat[last as usize] = EOC;
        }
    }

    /// Write bytes starting at a cluster
    pub fn write(&mut self, cluster: u32, bytes: &[u8]) {
        self.content.push((cluster, bytes.to_vec()));
    }

    pub fn add_dir(&mut self, parent: u32, name: &str) -> u32 {
        let cluster = self.allocate(1, true);
        self.directories.insert(
            cluster,
            vec![
                short_entry(b".          ", ATTR_DIRECTORY, cluster, 0),
                short_entry(b"..         ", ATTR_DIRECTORY, parent, 0),
            ],
        );
        self.push_entry(parent, name, ATTR_DIRECTORY, cluster, 0, false);
        cluster
    }

    /// A live file with a contiguous chain; returns its first cluster
    pub fn add_file(&mut self, parent: u32, name: &str, content: &[u8]) -> u32 {
        let clusters = self.clusters_for(content.len()).max(1);
        let first = self.allocate(clusters, true);
        self.write(first, content);
        self.push_entry(parent, name, ATTR_ARCHIVE, first, content.len() as u32, false);
        first
    }

    /// A deleted file: content present, FAT entries free, entry marked 0xE5
    pub fn add_deleted_file(&mut self, parent: u32, name: &str, content: &[u8]) -> u32 {
        let clusters = self.clusters_for(content.len()).max(1);
        let first = self.allocate(clusters, false);
        self.write(first, content);
        self.add_deleted_entry(parent, name, first, content.len() as u32);
        first
    }

    /// A deleted entry pointing at arbitrary clusters
    pub fn add_deleted_entry(&mut self, parent: u32, name: &str, first_cluster: u32, size: u32) {
        self.push_entry(parent, name, ATTR_ARCHIVE, first_cluster, size, true);
    }

    fn clusters_for(&self, len: usize) -> u32 {
        (len as u32).div_ceil(self.cluster_size)
    }

    fn push_entry(&mut self, parent: u32, name: &str, attributes: u8, cluster: u32, size: u32, deleted: bool) {
        let (short_name, needs_long_name) = match exact_short_name(name) {
            Some(short) => (short, false),
            None => {
                self.alias_counter += 1;
                (alias_for(name, self.alias_counter), true)
            }
        };

        let mut entries = Vec::new();
        if needs_long_name {
            let checksum = short_name_checksum(&short_name);
            let mut units: Vec<u16> = name.encode_utf16().collect();
            let fragments = units.len().div_ceil(13);
            if units.len() % 13 != 0 {
                units.push(0);
            }
            units.resize(fragments * 13, 0xFFFF);
            for order in (1..=fragments).rev() {
                let chunk = &units[(order - 1) * 13..order * 13];
                let mut raw = [0u8; 32];
                raw[0] = if deleted {
                    ENTRY_DELETED
                } else if order == fragments {
                    order as u8 | 0x40
                } else {
                    order as u8
                };
                let bytes: Vec<u8> = chunk.iter().flat_map(|u| u.to_le_bytes()).collect();
                raw[1..11].copy_from_slice(&bytes[..10]);
                raw[11] = ATTR_LONG_NAME;
                raw[13] = checksum;
                raw[14..26].copy_from_slice(&bytes[10..22]);
                raw[28..32].copy_from_slice(&bytes[22..26]);
                entries.push(raw);
            }
        }

        let mut short = short_entry(&short_name, attributes, cluster, size);
        if deleted {
            short[0] = ENTRY_DELETED;
        }
        entries.push(short);

        let capacity = if parent == ROOT && self.variant != FatVariant::Fat32 {
            FAT16_ROOT_ENTRIES as usize
        } else {
            self.cluster_size as usize / 32
        };
        let directory = self.directories.entry(parent).or_default();
        assert!(directory.len() + entries.len() <= capacity, "directory full");
        directory.extend(entries);
    }

    pub fn build(&self) -> Vec<u8> {
        let bps = BYTES_PER_SECTOR as usize;
        let total_sectors = self.data_offset() as u32 / BYTES_PER_SECTOR
            + self.cluster_count * (self.cluster_size / BYTES_PER_SECTOR);
        let mut image = vec![0u8; total_sectors as usize * bps];

        image[..3].copy_from_slice(&[0xEB, 0x58, 0x90]);
        image[3..11].copy_from_slice(b"MSWIN4.1");
        LittleEndian::write_u16(&mut image[0x0B..], BYTES_PER_SECTOR as u16);
        image[0x0D] = (self.cluster_size / BYTES_PER_SECTOR) as u8;
        LittleEndian::write_u16(&mut image[0x0E..], self.reserved_sectors() as u16);
        image[0x10] = 2;
        image[0x15] = 0xF8;
        LittleEndian::write_u16(&mut image[0x18..], 32);
        LittleEndian::write_u16(&mut image[0x1A..], 64);
        LittleEndian::write_u32(&mut image[0x20..], total_sectors);
        match self.variant {
            FatVariant::Fat32 => {
                LittleEndian::write_u32(&mut image[0x24..], self.fat_sectors());
                LittleEndian::write_u32(&mut image[0x2C..], FAT32_ROOT_CLUSTER);
                LittleEndian::write_u16(&mut image[0x30..], 1);
                LittleEndian::write_u16(&mut image[0x32..], 6);
                image[0x40] = 0x80;
                image[0x42] = 0x29;
                LittleEndian::write_u32(&mut image[0x43..], 0xCAFE_F00D);
                image[0x47..0x52].copy_from_slice(b"NO NAME    ");
                image[0x52..0x5A].copy_from_slice(b"FAT32   ");
            }
            _ => {
                LittleEndian::write_u16(&mut image[0x11..], FAT16_ROOT_ENTRIES as u16);
                LittleEndian::write_u16(&mut image[0x16..], self.fat_sectors() as u16);
                image[0x24] = 0x80;
                image[0x26] = 0x29;
                LittleEndian::write_u32(&mut image[0x27..], 0xCAFE_F00D);
                image[0x2B..0x36].copy_from_slice(b"NO NAME    ");
                image[0x36..0x3E].copy_from_slice(b"FAT16   ");
            }
        }
        image[0x1FE] = 0x55;
        image[0x1FF] = 0xAA;

        let fat_bytes = self.fat_sectors() as usize * bps;
        let first_fat = self.reserved_sectors() as usize * bps;
        for copy in 0..2 {
            let base = first_fat + copy * fat_bytes;
            for (n, &value) in self.fat.iter().enumerate() {
                match self.variant {
                    FatVariant::Fat32 => LittleEndian::write_u32(&mut image[base + n * 4..], value),
                    _ => LittleEndian::write_u16(&mut image[base + n * 2..], value as u16),
                }
            }
        }

        for (&cluster, entries) in &self.directories {
            let base = if cluster == ROOT {
                match self.variant {
                    FatVariant::Fat32 => self.cluster_offset(FAT32_ROOT_CLUSTER) as usize,
                    _ => first_fat + 2 * fat_bytes,
                }
            } else {
                self.cluster_offset(cluster) as usize
            };
            for (i, raw) in entries.iter().enumerate() {
                image[base + i * 32..base + (i + 1) * 32].copy_from_slice(raw);
            }
        }

        for (cluster, bytes) in &self.content {
            let at = self.cluster_offset(*cluster) as usize;
            image[at..at + bytes.len()].copy_from_slice(bytes);
        }
        image
    }
}

fn short_entry(name: &[u8; 11], attributes: u8, cluster: u32, size: u32) -> [u8; 32] {
    let (date, time) = encode_fat_datetime(2024, 3, 1, 12, 0, 0);
    let mut raw = [0u8; 32];
    raw[..11].copy_from_slice(name);
    raw[11] = attributes;
    LittleEndian::write_u16(&mut raw[14..], time);
    LittleEndian::write_u16(&mut raw[16..], date);
    LittleEndian::write_u16(&mut raw[18..], date);
    LittleEndian::write_u16(&mut raw[20..], (cluster >> 16) as u16);
    LittleEndian::write_u16(&mut raw[22..], time);
    LittleEndian::write_u16(&mut raw[24..], date);
    LittleEndian::write_u16(&mut raw[26..], cluster as u16);
    LittleEndian::write_u32(&mut raw[28..], size);
    raw
}

/// The padded 8.3 form when `name` already is a valid upper-case 8.3 name
fn exact_short_name(name: &str) -> Option<[u8; 11]> {
    let (base, ext) = name.rsplit_once('.').unwrap_or((name, ""));
    let valid = |s: &str| s.bytes().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'_');
    if base.is_empty() || base.len() > 8 || ext.len() > 3 || !valid(base) || !valid(ext) {
        return None;
    }
    let mut short = [b' '; 11];
    short[..base.len()].copy_from_slice(base.as_bytes());
    short[8..8 + ext.len()].copy_from_slice(ext.as_bytes());
    Some(short)
}

fn alias_for(name: &str, counter: u32) -> [u8; 11] {
    let (base, ext) = name.rsplit_once('.').unwrap_or((name, ""));
    let clean = |s: &str, max: usize| -> Vec<u8> {
        s.bytes()
            .filter(|b| b.is_ascii_alphanumeric())
            .map(|b| b.to_ascii_uppercase())
            .take(max)
            .collect()
    };
    let suffix = format!("~{}", counter % 10);
    let mut short = [b' '; 11];
    let base = clean(base, 8 - suffix.len());
    short[..base.len()].copy_from_slice(&base);
    short[base.len()..base.len() + suffix.len()].copy_from_slice(suffix.as_bytes());
    let ext = clean(ext, 3);
    short[8..8 + ext.len()].copy_from_slice(&ext);
    short
}

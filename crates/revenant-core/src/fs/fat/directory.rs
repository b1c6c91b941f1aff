//! FAT directory entry parsing
//!
//! Every entry is 32 bytes. The first name byte doubles as a state marker:
//! - 0x00: end of directory
//! - 0xE5: deleted entry
//! - 0x05: live entry whose real first byte is 0xE5
//!
//! Long names are stored in attribute-0x0F entries placed before their short
//! entry in reverse order, 13 UTF-16 units each.

use byteorder::{LittleEndian, ReadBytesExt};
use chrono::{DateTime, NaiveDate, Utc};
use std::io::Cursor;

use crate::fs::common::decode_utf16_name;

/// Directory entry size in bytes
pub const ENTRY_SIZE: usize = 32;

pub const ENTRY_END: u8 = 0x00;
pub const ENTRY_DELETED: u8 = 0xE5;
pub const ENTRY_KANJI_E5: u8 = 0x05;

pub const ATTR_READ_ONLY: u8 = 0x01;
pub const ATTR_HIDDEN: u8 = 0x02;
pub const ATTR_SYSTEM: u8 = 0x04;
pub const ATTR_VOLUME_ID: u8 = 0x08;
pub const ATTR_DIRECTORY: u8 = 0x10;
pub const ATTR_ARCHIVE: u8 = 0x20;
pub const ATTR_LONG_NAME: u8 = 0x0F;

/// Placeholder for the first character of a deleted short name that has no
/// long name to restore it from
const LOST_CHAR: char = '_';

/// A short entry with its long name folded in
#[derive(Debug, Clone, PartialEq)]
pub struct FatDirEntry {
    /// Long name when present and intact, otherwise the 8.3 name
    pub name: String,
    pub short_name: String,
    /// A long name was present and matched this entry
    pub has_long_name: bool,
    pub attributes: u8,
    pub first_cluster: u32,
    pub size: u32,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    pub accessed: Option<DateTime<Utc>>,
    pub is_deleted: bool,
    /// Index of the short entry within its directory
    pub index: usize,
}

impl FatDirEntry {
    pub fn is_directory(&self) -> bool {
        self.attributes & ATTR_DIRECTORY != 0
    }

    pub fn is_volume_label(&self) -> bool {
        self.attributes & ATTR_VOLUME_ID != 0
    }

    pub fn is_dot_entry(&self) -> bool {
        self.short_name == "." || self.short_name == ".."
    }
}

/// Raw 8.3 entry fields
#[derive(Debug, Clone)]
struct ShortEntry {
    name: [u8; 11],
    attributes: u8,
    create_time: u16,
    create_date: u16,
    access_date: u16,
    cluster_high: u16,
    write_time: u16,
    write_date: u16,
    cluster_low: u16,
    size: u32,
}

impl ShortEntry {
    fn parse(raw: &[u8]) -> std::io::Result<Self> {
        let mut name = [0u8; 11];
        name.copy_from_slice(&raw[..11]);
        let mut cursor = Cursor::new(&raw[11..]);
        let attributes = cursor.read_u8()?;
        let _nt_reserved = cursor.read_u8()?;
        let _create_tenths = cursor.read_u8()?;
        let create_time = cursor.read_u16::<LittleEndian>()?;
        let create_date = cursor.read_u16::<LittleEndian>()?;
        let access_date = cursor.read_u16::<LittleEndian>()?;
        let cluster_high = cursor.read_u16::<LittleEndian>()?;
        let write_time = cursor.read_u16::<LittleEndian>()?;
        let write_date = cursor.read_u16::<LittleEndian>()?;
        let cluster_low = cursor.read_u16::<LittleEndian>()?;
        let size = cursor.read_u32::<LittleEndian>()?;
        Ok(Self {
            name,
            attributes,
            create_time,
            create_date,
            access_date,
            cluster_high,
            write_time,
            write_date,
            cluster_low,
            size,
        })
    }
}

/// One long-name fragment, still in on-disk order
#[derive(Debug, Clone)]
struct LongNamePart {
    checksum: u8,
    units: Vec<u8>,
    deleted: bool,
}

impl LongNamePart {
    fn parse(raw: &[u8]) -> Self {
        let mut units = Vec::with_capacity(26);
        units.extend_from_slice(&raw[1..11]);
        units.extend_from_slice(&raw[14..26]);
        units.extend_from_slice(&raw[28..32]);
        Self {
            checksum: raw[13],
            units,
            deleted: raw[0] == ENTRY_DELETED,
        }
    }
}

/// Short-name checksum stored in every long-name fragment
pub fn short_name_checksum(name: &[u8; 11]) -> u8 {
    name.iter()
        .fold(0u8, |sum, &b| ((sum & 1) << 7).wrapping_add(sum >> 1).wrapping_add(b))
}

/// Parse a directory's raw bytes. Live and deleted entries are returned;
/// long-name fragments and the end marker are consumed.
pub fn parse_directory(data: &[u8]) -> Vec<FatDirEntry> {
    let mut entries = Vec::new();
    let mut pending: Vec<LongNamePart> = Vec::new();

    for (index, raw) in data.chunks_exact(ENTRY_SIZE).enumerate() {
        let marker = raw[0];
        if marker == ENTRY_END {
            break;
        }
        if raw[11] & 0x3F == ATTR_LONG_NAME {
            pending.push(LongNamePart::parse(raw));
            continue;
        }

        let parts = std::mem::take(&mut pending);
        let short = match ShortEntry::parse(raw) {
            Ok(short) => short,
            Err(e) => {
                tracing::debug!("Skipping directory entry {}: {}", index, e);
                continue;
            }
        };
        entries.push(build_entry(&short, &parts, index));
    }
    entries
}

fn build_entry(short: &ShortEntry, parts: &[LongNamePart], index: usize) -> FatDirEntry {
    let is_deleted = short.name[0] == ENTRY_DELETED;
    let long_name = long_name_for(short, parts, is_deleted);

    let mut short_name = decode_short_name(&short.name);
    if is_deleted {
        let restored = long_name
            .as_ref()
            .and_then(|n| n.chars().next())
            .map(|c| c.to_ascii_uppercase())
            .unwrap_or(LOST_CHAR);
        short_name.replace_range(..short_name.chars().next().map_or(0, char::len_utf8), &restored.to_string());
    }

    FatDirEntry {
        has_long_name: long_name.is_some(),
        name: long_name.unwrap_or_else(|| short_name.clone()),
        short_name,
        attributes: short.attributes,
        first_cluster: ((short.cluster_high as u32) << 16) | short.cluster_low as u32,
        size: short.size,
        created: fat_datetime(short.create_date, short.create_time),
        modified: fat_datetime(short.write_date, short.write_time),
        accessed: fat_datetime(short.access_date, 0),
        is_deleted,
        index,
    }
}

/// Long name for a short entry. Live names must match the short-name
/// checksum. Deleted short entries have lost their first byte, so any
/// run of equally deleted fragments sharing one checksum is accepted.
fn long_name_for(short: &ShortEntry, parts: &[LongNamePart], is_deleted: bool) -> Option<String> {
    if parts.is_empty() {
        return None;
    }
    let checksum = parts[0].checksum;
    if parts.iter().any(|p| p.checksum != checksum || p.deleted != is_deleted) {
        return None;
    }
    if !is_deleted && short_name_checksum(&short.name) != checksum {
        return None;
    }

    let units: Vec<u8> = parts.iter().rev().flat_map(|p| p.units.iter().copied()).collect();
    let terminated = units
        .chunks_exact(2)
        .position(|u| u == [0, 0])
        .map_or(units.len(), |i| i * 2);
    let name = decode_utf16_name(&units[..terminated]);
    (!name.is_empty()).then_some(name)
}

fn decode_short_name(raw: &[u8; 11]) -> String {
    let mut bytes = *raw;
    if bytes[0] == ENTRY_KANJI_E5 {
        bytes[0] = 0xE5;
    }
    let decode = |b: &[u8]| {
        let (text, _, _) = encoding_rs::WINDOWS_1252.decode(b);
        text.trim_end().to_string()
    };
    let base = decode(&bytes[..8]);
    let ext = decode(&bytes[8..]);
    if ext.is_empty() {
        base
    } else {
        format!("{}.{}", base, ext)
    }
}

/// DOS date/time (local time, read as UTC). Zero dates are absent.
pub fn fat_datetime(date: u16, time: u16) -> Option<DateTime<Utc>> {
    if date == 0 {
        return None;
    }
    let year = 1980 + (date >> 9) as i32;
    let month = ((date >> 5) & 0x0F) as u32;
    let day = (date & 0x1F) as u32;
    let hour = (time >> 11) as u32;
    let minute = ((time >> 5) & 0x3F) as u32;
    let second = ((time & 0x1F) * 2) as u32;
    NaiveDate::from_ymd_opt(year, month, day)?
        .and_hms_opt(hour, minute, second)
        .map(|dt| dt.and_utc())
}

/// Encode a DOS date/time pair
pub fn encode_fat_datetime(year: u16, month: u8, day: u8, hour: u8, minute: u8, second: u8) -> (u16, u16) {
    let date = ((year.saturating_sub(1980)) << 9) | ((month as u16) << 5) | day as u16;
    let time = ((hour as u16) << 11) | ((minute as u16) << 5) | (second as u16 / 2);
    (date, time)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    fn short_raw(name: &[u8; 11], attr: u8, cluster: u32, size: u32) -> [u8; 32] {
        let mut raw = [0u8; 32];
        raw[..11].copy_from_slice(name);
        raw[11] = attr;
        let (date, time) = encode_fat_datetime(2023, 6, 15, 10, 30, 42);
        raw[14..16].copy_from_slice(&time.to_le_bytes());
        raw[16..18].copy_from_slice(&date.to_le_bytes());
        raw[20..22].copy_from_slice(&((cluster >> 16) as u16).to_le_bytes());
        raw[22..24].copy_from_slice(&time.to_le_bytes());
        raw[24..26].copy_from_slice(&date.to_le_bytes());
        raw[26..28].copy_from_slice(&(cluster as u16).to_le_bytes());
        raw[28..32].copy_from_slice(&size.to_le_bytes());
        raw
    }

    fn lfn_raw(order: u8, checksum: u8, chars: &str) -> [u8; 32] {
        let mut units: Vec<u16> = chars.encode_utf16().collect();
        if units.len() < 13 {
            units.push(0);
        }
        units.resize(13, 0xFFFF);
        let bytes: Vec<u8> = units.iter().flat_map(|u| u.to_le_bytes()).collect();
        let mut raw = [0u8; 32];
        raw[0] = order;
        raw[1..11].copy_from_slice(&bytes[..10]);
        raw[11] = ATTR_LONG_NAME;
        raw[13] = checksum;
        raw[14..26].copy_from_slice(&bytes[10..22]);
        raw[28..32].copy_from_slice(&bytes[22..26]);
        raw
    }

    #[test]
    fn test_short_entry_fields() {
        let data = short_raw(b"README  TXT", ATTR_ARCHIVE, 0x0001_0005, 1234);
        let entries = parse_directory(&data);
        assert_eq!(entries.len(), 1);
        let e = &entries[0];
        assert_eq!(e.name, "README.TXT");
        assert_eq!(e.first_cluster, 0x0001_0005);
        assert_eq!(e.size, 1234);
        assert!(!e.is_deleted);
        let modified = e.modified.unwrap();
        assert_eq!((modified.year(), modified.month(), modified.day()), (2023, 6, 15));
        assert_eq!((modified.hour(), modified.minute(), modified.second()), (10, 30, 42));
    }

    #[test]
    fn test_long_name_assembled_in_reverse() {
        let short = *b"HOLIDA~1JPG";
        let sum = short_name_checksum(&short);
        let mut data = Vec::new();
        data.extend(lfn_raw(0x42, sum, ".jpg"));
        data.extend(lfn_raw(0x01, sum, "holiday_photo"));
        data.extend(short_raw(&short, ATTR_ARCHIVE, 3, 10));
        let entries = parse_directory(&data);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "holiday_photo.jpg");
        assert_eq!(entries[0].short_name, "HOLIDA~1.JPG");
    }

    #[test]
    fn test_checksum_mismatch_falls_back_to_short_name() {
        let mut data = Vec::new();
        data.extend(lfn_raw(0x41, 0x12, "stale.txt"));
        data.extend(short_raw(b"OTHER   TXT", 0, 3, 10));
        assert_eq!(parse_directory(&data)[0].name, "OTHER.TXT");
    }

    #[test]
    fn test_deleted_entries_restore_first_character() {
        let mut short = *b"REPORT  PDF";
        let sum = short_name_checksum(&short);
        short[0] = ENTRY_DELETED;

        let mut data = Vec::new();
        data.extend(lfn_raw(ENTRY_DELETED, sum, "report.pdf"));
        data.extend(short_raw(&short, ATTR_ARCHIVE, 9, 5000));
        let mut bare = *b"XDATA   BIN";
        bare[0] = ENTRY_DELETED;
        data.extend(short_raw(&bare, ATTR_ARCHIVE, 20, 10));

        let entries = parse_directory(&data);
        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_deleted);
        assert_eq!(entries[0].name, "report.pdf");
        assert_eq!(entries[0].short_name, "REPORT.PDF");
        assert!(entries[0].has_long_name);
        assert_eq!(entries[1].name, "_DATA.BIN");
        assert!(!entries[1].has_long_name);
        assert_eq!(entries[1].index, 2);
    }

    #[test]
    fn test_end_marker_stops_parsing() {
        let mut data = short_raw(b"A       TXT", 0, 2, 1).to_vec();
        data.extend([0u8; 32]);
        data.extend(short_raw(b"B       TXT", 0, 3, 1));
        assert_eq!(parse_directory(&data).len(), 1);
    }

    #[test]
    fn test_zero_date_is_absent() {
        assert_eq!(fat_datetime(0, 0), None);
        assert_eq!(fat_datetime(13 << 5, 0), None);
    }
}

//! MFT record parsing: header, update-sequence fixups and the three
//! attribute kinds recovery cares about.
//!
//! Record header layout:
//! - 0x00: "FILE" (or "BAAD" when chkdsk flagged the slot)
//! - 0x04: update sequence array offset, 0x06: entry count
//! - 0x10: sequence number, 0x14: first attribute offset
//! - 0x16: flags (0x01 in use, 0x02 directory), 0x18: bytes in use
//! - 0x20: base record reference

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

use super::runs::{decode_data_runs, DataRun};
use crate::error::{FsError, FsResult};
use crate::fs::common::decode_utf16_name;

pub const RECORD_MAGIC: &[u8; 4] = b"FILE";
pub const BAAD_MAGIC: &[u8; 4] = b"BAAD";

pub const ATTR_STANDARD_INFORMATION: u32 = 0x10;
pub const ATTR_FILE_NAME: u32 = 0x30;
pub const ATTR_DATA: u32 = 0x80;
pub const ATTR_END: u32 = 0xFFFF_FFFF;

pub const FLAG_IN_USE: u16 = 0x0001;
pub const FLAG_DIRECTORY: u16 = 0x0002;

pub const DATA_FLAG_COMPRESSED: u16 = 0x0001;
pub const DATA_FLAG_ENCRYPTED: u16 = 0x4000;

/// Seconds between 1601-01-01 and 1970-01-01
const FILETIME_EPOCH_OFFSET: i64 = 11_644_473_600;

/// Convert a Windows FILETIME (100ns ticks since 1601) to UTC
pub fn filetime_to_datetime(filetime: u64) -> Option<DateTime<Utc>> {
    if filetime == 0 {
        return None;
    }
    let secs = (filetime / 10_000_000) as i64 - FILETIME_EPOCH_OFFSET;
    let nanos = ((filetime % 10_000_000) * 100) as u32;
    DateTime::from_timestamp(secs, nanos)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StandardInformation {
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    pub mft_modified: Option<DateTime<Utc>>,
    pub accessed: Option<DateTime<Utc>>,
    /// DOS attribute flags (read-only, hidden, system, archive ...)
    pub dos_flags: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileNamespace {
    Posix,
    Win32,
    Dos,
    Win32AndDos,
}

impl From<u8> for FileNamespace {
    fn from(value: u8) -> Self {
        match value {
            1 => FileNamespace::Win32,
            2 => FileNamespace::Dos,
            3 => FileNamespace::Win32AndDos,
            _ => FileNamespace::Posix,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileNameAttribute {
    pub parent_record: u64,
    pub parent_sequence: u16,
    pub name: String,
    pub namespace: FileNamespace,
    pub real_size: u64,
    pub allocated_size: u64,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataAttribute {
    pub resident: bool,
    /// Inline payload of a resident stream
    pub resident_data: Option<Vec<u8>>,
    pub runs: Vec<DataRun>,
    pub real_size: u64,
    pub allocated_size: u64,
    pub compressed: bool,
    pub encrypted: bool,
}

impl DataAttribute {
    pub fn run_count(&self) -> usize {
        self.runs.iter().filter(|r| !r.is_sparse()).count()
    }
}

/// A decoded attribute, tagged by kind
#[derive(Debug, Clone, PartialEq)]
pub enum Attribute {
    StandardInformation(StandardInformation),
    FileName(FileNameAttribute),
    Data(DataAttribute),
}

/// At most one attribute of each kind per record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordAttributes {
    pub standard_information: Option<StandardInformation>,
    pub file_name: Option<FileNameAttribute>,
    pub data: Option<DataAttribute>,
}

impl RecordAttributes {
    fn insert(&mut self, attribute: Attribute) {
        match attribute {
            Attribute::StandardInformation(si) => {
                self.standard_information.get_or_insert(si);
            }
            Attribute::FileName(name) => match &self.file_name {
                Some(existing)
                    if existing.namespace == FileNamespace::Dos
                        && name.namespace != FileNamespace::Dos =>
                {
                    self.file_name = Some(name);
                }
                Some(_) => {}
                None => self.file_name = Some(name),
            },
            Attribute::Data(data) => {
                self.data.get_or_insert(data);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MftRecord {
    pub record_number: u64,
    pub sequence_number: u16,
    pub flags: u16,
    /// Non-zero for extension records belonging to another base record
    pub base_record: u64,
    pub attributes: RecordAttributes,
}

impl MftRecord {
    /// Parse one MFT slot. Returns `Ok(None)` for a never-used (zeroed) slot.
    pub fn parse(raw: &[u8], record_number: u64, sector_size: usize) -> FsResult<Option<Self>> {
        if raw.len() < 0x30 {
            return Err(FsError::InvalidFormat(format!(
                "MFT record {} is only {} bytes",
                record_number,
                raw.len()
            )));
        }

        match &raw[0..4] {
            m if m == RECORD_MAGIC => {}
            m if m == BAAD_MAGIC => {
                return Err(FsError::InvalidFormat(format!(
                    "MFT record {} is marked BAAD",
                    record_number
                )))
            }
            [0, 0, 0, 0] => return Ok(None),
            other => {
                return Err(FsError::InvalidFormat(format!(
                    "MFT record {} has bad magic {:02x?}",
                    record_number, other
                )))
            }
        }

        let mut data = raw.to_vec();
        apply_fixups(&mut data, sector_size).map_err(|e| match e {
            FsError::InvalidFormat(msg) => {
                FsError::InvalidFormat(format!("MFT record {}: {}", record_number, msg))
            }
            other => other,
        })?;

        let mut cursor = Cursor::new(&data[..]);
        cursor.set_position(0x10);
        let sequence_number = read_u16(&mut cursor)?;
        let _link_count = read_u16(&mut cursor)?;
        let first_attribute = read_u16(&mut cursor)? as usize;
        let flags = read_u16(&mut cursor)?;
        let bytes_in_use = read_u32(&mut cursor)? as usize;
        cursor.set_position(0x20);
        let base_record = cursor
            .read_u64::<LittleEndian>()
            .map_err(|_| FsError::InvalidFormat("truncated record header".into()))?
            & 0x0000_FFFF_FFFF_FFFF;

        let limit = if bytes_in_use == 0 {
            data.len()
        } else {
            bytes_in_use.min(data.len())
        };

        let mut attributes = RecordAttributes::default();
        let mut pos = first_attribute;
        while pos + 8 <= limit {
            let attr_type = LittleEndian::read_u32(&data[pos..]);
            if attr_type == ATTR_END {
                break;
            }
            let attr_len = LittleEndian::read_u32(&data[pos + 4..]) as usize;
            if attr_len < 16 || pos + attr_len > limit {
                tracing::debug!(
                    "Record {}: attribute {:#x} at {} has bad length {}",
                    record_number,
                    attr_type,
                    pos,
                    attr_len
                );
                break;
            }

            let raw_attr = &data[pos..pos + attr_len];
            if let Some(attribute) = parse_attribute(attr_type, raw_attr)? {
                attributes.insert(attribute);
            }
            pos += attr_len;
        }

        Ok(Some(MftRecord {
            record_number,
            sequence_number,
            flags,
            base_record,
            attributes,
        }))
    }

    pub fn is_in_use(&self) -> bool {
        self.flags & FLAG_IN_USE != 0
    }

    pub fn is_deleted(&self) -> bool {
        !self.is_in_use()
    }

    pub fn is_directory(&self) -> bool {
        self.flags & FLAG_DIRECTORY != 0
    }

    pub fn name(&self) -> Option<&str> {
        self.attributes.file_name.as_ref().map(|f| f.name.as_str())
    }

    pub fn parent_record(&self) -> Option<u64> {
        self.attributes.file_name.as_ref().map(|f| f.parent_record)
    }

    pub fn data(&self) -> Option<&DataAttribute> {
        self.attributes.data.as_ref()
    }

    /// A record is extractable only through an unnamed `$DATA` stream that
    /// is neither compressed nor encrypted.
    pub fn is_file_recoverable(&self) -> bool {
        self.data()
            .map_or(false, |d| !d.compressed && !d.encrypted)
    }

    /// Logical size: `$DATA` real size, else the size cached in `$FILE_NAME`
    pub fn size(&self) -> u64 {
        match (&self.attributes.data, &self.attributes.file_name) {
            (Some(d), _) => d.real_size,
            (None, Some(f)) => f.real_size,
            (None, None) => 0,
        }
    }

    pub fn is_system_file(&self) -> bool {
        self.record_number < 16 || self.name().map_or(false, |n| n.starts_with('$'))
    }
}

fn read_u16(cursor: &mut Cursor<&[u8]>) -> FsResult<u16> {
    cursor
        .read_u16::<LittleEndian>()
        .map_err(|_| FsError::InvalidFormat("truncated record header".into()))
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> FsResult<u32> {
    cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| FsError::InvalidFormat("truncated record header".into()))
}

/// Restore the last two bytes of every sector from the update sequence
/// array, verifying each against the update sequence number.
pub fn apply_fixups(data: &mut [u8], sector_size: usize) -> FsResult<()> {
    let usa_offset = LittleEndian::read_u16(&data[0x04..]) as usize;
    let usa_count = LittleEndian::read_u16(&data[0x06..]) as usize;
    if usa_count == 0 {
        return Ok(());
    }
    if usa_offset + usa_count * 2 > data.len() || sector_size < 2 {
        return Err(FsError::InvalidFormat("update sequence array out of bounds".into()));
    }

    let usn = [data[usa_offset], data[usa_offset + 1]];
    for i in 1..usa_count {
        let sector_end = i * sector_size;
        if sector_end > data.len() {
            break;
        }
        let tail = sector_end - 2;
        if data[tail..sector_end] != usn {
            return Err(FsError::InvalidFormat(format!(
                "fixup mismatch in sector {}",
                i - 1
            )));
        }
        let entry = usa_offset + i * 2;
        data[tail] = data[entry];
        data[tail + 1] = data[entry + 1];
    }
    Ok(())
}

struct AttributeHeader<'a> {
    non_resident: bool,
    name_length: u8,
    flags: u16,
    raw: &'a [u8],
}

impl<'a> AttributeHeader<'a> {
    fn new(raw: &'a [u8]) -> Self {
        Self {
            non_resident: raw[8] != 0,
            name_length: raw[9],
            flags: LittleEndian::read_u16(&raw[12..]),
            raw,
        }
    }

    /// Payload of a resident attribute
    fn resident_content(&self) -> FsResult<&'a [u8]> {
        if self.raw.len() < 24 {
            return Err(FsError::InvalidFormat("resident attribute header truncated".into()));
        }
        let length = LittleEndian::read_u32(&self.raw[16..]) as usize;
        let offset = LittleEndian::read_u16(&self.raw[20..]) as usize;
        self.raw
            .get(offset..offset + length)
            .ok_or_else(|| FsError::InvalidFormat("resident content outside attribute".into()))
    }
}

fn parse_attribute(attr_type: u32, raw: &[u8]) -> FsResult<Option<Attribute>> {
    let header = AttributeHeader::new(raw);
    match attr_type {
        ATTR_STANDARD_INFORMATION if !header.non_resident => {
            let content = header.resident_content()?;
            if content.len() < 36 {
                return Ok(None);
            }
            Ok(Some(Attribute::StandardInformation(StandardInformation {
                created: filetime_to_datetime(LittleEndian::read_u64(&content[0..])),
                modified: filetime_to_datetime(LittleEndian::read_u64(&content[8..])),
                mft_modified: filetime_to_datetime(LittleEndian::read_u64(&content[16..])),
                accessed: filetime_to_datetime(LittleEndian::read_u64(&content[24..])),
                dos_flags: LittleEndian::read_u32(&content[32..]),
            })))
        }
        ATTR_FILE_NAME if !header.non_resident => {
            let content = header.resident_content()?;
            if content.len() < 66 {
                return Ok(None);
            }
            let name_chars = content[0x40] as usize;
            let name_bytes = content
                .get(0x42..0x42 + name_chars * 2)
                .ok_or_else(|| FsError::InvalidFormat("file name runs past attribute".into()))?;
            let parent = LittleEndian::read_u64(&content[0..]);
            Ok(Some(Attribute::FileName(FileNameAttribute {
                parent_record: parent & 0x0000_FFFF_FFFF_FFFF,
                parent_sequence: (parent >> 48) as u16,
                name: decode_utf16_name(name_bytes),
                namespace: FileNamespace::from(content[0x41]),
                real_size: LittleEndian::read_u64(&content[0x30..]),
                allocated_size: LittleEndian::read_u64(&content[0x28..]),
                created: filetime_to_datetime(LittleEndian::read_u64(&content[0x08..])),
                modified: filetime_to_datetime(LittleEndian::read_u64(&content[0x10..])),
            })))
        }
        // Named $DATA streams are alternate data streams; only the unnamed one is the file
        ATTR_DATA if header.name_length == 0 => {
            let compressed = header.flags & DATA_FLAG_COMPRESSED != 0;
            let encrypted = header.flags & DATA_FLAG_ENCRYPTED != 0;

            if !header.non_resident {
                let content = header.resident_content()?;
                return Ok(Some(Attribute::Data(DataAttribute {
                    resident: true,
                    resident_data: Some(content.to_vec()),
                    runs: Vec::new(),
                    real_size: content.len() as u64,
                    allocated_size: content.len() as u64,
                    compressed,
                    encrypted,
                })));
            }

            if raw.len() < 0x40 {
                return Err(FsError::InvalidFormat("non-resident attribute header truncated".into()));
            }
            let runs_offset = LittleEndian::read_u16(&raw[0x20..]) as usize;
            let run_bytes = raw
                .get(runs_offset..)
                .ok_or_else(|| FsError::InvalidFormat("data runs outside attribute".into()))?;
            Ok(Some(Attribute::Data(DataAttribute {
                resident: false,
                resident_data: None,
                runs: decode_data_runs(run_bytes)?,
                allocated_size: LittleEndian::read_u64(&raw[0x28..]),
                real_size: LittleEndian::read_u64(&raw[0x30..]),
                compressed,
                encrypted,
            })))
        }
        _ => Ok(None),
    }
}

/// Builder for synthetic MFT records, used by unit and integration tests
/// to lay out images without a real NTFS volume.
pub mod builder {
    use byteorder::{ByteOrder, LittleEndian};

    use super::{ATTR_DATA, ATTR_END, ATTR_FILE_NAME, ATTR_STANDARD_INFORMATION};
    use crate::fs::ntfs::runs::DataRun;

    pub struct RecordBuilder {
        record_size: usize,
        sector_size: usize,
        flags: u16,
        attributes: Vec<Vec<u8>>,
    }

    impl RecordBuilder {
        pub fn new(record_size: usize, sector_size: usize) -> Self {
            Self {
                record_size,
                sector_size,
                flags: 0,
                attributes: Vec::new(),
            }
        }

        pub fn in_use(mut self, in_use: bool) -> Self {
            if in_use {
                self.flags |= super::FLAG_IN_USE;
            } else {
                self.flags &= !super::FLAG_IN_USE;
            }
            self
        }

        pub fn directory(mut self) -> Self {
            self.flags |= super::FLAG_DIRECTORY;
            self
        }

        pub fn standard_information(mut self, filetime: u64) -> Self {
            let mut content = vec![0u8; 48];
            for i in 0..4 {
                LittleEndian::write_u64(&mut content[i * 8..], filetime);
            }
            LittleEndian::write_u32(&mut content[32..], 0x20);
            self.attributes
                .push(resident(ATTR_STANDARD_INFORMATION, 0, &content));
            self
        }

        pub fn file_name(mut self, parent: u64, name: &str, size: u64, namespace: u8) -> Self {
            let utf16: Vec<u16> = name.encode_utf16().collect();
            let mut content = vec![0u8; 0x42 + utf16.len() * 2];
            LittleEndian::write_u64(&mut content[0..], parent | (1u64 << 48));
            LittleEndian::write_u64(&mut content[0x28..], size);
            LittleEndian::write_u64(&mut content[0x30..], size);
            content[0x40] = utf16.len() as u8;
            content[0x41] = namespace;
            for (i, c) in utf16.iter().enumerate() {
                LittleEndian::write_u16(&mut content[0x42 + i * 2..], *c);
            }
            self.attributes.push(resident(ATTR_FILE_NAME, 0, &content));
            self
        }

        pub fn resident_data(mut self, payload: &[u8]) -> Self {
            self.attributes.push(resident(ATTR_DATA, 0, payload));
            self
        }

        pub fn data_runs(self, runs: &[DataRun], real_size: u64) -> Self {
            self.data_runs_with_flags(runs, real_size, 0)
        }

        pub fn data_runs_with_flags(mut self, runs: &[DataRun], real_size: u64, flags: u16) -> Self {
            let encoded = encode_runs(runs);
            let header_len = 0x40;
            let total = (header_len + encoded.len() + 7) & !7;
            let mut attr = vec![0u8; total];
            LittleEndian::write_u32(&mut attr[0..], ATTR_DATA);
            LittleEndian::write_u32(&mut attr[4..], total as u32);
            attr[8] = 1;
            LittleEndian::write_u16(&mut attr[12..], flags);
            LittleEndian::write_u16(&mut attr[0x20..], header_len as u16);
            let clusters: u64 = runs.iter().map(|r| r.length).sum();
            LittleEndian::write_u64(&mut attr[0x18..], clusters.saturating_sub(1));
            LittleEndian::write_u64(&mut attr[0x28..], clusters * 4096);
            LittleEndian::write_u64(&mut attr[0x30..], real_size);
            LittleEndian::write_u64(&mut attr[0x38..], real_size);
            attr[header_len..header_len + encoded.len()].copy_from_slice(&encoded);
            self.attributes.push(attr);
            self
        }

        /// Serialize with a valid update sequence array applied
        pub fn build(self) -> Vec<u8> {
            let mut rec = vec![0u8; self.record_size];
            rec[0..4].copy_from_slice(b"FILE");
            let sectors = self.record_size / self.sector_size;
            let usa_offset = 0x30;
            LittleEndian::write_u16(&mut rec[0x04..], usa_offset as u16);
            LittleEndian::write_u16(&mut rec[0x06..], (sectors + 1) as u16);
            LittleEndian::write_u16(&mut rec[0x10..], 1);
            LittleEndian::write_u16(&mut rec[0x12..], 1);
            let first_attr = (usa_offset + (sectors + 1) * 2 + 7) & !7;
            LittleEndian::write_u16(&mut rec[0x14..], first_attr as u16);
            LittleEndian::write_u16(&mut rec[0x16..], self.flags);

            let mut pos = first_attr;
            for attr in &self.attributes {
                rec[pos..pos + attr.len()].copy_from_slice(attr);
                pos += attr.len();
            }
            LittleEndian::write_u32(&mut rec[pos..], ATTR_END);
            pos += 8;
            LittleEndian::write_u32(&mut rec[0x18..], pos as u32);
            LittleEndian::write_u32(&mut rec[0x1C..], self.record_size as u32);

            let usn: u16 = 0x0001;
            LittleEndian::write_u16(&mut rec[usa_offset..], usn);
            for i in 1..=sectors {
                let tail = i * self.sector_size - 2;
                let original = [rec[tail], rec[tail + 1]];
                rec[usa_offset + i * 2..usa_offset + i * 2 + 2].copy_from_slice(&original);
                LittleEndian::write_u16(&mut rec[tail..], usn);
            }
            rec
        }
    }

    fn resident(attr_type: u32, name_length: u8, content: &[u8]) -> Vec<u8> {
        let content_offset = 0x18;
        let total = (content_offset + content.len() + 7) & !7;
        let mut attr = vec![0u8; total];
        LittleEndian::write_u32(&mut attr[0..], attr_type);
        LittleEndian::write_u32(&mut attr[4..], total as u32);
        attr[8] = 0;
        attr[9] = name_length;
        LittleEndian::write_u32(&mut attr[16..], content.len() as u32);
        LittleEndian::write_u16(&mut attr[20..], content_offset as u16);
        attr[content_offset..content_offset + content.len()].copy_from_slice(content);
        attr
    }

    /// Encode a run list (minimal-width lengths, signed LCN deltas)
    pub fn encode_runs(runs: &[DataRun]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut previous: i64 = 0;
        for run in runs {
            let length_bytes = minimal_unsigned(run.length);
            let delta_bytes = match run.start_cluster {
                Some(lcn) => {
                    let delta = lcn as i64 - previous;
                    previous = lcn as i64;
                    minimal_signed(delta)
                }
                None => Vec::new(),
            };
            out.push(((delta_bytes.len() as u8) << 4) | length_bytes.len() as u8);
            out.extend_from_slice(&length_bytes);
            out.extend_from_slice(&delta_bytes);
        }
        out.push(0);
        out
    }

    fn minimal_unsigned(value: u64) -> Vec<u8> {
        let mut bytes = value.to_le_bytes().to_vec();
        while bytes.len() > 1 && bytes[bytes.len() - 1] == 0 {
            bytes.pop();
        }
        bytes
    }

    fn minimal_signed(value: i64) -> Vec<u8> {
        let mut bytes = value.to_le_bytes().to_vec();
        while bytes.len() > 1 {
            let last = bytes[bytes.len() - 1];
            let prev_high = bytes[bytes.len() - 2] & 0x80;
            if (last == 0x00 && prev_high == 0) || (last == 0xFF && prev_high != 0) {
                bytes.pop();
            } else {
                break;
            }
        }
        bytes
    }

    /// Lays out a minimal NTFS volume: boot sector, a contiguous MFT whose
    /// record 0 describes itself, the given records and raw cluster content.
    pub struct NtfsImageBuilder {
        cluster_size: u32,
        total_clusters: u64,
        mft_lcn: u64,
        mft_slots: u64,
        records: Vec<(u64, Vec<u8>)>,
        clusters: Vec<(u64, Vec<u8>)>,
    }

    pub const RECORD_SIZE: usize = 1024;

    impl NtfsImageBuilder {
        pub fn new(cluster_size: u32, total_clusters: u64) -> Self {
            Self {
                cluster_size,
                total_clusters,
                mft_lcn: 16,
                mft_slots: 128,
                records: Vec::new(),
                clusters: Vec::new(),
            }
        }

        pub fn mft_lcn(mut self, lcn: u64) -> Self {
            self.mft_lcn = lcn;
            self
        }

        pub fn mft_offset(&self) -> u64 {
            self.mft_lcn * self.cluster_size as u64
        }

        pub fn record(&mut self, number: u64, record: RecordBuilder) -> &mut Self {
            self.records.push((number, record.build()));
            self
        }

        /// Raw slot bytes, for corrupt-slot cases
        pub fn raw_record(&mut self, number: u64, bytes: Vec<u8>) -> &mut Self {
            self.records.push((number, bytes));
            self
        }

        /// Bytes written at the start of `cluster`
        pub fn cluster(&mut self, cluster: u64, bytes: &[u8]) -> &mut Self {
            self.clusters.push((cluster, bytes.to_vec()));
            self
        }

        pub fn build(&self) -> Vec<u8> {
            let cs = self.cluster_size as usize;
            let mut image = vec![0u8; cs * self.total_clusters as usize];

            image[3..11].copy_from_slice(b"NTFS    ");
            LittleEndian::write_u16(&mut image[0x0B..], 512);
            image[0x0D] = (self.cluster_size / 512) as u8;
            LittleEndian::write_u64(&mut image[0x28..], self.total_clusters * (cs as u64 / 512));
            LittleEndian::write_u64(&mut image[0x30..], self.mft_lcn);
            LittleEndian::write_u64(&mut image[0x38..], 2);
            image[0x40] = (-10i8) as u8; // 2^10 = 1024-byte records
            image[0x44] = 1;
            LittleEndian::write_u64(&mut image[0x48..], 0x1234_5678_9ABC_DEF0);
            image[0x1FE] = 0x55;
            image[0x1FF] = 0xAA;

            let mft_bytes = self.mft_slots * RECORD_SIZE as u64;
            let mft_clusters = mft_bytes.div_ceil(cs as u64);
            let record_zero = RecordBuilder::new(RECORD_SIZE, 512)
                .in_use(true)
                .file_name(5, "$MFT", mft_bytes, 3)
                .data_runs(&[DataRun::new(self.mft_lcn, mft_clusters)], mft_bytes)
                .build();

            let mft_offset = self.mft_offset() as usize;
            let slots = std::iter::once((0u64, record_zero)).chain(self.records.iter().cloned());
            for (number, bytes) in slots {
                let at = mft_offset + number as usize * RECORD_SIZE;
                image[at..at + bytes.len()].copy_from_slice(&bytes);
            }
            for (cluster, bytes) in &self.clusters {
                let at = *cluster as usize * cs;
                image[at..at + bytes.len()].copy_from_slice(bytes);
            }
            image
        }
    }
}

#[cfg(test)]
mod tests {
    use super::builder::{encode_runs, RecordBuilder};
    use super::*;
    use crate::fs::ntfs::runs::decode_data_runs;

    const FT_2020: u64 = 132_223_104_000_000_000; // 2020-01-01T00:00:00Z

    #[test]
    fn test_filetime_conversion() {
        let dt = filetime_to_datetime(FT_2020).unwrap();
        assert_eq!(dt.to_rfc3339(), "2020-01-01T00:00:00+00:00");
        assert!(filetime_to_datetime(0).is_none());
    }

    #[test]
    fn test_parse_full_record() {
        let raw = RecordBuilder::new(1024, 512)
            .in_use(false)
            .standard_information(FT_2020)
            .file_name(5, "photo.jpg", 8192, 1)
            .data_runs(&[DataRun::new(100, 1), DataRun::new(205, 1)], 8192)
            .build();

        let record = MftRecord::parse(&raw, 40, 512).unwrap().unwrap();
        assert!(record.is_deleted());
        assert_eq!(record.name(), Some("photo.jpg"));
        assert_eq!(record.parent_record(), Some(5));
        assert_eq!(record.size(), 8192);
        let data = record.data().unwrap();
        assert_eq!(data.runs, vec![DataRun::new(100, 1), DataRun::new(205, 1)]);
        assert!(record.is_file_recoverable());
        assert_eq!(
            record.attributes.standard_information.as_ref().unwrap().created,
            filetime_to_datetime(FT_2020)
        );
    }

    #[test]
    fn test_dos_name_replaced_by_win32() {
        let raw = RecordBuilder::new(1024, 512)
            .in_use(true)
            .file_name(5, "LONGNA~1.TXT", 10, 2)
            .file_name(5, "long name.txt", 10, 1)
            .build();
        let record = MftRecord::parse(&raw, 30, 512).unwrap().unwrap();
        assert_eq!(record.name(), Some("long name.txt"));
    }

    #[test]
    fn test_compressed_or_encrypted_not_recoverable() {
        for flags in [DATA_FLAG_COMPRESSED, DATA_FLAG_ENCRYPTED, DATA_FLAG_COMPRESSED | DATA_FLAG_ENCRYPTED] {
            let raw = RecordBuilder::new(1024, 512)
                .file_name(5, "secret.bin", 4096, 1)
                .data_runs_with_flags(&[DataRun::new(300, 1)], 4096, flags)
                .build();
            let record = MftRecord::parse(&raw, 41, 512).unwrap().unwrap();
            assert!(!record.is_file_recoverable());
        }
    }

    #[test]
    fn test_record_without_data_not_recoverable() {
        let raw = RecordBuilder::new(1024, 512)
            .file_name(5, "empty", 0, 1)
            .build();
        let record = MftRecord::parse(&raw, 42, 512).unwrap().unwrap();
        assert!(record.data().is_none());
        assert!(!record.is_file_recoverable());
    }

    #[test]
    fn test_resident_data_kept_inline() {
        let raw = RecordBuilder::new(1024, 512)
            .file_name(5, "note.txt", 11, 1)
            .resident_data(b"hello world")
            .build();
        let record = MftRecord::parse(&raw, 43, 512).unwrap().unwrap();
        let data = record.data().unwrap();
        assert!(data.resident);
        assert_eq!(data.resident_data.as_deref(), Some(&b"hello world"[..]));
        assert_eq!(record.size(), 11);
    }

    #[test]
    fn test_fixup_mismatch_is_corrupt() {
        let mut raw = RecordBuilder::new(1024, 512).file_name(5, "x", 0, 1).build();
        raw[510] ^= 0xFF;
        assert!(MftRecord::parse(&raw, 44, 512).is_err());
    }

    #[test]
    fn test_baad_and_empty_slots() {
        let mut raw = RecordBuilder::new(1024, 512).build();
        raw[0..4].copy_from_slice(BAAD_MAGIC);
        assert!(MftRecord::parse(&raw, 45, 512).is_err());
        assert!(MftRecord::parse(&vec![0u8; 1024], 46, 512).unwrap().is_none());
    }

    #[test]
    fn test_run_encoding_round_trip() {
        let runs = vec![DataRun::new(1000, 8), DataRun::sparse(4), DataRun::new(20, 300)];
        assert_eq!(decode_data_runs(&encode_runs(&runs)).unwrap(), runs);
    }
}

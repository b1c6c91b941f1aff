/// Signature catalog: header/footer byte patterns per file format, grouped
/// by category, with a per-format rule for estimating carved length.
///
/// Length estimation per format:
/// - PNG: chunk walk to `IEND`
/// - BMP: declared file size at bytes 2..6
/// - WAV/AVI/WEBP: RIFF declared size + 8
/// - ZIP: first consistent end-of-central-directory record plus comment
/// - MP4: top-level box walk
/// - JPEG (`FF D9`), GIF (`00 3B`), PDF (`%%EOF`): footer search
/// - everything else: until the next header match, clamped to `max_size`
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignatureCategory {
    Images,
    Documents,
    Video,
    Audio,
    Archive,
    Email,
    /// Executables, databases
    Other,
}

impl SignatureCategory {
    pub const ALL: [SignatureCategory; 7] = [
        SignatureCategory::Images,
        SignatureCategory::Documents,
        SignatureCategory::Video,
        SignatureCategory::Audio,
        SignatureCategory::Archive,
        SignatureCategory::Email,
        SignatureCategory::Other,
    ];
}

impl std::fmt::Display for SignatureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SignatureCategory::Images => "images",
            SignatureCategory::Documents => "documents",
            SignatureCategory::Video => "video",
            SignatureCategory::Audio => "audio",
            SignatureCategory::Archive => "archive",
            SignatureCategory::Email => "email",
            SignatureCategory::Other => "other",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for SignatureCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "images" | "image" => Ok(SignatureCategory::Images),
            "documents" | "document" | "docs" => Ok(SignatureCategory::Documents),
            "video" | "videos" => Ok(SignatureCategory::Video),
            "audio" => Ok(SignatureCategory::Audio),
            "archive" | "archives" => Ok(SignatureCategory::Archive),
            "email" | "mail" => Ok(SignatureCategory::Email),
            "other" => Ok(SignatureCategory::Other),
            other => Err(format!("unknown signature category '{}'", other)),
        }
    }
}

/// How the carver decides where a file ends
#[derive(Clone, Copy)]
pub enum SizeRule {
    /// Run until the next header match (or medium end)
    NextHeader,
    /// Search for the signature's footer
    Footer,
    /// Read the format's own length fields
    Internal(fn(&[u8]) -> Option<u64>),
}

impl std::fmt::Debug for SizeRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SizeRule::NextHeader => write!(f, "NextHeader"),
            SizeRule::Footer => write!(f, "Footer"),
            SizeRule::Internal(_) => write!(f, "Internal"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileSignature {
    pub format_id: &'static str,
    pub extension: &'static str,
    pub category: SignatureCategory,
    pub header: &'static [u8],
    /// Where the header sits relative to the file start
    pub header_offset: usize,
    /// Secondary fixed bytes at an offset (RIFF and similar containers)
    pub subtype: Option<(usize, &'static [u8])>,
    pub footer: Option<&'static [u8]>,
    pub max_size: u64,
    pub size_rule: SizeRule,
}

impl FileSignature {
    /// Fixed-prefix comparison of a cluster's leading bytes
    pub fn matches(&self, data: &[u8]) -> bool {
        let end = self.header_offset + self.header.len();
        if data.len() < end || &data[self.header_offset..end] != self.header {
            return false;
        }
        match self.subtype {
            Some((offset, bytes)) => data.get(offset..offset + bytes.len()) == Some(bytes),
            None => true,
        }
    }

    /// Bytes that must be available to decide a match
    pub fn probe_len(&self) -> usize {
        let header_end = self.header_offset + self.header.len();
        match self.subtype {
            Some((offset, bytes)) => header_end.max(offset + bytes.len()),
            None => header_end,
        }
    }
}

const MB: u64 = 1024 * 1024;

/// Formats in declaration order; earlier entries win ties.
pub fn builtin_signatures() -> Vec<FileSignature> {
    vec![
        // Images
        FileSignature {
            format_id: "JPEG",
            extension: "jpg",
            category: SignatureCategory::Images,
            header: &[0xFF, 0xD8, 0xFF],
            header_offset: 0,
            subtype: None,
            footer: Some(&[0xFF, 0xD9]),
            max_size: 50 * MB,
            size_rule: SizeRule::Footer,
        },
        FileSignature {
            format_id: "PNG",
            extension: "png",
            category: SignatureCategory::Images,
            header: &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A],
            header_offset: 0,
            subtype: None,
            footer: Some(&[0x49, 0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82]),
            max_size: 50 * MB,
            size_rule: SizeRule::Internal(parse_png_size),
        },
        FileSignature {
            format_id: "GIF",
            extension: "gif",
            category: SignatureCategory::Images,
            header: b"GIF8",
            header_offset: 0,
            subtype: None,
            footer: Some(&[0x00, 0x3B]),
            max_size: 20 * MB,
            size_rule: SizeRule::Footer,
        },
        FileSignature {
            format_id: "BMP",
            extension: "bmp",
            category: SignatureCategory::Images,
            header: b"BM",
            header_offset: 0,
            subtype: None,
            footer: None,
            max_size: 100 * MB,
            size_rule: SizeRule::Internal(parse_bmp_size),
        },
        FileSignature {
            format_id: "TIFF",
            extension: "tif",
            category: SignatureCategory::Images,
            header: &[0x49, 0x49, 0x2A, 0x00],
            header_offset: 0,
            subtype: None,
            footer: None,
            max_size: 100 * MB,
            size_rule: SizeRule::NextHeader,
        },
        FileSignature {
            format_id: "WEBP",
            extension: "webp",
            category: SignatureCategory::Images,
            header: b"RIFF",
            header_offset: 0,
            subtype: Some((8, b"WEBP")),
            footer: None,
            max_size: 50 * MB,
            size_rule: SizeRule::Internal(parse_riff_size),
        },
        // Documents
        FileSignature {
            format_id: "PDF",
            extension: "pdf",
            category: SignatureCategory::Documents,
            header: b"%PDF-",
            header_offset: 0,
            subtype: None,
            footer: Some(b"%%EOF"),
            max_size: 200 * MB,
            size_rule: SizeRule::Footer,
        },
        FileSignature {
            format_id: "OLE2",
            extension: "doc",
            category: SignatureCategory::Documents,
            header: &[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1],
            header_offset: 0,
            subtype: None,
            footer: None,
            max_size: 200 * MB,
            size_rule: SizeRule::NextHeader,
        },
        FileSignature {
            format_id: "RTF",
            extension: "rtf",
            category: SignatureCategory::Documents,
            header: b"{\\rtf1",
            header_offset: 0,
            subtype: None,
            footer: None,
            max_size: 50 * MB,
            size_rule: SizeRule::NextHeader,
        },
        // Video
        FileSignature {
            format_id: "MP4",
            extension: "mp4",
            category: SignatureCategory::Video,
            header: b"ftyp",
            header_offset: 4,
            subtype: None,
            footer: None,
            max_size: 4096 * MB,
            size_rule: SizeRule::Internal(parse_mp4_size),
        },
        FileSignature {
            format_id: "AVI",
            extension: "avi",
            category: SignatureCategory::Video,
            header: b"RIFF",
            header_offset: 0,
            subtype: Some((8, b"AVI ")),
            footer: None,
            max_size: 4096 * MB,
            size_rule: SizeRule::Internal(parse_riff_size),
        },
        FileSignature {
            format_id: "MKV",
            extension: "mkv",
            category: SignatureCategory::Video,
            header: &[0x1A, 0x45, 0xDF, 0xA3],
            header_offset: 0,
            subtype: None,
            footer: None,
            max_size: 4096 * MB,
            size_rule: SizeRule::NextHeader,
        },
        // Audio
        FileSignature {
            format_id: "MP3",
            extension: "mp3",
            category: SignatureCategory::Audio,
            header: b"ID3",
            header_offset: 0,
            subtype: None,
            footer: None,
            max_size: 50 * MB,
            size_rule: SizeRule::NextHeader,
        },
        FileSignature {
            format_id: "WAV",
            extension: "wav",
            category: SignatureCategory::Audio,
            header: b"RIFF",
            header_offset: 0,
            subtype: Some((8, b"WAVE")),
            footer: None,
            max_size: 2048 * MB,
            size_rule: SizeRule::Internal(parse_riff_size),
        },
        FileSignature {
            format_id: "FLAC",
            extension: "flac",
            category: SignatureCategory::Audio,
            header: b"fLaC",
            header_offset: 0,
            subtype: None,
            footer: None,
            max_size: 500 * MB,
            size_rule: SizeRule::NextHeader,
        },
        FileSignature {
            format_id: "OGG",
            extension: "ogg",
            category: SignatureCategory::Audio,
            header: b"OggS",
            header_offset: 0,
            subtype: None,
            footer: None,
            max_size: 200 * MB,
            size_rule: SizeRule::NextHeader,
        },
        // Archives
        FileSignature {
            format_id: "ZIP",
            extension: "zip",
            category: SignatureCategory::Archive,
            header: &[0x50, 0x4B, 0x03, 0x04],
            header_offset: 0,
            subtype: None,
            footer: None,
            max_size: 4096 * MB,
            size_rule: SizeRule::Internal(parse_zip_size),
        },
        FileSignature {
            format_id: "RAR",
            extension: "rar",
            category: SignatureCategory::Archive,
            header: &[0x52, 0x61, 0x72, 0x21, 0x1A, 0x07],
            header_offset: 0,
            subtype: None,
            footer: None,
            max_size: 4096 * MB,
            size_rule: SizeRule::NextHeader,
        },
        FileSignature {
            format_id: "7Z",
            extension: "7z",
            category: SignatureCategory::Archive,
            header: &[0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C],
            header_offset: 0,
            subtype: None,
            footer: None,
            max_size: 4096 * MB,
            size_rule: SizeRule::NextHeader,
        },
        FileSignature {
            format_id: "GZIP",
            extension: "gz",
            category: SignatureCategory::Archive,
            header: &[0x1F, 0x8B, 0x08],
            header_offset: 0,
            subtype: None,
            footer: None,
            max_size: 4096 * MB,
            size_rule: SizeRule::NextHeader,
        },
        // Email
        FileSignature {
            format_id: "PST",
            extension: "pst",
            category: SignatureCategory::Email,
            header: b"!BDN",
            header_offset: 0,
            subtype: None,
            footer: None,
            max_size: 4096 * MB,
            size_rule: SizeRule::NextHeader,
        },
        FileSignature {
            format_id: "EML",
            extension: "eml",
            category: SignatureCategory::Email,
            header: b"Return-Path: ",
            header_offset: 0,
            subtype: None,
            footer: None,
            max_size: 50 * MB,
            size_rule: SizeRule::NextHeader,
        },
        // Other
        FileSignature {
            format_id: "SQLITE",
            extension: "sqlite",
            category: SignatureCategory::Other,
            header: b"SQLite format 3\0",
            header_offset: 0,
            subtype: None,
            footer: None,
            max_size: 4096 * MB,
            size_rule: SizeRule::NextHeader,
        },
        FileSignature {
            format_id: "ELF",
            extension: "elf",
            category: SignatureCategory::Other,
            header: &[0x7F, 0x45, 0x4C, 0x46],
            header_offset: 0,
            subtype: None,
            footer: None,
            max_size: 500 * MB,
            size_rule: SizeRule::NextHeader,
        },
        FileSignature {
            format_id: "EXE",
            extension: "exe",
            category: SignatureCategory::Other,
            header: b"MZ",
            header_offset: 0,
            subtype: None,
            footer: None,
            max_size: 500 * MB,
            size_rule: SizeRule::NextHeader,
        },
    ]
}

/// An ordered, category-filterable view over the built-in signatures
#[derive(Debug, Clone)]
pub struct SignatureCatalog {
    signatures: Vec<FileSignature>,
}

impl SignatureCatalog {
    pub fn new(signatures: Vec<FileSignature>) -> Self {
        Self { signatures }
    }

    pub fn builtin() -> Self {
        Self::new(builtin_signatures())
    }

    /// Keep only the given categories; an empty slice keeps everything.
    /// Declaration order is preserved.
    pub fn restricted_to(mut self, categories: &[SignatureCategory]) -> Self {
        if !categories.is_empty() {
            self.signatures.retain(|s| categories.contains(&s.category));
        }
        self
    }

    pub fn signatures(&self) -> &[FileSignature] {
        &self.signatures
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    pub fn get(&self, format_id: &str) -> Option<&FileSignature> {
        self.signatures.iter().find(|s| s.format_id == format_id)
    }

    /// First declared signature matching `data`
    pub fn match_header(&self, data: &[u8]) -> Option<&FileSignature> {
        self.signatures.iter().find(|s| s.matches(data))
    }

    /// Every signature matching `data`, in declaration order
    pub fn matches(&self, data: &[u8]) -> Vec<&FileSignature> {
        self.signatures.iter().filter(|s| s.matches(data)).collect()
    }

    /// Longest probe any enabled signature needs
    pub fn max_probe_len(&self) -> usize {
        self.signatures
            .iter()
            .map(FileSignature::probe_len)
            .max()
            .unwrap_or(0)
    }
}

impl Default for SignatureCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Walk PNG chunks until `IEND`
pub(crate) fn parse_png_size(data: &[u8]) -> Option<u64> {
    if data.len() < 8 {
        return None;
    }
    let mut pos = 8usize;
    loop {
        if pos + 12 > data.len() {
            return None;
        }
        let chunk_len =
            u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]) as usize;
        let chunk_type = &data[pos + 4..pos + 8];
        // length + type + payload + crc
        let total_chunk = 12usize.checked_add(chunk_len)?;
        if chunk_type == b"IEND" {
            return Some((pos + total_chunk) as u64);
        }
        pos = pos.checked_add(total_chunk)?;
    }
}

/// BMP declares its file size at bytes 2..6
pub(crate) fn parse_bmp_size(data: &[u8]) -> Option<u64> {
    if data.len() < 6 {
        return None;
    }
    let size = u32::from_le_bytes([data[2], data[3], data[4], data[5]]) as u64;
    if size > 54 {
        Some(size)
    } else {
        None
    }
}

/// RIFF containers: declared size excludes the 8-byte chunk header
pub(crate) fn parse_riff_size(data: &[u8]) -> Option<u64> {
    if data.len() < 12 {
        return None;
    }
    let size = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as u64;
    if size >= 4 {
        Some(size + 8)
    } else {
        None
    }
}

/// ZIP: the first end-of-central-directory record whose central directory
/// ends right where the record starts, plus its comment. Falls back to the
/// first record at all.
pub(crate) fn parse_zip_size(data: &[u8]) -> Option<u64> {
    const EOCD: [u8; 4] = [0x50, 0x4B, 0x05, 0x06];
    if data.len() < 22 {
        return None;
    }
    let end_of = |i: usize| i as u64 + 22 + u16::from_le_bytes([data[i + 20], data[i + 21]]) as u64;
    let mut first = None;
    for i in (0..=data.len() - 22).filter(|&i| data[i..i + 4] == EOCD) {
        let cd_size = u32::from_le_bytes([data[i + 12], data[i + 13], data[i + 14], data[i + 15]]) as u64;
        let cd_offset = u32::from_le_bytes([data[i + 16], data[i + 17], data[i + 18], data[i + 19]]) as u64;
        if cd_size > 0 && cd_offset + cd_size == i as u64 {
            return Some(end_of(i));
        }
        first.get_or_insert(i);
    }
    first.map(end_of)
}

/// MP4/MOV: walk top-level boxes while they stay well-formed
pub(crate) fn parse_mp4_size(data: &[u8]) -> Option<u64> {
    let len = data.len() as u64;
    let mut pos = 0u64;
    while pos + 8 <= len {
        let p = pos as usize;
        let box_size = u32::from_be_bytes([data[p], data[p + 1], data[p + 2], data[p + 3]]) as u64;
        let box_type = &data[p + 4..p + 8];
        if !box_type.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
            break;
        }
        match box_size {
            0 => return Some(len),
            1..=7 => break,
            _ => pos += box_size,
        }
    }
    if pos > 8 {
        Some(pos)
    } else {
        None
    }
}

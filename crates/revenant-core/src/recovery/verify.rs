/// Hashing of extracted content for forensic integrity
///
/// Extraction streams through a `HashingWriter`, so every recovered file
/// carries a SHA-256 (and optionally MD5/SHA-1) computed over exactly the
/// bytes that reached the destination.
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

/// Supported hash algorithms
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    MD5,
    SHA1,
    SHA256,
}

impl HashAlgorithm {
    pub fn all() -> Vec<Self> {
        vec![Self::MD5, Self::SHA1, Self::SHA256]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::MD5 => "MD5",
            Self::SHA1 => "SHA1",
            Self::SHA256 => "SHA256",
        }
    }
}

impl std::str::FromStr for HashAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "").as_str() {
            "md5" => Ok(Self::MD5),
            "sha1" => Ok(Self::SHA1),
            "sha256" => Ok(Self::SHA256),
            other => Err(format!("unsupported hash algorithm '{}'", other)),
        }
    }
}

/// Hex digests of one extracted stream
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionHashes {
    pub sha256: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha1: Option<String>,
}

impl ExtractionHashes {
    pub fn get(&self, algorithm: HashAlgorithm) -> Option<&str> {
        match algorithm {
            HashAlgorithm::SHA256 => Some(&self.sha256),
            HashAlgorithm::MD5 => self.md5.as_deref(),
            HashAlgorithm::SHA1 => self.sha1.as_deref(),
        }
    }
}

/// Write adapter that hashes everything passing through it
pub struct HashingWriter<W: Write> {
    inner: W,
    sha256: Sha256,
    md5: Option<md5::Context>,
    sha1: Option<Sha1>,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    /// SHA-256 is always computed; `extra` adds MD5 and/or SHA-1
    pub fn new(inner: W, extra: &[HashAlgorithm]) -> Self {
        Self {
            inner,
            sha256: Sha256::new(),
            md5: extra.contains(&HashAlgorithm::MD5).then(md5::Context::new),
            sha1: extra.contains(&HashAlgorithm::SHA1).then(Sha1::new),
            written: 0,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    pub fn finish(self) -> (W, ExtractionHashes) {
        let hashes = ExtractionHashes {
            sha256: format!("{:x}", self.sha256.finalize()),
            md5: self.md5.map(|ctx| format!("{:x}", ctx.compute())),
            sha1: self.sha1.map(|h| format!("{:x}", h.finalize())),
        };
        (self.inner, hashes)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        let accepted = &buf[..n];
        self.sha256.update(accepted);
        if let Some(ctx) = self.md5.as_mut() {
            ctx.consume(accepted);
        }
        if let Some(h) = self.sha1.as_mut() {
            h.update(accepted);
        }
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Hash an in-memory buffer
pub fn calculate_hash(data: &[u8], algorithm: HashAlgorithm) -> String {
    match algorithm {
        HashAlgorithm::MD5 => format!("{:x}", md5::compute(data)),
        HashAlgorithm::SHA1 => format!("{:x}", Sha1::digest(data)),
        HashAlgorithm::SHA256 => format!("{:x}", Sha256::digest(data)),
    }
}

/// Hash a file on disk in 8 KiB chunks
pub fn calculate_file_hash(path: impl AsRef<Path>, algorithm: HashAlgorithm) -> io::Result<String> {
    let mut file = File::open(path.as_ref())?;
    let mut writer = HashingWriter::new(io::sink(), &[algorithm]);
    let mut buffer = vec![0; 8192];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buffer[..n])?;
    }
    let (_, hashes) = writer.finish();
    Ok(hashes.get(algorithm).unwrap_or_default().to_string())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum VerificationStatus {
    Verified,
    Mismatch,
}

/// Re-hash a written file and compare with the digest recorded at extraction
pub fn verify_file_integrity(
    path: impl AsRef<Path>,
    expected: &str,
    algorithm: HashAlgorithm,
) -> io::Result<VerificationStatus> {
    let actual = calculate_file_hash(path, algorithm)?;
    Ok(if actual.eq_ignore_ascii_case(expected) {
        VerificationStatus::Verified
    } else {
        VerificationStatus::Mismatch
    })
}

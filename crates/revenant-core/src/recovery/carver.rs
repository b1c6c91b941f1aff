//! Signature carving over raw units of a block source.
//!
//! The medium is split into batches of scan units (clusters, or sectors when
//! sector alignment is requested). Batches are scanned in parallel and each
//! returns its own hit list; hits are merged and sorted by offset before
//! length estimation. Each unit's leading bytes are compared against the
//! enabled signatures only, so restricting categories shrinks scan cost.
//!
//! Length estimation per hit, first rule that yields a value:
//! 1. the format's internal size fields (`SizeRule::Internal`)
//! 2. the footer, searched up to the next header or the size cap
//! 3. the next header match
//! 4. the end of the medium
//!
//! The result is always clamped to the signature's `max_size`.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::fs::common::BlockSource;
use crate::recovery::{
    clusters::ClusterMap,
    confidence::{classify, ClusterAssessment, ScoreInputs},
    engine::ScanContext,
    progress::{PassReport, ScanStage},
    signatures::{FileSignature, SignatureCatalog, SizeRule},
};
use crate::{DeletedFileEntry, EntrySource, FileEntry};

/// Largest window handed to an internal size parser
const PARSE_WINDOW: u64 = 32 * 1024 * 1024;
/// Chunk size for footer searches
const FOOTER_CHUNK: u64 = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CarveOptions {
    /// Probe every sector instead of every cluster
    pub sector_aligned: bool,
    pub sector_size: u32,
    /// Global cap on estimated lengths; 0 keeps the per-format caps
    pub max_carve_length: u64,
    /// Skip clusters owned by live records
    pub skip_attributed_clusters: bool,
    /// Scan units per parallel batch
    pub batch_units: u64,
}

impl Default for CarveOptions {
    fn default() -> Self {
        Self {
            sector_aligned: false,
            sector_size: 512,
            max_carve_length: 0,
            skip_attributed_clusters: true,
            batch_units: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Hit {
    offset: u64,
    signature: usize,
}

pub struct Carver<'a> {
    source: &'a dyn BlockSource,
    cluster_size: u32,
    catalog: SignatureCatalog,
    cluster_map: Option<&'a ClusterMap>,
    first_byte_index: Vec<Vec<usize>>,
    offset_signatures: Vec<usize>,
    probe_len: usize,
}

impl<'a> Carver<'a> {
    pub fn new(source: &'a dyn BlockSource, cluster_size: u32, catalog: SignatureCatalog) -> Self {
        let mut first_byte_index = vec![Vec::new(); 256];
        let mut offset_signatures = Vec::new();
        for (index, sig) in catalog.signatures().iter().enumerate() {
            match (sig.header_offset, sig.header.first()) {
                (0, Some(&first)) => first_byte_index[first as usize].push(index),
                _ => offset_signatures.push(index),
            }
        }
        let probe_len = catalog.max_probe_len();

        Self {
            source,
            cluster_size: cluster_size.max(1),
            catalog,
            cluster_map: None,
            first_byte_index,
            offset_signatures,
            probe_len,
        }
    }

    /// Consult `map` for attributed and bad clusters
    pub fn with_cluster_map(mut self, map: &'a ClusterMap) -> Self {
        self.cluster_map = Some(map);
        self
    }

    pub fn catalog(&self) -> &SignatureCatalog {
        &self.catalog
    }

    /// Scan the whole source. Partial results survive cancellation.
    pub fn scan(&self, ctx: &ScanContext) -> PassReport<DeletedFileEntry> {
        let options = &ctx.config.carve;
        let unit_size = if options.sector_aligned {
            options.sector_size.max(1) as u64
        } else {
            self.cluster_size as u64
        };
        let total_units = self.source.size() / unit_size;
        let batch_units = options.batch_units.max(1);
        let batch_count = total_units.div_ceil(batch_units);

        if self.catalog.is_empty() || total_units == 0 {
            tracing::info!("Carve skipped: no enabled signatures or empty medium");
            return PassReport::empty();
        }

        tracing::info!(
            "Carving {} units of {} bytes with {} signatures ({} batches)",
            total_units,
            unit_size,
            self.catalog.len(),
            batch_count
        );

        let reporter = ctx.reporter(ScanStage::SignatureCarve, total_units);
        let batches: Vec<(Vec<Hit>, u64)> = (0..batch_count)
            .into_par_iter()
            .map(|batch| {
                if ctx.cancel.is_cancelled() {
                    return (Vec::new(), 0);
                }
                let first = batch * batch_units;
                let count = batch_units.min(total_units - first);
                let result = self.scan_batch(first, count, unit_size, options.skip_attributed_clusters);
                reporter.advance(count, result.0.len() as u64);
                result
            })
            .collect();
        reporter.finish();

        let mut skipped_units = 0;
        let mut hits = Vec::new();
        for (batch_hits, skipped) in batches {
            hits.extend(batch_hits);
            skipped_units += skipped;
        }
        hits.sort_by_key(|h| h.offset);

        let mut entries = Vec::with_capacity(hits.len());
        for (i, hit) in hits.iter().enumerate() {
            if ctx.cancel.is_cancelled() {
                break;
            }
            let next_header = hits.get(i + 1).map(|h| h.offset);
            entries.push(self.build_entry(*hit, next_header, ctx));
        }

        let cancelled = ctx.cancel.is_cancelled();
        tracing::info!(
            "Carve finished: {} candidates, {} unreadable units{}",
            entries.len(),
            skipped_units,
            if cancelled { " (cancelled)" } else { "" }
        );
        PassReport::new(entries, skipped_units, cancelled)
    }

    /// One contiguous read per batch; a failing batch is retried unit by
    /// unit so a single bad sector only costs its own unit.
    fn scan_batch(&self, first: u64, count: u64, unit_size: u64, skip_attributed: bool) -> (Vec<Hit>, u64) {
        let offset = first * unit_size;
        let len = (count * unit_size).min(self.source.size() - offset) as usize;
        let mut hits = Vec::new();

        match self.source.read_at(offset, len) {
            Ok(buffer) => {
                for unit in 0..count {
                    let start = (unit * unit_size) as usize;
                    self.probe(&buffer[start..], offset + start as u64, skip_attributed, &mut hits);
                }
                (hits, 0)
            }
            Err(e) => {
                tracing::debug!("Batch at {:#x} unreadable ({}), retrying per unit", offset, e);
                let mut skipped = 0;
                for unit in first..first + count {
                    match self.source.read_at(unit * unit_size, unit_size as usize) {
                        Ok(buffer) => self.probe(&buffer, unit * unit_size, skip_attributed, &mut hits),
                        Err(_) => skipped += 1,
                    }
                }
                (hits, skipped)
            }
        }
    }

    fn probe(&self, data: &[u8], offset: u64, skip_attributed: bool, hits: &mut Vec<Hit>) {
        if skip_attributed {
            if let Some(map) = self.cluster_map {
                if map.is_attributed(offset / self.cluster_size as u64) {
                    return;
                }
            }
        }
        let window = &data[..data.len().min(self.probe_len)];
        let Some(&first) = window.first() else {
            return;
        };

        // Lowest catalog index wins, matching declaration order
        let signatures = self.catalog.signatures();
        let best = self.first_byte_index[first as usize]
            .iter()
            .chain(self.offset_signatures.iter())
            .copied()
            .filter(|&i| signatures[i].matches(window))
            .min();

        if let Some(signature) = best {
            hits.push(Hit { offset, signature });
        }
    }

    fn build_entry(&self, hit: Hit, next_header: Option<u64>, ctx: &ScanContext) -> DeletedFileEntry {
        let sig = &self.catalog.signatures()[hit.signature];
        let length = self.estimate_length(hit.offset, sig, next_header, ctx.config.carve.max_carve_length);
        let cs = self.cluster_size as u64;
        let first_cluster = hit.offset / cs;
        let last_cluster = (hit.offset + length.max(1) - 1) / cs;

        let touches_bad_sector = ctx.bad_clusters.range(first_cluster..=last_cluster).next().is_some()
            || self.cluster_map.map_or(false, |m| {
                m.bad_clusters().range(first_cluster..=last_cluster).next().is_some()
            });
        let policy = &ctx.config.scoring;
        let breakdown = policy.score(&ScoreInputs {
            has_data: true,
            has_standard_information: false,
            has_file_name: false,
            run_count: 1,
            touches_bad_sector,
            ..Default::default()
        });
        let assessment = ClusterAssessment {
            touches_bad_sector,
            overwritten_by: None,
        };
        let (recovery_status, recovery_probability) = classify(policy, breakdown.score, 1, &assessment);

        let name = format!("carved_{:010x}.{}", hit.offset, sig.extension);
        DeletedFileEntry {
            id: hit.offset,
            file: FileEntry {
                path: format!("/$Carved/{}", name),
                size: length,
                ..FileEntry::named(name)
            },
            is_deleted: true,
            recovery_status,
            recovery_probability,
            fragmented_clusters: vec![first_cluster],
            sparse_gaps: Vec::new(),
            resident_data: None,
            signature_type: Some(sig.format_id.to_string()),
            source: EntrySource::Carved {
                start_offset: hit.offset,
                estimated_length: length,
            },
            run_count: 1,
        }
    }

    fn estimate_length(&self, offset: u64, sig: &FileSignature, next_header: Option<u64>, global_cap: u64) -> u64 {
        let medium_left = self.source.size().saturating_sub(offset);
        let mut cap = sig.max_size.min(medium_left);
        if global_cap > 0 {
            cap = cap.min(global_cap);
        }
        let to_next = next_header.map_or(medium_left, |n| n.saturating_sub(offset)).min(cap);

        if let SizeRule::Internal(parse) = sig.size_rule {
            let window = cap.min(PARSE_WINDOW) as usize;
            match self.source.read_at(offset, window) {
                Ok(data) => {
                    if let Some(size) = parse(&data).filter(|s| *s > 0) {
                        return size.min(cap);
                    }
                }
                Err(e) => tracing::debug!("Size parse read at {:#x} failed: {}", offset, e),
            }
        }

        if let Some(footer) = sig.footer {
            if let Some(end) = self.find_footer(offset, to_next, footer) {
                return end;
            }
        }

        to_next.max(1).min(cap.max(1))
    }

    /// Length up to and including the first footer within `limit` bytes
    fn find_footer(&self, offset: u64, limit: u64, footer: &[u8]) -> Option<u64> {
        let overlap = footer.len().saturating_sub(1) as u64;
        let mut pos = 0u64;
        while pos < limit {
            let len = FOOTER_CHUNK.min(limit - pos);
            let chunk = self.source.read_at(offset + pos, len as usize).ok()?;
            if let Some(i) = chunk.windows(footer.len()).position(|w| w == footer) {
                return Some(pos + (i + footer.len()) as u64);
            }
            if pos + len >= limit {
                break;
            }
            pos += len.saturating_sub(overlap).max(1);
        }
        None
    }
}

/// Drop carved duplicates: repeated start offsets first, then entries whose
/// estimated extent matches an earlier one in length and CRC-32.
pub fn dedup_carved(
    entries: Vec<DeletedFileEntry>,
    source: &dyn BlockSource,
    cluster_size: u32,
) -> Vec<DeletedFileEntry> {
    let mut offsets = HashSet::new();
    let mut fingerprints = HashSet::new();
    let before = entries.len();

    let kept: Vec<_> = entries
        .into_iter()
        .filter(|entry| {
            let EntrySource::Carved {
                start_offset,
                estimated_length,
            } = entry.source
            else {
                return true;
            };
            if !offsets.insert(start_offset) {
                return false;
            }
            match extent_crc(source, start_offset, estimated_length, cluster_size) {
                Some(crc) => fingerprints.insert((estimated_length, crc)),
                None => true,
            }
        })
        .collect();

    if kept.len() != before {
        tracing::debug!("Dropped {} duplicate carved entries", before - kept.len());
    }
    kept
}

/// CRC-32 of `length` bytes from `offset`, read in chunks; `None` on any
/// read failure
fn extent_crc(source: &dyn BlockSource, offset: u64, length: u64, cluster_size: u32) -> Option<u32> {
    let chunk = FOOTER_CHUNK.max(cluster_size as u64);
    let end = offset.checked_add(length)?;
    let mut hasher = crc32fast::Hasher::new();
    let mut pos = offset;
    while pos < end {
        let len = chunk.min(end - pos);
        hasher.update(&source.read_at(pos, len as usize).ok()?);
        pos += len;
    }
    Some(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::common::{FaultySource, MemorySource};
    use crate::recovery::engine::RecoveryConfig;
    use crate::recovery::signatures::SignatureCategory;
    use crate::RecoveryStatus;

    const CS: u32 = 4096;

    fn png_bytes() -> Vec<u8> {
        let mut png = b"\x89PNG\r\n\x1a\n".to_vec();
        png.extend_from_slice(&13u32.to_be_bytes());
        png.extend_from_slice(b"IHDR");
        png.extend_from_slice(&[0; 13 + 4]);
        png.extend_from_slice(&0u32.to_be_bytes());
        png.extend_from_slice(b"IEND");
        png.extend_from_slice(&[0xAE, 0x42, 0x60, 0x82]);
        png
    }

    fn medium(placements: &[(u64, &[u8])], clusters: u64) -> MemorySource {
        let mut data = vec![0u8; (clusters * CS as u64) as usize];
        for (cluster, bytes) in placements {
            let start = (*cluster * CS as u64) as usize;
            data[start..start + bytes.len()].copy_from_slice(bytes);
        }
        MemorySource::new(data)
    }

    fn stored_zip(name: &[u8], body: &[u8]) -> Vec<u8> {
        let mut zip = b"PK\x03\x04".to_vec();
        zip.extend_from_slice(&[0u8; 22]);
        zip.extend_from_slice(&(name.len() as u16).to_le_bytes());
        zip.extend_from_slice(&0u16.to_le_bytes());
        zip.extend_from_slice(name);
        zip.extend_from_slice(body);
        let cd_offset = zip.len() as u32;
        zip.extend_from_slice(b"PK\x01\x02");
        zip.extend_from_slice(&[0u8; 24]);
        zip.extend_from_slice(&(name.len() as u16).to_le_bytes());
        zip.extend_from_slice(&[0u8; 16]);
        zip.extend_from_slice(name);
        let cd_size = zip.len() as u32 - cd_offset;
        zip.extend_from_slice(b"PK\x05\x06");
        zip.extend_from_slice(&[0, 0, 0, 0, 1, 0, 1, 0]);
        zip.extend_from_slice(&cd_size.to_le_bytes());
        zip.extend_from_slice(&cd_offset.to_le_bytes());
        zip.extend_from_slice(&0u16.to_le_bytes());
        zip
    }

    fn context(categories: Vec<SignatureCategory>) -> ScanContext {
        ScanContext::new(RecoveryConfig {
            categories,
            ..Default::default()
        })
    }

    #[test]
    fn test_category_restriction_only_emits_images() {
        let png = png_bytes();
        let source = medium(&[(50, &png), (80, b"ID3\x04\x00\x00")], 128);
        let ctx = context(vec![SignatureCategory::Images]);
        let carver = Carver::new(&source, CS, ctx.config.carve_catalog());

        let report = carver.scan(&ctx);
        assert_eq!(report.items.len(), 1);
        let entry = &report.items[0];
        assert_eq!(entry.signature_type.as_deref(), Some("PNG"));
        assert_eq!(entry.fragmented_clusters, vec![50]);
        assert_eq!(entry.file.size, png.len() as u64);
        assert_eq!(entry.recovery_status, RecoveryStatus::Recoverable);
        assert!((entry.recovery_probability - 0.56).abs() < 1e-6);
    }

    #[test]
    fn test_unrestricted_scan_finds_both() {
        let png = png_bytes();
        let source = medium(&[(50, &png), (80, b"ID3\x04\x00\x00")], 128);
        let ctx = context(Vec::new());
        let carver = Carver::new(&source, CS, ctx.config.carve_catalog());

        let ids: Vec<_> = carver
            .scan(&ctx)
            .items
            .iter()
            .map(|e| e.signature_type.clone().unwrap_or_default())
            .collect();
        assert_eq!(ids, vec!["PNG", "MP3"]);
    }

    #[test]
    fn test_footer_and_next_header_estimation() {
        let mut jpeg = vec![0xFF, 0xD8, 0xFF, 0xE0];
        jpeg.extend_from_slice(&[0x11; 5000]);
        jpeg.extend_from_slice(&[0xFF, 0xD9]);
        let source = medium(&[(2, &jpeg), (10, b"ID3\x03"), (14, b"%PDF-1.4")], 16);
        let ctx = context(Vec::new());
        let carver = Carver::new(&source, CS, ctx.config.carve_catalog());
        let items = carver.scan(&ctx).items;

        assert_eq!(items[0].file.size, jpeg.len() as u64);
        // MP3 has no terminator: runs to the PDF header
        assert_eq!(items[1].file.size, 4 * CS as u64);
        // PDF without %%EOF runs to the medium end
        assert_eq!(items[2].file.size, 2 * CS as u64);
    }

    #[test]
    fn test_skips_attributed_and_survives_bad_batches() {
        let png = png_bytes();
        let inner = medium(&[(3, &png), (9, &png)], 32).into_shared();
        let source = FaultySource::with_bad_clusters(inner, &[20], CS);
        let mut map = ClusterMap::new(32);
        map.insert_run(3, 1, 70);

        let mut ctx = context(Vec::new());
        ctx.config.carve.batch_units = 8;
        let carver = Carver::new(&source, CS, ctx.config.carve_catalog()).with_cluster_map(&map);
        let report = carver.scan(&ctx);

        assert_eq!(report.items.len(), 1);
        assert_eq!(report.items[0].fragmented_clusters, vec![9]);
        assert_eq!(report.skipped_units, 1);
        assert!(!report.cancelled);
    }

    #[test]
    fn test_cancelled_scan_returns_partial_report() {
        let source = medium(&[(1, &png_bytes())], 64);
        let ctx = context(Vec::new());
        ctx.cancel.cancel();
        let carver = Carver::new(&source, CS, ctx.config.carve_catalog());
        let report = carver.scan(&ctx);
        assert!(report.cancelled);
        assert!(report.items.is_empty());
    }

    #[test]
    fn test_dedup_by_offset_and_fingerprint() {
        let png = png_bytes();
        let source = medium(&[(1, &png), (5, &png)], 8);
        let ctx = context(Vec::new());
        let carver = Carver::new(&source, CS, ctx.config.carve_catalog());
        let mut items = carver.scan(&ctx).items;
        assert_eq!(items.len(), 2);
        items.push(items[0].clone());

        let kept = dedup_carved(items, &source, CS);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].fragmented_clusters, vec![1]);
    }

    #[test]
    fn test_dedup_keeps_distinct_files_sharing_a_first_cluster() {
        let jpeg_with_tail = |fill: u8| {
            let mut jpeg = vec![0xFF, 0xD8, 0xFF, 0xE0];
            jpeg.resize(CS as usize, 0x11);
            jpeg.extend_from_slice(&[fill; 100]);
            jpeg.extend_from_slice(&[0xFF, 0xD9]);
            jpeg
        };
        let (a, b) = (jpeg_with_tail(0xAA), jpeg_with_tail(0xBB));
        let source = medium(&[(1, &a), (4, &b)], 8);
        let ctx = context(vec![SignatureCategory::Images]);
        let carver = Carver::new(&source, CS, ctx.config.carve_catalog());
        let items = carver.scan(&ctx).items;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].file.size, items[1].file.size);

        let kept = dedup_carved(items, &source, CS);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn test_adjacent_archives_are_measured_separately() {
        let zip = stored_zip(b"notes.txt", b"quarterly numbers");
        let source = medium(&[(1, &zip), (3, &zip)], 8);
        let ctx = context(Vec::new());
        let carver = Carver::new(&source, CS, ctx.config.carve_catalog());
        let items = carver.scan(&ctx).items;

        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|e| e.signature_type.as_deref() == Some("ZIP")));
        assert!(items.iter().all(|e| e.file.size == zip.len() as u64));
    }
}

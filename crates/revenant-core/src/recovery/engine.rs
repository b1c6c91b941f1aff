/// Deleted-entry recovery: eligibility, cluster assembly, signature probe,
/// probability scoring, status classification and extraction.
use anyhow::Context;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::Write;
use std::path::Path;

use crate::error::{FsError, FsResult};
use crate::fs::common::BlockSource;
use crate::fs::ntfs::record::MftRecord;
use crate::fs::ntfs::runs::DataRun;
use crate::recovery::{
    badsector::BadSectorOptions,
    carver::CarveOptions,
    clusters::ClusterMap,
    confidence::{assess_clusters, classify, ScoreInputs, ScoringPolicy},
    progress::{CancellationToken, PassReport, ProgressReporter, ProgressSink, ScanStage},
    signatures::{SignatureCatalog, SignatureCategory},
    verify::{ExtractionHashes, HashAlgorithm, HashingWriter},
};
use crate::{DeletedFileEntry, EntrySource, FileEntry, RecoveryStatus, ScanMode, SparseGap};

/// Recovery engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub scan_mode: ScanMode,
    /// Carve only these categories; empty means all
    pub categories: Vec<SignatureCategory>,
    /// Entries below this probability are dropped from session output
    pub min_probability: f32,
    /// Worker threads for batch passes; `None` uses every core
    pub workers: Option<usize>,
    /// Units between progress callbacks
    pub progress_interval: u64,
    /// Fallback MFT record limit when record 0 cannot describe the MFT
    pub max_mft_records: u64,
    /// Sweep for bad sectors before scoring so affected entries are
    /// classified against the findings
    pub sweep_bad_sectors: bool,
    pub carve: CarveOptions,
    pub bad_sectors: BadSectorOptions,
    pub scoring: ScoringPolicy,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            scan_mode: ScanMode::Combined,
            categories: Vec::new(),
            min_probability: 0.0,
            workers: None,
            progress_interval: 1024,
            max_mft_records: 1 << 20,
            sweep_bad_sectors: false,
            carve: CarveOptions::default(),
            bad_sectors: BadSectorOptions::default(),
            scoring: ScoringPolicy::default(),
        }
    }
}

impl RecoveryConfig {
    /// Load from a JSON file; missing fields keep their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    /// Carving catalog restricted to the configured categories
    pub fn carve_catalog(&self) -> SignatureCatalog {
        SignatureCatalog::builtin().restricted_to(&self.categories)
    }
}

/// Everything a batch pass needs besides the filesystem itself
#[derive(Clone, Default)]
pub struct ScanContext {
    pub config: RecoveryConfig,
    pub cancel: CancellationToken,
    pub progress: Option<ProgressSink>,
    /// Clusters known to be unreadable from an earlier sweep
    pub bad_clusters: BTreeSet<u64>,
}

impl ScanContext {
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub fn with_progress(mut self, sink: ProgressSink) -> Self {
        self.progress = Some(sink);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_bad_clusters(mut self, clusters: impl IntoIterator<Item = u64>) -> Self {
        self.bad_clusters.extend(clusters);
        self
    }

    pub fn reporter(&self, stage: ScanStage, total_units: u64) -> ProgressReporter {
        ProgressReporter::new(
            self.progress.clone(),
            stage,
            total_units,
            self.config.progress_interval,
        )
    }
}

/// Data stream of a candidate, as described by its metadata
#[derive(Debug, Clone, Default)]
pub struct CandidateData {
    pub runs: Vec<DataRun>,
    pub resident_data: Option<Vec<u8>>,
    pub compressed: bool,
    pub encrypted: bool,
}

/// Filesystem-neutral description of one deleted metadata entry
#[derive(Debug, Clone)]
pub struct RecoveryCandidate {
    pub id: u64,
    pub source: EntrySource,
    pub file: FileEntry,
    pub has_standard_information: bool,
    pub has_file_name: bool,
    pub data: Option<CandidateData>,
    /// Owner id in the cluster map, excluded from the overwrite check
    pub owner: Option<u64>,
}

impl RecoveryCandidate {
    /// Field extraction from a parsed MFT record. `parent_path` is the
    /// live directory the record's name pointed at, when still resolvable.
    pub fn from_mft(record: &MftRecord, parent_path: Option<&str>) -> Self {
        let attrs = &record.attributes;
        let name = record.name().unwrap_or("Unknown").to_string();
        let path = match parent_path {
            Some("/") => format!("/{}", name),
            Some(parent) => format!("{}/{}", parent, name),
            None => format!("/$Orphan/{}", name),
        };
        let si = attrs.standard_information.as_ref();
        let fname = attrs.file_name.as_ref();

        Self {
            id: record.record_number,
            source: EntrySource::Metadata {
                record_number: record.record_number,
            },
            file: FileEntry {
                name,
                path,
                size: record.size(),
                created: si.and_then(|s| s.created).or_else(|| fname.and_then(|f| f.created)),
                modified: si.and_then(|s| s.modified).or_else(|| fname.and_then(|f| f.modified)),
                accessed: si.and_then(|s| s.accessed),
                attributes: si.map_or(0, |s| s.dos_flags),
            },
            has_standard_information: si.is_some(),
            has_file_name: fname.is_some(),
            data: record.data().map(|d| CandidateData {
                runs: d.runs.clone(),
                resident_data: d.resident_data.clone(),
                compressed: d.compressed,
                encrypted: d.encrypted,
            }),
            owner: Some(record.record_number),
        }
    }
}

/// Scores deleted candidates against a cluster map and signature catalog
pub struct RecoveryEngine<'a> {
    source: &'a dyn BlockSource,
    cluster_size: u32,
    policy: &'a ScoringPolicy,
    catalog: &'a SignatureCatalog,
    cluster_map: &'a ClusterMap,
}

impl<'a> RecoveryEngine<'a> {
    pub fn new(
        source: &'a dyn BlockSource,
        cluster_size: u32,
        policy: &'a ScoringPolicy,
        catalog: &'a SignatureCatalog,
        cluster_map: &'a ClusterMap,
    ) -> Self {
        Self {
            source,
            cluster_size,
            policy,
            catalog,
            cluster_map,
        }
    }

    /// Returns `None` for ineligible candidates: no data stream, or a
    /// compressed/encrypted one.
    pub fn evaluate(&self, candidate: RecoveryCandidate) -> Option<DeletedFileEntry> {
        let data = candidate.data?;
        if data.compressed || data.encrypted {
            return None;
        }

        let run_count = data.runs.iter().filter(|r| !r.is_sparse()).count();
        if data.resident_data.is_none() && !runs_within_volume(&data.runs, self.cluster_map.cluster_count()) {
            tracing::debug!("Entry {}: data runs reach past the volume", candidate.id);
            return Some(DeletedFileEntry {
                id: candidate.id,
                file: candidate.file,
                is_deleted: true,
                recovery_status: RecoveryStatus::Corrupted,
                recovery_probability: 0.0,
                fragmented_clusters: Vec::new(),
                sparse_gaps: Vec::new(),
                resident_data: None,
                signature_type: None,
                source: candidate.source,
                run_count,
            });
        }

        let (clusters, sparse_gaps) = assemble_clusters(&data.runs);

        let signature_type = match (&data.resident_data, clusters.first()) {
            (Some(inline), _) => self.catalog.match_header(inline),
            (None, Some(&first)) => match self.source.read_cluster(first, self.cluster_size) {
                Ok(bytes) => self.catalog.match_header(&bytes),
                Err(e) => {
                    tracing::debug!("Entry {}: first cluster {} unreadable: {}", candidate.id, first, e);
                    None
                }
            },
            (None, None) => None,
        }
        .map(|s| s.format_id.to_string());

        let assessment = assess_clusters(&clusters, self.cluster_map, candidate.owner);
        let breakdown = self.policy.score(&ScoreInputs {
            has_data: true,
            has_standard_information: candidate.has_standard_information,
            has_file_name: candidate.has_file_name,
            compressed: data.compressed,
            encrypted: data.encrypted,
            run_count,
            touches_bad_sector: assessment.touches_bad_sector,
        });
        let (recovery_status, recovery_probability) =
            classify(self.policy, breakdown.score, run_count, &assessment);

        Some(DeletedFileEntry {
            id: candidate.id,
            file: candidate.file,
            is_deleted: true,
            recovery_status,
            recovery_probability,
            fragmented_clusters: clusters,
            sparse_gaps,
            resident_data: data.resident_data,
            signature_type,
            source: candidate.source,
            run_count,
        })
    }

    /// Score candidates in parallel, observing cancellation per candidate
    pub fn evaluate_all(
        &self,
        candidates: Vec<RecoveryCandidate>,
        ctx: &ScanContext,
    ) -> PassReport<DeletedFileEntry> {
        let reporter = ctx.reporter(ScanStage::DeletedEntries, candidates.len() as u64);
        let cancel = &ctx.cancel;

        let mut items: Vec<DeletedFileEntry> = candidates
            .into_par_iter()
            .filter_map(|candidate| {
                if cancel.is_cancelled() {
                    return None;
                }
                let entry = self.evaluate(candidate);
                reporter.advance(1, entry.is_some() as u64);
                entry
            })
            .collect();
        reporter.finish();

        items.sort_by_key(|e| e.id);
        let cancelled = cancel.is_cancelled();
        if cancelled {
            tracing::warn!("Deleted-entry scoring cancelled after {} entries", items.len());
        }
        PassReport::new(items, 0, cancelled)
    }
}

/// True when every allocated run lies inside a volume of `cluster_count`
/// clusters and the allocated total fits the volume too
pub fn runs_within_volume(runs: &[DataRun], cluster_count: u64) -> bool {
    let mut allocated = 0u64;
    for run in runs {
        let Some(lcn) = run.start_cluster else { continue };
        match lcn.checked_add(run.length) {
            Some(end) if end <= cluster_count => allocated += run.length,
            _ => return false,
        }
        if allocated > cluster_count {
            return false;
        }
    }
    true
}

/// Expand runs into the allocated-cluster sequence plus the positions of
/// sparse stretches within it. Sparse runs stay as one gap each.
pub fn assemble_clusters(runs: &[DataRun]) -> (Vec<u64>, Vec<SparseGap>) {
    let mut clusters = Vec::new();
    let mut gaps: Vec<SparseGap> = Vec::new();
    let mut position = 0u64;
    for run in runs.iter().filter(|r| r.length > 0) {
        match run.start_cluster {
            Some(lcn) => clusters.extend(lcn..lcn.saturating_add(run.length)),
            None => match gaps.last_mut() {
                Some(gap) if gap.position + gap.length == position => gap.length += run.length,
                _ => gaps.push(SparseGap {
                    position,
                    length: run.length,
                }),
            },
        }
        position = position.saturating_add(run.length);
    }
    (clusters, gaps)
}

/// Result of writing one entry's content to a destination
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionOutcome {
    pub bytes_written: u64,
    /// Clusters that failed to read and were zero-filled
    pub unreadable_clusters: Vec<u64>,
    pub complete: bool,
    #[serde(flatten)]
    pub hashes: ExtractionHashes,
}

impl ExtractionOutcome {
    pub fn sha256(&self) -> &str {
        &self.hashes.sha256
    }
}

/// Write an entry's content to `dest` in recorded cluster order.
///
/// Unreadable clusters are zero-filled so later offsets stay aligned and
/// reported in the outcome; output is truncated to the entry size when known.
pub fn extract_entry(
    source: &dyn BlockSource,
    cluster_size: u32,
    entry: &DeletedFileEntry,
    dest: &mut dyn Write,
    extra_hashes: &[HashAlgorithm],
) -> FsResult<ExtractionOutcome> {
    let mut writer = HashingWriter::new(dest, extra_hashes);
    let cs = cluster_size.max(1) as u64;
    let mut unreadable = Vec::new();
    let target;

    if let Some(inline) = &entry.resident_data {
        let len = if entry.file.size > 0 {
            (entry.file.size as usize).min(inline.len())
        } else {
            inline.len()
        };
        target = len as u64;
        write_all(&mut writer, &inline[..len])?;
    } else if let EntrySource::Carved {
        start_offset,
        estimated_length,
    } = entry.source
    {
        target = estimated_length.min(source.size().saturating_sub(start_offset));
        let mut offset = start_offset;
        let end = start_offset + target;
        while offset < end {
            let chunk = (end - offset).min(cs - offset % cs) as usize;
            match source.read_at(offset, chunk) {
                Ok(bytes) => write_all(&mut writer, &bytes)?,
                Err(e) if e.is_read_failure() => {
                    unreadable.push(offset / cs);
                    write_all(&mut writer, &vec![0u8; chunk])?;
                }
                Err(e) => return Err(e),
            }
            offset += chunk as u64;
        }
    } else {
        target = if entry.file.size > 0 {
            entry.file.size
        } else {
            let gap_slots = entry.sparse_gaps.iter().fold(0u64, |n, g| n.saturating_add(g.length));
            (entry.fragmented_clusters.len() as u64)
                .saturating_add(gap_slots)
                .saturating_mul(cs)
        };
        let zeros = vec![0u8; cs as usize];
        for slot in entry.cluster_slots() {
            let remaining = target - writer.bytes_written();
            if remaining == 0 {
                break;
            }
            let take = remaining.min(cs) as usize;
            match slot {
                Some(cluster) => match source.read_cluster(cluster, cluster_size) {
                    Ok(bytes) => write_all(&mut writer, &bytes[..take])?,
                    Err(e) if e.is_read_failure() => {
                        tracing::debug!("Entry {}: cluster {} unreadable: {}", entry.id, cluster, e);
                        unreadable.push(cluster);
                        write_all(&mut writer, &zeros[..take])?;
                    }
                    Err(e) => return Err(e),
                },
                None => write_all(&mut writer, &zeros[..take])?,
            }
        }
    }

    writer
        .flush()
        .map_err(|source| FsError::Write {
            written: writer.bytes_written(),
            source,
        })?;
    let bytes_written = writer.bytes_written();
    let (_, hashes) = writer.finish();
    let complete = unreadable.is_empty() && bytes_written == target;

    if !complete {
        tracing::warn!(
            "Entry {} extracted partially: {}/{} bytes, {} unreadable clusters",
            entry.id,
            bytes_written,
            target,
            unreadable.len()
        );
    }

    Ok(ExtractionOutcome {
        bytes_written,
        unreadable_clusters: unreadable,
        complete,
        hashes,
    })
}

/// Extract to a new file at `path`
pub fn extract_to_path(
    source: &dyn BlockSource,
    cluster_size: u32,
    entry: &DeletedFileEntry,
    path: &Path,
    extra_hashes: &[HashAlgorithm],
) -> FsResult<ExtractionOutcome> {
    let file = std::fs::File::create(path).map_err(|e| FsError::destination(path, e))?;
    let mut out = std::io::BufWriter::new(file);
    extract_entry(source, cluster_size, entry, &mut out, extra_hashes).map_err(|e| match e {
        FsError::Write { source, .. } => FsError::destination(path, source),
        other => other,
    })
}

fn write_all<W: Write>(writer: &mut HashingWriter<W>, bytes: &[u8]) -> FsResult<()> {
    let at = writer.bytes_written();
    writer
        .write_all(bytes)
        .map_err(|source| FsError::Write { written: at, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::common::{FaultySource, MemorySource};
    use crate::RecoveryStatus;

    const CS: u32 = 4096;

    fn image_with(clusters: &[(u64, &[u8])], total_clusters: u64) -> MemorySource {
        let mut data = vec![0u8; (total_clusters * CS as u64) as usize];
        for (cluster, bytes) in clusters {
            let start = (*cluster * CS as u64) as usize;
            data[start..start + bytes.len()].copy_from_slice(bytes);
        }
        MemorySource::new(data)
    }

    fn candidate(runs: Vec<DataRun>, size: u64) -> RecoveryCandidate {
        RecoveryCandidate {
            id: 40,
            source: EntrySource::Metadata { record_number: 40 },
            file: FileEntry {
                size,
                ..FileEntry::named("photo.jpg".into())
            },
            has_standard_information: true,
            has_file_name: true,
            data: Some(CandidateData {
                runs,
                ..Default::default()
            }),
            owner: Some(40),
        }
    }

    #[test]
    fn test_fragmented_jpeg_scenario() {
        let source = image_with(&[(100, &[0xFF, 0xD8, 0xFF, 0xE0]), (205, &[0xAB; 16])], 256);
        let policy = ScoringPolicy::default();
        let catalog = SignatureCatalog::builtin();
        let map = ClusterMap::new(256);
        let engine = RecoveryEngine::new(&source, CS, &policy, &catalog, &map);

        let entry = engine
            .evaluate(candidate(vec![DataRun::new(100, 1), DataRun::new(205, 1)], 8192))
            .unwrap();
        assert_eq!(entry.signature_type.as_deref(), Some("JPEG"));
        assert_eq!(entry.recovery_status, RecoveryStatus::Fragmented);
        assert_eq!(entry.fragmented_clusters, vec![100, 205]);
        assert!((entry.recovery_probability - 0.9).abs() < 1e-6);

        let mut out = Vec::new();
        let outcome = extract_entry(&source, CS, &entry, &mut out, &[]).unwrap();
        assert!(outcome.complete);
        assert_eq!(out.len(), 8192);
        assert_eq!(&out[..4], &[0xFF, 0xD8, 0xFF, 0xE0]);
        assert_eq!(&out[4096..4112], &[0xAB; 16]);
    }

    #[test]
    fn test_ineligible_candidates_dropped() {
        let source = image_with(&[], 16);
        let policy = ScoringPolicy::default();
        let catalog = SignatureCatalog::builtin();
        let map = ClusterMap::new(16);
        let engine = RecoveryEngine::new(&source, CS, &policy, &catalog, &map);

        let mut no_data = candidate(vec![], 0);
        no_data.data = None;
        assert!(engine.evaluate(no_data).is_none());

        for (compressed, encrypted) in [(true, false), (false, true), (true, true)] {
            let mut c = candidate(vec![DataRun::new(2, 1)], 100);
            if let Some(d) = c.data.as_mut() {
                d.compressed = compressed;
                d.encrypted = encrypted;
            }
            assert!(engine.evaluate(c).is_none());
        }
    }

    #[test]
    fn test_overwritten_and_bad_clusters_force_zero() {
        let source = image_with(&[], 64);
        let policy = ScoringPolicy::default();
        let catalog = SignatureCatalog::builtin();
        let mut map = ClusterMap::new(64);
        map.insert_run(10, 2, 77);
        map.mark_bad(30);
        let engine = RecoveryEngine::new(&source, CS, &policy, &catalog, &map);

        let overwritten = engine.evaluate(candidate(vec![DataRun::new(10, 1)], 10)).unwrap();
        assert_eq!(overwritten.recovery_status, RecoveryStatus::Overwritten);
        assert_eq!(overwritten.recovery_probability, 0.0);

        let corrupted = engine.evaluate(candidate(vec![DataRun::new(29, 2)], 10)).unwrap();
        assert_eq!(corrupted.recovery_status, RecoveryStatus::Corrupted);
        assert_eq!(corrupted.recovery_probability, 0.0);
    }

    #[test]
    fn test_extraction_round_trip_single_run() {
        let content: Vec<u8> = (0..10_000u32).map(|i| (i * 7 % 256) as u8).collect();
        let mut image = vec![0u8; 16 * CS as usize];
        image[3 * CS as usize..3 * CS as usize + content.len()].copy_from_slice(&content);
        let source = MemorySource::new(image);
        let policy = ScoringPolicy::default();
        let catalog = SignatureCatalog::builtin();
        let map = ClusterMap::new(16);
        let engine = RecoveryEngine::new(&source, CS, &policy, &catalog, &map);

        let entry = engine
            .evaluate(candidate(vec![DataRun::new(3, 3)], content.len() as u64))
            .unwrap();
        assert_eq!(entry.recovery_status, RecoveryStatus::Recoverable);

        let mut out = Vec::new();
        let outcome = extract_entry(&source, CS, &entry, &mut out, &[HashAlgorithm::MD5]).unwrap();
        assert_eq!(out, content);
        assert!(outcome.complete);
        assert_eq!(outcome.hashes.md5.as_deref(), Some(format!("{:x}", md5::compute(&content)).as_str()));
    }

    #[test]
    fn test_unreadable_cluster_degrades_to_partial() {
        let inner = image_with(&[(4, &[1; 4096]), (5, &[2; 4096]), (6, &[3; 4096])], 8).into_shared();
        let source = FaultySource::with_bad_clusters(inner, &[5], CS);
        let policy = ScoringPolicy::default();
        let catalog = SignatureCatalog::builtin();
        let map = ClusterMap::new(8);
        let engine = RecoveryEngine::new(&source, CS, &policy, &catalog, &map);
        let entry = engine.evaluate(candidate(vec![DataRun::new(4, 3)], 3 * 4096)).unwrap();

        let mut out = Vec::new();
        let outcome = extract_entry(&source, CS, &entry, &mut out, &[]).unwrap();
        assert!(!outcome.complete);
        assert_eq!(outcome.unreadable_clusters, vec![5]);
        assert_eq!(out.len(), 3 * 4096);
        assert!(out[4096..8192].iter().all(|b| *b == 0));
        assert!(out[8192..].iter().all(|b| *b == 3));
    }

    #[test]
    fn test_sparse_runs_read_as_zeros() {
        let source = image_with(&[(2, &[9; 4096]), (7, &[8; 4096])], 8);
        let runs = vec![DataRun::new(2, 1), DataRun::sparse(2), DataRun::new(7, 1)];
        let (clusters, gaps) = assemble_clusters(&runs);
        assert_eq!(clusters, vec![2, 7]);
        assert_eq!(gaps, vec![SparseGap { position: 1, length: 2 }]);

        let policy = ScoringPolicy::default();
        let catalog = SignatureCatalog::builtin();
        let map = ClusterMap::new(8);
        let engine = RecoveryEngine::new(&source, CS, &policy, &catalog, &map);
        let entry = engine.evaluate(candidate(runs, 4 * 4096)).unwrap();

        let mut out = Vec::new();
        extract_entry(&source, CS, &entry, &mut out, &[]).unwrap();
        assert!(out[..4096].iter().all(|b| *b == 9));
        assert!(out[4096..3 * 4096].iter().all(|b| *b == 0));
        assert!(out[3 * 4096..].iter().all(|b| *b == 8));
    }

    #[test]
    fn test_runs_past_the_volume_are_corrupted_without_expansion() {
        let source = image_with(&[], 16);
        let policy = ScoringPolicy::default();
        let catalog = SignatureCatalog::builtin();
        let map = ClusterMap::new(16);
        let engine = RecoveryEngine::new(&source, CS, &policy, &catalog, &map);

        for runs in [
            vec![DataRun::new(10, 1 << 50)],
            vec![DataRun::new(u64::MAX - 1, 4)],
            vec![DataRun::new(2, 1), DataRun::new(16, 1)],
        ] {
            let entry = engine.evaluate(candidate(runs, 4096)).unwrap();
            assert_eq!(entry.recovery_status, RecoveryStatus::Corrupted);
            assert_eq!(entry.recovery_probability, 0.0);
            assert!(entry.fragmented_clusters.is_empty());
        }
    }

    #[test]
    fn test_huge_sparse_run_stays_one_gap() {
        let runs = vec![DataRun::new(3, 1), DataRun::sparse(1 << 50), DataRun::sparse(2), DataRun::new(5, 1)];
        let (clusters, gaps) = assemble_clusters(&runs);
        assert_eq!(clusters, vec![3, 5]);
        assert_eq!(
            gaps,
            vec![SparseGap {
                position: 1,
                length: (1 << 50) + 2
            }]
        );
    }

    #[test]
    fn test_destination_errors_name_the_path() {
        let source = image_with(&[(3, b"payload")], 8);
        let policy = ScoringPolicy::default();
        let catalog = SignatureCatalog::builtin();
        let map = ClusterMap::new(8);
        let engine = RecoveryEngine::new(&source, CS, &policy, &catalog, &map);
        let entry = engine.evaluate(candidate(vec![DataRun::new(3, 1)], 7)).unwrap();

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("missing").join("out.bin");
        let err = extract_to_path(&source, CS, &entry, &path, &[]).unwrap_err();
        assert!(matches!(&err, FsError::Destination { path: p, .. } if p == &path));
        assert!(!err.is_read_failure());
    }

    #[test]
    fn test_config_json_partial_override() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{ "categories": ["Images"], "scoring": { "encrypted": 0.1 } }"#,
        )
        .unwrap();

        let config = RecoveryConfig::from_json_file(&path).unwrap();
        assert_eq!(config.categories, vec![SignatureCategory::Images]);
        assert_eq!(config.scoring.encrypted, 0.1);
        assert_eq!(config.scoring.compressed, 0.6);
        assert_eq!(config.carve_catalog().get("MP3").map(|s| s.format_id), None);
    }
}

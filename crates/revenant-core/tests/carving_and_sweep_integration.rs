//! Signature carving and bad-sector sweeps over raw media

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use revenant_core::fs::common::{FaultySource, MemorySource, SharedSource};
use revenant_core::{
    open_filesystem, BadSectorKind, CancellationToken, EntrySource, FileSystem, FileSystemType, RecoveryConfig,
    ScanContext, ScanMode, ScanProgress, ScanSession, ScanStage, SignatureCategory,
};

const CS: u64 = 4096;

fn png() -> Vec<u8> {
    let mut png = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    png.extend_from_slice(&13u32.to_be_bytes());
    png.extend_from_slice(b"IHDR");
    png.extend_from_slice(&[0u8; 13 + 4]);
    png.extend_from_slice(&0u32.to_be_bytes());
    png.extend_from_slice(b"IEND");
    png.extend_from_slice(&[0xAE, 0x42, 0x60, 0x82]);
    png
}

/// 128 clusters of zeros with a PNG at cluster 50 and an MP3 at cluster 80
fn medium() -> Vec<u8> {
    let mut data = vec![0u8; 128 * CS as usize];
    let png = png();
    let at = 50 * CS as usize;
    data[at..at + png.len()].copy_from_slice(&png);
    let at = 80 * CS as usize;
    data[at..at + 5].copy_from_slice(b"ID3\x04\x00");
    data
}

fn raw_session(source: SharedSource, config: RecoveryConfig) -> ScanSession {
    ScanSession::from_source(source, PathBuf::from("medium.img"), ScanContext::new(config)).unwrap()
}

#[test]
fn test_image_only_carve_emits_the_png_alone() {
    let config = RecoveryConfig {
        scan_mode: ScanMode::Deep,
        categories: vec![SignatureCategory::Images],
        ..Default::default()
    };
    let mut scan = raw_session(MemorySource::new(medium()).into_shared(), config);
    scan.run().unwrap();
    let session = scan.finish();

    assert_eq!(session.fs_type, FileSystemType::Raw);
    assert_eq!(session.entries.len(), 1);
    let entry = &session.entries[0];
    assert_eq!(entry.signature_type.as_deref(), Some("PNG"));
    assert_eq!(entry.fragmented_clusters.first(), Some(&50));
    match entry.source {
        EntrySource::Carved {
            start_offset,
            estimated_length,
        } => {
            assert_eq!(start_offset, 50 * CS);
            assert_eq!(estimated_length, png().len() as u64);
        }
        other => panic!("expected a carved entry, got {:?}", other),
    }
}

#[test]
fn test_unrestricted_carve_finds_both_formats() {
    let config = RecoveryConfig {
        scan_mode: ScanMode::Combined,
        ..Default::default()
    };
    let mut scan = raw_session(MemorySource::new(medium()).into_shared(), config);
    scan.run().unwrap();
    let session = scan.finish();

    let formats: Vec<_> = session
        .entries
        .iter()
        .filter_map(|e| e.signature_type.as_deref())
        .collect();
    assert_eq!(formats, vec!["PNG", "MP3"]);
    assert_eq!(session.entries[0].id, 1);
    assert_eq!(session.entries[1].id, 2);
}

#[test]
fn test_carved_content_extracts_from_raw_medium() {
    let config = RecoveryConfig {
        scan_mode: ScanMode::Deep,
        categories: vec![SignatureCategory::Images],
        ..Default::default()
    };
    let source = MemorySource::new(medium()).into_shared();
    let fs = open_filesystem(source, &ScanContext::new(config.clone())).unwrap();
    let entries = fs.scan_deleted(&ScanContext::new(config)).unwrap().items;

    let mut out = Vec::new();
    assert!(fs.recover_file(&entries[0], &mut out).unwrap());
    assert_eq!(out, png());
}

#[test]
fn test_sweep_reports_faulty_cluster_and_completes() {
    let bad = 12 * CS..12 * CS + 512;
    let source: SharedSource = Arc::new(FaultySource::new(
        MemorySource::new(medium()).into_shared(),
        vec![bad],
    ));
    let mut config = RecoveryConfig::default();
    config.bad_sectors.retry_delay_ms = 0;
    let ctx = ScanContext::new(config);

    let fs = open_filesystem(source, &ctx).unwrap();
    let report = fs.scan_bad_sectors(&ctx).unwrap();

    assert!(!report.cancelled);
    assert_eq!(report.items.len(), 1);
    assert_eq!(report.items[0].cluster, 12);
    assert_eq!(report.items[0].kind, BadSectorKind::Unreadable);

    let health = fs.get_disk_health(None).unwrap();
    assert_eq!(health.bad_sector_count, 1);
    assert!(!health.is_healthy());
    assert_eq!(health.model, "unknown");
}

#[test]
fn test_progress_reaches_the_end_of_the_carve() {
    let events: Arc<Mutex<Vec<ScanProgress>>> = Arc::default();
    let sink_events = Arc::clone(&events);
    let config = RecoveryConfig {
        scan_mode: ScanMode::Deep,
        progress_interval: 16,
        ..Default::default()
    };
    let ctx = ScanContext::new(config).with_progress(Arc::new(move |p: ScanProgress| {
        sink_events.lock().unwrap().push(p);
    }));

    let mut scan =
        ScanSession::from_source(MemorySource::new(medium()).into_shared(), PathBuf::from("m.img"), ctx).unwrap();
    scan.run().unwrap();

    let events = events.lock().unwrap();
    let carve: Vec<_> = events.iter().filter(|p| p.stage == ScanStage::SignatureCarve).collect();
    assert!(carve.len() >= 2);
    let last = carve.last().unwrap();
    assert_eq!(last.scanned_units, last.total_units);
    assert!(carve.windows(2).all(|w| w[0].total_units == w[1].total_units));
}

#[test]
fn test_cancelled_scan_is_flagged() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let config = RecoveryConfig {
        scan_mode: ScanMode::Deep,
        ..Default::default()
    };
    let ctx = ScanContext::new(config).with_cancel(cancel);
    let mut scan =
        ScanSession::from_source(MemorySource::new(medium()).into_shared(), PathBuf::from("m.img"), ctx).unwrap();
    scan.run().unwrap();

    let session = scan.finish();
    assert!(session.cancelled);
    assert!(session.entries.len() <= 2);
}

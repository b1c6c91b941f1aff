/// Recovery passes: deleted-entry scoring, signature carving, bad-sector
/// sweeps, and the shared progress/cancellation plumbing they run on
pub mod badsector;
pub mod carver;
pub mod clusters;
pub mod confidence;
pub mod engine;
pub mod progress;
pub mod signatures;
pub mod verify;

pub use badsector::{BadSectorOptions, SectorSweeper};
pub use carver::{dedup_carved, CarveOptions, Carver};
pub use clusters::{ClusterInfo, ClusterMap};
pub use confidence::{ScoreBreakdown, ScoreFactor, ScoreInputs, ScoringPolicy};
pub use engine::{
    extract_entry, extract_to_path, ExtractionOutcome, RecoveryCandidate, RecoveryConfig,
    RecoveryEngine, ScanContext,
};
pub use progress::{CancellationToken, PassReport, ProgressSink, ScanProgress, ScanStage};
pub use signatures::{FileSignature, SignatureCatalog, SignatureCategory, SizeRule};
pub use verify::{ExtractionHashes, HashAlgorithm, VerificationStatus};

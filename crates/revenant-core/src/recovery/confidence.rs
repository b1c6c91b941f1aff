/// Recovery-probability scoring and status classification for deleted entries
use serde::{Deserialize, Serialize};

use crate::recovery::clusters::{ClusterInfo, ClusterMap};
use crate::RecoveryStatus;

/// Multipliers applied to a starting score of 1.0. Tunable heuristics,
/// loaded from config like any other setting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringPolicy {
    pub missing_standard_information: f32,
    pub missing_file_name: f32,
    pub compressed: f32,
    pub encrypted: f32,
    pub fragmented: f32,
    pub bad_sector: f32,
    pub recoverable_threshold: f32,
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            missing_standard_information: 0.7,
            missing_file_name: 0.8,
            compressed: 0.6,
            encrypted: 0.3,
            fragmented: 0.9,
            bad_sector: 0.5,
            recoverable_threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScoreFactor {
    MissingStandardInformation,
    MissingFileName,
    Compressed,
    Encrypted,
    Fragmented,
    BadSector,
}

/// What the scorer needs to know about a candidate
#[derive(Debug, Clone, Copy, Default)]
pub struct ScoreInputs {
    pub has_data: bool,
    pub has_standard_information: bool,
    pub has_file_name: bool,
    pub compressed: bool,
    pub encrypted: bool,
    pub run_count: usize,
    pub touches_bad_sector: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub applied: Vec<(ScoreFactor, f32)>,
    pub score: f32,
}

impl ScoringPolicy {
    pub fn score(&self, inputs: &ScoreInputs) -> ScoreBreakdown {
        if !inputs.has_data {
            return ScoreBreakdown {
                applied: Vec::new(),
                score: 0.0,
            };
        }

        let mut applied = Vec::new();
        let checks = [
            (!inputs.has_standard_information, ScoreFactor::MissingStandardInformation, self.missing_standard_information),
            (!inputs.has_file_name, ScoreFactor::MissingFileName, self.missing_file_name),
            (inputs.compressed, ScoreFactor::Compressed, self.compressed),
            (inputs.encrypted, ScoreFactor::Encrypted, self.encrypted),
            (inputs.run_count > 1, ScoreFactor::Fragmented, self.fragmented),
            (inputs.touches_bad_sector, ScoreFactor::BadSector, self.bad_sector),
        ];
        for (active, factor, weight) in checks {
            if active {
                applied.push((factor, weight));
            }
        }

        let score = applied
            .iter()
            .fold(1.0f32, |acc, (_, w)| acc * w.clamp(0.0, 1.0));

        ScoreBreakdown { applied, score }
    }
}

/// Where an entry's clusters stand against the current cluster map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClusterAssessment {
    pub touches_bad_sector: bool,
    pub overwritten_by: Option<u64>,
}

/// Check every cluster against the map. `own_record` is excluded from the
/// ownership test so a record never counts as overwriting itself.
pub fn assess_clusters(clusters: &[u64], map: &ClusterMap, own_record: Option<u64>) -> ClusterAssessment {
    let mut assessment = ClusterAssessment::default();
    for &cluster in clusters {
        match map.classify(cluster) {
            ClusterInfo::Bad => {
                assessment.touches_bad_sector = true;
                break;
            }
            ClusterInfo::Allocated(owner) if Some(owner) != own_record => {
                if assessment.overwritten_by.is_none() {
                    assessment.overwritten_by = Some(owner);
                }
            }
            _ => {}
        }
    }
    assessment
}

/// Map a score and cluster assessment to a final status. Statuses other
/// than Recoverable and Fragmented always carry probability 0, and a zero
/// score is never Recoverable or Fragmented.
pub fn classify(
    policy: &ScoringPolicy,
    score: f32,
    run_count: usize,
    clusters: &ClusterAssessment,
) -> (RecoveryStatus, f32) {
    let status = if clusters.touches_bad_sector {
        RecoveryStatus::Corrupted
    } else if clusters.overwritten_by.is_some() {
        RecoveryStatus::Overwritten
    } else if score <= 0.0 {
        RecoveryStatus::Corrupted
    } else if run_count > 1 {
        RecoveryStatus::Fragmented
    } else if score >= policy.recoverable_threshold {
        RecoveryStatus::Recoverable
    } else {
        RecoveryStatus::Corrupted
    };

    let probability = match status {
        RecoveryStatus::Recoverable | RecoveryStatus::Fragmented => score.clamp(0.0, 1.0),
        _ => 0.0,
    };
    (status, probability)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_inputs() -> ScoreInputs {
        ScoreInputs {
            has_data: true,
            has_standard_information: true,
            has_file_name: true,
            run_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_intact_record_scores_one() {
        let policy = ScoringPolicy::default();
        let breakdown = policy.score(&full_inputs());
        assert_eq!(breakdown.score, 1.0);
        assert!(breakdown.applied.is_empty());
    }

    #[test]
    fn test_multipliers_compose() {
        let policy = ScoringPolicy::default();
        let inputs = ScoreInputs {
            has_standard_information: false,
            has_file_name: false,
            run_count: 3,
            ..full_inputs()
        };
        let score = policy.score(&inputs).score;
        assert!((score - 0.7 * 0.8 * 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_no_data_scores_zero() {
        let policy = ScoringPolicy::default();
        let inputs = ScoreInputs {
            has_data: false,
            ..full_inputs()
        };
        assert_eq!(policy.score(&inputs).score, 0.0);
    }

    #[test]
    fn test_score_always_in_unit_range() {
        let policy = ScoringPolicy {
            fragmented: 1.7,
            ..Default::default()
        };
        for mask in 0u8..64 {
            let inputs = ScoreInputs {
                has_data: true,
                has_standard_information: mask & 1 == 0,
                has_file_name: mask & 2 == 0,
                compressed: mask & 4 != 0,
                encrypted: mask & 8 != 0,
                run_count: if mask & 16 != 0 { 2 } else { 1 },
                touches_bad_sector: mask & 32 != 0,
            };
            let score = policy.score(&inputs).score;
            assert!((0.0..=1.0).contains(&score), "score {} out of range", score);
        }
    }

    #[test]
    fn test_classification_order() {
        let policy = ScoringPolicy::default();
        let clean = ClusterAssessment::default();

        assert_eq!(classify(&policy, 0.9, 1, &clean), (RecoveryStatus::Recoverable, 0.9));
        assert_eq!(classify(&policy, 0.9, 2, &clean), (RecoveryStatus::Fragmented, 0.9));
        assert_eq!(classify(&policy, 0.4, 1, &clean), (RecoveryStatus::Corrupted, 0.0));

        let overwritten = ClusterAssessment {
            touches_bad_sector: false,
            overwritten_by: Some(77),
        };
        assert_eq!(classify(&policy, 0.9, 2, &overwritten), (RecoveryStatus::Overwritten, 0.0));

        let bad = ClusterAssessment {
            touches_bad_sector: true,
            overwritten_by: Some(77),
        };
        assert_eq!(classify(&policy, 0.9, 1, &bad), (RecoveryStatus::Corrupted, 0.0));
    }

    #[test]
    fn test_assess_ignores_own_clusters() {
        let mut map = ClusterMap::new(500);
        map.insert_run(100, 5, 40);
        map.insert_run(200, 1, 41);

        assert_eq!(assess_clusters(&[100, 101], &map, Some(40)), ClusterAssessment::default());
        assert_eq!(
            assess_clusters(&[100, 200], &map, Some(40)).overwritten_by,
            Some(41)
        );

        map.mark_bad(300);
        assert!(assess_clusters(&[299, 300], &map, None).touches_bad_sector);
    }

    #[test]
    fn test_zero_weights_never_yield_a_recoverable_status() {
        let policy = ScoringPolicy {
            missing_file_name: 0.0,
            recoverable_threshold: 0.0,
            ..Default::default()
        };
        let inputs = ScoreInputs {
            has_file_name: false,
            ..full_inputs()
        };
        let score = policy.score(&inputs).score;
        let clean = ClusterAssessment::default();
        assert_eq!(classify(&policy, score, 1, &clean), (RecoveryStatus::Corrupted, 0.0));
        assert_eq!(classify(&policy, score, 3, &clean), (RecoveryStatus::Corrupted, 0.0));
    }

    #[test]
    fn test_cross_linked_run_is_seen_as_overwrite() {
        let mut map = ClusterMap::new(500);
        map.insert_run(100, 50, 1);
        map.insert_run(120, 1, 2);
        assert_eq!(assess_clusters(&[130, 131], &map, Some(40)).overwritten_by, Some(1));
    }
}

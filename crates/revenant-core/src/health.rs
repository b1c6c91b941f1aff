/// Disk health view: externally supplied drive telemetry merged with the
/// bad-sector sweep's own findings
use serde::{Deserialize, Serialize};

use crate::{BadSectorInfo, BadSectorKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskHealthInfo {
    pub model: String,
    pub serial_number: String,
    /// Celsius
    pub temperature: Option<i32>,
    pub total_hours: Option<u64>,
    pub bad_sector_count: u64,
    pub reallocated_sectors: u64,
    /// Units the sweep could read only slowly
    #[serde(default)]
    pub slow_sector_count: u64,
}

impl Default for DiskHealthInfo {
    fn default() -> Self {
        Self {
            model: "unknown".into(),
            serial_number: "unknown".into(),
            temperature: None,
            total_hours: None,
            bad_sector_count: 0,
            reallocated_sectors: 0,
            slow_sector_count: 0,
        }
    }
}

impl DiskHealthInfo {
    /// Fold sweep findings into the telemetry view. Telemetry counts are
    /// kept when they are already higher than what the sweep saw.
    pub fn merge_bad_sectors(mut self, findings: &[BadSectorInfo]) -> Self {
        let mut unreadable = 0u64;
        let mut slow = 0u64;
        let mut reallocated = 0u64;
        for info in findings {
            match info.kind {
                BadSectorKind::Unreadable => unreadable += 1,
                BadSectorKind::SlowReadable => slow += 1,
                BadSectorKind::Reallocated => reallocated += 1,
            }
        }
        self.bad_sector_count = self.bad_sector_count.max(unreadable);
        self.slow_sector_count += slow;
        self.reallocated_sectors = self.reallocated_sectors.max(reallocated);
        self
    }

    pub fn is_healthy(&self) -> bool {
        self.bad_sector_count == 0 && self.reallocated_sectors == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_counts_by_kind() {
        let findings = vec![
            BadSectorInfo::unreadable(0, 512, 0, 3),
            BadSectorInfo::unreadable(4096, 512, 1, 3),
            BadSectorInfo {
                kind: BadSectorKind::SlowReadable,
                latency_ms: Some(900),
                ..BadSectorInfo::unreadable(8192, 512, 2, 1)
            },
        ];
        let health = DiskHealthInfo::default().merge_bad_sectors(&findings);
        assert_eq!(health.bad_sector_count, 2);
        assert_eq!(health.slow_sector_count, 1);
        assert!(!health.is_healthy());
        assert_eq!(health.model, "unknown");
    }

    #[test]
    fn test_telemetry_counts_are_not_lowered() {
        let telemetry = DiskHealthInfo {
            model: "WDC WD10EZEX".into(),
            serial_number: "WD-123".into(),
            temperature: Some(38),
            total_hours: Some(12000),
            bad_sector_count: 7,
            reallocated_sectors: 4,
            slow_sector_count: 0,
        };
        let merged = telemetry.merge_bad_sectors(&[BadSectorInfo::unreadable(0, 512, 0, 1)]);
        assert_eq!(merged.bad_sector_count, 7);
        assert_eq!(merged.reallocated_sectors, 4);
        assert_eq!(merged.temperature, Some(38));
    }
}

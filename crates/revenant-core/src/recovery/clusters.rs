//! Per-cluster classification shared by the recovery scorer and the carver.

use std::collections::{BTreeMap, BTreeSet};

use crate::{BadSectorInfo, BadSectorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterInfo {
    Free,
    /// Owned by the live record (or directory entry) with this number
    Allocated(u64),
    Bad,
}

/// Cluster ownership stored as runs, so a multi-terabyte volume costs one
/// entry per extent rather than one per cluster.
///
/// Runs may overlap (cross-linked chains, damaged run lists). A cluster
/// covered by several runs reports the owner of the run starting nearest
/// below it.
#[derive(Debug, Clone, Default)]
pub struct ClusterMap {
    cluster_count: u64,
    /// (start, owner) -> length
    runs: BTreeMap<(u64, u64), u64>,
    /// Longest run inserted, bounds the backward search in `owner_of`
    longest_run: u64,
    bad: BTreeSet<u64>,
}

impl ClusterMap {
    pub fn new(cluster_count: u64) -> Self {
        Self {
            cluster_count,
            ..Default::default()
        }
    }

    pub fn cluster_count(&self) -> u64 {
        self.cluster_count
    }

    /// Record that `length` clusters from `start` belong to `owner`.
    /// Zero-length runs are ignored.
    pub fn insert_run(&mut self, start: u64, length: u64, owner: u64) {
        if length == 0 {
            return;
        }
        let slot = self.runs.entry((start, owner)).or_insert(0);
        *slot = (*slot).max(length);
        self.longest_run = self.longest_run.max(length);
    }

    pub fn mark_bad(&mut self, cluster: u64) {
        self.bad.insert(cluster);
    }

    /// Fold a sweep's unreadable findings into the map. `cluster_size` is the
    /// map's allocation unit and `origin` the volume offset of cluster 0;
    /// every cluster a bad region touches is marked.
    pub fn merge_bad_sectors(&mut self, bad_sectors: &[BadSectorInfo], cluster_size: u32, origin: u64) {
        self.bad.extend(unreadable_clusters(bad_sectors, cluster_size, origin));
    }

    pub fn merge_bad_clusters(&mut self, clusters: impl IntoIterator<Item = u64>) {
        self.bad.extend(clusters);
    }

    pub fn owner_of(&self, cluster: u64) -> Option<u64> {
        self.runs
            .range(..=(cluster, u64::MAX))
            .rev()
            .take_while(|((start, _), _)| cluster - start < self.longest_run)
            .find(|((start, _), length)| cluster - start < **length)
            .map(|((_, owner), _)| *owner)
    }

    pub fn classify(&self, cluster: u64) -> ClusterInfo {
        if self.bad.contains(&cluster) {
            return ClusterInfo::Bad;
        }
        match self.owner_of(cluster) {
            Some(owner) => ClusterInfo::Allocated(owner),
            None => ClusterInfo::Free,
        }
    }

    pub fn is_bad(&self, cluster: u64) -> bool {
        self.bad.contains(&cluster)
    }

    pub fn is_attributed(&self, cluster: u64) -> bool {
        self.owner_of(cluster).is_some()
    }

    pub fn bad_clusters(&self) -> &BTreeSet<u64> {
        &self.bad
    }

    /// Distinct clusters covered by at least one run
    pub fn allocated_cluster_count(&self) -> u64 {
        let mut count = 0u64;
        let mut covered_to = 0u64;
        for (&(start, _), &length) in &self.runs {
            let end = start.saturating_add(length);
            if end > covered_to {
                count += end - start.max(covered_to);
                covered_to = end;
            }
        }
        count
    }
}

/// Clusters touched by the unreadable findings of a volume sweep, numbered
/// from the cluster region at `origin`. Findings before it (boot sector,
/// allocation tables) map to no cluster.
pub fn unreadable_clusters(bad_sectors: &[BadSectorInfo], cluster_size: u32, origin: u64) -> BTreeSet<u64> {
    let cs = cluster_size.max(1) as u64;
    bad_sectors
        .iter()
        .filter(|b| b.kind == BadSectorKind::Unreadable)
        .filter_map(|info| {
            let end = info.offset + info.length.max(1) as u64;
            if end <= origin {
                return None;
            }
            let first = info.offset.saturating_sub(origin) / cs;
            let last = (end - origin - 1) / cs;
            Some(first..=last)
        })
        .flatten()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_runs_and_bad_clusters() {
        let mut map = ClusterMap::new(1000);
        map.insert_run(100, 10, 42);
        map.insert_run(300, 1, 7);
        map.mark_bad(105);

        assert_eq!(map.classify(99), ClusterInfo::Free);
        assert_eq!(map.classify(100), ClusterInfo::Allocated(42));
        assert_eq!(map.classify(109), ClusterInfo::Allocated(42));
        assert_eq!(map.classify(110), ClusterInfo::Free);
        assert_eq!(map.classify(105), ClusterInfo::Bad);
        assert_eq!(map.classify(300), ClusterInfo::Allocated(7));
        assert_eq!(map.allocated_cluster_count(), 11);
    }

    #[test]
    fn test_overlapping_runs_keep_every_owner() {
        let mut map = ClusterMap::new(1000);
        map.insert_run(100, 50, 1);
        map.insert_run(120, 1, 2);
        map.insert_run(140, 5, 3);
        map.insert_run(140, 2, 4);

        assert_eq!(map.owner_of(110), Some(1));
        assert_eq!(map.owner_of(120), Some(2));
        assert_eq!(map.owner_of(130), Some(1));
        assert_eq!(map.owner_of(144), Some(3));
        assert_eq!(map.owner_of(141), Some(4));
        assert_eq!(map.owner_of(149), Some(1));
        assert_eq!(map.owner_of(150), None);
        assert_eq!(map.allocated_cluster_count(), 50);
    }

    #[test]
    fn test_merge_unreadable_sectors_only() {
        let mut map = ClusterMap::new(64);
        let sweep = vec![
            BadSectorInfo::unreadable(4096 * 12, 4096, 12, 3),
            BadSectorInfo {
                kind: BadSectorKind::SlowReadable,
                ..BadSectorInfo::unreadable(4096 * 20, 4096, 20, 1)
            },
        ];
        map.merge_bad_sectors(&sweep, 4096, 0);

        assert!(map.is_bad(12));
        assert!(!map.is_bad(20));
    }

    #[test]
    fn test_sector_sized_finding_marks_containing_cluster() {
        let mut map = ClusterMap::new(64);
        map.merge_bad_sectors(&[BadSectorInfo::unreadable(4096 * 3 + 512, 512, 0, 1)], 4096, 0);
        assert!(map.is_bad(3));
        assert!(!map.is_bad(4));
    }

    #[test]
    fn test_findings_before_the_cluster_origin_mark_nothing() {
        let origin = 3 * 512;
        let sweep = vec![
            BadSectorInfo::unreadable(512, 512, 0, 1),
            BadSectorInfo::unreadable(origin + 2 * 4096, 4096, 0, 1),
        ];
        let clusters = unreadable_clusters(&sweep, 4096, origin);
        assert_eq!(clusters.into_iter().collect::<Vec<_>>(), vec![2]);
    }
}

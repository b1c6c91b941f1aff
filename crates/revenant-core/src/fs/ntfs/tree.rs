//! Active directory tree rebuilt from `$FILE_NAME` parent references.

use std::collections::{HashMap, HashSet, VecDeque};

use super::record::MftRecord;
use crate::error::{FsError, FsResult};
use crate::{DirectoryEntry, FileEntry};

/// Record number of the root directory
pub const ROOT_RECORD: u64 = 5;

#[derive(Debug, Clone)]
struct TreeNode {
    entry: FileEntry,
    is_directory: bool,
    children: Vec<u64>,
}

/// Flattened view of in-use named records, keyed by record number.
/// `DirectoryEntry` values are materialized from it on demand.
#[derive(Debug, Clone, Default)]
pub struct DirectoryTree {
    nodes: HashMap<u64, TreeNode>,
    /// (parent, lower-cased name) -> record
    by_name: HashMap<(u64, String), u64>,
}

impl DirectoryTree {
    pub fn build(records: &[MftRecord]) -> Self {
        let mut nodes: HashMap<u64, TreeNode> = HashMap::new();
        let mut parents: HashMap<u64, u64> = HashMap::new();

        // Metafiles below record 16 stay out of listings, the root aside
        let listed = |r: &&MftRecord| {
            r.is_in_use() && r.base_record == 0 && (r.record_number >= 16 || r.record_number == ROOT_RECORD)
        };
        for record in records.iter().filter(listed) {
            let Some(file_name) = &record.attributes.file_name else {
                continue;
            };
            let si = record.attributes.standard_information.as_ref();
            nodes.insert(
                record.record_number,
                TreeNode {
                    entry: FileEntry {
                        name: if record.record_number == ROOT_RECORD {
                            String::new()
                        } else {
                            file_name.name.clone()
                        },
                        path: String::new(),
                        size: record.size(),
                        created: si.and_then(|s| s.created).or(file_name.created),
                        modified: si.and_then(|s| s.modified).or(file_name.modified),
                        accessed: si.and_then(|s| s.accessed),
                        attributes: si.map_or(0, |s| s.dos_flags),
                    },
                    is_directory: record.is_directory(),
                    children: Vec::new(),
                },
            );
            if record.record_number != ROOT_RECORD {
                parents.insert(record.record_number, file_name.parent_record);
            }
        }

        nodes.entry(ROOT_RECORD).or_insert_with(|| TreeNode {
            entry: FileEntry::named(String::new()),
            is_directory: true,
            children: Vec::new(),
        });

        let mut child_lists: HashMap<u64, Vec<u64>> = HashMap::new();
        for (&child, &parent) in &parents {
            if nodes.contains_key(&parent) {
                child_lists.entry(parent).or_default().push(child);
            }
        }

        let mut tree = DirectoryTree {
            nodes,
            by_name: HashMap::new(),
        };

        // Breadth-first from the root so only reachable records get paths
        let mut queue = VecDeque::from([(ROOT_RECORD, String::from("/"))]);
        let mut visited = HashSet::new();
        while let Some((number, path)) = queue.pop_front() {
            if !visited.insert(number) {
                continue;
            }
            let mut children = child_lists.remove(&number).unwrap_or_default();
            children.sort_unstable();

            if let Some(node) = tree.nodes.get_mut(&number) {
                node.entry.path = path.clone();
                node.children = children.clone();
            }

            for child in children {
                let Some(name) = tree.nodes.get(&child).map(|n| n.entry.name.clone()) else {
                    continue;
                };
                tree.by_name.insert((number, name.to_lowercase()), child);
                let child_path = if path == "/" {
                    format!("/{}", name)
                } else {
                    format!("{}/{}", path, name)
                };
                queue.push_back((child, child_path));
            }
        }

        tree.nodes.retain(|number, _| visited.contains(number));
        tracing::debug!("Directory tree built with {} reachable records", tree.nodes.len());
        tree
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Resolve a `/`-separated path case-insensitively
    pub fn resolve(&self, path: &str) -> FsResult<u64> {
        let mut current = ROOT_RECORD;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            current = *self
                .by_name
                .get(&(current, component.to_lowercase()))
                .ok_or_else(|| FsError::PathNotFound(path.to_string()))?;
        }
        Ok(current)
    }

    pub fn is_directory(&self, record: u64) -> bool {
        self.nodes.get(&record).map_or(false, |n| n.is_directory)
    }

    pub fn file_entry(&self, record: u64) -> Option<&FileEntry> {
        self.nodes.get(&record).map(|n| &n.entry)
    }

    pub fn list_files(&self, path: &str) -> FsResult<Vec<FileEntry>> {
        let dir = self.resolve_directory(path)?;
        Ok(self.nodes[&dir]
            .children
            .iter()
            .filter_map(|c| self.nodes.get(c))
            .filter(|n| !n.is_directory)
            .map(|n| n.entry.clone())
            .collect())
    }

    pub fn list_directories(&self, path: &str) -> FsResult<Vec<DirectoryEntry>> {
        let dir = self.resolve_directory(path)?;
        Ok(self.nodes[&dir]
            .children
            .iter()
            .filter(|c| self.is_directory(**c))
            .map(|c| self.materialize(*c))
            .collect())
    }

    /// The whole tree as an owned `DirectoryEntry`
    pub fn root(&self) -> DirectoryEntry {
        self.materialize(ROOT_RECORD)
    }

    fn resolve_directory(&self, path: &str) -> FsResult<u64> {
        let record = self.resolve(path)?;
        if record != ROOT_RECORD && !self.is_directory(record) {
            return Err(FsError::PathNotFound(path.to_string()));
        }
        Ok(record)
    }

    fn materialize(&self, record: u64) -> DirectoryEntry {
        let node = &self.nodes[&record];
        let mut entry = DirectoryEntry {
            name: node.entry.name.clone(),
            path: node.entry.path.clone(),
            created: node.entry.created,
            modified: node.entry.modified,
            accessed: node.entry.accessed,
            is_root: record == ROOT_RECORD,
            files: Vec::new(),
            directories: Vec::new(),
        };
        for child in &node.children {
            let Some(child_node) = self.nodes.get(child) else {
                continue;
            };
            if child_node.is_directory {
                entry.directories.push(self.materialize(*child));
            } else {
                entry.files.push(child_node.entry.clone());
            }
        }
        entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::ntfs::record::builder::RecordBuilder;
    use crate::fs::ntfs::runs::DataRun;

    fn record(number: u64, builder: RecordBuilder) -> MftRecord {
        MftRecord::parse(&builder.build(), number, 512).unwrap().unwrap()
    }

    fn sample_records() -> Vec<MftRecord> {
        vec![
            record(5, RecordBuilder::new(1024, 512).in_use(true).directory().file_name(5, ".", 0, 3)),
            record(64, RecordBuilder::new(1024, 512).in_use(true).directory().file_name(5, "Docs", 0, 1)),
            record(
                65,
                RecordBuilder::new(1024, 512)
                    .in_use(true)
                    .file_name(64, "Report.TXT", 5, 1)
                    .resident_data(b"hello"),
            ),
            record(
                66,
                RecordBuilder::new(1024, 512)
                    .in_use(true)
                    .file_name(5, "big.bin", 8192, 1)
                    .data_runs(&[DataRun::new(300, 2)], 8192),
            ),
            // deleted: excluded from the tree
            record(67, RecordBuilder::new(1024, 512).in_use(false).file_name(5, "gone.txt", 1, 1)),
            // orphan: parent not present
            record(68, RecordBuilder::new(1024, 512).in_use(true).file_name(999, "lost.txt", 1, 1)),
        ]
    }

    #[test]
    fn test_paths_and_case_insensitive_lookup() {
        let tree = DirectoryTree::build(&sample_records());
        assert_eq!(tree.resolve("/").unwrap(), 5);
        assert_eq!(tree.resolve("/docs/report.txt").unwrap(), 65);
        assert_eq!(tree.file_entry(65).unwrap().path, "/Docs/Report.TXT");
        assert!(matches!(tree.resolve("/gone.txt"), Err(FsError::PathNotFound(_))));
        assert!(tree.resolve("/lost.txt").is_err());
    }

    #[test]
    fn test_listing() {
        let tree = DirectoryTree::build(&sample_records());
        let files: Vec<_> = tree.list_files("/").unwrap().into_iter().map(|f| f.name).collect();
        assert_eq!(files, vec!["big.bin"]);

        let dirs = tree.list_directories("/").unwrap();
        assert_eq!(dirs.len(), 1);
        assert_eq!(dirs[0].name, "Docs");
        assert_eq!(dirs[0].files[0].size, 5);

        assert!(tree.list_files("/big.bin").is_err());
    }

    #[test]
    fn test_root_is_flagged() {
        let tree = DirectoryTree::build(&sample_records());
        let root = tree.root();
        assert!(root.is_root);
        assert_eq!(root.path, "/");
        assert!(!root.directories[0].is_root);
    }
}

//! File Allocation Table decoding and chain traversal (FAT12/16/32).
//!
//! Entries are normalized to 32-bit values on load so chain logic is the
//! same for every width:
//! - 0: free
//! - 2..BAD: next cluster in chain
//! - BAD: bad cluster
//! - >= EOC: end of chain

use std::collections::HashSet;

use super::FatVariant;

pub const FAT_ENTRY_FREE: u32 = 0;
pub const FAT_ENTRY_BAD: u32 = 0x0FFF_FFF7;
pub const FAT_ENTRY_EOC: u32 = 0x0FFF_FFF8;

#[derive(Debug, Clone)]
pub struct FatTable {
    entries: Vec<u32>,
}

impl FatTable {
    /// Decode `count` entries from raw FAT bytes
    pub fn parse(data: &[u8], variant: FatVariant, count: usize) -> Self {
        let mut entries = Vec::with_capacity(count);
        for n in 0..count {
            let raw = match variant {
                FatVariant::Fat12 => {
                    let at = n + n / 2;
                    let Some(pair) = data.get(at..at + 2) else { break };
                    let value = u16::from_le_bytes([pair[0], pair[1]]);
                    let value = if n % 2 == 0 { value & 0x0FFF } else { value >> 4 } as u32;
                    widen(value, 0x0FF7)
                }
                FatVariant::Fat16 => {
                    let Some(b) = data.get(n * 2..n * 2 + 2) else { break };
                    widen(u16::from_le_bytes([b[0], b[1]]) as u32, 0xFFF7)
                }
                FatVariant::Fat32 => {
                    let Some(b) = data.get(n * 4..n * 4 + 4) else { break };
                    u32::from_le_bytes([b[0], b[1], b[2], b[3]]) & 0x0FFF_FFFF
                }
            };
            entries.push(raw);
        }
        tracing::debug!("Parsed {} FAT entries", entries.len());
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, cluster: u32) -> Option<u32> {
        self.entries.get(cluster as usize).copied()
    }

    pub fn is_free(&self, cluster: u32) -> bool {
        cluster >= 2 && self.entry(cluster) == Some(FAT_ENTRY_FREE)
    }

    /// In use by some chain (bad clusters excluded)
    pub fn is_allocated(&self, cluster: u32) -> bool {
        cluster >= 2 && matches!(self.entry(cluster), Some(e) if e != FAT_ENTRY_FREE && e != FAT_ENTRY_BAD)
    }

    pub fn is_bad(&self, cluster: u32) -> bool {
        self.entry(cluster) == Some(FAT_ENTRY_BAD)
    }

    /// Full chain from `start`, stopping at end-of-chain, free or bad
    /// entries, and on loops
    pub fn get_chain(&self, start: u32) -> Vec<u32> {
        let mut chain = Vec::new();
        let mut visited = HashSet::new();
        let mut current = start;

        while current >= 2 && (current as usize) < self.entries.len() {
            if !visited.insert(current) {
                tracing::warn!("FAT chain loop detected at cluster {}", current);
                break;
            }
            chain.push(current);

            let next = self.entries[current as usize];
            if next >= FAT_ENTRY_EOC || next == FAT_ENTRY_FREE || next == FAT_ENTRY_BAD {
                break;
            }
            current = next;
        }
        chain
    }

    /// Allocated clusters as (start, length) runs
    pub fn allocated_runs(&self) -> Vec<(u32, u32)> {
        let mut runs: Vec<(u32, u32)> = Vec::new();
        for cluster in 2..self.entries.len() as u32 {
            if !self.is_allocated(cluster) {
                continue;
            }
            match runs.last_mut() {
                Some((start, len)) if *start + *len == cluster => *len += 1,
                _ => runs.push((cluster, 1)),
            }
        }
        runs
    }

    pub fn free_cluster_count(&self) -> usize {
        self.entries.iter().skip(2).filter(|e| **e == FAT_ENTRY_FREE).count()
    }
}

/// Map a 12/16-bit entry onto the 32-bit special values
fn widen(value: u32, bad: u32) -> u32 {
    match value {
        v if v == bad => FAT_ENTRY_BAD,
        v if v > bad => FAT_ENTRY_EOC,
        v => v,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fat32(entries: &[u32]) -> FatTable {
        let bytes: Vec<u8> = entries.iter().flat_map(|e| e.to_le_bytes()).collect();
        FatTable::parse(&bytes, FatVariant::Fat32, entries.len())
    }

    #[test]
    fn test_chain_follows_links() {
        let table = fat32(&[0x0FFFFFF8, 0x0FFFFFFF, 5, 0, 0, 6, 0x0FFFFFFF]);
        assert_eq!(table.get_chain(2), vec![2, 5, 6]);
        assert!(table.is_free(3));
        assert!(table.is_allocated(6));
        assert_eq!(table.allocated_runs(), vec![(2, 1), (5, 2)]);
    }

    #[test]
    fn test_chain_loop_detected() {
        let table = fat32(&[0, 0, 3, 4, 2]);
        assert_eq!(table.get_chain(2), vec![2, 3, 4]);
    }

    #[test]
    fn test_fat16_special_values_widened() {
        let raw: Vec<u8> = [0xFFF8u16, 0xFFFF, 3, 0xFFFF, 0xFFF7]
            .iter()
            .flat_map(|e| e.to_le_bytes())
            .collect();
        let table = FatTable::parse(&raw, FatVariant::Fat16, 5);
        assert_eq!(table.get_chain(2), vec![2, 3]);
        assert!(table.is_bad(4));
        assert!(!table.is_allocated(4));
    }

    #[test]
    fn test_fat12_packed_entries() {
        // entries: [0xFF8, 0xFFF, 0x003, 0xFFF]
        let raw = [0xF8, 0xFF, 0xFF, 0x03, 0xF0, 0xFF];
        let table = FatTable::parse(&raw, FatVariant::Fat12, 4);
        assert_eq!(table.entry(2), Some(3));
        assert_eq!(table.get_chain(2), vec![2, 3]);
    }
}

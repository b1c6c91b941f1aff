//! NTFS data-run (mapping pairs) decoding.
//!
//! Each run starts with a header byte: low nibble = byte count of the run
//! length, high nibble = byte count of the signed LCN delta relative to the
//! previous run. A zero delta width marks a sparse run. A zero header byte
//! terminates the list.

use serde::{Deserialize, Serialize};

use crate::error::{FsError, FsResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRun {
    /// Absolute starting cluster, `None` for a sparse run
    pub start_cluster: Option<u64>,
    pub length: u64,
}

impl DataRun {
    pub fn new(start_cluster: u64, length: u64) -> Self {
        Self {
            start_cluster: Some(start_cluster),
            length,
        }
    }

    pub fn sparse(length: u64) -> Self {
        Self {
            start_cluster: None,
            length,
        }
    }

    pub fn is_sparse(&self) -> bool {
        self.start_cluster.is_none()
    }
}

pub fn decode_data_runs(data: &[u8]) -> FsResult<Vec<DataRun>> {
    let mut runs = Vec::new();
    let mut pos = 0usize;
    let mut previous_lcn: i64 = 0;

    while pos < data.len() {
        let header = data[pos];
        if header == 0 {
            break;
        }

        let length_size = (header & 0x0F) as usize;
        let offset_size = (header >> 4) as usize;
        if length_size == 0 || length_size > 8 || offset_size > 8 {
            return Err(FsError::InvalidFormat(format!(
                "bad data run header {:#04x} at {}",
                header, pos
            )));
        }
        if pos + 1 + length_size + offset_size > data.len() {
            return Err(FsError::InvalidFormat("truncated data run list".into()));
        }

        let length_bytes = &data[pos + 1..pos + 1 + length_size];
        let length = length_bytes
            .iter()
            .rev()
            .fold(0u64, |acc, b| (acc << 8) | *b as u64);

        let run = if offset_size == 0 {
            DataRun::sparse(length)
        } else {
            let delta_bytes = &data[pos + 1 + length_size..pos + 1 + length_size + offset_size];
            let delta = sign_extend(delta_bytes);
            let lcn = previous_lcn.checked_add(delta).filter(|l| *l >= 0).ok_or_else(|| {
                FsError::InvalidFormat(format!("data run points before cluster 0 at {}", pos))
            })?;
            previous_lcn = lcn;
            DataRun::new(lcn as u64, length)
        };

        runs.push(run);
        pos += 1 + length_size + offset_size;
    }

    Ok(runs)
}

fn sign_extend(bytes: &[u8]) -> i64 {
    let mut value: i64 = 0;
    for (i, b) in bytes.iter().enumerate() {
        value |= (*b as i64) << (i * 8);
    }
    let bits = bytes.len() * 8;
    if bits < 64 && bytes.last().map_or(false, |b| b & 0x80 != 0) {
        value |= -1i64 << bits;
    }
    value
}

/// Total clusters covered, sparse runs included
pub fn total_clusters(runs: &[DataRun]) -> u64 {
    runs.iter().fold(0u64, |total, r| total.saturating_add(r.length))
}

// Z-axis domain decomposition
use std::fmt;

use crate::domain::backend::SetIdx;
use crate::error::{GridError, Result};

/// Assigns every partition a contiguous, inclusive range of block Z slices.
/// Ranges are ordered by partition and cover `[0, span_z)` without gaps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZDecomposition {
    first_z: Vec<i32>,
    last_z: Vec<i32>,
}

impl ZDecomposition {
    /// Split `span_z` slices as evenly as possible; lower partitions take the
    /// remainder.
    pub fn uniform(span_z: i32, device_count: usize) -> Result<Self> {
        Self::check_sizes(span_z, device_count)?;
        let n = device_count as i32;
        let base = span_z / n;
        let extra = span_z % n;
        let mut first_z = Vec::with_capacity(device_count);
        let mut last_z = Vec::with_capacity(device_count);
        let mut begin = 0;
        for i in 0..n {
            let len = base + i32::from(i < extra);
            first_z.push(begin);
            last_z.push(begin + len - 1);
            begin += len;
        }
        Ok(Self { first_z, last_z })
    }

    /// Split so that each partition receives roughly the same number of active
    /// blocks. `slice_weights[z]` is the number of active blocks in slice `z`.
    /// Every partition still receives at least one slice.
    pub fn weighted(slice_weights: &[usize], device_count: usize) -> Result<Self> {
        let span_z = slice_weights.len() as i32;
        Self::check_sizes(span_z, device_count)?;
        let total: usize = slice_weights.iter().sum();
        if total == 0 {
            return Self::uniform(span_z, device_count);
        }
        let mut first_z = Vec::with_capacity(device_count);
        let mut last_z = Vec::with_capacity(device_count);
        let mut z = 0usize;
        let mut acc = 0usize;
        for p in 0..device_count {
            first_z.push(z as i32);
            let remaining_parts = device_count - p - 1;
            if remaining_parts == 0 {
                z = slice_weights.len();
            } else {
                let target = total * (p + 1) / device_count;
                // Take at least one slice, and leave one for each later partition.
                loop {
                    acc += slice_weights[z];
                    z += 1;
                    let slices_left = slice_weights.len() - z;
                    if slices_left <= remaining_parts || acc >= target {
                        break;
                    }
                }
            }
            last_z.push(z as i32 - 1);
        }
        Ok(Self { first_z, last_z })
    }

    /// Explicit slice ranges. Validated for contiguity and order.
    pub fn from_ranges(ranges: &[(i32, i32)]) -> Result<Self> {
        if ranges.is_empty() {
            return Err(GridError::Configuration("empty decomposition".into()));
        }
        let mut expected = 0;
        for (i, &(first, last)) in ranges.iter().enumerate() {
            if first != expected || last < first {
                return Err(GridError::Configuration(format!(
                    "partition {i} range [{first}, {last}] is not contiguous with the previous one"
                )));
            }
            expected = last + 1;
        }
        Ok(Self {
            first_z: ranges.iter().map(|r| r.0).collect(),
            last_z: ranges.iter().map(|r| r.1).collect(),
        })
    }

    fn check_sizes(span_z: i32, device_count: usize) -> Result<()> {
        if device_count == 0 {
            return Err(GridError::Configuration("zero devices".into()));
        }
        if span_z < device_count as i32 {
            return Err(GridError::Configuration(format!(
                "block span z = {span_z} is smaller than the device count {device_count}"
            )));
        }
        Ok(())
    }

    pub fn device_count(&self) -> usize {
        self.first_z.len()
    }

    pub fn first_z(&self, set_idx: SetIdx) -> i32 {
        self.first_z[set_idx.0]
    }

    pub fn last_z(&self, set_idx: SetIdx) -> i32 {
        self.last_z[set_idx.0]
    }

    pub fn slice_count(&self, set_idx: SetIdx) -> i32 {
        self.last_z[set_idx.0] - self.first_z[set_idx.0] + 1
    }

    /// Partition owning block slice `z`, if any.
    pub fn owner_of(&self, z: i32) -> Option<SetIdx> {
        self.first_z
            .iter()
            .zip(&self.last_z)
            .position(|(&f, &l)| f <= z && z <= l)
            .map(SetIdx)
    }
}

impl fmt::Display for ZDecomposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ZDecomposition ({} partitions)", self.device_count())?;
        for (i, (first, last)) in self.first_z.iter().zip(&self.last_z).enumerate() {
            writeln!(f, "  partition {i}: z [{first}, {last}] ({} slices)", last - first + 1)?;
        }
        Ok(())
    }
}

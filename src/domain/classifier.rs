//! Block classification for multi-device partitions.
//!
//! Every active block owned by a partition lands in exactly one bucket keyed
//! by (internal | boundary, up | down, bulk | boundary-condition). Inside a
//! bucket, local ids follow insertion order and the reverse table is the
//! exact inverse of the forward list.
//!
//! The scan is sequential inside a partition, so id assignment is a pure
//! function of the inputs. Partitions are classified in parallel and never
//! touch each other's buckets.

use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::backend::{Backend, DataSet, SetIdx};
use crate::domain::decomposition::ZDecomposition;
use crate::domain::{DataView, Index3d, Stencil};
use crate::error::{GridError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ByPartition {
    Internal = 0,
    Boundary = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ByDirection {
    Up = 0,
    Down = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ByDomain {
    Bulk = 0,
    Bc = 1,
}

impl ByDomain {
    pub const ALL: [ByDomain; 2] = [ByDomain::Bulk, ByDomain::Bc];
}

impl ByDirection {
    pub const ALL: [ByDirection; 2] = [ByDirection::Up, ByDirection::Down];
}

/// Direction used to index internal buckets, which have no direction.
pub const INTERNAL_DIRECTION: ByDirection = ByDirection::Up;

const BUCKETS_PER_PARTITION: usize = 8;

fn bucket_key(by_partition: ByPartition, by_direction: ByDirection, by_domain: ByDomain) -> usize {
    (by_partition as usize) << 2 | (by_direction as usize) << 1 | by_domain as usize
}

/// Ordered block list plus its reverse lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bucket {
    id_to_point: Vec<Index3d>,
    point_to_id: HashMap<Index3d, u32>,
    /// First active voxel found in each block, parallel to `id_to_point`.
    representatives: Vec<Index3d>,
}

impl Bucket {
    fn push(&mut self, block: Index3d, representative: Index3d) {
        let id = self.id_to_point.len() as u32;
        self.id_to_point.push(block);
        self.point_to_id.insert(block, id);
        self.representatives.push(representative);
    }

    pub fn len(&self) -> usize {
        self.id_to_point.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_to_point.is_empty()
    }

    pub fn points(&self) -> &[Index3d] {
        &self.id_to_point
    }

    pub fn id_of(&self, block: &Index3d) -> Option<u32> {
        self.point_to_id.get(block).copied()
    }

    pub fn point_of(&self, id: u32) -> Option<Index3d> {
        self.id_to_point.get(id as usize).copied()
    }

    pub fn representative_voxel(&self, id: u32) -> Option<Index3d> {
        self.representatives.get(id as usize).copied()
    }
}

type PartitionBuckets = [Bucket; BUCKETS_PER_PARTITION];

/// Block-grid geometry the classifier scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanLayout {
    /// Number of blocks along each axis.
    pub block_span: Index3d,
    /// Voxels per block along each axis.
    pub block_size: Index3d,
    pub domain_size: Index3d,
    /// Multiplier applied to `domain_size` when bounding voxel coordinates.
    pub voxel_spacing: i32,
}

impl SpanLayout {
    /// Layout covering `domain_size` with blocks of `block_size`. The block
    /// size is checked before the span is derived from it.
    pub fn covering(domain_size: Index3d, block_size: Index3d, voxel_spacing: i32) -> Result<Self> {
        let positive = |v: Index3d| v.x > 0 && v.y > 0 && v.z > 0;
        if !positive(block_size) || voxel_spacing <= 0 {
            return Err(GridError::Configuration(format!(
                "block size {block_size} and voxel spacing {voxel_spacing} must be positive"
            )));
        }
        let layout = Self {
            block_span: domain_size.div_ceil(&block_size),
            block_size,
            domain_size,
            voxel_spacing,
        };
        layout.validate()?;
        Ok(layout)
    }

    fn validate(&self) -> Result<()> {
        let positive = |v: Index3d| v.x > 0 && v.y > 0 && v.z > 0;
        if !positive(self.block_size) || !positive(self.block_span) || self.voxel_spacing <= 0 {
            return Err(GridError::Configuration(format!(
                "block size {}, block span {} and voxel spacing {} must be positive",
                self.block_size, self.block_span, self.voxel_spacing
            )));
        }
        Ok(())
    }
}

/// Boundary depth in blocks for a stencil radius given in voxels.
pub fn boundary_depth(stencil_radius: i32, block_edge: i32) -> i32 {
    if stencil_radius <= 0 {
        return 0;
    }
    (stencil_radius + block_edge - 1) / block_edge
}

#[derive(Debug, Clone)]
pub struct SpanClassifier {
    data: DataSet<PartitionBuckets>,
    decomposition: Arc<ZDecomposition>,
    depth: i32,
}

impl SpanClassifier {
    /// Classify every active block of every partition.
    ///
    /// * `active` - global voxel coordinate to activity.
    /// * `bc` - block coordinate to boundary-condition membership.
    /// * `block_to_origin` - block coordinate to the voxel origin of the block.
    /// * `voxel_abs` - (block origin, local offset) to global voxel coordinate.
    ///
    /// # Errors
    /// [`GridError::InfeasibleDecomposition`] when more than one device is in
    /// use and a partition owns fewer than `2 * depth` slices. The check runs
    /// for every partition before any block is classified.
    #[allow(clippy::too_many_arguments)]
    pub fn new<A, B, O, V>(
        backend: &Backend,
        active: A,
        bc: B,
        block_to_origin: O,
        voxel_abs: V,
        layout: &SpanLayout,
        stencil: &Stencil,
        decomposition: Arc<ZDecomposition>,
    ) -> Result<Self>
    where
        A: Fn(Index3d) -> bool + Sync,
        B: Fn(Index3d) -> bool + Sync,
        O: Fn(Index3d) -> Index3d + Sync,
        V: Fn(Index3d, Index3d) -> Index3d + Sync,
    {
        layout.validate()?;
        let device_count = backend.device_count();
        if decomposition.device_count() != device_count {
            return Err(GridError::Configuration(format!(
                "decomposition has {} partitions but the backend has {} devices",
                decomposition.device_count(),
                device_count
            )));
        }

        let depth = boundary_depth(stencil.radius(), layout.block_size.z);

        if device_count > 1 {
            for set_idx in backend.set_indices() {
                if decomposition.slice_count(set_idx) < 2 * depth {
                    let err = GridError::InfeasibleDecomposition {
                        set_idx: set_idx.0,
                        first_z: decomposition.first_z(set_idx),
                        last_z: decomposition.last_z(set_idx),
                        depth,
                        block_span: layout.block_span,
                        decomposition: decomposition.to_string(),
                    };
                    tracing::error!(%err, "span classification aborted");
                    return Err(err);
                }
            }
        }

        let voxel_limit = layout.domain_size * layout.voxel_spacing;
        let first_active_voxel = |block: Index3d| -> Option<Index3d> {
            let origin = block_to_origin(block);
            layout
                .block_size
                .iter_box()
                .map(|local| voxel_abs(origin, local))
                .find(|global| global.all_lt(&voxel_limit) && active(*global))
        };

        let data = backend.par_map(|set_idx| {
            let first = decomposition.first_z(set_idx);
            let last = decomposition.last_z(set_idx);
            let (down_depth, up_depth) = if device_count > 1 {
                (
                    if set_idx.0 > 0 { depth } else { 0 },
                    if set_idx.0 + 1 < device_count { depth } else { 0 },
                )
            } else {
                (0, 0)
            };

            let mut buckets: PartitionBuckets = std::array::from_fn(|_| Bucket::default());
            for bz in first..=last {
                let (by_partition, by_direction) = if bz < first + down_depth {
                    (ByPartition::Boundary, ByDirection::Down)
                } else if bz > last - up_depth {
                    (ByPartition::Boundary, ByDirection::Up)
                } else {
                    (ByPartition::Internal, INTERNAL_DIRECTION)
                };
                for by in 0..layout.block_span.y {
                    for bx in 0..layout.block_span.x {
                        let block = Index3d::new(bx, by, bz);
                        if let Some(voxel) = first_active_voxel(block) {
                            let by_domain = if bc(block) { ByDomain::Bc } else { ByDomain::Bulk };
                            buckets[bucket_key(by_partition, by_direction, by_domain)].push(block, voxel);
                        }
                    }
                }
            }
            tracing::debug!(
                partition = set_idx.0,
                z_first = first,
                z_last = last,
                internal = Self::sum_internal(&buckets),
                boundary = Self::sum_boundary(&buckets),
                "partition classified"
            );
            Ok(buckets)
        })?;

        tracing::info!(
            devices = device_count,
            depth,
            block_span = %layout.block_span,
            "span classifier built"
        );
        Ok(Self {
            data,
            decomposition,
            depth,
        })
    }

    fn sum_internal(buckets: &PartitionBuckets) -> usize {
        ByDomain::ALL
            .iter()
            .map(|&d| buckets[bucket_key(ByPartition::Internal, INTERNAL_DIRECTION, d)].len())
            .sum()
    }

    fn sum_boundary(buckets: &PartitionBuckets) -> usize {
        ByDirection::ALL
            .iter()
            .flat_map(|&dir| ByDomain::ALL.map(|d| (dir, d)))
            .map(|(dir, d)| buckets[bucket_key(ByPartition::Boundary, dir, d)].len())
            .sum()
    }

    pub fn bucket(
        &self,
        set_idx: SetIdx,
        by_partition: ByPartition,
        by_direction: ByDirection,
        by_domain: ByDomain,
    ) -> &Bucket {
        &self.data[set_idx][bucket_key(by_partition, by_direction, by_domain)]
    }

    /// Local id to block coordinate, in insertion order.
    ///
    /// # Panics
    /// If `set_idx` is not a partition of this classifier.
    pub fn get_mapper_1d_to_3d(
        &self,
        set_idx: SetIdx,
        by_partition: ByPartition,
        by_direction: ByDirection,
        by_domain: ByDomain,
    ) -> &[Index3d] {
        self.bucket(set_idx, by_partition, by_direction, by_domain).points()
    }

    /// Block coordinate to local id.
    pub fn get_mapper_3d_to_1d(
        &self,
        set_idx: SetIdx,
        by_partition: ByPartition,
        by_direction: ByDirection,
        by_domain: ByDomain,
    ) -> &HashMap<Index3d, u32> {
        &self.bucket(set_idx, by_partition, by_direction, by_domain).point_to_id
    }

    /// Mutable forward list. The caller is responsible for keeping the
    /// reverse table in sync.
    pub fn get_mapper_1d_to_3d_mut(
        &mut self,
        set_idx: SetIdx,
        by_partition: ByPartition,
        by_direction: ByDirection,
        by_domain: ByDomain,
    ) -> &mut Vec<Index3d> {
        &mut self.data[set_idx][bucket_key(by_partition, by_direction, by_domain)].id_to_point
    }

    pub fn get_mapper_3d_to_1d_mut(
        &mut self,
        set_idx: SetIdx,
        by_partition: ByPartition,
        by_direction: ByDirection,
        by_domain: ByDomain,
    ) -> &mut HashMap<Index3d, u32> {
        &mut self.data[set_idx][bucket_key(by_partition, by_direction, by_domain)].point_to_id
    }

    pub fn count_internal(&self, set_idx: SetIdx) -> usize {
        Self::sum_internal(&self.data[set_idx])
    }

    pub fn count_internal_by_domain(&self, set_idx: SetIdx, by_domain: ByDomain) -> usize {
        self.bucket(set_idx, ByPartition::Internal, INTERNAL_DIRECTION, by_domain)
            .len()
    }

    pub fn count_boundary(&self, set_idx: SetIdx) -> usize {
        Self::sum_boundary(&self.data[set_idx])
    }

    pub fn count_boundary_by(
        &self,
        set_idx: SetIdx,
        by_direction: ByDirection,
        by_domain: ByDomain,
    ) -> usize {
        self.bucket(set_idx, ByPartition::Boundary, by_direction, by_domain)
            .len()
    }

    /// Blocks a launch over `data_view` iterates, in launch order: internal,
    /// then boundary-down, then boundary-up; bulk before bc within each.
    pub fn blocks(&self, set_idx: SetIdx, data_view: DataView) -> Vec<Index3d> {
        let mut keys = Vec::with_capacity(6);
        if data_view != DataView::Boundary {
            keys.extend(ByDomain::ALL.map(|d| (ByPartition::Internal, INTERNAL_DIRECTION, d)));
        }
        if data_view != DataView::Internal {
            for dir in [ByDirection::Down, ByDirection::Up] {
                keys.extend(ByDomain::ALL.map(|d| (ByPartition::Boundary, dir, d)));
            }
        }
        keys.into_iter()
            .flat_map(|(p, dir, d)| self.bucket(set_idx, p, dir, d).points().iter().copied())
            .collect()
    }

    /// Boundary depth in blocks.
    pub fn depth(&self) -> i32 {
        self.depth
    }

    pub fn decomposition(&self) -> &Arc<ZDecomposition> {
        &self.decomposition
    }

    pub fn device_count(&self) -> usize {
        self.data.len()
    }
}

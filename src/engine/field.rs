//! Dense reference field storage distributed over the partitions of a
//! [`BlockGrid`].
//!
//! Each partition owns the voxel layers of its Z slab plus two halo slabs
//! (below and above) of `grid.halo_voxels()` layers that mirror the
//! neighbours' edge layers after a halo update. Layout per slab is
//! `[component, z, y, x]`.

use std::fmt;
use std::ops::Range;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ndarray::{s, Array4};
use parking_lot::RwLock;

use crate::domain::{BlockGrid, DataSet, Index3d, SetIdx};
use crate::engine::token::StencilSemantic;
use crate::error::{GridError, Result};

static NEXT_UID: AtomicU64 = AtomicU64::new(1);

/// Identity of a multi-device data object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldUid(pub u64);

impl FieldUid {
    pub fn fresh() -> Self {
        FieldUid(NEXT_UID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for FieldUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Halo update direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum TransferMode {
    /// Each partition pushes its edge layers into the neighbours' halos.
    Put,
    /// Each partition pulls the neighbours' edge layers into its own halos.
    #[default]
    Get,
}

impl TransferMode {
    pub const ALL: [TransferMode; 2] = [TransferMode::Put, TransferMode::Get];

    pub fn as_str(self) -> &'static str {
        match self {
            TransferMode::Put => "put",
            TransferMode::Get => "get",
        }
    }
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferMode {
    type Err = GridError;

    fn from_str(s: &str) -> Result<Self> {
        TransferMode::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| GridError::Configuration(format!("unknown transfer mode `{s}`")))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HaloUpdateOptions {
    pub mode: TransferMode,
    pub semantic: StencilSemantic,
    pub stream_idx: usize,
}

/// Data distributed over the device set that a communication container can
/// refresh.
pub trait MultiXpuData: Send + Sync {
    fn uid(&self) -> FieldUid;
    fn name(&self) -> &str;
    fn device_count(&self) -> usize;
    /// Perform the halo exchange work attributed to one partition.
    fn halo_update(&self, set_idx: SetIdx, options: &HaloUpdateOptions) -> Result<()>;
}

pub trait Element: Copy + Default + Send + Sync + 'static {}

impl<T: Copy + Default + Send + Sync + 'static> Element for T {}

struct PartitionStorage<T> {
    z: Range<i32>,
    owned: RwLock<Array4<T>>,
    halo_down: RwLock<Array4<T>>,
    halo_up: RwLock<Array4<T>>,
}

struct FieldInner<T> {
    uid: FieldUid,
    name: String,
    grid: BlockGrid,
    cardinality: usize,
    halo: i32,
    /// Lattice velocity of each component, for streaming transfers.
    lattice: Option<Vec<Index3d>>,
    parts: DataSet<PartitionStorage<T>>,
}

/// Multi-device field. Cheap to clone; clones share storage.
pub struct Field<T> {
    inner: Arc<FieldInner<T>>,
}

impl<T> Clone for Field<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Field<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Field")
            .field("uid", &self.inner.uid)
            .field("name", &self.inner.name)
            .field("cardinality", &self.inner.cardinality)
            .finish()
    }
}

impl<T: Element> Field<T> {
    pub fn new(grid: &BlockGrid, name: impl Into<String>, cardinality: usize, init: T) -> Result<Self> {
        Self::build(grid, name.into(), cardinality, init, None)
    }

    /// Field whose components are lattice populations moving along `directions`.
    pub fn new_lattice(grid: &BlockGrid, name: impl Into<String>, directions: Vec<Index3d>, init: T) -> Result<Self> {
        let cardinality = directions.len();
        Self::build(grid, name.into(), cardinality, init, Some(directions))
    }

    fn build(
        grid: &BlockGrid,
        name: String,
        cardinality: usize,
        init: T,
        lattice: Option<Vec<Index3d>>,
    ) -> Result<Self> {
        if cardinality == 0 {
            return Err(GridError::Configuration(format!("field `{name}` has zero components")));
        }
        let extent = grid.voxel_extent();
        let (ny, nx) = (extent.y as usize, extent.x as usize);
        let halo = grid.halo_voxels();
        let slab = |layers: i32| Array4::from_elem((cardinality, layers.max(0) as usize, ny, nx), init);
        let parts = grid.backend().new_dataset(|s| {
            let (begin, end) = grid.voxel_z_range(s);
            PartitionStorage {
                z: begin..end,
                owned: RwLock::new(slab(end - begin)),
                halo_down: RwLock::new(slab(halo)),
                halo_up: RwLock::new(slab(halo)),
            }
        });
        let uid = FieldUid::fresh();
        tracing::debug!(%uid, name = %name, cardinality, halo, "field allocated");
        Ok(Self {
            inner: Arc::new(FieldInner {
                uid,
                name,
                grid: grid.clone(),
                cardinality,
                halo,
                lattice,
                parts,
            }),
        })
    }

    pub fn uid(&self) -> FieldUid {
        self.inner.uid
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn cardinality(&self) -> usize {
        self.inner.cardinality
    }

    pub fn grid(&self) -> &BlockGrid {
        &self.inner.grid
    }

    /// Type-erased handle for tokens and transfer containers.
    pub fn as_data(&self) -> Arc<dyn MultiXpuData> {
        self.inner.clone()
    }

    /// Handle bound to one partition.
    pub fn partition(&self, set_idx: SetIdx) -> FieldPartition<T> {
        FieldPartition {
            inner: Arc::clone(&self.inner),
            set_idx,
        }
    }

    fn owner(&self, voxel: Index3d) -> Option<SetIdx> {
        if !voxel.is_inside(&self.inner.grid.voxel_extent()) {
            return None;
        }
        self.inner
            .parts
            .iter()
            .find(|(_, p)| p.z.contains(&voxel.z))
            .map(|(s, _)| s)
    }

    /// Host-side read of the owning partition's value.
    pub fn read(&self, voxel: Index3d, component: usize) -> Option<T> {
        let owner = self.owner(voxel)?;
        self.partition(owner).get(voxel, component)
    }

    pub fn write(&self, voxel: Index3d, component: usize, value: T) -> Result<()> {
        let owner = self.owner(voxel).ok_or_else(|| {
            GridError::Configuration(format!("voxel {voxel} is outside field `{}`", self.name()))
        })?;
        self.partition(owner).write(voxel, component, value);
        Ok(())
    }

    /// Overwrite every owned value, active or not.
    pub fn fill_with(&self, f: impl Fn(Index3d, usize) -> T) {
        let extent = self.inner.grid.voxel_extent();
        for (_, part) in self.inner.parts.iter() {
            let mut owned = part.owned.write();
            for ((c, z, y, x), v) in owned.indexed_iter_mut() {
                let voxel = Index3d::new(x as i32, y as i32, part.z.start + z as i32);
                debug_assert!(voxel.is_inside(&extent));
                *v = f(voxel, c);
            }
        }
    }

    /// Gather the owned slabs into one `[component, z, y, x]` array.
    pub fn to_ndarray(&self) -> Array4<T> {
        let extent = self.inner.grid.voxel_extent();
        let mut out = Array4::from_elem(
            (
                self.inner.cardinality,
                extent.z as usize,
                extent.y as usize,
                extent.x as usize,
            ),
            T::default(),
        );
        for (_, part) in self.inner.parts.iter() {
            let owned = part.owned.read();
            let (z0, z1) = (part.z.start as usize, part.z.end as usize);
            out.slice_mut(s![.., z0..z1, .., ..]).assign(&*owned);
        }
        out
    }
}

impl<T: Element> FieldInner<T> {
    fn components_for(&self, semantic: StencilSemantic, moving_up: bool) -> Vec<usize> {
        match (semantic, &self.lattice) {
            (StencilSemantic::Streaming, Some(dirs)) => dirs
                .iter()
                .enumerate()
                .filter(|(_, d)| if moving_up { d.z > 0 } else { d.z < 0 })
                .map(|(c, _)| c)
                .collect(),
            _ => (0..self.cardinality).collect(),
        }
    }

    /// Copy the `halo` owned layers of `src` adjacent to `dst` into the
    /// matching halo slab of `dst`. `dst_is_above` selects which side.
    fn copy_edge(&self, src: SetIdx, dst: SetIdx, dst_is_above: bool, semantic: StencilSemantic) {
        let src_part = &self.parts[src];
        let dst_part = &self.parts[dst];
        let h = self.halo;
        // Global z layers that travel.
        let (z0, z1) = if dst_is_above {
            ((src_part.z.end - h).max(src_part.z.start), src_part.z.end)
        } else {
            (src_part.z.start, (src_part.z.start + h).min(src_part.z.end))
        };
        let comps = self.components_for(semantic, dst_is_above);
        let owned = src_part.owned.read();
        let (mut halo, halo_z0) = if dst_is_above {
            (dst_part.halo_down.write(), dst_part.z.start - h)
        } else {
            (dst_part.halo_up.write(), dst_part.z.end)
        };
        let (sz0, sz1) = ((z0 - src_part.z.start) as usize, (z1 - src_part.z.start) as usize);
        let (dz0, dz1) = ((z0 - halo_z0) as usize, (z1 - halo_z0) as usize);
        for c in comps {
            halo.slice_mut(s![c, dz0..dz1, .., ..])
                .assign(&owned.slice(s![c, sz0..sz1, .., ..]));
        }
    }
}

impl<T: Element> MultiXpuData for FieldInner<T> {
    fn uid(&self) -> FieldUid {
        self.uid
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn device_count(&self) -> usize {
        self.parts.len()
    }

    fn halo_update(&self, set_idx: SetIdx, options: &HaloUpdateOptions) -> Result<()> {
        let n = self.parts.len();
        if set_idx.0 >= n {
            return Err(GridError::PartitionOutOfRange {
                set_idx: set_idx.0,
                device_count: n,
            });
        }
        if self.halo == 0 || n == 1 {
            return Ok(());
        }
        let below = set_idx.0.checked_sub(1).map(SetIdx);
        let above = (set_idx.0 + 1 < n).then_some(SetIdx(set_idx.0 + 1));
        match options.mode {
            TransferMode::Get => {
                if let Some(b) = below {
                    self.copy_edge(b, set_idx, true, options.semantic);
                }
                if let Some(a) = above {
                    self.copy_edge(a, set_idx, false, options.semantic);
                }
            }
            TransferMode::Put => {
                if let Some(b) = below {
                    self.copy_edge(set_idx, b, false, options.semantic);
                }
                if let Some(a) = above {
                    self.copy_edge(set_idx, a, true, options.semantic);
                }
            }
        }
        tracing::trace!(field = %self.name, partition = set_idx.0, mode = %options.mode, "halo update");
        Ok(())
    }
}

impl<T: Element> MultiXpuData for Field<T> {
    fn uid(&self) -> FieldUid {
        self.inner.uid
    }

    fn name(&self) -> &str {
        &self.inner.name
    }

    fn device_count(&self) -> usize {
        self.inner.parts.len()
    }

    fn halo_update(&self, set_idx: SetIdx, options: &HaloUpdateOptions) -> Result<()> {
        self.inner.halo_update(set_idx, options)
    }
}

/// A field bound to one partition, as handed to kernels by a loader.
pub struct FieldPartition<T> {
    inner: Arc<FieldInner<T>>,
    set_idx: SetIdx,
}

impl<T> Clone for FieldPartition<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            set_idx: self.set_idx,
        }
    }
}

impl<T: Element> FieldPartition<T> {
    pub fn set_idx(&self) -> SetIdx {
        self.set_idx
    }

    pub fn cardinality(&self) -> usize {
        self.inner.cardinality
    }

    /// Value at `voxel` if it is owned by this partition or mirrored in one
    /// of its halos.
    pub fn get(&self, voxel: Index3d, component: usize) -> Option<T> {
        if !voxel.is_inside(&self.inner.grid.voxel_extent()) || component >= self.inner.cardinality {
            return None;
        }
        let part = &self.inner.parts[self.set_idx];
        let (x, y) = (voxel.x as usize, voxel.y as usize);
        let h = self.inner.halo;
        if part.z.contains(&voxel.z) {
            let z = (voxel.z - part.z.start) as usize;
            return Some(part.owned.read()[[component, z, y, x]]);
        }
        if voxel.z < part.z.start && voxel.z >= part.z.start - h {
            let z = (voxel.z - (part.z.start - h)) as usize;
            return Some(part.halo_down.read()[[component, z, y, x]]);
        }
        if voxel.z >= part.z.end && voxel.z < part.z.end + h {
            let z = (voxel.z - part.z.end) as usize;
            return Some(part.halo_up.read()[[component, z, y, x]]);
        }
        None
    }

    /// Owned or halo value, default when unavailable.
    pub fn read(&self, voxel: Index3d, component: usize) -> T {
        self.get(voxel, component).unwrap_or_default()
    }

    /// Neighbour value; `None` outside the domain, on inactive voxels, or
    /// beyond the halo.
    pub fn neighbor(&self, voxel: Index3d, offset: Index3d, component: usize) -> Option<T> {
        let target = voxel + offset;
        if !self.inner.grid.is_active(target) {
            return None;
        }
        self.get(target, component)
    }

    /// # Panics
    /// If `voxel` is not owned by this partition or `component` is out of range.
    pub fn write(&self, voxel: Index3d, component: usize, value: T) {
        let part = &self.inner.parts[self.set_idx];
        assert!(
            part.z.contains(&voxel.z),
            "partition {} of `{}` does not own voxel {voxel}",
            self.set_idx,
            self.inner.name
        );
        let z = (voxel.z - part.z.start) as usize;
        part.owned.write()[[component, z, voxel.y as usize, voxel.x as usize]] = value;
    }
}

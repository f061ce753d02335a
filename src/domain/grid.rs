// Reference block grid: decomposition + classification + launch spans
use std::fmt;
use std::sync::Arc;

use crate::domain::backend::{Backend, DataSet, SetIdx};
use crate::domain::classifier::{boundary_depth, SpanClassifier, SpanLayout};
use crate::domain::decomposition::ZDecomposition;
use crate::domain::{DataView, Index3d, Stencil};
use crate::error::Result;

pub type VoxelPredicate = Arc<dyn Fn(Index3d) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DecompositionPolicy {
    /// Same number of slices per partition.
    #[default]
    Uniform,
    /// Same number of active blocks per partition.
    Weighted,
}

#[derive(Debug, Clone)]
pub struct BlockGridConfig {
    pub domain_size: Index3d,
    pub block_size: Index3d,
    pub stencil: Stencil,
    pub voxel_spacing: i32,
    pub decomposition: DecompositionPolicy,
}

impl BlockGridConfig {
    pub fn new(domain_size: Index3d, block_size: Index3d, stencil: Stencil) -> Self {
        Self {
            domain_size,
            block_size,
            stencil,
            voxel_spacing: 1,
            decomposition: DecompositionPolicy::Uniform,
        }
    }

    fn layout(&self) -> Result<SpanLayout> {
        SpanLayout::covering(self.domain_size, self.block_size, self.voxel_spacing)
    }
}

struct GridInner {
    backend: Backend,
    layout: SpanLayout,
    stencil: Stencil,
    classifier: SpanClassifier,
    active: VoxelPredicate,
    /// One block list per data view, see `view_slot`.
    spans: DataSet<[Vec<Index3d>; 3]>,
}

/// Sparse block grid distributed along Z. Cheap to clone.
#[derive(Clone)]
pub struct BlockGrid {
    inner: Arc<GridInner>,
}

impl fmt::Debug for BlockGrid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockGrid")
            .field("layout", &self.inner.layout)
            .field("devices", &self.inner.backend.device_count())
            .field("depth", &self.inner.classifier.depth())
            .finish()
    }
}

fn view_slot(view: DataView) -> usize {
    match view {
        DataView::Standard => 0,
        DataView::Internal => 1,
        DataView::Boundary => 2,
    }
}

impl BlockGrid {
    pub fn new(
        backend: Backend,
        config: BlockGridConfig,
        active: impl Fn(Index3d) -> bool + Send + Sync + 'static,
        bc: impl Fn(Index3d) -> bool + Send + Sync + 'static,
    ) -> Result<Self> {
        let layout = config.layout()?;
        let active: VoxelPredicate = Arc::new(active);
        let block_size = layout.block_size;

        let decomposition = match config.decomposition {
            DecompositionPolicy::Uniform => {
                ZDecomposition::uniform(layout.block_span.z, backend.device_count())?
            }
            DecompositionPolicy::Weighted => {
                let weights = Self::active_blocks_per_slice(&layout, active.as_ref());
                ZDecomposition::weighted(&weights, backend.device_count())?
            }
        };

        let classifier = {
            let active = Arc::clone(&active);
            SpanClassifier::new(
                &backend,
                move |v| active(v),
                bc,
                move |b| b * block_size,
                |origin, local| origin + local,
                &layout,
                &config.stencil,
                Arc::new(decomposition),
            )?
        };

        let spans = backend.new_dataset(|s| DataView::ALL.map(|v| classifier.blocks(s, v)));

        Ok(Self {
            inner: Arc::new(GridInner {
                backend,
                layout,
                stencil: config.stencil,
                classifier,
                active,
                spans,
            }),
        })
    }

    fn active_blocks_per_slice(layout: &SpanLayout, active: &(dyn Fn(Index3d) -> bool + Send + Sync)) -> Vec<usize> {
        let limit = layout.domain_size * layout.voxel_spacing;
        (0..layout.block_span.z)
            .map(|bz| {
                Index3d::new(layout.block_span.x, layout.block_span.y, 1)
                    .iter_box()
                    .filter(|b| {
                        let origin = Index3d::new(b.x, b.y, bz) * layout.block_size;
                        layout
                            .block_size
                            .iter_box()
                            .map(|l| origin + l)
                            .any(|g| g.all_lt(&limit) && active(g))
                    })
                    .count()
            })
            .collect()
    }

    pub fn backend(&self) -> &Backend {
        &self.inner.backend
    }

    pub fn classifier(&self) -> &SpanClassifier {
        &self.inner.classifier
    }

    pub fn layout(&self) -> &SpanLayout {
        &self.inner.layout
    }

    pub fn stencil(&self) -> &Stencil {
        &self.inner.stencil
    }

    pub fn device_count(&self) -> usize {
        self.inner.backend.device_count()
    }

    /// Voxel extent of the whole domain.
    pub fn voxel_extent(&self) -> Index3d {
        self.inner.layout.domain_size * self.inner.layout.voxel_spacing
    }

    /// Halo thickness in voxel layers.
    pub fn halo_voxels(&self) -> i32 {
        let l = &self.inner.layout;
        boundary_depth(self.inner.stencil.radius(), l.block_size.z) * l.block_size.z
    }

    /// Owned voxel z range `[begin, end)` of a partition.
    pub fn voxel_z_range(&self, set_idx: SetIdx) -> (i32, i32) {
        let l = &self.inner.layout;
        let dec = self.inner.classifier.decomposition();
        let begin = dec.first_z(set_idx) * l.block_size.z;
        let end = ((dec.last_z(set_idx) + 1) * l.block_size.z).min(self.voxel_extent().z);
        (begin, end)
    }

    pub fn is_active(&self, voxel: Index3d) -> bool {
        voxel.is_inside(&self.voxel_extent()) && (self.inner.active)(voxel)
    }

    /// Ordered blocks a launch over `data_view` visits on `set_idx`.
    pub fn span(&self, set_idx: SetIdx, data_view: DataView) -> &[Index3d] {
        &self.inner.spans[set_idx][view_slot(data_view)]
    }

    /// Visit every active voxel of a span, block by block, x fastest inside a block.
    pub fn for_each_voxel(&self, set_idx: SetIdx, data_view: DataView, mut f: impl FnMut(Index3d)) {
        let bs = self.inner.layout.block_size;
        for block in self.span(set_idx, data_view) {
            let origin = *block * bs;
            for local in bs.iter_box() {
                let voxel = origin + local;
                if self.is_active(voxel) {
                    f(voxel);
                }
            }
        }
    }

    pub fn active_voxel_count(&self, set_idx: SetIdx, data_view: DataView) -> usize {
        let mut n = 0;
        self.for_each_voxel(set_idx, data_view, |_| n += 1);
        n
    }
}

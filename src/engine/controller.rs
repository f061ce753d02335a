// Python binding: classify a numpy activity mask and report the buckets
use ndarray::Array3;
use numpy::{IntoPyArray, PyArray3, PyReadonlyArray3};
use pyo3::exceptions::{PyIOError, PyRuntimeError, PyValueError};
use pyo3::prelude::*;

use crate::domain::{
    Backend, BlockGrid, BlockGridConfig, ByDirection, ByDomain, ByPartition, DataView, Index3d, SetIdx, Stencil,
};
use crate::error::GridError;

impl From<GridError> for PyErr {
    fn from(e: GridError) -> Self {
        match e {
            GridError::InfeasibleDecomposition { .. }
            | GridError::Configuration(_)
            | GridError::PartitionOutOfRange { .. } => PyValueError::new_err(e.to_string()),
            GridError::Io(_) => PyIOError::new_err(e.to_string()),
            GridError::Usage { .. } | GridError::Initialization(_) => PyRuntimeError::new_err(e.to_string()),
        }
    }
}

fn direction(name: &str) -> PyResult<ByDirection> {
    match name {
        "up" => Ok(ByDirection::Up),
        "down" => Ok(ByDirection::Down),
        other => Err(PyValueError::new_err(format!("direction must be `up` or `down`, got `{other}`"))),
    }
}

fn domain(name: Option<&str>) -> PyResult<Vec<ByDomain>> {
    match name {
        None => Ok(ByDomain::ALL.to_vec()),
        Some("bulk") => Ok(vec![ByDomain::Bulk]),
        Some("bc") => Ok(vec![ByDomain::Bc]),
        Some(other) => Err(PyValueError::new_err(format!("domain must be `bulk` or `bc`, got `{other}`"))),
    }
}

/// Axis-aligned star of the given voxel radius.
fn star(radius: i32) -> Stencil {
    Stencil::from_points((1..=radius).flat_map(|k| {
        [
            Index3d::new(k, 0, 0),
            Index3d::new(-k, 0, 0),
            Index3d::new(0, k, 0),
            Index3d::new(0, -k, 0),
            Index3d::new(0, 0, k),
            Index3d::new(0, 0, -k),
        ]
    }))
}

/// Block classification of a voxel mask indexed `[z, y, x]`.
#[pyclass]
pub struct SpanReport {
    grid: BlockGrid,
}

impl SpanReport {
    fn set_idx(&self, partition: usize) -> PyResult<SetIdx> {
        let s = SetIdx(partition);
        self.grid.backend().check(s)?;
        Ok(s)
    }
}

#[pymethods]
impl SpanReport {
    #[new]
    #[pyo3(signature = (mask, block_size, device_count, stencil_radius = 1, bc_mask = None))]
    pub fn new(
        mask: PyReadonlyArray3<'_, bool>,
        block_size: i32,
        device_count: usize,
        stencil_radius: i32,
        bc_mask: Option<PyReadonlyArray3<'_, bool>>,
    ) -> PyResult<Self> {
        let active: Array3<bool> = mask.as_array().to_owned();
        let (nz, ny, nx) = active.dim();
        let domain_size = Index3d::new(nx as i32, ny as i32, nz as i32);
        let block = Index3d::splat(block_size);
        // Block-level bc flags: a block is bc if any of its voxels is.
        let bc: Option<Array3<bool>> = bc_mask.map(|m| m.as_array().to_owned());
        if let Some(bc) = &bc {
            if bc.dim() != active.dim() {
                return Err(PyValueError::new_err("bc_mask must have the shape of mask"));
            }
        }

        let config = BlockGridConfig::new(domain_size, block, star(stencil_radius));
        let backend = Backend::new(device_count)?;
        let voxel = |a: &Array3<bool>, v: Index3d| a[[v.z as usize, v.y as usize, v.x as usize]];
        let grid = BlockGrid::new(
            backend,
            config,
            move |v| v.is_inside(&domain_size) && voxel(&active, v),
            move |b| {
                bc.as_ref().map_or(false, |bc| {
                    block
                        .iter_box()
                        .map(|l| b * block + l)
                        .any(|v| v.is_inside(&domain_size) && voxel(bc, v))
                })
            },
        )?;
        tracing::info!(%domain_size, block_size, device_count, "span report ready");
        Ok(Self { grid })
    }

    #[getter]
    pub fn device_count(&self) -> usize {
        self.grid.device_count()
    }

    /// Boundary depth in blocks.
    #[getter]
    pub fn depth(&self) -> i32 {
        self.grid.classifier().depth()
    }

    /// Owned block slices `(first_z, last_z)` per partition.
    pub fn slices(&self) -> Vec<(i32, i32)> {
        let dec = self.grid.classifier().decomposition();
        self.grid
            .backend()
            .set_indices()
            .map(|s| (dec.first_z(s), dec.last_z(s)))
            .collect()
    }

    #[pyo3(signature = (partition, domain = None))]
    pub fn count_internal(&self, partition: usize, domain: Option<&str>) -> PyResult<usize> {
        let s = self.set_idx(partition)?;
        let c = self.grid.classifier();
        Ok(self::domain(domain)?
            .into_iter()
            .map(|d| c.count_internal_by_domain(s, d))
            .sum())
    }

    #[pyo3(signature = (partition, direction = None, domain = None))]
    pub fn count_boundary(&self, partition: usize, direction: Option<&str>, domain: Option<&str>) -> PyResult<usize> {
        let s = self.set_idx(partition)?;
        let c = self.grid.classifier();
        let dirs = match direction {
            Some(name) => vec![self::direction(name)?],
            None => ByDirection::ALL.to_vec(),
        };
        let domains = self::domain(domain)?;
        Ok(dirs
            .iter()
            .flat_map(|&dir| domains.iter().map(move |&d| (dir, d)))
            .map(|(dir, d)| c.count_boundary_by(s, dir, d))
            .sum())
    }

    /// Ordered `(x, y, z)` block list of one bucket. Internal buckets take
    /// `direction=None`.
    #[pyo3(signature = (partition, boundary, direction = None, domain = "bulk"))]
    pub fn blocks(
        &self,
        partition: usize,
        boundary: bool,
        direction: Option<&str>,
        domain: &str,
    ) -> PyResult<Vec<(i32, i32, i32)>> {
        let s = self.set_idx(partition)?;
        let (p, dir) = if boundary {
            let name = direction.ok_or_else(|| PyValueError::new_err("boundary buckets need a direction"))?;
            (ByPartition::Boundary, self::direction(name)?)
        } else {
            (ByPartition::Internal, crate::domain::classifier::INTERNAL_DIRECTION)
        };
        let d = self::domain(Some(domain))?[0];
        Ok(self
            .grid
            .classifier()
            .get_mapper_1d_to_3d(s, p, dir, d)
            .iter()
            .map(|&b| b.into())
            .collect())
    }

    /// Blocks a launch over `view` (`standard`, `internal`, `boundary`) visits.
    pub fn span(&self, partition: usize, view: &str) -> PyResult<Vec<(i32, i32, i32)>> {
        let s = self.set_idx(partition)?;
        let view: DataView = view.parse()?;
        Ok(self.grid.span(s, view).iter().map(|&b| b.into()).collect())
    }

    /// Per-block labels indexed `[z, y, x]`: -1 inactive, 0 internal,
    /// 1 boundary down, 2 boundary up.
    pub fn labels<'py>(&self, py: Python<'py>) -> Bound<'py, PyArray3<i8>> {
        let span = self.grid.layout().block_span;
        let mut out = Array3::from_elem((span.z as usize, span.y as usize, span.x as usize), -1i8);
        let c = self.grid.classifier();
        for s in self.grid.backend().set_indices() {
            for d in ByDomain::ALL {
                let buckets = [
                    (ByPartition::Internal, crate::domain::classifier::INTERNAL_DIRECTION, 0i8),
                    (ByPartition::Boundary, ByDirection::Down, 1),
                    (ByPartition::Boundary, ByDirection::Up, 2),
                ];
                for (p, dir, label) in buckets {
                    for b in c.get_mapper_1d_to_3d(s, p, dir, d) {
                        out[[b.z as usize, b.y as usize, b.x as usize]] = label;
                    }
                }
            }
        }
        out.into_pyarray(py)
    }

    fn __repr__(&self) -> String {
        format!("{:?}", self.grid)
    }
}

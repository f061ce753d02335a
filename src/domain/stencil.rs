use crate::domain::Index3d;

/// Set of neighbour offsets a computation reads. Only the radius matters to
/// the partitioning logic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stencil {
    points: Vec<Index3d>,
}

impl Stencil {
    /// Duplicates are dropped, first occurrence wins.
    pub fn from_points(points: impl IntoIterator<Item = Index3d>) -> Self {
        let mut unique: Vec<Index3d> = Vec::new();
        for p in points {
            if !unique.contains(&p) {
                unique.push(p);
            }
        }
        Self { points: unique }
    }

    /// No neighbour access at all.
    pub fn empty() -> Self {
        Self { points: Vec::new() }
    }

    /// Six face neighbours.
    pub fn s7_laplace() -> Self {
        Self::from_points([
            Index3d::new(-1, 0, 0),
            Index3d::new(1, 0, 0),
            Index3d::new(0, -1, 0),
            Index3d::new(0, 1, 0),
            Index3d::new(0, 0, -1),
            Index3d::new(0, 0, 1),
        ])
    }

    /// Full 3x3x3 neighbourhood without the centre.
    pub fn s27() -> Self {
        Self::from_points(
            Index3d::splat(3)
                .iter_box()
                .map(|p| p - Index3d::splat(1))
                .filter(|p| *p != Index3d::default()),
        )
    }

    pub fn points(&self) -> &[Index3d] {
        &self.points
    }

    /// Largest voxel offset along any axis.
    pub fn radius(&self) -> i32 {
        self.points.iter().map(Index3d::chebyshev_norm).max().unwrap_or(0)
    }
}

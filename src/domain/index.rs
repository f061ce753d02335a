// Integer 3D coordinates for blocks and voxels
use std::fmt;
use std::ops::{Add, Mul, Sub};

/// Integer 3D coordinate. Used for block coordinates, voxel coordinates and
/// extents alike.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Index3d {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl Index3d {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    pub const fn splat(v: i32) -> Self {
        Self { x: v, y: v, z: v }
    }

    /// Number of points in the box `[0, self)`. Zero if any extent is non-positive.
    pub fn volume(&self) -> usize {
        if self.x <= 0 || self.y <= 0 || self.z <= 0 {
            return 0;
        }
        self.x as usize * self.y as usize * self.z as usize
    }

    /// Component-wise strict less-than on every axis.
    pub fn all_lt(&self, other: &Index3d) -> bool {
        self.x < other.x && self.y < other.y && self.z < other.z
    }

    /// True when every component is in `[0, extent)`.
    pub fn is_inside(&self, extent: &Index3d) -> bool {
        self.x >= 0 && self.y >= 0 && self.z >= 0 && self.all_lt(extent)
    }

    /// Largest absolute component.
    pub fn chebyshev_norm(&self) -> i32 {
        self.x.abs().max(self.y.abs()).max(self.z.abs())
    }

    /// Component-wise ceiling division by a positive divisor.
    pub fn div_ceil(&self, divisor: &Index3d) -> Index3d {
        Index3d::new(
            (self.x + divisor.x - 1) / divisor.x,
            (self.y + divisor.y - 1) / divisor.y,
            (self.z + divisor.z - 1) / divisor.z,
        )
    }

    /// Iterate `[0, self)` with x fastest, then y, then z.
    pub fn iter_box(self) -> BoxIter {
        BoxIter {
            extent: self,
            next: if self.volume() == 0 {
                None
            } else {
                Some(Index3d::default())
            },
        }
    }
}

impl Add for Index3d {
    type Output = Index3d;
    fn add(self, rhs: Index3d) -> Index3d {
        Index3d::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Index3d {
    type Output = Index3d;
    fn sub(self, rhs: Index3d) -> Index3d {
        Index3d::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

/// Component-wise product.
impl Mul for Index3d {
    type Output = Index3d;
    fn mul(self, rhs: Index3d) -> Index3d {
        Index3d::new(self.x * rhs.x, self.y * rhs.y, self.z * rhs.z)
    }
}

impl Mul<i32> for Index3d {
    type Output = Index3d;
    fn mul(self, rhs: i32) -> Index3d {
        Index3d::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

impl From<(i32, i32, i32)> for Index3d {
    fn from((x, y, z): (i32, i32, i32)) -> Self {
        Index3d::new(x, y, z)
    }
}

impl From<Index3d> for (i32, i32, i32) {
    fn from(idx: Index3d) -> Self {
        (idx.x, idx.y, idx.z)
    }
}

impl fmt::Display for Index3d {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Row-major walk of a box, x fastest.
#[derive(Debug, Clone)]
pub struct BoxIter {
    extent: Index3d,
    next: Option<Index3d>,
}

impl Iterator for BoxIter {
    type Item = Index3d;

    fn next(&mut self) -> Option<Index3d> {
        let current = self.next?;
        let mut n = current;
        n.x += 1;
        if n.x == self.extent.x {
            n.x = 0;
            n.y += 1;
            if n.y == self.extent.y {
                n.y = 0;
                n.z += 1;
            }
        }
        self.next = if n.z == self.extent.z { None } else { Some(n) };
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn box_iteration_is_x_fastest() {
        let pts: Vec<_> = Index3d::new(2, 2, 2).iter_box().collect();
        assert_eq!(pts.len(), 8);
        assert_eq!(pts[0], Index3d::new(0, 0, 0));
        assert_eq!(pts[1], Index3d::new(1, 0, 0));
        assert_eq!(pts[2], Index3d::new(0, 1, 0));
        assert_eq!(pts[4], Index3d::new(0, 0, 1));
        assert_eq!(pts[7], Index3d::new(1, 1, 1));
    }

    #[test]
    fn empty_box_yields_nothing() {
        assert_eq!(Index3d::new(3, 0, 2).iter_box().count(), 0);
    }

    #[test]
    fn bounds_and_norms() {
        let domain = Index3d::new(10, 10, 10);
        assert!(Index3d::new(9, 0, 9).is_inside(&domain));
        assert!(!Index3d::new(10, 0, 0).is_inside(&domain));
        assert!(!Index3d::new(-1, 0, 0).is_inside(&domain));
        assert_eq!(Index3d::new(-3, 2, 1).chebyshev_norm(), 3);
        assert_eq!(Index3d::new(10, 9, 1).div_ceil(&Index3d::splat(2)), Index3d::new(5, 5, 1));
    }
}

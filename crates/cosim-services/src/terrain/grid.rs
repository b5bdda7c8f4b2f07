//! Uniform-grid spatial hash for particle neighbor queries, plus the few
//! vector helpers the particle backends share.

use std::collections::HashMap;

use cosim_core::payload::Vec3;

/// Points bucketed by integer cell coordinates.
#[derive(Debug, Clone)]
pub struct SpatialGrid {
    cell: f64,
    cells: HashMap<[i64; 3], Vec<usize>>,
}

impl SpatialGrid {
    pub fn new(cell: f64) -> Self {
        Self {
            cell,
            cells: HashMap::new(),
        }
    }

    pub fn build(points: &[Vec3], cell: f64) -> Self {
        let mut grid = Self::new(cell);
        for (i, p) in points.iter().enumerate() {
            grid.insert(i, p);
        }
        grid
    }

    fn key(&self, p: &Vec3) -> [i64; 3] {
        [
            (p[0] / self.cell).floor() as i64,
            (p[1] / self.cell).floor() as i64,
            (p[2] / self.cell).floor() as i64,
        ]
    }

    pub fn insert(&mut self, index: usize, p: &Vec3) {
        let key = self.key(p);
        self.cells.entry(key).or_default().push(index);
    }

    /// Call `f` for every point in the 27 cells around `p`. Points closer
    /// than one cell size are always visited.
    pub fn for_each_near(&self, p: &Vec3, mut f: impl FnMut(usize)) {
        let [cx, cy, cz] = self.key(p);
        for dx in -1..=1 {
            for dy in -1..=1 {
                for dz in -1..=1 {
                    if let Some(bucket) = self.cells.get(&[cx + dx, cy + dy, cz + dz]) {
                        for &i in bucket {
                            f(i);
                        }
                    }
                }
            }
        }
    }
}

#[inline]
pub fn sub(a: &Vec3, b: &Vec3) -> Vec3 {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

#[inline]
pub fn dot(a: &Vec3, b: &Vec3) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

#[inline]
pub fn norm(a: &Vec3) -> f64 {
    dot(a, a).sqrt()
}

/// `acc += s * v`
#[inline]
pub fn axpy(acc: &mut Vec3, s: f64, v: &Vec3) {
    acc[0] += s * v[0];
    acc[1] += s * v[1];
    acc[2] += s * v[2];
}

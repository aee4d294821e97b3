//! Coordinate math shared by the environment, the capture layer, and the
//! indexer's flat-index decoder.

use std::fmt;

/// An N-dimensional cell coordinate. May be out of range before wrapping.
pub type Coord = Vec<i32>;

/// Grid boundary behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Topology {
    /// Out-of-range coordinates are an error.
    #[default]
    Bounded,
    /// Coordinates wrap around every axis.
    Toroidal,
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topology::Bounded => write!(f, "bounded"),
            Topology::Toroidal => write!(f, "toroidal"),
        }
    }
}

/// The shape of an N-dimensional grid plus its topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shape {
    dims: Vec<i32>,
    topology: Topology,
}

impl Shape {
    /// Builds a shape. Every dimension must be positive.
    ///
    /// # Panics
    ///
    /// Panics on an empty shape or a non-positive dimension; shapes come
    /// from validated configuration.
    pub fn new(dims: Vec<i32>, topology: Topology) -> Shape {
        assert!(!dims.is_empty(), "grid shape must have at least one axis");
        assert!(
            dims.iter().all(|d| *d > 0),
            "grid dimensions must be positive"
        );
        Shape { dims, topology }
    }

    /// Number of axes.
    pub fn num_dims(&self) -> usize {
        self.dims.len()
    }

    /// Per-axis extents.
    pub fn dims(&self) -> &[i32] {
        &self.dims
    }

    /// Boundary behaviour.
    pub fn topology(&self) -> Topology {
        self.topology
    }

    /// Total number of cells.
    pub fn len(&self) -> usize {
        shape_len(&self.dims)
    }

    /// Whether `coord` lies inside the grid without wrapping.
    pub fn contains(&self, coord: &[i32]) -> bool {
        coord.len() == self.dims.len()
            && coord
                .iter()
                .zip(&self.dims)
                .all(|(c, d)| *c >= 0 && c < d)
    }

    /// Wraps `coord` into range on a toroidal grid; returns `None` for an
    /// out-of-range coordinate on a bounded grid.
    pub fn wrap(&self, coord: &[i32]) -> Option<Coord> {
        if coord.len() != self.dims.len() {
            return None;
        }
        match self.topology {
            Topology::Bounded => self.contains(coord).then(|| coord.to_vec()),
            Topology::Toroidal => Some(
                coord
                    .iter()
                    .zip(&self.dims)
                    .map(|(c, d)| c.rem_euclid(*d))
                    .collect(),
            ),
        }
    }

    /// Minimal-image displacement from `a` to `b`.
    ///
    /// On a toroidal grid each axis is chosen in `(-d/2, d/2]`; on a bounded
    /// grid this is plain subtraction.
    pub fn relative(&self, a: &[i32], b: &[i32]) -> Coord {
        debug_assert_eq!(a.len(), self.dims.len());
        debug_assert_eq!(b.len(), self.dims.len());
        match self.topology {
            Topology::Bounded => a.iter().zip(b).map(|(x, y)| y - x).collect(),
            Topology::Toroidal => a
                .iter()
                .zip(b)
                .zip(&self.dims)
                .map(|((x, y), d)| {
                    let mut diff = (y - x).rem_euclid(*d);
                    if diff > d / 2 {
                        diff -= d;
                    }
                    diff
                })
                .collect(),
        }
    }

    /// Flat index of an in-range coordinate, column-major (`x·h + y` in 2D).
    pub fn flat_index(&self, coord: &[i32]) -> usize {
        flat_index(&self.dims, coord)
    }

    /// Coordinate of a flat index.
    pub fn coord_of(&self, mut flat: usize) -> Coord {
        let mut coord = vec![0i32; self.dims.len()];
        for axis in (0..self.dims.len()).rev() {
            let d = self.dims[axis] as usize;
            coord[axis] = (flat % d) as i32;
            flat /= d;
        }
        debug_assert_eq!(flat, 0, "flat index out of range");
        coord
    }
}

/// Total cell count of a dimension list.
pub fn shape_len(dims: &[i32]) -> usize {
    dims.iter().map(|d| *d as usize).product()
}

/// Column-major flat index of an in-range coordinate.
pub fn flat_index(dims: &[i32], coord: &[i32]) -> usize {
    debug_assert_eq!(dims.len(), coord.len());
    let mut flat = 0usize;
    for (c, d) in coord.iter().zip(dims) {
        debug_assert!(*c >= 0 && c < d, "coordinate out of range");
        flat = flat * (*d as usize) + *c as usize;
    }
    flat
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn torus(dims: &[i32]) -> Shape {
        Shape::new(dims.to_vec(), Topology::Toroidal)
    }

    #[test]
    fn flat_index_is_column_major() {
        let shape = Shape::new(vec![20, 30], Topology::Bounded);
        assert_eq!(shape.flat_index(&[0, 0]), 0);
        assert_eq!(shape.flat_index(&[0, 1]), 1);
        assert_eq!(shape.flat_index(&[1, 0]), 30);
        assert_eq!(shape.coord_of(123), vec![4, 3]);
    }

    #[test]
    fn three_dimensional_decode() {
        let shape = Shape::new(vec![10, 10, 10], Topology::Bounded);
        assert_eq!(shape.coord_of(123), vec![1, 2, 3]);
        assert_eq!(shape.flat_index(&[1, 2, 3]), 123);
    }

    #[test]
    fn bounded_wrap_rejects_out_of_range() {
        let shape = Shape::new(vec![20, 20], Topology::Bounded);
        assert_eq!(shape.wrap(&[5, 5]), Some(vec![5, 5]));
        assert_eq!(shape.wrap(&[20, 0]), None);
        assert_eq!(shape.wrap(&[-1, 0]), None);
    }

    #[test]
    fn toroidal_wrap_is_total() {
        let shape = torus(&[20, 20]);
        assert_eq!(shape.wrap(&[-1, 25]), Some(vec![19, 5]));
    }

    #[test]
    fn minimal_image_prefers_the_short_way_round() {
        let shape = torus(&[20, 20]);
        assert_eq!(shape.relative(&[18, 0], &[2, 0]), vec![4, 0]);
        assert_eq!(shape.relative(&[2, 0], &[18, 0]), vec![-4, 0]);
        // exactly half the axis resolves to +d/2
        assert_eq!(shape.relative(&[0, 0], &[10, 0]), vec![10, 0]);
    }

    proptest! {
        #[test]
        fn toroidal_wrap_always_lands_in_range(
            x in -100i32..100, y in -100i32..100
        ) {
            let shape = torus(&[17, 23]);
            let wrapped = shape.wrap(&[x, y]).unwrap();
            prop_assert!(shape.contains(&wrapped));
        }

        #[test]
        fn bounded_wrap_is_identity_iff_in_range(
            x in -30i32..30, y in -30i32..30
        ) {
            let shape = Shape::new(vec![20, 20], Topology::Bounded);
            let coord = vec![x, y];
            match shape.wrap(&coord) {
                Some(wrapped) => {
                    prop_assert!(shape.contains(&coord));
                    prop_assert_eq!(wrapped, coord);
                }
                None => prop_assert!(!shape.contains(&coord)),
            }
        }

        #[test]
        fn flat_index_round_trips(x in 0i32..7, y in 0i32..11, z in 0i32..5) {
            let shape = Shape::new(vec![7, 11, 5], Topology::Bounded);
            let coord = vec![x, y, z];
            prop_assert_eq!(shape.coord_of(shape.flat_index(&coord)), coord);
        }
    }
}

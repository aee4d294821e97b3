//! The shared cellular substrate of an Evochora simulation.
//!
//! One `AtomicU32` per cell carries the packed `(type, value, owner)` word,
//! so every cell write is a single atomic store. There are no per-cell
//! locks: the tick scheduler guarantees that no two workers write the same
//! cell within a tick, and the tick barrier orders cross-worker visibility.

use evochora_types::{Coord, Molecule, MoleculeTypeError, OrganismId, Shape, Topology};
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;

/// Environment access failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvironmentError {
    /// Out-of-range access on a bounded grid, or a dimension mismatch.
    #[error("coordinate {coord:?} is outside the {shape:?} grid")]
    OutOfBounds {
        /// The offending coordinate.
        coord: Coord,
        /// Grid extents.
        shape: Vec<i32>,
    },
    /// A stored cell word failed to decode.
    #[error(transparent)]
    Corrupt(#[from] MoleculeTypeError),
}

/// Shorthand result type for environment access.
pub type Result<T> = std::result::Result<T, EnvironmentError>;

/// An N-dimensional grid of molecule words.
pub struct Environment {
    shape: Shape,
    cells: Vec<AtomicU32>,
}

impl Environment {
    /// Creates an empty grid with the given shape.
    pub fn new(shape: Shape) -> Environment {
        let mut cells = Vec::with_capacity(shape.len());
        cells.resize_with(shape.len(), || AtomicU32::new(0));
        Environment { shape, cells }
    }

    /// Grid shape and topology.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Number of axes.
    pub fn num_dims(&self) -> usize {
        self.shape.num_dims()
    }

    /// Wraps a coordinate into range.
    ///
    /// Infallible on toroidal grids; `OutOfBounds` on bounded ones.
    pub fn wrap(&self, coord: &[i32]) -> Result<Coord> {
        self.shape.wrap(coord).ok_or_else(|| self.oob(coord))
    }

    /// Reads the molecule at `coord`.
    pub fn get(&self, coord: &[i32]) -> Result<Molecule> {
        let (molecule, _) = self.get_with_owner(coord)?;
        Ok(molecule)
    }

    /// Reads the owner id at `coord`.
    pub fn owner_of(&self, coord: &[i32]) -> Result<OrganismId> {
        let (_, owner) = self.get_with_owner(coord)?;
        Ok(owner)
    }

    /// Reads the molecule and owner at `coord` in one atomic load.
    pub fn get_with_owner(&self, coord: &[i32]) -> Result<(Molecule, OrganismId)> {
        let word = self.cells[self.flat(coord)?].load(Ordering::Relaxed);
        Ok(Molecule::decode(word)?)
    }

    /// Writes `molecule` at `coord`, crediting `owner` with the cell.
    pub fn set(&self, coord: &[i32], molecule: Molecule, owner: OrganismId) -> Result<()> {
        let flat = self.flat(coord)?;
        self.cells[flat].store(molecule.encode(owner), Ordering::Relaxed);
        Ok(())
    }

    /// Reads the raw cell word at a flat index.
    pub fn raw(&self, flat: usize) -> u32 {
        self.cells[flat].load(Ordering::Relaxed)
    }

    /// Writes a raw cell word at a flat index.
    pub fn set_raw(&self, flat: usize, word: u32) {
        self.cells[flat].store(word, Ordering::Relaxed);
    }

    /// Minimal-image displacement from `a` to `b`, as used by genome
    /// hashing.
    pub fn relative(&self, a: &[i32], b: &[i32]) -> Coord {
        self.shape.relative(a, b)
    }

    /// Iterates all non-empty cells as `(flat_index, molecule, owner)`.
    ///
    /// Corrupt words are skipped; they cannot be produced by this crate's
    /// own writers.
    pub fn non_empty_cells(&self) -> impl Iterator<Item = (usize, Molecule, OrganismId)> + '_ {
        self.cells.iter().enumerate().filter_map(|(flat, cell)| {
            let word = cell.load(Ordering::Relaxed);
            let (molecule, owner) = Molecule::decode(word).ok()?;
            (!molecule.is_empty() || owner != 0).then_some((flat, molecule, owner))
        })
    }

    fn flat(&self, coord: &[i32]) -> Result<usize> {
        let wrapped = self.wrap(coord)?;
        Ok(self.shape.flat_index(&wrapped))
    }

    fn oob(&self, coord: &[i32]) -> EnvironmentError {
        EnvironmentError::OutOfBounds {
            coord: coord.to_vec(),
            shape: self.shape.dims().to_vec(),
        }
    }
}

/// Convenience constructor used throughout the test suites.
pub fn environment(dims: &[i32], topology: Topology) -> Environment {
    Environment::new(Shape::new(dims.to_vec(), topology))
}

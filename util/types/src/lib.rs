//! Core Evochora data types.
//!
//! The molecule word codec, molecule type tags, coordinate math shared by
//! the environment and the runtime, and the label hash used by the ISA.

mod coord;
mod molecule;

pub use coord::{flat_index, shape_len, Coord, Shape, Topology};
pub use molecule::{
    label_hash, Molecule, MoleculeType, MoleculeTypeError, OrganismId, VALUE_BITS, VALUE_MASK,
    VALUE_MAX, VALUE_MIN,
};

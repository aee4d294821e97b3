//! Program artifacts.
//!
//! The compiler toolchain is an external collaborator; the runtime treats
//! a program as an opaque layout of molecules plus an entry offset. The
//! builder below is what tests and world seeding use to lay out code by
//! hand.

use evochora_types::{label_hash, Coord, Molecule, MoleculeType};

/// An opaque program layout: molecule offsets relative to the load origin.
#[derive(Debug, Clone)]
pub struct Program {
    /// Reported identity of the compiled artifact.
    pub program_id: String,
    /// `(offset, molecule)` pairs, offsets relative to the load origin.
    pub cells: Vec<(Coord, Molecule)>,
    /// Entry instruction offset.
    pub entry: Coord,
}

impl Program {
    /// Starts an empty layout with entry offset zero.
    pub fn new(program_id: &str, dims: usize) -> Program {
        Program {
            program_id: program_id.to_owned(),
            cells: Vec::new(),
            entry: vec![0; dims],
        }
    }

    /// Places a molecule at an offset.
    pub fn put(mut self, offset: &[i32], molecule: Molecule) -> Self {
        self.cells.push((offset.to_vec(), molecule));
        self
    }

    /// Places a LABEL cell for `name` at an offset.
    pub fn label(self, offset: &[i32], name: &str) -> Self {
        self.put(offset, Molecule::new(MoleculeType::Label, label_hash(name)))
    }

    /// Places a LABELREF cell for `name` at an offset.
    pub fn label_ref(self, offset: &[i32], name: &str) -> Self {
        self.put(
            offset,
            Molecule::new(MoleculeType::LabelRef, label_hash(name)),
        )
    }

    /// Sets the entry offset.
    pub fn entry_at(mut self, offset: &[i32]) -> Self {
        self.entry = offset.to_vec();
        self
    }
}

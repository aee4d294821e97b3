//! The 32-bit molecule cell word.
//!
//! Layout, low bits first: `value` in bits 0..19 (19-bit two's-complement),
//! `owner` in bits 19..29 (10 bits), `type` in bits 29..32 (3 bits). The
//! zero word is the canonical empty cell.

use std::fmt;
use thiserror::Error;

/// Number of value bits in a cell word.
pub const VALUE_BITS: u32 = 19;
/// Mask selecting the value bits of a cell word.
pub const VALUE_MASK: u32 = (1 << VALUE_BITS) - 1;

const OWNER_BITS: u32 = 10;
const OWNER_SHIFT: u32 = VALUE_BITS;
const OWNER_MASK: u32 = (1 << OWNER_BITS) - 1;
const TYPE_SHIFT: u32 = VALUE_BITS + OWNER_BITS;

/// Smallest representable molecule value.
pub const VALUE_MIN: i32 = -(1 << (VALUE_BITS - 1));
/// Largest representable molecule value.
pub const VALUE_MAX: i32 = (1 << (VALUE_BITS - 1)) - 1;

/// Identifies the organism credited with the most recent write to a cell.
///
/// Zero means unowned. Ids are stored in the 10 owner bits of the cell word.
pub type OrganismId = u32;

/// The type tag of a molecule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum MoleculeType {
    /// Executable instruction; `CODE:0` is the empty cell.
    #[default]
    Code = 0,
    /// Inert payload, ignored by the genome hasher.
    Data = 1,
    /// Harvestable energy.
    Energy = 2,
    /// Jump target; value is a 19-bit label hash.
    Label = 3,
    /// Reference to a label; value is a 19-bit label hash.
    LabelRef = 4,
    /// Register operand; value selects a register bank slot.
    Register = 5,
    /// Structural matter.
    Structure = 6,
}

/// Raised when a cell word carries the reserved type tag.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid molecule type tag {0}")]
pub struct MoleculeTypeError(pub u8);

impl TryFrom<u8> for MoleculeType {
    type Error = MoleculeTypeError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(MoleculeType::Code),
            1 => Ok(MoleculeType::Data),
            2 => Ok(MoleculeType::Energy),
            3 => Ok(MoleculeType::Label),
            4 => Ok(MoleculeType::LabelRef),
            5 => Ok(MoleculeType::Register),
            6 => Ok(MoleculeType::Structure),
            _ => Err(MoleculeTypeError(tag)),
        }
    }
}

impl fmt::Display for MoleculeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MoleculeType::Code => "CODE",
            MoleculeType::Data => "DATA",
            MoleculeType::Energy => "ENERGY",
            MoleculeType::Label => "LABEL",
            MoleculeType::LabelRef => "LABELREF",
            MoleculeType::Register => "REGISTER",
            MoleculeType::Structure => "STRUCTURE",
        };
        write!(f, "{}", name)
    }
}

/// A typed cell value, without the owner bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Molecule {
    /// Type tag.
    pub mol_type: MoleculeType,
    /// Signed 19-bit payload.
    pub value: i32,
}

impl Molecule {
    /// The canonical empty cell, `CODE:0`.
    pub const EMPTY: Molecule = Molecule {
        mol_type: MoleculeType::Code,
        value: 0,
    };

    /// Builds a molecule; the value is masked to 19 bits.
    pub fn new(mol_type: MoleculeType, value: i32) -> Molecule {
        Molecule {
            mol_type,
            value: sign_extend(value as u32 & VALUE_MASK),
        }
    }

    /// A cell is empty iff it is `CODE:0`, regardless of owner.
    pub fn is_empty(&self) -> bool {
        self.mol_type == MoleculeType::Code && self.value == 0
    }

    /// Packs `(type, value, owner)` into a cell word.
    pub fn encode(&self, owner: OrganismId) -> u32 {
        ((self.mol_type as u32) << TYPE_SHIFT)
            | ((owner & OWNER_MASK) << OWNER_SHIFT)
            | (self.value as u32 & VALUE_MASK)
    }

    /// Unpacks a cell word into `(molecule, owner)`.
    pub fn decode(word: u32) -> Result<(Molecule, OrganismId), MoleculeTypeError> {
        let mol_type = MoleculeType::try_from((word >> TYPE_SHIFT) as u8)?;
        let owner = (word >> OWNER_SHIFT) & OWNER_MASK;
        let value = sign_extend(word & VALUE_MASK);
        Ok((Molecule { mol_type, value }, owner))
    }
}

impl fmt::Display for Molecule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.mol_type, self.value)
    }
}

fn sign_extend(raw: u32) -> i32 {
    ((raw << (32 - VALUE_BITS)) as i32) >> (32 - VALUE_BITS)
}

/// Hashes a label name to its 19-bit jump hash.
///
/// The low 19 bits of a 32-bit FNV-1a hash; always non-negative, so label
/// hashes survive the signed molecule value round-trip.
pub fn label_hash(name: &str) -> i32 {
    const FNV_OFFSET: u32 = 0x811c_9dc5;
    const FNV_PRIME: u32 = 0x0100_0193;
    let mut hash = FNV_OFFSET;
    for byte in name.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    (hash & VALUE_MASK) as i32
}

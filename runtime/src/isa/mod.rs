//! Instruction decoding and dispatch.
//!
//! One call to [`step`] interprets a single instruction for one organism:
//! fetch the CODE molecule at `ip`, decode the operand cells that follow it
//! along `dv`, execute, and advance `ip` unless the instruction moved it.
//! Every failure is a local state transition on the organism; nothing here
//! propagates an error out of the tick.

mod exec;

use crate::organism::{Organism, RegisterRef};
use crate::scheduler::StepCtx;
use evochora_types::{Coord, MoleculeType, VALUE_MASK};
use std::fmt;

/// Classes of per-instruction failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The cell at `ip` is empty or not CODE.
    NoInstruction,
    /// The CODE value does not name an instruction.
    UnknownOpcode,
    /// An operand cell had the wrong molecule type or an invalid value.
    BadOperand,
    /// A stack grew past the configured limit.
    StackOverflow,
    /// A pop from an empty stack.
    StackUnderflow,
    /// Division or modulo by zero.
    DivideByZero,
    /// A value had the wrong kind for the operation.
    TypeMismatch,
    /// A coordinate left a bounded grid.
    OutOfBounds,
    /// No owned LABEL matches the jump hash.
    UnknownLabel,
    /// TURN operand is not a unit axis step.
    InvalidDirection,
    /// Not enough energy for the requested transfer.
    InsufficientEnergy,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::NoInstruction => "NO_INSTRUCTION",
            FailureKind::UnknownOpcode => "UNKNOWN_OPCODE",
            FailureKind::BadOperand => "BAD_OPERAND",
            FailureKind::StackOverflow => "STACK_OVERFLOW",
            FailureKind::StackUnderflow => "STACK_UNDERFLOW",
            FailureKind::DivideByZero => "DIVIDE_BY_ZERO",
            FailureKind::TypeMismatch => "TYPE_MISMATCH",
            FailureKind::OutOfBounds => "OUT_OF_BOUNDS",
            FailureKind::UnknownLabel => "UNKNOWN_LABEL",
            FailureKind::InvalidDirection => "INVALID_DIRECTION",
            FailureKind::InsufficientEnergy => "INSUFFICIENT_ENERGY",
        };
        write!(f, "{}", name)
    }
}

/// Operand shapes an instruction can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OperandKind {
    /// One REGISTER cell.
    Reg,
    /// One DATA cell.
    Imm,
    /// `dims` consecutive DATA cells.
    Vec,
    /// One LABELREF cell.
    Lbl,
}

/// A decoded operand.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Operand {
    Reg(RegisterRef),
    Imm(i32),
    Vec(Coord),
    Lbl(i32),
}

macro_rules! opcodes {
    ($(($name:ident, $value:literal, $mnemonic:literal, [$($kind:ident),*]),)*) => {
        /// The instruction set.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum Opcode {
            $(#[doc = $mnemonic] $name,)*
        }

        impl Opcode {
            /// Decodes the value of a CODE molecule.
            pub fn from_value(value: i32) -> Option<Opcode> {
                match value {
                    $($value => Some(Opcode::$name),)*
                    _ => None,
                }
            }

            /// The CODE molecule value of this instruction.
            pub fn value(self) -> i32 {
                match self {
                    $(Opcode::$name => $value,)*
                }
            }

            /// Assembly mnemonic.
            pub fn mnemonic(self) -> &'static str {
                match self {
                    $(Opcode::$name => $mnemonic,)*
                }
            }

            fn operand_kinds(self) -> &'static [OperandKind] {
                match self {
                    $(Opcode::$name => &[$(OperandKind::$kind),*],)*
                }
            }
        }
    };
}

opcodes! {
    (Nop, 0, "NOP", []),
    (Seti, 1, "SETI", [Reg, Imm]),
    (Setv, 2, "SETV", [Reg, Vec]),
    (Cpyr, 3, "CPYR", [Reg, Reg]),
    (Addr, 4, "ADDR", [Reg, Reg]),
    (Subr, 5, "SUBR", [Reg, Reg]),
    (Mulr, 6, "MULR", [Reg, Reg]),
    (Divr, 7, "DIVR", [Reg, Reg]),
    (Modr, 8, "MODR", [Reg, Reg]),
    (Addi, 9, "ADDI", [Reg, Imm]),
    (Subi, 10, "SUBI", [Reg, Imm]),
    (Push, 11, "PUSH", [Reg]),
    (Pop, 12, "POP", [Reg]),
    (Pshi, 13, "PSHI", [Imm]),
    (Dup, 14, "DUP", []),
    (Drop, 15, "DROP", []),
    (Swps, 16, "SWPS", []),
    (Lpsh, 17, "LPSH", []),
    (Lpop, 18, "LPOP", []),
    (Jmpl, 19, "JMPL", [Lbl]),
    (Jmpr, 20, "JMPR", [Vec]),
    (Ifzr, 21, "IFZR", [Reg]),
    (Ifnz, 22, "IFNZ", [Reg]),
    (Iflt, 23, "IFLT", [Reg, Reg]),
    (Call, 24, "CALL", [Lbl]),
    (Ret, 25, "RET", []),
    (Turn, 26, "TURN", [Vec]),
    (Adpi, 27, "ADPI", [Imm]),
    (Seek, 28, "SEEK", [Vec]),
    (Sync, 29, "SYNC", []),
    (Peek, 30, "PEEK", [Reg, Vec]),
    (Poke, 31, "POKE", [Reg, Vec]),
    (Hrvs, 32, "HRVS", [Vec]),
    (Nrgr, 33, "NRGR", [Reg]),
    (Spwn, 34, "SPWN", [Reg, Vec]),
    (Kill, 35, "KILL", []),
    (Mrkr, 36, "MRKR", [Reg]),
    (Gmrk, 37, "GMRK", [Reg]),
    (Entr, 38, "ENTR", [Reg]),
}

/// Maximum number of by-reference CALL parameters.
const MAX_CALL_PARAMS: usize = 4;

/// How execution wants the instruction pointer updated.
enum Flow {
    /// Advance past the instruction and its operands.
    Advance,
    /// The instruction set `ip` itself.
    Jump(Coord),
    /// Advance past this instruction, then also past the next one.
    SkipNext,
}

/// Decoded instruction: opcode, operands, and cells consumed after `ip`.
struct Decoded {
    opcode: Opcode,
    operands: Vec<Operand>,
    consumed: usize,
}

/// Steps one organism by one instruction.
pub(crate) fn step(org: &mut Organism, ctx: &mut StepCtx<'_>) {
    org.clear_failure();

    let decoded = match fetch_and_decode(org, ctx) {
        Ok(decoded) => decoded,
        Err((kind, detail)) => {
            // fetch and decode failures leave ip where it is
            org.fail(kind, detail);
            org.er -= ctx.thermo.error_penalty;
            return;
        }
    };

    let consumed = decoded.consumed;
    match exec::execute(decoded, org, ctx) {
        Ok(Flow::Advance) => {
            org.er -= ctx.thermo.base_cost;
            advance(org, ctx, consumed + 1);
        }
        Ok(Flow::Jump(target)) => {
            org.er -= ctx.thermo.base_cost;
            org.ip = target;
        }
        Ok(Flow::SkipNext) => {
            org.er -= ctx.thermo.base_cost;
            advance(org, ctx, consumed + 1);
            let next_len = instruction_len(org, ctx);
            advance(org, ctx, next_len);
        }
        Err((kind, detail)) => {
            org.fail(kind, detail);
            org.er -= ctx.thermo.error_penalty;
            advance(org, ctx, consumed + 1);
        }
    }
}

fn fetch_and_decode(
    org: &Organism,
    ctx: &StepCtx<'_>,
) -> Result<Decoded, (FailureKind, String)> {
    let molecule = match ctx.read(&org.ip) {
        Ok((molecule, _)) => molecule,
        Err(_) => {
            return Err((
                FailureKind::NoInstruction,
                format!("ip {:?} is outside the grid", org.ip),
            ))
        }
    };
    if molecule.is_empty() || molecule.mol_type != MoleculeType::Code {
        return Err((
            FailureKind::NoInstruction,
            format!("no instruction at {:?}: {}", org.ip, molecule),
        ));
    }
    let opcode = Opcode::from_value(molecule.value).ok_or_else(|| {
        (
            FailureKind::UnknownOpcode,
            format!("opcode {} at {:?}", molecule.value, org.ip),
        )
    })?;

    let mut operands = Vec::with_capacity(opcode.operand_kinds().len());
    let mut offset = 1usize;
    for kind in opcode.operand_kinds() {
        let operand = decode_operand(org, ctx, *kind, &mut offset)?;
        operands.push(operand);
    }
    if opcode == Opcode::Call {
        // trailing REGISTER cells bind actual parameters by reference
        for _ in 0..MAX_CALL_PARAMS {
            match peek_cell(org, ctx, offset) {
                Some(molecule) if molecule.mol_type == MoleculeType::Register => {
                    let reg = RegisterRef::from_index(molecule.value).ok_or_else(|| {
                        (
                            FailureKind::BadOperand,
                            format!("register index {} out of range", molecule.value),
                        )
                    })?;
                    operands.push(Operand::Reg(reg));
                    offset += 1;
                }
                _ => break,
            }
        }
    }
    Ok(Decoded {
        opcode,
        operands,
        consumed: offset - 1,
    })
}

fn decode_operand(
    org: &Organism,
    ctx: &StepCtx<'_>,
    kind: OperandKind,
    offset: &mut usize,
) -> Result<Operand, (FailureKind, String)> {
    let mut next_cell = |expected: MoleculeType| {
        let molecule = peek_cell(org, ctx, *offset).ok_or_else(|| {
            (
                FailureKind::BadOperand,
                format!("operand cell {} is outside the grid", *offset),
            )
        })?;
        if molecule.mol_type != expected {
            return Err((
                FailureKind::BadOperand,
                format!("expected {} operand, found {}", expected, molecule),
            ));
        }
        *offset += 1;
        Ok(molecule.value)
    };
    match kind {
        OperandKind::Reg => {
            let index = next_cell(MoleculeType::Register)?;
            let reg = RegisterRef::from_index(index).ok_or_else(|| {
                (
                    FailureKind::BadOperand,
                    format!("register index {} out of range", index),
                )
            })?;
            Ok(Operand::Reg(reg))
        }
        OperandKind::Imm => Ok(Operand::Imm(next_cell(MoleculeType::Data)?)),
        OperandKind::Lbl => Ok(Operand::Lbl(next_cell(MoleculeType::LabelRef)? & VALUE_MASK as i32)),
        OperandKind::Vec => {
            let mut coord = Vec::with_capacity(ctx.dims);
            for _ in 0..ctx.dims {
                coord.push(next_cell(MoleculeType::Data)?);
            }
            Ok(Operand::Vec(coord))
        }
    }
}

/// Reads the operand cell `offset` steps along `dv`, if it is on the grid.
fn peek_cell(org: &Organism, ctx: &StepCtx<'_>, offset: usize) -> Option<evochora_types::Molecule> {
    let coord = offset_coord(&org.ip, &org.dv, offset as i32);
    ctx.read(&coord).ok().map(|(molecule, _)| molecule)
}

/// Cell count of the instruction at `ip`, for conditional skips.
///
/// A non-instruction cell counts as one, so a false condition in front of
/// garbage still makes progress.
fn instruction_len(org: &Organism, ctx: &StepCtx<'_>) -> usize {
    let Ok((molecule, _)) = ctx.read(&org.ip) else {
        return 1;
    };
    if molecule.is_empty() || molecule.mol_type != MoleculeType::Code {
        return 1;
    }
    let Some(opcode) = Opcode::from_value(molecule.value) else {
        return 1;
    };
    let mut len = 1usize;
    for kind in opcode.operand_kinds() {
        len += match kind {
            OperandKind::Vec => ctx.dims,
            _ => 1,
        };
    }
    if opcode == Opcode::Call {
        for _ in 0..MAX_CALL_PARAMS {
            match peek_cell(org, ctx, len) {
                Some(molecule) if molecule.mol_type == MoleculeType::Register => len += 1,
                _ => break,
            }
        }
    }
    len
}

fn advance(org: &mut Organism, ctx: &StepCtx<'_>, cells: usize) {
    let target = offset_coord(&org.ip, &org.dv, cells as i32);
    // on a bounded grid the ip may leave the world; the next fetch then
    // records NO_INSTRUCTION
    org.ip = ctx.wrap_or_keep(target);
}

fn offset_coord(base: &[i32], dv: &[i32], steps: i32) -> Coord {
    base.iter().zip(dv).map(|(b, d)| b + d * steps).collect()
}

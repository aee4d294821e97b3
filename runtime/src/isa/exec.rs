//! Instruction execution.

use super::{Decoded, FailureKind, Flow, Opcode, Operand};
use crate::organism::{Organism, ProcFrame, RegisterRef, Value};
use crate::scheduler::StepCtx;
use evochora_types::{Coord, Molecule, MoleculeType};

type ExecResult = Result<Flow, (FailureKind, String)>;

pub(super) fn execute(decoded: Decoded, org: &mut Organism, ctx: &mut StepCtx<'_>) -> ExecResult {
    use Opcode::*;
    let Decoded {
        opcode,
        operands,
        consumed,
    } = decoded;
    match opcode {
        Nop => Ok(Flow::Advance),
        Seti => {
            let (reg, imm) = reg_imm(&operands);
            set_register(org, reg, Value::Molecule(Molecule::new(MoleculeType::Data, imm)))
        }
        Setv => {
            let (reg, vec) = reg_vec(&operands);
            set_register(org, reg, Value::Vector(vec))
        }
        Cpyr => {
            let (dst, src) = reg_reg(&operands);
            let value = org.register(src);
            set_register(org, dst, value)
        }
        Addr => binary(org, &operands, |a, b| Ok(a.wrapping_add(b)), true),
        Subr => binary(org, &operands, |a, b| Ok(a.wrapping_sub(b)), true),
        Mulr => binary(org, &operands, |a, b| Ok(a.wrapping_mul(b)), false),
        Divr => binary(org, &operands, checked(i32::checked_div), false),
        Modr => binary(org, &operands, checked(i32::checked_rem), false),
        Addi => immediate(org, &operands, i32::wrapping_add),
        Subi => immediate(org, &operands, i32::wrapping_sub),
        Push => {
            let reg = reg0(&operands);
            let value = org.register(reg);
            push_data(org, ctx, value)
        }
        Pop => {
            let reg = reg0(&operands);
            let value = org
                .data_stack
                .pop()
                .ok_or((FailureKind::StackUnderflow, "data stack is empty".into()))?;
            set_register(org, reg, value)
        }
        Pshi => {
            let imm = imm0(&operands);
            push_data(org, ctx, Value::Molecule(Molecule::new(MoleculeType::Data, imm)))
        }
        Dup => {
            let top = org
                .data_stack
                .last()
                .cloned()
                .ok_or((FailureKind::StackUnderflow, "data stack is empty".into()))?;
            push_data(org, ctx, top)
        }
        Drop => {
            org.data_stack
                .pop()
                .ok_or((FailureKind::StackUnderflow, "data stack is empty".into()))?;
            Ok(Flow::Advance)
        }
        Swps => {
            let len = org.data_stack.len();
            if len < 2 {
                return Err((FailureKind::StackUnderflow, "need two stack values".into()));
            }
            org.data_stack.swap(len - 1, len - 2);
            Ok(Flow::Advance)
        }
        Lpsh => {
            if org.location_stack.len() >= ctx.stack_limit {
                return Err((FailureKind::StackOverflow, "location stack is full".into()));
            }
            let dp = org.active_dp().clone();
            org.location_stack.push(dp);
            Ok(Flow::Advance)
        }
        Lpop => {
            let coord = org
                .location_stack
                .pop()
                .ok_or((FailureKind::StackUnderflow, "location stack is empty".into()))?;
            let active = org.active_dp_index;
            org.dps[active] = coord;
            Ok(Flow::Advance)
        }
        Jmpl => {
            let hash = lbl0(&operands);
            jump_to_label(org, ctx, hash)
        }
        Jmpr => {
            let vec = vec0(&operands);
            let target = offset(&org.ip, &vec);
            Ok(Flow::Jump(ctx.wrap_or_keep(target)))
        }
        Ifzr => conditional(org, &operands, |v| v == 0),
        Ifnz => conditional(org, &operands, |v| v != 0),
        Iflt => {
            let (a, b) = reg_reg(&operands);
            let a = molecule_value(org, a)?;
            let b = molecule_value(org, b)?;
            Ok(if a < b { Flow::Advance } else { Flow::SkipNext })
        }
        Call => call(org, ctx, &operands, consumed),
        Ret => ret(org),
        Turn => {
            let vec = vec0(&operands);
            let nonzero: Vec<&i32> = vec.iter().filter(|v| **v != 0).collect();
            if nonzero.len() != 1 || nonzero[0].abs() != 1 {
                return Err((
                    FailureKind::InvalidDirection,
                    format!("{:?} is not a unit axis step", vec),
                ));
            }
            org.dv = vec;
            Ok(Flow::Advance)
        }
        Adpi => {
            let imm = imm0(&operands);
            if imm < 0 || imm as usize >= org.dps.len() {
                return Err((
                    FailureKind::BadOperand,
                    format!("data pointer index {} out of range", imm),
                ));
            }
            org.active_dp_index = imm as usize;
            Ok(Flow::Advance)
        }
        Seek => {
            let vec = vec0(&operands);
            let target = offset(org.active_dp(), &vec);
            let wrapped = ctx
                .wrap(&target)
                .map_err(|_| (FailureKind::OutOfBounds, format!("seek to {:?}", target)))?;
            let active = org.active_dp_index;
            org.dps[active] = wrapped;
            Ok(Flow::Advance)
        }
        Sync => {
            let active = org.active_dp_index;
            org.dps[active] = org.ip.clone();
            Ok(Flow::Advance)
        }
        Peek => {
            let (reg, vec) = reg_vec(&operands);
            let coord = offset(org.active_dp(), &vec);
            let (molecule, _) = ctx
                .read(&coord)
                .map_err(|_| (FailureKind::OutOfBounds, format!("peek at {:?}", coord)))?;
            set_register(org, reg, Value::Molecule(molecule))
        }
        Poke => {
            let (reg, vec) = reg_vec(&operands);
            let molecule = match org.register(reg) {
                Value::Molecule(molecule) => molecule,
                Value::Vector(_) => {
                    return Err((FailureKind::TypeMismatch, "POKE needs a molecule".into()))
                }
            };
            let coord = offset(org.active_dp(), &vec);
            ctx.write(&coord, molecule, org.id)
                .map_err(|_| (FailureKind::OutOfBounds, format!("poke at {:?}", coord)))?;
            org.sr += ctx.thermo.entropy_per_write;
            Ok(Flow::Advance)
        }
        Hrvs => {
            let vec = vec0(&operands);
            let coord = offset(org.active_dp(), &vec);
            let (molecule, _) = ctx
                .read(&coord)
                .map_err(|_| (FailureKind::OutOfBounds, format!("harvest at {:?}", coord)))?;
            if molecule.mol_type != MoleculeType::Energy {
                return Err((
                    FailureKind::TypeMismatch,
                    format!("harvest found {} at {:?}", molecule, coord),
                ));
            }
            org.er = (org.er.saturating_add(molecule.value)).min(org.max_energy);
            ctx.write(&coord, Molecule::EMPTY, org.id)
                .map_err(|_| (FailureKind::OutOfBounds, format!("harvest at {:?}", coord)))?;
            org.sr += ctx.thermo.entropy_per_write;
            Ok(Flow::Advance)
        }
        Nrgr => {
            let reg = reg0(&operands);
            let er = org.er;
            set_register(org, reg, Value::Molecule(Molecule::new(MoleculeType::Data, er)))
        }
        Spwn => {
            let (reg, vec) = reg_vec(&operands);
            let energy = molecule_value(org, reg)?;
            if energy <= 0 {
                return Err((
                    FailureKind::BadOperand,
                    format!("child energy {} must be positive", energy),
                ));
            }
            if energy > org.er {
                return Err((
                    FailureKind::InsufficientEnergy,
                    format!("child needs {}, parent has {}", energy, org.er),
                ));
            }
            let target = offset(&org.ip, &vec);
            let position = ctx
                .wrap(&target)
                .map_err(|_| (FailureKind::OutOfBounds, format!("spawn at {:?}", target)))?;
            org.er -= energy;
            ctx.spawn(position, energy, org.dv.clone());
            Ok(Flow::Advance)
        }
        Kill => {
            org.kill_requested = true;
            Ok(Flow::Advance)
        }
        Mrkr => {
            let reg = reg0(&operands);
            org.mr = molecule_value(org, reg)?;
            Ok(Flow::Advance)
        }
        Gmrk => {
            let reg = reg0(&operands);
            let mr = org.mr;
            set_register(org, reg, Value::Molecule(Molecule::new(MoleculeType::Data, mr)))
        }
        Entr => {
            let reg = reg0(&operands);
            let sr = org.sr;
            set_register(org, reg, Value::Molecule(Molecule::new(MoleculeType::Data, sr)))
        }
    }
}

// Operand accessors. Decoding guarantees the shapes, so these only
// destructure.

fn reg0(operands: &[Operand]) -> RegisterRef {
    match &operands[0] {
        Operand::Reg(reg) => *reg,
        other => unreachable!("decoder produced {:?} for a register slot", other),
    }
}

fn imm0(operands: &[Operand]) -> i32 {
    match &operands[0] {
        Operand::Imm(imm) => *imm,
        other => unreachable!("decoder produced {:?} for an immediate slot", other),
    }
}

fn lbl0(operands: &[Operand]) -> i32 {
    match &operands[0] {
        Operand::Lbl(hash) => *hash,
        other => unreachable!("decoder produced {:?} for a label slot", other),
    }
}

fn vec0(operands: &[Operand]) -> Coord {
    match &operands[0] {
        Operand::Vec(vec) => vec.clone(),
        other => unreachable!("decoder produced {:?} for a vector slot", other),
    }
}

fn reg_imm(operands: &[Operand]) -> (RegisterRef, i32) {
    match (&operands[0], &operands[1]) {
        (Operand::Reg(reg), Operand::Imm(imm)) => (*reg, *imm),
        other => unreachable!("decoder produced {:?}", other),
    }
}

fn reg_vec(operands: &[Operand]) -> (RegisterRef, Coord) {
    match (&operands[0], &operands[1]) {
        (Operand::Reg(reg), Operand::Vec(vec)) => (*reg, vec.clone()),
        other => unreachable!("decoder produced {:?}", other),
    }
}

fn reg_reg(operands: &[Operand]) -> (RegisterRef, RegisterRef) {
    match (&operands[0], &operands[1]) {
        (Operand::Reg(a), Operand::Reg(b)) => (*a, *b),
        other => unreachable!("decoder produced {:?}", other),
    }
}

fn set_register(org: &mut Organism, reg: RegisterRef, value: Value) -> ExecResult {
    org.set_register(reg, value)
        .map_err(|kind| (kind, format!("cannot store into {}", reg)))?;
    Ok(Flow::Advance)
}

fn molecule_value(org: &Organism, reg: RegisterRef) -> Result<i32, (FailureKind, String)> {
    match org.register(reg) {
        Value::Molecule(molecule) => Ok(molecule.value),
        Value::Vector(_) => Err((
            FailureKind::TypeMismatch,
            format!("{} holds a vector, expected a molecule", reg),
        )),
    }
}

fn checked(
    f: impl Fn(i32, i32) -> Option<i32>,
) -> impl Fn(i32, i32) -> Result<i32, (FailureKind, String)> {
    move |a, b| {
        f(a, b).ok_or((
            FailureKind::DivideByZero,
            format!("{} with zero divisor", a),
        ))
    }
}

/// Register-register arithmetic. Molecules combine on their values,
/// preserving the destination's type; vectors combine axis-wise when the
/// operation allows it.
fn binary(
    org: &mut Organism,
    operands: &[Operand],
    f: impl Fn(i32, i32) -> Result<i32, (FailureKind, String)>,
    vectors_allowed: bool,
) -> ExecResult {
    let (dst, src) = reg_reg(operands);
    let result = match (org.register(dst), org.register(src)) {
        (Value::Molecule(a), Value::Molecule(b)) => {
            Value::Molecule(Molecule::new(a.mol_type, f(a.value, b.value)?))
        }
        (Value::Vector(a), Value::Vector(b)) if vectors_allowed && a.len() == b.len() => {
            let mut out = Vec::with_capacity(a.len());
            for (x, y) in a.iter().zip(&b) {
                out.push(f(*x, *y)?);
            }
            Value::Vector(out)
        }
        (a, b) => {
            return Err((
                FailureKind::TypeMismatch,
                format!("cannot combine {} and {}", a, b),
            ))
        }
    };
    set_register(org, dst, result)
}

fn immediate(org: &mut Organism, operands: &[Operand], f: impl Fn(i32, i32) -> i32) -> ExecResult {
    let (dst, imm) = reg_imm(operands);
    let result = match org.register(dst) {
        Value::Molecule(a) => Value::Molecule(Molecule::new(a.mol_type, f(a.value, imm))),
        Value::Vector(_) => {
            return Err((
                FailureKind::TypeMismatch,
                format!("{} holds a vector, expected a molecule", dst),
            ))
        }
    };
    set_register(org, dst, result)
}

fn conditional(org: &Organism, operands: &[Operand], pass: impl Fn(i32) -> bool) -> ExecResult {
    let value = molecule_value(org, reg0(operands))?;
    Ok(if pass(value) {
        Flow::Advance
    } else {
        Flow::SkipNext
    })
}

fn push_data(org: &mut Organism, ctx: &StepCtx<'_>, value: Value) -> ExecResult {
    if org.data_stack.len() >= ctx.stack_limit {
        return Err((FailureKind::StackOverflow, "data stack is full".into()));
    }
    org.data_stack.push(value);
    Ok(Flow::Advance)
}

/// Resolves a label hash to the owned LABEL cell and resumes at the cell
/// after it along the current direction vector.
fn jump_to_label(org: &Organism, ctx: &StepCtx<'_>, hash: i32) -> ExecResult {
    let label = ctx
        .find_label(hash)
        .ok_or((FailureKind::UnknownLabel, format!("label {:#x}", hash)))?;
    let target = offset(&label, &org.dv);
    Ok(Flow::Jump(ctx.wrap_or_keep(target)))
}

fn call(
    org: &mut Organism,
    ctx: &StepCtx<'_>,
    operands: &[Operand],
    consumed: usize,
) -> ExecResult {
    if org.call_stack.len() >= ctx.stack_limit {
        return Err((FailureKind::StackOverflow, "call stack is full".into()));
    }
    let hash = lbl0(operands);
    let label = ctx
        .find_label(hash)
        .ok_or((FailureKind::UnknownLabel, format!("label {:#x}", hash)))?;

    let mut register_remap = Vec::new();
    let mut bound_fprs = org.fpr.clone();
    for (slot, operand) in operands[1..].iter().enumerate() {
        let Operand::Reg(caller_reg) = operand else {
            unreachable!("CALL trailing operands are registers");
        };
        bound_fprs[slot] = org.register(*caller_reg);
        register_remap.push((slot, *caller_reg));
    }

    let return_ip = {
        let past = super::offset_coord(&org.ip, &org.dv, consumed as i32 + 1);
        ctx.wrap_or_keep(past)
    };
    org.call_stack.push(ProcFrame {
        label: hash,
        return_ip,
        saved_dv: org.dv.clone(),
        saved_prs: org.pr.clone(),
        saved_fprs: org.fpr.clone(),
        register_remap,
    });
    org.fpr = bound_fprs;

    let target = offset(&label, &org.dv);
    Ok(Flow::Jump(ctx.wrap_or_keep(target)))
}

fn ret(org: &mut Organism) -> ExecResult {
    let frame = org
        .call_stack
        .pop()
        .ok_or((FailureKind::StackUnderflow, "call stack is empty".into()))?;
    // validate the write-backs before mutating anything, so a bad remap
    // leaves the frame intact
    for (slot, caller_reg) in &frame.register_remap {
        if matches!(caller_reg, RegisterRef::Lr(_))
            && !matches!(org.fpr[*slot], Value::Vector(_))
        {
            let detail = format!("{} cannot receive {}", caller_reg, org.fpr[*slot]);
            org.call_stack.push(frame);
            return Err((FailureKind::TypeMismatch, detail));
        }
    }
    for (slot, caller_reg) in &frame.register_remap {
        let value = org.fpr[*slot].clone();
        org.set_register(*caller_reg, value)
            .expect("write-back targets validated above");
    }
    org.pr = frame.saved_prs;
    org.fpr = frame.saved_fprs;
    org.dv = frame.saved_dv;
    Ok(Flow::Jump(frame.return_ip))
}

fn offset(base: &[i32], vec: &[i32]) -> Coord {
    base.iter().zip(vec).map(|(b, v)| b + v).collect()
}

//! Per-organism state.

use crate::isa::FailureKind;
use crate::DP_COUNT;
use evochora_logger::warn;
use evochora_protocol::OrganismState;
use evochora_types::{Coord, Molecule, OrganismId};
use std::fmt;
use thiserror::Error;

/// A register or stack value: a molecule or a coordinate vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// A typed scalar, without owner bits.
    Molecule(Molecule),
    /// A coordinate vector.
    Vector(Coord),
}

impl Default for Value {
    fn default() -> Self {
        Value::Molecule(Molecule::EMPTY)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Molecule(mol) => write!(f, "{}", mol),
            Value::Vector(vec) => write!(f, "{:?}", vec),
        }
    }
}

/// Addresses one slot across the four register banks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterRef {
    /// Data register, slots 0..8.
    Dr(usize),
    /// Procedure register, slots 0..4.
    Pr(usize),
    /// Formal parameter register, slots 0..4.
    Fpr(usize),
    /// Location register, slots 0..4; always holds a vector.
    Lr(usize),
}

impl RegisterRef {
    /// Decodes the wire index used by REGISTER operand molecules:
    /// 0..8 `dr`, 8..12 `pr`, 12..16 `fpr`, 16..20 `lr`.
    pub fn from_index(index: i32) -> Option<RegisterRef> {
        match index {
            0..=7 => Some(RegisterRef::Dr(index as usize)),
            8..=11 => Some(RegisterRef::Pr(index as usize - 8)),
            12..=15 => Some(RegisterRef::Fpr(index as usize - 12)),
            16..=19 => Some(RegisterRef::Lr(index as usize - 16)),
            _ => None,
        }
    }
}

impl fmt::Display for RegisterRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterRef::Dr(i) => write!(f, "%DR{}", i),
            RegisterRef::Pr(i) => write!(f, "%PR{}", i),
            RegisterRef::Fpr(i) => write!(f, "%FPR{}", i),
            RegisterRef::Lr(i) => write!(f, "%LR{}", i),
        }
    }
}

/// A procedure call frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcFrame {
    /// Label hash of the called procedure.
    pub label: i32,
    /// Instruction pointer to restore on RET.
    pub return_ip: Coord,
    /// Direction vector to restore on RET.
    pub saved_dv: Coord,
    /// Caller's procedure registers.
    pub saved_prs: [Value; 4],
    /// Caller's formal parameter registers.
    pub saved_fprs: [Value; 4],
    /// Formal parameter slot → caller register written back on RET.
    pub register_remap: Vec<(usize, RegisterRef)>,
}

/// One failure recorded by the ISA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    /// Failure class; its display form is the canonical reason string.
    pub kind: FailureKind,
    /// Human-readable context.
    pub detail: String,
}

/// The full mutable state of one organism.
///
/// Once `is_dead` is set the scheduler never touches the record again.
#[derive(Debug, Clone, PartialEq)]
pub struct Organism {
    /// Stable identity, unique within a run.
    pub id: OrganismId,
    /// Parent id; 0 for seeded organisms.
    pub parent_id: OrganismId,
    /// Tick the organism was created.
    pub birth_tick: i64,
    /// Identity of the program artifact this lineage was seeded from.
    pub program_id: String,
    /// Birth cell; never changes.
    pub initial_position: Coord,
    /// Instruction pointer.
    pub ip: Coord,
    /// Direction vector: a unit step on one axis.
    pub dv: Coord,
    /// Energy register.
    pub er: i32,
    /// Entropy register.
    pub sr: i32,
    /// Marker register.
    pub mr: i32,
    /// Energy ceiling applied by harvesting.
    pub max_energy: i32,
    /// Data registers.
    pub dr: [Value; 8],
    /// Procedure registers.
    pub pr: [Value; 4],
    /// Formal parameter registers.
    pub fpr: [Value; 4],
    /// Location registers.
    pub lr: [Coord; 4],
    /// Heterogeneous data stack.
    pub data_stack: Vec<Value>,
    /// Vector stack.
    pub location_stack: Vec<Coord>,
    /// Procedure frames.
    pub call_stack: Vec<ProcFrame>,
    /// Data pointers.
    pub dps: Vec<Coord>,
    /// Which data pointer SEEK/PEEK/POKE address.
    pub active_dp_index: usize,
    /// Set when the last executed instruction failed.
    pub instruction_failed: bool,
    /// Failure details of the last failed instruction.
    pub last_failure: Option<Failure>,
    /// Terminal flag; never cleared.
    pub is_dead: bool,
    /// KILL was executed this tick; the scheduler records the death.
    pub kill_requested: bool,
    /// Content hash of the owned genome, refreshed by the capture layer.
    pub genome_hash: u64,
}

impl Organism {
    /// Creates a live organism at `birth_cell`.
    pub fn create(
        id: OrganismId,
        parent_id: OrganismId,
        birth_tick: i64,
        program_id: String,
        birth_cell: Coord,
        dv: Coord,
        initial_energy: i32,
        max_energy: i32,
    ) -> Organism {
        let dims = birth_cell.len();
        Organism {
            id,
            parent_id,
            birth_tick,
            program_id,
            initial_position: birth_cell.clone(),
            ip: birth_cell.clone(),
            dv,
            er: initial_energy,
            sr: 0,
            mr: 0,
            max_energy,
            dr: Default::default(),
            pr: Default::default(),
            fpr: Default::default(),
            lr: std::array::from_fn(|_| vec![0; dims]),
            data_stack: Vec::new(),
            location_stack: Vec::new(),
            call_stack: Vec::new(),
            dps: vec![birth_cell; DP_COUNT],
            active_dp_index: 0,
            instruction_failed: false,
            last_failure: None,
            is_dead: false,
            kill_requested: false,
            genome_hash: 0,
        }
    }

    /// Starts a restore of a checkpointed organism.
    pub fn restore(id: OrganismId, birth_tick: i64) -> OrganismRestorer {
        OrganismRestorer::new(id, birth_tick)
    }

    /// Reads a register.
    pub fn register(&self, reg: RegisterRef) -> Value {
        match reg {
            RegisterRef::Dr(i) => self.dr[i].clone(),
            RegisterRef::Pr(i) => self.pr[i].clone(),
            RegisterRef::Fpr(i) => self.fpr[i].clone(),
            RegisterRef::Lr(i) => Value::Vector(self.lr[i].clone()),
        }
    }

    /// Writes a register. Location registers only accept vectors.
    pub fn set_register(&mut self, reg: RegisterRef, value: Value) -> Result<(), FailureKind> {
        match (reg, value) {
            (RegisterRef::Dr(i), value) => self.dr[i] = value,
            (RegisterRef::Pr(i), value) => self.pr[i] = value,
            (RegisterRef::Fpr(i), value) => self.fpr[i] = value,
            (RegisterRef::Lr(i), Value::Vector(coord)) => self.lr[i] = coord,
            (RegisterRef::Lr(_), Value::Molecule(_)) => return Err(FailureKind::TypeMismatch),
        }
        Ok(())
    }

    /// The currently active data pointer.
    pub fn active_dp(&self) -> &Coord {
        &self.dps[self.active_dp_index]
    }

    /// Records a local instruction failure.
    pub fn fail(&mut self, kind: FailureKind, detail: impl Into<String>) {
        self.instruction_failed = true;
        self.last_failure = Some(Failure {
            kind,
            detail: detail.into(),
        });
    }

    /// Clears the per-tick failure flag before a step.
    pub fn clear_failure(&mut self) {
        self.instruction_failed = false;
    }

    /// The canonical reason string of the last failure, if any.
    pub fn failure_reason(&self) -> Option<String> {
        self.last_failure.as_ref().map(|f| f.kind.to_string())
    }

    /// Marks the organism dead. Terminal.
    pub fn die(&mut self) {
        self.is_dead = true;
    }

    /// Converts to the wire representation.
    pub fn to_state(&self, total_dims: usize) -> OrganismState {
        debug_assert_eq!(self.ip.len(), total_dims);
        OrganismState {
            id: self.id,
            parent_id: self.parent_id,
            birth_tick: self.birth_tick,
            program_id: self.program_id.clone(),
            energy: self.er,
            entropy: self.sr,
            marker: self.mr,
            max_energy: self.max_energy,
            ip: self.ip.clone(),
            dv: self.dv.clone(),
            initial_position: self.initial_position.clone(),
            dp_coords: self.dps.iter().flatten().copied().collect(),
            active_dp_index: self.active_dp_index as i32,
            is_dead: self.is_dead,
            instruction_failed: self.instruction_failed,
            failure_reason: self.failure_reason().unwrap_or_default(),
            genome_hash: self.genome_hash,
        }
    }
}

/// Restore validation failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RestoreError {
    /// A required field was never supplied.
    #[error("organism {id} restore is missing {field}")]
    MissingField {
        /// Organism being restored.
        id: OrganismId,
        /// Name of the absent field.
        field: &'static str,
    },
    /// IP, DV, and initial position must share one dimensionality.
    #[error("organism {id} restore has mismatched dimensions")]
    DimensionMismatch {
        /// Organism being restored.
        id: OrganismId,
    },
}

/// Builder used by checkpoint load.
///
/// All slices are copied so restored state never aliases the caller's
/// buffers. Negative energy or entropy is preserved with a warning.
#[derive(Debug, Default)]
pub struct OrganismRestorer {
    id: OrganismId,
    birth_tick: i64,
    parent_id: OrganismId,
    program_id: String,
    initial_position: Option<Coord>,
    ip: Option<Coord>,
    dv: Option<Coord>,
    er: i32,
    sr: i32,
    mr: i32,
    max_energy: i32,
    dps: Option<Vec<Coord>>,
    active_dp_index: usize,
    is_dead: bool,
    genome_hash: u64,
}

impl OrganismRestorer {
    fn new(id: OrganismId, birth_tick: i64) -> OrganismRestorer {
        OrganismRestorer {
            id,
            birth_tick,
            ..Default::default()
        }
    }

    /// Parent organism id.
    pub fn parent_id(mut self, parent_id: OrganismId) -> Self {
        self.parent_id = parent_id;
        self
    }

    /// Program artifact id.
    pub fn program_id(mut self, program_id: &str) -> Self {
        self.program_id = program_id.to_owned();
        self
    }

    /// Birth cell. Required.
    pub fn initial_position(mut self, coord: &[i32]) -> Self {
        self.initial_position = Some(coord.to_vec());
        self
    }

    /// Instruction pointer. Required.
    pub fn ip(mut self, coord: &[i32]) -> Self {
        self.ip = Some(coord.to_vec());
        self
    }

    /// Direction vector. Required.
    pub fn dv(mut self, coord: &[i32]) -> Self {
        self.dv = Some(coord.to_vec());
        self
    }

    /// Energy, entropy, and marker registers.
    pub fn registers(mut self, er: i32, sr: i32, mr: i32) -> Self {
        self.er = er;
        self.sr = sr;
        self.mr = mr;
        self
    }

    /// Energy ceiling.
    pub fn max_energy(mut self, max_energy: i32) -> Self {
        self.max_energy = max_energy;
        self
    }

    /// Data pointers and the active index.
    pub fn data_pointers(mut self, dps: &[Coord], active: usize) -> Self {
        self.dps = Some(dps.to_vec());
        self.active_dp_index = active;
        self
    }

    /// Terminal flag.
    pub fn dead(mut self, is_dead: bool) -> Self {
        self.is_dead = is_dead;
        self
    }

    /// Last computed genome hash.
    pub fn genome_hash(mut self, genome_hash: u64) -> Self {
        self.genome_hash = genome_hash;
        self
    }

    /// Validates and builds the organism.
    pub fn build(self) -> Result<Organism, RestoreError> {
        let id = self.id;
        let missing = move |field| RestoreError::MissingField { id, field };
        let initial_position = self
            .initial_position
            .ok_or_else(|| missing("initial_position"))?;
        let ip = self.ip.ok_or_else(|| missing("ip"))?;
        let dv = self.dv.ok_or_else(|| missing("dv"))?;
        if ip.len() != dv.len() || ip.len() != initial_position.len() {
            return Err(RestoreError::DimensionMismatch { id: self.id });
        }
        if self.er < 0 || self.sr < 0 {
            warn!(
                "restoring organism {} with negative energy {} / entropy {}",
                self.id, self.er, self.sr
            );
        }
        let dims = ip.len();
        let dps = self
            .dps
            .filter(|dps| !dps.is_empty() && dps.iter().all(|dp| dp.len() == dims))
            .unwrap_or_else(|| vec![initial_position.clone(); DP_COUNT]);
        let active_dp_index = self.active_dp_index.min(dps.len() - 1);
        let mut organism = Organism::create(
            self.id,
            self.parent_id,
            self.birth_tick,
            self.program_id,
            initial_position,
            dv,
            self.er,
            self.max_energy,
        );
        organism.ip = ip;
        organism.sr = self.sr;
        organism.mr = self.mr;
        organism.dps = dps;
        organism.active_dp_index = active_dp_index;
        organism.is_dead = self.is_dead;
        organism.genome_hash = self.genome_hash;
        Ok(organism)
    }
}

/// Restores an organism from its wire state, given the world dimensionality.
pub fn from_state(state: &OrganismState, dims: usize) -> Result<Organism, RestoreError> {
    let dps: Vec<Coord> = if dims > 0 && state.dp_coords.len() % dims == 0 {
        state.dp_coords.chunks(dims).map(<[i32]>::to_vec).collect()
    } else {
        Vec::new()
    };
    Organism::restore(state.id, state.birth_tick)
        .parent_id(state.parent_id)
        .program_id(&state.program_id)
        .initial_position(&state.initial_position)
        .ip(&state.ip)
        .dv(&state.dv)
        .registers(state.energy, state.entropy, state.marker)
        .max_energy(state.max_energy)
        .data_pointers(&dps, state.active_dp_index as usize)
        .dead(state.is_dead)
        .genome_hash(state.genome_hash)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use evochora_types::MoleculeType;

    #[test]
    fn restore_requires_position_fields() {
        let err = Organism::restore(3, 10).ip(&[1, 2]).dv(&[1, 0]).build();
        assert_eq!(
            err,
            Err(RestoreError::MissingField {
                id: 3,
                field: "initial_position"
            })
        );
    }

    #[test]
    fn restore_rejects_mixed_dimensions() {
        let err = Organism::restore(3, 10)
            .initial_position(&[1, 2, 3])
            .ip(&[1, 2])
            .dv(&[1, 0])
            .build();
        assert_eq!(err, Err(RestoreError::DimensionMismatch { id: 3 }));
    }

    #[test]
    fn restore_preserves_negative_energy() {
        let organism = Organism::restore(3, 10)
            .initial_position(&[0, 0])
            .ip(&[0, 0])
            .dv(&[1, 0])
            .registers(-5, -1, 0)
            .build()
            .unwrap();
        assert_eq!(organism.er, -5);
        assert_eq!(organism.sr, -1);
    }

    #[test]
    fn restore_copies_data_pointers() {
        let dps = vec![vec![1, 1], vec![2, 2]];
        let organism = Organism::restore(1, 0)
            .initial_position(&[0, 0])
            .ip(&[0, 0])
            .dv(&[0, 1])
            .data_pointers(&dps, 1)
            .build()
            .unwrap();
        assert_eq!(organism.dps, dps);
        assert_eq!(organism.active_dp_index, 1);
    }

    #[test]
    fn location_registers_reject_molecules() {
        let mut organism = Organism::create(1, 0, 0, String::new(), vec![0, 0], vec![1, 0], 10, 100);
        let err = organism.set_register(
            RegisterRef::Lr(0),
            Value::Molecule(Molecule::new(MoleculeType::Data, 1)),
        );
        assert_eq!(err, Err(FailureKind::TypeMismatch));
    }

    #[test]
    fn wire_round_trip() {
        let mut organism =
            Organism::create(7, 2, 42, "prog".into(), vec![3, 4], vec![0, 1], 55, 100);
        organism.mr = 9;
        let state = organism.to_state(2);
        let restored = from_state(&state, 2).unwrap();
        assert_eq!(restored.id, 7);
        assert_eq!(restored.ip, vec![3, 4]);
        assert_eq!(restored.mr, 9);
        assert_eq!(restored.dps.len(), DP_COUNT);
    }
}

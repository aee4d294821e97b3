//! Instruction-level behaviour, driven through whole ticks.

use super::*;
use crate::{FailureKind, Opcode, Value};
use evochora_types::label_hash;

fn new_sim(parallelism: usize) -> Simulation {
    Simulation::new(
        config(&[20, 20], TopologyKind::Bounded, parallelism),
        "run-isa",
    )
}

fn dr0_value(sim: &Simulation) -> i32 {
    match &sim.organisms()[0].dr[0] {
        Value::Molecule(molecule) => molecule.value,
        Value::Vector(vec) => panic!("dr0 holds a vector {:?}", vec),
    }
}

#[test]
fn empty_step_records_no_instruction() {
    let mut sim = new_sim(2);
    lone_organism(&mut sim, &[10, 10], 100);
    sim.tick();

    let organism = &sim.organisms()[0];
    assert!(organism.instruction_failed);
    assert_eq!(organism.failure_reason().as_deref(), Some("NO_INSTRUCTION"));
    // the error penalty was charged and the ip did not move
    assert_eq!(organism.er, 100 - 5);
    assert_eq!(organism.ip, vec![10, 10]);
    assert!(!organism.is_dead);
}

#[test]
fn seti_and_addi_update_a_data_register() {
    let mut sim = new_sim(2);
    let program = row_program(
        "arith",
        &[
            code(Opcode::Seti.value()),
            register(0),
            data(7),
            code(Opcode::Addi.value()),
            register(0),
            data(5),
        ],
    );
    sim.spawn_program(&program, &[0, 0], 100).unwrap();

    sim.tick();
    assert_eq!(dr0_value(&sim), 7);
    sim.tick();
    assert_eq!(dr0_value(&sim), 12);
    assert_eq!(sim.organisms()[0].er, 100 - 2);
}

#[test]
fn division_by_zero_is_a_local_failure() {
    let mut sim = new_sim(2);
    // DR0 := 4; DR1 stays 0; DIVR DR0, DR1
    let program = row_program(
        "divzero",
        &[
            code(Opcode::Seti.value()),
            register(0),
            data(4),
            code(Opcode::Divr.value()),
            register(0),
            register(1),
        ],
    );
    sim.spawn_program(&program, &[0, 0], 100).unwrap();
    sim.tick();
    sim.tick();

    let organism = &sim.organisms()[0];
    assert!(organism.instruction_failed);
    assert_eq!(organism.failure_reason().as_deref(), Some("DIVIDE_BY_ZERO"));
    assert!(!organism.is_dead);
    // execution failures advance past the instruction
    assert_eq!(organism.ip, vec![6, 0]);
}

#[test]
fn jump_resumes_after_the_owned_label() {
    let mut sim = new_sim(2);
    let program = row_program(
        "jump",
        &[
            code(Opcode::Jmpl.value()),
            Molecule::new(MoleculeType::LabelRef, label_hash("loop")),
            code(Opcode::Nop.value()),
            Molecule::new(MoleculeType::Label, label_hash("loop")),
            code(Opcode::Seti.value()),
            register(0),
            data(9),
        ],
    );
    sim.spawn_program(&program, &[0, 0], 100).unwrap();

    sim.tick();
    assert_eq!(sim.organisms()[0].ip, vec![4, 0]);
    sim.tick();
    assert_eq!(dr0_value(&sim), 9);
}

#[test]
fn jump_to_a_foreign_label_fails() {
    let mut sim = new_sim(2);
    let program = row_program(
        "nolabel",
        &[
            code(Opcode::Jmpl.value()),
            Molecule::new(MoleculeType::LabelRef, label_hash("elsewhere")),
        ],
    );
    sim.spawn_program(&program, &[0, 0], 100).unwrap();
    // the label exists but belongs to nobody we own
    sim.environment()
        .set(
            &[10, 10],
            Molecule::new(MoleculeType::Label, label_hash("elsewhere")),
            0,
        )
        .unwrap();
    sim.tick();

    let organism = &sim.organisms()[0];
    assert!(organism.instruction_failed);
    assert_eq!(organism.failure_reason().as_deref(), Some("UNKNOWN_LABEL"));
}

#[test]
fn conditional_skips_the_whole_next_instruction() {
    let mut sim = new_sim(2);
    // DR0 is non-zero, so IFZR skips the 3-cell SETI and runs the final one
    let program = row_program(
        "cond",
        &[
            code(Opcode::Seti.value()),
            register(0),
            data(1),
            code(Opcode::Ifzr.value()),
            register(0),
            code(Opcode::Seti.value()),
            register(1),
            data(111),
            code(Opcode::Seti.value()),
            register(2),
            data(222),
        ],
    );
    sim.spawn_program(&program, &[0, 0], 100).unwrap();
    sim.tick(); // SETI DR0, 1
    sim.tick(); // IFZR skips the next instruction
    assert_eq!(sim.organisms()[0].ip, vec![8, 0]);
    sim.tick(); // SETI DR2, 222

    let organism = &sim.organisms()[0];
    assert_eq!(organism.dr[1], Value::default());
    assert!(matches!(&organism.dr[2], Value::Molecule(m) if m.value == 222));
}

#[test]
fn call_binds_parameters_and_ret_writes_them_back() {
    let mut sim = new_sim(2);
    let program = row_program(
        "proc",
        &[
            code(Opcode::Call.value()),
            Molecule::new(MoleculeType::LabelRef, label_hash("bump")),
            register(0),
            code(Opcode::Nop.value()),
            Molecule::new(MoleculeType::Label, label_hash("bump")),
            code(Opcode::Addi.value()),
            register(12), // %FPR0
            data(5),
            code(Opcode::Ret.value()),
        ],
    );
    sim.spawn_program(&program, &[0, 0], 100).unwrap();

    sim.tick(); // CALL
    assert_eq!(sim.organisms()[0].call_stack.len(), 1);
    assert_eq!(sim.organisms()[0].ip, vec![5, 0]);
    sim.tick(); // ADDI %FPR0, 5
    sim.tick(); // RET

    let organism = &sim.organisms()[0];
    assert!(organism.call_stack.is_empty());
    assert_eq!(organism.ip, vec![3, 0]);
    assert_eq!(dr0_value(&sim), 5);
}

#[test]
fn poke_writes_and_transfers_ownership() {
    let mut sim = new_sim(2);
    // SYNC pins the DP to the ip, then POKE DR0 two cells below
    let program = row_program(
        "poke",
        &[
            code(Opcode::Seti.value()),
            register(0),
            data(42),
            code(Opcode::Sync.value()),
            code(Opcode::Poke.value()),
            register(0),
            data(0),
            data(2),
        ],
    );
    let id = sim.spawn_program(&program, &[0, 0], 100).unwrap();
    sim.tick();
    sim.tick(); // SYNC at ip (3,0)
    sim.tick(); // POKE at (3,2)

    let molecule = sim.environment().get(&[3, 2]).unwrap();
    assert_eq!(molecule, Molecule::new(MoleculeType::Data, 42));
    assert_eq!(sim.environment().owner_of(&[3, 2]).unwrap(), id);
    assert_eq!(sim.organisms()[0].sr, 1);
}

#[test]
fn harvest_consumes_an_energy_cell() {
    let mut sim = new_sim(2);
    let program = row_program(
        "harvest",
        &[
            code(Opcode::Sync.value()),
            code(Opcode::Hrvs.value()),
            data(0),
            data(3),
        ],
    );
    sim.spawn_program(&program, &[0, 0], 100).unwrap();
    sim.environment()
        .set(&[0, 3], Molecule::new(MoleculeType::Energy, 50), 0)
        .unwrap();

    sim.tick(); // SYNC pins the DP to (0,0)
    sim.tick(); // HRVS at dp + (0,3)

    let organism = &sim.organisms()[0];
    assert_eq!(organism.er, 100 - 2 + 50);
    assert!(sim.environment().get(&[0, 3]).unwrap().is_empty());
}

#[test]
fn spawn_creates_a_child_with_transferred_energy() {
    let mut sim = new_sim(2);
    let program = row_program(
        "spawn",
        &[
            code(Opcode::Seti.value()),
            register(0),
            data(30),
            code(Opcode::Spwn.value()),
            register(0),
            data(0),
            data(2),
        ],
    );
    let parent = sim.spawn_program(&program, &[0, 0], 100).unwrap();
    sim.tick();
    sim.tick(); // SPWN from ip (3,0), offset (0,2)

    assert_eq!(sim.organisms().len(), 2);
    let child = &sim.organisms()[1];
    assert_eq!(child.parent_id, parent);
    assert_eq!(child.er, 30);
    assert_eq!(child.birth_tick, 1);
    assert_eq!(child.initial_position, vec![3, 2]);
    assert_eq!(sim.organisms()[0].er, 100 - 30 - 2);
    assert_eq!(sim.total_organisms_created(), 2);
}

#[test]
fn kill_marks_the_organism_dead_after_the_step() {
    let mut sim = new_sim(2);
    let program = row_program("kill", &[code(Opcode::Kill.value())]);
    sim.spawn_program(&program, &[0, 0], 100).unwrap();
    sim.tick();

    assert!(sim.organisms()[0].is_dead);
    // dead organisms are skipped forever
    let before = sim.organisms()[0].er;
    sim.tick();
    assert_eq!(sim.organisms()[0].er, before);
}

#[test]
fn energy_exhaustion_kills() {
    let mut sim = new_sim(2);
    lone_organism(&mut sim, &[10, 10], 2);
    sim.tick(); // NO_INSTRUCTION, penalty 5 → energy -3
    assert!(sim.organisms()[0].is_dead);
}

#[test]
fn stack_overflow_is_reported() {
    let mut sim = Simulation::new(
        SimulationConfig {
            stack_limit: 2,
            ..config(&[20, 20], TopologyKind::Bounded, 2)
        },
        "run-stack",
    );
    let program = row_program(
        "push3",
        &[
            code(Opcode::Pshi.value()),
            data(1),
            code(Opcode::Pshi.value()),
            data(2),
            code(Opcode::Pshi.value()),
            data(3),
        ],
    );
    sim.spawn_program(&program, &[0, 0], 100).unwrap();
    sim.tick();
    sim.tick();
    sim.tick();

    let organism = &sim.organisms()[0];
    assert_eq!(organism.data_stack.len(), 2);
    assert_eq!(organism.failure_reason().as_deref(), Some("STACK_OVERFLOW"));
}

#[test]
fn poke_outside_a_bounded_grid_fails_locally() {
    let mut sim = new_sim(2);
    let program = row_program(
        "oob",
        &[
            code(Opcode::Sync.value()),
            code(Opcode::Poke.value()),
            register(0),
            data(0),
            data(-5),
        ],
    );
    sim.spawn_program(&program, &[0, 0], 100).unwrap();
    sim.tick();
    sim.tick();

    let organism = &sim.organisms()[0];
    assert!(organism.instruction_failed);
    assert_eq!(organism.failure_reason().as_deref(), Some("OUT_OF_BOUNDS"));
    assert!(!organism.is_dead);
}

#[test]
fn turn_rejects_non_unit_vectors() {
    let mut sim = new_sim(2);
    let program = row_program(
        "turn",
        &[code(Opcode::Turn.value()), data(1), data(1)],
    );
    sim.spawn_program(&program, &[0, 0], 100).unwrap();
    sim.tick();

    let organism = &sim.organisms()[0];
    assert_eq!(
        organism.failure_reason().as_deref(),
        Some("INVALID_DIRECTION")
    );
    assert_eq!(organism.dv, vec![1, 0]);
}

#[test]
fn type_mismatch_when_arithmetic_mixes_kinds() {
    let mut sim = new_sim(2);
    // DR0 := vector, DR1 := molecule, ADDR DR0, DR1
    let program = row_program(
        "mix",
        &[
            code(Opcode::Setv.value()),
            register(0),
            data(1),
            data(2),
            code(Opcode::Addr.value()),
            register(0),
            register(1),
        ],
    );
    sim.spawn_program(&program, &[0, 0], 100).unwrap();
    sim.tick();
    sim.tick();

    let organism = &sim.organisms()[0];
    assert_eq!(organism.failure_reason().as_deref(), Some("TYPE_MISMATCH"));
    assert!(matches!(&organism.dr[0], Value::Vector(v) if v == &vec![1, 2]));
}

#[test]
fn unknown_opcode_does_not_advance() {
    let mut sim = new_sim(2);
    let program = row_program("junk", &[code(3999)]);
    sim.spawn_program(&program, &[0, 0], 100).unwrap();
    sim.tick();

    let organism = &sim.organisms()[0];
    assert_eq!(organism.failure_reason().as_deref(), Some("UNKNOWN_OPCODE"));
    assert_eq!(organism.ip, vec![0, 0]);
}

#[test]
fn toroidal_execution_wraps_the_ip() {
    let mut sim = Simulation::new(
        config(&[4, 4], TopologyKind::Toroidal, 2),
        "run-torus",
    );
    let program = row_program(
        "wrap",
        &[
            code(Opcode::Nop.value()),
            code(Opcode::Nop.value()),
            code(Opcode::Nop.value()),
            code(Opcode::Nop.value()),
        ],
    );
    sim.spawn_program(&program, &[0, 0], 100).unwrap();
    for _ in 0..4 {
        sim.tick();
    }
    // four 1-cell instructions on a 4-wide torus land back at the origin
    assert_eq!(sim.organisms()[0].ip, vec![0, 0]);
    assert!(!sim.organisms()[0].instruction_failed);
}

#[test]
fn failure_kind_strings_are_stable() {
    assert_eq!(FailureKind::NoInstruction.to_string(), "NO_INSTRUCTION");
    assert_eq!(FailureKind::DivideByZero.to_string(), "DIVIDE_BY_ZERO");
    assert_eq!(FailureKind::TypeMismatch.to_string(), "TYPE_MISMATCH");
}

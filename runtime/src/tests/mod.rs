use crate::{Organism, Program, Simulation};
use evochora_app_config::{SimulationConfig, ThermodynamicsConfig, TopologyKind};
use evochora_types::{Molecule, MoleculeType};

mod isa;
mod pipeline;

pub(crate) fn config(
    shape: &[i32],
    topology: TopologyKind,
    parallelism: usize,
) -> SimulationConfig {
    SimulationConfig {
        shape: shape.to_vec(),
        topology,
        parallelism,
        seed: 0,
        stack_limit: 16,
        max_energy: 1_000,
        thermodynamics: ThermodynamicsConfig::default(),
    }
}

/// A bare organism on an otherwise untouched grid.
pub(crate) fn lone_organism(sim: &mut Simulation, position: &[i32], energy: i32) {
    let organism = Organism::create(
        1,
        0,
        0,
        "test".into(),
        position.to_vec(),
        unit_x(position.len()),
        energy,
        1_000,
    );
    sim.adopt(organism);
}

pub(crate) fn unit_x(dims: usize) -> Vec<i32> {
    let mut dv = vec![0; dims];
    dv[0] = 1;
    dv
}

pub(crate) fn code(value: i32) -> Molecule {
    Molecule::new(MoleculeType::Code, value)
}

pub(crate) fn data(value: i32) -> Molecule {
    Molecule::new(MoleculeType::Data, value)
}

pub(crate) fn register(index: i32) -> Molecule {
    Molecule::new(MoleculeType::Register, index)
}

/// Lays out instruction rows along +x starting at the entry offset.
pub(crate) fn row_program(program_id: &str, molecules: &[Molecule]) -> Program {
    let mut program = Program::new(program_id, 2);
    for (x, molecule) in molecules.iter().enumerate() {
        program = program.put(&[x as i32, 0], *molecule);
    }
    program
}

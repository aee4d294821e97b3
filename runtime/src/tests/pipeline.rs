//! Capture discipline and whole-simulation determinism.

use super::*;
use crate::{CaptureEngine, Opcode};
use evochora_app_config::CaptureConfig;
use evochora_protocol::{DeltaType, TickDataChunk};
use evochora_types::label_hash;

fn writer_program() -> Program {
    row_program(
        "writer",
        &[
            Molecule::new(MoleculeType::Label, label_hash("main")),
            code(Opcode::Seti.value()),
            register(0),
            data(5),
            code(Opcode::Sync.value()),
            code(Opcode::Poke.value()),
            register(0),
            data(0),
            data(1),
            code(Opcode::Addi.value()),
            register(0),
            data(1),
            code(Opcode::Jmpl.value()),
            Molecule::new(MoleculeType::LabelRef, label_hash("main")),
        ],
    )
}

fn spawner_program() -> Program {
    let mut program = Program::new("spawner", 2);
    let cells = [
        code(Opcode::Seti.value()),
        register(0),
        data(12),
        code(Opcode::Spwn.value()),
        register(0),
        data(0),
        data(2),
        code(Opcode::Jmpr.value()),
        data(-7),
        data(0),
    ];
    for (x, molecule) in cells.iter().enumerate() {
        program = program.put(&[x as i32, 0], *molecule);
    }
    program
}

fn run_and_capture(parallelism: usize, ticks: usize) -> Vec<Vec<TickDataChunk>> {
    let mut sim = Simulation::new(
        config(&[24, 24], TopologyKind::Toroidal, parallelism),
        "run-det",
    );
    sim.spawn_program(&writer_program(), &[0, 0], 500).unwrap();
    sim.spawn_program(&spawner_program(), &[0, 8], 500).unwrap();
    sim.environment()
        .set(&[2, 4], Molecule::new(MoleculeType::Energy, 40), 0)
        .unwrap();

    let mut engine = CaptureEngine::with_clock(
        CaptureConfig {
            snapshot_interval: 5,
            chunk_interval: 5,
            batch_size: 2,
        },
        Box::new(|| 0),
    );
    let mut batches = Vec::new();
    for _ in 0..ticks {
        let summary = sim.tick();
        if let Some(batch) = engine.observe(&mut sim, &summary) {
            batches.push(batch);
        }
    }
    let rest = engine.flush();
    if !rest.is_empty() {
        batches.push(rest);
    }
    sim.shutdown();
    batches
}

#[test]
fn parallelism_does_not_change_the_output() {
    let p2 = run_and_capture(2, 30);
    let p5 = run_and_capture(5, 30);
    assert_eq!(p2, p5);
}

#[test]
fn repeated_runs_are_identical() {
    assert_eq!(run_and_capture(3, 25), run_and_capture(3, 25));
}

#[test]
fn batches_cover_contiguous_tick_ranges() {
    let batches = run_and_capture(2, 30);
    let chunks: Vec<&TickDataChunk> = batches.iter().flatten().collect();
    assert!(!chunks.is_empty());
    for pair in chunks.windows(2) {
        assert_eq!(pair[0].last_tick + 1, pair[1].first_tick);
    }
    for chunk in &chunks {
        assert_eq!(
            chunk.tick_count as i64,
            chunk.last_tick - chunk.first_tick + 1
        );
        assert!(chunk.snapshot.is_some());
    }
}

#[test]
fn keyframes_appear_between_snapshots() {
    let mut sim = Simulation::new(config(&[16, 16], TopologyKind::Bounded, 2), "run-key");
    sim.spawn_program(&writer_program(), &[0, 0], 200).unwrap();

    let mut engine = CaptureEngine::with_clock(
        CaptureConfig {
            snapshot_interval: 2,
            chunk_interval: 4,
            batch_size: 1,
        },
        Box::new(|| 0),
    );
    let mut batches = Vec::new();
    for _ in 0..4 {
        let summary = sim.tick();
        if let Some(batch) = engine.observe(&mut sim, &summary) {
            batches.push(batch);
        }
    }
    sim.shutdown();

    assert_eq!(batches.len(), 1);
    let chunk = &batches[0][0];
    assert!(chunk.snapshot.is_some());
    let delta_types: Vec<i32> = chunk.deltas.iter().map(|d| d.delta_type).collect();
    assert_eq!(
        delta_types,
        vec![
            DeltaType::Incremental as i32,
            DeltaType::Keyframe as i32,
            DeltaType::Incremental as i32,
        ]
    );
    // the keyframe enumerates every non-empty cell, not just changes
    let keyframe = &chunk.deltas[1];
    let snapshot_cells = chunk
        .snapshot
        .as_ref()
        .unwrap()
        .cell_columns
        .as_ref()
        .unwrap()
        .flat_indices
        .len();
    let keyframe_cells = keyframe.changed_cells.as_ref().unwrap().flat_indices.len();
    assert!(keyframe_cells >= snapshot_cells);
}

#[test]
fn incremental_deltas_carry_cleared_cells_as_zero_words() {
    let mut sim = Simulation::new(config(&[16, 16], TopologyKind::Bounded, 2), "run-clear");
    // POKE an empty molecule over a pre-seeded structure cell
    let program = row_program(
        "clear",
        &[
            code(Opcode::Sync.value()),
            code(Opcode::Poke.value()),
            register(0),
            data(0),
            data(1),
        ],
    );
    sim.spawn_program(&program, &[0, 0], 100).unwrap();
    sim.environment()
        .set(&[0, 1], Molecule::new(MoleculeType::Structure, 3), 0)
        .unwrap();

    let mut engine = CaptureEngine::with_clock(
        CaptureConfig {
            snapshot_interval: 100,
            chunk_interval: 100,
            batch_size: 1,
        },
        Box::new(|| 0),
    );
    let s1 = sim.tick(); // SYNC
    engine.observe(&mut sim, &s1);
    let s2 = sim.tick(); // POKE empty over (1,1)
    engine.observe(&mut sim, &s2);
    sim.shutdown();

    let chunks = engine.flush();
    let delta = &chunks[0].deltas[0];
    let cells = delta.changed_cells.as_ref().unwrap();
    let slot = cells
        .flat_indices
        .iter()
        .position(|flat| *flat == 1)
        .expect("cleared cell is reported");
    // cleared but still owned by the writer
    assert_eq!(cells.molecule_data[slot] as u32 & 0x7ffff, 0);
    assert_eq!(cells.owner_ids[slot], 1);
}

#[test]
fn snapshot_refreshes_genome_hashes() {
    let mut sim = Simulation::new(config(&[16, 16], TopologyKind::Bounded, 2), "run-hash");
    sim.spawn_program(&writer_program(), &[0, 0], 200).unwrap();
    let mut engine = CaptureEngine::with_clock(
        CaptureConfig {
            snapshot_interval: 1,
            chunk_interval: 1,
            batch_size: 1,
        },
        Box::new(|| 0),
    );
    let summary = sim.tick();
    let batch = engine.observe(&mut sim, &summary).expect("one-tick batches");
    sim.shutdown();

    let snapshot = batch[0].snapshot.as_ref().unwrap();
    assert_ne!(snapshot.organisms[0].genome_hash, 0);
    assert_eq!(
        snapshot.organisms[0].genome_hash,
        sim.organisms()[0].genome_hash
    );
}

#[test]
fn restore_round_trips_through_wire_states() {
    let mut sim = Simulation::new(config(&[16, 16], TopologyKind::Bounded, 2), "run-restore");
    sim.spawn_program(&writer_program(), &[0, 0], 200).unwrap();
    for _ in 0..3 {
        sim.tick();
    }
    sim.refresh_genome_hashes();
    let state = sim.organisms()[0].to_state(2);
    sim.shutdown();

    let restored = crate::from_state(&state, 2).unwrap();
    assert_eq!(restored.ip, sim.organisms()[0].ip);
    assert_eq!(restored.er, sim.organisms()[0].er);
    assert_eq!(restored.genome_hash, sim.organisms()[0].genome_hash);
}

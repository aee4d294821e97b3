//! The `run` subcommand: drive a full simulation with persistence,
//! notification, and an optional in-process indexer.

use super::{load_config, ExecError, Result};
use clap::ArgMatches;
use evochora_app_config::SimulationConfig;
use evochora_indexer::{IndexerService, MemoryQueryStore, QueryStore};
use evochora_logger::info;
use evochora_notify::{Broker, EmbeddedBroker, TopicResource, TopicWriter};
use evochora_protocol::{
    BatchInfo, ChunkFilter, SimulationMetadata, TickDataChunk, Topology as WireTopology,
};
use evochora_runtime::{CaptureEngine, Opcode, Program, Simulation};
use evochora_storage::path::metadata_key;
use evochora_storage::{write_message, FilesystemStorage, StorageResource};
use evochora_systemtime::unix_time_as_millis;
use evochora_types::{label_hash, Molecule, MoleculeType};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub fn exec(matches: &ArgMatches) -> Result<()> {
    let config = load_config(matches)?;
    let run_id = matches
        .get_one::<String>("run-id")
        .cloned()
        .unwrap_or_else(|| format!("run-{}", unix_time_as_millis()));
    let ticks = *matches.get_one::<u64>("ticks").expect("defaulted");

    let storage = Arc::new(FilesystemStorage::from_config(&config.storage)?);
    let broker: Arc<dyn Broker> = Arc::new(EmbeddedBroker::new(config.topic.retention_enabled));
    let topic = Arc::new(TopicResource::new(broker, &config.topic).with_run_id(&run_id));
    let writer = topic.writer()?;

    let metadata = SimulationMetadata {
        run_id: run_id.clone(),
        shape: config.simulation.shape.clone(),
        topology: match config.simulation.topology {
            evochora_app_config::TopologyKind::Bounded => WireTopology::Bounded as i32,
            evochora_app_config::TopologyKind::Toroidal => WireTopology::Toroidal as i32,
        },
        started_at_ms: unix_time_as_millis() as i64,
        snapshot_interval: config.capture.snapshot_interval,
        chunk_interval: config.capture.chunk_interval,
    };
    write_message(
        storage.as_ref(),
        &metadata_key(&run_id, storage.compression()),
        &metadata,
    )?;

    let store = Arc::new(MemoryQueryStore::default());
    let indexer = matches.get_flag("with-indexer").then(|| {
        IndexerService::new(
            config.indexer.clone(),
            &run_id,
            "cell-indexer",
            ChunkFilter::All,
            Arc::clone(&storage) as Arc<dyn StorageResource>,
            Arc::clone(&topic),
            Arc::clone(&store) as Arc<dyn QueryStore>,
        )
    });
    if let Some(indexer) = &indexer {
        indexer.start().map_err(|e| ExecError(e.to_string()))?;
    }

    let mut sim = Simulation::new(config.simulation.clone(), &run_id);
    seed_world(&mut sim, &config.simulation)?;

    let mut capture = CaptureEngine::new(config.capture.clone());
    let mut published = 0u64;
    for _ in 0..ticks {
        let summary = sim.tick();
        if let Some(batch) = capture.observe(&mut sim, &summary) {
            persist(storage.as_ref(), &writer, batch)?;
            published += 1;
        }
    }
    let rest = capture.flush();
    if !rest.is_empty() {
        persist(storage.as_ref(), &writer, rest)?;
        published += 1;
    }

    let live = sim.organisms().iter().filter(|o| !o.is_dead).count();
    info!(
        "run {} finished: {} ticks, {} organisms created, {} alive, {} batches",
        run_id,
        ticks,
        sim.total_organisms_created(),
        live,
        published
    );
    sim.shutdown();

    if let Some(indexer) = indexer {
        let deadline = Instant::now() + Duration::from_secs(10);
        while indexer.metrics().batches_processed < published && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(25));
        }
        let metrics = indexer.metrics();
        info!(
            "indexer drained {} batches / {} ticks into {} rows",
            metrics.batches_processed,
            metrics.ticks_processed,
            store.row_count()
        );
        indexer.stop();
    }
    Ok(())
}

fn persist(
    storage: &FilesystemStorage,
    writer: &TopicWriter,
    batch: Vec<TickDataChunk>,
) -> Result<()> {
    let result = storage.write_chunk_batch_streaming(&mut batch.into_iter())?;
    writer.send_message(&BatchInfo {
        simulation_run_id: result
            .path
            .split('/')
            .next()
            .unwrap_or_default()
            .to_owned(),
        storage_path: result.path,
        tick_start: result.first_tick,
        tick_end: result.last_tick,
        written_at_ms: unix_time_as_millis() as i64,
    })?;
    Ok(())
}

/// Seeds the world: a few copies of the bootstrap program plus an energy
/// field scattered by the configured seed.
fn seed_world(sim: &mut Simulation, config: &SimulationConfig) -> Result<()> {
    let dims = config.shape.len();
    let program = bootstrap_program(dims);
    let spacing = (config.shape[0] / 4).max(1);
    for slot in 0..4 {
        let mut origin = vec![2; dims];
        origin[0] = (slot * spacing + 1).min(config.shape[0] - 1);
        sim.spawn_program(&program, &origin, config.max_energy / 4)
            .map_err(|e| ExecError(format!("seeding failed: {}", e)))?;
    }

    let mut rng = StdRng::seed_from_u64(config.seed);
    let cells = evochora_types::shape_len(&config.shape);
    for _ in 0..(cells / 50).max(1) {
        let coord: Vec<i32> = config.shape.iter().map(|d| rng.gen_range(0..*d)).collect();
        if sim
            .environment()
            .get(&coord)
            .map(|m| m.is_empty())
            .unwrap_or(false)
        {
            sim.environment()
                .set(&coord, Molecule::new(MoleculeType::Energy, 100), 0)
                .map_err(|e| ExecError(format!("seeding failed: {}", e)))?;
        }
    }
    Ok(())
}

/// A small writer loop: stamps DATA molecules next to its code and jumps
/// back to its label forever.
fn bootstrap_program(dims: usize) -> Program {
    let write_offset: Vec<i32> = if dims > 1 {
        let mut offset = vec![0; dims];
        offset[dims - 1] = 1;
        offset
    } else {
        vec![16]
    };
    let mut cells: Vec<Molecule> = vec![
        Molecule::new(MoleculeType::Label, label_hash("main")),
        Molecule::new(MoleculeType::Code, Opcode::Seti.value()),
        Molecule::new(MoleculeType::Register, 0),
        Molecule::new(MoleculeType::Data, 7),
        Molecule::new(MoleculeType::Code, Opcode::Sync.value()),
        Molecule::new(MoleculeType::Code, Opcode::Poke.value()),
        Molecule::new(MoleculeType::Register, 0),
    ];
    cells.extend(
        write_offset
            .iter()
            .map(|axis| Molecule::new(MoleculeType::Data, *axis)),
    );
    cells.extend([
        Molecule::new(MoleculeType::Code, Opcode::Addi.value()),
        Molecule::new(MoleculeType::Register, 0),
        Molecule::new(MoleculeType::Data, 1),
        Molecule::new(MoleculeType::Code, Opcode::Jmpl.value()),
        Molecule::new(MoleculeType::LabelRef, label_hash("main")),
    ]);

    let mut program = Program::new("bootstrap", dims);
    for (x, molecule) in cells.into_iter().enumerate() {
        let mut offset = vec![0; dims];
        offset[0] = x as i32;
        program = program.put(&offset, molecule);
    }
    program.entry_at(&{
        let mut entry = vec![0; dims];
        entry[0] = 1;
        entry
    })
}

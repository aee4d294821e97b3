//! Tick capture: snapshots, deltas, and chunk assembly.
//!
//! The first tick of every chunk is a full snapshot; within a chunk, ticks
//! on the snapshot interval become KEYFRAME deltas and everything else an
//! INCREMENTAL delta of the cells the commit pass changed. Chunks close
//! every `chunk_interval` ticks and are handed out in batches of
//! `batch_size` for persistence.

use crate::scheduler::{Simulation, TickSummary};
use evochora_app_config::CaptureConfig;
use evochora_protocol::{
    CellDataColumns, DeltaType, OrganismState, TickData, TickDataChunk, TickDelta,
};
use evochora_types::{Molecule, OrganismId};
use std::collections::BTreeSet;

/// Millisecond clock used for `capture_time_ms` stamps.
///
/// Injectable so determinism tests can freeze it.
pub type Clock = Box<dyn Fn() -> i64 + Send>;

/// Accumulates tick artifacts into chunks and chunks into batches.
pub struct CaptureEngine {
    config: CaptureConfig,
    clock: Clock,
    current: Option<TickDataChunk>,
    ticks_in_chunk: i64,
    pending: Vec<TickDataChunk>,
}

impl CaptureEngine {
    /// Creates an engine stamping capture times from the system clock.
    pub fn new(config: CaptureConfig) -> CaptureEngine {
        Self::with_clock(
            config,
            Box::new(|| evochora_systemtime::unix_time_as_millis() as i64),
        )
    }

    /// Creates an engine with an injected clock.
    pub fn with_clock(config: CaptureConfig, clock: Clock) -> CaptureEngine {
        CaptureEngine {
            config,
            clock,
            current: None,
            ticks_in_chunk: 0,
            pending: Vec::new(),
        }
    }

    /// Observes a completed tick. Returns a full batch when one is ready.
    pub fn observe(
        &mut self,
        sim: &mut Simulation,
        summary: &TickSummary,
    ) -> Option<Vec<TickDataChunk>> {
        let now = (self.clock)();
        if self.current.is_none() {
            self.current = Some(TickDataChunk {
                simulation_run_id: sim.run_id().to_owned(),
                first_tick: summary.tick,
                last_tick: summary.tick,
                tick_count: 0,
                snapshot: None,
                deltas: Vec::new(),
            });
            self.ticks_in_chunk = 0;
        }

        let starts_chunk = self
            .current
            .as_ref()
            .map(|c| c.snapshot.is_none())
            .unwrap_or(false);
        let full_enumeration = starts_chunk || summary.tick % self.config.snapshot_interval == 0;
        if full_enumeration {
            sim.refresh_genome_hashes();
        }

        let artifact_organisms = if full_enumeration {
            live_states(sim)
        } else {
            touched_states(sim, summary)
        };
        let chunk = self.current.as_mut().expect("chunk initialised above");
        chunk.last_tick = summary.tick;
        chunk.tick_count += 1;
        self.ticks_in_chunk += 1;

        if starts_chunk {
            chunk.snapshot = Some(TickData {
                tick_number: summary.tick,
                simulation_run_id: sim.run_id().to_owned(),
                capture_time_ms: now,
                organisms: artifact_organisms,
                cell_columns: Some(all_cells(sim)),
                total_organisms_created: sim.total_organisms_created(),
            });
        } else {
            let (delta_type, cells) = if full_enumeration {
                (DeltaType::Keyframe, all_cells(sim))
            } else {
                (
                    DeltaType::Incremental,
                    changed_cells(sim, &summary.changed_cells),
                )
            };
            chunk.deltas.push(TickDelta {
                tick_number: summary.tick,
                simulation_run_id: sim.run_id().to_owned(),
                capture_time_ms: now,
                delta_type: delta_type as i32,
                organisms: artifact_organisms,
                changed_cells: Some(cells),
                total_organisms_created: sim.total_organisms_created(),
            });
        }

        if self.ticks_in_chunk >= self.config.chunk_interval {
            let full = self.current.take().expect("chunk in progress");
            self.pending.push(full);
            self.ticks_in_chunk = 0;
        }
        if self.pending.len() >= self.config.batch_size {
            return Some(std::mem::take(&mut self.pending));
        }
        None
    }

    /// Drains everything buffered, closing a partial chunk. Used on stop.
    pub fn flush(&mut self) -> Vec<TickDataChunk> {
        if let Some(chunk) = self.current.take() {
            self.pending.push(chunk);
        }
        self.ticks_in_chunk = 0;
        std::mem::take(&mut self.pending)
    }
}

/// Full enumeration of every non-empty cell, in flat-index order.
fn all_cells(sim: &Simulation) -> CellDataColumns {
    let mut columns = CellDataColumns::default();
    for (flat, molecule, owner) in sim.environment().non_empty_cells() {
        columns.flat_indices.push(flat as i32);
        columns.molecule_data.push(molecule.encode(owner) as i32);
        columns.owner_ids.push(owner as i32);
    }
    columns
}

/// Current words of the changed cells, zero words for cleared included.
fn changed_cells(sim: &Simulation, changed: &BTreeSet<usize>) -> CellDataColumns {
    let mut columns = CellDataColumns::default();
    for flat in changed {
        let word = sim.environment().raw(*flat);
        let owner = Molecule::decode(word).map(|(_, owner)| owner).unwrap_or(0);
        columns.flat_indices.push(*flat as i32);
        columns.molecule_data.push(word as i32);
        columns.owner_ids.push(owner as i32);
    }
    columns
}

fn live_states(sim: &Simulation) -> Vec<OrganismState> {
    let dims = sim.environment().num_dims();
    sim.organisms()
        .iter()
        .filter(|o| !o.is_dead)
        .map(|o| o.to_state(dims))
        .collect()
}

/// Only organisms that stepped, were born, or died this tick.
fn touched_states(sim: &Simulation, summary: &TickSummary) -> Vec<OrganismState> {
    let dims = sim.environment().num_dims();
    let touched: BTreeSet<OrganismId> = summary
        .stepped
        .iter()
        .chain(&summary.born)
        .chain(&summary.died)
        .copied()
        .collect();
    sim.organisms()
        .iter()
        .filter(|o| touched.contains(&o.id))
        .map(|o| o.to_state(dims))
        .collect()
}

//! The downstream query store contract and the embedded implementation.

use crate::Result;
use evochora_protocol::{CellDataColumns, OrganismState, TickData, TickDataChunk, TickDelta};
use evochora_types::Shape;
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// One decoded cell of one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellRow {
    /// Coordinates decoded from the flat index via the run's world shape.
    pub coord: Vec<i32>,
    /// Packed molecule word.
    pub molecule: i32,
    /// Owner organism id.
    pub owner: i32,
}

/// Everything the indexer materialises for one `(run_id, tick)`.
#[derive(Debug, Clone, PartialEq)]
pub struct TickRow {
    /// Run the tick belongs to.
    pub run_id: String,
    /// Tick number; `(run_id, tick)` is the MERGE key.
    pub tick: i64,
    /// Whether this row came from a full enumeration or a delta.
    pub is_snapshot: bool,
    /// Decoded cells.
    pub cells: Vec<CellRow>,
    /// Organism states.
    pub organisms: Vec<OrganismState>,
}

/// The transactional writer the indexer flushes into.
///
/// `merge` must be idempotent on `(run_id, tick)`: reprocessing a batch
/// after a crash-before-ack must leave the store unchanged.
pub trait QueryStore: Send + Sync {
    /// Upserts the rows in one transaction.
    fn merge(&self, rows: &[TickRow]) -> Result<()>;
}

/// In-memory query store used by tests and single-process deployments.
#[derive(Default)]
pub struct MemoryQueryStore {
    rows: Mutex<BTreeMap<(String, i64), TickRow>>,
}

impl MemoryQueryStore {
    /// Number of stored `(run_id, tick)` rows.
    pub fn row_count(&self) -> usize {
        self.rows.lock().len()
    }

    /// Fetches one row by key.
    pub fn get(&self, run_id: &str, tick: i64) -> Option<TickRow> {
        self.rows.lock().get(&(run_id.to_owned(), tick)).cloned()
    }
}

impl QueryStore for MemoryQueryStore {
    fn merge(&self, rows: &[TickRow]) -> Result<()> {
        let mut store = self.rows.lock();
        for row in rows {
            store.insert((row.run_id.clone(), row.tick), row.clone());
        }
        Ok(())
    }
}

/// Decodes one chunk into per-tick rows using the run's world shape.
pub fn rows_from_chunk(chunk: &TickDataChunk, shape: &Shape) -> Vec<TickRow> {
    let mut rows = Vec::with_capacity(1 + chunk.deltas.len());
    if let Some(snapshot) = &chunk.snapshot {
        rows.push(snapshot_row(&chunk.simulation_run_id, snapshot, shape));
    }
    for delta in &chunk.deltas {
        rows.push(delta_row(&chunk.simulation_run_id, delta, shape));
    }
    rows
}

fn snapshot_row(run_id: &str, data: &TickData, shape: &Shape) -> TickRow {
    TickRow {
        run_id: run_id.to_owned(),
        tick: data.tick_number,
        is_snapshot: true,
        cells: decode_cells(data.cell_columns.as_ref(), shape),
        organisms: data.organisms.clone(),
    }
}

fn delta_row(run_id: &str, delta: &TickDelta, shape: &Shape) -> TickRow {
    TickRow {
        run_id: run_id.to_owned(),
        tick: delta.tick_number,
        is_snapshot: false,
        cells: decode_cells(delta.changed_cells.as_ref(), shape),
        organisms: delta.organisms.clone(),
    }
}

fn decode_cells(columns: Option<&CellDataColumns>, shape: &Shape) -> Vec<CellRow> {
    let Some(columns) = columns else {
        return Vec::new();
    };
    columns
        .flat_indices
        .iter()
        .enumerate()
        .map(|(slot, flat)| CellRow {
            coord: shape.coord_of(*flat as usize),
            molecule: columns.molecule_data.get(slot).copied().unwrap_or(0),
            owner: columns.owner_ids.get(slot).copied().unwrap_or(0),
        })
        .collect()
}

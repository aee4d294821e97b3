//! Protobuf message definitions.
//!
//! Field numbers are part of the on-disk contract and must never be
//! renumbered; see the storage format notes in the workspace docs.

/// Columnar encoding of a set of cells.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CellDataColumns {
    /// Flat cell indices, column-major for the run's world shape.
    #[prost(int32, repeated, tag = "1")]
    pub flat_indices: Vec<i32>,
    /// Packed molecule cell words, parallel to `flat_indices`.
    #[prost(int32, repeated, tag = "2")]
    pub molecule_data: Vec<i32>,
    /// Owner organism ids, parallel to `flat_indices`.
    #[prost(int32, repeated, tag = "3")]
    pub owner_ids: Vec<i32>,
}

/// Wire form of one organism's externally visible state.
///
/// Stacks, call frames, and register banks are runtime-only state and are
/// deliberately not part of the wire contract.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OrganismState {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(uint32, tag = "2")]
    pub parent_id: u32,
    #[prost(int64, tag = "3")]
    pub birth_tick: i64,
    #[prost(string, tag = "4")]
    pub program_id: String,
    #[prost(int32, tag = "5")]
    pub energy: i32,
    #[prost(int32, tag = "6")]
    pub entropy: i32,
    #[prost(int32, tag = "7")]
    pub marker: i32,
    #[prost(int32, tag = "8")]
    pub max_energy: i32,
    #[prost(int32, repeated, tag = "9")]
    pub ip: Vec<i32>,
    #[prost(int32, repeated, tag = "10")]
    pub dv: Vec<i32>,
    #[prost(int32, repeated, tag = "11")]
    pub initial_position: Vec<i32>,
    /// All data pointers, flattened in dimension-sized runs.
    #[prost(int32, repeated, tag = "12")]
    pub dp_coords: Vec<i32>,
    #[prost(int32, tag = "13")]
    pub active_dp_index: i32,
    #[prost(bool, tag = "14")]
    pub is_dead: bool,
    #[prost(bool, tag = "15")]
    pub instruction_failed: bool,
    #[prost(string, tag = "16")]
    pub failure_reason: String,
    #[prost(uint64, tag = "17")]
    pub genome_hash: u64,
}

/// Full snapshot of one tick.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TickData {
    #[prost(int64, tag = "1")]
    pub tick_number: i64,
    #[prost(string, tag = "2")]
    pub simulation_run_id: String,
    #[prost(int64, tag = "3")]
    pub capture_time_ms: i64,
    #[prost(message, repeated, tag = "4")]
    pub organisms: Vec<OrganismState>,
    /// Every non-empty cell of the world.
    #[prost(message, optional, tag = "5")]
    pub cell_columns: Option<CellDataColumns>,
    #[prost(int64, tag = "6")]
    pub total_organisms_created: i64,
}

/// Whether a delta carries only changes or a full keyframe enumeration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum DeltaType {
    /// Only cells and organisms changed since the previous tick.
    Incremental = 0,
    /// A full enumeration captured mid-chunk.
    Keyframe = 1,
}

/// Changes of one tick relative to the previous tick.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TickDelta {
    #[prost(int64, tag = "1")]
    pub tick_number: i64,
    #[prost(string, tag = "2")]
    pub simulation_run_id: String,
    #[prost(int64, tag = "3")]
    pub capture_time_ms: i64,
    #[prost(enumeration = "DeltaType", tag = "4")]
    pub delta_type: i32,
    #[prost(message, repeated, tag = "5")]
    pub organisms: Vec<OrganismState>,
    /// Changed cells, including zero words for cleared cells.
    #[prost(message, optional, tag = "6")]
    pub changed_cells: Option<CellDataColumns>,
    #[prost(int64, tag = "7")]
    pub total_organisms_created: i64,
}

/// One snapshot plus the deltas that follow it.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TickDataChunk {
    #[prost(string, tag = "1")]
    pub simulation_run_id: String,
    #[prost(int64, tag = "2")]
    pub first_tick: i64,
    #[prost(int64, tag = "3")]
    pub last_tick: i64,
    #[prost(int32, tag = "4")]
    pub tick_count: i32,
    #[prost(message, optional, tag = "5")]
    pub snapshot: Option<TickData>,
    #[prost(message, repeated, tag = "6")]
    pub deltas: Vec<TickDelta>,
}

/// The header fields of a [`TickDataChunk`], decodable from a full chunk
/// frame without materialising cells or organisms.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChunkHeader {
    #[prost(string, tag = "1")]
    pub simulation_run_id: String,
    #[prost(int64, tag = "2")]
    pub first_tick: i64,
    #[prost(int64, tag = "3")]
    pub last_tick: i64,
    #[prost(int32, tag = "4")]
    pub tick_count: i32,
}

/// Grid boundary behaviour, wire form.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum Topology {
    Bounded = 0,
    Toroidal = 1,
}

/// Run-level metadata persisted next to the batch files.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SimulationMetadata {
    #[prost(string, tag = "1")]
    pub run_id: String,
    #[prost(int32, repeated, tag = "2")]
    pub shape: Vec<i32>,
    #[prost(enumeration = "Topology", tag = "3")]
    pub topology: i32,
    #[prost(int64, tag = "4")]
    pub started_at_ms: i64,
    #[prost(int64, tag = "5")]
    pub snapshot_interval: i64,
    #[prost(int64, tag = "6")]
    pub chunk_interval: i64,
}

/// Transport envelope for topic messages.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TopicEnvelope {
    #[prost(string, tag = "1")]
    pub message_id: String,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
}

/// Notification published after a batch file was written.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BatchInfo {
    #[prost(string, tag = "1")]
    pub simulation_run_id: String,
    #[prost(string, tag = "2")]
    pub storage_path: String,
    #[prost(int64, tag = "3")]
    pub tick_start: i64,
    #[prost(int64, tag = "4")]
    pub tick_end: i64,
    #[prost(int64, tag = "5")]
    pub written_at_ms: i64,
}

/// Wire mirrors used by the filtered chunk reader: identical tags with the
/// skipped field left undeclared, so the decoder discards it while
/// scanning instead of allocating it.
pub(crate) mod filtered {
    use super::{CellDataColumns, DeltaType, OrganismState};

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct TickDataSkipCells {
        #[prost(int64, tag = "1")]
        pub tick_number: i64,
        #[prost(string, tag = "2")]
        pub simulation_run_id: String,
        #[prost(int64, tag = "3")]
        pub capture_time_ms: i64,
        #[prost(message, repeated, tag = "4")]
        pub organisms: Vec<OrganismState>,
        #[prost(int64, tag = "6")]
        pub total_organisms_created: i64,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct TickDeltaSkipCells {
        #[prost(int64, tag = "1")]
        pub tick_number: i64,
        #[prost(string, tag = "2")]
        pub simulation_run_id: String,
        #[prost(int64, tag = "3")]
        pub capture_time_ms: i64,
        #[prost(enumeration = "DeltaType", tag = "4")]
        pub delta_type: i32,
        #[prost(message, repeated, tag = "5")]
        pub organisms: Vec<OrganismState>,
        #[prost(int64, tag = "7")]
        pub total_organisms_created: i64,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct TickDataChunkSkipCells {
        #[prost(string, tag = "1")]
        pub simulation_run_id: String,
        #[prost(int64, tag = "2")]
        pub first_tick: i64,
        #[prost(int64, tag = "3")]
        pub last_tick: i64,
        #[prost(int32, tag = "4")]
        pub tick_count: i32,
        #[prost(message, optional, tag = "5")]
        pub snapshot: Option<TickDataSkipCells>,
        #[prost(message, repeated, tag = "6")]
        pub deltas: Vec<TickDeltaSkipCells>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct TickDataSkipOrganisms {
        #[prost(int64, tag = "1")]
        pub tick_number: i64,
        #[prost(string, tag = "2")]
        pub simulation_run_id: String,
        #[prost(int64, tag = "3")]
        pub capture_time_ms: i64,
        #[prost(message, optional, tag = "5")]
        pub cell_columns: Option<CellDataColumns>,
        #[prost(int64, tag = "6")]
        pub total_organisms_created: i64,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct TickDeltaSkipOrganisms {
        #[prost(int64, tag = "1")]
        pub tick_number: i64,
        #[prost(string, tag = "2")]
        pub simulation_run_id: String,
        #[prost(int64, tag = "3")]
        pub capture_time_ms: i64,
        #[prost(enumeration = "DeltaType", tag = "4")]
        pub delta_type: i32,
        #[prost(message, optional, tag = "6")]
        pub changed_cells: Option<CellDataColumns>,
        #[prost(int64, tag = "7")]
        pub total_organisms_created: i64,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct TickDataChunkSkipOrganisms {
        #[prost(string, tag = "1")]
        pub simulation_run_id: String,
        #[prost(int64, tag = "2")]
        pub first_tick: i64,
        #[prost(int64, tag = "3")]
        pub last_tick: i64,
        #[prost(int32, tag = "4")]
        pub tick_count: i32,
        #[prost(message, optional, tag = "5")]
        pub snapshot: Option<TickDataSkipOrganisms>,
        #[prost(message, repeated, tag = "6")]
        pub deltas: Vec<TickDeltaSkipOrganisms>,
    }
}

impl From<filtered::TickDataChunkSkipCells> for TickDataChunk {
    fn from(chunk: filtered::TickDataChunkSkipCells) -> Self {
        TickDataChunk {
            simulation_run_id: chunk.simulation_run_id,
            first_tick: chunk.first_tick,
            last_tick: chunk.last_tick,
            tick_count: chunk.tick_count,
            snapshot: chunk.snapshot.map(|s| TickData {
                tick_number: s.tick_number,
                simulation_run_id: s.simulation_run_id,
                capture_time_ms: s.capture_time_ms,
                organisms: s.organisms,
                cell_columns: None,
                total_organisms_created: s.total_organisms_created,
            }),
            deltas: chunk
                .deltas
                .into_iter()
                .map(|d| TickDelta {
                    tick_number: d.tick_number,
                    simulation_run_id: d.simulation_run_id,
                    capture_time_ms: d.capture_time_ms,
                    delta_type: d.delta_type,
                    organisms: d.organisms,
                    changed_cells: None,
                    total_organisms_created: d.total_organisms_created,
                })
                .collect(),
        }
    }
}

impl From<filtered::TickDataChunkSkipOrganisms> for TickDataChunk {
    fn from(chunk: filtered::TickDataChunkSkipOrganisms) -> Self {
        TickDataChunk {
            simulation_run_id: chunk.simulation_run_id,
            first_tick: chunk.first_tick,
            last_tick: chunk.last_tick,
            tick_count: chunk.tick_count,
            snapshot: chunk.snapshot.map(|s| TickData {
                tick_number: s.tick_number,
                simulation_run_id: s.simulation_run_id,
                capture_time_ms: s.capture_time_ms,
                organisms: Vec::new(),
                cell_columns: s.cell_columns,
                total_organisms_created: s.total_organisms_created,
            }),
            deltas: chunk
                .deltas
                .into_iter()
                .map(|d| TickDelta {
                    tick_number: d.tick_number,
                    simulation_run_id: d.simulation_run_id,
                    capture_time_ms: d.capture_time_ms,
                    delta_type: d.delta_type,
                    organisms: Vec::new(),
                    changed_cells: d.changed_cells,
                    total_organisms_created: d.total_organisms_created,
                })
                .collect(),
        }
    }
}

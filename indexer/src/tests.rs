use super::*;
use evochora_app_config::TopicConfig;
use evochora_notify::{Broker, EmbeddedBroker};
use evochora_protocol::{
    CellDataColumns, Compression, OrganismState, TickData, TickDataChunk,
    Topology as WireTopology,
};
use evochora_storage::path::metadata_key;
use evochora_storage::{write_message, FilesystemStorage, WriteResult};
use std::sync::Arc;
use tempfile::TempDir;

const RUN: &str = "run-x";

fn test_config() -> IndexerConfig {
    IndexerConfig {
        insert_batch_size: 64,
        flush_timeout_ms: 50,
        topic_poll_timeout_ms: 20,
        metadata_poll_interval_ms: 10,
        metadata_max_poll_duration_ms: 2_000,
    }
}

struct Fixture {
    _dir: TempDir,
    storage: Arc<FilesystemStorage>,
    topic: Arc<TopicResource>,
    store: Arc<MemoryQueryStore>,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let storage = Arc::new(FilesystemStorage::new(dir.path(), Compression::Zstd, 3).unwrap());
    let broker: Arc<dyn Broker> = Arc::new(EmbeddedBroker::new(true));
    let topic = Arc::new(
        TopicResource::new(broker, &TopicConfig::default()).with_run_id(RUN),
    );
    Fixture {
        _dir: dir,
        storage,
        topic,
        store: Arc::new(MemoryQueryStore::default()),
    }
}

fn write_metadata(fixture: &Fixture, shape: &[i32]) {
    let metadata = SimulationMetadata {
        run_id: RUN.into(),
        shape: shape.to_vec(),
        topology: WireTopology::Bounded as i32,
        started_at_ms: 1,
        snapshot_interval: 10,
        chunk_interval: 10,
    };
    let key = metadata_key(RUN, Compression::Zstd);
    write_message(fixture.storage.as_ref(), &key, &metadata).unwrap();
}

fn write_batch(fixture: &Fixture, tick: i64, flat: i32) -> WriteResult {
    let chunk = TickDataChunk {
        simulation_run_id: RUN.into(),
        first_tick: tick,
        last_tick: tick,
        tick_count: 1,
        snapshot: Some(TickData {
            tick_number: tick,
            simulation_run_id: RUN.into(),
            capture_time_ms: 5,
            organisms: vec![OrganismState {
                id: 1,
                energy: 77,
                ip: vec![0, 0, 0],
                dv: vec![1, 0, 0],
                initial_position: vec![0, 0, 0],
                ..Default::default()
            }],
            cell_columns: Some(CellDataColumns {
                flat_indices: vec![flat],
                molecule_data: vec![7],
                owner_ids: vec![1],
            }),
            total_organisms_created: 1,
        }),
        deltas: Vec::new(),
    };
    fixture
        .storage
        .write_chunk_batch_streaming(&mut std::iter::once(chunk))
        .unwrap()
}

fn service(fixture: &Fixture, filter: ChunkFilter) -> IndexerService {
    IndexerService::new(
        test_config(),
        RUN,
        "indexer",
        filter,
        Arc::clone(&fixture.storage) as Arc<dyn StorageResource>,
        Arc::clone(&fixture.topic),
        Arc::clone(&fixture.store) as Arc<dyn QueryStore>,
    )
}

fn publish(fixture: &Fixture, result: &WriteResult) {
    let info = BatchInfo {
        simulation_run_id: RUN.into(),
        storage_path: result.path.clone(),
        tick_start: result.first_tick,
        tick_end: result.last_tick,
        written_at_ms: 1,
    };
    fixture.topic.writer().unwrap().send_message(&info).unwrap();
}

fn wait_until(what: &str, mut pred: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !pred() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn decodes_flat_indices_for_any_dimensionality() {
    let fixture = fixture();
    write_metadata(&fixture, &[10, 10, 10]);
    let batch = write_batch(&fixture, 0, 123);

    let service = service(&fixture, ChunkFilter::All);
    service.start().unwrap();
    publish(&fixture, &batch);
    wait_until("batch processed", || {
        service.metrics().batches_processed == 1
    });

    let row = fixture.store.get(RUN, 0).expect("row merged");
    assert!(row.is_snapshot);
    assert_eq!(row.cells[0].coord, vec![1, 2, 3]);
    assert_eq!(row.cells[0].molecule, 7);
    assert_eq!(row.organisms[0].energy, 77);
    assert_eq!(service.metrics().ticks_processed, 1);
    assert!(service.metrics().is_healthy);

    service.stop();
    assert_eq!(service.state(), ServiceState::Stopped);
}

#[test]
fn reprocessing_after_a_lost_ack_leaves_the_store_unchanged() {
    let fixture = fixture();
    write_metadata(&fixture, &[10, 10]);
    let batch = write_batch(&fixture, 0, 11);

    let service = service(&fixture, ChunkFilter::All);
    service.start().unwrap();
    publish(&fixture, &batch);
    wait_until("first pass", || service.metrics().batches_processed == 1);
    let rows_after_first = fixture.store.row_count();

    // the ack was lost: the broker redelivers the same notification
    publish(&fixture, &batch);
    wait_until("second pass", || service.metrics().batches_processed == 2);
    assert_eq!(fixture.store.row_count(), rows_after_first);

    service.stop();
}

#[test]
fn organism_indexers_skip_cells_at_the_wire_level() {
    let fixture = fixture();
    write_metadata(&fixture, &[10, 10]);
    let batch = write_batch(&fixture, 3, 42);

    let service = service(&fixture, ChunkFilter::SkipCells);
    service.start().unwrap();
    publish(&fixture, &batch);
    wait_until("batch processed", || {
        service.metrics().batches_processed == 1
    });

    let row = fixture.store.get(RUN, 3).expect("row merged");
    assert!(row.cells.is_empty());
    assert_eq!(row.organisms.len(), 1);
    service.stop();
}

#[test]
fn missing_metadata_transitions_to_error() {
    let fixture = fixture();
    let service = IndexerService::new(
        IndexerConfig {
            metadata_max_poll_duration_ms: 80,
            metadata_poll_interval_ms: 10,
            ..test_config()
        },
        RUN,
        "indexer",
        ChunkFilter::All,
        Arc::clone(&fixture.storage) as Arc<dyn StorageResource>,
        Arc::clone(&fixture.topic),
        Arc::clone(&fixture.store) as Arc<dyn QueryStore>,
    );
    service.start().unwrap();
    wait_until("error state", || service.state() == ServiceState::Error);
    assert!(!service.metrics().is_healthy);
}

#[test]
fn unreadable_batches_are_not_acknowledged() {
    let fixture = fixture();
    write_metadata(&fixture, &[10, 10]);

    let service = service(&fixture, ChunkFilter::All);
    service.start().unwrap();
    wait_until("service running", || service.state() == ServiceState::Running);
    // notification referencing a file that does not exist
    let info = BatchInfo {
        simulation_run_id: RUN.into(),
        storage_path: format!("{}/raw/000/000/batch_{:019}_{:019}.pb.zst", RUN, 0, 9),
        tick_start: 0,
        tick_end: 9,
        written_at_ms: 1,
    };
    fixture.topic.writer().unwrap().send_message(&info).unwrap();
    wait_until("failure observed", || !service.metrics().is_healthy);
    assert_eq!(service.metrics().batches_processed, 0);

    // the claim stays with the broker; forcing recovery redelivers it
    assert_eq!(fixture.topic.recover_stuck_readers(), 0);
    service.stop();
}

#[test]
fn double_start_is_rejected() {
    let fixture = fixture();
    write_metadata(&fixture, &[10, 10]);
    let service = service(&fixture, ChunkFilter::All);
    service.start().unwrap();
    assert!(matches!(service.start(), Err(IndexerError::AlreadyStarted)));
    service.stop();
}

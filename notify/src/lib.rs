//! Durable shared-subscription topics.
//!
//! A [`TopicResource`] binds a base topic name to a simulation run and
//! hands out writer and reader delegates. Every distinct consumer group
//! gets its own durable queue; readers in one group are competing
//! consumers with per-message acknowledgement. A per-topic watchdog
//! recovers messages stuck behind a reader that stopped acknowledging.

mod broker;

pub use broker::{AckToken, Broker, EmbeddedBroker, ReaderId};

use evochora_app_config::TopicConfig;
use evochora_channel::{bounded, Receiver, SIGNAL_CHANNEL_SIZE};
use evochora_logger::{debug, warn};
use evochora_protocol::TopicEnvelope;
use evochora_stop_handler::StopHandler;
use parking_lot::Mutex;
use prost::Message;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Topic layer failures.
#[derive(Debug, Error)]
pub enum NotifyError {
    /// The operation needs a run id and none was set. Raised before any
    /// message can be routed to the base topic, which has no subscribers.
    #[error("topic {0} has no run id set")]
    InvalidState(String),
    /// The broker refused or failed an operation.
    #[error("broker error: {0}")]
    Broker(String),
}

/// Shorthand result type for topic operations.
pub type Result<T> = std::result::Result<T, NotifyError>;

/// Registry of live readers, scanned by the watchdog.
///
/// The resource owns the registry; each reader holds its state in an `Arc`
/// the registry only weakly references, so a dropped reader unregisters
/// itself by ceasing to upgrade.
#[derive(Default)]
struct ReaderRegistry {
    readers: Mutex<Vec<Weak<ReaderShared>>>,
}

struct ReaderShared {
    broker: Arc<dyn Broker>,
    address: String,
    group: String,
    reader_id: ReaderId,
    closed: AtomicBool,
}

/// A named topic bound to a broker, with optional per-run isolation.
pub struct TopicResource {
    broker: Arc<dyn Broker>,
    base_name: String,
    run_id: Option<String>,
    claim_timeout: Duration,
    retention_enabled: bool,
    registry: Arc<ReaderRegistry>,
    /// Fast path for queue-existence checks this process already made.
    known_subscriptions: Mutex<HashSet<(String, String)>>,
    next_reader: AtomicU64,
    watchdog: Mutex<Option<StopHandler<()>>>,
}

impl TopicResource {
    /// Binds a topic to a broker using the validated configuration.
    pub fn new(broker: Arc<dyn Broker>, config: &TopicConfig) -> TopicResource {
        TopicResource {
            broker,
            base_name: config.topic_name.clone(),
            run_id: None,
            claim_timeout: Duration::from_secs(config.claim_timeout_secs),
            retention_enabled: config.retention_enabled,
            registry: Arc::new(ReaderRegistry::default()),
            known_subscriptions: Mutex::new(HashSet::new()),
            next_reader: AtomicU64::new(1),
            watchdog: Mutex::new(None),
        }
    }

    /// Scopes the topic to one simulation run.
    pub fn with_run_id(mut self, run_id: &str) -> TopicResource {
        self.run_id = Some(run_id.to_owned());
        self
    }

    /// The effective per-run topic name, `<base>_<runId>`.
    pub fn effective_name(&self) -> Result<String> {
        match &self.run_id {
            Some(run_id) => Ok(format!("{}_{}", self.base_name, run_id)),
            None => Err(NotifyError::InvalidState(self.base_name.clone())),
        }
    }

    /// Creates a writer delegate. Fails fast without a run id.
    pub fn writer(&self) -> Result<TopicWriter> {
        Ok(TopicWriter {
            broker: Arc::clone(&self.broker),
            address: self.effective_name()?,
        })
    }

    /// Creates a reader delegate for a consumer group.
    ///
    /// The first subscriber of a group checks queue existence directly
    /// against the broker; if that query fails the reader refuses to start
    /// rather than guess. A missing queue is created and, when retention
    /// is enabled, seeded by replaying the retained journal.
    pub fn reader(&self, group: &str) -> Result<TopicReader> {
        let address = self.effective_name()?;
        let key = (address.clone(), group.to_owned());
        if !self.known_subscriptions.lock().contains(&key) {
            let exists = self.broker.queue_exists(&address, group)?;
            if !exists {
                debug!(
                    "first subscription of group {} on {}; replay={}",
                    group, address, self.retention_enabled
                );
                self.broker
                    .ensure_queue(&address, group, self.retention_enabled)?;
            }
            self.known_subscriptions.lock().insert(key);
        }

        let shared = Arc::new(ReaderShared {
            broker: Arc::clone(&self.broker),
            address,
            group: group.to_owned(),
            reader_id: self.next_reader.fetch_add(1, Ordering::Relaxed),
            closed: AtomicBool::new(false),
        });
        self.registry.readers.lock().push(Arc::downgrade(&shared));
        self.ensure_watchdog();
        Ok(TopicReader { shared })
    }

    /// One watchdog pass: recovers the session of every reader whose
    /// oldest claimed message is older than the claim timeout. Returns
    /// the number of recovered messages. The background watchdog calls
    /// this on its interval; tests and operators may call it directly.
    pub fn recover_stuck_readers(&self) -> usize {
        recover_stuck(&self.registry, self.claim_timeout)
    }

    fn ensure_watchdog(&self) {
        let mut guard = self.watchdog.lock();
        if guard.is_some() {
            return;
        }
        let interval = watchdog_interval(self.claim_timeout);
        let registry = Arc::clone(&self.registry);
        let claim_timeout = self.claim_timeout;
        let (signal_tx, signal_rx) = bounded::<()>(SIGNAL_CHANNEL_SIZE);
        let name = format!("topic-watchdog-{}", self.base_name);
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || watchdog_main(&registry, claim_timeout, interval, &signal_rx))
            .expect("spawn topic watchdog");
        *guard = Some(StopHandler::new(&name, signal_tx, thread));
    }
}

/// Watchdog period: `max(10, min(60, claim_timeout / 10))` seconds.
fn watchdog_interval(claim_timeout: Duration) -> Duration {
    Duration::from_secs((claim_timeout.as_secs() / 10).clamp(10, 60))
}

fn watchdog_main(
    registry: &ReaderRegistry,
    claim_timeout: Duration,
    interval: Duration,
    signal: &Receiver<()>,
) {
    loop {
        match signal.recv_timeout(interval) {
            Err(evochora_channel::RecvTimeoutError::Timeout) => {
                recover_stuck(registry, claim_timeout);
            }
            _ => {
                debug!("topic watchdog stopping");
                break;
            }
        }
    }
}

fn recover_stuck(registry: &ReaderRegistry, claim_timeout: Duration) -> usize {
    let readers: Vec<Arc<ReaderShared>> = {
        let mut guard = registry.readers.lock();
        guard.retain(|weak| weak.strong_count() > 0);
        guard.iter().filter_map(Weak::upgrade).collect()
    };
    let mut recovered = 0;
    for reader in readers {
        if reader.closed.load(Ordering::Relaxed) {
            continue;
        }
        let oldest = match reader.broker.oldest_unacked_ms(
            &reader.address,
            &reader.group,
            reader.reader_id,
        ) {
            Ok(oldest) => oldest,
            Err(error) => {
                warn!("watchdog probe failed on {}: {}", reader.address, error);
                continue;
            }
        };
        if oldest.map_or(false, |age| age > claim_timeout.as_millis() as u64) {
            match reader
                .broker
                .recover_reader(&reader.address, &reader.group, reader.reader_id)
            {
                Ok(count) => {
                    warn!(
                        "reader {} on {}/{} stuck; recovered {} messages",
                        reader.reader_id, reader.address, reader.group, count
                    );
                    recovered += count;
                }
                Err(error) => warn!("session recovery failed on {}: {}", reader.address, error),
            }
        }
    }
    recovered
}

/// Writer delegate: stateless, safe to use from any thread.
pub struct TopicWriter {
    broker: Arc<dyn Broker>,
    address: String,
}

impl TopicWriter {
    /// Publishes raw payload bytes; returns the generated message id.
    pub fn send_bytes(&self, payload: Vec<u8>) -> Result<String> {
        let message_id = Uuid::new_v4().to_string();
        self.broker.publish(
            &self.address,
            TopicEnvelope {
                message_id: message_id.clone(),
                payload,
            },
        )?;
        Ok(message_id)
    }

    /// Encodes and publishes a typed message.
    pub fn send_message<M: Message>(&self, message: &M) -> Result<String> {
        self.send_bytes(message.encode_to_vec())
    }
}

/// Reader delegate: a long-lived competing-consumer session.
pub struct TopicReader {
    shared: Arc<ReaderShared>,
}

impl TopicReader {
    /// Receives the next message, blocking up to `timeout`.
    pub fn receive(&self, timeout: Duration) -> Result<Option<(TopicEnvelope, AckHandle)>> {
        let received = self.shared.broker.receive(
            &self.shared.address,
            &self.shared.group,
            self.shared.reader_id,
            timeout,
        )?;
        Ok(received.map(|(envelope, token)| {
            (
                envelope,
                AckHandle {
                    broker: Arc::clone(&self.shared.broker),
                    token,
                },
            )
        }))
    }

    /// The consumer group this reader competes in.
    pub fn group(&self) -> &str {
        &self.shared.group
    }
}

impl Drop for TopicReader {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Relaxed);
        // hand unacknowledged claims back to the group
        if let Err(error) = self.shared.broker.recover_reader(
            &self.shared.address,
            &self.shared.group,
            self.shared.reader_id,
        ) {
            warn!(
                "closing reader {} on {}: session recovery failed: {}",
                self.shared.reader_id, self.shared.address, error
            );
        }
    }
}

/// Acknowledgement handle for one received message.
pub struct AckHandle {
    broker: Arc<dyn Broker>,
    token: AckToken,
}

impl AckHandle {
    /// Settles the message after successful processing.
    pub fn ack(self) -> Result<()> {
        self.broker.ack(&self.token)
    }

    /// The message id this handle settles.
    pub fn message_id(&self) -> &str {
        &self.token.message_id
    }
}

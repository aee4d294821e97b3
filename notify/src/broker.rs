//! The broker abstraction and the embedded in-process implementation.

use crate::{NotifyError, Result};
use evochora_protocol::TopicEnvelope;
use evochora_systemtime::unix_time_as_millis;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// Identifies one reader session within a consumer group.
pub type ReaderId = u64;

/// Claim handle returned with every received message; feed it back to
/// [`Broker::ack`] after successful processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckToken {
    pub(crate) address: String,
    pub(crate) group: String,
    pub(crate) reader: ReaderId,
    pub(crate) message_id: String,
}

/// Minimal broker surface the topic layer needs.
///
/// The embedded implementation below covers single-process deployments;
/// external brokers implement the same contract. `queue_exists` must be a
/// direct query; guessing silently loses or duplicates replayed history.
pub trait Broker: Send + Sync {
    /// Appends to the address and to every existing group queue.
    fn publish(&self, address: &str, envelope: TopicEnvelope) -> Result<()>;

    /// Whether the consumer-group queue already exists.
    fn queue_exists(&self, address: &str, group: &str) -> Result<bool>;

    /// Creates the group queue; with `replay`, seeds it from the retained
    /// journal before normal consumption begins.
    fn ensure_queue(&self, address: &str, group: &str, replay: bool) -> Result<()>;

    /// Competing-consumer receive: at most one reader sees each message.
    fn receive(
        &self,
        address: &str,
        group: &str,
        reader: ReaderId,
        timeout: Duration,
    ) -> Result<Option<(TopicEnvelope, AckToken)>>;

    /// Settles a claimed message.
    fn ack(&self, token: &AckToken) -> Result<()>;

    /// Session recovery: requeues everything `reader` has claimed but not
    /// acknowledged, making it deliverable to other consumers.
    fn recover_reader(&self, address: &str, group: &str, reader: ReaderId) -> Result<usize>;

    /// Age in milliseconds of the oldest message claimed by `reader`.
    fn oldest_unacked_ms(&self, address: &str, group: &str, reader: ReaderId)
        -> Result<Option<u64>>;
}

struct InFlight {
    envelope: TopicEnvelope,
    reader: ReaderId,
    claimed_at_ms: u64,
}

#[derive(Default)]
struct GroupQueue {
    ready: VecDeque<TopicEnvelope>,
    in_flight: HashMap<String, InFlight>,
}

#[derive(Default)]
struct Address {
    /// Journal of every message ever published here, for new-group replay.
    retained: Vec<TopicEnvelope>,
    groups: HashMap<String, GroupQueue>,
}

/// In-process broker with per-group durable queues.
///
/// Durability spans the process lifetime; long-lived deployments point the
/// topic layer at an external broker instead.
pub struct EmbeddedBroker {
    state: Mutex<HashMap<String, Address>>,
    arrivals: Condvar,
    retention_enabled: bool,
}

impl EmbeddedBroker {
    /// Creates a broker; `retention_enabled` keeps the replay journal.
    pub fn new(retention_enabled: bool) -> EmbeddedBroker {
        EmbeddedBroker {
            state: Mutex::new(HashMap::new()),
            arrivals: Condvar::new(),
            retention_enabled,
        }
    }
}

impl Broker for EmbeddedBroker {
    fn publish(&self, address: &str, envelope: TopicEnvelope) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state.entry(address.to_owned()).or_default();
        for queue in entry.groups.values_mut() {
            queue.ready.push_back(envelope.clone());
        }
        if self.retention_enabled {
            entry.retained.push(envelope);
        }
        drop(state);
        self.arrivals.notify_all();
        Ok(())
    }

    fn queue_exists(&self, address: &str, group: &str) -> Result<bool> {
        let state = self.state.lock();
        Ok(state
            .get(address)
            .map(|a| a.groups.contains_key(group))
            .unwrap_or(false))
    }

    fn ensure_queue(&self, address: &str, group: &str, replay: bool) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state.entry(address.to_owned()).or_default();
        if entry.groups.contains_key(group) {
            return Ok(());
        }
        let mut queue = GroupQueue::default();
        if replay {
            queue.ready.extend(entry.retained.iter().cloned());
        }
        entry.groups.insert(group.to_owned(), queue);
        Ok(())
    }

    fn receive(
        &self,
        address: &str,
        group: &str,
        reader: ReaderId,
        timeout: Duration,
    ) -> Result<Option<(TopicEnvelope, AckToken)>> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            let envelope = state
                .get_mut(address)
                .and_then(|a| a.groups.get_mut(group))
                .and_then(|queue| {
                    let envelope = queue.ready.pop_front()?;
                    queue.in_flight.insert(
                        envelope.message_id.clone(),
                        InFlight {
                            envelope: envelope.clone(),
                            reader,
                            claimed_at_ms: unix_time_as_millis(),
                        },
                    );
                    Some(envelope)
                });
            if let Some(envelope) = envelope {
                let token = AckToken {
                    address: address.to_owned(),
                    group: group.to_owned(),
                    reader,
                    message_id: envelope.message_id.clone(),
                };
                return Ok(Some((envelope, token)));
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            if self
                .arrivals
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return Ok(None);
            }
        }
    }

    fn ack(&self, token: &AckToken) -> Result<()> {
        let mut state = self.state.lock();
        let removed = state
            .get_mut(&token.address)
            .and_then(|a| a.groups.get_mut(&token.group))
            .and_then(|queue| queue.in_flight.remove(&token.message_id));
        match removed {
            Some(_) => Ok(()),
            None => Err(NotifyError::Broker(format!(
                "ack of unknown message {} on {}/{}",
                token.message_id, token.address, token.group
            ))),
        }
    }

    fn recover_reader(&self, address: &str, group: &str, reader: ReaderId) -> Result<usize> {
        let mut state = self.state.lock();
        let Some(queue) = state.get_mut(address).and_then(|a| a.groups.get_mut(group)) else {
            return Ok(0);
        };
        let stuck: Vec<String> = queue
            .in_flight
            .iter()
            .filter(|(_, claim)| claim.reader == reader)
            .map(|(id, _)| id.clone())
            .collect();
        let mut recovered: Vec<InFlight> = stuck
            .iter()
            .filter_map(|id| queue.in_flight.remove(id))
            .collect();
        // redeliver oldest claims first
        recovered.sort_by_key(|claim| claim.claimed_at_ms);
        let count = recovered.len();
        for claim in recovered.into_iter().rev() {
            queue.ready.push_front(claim.envelope);
        }
        drop(state);
        if count > 0 {
            self.arrivals.notify_all();
        }
        Ok(count)
    }

    fn oldest_unacked_ms(
        &self,
        address: &str,
        group: &str,
        reader: ReaderId,
    ) -> Result<Option<u64>> {
        let state = self.state.lock();
        let now = unix_time_as_millis();
        Ok(state
            .get(address)
            .and_then(|a| a.groups.get(group))
            .and_then(|queue| {
                queue
                    .in_flight
                    .values()
                    .filter(|claim| claim.reader == reader)
                    .map(|claim| now.saturating_sub(claim.claimed_at_ms))
                    .max()
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn envelope(id: &str) -> TopicEnvelope {
        TopicEnvelope {
            message_id: id.to_owned(),
            payload: id.as_bytes().to_vec(),
        }
    }

    #[test]
    fn groups_compete_within_but_not_across() {
        let broker = EmbeddedBroker::new(true);
        broker.ensure_queue("t", "g1", false).unwrap();
        broker.ensure_queue("t", "g2", false).unwrap();
        broker.publish("t", envelope("m1")).unwrap();

        // both groups see the message
        let (a, _) = broker
            .receive("t", "g1", 1, Duration::from_millis(10))
            .unwrap()
            .unwrap();
        let (b, _) = broker
            .receive("t", "g2", 1, Duration::from_millis(10))
            .unwrap()
            .unwrap();
        assert_eq!(a.message_id, "m1");
        assert_eq!(b.message_id, "m1");

        // but within one group it was delivered exactly once
        assert!(broker
            .receive("t", "g1", 2, Duration::from_millis(10))
            .unwrap()
            .is_none());
    }

    #[test]
    fn new_group_replays_the_journal() {
        let broker = EmbeddedBroker::new(true);
        broker.publish("t", envelope("m1")).unwrap();
        broker.publish("t", envelope("m2")).unwrap();

        assert!(!broker.queue_exists("t", "late").unwrap());
        broker.ensure_queue("t", "late", true).unwrap();
        let (first, _) = broker
            .receive("t", "late", 1, Duration::from_millis(10))
            .unwrap()
            .unwrap();
        assert_eq!(first.message_id, "m1");
    }

    #[test]
    fn without_retention_new_groups_start_empty() {
        let broker = EmbeddedBroker::new(false);
        broker.publish("t", envelope("m1")).unwrap();
        broker.ensure_queue("t", "late", true).unwrap();
        assert!(broker
            .receive("t", "late", 1, Duration::from_millis(10))
            .unwrap()
            .is_none());
    }

    #[test]
    fn recovery_requeues_unacked_claims_in_order() {
        let broker = EmbeddedBroker::new(false);
        broker.ensure_queue("t", "g", false).unwrap();
        broker.publish("t", envelope("m1")).unwrap();
        broker.publish("t", envelope("m2")).unwrap();

        let (_, t1) = broker
            .receive("t", "g", 7, Duration::from_millis(10))
            .unwrap()
            .unwrap();
        broker.receive("t", "g", 7, Duration::from_millis(10)).unwrap();
        broker.ack(&t1).unwrap();

        assert_eq!(broker.recover_reader("t", "g", 7).unwrap(), 1);
        let (redelivered, _) = broker
            .receive("t", "g", 8, Duration::from_millis(10))
            .unwrap()
            .unwrap();
        assert_eq!(redelivered.message_id, "m2");
    }

    #[test]
    fn double_ack_is_an_error() {
        let broker = EmbeddedBroker::new(false);
        broker.ensure_queue("t", "g", false).unwrap();
        broker.publish("t", envelope("m1")).unwrap();
        let (_, token) = broker
            .receive("t", "g", 1, Duration::from_millis(10))
            .unwrap()
            .unwrap();
        broker.ack(&token).unwrap();
        assert!(broker.ack(&token).is_err());
    }

    #[test]
    fn blocking_receive_wakes_on_publish() {
        let broker = Arc::new(EmbeddedBroker::new(false));
        broker.ensure_queue("t", "g", false).unwrap();
        let waiter = {
            let broker = Arc::clone(&broker);
            std::thread::spawn(move || broker.receive("t", "g", 1, Duration::from_secs(5)))
        };
        std::thread::sleep(Duration::from_millis(50));
        broker.publish("t", envelope("m1")).unwrap();
        let received = waiter.join().unwrap().unwrap();
        assert_eq!(received.unwrap().0.message_id, "m1");
    }
}

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Topic(pub &'static str);

impl Topic {
    pub fn name(&self) -> &'static str {
        self.0
    }
}

#[derive(Debug, Clone)]
pub struct EventEnvelope<T: Clone + Send + Sync + Debug + 'static> {
    pub topic: Topic,
    pub payload: T,
    pub ts_ms: u128,
}

/// Topic-keyed broadcast bus.
///
/// Publishing never blocks and never fails: an event published to a topic with
/// no live subscribers is dropped. Slow subscribers observe `Lagged` on their
/// receiver once the per-topic buffer overflows.
#[derive(Clone)]
pub struct EventBus<T: Clone + Send + Sync + Debug + 'static> {
    inner: Arc<RwLock<Inner<T>>>,
    subscribe_buffer: usize,
}

struct Inner<T: Clone + Send + Sync + Debug + 'static> {
    topics: HashMap<&'static str, broadcast::Sender<EventEnvelope<T>>>,
}

impl<T: Clone + Send + Sync + Debug + 'static> Default for EventBus<T> {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl<T: Clone + Send + Sync + Debug + 'static> EventBus<T> {
    pub fn new(subscribe_buffer: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                topics: HashMap::new(),
            })),
            subscribe_buffer: subscribe_buffer.max(1),
        }
    }

    fn sender(&self, topic: Topic) -> broadcast::Sender<EventEnvelope<T>> {
        if let Some(tx) = self.inner.read().topics.get(topic.0) {
            return tx.clone();
        }

        let mut inner = self.inner.write();
        inner
            .topics
            .entry(topic.0)
            .or_insert_with(|| {
                info!(target: "event_bus", topic = topic.0, "created topic");
                broadcast::channel(self.subscribe_buffer).0
            })
            .clone()
    }

    /// Publish `payload` on `topic`; returns how many subscribers received it.
    pub fn publish(&self, topic: Topic, payload: T) -> usize {
        let envelope = EventEnvelope {
            topic,
            payload,
            ts_ms: current_ts_ms(),
        };
        match self.sender(topic).send(envelope) {
            Ok(receivers) => {
                debug!(target: "event_bus", topic = topic.0, receivers, "published");
                receivers
            }
            Err(_) => {
                trace!(target: "event_bus", topic = topic.0, "no subscribers");
                0
            }
        }
    }

    pub fn subscribe(&self, topic: Topic) -> broadcast::Receiver<EventEnvelope<T>> {
        self.sender(topic).subscribe()
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.inner
            .read()
            .topics
            .get(topic.0)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

fn current_ts_ms() -> u128 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

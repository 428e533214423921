//! In-process `direct` exchange.
//!
//! Each `(exchange, routing_key)` pair maps to one queue with at most one
//! consumer. Durable queues hold messages published while nobody is
//! consuming and hand them over, in publish order, to the next consumer.
//! Non-durable queues drop such messages.
//!
//! When an [`Outlet`] is attached, durable messages that no consumer in
//! this process takes go to the outlet instead of the backlog. A relay on
//! the other end can hand them to consumers in other processes.

use std::collections::{HashMap, VecDeque};
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use futures::stream::Stream;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::config::{RoutingConfig, DEFAULT_EXCHANGE_TYPE};
use crate::error::{BusError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct QueueKey {
    exchange: String,
    routing_key: String,
}

impl QueueKey {
    fn new(exchange: &str, routing_key: &str) -> Self {
        Self {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct Queue {
    consumer: Option<mpsc::UnboundedSender<Value>>,
    backlog: VecDeque<Value>,
    durable: bool,
}

impl Queue {
    fn has_live_consumer(&self) -> bool {
        self.consumer.as_ref().is_some_and(|tx| !tx.is_closed())
    }
}

#[derive(Debug, Default)]
struct Exchange {
    queues: HashMap<QueueKey, Queue>,
    outlet: Option<mpsc::UnboundedSender<Unconsumed>>,
}

impl Exchange {
    fn live_outlet(&self) -> Option<&mpsc::UnboundedSender<Unconsumed>> {
        self.outlet.as_ref().filter(|tx| !tx.is_closed())
    }
}

/// A durable message that no consumer in this process took.
#[derive(Debug, Clone, PartialEq)]
pub struct Unconsumed {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Value,
}

/// Handle to the exchange. Cheap to clone; clones share the same queues.
#[derive(Debug, Clone, Default)]
pub struct MessageBus {
    exchange: Arc<Mutex<Exchange>>,
}

impl MessageBus {
    /// Create an empty exchange.
    pub fn new() -> Self {
        Self::default()
    }

    fn exchange(&self) -> MutexGuard<'_, Exchange> {
        self.exchange.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Serialize `payload` and publish it according to `routing`.
    pub fn publish<T: Serialize>(&self, routing: &RoutingConfig, payload: &T) -> Result<()> {
        let value = serde_json::to_value(payload)?;
        self.publish_value(routing, value)
    }

    /// Publish an already-encoded JSON payload.
    pub fn publish_value(&self, routing: &RoutingConfig, value: Value) -> Result<()> {
        if routing.exchange_type != DEFAULT_EXCHANGE_TYPE {
            return Err(BusError::Config(format!(
                "unsupported exchange type {}",
                routing.exchange_type
            )));
        }

        let key = QueueKey::new(&routing.exchange, &routing.routing_key);
        let mut exchange = self.exchange();
        let exchange = &mut *exchange;
        let queue = exchange.queues.entry(key).or_default();
        queue.durable |= routing.durable;

        let value = match queue.consumer.take() {
            Some(tx) => match tx.send(value) {
                Ok(()) => {
                    queue.consumer = Some(tx);
                    trace!(routing_key = %routing.routing_key, "Delivered message");
                    return Ok(());
                }
                Err(mpsc::error::SendError(value)) => value,
            },
            None => value,
        };

        if !queue.durable {
            debug!(routing_key = %routing.routing_key, "No consumer attached, message dropped");
            return Ok(());
        }

        let value = match exchange.outlet.as_ref().filter(|tx| !tx.is_closed()) {
            Some(outlet) => match outlet.send(Unconsumed {
                exchange: routing.exchange.clone(),
                routing_key: routing.routing_key.clone(),
                payload: value,
            }) {
                Ok(()) => {
                    trace!(routing_key = %routing.routing_key, "Message sent to outlet");
                    return Ok(());
                }
                Err(mpsc::error::SendError(unconsumed)) => unconsumed.payload,
            },
            None => value,
        };

        queue.backlog.push_back(value);
        debug!(
            routing_key = %routing.routing_key,
            backlog = queue.backlog.len(),
            "No consumer attached, message queued"
        );

        Ok(())
    }

    /// Attach a consumer to a queue, declaring it (durable) if needed.
    ///
    /// Any backlog is delivered first. Fails if another consumer is still
    /// attached.
    pub fn consume<T: DeserializeOwned>(
        &self,
        exchange: &str,
        routing_key: &str,
    ) -> Result<Consumer<T>> {
        let mut state = self.exchange();
        let queue = state
            .queues
            .entry(QueueKey::new(exchange, routing_key))
            .or_default();

        if queue.has_live_consumer() {
            return Err(BusError::AlreadyConsumed {
                queue: routing_key.to_string(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        while let Some(value) = queue.backlog.pop_front() {
            // The receiver is alive in this scope, so this cannot fail.
            let _ = tx.send(value);
        }
        queue.consumer = Some(tx);
        queue.durable = true;

        debug!(exchange = %exchange, routing_key = %routing_key, "Consumer attached");

        Ok(Consumer {
            queue: routing_key.to_string(),
            receiver: rx,
            _marker: PhantomData,
        })
    }

    /// Attach the outlet for durable messages no local consumer takes.
    ///
    /// Backlogs of queues without a live consumer move to the outlet at
    /// once. Fails if another outlet is still attached.
    pub fn attach_outlet(&self) -> Result<Outlet> {
        let mut state = self.exchange();
        if state.live_outlet().is_some() {
            return Err(BusError::AlreadyConsumed {
                queue: "outlet".to_string(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut moved = 0;
        for (key, queue) in state.queues.iter_mut() {
            if queue.has_live_consumer() {
                continue;
            }
            for payload in queue.backlog.drain(..) {
                // The receiver is alive in this scope, so this cannot fail.
                let _ = tx.send(Unconsumed {
                    exchange: key.exchange.clone(),
                    routing_key: key.routing_key.clone(),
                    payload,
                });
                moved += 1;
            }
        }
        state.outlet = Some(tx);

        debug!(moved, "Outlet attached");
        Ok(Outlet { receiver: rx })
    }

    /// Create a publisher bound to one routing config.
    pub fn publisher(&self, routing: RoutingConfig) -> Publisher {
        Publisher {
            bus: self.clone(),
            routing,
        }
    }

    /// Remove and return messages waiting on a queue that has no consumer.
    pub fn take_messages(&self, exchange: &str, routing_key: &str) -> Vec<Value> {
        let mut state = self.exchange();
        match state.queues.get_mut(&QueueKey::new(exchange, routing_key)) {
            Some(queue) => queue.backlog.drain(..).collect(),
            None => Vec::new(),
        }
    }

    /// Whether a consumer in this process is attached to a queue.
    pub fn has_consumer(&self, exchange: &str, routing_key: &str) -> bool {
        self.exchange()
            .queues
            .get(&QueueKey::new(exchange, routing_key))
            .is_some_and(Queue::has_live_consumer)
    }

    /// Number of messages waiting on a queue that has no consumer.
    pub fn pending(&self, exchange: &str, routing_key: &str) -> usize {
        self.exchange()
            .queues
            .get(&QueueKey::new(exchange, routing_key))
            .map_or(0, |queue| queue.backlog.len())
    }
}

/// Publishes to a fixed routing config.
#[derive(Debug, Clone)]
pub struct Publisher {
    bus: MessageBus,
    routing: RoutingConfig,
}

impl Publisher {
    /// Publish a payload.
    pub fn publish<T: Serialize>(&self, payload: &T) -> Result<()> {
        self.bus.publish(&self.routing, payload)
    }

    /// The routing config this publisher uses.
    pub fn routing(&self) -> &RoutingConfig {
        &self.routing
    }
}

/// A stream of decoded messages from one queue.
///
/// Dropping the consumer detaches it; later messages go to the backlog.
pub struct Consumer<T> {
    queue: String,
    receiver: mpsc::UnboundedReceiver<Value>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Consumer<T> {
    /// Queue name (routing key) this consumer reads.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Wait for the next message.
    pub async fn recv(&mut self) -> Option<Result<T>> {
        let value = self.receiver.recv().await?;
        Some(self.decode(value))
    }

    /// Take the next message if one is ready.
    pub fn try_recv(&mut self) -> Option<Result<T>> {
        let value = self.receiver.try_recv().ok()?;
        Some(self.decode(value))
    }

    /// Stop receiving. Buffered messages can still be drained.
    pub fn close(&mut self) {
        self.receiver.close();
    }

    fn decode(&self, value: Value) -> Result<T> {
        serde_json::from_value(value).map_err(|e| BusError::InvalidMessage {
            queue: self.queue.clone(),
            reason: e.to_string(),
        })
    }
}

/// Receives durable messages that no consumer in this process took.
///
/// Dropping the outlet detaches it; later messages go to the backlog.
#[derive(Debug)]
pub struct Outlet {
    receiver: mpsc::UnboundedReceiver<Unconsumed>,
}

impl Outlet {
    /// Wait for the next message.
    pub async fn recv(&mut self) -> Option<Unconsumed> {
        self.receiver.recv().await
    }

    /// Take the next message if one is ready.
    pub fn try_recv(&mut self) -> Option<Unconsumed> {
        self.receiver.try_recv().ok()
    }

    /// Stop receiving. Buffered messages can still be drained.
    pub fn close(&mut self) {
        self.receiver.close();
    }
}

impl<T: DeserializeOwned> Stream for Consumer<T> {
    type Item = Result<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.receiver.poll_recv(cx) {
            Poll::Ready(Some(value)) => Poll::Ready(Some(self.decode(value))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

//! Broker gateway: the seam between the sides and a topic-exchange client.
//!
//! The [`Broker`] trait exposes the handful of operations the sides need:
//! declare an exchange, declare and bind a queue, publish a message with a
//! timeout, and subscribe a [`MessageHandler`] to a queue. Implementations do
//! not retry; retry policy belongs to callers.
//!
//! [`InMemoryBroker`](memory::InMemoryBroker) is an in-process topic exchange
//! with bounded queues and competing consumers. A networked client only has
//! to implement [`Broker`] to slot in underneath the sides.

pub mod memory;
pub mod topic;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

pub use memory::InMemoryBroker;

/// Default number of messages a queue buffers before publishers wait.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Exchange routing flavour. Only topic exchanges are used by the sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeKind {
    /// Routing by dotted key with `*`/`#` wildcards.
    Topic,
}

/// Parameters of an exchange declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    /// Exchange name.
    pub name: String,
    /// Routing flavour.
    pub kind: ExchangeKind,
}

impl ExchangeSpec {
    /// A topic exchange called `name`.
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Topic,
        }
    }
}

/// Parameters of a queue declaration.
///
/// Re-declaring a queue with an equal spec is a no-op; with a different spec
/// it fails with [`Error::QueueConflict`](crate::Error::QueueConflict).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    /// Queue name, also used as its binding key.
    pub name: String,
    /// Remove the queue once its last consumer goes away.
    pub auto_delete: bool,
    /// Buffered messages before publishers wait.
    pub capacity: usize,
}

impl QueueSpec {
    /// An auto-deleting queue with the default capacity.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            auto_delete: true,
            capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    /// Overrides the capacity.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Keeps the queue after its last consumer leaves.
    pub fn durable(mut self) -> Self {
        self.auto_delete = false;
        self
    }
}

/// A message handed to a subscriber.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Exchange the message was published to.
    pub exchange: String,
    /// Routing key it was published with.
    pub routing_key: String,
    /// Queue it was consumed from.
    pub queue: String,
    /// JSON payload.
    pub payload: Vec<u8>,
}

impl Delivery {
    /// Decodes the JSON payload.
    ///
    /// # Errors
    ///
    /// [`Error::Serialization`](crate::Error::Serialization) if the payload
    /// does not decode as `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Consumer callback for one queue.
///
/// Errors are logged by the broker; infrastructure errors additionally stop
/// the consumer.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Processes one delivery.
    async fn handle(&self, delivery: Delivery) -> Result<()>;
}

/// Adapter turning an async closure into a [`MessageHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Delivery) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, delivery: Delivery) -> Result<()> {
        (self.0)(delivery).await
    }
}

/// Wraps an async closure as a shareable handler.
///
/// # Examples
///
/// ```
/// use aide::broker::{handler_fn, Delivery};
///
/// let handler = handler_fn(|delivery: Delivery| async move {
///     tracing::info!(queue = %delivery.queue, "got message");
///     Ok::<(), aide::Error>(())
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// A running consumer.
///
/// Dropping the handle leaves the consumer running; call
/// [`unsubscribe`](Subscription::unsubscribe) to stop it.
#[derive(Debug)]
pub struct Subscription {
    queue: String,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Subscription {
    /// Wraps a spawned consumer loop.
    pub fn new(queue: impl Into<String>, token: CancellationToken, handle: JoinHandle<()>) -> Self {
        Self {
            queue: queue.into(),
            token,
            handle,
        }
    }

    /// Queue this consumer reads from.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Returns `true` once the consumer loop has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stops the consumer and waits for it to exit.
    pub async fn unsubscribe(self) {
        self.token.cancel();
        if let Err(err) = self.handle.await {
            tracing::warn!(queue = %self.queue, error = %err, "Consumer task ended abnormally");
        }
    }
}

/// Topic-exchange client used by the sides.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declares an exchange. Idempotent for equal specs.
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()>;

    /// Declares a queue and binds it to `exchange` under its own name.
    async fn declare_queue(&self, spec: &QueueSpec, exchange: &str) -> Result<()>;

    /// Adds an extra binding pattern (`*`/`#` wildcards) for a declared queue.
    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()>;

    /// Publishes `payload` with `routing_key`.
    ///
    /// Returns the number of queues the message was routed to. Fails with
    /// [`Error::PublishTimeout`](crate::Error::PublishTimeout) if a matching
    /// queue does not accept it within `timeout`.
    async fn publish(
        &self,
        payload: Vec<u8>,
        routing_key: &str,
        exchange: &str,
        timeout: Duration,
    ) -> Result<usize>;

    /// Starts a consumer on `queue`, declaring and binding it if needed.
    async fn subscribe(
        &self,
        queue: &str,
        exchange: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription>;

    /// Whether the connection is open.
    fn is_connected(&self) -> bool;

    /// Closes the connection and stops every consumer.
    async fn close(&self) -> Result<()>;
}

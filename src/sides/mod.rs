//! The three cooperating roles of an agent.
//!
//! - [`FacadeSide`] turns inbound requests into [`Task`](crate::Task)s and
//!   serves progress/result lookups from its cache.
//! - [`WorkerSide`] consumes tasks, runs the registered [`Action`] and
//!   publishes progress and the result.
//! - [`PersistenceSide`] stores every progress/result it observes and
//!   answers lookups with the stored value or a not-found sentinel.
//!
//! A side subscribes its fixed set of queues once, in `start`, and keeps
//! listening until [`shutdown`](FacadeSide::shutdown). Sides only hold a
//! [`Channels`] handle and (where needed) a memo store; there is no link back
//! to whatever owns them.

pub mod facade;
pub mod persistence;
pub mod worker;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};

use crate::addressing::Addressing;
use crate::broker::{handler_fn, Broker, Delivery, MessageHandler, Subscription};
use crate::error::{Error, Result};

pub use facade::{AgentRequest, EndpointResponse, FacadeOptions, FacadeSide, Lookup, PollHandle};
pub use persistence::PersistenceSide;
pub use worker::{Action, ActionRegistry, TaskReporter, WorkerSide};

/// A consumer that stopped because the broker failed underneath it.
#[derive(Debug)]
pub struct ConsumerFailure {
    /// Queue the consumer was reading.
    pub queue: String,
    /// The broker failure.
    pub error: Error,
}

/// Broker handle, queue naming and publish timeout shared by a side.
///
/// Consumers started through [`catch`](Self::catch) report broker failures
/// to [`next_failure`](Self::next_failure) before they stop.
#[derive(Clone)]
pub struct Channels {
    broker: Arc<dyn Broker>,
    addressing: Addressing,
    publish_timeout: Duration,
    failures: mpsc::UnboundedSender<ConsumerFailure>,
    failed: Arc<Mutex<mpsc::UnboundedReceiver<ConsumerFailure>>>,
}

impl std::fmt::Debug for Channels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channels")
            .field("addressing", &self.addressing)
            .field("publish_timeout", &self.publish_timeout)
            .finish()
    }
}

impl Channels {
    /// Bundles a broker with the queue naming of one agent.
    pub fn new(broker: Arc<dyn Broker>, addressing: Addressing, publish_timeout: Duration) -> Self {
        let (failures, failed) = mpsc::unbounded_channel();
        Self {
            broker,
            addressing,
            publish_timeout,
            failures,
            failed: Arc::new(Mutex::new(failed)),
        }
    }

    /// Queue naming for this agent.
    pub fn addressing(&self) -> &Addressing {
        &self.addressing
    }

    /// The underlying broker.
    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Timeout applied to every publish.
    pub fn publish_timeout(&self) -> Duration {
        self.publish_timeout
    }

    /// Serializes `message` as JSON and publishes it to `queue`.
    ///
    /// Returns the number of queues it was routed to.
    pub async fn push<T: Serialize + ?Sized>(&self, message: &T, queue: &str) -> Result<usize> {
        let payload = serde_json::to_vec(message)?;
        let routed = self
            .broker
            .publish(payload, queue, self.addressing.exchange(), self.publish_timeout)
            .await?;
        tracing::trace!(queue, routed, "Pushed message");
        Ok(routed)
    }

    /// Subscribes a raw handler to `queue`.
    pub async fn catch(&self, queue: &str, handler: Arc<dyn MessageHandler>) -> Result<Subscription> {
        let watched = Arc::new(Watched {
            queue: queue.to_string(),
            inner: handler,
            failures: self.failures.clone(),
        });
        self.broker
            .subscribe(queue, self.addressing.exchange(), watched)
            .await
    }

    /// Waits for the next consumer stopped by a broker failure.
    pub async fn next_failure(&self) -> Option<ConsumerFailure> {
        self.failed.lock().await.recv().await
    }

    /// Subscribes to `queue`, decoding each payload as `T` before calling `f`.
    ///
    /// Payloads that do not decode are reported as
    /// [`Error::Serialization`](crate::Error::Serialization) and skipped.
    pub async fn catch_json<T, F, Fut>(&self, queue: &str, f: F) -> Result<Subscription>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler = handler_fn(move |delivery: Delivery| {
            let next = delivery.json::<T>().map(&f);
            async move { next?.await }
        });
        self.catch(queue, handler).await
    }
}

/// Forwards broker failures of a handler to the owner of its [`Channels`].
struct Watched {
    queue: String,
    inner: Arc<dyn MessageHandler>,
    failures: mpsc::UnboundedSender<ConsumerFailure>,
}

#[async_trait]
impl MessageHandler for Watched {
    async fn handle(&self, delivery: Delivery) -> Result<()> {
        match self.inner.handle(delivery).await {
            Err(err) if err.is_infrastructure() => {
                tracing::error!(queue = %self.queue, error = %err, "Consumer failed on broker error");
                let stopped = Error::unavailable(format!("consumer of '{}' stopped", self.queue));
                let failure = ConsumerFailure {
                    queue: self.queue.clone(),
                    error: err,
                };
                if self.failures.send(failure).is_err() {
                    tracing::debug!(queue = %self.queue, "Nobody is watching consumer failures");
                }
                Err(stopped)
            },
            other => other,
        }
    }
}

/// Stops every subscription in `subscriptions`.
pub(crate) async fn unsubscribe_all(subscriptions: Vec<Subscription>) {
    futures::future::join_all(subscriptions.into_iter().map(Subscription::unsubscribe)).await;
}

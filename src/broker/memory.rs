//! In-process topic exchange.
//!
//! [`InMemoryBroker`] gives the sides the same contract a networked broker
//! would: exchanges and queues must be declared, queues are bound to an
//! exchange by pattern, each queue is a bounded FIFO shared by competing
//! consumers, and publishing waits for queue capacity up to a timeout.
//! Cloning the broker yields another handle to the same exchange, which is how
//! several sides in one process (or one test) share it.
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//! use aide::broker::{Broker, ExchangeSpec, InMemoryBroker, QueueSpec};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let broker = InMemoryBroker::new();
//! broker.declare_exchange(&ExchangeSpec::topic("aide")).await.unwrap();
//! broker.declare_queue(&QueueSpec::new("log.worker.worker.kin"), "aide").await.unwrap();
//!
//! let routed = broker
//!     .publish(b"\"hello\"".to_vec(), "log.worker.worker.kin", "aide", Duration::from_secs(1))
//!     .await
//!     .unwrap();
//! assert_eq!(routed, 1);
//! # });
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::topic;
use super::{Broker, Delivery, ExchangeSpec, MessageHandler, QueueSpec, Subscription};
use crate::error::{panic_message, Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    exchange: String,
    pattern: String,
}

struct QueueState {
    spec: QueueSpec,
    bindings: Mutex<Vec<Binding>>,
    sender: mpsc::Sender<Delivery>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<Delivery>>,
    consumers: AtomicUsize,
}

impl QueueState {
    fn new(spec: QueueSpec) -> Self {
        let (sender, receiver) = mpsc::channel(spec.capacity.max(1));
        Self {
            spec,
            bindings: Mutex::new(Vec::new()),
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
            consumers: AtomicUsize::new(0),
        }
    }

    fn bind(&self, exchange: &str, pattern: &str) {
        let binding = Binding {
            exchange: exchange.to_string(),
            pattern: pattern.to_string(),
        };
        let mut bindings = self.bindings.lock();
        if !bindings.contains(&binding) {
            bindings.push(binding);
        }
    }

    fn routes(&self, exchange: &str, routing_key: &str) -> bool {
        self.bindings
            .lock()
            .iter()
            .any(|b| b.exchange == exchange && topic::matches(&b.pattern, routing_key))
    }
}

struct Shared {
    connected: AtomicBool,
    shutdown: CancellationToken,
    exchanges: DashMap<String, ExchangeSpec>,
    queues: DashMap<String, Arc<QueueState>>,
}

/// In-process topic exchange shared by cloning.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBroker")
            .field("connected", &self.is_connected())
            .field("exchanges", &self.shared.exchanges.len())
            .field("queues", &self.shared.queues.len())
            .finish()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Opens a fresh, connected exchange.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                connected: AtomicBool::new(true),
                shutdown: CancellationToken::new(),
                exchanges: DashMap::new(),
                queues: DashMap::new(),
            }),
        }
    }

    /// Names of the currently declared queues, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .shared
            .queues
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Number of messages waiting in `queue`, if it exists.
    pub fn pending(&self, queue: &str) -> Option<usize> {
        self.shared
            .queues
            .get(queue)
            .map(|q| q.spec.capacity.max(1) - q.sender.capacity())
    }

    /// Number of consumers attached to `queue`, if it exists.
    pub fn consumer_count(&self, queue: &str) -> Option<usize> {
        self.shared
            .queues
            .get(queue)
            .map(|q| q.consumers.load(Ordering::SeqCst))
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::unavailable("connection closed"))
        }
    }

    fn ensure_exchange(&self, exchange: &str) -> Result<()> {
        if self.shared.exchanges.contains_key(exchange) {
            Ok(())
        } else {
            Err(Error::UnknownExchange {
                exchange: exchange.to_string(),
            })
        }
    }

    fn queue(&self, name: &str) -> Option<Arc<QueueState>> {
        self.shared.queues.get(name).map(|q| Arc::clone(q.value()))
    }

    fn release_consumer(shared: &Shared, queue: &Arc<QueueState>) {
        let remaining = queue.consumers.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 && queue.spec.auto_delete {
            shared
                .queues
                .remove_if(&queue.spec.name, |_, current| Arc::ptr_eq(current, queue));
            tracing::debug!(queue = %queue.spec.name, "Auto-deleted queue");
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()> {
        self.ensure_connected()?;
        let existing = self
            .shared
            .exchanges
            .entry(spec.name.clone())
            .or_insert_with(|| spec.clone());
        if *existing != *spec {
            return Err(Error::ExchangeConflict {
                exchange: spec.name.clone(),
            });
        }
        tracing::debug!(exchange = %spec.name, kind = ?spec.kind, "Declared exchange");
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec, exchange: &str) -> Result<()> {
        self.ensure_connected()?;
        self.ensure_exchange(exchange)?;
        let queue = Arc::clone(
            self.shared
                .queues
                .entry(spec.name.clone())
                .or_insert_with(|| Arc::new(QueueState::new(spec.clone())))
                .value(),
        );
        if queue.spec != *spec {
            return Err(Error::QueueConflict {
                queue: spec.name.clone(),
            });
        }
        queue.bind(exchange, &spec.name);
        tracing::debug!(queue = %spec.name, exchange, "Declared queue");
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        self.ensure_connected()?;
        self.ensure_exchange(exchange)?;
        let state = self.queue(queue).ok_or_else(|| Error::UnknownQueue {
            queue: queue.to_string(),
        })?;
        state.bind(exchange, pattern);
        Ok(())
    }

    async fn publish(
        &self,
        payload: Vec<u8>,
        routing_key: &str,
        exchange: &str,
        timeout: Duration,
    ) -> Result<usize> {
        self.ensure_connected()?;
        self.ensure_exchange(exchange)?;

        // Collect targets first so no map guard is held across an await.
        let targets: Vec<Arc<QueueState>> = self
            .shared
            .queues
            .iter()
            .filter(|entry| entry.value().routes(exchange, routing_key))
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        if targets.is_empty() {
            tracing::debug!(routing_key, exchange, "Message matched no queue");
        }

        let deadline = tokio::time::Instant::now() + timeout;
        let mut routed = 0;
        for queue in targets {
            let delivery = Delivery {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                queue: queue.spec.name.clone(),
                payload: payload.clone(),
            };
            match tokio::time::timeout_at(deadline, queue.sender.send(delivery)).await {
                Ok(Ok(())) => routed += 1,
                // Receiver gone: the queue was deleted concurrently.
                Ok(Err(_)) => {},
                Err(_) => {
                    return Err(Error::PublishTimeout {
                        queue: routing_key.to_string(),
                        timeout,
                    })
                },
            }
        }
        Ok(routed)
    }

    async fn subscribe(
        &self,
        queue: &str,
        exchange: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription> {
        self.ensure_connected()?;
        if self.queue(queue).is_none() {
            self.declare_queue(&QueueSpec::new(queue), exchange).await?;
        }
        let state = self.queue(queue).ok_or_else(|| Error::UnknownQueue {
            queue: queue.to_string(),
        })?;
        state.bind(exchange, queue);
        state.consumers.fetch_add(1, Ordering::SeqCst);

        let token = self.shared.shutdown.child_token();
        let loop_token = token.clone();
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = loop_token.cancelled() => None,
                    delivery = async { state.receiver.lock().await.recv().await } => delivery,
                };
                let Some(delivery) = next else { break };

                match AssertUnwindSafe(handler.handle(delivery)).catch_unwind().await {
                    Ok(Ok(())) => {},
                    Ok(Err(err)) if err.is_infrastructure() => {
                        tracing::error!(queue = %state.spec.name, error = %err, "Consumer stopped on broker failure");
                        break;
                    },
                    Ok(Err(err)) => {
                        tracing::error!(queue = %state.spec.name, error = %err, "Message handler failed");
                    },
                    Err(panic) => {
                        tracing::error!(
                            queue = %state.spec.name,
                            panic = %panic_message(&*panic),
                            "Message handler panicked"
                        );
                    },
                }
            }
            InMemoryBroker::release_consumer(&shared, &state);
        });

        tracing::debug!(queue, exchange, "Subscribed");
        Ok(Subscription::new(queue, token, handle))
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.shutdown.cancel();
        tracing::info!("Closed in-memory broker");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::handler_fn;

    const EXCHANGE: &str = "aide";

    async fn broker_with_exchange() -> InMemoryBroker {
        let broker = InMemoryBroker::new();
        broker
            .declare_exchange(&ExchangeSpec::topic(EXCHANGE))
            .await
            .unwrap();
        broker
    }

    #[tokio::test]
    async fn declare_queue_is_idempotent_for_equal_specs() {
        let broker = broker_with_exchange().await;
        let spec = QueueSpec::new("q");
        broker.declare_queue(&spec, EXCHANGE).await.unwrap();
        broker.declare_queue(&spec, EXCHANGE).await.unwrap();
        assert_eq!(broker.queue_names(), vec!["q".to_string()]);
    }

    #[tokio::test]
    async fn declare_queue_with_different_spec_conflicts() {
        let broker = broker_with_exchange().await;
        broker
            .declare_queue(&QueueSpec::new("q"), EXCHANGE)
            .await
            .unwrap();
        let err = broker
            .declare_queue(&QueueSpec::new("q").durable(), EXCHANGE)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QueueConflict { .. }));
    }

    #[tokio::test]
    async fn publish_requires_declared_exchange() {
        let broker = InMemoryBroker::new();
        let err = broker
            .publish(vec![], "q", "missing", Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownExchange { .. }));
    }

    #[tokio::test]
    async fn unrouted_publish_reports_zero() {
        let broker = broker_with_exchange().await;
        let routed = broker
            .publish(b"1".to_vec(), "nobody.listens", EXCHANGE, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(routed, 0);
    }

    #[tokio::test]
    async fn wildcard_binding_receives_copies() {
        let broker = broker_with_exchange().await;
        broker
            .declare_queue(&QueueSpec::new("log.worker.worker.kin"), EXCHANGE)
            .await
            .unwrap();
        broker
            .declare_queue(&QueueSpec::new("tap"), EXCHANGE)
            .await
            .unwrap();
        broker.bind_queue("tap", EXCHANGE, "log.#").await.unwrap();

        let routed = broker
            .publish(b"\"hi\"".to_vec(), "log.worker.worker.kin", EXCHANGE, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(routed, 2);
        assert_eq!(broker.pending("tap"), Some(1));
    }

    #[tokio::test]
    async fn full_queue_times_out() {
        let broker = broker_with_exchange().await;
        broker
            .declare_queue(&QueueSpec::new("tiny").with_capacity(1), EXCHANGE)
            .await
            .unwrap();
        broker
            .publish(b"1".to_vec(), "tiny", EXCHANGE, Duration::from_millis(10))
            .await
            .unwrap();
        let err = broker
            .publish(b"2".to_vec(), "tiny", EXCHANGE, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PublishTimeout { .. }));
    }

    #[tokio::test]
    async fn competing_consumers_share_messages() {
        let broker = broker_with_exchange().await;
        let seen = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();

        for _ in 0..2 {
            let seen = seen.clone();
            let tx = tx.clone();
            broker
                .subscribe(
                    "work",
                    EXCHANGE,
                    handler_fn(move |delivery: Delivery| {
                        let seen = seen.clone();
                        let tx = tx.clone();
                        async move {
                            seen.fetch_add(1, Ordering::SeqCst);
                            let _ = tx.send(delivery.payload);
                            Ok::<(), Error>(())
                        }
                    }),
                )
                .await
                .unwrap();
        }
        assert_eq!(broker.consumer_count("work"), Some(2));

        for i in 0..10 {
            broker
                .publish(format!("{i}").into_bytes(), "work", EXCHANGE, Duration::from_secs(1))
                .await
                .unwrap();
        }
        for _ in 0..10 {
            rx.recv().await.unwrap();
        }
        // Each message consumed exactly once across both consumers.
        assert_eq!(seen.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn panicking_handler_keeps_consuming() {
        let broker = broker_with_exchange().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = broker
            .subscribe(
                "fragile",
                EXCHANGE,
                handler_fn(move |delivery: Delivery| {
                    let tx = tx.clone();
                    async move {
                        if delivery.payload == b"\"boom\"" {
                            panic!("handler blew up");
                        }
                        let _ = tx.send(delivery.payload);
                        Ok::<(), Error>(())
                    }
                }),
            )
            .await
            .unwrap();

        for payload in [&b"\"boom\""[..], &b"\"fine\""[..]] {
            broker
                .publish(payload.to_vec(), "fragile", EXCHANGE, Duration::from_secs(1))
                .await
                .unwrap();
        }
        assert_eq!(rx.recv().await.unwrap(), b"\"fine\"".to_vec());
        assert_eq!(broker.consumer_count("fragile"), Some(1));
    }

    #[tokio::test]
    async fn auto_delete_queue_disappears_after_last_consumer() {
        let broker = broker_with_exchange().await;
        let sub = broker
            .subscribe("ephemeral", EXCHANGE, handler_fn(|_| async { Ok::<(), Error>(()) }))
            .await
            .unwrap();
        assert!(broker.queue_names().contains(&"ephemeral".to_string()));
        sub.unsubscribe().await;
        assert!(!broker.queue_names().contains(&"ephemeral".to_string()));
    }

    #[tokio::test]
    async fn closed_broker_is_unavailable() {
        let broker = broker_with_exchange().await;
        let sub = broker
            .subscribe("q", EXCHANGE, handler_fn(|_| async { Ok::<(), Error>(()) }))
            .await
            .unwrap();
        broker.close().await.unwrap();
        assert!(!broker.is_connected());

        let err = broker
            .publish(vec![], "q", EXCHANGE, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BrokerUnavailable { .. }));

        sub.unsubscribe().await;
    }
}

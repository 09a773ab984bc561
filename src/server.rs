//! One role of an agent, wired from its configuration.
//!
//! [`AideServer::start`] brings a role up in a fixed order:
//!
//! 1. declare the exchange;
//! 2. declare the service queues (lookups between facade and persistence);
//! 3. declare each act's task, progress and result queues; the facade also
//!    declares the fan-out queues it listens on;
//! 4. start the side, which subscribes its queues;
//! 5. subscribe a log queue of its own, bound to the role's log key, and send
//!    a heartbeat through it, failing with [`Error::BrokerUnavailable`] if it
//!    does not come back.
//!
//! Every instance has its own log queue, so any number of instances of a
//! role can share one exchange. A worker refuses to start when it has a
//! handler for an act the configuration does not declare.
//!
//! Once running, [`AideServer::next_failure`] reports consumers stopped by a
//! broker failure; the owner decides whether to restart.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::addressing::Addressing;
use crate::broker::{Broker, ExchangeSpec, InMemoryBroker, QueueSpec, Subscription};
use crate::config::AideConfig;
use crate::error::{Error, Result};
use crate::sides::{
    ActionRegistry, Channels, ConsumerFailure, FacadeOptions, FacadeSide, PersistenceSide,
    WorkerSide,
};
use crate::types::{ActionId, AgentId, Role};

/// Connector scheme served by [`InMemoryBroker`].
pub const MEMORY_SCHEME: &str = "memory://";

/// Message sent through a role's log queue at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Sending role.
    pub role: Role,
    /// Agent the role belongs to.
    pub agent_id: AgentId,
    /// Running instance that sent it.
    pub instance: String,
    /// Free-form text.
    pub message: String,
    /// When it was sent.
    pub at: DateTime<Utc>,
}

/// The running side of an [`AideServer`].
#[derive(Debug)]
pub enum RunningSide {
    /// Public-facing role.
    Facade(FacadeSide),
    /// Worker role.
    Worker(WorkerSide),
    /// Persistence role.
    Persistence(PersistenceSide),
}

impl RunningSide {
    /// Stops every consumer of the side.
    pub async fn shutdown(self) {
        match self {
            Self::Facade(side) => side.shutdown().await,
            Self::Worker(side) => side.shutdown().await,
            Self::Persistence(side) => side.shutdown().await,
        }
    }
}

/// One role of an agent, ready to serve.
#[derive(Debug)]
pub struct AideServer {
    config: AideConfig,
    role: Role,
    instance: String,
    channels: Channels,
    side: RunningSide,
    log: Subscription,
}

/// Opens the broker named by `config.connector`.
///
/// # Errors
///
/// [`Error::BrokerUnavailable`] for schemes without a bundled client.
pub fn connect(config: &AideConfig) -> Result<Arc<dyn Broker>> {
    if config.connector.starts_with(MEMORY_SCHEME) {
        tracing::info!(connector = %config.connector, "Using in-process broker");
        return Ok(Arc::new(InMemoryBroker::new()));
    }
    Err(Error::unavailable(format!(
        "no broker client for connector '{}'",
        config.connector
    )))
}

/// Declares the exchange and the queues `role` relies on.
///
/// The facade's fan-out queues are declared only by the facade itself: with
/// nobody consuming them they would fill up and stall the worker.
pub async fn declare_topology(
    broker: &dyn Broker,
    config: &AideConfig,
    addressing: &Addressing,
    acts: &[ActionId],
    role: Role,
) -> Result<()> {
    let exchange = addressing.exchange();
    broker.declare_exchange(&ExchangeSpec::topic(exchange)).await?;

    let mut queues = vec![
        addressing.request_progress_queue(),
        addressing.request_result_queue(),
        addressing.response_progress_queue(Role::Facade),
        addressing.response_result_queue(Role::Facade),
    ];

    let facade_fan_out = role == Role::Facade && config.fan_out_to_facade;
    for act in acts {
        queues.push(addressing.task_queue(act));
        queues.push(addressing.progress_queue(act, Role::Persistence));
        queues.push(addressing.result_queue(act, Role::Persistence));
        if facade_fan_out && config.catch_progress {
            queues.push(addressing.progress_queue(act, Role::Facade));
        }
        if facade_fan_out && config.catch_result {
            queues.push(addressing.result_queue(act, Role::Facade));
        }
    }

    for queue in &queues {
        let spec = QueueSpec::new(queue.as_str()).with_capacity(config.queue_capacity);
        broker.declare_queue(&spec, exchange).await?;
    }
    tracing::debug!(exchange, role = %role, queues = queues.len(), "Declared topology");
    Ok(())
}

/// Fails if `registry` handles an act `declared` does not list.
fn check_registry(registry: &ActionRegistry, declared: &[ActionId]) -> Result<()> {
    let unknown: Vec<String> = registry
        .ids()
        .into_iter()
        .filter(|id| !declared.contains(id))
        .map(|id| id.to_string())
        .collect();
    if !unknown.is_empty() {
        return Err(Error::configuration(format!(
            "handlers registered for undeclared acts: {}",
            unknown.join(", ")
        )));
    }
    for act in declared.iter().filter(|act| !registry.contains(act)) {
        tracing::warn!(action = %act, "Declared act has no handler on this worker");
    }
    Ok(())
}

impl AideServer {
    /// Connects to the configured broker and starts `role`.
    ///
    /// `registry` is only used by the worker role.
    pub async fn start(config: AideConfig, role: Role, registry: ActionRegistry) -> Result<Self> {
        config.validate()?;
        let broker = connect(&config)?;
        Self::start_with_broker(config, role, broker, registry).await
    }

    /// Starts `role` on an existing broker connection.
    pub async fn start_with_broker(
        config: AideConfig,
        role: Role,
        broker: Arc<dyn Broker>,
        registry: ActionRegistry,
    ) -> Result<Self> {
        config.validate()?;
        if !broker.is_connected() {
            return Err(Error::unavailable("broker connection is closed"));
        }

        let addressing = Addressing::new(config.agent_id()?).with_exchange(config.exchange.as_str());
        let acts = config.action_ids()?;
        declare_topology(broker.as_ref(), &config, &addressing, &acts, role).await?;

        let channels = Channels::new(broker, addressing, config.publish_timeout());
        let side = match role {
            Role::Facade => {
                let memo = config.memo.open().await?;
                let options = FacadeOptions {
                    catch_progress: config.catch_progress,
                    catch_result: config.catch_result,
                };
                let facade = FacadeSide::start(channels.clone(), memo, acts, options).await?;
                RunningSide::Facade(facade.with_about(config.about(role)?))
            },
            Role::Worker => {
                check_registry(&registry, &acts)?;
                let mut registry = registry;
                registry.apply_pipeline_defaults(&config.pipeline);
                RunningSide::Worker(
                    WorkerSide::start(channels.clone(), registry, config.fan_out_to_facade).await?,
                )
            },
            Role::Persistence => {
                let memo = config.memo.open().await?;
                RunningSide::Persistence(PersistenceSide::start(channels.clone(), memo, &acts).await?)
            },
        };

        let instance = Uuid::new_v4().simple().to_string();
        let log = match Self::heartbeat(&channels, &config, role, &instance).await {
            Ok(log) => log,
            Err(err) => {
                side.shutdown().await;
                return Err(err);
            },
        };
        tracing::info!(
            agent = %channels.addressing().agent_id(),
            role = %role,
            instance = %instance,
            version = %config.version,
            "Aide server started"
        );
        Ok(Self {
            config,
            role,
            instance,
            channels,
            side,
            log,
        })
    }

    async fn heartbeat(
        channels: &Channels,
        config: &AideConfig,
        role: Role,
        instance: &str,
    ) -> Result<Subscription> {
        let addressing = channels.addressing();
        let role_key = addressing.log_queue(role);
        let queue = addressing.instance_log_queue(role, instance);
        let broker = channels.broker();
        broker
            .declare_queue(
                &QueueSpec::new(queue.as_str()).with_capacity(config.queue_capacity),
                addressing.exchange(),
            )
            .await?;
        broker
            .bind_queue(&queue, addressing.exchange(), &role_key)
            .await?;

        let arrived = Arc::new(Notify::new());
        let notify = Arc::clone(&arrived);
        let own = instance.to_string();
        let log = channels
            .catch_json(&queue, move |heartbeat: Heartbeat| {
                let notify = Arc::clone(&notify);
                let own = own.clone();
                async move {
                    tracing::info!(
                        role = %heartbeat.role,
                        agent = %heartbeat.agent_id,
                        instance = %heartbeat.instance,
                        at = %heartbeat.at,
                        "{}",
                        heartbeat.message
                    );
                    if heartbeat.instance == own {
                        notify.notify_one();
                    }
                    Ok(())
                }
            })
            .await?;

        let heartbeat = Heartbeat {
            role,
            agent_id: addressing.agent_id().clone(),
            instance: instance.to_string(),
            message: "started".to_string(),
            at: Utc::now(),
        };
        if let Err(err) = channels.push(&heartbeat, &role_key).await {
            log.unsubscribe().await;
            return Err(err);
        }
        if tokio::time::timeout(channels.publish_timeout(), arrived.notified())
            .await
            .is_err()
        {
            log.unsubscribe().await;
            return Err(Error::unavailable("heartbeat did not come back"));
        }
        Ok(log)
    }

    /// The role being served.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Id of this running instance; the last segment of its log queue.
    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Waits until a consumer of this server stops on a broker failure.
    ///
    /// The side keeps its other consumers running; restarting is up to the
    /// caller.
    pub async fn next_failure(&self) -> Option<ConsumerFailure> {
        self.channels.next_failure().await
    }

    /// The configuration the server was started with.
    pub fn config(&self) -> &AideConfig {
        &self.config
    }

    /// Broker handle and queue naming.
    pub fn channels(&self) -> &Channels {
        &self.channels
    }

    /// The running side.
    pub fn side(&self) -> &RunningSide {
        &self.side
    }

    /// The facade, if this server runs that role.
    pub fn facade(&self) -> Option<&FacadeSide> {
        match &self.side {
            RunningSide::Facade(side) => Some(side),
            _ => None,
        }
    }

    /// The worker, if this server runs that role.
    pub fn worker(&self) -> Option<&WorkerSide> {
        match &self.side {
            RunningSide::Worker(side) => Some(side),
            _ => None,
        }
    }

    /// The persistence side, if this server runs that role.
    pub fn persistence(&self) -> Option<&PersistenceSide> {
        match &self.side {
            RunningSide::Persistence(side) => Some(side),
            _ => None,
        }
    }

    /// Stops the side and the log consumer.
    pub async fn shutdown(self) {
        self.side.shutdown().await;
        self.log.unsubscribe().await;
        tracing::info!(role = %self.role, "Aide server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ActConfig;

    #[test]
    fn unknown_connector_scheme_is_unavailable() {
        let mut config = AideConfig::new("kin");
        config.connector = "amqp://localhost".to_string();
        assert!(matches!(
            connect(&config),
            Err(Error::BrokerUnavailable { .. })
        ));
    }

    #[test]
    fn registry_must_be_subset_of_declared_acts() {
        struct Noop;
        #[async_trait::async_trait]
        impl crate::sides::Action for Noop {
            async fn run(
                &self,
                _task: &crate::types::Task,
                _reporter: &crate::sides::TaskReporter,
            ) -> Result<()> {
                Ok(())
            }
        }

        let echo = ActionId::new("echo").unwrap();
        let other = ActionId::new("other").unwrap();
        let registry = ActionRegistry::new().with(echo.clone(), Noop);

        assert!(check_registry(&registry, &[echo.clone(), other.clone()]).is_ok());
        assert!(matches!(
            check_registry(&registry, &[other]),
            Err(Error::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn only_the_facade_declares_its_fan_out_queues() {
        let broker = InMemoryBroker::new();
        let mut config = AideConfig::new("kin").with_act(ActConfig::new("echo"));
        config.catch_progress = false;
        let addressing = Addressing::new(config.agent_id().unwrap());
        let acts = config.action_ids().unwrap();

        declare_topology(&broker, &config, &addressing, &acts, Role::Worker)
            .await
            .unwrap();
        let names = broker.queue_names();
        assert!(!names.contains(&"result.echo.worker.facade.kin".to_string()));
        assert!(names.contains(&"task.echo.facade.worker.kin".to_string()));
        assert_eq!(names.len(), 4 + 3);

        declare_topology(&broker, &config, &addressing, &acts, Role::Facade)
            .await
            .unwrap();
        let names = broker.queue_names();
        assert!(names.contains(&"result.echo.worker.facade.kin".to_string()));
        assert!(!names.contains(&"progress.echo.worker.facade.kin".to_string()));
        assert_eq!(names.len(), 4 + 4);
    }
}

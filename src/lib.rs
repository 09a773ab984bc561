//! Coordination layer for agents split into three cooperating roles.
//!
//! An agent is deployed as a public-facing side, a worker side and a
//! persistence side that talk only through named queues on one topic
//! exchange. A request becomes a [`Task`] on the act's task queue; the worker
//! runs the registered action and publishes [`Progress`] and a
//! [`TaskResult`]; the persistence side stores both and answers lookups; the
//! public-facing side caches whatever reaches it and serves polls.
//!
//! # Module Organization
//!
//! - [`addressing`] - Derives every queue name from kind, act, roles and agent
//! - [`broker`] - Topic-exchange gateway trait and the in-process exchange
//! - [`types`] - Identifiers, roles and wire messages
//! - [`memo`] - Pluggable key/value storage (memory, filesystem, none)
//! - [`sides`] - The three role state machines
//! - [`pipeline`] - Staged raw/improved/mapped result construction with retry
//! - [`routes`] - Front-door paths per act
//! - [`config`] - TOML configuration with environment overrides
//! - [`server`] - Bootstraps one role from its configuration
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use aide::broker::InMemoryBroker;
//! use aide::config::{ActConfig, AideConfig};
//! use aide::pipeline::{stage_fn, Pipeline};
//! use aide::server::AideServer;
//! use aide::sides::ActionRegistry;
//! use aide::{ActionId, Role};
//! use serde_json::json;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let config = AideConfig::new("kin").with_act(ActConfig::new("echo"));
//! let broker = Arc::new(InMemoryBroker::new());
//! let echo = ActionId::new("echo").unwrap();
//!
//! let registry = ActionRegistry::new().with(
//!     echo.clone(),
//!     Pipeline::new(stage_fn(|task, _| Ok(json!({"msg": task.context["q"]})))),
//! );
//! let worker = AideServer::start_with_broker(config.clone(), Role::Worker, broker.clone(), registry)
//!     .await
//!     .unwrap();
//! let facade = AideServer::start_with_broker(config, Role::Facade, broker, ActionRegistry::new())
//!     .await
//!     .unwrap();
//!
//! let mut context = serde_json::Map::new();
//! context.insert("q".to_string(), json!("hi"));
//! let uid = facade.facade().unwrap().publish_task(&echo, context).await.unwrap();
//! # let _ = (uid, worker);
//! # });
//! ```

pub mod addressing;
pub mod broker;
pub mod config;
pub mod error;
#[cfg(feature = "logging")]
pub mod logging;
pub mod memo;
pub mod pipeline;
pub mod routes;
pub mod server;
pub mod sides;
pub mod types;

// Re-exports for ergonomic access
pub use error::{Error, Result};
pub use types::{
    ActionId, AgentId, Context, Progress, Role, Task, TaskResult, TaskUid, PROGRESS_NOT_FOUND,
};

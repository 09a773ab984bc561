//! Queue naming.
//!
//! Every queue name is derived, never stored:
//!
//! ```text
//! {kind}[.{action_id}].{pusher}.{catcher}.{agent_id}
//! ```
//!
//! Action-level kinds ([`QueueKind::Task`], [`QueueKind::Progress`],
//! [`QueueKind::Result`]) carry the action id; service-level kinds omit it.
//! Because the kind fixes the number of segments and no identifier may
//! contain `.`, distinct inputs always produce distinct names.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{ActionId, AgentId, Role};

/// Separator between queue-name segments.
pub const SEPARATOR: char = '.';

/// Name of the exchange shared by a deployment.
pub const DEFAULT_EXCHANGE: &str = "aide";

/// Message kinds, one family of queues each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    /// Task from the facade to the worker.
    Task,
    /// Progress fanned out by the worker.
    Progress,
    /// Result fanned out by the worker.
    Result,
    /// Bare uid asking the persistence side for stored progress.
    RequestProgress,
    /// Bare uid asking the persistence side for a stored result.
    RequestResult,
    /// Stored progress answered by the persistence side.
    ResponseProgress,
    /// Stored result answered by the persistence side.
    ResponseResult,
    /// Free-form heartbeat/log lines.
    Log,
}

impl QueueKind {
    /// All kinds, in declaration order.
    pub const ALL: [QueueKind; 8] = [
        QueueKind::Task,
        QueueKind::Progress,
        QueueKind::Result,
        QueueKind::RequestProgress,
        QueueKind::RequestResult,
        QueueKind::ResponseProgress,
        QueueKind::ResponseResult,
        QueueKind::Log,
    ];

    /// Lower-case name used as the first queue-name segment.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Progress => "progress",
            Self::Result => "result",
            Self::RequestProgress => "request_progress",
            Self::RequestResult => "request_result",
            Self::ResponseProgress => "response_progress",
            Self::ResponseResult => "response_result",
            Self::Log => "log",
        }
    }

    /// Action-level kinds are scoped to one action.
    pub fn is_action_level(&self) -> bool {
        matches!(self, Self::Task | Self::Progress | Self::Result)
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derives the queue name for one conversation.
///
/// `action_id` is used only for action-level kinds and ignored otherwise, so
/// callers cannot accidentally split a service queue per action.
///
/// # Panics
///
/// In debug builds, if an action-level `kind` is given no `action_id`.
///
/// # Examples
///
/// ```
/// use aide::addressing::{queue_name, QueueKind};
/// use aide::{ActionId, AgentId, Role};
///
/// let agent = AgentId::new("buy_on_ebay").unwrap();
/// let act = ActionId::new("products_today").unwrap();
///
/// assert_eq!(
///     queue_name(QueueKind::Task, Some(&act), Role::Facade, Role::Worker, &agent),
///     "task.products_today.facade.worker.buy_on_ebay"
/// );
/// assert_eq!(
///     queue_name(QueueKind::RequestResult, Some(&act), Role::Facade, Role::Persistence, &agent),
///     "request_result.facade.persistence.buy_on_ebay"
/// );
/// ```
pub fn queue_name(
    kind: QueueKind,
    action_id: Option<&ActionId>,
    pusher: Role,
    catcher: Role,
    agent_id: &AgentId,
) -> String {
    debug_assert!(
        action_id.is_some() || !kind.is_action_level(),
        "{kind} queues require an action id"
    );
    let action = if kind.is_action_level() {
        action_id.map(ActionId::as_str)
    } else {
        None
    };

    [
        Some(kind.as_str()),
        action,
        Some(pusher.as_str()),
        Some(catcher.as_str()),
        Some(agent_id.as_str()),
    ]
    .into_iter()
    .flatten()
    .filter(|segment| !segment.is_empty())
    .map(str::to_lowercase)
    .collect::<Vec<_>>()
    .join(&SEPARATOR.to_string())
}

/// Queue-name helpers bound to one agent.
///
/// Sides hold one of these instead of passing the agent id around.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Addressing {
    agent_id: AgentId,
    exchange: String,
}

impl Addressing {
    /// Addressing for `agent_id` on the default exchange.
    pub fn new(agent_id: AgentId) -> Self {
        Self {
            agent_id,
            exchange: DEFAULT_EXCHANGE.to_string(),
        }
    }

    /// Uses a different exchange name.
    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    /// The agent this addressing is bound to.
    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    /// The shared exchange.
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Queue for an action-level kind.
    pub fn action_queue(&self, kind: QueueKind, action: &ActionId, pusher: Role, catcher: Role) -> String {
        queue_name(kind, Some(action), pusher, catcher, &self.agent_id)
    }

    /// Queue for a service-level kind.
    pub fn service_queue(&self, kind: QueueKind, pusher: Role, catcher: Role) -> String {
        queue_name(kind, None, pusher, catcher, &self.agent_id)
    }

    /// `task.{action}.facade.worker.{agent}`
    pub fn task_queue(&self, action: &ActionId) -> String {
        self.action_queue(QueueKind::Task, action, Role::Facade, Role::Worker)
    }

    /// Progress queue from the worker to `catcher`.
    pub fn progress_queue(&self, action: &ActionId, catcher: Role) -> String {
        self.action_queue(QueueKind::Progress, action, Role::Worker, catcher)
    }

    /// Result queue from the worker to `catcher`.
    pub fn result_queue(&self, action: &ActionId, catcher: Role) -> String {
        self.action_queue(QueueKind::Result, action, Role::Worker, catcher)
    }

    /// Progress lookups from the facade to the persistence side.
    pub fn request_progress_queue(&self) -> String {
        self.service_queue(QueueKind::RequestProgress, Role::Facade, Role::Persistence)
    }

    /// Result lookups from the facade to the persistence side.
    pub fn request_result_queue(&self) -> String {
        self.service_queue(QueueKind::RequestResult, Role::Facade, Role::Persistence)
    }

    /// Progress answers from the persistence side back to `requester`.
    pub fn response_progress_queue(&self, requester: Role) -> String {
        self.service_queue(QueueKind::ResponseProgress, Role::Persistence, requester)
    }

    /// Result answers from the persistence side back to `requester`.
    pub fn response_result_queue(&self, requester: Role) -> String {
        self.service_queue(QueueKind::ResponseResult, Role::Persistence, requester)
    }

    /// A role's own log queue.
    pub fn log_queue(&self, role: Role) -> String {
        self.service_queue(QueueKind::Log, role, role)
    }

    /// Log queue of one running instance of `role`.
    ///
    /// Bound to the role's [`log_queue`](Self::log_queue) key, so every
    /// instance sees every heartbeat of its role.
    pub fn instance_log_queue(&self, role: Role, instance: &str) -> String {
        format!("{}{SEPARATOR}{instance}", self.log_queue(role))
    }
}

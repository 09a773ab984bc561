//! Worker side: executes tasks.
//!
//! Each registered act gets a consumer on its task queue. A delivered
//! [`Task`] is dispatched by exact match of its `action_id` against the
//! [`ActionRegistry`]; a task naming an unregistered act is logged as
//! [`Error::UnknownAction`] and dropped without a result.
//!
//! The action reports through a [`TaskReporter`] bound to the task's uid,
//! which fans every progress value and the result out to the persistence side
//! and, optionally, to the facade.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::{unsubscribe_all, Channels};
use crate::broker::Subscription;
use crate::error::{Error, Result};
use crate::pipeline::PipelineConfig;
use crate::types::{ActionId, Progress, Role, Task, TaskResult, TaskUid};

/// A named unit of work.
///
/// Implementations are expected to report progress at least at 0 and 100 and
/// to publish exactly one result. [`Pipeline`](crate::pipeline::Pipeline) is
/// the standard implementation.
#[async_trait]
pub trait Action: Send + Sync {
    /// Runs `task`, reporting through `reporter`.
    ///
    /// # Errors
    ///
    /// Only broker failures should escape; domain failures belong in the
    /// published result.
    async fn run(&self, task: &Task, reporter: &TaskReporter) -> Result<()>;

    /// A copy of this action using `defaults`, for actions built on
    /// [`PipelineConfig`] that were not given their own. `None` keeps the
    /// action as is.
    fn with_pipeline_defaults(&self, _defaults: &PipelineConfig) -> Option<Arc<dyn Action>> {
        None
    }
}

/// Static table from action id to handler.
///
/// # Examples
///
/// ```
/// use aide::pipeline::{stage_fn, Pipeline};
/// use aide::sides::ActionRegistry;
/// use aide::ActionId;
///
/// let echo = Pipeline::new(stage_fn(|task, _| Ok(task.context["q"].clone())));
/// let registry = ActionRegistry::new().with(ActionId::new("echo").unwrap(), echo);
/// assert!(registry.contains(&ActionId::new("echo").unwrap()));
/// ```
#[derive(Default, Clone)]
pub struct ActionRegistry {
    actions: HashMap<ActionId, Arc<dyn Action>>,
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.ids())
            .finish()
    }
}

impl ActionRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `action` under `id`, replacing any previous handler.
    pub fn register(&mut self, id: ActionId, action: impl Action + 'static) {
        self.register_arc(id, Arc::new(action));
    }

    /// Registers a shared handler.
    pub fn register_arc(&mut self, id: ActionId, action: Arc<dyn Action>) {
        if self.actions.insert(id.clone(), action).is_some() {
            tracing::warn!(action = %id, "Replaced registered action");
        }
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, id: ActionId, action: impl Action + 'static) -> Self {
        self.register(id, action);
        self
    }

    /// Hands `defaults` to every action that accepts them.
    pub fn apply_pipeline_defaults(&mut self, defaults: &PipelineConfig) {
        for (id, action) in self.actions.iter_mut() {
            if let Some(configured) = action.with_pipeline_defaults(defaults) {
                tracing::debug!(action = %id, "Applied pipeline defaults");
                *action = configured;
            }
        }
    }

    /// Handler for `id`; exact match only.
    pub fn get(&self, id: &ActionId) -> Option<&Arc<dyn Action>> {
        self.actions.get(id)
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: &ActionId) -> bool {
        self.actions.contains_key(id)
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<ActionId> {
        let mut ids: Vec<ActionId> = self.actions.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of registered actions.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// Publishing callbacks bound to one task.
///
/// Once the result has been published the task is closed: further progress
/// or results are dropped with a warning.
pub struct TaskReporter {
    channels: Channels,
    task_uid: TaskUid,
    action_id: ActionId,
    catchers: Vec<Role>,
    closed: AtomicBool,
}

impl std::fmt::Debug for TaskReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskReporter")
            .field("task_uid", &self.task_uid)
            .field("action_id", &self.action_id)
            .field("catchers", &self.catchers)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl TaskReporter {
    /// Binds a reporter to `task`, fanning out to `catchers`.
    pub fn new(channels: Channels, task: &Task, catchers: Vec<Role>) -> Self {
        Self {
            channels,
            task_uid: task.uid.clone(),
            action_id: task.action_id.clone(),
            catchers,
            closed: AtomicBool::new(false),
        }
    }

    /// Uid of the task being reported.
    pub fn task_uid(&self) -> &TaskUid {
        &self.task_uid
    }

    /// Act of the task being reported.
    pub fn action_id(&self) -> &ActionId {
        &self.action_id
    }

    /// Whether the result has been published.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Publishes a progress percentage to every catcher.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidProgress`] for values outside `[0, 100]`, or any
    /// broker failure.
    pub async fn publish_progress(&self, value: f64) -> Result<()> {
        let progress = Progress::new(self.task_uid.clone(), value)?;
        if self.is_closed() {
            tracing::warn!(task_uid = %self.task_uid, value, "Dropping progress for a closed task");
            return Ok(());
        }
        for catcher in &self.catchers {
            let queue = self
                .channels
                .addressing()
                .progress_queue(&self.action_id, *catcher);
            self.channels.push(&progress, &queue).await?;
        }
        tracing::debug!(task_uid = %self.task_uid, value, "Published progress");
        Ok(())
    }

    /// Publishes the terminal result to every catcher.
    pub async fn publish_result(&self, value: Value) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            tracing::warn!(task_uid = %self.task_uid, "Dropping second result for a closed task");
            return Ok(());
        }
        let result = TaskResult::new(self.task_uid.clone(), value);
        for catcher in &self.catchers {
            let queue = self
                .channels
                .addressing()
                .result_queue(&self.action_id, *catcher);
            self.channels.push(&result, &queue).await?;
        }
        tracing::info!(task_uid = %self.task_uid, action = %self.action_id, "Published result");
        Ok(())
    }
}

/// Routes tasks to registered actions.
#[derive(Clone)]
struct Dispatcher {
    channels: Channels,
    registry: Arc<ActionRegistry>,
    catchers: Vec<Role>,
}

impl Dispatcher {
    async fn dispatch(&self, task: Task) -> Result<()> {
        let action = self
            .registry
            .get(&task.action_id)
            .ok_or_else(|| Error::UnknownAction {
                action_id: task.action_id.to_string(),
                task_uid: task.uid.to_string(),
            })?;

        tracing::info!(task_uid = %task.uid, action = %task.action_id, "Running task");
        let reporter = TaskReporter::new(self.channels.clone(), &task, self.catchers.clone());
        action.run(&task, &reporter).await?;
        if !reporter.is_closed() {
            tracing::warn!(task_uid = %task.uid, action = %task.action_id, "Action finished without publishing a result");
        }
        Ok(())
    }
}

/// The worker role.
pub struct WorkerSide {
    dispatcher: Dispatcher,
    subscriptions: Vec<Subscription>,
}

impl std::fmt::Debug for WorkerSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSide")
            .field("registry", &self.dispatcher.registry)
            .field("catchers", &self.dispatcher.catchers)
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}

impl WorkerSide {
    /// Subscribes the task queue of every registered act.
    ///
    /// Progress and results go to the persistence side, and also to the
    /// facade when `fan_out_to_facade` is set.
    pub async fn start(
        channels: Channels,
        registry: ActionRegistry,
        fan_out_to_facade: bool,
    ) -> Result<Self> {
        let mut catchers = vec![Role::Persistence];
        if fan_out_to_facade {
            catchers.push(Role::Facade);
        }
        let dispatcher = Dispatcher {
            channels: channels.clone(),
            registry: Arc::new(registry),
            catchers,
        };

        let mut subscriptions = Vec::with_capacity(dispatcher.registry.len());
        for id in dispatcher.registry.ids() {
            let queue = channels.addressing().task_queue(&id);
            let dispatcher = dispatcher.clone();
            let subscription = channels
                .catch_json(&queue, move |task: Task| {
                    let dispatcher = dispatcher.clone();
                    async move {
                        match dispatcher.dispatch(task).await {
                            Err(err @ Error::UnknownAction { .. }) => {
                                tracing::error!(error = %err, "Dropping task");
                                Ok(())
                            },
                            other => other,
                        }
                    }
                })
                .await?;
            subscriptions.push(subscription);
        }

        tracing::info!(
            agent = %channels.addressing().agent_id(),
            actions = subscriptions.len(),
            "Worker side listening"
        );
        Ok(Self {
            dispatcher,
            subscriptions,
        })
    }

    /// Registered act ids.
    pub fn action_ids(&self) -> Vec<ActionId> {
        self.dispatcher.registry.ids()
    }

    /// Runs `task` in the calling task, as a delivery would.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownAction`] if no handler is registered for the task's
    /// act; broker failures from the action.
    pub async fn dispatch(&self, task: Task) -> Result<()> {
        self.dispatcher.dispatch(task).await
    }

    /// Stops every consumer of this side.
    pub async fn shutdown(self) {
        unsubscribe_all(self.subscriptions).await;
        tracing::info!("Worker side stopped");
    }
}

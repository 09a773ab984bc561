//! Public-facing side.
//!
//! The facade owns the current context and a memo cache. Invoking an act
//! publishes a [`Task`] built from that context and returns its uid at once;
//! callers then poll. Values reach the cache two ways:
//!
//! - directly, when the worker fans progress and results out to the facade
//!   (enabled by [`FacadeOptions::catch_progress`] and
//!   [`FacadeOptions::catch_result`]);
//! - through a request/response round trip with the persistence side, for
//!   values produced before the facade was listening.
//!
//! Cached results are first-write-wins; a not-found answer never replaces a
//! real value.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use super::{unsubscribe_all, Channels};
use crate::broker::Subscription;
use crate::error::{Error, Result};
use crate::memo::{response_progress_key, response_result_key, MemoStore, CONTEXT_KEY};
use crate::routes::{
    agent_endpoints, check_paths, About, ActAbout, ActRoutes, EndpointKind, EndpointRegistrar,
};
use crate::types::{ActionId, Context, Progress, Role, Task, TaskResult, TaskUid};

/// Which fan-out queues the facade listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FacadeOptions {
    /// Subscribe to `progress.{act}.worker.facade.{agent}`.
    pub catch_progress: bool,
    /// Subscribe to `result.{act}.worker.facade.{agent}`.
    pub catch_result: bool,
}

impl Default for FacadeOptions {
    fn default() -> Self {
        Self {
            catch_progress: true,
            catch_result: true,
        }
    }
}

/// Outcome of a cache read.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum Lookup<T> {
    /// Nothing has arrived yet.
    Pending,
    /// The persistence side answered that nothing is stored.
    NotFound,
    /// The value.
    Ready(T),
}

impl<T> Lookup<T> {
    /// Returns `true` for [`Lookup::Ready`].
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    /// The value, if ready.
    pub fn ready(self) -> Option<T> {
        match self {
            Self::Ready(value) => Some(value),
            Self::Pending | Self::NotFound => None,
        }
    }
}

/// Returned by request endpoints: where to poll for the answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollHandle {
    /// Task being looked up.
    pub uid: TaskUid,
    /// Response path to poll.
    pub path: String,
}

/// An agent-wide front-door call, see [`FacadeSide::serve_agent`].
#[derive(Debug, Clone, PartialEq)]
pub enum AgentRequest {
    /// Describe the agent.
    About,
    /// Read the whole context.
    GetContext,
    /// Read one context value.
    GetContextValue(String),
    /// Set one context value.
    SetContextValue {
        /// Context key.
        hid: String,
        /// New value.
        value: Value,
    },
}

/// Answer of [`FacadeSide::serve`] and [`FacadeSide::serve_agent`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EndpointResponse {
    /// Agent description.
    About(About),
    /// The current context.
    Context(Context),
    /// One context value; `null` when unset.
    ContextValue(Value),
    /// A context value was stored.
    Updated(bool),
    /// Uid of the published task.
    Invoked(TaskUid),
    /// Where to poll for a requested value.
    Poll(PollHandle),
    /// Cached progress.
    Progress(Lookup<f64>),
    /// Cached result.
    Result(Lookup<Value>),
}

/// Writes incoming answers into the facade's cache.
#[derive(Clone)]
struct Cache {
    memo: Arc<dyn MemoStore>,
}

impl Cache {
    async fn progress(&self, progress: Progress) -> Result<()> {
        let key = response_progress_key(&progress.task_uid);
        if progress.is_not_found() {
            self.memo.put_if_absent(&key, &Value::from(progress.value)).await?;
        } else {
            self.memo.put(&key, &Value::from(progress.value)).await?;
        }
        tracing::debug!(task_uid = %progress.task_uid, value = progress.value, "Cached progress");
        Ok(())
    }

    async fn result(&self, result: TaskResult) -> Result<()> {
        let key = response_result_key(&result.task_uid);
        if self.memo.put_if_absent(&key, &result.value).await? {
            tracing::debug!(task_uid = %result.task_uid, "Cached result");
            return Ok(());
        }
        if result.is_not_found() {
            return Ok(());
        }
        // Only a stored not-found answer may be replaced.
        match self.memo.find(&key).await? {
            Some(Value::Null) | None => {
                self.memo.put(&key, &result.value).await?;
                tracing::debug!(task_uid = %result.task_uid, "Cached result");
            },
            Some(existing) if existing == result.value => {
                tracing::debug!(task_uid = %result.task_uid, "Ignoring duplicate result");
            },
            Some(_) => {
                tracing::warn!(task_uid = %result.task_uid, "Ignoring conflicting result; keeping the first one");
            },
        }
        Ok(())
    }
}

/// The public-facing role.
pub struct FacadeSide {
    channels: Channels,
    memo: Arc<dyn MemoStore>,
    acts: Vec<ActionId>,
    about: About,
    subscriptions: Vec<Subscription>,
}

impl std::fmt::Debug for FacadeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FacadeSide")
            .field("acts", &self.acts)
            .field("memo", &self.memo.name())
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}

impl FacadeSide {
    /// Subscribes the response queues and, per `options`, the fan-out queues
    /// of every act.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] if two acts share a front-door path, or any
    /// broker failure.
    pub async fn start(
        channels: Channels,
        memo: Arc<dyn MemoStore>,
        acts: Vec<ActionId>,
        options: FacadeOptions,
    ) -> Result<Self> {
        check_paths(&acts)?;
        let addressing = channels.addressing().clone();
        let cache = Cache {
            memo: Arc::clone(&memo),
        };
        let mut subscriptions = Vec::new();

        let mut progress_queues = vec![addressing.response_progress_queue(Role::Facade)];
        let mut result_queues = vec![addressing.response_result_queue(Role::Facade)];
        for act in &acts {
            if options.catch_progress {
                progress_queues.push(addressing.progress_queue(act, Role::Facade));
            }
            if options.catch_result {
                result_queues.push(addressing.result_queue(act, Role::Facade));
            }
        }

        for queue in &progress_queues {
            let cache = cache.clone();
            subscriptions.push(
                channels
                    .catch_json(queue, move |progress: Progress| {
                        let cache = cache.clone();
                        async move { cache.progress(progress).await }
                    })
                    .await?,
            );
        }
        for queue in &result_queues {
            let cache = cache.clone();
            subscriptions.push(
                channels
                    .catch_json(queue, move |result: TaskResult| {
                        let cache = cache.clone();
                        async move { cache.result(result).await }
                    })
                    .await?,
            );
        }

        tracing::info!(
            agent = %addressing.agent_id(),
            acts = acts.len(),
            queues = subscriptions.len(),
            "Facade side listening"
        );
        let about = About {
            name: addressing.agent_id().to_string(),
            hid: addressing.agent_id().to_string(),
            sidename: Role::Facade.to_string(),
            version: String::new(),
            summary: String::new(),
            acts: acts.iter().cloned().map(ActAbout::bare).collect(),
        };
        Ok(Self {
            channels,
            memo,
            acts,
            about,
            subscriptions,
        })
    }

    /// Replaces the description served at the about endpoint.
    pub fn with_about(mut self, about: About) -> Self {
        self.about = about;
        self
    }

    /// Acts this side exposes.
    pub fn acts(&self) -> &[ActionId] {
        &self.acts
    }

    /// The agent description.
    pub fn about(&self) -> &About {
        &self.about
    }

    /// Publishes a task for `action` with an explicit context.
    ///
    /// Returns the fresh uid without waiting for the worker.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] if the act is not exposed by this side, or
    /// any broker failure.
    pub async fn publish_task(&self, action: &ActionId, context: Context) -> Result<TaskUid> {
        self.ensure_exposed(action)?;
        let task = Task::new(action.clone(), context);
        let queue = self.channels.addressing().task_queue(action);
        let routed = self.channels.push(&task, &queue).await?;
        if routed == 0 {
            tracing::warn!(task_uid = %task.uid, queue = %queue, "No worker queue bound for task");
        }
        tracing::info!(task_uid = %task.uid, action = %action, "Published task");
        Ok(task.uid)
    }

    /// Publishes a task for `action` carrying a snapshot of the current
    /// context.
    pub async fn invoke(&self, action: &ActionId) -> Result<TaskUid> {
        let context = self.context().await?;
        self.publish_task(action, context).await
    }

    /// Asks the persistence side for the stored progress of `uid`.
    pub async fn request_progress(&self, action: &ActionId, uid: &TaskUid) -> Result<PollHandle> {
        self.ensure_exposed(action)?;
        let queue = self.channels.addressing().request_progress_queue();
        self.channels.push(uid, &queue).await?;
        tracing::debug!(task_uid = %uid, "Requested progress");
        Ok(PollHandle {
            uid: uid.clone(),
            path: ActRoutes::new(action.clone()).response_progress(uid),
        })
    }

    /// Asks the persistence side for the stored result of `uid`.
    pub async fn request_result(&self, action: &ActionId, uid: &TaskUid) -> Result<PollHandle> {
        self.ensure_exposed(action)?;
        let queue = self.channels.addressing().request_result_queue();
        self.channels.push(uid, &queue).await?;
        tracing::debug!(task_uid = %uid, "Requested result");
        Ok(PollHandle {
            uid: uid.clone(),
            path: ActRoutes::new(action.clone()).response_result(uid),
        })
    }

    /// Reads cached progress for `uid`.
    pub async fn read_cached_progress(&self, uid: &TaskUid) -> Result<Lookup<f64>> {
        let Some(value) = self.memo.find(&response_progress_key(uid)).await? else {
            return Ok(Lookup::Pending);
        };
        let progress: f64 = serde_json::from_value(value)?;
        if progress < 0.0 {
            Ok(Lookup::NotFound)
        } else {
            Ok(Lookup::Ready(progress))
        }
    }

    /// Reads a cached result for `uid`.
    pub async fn read_cached_result(&self, uid: &TaskUid) -> Result<Lookup<Value>> {
        Ok(match self.memo.find(&response_result_key(uid)).await? {
            None => Lookup::Pending,
            Some(Value::Null) => Lookup::NotFound,
            Some(value) => Lookup::Ready(value),
        })
    }

    /// The current context; empty if none was set.
    pub async fn context(&self) -> Result<Context> {
        match self.memo.find(CONTEXT_KEY).await? {
            Some(Value::Object(map)) => Ok(map),
            Some(other) => Err(Error::configuration(format!(
                "stored context is not an object: {other}"
            ))),
            None => Ok(Context::new()),
        }
    }

    /// Replaces the current context.
    pub async fn set_context(&self, context: Context) -> Result<()> {
        self.memo.put(CONTEXT_KEY, &Value::Object(context)).await?;
        Ok(())
    }

    /// Overlays `patch` onto the current context and returns the result.
    pub async fn merge_context(&self, patch: Context) -> Result<Context> {
        let mut context = self.context().await?;
        context.extend(patch);
        self.set_context(context.clone()).await?;
        Ok(context)
    }

    /// One value of the current context; `null` when unset.
    pub async fn context_value(&self, hid: &str) -> Result<Value> {
        Ok(self.context().await?.remove(hid).unwrap_or(Value::Null))
    }

    /// Sets one value of the current context and returns the new context.
    pub async fn set_context_value(&self, hid: impl Into<String>, value: Value) -> Result<Context> {
        let mut patch = Context::new();
        patch.insert(hid.into(), value);
        self.merge_context(patch).await
    }

    /// Declares the agent-wide paths and the paths of every exposed act.
    pub fn register_endpoints(&self, registrar: &mut dyn EndpointRegistrar) {
        let act_endpoints = self
            .acts
            .iter()
            .flat_map(|act| ActRoutes::new(act.clone()).endpoints());
        for endpoint in agent_endpoints().into_iter().chain(act_endpoints) {
            tracing::debug!(path = %endpoint.path, kind = ?endpoint.kind, "Registering endpoint");
            registrar.register(endpoint);
        }
    }

    /// Runs the operation behind an agent-wide endpoint.
    pub async fn serve_agent(&self, request: AgentRequest) -> Result<EndpointResponse> {
        Ok(match request {
            AgentRequest::About => EndpointResponse::About(self.about.clone()),
            AgentRequest::GetContext => EndpointResponse::Context(self.context().await?),
            AgentRequest::GetContextValue(hid) => {
                EndpointResponse::ContextValue(self.context_value(&hid).await?)
            },
            AgentRequest::SetContextValue { hid, value } => {
                self.set_context_value(hid, value).await?;
                EndpointResponse::Updated(true)
            },
        })
    }

    /// Runs the operation behind an act endpoint.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] if a uid-taking endpoint is called without a
    /// uid, or `kind` is agent-wide (see [`serve_agent`](Self::serve_agent)).
    pub async fn serve(
        &self,
        kind: EndpointKind,
        action: &ActionId,
        uid: Option<&TaskUid>,
    ) -> Result<EndpointResponse> {
        let require_uid =
            || uid.ok_or_else(|| Error::configuration(format!("{kind:?} requires a task uid")));
        Ok(match kind {
            EndpointKind::About
            | EndpointKind::GetContext
            | EndpointKind::GetContextValue
            | EndpointKind::SetContextValue => {
                return Err(Error::configuration(format!(
                    "{kind:?} is an agent-wide endpoint"
                )))
            },
            EndpointKind::Invoke => EndpointResponse::Invoked(self.invoke(action).await?),
            EndpointKind::RequestProgress => {
                EndpointResponse::Poll(self.request_progress(action, require_uid()?).await?)
            },
            EndpointKind::RequestResult => {
                EndpointResponse::Poll(self.request_result(action, require_uid()?).await?)
            },
            EndpointKind::ResponseProgress => {
                EndpointResponse::Progress(self.read_cached_progress(require_uid()?).await?)
            },
            EndpointKind::ResponseResult => {
                EndpointResponse::Result(self.read_cached_result(require_uid()?).await?)
            },
        })
    }

    /// Stops every consumer of this side.
    pub async fn shutdown(self) {
        unsubscribe_all(self.subscriptions).await;
        tracing::info!("Facade side stopped");
    }

    fn ensure_exposed(&self, action: &ActionId) -> Result<()> {
        if self.acts.contains(action) {
            Ok(())
        } else {
            Err(Error::configuration(format!("act '{action}' is not exposed")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memo::InMemoryMemo;
    use serde_json::json;

    fn cache() -> (Cache, Arc<InMemoryMemo>) {
        let memo = Arc::new(InMemoryMemo::new());
        (
            Cache {
                memo: memo.clone(),
            },
            memo,
        )
    }

    #[tokio::test]
    async fn not_found_never_replaces_real_progress() {
        let (cache, memo) = cache();
        let uid = TaskUid::from("t");
        cache
            .progress(Progress::new(uid.clone(), 50.0).unwrap())
            .await
            .unwrap();
        cache.progress(Progress::not_found(uid.clone())).await.unwrap();
        assert_eq!(
            memo.get(&response_progress_key(&uid)).await.unwrap(),
            json!(50.0)
        );
    }

    #[tokio::test]
    async fn real_result_replaces_not_found_but_not_a_real_result() {
        let (cache, memo) = cache();
        let uid = TaskUid::from("t");
        let key = response_result_key(&uid);

        cache.result(TaskResult::not_found(uid.clone())).await.unwrap();
        assert_eq!(memo.get(&key).await.unwrap(), Value::Null);

        cache
            .result(TaskResult::new(uid.clone(), json!({"raw_result": 1})))
            .await
            .unwrap();
        cache
            .result(TaskResult::new(uid.clone(), json!({"raw_result": 2})))
            .await
            .unwrap();
        cache.result(TaskResult::not_found(uid.clone())).await.unwrap();
        assert_eq!(memo.get(&key).await.unwrap(), json!({"raw_result": 1}));
    }

    #[test]
    fn lookup_serializes_with_status() {
        assert_eq!(
            serde_json::to_value(Lookup::Ready(42.0)).unwrap(),
            json!({"status": "ready", "value": 42.0})
        );
        assert_eq!(
            serde_json::to_value(Lookup::<f64>::Pending).unwrap(),
            json!({"status": "pending"})
        );
    }
}

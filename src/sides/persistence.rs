//! Persistence side: stores progress and results and answers lookups.
//!
//! Progress is last-write-wins. Results are first-write-wins: the memo's
//! atomic [`put_if_absent`](MemoStore::put_if_absent) decides, and a later
//! result for the same uid is ignored (logged if it differs). A lookup for a
//! uid with nothing stored is answered with the not-found sentinel
//! ([`Progress::not_found`], [`TaskResult::not_found`]).

use std::sync::Arc;

use serde_json::Value;

use super::{unsubscribe_all, Channels};
use crate::broker::Subscription;
use crate::error::Result;
use crate::memo::{progress_key, result_key, MemoStore};
use crate::types::{ActionId, Progress, Role, TaskResult, TaskUid};

#[derive(Clone)]
struct Keeper {
    channels: Channels,
    memo: Arc<dyn MemoStore>,
}

impl Keeper {
    async fn store_progress(&self, progress: Progress) -> Result<()> {
        if progress.is_not_found() {
            tracing::warn!(task_uid = %progress.task_uid, "Ignoring sentinel progress");
            return Ok(());
        }
        self.memo
            .put(&progress_key(&progress.task_uid), &Value::from(progress.value))
            .await?;
        tracing::debug!(task_uid = %progress.task_uid, value = progress.value, "Stored progress");
        Ok(())
    }

    async fn store_result(&self, result: TaskResult) -> Result<()> {
        let key = result_key(&result.task_uid);
        if self.memo.put_if_absent(&key, &result.value).await? {
            tracing::info!(task_uid = %result.task_uid, "Stored result");
            return Ok(());
        }
        match self.memo.find(&key).await? {
            Some(existing) if existing != result.value => {
                tracing::warn!(task_uid = %result.task_uid, "Ignoring conflicting result; keeping the first one");
            },
            _ => {
                tracing::debug!(task_uid = %result.task_uid, "Ignoring duplicate result");
            },
        }
        Ok(())
    }

    async fn answer_progress(&self, uid: TaskUid) -> Result<()> {
        let progress = match self.memo.find(&progress_key(&uid)).await? {
            Some(value) => Progress {
                task_uid: uid,
                value: serde_json::from_value(value)?,
            },
            None => Progress::not_found(uid),
        };
        let queue = self
            .channels
            .addressing()
            .response_progress_queue(Role::Facade);
        self.channels.push(&progress, &queue).await?;
        tracing::debug!(task_uid = %progress.task_uid, value = progress.value, "Answered progress request");
        Ok(())
    }

    async fn answer_result(&self, uid: TaskUid) -> Result<()> {
        let result = match self.memo.find(&result_key(&uid)).await? {
            Some(value) => TaskResult::new(uid, value),
            None => TaskResult::not_found(uid),
        };
        let queue = self.channels.addressing().response_result_queue(Role::Facade);
        self.channels.push(&result, &queue).await?;
        tracing::debug!(
            task_uid = %result.task_uid,
            found = !result.is_not_found(),
            "Answered result request"
        );
        Ok(())
    }
}

/// The persistence role.
pub struct PersistenceSide {
    keeper: Keeper,
    subscriptions: Vec<Subscription>,
}

impl std::fmt::Debug for PersistenceSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceSide")
            .field("memo", &self.keeper.memo.name())
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}

impl PersistenceSide {
    /// Subscribes the progress and result queues of every act plus the two
    /// request queues.
    pub async fn start(channels: Channels, memo: Arc<dyn MemoStore>, acts: &[ActionId]) -> Result<Self> {
        let keeper = Keeper { channels, memo };
        let addressing = keeper.channels.addressing().clone();
        let mut subscriptions = Vec::with_capacity(acts.len() * 2 + 2);

        for act in acts {
            let progress_keeper = keeper.clone();
            subscriptions.push(
                keeper
                    .channels
                    .catch_json(
                        &addressing.progress_queue(act, Role::Persistence),
                        move |progress: Progress| {
                            let keeper = progress_keeper.clone();
                            async move { keeper.store_progress(progress).await }
                        },
                    )
                    .await?,
            );

            let result_keeper = keeper.clone();
            subscriptions.push(
                keeper
                    .channels
                    .catch_json(
                        &addressing.result_queue(act, Role::Persistence),
                        move |result: TaskResult| {
                            let keeper = result_keeper.clone();
                            async move { keeper.store_result(result).await }
                        },
                    )
                    .await?,
            );
        }

        let progress_keeper = keeper.clone();
        subscriptions.push(
            keeper
                .channels
                .catch_json(&addressing.request_progress_queue(), move |uid: TaskUid| {
                    let keeper = progress_keeper.clone();
                    async move { keeper.answer_progress(uid).await }
                })
                .await?,
        );

        let result_keeper = keeper.clone();
        subscriptions.push(
            keeper
                .channels
                .catch_json(&addressing.request_result_queue(), move |uid: TaskUid| {
                    let keeper = result_keeper.clone();
                    async move { keeper.answer_result(uid).await }
                })
                .await?,
        );

        tracing::info!(
            agent = %addressing.agent_id(),
            memo = keeper.memo.name(),
            queues = subscriptions.len(),
            "Persistence side listening"
        );
        Ok(Self {
            keeper,
            subscriptions,
        })
    }

    /// Latest stored progress for `uid`.
    pub async fn stored_progress(&self, uid: &TaskUid) -> Result<Option<f64>> {
        match self.keeper.memo.find(&progress_key(uid)).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Stored result for `uid`.
    pub async fn stored_result(&self, uid: &TaskUid) -> Result<Option<Value>> {
        Ok(self.keeper.memo.find(&result_key(uid)).await?)
    }

    /// Stops every consumer of this side.
    pub async fn shutdown(self) {
        unsubscribe_all(self.subscriptions).await;
        tracing::info!("Persistence side stopped");
    }
}

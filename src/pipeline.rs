//! Staged result construction.
//!
//! A [`Pipeline`] runs up to three stages per task: `raw` (required), then
//! `improved` (fed the raw result), then `mapped` (fed the improved result, or
//! the raw one when there is no improved stage). Each stage owns a slice of
//! the 0 to 100 progress range and progress is published when a stage starts and
//! just before its slice ends.
//!
//! Stages return [`anyhow::Result`] so any collaborator error can flow in. A
//! failure never escapes the pipeline, and neither does a panic: the
//! remaining stages are skipped and the error is folded into the answer. Only the raw stage is retried, up to
//! [`PipelineConfig::max_attempts`] times.
//!
//! # Answer layout
//!
//! Keys appear in this order, each only when it applies:
//!
//! | key               | present when                                                     |
//! |-------------------|------------------------------------------------------------------|
//! | `error`           | a stage failed                                                   |
//! | `mapped_result`   | non-empty                                                        |
//! | `improved_result` | non-empty                                                        |
//! | `raw_result`      | `include_raw` and non-empty, or neither of the above is present |
//! | `context`         | `include_context` and the task context is non-empty             |
//!
//! `null`, `""`, `[]` and `{}` count as empty.
//!
//! # Examples
//!
//! ```
//! use aide::pipeline::{assemble, AnswerParts, PipelineConfig};
//! use serde_json::json;
//!
//! let answer = assemble(
//!     &AnswerParts {
//!         raw: Some(json!({"b": 2})),
//!         improved: Some(json!({"a": 1})),
//!         mapped: Some(json!({})),
//!         ..Default::default()
//!     },
//!     &PipelineConfig::default(),
//! );
//! assert_eq!(answer, json!({"improved_result": {"a": 1}}));
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{panic_message, Error, Result};
use crate::sides::{Action, TaskReporter};
use crate::types::{Context, Task};

/// Progress slice `[start, end)` owned by a stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgressRange {
    /// Published when the stage starts.
    pub start: f64,
    /// Next stage's start; `end - 1` is published when the stage finishes.
    pub end: f64,
}

impl ProgressRange {
    /// A slice from `start` to `end`.
    pub const fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    /// Value published once the stage is done.
    pub fn finish(&self) -> f64 {
        (self.end - 1.0).max(self.start)
    }

    /// Maps `fraction` in `[0, 1]` into the slice, stopping short of
    /// [`finish`](Self::finish).
    pub fn at(&self, fraction: f64) -> f64 {
        self.start + (self.finish() - self.start) * fraction.clamp(0.0, 1.0)
    }

    /// Whether `0 <= start <= end <= 100`.
    pub fn is_valid(&self) -> bool {
        (0.0..=100.0).contains(&self.start)
            && (0.0..=100.0).contains(&self.end)
            && self.start <= self.end
    }

    /// The slice pulled into `[0, 100]` with `end >= start`.
    pub fn clamped(&self) -> Self {
        let start = clamp_percent(self.start);
        Self {
            start,
            end: clamp_percent(self.end).max(start),
        }
    }
}

fn clamp_percent(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}

/// Progress slices of the three stages.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageRanges {
    /// Slice of the raw stage.
    pub raw: ProgressRange,
    /// Slice of the improved stage.
    pub improved: ProgressRange,
    /// Slice of the mapped stage.
    pub mapped: ProgressRange,
}

impl StageRanges {
    /// Checks that every slice lies in `[0, 100]` and that the slices do
    /// not overlap, in stage order.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] naming the offending slice.
    pub fn validate(&self) -> Result<()> {
        let slices = [("raw", self.raw), ("improved", self.improved), ("mapped", self.mapped)];
        for (name, range) in slices {
            if !range.is_valid() {
                return Err(Error::configuration(format!(
                    "{name} progress range [{}, {}] is outside [0, 100]",
                    range.start, range.end
                )));
            }
        }
        for pair in slices.windows(2) {
            let ((before, earlier), (after, later)) = (pair[0], pair[1]);
            if earlier.end > later.start {
                return Err(Error::configuration(format!(
                    "{before} progress range overlaps the {after} range"
                )));
            }
        }
        Ok(())
    }

    /// Every slice [`clamped`](ProgressRange::clamped).
    pub fn clamped(&self) -> Self {
        Self {
            raw: self.raw.clamped(),
            improved: self.improved.clamped(),
            mapped: self.mapped.clamped(),
        }
    }
}

impl Default for StageRanges {
    fn default() -> Self {
        let third = 100.0 / 3.0;
        Self {
            raw: ProgressRange::new(0.0, third),
            improved: ProgressRange::new(third, 2.0 * third),
            mapped: ProgressRange::new(2.0 * third, 100.0),
        }
    }
}

/// Knobs of a [`Pipeline`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Attempts of the raw stage before giving up. At least 1.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Always include a non-empty raw result.
    #[serde(default)]
    pub include_raw: bool,
    /// Include the task context.
    #[serde(default)]
    pub include_context: bool,
    /// Progress slices.
    #[serde(default)]
    pub ranges: StageRanges,
}

fn default_max_attempts() -> u32 {
    1
}

impl PipelineConfig {
    /// Checks the attempt count and the progress slices.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::configuration("pipeline.max_attempts must be at least 1"));
        }
        self.ranges.validate()
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            include_raw: false,
            include_context: false,
            ranges: StageRanges::default(),
        }
    }
}

/// Handle a stage uses to report progress inside its slice.
pub struct StageProgress<'a> {
    reporter: &'a TaskReporter,
    range: ProgressRange,
}

impl StageProgress<'_> {
    /// The stage's slice.
    pub fn range(&self) -> ProgressRange {
        self.range
    }

    /// Publishes `fraction` of the stage's slice.
    pub async fn report(&self, fraction: f64) -> Result<()> {
        self.reporter.publish_progress(self.range.at(fraction)).await
    }
}

/// One step of result construction.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Builds this stage's value.
    ///
    /// `source` is `None` for the raw stage and the previous stage's output
    /// otherwise.
    async fn construct(
        &self,
        task: &Task,
        source: Option<&Value>,
        progress: &StageProgress<'_>,
    ) -> anyhow::Result<Value>;
}

/// Adapter for synchronous closures.
pub struct FnStage<F>(F);

#[async_trait]
impl<F> Stage for FnStage<F>
where
    F: Fn(&Task, Option<&Value>) -> anyhow::Result<Value> + Send + Sync,
{
    async fn construct(
        &self,
        task: &Task,
        source: Option<&Value>,
        _progress: &StageProgress<'_>,
    ) -> anyhow::Result<Value> {
        (self.0)(task, source)
    }
}

/// Wraps a closure as a stage.
pub fn stage_fn<F>(f: F) -> Arc<dyn Stage>
where
    F: Fn(&Task, Option<&Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    Arc::new(FnStage(f))
}

/// Everything [`assemble`] looks at.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnswerParts {
    /// Output of the raw stage.
    pub raw: Option<Value>,
    /// Output of the improved stage.
    pub improved: Option<Value>,
    /// Output of the mapped stage.
    pub mapped: Option<Value>,
    /// The task context.
    pub context: Option<Context>,
    /// Payload describing a stage failure.
    pub error: Option<Value>,
}

/// `null`, `""`, `[]` and `{}` are empty.
pub fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

fn non_empty(value: &Option<Value>) -> Option<&Value> {
    value.as_ref().filter(|v| !is_empty(v))
}

/// Builds the answer object from the stage outputs.
pub fn assemble(parts: &AnswerParts, config: &PipelineConfig) -> Value {
    let mut answer = Map::new();

    if let Some(error) = &parts.error {
        answer.insert("error".to_string(), error.clone());
    }
    let mapped = non_empty(&parts.mapped);
    if let Some(mapped) = mapped {
        answer.insert("mapped_result".to_string(), mapped.clone());
    }
    let improved = non_empty(&parts.improved);
    if let Some(improved) = improved {
        answer.insert("improved_result".to_string(), improved.clone());
    }
    if let Some(raw) = &parts.raw {
        let wanted = config.include_raw && !is_empty(raw);
        if wanted || (mapped.is_none() && improved.is_none()) {
            answer.insert("raw_result".to_string(), raw.clone());
        }
    }
    if config.include_context {
        if let Some(context) = parts.context.as_ref().filter(|c| !c.is_empty()) {
            answer.insert("context".to_string(), Value::Object(context.clone()));
        }
    }

    Value::Object(answer)
}

/// The error payload placed under `error`.
fn error_payload(stage: &'static str, err: &anyhow::Error) -> Value {
    json!({
        "stage": stage,
        "message": err.to_string(),
        "chain": err.chain().skip(1).map(|cause| cause.to_string()).collect::<Vec<_>>(),
    })
}

/// Raw, improved and mapped stages run as one [`Action`].
///
/// # Examples
///
/// ```
/// use aide::pipeline::{stage_fn, Pipeline, PipelineConfig};
/// use serde_json::json;
///
/// let pipeline = Pipeline::new(stage_fn(|task, _| Ok(json!({"msg": task.context["q"]}))))
///     .improved(stage_fn(|_, raw| Ok(json!({"shout": raw.cloned()}))))
///     .with_config(PipelineConfig { max_attempts: 3, ..Default::default() });
/// # let _ = pipeline;
/// ```
#[derive(Clone)]
pub struct Pipeline {
    raw: Arc<dyn Stage>,
    improved: Option<Arc<dyn Stage>>,
    mapped: Option<Arc<dyn Stage>>,
    config: PipelineConfig,
    explicit: bool,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("improved", &self.improved.is_some())
            .field("mapped", &self.mapped.is_some())
            .field("config", &self.config)
            .finish()
    }
}

impl Pipeline {
    /// A pipeline with only the raw stage and default config.
    pub fn new(raw: Arc<dyn Stage>) -> Self {
        Self {
            raw,
            improved: None,
            mapped: None,
            config: PipelineConfig::default(),
            explicit: false,
        }
    }

    /// Adds the improved stage.
    pub fn improved(mut self, stage: Arc<dyn Stage>) -> Self {
        self.improved = Some(stage);
        self
    }

    /// Adds the mapped stage.
    pub fn mapped(mut self, stage: Arc<dyn Stage>) -> Self {
        self.mapped = Some(stage);
        self
    }

    /// Replaces the config.
    ///
    /// Progress slices outside `[0, 100]` are clamped so every published
    /// value stays valid. A pipeline given its own config ignores the
    /// agent-wide defaults.
    pub fn with_config(mut self, mut config: PipelineConfig) -> Self {
        let ranges = config.ranges.clamped();
        if ranges != config.ranges {
            tracing::warn!(from = ?config.ranges, to = ?ranges, "Clamped pipeline progress ranges");
            config.ranges = ranges;
        }
        self.config = config;
        self.explicit = true;
        self
    }

    /// The active config.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Runs the stages and builds the answer without publishing the result.
    ///
    /// Progress is published through `reporter` as the stages run.
    ///
    /// # Errors
    ///
    /// Only progress publishing failures; stage failures end up in the answer.
    pub async fn construct(&self, task: &Task, reporter: &TaskReporter) -> Result<Value> {
        let ranges = self.config.ranges;
        let mut parts = AnswerParts {
            context: Some(task.context.clone()),
            ..Default::default()
        };

        let raw = match self.run_raw(task, reporter).await? {
            Ok(raw) => raw,
            Err(payload) => {
                parts.error = Some(payload);
                return Ok(assemble(&parts, &self.config));
            },
        };
        parts.raw = Some(raw);

        if let Some(stage) = &self.improved {
            let outcome = self
                .run_stage("improved", stage, task, parts.raw.as_ref(), ranges.improved, reporter)
                .await?;
            match outcome {
                Ok(improved) => parts.improved = Some(improved),
                Err(payload) => {
                    parts.error = Some(payload);
                    return Ok(assemble(&parts, &self.config));
                },
            }
        }

        if let Some(stage) = &self.mapped {
            let source = parts.improved.as_ref().or(parts.raw.as_ref());
            let outcome = self
                .run_stage("mapped", stage, task, source, ranges.mapped, reporter)
                .await?;
            match outcome {
                Ok(mapped) => parts.mapped = Some(mapped),
                Err(payload) => parts.error = Some(payload),
            }
        }

        Ok(assemble(&parts, &self.config))
    }

    async fn run_raw(
        &self,
        task: &Task,
        reporter: &TaskReporter,
    ) -> Result<std::result::Result<Value, Value>> {
        let attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self
                .run_stage("raw", &self.raw, task, None, self.config.ranges.raw, reporter)
                .await?
            {
                Ok(raw) => return Ok(Ok(raw)),
                Err(payload) if attempt >= attempts => return Ok(Err(payload)),
                Err(_) => {
                    tracing::warn!(task_uid = %task.uid, attempt, attempts, "Retrying raw stage");
                    attempt += 1;
                },
            }
        }
    }

    /// Outer `Err` is a publishing failure; inner `Err` is the error payload.
    async fn run_stage(
        &self,
        name: &'static str,
        stage: &Arc<dyn Stage>,
        task: &Task,
        source: Option<&Value>,
        range: ProgressRange,
        reporter: &TaskReporter,
    ) -> Result<std::result::Result<Value, Value>> {
        reporter.publish_progress(range.start).await?;
        let progress = StageProgress { reporter, range };
        let outcome = AssertUnwindSafe(stage.construct(task, source, &progress))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(anyhow::anyhow!("stage panicked: {}", panic_message(&*panic)))
            });
        match outcome {
            Ok(value) => {
                reporter.publish_progress(range.finish()).await?;
                Ok(Ok(value))
            },
            Err(err) => {
                let failure = Error::PipelineStage {
                    stage: name,
                    message: format!("{err:#}"),
                };
                tracing::error!(task_uid = %task.uid, error = %failure, "Pipeline stage failed");
                Ok(Err(error_payload(name, &err)))
            },
        }
    }
}

#[async_trait]
impl Action for Pipeline {
    fn with_pipeline_defaults(&self, defaults: &PipelineConfig) -> Option<Arc<dyn Action>> {
        if self.explicit {
            return None;
        }
        Some(Arc::new(self.clone().with_config(defaults.clone())))
    }

    async fn run(&self, task: &Task, reporter: &TaskReporter) -> Result<()> {
        reporter.publish_progress(0.0).await?;
        let answer = self.construct(task, reporter).await?;
        reporter.publish_progress(100.0).await?;
        reporter.publish_result(answer).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parts(raw: Value, improved: Option<Value>, mapped: Option<Value>) -> AnswerParts {
        AnswerParts {
            raw: Some(raw),
            improved,
            mapped,
            ..Default::default()
        }
    }

    #[test]
    fn raw_only_answer() {
        let answer = assemble(
            &parts(json!({"msg": "hi"}), None, None),
            &PipelineConfig::default(),
        );
        assert_eq!(answer, json!({"raw_result": {"msg": "hi"}}));
    }

    #[test]
    fn empty_mapped_falls_back_to_improved() {
        let p = parts(json!({"b": 2}), Some(json!({"a": 1})), Some(json!({})));
        assert_eq!(
            assemble(&p, &PipelineConfig::default()),
            json!({"improved_result": {"a": 1}})
        );

        let config = PipelineConfig {
            include_raw: true,
            ..Default::default()
        };
        assert_eq!(
            assemble(&p, &config),
            json!({"improved_result": {"a": 1}, "raw_result": {"b": 2}})
        );
    }

    #[test]
    fn empty_raw_is_kept_when_nothing_else_exists() {
        let answer = assemble(&parts(json!([]), None, None), &PipelineConfig::default());
        assert_eq!(answer, json!({"raw_result": []}));
    }

    #[test]
    fn error_comes_first_and_context_is_opt_in() {
        let mut context = Context::new();
        context.insert("q".to_string(), json!("hi"));
        let p = AnswerParts {
            raw: Some(json!(1)),
            context: Some(context),
            error: Some(json!({"stage": "improved"})),
            ..Default::default()
        };

        let without = assemble(&p, &PipelineConfig::default());
        assert_eq!(without, json!({"error": {"stage": "improved"}, "raw_result": 1}));

        let with = assemble(
            &p,
            &PipelineConfig {
                include_context: true,
                ..Default::default()
            },
        );
        let keys: Vec<&String> = with.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["error", "raw_result", "context"]);
    }

    #[test]
    fn error_only_answer_when_raw_missing() {
        let p = AnswerParts {
            error: Some(json!({"stage": "raw"})),
            ..Default::default()
        };
        assert_eq!(
            assemble(&p, &PipelineConfig::default()),
            json!({"error": {"stage": "raw"}})
        );
    }

    #[test]
    fn default_ranges_are_thirds() {
        let ranges = StageRanges::default();
        assert_eq!(ranges.raw.start, 0.0);
        assert!((ranges.improved.start - 100.0 / 3.0).abs() < 1e-9);
        assert_eq!(ranges.mapped.end, 100.0);
        assert_eq!(ranges.mapped.finish(), 99.0);
        assert_eq!(ranges.raw.at(0.0), 0.0);
        assert_eq!(ranges.raw.at(2.0), ranges.raw.finish());
    }

    #[test]
    fn ranges_outside_percent_or_overlapping_are_rejected() {
        assert!(StageRanges::default().validate().is_ok());

        let mut wide = StageRanges::default();
        wide.raw = ProgressRange::new(0.0, 150.0);
        assert!(matches!(wide.validate(), Err(Error::Configuration(_))));

        let mut overlapping = StageRanges::default();
        overlapping.improved = ProgressRange::new(10.0, 60.0);
        assert!(matches!(overlapping.validate(), Err(Error::Configuration(_))));

        let config = PipelineConfig {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn clamped_ranges_only_yield_valid_progress() {
        let range = ProgressRange::new(-5.0, 150.0).clamped();
        assert_eq!(range, ProgressRange::new(0.0, 100.0));
        assert_eq!(range.finish(), 99.0);
        assert_eq!(ProgressRange::new(80.0, 20.0).clamped(), ProgressRange::new(80.0, 80.0));
        assert_eq!(ProgressRange::new(f64::NAN, 10.0).clamped().start, 0.0);
    }

    #[test]
    fn explicit_config_wins_over_defaults() {
        let defaults = PipelineConfig {
            max_attempts: 3,
            ..Default::default()
        };
        let plain = Pipeline::new(stage_fn(|_, _| Ok(json!(1))));
        assert!(plain.with_pipeline_defaults(&defaults).is_some());

        let tuned = Pipeline::new(stage_fn(|_, _| Ok(json!(1)))).with_config(PipelineConfig::default());
        assert!(tuned.with_pipeline_defaults(&defaults).is_none());
    }

    mod construct_tests {
        use super::*;
        use pretty_assertions::assert_eq;
        use crate::addressing::Addressing;
        use crate::broker::{Broker, ExchangeSpec, InMemoryBroker};
        use crate::sides::Channels;
        use crate::types::{ActionId, AgentId, Role};
        use std::time::Duration;

        async fn reporter(task: &Task) -> TaskReporter {
            let broker = InMemoryBroker::new();
            broker
                .declare_exchange(&ExchangeSpec::topic("aide"))
                .await
                .unwrap();
            let channels = Channels::new(
                Arc::new(broker),
                Addressing::new(AgentId::new("kin").unwrap()),
                Duration::from_secs(1),
            );
            TaskReporter::new(channels, task, vec![Role::Persistence])
        }

        #[tokio::test]
        async fn panicking_stage_becomes_error_answer() {
            let task = Task::new(ActionId::new("echo").unwrap(), Context::new());
            let reporter = reporter(&task).await;
            let pipeline = Pipeline::new(stage_fn(|task, _| {
                let items: Vec<Value> = Vec::new();
                Ok(items[task.context.len()].clone())
            }));

            let answer = pipeline.construct(&task, &reporter).await.unwrap();
            assert_eq!(answer["error"]["stage"], json!("raw"));
            assert!(answer["error"]["message"]
                .as_str()
                .unwrap()
                .starts_with("stage panicked"));
        }

        #[tokio::test]
        async fn out_of_range_slices_still_produce_a_result() {
            let task = Task::new(ActionId::new("echo").unwrap(), Context::new());
            let reporter = reporter(&task).await;
            let mut config = PipelineConfig::default();
            config.ranges.raw = ProgressRange::new(0.0, 150.0);
            let pipeline = Pipeline::new(stage_fn(|_, _| Ok(json!("ok")))).with_config(config);

            pipeline.run(&task, &reporter).await.unwrap();
            assert!(reporter.is_closed());
        }
    }

    #[test]
    fn error_payload_carries_cause_chain() {
        let err = anyhow::anyhow!("socket closed").context("fetching listings");
        let payload = error_payload("raw", &err);
        assert_eq!(
            payload,
            json!({
                "stage": "raw",
                "message": "fetching listings",
                "chain": ["socket closed"],
            })
        );
    }
}

//! Wire messages correlated by a task uid.
//!
//! [`Task`], [`Progress`] and [`TaskResult`] travel as JSON objects with
//! exactly the fields declared here. Lookup requests are bare JSON strings
//! holding the uid.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::types::ids::{ActionId, TaskUid};

/// The context carried by a task: a JSON object.
pub type Context = Map<String, Value>;

/// Progress value the persistence side answers with when nothing is stored.
pub const PROGRESS_NOT_FOUND: f64 = -1.0;

/// A request to execute an action.
///
/// # Examples
///
/// ```
/// use aide::{ActionId, Task};
/// use serde_json::json;
///
/// let mut context = serde_json::Map::new();
/// context.insert("q".to_string(), json!("hi"));
/// let task = Task::new(ActionId::new("echo").unwrap(), context);
///
/// let wire = serde_json::to_value(&task).unwrap();
/// assert_eq!(wire["action_id"], "echo");
/// assert_eq!(wire["context"]["q"], "hi");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Fresh per request, never reused.
    pub uid: TaskUid,
    /// Which registered action should run.
    pub action_id: ActionId,
    /// Caller-supplied context, carried end to end.
    #[serde(default)]
    pub context: Context,
}

impl Task {
    /// Builds a task with a newly generated uid.
    pub fn new(action_id: ActionId, context: Context) -> Self {
        Self {
            uid: TaskUid::generate(),
            action_id,
            context,
        }
    }
}

/// Partial progress of a task, in percent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// Task this progress belongs to.
    pub task_uid: TaskUid,
    /// Percentage in `[0, 100]`, or [`PROGRESS_NOT_FOUND`] in lookup answers.
    pub value: f64,
}

impl Progress {
    /// Builds a progress message, validating the range.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidProgress`] if `value` is not finite or lies
    /// outside `[0, 100]`.
    pub fn new(task_uid: TaskUid, value: f64) -> Result<Self> {
        if !value.is_finite() || !(0.0..=100.0).contains(&value) {
            return Err(Error::InvalidProgress { value });
        }
        Ok(Self { task_uid, value })
    }

    /// The explicit "nothing stored" answer for a lookup.
    pub fn not_found(task_uid: TaskUid) -> Self {
        Self {
            task_uid,
            value: PROGRESS_NOT_FOUND,
        }
    }

    /// Returns `true` if this is the not-found sentinel.
    pub fn is_not_found(&self) -> bool {
        self.value < 0.0
    }
}

/// Terminal answer of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Task this result belongs to.
    pub task_uid: TaskUid,
    /// Assembled answer; `null` in lookup answers means "not found".
    pub value: Value,
}

impl TaskResult {
    /// Builds a result message.
    pub fn new(task_uid: TaskUid, value: Value) -> Self {
        Self { task_uid, value }
    }

    /// The explicit "nothing stored" answer for a lookup.
    pub fn not_found(task_uid: TaskUid) -> Self {
        Self {
            task_uid,
            value: Value::Null,
        }
    }

    /// Returns `true` if this is the not-found sentinel.
    pub fn is_not_found(&self) -> bool {
        self.value.is_null()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn progress_rejects_out_of_range() {
        let uid = TaskUid::from("t");
        assert!(Progress::new(uid.clone(), 0.0).is_ok());
        assert!(Progress::new(uid.clone(), 100.0).is_ok());
        for bad in [-0.5, 100.01, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                Progress::new(uid.clone(), bad),
                Err(Error::InvalidProgress { .. })
            ));
        }
    }

    #[test]
    fn wire_fields_are_exact() {
        let progress = Progress::new(TaskUid::from("t-1"), 42.0).unwrap();
        assert_eq!(
            serde_json::to_value(&progress).unwrap(),
            json!({"task_uid": "t-1", "value": 42.0})
        );

        let result = TaskResult::new(TaskUid::from("t-1"), json!({"raw_result": 1}));
        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            json!({"task_uid": "t-1", "value": {"raw_result": 1}})
        );
    }

    #[test]
    fn task_without_context_decodes_to_empty_context() {
        let task: Task = serde_json::from_value(json!({"uid": "u", "action_id": "echo"})).unwrap();
        assert!(task.context.is_empty());
    }

    #[test]
    fn sentinels() {
        assert!(Progress::not_found(TaskUid::from("x")).is_not_found());
        assert!(TaskResult::not_found(TaskUid::from("x")).is_not_found());
        assert!(!Progress::new(TaskUid::from("x"), 0.0).unwrap().is_not_found());
    }
}

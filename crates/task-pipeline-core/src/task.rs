use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a task
pub type TaskId = Uuid;

/// Positional arguments applied to the operation
pub type TaskArgs = Vec<Value>;

/// Named arguments applied to the operation
pub type TaskKwargs = Map<String, Value>;

/// An immutable unit of work.
///
/// The pipeline never looks inside `args`/`kwargs`; only the injected
/// handler interprets them. There is no mutating API after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    id: TaskId,
    args: TaskArgs,
    kwargs: TaskKwargs,
    created_at: DateTime<Utc>,
}

impl Task {
    /// Create a new task from positional and named arguments
    pub fn new(args: TaskArgs, kwargs: TaskKwargs) -> Self {
        Task {
            id: Uuid::new_v4(),
            args,
            kwargs,
            created_at: Utc::now(),
        }
    }

    /// Create a new task builder
    pub fn builder() -> TaskBuilder {
        TaskBuilder::new()
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn kwargs(&self) -> &TaskKwargs {
        &self.kwargs
    }

    /// Look up a named argument
    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs.get(name)
    }

    /// Look up a positional argument
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Compact payload rendering used in log lines: `(args) {kwargs}`.
impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args = Value::Array(self.args.clone());
        let kwargs = Value::Object(self.kwargs.clone());
        write!(f, "{} {}", args, kwargs)
    }
}

/// Builder for creating tasks argument by argument
#[derive(Debug, Default)]
pub struct TaskBuilder {
    args: TaskArgs,
    kwargs: TaskKwargs,
}

impl TaskBuilder {
    pub fn new() -> Self {
        TaskBuilder::default()
    }

    pub fn arg<V: Into<Value>>(mut self, value: V) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn args(mut self, args: TaskArgs) -> Self {
        self.args = args;
        self
    }

    pub fn kwarg<K: Into<String>, V: Into<Value>>(mut self, name: K, value: V) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    pub fn kwargs(mut self, kwargs: TaskKwargs) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn build(self) -> Task {
        Task::new(self.args, self.kwargs)
    }
}

//! Task types

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Closed set of operations a bee can be asked to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Analysis,
    Calculation,
    DataQuery,
    Execution,
    Monitoring,
    Validation,
}

impl TaskKind {
    pub fn all() -> &'static [TaskKind] {
        &[
            Self::Analysis,
            Self::Calculation,
            Self::DataQuery,
            Self::Execution,
            Self::Monitoring,
            Self::Validation,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analysis => "analysis",
            Self::Calculation => "calculation",
            Self::DataQuery => "data_query",
            Self::Execution => "execution",
            Self::Monitoring => "monitoring",
            Self::Validation => "validation",
        }
    }

    /// Kill-switch name consulted before running this kind of task
    pub fn feature(&self) -> &'static str {
        self.as_str()
    }

    /// Circuit breaker name. Identical to the feature name, so a tripped
    /// breaker disables exactly this kind of task.
    pub fn operation(&self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work addressed to one bee
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(default = "new_task_id")]
    pub id: String,

    /// Target bee; filled from the mailbox name when received over the bus
    #[serde(default)]
    pub bee: String,

    pub kind: TaskKind,

    #[serde(default)]
    pub payload: Value,
}

fn new_task_id() -> String {
    Uuid::new_v4().to_string()
}

impl Task {
    pub fn new(bee: impl Into<String>, kind: TaskKind, payload: Value) -> Self {
        Self {
            id: new_task_id(),
            bee: bee.into(),
            kind,
            payload,
        }
    }
}

/// Reply body sent back over the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed { task_id: String, result: Value },
    Refused { task_id: String, reason: String },
    Failed { task_id: String, error: String },
}

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Priority tier that governs where a run's steps are dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolName {
    High,
    Default,
    Low,
}

impl PoolName {
    pub const ALL: [PoolName; 3] = [PoolName::High, PoolName::Default, PoolName::Low];
}

impl std::fmt::Display for PoolName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolName::High => write!(f, "high"),
            PoolName::Default => write!(f, "default"),
            PoolName::Low => write!(f, "low"),
        }
    }
}

/// Status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Canceled => write!(f, "canceled"),
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "canceled" => Ok(RunStatus::Canceled),
            _ => Err(anyhow::anyhow!("Invalid run status: {}", s)),
        }
    }
}

/// Status of a single step attempt in the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Succeeded,
    Failed,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::Succeeded => write!(f, "succeeded"),
            StepStatus::Failed => write!(f, "failed"),
        }
    }
}

/// What a step does. Only affects defaults and logging; all kinds are
/// journaled and retried the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    /// Side-effecting work against an outside service (AI, email, payments).
    Action,
    /// Transactional state change against the store.
    Mutation,
    /// Read-only lookup against the store.
    Query,
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepKind::Action => write!(f, "action"),
            StepKind::Mutation => write!(f, "mutation"),
            StepKind::Query => write!(f, "query"),
        }
    }
}

/// One append-only journal entry for a step attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_index: usize,
    pub attempt: u32,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
}

impl StepRecord {
    pub fn pending(step_index: usize, attempt: u32, started_at: DateTime<Utc>) -> Self {
        Self {
            step_index,
            attempt,
            status: StepStatus::Pending,
            started_at,
            finished_at: None,
            error: None,
            output: None,
        }
    }

    pub fn succeeded(
        step_index: usize,
        attempt: u32,
        started_at: DateTime<Utc>,
        output: serde_json::Value,
    ) -> Self {
        Self {
            step_index,
            attempt,
            status: StepStatus::Succeeded,
            started_at,
            finished_at: Some(Utc::now()),
            error: None,
            output: Some(output),
        }
    }

    pub fn failed(step_index: usize, attempt: u32, started_at: DateTime<Utc>, error: String) -> Self {
        Self {
            step_index,
            attempt,
            status: StepStatus::Failed,
            started_at,
            finished_at: Some(Utc::now()),
            error: Some(error),
            output: None,
        }
    }
}

/// Terminal result handed to the completion handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RunResult {
    Success { return_value: serde_json::Value },
    Error { error: String },
    Canceled,
}

impl RunResult {
    /// Decode the success value into the workflow's typed output.
    pub fn return_value<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        match self {
            RunResult::Success { return_value } => Ok(serde_json::from_value(return_value.clone())?),
            RunResult::Error { error } => Err(anyhow::anyhow!("Run failed: {}", error)),
            RunResult::Canceled => Err(anyhow::anyhow!("Run was canceled")),
        }
    }

    pub fn status(&self) -> RunStatus {
        match self {
            RunResult::Success { .. } => RunStatus::Completed,
            RunResult::Error { .. } => RunStatus::Failed,
            RunResult::Canceled => RunStatus::Canceled,
        }
    }
}

/// Durable reference to a completion handler plus its caller-supplied context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnComplete {
    pub handler: String,
    pub context: serde_json::Value,
}

/// One execution instance of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: String,
    pub definition_name: String,
    pub args: serde_json::Value,
    pub pool: PoolName,
    /// Index of the next step to execute. Equals the number of succeeded entries.
    pub cursor: usize,
    pub step_history: Vec<StepRecord>,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<RunResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_complete: Option<OnComplete>,
    #[serde(default)]
    pub on_complete_fired: bool,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    pub fn new(
        id: &str,
        definition_name: &str,
        args: serde_json::Value,
        pool: PoolName,
        on_complete: Option<OnComplete>,
    ) -> Self {
        Self {
            id: id.to_string(),
            definition_name: definition_name.to_string(),
            args,
            pool,
            cursor: 0,
            step_history: Vec::new(),
            status: RunStatus::Running,
            result: None,
            on_complete,
            on_complete_fired: false,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn succeeded_count(&self) -> usize {
        self.step_history
            .iter()
            .filter(|r| r.status == StepStatus::Succeeded)
            .count()
    }

    /// Number of failed attempts journaled for a step. An attempt that was
    /// interrupted by a crash (pending with no outcome) is not counted.
    pub fn failed_attempts(&self, step_index: usize) -> u32 {
        self.step_history
            .iter()
            .filter(|r| r.step_index == step_index && r.status == StepStatus::Failed)
            .count() as u32
    }

    /// Outputs of succeeded steps, in step order.
    pub fn outputs(&self) -> Vec<serde_json::Value> {
        let mut succeeded: Vec<&StepRecord> = self
            .step_history
            .iter()
            .filter(|r| r.status == StepStatus::Succeeded)
            .collect();
        succeeded.sort_by_key(|r| r.step_index);
        succeeded
            .into_iter()
            .map(|r| r.output.clone().unwrap_or(serde_json::Value::Null))
            .collect()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.step_history
            .iter()
            .rev()
            .find_map(|r| r.error.as_deref())
    }
}

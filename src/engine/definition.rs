use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::engine::retry::RetryPolicy;
use crate::engine::types::{PoolName, StepKind};

/// Future returned by a type-erased step closure.
pub type StepFuture = BoxFuture<'static, Result<serde_json::Value>>;

/// Type-erased step closure. Typed arguments are decoded inside.
pub type StepFn = Arc<dyn Fn(StepInput) -> StepFuture + Send + Sync>;

/// Typed argument payload of a workflow, tied to the definition it starts.
pub trait WorkflowArgs: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Name the definition is registered under.
    const NAME: &'static str;
    /// Priority tier the definition's steps are dispatched on.
    const POOL: PoolName;
}

/// Everything a step attempt gets to see.
#[derive(Debug, Clone)]
pub struct StepInput {
    pub run_id: String,
    pub step_index: usize,
    pub attempt: u32,
    pub args: serde_json::Value,
    /// Outputs of the steps that already succeeded, in step order.
    pub outputs: Vec<serde_json::Value>,
}

impl StepInput {
    pub fn args<A: DeserializeOwned>(&self) -> Result<A> {
        serde_json::from_value(self.args.clone()).context("Failed to decode workflow arguments")
    }

    /// Decode the output of an earlier step.
    pub fn output<T: DeserializeOwned>(&self, step_index: usize) -> Result<T> {
        let value = self.outputs.get(step_index).with_context(|| {
            format!(
                "Step {} has no output yet (cursor at {})",
                step_index, self.step_index
            )
        })?;
        serde_json::from_value(value.clone())
            .with_context(|| format!("Failed to decode output of step {}", step_index))
    }
}

/// One step of a definition.
#[derive(Clone)]
pub struct StepSpec {
    pub name: String,
    pub kind: StepKind,
    pub retry: RetryPolicy,
    pub timeout: Option<Duration>,
    run: StepFn,
}

impl StepSpec {
    pub fn new(name: &str, kind: StepKind, retry: RetryPolicy, run: StepFn) -> Self {
        Self {
            name: name.to_string(),
            kind,
            retry,
            timeout: None,
            run,
        }
    }

    pub fn invoke(&self, input: StepInput) -> StepFuture {
        (self.run)(input)
    }
}

impl std::fmt::Debug for StepSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepSpec")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Immutable, named sequence of steps bound to a pool.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    pub name: String,
    pub pool: PoolName,
    pub steps: Vec<StepSpec>,
}

impl WorkflowDefinition {
    /// Start a typed definition for the args type `A`.
    pub fn builder<A: WorkflowArgs>() -> DefinitionBuilder<A> {
        DefinitionBuilder {
            name: A::NAME.to_string(),
            pool: A::POOL,
            steps: Vec::new(),
            _args: PhantomData,
        }
    }
}

/// Builds a [`WorkflowDefinition`] whose step closures receive `A` already decoded.
pub struct DefinitionBuilder<A> {
    name: String,
    pool: PoolName,
    steps: Vec<StepSpec>,
    _args: PhantomData<fn() -> A>,
}

impl<A: WorkflowArgs> DefinitionBuilder<A> {
    /// Side-effecting step (AI call, email, payment).
    pub fn action<F, Fut, T>(self, name: &str, retry: RetryPolicy, f: F) -> Self
    where
        F: Fn(A, StepInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Serialize + Send + 'static,
    {
        self.step(name, StepKind::Action, retry, f)
    }

    /// Transactional state change.
    pub fn mutation<F, Fut, T>(self, name: &str, retry: RetryPolicy, f: F) -> Self
    where
        F: Fn(A, StepInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Serialize + Send + 'static,
    {
        self.step(name, StepKind::Mutation, retry, f)
    }

    /// Read-only lookup; its output feeds later steps.
    pub fn query<F, Fut, T>(self, name: &str, retry: RetryPolicy, f: F) -> Self
    where
        F: Fn(A, StepInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Serialize + Send + 'static,
    {
        self.step(name, StepKind::Query, retry, f)
    }

    /// Bound the most recently added step.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        if let Some(step) = self.steps.last_mut() {
            step.timeout = Some(timeout);
        }
        self
    }

    pub fn build(self) -> WorkflowDefinition {
        WorkflowDefinition {
            name: self.name,
            pool: self.pool,
            steps: self.steps,
        }
    }

    fn step<F, Fut, T>(mut self, name: &str, kind: StepKind, retry: RetryPolicy, f: F) -> Self
    where
        F: Fn(A, StepInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Serialize + Send + 'static,
    {
        let f = Arc::new(f);
        let run: StepFn = Arc::new(move |input: StepInput| -> StepFuture {
            let f = f.clone();
            Box::pin(async move {
                let args: A = input.args()?;
                let value = f(args, input).await?;
                Ok(serde_json::to_value(value)?)
            })
        });
        self.steps.push(StepSpec::new(name, kind, retry, run));
        self
    }
}

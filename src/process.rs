//! # Process Engine
//!
//! Every file operation runs as a process: an ordered tree of steps, each
//! with an execute function and an optional rollback function.
//!
//! Steps run depth-first. When a step fails, every step that already
//! executed is rolled back in strict reverse execution order and the process
//! fails. A failing rollback is logged and the sweep continues. The caller's
//! [`ProcessListener`] hears about the outcome exactly once, after rollback
//! has finished.
//!
//! Per-step state machine:
//!
//! ```text
//! NotExecuted -> Executing -> Executed -> RolledBack
//!                          \-> Failed
//! ```

use crate::error::{ErrorKind, Result, SyncError};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub type StepFuture = BoxFuture<'static, Result<()>>;
type StepFn = Box<dyn FnMut() -> StepFuture + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotExecuted,
    Executing,
    Executed,
    Failed,
    RolledBack,
}

/// Why a process failed: the leaf step that broke and its error.
#[derive(Debug)]
pub struct ProcessFailure {
    pub step: String,
    pub error: SyncError,
}

impl ProcessFailure {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

impl std::fmt::Display for ProcessFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "step '{}' failed: {}", self.step, self.error)
    }
}

/// A single unit of work.
pub struct ProcessStep {
    name: String,
    state: ProcessState,
    execute: StepFn,
    rollback: Option<StepFn>,
}

impl ProcessStep {
    pub fn new<F, Fut>(name: impl Into<String>, mut execute: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            state: ProcessState::NotExecuted,
            execute: Box::new(move || execute().boxed()),
            rollback: None,
        }
    }

    pub fn with_rollback<F, Fut>(mut self, mut rollback: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.rollback = Some(Box::new(move || rollback().boxed()));
        self
    }

    async fn execute(&mut self) -> std::result::Result<(), ProcessFailure> {
        self.state = ProcessState::Executing;
        debug!("Executing step '{}'", self.name);

        match (self.execute)().await {
            Ok(()) => {
                self.state = ProcessState::Executed;
                Ok(())
            }
            Err(error) => {
                warn!("Step '{}' failed: {}", self.name, error);
                self.state = ProcessState::Failed;
                Err(ProcessFailure {
                    step: self.name.clone(),
                    error,
                })
            }
        }
    }

    async fn rollback(&mut self) {
        if self.state != ProcessState::Executed {
            return;
        }
        if let Some(rollback) = self.rollback.as_mut() {
            debug!("Rolling back step '{}'", self.name);
            if let Err(e) = rollback().await {
                error!("Rollback of step '{}' failed: {}", self.name, e);
            }
        }
        self.state = ProcessState::RolledBack;
    }
}

/// Children executed one after another.
pub struct SequentialProcess {
    name: String,
    state: ProcessState,
    components: Vec<ProcessComponent>,
}

impl SequentialProcess {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: ProcessState::NotExecuted,
            components: Vec::new(),
        }
    }

    pub fn then(mut self, component: impl Into<ProcessComponent>) -> Self {
        self.components.push(component.into());
        self
    }

    pub fn push(&mut self, component: impl Into<ProcessComponent>) {
        self.components.push(component.into());
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}

pub enum ProcessComponent {
    Step(ProcessStep),
    Sequence(SequentialProcess),
}

impl From<ProcessStep> for ProcessComponent {
    fn from(step: ProcessStep) -> Self {
        ProcessComponent::Step(step)
    }
}

impl From<SequentialProcess> for ProcessComponent {
    fn from(sequence: SequentialProcess) -> Self {
        ProcessComponent::Sequence(sequence)
    }
}

impl ProcessComponent {
    pub fn name(&self) -> &str {
        match self {
            ProcessComponent::Step(step) => &step.name,
            ProcessComponent::Sequence(sequence) => &sequence.name,
        }
    }

    pub fn state(&self) -> ProcessState {
        match self {
            ProcessComponent::Step(step) => step.state,
            ProcessComponent::Sequence(sequence) => sequence.state,
        }
    }

    fn execute(&mut self) -> BoxFuture<'_, std::result::Result<(), ProcessFailure>> {
        async move {
            match self {
                ProcessComponent::Step(step) => step.execute().await,
                ProcessComponent::Sequence(sequence) => {
                    sequence.state = ProcessState::Executing;
                    for index in 0..sequence.components.len() {
                        if let Err(failure) = sequence.components[index].execute().await {
                            for done in sequence.components[..index].iter_mut().rev() {
                                done.rollback().await;
                            }
                            sequence.state = ProcessState::Failed;
                            return Err(failure);
                        }
                    }
                    sequence.state = ProcessState::Executed;
                    Ok(())
                }
            }
        }
        .boxed()
    }

    fn rollback(&mut self) -> BoxFuture<'_, ()> {
        async move {
            match self {
                ProcessComponent::Step(step) => step.rollback().await,
                ProcessComponent::Sequence(sequence) => {
                    if sequence.state != ProcessState::Executed {
                        return;
                    }
                    for component in sequence.components.iter_mut().rev() {
                        component.rollback().await;
                    }
                    sequence.state = ProcessState::RolledBack;
                }
            }
        }
        .boxed()
    }

    /// Names and states of all leaf steps, in declaration order.
    pub fn step_states(&self) -> Vec<(String, ProcessState)> {
        let mut out = Vec::new();
        self.collect_states(&mut out);
        out
    }

    fn collect_states(&self, out: &mut Vec<(String, ProcessState)>) {
        match self {
            ProcessComponent::Step(step) => out.push((step.name.clone(), step.state)),
            ProcessComponent::Sequence(sequence) => {
                for component in &sequence.components {
                    component.collect_states(out);
                }
            }
        }
    }
}

/// Receives the outcome of a process, exactly once.
#[cfg_attr(test, mockall::automock)]
pub trait ProcessListener: Send + Sync {
    fn on_success(&self);
    fn on_failure(&self, failure: &ProcessFailure);
}

/// Listener that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingListener;

impl ProcessListener for LoggingListener {
    fn on_success(&self) {
        info!("Process completed");
    }

    fn on_failure(&self, failure: &ProcessFailure) {
        warn!("Process failed: {}", failure);
    }
}

#[derive(Debug)]
pub struct ProcessReport {
    pub id: Uuid,
    pub name: String,
    pub outcome: std::result::Result<(), ProcessFailure>,
    pub steps: Vec<(String, ProcessState)>,
    pub elapsed: Duration,
}

impl ProcessReport {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Run a process to completion and report to `listener`.
///
/// The process is consumed: retrying means building a new one.
pub async fn run(mut process: ProcessComponent, listener: &dyn ProcessListener) -> ProcessReport {
    let id = Uuid::new_v4();
    let name = process.name().to_string();
    let started = Instant::now();
    info!("Starting process '{}' ({})", name, id);

    let outcome = process.execute().await;
    match &outcome {
        Ok(()) => {
            info!("Process '{}' succeeded in {:?}", name, started.elapsed());
            listener.on_success();
        }
        Err(failure) => {
            warn!("Process '{}' rolled back: {}", name, failure);
            listener.on_failure(failure);
        }
    }

    ProcessReport {
        id,
        name,
        outcome,
        steps: process.step_states(),
        elapsed: started.elapsed(),
    }
}

/// Run a process on the tokio runtime.
pub fn spawn(process: ProcessComponent, listener: Arc<dyn ProcessListener>) -> JoinHandle<ProcessReport> {
    tokio::spawn(async move { run(process, listener.as_ref()).await })
}

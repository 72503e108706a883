//! Workflow engine: an ordered step list over a typed state.
//!
//! Each step declares the state keys it reads (`requires`) and writes
//! (`produces`) plus the capability tags that drive per-step client
//! injection. The declarations are checked once at workflow construction:
//! a step may only require keys covered by the initial state or produced by
//! an earlier step. Execution is strictly sequential; steps signal
//! early-exit through state flags that later steps check, never by
//! aborting the workflow.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Error, Result};
use crate::llm::LlmClient;

/// Capability tags that enable dependency injection per step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Step issues chat/vision/transcription calls
    Llm,
    /// Step embeds text or runs vector search
    Vector,
    /// Step reads or writes repositories
    Db,
    /// Step touches the filesystem
    Io,
}

/// Per-step LLM profile selection.
#[derive(Debug, Clone, Default)]
pub struct StepConfig {
    /// Profile for chat-style calls; `default` when unset
    pub chat_llm_profile: Option<String>,
    /// Profile for embedding calls; `embedding` when unset
    pub embed_llm_profile: Option<String>,
}

/// Clients resolved for one step according to its declared capabilities.
#[derive(Clone, Default)]
pub struct StepClients {
    /// Chat/vision/transcription client, present when the step declares
    /// [`Capability::Llm`]
    pub chat: Option<Arc<dyn LlmClient>>,
    /// Embedding client, present when the step declares
    /// [`Capability::Vector`]
    pub embed: Option<Arc<dyn LlmClient>>,
}

impl StepClients {
    /// The chat client; erroring when the step forgot to declare `Llm`.
    pub fn chat(&self) -> Result<Arc<dyn LlmClient>> {
        self.chat
            .clone()
            .ok_or_else(|| Error::Workflow("step has no chat client injected".to_string()))
    }

    /// The embedding client; erroring when the step forgot to declare
    /// `Vector`.
    pub fn embed(&self) -> Result<Arc<dyn LlmClient>> {
        self.embed
            .clone()
            .ok_or_else(|| Error::Workflow("step has no embedding client injected".to_string()))
    }
}

/// A step handler: an async function over the workflow state plus its
/// injected clients.
#[async_trait]
pub trait StepHandler<S: Send>: Send + Sync {
    async fn run(&self, state: &mut S, clients: StepClients) -> Result<()>;
}

/// One step of a workflow.
pub struct WorkflowStep<S: Send> {
    pub id: &'static str,
    /// Role tag grouping steps by function (ingest, preprocess, ...)
    pub role: &'static str,
    /// State keys the handler reads
    pub requires: &'static [&'static str],
    /// State keys the handler writes
    pub produces: &'static [&'static str],
    pub capabilities: &'static [Capability],
    pub config: StepConfig,
    pub handler: Box<dyn StepHandler<S>>,
}

impl<S: Send> std::fmt::Debug for WorkflowStep<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowStep")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("requires", &self.requires)
            .field("produces", &self.produces)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

impl<S: Send> WorkflowStep<S> {
    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// An ordered, statically validated list of steps.
#[derive(Debug)]
pub struct Workflow<S: Send> {
    name: &'static str,
    steps: Vec<WorkflowStep<S>>,
}

impl<S: Send> Workflow<S> {
    /// Build a workflow, verifying that every step's `requires` is covered
    /// by the initial state keys plus the `produces` of earlier steps.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Workflow`] naming the first unsatisfied key.
    pub fn new(
        name: &'static str,
        initial_keys: &[&'static str],
        steps: Vec<WorkflowStep<S>>,
    ) -> Result<Self> {
        let mut available: HashSet<&'static str> = initial_keys.iter().copied().collect();
        for step in &steps {
            for required in step.requires {
                if !available.contains(required) {
                    return Err(Error::Workflow(format!(
                        "workflow '{name}' step '{}' requires '{required}' which no earlier step produces",
                        step.id
                    )));
                }
            }
            available.extend(step.produces.iter().copied());
        }
        Ok(Self { name, steps })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn steps(&self) -> &[WorkflowStep<S>] {
        &self.steps
    }

    /// Walk the step list: resolve clients, await the handler, advance.
    ///
    /// # Errors
    ///
    /// The first failing step aborts the workflow and its error is
    /// propagated unchanged.
    pub async fn run<F>(&self, state: &mut S, resolve_clients: F) -> Result<()>
    where
        F: Fn(&WorkflowStep<S>) -> Result<StepClients>,
    {
        for step in &self.steps {
            debug!(workflow = self.name, step = step.id, role = step.role, "running step");
            let clients = resolve_clients(step)?;
            step.handler.run(state, clients).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CounterState {
        calls: Vec<&'static str>,
    }

    struct RecordingHandler {
        id: &'static str,
        fail: bool,
    }

    #[async_trait]
    impl StepHandler<CounterState> for RecordingHandler {
        async fn run(&self, state: &mut CounterState, _clients: StepClients) -> Result<()> {
            if self.fail {
                return Err(Error::Workflow("boom".to_string()));
            }
            state.calls.push(self.id);
            Ok(())
        }
    }

    fn step(
        id: &'static str,
        requires: &'static [&'static str],
        produces: &'static [&'static str],
    ) -> WorkflowStep<CounterState> {
        WorkflowStep {
            id,
            role: "test",
            requires,
            produces,
            capabilities: &[],
            config: StepConfig::default(),
            handler: Box::new(RecordingHandler { id, fail: false }),
        }
    }

    #[tokio::test]
    async fn runs_steps_in_order() {
        let workflow = Workflow::new(
            "test",
            &["input"],
            vec![
                step("first", &["input"], &["middle"]),
                step("second", &["middle"], &["output"]),
            ],
        )
        .unwrap();

        let mut state = CounterState::default();
        workflow
            .run(&mut state, |_| Ok(StepClients::default()))
            .await
            .unwrap();
        assert_eq!(state.calls, vec!["first", "second"]);
    }

    #[test]
    fn rejects_unsatisfied_requires_at_construction() {
        let result = Workflow::new(
            "test",
            &["input"],
            vec![
                step("first", &["input"], &["a"]),
                step("second", &["missing"], &[]),
            ],
        );
        let err = result.err().map(|e| e.to_string()).unwrap_or_default();
        assert!(err.contains("second"));
        assert!(err.contains("missing"));
    }

    #[test]
    fn later_steps_may_require_earlier_produces() {
        assert!(Workflow::new(
            "test",
            &[],
            vec![step("a", &[], &["x"]), step("b", &["x"], &[])],
        )
        .is_ok());
    }

    #[tokio::test]
    async fn failing_step_aborts_the_rest() {
        let mut failing = step("boom", &[], &[]);
        failing.handler = Box::new(RecordingHandler {
            id: "boom",
            fail: true,
        });
        let workflow = Workflow::new("test", &[], vec![failing, step("after", &[], &[])]).unwrap();

        let mut state = CounterState::default();
        let result = workflow.run(&mut state, |_| Ok(StepClients::default())).await;
        assert!(result.is_err());
        assert!(state.calls.is_empty());
    }

    #[test]
    fn missing_clients_error_lazily() {
        let clients = StepClients::default();
        assert!(clients.chat().is_err());
        assert!(clients.embed().is_err());
    }
}

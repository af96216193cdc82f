//! Built-in leaf units.
//!
//! Real deployments wrap a model client or tool in their own `Invocable`. These units cover
//! glue code (`FnUnit`), fixed or scripted behaviour for topology files and demos, and
//! deliberate failures.

use std::future::Future;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use maestro_core::error::{MaestroError, Result};
use maestro_core::traits::{Invocable, UnitContext};
use maestro_core::types::{value_text, HandoffSignal, Invocation, NodeId, UnitOutcome};

/// Adapter turning an async closure into an Invocable.
pub struct FnUnit<F> {
    name: String,
    f: F,
}

impl<F, Fut> FnUnit<F>
where
    F: Fn(Invocation, UnitContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<UnitOutcome>> + Send + 'static,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F, Fut> Invocable for FnUnit<F>
where
    F: Fn(Invocation, UnitContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<UnitOutcome>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, invocation: Invocation, ctx: UnitContext) -> BoxFuture<'_, Result<UnitOutcome>> {
        Box::pin((self.f)(invocation, ctx))
    }
}

/// Always returns the same output.
pub struct StaticUnit {
    name: String,
    output: Value,
}

impl StaticUnit {
    pub fn new(name: impl Into<String>, output: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            output: output.into(),
        }
    }
}

impl Invocable for StaticUnit {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, _invocation: Invocation, _ctx: UnitContext) -> BoxFuture<'_, Result<UnitOutcome>> {
        Box::pin(async move { Ok(UnitOutcome::success(self.output.clone())) })
    }
}

/// Echoes its input as text: the task, then one line per upstream output or transcript turn.
pub struct EchoUnit {
    name: String,
    prefix: Option<String>,
}

impl EchoUnit {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prefix: None,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    fn render(&self, invocation: &Invocation) -> String {
        let mut text = String::new();
        if let Some(prefix) = &self.prefix {
            text.push_str(prefix);
        }
        text.push_str(&value_text(&invocation.task));
        for (node, output) in &invocation.upstream {
            text.push_str(&format!("\n[{}] {}", node, value_text(output)));
        }
        for turn in &invocation.transcript {
            text.push_str(&format!("\n[{}] {}", turn.node_id, value_text(&turn.output)));
        }
        text
    }
}

impl Invocable for EchoUnit {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, invocation: Invocation, _ctx: UnitContext) -> BoxFuture<'_, Result<UnitOutcome>> {
        Box::pin(async move { Ok(UnitOutcome::success(self.render(&invocation))) })
    }
}

/// Always fails with the same message.
pub struct FailingUnit {
    name: String,
    message: String,
}

impl FailingUnit {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl Invocable for FailingUnit {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, _invocation: Invocation, ctx: UnitContext) -> BoxFuture<'_, Result<UnitOutcome>> {
        Box::pin(async move {
            Err(MaestroError::execution(ctx.node_id.as_str(), self.message.clone()))
        })
    }
}

/// One scripted turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScriptStep {
    /// Return a plain output.
    Output {
        value: Value,
        #[serde(default)]
        delay_ms: u64,
    },
    /// Emit a structured handoff signal.
    Handoff {
        target: NodeId,
        #[serde(default)]
        payload: Value,
        #[serde(default)]
        delay_ms: u64,
    },
    /// Emit a structured completion signal.
    Complete {
        value: Value,
        #[serde(default)]
        delay_ms: u64,
    },
    /// Fail the turn.
    Fail {
        message: String,
        #[serde(default)]
        delay_ms: u64,
    },
}

impl ScriptStep {
    pub fn output(value: impl Into<Value>) -> Self {
        Self::Output {
            value: value.into(),
            delay_ms: 0,
        }
    }

    pub fn handoff(target: impl Into<NodeId>) -> Self {
        Self::Handoff {
            target: target.into(),
            payload: Value::Null,
            delay_ms: 0,
        }
    }

    pub fn complete(value: impl Into<Value>) -> Self {
        Self::Complete {
            value: value.into(),
            delay_ms: 0,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self::Fail {
            message: message.into(),
            delay_ms: 0,
        }
    }

    fn delay(&self) -> Duration {
        let ms = match self {
            Self::Output { delay_ms, .. }
            | Self::Handoff { delay_ms, .. }
            | Self::Complete { delay_ms, .. }
            | Self::Fail { delay_ms, .. } => *delay_ms,
        };
        Duration::from_millis(ms)
    }
}

/// Plays back a script, one step per execution of its node.
///
/// The step is chosen by the execution index from the context, so the unit keeps no state
/// between runs; once the script is exhausted the last step repeats.
pub struct ScriptedUnit {
    name: String,
    steps: Vec<ScriptStep>,
}

impl ScriptedUnit {
    pub fn new(name: impl Into<String>, steps: Vec<ScriptStep>) -> Self {
        Self {
            name: name.into(),
            steps,
        }
    }

    fn step(&self, execution_index: u32) -> Option<&ScriptStep> {
        let last = self.steps.len().checked_sub(1)?;
        self.steps.get((execution_index as usize).min(last))
    }
}

impl Invocable for ScriptedUnit {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, _invocation: Invocation, ctx: UnitContext) -> BoxFuture<'_, Result<UnitOutcome>> {
        Box::pin(async move {
            let step = self.step(ctx.execution_index).ok_or_else(|| {
                MaestroError::execution(ctx.node_id.as_str(), "script has no steps")
            })?;

            let delay = step.delay();
            if !delay.is_zero() {
                tokio::select! {
                    _ = ctx.cancel.cancelled() => return Err(MaestroError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            match step {
                ScriptStep::Output { value, .. } => Ok(UnitOutcome::success(value.clone())),
                ScriptStep::Handoff {
                    target, payload, ..
                } => Ok(UnitOutcome::success(
                    HandoffSignal::handoff(target.clone(), payload.clone()).to_value(),
                )),
                ScriptStep::Complete { value, .. } => Ok(UnitOutcome::success(
                    HandoffSignal::complete(value.clone()).to_value(),
                )),
                ScriptStep::Fail { message, .. } => Err(MaestroError::execution(
                    ctx.node_id.as_str(),
                    message.clone(),
                )),
            }
        })
    }
}

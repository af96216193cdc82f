//! Mock units and fixtures shared by Maestro tests.

use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::time::Instant;

use maestro_core::error::{MaestroError, Result};
use maestro_core::traits::{Invocable, UnitContext};
use maestro_core::types::{HandoffSignal, Invocation, UnitOutcome};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// What a [`MockUnit`] does on one call.
#[derive(Debug, Clone)]
pub enum MockStep {
    Output(Value),
    Fail(String),
    Signal(HandoffSignal),
}

/// Scripted unit that records every invocation it receives.
///
/// The step is picked by the context's execution index; the last step repeats.
pub struct MockUnit {
    name: String,
    steps: Vec<MockStep>,
    delay: Option<Duration>,
    calls: Mutex<Vec<Invocation>>,
}

impl MockUnit {
    pub fn script(name: impl Into<String>, steps: Vec<MockStep>) -> Self {
        Self {
            name: name.into(),
            steps,
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn returning(name: impl Into<String>, output: impl Into<Value>) -> Self {
        Self::script(name, vec![MockStep::Output(output.into())])
    }

    pub fn failing(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::script(name, vec![MockStep::Fail(message.into())])
    }

    /// Emit a handoff signal to `target`.
    pub fn handing_off(name: impl Into<String>, target: &str) -> Self {
        Self::script(
            name,
            vec![MockStep::Signal(HandoffSignal::handoff(target, Value::Null))],
        )
    }

    /// Emit a completion signal.
    pub fn completing(name: impl Into<String>, output: impl Into<Value>) -> Self {
        Self::script(
            name,
            vec![MockStep::Signal(HandoffSignal::complete(output))],
        )
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<Invocation> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }
}

impl Invocable for MockUnit {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, invocation: Invocation, ctx: UnitContext) -> BoxFuture<'_, Result<UnitOutcome>> {
        Box::pin(async move {
            lock(&self.calls).push(invocation);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let idx = (ctx.execution_index as usize).min(self.steps.len().saturating_sub(1));
            match self.steps.get(idx) {
                Some(MockStep::Output(v)) => Ok(UnitOutcome::success(v.clone())),
                Some(MockStep::Signal(s)) => Ok(UnitOutcome::success(s.to_value())),
                Some(MockStep::Fail(msg)) => {
                    Err(MaestroError::execution(ctx.node_id.as_str(), msg.clone()))
                }
                None => Err(MaestroError::execution(ctx.node_id.as_str(), "mock has no steps")),
            }
        })
    }
}

/// Start and finish instants of one unit call.
#[derive(Debug, Clone, Copy)]
pub struct Span {
    pub start: Instant,
    pub end: Instant,
}

/// Shared record of when timed units ran.
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    spans: Arc<Mutex<Vec<(String, Span)>>>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, node: &str, span: Span) {
        lock(&self.spans).push((node.to_string(), span));
    }

    /// First recorded span of `node`.
    pub fn span(&self, node: &str) -> Option<Span> {
        lock(&self.spans)
            .iter()
            .find(|(n, _)| n == node)
            .map(|(_, s)| *s)
    }

    pub fn spans(&self) -> Vec<(String, Span)> {
        lock(&self.spans).clone()
    }
}

/// Unit that sleeps for a fixed time and records its span on a [`Timeline`].
pub struct TimedUnit {
    name: String,
    delay: Duration,
    timeline: Timeline,
}

impl TimedUnit {
    pub fn new(name: impl Into<String>, delay: Duration, timeline: &Timeline) -> Self {
        Self {
            name: name.into(),
            delay,
            timeline: timeline.clone(),
        }
    }
}

impl Invocable for TimedUnit {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, _invocation: Invocation, ctx: UnitContext) -> BoxFuture<'_, Result<UnitOutcome>> {
        Box::pin(async move {
            let start = Instant::now();
            tokio::time::sleep(self.delay).await;
            let end = Instant::now();
            self.timeline.record(ctx.node_id.as_str(), Span { start, end });
            Ok(UnitOutcome::success(format!("{} done", ctx.node_id)))
        })
    }
}

/// Units that hand off along a fixed chain of ids; the last one completes.
pub struct HandoffChain {
    ids: Vec<String>,
}

impl HandoffChain {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
        }
    }

    /// `(id, unit)` pairs in chain order.
    pub fn units(&self) -> Vec<(String, Arc<dyn Invocable>)> {
        self.ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let unit: Arc<dyn Invocable> = match self.ids.get(i + 1) {
                    Some(next) => Arc::new(MockUnit::handing_off(id.as_str(), next)),
                    None => Arc::new(MockUnit::completing(id.as_str(), format!("{} finished", id))),
                };
                (id.clone(), unit)
            })
            .collect()
    }
}

/// Write `content` to a temporary `.toml` file.
pub fn temp_toml(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("create temp file");
    file.write_all(content.as_bytes()).expect("write temp file");
    file
}

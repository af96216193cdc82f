use regex::Regex;
use serde_json::Value;

use maestro_core::error::{MaestroError, Result};
use maestro_core::types::{value_text, HandoffSignal, NodeId};

/// Turns a swarm unit's raw output into a control signal.
///
/// The coordinator checks the target against the registered nodes; parsers only decide
/// whether the output asks for a handoff at all.
pub trait HandoffParser: Send + Sync + 'static {
    fn parse(&self, output: &Value) -> Result<HandoffSignal>;
}

/// Reads the structured form `{"signal": "handoff", "target": ..., "payload": ...}` or
/// `{"signal": "complete", "output": ...}`, either as a JSON object or as a string holding one.
/// Any other output completes the run with that output.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuredParser;

impl HandoffParser for StructuredParser {
    fn parse(&self, output: &Value) -> Result<HandoffSignal> {
        let embedded;
        let candidate = match output {
            Value::Object(map) if map.contains_key("signal") => output,
            Value::String(s) if s.trim_start().starts_with('{') => {
                match serde_json::from_str::<Value>(s.trim()) {
                    Ok(v) if v.get("signal").is_some() => {
                        embedded = v;
                        &embedded
                    }
                    _ => return Ok(HandoffSignal::complete(output.clone())),
                }
            }
            _ => return Ok(HandoffSignal::complete(output.clone())),
        };

        serde_json::from_value(candidate.clone())
            .map_err(|e| MaestroError::Routing(format!("malformed handoff signal: {}", e)))
    }
}

/// Finds a sentinel phrase in free text, for units that cannot emit structured output.
///
/// The pattern must have a named group `target`. A match hands off to that node with the
/// full text as payload; no match completes the run with the text.
#[derive(Debug, Clone)]
pub struct SentinelParser {
    pattern: Regex,
}

impl SentinelParser {
    pub const DEFAULT_PATTERN: &'static str = r"(?m)^\s*HANDOFF:\s*(?P<target>[A-Za-z0-9_\-]+)\s*$";

    pub fn new(pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| MaestroError::Validation(format!("bad sentinel pattern: {}", e)))?;
        if !pattern.capture_names().any(|name| name == Some("target")) {
            return Err(MaestroError::Validation(
                "sentinel pattern needs a named group `target`".into(),
            ));
        }
        Ok(Self { pattern })
    }
}

impl Default for SentinelParser {
    fn default() -> Self {
        Self {
            pattern: Regex::new(Self::DEFAULT_PATTERN).expect("default sentinel pattern is valid"),
        }
    }
}

impl HandoffParser for SentinelParser {
    fn parse(&self, output: &Value) -> Result<HandoffSignal> {
        let text = value_text(output);
        match self
            .pattern
            .captures(&text)
            .and_then(|caps| caps.name("target"))
        {
            Some(target) => Ok(HandoffSignal::handoff(
                NodeId::from(target.as_str()),
                Value::String(text.clone()),
            )),
            None => Ok(HandoffSignal::complete(output.clone())),
        }
    }
}

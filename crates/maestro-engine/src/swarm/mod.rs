//! Swarm model: peers passing a single baton through runtime-chosen handoffs.

mod coordinator;
mod signal;

pub use coordinator::{Swarm, SwarmBuilder, SwarmResult};
pub use signal::{HandoffParser, SentinelParser, StructuredParser};

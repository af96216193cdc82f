//! Maestro orchestration engine.
//!
//! Two ways to coordinate units that implement [`Invocable`](maestro_core::Invocable):
//!
//! - [`Graph`]: a declared topology, run with concurrent dispatch, conditional edges,
//!   configurable joins and bounded cycles.
//! - [`Swarm`]: peers passing control through handoffs chosen at runtime, one at a time.
//!
//! Both are themselves `Invocable`, so either can be a node inside the other. [`Workflow`]
//! compiles a declarative task list into a `Graph`, and [`Topology`] loads any of them from TOML.

pub mod graph;
pub mod invoke;
pub mod node;
pub mod swarm;
pub mod topology;
pub mod units;
pub mod workflow;

pub use graph::{Condition, Edge, Graph, GraphBuilder, GraphResult};
pub use invoke::invoke_unit;
pub use node::{FailedUpstream, JoinMode, JoinPolicy, Node, NodeOptions};
pub use swarm::{HandoffParser, SentinelParser, StructuredParser, Swarm, SwarmBuilder, SwarmResult};
pub use topology::{BuildContext, Topology};
pub use units::{EchoUnit, FailingUnit, FnUnit, ScriptStep, ScriptedUnit, StaticUnit};
pub use workflow::{TaskSpec, Workflow};

//! Graph model: a declared topology of nodes and conditional edges.
//!
//! Every ready node is dispatched concurrently (bounded by `max_concurrency`). A node is ready
//! once all of its incoming edges are resolved and at least one is active, or as soon as one is
//! active under an `any` join. Nodes no active path can reach are skipped, and the skip
//! propagates downstream. Cycles are allowed when `max_node_executions` bounds re-entry; an edge
//! into a node that reached the bound resolves inactive.

mod builder;
mod condition;
mod edge;
mod executor;

pub use builder::GraphBuilder;
pub use condition::{Condition, ConditionMemo, Expression, PredicateFn};
pub use edge::Edge;
pub use executor::{Graph, GraphResult};

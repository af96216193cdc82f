pub mod config;
pub mod error;
pub mod event;
pub mod state;
pub mod traits;
pub mod types;

pub use config::{GraphConfig, MaestroConfig, SwarmConfig};
pub use error::{MaestroError, Result};
pub use event::{EventBus, OrchestrationEvent};
pub use state::{ExecutionState, HistoryEvent};
pub use traits::{Invocable, UnitContext};
pub use types::*;

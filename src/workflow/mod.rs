pub mod builder;
pub mod capability;
pub mod events;
pub mod executor;
pub mod gate;
pub mod types;

pub use builder::WorkflowBuilder;
pub use capability::{CapabilityExecutor, CapabilityRequest, CapabilityResult, RpcCapabilityExecutor};
pub use events::{EventBus, EventCategory, PhaseEvent, Subscription};
pub use executor::{ExecutorConfig, PendingApproval, SubWorkflowMode, WorkflowExecutor};
pub use gate::{AutoPassGate, GateDecision, GateEvaluator};
pub use types::*;

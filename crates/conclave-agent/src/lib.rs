pub mod agent;
pub mod registry;
pub mod role;

pub use agent::Agent;
pub use registry::{ToolDefinition, ToolRegistry};
pub use role::{AgentRole, Capability};

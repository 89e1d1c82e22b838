pub mod integration;
pub mod orchestrator;
pub mod queue;
pub mod task;

pub use integration::{AgentStateAdapter, StateSync, SystemStateAdapter};
pub use orchestrator::Orchestrator;
pub use queue::{ReadyQueue, Slot, SlotPool};
pub use task::{Task, TaskPriority, TaskSpec, TaskStatus};

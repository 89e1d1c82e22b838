pub mod edge;
pub mod execution;
pub mod executor;
pub mod graph;
pub mod node;

pub use edge::Edge;
pub use execution::{Execution, ExecutionStatus};
pub use executor::Executor;
pub use graph::{Graph, ResultObserver};
pub use node::{Node, NodeType};

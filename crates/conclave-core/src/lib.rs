pub mod config;
pub mod error;
pub mod event;
pub mod handler;
pub mod state;
pub mod traits;
pub mod types;

pub use config::ConclaveConfig;
pub use error::{ConclaveError, Result};
pub use event::EventBus;
pub use handler::{FnProcessor, Handler};
pub use state::{MemoryStateStore, StateKey};
pub use types::*;

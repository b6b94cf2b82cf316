pub mod config;
pub mod events;
pub mod extract;
pub mod prompt;
pub mod retry;
pub mod types;

pub use config::{Config, GitConfig};
pub use events::AgentEvent;
pub use retry::RetryPolicy;
pub use types::*;

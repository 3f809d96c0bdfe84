// Library crate - feed decoding, signal fusion and bracket execution

pub mod types;
pub mod feed;
pub mod history;
pub mod strategy;
pub mod execution;
pub mod broker;
pub mod config;
pub mod pipeline;

// Re-export commonly used types
pub use types::*;
pub use config::{Settings, SharedSettings};
pub use pipeline::{AppContext, TickRouter};

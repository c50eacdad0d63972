pub mod config;
pub mod types;

pub use config::GridConfig;
pub use types::*;

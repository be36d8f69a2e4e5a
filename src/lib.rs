pub mod audio;
pub mod config;
pub mod error;
pub mod scheduler;

pub use config::EngineConfig;
pub use error::{LoadError, MixError, MixResult};

pub mod application;
pub mod callbacks;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod engine;
pub mod external;
pub mod matching;
pub mod merge;
pub mod store;
pub mod tasks;
pub mod types;
pub mod workflows;

// Re-export main types
pub use types::*;

// Re-export init API for convenience
pub use application::{initialize, Application, InitBuilder, InitOptions};

// ABOUTME: Configuration and environment variable management for envforge
// ABOUTME: Re-exports variable names, env parsing helpers and engine settings

pub mod constants;
pub mod env;
pub mod settings;

pub use settings::{ConfigError, EngineSettings, Result};

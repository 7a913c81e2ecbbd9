//! Layered relay configuration.
//!
//! 1. **Compiled defaults**: [`ServerConfig::default()`](lanrelay_server::ServerConfig)
//! 2. **Config file**: `--config <path>`, deep-merged over defaults
//! 3. **Environment variables**: `LANRELAY_*` overrides
//!
//! CLI flags are applied by the caller on top of the result.

pub mod errors;
pub mod loader;

pub use loader::load_config;

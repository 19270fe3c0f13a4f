//! Configuration Module
//!
//! Every process role reads the same TOML document; CLI flags override
//! individual values after loading.
//!
//! ## Loading Order
//!
//! 1. `PHASECAST_CONFIG` environment variable (path to TOML file)
//! 2. `phasecast.toml` in the current working directory
//! 3. Built-in defaults (see `defaults`)
//!
//! ```ignore
//! let config = PhasecastConfig::load()?;
//! config.validate()?;
//! ```

pub mod defaults;
mod phasecast_config;
pub mod validation;

pub use phasecast_config::*;

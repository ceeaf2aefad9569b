//! RingNode - overlay simulator
//!
//! Configuration loading and the simulation driver behind the `ringnode`
//! binary.

pub mod config;
pub mod sim;

pub use config::{Config, LoggingConfig, SimulationConfig};
pub use sim::{run, LookupRound, SimulationReport};

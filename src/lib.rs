//! Evolver - personal task agent with a gated, snapshot-protected
//! self-evolution loop

pub mod analysis;
pub mod commands;
pub mod config;
pub mod error;
pub mod evolution;
pub mod lease;
pub mod notify;
pub mod processor;
pub mod ralph;
pub mod safety;
pub mod service;
pub mod snapshot;
pub mod store;
pub mod subprocess;
pub mod telemetry;
pub mod template;

//! dbtunnel core library
//!
//! Resolves a KubeDB database object to the pod that should serve a session,
//! electing the primary for replicated topologies, then runs the engine's
//! client over a local tunnel into that pod.

pub mod cluster;
pub mod config;
pub mod credential;
pub mod database;
pub mod engine;
pub mod error;
pub mod probe;
pub mod process;
pub mod session;
pub mod topology;
pub mod tunnel;
pub mod workflow;

pub use error::{Error, Result};

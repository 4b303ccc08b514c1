//! Core library for the worker agent
//!
//! This crate contains the pieces shared by every other crate:
//! - Task and execution configuration model
//! - Worker capabilities and stable identity
//! - Environment-driven agent configuration
//! - The typed control-plane HTTP client

pub mod capabilities;
pub mod client;
pub mod config;
pub mod error;
pub mod task;

pub use capabilities::{RuntimeInfo, RuntimeMap, WorkerCapabilities};
pub use client::{ControlPlane, ControlPlaneClient, OutputSink};
pub use config::AgentConfig;
pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

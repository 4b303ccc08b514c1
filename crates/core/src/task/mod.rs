//! Task module
//!
//! Tasks as received from the control plane, their execution configuration,
//! and the result produced by running one.

mod execution_config;
mod model;

pub use execution_config::ExecutionConfig;
pub use model::*;

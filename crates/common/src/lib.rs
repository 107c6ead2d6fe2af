//! lmshim common library
//!
//! This crate contains the error type, configuration and metrics shared by
//! the predictor library and its binary.

pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use config::PredictorConfig;
pub use error::{LmShimError, Result};
pub use metrics::{LatencyTimer, MetricsRegistry, METRICS};

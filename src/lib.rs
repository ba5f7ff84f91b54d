#![warn(missing_docs)]

//! Train a small convolutional network on MNIST with burn, checkpoint every
//! epoch and resume from the last committed checkpoint.

#[macro_use]
extern crate derive_new;

/// Checkpoint persistence.
pub mod checkpoint;

/// Run configuration loaded from YAML.
pub mod config;

/// MNIST batching and data loaders.
pub mod data;

/// Error types shared by the training loop.
pub mod error;

/// Application logger installation.
pub mod logger;

/// Loss functions.
pub mod loss;

/// Metric log recorded during training.
pub mod metrics;

/// The convolutional network.
pub mod model;

/// Metric reporting backends.
pub mod reporter;

/// The training loop controller.
pub mod training;

pub use checkpoint::{CheckpointError, CheckpointManifest, FileCheckpointer};
pub use config::{ConfigError, RunConfig};
pub use error::TrainingError;
pub use metrics::MetricLog;
pub use training::{EvaluationSummary, SessionState, TrainingSession};

#[cfg(test)]
pub(crate) type TestBackend = burn::backend::NdArray<f32>;

#[cfg(test)]
pub(crate) type TestAutodiffBackend = burn::backend::Autodiff<TestBackend>;

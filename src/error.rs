use crate::{
    checkpoint::CheckpointError, config::ConfigError, logger::LoggerError, reporter::ReportError,
};

/// Any error that aborts a training run.
#[derive(thiserror::Error, Debug)]
pub enum TrainingError {
    /// The run configuration is unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A checkpoint could not be saved or restored.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    /// Metrics could not be reported.
    #[error(transparent)]
    Report(#[from] ReportError),

    /// The application logger could not be installed.
    #[error(transparent)]
    Logger(#[from] LoggerError),
}

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::model::ConvNetConfig;

/// Errors raised while reading the run configuration.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("Unable to read config file '{}': {source}", path.display())]
    Io {
        /// Path of the config file.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The content is not a valid run configuration.
    #[error("Invalid config format: {0}")]
    InvalidFormat(#[from] serde_yaml::Error),
}

/// Hyperparameters and paths of a training run.
///
/// Only `n_epochs`, `batch_size_train`, `batch_size_test` and `lr` are required
/// in the YAML file, every other key falls back to its default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Number of epochs of a fresh run.
    pub n_epochs: usize,
    /// Batch size of the training loader.
    pub batch_size_train: usize,
    /// Batch size of the evaluation loader.
    pub batch_size_test: usize,
    /// SGD learning rate.
    pub lr: f64,
    /// SGD momentum.
    #[serde(default = "default_momentum")]
    pub momentum: f64,
    /// A training loss is recorded every `log_interval` batches.
    #[serde(default = "default_log_interval")]
    pub log_interval: usize,
    /// Seed of the backend RNG and of the training shuffle.
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Number of data loader workers.
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    /// Directory holding checkpoints, metrics and the experiment log.
    #[serde(default = "default_datapath")]
    pub datapath: PathBuf,
    /// Name of the model artifact inside a checkpoint.
    #[serde(default = "default_model_name")]
    pub model_name: String,
    /// Dropout probability of the model.
    #[serde(default = "default_dropout")]
    pub dropout: f64,
    /// Width of the hidden fully connected layer.
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
}

fn default_momentum() -> f64 {
    0.5
}

fn default_log_interval() -> usize {
    100
}

fn default_seed() -> u64 {
    42
}

fn default_num_workers() -> usize {
    1
}

fn default_dropout() -> f64 {
    0.5
}

fn default_hidden_size() -> usize {
    50
}

fn default_datapath() -> PathBuf {
    PathBuf::from("data")
}

fn default_model_name() -> String {
    "mnist".to_string()
}

impl RunConfig {
    /// Create a config with the required values, every other field takes its default.
    pub fn new(
        n_epochs: usize,
        batch_size_train: usize,
        batch_size_test: usize,
        lr: f64,
    ) -> Self {
        Self {
            n_epochs,
            batch_size_train,
            batch_size_test,
            lr,
            momentum: default_momentum(),
            log_interval: default_log_interval(),
            seed: default_seed(),
            num_workers: default_num_workers(),
            datapath: default_datapath(),
            model_name: default_model_name(),
            dropout: default_dropout(),
            hidden_size: default_hidden_size(),
        }
    }

    /// The model configuration of this run.
    pub fn model_config(&self) -> ConvNetConfig {
        ConvNetConfig::new()
            .with_dropout(self.dropout)
            .with_hidden_size(self.hidden_size)
    }

    /// Load the configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        Self::from_yaml(&content)
    }

    /// Parse the configuration from a YAML string.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Save the configuration as YAML.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)?;

        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Set the data path.
    pub fn with_datapath<P: Into<PathBuf>>(mut self, datapath: P) -> Self {
        self.datapath = datapath.into();
        self
    }

    /// Set the log interval.
    pub fn with_log_interval(mut self, log_interval: usize) -> Self {
        self.log_interval = log_interval;
        self
    }

    /// Set the seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the width of the hidden layer.
    pub fn with_hidden_size(mut self, hidden_size: usize) -> Self {
        self.hidden_size = hidden_size;
        self
    }

    /// Set the number of data loader workers.
    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }
}

use serde::{Deserialize, Serialize};

/// A training loss sampled during an epoch.
#[derive(new, Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainLossEntry {
    /// Number of training examples seen before the sampled batch, counted from the first epoch.
    pub step: usize,
    /// Mean loss of the sampled batch.
    pub loss: f64,
}

/// The mean loss of one evaluation pass.
#[derive(new, Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TestLossEntry {
    /// Number of training examples seen when the evaluation ran.
    pub examples_seen: usize,
    /// Mean loss over the evaluation set.
    pub loss: f64,
}

/// Losses recorded by the training loop.
///
/// The log only accumulates; rendering is left to a
/// [reporter](crate::reporter::MetricsReporter).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricLog {
    train: Vec<TrainLossEntry>,
    test: Vec<TestLossEntry>,
}

impl MetricLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a training loss.
    pub fn record_train(&mut self, step: usize, loss: f64) {
        self.train.push(TrainLossEntry::new(step, loss));
    }

    /// Append an evaluation loss.
    pub fn record_test(&mut self, examples_seen: usize, loss: f64) {
        self.test.push(TestLossEntry::new(examples_seen, loss));
    }

    /// Training losses in recording order.
    pub fn train(&self) -> &[TrainLossEntry] {
        &self.train
    }

    /// Evaluation losses in recording order.
    pub fn test(&self) -> &[TestLossEntry] {
        &self.test
    }

    /// The most recent evaluation loss.
    pub fn last_test(&self) -> Option<&TestLossEntry> {
        self.test.last()
    }

    /// The evaluation with the lowest loss.
    pub fn best_test(&self) -> Option<&TestLossEntry> {
        self.test.iter().min_by(|a, b| a.loss.total_cmp(&b.loss))
    }
}

/// Step index of a training loss sample.
///
/// `batch_index` is 0-based, `epoch` is 1-based and `num_items` is the size of the
/// training set.
pub fn train_step_index(
    epoch: usize,
    batch_index: usize,
    batch_size: usize,
    num_items: usize,
) -> usize {
    batch_index * batch_size + epoch.saturating_sub(1) * num_items
}

/// Whether the batch at `batch_index` is sampled into the log.
pub fn should_log(batch_index: usize, log_interval: usize) -> bool {
    log_interval > 0 && batch_index % log_interval == 0
}

use std::{ops::Range, time::Instant};

use burn::{
    data::dataset::{
        vision::{MnistDataset, MnistItem},
        Dataset,
    },
    module::AutodiffModule,
    nn::loss::Reduction,
    optim::{
        adaptor::OptimizerAdaptor, momentum::MomentumConfig, GradientsParams, Optimizer, Sgd,
        SgdConfig,
    },
    prelude::*,
    tensor::backend::AutodiffBackend,
};

use crate::{
    checkpoint::{
        load_compatible, Checkpoint, CheckpointError, CheckpointManifest, FileCheckpointer,
    },
    config::RunConfig,
    data::{self, MnistBatch, MnistLoader},
    error::TrainingError,
    loss::{correct_predictions, NllLoss},
    metrics::{should_log, train_step_index, MetricLog},
    model::ConvNet,
};

/// SGD with momentum over the [ConvNet] parameters.
pub type ConvNetOptimizer<B> =
    OptimizerAdaptor<Sgd<<B as AutodiffBackend>::InnerBackend>, ConvNet<B>, B>;

type ModelRecord<B> = <ConvNet<B> as Module<B>>::Record;
type OptimizerRecord<B> = <ConvNetOptimizer<B> as Optimizer<ConvNet<B>, B>>::Record;

/// Lifecycle of a [training session](TrainingSession).
///
/// `Created -> Evaluated(0) -> {Training(i) -> Evaluated(i) -> Checkpointed(i)}* -> Done`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing ran yet.
    Created,
    /// An epoch is being trained.
    Training {
        /// The 1-based epoch.
        epoch: usize,
    },
    /// The model was evaluated after `epoch` completed epochs.
    Evaluated {
        /// Completed epochs, 0 for the initial evaluation.
        epoch: usize,
    },
    /// The checkpoint of `epoch` was committed.
    Checkpointed {
        /// The 1-based epoch.
        epoch: usize,
    },
    /// The requested epochs are all done.
    Done,
}

/// Result of one pass over the evaluation set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvaluationSummary {
    /// Loss summed over every evaluation item.
    pub loss_sum: f64,
    /// `loss_sum` divided by `total`.
    pub mean_loss: f64,
    /// Number of correct top-1 predictions.
    pub correct: usize,
    /// Number of evaluation items.
    pub total: usize,
}

impl EvaluationSummary {
    fn new(loss_sum: f64, correct: usize, total: usize) -> Self {
        let mean_loss = if total == 0 {
            0.0
        } else {
            loss_sum / total as f64
        };

        Self {
            loss_sum,
            mean_loss,
            correct,
            total,
        }
    }

    /// Percentage of correct predictions.
    pub fn accuracy(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        100.0 * self.correct as f64 / self.total as f64
    }
}

/// Everything a training run needs: device, hyperparameters, model, optimizer,
/// data loaders, metric log and checkpointer.
///
/// The model trains on the autodiff backend `B`; evaluation runs on a
/// [valid](AutodiffModule::valid) copy on the inner backend, with dropout disabled.
pub struct TrainingSession<B: AutodiffBackend> {
    config: RunConfig,
    device: B::Device,
    model: ConvNet<B>,
    optim: ConvNetOptimizer<B>,
    loss: NllLoss,
    train_loader: MnistLoader<B>,
    test_loader: MnistLoader<B::InnerBackend>,
    checkpointer: FileCheckpointer,
    metrics: MetricLog,
    state: SessionState,
    epochs_completed: usize,
}

impl<B: AutodiffBackend> TrainingSession<B> {
    /// Create a session training on the MNIST train split and evaluating on the test split.
    ///
    /// The dataset is downloaded on first use and cached in burn's dataset cache
    /// directory, not under `config.datapath`, which only receives checkpoints,
    /// metrics and the experiment log. Use [new](Self::new) to train on items
    /// loaded from elsewhere.
    pub fn mnist(config: RunConfig, device: B::Device) -> Self {
        Self::new(config, device, MnistDataset::train(), MnistDataset::test())
    }

    /// Create a session over the given datasets.
    pub fn new<DT, DV>(config: RunConfig, device: B::Device, train: DT, test: DV) -> Self
    where
        DT: Dataset<MnistItem> + 'static,
        DV: Dataset<MnistItem> + 'static,
    {
        B::seed(config.seed);

        let model = config.model_config().init::<B>(&device);
        let optim = optimizer_config(&config).init::<B, ConvNet<B>>();
        let train_loader = data::train_loader::<B, _>(train, &config, &device);
        let test_loader = data::test_loader::<B::InnerBackend, _>(test, &config, &device);
        let checkpointer = FileCheckpointer::new(&config.datapath, &config.model_name);

        log::info!(
            "Session created: {} training items, {} evaluation items, device {:?}",
            train_loader.num_items(),
            test_loader.num_items(),
            device
        );

        Self {
            config,
            device,
            model,
            optim,
            loss: NllLoss::new(),
            train_loader,
            test_loader,
            checkpointer,
            metrics: MetricLog::new(),
            state: SessionState::Created,
            epochs_completed: 0,
        }
    }

    /// Fresh run: evaluate the untrained model, then train every configured epoch.
    pub fn fit(&mut self) -> Result<(), TrainingError> {
        self.evaluate();
        self.run_epochs(1..self.config.n_epochs + 1)
    }

    /// Train one epoch, then evaluate and checkpoint.
    ///
    /// `epoch` is 1-based.
    pub fn run_epoch(&mut self, epoch: usize) -> Result<EvaluationSummary, TrainingError> {
        self.state = SessionState::Training { epoch };

        let start = Instant::now();
        let batch_size = self.config.batch_size_train;
        let num_items = self.train_loader.num_items();
        let num_batches = num_items.div_ceil(batch_size);

        for (batch_index, batch) in self.train_loader.iter().enumerate() {
            let batch_len = batch.len();
            let output = self.model.forward(batch.images);
            let loss = self.loss.forward(output, batch.targets, Reduction::Mean);

            let logged_loss = should_log(batch_index, self.config.log_interval)
                .then(|| loss.clone().into_scalar().elem::<f64>());

            // Gradients are produced fresh by every backward pass.
            let grads = GradientsParams::from_grads(loss.backward(), &self.model);
            self.model = self.optim.step(self.config.lr, self.model.clone(), grads);

            if let Some(loss) = logged_loss {
                let step = train_step_index(epoch, batch_index, batch_size, num_items);
                self.metrics.record_train(step, loss);

                log::info!(
                    "Train Epoch: {} [{}/{} ({:.0}%)]\tLoss: {:.6}",
                    epoch,
                    batch_index * batch_len,
                    num_items,
                    100.0 * batch_index as f64 / num_batches as f64,
                    loss
                );
            }
        }

        self.epochs_completed = epoch;
        log::info!(
            "Epoch {epoch} trained in {:.1}s",
            start.elapsed().as_secs_f64()
        );

        let summary = self.evaluate();
        self.checkpoint(epoch)?;

        Ok(summary)
    }

    /// Evaluate the model on the whole evaluation set and record the mean loss.
    ///
    /// The model parameters are left untouched.
    pub fn evaluate(&mut self) -> EvaluationSummary {
        let summary = self.evaluation_pass();
        let examples_seen = self.epochs_completed * self.train_loader.num_items();
        self.metrics.record_test(examples_seen, summary.mean_loss);

        log::info!(
            "Test set: Avg. loss: {:.4}, Accuracy: {}/{} ({:.0}%)",
            summary.mean_loss,
            summary.correct,
            summary.total,
            summary.accuracy()
        );

        self.state = SessionState::Evaluated {
            epoch: self.epochs_completed,
        };
        summary
    }

    fn evaluation_pass(&self) -> EvaluationSummary {
        let model = self.model.valid();
        let mut loss_sum = 0.0;
        let mut correct = 0;

        for batch in self.test_loader.iter() {
            let output = model.forward(batch.images);
            loss_sum += self
                .loss
                .forward(output.clone(), batch.targets.clone(), Reduction::Sum)
                .into_scalar()
                .elem::<f64>();
            correct += correct_predictions(output, batch.targets);
        }

        EvaluationSummary::new(loss_sum, correct, self.test_loader.num_items())
    }

    /// Save the model and optimizer state as the checkpoint of `epoch`.
    pub fn checkpoint(&mut self, epoch: usize) -> Result<CheckpointManifest, CheckpointError> {
        let manifest = self.checkpointer.save::<B, _, _>(
            epoch,
            self.model.clone().into_record(),
            self.optim.to_record(),
        )?;

        self.state = SessionState::Checkpointed { epoch };
        Ok(manifest)
    }

    /// Replace the model and optimizer with fresh instances loaded from the committed checkpoint.
    ///
    /// Fails without touching the session when the checkpoint cannot be read or when its
    /// parameters do not fit the configured model.
    pub fn restore(&mut self) -> Result<CheckpointManifest, CheckpointError> {
        let checkpoint: Checkpoint<ModelRecord<B>, OptimizerRecord<B>> =
            self.checkpointer.restore::<B, _, _>(&self.device)?;

        let model = self.config.model_config().init::<B>(&self.device);
        self.model = load_compatible::<B, _>(model, checkpoint.model)?;
        self.optim = optimizer_config(&self.config)
            .init::<B, ConvNet<B>>()
            .load_record(checkpoint.optimizer);
        self.epochs_completed = checkpoint.manifest.epoch;

        Ok(checkpoint.manifest)
    }

    /// Continue training after the last checkpointed epoch, up to `end_epoch` (exclusive).
    ///
    /// Returns the epochs that were run.
    pub fn resume(&mut self, end_epoch: usize) -> Result<Range<usize>, TrainingError> {
        let manifest = self.restore()?;
        let epochs = manifest.epoch + 1..end_epoch;

        log::info!("Resuming epochs {epochs:?}");
        self.run_epochs(epochs.clone())?;

        Ok(epochs)
    }

    /// Restore the checkpoint, then train the epochs `start_epoch..end_epoch`.
    ///
    /// The range is trusted: a `start_epoch` that does not follow the checkpointed
    /// epoch is only reported, so epochs may be repeated or skipped.
    pub fn resume_range(
        &mut self,
        start_epoch: usize,
        end_epoch: usize,
    ) -> Result<Range<usize>, TrainingError> {
        let manifest = self.restore()?;

        if start_epoch != manifest.epoch + 1 {
            log::warn!(
                "Resuming at epoch {start_epoch} from a checkpoint saved after epoch {}",
                manifest.epoch
            );
        }
        self.epochs_completed = start_epoch.saturating_sub(1);

        let epochs = start_epoch..end_epoch;
        log::info!("Resuming epochs {epochs:?}");
        self.run_epochs(epochs.clone())?;

        Ok(epochs)
    }

    fn run_epochs(&mut self, epochs: Range<usize>) -> Result<(), TrainingError> {
        for epoch in epochs {
            self.run_epoch(epoch)?;
        }

        self.state = SessionState::Done;
        Ok(())
    }

    /// The first evaluation batch, in evaluation order.
    pub fn example_batch(&self) -> Option<MnistBatch<B::InnerBackend>> {
        self.test_loader.iter().next()
    }

    /// Losses recorded so far.
    pub fn metrics(&self) -> &MetricLog {
        &self.metrics
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Number of epochs the model has been trained for.
    pub fn epochs_completed(&self) -> usize {
        self.epochs_completed
    }

    /// The run configuration.
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// The model being trained.
    pub fn model(&self) -> &ConvNet<B> {
        &self.model
    }

    /// The checkpointer of this session.
    pub fn checkpointer(&self) -> &FileCheckpointer {
        &self.checkpointer
    }
}

fn optimizer_config(config: &RunConfig) -> SgdConfig {
    let momentum = MomentumConfig::new()
        .with_momentum(config.momentum)
        .with_dampening(0.0);

    SgdConfig::new().with_momentum(Some(momentum))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{checkpoint::CheckpointError, TestAutodiffBackend};
    use burn::data::dataset::InMemDataset;
    use std::path::Path;

    const TRAIN_ITEMS: usize = 40;
    const TEST_ITEMS: usize = 20;
    const BATCH_SIZE: usize = 8;

    /// Class `c` lights up rows `2c` and `2c + 1`.
    fn items(count: usize) -> InMemDataset<MnistItem> {
        let items = (0..count)
            .map(|index| {
                let label = (index % 10) as u8;
                let mut image = [[0.0; 28]; 28];
                for row in image.iter_mut().skip(2 * label as usize).take(2) {
                    row.fill(255.0);
                }
                MnistItem { image, label }
            })
            .collect();

        InMemDataset::new(items)
    }

    fn config(datapath: &Path) -> RunConfig {
        RunConfig::new(2, BATCH_SIZE, 10, 0.01)
            .with_datapath(datapath)
            .with_log_interval(2)
            .with_num_workers(1)
    }

    fn session(config: RunConfig) -> TrainingSession<TestAutodiffBackend> {
        TrainingSession::new(
            config,
            Default::default(),
            items(TRAIN_ITEMS),
            items(TEST_ITEMS),
        )
    }

    #[test]
    fn run_epoch_records_one_test_loss_and_one_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(config(dir.path()));

        session.run_epoch(1).unwrap();
        assert_eq!(session.metrics().test().len(), 1);
        assert_eq!(session.state(), SessionState::Checkpointed { epoch: 1 });
        let manifest = session.checkpointer().latest().unwrap().unwrap();
        assert_eq!((manifest.generation, manifest.epoch), (1, 1));

        session.run_epoch(2).unwrap();
        assert_eq!(session.metrics().test().len(), 2);
        let manifest = session.checkpointer().latest().unwrap().unwrap();
        assert_eq!((manifest.generation, manifest.epoch), (2, 2));
    }

    #[test]
    fn train_losses_follow_the_log_interval_and_step_formula() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(config(dir.path()));

        session.run_epoch(1).unwrap();
        session.run_epoch(2).unwrap();

        // 5 batches per epoch, sampled at batch 0, 2 and 4.
        let steps: Vec<usize> = session.metrics().train().iter().map(|entry| entry.step).collect();
        assert_eq!(steps, vec![0, 16, 32, 40, 56, 72]);
        assert!(session
            .metrics()
            .train()
            .iter()
            .all(|entry| entry.loss.is_finite()));
    }

    #[test]
    fn evaluate_does_not_change_the_model() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(config(dir.path()));
        session.run_epoch(1).unwrap();

        let first = session.evaluate();
        let second = session.evaluate();

        assert_eq!(first.loss_sum, second.loss_sum);
        assert_eq!(first.correct, second.correct);
        assert_eq!(first.total, TEST_ITEMS);
        assert_eq!(session.metrics().test().len(), 3);
    }

    #[test]
    fn evaluate_before_training_is_recorded_at_zero_examples() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(config(dir.path()));

        let summary = session.evaluate();

        assert_eq!(summary.total, TEST_ITEMS);
        assert_eq!(session.metrics().test()[0].examples_seen, 0);
        assert_eq!(session.state(), SessionState::Evaluated { epoch: 0 });
        assert!(session.checkpointer().latest().unwrap().is_none());
    }

    #[test]
    fn restored_checkpoint_evaluates_identically() {
        let dir = tempfile::tempdir().unwrap();
        let mut trained = session(config(dir.path()));
        trained.run_epoch(1).unwrap();
        let expected = trained.evaluate();

        let mut restored = session(config(dir.path()).with_seed(7));
        let manifest = restored.restore().unwrap();
        let actual = restored.evaluate();

        assert_eq!(manifest.epoch, 1);
        assert_eq!(actual.loss_sum, expected.loss_sum);
        assert_eq!(actual.correct, expected.correct);
    }

    #[test]
    fn fit_evaluates_first_then_every_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(config(dir.path()));

        session.fit().unwrap();

        let seen: Vec<usize> = session
            .metrics()
            .test()
            .iter()
            .map(|entry| entry.examples_seen)
            .collect();
        assert_eq!(seen, vec![0, TRAIN_ITEMS, 2 * TRAIN_ITEMS]);
        assert_eq!(session.state(), SessionState::Done);
        assert_eq!(session.epochs_completed(), 2);
    }

    #[test]
    fn resume_range_runs_every_requested_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = session(RunConfig {
            n_epochs: 3,
            ..config(dir.path())
        });
        first.fit().unwrap();

        let mut resumed = session(config(dir.path()));
        let epochs = resumed.resume_range(4, 9).unwrap();

        assert_eq!(epochs, 4..9);
        assert_eq!(resumed.metrics().test().len(), 5);
        assert_eq!(resumed.metrics().test()[0].examples_seen, 4 * TRAIN_ITEMS);
        let manifest = resumed.checkpointer().latest().unwrap().unwrap();
        assert_eq!((manifest.generation, manifest.epoch), (8, 8));
        assert_eq!(resumed.state(), SessionState::Done);
    }

    #[test]
    fn resume_starts_after_the_checkpointed_epoch() {
        let dir = tempfile::tempdir().unwrap();
        session(config(dir.path())).fit().unwrap();

        let mut resumed = session(config(dir.path()));
        let epochs = resumed.resume(4).unwrap();

        assert_eq!(epochs, 3..4);
        assert_eq!(resumed.epochs_completed(), 3);
        assert_eq!(resumed.checkpointer().latest().unwrap().unwrap().epoch, 3);
    }

    #[test]
    fn resume_without_checkpoint_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(config(dir.path()));

        let result = session.resume(3);

        assert!(matches!(
            result,
            Err(TrainingError::Checkpoint(CheckpointError::NotFound(_)))
        ));
        assert_eq!(session.state(), SessionState::Created);
    }

    #[test]
    fn restore_rejects_a_checkpoint_of_another_model_shape() {
        let dir = tempfile::tempdir().unwrap();
        session(config(dir.path())).run_epoch(1).unwrap();

        let mut narrower = session(config(dir.path()).with_hidden_size(20));
        let result = narrower.resume(3);

        assert!(matches!(
            result,
            Err(TrainingError::Checkpoint(CheckpointError::Incompatible { .. }))
        ));
        assert_eq!(narrower.epochs_completed(), 0);
        assert_eq!(narrower.state(), SessionState::Created);
    }

    #[test]
    fn example_batch_is_the_first_evaluation_batch() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(config(dir.path()));

        let batch = session.example_batch().unwrap();

        assert_eq!(batch.len(), 10);
        let labels = batch.targets.into_data().to_vec::<i64>().unwrap();
        assert_eq!(labels, (0..10).collect::<Vec<i64>>());
    }
}

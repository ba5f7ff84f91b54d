use burn::{
    backend::{Autodiff, NdArray},
    data::dataset::{vision::MnistItem, InMemDataset},
};
use mnist_runner::{
    reporter::{FileMetricsReporter, MetricsReporter},
    RunConfig, SessionState, TrainingSession,
};

type Backend = Autodiff<NdArray<f32>>;

fn dataset(count: usize) -> InMemDataset<MnistItem> {
    let items = (0..count)
        .map(|index| {
            let label = (index % 10) as u8;
            let mut image = [[0.0; 28]; 28];
            image[2 * label as usize].fill(255.0);
            MnistItem { image, label }
        })
        .collect();

    InMemDataset::new(items)
}

#[test]
fn config_file_drives_a_run_that_can_be_resumed_and_reported() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("config.yaml");
    std::fs::write(
        &config_path,
        format!(
            "n_epochs: 1\n\
             batch_size_train: 10\n\
             batch_size_test: 10\n\
             lr: 0.01\n\
             log_interval: 1\n\
             datapath: {}\n",
            dir.path().display()
        ),
    )
    .unwrap();
    let config = RunConfig::load(&config_path).unwrap();

    let mut session = TrainingSession::<Backend>::new(
        config.clone(),
        Default::default(),
        dataset(30),
        dataset(10),
    );
    session.fit().unwrap();
    assert_eq!(session.metrics().train().len(), 3);
    assert_eq!(session.metrics().test().len(), 2);

    let mut resumed =
        TrainingSession::<Backend>::new(config, Default::default(), dataset(30), dataset(10));
    assert_eq!(resumed.resume(3).unwrap(), 2..3);
    assert_eq!(resumed.state(), SessionState::Done);

    let reporter = FileMetricsReporter::new(dir.path().join("metrics"));
    reporter.report(resumed.metrics()).unwrap();
    let test_curve = std::fs::read_to_string(reporter.test_path()).unwrap();
    assert_eq!(test_curve.lines().count(), 2);
    assert!(test_curve.lines().nth(1).unwrap().starts_with("60,"));
}

/// Downloads MNIST, run with `cargo test -- --ignored`.
#[test]
#[ignore]
fn one_epoch_on_mnist_beats_chance() {
    let dir = tempfile::tempdir().unwrap();
    let config = RunConfig::new(1, 64, 1000, 0.01).with_datapath(dir.path());

    let mut session = TrainingSession::<Backend>::mnist(config, Default::default());
    let before = session.evaluate();
    let after = session.run_epoch(1).unwrap();

    assert!(after.accuracy() > 10.0, "accuracy {}", after.accuracy());
    assert!(after.mean_loss < before.mean_loss);
}

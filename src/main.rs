#![recursion_limit = "256"]

use std::path::PathBuf;

use burn::tensor::backend::AutodiffBackend;
use clap::{Parser, Subcommand};
use mnist_runner::{
    logger::ApplicationLogger,
    reporter::{FileMetricsReporter, MetricsReporter, SummaryReporter},
    RunConfig, TrainingError, TrainingSession,
};

/// Train a small convolutional network on MNIST, checkpointing after every epoch.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Path of the YAML run configuration.
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Experiment log file, defaults to `<datapath>/experiment.log`.
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Evaluate the untrained model, then train every configured epoch.
    Train,
    /// Restore the last checkpoint and keep training.
    Resume {
        /// First epoch not to run.
        #[arg(long)]
        end_epoch: usize,
        /// First epoch to run, defaults to the one after the checkpointed epoch.
        #[arg(long)]
        start_epoch: Option<usize>,
    },
}

impl Command {
    fn describe(&self) -> String {
        match self {
            Command::Train => "train".to_string(),
            Command::Resume {
                end_epoch,
                start_epoch: Some(start_epoch),
            } => format!("resume epochs {start_epoch}..{end_epoch}"),
            Command::Resume {
                end_epoch,
                start_epoch: None,
            } => format!("resume until epoch {end_epoch}"),
        }
    }
}

fn launch<B: AutodiffBackend>(device: B::Device, config: RunConfig, command: Command) {
    if let Err(err) = run::<B>(device, config, command) {
        log::error!("{err}");
        std::process::exit(1);
    }
}

fn run<B: AutodiffBackend>(
    device: B::Device,
    config: RunConfig,
    command: Command,
) -> Result<(), TrainingError> {
    let metrics_dir = config.datapath.join("metrics");
    let mut session = TrainingSession::<B>::mnist(config, device);

    match command {
        Command::Train => session.fit()?,
        Command::Resume {
            end_epoch,
            start_epoch: Some(start_epoch),
        } => {
            session.resume_range(start_epoch, end_epoch)?;
        }
        Command::Resume {
            end_epoch,
            start_epoch: None,
        } => {
            session.resume(end_epoch)?;
        }
    }

    FileMetricsReporter::new(metrics_dir).report(session.metrics())?;
    SummaryReporter.report(session.metrics())?;

    Ok(())
}

#[cfg(any(
    feature = "ndarray",
    feature = "ndarray-blas-netlib",
    feature = "ndarray-blas-openblas",
    feature = "ndarray-blas-accelerate",
))]
mod ndarray {
    use burn::backend::{
        ndarray::{NdArray, NdArrayDevice},
        Autodiff,
    };

    use crate::{launch, Command, RunConfig};

    pub fn run(config: RunConfig, command: Command) {
        launch::<Autodiff<NdArray>>(NdArrayDevice::Cpu, config, command);
    }
}

#[cfg(feature = "tch-gpu")]
mod tch_gpu {
    use burn::backend::{
        libtorch::{LibTorch, LibTorchDevice},
        Autodiff,
    };

    use crate::{launch, Command, RunConfig};

    pub fn run(config: RunConfig, command: Command) {
        #[cfg(not(target_os = "macos"))]
        let device = LibTorchDevice::Cuda(0);
        #[cfg(target_os = "macos")]
        let device = LibTorchDevice::Mps;

        launch::<Autodiff<LibTorch>>(device, config, command);
    }
}

#[cfg(feature = "tch-cpu")]
mod tch_cpu {
    use burn::backend::{
        libtorch::{LibTorch, LibTorchDevice},
        Autodiff,
    };

    use crate::{launch, Command, RunConfig};

    pub fn run(config: RunConfig, command: Command) {
        launch::<Autodiff<LibTorch>>(LibTorchDevice::Cpu, config, command);
    }
}

#[cfg(feature = "wgpu")]
mod wgpu {
    use burn::backend::{wgpu::Wgpu, Autodiff};

    use crate::{launch, Command, RunConfig};

    pub fn run(config: RunConfig, command: Command) {
        launch::<Autodiff<Wgpu>>(Default::default(), config, command);
    }
}

fn main() {
    let cli = Cli::parse();

    let config = match RunConfig::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    };

    let log_file = cli
        .log_file
        .unwrap_or_else(|| config.datapath.join("experiment.log"));
    let command = cli.command.unwrap_or(Command::Train);
    let logger = ApplicationLogger::new()
        .with_file(&log_file)
        .with_context(command.describe());
    if let Err(err) = logger.install() {
        eprintln!("{err}");
        std::process::exit(1);
    }
    log::info!("Loaded {}: {config:?}", cli.config.display());

    #[cfg(any(
        feature = "ndarray",
        feature = "ndarray-blas-netlib",
        feature = "ndarray-blas-openblas",
        feature = "ndarray-blas-accelerate",
    ))]
    ndarray::run(config.clone(), command);
    #[cfg(feature = "tch-gpu")]
    tch_gpu::run(config.clone(), command);
    #[cfg(feature = "tch-cpu")]
    tch_cpu::run(config.clone(), command);
    #[cfg(feature = "wgpu")]
    wgpu::run(config.clone(), command);
}

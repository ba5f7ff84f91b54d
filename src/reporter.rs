use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use crate::metrics::MetricLog;

/// Errors raised while reporting metrics.
#[derive(thiserror::Error, Debug)]
pub enum ReportError {
    /// Writing the report failed.
    #[error("Unable to write metrics report: {0}")]
    Io(#[from] std::io::Error),
}

/// Consumes a [metric log](MetricLog) once training is over.
pub trait MetricsReporter {
    /// Report the recorded metrics.
    fn report(&self, log: &MetricLog) -> Result<(), ReportError>;
}

/// Writes the loss curves as CSV files, ready to be plotted.
///
/// `train_loss.csv` holds `step,loss` rows and `test_loss.csv` holds
/// `examples_seen,loss` rows.
#[derive(Debug, Clone)]
pub struct FileMetricsReporter {
    directory: PathBuf,
}

impl FileMetricsReporter {
    /// Create a reporter writing into `directory`.
    pub fn new<P: Into<PathBuf>>(directory: P) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    /// Path of the training loss file.
    pub fn train_path(&self) -> PathBuf {
        self.directory.join("train_loss.csv")
    }

    /// Path of the evaluation loss file.
    pub fn test_path(&self) -> PathBuf {
        self.directory.join("test_loss.csv")
    }

    fn write_csv<I>(path: &Path, header: &str, rows: I) -> Result<(), ReportError>
    where
        I: Iterator<Item = (usize, f64)>,
    {
        let mut writer = BufWriter::new(File::create(path)?);
        writeln!(writer, "{header}")?;
        for (x, loss) in rows {
            writeln!(writer, "{x},{loss}")?;
        }
        writer.flush()?;

        Ok(())
    }
}

impl MetricsReporter for FileMetricsReporter {
    fn report(&self, log: &MetricLog) -> Result<(), ReportError> {
        std::fs::create_dir_all(&self.directory)?;

        Self::write_csv(
            &self.train_path(),
            "step,loss",
            log.train().iter().map(|entry| (entry.step, entry.loss)),
        )?;
        Self::write_csv(
            &self.test_path(),
            "examples_seen,loss",
            log.test().iter().map(|entry| (entry.examples_seen, entry.loss)),
        )?;

        log::info!("Metrics written to {}", self.directory.display());
        Ok(())
    }
}

/// Logs a short summary of the recorded losses.
#[derive(Debug, Clone, Default)]
pub struct SummaryReporter;

impl MetricsReporter for SummaryReporter {
    fn report(&self, log: &MetricLog) -> Result<(), ReportError> {
        log::info!(
            "Recorded {} training losses and {} evaluation losses",
            log.train().len(),
            log.test().len()
        );

        if let Some(last) = log.last_test() {
            log::info!(
                "Last evaluation loss {:.4} after {} examples",
                last.loss,
                last.examples_seen
            );
        }
        if let Some(best) = log.best_test() {
            log::info!(
                "Best evaluation loss {:.4} after {} examples",
                best.loss,
                best.examples_seen
            );
        }

        Ok(())
    }
}

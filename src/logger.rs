use std::path::{Path, PathBuf};

use tracing_core::{Level, LevelFilter, Metadata};
use tracing_subscriber::{filter::filter_fn, prelude::*, registry};

/// Errors raised while installing the application logger.
#[derive(thiserror::Error, Debug)]
pub enum LoggerError {
    /// The log directory could not be created.
    #[error("Unable to create log directory '{}': {source}", path.display())]
    Io {
        /// The log directory.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Another global logger was installed first.
    #[error("A global logger is already installed")]
    AlreadyInstalled,
}

/// Routes `log` records to stdout and, optionally, to an experiment log file.
#[derive(Debug, Clone)]
pub struct ApplicationLogger {
    file: Option<PathBuf>,
    level: LevelFilter,
    context: Option<String>,
}

impl Default for ApplicationLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl ApplicationLogger {
    /// Log to stdout at `info` level.
    pub fn new() -> Self {
        Self {
            file: None,
            level: LevelFilter::INFO,
            context: None,
        }
    }

    /// Also write every record to `path`.
    pub fn with_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Set the maximum level.
    pub fn with_level(mut self, level: LevelFilter) -> Self {
        self.level = level;
        self
    }

    /// Describe the run in the message printed when it panics.
    pub fn with_context<S: Into<String>>(mut self, context: S) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Install the logger as the global subscriber.
    ///
    /// When a file is configured, panics are written to it before the default hook runs.
    pub fn install(&self) -> Result<(), LoggerError> {
        let stdout = tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_filter(self.level)
            .with_filter(filter_fn(is_relevant));

        let file = match &self.file {
            Some(path) => {
                let directory = path
                    .parent()
                    .filter(|parent| !parent.as_os_str().is_empty())
                    .unwrap_or_else(|| Path::new("."));
                std::fs::create_dir_all(directory).map_err(|source| LoggerError::Io {
                    path: directory.to_path_buf(),
                    source,
                })?;

                let file_name = path
                    .file_name()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("experiment.log"));
                let writer = tracing_appender::rolling::never(directory, file_name);

                Some(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer)
                        .with_filter(self.level)
                        .with_filter(filter_fn(is_relevant)),
                )
            }
            None => None,
        };

        registry()
            .with(stdout)
            .with(file)
            .try_init()
            .map_err(|_| LoggerError::AlreadyInstalled)?;

        if let Some(path) = &self.file {
            install_panic_hook(path.clone(), self.context.clone());
        }

        Ok(())
    }
}

fn is_relevant(metadata: &Metadata<'_>) -> bool {
    if let Some(path) = metadata.module_path() {
        // The wgpu crates are logging too much, so we skip `info` level.
        let noisy = path.starts_with("wgpu") || path.starts_with("naga");
        if noisy && *metadata.level() >= Level::INFO {
            return false;
        }
    }
    true
}

fn install_panic_hook(file_path: PathBuf, context: Option<String>) {
    let hook = std::panic::take_hook();

    std::panic::set_hook(Box::new(move |info| {
        let payload = info.payload();
        let cause = payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("unknown cause");
        let location = info
            .location()
            .map(|location| format!("{}:{}", location.file(), location.line()));

        log::error!(
            "Run aborted by a panic at {}: {cause}",
            location.as_deref().unwrap_or("unknown location")
        );
        eprintln!("{}", crash_notice(context.as_deref(), &file_path));
        hook(info);
    }));
}

fn crash_notice(context: Option<&str>, file_path: &Path) -> String {
    let run = context.map(|context| format!(" ({context})")).unwrap_or_default();
    format!(
        "The run{run} stopped on a fatal error, the experiment log is at '{}'",
        file_path.display()
    )
}

use std::{
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
};

use burn::{
    module::{ModuleVisitor, ParamId},
    prelude::*,
    record::{
        FileRecorder, FullPrecisionSettings, NamedMpkFileRecorder, Record, Recorder,
        RecorderError,
    },
};
use serde::{Deserialize, Serialize};

/// Recorder used for both checkpoint artifacts.
///
/// Full precision keeps a restored model bit-identical to the saved one.
pub type CheckpointRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

const MANIFEST_FILE: &str = "checkpoint.json";
const GENERATION_PREFIX: &str = "generation-";
const OPTIMIZER_NAME: &str = "optimizer";

/// Errors raised while saving or restoring a checkpoint.
#[derive(thiserror::Error, Debug)]
pub enum CheckpointError {
    /// Filesystem error.
    #[error("Checkpoint IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be written or decoded.
    #[error("Checkpoint record error: {0}")]
    Recorder(#[from] RecorderError),

    /// The manifest could not be written or decoded.
    #[error("Invalid checkpoint manifest: {0}")]
    Manifest(#[from] serde_json::Error),

    /// No checkpoint was committed in the directory.
    #[error("No checkpoint found in '{}'", .0.display())]
    NotFound(PathBuf),

    /// The manifest points to a file that does not exist.
    #[error("Checkpoint artifact is missing: '{}'", .0.display())]
    MissingArtifact(PathBuf),

    /// A restored parameter does not have the shape the module expects.
    #[error(
        "Checkpoint does not fit the model: parameter #{index} has shape {found:?}, \
         expected {expected:?}"
    )]
    Incompatible {
        /// Position of the parameter in visiting order.
        index: usize,
        /// Shape of the freshly initialized parameter, empty when the module has fewer parameters.
        expected: Vec<usize>,
        /// Shape found in the checkpoint, empty when the record has fewer parameters.
        found: Vec<usize>,
    },
}

/// Describes the committed checkpoint.
///
/// The manifest is the commit point of a checkpoint: artifacts it does not
/// reference are never read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointManifest {
    /// Incremented by every save.
    pub generation: u64,
    /// Last completed training epoch.
    pub epoch: usize,
    /// Name of the model artifact.
    pub model_name: String,
    /// Model artifact, relative to the checkpoint directory.
    pub model_file: PathBuf,
    /// Optimizer artifact, relative to the checkpoint directory.
    pub optimizer_file: PathBuf,
}

/// A restored checkpoint.
#[derive(Debug)]
pub struct Checkpoint<M, O> {
    /// The manifest the records were read from.
    pub manifest: CheckpointManifest,
    /// Model record.
    pub model: M,
    /// Optimizer record.
    pub optimizer: O,
}

/// Saves the model and optimizer records of the latest epoch in a directory.
///
/// Each save writes both artifacts into a new `generation-<n>` directory, syncs
/// them to disk and then atomically replaces `checkpoint.json`. The previous
/// generation is kept until the next commit, so the manifest on disk always
/// references complete artifacts, even when the rename itself is lost.
#[derive(Debug, Clone)]
pub struct FileCheckpointer {
    directory: PathBuf,
    model_name: String,
    recorder: CheckpointRecorder,
}

impl FileCheckpointer {
    /// Create a checkpointer storing its files in `directory`.
    pub fn new<P: Into<PathBuf>>(directory: P, model_name: &str) -> Self {
        Self {
            directory: directory.into(),
            model_name: model_name.to_string(),
            recorder: CheckpointRecorder::new(),
        }
    }

    /// The checkpoint directory.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Path of the manifest file.
    pub fn manifest_path(&self) -> PathBuf {
        self.directory.join(MANIFEST_FILE)
    }

    fn generation_dir_name(generation: u64) -> String {
        format!("{GENERATION_PREFIX}{generation}")
    }

    /// The committed manifest, if any.
    pub fn latest(&self) -> Result<Option<CheckpointManifest>, CheckpointError> {
        let path = self.manifest_path();
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Save the records of `epoch`, replacing the previous checkpoint.
    pub fn save<B, M, O>(
        &self,
        epoch: usize,
        model: M,
        optimizer: O,
    ) -> Result<CheckpointManifest, CheckpointError>
    where
        B: Backend,
        M: Record<B>,
        O: Record<B>,
    {
        fs::create_dir_all(&self.directory)?;

        let generation = self
            .latest()?
            .map_or(1, |manifest| manifest.generation + 1);
        let generation_dir = Self::generation_dir_name(generation);
        let generation_path = self.directory.join(&generation_dir);

        // Left over by an interrupted save, never committed.
        if generation_path.exists() {
            fs::remove_dir_all(&generation_path)?;
        }
        fs::create_dir_all(&generation_path)?;

        let extension = <CheckpointRecorder as FileRecorder<B>>::file_extension();
        let model_file =
            Path::new(&generation_dir).join(format!("{}.{extension}", self.model_name));
        let optimizer_file =
            Path::new(&generation_dir).join(format!("{OPTIMIZER_NAME}.{extension}"));

        let model_path = self.directory.join(&model_file);
        let optimizer_path = self.directory.join(&optimizer_file);
        <CheckpointRecorder as Recorder<B>>::record(&self.recorder, model, model_path.clone())?;
        <CheckpointRecorder as Recorder<B>>::record(
            &self.recorder,
            optimizer,
            optimizer_path.clone(),
        )?;

        // Both artifacts must be on disk before the manifest references them.
        for path in [&model_path, &optimizer_path] {
            File::open(path)?.sync_all()?;
        }
        sync_dir(&generation_path)?;

        let manifest = CheckpointManifest {
            generation,
            epoch,
            model_name: self.model_name.clone(),
            model_file,
            optimizer_file,
        };
        self.commit(&manifest)?;
        self.remove_stale_generations(generation);

        log::info!(
            "Checkpoint of epoch {epoch} saved in {}",
            generation_path.display()
        );

        Ok(manifest)
    }

    /// Restore the records of the committed checkpoint.
    pub fn restore<B, M, O>(&self, device: &B::Device) -> Result<Checkpoint<M, O>, CheckpointError>
    where
        B: Backend,
        M: Record<B>,
        O: Record<B>,
    {
        let manifest = self
            .latest()?
            .ok_or_else(|| CheckpointError::NotFound(self.directory.clone()))?;

        let model_path = self.artifact_path(&manifest.model_file)?;
        let optimizer_path = self.artifact_path(&manifest.optimizer_file)?;

        let model = <CheckpointRecorder as Recorder<B>>::load(&self.recorder, model_path, device)?;
        let optimizer =
            <CheckpointRecorder as Recorder<B>>::load(&self.recorder, optimizer_path, device)?;

        log::info!(
            "Checkpoint of epoch {} restored from {}",
            manifest.epoch,
            self.directory.display()
        );

        Ok(Checkpoint {
            manifest,
            model,
            optimizer,
        })
    }

    fn artifact_path(&self, file: &Path) -> Result<PathBuf, CheckpointError> {
        let path = self.directory.join(file);
        if !path.exists() {
            return Err(CheckpointError::MissingArtifact(path));
        }

        Ok(path)
    }

    fn commit(&self, manifest: &CheckpointManifest) -> Result<(), CheckpointError> {
        let path = self.manifest_path();
        let tmp_path = path.with_extension("json.tmp");

        let mut file = File::create(&tmp_path)?;
        file.write_all(serde_json::to_string_pretty(manifest)?.as_bytes())?;
        file.sync_all()?;

        fs::rename(tmp_path, path)?;
        sync_dir(&self.directory)?;

        Ok(())
    }

    /// Keep the committed generation and the one before it, remove everything else.
    ///
    /// Best effort: the new checkpoint is already committed.
    fn remove_stale_generations(&self, current: u64) {
        let entries = match fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(err) => {
                log::warn!("Unable to list {}: {err}", self.directory.display());
                return;
            }
        };

        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(generation) = name
                .to_str()
                .and_then(|name| name.strip_prefix(GENERATION_PREFIX))
                .and_then(|generation| generation.parse::<u64>().ok())
            else {
                continue;
            };

            if generation == current || generation + 1 == current {
                continue;
            }
            if let Err(err) = fs::remove_dir_all(entry.path()) {
                log::warn!(
                    "Unable to remove stale checkpoint {}: {err}",
                    entry.path().display()
                );
            }
        }
    }
}

/// Persist the entries of a directory, so a rename or a new file inside it survives a crash.
#[cfg(unix)]
fn sync_dir(path: &Path) -> std::io::Result<()> {
    File::open(path)?.sync_all()
}

/// Directories cannot be opened as files on this platform.
#[cfg(not(unix))]
fn sync_dir(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Collects the shape of every float parameter in visiting order.
#[derive(Default)]
struct ParamShapes {
    shapes: Vec<Vec<usize>>,
}

impl ParamShapes {
    fn of<B: Backend, M: Module<B>>(module: &M) -> Vec<Vec<usize>> {
        let mut visitor = Self::default();
        module.visit(&mut visitor);
        visitor.shapes
    }
}

impl<B: Backend> ModuleVisitor<B> for ParamShapes {
    fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D>) {
        self.shapes.push(tensor.dims().to_vec());
    }
}

/// Load `record` into `module`, failing when a restored parameter does not have the
/// shape of the corresponding parameter in `module`.
///
/// Loading a record never checks shapes by itself, a mismatch would only surface
/// in the first forward pass.
pub fn load_compatible<B, M>(module: M, record: M::Record) -> Result<M, CheckpointError>
where
    B: Backend,
    M: Module<B>,
{
    let expected = ParamShapes::of(&module);
    let loaded = module.load_record(record);
    let found = ParamShapes::of(&loaded);

    let count = expected.len().max(found.len());
    for index in 0..count {
        let expected = expected.get(index).cloned().unwrap_or_default();
        let found = found.get(index).cloned().unwrap_or_default();

        if expected != found {
            return Err(CheckpointError::Incompatible {
                index,
                expected,
                found,
            });
        }
    }

    Ok(loaded)
}

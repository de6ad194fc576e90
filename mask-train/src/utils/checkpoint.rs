use super::{with_suffix, write_atomic};
use crate::{common::*, config::ResumeMode, model::MaskGenerator};

/// The path of the best checkpoint, saved along with the latest one.
pub fn best_checkpoint_path(path: &Path) -> PathBuf {
    with_suffix(path, ".best")
}

/// Save parameters to a checkpoint file. The previous file is replaced only after the new
/// one is completely written.
pub fn save_checkpoint(model: &dyn MaskGenerator, path: &Path) -> Result<()> {
    write_atomic(path, |tmp_path| model.save(tmp_path))?;
    debug!("saved checkpoint {}", path.display());
    Ok(())
}

/// Finds the checkpoint file to resume from.
///
/// The best checkpoint is preferred. The latest checkpoint is used when the best one is
/// absent. A missing checkpoint is an error in [ResumeMode::Required] mode.
pub fn find_checkpoint(path: &Path, resume: ResumeMode) -> Result<Option<PathBuf>> {
    if resume == ResumeMode::Disabled {
        return Ok(None);
    }

    let best_path = best_checkpoint_path(path);
    let found = [best_path.as_path(), path]
        .into_iter()
        .find(|path| path.is_file())
        .map(|path| path.to_owned());

    match (found, resume) {
        (Some(file), _) => Ok(Some(file)),
        (None, ResumeMode::Required) => {
            bail!("no checkpoint file found at '{}'", path.display())
        }
        (None, _) => Ok(None),
    }
}

/// Load parameters with specified checkpoint loading method. Returns the loaded file.
pub fn try_load_checkpoint(
    model: &mut dyn MaskGenerator,
    path: &Path,
    resume: ResumeMode,
) -> Result<Option<PathBuf>> {
    if resume == ResumeMode::Disabled {
        info!("checkpoint loading is disabled");
        return Ok(None);
    }

    match find_checkpoint(path, resume)? {
        Some(file) => {
            info!("load checkpoint file {}", file.display());
            model.load(&file).with_context(|| {
                format!(
                    "checkpoint '{}' does not match the model architecture",
                    file.display()
                )
            })?;
            Ok(Some(file))
        }
        None => {
            warn!("no checkpoint file found, train from scratch");
            Ok(None)
        }
    }
}

/// Tracks the lowest cross validation loss seen so far.
#[derive(Debug, Clone, Default)]
pub struct BestLossTracker {
    best: Option<f64>,
}

impl BestLossTracker {
    pub fn best(&self) -> Option<f64> {
        self.best
    }

    /// Records the loss and returns true if it is a new best.
    pub fn update(&mut self, loss: f64) -> bool {
        let improved = match self.best {
            Some(best) => loss < best,
            None => loss.is_finite(),
        };
        if improved {
            self.best = Some(loss);
        }
        improved
    }
}

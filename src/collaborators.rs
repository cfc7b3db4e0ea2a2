//! External capabilities the pipeline orchestrates but does not implement:
//! the batch lesion segmentation model and the cross-modality registrar,
//! plus the LPS reorientation step. Each sits behind a trait so the
//! orchestrator depends only on the contract and tests can substitute
//! doubles.

use crate::enums::Device;
use crate::volume_loader::{VolumeLoader, VolumeLoaderError};

use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StageError {
    #[error("missing input file: {0}")]
    MissingInput(PathBuf),

    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        source: std::io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    CommandFailed {
        program: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error(transparent)]
    Volume(#[from] VolumeLoaderError),
}

/// Reorients one volume to canonical LPS axes.
pub trait OrientationNormalizer: Send + Sync {
    fn reorient_to_lps(&self, input: &Path, output: &Path) -> Result<(), StageError>;
}

/// Batch directory-to-directory lesion segmentation.
///
/// Consumes every volume in `input_dir` matching the expected naming
/// convention and writes one mask per input into `output_dir`, named by a
/// fixed suffix transformation. Invoked exactly once per cohort run.
pub trait BatchSegmenter: Send + Sync {
    fn segment_batch(
        &self,
        input_dir: &Path,
        output_dir: &Path,
        device: Device,
    ) -> Result<(), StageError>;
}

/// Estimates a moving-to-fixed spatial transform and applies a saved
/// transform to resample an arbitrary volume into the fixed space.
pub trait SpatialRegistrar: Send + Sync {
    fn estimate_transform(
        &self,
        fixed: &Path,
        moving: &Path,
        transform_out: &Path,
    ) -> Result<(), StageError>;

    fn apply_transform(
        &self,
        fixed: &Path,
        moving: &Path,
        transform: &Path,
        output: &Path,
    ) -> Result<(), StageError>;
}

/// Native LPS reorientation backed by [`LabelVolume::to_lps`].
///
/// [`LabelVolume::to_lps`]: crate::volume::LabelVolume::to_lps
#[derive(Debug, Default)]
pub struct LpsReorienter;

impl OrientationNormalizer for LpsReorienter {
    fn reorient_to_lps(&self, input: &Path, output: &Path) -> Result<(), StageError> {
        if !input.is_file() {
            return Err(StageError::MissingInput(input.to_path_buf()));
        }
        let volume = VolumeLoader::load(input)?;
        VolumeLoader::save(&volume.to_lps(), output)?;
        Ok(())
    }
}

/// Adapter around the external `DLWMLS` executable (nnU-Net based lesion
/// segmentation model).
#[derive(Debug)]
pub struct DlwmlsSegmenter {
    program: PathBuf,
}

impl DlwmlsSegmenter {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for DlwmlsSegmenter {
    fn default() -> Self {
        Self::new("DLWMLS")
    }
}

impl BatchSegmenter for DlwmlsSegmenter {
    fn segment_batch(
        &self,
        input_dir: &Path,
        output_dir: &Path,
        device: Device,
    ) -> Result<(), StageError> {
        if !input_dir.is_dir() {
            return Err(StageError::MissingInput(input_dir.to_path_buf()));
        }
        debug!(input = %input_dir.display(), device = device.as_str(), "running lesion segmentation");
        run_checked(
            Command::new(&self.program)
                .arg("-i")
                .arg(input_dir)
                .arg("-o")
                .arg(output_dir)
                .arg("-device")
                .arg(device.as_str()),
        )
    }
}

/// Adapter around the external `greedy` registration tool: rigid FLAIR→T1
/// registration and nearest-label resampling of masks.
#[derive(Debug)]
pub struct GreedyRegistrar {
    program: PathBuf,
}

impl GreedyRegistrar {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for GreedyRegistrar {
    fn default() -> Self {
        Self::new("greedy")
    }
}

impl SpatialRegistrar for GreedyRegistrar {
    fn estimate_transform(
        &self,
        fixed: &Path,
        moving: &Path,
        transform_out: &Path,
    ) -> Result<(), StageError> {
        for path in [fixed, moving] {
            if !path.is_file() {
                return Err(StageError::MissingInput(path.to_path_buf()));
            }
        }
        run_checked(
            Command::new(&self.program)
                .args(["-d", "3", "-a", "-dof", "6", "-m", "NMI"])
                .arg("-ia-image-centers")
                .args(["-n", "100x50x10"])
                .arg("-i")
                .arg(fixed)
                .arg(moving)
                .arg("-o")
                .arg(transform_out),
        )
    }

    fn apply_transform(
        &self,
        fixed: &Path,
        moving: &Path,
        transform: &Path,
        output: &Path,
    ) -> Result<(), StageError> {
        for path in [fixed, moving, transform] {
            if !path.is_file() {
                return Err(StageError::MissingInput(path.to_path_buf()));
            }
        }
        run_checked(
            Command::new(&self.program)
                .args(["-d", "3"])
                .arg("-rf")
                .arg(fixed)
                .arg("-rm")
                .arg(moving)
                .arg(output)
                .arg("-r")
                .arg(transform)
                .args(["-ri", "LABEL", "0.2vox"]),
        )
    }
}

fn run_checked(command: &mut Command) -> Result<(), StageError> {
    let program = command.get_program().to_string_lossy().into_owned();
    let output = command.output().map_err(|source| StageError::Launch {
        program: program.clone(),
        source,
    })?;
    if !output.status.success() {
        return Err(StageError::CommandFailed {
            program,
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

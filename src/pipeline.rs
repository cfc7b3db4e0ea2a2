//! Cohort orchestration: sequences the pipeline stages and guarantees that
//! one subject's failure never stops the run.
//!
//! Stage order per subject is fixed, since every stage consumes the prior
//! stage's output file: normalize → segment → register → resample →
//! quantify. Normalization and segmentation failures are fatal to the whole
//! run; everything after the batched segmentation call is caught per
//! subject.

use crate::collaborators::{BatchSegmenter, OrientationNormalizer, SpatialRegistrar, StageError};
use crate::enums::{BackgroundPolicy, Device};
use crate::overlap::{self, OverlapError};
use crate::volume_loader::{VolumeLoader, VolumeLoaderError};
use crate::workspace::{self, Workspace, WorkspaceError, artifact_path};

use rayon::prelude::*;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

pub const DEFAULT_T1_SUFFIX: &str = "_T1.nii.gz";
pub const DEFAULT_FLAIR_SUFFIX: &str = "_FL.nii.gz";
pub const DEFAULT_PARCELLATION_SUFFIX: &str = "_T1_LPS_DLMUSE.nii.gz";

/// Everything a cohort run can be configured with.
#[derive(Clone, Debug)]
pub struct CohortConfig {
    pub t1_dir: PathBuf,
    pub t1_suffix: String,
    pub flair_dir: PathBuf,
    pub flair_suffix: String,
    pub parcellation_dir: PathBuf,
    pub parcellation_suffix: String,
    pub output_dir: PathBuf,
    pub device: Device,
    pub retain_intermediates: bool,
    pub background_policy: BackgroundPolicy,
}

impl CohortConfig {
    /// Configuration with the default suffixes, device and policies.
    pub fn new(
        t1_dir: impl Into<PathBuf>,
        flair_dir: impl Into<PathBuf>,
        parcellation_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            t1_dir: t1_dir.into(),
            t1_suffix: DEFAULT_T1_SUFFIX.to_string(),
            flair_dir: flair_dir.into(),
            flair_suffix: DEFAULT_FLAIR_SUFFIX.to_string(),
            parcellation_dir: parcellation_dir.into(),
            parcellation_suffix: DEFAULT_PARCELLATION_SUFFIX.to_string(),
            output_dir: output_dir.into(),
            device: Device::default(),
            retain_intermediates: false,
            background_policy: BackgroundPolicy::default(),
        }
    }
}

/// Fatal, run-level failures. Anything after the batched segmentation call
/// is a per-subject [`SubjectError`] instead.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error("normalization of {mrid} failed: {source}")]
    Normalization { mrid: String, source: StageError },

    #[error("lesion segmentation failed: {0}")]
    Segmentation(#[source] StageError),
}

/// Recoverable failures caught at the subject-finishing boundary.
#[derive(Debug, Error)]
pub enum SubjectError {
    #[error("registration failed: {0}")]
    Registration(#[source] StageError),

    #[error("resampling failed: {0}")]
    Resampling(#[source] StageError),

    #[error("could not load {path}: {source}")]
    LoadVolume {
        path: PathBuf,
        source: VolumeLoaderError,
    },

    #[error(transparent)]
    Overlap(#[from] OverlapError),

    #[error("could not write {path}: {source}")]
    WriteMask {
        path: PathBuf,
        source: VolumeLoaderError,
    },

    #[error("could not write {path}: {source}")]
    WriteTable { path: PathBuf, source: csv::Error },
}

/// Per-subject progress through the finishing phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SubjectStage {
    Pending,
    Normalized,
    Segmented,
    Registered,
    Resampled,
    Quantified,
    Failed,
}

/// Output files of one successfully processed subject.
#[derive(Debug)]
pub struct SubjectArtifacts {
    pub transform: PathBuf,
    pub resampled_mask: PathBuf,
    pub combined_mask: PathBuf,
    pub table: PathBuf,
}

#[derive(Debug)]
pub struct SubjectFailure {
    /// Last stage the subject completed before the error.
    pub reached: SubjectStage,
    pub reason: SubjectError,
}

#[derive(Debug)]
pub enum SubjectOutcome {
    Completed(SubjectArtifacts),
    Excluded(SubjectFailure),
}

#[derive(Debug)]
pub struct SubjectRecord {
    pub mrid: String,
    pub outcome: SubjectOutcome,
}

impl SubjectRecord {
    pub fn stage(&self) -> SubjectStage {
        match &self.outcome {
            SubjectOutcome::Completed(_) => SubjectStage::Quantified,
            SubjectOutcome::Excluded(_) => SubjectStage::Failed,
        }
    }
}

/// Typed record of a whole cohort run, one entry per roster subject.
#[derive(Debug, Default)]
pub struct CohortReport {
    pub subjects: Vec<SubjectRecord>,
}

impl CohortReport {
    pub fn completed(&self) -> usize {
        self.subjects
            .iter()
            .filter(|subject| matches!(subject.outcome, SubjectOutcome::Completed(_)))
            .count()
    }

    pub fn excluded(&self) -> usize {
        self.subjects.len() - self.completed()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunPhase {
    Preparation,
    Normalization,
    Segmentation,
    Finishing,
    Cleanup,
}

impl RunPhase {
    pub fn name(&self) -> &'static str {
        match self {
            RunPhase::Preparation => "preparation",
            RunPhase::Normalization => "normalization",
            RunPhase::Segmentation => "segmentation",
            RunPhase::Finishing => "finishing",
            RunPhase::Cleanup => "cleanup",
        }
    }
}

/// Receives run events; injected so tests capture structured events
/// instead of parsing log text.
pub trait RunObserver {
    fn phase_started(&self, _phase: RunPhase) {}
    fn subject_completed(&self, _mrid: &str) {}
    fn subject_excluded(&self, _mrid: &str, _failure: &SubjectFailure) {}
}

/// Forwards run events to the tracing log stream.
#[derive(Debug, Default)]
pub struct LogObserver;

impl RunObserver for LogObserver {
    fn phase_started(&self, phase: RunPhase) {
        info!("starting {} phase", phase.name());
    }

    fn subject_completed(&self, mrid: &str) {
        info!("{mrid} quantified");
    }

    fn subject_excluded(&self, mrid: &str, failure: &SubjectFailure) {
        warn!("{mrid} excluded due to {}", failure.reason);
    }
}

/// Drives a cohort through the full pipeline.
pub struct CohortPipeline<'a> {
    config: CohortConfig,
    normalizer: &'a dyn OrientationNormalizer,
    segmenter: &'a dyn BatchSegmenter,
    registrar: &'a dyn SpatialRegistrar,
}

impl<'a> CohortPipeline<'a> {
    pub fn new(
        config: CohortConfig,
        normalizer: &'a dyn OrientationNormalizer,
        segmenter: &'a dyn BatchSegmenter,
        registrar: &'a dyn SpatialRegistrar,
    ) -> Self {
        Self {
            config,
            normalizer,
            segmenter,
            registrar,
        }
    }

    /// Run the cohort in roster order.
    ///
    /// Returns the per-subject report on success; a returned error means
    /// the run itself failed (workspace setup, normalization or the
    /// segmentation model invocation) and the workspace may be partially
    /// populated. Per-subject exclusions never surface here.
    pub fn run(
        &self,
        mrids: &[String],
        observer: &dyn RunObserver,
    ) -> Result<CohortReport, PipelineError> {
        observer.phase_started(RunPhase::Preparation);
        let workspace = Workspace::prepare(&self.config.output_dir)?;

        observer.phase_started(RunPhase::Normalization);
        info!("LPS orienting and saving the images");
        self.normalize_cohort(mrids, &workspace)?;

        observer.phase_started(RunPhase::Segmentation);
        info!("processing lesion segmentation on the FLAIR folder");
        self.segmenter
            .segment_batch(
                &workspace.flair_lps(),
                &workspace.lesion_masks(),
                self.config.device,
            )
            .map_err(PipelineError::Segmentation)?;

        observer.phase_started(RunPhase::Finishing);
        info!("creating FLAIR to T1 transforms and quantifying lesion volumes");
        let mut report = CohortReport::default();
        for mrid in mrids {
            let outcome = match self.finish_subject(mrid, &workspace) {
                Ok(artifacts) => {
                    observer.subject_completed(mrid);
                    SubjectOutcome::Completed(artifacts)
                }
                Err(failure) => {
                    observer.subject_excluded(mrid, &failure);
                    SubjectOutcome::Excluded(failure)
                }
            };
            report.subjects.push(SubjectRecord {
                mrid: mrid.clone(),
                outcome,
            });
        }

        observer.phase_started(RunPhase::Cleanup);
        if !self.config.retain_intermediates {
            workspace.remove_intermediates()?;
        }

        Ok(report)
    }

    /// Reorient every subject's T1 and FLAIR to LPS. No cross-subject
    /// dependency, so subjects fan out across threads; the first error
    /// aborts the run.
    fn normalize_cohort(
        &self,
        mrids: &[String],
        workspace: &Workspace,
    ) -> Result<(), PipelineError> {
        let t1_lps = workspace.t1_lps();
        let flair_lps = workspace.flair_lps();
        mrids.par_iter().try_for_each(|mrid| {
            let reorient = |dir: &Path, suffix: &str, out_dir: &Path| {
                self.normalizer.reorient_to_lps(
                    &artifact_path(dir, mrid, suffix),
                    &artifact_path(out_dir, mrid, suffix),
                )
            };
            reorient(&self.config.t1_dir, &self.config.t1_suffix, &t1_lps)
                .and_then(|_| {
                    reorient(&self.config.flair_dir, &self.config.flair_suffix, &flair_lps)
                })
                .map_err(|source| PipelineError::Normalization {
                    mrid: mrid.clone(),
                    source,
                })
        })
    }

    fn finish_subject(
        &self,
        mrid: &str,
        workspace: &Workspace,
    ) -> Result<SubjectArtifacts, SubjectFailure> {
        let fail = |reached: SubjectStage| {
            move |reason: SubjectError| SubjectFailure { reached, reason }
        };

        let t1 = artifact_path(&workspace.t1_lps(), mrid, &self.config.t1_suffix);
        let flair = artifact_path(&workspace.flair_lps(), mrid, &self.config.flair_suffix);
        let lesion_mask = artifact_path(
            &workspace.lesion_masks(),
            mrid,
            workspace::LESION_MASK_SUFFIX,
        );
        let transform = artifact_path(&workspace.transforms(), mrid, workspace::TRANSFORM_SUFFIX);
        let resampled = artifact_path(
            &workspace.resampled_masks(),
            mrid,
            workspace::RESAMPLED_MASK_SUFFIX,
        );
        let combined = artifact_path(
            &workspace.combined_masks(),
            mrid,
            workspace::COMBINED_MASK_SUFFIX,
        );
        let parcellation = artifact_path(
            &self.config.parcellation_dir,
            mrid,
            &self.config.parcellation_suffix,
        );
        let table = workspace.report_path(mrid);

        self.registrar
            .estimate_transform(&t1, &flair, &transform)
            .map_err(SubjectError::Registration)
            .map_err(fail(SubjectStage::Segmented))?;

        self.registrar
            .apply_transform(&t1, &lesion_mask, &transform, &resampled)
            .map_err(SubjectError::Resampling)
            .map_err(fail(SubjectStage::Registered))?;

        let load = |path: &Path| {
            VolumeLoader::load(path).map_err(|source| SubjectError::LoadVolume {
                path: path.to_path_buf(),
                source,
            })
        };
        let lesion = load(&resampled).map_err(fail(SubjectStage::Resampled))?;
        let rois = load(&parcellation).map_err(fail(SubjectStage::Resampled))?;
        let overlap = overlap::compute_overlap(&lesion, &rois, self.config.background_policy)
            .map_err(SubjectError::from)
            .map_err(fail(SubjectStage::Resampled))?;

        VolumeLoader::save(&overlap.combined, &combined)
            .map_err(|source| SubjectError::WriteMask {
                path: combined.clone(),
                source,
            })
            .map_err(fail(SubjectStage::Resampled))?;
        overlap::write_table(&table, mrid, &overlap.rows)
            .map_err(|source| SubjectError::WriteTable {
                path: table.clone(),
                source,
            })
            .map_err(fail(SubjectStage::Resampled))?;

        Ok(SubjectArtifacts {
            transform,
            resampled_mask: resampled,
            combined_mask: combined,
            table,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_the_documented_suffixes() {
        let config = CohortConfig::new("t1", "flair", "rois", "out");
        assert_eq!(config.t1_suffix, "_T1.nii.gz");
        assert_eq!(config.flair_suffix, "_FL.nii.gz");
        assert_eq!(config.parcellation_suffix, "_T1_LPS_DLMUSE.nii.gz");
        assert!(!config.retain_intermediates);
        assert_eq!(config.device, Device::Cuda);
    }

    #[test]
    fn report_counts_completed_and_excluded_subjects() {
        let report = CohortReport {
            subjects: vec![
                SubjectRecord {
                    mrid: "SUB1".into(),
                    outcome: SubjectOutcome::Completed(SubjectArtifacts {
                        transform: "a.tfm".into(),
                        resampled_mask: "b.nii.gz".into(),
                        combined_mask: "c.nii.gz".into(),
                        table: "d.csv".into(),
                    }),
                },
                SubjectRecord {
                    mrid: "SUB2".into(),
                    outcome: SubjectOutcome::Excluded(SubjectFailure {
                        reached: SubjectStage::Segmented,
                        reason: SubjectError::Registration(
                            crate::collaborators::StageError::MissingInput("x.nii.gz".into()),
                        ),
                    }),
                },
            ],
        };
        assert_eq!(report.completed(), 1);
        assert_eq!(report.excluded(), 1);
        assert_eq!(report.subjects[0].stage(), SubjectStage::Quantified);
        assert_eq!(report.subjects[1].stage(), SubjectStage::Failed);
    }
}

//! # White matter lesion segmentation pipeline
//!
//! This crate drives cohorts of brain MRI subjects through a multi-stage
//! lesion quantification pipeline and reports per-subject, per-ROI lesion
//! volumes.
//!
//! Per cohort run the stages are:
//!  - LPS reorientation of every subject's T1 and FLAIR volume (parallel
//!    across subjects)
//!  - one batched invocation of the external lesion segmentation model on
//!    the reoriented FLAIR folder
//!  - per subject: FLAIR→T1 registration, resampling of the lesion mask
//!    into T1 space, and overlap volumetrics against the subject's
//!    anatomical parcellation mask
//!
//! A failure while finishing one subject excludes that subject and is
//! recorded in the run report; the remaining subjects keep processing.
//! The segmentation model and the registration tool are opaque external
//! capabilities behind the [`collaborators`] traits, so any compliant
//! implementation (or a test double) can be substituted.
//!
//! # Examples
//!
//! ## Running a cohort with the default collaborators
//!
//! ```no_run
//! # use wmls_pipeline::collaborators::{DlwmlsSegmenter, GreedyRegistrar, LpsReorienter};
//! # use wmls_pipeline::pipeline::{CohortConfig, CohortPipeline, LogObserver};
//! # use wmls_pipeline::workspace::read_roster;
//! # use std::path::Path;
//! let mrids = read_roster(Path::new("mrid_list.csv"))
//!     .expect("should have read the cohort list");
//! let config = CohortConfig::new("t1_images", "flair_images", "dlmuse_masks", "output");
//! let normalizer = LpsReorienter;
//! let segmenter = DlwmlsSegmenter::default();
//! let registrar = GreedyRegistrar::default();
//! let pipeline = CohortPipeline::new(config, &normalizer, &segmenter, &registrar);
//! let report = pipeline
//!     .run(&mrids, &LogObserver)
//!     .expect("run should have completed");
//! println!("{} subjects quantified", report.completed());
//! ```

pub mod collaborators;
pub mod enums;
pub mod overlap;
pub mod pipeline;
pub mod volume;
pub mod volume_loader;
pub mod workspace;

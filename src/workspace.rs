//! The run workspace: a cohort output directory owned by exactly one run,
//! with a fixed set of intermediate subdirectories keyed by subject ID in
//! file names.

use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Suffix of the raw lesion masks the segmentation model writes.
pub const LESION_MASK_SUFFIX: &str = "_FL_LPS_DLWMLS.nii.gz";
/// Suffix of the persisted FLAIR→T1 transform.
pub const TRANSFORM_SUFFIX: &str = "_FL_to_T1.tfm";
/// Suffix of the lesion mask resampled into T1 space.
pub const RESAMPLED_MASK_SUFFIX: &str = "_DLWMLS_REG_to_T1.nii.gz";
/// Suffix of the combined lesion-by-ROI label volume.
pub const COMBINED_MASK_SUFFIX: &str = "_DLWMLS_DLMUSE_Segmented.nii.gz";
/// Suffix of the per-subject ROI volume table.
pub const REPORT_SUFFIX: &str = "_DLWMLS_DLMUSE_Segmented_Volumes.csv";

const T1_LPS_DIR: &str = "T1_LPS";
const FLAIR_LPS_DIR: &str = "FLAIR_LPS";
const LESION_MASK_DIR: &str = "DLWMLS";
const TRANSFORM_DIR: &str = "TFMs";
const RESAMPLED_MASK_DIR: &str = "DLWMLS_TFM_to_T1";
const COMBINED_MASK_DIR: &str = "DLWMLS_DLMUSE_Segmented";

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("could not prepare {path}: {source}")]
    Prepare {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("could not remove {path}: {source}")]
    Remove {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("could not read cohort list {path}: {source}")]
    Roster { path: PathBuf, source: csv::Error },

    #[error("cohort list {path} holds an empty subject ID at data row {row}")]
    EmptyMrid { path: PathBuf, row: usize },
}

/// Intermediate and output directories of one cohort run.
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Prepare the output directory and its intermediate subdirectories.
    ///
    /// Destructive: an existing directory is removed in full before being
    /// re-created, so callers must not point this at data they want to keep.
    pub fn prepare(root: impl Into<PathBuf>) -> Result<Self, WorkspaceError> {
        let root = root.into();
        let prepare_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| WorkspaceError::Prepare { path, source }
        };

        if root.exists() {
            warn!(
                "output folder '{}' found, removing existing files and re-creating it",
                root.display()
            );
            fs::remove_dir_all(&root).map_err(prepare_err(&root))?;
        } else {
            warn!("output folder '{}' not found, creating it", root.display());
        }
        fs::create_dir_all(&root).map_err(prepare_err(&root))?;

        for name in [
            T1_LPS_DIR,
            FLAIR_LPS_DIR,
            LESION_MASK_DIR,
            TRANSFORM_DIR,
            RESAMPLED_MASK_DIR,
            COMBINED_MASK_DIR,
        ] {
            let path = root.join(name);
            fs::create_dir(&path).map_err(prepare_err(&path))?;
        }

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn t1_lps(&self) -> PathBuf {
        self.root.join(T1_LPS_DIR)
    }

    pub fn flair_lps(&self) -> PathBuf {
        self.root.join(FLAIR_LPS_DIR)
    }

    pub fn lesion_masks(&self) -> PathBuf {
        self.root.join(LESION_MASK_DIR)
    }

    pub fn transforms(&self) -> PathBuf {
        self.root.join(TRANSFORM_DIR)
    }

    pub fn resampled_masks(&self) -> PathBuf {
        self.root.join(RESAMPLED_MASK_DIR)
    }

    pub fn combined_masks(&self) -> PathBuf {
        self.root.join(COMBINED_MASK_DIR)
    }

    /// The per-subject volume table lives at the workspace root.
    pub fn report_path(&self, mrid: &str) -> PathBuf {
        artifact_path(&self.root, mrid, REPORT_SUFFIX)
    }

    /// Remove the intermediate directories. Combined masks and volume
    /// tables are always retained.
    pub fn remove_intermediates(&self) -> Result<(), WorkspaceError> {
        for path in [
            self.t1_lps(),
            self.flair_lps(),
            self.lesion_masks(),
            self.transforms(),
            self.resampled_masks(),
        ] {
            fs::remove_dir_all(&path).map_err(|source| WorkspaceError::Remove { path, source })?;
        }
        Ok(())
    }
}

/// `{mrid}{suffix}` under a directory; the naming convention shared by all
/// per-subject artifacts.
pub fn artifact_path(dir: &Path, mrid: &str, suffix: &str) -> PathBuf {
    dir.join(format!("{mrid}{suffix}"))
}

/// Read the cohort roster: first column of a CSV file, header row skipped.
/// Order is preserved and duplicates are kept.
pub fn read_roster(path: &Path) -> Result<Vec<String>, WorkspaceError> {
    let roster_err = |source| WorkspaceError::Roster {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(roster_err)?;

    let mut mrids = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record.map_err(roster_err)?;
        let mrid = record.get(0).unwrap_or("").trim();
        if mrid.is_empty() {
            return Err(WorkspaceError::EmptyMrid {
                path: path.to_path_buf(),
                row: index + 1,
            });
        }
        mrids.push(mrid.to_string());
    }
    Ok(mrids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_creates_the_intermediate_directories() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("out");
        let workspace = Workspace::prepare(&root).unwrap();

        for path in [
            workspace.t1_lps(),
            workspace.flair_lps(),
            workspace.lesion_masks(),
            workspace.transforms(),
            workspace.resampled_masks(),
            workspace.combined_masks(),
        ] {
            assert!(path.is_dir());
        }
    }

    #[test]
    fn prepare_discards_prior_contents() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("out");
        fs::create_dir(&root).unwrap();
        let stale = root.join("stale.txt");
        fs::write(&stale, "old run").unwrap();

        Workspace::prepare(&root).unwrap();
        assert!(!stale.exists());
    }

    #[test]
    fn remove_intermediates_keeps_final_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::prepare(dir.path().join("out")).unwrap();
        fs::write(workspace.report_path("SUB1"), "MRID\n").unwrap();

        workspace.remove_intermediates().unwrap();

        assert!(!workspace.t1_lps().exists());
        assert!(!workspace.transforms().exists());
        assert!(workspace.combined_masks().is_dir());
        assert!(workspace.report_path("SUB1").is_file());
    }

    #[test]
    fn roster_skips_the_header_row() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("mrids.csv");
        fs::write(&list, "MRID\nSUB1\nSUB2\n").unwrap();
        assert_eq!(read_roster(&list).unwrap(), vec!["SUB1", "SUB2"]);
    }

    #[test]
    fn header_only_roster_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("mrids.csv");
        fs::write(&list, "MRID\n").unwrap();
        assert!(read_roster(&list).unwrap().is_empty());
    }

    #[test]
    fn empty_subject_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("mrids.csv");
        fs::write(&list, "MRID,Site\nSUB1,a\n,b\n").unwrap();
        assert!(matches!(
            read_roster(&list).unwrap_err(),
            WorkspaceError::EmptyMrid { row: 2, .. }
        ));
    }
}

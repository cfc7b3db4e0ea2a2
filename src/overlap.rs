use crate::enums::BackgroundPolicy;
use crate::volume::LabelVolume;

use ndarray::{Array3, Zip};
use rayon::prelude::*;
use serde::Serialize;
use std::borrow::Cow;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OverlapError {
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("invalid label value {value}; labels must be non-negative integers")]
    InvalidLabelValue { value: f32 },
}

/// One observed label pair with its voxel count and physical volume.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OverlapRow {
    pub label_a: u32,
    pub label_b: u32,
    pub voxel_count: u64,
    pub volume_mm3: f64,
}

/// Result of overlapping two label volumes on a shared grid.
#[derive(Debug)]
pub struct Overlap {
    /// Per-voxel composite identifier `label_b * (max_label_a + 1) + label_a`,
    /// on mask A's grid.
    pub combined: LabelVolume,
    /// Rows sorted ascending by `(label_a, label_b)`.
    pub rows: Vec<OverlapRow>,
}

/// Quantify how two label volumes spatially overlap.
///
/// Counts voxels per observed `(label_a, label_b)` pair and converts counts
/// to cubic millimetres using mask A's voxel dimensions. Pair counting runs
/// in parallel over disjoint voxel slabs; the output row order is
/// deterministic regardless of thread scheduling.
///
/// # Errors
///
/// `ShapeMismatch` when the masks are not grid-compatible,
/// `InvalidLabelValue` when either mask holds a negative, non-finite or
/// non-integral voxel value.
pub fn compute_overlap(
    mask_a: &LabelVolume,
    mask_b: &LabelVolume,
    policy: BackgroundPolicy,
) -> Result<Overlap, OverlapError> {
    if !mask_a.grid_compatible(mask_b) {
        return Err(OverlapError::ShapeMismatch {
            expected: mask_a.data.shape().to_vec(),
            actual: mask_b.data.shape().to_vec(),
        });
    }

    let a = contiguous(&mask_a.data);
    let b = contiguous(&mask_b.data);
    let counts = count_pairs(&a, &b)?;

    let voxel_volume = mask_a.voxel_volume();
    let mut rows: Vec<OverlapRow> = counts
        .iter()
        .filter(|((label_a, label_b), _)| match policy {
            BackgroundPolicy::ExcludePureBackground => *label_a != 0 || *label_b != 0,
            BackgroundPolicy::ForegroundPairsOnly => *label_a != 0 && *label_b != 0,
        })
        .map(|(&(label_a, label_b), &voxel_count)| OverlapRow {
            label_a,
            label_b,
            voxel_count,
            volume_mm3: voxel_count as f64 * voxel_volume,
        })
        .collect();
    rows.sort_by_key(|row| (row.label_a, row.label_b));

    // labels are validated above, so the cast per voxel is exact
    let max_label_a = counts.keys().map(|&(label_a, _)| label_a).max().unwrap_or(0);
    let combined_data: Array3<f32> = Zip::from(&mask_a.data)
        .and(&mask_b.data)
        .par_map_collect(|&va, &vb| (vb as u32 * (max_label_a + 1) + va as u32) as f32);
    let combined = LabelVolume::with_affine(combined_data, mask_a.affine);

    Ok(Overlap { combined, rows })
}

/// Write one subject's overlap table as CSV.
///
/// The header is always written, so an empty row set still produces a
/// well-formed table file.
pub fn write_table(
    path: impl AsRef<Path>,
    mrid: &str,
    rows: &[OverlapRow],
) -> Result<(), csv::Error> {
    let mut writer = csv::Writer::from_path(path.as_ref())?;
    writer.write_record(["MRID", "LabelA", "LabelB", "VoxelCount", "Volume_mm3"])?;
    for row in rows {
        writer.write_record(&[
            mrid.to_string(),
            row.label_a.to_string(),
            row.label_b.to_string(),
            row.voxel_count.to_string(),
            row.volume_mm3.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

const SLAB: usize = 64 * 1024;

fn count_pairs(a: &[f32], b: &[f32]) -> Result<HashMap<(u32, u32), u64>, OverlapError> {
    a.par_chunks(SLAB)
        .zip(b.par_chunks(SLAB))
        .map(|(slab_a, slab_b)| {
            let mut counts = HashMap::new();
            for (&va, &vb) in slab_a.iter().zip(slab_b) {
                let pair = (label_value(va)?, label_value(vb)?);
                *counts.entry(pair).or_insert(0u64) += 1;
            }
            Ok(counts)
        })
        .try_reduce(HashMap::new, |mut merged, counts| {
            for (pair, count) in counts {
                *merged.entry(pair).or_insert(0) += count;
            }
            Ok(merged)
        })
}

fn label_value(value: f32) -> Result<u32, OverlapError> {
    if !value.is_finite() || value < 0.0 || value.fract() != 0.0 {
        return Err(OverlapError::InvalidLabelValue { value });
    }
    Ok(value as u32)
}

fn contiguous(data: &Array3<f32>) -> Cow<'_, [f32]> {
    match data.as_slice() {
        Some(slice) => Cow::Borrowed(slice),
        None => Cow::Owned(data.iter().copied().collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cube(dim: (usize, usize, usize), value: f32) -> LabelVolume {
        LabelVolume::new(Array3::from_elem(dim, value), (1.0, 1.0, 1.0))
    }

    #[test]
    fn corner_voxel_scenario() {
        let mut mask_a = cube((3, 3, 3), 1.0);
        mask_a.data[[0, 0, 0]] = 0.0;
        let mask_b = cube((3, 3, 3), 5.0);

        let overlap =
            compute_overlap(&mask_a, &mask_b, BackgroundPolicy::ExcludePureBackground).unwrap();

        assert_eq!(
            overlap.rows,
            vec![
                OverlapRow {
                    label_a: 0,
                    label_b: 5,
                    voxel_count: 1,
                    volume_mm3: 1.0,
                },
                OverlapRow {
                    label_a: 1,
                    label_b: 5,
                    voxel_count: 26,
                    volume_mm3: 26.0,
                },
            ]
        );
    }

    #[test]
    fn foreground_only_policy_drops_background_pairs() {
        let mut mask_a = cube((3, 3, 3), 1.0);
        mask_a.data[[0, 0, 0]] = 0.0;
        let mask_b = cube((3, 3, 3), 5.0);

        let overlap =
            compute_overlap(&mask_a, &mask_b, BackgroundPolicy::ForegroundPairsOnly).unwrap();

        assert_eq!(overlap.rows.len(), 1);
        assert_eq!((overlap.rows[0].label_a, overlap.rows[0].label_b), (1, 5));
    }

    #[test]
    fn voxel_counts_are_conserved() {
        let dim = (4, 5, 6);
        let mask_a = LabelVolume::new(
            Array3::from_shape_fn(dim, |(i, j, k)| ((i * 7 + j * 3 + k) % 4) as f32),
            (1.0, 1.0, 1.0),
        );
        let mask_b = LabelVolume::new(
            Array3::from_shape_fn(dim, |(i, j, k)| ((i + j * 5 + k * 2) % 3) as f32),
            (1.0, 1.0, 1.0),
        );

        let overlap =
            compute_overlap(&mask_a, &mask_b, BackgroundPolicy::ExcludePureBackground).unwrap();

        let background_both = mask_a
            .data
            .iter()
            .zip(mask_b.data.iter())
            .filter(|&(&va, &vb)| va == 0.0 && vb == 0.0)
            .count() as u64;
        let total: u64 = overlap.rows.iter().map(|row| row.voxel_count).sum();
        assert_eq!(total, (4 * 5 * 6) - background_both);
    }

    #[test]
    fn repeated_runs_are_deterministic() {
        let dim = (8, 8, 8);
        let mask_a = LabelVolume::new(
            Array3::from_shape_fn(dim, |(i, j, k)| ((i * 11 + j * 5 + k) % 6) as f32),
            (1.0, 1.0, 1.0),
        );
        let mask_b = LabelVolume::new(
            Array3::from_shape_fn(dim, |(i, j, k)| ((i + j + k * 13) % 5) as f32),
            (1.0, 1.0, 1.0),
        );

        let first =
            compute_overlap(&mask_a, &mask_b, BackgroundPolicy::ExcludePureBackground).unwrap();
        let second =
            compute_overlap(&mask_a, &mask_b, BackgroundPolicy::ExcludePureBackground).unwrap();
        assert_eq!(first.rows, second.rows);
    }

    #[test]
    fn volumes_scale_with_voxel_size() {
        let mask_a = LabelVolume::new(Array3::from_elem((2, 2, 2), 1.0), (2.0, 2.0, 0.5));
        let mask_b = LabelVolume::new(Array3::from_elem((2, 2, 2), 3.0), (2.0, 2.0, 0.5));

        let overlap =
            compute_overlap(&mask_a, &mask_b, BackgroundPolicy::ExcludePureBackground).unwrap();

        assert_eq!(overlap.rows[0].voxel_count, 8);
        assert_eq!(overlap.rows[0].volume_mm3, 16.0);
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let mask_a = cube((3, 3, 3), 1.0);
        let mask_b = cube((3, 3, 2), 1.0);

        let err =
            compute_overlap(&mask_a, &mask_b, BackgroundPolicy::ExcludePureBackground).unwrap_err();
        assert!(matches!(err, OverlapError::ShapeMismatch { .. }));
    }

    #[test]
    fn invalid_labels_are_rejected() {
        for bad in [-1.0, 1.5, f32::NAN] {
            let mask_a = cube((2, 2, 2), bad);
            let mask_b = cube((2, 2, 2), 1.0);
            let err = compute_overlap(&mask_a, &mask_b, BackgroundPolicy::ExcludePureBackground)
                .unwrap_err();
            assert!(matches!(err, OverlapError::InvalidLabelValue { .. }));
        }
    }

    #[test]
    fn all_background_masks_do_not_error() {
        let mask_a = cube((3, 3, 3), 0.0);
        let mask_b = cube((3, 3, 3), 0.0);

        let overlap =
            compute_overlap(&mask_a, &mask_b, BackgroundPolicy::ExcludePureBackground).unwrap();
        assert!(overlap.rows.is_empty());
        assert!(overlap.combined.data.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn combined_mask_encodes_label_pairs() {
        let mut mask_a = cube((2, 2, 2), 0.0);
        mask_a.data[[0, 0, 0]] = 1.0;
        mask_a.data[[1, 1, 1]] = 2.0;
        let mask_b = cube((2, 2, 2), 4.0);

        let overlap =
            compute_overlap(&mask_a, &mask_b, BackgroundPolicy::ExcludePureBackground).unwrap();

        // max label in mask A is 2, so the stride is 3
        assert_eq!(overlap.combined.data[[0, 0, 0]], 13.0);
        assert_eq!(overlap.combined.data[[1, 1, 1]], 14.0);
        assert_eq!(overlap.combined.data[[0, 1, 0]], 12.0);
    }

    #[test]
    fn empty_table_still_has_a_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.csv");
        write_table(&path, "SUB0", &[]).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "MRID,LabelA,LabelB,VoxelCount,Volume_mm3\n");
    }

    #[test]
    fn table_rows_follow_the_sorted_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table.csv");
        let rows = vec![
            OverlapRow {
                label_a: 0,
                label_b: 5,
                voxel_count: 1,
                volume_mm3: 1.0,
            },
            OverlapRow {
                label_a: 1,
                label_b: 5,
                voxel_count: 26,
                volume_mm3: 26.0,
            },
        ];
        write_table(&path, "SUB1", &rows).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            contents,
            "MRID,LabelA,LabelB,VoxelCount,Volume_mm3\nSUB1,0,5,1,1\nSUB1,1,5,26,26\n"
        );
    }
}

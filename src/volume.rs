use ndarray::{Array3, Axis};

/// A 3D label volume on a voxel grid with physical-space metadata.
///
/// Values are label identifiers stored as `f32` the way NIfTI delivers
/// them; 0 is background. The affine maps voxel indices to world
/// coordinates (RAS+ convention, column per voxel axis).
#[derive(Clone, Debug, Default)]
pub struct LabelVolume {
    pub data: Array3<f32>,
    pub spacing: (f32, f32, f32),
    pub affine: [[f32; 4]; 4],
}

impl LabelVolume {
    pub fn new(data: Array3<f32>, spacing: (f32, f32, f32)) -> Self {
        let affine = [
            [spacing.0, 0.0, 0.0, 0.0],
            [0.0, spacing.1, 0.0, 0.0],
            [0.0, 0.0, spacing.2, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ];
        Self {
            data,
            spacing,
            affine,
        }
    }

    pub fn with_affine(data: Array3<f32>, affine: [[f32; 4]; 4]) -> Self {
        Self {
            data,
            spacing: spacing_from_affine(&affine),
            affine,
        }
    }

    /// Get the dimensions of the volume
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Get a reference to the underlying data
    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    /// Physical volume of one voxel in cubic millimetres.
    pub fn voxel_volume(&self) -> f64 {
        (self.spacing.0 as f64 * self.spacing.1 as f64 * self.spacing.2 as f64).abs()
    }

    /// Two volumes can be overlapped only when they share a voxel grid.
    pub fn grid_compatible(&self, other: &LabelVolume) -> bool {
        self.dim() == other.dim()
    }

    /// Reorient the volume so its voxel axes run Left-Posterior-Superior.
    ///
    /// The dominant world direction of each voxel axis is taken from the
    /// affine columns; axes are permuted and flipped so that axis 0 points
    /// towards L, axis 1 towards P and axis 2 towards S, and the affine is
    /// rewritten to keep world coordinates unchanged. A degenerate affine
    /// leaves the volume untouched.
    pub fn to_lps(&self) -> LabelVolume {
        let mut dominant = [0usize; 3];
        for j in 0..3 {
            for i in 1..3 {
                if self.affine[i][j].abs() > self.affine[dominant[j]][j].abs() {
                    dominant[j] = i;
                }
            }
        }

        // perm[k] = voxel axis whose direction dominates world axis k
        let mut perm = [usize::MAX; 3];
        for j in 0..3 {
            if perm[dominant[j]] == usize::MAX {
                perm[dominant[j]] = j;
            }
        }
        if perm.contains(&usize::MAX) {
            return self.clone();
        }

        // LPS: the first two world axes must point negative (RAS+ affine),
        // the third positive
        let mut flip = [false; 3];
        for (k, f) in flip.iter_mut().enumerate() {
            let component = self.affine[k][perm[k]];
            *f = if k == 2 {
                component < 0.0
            } else {
                component > 0.0
            };
        }

        let mut view = self.data.view().permuted_axes(perm);
        for (k, &f) in flip.iter().enumerate() {
            if f {
                view.invert_axis(Axis(k));
            }
        }
        let data = view.to_owned();

        let dims = self.data.dim();
        let extents = [dims.0, dims.1, dims.2];
        let mut affine = [[0.0f32; 4]; 4];
        affine[3][3] = 1.0;
        let mut origin = [self.affine[0][3], self.affine[1][3], self.affine[2][3]];
        for k in 0..3 {
            let j = perm[k];
            let sign = if flip[k] { -1.0 } else { 1.0 };
            for i in 0..3 {
                affine[i][k] = sign * self.affine[i][j];
            }
            if flip[k] {
                // flipping an axis moves the origin to its far end
                let steps = extents[j] as f32 - 1.0;
                for i in 0..3 {
                    origin[i] += self.affine[i][j] * steps;
                }
            }
        }
        for i in 0..3 {
            affine[i][3] = origin[i];
        }

        LabelVolume::with_affine(data, affine)
    }
}

fn spacing_from_affine(affine: &[[f32; 4]; 4]) -> (f32, f32, f32) {
    let norm = |j: usize| {
        (affine[0][j] * affine[0][j] + affine[1][j] * affine[1][j] + affine[2][j] * affine[2][j])
            .sqrt()
    };
    (norm(0), norm(1), norm(2))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lps_affine(spacing: (f32, f32, f32)) -> [[f32; 4]; 4] {
        [
            [-spacing.0, 0.0, 0.0, 0.0],
            [0.0, -spacing.1, 0.0, 0.0],
            [0.0, 0.0, spacing.2, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ]
    }

    #[test]
    fn voxel_volume_from_spacing() {
        let volume = LabelVolume::new(Array3::zeros((2, 2, 2)), (1.0, 2.0, 0.5));
        assert_eq!(volume.voxel_volume(), 1.0);
    }

    #[test]
    fn grid_compatibility_requires_equal_shape() {
        let a = LabelVolume::new(Array3::zeros((2, 3, 4)), (1.0, 1.0, 1.0));
        let b = LabelVolume::new(Array3::zeros((2, 3, 4)), (2.0, 2.0, 2.0));
        let c = LabelVolume::new(Array3::zeros((4, 3, 2)), (1.0, 1.0, 1.0));
        assert!(a.grid_compatible(&b));
        assert!(!a.grid_compatible(&c));
    }

    #[test]
    fn to_lps_is_identity_for_lps_volume() {
        let mut data = Array3::zeros((2, 3, 4));
        data[[0, 1, 2]] = 7.0;
        let volume = LabelVolume::with_affine(data.clone(), lps_affine((1.0, 1.0, 1.0)));
        let reoriented = volume.to_lps();
        assert_eq!(reoriented.data, data);
        assert_eq!(reoriented.affine, volume.affine);
    }

    #[test]
    fn to_lps_flips_ras_axes() {
        let mut data = Array3::zeros((2, 3, 4));
        data[[0, 0, 0]] = 1.0;
        let volume = LabelVolume::new(data, (1.0, 1.0, 1.0));
        let reoriented = volume.to_lps();

        // axes 0 and 1 flip, axis 2 stays
        assert_eq!(reoriented.data[[1, 2, 0]], 1.0);
        assert_eq!(reoriented.data[[0, 0, 0]], 0.0);
        assert_eq!(reoriented.affine[0][0], -1.0);
        assert_eq!(reoriented.affine[1][1], -1.0);
        assert_eq!(reoriented.affine[2][2], 1.0);
        // origin moves to the far corner of the flipped axes
        assert_eq!(reoriented.affine[0][3], 1.0);
        assert_eq!(reoriented.affine[1][3], 2.0);
        assert_eq!(reoriented.affine[2][3], 0.0);
    }

    #[test]
    fn to_lps_permutes_axes() {
        // axis 0 runs S, axis 1 runs L, axis 2 runs P: already correctly
        // signed, only the ordering changes
        let affine = [
            [0.0, -1.0, 0.0, 0.0],
            [0.0, 0.0, -1.0, 0.0],
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ];
        let volume = LabelVolume::with_affine(Array3::zeros((2, 3, 4)), affine);
        let reoriented = volume.to_lps();
        assert_eq!(reoriented.dim(), (3, 4, 2));
    }
}

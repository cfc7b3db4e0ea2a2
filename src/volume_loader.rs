use crate::volume::LabelVolume;

use ndarray::{Axis, Ix3};
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions, writer::WriterOptions};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VolumeLoaderError {
    #[error("expected a 3D volume, got shape {shape:?}")]
    NotThreeDimensional { shape: Vec<usize> },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("NIfTI error: {0}")]
    Nifti(#[from] nifti::NiftiError),
}

pub struct VolumeLoader;

impl VolumeLoader {
    /// Load a label volume from a NIfTI file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or does not hold a 3D
    /// volume (trailing singleton dimensions are squeezed away first).
    pub fn load(path: impl AsRef<Path>) -> Result<LabelVolume, VolumeLoaderError> {
        let object = ReaderOptions::new().read_file(path.as_ref())?;
        let affine = Self::affine_from_header(object.header());

        let mut data = object.into_volume().into_ndarray::<f32>()?;
        while data.ndim() > 3 && data.shape()[data.ndim() - 1] == 1 {
            let last_axis = data.ndim() - 1;
            data = data.index_axis_move(Axis(last_axis), 0);
        }
        let shape = data.shape().to_vec();
        let data = data
            .into_dimensionality::<Ix3>()
            .map_err(|_| VolumeLoaderError::NotThreeDimensional { shape })?;

        Ok(LabelVolume::with_affine(data, affine))
    }

    /// Write a label volume to a NIfTI file, carrying its affine as sform
    pub fn save(volume: &LabelVolume, path: impl AsRef<Path>) -> Result<(), VolumeLoaderError> {
        let header = Self::header_for(volume);
        WriterOptions::new(path.as_ref())
            .reference_header(&header)
            .write_nifti(&volume.data.as_standard_layout())?;
        Ok(())
    }

    /// Voxel-to-world affine: sform when present, else qform, else pixdim
    fn affine_from_header(header: &NiftiHeader) -> [[f32; 4]; 4] {
        if header.sform_code > 0 {
            return [
                header.srow_x,
                header.srow_y,
                header.srow_z,
                [0.0, 0.0, 0.0, 1.0],
            ];
        }

        if header.qform_code > 0 {
            let b = header.quatern_b;
            let c = header.quatern_c;
            let d = header.quatern_d;
            let a = (1.0 - (b * b + c * c + d * d).min(1.0)).sqrt();
            let qfac = if header.pixdim[0] < 0.0 { -1.0 } else { 1.0 };

            let dx = header.pixdim[1];
            let dy = header.pixdim[2];
            let dz = header.pixdim[3] * qfac;

            return [
                [
                    (a * a + b * b - c * c - d * d) * dx,
                    (2.0 * b * c - 2.0 * a * d) * dy,
                    (2.0 * b * d + 2.0 * a * c) * dz,
                    header.quatern_x,
                ],
                [
                    (2.0 * b * c + 2.0 * a * d) * dx,
                    (a * a + c * c - b * b - d * d) * dy,
                    (2.0 * c * d - 2.0 * a * b) * dz,
                    header.quatern_y,
                ],
                [
                    (2.0 * b * d - 2.0 * a * c) * dx,
                    (2.0 * c * d + 2.0 * a * b) * dy,
                    (a * a + d * d - c * c - b * b) * dz,
                    header.quatern_z,
                ],
                [0.0, 0.0, 0.0, 1.0],
            ];
        }

        [
            [header.pixdim[1], 0.0, 0.0, 0.0],
            [0.0, header.pixdim[2], 0.0, 0.0],
            [0.0, 0.0, header.pixdim[3], 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ]
    }

    fn header_for(volume: &LabelVolume) -> NiftiHeader {
        NiftiHeader {
            pixdim: [
                1.0,
                volume.spacing.0,
                volume.spacing.1,
                volume.spacing.2,
                0.0,
                0.0,
                0.0,
                0.0,
            ],
            srow_x: volume.affine[0],
            srow_y: volume.affine[1],
            srow_z: volume.affine[2],
            sform_code: 1,
            qform_code: 0,
            ..NiftiHeader::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn round_trips_data_and_affine() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mask.nii.gz");

        let mut data = Array3::zeros((3, 4, 5));
        data[[1, 2, 3]] = 42.0;
        let affine = [
            [-0.5, 0.0, 0.0, 10.0],
            [0.0, -0.5, 0.0, 20.0],
            [0.0, 0.0, 2.0, -5.0],
            [0.0, 0.0, 0.0, 1.0],
        ];
        let volume = LabelVolume::with_affine(data, affine);

        VolumeLoader::save(&volume, &path).unwrap();
        let loaded = VolumeLoader::load(&path).unwrap();

        assert_eq!(loaded.data, volume.data);
        assert_eq!(loaded.affine, affine);
        assert!((loaded.spacing.0 - 0.5).abs() < 1e-6);
        assert!((loaded.spacing.2 - 2.0).abs() < 1e-6);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(VolumeLoader::load("no_such_volume.nii.gz").is_err());
    }
}

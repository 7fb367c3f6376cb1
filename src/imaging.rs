use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use image::{ImageFormat, RgbImage};
use ndarray::{Array3, Array4, ArrayView4, Axis};
use thiserror::Error;

pub fn load_background(path: impl AsRef<Path>, resolution: u32) -> Result<RgbImage, ImagingError> {
    let path = path.as_ref();
    let image = image::open(path).map_err(|source| ImagingError::Open {
        path: path.to_owned(),
        source,
    })?;
    Ok(resize_square(&image.to_rgb8(), resolution))
}

pub fn resize_square(image: &RgbImage, resolution: u32) -> RgbImage {
    if image.dimensions() == (resolution, resolution) {
        return image.clone();
    }
    image::imageops::resize(image, resolution, resolution, FilterType::CatmullRom)
}

pub fn image_to_tensor(image: &RgbImage) -> Result<Array4<f32>, ImagingError> {
    let (width, height) = image.dimensions();
    let hwc = Array3::from_shape_vec(
        (height as usize, width as usize, 3),
        image.as_raw().clone(),
    )?;
    Ok(hwc
        .mapv(|p| 2. * f32::from(p) / 255. - 1.)
        .permuted_axes([2, 0, 1])
        .insert_axis(Axis(0))
        .as_standard_layout()
        .into_owned())
}

/// Out of range values are clamped and the result is truncated, not rounded.
pub fn tensor_to_image(pixels: ArrayView4<'_, f32>) -> Result<RgbImage, ImagingError> {
    let (batch, channels, height, width) = pixels.dim();
    if batch != 1 || channels != 3 {
        return Err(ImagingError::UnexpectedShape(pixels.shape().to_vec()));
    }
    let raw: Vec<u8> = pixels
        .index_axis(Axis(0), 0)
        .permuted_axes([1, 2, 0])
        .iter()
        .map(|&x| (255. * ((x + 1.) / 2.).clamp(0., 1.)) as u8)
        .collect();
    RgbImage::from_raw(width as u32, height as u32, raw)
        .ok_or_else(|| ImagingError::UnexpectedShape(pixels.shape().to_vec()))
}

pub fn save_png(image: &RgbImage, path: impl AsRef<Path>) -> Result<(), ImagingError> {
    let path = path.as_ref();
    image
        .save_with_format(path, ImageFormat::Png)
        .map_err(|source| ImagingError::Save {
            path: path.to_owned(),
            source,
        })
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ImagingError {
    #[error("failed to open image {path}: {source}")]
    Open {
        path: PathBuf,
        source: image::ImageError,
    },
    #[error("failed to save image {path}: {source}")]
    Save {
        path: PathBuf,
        source: image::ImageError,
    },
    #[error("unexpected pixel tensor shape: {0:?}")]
    UnexpectedShape(Vec<usize>),
    #[error("unexpected tensor shape: {0}")]
    ShapeError(#[from] ndarray::ShapeError),
}

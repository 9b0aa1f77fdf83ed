//! Image preprocessing into the NCHW float tensor the classifier expects.

use crate::error::SkyError;
use image::DynamicImage;
use image::imageops::FilterType;
use std::path::Path;

pub const CHANNELS: usize = 3;

/// ImageNet channel statistics the exported models were trained with.
pub const MEAN: [f32; CHANNELS] = [0.485, 0.456, 0.406];
pub const STD: [f32; CHANNELS] = [0.229, 0.224, 0.225];

/// Flattened length of a batch-1 tensor for a square image of `size`.
pub fn tensor_len(size: usize) -> usize {
    CHANNELS * size * size
}

/// Decode `path` and write the normalized tensor into `out`.
pub fn load_nchw_into(path: &Path, size: usize, out: &mut [f32]) -> Result<(), SkyError> {
    let img = image::open(path)?;
    fill_nchw(&img, size, out)
}

/// Resize to `size`×`size`, scale to [0,1], normalize, and lay out as NCHW.
pub fn fill_nchw(img: &DynamicImage, size: usize, out: &mut [f32]) -> Result<(), SkyError> {
    if out.len() != tensor_len(size) {
        return Err(SkyError::Preprocess(format!(
            "input buffer holds {} values, need {}",
            out.len(),
            tensor_len(size)
        )));
    }
    let edge = u32::try_from(size)
        .map_err(|_| SkyError::Preprocess(format!("image size {size} out of range")))?;

    let rgb = img.resize_exact(edge, edge, FilterType::Triangle).to_rgb8();
    let plane = size * size;
    for (x, y, px) in rgb.enumerate_pixels() {
        let idx = y as usize * size + x as usize;
        for c in 0..CHANNELS {
            out[c * plane + idx] = (f32::from(px[c]) / 255.0 - MEAN[c]) / STD[c];
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn test_solid_color_layout() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(10, 6, Rgb([255, 0, 128])));
        let mut out = vec![0.0; tensor_len(4)];
        fill_nchw(&img, 4, &mut out).unwrap();

        let plane = 16;
        let red = (1.0 - MEAN[0]) / STD[0];
        let green = (0.0 - MEAN[1]) / STD[1];
        assert!(out[..plane].iter().all(|v| (v - red).abs() < 1e-5));
        assert!(out[plane..2 * plane].iter().all(|v| (v - green).abs() < 1e-5));
        let blue = out[2 * plane];
        assert!(out[2 * plane..].iter().all(|v| (v - blue).abs() < 1e-5));
    }

    #[test]
    fn test_wrong_buffer_len() {
        let img = DynamicImage::ImageRgb8(RgbImage::new(2, 2));
        let mut out = vec![0.0; 5];
        assert!(matches!(
            fill_nchw(&img, 4, &mut out),
            Err(SkyError::Preprocess(_))
        ));
    }

    #[test]
    fn test_undecodable_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("garbage.jpg");
        std::fs::write(&path, b"definitely not a jpeg").unwrap();
        let mut out = vec![0.0; tensor_len(4)];
        assert!(load_nchw_into(&path, 4, &mut out).is_err());
    }
}

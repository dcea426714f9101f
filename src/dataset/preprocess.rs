//! Image loading and the letterbox resize that maps every sample onto the
//! square network input, with boxes rescaled to match.

use crate::dataset::Bbox;
use crate::error::Error;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array3;
use std::path::Path;

/// Gray padding value used outside the letterboxed image area.
const PAD_VALUE: f32 = 128.0;

pub fn load_image(path: &Path) -> Result<RgbImage, Error> {
    if !path.exists() {
        return Err(Error::MissingFile(path.to_owned()));
    }
    let image = image::open(path).map_err(|source| Error::ImageDecode {
        path: path.to_owned(),
        source,
    })?;
    Ok(image.to_rgb8())
}

/// Aspect-preserving resize onto a `target x target` canvas padded with
/// neutral gray, normalized to `[0, 1]`. Returns the `[H, W, C]` tensor and
/// the boxes mapped into the resized pixel space. `channels` is 3 for RGB
/// or 1 for grayscale.
pub fn letterbox(
    image: &RgbImage,
    target: u32,
    boxes: &[Bbox],
    channels: usize,
) -> (Array3<f32>, Vec<Bbox>) {
    let (width, height) = (image.width(), image.height());
    let scale = (target as f32 / width as f32).min(target as f32 / height as f32);
    let new_w = ((width as f32 * scale) as u32).max(1);
    let new_h = ((height as f32 * scale) as u32).max(1);
    let dw = (target - new_w) / 2;
    let dh = (target - new_h) / 2;

    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

    let mut tensor = Array3::<f32>::from_elem(
        (target as usize, target as usize, channels),
        PAD_VALUE / 255.0,
    );
    if channels == 1 {
        let gray = imageops::grayscale(&resized);
        for (x, y, pixel) in gray.enumerate_pixels() {
            tensor[[(dh + y) as usize, (dw + x) as usize, 0]] = pixel[0] as f32 / 255.0;
        }
    } else {
        for (x, y, pixel) in resized.enumerate_pixels() {
            for channel in 0..3 {
                tensor[[(dh + y) as usize, (dw + x) as usize, channel]] =
                    pixel[channel] as f32 / 255.0;
            }
        }
    }

    let boxes = boxes
        .iter()
        .map(|b| Bbox {
            xmin: b.xmin * scale + dw as f32,
            ymin: b.ymin * scale + dh as f32,
            xmax: b.xmax * scale + dw as f32,
            ymax: b.ymax * scale + dh as f32,
            class_id: b.class_id,
        })
        .collect();
    (tensor, boxes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use image::Rgb;

    #[test]
    fn letterbox_pads_the_short_side_and_maps_boxes() {
        let image = RgbImage::from_pixel(64, 32, Rgb([255, 0, 0]));
        let boxes = vec![Bbox {
            xmin: 0.0,
            ymin: 0.0,
            xmax: 64.0,
            ymax: 32.0,
            class_id: 0,
        }];
        let (tensor, boxes) = letterbox(&image, 64, &boxes, 3);
        assert_eq!(tensor.shape(), &[64, 64, 3]);

        // top rows are padding, the image band starts at dh = 16
        assert_abs_diff_eq!(tensor[[0, 0, 0]], 128.0 / 255.0, epsilon = 1e-6);
        assert_abs_diff_eq!(tensor[[16, 0, 0]], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(tensor[[16, 0, 1]], 0.0, epsilon = 1e-6);

        assert_abs_diff_eq!(boxes[0].ymin, 16.0, epsilon = 1e-4);
        assert_abs_diff_eq!(boxes[0].ymax, 48.0, epsilon = 1e-4);
        assert_abs_diff_eq!(boxes[0].xmin, 0.0, epsilon = 1e-4);
        assert_abs_diff_eq!(boxes[0].xmax, 64.0, epsilon = 1e-4);
    }

    #[test]
    fn letterbox_downscales_and_rescales_boxes() {
        let image = RgbImage::from_pixel(128, 128, Rgb([0, 255, 0]));
        let boxes = vec![Bbox {
            xmin: 32.0,
            ymin: 32.0,
            xmax: 96.0,
            ymax: 96.0,
            class_id: 1,
        }];
        let (tensor, boxes) = letterbox(&image, 64, &boxes, 3);
        assert_eq!(tensor.shape(), &[64, 64, 3]);
        assert_abs_diff_eq!(boxes[0].xmin, 16.0, epsilon = 1e-4);
        assert_abs_diff_eq!(boxes[0].xmax, 48.0, epsilon = 1e-4);
    }

    #[test]
    fn grayscale_letterbox_has_one_channel() {
        let image = RgbImage::from_pixel(32, 32, Rgb([255, 255, 255]));
        let (tensor, _) = letterbox(&image, 32, &[], 1);
        assert_eq!(tensor.shape(), &[32, 32, 1]);
        assert_abs_diff_eq!(tensor[[0, 0, 0]], 1.0, epsilon = 1e-2);
    }

    #[test]
    fn missing_file_is_reported_as_such() {
        let err = load_image(Path::new("/definitely/not/here.jpg")).unwrap_err();
        assert!(matches!(err, Error::MissingFile(_)));
    }

    #[test]
    fn undecodable_file_is_reported_as_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.jpg");
        std::fs::write(&path, b"this is not a jpeg").unwrap();
        let err = load_image(&path).unwrap_err();
        assert!(matches!(err, Error::ImageDecode { .. }));
    }
}

//! Randomized geometric and photometric augmentation of an (image, boxes)
//! pair. Every transform is gated by its own probability, works on owned
//! copies and keeps the boxes consistent with the transformed pixels.

use crate::dataset::Bbox;
use image::imageops;
use image::{Rgb, RgbImage};
use imageproc::geometric_transformations::{warp, Interpolation, Projection};
use imageproc::map::map_colors;
use rand::Rng;

const FLIP_PROB: f32 = 0.5;
const CROP_PROB: f32 = 0.8;
const TRANSLATE_PROB: f32 = 0.8;
const ROTATE_PROB: f32 = 0.8;
const COLOR_JITTER_PROB: f32 = 0.5;

const ROTATE_DEGREE_RANGE: (f32, f32) = (-10.0, 10.0);
const CONTRAST_RANGE: (f32, f32) = (0.5, 2.5);
const BRIGHTNESS_RANGE: (f32, f32) = (-50.0, 50.0);

/// Applies the full training-time augmentation chain in fixed order:
/// horizontal flip, crop, translate, rotate, color jitter.
pub fn augment<R: Rng>(rng: &mut R, image: RgbImage, boxes: Vec<Bbox>) -> (RgbImage, Vec<Bbox>) {
    let (image, boxes) = random_horizontal_flip(rng, image, boxes);
    let (image, boxes) = random_crop(rng, image, boxes);
    let (image, boxes) = random_translate(rng, image, boxes);
    let (image, boxes) = random_rotate(rng, image, boxes);
    random_color_jitter(rng, image, boxes)
}

pub fn random_horizontal_flip<R: Rng>(
    rng: &mut R,
    image: RgbImage,
    boxes: Vec<Bbox>,
) -> (RgbImage, Vec<Bbox>) {
    if rng.gen::<f32>() >= FLIP_PROB {
        return (image, boxes);
    }
    flip_horizontal(&image, &boxes)
}

/// Mirrors the image left-right and remaps `xmin/xmax` accordingly.
pub fn flip_horizontal(image: &RgbImage, boxes: &[Bbox]) -> (RgbImage, Vec<Bbox>) {
    let width = image.width() as f32;
    let flipped = imageops::flip_horizontal(image);
    let boxes = boxes
        .iter()
        .map(|b| Bbox {
            xmin: width - b.xmax,
            xmax: width - b.xmin,
            ..b.clone()
        })
        .collect();
    (flipped, boxes)
}

pub fn random_crop<R: Rng>(
    rng: &mut R,
    image: RgbImage,
    boxes: Vec<Bbox>,
) -> (RgbImage, Vec<Bbox>) {
    if rng.gen::<f32>() >= CROP_PROB {
        return (image, boxes);
    }
    crop(rng, &image, &boxes)
}

/// Crops a region that still covers every box, chosen by pushing each side
/// of the union-of-boxes rectangle outward by a random margin. Lower bounds
/// clamp at 0, upper bounds at the image extent.
pub fn crop<R: Rng>(rng: &mut R, image: &RgbImage, boxes: &[Bbox]) -> (RgbImage, Vec<Bbox>) {
    let (width, height) = (image.width() as f32, image.height() as f32);
    let region = cover_region(rng, boxes, width, height);

    let margin_left = region[0].max(0.0);
    let margin_up = region[1].max(0.0);
    let margin_right = (width - region[2]).max(0.0);
    let margin_down = (height - region[3]).max(0.0);

    let crop_xmin = (region[0] - rng.gen_range(0.0..=margin_left)).floor().max(0.0);
    let crop_ymin = (region[1] - rng.gen_range(0.0..=margin_up)).floor().max(0.0);
    let crop_xmax = (region[2] + rng.gen_range(0.0..=margin_right)).ceil().min(width);
    let crop_ymax = (region[3] + rng.gen_range(0.0..=margin_down)).ceil().min(height);

    let crop_w = ((crop_xmax - crop_xmin) as u32).max(1);
    let crop_h = ((crop_ymax - crop_ymin) as u32).max(1);
    let cropped =
        imageops::crop_imm(image, crop_xmin as u32, crop_ymin as u32, crop_w, crop_h).to_image();

    let boxes = boxes
        .iter()
        .map(|b| Bbox {
            xmin: b.xmin - crop_xmin,
            ymin: b.ymin - crop_ymin,
            xmax: b.xmax - crop_xmin,
            ymax: b.ymax - crop_ymin,
            class_id: b.class_id,
        })
        .collect();
    (cropped, boxes)
}

pub fn random_translate<R: Rng>(
    rng: &mut R,
    image: RgbImage,
    boxes: Vec<Bbox>,
) -> (RgbImage, Vec<Bbox>) {
    if rng.gen::<f32>() >= TRANSLATE_PROB {
        return (image, boxes);
    }
    translate(rng, &image, &boxes)
}

/// Shifts the image by a random `(tx, ty)` bounded by the same margins the
/// crop uses, so no box is pushed off the canvas.
pub fn translate<R: Rng>(rng: &mut R, image: &RgbImage, boxes: &[Bbox]) -> (RgbImage, Vec<Bbox>) {
    let (width, height) = (image.width() as f32, image.height() as f32);
    let region = cover_region(rng, boxes, width, height);

    let margin_left = region[0].max(0.0);
    let margin_up = region[1].max(0.0);
    let margin_right = (width - region[2]).max(0.0);
    let margin_down = (height - region[3]).max(0.0);

    let tx = bounded_shift(rng, margin_left, margin_right);
    let ty = bounded_shift(rng, margin_up, margin_down);

    let projection = Projection::translate(tx, ty);
    let shifted = warp(image, &projection, Interpolation::Nearest, Rgb([0, 0, 0]));

    let boxes = boxes
        .iter()
        .map(|b| Bbox {
            xmin: b.xmin + tx,
            ymin: b.ymin + ty,
            xmax: b.xmax + tx,
            ymax: b.ymax + ty,
            class_id: b.class_id,
        })
        .collect();
    (shifted, boxes)
}

/// Random shift in `(-(back - 1), forward - 1)`, or 0 when the margins
/// leave no room.
fn bounded_shift<R: Rng>(rng: &mut R, back: f32, forward: f32) -> f32 {
    let lo = -(back - 1.0);
    let hi = forward - 1.0;
    if lo < hi {
        rng.gen_range(lo..hi)
    } else {
        0.0
    }
}

pub fn random_rotate<R: Rng>(
    rng: &mut R,
    image: RgbImage,
    boxes: Vec<Bbox>,
) -> (RgbImage, Vec<Bbox>) {
    if rng.gen::<f32>() >= ROTATE_PROB {
        return (image, boxes);
    }
    let angle = rng.gen_range(ROTATE_DEGREE_RANGE.0..ROTATE_DEGREE_RANGE.1);
    rotate(&image, &boxes, angle)
}

/// Rotates the image about its center and rebuilds each box as the
/// axis-aligned hull of its 4 rotated corners, clamped to the image.
pub fn rotate(image: &RgbImage, boxes: &[Bbox], angle_degrees: f32) -> (RgbImage, Vec<Bbox>) {
    let (width, height) = (image.width() as f32, image.height() as f32);
    let (cx, cy) = (width / 2.0, height / 2.0);
    let projection = Projection::translate(cx, cy)
        * Projection::rotate(angle_degrees.to_radians())
        * Projection::translate(-cx, -cy);

    let rotated = warp(image, &projection, Interpolation::Bilinear, Rgb([0, 0, 0]));

    let boxes = boxes
        .iter()
        .map(|b| {
            let corners = [
                (b.xmin, b.ymin),
                (b.xmax, b.ymin),
                (b.xmin, b.ymax),
                (b.xmax, b.ymax),
            ];
            let mut xmin = f32::INFINITY;
            let mut ymin = f32::INFINITY;
            let mut xmax = f32::NEG_INFINITY;
            let mut ymax = f32::NEG_INFINITY;
            for &(x, y) in &corners {
                let (rx, ry) = projection * (x, y);
                let rx = rx.max(0.0).min(width);
                let ry = ry.max(0.0).min(height);
                xmin = xmin.min(rx);
                ymin = ymin.min(ry);
                xmax = xmax.max(rx);
                ymax = ymax.max(ry);
            }
            Bbox {
                xmin,
                ymin,
                xmax,
                ymax,
                class_id: b.class_id,
            }
        })
        .collect();
    (rotated, boxes)
}

pub fn random_color_jitter<R: Rng>(
    rng: &mut R,
    image: RgbImage,
    boxes: Vec<Bbox>,
) -> (RgbImage, Vec<Bbox>) {
    if rng.gen::<f32>() >= COLOR_JITTER_PROB {
        return (image, boxes);
    }
    let alpha = rng.gen_range(CONTRAST_RANGE.0..CONTRAST_RANGE.1);
    let beta = rng.gen_range(BRIGHTNESS_RANGE.0..BRIGHTNESS_RANGE.1);
    (color_jitter(&image, alpha, beta), boxes)
}

/// Per-channel `alpha * value + beta`, clamped to the valid pixel range.
pub fn color_jitter(image: &RgbImage, alpha: f32, beta: f32) -> RgbImage {
    let rescale = |v: u8| (v as f32 * alpha + beta).max(0.0).min(255.0) as u8;
    map_colors(image, |Rgb([r, g, b])| Rgb([rescale(r), rescale(g), rescale(b)]))
}

/// The rectangle every crop/translate must keep inside the frame: the union
/// of all boxes, or a random central 70-100% region for box-free samples.
fn cover_region<R: Rng>(rng: &mut R, boxes: &[Bbox], width: f32, height: f32) -> [f32; 4] {
    if boxes.is_empty() {
        let lo = rng.gen_range(0.0..0.15);
        let hi = rng.gen_range(0.85..1.0);
        return [lo * width, lo * height, hi * width, hi * height];
    }
    let mut region = [f32::INFINITY, f32::INFINITY, f32::NEG_INFINITY, f32::NEG_INFINITY];
    for b in boxes {
        region[0] = region[0].min(b.xmin);
        region[1] = region[1].min(b.ymin);
        region[2] = region[2].max(b.xmax);
        region[3] = region[3].max(b.ymax);
    }
    region
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn test_image(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
        })
    }

    fn test_boxes() -> Vec<Bbox> {
        vec![
            Bbox {
                xmin: 8.0,
                ymin: 10.0,
                xmax: 20.0,
                ymax: 24.0,
                class_id: 0,
            },
            Bbox {
                xmin: 28.0,
                ymin: 6.0,
                xmax: 44.0,
                ymax: 30.0,
                class_id: 1,
            },
        ]
    }

    #[test]
    fn double_flip_restores_image_and_boxes() {
        let image = test_image(48, 36);
        let boxes = test_boxes();
        let (flipped, flipped_boxes) = flip_horizontal(&image, &boxes);
        let (restored, restored_boxes) = flip_horizontal(&flipped, &flipped_boxes);
        assert_eq!(restored, image);
        assert_eq!(restored_boxes, boxes);
    }

    #[test]
    fn crop_never_exceeds_image_extent_and_keeps_boxes_inside() {
        for seed in 0..50 {
            let mut rng = StdRng::seed_from_u64(seed);
            let image = test_image(48, 36);
            let boxes = test_boxes();
            let (cropped, cropped_boxes) = crop(&mut rng, &image, &boxes);
            assert!(cropped.width() <= image.width());
            assert!(cropped.height() <= image.height());
            for b in &cropped_boxes {
                assert!(b.xmin >= -1e-3);
                assert!(b.ymin >= -1e-3);
                assert!(b.xmax <= cropped.width() as f32 + 1e-3);
                assert!(b.ymax <= cropped.height() as f32 + 1e-3);
            }
        }
    }

    #[test]
    fn crop_of_background_sample_stays_within_extent() {
        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(seed);
            let image = test_image(40, 40);
            let (cropped, boxes) = crop(&mut rng, &image, &[]);
            assert!(cropped.width() <= 40 && cropped.height() <= 40);
            assert!(boxes.is_empty());
        }
    }

    #[test]
    fn translate_keeps_dimensions_and_shifts_boxes_consistently() {
        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(seed);
            let image = test_image(48, 36);
            let boxes = test_boxes();
            let (shifted, shifted_boxes) = translate(&mut rng, &image, &boxes);
            assert_eq!((shifted.width(), shifted.height()), (48, 36));
            // the shift is rigid: box sizes are preserved
            for (before, after) in boxes.iter().zip(&shifted_boxes) {
                assert_abs_diff_eq!(
                    after.xmax - after.xmin,
                    before.xmax - before.xmin,
                    epsilon = 1e-4
                );
                assert_abs_diff_eq!(
                    after.ymax - after.ymin,
                    before.ymax - before.ymin,
                    epsilon = 1e-4
                );
            }
        }
    }

    #[test]
    fn zero_rotation_is_identity_on_boxes() {
        let image = test_image(48, 36);
        let boxes = test_boxes();
        let (_, rotated_boxes) = rotate(&image, &boxes, 0.0);
        for (before, after) in boxes.iter().zip(&rotated_boxes) {
            assert_abs_diff_eq!(before.xmin, after.xmin, epsilon = 1e-3);
            assert_abs_diff_eq!(before.ymin, after.ymin, epsilon = 1e-3);
            assert_abs_diff_eq!(before.xmax, after.xmax, epsilon = 1e-3);
            assert_abs_diff_eq!(before.ymax, after.ymax, epsilon = 1e-3);
        }
    }

    #[test]
    fn rotated_boxes_stay_clamped_to_the_image() {
        let image = test_image(48, 36);
        let boxes = test_boxes();
        let (_, rotated_boxes) = rotate(&image, &boxes, 10.0);
        for b in &rotated_boxes {
            assert!(b.xmin >= 0.0 && b.xmax <= 48.0);
            assert!(b.ymin >= 0.0 && b.ymax <= 36.0);
            assert!(b.xmin <= b.xmax && b.ymin <= b.ymax);
        }
    }

    #[test]
    fn color_jitter_rescales_and_clamps() {
        let image = RgbImage::from_pixel(4, 4, Rgb([100, 200, 10]));
        let jittered = color_jitter(&image, 2.0, 10.0);
        assert_eq!(jittered.get_pixel(0, 0), &Rgb([210, 255, 30]));
        let darkened = color_jitter(&image, 0.5, -60.0);
        assert_eq!(darkened.get_pixel(0, 0), &Rgb([0, 40, 0]));
    }

    #[test]
    fn full_chain_returns_a_consistent_pair() {
        let mut rng = StdRng::seed_from_u64(3);
        let (image, boxes) = augment(&mut rng, test_image(64, 64), test_boxes());
        for b in &boxes {
            assert!(b.class_id < 2);
            assert!(b.xmin <= b.xmax && b.ymin <= b.ymax);
        }
        assert!(image.width() > 0 && image.height() > 0);
    }
}

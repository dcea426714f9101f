//! Encoding of ground truth boxes into the dense per-scale label grids the
//! detector loss consumes.
//!
//! Grid layout per scale is `[grid_y, grid_x, anchor, 5 + num_classes]` with
//! channels `[cx, cy, w, h, objectness, class scores...]`. The box part stays
//! in absolute input-image pixels, matching is done in grid-cell units.

use crate::dataset::Bbox;
use ndarray::{Array2, Array4};

const ANCHOR_IOU_THRESHOLD: f32 = 0.3;
const LABEL_SMOOTHING: f32 = 0.01;

/// IoU of two axis-aligned boxes in center-form `[cx, cy, w, h]`.
pub fn iou_xywh(a: [f32; 4], b: [f32; 4]) -> f32 {
    let area_a = a[2] * a[3];
    let area_b = b[2] * b[3];

    let left = (a[0] - a[2] * 0.5).max(b[0] - b[2] * 0.5);
    let right = (a[0] + a[2] * 0.5).min(b[0] + b[2] * 0.5);
    let up = (a[1] - a[3] * 0.5).max(b[1] - b[3] * 0.5);
    let down = (a[1] + a[3] * 0.5).min(b[1] + b[3] * 0.5);

    let inter = (right - left).max(0.0) * (down - up).max(0.0);
    let union = area_a + area_b - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

/// Per-sample encoder output: one label grid per detection scale plus the
/// raw center-form boxes assigned to that scale (capped at
/// `max_bbox_per_scale`, wrapping around like a ring).
pub struct EncodedLabels {
    pub label_mbbox: Array4<f32>,
    pub label_lbbox: Array4<f32>,
    pub mbboxes: Array2<f32>,
    pub lbboxes: Array2<f32>,
}

pub struct LabelEncoder {
    strides: [f32; 2],
    anchors: Vec<Vec<[f32; 2]>>,
    anchor_per_scale: usize,
    num_classes: usize,
    max_bbox_per_scale: usize,
}

impl LabelEncoder {
    pub fn new(
        strides: [u32; 2],
        anchors: Vec<Vec<[f32; 2]>>,
        anchor_per_scale: usize,
        num_classes: usize,
        max_bbox_per_scale: usize,
    ) -> LabelEncoder {
        LabelEncoder {
            strides: [strides[0] as f32, strides[1] as f32],
            anchors,
            anchor_per_scale,
            num_classes,
            max_bbox_per_scale,
        }
    }

    /// Assigns every box to anchor/grid-cell slots across both scales.
    ///
    /// A scale takes the box at every anchor whose IoU with the box (both
    /// placed at the cell center) clears the threshold. If no anchor on any
    /// scale matches, the single globally best anchor takes it, provided its
    /// cell lies inside that scale's grid. Later boxes overwrite earlier
    /// ones landing on the same slot.
    pub fn encode(&self, boxes: &[Bbox], output_sizes: [usize; 2]) -> EncodedLabels {
        let features = 5 + self.num_classes;
        let mut labels = [
            Array4::<f32>::zeros((
                output_sizes[0],
                output_sizes[0],
                self.anchor_per_scale,
                features,
            )),
            Array4::<f32>::zeros((
                output_sizes[1],
                output_sizes[1],
                self.anchor_per_scale,
                features,
            )),
        ];
        let mut raw_boxes = [
            Array2::<f32>::zeros((self.max_bbox_per_scale, 4)),
            Array2::<f32>::zeros((self.max_bbox_per_scale, 4)),
        ];
        let mut box_counts = [0usize; 2];

        for bbox in boxes {
            debug_assert!(bbox.class_id < self.num_classes);
            let xywh = bbox.to_xywh();
            let smooth_onehot = self.smooth_onehot(bbox.class_id);
            let scaled: Vec<[f32; 4]> = self
                .strides
                .iter()
                .map(|&stride| {
                    [
                        xywh[0] / stride,
                        xywh[1] / stride,
                        xywh[2] / stride,
                        xywh[3] / stride,
                    ]
                })
                .collect();

            // scale-major, anchor-minor; index i * anchor_per_scale + a
            let mut ious = Vec::with_capacity(2 * self.anchor_per_scale);
            let mut exist_positive = false;

            for scale in 0..2 {
                let cell_cx = scaled[scale][0].floor() + 0.5;
                let cell_cy = scaled[scale][1].floor() + 0.5;
                let mut matched = false;

                for anchor in 0..self.anchor_per_scale {
                    let prior = self.anchors[scale][anchor];
                    let anchor_xywh = [cell_cx, cell_cy, prior[0], prior[1]];
                    let iou = iou_xywh(scaled[scale], anchor_xywh);
                    ious.push(iou);

                    if iou > ANCHOR_IOU_THRESHOLD
                        && self.write_slot(
                            &mut labels[scale],
                            scaled[scale],
                            anchor,
                            &xywh,
                            &smooth_onehot,
                        )
                    {
                        matched = true;
                    }
                }

                if matched {
                    self.record_raw_box(&mut raw_boxes[scale], &mut box_counts[scale], &xywh);
                    exist_positive = true;
                }
            }

            if !exist_positive {
                let best = ious
                    .iter()
                    .enumerate()
                    .max_by(|(_, a), (_, b)| a.partial_cmp(b).expect("IoU is never NaN"))
                    .map(|(idx, _)| idx)
                    .unwrap_or(0);
                let best_scale = best / self.anchor_per_scale;
                let best_anchor = best % self.anchor_per_scale;

                let written = self.write_slot(
                    &mut labels[best_scale],
                    scaled[best_scale],
                    best_anchor,
                    &xywh,
                    &smooth_onehot,
                );
                if written {
                    self.record_raw_box(
                        &mut raw_boxes[best_scale],
                        &mut box_counts[best_scale],
                        &xywh,
                    );
                }
            }
        }

        let [label_mbbox, label_lbbox] = labels;
        let [mbboxes, lbboxes] = raw_boxes;
        EncodedLabels {
            label_mbbox,
            label_lbbox,
            mbboxes,
            lbboxes,
        }
    }

    /// Writes one anchor slot; returns false when the box center falls
    /// outside the grid (degenerate boxes on heavily augmented samples).
    fn write_slot(
        &self,
        label: &mut Array4<f32>,
        scaled: [f32; 4],
        anchor: usize,
        xywh: &[f32; 4],
        smooth_onehot: &[f32],
    ) -> bool {
        let grid = label.shape()[0] as isize;
        let xind = scaled[0].floor() as isize;
        let yind = scaled[1].floor() as isize;
        if xind < 0 || yind < 0 || xind >= grid || yind >= grid {
            log::debug!(
                "box center ({:.1}, {:.1}) outside {}x{} grid, slot skipped",
                scaled[0],
                scaled[1],
                grid,
                grid
            );
            return false;
        }
        let (yind, xind) = (yind as usize, xind as usize);
        for (channel, &value) in xywh.iter().enumerate() {
            label[[yind, xind, anchor, channel]] = value;
        }
        label[[yind, xind, anchor, 4]] = 1.0;
        for (offset, &value) in smooth_onehot.iter().enumerate() {
            label[[yind, xind, anchor, 5 + offset]] = value;
        }
        true
    }

    fn record_raw_box(&self, raw: &mut Array2<f32>, count: &mut usize, xywh: &[f32; 4]) {
        let slot = *count % self.max_bbox_per_scale;
        for (channel, &value) in xywh.iter().enumerate() {
            raw[[slot, channel]] = value;
        }
        *count += 1;
    }

    /// Label-smoothed one-hot: the true class gets
    /// `(1 - d) + d / num_classes`, every other class `d / num_classes`.
    fn smooth_onehot(&self, class_id: usize) -> Vec<f32> {
        let uniform = LABEL_SMOOTHING / self.num_classes as f32;
        let mut onehot = vec![uniform; self.num_classes];
        onehot[class_id] += 1.0 - LABEL_SMOOTHING;
        onehot
    }
}

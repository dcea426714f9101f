use std::path::PathBuf;

pub mod annotations;
pub mod augmentation;
pub mod feeder;
pub mod label_encoding;
pub mod preprocess;

/// An axis-aligned bounding box in absolute pixel coordinates with its
/// class label. `class_id < num_classes` is checked when the annotation
/// index is loaded, everything downstream relies on it.
#[derive(Debug, Clone, PartialEq)]
pub struct Bbox {
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
    pub class_id: usize,
}

impl Bbox {
    /// Center-form `[cx, cy, w, h]`.
    pub fn to_xywh(&self) -> [f32; 4] {
        [
            (self.xmin + self.xmax) * 0.5,
            (self.ymin + self.ymax) * 0.5,
            self.xmax - self.xmin,
            self.ymax - self.ymin,
        ]
    }
}

/// One line of the annotation index: an image and its boxes.
/// An empty box list is a valid background sample.
#[derive(Debug, Clone)]
pub struct AnnotationRecord {
    pub image_path: PathBuf,
    pub boxes: Vec<Bbox>,
}

use crate::dataset::{AnnotationRecord, Bbox};
use crate::error::Error;
use itertools::Itertools;
use rand::seq::SliceRandom;
use rand::Rng;
use std::fs;
use std::path::PathBuf;

/// In-memory annotation index. The record set is fixed after `load`,
/// only the ordering changes when `shuffle` is called at epoch boundaries.
pub struct AnnotationStore {
    records: Vec<AnnotationRecord>,
    class_counts: Vec<usize>,
}

impl AnnotationStore {
    /// Reads one or more plain-text index files. Each non-blank line is
    /// `<image_path> [<xmin>,<ymin>,<xmax>,<ymax>,<class_id> ...]`; a line
    /// without boxes is a background sample. Malformed box tokens and class
    /// ids outside `[0, num_classes)` abort the load.
    pub fn load(paths: &[PathBuf], num_classes: usize) -> Result<AnnotationStore, Error> {
        let mut records = vec![];
        let mut class_counts = vec![0usize; num_classes];

        for path in paths {
            let text = fs::read_to_string(path).map_err(|source| Error::Io {
                path: path.clone(),
                source,
            })?;
            for (line_idx, line) in text.lines().enumerate() {
                let mut tokens = line.split_whitespace();
                let image_path = match tokens.next() {
                    Some(first) => PathBuf::from(first),
                    None => continue, // blank line
                };
                let mut boxes = vec![];
                for token in tokens {
                    let bbox = parse_box_token(token, num_classes)
                        .map_err(|msg| Error::Parse {
                            path: path.clone(),
                            line: line_idx + 1,
                            msg,
                        })?;
                    class_counts[bbox.class_id] += 1;
                    boxes.push(bbox);
                }
                records.push(AnnotationRecord { image_path, boxes });
            }
        }

        log::info!(
            "loaded {} annotation records, instances per class: [{}]",
            records.len(),
            class_counts.iter().format(", ")
        );

        Ok(AnnotationStore {
            records,
            class_counts,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Indexed access with wraparound, so producers racing past the end of
    /// an epoch reuse records instead of panicking.
    pub fn get(&self, index: usize) -> &AnnotationRecord {
        &self.records[index % self.records.len()]
    }

    /// Number of ground truth instances seen per class at load time.
    pub fn class_counts(&self) -> &[usize] {
        &self.class_counts
    }

    pub fn shuffle<R: Rng>(&mut self, rng: &mut R) {
        self.records.shuffle(rng);
    }
}

/// Parses one `xmin,ymin,xmax,ymax,class_id` token.
fn parse_box_token(token: &str, num_classes: usize) -> Result<Bbox, String> {
    let fields: Vec<&str> = token.split(',').collect();
    if fields.len() != 5 {
        return Err(format!(
            "box token {:?} has {} fields, expected 5",
            token,
            fields.len()
        ));
    }
    let mut values = [0f32; 5];
    for (value, field) in values.iter_mut().zip(&fields) {
        *value = field
            .trim()
            .parse::<f32>()
            .map_err(|_| format!("non-numeric field {:?} in box token {:?}", field, token))?;
    }
    let class = values[4];
    if class < 0.0 || class as usize >= num_classes {
        return Err(format!(
            "class id {} out of range [0, {}) in box token {:?}",
            class, num_classes, token
        ));
    }
    Ok(Bbox {
        xmin: values[0],
        ymin: values[1],
        xmax: values[2],
        ymax: values[3],
        class_id: class as usize,
    })
}

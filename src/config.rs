use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};

/// Configuration surface of the data feeder.
///
/// `anchors` holds the (width, height) priors in grid-cell units, one list
/// per detection scale, outer length 2 and inner length `anchor_per_scale`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// One or more annotation index files, concatenated in order.
    pub annotation_paths: Vec<PathBuf>,
    pub batch_size: usize,
    /// Image channel count: 3 for RGB, 1 for grayscale.
    #[serde(default = "default_channels")]
    pub channels: usize,
    /// Candidate input resolutions; one is drawn at random per batch.
    pub input_sizes: Vec<u32>,
    /// Stride of each detection scale, medium first.
    pub strides: [u32; 2],
    pub num_classes: usize,
    pub anchors: Vec<Vec<[f32; 2]>>,
    #[serde(default = "default_anchor_per_scale")]
    pub anchor_per_scale: usize,
    #[serde(default = "default_max_bbox_per_scale")]
    pub max_bbox_per_scale: usize,
    /// Fraction of the dataset that makes up one epoch.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f32,
    /// Number of producer worker threads.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Capacity of the batch queue, in batches.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Apply the randomized augmentations (training mode).
    #[serde(default = "default_augment")]
    pub augment: bool,
}

fn default_channels() -> usize {
    3
}
fn default_anchor_per_scale() -> usize {
    3
}
fn default_max_bbox_per_scale() -> usize {
    150
}
fn default_sample_rate() -> f32 {
    1.0
}
fn default_workers() -> usize {
    3
}
fn default_queue_capacity() -> usize {
    32
}
fn default_augment() -> bool {
    true
}

impl DatasetConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<DatasetConfig, Error> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| Error::Io {
            path: path.to_owned(),
            source,
        })?;
        let config: DatasetConfig =
            serde_json::from_reader(file).map_err(|err| Error::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.annotation_paths.is_empty() {
            return Err(Error::Config("no annotation paths given".into()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".into()));
        }
        if self.channels != 1 && self.channels != 3 {
            return Err(Error::Config(format!(
                "channels must be 1 or 3, got {}",
                self.channels
            )));
        }
        if self.input_sizes.is_empty() {
            return Err(Error::Config("input_sizes must not be empty".into()));
        }
        if self.strides.iter().any(|&s| s == 0) {
            return Err(Error::Config("strides must be non-zero".into()));
        }
        for &size in &self.input_sizes {
            for &stride in &self.strides {
                if size % stride != 0 {
                    return Err(Error::Config(format!(
                        "input size {} is not divisible by stride {}",
                        size, stride
                    )));
                }
            }
        }
        if self.anchors.len() != 2
            || self
                .anchors
                .iter()
                .any(|per_scale| per_scale.len() != self.anchor_per_scale)
        {
            return Err(Error::Config(format!(
                "anchors must have shape [2][{}]",
                self.anchor_per_scale
            )));
        }
        if self.num_classes == 0 {
            return Err(Error::Config("num_classes must be at least 1".into()));
        }
        if !(self.sample_rate > 0.0) {
            return Err(Error::Config("sample_rate must be positive".into()));
        }
        if self.workers == 0 {
            return Err(Error::Config("at least one worker is required".into()));
        }
        if self.queue_capacity == 0 {
            return Err(Error::Config("queue_capacity must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn small_config() -> DatasetConfig {
        DatasetConfig {
            annotation_paths: vec![PathBuf::from("annotations.txt")],
            batch_size: 2,
            channels: 3,
            input_sizes: vec![64],
            strides: [16, 32],
            num_classes: 4,
            anchors: vec![
                vec![[1.0, 1.0], [2.0, 2.0], [3.0, 3.0]],
                vec![[1.0, 1.0], [1.5, 1.5], [2.0, 2.0]],
            ],
            anchor_per_scale: 3,
            max_bbox_per_scale: 150,
            sample_rate: 1.0,
            workers: 1,
            queue_capacity: 4,
            augment: false,
        }
    }

    #[test]
    fn valid_config_passes() {
        small_config().validate().unwrap();
    }

    #[test]
    fn indivisible_input_size_is_rejected() {
        let mut config = small_config();
        config.input_sizes = vec![50];
        assert!(config.validate().is_err());
    }

    #[test]
    fn wrong_anchor_shape_is_rejected() {
        let mut config = small_config();
        config.anchors.pop();
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = small_config();
        let json = serde_json::to_string(&config).unwrap();
        let back: DatasetConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.batch_size, config.batch_size);
        assert_eq!(back.anchors, config.anchors);
    }
}

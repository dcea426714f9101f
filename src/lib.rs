//! Training data feeder for anchor-based YOLO detectors.
//!
//! Reads a plain-text annotation index, loads and augments images, encodes
//! ground truth boxes into two multi-scale anchor-grid label tensors and
//! delivers fixed-size mini-batches through a bounded queue filled by
//! background worker threads, so training never stalls on I/O.

pub mod config;
pub mod dataset;
pub mod error;

pub use crate::config::DatasetConfig;
pub use crate::dataset::feeder::{Batch, DataFeeder};
pub use crate::dataset::{AnnotationRecord, Bbox};
pub use crate::error::Error;

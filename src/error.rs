use std::path::PathBuf;
use thiserror::Error;

/// Everything that can go wrong while building or running the feeder.
///
/// Load-time errors (`Parse`, `Io`, `Config`) are fatal and abort feeder
/// construction. Runtime per-sample errors (`MissingFile`, `ImageDecode`)
/// are caught inside the producer workers, logged and skipped.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path:?}:{line}: {msg}")]
    Parse {
        path: PathBuf,
        line: usize,
        msg: String,
    },

    #[error("image file {0:?} does not exist")]
    MissingFile(PathBuf),

    #[error("failed to decode image {path:?}")]
    ImageDecode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("no usable sample found after a full pass over the annotation set")]
    NoUsableSamples,
}

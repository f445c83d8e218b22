use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Problems with a requested model or run configuration, found before any tensor is allocated.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
  #[error("unknown architecture `{0}`, expected `basic` or `bottleneck`")]
  UnknownArchitecture(String),
  #[error("unknown data format `{0}`, expected `channels_last` or `channels_first`")]
  UnknownDataFormat(String),
  #[error("block expects {expected} input channels, got {found}")]
  ChannelMismatch { expected: usize, found: usize },
  #[error("cannot zero-pad a {input}-channel shortcut symmetrically to {output} channels")]
  IncompatibleShortcut { input: usize, output: usize },
  #[error("unsupported stride {0}, expected 1 or 2")]
  InvalidStride(usize),
  #[error("invalid input shape {shape:?}: {reason}")]
  InvalidInputShape {
    shape: [usize; 3],
    reason: &'static str,
  },
  #[error("class count must be positive, got {0}")]
  InvalidClasses(usize),
  #[error("batch size must be positive")]
  InvalidBatchSize,
}

#[derive(Debug, Error)]
pub enum DataError {
  #[error("failed to read {path:?}: {source}")]
  Io {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("dataset file {0:?} not found")]
  MissingFile(PathBuf),
  #[error("{path:?} holds {len} bytes, not a whole number of records")]
  Truncated { path: PathBuf, len: usize },
  #[error("label {label} out of range for {classes} classes")]
  LabelOutOfRange { label: usize, classes: usize },
  #[error("the {0} split holds no images")]
  EmptySplit(&'static str),
}

#[derive(Debug, Error)]
pub enum ReportError {
  #[error("failed to write {path:?}: {source}")]
  Io {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("plotting failed: {0}")]
  Plot(String),
  #[error(transparent)]
  Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum Error {
  #[error(transparent)]
  Config(#[from] ConfigError),
  #[error(transparent)]
  Data(#[from] DataError),
  #[error(transparent)]
  Report(#[from] ReportError),
  #[error("failed to save model: {0}")]
  Record(#[from] burn::record::RecorderError),
}

use std::path::{Path, PathBuf};

use anyhow::Context;
use resnet::{
  model::{Architecture, DataFormat},
  RunConfig,
};
use serde::Deserialize;

/// Run settings. Also defines the config file format (Option fields can be omitted).
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
  /// Networks to train, in order
  pub architectures: Option<Vec<Architecture>>,
  pub epochs: Option<usize>,
  pub batch_size: Option<usize>,
  pub learning_rate: Option<f64>,
  pub seed: Option<u64>,
  pub classes: Option<usize>,
  pub data_format: Option<DataFormat>,
  /// Train on a prefix of the training split
  pub train_limit: Option<usize>,
  pub test_limit: Option<usize>,
  /// Where to write figures and histories, nothing is written when unset
  pub artifacts: Option<PathBuf>,
  /// Whether to also save the trained weights
  pub save_model: Option<bool>,
}

impl AppConfig {
  pub fn from_file(path: &Path) -> anyhow::Result<Self> {
    let content =
      std::fs::read_to_string(path).with_context(|| format!("reading config {:?}", path))?;
    serde_yaml::from_str(&content).with_context(|| format!("parsing config {:?}", path))
  }

  // merge configs where the second overwrites the first
  pub fn merge(self, other: Self) -> Self {
    Self {
      architectures: other.architectures.or(self.architectures),
      epochs: other.epochs.or(self.epochs),
      batch_size: other.batch_size.or(self.batch_size),
      learning_rate: other.learning_rate.or(self.learning_rate),
      seed: other.seed.or(self.seed),
      classes: other.classes.or(self.classes),
      data_format: other.data_format.or(self.data_format),
      train_limit: other.train_limit.or(self.train_limit),
      test_limit: other.test_limit.or(self.test_limit),
      artifacts: other.artifacts.or(self.artifacts),
      save_model: other.save_model.or(self.save_model),
    }
  }

  /// Fills every unset field with its default.
  pub fn resolve(self, data: PathBuf) -> RunConfig {
    let mut run = RunConfig::new(data);
    if let Some(architectures) = self.architectures {
      run.architectures = architectures;
    }
    if let Some(epochs) = self.epochs {
      run.training.epochs = epochs;
    }
    if let Some(batch_size) = self.batch_size {
      run.training.batch_size = batch_size;
    }
    if let Some(learning_rate) = self.learning_rate {
      run.training.learning_rate = learning_rate;
    }
    if let Some(seed) = self.seed {
      run.training.seed = seed;
    }
    if let Some(classes) = self.classes {
      run.classes = classes;
    }
    if let Some(data_format) = self.data_format {
      run.data_format = data_format;
    }
    run.train_limit = self.train_limit;
    run.test_limit = self.test_limit;
    // nothing is written to disk unless a directory is given
    run.artifacts = self.artifacts;
    run.save_model = self.save_model.unwrap_or(false);
    run
  }
}

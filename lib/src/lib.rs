pub mod data;
pub mod error;
pub mod model;
pub mod report;
pub mod utils;

use std::path::PathBuf;

use tracing::info;

pub use error::{ConfigError, DataError, Error, ReportError, Result};
use model::{
  run_model, Architecture, DataFormat, Evaluation, ResNetConfig, TrainBackend, TrainParams,
  TrainingConfig,
};

/// A fully resolved run: which networks to train, on what, and where results go.
#[derive(Debug, Clone)]
pub struct RunConfig {
  /// Directory holding the CIFAR-10 binary batches.
  pub data: PathBuf,
  /// Trained one after the other, sharing only the loaded dataset.
  pub architectures: Vec<Architecture>,
  pub classes: usize,
  pub data_format: DataFormat,
  pub training: TrainingConfig,
  pub train_limit: Option<usize>,
  pub test_limit: Option<usize>,
  pub artifacts: Option<PathBuf>,
  pub save_model: bool,
}

impl RunConfig {
  pub fn new(data: PathBuf) -> Self {
    Self {
      data,
      architectures: Architecture::ALL.to_vec(),
      classes: model::CLASSES,
      data_format: DataFormat::default(),
      training: TrainingConfig::default(),
      train_limit: None,
      test_limit: None,
      artifacts: None,
      save_model: false,
    }
  }

  pub fn model(&self, architecture: Architecture) -> ResNetConfig {
    ResNetConfig::new(architecture)
      .with_classes(self.classes)
      .with_data_format(self.data_format)
      // images are stored channels-last, the model sees them in `data_format` order
      .with_input_shape(
        self.data_format.from_chw(DataFormat::ChannelsLast.to_chw(model::INPUT_SHAPE)),
      )
  }
}

#[tracing::instrument(skip(config), fields(data = ?config.data))]
pub fn main(config: RunConfig) -> Result<Vec<(Architecture, Evaluation)>> {
  info!("Entering main");
  // fail on a bad schedule before spending time on the dataset
  for &architecture in &config.architectures {
    config.model(architecture).plan()?;
  }
  let mut dataset = data::read_dataset(&config.data)?;
  dataset.train = dataset.train.limit(config.train_limit);
  dataset.test = dataset.test.limit(config.test_limit);
  for (name, split) in [("train", &dataset.train), ("test", &dataset.test)] {
    if split.is_empty() {
      return Err(DataError::EmptySplit(name).into());
    }
  }

  let device = Default::default();
  let mut results = Vec::new();
  for &architecture in &config.architectures {
    let trained = run_model::<TrainBackend>(
      TrainParams {
        data: &dataset,
        model: config.model(architecture),
        training: config.training.clone(),
      },
      &device,
    )?;
    report::report(&trained, config.artifacts.as_deref(), config.save_model)?;
    results.push((architecture, trained.evaluation));
  }
  Ok(results)
}

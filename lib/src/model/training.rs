use burn::{
  module::AutodiffModule,
  optim::{AdamConfig, GradientsParams, Optimizer},
  tensor::{
    activation::log_softmax,
    backend::{AutodiffBackend, Backend},
    ElementConversion, Tensor,
  },
};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{ResNet, ResNetConfig};
use crate::{
  data::{Cifar10, Split},
  error::{ConfigError, DataError, Error},
};

/// Fixed schedule of one fit/evaluate cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
  pub epochs: usize,
  pub batch_size: usize,
  pub learning_rate: f64,
  pub seed: u64,
  pub shuffle: bool,
}

impl Default for TrainingConfig {
  fn default() -> Self {
    Self {
      epochs: 80,
      batch_size: 128,
      learning_rate: 1e-3,
      seed: 42,
      shuffle: true,
    }
  }
}

/// Per-epoch metrics, validation computed on the test split.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
  pub loss: Vec<f32>,
  pub accuracy: Vec<f32>,
  pub val_loss: Vec<f32>,
  pub val_accuracy: Vec<f32>,
}

impl History {
  pub fn epochs(&self) -> usize {
    self.loss.len()
  }

  fn push(&mut self, train: Evaluation, valid: Evaluation) {
    self.loss.push(train.loss);
    self.accuracy.push(train.accuracy);
    self.val_loss.push(valid.loss);
    self.val_accuracy.push(valid.accuracy);
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
  pub loss: f32,
  pub accuracy: f32,
}

/// Running sums over batches, weighted by batch size.
#[derive(Default)]
struct Totals {
  loss: f64,
  correct: usize,
  seen: usize,
}

impl Totals {
  fn add(&mut self, loss: f32, correct: usize, size: usize) {
    self.loss += loss as f64 * size as f64;
    self.correct += correct;
    self.seen += size;
  }

  // callers reject empty splits, so `seen` is positive
  fn evaluation(&self) -> Evaluation {
    Evaluation {
      loss: (self.loss / self.seen as f64) as f32,
      accuracy: self.correct as f32 / self.seen as f32,
    }
  }
}

/// Categorical cross-entropy of softmax(`logits`) against one-hot `targets`, averaged over the batch.
pub fn cross_entropy<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 2>) -> Tensor<B, 1> {
  (targets * log_softmax(logits, 1)).sum_dim(1).mean().neg()
}

/// Rows whose highest score matches the one-hot target.
pub fn correct_predictions<B: Backend>(scores: Tensor<B, 2>, targets: Tensor<B, 2>) -> usize {
  let hits = scores
    .argmax(1)
    .equal(targets.argmax(1))
    .int()
    .sum()
    .into_scalar();
  hits.elem::<i64>() as usize
}

/// Loss and accuracy of `model` over `split`, in batches of `batch_size`.
pub fn evaluate<B: Backend>(
  model: &ResNet<B>,
  split: &Split,
  batch_size: usize,
  device: &B::Device,
) -> Result<Evaluation, Error> {
  if batch_size == 0 {
    return Err(ConfigError::InvalidBatchSize.into());
  }
  if split.is_empty() {
    return Err(DataError::EmptySplit("evaluation").into());
  }
  let indices: Vec<usize> = (0..split.len()).collect();
  let mut totals = Totals::default();
  for chunk in indices.chunks(batch_size) {
    let (images, targets) = split.batch::<B>(chunk, model.classes(), model.data_format(), device)?;
    let logits = model.forward_logits(images);
    let correct = correct_predictions(logits.clone(), targets.clone());
    let loss = cross_entropy(logits, targets).into_scalar().elem::<f32>();
    totals.add(loss, correct, chunk.len());
  }
  Ok(totals.evaluation())
}

/// Adam on categorical cross-entropy for `config.epochs` epochs, validating on the test split after each.
pub fn fit<B: AutodiffBackend>(
  mut model: ResNet<B>,
  data: &Cifar10,
  config: &TrainingConfig,
  device: &B::Device,
) -> Result<(ResNet<B>, History), Error> {
  if config.batch_size == 0 {
    return Err(ConfigError::InvalidBatchSize.into());
  }
  if data.train.is_empty() {
    return Err(DataError::EmptySplit("train").into());
  }
  if data.test.is_empty() {
    return Err(DataError::EmptySplit("test").into());
  }
  let mut optim = AdamConfig::new()
    .with_beta_1(0.9)
    .with_beta_2(0.999)
    .with_epsilon(1e-7)
    .init::<B, ResNet<B>>();
  let mut rng = StdRng::seed_from_u64(config.seed);
  let mut indices: Vec<usize> = (0..data.train.len()).collect();
  let mut history = History::default();
  let mut loss_avg = ExponentialAverage::new(0.0);

  let start = std::time::Instant::now();
  let mut iter = 0usize;
  for epoch in 0..config.epochs {
    if config.shuffle {
      indices.shuffle(&mut rng);
    }
    let mut totals = Totals::default();
    for chunk in indices.chunks(config.batch_size) {
      let (images, targets) =
        data.train.batch::<B>(chunk, model.classes(), model.data_format(), device)?;
      let logits = model.forward_logits(images);
      let correct = correct_predictions(logits.clone(), targets.clone());
      let loss = cross_entropy(logits, targets);
      let loss_value = loss.clone().into_scalar().elem::<f32>();

      let grads = GradientsParams::from_grads(loss.backward(), &model);
      model = optim.step(config.learning_rate, model, grads);

      totals.add(loss_value, correct, chunk.len());
      loss_avg.update(loss_value);
      iter += 1;
      if iter % 50 == 0 {
        debug!("iter {iter}: smoothed loss {:.4}", loss_avg.value);
      }
    }

    let train = totals.evaluation();
    let valid = evaluate(&model.valid(), &data.test, config.batch_size, device)?;
    info!(
      "epoch {}/{}: loss {:.4}, accuracy {:.4}, val_loss {:.4}, val_accuracy {:.4}",
      epoch + 1,
      config.epochs,
      train.loss,
      train.accuracy,
      valid.loss,
      valid.accuracy
    );
    history.push(train, valid);
  }

  if iter > 0 {
    info!("Finished in {iter} iterations");
    info!(
      "Took {:.2}s, {:.2}ms / iter",
      start.elapsed().as_secs_f32(),
      start.elapsed().as_secs_f64() * 1000.0 / iter as f64
    );
  }
  Ok((model, history))
}

/// One complete run for a single topology.
pub struct TrainParams<'a> {
  pub data: &'a Cifar10,
  pub model: ResNetConfig,
  pub training: TrainingConfig,
}

/// Trained weights (without autodiff) and what the run measured.
pub struct TrainedModel<B: Backend> {
  pub model: ResNet<B>,
  pub history: History,
  pub evaluation: Evaluation,
}

/// Builds the model, fits it, evaluates it on the test split.
#[tracing::instrument(skip(params, device), fields(architecture = %params.model.architecture))]
pub fn run_model<B: AutodiffBackend>(
  params: TrainParams,
  device: &B::Device,
) -> Result<TrainedModel<B::InnerBackend>, Error> {
  B::seed(params.training.seed);
  let model = params.model.init::<B>(device)?;
  info!(
    "training {} ({} weighted layers) on {} images",
    model.name(),
    model.weighted_layers(),
    params.data.train.len()
  );
  let (model, history) = fit(model, params.data, &params.training, device)?;
  let model = model.valid();
  let evaluation = evaluate(&model, &params.data.test, params.training.batch_size, device)?;
  Ok(TrainedModel {
    model,
    history,
    evaluation,
  })
}

pub struct ExponentialAverage {
  beta: f32,
  moment: f32,
  pub value: f32,
  t: i32,
}

impl ExponentialAverage {
  pub fn new(initial: f32) -> Self {
    ExponentialAverage {
      beta: 0.98,
      moment: 0.,
      value: initial,
      t: 0,
    }
  }

  pub fn update(&mut self, value: f32) {
    self.t += 1;
    self.moment = self.beta * self.moment + (1. - self.beta) * value;
    // bias correction
    self.value = self.moment / (1. - f32::powi(self.beta, self.t));
  }
}

#[cfg(test)]
mod tests {
  use burn::{
    backend::{Autodiff, NdArray},
    tensor::TensorData,
  };
  use proptest::prelude::*;

  use super::*;
  use crate::model::{Architecture, DataFormat};

  type B = NdArray<f32>;
  type AB = Autodiff<B>;

  /// Two classes that differ only in brightness.
  fn toy_split(n: usize) -> Split {
    let shape = [8, 8, 3];
    let mut images = Vec::new();
    let mut labels = Vec::new();
    for i in 0..n {
      let label = (i % 2) as u8;
      images.extend(std::iter::repeat(if label == 0 { 20 } else { 230 }).take(8 * 8 * 3));
      labels.push(label);
    }
    Split::new(images, labels, shape)
  }

  fn toy_data() -> Cifar10 {
    Cifar10 {
      train: toy_split(12),
      test: toy_split(6),
    }
  }

  fn toy_model() -> ResNetConfig {
    ResNetConfig::new(Architecture::Basic)
      .with_input_shape([8, 8, 3])
      .with_classes(2)
      .with_data_format(DataFormat::ChannelsLast)
  }

  #[test]
  fn test_cross_entropy_of_confident_prediction() {
    let device = Default::default();
    let logits = Tensor::<B, 2>::from_data(TensorData::new(vec![10.0f32, -10.0, -10.0, 10.0], [2, 2]), &device);
    let targets = Tensor::<B, 2>::from_data(TensorData::new(vec![1.0f32, 0.0, 0.0, 1.0], [2, 2]), &device);
    let loss = cross_entropy(logits.clone(), targets.clone()).into_scalar();
    assert!(loss < 1e-6);
    assert_eq!(correct_predictions(logits, targets), 2);

    let uniform = Tensor::<B, 2>::zeros([1, 4], &device);
    let target = Tensor::<B, 2>::from_data(TensorData::new(vec![0.0f32, 0.0, 1.0, 0.0], [1, 4]), &device);
    let loss = cross_entropy(uniform, target).into_scalar();
    assert!((loss - 4f32.ln()).abs() < 1e-5);
  }

  #[test]
  fn test_fit_records_every_epoch() {
    let scope = crate::utils::init_logging_tests();
    let device = Default::default();
    let data = toy_data();
    let training = TrainingConfig {
      epochs: 2,
      batch_size: 4,
      ..TrainingConfig::default()
    };
    let trained = run_model::<AB>(
      TrainParams {
        data: &data,
        model: toy_model(),
        training,
      },
      &device,
    )
    .unwrap();
    assert_eq!(trained.history.epochs(), 2);
    assert_eq!(trained.history.val_accuracy.len(), 2);
    let h = &trained.history;
    for v in h.loss.iter().chain(&h.val_loss).chain(&h.accuracy).chain(&h.val_accuracy) {
      assert!(v.is_finite());
    }
    assert!((0.0..=1.0).contains(&trained.evaluation.accuracy));
    assert!(trained.evaluation.loss.is_finite());
    drop(scope);
  }

  #[test]
  fn test_zero_batch_size_is_rejected() {
    let device = Default::default();
    let data = toy_data();
    let model = toy_model().init::<AB>(&device).unwrap();
    let training = TrainingConfig {
      batch_size: 0,
      ..TrainingConfig::default()
    };
    assert!(matches!(
      fit(model, &data, &training, &device),
      Err(Error::Config(ConfigError::InvalidBatchSize))
    ));
  }

  #[test]
  fn test_empty_splits_are_rejected() {
    let device = Default::default();
    let training = TrainingConfig {
      epochs: 1,
      batch_size: 4,
      ..TrainingConfig::default()
    };
    let no_test = Cifar10 {
      train: toy_split(4),
      test: toy_split(0),
    };
    let model = toy_model().init::<AB>(&device).unwrap();
    assert!(matches!(
      fit(model, &no_test, &training, &device),
      Err(Error::Data(DataError::EmptySplit("test")))
    ));
    let no_train = Cifar10 {
      train: toy_split(0),
      test: toy_split(4),
    };
    let model = toy_model().init::<AB>(&device).unwrap();
    assert!(matches!(
      fit(model, &no_train, &training, &device),
      Err(Error::Data(DataError::EmptySplit("train")))
    ));
    let model = toy_model().init::<B>(&device).unwrap();
    assert!(matches!(
      evaluate(&model, &toy_split(0), 4, &device),
      Err(Error::Data(DataError::EmptySplit(_)))
    ));
  }

  proptest! {
    #[test]
    fn test_exponential_average_of_constant(c in -100.0f32..100.0, n in 1usize..200) {
      let scope = crate::utils::init_logging_tests();
      let mut avg = ExponentialAverage::new(0.0);
      for _ in 0..n {
        avg.update(c);
      }
      prop_assert!((avg.value - c).abs() <= 1e-3 * c.abs().max(1.0));
      drop(scope);
    }
  }
}

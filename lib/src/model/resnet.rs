use std::fmt;

use burn::{
  module::{Ignored, Module},
  nn::{
    pool::{AvgPool2d, AvgPool2dConfig},
    Linear, LinearConfig,
  },
  tensor::{
    activation::{relu, softmax},
    backend::Backend,
    Tensor,
  },
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
  block::glorot, Architecture, BlockKind, ConvBn, DataFormat, ResidualBlock, CLASSES, INPUT_SHAPE,
  STEM_FILTERS,
};
use crate::error::ConfigError;

const POOL: usize = 2;

/// Everything needed to build a [`ResNet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResNetConfig {
  pub architecture: Architecture,
  /// Per-image shape in `data_format` order.
  pub input_shape: [usize; 3],
  pub classes: usize,
  pub data_format: DataFormat,
}

impl ResNetConfig {
  pub fn new(architecture: Architecture) -> Self {
    Self {
      architecture,
      input_shape: INPUT_SHAPE,
      classes: CLASSES,
      data_format: DataFormat::default(),
    }
  }

  pub fn with_input_shape(self, input_shape: [usize; 3]) -> Self {
    Self {
      input_shape,
      ..self
    }
  }

  pub fn with_classes(self, classes: usize) -> Self {
    Self { classes, ..self }
  }

  pub fn with_data_format(self, data_format: DataFormat) -> Self {
    Self {
      data_format,
      ..self
    }
  }

  /// Static shape inference through the whole network, without allocating any tensor.
  pub fn plan(&self) -> Result<ShapePlan, ConfigError> {
    if self.classes == 0 {
      return Err(ConfigError::InvalidClasses(self.classes));
    }
    let input = self.data_format.to_chw(self.input_shape);
    if input.iter().any(|d| *d == 0) {
      return Err(ConfigError::InvalidInputShape {
        shape: self.input_shape,
        reason: "dimensions must be positive",
      });
    }
    let stem = [STEM_FILTERS, input[1], input[2]];
    let mut current = stem;
    let mut blocks = Vec::new();
    for kind in self.architecture.blocks() {
      let output = kind.output_shape(current)?;
      blocks.push(BlockShape {
        kind,
        input: current,
        output,
        pad: kind.shortcut_pad(current[0])?,
      });
      current = output;
    }
    let pooled = [current[0], current[1] / POOL, current[2] / POOL];
    if pooled[1] == 0 || pooled[2] == 0 {
      return Err(ConfigError::InvalidInputShape {
        shape: self.input_shape,
        reason: "too small for the final average pool",
      });
    }
    Ok(ShapePlan {
      input,
      stem,
      blocks,
      pooled,
      classes: self.classes,
    })
  }

  /// Builds the network: stem, one residual block per schedule entry, pooling, dense head.
  pub fn init<B: Backend>(&self, device: &B::Device) -> Result<ResNet<B>, ConfigError> {
    let plan = self.plan()?;
    let stem = ConvBn::padded3x3([plan.input[0], STEM_FILTERS], 1, device);
    let blocks = plan
      .blocks
      .iter()
      .map(|shape| ResidualBlock::new(shape.kind, shape.input[0], device))
      .collect::<Result<Vec<_>, _>>()?;
    let head = LinearConfig::new(plan.features(), self.classes)
      .with_initializer(glorot())
      .init(device);
    debug!(
      "built {} with {} residual blocks, {} features into the head",
      self.architecture,
      blocks.len(),
      plan.features()
    );
    Ok(ResNet {
      stem,
      blocks,
      pool: AvgPool2dConfig::new([POOL, POOL]).init(),
      head,
      classes: self.classes,
      architecture: Ignored(self.architecture),
      data_format: Ignored(self.data_format),
    })
  }
}

#[derive(Module, Debug)]
pub struct ResNet<B: Backend> {
  stem: ConvBn<B>,
  blocks: Vec<ResidualBlock<B>>,
  pool: AvgPool2d,
  head: Linear<B>,
  classes: usize,
  architecture: Ignored<Architecture>,
  data_format: Ignored<DataFormat>,
}

impl<B: Backend> ResNet<B> {
  /// `ResNet32` or `ResNet50`.
  pub fn name(&self) -> &'static str {
    self.architecture.name()
  }

  pub fn architecture(&self) -> Architecture {
    *self.architecture
  }

  pub fn classes(&self) -> usize {
    self.classes
  }

  pub fn data_format(&self) -> DataFormat {
    *self.data_format
  }

  pub fn blocks(&self) -> &[ResidualBlock<B>] {
    &self.blocks
  }

  pub fn num_blocks(&self) -> usize {
    self.blocks.len()
  }

  pub fn count_blocks(&self, predicate: impl Fn(&BlockKind) -> bool) -> usize {
    self.blocks.iter().filter(|b| predicate(&b.kind())).count()
  }

  /// Convolutions and dense layers: the stem, every block's main path, the head.
  pub fn weighted_layers(&self) -> usize {
    1 + self
      .blocks
      .iter()
      .map(|b| b.kind().weighted_layers())
      .sum::<usize>()
      + 1
  }

  /// Unnormalized class scores, shape (N, classes).
  pub fn forward_logits(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
    let x = match *self.data_format {
      DataFormat::ChannelsLast => images.permute([0, 3, 1, 2]),
      DataFormat::ChannelsFirst => images,
    };
    let mut x = relu(self.stem.forward(x));
    for block in &self.blocks {
      x = block.forward(x);
    }
    let x = self.pool.forward(x);
    self.head.forward(x.flatten::<2>(1, 3))
  }

  /// Class probabilities, each row sums to one.
  pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
    softmax(self.forward_logits(images), 1)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockShape {
  pub kind: BlockKind,
  /// (channels, height, width)
  pub input: [usize; 3],
  pub output: [usize; 3],
  pub pad: usize,
}

/// Shapes at every stage of a network, in (channels, height, width).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapePlan {
  pub input: [usize; 3],
  pub stem: [usize; 3],
  pub blocks: Vec<BlockShape>,
  pub pooled: [usize; 3],
  pub classes: usize,
}

impl ShapePlan {
  /// Width of the flattened pooled feature map.
  pub fn features(&self) -> usize {
    self.pooled.iter().product()
  }
}

/// Printable description of a built model.
pub struct ModelSummary {
  pub name: &'static str,
  pub plan: ShapePlan,
  pub weighted_layers: usize,
  pub num_params: usize,
}

impl ModelSummary {
  pub fn new<B: Backend>(config: &ResNetConfig, model: &ResNet<B>) -> Result<Self, ConfigError> {
    Ok(Self {
      name: model.name(),
      plan: config.plan()?,
      weighted_layers: model.weighted_layers(),
      num_params: model.num_params(),
    })
  }
}

impl fmt::Display for ModelSummary {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(f, "{}", self.name)?;
    writeln!(f, "  input            {:?}", self.plan.input)?;
    writeln!(f, "  stem             {:?}", self.plan.stem)?;
    for (i, block) in self.plan.blocks.iter().enumerate() {
      writeln!(
        f,
        "  {:>2} {:<36} {:?} -> {:?} pad {}",
        i, block.kind.to_string(), block.input, block.output, block.pad
      )?;
    }
    writeln!(f, "  avg pool         {:?}", self.plan.pooled)?;
    writeln!(f, "  dense            {} -> {}", self.plan.features(), self.plan.classes)?;
    writeln!(f, "  weighted layers  {}", self.weighted_layers)?;
    write!(f, "  parameters       {}", self.num_params)
  }
}

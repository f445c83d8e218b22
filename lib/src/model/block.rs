use burn::{
  module::{Ignored, Module},
  nn::{
    conv::{Conv2d, Conv2dConfig},
    BatchNorm, BatchNormConfig, Initializer, PaddingConfig2d,
  },
  tensor::{activation::relu, backend::Backend, Tensor},
};

use super::BlockKind;
use crate::error::ConfigError;

/// Glorot uniform, used for every convolution and dense kernel.
pub(crate) fn glorot() -> Initializer {
  Initializer::XavierUniform { gain: 1.0 }
}

/// Convolution followed by batch normalization over the channel axis.
#[derive(Module, Debug)]
pub struct ConvBn<B: Backend> {
  conv: Conv2d<B>,
  norm: BatchNorm<B, 2>,
}

impl<B: Backend> ConvBn<B> {
  pub fn new(
    channels: [usize; 2],
    kernel: usize,
    stride: usize,
    padding: PaddingConfig2d,
    device: &B::Device,
  ) -> Self {
    let conv = Conv2dConfig::new(channels, [kernel, kernel])
      .with_stride([stride, stride])
      .with_padding(padding)
      .with_initializer(glorot())
      .init(device);
    // keras defaults: epsilon 1e-3, moving average decay 0.99
    let norm = BatchNormConfig::new(channels[1])
      .with_epsilon(1e-3)
      .with_momentum(0.01)
      .init(device);
    Self { conv, norm }
  }

  /// 3x3 convolution with one pixel of zero padding.
  pub fn padded3x3(channels: [usize; 2], stride: usize, device: &B::Device) -> Self {
    Self::new(channels, 3, stride, PaddingConfig2d::Explicit(1, 1), device)
  }

  pub fn pointwise(channels: [usize; 2], stride: usize, device: &B::Device) -> Self {
    Self::new(channels, 1, stride, PaddingConfig2d::Valid, device)
  }

  pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
    self.norm.forward(self.conv.forward(x))
  }
}

/// Parameter-free shortcut: optional top-left crop to half the spatial size, then `pad`
/// zero channels on each side. Expects NCHW.
pub fn shortcut<B: Backend>(x: Tensor<B, 4>, crop: bool, pad: usize) -> Tensor<B, 4> {
  let x = if crop {
    let [n, c, h, w] = x.dims();
    x.slice([0..n, 0..c, 0..h / 2, 0..w / 2])
  } else {
    x
  };
  if pad == 0 {
    return x;
  }
  let [n, _, h, w] = x.dims();
  let zeros = Tensor::<B, 4>::zeros([n, pad, h, w], &x.device());
  Tensor::cat(vec![zeros.clone(), x, zeros], 1)
}

/// Two padded 3x3 convolutions. Covers both the identity and the downsampling block.
#[derive(Module, Debug)]
pub struct BasicBlock<B: Backend> {
  conv1: ConvBn<B>,
  conv2: ConvBn<B>,
  kind: Ignored<BlockKind>,
  pad: usize,
}

impl<B: Backend> BasicBlock<B> {
  pub fn new(kind: BlockKind, in_channels: usize, device: &B::Device) -> Result<Self, ConfigError> {
    let pad = kind.shortcut_pad(in_channels)?;
    let filters = kind.out_channels();
    Ok(Self {
      conv1: ConvBn::padded3x3([in_channels, filters], kind.stride(), device),
      conv2: ConvBn::padded3x3([filters, filters], 1, device),
      kind: Ignored(kind),
      pad,
    })
  }

  pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
    let residual = shortcut(x.clone(), self.kind.crops(), self.pad);
    let x = relu(self.conv1.forward(x));
    let x = self.conv2.forward(x);
    relu(x + residual)
  }
}

/// 1x1 reduce, 3x3 transform, 1x1 expand.
#[derive(Module, Debug)]
pub struct BottleneckBlock<B: Backend> {
  reduce: ConvBn<B>,
  transform: ConvBn<B>,
  expand: ConvBn<B>,
  kind: Ignored<BlockKind>,
  pad: usize,
}

impl<B: Backend> BottleneckBlock<B> {
  pub fn new(
    kind: BlockKind,
    [f1, f2, f3]: [usize; 3],
    in_channels: usize,
    device: &B::Device,
  ) -> Result<Self, ConfigError> {
    let pad = kind.shortcut_pad(in_channels)?;
    Ok(Self {
      reduce: ConvBn::pointwise([in_channels, f1], kind.stride(), device),
      transform: ConvBn::padded3x3([f1, f2], 1, device),
      expand: ConvBn::pointwise([f2, f3], 1, device),
      kind: Ignored(kind),
      pad,
    })
  }

  pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
    let residual = shortcut(x.clone(), self.kind.crops(), self.pad);
    let x = relu(self.reduce.forward(x));
    let x = relu(self.transform.forward(x));
    let x = self.expand.forward(x);
    relu(x + residual)
  }
}

#[derive(Module, Debug)]
pub enum ResidualBlock<B: Backend> {
  Basic(BasicBlock<B>),
  Bottleneck(BottleneckBlock<B>),
}

impl<B: Backend> ResidualBlock<B> {
  /// Builds the block described by `kind` for an input with `in_channels` channels.
  pub fn new(kind: BlockKind, in_channels: usize, device: &B::Device) -> Result<Self, ConfigError> {
    match kind {
      BlockKind::Identity { .. } | BlockKind::Downsampling { .. } => {
        BasicBlock::new(kind, in_channels, device).map(ResidualBlock::Basic)
      }
      BlockKind::BottleneckIdentity { filters }
      | BlockKind::BottleneckDownsampling { filters, .. } => {
        BottleneckBlock::new(kind, filters, in_channels, device).map(ResidualBlock::Bottleneck)
      }
    }
  }

  pub fn kind(&self) -> BlockKind {
    match self {
      ResidualBlock::Basic(block) => block.kind.0,
      ResidualBlock::Bottleneck(block) => block.kind.0,
    }
  }

  /// Zero channels added on each side of the shortcut.
  pub fn pad(&self) -> usize {
    match self {
      ResidualBlock::Basic(block) => block.pad,
      ResidualBlock::Bottleneck(block) => block.pad,
    }
  }

  pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
    match self {
      ResidualBlock::Basic(block) => block.forward(x),
      ResidualBlock::Bottleneck(block) => block.forward(x),
    }
  }
}

use std::{fmt, str::FromStr};

use itertools::repeat_n;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// CIFAR-10 images as delivered by the loader: height, width, channels.
pub const INPUT_SHAPE: [usize; 3] = [32, 32, 3];
pub const CLASSES: usize = 10;

/// Memory layout of image batches. Passed explicitly to model construction and batching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataFormat {
  /// (N, H, W, C)
  #[default]
  #[serde(alias = "nhwc")]
  ChannelsLast,
  /// (N, C, H, W)
  #[serde(alias = "nchw")]
  ChannelsFirst,
}

impl DataFormat {
  /// Reorders a per-image shape given in this layout into (channels, height, width).
  pub fn to_chw(self, shape: [usize; 3]) -> [usize; 3] {
    match self {
      DataFormat::ChannelsLast => [shape[2], shape[0], shape[1]],
      DataFormat::ChannelsFirst => shape,
    }
  }

  /// Inverse of [`DataFormat::to_chw`].
  pub fn from_chw(self, [c, h, w]: [usize; 3]) -> [usize; 3] {
    match self {
      DataFormat::ChannelsLast => [h, w, c],
      DataFormat::ChannelsFirst => [c, h, w],
    }
  }
}

impl FromStr for DataFormat {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "channels_last" | "nhwc" => Ok(DataFormat::ChannelsLast),
      "channels_first" | "nchw" => Ok(DataFormat::ChannelsFirst),
      _ => Err(ConfigError::UnknownDataFormat(s.to_string())),
    }
  }
}

/// The two network topologies. Selection is exhaustive: unknown names fail to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
  /// 32 weighted layers of basic residual blocks.
  #[serde(alias = "resnet32")]
  Basic,
  /// 50 weighted layers of bottleneck residual blocks.
  #[serde(alias = "resnet50")]
  Bottleneck,
}

impl Architecture {
  pub const ALL: [Architecture; 2] = [Architecture::Basic, Architecture::Bottleneck];

  pub fn name(self) -> &'static str {
    match self {
      Architecture::Basic => "ResNet32",
      Architecture::Bottleneck => "ResNet50",
    }
  }

  pub fn schedule(self) -> &'static [Stage] {
    match self {
      Architecture::Basic => BASIC_SCHEDULE,
      Architecture::Bottleneck => BOTTLENECK_SCHEDULE,
    }
  }

  /// The schedule unrolled into one entry per residual block.
  pub fn blocks(self) -> impl Iterator<Item = BlockKind> {
    self
      .schedule()
      .iter()
      .flat_map(|stage| repeat_n(stage.block, stage.repeats))
  }
}

impl fmt::Display for Architecture {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

impl FromStr for Architecture {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "basic" | "resnet32" => Ok(Architecture::Basic),
      "bottleneck" | "resnet50" => Ok(Architecture::Bottleneck),
      _ => Err(ConfigError::UnknownArchitecture(s.to_string())),
    }
  }
}

/// One residual block, described by its filter counts.
/// Shortcut padding is never given here, it is derived from the input channel count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKind {
  Identity { filters: usize },
  Downsampling { filters: usize },
  BottleneckIdentity { filters: [usize; 3] },
  BottleneckDownsampling { filters: [usize; 3], stride: usize },
}

impl BlockKind {
  pub fn out_channels(&self) -> usize {
    match *self {
      BlockKind::Identity { filters } | BlockKind::Downsampling { filters } => filters,
      BlockKind::BottleneckIdentity { filters }
      | BlockKind::BottleneckDownsampling { filters, .. } => filters[2],
    }
  }

  /// Stride of the first convolution on the main path.
  pub fn stride(&self) -> usize {
    match *self {
      BlockKind::Identity { .. } | BlockKind::BottleneckIdentity { .. } => 1,
      BlockKind::Downsampling { .. } => 2,
      BlockKind::BottleneckDownsampling { stride, .. } => stride,
    }
  }

  /// Whether the shortcut is cropped to the top-left half of the feature map.
  pub fn crops(&self) -> bool {
    self.stride() == 2
  }

  pub fn is_bottleneck(&self) -> bool {
    matches!(
      self,
      BlockKind::BottleneckIdentity { .. } | BlockKind::BottleneckDownsampling { .. }
    )
  }

  pub fn is_identity(&self) -> bool {
    matches!(
      self,
      BlockKind::Identity { .. } | BlockKind::BottleneckIdentity { .. }
    )
  }

  /// Convolutions on the main path.
  pub fn weighted_layers(&self) -> usize {
    if self.is_bottleneck() {
      3
    } else {
      2
    }
  }

  /// Number of zero channels added on each side of the shortcut for an input with
  /// `in_channels` channels. Identity blocks pass the shortcut through untouched and
  /// therefore require `in_channels == out_channels`.
  pub fn shortcut_pad(&self, in_channels: usize) -> Result<usize, ConfigError> {
    let out_channels = self.out_channels();
    match *self {
      BlockKind::Identity { .. } | BlockKind::BottleneckIdentity { .. } => {
        if in_channels == out_channels {
          Ok(0)
        } else {
          Err(ConfigError::ChannelMismatch {
            expected: out_channels,
            found: in_channels,
          })
        }
      }
      BlockKind::BottleneckDownsampling { stride, .. } if stride != 1 && stride != 2 => {
        Err(ConfigError::InvalidStride(stride))
      }
      BlockKind::Downsampling { .. } | BlockKind::BottleneckDownsampling { .. } => {
        derive_pad(in_channels, out_channels)
      }
    }
  }

  /// Static shape inference over (channels, height, width).
  pub fn output_shape(&self, [c, h, w]: [usize; 3]) -> Result<[usize; 3], ConfigError> {
    self.shortcut_pad(c)?;
    if h == 0 || w == 0 {
      return Err(ConfigError::InvalidInputShape {
        shape: [c, h, w],
        reason: "empty feature map",
      });
    }
    if !self.crops() {
      return Ok([self.out_channels(), h, w]);
    }
    // a stride 2 convolution keeps ceil(h / 2) rows while the cropped shortcut keeps floor(h / 2)
    if h % 2 != 0 || w % 2 != 0 {
      return Err(ConfigError::InvalidInputShape {
        shape: [c, h, w],
        reason: "downsampling needs even spatial dimensions",
      });
    }
    Ok([self.out_channels(), h / 2, w / 2])
  }
}

impl fmt::Display for BlockKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      BlockKind::Identity { filters } => write!(f, "identity({filters})"),
      BlockKind::Downsampling { filters } => write!(f, "downsampling({filters})"),
      BlockKind::BottleneckIdentity { filters } => write!(f, "bottleneck_identity{filters:?}"),
      BlockKind::BottleneckDownsampling { filters, stride } => {
        write!(f, "bottleneck_downsampling{filters:?}, s={stride}")
      }
    }
  }
}

/// Symmetric zero padding that lifts `input` shortcut channels to `output`.
pub fn derive_pad(input: usize, output: usize) -> Result<usize, ConfigError> {
  match output.checked_sub(input) {
    Some(diff) if diff % 2 == 0 => Ok(diff / 2),
    _ => Err(ConfigError::IncompatibleShortcut { input, output }),
  }
}

/// `repeats` consecutive copies of the same block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
  pub block: BlockKind,
  pub repeats: usize,
}

const fn stage(block: BlockKind, repeats: usize) -> Stage {
  Stage { block, repeats }
}

/// Output channels of the stem convolution.
pub const STEM_FILTERS: usize = 16;

const BASIC_SCHEDULE: &[Stage] = &[
  stage(BlockKind::Identity { filters: 16 }, 5),
  stage(BlockKind::Downsampling { filters: 32 }, 1),
  stage(BlockKind::Identity { filters: 32 }, 4),
  stage(BlockKind::Downsampling { filters: 64 }, 1),
  stage(BlockKind::Identity { filters: 64 }, 4),
];

const BOTTLENECK_SCHEDULE: &[Stage] = &[
  stage(
    BlockKind::BottleneckDownsampling {
      filters: [16, 16, 64],
      stride: 1,
    },
    1,
  ),
  stage(
    BlockKind::BottleneckIdentity {
      filters: [16, 16, 64],
    },
    2,
  ),
  stage(
    BlockKind::BottleneckDownsampling {
      filters: [32, 32, 128],
      stride: 2,
    },
    1,
  ),
  stage(
    BlockKind::BottleneckIdentity {
      filters: [32, 32, 128],
    },
    3,
  ),
  stage(
    BlockKind::BottleneckDownsampling {
      filters: [64, 64, 256],
      stride: 2,
    },
    1,
  ),
  stage(
    BlockKind::BottleneckIdentity {
      filters: [64, 64, 256],
    },
    5,
  ),
  stage(
    BlockKind::BottleneckDownsampling {
      filters: [128, 128, 512],
      stride: 2,
    },
    1,
  ),
  stage(
    BlockKind::BottleneckIdentity {
      filters: [128, 128, 512],
    },
    2,
  ),
];

#[cfg(test)]
mod tests {
  use proptest::prelude::*;

  use super::*;

  /// Walks a schedule from the stem and returns every derived shortcut pad.
  fn pads(arch: Architecture) -> Vec<usize> {
    let mut channels = STEM_FILTERS;
    arch
      .blocks()
      .map(|block| {
        let pad = block.shortcut_pad(channels).unwrap();
        assert_eq!(channels + 2 * pad, block.out_channels(), "{block}");
        channels = block.out_channels();
        pad
      })
      .collect()
  }

  #[test]
  fn test_config_names_match_parser() {
    for name in ["basic", "resnet32", "bottleneck", "resnet50"] {
      let parsed = name.parse::<Architecture>().unwrap();
      let deserialized: Architecture = serde_json::from_str(&format!("\"{name}\"")).unwrap();
      assert_eq!(parsed, deserialized);
    }
    for name in ["channels_last", "nhwc", "channels_first", "nchw"] {
      let parsed = name.parse::<DataFormat>().unwrap();
      let deserialized: DataFormat = serde_json::from_str(&format!("\"{name}\"")).unwrap();
      assert_eq!(parsed, deserialized);
    }
    assert!(serde_json::from_str::<Architecture>("\"resnet101\"").is_err());
  }

  #[test]
  fn test_derived_pads() {
    let basic: Vec<_> = pads(Architecture::Basic).into_iter().filter(|p| *p > 0).collect();
    assert_eq!(basic, vec![8, 16]);
    let bottleneck: Vec<_> = pads(Architecture::Bottleneck)
      .into_iter()
      .filter(|p| *p > 0)
      .collect();
    assert_eq!(bottleneck, vec![24, 32, 64, 128]);
  }

  #[test]
  fn test_block_counts() {
    let basic: Vec<_> = Architecture::Basic.blocks().collect();
    assert_eq!(basic.len(), 15);
    assert_eq!(basic.iter().filter(|b| b.is_identity()).count(), 13);
    assert_eq!(basic.iter().filter(|b| !b.is_identity()).count(), 2);

    let bottleneck: Vec<_> = Architecture::Bottleneck.blocks().collect();
    assert_eq!(bottleneck.len(), 16);
    assert!(bottleneck.iter().all(|b| b.is_bottleneck()));
  }

  #[test]
  fn test_selector() {
    assert_eq!("basic".parse::<Architecture>(), Ok(Architecture::Basic));
    assert_eq!("Bottleneck".parse::<Architecture>(), Ok(Architecture::Bottleneck));
    assert_eq!(
      "resnet101".parse::<Architecture>(),
      Err(ConfigError::UnknownArchitecture("resnet101".to_string()))
    );
    assert!("".parse::<Architecture>().is_err());
    assert_eq!("channels_first".parse::<DataFormat>(), Ok(DataFormat::ChannelsFirst));
    assert!("nwhc".parse::<DataFormat>().is_err());
  }

  #[test]
  fn test_invalid_blocks() {
    let identity = BlockKind::Identity { filters: 32 };
    assert_eq!(
      identity.shortcut_pad(16),
      Err(ConfigError::ChannelMismatch {
        expected: 32,
        found: 16
      })
    );
    let odd = BlockKind::Downsampling { filters: 33 };
    assert_eq!(
      odd.shortcut_pad(16),
      Err(ConfigError::IncompatibleShortcut {
        input: 16,
        output: 33
      })
    );
    let shrinking = BlockKind::Downsampling { filters: 8 };
    assert!(shrinking.shortcut_pad(16).is_err());
    let stride = BlockKind::BottleneckDownsampling {
      filters: [8, 8, 32],
      stride: 3,
    };
    assert_eq!(stride.shortcut_pad(16), Err(ConfigError::InvalidStride(3)));
    assert!(BlockKind::Downsampling { filters: 32 }
      .output_shape([16, 7, 8])
      .is_err());
  }

  #[test]
  fn test_data_format_shapes() {
    assert_eq!(DataFormat::ChannelsLast.to_chw(INPUT_SHAPE), [3, 32, 32]);
    assert_eq!(DataFormat::ChannelsFirst.to_chw([3, 32, 32]), [3, 32, 32]);
    assert_eq!(DataFormat::ChannelsLast.from_chw([3, 32, 32]), INPUT_SHAPE);
  }

  proptest! {
    #[test]
    fn test_basic_output_shapes(c in 1usize..64, extra in 0usize..32, h in 1usize..20, w in 1usize..20) {
      let scope = crate::utils::init_logging_tests();
      let identity = BlockKind::Identity { filters: c };
      prop_assert_eq!(identity.output_shape([c, h, w]), Ok([c, h, w]));

      let filters = c + 2 * extra;
      let down = BlockKind::Downsampling { filters };
      let (h, w) = (2 * h, 2 * w);
      prop_assert_eq!(down.output_shape([c, h, w]), Ok([filters, h / 2, w / 2]));
      drop(scope);
    }

    #[test]
    fn test_bottleneck_output_shapes(
      f1 in 1usize..32, f2 in 1usize..32, c in 1usize..64, extra in 0usize..32,
      stride in 1usize..=2, h in 1usize..20, w in 1usize..20,
    ) {
      let scope = crate::utils::init_logging_tests();
      let f3 = c + 2 * extra;
      let identity = BlockKind::BottleneckIdentity { filters: [f1, f2, f3] };
      prop_assert_eq!(identity.output_shape([f3, h, w]), Ok([f3, h, w]));

      let down = BlockKind::BottleneckDownsampling { filters: [f1, f2, f3], stride };
      let (h, w) = (2 * h, 2 * w);
      prop_assert_eq!(down.output_shape([c, h, w]), Ok([f3, h / stride, w / stride]));
      prop_assert_eq!(down.shortcut_pad(c), Ok(extra));
      drop(scope);
    }
  }
}

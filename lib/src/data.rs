use std::path::{Path, PathBuf};

use burn::tensor::{backend::Backend, Tensor, TensorData};
use tracing::{debug, info};

use crate::{error::DataError, model::DataFormat, model::INPUT_SHAPE};

pub const TRAIN_FILES: [&str; 5] = [
  "data_batch_1.bin",
  "data_batch_2.bin",
  "data_batch_3.bin",
  "data_batch_4.bin",
  "data_batch_5.bin",
];
pub const TEST_FILE: &str = "test_batch.bin";

/// Bytes per image in the binary distribution.
pub const IMAGE_BYTES: usize = 32 * 32 * 3;
/// One label byte followed by the image in channel-major order.
pub const RECORD_BYTES: usize = 1 + IMAGE_BYTES;

/// Raw images and labels. Images are stored height, width, channels and never modified after load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
  pub images: Vec<u8>,
  pub labels: Vec<u8>,
  /// (height, width, channels) of one image.
  pub shape: [usize; 3],
}

#[derive(Debug, Clone)]
pub struct Cifar10 {
  pub train: Split,
  pub test: Split,
}

impl Split {
  pub fn new(images: Vec<u8>, labels: Vec<u8>, shape: [usize; 3]) -> Self {
    debug_assert_eq!(images.len(), labels.len() * shape.iter().product::<usize>());
    Self {
      images,
      labels,
      shape,
    }
  }

  pub fn len(&self) -> usize {
    self.labels.len()
  }

  pub fn is_empty(&self) -> bool {
    self.labels.is_empty()
  }

  pub fn image_len(&self) -> usize {
    self.shape.iter().product()
  }

  /// The first `n` examples (or all of them).
  pub fn limit(&self, n: Option<usize>) -> Split {
    match n {
      Some(n) if n < self.len() => Split {
        images: self.images[..n * self.image_len()].to_vec(),
        labels: self.labels[..n].to_vec(),
        shape: self.shape,
      },
      _ => self.clone(),
    }
  }

  /// Normalized images and one-hot targets for the examples at `indices`.
  pub fn batch<B: Backend>(
    &self,
    indices: &[usize],
    classes: usize,
    format: DataFormat,
    device: &B::Device,
  ) -> Result<(Tensor<B, 4>, Tensor<B, 2>), DataError> {
    let image_len = self.image_len();
    let mut pixels = Vec::with_capacity(indices.len() * image_len);
    let mut labels = Vec::with_capacity(indices.len());
    for &i in indices {
      pixels.extend(normalize_pixels(&self.images[i * image_len..(i + 1) * image_len]));
      labels.push(self.labels[i]);
    }
    let [h, w, c] = self.shape;
    let images = Tensor::<B, 4>::from_data(TensorData::new(pixels, [indices.len(), h, w, c]), device);
    let images = match format {
      DataFormat::ChannelsLast => images,
      DataFormat::ChannelsFirst => images.permute([0, 3, 1, 2]),
    };
    let targets = Tensor::<B, 2>::from_data(
      TensorData::new(one_hot(&labels, classes)?, [indices.len(), classes]),
      device,
    );
    Ok((images, targets))
  }
}

/// Scales raw intensities into [0, 1].
pub fn normalize_pixels(raw: &[u8]) -> Vec<f32> {
  raw.iter().map(|p| *p as f32 / 255.0).collect()
}

/// Row-major (labels.len(), classes) matrix with a single one per row.
pub fn one_hot(labels: &[u8], classes: usize) -> Result<Vec<f32>, DataError> {
  let mut encoded = vec![0.0; labels.len() * classes];
  for (row, &label) in labels.iter().enumerate() {
    let label = label as usize;
    if label >= classes {
      return Err(DataError::LabelOutOfRange { label, classes });
    }
    encoded[row * classes + label] = 1.0;
  }
  Ok(encoded)
}

/// Argmax of every row. Empty for zero classes.
pub fn decode_one_hot(encoded: &[f32], classes: usize) -> Vec<usize> {
  if classes == 0 {
    return Vec::new();
  }
  encoded
    .chunks(classes)
    .map(|row| {
      row
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, v)| if *v > best.1 { (i, *v) } else { best })
        .0
    })
    .collect()
}

/// Parses one CIFAR-10 binary batch, reordering each image from channel-major to channels-last.
pub fn parse_batch(bytes: &[u8], path: &Path) -> Result<Split, DataError> {
  if bytes.len() % RECORD_BYTES != 0 {
    return Err(DataError::Truncated {
      path: path.to_path_buf(),
      len: bytes.len(),
    });
  }
  let [h, w, c] = INPUT_SHAPE;
  let records = bytes.len() / RECORD_BYTES;
  let mut images = Vec::with_capacity(records * IMAGE_BYTES);
  let mut labels = Vec::with_capacity(records);
  for record in bytes.chunks_exact(RECORD_BYTES) {
    labels.push(record[0]);
    let planes = &record[1..];
    for y in 0..h {
      for x in 0..w {
        for ch in 0..c {
          images.push(planes[ch * h * w + y * w + x]);
        }
      }
    }
  }
  Ok(Split::new(images, labels, INPUT_SHAPE))
}

fn read_batch(path: PathBuf) -> Result<Split, DataError> {
  if !path.exists() {
    return Err(DataError::MissingFile(path));
  }
  let bytes = std::fs::read(&path).map_err(|source| DataError::Io {
    path: path.clone(),
    source,
  })?;
  let split = parse_batch(&bytes, &path)?;
  debug!("read {} images from {:?}", split.len(), path);
  Ok(split)
}

fn concat(splits: Vec<Split>) -> Split {
  let mut images = Vec::new();
  let mut labels = Vec::new();
  for split in splits {
    images.extend(split.images);
    labels.extend(split.labels);
  }
  Split::new(images, labels, INPUT_SHAPE)
}

/// Reads the CIFAR-10 binary distribution from `dir`.
#[tracing::instrument]
pub fn read_dataset(dir: &Path) -> Result<Cifar10, DataError> {
  let train = TRAIN_FILES
    .iter()
    .map(|name| read_batch(dir.join(name)))
    .collect::<Result<Vec<_>, _>>()?;
  let train = concat(train);
  let test = read_batch(dir.join(TEST_FILE))?;
  info!("loaded {} training and {} test images", train.len(), test.len());
  Ok(Cifar10 { train, test })
}

#[cfg(test)]
mod tests {
  use burn::backend::NdArray;
  use proptest::prelude::*;

  use super::*;

  fn record(label: u8, fill: impl Fn(usize, usize, usize) -> u8) -> Vec<u8> {
    let mut bytes = vec![label];
    for ch in 0..3 {
      for y in 0..32 {
        for x in 0..32 {
          bytes.push(fill(ch, y, x));
        }
      }
    }
    bytes
  }

  #[test]
  fn test_parse_batch_reorders_channels() {
    let mut bytes = record(3, |ch, _, _| ch as u8 * 100);
    bytes.extend(record(7, |_, y, x| (y + x) as u8));
    let split = parse_batch(&bytes, Path::new("synthetic.bin")).unwrap();
    assert_eq!(split.len(), 2);
    assert_eq!(split.labels, vec![3, 7]);
    // first pixel of the first image: red 0, green 100, blue 200
    assert_eq!(&split.images[..3], &[0, 100, 200]);
    // second image, pixel (y = 1, x = 2)
    let offset = IMAGE_BYTES + (32 + 2) * 3;
    assert_eq!(&split.images[offset..offset + 3], &[3, 3, 3]);
  }

  #[test]
  fn test_truncated_batch_is_rejected() {
    let mut bytes = record(1, |_, _, _| 0);
    bytes.pop();
    let err = parse_batch(&bytes, Path::new("short.bin")).unwrap_err();
    assert!(matches!(err, DataError::Truncated { len, .. } if len == RECORD_BYTES - 1));
  }

  #[test]
  fn test_missing_directory() {
    let err = read_dataset(Path::new("/nonexistent/cifar-10-batches-bin")).unwrap_err();
    assert!(matches!(err, DataError::MissingFile(_)));
  }

  #[test]
  fn test_label_out_of_range() {
    assert!(matches!(
      one_hot(&[1, 10], 10),
      Err(DataError::LabelOutOfRange {
        label: 10,
        classes: 10
      })
    ));
  }

  #[test]
  fn test_batch_layouts() {
    let device = Default::default();
    let split = Split::new((0..2 * 2 * 2 * 3).map(|v| v as u8).collect(), vec![0, 1], [2, 2, 3]);
    let (last, targets) = split
      .batch::<NdArray<f32>>(&[1, 0], 2, DataFormat::ChannelsLast, &device)
      .unwrap();
    assert_eq!(last.dims(), [2, 2, 2, 3]);
    assert_eq!(targets.into_data().to_vec::<f32>().unwrap(), vec![0.0, 1.0, 1.0, 0.0]);
    let (first, _) = split
      .batch::<NdArray<f32>>(&[0], 2, DataFormat::ChannelsFirst, &device)
      .unwrap();
    assert_eq!(first.dims(), [1, 3, 2, 2]);
  }

  #[test]
  fn test_decode_without_classes() {
    assert!(decode_one_hot(&[], 0).is_empty());
    assert!(decode_one_hot(&[1.0, 0.0], 0).is_empty());
    assert_eq!(decode_one_hot(&[0.1, 0.9, 0.7, 0.3], 2), vec![1, 0]);
  }

  #[test]
  fn test_limit() {
    let split = Split::new(vec![0; 4 * 3], vec![0, 1, 2, 3], [1, 1, 3]);
    assert_eq!(split.limit(Some(2)).len(), 2);
    assert_eq!(split.limit(Some(2)).images.len(), 6);
    assert_eq!(split.limit(None), split);
    assert_eq!(split.limit(Some(10)), split);
  }

  proptest! {
    #[test]
    fn test_one_hot_round_trip(classes in 1usize..=255, seed in prop::collection::vec(any::<u8>(), 0..64)) {
      let scope = crate::utils::init_logging_tests();
      let labels: Vec<u8> = seed.iter().map(|l| (*l as usize % classes) as u8).collect();
      let encoded = one_hot(&labels, classes).unwrap();
      prop_assert_eq!(encoded.len(), labels.len() * classes);
      for row in encoded.chunks(classes) {
        prop_assert_eq!(row.iter().filter(|v| **v == 1.0).count(), 1);
        prop_assert_eq!(row.iter().filter(|v| **v == 0.0).count(), classes - 1);
      }
      let decoded = decode_one_hot(&encoded, classes);
      let expected: Vec<usize> = labels.iter().map(|l| *l as usize).collect();
      prop_assert_eq!(decoded, expected);
      drop(scope);
    }

    #[test]
    fn test_normalized_pixels_in_unit_range(raw in prop::collection::vec(any::<u8>(), 0..512)) {
      let scope = crate::utils::init_logging_tests();
      let normalized = normalize_pixels(&raw);
      prop_assert_eq!(normalized.len(), raw.len());
      prop_assert!(normalized.iter().all(|p| (0.0..=1.0).contains(p)));
      drop(scope);
    }
  }
}

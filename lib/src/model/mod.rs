pub mod block;
pub mod resnet;
pub mod training;
pub mod types;

pub use block::*;
pub use resnet::*;
pub use training::*;
pub use types::*;

use burn::backend::{Autodiff, NdArray};

/// CPU backend used for training.
pub type TrainBackend = Autodiff<NdArray<f32>>;
/// The same backend without gradient tracking, for inference and saving.
pub type InferenceBackend = NdArray<f32>;

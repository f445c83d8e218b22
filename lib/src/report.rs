use std::path::{Path, PathBuf};

use burn::{
  module::Module,
  record::{FullPrecisionSettings, NamedMpkFileRecorder},
  tensor::backend::Backend,
};
use plotters::{coord::Shift, prelude::*};
use tracing::info;

use crate::{
  error::{Error, ReportError},
  model::{Evaluation, History, TrainedModel},
  utils::serialize_to_file,
};

const FIGURE_SIZE: (u32, u32) = (1200, 400);
const TRAIN_COLOUR: RGBColor = RGBColor(31, 119, 180);
const VALID_COLOUR: RGBColor = RGBColor(255, 127, 14);
const FONT: &str = "sans-serif";

/// The two console lines reported after every run.
pub fn format_metrics(evaluation: &Evaluation) -> String {
  format!(
    "Loss = {}\nTest Accuracy = {}",
    evaluation.loss, evaluation.accuracy
  )
}

pub fn print_metrics(evaluation: &Evaluation) {
  println!("{}", format_metrics(evaluation));
}

fn plot_err<E: std::error::Error + Send + Sync>(e: DrawingAreaErrorKind<E>) -> ReportError {
  ReportError::Plot(e.to_string())
}

fn value_range(series: &[&[f32]]) -> (f32, f32) {
  let (lo, hi) = series
    .iter()
    .flat_map(|s| s.iter().copied())
    .filter(|v| v.is_finite())
    .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
  if lo > hi {
    return (0.0, 1.0);
  }
  let margin = ((hi - lo) * 0.05).max(1e-3);
  (lo - margin, hi + margin)
}

fn draw_panel<DB: DrawingBackend>(
  area: &DrawingArea<DB, Shift>,
  metric: &str,
  train: &[f32],
  valid: &[f32],
) -> Result<(), ReportError> {
  let epochs = train.len().max(valid.len()).max(2);
  let (lo, hi) = value_range(&[train, valid]);
  let mut chart = ChartBuilder::on(area)
    .caption(metric, (FONT, 22))
    .margin(12)
    .x_label_area_size(36)
    .y_label_area_size(54)
    .build_cartesian_2d(0..epochs - 1, lo..hi)
    .map_err(plot_err)?;
  chart
    .configure_mesh()
    .x_desc("Epoch")
    .y_desc(metric)
    .draw()
    .map_err(plot_err)?;

  for (label, values, colour) in [("Training", train, TRAIN_COLOUR), ("Validation", valid, VALID_COLOUR)] {
    chart
      .draw_series(LineSeries::new(
        values.iter().enumerate().map(|(i, v)| (i, *v)),
        colour.stroke_width(2),
      ))
      .map_err(plot_err)?
      .label(format!("{label} {metric}"))
      .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], colour.stroke_width(2)));
  }
  chart
    .configure_series_labels()
    .border_style(BLACK)
    .background_style(WHITE.mix(0.8))
    .draw()
    .map_err(plot_err)?;
  Ok(())
}

/// Loss and accuracy curves, training against validation, side by side.
pub fn plot_history(history: &History, title: &str, path: &Path) -> Result<(), ReportError> {
  let root = SVGBackend::new(path, FIGURE_SIZE).into_drawing_area();
  root.fill(&WHITE).map_err(plot_err)?;
  let root = root.titled(title, (FONT, 26)).map_err(plot_err)?;
  let panels = root.split_evenly((1, 2));
  draw_panel(&panels[0], "Loss", &history.loss, &history.val_loss)?;
  draw_panel(&panels[1], "Accuracy", &history.accuracy, &history.val_accuracy)?;
  root.present().map_err(plot_err)?;
  Ok(())
}

/// Where the files of one run end up.
pub struct ArtifactPaths {
  pub figure: PathBuf,
  pub history: PathBuf,
  pub model: PathBuf,
}

impl ArtifactPaths {
  pub fn new(dir: &Path, name: &str) -> Self {
    Self {
      figure: dir.join(format!("{name}_history.svg")),
      history: dir.join(format!("{name}_history.json")),
      // the recorder appends the extension
      model: dir.join(name),
    }
  }
}

/// Prints the metrics and writes the figure, the history and optionally the weights to `dir`.
pub fn report<B: Backend>(
  trained: &TrainedModel<B>,
  dir: Option<&Path>,
  save_model: bool,
) -> Result<(), Error> {
  print_metrics(&trained.evaluation);
  let Some(dir) = dir else {
    return Ok(());
  };
  std::fs::create_dir_all(dir).map_err(|source| ReportError::Io {
    path: dir.to_path_buf(),
    source,
  })?;
  let name = trained.model.name();
  let paths = ArtifactPaths::new(dir, name);
  plot_history(&trained.history, name, &paths.figure)?;
  serialize_to_file(&paths.history, &trained.history)?;
  info!("wrote {:?} and {:?}", paths.figure, paths.history);
  if save_model {
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    trained.model.clone().save_file(&paths.model, &recorder)?;
    info!("saved weights to {:?}", paths.model);
  }
  Ok(())
}

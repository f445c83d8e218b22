mod app_config;

use resnet::*;

use anyhow::Context;
use app_config::AppConfig;
use clap::{Parser, Subcommand};
use model::{Architecture, DataFormat, InferenceBackend, ModelSummary};
use std::path::PathBuf;

#[derive(Parser)]
#[command(version, about = "Residual networks on CIFAR-10")]
struct Cli {
  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Train, evaluate on the test split and report loss and accuracy
  Train {
    /// Directory with the CIFAR-10 binary batches
    #[arg(short, long, value_name = "PATH")]
    data: PathBuf,
    /// `basic` or `bottleneck`; both in sequence when omitted
    #[arg(short, long)]
    architecture: Option<Architecture>,
    #[arg(short, long, value_name = "INT")]
    epochs: Option<usize>,
    #[arg(short, long, value_name = "INT")]
    batch_size: Option<usize>,
    /// YAML file with further settings, overridden by flags
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Output directory for figures, histories and weights; nothing is written without it
    #[arg(long, value_name = "PATH")]
    artifacts: Option<PathBuf>,
    #[arg(long)]
    save_model: bool,
    #[arg(long, value_name = "INT")]
    train_limit: Option<usize>,
    #[arg(long, value_name = "INT")]
    test_limit: Option<usize>,
  },
  /// Print the block schedule, shapes and parameter counts
  Summary {
    #[arg(short, long)]
    architecture: Option<Architecture>,
    #[arg(long)]
    data_format: Option<DataFormat>,
  },
}

fn main() -> anyhow::Result<()> {
  utils::init_logging()?;
  let args = Cli::parse();

  match args.command {
    Command::Train {
      data,
      architecture,
      epochs,
      batch_size,
      config,
      artifacts,
      save_model,
      train_limit,
      test_limit,
    } => {
      let file = match config {
        Some(path) => AppConfig::from_file(&path)?,
        None => AppConfig::default(),
      };
      let flags = AppConfig {
        architectures: architecture.map(|a| vec![a]),
        epochs,
        batch_size,
        artifacts,
        save_model: save_model.then_some(true),
        train_limit,
        test_limit,
        ..AppConfig::default()
      };
      let run = file.merge(flags).resolve(data);
      tracing::debug!("{:?}", run);
      train(run)?;
    }
    Command::Summary {
      architecture,
      data_format,
    } => {
      let mut run = RunConfig::new(PathBuf::new());
      run.data_format = data_format.unwrap_or_default();
      let architectures = architecture.map_or(Architecture::ALL.to_vec(), |a| vec![a]);
      let device = Default::default();
      for architecture in architectures {
        let config = run.model(architecture);
        let model = config.init::<InferenceBackend>(&device)?;
        println!("{}", ModelSummary::new(&config, &model)?);
      }
    }
  }
  Ok(())
}

fn train(run: RunConfig) -> anyhow::Result<()> {
  let results = resnet::main(run).context("training run failed")?;
  for (architecture, evaluation) in results {
    tracing::info!(
      "{}: loss {:.4}, accuracy {:.4}",
      architecture,
      evaluation.loss,
      evaluation.accuracy
    );
  }
  Ok(())
}

use anyhow::{bail, ensure, format_err, Context, Result};
use mask_train::config::Config;
use serde_json::{json, Value};
use std::{env, fs::OpenOptions, path::PathBuf, str::FromStr, sync::Arc, sync::Mutex};
use structopt::StructOpt;
use tch::Device;
use tracing::{info, info_span, Instrument};
use tracing_subscriber::{filter::LevelFilter, prelude::*, EnvFilter};

#[derive(Debug, Clone, StructOpt)]
/// Train a saliency mask generator
struct Args {
    #[structopt(long)]
    /// configuration file. Other options override its values
    pub config_file: Option<PathBuf>,
    #[structopt(short, long)]
    /// the path to store and resume model parameters
    pub path: Option<PathBuf>,
    #[structopt(long)]
    /// the log file
    pub log: Option<PathBuf>,
    #[structopt(short, long)]
    /// the ground truth detection file for geometric labeling, or the saliency cache file
    /// for gradient labeling
    pub ground_truth: Option<PathBuf>,
    #[structopt(long)]
    /// the directory of frame images
    pub dataset_dir: Option<PathBuf>,
    #[structopt(long)]
    /// the labeling strategy, "gradient" or "geometric"
    pub labeling: Option<Labeling>,
    #[structopt(long)]
    /// the TorchScript detector used by gradient labeling
    pub oracle_file: Option<PathBuf>,
    #[structopt(long)]
    /// the mask generator architecture, "fcn" or "tile-linear"
    pub model: Option<ModelKind>,
    #[structopt(long)]
    /// detections below this confidence are discarded
    pub confidence_threshold: Option<f64>,
    #[structopt(long)]
    /// the IoU threshold passed to the detector loss
    pub iou_threshold: Option<f64>,
    #[structopt(long)]
    /// the number of training epochs
    pub num_iterations: Option<usize>,
    #[structopt(long)]
    pub batch_size: Option<usize>,
    #[structopt(long)]
    /// the tile size of the mask
    pub tile_size: Option<usize>,
    #[structopt(long)]
    pub learning_rate: Option<f64>,
    #[structopt(long)]
    /// the focusing exponent of the loss
    pub gamma: Option<f64>,
    #[structopt(long)]
    /// render saliency overlays along with checkpoints
    pub visualize: bool,
    #[structopt(long)]
    /// the training device, such as "cpu", "cuda" or "cuda:1"
    pub device: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Labeling {
    Gradient,
    Geometric,
}

impl FromStr for Labeling {
    type Err = anyhow::Error;

    fn from_str(text: &str) -> Result<Self> {
        Ok(match text {
            "gradient" => Self::Gradient,
            "geometric" => Self::Geometric,
            _ => bail!("invalid labeling strategy '{}'", text),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModelKind {
    Fcn,
    TileLinear,
}

impl FromStr for ModelKind {
    type Err = anyhow::Error;

    fn from_str(text: &str) -> Result<Self> {
        Ok(match text {
            "fcn" => Self::Fcn,
            "tile-linear" => Self::TileLinear,
            _ => bail!("invalid model '{}'", text),
        })
    }
}

#[tokio::main]
pub async fn main() -> Result<()> {
    // parse arguments
    let args = Args::from_args();
    let config = Arc::new(build_config(&args)?);

    // setup tracing
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true).compact();
    let file_layer = {
        let path = &config.logging.log_file;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file '{}'", path.display()))?;
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(Mutex::new(file))
    };
    let filter_layer = {
        let filter = EnvFilter::from_default_env();
        if env::var("RUST_LOG").is_err() {
            filter.add_directive(LevelFilter::INFO.into())
        } else {
            filter
        }
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(file_layer)
        .init();

    // start training program
    let summary = mask_train::start(config)
        .instrument(info_span!("mask-train"))
        .await?;

    match summary.best_cross_validation_loss {
        Some(loss) => info!(
            "trained {} epochs, best cross validation loss {:.5}",
            summary.epochs.len(),
            loss
        ),
        None => info!("trained {} epochs", summary.epochs.len()),
    }

    Ok(())
}

/// Loads the configuration file if given, and applies the command line options over it.
fn build_config(args: &Args) -> Result<Config> {
    let mut value: Value = match &args.config_file {
        Some(path) => Config::open_value(path)?,
        None => json!({}),
    };

    if let Some(path) = &args.path {
        set(&mut value, &["checkpoint", "path"], json!(path))?;
    }
    if let Some(log) = &args.log {
        set(&mut value, &["logging", "log_file"], json!(log))?;
    }
    if let Some(dir) = &args.dataset_dir {
        set(
            &mut value,
            &["dataset", "kind"],
            json!({ "type": "ImageDir", "dir": dir }),
        )?;
    }

    let labeling = match args.labeling {
        Some(labeling) => labeling,
        None => match value.pointer("/saliency/kind/type").and_then(Value::as_str) {
            Some("Geometric") => Labeling::Geometric,
            _ => Labeling::Gradient,
        },
    };
    let type_name = match labeling {
        Labeling::Gradient => "Gradient",
        Labeling::Geometric => "Geometric",
    };
    if value.pointer("/saliency/kind/type").and_then(Value::as_str) != Some(type_name) {
        set(&mut value, &["saliency", "kind"], json!({ "type": type_name }))?;
    }

    if let Some(file) = &args.ground_truth {
        let field = match labeling {
            Labeling::Gradient => "cache_file",
            Labeling::Geometric => "ground_truth_file",
        };
        set(&mut value, &["saliency", "kind", field], json!(file))?;
    }
    if let Some(file) = &args.oracle_file {
        ensure!(
            labeling == Labeling::Gradient,
            "--oracle-file is only used by gradient labeling"
        );
        set(&mut value, &["saliency", "kind", "oracle", "type"], json!("TorchScript"))?;
        set(&mut value, &["saliency", "kind", "oracle", "module_file"], json!(file))?;
    }
    if let Some(iou) = args.iou_threshold {
        ensure!(
            labeling == Labeling::Gradient,
            "--iou-threshold is only used by gradient labeling"
        );
        set(&mut value, &["saliency", "kind", "oracle", "iou_threshold"], json!(iou))?;
    }
    if let Some(conf) = args.confidence_threshold {
        set(&mut value, &["saliency", "confidence_threshold"], json!(conf))?;
    }
    if let Some(tile_size) = args.tile_size {
        set(&mut value, &["saliency", "tile_size"], json!(tile_size))?;
    }
    if let Some(model) = args.model {
        let kind = match model {
            ModelKind::Fcn => "Fcn",
            ModelKind::TileLinear => "TileLinear",
        };
        set(&mut value, &["model"], json!({ "kind": kind }))?;
    }
    if let Some(num) = args.num_iterations {
        set(&mut value, &["training", "num_iterations"], json!(num))?;
    }
    if let Some(batch_size) = args.batch_size {
        set(&mut value, &["training", "batch_size"], json!(batch_size))?;
    }

    // geometric labels train with a lower default rate
    let lr = args.learning_rate.or_else(|| {
        let given = value.pointer("/training/lr").is_some();
        (!given && labeling == Labeling::Geometric).then(|| 1e-4)
    });
    if let Some(lr) = lr {
        set(&mut value, &["training", "lr"], json!(lr))?;
    }
    if let Some(gamma) = args.gamma {
        set(&mut value, &["training", "focal_gamma"], json!(gamma))?;
    }
    if args.visualize {
        set(&mut value, &["logging", "visualize"], json!(true))?;
    }

    let mut config = Config::from_value(value)?;
    if let Some(device) = &args.device {
        config.training.device = parse_device(device)?;
    }
    Ok(config)
}

/// Sets a nested field, creating intermediate objects.
fn set(value: &mut Value, path: &[&str], new: Value) -> Result<()> {
    let (last, parents) = path
        .split_last()
        .ok_or_else(|| format_err!("empty field path"))?;
    let parent = parents.iter().try_fold(value, |value, key| -> Result<_> {
        let object = value
            .as_object_mut()
            .ok_or_else(|| format_err!("'{}' is not an object", path.join(".")))?;
        Ok(object.entry(*key).or_insert_with(|| json!({})))
    })?;
    let object = parent
        .as_object_mut()
        .ok_or_else(|| format_err!("'{}' is not an object", path.join(".")))?;
    object.insert(last.to_string(), new);
    Ok(())
}

fn parse_device(text: &str) -> Result<Device> {
    let device = match text {
        "cpu" => Device::Cpu,
        "cuda" => Device::Cuda(0),
        _ => {
            let index = text
                .strip_prefix("cuda:")
                .and_then(|index| index.parse().ok())
                .ok_or_else(|| format_err!("invalid device '{}'", text))?;
            Device::Cuda(index)
        }
    };
    Ok(device)
}

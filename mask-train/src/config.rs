//! Training program configuration format.

use crate::{common::*, tile::TileReduction};

pub use checkpoint::*;
pub use dataset::*;
pub use logging::*;
pub use model::*;
pub use saliency::*;
pub use training::*;

/// The main training configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub checkpoint: CheckpointConfig,
    pub dataset: DatasetConfig,
    pub saliency: SaliencyConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub training: TrainingConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Reads a configuration file that may leave out fields, so that command line options
    /// can complete it before [Config::from_value].
    pub fn open_value<P>(path: P) -> Result<serde_json::Value>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file '{}'", path.display()))?;
        let value = json5::from_str(&text)
            .with_context(|| format!("failed to parse config file '{}'", path.display()))?;
        Ok(value)
    }

    /// Builds a validated configuration from a complete JSON value.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let config: Self = serde_json::from_value(value)
            .context("incomplete configuration, see --help for required options")?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the value ranges that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let Self {
            dataset,
            saliency,
            training,
            ..
        } = self;

        let [frame_h, frame_w] = dataset.frame_size;
        ensure!(
            frame_h > 0 && frame_w > 0,
            "frame size must be positive, but get {}x{}",
            frame_h,
            frame_w
        );
        ensure!(
            dataset.train_ratio > 0.0 && dataset.train_ratio < 1.0,
            "train_ratio must be in range (0, 1)"
        );
        if let Some(ratio) = dataset.subset_ratio {
            ensure!(
                ratio > 0.0 && ratio <= 1.0,
                "subset_ratio must be in range (0, 1]"
            );
        }

        ensure!(saliency.tile_size > 0, "tile_size must be positive");
        ensure!(
            (0.0..=1.0).contains(&saliency.confidence_threshold.raw()),
            "confidence_threshold must be in range [0, 1]"
        );
        if let LabelingKind::Gradient(GradientLabeling { thresholds, .. }) = &saliency.kind {
            ensure!(!thresholds.is_empty(), "thresholds must not be empty");
            ensure!(
                thresholds.iter().all(|thresh| thresh.raw() > 0.0),
                "thresholds must be positive"
            );
            ensure!(
                thresholds.iter().all_unique(),
                "thresholds must not contain duplicates"
            );
        }

        ensure!(training.num_iterations > 0, "num_iterations must be positive");
        ensure!(training.batch_size.get() > 0, "batch_size must be positive");
        ensure!(training.lr > 0.0, "the lr must be positive");
        ensure!(
            training.plateau.factor > 0.0 && training.plateau.factor < 1.0,
            "the plateau factor must be in range (0, 1)"
        );
        ensure!(training.save_steps.get() > 0, "save_steps must be positive");

        Ok(())
    }
}

mod checkpoint {
    use super::*;

    /// Checkpoint file options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct CheckpointConfig {
        /// The path of the latest checkpoint. The best checkpoint is saved along with it
        /// with the ".best" suffix.
        pub path: PathBuf,
        /// Checkpoint file loading method.
        #[serde(default)]
        pub resume: ResumeMode,
    }

    /// Checkpoint file loading method.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum ResumeMode {
        /// Never load a checkpoint.
        Disabled,
        /// Load the best checkpoint, or the latest one, if it exists.
        Auto,
        /// Like `Auto`, but fail if no checkpoint exists.
        Required,
    }

    impl Default for ResumeMode {
        fn default() -> Self {
            Self::Auto
        }
    }
}

mod dataset {
    use super::*;

    /// Dataset options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct DatasetConfig {
        /// The source of frames.
        pub kind: DatasetKind,
        /// The canonical frame size in `[height, width]`. Frames are letterboxed to it.
        #[serde(default = "default_frame_size")]
        pub frame_size: [usize; 2],
        /// The RGB color filled in the letterbox margins.
        #[serde(default = "default_pad_color")]
        pub pad_color: [u8; 3],
        /// If set, a random subset of frames in this ratio is used.
        pub subset_ratio: Option<f64>,
        /// The ratio of training frames. The rest goes to cross validation.
        #[serde(default = "default_train_ratio")]
        pub train_ratio: f64,
        /// The random seed for dataset splitting.
        #[serde(default = "default_split_seed")]
        pub split_seed: u64,
        /// The number of concurrent frame loading workers.
        #[serde(default = "default_num_workers")]
        pub num_workers: NonZeroUsize,
        /// The number of batches loaded ahead of training.
        #[serde(default = "default_prefetch")]
        pub prefetch: NonZeroUsize,
    }

    /// Variants of frame sources.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type")]
    pub enum DatasetKind {
        /// A directory of image files. Frame ids are assigned in file name order.
        ImageDir {
            dir: PathBuf,
            #[serde(default = "default_extensions")]
            extensions: Vec<String>,
        },
    }

    fn default_frame_size() -> [usize; 2] {
        [720, 1280]
    }

    fn default_pad_color() -> [u8; 3] {
        [123, 116, 103]
    }

    fn default_train_ratio() -> f64 {
        0.7
    }

    fn default_split_seed() -> u64 {
        100
    }

    fn default_num_workers() -> NonZeroUsize {
        NonZeroUsize::new(2).unwrap()
    }

    fn default_prefetch() -> NonZeroUsize {
        NonZeroUsize::new(2).unwrap()
    }

    fn default_extensions() -> Vec<String> {
        vec!["jpg".into(), "jpeg".into(), "png".into()]
    }
}

mod saliency {
    use super::*;

    /// Saliency label derivation options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct SaliencyConfig {
        /// The side length of square tiles in pixels.
        #[serde(default = "default_tile_size")]
        pub tile_size: usize,
        /// Detections below this confidence are discarded.
        #[serde(default = "default_confidence_threshold")]
        pub confidence_threshold: R64,
        /// Optional list of whitelisted class ids.
        pub class_whitelist: Option<HashSet<i64>>,
        /// The labeling strategy.
        pub kind: LabelingKind,
    }

    /// The labeling strategies.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type")]
    pub enum LabelingKind {
        /// Labels from input gradients of the oracle loss.
        Gradient(GradientLabeling),
        /// Labels from ground truth bounding boxes.
        Geometric(GeometricLabeling),
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct GradientLabeling {
        /// The file where derived labels are cached.
        pub cache_file: PathBuf,
        /// The sensitivity thresholds. Each one yields a separate label.
        #[serde(default = "default_thresholds")]
        pub thresholds: Vec<R64>,
        /// The per-channel value of the blank image.
        #[serde(default = "default_blank_mean")]
        pub blank_mean: [f64; 3],
        pub oracle: OracleConfig,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct GeometricLabeling {
        /// The JSON file of ground truth detections keyed by frame id.
        pub ground_truth_file: PathBuf,
    }

    /// The detection oracle options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type")]
    pub enum OracleConfig {
        /// A TorchScript module providing `inference` and `loss` methods.
        TorchScript {
            module_file: PathBuf,
            #[serde(default = "default_iou_threshold")]
            iou_threshold: R64,
        },
    }

    fn default_tile_size() -> usize {
        8
    }

    fn default_confidence_threshold() -> R64 {
        r64(0.5)
    }

    fn default_thresholds() -> Vec<R64> {
        vec![r64(0.1), r64(0.02), r64(0.5)]
    }

    fn default_blank_mean() -> [f64; 3] {
        [0.485, 0.456, 0.406]
    }

    fn default_iou_threshold() -> R64 {
        r64(0.5)
    }
}

mod model {
    use super::*;

    /// The mask generator architecture.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "kind")]
    pub enum ModelConfig {
        /// Fully convolutional network followed by tile pooling.
        Fcn {
            #[serde(default = "default_fcn_channels")]
            channels: Vec<i64>,
            #[serde(default = "default_fcn_pooling")]
            pooling: TileReduction,
        },
        /// Per-tile linear classifier on pooled colors.
        TileLinear,
    }

    impl Default for ModelConfig {
        fn default() -> Self {
            Self::Fcn {
                channels: default_fcn_channels(),
                pooling: default_fcn_pooling(),
            }
        }
    }

    fn default_fcn_channels() -> Vec<i64> {
        vec![32, 64, 64]
    }

    fn default_fcn_pooling() -> TileReduction {
        TileReduction::Mean
    }
}

mod training {
    use super::*;

    /// The training options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(default)]
    pub struct TrainingConfig {
        /// The number of epochs.
        pub num_iterations: usize,
        /// The batch size.
        pub batch_size: NonZeroUsize,
        /// The initial learning rate.
        pub lr: f64,
        /// The weight decay parameter for optimizer.
        pub weight_decay: f64,
        /// The focusing exponent of the loss. Zero gives the plain cross entropy.
        pub focal_gamma: f64,
        /// The latest checkpoint is saved per this number of batches.
        pub save_steps: NonZeroUsize,
        /// Learning rate reduction on validation plateau.
        pub plateau: PlateauConfig,
        /// The training device.
        #[serde(with = "tch_serde::serde_device")]
        pub device: Device,
    }

    impl Default for TrainingConfig {
        fn default() -> Self {
            Self {
                num_iterations: 500,
                batch_size: NonZeroUsize::new(2).unwrap(),
                lr: 1e-3,
                weight_decay: 0.0,
                focal_gamma: 0.0,
                save_steps: NonZeroUsize::new(250).unwrap(),
                plateau: PlateauConfig::default(),
                device: Device::cuda_if_available(),
            }
        }
    }

    /// Options of learning rate reduction on plateau.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(default)]
    pub struct PlateauConfig {
        /// The lr is multiplied by this factor on reduction.
        pub factor: f64,
        /// The number of non-improving epochs tolerated before reduction.
        pub patience: usize,
        /// The relative improvement to be counted as better.
        pub threshold: f64,
        /// The number of epochs to wait after a reduction.
        pub cooldown: usize,
        /// The lower bound of lr.
        pub min_lr: f64,
    }

    impl Default for PlateauConfig {
        fn default() -> Self {
            Self {
                factor: 0.1,
                patience: 10,
                threshold: 1e-4,
                cooldown: 0,
                min_lr: 0.0,
            }
        }
    }
}

mod logging {
    use super::*;

    /// Data logging options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct LoggingConfig {
        /// The text log file.
        pub log_file: PathBuf,
        /// The directory where events and images are saved.
        #[serde(default = "default_logging_dir")]
        pub dir: PathBuf,
        /// Render saliency overlays along with checkpoints.
        #[serde(default)]
        pub visualize: bool,
    }

    fn default_logging_dir() -> PathBuf {
        PathBuf::from("logs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_partial_config_file() -> Result<()> {
        let path = std::env::temp_dir().join(format!(
            "mask-train-partial-config-{}.json5",
            std::process::id()
        ));
        fs::write(
            &path,
            r#"{
                // the checkpoint path is given on the command line
                dataset: { kind: { type: "ImageDir", dir: "frames" } },
                saliency: { kind: { type: "Geometric", ground_truth_file: "gt.json" } },
                logging: { log_file: "train.log" },
            }"#,
        )?;

        let mut value = Config::open_value(&path)?;
        assert!(Config::from_value(value.clone()).is_err());

        value["checkpoint"] = serde_json::json!({ "path": "model.pt" });
        let config = Config::from_value(value.clone())?;
        assert_eq!(config.checkpoint.path, PathBuf::from("model.pt"));
        assert_eq!(config.saliency.tile_size, 8);

        value["saliency"]["tile_size"] = serde_json::json!(0);
        assert!(Config::from_value(value).is_err());

        assert!(Config::open_value(path.with_extension("missing")).is_err());
        fs::remove_file(&path)?;
        Ok(())
    }

    #[test]
    fn parse_minimal_config() -> Result<()> {
        let text = r#"{
            checkpoint: { path: "model.pth" },
            dataset: { kind: { type: "ImageDir", dir: "frames" } },
            saliency: {
                tile_size: 16,
                kind: {
                    type: "Gradient",
                    cache_file: "saliency.pt",
                    oracle: { type: "TorchScript", module_file: "detector.pt" },
                },
            },
            training: {
                num_iterations: 3,
                batch_size: 4,
                lr: 0.001,
                weight_decay: 0.0,
                focal_gamma: 0.0,
                save_steps: 10,
                plateau: { patience: 2 },
            },
            logging: { log_file: "train.log" },
        }"#;
        let config: Config = json5::from_str(text)?;
        config.validate()?;

        assert_eq!(config.dataset.frame_size, [720, 1280]);
        assert_eq!(config.dataset.split_seed, 100);
        assert_eq!(config.checkpoint.resume, ResumeMode::Auto);
        assert_eq!(config.training.plateau.patience, 2);
        assert_eq!(config.training.plateau.factor, 0.1);
        assert!(matches!(config.model, ModelConfig::Fcn { .. }));

        match &config.saliency.kind {
            LabelingKind::Gradient(GradientLabeling { thresholds, .. }) => {
                assert_eq!(thresholds, &[r64(0.1), r64(0.02), r64(0.5)]);
            }
            LabelingKind::Geometric(_) => panic!("expect gradient labeling"),
        }
        Ok(())
    }

    #[test]
    fn reject_invalid_ranges() -> Result<()> {
        let text = r#"{
            checkpoint: { path: "model.pth" },
            dataset: { kind: { type: "ImageDir", dir: "frames" }, train_ratio: 1.5 },
            saliency: {
                kind: { type: "Geometric", ground_truth_file: "gt.json" },
            },
            logging: { log_file: "train.log" },
        }"#;
        let mut config: Config = json5::from_str(text)?;
        assert!(config.validate().is_err());

        config.dataset.train_ratio = 0.8;
        config.validate()?;

        config.saliency.tile_size = 0;
        assert!(config.validate().is_err());
        Ok(())
    }
}

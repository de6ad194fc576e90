//! The frozen detection model used as the source of saliency.

use crate::{common::*, config::OracleConfig, detection::Detection};

/// A frozen detector that scores images.
pub trait DetectionOracle
where
    Self: Debug + Send,
{
    /// The identity of the oracle. It takes part in the saliency cache key.
    fn name(&self) -> &str;

    /// Runs detection on a `[1, 3, H, W]` image.
    fn inference(&self, image: &Tensor) -> Result<Vec<Detection>>;

    /// Computes the detection loss of a `[1, 3, H, W]` image against target detections.
    ///
    /// The returned scalar must stay attached to the autograd graph of `image`.
    fn loss(&self, image: &Tensor, targets: &[Detection]) -> Result<Tensor>;
}

/// Builds the oracle from its configuration.
pub fn load_oracle(config: &OracleConfig, device: Device) -> Result<Box<dyn DetectionOracle>> {
    let oracle: Box<dyn DetectionOracle> = match config {
        OracleConfig::TorchScript {
            module_file,
            iou_threshold,
        } => Box::new(TorchScriptOracle::load(
            module_file,
            iou_threshold.raw(),
            device,
        )?),
    };
    Ok(oracle)
}

/// An oracle backed by a TorchScript module.
///
/// The module provides two methods.
/// - `inference(image) -> Tensor`, returning `[N, 6]` rows of `t, l, b, r, score, class`
///   with box coordinates in ratio units.
/// - `loss(image, targets, iou_threshold) -> Tensor`, returning a scalar loss of the
///   predictions on `image` against `[N, 6]` target rows in the same layout.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct TorchScriptOracle {
    name: String,
    #[derivative(Debug = "ignore")]
    module: tch::CModule,
    iou_threshold: f64,
    device: Device,
}

impl TorchScriptOracle {
    pub fn load(path: &Path, iou_threshold: f64, device: Device) -> Result<Self> {
        ensure!(
            path.is_file(),
            "the oracle module '{}' does not exist",
            path.display()
        );
        let mut module = tch::CModule::load_on_device(path, device)
            .with_context(|| format!("failed to load oracle module '{}'", path.display()))?;
        module.set_eval();

        let name = format!("torchscript:{}:iou={}", path.display(), iou_threshold);
        info!("loaded oracle {}", name);

        Ok(Self {
            name,
            module,
            iou_threshold,
            device,
        })
    }
}

impl DetectionOracle for TorchScriptOracle {
    fn name(&self) -> &str {
        &self.name
    }

    fn inference(&self, image: &Tensor) -> Result<Vec<Detection>> {
        let output = tch::no_grad(|| {
            self.module
                .method_ts("inference", &[image.to_device(self.device)])
        })?;
        Detection::from_tensor(&output.to_device(Device::Cpu))
    }

    fn loss(&self, image: &Tensor, targets: &[Detection]) -> Result<Tensor> {
        let targets = Detection::to_tensor(targets, self.device);
        let iou_threshold = Tensor::from(self.iou_threshold).to_device(self.device);
        let loss = self
            .module
            .method_ts("loss", &[image.shallow_clone(), targets, iou_threshold])?;
        ensure!(
            loss.numel() == 1,
            "the oracle loss must be a scalar, but get shape {:?}",
            loss.size()
        );
        Ok(loss.reshape(&[]))
    }
}

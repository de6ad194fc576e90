use crate::{
    common::*,
    detection::DetectionFilter,
    oracle::DetectionOracle,
    tile::{TileGrid, TileReduction},
};

/// Derives saliency from the gradient of the oracle loss on a blank image.
///
/// The oracle detections on the real frame serve as targets. The loss of a blank image
/// filled with per-channel mean values is backpropagated to the pixels, and the summed
/// absolute gradient of each tile is its importance.
#[derive(Debug)]
pub struct GradientLabeler {
    pub oracle: Box<dyn DetectionOracle>,
    pub tile_grid: TileGrid,
    pub thresholds: Vec<R64>,
    pub blank_mean: [f64; 3],
    pub filter: DetectionFilter,
    pub device: Device,
}

impl GradientLabeler {
    /// Computes the `[1, 1, grid_h, grid_w]` tile importance of a `[1, 3, H, W]` image.
    pub fn importance(&self, image: &Tensor) -> Result<Tensor> {
        let (bsize, channels, _, _) = image.size4()?;
        ensure!(
            bsize == 1 && channels == 3,
            "expect a [1, 3, H, W] image, but get {:?}",
            image.size()
        );
        let image = image.to_device(self.device);

        let detections = self.oracle.inference(&image)?;
        let targets = self.filter.apply(detections);
        trace!("{} target detections", targets.len());

        let mean = Tensor::of_slice(&self.blank_mean)
            .to_kind(Kind::Float)
            .view([1, 3, 1, 1])
            .to_device(self.device);
        let blank = (image.ones_like() * mean).detach().set_requires_grad(true);

        let loss = self.oracle.loss(&blank, &targets)?;
        let loss_value = f64::from(&loss);
        ensure!(
            loss_value.is_finite(),
            "the oracle loss is not finite ({})",
            loss_value
        );

        let pixel_importance = if loss.requires_grad() {
            loss.backward();
            let grad = blank.grad();
            if grad.defined() {
                grad.abs().sum_dim_intlist(&[1], true, Kind::Float)
            } else {
                blank.zeros_like().narrow(1, 0, 1)
            }
        } else {
            // the loss does not depend on the image
            blank.zeros_like().narrow(1, 0, 1)
        };

        self.tile_grid
            .downsample(&pixel_importance.detach(), TileReduction::Sum)
    }

    /// Computes one boolean `[1, 1, grid_h, grid_w]` label per threshold. A tile is kept
    /// when its importance exceeds the threshold.
    pub fn label(&self, image: &Tensor) -> Result<Vec<Tensor>> {
        let importance = self.importance(image)?;
        let labels = self
            .thresholds
            .iter()
            .map(|thresh| importance.gt(thresh.raw()))
            .collect();
        Ok(labels)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::detection::Detection;

    /// Detects one fixed box, and scores an image by its squared distance to white within
    /// detected boxes. Each box adds its class id to the pixel weights.
    #[derive(Debug)]
    pub struct BoxOracle {
        pub tlbr: [f64; 4],
    }

    impl DetectionOracle for BoxOracle {
        fn name(&self) -> &str {
            "box"
        }

        fn inference(&self, _image: &Tensor) -> Result<Vec<Detection>> {
            Ok(vec![
                Detection::from_tlbr(self.tlbr, 1, 0.9)?,
                Detection::from_tlbr([0.0, 0.0, 1.0, 1.0], 2, 0.1)?,
            ])
        }

        fn loss(&self, image: &Tensor, targets: &[Detection]) -> Result<Tensor> {
            let (_, _, height, width) = image.size4()?;
            let diff = -image + 1.0;
            let weight = Tensor::zeros(&[1, 1, height, width], FLOAT_CPU);
            for det in targets {
                let [t, l, b, r] = det
                    .rect
                    .to_pixel_tlbr(r64(height as f64), r64(width as f64))
                    .tlbr();
                let (t, l) = (t.raw() as i64, l.raw() as i64);
                let (b, r) = (b.raw().ceil() as i64, r.raw().ceil() as i64);
                let mut region = weight.narrow(2, t, b - t).narrow(3, l, r - l);
                region += det.class as f64;
            }
            Ok((&diff * &diff * weight).sum(Kind::Float))
        }
    }

    fn labeler(thresholds: &[f64], confidence: f64) -> Result<GradientLabeler> {
        Ok(GradientLabeler {
            oracle: Box::new(BoxOracle {
                tlbr: [0.0, 0.5, 0.5, 1.0],
            }),
            tile_grid: TileGrid::new(2)?,
            thresholds: thresholds.iter().map(|&t| r64(t)).collect(),
            blank_mean: [0.5, 0.5, 0.5],
            filter: DetectionFilter {
                confidence_threshold: r64(confidence),
                class_whitelist: None,
            },
            device: Device::Cpu,
        })
    }

    #[test]
    fn importance_follows_target_boxes() -> Result<()> {
        let labeler = labeler(&[1.0], 0.5)?;
        let image = Tensor::rand(&[1, 3, 4, 4], FLOAT_CPU);
        let importance = labeler.importance(&image)?;
        assert_eq!(importance.size(), [1, 1, 2, 2]);

        // d/dx (1 - x)^2 = -1 at x = 0.5, over 3 channels and 4 pixels
        let values = Vec::<f32>::from(&importance.view([-1]));
        assert_eq!(values, vec![0.0, 12.0, 0.0, 0.0]);

        let labels = labeler.label(&image)?;
        assert_eq!(labels.len(), 1);
        let keep = Vec::<bool>::from(&labels[0].view([-1]));
        assert_eq!(keep, vec![false, true, false, false]);
        Ok(())
    }

    #[test]
    fn higher_threshold_keeps_fewer_tiles() -> Result<()> {
        // the low confidence full frame box of class 2 is accepted, so the top right tile
        // has importance 36 and the others 24
        let labeler = labeler(&[1.0, 30.0, 100.0], 0.0)?;
        let image = Tensor::rand(&[1, 3, 4, 4], FLOAT_CPU);
        let labels = labeler.label(&image)?;
        let counts: Vec<i64> = labels
            .iter()
            .map(|label| i64::from(label.to_kind(Kind::Int64).sum(Kind::Int64)))
            .collect();
        assert_eq!(counts, vec![4, 1, 0]);

        // tiles kept at a higher threshold are kept at the lower ones
        for (lower, higher) in labels.iter().tuple_windows() {
            let escaped = higher.logical_and(&lower.logical_not());
            assert_eq!(i64::from(escaped.to_kind(Kind::Int64).sum(Kind::Int64)), 0);
        }
        Ok(())
    }
}

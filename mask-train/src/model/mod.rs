//! Mask generator models.

mod fcn;
mod tile_linear;

pub use fcn::*;
pub use tile_linear::*;

use crate::{common::*, config::ModelConfig, tile::TileGrid};

/// A trainable network that maps images to per-tile keep/drop scores.
pub trait MaskGenerator
where
    Self: Debug + Send,
{
    /// Maps `[B, 3, H, W]` images to `[B, 2, grid_h, grid_w]` raw scores, where channel 0
    /// is the drop score and channel 1 is the keep score.
    fn forward_t(&self, image: &Tensor, train: bool) -> Result<Tensor>;

    fn var_store(&self) -> &nn::VarStore;

    fn var_store_mut(&mut self) -> &mut nn::VarStore;

    fn save(&self, path: &Path) -> Result<()> {
        self.var_store()
            .save(path)
            .with_context(|| format!("failed to save parameters to '{}'", path.display()))
    }

    fn load(&mut self, path: &Path) -> Result<()> {
        self.var_store_mut()
            .load(path)
            .with_context(|| format!("failed to load parameters from '{}'", path.display()))
    }
}

/// Builds the mask generator from its configuration.
pub fn build_model(
    config: &ModelConfig,
    tile_grid: TileGrid,
    device: Device,
) -> Result<Box<dyn MaskGenerator>> {
    let model: Box<dyn MaskGenerator> = match config {
        ModelConfig::Fcn { channels, pooling } => {
            Box::new(Fcn::new(channels, *pooling, tile_grid, device)?)
        }
        ModelConfig::TileLinear => Box::new(TileLinear::new(tile_grid, device)),
    };
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tile::TileReduction;

    #[test]
    fn output_matches_tile_grid() -> Result<()> {
        let tile_grid = TileGrid::new(4)?;
        let configs = [
            ModelConfig::Fcn {
                channels: vec![4, 8],
                pooling: TileReduction::Max,
            },
            ModelConfig::TileLinear,
        ];

        for config in &configs {
            let model = build_model(config, tile_grid, Device::Cpu)?;
            let image = Tensor::rand(&[2, 3, 10, 13], FLOAT_CPU);
            let output = model.forward_t(&image, true)?;
            assert_eq!(output.size(), [2, 2, 3, 4]);

            // every output tile depends on the parameters
            output.sum(Kind::Float).backward();
            let has_grad = model
                .var_store()
                .trainable_variables()
                .iter()
                .any(|var| var.grad().defined() && f64::from(var.grad().abs().sum(Kind::Float)) > 0.0);
            assert!(has_grad);
        }
        Ok(())
    }

    #[test]
    fn save_and_load_parameters() -> Result<()> {
        let tile_grid = TileGrid::new(2)?;
        let config = ModelConfig::TileLinear;
        let path = std::env::temp_dir().join(format!("mask-train-model-{}.pt", std::process::id()));

        let source = build_model(&config, tile_grid, Device::Cpu)?;
        source.save(&path)?;

        let mut target = build_model(&config, tile_grid, Device::Cpu)?;
        target.load(&path)?;

        let image = Tensor::rand(&[1, 3, 4, 4], FLOAT_CPU);
        let diff = f64::from(
            (source.forward_t(&image, false)? - target.forward_t(&image, false)?)
                .abs()
                .max(),
        );
        assert!(diff < 1e-6);

        let mut other = build_model(
            &ModelConfig::Fcn {
                channels: vec![4],
                pooling: TileReduction::Mean,
            },
            tile_grid,
            Device::Cpu,
        )?;
        assert!(other.load(&path).is_err());
        fs::remove_file(&path)?;
        Ok(())
    }
}

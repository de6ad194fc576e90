use super::MaskGenerator;
use crate::{
    common::*,
    tile::{TileGrid, TileReduction},
};

/// Classifies each tile by a linear function of its mean color.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct TileLinear {
    #[derivative(Debug = "ignore")]
    vs: nn::VarStore,
    classifier: nn::Conv2D,
    tile_grid: TileGrid,
}

impl TileLinear {
    pub fn new(tile_grid: TileGrid, device: Device) -> Self {
        let vs = nn::VarStore::new(device);
        let classifier = nn::conv2d(&vs.root() / "classifier", 3, 2, 1, Default::default());
        Self {
            vs,
            classifier,
            tile_grid,
        }
    }
}

impl MaskGenerator for TileLinear {
    fn forward_t(&self, image: &Tensor, _train: bool) -> Result<Tensor> {
        let pooled = self.tile_grid.downsample(image, TileReduction::Mean)?;
        Ok(pooled.apply(&self.classifier))
    }

    fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    fn var_store_mut(&mut self) -> &mut nn::VarStore {
        &mut self.vs
    }
}

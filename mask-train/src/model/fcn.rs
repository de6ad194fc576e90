use super::MaskGenerator;
use crate::{
    common::*,
    tile::{TileGrid, TileReduction},
};

/// A fully convolutional mask generator.
///
/// A stack of 3x3 convolution, batch normalization and ReLU blocks keeps the input
/// resolution. The features are pooled per tile and classified by a 1x1 convolution.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Fcn {
    #[derivative(Debug = "ignore")]
    vs: nn::VarStore,
    blocks: Vec<ConvBlock>,
    classifier: nn::Conv2D,
    pooling: TileReduction,
    tile_grid: TileGrid,
}

#[derive(Debug)]
struct ConvBlock {
    conv: nn::Conv2D,
    bn: nn::BatchNorm,
}

impl ConvBlock {
    fn new<'a>(path: impl Borrow<nn::Path<'a>>, in_c: i64, out_c: i64) -> Self {
        let path = path.borrow();
        let conv = nn::conv2d(
            path / "conv",
            in_c,
            out_c,
            3,
            nn::ConvConfig {
                padding: 1,
                bias: false,
                ..Default::default()
            },
        );
        let bn = nn::batch_norm2d(path / "bn", out_c, Default::default());
        Self { conv, bn }
    }

    fn forward_t(&self, input: &Tensor, train: bool) -> Tensor {
        self.bn.forward_t(&input.apply(&self.conv), train).relu()
    }
}

impl Fcn {
    pub fn new(
        channels: &[i64],
        pooling: TileReduction,
        tile_grid: TileGrid,
        device: Device,
    ) -> Result<Self> {
        ensure!(
            channels.iter().all(|&c| c > 0),
            "the channels must be positive"
        );
        ensure!(
            pooling != TileReduction::Sum,
            "sum pooling is not supported for features"
        );

        let vs = nn::VarStore::new(device);
        let root = vs.root();

        let (blocks, last_c) = channels.iter().enumerate().fold(
            (vec![], 3),
            |(mut blocks, in_c), (index, &out_c)| {
                blocks.push(ConvBlock::new(&root / format!("block_{}", index), in_c, out_c));
                (blocks, out_c)
            },
        );
        let classifier = nn::conv2d(&root / "classifier", last_c, 2, 1, Default::default());

        Ok(Self {
            vs,
            blocks,
            classifier,
            pooling,
            tile_grid,
        })
    }
}

impl MaskGenerator for Fcn {
    fn forward_t(&self, image: &Tensor, train: bool) -> Result<Tensor> {
        let features = self
            .blocks
            .iter()
            .fold(image.shallow_clone(), |xs, block| block.forward_t(&xs, train));
        let pooled = self.tile_grid.downsample(&features, self.pooling)?;
        Ok(pooled.apply(&self.classifier))
    }

    fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    fn var_store_mut(&mut self) -> &mut nn::VarStore {
        &mut self.vs
    }
}

//! Conversion between full resolution maps and tile grids.
//!
//! A frame of size `H` x `W` maps to a grid of `ceil(H / t)` x `ceil(W / t)` tiles. When a
//! side is not a multiple of the tile size, the map is padded with zeros at the bottom and
//! right before pooling, so the last row or column of tiles covers a partial area. Label
//! derivation and every mask generator go through [TileGrid::downsample], so the grid
//! shapes of labels and predictions always agree.

use crate::common::*;

/// The reduction applied within each tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TileReduction {
    Sum,
    Max,
    Mean,
}

/// The tile grid codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGrid {
    tile_size: i64,
}

impl TileGrid {
    pub fn new(tile_size: usize) -> Result<Self> {
        ensure!(tile_size > 0, "tile_size must be positive");
        Ok(Self {
            tile_size: tile_size as i64,
        })
    }

    pub fn tile_size(&self) -> i64 {
        self.tile_size
    }

    /// The `(grid_h, grid_w)` of a frame of size `height` x `width`.
    pub fn grid_size(&self, height: i64, width: i64) -> (i64, i64) {
        let t = self.tile_size;
        ((height + t - 1) / t, (width + t - 1) / t)
    }

    /// Pools a `[B, C, H, W]` map into a `[B, C, grid_h, grid_w]` grid.
    pub fn downsample(&self, input: &Tensor, reduction: TileReduction) -> Result<Tensor> {
        let (bsize, channels, height, width) = input.size4()?;
        let t = self.tile_size;
        let (grid_h, grid_w) = self.grid_size(height, width);

        let pad_h = grid_h * t - height;
        let pad_w = grid_w * t - width;
        let padded = if pad_h > 0 || pad_w > 0 {
            input.constant_pad_nd(&[0, pad_w, 0, pad_h])
        } else {
            input.shallow_clone()
        };

        let blocks = padded.reshape(&[bsize, channels, grid_h, t, grid_w, t]);
        let output = match reduction {
            TileReduction::Sum => blocks.sum_dim_intlist(&[3, 5], false, Kind::Float),
            TileReduction::Max => blocks.amax(&[3, 5], false),
            TileReduction::Mean => {
                // average over the covered pixels only
                let ones = Tensor::ones(&[1, 1, height, width], (Kind::Float, input.device()))
                    .constant_pad_nd(&[0, pad_w, 0, pad_h])
                    .reshape(&[1, 1, grid_h, t, grid_w, t])
                    .sum_dim_intlist(&[3, 5], false, Kind::Float);
                blocks.sum_dim_intlist(&[3, 5], false, Kind::Float) / ones
            }
        };
        Ok(output)
    }

    /// Broadcasts each tile of a `[B, C, grid_h, grid_w]` grid over its footprint, and crops
    /// the result to `height` x `width`.
    pub fn upsample(&self, grid: &Tensor, height: i64, width: i64) -> Result<Tensor> {
        let (bsize, channels, grid_h, grid_w) = grid.size4()?;
        let t = self.tile_size;
        ensure!(
            self.grid_size(height, width) == (grid_h, grid_w),
            "grid size {}x{} does not match frame size {}x{} with tile size {}",
            grid_h,
            grid_w,
            height,
            width,
            t
        );

        let output = grid
            .reshape(&[bsize, channels, grid_h, 1, grid_w, 1])
            .expand(&[bsize, channels, grid_h, t, grid_w, t], false)
            .reshape(&[bsize, channels, grid_h * t, grid_w * t])
            .narrow(2, 0, height)
            .narrow(3, 0, width);
        Ok(output)
    }
}

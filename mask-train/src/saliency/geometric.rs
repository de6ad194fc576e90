use super::{LabelLevel, SaliencyLabels};
use crate::{
    common::*,
    detection::{Detection, DetectionFilter},
    tile::TileGrid,
};

/// Marks the tiles overlapped by ground truth boxes.
#[derive(Debug, Clone)]
pub struct GeometricLabeler {
    tile_grid: TileGrid,
    frame_size: (i64, i64),
    filter: DetectionFilter,
}

impl GeometricLabeler {
    pub fn new(tile_grid: TileGrid, frame_size: (i64, i64), filter: DetectionFilter) -> Self {
        Self {
            tile_grid,
            frame_size,
            filter,
        }
    }

    /// Builds the `[1, 1, grid_h, grid_w]` boolean label from boxes in ratio units.
    pub fn label(&self, detections: &[Detection]) -> Tensor {
        let (frame_h, frame_w) = self.frame_size;
        let (grid_h, grid_w) = self.tile_grid.grid_size(frame_h, frame_w);
        let tile_size = r64(self.tile_grid.tile_size() as f64);
        let mut keep = vec![0u8; (grid_h * grid_w) as usize];

        detections
            .iter()
            .filter(|det| self.filter.accepts(det))
            .for_each(|det| {
                let span = det
                    .rect
                    .to_pixel_tlbr(r64(frame_h as f64), r64(frame_w as f64))
                    .grid_span(tile_size, grid_h as usize, grid_w as usize);
                span.cells().for_each(|(row, col)| {
                    keep[row * grid_w as usize + col] = 1;
                });
            });

        Tensor::of_slice(&keep)
            .view([1, 1, grid_h, grid_w])
            .to_kind(Kind::Bool)
    }

    /// Labels every frame. Frames without ground truth are labeled all drop.
    pub fn label_frames(
        &self,
        fids: &[i64],
        ground_truth: &HashMap<i64, Vec<Detection>>,
    ) -> Result<SaliencyLabels> {
        let grids: HashMap<i64, Tensor> = fids
            .iter()
            .filter_map(|fid| {
                let detections = ground_truth.get(fid)?;
                Some((*fid, self.label(detections)))
            })
            .collect();
        let fallback = self.label(&[]);
        let (frame_h, frame_w) = self.frame_size;

        SaliencyLabels::new(
            self.tile_grid.grid_size(frame_h, frame_w),
            vec![LabelLevel::new(None, 1.0, grids, Some(fallback))],
        )
    }
}

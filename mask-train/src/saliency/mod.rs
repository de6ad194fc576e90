//! Tile-level saliency labels.
//!
//! Labels are derived either from gradients of a frozen detector or from ground truth boxes.
//! Gradient labels form one level per sensitivity threshold, weighted by the threshold.
//! Geometric labels form a single level of weight one.

mod cache;
mod geometric;
mod gradient;

pub use cache::*;
pub use geometric::*;
pub use gradient::*;

use crate::{
    common::*,
    config::{GeometricLabeling, GradientLabeling, LabelingKind, SaliencyConfig},
    data::FrameSource,
    detection::{load_ground_truth, DetectionFilter},
    oracle::DetectionOracle,
    tile::TileGrid,
    utils::RateCounter,
};

/// Binary tile labels of one level.
#[derive(Debug)]
pub struct LabelLevel {
    /// The sensitivity threshold, absent for geometric labels.
    pub threshold: Option<R64>,
    /// The weight of this level in the loss.
    pub weight: f64,
    /// `[1, 1, grid_h, grid_w]` boolean grids keyed by frame id.
    grids: HashMap<i64, Tensor>,
    /// The grid used for frames without a label.
    fallback: Option<Tensor>,
}

impl LabelLevel {
    pub fn new(
        threshold: Option<R64>,
        weight: f64,
        grids: HashMap<i64, Tensor>,
        fallback: Option<Tensor>,
    ) -> Self {
        Self {
            threshold,
            weight,
            grids,
            fallback,
        }
    }

    pub fn grids(&self) -> &HashMap<i64, Tensor> {
        &self.grids
    }

    /// The `[1, 1, grid_h, grid_w]` boolean label of a frame.
    pub fn get(&self, fid: i64) -> Result<&Tensor> {
        self.grids
            .get(&fid)
            .or_else(|| self.fallback.as_ref())
            .ok_or_else(|| match self.threshold {
                Some(threshold) => {
                    format_err!("no saliency label for frame {} at threshold {}", fid, threshold)
                }
                None => format_err!("no saliency label for frame {}", fid),
            })
    }
}

/// The saliency labels of a dataset.
#[derive(Debug)]
pub struct SaliencyLabels {
    grid_size: (i64, i64),
    levels: Vec<LabelLevel>,
}

impl SaliencyLabels {
    pub fn new(grid_size: (i64, i64), levels: Vec<LabelLevel>) -> Result<Self> {
        ensure!(!levels.is_empty(), "saliency labels must have at least one level");
        let (grid_h, grid_w) = grid_size;
        let expect = [1, 1, grid_h, grid_w];
        levels
            .iter()
            .flat_map(|level| level.grids.values().chain(level.fallback.iter()))
            .try_for_each(|grid| -> Result<()> {
                ensure!(
                    grid.size() == expect,
                    "label grid shape {:?} does not match {:?}",
                    grid.size(),
                    expect
                );
                Ok(())
            })?;
        Ok(Self { grid_size, levels })
    }

    pub fn grid_size(&self) -> (i64, i64) {
        self.grid_size
    }

    pub fn levels(&self) -> &[LabelLevel] {
        &self.levels
    }

    /// Builds `(weight, [B, 1, grid_h, grid_w] targets)` per level for a batch of frames.
    pub fn targets(&self, fids: &[i64], device: Device) -> Result<Vec<(f64, Tensor)>> {
        self.levels
            .iter()
            .map(|level| -> Result<_> {
                let grids: Vec<_> = fids
                    .iter()
                    .map(|&fid| level.get(fid).map(|grid| grid.shallow_clone()))
                    .try_collect()?;
                let target = Tensor::cat(&grids, 0).to_kind(Kind::Int64).to_device(device);
                Ok((level.weight, target))
            })
            .try_collect()
    }

    /// The fraction of levels marking each tile as keep, as `[1, 1, grid_h, grid_w]` floats.
    pub fn keep_ratio(&self, fid: i64) -> Result<Tensor> {
        let grids: Vec<_> = self
            .levels
            .iter()
            .map(|level| level.get(fid).map(|grid| grid.to_kind(Kind::Float)))
            .try_collect()?;
        Ok(Tensor::stack(&grids, 0).mean_dim(&[0], false, Kind::Float))
    }
}

/// Derives or loads the saliency labels of the given frames.
///
/// The oracle is only loaded when gradient labels are not found in the cache.
pub fn prepare_labels<F>(
    config: &SaliencyConfig,
    source: &dyn FrameSource,
    fids: &[i64],
    device: Device,
    load_oracle: F,
) -> Result<SaliencyLabels>
where
    F: FnOnce() -> Result<Box<dyn DetectionOracle>>,
{
    let tile_grid = TileGrid::new(config.tile_size)?;
    let filter = DetectionFilter {
        confidence_threshold: config.confidence_threshold,
        class_whitelist: config.class_whitelist.clone(),
    };
    let (frame_h, frame_w) = source.frame_size();

    match &config.kind {
        LabelingKind::Geometric(GeometricLabeling { ground_truth_file }) => {
            let ground_truth = load_ground_truth(ground_truth_file)?;
            let labeler = GeometricLabeler::new(tile_grid, (frame_h, frame_w), filter);
            let labels = labeler.label_frames(fids, &ground_truth)?;
            info!(
                "derived geometric labels for {} frames, {} have ground truth",
                fids.len(),
                fids.iter().filter(|fid| ground_truth.contains_key(*fid)).count()
            );
            Ok(labels)
        }
        LabelingKind::Gradient(GradientLabeling {
            cache_file,
            thresholds,
            blank_mean,
            oracle: oracle_config,
        }) => {
            let key = CacheKey {
                source: source.description(),
                frame_ids: fids,
                frame_size: (frame_h, frame_w),
                tile_size: tile_grid.tile_size(),
                thresholds,
                blank_mean: *blank_mean,
                confidence_threshold: config.confidence_threshold,
                class_whitelist: config
                    .class_whitelist
                    .as_ref()
                    .map(|classes| classes.iter().copied().sorted().collect()),
                oracle: oracle_config,
            }
            .digest()?;

            if let Some(labels) = load_cache(cache_file, &key)? {
                info!("loaded saliency labels from '{}'", cache_file.display());
                return Ok(labels);
            }

            let oracle = load_oracle()?;
            let labeler = GradientLabeler {
                oracle,
                tile_grid,
                thresholds: thresholds.clone(),
                blank_mean: *blank_mean,
                filter,
                device,
            };

            let mut grids: Vec<HashMap<i64, Tensor>> =
                thresholds.iter().map(|_| HashMap::new()).collect();
            let mut rate_counter = RateCounter::with_second_interval();

            for (index, &fid) in fids.iter().enumerate() {
                let image = source
                    .load(fid)
                    .with_context(|| format!("failed to load frame {}", fid))?;
                let levels = labeler
                    .label(&image.unsqueeze(0))
                    .with_context(|| format!("failed to derive saliency of frame {}", fid))?;
                izip!(&mut grids, levels).for_each(|(grids, grid)| {
                    grids.insert(fid, grid.to_device(Device::Cpu));
                });

                rate_counter.add(1.0);
                if let Some(rate) = rate_counter.rate() {
                    info!(
                        "labeled {}/{} frames, {:.2} frames/s",
                        index + 1,
                        fids.len(),
                        rate
                    );
                }
            }

            let levels = izip!(thresholds, grids)
                .map(|(&threshold, grids)| {
                    LabelLevel::new(Some(threshold), threshold.raw(), grids, None)
                })
                .collect();
            let labels = SaliencyLabels::new(tile_grid.grid_size(frame_h, frame_w), levels)?;

            save_cache(cache_file, &key, &labels)?;
            info!("saved saliency labels to '{}'", cache_file.display());
            Ok(labels)
        }
    }
}

//! The training worker.

mod trainer;

pub use trainer::*;

use crate::{
    common::*,
    config::Config,
    data::{num_batches, BatchRecord, DatasetSplit, FrameSource},
    logging::LoggingMessage,
    model::build_model,
    oracle::DetectionOracle,
    saliency::prepare_labels,
    tile::TileGrid,
    utils,
};

/// Start the training worker. It blocks until all epochs are done.
pub fn training_worker<F>(
    config: Arc<Config>,
    source: Arc<dyn FrameSource>,
    split: Arc<DatasetSplit>,
    load_oracle: F,
    data_rx: flume::Receiver<BatchRecord>,
    logging_tx: Option<broadcast::Sender<LoggingMessage>>,
) -> Result<TrainingSummary>
where
    F: FnOnce() -> Result<Box<dyn DetectionOracle>>,
{
    let device = config.training.device;
    info!("use device {:?}", device);

    // fail early before the expensive labeling
    utils::find_checkpoint(&config.checkpoint.path, config.checkpoint.resume)?;

    // derive labels
    let labels = {
        let _span = info_span!("labeling").entered();
        let fids = split.all();
        info!("preparing saliency labels of {} frames", fids.len());
        prepare_labels(&config.saliency, &*source, &fids, device, load_oracle)?
    };

    // init model
    info!("initializing model");
    let tile_grid = TileGrid::new(config.saliency.tile_size)?;
    let mut model = build_model(&config.model, tile_grid, device)?;
    {
        let (frame_h, frame_w) = source.frame_size();
        ensure!(
            labels.grid_size() == tile_grid.grid_size(frame_h, frame_w),
            "the label grid {:?} does not match the frame size {}x{}",
            labels.grid_size(),
            frame_h,
            frame_w
        );
    }
    utils::try_load_checkpoint(
        &mut *model,
        &config.checkpoint.path,
        config.checkpoint.resume,
    )?;

    let batch_size = config.training.batch_size.get();
    let plan = EpochPlan {
        num_epochs: config.training.num_iterations,
        num_training_batches: num_batches(split.training().len(), batch_size),
        num_cross_validation_batches: num_batches(split.cross_validation().len(), batch_size),
    };

    let _span = info_span!("training").entered();
    let trainer = Trainer::new(&config, model, labels, logging_tx)?;
    trainer.run(&data_rx, plan)
}

//! Training of saliency mask generators.
//!
//! A mask generator predicts which tiles of a video frame matter to an object detector.
//! Labels are derived from the gradients of a frozen detector or from ground truth boxes.

pub mod common;
pub mod config;
pub mod data;
pub mod detection;
pub mod logging;
pub mod loss;
pub mod model;
pub mod oracle;
pub mod saliency;
pub mod tile;
pub mod train;
pub mod utils;

use crate::{
    common::*,
    config::{Config, DatasetKind, LabelingKind},
    data::{DatasetSplit, FeederInit, FrameSource, ImageDirSource},
    oracle::DetectionOracle,
    train::TrainingSummary,
};

/// The entry of training program.
pub async fn start(config: Arc<Config>) -> Result<TrainingSummary> {
    config.validate()?;

    let source: Arc<dyn FrameSource> = {
        let DatasetKind::ImageDir {
            ref dir,
            ref extensions,
        } = config.dataset.kind;
        Arc::new(ImageDirSource::open(
            dir,
            extensions,
            config.dataset.frame_size,
            config.dataset.pad_color,
        )?)
    };

    let oracle_config = match &config.saliency.kind {
        LabelingKind::Gradient(gradient) => Some(gradient.oracle.clone()),
        LabelingKind::Geometric(_) => None,
    };
    let device = config.training.device;
    let load_oracle = move || -> Result<Box<dyn DetectionOracle>> {
        let oracle_config = oracle_config
            .ok_or_else(|| format_err!("the oracle is only used by gradient labeling"))?;
        oracle::load_oracle(&oracle_config, device)
    };

    run(config, source, load_oracle).await
}

/// Trains a mask generator on frames from `source`.
///
/// `load_oracle` is called at most once, when gradient labels are not cached.
pub async fn run<F>(
    config: Arc<Config>,
    source: Arc<dyn FrameSource>,
    load_oracle: F,
) -> Result<TrainingSummary>
where
    F: 'static + FnOnce() -> Result<Box<dyn DetectionOracle>> + Send,
{
    config.validate()?;
    let start_time = Local::now();
    let logging_dir: Arc<Path> = {
        let dir = config
            .logging
            .dir
            .join(format!("{}", start_time.format(utils::FILE_STRFTIME)));
        dir.into_boxed_path().into()
    };

    // create dirs and save config
    {
        tokio::fs::create_dir_all(&*logging_dir).await?;
        let path = logging_dir.join("config.json5");
        let text = serde_json::to_string_pretty(&*config)?;
        tokio::fs::write(&path, text).await?;
    }

    // split dataset
    let split = {
        let dataset = &config.dataset;
        let split = DatasetSplit::new(
            source.frame_ids(),
            dataset.subset_ratio,
            dataset.train_ratio,
            dataset.split_seed,
        )?;
        info!(
            "split {} frames into {} training and {} cross validation frames",
            source.frame_ids().len(),
            split.training().len(),
            split.cross_validation().len()
        );
        Arc::new(split)
    };

    // create channels
    let (logging_tx, logging_rx) = broadcast::channel(16);
    let (data_tx, data_rx) = flume::bounded(config.dataset.prefetch.get());

    // start logger
    let logging_future = logging::logging_worker(config.clone(), logging_dir.clone(), logging_rx);

    // feeding worker
    let feeding_future = {
        let init = FeederInit {
            num_epochs: config.training.num_iterations,
            batch_size: config.training.batch_size.get(),
            num_workers: config.dataset.num_workers.get(),
            seed: config.dataset.split_seed,
        };
        tokio::task::spawn(data::feeding_worker(
            source.clone(),
            split.clone(),
            init,
            data_tx,
        ))
        .map(|result| Fallible::Ok(result??))
    };

    // training worker
    let training_future = {
        let config = config.clone();
        tokio::task::spawn_blocking(move || {
            train::training_worker(
                config,
                source,
                split,
                load_oracle,
                data_rx,
                Some(logging_tx),
            )
        })
        .map(|result| Fallible::Ok(result??))
    };

    let ((), summary, ()) = futures::try_join!(feeding_future, training_future, logging_future)?;
    Ok(summary)
}

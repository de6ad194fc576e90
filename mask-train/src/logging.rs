//! Data logging toolkit.

use crate::{common::*, config::Config, tile::TileGrid, utils::RateCounter};
use async_std::{fs::File, io::BufWriter};
use image::RgbImage;

pub use logging_message::*;
pub use logging_worker::*;

mod logging_message {
    use super::*;

    /// Statistics of the predicted keep probability over a batch.
    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct KeepStats {
        pub min: f64,
        pub mean: f64,
        pub std: f64,
    }

    impl KeepStats {
        /// Computes the statistics from `[B, 2, grid_h, grid_w]` raw scores.
        pub fn from_scores(scores: &Tensor) -> Result<Self> {
            let (_, channels, _, _) = scores.size4()?;
            ensure!(channels == 2, "expect 2 score channels, but get {}", channels);

            let keep = tch::no_grad(|| scores.detach().softmax(1, Kind::Float).select(1, 1));
            Ok(Self {
                min: f64::from(keep.min()),
                mean: f64::from(keep.mean(Kind::Float)),
                std: f64::from(keep.std(false)),
            })
        }
    }

    /// The message sent to the logging worker.
    #[derive(Debug)]
    pub struct LoggingMessage {
        pub tag: Cow<'static, str>,
        pub kind: LoggingMessageKind,
    }

    #[derive(Debug)]
    pub enum LoggingMessageKind {
        TrainingStep {
            step: usize,
            loss: f64,
            lr: f64,
            keep: KeepStats,
        },
        Epoch {
            epoch: usize,
            training_loss: f64,
            cross_validation_loss: f64,
            lr: f64,
        },
        /// Predicted and labeled saliency of a frame.
        Overlay {
            step: usize,
            fid: i64,
            /// The `[3, H, W]` frame.
            image: Tensor,
            /// The `[1, 1, grid_h, grid_w]` predicted keep probability.
            prediction: Tensor,
            /// The `[1, 1, grid_h, grid_w]` labeled keep ratio.
            ground_truth: Tensor,
        },
    }

    impl Clone for LoggingMessage {
        fn clone(&self) -> Self {
            use LoggingMessageKind as K;

            let kind = match self.kind {
                K::TrainingStep {
                    step,
                    loss,
                    lr,
                    keep,
                } => K::TrainingStep {
                    step,
                    loss,
                    lr,
                    keep,
                },
                K::Epoch {
                    epoch,
                    training_loss,
                    cross_validation_loss,
                    lr,
                } => K::Epoch {
                    epoch,
                    training_loss,
                    cross_validation_loss,
                    lr,
                },
                K::Overlay {
                    step,
                    fid,
                    ref image,
                    ref prediction,
                    ref ground_truth,
                } => K::Overlay {
                    step,
                    fid,
                    image: image.shallow_clone(),
                    prediction: prediction.shallow_clone(),
                    ground_truth: ground_truth.shallow_clone(),
                },
            };

            Self {
                tag: self.tag.clone(),
                kind,
            }
        }
    }

    impl LoggingMessage {
        pub fn new_training_step<S>(
            tag: S,
            step: usize,
            loss: f64,
            lr: f64,
            keep: KeepStats,
        ) -> Self
        where
            S: Into<Cow<'static, str>>,
        {
            Self {
                tag: tag.into(),
                kind: LoggingMessageKind::TrainingStep {
                    step,
                    loss,
                    lr,
                    keep,
                },
            }
        }

        pub fn new_epoch<S>(
            tag: S,
            epoch: usize,
            training_loss: f64,
            cross_validation_loss: f64,
            lr: f64,
        ) -> Self
        where
            S: Into<Cow<'static, str>>,
        {
            Self {
                tag: tag.into(),
                kind: LoggingMessageKind::Epoch {
                    epoch,
                    training_loss,
                    cross_validation_loss,
                    lr,
                },
            }
        }

        pub fn new_overlay<S>(
            tag: S,
            step: usize,
            fid: i64,
            image: &Tensor,
            prediction: &Tensor,
            ground_truth: &Tensor,
        ) -> Self
        where
            S: Into<Cow<'static, str>>,
        {
            Self {
                tag: tag.into(),
                kind: LoggingMessageKind::Overlay {
                    step,
                    fid,
                    image: image.detach().to_device(Device::Cpu),
                    prediction: prediction.detach().to_device(Device::Cpu),
                    ground_truth: ground_truth.detach().to_device(Device::Cpu),
                },
            }
        }
    }
}

mod logging_worker {
    use super::*;

    /// The data logging worker.
    #[derive(Derivative)]
    #[derivative(Debug)]
    pub struct LoggingWorker {
        tile_grid: TileGrid,
        overlay_dir: Option<PathBuf>,
        #[derivative(Debug = "ignore")]
        event_writer: EventWriter<BufWriter<File>>,
        rate_counter: RateCounter,
        rx: broadcast::Receiver<LoggingMessage>,
        rendered_ground_truth: HashSet<i64>,
    }

    impl LoggingWorker {
        /// Create a data logging worker.
        pub async fn new(
            config: &Config,
            logging_dir: &Path,
            rx: broadcast::Receiver<LoggingMessage>,
        ) -> Result<Self> {
            let tile_grid = TileGrid::new(config.saliency.tile_size)?;

            // prepare dirs
            let event_dir = logging_dir.join("events");
            let event_path_prefix = event_dir
                .join("mask-train")
                .into_os_string()
                .into_string()
                .map_err(|path| format_err!("non-UTF-8 path '{}'", path.to_string_lossy()))?;
            tokio::fs::create_dir_all(&event_dir).await?;

            let overlay_dir = if config.logging.visualize {
                let dir = logging_dir.join("train");
                tokio::fs::create_dir_all(&dir).await?;
                Some(dir)
            } else {
                None
            };

            let event_writer = EventWriterInit::default()
                .from_prefix_async(event_path_prefix, None)
                .await?;

            Ok(Self {
                tile_grid,
                overlay_dir,
                event_writer,
                rate_counter: RateCounter::with_second_interval(),
                rx,
                rendered_ground_truth: HashSet::new(),
            })
        }

        /// Start the data logging worker. It returns when all senders are dropped.
        pub async fn start(mut self) -> Result<()> {
            loop {
                let LoggingMessage { tag, kind } = match self.rx.recv().await {
                    Ok(msg) => msg,
                    Err(broadcast::error::RecvError::Lagged(num)) => {
                        warn!("the logging worker skipped {} messages", num);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                self.rate_counter.add(1.0);

                match kind {
                    LoggingMessageKind::TrainingStep {
                        step,
                        loss,
                        lr,
                        keep,
                    } => {
                        let step = step as i64;
                        self.event_writer
                            .write_scalar_async(format!("{}/loss", tag), step, loss as f32)
                            .await?;
                        self.event_writer
                            .write_scalar_async(format!("{}/learning_rate", tag), step, lr as f32)
                            .await?;
                        for (name, value) in [
                            ("keep_min", keep.min),
                            ("keep_mean", keep.mean),
                            ("keep_std", keep.std),
                        ] {
                            self.event_writer
                                .write_scalar_async(
                                    format!("{}/{}", tag, name),
                                    step,
                                    value as f32,
                                )
                                .await?;
                        }
                    }
                    LoggingMessageKind::Epoch {
                        epoch,
                        training_loss,
                        cross_validation_loss,
                        lr,
                    } => {
                        let step = epoch as i64;
                        self.event_writer
                            .write_scalar_async(
                                format!("{}/training_loss", tag),
                                step,
                                training_loss as f32,
                            )
                            .await?;
                        self.event_writer
                            .write_scalar_async(
                                format!("{}/cross_validation_loss", tag),
                                step,
                                cross_validation_loss as f32,
                            )
                            .await?;
                        self.event_writer
                            .write_scalar_async(format!("{}/learning_rate", tag), step, lr as f32)
                            .await?;
                    }
                    LoggingMessageKind::Overlay {
                        step,
                        fid,
                        image,
                        prediction,
                        ground_truth,
                    } => {
                        self.log_overlay(step, fid, image, prediction, ground_truth)
                            .await?;
                    }
                }

                if let Some(rate) = self.rate_counter.rate() {
                    debug!("processed {:.2} logging events/s", rate);
                }
            }

            Ok(())
        }

        async fn log_overlay(
            &mut self,
            step: usize,
            fid: i64,
            image: Tensor,
            prediction: Tensor,
            ground_truth: Tensor,
        ) -> Result<()> {
            let dir = match &self.overlay_dir {
                Some(dir) => dir.clone(),
                None => return Ok(()),
            };
            let tile_grid = self.tile_grid;
            let render_ground_truth = self.rendered_ground_truth.insert(fid);

            tokio::task::spawn_blocking(move || -> Result<()> {
                if render_ground_truth {
                    let path = dir.join(format!("{}_train.png", fid));
                    render_overlay(&image, &ground_truth, tile_grid)?
                        .save(&path)
                        .with_context(|| format!("failed to write '{}'", path.display()))?;
                }
                let path = dir.join(format!("{}_test.png", fid));
                render_overlay(&image, &prediction, tile_grid)?
                    .save(&path)
                    .with_context(|| format!("failed to write '{}'", path.display()))?;
                Ok(())
            })
            .await??;

            debug!("rendered saliency overlay of frame {} at step {}", fid, step);
            Ok(())
        }
    }

    /// Starts the logging worker.
    pub async fn logging_worker(
        config: Arc<Config>,
        logging_dir: Arc<Path>,
        rx: broadcast::Receiver<LoggingMessage>,
    ) -> Result<()> {
        LoggingWorker::new(&config, &logging_dir, rx)
            .await?
            .start()
            .await
    }
}

/// Blends a `[1, 1, grid_h, grid_w]` saliency grid with values in `[0, 1]` onto a `[3, H, W]`
/// frame. Salient tiles are tinted red and the others blue.
pub fn render_overlay(image: &Tensor, grid: &Tensor, tile_grid: TileGrid) -> Result<RgbImage> {
    let (channels, height, width) = image.size3()?;
    ensure!(channels == 3, "expect a [3, H, W] image, but get {:?}", image.size());

    let bytes = tch::no_grad(|| -> Result<_> {
        let heat = tile_grid
            .upsample(&grid.to_kind(Kind::Float), height, width)?
            .view([1, height, width])
            .clamp(0.0, 1.0);
        let tint = Tensor::cat(&[&heat, &heat.zeros_like(), &(-&heat + 1.0)], 0);
        let blended = (image.to_kind(Kind::Float) * 0.5 + tint * 0.5).clamp(0.0, 1.0) * 255.0;
        let bytes = blended
            .round()
            .to_kind(Kind::Uint8)
            .permute(&[1, 2, 0])
            .contiguous()
            .view([-1]);
        Ok(Vec::<u8>::from(&bytes))
    })?;

    RgbImage::from_raw(width as u32, height as u32, bytes)
        .ok_or_else(|| format_err!("invalid overlay buffer size"))
}

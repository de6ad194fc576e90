use crate::{
    common::*,
    config::Config,
    data::{BatchRecord, Phase},
    logging::{KeepStats, LoggingMessage},
    loss::SaliencyLoss,
    model::MaskGenerator,
    saliency::SaliencyLabels,
    utils::{self, BestLossTracker, LrScheduler, RateCounter},
};

/// The number of epochs and batches the trainer consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochPlan {
    pub num_epochs: usize,
    pub num_training_batches: usize,
    pub num_cross_validation_batches: usize,
}

/// The state of the training loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerState {
    Initializing,
    TrainingEpoch { epoch: usize },
    CrossValidating { epoch: usize },
    Checkpointing { epoch: usize },
    Done,
}

/// Losses and learning rate of an epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochSummary {
    pub epoch: usize,
    pub training_loss: f64,
    pub cross_validation_loss: f64,
    /// The learning rate used in this epoch.
    pub lr: f64,
    /// Whether the best checkpoint was updated.
    pub best_updated: bool,
}

/// The outcome of a training run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingSummary {
    pub epochs: Vec<EpochSummary>,
    pub best_cross_validation_loss: Option<f64>,
}

/// Runs epochs of training, cross validation and checkpointing.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Trainer {
    model: Box<dyn MaskGenerator>,
    #[derivative(Debug = "ignore")]
    optimizer: nn::Optimizer,
    lr_scheduler: LrScheduler,
    loss_fn: SaliencyLoss,
    labels: SaliencyLabels,
    best_tracker: BestLossTracker,
    checkpoint_path: PathBuf,
    save_steps: usize,
    visualize: bool,
    device: Device,
    logging_tx: Option<broadcast::Sender<LoggingMessage>>,
    state: TrainerState,
    training_step: usize,
}

impl Trainer {
    pub fn new(
        config: &Config,
        model: Box<dyn MaskGenerator>,
        labels: SaliencyLabels,
        logging_tx: Option<broadcast::Sender<LoggingMessage>>,
    ) -> Result<Self> {
        let training = &config.training;
        let mut optimizer = nn::Adam {
            wd: training.weight_decay,
            ..Default::default()
        }
        .build(model.var_store(), training.lr)?;
        let lr_scheduler = LrScheduler::new(training.lr, &training.plateau)?;
        optimizer.set_lr(lr_scheduler.lr());

        Ok(Self {
            model,
            optimizer,
            lr_scheduler,
            loss_fn: SaliencyLoss::new(training.focal_gamma)?,
            labels,
            best_tracker: BestLossTracker::default(),
            checkpoint_path: config.checkpoint.path.clone(),
            save_steps: training.save_steps.get(),
            visualize: config.logging.visualize,
            device: training.device,
            logging_tx,
            state: TrainerState::Initializing,
            training_step: 0,
        })
    }

    /// Consumes batches until all epochs in the plan are done.
    pub fn run(
        mut self,
        data_rx: &flume::Receiver<BatchRecord>,
        plan: EpochPlan,
    ) -> Result<TrainingSummary> {
        let mut summary = TrainingSummary::default();
        let mut training_loss = f64::NAN;
        let mut cross_validation_loss = f64::NAN;

        loop {
            self.state = match self.state {
                TrainerState::Initializing => {
                    info!("start training");
                    if plan.num_epochs == 0 {
                        TrainerState::Done
                    } else {
                        TrainerState::TrainingEpoch { epoch: 0 }
                    }
                }
                TrainerState::TrainingEpoch { epoch } => {
                    training_loss = self.train_epoch(data_rx, epoch, plan.num_training_batches)?;
                    TrainerState::CrossValidating { epoch }
                }
                TrainerState::CrossValidating { epoch } => {
                    cross_validation_loss =
                        self.cross_validate(data_rx, epoch, plan.num_cross_validation_batches)?;
                    TrainerState::Checkpointing { epoch }
                }
                TrainerState::Checkpointing { epoch } => {
                    let epoch_summary =
                        self.checkpoint(epoch, training_loss, cross_validation_loss)?;
                    summary.epochs.push(epoch_summary);

                    if epoch + 1 < plan.num_epochs {
                        TrainerState::TrainingEpoch { epoch: epoch + 1 }
                    } else {
                        TrainerState::Done
                    }
                }
                TrainerState::Done => break,
            };
        }

        summary.best_cross_validation_loss = self.best_tracker.best();
        info!("training finished");
        Ok(summary)
    }

    fn train_epoch(
        &mut self,
        data_rx: &flume::Receiver<BatchRecord>,
        epoch: usize,
        num_batches: usize,
    ) -> Result<f64> {
        let mut losses = Vec::with_capacity(num_batches);
        let mut rate_counter = RateCounter::with_second_interval();

        for _ in 0..num_batches {
            let record = next_batch(data_rx, epoch, Phase::Training)?;
            let loss = self.train_step(&record)?;
            losses.push(loss);

            rate_counter.add(1.0);
            if let Some(rate) = rate_counter.rate() {
                info!(
                    "epoch: {}\tstep: {}\tloss: {:.5}\tlr: {:.5}\t{:.2} batches/s",
                    epoch,
                    self.training_step,
                    loss,
                    self.lr_scheduler.lr(),
                    rate
                );
            }
        }

        Ok(mean(&losses))
    }

    fn train_step(&mut self, record: &BatchRecord) -> Result<f64> {
        let BatchRecord {
            epoch,
            index,
            ref fids,
            ref images,
            ..
        } = *record;

        let images = images.to_device(self.device);
        let scores = self.model.forward_t(&images, true)?;
        let targets = self.labels.targets(fids, self.device)?;
        let loss = self.loss_fn.forward(&scores, &targets)?;

        let loss_value = f64::from(&loss);
        ensure!(
            loss_value.is_finite(),
            "non-finite loss {} at epoch {} in training on frames {:?}",
            loss_value,
            epoch,
            fids
        );

        loss.backward();
        self.optimizer.step();
        self.optimizer.zero_grad();

        // save checkpoint
        if index % self.save_steps == 0 {
            utils::save_checkpoint(&*self.model, &self.checkpoint_path)?;
            if self.visualize {
                let fid = fids[0];
                let prediction = tch::no_grad(|| scores.softmax(1, Kind::Float).i((0..1, 1..2)));
                let ground_truth = self.labels.keep_ratio(fid)?;
                self.send_log(LoggingMessage::new_overlay(
                    "overlay",
                    self.training_step,
                    fid,
                    &images.i(0),
                    &prediction,
                    &ground_truth,
                ))?;
            }
        }

        let keep = KeepStats::from_scores(&scores)?;
        trace!(
            "keep probability min: {:.4}\tmean: {:.4}\tstd: {:.4}",
            keep.min,
            keep.mean,
            keep.std
        );
        self.send_log(LoggingMessage::new_training_step(
            "training",
            self.training_step,
            loss_value,
            self.lr_scheduler.lr(),
            keep,
        ))?;
        self.training_step += 1;

        Ok(loss_value)
    }

    fn cross_validate(
        &mut self,
        data_rx: &flume::Receiver<BatchRecord>,
        epoch: usize,
        num_batches: usize,
    ) -> Result<f64> {
        let losses: Vec<f64> = (0..num_batches)
            .map(|_| -> Result<_> {
                let record = next_batch(data_rx, epoch, Phase::CrossValidation)?;
                let loss = tch::no_grad(|| -> Result<_> {
                    let images = record.images.to_device(self.device);
                    let scores = self.model.forward_t(&images, false)?;
                    let targets = self.labels.targets(&record.fids, self.device)?;
                    let loss = self.loss_fn.forward(&scores, &targets)?;
                    Ok(f64::from(&loss))
                })?;
                ensure!(
                    loss.is_finite(),
                    "non-finite loss {} at epoch {} in cross validation on frames {:?}",
                    loss,
                    epoch,
                    record.fids
                );
                Ok(loss)
            })
            .try_collect()?;

        Ok(mean(&losses))
    }

    fn checkpoint(
        &mut self,
        epoch: usize,
        training_loss: f64,
        cross_validation_loss: f64,
    ) -> Result<EpochSummary> {
        let lr = self.lr_scheduler.lr();

        let best_updated = self.best_tracker.update(cross_validation_loss);
        if best_updated {
            let path = utils::best_checkpoint_path(&self.checkpoint_path);
            utils::save_checkpoint(&*self.model, &path)?;
            info!(
                "saved best checkpoint '{}' with cross validation loss {:.5}",
                path.display(),
                cross_validation_loss
            );
        }

        let next_lr = self.lr_scheduler.step(cross_validation_loss);
        self.optimizer.set_lr(next_lr);

        info!(
            "epoch: {}\ttraining loss: {:.5}\tcross validation loss: {:.5}\tlr: {:.5}",
            epoch, training_loss, cross_validation_loss, lr
        );
        self.send_log(LoggingMessage::new_epoch(
            "epoch",
            epoch,
            training_loss,
            cross_validation_loss,
            lr,
        ))?;

        Ok(EpochSummary {
            epoch,
            training_loss,
            cross_validation_loss,
            lr,
            best_updated,
        })
    }

    fn send_log(&self, msg: LoggingMessage) -> Result<()> {
        if let Some(logging_tx) = &self.logging_tx {
            logging_tx
                .send(msg)
                .map_err(|_err| format_err!("cannot send message to logger"))?;
        }
        Ok(())
    }
}

fn next_batch(
    data_rx: &flume::Receiver<BatchRecord>,
    epoch: usize,
    phase: Phase,
) -> Result<BatchRecord> {
    let record = data_rx.recv().map_err(|_| {
        format_err!(
            "the data feeder stopped before {:?} of epoch {} finished",
            phase,
            epoch
        )
    })?;
    ensure!(
        record.epoch == epoch && record.phase == phase,
        "expect a {:?} batch of epoch {}, but get a {:?} batch of epoch {}",
        phase,
        epoch,
        record.phase,
        record.epoch
    );
    Ok(record)
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

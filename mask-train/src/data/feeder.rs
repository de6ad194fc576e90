use super::{load_batch, DatasetSplit, FrameSource};
use crate::common::*;

/// The phase a batch belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Training,
    CrossValidation,
}

/// A batch of frames delivered to the training worker.
#[derive(Debug)]
pub struct BatchRecord {
    pub epoch: usize,
    pub phase: Phase,
    /// The batch index within the phase.
    pub index: usize,
    pub fids: Vec<i64>,
    /// The `[B, 3, H, W]` frames.
    pub images: Tensor,
}

/// Options of the feeding worker.
#[derive(Debug, Clone)]
pub struct FeederInit {
    pub num_epochs: usize,
    pub batch_size: usize,
    pub num_workers: usize,
    /// The seed of the per-epoch training order.
    pub seed: u64,
}

/// Loads batches in the order the training worker consumes them.
///
/// Each epoch yields the shuffled training batches followed by the cross validation
/// batches. Frames are decoded by up to `num_workers` blocking tasks concurrently, while
/// the delivery order is kept. The worker stops early when the receiver is dropped.
pub async fn feeding_worker(
    source: Arc<dyn FrameSource>,
    split: Arc<DatasetSplit>,
    init: FeederInit,
    data_tx: flume::Sender<BatchRecord>,
) -> Result<()> {
    let FeederInit {
        num_epochs,
        batch_size,
        num_workers,
        seed,
    } = init;

    for epoch in 0..num_epochs {
        let mut rng = StdRng::seed_from_u64(seed.wrapping_add(epoch as u64 + 1));
        let training = split
            .training_batches(batch_size, &mut rng)
            .into_iter()
            .enumerate()
            .map(|(index, fids)| (Phase::Training, index, fids));
        let cross_validation = split
            .cross_validation_batches(batch_size)
            .into_iter()
            .enumerate()
            .map(|(index, fids)| (Phase::CrossValidation, index, fids));
        let plan: Vec<_> = training.chain(cross_validation).collect();

        let mut records = stream::iter(plan)
            .map(|(phase, index, fids)| {
                let source = source.clone();
                tokio::task::spawn_blocking(move || -> Result<_> {
                    let images = load_batch(&*source, &fids)?;
                    Ok(BatchRecord {
                        epoch,
                        phase,
                        index,
                        fids,
                        images,
                    })
                })
                .map(|result| Fallible::Ok(result??))
            })
            .buffered(num_workers.max(1));

        while let Some(record) = records.next().await {
            let record = record?;
            if data_tx.send_async(record).await.is_err() {
                debug!("the batch receiver is closed, stop feeding");
                return Ok(());
            }
        }
        debug!("finished feeding epoch {}", epoch);
    }

    Ok(())
}

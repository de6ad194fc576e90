use crate::{common::*, config::PlateauConfig};

/// Reduces the learning rate when the monitored loss stops improving.
///
/// An epoch improves when its loss is less than `best * (1 - threshold)`. After more than
/// `patience` epochs without improvement, the rate is multiplied by `factor`, bounded below
/// by `min_lr`, and the following `cooldown` epochs are not counted.
#[derive(Debug, Clone)]
pub struct LrScheduler {
    lr: f64,
    factor: f64,
    patience: usize,
    threshold: f64,
    cooldown: usize,
    min_lr: f64,
    best: f64,
    num_bad_epochs: usize,
    cooldown_counter: usize,
}

impl LrScheduler {
    const EPS: f64 = 1e-8;

    pub fn new(init_lr: f64, config: &PlateauConfig) -> Result<Self> {
        let PlateauConfig {
            factor,
            patience,
            threshold,
            cooldown,
            min_lr,
        } = *config;
        ensure!(init_lr > 0.0, "the lr must be positive");
        ensure!(
            factor > 0.0 && factor < 1.0,
            "the factor must be in range (0, 1)"
        );
        ensure!(threshold >= 0.0, "the threshold must be non-negative");
        ensure!(min_lr >= 0.0, "the min_lr must be non-negative");

        Ok(Self {
            lr: init_lr,
            factor,
            patience,
            threshold,
            cooldown,
            min_lr,
            best: f64::INFINITY,
            num_bad_epochs: 0,
            cooldown_counter: 0,
        })
    }

    pub fn lr(&self) -> f64 {
        self.lr
    }

    /// Feeds the loss of an epoch and returns the learning rate for the next epoch.
    pub fn step(&mut self, loss: f64) -> f64 {
        if loss < self.best * (1.0 - self.threshold) {
            self.best = loss;
            self.num_bad_epochs = 0;
        } else {
            self.num_bad_epochs += 1;
        }

        if self.cooldown_counter > 0 {
            self.cooldown_counter -= 1;
            self.num_bad_epochs = 0;
        }

        if self.num_bad_epochs > self.patience {
            let new_lr = (self.lr * self.factor).max(self.min_lr);
            if self.lr - new_lr > Self::EPS {
                info!("reduce learning rate from {} to {}", self.lr, new_lr);
                self.lr = new_lr;
            }
            self.cooldown_counter = self.cooldown;
            self.num_bad_epochs = 0;
        }

        self.lr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn reduce_after_patience() -> Result<()> {
        let config = PlateauConfig {
            patience: 2,
            ..Default::default()
        };
        let mut scheduler = LrScheduler::new(1.0, &config)?;

        assert_eq!(scheduler.step(1.0), 1.0);
        assert_eq!(scheduler.step(0.5), 1.0);
        // 3 epochs without improvement
        assert_eq!(scheduler.step(0.5), 1.0);
        assert_eq!(scheduler.step(0.6), 1.0);
        assert_abs_diff_eq!(scheduler.step(0.5), 0.1, epsilon = 1e-12);

        // improvements reset the counter
        assert_abs_diff_eq!(scheduler.step(0.1), 0.1, epsilon = 1e-12);
        assert_abs_diff_eq!(scheduler.step(0.1), 0.1, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn cooldown_and_lower_bound() -> Result<()> {
        let config = PlateauConfig {
            factor: 0.5,
            patience: 0,
            threshold: 0.0,
            cooldown: 1,
            min_lr: 0.3,
        };
        let mut scheduler = LrScheduler::new(1.0, &config)?;

        assert_eq!(scheduler.step(1.0), 1.0);
        assert_eq!(scheduler.step(1.0), 0.5);
        // cooling down
        assert_eq!(scheduler.step(1.0), 0.5);
        assert_eq!(scheduler.step(1.0), 0.3);
        assert_eq!(scheduler.step(1.0), 0.3);
        assert_eq!(scheduler.step(1.0), 0.3);
        Ok(())
    }

    #[test]
    fn reject_invalid_factor() {
        let config = PlateauConfig {
            factor: 1.5,
            ..Default::default()
        };
        assert!(LrScheduler::new(1.0, &config).is_err());
    }
}

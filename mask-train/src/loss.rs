//! Training loss of mask generators.

use crate::common::*;

/// Spatial two-class cross entropy between `[B, 2, h, w]` scores and `[B, 1, h, w]` binary
/// targets, mean-reduced over batch and tiles.
///
/// With a positive `gamma`, each term is scaled by `(1 - p)^gamma` where `p` is the
/// predicted probability of the target class, so confident tiles contribute less.
pub fn tile_cross_entropy(scores: &Tensor, target: &Tensor, gamma: f64) -> Result<Tensor> {
    let (bsize, channels, grid_h, grid_w) = scores.size4()?;
    ensure!(channels == 2, "expect 2 score channels, but get {}", channels);
    ensure!(
        target.size() == [bsize, 1, grid_h, grid_w],
        "target shape {:?} does not match score shape {:?}",
        target.size(),
        scores.size()
    );

    let log_prob = scores
        .log_softmax(1, Kind::Float)
        .gather(1, &target.to_kind(Kind::Int64), false);
    let loss = if gamma > 0.0 {
        let factor = (-log_prob.exp() + 1.0).pow(&gamma.into());
        -(factor * &log_prob)
    } else {
        -log_prob
    };
    Ok(loss.mean(Kind::Float))
}

/// The sum of weighted cross entropy terms over label levels.
#[derive(Debug, Clone)]
pub struct SaliencyLoss {
    gamma: f64,
}

impl SaliencyLoss {
    pub fn new(gamma: f64) -> Result<Self> {
        ensure!(
            gamma.is_finite() && gamma >= 0.0,
            "the focal gamma must be non-negative"
        );
        Ok(Self { gamma })
    }

    /// Computes `sum(weight * cross_entropy(scores, target))` over `(weight, target)` levels.
    pub fn forward(&self, scores: &Tensor, targets: &[(f64, Tensor)]) -> Result<Tensor> {
        ensure!(!targets.is_empty(), "no label levels are given");
        let terms: Vec<Tensor> = targets
            .iter()
            .map(|(weight, target)| -> Result<_> {
                Ok(tile_cross_entropy(scores, target, self.gamma)? * *weight)
            })
            .try_collect()?;
        Ok(Tensor::stack(&terms, 0).sum(Kind::Float))
    }
}

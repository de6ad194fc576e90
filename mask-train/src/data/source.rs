use crate::common::*;

/// A random accessible collection of frames of the same size.
pub trait FrameSource
where
    Self: Debug + Send + Sync,
{
    /// The identity of the source. It takes part in the saliency cache key.
    fn description(&self) -> String;

    /// The frame ids in temporal order.
    fn frame_ids(&self) -> &[i64];

    /// The `(height, width)` of every frame.
    fn frame_size(&self) -> (i64, i64);

    /// Loads the frame as a `[3, H, W]` float tensor with values in `[0, 1]`.
    fn load(&self, fid: i64) -> Result<Tensor>;
}

/// Loads frames and stacks them into a `[B, 3, H, W]` batch.
pub fn load_batch(source: &dyn FrameSource, fids: &[i64]) -> Result<Tensor> {
    ensure!(!fids.is_empty(), "cannot load an empty batch");
    let images: Vec<_> = fids
        .iter()
        .map(|&fid| {
            source
                .load(fid)
                .with_context(|| format!("failed to load frame {}", fid))
        })
        .try_collect()?;
    Ok(Tensor::stack(&images, 0))
}

use super::FrameSource;
use crate::common::*;

/// Frames held in memory.
#[derive(Debug, Clone)]
pub struct MemorySource {
    name: String,
    frame_ids: Vec<i64>,
    frame_size: (i64, i64),
    frames: Vec<Vec<f32>>,
}

impl MemorySource {
    /// Builds the source from `[3, H, W]` frames. Frame ids are assigned in order.
    pub fn new(name: impl Into<String>, frames: impl IntoIterator<Item = Tensor>) -> Result<Self> {
        let mut frame_size = None;
        let frames: Vec<Vec<f32>> = frames
            .into_iter()
            .enumerate()
            .map(|(fid, frame)| -> Result<_> {
                let (channels, height, width) = frame.size3()?;
                ensure!(channels == 3, "frame {} must have 3 channels", fid);
                let expect = *frame_size.get_or_insert((height, width));
                ensure!(
                    (height, width) == expect,
                    "frame {} has size {}x{}, but expect {}x{}",
                    fid,
                    height,
                    width,
                    expect.0,
                    expect.1
                );
                Ok(Vec::<f32>::from(
                    &frame.to_kind(Kind::Float).contiguous().view([-1]),
                ))
            })
            .try_collect()?;
        let frame_size = frame_size.ok_or_else(|| format_err!("no frames are given"))?;

        Ok(Self {
            name: name.into(),
            frame_ids: (0..frames.len() as i64).collect(),
            frame_size,
            frames,
        })
    }
}

impl FrameSource for MemorySource {
    fn description(&self) -> String {
        format!("memory:{}:{}", self.name, self.frames.len())
    }

    fn frame_ids(&self) -> &[i64] {
        &self.frame_ids
    }

    fn frame_size(&self) -> (i64, i64) {
        self.frame_size
    }

    fn load(&self, fid: i64) -> Result<Tensor> {
        let values = usize::try_from(fid)
            .ok()
            .and_then(|index| self.frames.get(index))
            .ok_or_else(|| format_err!("frame id {} is out of range", fid))?;
        let (height, width) = self.frame_size;
        Ok(Tensor::of_slice(values).view([3, height, width]))
    }
}

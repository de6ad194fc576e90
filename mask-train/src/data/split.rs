use crate::common::*;

/// The training and cross validation partitions of the frame ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetSplit {
    training: Vec<i64>,
    cross_validation: Vec<i64>,
}

impl DatasetSplit {
    /// Splits frame ids with a seeded permutation.
    ///
    /// If `subset_ratio` is set, `ceil(subset_ratio * n)` frames are drawn first. The drawn
    /// frames are then split into `ceil(train_ratio * m)` training frames and the rest for
    /// cross validation. Both partitions are kept in frame id order.
    pub fn new(
        frame_ids: &[i64],
        subset_ratio: Option<f64>,
        train_ratio: f64,
        seed: u64,
    ) -> Result<Self> {
        ensure!(
            train_ratio > 0.0 && train_ratio < 1.0,
            "train_ratio must be in range (0, 1)"
        );
        ensure!(
            frame_ids.iter().all_unique(),
            "frame ids must not contain duplicates"
        );

        let mut rng = StdRng::seed_from_u64(seed);
        let mut ids = frame_ids.to_vec();
        ids.shuffle(&mut rng);

        if let Some(ratio) = subset_ratio {
            ensure!(
                ratio > 0.0 && ratio <= 1.0,
                "subset_ratio must be in range (0, 1]"
            );
            let len = (ids.len() as f64 * ratio).ceil() as usize;
            ids.truncate(len);
        }

        let num_training = (ids.len() as f64 * train_ratio).ceil() as usize;
        let mut cross_validation = ids.split_off(num_training.min(ids.len()));
        let mut training = ids;
        training.sort_unstable();
        cross_validation.sort_unstable();

        ensure!(
            !training.is_empty() && !cross_validation.is_empty(),
            "cannot split {} frames into non-empty training and cross validation sets",
            training.len() + cross_validation.len()
        );

        Ok(Self {
            training,
            cross_validation,
        })
    }

    pub fn training(&self) -> &[i64] {
        &self.training
    }

    pub fn cross_validation(&self) -> &[i64] {
        &self.cross_validation
    }

    /// All frame ids in use, in frame id order.
    pub fn all(&self) -> Vec<i64> {
        self.training
            .iter()
            .chain(self.cross_validation.iter())
            .copied()
            .sorted()
            .collect()
    }

    /// Groups shuffled training frames into batches.
    pub fn training_batches(&self, batch_size: usize, rng: &mut StdRng) -> Vec<Vec<i64>> {
        let mut ids = self.training.clone();
        ids.shuffle(rng);
        chunk(&ids, batch_size)
    }

    /// Groups cross validation frames into batches in frame id order.
    pub fn cross_validation_batches(&self, batch_size: usize) -> Vec<Vec<i64>> {
        chunk(&self.cross_validation, batch_size)
    }
}

/// The number of batches of `len` items, the last one possibly partial.
pub fn num_batches(len: usize, batch_size: usize) -> usize {
    (len + batch_size - 1) / batch_size
}

fn chunk(ids: &[i64], batch_size: usize) -> Vec<Vec<i64>> {
    ids.chunks(batch_size.max(1)).map(|ids| ids.to_vec()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_is_deterministic_and_disjoint() -> Result<()> {
        let ids: Vec<i64> = (0..10).collect();
        let split = DatasetSplit::new(&ids, None, 0.7, 100)?;
        assert_eq!(split, DatasetSplit::new(&ids, None, 0.7, 100)?);
        assert_eq!(split.training().len(), 7);
        assert_eq!(split.cross_validation().len(), 3);

        let training: HashSet<_> = split.training().iter().collect();
        assert!(split
            .cross_validation()
            .iter()
            .all(|fid| !training.contains(fid)));
        assert_eq!(split.all(), ids);
        Ok(())
    }

    #[test]
    fn subset_is_drawn_before_split() -> Result<()> {
        let ids: Vec<i64> = (0..20).collect();
        let split = DatasetSplit::new(&ids, Some(0.25), 0.5, 7)?;
        assert_eq!(split.all().len(), 5);
        assert_eq!(split.training().len(), 3);
        assert_eq!(split.cross_validation().len(), 2);
        Ok(())
    }

    #[test]
    fn reject_empty_partition() {
        assert!(DatasetSplit::new(&[0], None, 0.7, 100).is_err());
        assert!(DatasetSplit::new(&[0, 1], None, 1.0, 100).is_err());
    }

    #[test]
    fn batches_cover_every_frame() -> Result<()> {
        let ids: Vec<i64> = (0..9).collect();
        let split = DatasetSplit::new(&ids, None, 0.6, 3)?;
        let mut rng = StdRng::seed_from_u64(1);
        let batches = split.training_batches(2, &mut rng);
        assert_eq!(batches.len(), num_batches(split.training().len(), 2));

        let covered: Vec<i64> = batches.into_iter().flatten().sorted().collect();
        assert_eq!(covered, split.training());
        assert_eq!(
            split.cross_validation_batches(2).concat(),
            split.cross_validation()
        );
        Ok(())
    }
}

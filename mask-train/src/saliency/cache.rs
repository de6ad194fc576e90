use super::{LabelLevel, SaliencyLabels};
use crate::{common::*, config::OracleConfig, utils::write_atomic};
use sha2::{Digest, Sha256};

const KEY_NAME: &str = "key";
const FIDS_NAME: &str = "fids";
const THRESHOLDS_NAME: &str = "thresholds";
const LEVEL_PREFIX: &str = "level_";

/// The inputs that determine gradient saliency labels.
#[derive(Debug, Serialize)]
pub struct CacheKey<'a> {
    pub source: String,
    pub frame_ids: &'a [i64],
    pub frame_size: (i64, i64),
    pub tile_size: i64,
    pub thresholds: &'a [R64],
    pub blank_mean: [f64; 3],
    pub confidence_threshold: R64,
    pub class_whitelist: Option<Vec<i64>>,
    pub oracle: &'a OracleConfig,
}

impl CacheKey<'_> {
    /// The hex encoded SHA-256 digest of the key.
    pub fn digest(&self) -> Result<String> {
        let bytes = serde_json::to_vec(self)?;
        Ok(format!("{:x}", Sha256::digest(&bytes)))
    }
}

/// Writes gradient labels along with the cache key.
pub fn save_cache(path: &Path, key: &str, labels: &SaliencyLabels) -> Result<()> {
    let levels = labels.levels();
    let fids: Vec<i64> = levels
        .first()
        .map(|level| level.grids().keys().copied().sorted().collect())
        .unwrap_or_default();
    let thresholds: Vec<f64> = levels
        .iter()
        .map(|level| {
            level
                .threshold
                .map(|thresh| thresh.raw())
                .ok_or_else(|| format_err!("only thresholded labels can be cached"))
        })
        .try_collect()?;

    let level_tensors: Vec<Tensor> = levels
        .iter()
        .map(|level| -> Result<_> {
            let grids: Vec<_> = fids
                .iter()
                .map(|&fid| level.get(fid).map(|grid| grid.to_kind(Kind::Uint8)))
                .try_collect()?;
            Ok(Tensor::cat(&grids, 0))
        })
        .try_collect()?;
    let level_names: Vec<String> = (0..levels.len())
        .map(|index| format!("{}{}", LEVEL_PREFIX, index))
        .collect();

    let key_tensor = Tensor::of_slice(key.as_bytes());
    let fids_tensor = Tensor::of_slice(&fids);
    let thresholds_tensor = Tensor::of_slice(&thresholds);

    let named: Vec<(&str, &Tensor)> = [
        (KEY_NAME, &key_tensor),
        (FIDS_NAME, &fids_tensor),
        (THRESHOLDS_NAME, &thresholds_tensor),
    ]
    .into_iter()
    .chain(izip!(&level_names, &level_tensors).map(|(name, tensor)| (name.as_str(), tensor)))
    .collect();

    write_atomic(path, |tmp_path| {
        Tensor::save_multi(&named, tmp_path)?;
        Ok(())
    })
}

/// Loads cached gradient labels. Returns `None` if the cache is absent, unreadable or
/// derived from different inputs.
pub fn load_cache(path: &Path, key: &str) -> Result<Option<SaliencyLabels>> {
    if !path.is_file() {
        info!("no saliency cache found at '{}'", path.display());
        return Ok(None);
    }

    let tensors: HashMap<String, Tensor> = match Tensor::load_multi(path) {
        Ok(tensors) => tensors.into_iter().collect(),
        Err(err) => {
            warn!(
                "unable to read saliency cache '{}', labels will be re-derived: {}",
                path.display(),
                err
            );
            return Ok(None);
        }
    };

    let stored_key = tensors
        .get(KEY_NAME)
        .map(|tensor| String::from_utf8_lossy(&Vec::<u8>::from(tensor)).into_owned());
    if stored_key.as_deref() != Some(key) {
        warn!(
            "the saliency cache '{}' was derived from different inputs, labels will be re-derived",
            path.display()
        );
        return Ok(None);
    }

    let get = |name: &str| -> Result<&Tensor> {
        tensors
            .get(name)
            .ok_or_else(|| format_err!("the saliency cache '{}' lacks '{}'", path.display(), name))
    };
    let fids = Vec::<i64>::from(get(FIDS_NAME)?);
    let thresholds = Vec::<f64>::from(get(THRESHOLDS_NAME)?);

    let mut grid_size = None;
    let levels: Vec<_> = thresholds
        .iter()
        .enumerate()
        .map(|(index, &threshold)| -> Result<_> {
            let stacked = get(&format!("{}{}", LEVEL_PREFIX, index))?;
            let (num, _, grid_h, grid_w) = stacked.size4()?;
            ensure!(
                num == fids.len() as i64,
                "the saliency cache '{}' is corrupted",
                path.display()
            );
            grid_size = Some((grid_h, grid_w));

            let grids: HashMap<i64, Tensor> = fids
                .iter()
                .enumerate()
                .map(|(row, &fid)| (fid, stacked.narrow(0, row as i64, 1).to_kind(Kind::Bool)))
                .collect();
            Ok(LabelLevel::new(
                Some(r64(threshold)),
                threshold,
                grids,
                None,
            ))
        })
        .try_collect()?;

    let grid_size =
        grid_size.ok_or_else(|| format_err!("the saliency cache '{}' is empty", path.display()))?;
    Ok(Some(SaliencyLabels::new(grid_size, levels)?))
}

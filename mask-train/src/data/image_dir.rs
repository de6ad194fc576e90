use super::FrameSource;
use crate::common::*;
use image::{imageops::FilterType, FlatSamples, GenericImageView};
use sha2::{Digest, Sha256};
use std::time::UNIX_EPOCH;

/// Frames stored as image files in a directory.
///
/// Files are sorted by name and the frame id is the position in that order. Each image is
/// scaled down to fit the canonical frame size if it is larger, and centered on a canvas
/// filled with the pad color.
#[derive(Debug, Clone)]
pub struct ImageDirSource {
    dir: PathBuf,
    paths: Vec<PathBuf>,
    fingerprint: String,
    frame_ids: Vec<i64>,
    frame_size: (i64, i64),
    pad_color: [u8; 3],
}

impl ImageDirSource {
    pub fn open(
        dir: impl AsRef<Path>,
        extensions: &[String],
        frame_size: [usize; 2],
        pad_color: [u8; 3],
    ) -> Result<Self> {
        let dir = dir.as_ref();
        ensure!(
            dir.is_dir(),
            "the frame directory '{}' does not exist",
            dir.display()
        );

        let extensions: HashSet<String> = extensions
            .iter()
            .map(|ext| ext.trim_start_matches('.').to_lowercase())
            .collect();
        let pattern = dir.join("*");
        let pattern = pattern
            .to_str()
            .ok_or_else(|| format_err!("non-UTF-8 path '{}'", dir.display()))?;

        let paths: Vec<PathBuf> = glob::glob(pattern)?
            .map(|entry| -> Result<_> { Ok(entry?) })
            .filter_ok(|path| {
                path.is_file()
                    && path
                        .extension()
                        .and_then(|ext| ext.to_str())
                        .map(|ext| extensions.contains(&ext.to_lowercase()))
                        .unwrap_or(false)
            })
            .try_collect::<_, Vec<_>, _>()?
            .into_iter()
            .sorted()
            .collect();
        ensure!(
            !paths.is_empty(),
            "no image files found in '{}'",
            dir.display()
        );

        let fingerprint = fingerprint(&paths)?;
        let [frame_h, frame_w] = frame_size;
        let frame_ids = (0..paths.len() as i64).collect();
        info!("found {} frames in '{}'", paths.len(), dir.display());

        Ok(Self {
            dir: dir.to_owned(),
            paths,
            fingerprint,
            frame_ids,
            frame_size: (frame_h as i64, frame_w as i64),
            pad_color,
        })
    }

    pub fn path(&self, fid: i64) -> Option<&Path> {
        usize::try_from(fid)
            .ok()
            .and_then(|index| self.paths.get(index))
            .map(|path| path.as_path())
    }
}

/// Hashes the name, length and modification time of every file, so that replaced or
/// renamed frames change the dataset identity.
fn fingerprint(paths: &[PathBuf]) -> Result<String> {
    let mut hasher = Sha256::new();
    for path in paths {
        let metadata = fs::metadata(path)
            .with_context(|| format!("failed to read metadata of '{}'", path.display()))?;
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map(|elapsed| elapsed.as_nanos())
            .unwrap_or(0);
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_default();

        hasher.update(name.as_bytes());
        hasher.update(&[0u8]);
        hasher.update(&metadata.len().to_le_bytes());
        hasher.update(&mtime.to_le_bytes());
    }
    Ok(format!("{:x}", hasher.finalize()))
}

impl FrameSource for ImageDirSource {
    fn description(&self) -> String {
        format!(
            "image_dir:{}:{}:{}",
            self.dir.display(),
            self.paths.len(),
            self.fingerprint
        )
    }

    fn frame_ids(&self) -> &[i64] {
        &self.frame_ids
    }

    fn frame_size(&self) -> (i64, i64) {
        self.frame_size
    }

    fn load(&self, fid: i64) -> Result<Tensor> {
        let path = self
            .path(fid)
            .ok_or_else(|| format_err!("frame id {} is out of range", fid))?;
        let image = image::io::Reader::open(path)
            .with_context(|| format!("failed to open {}", path.display()))?
            .with_guessed_format()
            .with_context(|| {
                format!(
                    "failed to determine the image file format: {}",
                    path.display()
                )
            })?
            .decode()
            .with_context(|| format!("failed to decode image file: {}", path.display()))?;

        let (frame_h, frame_w) = self.frame_size;
        let (orig_h, orig_w) = (image.height() as i64, image.width() as i64);

        // shrink only when the image does not fit
        let (image_h, image_w, image) = if orig_h > frame_h || orig_w > frame_w {
            let ratio = (frame_h as f64 / orig_h as f64).min(frame_w as f64 / orig_w as f64);
            let image_h = ((orig_h as f64 * ratio) as i64).clamp(1, frame_h);
            let image_w = ((orig_w as f64 * ratio) as i64).clamp(1, frame_w);
            let image = image.resize_exact(image_w as u32, image_h as u32, FilterType::CatmullRom);
            (image_h, image_w, image)
        } else {
            (orig_h, orig_w, image)
        };

        let FlatSamples { samples, .. } = image.to_rgb8().into_flat_samples();
        let pixels = tch::no_grad(|| {
            Tensor::of_slice(&samples)
                .to_kind(Kind::Float)
                .view([image_h, image_w, 3])
                .permute(&[2, 0, 1])
                / 255.0
        });

        letterbox(&pixels, self.frame_size, self.pad_color)
    }
}

/// Centers a `[3, h, w]` image on a `[3, H, W]` canvas filled with `pad_color`.
pub fn letterbox(image: &Tensor, frame_size: (i64, i64), pad_color: [u8; 3]) -> Result<Tensor> {
    let (channels, image_h, image_w) = image.size3()?;
    let (frame_h, frame_w) = frame_size;
    ensure!(
        channels == 3 && image_h <= frame_h && image_w <= frame_w,
        "cannot place a {}x{}x{} image on a {}x{} frame",
        channels,
        image_h,
        image_w,
        frame_h,
        frame_w
    );
    let top = (frame_h - image_h) / 2;
    let left = (frame_w - image_w) / 2;

    let canvas = tch::no_grad(|| {
        let pad: Vec<f32> = pad_color.iter().map(|&c| c as f32 / 255.0).collect();
        let canvas = Tensor::of_slice(&pad)
            .view([3, 1, 1])
            .expand(&[3, frame_h, frame_w], false)
            .contiguous();
        canvas
            .narrow(1, top, image_h)
            .narrow(2, left, image_w)
            .copy_(image);
        canvas
    });
    Ok(canvas)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn letterbox_centers_image() -> Result<()> {
        let image = Tensor::ones(&[3, 2, 2], FLOAT_CPU);
        let output = letterbox(&image, (4, 5), [0, 0, 0])?;
        assert!(letterbox(&image, (1, 5), [0, 0, 0]).is_err());
        assert_eq!(output.size(), [3, 4, 5]);

        // rows 1..3, cols 1..3 are covered
        let row: Vec<f32> = Vec::from(&output.i((0, 1, ..)));
        assert_eq!(row, vec![0.0, 1.0, 1.0, 0.0, 0.0]);
        let col: Vec<f32> = Vec::from(&output.i((2, .., 2)));
        assert_eq!(col, vec![0.0, 1.0, 1.0, 0.0]);
        Ok(())
    }

    #[test]
    fn load_and_pad_image_files() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("mask-train-image-dir-{}", std::process::id()));
        fs::create_dir_all(&dir)?;

        // larger than the frame, shrinked by half
        image::RgbImage::from_pixel(8, 4, image::Rgb([255, 0, 0])).save(dir.join("b.png"))?;
        // smaller than the frame, kept as is
        image::RgbImage::from_pixel(2, 2, image::Rgb([0, 255, 0])).save(dir.join("a.png"))?;
        fs::write(dir.join("notes.txt"), "ignored")?;

        let source = ImageDirSource::open(&dir, &["png".into()], [4, 4], [0, 0, 255])?;
        assert_eq!(source.frame_ids(), &[0, 1]);
        assert_eq!(source.path(0), Some(dir.join("a.png").as_path()));

        let small = source.load(0)?;
        assert_eq!(small.size(), [3, 4, 4]);
        assert_abs_diff_eq!(f64::from(small.i((1, 1, 1))), 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(f64::from(small.i((2, 0, 0))), 1.0, epsilon = 1e-6);

        let large = source.load(1)?;
        assert_eq!(large.size(), [3, 4, 4]);
        assert_abs_diff_eq!(f64::from(large.i((0, 2, 2))), 1.0, epsilon = 1e-2);
        assert_abs_diff_eq!(f64::from(large.i((2, 0, 0))), 1.0, epsilon = 1e-6);

        assert!(source.load(2).is_err());
        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn description_tracks_file_changes() -> Result<()> {
        let dir = std::env::temp_dir().join(format!(
            "mask-train-image-dir-desc-{}",
            std::process::id()
        ));
        fs::create_dir_all(&dir)?;
        image::RgbImage::from_pixel(2, 2, image::Rgb([0, 0, 0])).save(dir.join("a.png"))?;
        image::RgbImage::from_pixel(2, 2, image::Rgb([0, 0, 0])).save(dir.join("b.png"))?;

        let open = || ImageDirSource::open(&dir, &["png".into()], [2, 2], [0, 0, 0]);
        let original = open()?.description();
        assert_eq!(open()?.description(), original);

        // same number of files, different content
        image::RgbImage::from_pixel(3, 5, image::Rgb([9, 8, 7])).save(dir.join("b.png"))?;
        let replaced = open()?.description();
        assert_ne!(replaced, original);

        // same number of files, different names
        fs::rename(dir.join("b.png"), dir.join("c.png"))?;
        let renamed = open()?.description();
        assert_ne!(renamed, replaced);

        fs::remove_dir_all(&dir)?;
        Ok(())
    }
}

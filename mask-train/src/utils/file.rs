use crate::common::*;

pub const FILE_STRFTIME: &str = "%Y-%m-%d-%H-%M-%S.%3f%z";

/// Appends `suffix` to the file name of `path`.
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}

/// Writes a file through a temporary file and renames it to `path` on success, so readers
/// never see a partially written file.
pub fn write_atomic<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&Path) -> Result<()>,
{
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create directory '{}'", dir.display()))?;
        }
    }

    let tmp_path = with_suffix(path, ".tmp");
    if let Err(err) = write(&tmp_path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.context(format!("failed to write '{}'", path.display())));
    }
    fs::rename(&tmp_path, path).with_context(|| {
        format!(
            "failed to rename '{}' to '{}'",
            tmp_path.display(),
            path.display()
        )
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_write_keeps_old_file() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("mask-train-fs-{}", std::process::id()));
        let path = dir.join("sub").join("state.bin");
        write_atomic(&path, |tmp| Ok(fs::write(tmp, "old")?))?;
        assert_eq!(fs::read_to_string(&path)?, "old");

        let result = write_atomic(&path, |tmp| {
            fs::write(tmp, "partial")?;
            bail!("interrupted")
        });
        assert!(result.is_err());
        assert_eq!(fs::read_to_string(&path)?, "old");
        assert!(!with_suffix(&path, ".tmp").exists());

        assert_eq!(with_suffix(&path, ".best"), dir.join("sub").join("state.bin.best"));
        fs::remove_dir_all(&dir)?;
        Ok(())
    }
}

use anyhow::{bail, Result};
use mask_train::{
    config::{Config, ResumeMode},
    data::{FrameSource, MemorySource},
    detection::Detection,
    oracle::DetectionOracle,
    utils::best_checkpoint_path,
};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tch::{kind::FLOAT_CPU, Device, Kind, Tensor};

/// Detects a box on the top left quarter, and scores images by their distance to white
/// within target boxes.
#[derive(Debug)]
struct QuarterOracle;

impl DetectionOracle for QuarterOracle {
    fn name(&self) -> &str {
        "quarter"
    }

    fn inference(&self, _image: &Tensor) -> Result<Vec<Detection>> {
        Ok(vec![Detection::from_tlbr([0.0, 0.0, 0.5, 0.5], 0, 0.9)?])
    }

    fn loss(&self, image: &Tensor, targets: &[Detection]) -> Result<Tensor> {
        let (_, _, height, width) = image.size4()?;
        let mask = Tensor::zeros(&[1, 1, height, width], FLOAT_CPU);
        if !targets.is_empty() {
            let _ = mask.narrow(2, 0, height / 2).narrow(3, 0, width / 2).fill_(1.0);
        }
        let diff = -image + 1.0;
        Ok((&diff * &diff * mask).sum(Kind::Float))
    }
}

fn scratch_dir(name: &str) -> Result<PathBuf> {
    let dir = std::env::temp_dir().join(format!("mask-train-{}-{}", name, std::process::id()));
    if dir.exists() {
        fs::remove_dir_all(&dir)?;
    }
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

fn frames() -> Result<Arc<dyn FrameSource>> {
    let frames = (0..4).map(|_| Tensor::rand(&[3, 8, 8], FLOAT_CPU));
    Ok(Arc::new(MemorySource::new("synthetic", frames)?))
}

fn make_config(dir: &Path, labeling: &str, resume: &str, num_iterations: usize) -> Result<Config> {
    let text = format!(
        r#"{{
            checkpoint: {{ path: "{dir}/model.pt", resume: "{resume}" }},
            dataset: {{ kind: {{ type: "ImageDir", dir: "{dir}" }}, num_workers: 2, prefetch: 2 }},
            saliency: {{
                tile_size: 4,
                confidence_threshold: 0.5,
                kind: {labeling},
            }},
            model: {{ kind: "TileLinear" }},
            training: {{ num_iterations: {num_iterations}, batch_size: 2, save_steps: 1, lr: 0.01 }},
            logging: {{ log_file: "{dir}/train.log", dir: "{dir}/logs", visualize: true }},
        }}"#,
        dir = dir.display(),
        resume = resume,
        labeling = labeling,
        num_iterations = num_iterations,
    );
    let mut config: Config = json5::from_str(&text)?;
    config.training.device = Device::Cpu;
    Ok(config)
}

fn no_oracle() -> Result<Box<dyn DetectionOracle>> {
    bail!("the oracle must not be loaded")
}

fn count_files(dir: &Path, suffix: &str) -> Result<usize> {
    let pattern = format!("{}/**/*{}", dir.display(), suffix);
    Ok(glob::glob(&pattern)?.filter_map(|entry| entry.ok()).count())
}

#[tokio::test(flavor = "multi_thread")]
async fn geometric_training_saves_checkpoints() -> Result<()> {
    let dir = scratch_dir("geometric")?;
    fs::write(
        dir.join("gt.json"),
        r#"{
            "0": [ { "cycxhw": [0.25, 0.25, 0.5, 0.5], "class": 0, "score": 1.0 } ],
            "1": [ { "cycxhw": [0.75, 0.75, 0.5, 0.5], "class": 0, "score": 1.0 } ],
            "2": []
        }"#,
    )?;
    let labeling = format!(
        r#"{{ type: "Geometric", ground_truth_file: "{}/gt.json" }}"#,
        dir.display()
    );

    // the latest checkpoint exists after the first iteration
    let config = make_config(&dir, &labeling, "Disabled", 1)?;
    let checkpoint = config.checkpoint.path.clone();
    let summary = mask_train::run(Arc::new(config), frames()?, no_oracle).await?;
    assert_eq!(summary.epochs.len(), 1);
    assert!(summary.epochs[0].training_loss.is_finite());
    assert!(summary.epochs[0].training_loss >= 0.0);
    assert!(checkpoint.is_file());
    fs::remove_file(&checkpoint)?;
    fs::remove_file(best_checkpoint_path(&checkpoint))?;

    let config = make_config(&dir, &labeling, "Disabled", 2)?;
    let summary = mask_train::run(Arc::new(config), frames()?, no_oracle).await?;

    assert_eq!(summary.epochs.len(), 2);
    for (index, epoch) in summary.epochs.iter().enumerate() {
        assert_eq!(epoch.epoch, index);
        assert!(epoch.training_loss.is_finite() && epoch.training_loss >= 0.0);
        assert!(epoch.cross_validation_loss.is_finite() && epoch.cross_validation_loss >= 0.0);
    }
    assert!(summary.epochs[0].best_updated);

    let best = summary
        .epochs
        .iter()
        .map(|epoch| epoch.cross_validation_loss)
        .fold(f64::INFINITY, f64::min);
    assert_eq!(summary.best_cross_validation_loss, Some(best));

    assert!(checkpoint.is_file());
    assert!(best_checkpoint_path(&checkpoint).is_file());
    assert!(count_files(&dir.join("logs"), "_train.png")? >= 1);
    assert!(count_files(&dir.join("logs"), "_test.png")? >= 1);

    // resume from the saved checkpoint
    let config = config_with_resume(&dir, &labeling, ResumeMode::Required)?;
    let summary = mask_train::run(Arc::new(config), frames()?, no_oracle).await?;
    assert_eq!(summary.epochs.len(), 1);

    fs::remove_dir_all(&dir)?;
    Ok(())
}

fn config_with_resume(dir: &Path, labeling: &str, resume: ResumeMode) -> Result<Config> {
    let mut config = make_config(dir, labeling, "Disabled", 1)?;
    config.checkpoint.resume = resume;
    Ok(config)
}

#[tokio::test(flavor = "multi_thread")]
async fn required_resume_fails_without_checkpoint() -> Result<()> {
    let dir = scratch_dir("resume")?;
    fs::write(dir.join("gt.json"), "{}")?;
    let labeling = format!(
        r#"{{ type: "Geometric", ground_truth_file: "{}/gt.json" }}"#,
        dir.display()
    );

    let config = config_with_resume(&dir, &labeling, ResumeMode::Required)?;
    let result = mask_train::run(Arc::new(config), frames()?, no_oracle).await;
    assert!(result.is_err());

    fs::remove_dir_all(&dir)?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn required_resume_fails_before_labeling() -> Result<()> {
    let dir = scratch_dir("resume-gradient")?;
    let labeling = format!(
        r#"{{
            type: "Gradient",
            cache_file: "{}/saliency.pt",
            oracle: {{ type: "TorchScript", module_file: "unused.pt" }},
        }}"#,
        dir.display()
    );

    let oracle_loaded = Arc::new(AtomicBool::new(false));
    let load_oracle = {
        let oracle_loaded = oracle_loaded.clone();
        move || -> Result<Box<dyn DetectionOracle>> {
            oracle_loaded.store(true, Ordering::SeqCst);
            Ok(Box::new(QuarterOracle))
        }
    };

    let config = config_with_resume(&dir, &labeling, ResumeMode::Required)?;
    let result = mask_train::run(Arc::new(config), frames()?, load_oracle).await;
    assert!(result.is_err());
    assert!(!oracle_loaded.load(Ordering::SeqCst));
    assert!(!dir.join("saliency.pt").exists());

    fs::remove_dir_all(&dir)?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn gradient_labels_are_cached() -> Result<()> {
    let dir = scratch_dir("gradient")?;
    let labeling = format!(
        r#"{{
            type: "Gradient",
            cache_file: "{}/saliency.pt",
            thresholds: [0.1, 0.5],
            oracle: {{ type: "TorchScript", module_file: "unused.pt" }},
        }}"#,
        dir.display()
    );
    let source = frames()?;

    let config = make_config(&dir, &labeling, "Disabled", 1)?;
    let load_oracle = || -> Result<Box<dyn DetectionOracle>> { Ok(Box::new(QuarterOracle)) };
    let summary = mask_train::run(Arc::new(config), source.clone(), load_oracle).await?;
    assert_eq!(summary.epochs.len(), 1);
    assert!(summary.epochs[0].training_loss.is_finite());
    assert!(dir.join("saliency.pt").is_file());

    // labels are loaded from the cache without the oracle
    let config = make_config(&dir, &labeling, "Disabled", 1)?;
    mask_train::run(Arc::new(config), source.clone(), no_oracle).await?;

    // a different tile size invalidates the cache
    let mut config = make_config(&dir, &labeling, "Disabled", 1)?;
    config.saliency.tile_size = 2;
    assert!(mask_train::run(Arc::new(config), source, no_oracle)
        .await
        .is_err());

    fs::remove_dir_all(&dir)?;
    Ok(())
}

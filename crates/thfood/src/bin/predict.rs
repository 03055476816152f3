use std::path::{Path, PathBuf};
use std::process::ExitCode;
use burn::backend::LibTorch;
use burn::config::Config;
use log::LevelFilter;
use simple_logger::SimpleLogger;
use thfood::inference::{open_image, Classifier};
use thfood::labels::{LabelMap, FILE_NAME, MIN_FILE_NAME};
use thfood::loader::{checkpoint_candidates, load_model, select_device, LoadPolicy, CHECKPOINT_STEM};
use thfood::{FoodError, Result};

const CONFIG_PATH: &str = "predict.json";

#[derive(Config, Debug)]
pub struct PredictConfig {
    #[config(default = "String::from(\"D:/thai-food-ai\")")]
    pub root: String,
    /// Relative paths are taken from `root`.
    #[config(default = "String::from(\"Pic-test/ผัดฉ่า.jpg\")")]
    pub image: String,
    #[config(default = 5)]
    pub top_k: usize,
}

fn main() -> ExitCode {
    SimpleLogger::new().with_level(LevelFilter::Info).init().ok();

    match predict() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("❌ {err}");
            ExitCode::FAILURE
        }
    }
}

fn predict() -> Result<()> {
    let config = if Path::new(CONFIG_PATH).exists() {
        PredictConfig::load(CONFIG_PATH)?
    } else {
        PredictConfig::new()
    };
    let root = PathBuf::from(&config.root);

    let device = select_device();
    println!("Using device: {device:?}");

    let (map_path, labels) = LabelMap::locate(&[root.join(MIN_FILE_NAME), root.join(FILE_NAME)])?;
    println!("Loaded class map: {} ({} classes)", file_name(&map_path), labels.len());

    let candidates = checkpoint_candidates(&[&root], CHECKPOINT_STEM);
    let (model_path, model) = load_model::<LibTorch>(&candidates, labels.len(), LoadPolicy::Strict, &device)?;
    println!("Using model: {}", file_name(&model_path));

    let image_path = root.join(&config.image);
    if !image_path.is_file() {
        return Err(FoodError::ImageNotFound(image_path.display().to_string()));
    }
    let image = open_image(&image_path)?;
    let classifier = Classifier::new(model, labels, device);
    let top = classifier.top_k(&image, config.top_k)?;

    println!("Top-{}:", top.len());
    for prediction in &top {
        println!("- {} / {}  ({:.2})", prediction.thai, prediction.english, prediction.confidence);
    }

    if let Some(best) = top.first() {
        println!("Predict: {} / {}  {:.2}", best.thai, best.english, best.confidence);
    }

    Ok(())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

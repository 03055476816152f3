use std::path::Path;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use burn::backend::Autodiff;
use burn::config::Config;
use burn::tensor::f16;
use burn_tch::{LibTorch, LibTorchDevice};
use log::LevelFilter;
use simple_logger::SimpleLogger;
use thfood::amp::{FullPrecision, MixedPrecision};
use thfood::loader::select_device;
use thfood::train::{self, TrainingConfig};
use thfood::{FoodError, Result};

const DEFAULT_CONFIG_PATH: &str = "training.json";
const INTERRUPTED_EXIT_CODE: u8 = 130;

fn main() -> ExitCode {
    SimpleLogger::new().with_level(LevelFilter::Info).init().ok();

    let time = SystemTime::now();

    match run() {
        Ok(()) => {
            let elapsed = time.elapsed().map(|elapsed| elapsed.as_secs_f64()).unwrap_or_default();
            println!("Time to train: {elapsed:.1}s");
            ExitCode::SUCCESS
        }
        Err(FoodError::Interrupted) => ExitCode::from(INTERRUPTED_EXIT_CODE),
        Err(err) => {
            eprintln!("❌ {err}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => TrainingConfig::load(path)?,
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => TrainingConfig::load(DEFAULT_CONFIG_PATH)?,
        None => TrainingConfig::new(),
    };

    let interrupt = Arc::new(AtomicBool::new(false));
    let flag = interrupt.clone();
    if let Err(err) = ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst)) {
        log::warn!("Could not install the Ctrl-C handler: {err}");
    }

    let device = select_device();
    println!("Using device: {device:?}");

    let summary = match device {
        LibTorchDevice::Cuda(_) if config.use_amp => {
            println!("Mixed precision: f16 forward and backward, f32 master weights");
            let compute_device = device.clone();
            train::run::<Autodiff<LibTorch>, _, _>(&config, device, interrupt, move |model| {
                MixedPrecision::<Autodiff<LibTorch<f16>>>::new(model, &compute_device)
            })?
        }
        _ => train::run::<Autodiff<LibTorch>, _, _>(&config, device, interrupt, |_| FullPrecision)?,
    };

    log::info!(
        "Best val_acc={:.4} over {} classes ({} + {} epochs)",
        summary.best_accuracy,
        summary.classes.len(),
        summary.stage1.epochs,
        summary.stage2.epochs
    );

    Ok(())
}

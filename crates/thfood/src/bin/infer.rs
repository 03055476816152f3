use burn::backend::LibTorch;
use log::LevelFilter;
use simple_logger::SimpleLogger;
use thfood::inference::{classify_request, verdict_json};
use thfood::loader::select_device;
use thfood::paths::AppDirs;

// Called as a subprocess: stdout carries exactly one JSON line and the exit status is always 0.
fn main() {
    SimpleLogger::new().with_level(LevelFilter::Warn).init().ok();
    tch::set_num_threads(1);

    let image_arg = std::env::args().nth(1);
    let device = select_device();

    let result = AppDirs::discover()
        .and_then(|dirs| classify_request::<LibTorch>(&dirs, image_arg.as_deref(), &device));

    println!("{}", verdict_json(&result));
}

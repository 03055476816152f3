use std::path::{Path, PathBuf};
use burn::module::Module;
use burn::prelude::{Backend, Device};
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder};
use burn_tch::LibTorchDevice;
use efficientnet::{BackboneRecord, EfficientNet, EfficientNetRecord, CLASSIFIER_PARAMS};
use crate::error::{FoodError, Result};
use crate::paths::first_existing;

/// Best weights written by the trainer.
pub const CHECKPOINT_STEM: &str = "best_model_thfood50";
/// Weights saved when training is interrupted.
pub const INTERRUPTED_STEM: &str = "checkpoint_thfood50";
/// burn records are preferred over PyTorch exports when both exist.
pub const CHECKPOINT_EXTENSIONS: [&str; 2] = ["mpk", "pth"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadPolicy {
	/// Every parameter must come from the checkpoint.
	Strict,
	/// A classifier of the wrong width is replaced by a fresh one and reported.
	Lenient,
}

pub fn checkpoint_candidates<P: AsRef<Path>>(dirs: &[P], stem: &str) -> Vec<PathBuf> {
	dirs.iter()
		.flat_map(|dir| {
			CHECKPOINT_EXTENSIONS
				.iter()
				.map(move |ext| dir.as_ref().join(format!("{stem}.{ext}")))
		})
		.collect()
}

pub fn select_device() -> LibTorchDevice {
	if tch::utils::has_cuda() {
		LibTorchDevice::Cuda(0)
	} else {
		LibTorchDevice::Cpu
	}
}

pub fn load_model<B: Backend>(
	candidates: &[PathBuf],
	num_classes: usize,
	policy: LoadPolicy,
	device: &Device<B>,
) -> Result<(PathBuf, EfficientNet<B>)> {
	let path = first_existing(candidates)
		.ok_or_else(|| FoodError::CheckpointNotFound(format!("{CHECKPOINT_STEM}.pth")))?;
	log::info!("Loading checkpoint {}", path.display());

	let model = EfficientNet::<B>::efficientnet_b0(num_classes, device);

	let record = match read_record::<B>(&path, device) {
		Ok(record) => record,
		Err(err) if policy == LoadPolicy::Lenient => {
			log::warn!("Checkpoint {} is not a complete record ({err}), restoring the backbone only", path.display());
			let backbone = read_backbone::<B>(&path, device).map_err(|_| err)?;
			warn_not_restored();
			return Ok((path, model.load_backbone_record(backbone)));
		}
		Err(err) => return Err(err),
	};

	let found = record.classifier.weight.val().dims()[1];
	if found == num_classes {
		return Ok((path, model.load_record(record)));
	}

	match policy {
		LoadPolicy::Strict => Err(FoodError::ShapeMismatch(
			CLASSIFIER_PARAMS.iter().map(|name| format!("{name} ({found} classes, expected {num_classes})")).collect(),
		)),
		LoadPolicy::Lenient => {
			log::warn!("Checkpoint classifier has {found} outputs but the label map has {num_classes}");
			warn_not_restored();
			let backbone = BackboneRecord {
				features: record.features,
			};
			Ok((path, model.load_backbone_record(backbone)))
		}
	}
}

fn warn_not_restored() {
	log::warn!("Parameters not restored from checkpoint: {}", CLASSIFIER_PARAMS.join(", "));
}

fn is_pytorch(path: &Path) -> bool {
	path.extension().is_some_and(|ext| ext == "pth" || ext == "pt")
}

fn read_record<B: Backend>(path: &Path, device: &Device<B>) -> Result<EfficientNetRecord<B>> {
	let record = if is_pytorch(path) {
		EfficientNet::<B>::load_pytorch_record(path, device)?
	} else {
		NamedMpkFileRecorder::<FullPrecisionSettings>::new().load(path.to_path_buf(), device)?
	};

	Ok(record)
}

fn read_backbone<B: Backend>(path: &Path, device: &Device<B>) -> Result<BackboneRecord<B>> {
	let record = if is_pytorch(path) {
		EfficientNet::<B>::load_pytorch_backbone(path, device)?
	} else {
		NamedMpkFileRecorder::<FullPrecisionSettings>::new().load(path.to_path_buf(), device)?
	};

	Ok(record)
}

use std::path::Path;
use burn::module::Module;
use burn::nn::pool::AdaptiveAvgPool2d;
use burn::nn::{Dropout, Linear};
use burn::prelude::{Backend, Device};
use burn::record::{FullPrecisionSettings, Record, Recorder, RecorderError};
use burn::tensor::Tensor;
use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};
use crate::block::{FeatureLayer, FeatureLayerRecord};
use crate::config::{classifier_config, EfficientNetConfig};
use crate::weights;
use crate::weights::WeightsMeta;

/// Parameter paths that belong to the classification head.
pub const CLASSIFIER_PARAMS: [&str; 2] = ["classifier.weight", "classifier.bias"];

/// Renames torchvision `efficientnet_b0` state dict keys onto this module tree.
/// Every pattern is anchored so a renamed key never matches a later rule.
const KEY_REMAP: [(&str, &str); 15] = [
	// stem and head: features.{0,8}.{0,1}.* -> features.{0,8}.{conv,norm}.*
	("^features\\.([08])\\.0\\.(.+)$", "features.$1.conv.$2"),
	("^features\\.([08])\\.1\\.(.+)$", "features.$1.norm.$2"),
	// stage 1 has no expansion conv, so the block indices are shifted by one
	("^features\\.1\\.([0-9]+)\\.block\\.0\\.0\\.(.+)$", "features.1.blocks.$1.depthwise.conv.$2"),
	("^features\\.1\\.([0-9]+)\\.block\\.0\\.1\\.(.+)$", "features.1.blocks.$1.depthwise.norm.$2"),
	("^features\\.1\\.([0-9]+)\\.block\\.1\\.(.+)$", "features.1.blocks.$1.se.$2"),
	("^features\\.1\\.([0-9]+)\\.block\\.2\\.0\\.(.+)$", "features.1.blocks.$1.project.conv.$2"),
	("^features\\.1\\.([0-9]+)\\.block\\.2\\.1\\.(.+)$", "features.1.blocks.$1.project.norm.$2"),
	// stages 2 to 7
	("^features\\.([2-7])\\.([0-9]+)\\.block\\.0\\.0\\.(.+)$", "features.$1.blocks.$2.expand.conv.$3"),
	("^features\\.([2-7])\\.([0-9]+)\\.block\\.0\\.1\\.(.+)$", "features.$1.blocks.$2.expand.norm.$3"),
	("^features\\.([2-7])\\.([0-9]+)\\.block\\.1\\.0\\.(.+)$", "features.$1.blocks.$2.depthwise.conv.$3"),
	("^features\\.([2-7])\\.([0-9]+)\\.block\\.1\\.1\\.(.+)$", "features.$1.blocks.$2.depthwise.norm.$3"),
	("^features\\.([2-7])\\.([0-9]+)\\.block\\.2\\.(.+)$", "features.$1.blocks.$2.se.$3"),
	("^features\\.([2-7])\\.([0-9]+)\\.block\\.3\\.0\\.(.+)$", "features.$1.blocks.$2.project.conv.$3"),
	("^features\\.([2-7])\\.([0-9]+)\\.block\\.3\\.1\\.(.+)$", "features.$1.blocks.$2.project.norm.$3"),
	// classifier.1 is the linear layer, classifier.0 is the parameterless dropout
	("^classifier\\.1\\.(.+)$", "classifier.$1"),
];

#[derive(Debug, Module)]
pub struct EfficientNet<B: Backend> {
	pub(crate) features: Vec<FeatureLayer<B>>,
	pub(crate) avgpool: AdaptiveAvgPool2d,
	pub(crate) dropout: Dropout,
	pub(crate) classifier: Linear<B>,
}

/// Feature extractor weights without the classification head.
#[derive(Record)]
pub struct BackboneRecord<B: Backend> {
	pub features: Vec<FeatureLayerRecord<B>>,
}

impl<B: Backend> EfficientNet<B> {
	pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 2> {
		let mut x = input;
		for layer in &self.features {
			x = layer.forward(x);
		}

		let x = self.avgpool.forward(x);
		let x = x.flatten(1, 3);
		let x = self.dropout.forward(x);

		self.classifier.forward(x)
	}

	pub fn efficientnet_b0(num_classes: usize, device: &Device<B>) -> Self {
		EfficientNetConfig::new(num_classes).init(device)
	}

	/// ImageNet backbone with a freshly initialised head of `num_classes` outputs.
	pub fn efficientnet_b0_pretrained(
		weights: weights::EfficientNetB0,
		num_classes: usize,
		device: &Device<B>,
	) -> Result<Self, RecorderError> {
		let weights = weights.weights();
		let torch_weights = weights.download().map_err(|err| {
			RecorderError::Unknown(format!("Could not download weights.\nError: {err}"))
		})?;

		let record = Self::load_pytorch_record(torch_weights, device)?;
		let model = Self::efficientnet_b0(weights.num_classes, device).load_record(record);

		if num_classes == weights.num_classes {
			Ok(model)
		} else {
			Ok(model.with_classifier(num_classes, device))
		}
	}

	/// Reads a torchvision state dict, either the ImageNet release or a fine-tuned export.
	pub fn load_pytorch_record<P: AsRef<Path>>(
		path: P,
		device: &Device<B>,
	) -> Result<EfficientNetRecord<B>, RecorderError> {
		PyTorchFileRecorder::<FullPrecisionSettings>::new().load(load_args(path.as_ref()), device)
	}

	/// Reads only the feature extractor from a torchvision state dict.
	pub fn load_pytorch_backbone<P: AsRef<Path>>(
		path: P,
		device: &Device<B>,
	) -> Result<BackboneRecord<B>, RecorderError> {
		PyTorchFileRecorder::<FullPrecisionSettings>::new().load(load_args(path.as_ref()), device)
	}

	/// Replaces the head with a new, randomly initialised one.
	pub fn with_classifier(self, num_classes: usize, device: &Device<B>) -> Self {
		Self {
			classifier: classifier_config(num_classes).init(device),
			..self
		}
	}

	pub fn load_backbone_record(self, record: BackboneRecord<B>) -> Self {
		let features = self.features.load_record(record.features);

		Self { features, ..self }
	}

	pub fn num_classes(&self) -> usize {
		// burn stores linear weights as [d_input, d_output]
		self.classifier.weight.val().dims()[1]
	}

	/// Names of the ordered feature layers, stem first.
	pub fn layer_names(&self) -> Vec<String> {
		(0..self.features.len()).map(|i| format!("features.{i}")).collect()
	}
}

fn load_args(path: &Path) -> LoadArgs {
	KEY_REMAP
		.iter()
		.fold(LoadArgs::new(path.to_path_buf()), |args, (pattern, replacement)| {
			args.with_key_remap(pattern, replacement)
		})
}

#[cfg(test)]
mod tests {
	use burn::backend::LibTorch;
	use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
	use burn::tensor::{Distribution, Tensor};
	use burn_tch::LibTorchDevice;
	use super::*;

	type TestBackend = LibTorch;

	#[test]
	fn output_width_matches_class_count() {
		let device = LibTorchDevice::Cpu;
		let model = EfficientNet::<TestBackend>::efficientnet_b0(7, &device);
		let input = Tensor::<TestBackend, 4>::random([2, 3, 64, 64], Distribution::Default, &device);

		let output = model.forward(input);

		assert_eq!(output.dims(), [2, 7]);
		assert_eq!(model.num_classes(), 7);
	}

	#[test]
	fn nine_feature_layers() {
		let device = LibTorchDevice::Cpu;
		let model = EfficientNet::<TestBackend>::efficientnet_b0(3, &device);

		let names = model.layer_names();

		assert_eq!(names.len(), 9);
		assert_eq!(names[0], "features.0");
		assert_eq!(names[8], "features.8");
	}

	#[test]
	fn new_classifier_keeps_backbone() {
		let device = LibTorchDevice::Cpu;
		let model = EfficientNet::<TestBackend>::efficientnet_b0(1000, &device);
		let input = Tensor::<TestBackend, 4>::random([1, 3, 32, 32], Distribution::Default, &device);

		let before = backbone_output(&model, input.clone());
		let model = model.with_classifier(50, &device);
		let after = backbone_output(&model, input);

		assert_eq!(model.num_classes(), 50);
		after.into_data().assert_approx_eq(&before.into_data(), 5);
	}

	#[test]
	fn saved_model_reloads_identically() {
		let device = LibTorchDevice::Cpu;
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("model");
		let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
		let model = EfficientNet::<TestBackend>::efficientnet_b0(4, &device);
		let input = Tensor::<TestBackend, 4>::random([1, 3, 32, 32], Distribution::Default, &device);
		let expected = model.forward(input.clone());

		model.save_file(&path, &recorder).unwrap();
		let reloaded = EfficientNet::<TestBackend>::efficientnet_b0(4, &device)
			.load_file(&path, &recorder, &device)
			.unwrap();

		reloaded.forward(input).into_data().assert_approx_eq(&expected.into_data(), 5);
	}

	#[test]
	fn backbone_record_ignores_head() {
		let device = LibTorchDevice::Cpu;
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("model");
		let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
		let source = EfficientNet::<TestBackend>::efficientnet_b0(10, &device);
		let input = Tensor::<TestBackend, 4>::random([1, 3, 32, 32], Distribution::Default, &device);
		let expected = backbone_output(&source, input.clone());
		source.save_file(&path, &recorder).unwrap();

		let record: BackboneRecord<TestBackend> = recorder.load(path, &device).unwrap();
		let target = EfficientNet::<TestBackend>::efficientnet_b0(3, &device).load_backbone_record(record);

		assert_eq!(target.num_classes(), 3);
		backbone_output(&target, input).into_data().assert_approx_eq(&expected.into_data(), 5);
	}

	fn backbone_output(model: &EfficientNet<TestBackend>, input: Tensor<TestBackend, 4>) -> Tensor<TestBackend, 4> {
		let mut x = input;
		for layer in &model.features {
			x = layer.forward(x);
		}
		x
	}
}

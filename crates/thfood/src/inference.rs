use std::path::Path;
use burn::prelude::{Backend, Device, TensorData};
use burn::tensor::activation::softmax;
use burn::tensor::Tensor;
use efficientnet::imagenet::Normalizer;
use efficientnet::EfficientNet;
use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};
use serde::Serialize;
use crate::error::{FoodError, Result};
use crate::labels::LabelMap;
use crate::loader::{load_model, LoadPolicy};
use crate::paths::AppDirs;

pub const IMAGE_SIZE: u32 = 224;
const MISSING: &str = "N/A";

pub fn open_image<P: AsRef<Path>>(path: P) -> Result<DynamicImage> {
	let path = path.as_ref();
	image::open(path).map_err(|source| FoodError::ImageDecode {
		path: path.to_path_buf(),
		source,
	})
}

/// [height, width, 3] bytes to a [3, height, width] tensor in [0, 1].
pub fn to_tensor<B: Backend>(image: RgbImage, device: &Device<B>) -> Tensor<B, 3> {
	let shape = [image.height() as usize, image.width() as usize, 3];
	let data = TensorData::new(image.into_raw(), shape).convert::<B::FloatElem>();

	Tensor::<B, 3>::from_data(data, device).permute([2, 0, 1]) / 255
}

/// Resized, scaled and normalized [1, 3, 224, 224] batch of one.
pub fn preprocess<B: Backend>(image: &DynamicImage, device: &Device<B>) -> Tensor<B, 4> {
	let resized = image.resize_exact(IMAGE_SIZE, IMAGE_SIZE, FilterType::Triangle).into_rgb8();
	let tensor = to_tensor::<B>(resized, device).unsqueeze::<4>();

	Normalizer::new(device).normalize(tensor)
}

/// Indices of the `k` largest probabilities, highest first.
pub fn rank(probs: &[f32], k: usize) -> Vec<(usize, f32)> {
	let mut ranked: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
	ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
	ranked.truncate(k);
	ranked
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
	pub index: usize,
	pub thai: String,
	pub english: String,
	pub confidence: f32,
}

impl Prediction {
	fn new(labels: &LabelMap, index: usize, confidence: f32) -> Self {
		let (thai, english) = match labels.get(index) {
			Some(label) => (label.thai.clone(), label.english.clone()),
			None => (MISSING.to_string(), MISSING.to_string()),
		};

		Self {
			index,
			thai,
			english,
			confidence,
		}
	}
}

pub struct Classifier<B: Backend> {
	model: EfficientNet<B>,
	labels: LabelMap,
	device: Device<B>,
}

impl<B: Backend> Classifier<B> {
	pub fn new(model: EfficientNet<B>, labels: LabelMap, device: Device<B>) -> Self {
		Self { model, labels, device }
	}

	pub fn probabilities(&self, image: &DynamicImage) -> Result<Vec<f32>> {
		let logits = self.model.forward(preprocess(image, &self.device));
		let probs = softmax(logits, 1);

		probs
			.into_data()
			.convert::<f32>()
			.to_vec::<f32>()
			.map_err(|err| FoodError::TensorData(format!("{err:?}")))
	}

	pub fn predict(&self, image: &DynamicImage) -> Result<Prediction> {
		self.top_k(image, 1)?
			.into_iter()
			.next()
			.ok_or(FoodError::EmptyLabelMap)
	}

	/// `min(k, N)` predictions ranked by confidence.
	pub fn top_k(&self, image: &DynamicImage, k: usize) -> Result<Vec<Prediction>> {
		let probs = self.probabilities(image)?;

		Ok(rank(&probs, k)
			.into_iter()
			.map(|(index, confidence)| Prediction::new(&self.labels, index, confidence))
			.collect())
	}
}

/// Subprocess classification of one image: label map, model, argument, path, decode, predict.
pub fn classify_request<B: Backend>(dirs: &AppDirs, image_arg: Option<&str>, device: &Device<B>) -> Result<Prediction> {
	let (_, labels) = LabelMap::locate(&dirs.label_map_candidates())?;
	let (_, model) = load_model::<B>(&dirs.checkpoint_candidates(), labels.len(), LoadPolicy::Lenient, device)?;

	let image_arg = image_arg.ok_or(FoodError::MissingImageArgument)?;
	let image_path = dirs.search_roots().resolve_file(image_arg)?;
	let image = open_image(&image_path)?;

	Classifier::new(model, labels, device.clone()).predict(&image)
}

#[derive(Serialize)]
#[serde(untagged)]
enum Verdict<'a> {
	Label { label: &'a str, confidence: f32 },
	Error { error: String },
}

/// One JSON line, non-ASCII left unescaped.
pub fn verdict_json(result: &Result<Prediction>) -> String {
	let verdict = match result {
		Ok(prediction) => Verdict::Label {
			label: &prediction.thai,
			confidence: prediction.confidence,
		},
		Err(err) => Verdict::Error { error: err.to_string() },
	};

	serde_json::to_string(&verdict).unwrap_or_else(|err| format!("{{\"error\":\"{err}\"}}"))
}

#[cfg(test)]
mod tests {
	use std::fs;
	use std::path::PathBuf;
	use burn::backend::LibTorch;
	use burn::module::{Module, Param};
	use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
	use burn_tch::LibTorchDevice;
	use super::*;

	type TestBackend = LibTorch;

	/// Model whose logits are exactly `bias`, whatever the input.
	fn biased_model(bias: [f32; 2]) -> EfficientNet<TestBackend> {
		let device = LibTorchDevice::Cpu;
		let model = EfficientNet::<TestBackend>::efficientnet_b0(2, &device);
		let mut record = model.clone().into_record();
		record.classifier.weight = Param::from_tensor(Tensor::zeros([1280, 2], &device));
		record.classifier.bias = Some(Param::from_tensor(Tensor::from_floats(bias, &device)));

		model.load_record(record)
	}

	fn deployment(root: &Path) -> AppDirs {
		let ai_dir = root.join("AI");
		fs::create_dir_all(ai_dir.join("Model")).unwrap();
		fs::write(root.join("class_map_thfood50.csv"), "0,ผัดไทย,Pad Thai\n1,ต้มยำ,Tom Yum\n").unwrap();
		RgbImage::from_pixel(40, 30, image::Rgb([200, 80, 20])).save(root.join("dish.png")).unwrap();

		AppDirs::new(root.to_path_buf(), ai_dir)
	}

	#[test]
	fn rank_orders_and_truncates() {
		let ranked = rank(&[0.1, 0.6, 0.3], 5);

		assert_eq!(ranked, vec![(1, 0.6), (2, 0.3), (0, 0.1)]);
		assert_eq!(rank(&[0.1, 0.6, 0.3], 1), vec![(1, 0.6)]);
	}

	#[test]
	fn preprocess_shape() {
		let image = DynamicImage::ImageRgb8(RgbImage::new(300, 120));

		let tensor = preprocess::<TestBackend>(&image, &LibTorchDevice::Cpu);

		assert_eq!(tensor.dims(), [1, 3, 224, 224]);
	}

	#[test]
	fn probabilities_form_a_distribution() {
		let labels = LabelMap::from_class_names(&["a", "b"]);
		let classifier = Classifier::new(biased_model([0.5, 1.5]), labels, LibTorchDevice::Cpu);
		let image = DynamicImage::ImageRgb8(RgbImage::new(64, 64));

		let probs = classifier.probabilities(&image).unwrap();

		assert_eq!(probs.len(), 2);
		assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-5);
		assert!(probs.iter().all(|p| (0.0..=1.0).contains(p)));
	}

	#[test]
	fn top_k_is_capped_by_class_count() {
		let labels = LabelMap::from_class_names(&["a", "b"]);
		let classifier = Classifier::new(biased_model([2.0, 1.0]), labels, LibTorchDevice::Cpu);
		let image = DynamicImage::ImageRgb8(RgbImage::new(64, 64));

		let top = classifier.top_k(&image, 5).unwrap();

		assert_eq!(top.len(), 2);
		assert_eq!(top[0].thai, "a");
		assert!(top[0].confidence >= top[1].confidence);
	}

	#[test]
	fn index_beyond_label_map_is_not_available() {
		let labels = LabelMap::from_class_names(&["only"]);
		let classifier = Classifier::new(biased_model([0.0, 3.0]), labels, LibTorchDevice::Cpu);
		let image = DynamicImage::ImageRgb8(RgbImage::new(64, 64));

		let prediction = classifier.predict(&image).unwrap();

		assert_eq!(prediction.index, 1);
		assert_eq!(prediction.thai, "N/A");
		assert_eq!(prediction.english, "N/A");
	}

	#[test]
	fn request_end_to_end() {
		let root = tempfile::tempdir().unwrap();
		let dirs = deployment(root.path());
		biased_model([0.0, 5.0])
			.save_file(
				dirs.ai_dir.join("Model/best_model_thfood50.mpk"),
				&NamedMpkFileRecorder::<FullPrecisionSettings>::new(),
			)
			.unwrap();

		let result = classify_request::<TestBackend>(&dirs, Some("dish.png"), &LibTorchDevice::Cpu);

		let prediction = result.as_ref().unwrap();
		assert_eq!(prediction.thai, "ต้มยำ");
		assert!(prediction.confidence > 0.5);
		assert!(verdict_json(&result).starts_with("{\"label\":\"ต้มยำ\",\"confidence\":0.99"));
	}

	#[test]
	fn request_without_checkpoint() {
		let root = tempfile::tempdir().unwrap();
		let dirs = deployment(root.path());

		let result = classify_request::<TestBackend>(&dirs, Some("dish.png"), &LibTorchDevice::Cpu);

		assert_eq!(verdict_json(&result), "{\"error\":\"ไม่พบไฟล์โมเดล best_model_thfood50.pth\"}");
	}

	#[test]
	fn request_error_order() {
		let root = tempfile::tempdir().unwrap();
		let dirs = deployment(root.path());
		biased_model([0.0, 1.0])
			.save_file(
				dirs.ai_dir.join("Model/best_model_thfood50.mpk"),
				&NamedMpkFileRecorder::<FullPrecisionSettings>::new(),
			)
			.unwrap();
		fs::write(root.path().join("broken.jpg"), b"not an image").unwrap();
		let device = LibTorchDevice::Cpu;

		let missing_arg = classify_request::<TestBackend>(&dirs, None, &device);
		let missing_image = classify_request::<TestBackend>(&dirs, Some("nope.jpg"), &device);
		let broken = classify_request::<TestBackend>(&dirs, Some("broken.jpg"), &device);

		assert_eq!(verdict_json(&missing_arg), "{\"error\":\"missing_image_path_arg\"}");
		assert_eq!(verdict_json(&missing_image), "{\"error\":\"image_not_found: nope.jpg\"}");
		assert!(matches!(broken, Err(FoodError::ImageDecode { ref path, .. }) if path.ends_with(PathBuf::from("broken.jpg"))));
		assert!(verdict_json(&broken).starts_with("{\"error\":\"cannot_open_image: "));
	}
}

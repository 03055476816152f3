use std::fs::read_dir;
use std::path::{Path, PathBuf};
use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::{Backend, Int, TensorData};
use burn::tensor::Tensor;
use efficientnet::imagenet::Normalizer;
use image::imageops::FilterType;
use crate::augment::Augmentation;
use crate::error::{FoodError, Result};
use crate::inference::{open_image, to_tensor, IMAGE_SIZE};

pub const IMAGE_EXTENSIONS: [&str; 9] = ["jpg", "jpeg", "png", "ppm", "bmp", "pgm", "tif", "tiff", "webp"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoodItem {
	pub path: PathBuf,
	pub label: usize,
}

/// Image folder dataset: one subdirectory per class.
#[derive(Debug, Clone)]
pub struct FoodDataset {
	items: Vec<FoodItem>,
	classes: Vec<String>,
}

impl FoodDataset {
	/// Classes are the sorted subdirectory names of `dir`.
	pub fn scan<P: AsRef<Path>>(dir: P) -> Result<Self> {
		let dir = dir.as_ref();
		let classes = sorted_entries(dir)?
			.into_iter()
			.filter(|path| path.is_dir())
			.filter_map(|path| path.file_name().map(|name| name.to_string_lossy().into_owned()))
			.collect::<Vec<_>>();

		Self::scan_with_classes(dir, &classes)
	}

	/// Uses an existing class index, subdirectories outside it are skipped.
	pub fn scan_with_classes<P: AsRef<Path>>(dir: P, classes: &[String]) -> Result<Self> {
		let dir = dir.as_ref();
		let mut items = Vec::new();

		for class_dir in sorted_entries(dir)?.into_iter().filter(|path| path.is_dir()) {
			let name = class_dir.file_name().map(|name| name.to_string_lossy().into_owned()).unwrap_or_default();
			let Some(label) = classes.iter().position(|class| *class == name) else {
				log::warn!("Skipping unknown class folder {}", class_dir.display());
				continue;
			};

			items.extend(
				sorted_entries(&class_dir)?
					.into_iter()
					.filter(|path| path.is_file() && is_image(path))
					.map(|path| FoodItem { path, label }),
			);
		}

		if items.is_empty() {
			return Err(FoodError::EmptyDataset(dir.to_path_buf()));
		}

		Ok(Self {
			items,
			classes: classes.to_vec(),
		})
	}

	pub fn classes(&self) -> &[String] {
		&self.classes
	}
}

impl Dataset<FoodItem> for FoodDataset {
	fn get(&self, index: usize) -> Option<FoodItem> {
		self.items.get(index).cloned()
	}

	fn len(&self) -> usize {
		self.items.len()
	}
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
	if !dir.is_dir() {
		return Err(FoodError::DatasetNotFound(dir.to_path_buf()));
	}

	let mut entries = read_dir(dir)?
		.map(|entry| entry.map(|entry| entry.path()))
		.collect::<std::io::Result<Vec<_>>>()?;
	entries.sort();

	Ok(entries)
}

fn is_image(path: &Path) -> bool {
	path.extension()
		.map(|ext| ext.to_string_lossy().to_lowercase())
		.is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

#[derive(Debug, Clone)]
pub struct FoodBatch<B: Backend> {
	pub images: Tensor<B, 4>,
	pub targets: Tensor<B, 1, Int>,
}

#[derive(Clone)]
pub struct FoodBatcher<B: Backend> {
	device: B::Device,
	augmentation: Option<Augmentation>,
}

impl<B: Backend> FoodBatcher<B> {
	pub fn training(device: B::Device, seed: u64) -> Self {
		Self {
			device,
			augmentation: Some(Augmentation::new(IMAGE_SIZE, seed)),
		}
	}

	pub fn validation(device: B::Device) -> Self {
		Self {
			device,
			augmentation: None,
		}
	}
}

/// `None` when not a single image of the batch could be decoded.
impl<B: Backend> Batcher<FoodItem, Option<FoodBatch<B>>> for FoodBatcher<B> {
	fn batch(&self, items: Vec<FoodItem>) -> Option<FoodBatch<B>> {
		let mut images = Vec::with_capacity(items.len());
		let mut targets = Vec::with_capacity(items.len());

		for item in items {
			let image = match open_image(&item.path) {
				Ok(image) => image,
				Err(err) => {
					log::warn!("Skipping {}: {err}", item.path.display());
					continue;
				}
			};

			let image = match &self.augmentation {
				Some(augmentation) => augmentation.apply(&image),
				None => image.resize_exact(IMAGE_SIZE, IMAGE_SIZE, FilterType::Triangle).into_rgb8(),
			};

			images.push(to_tensor::<B>(image, &self.device));
			targets.push(item.label as i64);
		}

		if images.is_empty() {
			return None;
		}

		let count = targets.len();
		let images = Normalizer::new(&self.device).normalize(Tensor::stack::<4>(images, 0));
		let targets = Tensor::<B, 1, Int>::from_data(
			TensorData::new(targets, [count]).convert::<B::IntElem>(),
			&self.device,
		);

		Some(FoodBatch { images, targets })
	}
}

#[cfg(test)]
mod tests {
	use std::fs;
	use burn::backend::LibTorch;
	use burn_tch::LibTorchDevice;
	use image::{Rgb, RgbImage};
	use super::*;

	fn dataset_dir() -> tempfile::TempDir {
		let dir = tempfile::tempdir().unwrap();
		for (class, files) in [("tom_yum", vec!["b.jpg", "a.jpeg"]), ("pad_thai", vec!["c.png"])] {
			let class_dir = dir.path().join(class);
			fs::create_dir(&class_dir).unwrap();
			for file in files {
				RgbImage::from_pixel(20, 10, Rgb([10, 20, 30])).save(class_dir.join(file)).unwrap();
			}
			fs::write(class_dir.join("notes.txt"), "not an image").unwrap();
		}
		dir
	}

	#[test]
	fn classes_are_sorted_folder_names() {
		let dir = dataset_dir();

		let dataset = FoodDataset::scan(dir.path()).unwrap();

		assert_eq!(dataset.classes(), ["pad_thai", "tom_yum"]);
		assert_eq!(dataset.len(), 3);
		assert_eq!(dataset.get(0).unwrap().label, 0);
		assert!(dataset.get(1).unwrap().path.ends_with("tom_yum/a.jpeg"));
		assert_eq!(dataset.get(2).unwrap().label, 1);
	}

	#[test]
	fn extensions_are_case_insensitive() {
		assert!(is_image(Path::new("dish.JPG")));
		assert!(is_image(Path::new("dish.webp")));
		assert!(!is_image(Path::new("dish.gif")));
		assert!(!is_image(Path::new("dish")));
	}

	#[test]
	fn unknown_classes_are_skipped() {
		let dir = dataset_dir();
		let classes = vec!["tom_yum".to_string()];

		let dataset = FoodDataset::scan_with_classes(dir.path(), &classes).unwrap();

		assert_eq!(dataset.len(), 2);
		assert!((0..dataset.len()).all(|i| dataset.get(i).unwrap().label == 0));
	}

	#[test]
	fn missing_directory_is_reported() {
		let dir = tempfile::tempdir().unwrap();
		let missing = dir.path().join("THFOOD-50/train");

		let err = FoodDataset::scan(&missing).unwrap_err();

		assert!(matches!(err, FoodError::DatasetNotFound(path) if path == missing));
	}

	#[test]
	fn batch_skips_undecodable_images() {
		let dir = dataset_dir();
		let broken = dir.path().join("tom_yum/broken.jpg");
		fs::write(&broken, b"garbage").unwrap();
		let dataset = FoodDataset::scan(dir.path()).unwrap();
		let items: Vec<_> = (0..dataset.len()).filter_map(|i| dataset.get(i)).collect();
		let batcher = FoodBatcher::<LibTorch>::validation(LibTorchDevice::Cpu);

		let batch = batcher.batch(items).unwrap();

		assert_eq!(batch.images.dims(), [3, 3, 224, 224]);
		assert_eq!(batch.targets.dims(), [3]);
	}

	#[test]
	fn batch_of_broken_images_is_empty() {
		let dir = tempfile::tempdir().unwrap();
		let broken = dir.path().join("broken.jpg");
		fs::write(&broken, b"garbage").unwrap();
		let batcher = FoodBatcher::<LibTorch>::training(LibTorchDevice::Cpu, 1);

		assert!(batcher.batch(vec![FoodItem { path: broken, label: 0 }]).is_none());
	}
}

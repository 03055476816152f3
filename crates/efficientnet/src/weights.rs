use std::fs::{create_dir_all, File};
use std::io::{Error, ErrorKind, Write};
use std::path::PathBuf;
use burn::data::network::downloader;

pub struct Weights {
	pub url: &'static str,
	pub num_classes: usize,
}

impl Weights {
	/// Returns the cached weights file, downloading it on first use.
	pub fn download(&self) -> Result<PathBuf, Error> {
		let model_dir = dirs::home_dir()
			.ok_or_else(|| Error::new(ErrorKind::NotFound, "Could not locate the home directory"))?
			.join(".cache")
			.join("efficientnet-burn");

		if !model_dir.exists() {
			create_dir_all(&model_dir)?;
		}

		let file_base_name = self.url.rsplit('/').next().unwrap_or(self.url);
		let file_name = model_dir.join(file_base_name);
		if !file_name.exists() {
			log::info!("Downloading {} into {}", self.url, model_dir.display());
			let bytes = downloader::download_file_as_bytes(self.url, file_base_name);

			let mut output_file = File::create(&file_name)?;
			let bytes_written = output_file.write(&bytes)?;

			if bytes_written != bytes.len() {
				return Err(Error::new(
					ErrorKind::InvalidData,
					"Failed to write the whole model weights file.",
				));
			}
		}

		Ok(file_name)
	}
}

pub trait WeightsMeta {
	fn weights(&self) -> Weights;
}

pub enum EfficientNetB0 {
	/// torchvision `EfficientNet_B0_Weights.IMAGENET1K_V1`.
	/// Top-1 accuracy: 77.692%.
	/// Top-5 accuracy: 93.532%.
	ImageNet1kV1,
}

impl WeightsMeta for EfficientNetB0 {
	fn weights(&self) -> Weights {
		match self {
			EfficientNetB0::ImageNet1kV1 => Weights {
				url: "https://download.pytorch.org/models/efficientnet_b0_rwightman-7f5810bc.pth",
				num_classes: 1000,
			},
		}
	}
}

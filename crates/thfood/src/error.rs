use std::path::PathBuf;
use burn::config::ConfigError;
use burn::record::RecorderError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FoodError {
	#[error("ไม่พบ class map (class_map_thfood50_min.csv หรือ class_map_thfood50.csv)")]
	LabelMapNotFound,
	#[error("class map ว่าง")]
	EmptyLabelMap,
	#[error("ไม่พบไฟล์โมเดล {0}")]
	CheckpointNotFound(String),
	#[error("ไม่พบโฟลเดอร์ dataset: {}", .0.display())]
	DatasetNotFound(PathBuf),
	#[error("dataset has no images: {}", .0.display())]
	EmptyDataset(PathBuf),
	#[error("image_not_found: {0}")]
	ImageNotFound(String),
	#[error("cannot_open_image: {source}")]
	ImageDecode {
		path: PathBuf,
		source: image::ImageError,
	},
	#[error("checkpoint does not match model: {}", .0.join(", "))]
	ShapeMismatch(Vec<String>),
	#[error("training interrupted")]
	Interrupted,
	#[error("missing_image_path_arg")]
	MissingImageArgument,
	#[error("{0}")]
	StdIoError(#[from] std::io::Error),
	#[error("{0}")]
	Csv(#[from] csv::Error),
	#[error("{0}")]
	Recorder(#[from] RecorderError),
	#[error("{0}")]
	Json(#[from] serde_json::Error),
	#[error("{0}")]
	Config(#[from] ConfigError),
	#[error("{0}")]
	TensorData(String),
}

pub type Result<T> = std::result::Result<T, FoodError>;

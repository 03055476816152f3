use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use burn::module::Module;
use burn::prelude::Backend;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use crate::error::Result;
use crate::labels::{LabelMap, FILE_NAME};
use crate::loader::{CHECKPOINT_STEM, INTERRUPTED_STEM};

const RECORD_EXTENSION: &str = "mpk";

/// Files written next to their destination and renamed into place together.
/// Anything staged but not committed is removed on drop.
#[derive(Debug, Default)]
pub struct StagedCommit {
	staged: Vec<(PathBuf, PathBuf)>,
}

impl StagedCommit {
	pub fn new() -> Self {
		Self::default()
	}

	/// `<dir>/<stem>.mpk`, staged as `<dir>/<stem>.partial.mpk`.
	pub fn stage_record<B: Backend, M: Module<B>>(&mut self, model: M, dir: &Path, stem: &str) -> Result<PathBuf> {
		let target = dir.join(format!("{stem}.{RECORD_EXTENSION}"));
		let partial = partial_path(&target);
		self.staged.push((partial.clone(), target.clone()));

		model.save_file(partial, &NamedMpkFileRecorder::<FullPrecisionSettings>::new())?;

		Ok(target)
	}

	pub fn stage_with<F>(&mut self, target: PathBuf, write: F) -> Result<PathBuf>
	where
		F: FnOnce(BufWriter<&File>) -> Result<()>,
	{
		let partial = partial_path(&target);
		self.staged.push((partial.clone(), target.clone()));

		let file = File::create(&partial)?;
		write(BufWriter::new(&file))?;
		file.sync_all()?;

		Ok(target)
	}

	pub fn commit(mut self) -> Result<()> {
		for (partial, target) in std::mem::take(&mut self.staged) {
			if let Err(err) = fs::rename(&partial, &target) {
				fs::remove_file(&partial).ok();
				return Err(err.into());
			}
			log::debug!("Committed {}", target.display());
		}

		Ok(())
	}
}

impl Drop for StagedCommit {
	fn drop(&mut self) {
		for (partial, _) in self.staged.drain(..) {
			fs::remove_file(partial).ok();
		}
	}
}

fn partial_path(target: &Path) -> PathBuf {
	let stem = target.file_stem().map(|stem| stem.to_string_lossy().into_owned()).unwrap_or_default();
	let name = match target.extension() {
		Some(ext) => format!("{stem}.partial.{}", ext.to_string_lossy()),
		None => format!("{stem}.partial"),
	};

	target.with_file_name(name)
}

/// Writes the best model record and the label map derived from the class folders.
pub fn commit_best<B: Backend, M: Module<B>>(model: M, classes: &[String], dir: &Path) -> Result<()> {
	let labels = LabelMap::from_class_names(classes);
	let mut commit = StagedCommit::new();

	commit.stage_record(model, dir, CHECKPOINT_STEM)?;
	commit.stage_with(dir.join(FILE_NAME), |writer| labels.write_generated(writer))?;
	commit.commit()
}

pub fn save_interrupted<B: Backend, M: Module<B>>(model: M, dir: &Path) -> Result<PathBuf> {
	let mut commit = StagedCommit::new();
	let path = commit.stage_record(model, dir, INTERRUPTED_STEM)?;
	commit.commit()?;

	Ok(path)
}

#[cfg(test)]
mod tests {
	use burn::backend::LibTorch;
	use burn::nn::LinearConfig;
	use burn_tch::LibTorchDevice;
	use crate::error::FoodError;
	use super::*;

	fn file_names(dir: &Path) -> Vec<String> {
		let mut names: Vec<String> = fs::read_dir(dir)
			.unwrap()
			.map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
			.collect();
		names.sort();
		names
	}

	#[test]
	fn commit_best_leaves_no_partial_files() {
		let dir = tempfile::tempdir().unwrap();
		let model = LinearConfig::new(2, 2).init::<LibTorch>(&LibTorchDevice::Cpu);
		let classes = vec!["ผัดไทย".to_string(), "ต้มยำ".to_string()];

		commit_best(model, &classes, dir.path()).unwrap();

		assert_eq!(file_names(dir.path()), ["best_model_thfood50.mpk", "class_map_thfood50.csv"]);
		let labels = LabelMap::from_path(dir.path().join(FILE_NAME)).unwrap();
		assert_eq!(labels.get(1).unwrap().english, "ต้มยำ");
	}

	#[test]
	fn commit_replaces_previous_best() {
		let dir = tempfile::tempdir().unwrap();
		let device = LibTorchDevice::Cpu;
		let first = vec!["a".to_string()];
		let second = vec!["a".to_string(), "b".to_string()];

		commit_best(LinearConfig::new(2, 1).init::<LibTorch>(&device), &first, dir.path()).unwrap();
		commit_best(LinearConfig::new(2, 2).init::<LibTorch>(&device), &second, dir.path()).unwrap();

		assert_eq!(LabelMap::from_path(dir.path().join(FILE_NAME)).unwrap().len(), 2);
		assert_eq!(file_names(dir.path()).len(), 2);
	}

	#[test]
	fn failed_stage_cleans_up() {
		let dir = tempfile::tempdir().unwrap();
		let target = dir.path().join("out.csv");

		{
			let mut commit = StagedCommit::new();
			commit.stage_with(target.clone(), |_| Ok(())).unwrap();
			let err = commit.stage_with(dir.path().join("other.csv"), |_| Err(FoodError::EmptyLabelMap));
			assert!(err.is_err());
		}

		assert!(file_names(dir.path()).is_empty());
	}

	#[test]
	fn interrupted_checkpoint_name() {
		let dir = tempfile::tempdir().unwrap();
		let model = LinearConfig::new(2, 2).init::<LibTorch>(&LibTorchDevice::Cpu);

		let path = save_interrupted(model, dir.path()).unwrap();

		assert_eq!(path, dir.path().join("checkpoint_thfood50.mpk"));
		assert_eq!(file_names(dir.path()), ["checkpoint_thfood50.mpk"]);
	}
}

use std::env;
use std::path::{Path, PathBuf};
use crate::error::{FoodError, Result};
use crate::labels::{FILE_NAME, MIN_FILE_NAME};
use crate::loader::{checkpoint_candidates, CHECKPOINT_STEM};

/// Overrides the AI directory, which otherwise is the parent of the executable's directory.
pub const AI_DIR_ENV: &str = "THFOOD_AI_DIR";

/// First candidate that exists on disk, in order.
pub fn first_existing<P: AsRef<Path>>(candidates: &[P]) -> Option<PathBuf> {
	for candidate in candidates {
		let candidate: &Path = candidate.as_ref();
		if candidate.exists() {
			return Some(candidate.to_path_buf());
		}
	}

	None
}

/// Ordered base directories a relative path is tried against.
#[derive(Debug, Clone)]
pub struct SearchRoots {
	roots: Vec<PathBuf>,
}

impl SearchRoots {
	pub fn new(roots: Vec<PathBuf>) -> Self {
		Self { roots }
	}

	pub fn candidates<P: AsRef<Path>>(&self, path: P) -> Vec<PathBuf> {
		let path = path.as_ref();
		if path.is_absolute() {
			return vec![path.to_path_buf()];
		}

		self.roots.iter().map(|root| root.join(path)).collect()
	}

	/// Canonical path of the first candidate that is a regular file.
	pub fn resolve_file(&self, input: &str) -> Result<PathBuf> {
		self.candidates(input)
			.into_iter()
			.filter(|candidate| candidate.is_file())
			.find_map(|candidate| candidate.canonicalize().ok())
			.ok_or_else(|| FoodError::ImageNotFound(input.to_string()))
	}
}

/// Directory layout of a deployed backend: `<backend>/AI/<bin dir>/infer`.
#[derive(Debug, Clone)]
pub struct AppDirs {
	pub cwd: PathBuf,
	pub ai_dir: PathBuf,
	pub backend_root: PathBuf,
}

impl AppDirs {
	pub fn new(cwd: PathBuf, ai_dir: PathBuf) -> Self {
		let backend_root = ai_dir.parent().map(Path::to_path_buf).unwrap_or_else(|| ai_dir.clone());

		Self {
			cwd,
			ai_dir,
			backend_root,
		}
	}

	pub fn discover() -> Result<Self> {
		let cwd = env::current_dir()?;
		let ai_dir = match env::var_os(AI_DIR_ENV) {
			Some(dir) => PathBuf::from(dir),
			None => {
				let exe = env::current_exe()?;
				let exe = exe.canonicalize().unwrap_or(exe);
				exe.parent()
					.and_then(Path::parent)
					.map(Path::to_path_buf)
					.unwrap_or_else(|| cwd.clone())
			}
		};
		log::debug!("AI directory: {}", ai_dir.display());

		Ok(Self::new(cwd, ai_dir))
	}

	pub fn search_roots(&self) -> SearchRoots {
		SearchRoots::new(vec![self.cwd.clone(), self.ai_dir.clone(), self.backend_root.clone()])
	}

	pub fn label_map_candidates(&self) -> Vec<PathBuf> {
		[&self.backend_root, &self.ai_dir]
			.into_iter()
			.flat_map(|dir| [dir.join(MIN_FILE_NAME), dir.join(FILE_NAME)])
			.collect()
	}

	pub fn checkpoint_candidates(&self) -> Vec<PathBuf> {
		let dirs = [self.ai_dir.join("Model"), self.backend_root.join("AI").join("Model")];
		checkpoint_candidates(&dirs, CHECKPOINT_STEM)
	}
}

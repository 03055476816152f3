use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use csv::{ReaderBuilder, StringRecord, Trim, WriterBuilder};
use crate::error::{FoodError, Result};
use crate::paths::first_existing;

/// Reduced label map shipped next to the backend.
pub const MIN_FILE_NAME: &str = "class_map_thfood50_min.csv";
/// Label map regenerated by the trainer.
pub const FILE_NAME: &str = "class_map_thfood50.csv";

const THAI_KEYS: [&str; 4] = ["ชื่อภาษาไทย", "ชื่อไทย", "thai", "th"];
const ENGLISH_KEYS: [&str; 4] = ["ชื่อภาษาอังกฤษ", "ชื่ออังกฤษ", "english", "en"];
const MISSING: &str = "N/A";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
	pub index: usize,
	pub thai: String,
	pub english: String,
}

impl Label {
	/// Fills a missing name from the other one, "N/A" when neither is given.
	fn new(index: usize, thai: Option<&str>, english: Option<&str>) -> Self {
		let (thai, english) = match (thai, english) {
			(Some(th), Some(en)) => (th, en),
			(Some(th), None) => (th, th),
			(None, Some(en)) => (en, en),
			(None, None) => (MISSING, MISSING),
		};

		Self {
			index,
			thai: thai.to_string(),
			english: english.to_string(),
		}
	}
}

/// Ordered class index to display name table. The index of an entry equals its position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelMap {
	entries: Vec<Label>,
}

impl LabelMap {
	pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
		let mut reader = ReaderBuilder::new()
			.has_headers(false)
			.flexible(true)
			.trim(Trim::All)
			.from_reader(reader);

		let mut rows = reader.records().collect::<std::result::Result<Vec<StringRecord>, _>>()?.into_iter();
		let Some(first) = rows.next() else {
			return Ok(Self::default());
		};

		let header: Vec<String> = first
			.iter()
			.enumerate()
			.map(|(i, cell)| {
				let cell = if i == 0 { cell.trim_start_matches('\u{feff}') } else { cell };
				cell.trim().to_lowercase()
			})
			.collect();

		// index,thai,english rows without a header line, class names may look like header keys
		if is_generated(&header) {
			let entries = std::iter::once(first)
				.chain(rows)
				.enumerate()
				.map(|(index, row)| Label::new(index, non_empty(&row, 1), non_empty(&row, 2)))
				.collect();
			return Ok(Self { entries });
		}

		let thai_columns = columns_for(&header, &THAI_KEYS);
		let english_columns = columns_for(&header, &ENGLISH_KEYS);
		let entries = rows
			.enumerate()
			.map(|(index, row)| {
				let thai = thai_columns.iter().find_map(|&column| non_empty(&row, column));
				let english = english_columns.iter().find_map(|&column| non_empty(&row, column));
				Label::new(index, thai, english)
			})
			.collect();

		Ok(Self { entries })
	}

	pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
		Self::from_reader(File::open(path)?)
	}

	/// Loads the first existing candidate.
	pub fn locate(candidates: &[PathBuf]) -> Result<(PathBuf, Self)> {
		let path = first_existing(candidates).ok_or(FoodError::LabelMapNotFound)?;
		let map = Self::from_path(&path)?;

		if map.is_empty() {
			return Err(FoodError::EmptyLabelMap);
		}
		log::debug!("Loaded {} labels from {}", map.len(), path.display());

		Ok((path, map))
	}

	/// Map derived from dataset folder names, both names set to the folder name.
	pub fn from_class_names<S: AsRef<str>>(names: &[S]) -> Self {
		let entries = names
			.iter()
			.enumerate()
			.map(|(index, name)| Label::new(index, Some(name.as_ref()), None))
			.collect();

		Self { entries }
	}

	/// Writes `index,name,name` rows, no header.
	pub fn write_generated<W: Write>(&self, writer: W) -> Result<()> {
		let mut writer = WriterBuilder::new().has_headers(false).from_writer(writer);
		for label in &self.entries {
			writer.write_record([label.index.to_string().as_str(), label.thai.as_str(), label.english.as_str()])?;
		}
		writer.flush()?;

		Ok(())
	}

	pub fn get(&self, index: usize) -> Option<&Label> {
		self.entries.get(index)
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn iter(&self) -> impl Iterator<Item = &Label> {
		self.entries.iter()
	}
}

fn columns_for(header: &[String], keys: &[&str]) -> Vec<usize> {
	keys.iter()
		.filter_map(|key| header.iter().position(|cell| cell == key))
		.collect()
}

fn is_generated(header: &[String]) -> bool {
	header.first().is_some_and(|cell| cell.parse::<usize>().is_ok())
}

fn non_empty(row: &StringRecord, column: usize) -> Option<&str> {
	row.get(column).map(str::trim).filter(|value| !value.is_empty())
}

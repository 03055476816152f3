//! Thai food dish classifier on an EfficientNet-B0 backbone.
//!
//! Binaries: `train` fine-tunes the network in two stages, `predict` prints a
//! ranked top-K list for a configured image, `infer` answers one image with a
//! single JSON line.

pub mod amp;
pub mod augment;
pub mod checkpoint;
pub mod data;
pub mod error;
pub mod freeze;
pub mod inference;
pub mod labels;
pub mod loader;
pub mod paths;
pub mod schedule;
pub mod stage;
pub mod train;

pub use error::{FoodError, Result};

/// Which leading share of the ordered feature layers stays frozen.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FreezePolicy {
	frozen_fraction: f64,
}

impl FreezePolicy {
	/// Fraction is clamped to [0, 1].
	pub fn new(frozen_fraction: f64) -> Self {
		Self {
			frozen_fraction: frozen_fraction.clamp(0.0, 1.0),
		}
	}

	pub fn all() -> Self {
		Self::new(1.0)
	}

	/// Index of the first trainable layer: `floor(layers * fraction)`.
	pub fn boundary(&self, layers: usize) -> usize {
		((layers as f64 * self.frozen_fraction).floor() as usize).min(layers)
	}

	/// Splits layer names into (frozen, trainable).
	pub fn split<'a>(&self, names: &'a [String]) -> (&'a [String], &'a [String]) {
		names.split_at(self.boundary(names.len()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn thirty_percent_of_nine_layers() {
		assert_eq!(FreezePolicy::new(0.3).boundary(9), 2);
	}

	#[test]
	fn all_and_none() {
		assert_eq!(FreezePolicy::all().boundary(9), 9);
		assert_eq!(FreezePolicy::new(0.0).boundary(9), 0);
		assert_eq!(FreezePolicy::new(1.7).boundary(9), 9);
	}

	#[test]
	fn split_by_name() {
		let names: Vec<String> = (0..9).map(|i| format!("features.{i}")).collect();

		let (frozen, trainable) = FreezePolicy::new(0.3).split(&names);

		assert_eq!(frozen, ["features.0", "features.1"]);
		assert_eq!(trainable.len(), 7);
		assert_eq!(trainable[0], "features.2");
	}
}

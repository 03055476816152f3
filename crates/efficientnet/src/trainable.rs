use burn::module::{Module, ModuleMapper, ParamId};
use burn::prelude::{Backend, Tensor};
use crate::efficientnet::EfficientNet;

/// Sets the gradient requirement of every float parameter it visits.
struct RequireGrad(bool);

impl<B: Backend> ModuleMapper<B> for RequireGrad {
	fn map_float<const D: usize>(&mut self, _id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
		tensor.set_require_grad(self.0)
	}
}

impl<B: Backend> EfficientNet<B> {
	/// Freezes feature layers `[0, boundary)` and makes everything after them trainable, head included.
	pub fn freeze_features_until(self, boundary: usize) -> Self {
		let features = self
			.features
			.into_iter()
			.enumerate()
			.map(|(i, layer)| layer.map(&mut RequireGrad(i >= boundary)))
			.collect();
		let classifier = self.classifier.map(&mut RequireGrad(true));

		Self {
			features,
			classifier,
			..self
		}
	}
}

use burn::nn::conv::Conv2d;
use burn::nn::pool::AdaptiveAvgPool2d;
use burn::nn::BatchNorm;
use burn::prelude::{Backend, Module, Tensor};
use burn::tensor::activation::{sigmoid, silu};
use burn::tensor::Distribution;

/// One entry of the ordered feature extractor: the stem and head convolutions, or a stage of MBConv blocks.
#[derive(Debug, Module)]
pub enum FeatureLayer<B: Backend> {
	Conv(ConvNormActivation<B>),
	Stage(Stage<B>),
}

impl<B: Backend> FeatureLayer<B> {
	pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
		match self {
			FeatureLayer::Conv(conv) => conv.forward(input),
			FeatureLayer::Stage(stage) => stage.forward(input),
		}
	}
}

#[derive(Debug, Module)]
pub struct ConvNormActivation<B: Backend> {
	pub(crate) conv: Conv2d<B>,
	pub(crate) norm: BatchNorm<B, 2>,
}

impl<B: Backend> ConvNormActivation<B> {
	pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
		let x = self.conv.forward(input);
		let x = self.norm.forward(x);
		silu(x)
	}
}

/// Linear bottleneck: convolution and batch norm without activation.
#[derive(Debug, Module)]
pub struct ConvNorm<B: Backend> {
	pub(crate) conv: Conv2d<B>,
	pub(crate) norm: BatchNorm<B, 2>,
}

impl<B: Backend> ConvNorm<B> {
	pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
		let x = self.conv.forward(input);
		self.norm.forward(x)
	}
}

#[derive(Debug, Module)]
pub struct SqueezeExcitation<B: Backend> {
	pub(crate) pool: AdaptiveAvgPool2d,
	pub(crate) fc1: Conv2d<B>,
	pub(crate) fc2: Conv2d<B>,
}

impl<B: Backend> SqueezeExcitation<B> {
	pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
		let scale = self.pool.forward(input.clone());
		let scale = silu(self.fc1.forward(scale));
		let scale = sigmoid(self.fc2.forward(scale));

		input * scale
	}
}

/// Inverted residual block with squeeze-and-excitation.
#[derive(Debug, Module)]
pub struct MBConv<B: Backend> {
	pub(crate) expand: Option<ConvNormActivation<B>>,
	pub(crate) depthwise: ConvNormActivation<B>,
	pub(crate) se: SqueezeExcitation<B>,
	pub(crate) project: ConvNorm<B>,
	pub(crate) stochastic_depth: f64,
}

impl<B: Backend> MBConv<B> {
	pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
		let identity = input.clone();

		let x = match &self.expand {
			Some(expand) => expand.forward(input),
			None => input,
		};
		let x = self.depthwise.forward(x);
		let x = self.se.forward(x);
		let x = self.project.forward(x);

		// skip only when stride is 1 and the width is unchanged
		if x.dims() == identity.dims() {
			drop_path(x, self.stochastic_depth) + identity
		} else {
			x
		}
	}
}

#[derive(Debug, Module)]
pub struct Stage<B: Backend> {
	pub(crate) blocks: Vec<MBConv<B>>,
}

impl<B: Backend> Stage<B> {
	pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
		let mut x = input;
		for block in &self.blocks {
			x = block.forward(x);
		}
		x
	}
}

/// Row-wise stochastic depth. Identity outside of training.
fn drop_path<B: Backend>(x: Tensor<B, 4>, prob: f64) -> Tensor<B, 4> {
	if !B::ad_enabled() || prob <= 0.0 {
		return x;
	}

	let survival = 1.0 - prob;
	let [batch, _, _, _] = x.dims();
	let mask = Tensor::<B, 4>::random([batch, 1, 1, 1], Distribution::Bernoulli(survival), &x.device());

	x * mask.div_scalar(survival)
}

use std::f64::consts::SQRT_2;
use burn::nn::conv::Conv2dConfig;
use burn::nn::pool::AdaptiveAvgPool2dConfig;
use burn::nn::{BatchNormConfig, DropoutConfig, Initializer, LinearConfig, PaddingConfig2d};
use burn::prelude::{Backend, Config, Device};
use crate::block::{ConvNorm, ConvNormActivation, FeatureLayer, MBConv, SqueezeExcitation, Stage};
use crate::efficientnet::EfficientNet;

/// Width of the last feature layer, i.e. the classifier input.
pub const LAST_CHANNELS: usize = 1280;
const STEM_CHANNELS: usize = 32;

/// EfficientNet-B0 stages: (expand ratio, kernel, stride, in channels, out channels, layers).
const B0_STAGES: [(usize, usize, usize, usize, usize, usize); 7] = [
	(1, 3, 1, 32, 16, 1),
	(6, 3, 2, 16, 24, 2),
	(6, 5, 2, 24, 40, 2),
	(6, 3, 2, 40, 80, 3),
	(6, 5, 1, 80, 112, 3),
	(6, 5, 2, 112, 192, 4),
	(6, 3, 1, 192, 320, 1),
];

fn conv_initializer() -> Initializer {
	Initializer::KaimingNormal {
		gain: SQRT_2,
		fan_out_only: true,
	}
}

struct ConvNormConfig {
	conv: Conv2dConfig,
	norm: BatchNormConfig,
}

impl ConvNormConfig {
	fn new(in_channels: usize, out_channels: usize, kernel: usize, stride: usize, groups: usize) -> Self {
		let padding = (kernel - 1) / 2;
		let conv = Conv2dConfig::new([in_channels, out_channels], [kernel, kernel])
			.with_stride([stride, stride])
			.with_padding(PaddingConfig2d::Explicit(padding, padding))
			.with_groups(groups)
			.with_bias(false)
			.with_initializer(conv_initializer());
		let norm = BatchNormConfig::new(out_channels);

		Self { conv, norm }
	}

	fn init_activated<B: Backend>(&self, device: &Device<B>) -> ConvNormActivation<B> {
		ConvNormActivation {
			conv: self.conv.init(device),
			norm: self.norm.init(device),
		}
	}

	fn init<B: Backend>(&self, device: &Device<B>) -> ConvNorm<B> {
		ConvNorm {
			conv: self.conv.init(device),
			norm: self.norm.init(device),
		}
	}
}

struct SqueezeExcitationConfig {
	fc1: Conv2dConfig,
	fc2: Conv2dConfig,
}

impl SqueezeExcitationConfig {
	fn new(channels: usize, squeeze_channels: usize) -> Self {
		let fc1 = Conv2dConfig::new([channels, squeeze_channels], [1, 1])
			.with_initializer(conv_initializer());
		let fc2 = Conv2dConfig::new([squeeze_channels, channels], [1, 1])
			.with_initializer(conv_initializer());

		Self { fc1, fc2 }
	}

	fn init<B: Backend>(&self, device: &Device<B>) -> SqueezeExcitation<B> {
		SqueezeExcitation {
			pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
			fc1: self.fc1.init(device),
			fc2: self.fc2.init(device),
		}
	}
}

struct MBConvConfig {
	expand: Option<ConvNormConfig>,
	depthwise: ConvNormConfig,
	se: SqueezeExcitationConfig,
	project: ConvNormConfig,
	stochastic_depth: f64,
}

impl MBConvConfig {
	fn new(
		in_channels: usize,
		out_channels: usize,
		expand_ratio: usize,
		kernel: usize,
		stride: usize,
		stochastic_depth: f64,
	) -> Self {
		let expanded = in_channels * expand_ratio;

		// conv1x1, skipped for expand ratio 1
		let expand = (expanded != in_channels).then(|| ConvNormConfig::new(in_channels, expanded, 1, 1, 1));
		// depthwise kxk
		let depthwise = ConvNormConfig::new(expanded, expanded, kernel, stride, expanded);
		// squeeze width follows the block input, not the expanded width
		let se = SqueezeExcitationConfig::new(expanded, usize::max(1, in_channels / 4));
		// conv1x1, linear
		let project = ConvNormConfig::new(expanded, out_channels, 1, 1, 1);

		Self {
			expand,
			depthwise,
			se,
			project,
			stochastic_depth,
		}
	}

	fn init<B: Backend>(&self, device: &Device<B>) -> MBConv<B> {
		MBConv {
			expand: self.expand.as_ref().map(|expand| expand.init_activated(device)),
			depthwise: self.depthwise.init_activated(device),
			se: self.se.init(device),
			project: self.project.init(device),
			stochastic_depth: self.stochastic_depth,
		}
	}
}

#[derive(Config, Debug)]
pub struct EfficientNetConfig {
	pub num_classes: usize,
	#[config(default = 0.2)]
	pub dropout: f64,
	#[config(default = 0.2)]
	pub stochastic_depth_prob: f64,
}

impl EfficientNetConfig {
	pub fn init<B: Backend>(&self, device: &Device<B>) -> EfficientNet<B> {
		let total_blocks: usize = B0_STAGES.iter().map(|stage| stage.5).sum();
		let mut features = Vec::with_capacity(B0_STAGES.len() + 2);

		// 3x3 conv, 32, /2
		features.push(FeatureLayer::Conv(
			ConvNormConfig::new(3, STEM_CHANNELS, 3, 2, 1).init_activated(device),
		));

		let mut block_id = 0;
		for (expand_ratio, kernel, stride, in_channels, out_channels, layers) in B0_STAGES {
			let mut blocks = Vec::with_capacity(layers);
			for layer in 0..layers {
				// First block uses the stage stride and input width
				let (in_channels, stride) = if layer == 0 {
					(in_channels, stride)
				} else {
					(out_channels, 1)
				};
				let drop = self.stochastic_depth_prob * block_id as f64 / total_blocks as f64;
				blocks.push(
					MBConvConfig::new(in_channels, out_channels, expand_ratio, kernel, stride, drop)
						.init(device),
				);
				block_id += 1;
			}
			features.push(FeatureLayer::Stage(Stage { blocks }));
		}

		// 1x1 conv, 1280
		let last_stage_channels = B0_STAGES[B0_STAGES.len() - 1].4;
		features.push(FeatureLayer::Conv(
			ConvNormConfig::new(last_stage_channels, LAST_CHANNELS, 1, 1, 1).init_activated(device),
		));

		EfficientNet {
			features,
			avgpool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
			dropout: DropoutConfig::new(self.dropout).init(),
			classifier: classifier_config(self.num_classes).init(device),
		}
	}
}

/// Fresh classification head, initialised uniformly in ±1/sqrt(num_classes).
pub(crate) fn classifier_config(num_classes: usize) -> LinearConfig {
	let range = 1.0 / (num_classes as f64).sqrt();

	LinearConfig::new(LAST_CHANNELS, num_classes).with_initializer(Initializer::Uniform {
		min: -range,
		max: range,
	})
}

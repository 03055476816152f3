use std::marker::PhantomData;
use burn::module::{Module, ModuleMapper, ModuleVisitor, ParamId};
use burn::nn::loss::CrossEntropyLoss;
use burn::optim::GradientsParams;
use burn::prelude::{Backend, ElementConversion, Tensor, TensorData};
use burn::tensor::backend::AutodiffBackend;
use efficientnet::EfficientNet;
use crate::data::FoodBatch;
use crate::train::count_correct;

/// Dynamic loss scaling for half precision training.
#[derive(Debug, Clone)]
pub struct GradScaler {
	scale: f32,
	growth_factor: f32,
	backoff_factor: f32,
	growth_interval: usize,
	clean_steps: usize,
}

impl Default for GradScaler {
	fn default() -> Self {
		// largest power of two below the f16 maximum of 65504
		Self {
			scale: 32768.0,
			growth_factor: 2.0,
			backoff_factor: 0.5,
			growth_interval: 2000,
			clean_steps: 0,
		}
	}
}

impl GradScaler {
	pub fn scale(&self) -> f32 {
		self.scale
	}

	pub fn scale_loss<B: Backend>(&self, loss: Tensor<B, 1>) -> Tensor<B, 1> {
		loss.mul_scalar(self.scale)
	}

	/// Backs off on overflow, grows after `growth_interval` clean steps.
	pub fn update(&mut self, found_non_finite: bool) {
		if found_non_finite {
			self.scale *= self.backoff_factor;
			self.clean_steps = 0;
			log::debug!("Non-finite gradients, loss scale now {}", self.scale);
			return;
		}

		self.clean_steps += 1;
		if self.clean_steps == self.growth_interval {
			self.scale *= self.growth_factor;
			self.clean_steps = 0;
		}
	}
}

/// Outcome of one forward and backward pass.
pub struct BatchStep {
	pub count: usize,
	pub correct: usize,
	pub loss: f64,
	/// Gradients for the master model, `None` when the optimizer step must be skipped.
	pub grads: Option<GradientsParams>,
}

/// Where the forward and backward passes of a training batch run.
///
/// The master model always holds the weights the optimizer updates.
pub trait Precision<B: AutodiffBackend> {
	type Compute: AutodiffBackend<Device = B::Device>;

	fn backward(
		&mut self,
		model: &EfficientNet<B>,
		batch: FoodBatch<Self::Compute>,
		loss: &CrossEntropyLoss<Self::Compute>,
	) -> BatchStep;

	/// Called after the optimizer updated `model`.
	fn sync(&mut self, model: &EfficientNet<B>);

	/// Freezes feature layers `[0, boundary)` of the compute side.
	fn freeze_features_until(&mut self, boundary: usize);

	/// The model to validate and save.
	fn settle(&self, model: &EfficientNet<B>) -> EfficientNet<B>;
}

/// Everything on the master model.
#[derive(Debug, Clone, Copy, Default)]
pub struct FullPrecision;

impl<B: AutodiffBackend> Precision<B> for FullPrecision {
	type Compute = B;

	fn backward(&mut self, model: &EfficientNet<B>, batch: FoodBatch<B>, loss: &CrossEntropyLoss<B>) -> BatchStep {
		let count = batch.targets.dims()[0];
		let output = model.forward(batch.images);
		let loss = loss.forward(output.clone(), batch.targets.clone());
		let correct = count_correct(output, batch.targets);
		let value = loss.clone().into_scalar().elem::<f64>();

		BatchStep {
			count,
			correct,
			loss: value,
			grads: Some(GradientsParams::from_grads(loss.backward(), model)),
		}
	}

	fn sync(&mut self, _model: &EfficientNet<B>) {}

	fn freeze_features_until(&mut self, _boundary: usize) {}

	fn settle(&self, model: &EfficientNet<B>) -> EfficientNet<B> {
		model.clone()
	}
}

/// Forward and backward passes in the float type of `H` with a scaled loss.
/// Gradients are unscaled in the master's precision, where the optimizer and its
/// moments live.
///
/// Trainable weights belong to the master, batch norm statistics to the compute copy.
pub struct MixedPrecision<H: AutodiffBackend> {
	model: EfficientNet<H>,
	scaler: GradScaler,
	trainable: Vec<bool>,
}

impl<H: AutodiffBackend> MixedPrecision<H> {
	pub fn new<B: AutodiffBackend<Device = H::Device>>(master: &EfficientNet<B>, device: &H::Device) -> Self {
		let model = EfficientNet::<H>::efficientnet_b0(master.num_classes(), device);

		Self {
			model: overwrite(model, snapshot(master, |_| true)),
			scaler: GradScaler::default(),
			trainable: Vec::new(),
		}
	}

	/// Float tensors are addressed by visit order, which both copies share.
	fn is_trainable(&self, position: usize) -> bool {
		self.trainable.get(position).copied().unwrap_or(true)
	}
}

impl<B, H> Precision<B> for MixedPrecision<H>
where
	B: AutodiffBackend,
	H: AutodiffBackend<Device = B::Device>,
{
	type Compute = H;

	fn backward(&mut self, model: &EfficientNet<B>, batch: FoodBatch<H>, loss: &CrossEntropyLoss<H>) -> BatchStep {
		let count = batch.targets.dims()[0];
		let output = self.model.forward(batch.images);
		let loss = loss.forward(output.clone(), batch.targets.clone());
		let correct = count_correct(output, batch.targets);
		let value = loss.clone().into_scalar().elem::<f64>();

		let inverse = 1.0 / self.scaler.scale();
		let mut scaled = GradientsParams::from_grads(self.scaler.scale_loss(loss).backward(), &self.model);
		let grads = take_grads::<H, _>(&self.model, &mut scaled);
		self.trainable = grads.iter().map(Option::is_some).collect();

		let finite = grads
			.iter()
			.flatten()
			.all(|grad| grad.iter::<f32>().all(f32::is_finite));
		self.scaler.update(!finite);

		BatchStep {
			count,
			correct,
			loss: value,
			grads: finite.then(|| register_grads::<B, _>(model, grads, inverse)),
		}
	}

	fn sync(&mut self, model: &EfficientNet<B>) {
		let values = snapshot(model, |position| self.is_trainable(position));
		self.model = overwrite(self.model.clone(), values);
	}

	fn freeze_features_until(&mut self, boundary: usize) {
		self.model = self.model.clone().freeze_features_until(boundary);
	}

	fn settle(&self, model: &EfficientNet<B>) -> EfficientNet<B> {
		let values = snapshot(&self.model, |position| !self.is_trainable(position));
		overwrite(model.clone(), values)
	}
}

/// Host copies of the selected float tensors, `None` for the rest.
fn snapshot<B: Backend, M: Module<B>>(module: &M, select: impl Fn(usize) -> bool) -> Vec<Option<TensorData>> {
	let mut visitor = Snapshot {
		select: &select,
		values: Vec::new(),
	};
	module.visit(&mut visitor);
	visitor.values
}

/// Replaces float tensors position by position, keeping their gradient requirement.
fn overwrite<B: Backend, M: Module<B>>(module: M, values: Vec<Option<TensorData>>) -> M {
	module.map(&mut Overwrite {
		values: values.into_iter(),
	})
}

fn take_grads<B: AutodiffBackend, M: Module<B>>(module: &M, grads: &mut GradientsParams) -> Vec<Option<TensorData>> {
	let mut visitor = TakeGrads::<B> {
		grads,
		taken: Vec::new(),
		phantom: PhantomData,
	};
	module.visit(&mut visitor);
	visitor.taken
}

fn register_grads<B: AutodiffBackend, M: Module<B>>(
	module: &M,
	grads: Vec<Option<TensorData>>,
	inverse: f32,
) -> GradientsParams {
	let mut visitor = RegisterGrads::<B> {
		source: grads.into_iter(),
		inverse,
		grads: GradientsParams::new(),
		phantom: PhantomData,
	};
	module.visit(&mut visitor);
	visitor.grads
}

struct Snapshot<'a> {
	select: &'a dyn Fn(usize) -> bool,
	values: Vec<Option<TensorData>>,
}

impl<B: Backend> ModuleVisitor<B> for Snapshot<'_> {
	fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D>) {
		let value = (self.select)(self.values.len()).then(|| tensor.to_data());
		self.values.push(value);
	}
}

struct Overwrite {
	values: std::vec::IntoIter<Option<TensorData>>,
}

impl<B: Backend> ModuleMapper<B> for Overwrite {
	fn map_float<const D: usize>(&mut self, _id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
		let Some(data) = self.values.next().flatten() else {
			return tensor;
		};

		let require_grad = tensor.is_require_grad();
		Tensor::<B, D>::from_data(data.convert::<B::FloatElem>(), &tensor.device()).set_require_grad(require_grad)
	}
}

struct TakeGrads<'a, B: AutodiffBackend> {
	grads: &'a mut GradientsParams,
	taken: Vec<Option<TensorData>>,
	phantom: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for TakeGrads<'_, B> {
	fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
		let grad = self.grads.remove::<B::InnerBackend, D>(id);
		self.taken.push(grad.map(|grad| grad.into_data().convert::<f32>()));
	}
}

struct RegisterGrads<B: AutodiffBackend> {
	source: std::vec::IntoIter<Option<TensorData>>,
	inverse: f32,
	grads: GradientsParams,
	phantom: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for RegisterGrads<B> {
	fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
		let Some(grad) = self.source.next().flatten() else {
			return;
		};

		let grad = Tensor::<B::InnerBackend, D>::from_data(grad.convert::<B::FloatElem>(), &tensor.device())
			.mul_scalar(self.inverse);
		self.grads.register::<B::InnerBackend, D>(id, grad);
	}
}

#[cfg(test)]
mod tests {
	use burn::backend::{Autodiff, LibTorch};
	use burn::nn::loss::CrossEntropyLossConfig;
	use burn::optim::{Optimizer, SgdConfig};
	use burn::prelude::Int;
	use burn::tensor::{f16, Distribution};
	use burn_tch::LibTorchDevice;
	use super::*;

	// f64 master with f32 compute, both available on the CPU
	type Master = Autodiff<LibTorch<f64>>;
	type Compute = Autodiff<LibTorch>;

	fn batch(images: Tensor<Compute, 4>) -> FoodBatch<Compute> {
		let device = images.device();
		FoodBatch {
			images,
			targets: Tensor::<Compute, 1, Int>::from_ints([0, 1], &device),
		}
	}

	fn random_batch() -> FoodBatch<Compute> {
		batch(Tensor::random([2, 3, 32, 32], Distribution::Default, &LibTorchDevice::Cpu))
	}

	fn head_only() -> (EfficientNet<Master>, MixedPrecision<Compute>) {
		let device = LibTorchDevice::Cpu;
		let master = EfficientNet::<Master>::efficientnet_b0(2, &device);
		let layers = master.layer_names().len();
		let master = master.freeze_features_until(layers);
		let mut mixed = MixedPrecision::<Compute>::new(&master, &device);
		Precision::<Master>::freeze_features_until(&mut mixed, layers);

		(master, mixed)
	}

	#[test]
	fn default_scale_fits_half_precision() {
		assert!(f16::from_f32(GradScaler::default().scale()).is_finite());
	}

	#[test]
	fn grows_after_interval_and_backs_off() {
		let mut scaler = GradScaler::default();

		for _ in 0..1999 {
			scaler.update(false);
		}
		assert_eq!(scaler.scale(), 32768.0);
		scaler.update(false);
		assert_eq!(scaler.scale(), 65536.0);

		scaler.update(true);
		assert_eq!(scaler.scale(), 32768.0);
	}

	#[test]
	fn overflow_resets_the_clean_streak() {
		let mut scaler = GradScaler::default();

		for _ in 0..1500 {
			scaler.update(false);
		}
		scaler.update(true);
		for _ in 0..1999 {
			scaler.update(false);
		}

		assert_eq!(scaler.scale(), 16384.0);
	}

	#[test]
	fn compute_copy_starts_from_the_master() {
		let (master, mixed) = head_only();

		let from_master: Vec<_> = snapshot(&master, |_| true)
			.into_iter()
			.map(|value| value.map(|data| data.convert::<f32>()))
			.collect();

		assert_eq!(snapshot(&mixed.model, |_| true), from_master);
	}

	#[test]
	fn gradients_reach_only_trainable_master_params() {
		let (master, mut mixed) = head_only();
		let loss = CrossEntropyLossConfig::new().init(&LibTorchDevice::Cpu);

		let step = mixed.backward(&master, random_batch(), &loss);

		assert_eq!(step.count, 2);
		assert!(step.loss.is_finite());
		assert_eq!(step.grads.unwrap().len(), 2);
		assert_eq!(mixed.trainable.iter().filter(|trainable| **trainable).count(), 2);
	}

	#[test]
	fn master_keeps_updates_below_compute_resolution() {
		let (master, mut mixed) = head_only();
		let loss = CrossEntropyLossConfig::new().init(&LibTorchDevice::Cpu);
		let mut optimizer = SgdConfig::new().init::<Master, EfficientNet<Master>>();

		let step = mixed.backward(&master, random_batch(), &loss);
		let before = snapshot(&master, |position| mixed.is_trainable(position));
		let master = optimizer.step(1e-12, master, step.grads.unwrap());
		Precision::<Master>::sync(&mut mixed, &master);
		let after = snapshot(&master, |position| mixed.is_trainable(position));

		let (changed, total) = before
			.iter()
			.zip(&after)
			.filter_map(|(before, after)| Some((before.as_ref()?, after.as_ref()?)))
			.flat_map(|(before, after)| before.iter::<f64>().zip(after.iter::<f64>()))
			.fold((0, 0), |(changed, total), (before, after)| {
				(changed + usize::from(before != after), total + 1)
			});

		assert!(total > 0);
		assert!(changed * 10 > total * 8, "{changed} of {total} weights moved");
	}

	#[test]
	fn non_finite_gradients_skip_the_step() {
		let (master, mut mixed) = head_only();
		let loss = CrossEntropyLossConfig::new().init(&LibTorchDevice::Cpu);
		let images = Tensor::full([2, 3, 32, 32], f32::MAX, &LibTorchDevice::Cpu);

		let step = mixed.backward(&master, batch(images), &loss);

		assert!(step.grads.is_none());
		assert_eq!(mixed.scaler.scale(), 16384.0);
	}

	#[test]
	fn settled_model_merges_both_sides() {
		let (master, mut mixed) = head_only();
		let loss = CrossEntropyLossConfig::new().init(&LibTorchDevice::Cpu);
		mixed.backward(&master, random_batch(), &loss);

		let settled = Precision::<Master>::settle(&mixed, &master);

		let settled = snapshot(&settled, |_| true);
		let master = snapshot(&master, |_| true);
		let compute = snapshot(&mixed.model, |_| true);
		for (position, value) in settled.into_iter().enumerate() {
			let value = value.unwrap();
			if mixed.is_trainable(position) {
				assert_eq!(Some(value), master[position]);
			} else {
				assert_eq!(Some(value.convert::<f32>()), compute[position]);
			}
		}
	}
}

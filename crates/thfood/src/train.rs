use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use burn::config::Config;
use burn::data::dataloader::{DataLoader, DataLoaderBuilder};
use burn::data::dataset::Dataset;
use burn::module::AutodiffModule;
use burn::nn::loss::{CrossEntropyLoss, CrossEntropyLossConfig};
use burn::optim::{AdamWConfig, Optimizer};
use burn::prelude::{Backend, ElementConversion, Int, Tensor};
use burn::tensor::backend::AutodiffBackend;
use efficientnet::{EfficientNet, EfficientNetB0};
use indicatif::{ProgressBar, ProgressStyle};
use crate::amp::Precision;
use crate::checkpoint::{commit_best, save_interrupted};
use crate::data::{FoodBatch, FoodBatcher, FoodDataset};
use crate::error::{FoodError, Result};
use crate::freeze::FreezePolicy;
use crate::labels::FILE_NAME;
use crate::loader::{CHECKPOINT_STEM, INTERRUPTED_STEM};
use crate::schedule::{BestAccuracy, PlateauConfig};
use crate::stage::{drive_stage, EpochMetrics, StageHooks, StagePlan, StageReport};

/// Written into `root` at the start of every run.
pub const CONFIG_FILE_NAME: &str = "training_config.json";

#[derive(Config, Debug)]
pub struct TrainingConfig {
	#[config(default = "String::from(\"D:/thai-food-ai\")")]
	pub root: String,
	#[config(default = "String::from(\"THFOOD-50\")")]
	pub dataset: String,
	#[config(default = 16)]
	pub batch_size_train: usize,
	#[config(default = 32)]
	pub batch_size_val: usize,
	#[config(default = 10)]
	pub epochs_stage1: usize,
	#[config(default = 60)]
	pub epochs_stage2: usize,
	#[config(default = 1e-3)]
	pub learning_rate_stage1: f64,
	#[config(default = 1e-4)]
	pub learning_rate_stage2: f64,
	#[config(default = 0.05)]
	pub label_smoothing: f32,
	#[config(default = 2e-4)]
	pub weight_decay: f32,
	#[config(default = 10)]
	pub early_stop_patience: usize,
	#[config(default = 3)]
	pub scheduler_patience: usize,
	#[config(default = 0.5)]
	pub scheduler_factor: f64,
	#[config(default = 1e-6)]
	pub min_learning_rate: f64,
	/// Leading share of the feature layers kept frozen in stage 2.
	#[config(default = 0.3)]
	pub frozen_fraction: f64,
	#[config(default = true)]
	pub use_amp: bool,
	#[config(default = 50)]
	pub expected_classes: usize,
	#[config(default = 0)]
	pub num_workers: usize,
	#[config(default = 42)]
	pub seed: u64,
}

impl TrainingConfig {
	pub fn root_dir(&self) -> PathBuf {
		PathBuf::from(&self.root)
	}

	pub fn train_dir(&self) -> PathBuf {
		self.root_dir().join(&self.dataset).join("train")
	}

	pub fn val_dir(&self) -> PathBuf {
		self.root_dir().join(&self.dataset).join("val")
	}

	fn plateau(&self) -> PlateauConfig {
		PlateauConfig::new()
			.with_factor(self.scheduler_factor)
			.with_patience(self.scheduler_patience)
			.with_min_lr(self.min_learning_rate)
	}

	/// Head only.
	pub fn stage1_plan(&self) -> StagePlan {
		StagePlan {
			name: "S1",
			epochs: self.epochs_stage1,
			learning_rate: self.learning_rate_stage1,
			early_stop_patience: None,
			plateau: self.plateau(),
		}
	}

	/// Upper feature layers and head, with early stopping.
	pub fn stage2_plan(&self) -> StagePlan {
		StagePlan {
			name: "S2",
			epochs: self.epochs_stage2,
			learning_rate: self.learning_rate_stage2,
			early_stop_patience: Some(self.early_stop_patience),
			plateau: self.plateau(),
		}
	}
}

#[derive(Debug, Clone)]
pub struct TrainingSummary {
	pub best_accuracy: f64,
	pub classes: Vec<String>,
	pub stage1: StageReport,
	pub stage2: StageReport,
}

struct Session<B: AutodiffBackend, P: Precision<B>> {
	model: EfficientNet<B>,
	precision: P,
	classes: Vec<String>,
	root: PathBuf,
	train_loader: Arc<dyn DataLoader<Option<FoodBatch<P::Compute>>>>,
	val_loader: Arc<dyn DataLoader<Option<FoodBatch<B::InnerBackend>>>>,
	train_items: usize,
	train_loss: CrossEntropyLoss<P::Compute>,
	val_loss: CrossEntropyLoss<B::InnerBackend>,
	interrupt: Arc<AtomicBool>,
}

impl<B: AutodiffBackend, P: Precision<B>> Session<B, P> {
	fn check_interrupt(&self) -> Result<()> {
		if self.interrupt.load(Ordering::SeqCst) {
			return Err(FoodError::Interrupted);
		}
		Ok(())
	}

	fn freeze_features_until(&mut self, boundary: usize) {
		self.model = self.model.clone().freeze_features_until(boundary);
		self.precision.freeze_features_until(boundary);
	}

	/// Accuracy and mean loss over the validation set, evaluation behaviour.
	fn validate(&self) -> Result<(f64, f64)> {
		let model = self.precision.settle(&self.model).valid();
		let mut correct = 0;
		let mut seen = 0;
		let mut loss_sum = 0.0;

		for batch in self.val_loader.iter() {
			self.check_interrupt()?;
			let Some(batch) = batch else {
				continue;
			};

			let count = batch.targets.dims()[0];
			let output = model.forward(batch.images);
			let loss = self.val_loss.forward(output.clone(), batch.targets.clone());

			loss_sum += loss.into_scalar().elem::<f64>() * count as f64;
			correct += count_correct(output, batch.targets);
			seen += count;
		}

		if seen == 0 {
			return Ok((0.0, 0.0));
		}

		Ok((correct as f64 / seen as f64, loss_sum / seen as f64))
	}
}

pub(crate) fn count_correct<B: Backend>(output: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> usize {
	let predicted = output.argmax(1).flatten::<1>(0, 1);
	predicted.equal(targets).int().sum().into_scalar().elem::<i64>() as usize
}

fn progress_bar(len: usize, prefix: String) -> ProgressBar {
	let bar = ProgressBar::new(len as u64);
	if let Ok(style) = ProgressStyle::with_template("{prefix} {bar:40.cyan/blue} {pos}/{len} [{elapsed_precise}<{eta_precise}] {msg}") {
		bar.set_style(style.progress_chars("=> "));
	}
	bar.set_prefix(prefix);
	bar
}

/// A stage bound to its optimizer.
struct StageRun<'a, B: AutodiffBackend, P: Precision<B>, O> {
	session: &'a mut Session<B, P>,
	optimizer: O,
}

impl<B, P, O> StageHooks for StageRun<'_, B, P, O>
where
	B: AutodiffBackend,
	P: Precision<B>,
	O: Optimizer<EfficientNet<B>, B>,
{
	fn run_epoch(&mut self, plan: &StagePlan, epoch: usize, lr: f64) -> Result<EpochMetrics> {
		let session = &mut *self.session;
		let bar = progress_bar(session.train_items, format!("{} {epoch}/{}", plan.name, plan.epochs));
		let mut correct = 0;
		let mut seen = 0;

		for batch in session.train_loader.iter() {
			if let Err(err) = session.check_interrupt() {
				bar.abandon();
				return Err(err);
			}
			let Some(batch) = batch else {
				continue;
			};

			let step = session.precision.backward(&session.model, batch, &session.train_loss);
			correct += step.correct;
			seen += step.count;
			bar.set_message(format!("loss {:.4}", step.loss));

			if let Some(grads) = step.grads {
				session.model = self.optimizer.step(lr, session.model.clone(), grads);
				session.precision.sync(&session.model);
			}
			bar.inc(step.count as u64);
		}
		bar.finish_and_clear();

		let (val_accuracy, val_loss) = session.validate()?;
		let train_accuracy = if seen == 0 { 0.0 } else { correct as f64 / seen as f64 };

		Ok(EpochMetrics {
			train_accuracy,
			val_accuracy,
			val_loss,
		})
	}

	fn commit_best(&mut self, metrics: &EpochMetrics) -> Result<()> {
		let session = &*self.session;
		commit_best(session.precision.settle(&session.model), &session.classes, &session.root)?;
		println!(
			"saved: {CHECKPOINT_STEM}.mpk, {FILE_NAME} (val_acc={:.4})",
			metrics.val_accuracy
		);
		Ok(())
	}
}

/// Two-stage fine-tuning of an ImageNet EfficientNet-B0 on `root/<dataset>/{train,val}`.
///
/// `precision` picks where the forward and backward passes run for the downloaded model.
/// Setting `interrupt` stops between batches after saving `checkpoint_thfood50.mpk`.
pub fn run<B, P, F>(config: &TrainingConfig, device: B::Device, interrupt: Arc<AtomicBool>, precision: F) -> Result<TrainingSummary>
where
	B: AutodiffBackend,
	P: Precision<B>,
	F: FnOnce(&EfficientNet<B>) -> P,
{
	let weights_device = device.clone();
	let pretrained = move |classes: usize| -> Result<EfficientNet<B>> {
		Ok(EfficientNet::efficientnet_b0_pretrained(EfficientNetB0::ImageNet1kV1, classes, &weights_device)?)
	};

	run_with_model(config, device, interrupt, pretrained, precision)
}

/// [`run`] with the starting model built by `model` from the number of classes.
pub fn run_with_model<B, P, M, F>(
	config: &TrainingConfig,
	device: B::Device,
	interrupt: Arc<AtomicBool>,
	model: M,
	precision: F,
) -> Result<TrainingSummary>
where
	B: AutodiffBackend,
	P: Precision<B>,
	M: FnOnce(usize) -> Result<EfficientNet<B>>,
	F: FnOnce(&EfficientNet<B>) -> P,
{
	B::seed(config.seed);

	let root = config.root_dir();
	fs::create_dir_all(&root)?;
	config.save(root.join(CONFIG_FILE_NAME))?;

	let train_set = FoodDataset::scan(config.train_dir())?;
	let classes = train_set.classes().to_vec();
	if classes.len() != config.expected_classes {
		log::warn!("Found {} class folders, expected {}", classes.len(), config.expected_classes);
	}
	let val_set = FoodDataset::scan_with_classes(config.val_dir(), &classes)?;
	println!(
		"Train: {} images | Val: {} images | {} classes",
		train_set.len(),
		val_set.len(),
		classes.len()
	);
	let train_items = train_set.len();

	let model = model(classes.len())?;
	// nothing trained yet, nothing worth saving
	if interrupt.load(Ordering::SeqCst) {
		return Err(FoodError::Interrupted);
	}
	let precision = precision(&model);

	let train_loader = DataLoaderBuilder::new(FoodBatcher::<P::Compute>::training(device.clone(), config.seed))
		.batch_size(config.batch_size_train)
		.shuffle(config.seed)
		.num_workers(config.num_workers)
		.build(train_set);
	let val_loader = DataLoaderBuilder::new(FoodBatcher::<B::InnerBackend>::validation(device.clone()))
		.batch_size(config.batch_size_val)
		.num_workers(config.num_workers)
		.build(val_set);

	let loss = CrossEntropyLossConfig::new().with_smoothing(Some(config.label_smoothing));

	let mut session = Session {
		model,
		precision,
		classes,
		root,
		train_loader,
		val_loader,
		train_items,
		train_loss: loss.init(&device),
		val_loss: loss.init(&device),
		interrupt,
	};

	match run_stages(&mut session, config) {
		Err(FoodError::Interrupted) => {
			save_interrupted(session.precision.settle(&session.model), &session.root)?;
			println!("Saved {INTERRUPTED_STEM} (interrupted)");
			Err(FoodError::Interrupted)
		}
		other => other,
	}
}

fn run_stages<B, P>(session: &mut Session<B, P>, config: &TrainingConfig) -> Result<TrainingSummary>
where
	B: AutodiffBackend,
	P: Precision<B>,
{
	let mut best = BestAccuracy::default();
	let optimizer = AdamWConfig::new().with_weight_decay(config.weight_decay);

	// Stage 1: every feature layer frozen
	let layers = session.model.layer_names();
	session.freeze_features_until(FreezePolicy::all().boundary(layers.len()));
	let stage1 = drive_stage(
		&mut StageRun {
			session: &mut *session,
			optimizer: optimizer.init::<B, EfficientNet<B>>(),
		},
		&config.stage1_plan(),
		&mut best,
	)?;

	// Stage 2: leading layers stay frozen, fresh optimizer over the rest
	let (frozen, trainable) = FreezePolicy::new(config.frozen_fraction).split(&layers);
	log::info!("Frozen: [{}] trainable: [{}] + classifier", frozen.join(", "), trainable.join(", "));
	session.freeze_features_until(frozen.len());
	let stage2 = drive_stage(
		&mut StageRun {
			session: &mut *session,
			optimizer: optimizer.init::<B, EfficientNet<B>>(),
		},
		&config.stage2_plan(),
		&mut best,
	)?;

	println!("DONE. Best val_acc={:.4}", best.get());

	Ok(TrainingSummary {
		best_accuracy: best.get(),
		classes: session.classes.clone(),
		stage1,
		stage2,
	})
}

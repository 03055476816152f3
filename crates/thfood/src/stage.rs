use crate::error::Result;
use crate::schedule::{BestAccuracy, EarlyStopping, PlateauConfig};

/// One fine-tuning stage.
#[derive(Debug, Clone)]
pub struct StagePlan {
	pub name: &'static str,
	pub epochs: usize,
	pub learning_rate: f64,
	pub early_stop_patience: Option<usize>,
	pub plateau: PlateauConfig,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochMetrics {
	pub train_accuracy: f64,
	pub val_accuracy: f64,
	pub val_loss: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageReport {
	pub epochs: usize,
	pub commits: usize,
	pub stopped_early: bool,
}

/// The model-facing side of a stage, driven once per epoch.
pub trait StageHooks {
	/// One pass over the training data then one over the validation data at `lr`.
	fn run_epoch(&mut self, plan: &StagePlan, epoch: usize, lr: f64) -> Result<EpochMetrics>;

	/// Persists the current weights as the new best.
	fn commit_best(&mut self, metrics: &EpochMetrics) -> Result<()>;
}

/// Runs `plan` with a fresh plateau scheduler, committing on every strict improvement of `best`.
pub fn drive_stage<H: StageHooks>(hooks: &mut H, plan: &StagePlan, best: &mut BestAccuracy) -> Result<StageReport> {
	let mut scheduler = plan.plateau.init(plan.learning_rate);
	let mut early_stopping = plan.early_stop_patience.map(EarlyStopping::new);
	let mut report = StageReport {
		epochs: 0,
		commits: 0,
		stopped_early: false,
	};

	for epoch in 1..=plan.epochs {
		let lr = scheduler.lr();
		let metrics = hooks.run_epoch(plan, epoch, lr)?;
		report.epochs = epoch;
		scheduler.step(metrics.val_accuracy);

		println!(
			"[{} {epoch}] train_acc={:.4} | val_acc={:.4} | val_loss={:.4} | lr={lr:.1e}",
			plan.name, metrics.train_accuracy, metrics.val_accuracy, metrics.val_loss
		);

		let improved = best.update(metrics.val_accuracy);
		if improved {
			hooks.commit_best(&metrics)?;
			report.commits += 1;
		}

		if let Some(early_stopping) = early_stopping.as_mut() {
			if early_stopping.update(improved) {
				println!("Early stop after {epoch} epochs");
				report.stopped_early = true;
				break;
			}
		}
	}

	Ok(report)
}

use burn::config::Config;

#[derive(Config, Debug)]
pub struct PlateauConfig {
	#[config(default = 0.5)]
	pub factor: f64,
	#[config(default = 3)]
	pub patience: usize,
	#[config(default = 1e-6)]
	pub min_lr: f64,
}

impl PlateauConfig {
	pub fn init(&self, lr: f64) -> PlateauScheduler {
		PlateauScheduler {
			lr,
			factor: self.factor,
			patience: self.patience,
			min_lr: self.min_lr,
			best: None,
			bad_epochs: 0,
		}
	}
}

/// Reduces the learning rate when a maximised metric stops improving.
#[derive(Debug, Clone)]
pub struct PlateauScheduler {
	lr: f64,
	factor: f64,
	patience: usize,
	min_lr: f64,
	best: Option<f64>,
	bad_epochs: usize,
}

impl PlateauScheduler {
	pub fn lr(&self) -> f64 {
		self.lr
	}

	/// Records one epoch's metric and returns the learning rate for the next epoch.
	pub fn step(&mut self, metric: f64) -> f64 {
		if self.best.map_or(true, |best| metric > best) {
			self.best = Some(metric);
			self.bad_epochs = 0;
			return self.lr;
		}

		self.bad_epochs += 1;
		if self.bad_epochs >= self.patience {
			let reduced = (self.lr * self.factor).max(self.min_lr);
			if reduced < self.lr {
				log::info!("Reducing learning rate to {reduced:.1e}");
			}
			self.lr = reduced;
			self.bad_epochs = 0;
		}

		self.lr
	}
}

/// Stops once `patience` consecutive epochs did not improve.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
	patience: usize,
	wait: usize,
}

impl EarlyStopping {
	pub fn new(patience: usize) -> Self {
		Self { patience, wait: 0 }
	}

	/// Returns true when training should stop. Never on an improving epoch.
	pub fn update(&mut self, improved: bool) -> bool {
		if improved {
			self.wait = 0;
			return false;
		}

		self.wait += 1;
		self.wait >= self.patience
	}
}

/// Best validation accuracy seen so far, across stages.
#[derive(Debug, Clone, Copy, Default)]
pub struct BestAccuracy(Option<f64>);

impl BestAccuracy {
	pub fn get(&self) -> f64 {
		self.0.unwrap_or(0.0)
	}

	/// True only on strict improvement.
	pub fn update(&mut self, accuracy: f64) -> bool {
		let improved = self.0.map_or(true, |best| accuracy > best);
		if improved {
			self.0 = Some(accuracy);
		}
		improved
	}
}

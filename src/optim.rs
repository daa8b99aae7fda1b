use burn::{
    config::Config,
    module::AutodiffModule,
    optim::{AdamWConfig, GradientsParams, Optimizer},
    tensor::backend::AutodiffBackend,
};
use tracing::debug;

/// Smallest change of learning rate that counts as a reduction.
const REDUCTION_EPSILON: f64 = 1e-8;

#[derive(Config, Debug)]
pub struct PlateauConfig {
    #[config(default = 0.5)]
    pub factor: f64,

    /// Non-improving observations tolerated before a reduction.
    #[config(default = 5)]
    pub patience: usize,

    /// Relative margin by which a loss must beat the best to count as better.
    #[config(default = 1.0e-4)]
    pub threshold: f64,

    #[config(default = 0.0)]
    pub min_learning_rate: f64,
}

/// Halves (by default) the learning rate when the monitored loss stops
/// decreasing.
#[derive(Debug, Clone)]
pub struct PlateauScheduler {
    config: PlateauConfig,
    learning_rate: f64,
    best: f64,
    bad_observations: usize,
}

impl PlateauScheduler {
    pub fn new(config: PlateauConfig, learning_rate: f64) -> Self {
        Self {
            config,
            learning_rate,
            best: f64::INFINITY,
            bad_observations: 0,
        }
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    /// Returns the new learning rate when this observation triggered a
    /// reduction.
    pub fn observe(&mut self, loss: f64) -> Option<f64> {
        if loss < self.best * (1.0 - self.config.threshold) {
            self.best = loss;
            self.bad_observations = 0;
            return None;
        }

        self.bad_observations += 1;
        if self.bad_observations <= self.config.patience {
            return None;
        }
        self.bad_observations = 0;

        let reduced = (self.learning_rate * self.config.factor).max(self.config.min_learning_rate);
        if self.learning_rate - reduced <= REDUCTION_EPSILON {
            return None;
        }

        debug!(from = self.learning_rate, to = reduced, "plateau reached");
        self.learning_rate = reduced;
        Some(reduced)
    }
}

/// An optimizer paired with the scheduler that sets its learning rate.
pub struct OptimizationPolicy<O> {
    optimizer: O,
    scheduler: PlateauScheduler,
}

impl<O> OptimizationPolicy<O> {
    pub fn new(optimizer: O, scheduler: PlateauScheduler) -> Self {
        Self {
            optimizer,
            scheduler,
        }
    }

    /// Applies `grads` at the current learning rate. Frozen parameters carry
    /// no gradient and are left untouched.
    pub fn step<B, M>(&mut self, model: M, grads: GradientsParams) -> M
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        self.optimizer
            .step(self.scheduler.learning_rate(), model, grads)
    }

    pub fn observe(&mut self, valid_loss: f64) -> Option<f64> {
        self.scheduler.observe(valid_loss)
    }

    pub fn learning_rate(&self) -> f64 {
        self.scheduler.learning_rate()
    }
}

/// AdamW with decoupled weight decay, scheduled on plateaus.
pub fn adamw<B, M>(
    optimizer: &AdamWConfig,
    plateau: &PlateauConfig,
    learning_rate: f64,
) -> OptimizationPolicy<impl Optimizer<M, B>>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    OptimizationPolicy::new(
        optimizer.init::<B, M>(),
        PlateauScheduler::new(plateau.clone(), learning_rate),
    )
}

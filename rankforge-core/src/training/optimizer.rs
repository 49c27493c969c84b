//! Optimizers and learning-rate schedules.
//!
//! Moment state is keyed by parameter name. When a buffer changes shape
//! (rank adjustment), its moments are dropped and rebuilt from zero.
//!
//! Adam with L2:  θ ← θ - lr · m̂ / (√v̂ + ε), with g ← g + λθ
//! AdamW:         θ ← (1 - lr·λ) θ - lr · m̂ / (√v̂ + ε)

use crate::error::EngineError;
use crate::training::session::{ModelConfiguration, OptimizerKind, SchedulerKind};
use ndarray::{Array, Dimension};
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct Moments {
    m: Vec<f32>,
    v: Vec<f32>,
    t: i32,
}

impl Moments {
    fn zeros(len: usize) -> Self {
        Self {
            m: vec![0.0; len],
            v: vec![0.0; len],
            t: 0,
        }
    }
}

/// Optimizer over named parameter buffers.
#[derive(Debug, Clone)]
pub struct Optimizer {
    kind: OptimizerKind,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    weight_decay: f32,
    moments: HashMap<String, Moments>,
}

impl Optimizer {
    pub fn new(kind: OptimizerKind, weight_decay: f32) -> Self {
        Self {
            kind,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay,
            moments: HashMap::new(),
        }
    }

    pub fn from_config(config: &ModelConfiguration) -> Self {
        Self::new(config.optimizer, config.weight_decay)
    }

    pub fn kind(&self) -> OptimizerKind {
        self.kind
    }

    /// Number of parameters with live moment state.
    pub fn tracked_parameters(&self) -> usize {
        self.moments.len()
    }

    /// Drop moment state for a parameter.
    pub fn forget(&mut self, name: &str) {
        self.moments.remove(name);
    }

    /// Apply one update to `param` in place.
    pub fn update<D: Dimension>(
        &mut self,
        name: &str,
        param: &mut Array<f32, D>,
        grad: &Array<f32, D>,
        lr: f32,
    ) -> Result<(), EngineError> {
        if param.shape() != grad.shape() {
            return Err(EngineError::training(format!(
                "gradient shape {:?} does not match parameter '{name}' shape {:?}",
                grad.shape(),
                param.shape()
            )));
        }
        let wd = self.weight_decay;
        match self.kind {
            OptimizerKind::Sgd => {
                param.zip_mut_with(grad, |p, &g| *p -= lr * (g + wd * *p));
            }
            OptimizerKind::Adam | OptimizerKind::AdamW => {
                let len = param.len();
                let state = self
                    .moments
                    .entry(name.to_string())
                    .or_insert_with(|| Moments::zeros(len));
                if state.m.len() != len {
                    *state = Moments::zeros(len);
                }
                state.t += 1;
                let bc1 = 1.0 - self.beta1.powi(state.t);
                let bc2 = 1.0 - self.beta2.powi(state.t);
                let decoupled = self.kind == OptimizerKind::AdamW;
                for (i, (p, &g)) in param.iter_mut().zip(grad.iter()).enumerate() {
                    let g = if decoupled { g } else { g + wd * *p };
                    state.m[i] = self.beta1 * state.m[i] + (1.0 - self.beta1) * g;
                    state.v[i] = self.beta2 * state.v[i] + (1.0 - self.beta2) * g * g;
                    let m_hat = state.m[i] / bc1;
                    let v_hat = state.v[i] / bc2;
                    if decoupled {
                        *p *= 1.0 - lr * wd;
                    }
                    *p -= lr * m_hat / (v_hat.sqrt() + self.epsilon);
                }
            }
        }
        Ok(())
    }
}

/// Warm-up followed by a decay schedule.
#[derive(Debug, Clone)]
pub struct LrScheduler {
    kind: SchedulerKind,
    base_lr: f32,
    warmup_steps: usize,
    total_steps: usize,
    steps_per_epoch: usize,
}

impl LrScheduler {
    pub fn new(
        kind: SchedulerKind,
        base_lr: f32,
        warmup_steps: usize,
        total_steps: usize,
        steps_per_epoch: usize,
    ) -> Self {
        Self {
            kind,
            base_lr,
            warmup_steps,
            total_steps,
            steps_per_epoch: steps_per_epoch.max(1),
        }
    }

    pub fn from_config(config: &ModelConfiguration, total_steps: usize, steps_per_epoch: usize) -> Self {
        Self::new(
            config.scheduler,
            config.learning_rate,
            config.warmup_steps,
            total_steps,
            steps_per_epoch,
        )
    }

    /// Learning rate for a zero-based step.
    pub fn lr_at(&self, step: usize) -> f32 {
        if step < self.warmup_steps {
            return self.base_lr * (step + 1) as f32 / self.warmup_steps as f32;
        }
        let span = self.total_steps.saturating_sub(self.warmup_steps).max(1);
        let p = ((step - self.warmup_steps) as f32 / span as f32).clamp(0.0, 1.0);
        match self.kind {
            SchedulerKind::Cosine => self.base_lr * 0.5 * (1.0 + (std::f32::consts::PI * p).cos()),
            SchedulerKind::Linear => self.base_lr * (1.0 - p),
            SchedulerKind::Exponential => {
                let epochs = step as f32 / self.steps_per_epoch as f32;
                self.base_lr * 0.95_f32.powf(epochs)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, array};

    #[test]
    fn test_sgd_step() {
        let mut opt = Optimizer::new(OptimizerKind::Sgd, 0.0);
        let mut p = array![1.0_f32, -1.0];
        opt.update("w", &mut p, &array![0.5, -0.5], 0.1).unwrap();
        assert!((p[0] - 0.95).abs() < 1e-6);
        assert!((p[1] + 0.95).abs() < 1e-6);
        assert_eq!(opt.tracked_parameters(), 0);
    }

    #[test]
    fn test_adam_first_step_moves_by_lr() {
        let mut opt = Optimizer::new(OptimizerKind::Adam, 0.0);
        let mut p = array![0.0_f32, 0.0];
        opt.update("w", &mut p, &array![2.0, -3.0], 0.01).unwrap();
        assert!((p[0] + 0.01).abs() < 1e-4);
        assert!((p[1] - 0.01).abs() < 1e-4);
    }

    #[test]
    fn test_adamw_decoupled_decay() {
        let mut opt = Optimizer::new(OptimizerKind::AdamW, 0.5);
        let mut p = array![1.0_f32];
        opt.update("w", &mut p, &array![0.0], 0.1).unwrap();
        assert!((p[0] - 0.95).abs() < 1e-6);
    }

    #[test]
    fn test_shape_change_resets_moments() {
        let mut opt = Optimizer::new(OptimizerKind::Adam, 0.0);
        let mut small = Array1::<f32>::zeros(2);
        opt.update("dir", &mut small, &Array1::ones(2), 0.01).unwrap();
        let mut large = Array1::<f32>::zeros(4);
        opt.update("dir", &mut large, &Array1::ones(4), 0.01).unwrap();
        assert!(large.iter().all(|v| (v + 0.01).abs() < 1e-4));
        assert!(opt.update("dir", &mut large, &Array1::ones(3), 0.01).is_err());
    }

    #[test]
    fn test_schedules() {
        let warm = LrScheduler::new(SchedulerKind::Linear, 1.0, 4, 14, 7);
        assert!((warm.lr_at(0) - 0.25).abs() < 1e-6);
        assert!((warm.lr_at(3) - 1.0).abs() < 1e-6);
        assert!((warm.lr_at(9) - 0.5).abs() < 1e-6);

        let cosine = LrScheduler::new(SchedulerKind::Cosine, 1.0, 0, 10, 5);
        assert!((cosine.lr_at(0) - 1.0).abs() < 1e-6);
        assert!((cosine.lr_at(5) - 0.5).abs() < 1e-6);

        let exp = LrScheduler::new(SchedulerKind::Exponential, 1.0, 0, 20, 10);
        assert!((exp.lr_at(10) - 0.95).abs() < 1e-6);
    }
}

//! Gradient descent over the relaxation slopes.
//!
//! Each epoch forwards the whole transformer chain from the input box, checks
//! the margins, and otherwise takes one SGD step on every adaptive slope.
//! [`LossMonitor`] implements the two plateau heuristics: early stopping and
//! learning-rate halving.

use crate::gradient::slope_gradients;
use crate::polygon::PolygonBound;
use crate::transformers::{RelaxationMode, Transformer};
use crate::types::StoppingConfig;
use deeppoly_core::{PolyError, Result};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, info};

/// Settings of the slope optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Initial SGD step size.
    pub learning_rate: f32,
    /// Floor for learning-rate halving.
    pub min_learning_rate: f32,
    /// How crossing neurons pick their lower line.
    pub relaxation: RelaxationMode,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 5.0,
            min_learning_rate: 1e-4,
            relaxation: RelaxationMode::Adaptive,
        }
    }
}

impl OptimizerConfig {
    /// Tie-break relaxation only; nothing is trained.
    pub fn fixed() -> Self {
        Self {
            relaxation: RelaxationMode::Fixed,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("learning_rate", self.learning_rate),
            ("min_learning_rate", self.min_learning_rate),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(PolyError::InvalidConfig(format!(
                    "{name} must be finite and > 0 (got {value})"
                )));
            }
        }
        Ok(())
    }
}

/// What the monitor wants done after observing one loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MonitorDecision {
    pub halve_learning_rate: bool,
    pub stop: bool,
}

/// Sliding windows of "loss did not improve" flags.
#[derive(Debug, Clone)]
pub struct LossMonitor {
    early_stopping: Option<usize>,
    lr_scheduling: Option<usize>,
    previous: Option<f32>,
    early_window: VecDeque<bool>,
    lr_window: VecDeque<bool>,
}

impl LossMonitor {
    pub fn new(stopping: &StoppingConfig) -> Self {
        let capacity = |threshold: Option<usize>| VecDeque::with_capacity(2 * threshold.unwrap_or(0));
        Self {
            early_stopping: stopping.early_stopping,
            lr_scheduling: stopping.lr_scheduling,
            previous: None,
            early_window: capacity(stopping.early_stopping),
            lr_window: capacity(stopping.lr_scheduling),
        }
    }

    /// Record the loss of the current epoch.
    ///
    /// A threshold `k` fires when at least `k` of the last `2k` flags are set
    /// and the current one is among them. The first loss never counts as
    /// non-improving.
    pub fn observe(&mut self, loss: f32) -> MonitorDecision {
        let not_improved = self.previous.is_some_and(|previous| loss >= previous);
        self.previous = Some(loss);

        let fires = |window: &mut VecDeque<bool>, threshold: Option<usize>| {
            let Some(k) = threshold else {
                return false;
            };
            if window.len() == 2 * k {
                window.pop_front();
            }
            window.push_back(not_improved);
            not_improved && window.iter().filter(|&&flag| flag).count() >= k
        };

        MonitorDecision {
            halve_learning_rate: fires(&mut self.lr_window, self.lr_scheduling),
            stop: fires(&mut self.early_window, self.early_stopping),
        }
    }
}

/// Sum of `|l|` over margins whose lower bound `l` is not positive.
pub fn margin_loss(lower: &Array1<f32>) -> f32 {
    lower.iter().map(|&l| (-l).max(0.0)).sum()
}

/// d(margin_loss)/d(lower).
pub fn loss_seed(lower: &Array1<f32>) -> Array1<f32> {
    lower.mapv(|l| if l < 0.0 { -1.0 } else { 0.0 })
}

/// Forward every transformer of `chain` starting from `input`.
pub fn forward_chain(chain: &[Transformer], input: &PolygonBound) -> Result<PolygonBound> {
    chain
        .iter()
        .enumerate()
        .try_fold(input.clone(), |polygon, (i, transformer)| {
            transformer
                .forward(polygon)
                .map_err(|e| e.in_layer(i, transformer.name()))
        })
}

/// Number of slopes the optimizer may move in the pass that produced `output`.
fn count_trainable(chain: &[Transformer], output: &PolygonBound) -> usize {
    let mut nodes: Vec<&PolygonBound> = output.ancestors().collect();
    nodes.reverse();
    let mut node = 0;
    let mut count = 0;
    for transformer in chain {
        match transformer {
            Transformer::Flatten => {}
            Transformer::Linear(_) => node += 1,
            Transformer::LeakyRelu(relu) => {
                if let Some(input) = nodes.get(node) {
                    count += relu.num_trainable(input);
                }
                node += 1;
            }
        }
    }
    count
}

/// Why the optimization loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    Verified,
    NothingToTrain,
    EarlyStopping,
    MaxEpochs,
}

/// Result of [`OptimizationDriver::run`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainingOutcome {
    pub verified: bool,
    /// Forward passes evaluated (1-based).
    pub epochs: usize,
    pub reason: StopReason,
    /// Learning rate in effect when the loop ended.
    pub learning_rate: f32,
}

/// Runs the slope optimization over one transformer chain.
#[derive(Debug, Clone)]
pub struct OptimizationDriver {
    config: OptimizerConfig,
    stopping: StoppingConfig,
}

impl OptimizationDriver {
    pub fn new(config: OptimizerConfig, stopping: StoppingConfig) -> Result<Self> {
        config.validate()?;
        stopping.validate()?;
        Ok(Self { config, stopping })
    }

    /// Optimize the slopes of `chain` in place until the margins are proven
    /// positive or a stopping criterion fires.
    pub fn run(&self, chain: &mut [Transformer], input: &PolygonBound) -> Result<TrainingOutcome> {
        let mut learning_rate = self.config.learning_rate;
        let mut monitor = LossMonitor::new(&self.stopping);
        let mut epoch = 1;

        loop {
            if let Some(max_epochs) = self.stopping.max_epochs {
                if epoch > max_epochs {
                    debug!("Reached the epoch cap ({max_epochs})");
                    return Ok(TrainingOutcome {
                        verified: false,
                        epochs: max_epochs,
                        reason: StopReason::MaxEpochs,
                        learning_rate,
                    });
                }
            }

            let output = forward_chain(chain, input)?;
            let outcome = |verified, reason, learning_rate| TrainingOutcome {
                verified,
                epochs: epoch,
                reason,
                learning_rate,
            };

            if output.lower().iter().all(|&l| l > 0.0) {
                debug!("All margins positive after {epoch} epochs");
                return Ok(outcome(true, StopReason::Verified, learning_rate));
            }
            if count_trainable(chain, &output) == 0 {
                debug!("No trainable slopes; giving up");
                return Ok(outcome(false, StopReason::NothingToTrain, learning_rate));
            }

            let loss = margin_loss(output.lower());
            info!("Epoch {epoch:4}: lr = {learning_rate:.2}, loss = {loss:.2}");

            let decision = monitor.observe(loss);
            if decision.halve_learning_rate {
                learning_rate = (learning_rate / 2.0).max(self.config.min_learning_rate);
                debug!("Loss plateaued, learning rate now {learning_rate}");
            }
            if decision.stop {
                debug!("Early stopping at epoch {epoch}");
                return Ok(outcome(false, StopReason::EarlyStopping, learning_rate));
            }

            let seed = loss_seed(output.lower());
            let gradients = slope_gradients(chain, &output, &seed)?;
            for (transformer, gradient) in chain.iter_mut().zip(gradients) {
                if let (Transformer::LeakyRelu(relu), Some(gradient)) = (transformer, gradient) {
                    relu.step(&gradient, learning_rate);
                }
            }

            epoch += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    fn monitor(early_stopping: Option<usize>, lr_scheduling: Option<usize>) -> LossMonitor {
        LossMonitor::new(&StoppingConfig {
            max_epochs: None,
            early_stopping,
            lr_scheduling,
        })
    }

    #[test]
    fn test_loss_ignores_positive_margins() {
        assert_eq!(margin_loss(&arr1(&[1.0, -2.0, 0.0, -0.5])), 2.5);
        assert_eq!(loss_seed(&arr1(&[1.0, -2.0, 0.0])), arr1(&[0.0, -1.0, 0.0]));
    }

    #[test]
    fn test_early_stopping_on_rising_loss() {
        let mut m = monitor(Some(3), None);
        let stops: Vec<bool> = [1.0, 2.0, 3.0, 4.0].iter().map(|&l| m.observe(l).stop).collect();
        assert_eq!(stops, vec![false, false, false, true]);
    }

    #[test]
    fn test_early_stopping_requires_latest_flag() {
        // Flags: f, t, t, f. Two set, but the latest improved.
        let mut m = monitor(Some(2), None);
        let stops: Vec<bool> = [3.0, 3.0, 4.0, 1.0].iter().map(|&l| m.observe(l).stop).collect();
        assert_eq!(stops, vec![false, false, true, false]);
        let mut m = monitor(Some(3), None);
        let stops: Vec<bool> = [3.0, 3.0, 4.0, 1.0, 2.0].iter().map(|&l| m.observe(l).stop).collect();
        assert_eq!(stops, vec![false, false, false, false, true]);
    }

    #[test]
    fn test_window_forgets_old_flags() {
        // k = 2, window of 4: the early flags fall out before the next rise.
        let mut m = monitor(Some(2), None);
        let losses = [5.0, 6.0, 4.0, 3.0, 2.0, 1.0, 1.5];
        let stops: Vec<bool> = losses.iter().map(|&l| m.observe(l).stop).collect();
        assert!(stops.iter().all(|&s| !s));
    }

    #[test]
    fn test_lr_scheduling_threshold() {
        let mut m = monitor(None, Some(2));
        let halvings: Vec<bool> = [5.0, 4.0, 4.0, 3.0, 3.0]
            .iter()
            .map(|&l| m.observe(l).halve_learning_rate)
            .collect();
        assert_eq!(halvings, vec![false, false, false, false, true]);
    }

    #[test]
    fn test_monitor_without_thresholds_never_fires() {
        let mut m = monitor(None, None);
        for loss in [1.0, 2.0, 3.0] {
            assert_eq!(m.observe(loss), MonitorDecision::default());
        }
    }

    #[test]
    fn test_optimizer_config_validation() {
        assert!(OptimizerConfig::default().validate().is_ok());
        for lr in [0.0, -1.0, f32::NAN, f32::INFINITY] {
            let config = OptimizerConfig {
                learning_rate: lr,
                ..OptimizerConfig::default()
            };
            assert!(matches!(config.validate(), Err(PolyError::InvalidConfig(_))));
        }
        let config = OptimizerConfig {
            min_learning_rate: 0.0,
            ..OptimizerConfig::default()
        };
        assert!(config.validate().is_err());
        assert_eq!(OptimizerConfig::fixed().relaxation, RelaxationMode::Fixed);
    }

    #[test]
    fn test_driver_rejects_degenerate_stopping() {
        let err = OptimizationDriver::new(OptimizerConfig::default(), StoppingConfig::default())
            .unwrap_err();
        assert!(matches!(err, PolyError::InvalidConfig(_)));
    }
}

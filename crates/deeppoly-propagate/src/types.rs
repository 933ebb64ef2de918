//! Configuration and result types for verification.

use crate::optimizer::OptimizerConfig;
use deeppoly_core::{PolyError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// When the optimization loop gives up.
///
/// All thresholds are counts of non-improving epochs within a sliding window
/// of twice their size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StoppingConfig {
    /// Hard cap on the number of forward passes.
    pub max_epochs: Option<usize>,
    /// Stop once this many of the last 2k epochs did not improve the loss.
    pub early_stopping: Option<usize>,
    /// Halve the learning rate once this many of the last 2m epochs did not
    /// improve the loss.
    pub lr_scheduling: Option<usize>,
}

impl StoppingConfig {
    /// Stop after at most `max_epochs` forward passes.
    pub fn with_max_epochs(max_epochs: usize) -> Self {
        Self {
            max_epochs: Some(max_epochs),
            ..Self::default()
        }
    }

    /// Reject configurations that are degenerate or leave the loop unbounded
    /// by every criterion.
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("max_epochs", self.max_epochs),
            ("early_stopping", self.early_stopping),
            ("lr_scheduling", self.lr_scheduling),
        ];
        if let Some((name, _)) = fields.iter().find(|(_, value)| *value == Some(0)) {
            return Err(PolyError::InvalidConfig(format!("{name} must be > 0")));
        }
        if fields.iter().all(|(_, value)| value.is_none()) {
            return Err(PolyError::InvalidConfig(
                "no stopping criterion: set max_epochs, early_stopping or lr_scheduling"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// Settings of a [`crate::Verifier`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerifierConfig {
    pub stopping: StoppingConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
}

impl VerifierConfig {
    pub fn validate(&self) -> Result<()> {
        self.stopping.validate()?;
        self.optimizer.validate()
    }
}

/// Verdict of one verification call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationOutcome {
    /// Every margin lower bound was strictly positive.
    pub verified: bool,
    /// Forward passes evaluated (1-based).
    pub epochs: usize,
    /// Wall-clock time including chain construction.
    pub elapsed: Duration,
}

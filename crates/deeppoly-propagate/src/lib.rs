//! DeepPoly bound propagation with optimized relaxation slopes.
//!
//! A network is turned into a chain of abstract transformers ending in a
//! margin layer (true logit minus every other logit). Each transformer maps a
//! [`PolygonBound`] to the next one, which is concretized by back-substitution
//! to the input box. Robustness holds when every margin's lower bound is
//! positive; if it is not, the lower slopes of crossing ReLU neurons are
//! optimized by gradient descent until it is or a stopping criterion fires.
//!
//! # Example
//!
//! ```
//! use deeppoly_core::LayerSpec;
//! use deeppoly_propagate::{verify, StoppingConfig};
//! use ndarray::{arr1, arr2, ArrayD};
//!
//! let layers = vec![LayerSpec::Linear {
//!     weight: arr2(&[[1.0, 1.0], [-1.0, 0.0]]),
//!     bias: Some(arr1(&[0.0, 0.0])),
//! }];
//! let center = ArrayD::from_shape_vec(vec![2], vec![0.5, 0.5]).unwrap();
//! let outcome = verify(&layers, &center, 0, 0.1, StoppingConfig::with_max_epochs(10)).unwrap();
//! assert!(outcome.verified);
//! ```

pub mod conv;
pub mod gradient;
pub mod optimizer;
pub mod pipeline;
pub mod polygon;
pub mod transformers;
pub mod types;

pub use conv::Conv2dLayer;
pub use optimizer::{
    forward_chain, margin_loss, LossMonitor, MonitorDecision, OptimizationDriver,
    OptimizerConfig, StopReason, TrainingOutcome,
};
pub use pipeline::{build_chain, margin_layer, predict, verify, Verifier};
pub use polygon::{BoundSide, PolygonBound};
pub use transformers::{
    CrossingVariant, LeakyReluTransformer, LinearTransformer, RelaxationMode, ReluCase,
    ReluRelaxation, Transformer,
};
pub use types::{StoppingConfig, VerificationOutcome, VerifierConfig};

pub use deeppoly_core::{Bound, LayerSpec, PolyError, Result, VerificationSpec};

#[cfg(test)]
mod tests;

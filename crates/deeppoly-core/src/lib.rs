//! Core types for DeepPoly robustness certification.
//!
//! This crate provides the value types shared by the propagation engine and
//! its collaborators: scalar [`Bound`]s, the [`VerificationSpec`] describing a
//! robustness query, the [`LayerSpec`] network description handed over by a
//! model loader, and the [`PolyError`] error type.

use ndarray::{Array1, Array2, Array4, ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A bound on a scalar value: [lower, upper].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    pub lower: f32,
    pub upper: f32,
}

impl Bound {
    /// Create a new bound.
    #[inline]
    pub fn new(lower: f32, upper: f32) -> Self {
        debug_assert!(lower <= upper, "Invalid bound: {lower} > {upper}");
        Self { lower, upper }
    }

    /// Check if the interval straddles zero (strictly on both sides).
    #[inline]
    pub fn is_crossing(&self) -> bool {
        self.lower < 0.0 && 0.0 < self.upper
    }

    /// Check if both ends are finite and ordered.
    #[inline]
    pub fn is_sound(&self) -> bool {
        self.lower.is_finite() && self.upper.is_finite() && self.lower <= self.upper
    }
}

/// A local robustness query: is `label` predicted for every input within
/// `epsilon` (L∞) of `input`?
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationSpec {
    /// Index of the class the network must keep predicting.
    pub label: usize,
    /// Center input values, row-major.
    pub input: Vec<f32>,
    /// Shape of the input, e.g. `[1, 28, 28]`. Empty means flat.
    #[serde(default)]
    pub input_shape: Vec<usize>,
    /// Perturbation radius.
    pub epsilon: f32,
}

impl VerificationSpec {
    /// The center input reshaped to `input_shape`.
    pub fn center(&self) -> Result<ArrayD<f32>> {
        let shape = if self.input_shape.is_empty() {
            vec![self.input.len()]
        } else {
            self.input_shape.clone()
        };
        let total: usize = shape.iter().product();
        if total != self.input.len() {
            return Err(PolyError::InvalidSpec(format!(
                "Input shape {:?} has {} elements but input has {}",
                shape,
                total,
                self.input.len()
            )));
        }
        ArrayD::from_shape_vec(IxDyn(&shape), self.input.clone())
            .map_err(|e| PolyError::InvalidSpec(e.to_string()))
    }
}

/// Parameters of a 2-D convolution over a `(channels, height, width)` input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conv2dSpec {
    /// Kernel of shape (out_channels, in_channels, kernel_h, kernel_w).
    pub weight: Array4<f32>,
    /// Per-output-channel bias.
    pub bias: Option<Array1<f32>>,
    /// (stride_h, stride_w)
    pub stride: (usize, usize),
    /// (pad_h, pad_w), implicit zero padding.
    pub padding: (usize, usize),
}

impl Conv2dSpec {
    pub fn in_channels(&self) -> usize {
        self.weight.shape()[1]
    }

    pub fn out_channels(&self) -> usize {
        self.weight.shape()[0]
    }

    pub fn kernel_size(&self) -> (usize, usize) {
        (self.weight.shape()[2], self.weight.shape()[3])
    }
}

/// One layer of a feed-forward classifier, as produced by a model loader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerSpec {
    /// Reshape a spatial tensor into a flat vector.
    Flatten,
    /// y = W x + b, with W of shape (out_features, in_features).
    Linear {
        weight: Array2<f32>,
        bias: Option<Array1<f32>>,
    },
    /// 2-D convolution, lowered to a dense layer before propagation.
    Conv2d(Conv2dSpec),
    Relu,
    /// y = x if x >= 0, else negative_slope * x.
    LeakyRelu { negative_slope: f32 },
    /// A layer kind the loader saw but the verifier does not handle.
    Unsupported { kind: String },
}

impl LayerSpec {
    /// Human-readable layer kind, used in logs and errors.
    pub fn kind(&self) -> &str {
        match self {
            LayerSpec::Flatten => "Flatten",
            LayerSpec::Linear { .. } => "Linear",
            LayerSpec::Conv2d(_) => "Conv2d",
            LayerSpec::Relu => "ReLU",
            LayerSpec::LeakyRelu { .. } => "LeakyReLU",
            LayerSpec::Unsupported { kind } => kind,
        }
    }
}

/// Error types for DeepPoly operations.
#[derive(Error, Debug)]
pub enum PolyError {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },

    #[error("Unsupported layer type: {0}")]
    UnsupportedLayer(String),

    #[error("Invalid network: {0}")]
    InvalidNetwork(String),

    #[error("Invalid specification: {0}")]
    InvalidSpec(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A concretized interval is inverted or non-finite. This is never a
    /// verification verdict; it means the propagation itself went wrong.
    #[error("Unsound bound at neuron {neuron}: [{lower}, {upper}]")]
    UnsoundBound { neuron: usize, lower: f32, upper: f32 },

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Layer {layer_index} ({layer_type}) failed: {source}")]
    LayerError {
        layer_index: usize,
        layer_type: String,
        #[source]
        source: Box<PolyError>,
    },
}

impl PolyError {
    pub fn shape_mismatch(expected: Vec<usize>, got: Vec<usize>) -> Self {
        debug_assert!(
            expected != got,
            "BUG: ShapeMismatch with identical shapes {expected:?}"
        );
        PolyError::ShapeMismatch { expected, got }
    }

    /// Wrap an error with the position and kind of the layer that raised it.
    pub fn in_layer(self, layer_index: usize, layer_type: impl Into<String>) -> Self {
        PolyError::LayerError {
            layer_index,
            layer_type: layer_type.into(),
            source: Box::new(self),
        }
    }

    /// Unwrap any `LayerError` nesting down to the originating error.
    pub fn root_cause(&self) -> &PolyError {
        match self {
            PolyError::LayerError { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, PolyError>;

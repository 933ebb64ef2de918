//! Abstract transformers: map a [`PolygonBound`] through one network layer.
//!
//! Affine layers are propagated exactly. The (leaky) ReLU is relaxed per
//! neuron into a lower and an upper line; the lower line's slope can be a
//! trainable parameter optimized by the [`crate::optimizer`].

use crate::polygon::PolygonBound;
use deeppoly_core::{Bound, PolyError, Result};
use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// How crossing neurons choose their lower relaxation line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RelaxationMode {
    /// Minimal-area tie-break between the two fixed candidate lines.
    Fixed,
    /// Per-neuron lower slope α ∈ [s, 1], refined by gradient descent.
    #[default]
    Adaptive,
}

/// One transformer of the propagation chain.
#[derive(Debug, Clone)]
pub enum Transformer {
    /// Reshape of the concrete view only; the abstract value passes through.
    Flatten,
    Linear(LinearTransformer),
    LeakyRelu(LeakyReluTransformer),
}

impl Transformer {
    pub fn name(&self) -> &'static str {
        match self {
            Transformer::Flatten => "Flatten",
            Transformer::Linear(_) => "Linear",
            Transformer::LeakyRelu(t) if t.negative_slope() == 0.0 => "ReLU",
            Transformer::LeakyRelu(_) => "LeakyReLU",
        }
    }

    /// Whether `forward` creates a new polygon (Flatten does not).
    pub fn produces_polygon(&self) -> bool {
        !matches!(self, Transformer::Flatten)
    }

    pub fn forward(&self, input: PolygonBound) -> Result<PolygonBound> {
        match self {
            Transformer::Flatten => Ok(input),
            Transformer::Linear(t) => t.forward(input),
            Transformer::LeakyRelu(t) => t.forward(input),
        }
    }

    /// Concrete semantics of the layer on a single flat input.
    pub fn evaluate(&self, x: &Array1<f32>) -> Array1<f32> {
        match self {
            Transformer::Flatten => x.clone(),
            Transformer::Linear(t) => t.evaluate(x),
            Transformer::LeakyRelu(t) => t.evaluate(x),
        }
    }
}

/// Fully-connected layer `y = W x + b`.
#[derive(Debug, Clone)]
pub struct LinearTransformer {
    /// Shape (out_features, in_features).
    weight: Array2<f32>,
    /// Shape (out_features,).
    bias: Array1<f32>,
}

impl LinearTransformer {
    pub fn new(weight: Array2<f32>, bias: Option<Array1<f32>>) -> Result<Self> {
        let out_features = weight.nrows();
        let bias = bias.unwrap_or_else(|| Array1::zeros(out_features));
        if bias.len() != out_features {
            return Err(PolyError::shape_mismatch(vec![out_features], vec![bias.len()]));
        }
        if weight.iter().chain(bias.iter()).any(|v| !v.is_finite()) {
            return Err(PolyError::InvalidNetwork(
                "linear layer has non-finite parameters".to_string(),
            ));
        }
        Ok(Self { weight, bias })
    }

    pub fn in_features(&self) -> usize {
        self.weight.ncols()
    }

    pub fn out_features(&self) -> usize {
        self.weight.nrows()
    }

    pub fn weight(&self) -> &Array2<f32> {
        &self.weight
    }

    pub fn bias(&self) -> &Array1<f32> {
        &self.bias
    }

    /// Exact propagation: both inequalities are `W·x + b`.
    pub fn forward(&self, input: PolygonBound) -> Result<PolygonBound> {
        if input.len() != self.in_features() {
            return Err(PolyError::shape_mismatch(
                vec![self.in_features()],
                vec![input.len()],
            ));
        }
        let polygon = PolygonBound::new(
            self.weight.clone(),
            self.weight.clone(),
            self.bias.clone(),
            self.bias.clone(),
            Some(input),
        )?;
        debug!("Linear layer output:\n{polygon}");
        Ok(polygon)
    }

    pub fn evaluate(&self, x: &Array1<f32>) -> Array1<f32> {
        self.weight.dot(x) + &self.bias
    }
}

/// Stability of a neuron given its pre-activation interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReluCase {
    /// u ≤ 0: output is exactly s·x.
    AlwaysNegative,
    /// l ≥ 0: output is exactly x.
    AlwaysPositive,
    /// l < 0 < u: output must be relaxed.
    Crossing,
}

impl ReluCase {
    /// Classify an interval. `l = u = 0` counts as always-positive.
    pub fn classify(bound: Bound) -> Self {
        if bound.is_crossing() {
            ReluCase::Crossing
        } else if bound.lower >= 0.0 {
            ReluCase::AlwaysPositive
        } else {
            ReluCase::AlwaysNegative
        }
    }
}

/// The two fixed lower lines for a crossing neuron.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrossingVariant {
    /// Lower line y = s·x.
    NegativeSlope,
    /// Lower line y = x.
    Identity,
}

impl CrossingVariant {
    /// Minimal-area tie-break: `y = s·x` when `u ≤ -l`, else `y = x`.
    pub fn select(bound: Bound) -> Self {
        if bound.upper <= -bound.lower {
            CrossingVariant::NegativeSlope
        } else {
            CrossingVariant::Identity
        }
    }

    pub fn lower_slope(self, negative_slope: f32) -> f32 {
        match self {
            CrossingVariant::NegativeSlope => negative_slope,
            CrossingVariant::Identity => 1.0,
        }
    }
}

/// Per-neuron relaxation: `lower_slope·x ≤ y ≤ upper_slope·x + upper_bias`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReluRelaxation {
    pub case: ReluCase,
    pub lower_slope: f32,
    pub upper_slope: f32,
    pub upper_bias: f32,
}

/// Secant line over a crossing interval and its partial derivatives.
#[derive(Debug, Clone, Copy)]
struct Secant {
    slope: f32,
    bias: f32,
    dslope_dl: f32,
    dslope_du: f32,
    dbias_dl: f32,
    dbias_du: f32,
}

impl Secant {
    /// `slope = (u - s·l) / (u - l)`, `bias = -slope·l`. Requires l < 0 < u.
    fn new(bound: Bound, negative_slope: f32) -> Self {
        let (l, u, s) = (bound.lower, bound.upper, negative_slope);
        let width = u - l;
        let slope = (u - s * l) / width;
        let width_sq = width * width;
        let dslope_dl = u * (1.0 - s) / width_sq;
        let dslope_du = l * (s - 1.0) / width_sq;
        Self {
            slope,
            bias: -slope * l,
            dslope_dl,
            dslope_du,
            dbias_dl: -slope - l * dslope_dl,
            dbias_du: -l * dslope_du,
        }
    }
}

/// Adjoints produced by [`LeakyReluTransformer::backward`].
#[derive(Debug, Clone)]
pub struct SlopeBackward {
    /// d(loss)/d(α) per neuron; zero where α did not take part.
    pub slope_grad: Array1<f32>,
    /// d(loss)/d(lower bound of the input polygon).
    pub lower_bound_adj: Array1<f32>,
    /// d(loss)/d(upper bound of the input polygon).
    pub upper_bound_adj: Array1<f32>,
}

/// DeepPoly relaxation of `y = max(x, s·x)` for a base negative slope
/// `s ∈ [0, 1]` (ReLU is `s = 0`).
#[derive(Debug, Clone)]
pub struct LeakyReluTransformer {
    negative_slope: f32,
    mode: RelaxationMode,
    /// Lower slope α per neuron, only read for crossing neurons in
    /// adaptive mode. Always within [s, 1].
    slopes: Array1<f32>,
}

impl LeakyReluTransformer {
    /// Create the transformer for the layer whose input is `input`, seeding
    /// every α at the tie-break choice for the interval it sees now.
    pub fn new(negative_slope: f32, mode: RelaxationMode, input: &PolygonBound) -> Result<Self> {
        if !(0.0..=1.0).contains(&negative_slope) {
            return Err(PolyError::InvalidNetwork(format!(
                "negative slope must lie in [0, 1] (got {negative_slope})"
            )));
        }
        let slopes = (0..input.len())
            .map(|i| CrossingVariant::select(input.bound(i)).lower_slope(negative_slope))
            .collect();
        Ok(Self {
            negative_slope,
            mode,
            slopes,
        })
    }

    pub fn negative_slope(&self) -> f32 {
        self.negative_slope
    }

    pub fn len(&self) -> usize {
        self.slopes.len()
    }

    pub fn slopes(&self) -> &Array1<f32> {
        &self.slopes
    }

    /// Overwrite α, clamping every entry into [s, 1].
    pub fn set_slopes(&mut self, slopes: Array1<f32>) -> Result<()> {
        if slopes.len() != self.slopes.len() {
            return Err(PolyError::shape_mismatch(
                vec![self.slopes.len()],
                vec![slopes.len()],
            ));
        }
        self.slopes = slopes;
        self.clamp();
        Ok(())
    }

    /// Project α back into [s, 1].
    pub fn clamp(&mut self) {
        let low = self.negative_slope;
        self.slopes.mapv_inplace(|a| a.clamp(low, 1.0));
    }

    /// One gradient-descent step on α followed by the projection.
    pub fn step(&mut self, gradient: &Array1<f32>, learning_rate: f32) {
        self.slopes.scaled_add(-learning_rate, gradient);
        self.clamp();
    }

    /// Relaxation of neuron `neuron` over `bound`.
    pub fn relaxation(&self, neuron: usize, bound: Bound) -> ReluRelaxation {
        let s = self.negative_slope;
        let case = ReluCase::classify(bound);
        match case {
            ReluCase::AlwaysNegative => ReluRelaxation {
                case,
                lower_slope: s,
                upper_slope: s,
                upper_bias: 0.0,
            },
            ReluCase::AlwaysPositive => ReluRelaxation {
                case,
                lower_slope: 1.0,
                upper_slope: 1.0,
                upper_bias: 0.0,
            },
            ReluCase::Crossing => {
                let secant = Secant::new(bound, s);
                let lower_slope = match self.mode {
                    RelaxationMode::Fixed => CrossingVariant::select(bound).lower_slope(s),
                    RelaxationMode::Adaptive => self.slopes[neuron],
                };
                ReluRelaxation {
                    case,
                    lower_slope,
                    upper_slope: secant.slope,
                    upper_bias: secant.bias,
                }
            }
        }
    }

    /// Number of α entries that the current input makes trainable.
    pub fn num_trainable(&self, input: &PolygonBound) -> usize {
        if self.mode == RelaxationMode::Fixed {
            return 0;
        }
        input
            .bounds()
            .into_iter()
            .filter(|b| ReluCase::classify(*b) == ReluCase::Crossing)
            .count()
    }

    /// Relax every neuron; the result has diagonal (n, n) coefficients.
    pub fn forward(&self, input: PolygonBound) -> Result<PolygonBound> {
        let n = input.len();
        if n != self.slopes.len() {
            return Err(PolyError::shape_mismatch(vec![self.slopes.len()], vec![n]));
        }

        let mut lower_coefs = Array2::zeros((n, n));
        let mut upper_coefs = Array2::zeros((n, n));
        let mut upper_bias = Array1::zeros(n);
        for i in 0..n {
            let relaxation = self.relaxation(i, input.bound(i));
            lower_coefs[[i, i]] = relaxation.lower_slope;
            upper_coefs[[i, i]] = relaxation.upper_slope;
            upper_bias[i] = relaxation.upper_bias;
        }

        let polygon = PolygonBound::new(
            lower_coefs,
            upper_coefs,
            Array1::zeros(n),
            upper_bias,
            Some(input),
        )?;
        debug!("LeakyReLU (s = {}) output:\n{polygon}", self.negative_slope);
        Ok(polygon)
    }

    /// Chain rule through the relaxation coefficients.
    ///
    /// Given the adjoints of this layer's polygon diagonal (lower slope, upper
    /// slope, upper bias), returns d(loss)/d(α) and the adjoints of the input
    /// polygon's concrete bounds, which the secant line depends on. Case
    /// classification and the tie-break are piecewise constant and contribute
    /// nothing.
    pub fn backward(
        &self,
        input: &PolygonBound,
        lower_slope_adj: ArrayView1<f32>,
        upper_slope_adj: ArrayView1<f32>,
        upper_bias_adj: ArrayView1<f32>,
    ) -> SlopeBackward {
        let n = input.len();
        let mut slope_grad = Array1::zeros(n);
        let mut lower_bound_adj = Array1::zeros(n);
        let mut upper_bound_adj = Array1::zeros(n);

        for i in 0..n {
            let bound = input.bound(i);
            if ReluCase::classify(bound) != ReluCase::Crossing {
                continue;
            }
            if self.mode == RelaxationMode::Adaptive {
                slope_grad[i] = lower_slope_adj[i];
            }
            let secant = Secant::new(bound, self.negative_slope);
            lower_bound_adj[i] =
                upper_slope_adj[i] * secant.dslope_dl + upper_bias_adj[i] * secant.dbias_dl;
            upper_bound_adj[i] =
                upper_slope_adj[i] * secant.dslope_du + upper_bias_adj[i] * secant.dbias_du;
        }

        SlopeBackward {
            slope_grad,
            lower_bound_adj,
            upper_bound_adj,
        }
    }

    pub fn evaluate(&self, x: &Array1<f32>) -> Array1<f32> {
        let s = self.negative_slope;
        x.mapv(|v| if v >= 0.0 { v } else { s * v })
    }
}

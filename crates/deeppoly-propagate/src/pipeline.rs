//! Verification pipeline: network description + ε-box → verdict.

use crate::conv::Conv2dLayer;
use crate::optimizer::OptimizationDriver;
use crate::polygon::PolygonBound;
use crate::transformers::{LeakyReluTransformer, LinearTransformer, RelaxationMode, Transformer};
use crate::types::{StoppingConfig, VerificationOutcome, VerifierConfig};
use deeppoly_core::{LayerSpec, PolyError, Result, VerificationSpec};
use ndarray::{Array1, Array2, ArrayD};
use std::time::Instant;
use tracing::info;

/// Verify with the default optimizer settings.
pub fn verify(
    layers: &[LayerSpec],
    center: &ArrayD<f32>,
    true_label: usize,
    epsilon: f32,
    stopping: StoppingConfig,
) -> Result<VerificationOutcome> {
    Verifier::new(VerifierConfig {
        stopping,
        ..VerifierConfig::default()
    })?
    .verify(layers, center, true_label, epsilon)
}

/// DeepPoly verifier with adaptive slope optimization.
#[derive(Debug, Clone)]
pub struct Verifier {
    config: VerifierConfig,
}

impl Verifier {
    pub fn new(config: VerifierConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Prove that `true_label` wins on every input within `epsilon` (L∞) of
    /// `center`, clipped to [0, 1].
    pub fn verify(
        &self,
        layers: &[LayerSpec],
        center: &ArrayD<f32>,
        true_label: usize,
        epsilon: f32,
    ) -> Result<VerificationOutcome> {
        let start = Instant::now();

        let flat: Array1<f32> = center.iter().copied().collect();
        let input = PolygonBound::from_input(&flat, epsilon)?;
        let mut chain = build_chain(
            layers,
            center.shape(),
            &input,
            true_label,
            self.config.optimizer.relaxation,
        )?;
        info!(
            "The model construction took {:.1} seconds",
            start.elapsed().as_secs_f32()
        );

        let driver = OptimizationDriver::new(self.config.optimizer, self.config.stopping)?;
        let training = driver.run(&mut chain, &input)?;

        let elapsed = start.elapsed();
        info!(
            "The computation took {:.1} seconds, {} epochs",
            elapsed.as_secs_f32(),
            training.epochs
        );
        Ok(VerificationOutcome {
            verified: training.verified,
            epochs: training.epochs,
            elapsed,
        })
    }

    pub fn verify_spec(
        &self,
        layers: &[LayerSpec],
        spec: &VerificationSpec,
    ) -> Result<VerificationOutcome> {
        let center = spec.center()?;
        self.verify(layers, &center, spec.label, spec.epsilon)
    }
}

/// Synthetic last layer: row `r` computes `logit[true_label] - logit[c]` for
/// the `r`-th class `c != true_label`.
pub fn margin_layer(num_classes: usize, true_label: usize) -> Result<LinearTransformer> {
    if num_classes < 2 {
        return Err(PolyError::InvalidNetwork(format!(
            "need at least two classes (got {num_classes})"
        )));
    }
    if true_label >= num_classes {
        return Err(PolyError::InvalidSpec(format!(
            "label {true_label} out of range for {num_classes} classes"
        )));
    }
    let mut weight = Array2::zeros((num_classes - 1, num_classes));
    for (row, class) in (0..num_classes).filter(|&c| c != true_label).enumerate() {
        weight[[row, true_label]] = 1.0;
        weight[[row, class]] = -1.0;
    }
    LinearTransformer::new(weight, None)
}

/// `(channels, height, width)` of a spatial input, `None` for a flat one.
fn spatial_shape(shape: &[usize]) -> Result<Option<[usize; 3]>> {
    match *shape {
        [_] => Ok(None),
        [height, width] => Ok(Some([1, height, width])),
        [channels, height, width] => Ok(Some([channels, height, width])),
        _ => Err(PolyError::InvalidSpec(format!(
            "unsupported input shape {shape:?}"
        ))),
    }
}

/// Map each network layer to a transformer, forwarding `input` along the way
/// so relaxations can initialize their slopes.
///
/// Returns the chain and the polygon of the last layer.
pub fn build_network(
    layers: &[LayerSpec],
    input_shape: &[usize],
    input: &PolygonBound,
    mode: RelaxationMode,
) -> Result<(Vec<Transformer>, PolygonBound)> {
    if layers.is_empty() {
        return Err(PolyError::InvalidNetwork("network has no layers".to_string()));
    }

    let mut spatial = spatial_shape(input_shape)?;
    let mut flattened = spatial.is_none();
    let mut chain = Vec::with_capacity(layers.len() + 2);
    let mut current = input.clone();

    for (idx, layer) in layers.iter().enumerate() {
        let wrap = |e: PolyError| e.in_layer(idx, layer.kind());
        match layer {
            LayerSpec::Flatten => {
                // A view that is already flat needs no second Flatten.
                if spatial.is_some() {
                    chain.push(Transformer::Flatten);
                    flattened = true;
                }
                spatial = None;
            }
            LayerSpec::Linear { weight, bias } => {
                if !flattened {
                    chain.push(Transformer::Flatten);
                    flattened = true;
                }
                spatial = None;
                let linear = LinearTransformer::new(weight.clone(), bias.clone()).map_err(wrap)?;
                current = linear.forward(current).map_err(wrap)?;
                chain.push(Transformer::Linear(linear));
            }
            LayerSpec::Conv2d(spec) => {
                let Some(shape) = spatial else {
                    return Err(wrap(PolyError::InvalidNetwork(
                        "convolution needs a (channels, height, width) input".to_string(),
                    )));
                };
                if !flattened {
                    chain.push(Transformer::Flatten);
                    flattened = true;
                }
                let conv = Conv2dLayer::new(spec.clone(), shape).map_err(wrap)?;
                let linear = conv.to_linear().map_err(wrap)?;
                current = linear.forward(current).map_err(wrap)?;
                spatial = Some(conv.output_shape());
                chain.push(Transformer::Linear(linear));
            }
            LayerSpec::Relu | LayerSpec::LeakyRelu { .. } => {
                let negative_slope = match layer {
                    LayerSpec::LeakyRelu { negative_slope } => *negative_slope,
                    _ => 0.0,
                };
                let relu = LeakyReluTransformer::new(negative_slope, mode, &current).map_err(wrap)?;
                current = relu.forward(current).map_err(wrap)?;
                chain.push(Transformer::LeakyRelu(relu));
            }
            LayerSpec::Unsupported { kind } => {
                return Err(wrap(PolyError::UnsupportedLayer(kind.clone())));
            }
        }
    }
    Ok((chain, current))
}

/// The network's transformers followed by the margin layer for `true_label`.
pub fn build_chain(
    layers: &[LayerSpec],
    input_shape: &[usize],
    input: &PolygonBound,
    true_label: usize,
    mode: RelaxationMode,
) -> Result<Vec<Transformer>> {
    let (mut chain, output) = build_network(layers, input_shape, input, mode)?;
    chain.push(Transformer::Linear(margin_layer(output.len(), true_label)?));
    Ok(chain)
}

/// Class predicted by the network on the unperturbed input.
pub fn predict(layers: &[LayerSpec], center: &ArrayD<f32>) -> Result<usize> {
    let flat: Array1<f32> = center.iter().copied().collect();
    let input = PolygonBound::from_input(&flat, 0.0)?;
    let (chain, _) = build_network(layers, center.shape(), &input, RelaxationMode::Fixed)?;
    let logits = chain.iter().fold(flat, |x, transformer| transformer.evaluate(&x));
    logits
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f32)>, (i, &v)| match best {
            Some((_, top)) if top >= v => best,
            _ => Some((i, v)),
        })
        .map(|(i, _)| i)
        .ok_or_else(|| PolyError::InvalidNetwork("network has no outputs".to_string()))
}

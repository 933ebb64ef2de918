//! Property-based soundness tests for DeepPoly propagation.
//!
//! Random small fully-connected networks are propagated over random ε-boxes;
//! every concrete activation of every sampled input in the box must lie
//! within the reported bounds of its layer. A small tolerance absorbs f32
//! rounding between the concrete forward pass and back-substitution.

use crate::optimizer::{forward_chain, OptimizationDriver, OptimizerConfig};
use crate::pipeline::{build_chain, build_network};
use crate::{LayerSpec, PolygonBound, RelaxationMode, StoppingConfig, Transformer};
use ndarray::{Array1, Array2};
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const FP_TOLERANCE: f32 = 1e-4;

const NEGATIVE_SLOPES: [f32; 3] = [0.0, 0.1, 0.5];

/// Input, hidden and output widths.
fn random_dims(rng: &mut StdRng) -> Vec<usize> {
    let mut dims = vec![rng.gen_range(2..=4)];
    for _ in 0..rng.gen_range(1..=2) {
        dims.push(rng.gen_range(2..=5));
    }
    dims.push(rng.gen_range(2..=3));
    dims
}

/// Linear layers with an activation between each pair.
pub(crate) fn random_layers(rng: &mut StdRng, dims: &[usize], negative_slope: f32) -> Vec<LayerSpec> {
    let mut layers = Vec::new();
    for (i, pair) in dims.windows(2).enumerate() {
        let weight: Array2<f32> =
            Array2::from_shape_fn((pair[1], pair[0]), |_| rng.gen_range(-1.0..1.0));
        let bias: Array1<f32> = Array1::from_shape_fn(pair[1], |_| rng.gen_range(-0.5..0.5));
        layers.push(LayerSpec::Linear {
            weight,
            bias: Some(bias),
        });
        if i + 2 < dims.len() {
            layers.push(if negative_slope == 0.0 {
                LayerSpec::Relu
            } else {
                LayerSpec::LeakyRelu { negative_slope }
            });
        }
    }
    layers
}

fn random_center(rng: &mut StdRng, len: usize) -> Array1<f32> {
    Array1::from_shape_fn(len, |_| rng.gen_range(0.0..1.0))
}

fn randomize_slopes(rng: &mut StdRng, chain: &mut [Transformer]) {
    for transformer in chain.iter_mut() {
        if let Transformer::LeakyRelu(relu) = transformer {
            let low = relu.negative_slope();
            let slopes = Array1::from_shape_fn(relu.len(), |_| rng.gen_range(low..=1.0));
            relu.set_slopes(slopes).unwrap();
        }
    }
}

/// Concrete value of every polygon-producing layer, root first.
fn node_values(chain: &[Transformer], x: &Array1<f32>) -> Vec<Array1<f32>> {
    let mut values = vec![x.clone()];
    let mut current = x.clone();
    for transformer in chain {
        current = transformer.evaluate(&current);
        if transformer.produces_polygon() {
            values.push(current.clone());
        }
    }
    values
}

/// Sample points of the (clipped) input box of `output`'s chain.
fn box_samples(rng: &mut StdRng, root: &PolygonBound, count: usize) -> Vec<Array1<f32>> {
    (0..count)
        .map(|_| {
            Array1::from_shape_fn(root.len(), |i| {
                let (l, u) = (root.lower()[i], root.upper()[i]);
                (l + (u - l) * rng.gen_range(0.0f32..=1.0)).clamp(l, u)
            })
        })
        .collect()
}

fn assert_contains(
    chain: &[Transformer],
    output: &PolygonBound,
    points: &[Array1<f32>],
) -> Result<(), TestCaseError> {
    let mut nodes: Vec<&PolygonBound> = output.ancestors().collect();
    nodes.reverse();
    for x in points {
        let values = node_values(chain, x);
        prop_assert_eq!(values.len(), nodes.len());
        for (depth, (node, value)) in nodes.iter().zip(&values).enumerate() {
            for (i, &v) in value.iter().enumerate() {
                let tol = FP_TOLERANCE * (1.0 + v.abs());
                prop_assert!(
                    node.lower()[i] - tol <= v && v <= node.upper()[i] + tol,
                    "soundness violation at depth {} neuron {}: {} not in [{}, {}]",
                    depth, i, v, node.lower()[i], node.upper()[i]
                );
            }
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Every layer's bounds contain the concrete activations, for the fixed
    /// tie-break and for arbitrary adaptive slopes.
    #[test]
    fn soundness_random_networks(
        seed in any::<u64>(),
        epsilon in 0.01f32..0.3,
        slope_idx in 0usize..3,
        adaptive in any::<bool>(),
    ) {
        let mut rng = StdRng::seed_from_u64(seed);
        let negative_slope = NEGATIVE_SLOPES[slope_idx];
        let dims = random_dims(&mut rng);
        let layers = random_layers(&mut rng, &dims, negative_slope);
        let center = random_center(&mut rng, dims[0]);
        let root = PolygonBound::from_input(&center, epsilon).unwrap();

        let mode = if adaptive { RelaxationMode::Adaptive } else { RelaxationMode::Fixed };
        let (mut chain, _) = build_network(&layers, &[dims[0]], &root, mode).unwrap();
        if adaptive {
            randomize_slopes(&mut rng, &mut chain);
        }
        let output = forward_chain(&chain, &root).unwrap();

        let mut points = box_samples(&mut rng, &root, 20);
        points.push(root.lower().clone());
        points.push(root.upper().clone());
        assert_contains(&chain, &output, &points)?;
    }

    /// Optimizer steps keep the slopes inside [s, 1], so bounds stay sound.
    #[test]
    fn soundness_after_optimizer_steps(
        seed in any::<u64>(),
        epsilon in 0.05f32..0.3,
        slope_idx in 0usize..3,
    ) {
        let mut rng = StdRng::seed_from_u64(seed);
        let negative_slope = NEGATIVE_SLOPES[slope_idx];
        let dims = random_dims(&mut rng);
        let layers = random_layers(&mut rng, &dims, negative_slope);
        let center = random_center(&mut rng, dims[0]);
        let root = PolygonBound::from_input(&center, epsilon).unwrap();

        let mut chain = build_chain(&layers, &[dims[0]], &root, 0, RelaxationMode::Adaptive).unwrap();
        let driver = OptimizationDriver::new(
            OptimizerConfig::default(),
            StoppingConfig { max_epochs: Some(3), early_stopping: None, lr_scheduling: Some(1) },
        ).unwrap();
        driver.run(&mut chain, &root).unwrap();

        for transformer in &chain {
            if let Transformer::LeakyRelu(relu) = transformer {
                prop_assert!(relu.slopes().iter().all(|&a| (negative_slope..=1.0).contains(&a)));
            }
        }

        let output = forward_chain(&chain, &root).unwrap();
        let points = box_samples(&mut rng, &root, 20);
        assert_contains(&chain, &output, &points)?;
    }

    /// With ε = 0 every interval collapses onto the exact forward pass.
    #[test]
    fn exactness_at_zero_epsilon(seed in any::<u64>(), slope_idx in 0usize..3) {
        let mut rng = StdRng::seed_from_u64(seed);
        let dims = random_dims(&mut rng);
        let layers = random_layers(&mut rng, &dims, NEGATIVE_SLOPES[slope_idx]);
        let center = random_center(&mut rng, dims[0]);
        let root = PolygonBound::from_input(&center, 0.0).unwrap();

        let chain = build_chain(&layers, &[dims[0]], &root, 1, RelaxationMode::Adaptive).unwrap();
        let output = forward_chain(&chain, &root).unwrap();
        let values = node_values(&chain, &center);
        let mut nodes: Vec<&PolygonBound> = output.ancestors().collect();
        nodes.reverse();

        for (node, value) in nodes.iter().zip(&values) {
            prop_assert_eq!(node.lower(), node.upper());
            for (i, &v) in value.iter().enumerate() {
                let tol = FP_TOLERANCE * (1.0 + v.abs());
                prop_assert!((node.lower()[i] - v).abs() <= tol, "{} vs {}", node.lower()[i], v);
            }
        }
    }

    /// A lone affine layer yields exactly the interval image of the box.
    #[test]
    fn affine_layers_are_exact(seed in any::<u64>(), epsilon in 0.0f32..0.5) {
        let mut rng = StdRng::seed_from_u64(seed);
        let dims = [rng.gen_range(1..=5), rng.gen_range(1..=5)];
        let layers = random_layers(&mut rng, &dims, 0.0);
        let center = random_center(&mut rng, dims[0]);
        let root = PolygonBound::from_input(&center, epsilon).unwrap();
        let (_, output) = build_network(&layers, &[dims[0]], &root, RelaxationMode::Fixed).unwrap();

        let LayerSpec::Linear { weight, bias: Some(bias) } = &layers[0] else {
            unreachable!("random_layers starts with a linear layer");
        };
        for j in 0..dims[1] {
            let mut lower = bias[j];
            let mut upper = bias[j];
            for k in 0..dims[0] {
                let w = weight[[j, k]];
                let (a, b) = (w * root.lower()[k], w * root.upper()[k]);
                lower += a.min(b);
                upper += a.max(b);
            }
            prop_assert!((output.lower()[j] - lower).abs() <= FP_TOLERANCE);
            prop_assert!((output.upper()[j] - upper).abs() <= FP_TOLERANCE);
        }
    }
}

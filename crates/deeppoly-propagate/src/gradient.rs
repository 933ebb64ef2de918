//! Analytic reverse sweep: gradient of the margin loss w.r.t. every
//! trainable relaxation slope.
//!
//! Every concrete bound is the output of a back-substitution, a sequence of
//! sign-split matrix products down to the input box. The sweep replays those
//! products in reverse. Relaxation polygons additionally depend on the
//! concrete bounds of their input through the secant line, so each of them
//! seeds a further reverse back-substitution of its input polygon. Nodes are
//! visited from the output towards the input, which guarantees that a node's
//! adjoint is complete before it is consumed.

use crate::polygon::{split_signs, BoundSide, PolygonBound};
use crate::transformers::Transformer;
use deeppoly_core::{PolyError, Result};
use ndarray::{Array1, Array2, Axis, Zip};

/// Accumulated adjoints of one polygon's parameters.
///
/// Coefficient adjoints are only tracked on the diagonal, which is all a
/// relaxation polygon has.
#[derive(Debug, Clone)]
pub struct NodeAdjoint {
    pub lower_diag: Array1<f32>,
    pub upper_diag: Array1<f32>,
    pub lower_bias: Array1<f32>,
    pub upper_bias: Array1<f32>,
}

impl NodeAdjoint {
    pub fn zeros(len: usize) -> Self {
        Self {
            lower_diag: Array1::zeros(len),
            upper_diag: Array1::zeros(len),
            lower_bias: Array1::zeros(len),
            upper_bias: Array1::zeros(len),
        }
    }

    fn diag_mut(&mut self, side: BoundSide) -> &mut Array1<f32> {
        match side {
            BoundSide::Lower => &mut self.lower_diag,
            BoundSide::Upper => &mut self.upper_diag,
        }
    }

    fn bias_mut(&mut self, side: BoundSide) -> &mut Array1<f32> {
        match side {
            BoundSide::Lower => &mut self.lower_bias,
            BoundSide::Upper => &mut self.upper_bias,
        }
    }
}

/// Reverse one back-substitution.
///
/// `nodes[0]` is the root and `nodes[k]` the polygon whose `side` bound
/// received the adjoint `seed`. Adjoints are added into `adjoints`; diagonal
/// coefficient adjoints only for nodes flagged in `diagonal`.
pub fn reverse_substitution(
    nodes: &[&PolygonBound],
    k: usize,
    side: BoundSide,
    seed: &Array1<f32>,
    diagonal: &[bool],
    adjoints: &mut [NodeAdjoint],
) {
    let node = nodes[k];
    let trace = node.substitution_trace(side);
    *adjoints[k].bias_mut(side) += seed;

    // Adjoint of the accumulated matrix after the current step.
    let mut next_adj: Option<Array2<f32>> = None;
    for (t, coefs) in trace.iter().enumerate().rev() {
        let idx = k - 1 - t;
        let ancestor = nodes[idx];
        let (same_coefs, same_bias) = ancestor.coefs(side);
        let (opp_coefs, opp_bias) = ancestor.coefs(side.opposite());
        let (pos, neg) = split_signs(coefs);

        // bias += pos·same_bias + neg·opp_bias
        if idx > 0 {
            *adjoints[idx].bias_mut(side) += &pos.t().dot(seed);
            *adjoints[idx].bias_mut(side.opposite()) += &neg.t().dot(seed);
        }
        let mut adj = Array2::from_shape_fn(coefs.dim(), |(i, j)| {
            let bias = if coefs[[i, j]] >= 0.0 { same_bias[j] } else { opp_bias[j] };
            seed[i] * bias
        });

        // coefs' = pos·same_coefs + neg·opp_coefs; the root step has none.
        if let Some(next) = next_adj.as_ref() {
            if diagonal[idx] {
                let same_diag = (&pos * next).sum_axis(Axis(0));
                let opp_diag = (&neg * next).sum_axis(Axis(0));
                *adjoints[idx].diag_mut(side) += &same_diag;
                *adjoints[idx].diag_mut(side.opposite()) += &opp_diag;
            }
            let via_same = next.dot(&same_coefs.t());
            let via_opp = next.dot(&opp_coefs.t());
            Zip::from(&mut adj)
                .and(coefs)
                .and(&via_same)
                .and(&via_opp)
                .for_each(|a, &c, &s, &o| *a += if c >= 0.0 { s } else { o });
        }
        next_adj = Some(adj);
    }

    if diagonal[k] {
        if let Some(own) = next_adj {
            *adjoints[k].diag_mut(side) += &own.diag();
        }
    }
}

/// Gradient of the loss w.r.t. the slopes of every relaxation in `chain`.
///
/// `output` must be the polygon produced by forwarding `chain`, and `seed`
/// the loss adjoint of its concrete lower bounds. Entry `i` of the result is
/// `Some(gradient)` for relaxation transformers and `None` otherwise.
pub fn slope_gradients(
    chain: &[Transformer],
    output: &PolygonBound,
    seed: &Array1<f32>,
) -> Result<Vec<Option<Array1<f32>>>> {
    let mut nodes: Vec<&PolygonBound> = output.ancestors().collect();
    nodes.reverse();

    // Polygon index produced by each transformer.
    let mut node_of = Vec::with_capacity(chain.len());
    let mut diagonal = vec![false; nodes.len()];
    let mut next_node = 1;
    for transformer in chain {
        if transformer.produces_polygon() {
            if let Transformer::LeakyRelu(_) = transformer {
                if let Some(flag) = diagonal.get_mut(next_node) {
                    *flag = true;
                }
            }
            node_of.push(Some(next_node));
            next_node += 1;
        } else {
            node_of.push(None);
        }
    }
    if next_node != nodes.len() {
        return Err(PolyError::Internal(format!(
            "chain produces {} polygons but the output has depth {}",
            next_node - 1,
            nodes.len() - 1
        )));
    }
    if seed.len() != output.len() {
        return Err(PolyError::shape_mismatch(vec![output.len()], vec![seed.len()]));
    }

    let mut adjoints: Vec<NodeAdjoint> = nodes.iter().map(|n| NodeAdjoint::zeros(n.len())).collect();
    let last = nodes.len() - 1;
    reverse_substitution(&nodes, last, BoundSide::Lower, seed, &diagonal, &mut adjoints);

    let mut gradients = vec![None; chain.len()];
    for (i, transformer) in chain.iter().enumerate().rev() {
        let (Transformer::LeakyRelu(relu), Some(k)) = (transformer, node_of[i]) else {
            continue;
        };
        let input = nodes[k - 1];
        let adjoint = &adjoints[k];
        let back = relu.backward(
            input,
            adjoint.lower_diag.view(),
            adjoint.upper_diag.view(),
            adjoint.upper_bias.view(),
        );
        gradients[i] = Some(back.slope_grad);

        // The input box is constant.
        if k - 1 > 0 {
            reverse_substitution(
                &nodes,
                k - 1,
                BoundSide::Lower,
                &back.lower_bound_adj,
                &diagonal,
                &mut adjoints,
            );
            reverse_substitution(
                &nodes,
                k - 1,
                BoundSide::Upper,
                &back.upper_bound_adj,
                &diagonal,
                &mut adjoints,
            );
        }
    }
    Ok(gradients)
}

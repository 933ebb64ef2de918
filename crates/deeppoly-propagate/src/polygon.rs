//! Polygon bounds: the DeepPoly abstract value of one layer.
//!
//! A [`PolygonBound`] stores, for every output neuron `o_j` of a layer, a lower
//! and an upper linear inequality over the outputs `i_k` of the *previous*
//! layer:
//!
//! ```text
//! Σ_k lower_coefs[j,k]·i_k + lower_bias[j]  ≤  o_j  ≤  Σ_k upper_coefs[j,k]·i_k + upper_bias[j]
//! ```
//!
//! together with the concrete interval `[lower_bound[j], upper_bound[j]]`
//! obtained by back-substituting the inequalities through every ancestor down
//! to the input box.
//!
//! Shape conventions: for a layer with `out` neurons whose parent has `in`
//! neurons, the coefficient matrices are (out, in) and the bias and bound
//! vectors are (out,). The root (input box) has zero-width coefficients.

use deeppoly_core::{Bound, PolyError, Result};
use ndarray::{Array1, Array2};
use std::fmt;

/// Which of the two inequalities of a polygon is being concretized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundSide {
    Lower,
    Upper,
}

impl BoundSide {
    #[inline]
    pub fn opposite(self) -> Self {
        match self {
            BoundSide::Lower => BoundSide::Upper,
            BoundSide::Upper => BoundSide::Lower,
        }
    }
}

/// Symbolic linear bounds of one layer plus their concretized interval.
///
/// Immutable after construction. Exclusively owns its parent, so a polygon is
/// the head of a simple path leading back to the input box.
#[derive(Debug, Clone)]
pub struct PolygonBound {
    lower_coefs: Array2<f32>,
    upper_coefs: Array2<f32>,
    lower_bias: Array1<f32>,
    upper_bias: Array1<f32>,
    lower_bound: Array1<f32>,
    upper_bound: Array1<f32>,
    parent: Option<Box<PolygonBound>>,
}

impl PolygonBound {
    /// Build a polygon and concretize it by back-substitution to the root.
    ///
    /// Fails with `ShapeMismatch` if the coefficient shapes disagree with each
    /// other or with the parent, and with `UnsoundBound` if any resulting
    /// interval is inverted or non-finite.
    pub fn new(
        lower_coefs: Array2<f32>,
        upper_coefs: Array2<f32>,
        lower_bias: Array1<f32>,
        upper_bias: Array1<f32>,
        parent: Option<PolygonBound>,
    ) -> Result<Self> {
        let (out, inputs) = lower_coefs.dim();
        if upper_coefs.dim() != (out, inputs) {
            let (u_out, u_in) = upper_coefs.dim();
            return Err(PolyError::shape_mismatch(
                vec![out, inputs],
                vec![u_out, u_in],
            ));
        }
        if lower_bias.len() != out {
            return Err(PolyError::shape_mismatch(vec![out], vec![lower_bias.len()]));
        }
        if upper_bias.len() != out {
            return Err(PolyError::shape_mismatch(vec![out], vec![upper_bias.len()]));
        }
        let expected_inputs = parent.as_ref().map_or(0, PolygonBound::len);
        if inputs != expected_inputs {
            return Err(PolyError::shape_mismatch(
                vec![out, expected_inputs],
                vec![out, inputs],
            ));
        }

        let parent = parent.map(Box::new);
        let lower_bound = back_substitute(
            &lower_coefs,
            &lower_bias,
            parent.as_deref(),
            BoundSide::Lower,
        );
        let upper_bound = back_substitute(
            &upper_coefs,
            &upper_bias,
            parent.as_deref(),
            BoundSide::Upper,
        );
        check_sound(&lower_bound, &upper_bound)?;

        Ok(Self {
            lower_coefs,
            upper_coefs,
            lower_bias,
            upper_bias,
            lower_bound,
            upper_bound,
            parent,
        })
    }

    /// The input box `[center - eps, center + eps] ∩ [0, 1]`.
    ///
    /// The root has (n, 0) coefficient matrices, so its bounds are its biases.
    pub fn from_input(center: &Array1<f32>, epsilon: f32) -> Result<Self> {
        if !epsilon.is_finite() || epsilon < 0.0 {
            return Err(PolyError::InvalidSpec(format!(
                "epsilon must be finite and >= 0 (got {epsilon})"
            )));
        }
        if let Some(idx) = center.iter().position(|v| !v.is_finite()) {
            return Err(PolyError::InvalidSpec(format!(
                "input value {idx} is not finite ({})",
                center[idx]
            )));
        }

        let n = center.len();
        let lower = center.mapv(|c| (c - epsilon).clamp(0.0, 1.0));
        let upper = center.mapv(|c| (c + epsilon).clamp(0.0, 1.0));
        let root = Self::new(
            Array2::zeros((n, 0)),
            Array2::zeros((n, 0)),
            lower,
            upper,
            None,
        )?;
        if root.is_empty() {
            return Err(PolyError::InvalidSpec("input has no values".to_string()));
        }
        Ok(root)
    }

    /// Number of neurons of this layer.
    #[inline]
    pub fn len(&self) -> usize {
        self.lower_bias.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of neurons of the parent layer (0 for the root).
    #[inline]
    pub fn num_inputs(&self) -> usize {
        self.lower_coefs.ncols()
    }

    pub fn lower_coefs(&self) -> &Array2<f32> {
        &self.lower_coefs
    }

    pub fn upper_coefs(&self) -> &Array2<f32> {
        &self.upper_coefs
    }

    pub fn lower_bias(&self) -> &Array1<f32> {
        &self.lower_bias
    }

    pub fn upper_bias(&self) -> &Array1<f32> {
        &self.upper_bias
    }

    /// Coefficients and bias of one inequality.
    #[inline]
    pub fn coefs(&self, side: BoundSide) -> (&Array2<f32>, &Array1<f32>) {
        match side {
            BoundSide::Lower => (&self.lower_coefs, &self.lower_bias),
            BoundSide::Upper => (&self.upper_coefs, &self.upper_bias),
        }
    }

    /// Concrete lower bounds.
    pub fn lower(&self) -> &Array1<f32> {
        &self.lower_bound
    }

    /// Concrete upper bounds.
    pub fn upper(&self) -> &Array1<f32> {
        &self.upper_bound
    }

    /// Concrete interval of one neuron.
    pub fn bound(&self, neuron: usize) -> Bound {
        Bound {
            lower: self.lower_bound[neuron],
            upper: self.upper_bound[neuron],
        }
    }

    /// Concrete intervals of all neurons.
    pub fn bounds(&self) -> Vec<Bound> {
        (0..self.len()).map(|i| self.bound(i)).collect()
    }

    pub fn parent(&self) -> Option<&PolygonBound> {
        self.parent.as_deref()
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// This polygon followed by its parent, grandparent, ..., root.
    pub fn ancestors(&self) -> impl Iterator<Item = &PolygonBound> {
        std::iter::successors(Some(self), |node| node.parent())
    }

    /// Number of substitution steps down to the root.
    pub fn depth(&self) -> usize {
        self.ancestors().count() - 1
    }

    /// Coefficient matrices seen just before each substitution step when
    /// concretizing `side` of this polygon, parent step first.
    ///
    /// Entry `t` is the accumulated matrix about to be substituted through the
    /// `t`-th ancestor (t = 0 is the parent). Used by the reverse sweep.
    pub(crate) fn substitution_trace(&self, side: BoundSide) -> Vec<Array2<f32>> {
        let (coefs, _) = self.coefs(side);
        let mut trace = Vec::with_capacity(self.depth());
        let mut current = coefs.clone();
        let mut cursor = self.parent();
        while let Some(node) = cursor {
            let next = substitute_coefs(&current, node, side);
            trace.push(current);
            current = next;
            cursor = node.parent();
        }
        trace
    }
}

/// Split a coefficient matrix into its non-negative and non-positive parts.
#[inline]
pub(crate) fn split_signs(coefs: &Array2<f32>) -> (Array2<f32>, Array2<f32>) {
    (coefs.mapv(|v| v.max(0.0)), coefs.mapv(|v| v.min(0.0)))
}

/// One substitution step of the coefficients through `node`.
///
/// For the lower side: `pos(A)·L_node + neg(A)·U_node`; the upper side swaps
/// the roles of `L_node` and `U_node`.
fn substitute_coefs(coefs: &Array2<f32>, node: &PolygonBound, side: BoundSide) -> Array2<f32> {
    let (pos, neg) = split_signs(coefs);
    let (same, _) = node.coefs(side);
    let (opposite, _) = node.coefs(side.opposite());
    pos.dot(same) + neg.dot(opposite)
}

/// Concretize one side of a polygon by substituting through every ancestor.
///
/// Not memoized: every call walks the whole chain down to the root, whose
/// zero-width coefficients end the recursion and leave only the bias.
fn back_substitute(
    coefs: &Array2<f32>,
    bias: &Array1<f32>,
    parent: Option<&PolygonBound>,
    side: BoundSide,
) -> Array1<f32> {
    let mut coefs = coefs.clone();
    let mut bias = bias.clone();
    let mut cursor = parent;
    while let Some(node) = cursor {
        let (pos, neg) = split_signs(&coefs);
        let (same_coefs, same_bias) = node.coefs(side);
        let (opposite_coefs, opposite_bias) = node.coefs(side.opposite());
        bias += &pos.dot(same_bias);
        bias += &neg.dot(opposite_bias);
        coefs = pos.dot(same_coefs) + neg.dot(opposite_coefs);
        cursor = node.parent();
    }
    bias
}

fn check_sound(lower_bound: &Array1<f32>, upper_bound: &Array1<f32>) -> Result<()> {
    for (neuron, (&lower, &upper)) in lower_bound.iter().zip(upper_bound.iter()).enumerate() {
        if !(Bound { lower, upper }).is_sound() {
            return Err(PolyError::UnsoundBound {
                neuron,
                lower,
                upper,
            });
        }
    }
    Ok(())
}

impl fmt::Display for PolygonBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn linear_form(coefs: ndarray::ArrayView1<f32>, bias: f32) -> String {
            let mut terms: Vec<String> = coefs
                .iter()
                .enumerate()
                .map(|(i, c)| format!("({c} × i{i})"))
                .collect();
            terms.push(bias.to_string());
            terms.join(" + ")
        }

        writeln!(f, "PolygonBound(")?;
        writeln!(f, "  shape: (out={}, in={})", self.len(), self.num_inputs())?;
        for j in 0..self.len() {
            writeln!(f)?;
            writeln!(
                f,
                "  o{j} ∈ [{}, {}]",
                self.lower_bound[j], self.upper_bound[j]
            )?;
            writeln!(
                f,
                "  o{j} ≥ {}",
                linear_form(self.lower_coefs.row(j), self.lower_bias[j])
            )?;
            writeln!(
                f,
                "  o{j} ≤ {}",
                linear_form(self.upper_coefs.row(j), self.upper_bias[j])
            )?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    fn unit_box() -> PolygonBound {
        // x0, x1 ∈ [0, 1]; p0 = x0, x1 ≤ p1 ≤ x1 - 0.25
        PolygonBound::from_input(&arr1(&[0.5, 0.5]), 0.5)
            .and_then(|root| {
                PolygonBound::new(
                    Array2::eye(2),
                    Array2::eye(2),
                    arr1(&[0.0, 0.0]),
                    arr1(&[0.0, -0.25]),
                    Some(root),
                )
            })
            .unwrap()
    }

    #[test]
    fn test_input_box_is_clipped() {
        let root = PolygonBound::from_input(&arr1(&[0.05, 0.5, 0.98]), 0.1).unwrap();
        assert!(root.is_root());
        assert_eq!(root.num_inputs(), 0);
        assert_eq!(root.depth(), 0);
        assert_eq!(root.lower()[0], 0.0);
        assert!((root.upper()[0] - 0.15).abs() < 1e-6);
        assert!((root.lower()[1] - 0.4).abs() < 1e-6);
        assert!((root.upper()[1] - 0.6).abs() < 1e-6);
        assert!((root.lower()[2] - 0.88).abs() < 1e-6);
        assert_eq!(root.upper()[2], 1.0);
    }

    #[test]
    fn test_input_box_rejects_bad_epsilon() {
        let center = arr1(&[0.5]);
        assert!(matches!(
            PolygonBound::from_input(&center, -0.1),
            Err(PolyError::InvalidSpec(_))
        ));
        assert!(matches!(
            PolygonBound::from_input(&center, f32::NAN),
            Err(PolyError::InvalidSpec(_))
        ));
        assert!(matches!(
            PolygonBound::from_input(&arr1(&[f32::INFINITY]), 0.1),
            Err(PolyError::InvalidSpec(_))
        ));
        assert!(matches!(
            PolygonBound::from_input(&Array1::zeros(0), 0.1),
            Err(PolyError::InvalidSpec(_))
        ));
    }

    #[test]
    fn test_back_substitution_splits_signs() {
        // y = x0 - x1 over x0 ∈ [0, 1], x1 ∈ [0, 1]
        let root = PolygonBound::from_input(&arr1(&[0.5, 0.5]), 0.5).unwrap();
        let y = PolygonBound::new(
            arr2(&[[1.0, -1.0]]),
            arr2(&[[1.0, -1.0]]),
            arr1(&[0.5]),
            arr1(&[0.5]),
            Some(root),
        )
        .unwrap();
        assert_eq!(y.lower()[0], -0.5);
        assert_eq!(y.upper()[0], 1.5);
        assert_eq!(y.depth(), 1);
    }

    #[test]
    fn test_back_substitution_uses_parent_relaxation() {
        // The parent's inequalities for p1 are not a relaxation we would
        // build, but the algebra must follow the sign split regardless.
        let parent = unit_box();
        // z = p0 - 2·p1
        let z = PolygonBound::new(
            arr2(&[[1.0, -2.0]]),
            arr2(&[[1.0, -2.0]]),
            arr1(&[0.0]),
            arr1(&[0.0]),
            Some(parent),
        )
        .unwrap();
        // lower: p0 ≥ x0, -2·p1 ≥ -2·(x1 - 0.25) → x0 - 2·x1 + 0.5 ≥ 0 - 2 + 0.5
        assert!((z.lower()[0] - (-1.5)).abs() < 1e-6);
        // upper: p0 ≤ x0, -2·p1 ≤ -2·x1 → 1 - 0
        assert!((z.upper()[0] - 1.0).abs() < 1e-6);
        assert_eq!(z.depth(), 2);
    }

    #[test]
    fn test_substitution_trace_matches_depth() {
        let parent = unit_box();
        let z = PolygonBound::new(
            arr2(&[[1.0, -2.0]]),
            arr2(&[[1.0, -2.0]]),
            arr1(&[0.0]),
            arr1(&[0.0]),
            Some(parent),
        )
        .unwrap();
        let trace = z.substitution_trace(BoundSide::Lower);
        assert_eq!(trace.len(), 2);
        assert_eq!(trace[0], arr2(&[[1.0, -2.0]]));
        // Through the parent: pos part picks L (identity), neg part picks U (identity).
        assert_eq!(trace[1], arr2(&[[1.0, -2.0]]));
    }

    #[test]
    fn test_shape_mismatch_against_parent() {
        let root = PolygonBound::from_input(&arr1(&[0.5, 0.5]), 0.1).unwrap();
        let err = PolygonBound::new(
            Array2::zeros((1, 3)),
            Array2::zeros((1, 3)),
            arr1(&[0.0]),
            arr1(&[0.0]),
            Some(root),
        )
        .unwrap_err();
        assert!(matches!(err, PolyError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_shape_mismatch_between_sides() {
        let err = PolygonBound::new(
            Array2::zeros((2, 0)),
            Array2::zeros((1, 0)),
            arr1(&[0.0, 0.0]),
            arr1(&[0.0, 0.0]),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, PolyError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_inverted_interval_is_unsound() {
        let err = PolygonBound::new(
            Array2::zeros((2, 0)),
            Array2::zeros((2, 0)),
            arr1(&[0.0, 1.0]),
            arr1(&[0.5, 0.5]),
            None,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            PolyError::UnsoundBound { neuron: 1, .. }
        ));
    }

    #[test]
    fn test_non_finite_interval_is_unsound() {
        let root = PolygonBound::from_input(&arr1(&[0.5]), 0.5).unwrap();
        let err = PolygonBound::new(
            arr2(&[[f32::INFINITY]]),
            arr2(&[[f32::INFINITY]]),
            arr1(&[0.0]),
            arr1(&[0.0]),
            Some(root),
        )
        .unwrap_err();
        assert!(matches!(err, PolyError::UnsoundBound { neuron: 0, .. }));
    }

    #[test]
    fn test_ancestors_walk_to_root() {
        let z = unit_box();
        let sizes: Vec<usize> = z.ancestors().map(|p| p.num_inputs()).collect();
        assert_eq!(sizes, vec![2, 0]);
        assert!(z.ancestors().last().unwrap().is_root());
    }

    #[test]
    fn test_display_lists_every_neuron() {
        let text = unit_box().to_string();
        assert!(text.starts_with("PolygonBound("));
        assert!(text.contains("shape: (out=2, in=2)"));
        assert!(text.contains("o0 ∈ [0, 1]"));
        assert!(text.contains("o1 ≤ (0 × i0) + (1 × i1) + -0.25"));
        assert!(text.ends_with(')'));
    }
}

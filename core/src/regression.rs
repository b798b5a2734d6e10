//! Closed-form least squares and the L2 output regularizer.
//!
//! Convention: `x` is the regressor (the auxiliary cross-entropy output),
//! `y` the dependent variable (the chain output). Each column is fitted
//! independently: y[:, i] ~ scale[i] * x[:, i] + offset[i].

use tracing::{info, warn};

use crate::tensor::{Matrix, col_sums_f64, l1_norm_f64};
use crate::training::ChainDerivatives;

/// Relative size below which a column's regressor variance counts as zero.
const MIN_RELATIVE_VARIANCE: f64 = 1.0e-10;

/// Per-column affine fit.
#[derive(Clone, Debug, PartialEq)]
pub struct RegressionCoefficients {
    pub scale: Vec<f32>,
    pub offset: Vec<f32>,
    /// Columns whose regressor had (near) zero variance. Those get
    /// scale = 0 and offset = mean(y), the best constant fit.
    pub degenerate_dims: usize,
}

/// Fit `y ~ scale * x + offset` per column by least squares.
///
///   scale_i  = [sum(x*y) - sum(x)*sum(y)/n] / [sum(x^2) - sum(x)^2/n]
///   offset_i = sum(y)/n - scale_i * sum(x)/n
pub fn least_square_regression(x: &Matrix, y: &Matrix, verbose: u32) -> RegressionCoefficients {
    assert!(x.same_shape(y), "regression shapes differ: {:?} vs {:?}", x.shape(), y.shape());
    let (rows, cols) = x.shape();
    assert!(rows > 0, "regression needs at least one example");
    let n = rows as f64;

    let sx = col_sums_f64(&x.data, rows, cols);
    let sy = col_sums_f64(&y.data, rows, cols);
    let mut sxx = vec![0.0f64; cols];
    let mut sxy = vec![0.0f64; cols];
    for r in 0..rows {
        for (i, (&xv, &yv)) in x.row(r).iter().zip(y.row(r)).enumerate() {
            let (xv, yv) = (xv as f64, yv as f64);
            sxx[i] += xv * xv;
            sxy[i] += xv * yv;
        }
    }

    let mut scale = vec![0.0f64; cols];
    let mut offset = vec![0.0f64; cols];
    let mut degenerate_dims = 0;
    for i in 0..cols {
        let var_term = sxx[i] - sx[i] * sx[i] / n;
        if var_term > MIN_RELATIVE_VARIANCE * sxx[i].max(1.0) && var_term.is_finite() {
            scale[i] = (sxy[i] - sx[i] * sy[i] / n) / var_term;
            offset[i] = sy[i] / n - scale[i] * sx[i] / n;
        } else {
            degenerate_dims += 1;
            scale[i] = 0.0;
            offset[i] = sy[i] / n;
        }
    }

    if degenerate_dims > 0 {
        warn!(degenerate_dims, cols, "regressor has zero variance in some dimensions; using constant fit");
    }
    if verbose >= 1 {
        info!(
            "l1_norm(scale) = {:.6} l1_norm(offset) = {:.6}",
            l1_norm_f64(&scale),
            l1_norm_f64(&offset)
        );
    }

    RegressionCoefficients {
        scale: scale.into_iter().map(|v| v as f32).collect(),
        offset: offset.into_iter().map(|v| v as f32).collect(),
        degenerate_dims,
    }
}

/// L2 penalty on the chain output and its derivatives.
///
/// With `xent_output`, the target is the least-squares affine map of the
/// auxiliary output; without it the target is zero. For residual
/// d = nnet_output - target and per-dimension weights w (default 1,
/// floored at `f32::MIN_POSITIVE`):
///
///   l2_term            = -0.5 * coeff * sum_ji w_i * d_ji^2
///   nnet_output_deriv += -coeff * w_i * d_ji
///   xent_output_deriv += coeff * w_i * scale_i * d_ji
///
/// `coeff` is l2_regularize times the supervision weight. A non-finite
/// penalty is logged, returned as 0, and leaves the derivatives untouched.
pub fn compute_regularization_term(
    nnet_output: &Matrix,
    xent_output: Option<&Matrix>,
    dim_weights: Option<&[f32]>,
    coeff: f32,
    verbose: u32,
    derivs: &mut ChainDerivatives<'_>,
) -> f32 {
    let cols = nnet_output.num_cols();
    let weights: Vec<f32> = match dim_weights {
        Some(w) => {
            assert_eq!(w.len(), cols, "dimension weights must have one entry per output column");
            w.iter().map(|&v| v.max(f32::MIN_POSITIVE)).collect()
        }
        None => vec![1.0; cols],
    };

    let mut diff = nnet_output.clone();
    let coefficients = xent_output.map(|x| {
        let c = least_square_regression(x, nnet_output, verbose);
        for r in 0..diff.num_rows() {
            let x_row = x.row(r);
            for (i, d) in diff.row_mut(r).iter_mut().enumerate() {
                *d -= c.scale[i] * x_row[i] + c.offset[i];
            }
        }
        c
    });

    let mut weighted_sq = 0.0f64;
    for r in 0..diff.num_rows() {
        for (&d, &w) in diff.row(r).iter().zip(&weights) {
            weighted_sq += w as f64 * d as f64 * d as f64;
        }
    }
    let l2_term = -0.5 * coeff as f64 * weighted_sq;
    if !l2_term.is_finite() {
        warn!(l2_term, "l2 regularization term is not finite; ignoring it for this minibatch");
        return 0.0;
    }

    if let Some(main) = derivs.nnet_output_deriv.as_deref_mut() {
        for r in 0..diff.num_rows() {
            for ((g, &d), &w) in main.row_mut(r).iter_mut().zip(diff.row(r)).zip(&weights) {
                *g -= coeff * w * d;
            }
        }
    }
    if let (Some(aux), Some(c)) = (derivs.xent_output_deriv.as_deref_mut(), coefficients.as_ref()) {
        for r in 0..diff.num_rows() {
            for (i, g) in aux.row_mut(r).iter_mut().enumerate() {
                *g += coeff * weights[i] * c.scale[i] * diff.get(r, i);
            }
        }
    }

    l2_term as f32
}

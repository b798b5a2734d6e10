/// Gradient verification for the chain objective.
///
/// Provides:
/// - `objective_and_gradient`: objective (chain + L2) and its derivative w.r.t. the network output
/// - `finite_diff_output`: central finite differences for one output cell
/// - `check_output_gradient`: sampled comparison of the two

use crate::den_graph::DenominatorGraph;
use crate::options::ChainTrainingOptions;
use crate::supervision::Supervision;
use crate::tensor::Matrix;
use crate::training::{ChainDerivatives, compute_chain_objf_and_deriv};

/// Total objective (objf + l2_term) and its derivative w.r.t. `nnet_output`.
#[allow(dead_code)]
pub fn objective_and_gradient(
    opts: &ChainTrainingOptions,
    den_graph: &DenominatorGraph,
    supervision: &Supervision,
    nnet_output: &Matrix,
    xent_output: Option<&Matrix>,
) -> (f32, Matrix) {
    let mut grad = Matrix::zeros(nnet_output.num_rows(), nnet_output.num_cols());
    let res = compute_chain_objf_and_deriv(
        opts,
        den_graph,
        supervision,
        nnet_output,
        xent_output,
        &mut ChainDerivatives::main_only(&mut grad),
    );
    (res.objf + res.l2_term, grad)
}

#[allow(dead_code)]
fn objective_only(
    opts: &ChainTrainingOptions,
    den_graph: &DenominatorGraph,
    supervision: &Supervision,
    nnet_output: &Matrix,
    xent_output: Option<&Matrix>,
) -> f32 {
    let res = compute_chain_objf_and_deriv(
        opts,
        den_graph,
        supervision,
        nnet_output,
        xent_output,
        &mut ChainDerivatives::none(),
    );
    res.objf + res.l2_term
}

/// Central difference (f(y+eps) - f(y-eps)) / (2*eps) at output cell `idx`.
#[allow(dead_code)]
pub fn finite_diff_output(
    opts: &ChainTrainingOptions,
    den_graph: &DenominatorGraph,
    supervision: &Supervision,
    nnet_output: &Matrix,
    xent_output: Option<&Matrix>,
    idx: usize,
    eps: f32,
) -> f32 {
    let orig = nnet_output.data[idx];

    let mut plus = nnet_output.clone();
    plus.data[idx] = orig + eps;
    let f_plus = objective_only(opts, den_graph, supervision, &plus, xent_output);

    let mut minus = nnet_output.clone();
    minus.data[idx] = orig - eps;
    let f_minus = objective_only(opts, den_graph, supervision, &minus, xent_output);

    (f_plus - f_minus) / (2.0 * eps)
}

/// Compare `grad` against finite differences at up to `num_samples` evenly
/// spaced output cells. Returns (num_checked, num_passed, max_relative_error).
///
/// Cells where both values are below `abs_threshold` pass automatically;
/// they are under what f32 finite differences can resolve.
#[allow(dead_code)]
pub(crate) fn check_output_gradient(
    opts: &ChainTrainingOptions,
    den_graph: &DenominatorGraph,
    supervision: &Supervision,
    nnet_output: &Matrix,
    xent_output: Option<&Matrix>,
    grad: &Matrix,
    num_samples: usize,
    eps: f32,
    tol: f32,
) -> (usize, usize, f32) {
    let n = nnet_output.data.len();
    let abs_threshold = 5e-4;

    let step = if n > num_samples { n / num_samples } else { 1 };
    let mut checked = 0;
    let mut passed = 0;
    let mut max_rel_err = 0.0f32;

    for idx in (0..n).step_by(step).take(num_samples) {
        let analytical = grad.data[idx];
        let numerical =
            finite_diff_output(opts, den_graph, supervision, nnet_output, xent_output, idx, eps);

        let denom = analytical.abs().max(numerical.abs());
        checked += 1;
        if denom < abs_threshold {
            passed += 1;
            continue;
        }

        let rel_err = (analytical - numerical).abs() / denom;
        max_rel_err = max_rel_err.max(rel_err);
        if rel_err < tol {
            passed += 1;
        } else {
            eprintln!(
                "  FAIL output[{idx}]: analytical={analytical:.6e}, numerical={numerical:.6e}, \
                 rel_err={rel_err:.4e}"
            );
        }
    }

    (checked, passed, max_rel_err)
}

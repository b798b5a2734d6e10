/// Chain objective and derivatives for one minibatch.
///
/// The numerator pass (supervision paths) and the denominator pass (all
/// paths through the leaky HMM) are combined into
///   objf = num_logprob_weighted - supervision.weight * den_logprob
/// with derivative
///   d objf / d nnet_output = weight * (numerator posterior - denominator occupation).
///
/// `weight` is the normalizer callers divide by to report per-frame values.
/// Numerical failure never escapes: the objective falls back to
/// DEFAULT_OBJF_PER_FRAME per frame and derivatives are zeroed.

use tracing::{info, warn};

use crate::den_graph::DenominatorGraph;
use crate::denominator::DenominatorComputation;
use crate::numerator::NumeratorComputation;
use crate::options::ChainTrainingOptions;
use crate::regression::compute_regularization_term;
use crate::supervision::Supervision;
use crate::tensor::{Matrix, frobenius_dot_f32};

/// Objective assigned per frame when a minibatch fails numerically.
pub const DEFAULT_OBJF_PER_FRAME: f32 = -10.0;

/// Numerator side of the objective.
pub trait NumeratorPass {
    /// Weighted total log-prob of the supervision paths.
    fn forward(&mut self) -> f32;
    /// Add weighted posteriors to `nnet_output_deriv`. Call after `forward`.
    fn backward(&mut self, nnet_output_deriv: &mut Matrix);
}

/// Denominator side of the objective.
pub trait DenominatorPass {
    /// Unweighted total log-prob over all sequences; NaN if the input was unusable.
    fn forward(&mut self) -> f32;
    /// Add `deriv_scale * occupation` to `nnet_output_deriv`. Returns false
    /// when the pass judged itself numerically unreliable.
    fn backward(&mut self, deriv_scale: f32, nnet_output_deriv: &mut Matrix) -> bool;
}

/// Output slots for the derivatives. `None` means not requested.
///
/// Any slot that is present is overwritten (zeroed, then accumulated into).
#[derive(Debug, Default)]
pub struct ChainDerivatives<'a> {
    pub nnet_output_deriv: Option<&'a mut Matrix>,
    pub xent_output_deriv: Option<&'a mut Matrix>,
}

impl<'a> ChainDerivatives<'a> {
    pub fn none() -> Self {
        ChainDerivatives::default()
    }

    pub fn main_only(nnet_output_deriv: &'a mut Matrix) -> Self {
        ChainDerivatives { nnet_output_deriv: Some(nnet_output_deriv), xent_output_deriv: None }
    }

    pub fn both(nnet_output_deriv: &'a mut Matrix, xent_output_deriv: &'a mut Matrix) -> Self {
        ChainDerivatives {
            nnet_output_deriv: Some(nnet_output_deriv),
            xent_output_deriv: Some(xent_output_deriv),
        }
    }
}

/// Scalars produced by one objective computation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChainObjective {
    /// Chain objective, not yet normalized by `weight`.
    pub objf: f32,
    /// Regularization term (<= 0), also unnormalized. Zero if disabled.
    pub l2_term: f32,
    /// supervision.weight * num_sequences * frames_per_sequence.
    pub weight: f32,
    /// True if the numerical fallback replaced the objective.
    pub failed: bool,
}

impl ChainObjective {
    /// (objf + l2_term) / weight, or 0 for zero weight.
    pub fn per_frame(&self) -> f32 {
        if self.weight != 0.0 {
            (self.objf + self.l2_term) / self.weight
        } else {
            0.0
        }
    }
}

/// Compute the chain objective and, for each requested slot, its derivative.
///
/// `nnet_output` has `num_sequences * frames_per_sequence` rows ordered
/// frame-major (all sequences' frame 0, then frame 1, ...) and one column
/// per pdf. `xent_output`, if given, is the auxiliary output of the same
/// shape; it only feeds the L2 regression target.
pub fn compute_chain_objf_and_deriv(
    opts: &ChainTrainingOptions,
    den_graph: &DenominatorGraph,
    supervision: &Supervision,
    nnet_output: &Matrix,
    xent_output: Option<&Matrix>,
    derivs: &mut ChainDerivatives<'_>,
) -> ChainObjective {
    let numerator = NumeratorComputation::new(supervision, nnet_output);
    let denominator =
        DenominatorComputation::new(opts, den_graph, supervision.num_sequences, nnet_output);
    let mut result = run_chain_passes(opts, supervision, nnet_output, numerator, denominator, derivs);
    apply_regularization(opts, supervision, nnet_output, xent_output, &mut result, derivs);
    result
}

/// Combination, failure handling and diagnostics shared by every pass
/// implementation. The returned `l2_term` is always 0; see `apply_regularization`.
pub fn run_chain_passes<N: NumeratorPass, D: DenominatorPass>(
    opts: &ChainTrainingOptions,
    supervision: &Supervision,
    nnet_output: &Matrix,
    mut numerator: N,
    mut denominator: D,
    derivs: &mut ChainDerivatives<'_>,
) -> ChainObjective {
    for slot in [derivs.nnet_output_deriv.as_deref_mut(), derivs.xent_output_deriv.as_deref_mut()]
        .into_iter()
        .flatten()
    {
        assert!(
            slot.same_shape(nnet_output),
            "derivative shape {:?} != network output shape {:?}",
            slot.shape(),
            nnet_output.shape()
        );
        slot.set_zero();
    }

    let num_logprob_weighted = numerator.forward();
    match (derivs.nnet_output_deriv.as_deref_mut(), derivs.xent_output_deriv.as_deref_mut()) {
        (Some(main), xent) => {
            numerator.backward(main);
            if let Some(xent) = xent {
                xent.copy_from(main);
            }
        }
        (None, Some(xent)) => numerator.backward(xent),
        (None, None) => {}
    }

    let den_logprob = denominator.forward();
    let den_ok = match derivs.nnet_output_deriv.as_deref_mut() {
        Some(main) => denominator.backward(-supervision.weight, main),
        None => true,
    };

    let weight = supervision.weight
        * supervision.num_sequences as f32
        * supervision.frames_per_sequence as f32;
    let mut objf = num_logprob_weighted - supervision.weight * den_logprob;

    let failed = !objf.is_finite() || !den_ok;
    if failed {
        for slot in [derivs.nnet_output_deriv.as_deref_mut(), derivs.xent_output_deriv.as_deref_mut()]
            .into_iter()
            .flatten()
        {
            slot.set_zero();
        }
        warn!(
            objf,
            num_logprob_weighted,
            den_logprob,
            den_ok,
            "objective is not usable; setting it to {} per frame and zeroing derivatives",
            DEFAULT_OBJF_PER_FRAME
        );
        objf = DEFAULT_OBJF_PER_FRAME * weight;
    }

    if opts.verbose >= 1 {
        if let Some(main) = derivs.nnet_output_deriv.as_deref() {
            let profile = derivative_frame_profile(
                main,
                supervision.num_sequences,
                supervision.frames_per_sequence,
            );
            info!(?profile, "mean squared derivative per frame position");
        }
    }

    ChainObjective { objf, l2_term: 0.0, weight, failed }
}

/// Add the L2 output penalty to `result` and its derivatives to `derivs`.
/// No-op when `l2_regularize` is 0 or the fallback already fired.
pub fn apply_regularization(
    opts: &ChainTrainingOptions,
    supervision: &Supervision,
    nnet_output: &Matrix,
    xent_output: Option<&Matrix>,
    result: &mut ChainObjective,
    derivs: &mut ChainDerivatives<'_>,
) {
    if opts.l2_regularize == 0.0 || result.failed {
        return;
    }
    if let Some(x) = xent_output {
        assert!(
            x.same_shape(nnet_output),
            "auxiliary output shape {:?} != network output shape {:?}",
            x.shape(),
            nnet_output.shape()
        );
    }
    result.l2_term = compute_regularization_term(
        nnet_output,
        xent_output,
        None,
        opts.l2_regularize * supervision.weight,
        opts.verbose,
        derivs,
    );
}

/// Per frame position, the squared derivative summed over pdfs and
/// averaged over sequences. Row `t * num_sequences + s` is frame t of
/// sequence s.
pub fn derivative_frame_profile(
    deriv: &Matrix,
    num_sequences: usize,
    frames_per_sequence: usize,
) -> Vec<f32> {
    assert_eq!(deriv.num_rows(), num_sequences * frames_per_sequence);
    let mut profile = vec![0.0f64; frames_per_sequence];
    for r in 0..deriv.num_rows() {
        let sq: f64 = deriv.row(r).iter().map(|&v| v as f64 * v as f64).sum();
        profile[r / num_sequences] += sq;
    }
    profile.into_iter().map(|v| (v / num_sequences as f64) as f32).collect()
}

/// Output of `process_chain_output`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChainOutputStats {
    pub chain: ChainObjective,
    /// Cross-entropy objective of the auxiliary output against the
    /// numerator posteriors (weighted). `None` unless xent is in use.
    pub xent_objf: Option<f32>,
}

/// Run the objective as a trainer does for one chain output.
///
/// When `xent_regularize` is nonzero and `xent_output` (log-softmax) is
/// given, the auxiliary derivative is needed for the cross-entropy
/// objective; a scratch buffer is used if the caller did not supply one.
/// A caller-supplied auxiliary derivative comes back scaled by
/// `xent_regularize`, with the regression part of the L2 penalty added
/// afterwards.
pub fn process_chain_output(
    opts: &ChainTrainingOptions,
    den_graph: &DenominatorGraph,
    supervision: &Supervision,
    nnet_output: &Matrix,
    xent_output: Option<&Matrix>,
    derivs: &mut ChainDerivatives<'_>,
) -> ChainOutputStats {
    let xent_output = if opts.use_xent() { xent_output } else { None };

    let mut scratch = None;
    let caller_xent = derivs.xent_output_deriv.is_some();
    let mut local = ChainDerivatives {
        nnet_output_deriv: derivs.nnet_output_deriv.as_deref_mut(),
        xent_output_deriv: match (derivs.xent_output_deriv.as_deref_mut(), xent_output) {
            (Some(d), _) => Some(d),
            (None, Some(x)) => Some(&mut *scratch.insert(Matrix::zeros(x.num_rows(), x.num_cols()))),
            (None, None) => None,
        },
    };

    let numerator = NumeratorComputation::new(supervision, nnet_output);
    let denominator =
        DenominatorComputation::new(opts, den_graph, supervision.num_sequences, nnet_output);
    let mut chain = run_chain_passes(opts, supervision, nnet_output, numerator, denominator, &mut local);

    let mut xent_objf = None;
    if let (Some(x), Some(xent_deriv)) = (xent_output, local.xent_output_deriv.as_deref_mut()) {
        xent_objf = Some(frobenius_dot_f32(&x.data, &xent_deriv.data) as f32);
        if caller_xent {
            for v in xent_deriv.data.iter_mut() {
                *v *= opts.xent_regularize;
            }
        }
    }
    if !caller_xent {
        local.xent_output_deriv = None;
    }

    apply_regularization(opts, supervision, nnet_output, xent_output, &mut chain, &mut local);
    ChainOutputStats { chain, xent_objf }
}

/// Denominator forward-backward over the leaky HMM.
///
/// All sequences of the minibatch advance in lock-step, one frame at a time.
/// Probabilities (not log-probs) are used, renormalized every frame by the
/// previous frame's total so nothing over- or underflows; the logs of those
/// normalizers are added back into the total log-prob.
///
/// Per sequence, with x(t, p) = exp(clamp(y[t, p], -30, 30)):
///   alpha(0, h)    = init(h)
///   tot(t)         = sum_h alpha(t, h)
///   alpha'(t, h)   = alpha(t, h) + leaky * tot(t) * init(h)
///   alpha(t+1, h)  = sum_{i->h, p, w} alpha'(t, i) * w * x(t, p) / tot(t)
///   logprob        = sum_{t<T} ln tot(t) + ln sum_h alpha'(T, h)
///
/// Backward reuses the same normalizers:
///   beta'(T, h)    = 1 / sum_h alpha'(T, h)
///   beta(t, i)     = beta'(t, i) + leaky * sum_h init(h) * beta'(t, h)
///   beta'(t, i)    = sum_{i->h, p, w} w * x(t, p) * beta(t+1, h) / tot(t)
///   occupation     = alpha'(t, i) * w * x(t, p) * beta(t+1, h) / tot(t)
/// so sum_i alpha'(t, i) * beta'(t, i) == 1 for every frame; deviation from
/// that is the numerical-health check.

use tracing::{debug, warn};

use crate::den_graph::DenominatorGraph;
use crate::options::ChainTrainingOptions;
use crate::tensor::Matrix;
use crate::training::DenominatorPass;

/// Network outputs are clamped to this magnitude before exponentiation.
const MAX_NNET_OUTPUT: f32 = 30.0;

/// Relative error in the per-frame alpha-beta product that triggers a warning.
const ALPHA_BETA_REL_TOLERANCE: f64 = 1.0e-3;

/// Absolute error (summed over sequences) past which the minibatch is abandoned.
const ALPHA_BETA_ABANDON: f64 = 2.0;

pub struct DenominatorComputation<'a> {
    den_graph: &'a DenominatorGraph,
    nnet_output: &'a Matrix,
    leaky_hmm_coefficient: f64,
    num_sequences: usize,
    frames_per_sequence: usize,
    num_pdfs: usize,
    /// exp of clamped output: [rows, num_pdfs].
    exp_output: Vec<f64>,
    /// alpha': [(T+1) * S * N], index (t * S + s) * N + h.
    alpha_dash: Vec<f64>,
    /// tot: [(T+1) * S], index t * S + s.
    tot: Vec<f64>,
    input_finite: bool,
    forward_done: bool,
}

impl<'a> DenominatorComputation<'a> {
    pub fn new(
        opts: &ChainTrainingOptions,
        den_graph: &'a DenominatorGraph,
        num_sequences: usize,
        nnet_output: &'a Matrix,
    ) -> Self {
        assert!(
            opts.leaky_hmm_coefficient > 0.0 && opts.leaky_hmm_coefficient < 1.0,
            "leaky_hmm_coefficient must be in (0, 1), got {}",
            opts.leaky_hmm_coefficient
        );
        assert!(num_sequences > 0, "num_sequences must be positive");
        assert_eq!(
            nnet_output.num_cols(),
            den_graph.num_pdfs(),
            "network output columns must equal the denominator graph's pdf count"
        );
        assert_eq!(
            nnet_output.num_rows() % num_sequences,
            0,
            "network output rows ({}) not divisible by num_sequences ({num_sequences})",
            nnet_output.num_rows()
        );

        let input_finite = nnet_output.is_finite();
        if !input_finite {
            warn!("non-finite value in network output; denominator will report failure");
        }
        let exp_output = nnet_output
            .data
            .iter()
            .map(|&v| (v.clamp(-MAX_NNET_OUTPUT, MAX_NNET_OUTPUT) as f64).exp())
            .collect();

        DenominatorComputation {
            den_graph,
            nnet_output,
            leaky_hmm_coefficient: opts.leaky_hmm_coefficient as f64,
            num_sequences,
            frames_per_sequence: nnet_output.num_rows() / num_sequences,
            num_pdfs: nnet_output.num_cols(),
            exp_output,
            alpha_dash: Vec::new(),
            tot: Vec::new(),
            input_finite,
            forward_done: false,
        }
    }

    #[inline]
    fn x(&self, t: usize, s: usize, pdf: usize) -> f64 {
        self.exp_output[(t * self.num_sequences + s) * self.num_pdfs + pdf]
    }

    /// Fill alpha'(t, s, ·) from alpha(t, s, ·) already stored in that slot,
    /// recording tot(t, s).
    fn apply_leak(&mut self, t: usize, s: usize) {
        let n = self.den_graph.num_states();
        let base = (t * self.num_sequences + s) * n;
        let tot: f64 = self.alpha_dash[base..base + n].iter().sum();
        self.tot[t * self.num_sequences + s] = tot;
        let leak = self.leaky_hmm_coefficient * tot;
        for (a, &init) in self.alpha_dash[base..base + n].iter_mut().zip(self.den_graph.initial_probs()) {
            *a += leak * init;
        }
    }
}

impl DenominatorPass for DenominatorComputation<'_> {
    fn forward(&mut self) -> f32 {
        if !self.input_finite {
            return f32::NAN;
        }
        let n = self.den_graph.num_states();
        let ns = self.num_sequences;
        let big_t = self.frames_per_sequence;
        self.alpha_dash = vec![0.0f64; (big_t + 1) * ns * n];
        self.tot = vec![0.0f64; (big_t + 1) * ns];

        for s in 0..ns {
            let base = s * n;
            self.alpha_dash[base..base + n].copy_from_slice(self.den_graph.initial_probs());
            self.apply_leak(0, s);
        }

        for t in 0..big_t {
            for s in 0..ns {
                let inv_tot = 1.0 / self.tot[t * ns + s];
                let prev = (t * ns + s) * n;
                let next = ((t + 1) * ns + s) * n;
                for h in 0..n {
                    let mut sum = 0.0f64;
                    for tr in self.den_graph.incoming(h) {
                        sum += self.alpha_dash[prev + tr.other] * tr.prob * self.x(t, s, tr.pdf_id);
                    }
                    self.alpha_dash[next + h] = sum * inv_tot;
                }
                self.apply_leak(t + 1, s);
            }
        }

        let mut log_prob = 0.0f64;
        for s in 0..ns {
            for t in 0..big_t {
                log_prob += self.tot[t * ns + s].ln();
            }
            let last = (big_t * ns + s) * n;
            let final_sum: f64 = self.alpha_dash[last..last + n].iter().sum();
            log_prob += final_sum.ln();
        }
        self.forward_done = true;
        log_prob as f32
    }

    fn backward(&mut self, deriv_scale: f32, nnet_output_deriv: &mut Matrix) -> bool {
        assert!(
            nnet_output_deriv.same_shape(self.nnet_output),
            "derivative shape {:?} != network output shape {:?}",
            nnet_output_deriv.shape(),
            self.nnet_output.shape()
        );
        if !self.input_finite {
            return false;
        }
        assert!(self.forward_done, "denominator backward called before forward");

        let n = self.den_graph.num_states();
        let ns = self.num_sequences;
        let big_t = self.frames_per_sequence;
        let init = self.den_graph.initial_probs();
        let scale = deriv_scale as f64;
        let mut ok = true;

        // beta' for the frame being produced, beta for the frame after it.
        let mut beta_dash = vec![0.0f64; ns * n];
        let mut beta_next = vec![0.0f64; ns * n];
        for s in 0..ns {
            let last = (big_t * ns + s) * n;
            let final_sum: f64 = self.alpha_dash[last..last + n].iter().sum();
            beta_dash[s * n..(s + 1) * n].fill(1.0 / final_sum);
        }

        for t in (0..big_t).rev() {
            for s in 0..ns {
                let bd = &beta_dash[s * n..(s + 1) * n];
                let leak: f64 = self.leaky_hmm_coefficient
                    * bd.iter().zip(init).map(|(b, i)| b * i).sum::<f64>();
                for (bn, &b) in beta_next[s * n..(s + 1) * n].iter_mut().zip(bd) {
                    *bn = b + leak;
                }
            }

            let mut alpha_beta = 0.0f64;
            for s in 0..ns {
                let inv_tot = 1.0 / self.tot[t * ns + s];
                let row = t * ns + s;
                let a_base = (t * ns + s) * n;
                for i in 0..n {
                    let a = self.alpha_dash[a_base + i];
                    let mut sum = 0.0f64;
                    for tr in self.den_graph.outgoing(i) {
                        let contrib = tr.prob * self.x(t, s, tr.pdf_id) * beta_next[s * n + tr.other] * inv_tot;
                        sum += contrib;
                        let occupation = a * contrib;
                        if occupation != 0.0 {
                            nnet_output_deriv.add_at(row, tr.pdf_id, (scale * occupation) as f32);
                        }
                    }
                    beta_dash[s * n + i] = sum;
                    alpha_beta += a * sum;
                }
            }

            let expected = ns as f64;
            let abs_err = (alpha_beta - expected).abs();
            if !(abs_err <= ALPHA_BETA_REL_TOLERANCE * expected) {
                warn!(
                    frame = t,
                    alpha_beta,
                    expected,
                    "denominator alpha-beta product deviates from the sequence count"
                );
                if !(abs_err <= ALPHA_BETA_ABANDON) {
                    warn!("excessive alpha-beta error, abandoning this minibatch");
                    ok = false;
                }
            } else {
                debug!(frame = t, alpha_beta, "denominator alpha-beta check");
            }
        }
        ok
    }
}

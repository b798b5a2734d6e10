/// Numerator forward-backward over the supervision path graph.
///
/// Log-space throughout (f64). Arcs are visited in order of their source
/// state's frame, which is a topological order because every arc advances
/// time by exactly one frame.
///
/// Forward:
///   alpha[start] = 0
///   alpha[dst]  = logsumexp over arcs (alpha[src] + log_prob + y[row(t), pdf])
///   logprob     = logsumexp over finals (alpha[f] + final_log_prob[f])
/// Backward mirrors it with beta; arc posterior is
///   exp(alpha[src] + score + beta[dst] - logprob).
///
/// Both the returned log-prob and the derivative include supervision.weight.

use crate::supervision::Supervision;
use crate::tensor::{Matrix, log_add_exp, log_sum_exp};
use crate::training::NumeratorPass;

pub struct NumeratorComputation<'a> {
    supervision: &'a Supervision,
    nnet_output: &'a Matrix,
    /// Reachable arc indices sorted by source frame, limited to frames inside the output.
    arc_order: Vec<usize>,
    /// Network-output row for each arc (valid for arcs in `arc_order`).
    arc_rows: Vec<usize>,
    alpha: Vec<f64>,
    tot_log_prob: f64,
    forward_done: bool,
}

impl<'a> NumeratorComputation<'a> {
    pub fn new(supervision: &'a Supervision, nnet_output: &'a Matrix) -> Self {
        assert_eq!(
            nnet_output.num_rows(),
            supervision.num_frames(),
            "network output rows must equal num_sequences * frames_per_sequence"
        );
        assert_eq!(
            nnet_output.num_cols(),
            supervision.label_dim,
            "network output columns must equal the supervision label dimension"
        );

        let arcs = supervision.graph().arcs();
        let mut arc_rows = vec![0usize; arcs.len()];
        let mut keyed: Vec<(usize, usize)> = Vec::with_capacity(arcs.len());
        let num_frames = supervision.num_frames();
        for (i, arc) in arcs.iter().enumerate() {
            match supervision.state_time(arc.src) {
                Some(t) if t < num_frames => {
                    arc_rows[i] = supervision.frame_to_row(t);
                    keyed.push((t, i));
                }
                _ => {}
            }
        }
        keyed.sort_unstable();
        let arc_order = keyed.into_iter().map(|(_, i)| i).collect();

        NumeratorComputation {
            supervision,
            nnet_output,
            arc_order,
            arc_rows,
            alpha: Vec::new(),
            tot_log_prob: f64::NEG_INFINITY,
            forward_done: false,
        }
    }

    #[inline]
    fn arc_score(&self, i: usize) -> f64 {
        let arc = &self.supervision.graph().arcs()[i];
        arc.log_prob as f64 + self.nnet_output.get(self.arc_rows[i], arc.pdf_id) as f64
    }

    /// Unweighted total log-prob of the supervision paths.
    pub fn tot_log_prob(&self) -> f64 {
        self.tot_log_prob
    }
}

impl NumeratorPass for NumeratorComputation<'_> {
    fn forward(&mut self) -> f32 {
        let graph = self.supervision.graph();
        let arcs = graph.arcs();
        let n = graph.num_states();

        let mut alpha = vec![f64::NEG_INFINITY; n];
        alpha[graph.start()] = 0.0;
        for &i in &self.arc_order {
            let arc = &arcs[i];
            let cand = alpha[arc.src] + self.arc_score(i);
            alpha[arc.dst] = log_add_exp(alpha[arc.dst], cand);
        }

        let finals: Vec<f64> = (0..n)
            .filter(|&s| graph.is_final(s))
            .map(|s| alpha[s] + graph.final_log_prob(s) as f64)
            .collect();
        self.tot_log_prob = log_sum_exp(&finals);
        self.alpha = alpha;
        self.forward_done = true;

        (self.supervision.weight as f64 * self.tot_log_prob) as f32
    }

    fn backward(&mut self, nnet_output_deriv: &mut Matrix) {
        assert!(self.forward_done, "numerator backward called before forward");
        assert!(
            nnet_output_deriv.same_shape(self.nnet_output),
            "derivative shape {:?} != network output shape {:?}",
            nnet_output_deriv.shape(),
            self.nnet_output.shape()
        );
        if !self.tot_log_prob.is_finite() {
            // No usable path; the caller's failure check handles this.
            return;
        }

        let graph = self.supervision.graph();
        let arcs = graph.arcs();
        let mut beta: Vec<f64> = (0..graph.num_states())
            .map(|s| if graph.is_final(s) { graph.final_log_prob(s) as f64 } else { f64::NEG_INFINITY })
            .collect();

        let weight = self.supervision.weight as f64;
        for &i in self.arc_order.iter().rev() {
            let arc = &arcs[i];
            let score = self.arc_score(i);
            let through = score + beta[arc.dst];
            beta[arc.src] = log_add_exp(beta[arc.src], through);

            let log_post = self.alpha[arc.src] + through - self.tot_log_prob;
            if log_post > f64::NEG_INFINITY {
                nnet_output_deriv.add_at(self.arc_rows[i], arc.pdf_id, (weight * log_post.exp()) as f32);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervision::PathGraph;

    fn log_softmax_rows(m: &mut Matrix) {
        for r in 0..m.num_rows() {
            let row: Vec<f64> = m.row(r).iter().map(|&v| v as f64).collect();
            let lse = log_sum_exp(&row);
            for v in m.row_mut(r) {
                *v = (*v as f64 - lse) as f32;
            }
        }
    }

    #[test]
    fn test_single_path_logprob_is_sum_of_scores() {
        let sup = Supervision::from_alignment(&[0, 1, 1], 2, 1.0).unwrap();
        let out = Matrix::from_vec(3, 2, vec![0.5, -1.0, 2.0, 0.25, -3.0, 1.5]);
        let mut num = NumeratorComputation::new(&sup, &out);
        let lp = num.forward();
        assert!((lp - (0.5 + 0.25 + 1.5)).abs() < 1e-6, "lp={lp}");

        let mut deriv = Matrix::zeros(3, 2);
        num.backward(&mut deriv);
        assert_eq!(deriv.data, vec![1.0, 0.0, 0.0, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn test_weight_scales_logprob_and_posteriors() {
        let sup = Supervision::from_allowed_pdfs(&[vec![0, 1], vec![1]], 2, 0.5).unwrap();
        let out = Matrix::from_vec(2, 2, vec![0.0, 0.0, 0.3, 0.7]);
        let mut num = NumeratorComputation::new(&sup, &out);
        let lp = num.forward();
        let expected = 0.5 * ((2.0f64).ln() + 0.7);
        assert!((lp as f64 - expected).abs() < 1e-6, "lp={lp} expected={expected}");

        let mut deriv = Matrix::zeros(2, 2);
        num.backward(&mut deriv);
        assert!((deriv.get(0, 0) - 0.25).abs() < 1e-6);
        assert!((deriv.get(0, 1) - 0.25).abs() < 1e-6);
        assert!((deriv.get(1, 1) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_posteriors_sum_to_weight_per_frame() {
        let allowed = vec![vec![0, 1, 2], vec![1, 2], vec![0, 2], vec![0, 1, 2]];
        let sup = Supervision::from_allowed_pdfs(&allowed, 3, 1.5).unwrap();
        let mut out = Matrix::from_vec(4, 3, vec![0.1, -0.4, 0.9, 1.2, 0.0, -0.3, 0.5, 0.5, -1.0, 0.0, 2.0, -2.0]);
        log_softmax_rows(&mut out);
        let mut num = NumeratorComputation::new(&sup, &out);
        num.forward();
        let mut deriv = Matrix::zeros(4, 3);
        num.backward(&mut deriv);
        for r in 0..4 {
            let s: f32 = deriv.row(r).iter().sum();
            assert!((s - 1.5).abs() < 1e-5, "row {r} sums to {s}");
        }
    }

    #[test]
    fn test_two_sequences_use_interleaved_rows() {
        let a = Supervision::from_alignment(&[0, 0], 2, 1.0).unwrap();
        let b = Supervision::from_alignment(&[1, 1], 2, 1.0).unwrap();
        let sup = Supervision::merge(&[a, b]).unwrap();
        // Rows: (t0,s0), (t0,s1), (t1,s0), (t1,s1)
        let out = Matrix::from_vec(4, 2, vec![1.0, 0.0, 0.0, 2.0, 3.0, 0.0, 0.0, 4.0]);
        let mut num = NumeratorComputation::new(&sup, &out);
        assert!((num.forward() - 10.0).abs() < 1e-6);
        let mut deriv = Matrix::zeros(4, 2);
        num.backward(&mut deriv);
        assert_eq!(deriv.data, vec![1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_final_and_arc_log_probs_count() {
        let mut g = PathGraph::new(2, 0);
        g.add_arc(0, 1, 0, -0.5);
        g.set_final(1, -0.25);
        let sup = Supervision::new(g, 1.0, 1, 1, 1).unwrap();
        let out = Matrix::from_vec(1, 1, vec![2.0]);
        let mut num = NumeratorComputation::new(&sup, &out);
        assert!((num.forward() - 1.25).abs() < 1e-6);
    }

    #[test]
    fn test_dead_end_branch_gets_no_posterior() {
        let mut g = PathGraph::new(4, 0);
        g.add_arc(0, 1, 0, 0.0);
        g.add_arc(1, 2, 0, 0.0);
        g.add_arc(1, 3, 1, 0.0);
        g.set_final(2, 0.0);
        let sup = Supervision::new(g, 1.0, 1, 2, 2).unwrap();
        let out = Matrix::from_vec(2, 2, vec![0.5, 0.0, 1.0, 3.0]);
        let mut num = NumeratorComputation::new(&sup, &out);
        assert!((num.forward() - 1.5).abs() < 1e-6);
        let mut deriv = Matrix::zeros(2, 2);
        num.backward(&mut deriv);
        assert_eq!(deriv.data, vec![1.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_infinite_output_on_path() {
        let sup = Supervision::from_alignment(&[0, 1], 2, 1.0).unwrap();
        let out = Matrix::from_vec(2, 2, vec![f32::INFINITY, 0.0, 0.0, 0.0]);
        let mut num = NumeratorComputation::new(&sup, &out);
        assert!(!num.forward().is_finite());
        let mut deriv = Matrix::zeros(2, 2);
        num.backward(&mut deriv);
        assert!(deriv.data.iter().all(|&v| v == 0.0));
    }
}

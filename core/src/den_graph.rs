/// Denominator graph: the HMM over all competing hypotheses.
///
/// Built once from an arc list (the compiled denominator FST) and then shared
/// read-only by every minibatch. Transitions are grouped per state twice:
/// outgoing (used by the backward pass) and incoming (used by the forward
/// pass), so both recursions walk a contiguous slice per state.
///
/// All states are treated as final with probability one; the leaky-HMM
/// initial probabilities stand in for a start distribution.

use crate::error::ChainError;

/// Number of HMM iterations averaged when estimating initial probabilities.
const INITIAL_PROB_ITERS: usize = 100;

/// One arc of the input graph: `src -> dst`, emitting `pdf_id`, with
/// transition probability `prob` (not a log-prob, not a cost).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GraphArc {
    pub src: usize,
    pub dst: usize,
    pub pdf_id: usize,
    pub prob: f32,
}

/// A compiled transition seen from one endpoint. `other` is the destination
/// for outgoing lists and the source for incoming lists.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Transition {
    pub other: usize,
    pub pdf_id: usize,
    pub prob: f64,
}

#[derive(Clone, Debug)]
pub struct DenominatorGraph {
    num_states: usize,
    num_pdfs: usize,
    outgoing: Vec<Transition>,
    /// outgoing[out_ranges[s]..out_ranges[s+1]] leave state s.
    out_ranges: Vec<usize>,
    incoming: Vec<Transition>,
    in_ranges: Vec<usize>,
    initial_probs: Vec<f64>,
}

impl DenominatorGraph {
    /// Compile an arc list into transition tables.
    ///
    /// `num_pdfs` must equal the column count of every network output this
    /// graph is used with.
    pub fn new(
        num_states: usize,
        start_state: usize,
        arcs: &[GraphArc],
        num_pdfs: usize,
    ) -> Result<Self, ChainError> {
        if num_states == 0 {
            return Err(ChainError::EmptyGraph);
        }
        if start_state >= num_states {
            return Err(ChainError::StateOutOfRange { state: start_state, num_states });
        }
        for arc in arcs {
            for state in [arc.src, arc.dst] {
                if state >= num_states {
                    return Err(ChainError::StateOutOfRange { state, num_states });
                }
            }
            if arc.pdf_id >= num_pdfs {
                return Err(ChainError::PdfOutOfRange { pdf_id: arc.pdf_id, num_pdfs });
            }
            if !(arc.prob > 0.0 && arc.prob.is_finite()) {
                return Err(ChainError::BadTransitionProb(arc.prob));
            }
        }

        let (outgoing, out_ranges) = group_by_state(num_states, arcs, |a| (a.src, a.dst));
        let (incoming, in_ranges) = group_by_state(num_states, arcs, |a| (a.dst, a.src));

        let mut graph = DenominatorGraph {
            num_states,
            num_pdfs,
            outgoing,
            out_ranges,
            incoming,
            in_ranges,
            initial_probs: Vec::new(),
        };
        graph.initial_probs = graph.estimate_initial_probs(start_state);
        Ok(graph)
    }

    pub fn num_states(&self) -> usize {
        self.num_states
    }

    pub fn num_pdfs(&self) -> usize {
        self.num_pdfs
    }

    pub fn num_arcs(&self) -> usize {
        self.outgoing.len()
    }

    /// Initial state distribution; sums to one.
    pub fn initial_probs(&self) -> &[f64] {
        &self.initial_probs
    }

    pub fn outgoing(&self, state: usize) -> &[Transition] {
        &self.outgoing[self.out_ranges[state]..self.out_ranges[state + 1]]
    }

    pub fn incoming(&self, state: usize) -> &[Transition] {
        &self.incoming[self.in_ranges[state]..self.in_ranges[state + 1]]
    }

    /// Run the HMM from the start state for a fixed number of iterations,
    /// renormalizing every step (outgoing mass need not sum to one), and
    /// average the state distributions seen along the way.
    fn estimate_initial_probs(&self, start_state: usize) -> Vec<f64> {
        let n = self.num_states;
        let mut cur = vec![0.0f64; n];
        let mut next = vec![0.0f64; n];
        let mut avg = vec![0.0f64; n];
        cur[start_state] = 1.0;

        for _ in 0..INITIAL_PROB_ITERS {
            for (a, &c) in avg.iter_mut().zip(&cur) {
                *a += c / INITIAL_PROB_ITERS as f64;
            }
            for s in 0..n {
                let p = cur[s];
                if p == 0.0 {
                    continue;
                }
                for tr in self.outgoing(s) {
                    next[tr.other] += p * tr.prob;
                }
            }
            let tot: f64 = next.iter().sum();
            if tot <= 0.0 {
                // Every state reachable so far is a dead end.
                break;
            }
            for (c, nx) in cur.iter_mut().zip(next.iter_mut()) {
                *c = *nx / tot;
                *nx = 0.0;
            }
        }

        let tot: f64 = avg.iter().sum();
        for a in avg.iter_mut() {
            *a /= tot;
        }
        avg
    }
}

/// Bucket arcs by `key(arc).0`, recording `key(arc).1` as the far endpoint.
/// Returns the flat transition list and `num_states + 1` range offsets.
fn group_by_state(
    num_states: usize,
    arcs: &[GraphArc],
    key: impl Fn(&GraphArc) -> (usize, usize),
) -> (Vec<Transition>, Vec<usize>) {
    let mut counts = vec![0usize; num_states + 1];
    for arc in arcs {
        counts[key(arc).0 + 1] += 1;
    }
    for s in 0..num_states {
        counts[s + 1] += counts[s];
    }
    let ranges = counts.clone();
    let mut fill = counts;
    let mut out = vec![Transition { other: 0, pdf_id: 0, prob: 0.0 }; arcs.len()];
    for arc in arcs {
        let (this, other) = key(arc);
        out[fill[this]] = Transition { other, pdf_id: arc.pdf_id, prob: arc.prob as f64 };
        fill[this] += 1;
    }
    (out, ranges)
}

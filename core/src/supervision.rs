//! Numerator supervision: the set of state sequences consistent with the
//! transcript, for one minibatch.
//!
//! The path graph is an epsilon-free acceptor in which every arc consumes
//! exactly one frame, so each reachable state has a well-defined time. A
//! minibatch of several sequences is the time-concatenation of the
//! per-sequence graphs: graph frame `t` belongs to sequence
//! `t / frames_per_sequence`.

use crate::error::ChainError;

/// One arc of the path graph, scored by `log_prob` plus the network output
/// for `pdf_id` at the arc's frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PathArc {
    pub src: usize,
    pub dst: usize,
    pub pdf_id: usize,
    pub log_prob: f32,
}

/// Mutable builder for the path graph. Validated when wrapped in a
/// [`Supervision`].
#[derive(Clone, Debug, Default)]
pub struct PathGraph {
    start: usize,
    arcs: Vec<PathArc>,
    /// NEG_INFINITY marks a non-final state.
    final_log_probs: Vec<f32>,
}

impl PathGraph {
    /// Graph with `num_states` states and no arcs.
    pub fn new(num_states: usize, start: usize) -> Self {
        PathGraph {
            start,
            arcs: Vec::new(),
            final_log_probs: vec![f32::NEG_INFINITY; num_states],
        }
    }

    pub fn add_state(&mut self) -> usize {
        self.final_log_probs.push(f32::NEG_INFINITY);
        self.final_log_probs.len() - 1
    }

    pub fn add_arc(&mut self, src: usize, dst: usize, pdf_id: usize, log_prob: f32) {
        self.arcs.push(PathArc { src, dst, pdf_id, log_prob });
    }

    pub fn set_final(&mut self, state: usize, log_prob: f32) {
        self.final_log_probs[state] = log_prob;
    }

    pub fn num_states(&self) -> usize {
        self.final_log_probs.len()
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn arcs(&self) -> &[PathArc] {
        &self.arcs
    }

    pub fn final_log_prob(&self, state: usize) -> f32 {
        self.final_log_probs[state]
    }

    pub fn is_final(&self, state: usize) -> bool {
        self.final_log_probs[state] != f32::NEG_INFINITY
    }
}

/// Ground truth for one minibatch. Immutable once constructed.
#[derive(Clone, Debug)]
pub struct Supervision {
    pub weight: f32,
    pub num_sequences: usize,
    pub frames_per_sequence: usize,
    /// Number of pdf-ids; must match the network output's column count.
    pub label_dim: usize,
    graph: PathGraph,
    /// Frame index of every state; None if unreachable from the start.
    state_times: Vec<Option<usize>>,
}

impl Supervision {
    pub fn new(
        graph: PathGraph,
        weight: f32,
        num_sequences: usize,
        frames_per_sequence: usize,
        label_dim: usize,
    ) -> Result<Self, ChainError> {
        if num_sequences == 0 || frames_per_sequence == 0 {
            return Err(ChainError::EmptySupervision { num_sequences, frames_per_sequence });
        }
        if !weight.is_finite() || weight < 0.0 {
            return Err(ChainError::InvalidWeight(weight));
        }
        let num_states = graph.num_states();
        if num_states == 0 {
            return Err(ChainError::EmptyGraph);
        }
        if graph.start >= num_states {
            return Err(ChainError::StateOutOfRange { state: graph.start, num_states });
        }
        for arc in &graph.arcs {
            for state in [arc.src, arc.dst] {
                if state >= num_states {
                    return Err(ChainError::StateOutOfRange { state, num_states });
                }
            }
            if arc.pdf_id >= label_dim {
                return Err(ChainError::PdfOutOfRange { pdf_id: arc.pdf_id, num_pdfs: label_dim });
            }
        }

        let state_times = compute_state_times(&graph)?;
        let expected = num_sequences * frames_per_sequence;
        let mut any_final = false;
        for (s, time) in state_times.iter().enumerate() {
            let Some(t) = *time else { continue };
            if graph.is_final(s) {
                if t != expected {
                    return Err(ChainError::FrameCountMismatch { found: t, expected });
                }
                any_final = true;
            } else if t > expected {
                // Also catches any reachable arc leaving frame `expected` or later.
                return Err(ChainError::PathPastLastFrame { state: s, time: t, expected });
            }
        }
        if !any_final {
            return Err(ChainError::NoFinalState);
        }

        Ok(Supervision {
            weight,
            num_sequences,
            frames_per_sequence,
            label_dim,
            graph,
            state_times,
        })
    }

    /// Single-path supervision for one sequence from a frame-level pdf alignment.
    pub fn from_alignment(pdf_ids: &[usize], label_dim: usize, weight: f32) -> Result<Self, ChainError> {
        let allowed: Vec<Vec<usize>> = pdf_ids.iter().map(|&p| vec![p]).collect();
        Self::from_allowed_pdfs(&allowed, label_dim, weight)
    }

    /// One sequence where frame `t` may emit any pdf in `allowed[t]`.
    pub fn from_allowed_pdfs(allowed: &[Vec<usize>], label_dim: usize, weight: f32) -> Result<Self, ChainError> {
        let num_frames = allowed.len();
        let mut graph = PathGraph::new(num_frames + 1, 0);
        for (t, pdfs) in allowed.iter().enumerate() {
            for &p in pdfs {
                graph.add_arc(t, t + 1, p, 0.0);
            }
        }
        graph.set_final(num_frames, 0.0);
        Self::new(graph, weight, 1, num_frames, label_dim)
    }

    /// Concatenate supervisions into one minibatch. All parts must agree on
    /// weight, frames per sequence and label dimension.
    pub fn merge(parts: &[Supervision]) -> Result<Self, ChainError> {
        let first = parts
            .first()
            .ok_or_else(|| ChainError::IncompatibleSupervision("nothing to merge".to_string()))?;
        for p in &parts[1..] {
            if p.weight != first.weight {
                return Err(ChainError::IncompatibleSupervision(format!(
                    "weights differ ({} vs {})", first.weight, p.weight
                )));
            }
            if p.frames_per_sequence != first.frames_per_sequence {
                return Err(ChainError::IncompatibleSupervision(format!(
                    "frames_per_sequence differs ({} vs {})", first.frames_per_sequence, p.frames_per_sequence
                )));
            }
            if p.label_dim != first.label_dim {
                return Err(ChainError::IncompatibleSupervision(format!(
                    "label_dim differs ({} vs {})", first.label_dim, p.label_dim
                )));
            }
        }

        let mut merged = first.graph.clone();
        let mut num_sequences = first.num_sequences;
        for p in &parts[1..] {
            let offset = merged.num_states();
            let prev_finals: Vec<(usize, f32)> = (0..offset)
                .filter(|&s| merged.is_final(s))
                .map(|s| (s, merged.final_log_prob(s)))
                .collect();
            for &(s, _) in &prev_finals {
                merged.final_log_probs[s] = f32::NEG_INFINITY;
            }
            merged.final_log_probs.extend_from_slice(&p.graph.final_log_probs);

            let part_start = p.graph.start;
            for arc in &p.graph.arcs {
                if arc.src == part_start {
                    // Splice: previous finals take over the start's arcs.
                    for &(f, final_lp) in &prev_finals {
                        merged.add_arc(f, arc.dst + offset, arc.pdf_id, arc.log_prob + final_lp);
                    }
                } else {
                    merged.add_arc(arc.src + offset, arc.dst + offset, arc.pdf_id, arc.log_prob);
                }
            }
            num_sequences += p.num_sequences;
        }

        Self::new(merged, first.weight, num_sequences, first.frames_per_sequence, first.label_dim)
    }

    pub fn graph(&self) -> &PathGraph {
        &self.graph
    }

    pub fn state_time(&self, state: usize) -> Option<usize> {
        self.state_times[state]
    }

    /// Total frames across all sequences (= network output rows).
    pub fn num_frames(&self) -> usize {
        self.num_sequences * self.frames_per_sequence
    }

    /// Network-output row holding graph frame `t`. Rows are frame-major:
    /// all sequences for frame 0, then frame 1, and so on.
    #[inline]
    pub fn frame_to_row(&self, t: usize) -> usize {
        let seq = t / self.frames_per_sequence;
        let t_in_seq = t % self.frames_per_sequence;
        t_in_seq * self.num_sequences + seq
    }
}

/// Breadth-first time assignment from the start state.
fn compute_state_times(graph: &PathGraph) -> Result<Vec<Option<usize>>, ChainError> {
    let n = graph.num_states();
    let mut out_ranges = vec![0usize; n + 1];
    for arc in &graph.arcs {
        out_ranges[arc.src + 1] += 1;
    }
    for s in 0..n {
        out_ranges[s + 1] += out_ranges[s];
    }
    let mut fill = out_ranges.clone();
    let mut dsts = vec![0usize; graph.arcs.len()];
    for arc in &graph.arcs {
        dsts[fill[arc.src]] = arc.dst;
        fill[arc.src] += 1;
    }

    let mut times: Vec<Option<usize>> = vec![None; n];
    times[graph.start] = Some(0);
    let mut queue = std::collections::VecDeque::from([graph.start]);
    while let Some(s) = queue.pop_front() {
        let t = times[s].unwrap_or(0);
        for &d in &dsts[out_ranges[s]..out_ranges[s + 1]] {
            match times[d] {
                None => {
                    times[d] = Some(t + 1);
                    queue.push_back(d);
                }
                Some(existing) if existing != t + 1 => {
                    return Err(ChainError::InconsistentStateTimes { state: d, first: existing, second: t + 1 });
                }
                Some(_) => {}
            }
        }
    }
    Ok(times)
}

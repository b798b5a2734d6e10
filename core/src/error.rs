//! Construction-time errors.
//!
//! Only the inputs built ahead of a training run (options, denominator graph,
//! supervision) return these. Numerical failures inside an objective
//! computation are absorbed by the fallback path and never surface as errors;
//! shape mismatches in the per-minibatch call are caller bugs and panic.

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ChainError {
    #[error("invalid option {name}: {reason}")]
    InvalidOption { name: &'static str, reason: String },

    #[error("failed to parse options: {0}")]
    OptionsParse(String),

    #[error("graph has no states")]
    EmptyGraph,

    #[error("state {state} out of range (graph has {num_states} states)")]
    StateOutOfRange { state: usize, num_states: usize },

    #[error("pdf-id {pdf_id} out of range (expected < {num_pdfs})")]
    PdfOutOfRange { pdf_id: usize, num_pdfs: usize },

    #[error("transition probability {0} is not a finite positive number")]
    BadTransitionProb(f32),

    #[error("state {state} is reachable at both frame {first} and frame {second}")]
    InconsistentStateTimes { state: usize, first: usize, second: usize },

    #[error("supervision graph spans {found} frames, expected {expected}")]
    FrameCountMismatch { found: usize, expected: usize },

    #[error("state {state} is reached at frame {time}, past the last frame {expected}")]
    PathPastLastFrame { state: usize, time: usize, expected: usize },

    #[error("supervision weight {0} is not a finite non-negative number")]
    InvalidWeight(f32),

    #[error("supervision must have at least one sequence and one frame (got {num_sequences} x {frames_per_sequence})")]
    EmptySupervision { num_sequences: usize, frames_per_sequence: usize },

    #[error("supervision graph has no final state reachable from the start")]
    NoFinalState,

    #[error("cannot merge supervisions: {0}")]
    IncompatibleSupervision(String),
}

impl From<serde_json::Error> for ChainError {
    fn from(e: serde_json::Error) -> Self {
        ChainError::OptionsParse(e.to_string())
    }
}

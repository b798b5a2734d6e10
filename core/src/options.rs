/// Chain training configuration.
///
/// Created once per run (typically deserialized from JSON) and passed by
/// reference into every objective computation. Never mutated afterwards.

use serde::{Serialize, Deserialize};
use crate::error::ChainError;

fn default_leaky_hmm_coefficient() -> f32 { 1.0e-05 }

/// Options for the numerator/denominator objective.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChainTrainingOptions {
    /// L2 regularization constant on the chain output. The term added to the
    /// objective is -0.5 * l2_regularize * weight * ||output - target||^2.
    pub l2_regularize: f32,
    /// Probability mass leaked from every HMM state to every other state,
    /// weighted by the destination's initial probability. Must be in (0, 1).
    #[serde(default = "default_leaky_hmm_coefficient")]
    pub leaky_hmm_coefficient: f32,
    /// Cross-entropy regularization constant. Nonzero means the network has an
    /// auxiliary log-softmax output whose derivative gets scaled by this.
    pub xent_regularize: f32,
    /// Diagnostics level: 0 = quiet, >= 1 logs per-frame derivative
    /// magnitudes and regression statistics.
    pub verbose: u32,
}

impl Default for ChainTrainingOptions {
    fn default() -> Self {
        ChainTrainingOptions {
            l2_regularize: 0.0,
            leaky_hmm_coefficient: default_leaky_hmm_coefficient(),
            xent_regularize: 0.0,
            verbose: 0,
        }
    }
}

impl ChainTrainingOptions {
    /// Check value ranges. Every constructor path goes through this.
    pub fn validate(&self) -> Result<(), ChainError> {
        if !(self.l2_regularize >= 0.0 && self.l2_regularize.is_finite()) {
            return Err(ChainError::InvalidOption {
                name: "l2_regularize",
                reason: format!("must be a finite value >= 0, got {}", self.l2_regularize),
            });
        }
        if !(self.leaky_hmm_coefficient > 0.0 && self.leaky_hmm_coefficient < 1.0) {
            return Err(ChainError::InvalidOption {
                name: "leaky_hmm_coefficient",
                reason: format!("must be in (0, 1), got {}", self.leaky_hmm_coefficient),
            });
        }
        if !(self.xent_regularize >= 0.0 && self.xent_regularize.is_finite()) {
            return Err(ChainError::InvalidOption {
                name: "xent_regularize",
                reason: format!("must be a finite value >= 0, got {}", self.xent_regularize),
            });
        }
        Ok(())
    }

    /// Parse and validate from a JSON object. Missing keys take defaults.
    pub fn from_json(json: &str) -> Result<Self, ChainError> {
        let opts: ChainTrainingOptions = serde_json::from_str(json)?;
        opts.validate()?;
        Ok(opts)
    }

    pub fn to_json(&self) -> Result<String, ChainError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn use_xent(&self) -> bool {
        self.xent_regularize != 0.0
    }
}

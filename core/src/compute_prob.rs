/// Validation-set objective accumulation.
///
/// `ChainProbComputer` evaluates minibatches without derivatives and keeps
/// running totals per output name. A chain output `name` also accumulates
/// its cross-entropy objective under `name-xent` when xent is enabled.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::info;

use crate::den_graph::DenominatorGraph;
use crate::options::ChainTrainingOptions;
use crate::supervision::Supervision;
use crate::tensor::Matrix;
use crate::training::{ChainDerivatives, ChainOutputStats, process_chain_output};

/// Running totals for one output.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ObjectiveInfo {
    pub tot_weight: f64,
    pub tot_like: f64,
    pub tot_l2_term: f64,
    pub num_minibatches: usize,
}

impl ObjectiveInfo {
    pub fn per_frame(&self) -> f64 {
        if self.tot_weight > 0.0 {
            (self.tot_like + self.tot_l2_term) / self.tot_weight
        } else {
            0.0
        }
    }
}

pub struct ChainProbComputer<'a> {
    opts: ChainTrainingOptions,
    den_graph: &'a DenominatorGraph,
    objf_info: BTreeMap<String, ObjectiveInfo>,
}

impl<'a> ChainProbComputer<'a> {
    pub fn new(opts: ChainTrainingOptions, den_graph: &'a DenominatorGraph) -> Self {
        ChainProbComputer { opts, den_graph, objf_info: BTreeMap::new() }
    }

    /// Evaluate one minibatch for output `name` and add it to the totals.
    pub fn compute(
        &mut self,
        name: &str,
        supervision: &Supervision,
        nnet_output: &Matrix,
        xent_output: Option<&Matrix>,
    ) -> ChainOutputStats {
        let stats = process_chain_output(
            &self.opts,
            self.den_graph,
            supervision,
            nnet_output,
            xent_output,
            &mut ChainDerivatives::none(),
        );

        let chain = &stats.chain;
        let info = self.objf_info.entry(name.to_string()).or_default();
        info.tot_weight += chain.weight as f64;
        info.tot_like += chain.objf as f64;
        info.tot_l2_term += chain.l2_term as f64;
        info.num_minibatches += 1;
        if self.opts.verbose >= 1 {
            info!(
                output = name,
                per_frame = chain.per_frame(),
                weight = chain.weight,
                "minibatch chain objective"
            );
        }

        if let Some(xent_objf) = stats.xent_objf {
            let info = self.objf_info.entry(format!("{name}-xent")).or_default();
            info.tot_weight += chain.weight as f64;
            info.tot_like += xent_objf as f64;
            info.num_minibatches += 1;
        }
        stats
    }

    pub fn objective(&self, name: &str) -> Option<&ObjectiveInfo> {
        self.objf_info.get(name)
    }

    /// Log the overall per-frame objective of every output. Returns false
    /// if no output has accumulated any weight.
    pub fn print_total_stats(&self) -> bool {
        let mut ok = false;
        for (name, info) in &self.objf_info {
            if info.tot_weight <= 0.0 {
                continue;
            }
            ok = true;
            let like = info.tot_like / info.tot_weight;
            if info.tot_l2_term == 0.0 {
                info!("Overall log-probability for '{name}' is {like:.6} per frame, over {} frames.", info.tot_weight);
            } else {
                let l2 = info.tot_l2_term / info.tot_weight;
                info!(
                    "Overall log-probability for '{name}' is {like:.6} + {l2:.6} = {:.6} per frame, over {} frames.",
                    like + l2,
                    info.tot_weight
                );
            }
        }
        ok
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.objf_info)
    }
}

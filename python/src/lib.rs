//! PyO3 bindings for lfmmi core.
//!
//! Stateless functional API over flat row-major lists. Graphs, supervisions
//! and options are built once and passed back in; all math happens in Rust.

use pyo3::prelude::*;
use pyo3::exceptions::PyValueError;
use pyo3::types::PyDict;

use lfmmi_core::den_graph::{DenominatorGraph as RustDenGraph, GraphArc};
use lfmmi_core::error::ChainError;
use lfmmi_core::options::ChainTrainingOptions as RustOptions;
use lfmmi_core::supervision::Supervision as RustSupervision;
use lfmmi_core::tensor::Matrix;
use lfmmi_core::training::{
    ChainDerivatives,
    compute_chain_objf_and_deriv as rust_compute_chain_objf_and_deriv,
    process_chain_output as rust_process_chain_output,
};

fn chain_err(e: ChainError) -> PyErr {
    PyValueError::new_err(e.to_string())
}

// ── ChainTrainingOptions ─────────────────────────────────────────────

#[pyclass(frozen)]
struct ChainTrainingOptions {
    inner: RustOptions,
}

#[pymethods]
impl ChainTrainingOptions {
    #[new]
    #[pyo3(signature = (l2_regularize=0.0, leaky_hmm_coefficient=1.0e-5, xent_regularize=0.0, verbose=0))]
    fn new(
        l2_regularize: f32,
        leaky_hmm_coefficient: f32,
        xent_regularize: f32,
        verbose: u32,
    ) -> PyResult<Self> {
        let inner = RustOptions { l2_regularize, leaky_hmm_coefficient, xent_regularize, verbose };
        inner.validate().map_err(chain_err)?;
        Ok(ChainTrainingOptions { inner })
    }

    #[staticmethod]
    fn from_json(json: &str) -> PyResult<Self> {
        Ok(ChainTrainingOptions { inner: RustOptions::from_json(json).map_err(chain_err)? })
    }

    fn to_json(&self) -> PyResult<String> {
        self.inner.to_json().map_err(chain_err)
    }

    #[getter]
    fn l2_regularize(&self) -> f32 { self.inner.l2_regularize }
    #[getter]
    fn leaky_hmm_coefficient(&self) -> f32 { self.inner.leaky_hmm_coefficient }
    #[getter]
    fn xent_regularize(&self) -> f32 { self.inner.xent_regularize }
    #[getter]
    fn verbose(&self) -> u32 { self.inner.verbose }
}

// ── DenominatorGraph ─────────────────────────────────────────────────

#[pyclass(frozen)]
struct DenominatorGraph {
    inner: RustDenGraph,
}

#[pymethods]
impl DenominatorGraph {
    /// `arcs` is a list of (src, dst, pdf_id, prob) tuples.
    #[new]
    fn new(
        num_states: usize,
        start_state: usize,
        arcs: Vec<(usize, usize, usize, f32)>,
        num_pdfs: usize,
    ) -> PyResult<Self> {
        let arcs: Vec<GraphArc> = arcs
            .into_iter()
            .map(|(src, dst, pdf_id, prob)| GraphArc { src, dst, pdf_id, prob })
            .collect();
        let inner = RustDenGraph::new(num_states, start_state, &arcs, num_pdfs).map_err(chain_err)?;
        Ok(DenominatorGraph { inner })
    }

    #[getter]
    fn num_states(&self) -> usize { self.inner.num_states() }
    #[getter]
    fn num_pdfs(&self) -> usize { self.inner.num_pdfs() }
    #[getter]
    fn num_arcs(&self) -> usize { self.inner.num_arcs() }

    fn initial_probs(&self) -> Vec<f64> {
        self.inner.initial_probs().to_vec()
    }
}

// ── Supervision ──────────────────────────────────────────────────────

#[pyclass(frozen)]
struct Supervision {
    inner: RustSupervision,
}

#[pymethods]
impl Supervision {
    #[staticmethod]
    #[pyo3(signature = (pdf_ids, label_dim, weight=1.0))]
    fn from_alignment(pdf_ids: Vec<usize>, label_dim: usize, weight: f32) -> PyResult<Self> {
        let inner = RustSupervision::from_alignment(&pdf_ids, label_dim, weight).map_err(chain_err)?;
        Ok(Supervision { inner })
    }

    #[staticmethod]
    #[pyo3(signature = (allowed, label_dim, weight=1.0))]
    fn from_allowed_pdfs(allowed: Vec<Vec<usize>>, label_dim: usize, weight: f32) -> PyResult<Self> {
        let inner = RustSupervision::from_allowed_pdfs(&allowed, label_dim, weight).map_err(chain_err)?;
        Ok(Supervision { inner })
    }

    /// Concatenate single-sequence supervisions into one minibatch.
    #[staticmethod]
    fn merge(parts: Vec<PyRef<'_, Supervision>>) -> PyResult<Self> {
        let parts: Vec<RustSupervision> = parts.iter().map(|p| p.inner.clone()).collect();
        let inner = RustSupervision::merge(&parts).map_err(chain_err)?;
        Ok(Supervision { inner })
    }

    #[getter]
    fn weight(&self) -> f32 { self.inner.weight }
    #[getter]
    fn num_sequences(&self) -> usize { self.inner.num_sequences }
    #[getter]
    fn frames_per_sequence(&self) -> usize { self.inner.frames_per_sequence }
    #[getter]
    fn label_dim(&self) -> usize { self.inner.label_dim }
}

// ── Objective ────────────────────────────────────────────────────────

/// Check a flat list against the minibatch shape and wrap it.
fn to_matrix(
    name: &str,
    data: Vec<f32>,
    den_graph: &RustDenGraph,
    supervision: &RustSupervision,
) -> PyResult<Matrix> {
    let rows = supervision.num_frames();
    let cols = supervision.label_dim;
    if cols != den_graph.num_pdfs() {
        return Err(PyValueError::new_err(format!(
            "supervision label_dim ({cols}) != graph num_pdfs ({})",
            den_graph.num_pdfs()
        )));
    }
    if data.len() != rows * cols {
        return Err(PyValueError::new_err(format!(
            "{name} has {} values, expected {rows} x {cols} = {}",
            data.len(),
            rows * cols
        )));
    }
    Ok(Matrix::from_vec(rows, cols, data))
}

/// Chain objective for one minibatch.
///
/// Returns a dict with "objf", "l2_term", "weight", "failed" and, when
/// requested, "nnet_output_deriv" / "xent_output_deriv" as flat lists.
#[pyfunction]
#[pyo3(signature = (
    opts, den_graph, supervision, nnet_output,
    xent_output=None, compute_deriv=true, compute_xent_deriv=false,
))]
fn compute_chain_objf_and_deriv<'py>(
    py: Python<'py>,
    opts: &ChainTrainingOptions,
    den_graph: &DenominatorGraph,
    supervision: &Supervision,
    nnet_output: Vec<f32>,
    xent_output: Option<Vec<f32>>,
    compute_deriv: bool,
    compute_xent_deriv: bool,
) -> PyResult<Bound<'py, PyDict>> {
    let out = to_matrix("nnet_output", nnet_output, &den_graph.inner, &supervision.inner)?;
    let xent = xent_output
        .map(|x| to_matrix("xent_output", x, &den_graph.inner, &supervision.inner))
        .transpose()?;

    let (rows, cols) = out.shape();
    let mut main = compute_deriv.then(|| Matrix::zeros(rows, cols));
    let mut aux = compute_xent_deriv.then(|| Matrix::zeros(rows, cols));
    let res = rust_compute_chain_objf_and_deriv(
        &opts.inner,
        &den_graph.inner,
        &supervision.inner,
        &out,
        xent.as_ref(),
        &mut ChainDerivatives { nnet_output_deriv: main.as_mut(), xent_output_deriv: aux.as_mut() },
    );

    let dict = PyDict::new(py);
    dict.set_item("objf", res.objf)?;
    dict.set_item("l2_term", res.l2_term)?;
    dict.set_item("weight", res.weight)?;
    dict.set_item("failed", res.failed)?;
    dict.set_item("nnet_output_deriv", main.map(|m| m.data))?;
    dict.set_item("xent_output_deriv", aux.map(|m| m.data))?;
    Ok(dict)
}

/// Trainer-style processing of one chain output: the objective plus the
/// cross-entropy objective of the auxiliary output when xent is enabled.
#[pyfunction]
#[pyo3(signature = (opts, den_graph, supervision, nnet_output, xent_output=None, compute_deriv=true))]
fn process_chain_output<'py>(
    py: Python<'py>,
    opts: &ChainTrainingOptions,
    den_graph: &DenominatorGraph,
    supervision: &Supervision,
    nnet_output: Vec<f32>,
    xent_output: Option<Vec<f32>>,
    compute_deriv: bool,
) -> PyResult<Bound<'py, PyDict>> {
    let out = to_matrix("nnet_output", nnet_output, &den_graph.inner, &supervision.inner)?;
    let xent = xent_output
        .map(|x| to_matrix("xent_output", x, &den_graph.inner, &supervision.inner))
        .transpose()?;

    let (rows, cols) = out.shape();
    let mut main = compute_deriv.then(|| Matrix::zeros(rows, cols));
    let mut aux = (compute_deriv && xent.is_some() && opts.inner.use_xent())
        .then(|| Matrix::zeros(rows, cols));
    let stats = rust_process_chain_output(
        &opts.inner,
        &den_graph.inner,
        &supervision.inner,
        &out,
        xent.as_ref(),
        &mut ChainDerivatives { nnet_output_deriv: main.as_mut(), xent_output_deriv: aux.as_mut() },
    );

    let dict = PyDict::new(py);
    dict.set_item("objf", stats.chain.objf)?;
    dict.set_item("l2_term", stats.chain.l2_term)?;
    dict.set_item("weight", stats.chain.weight)?;
    dict.set_item("failed", stats.chain.failed)?;
    dict.set_item("per_frame", stats.chain.per_frame())?;
    dict.set_item("xent_objf", stats.xent_objf)?;
    dict.set_item("nnet_output_deriv", main.map(|m| m.data))?;
    dict.set_item("xent_output_deriv", aux.map(|m| m.data))?;
    Ok(dict)
}

#[pymodule]
fn lfmmi(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<ChainTrainingOptions>()?;
    m.add_class::<DenominatorGraph>()?;
    m.add_class::<Supervision>()?;
    m.add_function(wrap_pyfunction!(compute_chain_objf_and_deriv, m)?)?;
    m.add_function(wrap_pyfunction!(process_chain_output, m)?)?;
    Ok(())
}

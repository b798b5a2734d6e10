/// Criterion benchmarks for the chain objective.
///
/// Measures the full objective + derivative across denominator graph sizes
/// and minibatch shapes, and the denominator pass on its own.
///
/// Run: cargo bench --bench chain_bench
/// Reports saved to: target/criterion/

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use lfmmi_core::den_graph::{DenominatorGraph, GraphArc};
use lfmmi_core::denominator::DenominatorComputation;
use lfmmi_core::options::ChainTrainingOptions;
use lfmmi_core::supervision::Supervision;
use lfmmi_core::tensor::{Matrix, SimpleRng};
use lfmmi_core::training::{ChainDerivatives, DenominatorPass, compute_chain_objf_and_deriv};

/// Random sparse graph: every state gets `fanout` outgoing arcs with
/// normalized probabilities.
fn make_graph(num_states: usize, num_pdfs: usize, fanout: usize, seed: u64) -> DenominatorGraph {
    let mut rng = SimpleRng::new(seed);
    let mut arcs = Vec::with_capacity(num_states * fanout);
    for src in 0..num_states {
        for _ in 0..fanout {
            arcs.push(GraphArc {
                src,
                dst: rng.below(num_states),
                pdf_id: rng.below(num_pdfs),
                prob: 1.0 / fanout as f32,
            });
        }
    }
    DenominatorGraph::new(num_states, 0, &arcs, num_pdfs).expect("benchmark graph is valid")
}

fn make_supervision(num_sequences: usize, frames: usize, num_pdfs: usize, seed: u64) -> Supervision {
    let mut rng = SimpleRng::new(seed);
    let parts: Vec<Supervision> = (0..num_sequences)
        .map(|_| {
            let ali: Vec<usize> = (0..frames).map(|_| rng.below(num_pdfs)).collect();
            Supervision::from_alignment(&ali, num_pdfs, 1.0).expect("alignment is valid")
        })
        .collect();
    Supervision::merge(&parts).expect("parts are compatible")
}

fn make_output(rows: usize, cols: usize, seed: u64) -> Matrix {
    let mut m = Matrix::zeros(rows, cols);
    SimpleRng::new(seed).fill_uniform(&mut m.data, 2.0);
    m
}

/// Objective + derivative for growing denominator graphs.
fn bench_graph_size(c: &mut Criterion) {
    let mut group = c.benchmark_group("objf_and_deriv");
    let opts = ChainTrainingOptions::default();
    let (num_pdfs, num_sequences, frames) = (64, 4, 50);
    let sup = make_supervision(num_sequences, frames, num_pdfs, 1);
    let out = make_output(num_sequences * frames, num_pdfs, 2);
    for num_states in [100, 400, 1600] {
        let graph = make_graph(num_states, num_pdfs, 4, 3);
        let mut deriv = Matrix::zeros(out.num_rows(), out.num_cols());

        group.bench_with_input(
            BenchmarkId::new("states", num_states),
            &num_states,
            |b, _| {
                b.iter(|| {
                    compute_chain_objf_and_deriv(
                        &opts, &graph, &sup, &out, None,
                        &mut ChainDerivatives::main_only(&mut deriv),
                    )
                });
            },
        );
    }
    group.finish();
}

/// Denominator forward+backward across minibatch sizes.
fn bench_denominator(c: &mut Criterion) {
    let mut group = c.benchmark_group("denominator");
    let opts = ChainTrainingOptions::default();
    let num_pdfs = 64;
    let graph = make_graph(400, num_pdfs, 4, 5);
    for num_sequences in [1, 8, 32] {
        let frames = 50;
        let out = make_output(num_sequences * frames, num_pdfs, 6);
        let mut deriv = Matrix::zeros(out.num_rows(), out.num_cols());

        group.bench_with_input(
            BenchmarkId::new("sequences", num_sequences),
            &num_sequences,
            |b, &ns| {
                b.iter(|| {
                    let mut den = DenominatorComputation::new(&opts, &graph, ns, &out);
                    let lp = den.forward();
                    den.backward(-1.0, &mut deriv);
                    lp
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_graph_size, bench_denominator);
criterion_main!(benches);

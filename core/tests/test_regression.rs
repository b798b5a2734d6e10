/// Least-squares regression and the regressed L2 penalty, through the
/// public API and through the full objective.

use lfmmi_core::den_graph::{DenominatorGraph, GraphArc};
use lfmmi_core::options::ChainTrainingOptions;
use lfmmi_core::regression::{compute_regularization_term, least_square_regression};
use lfmmi_core::supervision::Supervision;
use lfmmi_core::tensor::{Matrix, SimpleRng};
use lfmmi_core::training::{ChainDerivatives, compute_chain_objf_and_deriv};

fn random_matrix(rows: usize, cols: usize, scale: f32, seed: u64) -> Matrix {
    let mut m = Matrix::zeros(rows, cols);
    SimpleRng::new(seed).fill_uniform(&mut m.data, scale);
    m
}

#[test]
fn test_noisy_fit_is_close_to_true_map() {
    let (rows, cols) = (400, 3);
    let x = random_matrix(rows, cols, 2.0, 1);
    let noise = random_matrix(rows, cols, 0.01, 2);
    let a = [1.5f32, -0.75, 0.2];
    let b = [-1.0f32, 0.5, 3.0];
    let mut y = Matrix::zeros(rows, cols);
    for r in 0..rows {
        for i in 0..cols {
            y.set(r, i, a[i] * x.get(r, i) + b[i] + noise.get(r, i));
        }
    }
    let c = least_square_regression(&x, &y, 1);
    for i in 0..cols {
        assert!((c.scale[i] - a[i]).abs() < 1e-2, "scale[{i}]={} expected {}", c.scale[i], a[i]);
        assert!((c.offset[i] - b[i]).abs() < 1e-2, "offset[{i}]={} expected {}", c.offset[i], b[i]);
    }
}

#[test]
fn test_fit_minimizes_residual() {
    let x = random_matrix(50, 2, 1.0, 3);
    let y = random_matrix(50, 2, 1.0, 4);
    let c = least_square_regression(&x, &y, 0);
    let residual = |scale: &[f32], offset: &[f32]| -> f64 {
        let mut s = 0.0f64;
        for r in 0..50 {
            for i in 0..2 {
                let d = y.get(r, i) - scale[i] * x.get(r, i) - offset[i];
                s += d as f64 * d as f64;
            }
        }
        s
    };
    let best = residual(&c.scale, &c.offset);
    for delta in [-0.05f32, 0.05] {
        let shifted: Vec<f32> = c.scale.iter().map(|v| v + delta).collect();
        assert!(residual(&shifted, &c.offset) > best);
        let moved: Vec<f32> = c.offset.iter().map(|v| v + delta).collect();
        assert!(residual(&c.scale, &moved) > best);
    }
}

#[test]
fn test_constant_regressor_column_does_not_blow_up() {
    let mut x = random_matrix(10, 2, 1.0, 5);
    for r in 0..10 {
        x.set(r, 1, 0.5);
    }
    let y = random_matrix(10, 2, 1.0, 6);
    let c = least_square_regression(&x, &y, 0);
    assert_eq!(c.degenerate_dims, 1);
    assert_eq!(c.scale[1], 0.0);
    let mean: f32 = (0..10).map(|r| y.get(r, 1)).sum::<f32>() / 10.0;
    assert!((c.offset[1] - mean).abs() < 1e-6);
    assert!(c.scale.iter().chain(&c.offset).all(|v| v.is_finite()));
}

#[test]
fn test_regularization_term_is_weighted_residual_norm() {
    let x = random_matrix(12, 2, 1.0, 7);
    let y = random_matrix(12, 2, 1.0, 8);
    let c = least_square_regression(&x, &y, 0);
    let mut expected = 0.0f64;
    for r in 0..12 {
        for i in 0..2 {
            let d = (y.get(r, i) - c.scale[i] * x.get(r, i) - c.offset[i]) as f64;
            expected += d * d;
        }
    }
    expected *= -0.5 * 0.3;
    let l2 = compute_regularization_term(&y, Some(&x), None, 0.3, 0, &mut ChainDerivatives::none());
    assert!((l2 as f64 - expected).abs() < 1e-5, "l2={l2} expected={expected}");
}

#[test]
fn test_objective_adds_aux_derivative_from_regression() {
    let arcs = [
        GraphArc { src: 0, dst: 0, pdf_id: 0, prob: 0.5 },
        GraphArc { src: 0, dst: 0, pdf_id: 1, prob: 0.5 },
    ];
    let graph = DenominatorGraph::new(1, 0, &arcs, 2).unwrap();
    let sup = Supervision::from_alignment(&[0, 1, 1, 0], 2, 1.0).unwrap();
    let out = random_matrix(4, 2, 1.0, 9);
    let xent = random_matrix(4, 2, 1.0, 10);

    let mut main_plain = Matrix::zeros(4, 2);
    let mut aux_plain = Matrix::zeros(4, 2);
    compute_chain_objf_and_deriv(
        &ChainTrainingOptions::default(), &graph, &sup, &out, Some(&xent),
        &mut ChainDerivatives::both(&mut main_plain, &mut aux_plain),
    );

    let opts = ChainTrainingOptions { l2_regularize: 0.5, ..Default::default() };
    let mut main = Matrix::zeros(4, 2);
    let mut aux = Matrix::zeros(4, 2);
    let res = compute_chain_objf_and_deriv(
        &opts, &graph, &sup, &out, Some(&xent),
        &mut ChainDerivatives::both(&mut main, &mut aux),
    );
    assert!(res.l2_term < 0.0);

    let c = least_square_regression(&xent, &out, 0);
    for r in 0..4 {
        for i in 0..2 {
            let diff = out.get(r, i) - c.scale[i] * xent.get(r, i) - c.offset[i];
            let main_extra = main.get(r, i) - main_plain.get(r, i);
            let aux_extra = aux.get(r, i) - aux_plain.get(r, i);
            assert!((main_extra + 0.5 * diff).abs() < 1e-5, "main[{r},{i}] extra={main_extra}");
            assert!((aux_extra - 0.5 * c.scale[i] * diff).abs() < 1e-5, "aux[{r},{i}] extra={aux_extra}");
        }
    }
}

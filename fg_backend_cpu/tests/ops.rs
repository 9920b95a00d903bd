//! Forward values and backward rules of each operation on the CPU backend.

use std::f32::consts::{E, LN_2};
use std::sync::Arc;

use fg_backend_cpu::CpuBackend;
use fg_tensor::prelude::*;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn graph() -> Graph<CpuBackend> {
    init();
    Graph::new(Arc::new(CpuBackend::new()))
}

fn assert_close(name: &str, got: &[f32], want: &[f32], tol: f32) {
    assert_eq!(got.len(), want.len(), "{name}: length mismatch");
    for (i, (g, w)) in got.iter().zip(want).enumerate() {
        assert!(
            (g - w).abs() < tol,
            "{name}: element {i} mismatch: got={g}, want={w}"
        );
    }
}

fn grad(g: &Graph<CpuBackend>, id: TensorId) -> Vec<f32> {
    g.grad(id).unwrap().expect("gradient missing").data().to_vec()
}

/// Seed `out` with ones and backpropagate.
fn backward_ones(g: &mut Graph<CpuBackend>, out: TensorId) {
    let ones = Tensor::ones_like(g.get(out).unwrap());
    let seed = g.insert(ones);
    g.backward_with(out, seed).unwrap();
}

#[test]
fn test_add_same_shape() {
    let mut g = graph();
    let a = g.tensor(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3], true).unwrap();
    let b = g.tensor(vec![6.0, 5.0, 4.0, 3.0, 2.0, 1.0], &[2, 3], true).unwrap();
    let out = g.add(a, b).unwrap();
    assert_eq!(g.data(out).unwrap(), &[7.0; 6]);

    backward_ones(&mut g, out);
    assert_eq!(grad(&g, a), vec![1.0; 6]);
    assert_eq!(grad(&g, b), vec![1.0; 6]);
}

#[test]
fn test_add_reduces_to_each_operand_shape() {
    let mut g = graph();
    let m = g.tensor(vec![0.0; 6], &[2, 3], true).unwrap();
    let row = g.tensor(vec![1.0, 2.0, 3.0], &[3], true).unwrap();
    let col = g.tensor(vec![10.0, 20.0], &[2, 1], true).unwrap();
    let s = g.tensor(vec![100.0], &[1], true).unwrap();

    let a = g.add(m, row).unwrap();
    let b = g.add(col, a).unwrap();
    let out = g.add(s, b).unwrap();
    assert_eq!(g.shape(out).unwrap().dims(), &[2, 3]);
    assert_eq!(
        g.data(out).unwrap(),
        &[111.0, 112.0, 113.0, 121.0, 122.0, 123.0]
    );

    backward_ones(&mut g, out);
    assert_eq!(grad(&g, m), vec![1.0; 6]);
    assert_eq!(grad(&g, row), vec![2.0, 2.0, 2.0]);
    assert_eq!(grad(&g, col), vec![3.0, 3.0]);
    assert_eq!(grad(&g, s), vec![6.0]);
}

#[test]
fn test_mul_same_shape() {
    let mut g = graph();
    let a = g.tensor(vec![1.0, 2.0, 3.0], &[3], true).unwrap();
    let b = g.tensor(vec![4.0, 5.0, 6.0], &[3], true).unwrap();
    let out = g.mul(a, b).unwrap();
    assert_eq!(g.data(out).unwrap(), &[4.0, 10.0, 18.0]);

    let seed = g.tensor(vec![1.0, 2.0, 3.0], &[3], false).unwrap();
    g.backward_with(out, seed).unwrap();
    // grad_a = g * b, grad_b = g * a
    assert_eq!(grad(&g, a), vec![4.0, 10.0, 18.0]);
    assert_eq!(grad(&g, b), vec![1.0, 4.0, 9.0]);
}

#[test]
fn test_mul_scalar_broadcast() {
    let mut g = graph();
    let a = g.tensor(vec![1.0, 2.0, 3.0, 4.0], &[2, 2], true).unwrap();
    let b = g.tensor(vec![3.0], &[1], true).unwrap();
    let out = g.mul(a, b).unwrap();
    assert_eq!(g.data(out).unwrap(), &[3.0, 6.0, 9.0, 12.0]);

    backward_ones(&mut g, out);
    assert_eq!(grad(&g, a), vec![3.0; 4]);
    assert_eq!(grad(&g, b), vec![10.0]);
}

#[test]
fn test_mul_row_broadcast_reduces_to_column_sums() {
    let mut g = graph();
    let row = g.tensor(vec![1.0, 2.0, 3.0], &[1, 3], true).unwrap();
    let m = g.tensor(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3], true).unwrap();
    let out = g.mul(row, m).unwrap();
    assert_eq!(g.shape(out).unwrap().dims(), &[2, 3]);
    assert_eq!(g.data(out).unwrap(), &[1.0, 4.0, 9.0, 4.0, 10.0, 18.0]);

    backward_ones(&mut g, out);
    assert_eq!(g.grad(row).unwrap().unwrap().shape().dims(), &[1, 3]);
    assert_eq!(grad(&g, row), vec![5.0, 7.0, 9.0]);
    assert_eq!(grad(&g, m), vec![1.0, 2.0, 3.0, 1.0, 2.0, 3.0]);
}

#[test]
fn test_add_row_broadcast_reduces_to_column_sums() {
    let mut g = graph();
    let m = g.tensor(vec![0.5; 6], &[2, 3], true).unwrap();
    let row = g.tensor(vec![1.0, 2.0, 3.0], &[1, 3], true).unwrap();
    let out = g.add(m, row).unwrap();
    assert_eq!(g.data(out).unwrap(), &[1.5, 2.5, 3.5, 1.5, 2.5, 3.5]);

    let seed = g.tensor(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3], false).unwrap();
    g.backward_with(out, seed).unwrap();
    assert_eq!(grad(&g, row), vec![5.0, 7.0, 9.0]);
    assert_eq!(grad(&g, m), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
}

#[test]
fn test_div() {
    let mut g = graph();
    let a = g.tensor(vec![1.0, 2.0], &[2], true).unwrap();
    let b = g.tensor(vec![4.0, 8.0], &[2], true).unwrap();
    let out = g.div(a, b).unwrap();
    assert_eq!(g.data(out).unwrap(), &[0.25, 0.25]);

    backward_ones(&mut g, out);
    assert_close("div_a", &grad(&g, a), &[0.25, 0.125], 1e-6);
    assert_close("div_b", &grad(&g, b), &[-0.0625, -0.03125], 1e-6);
}

#[test]
fn test_div_scalar_denominator() {
    let mut g = graph();
    let a = g.tensor(vec![1.0, 2.0, 3.0, 4.0], &[2, 2], true).unwrap();
    let b = g.tensor(vec![2.0], &[1], true).unwrap();
    let out = g.div(a, b).unwrap();
    assert_eq!(g.data(out).unwrap(), &[0.5, 1.0, 1.5, 2.0]);

    backward_ones(&mut g, out);
    assert_close("div_a", &grad(&g, a), &[0.5; 4], 1e-6);
    // -sum(a) / b^2
    assert_close("div_b", &grad(&g, b), &[-2.5], 1e-6);
}

#[test]
fn test_matmul_reference_values() {
    let mut g = graph();
    let a = g.tensor(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[3, 2], true).unwrap();
    let b = g.tensor(vec![0.1, 0.2, 0.3, 0.4], &[2, 2], true).unwrap();
    let out = g.matmul(a, b).unwrap();
    assert_eq!(g.shape(out).unwrap().dims(), &[3, 2]);
    assert_close(
        "matmul",
        g.data(out).unwrap(),
        &[0.7, 1.0, 1.5, 2.2, 2.3, 3.4],
        1e-5,
    );

    backward_ones(&mut g, out);
    assert_close("matmul_a", &grad(&g, a), &[0.3, 0.7, 0.3, 0.7, 0.3, 0.7], 1e-5);
    assert_close("matmul_b", &grad(&g, b), &[9.0, 9.0, 12.0, 12.0], 1e-5);
}

#[test]
fn test_matmul_rejects_bad_shapes() {
    let mut g = graph();
    let a = g.tensor(vec![0.0; 6], &[3, 2], false).unwrap();
    let v = g.tensor(vec![0.0; 2], &[2], false).unwrap();
    assert!(matches!(
        g.matmul(a, a),
        Err(TensorError::Shape(ShapeError::MatMulInner { .. }))
    ));
    assert!(matches!(
        g.matmul(a, v),
        Err(TensorError::Shape(ShapeError::NotMatrix { op: "matmul", .. }))
    ));
}

#[test]
fn test_exp_reuses_output() {
    let mut g = graph();
    let x = g.tensor(vec![0.0, 1.0], &[2], true).unwrap();
    let y = g.exp(x).unwrap();
    assert_close("exp", g.data(y).unwrap(), &[1.0, E], 1e-6);

    let seed = g.tensor(vec![2.0, 3.0], &[2], false).unwrap();
    g.backward_with(y, seed).unwrap();
    assert_close("exp_grad", &grad(&g, x), &[2.0, 3.0 * E], 1e-5);
}

#[test]
fn test_exp2() {
    let mut g = graph();
    let x = g.tensor(vec![1.0, 3.0], &[2], true).unwrap();
    let y = g.exp2(x).unwrap();
    assert_close("exp2", g.data(y).unwrap(), &[2.0, 8.0], 1e-6);

    backward_ones(&mut g, y);
    assert_close("exp2_grad", &grad(&g, x), &[2.0 * LN_2, 8.0 * LN_2], 1e-5);
}

#[test]
fn test_ln() {
    let mut g = graph();
    let x = g.tensor(vec![1.0, 4.0], &[2], true).unwrap();
    let y = g.ln(x).unwrap();
    assert_close("ln", g.data(y).unwrap(), &[0.0, 4.0f32.ln()], 1e-6);

    backward_ones(&mut g, y);
    assert_close("ln_grad", &grad(&g, x), &[1.0, 0.25], 1e-6);
}

#[test]
fn test_log2() {
    let mut g = graph();
    let x = g.tensor(vec![2.0, 4.0], &[2], true).unwrap();
    let y = g.log2(x).unwrap();
    assert_close("log2", g.data(y).unwrap(), &[1.0, 2.0], 1e-6);

    backward_ones(&mut g, y);
    assert_close(
        "log2_grad",
        &grad(&g, x),
        &[1.0 / (2.0 * LN_2), 1.0 / (4.0 * LN_2)],
        1e-6,
    );
}

#[test]
fn test_relu_mask_includes_zero_boundary() {
    let mut g = graph();
    let x = g.tensor(vec![-2.0, 0.0, 3.0], &[3], true).unwrap();
    let y = g.relu(x).unwrap();
    assert_eq!(g.data(y).unwrap(), &[0.0, 0.0, 3.0]);

    let seed = g.tensor(vec![5.0, 6.0, 7.0], &[3], false).unwrap();
    g.backward_with(y, seed).unwrap();
    assert_eq!(grad(&g, x), vec![0.0, 0.0, 7.0]);
}

#[test]
fn test_incompatible_broadcast_names_both_shapes() {
    let mut g = graph();
    let a = g.tensor(vec![0.0; 6], &[2, 3], true).unwrap();
    let b = g.tensor(vec![0.0; 4], &[4], true).unwrap();
    let err = g.add(a, b).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("(2, 3)") && msg.contains("(4,)"), "{msg}");
    assert!(matches!(err, TensorError::Shape(ShapeError::Incompatible { .. })));
}

#[test]
fn test_wrong_arity() {
    let mut g = graph();
    let a = g.tensor(vec![1.0], &[1], false).unwrap();
    assert!(matches!(
        g.apply(OpKind::Add, &[a]),
        Err(TensorError::Arity {
            op: OpKind::Add,
            expected: 2,
            got: 1
        })
    ));
}

#[test]
fn test_output_requires_grad_if_any_input_does() {
    let mut g = graph();
    let a = g.tensor(vec![1.0, 2.0], &[2], false).unwrap();
    let b = g.tensor(vec![3.0, 4.0], &[2], false).unwrap();
    let c = g.tensor(vec![5.0, 6.0], &[2], true).unwrap();

    let detached = g.mul(a, b).unwrap();
    assert!(!g.get(detached).unwrap().requires_grad());
    assert_eq!(g.producer(detached).unwrap(), None);

    let tracked = g.mul(a, c).unwrap();
    assert!(g.get(tracked).unwrap().requires_grad());
    let op = g.producer(tracked).unwrap().expect("producer");
    assert_eq!(g.operation(op).unwrap().output(), Some(tracked));
    assert_eq!(g.operation(op).unwrap().inputs(), &[a, c]);

    backward_ones(&mut g, tracked);
    assert!(g.grad(a).unwrap().is_none());
    assert_eq!(grad(&g, c), vec![1.0, 2.0]);
}

#[test]
fn test_backward_on_unrecorded_operation() {
    let mut g = graph();
    let a = g.tensor(vec![1.0], &[1], false).unwrap();
    let op = g.create_op(OpKind::Exp).unwrap();
    let (out, _) = g.forward(op, &[a]).unwrap();
    let seed = g.insert(Tensor::ones_like(g.get(out).unwrap()));
    assert!(matches!(
        g.backward_op(op, seed),
        Err(TensorError::NotRecorded { op: OpKind::Exp, .. })
    ));
}

#[test]
fn test_fresh_operations_are_bit_identical() {
    let mut g = graph();
    let a = g.tensor(vec![0.3, -1.7, 2.9, 0.01], &[2, 2], true).unwrap();
    let b = g.tensor(vec![1.1, 0.2, -0.4, 5.0], &[2, 2], true).unwrap();
    for kind in [OpKind::Add, OpKind::Mul, OpKind::Div, OpKind::MatMul] {
        let first = g.apply(kind, &[a, b]).unwrap();
        let second = g.apply(kind, &[a, b]).unwrap();
        let (x, y) = (g.data(first).unwrap(), g.data(second).unwrap());
        assert!(
            x.iter().zip(y).all(|(p, q)| p.to_bits() == q.to_bits()),
            "{kind}"
        );
    }
}

#[test]
fn test_forward_reports_elapsed() {
    let mut g = graph();
    let a = g.tensor(vec![1.0; 64], &[8, 8], false).unwrap();
    let op = g.create_op(OpKind::MatMul).unwrap();
    let (_, first) = g.forward(op, &[a, a]).unwrap();
    let (_, second) = g.forward(op, &[a, a]).unwrap();
    assert!(g.elapsed() >= first + second);
}

#[test]
fn test_set_grad_rejects_mismatched_shape() {
    let mut g = graph();
    let a = g.tensor(vec![1.0, 2.0], &[2], true).unwrap();
    let bad = g.tensor(vec![1.0, 2.0, 3.0], &[3], false).unwrap();
    assert!(matches!(
        g.set_grad(a, bad),
        Err(TensorError::Shape(ShapeError::GradientMismatch { .. }))
    ));
}

#[test]
fn test_set_grad_accumulates() {
    let mut g = graph();
    let a = g.tensor(vec![1.0, 2.0], &[2], true).unwrap();
    let g1 = g.tensor(vec![0.5, 0.5], &[2], false).unwrap();
    let g2 = g.tensor(vec![1.0, -1.0], &[2], false).unwrap();
    g.set_grad(a, g1).unwrap();
    assert_eq!(g.get(a).unwrap().grad_id(), Some(g1));
    g.set_grad(a, g2).unwrap();
    assert_eq!(grad(&g, a), vec![1.5, -0.5]);

    g.zero_grad(a).unwrap();
    assert!(g.grad(a).unwrap().is_none());
}

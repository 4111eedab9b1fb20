// Integration tests for the expression graph engine
//
// Construction, deduplication, forward/backward scheduling, gradient
// accumulation, buffer release and checkpoint recomputation, exercised
// through the operator catalogue on the CPU backend.

use std::sync::Arc;

use approx::assert_relative_eq;
use stoat::prelude::*;
use stoat::{BackwardCtx, ErrorKind, LambdaBackward};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn vector(data: &[f64]) -> stoat::Initializer<CpuBackend> {
    init::from_vector::<CpuBackend, f64>(data.to_vec())
}

fn param(g: &mut CpuGraph, name: &str, shape: impl Into<Shape>, data: &[f64]) -> Expr {
    g.parameter(name, shape, vector(data), DType::F64).unwrap()
}

// End to end

#[test]
fn test_sum_of_affine_gradients() -> stoat::Result<()> {
    init_logger();
    let mut g = CpuGraph::new(CpuDevice);
    let xs = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
    let ws = [0.5, -1.0, 2.0, 1.5, 0.25, -0.5];
    let x = param(&mut g, "x", (2, 3), &xs);
    let w = param(&mut g, "w", (2, 3), &ws);
    let b = param(&mut g, "b", 3, &[0.1, 0.2, 0.3]);

    let xw = g.mul(x, w)?;
    let y = g.add(xw, b)?;
    let z = g.sum(y, 0)?;
    assert_eq!(g.shape(z)?, &Shape::from((1, 3)));

    g.forward()?;
    let out = g.to_f64_vec(z)?;
    let expected = [
        1.0 * 0.5 + 4.0 * 1.5 + 0.2,
        2.0 * -1.0 + 5.0 * 0.25 + 0.4,
        3.0 * 2.0 + 6.0 * -0.5 + 0.6,
    ];
    for (o, e) in out.iter().zip(expected) {
        assert_relative_eq!(*o, e, epsilon = 1e-12);
    }

    g.backward(z)?;
    assert_eq!(g.grad_to_f64_vec(w)?, Some(xs.to_vec()));
    assert_eq!(g.grad_to_f64_vec(x)?, Some(ws.to_vec()));
    assert_eq!(g.grad_to_f64_vec(b)?, Some(vec![2.0, 2.0, 2.0]));
    Ok(())
}

// Deduplication

#[test]
fn test_identical_nodes_are_merged() -> stoat::Result<()> {
    let mut g = CpuGraph::new(CpuDevice);
    let a = param(&mut g, "a", 3, &[1.0, 2.0, 3.0]);
    let b = param(&mut g, "b", 3, &[4.0, 5.0, 6.0]);

    let s1 = g.add(a, b)?;
    let len = g.len();
    let s2 = g.add(a, b)?;
    assert_eq!(s1, s2);
    assert_eq!(g.len(), len);

    // operand order and operator parameters are part of the identity
    let s3 = g.add(b, a)?;
    assert_ne!(s1, s3);
    let p1 = g.prelu(a, 0.1)?;
    let p2 = g.prelu(a, 0.2)?;
    assert_ne!(p1, p2);

    // the merged node receives the gradient of both uses once per use
    let y = g.mul(s1, s2)?;
    let z = g.sum(y, 0)?;
    g.forward()?;
    g.backward(z)?;
    assert_eq!(g.grad_to_f64_vec(a)?, Some(vec![10.0, 14.0, 18.0]));
    Ok(())
}

#[test]
fn test_deduplication_can_be_disabled() -> stoat::Result<()> {
    let config = GraphConfig::default().with_deduplicate(false);
    let mut g = CpuGraph::with_config(CpuDevice, config);
    let a = param(&mut g, "a", 2, &[1.0, 2.0]);
    let s1 = g.exp(a)?;
    let s2 = g.exp(a)?;
    assert_ne!(s1, s2);
    assert_eq!(g.len(), 2);
    Ok(())
}

#[test]
fn test_lambda_nodes_are_never_merged() -> stoat::Result<()> {
    let mut g = CpuGraph::new(CpuDevice);
    let a = param(&mut g, "a", 2, &[1.0, 2.0]);
    let l1 = g.lambda(&[a], 2, DType::F64, |ctx| CpuBackend::affine(ctx.input(0), 2.0, 0.0), None)?;
    let l2 = g.lambda(&[a], 2, DType::F64, |ctx| CpuBackend::affine(ctx.input(0), 2.0, 0.0), None)?;
    assert_ne!(l1, l2);
    Ok(())
}

// Accumulation

#[test]
fn test_repeated_input_accumulates() -> stoat::Result<()> {
    let mut g = CpuGraph::new(CpuDevice);
    let a = param(&mut g, "a", 3, &[1.0, -2.0, 3.0]);
    let sq = g.mul(a, a)?;
    let z = g.sum(sq, 0)?;
    g.forward()?;
    g.backward(z)?;
    assert_eq!(g.grad_to_f64_vec(a)?, Some(vec![2.0, -4.0, 6.0]));
    Ok(())
}

#[test]
fn test_two_paths_accumulate() -> stoat::Result<()> {
    let mut g = CpuGraph::new(CpuDevice);
    let data = [0.3, -0.7, 1.1];
    let x = param(&mut g, "x", 3, &data);
    let e = g.exp(x)?;
    let s = g.sin(x)?;
    let y = g.add(e, s)?;
    g.forward()?;
    g.backward(y)?;
    let grad = g.grad_to_f64_vec(x)?.unwrap();
    for (gr, v) in grad.iter().zip(data) {
        assert_relative_eq!(*gr, v.exp() + v.cos(), epsilon = 1e-12);
    }
    Ok(())
}

#[test]
fn test_parameter_gradients_accumulate_until_zeroed() -> stoat::Result<()> {
    let mut g = CpuGraph::new(CpuDevice);
    let w = param(&mut g, "w", 2, &[1.0, 2.0]);
    for _ in 0..3 {
        let y = g.mul_scalar(w, 3.0)?;
        g.forward()?;
        g.backward(y)?;
        g.reset();
    }
    assert_eq!(g.grad_to_f64_vec(w)?, Some(vec![9.0, 9.0]));
    g.zero_grads();
    assert_eq!(g.grad_to_f64_vec(w)?, None);
    Ok(())
}

#[test]
fn test_multiple_roots_and_seed() -> stoat::Result<()> {
    let mut g = CpuGraph::new(CpuDevice);
    let x = param(&mut g, "x", 2, &[1.0, 2.0]);
    let a = g.mul_scalar(x, 2.0)?;
    let b = g.square(x)?;
    g.forward()?;
    g.backward_from(&[(a, Some(&[1.0, 10.0][..])), (b, None)])?;
    // 2 * seed + 2x
    assert_eq!(g.grad_to_f64_vec(x)?, Some(vec![4.0, 24.0]));

    let err = g.backward_with_seed(a, &[1.0]).unwrap_err();
    assert!(matches!(err, Error::ElementCountMismatch { expected: 2, got: 1, .. }));
    Ok(())
}

// Trainability

#[test]
fn test_constants_receive_no_gradient() -> stoat::Result<()> {
    let mut g = CpuGraph::new(CpuDevice);
    let c = g.constant(2, vector(&[1.0, 2.0]), DType::F64)?;
    let w = param(&mut g, "w", 2, &[3.0, 4.0]);
    let y = g.mul(c, w)?;
    assert!(!g.is_trainable(c)?);
    assert!(g.is_trainable(y)?);

    g.forward()?;
    g.backward(y)?;
    assert_eq!(g.grad_to_f64_vec(c)?, None);
    assert_eq!(g.grad_to_f64_vec(w)?, Some(vec![1.0, 2.0]));
    Ok(())
}

#[test]
fn test_set_trainable_propagates() -> stoat::Result<()> {
    let mut g = CpuGraph::new(CpuDevice);
    let c = g.constant(2, vector(&[1.0, 2.0]), DType::F64)?;
    let y = g.exp(c)?;
    assert!(!g.is_trainable(y)?);

    g.set_trainable(c, true)?;
    assert!(g.is_trainable(y)?);

    let err = g.set_trainable(y, false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);

    let i = g.constant(2, vector(&[1.0, 2.0]), DType::I32)?;
    let err = g.set_trainable(i, true).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Type);
    Ok(())
}

#[test]
fn test_stop_gradient_blocks_flow() -> stoat::Result<()> {
    let mut g = CpuGraph::new(CpuDevice);
    let x = param(&mut g, "x", 2, &[1.0, 2.0]);
    let s = g.stop_gradient(x)?;
    let y = g.mul(s, x)?;
    assert!(!g.is_trainable(s)?);
    g.forward()?;
    g.backward(y)?;
    // only the direct path contributes: d(s * x)/dx with s held constant
    assert_eq!(g.grad_to_f64_vec(x)?, Some(vec![1.0, 2.0]));
    Ok(())
}

// Forward scheduling

#[test]
fn test_forward_is_incremental() -> stoat::Result<()> {
    init_logger();
    let mut g = CpuGraph::new(CpuDevice);
    let x = param(&mut g, "x", 2, &[0.5, 1.5]);
    let a = g.exp(x)?;
    g.forward()?;
    let first = g.to_f64_vec(a)?;

    // a no-op when nothing is pending
    g.forward()?;
    assert_eq!(g.to_f64_vec(a)?, first);

    // only the new suffix runs after extension
    let b = g.sin(a)?;
    assert!(g.backward(b).is_err());
    g.forward()?;
    assert_eq!(g.to_f64_vec(a)?, first);
    let expected: Vec<f64> = first.iter().map(|v| v.sin()).collect();
    assert_eq!(g.to_f64_vec(b)?, expected);
    g.backward(b)?;
    Ok(())
}

#[test]
fn test_forward_to_computes_only_dependencies() -> stoat::Result<()> {
    let mut g = CpuGraph::new(CpuDevice);
    let x = param(&mut g, "x", 2, &[0.5, 1.5]);
    let a = g.exp(x)?;
    let b = g.cos(x)?;
    g.forward_to(a)?;
    assert!(g.is_live(a)?);
    assert!(!g.is_live(b)?);
    Ok(())
}

#[test]
fn test_set_value_reruns_dependents() -> stoat::Result<()> {
    let mut g = CpuGraph::new(CpuDevice);
    let x = param(&mut g, "x", 2, &[1.0, 2.0]);
    let y = g.mul_scalar(x, 10.0)?;
    g.forward()?;
    assert_eq!(g.to_f64_vec(y)?, vec![10.0, 20.0]);

    g.set_value(x, &[3.0, 4.0])?;
    let err = g.backward(y).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::GraphState);
    g.forward()?;
    assert_eq!(g.to_f64_vec(y)?, vec![30.0, 40.0]);

    let err = g.set_value(y, &[0.0, 0.0]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);
    let err = g.set_value(x, &[0.0]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Shape);
    Ok(())
}

#[test]
fn test_invalidate_reruns_initializer() -> stoat::Result<()> {
    let mut g = CpuGraph::new(CpuDevice);
    let x = g.parameter("x", 4, init::uniform::<CpuBackend>(-1.0, 1.0), DType::F64)?;
    g.forward_to(x)?;
    let first = g.to_f64_vec(x)?;
    g.invalidate(x)?;
    assert!(!g.is_live(x)?);
    g.forward_to(x)?;
    // the RNG has advanced, so a fresh draw differs
    assert_ne!(g.to_f64_vec(x)?, first);
    Ok(())
}

// Errors

#[test]
fn test_backward_before_forward() -> stoat::Result<()> {
    let mut g = CpuGraph::new(CpuDevice);
    let x = param(&mut g, "x", 2, &[1.0, 2.0]);
    let y = g.exp(x)?;
    let err = g.backward(y).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::GraphState);
    Ok(())
}

#[test]
fn test_integer_division_by_zero_fails() -> stoat::Result<()> {
    let mut g = CpuGraph::new(CpuDevice);
    let a = g.constant(2, init::from_vector::<CpuBackend, i32>(vec![7, -7]), DType::I32)?;
    let b = g.constant(2, init::from_vector::<CpuBackend, i32>(vec![0, 2]), DType::I32)?;
    let q = g.div(a, b)?;
    let err = g.forward().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Other);
    assert!(!g.is_live(q)?);
    Ok(())
}

#[test]
fn test_expired_and_foreign_exprs() -> stoat::Result<()> {
    let mut g = CpuGraph::new(CpuDevice);
    let x = param(&mut g, "x", 2, &[1.0, 2.0]);
    let y = g.exp(x)?;
    g.reset();

    let err = g.sin(y).unwrap_err();
    assert!(matches!(err, Error::ExpiredExpr { expr_episode: 0, episode: 1 }));
    assert_eq!(err.kind(), ErrorKind::GraphState);
    // parameters outlive the episode
    assert!(g.sin(x).is_ok());

    let mut other = CpuGraph::new(CpuDevice);
    let err = other.exp(x).unwrap_err();
    assert!(matches!(err, Error::ForeignExpr { .. }));
    Ok(())
}

#[test]
fn test_construction_errors_add_nothing() -> stoat::Result<()> {
    let mut g = CpuGraph::new(CpuDevice);
    let a = g.constant((2, 2), init::ones::<CpuBackend>(), DType::F32)?;
    let b = g.constant((2, 2), init::ones::<CpuBackend>(), DType::I32)?;
    let c = g.constant((3, 2), init::ones::<CpuBackend>(), DType::F32)?;
    let len = g.len();

    let err = g.add(a, b).unwrap_err();
    assert!(matches!(err, Error::IncompatibleTypes { .. }));
    assert_eq!(err.kind(), ErrorKind::Type);

    let err = g.add(a, c).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Shape);

    let err = g.sum(a, 2).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Axis);

    let err = g.sigmoid_n(&[a, c]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);

    let err = g.constant((2, 0), init::zeros::<CpuBackend>(), DType::F32).unwrap_err();
    assert!(matches!(err, Error::InvalidShape { .. }));

    assert_eq!(g.len(), len);
    Ok(())
}

#[test]
fn test_parameter_redeclaration() -> stoat::Result<()> {
    let mut g = CpuGraph::new(CpuDevice);
    let w = g.parameter("w", (2, 3), init::zeros::<CpuBackend>(), DType::F32)?;
    let again = g.parameter("w", (2, 3), init::ones::<CpuBackend>(), DType::F32)?;
    assert_eq!(w, again);
    assert_eq!(g.num_parameters(), 1);
    assert_eq!(g.parameter_by_name("w"), Some(w));

    let err = g
        .parameter("w", (3, 2), init::zeros::<CpuBackend>(), DType::F32)
        .unwrap_err();
    assert!(matches!(err, Error::ShapeMismatch { .. }));
    let err = g
        .parameter("w", (2, 3), init::zeros::<CpuBackend>(), DType::F64)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Type);
    Ok(())
}

// Episodes

#[test]
fn test_parameters_survive_reset() -> stoat::Result<()> {
    let mut g = CpuGraph::new(CpuDevice);
    let w = g.parameter("w", 3, init::normal::<CpuBackend>(0.0, 1.0), DType::F64)?;
    g.forward_to(w)?;
    let before = g.to_f64_vec(w)?;

    g.reset();
    assert_eq!(g.episode(), 1);
    assert!(g.is_empty());
    let w2 = g.parameter("w", 3, init::zeros::<CpuBackend>(), DType::F64)?;
    assert_eq!(w2.id(), w.id());
    assert_eq!(g.to_f64_vec(w2)?, before);
    Ok(())
}

#[test]
fn test_identical_construction_is_deterministic() -> stoat::Result<()> {
    fn run(seed: u64) -> stoat::Result<(Vec<f64>, Vec<f64>)> {
        let mut g = CpuGraph::with_config(CpuDevice, GraphConfig::default().with_seed(seed));
        let w = g.parameter("w", (4, 3), init::glorot_uniform::<CpuBackend>(), DType::F64)?;
        let x = g.constant((2, 4), init::uniform::<CpuBackend>(-1.0, 1.0), DType::F64)?;
        let h = g.dot(x, w, false, false, 1.0)?;
        let y = g.softmax(h, -1)?;
        let t = g.tanh(y)?;
        g.forward()?;
        g.backward(t)?;
        Ok((g.to_f64_vec(t)?, g.grad_to_f64_vec(w)?.unwrap_or_default()))
    }

    let a = run(7)?;
    let b = run(7)?;
    assert_eq!(a, b);
    let c = run(8)?;
    assert_ne!(a.0, c.0);
    Ok(())
}

#[test]
fn test_normal_initializer() -> stoat::Result<()> {
    let mut g = CpuGraph::new(CpuDevice);
    let x = g.constant(4000, init::normal::<CpuBackend>(2.0, 0.5), DType::F64)?;
    g.forward()?;
    let data = g.to_f64_vec(x)?;
    let mean = data.iter().sum::<f64>() / data.len() as f64;
    let var = data.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / data.len() as f64;
    assert_relative_eq!(mean, 2.0, epsilon = 0.05);
    assert_relative_eq!(var.sqrt(), 0.5, epsilon = 0.05);

    let mut g = CpuGraph::new(CpuDevice);
    g.constant(3, init::normal::<CpuBackend>(0.0, -1.0), DType::F64)?;
    let err = g.forward().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Other);
    Ok(())
}

// Buffer release

#[test]
fn test_intermediates_released_after_backward() -> stoat::Result<()> {
    init_logger();
    let mut g = CpuGraph::new(CpuDevice);
    let x = param(&mut g, "x", 3, &[0.1, 0.2, 0.3]);
    let h = g.tanh(x)?;
    let k = g.exp(x)?;
    let k = g.keep(k)?;
    let hk = g.add(h, k)?;
    let z = g.sum(hk, 0)?;
    g.forward()?;
    assert!(g.is_live(h)?);
    g.backward(z)?;

    let err = g.value(h).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::GraphState);
    assert!(g.grad(h)?.is_none());
    // kept nodes, graph outputs and leaves stay readable
    assert!(g.is_live(k)?);
    assert!(g.is_live(z)?);
    assert!(g.is_live(x)?);
    assert!(g.memory_stats().released > 0);

    // a second backward recomputes what it needs
    g.zero_grads();
    g.backward(z)?;
    let grad = g.grad_to_f64_vec(x)?.unwrap();
    assert_relative_eq!(grad[0], 1.0 - 0.1f64.tanh().powi(2) + 0.1f64.exp(), epsilon = 1e-12);
    Ok(())
}

#[test]
fn test_intermediate_root_keeps_its_gradient() -> stoat::Result<()> {
    let mut g = CpuGraph::new(CpuDevice);
    let x = param(&mut g, "x", 3, &[1.0, 2.0, 3.0]);
    let h = g.mul(x, x)?;
    let y = g.sum(h, 0)?;
    g.forward()?;
    g.backward(h)?;
    assert_eq!(g.grad_to_f64_vec(x)?, Some(vec![2.0, 4.0, 6.0]));
    assert_eq!(g.grad_to_f64_vec(h)?, Some(vec![1.0, 1.0, 1.0]));
    assert!(g.grad(y)?.is_none());

    g.zero_grads();
    g.backward_with_seed(h, &[1.0, 0.5, 0.0])?;
    assert_eq!(g.grad_to_f64_vec(h)?, Some(vec![1.0, 0.5, 0.0]));
    assert_eq!(g.grad_to_f64_vec(x)?, Some(vec![2.0, 2.0, 0.0]));
    Ok(())
}

#[test]
fn test_retain_grads_and_no_release() -> stoat::Result<()> {
    let config = GraphConfig::default().with_retain_grads(true);
    let mut g = CpuGraph::with_config(CpuDevice, config);
    let x = param(&mut g, "x", 2, &[1.0, 2.0]);
    let h = g.mul_scalar(x, 3.0)?;
    let z = g.sum(h, 0)?;
    g.forward()?;
    g.backward(z)?;
    assert_eq!(g.grad_to_f64_vec(h)?, Some(vec![1.0, 1.0]));
    assert!(!g.is_live(h)?);

    let config = GraphConfig::default().with_release_buffers(false);
    let mut g = CpuGraph::with_config(CpuDevice, config);
    let x = param(&mut g, "x", 2, &[1.0, 2.0]);
    let h = g.mul_scalar(x, 3.0)?;
    let z = g.sum(h, 0)?;
    g.forward()?;
    g.backward(z)?;
    assert_eq!(g.to_f64_vec(h)?, vec![3.0, 6.0]);
    assert_eq!(g.memory_stats().released, 0);
    Ok(())
}

// Checkpointing

fn checkpointed_chain(g: &mut CpuGraph, checkpoint: bool) -> stoat::Result<(Expr, Expr, Expr)> {
    let x = g.parameter(
        "x",
        (3, 4),
        init::uniform::<CpuBackend>(-1.0, 1.0),
        DType::F64,
    )?;
    let w = g.parameter("w", (4, 4), init::glorot_uniform::<CpuBackend>(), DType::F64)?;
    let mut h = x;
    for _ in 0..3 {
        let a = g.dot(h, w, false, false, 1.0)?;
        h = g.tanh(a)?;
        if checkpoint {
            h = g.checkpoint(h)?;
        }
    }
    let s = g.softmax(h, -1)?;
    let l = g.log(s)?;
    let z = g.sum(l, -1)?;
    Ok((x, w, z))
}

#[test]
fn test_checkpoint_is_transparent() -> stoat::Result<()> {
    init_logger();
    let mut plain = CpuGraph::new(CpuDevice);
    let (px, pw, pz) = checkpointed_chain(&mut plain, false)?;
    plain.forward()?;
    plain.backward(pz)?;
    assert_eq!(plain.memory_stats().recomputed, 0);

    let mut ckpt = CpuGraph::new(CpuDevice);
    let (cx, cw, cz) = checkpointed_chain(&mut ckpt, true)?;
    ckpt.forward()?;
    let after_forward = ckpt.memory_stats();
    assert!(after_forward.released >= 3);
    ckpt.backward(cz)?;
    let stats = ckpt.memory_stats();
    assert!(stats.recomputed >= 3);
    assert!(stats.peak_bytes >= stats.live_bytes);

    assert_eq!(plain.to_f64_vec(pz)?, ckpt.to_f64_vec(cz)?);
    assert_eq!(plain.grad_to_f64_vec(px)?, ckpt.grad_to_f64_vec(cx)?);
    assert_eq!(plain.grad_to_f64_vec(pw)?, ckpt.grad_to_f64_vec(cw)?);
    Ok(())
}

#[test]
fn test_checkpoint_recomputed_on_extension() -> stoat::Result<()> {
    let mut g = CpuGraph::new(CpuDevice);
    let x = param(&mut g, "x", 2, &[0.5, -0.5]);
    let h = g.tanh(x)?;
    let h = g.checkpoint(h)?;
    assert!(g.is_checkpoint(h)?);
    let a = g.exp(h)?;
    g.forward()?;
    assert!(!g.is_live(h)?);
    assert_eq!(g.memory_stats().released, 1);

    let b = g.cos(h)?;
    g.forward()?;
    assert_eq!(g.memory_stats().recomputed, 1);
    assert!(!g.is_live(h)?);
    let expected: Vec<f64> = [0.5f64, -0.5].iter().map(|v| v.tanh().cos()).collect();
    assert_eq!(g.to_f64_vec(b)?, expected);
    assert!(g.is_live(a)?);
    Ok(())
}

#[test]
fn test_deep_checkpoint_chain() -> stoat::Result<()> {
    let mut g = CpuGraph::new(CpuDevice);
    let x = param(&mut g, "x", 4, &[0.1, 0.2, 0.3, 0.4]);
    let mut h = x;
    for _ in 0..2000 {
        h = g.mul_scalar(h, 1.0)?;
        h = g.checkpoint(h)?;
    }
    let z = g.sum(h, 0)?;
    g.forward()?;
    g.backward(z)?;
    assert_eq!(g.grad_to_f64_vec(x)?, Some(vec![1.0; 4]));
    Ok(())
}

// Lambda

#[test]
fn test_lambda_forward_and_backward() -> stoat::Result<()> {
    let mut g = CpuGraph::new(CpuDevice);
    let x = param(&mut g, "x", 3, &[1.0, 2.0, 3.0]);
    let backward: LambdaBackward<CpuBackend> =
        Arc::new(|ctx: &mut BackwardCtx<'_, CpuBackend>| -> stoat::Result<()> {
            let Some(grad) = ctx.output_grad() else {
                return Ok(());
            };
            let dx = CpuBackend::affine(grad, 2.0, 0.0)?;
            ctx.accumulate(0, dx)
        });
    let y = g.lambda(
        &[x],
        3,
        DType::F64,
        |ctx| CpuBackend::affine(ctx.input(0), 2.0, 1.0),
        Some(backward),
    )?;
    assert!(g.is_trainable(y)?);
    g.forward()?;
    assert_eq!(g.to_f64_vec(y)?, vec![3.0, 5.0, 7.0]);
    g.backward(y)?;
    assert_eq!(g.grad_to_f64_vec(x)?, Some(vec![2.0, 2.0, 2.0]));
    Ok(())
}

#[test]
fn test_lambda_output_is_checked() -> stoat::Result<()> {
    let mut g = CpuGraph::new(CpuDevice);
    let x = param(&mut g, "x", 3, &[1.0, 2.0, 3.0]);
    // declares 2 elements, produces 3
    let y = g.lambda(&[x], 2, DType::F64, |ctx| Ok(ctx.input(0).clone()), None)?;
    assert!(!g.is_trainable(y)?);
    let err = g.forward().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Shape);
    Ok(())
}

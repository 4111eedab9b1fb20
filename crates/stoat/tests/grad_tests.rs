// Gradient checks for the operator catalogue
//
// Every test builds a small expression over F64 parameters, runs backward
// from its (weighted) output and compares the parameter gradients against
// central finite differences of the summed output.

use approx::assert_abs_diff_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use stoat::prelude::*;
use stoat::ErrorKind;

const STEP: f64 = 1e-6;
const TOL: f64 = 1e-5;

struct Input {
    shape: Shape,
    data: Vec<f64>,
}

fn input(shape: impl Into<Shape>, lo: f64, hi: f64, seed: u64) -> Input {
    let shape = shape.into();
    let mut rng = StdRng::seed_from_u64(seed);
    let data = (0..shape.elem_count())
        .map(|_| rng.gen_range(lo..hi))
        .collect();
    Input { shape, data }
}

fn weights(g: &mut CpuGraph, y: Expr) -> stoat::Result<Expr> {
    let shape = g.shape(y)?.clone();
    let w: Vec<f64> = (0..shape.elem_count())
        .map(|i| 0.5 + 0.25 * (i % 5) as f64)
        .collect();
    g.constant(shape, init::from_vector::<CpuBackend, f64>(w), DType::F64)
}

/// Check d(sum(w * f(inputs)))/d(input) for every input against central
/// differences. `f` gets one parameter Expr per input.
fn check<F>(inputs: &[Input], f: F)
where
    F: Fn(&mut CpuGraph, &[Expr]) -> stoat::Result<Expr>,
{
    let _ = env_logger::builder().is_test(true).try_init();
    let mut g = CpuGraph::new(CpuDevice);
    let params: Vec<Expr> = inputs
        .iter()
        .enumerate()
        .map(|(i, inp)| {
            g.parameter(
                &format!("p{i}"),
                inp.shape.clone(),
                init::from_vector::<CpuBackend, f64>(inp.data.clone()),
                DType::F64,
            )
            .unwrap()
        })
        .collect();
    let y = f(&mut g, &params).unwrap();
    let w = weights(&mut g, y).unwrap();
    let wy = g.mul(y, w).unwrap();

    g.forward().unwrap();
    g.backward(wy).unwrap();
    let analytic: Vec<Vec<f64>> = params
        .iter()
        .zip(inputs)
        .map(|(&p, inp)| {
            g.grad_to_f64_vec(p)
                .unwrap()
                .unwrap_or_else(|| vec![0.0; inp.data.len()])
        })
        .collect();

    let eval = |g: &mut CpuGraph, p: Expr, data: &[f64]| -> f64 {
        g.set_value(p, data).unwrap();
        g.forward().unwrap();
        g.to_f64_vec(wy).unwrap().iter().sum()
    };

    for (k, (&p, inp)) in params.iter().zip(inputs).enumerate() {
        for j in 0..inp.data.len() {
            let mut plus = inp.data.clone();
            plus[j] += STEP;
            let mut minus = inp.data.clone();
            minus[j] -= STEP;
            let numeric = (eval(&mut g, p, &plus) - eval(&mut g, p, &minus)) / (2.0 * STEP);
            assert_abs_diff_eq!(analytic[k][j], numeric, epsilon = TOL);
        }
        g.set_value(p, &inp.data).unwrap();
    }
}

// Element-wise

#[test]
fn test_grad_unary_math() {
    let x = || input((2, 3), -1.0, 1.0, 1);
    check(&[x()], |g, p| g.exp(p[0]));
    check(&[x()], |g, p| g.sin(p[0]));
    check(&[x()], |g, p| g.cos(p[0]));
    check(&[x()], |g, p| g.tan(p[0]));
    check(&[x()], |g, p| g.neg(p[0]));
    check(&[x()], |g, p| g.square(p[0]));
    check(&[x()], |g, p| g.abs(p[0]));

    let pos = || input((2, 3), 0.5, 2.0, 2);
    check(&[pos()], |g, p| g.log(p[0]));
    check(&[pos()], |g, p| g.sqrt(p[0], 0.0));
    check(&[pos()], |g, p| g.sqrt(p[0], 1e-3));
}

#[test]
fn test_grad_activations() {
    let x = || input(7, -2.0, 2.0, 3);
    check(&[x()], |g, p| g.sigmoid(p[0]));
    check(&[x()], |g, p| g.tanh(p[0]));
    check(&[x()], |g, p| g.relu(p[0]));
    check(&[x()], |g, p| g.swish(p[0]));
    check(&[x()], |g, p| g.gelu(p[0]));
    check(&[x()], |g, p| g.leaky_relu(p[0]));
    check(&[x()], |g, p| g.prelu(p[0], 0.25));
    check(&[x(), input(7, -1.0, 1.0, 4)], |g, p| g.tanh_n(p));
}

#[test]
fn test_grad_binary_broadcast() {
    let a = || input((2, 3), -1.0, 1.0, 5);
    let row = || input(3, -1.0, 1.0, 6);
    let col = || input((2, 1), 0.5, 1.5, 7);

    check(&[a(), row()], |g, p| g.add(p[0], p[1]));
    check(&[col(), row()], |g, p| g.sub(p[0], p[1]));
    check(&[a(), row()], |g, p| g.mul(p[0], p[1]));
    check(&[a(), col()], |g, p| g.div(p[0], p[1]));
    check(&[col(), a()], |g, p| g.div(p[0], p[1]));
    check(&[a(), row()], |g, p| g.maximum(p[0], p[1]));
    check(&[a(), row()], |g, p| g.minimum(p[0], p[1]));
    check(&[a(), col()], |g, p| g.logaddexp(p[0], p[1]));
}

#[test]
fn test_grad_scalar_forms() {
    let x = || input(5, 0.5, 2.0, 8);
    check(&[x()], |g, p| g.add_scalar(p[0], 3.0));
    check(&[x()], |g, p| g.sub_scalar(p[0], 3.0));
    check(&[x()], |g, p| g.scalar_sub(3.0, p[0]));
    check(&[x()], |g, p| g.mul_scalar(p[0], -1.5));
    check(&[x()], |g, p| g.div_scalar(p[0], 4.0));
    check(&[x()], |g, p| g.scalar_div(2.0, p[0]));
    check(&[x()], |g, p| g.maximum_scalar(p[0], 1.0));
    check(&[x()], |g, p| g.minimum_scalar(p[0], 1.0));
}

#[test]
fn test_grad_through_self_product() {
    // the same input on both sides of every binary operator
    let x = || input((2, 2), 0.5, 1.5, 9);
    check(&[x()], |g, p| g.mul(p[0], p[0]));
    check(&[x()], |g, p| g.div(p[0], p[0]));
    check(&[x()], |g, p| g.sub(p[0], p[0]));
}

// Linear algebra

#[test]
fn test_grad_dot() {
    let a = || input((3, 4), -1.0, 1.0, 10);
    let b = || input((4, 2), -1.0, 1.0, 11);
    check(&[a(), b()], |g, p| g.dot(p[0], p[1], false, false, 1.0));
    check(&[a(), input((2, 4), -1.0, 1.0, 12)], |g, p| {
        g.dot(p[0], p[1], false, true, 0.5)
    });
    check(&[input((4, 3), -1.0, 1.0, 13), b()], |g, p| {
        g.dot(p[0], p[1], true, false, 1.0)
    });
    check(&[input((2, 3, 4), -1.0, 1.0, 14), b()], |g, p| {
        g.dot(p[0], p[1], false, false, 2.0)
    });
}

#[test]
fn test_grad_bdot_broadcast_batch() {
    check(
        &[input((2, 3, 4), -1.0, 1.0, 15), input((1, 4, 2), -1.0, 1.0, 16)],
        |g, p| g.bdot(p[0], p[1], false, false, 1.0),
    );
    check(
        &[input((2, 4, 3), -1.0, 1.0, 17), input((2, 2, 4), -1.0, 1.0, 18)],
        |g, p| g.bdot(p[0], p[1], true, true, 1.0),
    );
}

#[test]
fn test_grad_affine() {
    check(
        &[
            input((3, 4), -1.0, 1.0, 19),
            input((4, 2), -1.0, 1.0, 20),
            input(2, -1.0, 1.0, 21),
        ],
        |g, p| g.affine(p[0], p[1], p[2], false, false, 1.0),
    );
}

// Shape

#[test]
fn test_grad_movement() {
    let x = || input((2, 3, 4), -1.0, 1.0, 22);
    check(&[x()], |g, p| g.transpose(p[0]));
    check(&[x()], |g, p| g.transpose_axes(p[0], &[2, 0, 1]));
    check(&[x()], |g, p| g.reshape(p[0], (4, 6)));
    check(&[x()], |g, p| g.flatten_2d(p[0]));
    check(&[x()], |g, p| g.narrow(p[0], 1, 1, 2));
    check(&[x()], |g, p| g.index_select(p[0], -1, &[3, 0, 3, 1]));
    check(&[x()], |g, p| g.repeat(p[0], 3, 0));
    check(&[input((4, 3), -1.0, 1.0, 23)], |g, p| g.rows(p[0], &[2, 2, 0]));
    check(
        &[x(), input((2, 1, 4), -1.0, 1.0, 24)],
        |g, p| g.concatenate(p, 1),
    );
}

fn index_constant(g: &mut CpuGraph, shape: impl Into<Shape>, data: Vec<i64>) -> stoat::Result<Expr> {
    g.constant(shape, init::from_vector::<CpuBackend, i64>(data), DType::I64)
}

#[test]
fn test_grad_index_operands() {
    let x = || input((3, 4), -1.0, 1.0, 27);
    check(&[x()], |g, p| {
        let idx = index_constant(g, 5, vec![2, 0, 2, 1, 2])?;
        g.rows_by(p[0], idx)
    });
    check(&[x()], |g, p| {
        let idx = index_constant(g, 2, vec![3, 3])?;
        g.cols_by(p[0], idx)
    });
    check(&[x()], |g, p| {
        let idx = index_constant(g, (3, 2), vec![0, 3, 1, 1, 2, 0])?;
        g.gather(p[0], -1, idx)
    });
    check(&[x()], |g, p| {
        let idx = index_constant(g, (2, 4), vec![2, 0, 1, 2, 0, 0, 2, 1])?;
        g.gather(p[0], 0, idx)
    });
}

// Reductions

#[test]
fn test_grad_reductions() {
    let x = || input((3, 4), -1.0, 1.0, 25);
    for axis in [0, 1, -1] {
        check(&[x()], |g, p| g.sum(p[0], axis));
        check(&[x()], |g, p| g.mean(p[0], axis));
        check(&[x()], |g, p| g.max(p[0], axis));
        check(&[x()], |g, p| g.min(p[0], axis));
        check(&[x()], |g, p| g.logsumexp(p[0], axis));
        check(&[x()], |g, p| g.softmax(p[0], axis));
        check(&[x()], |g, p| g.log_softmax(p[0], axis));
        check(&[x()], |g, p| g.var(p[0], axis));
        check(&[x()], |g, p| g.std(p[0], axis));
    }
    let nonzero = || input((3, 4), 0.5, 1.5, 28);
    for axis in [0, -1] {
        check(&[nonzero()], |g, p| g.prod(p[0], axis));
    }
}

#[test]
fn test_grad_softmax_masked() {
    let x = || input((3, 4), -1.0, 1.0, 29);
    let mask = vec![1.0, 1.0, 0.0, 1.0, 0.0, 1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 1.0];
    check(&[x()], |g, p| {
        let m = g.constant((3, 4), init::from_vector::<CpuBackend, f64>(mask.clone()), DType::F64)?;
        g.softmax_masked(p[0], m, -1)
    });
    // one mask row shared by every row
    check(&[x()], |g, p| {
        let m = g.constant(4, init::from_vector::<CpuBackend, f64>(vec![0.0, 1.0, 1.0, 0.0]), DType::F64)?;
        g.softmax_masked(p[0], m, 1)
    });
}

#[test]
fn test_softmax_masked_zeroes_masked_entries() -> stoat::Result<()> {
    let mut g = CpuGraph::new(CpuDevice);
    let x = g.constant(
        4,
        init::from_vector::<CpuBackend, f64>(vec![1.0, 5.0, 1.0, 1.0]),
        DType::F64,
    )?;
    let m = g.constant(
        4,
        init::from_vector::<CpuBackend, f64>(vec![1.0, 0.0, 1.0, 1.0]),
        DType::F64,
    )?;
    let y = g.softmax_masked(x, m, 0)?;
    g.forward()?;
    let out = g.to_f64_vec(y)?;
    assert_abs_diff_eq!(out[1], 0.0, epsilon = 1e-12);
    for &v in [out[0], out[2], out[3]].iter() {
        assert_abs_diff_eq!(v, 1.0 / 3.0, epsilon = 1e-12);
    }
    Ok(())
}

#[test]
fn test_prod_gradient_with_zeros() -> stoat::Result<()> {
    let mut g = CpuGraph::new(CpuDevice);
    let x = g.parameter(
        "x",
        (2, 3),
        init::from_vector::<CpuBackend, f64>(vec![2.0, 0.0, 5.0, 0.0, 3.0, 0.0]),
        DType::F64,
    )?;
    let y = g.prod(x, 1)?;
    g.forward()?;
    assert_eq!(g.to_f64_vec(y)?, vec![0.0, 0.0]);
    g.backward(y)?;
    assert_eq!(
        g.grad_to_f64_vec(x)?,
        Some(vec![0.0, 10.0, 0.0, 0.0, 0.0, 0.0])
    );
    Ok(())
}

#[test]
fn test_var_and_std_values() -> stoat::Result<()> {
    let mut g = CpuGraph::new(CpuDevice);
    let x = g.constant(
        (2, 4),
        init::from_vector::<CpuBackend, f64>(vec![2.0, 4.0, 4.0, 6.0, 1.0, 1.0, 1.0, 1.0]),
        DType::F64,
    )?;
    let v = g.var(x, -1)?;
    let s = g.std(x, -1)?;
    g.forward()?;
    assert_eq!(g.to_f64_vec(v)?, vec![2.0, 0.0]);
    assert_abs_diff_eq!(g.to_f64_vec(s)?[0], 2f64.sqrt(), epsilon = 1e-12);
    Ok(())
}

#[test]
fn test_index_out_of_range_fails_at_forward() -> stoat::Result<()> {
    let mut g = CpuGraph::new(CpuDevice);
    let x = g.constant((3, 2), init::ones::<CpuBackend>(), DType::F64)?;
    let idx = index_constant(&mut g, 2, vec![1, 3])?;
    let y = g.rows_by(x, idx)?;
    assert_eq!(g.shape(y)?, &Shape::from((2, 2)));
    assert_eq!(g.forward().unwrap_err().kind(), ErrorKind::Shape);
    assert!(!g.is_live(y)?);
    Ok(())
}

// Misc

#[test]
fn test_grad_clip() {
    let x = || input(9, -2.0, 2.0, 26);
    check(&[x()], |g, p| g.clip(p[0], 1.0));
}

#[test]
fn test_clip_gradient_clamps() -> stoat::Result<()> {
    let mut g = CpuGraph::new(CpuDevice);
    let x = g.parameter(
        "x",
        3,
        init::from_vector::<CpuBackend, f64>(vec![1.0, 2.0, 3.0]),
        DType::F64,
    )?;
    let c = g.clip_gradient(x, 0.5)?;
    let y = g.mul_scalar(c, 4.0)?;
    g.forward()?;
    assert_eq!(g.to_f64_vec(y)?, vec![4.0, 8.0, 12.0]);
    g.backward(y)?;
    assert_eq!(g.grad_to_f64_vec(x)?, Some(vec![0.5, 0.5, 0.5]));
    Ok(())
}

#[test]
fn test_debug_is_identity() -> stoat::Result<()> {
    let mut g = CpuGraph::new(CpuDevice);
    let x = g.parameter(
        "x",
        2,
        init::from_vector::<CpuBackend, f64>(vec![1.0, -1.0]),
        DType::F64,
    )?;
    let d = g.debug(x, "x after init")?;
    let y = g.square(d)?;
    g.forward()?;
    g.backward(y)?;
    assert_eq!(g.grad_to_f64_vec(x)?, Some(vec![2.0, -2.0]));
    Ok(())
}

#[test]
fn test_cast_roundtrip_gradient() -> stoat::Result<()> {
    let mut g = CpuGraph::new(CpuDevice);
    let x = g.parameter(
        "x",
        2,
        init::from_vector::<CpuBackend, f64>(vec![0.25, 0.5]),
        DType::F64,
    )?;
    let h = g.cast(x, DType::F32)?;
    let y = g.square(h)?;
    assert_eq!(g.dtype(y)?, DType::F32);
    g.forward()?;
    g.backward(y)?;
    assert_eq!(g.dtype(x)?, DType::F64);
    assert_eq!(g.grad_to_f64_vec(x)?, Some(vec![0.5, 1.0]));
    Ok(())
}

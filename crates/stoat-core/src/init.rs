// init — Leaf initializers
//
// Constants and parameters are materialized by an opaque producer that turns
// (shape, dtype, device, rng) into one buffer. The graph calls it once, the
// first time the leaf's value is needed.
//
// AVAILABLE INITIALIZERS:
//
//   zeros()                  — all zeros
//   ones()                   — all ones
//   from_value(v)            — all elements = v
//   from_vector(data)        — exact data (element count must match)
//   uniform(low, high)       — U(low, high)
//   normal(mean, std)        — N(mean, std)
//   glorot_uniform()         — Xavier/Glorot uniform
//
// Random initializers draw from the graph's seeded RNG, so two graphs built
// with the same seed and the same construction order get identical values.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::backend::Backend;
use crate::dtype::WithDType;
use crate::error::{Error, Result};
use crate::op::TensorMeta;
use crate::shape::Shape;

/// Opaque producer of a leaf buffer.
pub type Initializer<B> = Arc<
    dyn Fn(&TensorMeta, &<B as Backend>::Device, &mut StdRng) -> Result<<B as Backend>::Storage>
        + Send
        + Sync,
>;

/// Wrap a closure as an [`Initializer`].
pub fn from_fn<B, F>(f: F) -> Initializer<B>
where
    B: Backend,
    F: Fn(&TensorMeta, &B::Device, &mut StdRng) -> Result<B::Storage> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// All zeros.
pub fn zeros<B: Backend>() -> Initializer<B> {
    from_fn::<B, _>(|meta, device, _| B::zeros(&meta.shape, meta.dtype, device))
}

/// All ones.
pub fn ones<B: Backend>() -> Initializer<B> {
    from_fn::<B, _>(|meta, device, _| B::ones(&meta.shape, meta.dtype, device))
}

/// Every element set to `v`.
pub fn from_value<B: Backend>(v: f64) -> Initializer<B> {
    from_fn::<B, _>(move |meta, device, _| B::full(&meta.shape, v, meta.dtype, device))
}

/// Exact row-major data.
pub fn from_vector<B: Backend, T: WithDType>(data: Vec<T>) -> Initializer<B> {
    let data: Vec<f64> = data.into_iter().map(|v| v.to_f64()).collect();
    from_fn::<B, _>(move |meta, device, _| {
        if data.len() != meta.elem_count() {
            return Err(Error::ElementCountMismatch {
                shape: meta.shape.clone(),
                expected: meta.elem_count(),
                got: data.len(),
            });
        }
        B::from_f64_slice(&data, meta.dtype, device)
    })
}

/// Uniform distribution U(low, high).
pub fn uniform<B: Backend>(low: f64, high: f64) -> Initializer<B> {
    from_fn::<B, _>(move |meta, device, rng| {
        if !(low < high) {
            return Err(Error::msg(format!(
                "uniform initializer needs low < high, got [{low}, {high})"
            )));
        }
        let data: Vec<f64> = (0..meta.elem_count())
            .map(|_| rng.gen_range(low..high))
            .collect();
        B::from_f64_slice(&data, meta.dtype, device)
    })
}

/// Normal distribution N(mean, std).
pub fn normal<B: Backend>(mean: f64, std: f64) -> Initializer<B> {
    from_fn::<B, _>(move |meta, device, rng| {
        let dist = Normal::new(mean, std)
            .map_err(|e| Error::msg(format!("normal initializer N({mean}, {std}): {e}")))?;
        let data: Vec<f64> = (0..meta.elem_count()).map(|_| dist.sample(rng)).collect();
        B::from_f64_slice(&data, meta.dtype, device)
    })
}

/// Compute (fan_in, fan_out) from a shape.
///
/// - For 1-D: fan_in = fan_out = dims[0]
/// - For 2-D: fan_in = dims[0], fan_out = dims[1] (`x @ W` convention)
/// - For 3-D+: batch axes multiply both fans
fn compute_fans(shape: &Shape) -> (f64, f64) {
    let dims = shape.dims();
    match dims.len() {
        0 => (1.0, 1.0),
        1 => (dims[0] as f64, dims[0] as f64),
        n => {
            let batch: usize = dims[..n - 2].iter().product();
            (
                (dims[n - 2] * batch) as f64,
                (dims[n - 1] * batch) as f64,
            )
        }
    }
}

/// Glorot/Xavier uniform: U(-a, a) with a = sqrt(6 / (fan_in + fan_out)).
pub fn glorot_uniform<B: Backend>() -> Initializer<B> {
    from_fn::<B, _>(|meta, device, rng| {
        let (fan_in, fan_out) = compute_fans(&meta.shape);
        let a = (6.0 / (fan_in + fan_out)).sqrt();
        let data: Vec<f64> = (0..meta.elem_count())
            .map(|_| rng.gen_range(-a..a))
            .collect();
        B::from_f64_slice(&data, meta.dtype, device)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_fans() {
        assert_eq!(compute_fans(&Shape::from((4, 8))), (4.0, 8.0));
        assert_eq!(compute_fans(&Shape::from(5)), (5.0, 5.0));
        assert_eq!(compute_fans(&Shape::from((2, 4, 8))), (8.0, 16.0));
    }
}

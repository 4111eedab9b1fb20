// Host kernels — Index arithmetic and loops shared by the CPU backend
//
// Everything here works on plain contiguous slices in row-major order.
// Arithmetic kernels take f64 slices (the backend converts at the storage
// boundary); data-movement kernels are generic over the element type so that
// copying an I64 or U8 buffer never goes through floating point.
//
// PARALLELISM:
//
//   Element-wise maps, broadcasts and matrix rows are split across the rayon
//   pool once the output has at least PAR_THRESHOLD elements. Each output
//   element is still produced by exactly one sequential computation, so
//   results do not depend on the number of threads. Reductions along an axis
//   stay sequential: their summation order is part of the result.

use rayon::prelude::*;
use stoat_core::Shape;

/// Outputs smaller than this run on the calling thread.
pub const PAR_THRESHOLD: usize = 4096;

/// Offset into a source buffer of flat output index `i`, given the output
/// dims and the source stride of each output axis (0 on broadcast axes).
#[inline]
pub fn offset_of(mut i: usize, dims: &[usize], strides: &[usize]) -> usize {
    let mut offset = 0;
    for d in (0..dims.len()).rev() {
        let idx = i % dims[d];
        i /= dims[d];
        offset += idx * strides[d];
    }
    offset
}

/// result[i] = f(data[i])
pub fn map<F>(data: &[f64], f: F) -> Vec<f64>
where
    F: Fn(f64) -> f64 + Send + Sync,
{
    if data.len() >= PAR_THRESHOLD {
        data.par_iter().map(|&x| f(x)).collect()
    } else {
        data.iter().map(|&x| f(x)).collect()
    }
}

/// result = f(lhs, rhs) element-wise over the broadcast of both shapes.
pub fn zip_broadcast<F>(
    lhs: &[f64],
    lhs_shape: &Shape,
    rhs: &[f64],
    rhs_shape: &Shape,
    out_shape: &Shape,
    f: F,
) -> Vec<f64>
where
    F: Fn(f64, f64) -> f64 + Send + Sync,
{
    let n = out_shape.elem_count();

    if lhs_shape == rhs_shape {
        return if n >= PAR_THRESHOLD {
            lhs.par_iter().zip(rhs.par_iter()).map(|(&a, &b)| f(a, b)).collect()
        } else {
            lhs.iter().zip(rhs.iter()).map(|(&a, &b)| f(a, b)).collect()
        };
    }

    let dims = out_shape.dims();
    let ls = lhs_shape.broadcast_strides(out_shape);
    let rs = rhs_shape.broadcast_strides(out_shape);
    let at = |i: usize| f(lhs[offset_of(i, dims, &ls)], rhs[offset_of(i, dims, &rs)]);
    if n >= PAR_THRESHOLD {
        (0..n).into_par_iter().map(at).collect()
    } else {
        (0..n).map(at).collect()
    }
}

/// Gather `dims.iter().product()` elements from `src`, starting at `base`
/// and stepping by `strides` per output axis. Covers permute, broadcast and
/// narrow.
pub fn strided_copy<T>(src: &[T], dims: &[usize], strides: &[usize], base: usize) -> Vec<T>
where
    T: Copy + Send + Sync,
{
    let n: usize = dims.iter().product();
    let at = |i: usize| src[base + offset_of(i, dims, strides)];
    if n >= PAR_THRESHOLD {
        (0..n).into_par_iter().map(at).collect()
    } else {
        (0..n).map(at).collect()
    }
}

/// Fold along `axis`, keeping it with extent 1.
pub fn reduce<F>(data: &[f64], shape: &Shape, axis: usize, init: f64, f: F) -> Vec<f64>
where
    F: Fn(f64, f64) -> f64,
{
    let (outer, n, inner) = shape.split_at_axis(axis);
    let mut out = Vec::with_capacity(outer * inner);
    for o in 0..outer {
        for i in 0..inner {
            let mut acc = init;
            for k in 0..n {
                acc = f(acc, data[(o * n + k) * inner + i]);
            }
            out.push(acc);
        }
    }
    out
}

/// Batched `[m, k] @ [k, n]`. `batch_offsets[b]` holds the start of batch
/// `b`'s matrices in `lhs` and `rhs`.
pub fn matmul(
    lhs: &[f64],
    rhs: &[f64],
    batch_offsets: &[(usize, usize)],
    m: usize,
    k: usize,
    n: usize,
) -> Vec<f64> {
    let mut out = vec![0.0f64; batch_offsets.len() * m * n];
    let fill_row = |r: usize, row: &mut [f64]| {
        let (lo, ro) = batch_offsets[r / m];
        let i = r % m;
        for (j, slot) in row.iter_mut().enumerate() {
            let mut acc = 0.0;
            for p in 0..k {
                acc += lhs[lo + i * k + p] * rhs[ro + p * n + j];
            }
            *slot = acc;
        }
    };
    if out.len() * k >= PAR_THRESHOLD {
        out.par_chunks_mut(n)
            .enumerate()
            .for_each(|(r, row)| fill_row(r, row));
    } else {
        out.chunks_mut(n)
            .enumerate()
            .for_each(|(r, row)| fill_row(r, row));
    }
    out
}

/// Concatenate along `axis`. Shapes are pre-validated by the caller.
pub fn cat<T: Copy>(parts: &[(&[T], &Shape)], out_shape: &Shape, axis: usize) -> Vec<T> {
    let (outer, _, inner) = out_shape.split_at_axis(axis);
    let mut out = Vec::with_capacity(out_shape.elem_count());
    for o in 0..outer {
        for (data, shape) in parts {
            let chunk = shape.dims()[axis] * inner;
            out.extend_from_slice(&data[o * chunk..(o + 1) * chunk]);
        }
    }
    out
}

/// Pick `indices` along `axis`. Indices are pre-validated by the caller.
pub fn index_select<T: Copy>(data: &[T], shape: &Shape, axis: usize, indices: &[usize]) -> Vec<T> {
    let (outer, n, inner) = shape.split_at_axis(axis);
    let mut out = Vec::with_capacity(outer * indices.len() * inner);
    for o in 0..outer {
        for &idx in indices {
            let start = (o * n + idx) * inner;
            out.extend_from_slice(&data[start..start + inner]);
        }
    }
    out
}

/// Scatter-add `src` slices into a zero buffer of `out_shape` at `indices`.
pub fn index_add(
    src: &[f64],
    out_shape: &Shape,
    axis: usize,
    indices: &[usize],
) -> Vec<f64> {
    let (outer, n, inner) = out_shape.split_at_axis(axis);
    let k = indices.len();
    let mut out = vec![0.0f64; out_shape.elem_count()];
    for o in 0..outer {
        for (j, &idx) in indices.iter().enumerate() {
            let s = (o * k + j) * inner;
            let d = (o * n + idx) * inner;
            for i in 0..inner {
                out[d + i] += src[s + i];
            }
        }
    }
    out
}

/// Per-element gather along `axis`. `index_shape` agrees with `shape` off
/// `axis`; `indices` has one entry per output element.
pub fn gather<T: Copy>(
    data: &[T],
    shape: &Shape,
    axis: usize,
    indices: &[usize],
    index_shape: &Shape,
) -> Vec<T> {
    let n = shape.dims()[axis];
    let (outer, k, inner) = index_shape.split_at_axis(axis);
    let mut out = Vec::with_capacity(indices.len());
    for o in 0..outer {
        for j in 0..k {
            for i in 0..inner {
                let idx = indices[(o * k + j) * inner + i];
                out.push(data[(o * n + idx) * inner + i]);
            }
        }
    }
    out
}

/// Scatter-add each `src` element back to the position it was gathered from.
pub fn scatter_add(
    src: &[f64],
    index_shape: &Shape,
    out_shape: &Shape,
    axis: usize,
    indices: &[usize],
) -> Vec<f64> {
    let n = out_shape.dims()[axis];
    let (outer, k, inner) = index_shape.split_at_axis(axis);
    let mut out = vec![0.0f64; out_shape.elem_count()];
    for o in 0..outer {
        for j in 0..k {
            for i in 0..inner {
                let s = (o * k + j) * inner + i;
                out[(o * n + indices[s]) * inner + i] += src[s];
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_of_broadcast() {
        // [3] viewed as [2, 3]: stride 0 on the broadcast axis
        let dims = [2, 3];
        let strides = [0, 1];
        let offsets: Vec<usize> = (0..6).map(|i| offset_of(i, &dims, &strides)).collect();
        assert_eq!(offsets, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_zip_broadcast_column_row() {
        let a = [1.0, 2.0];
        let b = [10.0, 20.0, 30.0];
        let out = zip_broadcast(
            &a,
            &Shape::from((2, 1)),
            &b,
            &Shape::from((1, 3)),
            &Shape::from((2, 3)),
            |x, y| x + y,
        );
        assert_eq!(out, vec![11.0, 21.0, 31.0, 12.0, 22.0, 32.0]);
    }

    #[test]
    fn test_strided_copy_transpose() {
        // [[1, 2, 3], [4, 5, 6]]^T
        let src = [1, 2, 3, 4, 5, 6];
        let out = strided_copy(&src, &[3, 2], &[1, 3], 0);
        assert_eq!(out, vec![1, 4, 2, 5, 3, 6]);
    }

    #[test]
    fn test_gather_scatter_rows() {
        // [[1, 2, 3], [4, 5, 6]] gathered along axis 1 with [[2, 0], [1, 1]]
        let data = [1, 2, 3, 4, 5, 6];
        let shape = Shape::from((2, 3));
        let index_shape = Shape::from((2, 2));
        let idx = [2, 0, 1, 1];
        assert_eq!(gather(&data, &shape, 1, &idx, &index_shape), vec![3, 1, 5, 5]);

        let back = scatter_add(&[1.0, 2.0, 3.0, 4.0], &index_shape, &shape, 1, &idx);
        assert_eq!(back, vec![2.0, 0.0, 1.0, 0.0, 7.0, 0.0]);
    }

    #[test]
    fn test_reduce_middle_axis() {
        let data: Vec<f64> = (0..12).map(|v| v as f64).collect();
        let out = reduce(&data, &Shape::from((2, 3, 2)), 1, 0.0, |a, b| a + b);
        assert_eq!(out, vec![6.0, 9.0, 24.0, 27.0]);
    }

    #[test]
    fn test_matmul_2x2() {
        let a = [1.0, 2.0, 3.0, 4.0];
        let b = [5.0, 6.0, 7.0, 8.0];
        let out = matmul(&a, &b, &[(0, 0)], 2, 2, 2);
        assert_eq!(out, vec![19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn test_cat_and_index_ops() {
        let a = [1, 2, 3, 4];
        let b = [5, 6];
        let sa = Shape::from((2, 2));
        let sb = Shape::from((2, 1));
        let out = cat(&[(&a[..], &sa), (&b[..], &sb)], &Shape::from((2, 3)), 1);
        assert_eq!(out, vec![1, 2, 5, 3, 4, 6]);

        let picked = index_select(&out, &Shape::from((2, 3)), 1, &[2, 0, 2]);
        assert_eq!(picked, vec![5, 1, 5, 6, 3, 6]);

        let src = [1.0, 1.0, 1.0, 1.0, 1.0, 1.0];
        let back = index_add(&src, &Shape::from((2, 3)), 1, &[2, 0, 2]);
        assert_eq!(back, vec![1.0, 0.0, 2.0, 1.0, 0.0, 2.0]);
    }
}

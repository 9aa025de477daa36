use crate::loom::{engine::ExecError, num::Float, storage::Chunk};

/// Accumulates in `f32` regardless of the element type.
fn dot_typed<T: Float>(a: &Chunk, b: &Chunk, c: &Chunk, [m, k, n]: [usize; 3]) {
    #[cfg(not(feature = "rayon"))]
    let output: Vec<T> = a.read_with(|a: &[T]| {
        b.read_with(|b: &[T]| {
            itertools::iproduct!(0..m, 0..n)
                .map(|(i, j)| {
                    let acc: f32 = (0..k).map(|z| a[i * k + z].to_f32() * b[z * n + j].to_f32()).sum();
                    T::from_f32(acc)
                })
                .collect()
        })
    });
    #[cfg(feature = "rayon")]
    let output: Vec<T> = {
        use rayon::prelude::*;

        a.read_with(|a: &[T]| {
            b.read_with(|b: &[T]| {
                (0..m)
                    .into_par_iter()
                    .flat_map_iter(|i| {
                        (0..n).map(move |j| {
                            let acc: f32 =
                                (0..k).map(|z| a[i * k + z].to_f32() * b[z * n + j].to_f32()).sum();
                            T::from_f32(acc)
                        })
                    })
                    .collect()
            })
        })
    };
    c.write_with(|c: &mut [T]| c.copy_from_slice(&output));
}

/// `c = a · b` for row-major `a: [m, k]`, `b: [k, n]` and `c: [m, n]`.
pub fn dot(a: &Chunk, b: &Chunk, c: &Chunk, dims: [usize; 3]) -> Result<(), ExecError> {
    let [m, k, n] = dims;
    if a.len() != m * k || b.len() != k * n || c.len() != m * n {
        return Err(ExecError::Failed(format!("dot of [{m}, {k}] and [{k}, {n}] mismatches storage")));
    }
    dispatch_float!(c.data_type(), T => {
        dot_typed::<T>(a, b, c, dims);
        Ok(())
    })
}

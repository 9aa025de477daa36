use std::sync::Arc;

use itertools::Itertools;

use crate::{
    hal::ops::{BinaryOp, ScalarOp},
    loom::{
        engine::ExecError,
        num::Float,
        storage::Chunk,
    },
};

fn binary_typed<T: Float>(op: BinaryOp, lhs: &Chunk, rhs: &Chunk, output: &Chunk) {
    #[cfg(not(feature = "rayon"))]
    let z: Vec<T> = lhs.read_with(|x: &[T]| {
        rhs.read_with(|y: &[T]| {
            x.iter()
                .zip_eq(y.iter())
                .map(|(&x, &y)| op.apply(x, y))
                .collect()
        })
    });
    #[cfg(feature = "rayon")]
    let z: Vec<T> = {
        use rayon::prelude::*;

        lhs.read_with(|x: &[T]| {
            rhs.read_with(|y: &[T]| {
                x.par_iter()
                    .zip_eq(y.par_iter())
                    .map(|(&x, &y)| op.apply(x, y))
                    .collect()
            })
        })
    };
    output.write_with(|output: &mut [T]| output.copy_from_slice(&z));
}

/// `output = lhs op rhs`, elementwise.
pub fn binary(op: BinaryOp, lhs: &Chunk, rhs: &Chunk, output: &Chunk) -> Result<(), ExecError> {
    dispatch_float!(output.data_type(), T => {
        binary_typed::<T>(op, lhs, rhs, output);
        Ok(())
    })
}

fn scalar_typed<T: Float>(op: ScalarOp, input: &Chunk, s: f32, output: &Chunk) {
    let s = T::from_f32(s);
    #[cfg(not(feature = "rayon"))]
    let z: Vec<T> = input.read_with(|x: &[T]| x.iter().map(|&x| op.apply(x, s)).collect());
    #[cfg(feature = "rayon")]
    let z: Vec<T> = {
        use rayon::prelude::*;
        input.read_with(|x: &[T]| x.par_iter().map(|&x| op.apply(x, s)).collect())
    };
    output.write_with(|output: &mut [T]| output.copy_from_slice(&z));
}

/// `output = input op s`, elementwise.
pub fn scalar(op: ScalarOp, input: &Chunk, s: f32, output: &Chunk) -> Result<(), ExecError> {
    dispatch_float!(output.data_type(), T => {
        scalar_typed::<T>(op, input, s, output);
        Ok(())
    })
}

/// Fills `output` with `value`.
pub fn set_value(value: f32, output: &Chunk) -> Result<(), ExecError> {
    dispatch_float!(output.data_type(), T => {
        let value = T::from_f32(value);
        output.write_with(|output: &mut [T]| output.fill(value));
        Ok(())
    })
}

fn clip_typed<T: Float>(input: &Chunk, min: f32, max: f32, output: &Chunk) {
    let (min, max) = (T::from_f32(min), T::from_f32(max));
    let clip = |x: T| match x {
        x if x < min => min,
        x if x > max => max,
        x => x,
    };
    let z: Vec<T> = input.read_with(|x: &[T]| x.iter().map(|&x| clip(x)).collect());
    output.write_with(|output: &mut [T]| output.copy_from_slice(&z));
}

/// Clamps every element of `input` into `[min, max]`.
pub fn clip(input: &Chunk, min: f32, max: f32, output: &Chunk) -> Result<(), ExecError> {
    dispatch_float!(output.data_type(), T => {
        clip_typed::<T>(input, min, max, output);
        Ok(())
    })
}

/// Copies the raw contents. Both chunks must hold the same type and length.
pub fn copy(input: &Chunk, output: &Chunk) -> Result<(), ExecError> {
    let data = input.read_bytes(|x| x.to_vec());
    output.write_bytes(|output| match output.len() == data.len() {
        true => {
            output.copy_from_slice(&data);
            Ok(())
        }
        false => Err(ExecError::Failed(format!(
            "copy of {} bytes into {} bytes",
            data.len(),
            output.len()
        ))),
    })
}

fn sum_typed<T: Float>(inputs: &[Arc<Chunk>], output: &Chunk) {
    let mut z = vec![T::zeroed(); output.len()];
    for input in inputs {
        input.read_with(|x: &[T]| {
            z.iter_mut()
                .zip_eq(x.iter())
                .for_each(|(z, &x)| *z = *z + x)
        });
    }
    output.write_with(|output: &mut [T]| output.copy_from_slice(&z));
}

/// `output = sum(inputs)`. An empty input list produces zeros.
pub fn elementwise_sum(inputs: &[Arc<Chunk>], output: &Chunk) -> Result<(), ExecError> {
    dispatch_float!(output.data_type(), T => {
        sum_typed::<T>(inputs, output);
        Ok(())
    })
}

use crate::loom::{engine::ExecError, num::Float, storage::Chunk};

/// Reads a stored index as a column below `k`.
fn column<T: Float>(index: T, k: usize) -> Result<usize, ExecError> {
    let value = index.to_f32();
    match value.fract() == 0.0 && value >= 0.0 && (value as usize) < k {
        true => Ok(value as usize),
        false => Err(ExecError::Failed(format!("index {value} is not a column of 0..{k}"))),
    }
}

fn columns<T: Float>(index: &Chunk, k: usize) -> Result<Vec<usize>, ExecError> {
    index.read_with(|x: &[T]| x.iter().map(|&x| column(x, k)).collect())
}

fn one_hot_typed<T: Float>(index: &Chunk, output: &Chunk, [n, k]: [usize; 2]) -> Result<(), ExecError> {
    let columns = columns::<T>(index, k)?;
    let mut z = vec![T::from_f32(0.0); n * k];
    for (row, col) in columns.into_iter().enumerate() {
        z[row * k + col] = T::from_f32(1.0);
    }
    output.write_with(|output: &mut [T]| output.copy_from_slice(&z));
    Ok(())
}

/// Writes one-hot rows `output: [n, k]` for the columns in `index: [n]`.
pub fn one_hot(index: &Chunk, output: &Chunk, dims: [usize; 2]) -> Result<(), ExecError> {
    let [n, k] = dims;
    if index.len() != n || output.len() != n * k {
        return Err(ExecError::Failed(format!("one-hot of {n} rows by {k} mismatches storage")));
    }
    dispatch_float!(output.data_type(), T => one_hot_typed::<T>(index, output, dims))
}

fn choose_typed<T: Float>(
    input: &Chunk,
    index: &Chunk,
    output: &Chunk,
    [_, k]: [usize; 2],
) -> Result<(), ExecError> {
    let columns = columns::<T>(index, k)?;
    let z: Vec<T> = input.read_with(|x: &[T]| {
        columns
            .iter()
            .enumerate()
            .map(|(row, &col)| x[row * k + col])
            .collect()
    });
    output.write_with(|output: &mut [T]| output.copy_from_slice(&z));
    Ok(())
}

/// `output[i] = input[i, index[i]]` for `input: [n, k]`.
pub fn choose_element(
    input: &Chunk,
    index: &Chunk,
    output: &Chunk,
    dims: [usize; 2],
) -> Result<(), ExecError> {
    let [n, k] = dims;
    if input.len() != n * k || index.len() != n || output.len() != n {
        return Err(ExecError::Failed(format!("choice from {n} rows by {k} mismatches storage")));
    }
    dispatch_float!(output.data_type(), T => choose_typed::<T>(input, index, output, dims))
}

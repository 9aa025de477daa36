//! Lazily allocated tensor storage and its scheduled teardown.

use std::sync::RwLock;

use super::{
    device::Context,
    engine::{Engine, Executor, Var},
    num::{DataType, Scalar},
};

/// Raw element memory. Backed by `u32` words so every supported element type is aligned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buffer {
    words: Box<[u32]>,
    len: usize,
}

impl Buffer {
    /// Creates a buffer of `len` zeroed bytes.
    pub fn zeroed(len: usize) -> Self {
        let words = vec![0u32; len.div_ceil(4)].into_boxed_slice();
        Self { words, len }
    }

    /// Length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.words)[..self.len]
    }

    #[inline]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut(&mut self.words)[..self.len]
    }

    #[inline]
    pub fn as_slice<T: Scalar>(&self) -> &[T] {
        bytemuck::cast_slice(self.bytes())
    }

    #[inline]
    pub fn as_mut_slice<T: Scalar>(&mut self) -> &mut [T] {
        bytemuck::cast_slice_mut(self.bytes_mut())
    }
}

/// The storage shared by every handle cloned from one tensor.
///
/// Memory is allocated by the first write. Access to the buffer is only sound from operation
/// bodies that declared the chunk's variable, or after a blocking wait on it; the lock here only
/// guards against a misbehaving body.
#[derive(Debug)]
pub struct Chunk {
    var: Var,
    context: Context,
    r#type: DataType,
    /// Number of elements.
    len: usize,
    data: RwLock<Option<Buffer>>,
    engine: Engine,
}

impl Chunk {
    pub fn new(engine: Engine, context: Context, r#type: DataType, len: usize) -> Self {
        let var = engine.new_variable();
        Self {
            var,
            context,
            r#type,
            len,
            data: RwLock::new(None),
            engine,
        }
    }

    #[inline]
    pub fn var(&self) -> Var {
        self.var
    }

    #[inline]
    pub fn context(&self) -> Context {
        self.context
    }

    #[inline]
    pub fn data_type(&self) -> DataType {
        self.r#type
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Returns `true` once memory has been allocated.
    pub fn is_allocated(&self) -> bool {
        self.data.read().expect("failed to lock").is_some()
    }

    /// Allocates zeroed memory if nothing has been written yet.
    pub fn check_and_alloc(&self) {
        let mut data = self.data.write().expect("failed to lock");
        if data.is_none() {
            *data = Some(Buffer::zeroed(self.len * self.r#type.size()));
        }
    }

    /// Reads the elements. Storage that was never written reads as zeros.
    pub fn read_with<T: Scalar, R>(&self, f: impl FnOnce(&[T]) -> R) -> R {
        debug_assert_eq!(T::DATA_TYPE, self.r#type);
        let data = self.data.read().expect("failed to lock");
        match data.as_ref() {
            Some(buffer) => f(buffer.as_slice()),
            None => f(&vec![T::zeroed(); self.len]),
        }
    }

    /// Writes the elements, allocating on first use.
    pub fn write_with<T: Scalar, R>(&self, f: impl FnOnce(&mut [T]) -> R) -> R {
        debug_assert_eq!(T::DATA_TYPE, self.r#type);
        let mut data = self.data.write().expect("failed to lock");
        let buffer = data.get_or_insert_with(|| Buffer::zeroed(self.len * self.r#type.size()));
        f(buffer.as_mut_slice())
    }

    /// Reads the raw bytes.
    pub fn read_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let data = self.data.read().expect("failed to lock");
        match data.as_ref() {
            Some(buffer) => f(buffer.bytes()),
            None => f(&vec![0u8; self.len * self.r#type.size()]),
        }
    }

    /// Writes the raw bytes, allocating on first use.
    pub fn write_bytes<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut data = self.data.write().expect("failed to lock");
        let buffer = data.get_or_insert_with(|| Buffer::zeroed(self.len * self.r#type.size()));
        f(buffer.bytes_mut())
    }
}

impl Drop for Chunk {
    /// Hands the memory to a teardown operation that runs after every pending use.
    fn drop(&mut self) {
        let data = self.data.get_mut().map(Option::take).unwrap_or_default();
        let context = self.context;
        let f = move || drop(data);
        if let Err(err) = self.engine.delete_variable(context, self.var, f) {
            log::error!("failed to schedule deletion of {}: {err}", self.var);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use half::f16;

    use super::{Buffer, Chunk};
    use crate::loom::{
        device::Context,
        engine::{Engine, Executor, NaiveEngine},
        num::DataType,
    };

    #[test]
    fn test_buffer() {
        let mut buffer = Buffer::zeroed(6);
        assert_eq!(buffer.len(), 6);
        buffer
            .as_mut_slice::<f16>()
            .copy_from_slice(&[f16::ONE, f16::NEG_ONE, f16::ZERO]);
        assert_eq!(buffer.as_slice::<f16>(), &[f16::ONE, f16::NEG_ONE, f16::ZERO]);
        assert_eq!(buffer.bytes().len(), 6);
    }

    #[test]
    fn test_chunk_teardown() -> Result<(), Box<dyn Error>> {
        let naive = NaiveEngine::new();
        let engine = Engine::Naive(naive.clone());

        let chunk = Chunk::new(engine.clone(), Context::cpu(), DataType::F32, 4);
        assert!(!chunk.is_allocated());
        assert_eq!(chunk.read_with(|x: &[f32]| x.to_vec()), vec![0.0; 4]);
        assert!(!chunk.is_allocated());

        chunk.write_with(|x: &mut [f32]| x[2] = 1.5);
        assert!(chunk.is_allocated());
        assert_eq!(chunk.read_with(|x: &[f32]| x[2]), 1.5);

        let var = chunk.var();
        assert_eq!(naive.num_variables(), 1);
        drop(chunk);
        assert_eq!(naive.num_variables(), 0);
        assert!(engine.wait_to_read(var).is_err());
        Ok(())
    }
}

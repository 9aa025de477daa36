use std::sync::Arc;

use thiserror::Error;

use super::{
    device::Context,
    engine::{Engine, EngineError, Executor, Var},
    num::{DataType, Scalar},
    shape::{IntoShape, Shape},
    storage::Chunk,
};

#[derive(Debug, Error)]
pub enum TensorError {
    #[error("tensor shape error: expected {expected}, found {found}")]
    ShapeMismatch { expected: Shape, found: Shape },
    #[error("tensor context error: expected {expected}, found {found}")]
    ContextMismatch { expected: Context, found: Context },
    #[error("invalid tensor format: {0}")]
    InvalidFormat(String),
    #[error("unsupported data type: {0}")]
    UnsupportedType(String),
    #[error("tensor handle is not initialized")]
    UninitializedHandle,
    #[error("tensor must have a non-zero rank")]
    ZeroRank,
    #[error("function {name} expects {expected} {kind}, found {found}")]
    ArgumentCount {
        name: String,
        kind: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("unknown tensor function: {0}")]
    UnknownFunction(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl TensorError {
    #[inline]
    pub(crate) fn shape(expected: &Shape, found: &Shape) -> Self {
        Self::ShapeMismatch {
            expected: expected.clone(),
            found: found.clone(),
        }
    }

    #[inline]
    pub(crate) fn context(expected: Context, found: Context) -> Self {
        Self::ContextMismatch { expected, found }
    }
}

/// A lazy handle to a dense tensor.
///
/// Clones share the same storage and variable. Every operation on a handle is deferred into the
/// [`Engine`] that owns its storage; only the blocking accessors ([`NDArray::wait_to_read`],
/// [`NDArray::sync_copy_to_cpu`], ...) synchronize with pending work.
///
/// The default handle is *none*: it has no storage and may be used as the output of exactly one
/// allocating operation.
#[derive(Debug, Default, Clone)]
pub struct NDArray {
    chunk: Option<Arc<Chunk>>,
    shape: Shape,
}

impl NDArray {
    /// Creates a handle without storage.
    #[inline]
    pub fn none() -> Self {
        Self::default()
    }

    /// Creates a tensor on the process-wide engine. Memory is allocated by the first write.
    pub fn empty(
        shape: impl IntoShape,
        context: Context,
        r#type: DataType,
    ) -> Result<Self, TensorError> {
        Self::empty_in(Engine::get(), shape, context, r#type)
    }

    /// Creates a tensor on a specific engine.
    pub fn empty_in(
        engine: &Engine,
        shape: impl IntoShape,
        context: Context,
        r#type: DataType,
    ) -> Result<Self, TensorError> {
        let shape = shape.into_shape();
        if shape.ndim() == 0 {
            return Err(TensorError::ZeroRank);
        }
        let len = shape
            .checked_size()
            .ok_or_else(|| TensorError::InvalidFormat(format!("shape {shape} overflows")))?;
        let chunk = Arc::new(Chunk::new(engine.clone(), context, r#type, len));
        let chunk = Some(chunk);
        Ok(Self { chunk, shape })
    }

    /// Creates a tensor with the same engine, shape, context and type.
    pub fn empty_like(&self) -> Result<Self, TensorError> {
        let chunk = self.chunk()?;
        Self::empty_in(
            chunk.engine(),
            self.shape.clone(),
            chunk.context(),
            chunk.data_type(),
        )
    }

    /// Creates a host tensor from the given contents.
    pub fn from_slice<T: Scalar>(shape: impl IntoShape, data: &[T]) -> Result<Self, TensorError> {
        let output = Self::empty(shape, Context::cpu(), T::DATA_TYPE)?;
        output.sync_copy_from_cpu(data)?;
        Ok(output)
    }

    #[inline]
    pub fn is_none(&self) -> bool {
        self.chunk.is_none()
    }

    #[inline]
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    #[inline]
    pub fn context(&self) -> Option<Context> {
        self.chunk.as_ref().map(|chunk| chunk.context())
    }

    #[inline]
    pub fn data_type(&self) -> Option<DataType> {
        self.chunk.as_ref().map(|chunk| chunk.data_type())
    }

    #[inline]
    pub fn var(&self) -> Option<Var> {
        self.chunk.as_ref().map(|chunk| chunk.var())
    }

    #[inline]
    pub fn engine(&self) -> Option<&Engine> {
        self.chunk.as_ref().map(|chunk| chunk.engine())
    }

    /// Returns `true` if both handles share storage.
    #[inline]
    pub fn same_storage(&self, other: &NDArray) -> bool {
        match (&self.chunk, &other.chunk) {
            (Some(x), Some(y)) => Arc::ptr_eq(x, y),
            _ => false,
        }
    }

    #[inline]
    pub(crate) fn chunk(&self) -> Result<&Arc<Chunk>, TensorError> {
        self.chunk.as_ref().ok_or(TensorError::UninitializedHandle)
    }

    /// Checks the element type against `T`.
    pub(crate) fn check_type<T: Scalar>(&self) -> Result<&Arc<Chunk>, TensorError> {
        let chunk = self.chunk()?;
        match chunk.data_type() == T::DATA_TYPE {
            true => Ok(chunk),
            false => Err(TensorError::UnsupportedType(format!(
                "tensor holds {}, accessed as {}",
                chunk.data_type(),
                T::DATA_TYPE
            ))),
        }
    }

    /// Returns a handle sharing storage with a different shape of the same size.
    pub fn reshape(&self, shape: impl IntoShape) -> Result<Self, TensorError> {
        let shape = shape.into_shape();
        self.chunk()?;
        if shape.ndim() == 0 {
            return Err(TensorError::ZeroRank);
        }
        if shape.size() != self.shape.size() {
            return Err(TensorError::shape(&self.shape, &shape));
        }
        let chunk = self.chunk.clone();
        Ok(Self { chunk, shape })
    }

    /// Blocks until the pending writer of this tensor has completed.
    pub fn wait_to_read(&self) -> Result<(), TensorError> {
        match &self.chunk {
            Some(chunk) => Ok(chunk.engine().wait_to_read(chunk.var())?),
            None => Ok(()),
        }
    }

    /// Blocks until every pending operation on this tensor has completed.
    pub fn wait_to_write(&self) -> Result<(), TensorError> {
        match &self.chunk {
            Some(chunk) => Ok(chunk.engine().wait_to_write(chunk.var())?),
            None => Ok(()),
        }
    }

    /// Overwrites the contents from host memory, after every pending operation on the tensor.
    pub fn sync_copy_from_cpu<T: Scalar>(&self, data: &[T]) -> Result<(), TensorError> {
        let chunk = self.check_type::<T>()?;
        if data.len() != self.shape.size() {
            return Err(TensorError::shape(&self.shape, &data.len().into_shape()));
        }
        self.wait_to_write()?;
        chunk.write_with(|output: &mut [T]| output.copy_from_slice(data));
        Ok(())
    }

    /// Copies the contents into host memory, after the pending writer of the tensor.
    pub fn sync_copy_to_cpu<T: Scalar>(&self, data: &mut [T]) -> Result<(), TensorError> {
        let chunk = self.check_type::<T>()?;
        if data.len() != self.shape.size() {
            return Err(TensorError::shape(&self.shape, &data.len().into_shape()));
        }
        self.wait_to_read()?;
        chunk.read_with(|input: &[T]| data.copy_from_slice(input));
        Ok(())
    }

    /// Blocks and reads the contents back.
    pub fn to_vec<T: Scalar>(&self) -> Result<Vec<T>, TensorError> {
        let chunk = self.check_type::<T>()?;
        self.wait_to_read()?;
        Ok(chunk.read_with(|input: &[T]| input.to_vec()))
    }

    /// Reads the contents back once the pending writer has completed.
    pub async fn back<T: Scalar>(&self) -> Result<Box<[T]>, TensorError> {
        let chunk = self.check_type::<T>()?.clone();
        chunk.engine().wait_to_read_async(chunk.var()).await?;
        Ok(chunk.read_with(|input: &[T]| input.into()))
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use half::f16;
    use itertools::Itertools;

    use super::{NDArray, TensorError};
    use crate::loom::{
        device::Context,
        engine::{Engine, EngineBuilder, EngineKind},
        num::DataType,
    };

    #[test]
    fn test_none() -> Result<(), Box<dyn Error>> {
        let x = NDArray::none();
        assert!(x.is_none());
        assert!(x.context().is_none());
        x.wait_to_read()?;
        x.wait_to_write()?;
        assert!(matches!(
            x.to_vec::<f32>(),
            Err(TensorError::UninitializedHandle)
        ));
        assert!(matches!(
            NDArray::empty([0usize; 0], Context::cpu(), DataType::F32),
            Err(TensorError::ZeroRank)
        ));
        Ok(())
    }

    #[test]
    fn test_sync_copy() -> Result<(), Box<dyn Error>> {
        let data = (0..12).map(|x| f16::from_f32(x as f32)).collect_vec();
        let x = NDArray::from_slice([4, 3], &data)?;
        assert_eq!(x.shape().to_array::<2>(), Some([4, 3]));
        assert_eq!(x.data_type(), Some(DataType::F16));
        assert_eq!(x.to_vec::<f16>()?, data);

        assert!(matches!(
            x.to_vec::<f32>(),
            Err(TensorError::UnsupportedType(_))
        ));
        assert!(matches!(
            x.sync_copy_from_cpu(&data[..6]),
            Err(TensorError::ShapeMismatch { .. })
        ));

        let y = x.reshape([2, 6])?;
        assert!(y.same_storage(&x));
        let mut output = vec![f16::ZERO; 12];
        y.sync_copy_to_cpu(&mut output)?;
        assert_eq!(output, data);
        assert!(matches!(
            x.reshape([5, 3]),
            Err(TensorError::ShapeMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_naive_engine() -> Result<(), Box<dyn Error>> {
        let engine = EngineBuilder::new().kind(EngineKind::Naive).build();
        assert!(matches!(engine, Engine::Naive(_)));

        let x = NDArray::empty_in(&engine, [2, 2], Context::gpu(0), DataType::F32)?;
        x.sync_copy_from_cpu(&[1.0f32, 2.0, 3.0, 4.0])?;
        assert_eq!(x.to_vec::<f32>()?, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(x.context(), Some(Context::gpu(0)));
        Ok(())
    }

    #[tokio::test]
    async fn test_back() -> Result<(), Box<dyn Error>> {
        let data = (0..16).map(|x| x as f32).collect_vec();
        let x = NDArray::from_slice([16], &data)?;
        let output = x.back::<f32>().await?;
        assert_eq!(output.as_ref(), &data[..]);
        Ok(())
    }
}

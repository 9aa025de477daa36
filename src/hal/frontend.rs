use std::sync::Arc;

use super::{
    cpu,
    ops::{BinaryOp, SampleOp, ScalarOp},
};
use crate::loom::{
    device::{Context, DeviceKind},
    engine::{Engine, Executor, Lane, OpDesc, PRIORITY_NORMAL, Priority, RunContext},
    num::DataType,
    resource::ResourceManager,
    shape::{IntoShape, Shape},
    storage::Chunk,
    tensor::{NDArray, TensorError},
};

fn submit(engine: &Engine, op: OpDesc) -> Result<(), TensorError> {
    // failures surface at the next wait on an affected tensor
    engine.submit(op)?;
    Ok(())
}

fn check_float(chunk: &Chunk) -> Result<DataType, TensorError> {
    match chunk.data_type() {
        r#type if r#type.is_float() => Ok(r#type),
        other => Err(TensorError::UnsupportedType(format!(
            "arithmetic on {other} tensors is not supported"
        ))),
    }
}

fn check_same_type(expected: DataType, chunk: &Chunk) -> Result<(), TensorError> {
    match chunk.data_type() == expected {
        true => Ok(()),
        false => Err(TensorError::UnsupportedType(format!(
            "operands mix {expected} and {}",
            chunk.data_type()
        ))),
    }
}

/// Allocates `out` if it is none, otherwise checks its shape and type.
fn prepare_output(
    out: &mut NDArray,
    engine: &Engine,
    shape: Shape,
    context: Context,
    r#type: DataType,
) -> Result<Arc<Chunk>, TensorError> {
    if out.is_none() {
        *out = NDArray::empty_in(engine, shape, context, r#type)?;
    } else {
        if out.shape() != &shape {
            return Err(TensorError::shape(&shape, out.shape()));
        }
        check_same_type(r#type, out.chunk()?)?;
    }
    Ok(out.chunk()?.clone())
}

/// Sizes the kernels of ops that are not elementwise work on.
fn kernel_dims(op: BinaryOp, lhs: &Shape, rhs: &Shape) -> [usize; 3] {
    match (op, lhs.to_array(), rhs.to_array()) {
        (BinaryOp::Dot, Some([m, k]), Some([_, n])) => [m, k, n],
        (BinaryOp::OneHotEncode, _, Some([n, k])) => [n, k, 1],
        (BinaryOp::ChooseElement, Some([n, k]), _) => [n, k, 1],
        _ => [0; 3],
    }
}

/// `out = lhs op rhs`. Allocates `out` on the context of `lhs` if it is none.
///
/// Operands on host contexts may be mixed freely; otherwise all contexts must be equal.
pub fn binary_op(
    lhs: &NDArray,
    rhs: &NDArray,
    op: BinaryOp,
    out: &mut NDArray,
) -> Result<(), TensorError> {
    let x = lhs.chunk()?.clone();
    let y = rhs.chunk()?.clone();
    if !x.context().is_compatible(&y.context()) {
        return Err(TensorError::context(x.context(), y.context()));
    }
    let r#type = check_float(&x)?;
    check_same_type(r#type, &y)?;
    let shape = op.infer_shape(lhs.shape(), rhs.shape())?;
    if let Some(found) = out.context().filter(|z| !z.is_compatible(&x.context())) {
        return Err(TensorError::context(x.context(), found));
    }
    let z = prepare_output(out, x.engine(), shape, x.context(), r#type)?;

    let dims = kernel_dims(op, lhs.shape(), rhs.shape());
    let context = x.context();
    let (reads, writes) = ([x.var(), y.var()], [z.var()]);
    let engine = z.engine().clone();
    let body = move |run: &RunContext| {
        run.launch(move || match (op, dims) {
            (BinaryOp::Dot, dims) => cpu::dot(&x, &y, &z, dims),
            (BinaryOp::OneHotEncode, [n, k, _]) => cpu::one_hot(&x, &z, [n, k]),
            (BinaryOp::ChooseElement, [n, k, _]) => cpu::choose_element(&x, &y, &z, [n, k]),
            (op, _) => cpu::binary(op, &x, &y, &z),
        })
    };
    let op = OpDesc::new(op.to_string(), context, body)
        .reads(reads)
        .writes(writes);
    submit(&engine, op)
}

/// `out = lhs op s`. Allocates `out` on the context of `lhs` if it is none.
pub fn scalar_op(lhs: &NDArray, s: f32, op: ScalarOp, out: &mut NDArray) -> Result<(), TensorError> {
    let x = lhs.chunk()?.clone();
    let r#type = check_float(&x)?;
    if let Some(found) = out.context().filter(|&z| z != x.context()) {
        return Err(TensorError::context(x.context(), found));
    }
    let z = prepare_output(out, x.engine(), lhs.shape().clone(), x.context(), r#type)?;

    let context = x.context();
    let (reads, writes) = ([x.var()], [z.var()]);
    let engine = z.engine().clone();
    let body = move |run: &RunContext| run.launch(move || cpu::scalar(op, &x, s, &z));
    let op = OpDesc::new(op.to_string(), context, body)
        .reads(reads)
        .writes(writes);
    submit(&engine, op)
}

/// Fills an initialized tensor with `value`.
pub fn set_value(value: f32, out: &NDArray) -> Result<(), TensorError> {
    let z = out.chunk()?.clone();
    check_float(&z)?;

    let context = z.context();
    let writes = [z.var()];
    let engine = z.engine().clone();
    let body = move |run: &RunContext| run.launch(move || cpu::set_value(value, &z));
    let op = OpDesc::new("_set_value", context, body).writes(writes);
    submit(&engine, op)
}

/// Picks the context and lane that run a copy between two contexts.
fn copy_lane(from: Context, to: Context) -> (Context, Lane) {
    match (from.kind, to.kind) {
        (DeviceKind::Cpu, DeviceKind::Cpu) => (from, Lane::Normal),
        (DeviceKind::Cpu, DeviceKind::Gpu) => (to, Lane::CopyToGpu),
        (DeviceKind::Gpu, DeviceKind::Cpu) => (from, Lane::CopyFromGpu),
        (DeviceKind::Gpu, DeviceKind::Gpu) if from == to => (from, Lane::Normal),
        (DeviceKind::Gpu, DeviceKind::Gpu) => (from, Lane::CopyFromGpu),
    }
}

/// Copies the contents of `from` into the initialized tensor `to`, across devices if needed.
pub fn copy_from_to(from: &NDArray, to: &NDArray, priority: Priority) -> Result<(), TensorError> {
    let x = from.chunk()?.clone();
    let z = to.chunk()?.clone();
    if from.shape() != to.shape() {
        return Err(TensorError::shape(from.shape(), to.shape()));
    }
    if from.shape().ndim() == 0 {
        return Err(TensorError::ZeroRank);
    }
    check_same_type(x.data_type(), &z)?;

    let (context, lane) = copy_lane(x.context(), z.context());
    let (reads, writes) = ([x.var()], [z.var()]);
    let engine = z.engine().clone();
    let body = move |run: &RunContext| run.launch(move || cpu::copy(&x, &z));
    let op = OpDesc::new("_copyto", context, body)
        .reads(reads)
        .writes(writes)
        .lane(lane)
        .priority(priority);
    submit(&engine, op)
}

/// `out = sum(sources)`. Allocates `out` like the first source if it is none.
///
/// A host output accepts sources from any host context; an accelerator output requires every
/// source on its own context.
pub fn elementwise_sum(
    sources: &[NDArray],
    out: &mut NDArray,
    priority: Priority,
) -> Result<(), TensorError> {
    let (engine, shape, context, r#type) = match out.chunk() {
        Ok(z) => (z.engine(), out.shape(), z.context(), z.data_type()),
        Err(_) => {
            let first = sources.first().ok_or(TensorError::UninitializedHandle)?;
            let x = first.chunk()?;
            (x.engine(), first.shape(), x.context(), x.data_type())
        }
    };
    if !r#type.is_float() {
        return Err(TensorError::UnsupportedType(format!(
            "arithmetic on {} tensors is not supported",
            r#type
        )));
    }

    let mut inputs = Vec::with_capacity(sources.len());
    for source in sources {
        let x = source.chunk()?;
        if source.shape() != shape {
            return Err(TensorError::shape(shape, source.shape()));
        }
        let compatible = match context.kind {
            DeviceKind::Cpu => x.context().is_cpu(),
            DeviceKind::Gpu => x.context() == context,
        };
        if !compatible {
            return Err(TensorError::context(context, x.context()));
        }
        check_same_type(r#type, x)?;
        inputs.push(x.clone());
    }
    let (engine, shape) = (engine.clone(), shape.clone());
    let z = prepare_output(out, &engine, shape, context, r#type)?;

    let reads = inputs.iter().map(|x| x.var()).collect::<Vec<_>>();
    let writes = [z.var()];
    let body = move |run: &RunContext| run.launch(move || cpu::elementwise_sum(&inputs, &z));
    let op = OpDesc::new("elementwise_sum", context, body)
        .reads(reads)
        .writes(writes)
        .priority(priority);
    submit(&engine, op)
}

/// `out = clip(src, min, max)`. Allocates `out` on the context of `src` if it is none.
pub fn clip(src: &NDArray, min: f32, max: f32, out: &mut NDArray) -> Result<(), TensorError> {
    let x = src.chunk()?.clone();
    let r#type = check_float(&x)?;
    if let Some(found) = out.context().filter(|&z| z != x.context()) {
        return Err(TensorError::context(x.context(), found));
    }
    let z = prepare_output(out, x.engine(), src.shape().clone(), x.context(), r#type)?;

    let context = x.context();
    let (reads, writes) = ([x.var()], [z.var()]);
    let engine = z.engine().clone();
    let body = move |run: &RunContext| run.launch(move || cpu::clip(&x, min, max, &z));
    let op = OpDesc::new("clip", context, body)
        .reads(reads)
        .writes(writes);
    submit(&engine, op)
}

/// Fills an initialized tensor with random samples, using the generator of its context.
pub fn sample_with(
    resources: &ResourceManager,
    op: SampleOp,
    out: &NDArray,
) -> Result<(), TensorError> {
    let z = out.chunk()?.clone();
    check_float(&z)?;
    let random = resources.request_random(z.context());

    let context = z.context();
    let writes = [z.var(), random.var()];
    let engine = z.engine().clone();
    let body = move |run: &RunContext| run.launch(move || cpu::sample(op, &random, &z));
    let op = OpDesc::new(op.to_string(), context, body).writes(writes);
    submit(&engine, op)
}

/// Same as [`sample_with`] on the resources of the process-wide engine.
#[inline]
pub fn sample(op: SampleOp, out: &NDArray) -> Result<(), TensorError> {
    sample_with(ResourceManager::get(), op, out)
}

/// Reseeds the generators of the process-wide engine.
pub fn random_seed(seed: u32) -> Result<(), TensorError> {
    ResourceManager::get().seed(seed)?;
    Ok(())
}

impl NDArray {
    pub fn full(
        shape: impl IntoShape,
        context: Context,
        r#type: DataType,
        value: f32,
    ) -> Result<Self, TensorError> {
        let output = Self::empty(shape, context, r#type)?;
        set_value(value, &output)?;
        Ok(output)
    }

    #[inline]
    pub fn zeros(shape: impl IntoShape, context: Context, r#type: DataType) -> Result<Self, TensorError> {
        Self::full(shape, context, r#type, 0.0)
    }

    #[inline]
    pub fn ones(shape: impl IntoShape, context: Context, r#type: DataType) -> Result<Self, TensorError> {
        Self::full(shape, context, r#type, 1.0)
    }

    /// Samples a `f32` tensor uniformly from `[low, high)`.
    pub fn uniform(
        shape: impl IntoShape,
        context: Context,
        low: f32,
        high: f32,
    ) -> Result<Self, TensorError> {
        let output = Self::empty(shape, context, DataType::F32)?;
        sample(SampleOp::Uniform { low, high }, &output)?;
        Ok(output)
    }

    /// Samples a `f32` tensor from a normal distribution.
    pub fn normal(
        shape: impl IntoShape,
        context: Context,
        mean: f32,
        stdev: f32,
    ) -> Result<Self, TensorError> {
        let output = Self::empty(shape, context, DataType::F32)?;
        sample(SampleOp::Gaussian { mean, stdev }, &output)?;
        Ok(output)
    }

    /// Overwrites every element with `value`.
    #[inline]
    pub fn fill(&self, value: f32) -> Result<(), TensorError> {
        set_value(value, self)
    }

    fn try_binary(&self, rhs: &NDArray, op: BinaryOp) -> Result<Self, TensorError> {
        let mut output = NDArray::none();
        binary_op(self, rhs, op, &mut output)?;
        Ok(output)
    }

    fn try_scalar(&self, s: f32, op: ScalarOp) -> Result<Self, TensorError> {
        let mut output = NDArray::none();
        scalar_op(self, s, op, &mut output)?;
        Ok(output)
    }

    #[inline]
    pub fn try_add(&self, rhs: &NDArray) -> Result<Self, TensorError> {
        self.try_binary(rhs, BinaryOp::Plus)
    }

    #[inline]
    pub fn try_sub(&self, rhs: &NDArray) -> Result<Self, TensorError> {
        self.try_binary(rhs, BinaryOp::Minus)
    }

    #[inline]
    pub fn try_mul(&self, rhs: &NDArray) -> Result<Self, TensorError> {
        self.try_binary(rhs, BinaryOp::Mul)
    }

    #[inline]
    pub fn try_div(&self, rhs: &NDArray) -> Result<Self, TensorError> {
        self.try_binary(rhs, BinaryOp::Div)
    }

    /// Matrix product of two 2-D tensors.
    #[inline]
    pub fn dot(&self, rhs: &NDArray) -> Result<Self, TensorError> {
        self.try_binary(rhs, BinaryOp::Dot)
    }

    /// Element of each row at the 0-based column given by `index`.
    #[inline]
    pub fn choose_element(&self, index: &NDArray) -> Result<Self, TensorError> {
        self.try_binary(index, BinaryOp::ChooseElement)
    }

    /// Overwrites `self: [n, k]` with one-hot rows for the columns in `index: [n]`.
    pub fn one_hot_encode(&mut self, index: &NDArray) -> Result<(), TensorError> {
        let template = self.clone();
        binary_op(index, &template, BinaryOp::OneHotEncode, self)
    }

    #[inline]
    pub fn try_add_scalar(&self, s: f32) -> Result<Self, TensorError> {
        self.try_scalar(s, ScalarOp::Plus)
    }

    #[inline]
    pub fn try_sub_scalar(&self, s: f32) -> Result<Self, TensorError> {
        self.try_scalar(s, ScalarOp::Minus)
    }

    #[inline]
    pub fn try_mul_scalar(&self, s: f32) -> Result<Self, TensorError> {
        self.try_scalar(s, ScalarOp::Mul)
    }

    #[inline]
    pub fn try_div_scalar(&self, s: f32) -> Result<Self, TensorError> {
        self.try_scalar(s, ScalarOp::Div)
    }

    /// `s - self`
    #[inline]
    pub fn rsub(&self, s: f32) -> Result<Self, TensorError> {
        self.try_scalar(s, ScalarOp::RMinus)
    }

    /// `s / self`
    #[inline]
    pub fn rdiv(&self, s: f32) -> Result<Self, TensorError> {
        self.try_scalar(s, ScalarOp::RDiv)
    }

    pub fn clip(&self, min: f32, max: f32) -> Result<Self, TensorError> {
        let mut output = NDArray::none();
        clip(self, min, max, &mut output)?;
        Ok(output)
    }

    /// Copies the tensor to another context.
    pub fn copy_to(&self, context: Context) -> Result<Self, TensorError> {
        let x = self.chunk()?;
        let output = NDArray::empty_in(x.engine(), self.shape().clone(), context, x.data_type())?;
        copy_from_to(self, &output, PRIORITY_NORMAL)?;
        Ok(output)
    }

    /// Overwrites the contents with those of `other`.
    #[inline]
    pub fn copy_from(&self, other: &NDArray) -> Result<(), TensorError> {
        copy_from_to(other, self, PRIORITY_NORMAL)
    }
}

macro_rules! impl_ops {
    ($trait:ident, $method:ident, $assign:ident, $assign_method:ident, $binary:expr, $scalar:expr) => {
        impl std::ops::$trait<&NDArray> for &NDArray {
            type Output = NDArray;

            fn $method(self, rhs: &NDArray) -> Self::Output {
                self.try_binary(rhs, $binary)
                    .expect("tensor operands must match")
            }
        }

        impl std::ops::$trait<f32> for &NDArray {
            type Output = NDArray;

            fn $method(self, rhs: f32) -> Self::Output {
                self.try_scalar(rhs, $scalar)
                    .expect("tensor operand must be initialized")
            }
        }

        impl std::ops::$assign<&NDArray> for NDArray {
            fn $assign_method(&mut self, rhs: &NDArray) {
                let lhs = self.clone();
                binary_op(&lhs, rhs, $binary, self).expect("tensor operands must match")
            }
        }

        impl std::ops::$assign<f32> for NDArray {
            fn $assign_method(&mut self, rhs: f32) {
                let lhs = self.clone();
                scalar_op(&lhs, rhs, $scalar, self).expect("tensor operand must be initialized")
            }
        }
    };
}

impl_ops!(Add, add, AddAssign, add_assign, BinaryOp::Plus, ScalarOp::Plus);
impl_ops!(Sub, sub, SubAssign, sub_assign, BinaryOp::Minus, ScalarOp::Minus);
impl_ops!(Mul, mul, MulAssign, mul_assign, BinaryOp::Mul, ScalarOp::Mul);
impl_ops!(Div, div, DivAssign, div_assign, BinaryOp::Div, ScalarOp::Div);

#[cfg(test)]
mod tests {
    use std::{error::Error, time::Duration};

    use itertools::Itertools;

    use super::{copy_from_to, elementwise_sum, sample_with};
    use crate::{
        hal::ops::SampleOp,
        loom::{
            device::Context,
            engine::{
                Engine, EngineBuilder, EngineError, ExecError, Executor, Lane, OpDesc,
                PRIORITY_NORMAL, ThreadedEngine,
            },
            num::DataType,
            resource::ResourceManager,
            tensor::{NDArray, TensorError},
        },
    };

    fn threaded() -> (ThreadedEngine, Engine) {
        let engine = ThreadedEngine::new(EngineBuilder::new().cpu_workers(2).config);
        (engine.clone(), Engine::Threaded(engine))
    }

    #[test]
    fn test_add_ones() -> Result<(), Box<dyn Error>> {
        let a = NDArray::ones([4, 4], Context::cpu(), DataType::F32)?;
        let b = NDArray::ones([4, 4], Context::cpu(), DataType::F32)?;
        let mut c = NDArray::none();
        super::binary_op(&a, &b, super::BinaryOp::Plus, &mut c)?;

        assert_eq!(c.shape().to_array::<2>(), Some([4, 4]));
        assert_eq!(c.context(), Some(Context::cpu()));
        assert_eq!(c.to_vec::<f32>()?, vec![2.0; 16]);
        Ok(())
    }

    #[test]
    fn test_arithmetic() -> Result<(), Box<dyn Error>> {
        let x = NDArray::from_slice([2, 2], &[1.0f32, 2.0, 3.0, 4.0])?;
        let y = NDArray::from_slice([2, 2], &[4.0f32, 3.0, 2.0, 1.0])?;

        assert_eq!((&x - &y).to_vec::<f32>()?, vec![-3.0, -1.0, 1.0, 3.0]);
        assert_eq!((&x * &y).to_vec::<f32>()?, vec![4.0, 6.0, 6.0, 4.0]);
        assert_eq!((&x / 2.0).to_vec::<f32>()?, vec![0.5, 1.0, 1.5, 2.0]);
        assert_eq!(x.rsub(1.0)?.to_vec::<f32>()?, vec![0.0, -1.0, -2.0, -3.0]);
        assert_eq!(x.rdiv(12.0)?.to_vec::<f32>()?, vec![12.0, 6.0, 4.0, 3.0]);
        assert_eq!(x.dot(&y)?.to_vec::<f32>()?, vec![8.0, 5.0, 20.0, 13.0]);
        assert_eq!(x.clip(1.5, 3.5)?.to_vec::<f32>()?, vec![1.5, 2.0, 3.0, 3.5]);

        let mut z = x.clone();
        z += &y;
        z *= 0.5;
        z -= 1.0;
        assert!(z.same_storage(&x));
        assert_eq!(x.to_vec::<f32>()?, vec![1.5; 4]);

        let w = NDArray::from_slice([4], &[1.0f32; 4])?;
        assert!(matches!(
            x.try_add(&w),
            Err(TensorError::ShapeMismatch { .. })
        ));
        let u = NDArray::from_slice([4], &[1u8; 4])?;
        assert!(matches!(
            u.try_add_scalar(1.0),
            Err(TensorError::UnsupportedType(_))
        ));
        assert!(matches!(
            NDArray::none().try_mul_scalar(1.0),
            Err(TensorError::UninitializedHandle)
        ));
        Ok(())
    }

    #[test]
    fn test_index_ops() -> Result<(), Box<dyn Error>> {
        let (_, engine) = threaded();
        let host = |shape: &[usize], data: &[f32]| -> Result<NDArray, TensorError> {
            let x = NDArray::empty_in(&engine, shape.to_vec(), Context::cpu(), DataType::F32)?;
            x.sync_copy_from_cpu(data)?;
            Ok(x)
        };
        let index = host(&[3], &[1.0, 0.0, 1.0])?;

        let mut labels = NDArray::empty_in(&engine, [3, 2], Context::cpu(), DataType::F32)?;
        labels.one_hot_encode(&index)?;
        assert_eq!(labels.to_vec::<f32>()?, vec![0.0, 1.0, 1.0, 0.0, 0.0, 1.0]);

        let x = host(&[3, 2], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])?;
        assert_eq!(x.choose_element(&index)?.to_vec::<f32>()?, vec![2.0, 3.0, 6.0]);
        assert!(matches!(
            x.choose_element(&x),
            Err(TensorError::ShapeMismatch { .. })
        ));

        // out of range columns fail the kernel
        let index = host(&[3], &[0.0, 2.0, 1.0])?;
        let y = x.choose_element(&index)?;
        match y.wait_to_read() {
            Err(TensorError::Engine(EngineError::Exec(err))) => {
                assert!(matches!(err.root(), ExecError::Failed(_)))
            }
            result => panic!("expected a kernel failure, got {result:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_scalar_after_write() -> Result<(), Box<dyn Error>> {
        let (_, engine) = threaded();
        let a = NDArray::empty_in(&engine, [8], Context::cpu(), DataType::F32)?;
        super::set_value(1.0, &a)?;

        let chunk = a.chunk()?.clone();
        let op = OpDesc::new("slow_write", Context::cpu(), move |_| {
            std::thread::sleep(Duration::from_millis(20));
            chunk.write_with(|x: &mut [f32]| x.fill(3.0));
            Ok(())
        })
        .writes(a.var());
        engine.submit(op)?;

        let b = &a * 0.5;
        assert_eq!(b.to_vec::<f32>()?, vec![1.5; 8]);
        Ok(())
    }

    #[test]
    fn test_context() -> Result<(), Box<dyn Error>> {
        let (_, engine) = threaded();
        let x = NDArray::empty_in(&engine, [3], Context::cpu(), DataType::F32)?;
        let y = NDArray::empty_in(&engine, [3], Context { id: 1, ..Context::cpu() }, DataType::F32)?;
        let g = NDArray::empty_in(&engine, [3], Context::gpu(0), DataType::F32)?;
        x.fill(1.0)?;
        y.fill(2.0)?;
        g.fill(3.0)?;

        // host contexts mix freely
        assert_eq!(x.try_add(&y)?.to_vec::<f32>()?, vec![3.0; 3]);
        assert!(matches!(
            x.try_add(&g),
            Err(TensorError::ContextMismatch { .. })
        ));
        assert_eq!(g.try_add(&g)?.context(), Some(Context::gpu(0)));

        let mut out = NDArray::none();
        assert!(matches!(
            elementwise_sum(&[x.clone(), g.clone()], &mut out, PRIORITY_NORMAL),
            Err(TensorError::ContextMismatch { .. })
        ));
        elementwise_sum(&[x.clone(), y.clone(), x.clone()], &mut out, PRIORITY_NORMAL)?;
        assert_eq!(out.to_vec::<f32>()?, vec![4.0; 3]);

        let mut out = NDArray::empty_in(&engine, [3], Context::gpu(1), DataType::F32)?;
        assert!(matches!(
            elementwise_sum(&[g.clone()], &mut out, PRIORITY_NORMAL),
            Err(TensorError::ContextMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_copy_lanes() -> Result<(), Box<dyn Error>> {
        let (threaded, engine) = threaded();
        let data = (0..64).map(|x| x as f32).collect_vec();
        let x = NDArray::empty_in(&engine, [8, 8], Context::cpu(), DataType::F32)?;
        x.sync_copy_from_cpu(&data)?;

        let gpu = x.copy_to(Context::gpu(0))?;
        gpu.wait_to_read()?;
        assert_eq!(threaded.completed(Context::gpu(0), Lane::CopyToGpu), 1);
        assert_eq!(threaded.completed(Context::gpu(0), Lane::Normal), 0);

        let other = gpu.copy_to(Context::gpu(1))?;
        let same = gpu.copy_to(Context::gpu(0))?;
        let back = other.copy_to(Context::cpu())?;
        assert_eq!(back.to_vec::<f32>()?, data);
        assert_eq!(same.to_vec::<f32>()?, data);
        assert_eq!(threaded.completed(Context::gpu(0), Lane::CopyFromGpu), 1);
        assert_eq!(threaded.completed(Context::gpu(0), Lane::Normal), 1);
        assert_eq!(threaded.completed(Context::gpu(1), Lane::CopyFromGpu), 1);

        let y = NDArray::empty_in(&engine, [64], Context::cpu(), DataType::F32)?;
        assert!(matches!(
            copy_from_to(&x, &y, PRIORITY_NORMAL),
            Err(TensorError::ShapeMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_poison() -> Result<(), Box<dyn Error>> {
        let (_, engine) = threaded();
        let a = NDArray::empty_in(&engine, [4], Context::cpu(), DataType::F32)?;
        let op = OpDesc::new("fault", Context::cpu(), |_| {
            Err(ExecError::Failed("kernel fault".into()))
        })
        .writes(a.var());
        engine.submit(op)?;

        let b = (&a + &a).copy_to(Context::gpu(0))?;
        assert!(matches!(
            b.wait_to_read(),
            Err(TensorError::Engine(EngineError::Exec(ExecError::Poisoned(_))))
        ));
        Ok(())
    }

    #[test]
    fn test_sample_order() -> Result<(), Box<dyn Error>> {
        let (_, engine) = threaded();
        let resources = ResourceManager::new(engine.clone());
        let op = SampleOp::Uniform { low: 0.0, high: 1.0 };

        // blocks the host generator until the device sample below has completed
        let (gate, wait) = flume::bounded(1);
        let host = resources.request_random(Context::cpu());
        let random = host.clone();
        let hold = OpDesc::new("hold", Context::cpu(), move |_| {
            wait.recv_timeout(Duration::from_secs(10))
                .map_err(|_| ExecError::Failed("device sample never completed".into()))?;
            random.with_rng(|rng| *rng = fastrand::Rng::with_seed(7));
            Ok(())
        })
        .writes([host.var()]);
        engine.submit(hold)?;

        let x = NDArray::empty_in(&engine, [32], Context::cpu(), DataType::F32)?;
        let y = NDArray::empty_in(&engine, [32], Context::cpu(), DataType::F32)?;
        let z = NDArray::empty_in(&engine, [32], Context::gpu(0), DataType::F32)?;
        sample_with(&resources, op, &x)?;
        sample_with(&resources, op, &y)?;
        sample_with(&resources, op, &z)?;

        let device = z.to_vec::<f32>()?;
        assert!(device.iter().all(|z| (0.0..1.0).contains(z)));
        gate.send(())?;

        let mut rng = fastrand::Rng::with_seed(7);
        let expected = (0..64).map(|_| rng.f32()).collect_vec();
        assert_eq!(x.to_vec::<f32>()?, expected[..32]);
        assert_eq!(y.to_vec::<f32>()?, expected[32..]);
        Ok(())
    }

    #[test]
    fn test_random_seed() -> Result<(), Box<dyn Error>> {
        let (_, engine) = threaded();
        let resources = ResourceManager::new(engine.clone());
        let op = SampleOp::Uniform { low: 0.0, high: 1.0 };

        let draw = |context| -> Result<Vec<f32>, TensorError> {
            let x = NDArray::empty_in(&engine, [32], context, DataType::F32)?;
            sample_with(&resources, op, &x)?;
            x.to_vec()
        };

        let first = draw(Context::cpu())?;
        let gpu = draw(Context::gpu(0))?;
        assert_ne!(first, gpu);
        assert_ne!(first, draw(Context::cpu())?);

        resources.seed(0)?;
        assert_eq!(draw(Context::cpu())?, first);

        let x = NDArray::normal([4096], Context::cpu(), 0.0, 1.0)?;
        let mean = x.to_vec::<f32>()?.iter().sum::<f32>() / 4096.0;
        assert!(mean.abs() < 0.1, "mean {mean}");
        Ok(())
    }
}

//! Tensor functions callable by name.
//!
//! Every function takes `use_vars` (tensors it reads), `scalars` and `mutate_vars` (tensors it
//! writes), in counts fixed at registration.

use std::{
    fmt,
    sync::{Arc, OnceLock},
};

use itertools::Itertools;
use rustc_hash::FxHashMap as HashMap;

use super::{
    frontend::{binary_op, clip, copy_from_to, sample, scalar_op, set_value},
    ops::{BinaryOp, SampleOp, ScalarOp},
};
use crate::loom::{engine::PRIORITY_NORMAL, tensor::{NDArray, TensorError}};

/// Flags describing how a function expects to be called.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeMask(u32);

impl TypeMask {
    /// Tensor arguments come before scalar arguments.
    pub const NDARRAY_ARG_BEFORE_SCALAR: Self = Self(1);
    /// Scalar arguments come before tensor arguments.
    pub const SCALAR_ARG_BEFORE_NDARRAY: Self = Self(1 << 1);
    /// A none mutate target is allocated by the function itself.
    pub const ACCEPT_EMPTY_MUTATE_TARGET: Self = Self(1 << 2);

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for TypeMask {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

pub type TensorBody =
    Arc<dyn Fn(&[NDArray], &[f32], &mut [NDArray]) -> Result<(), TensorError> + Send + Sync>;

#[derive(Clone)]
pub struct TensorFunction {
    name: String,
    description: String,
    num_use_vars: usize,
    num_scalars: usize,
    num_mutate_vars: usize,
    type_mask: TypeMask,
    body: TensorBody,
}

impl fmt::Debug for TensorFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorFunction")
            .field("name", &self.name)
            .field("num_use_vars", &self.num_use_vars)
            .field("num_scalars", &self.num_scalars)
            .field("num_mutate_vars", &self.num_mutate_vars)
            .field("type_mask", &self.type_mask)
            .finish()
    }
}

impl TensorFunction {
    /// A function with no arguments; the counts are set by the builder methods.
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&[NDArray], &[f32], &mut [NDArray]) -> Result<(), TensorError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: String::new(),
            num_use_vars: 0,
            num_scalars: 0,
            num_mutate_vars: 0,
            type_mask: TypeMask::NDARRAY_ARG_BEFORE_SCALAR,
            body: Arc::new(body),
        }
    }

    pub fn use_vars(mut self, count: usize) -> Self {
        self.num_use_vars = count;
        self
    }

    pub fn scalars(mut self, count: usize) -> Self {
        self.num_scalars = count;
        self
    }

    pub fn mutate_vars(mut self, count: usize) -> Self {
        self.num_mutate_vars = count;
        self
    }

    pub fn type_mask(mut self, mask: TypeMask) -> Self {
        self.type_mask = mask;
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn description(&self) -> &str {
        &self.description
    }

    #[inline]
    pub fn num_use_vars(&self) -> usize {
        self.num_use_vars
    }

    #[inline]
    pub fn num_scalars(&self) -> usize {
        self.num_scalars
    }

    #[inline]
    pub fn num_mutate_vars(&self) -> usize {
        self.num_mutate_vars
    }

    #[inline]
    pub fn mask(&self) -> TypeMask {
        self.type_mask
    }

    fn check_count(&self, kind: &'static str, expected: usize, found: usize) -> Result<(), TensorError> {
        match expected == found {
            true => Ok(()),
            false => Err(TensorError::ArgumentCount {
                name: self.name.clone(),
                kind,
                expected,
                found,
            }),
        }
    }

    /// Calls the function after checking the argument counts.
    ///
    /// None mutate targets are only accepted by functions carrying
    /// [`TypeMask::ACCEPT_EMPTY_MUTATE_TARGET`]; they are allocated in place.
    pub fn invoke(
        &self,
        use_vars: &[NDArray],
        scalars: &[f32],
        mutate_vars: &mut [NDArray],
    ) -> Result<(), TensorError> {
        self.check_count("use_vars", self.num_use_vars, use_vars.len())?;
        self.check_count("scalars", self.num_scalars, scalars.len())?;
        self.check_count("mutate_vars", self.num_mutate_vars, mutate_vars.len())?;
        if !self.type_mask.contains(TypeMask::ACCEPT_EMPTY_MUTATE_TARGET)
            && mutate_vars.iter().any(NDArray::is_none)
        {
            return Err(TensorError::UninitializedHandle);
        }
        log::trace!("invoke {}", self.name);
        (self.body)(use_vars, scalars, mutate_vars)
    }
}

/// A table of [`TensorFunction`]s keyed by name.
#[derive(Debug, Default, Clone)]
pub struct Registry {
    functions: HashMap<String, TensorFunction>,
}

impl Registry {
    /// The registry holding every built-in function.
    pub fn new() -> Self {
        let accept_empty = TypeMask::NDARRAY_ARG_BEFORE_SCALAR | TypeMask::ACCEPT_EMPTY_MUTATE_TARGET;

        let registry = [
            BinaryOp::Plus,
            BinaryOp::Minus,
            BinaryOp::Mul,
            BinaryOp::Div,
            BinaryOp::Dot,
            BinaryOp::OneHotEncode,
            BinaryOp::ChooseElement,
        ]
        .into_iter()
        .fold(Self::default(), |registry, op| {
            let function = TensorFunction::new(op.to_string(), move |u, _, m| {
                binary_op(&u[0], &u[1], op, &mut m[0])
            });
            registry.add(function.use_vars(2).mutate_vars(1).type_mask(accept_empty))
        });

        let registry = [
            ScalarOp::Plus,
            ScalarOp::Minus,
            ScalarOp::Mul,
            ScalarOp::Div,
            ScalarOp::RMinus,
            ScalarOp::RDiv,
        ]
        .into_iter()
        .fold(registry, |registry, op| {
            let function = TensorFunction::new(op.to_string(), move |u, s, m| {
                scalar_op(&u[0], s[0], op, &mut m[0])
            });
            let function = function.use_vars(1).scalars(1).mutate_vars(1);
            registry.add(function.type_mask(accept_empty))
        });

        registry
            .add(
                TensorFunction::new("_set_value", |_, s, m| set_value(s[0], &m[0]))
                    .scalars(1)
                    .mutate_vars(1),
            )
            .add(
                TensorFunction::new("_copyto", |u, _, m| {
                    copy_from_to(&u[0], &m[0], PRIORITY_NORMAL)
                })
                .use_vars(1)
                .mutate_vars(1),
            )
            .add(
                TensorFunction::new("_random_uniform", |_, s, m| {
                    let op = SampleOp::Uniform { low: s[0], high: s[1] };
                    sample(op, &m[0])
                })
                .scalars(2)
                .mutate_vars(1),
            )
            .add(
                TensorFunction::new("_random_gaussian", |_, s, m| {
                    let op = SampleOp::Gaussian { mean: s[0], stdev: s[1] };
                    sample(op, &m[0])
                })
                .scalars(2)
                .mutate_vars(1),
            )
            .add(
                TensorFunction::new("clip", |u, s, m| clip(&u[0], s[0], s[1], &mut m[0]))
                    .use_vars(1)
                    .scalars(2)
                    .mutate_vars(1)
                    .type_mask(accept_empty)
                    .describe("Clip tensor elements to the range [a_min, a_max]."),
            )
    }

    /// The shared registry of built-in functions.
    pub fn get() -> &'static Registry {
        static REGISTRY: OnceLock<Registry> = OnceLock::new();
        REGISTRY.get_or_init(Registry::new)
    }

    /// Adds a function, replacing any function of the same name.
    pub fn add(mut self, function: TensorFunction) -> Self {
        if let Some(old) = self.functions.insert(function.name.clone(), function) {
            log::warn!("function {} registered twice", old.name);
        }
        self
    }

    #[inline]
    pub fn find(&self, name: &str) -> Option<&TensorFunction> {
        self.functions.get(name)
    }

    /// Names of every registered function, sorted.
    pub fn list(&self) -> Vec<&str> {
        self.functions.keys().map(String::as_str).sorted().collect()
    }

    /// Looks up and calls a function.
    pub fn invoke(
        &self,
        name: &str,
        use_vars: &[NDArray],
        scalars: &[f32],
        mutate_vars: &mut [NDArray],
    ) -> Result<(), TensorError> {
        self.find(name)
            .ok_or_else(|| TensorError::UnknownFunction(name.to_owned()))?
            .invoke(use_vars, scalars, mutate_vars)
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::{Registry, TensorFunction, TypeMask};
    use crate::loom::{
        device::Context,
        num::DataType,
        tensor::{NDArray, TensorError},
    };

    #[test]
    fn test_list() {
        let registry = Registry::get();
        let names = registry.list();
        for name in [
            "_plus",
            "_minus",
            "_mul",
            "_div",
            "dot",
            "_onehot_encode",
            "choose_element_0index",
            "_plus_scalar",
            "_minus_scalar",
            "_mul_scalar",
            "_div_scalar",
            "_rminus_scalar",
            "_rdiv_scalar",
            "_set_value",
            "_copyto",
            "_random_uniform",
            "_random_gaussian",
            "clip",
        ] {
            assert!(names.contains(&name), "missing {name}");
        }

        let clip = registry.find("clip").expect("clip is registered");
        assert_eq!(clip.num_use_vars(), 1);
        assert_eq!(clip.num_scalars(), 2);
        assert_eq!(clip.num_mutate_vars(), 1);
        assert!(clip.mask().contains(TypeMask::ACCEPT_EMPTY_MUTATE_TARGET));

        let copy = registry.find("_copyto").expect("copy is registered");
        assert_eq!(copy.mask(), TypeMask::NDARRAY_ARG_BEFORE_SCALAR);
    }

    #[test]
    fn test_invoke() -> Result<(), Box<dyn Error>> {
        let registry = Registry::get();
        let x = NDArray::from_slice([2, 2], &[1.0f32, 2.0, 3.0, 4.0])?;
        let y = NDArray::ones([2, 2], Context::cpu(), DataType::F32)?;

        let mut out = [NDArray::none()];
        registry.invoke("_plus", &[x.clone(), y.clone()], &[], &mut out)?;
        assert_eq!(out[0].to_vec::<f32>()?, vec![2.0, 3.0, 4.0, 5.0]);

        registry.invoke("_rminus_scalar", &[x.clone()], &[10.0], &mut out)?;
        assert_eq!(out[0].to_vec::<f32>()?, vec![9.0, 8.0, 7.0, 6.0]);

        registry.invoke("dot", &[x.clone(), y.clone()], &[], &mut out)?;
        assert_eq!(out[0].to_vec::<f32>()?, vec![3.0, 3.0, 7.0, 7.0]);

        let index = NDArray::from_slice([2], &[1.0f32, 0.0])?;
        let mut picked = [NDArray::none()];
        registry.invoke("choose_element_0index", &[x.clone(), index.clone()], &[], &mut picked)?;
        assert_eq!(picked[0].to_vec::<f32>()?, vec![2.0, 3.0]);

        registry.invoke("_onehot_encode", &[index, y.clone()], &[], &mut out)?;
        assert_eq!(out[0].to_vec::<f32>()?, vec![0.0, 1.0, 1.0, 0.0]);

        let mut clipped = [NDArray::none()];
        registry.invoke("clip", &[x.clone()], &[1.5, 3.5], &mut clipped)?;
        assert_eq!(clipped[0].to_vec::<f32>()?, vec![1.5, 2.0, 3.0, 3.5]);

        registry.invoke("_set_value", &[], &[0.5], &mut clipped)?;
        registry.invoke("_copyto", &clipped.clone(), &[], &mut out)?;
        assert_eq!(out[0].to_vec::<f32>()?, vec![0.5; 4]);

        registry.invoke("_random_uniform", &[], &[2.0, 3.0], &mut out)?;
        assert!(out[0].to_vec::<f32>()?.iter().all(|x| (2.0..=3.0).contains(x)));
        Ok(())
    }

    #[test]
    fn test_invoke_errors() -> Result<(), Box<dyn Error>> {
        let registry = Registry::get();
        let x = NDArray::ones([3], Context::cpu(), DataType::F32)?;

        assert!(matches!(
            registry.invoke("_mod", &[x.clone()], &[], &mut [NDArray::none()]),
            Err(TensorError::UnknownFunction(_))
        ));
        assert!(matches!(
            registry.invoke("_plus", &[x.clone()], &[], &mut [NDArray::none()]),
            Err(TensorError::ArgumentCount { kind: "use_vars", expected: 2, found: 1, .. })
        ));
        assert!(matches!(
            registry.invoke("clip", &[x.clone()], &[0.0], &mut [NDArray::none()]),
            Err(TensorError::ArgumentCount { kind: "scalars", .. })
        ));
        // copies never allocate their target
        assert!(matches!(
            registry.invoke("_copyto", &[x.clone()], &[], &mut [NDArray::none()]),
            Err(TensorError::UninitializedHandle)
        ));
        Ok(())
    }

    #[test]
    fn test_custom() -> Result<(), Box<dyn Error>> {
        let registry = Registry::default().add(
            TensorFunction::new("_square", |u, _, m| {
                let x = &u[0];
                super::binary_op(x, x, super::BinaryOp::Mul, &mut m[0])
            })
            .use_vars(1)
            .mutate_vars(1)
            .type_mask(TypeMask::NDARRAY_ARG_BEFORE_SCALAR | TypeMask::ACCEPT_EMPTY_MUTATE_TARGET),
        );
        assert_eq!(registry.list(), vec!["_square"]);

        let x = NDArray::from_slice([3], &[1.0f32, 2.0, 3.0])?;
        let mut out = [NDArray::none()];
        registry.invoke("_square", &[x], &[], &mut out)?;
        assert_eq!(out[0].to_vec::<f32>()?, vec![1.0, 4.0, 9.0]);
        Ok(())
    }
}

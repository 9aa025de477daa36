use derive_more::Display;

use crate::loom::{
    num::Float,
    shape::Shape,
    tensor::TensorError,
};

/// Operations combining two tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum BinaryOp {
    #[display("_plus")]
    Plus,
    #[display("_minus")]
    Minus,
    #[display("_mul")]
    Mul,
    #[display("_div")]
    Div,
    /// Matrix product of two 2-D tensors.
    #[display("dot")]
    Dot,
    /// Rows of `rhs: [n, k]` set to one at the columns given by `lhs: [n]`, zero elsewhere.
    /// `rhs` only provides the output shape.
    #[display("_onehot_encode")]
    OneHotEncode,
    /// Picks from each row of `lhs: [n, k]` the element at the 0-based column given by
    /// `rhs: [n]`.
    #[display("choose_element_0index")]
    ChooseElement,
}

impl BinaryOp {
    /// Shape of the output for the given operands.
    pub fn infer_shape(self, lhs: &Shape, rhs: &Shape) -> Result<Shape, TensorError> {
        match self {
            BinaryOp::Dot => match (lhs.to_array(), rhs.to_array()) {
                (Some([m, k]), Some([r, n])) if k == r => Ok(Shape::new([m, n])),
                (Some([_, k]), Some([_, n])) => Err(TensorError::shape(&Shape::new([k, n]), rhs)),
                _ => Err(TensorError::shape(lhs, rhs)),
            },
            BinaryOp::OneHotEncode => match (lhs.to_array(), rhs.to_array()) {
                (Some([n]), Some([r, _])) if n == r => Ok(rhs.clone()),
                (_, Some([r, _])) => Err(TensorError::shape(&Shape::new([r]), lhs)),
                _ => Err(TensorError::shape(lhs, rhs)),
            },
            BinaryOp::ChooseElement => match (lhs.to_array(), rhs.to_array()) {
                (Some([n, _]), Some([r])) if n == r => Ok(rhs.clone()),
                (Some([n, _]), _) => Err(TensorError::shape(&Shape::new([n]), rhs)),
                _ => Err(TensorError::shape(lhs, rhs)),
            },
            _ => match lhs == rhs {
                true => Ok(lhs.clone()),
                false => Err(TensorError::shape(lhs, rhs)),
            },
        }
    }

    /// Returns `true` if the op combines operands element by element.
    #[inline]
    pub fn is_elementwise(self) -> bool {
        matches!(
            self,
            BinaryOp::Plus | BinaryOp::Minus | BinaryOp::Mul | BinaryOp::Div
        )
    }

    /// Applies an elementwise op. See [`BinaryOp::is_elementwise`].
    #[inline]
    pub fn apply<T: Float>(self, x: T, y: T) -> T {
        match self {
            BinaryOp::Plus => x + y,
            BinaryOp::Minus => x - y,
            BinaryOp::Mul => x * y,
            BinaryOp::Div => x / y,
            BinaryOp::Dot | BinaryOp::OneHotEncode | BinaryOp::ChooseElement => {
                unreachable!("{self} is not elementwise")
            }
        }
    }
}

/// Operations combining a tensor with a scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ScalarOp {
    #[display("_plus_scalar")]
    Plus,
    #[display("_minus_scalar")]
    Minus,
    #[display("_mul_scalar")]
    Mul,
    #[display("_div_scalar")]
    Div,
    /// `scalar - x`
    #[display("_rminus_scalar")]
    RMinus,
    /// `scalar / x`
    #[display("_rdiv_scalar")]
    RDiv,
}

impl ScalarOp {
    #[inline]
    pub fn apply<T: Float>(self, x: T, s: T) -> T {
        match self {
            ScalarOp::Plus => x + s,
            ScalarOp::Minus => x - s,
            ScalarOp::Mul => x * s,
            ScalarOp::Div => x / s,
            ScalarOp::RMinus => s - x,
            ScalarOp::RDiv => s / x,
        }
    }
}

/// Distributions the random generators sample from.
#[derive(Debug, Clone, Copy, PartialEq, Display)]
pub enum SampleOp {
    #[display("_random_uniform")]
    Uniform { low: f32, high: f32 },
    #[display("_random_gaussian")]
    Gaussian { mean: f32, stdev: f32 },
}

//! BLAS enums and scalars shared by all variants.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum BlasOp {
    #[default]
    N,
    T,
}

impl BlasOp {
    pub fn as_char(self) -> char {
        match self {
            BlasOp::N => 'N',
            BlasOp::T => 'T',
        }
    }

    pub fn is_transposed(self) -> bool {
        self == BlasOp::T
    }
}

impl fmt::Display for BlasOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

impl FromStr for BlasOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "n" | "N" => Ok(BlasOp::N),
            "t" | "T" => Ok(BlasOp::T),
            other => Err(format!("unrecognized BlasOp `{other}`")),
        }
    }
}

/// Epilogue applied by the bias variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Activation {
    #[default]
    None,
    Relu,
    Gelu,
}

impl Activation {
    /// Apply the epilogue to one value. GELU uses the tanh approximation.
    pub fn apply(self, x: f64) -> f64 {
        match self {
            Activation::None => x,
            Activation::Relu => x.max(0.0),
            Activation::Gelu => {
                let c = (2.0 / std::f64::consts::PI).sqrt();
                0.5 * x * (1.0 + (c * (x + 0.044715 * x.powi(3))).tanh())
            }
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Activation::None => "None",
            Activation::Relu => "RELU",
            Activation::Gelu => "GELU",
        };
        f.write_str(name)
    }
}

/// Scale factor in accumulation precision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    Real(f64),
    Complex { re: f64, im: f64 },
}

impl Scalar {
    pub const ONE: Scalar = Scalar::Real(1.0);
    pub const ZERO: Scalar = Scalar::Real(0.0);

    pub fn re(self) -> f64 {
        match self {
            Scalar::Real(v) => v,
            Scalar::Complex { re, .. } => re,
        }
    }

    pub fn im(self) -> f64 {
        match self {
            Scalar::Real(_) => 0.0,
            Scalar::Complex { im, .. } => im,
        }
    }

    pub fn is_zero(self) -> bool {
        self.re() == 0.0 && self.im() == 0.0
    }
}

impl Default for Scalar {
    fn default() -> Self {
        Scalar::ZERO
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Scalar::Real(value)
    }
}

impl From<f32> for Scalar {
    fn from(value: f32) -> Self {
        Scalar::Real(value as f64)
    }
}

/// Four decimals; complex values as `(re, im)`.
impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Real(v) => write!(f, "{v:.4}"),
            Scalar::Complex { re, im } => write!(f, "({re:.4}, {im:.4})"),
        }
    }
}

/// Operand slots of a GEMM invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operand {
    A,
    B,
    C,
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operand::A => "a",
            Operand::B => "b",
            Operand::C => "c",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars_format_with_four_decimals() {
        assert_eq!(Scalar::from(1.0).to_string(), "1.0000");
        assert_eq!(Scalar::from(0.5f32).to_string(), "0.5000");
        assert_eq!(
            Scalar::Complex { re: 1.0, im: -2.0 }.to_string(),
            "(1.0000, -2.0000)"
        );
    }

    #[test]
    fn blas_op_round_trips_through_text() {
        assert_eq!("t".parse::<BlasOp>(), Ok(BlasOp::T));
        assert_eq!(BlasOp::N.to_string(), "N");
        assert!("x".parse::<BlasOp>().is_err());
    }

    #[test]
    fn activation_epilogues() {
        assert_eq!(Activation::Relu.apply(-2.0), 0.0);
        assert_eq!(Activation::None.apply(-2.0), -2.0);
        assert!((Activation::Gelu.apply(1.0) - 0.8412).abs() < 1e-3);
        assert_eq!(Activation::Gelu.to_string(), "GELU");
    }
}

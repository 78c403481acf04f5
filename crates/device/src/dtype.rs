//! Element types and the process-wide capability table.

use half::{bf16, f16};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarType {
    Float,
    Double,
    Half,
    BFloat16,
    Float8E4M3Fn,
    Float8E5M2,
    Float8E4M3Fnuz,
    Float8E5M2Fnuz,
    ComplexFloat,
    ComplexDouble,
}

#[derive(Debug, Clone, Copy)]
pub struct TypeCapability {
    pub name: &'static str,
    pub element_size: usize,
    pub compute_type: &'static str,
    /// Real components per element (2 for complex types).
    pub components: usize,
}

static CAPABILITIES: Lazy<HashMap<ScalarType, TypeCapability>> = Lazy::new(|| {
    let entry = |name, element_size, compute_type, components| TypeCapability {
        name,
        element_size,
        compute_type,
        components,
    };
    HashMap::from([
        (ScalarType::Float, entry("float", 4, "float", 1)),
        (ScalarType::Double, entry("double", 8, "double", 1)),
        (ScalarType::Half, entry("Half", 2, "float", 1)),
        (ScalarType::BFloat16, entry("BFloat16", 2, "float", 1)),
        (ScalarType::Float8E4M3Fn, entry("Float8_e4m3fn", 1, "float", 1)),
        (ScalarType::Float8E5M2, entry("Float8_e5m2", 1, "float", 1)),
        (ScalarType::Float8E4M3Fnuz, entry("Float8_e4m3fnuz", 1, "float", 1)),
        (ScalarType::Float8E5M2Fnuz, entry("Float8_e5m2fnuz", 1, "float", 1)),
        (ScalarType::ComplexFloat, entry("complex<float>", 8, "float complex", 2)),
        (ScalarType::ComplexDouble, entry("complex<double>", 16, "double complex", 2)),
    ])
});

impl ScalarType {
    pub const ALL: [ScalarType; 10] = [
        ScalarType::Float,
        ScalarType::Double,
        ScalarType::Half,
        ScalarType::BFloat16,
        ScalarType::Float8E4M3Fn,
        ScalarType::Float8E5M2,
        ScalarType::Float8E4M3Fnuz,
        ScalarType::Float8E5M2Fnuz,
        ScalarType::ComplexFloat,
        ScalarType::ComplexDouble,
    ];

    pub fn capability(self) -> &'static TypeCapability {
        &CAPABILITIES[&self]
    }

    pub fn name(self) -> &'static str {
        self.capability().name
    }

    pub fn element_size(self) -> usize {
        self.capability().element_size
    }

    /// Accumulation type tag. Single precision reports `xfloat` when TF32
    /// math is allowed.
    pub fn compute_type(self, allow_tf32: bool) -> &'static str {
        if self == ScalarType::Float && allow_tf32 {
            "xfloat"
        } else {
            self.capability().compute_type
        }
    }

    pub fn is_complex(self) -> bool {
        self.capability().components == 2
    }

    pub fn is_fp8(self) -> bool {
        self.fp8_format().is_some()
    }

    /// Decode storage bytes into `f64` components. Complex elements produce
    /// interleaved real and imaginary parts. Trailing partial elements are
    /// ignored.
    pub fn decode(self, bytes: &[u8]) -> Vec<f64> {
        let size = self.element_size();
        let mut out = Vec::with_capacity(bytes.len() / size * self.capability().components);
        match self {
            ScalarType::Float | ScalarType::ComplexFloat => {
                out.extend(bytes.chunks_exact(4).map(|c| {
                    f32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64
                }));
            }
            ScalarType::Double | ScalarType::ComplexDouble => {
                out.extend(bytes.chunks_exact(8).map(|c| {
                    f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])
                }));
            }
            ScalarType::Half => {
                out.extend(
                    bytes
                        .chunks_exact(2)
                        .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f64()),
                );
            }
            ScalarType::BFloat16 => {
                out.extend(
                    bytes
                        .chunks_exact(2)
                        .map(|c| bf16::from_le_bytes([c[0], c[1]]).to_f64()),
                );
            }
            _ => {
                if let Some(format) = self.fp8_format() {
                    out.extend(bytes.iter().map(|&code| format.decode(code)));
                }
            }
        }
        out
    }

    /// Encode `f64` components into storage bytes. fp8 values round to the
    /// nearest representable value and saturate at the largest finite one.
    pub fn encode(self, values: &[f64]) -> Vec<u8> {
        let mut out = Vec::with_capacity(values.len() * self.element_size());
        match self {
            ScalarType::Float | ScalarType::ComplexFloat => {
                for v in values {
                    out.extend_from_slice(&(*v as f32).to_le_bytes());
                }
            }
            ScalarType::Double | ScalarType::ComplexDouble => {
                for v in values {
                    out.extend_from_slice(&v.to_le_bytes());
                }
            }
            ScalarType::Half => {
                for v in values {
                    out.extend_from_slice(&f16::from_f64(*v).to_le_bytes());
                }
            }
            ScalarType::BFloat16 => {
                for v in values {
                    out.extend_from_slice(&bf16::from_f64(*v).to_le_bytes());
                }
            }
            _ => {
                if let Some(format) = self.fp8_format() {
                    out.extend(values.iter().map(|&v| format.encode(v)));
                }
            }
        }
        out
    }

    fn fp8_format(self) -> Option<&'static Fp8Format> {
        match self {
            ScalarType::Float8E4M3Fn => Some(&E4M3FN),
            ScalarType::Float8E5M2 => Some(&E5M2),
            ScalarType::Float8E4M3Fnuz => Some(&E4M3FNUZ),
            ScalarType::Float8E5M2Fnuz => Some(&E5M2FNUZ),
            _ => None,
        }
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ScalarType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed = match s.to_ascii_lowercase().as_str() {
            "f32" | "float" | "float32" => ScalarType::Float,
            "f64" | "double" | "float64" => ScalarType::Double,
            "f16" | "half" | "float16" => ScalarType::Half,
            "bf16" | "bfloat16" => ScalarType::BFloat16,
            "fp8e4m3fn" | "float8_e4m3fn" => ScalarType::Float8E4M3Fn,
            "fp8e5m2" | "float8_e5m2" => ScalarType::Float8E5M2,
            "fp8e4m3fnuz" | "float8_e4m3fnuz" => ScalarType::Float8E4M3Fnuz,
            "fp8e5m2fnuz" | "float8_e5m2fnuz" => ScalarType::Float8E5M2Fnuz,
            "c64" | "complex<float>" | "complex64" => ScalarType::ComplexFloat,
            "c128" | "complex<double>" | "complex128" => ScalarType::ComplexDouble,
            _ => return Err(format!("unknown element type `{s}`")),
        };
        Ok(parsed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fp8Special {
    /// No infinities; the all-ones pattern is NaN.
    Finite,
    /// IEEE-like: all-ones exponent encodes inf/NaN.
    Ieee,
    /// No infinities, no negative zero; 0x80 is the only NaN.
    Unsigned,
}

struct Fp8Format {
    man_bits: u32,
    exp_bits: u32,
    bias: i32,
    special: Fp8Special,
    table: Lazy<Vec<(f64, u8)>>,
}

macro_rules! fp8_format {
    ($name:ident, $exp:expr, $man:expr, $bias:expr, $special:expr) => {
        static $name: Fp8Format = Fp8Format {
            man_bits: $man,
            exp_bits: $exp,
            bias: $bias,
            special: $special,
            table: Lazy::new(|| {
                let probe = Fp8Format {
                    man_bits: $man,
                    exp_bits: $exp,
                    bias: $bias,
                    special: $special,
                    table: Lazy::new(Vec::new),
                };
                let mut table: Vec<(f64, u8)> = (0u8..0x80)
                    .map(|code| (probe.decode(code), code))
                    .filter(|(value, _)| value.is_finite())
                    .collect();
                table.sort_by(|a, b| a.0.total_cmp(&b.0));
                table
            }),
        };
    };
}

fp8_format!(E4M3FN, 4, 3, 7, Fp8Special::Finite);
fp8_format!(E5M2, 5, 2, 15, Fp8Special::Ieee);
fp8_format!(E4M3FNUZ, 4, 3, 8, Fp8Special::Unsigned);
fp8_format!(E5M2FNUZ, 5, 2, 16, Fp8Special::Unsigned);

impl Fp8Format {
    fn decode(&self, code: u8) -> f64 {
        let sign = if code & 0x80 != 0 { -1.0 } else { 1.0 };
        let exp_mask = (1u8 << self.exp_bits) - 1;
        let man_mask = (1u8 << self.man_bits) - 1;
        let exp = (code >> self.man_bits) & exp_mask;
        let man = code & man_mask;

        match self.special {
            Fp8Special::Unsigned if code == 0x80 => return f64::NAN,
            Fp8Special::Finite if exp == exp_mask && man == man_mask => return f64::NAN,
            Fp8Special::Ieee if exp == exp_mask => {
                return if man == 0 {
                    sign * f64::INFINITY
                } else {
                    f64::NAN
                };
            }
            _ => {}
        }

        let fraction = man as f64 / (1u32 << self.man_bits) as f64;
        let magnitude = if exp == 0 {
            fraction * 2f64.powi(1 - self.bias)
        } else {
            (1.0 + fraction) * 2f64.powi(exp as i32 - self.bias)
        };
        sign * magnitude
    }

    fn nan_code(&self) -> u8 {
        match self.special {
            Fp8Special::Unsigned => 0x80,
            Fp8Special::Finite | Fp8Special::Ieee => 0x7f,
        }
    }

    fn encode(&self, value: f64) -> u8 {
        if value.is_nan() {
            return self.nan_code();
        }
        let negative = value.is_sign_negative();
        let sign_bit = if negative { 0x80 } else { 0x00 };
        if value.is_infinite() && self.special == Fp8Special::Ieee {
            let inf = ((1u8 << self.exp_bits) - 1) << self.man_bits;
            return sign_bit | inf;
        }

        let table = &*self.table;
        let magnitude = value.abs();
        let idx = table.partition_point(|(v, _)| *v < magnitude);
        let code = if idx == 0 {
            table[0].1
        } else if idx == table.len() {
            table[table.len() - 1].1
        } else {
            let (lo_value, lo_code) = table[idx - 1];
            let (hi_value, hi_code) = table[idx];
            let lo_gap = magnitude - lo_value;
            let hi_gap = hi_value - magnitude;
            if lo_gap < hi_gap || (lo_gap == hi_gap && lo_code % 2 == 0) {
                lo_code
            } else {
                hi_code
            }
        };

        if code == 0 && self.special == Fp8Special::Unsigned {
            0
        } else {
            sign_bit | code
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn capability_table_covers_every_type() {
        for ty in ScalarType::ALL {
            let cap = ty.capability();
            assert!(cap.element_size > 0);
            assert_eq!(ty.to_string(), cap.name);
        }
        assert_eq!(ScalarType::Half.compute_type(false), "float");
        assert_eq!(ScalarType::Float.compute_type(true), "xfloat");
        assert_eq!(ScalarType::Double.compute_type(true), "double");
        assert_eq!(ScalarType::ComplexDouble.element_size(), 16);
    }

    #[test]
    fn parses_common_aliases() {
        assert_eq!("f32".parse::<ScalarType>(), Ok(ScalarType::Float));
        assert_eq!("BFloat16".parse::<ScalarType>(), Ok(ScalarType::BFloat16));
        assert_eq!(
            "Float8_e4m3fn".parse::<ScalarType>(),
            Ok(ScalarType::Float8E4M3Fn)
        );
        assert!("int7".parse::<ScalarType>().is_err());
    }

    #[test]
    fn fp8_extremes_match_format_definitions() {
        assert_eq!(E4M3FN.decode(0x7e), 448.0);
        assert!(E4M3FN.decode(0x7f).is_nan());
        assert_eq!(E4M3FNUZ.decode(0x7f), 240.0);
        assert!(E4M3FNUZ.decode(0x80).is_nan());
        assert_eq!(E5M2.decode(0x7b), 57344.0);
        assert_eq!(E5M2.decode(0x7c), f64::INFINITY);
        assert_eq!(E5M2FNUZ.decode(0x7f), 57344.0);
    }

    #[test]
    fn fp8_encode_rounds_and_saturates() {
        let ty = ScalarType::Float8E4M3Fn;
        let bytes = ty.encode(&[1.0, -2.0, 1000.0, 0.3]);
        let back = ty.decode(&bytes);
        assert_eq!(back[0], 1.0);
        assert_eq!(back[1], -2.0);
        assert_eq!(back[2], 448.0);
        assert_abs_diff_eq!(back[3], 0.3, epsilon = 0.02);
    }

    #[test]
    fn half_types_decode_to_nearest_values() {
        let values = [0.5, -3.25, 1024.0];
        for ty in [ScalarType::Half, ScalarType::BFloat16] {
            let back = ty.decode(&ty.encode(&values));
            assert_eq!(back, values.to_vec());
        }
    }

    #[test]
    fn complex_decodes_interleaved_components() {
        let ty = ScalarType::ComplexFloat;
        let bytes = ty.encode(&[1.0, -1.0, 2.5, 0.0]);
        assert_eq!(bytes.len(), 2 * ty.element_size());
        assert_eq!(ty.decode(&bytes), vec![1.0, -1.0, 2.5, 0.0]);
    }
}

use std::fmt;

use crate::error::{Error, Result};

// DType — Element types carried by every node
//
//   F16  — 16-bit IEEE half float, for mixed-precision training
//   BF16 — 16-bit brain float, for mixed-precision training
//   F32  — 32-bit float, the default workhorse
//   F64  — 64-bit float, for high-precision work (gradient checks)
//   U8   — unsigned byte, for image data and masks
//   U32  — unsigned 32-bit int, for indices
//   I32  — signed 32-bit int, for indices and labels
//   I64  — signed 64-bit int, for labels/indices
//   Bool — truth values (stored one byte per element)
//
// PROMOTION:
//
//   Binary operators pick a common element type for their output:
//     same type           → itself
//     float × float       → the wider float (F16 × BF16 → F32)
//     int × int           → the wider int, signed if either side is signed
//     anything else       → incompatible (float × int, int × bool, ...)

/// Enum of all supported element data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F16,
    BF16,
    F32,
    F64,
    U8,
    U32,
    I32,
    I64,
    Bool,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F16 => 2,
            DType::BF16 => 2,
            DType::F32 => 4,
            DType::F64 => 8,
            DType::U8 => 1,
            DType::U32 => 4,
            DType::I32 => 4,
            DType::I64 => 8,
            DType::Bool => 1,
        }
    }

    /// Whether this dtype is a floating-point type (needed for gradient tracking).
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F16 | DType::BF16 | DType::F32 | DType::F64)
    }

    /// Whether this is a half-precision type (F16 or BF16).
    pub fn is_half(&self) -> bool {
        matches!(self, DType::F16 | DType::BF16)
    }

    /// Whether this is an integer type (signed or unsigned).
    pub fn is_int(&self) -> bool {
        matches!(self, DType::U8 | DType::U32 | DType::I32 | DType::I64)
    }

    fn is_signed_int(&self) -> bool {
        matches!(self, DType::I32 | DType::I64)
    }

    /// Common element type of a binary operation, or a type error.
    pub fn promote(lhs: DType, rhs: DType, op: &'static str) -> Result<DType> {
        if lhs == rhs {
            return Ok(lhs);
        }
        let incompatible = || Error::IncompatibleTypes { lhs, rhs, op };
        if lhs.is_float() && rhs.is_float() {
            if lhs.is_half() && rhs.is_half() {
                return Ok(DType::F32);
            }
            return Ok(if lhs.size_in_bytes() >= rhs.size_in_bytes() {
                lhs
            } else {
                rhs
            });
        }
        if lhs.is_int() && rhs.is_int() {
            let width = |signed: bool| {
                [lhs, rhs]
                    .iter()
                    .filter(|d| d.is_signed_int() == signed)
                    .map(|d| d.size_in_bytes())
                    .max()
                    .unwrap_or(0)
            };
            let (ws, wu) = (width(true), width(false));
            if ws == 0 {
                return Ok(if wu == 1 { DType::U8 } else { DType::U32 });
            }
            // an unsigned side needs twice its width to fit in a signed type
            let required = ws.max(wu * 2);
            return Ok(if required <= 4 { DType::I32 } else { DType::I64 });
        }
        Err(incompatible())
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::U8 => "u8",
            DType::U32 => "u32",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::Bool => "bool",
        };
        write!(f, "{}", s)
    }
}

// WithDType — Trait that connects Rust types to DType enum
//
// Lets initializers and host-side helpers accept typed slices
// (`init::from_vector(vec![1.0f32, 2.0])`) and pick the DType from T.

/// Trait implemented by Rust types that can be stored in a buffer.
pub trait WithDType: Copy + Send + Sync + 'static + num_traits::NumCast + std::fmt::Debug {
    /// The corresponding DType enum variant.
    const DTYPE: DType;

    /// Convert this value to f64 (for generic numeric code).
    fn to_f64(self) -> f64;

    /// Create a value of this type from f64.
    fn from_f64(v: f64) -> Self;
}

macro_rules! with_dtype_as {
    ($t:ty, $d:expr) => {
        impl WithDType for $t {
            const DTYPE: DType = $d;
            fn to_f64(self) -> f64 {
                self as f64
            }
            fn from_f64(v: f64) -> Self {
                v as $t
            }
        }
    };
}

with_dtype_as!(f32, DType::F32);
with_dtype_as!(f64, DType::F64);
with_dtype_as!(u8, DType::U8);
with_dtype_as!(u32, DType::U32);
with_dtype_as!(i32, DType::I32);
with_dtype_as!(i64, DType::I64);

impl WithDType for half::f16 {
    const DTYPE: DType = DType::F16;
    fn to_f64(self) -> f64 {
        self.to_f32() as f64
    }
    fn from_f64(v: f64) -> Self {
        half::f16::from_f64(v)
    }
}

impl WithDType for half::bf16 {
    const DTYPE: DType = DType::BF16;
    fn to_f64(self) -> f64 {
        self.to_f32() as f64
    }
    fn from_f64(v: f64) -> Self {
        half::bf16::from_f64(v)
    }
}

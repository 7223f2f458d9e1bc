//! Element types and typed value buffers for volume data.
//!
//! Values read from a volume keep their native dtype end to end: segment IDs
//! are uint64 and must not round-trip through f64, which only holds 53 bits.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Element type of a stored volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dtype {
    #[serde(rename = "uint8")]
    U8,
    #[serde(rename = "uint16")]
    U16,
    #[serde(rename = "uint32")]
    U32,
    #[serde(rename = "uint64")]
    U64,
    #[serde(rename = "int8")]
    I8,
    #[serde(rename = "int16")]
    I16,
    #[serde(rename = "int32")]
    I32,
    #[serde(rename = "int64")]
    I64,
    #[serde(rename = "float32")]
    F32,
    #[serde(rename = "float64")]
    F64,
}

impl Dtype {
    /// Size of one element in bytes.
    pub fn size(&self) -> usize {
        match self {
            Dtype::U8 | Dtype::I8 => 1,
            Dtype::U16 | Dtype::I16 => 2,
            Dtype::U32 | Dtype::I32 | Dtype::F32 => 4,
            Dtype::U64 | Dtype::I64 | Dtype::F64 => 8,
        }
    }

    pub fn is_integer(&self) -> bool {
        !matches!(self, Dtype::F32 | Dtype::F64)
    }

    /// Parse a numpy-style typestr as found in zarr `.zarray` metadata,
    /// e.g. `<f4`, `<u8`, `|u1`. Big-endian data is not supported.
    pub fn from_typestr(s: &str) -> Result<Self> {
        let mut chars = s.chars();
        let order = chars.next().unwrap_or('?');
        if order == '>' {
            bail!("Big-endian dtype '{}' is not supported", s);
        }
        if order != '<' && order != '|' && order != '=' {
            bail!("Invalid dtype string '{}'", s);
        }
        let dtype = match chars.as_str() {
            "u1" => Dtype::U8,
            "u2" => Dtype::U16,
            "u4" => Dtype::U32,
            "u8" => Dtype::U64,
            "i1" => Dtype::I8,
            "i2" => Dtype::I16,
            "i4" => Dtype::I32,
            "i8" => Dtype::I64,
            "f4" => Dtype::F32,
            "f8" => Dtype::F64,
            other => bail!("Unsupported dtype '{}'", other),
        };
        Ok(dtype)
    }
}

/// Behavior each element type shares; keeps `ScalarValues` free of
/// per-variant special cases.
trait Element: Copy {
    fn read_le(bytes: &[u8]) -> Self;
    fn write_le(self, out: &mut Vec<u8>);
    /// Value reported for out-of-bounds points: 0 for integers (NaN would
    /// map to MAX_VALUE), NaN for floats.
    fn error_value() -> Self;
    fn cast_f64(v: f64) -> Self;
    fn as_f64(self) -> f64;
    fn to_json(self) -> Value;
    fn to_display(self) -> String;
}

macro_rules! int_element {
    ($ty:ty) => {
        impl Element for $ty {
            fn read_le(bytes: &[u8]) -> Self {
                <$ty>::from_le_bytes(bytes.try_into().unwrap())
            }
            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }
            fn error_value() -> Self {
                0
            }
            fn cast_f64(v: f64) -> Self {
                v as $ty
            }
            fn as_f64(self) -> f64 {
                self as f64
            }
            fn to_json(self) -> Value {
                Value::from(self)
            }
            fn to_display(self) -> String {
                self.to_string()
            }
        }
    };
}

macro_rules! float_element {
    ($ty:ty) => {
        impl Element for $ty {
            fn read_le(bytes: &[u8]) -> Self {
                <$ty>::from_le_bytes(bytes.try_into().unwrap())
            }
            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }
            fn error_value() -> Self {
                <$ty>::NAN
            }
            fn cast_f64(v: f64) -> Self {
                v as $ty
            }
            fn as_f64(self) -> f64 {
                self as f64
            }
            fn to_json(self) -> Value {
                // Error values serialize as null, not NaN
                serde_json::Number::from_f64(self as f64)
                    .map(Value::Number)
                    .unwrap_or(Value::Null)
            }
            fn to_display(self) -> String {
                if self.is_finite() {
                    self.to_string()
                } else {
                    "nan".to_string()
                }
            }
        }
    };
}

int_element!(u8);
int_element!(u16);
int_element!(u32);
int_element!(u64);
int_element!(i8);
int_element!(i16);
int_element!(i32);
int_element!(i64);
float_element!(f32);
float_element!(f64);

/// Typed buffer of volume values.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValues {
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
    U64(Vec<u64>),
    I8(Vec<i8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

macro_rules! dispatch {
    ($self:expr, $v:ident => $body:expr) => {
        match $self {
            ScalarValues::U8($v) => $body,
            ScalarValues::U16($v) => $body,
            ScalarValues::U32($v) => $body,
            ScalarValues::U64($v) => $body,
            ScalarValues::I8($v) => $body,
            ScalarValues::I16($v) => $body,
            ScalarValues::I32($v) => $body,
            ScalarValues::I64($v) => $body,
            ScalarValues::F32($v) => $body,
            ScalarValues::F64($v) => $body,
        }
    };
}

macro_rules! construct {
    ($dtype:expr, $ty:ident => $body:expr) => {
        match $dtype {
            Dtype::U8 => {
                type $ty = u8;
                ScalarValues::U8($body)
            }
            Dtype::U16 => {
                type $ty = u16;
                ScalarValues::U16($body)
            }
            Dtype::U32 => {
                type $ty = u32;
                ScalarValues::U32($body)
            }
            Dtype::U64 => {
                type $ty = u64;
                ScalarValues::U64($body)
            }
            Dtype::I8 => {
                type $ty = i8;
                ScalarValues::I8($body)
            }
            Dtype::I16 => {
                type $ty = i16;
                ScalarValues::I16($body)
            }
            Dtype::I32 => {
                type $ty = i32;
                ScalarValues::I32($body)
            }
            Dtype::I64 => {
                type $ty = i64;
                ScalarValues::I64($body)
            }
            Dtype::F32 => {
                type $ty = f32;
                ScalarValues::F32($body)
            }
            Dtype::F64 => {
                type $ty = f64;
                ScalarValues::F64($body)
            }
        }
    };
}

impl ScalarValues {
    pub fn dtype(&self) -> Dtype {
        match self {
            ScalarValues::U8(_) => Dtype::U8,
            ScalarValues::U16(_) => Dtype::U16,
            ScalarValues::U32(_) => Dtype::U32,
            ScalarValues::U64(_) => Dtype::U64,
            ScalarValues::I8(_) => Dtype::I8,
            ScalarValues::I16(_) => Dtype::I16,
            ScalarValues::I32(_) => Dtype::I32,
            ScalarValues::I64(_) => Dtype::I64,
            ScalarValues::F32(_) => Dtype::F32,
            ScalarValues::F64(_) => Dtype::F64,
        }
    }

    pub fn len(&self) -> usize {
        dispatch!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Buffer filled with the error value (0 for integers, NaN for floats).
    pub fn error_filled(dtype: Dtype, len: usize) -> Self {
        construct!(dtype, T => vec![<T as Element>::error_value(); len])
    }

    /// Buffer filled with an arbitrary value (used for zarr fill_value).
    pub fn filled(dtype: Dtype, len: usize, fill: f64) -> Self {
        construct!(dtype, T => vec![<T as Element>::cast_f64(fill); len])
    }

    /// Decode a little-endian byte buffer.
    pub fn from_le_bytes(dtype: Dtype, bytes: &[u8]) -> Result<Self> {
        let size = dtype.size();
        if bytes.len() % size != 0 {
            bail!(
                "Byte buffer length {} is not a multiple of element size {}",
                bytes.len(),
                size
            );
        }
        Ok(construct!(dtype, T => bytes
            .chunks_exact(size)
            .map(<T as Element>::read_le)
            .collect::<Vec<_>>()))
    }

    /// Copy one element between buffers of the same dtype.
    pub fn copy_value(&mut self, dst_idx: usize, src: &ScalarValues, src_idx: usize) {
        macro_rules! copy_arm {
            ($lhs:expr, $rhs:expr, $($variant:ident),*) => {
                match ($lhs, $rhs) {
                    $( (ScalarValues::$variant(d), ScalarValues::$variant(s)) => {
                        d[dst_idx] = s[src_idx];
                    } )*
                    // Buffers are always created from the same datasource dtype
                    _ => panic!("dtype mismatch in copy_value"),
                }
            };
        }
        copy_arm!(self, src, U8, U16, U32, U64, I8, I16, I32, I64, F32, F64);
    }

    pub fn f64_at(&self, idx: usize) -> f64 {
        dispatch!(self, v => Element::as_f64(v[idx]))
    }

    /// JSON rendering; non-finite floats become null.
    pub fn json_at(&self, idx: usize) -> Value {
        dispatch!(self, v => Element::to_json(v[idx]))
    }

    pub fn string_at(&self, idx: usize) -> String {
        dispatch!(self, v => Element::to_display(v[idx]))
    }

    fn write_le(&self, idx: usize, out: &mut Vec<u8>) {
        dispatch!(self, v => Element::write_le(v[idx], out))
    }
}

/// Values sampled at a set of points, `width` values per point, stored
/// row-major (point index varies slowest).
#[derive(Debug, Clone)]
pub struct ScalarField {
    pub values: ScalarValues,
    pub width: usize,
}

impl ScalarField {
    pub fn new(values: ScalarValues, width: usize) -> Self {
        debug_assert!(width > 0 && values.len() % width == 0);
        Self { values, width }
    }

    pub fn num_points(&self) -> usize {
        self.values.len() / self.width
    }

    /// Index of channel `c` at point `i`.
    pub fn idx(&self, point: usize, channel: usize) -> usize {
        point * self.width + channel
    }

    pub fn f64(&self, point: usize, channel: usize) -> f64 {
        self.values.f64_at(self.idx(point, channel))
    }

    /// Little-endian bytes, point-major (`N x w`) or channel-major (`w x N`).
    pub fn to_le_bytes(&self, channel_major: bool) -> Vec<u8> {
        let n = self.num_points();
        let mut out = Vec::with_capacity(self.values.len() * self.values.dtype().size());
        if channel_major {
            for c in 0..self.width {
                for i in 0..n {
                    self.values.write_le(self.idx(i, c), &mut out);
                }
            }
        } else {
            for i in 0..n {
                for c in 0..self.width {
                    self.values.write_le(self.idx(i, c), &mut out);
                }
            }
        }
        out
    }
}

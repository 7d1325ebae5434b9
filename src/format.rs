//! Primitive wire formats and the typed values they carry.
//!
//! Codes follow the struct-module letters the firmware headers are generated
//! from (`c b B ? h H i I l L q Q f d s`), always with standard sizes and
//! little-endian byte order, never with alignment padding.

use crate::error::{HalError, HalResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FormatCode {
    Char,
    I8,
    U8,
    Bool,
    I16,
    U16,
    I32,
    U32,
    /// `l`: 4 bytes on the wire, `long` in the firmware headers.
    Long,
    ULong,
    I64,
    U64,
    F32,
    F64,
    Bytes(usize),
}

impl FormatCode {
    pub fn size(&self) -> usize {
        match self {
            FormatCode::Char | FormatCode::I8 | FormatCode::U8 | FormatCode::Bool => 1,
            FormatCode::I16 | FormatCode::U16 => 2,
            FormatCode::I32
            | FormatCode::U32
            | FormatCode::Long
            | FormatCode::ULong
            | FormatCode::F32 => 4,
            FormatCode::I64 | FormatCode::U64 | FormatCode::F64 => 8,
            FormatCode::Bytes(n) => *n,
        }
    }

    /// Struct-style letter(s) for this code.
    pub fn code(&self) -> String {
        match self {
            FormatCode::Char => "c".to_string(),
            FormatCode::I8 => "b".to_string(),
            FormatCode::U8 => "B".to_string(),
            FormatCode::Bool => "?".to_string(),
            FormatCode::I16 => "h".to_string(),
            FormatCode::U16 => "H".to_string(),
            FormatCode::I32 => "i".to_string(),
            FormatCode::U32 => "I".to_string(),
            FormatCode::Long => "l".to_string(),
            FormatCode::ULong => "L".to_string(),
            FormatCode::I64 => "q".to_string(),
            FormatCode::U64 => "Q".to_string(),
            FormatCode::F32 => "f".to_string(),
            FormatCode::F64 => "d".to_string(),
            FormatCode::Bytes(n) => format!("{}s", n),
        }
    }

    /// C type used for this field in generated firmware headers.
    pub fn c_type_name(&self) -> &'static str {
        match self {
            FormatCode::Char => "char",
            FormatCode::I8 => "signed char",
            FormatCode::U8 => "unsigned char",
            FormatCode::Bool => "bool",
            FormatCode::I16 => "short",
            FormatCode::U16 => "unsigned short",
            FormatCode::I32 => "int",
            FormatCode::U32 => "unsigned int",
            FormatCode::Long => "long",
            FormatCode::ULong => "unsigned long",
            FormatCode::I64 => "long long",
            FormatCode::U64 => "unsigned long long",
            FormatCode::F32 => "float",
            FormatCode::F64 => "double",
            FormatCode::Bytes(_) => "char[]",
        }
    }

    pub fn zero(&self) -> Value {
        match self {
            FormatCode::Char => Value::Char(0),
            FormatCode::I8 => Value::I8(0),
            FormatCode::U8 => Value::U8(0),
            FormatCode::Bool => Value::Bool(false),
            FormatCode::I16 => Value::I16(0),
            FormatCode::U16 => Value::U16(0),
            FormatCode::I32 | FormatCode::Long => Value::I32(0),
            FormatCode::U32 | FormatCode::ULong => Value::U32(0),
            FormatCode::I64 => Value::I64(0),
            FormatCode::U64 => Value::U64(0),
            FormatCode::F32 => Value::F32(0.0),
            FormatCode::F64 => Value::F64(0.0),
            FormatCode::Bytes(n) => Value::Bytes(vec![0; *n]),
        }
    }

    fn integer_range(&self) -> Option<(i128, i128)> {
        match self {
            FormatCode::Char | FormatCode::U8 => Some((0, u8::MAX as i128)),
            FormatCode::I8 => Some((i8::MIN as i128, i8::MAX as i128)),
            FormatCode::I16 => Some((i16::MIN as i128, i16::MAX as i128)),
            FormatCode::U16 => Some((0, u16::MAX as i128)),
            FormatCode::I32 | FormatCode::Long => Some((i32::MIN as i128, i32::MAX as i128)),
            FormatCode::U32 | FormatCode::ULong => Some((0, u32::MAX as i128)),
            FormatCode::I64 => Some((i64::MIN as i128, i64::MAX as i128)),
            FormatCode::U64 => Some((0, u64::MAX as i128)),
            _ => None,
        }
    }

    /// Append the little-endian encoding of `value`. The value must already
    /// be of this code's type.
    pub fn encode_into(&self, value: &Value, out: &mut Vec<u8>) -> HalResult<()> {
        if !value.matches(self) {
            return Err(HalError::Format(format!(
                "{} value cannot be encoded as '{}'",
                value.type_name(),
                self.code()
            )));
        }
        value.write_le(out);
        Ok(())
    }

    /// Decode one value from exactly `self.size()` bytes.
    pub fn decode(&self, bytes: &[u8]) -> HalResult<Value> {
        if bytes.len() != self.size() {
            return Err(HalError::Format(format!(
                "'{}' needs {} bytes, got {}",
                self.code(),
                self.size(),
                bytes.len()
            )));
        }
        let value = match self {
            FormatCode::Char => Value::Char(bytes[0]),
            FormatCode::I8 => Value::I8(i8::from_le_bytes([bytes[0]])),
            FormatCode::U8 => Value::U8(bytes[0]),
            FormatCode::Bool => Value::Bool(bytes[0] != 0),
            FormatCode::I16 => Value::I16(i16::from_le_bytes([bytes[0], bytes[1]])),
            FormatCode::U16 => Value::U16(u16::from_le_bytes([bytes[0], bytes[1]])),
            FormatCode::I32 | FormatCode::Long => Value::I32(i32::from_le_bytes(array4(bytes))),
            FormatCode::U32 | FormatCode::ULong => Value::U32(u32::from_le_bytes(array4(bytes))),
            FormatCode::F32 => Value::F32(f32::from_le_bytes(array4(bytes))),
            FormatCode::I64 => Value::I64(i64::from_le_bytes(array8(bytes))),
            FormatCode::U64 => Value::U64(u64::from_le_bytes(array8(bytes))),
            FormatCode::F64 => Value::F64(f64::from_le_bytes(array8(bytes))),
            FormatCode::Bytes(_) => Value::Bytes(bytes.to_vec()),
        };
        Ok(value)
    }

    /// Convert a caller-supplied value into this code's type.
    ///
    /// Integers move between widths when they fit (`Value` error otherwise),
    /// integers widen into floats, floats never narrow into integers
    /// (`Type` error), short byte strings are zero-padded.
    pub fn coerce(&self, value: Value) -> HalResult<Value> {
        if value.matches(self) {
            return Ok(value);
        }

        let type_error = |value: &Value| {
            HalError::Type(format!(
                "{} value cannot be represented as '{}'",
                value.type_name(),
                self.code()
            ))
        };

        match self {
            FormatCode::Bool => match value.as_i128() {
                Some(v) => Ok(Value::Bool(v != 0)),
                None => Err(type_error(&value)),
            },
            FormatCode::F32 => {
                let v = value.as_f64().ok_or_else(|| type_error(&value))?;
                if v.is_finite() && v.abs() > f32::MAX as f64 {
                    return Err(HalError::Value(format!("{} is too large for 'f'", v)));
                }
                Ok(Value::F32(v as f32))
            }
            FormatCode::F64 => value
                .as_f64()
                .map(Value::F64)
                .ok_or_else(|| type_error(&value)),
            FormatCode::Bytes(n) => {
                let mut bytes = match value {
                    Value::Bytes(bytes) => bytes,
                    Value::Char(c) => vec![c],
                    other => return Err(type_error(&other)),
                };
                if bytes.len() > *n {
                    return Err(HalError::Value(format!(
                        "byte string of length {} does not fit '{}s'",
                        bytes.len(),
                        n
                    )));
                }
                bytes.resize(*n, 0);
                Ok(Value::Bytes(bytes))
            }
            FormatCode::Char => match value {
                Value::Bytes(ref bytes) if bytes.len() == 1 => Ok(Value::Char(bytes[0])),
                ref other => {
                    let v = other.as_i128().ok_or_else(|| type_error(other))?;
                    self.check_range(v)?;
                    Ok(Value::Char(v as u8))
                }
            },
            integer => {
                let v = value.as_i128().ok_or_else(|| type_error(&value))?;
                integer.check_range(v)?;
                Ok(match integer {
                    FormatCode::I8 => Value::I8(v as i8),
                    FormatCode::U8 => Value::U8(v as u8),
                    FormatCode::I16 => Value::I16(v as i16),
                    FormatCode::U16 => Value::U16(v as u16),
                    FormatCode::I32 | FormatCode::Long => Value::I32(v as i32),
                    FormatCode::U32 | FormatCode::ULong => Value::U32(v as u32),
                    FormatCode::I64 => Value::I64(v as i64),
                    FormatCode::U64 => Value::U64(v as u64),
                    _ => return Err(type_error(&value)),
                })
            }
        }
    }

    fn check_range(&self, v: i128) -> HalResult<()> {
        match self.integer_range() {
            Some((lo, hi)) if v < lo || v > hi => Err(HalError::Value(format!(
                "{} is out of range for '{}' ({}..={})",
                v,
                self.code(),
                lo,
                hi
            ))),
            _ => Ok(()),
        }
    }
}

fn array4(bytes: &[u8]) -> [u8; 4] {
    [bytes[0], bytes[1], bytes[2], bytes[3]]
}

fn array8(bytes: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&bytes[..8]);
    out
}

/// Largest repeat count (or byte-string length) a format may declare.
pub const MAX_REPEAT: usize = 65_535;

/// Parse a struct-style format string (`"hhh"`, `"3f"`, `"16s"`) into codes.
///
/// A leading byte-order mark of `<` or `=` is accepted and ignored; every
/// layout in this crate is little-endian.
pub fn parse_format(fmt: &str) -> HalResult<Vec<FormatCode>> {
    let body = fmt.trim().trim_start_matches(['<', '=']);
    let mut codes = Vec::new();
    let mut count: Option<usize> = None;

    for ch in body.chars() {
        if ch.is_whitespace() {
            continue;
        }
        if let Some(digit) = ch.to_digit(10) {
            let next = count
                .unwrap_or(0)
                .checked_mul(10)
                .and_then(|c| c.checked_add(digit as usize))
                .filter(|c| *c <= MAX_REPEAT);
            count = Some(next.ok_or_else(|| {
                HalError::Config(format!(
                    "repeat count in \"{}\" exceeds {}",
                    fmt, MAX_REPEAT
                ))
            })?);
            continue;
        }

        let repeat = count.take();
        let code = match ch {
            'c' => FormatCode::Char,
            'b' => FormatCode::I8,
            'B' => FormatCode::U8,
            '?' => FormatCode::Bool,
            'h' => FormatCode::I16,
            'H' => FormatCode::U16,
            'i' => FormatCode::I32,
            'I' => FormatCode::U32,
            'l' => FormatCode::Long,
            'L' => FormatCode::ULong,
            'q' => FormatCode::I64,
            'Q' => FormatCode::U64,
            'f' => FormatCode::F32,
            'd' => FormatCode::F64,
            's' => {
                codes.push(FormatCode::Bytes(repeat.unwrap_or(1)));
                continue;
            }
            other => {
                return Err(HalError::Config(format!(
                    "unsupported format code '{}' in \"{}\"",
                    other, fmt
                )));
            }
        };
        for _ in 0..repeat.unwrap_or(1) {
            codes.push(code);
        }
    }

    if count.is_some() {
        return Err(HalError::Config(format!(
            "dangling repeat count in format \"{}\"",
            fmt
        )));
    }
    if codes.is_empty() {
        return Err(HalError::Config(format!("empty format \"{}\"", fmt)));
    }
    Ok(codes)
}

/// Struct-style string for a sequence of codes, without byte-order prefix.
pub fn format_string(codes: &[FormatCode]) -> String {
    codes.iter().map(FormatCode::code).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Char(u8),
    I8(i8),
    U8(u8),
    Bool(bool),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Bytes(#[serde(with = "serde_bytes")] Vec<u8>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Char(_) => "char",
            Value::I8(_) => "i8",
            Value::U8(_) => "u8",
            Value::Bool(_) => "bool",
            Value::I16(_) => "i16",
            Value::U16(_) => "u16",
            Value::I32(_) => "i32",
            Value::U32(_) => "u32",
            Value::I64(_) => "i64",
            Value::U64(_) => "u64",
            Value::F32(_) => "f32",
            Value::F64(_) => "f64",
            Value::Bytes(_) => "bytes",
        }
    }

    /// Append this value's own little-endian bytes.
    pub fn write_le(&self, out: &mut Vec<u8>) {
        match self {
            Value::Char(v) | Value::U8(v) => out.push(*v),
            Value::I8(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Bool(v) => out.push(u8::from(*v)),
            Value::I16(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::U16(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::I32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::U32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::I64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::U64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::F32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::F64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Bytes(v) => out.extend_from_slice(v),
        }
    }

    /// Exact type match, byte strings included.
    pub fn matches(&self, code: &FormatCode) -> bool {
        match (code, self) {
            (FormatCode::Bytes(n), Value::Bytes(v)) => v.len() == *n,
            (FormatCode::Char, Value::Char(_))
            | (FormatCode::I8, Value::I8(_))
            | (FormatCode::U8, Value::U8(_))
            | (FormatCode::Bool, Value::Bool(_))
            | (FormatCode::I16, Value::I16(_))
            | (FormatCode::U16, Value::U16(_))
            | (FormatCode::I32 | FormatCode::Long, Value::I32(_))
            | (FormatCode::U32 | FormatCode::ULong, Value::U32(_))
            | (FormatCode::I64, Value::I64(_))
            | (FormatCode::U64, Value::U64(_))
            | (FormatCode::F32, Value::F32(_))
            | (FormatCode::F64, Value::F64(_)) => true,
            _ => false,
        }
    }

    fn as_i128(&self) -> Option<i128> {
        match self {
            Value::Char(v) | Value::U8(v) => Some(*v as i128),
            Value::I8(v) => Some(*v as i128),
            Value::Bool(v) => Some(i128::from(*v)),
            Value::I16(v) => Some(*v as i128),
            Value::U16(v) => Some(*v as i128),
            Value::I32(v) => Some(*v as i128),
            Value::U32(v) => Some(*v as i128),
            Value::I64(v) => Some(*v as i128),
            Value::U64(v) => Some(*v as i128),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_i128().and_then(|v| i64::try_from(v).ok())
    }

    pub fn as_u64(&self) -> Option<u64> {
        self.as_i128().and_then(|v| u64::try_from(v).ok())
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F32(v) => Some(*v as f64),
            Value::F64(v) => Some(*v),
            other => other.as_i128().map(|v| v as f64),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            other => other.as_i128().map(|v| v != 0),
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(v) => Some(v),
            _ => None,
        }
    }
}

impl core::fmt::Display for Value {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Value::Char(v) if v.is_ascii_graphic() => write!(f, "'{}'", *v as char),
            Value::Char(v) => write!(f, "'\\x{:02x}'", v),
            Value::I8(v) => write!(f, "{}", v),
            Value::U8(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::I16(v) => write!(f, "{}", v),
            Value::U16(v) => write!(f, "{}", v),
            Value::I32(v) => write!(f, "{}", v),
            Value::U32(v) => write!(f, "{}", v),
            Value::I64(v) => write!(f, "{}", v),
            Value::U64(v) => write!(f, "{}", v),
            Value::F32(v) => write!(f, "{}", v),
            Value::F64(v) => write!(f, "{}", v),
            Value::Bytes(v) => {
                for byte in v {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

value_from!(
    i8 => I8,
    u8 => U8,
    bool => Bool,
    i16 => I16,
    u16 => U16,
    i32 => I32,
    u32 => U32,
    i64 => I64,
    u64 => U64,
    f32 => F32,
    f64 => F64,
    Vec<u8> => Bytes,
);

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_codes() {
        let codes = parse_format("cbB?hHiIlLqQfd").unwrap();
        assert_eq!(
            codes,
            vec![
                FormatCode::Char,
                FormatCode::I8,
                FormatCode::U8,
                FormatCode::Bool,
                FormatCode::I16,
                FormatCode::U16,
                FormatCode::I32,
                FormatCode::U32,
                FormatCode::Long,
                FormatCode::ULong,
                FormatCode::I64,
                FormatCode::U64,
                FormatCode::F32,
                FormatCode::F64,
            ]
        );
    }

    #[test]
    fn test_parse_repeat_counts() {
        assert_eq!(parse_format("hhh").unwrap(), parse_format("3h").unwrap());
        assert_eq!(parse_format("<16s").unwrap(), vec![FormatCode::Bytes(16)]);
        assert_eq!(parse_format("s").unwrap(), vec![FormatCode::Bytes(1)]);
        assert_eq!(parse_format("2if").unwrap().len(), 3);
    }

    #[test]
    fn test_parse_rejects_unknown_codes() {
        assert!(matches!(parse_format("P"), Err(HalError::Config(_))));
        assert!(matches!(parse_format("p"), Err(HalError::Config(_))));
        assert!(matches!(parse_format("x"), Err(HalError::Config(_))));
        assert!(matches!(parse_format(""), Err(HalError::Config(_))));
        assert!(matches!(parse_format("i3"), Err(HalError::Config(_))));
    }

    #[test]
    fn test_oversized_repeat_counts_rejected() {
        assert!(matches!(
            parse_format("99999999999999999999i"),
            Err(HalError::Config(_))
        ));
        assert!(matches!(parse_format("70000s"), Err(HalError::Config(_))));
        assert_eq!(parse_format("65535s").unwrap(), vec![FormatCode::Bytes(MAX_REPEAT)]);
    }

    #[test]
    fn test_long_codes_keep_their_c_types() {
        let codes = parse_format("lL").unwrap();
        assert_eq!(codes[0].c_type_name(), "long");
        assert_eq!(codes[1].c_type_name(), "unsigned long");
        assert_eq!(codes[0].size(), 4);
        assert_eq!(format_string(&codes), "lL");
        assert_eq!(FormatCode::Long.coerce(Value::I64(-5)).unwrap(), Value::I32(-5));
        assert_eq!(FormatCode::ULong.decode(&[1, 0, 0, 0]).unwrap(), Value::U32(1));
    }

    #[test]
    fn test_sizes_are_standard() {
        let total: usize = parse_format("cbB?hHiIqQfd4s")
            .unwrap()
            .iter()
            .map(FormatCode::size)
            .sum();
        assert_eq!(total, 1 + 1 + 1 + 1 + 2 + 2 + 4 + 4 + 8 + 8 + 4 + 8 + 4);
    }

    #[test]
    fn test_encode_is_little_endian() {
        let mut out = Vec::new();
        FormatCode::U16.encode_into(&Value::U16(0xAAAA), &mut out).unwrap();
        FormatCode::I32.encode_into(&Value::I32(10), &mut out).unwrap();
        FormatCode::F32.encode_into(&Value::F32(0.5), &mut out).unwrap();
        assert_eq!(out, vec![0xaa, 0xaa, 0x0a, 0, 0, 0, 0, 0, 0, 0x3f]);
    }

    #[test]
    fn test_encode_rejects_type_mismatch() {
        let mut out = Vec::new();
        let result = FormatCode::U16.encode_into(&Value::F32(1.0), &mut out);
        assert!(matches!(result, Err(HalError::Format(_))));
        assert!(out.is_empty());
    }

    #[test]
    fn test_decode_requires_exact_width() {
        assert_eq!(FormatCode::U16.decode(&[0x34, 0x12]).unwrap(), Value::U16(0x1234));
        assert!(FormatCode::U16.decode(&[0x34]).is_err());
        assert!(FormatCode::U16.decode(&[0x34, 0x12, 0x00]).is_err());
    }

    #[test]
    fn test_coerce_integer_ranges() {
        assert_eq!(FormatCode::U16.coerce(Value::I32(0xAAAA)).unwrap(), Value::U16(0xAAAA));
        assert!(matches!(
            FormatCode::U16.coerce(Value::I32(0x1_0000)),
            Err(HalError::Value(_))
        ));
        assert!(matches!(FormatCode::U32.coerce(Value::I32(-1)), Err(HalError::Value(_))));
        assert_eq!(FormatCode::Char.coerce(Value::I32(1)).unwrap(), Value::Char(1));
    }

    #[test]
    fn test_coerce_floats() {
        assert_eq!(FormatCode::F32.coerce(Value::I32(100)).unwrap(), Value::F32(100.0));
        assert!(matches!(FormatCode::I32.coerce(Value::F32(1.5)), Err(HalError::Type(_))));
        assert!(matches!(FormatCode::F32.coerce(Value::F64(1e300)), Err(HalError::Value(_))));
        assert!(matches!(
            FormatCode::F32.coerce(Value::Bytes(vec![1])),
            Err(HalError::Type(_))
        ));
    }

    #[test]
    fn test_coerce_byte_strings() {
        assert_eq!(
            FormatCode::Bytes(4).coerce(Value::from(&b"ab"[..])).unwrap(),
            Value::Bytes(vec![b'a', b'b', 0, 0])
        );
        assert!(matches!(
            FormatCode::Bytes(1).coerce(Value::from(&b"ab"[..])),
            Err(HalError::Value(_))
        ));
    }
}

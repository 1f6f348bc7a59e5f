//! Runtime value vectors bound against format strings.
//!
//! The original call style passed data through a variadic list; here writes
//! take a slice of [`Value`]s (scalars by value, arrays by slice) and reads
//! take a slice of [`Slot`]s (mutable targets). The format string still
//! decides how each argument is interpreted; the vectors only carry typed
//! leaves, which lets the parser enforce the argument count and the
//! element types instead of trusting the caller.

use byteorder::{ByteOrder, LittleEndian};
use pilot_communication::{Datatype, Payload, ReduceOp};

use crate::errors::{PilotError, Result};

/// Declared element type of a format term.
///
/// The discriminant codes are wire-visible: they are folded into format
/// signatures, so their values must stay stable across versions and ranks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CType {
    Char,
    Short,
    Int,
    Long,
    UnsignedChar,
    UnsignedShort,
    UnsignedLong,
    Unsigned,
    Float,
    Double,
    LongDouble,
    Byte,
    LongLong,
    UnsignedLongLong,
    UserDefined,
}

impl CType {
    /// Signature code of the type, 5 bits.
    pub(crate) fn code(self) -> u32 {
        match self {
            CType::Char => 0,
            CType::Short => 1,
            CType::Int => 2,
            CType::Long => 3,
            CType::UnsignedChar => 4,
            CType::UnsignedShort => 5,
            CType::UnsignedLong => 6,
            CType::Unsigned => 7,
            CType::Float => 8,
            CType::Double => 9,
            CType::LongDouble => 10,
            CType::Byte => 11,
            CType::LongLong => 12,
            CType::UnsignedLongLong => 13,
            CType::UserDefined => 15,
        }
    }

    /// Substrate datatype carrying this C type. `UserDefined` elements get
    /// their datatype from the argument list instead.
    pub(crate) fn datatype(self) -> Datatype {
        match self {
            CType::Char => Datatype::Int8,
            CType::Short => Datatype::Int16,
            CType::Int => Datatype::Int32,
            CType::Long | CType::LongLong => Datatype::Int64,
            CType::UnsignedChar | CType::Byte => Datatype::Uint8,
            CType::UnsignedShort => Datatype::Uint16,
            CType::Unsigned => Datatype::Uint32,
            CType::UnsignedLong | CType::UnsignedLongLong => Datatype::Uint64,
            CType::Float => Datatype::Float32,
            CType::Double | CType::LongDouble => Datatype::Float64,
            CType::UserDefined => Datatype::User(0),
        }
    }
}

/// One argument of a write-side call.
#[derive(Clone, Debug)]
pub enum Value<'a> {
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    I8s(&'a [i8]),
    I16s(&'a [i16]),
    I32s(&'a [i32]),
    I64s(&'a [i64]),
    U8s(&'a [u8]),
    U16s(&'a [u16]),
    U32s(&'a [u32]),
    U64s(&'a [u64]),
    F32s(&'a [f32]),
    F64s(&'a [f64]),
    /// A NUL-free string for `%s` terms.
    Str(&'a str),
    /// The element type for a `%m` term.
    Datatype(Datatype),
    /// The operator for a `mop/` reduce term.
    Op(ReduceOp),
}

fn encode_i8s(values: &[i8]) -> Vec<u8> {
    values.iter().map(|&v| v as u8).collect()
}

macro_rules! encode_wide {
    ($values:expr, $width:expr, $write:path) => {{
        let mut bytes = vec![0u8; $values.len() * $width];
        $write($values, &mut bytes);
        bytes
    }};
}

impl<'a> Value<'a> {
    /// Encodes a scalar of the declared type, or `None` when the argument's
    /// shape does not match the format term.
    pub(crate) fn encode_scalar(&self, ctype: CType) -> Option<Payload> {
        let datatype = ctype.datatype();
        let bytes = match (ctype, self) {
            (CType::Char, Value::I8(v)) => vec![*v as u8],
            (CType::Short, Value::I16(v)) => v.to_le_bytes().to_vec(),
            (CType::Int, Value::I32(v)) => v.to_le_bytes().to_vec(),
            (CType::Long | CType::LongLong, Value::I64(v)) => v.to_le_bytes().to_vec(),
            (CType::UnsignedChar | CType::Byte, Value::U8(v)) => vec![*v],
            (CType::UnsignedShort, Value::U16(v)) => v.to_le_bytes().to_vec(),
            (CType::Unsigned, Value::U32(v)) => v.to_le_bytes().to_vec(),
            (CType::UnsignedLong | CType::UnsignedLongLong, Value::U64(v)) => {
                v.to_le_bytes().to_vec()
            }
            (CType::Float, Value::F32(v)) => v.to_le_bytes().to_vec(),
            (CType::Double | CType::LongDouble, Value::F64(v)) => v.to_le_bytes().to_vec(),
            _ => return None,
        };
        Some(Payload::new(datatype, bytes))
    }

    /// Encodes an array of the declared type; the element count is the
    /// slice length.
    pub(crate) fn encode_array(&self, ctype: CType) -> Option<Payload> {
        let datatype = ctype.datatype();
        let bytes = match (ctype, self) {
            (CType::Char, Value::I8s(v)) => encode_i8s(v),
            (CType::Short, Value::I16s(v)) => encode_wide!(v, 2, LittleEndian::write_i16_into),
            (CType::Int, Value::I32s(v)) => encode_wide!(v, 4, LittleEndian::write_i32_into),
            (CType::Long | CType::LongLong, Value::I64s(v)) => {
                encode_wide!(v, 8, LittleEndian::write_i64_into)
            }
            (CType::UnsignedChar | CType::Byte, Value::U8s(v)) => v.to_vec(),
            (CType::UnsignedShort, Value::U16s(v)) => {
                encode_wide!(v, 2, LittleEndian::write_u16_into)
            }
            (CType::Unsigned, Value::U32s(v)) => encode_wide!(v, 4, LittleEndian::write_u32_into),
            (CType::UnsignedLong | CType::UnsignedLongLong, Value::U64s(v)) => {
                encode_wide!(v, 8, LittleEndian::write_u64_into)
            }
            (CType::Float, Value::F32s(v)) => encode_wide!(v, 4, LittleEndian::write_f32_into),
            (CType::Double | CType::LongDouble, Value::F64s(v)) => {
                encode_wide!(v, 8, LittleEndian::write_f64_into)
            }
            _ => return None,
        };
        Some(Payload::new(datatype, bytes))
    }

    /// Length of an array-shaped argument of the declared type.
    pub(crate) fn array_len(&self, ctype: CType) -> Option<usize> {
        match (ctype, self) {
            (CType::Char, Value::I8s(v)) => Some(v.len()),
            (CType::Short, Value::I16s(v)) => Some(v.len()),
            (CType::Int, Value::I32s(v)) => Some(v.len()),
            (CType::Long | CType::LongLong, Value::I64s(v)) => Some(v.len()),
            (CType::UnsignedChar | CType::Byte, Value::U8s(v)) => Some(v.len()),
            (CType::UnsignedShort, Value::U16s(v)) => Some(v.len()),
            (CType::Unsigned, Value::U32s(v)) => Some(v.len()),
            (CType::UnsignedLong | CType::UnsignedLongLong, Value::U64s(v)) => Some(v.len()),
            (CType::Float, Value::F32s(v)) => Some(v.len()),
            (CType::Double | CType::LongDouble, Value::F64s(v)) => Some(v.len()),
            _ => None,
        }
    }

    pub(crate) fn as_str(&self) -> Option<&'a str> {
        match self {
            Value::Str(s) => Some(*s),
            _ => None,
        }
    }

    pub(crate) fn as_datatype(&self) -> Option<Datatype> {
        match self {
            Value::Datatype(dt) => Some(*dt),
            _ => None,
        }
    }

    pub(crate) fn as_op(&self) -> Option<ReduceOp> {
        match self {
            Value::Op(op) => Some(op.clone()),
            _ => None,
        }
    }

    pub(crate) fn as_raw(&self) -> Option<&'a [u8]> {
        match self {
            Value::U8s(bytes) => Some(*bytes),
            _ => None,
        }
    }
}

/// One target of a read-side call.
#[derive(Debug)]
pub enum Slot<'a> {
    I8(&'a mut i8),
    I16(&'a mut i16),
    I32(&'a mut i32),
    I64(&'a mut i64),
    U8(&'a mut u8),
    U16(&'a mut u16),
    U32(&'a mut u32),
    U64(&'a mut u64),
    F32(&'a mut f32),
    F64(&'a mut f64),
    I8s(&'a mut [i8]),
    I16s(&'a mut [i16]),
    I32s(&'a mut [i32]),
    I64s(&'a mut [i64]),
    U8s(&'a mut [u8]),
    U16s(&'a mut [u16]),
    U32s(&'a mut [u32]),
    U64s(&'a mut [u64]),
    F32s(&'a mut [f32]),
    F64s(&'a mut [f64]),
    /// Target of a variable-length (`^`) read; sized by the library to the
    /// exact received length.
    VarI8(&'a mut Vec<i8>),
    VarI16(&'a mut Vec<i16>),
    VarI32(&'a mut Vec<i32>),
    VarI64(&'a mut Vec<i64>),
    VarU8(&'a mut Vec<u8>),
    VarU16(&'a mut Vec<u16>),
    VarU32(&'a mut Vec<u32>),
    VarU64(&'a mut Vec<u64>),
    VarF32(&'a mut Vec<f32>),
    VarF64(&'a mut Vec<f64>),
    /// Target of a `%s` read.
    Str(&'a mut String),
    /// The element type for a `%m` term (an input, as on the write side).
    Datatype(Datatype),
    /// The operator for a `mop/` reduce term (an input).
    Op(ReduceOp),
}

fn decode_i8s(bytes: &[u8], out: &mut [i8]) {
    for (slot, &byte) in out.iter_mut().zip(bytes) {
        *slot = byte as i8;
    }
}

impl<'a> Slot<'a> {
    /// True when this slot can receive one scalar of the declared type.
    pub(crate) fn matches_scalar(&self, ctype: CType) -> bool {
        matches!(
            (ctype, self),
            (CType::Char, Slot::I8(_))
                | (CType::Short, Slot::I16(_))
                | (CType::Int, Slot::I32(_))
                | (CType::Long | CType::LongLong, Slot::I64(_))
                | (CType::UnsignedChar | CType::Byte, Slot::U8(_))
                | (CType::UnsignedShort, Slot::U16(_))
                | (CType::Unsigned, Slot::U32(_))
                | (CType::UnsignedLong | CType::UnsignedLongLong, Slot::U64(_))
                | (CType::Float, Slot::F32(_))
                | (CType::Double | CType::LongDouble, Slot::F64(_))
        )
    }

    /// Length of a fixed-array target of the declared type.
    pub(crate) fn slice_len(&self, ctype: CType) -> Option<usize> {
        match (ctype, self) {
            (CType::Char, Slot::I8s(v)) => Some(v.len()),
            (CType::Short, Slot::I16s(v)) => Some(v.len()),
            (CType::Int, Slot::I32s(v)) => Some(v.len()),
            (CType::Long | CType::LongLong, Slot::I64s(v)) => Some(v.len()),
            (CType::UnsignedChar | CType::Byte, Slot::U8s(v)) => Some(v.len()),
            (CType::UnsignedShort, Slot::U16s(v)) => Some(v.len()),
            (CType::Unsigned, Slot::U32s(v)) => Some(v.len()),
            (CType::UnsignedLong | CType::UnsignedLongLong, Slot::U64s(v)) => Some(v.len()),
            (CType::Float, Slot::F32s(v)) => Some(v.len()),
            (CType::Double | CType::LongDouble, Slot::F64s(v)) => Some(v.len()),
            _ => None,
        }
    }

    /// True when this slot is a growable target for a `^` read of the
    /// declared type.
    pub(crate) fn matches_var(&self, ctype: CType) -> bool {
        matches!(
            (ctype, self),
            (CType::Char, Slot::VarI8(_))
                | (CType::Short, Slot::VarI16(_))
                | (CType::Int, Slot::VarI32(_))
                | (CType::Long | CType::LongLong, Slot::VarI64(_))
                | (CType::UnsignedChar | CType::Byte, Slot::VarU8(_))
                | (CType::UnsignedShort, Slot::VarU16(_))
                | (CType::Unsigned, Slot::VarU32(_))
                | (CType::UnsignedLong | CType::UnsignedLongLong, Slot::VarU64(_))
                | (CType::Float, Slot::VarF32(_))
                | (CType::Double | CType::LongDouble, Slot::VarF64(_))
        )
    }

    pub(crate) fn as_datatype(&self) -> Option<Datatype> {
        match self {
            Slot::Datatype(dt) => Some(*dt),
            _ => None,
        }
    }

    pub(crate) fn as_op(&self) -> Option<ReduceOp> {
        match self {
            Slot::Op(op) => Some(op.clone()),
            _ => None,
        }
    }

    pub(crate) fn raw_len(&self) -> Option<usize> {
        match self {
            Slot::U8s(bytes) => Some(bytes.len()),
            _ => None,
        }
    }

    /// Stores a received payload into the target. The slot's shape was
    /// validated when the format was parsed, so a mismatch here is an
    /// internal error.
    pub(crate) fn store(&mut self, payload: &Payload) -> Result<()> {
        let count = payload.count();
        let bytes = payload.bytes();
        macro_rules! scalar {
            ($target:expr, $decode:expr) => {{
                if count != 1 {
                    return Err(PilotError::SystemError("scalar target got an array"));
                }
                **$target = $decode(bytes);
                Ok(())
            }};
        }
        macro_rules! slice {
            ($target:expr, $decode:path) => {{
                if count != $target.len() {
                    return Err(PilotError::SystemError("received count does not fit target"));
                }
                $decode(bytes, &mut $target[..]);
                Ok(())
            }};
        }
        macro_rules! var {
            ($target:expr, $decode:path) => {{
                $target.clear();
                $target.resize(count, Default::default());
                $decode(bytes, $target.as_mut_slice());
                Ok(())
            }};
        }
        match self {
            Slot::I8(target) => scalar!(target, |b: &[u8]| b[0] as i8),
            Slot::I16(target) => scalar!(target, LittleEndian::read_i16),
            Slot::I32(target) => scalar!(target, LittleEndian::read_i32),
            Slot::I64(target) => scalar!(target, LittleEndian::read_i64),
            Slot::U8(target) => scalar!(target, |b: &[u8]| b[0]),
            Slot::U16(target) => scalar!(target, LittleEndian::read_u16),
            Slot::U32(target) => scalar!(target, LittleEndian::read_u32),
            Slot::U64(target) => scalar!(target, LittleEndian::read_u64),
            Slot::F32(target) => scalar!(target, LittleEndian::read_f32),
            Slot::F64(target) => scalar!(target, LittleEndian::read_f64),
            Slot::I8s(target) => slice!(target, decode_i8s),
            Slot::I16s(target) => slice!(target, LittleEndian::read_i16_into),
            Slot::I32s(target) => slice!(target, LittleEndian::read_i32_into),
            Slot::I64s(target) => slice!(target, LittleEndian::read_i64_into),
            Slot::U8s(target) => {
                if bytes.len() != target.len() {
                    return Err(PilotError::SystemError("received count does not fit target"));
                }
                target.copy_from_slice(bytes);
                Ok(())
            }
            Slot::U16s(target) => slice!(target, LittleEndian::read_u16_into),
            Slot::U32s(target) => slice!(target, LittleEndian::read_u32_into),
            Slot::U64s(target) => slice!(target, LittleEndian::read_u64_into),
            Slot::F32s(target) => slice!(target, LittleEndian::read_f32_into),
            Slot::F64s(target) => slice!(target, LittleEndian::read_f64_into),
            Slot::VarI8(target) => var!(target, decode_i8s),
            Slot::VarI16(target) => var!(target, LittleEndian::read_i16_into),
            Slot::VarI32(target) => var!(target, LittleEndian::read_i32_into),
            Slot::VarI64(target) => var!(target, LittleEndian::read_i64_into),
            Slot::VarU8(target) => {
                target.clear();
                target.extend_from_slice(bytes);
                Ok(())
            }
            Slot::VarU16(target) => var!(target, LittleEndian::read_u16_into),
            Slot::VarU32(target) => var!(target, LittleEndian::read_u32_into),
            Slot::VarU64(target) => var!(target, LittleEndian::read_u64_into),
            Slot::VarF32(target) => var!(target, LittleEndian::read_f32_into),
            Slot::VarF64(target) => var!(target, LittleEndian::read_f64_into),
            Slot::Str(target) => {
                // The wire form is a NUL-terminated char array.
                let text = bytes.strip_suffix(&[0]).unwrap_or(bytes);
                **target = String::from_utf8_lossy(text).into_owned();
                Ok(())
            }
            Slot::Datatype(_) | Slot::Op(_) => {
                Err(PilotError::SystemError("input-only slot used as a target"))
            }
        }
    }
}

/// Renders the first element of a payload for call-log records.
pub(crate) fn render_first(ctype: CType, payload: &Payload) -> String {
    let bytes = payload.bytes();
    if bytes.len() < ctype.datatype().size() {
        return "?".to_string();
    }
    match ctype {
        CType::Char => format!("{}", bytes[0] as char),
        CType::Short => format!("{}", LittleEndian::read_i16(bytes)),
        CType::Int => format!("{}", LittleEndian::read_i32(bytes)),
        CType::Long | CType::LongLong => format!("{}", LittleEndian::read_i64(bytes)),
        CType::UnsignedChar => format!("{}", bytes[0]),
        CType::Byte => format!("{:#04x}", bytes[0]),
        CType::UnsignedShort => format!("{}", LittleEndian::read_u16(bytes)),
        CType::Unsigned => format!("{}", LittleEndian::read_u32(bytes)),
        CType::UnsignedLong | CType::UnsignedLongLong => {
            format!("{}", LittleEndian::read_u64(bytes))
        }
        CType::Float => format!("{}", LittleEndian::read_f32(bytes)),
        CType::Double | CType::LongDouble => format!("{}", LittleEndian::read_f64(bytes)),
        CType::UserDefined => "?".to_string(),
    }
}

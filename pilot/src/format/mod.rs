//! The format-string marshaller.
//!
//! A format string such as `"%d %12lf %^c"` is compiled, together with the
//! caller's value or slot vector, into a list of [`Descriptor`]s, one per
//! substrate message. Most terms produce one descriptor; the variable-length
//! forms (`^` flag, `%s` type) produce two, a single-int length preamble
//! followed by the data element.
//!
//! Grammar, following the original call syntax:
//!
//! ```text
//! format = ( ws | term )*
//! term   = "%" [ op "/" ] [ count ] type
//! count  = digits | "*" | "^"
//! op     = "min"|"max"|"+"|"*"|"&&"|"||"|"^^"|"&"|"|"|"^"|"mop"
//! type   = "b"|"c"|"s"|"d"|"i"|"u"|"f"|"hd"|"hi"|"hu"|"hhu"
//!        | "ld"|"li"|"lu"|"lld"|"lli"|"llu"|"lf"|"Lf"|"m"
//! ```

pub mod signature;
pub mod value;

use pilot_communication::{Datatype, Payload, ReduceOp};
use smallvec::SmallVec;

use crate::errors::{PilotError, Result};
use crate::limits::MAX_FORMATLEN;

use self::value::{CType, Slot, Value};

/// Where a descriptor's data lives.
#[derive(Clone, Debug)]
pub(crate) enum DescData {
    /// Write side: the encoded bytes, ready to ship.
    Out(Payload),
    /// Read side: index of the caller's slot to store into.
    In { slot: usize },
    /// Read side of a `%s` length preamble: the length stays internal.
    InInternal,
}

/// One substrate message compiled from a format term.
#[derive(Clone, Debug)]
pub(crate) struct Descriptor {
    pub ctype: CType,
    pub datatype: Datatype,
    pub count: usize,
    /// Marks the auxiliary length message preceding variable-length data.
    pub send_count: bool,
    pub op: Option<ReduceOp>,
    pub data: DescData,
}

pub(crate) type Descriptors = SmallVec<[Descriptor; 8]>;

enum OpToken {
    Builtin(ReduceOp),
    /// `mop/`: the operator comes from the argument list.
    User,
}

fn lookup_op(token: &[u8]) -> Option<OpToken> {
    match token {
        b"min" => Some(OpToken::Builtin(ReduceOp::Min)),
        b"max" => Some(OpToken::Builtin(ReduceOp::Max)),
        b"+" => Some(OpToken::Builtin(ReduceOp::Sum)),
        b"*" => Some(OpToken::Builtin(ReduceOp::Prod)),
        b"&&" => Some(OpToken::Builtin(ReduceOp::LogAnd)),
        b"||" => Some(OpToken::Builtin(ReduceOp::LogOr)),
        b"^^" => Some(OpToken::Builtin(ReduceOp::LogXor)),
        b"&" => Some(OpToken::Builtin(ReduceOp::BitAnd)),
        b"|" => Some(OpToken::Builtin(ReduceOp::BitOr)),
        b"^" => Some(OpToken::Builtin(ReduceOp::BitXor)),
        b"mop" => Some(OpToken::User),
        _ => None,
    }
}

/// Longest-match lookup of a conversion specifier. Returns the C type and
/// the number of bytes consumed.
fn lookup_type(bytes: &[u8]) -> Option<(CType, usize)> {
    match bytes {
        [b'b', ..] => Some((CType::Byte, 1)),
        [b'c', ..] | [b's', ..] => Some((CType::Char, 1)),
        [b'h', b'h', b'u', ..] => Some((CType::UnsignedChar, 3)),
        [b'h', b'd' | b'i', ..] => Some((CType::Short, 2)),
        [b'h', b'u', ..] => Some((CType::UnsignedShort, 2)),
        [b'd' | b'i', ..] => Some((CType::Int, 1)),
        [b'l', b'l', b'd' | b'i', ..] => Some((CType::LongLong, 3)),
        [b'l', b'l', b'u', ..] => Some((CType::UnsignedLongLong, 3)),
        [b'l', b'd' | b'i', ..] => Some((CType::Long, 2)),
        [b'l', b'u', ..] => Some((CType::UnsignedLong, 2)),
        [b'l', b'f', ..] => Some((CType::Double, 2)),
        [b'L', b'f', ..] => Some((CType::LongDouble, 2)),
        [b'u', ..] => Some((CType::Unsigned, 1)),
        [b'f', ..] => Some((CType::Float, 1)),
        [b'm', ..] => Some((CType::UserDefined, 1)),
        _ => None,
    }
}

enum Binding<'v, 'a> {
    Values(&'v [Value<'a>]),
    Locations(&'v [Slot<'a>]),
}

impl Binding<'_, '_> {
    fn len(&self) -> usize {
        match self {
            Binding::Values(args) => args.len(),
            Binding::Locations(slots) => slots.len(),
        }
    }
}

/// Compiles a write-side format against its value vector. `chunk` is 1 for
/// point-to-point and broadcast use; scatter senders pass the bundle size,
/// and every term must then supply `count * chunk` elements.
pub(crate) fn parse_values(
    fmt: &str,
    args: &[Value<'_>],
    check_level: u8,
    chunk: usize,
) -> Result<Descriptors> {
    parse(fmt, Binding::Values(args), check_level, chunk)
}

/// Compiles a read-side format against its slot vector. `chunk` is 1 for
/// point-to-point and broadcast use; gather receivers pass the bundle size.
pub(crate) fn parse_locations(
    fmt: &str,
    slots: &[Slot<'_>],
    check_level: u8,
    chunk: usize,
) -> Result<Descriptors> {
    parse(fmt, Binding::Locations(slots), check_level, chunk)
}

fn parse(fmt: &str, binding: Binding<'_, '_>, check_level: u8, chunk: usize) -> Result<Descriptors> {
    let bytes = fmt.as_bytes();
    let total_args = binding.len();
    let mut next_arg = 0usize;
    let mut descs = Descriptors::new();
    let mut pos = 0usize;

    // Consumes the next argument index, counting down against the vector
    // exactly as the original counted down its injected argument count.
    let take = |next_arg: &mut usize| -> Result<usize> {
        if *next_arg >= total_args {
            return Err(PilotError::FormatArgs);
        }
        let index = *next_arg;
        *next_arg += 1;
        Ok(index)
    };

    loop {
        while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
            pos += 1;
        }
        if pos == bytes.len() {
            break;
        }
        if descs.len() >= MAX_FORMATLEN {
            return Err(PilotError::FormatArgs);
        }
        if bytes[pos] != b'%' {
            return Err(PilotError::FormatInvalid { at: pos });
        }
        pos += 1;
        if pos == bytes.len() {
            return Err(PilotError::FormatInvalid { at: pos });
        }

        // Optional reduce operator: 1-3 characters closed by a slash.
        let mut op: Option<ReduceOp> = None;
        if let Some(off) = bytes[pos..].iter().take(4).position(|&b| b == b'/') {
            if off == 0 {
                return Err(PilotError::FormatInvalid { at: pos });
            }
            let token = lookup_op(&bytes[pos..pos + off])
                .ok_or(PilotError::FormatInvalid { at: pos })?;
            op = Some(match token {
                OpToken::Builtin(builtin) => builtin,
                OpToken::User => {
                    let index = take(&mut next_arg)?;
                    match &binding {
                        Binding::Values(args) => {
                            args[index].as_op().ok_or(PilotError::FormatArgs)?
                        }
                        Binding::Locations(slots) => {
                            slots[index].as_op().ok_or(PilotError::FormatArgs)?
                        }
                    }
                }
            });
            pos += off + 1;
            if pos == bytes.len() {
                return Err(PilotError::FormatInvalid { at: pos });
            }
        }

        // Optional array length, as digits or '*'.
        let mut declared: Option<usize> = None;
        if bytes[pos].is_ascii_digit() {
            let mut n = 0usize;
            while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                n = n * 10 + usize::from(bytes[pos] - b'0');
                pos += 1;
            }
            if pos == bytes.len() {
                return Err(PilotError::FormatInvalid { at: pos });
            }
            // %0 is meaningless and %1 (one) looks too much like %l (ell).
            if n <= 1 {
                return Err(PilotError::ArrayLength(n));
            }
            declared = Some(n);
        }
        let mut star = false;
        if bytes[pos] == b'*' {
            if let Some(n) = declared {
                return Err(PilotError::ArrayLength(n));
            }
            star = true;
            pos += 1;
            if pos == bytes.len() {
                return Err(PilotError::FormatInvalid { at: pos });
            }
        }

        // Variable-length mode: the '^' flag or the '%s' type. Both produce
        // a length preamble plus a data element.
        if bytes[pos] == b'^' || bytes[pos] == b's' {
            if op.is_some() {
                return Err(PilotError::FormatInvalid { at: pos });
            }
            if star {
                return Err(PilotError::ArrayLength(0));
            }
            if let Some(n) = declared {
                return Err(PilotError::ArrayLength(n));
            }
            let strmode = bytes[pos] == b's';
            if !strmode {
                pos += 1;
                if pos == bytes.len() {
                    return Err(PilotError::FormatInvalid { at: pos });
                }
            }
            let (ctype, skip) =
                lookup_type(&bytes[pos..]).ok_or(PilotError::FormatInvalid { at: pos })?;
            if ctype == CType::UserDefined {
                return Err(PilotError::FormatInvalid { at: pos });
            }

            let (preamble_data, data_elem): (DescData, Descriptor) = match &binding {
                Binding::Values(args) => {
                    let index = take(&mut next_arg)?;
                    let (length, payload) = if strmode {
                        let text = args[index].as_str().ok_or(PilotError::FormatArgs)?;
                        let mut raw = text.as_bytes().to_vec();
                        raw.push(0); // wire form is NUL-terminated
                        (raw.len(), Payload::new(Datatype::Int8, raw))
                    } else {
                        let length = args[index]
                            .array_len(ctype)
                            .ok_or(PilotError::FormatArgs)?;
                        if length == 0 {
                            return Err(PilotError::ArrayLength(0));
                        }
                        let payload = args[index]
                            .encode_array(ctype)
                            .ok_or(PilotError::FormatArgs)?;
                        (length, payload)
                    };
                    (
                        DescData::Out(Payload::from_i32(length as i32)),
                        Descriptor {
                            ctype,
                            datatype: ctype.datatype(),
                            count: length,
                            send_count: false,
                            op: None,
                            data: DescData::Out(payload),
                        },
                    )
                }
                Binding::Locations(slots) => {
                    if strmode {
                        let index = take(&mut next_arg)?;
                        if !matches!(slots[index], Slot::Str(_)) {
                            return Err(PilotError::FormatArgs);
                        }
                        (
                            DescData::InInternal,
                            Descriptor {
                                ctype,
                                datatype: ctype.datatype(),
                                count: 0, // filled by the received preamble
                                send_count: false,
                                op: None,
                                data: DescData::In { slot: index },
                            },
                        )
                    } else {
                        let length_index = take(&mut next_arg)?;
                        if !slots[length_index].matches_scalar(CType::Int) {
                            return Err(PilotError::FormatArgs);
                        }
                        let data_index = take(&mut next_arg)?;
                        if !slots[data_index].matches_var(ctype) {
                            return Err(PilotError::FormatArgs);
                        }
                        (
                            DescData::In { slot: length_index },
                            Descriptor {
                                ctype,
                                datatype: ctype.datatype(),
                                count: 0,
                                send_count: false,
                                op: None,
                                data: DescData::In { slot: data_index },
                            },
                        )
                    }
                }
            };

            descs.push(Descriptor {
                ctype: CType::Int,
                datatype: Datatype::Int32,
                count: 1,
                send_count: true,
                op: None,
                data: preamble_data,
            });
            if descs.len() >= MAX_FORMATLEN {
                return Err(PilotError::FormatInvalid { at: pos });
            }
            descs.push(data_elem);
            pos += skip;
            continue;
        }

        // Ordinary term.
        let (ctype, skip) =
            lookup_type(&bytes[pos..]).ok_or(PilotError::FormatInvalid { at: pos })?;
        pos += skip;

        // User-defined elements take their datatype from the argument list.
        let datatype = if ctype == CType::UserDefined {
            let index = take(&mut next_arg)?;
            let datatype = match &binding {
                Binding::Values(args) => args[index].as_datatype(),
                Binding::Locations(slots) => slots[index].as_datatype(),
            }
            .ok_or(PilotError::FormatArgs)?;
            if datatype.size() == 0 {
                return Err(PilotError::BogusPointerArg);
            }
            datatype
        } else {
            ctype.datatype()
        };

        let desc = match &binding {
            Binding::Values(args) => {
                let index = take(&mut next_arg)?;
                let arg = &args[index];
                if ctype == CType::UserDefined {
                    let raw = arg.as_raw().ok_or(PilotError::FormatArgs)?;
                    let count = user_count(
                        raw.len(),
                        datatype.size(),
                        declared,
                        star,
                        chunk,
                        check_level,
                    )?;
                    Descriptor {
                        ctype,
                        datatype,
                        count,
                        send_count: false,
                        op,
                        data: DescData::Out(Payload::new(datatype, raw.to_vec())),
                    }
                } else if let Some(n) = declared {
                    let length = arg.array_len(ctype).ok_or(PilotError::FormatArgs)?;
                    if length != n * chunk {
                        return Err(PilotError::ArrayLength(length));
                    }
                    let payload = arg.encode_array(ctype).ok_or(PilotError::FormatArgs)?;
                    Descriptor {
                        ctype,
                        datatype,
                        count: n,
                        send_count: false,
                        op,
                        data: DescData::Out(payload),
                    }
                } else if star {
                    let length = arg.array_len(ctype).ok_or(PilotError::FormatArgs)?;
                    let n = chunked_count(length, chunk)?;
                    let payload = arg.encode_array(ctype).ok_or(PilotError::FormatArgs)?;
                    Descriptor {
                        ctype,
                        datatype,
                        count: n,
                        send_count: false,
                        op,
                        data: DescData::Out(payload),
                    }
                } else if chunk > 1 {
                    // Scalar terms on a chunked sender still draw from an
                    // array holding one element per rim member.
                    let length = arg.array_len(ctype).ok_or(PilotError::FormatArgs)?;
                    if length != chunk {
                        return Err(PilotError::ArrayLength(length));
                    }
                    let payload = arg.encode_array(ctype).ok_or(PilotError::FormatArgs)?;
                    Descriptor {
                        ctype,
                        datatype,
                        count: 1,
                        send_count: false,
                        op,
                        data: DescData::Out(payload),
                    }
                } else {
                    let payload = arg.encode_scalar(ctype).ok_or(PilotError::FormatArgs)?;
                    Descriptor {
                        ctype,
                        datatype,
                        count: 1,
                        send_count: false,
                        op,
                        data: DescData::Out(payload),
                    }
                }
            }
            Binding::Locations(slots) => {
                let index = take(&mut next_arg)?;
                let slot = &slots[index];
                let count = if ctype == CType::UserDefined {
                    let raw_len = slot.raw_len().ok_or(PilotError::FormatArgs)?;
                    user_count(raw_len, datatype.size(), declared, star, chunk, check_level)?
                } else if let Some(n) = declared {
                    let length = slot.slice_len(ctype).ok_or(PilotError::FormatArgs)?;
                    if length != n * chunk {
                        return Err(PilotError::ArrayLength(length));
                    }
                    n
                } else if star {
                    let length = slot.slice_len(ctype).ok_or(PilotError::FormatArgs)?;
                    chunked_count(length, chunk)?
                } else if chunk > 1 {
                    let length = slot.slice_len(ctype).ok_or(PilotError::FormatArgs)?;
                    if length != chunk {
                        return Err(PilotError::ArrayLength(length));
                    }
                    1
                } else {
                    if !slot.matches_scalar(ctype) {
                        return Err(PilotError::FormatArgs);
                    }
                    1
                };
                Descriptor {
                    ctype,
                    datatype,
                    count,
                    send_count: false,
                    op,
                    data: DescData::In { slot: index },
                }
            }
        };
        descs.push(desc);
    }

    // Nothing but whitespace is not a format.
    if descs.is_empty() {
        return Err(PilotError::FormatInvalid { at: 0 });
    }
    // Leftover arguments are as wrong as missing ones.
    if next_arg != total_args {
        return Err(PilotError::FormatArgs);
    }
    Ok(descs)
}

/// Element count for a `*`-length term holding `length` elements split over
/// `chunk` rim members.
fn chunked_count(length: usize, chunk: usize) -> Result<usize> {
    if chunk == 0 || length % chunk != 0 {
        return Err(PilotError::ArrayLength(length));
    }
    let n = length / chunk;
    if n <= 1 {
        return Err(PilotError::ArrayLength(n));
    }
    Ok(n)
}

/// Element count of a raw `%m` buffer. The buffer's byte length must agree
/// with the declared count and element size; at check level 3 a disagreement
/// is reported as a bogus buffer, below that as a length problem.
fn user_count(
    raw_len: usize,
    elem_size: usize,
    declared: Option<usize>,
    star: bool,
    chunk: usize,
    check_level: u8,
) -> Result<usize> {
    let misshapen = |length: usize| {
        if check_level >= 3 {
            PilotError::BogusPointerArg
        } else {
            PilotError::ArrayLength(length)
        }
    };
    if raw_len % elem_size != 0 {
        return Err(misshapen(raw_len));
    }
    let elements = raw_len / elem_size;
    if star {
        return chunked_count(elements, chunk);
    }
    let count = declared.unwrap_or(1);
    if elements != count * chunk {
        return Err(misshapen(elements));
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pilot_communication::{Datatype, ReduceOp};

    use crate::errors::PilotError;
    use crate::format::value::{Slot, Value};

    fn vals(fmt: &str, args: &[Value<'_>]) -> Result<Descriptors> {
        parse_values(fmt, args, 1, 1)
    }

    #[test]
    fn rejects_whitespace_only_formats() {
        for fmt in ["", "  \t   ", "\n\r \u{b}\t"] {
            assert!(matches!(
                vals(fmt, &[]),
                Err(PilotError::FormatInvalid { .. })
            ));
        }
    }

    #[test]
    fn rejects_partial_conversion_spec() {
        assert!(matches!(
            vals(" %", &[Value::I32(1)]),
            Err(PilotError::FormatInvalid { .. })
        ));
    }

    #[test]
    fn rejects_lol_byob() {
        // An ancestor of this parser read "%lol%%byob" as if it were "%lf%b".
        assert!(matches!(
            vals("%lol%%byob", &[Value::F32(2.0), Value::U8(b'b')]),
            Err(PilotError::FormatInvalid { .. })
        ));
    }

    #[test]
    fn rejects_invalid_array_sizes() {
        let two = [0i32, 1];
        // Hardcoded lengths 0 and 1 are not valid.
        assert!(matches!(
            vals("%1d", &[Value::I32s(&two[..1])]),
            Err(PilotError::ArrayLength(1))
        ));
        assert!(matches!(
            vals("%0d", &[Value::I32s(&two[..0])]),
            Err(PilotError::ArrayLength(0))
        ));
        // Nor are they reachable through the '*' form.
        assert!(matches!(
            vals("%*d", &[Value::I32s(&two[..0])]),
            Err(PilotError::ArrayLength(0))
        ));
        assert!(matches!(
            vals("%*d", &[Value::I32s(&two[..1])]),
            Err(PilotError::ArrayLength(1))
        ));
        // Only one length may be specified.
        assert!(matches!(
            vals("%3*d", &[Value::I32s(&two)]),
            Err(PilotError::ArrayLength(3))
        ));
        // A negative sign is not a length.
        assert!(matches!(
            vals("%-1d", &[Value::I32s(&two)]),
            Err(PilotError::FormatInvalid { .. })
        ));
    }

    #[test]
    fn accepts_every_format_code() {
        let descs = vals(
            "%b %c %hi %hd %d %i %ld %li %lld %lli %hhu %hu",
            &[
                Value::U8(1),
                Value::I8(2),
                Value::I16(3),
                Value::I16(4),
                Value::I32(5),
                Value::I32(6),
                Value::I64(7),
                Value::I64(8),
                Value::I64(9),
                Value::I64(10),
                Value::U8(11),
                Value::U16(12),
            ],
        )
        .unwrap();
        assert_eq!(descs.len(), 12);
        assert!(descs.iter().all(|d| d.count == 1 && !d.send_count));

        let raw = 4.25f32.to_le_bytes();
        let descs = vals(
            "%lu %llu %f %lf %Lf %m",
            &[
                Value::U64(13),
                Value::U64(14),
                Value::F32(1.5),
                Value::F64(2.5),
                Value::F64(3.5),
                Value::Datatype(Datatype::User(4)),
                Value::U8s(&raw),
            ],
        )
        .unwrap();
        assert_eq!(descs.len(), 6);
        assert_eq!(descs[5].datatype, Datatype::User(4));
    }

    #[test]
    fn rejects_overlong_formats() {
        let fmt = "%d".repeat(55);
        let args = vec![Value::I32(0); 55];
        assert!(matches!(vals(&fmt, &args), Err(PilotError::FormatArgs)));
    }

    #[test]
    fn detects_wrong_argument_counts() {
        // Too few arguments for the format.
        assert!(matches!(
            vals("%d%d%d", &[Value::I32(1), Value::I32(2)]),
            Err(PilotError::FormatArgs)
        ));
        // Too many.
        assert!(matches!(
            vals("%d", &[Value::I32(1), Value::I32(2)]),
            Err(PilotError::FormatArgs)
        ));
        // A value where the format wants a different type.
        assert!(matches!(
            vals("%d", &[Value::F64(1.0)]),
            Err(PilotError::FormatArgs)
        ));
    }

    #[test]
    fn accepts_every_reduce_operator() {
        let descs = vals(
            "%max/d %min/d %+/f %*/f %&&/d %||/d %^^/d %&/d %|/d %^/d %mop/d",
            &[
                Value::I32(1),
                Value::I32(2),
                Value::F32(3.1),
                Value::F32(3.2),
                Value::I32(1),
                Value::I32(0),
                Value::I32(1),
                Value::I32(888),
                Value::I32(777),
                Value::I32(666),
                Value::Op(ReduceOp::Sum),
                Value::I32(999),
            ],
        )
        .unwrap();
        assert_eq!(descs.len(), 11);
        assert!(descs.iter().all(|d| d.op.is_some()));
    }

    #[test]
    fn rejects_operator_on_variable_length() {
        let data = [1i32, 2, 3];
        assert!(matches!(
            vals("%+/^d", &[Value::I32s(&data)]),
            Err(PilotError::FormatInvalid { .. })
        ));
    }

    #[test]
    fn string_term_produces_length_preamble() {
        let descs = vals("%s", &[Value::Str("abc")]).unwrap();
        assert_eq!(descs.len(), 2);
        assert!(descs[0].send_count);
        assert_eq!(descs[0].count, 1);
        // Three characters plus the terminator.
        assert_eq!(descs[1].count, 4);
        assert_eq!(descs[1].datatype, Datatype::Int8);
    }

    #[test]
    fn variable_read_takes_length_and_buffer_slots() {
        let mut length = 0i32;
        let mut sink = Vec::new();
        let descs = parse_locations(
            "%^d",
            &[Slot::I32(&mut length), Slot::VarI32(&mut sink)],
            1,
            1,
        )
        .unwrap();
        assert_eq!(descs.len(), 2);
        assert!(descs[0].send_count);
        assert!(matches!(descs[1].data, DescData::In { slot: 1 }));
    }

    #[test]
    fn read_slot_types_must_match() {
        let mut wrong = 0.0f64;
        assert!(matches!(
            parse_locations("%d", &[Slot::F64(&mut wrong)], 1, 1),
            Err(PilotError::FormatArgs)
        ));
    }

    #[test]
    fn fixed_length_must_match_the_slice() {
        let three = [1i32, 2, 3];
        assert!(matches!(
            vals("%4d", &[Value::I32s(&three)]),
            Err(PilotError::ArrayLength(3))
        ));
    }

    #[test]
    fn misshapen_user_buffers_caught_at_level_three() {
        let raw = [0u8; 6]; // not a multiple of the 4-byte element
        let args = [Value::Datatype(Datatype::User(4)), Value::U8s(&raw)];
        assert!(matches!(
            parse_values("%m", &args, 3, 1),
            Err(PilotError::BogusPointerArg)
        ));
        assert!(matches!(
            parse_values("%m", &args, 1, 1),
            Err(PilotError::ArrayLength(6))
        ));

        // Same on the read side.
        let mut raw = [0u8; 6];
        let slots = [Slot::Datatype(Datatype::User(4)), Slot::U8s(&mut raw)];
        assert!(matches!(
            parse_locations("%m", &slots, 3, 1),
            Err(PilotError::BogusPointerArg)
        ));
    }
}

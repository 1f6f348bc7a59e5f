//! Format signatures.
//!
//! A signature compacts a parsed descriptor list into a single 32-bit
//! quantity, cheap to exchange and compare before payload transfer. It is a
//! compaction, not a hash: aliasing across substantially different formats
//! is tolerated, because the point is to catch the common mistakes: a
//! reader and writer disagreeing on types, lengths, or operators.
//!
//! Matching rules:
//! 1. scalar terms match on datatype;
//! 2. array terms match on datatype and length;
//! 3. reductions additionally match on the operator;
//! 4. variable-length terms match on datatype only; their length preamble
//!    is skipped, so the concrete length never enters the signature.

use pilot_communication::ReduceOp;

use super::Descriptor;

/// Position of the sum operator in the built-in table; the reference point
/// for operator codes.
const OP_BASE: u32 = 2;

/// Code recorded for caller-defined operators, whose identity cannot be
/// compared across ranks. The endpoints are presumed to agree on which
/// operator they mean.
const USER_OP_CODE: u32 = 999;

fn op_code(op: &ReduceOp) -> u32 {
    match op.table_index() {
        Some(index) => index.abs_diff(OP_BASE),
        None => USER_OP_CODE,
    }
}

/// Reduces a descriptor list to its 32-bit signature.
pub(crate) fn format_signature(descs: &[Descriptor]) -> u32 {
    let mut sig: u32 = 0;
    let mut index = 0;
    while index < descs.len() {
        let mut length: u32 = 0;
        let mut varflag: u32 = 0;
        let mut redopflag: u32 = 0;

        if descs[index].send_count {
            // Only the data element's type matters for variable-length terms.
            varflag = 1;
            index += 1;
            if index == descs.len() {
                break; // a preamble is always followed by its data element
            }
        } else {
            length = descs[index].count as u32;
            if let Some(op) = &descs[index].op {
                redopflag = 1;
                length = length.wrapping_add(op_code(op));
            }
        }

        // 25 bits of length + operator code, one flag each for variable
        // length and reduction, 5 bits of datatype.
        let word = (length & 0x01ff_ffff) << 7
            | varflag << 6
            | redopflag << 5
            | (descs[index].ctype.code() & 0x1f);
        sig = (sig << 3) ^ word;
        index += 1;
    }
    sig
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::value::{Slot, Value};
    use crate::format::{parse_locations, parse_values};

    fn write_sig(fmt: &str, args: &[Value<'_>]) -> u32 {
        format_signature(&parse_values(fmt, args, 1, 1).unwrap())
    }

    fn read_sig(fmt: &str, slots: &[Slot<'_>]) -> u32 {
        format_signature(&parse_locations(fmt, slots, 1, 1).unwrap())
    }

    #[test]
    fn writer_and_reader_of_same_format_agree() {
        let data = [1i32, 2, 3, 4];
        let mut sink = [0i32; 4];
        let mut scalar = 0.0f64;
        let write = write_sig("%4d %lf", &[Value::I32s(&data), Value::F64(1.5)]);
        let read = read_sig(
            "%4d %lf",
            &[Slot::I32s(&mut sink), Slot::F64(&mut scalar)],
        );
        assert_eq!(write, read);
    }

    #[test]
    fn length_participates_for_fixed_arrays() {
        let four = [0i32; 4];
        let five = [0i32; 5];
        assert_ne!(
            write_sig("%4d", &[Value::I32s(&four)]),
            write_sig("%5d", &[Value::I32s(&five)])
        );
    }

    #[test]
    fn datatype_participates() {
        assert_ne!(
            write_sig("%d", &[Value::I32(1)]),
            write_sig("%u", &[Value::U32(1)])
        );
    }

    #[test]
    fn variable_length_ignores_the_concrete_length() {
        let three = [1i32, 2, 3];
        let seven = [0i32; 7];
        assert_eq!(
            write_sig("%^d", &[Value::I32s(&three)]),
            write_sig("%^d", &[Value::I32s(&seven)])
        );
        let mut length = 0i32;
        let mut sink = Vec::new();
        assert_eq!(
            write_sig("%^d", &[Value::I32s(&three)]),
            read_sig("%^d", &[Slot::I32(&mut length), Slot::VarI32(&mut sink)])
        );
    }

    #[test]
    fn string_and_var_char_share_a_signature() {
        // "%s" is "%^c" on the wire except for where the length lands.
        let mut length = 0i32;
        let mut sink = Vec::new();
        assert_eq!(
            write_sig("%s", &[Value::Str("hi")]),
            read_sig("%^c", &[Slot::I32(&mut length), Slot::VarI8(&mut sink)])
        );
    }

    #[test]
    fn operator_participates() {
        assert_ne!(
            write_sig("%+/d", &[Value::I32(1)]),
            write_sig("%max/d", &[Value::I32(1)])
        );
    }

    #[test]
    fn term_order_participates() {
        assert_ne!(
            write_sig("%d %lf", &[Value::I32(1), Value::F64(2.0)]),
            write_sig("%lf %d", &[Value::F64(2.0), Value::I32(1)])
        );
    }
}

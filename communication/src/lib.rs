//! Communication substrate for the Pilot coordination library.
//!
//! Pilot itself is substrate-agnostic: the coordination layer addresses its
//! peers through the [`Transport`] trait and never looks behind it. This crate
//! defines that seam (ranked point-to-point messaging with tags, probes,
//! a barrier, and the collective forms) plus an in-process implementation
//! that runs one rank per OS thread, which is what the test suites and
//! single-machine deployments use.
//!
//! Payloads are flat little-endian encodings of typed elements; the
//! coordination layer above owns the mapping between application values and
//! payload bytes.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub mod initialize;
pub mod thread;

pub use crate::initialize::{initialize, Config, WorkerGuards};
pub use crate::thread::ThreadTransport;

/// Identity of a participant in the communication world.
pub type Rank = usize;

/// Message tag, used to match point-to-point sends with receives.
pub type Tag = u32;

/// Element type of a message payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Datatype {
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float32,
    Float64,
    /// An opaque caller-defined element of the given size in bytes.
    User(u16),
}

impl Datatype {
    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            Datatype::Int8 | Datatype::Uint8 => 1,
            Datatype::Int16 | Datatype::Uint16 => 2,
            Datatype::Int32 | Datatype::Uint32 | Datatype::Float32 => 4,
            Datatype::Int64 | Datatype::Uint64 | Datatype::Float64 => 8,
            Datatype::User(size) => size as usize,
        }
    }

    fn is_integer(self) -> bool {
        !matches!(
            self,
            Datatype::Float32 | Datatype::Float64 | Datatype::User(_)
        )
    }
}

/// A typed message body: a flat little-endian encoding of whole elements.
#[derive(Clone, Debug, PartialEq)]
pub struct Payload {
    datatype: Datatype,
    bytes: Vec<u8>,
}

impl Payload {
    /// Wraps an encoded byte vector. `bytes.len()` must be a multiple of the
    /// element size.
    pub fn new(datatype: Datatype, bytes: Vec<u8>) -> Payload {
        debug_assert!(datatype.size() == 0 || bytes.len() % datatype.size() == 0);
        Payload { datatype, bytes }
    }

    /// An all-zero payload of `count` elements.
    pub fn zeroed(datatype: Datatype, count: usize) -> Payload {
        Payload {
            datatype,
            bytes: vec![0; count * datatype.size()],
        }
    }

    /// An empty payload, used for control hand-shakes.
    pub fn empty() -> Payload {
        Payload {
            datatype: Datatype::Uint8,
            bytes: Vec::new(),
        }
    }

    /// A single little-endian `i32`, the shape of length and signature
    /// messages.
    pub fn from_i32(value: i32) -> Payload {
        Payload {
            datatype: Datatype::Int32,
            bytes: value.to_le_bytes().to_vec(),
        }
    }

    /// Decodes a single-`i32` payload, or `None` if the shape is wrong.
    pub fn as_i32(&self) -> Option<i32> {
        if self.datatype == Datatype::Int32 && self.bytes.len() == 4 {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&self.bytes);
            Some(i32::from_le_bytes(raw))
        } else {
            None
        }
    }

    pub fn datatype(&self) -> Datatype {
        self.datatype
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn bytes_mut(&mut self) -> &mut Vec<u8> {
        &mut self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Number of whole elements held.
    pub fn count(&self) -> usize {
        let size = self.datatype.size();
        if size == 0 {
            0
        } else {
            self.bytes.len() / size
        }
    }
}

/// A caller-supplied reduce operator: folds `rhs` into `acc` element-wise.
pub type UserOp = Arc<dyn Fn(&mut Payload, &Payload) + Send + Sync>;

/// Element-wise fold applied by [`Transport::reduce`].
#[derive(Clone)]
pub enum ReduceOp {
    Min,
    Max,
    Sum,
    Prod,
    LogAnd,
    LogOr,
    LogXor,
    BitAnd,
    BitOr,
    BitXor,
    User(UserOp),
}

impl std::fmt::Debug for ReduceOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ReduceOp::Min => "Min",
            ReduceOp::Max => "Max",
            ReduceOp::Sum => "Sum",
            ReduceOp::Prod => "Prod",
            ReduceOp::LogAnd => "LogAnd",
            ReduceOp::LogOr => "LogOr",
            ReduceOp::LogXor => "LogXor",
            ReduceOp::BitAnd => "BitAnd",
            ReduceOp::BitOr => "BitOr",
            ReduceOp::BitXor => "BitXor",
            ReduceOp::User(_) => "User(..)",
        };
        f.write_str(name)
    }
}

impl ReduceOp {
    /// Index of a built-in operator in the static operator table, or `None`
    /// for caller-defined operators. Stable across ranks, so it can be used
    /// in cross-rank fingerprints.
    pub fn table_index(&self) -> Option<u32> {
        match self {
            ReduceOp::Min => Some(0),
            ReduceOp::Max => Some(1),
            ReduceOp::Sum => Some(2),
            ReduceOp::Prod => Some(3),
            ReduceOp::LogAnd => Some(4),
            ReduceOp::LogOr => Some(5),
            ReduceOp::LogXor => Some(6),
            ReduceOp::BitAnd => Some(7),
            ReduceOp::BitOr => Some(8),
            ReduceOp::BitXor => Some(9),
            ReduceOp::User(_) => None,
        }
    }

    /// Folds `rhs` into `acc` element-wise.
    pub fn fold(&self, acc: &mut Payload, rhs: &Payload) -> Result<(), TransportError> {
        if acc.count() != rhs.count() || acc.datatype() != rhs.datatype() {
            return Err(TransportError::CountMismatch {
                got: rhs.count(),
                want: acc.count(),
            });
        }
        if let ReduceOp::User(op) = self {
            op(acc, rhs);
            return Ok(());
        }
        let datatype = acc.datatype();
        let logical_or_bitwise = self.table_index().map_or(false, |index| index >= 4);
        if logical_or_bitwise && !datatype.is_integer() {
            return Err(TransportError::OpType(datatype));
        }
        fold_builtin(self, datatype, &mut acc.bytes, &rhs.bytes)
    }
}

/// Applies a built-in operator over two equally sized byte buffers.
fn fold_builtin(
    op: &ReduceOp,
    datatype: Datatype,
    acc: &mut [u8],
    rhs: &[u8],
) -> Result<(), TransportError> {
    use byteorder::{ByteOrder, LittleEndian};

    macro_rules! int_fold {
        ($t:ty, $width:expr, $read:expr, $write:expr) => {{
            let read = $read;
            let write = $write;
            for (a, b) in acc.chunks_exact_mut($width).zip(rhs.chunks_exact($width)) {
                let (x, y): ($t, $t) = (read(a), read(b));
                let folded: $t = match op {
                    ReduceOp::Min => x.min(y),
                    ReduceOp::Max => x.max(y),
                    ReduceOp::Sum => x.wrapping_add(y),
                    ReduceOp::Prod => x.wrapping_mul(y),
                    ReduceOp::LogAnd => {
                        if x != 0 && y != 0 {
                            1
                        } else {
                            0
                        }
                    }
                    ReduceOp::LogOr => {
                        if x != 0 || y != 0 {
                            1
                        } else {
                            0
                        }
                    }
                    ReduceOp::LogXor => {
                        if (x != 0) != (y != 0) {
                            1
                        } else {
                            0
                        }
                    }
                    ReduceOp::BitAnd => x & y,
                    ReduceOp::BitOr => x | y,
                    ReduceOp::BitXor => x ^ y,
                    ReduceOp::User(_) => unreachable!(),
                };
                write(a, folded);
            }
            Ok(())
        }};
    }

    macro_rules! float_fold {
        ($t:ty, $width:expr, $read:expr, $write:expr) => {{
            let read = $read;
            let write = $write;
            for (a, b) in acc.chunks_exact_mut($width).zip(rhs.chunks_exact($width)) {
                let (x, y): ($t, $t) = (read(a), read(b));
                let folded: $t = match op {
                    ReduceOp::Min => x.min(y),
                    ReduceOp::Max => x.max(y),
                    ReduceOp::Sum => x + y,
                    ReduceOp::Prod => x * y,
                    _ => return Err(TransportError::OpType(datatype)),
                };
                write(a, folded);
            }
            Ok(())
        }};
    }

    match datatype {
        Datatype::Int8 => int_fold!(
            i8,
            1,
            |b: &[u8]| b[0] as i8,
            |a: &mut [u8], v: i8| a[0] = v as u8
        ),
        Datatype::Uint8 => int_fold!(u8, 1, |b: &[u8]| b[0], |a: &mut [u8], v: u8| a[0] = v),
        Datatype::Int16 => int_fold!(
            i16,
            2,
            |b: &[u8]| LittleEndian::read_i16(b),
            |a: &mut [u8], v| LittleEndian::write_i16(a, v)
        ),
        Datatype::Uint16 => int_fold!(
            u16,
            2,
            |b: &[u8]| LittleEndian::read_u16(b),
            |a: &mut [u8], v| LittleEndian::write_u16(a, v)
        ),
        Datatype::Int32 => int_fold!(
            i32,
            4,
            |b: &[u8]| LittleEndian::read_i32(b),
            |a: &mut [u8], v| LittleEndian::write_i32(a, v)
        ),
        Datatype::Uint32 => int_fold!(
            u32,
            4,
            |b: &[u8]| LittleEndian::read_u32(b),
            |a: &mut [u8], v| LittleEndian::write_u32(a, v)
        ),
        Datatype::Int64 => int_fold!(
            i64,
            8,
            |b: &[u8]| LittleEndian::read_i64(b),
            |a: &mut [u8], v| LittleEndian::write_i64(a, v)
        ),
        Datatype::Uint64 => int_fold!(
            u64,
            8,
            |b: &[u8]| LittleEndian::read_u64(b),
            |a: &mut [u8], v| LittleEndian::write_u64(a, v)
        ),
        Datatype::Float32 => float_fold!(
            f32,
            4,
            |b: &[u8]| LittleEndian::read_f32(b),
            |a: &mut [u8], v| LittleEndian::write_f32(a, v)
        ),
        Datatype::Float64 => float_fold!(
            f64,
            8,
            |b: &[u8]| LittleEndian::read_f64(b),
            |a: &mut [u8], v| LittleEndian::write_f64(a, v)
        ),
        Datatype::User(_) => Err(TransportError::OpType(datatype)),
    }
}

/// Outcome of a successful probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    /// Rank the probed message was sent from.
    pub source: Rank,
    /// Tag the probed message carries.
    pub tag: Tag,
}

/// Handle for a communicator created by [`Transport::create_comm`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommId(pub u32);

/// The built-in communicator spanning every rank.
pub const WORLD: CommId = CommId(0);

/// Failures reported by a transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("rank {0} does not exist in this world")]
    UnknownRank(Rank),
    #[error("communicator {0:?} is not usable from this rank")]
    InvalidComm(CommId),
    #[error("world torn down while rank {0} was waiting")]
    Disconnected(Rank),
    #[error("payload holds {got} elements where {want} were expected")]
    CountMismatch { got: usize, want: usize },
    #[error("collective root called without a result buffer")]
    MissingBuffer,
    #[error("reduce operator cannot be applied to {0:?} elements")]
    OpType(Datatype),
}

/// The message-passing substrate underneath a Pilot world.
///
/// One endpoint exists per rank, and each endpoint is driven by a single
/// thread. Point-to-point transfers are FIFO per `(source, destination,
/// tag)`; collectives are ordered per communicator. Every operation other
/// than [`try_probe`](Transport::try_probe) may block.
pub trait Transport {
    /// This endpoint's rank, in `0..world_size()`.
    fn rank(&self) -> Rank;

    /// Number of ranks in the world.
    fn world_size(&self) -> usize;

    /// Largest tag value the substrate will route.
    fn max_tag(&self) -> Tag;

    /// True when the substrate was brought up by the caller rather than by
    /// the coordination layer, in which case teardown must leave it running.
    fn preinitialized(&self) -> bool {
        false
    }

    /// Shuts the substrate down. Only called when this layer owns the
    /// substrate lifecycle (`!preinitialized()`).
    fn finalize(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Sends with whatever buffering the substrate prefers.
    fn send(&self, dest: Rank, tag: Tag, payload: &Payload) -> Result<(), TransportError>;

    /// Sends without buffering: completes only once the destination has
    /// matched the message with a receive.
    fn send_sync(&self, dest: Rank, tag: Tag, payload: &Payload) -> Result<(), TransportError>;

    /// Receives the next message from `source` carrying `tag`.
    fn recv(&self, source: Rank, tag: Tag) -> Result<Payload, TransportError>;

    /// Blocks until a message carrying `tag` (from `source`, or from anyone
    /// when `None`) is available, without consuming it.
    fn probe(&self, source: Option<Rank>, tag: Tag) -> Result<Status, TransportError>;

    /// Non-blocking variant of [`probe`](Transport::probe).
    fn try_probe(&self, source: Option<Rank>, tag: Tag)
        -> Result<Option<Status>, TransportError>;

    /// Blocks until every rank in the world has arrived.
    fn barrier(&self) -> Result<(), TransportError>;

    /// Creates a communicator over `ranks` (communicator rank = position in
    /// the slice). Every rank in the world must make the same call in the
    /// same order; ranks outside the group receive `None`.
    fn create_comm(&mut self, ranks: &[Rank]) -> Result<Option<CommId>, TransportError>;

    /// Releases a communicator created by [`create_comm`](Transport::create_comm).
    fn free_comm(&mut self, comm: CommId) -> Result<(), TransportError>;

    /// Root's payload is copied to every member; members overwrite `payload`.
    fn bcast(&self, comm: CommId, root: usize, payload: &mut Payload)
        -> Result<(), TransportError>;

    /// Concatenates members' contributions at the root in communicator-rank
    /// order. The root supplies the result buffer and the per-member element
    /// counts; members pass `None`.
    fn gather(
        &self,
        comm: CommId,
        root: usize,
        send: &Payload,
        recv: Option<(&mut Payload, &[usize])>,
    ) -> Result<(), TransportError>;

    /// Inverse of [`gather`](Transport::gather): the root supplies one
    /// buffer holding per-member chunks and the per-member element counts.
    fn scatter(
        &self,
        comm: CommId,
        root: usize,
        send: Option<(&Payload, &[usize])>,
        recv: &mut Payload,
    ) -> Result<(), TransportError>;

    /// Folds members' contributions with `op`, in communicator-rank order,
    /// into the root's result buffer.
    fn reduce(
        &self,
        comm: CommId,
        root: usize,
        op: &ReduceOp,
        send: &Payload,
        recv: Option<&mut Payload>,
    ) -> Result<(), TransportError>;

    /// Tears down the whole process group. Does not return.
    fn abort(&self, code: i32) -> !;
}

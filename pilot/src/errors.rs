//! The Pilot error taxonomy.
//!
//! Every public operation returns `Result<_, PilotError>`; callers decide
//! whether a failure is fatal. Each variant carries a stable numeric code
//! (see [`PilotError::code`]) so that abort paths and log consumers can
//! refer to errors across language boundaries.

use pilot_communication::{Rank, Tag, TransportError};

use crate::topology::{Phase, Usage};

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, PilotError>;

/// Everything that can go wrong inside the coordination layer.
#[derive(Debug, thiserror::Error)]
pub enum PilotError {
    #[error("{op} is not allowed in the {phase:?} phase")]
    WrongPhase { op: &'static str, phase: Phase },

    #[error("invalid or stale {0} handle")]
    InvalidObj(&'static str),

    #[error("no channel was supplied")]
    NullChannel,

    #[error("no bundle was supplied")]
    NullBundle,

    #[error("process requires a work function")]
    NullFunction,

    #[error("rank {rank} is not the writer of channel C{channel}")]
    EndpointWriter { channel: usize, rank: Rank },

    #[error("rank {rank} is not the reader of channel C{channel}")]
    EndpointReader { channel: usize, rank: Rank },

    #[error("both channel endpoints are rank {0}")]
    EndpointDuplicate(Rank),

    #[error("channel C{0} belongs to a collective bundle; use the bundle operation")]
    BundledChannel(usize),

    #[error("bundle B{bundle} was created for {usage:?} use")]
    BundleUsage { bundle: usize, usage: Usage },

    #[error("channel C{0} does not share the bundle's read end")]
    BundleReadEnd(usize),

    #[error("channel C{0} does not share the bundle's write end")]
    BundleWriteEnd(usize),

    #[error("rank {0} appears more than once on the bundle's rim")]
    BundleDuplicate(Rank),

    #[error("channel C{0} is already part of a bundle")]
    BundleAlready(usize),

    #[error("index {index} is out of range for bundle B{bundle} of size {size}")]
    BundleIndex {
        bundle: usize,
        index: usize,
        size: usize,
    },

    #[error("out of memory growing an internal table")]
    MallocError,

    #[error("no free rank left in a world of {world}")]
    InsufficientProcs { world: usize },

    #[error("channel id would exceed the substrate tag limit {0}")]
    MaxTags(Tag),

    #[error("bundle table is full")]
    MaxBundles,

    #[error("a bundle needs at least one channel")]
    ZeroMembers,

    #[error("no format string was supplied")]
    NullFormat,

    #[error("malformed format string at byte {at}")]
    FormatInvalid { at: usize },

    #[error("format terms do not match the supplied argument list")]
    FormatArgs,

    #[error("formats disagree across endpoints (got signature {got:#x}, expected {want:#x})")]
    FormatMismatch { got: u32, want: u32 },

    #[error("array length {0} not usable here (lengths below 2 are rejected)")]
    ArrayLength(usize),

    #[error("reduce operation requires an operator in every format term")]
    OpMissing,

    #[error("reduce operator not valid for this operation")]
    OpInvalid,

    #[error("buffer argument does not look like a usable data buffer")]
    BogusPointerArg,

    #[error("cannot open log file {0}")]
    LogOpen(String),

    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("internal error: {0}")]
    SystemError(&'static str),
}

impl PilotError {
    /// Stable numeric code for the error, from a contiguous range starting
    /// at 1. Codes are what abort paths hand to the substrate's group-abort
    /// and what appears in log records.
    pub fn code(&self) -> i32 {
        match self {
            PilotError::WrongPhase { .. } => 1,
            PilotError::InvalidObj(_) => 2,
            PilotError::NullChannel => 3,
            PilotError::NullBundle => 4,
            PilotError::NullFunction => 5,
            PilotError::EndpointWriter { .. } => 6,
            PilotError::EndpointReader { .. } => 7,
            PilotError::EndpointDuplicate(_) => 8,
            PilotError::BundledChannel(_) => 9,
            PilotError::BundleUsage { .. } => 10,
            PilotError::BundleReadEnd(_) => 11,
            PilotError::BundleWriteEnd(_) => 12,
            PilotError::BundleDuplicate(_) => 13,
            PilotError::BundleAlready(_) => 14,
            PilotError::BundleIndex { .. } => 15,
            PilotError::MallocError => 16,
            PilotError::InsufficientProcs { .. } => 17,
            PilotError::MaxTags(_) => 18,
            PilotError::MaxBundles => 19,
            PilotError::ZeroMembers => 20,
            PilotError::NullFormat => 21,
            PilotError::FormatInvalid { .. } => 22,
            PilotError::FormatArgs => 23,
            PilotError::FormatMismatch { .. } => 24,
            PilotError::ArrayLength(_) => 25,
            PilotError::OpMissing => 26,
            PilotError::OpInvalid => 27,
            PilotError::BogusPointerArg => 28,
            PilotError::LogOpen(_) => 29,
            PilotError::Transport(_) => 30,
            PilotError::SystemError(_) => 31,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_contiguous() {
        let samples: Vec<PilotError> = vec![
            PilotError::WrongPhase {
                op: "x",
                phase: Phase::PreInit,
            },
            PilotError::InvalidObj("channel"),
            PilotError::NullChannel,
            PilotError::NullBundle,
            PilotError::NullFunction,
            PilotError::EndpointWriter {
                channel: 1,
                rank: 0,
            },
            PilotError::EndpointReader {
                channel: 1,
                rank: 0,
            },
            PilotError::EndpointDuplicate(0),
            PilotError::BundledChannel(1),
            PilotError::BundleUsage {
                bundle: 1,
                usage: Usage::Select,
            },
            PilotError::BundleReadEnd(1),
            PilotError::BundleWriteEnd(1),
            PilotError::BundleDuplicate(0),
            PilotError::BundleAlready(1),
            PilotError::BundleIndex {
                bundle: 1,
                index: 0,
                size: 0,
            },
            PilotError::MallocError,
            PilotError::InsufficientProcs { world: 1 },
            PilotError::MaxTags(1),
            PilotError::MaxBundles,
            PilotError::ZeroMembers,
            PilotError::NullFormat,
            PilotError::FormatInvalid { at: 0 },
            PilotError::FormatArgs,
            PilotError::FormatMismatch { got: 0, want: 0 },
            PilotError::ArrayLength(0),
            PilotError::OpMissing,
            PilotError::OpInvalid,
            PilotError::BogusPointerArg,
            PilotError::LogOpen(String::new()),
            PilotError::Transport(TransportError::MissingBuffer),
            PilotError::SystemError("x"),
        ];
        for (index, error) in samples.iter().enumerate() {
            assert_eq!(error.code(), index as i32 + 1);
        }
    }
}

//! Compiled-in limits.
//!
//! These are exposed so that applications hitting a limit-related error can
//! see what they ran into. Changing one is a semver-visible change: the
//! values participate in wire-visible behavior (frame sizes, format
//! signatures).

/// Maximum length of the friendly name of a process, channel, or bundle.
/// Longer names are truncated.
pub const MAX_NAMELEN: usize = 100;

/// Maximum number of substrate messages a single format string may produce.
///
/// Most format terms produce one message, so for most purposes this bounds
/// the number of terms. The `^` flag and the `%s` type each produce an extra
/// array-length message, reducing the allowable number of terms.
pub const MAX_FORMATLEN: usize = 50;

/// Maximum number of bundles that can be created.
pub const MAX_BUNDLES: usize = 1024;

/// Width of one log frame in bytes. Longer records are wrapped onto
/// continuation frames.
pub const MAX_LOGLEN: usize = 80;

//! A CSP-style coordination layer over a message-passing substrate.
//!
//! Applications declare a static topology of named *processes*, typed
//! point-to-point *channels*, and *bundles* grouping channels for
//! collective use during a configuration phase, then exchange data with
//! printf-like format strings. The library hides rank and tag bookkeeping,
//! marshals values to and from the wire, cross-checks reader and writer
//! formats, and can feed a time-stamped event log to a deadlock detector.
//!
//! The substrate is pluggable through the
//! [`Transport`](communication::Transport) trait; the bundled
//! [`ThreadTransport`](communication::ThreadTransport) runs one rank per
//! OS thread, which is how the examples and tests below run.
//!
//! # Format strings
//!
//! Each `%` term describes one value or array:
//!
//! * types: `%d`/`%i` (i32), `%u` (u32), `%hd` (i16), `%hu` (u16),
//!   `%ld`/`%lld` (i64), `%lu`/`%llu` (u64), `%c` (i8), `%hhu` (u8),
//!   `%b` (byte), `%f` (f32), `%lf`/`%Lf` (f64), `%s` (string),
//!   `%m` (caller-typed raw elements);
//! * `%25d`: an array of exactly 25 elements; `%*d`: an array whose
//!   length comes from the slice itself;
//! * `%^d`: variable length, where the writer's length travels ahead of the
//!   data and the reader's buffer is allocated to the exact size;
//! * `%+/d`, `%max/25f`, `%mop/d`: reduce terms, for channels feeding a
//!   reduce bundle.
//!
//! Writes bind arguments as [`Value`]s, reads as [`Slot`]s.
//!
//! # Examples
//!
//! ```
//! use pilot::communication::{initialize, Config, ThreadTransport};
//! use pilot::{Pilot, PilotOptions, Slot, Value};
//!
//! fn worker(pilot: &mut Pilot<ThreadTransport>, _arg: i64) -> i32 {
//!     let chan = pilot.channel(1).unwrap();
//!     let mut value = 0i32;
//!     pilot.read(chan, "%d", &mut [Slot::I32(&mut value)]).unwrap();
//!     assert_eq!(value, 42);
//!     0
//! }
//!
//! let guards = initialize(Config::Process(2), |endpoint| {
//!     let mut pilot = Pilot::configure(endpoint, PilotOptions::default().quiet()).unwrap();
//!     let to_worker = {
//!         let worker = pilot.create_process(worker, 0).unwrap();
//!         pilot.create_channel(None, Some(&worker)).unwrap()
//!     };
//!     if pilot.start_all().unwrap() != 0 {
//!         return; // workers have already run and shut down
//!     }
//!     pilot.write(to_worker, "%d", &[Value::I32(42)]).unwrap();
//!     pilot.stop_main(0).unwrap();
//! })
//! .unwrap();
//! guards.join();
//! ```

pub mod errors;
pub mod limits;
pub mod options;
pub mod topology;

pub mod context;
pub mod format;
pub mod logsvc;

mod collective;
mod ops;

/// The substrate seam and the bundled thread transport.
pub use pilot_communication as communication;

pub use crate::context::Pilot;
pub use crate::errors::{PilotError, Result};
pub use crate::format::value::{Slot, Value};
pub use crate::logsvc::{DeadlockSink, Tracer};
pub use crate::options::PilotOptions;
pub use crate::topology::{Bundle, Channel, CopyDirection, Nameable, Process, Usage, WorkFn};
pub use pilot_communication::{Datatype, ReduceOp, UserOp};

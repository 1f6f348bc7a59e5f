//! The log event pipeline.
//!
//! Every rank frames its log records into fixed-width messages on tag 0,
//! the one tag no channel can own, and the auxiliary process on rank 1
//! multiplexes them: reassembling continuations, timestamping, writing the
//! log file, counting the final `FIN` records, and feeding the deadlock
//! detector. The file is flushed after every record so a crash cannot
//! swallow the tail of the log.
//!
//! Frame layout, `MAX_LOGLEN` bytes each:
//!
//! ```text
//! <type> \t <rank> \t <payload...> \0...          <marker>
//! └── up to MAX_LOGLEN-2 bytes of record text ──┘ └ '+' or ' ' ┘
//! ```
//!
//! A `'+'` marker announces a continuation frame from the same source; a
//! `' '` marker closes the record.

use std::fs::File;
use std::io::Write;
use std::time::Instant;

use pilot_communication::{Datatype, Payload, Rank, Tag, Transport};

use crate::context::{Pilot, BORDER};
use crate::errors::{PilotError, Result};
use crate::format::value::render_first;
use crate::format::{DescData, Descriptor};
use crate::limits::MAX_LOGLEN;

/// Tag reserved for log traffic. Channel tags start at 1.
pub(crate) const LOG_TAG: Tag = 0;

/// Record types multiplexed through the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LogEventKind {
    /// Library life-cycle records (`FIN` among them).
    Pilot,
    /// Application entries via `Pilot::log`.
    User,
    /// Topology table dumps.
    Tables,
    /// Per-operation call records.
    Calls,
    /// Statistics (reserved).
    Stats,
}

impl LogEventKind {
    pub(crate) fn code(self) -> u8 {
        match self {
            LogEventKind::Pilot => b'P',
            LogEventKind::User => b'U',
            LogEventKind::Tables => b'T',
            LogEventKind::Calls => b'C',
            LogEventKind::Stats => b'S',
        }
    }
}

/// Consumer of `PILOT` and `CALLS` records, fed by the auxiliary process.
/// The detection algorithm itself lives outside this crate.
pub trait DeadlockSink: Send {
    /// Called once before any event, with the number of user-visible ranks.
    fn start(&mut self, user_ranks: usize);
    /// One reassembled record: `<type>\t<rank>\t<body>`.
    fn event(&mut self, record: &str);
    /// Called after every rank has checked in.
    fn finish(&mut self);
}

/// Observer of structured call events on each rank, enabled by the `j`
/// service. Stands in for an external trace visualizer.
pub trait Tracer: Send {
    /// One coordination call: operation code, channel or bundle id, and
    /// the format or text detail.
    fn record(&mut self, rank: Rank, op: &str, object: usize, detail: &str);
}

/// Splits one record into wire frames.
pub(crate) fn frames(kind: LogEventKind, rank: Rank, body: &str) -> Vec<Vec<u8>> {
    let record = format!("{}\t{}\t{}", kind.code() as char, rank, body);
    let content = record.as_bytes();
    let capacity = MAX_LOGLEN - 2;

    let mut result = Vec::with_capacity(content.len() / capacity + 1);
    let mut chunks = content.chunks(capacity).peekable();
    loop {
        let chunk = chunks.next().unwrap_or(&[]);
        let mut frame = vec![0u8; MAX_LOGLEN];
        frame[..chunk.len()].copy_from_slice(chunk);
        let last = chunks.peek().is_none();
        frame[MAX_LOGLEN - 1] = if last { b' ' } else { b'+' };
        result.push(frame);
        if last {
            break;
        }
    }
    result
}

/// Text carried by one frame: everything before the marker byte, cut at
/// the first NUL.
fn frame_text(frame: &[u8]) -> &[u8] {
    let body = &frame[..frame.len().saturating_sub(1)];
    match body.iter().position(|&byte| byte == 0) {
        Some(end) => &body[..end],
        None => body,
    }
}

impl<T: Transport> Pilot<T> {
    /// Frames and ships one record to the auxiliary process. A no-op when
    /// no auxiliary rank is running.
    pub(crate) fn log_event(&self, kind: LogEventKind, body: &str) -> Result<()> {
        let Some(aux) = self.flags.aux_rank else {
            return Ok(());
        };
        for frame in frames(kind, self.rank, body) {
            self.transport
                .send(aux, LOG_TAG, &Payload::new(Datatype::Uint8, frame))?;
        }
        Ok(())
    }

    /// Emits one CALLS record for an operation, and mirrors it to the
    /// tracer when the visualizer service is on. The first descriptor is
    /// logged before any I/O so that a format mismatch blocking the
    /// transfer is still visible to the deadlock detector.
    pub(crate) fn log_call(
        &mut self,
        at: Option<(&'static str, u32)>,
        code: &str,
        object: usize,
        format: &str,
        part: usize,
        parts: usize,
        desc: Option<&Descriptor>,
    ) -> Result<()> {
        if self.flags.trace_viz {
            if let Some(tracer) = self.tracer.as_mut() {
                tracer.record(self.rank, code, object, format);
            }
        }
        if !self.flags.log_calls {
            return Ok(());
        }
        let (file, line) = at.unwrap_or(("?", 0));
        let mut body = if parts > 1 {
            format!(
                "{}\t{}\t{:.12}:{}\t{} (part {}/{})",
                code, object, file, line, format, part, parts
            )
        } else {
            format!("{}\t{}\t{:.12}:{}\t{}", code, object, file, line, format)
        };
        if let Some(desc) = desc {
            body.push_str(&interp_arg(desc));
        }
        self.log_event(LogEventKind::Calls, &body)
    }
}

/// Renders one descriptor for a call record: the element count, plus the
/// first value for outbound data.
fn interp_arg(desc: &Descriptor) -> String {
    match &desc.data {
        DescData::Out(payload) => {
            format!("\t[{}] {}", desc.count, render_first(desc.ctype, payload))
        }
        DescData::In { .. } | DescData::InInternal => format!("\t[{}] &", desc.count),
    }
}

/// Work function of the auxiliary log process on rank 1.
///
/// Failures here abort the group: the auxiliary process has no caller to
/// hand an error back to.
pub(crate) fn online_process<T: Transport>(pilot: &mut Pilot<T>, _arg: i64) -> i32 {
    match run_log_loop(pilot) {
        Ok(()) => 0,
        Err(error) => {
            eprintln!("{}auxiliary log process failed: {}", BORDER, error);
            pilot.transport.abort(error.code())
        }
    }
}

fn run_log_loop<T: Transport>(pilot: &mut Pilot<T>) -> Result<()> {
    let start = Instant::now();

    // The base sends the file name length first; zero means no file and
    // the pipeline only feeds the detector.
    let length = pilot
        .transport
        .recv(0, LOG_TAG)?
        .as_i32()
        .ok_or(PilotError::SystemError("malformed log file name length"))?;
    let mut logfile = None;
    if length > 0 {
        let raw = pilot.transport.recv(0, LOG_TAG)?;
        let path = format!("{}.log", String::from_utf8_lossy(raw.bytes()));
        logfile = Some(File::create(&path).map_err(|_| PilotError::LogOpen(path.clone()))?);
    }

    let user_ranks = pilot.world - 1;
    if pilot.flags.deadlock {
        if let Some(sink) = pilot.sink.as_mut() {
            sink.start(user_ranks);
        }
    }

    // One FIN must arrive from every rank but this one.
    let mut fins = user_ranks;
    while fins > 0 {
        let status = pilot.transport.probe(None, LOG_TAG)?;
        let source = status.source;

        let mut raw = pilot.transport.recv(source, LOG_TAG)?.into_bytes();
        let mut record = Vec::new();
        loop {
            record.extend_from_slice(frame_text(&raw));
            let continued = raw.len() == MAX_LOGLEN && raw[MAX_LOGLEN - 1] == b'+';
            if !continued {
                break;
            }
            // Continuations come from the same source, in order.
            raw = pilot.transport.recv(source, LOG_TAG)?.into_bytes();
        }
        let record = String::from_utf8_lossy(&record).into_owned();

        if pilot.flags.deadlock
            && (record.starts_with(LogEventKind::Pilot.code() as char)
                || record.starts_with(LogEventKind::Calls.code() as char))
        {
            if let Some(sink) = pilot.sink.as_mut() {
                sink.event(&record);
            }
        }

        if let Some(file) = logfile.as_mut() {
            writeln!(file, "{:06}\t{}", start.elapsed().as_micros(), record)
                .and_then(|_| file.flush())
                .map_err(|_| PilotError::SystemError("log file write"))?;
        }

        if record.starts_with(LogEventKind::Pilot.code() as char) {
            let mut fields = record.splitn(3, '\t');
            let body = fields.nth(2);
            if body.map_or(false, |body| body.starts_with("FIN")) {
                fins -= 1;
            }
        }
    }

    if pilot.flags.deadlock {
        if let Some(sink) = pilot.sink.as_mut() {
            sink.finish();
        }
    }
    Ok(())
}

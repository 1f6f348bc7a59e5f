//! Runtime options and the service flags derived from them.
//!
//! Options arrive either through `-pi*` command-line arguments, which are
//! consumed and removed before anything else sees the argument vector, or
//! through the builder methods. Only rank 0 is assumed to have parsed real
//! arguments; the derived [`ServiceFlags`] are broadcast from rank 0 during
//! configuration so that every rank agrees on which services run.

use serde::{Deserialize, Serialize};

use crate::logsvc::{DeadlockSink, Tracer};

/// Default base name of the log file.
pub const DEFAULT_LOG_BASE: &str = "pilot";

/// What the application asked for, before any derivation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ServiceRequest {
    /// `c`: log every coordination call.
    pub calls: bool,
    /// `d`: deadlock detection (dedicates one rank).
    pub deadlock: bool,
    /// `j`: feed structured events to a trace visualizer.
    pub trace_viz: bool,
    /// `s`: statistics (reserved).
    pub stats: bool,
    /// `m`: topology dump (reserved).
    pub topology: bool,
    /// `t`: CSP traces (reserved).
    pub traces: bool,
}

/// Behavior settings for one configure/stop cycle.
pub struct PilotOptions {
    /// Error-checking level, 0 to 3. Level 2 adds cross-endpoint format
    /// matching; level 3 adds buffer-shape validation.
    pub check_level: u8,
    /// Suppress the banner and allocation summary on stdout.
    pub quiet: bool,
    pub(crate) log_file: Option<String>,
    pub(crate) services: ServiceRequest,
    pub(crate) unrecognized: Option<String>,
    pub(crate) sink: Option<Box<dyn DeadlockSink>>,
    pub(crate) tracer: Option<Box<dyn Tracer>>,
}

impl Default for PilotOptions {
    fn default() -> PilotOptions {
        PilotOptions {
            check_level: 1,
            quiet: false,
            log_file: None,
            services: ServiceRequest::default(),
            unrecognized: None,
            sink: None,
            tracer: None,
        }
    }
}

impl std::fmt::Debug for PilotOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PilotOptions")
            .field("check_level", &self.check_level)
            .field("quiet", &self.quiet)
            .field("log_file", &self.log_file)
            .field("services", &self.services)
            .finish_non_exhaustive()
    }
}

impl PilotOptions {
    /// Scans `args` for `-pi*` options, removing everything it recognizes
    /// (and everything that starts with `-pi` but is malformed, which is
    /// reported from rank 0 at configure time). Other arguments keep their
    /// relative order for the application to consume.
    pub fn from_args(args: &mut Vec<String>) -> PilotOptions {
        let mut options = PilotOptions::default();
        let mut bad = String::new();
        args.retain(|arg| {
            if !arg.starts_with("-pi") {
                return true;
            }
            let mut unrecognized = false;
            if let Some(chars) = arg.strip_prefix("-pisvc=") {
                for c in chars.chars() {
                    match c.to_ascii_uppercase() {
                        'C' => options.services.calls = true,
                        'D' => options.services.deadlock = true,
                        'J' => options.services.trace_viz = true,
                        'S' => options.services.stats = true,
                        'M' => options.services.topology = true,
                        'T' => options.services.traces = true,
                        _ => unrecognized = true,
                    }
                }
            } else if let Some(name) = arg.strip_prefix("-pilog=") {
                if name.is_empty() {
                    unrecognized = true;
                } else {
                    options.log_file = Some(name.to_string());
                }
            } else if let Some(level) = arg.strip_prefix("-picheck=") {
                let mut chars = level.chars();
                match (chars.next(), chars.next()) {
                    (Some(digit), None) if digit.is_ascii_digit() => {
                        options.check_level = digit as u8 - b'0';
                    }
                    _ => unrecognized = true,
                }
            } else {
                unrecognized = true;
            }
            if unrecognized {
                bad.push(' ');
                bad.push_str(arg);
            }
            false
        });
        if !bad.is_empty() {
            options.unrecognized = Some(bad);
        }
        options
    }

    /// Sets the error-checking level (0..=3).
    pub fn check_level(mut self, level: u8) -> Self {
        self.check_level = level;
        self
    }

    /// Suppresses banner output.
    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    /// Sets the log file name. An extension, if present, is stripped and
    /// replaced with `.log`.
    pub fn log_file(mut self, name: impl Into<String>) -> Self {
        self.log_file = Some(name.into());
        self
    }

    /// Enables services by their option characters, as `-pisvc=` would.
    pub fn services(mut self, chars: &str) -> Self {
        for c in chars.chars() {
            match c.to_ascii_uppercase() {
                'C' => self.services.calls = true,
                'D' => self.services.deadlock = true,
                'J' => self.services.trace_viz = true,
                'S' => self.services.stats = true,
                'M' => self.services.topology = true,
                'T' => self.services.traces = true,
                _ => {}
            }
        }
        self
    }

    /// Installs the deadlock detector fed by the auxiliary log process.
    /// Only the instance on the auxiliary rank ever sees events.
    pub fn deadlock_sink(mut self, sink: Box<dyn DeadlockSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Installs a trace-visualization sink, observed on every rank when the
    /// `j` service is enabled.
    pub fn tracer(mut self, tracer: Box<dyn Tracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    /// Derives the runtime service flags. This runs on rank 0; the result
    /// is broadcast to everyone else.
    pub(crate) fn service_flags(&self) -> ServiceFlags {
        let s = &self.services;
        let log_tables = s.calls || s.stats || s.topology || s.traces;
        let log_calls = s.calls || s.traces || s.deadlock;
        // A text log file is wanted either because a log-producing service
        // was selected, or because a file name was given without the
        // visualizer taking over.
        let log_file = s.calls
            || s.stats
            || s.topology
            || s.traces
            || (!s.trace_viz && self.log_file.is_some());
        let logging = log_file || s.trace_viz;
        let aux_rank = if log_file || s.deadlock { Some(1) } else { None };
        ServiceFlags {
            logging,
            log_tables,
            log_calls,
            log_stats: s.stats,
            log_file,
            deadlock: s.deadlock,
            trace_viz: s.trace_viz,
            aux_rank,
        }
    }

    /// The log base name with any extension stripped, or the default when
    /// logging is active but no name was given.
    pub(crate) fn log_basename(&self) -> Option<String> {
        let name = self.log_file.as_deref()?;
        let base = match name.rfind('.') {
            Some(0) => return None, // nothing but an extension
            Some(dot) => &name[..dot],
            None => name,
        };
        Some(base.to_string())
    }
}

/// Flags agreed on by every rank once configuration completes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ServiceFlags {
    /// Any logging facility is active.
    pub logging: bool,
    /// Dump the topology tables to the log.
    pub log_tables: bool,
    /// Log coordination calls.
    pub log_calls: bool,
    /// Collect statistics (reserved).
    pub log_stats: bool,
    /// The auxiliary process writes a text log file.
    pub log_file: bool,
    /// Deadlock detection is on.
    pub deadlock: bool,
    /// Structured events go to the trace visualizer.
    pub trace_viz: bool,
    /// Rank dedicated to the auxiliary log process, if any.
    pub aux_rank: Option<usize>,
}

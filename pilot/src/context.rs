//! The per-rank Pilot context.
//!
//! [`Pilot::configure`] wraps a transport endpoint and moves the rank into
//! the configuration phase; the builder calls populate the topology tables;
//! [`Pilot::start_all`] dispatches work functions and hands rank 0 back to
//! the application. Every rank replays the same configuration code, which
//! is what keeps the tables identical across the world without any
//! serialization.

use std::any::Any;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use pilot_communication::{CommId, Datatype, Payload, Rank, Tag, Transport, WORLD};

use crate::errors::{PilotError, Result};
use crate::logsvc::{self, DeadlockSink, LogEventKind, Tracer, LOG_TAG};
use crate::options::{PilotOptions, ServiceFlags, DEFAULT_LOG_BASE};
use crate::topology::{
    Bundle, Channel, CopyDirection, Nameable, Phase, Process, Topology, Usage, WorkFn,
};

/// Printed to the left of all Pilot console output, so it is not confused
/// with application output.
pub(crate) const BORDER: &str = "[pilot] ";

const HELLO: &str = concat!("Pilot ", env!("CARGO_PKG_VERSION"));

/// Handle generations are process-global so that a handle from an earlier
/// configure/stop cycle can never validate against a later one.
static NEXT_STAMP: AtomicU32 = AtomicU32::new(1);

/// One rank's view of a Pilot world.
///
/// The context is single-threaded by construction: each rank owns exactly
/// one, and all operations go through it.
pub struct Pilot<T: Transport> {
    pub(crate) transport: T,
    pub(crate) phase: Phase,
    pub(crate) rank: Rank,
    pub(crate) world: usize,
    pub(crate) check_level: u8,
    pub(crate) flags: ServiceFlags,
    pub(crate) topo: Topology<T>,
    pub(crate) caller: Option<(&'static str, u32)>,
    pub(crate) sink: Option<Box<dyn DeadlockSink>>,
    pub(crate) tracer: Option<Box<dyn Tracer>>,
    quiet: bool,
    bench: bool,
    user_procs: usize,
    log_basename: Option<String>,
    start_time: Option<Instant>,
}

impl<T: Transport> Pilot<T> {
    /// Brings the coordination layer up on this rank and enters the
    /// configuration phase.
    ///
    /// Rank 0 derives the runtime service flags from `options` and
    /// broadcasts them, so every rank agrees on which services run even if
    /// only rank 0 saw real command-line arguments. When logging or
    /// deadlock detection is requested, rank 1 is dedicated to the
    /// auxiliary log process and the user-visible process count shrinks by
    /// one.
    pub fn configure(transport: T, mut options: PilotOptions) -> Result<Pilot<T>> {
        let rank = transport.rank();
        let world = transport.world_size();
        let bench = transport.preinitialized();
        let stamp = NEXT_STAMP.fetch_add(1, Ordering::Relaxed);

        if rank == 0 {
            if let Some(bad) = &options.unrecognized {
                eprintln!("{}Unrecognized arguments:{}", BORDER, bad);
            }
        }

        // Only rank 0 is assumed to have parsed real arguments; everyone
        // else takes the derived flags from the broadcast below.
        let mut flags = ServiceFlags::default();
        let mut log_basename = None;
        if rank == 0 {
            flags = options.service_flags();
            if flags.logging {
                log_basename = options
                    .log_basename()
                    .or_else(|| Some(DEFAULT_LOG_BASE.to_string()));
            }
        }
        let encoded = if rank == 0 {
            bincode::serialize(&flags)
                .map_err(|_| PilotError::SystemError("service flag encoding"))?
        } else {
            Vec::new()
        };
        let mut length = Payload::from_i32(encoded.len() as i32);
        transport.bcast(WORLD, 0, &mut length)?;
        let length = length
            .as_i32()
            .ok_or(PilotError::SystemError("service flag length"))? as usize;
        let mut body = Payload::new(
            Datatype::Uint8,
            if rank == 0 { encoded } else { vec![0; length] },
        );
        transport.bcast(WORLD, 0, &mut body)?;
        if rank != 0 {
            flags = bincode::deserialize(body.bytes())
                .map_err(|_| PilotError::SystemError("service flag decoding"))?;
        }

        if rank == 0 && !options.quiet {
            println!("\n{}*** {}", BORDER, HELLO);
            println!(
                "{}*** Available processes: {}; tags for channels: {}",
                BORDER,
                world,
                transport.max_tag()
            );
            println!(
                "{}*** Running with error checking at level {}",
                BORDER, options.check_level
            );
            let mut active = String::new();
            if options.services.calls {
                active.push_str(" Call_log");
            }
            if options.services.deadlock {
                active.push_str(" Deadlock_detection");
            }
            if options.services.trace_viz {
                active.push_str(" Trace_visualizer");
            }
            if !active.is_empty() {
                println!("{}*** Services:{}", BORDER, active);
            }
            if let Some(name) = &log_basename {
                println!("{}*** Logging to file: {}.log", BORDER, name);
            }
            if flags.aux_rank.is_some() {
                println!("{}*** Auxiliary log process running as P1", BORDER);
            }
        }

        let mut pilot = Pilot {
            transport,
            phase: Phase::Config,
            rank,
            world,
            check_level: options.check_level,
            flags,
            topo: Topology::new(world, stamp),
            caller: None,
            sink: options.sink.take(),
            tracer: options.tracer.take(),
            quiet: options.quiet,
            bench,
            user_procs: world,
            log_basename,
            start_time: None,
        };

        // Rank 0 is the application's main and gets a placeholder record.
        let main = pilot.topo.create_process(None, 0, None)?;
        pilot.topo.set_name(main.into(), "main")?;

        // The auxiliary process must be created first so it lands on rank 1.
        if pilot.flags.aux_rank == Some(1) {
            pilot.user_procs -= 1;
            let aux = pilot
                .topo
                .create_process(Some(logsvc::online_process::<T>), 0, None)?;
            pilot.topo.set_name(aux.into(), "Pilot Online Process")?;
        }

        log::debug!(
            "rank {} configured: world {}, {} user processes, services {:?}",
            rank,
            world,
            pilot.user_procs,
            pilot.flags
        );
        Ok(pilot)
    }

    /// Number of processes available to the application, including the
    /// main process. With N available, `create_process` can be called at
    /// most N-1 times.
    pub fn available_processes(&self) -> usize {
        self.user_procs
    }

    /// This rank.
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Number of ranks in the world, auxiliary included.
    pub fn world_size(&self) -> usize {
        self.world
    }

    /// Records the application call site for diagnostics and call logs.
    /// Usually written as `pi_call!(pilot).write(...)`.
    pub fn at(&mut self, file: &'static str, line: u32) -> &mut Self {
        self.caller = Some((file, line));
        self
    }

    /// Dismantles the context and hands the transport endpoint back, for
    /// another configure cycle.
    pub fn into_inner(self) -> T {
        self.transport
    }

    pub(crate) fn ensure_phase(&self, want: Phase, op: &'static str) -> Result<()> {
        if self.phase != want {
            return Err(PilotError::WrongPhase {
                op,
                phase: self.phase,
            });
        }
        Ok(())
    }

    pub(crate) fn ensure_configured(&self, op: &'static str) -> Result<()> {
        if self.phase != Phase::Config && self.phase != Phase::Running {
            return Err(PilotError::WrongPhase {
                op,
                phase: self.phase,
            });
        }
        Ok(())
    }

    /// Creates a process and assigns `work` to it, to be dispatched by
    /// [`start_all`](Pilot::start_all) with `arg`.
    pub fn create_process(&mut self, work: WorkFn<T>, arg: i64) -> Result<Process> {
        self.ensure_phase(Phase::Config, "create_process")?;
        self.topo.create_process(Some(work), arg, None)
    }

    /// Like [`create_process`](Pilot::create_process), additionally
    /// attaching shared data the work function can retrieve with
    /// [`work_data`](Pilot::work_data).
    pub fn create_process_with(
        &mut self,
        work: WorkFn<T>,
        arg: i64,
        data: Arc<dyn Any + Send + Sync>,
    ) -> Result<Process> {
        self.ensure_phase(Phase::Config, "create_process")?;
        self.topo.create_process(Some(work), arg, Some(data))
    }

    /// The data attached to this rank's process, if any.
    pub fn work_data(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.topo.processes.get(self.rank)?.data.clone()
    }

    /// Creates a channel from `from` to `to`; `None` stands for the main
    /// process.
    pub fn create_channel(
        &mut self,
        from: Option<&Process>,
        to: Option<&Process>,
    ) -> Result<Channel> {
        self.ensure_phase(Phase::Config, "create_channel")?;
        let max_tag = self.transport.max_tag();
        self.topo.create_channel(from, to, max_tag)
    }

    /// Duplicates channels with the same or reversed endpoints.
    pub fn copy_channels(
        &mut self,
        direction: CopyDirection,
        channels: &[Channel],
    ) -> Result<Vec<Channel>> {
        self.ensure_phase(Phase::Config, "copy_channels")?;
        let max_tag = self.transport.max_tag();
        self.topo.copy_channels(direction, channels, max_tag)
    }

    /// Groups channels into a bundle for the given collective usage.
    pub fn create_bundle(&mut self, usage: Usage, members: &[Channel]) -> Result<Bundle> {
        self.ensure_phase(Phase::Config, "create_bundle")?;
        self.topo.create_bundle(usage, members, &mut self.transport)
    }

    /// Renames a process, channel, or bundle. Restricted to the
    /// configuration phase so every rank agrees on every name.
    pub fn set_name(&mut self, object: impl Into<Nameable>, name: &str) -> Result<()> {
        self.ensure_phase(Phase::Config, "set_name")?;
        self.topo.set_name(object.into(), name)
    }

    /// The friendly name of a process, channel, or bundle.
    pub fn get_name(&self, object: impl Into<Nameable>) -> Result<&str> {
        self.ensure_configured("get_name")?;
        self.topo.get_name(object.into())
    }

    /// The caller's own process name, or a placeholder during
    /// configuration when the rank's identity is not yet meaningful.
    pub fn process_name(&self) -> &str {
        if self.phase == Phase::Running {
            &self.topo.processes[self.rank].name
        } else {
            "Configuration Phase"
        }
    }

    /// Looks a channel up by its creation-order id (starting at 1). The
    /// tables are identical on every rank, so work functions use this to
    /// recover handles created by the configuration code.
    pub fn channel(&self, id: usize) -> Result<Channel> {
        self.ensure_configured("channel")?;
        if id == 0 || id > self.topo.channels.len() {
            return Err(PilotError::InvalidObj("channel"));
        }
        Ok(Channel {
            index: id - 1,
            stamp: self.topo.stamp,
        })
    }

    /// Looks a channel up by name.
    pub fn channel_named(&self, name: &str) -> Result<Channel> {
        self.ensure_configured("channel_named")?;
        let index = self
            .topo
            .channels
            .iter()
            .position(|record| record.name == name)
            .ok_or(PilotError::InvalidObj("channel"))?;
        Ok(Channel {
            index,
            stamp: self.topo.stamp,
        })
    }

    /// Looks a bundle up by its creation-order id (starting at 1).
    pub fn bundle(&self, id: usize) -> Result<Bundle> {
        self.ensure_configured("bundle")?;
        if id == 0 || id > self.topo.bundles.len() {
            return Err(PilotError::InvalidObj("bundle"));
        }
        Ok(Bundle {
            index: id - 1,
            stamp: self.topo.stamp,
        })
    }

    /// Looks a bundle up by name.
    pub fn bundle_named(&self, name: &str) -> Result<Bundle> {
        self.ensure_configured("bundle_named")?;
        let index = self
            .topo
            .bundles
            .iter()
            .position(|record| record.name == name)
            .ok_or(PilotError::InvalidObj("bundle"))?;
        Ok(Bundle {
            index,
            stamp: self.topo.stamp,
        })
    }

    /// A member channel of a bundle, by rim position.
    pub fn bundle_channel(&self, bundle: Bundle, index: usize) -> Result<Channel> {
        self.ensure_phase(Phase::Running, "bundle_channel")?;
        let record = self.topo.bundle(&bundle)?;
        if index >= record.channels.len() {
            return Err(PilotError::BundleIndex {
                bundle: record.id,
                index,
                size: record.channels.len(),
            });
        }
        Ok(Channel {
            index: record.channels[index],
            stamp: self.topo.stamp,
        })
    }

    /// Number of channels in a bundle.
    pub fn bundle_size(&self, bundle: Bundle) -> Result<usize> {
        self.ensure_phase(Phase::Running, "bundle_size")?;
        Ok(self.topo.bundle(&bundle)?.channels.len())
    }

    /// Moves the world into the running phase.
    ///
    /// Rank 0 prints the allocation summary, synchronizes with every other
    /// rank, hands the log file name to the auxiliary process, and returns
    /// 0 so the application's main logic continues. Every other rank
    /// synchronizes, runs its assigned work function, tears down with
    /// [`stop_main`](Pilot::stop_main), and returns its own rank; the
    /// caller is expected to check the returned rank and let non-zero
    /// ranks fall out of the application closure.
    pub fn start_all(&mut self) -> Result<Rank> {
        self.ensure_phase(Phase::Config, "start_all")?;
        self.phase = Phase::Running;

        if self.rank == 0 {
            if !self.quiet {
                println!(
                    "{}*** Allocated processes: {}; channels: {}; bundles: {}",
                    BORDER,
                    self.topo.allocated,
                    self.topo.channels.len(),
                    self.topo.bundles.len()
                );
                let spare = self.world - self.topo.allocated;
                if spare > 0 {
                    println!("{}*** Note that --{}-- ranks will be idle!", BORDER, spare);
                }
            }
            self.transport.barrier()?;

            // The auxiliary process waits for the file name before its
            // event loop; zero length means no file, detector only.
            if let Some(aux) = self.flags.aux_rank {
                let name = if self.flags.log_file {
                    self.log_basename.clone()
                } else {
                    None
                };
                let length = name.as_ref().map_or(0, |n| n.len() as i32);
                self.transport
                    .send(aux, LOG_TAG, &Payload::from_i32(length))?;
                if let Some(name) = name {
                    self.transport
                        .send(aux, LOG_TAG, &Payload::new(Datatype::Uint8, name.into_bytes()))?;
                }
            }
            return Ok(0);
        }

        self.transport.barrier()?;
        let work = self.topo.processes[self.rank].work;
        let arg = self.topo.processes[self.rank].arg;
        // Ranks beyond the allocated processes simply idle through.
        let status = match work {
            Some(work) => work(self, arg),
            None => 0,
        };
        self.stop_main(status)?;
        Ok(self.rank)
    }

    /// Finalizes the cycle.
    ///
    /// Called by the application's main once, and internally on every
    /// other rank when its work function returns. In bench mode (the
    /// transport was alive before [`configure`](Pilot::configure)) the
    /// phase returns to `PreInit` and the endpoint stays usable for a
    /// fresh configure; bundle communicators are freed eagerly so repeated
    /// cycles cannot exhaust the substrate.
    pub fn stop_main(&mut self, status: i32) -> Result<()> {
        self.ensure_phase(Phase::Running, "stop_main")?;

        if let Some(aux) = self.flags.aux_rank {
            if self.rank != aux {
                self.log_event(LogEventKind::Pilot, &format!("FIN\t{}", status))?;
            }
        }

        self.transport.barrier()?;

        if self.bench {
            self.phase = Phase::PreInit;
            let comms: Vec<CommId> = self
                .topo
                .bundles
                .iter()
                .filter_map(|bundle| bundle.comm)
                .collect();
            for comm in comms {
                self.transport.free_comm(comm)?;
            }
        } else {
            self.phase = Phase::PostRun;
            self.transport.finalize()?;
        }

        self.topo.clear();
        self.start_time = None;
        log::debug!("rank {} stopped with status {}", self.rank, status);
        Ok(())
    }

    /// Fixes a point in time for [`elapsed`](Pilot::elapsed).
    pub fn start_timer(&mut self) -> Result<()> {
        self.ensure_configured("start_timer")?;
        self.start_time = Some(Instant::now());
        Ok(())
    }

    /// Wall-clock seconds since [`start_timer`](Pilot::start_timer).
    pub fn elapsed(&self) -> Result<f64> {
        self.ensure_configured("elapsed")?;
        self.start_time
            .map(|start| start.elapsed().as_secs_f64())
            .ok_or(PilotError::SystemError("elapsed before start_timer"))
    }

    /// Appends an application entry to the log file. A no-op when file
    /// logging is off.
    pub fn log(&mut self, text: &str) -> Result<()> {
        self.ensure_phase(Phase::Running, "log")?;
        if self.flags.log_file {
            self.log_event(LogEventKind::User, text)?;
        }
        Ok(())
    }

    /// True when any logging facility is active.
    pub fn is_logging(&self) -> Result<bool> {
        self.ensure_configured("is_logging")?;
        Ok(self.flags.logging)
    }

    /// Sends data without the substrate's buffering when deadlock
    /// detection is on, so that buffering cannot hide a would-be deadlock.
    pub(crate) fn send_data(
        &self,
        dest: Rank,
        tag: Tag,
        payload: &Payload,
    ) -> Result<()> {
        if self.flags.deadlock {
            self.transport.send_sync(dest, tag, payload)?;
        } else {
            self.transport.send(dest, tag, payload)?;
        }
        Ok(())
    }

    /// Resolves a bundle's communicator on this rank.
    pub(crate) fn bundle_comm(&self, comm: Option<CommId>) -> Result<CommId> {
        comm.ok_or(PilotError::SystemError(
            "rank is not a member of the bundle's communicator",
        ))
    }
}

/// Stamps the application call site into the context before an operation:
/// `pi_call!(pilot).write(&chan, "%d", &[Value::I32(1)])`.
#[macro_export]
macro_rules! pi_call {
    ($pilot:expr) => {
        $pilot.at(file!(), line!())
    };
}

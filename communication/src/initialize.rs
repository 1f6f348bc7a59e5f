//! Initialization logic for a thread-backed communication world.

use std::sync::Arc;
use std::thread;

use crate::thread::ThreadTransport;

/// Possible configurations for the communication infrastructure.
#[derive(Clone, Debug)]
pub enum Config {
    /// Use one rank in the calling process.
    Thread,
    /// Use one process with an indicated number of ranks, one thread each.
    Process(usize),
}

impl Config {
    /// Number of ranks the configuration describes.
    pub fn ranks(&self) -> usize {
        match self {
            Config::Thread => 1,
            Config::Process(ranks) => *ranks,
        }
    }

    /// Installs options into a [`getopts::Options`] struct that corresponds
    /// to the parameters in the configuration.
    ///
    /// It is the caller's responsibility to ensure that the installed options
    /// do not conflict with any other options that may exist in `opts`, or
    /// that may be installed into `opts` in the future.
    ///
    /// This method is only available if the `getopts` feature is enabled,
    /// which it is by default.
    #[cfg(feature = "getopts")]
    pub fn install_options(opts: &mut getopts::Options) {
        opts.optopt("w", "workers", "number of ranks to run", "NUM");
    }

    /// Instantiates a configuration based upon the parsed options in
    /// `matches`.
    ///
    /// The `matches` object must have been constructed from a
    /// [`getopts::Options`] which contained at least the options installed by
    /// [`Self::install_options`].
    ///
    /// This method is only available if the `getopts` feature is enabled,
    /// which it is by default.
    #[cfg(feature = "getopts")]
    pub fn from_matches(matches: &getopts::Matches) -> Result<Config, String> {
        let workers = matches
            .opt_get_default("w", 1_usize)
            .map_err(|e| e.to_string())?;
        if workers > 1 {
            Ok(Config::Process(workers))
        } else {
            Ok(Config::Thread)
        }
    }

    /// Constructs a new configuration by parsing the supplied text arguments.
    ///
    /// Most commonly, callers supply `std::env::args()` as the iterator.
    ///
    /// This method is only available if the `getopts` feature is enabled,
    /// which it is by default.
    #[cfg(feature = "getopts")]
    pub fn from_args<I: Iterator<Item = String>>(args: I) -> Result<Config, String> {
        let mut opts = getopts::Options::new();
        Config::install_options(&mut opts);
        let matches = opts.parse(args).map_err(|e| e.to_string())?;
        Config::from_matches(&matches)
    }

    /// Assembles the described communication infrastructure.
    pub fn try_build(self) -> Result<Vec<ThreadTransport>, String> {
        let ranks = self.ranks();
        if ranks == 0 {
            return Err("a world needs at least one rank".to_string());
        }
        Ok(ThreadTransport::new_vector(ranks))
    }
}

/// Initializes communication and executes a distributed computation.
///
/// This method allocates a transport endpoint for each rank, spawns worker
/// threads, and invokes the supplied function with the endpoint. The method
/// returns a [`WorkerGuards<T>`] which can be `join`ed to retrieve the
/// return values (or errors) of the workers.
///
/// # Examples
/// ```
/// use pilot_communication::{initialize, Config, Payload, Transport};
///
/// let guards = initialize(Config::Process(2), |transport| {
///     if transport.rank() == 0 {
///         transport.send(1, 1, &Payload::from_i32(17)).unwrap();
///         0
///     } else {
///         transport.recv(0, 1).unwrap().as_i32().unwrap()
///     }
/// })
/// .unwrap();
///
/// assert_eq!(guards.join().pop().unwrap().unwrap(), 17);
/// ```
pub fn initialize<T, F>(config: Config, func: F) -> Result<WorkerGuards<T>, String>
where
    T: Send + 'static,
    F: Fn(ThreadTransport) -> T + Send + Sync + 'static,
{
    let endpoints = config.try_build()?;
    initialize_from(endpoints, func)
}

/// Initializes computation from explicitly built endpoints.
pub fn initialize_from<T, F>(
    endpoints: Vec<ThreadTransport>,
    func: F,
) -> Result<WorkerGuards<T>, String>
where
    T: Send + 'static,
    F: Fn(ThreadTransport) -> T + Send + Sync + 'static,
{
    let logic = Arc::new(func);
    let mut guards = Vec::new();
    for (index, endpoint) in endpoints.into_iter().enumerate() {
        let clone = Arc::clone(&logic);
        guards.push(
            thread::Builder::new()
                .name(format!("pilot:work-{}", index))
                .spawn(move || (*clone)(endpoint))
                .map_err(|e| format!("{:?}", e))?,
        );
    }

    Ok(WorkerGuards { guards })
}

/// Maintains `JoinHandle`s for worker threads.
pub struct WorkerGuards<T: Send + 'static> {
    guards: Vec<thread::JoinHandle<T>>,
}

impl<T: Send + 'static> WorkerGuards<T> {
    /// Returns a reference to the indexed guard.
    pub fn guards(&self) -> &[thread::JoinHandle<T>] {
        &self.guards[..]
    }

    /// Waits on the worker threads and returns the results they produce.
    pub fn join(mut self) -> Vec<Result<T, String>> {
        self.guards
            .drain(..)
            .map(|guard| guard.join().map_err(|e| format!("{:?}", e)))
            .collect()
    }
}

impl<T: Send + 'static> Drop for WorkerGuards<T> {
    fn drop(&mut self) {
        for guard in self.guards.drain(..) {
            guard.join().expect("worker panic");
        }
    }
}

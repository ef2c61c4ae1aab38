//! Setup - Gang Bootstrap and Parallel Topology
//!
//! Turns a launcher environment into a usable default gang and carves that
//! gang into the data- and tensor-parallel sub-gangs of a 2D device mesh.
//!
//! # Key Features
//! - `GangContext`: an explicit snapshot of the launcher environment plus
//!   the process-lifetime default device and default gang
//! - `setup_default_gang`: single-process runs get a `LocalGang`; multi-
//!   process runs rendezvous over the TCP backend
//! - `setup_parallel_gangs`: row-major mesh split with identity and
//!   local-gang shortcuts for the degenerate shapes
//! - Intra-op thread budgeting so co-located ranks do not oversubscribe
//!   the host's cores
//!
//! @version 0.2.0
//! @author Gangway Development Team

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{info, warn};

use gangway_core::env::vars;
use gangway_core::{cuda_device_count, determine_default_device, Device, Environment, Error, Result};

use crate::backend::Backend;
use crate::gang::{Gang, LocalGang, ProcessGroupGang};
use crate::tcp::TcpBackend;

/// The default collective timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15 * 60);

// =============================================================================
// SetupOptions
// =============================================================================

/// Options controlling [`GangContext::setup_default_gang`].
#[derive(Debug, Clone)]
pub struct SetupOptions {
    device: Option<Device>,
    timeout: Duration,
    num_threads: Option<usize>,
    debug: bool,
    ok_initialized: bool,
}

impl Default for SetupOptions {
    fn default() -> Self {
        Self {
            device: None,
            timeout: DEFAULT_TIMEOUT,
            num_threads: None,
            debug: false,
            ok_initialized: false,
        }
    }
}

impl SetupOptions {
    /// Creates the default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pins the gang to `device` instead of resolving one from the
    /// environment.
    #[must_use]
    pub fn device(mut self, device: Device) -> Self {
        self.device = Some(device);
        self
    }

    /// Sets the collective timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Fixes the intra-op thread count instead of deriving a budget from
    /// the core count.
    #[must_use]
    pub fn num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = Some(num_threads);
        self
    }

    /// Attaches a debug group that fail-fast-checks rank synchronization
    /// before every collective.
    #[must_use]
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Returns the already-established default gang instead of failing
    /// when one exists.
    #[must_use]
    pub fn ok_initialized(mut self, ok_initialized: bool) -> Self {
        self.ok_initialized = ok_initialized;
        self
    }
}

// =============================================================================
// GangContext
// =============================================================================

/// Process-lifetime state of the gang layer.
///
/// Holds the environment snapshot, the lazily-resolved default device, and
/// the default gang. Production code keeps one context per process; tests
/// create as many as they need with synthetic environments.
pub struct GangContext {
    env: Environment,
    num_cuda_devices: usize,
    default_device: OnceCell<Device>,
    default_gang: Mutex<Option<Arc<ProcessGroupGang>>>,
}

impl GangContext {
    /// Creates a context from the current process environment.
    #[must_use]
    pub fn new() -> Self {
        Self::with_environment(Environment::capture())
    }

    /// Creates a context from an explicit environment snapshot.
    #[must_use]
    pub fn with_environment(env: Environment) -> Self {
        let num_cuda_devices = cuda_device_count(&env);

        Self {
            env,
            num_cuda_devices,
            default_device: OnceCell::new(),
            default_gang: Mutex::new(None),
        }
    }

    /// Returns the environment snapshot of the context.
    #[must_use]
    pub fn environment(&self) -> &Environment {
        &self.env
    }

    /// Returns the default device of the process, resolving it on first
    /// use.
    pub fn default_device(&self) -> Result<Device> {
        self.default_device
            .get_or_try_init(|| {
                let device = determine_default_device(&self.env, self.num_cuda_devices)?;
                info!(%device, "selected the default device of the process");
                Ok(device)
            })
            .copied()
    }

    /// Sets up the default gang of the process.
    ///
    /// A single-process job gets a [`LocalGang`]; a multi-process job
    /// establishes the TCP backend mesh described by the environment. The
    /// gang is established at most once per context; a second call fails
    /// with `AlreadyInitialized` unless the options say otherwise.
    pub fn setup_default_gang(&self, options: &SetupOptions) -> Result<Arc<dyn Gang>> {
        let world_size = self.env.world_size()?;

        let device = match options.device {
            Some(device) => device,
            None => self.default_device()?,
        };

        if world_size == 1 {
            info!(%device, "running as a single process; using a local gang");
            return Ok(Arc::new(LocalGang::new(device)));
        }

        let mut slot = self.default_gang.lock();

        if let Some(gang) = slot.as_ref() {
            if options.ok_initialized {
                return Ok(Arc::clone(gang) as Arc<dyn Gang>);
            }
            return Err(Error::AlreadyInitialized);
        }

        let rank = self.env.rank()?;
        if rank >= world_size {
            return Err(Error::invalid_env(
                vars::RANK,
                rank.to_string(),
                format!("must be less than the world size ({world_size})"),
            ));
        }

        self.apply_thread_budget(options)?;

        let addrs = self.env.peer_addrs(world_size)?;

        let backend: Arc<dyn Backend> = Arc::new(TcpBackend::connect(
            rank,
            world_size,
            &addrs,
            options.timeout,
        )?);

        // The primary backend already runs in host memory, so it doubles
        // as the monitored-barrier group. A device-direct backend would
        // instead stage its debug group through a separate host mesh.
        let debug_backend = options.debug.then(|| Arc::clone(&backend));

        let gang = Arc::new(ProcessGroupGang::new(
            backend,
            device,
            debug_backend,
            options.timeout,
        ));

        info!(rank, world_size, %device, "established the default gang");

        *slot = Some(Arc::clone(&gang));

        Ok(gang)
    }

    /// Caps the global intra-op thread pool so that ranks sharing a host
    /// do not oversubscribe its cores.
    fn apply_thread_budget(&self, options: &SetupOptions) -> Result<()> {
        // An explicit launcher setting always wins.
        if self.env.has(vars::RAYON_NUM_THREADS) {
            return Ok(());
        }

        let num_threads = match options.num_threads {
            Some(num_threads) => num_threads,
            None => intraop_thread_budget(self.env.local_world_size()?),
        };

        let result = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build_global();

        match result {
            Ok(()) => info!(num_threads, "capped the intra-op thread pool"),
            // The pool can only be configured once per process; a second
            // gang setup keeps the existing configuration.
            Err(_) => warn!(num_threads, "the intra-op thread pool is already configured"),
        }

        Ok(())
    }
}

impl Default for GangContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns the per-process intra-op thread budget for `num_procs` ranks
/// sharing this host: the visible core count divided evenly, never less
/// than one. The core count honors the process affinity mask.
#[must_use]
pub fn intraop_thread_budget(num_procs: usize) -> usize {
    let num_cores = std::thread::available_parallelism().map_or(1, usize::from);

    (num_cores / num_procs.max(1)).max(1)
}

// =============================================================================
// Parallel Gangs
// =============================================================================

/// The sub-gangs of a 2D parallel topology.
pub struct ParallelGangs {
    /// The data-parallel gang of this process (one mesh column).
    pub dp: Arc<dyn Gang>,
    /// The tensor-parallel gang of this process (one mesh row).
    pub tp: Arc<dyn Gang>,
}

/// Carves `root` into data- and tensor-parallel gangs.
///
/// The ranks of `root` are arranged row-major on a
/// `(size / tp_size, tp_size)` mesh: each row is a tensor-parallel gang,
/// each column a data-parallel gang. Every process receives handles to the
/// one row and one column it belongs to.
///
/// All processes of `root` must call this with the same `tp_size`; each
/// rank performs the identical sequence of `create_gang` calls, so the
/// underlying group creations stay collective.
pub fn setup_parallel_gangs(root: &Arc<dyn Gang>, tp_size: usize) -> Result<ParallelGangs> {
    if tp_size == 0 {
        return Err(Error::invalid_argument(
            "`tp_size` must be greater than 0",
        ));
    }

    let size = root.size();

    if size % tp_size != 0 {
        return Err(Error::invalid_argument(format!(
            "`tp_size` must divide the size of the gang ({size}) evenly, but is {tp_size} instead"
        )));
    }

    let dp_size = size / tp_size;
    let rank = root.rank();
    let device = root.device();

    // Degenerate shapes need no group creation: a one-member axis is a
    // local gang and a full-width axis is the root itself.
    if tp_size == 1 {
        return Ok(ParallelGangs {
            dp: Arc::clone(root),
            tp: Arc::new(LocalGang::new(device)),
        });
    }

    if tp_size == size {
        return Ok(ParallelGangs {
            dp: Arc::new(LocalGang::new(device)),
            tp: Arc::clone(root),
        });
    }

    let row = rank / tp_size;
    let col = rank % tp_size;

    info!(
        rank,
        dp_size, tp_size, row, col, "initializing the parallel gangs"
    );

    // Data-parallel gangs: one per mesh column.
    let mut dp = None;

    for mesh_col in 0..tp_size {
        let ranks: Vec<usize> = (0..dp_size).map(|r| r * tp_size + mesh_col).collect();

        let sub = root.create_gang(&ranks)?;

        if mesh_col == col {
            dp = sub;
        }
    }

    // Tensor-parallel gangs: one per mesh row.
    let mut tp = None;

    for mesh_row in 0..dp_size {
        let ranks: Vec<usize> = (0..tp_size).map(|c| mesh_row * tp_size + c).collect();

        let sub = root.create_gang(&ranks)?;

        if mesh_row == row {
            tp = sub;
        }
    }

    let dp = dp.ok_or_else(|| {
        Error::internal("the data-parallel gang of the process was not created")
    })?;
    let tp = tp.ok_or_else(|| {
        Error::internal("the tensor-parallel gang of the process was not created")
    })?;

    Ok(ParallelGangs { dp, tp })
}

// =============================================================================
// Tests
// =============================================================================

//! Gangway - Process Gangs for Distributed Training
//!
//! Gangway gives training code one opaque handle, the gang, over the set
//! of processes it cooperates with. A single-process run and a thousand-
//! rank job share the same code path: collectives on a local gang are
//! no-ops, collectives on a distributed gang move data over the
//! communication backend behind it.
//!
//! # Key Features
//! - `Gang` trait with barrier, all-reduce, all-gather, and broadcast
//!   collectives, plus collective sub-gang creation
//! - Environment-driven bootstrap: `GangContext::setup_default_gang` reads
//!   the launcher variables and establishes the right gang
//! - 2D mesh splitting: `setup_parallel_gangs` carves a root gang into
//!   data- and tensor-parallel sub-gangs
//! - TCP backend for multi-process meshes, thread backend for multi-rank
//!   unit tests
//!
//! # Example
//! ```rust,no_run
//! use gangway::{GangContext, ReduceOp, SetupOptions};
//!
//! fn main() -> gangway::Result<()> {
//!     let context = GangContext::new();
//!     let gang = context.setup_default_gang(&SetupOptions::default())?;
//!
//!     let mut grads = vec![0.5; 1024];
//!     gang.all_reduce(&mut grads, ReduceOp::Mean)?;
//!
//!     gang.close()
//! }
//! ```
//!
//! @version 0.2.0
//! @author Gangway Development Team

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::uninlined_format_args)]

// =============================================================================
// Modules
// =============================================================================

pub mod backend;
pub mod gang;
pub mod setup;
pub mod tcp;

// =============================================================================
// Re-exports
// =============================================================================

pub use backend::{Backend, ReduceOp, ThreadBackend, THREAD_BACKEND_TIMEOUT};
pub use gang::{broadcast_values, Gang, GangInfo, LocalGang, ProcessGroupGang};
pub use setup::{
    intraop_thread_budget, setup_parallel_gangs, GangContext, ParallelGangs, SetupOptions,
    DEFAULT_TIMEOUT,
};
pub use tcp::TcpBackend;

pub use gangway_core::{Device, Environment, Error, Result};

// =============================================================================
// Prelude
// =============================================================================

/// Convenient imports for common usage.
pub mod prelude {
    pub use crate::backend::{Backend, ReduceOp};
    pub use crate::gang::{broadcast_values, Gang, LocalGang, ProcessGroupGang};
    pub use crate::setup::{setup_parallel_gangs, GangContext, ParallelGangs, SetupOptions};
    pub use gangway_core::{Device, Environment, Error, Result};
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_process_workflow() {
        let context = GangContext::with_environment(Environment::from_vars::<_, String, String>(
            [],
        ));

        let gang = context
            .setup_default_gang(&SetupOptions::default())
            .unwrap();

        gang.barrier().unwrap();

        let mut grads = vec![0.25; 8];
        gang.all_reduce(&mut grads, ReduceOp::Mean).unwrap();
        assert_eq!(grads, vec![0.25; 8]);

        let gangs = setup_parallel_gangs(&gang, 1).unwrap();
        assert_eq!(gangs.dp.size(), 1);
        assert_eq!(gangs.tp.size(), 1);

        gang.close().unwrap();
    }
}

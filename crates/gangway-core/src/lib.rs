//! Gangway Core - Foundation Layer for the Gangway Toolkit
//!
//! This crate provides the abstractions shared by the Gangway process-gang
//! layer: compute-device identification, the launcher environment snapshot,
//! and the unified error taxonomy.
//!
//! # Key Features
//! - Device identifier abstraction (CPU, CUDA) with launcher-driven
//!   default-device selection
//! - Typed, validated access to launcher environment variables
//! - Unified error type with diagnosable, value-naming messages
//!
//! # Example
//! ```rust
//! use gangway_core::{Device, Environment};
//!
//! let env = Environment::from_vars([("WORLD_SIZE", "4"), ("RANK", "1")]);
//! assert_eq!(env.world_size().unwrap(), 4);
//! assert_eq!(Device::default(), Device::Cpu);
//! ```
//!
//! @version 0.2.0
//! @author Gangway Development Team

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::uninlined_format_args)]

// =============================================================================
// Modules
// =============================================================================

pub mod device;
pub mod env;
pub mod error;

// =============================================================================
// Re-exports
// =============================================================================

pub use device::{cuda_device_count, determine_default_device, Device};
pub use env::Environment;
pub use error::{Error, Result};

// =============================================================================
// Prelude
// =============================================================================

/// Convenient imports for common usage.
pub mod prelude {
    pub use crate::device::Device;
    pub use crate::env::Environment;
    pub use crate::error::{Error, Result};
}

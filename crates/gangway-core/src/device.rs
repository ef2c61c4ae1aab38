//! Device Abstraction - Compute Device Identification
//!
//! Provides the device identifier associated with each process of a gang and
//! the policy that picks a default device from the launcher environment.
//! Tensor computation itself lives in an external library; Gangway only
//! needs to know *which* device a process owns so that collectives can be
//! routed over an appropriate transport.
//!
//! # Example
//! ```rust
//! use gangway_core::Device;
//!
//! let device: Device = "cuda:1".parse().unwrap();
//! assert_eq!(device, Device::Cuda(1));
//! assert_eq!(device.to_string(), "cuda:1");
//! ```
//!
//! @version 0.2.0
//! @author Gangway Development Team

use core::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::env::{vars, Environment};
use crate::error::{Error, Result};

// =============================================================================
// Device Enum
// =============================================================================

/// Identifies the compute device associated with the local process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    /// CPU device (always available).
    Cpu,

    /// NVIDIA CUDA GPU device with device index.
    Cuda(usize),
}

impl Device {
    /// Returns true if this is a CPU device.
    #[must_use]
    pub const fn is_cpu(self) -> bool {
        matches!(self, Self::Cpu)
    }

    /// Returns true if this is a CUDA device.
    #[must_use]
    pub const fn is_cuda(self) -> bool {
        matches!(self, Self::Cuda(_))
    }

    /// Returns the device index for CUDA devices, or 0 for CPU.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Cpu => 0,
            Self::Cuda(idx) => idx,
        }
    }

    /// Returns the name of this device type.
    #[must_use]
    pub const fn device_type(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Cuda(_) => "cuda",
        }
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::Cpu
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda(idx) => write!(f, "cuda:{idx}"),
        }
    }
}

impl FromStr for Device {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cpu" => Ok(Self::Cpu),
            "cuda" => Ok(Self::Cuda(0)),
            _ => {
                let index = s
                    .strip_prefix("cuda:")
                    .and_then(|idx| idx.parse::<usize>().ok());
                match index {
                    Some(idx) => Ok(Self::Cuda(idx)),
                    None => Err(Error::invalid_argument(format!(
                        "`{s}` is not a valid device identifier; expected `cpu`, `cuda`, or `cuda:<index>`"
                    ))),
                }
            }
        }
    }
}

// =============================================================================
// Device Discovery
// =============================================================================

/// Returns the number of CUDA devices visible to this process.
///
/// Devices are detected through the NVIDIA driver's procfs interface and
/// capped by the `CUDA_VISIBLE_DEVICES` list; an empty list hides all
/// devices. Returns 0 on hosts without the driver.
#[must_use]
pub fn cuda_device_count(env: &Environment) -> usize {
    let detected = installed_cuda_devices();
    if detected == 0 {
        return 0;
    }

    let visible = match env.cuda_visible_devices() {
        None => detected,
        Some("") => 0,
        Some(list) => detected.min(list.split(',').count()),
    };

    tracing::debug!(detected, visible, "probed cuda devices");

    visible
}

fn installed_cuda_devices() -> usize {
    match Path::new("/proc/driver/nvidia/gpus").read_dir() {
        Ok(entries) => entries.count(),
        Err(_) => 0,
    }
}

// =============================================================================
// Default Device Selection
// =============================================================================

/// Determines the default device of the process from the environment.
///
/// The policy, in order:
/// 1. An explicit `GANGWAY_DEVICE` override.
/// 2. If CUDA devices are present: a single-integer `CUDA_VISIBLE_DEVICES`
///    pins device index 0; otherwise `LOCAL_RANK` selects the index; with
///    neither signal, index 0 is used only when the host runs a single
///    process or exposes a single device.
/// 3. The CPU.
///
/// Callers cache the result for the lifetime of the process; this function
/// itself is pure.
pub fn determine_default_device(env: &Environment, num_cuda_devices: usize) -> Result<Device> {
    if let Some(s) = env.device_override() {
        return s.parse::<Device>().map_err(|_| {
            Error::invalid_env(
                vars::DEVICE,
                s,
                "must specify a valid device identifier (`cpu`, `cuda`, or `cuda:<index>`)",
            )
        });
    }

    if num_cuda_devices > 0 {
        return determine_default_cuda_device(env, num_cuda_devices);
    }

    Ok(Device::Cpu)
}

fn determine_default_cuda_device(env: &Environment, num_devices: usize) -> Result<Device> {
    if let Some(visible) = env.cuda_visible_devices() {
        // A single-integer visibility list leaves exactly one device, which
        // the driver exposes as index 0.
        if visible.trim().parse::<i64>().is_ok() {
            return Ok(Device::Cuda(0));
        }
    }

    let idx = device_index(env, num_devices)?;

    Ok(Device::Cuda(idx))
}

fn device_index(env: &Environment, num_devices: usize) -> Result<usize> {
    debug_assert!(num_devices > 0);

    match env.local_rank()? {
        Some(idx) if idx >= num_devices => Err(Error::invalid_env(
            vars::LOCAL_RANK,
            idx.to_string(),
            format!("must be less than the number of available `cuda` devices ({num_devices})"),
        )),
        Some(idx) => Ok(idx),
        None => {
            let num_procs = env.local_world_size()?;
            if num_procs > 1 && num_devices > 1 {
                return Err(Error::ambiguous(format!(
                    "the default `cuda` device cannot be determined; there are {num_devices} devices available, but the `{}` environment variable is not set",
                    vars::LOCAL_RANK
                )));
            }
            Ok(0)
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

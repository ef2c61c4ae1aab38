//! Environment - Launcher Configuration Snapshot
//!
//! Captures the environment variables set by a distributed launcher into an
//! immutable snapshot and exposes typed, validated accessors. Keeping the
//! variables in an explicit snapshot (instead of scattered `std::env::var`
//! reads) lets tests supply their own configuration without mutating the
//! process environment.
//!
//! @version 0.2.0
//! @author Gangway Development Team

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};

use crate::error::{Error, Result};

// =============================================================================
// Variable Names
// =============================================================================

/// Names of the environment variables consumed by Gangway.
pub mod vars {
    /// Total process count of the running job.
    pub const WORLD_SIZE: &str = "WORLD_SIZE";
    /// Global rank of this process.
    pub const RANK: &str = "RANK";
    /// Number of processes sharing this host.
    pub const LOCAL_WORLD_SIZE: &str = "LOCAL_WORLD_SIZE";
    /// Rank of this process within its host.
    pub const LOCAL_RANK: &str = "LOCAL_RANK";
    /// Explicit device override string.
    pub const DEVICE: &str = "GANGWAY_DEVICE";
    /// Accelerator visibility list.
    pub const CUDA_VISIBLE_DEVICES: &str = "CUDA_VISIBLE_DEVICES";
    /// Comma-separated `host:port` rendezvous address per rank.
    pub const PEERS: &str = "GANGWAY_PEERS";
    /// Rendezvous host used when no peer list is given.
    pub const MASTER_ADDR: &str = "MASTER_ADDR";
    /// Base rendezvous port; rank `i` listens on `MASTER_PORT + i`.
    pub const MASTER_PORT: &str = "MASTER_PORT";
    /// When set, the intra-op thread budget is left untouched.
    pub const RAYON_NUM_THREADS: &str = "RAYON_NUM_THREADS";
}

/// The rendezvous host used when `MASTER_ADDR` is not set.
pub const DEFAULT_MASTER_ADDR: &str = "127.0.0.1";

/// The base rendezvous port used when `MASTER_PORT` is not set.
pub const DEFAULT_MASTER_PORT: u16 = 29500;

// =============================================================================
// Environment
// =============================================================================

/// An immutable snapshot of launcher-provided environment variables.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    variables: HashMap<String, String>,
}

impl Environment {
    /// Captures the current process environment.
    #[must_use]
    pub fn capture() -> Self {
        Self {
            variables: std::env::vars().collect(),
        }
    }

    /// Creates a snapshot from explicit name/value pairs.
    pub fn from_vars<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            variables: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Returns the raw value of a variable, if set.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(String::as_str)
    }

    /// Returns true if the variable is set, regardless of its value.
    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    // =========================================================================
    // Typed Accessors
    // =========================================================================

    /// Returns the world size of the running job. Defaults to 1.
    pub fn world_size(&self) -> Result<usize> {
        Ok(self.positive_int(vars::WORLD_SIZE)?.unwrap_or(1))
    }

    /// Returns the global rank of this process. Defaults to 0.
    pub fn rank(&self) -> Result<usize> {
        Ok(self.non_negative_int(vars::RANK)?.unwrap_or(0))
    }

    /// Returns the local world size of the running job. Defaults to 1.
    pub fn local_world_size(&self) -> Result<usize> {
        Ok(self.positive_int(vars::LOCAL_WORLD_SIZE)?.unwrap_or(1))
    }

    /// Returns the local rank of this process, if set.
    pub fn local_rank(&self) -> Result<Option<usize>> {
        self.non_negative_int(vars::LOCAL_RANK)
    }

    /// Returns the raw device override string, if set. Parsing into a
    /// device identifier is done by the device layer.
    #[must_use]
    pub fn device_override(&self) -> Option<&str> {
        self.get(vars::DEVICE)
    }

    /// Returns the raw accelerator visibility list, if set.
    #[must_use]
    pub fn cuda_visible_devices(&self) -> Option<&str> {
        self.get(vars::CUDA_VISIBLE_DEVICES)
    }

    /// Resolves the rendezvous address of every rank.
    ///
    /// `GANGWAY_PEERS` takes precedence and must list one `host:port` entry
    /// per rank. Otherwise rank `i` is assumed to listen on
    /// `MASTER_ADDR:MASTER_PORT + i`, which is only correct for single-host
    /// jobs; multi-host jobs must set the peer list.
    pub fn peer_addrs(&self, world_size: usize) -> Result<Vec<SocketAddr>> {
        if let Some(list) = self.get(vars::PEERS) {
            let entries: Vec<&str> = list.split(',').map(str::trim).collect();
            if entries.len() != world_size {
                return Err(Error::invalid_env(
                    vars::PEERS,
                    list,
                    format!("must list one `host:port` address per rank ({world_size} entries)"),
                ));
            }

            return entries
                .iter()
                .map(|entry| resolve_addr(vars::PEERS, entry))
                .collect();
        }

        let host = self.get(vars::MASTER_ADDR).unwrap_or(DEFAULT_MASTER_ADDR);

        let base_port = match self.get(vars::MASTER_PORT) {
            None => DEFAULT_MASTER_PORT,
            Some(s) => s.parse::<u16>().map_err(|_| {
                Error::invalid_env(vars::MASTER_PORT, s, "must be a TCP port number")
            })?,
        };

        (0..world_size)
            .map(|rank| {
                let port = u32::from(base_port) + rank as u32;
                if port > u32::from(u16::MAX) {
                    return Err(Error::invalid_env(
                        vars::MASTER_PORT,
                        base_port.to_string(),
                        format!("must leave room for one port per rank ({world_size} ranks)"),
                    ));
                }
                resolve_addr(vars::MASTER_ADDR, &format!("{host}:{port}"))
            })
            .collect()
    }

    // =========================================================================
    // Parsing Helpers
    // =========================================================================

    fn int(&self, name: &str) -> Result<Option<i64>> {
        let Some(s) = self.get(name) else {
            return Ok(None);
        };

        s.parse::<i64>()
            .map(Some)
            .map_err(|_| Error::invalid_env(name, s, "must be an integer"))
    }

    fn positive_int(&self, name: &str) -> Result<Option<usize>> {
        match self.int(name)? {
            None => Ok(None),
            Some(value) if value >= 1 => Ok(Some(value as usize)),
            Some(value) => Err(Error::invalid_env(
                name,
                value.to_string(),
                "must be greater than 0",
            )),
        }
    }

    fn non_negative_int(&self, name: &str) -> Result<Option<usize>> {
        match self.int(name)? {
            None => Ok(None),
            Some(value) if value >= 0 => Ok(Some(value as usize)),
            Some(value) => Err(Error::invalid_env(
                name,
                value.to_string(),
                "must be greater than or equal to 0",
            )),
        }
    }
}

fn resolve_addr(var: &str, entry: &str) -> Result<SocketAddr> {
    entry
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| Error::invalid_env(var, entry, "must resolve to a socket address"))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_world_size_defaults_to_one() {
        let env = Environment::from_vars::<_, String, String>([]);
        assert_eq!(env.world_size().unwrap(), 1);
        assert_eq!(env.rank().unwrap(), 0);
        assert_eq!(env.local_world_size().unwrap(), 1);
        assert_eq!(env.local_rank().unwrap(), None);
    }

    #[test]
    fn test_world_size_parses() {
        let env = Environment::from_vars([(vars::WORLD_SIZE, "8"), (vars::RANK, "3")]);
        assert_eq!(env.world_size().unwrap(), 8);
        assert_eq!(env.rank().unwrap(), 3);
    }

    #[test]
    fn test_negative_rank_is_rejected() {
        let env = Environment::from_vars([(vars::RANK, "-1")]);
        let err = env.rank().unwrap_err();
        match err {
            Error::InvalidEnvironment { var, value, .. } => {
                assert_eq!(var, "RANK");
                assert_eq!(value, "-1");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_zero_world_size_is_rejected() {
        let env = Environment::from_vars([(vars::WORLD_SIZE, "0")]);
        assert!(matches!(
            env.world_size(),
            Err(Error::InvalidEnvironment { .. })
        ));
    }

    #[test]
    fn test_non_integer_value_is_rejected() {
        let env = Environment::from_vars([(vars::LOCAL_WORLD_SIZE, "two")]);
        let err = env.local_world_size().unwrap_err();
        assert!(err.to_string().contains("LOCAL_WORLD_SIZE"));
        assert!(err.to_string().contains("two"));
    }

    #[test]
    fn test_peer_addrs_from_master_port() {
        let env = Environment::from_vars([(vars::MASTER_PORT, "29600")]);
        let addrs = env.peer_addrs(3).unwrap();
        assert_eq!(addrs.len(), 3);
        assert_eq!(addrs[0].port(), 29600);
        assert_eq!(addrs[2].port(), 29602);
    }

    #[test]
    fn test_peer_addrs_from_peer_list() {
        let env = Environment::from_vars([(
            vars::PEERS,
            "127.0.0.1:4000, 127.0.0.1:5000",
        )]);
        let addrs = env.peer_addrs(2).unwrap();
        assert_eq!(addrs[1].port(), 5000);
    }

    #[test]
    fn test_peer_list_length_mismatch_is_rejected() {
        let env = Environment::from_vars([(vars::PEERS, "127.0.0.1:4000")]);
        assert!(matches!(
            env.peer_addrs(2),
            Err(Error::InvalidEnvironment { .. })
        ));
    }
}

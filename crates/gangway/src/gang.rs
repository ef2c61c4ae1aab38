//! Gang - Process-Group Handle for Collective Communication
//!
//! A gang is an opaque handle to a set of processes that cooperate through
//! collective operations. Training code holds `Arc<dyn Gang>` values and
//! never needs to know whether the ranks live on one machine or many.
//!
//! # Key Features
//! - `LocalGang`: a size-1 gang whose collectives are no-ops, letting
//!   single-process runs share the code path of distributed runs
//! - `ProcessGroupGang`: a gang backed by a communication backend, with an
//!   optional debug group that fail-fast-checks rank synchronization before
//!   every collective
//! - `broadcast_values`: typed object broadcast over the byte collective
//!
//! @version 0.2.0
//! @author Gangway Development Team

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use gangway_core::{Device, Error, Result};

use crate::backend::{Backend, ReduceOp};

// =============================================================================
// GangInfo
// =============================================================================

/// The immutable identity of a gang member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GangInfo {
    /// Rank of this process within the gang.
    pub rank: usize,
    /// Number of processes in the gang.
    pub size: usize,
    /// Device on which this process performs its computation.
    pub device: Device,
}

// =============================================================================
// Gang Trait
// =============================================================================

/// A set of processes that work collectively.
///
/// Collectives block until the operation completes on the calling rank,
/// which requires every member to issue the equivalent call; all members
/// must issue collectives on the same gang in the same relative order.
pub trait Gang: Send + Sync {
    /// Returns the rank of this process in the gang.
    fn rank(&self) -> usize;

    /// Returns the number of processes in the gang.
    fn size(&self) -> usize;

    /// Returns the device on which this process operates.
    fn device(&self) -> Device;

    /// Closes and destroys the gang.
    fn close(&self) -> Result<()>;

    /// Makes a new gang from the members at `ranks`.
    ///
    /// All members of this gang must call `create_gang` with the same
    /// `ranks` list, in the same order relative to other collectives. A
    /// caller that is not listed in `ranks` participates in the collective
    /// bookkeeping and receives `Ok(None)`.
    fn create_gang(&self, ranks: &[usize]) -> Result<Option<Arc<dyn Gang>>>;

    /// Returns the communication backend of the gang, or
    /// `UnsupportedOperation` if the gang is not backed by one.
    fn as_backend(&self) -> Result<Arc<dyn Backend>>;

    /// Synchronizes all processes of the gang.
    fn barrier(&self) -> Result<()>;

    /// Reduces `data` across all processes; every rank receives the
    /// identical combined result.
    fn all_reduce(&self, data: &mut [f32], op: ReduceOp) -> Result<()>;

    /// Gathers `input` from all processes into `output` in rank order.
    /// `output` must hold exactly `size()` times `input`'s length.
    fn all_gather(&self, output: &mut [f32], input: &[f32]) -> Result<()>;

    /// Gathers `input` from all processes into one slot of `output` per
    /// rank. `output` must hold exactly `size()` slots.
    fn all_gather_to_list(&self, output: &mut [Vec<f32>], input: &[f32]) -> Result<()>;

    /// Replaces `data` on every rank with the bytes held by `source_rank`.
    fn broadcast_bytes(&self, data: &mut Vec<u8>, source_rank: usize) -> Result<()>;
}

/// Validates a `create_gang` rank list against the gang size.
pub(crate) fn validate_ranks(ranks: &[usize], size: usize) -> Result<()> {
    if ranks.is_empty() {
        return Err(Error::invalid_argument(
            "`ranks` must contain at least one rank",
        ));
    }

    for (idx, &rank) in ranks.iter().enumerate() {
        if rank >= size {
            return Err(Error::invalid_argument(format!(
                "the rank at index {idx} of `ranks` must be less than the size of the gang ({size}), but is {rank} instead"
            )));
        }

        if ranks[..idx].contains(&rank) {
            return Err(Error::invalid_argument(format!(
                "the rank at index {idx} of `ranks` must be unique, but {rank} appears more than once"
            )));
        }
    }

    Ok(())
}

// =============================================================================
// LocalGang
// =============================================================================

/// A gang of one process, for non-distributed runs.
///
/// Collectives complete immediately; the data-moving ones copy the local
/// contribution into the output, so callers observe the same semantics a
/// real size-1 group would provide.
#[derive(Debug, Clone)]
pub struct LocalGang {
    device: Device,
}

impl LocalGang {
    /// Creates a local gang on `device`.
    #[must_use]
    pub fn new(device: Device) -> Self {
        Self { device }
    }
}

impl Default for LocalGang {
    fn default() -> Self {
        Self::new(Device::Cpu)
    }
}

impl Gang for LocalGang {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn device(&self) -> Device {
        self.device
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn create_gang(&self, ranks: &[usize]) -> Result<Option<Arc<dyn Gang>>> {
        validate_ranks(ranks, 1)?;

        Ok(Some(Arc::new(Self::new(self.device))))
    }

    fn as_backend(&self) -> Result<Arc<dyn Backend>> {
        Err(Error::unsupported(
            "a local gang does not own a communication backend",
        ))
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }

    fn all_reduce(&self, _data: &mut [f32], _op: ReduceOp) -> Result<()> {
        Ok(())
    }

    fn all_gather(&self, output: &mut [f32], input: &[f32]) -> Result<()> {
        if output.len() != input.len() {
            return Err(Error::invalid_argument(format!(
                "`output` must hold {} elements for a gang of size 1, but holds {} instead",
                input.len(),
                output.len()
            )));
        }

        output.copy_from_slice(input);

        Ok(())
    }

    fn all_gather_to_list(&self, output: &mut [Vec<f32>], input: &[f32]) -> Result<()> {
        if output.len() != 1 {
            return Err(Error::invalid_argument(format!(
                "`output` must hold one slot for a gang of size 1, but holds {} instead",
                output.len()
            )));
        }

        output[0] = input.to_vec();

        Ok(())
    }

    fn broadcast_bytes(&self, _data: &mut Vec<u8>, source_rank: usize) -> Result<()> {
        if source_rank != 0 {
            return Err(Error::invalid_argument(format!(
                "`source_rank` must be 0 for a gang of size 1, but is {source_rank} instead"
            )));
        }

        Ok(())
    }
}

// =============================================================================
// ProcessGroupGang
// =============================================================================

/// A gang backed by a communication backend.
///
/// When constructed with a debug group, every collective is preceded by a
/// monitored barrier on that group, so a desynchronized rank is reported
/// as a `CollectiveTimeout` naming the stalled operation instead of an
/// opaque hang inside the transport.
pub struct ProcessGroupGang {
    info: GangInfo,
    backend: Arc<dyn Backend>,
    debug_backend: Option<Arc<dyn Backend>>,
    timeout: Duration,
}

impl ProcessGroupGang {
    /// Wraps an established backend without debug checks, using the
    /// default collective timeout.
    #[must_use]
    pub fn from_backend(backend: Arc<dyn Backend>, device: Device) -> Self {
        Self::new(backend, device, None, crate::setup::DEFAULT_TIMEOUT)
    }

    /// Wraps an established backend with an optional debug group and an
    /// explicit collective timeout.
    #[must_use]
    pub fn new(
        backend: Arc<dyn Backend>,
        device: Device,
        debug_backend: Option<Arc<dyn Backend>>,
        timeout: Duration,
    ) -> Self {
        let info = GangInfo {
            rank: backend.rank(),
            size: backend.world_size(),
            device,
        };

        Self {
            info,
            backend,
            debug_backend,
            timeout,
        }
    }

    /// Returns the collective timeout of the gang.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Runs the synchronization check on the debug group, if present.
    fn collective_guard(&self, operation: &str) -> Result<()> {
        if let Some(debug) = &self.debug_backend {
            debug!(operation, rank = self.info.rank, "checking rank synchronization");
            debug.monitored_barrier(self.timeout)?;
        }

        Ok(())
    }
}

impl Gang for ProcessGroupGang {
    fn rank(&self) -> usize {
        self.info.rank
    }

    fn size(&self) -> usize {
        self.info.size
    }

    fn device(&self) -> Device {
        self.info.device
    }

    fn close(&self) -> Result<()> {
        if let Some(debug) = &self.debug_backend {
            if !Arc::ptr_eq(debug, &self.backend) {
                debug.close()?;
            }
        }

        self.backend.close()
    }

    fn create_gang(&self, ranks: &[usize]) -> Result<Option<Arc<dyn Gang>>> {
        validate_ranks(ranks, self.info.size)?;

        self.collective_guard("create_gang")?;

        let sub_backend = self.backend.split(ranks)?;

        // The debug group must be split uniformly even by non-members, so
        // every rank advances its split bookkeeping in lockstep.
        let sub_debug = match &self.debug_backend {
            Some(debug) if !Arc::ptr_eq(debug, &self.backend) => debug.split(ranks)?,
            Some(_) => sub_backend.clone(),
            None => None,
        };

        let Some(sub_backend) = sub_backend else {
            return Ok(None);
        };

        Ok(Some(Arc::new(Self::new(
            sub_backend,
            self.info.device,
            sub_debug,
            self.timeout,
        ))))
    }

    fn as_backend(&self) -> Result<Arc<dyn Backend>> {
        Ok(Arc::clone(&self.backend))
    }

    fn barrier(&self) -> Result<()> {
        self.collective_guard("barrier")?;

        self.backend.barrier()
    }

    fn all_reduce(&self, data: &mut [f32], op: ReduceOp) -> Result<()> {
        self.collective_guard("all_reduce")?;

        self.backend.all_reduce(data, op)
    }

    fn all_gather(&self, output: &mut [f32], input: &[f32]) -> Result<()> {
        let expected = input.len() * self.info.size;
        if output.len() != expected {
            return Err(Error::invalid_argument(format!(
                "`output` must hold {expected} elements ({} per rank), but holds {} instead",
                input.len(),
                output.len()
            )));
        }

        self.collective_guard("all_gather")?;

        self.backend.all_gather(input, output)
    }

    fn all_gather_to_list(&self, output: &mut [Vec<f32>], input: &[f32]) -> Result<()> {
        if output.len() != self.info.size {
            return Err(Error::invalid_argument(format!(
                "`output` must hold one slot per rank ({}), but holds {} instead",
                self.info.size,
                output.len()
            )));
        }

        self.collective_guard("all_gather")?;

        // Zero-length inputs gather into zero-length slots without touching
        // the transport.
        if input.is_empty() {
            for slot in output.iter_mut() {
                slot.clear();
            }
            return Ok(());
        }

        let mut flat = vec![0.0; input.len() * self.info.size];
        self.backend.all_gather(input, &mut flat)?;

        for (slot, chunk) in output.iter_mut().zip(flat.chunks_exact(input.len())) {
            *slot = chunk.to_vec();
        }

        Ok(())
    }

    fn broadcast_bytes(&self, data: &mut Vec<u8>, source_rank: usize) -> Result<()> {
        if source_rank >= self.info.size {
            return Err(Error::invalid_argument(format!(
                "`source_rank` must be less than the size of the gang ({}), but is {source_rank} instead",
                self.info.size
            )));
        }

        self.collective_guard("broadcast")?;

        self.backend.broadcast_bytes(data, source_rank)
    }
}

// =============================================================================
// Typed Broadcast
// =============================================================================

/// Broadcasts `values` from `source_rank` to all processes of `gang`.
///
/// On the source rank, `values` holds the objects to send; on every other
/// rank, `values` is overwritten element-wise with the received objects.
/// All ranks must pass the same number of slots.
pub fn broadcast_values<T>(gang: &dyn Gang, values: &mut [T], source_rank: usize) -> Result<()>
where
    T: Serialize + DeserializeOwned,
{
    let mut data = if gang.rank() == source_rank {
        serde_json::to_vec(&values).map_err(|err| {
            Error::communication(format!("failed to serialize broadcast payload: {err}"))
        })?
    } else {
        Vec::new()
    };

    gang.broadcast_bytes(&mut data, source_rank)?;

    if gang.rank() != source_rank {
        let received: Vec<T> = serde_json::from_slice(&data).map_err(|err| {
            Error::communication(format!("failed to deserialize broadcast payload: {err}"))
        })?;

        if received.len() != values.len() {
            return Err(Error::invalid_argument(format!(
                "`values` must hold {} slots to match the source rank, but holds {} instead",
                received.len(),
                values.len()
            )));
        }

        for (slot, value) in values.iter_mut().zip(received) {
            *slot = value;
        }
    }

    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ThreadBackend;
    use std::thread;

    fn run_gang_world<F>(world_size: usize, f: F)
    where
        F: Fn(Arc<ProcessGroupGang>) + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let handles: Vec<_> = ThreadBackend::create_world(world_size)
            .into_iter()
            .map(|backend| {
                let f = Arc::clone(&f);
                thread::spawn(move || {
                    let gang = Arc::new(ProcessGroupGang::from_backend(
                        Arc::new(backend),
                        Device::Cpu,
                    ));
                    f(gang);
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_local_gang_identity() {
        let gang = LocalGang::new(Device::Cpu);
        assert_eq!(gang.rank(), 0);
        assert_eq!(gang.size(), 1);
        assert_eq!(gang.device(), Device::Cpu);
        gang.barrier().unwrap();
        gang.close().unwrap();
    }

    #[test]
    fn test_local_gang_all_reduce_is_identity() {
        let gang = LocalGang::default();
        let mut data = vec![3.0, -1.0];
        gang.all_reduce(&mut data, ReduceOp::Sum).unwrap();
        assert_eq!(data, vec![3.0, -1.0]);
    }

    #[test]
    fn test_local_gang_all_gather_copies_input() {
        let gang = LocalGang::default();

        let mut output = vec![0.0; 3];
        gang.all_gather(&mut output, &[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(output, vec![1.0, 2.0, 3.0]);

        let mut slots = vec![Vec::new()];
        gang.all_gather_to_list(&mut slots, &[4.0, 5.0]).unwrap();
        assert_eq!(slots, vec![vec![4.0, 5.0]]);
    }

    #[test]
    fn test_local_gang_rejects_mismatched_output() {
        let gang = LocalGang::default();

        let mut output = vec![0.0; 2];
        assert!(matches!(
            gang.all_gather(&mut output, &[1.0]),
            Err(Error::InvalidArgument { .. })
        ));

        let mut slots = vec![Vec::new(), Vec::new()];
        assert!(matches!(
            gang.all_gather_to_list(&mut slots, &[1.0]),
            Err(Error::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_local_gang_broadcast_requires_source_zero() {
        let gang = LocalGang::default();

        let mut data = b"state".to_vec();
        gang.broadcast_bytes(&mut data, 0).unwrap();
        assert_eq!(data, b"state");

        assert!(matches!(
            gang.broadcast_bytes(&mut data, 1),
            Err(Error::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_local_gang_create_gang() {
        let gang = LocalGang::new(Device::Cpu);

        let sub = gang.create_gang(&[0]).unwrap().unwrap();
        assert_eq!(sub.size(), 1);
        assert_eq!(sub.device(), Device::Cpu);

        assert!(matches!(
            gang.create_gang(&[1]),
            Err(Error::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_local_gang_has_no_backend() {
        let gang = LocalGang::default();
        assert!(matches!(
            gang.as_backend(),
            Err(Error::UnsupportedOperation { .. })
        ));
    }

    #[test]
    fn test_validate_ranks() {
        validate_ranks(&[0, 2, 1], 3).unwrap();
        assert!(validate_ranks(&[], 3).is_err());
        assert!(validate_ranks(&[3], 3).is_err());

        let err = validate_ranks(&[0, 1, 0], 3).unwrap_err();
        assert!(err.to_string().contains("index 2"));
    }

    #[test]
    fn test_process_group_gang_collectives() {
        run_gang_world(4, |gang| {
            let rank = gang.rank();
            assert_eq!(gang.size(), 4);

            gang.barrier().unwrap();

            let mut data = vec![rank as f32 + 1.0];
            gang.all_reduce(&mut data, ReduceOp::Product).unwrap();
            assert_eq!(data, vec![24.0]);

            let mut output = vec![0.0; 4];
            gang.all_gather(&mut output, &[rank as f32]).unwrap();
            assert_eq!(output, vec![0.0, 1.0, 2.0, 3.0]);

            let mut slots = vec![Vec::new(); 4];
            gang.all_gather_to_list(&mut slots, &[rank as f32]).unwrap();
            assert_eq!(slots[2], vec![2.0]);
        });
    }

    #[test]
    fn test_process_group_gang_rejects_short_output() {
        run_gang_world(2, |gang| {
            // Validation happens before the collective, so both ranks fail
            // locally and no rendezvous is left half-entered.
            let mut output = vec![0.0; 3];
            assert!(matches!(
                gang.all_gather(&mut output, &[1.0, 2.0]),
                Err(Error::InvalidArgument { .. })
            ));
        });
    }

    #[test]
    fn test_create_gang_returns_none_for_non_members() {
        run_gang_world(4, |gang| {
            let rank = gang.rank();

            let evens = gang.create_gang(&[0, 2]).unwrap();
            let odds = gang.create_gang(&[1, 3]).unwrap();

            let sub = if rank % 2 == 0 {
                assert!(odds.is_none());
                evens.unwrap()
            } else {
                assert!(evens.is_none());
                odds.unwrap()
            };

            assert_eq!(sub.size(), 2);
            assert_eq!(sub.rank(), rank / 2);

            let mut data = vec![rank as f32];
            sub.all_reduce(&mut data, ReduceOp::Sum).unwrap();
            let expected = if rank % 2 == 0 { 2.0 } else { 4.0 };
            assert_eq!(data, vec![expected]);
        });
    }

    #[test]
    fn test_debug_group_guards_collectives() {
        let f = Arc::new(|gang: Arc<ProcessGroupGang>| {
            let mut data = vec![gang.rank() as f32];
            gang.all_reduce(&mut data, ReduceOp::Sum).unwrap();
            assert_eq!(data, vec![1.0]);
            gang.barrier().unwrap();
        });

        let handles: Vec<_> = ThreadBackend::create_world(2)
            .into_iter()
            .map(|backend| {
                let f = Arc::clone(&f);
                thread::spawn(move || {
                    let backend: Arc<dyn Backend> = Arc::new(backend);
                    let gang = Arc::new(ProcessGroupGang::new(
                        Arc::clone(&backend),
                        Device::Cpu,
                        Some(backend),
                        Duration::from_secs(5),
                    ));
                    f(gang);
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_broadcast_values_round_trip() {
        run_gang_world(3, |gang| {
            let mut values = if gang.rank() == 1 {
                vec!["alpha".to_string(), "beta".to_string()]
            } else {
                vec![String::new(), String::new()]
            };

            broadcast_values(gang.as_ref(), &mut values, 1).unwrap();

            assert_eq!(values, vec!["alpha".to_string(), "beta".to_string()]);
        });
    }

    #[test]
    fn test_broadcast_values_on_local_gang() {
        let gang = LocalGang::default();
        let mut values = vec![7_u64];
        broadcast_values(&gang, &mut values, 0).unwrap();
        assert_eq!(values, vec![7]);
    }
}

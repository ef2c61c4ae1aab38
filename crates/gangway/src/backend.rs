//! Backend - Communication Backend Abstractions
//!
//! Provides the communication-group handle trait behind every distributed
//! gang, the reduce-operation enumeration, and an in-process backend that
//! synchronizes ranks running on separate threads of one process.
//!
//! @version 0.2.0
//! @author Gangway Development Team

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use gangway_core::{Error, Result};

// =============================================================================
// Reduce Operations
// =============================================================================

/// Element-wise combination semantics for an all-reduce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    /// Sum all values.
    Sum,
    /// Compute the arithmetic mean of all values.
    Mean,
    /// Compute the product of all values.
    Product,
    /// Find the minimum value.
    Min,
    /// Find the maximum value.
    Max,
}

impl ReduceOp {
    /// Reduces one contribution per rank into a single slice.
    ///
    /// All contributions must have the same length; `Mean` divides the sum
    /// by the number of contributions.
    #[must_use]
    pub fn reduce_slices(self, slices: &[Vec<f32>]) -> Vec<f32> {
        let Some(first) = slices.first() else {
            return Vec::new();
        };

        let mut result = first.clone();

        for slice in &slices[1..] {
            for (acc, &value) in result.iter_mut().zip(slice.iter()) {
                *acc = match self {
                    ReduceOp::Sum | ReduceOp::Mean => *acc + value,
                    ReduceOp::Product => *acc * value,
                    ReduceOp::Min => acc.min(value),
                    ReduceOp::Max => acc.max(value),
                };
            }
        }

        if self == ReduceOp::Mean {
            let count = slices.len() as f32;
            for value in &mut result {
                *value /= count;
            }
        }

        result
    }
}

// =============================================================================
// Backend Trait
// =============================================================================

/// A communication-group handle owned by a distributed gang.
///
/// Every collective is a blocking rendezvous: the call returns once the
/// operation completes on the local rank, which requires all member ranks
/// to issue the equivalent call. Members must issue collectives on the
/// same group in the same relative order.
pub trait Backend: Send + Sync {
    /// Returns the name of the backend.
    fn name(&self) -> &str;

    /// Returns true if the backend performs its collectives in host
    /// memory. Host backends double as monitored-barrier groups.
    fn is_host(&self) -> bool;

    /// Returns the rank of this process within the group.
    fn rank(&self) -> usize;

    /// Returns the number of processes in the group.
    fn world_size(&self) -> usize;

    /// Blocks until all ranks reach this call.
    fn barrier(&self) -> Result<()>;

    /// A fail-fast barrier used for diagnostic synchronization checks;
    /// times out with `timeout` instead of hanging on a desynchronized
    /// rank.
    fn monitored_barrier(&self, timeout: Duration) -> Result<()>;

    /// Combines `data` element-wise across all ranks; every rank receives
    /// the identical result in `data`.
    fn all_reduce(&self, data: &mut [f32], op: ReduceOp) -> Result<()>;

    /// Concatenates each rank's `input` into `output` in rank order;
    /// `output` must hold `world_size` copies of `input`'s length.
    fn all_gather(&self, input: &[f32], output: &mut [f32]) -> Result<()>;

    /// Replaces `data` on every rank with the bytes supplied by
    /// `source_rank`.
    fn broadcast_bytes(&self, data: &mut Vec<u8>, source_rank: usize) -> Result<()>;

    /// Collectively derives a sub-group over `ranks`.
    ///
    /// Every rank of the group must call this with the same `ranks` list;
    /// a caller outside `ranks` participates in the bookkeeping but
    /// receives `Ok(None)`.
    fn split(&self, ranks: &[usize]) -> Result<Option<Arc<dyn Backend>>>;

    /// Releases the communication resources of the group. Behavior of any
    /// collective issued afterwards is unspecified.
    fn close(&self) -> Result<()>;
}

// =============================================================================
// Rendezvous State
// =============================================================================

/// One rank's contribution to an in-process collective.
#[derive(Debug, Clone)]
enum Payload {
    Token,
    Floats(Vec<f32>),
    Bytes(Vec<u8>),
}

impl Payload {
    fn into_floats(self) -> Result<Vec<f32>> {
        match self {
            Payload::Floats(values) => Ok(values),
            _ => Err(Error::internal("rank contributed a mismatched payload")),
        }
    }

    fn into_bytes(self) -> Result<Vec<u8>> {
        match self {
            Payload::Bytes(bytes) => Ok(bytes),
            _ => Err(Error::internal("rank contributed a mismatched payload")),
        }
    }
}

/// Exchange slots shared by all ranks of one group.
#[derive(Debug)]
struct Exchange {
    entries: Vec<Option<Payload>>,
    arrived: usize,
    generation: u64,
    results: Vec<Payload>,
}

#[derive(Debug)]
struct Shared {
    world_size: usize,
    exchange: Mutex<Exchange>,
    arrival: Condvar,
    // Child groups created by `split`, keyed by the uniform call sequence
    // and the member list so that concurrent splits cannot collide.
    children: Mutex<HashMap<(u64, Vec<usize>), Arc<Shared>>>,
}

impl Shared {
    fn new(world_size: usize) -> Self {
        Self {
            world_size,
            exchange: Mutex::new(Exchange {
                entries: vec![None; world_size],
                arrived: 0,
                generation: 0,
                results: Vec::new(),
            }),
            arrival: Condvar::new(),
            children: Mutex::new(HashMap::new()),
        }
    }
}

// =============================================================================
// Thread Backend
// =============================================================================

/// An in-process backend whose ranks live on separate threads.
///
/// Collectives are generation-counted rendezvous: each rank deposits its
/// contribution and blocks until every rank of the group has arrived, so
/// multi-rank behavior (including deadlocks-turned-timeouts) is observable
/// in ordinary unit tests without a network.
pub struct ThreadBackend {
    rank: usize,
    shared: Arc<Shared>,
    timeout: Duration,
    split_seq: AtomicU64,
}

/// The collective timeout used by [`ThreadBackend::create_world`].
pub const THREAD_BACKEND_TIMEOUT: Duration = Duration::from_secs(30);

impl ThreadBackend {
    /// Creates one backend handle per rank, all sharing a world of size
    /// `world_size`.
    #[must_use]
    pub fn create_world(world_size: usize) -> Vec<Self> {
        Self::create_world_with_timeout(world_size, THREAD_BACKEND_TIMEOUT)
    }

    /// Like [`create_world`](Self::create_world) with an explicit
    /// collective timeout.
    #[must_use]
    pub fn create_world_with_timeout(world_size: usize, timeout: Duration) -> Vec<Self> {
        let shared = Arc::new(Shared::new(world_size));

        (0..world_size)
            .map(|rank| ThreadBackend {
                rank,
                shared: Arc::clone(&shared),
                timeout,
                split_seq: AtomicU64::new(0),
            })
            .collect()
    }

    /// Creates a single backend (rank 0, world size 1).
    #[must_use]
    pub fn single() -> Self {
        let mut world = Self::create_world(1);
        world.remove(0)
    }

    /// Deposits `value` and blocks until every rank of the group has done
    /// the same; returns all contributions in rank order.
    fn exchange(&self, value: Payload, operation: &str, timeout: Duration) -> Result<Vec<Payload>> {
        let mut exchange = self.shared.exchange.lock();

        let generation = exchange.generation;

        exchange.entries[self.rank] = Some(value);
        exchange.arrived += 1;

        if exchange.arrived == self.shared.world_size {
            let world_size = self.shared.world_size;
            let entries = std::mem::replace(&mut exchange.entries, vec![None; world_size]);
            exchange.results = entries
                .into_iter()
                .map(|entry| entry.unwrap_or(Payload::Token))
                .collect();
            exchange.arrived = 0;
            exchange.generation += 1;

            self.shared.arrival.notify_all();
        } else {
            while exchange.generation == generation {
                if self
                    .shared
                    .arrival
                    .wait_for(&mut exchange, timeout)
                    .timed_out()
                {
                    let absent: Vec<usize> = exchange
                        .entries
                        .iter()
                        .enumerate()
                        .filter(|(_, entry)| entry.is_none())
                        .map(|(rank, _)| rank)
                        .collect();

                    warn!(
                        operation,
                        ?absent,
                        "ranks did not reach the collective before the timeout"
                    );

                    return Err(Error::CollectiveTimeout {
                        operation: operation.to_string(),
                        timeout,
                    });
                }
            }
        }

        Ok(exchange.results.clone())
    }
}

impl Backend for ThreadBackend {
    fn name(&self) -> &str {
        "thread"
    }

    fn is_host(&self) -> bool {
        true
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn barrier(&self) -> Result<()> {
        self.exchange(Payload::Token, "barrier", self.timeout)?;

        Ok(())
    }

    fn monitored_barrier(&self, timeout: Duration) -> Result<()> {
        self.exchange(Payload::Token, "monitored_barrier", timeout)?;

        Ok(())
    }

    fn all_reduce(&self, data: &mut [f32], op: ReduceOp) -> Result<()> {
        let contributions = self.exchange(
            Payload::Floats(data.to_vec()),
            "all_reduce",
            self.timeout,
        )?;

        let slices = contributions
            .into_iter()
            .map(Payload::into_floats)
            .collect::<Result<Vec<_>>>()?;

        if slices.iter().any(|slice| slice.len() != data.len()) {
            return Err(Error::invalid_argument(
                "all ranks must contribute `all_reduce` buffers of equal length",
            ));
        }

        data.copy_from_slice(&op.reduce_slices(&slices));

        Ok(())
    }

    fn all_gather(&self, input: &[f32], output: &mut [f32]) -> Result<()> {
        let contributions = self.exchange(
            Payload::Floats(input.to_vec()),
            "all_gather",
            self.timeout,
        )?;

        let mut offset = 0;
        for contribution in contributions {
            let values = contribution.into_floats()?;
            if offset + values.len() > output.len() {
                return Err(Error::invalid_argument(
                    "`output` is too small to hold one `input` per rank",
                ));
            }
            output[offset..offset + values.len()].copy_from_slice(&values);
            offset += values.len();
        }

        Ok(())
    }

    fn broadcast_bytes(&self, data: &mut Vec<u8>, source_rank: usize) -> Result<()> {
        let contributions = self.exchange(
            Payload::Bytes(std::mem::take(data)),
            "broadcast",
            self.timeout,
        )?;

        let source = contributions
            .into_iter()
            .nth(source_rank)
            .ok_or_else(|| Error::internal("broadcast source rank out of range"))?;

        *data = source.into_bytes()?;

        Ok(())
    }

    fn split(&self, ranks: &[usize]) -> Result<Option<Arc<dyn Backend>>> {
        // The sequence number stays aligned across ranks because group
        // creation is a uniform collective: every rank calls `split` the
        // same number of times in the same order.
        let seq = self.split_seq.fetch_add(1, Ordering::Relaxed);

        let Some(new_rank) = ranks.iter().position(|&rank| rank == self.rank) else {
            return Ok(None);
        };

        let key = (seq, ranks.to_vec());

        let child = {
            let mut children = self.shared.children.lock();
            Arc::clone(
                children
                    .entry(key)
                    .or_insert_with(|| Arc::new(Shared::new(ranks.len()))),
            )
        };

        Ok(Some(Arc::new(ThreadBackend {
            rank: new_rank,
            shared: child,
            timeout: self.timeout,
            split_seq: AtomicU64::new(0),
        })))
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

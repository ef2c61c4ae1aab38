//! TCP Backend - Host-Memory Collectives over Sockets
//!
//! A synchronous, full-mesh TCP transport for gangs whose processes do not
//! share an address space. Rank 0 coordinates the data-moving collectives;
//! broadcasts fan out directly from the source rank. Every socket carries
//! the group's collective timeout, so a desynchronized peer surfaces as a
//! `CollectiveTimeout` instead of an indefinite hang.
//!
//! Connection establishment follows the usual mesh recipe: each rank binds
//! its own listener, connects to all lower ranks (retrying until the peer
//! has bound), and accepts one connection from each higher rank, which
//! identifies itself with a hello frame.
//!
//! @version 0.2.0
//! @author Gangway Development Team

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use gangway_core::{Error, Result};

use crate::backend::{Backend, ReduceOp};

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(25);

// =============================================================================
// TcpBackend
// =============================================================================

/// A full-mesh TCP communication group.
pub struct TcpBackend {
    rank: usize,
    world_size: usize,
    addrs: Vec<SocketAddr>,
    // One stream per peer; the local rank's slot stays empty. The mutex
    // serializes frames so that collectives issued back to back cannot
    // interleave on the wire.
    peers: Vec<Option<Mutex<TcpStream>>>,
    timeout: Duration,
    split_seq: AtomicU32,
}

impl TcpBackend {
    /// Establishes the mesh for `rank` out of `world_size` ranks.
    ///
    /// All ranks must call this concurrently with the same `addrs` list;
    /// `addrs[i]` is where rank `i` listens.
    pub fn connect(
        rank: usize,
        world_size: usize,
        addrs: &[SocketAddr],
        timeout: Duration,
    ) -> Result<Self> {
        if world_size == 0 {
            return Err(Error::invalid_argument(
                "`world_size` must be greater than 0",
            ));
        }

        if rank >= world_size {
            return Err(Error::invalid_argument(format!(
                "`rank` must be less than `world_size` ({world_size}), but is {rank} instead"
            )));
        }

        if addrs.len() != world_size {
            return Err(Error::invalid_argument(format!(
                "`addrs` must contain one address per rank ({world_size}), but contains {} instead",
                addrs.len()
            )));
        }

        let listener = TcpListener::bind(addrs[rank]).map_err(|err| {
            Error::communication(format!("failed to bind rank {rank} to {}: {err}", addrs[rank]))
        })?;

        let deadline = Instant::now() + timeout;

        let mut peers: Vec<Option<Mutex<TcpStream>>> =
            (0..world_size).map(|_| None).collect();

        // Connect to lower ranks, identifying ourselves with a hello frame.
        for peer in 0..rank {
            let stream = connect_with_retry(addrs[peer], deadline)?;
            configure_stream(&stream, timeout)?;

            let mut stream = stream;
            stream
                .write_all(&(rank as u32).to_le_bytes())
                .map_err(|err| map_io("connect", timeout, &err))?;

            peers[peer] = Some(Mutex::new(stream));
        }

        // Accept one connection from each higher rank.
        for _ in rank + 1..world_size {
            let mut stream = accept_with_deadline(&listener, deadline)?;
            configure_stream(&stream, timeout)?;

            let mut hello = [0u8; 4];
            stream
                .read_exact(&mut hello)
                .map_err(|err| map_io("connect", timeout, &err))?;
            let peer = u32::from_le_bytes(hello) as usize;

            if peer <= rank || peer >= world_size {
                return Err(Error::communication(format!(
                    "received a hello frame from unexpected rank {peer}"
                )));
            }

            if peers[peer].is_some() {
                return Err(Error::communication(format!(
                    "received a duplicate connection from rank {peer}"
                )));
            }

            peers[peer] = Some(Mutex::new(stream));
        }

        debug!(rank, world_size, "tcp mesh established");

        Ok(Self {
            rank,
            world_size,
            addrs: addrs.to_vec(),
            peers,
            timeout,
            split_seq: AtomicU32::new(0),
        })
    }

    fn peer(&self, rank: usize) -> Result<&Mutex<TcpStream>> {
        self.peers
            .get(rank)
            .and_then(Option::as_ref)
            .ok_or_else(|| Error::internal(format!("no stream for peer rank {rank}")))
    }

    /// Rank 0 collects a token from every peer, then releases them all.
    fn token_exchange(&self, operation: &str, timeout: Duration) -> Result<()> {
        if self.rank == 0 {
            for peer in 1..self.world_size {
                let stream = self.peer(peer)?;
                let mut guard = stream.lock();
                if let Err(err) = read_token(&mut guard) {
                    warn!(peer, operation, "rank did not check in");
                    return Err(map_io(operation, timeout, &err));
                }
            }
            for peer in 1..self.world_size {
                let mut guard = self.peer(peer)?.lock();
                write_token(&mut guard).map_err(|err| map_io(operation, timeout, &err))?;
            }
        } else {
            let stream = self.peer(0)?;
            let mut guard = stream.lock();
            write_token(&mut guard).map_err(|err| map_io(operation, timeout, &err))?;
            read_token(&mut guard).map_err(|err| map_io(operation, timeout, &err))?;
        }

        Ok(())
    }
}

impl Backend for TcpBackend {
    fn name(&self) -> &str {
        "tcp"
    }

    fn is_host(&self) -> bool {
        true
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn barrier(&self) -> Result<()> {
        self.token_exchange("barrier", self.timeout)
    }

    fn monitored_barrier(&self, timeout: Duration) -> Result<()> {
        // The monitored variant tightens the socket timeout for the
        // duration of the exchange so a stuck rank is reported quickly.
        for peer in self.peers.iter().flatten() {
            set_read_timeout(&peer.lock(), timeout)?;
        }

        let result = self.token_exchange("monitored_barrier", timeout);

        for peer in self.peers.iter().flatten() {
            set_read_timeout(&peer.lock(), self.timeout)?;
        }

        result
    }

    fn all_reduce(&self, data: &mut [f32], op: ReduceOp) -> Result<()> {
        if self.rank == 0 {
            let mut slices = Vec::with_capacity(self.world_size);
            slices.push(data.to_vec());

            for peer in 1..self.world_size {
                let mut guard = self.peer(peer)?.lock();
                let values = read_floats(&mut guard, data.len())
                    .map_err(|err| map_io("all_reduce", self.timeout, &err))?;
                slices.push(values);
            }

            data.copy_from_slice(&op.reduce_slices(&slices));

            for peer in 1..self.world_size {
                let mut guard = self.peer(peer)?.lock();
                write_floats(&mut guard, data)
                    .map_err(|err| map_io("all_reduce", self.timeout, &err))?;
            }
        } else {
            let mut guard = self.peer(0)?.lock();
            write_floats(&mut guard, data)
                .map_err(|err| map_io("all_reduce", self.timeout, &err))?;
            let reduced = read_floats(&mut guard, data.len())
                .map_err(|err| map_io("all_reduce", self.timeout, &err))?;
            data.copy_from_slice(&reduced);
        }

        Ok(())
    }

    fn all_gather(&self, input: &[f32], output: &mut [f32]) -> Result<()> {
        if output.len() != input.len() * self.world_size {
            return Err(Error::invalid_argument(format!(
                "`output` must hold {} elements ({} per rank), but holds {} instead",
                input.len() * self.world_size,
                input.len(),
                output.len()
            )));
        }

        if self.rank == 0 {
            output[..input.len()].copy_from_slice(input);

            for peer in 1..self.world_size {
                let mut guard = self.peer(peer)?.lock();
                let values = read_floats(&mut guard, input.len())
                    .map_err(|err| map_io("all_gather", self.timeout, &err))?;
                output[peer * input.len()..(peer + 1) * input.len()].copy_from_slice(&values);
            }

            for peer in 1..self.world_size {
                let mut guard = self.peer(peer)?.lock();
                write_floats(&mut guard, output)
                    .map_err(|err| map_io("all_gather", self.timeout, &err))?;
            }
        } else {
            let mut guard = self.peer(0)?.lock();
            write_floats(&mut guard, input)
                .map_err(|err| map_io("all_gather", self.timeout, &err))?;
            let gathered = read_floats(&mut guard, output.len())
                .map_err(|err| map_io("all_gather", self.timeout, &err))?;
            output.copy_from_slice(&gathered);
        }

        Ok(())
    }

    fn broadcast_bytes(&self, data: &mut Vec<u8>, source_rank: usize) -> Result<()> {
        if source_rank >= self.world_size {
            return Err(Error::invalid_argument(format!(
                "`source_rank` must be less than the world size ({}), but is {source_rank} instead",
                self.world_size
            )));
        }

        if self.rank == source_rank {
            for peer in (0..self.world_size).filter(|&peer| peer != self.rank) {
                let mut guard = self.peer(peer)?.lock();
                write_frame(&mut *guard, data)
                    .map_err(|err| map_io("broadcast", self.timeout, &err))?;
            }
        } else {
            let mut guard = self.peer(source_rank)?.lock();
            *data = read_frame(&mut *guard)
                .map_err(|err| map_io("broadcast", self.timeout, &err))?;
        }

        Ok(())
    }

    fn split(&self, ranks: &[usize]) -> Result<Option<Arc<dyn Backend>>> {
        // Advanced uniformly on every rank for every split call, so all
        // groups derived from the same parent agree on a disjoint port
        // block without extra communication.
        let seq = self.split_seq.fetch_add(1, Ordering::Relaxed) + 1;

        let Some(new_rank) = ranks.iter().position(|&rank| rank == self.rank) else {
            return Ok(None);
        };

        let stride = seq * self.world_size as u32;

        let sub_addrs = ranks
            .iter()
            .map(|&member| {
                let mut addr = self.addrs[member];
                let port = u32::from(addr.port()) + stride;
                if port > u32::from(u16::MAX) {
                    return Err(Error::invalid_argument(format!(
                        "the port block for sub-group {seq} exceeds the valid port range (base {})",
                        addr.port()
                    )));
                }
                addr.set_port(port as u16);
                Ok(addr)
            })
            .collect::<Result<Vec<_>>>()?;

        let child = TcpBackend::connect(new_rank, ranks.len(), &sub_addrs, self.timeout)?;

        Ok(Some(Arc::new(child)))
    }

    fn close(&self) -> Result<()> {
        for peer in self.peers.iter().flatten() {
            // NotConnected from an already-dropped peer is not an error at
            // teardown.
            let _ = peer.lock().shutdown(Shutdown::Both);
        }

        Ok(())
    }
}

// =============================================================================
// Connection Helpers
// =============================================================================

fn connect_with_retry(addr: SocketAddr, deadline: Instant) -> Result<TcpStream> {
    loop {
        match TcpStream::connect_timeout(&addr, CONNECT_RETRY_INTERVAL) {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                if Instant::now() >= deadline {
                    return Err(Error::communication(format!(
                        "failed to connect to peer at {addr}: {err}"
                    )));
                }
                std::thread::sleep(CONNECT_RETRY_INTERVAL);
            }
        }
    }
}

fn accept_with_deadline(listener: &TcpListener, deadline: Instant) -> Result<TcpStream> {
    listener
        .set_nonblocking(true)
        .map_err(|err| Error::communication(format!("failed to configure listener: {err}")))?;

    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false).map_err(|err| {
                    Error::communication(format!("failed to configure stream: {err}"))
                })?;
                return Ok(stream);
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(Error::communication(
                        "timed out waiting for peer connections",
                    ));
                }
                std::thread::sleep(CONNECT_RETRY_INTERVAL);
            }
            Err(err) => {
                return Err(Error::communication(format!(
                    "failed to accept a peer connection: {err}"
                )))
            }
        }
    }
}

fn configure_stream(stream: &TcpStream, timeout: Duration) -> Result<()> {
    stream
        .set_nodelay(true)
        .and_then(|()| stream.set_read_timeout(Some(timeout)))
        .and_then(|()| stream.set_write_timeout(Some(timeout)))
        .map_err(|err| Error::communication(format!("failed to configure stream: {err}")))
}

fn set_read_timeout(stream: &TcpStream, timeout: Duration) -> Result<()> {
    stream
        .set_read_timeout(Some(timeout))
        .map_err(|err| Error::communication(format!("failed to configure stream: {err}")))
}

// =============================================================================
// Frame Helpers
// =============================================================================

fn write_token(stream: &mut TcpStream) -> std::io::Result<()> {
    stream.write_all(&[1u8])
}

fn read_token(stream: &mut TcpStream) -> std::io::Result<()> {
    let mut token = [0u8; 1];
    stream.read_exact(&mut token)
}

fn write_floats(stream: &mut TcpStream, values: &[f32]) -> std::io::Result<()> {
    let mut buf = Vec::with_capacity(values.len() * 4);
    for value in values {
        buf.extend_from_slice(&value.to_le_bytes());
    }
    stream.write_all(&buf)
}

fn read_floats(stream: &mut TcpStream, count: usize) -> std::io::Result<Vec<f32>> {
    let mut buf = vec![0u8; count * 4];
    stream.read_exact(&mut buf)?;

    Ok(buf
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

// Upper bound on a broadcast frame. A corrupt length header fails as a
// communication error instead of an allocation the size of the header's
// garbage.
const MAX_FRAME_LEN: u64 = 1 << 30;

fn write_frame<W: Write>(stream: &mut W, data: &[u8]) -> std::io::Result<()> {
    stream.write_all(&(data.len() as u64).to_le_bytes())?;
    stream.write_all(data)
}

fn read_frame<R: Read>(stream: &mut R) -> std::io::Result<Vec<u8>> {
    let mut header = [0u8; 8];
    stream.read_exact(&mut header)?;
    let len = u64::from_le_bytes(header);

    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame length {len} exceeds the {MAX_FRAME_LEN}-byte limit"),
        ));
    }

    let mut data = vec![0u8; len as usize];
    stream.read_exact(&mut data)?;

    Ok(data)
}

fn map_io(operation: &str, timeout: Duration, err: &std::io::Error) -> Error {
    use std::io::ErrorKind;

    match err.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => Error::CollectiveTimeout {
            operation: operation.to_string(),
            timeout,
        },
        _ => Error::communication(format!("`{operation}` failed: {err}")),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const TEST_TIMEOUT: Duration = Duration::from_secs(10);

    fn local_addrs(base_port: u16, world_size: usize) -> Vec<SocketAddr> {
        (0..world_size)
            .map(|rank| {
                format!("127.0.0.1:{}", base_port + rank as u16)
                    .parse()
                    .unwrap()
            })
            .collect()
    }

    fn run_world<F>(base_port: u16, world_size: usize, f: F)
    where
        F: Fn(TcpBackend) + Send + Sync + 'static,
    {
        let addrs = local_addrs(base_port, world_size);
        let f = Arc::new(f);

        let handles: Vec<_> = (0..world_size)
            .map(|rank| {
                let addrs = addrs.clone();
                let f = Arc::clone(&f);
                thread::spawn(move || {
                    let backend =
                        TcpBackend::connect(rank, world_size, &addrs, TEST_TIMEOUT).unwrap();
                    f(backend);
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_two_rank_collectives() {
        run_world(28310, 2, |backend| {
            backend.barrier().unwrap();

            let mut data = vec![backend.rank() as f32 + 1.0; 3];
            backend.all_reduce(&mut data, ReduceOp::Sum).unwrap();
            assert_eq!(data, vec![3.0, 3.0, 3.0]);

            let input = vec![backend.rank() as f32];
            let mut output = vec![0.0; 2];
            backend.all_gather(&input, &mut output).unwrap();
            assert_eq!(output, vec![0.0, 1.0]);

            backend.close().unwrap();
        });
    }

    #[test]
    fn test_four_rank_broadcast_and_reduce() {
        run_world(28330, 4, |backend| {
            let mut data = if backend.rank() == 2 {
                b"weights".to_vec()
            } else {
                Vec::new()
            };
            backend.broadcast_bytes(&mut data, 2).unwrap();
            assert_eq!(data, b"weights");

            let mut values = vec![backend.rank() as f32];
            backend.all_reduce(&mut values, ReduceOp::Sum).unwrap();
            assert_eq!(values, vec![6.0]);

            backend.monitored_barrier(TEST_TIMEOUT).unwrap();

            backend.close().unwrap();
        });
    }

    #[test]
    fn test_split_forms_row_groups() {
        run_world(28350, 4, |backend| {
            let rank = backend.rank();

            let low = backend.split(&[0, 1]).unwrap();
            let high = backend.split(&[2, 3]).unwrap();

            let sub = if rank < 2 {
                assert!(high.is_none());
                low.unwrap()
            } else {
                assert!(low.is_none());
                high.unwrap()
            };

            assert_eq!(sub.world_size(), 2);
            assert_eq!(sub.rank(), rank % 2);

            let mut data = vec![rank as f32];
            sub.all_reduce(&mut data, ReduceOp::Sum).unwrap();
            let expected = if rank < 2 { 1.0 } else { 5.0 };
            assert_eq!(data, vec![expected]);

            sub.close().unwrap();
            backend.close().unwrap();
        });
    }

    #[test]
    fn test_mismatched_addr_count_is_rejected() {
        let addrs = local_addrs(28370, 1);
        let Err(err) = TcpBackend::connect(0, 2, &addrs, TEST_TIMEOUT) else {
            panic!("expected the mesh setup to fail");
        };
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[test]
    fn test_frame_round_trip() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"weights").unwrap();

        let data = read_frame(&mut wire.as_slice()).unwrap();
        assert_eq!(data, b"weights");
    }

    #[test]
    fn test_oversized_frame_header_is_rejected() {
        let header = u64::MAX.to_le_bytes();

        let err = read_frame(&mut header.as_slice()).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);

        // The transport surfaces the corrupt header as a communication
        // error, not a timeout.
        assert!(matches!(
            map_io("broadcast", TEST_TIMEOUT, &err),
            Error::Communication { .. }
        ));
    }
}

//! TCP star collective: rank 0 listens, every other rank connects to it.
//!
//! Wire format, all little-endian:
//! - handshake (worker -> master): `rank: u32`, `world_size: u32`
//! - request (worker -> master): `op: u8`, `kind: u8`, `count: u64`, payload
//! - reply (master -> worker): reduced payload of the same length
//!
//! The master sums contributions in rank order and applies the average, so
//! all ranks receive identical bytes.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::{Collective, ReduceOp};
use crate::error::{sync_error, TrainResult};

const RENDEZVOUS_TIMEOUT: Duration = Duration::from_secs(120);
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

const KIND_F32: u8 = 0;
const KIND_F64: u8 = 1;

/// Element types that travel over the wire.
trait WireValue: Copy + Default + std::ops::AddAssign {
    const KIND: u8;
    const WIDTH: usize;
    fn put(self, buf: &mut Vec<u8>);
    fn take(bytes: &[u8]) -> Self;
    fn div(self, n: usize) -> Self;
}

impl WireValue for f32 {
    const KIND: u8 = KIND_F32;
    const WIDTH: usize = 4;

    fn put(self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.to_le_bytes());
    }

    fn take(bytes: &[u8]) -> Self {
        f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    fn div(self, n: usize) -> Self {
        self / n as f32
    }
}

impl WireValue for f64 {
    const KIND: u8 = KIND_F64;
    const WIDTH: usize = 8;

    fn put(self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.to_le_bytes());
    }

    fn take(bytes: &[u8]) -> Self {
        let mut b = [0u8; 8];
        b.copy_from_slice(&bytes[..8]);
        f64::from_le_bytes(b)
    }

    fn div(self, n: usize) -> Self {
        self / n as f64
    }
}

fn encode<T: WireValue>(values: &[T]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(values.len() * T::WIDTH);
    for &v in values {
        v.put(&mut buf);
    }
    buf
}

fn decode_into<T: WireValue>(bytes: &[u8], out: &mut [T]) {
    for (dst, chunk) in out.iter_mut().zip(bytes.chunks_exact(T::WIDTH)) {
        *dst = T::take(chunk);
    }
}

enum Role {
    /// Streams to ranks `1..world_size`, indexed by `rank - 1`.
    Master(Vec<TcpStream>),
    Worker(TcpStream),
}

/// Multi-process collective over plain TCP sockets.
pub struct TcpCollective {
    rank: usize,
    world_size: usize,
    role: Mutex<Role>,
}

impl TcpCollective {
    /// Form the group. Rank 0 binds `addr:port`; the others connect with
    /// retries until the rendezvous timeout.
    pub fn connect(addr: &str, port: u16, rank: usize, world_size: usize) -> TrainResult<Self> {
        Self::connect_with_timeout(addr, port, rank, world_size, RENDEZVOUS_TIMEOUT)
    }

    pub fn connect_with_timeout(
        addr: &str,
        port: u16,
        rank: usize,
        world_size: usize,
        timeout: Duration,
    ) -> TrainResult<Self> {
        if world_size == 0 || rank >= world_size {
            return Err(sync_error(format!(
                "rank {} out of range for world size {}",
                rank, world_size
            )));
        }
        let role = if rank == 0 {
            Role::Master(Self::accept_workers(addr, port, world_size, timeout)?)
        } else {
            Role::Worker(Self::dial_master(addr, port, rank, world_size, timeout)?)
        };
        tracing::info!(rank, world_size, "Process group initialized");
        Ok(Self {
            rank,
            world_size,
            role: Mutex::new(role),
        })
    }

    fn accept_workers(
        addr: &str,
        port: u16,
        world_size: usize,
        timeout: Duration,
    ) -> TrainResult<Vec<TcpStream>> {
        let listener = TcpListener::bind((addr, port))
            .map_err(|e| sync_error(format!("bind {}:{}: {}", addr, port, e)))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| sync_error(format!("listener setup: {}", e)))?;

        let deadline = Instant::now() + timeout;
        let mut slots: Vec<Option<TcpStream>> = (1..world_size).map(|_| None).collect();
        let mut joined = 0;
        while joined < world_size - 1 {
            match listener.accept() {
                Ok((mut stream, peer)) => {
                    stream
                        .set_nonblocking(false)
                        .and_then(|_| stream.set_nodelay(true))
                        .map_err(|e| sync_error(format!("configure {}: {}", peer, e)))?;
                    let mut hello = [0u8; 8];
                    stream
                        .read_exact(&mut hello)
                        .map_err(|e| sync_error(format!("handshake from {}: {}", peer, e)))?;
                    let peer_rank = u32::from_le_bytes([hello[0], hello[1], hello[2], hello[3]]) as usize;
                    let peer_world = u32::from_le_bytes([hello[4], hello[5], hello[6], hello[7]]) as usize;
                    if peer_world != world_size || peer_rank == 0 || peer_rank >= world_size {
                        return Err(sync_error(format!(
                            "peer {} announced rank {} of {}, expected world size {}",
                            peer, peer_rank, peer_world, world_size
                        )));
                    }
                    let slot = &mut slots[peer_rank - 1];
                    if slot.is_some() {
                        return Err(sync_error(format!("rank {} joined twice", peer_rank)));
                    }
                    tracing::debug!(peer_rank, %peer, "Worker joined");
                    *slot = Some(stream);
                    joined += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(sync_error(format!(
                            "only {} of {} workers joined within {:?}",
                            joined,
                            world_size - 1,
                            timeout
                        )));
                    }
                    std::thread::sleep(RETRY_INTERVAL / 10);
                }
                Err(e) => return Err(sync_error(format!("accept: {}", e))),
            }
        }
        Ok(slots.into_iter().flatten().collect())
    }

    fn dial_master(
        addr: &str,
        port: u16,
        rank: usize,
        world_size: usize,
        timeout: Duration,
    ) -> TrainResult<TcpStream> {
        let deadline = Instant::now() + timeout;
        let mut stream = loop {
            match TcpStream::connect((addr, port)) {
                Ok(s) => break s,
                Err(e) => {
                    if Instant::now() >= deadline {
                        return Err(sync_error(format!(
                            "rank {} could not reach master at {}:{}: {}",
                            rank, addr, port, e
                        )));
                    }
                    std::thread::sleep(RETRY_INTERVAL);
                }
            }
        };
        stream
            .set_nodelay(true)
            .map_err(|e| sync_error(format!("configure master stream: {}", e)))?;
        let mut hello = Vec::with_capacity(8);
        hello.extend_from_slice(&(rank as u32).to_le_bytes());
        hello.extend_from_slice(&(world_size as u32).to_le_bytes());
        stream
            .write_all(&hello)
            .map_err(|e| sync_error(format!("handshake: {}", e)))?;
        Ok(stream)
    }

    fn reduce<T: WireValue>(&self, values: &mut [T], op: ReduceOp) -> TrainResult<()> {
        let mut role = self
            .role
            .lock()
            .map_err(|_| sync_error("collective poisoned"))?;
        match &mut *role {
            Role::Master(workers) => {
                let mut sum = values.to_vec();
                let mut payload = vec![0u8; values.len() * T::WIDTH];
                let mut theirs = vec![T::default(); values.len()];
                for (i, stream) in workers.iter_mut().enumerate() {
                    let peer = i + 1;
                    let mut header = [0u8; 10];
                    stream
                        .read_exact(&mut header)
                        .map_err(|e| sync_error(format!("recv header from rank {}: {}", peer, e)))?;
                    let mut count = [0u8; 8];
                    count.copy_from_slice(&header[2..10]);
                    let count = u64::from_le_bytes(count) as usize;
                    if header[0] != op.code() || header[1] != T::KIND || count != values.len() {
                        return Err(sync_error(format!(
                            "rank {} issued a different collective (op {}, kind {}, {} values)",
                            peer, header[0], header[1], count
                        )));
                    }
                    stream
                        .read_exact(&mut payload)
                        .map_err(|e| sync_error(format!("recv payload from rank {}: {}", peer, e)))?;
                    decode_into(&payload, &mut theirs);
                    for (acc, v) in sum.iter_mut().zip(&theirs) {
                        *acc += *v;
                    }
                }
                if op == ReduceOp::Avg {
                    sum.iter_mut().for_each(|v| *v = WireValue::div(*v, self.world_size));
                }
                let reply = encode(&sum);
                for (i, stream) in workers.iter_mut().enumerate() {
                    stream
                        .write_all(&reply)
                        .map_err(|e| sync_error(format!("send to rank {}: {}", i + 1, e)))?;
                }
                values.copy_from_slice(&sum);
            }
            Role::Worker(stream) => {
                let mut msg = Vec::with_capacity(10 + values.len() * T::WIDTH);
                msg.push(op.code());
                msg.push(T::KIND);
                msg.extend_from_slice(&(values.len() as u64).to_le_bytes());
                msg.extend_from_slice(&encode(values));
                stream
                    .write_all(&msg)
                    .map_err(|e| sync_error(format!("send to master: {}", e)))?;
                let mut reply = vec![0u8; values.len() * T::WIDTH];
                stream
                    .read_exact(&mut reply)
                    .map_err(|e| sync_error(format!("recv from master: {}", e)))?;
                decode_into(&reply, values);
            }
        }
        Ok(())
    }
}

impl Collective for TcpCollective {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_f32(&self, values: &mut [f32], op: ReduceOp) -> TrainResult<()> {
        self.reduce(values, op)
    }

    fn all_reduce_f64(&self, values: &mut [f64], op: ReduceOp) -> TrainResult<()> {
        self.reduce(values, op)
    }
}

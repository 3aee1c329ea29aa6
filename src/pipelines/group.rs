//! # Process Group Rendezvous
//!
//! Minimal coordination between the worker processes of one run. Rank 0
//! listens on a fixed address and every other rank connects to it. Only
//! two exchanges exist, both newline-delimited text:
//!
//! ```text
//! member -> primary   JOIN <rank> <world>
//! primary -> member   READY                  (once all ranks have joined)
//! member -> primary   BARRIER
//! primary -> member   RELEASE                (once all ranks reached the barrier)
//! ```
//!
//! No tensors or results travel over the group. A world of one never opens
//! a socket.

use std::io::{self, BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info_span};

use crate::data::Rank;
use crate::error::{PolishError, Result};

/// Pause between connection attempts of a member
const RETRY_INTERVAL: Duration = Duration::from_millis(50);
/// Pause between accept polls of the primary
const ACCEPT_INTERVAL: Duration = Duration::from_millis(10);

fn default_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 12355))
}

fn default_join_timeout() -> u64 {
    60
}

/// Where and how long to rendezvous
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RendezvousConfig {
    #[serde(default = "default_addr")]
    pub addr: SocketAddr,
    /// Bound on the whole join, in seconds
    #[serde(default = "default_join_timeout")]
    pub join_timeout_secs: u64,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            join_timeout_secs: default_join_timeout(),
        }
    }
}

impl RendezvousConfig {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }
}

struct Peer {
    rank: Rank,
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Peer {
    fn new(rank: Rank, stream: TcpStream) -> io::Result<Self> {
        let writer = stream.try_clone()?;
        Ok(Self {
            rank,
            reader: BufReader::new(stream),
            writer,
        })
    }

    fn send(&mut self, msg: &str) -> io::Result<()> {
        self.writer.write_all(msg.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }

    fn recv(&mut self) -> io::Result<String> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed",
            ));
        }
        Ok(line.trim_end().to_string())
    }

    fn expect(&mut self, msg: &str) -> io::Result<()> {
        let got = self.recv()?;
        if got != msg {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected {}, got {:?}", msg, got),
            ));
        }
        Ok(())
    }

    fn set_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.reader.get_ref().set_read_timeout(timeout)
    }
}

enum Membership {
    Solo,
    Primary(Vec<Peer>),
    Member(Peer),
}

/// A joined worker group
pub struct ProcessGroup {
    rank: Rank,
    world_size: usize,
    membership: Membership,
}

impl ProcessGroup {
    /// Join the group as `rank` of `world_size`, blocking until every rank
    /// has joined or the join window of `config` elapses.
    ///
    /// # Errors
    /// Bind failures, protocol violations and timeouts are startup failures.
    pub fn join(rank: Rank, world_size: usize, config: &RendezvousConfig) -> Result<Self> {
        if rank.as_usize() >= world_size {
            return Err(PolishError::config(format!(
                "rank {} outside a world of {}",
                rank, world_size
            )));
        }
        let _span = info_span!("group_join", rank = rank.0, world_size).entered();
        let deadline = Instant::now() + config.join_timeout();
        let membership = if world_size == 1 {
            Membership::Solo
        } else if rank.is_primary() {
            Membership::Primary(accept_members(world_size, config.addr, deadline)?)
        } else {
            Membership::Member(connect_primary(rank, world_size, config.addr, deadline)?)
        };
        debug!(rank = rank.0, world_size, "Joined worker group");
        Ok(Self {
            rank,
            world_size,
            membership,
        })
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Block until every rank reaches the barrier
    pub fn barrier(&mut self) -> Result<()> {
        let _span = info_span!("group_barrier", rank = self.rank.0).entered();
        match &mut self.membership {
            Membership::Solo => Ok(()),
            Membership::Primary(peers) => {
                for peer in peers.iter_mut() {
                    peer.set_timeout(None)?;
                    peer.expect("BARRIER").map_err(|e| {
                        barrier_error(format!("rank {} did not reach the barrier: {}", peer.rank, e))
                    })?;
                }
                for peer in peers.iter_mut() {
                    peer.send("RELEASE")
                        .map_err(|e| barrier_error(format!("releasing rank {}: {}", peer.rank, e)))?;
                }
                Ok(())
            }
            Membership::Member(primary) => {
                primary.set_timeout(None)?;
                primary
                    .send("BARRIER")
                    .and_then(|_| primary.expect("RELEASE"))
                    .map_err(|e| barrier_error(format!("waiting for release: {}", e)))
            }
        }
    }

    /// Release the group connections
    pub fn leave(self) {
        debug!(rank = self.rank.0, "Left worker group");
    }
}

fn barrier_error(message: String) -> PolishError {
    PolishError::Io(io::Error::new(io::ErrorKind::Other, format!("barrier failed: {}", message)))
}

fn remaining(deadline: Instant) -> Option<Duration> {
    deadline
        .checked_duration_since(Instant::now())
        .filter(|d| !d.is_zero())
}

fn join_timeout(world_size: usize, joined: usize) -> PolishError {
    PolishError::startup(format!(
        "worker group join timed out with {} of {} ranks",
        joined, world_size
    ))
}

fn accept_members(world_size: usize, addr: SocketAddr, deadline: Instant) -> Result<Vec<Peer>> {
    let listener = TcpListener::bind(addr)
        .map_err(|e| PolishError::startup(format!("cannot listen on {}: {}", addr, e)))?;
    listener.set_nonblocking(true)?;

    let mut peers: Vec<Peer> = Vec::with_capacity(world_size - 1);
    while peers.len() + 1 < world_size {
        let timeout = remaining(deadline).ok_or_else(|| join_timeout(world_size, peers.len() + 1))?;
        let stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_INTERVAL.min(timeout));
                continue;
            }
            Err(e) => return Err(PolishError::startup(format!("accept failed: {}", e))),
        };
        stream.set_nonblocking(false)?;
        let mut peer = Peer::new(Rank::PRIMARY, stream)?;
        peer.set_timeout(Some(timeout))?;
        let hello = peer
            .recv()
            .map_err(|e| PolishError::startup(format!("bad join request: {}", e)))?;
        let rank = parse_join(&hello, world_size)?;
        if peers.iter().any(|p| p.rank == rank) {
            return Err(PolishError::startup(format!("rank {} joined twice", rank)));
        }
        peer.rank = rank;
        debug!(rank = rank.0, "Member joined");
        peers.push(peer);
    }
    peers.sort_by_key(|p| p.rank);
    for peer in peers.iter_mut() {
        peer.send("READY")
            .map_err(|e| PolishError::startup(format!("cannot confirm rank {}: {}", peer.rank, e)))?;
    }
    Ok(peers)
}

fn parse_join(line: &str, world_size: usize) -> Result<Rank> {
    let bad = || PolishError::startup(format!("malformed join request {:?}", line));
    let mut parts = line.split_whitespace();
    if parts.next() != Some("JOIN") {
        return Err(bad());
    }
    let rank: u32 = parts.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
    let world: usize = parts.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
    if world != world_size {
        return Err(PolishError::startup(format!(
            "rank {} expects a world of {}, primary has {}",
            rank, world, world_size
        )));
    }
    if rank == 0 || rank as usize >= world_size {
        return Err(bad());
    }
    Ok(Rank(rank))
}

fn connect_primary(rank: Rank, world_size: usize, addr: SocketAddr, deadline: Instant) -> Result<Peer> {
    let stream = loop {
        let timeout = remaining(deadline)
            .ok_or_else(|| PolishError::startup(format!("rank {} could not reach {}", rank, addr)))?;
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => break stream,
            Err(_) => std::thread::sleep(RETRY_INTERVAL.min(timeout)),
        }
    };
    let mut primary = Peer::new(Rank::PRIMARY, stream)?;
    let startup = |e: io::Error| PolishError::startup(format!("rank {} join failed: {}", rank, e));
    primary
        .send(&format!("JOIN {} {}", rank, world_size))
        .map_err(startup)?;
    let timeout = remaining(deadline).ok_or_else(|| join_timeout(world_size, 0))?;
    primary.set_timeout(Some(timeout))?;
    primary.expect("READY").map_err(startup)?;
    Ok(primary)
}

//! Peer connections: message framing, handshake and the per-peer task.
//!
//! Each peer runs one reading task; writes go through a bounded channel
//! drained by a writer task, so the coordinator and the reader share one
//! ordered write path. Framing violations disconnect the peer and nothing
//! from the offending message is committed.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use elaspv_bloom::MerkleBlock;
use elaspv_consensus::constants::{
    PING_INTERVAL_SECS, PONG_TIMEOUT_SECS, PROTOCOL_VERSION, SERVICES_NONE,
};
use elaspv_consensus::ChainParams;
use elaspv_primitives::encoding::{from_bytes, to_bytes};
use elaspv_primitives::hash::sha256d;
use elaspv_primitives::{BlockHeader, Transaction};
use log::{debug, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use crate::msg::{
    commands, AddrMessage, HeadersMessage, InventoryMessage, PingMessage, RejectMessage,
    VersionMessage,
};

pub const MESSAGE_HEADER_LEN: usize = 24;
/// First four bytes of SHA256D over an empty body.
pub const EMPTY_MESSAGE_CHECKSUM: [u8; 4] = [0x5d, 0xf6, 0xe0, 0xe2];

const COMMAND_LEN: usize = 12;

pub type PeerId = u64;

#[derive(Debug, Eq, PartialEq)]
pub enum FrameError {
    BadMagic { got: [u8; 4] },
    Oversized { length: u32, limit: usize },
    ChecksumMismatch { expected: [u8; 4], got: [u8; 4] },
    MalformedCommand,
    CommandTooLong,
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::BadMagic { got } => write!(
                f,
                "unmatched magic {:02x}{:02x}{:02x}{:02x}",
                got[0], got[1], got[2], got[3]
            ),
            FrameError::Oversized { length, limit } => {
                write!(f, "payload of {length} bytes exceeds {limit} byte cap")
            }
            FrameError::ChecksumMismatch { expected, got } => write!(
                f,
                "unmatched checksum, expecting {:02x}{:02x}{:02x}{:02x} got {:02x}{:02x}{:02x}{:02x}",
                expected[0], expected[1], expected[2], expected[3], got[0], got[1], got[2], got[3]
            ),
            FrameError::MalformedCommand => write!(f, "malformed command field"),
            FrameError::CommandTooLong => write!(f, "command longer than 12 bytes"),
        }
    }
}

impl std::error::Error for FrameError {}

pub fn body_checksum(body: &[u8]) -> [u8; 4] {
    if body.is_empty() {
        return EMPTY_MESSAGE_CHECKSUM;
    }
    let digest = sha256d(body);
    [digest[0], digest[1], digest[2], digest[3]]
}

/// Frame a message: magic, NUL-padded command, length, checksum, body.
pub fn build_frame(magic: [u8; 4], command: &str, body: &[u8]) -> Result<Vec<u8>, FrameError> {
    let cmd = command.as_bytes();
    if cmd.len() > COMMAND_LEN {
        return Err(FrameError::CommandTooLong);
    }
    let mut frame = Vec::with_capacity(MESSAGE_HEADER_LEN + body.len());
    frame.extend_from_slice(&magic);
    let mut command_bytes = [0u8; COMMAND_LEN];
    command_bytes[..cmd.len()].copy_from_slice(cmd);
    frame.extend_from_slice(&command_bytes);
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body_checksum(body));
    frame.extend_from_slice(body);
    Ok(frame)
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FrameHeader {
    pub command: String,
    pub length: u32,
    pub checksum: [u8; 4],
}

/// Validate the 24-byte envelope: magic, a NUL-terminated command with
/// nothing after the terminator, and a body length under the cap.
pub fn parse_frame_header(
    bytes: &[u8; MESSAGE_HEADER_LEN],
    magic: [u8; 4],
    max_size: usize,
) -> Result<FrameHeader, FrameError> {
    if bytes[..4] != magic {
        let mut got = [0u8; 4];
        got.copy_from_slice(&bytes[..4]);
        return Err(FrameError::BadMagic { got });
    }

    let command_field = &bytes[4..16];
    let nul = command_field
        .iter()
        .position(|byte| *byte == 0)
        .ok_or(FrameError::MalformedCommand)?;
    if command_field[nul..].iter().any(|byte| *byte != 0) {
        return Err(FrameError::MalformedCommand);
    }
    let command = std::str::from_utf8(&command_field[..nul])
        .map_err(|_| FrameError::MalformedCommand)?
        .to_string();

    let length = u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
    if length as usize > max_size {
        return Err(FrameError::Oversized {
            length,
            limit: max_size,
        });
    }

    let mut checksum = [0u8; 4];
    checksum.copy_from_slice(&bytes[20..24]);
    Ok(FrameHeader {
        command,
        length,
        checksum,
    })
}

pub fn verify_body(header: &FrameHeader, body: &[u8]) -> Result<(), FrameError> {
    let got = body_checksum(body);
    if got != header.checksum {
        return Err(FrameError::ChecksumMismatch {
            expected: got,
            got: header.checksum,
        });
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PeerState {
    Connecting,
    VersionSent,
    VersionReceived,
    Ready,
    Syncing,
    Disconnected,
}

#[derive(Debug, Default)]
pub struct NetTotals {
    bytes_recv: AtomicU64,
    bytes_sent: AtomicU64,
    connections: AtomicUsize,
}

impl NetTotals {
    pub fn add_recv(&self, bytes: usize) {
        self.bytes_recv.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn add_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn inc_connections(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_connections(&self) {
        self.connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |value| {
                Some(value.saturating_sub(1))
            })
            .ok();
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn totals(&self) -> (u64, u64) {
        (
            self.bytes_recv.load(Ordering::Relaxed),
            self.bytes_sent.load(Ordering::Relaxed),
        )
    }
}

#[derive(Clone, Debug)]
pub struct PeerInfoSnapshot {
    pub addr: SocketAddr,
    pub state: PeerState,
    pub version: i32,
    pub user_agent: String,
    pub start_height: u32,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
}

#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: Mutex<HashMap<PeerId, PeerInfoSnapshot>>,
}

impl PeerRegistry {
    pub fn register(&self, id: PeerId, addr: SocketAddr) {
        if let Ok(mut peers) = self.peers.lock() {
            peers.insert(
                id,
                PeerInfoSnapshot {
                    addr,
                    state: PeerState::Connecting,
                    version: 0,
                    user_agent: String::new(),
                    start_height: 0,
                    bytes_sent: 0,
                    bytes_recv: 0,
                },
            );
        }
    }

    pub fn update_version(&self, id: PeerId, version: i32, user_agent: String, height: u32) {
        if let Ok(mut peers) = self.peers.lock() {
            if let Some(entry) = peers.get_mut(&id) {
                entry.version = version;
                entry.user_agent = user_agent;
                entry.start_height = height;
            }
        }
    }

    pub fn set_state(&self, id: PeerId, state: PeerState) {
        if let Ok(mut peers) = self.peers.lock() {
            if let Some(entry) = peers.get_mut(&id) {
                entry.state = state;
            }
        }
    }

    pub fn note_send(&self, id: PeerId, bytes: usize) {
        if let Ok(mut peers) = self.peers.lock() {
            if let Some(entry) = peers.get_mut(&id) {
                entry.bytes_sent = entry.bytes_sent.saturating_add(bytes as u64);
            }
        }
    }

    pub fn note_recv(&self, id: PeerId, bytes: usize) {
        if let Ok(mut peers) = self.peers.lock() {
            if let Some(entry) = peers.get_mut(&id) {
                entry.bytes_recv = entry.bytes_recv.saturating_add(bytes as u64);
            }
        }
    }

    pub fn remove(&self, id: PeerId) {
        if let Ok(mut peers) = self.peers.lock() {
            peers.remove(&id);
        }
    }

    pub fn snapshot(&self) -> Vec<PeerInfoSnapshot> {
        self.peers
            .lock()
            .map(|peers| peers.values().cloned().collect())
            .unwrap_or_default()
    }
}

/// Messages the reader task forwards to the sync coordinator.
#[derive(Debug)]
pub enum PeerEvent {
    Ready {
        height: u32,
        services: u64,
        latency: Duration,
    },
    Headers(Vec<BlockHeader>),
    Inv(InventoryMessage),
    NotFound(InventoryMessage),
    MerkleBlock(Box<MerkleBlock>),
    Tx(Box<Transaction>),
    Addr(Vec<SocketAddr>),
    GetAddr,
    Disconnected {
        reason: String,
        /// Whether the peer violated the protocol (as opposed to plain
        /// transport trouble); violations are blacklisted.
        misbehaved: bool,
    },
}

/// Commands the coordinator pushes down a peer's write path.
#[derive(Debug)]
pub enum PeerCommand {
    Send {
        command: &'static str,
        payload: Vec<u8>,
    },
    Disconnect,
}

pub struct Handshake {
    pub remote_version: i32,
    pub remote_services: u64,
    pub remote_height: u32,
    pub user_agent: String,
    pub latency: Duration,
}

async fn write_frame(
    stream: &mut (impl AsyncWriteExt + Unpin),
    magic: [u8; 4],
    command: &str,
    body: &[u8],
) -> Result<usize, String> {
    let frame = build_frame(magic, command, body).map_err(|err| err.to_string())?;
    stream
        .write_all(&frame)
        .await
        .map_err(|err| err.to_string())?;
    Ok(frame.len())
}

/// Transport trouble is not the peer's fault; framing violations are.
#[derive(Debug)]
enum ReadError {
    Io(String),
    Frame(String),
}

impl std::fmt::Display for ReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadError::Io(message) | ReadError::Frame(message) => write!(f, "{message}"),
        }
    }
}

async fn read_frame(
    stream: &mut (impl AsyncReadExt + Unpin),
    magic: [u8; 4],
    max_size: usize,
) -> Result<(String, Vec<u8>, usize), ReadError> {
    let mut header_bytes = [0u8; MESSAGE_HEADER_LEN];
    stream
        .read_exact(&mut header_bytes)
        .await
        .map_err(|err| ReadError::Io(err.to_string()))?;
    let header = parse_frame_header(&header_bytes, magic, max_size)
        .map_err(|err| ReadError::Frame(err.to_string()))?;
    let mut body = vec![0u8; header.length as usize];
    stream
        .read_exact(&mut body)
        .await
        .map_err(|err| ReadError::Io(err.to_string()))?;
    verify_body(&header, &body).map_err(|err| ReadError::Frame(err.to_string()))?;
    let total = MESSAGE_HEADER_LEN + body.len();
    Ok((header.command, body, total))
}

fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0)
}

/// Version/verack exchange. Detects our own nonce coming back (loopback)
/// and answers pings that arrive mid-handshake.
pub async fn handshake(
    stream: &mut TcpStream,
    params: &ChainParams,
    local_nonce: u64,
    start_height: u32,
    registry: &PeerRegistry,
    id: PeerId,
) -> Result<Handshake, String> {
    let magic = params.message_start;
    let version = VersionMessage {
        version: PROTOCOL_VERSION as i32,
        services: SERVICES_NONE,
        timestamp: unix_timestamp(),
        addr_recv: crate::msg::NetAddress::unroutable(0),
        addr_from: crate::msg::NetAddress::unroutable(SERVICES_NONE),
        nonce: local_nonce,
        user_agent: params.user_agent.to_string(),
        start_height: start_height as i32,
        relay: false,
    };
    let sent_at = Instant::now();
    write_frame(stream, magic, commands::VERSION, &to_bytes(&version)).await?;

    let mut remote: Option<VersionMessage> = None;
    let mut latency = Duration::ZERO;
    let mut got_verack = false;
    while remote.is_none() || !got_verack {
        let (command, body, _) = read_frame(stream, magic, params.max_message_size)
            .await
            .map_err(|err| err.to_string())?;
        match command.as_str() {
            commands::VERSION => {
                let message: VersionMessage =
                    from_bytes(&body).map_err(|err| format!("bad version message: {err}"))?;
                if message.nonce == local_nonce {
                    return Err("connected to self".to_string());
                }
                latency = sent_at.elapsed();
                registry.set_state(id, PeerState::VersionReceived);
                write_frame(stream, magic, commands::VERACK, &[]).await?;
                remote = Some(message);
            }
            commands::VERACK => {
                got_verack = true;
            }
            commands::PING => {
                write_frame(stream, magic, commands::PONG, &body).await?;
            }
            other => {
                debug!("ignoring {other} during handshake");
            }
        }
    }

    let message = remote.ok_or_else(|| "handshake ended without version".to_string())?;
    Ok(Handshake {
        remote_version: message.version,
        remote_services: message.services,
        remote_height: message.start_height.max(0) as u32,
        user_agent: message.user_agent,
        latency,
    })
}

struct WriterTask {
    write_half: OwnedWriteHalf,
    magic: [u8; 4],
    id: PeerId,
    registry: Arc<PeerRegistry>,
    net_totals: Arc<NetTotals>,
}

impl WriterTask {
    async fn run(mut self, mut command_rx: mpsc::Receiver<PeerCommand>) {
        while let Some(command) = command_rx.recv().await {
            match command {
                PeerCommand::Send { command, payload } => {
                    match write_frame(&mut self.write_half, self.magic, command, &payload).await {
                        Ok(bytes) => {
                            self.net_totals.add_sent(bytes);
                            self.registry.note_send(self.id, bytes);
                        }
                        Err(err) => {
                            debug!("peer {} write failed: {err}", self.id);
                            break;
                        }
                    }
                }
                PeerCommand::Disconnect => break,
            }
        }
        let _ = self.write_half.shutdown().await;
    }
}

/// One peer connection: connect, handshake, push the bloom filter, then
/// read until disconnect. Events flow to the coordinator; its replies come
/// back through the command channel.
#[allow(clippy::too_many_arguments)]
pub async fn run_peer(
    id: PeerId,
    addr: SocketAddr,
    params: Arc<ChainParams>,
    start_height: u32,
    filter_load: Vec<u8>,
    events: mpsc::Sender<(PeerId, PeerEvent)>,
    command_tx: mpsc::Sender<PeerCommand>,
    command_rx: mpsc::Receiver<PeerCommand>,
    registry: Arc<PeerRegistry>,
    net_totals: Arc<NetTotals>,
    mut shutdown: watch::Receiver<bool>,
    connect_timeout: Duration,
    handshake_timeout: Duration,
) {
    registry.register(id, addr);
    let disconnect = |reason: String, misbehaved: bool| {
        let events = events.clone();
        async move {
            let _ = events
                .send((id, PeerEvent::Disconnected { reason, misbehaved }))
                .await;
        }
    };

    let mut stream = match timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            registry.remove(id);
            disconnect(format!("connect failed: {err}"), false).await;
            return;
        }
        Err(_) => {
            registry.remove(id);
            disconnect("connect timed out".to_string(), false).await;
            return;
        }
    };
    net_totals.inc_connections();
    registry.set_state(id, PeerState::VersionSent);

    let local_nonce: u64 = rand::random();
    let shake = match timeout(
        handshake_timeout,
        handshake(&mut stream, &params, local_nonce, start_height, &registry, id),
    )
    .await
    {
        Ok(Ok(shake)) => shake,
        Ok(Err(err)) => {
            net_totals.dec_connections();
            registry.remove(id);
            disconnect(format!("handshake failed: {err}"), true).await;
            return;
        }
        Err(_) => {
            net_totals.dec_connections();
            registry.remove(id);
            disconnect("handshake timed out".to_string(), false).await;
            return;
        }
    };
    registry.set_state(id, PeerState::Ready);
    registry.update_version(id, shake.remote_version, shake.user_agent, shake.remote_height);

    let magic = params.message_start;
    let max_size = params.max_message_size;
    let (read_half, write_half) = stream.into_split();

    let writer = WriterTask {
        write_half,
        magic,
        id,
        registry: Arc::clone(&registry),
        net_totals: Arc::clone(&net_totals),
    };
    let writer_handle = tokio::spawn(writer.run(command_rx));

    // The filter goes out before anything else so every subsequent block
    // request is served filtered.
    let _ = command_tx
        .send(PeerCommand::Send {
            command: commands::FILTERLOAD,
            payload: filter_load,
        })
        .await;

    if events
        .send((
            id,
            PeerEvent::Ready {
                height: shake.remote_height,
                services: shake.remote_services,
                latency: shake.latency,
            },
        ))
        .await
        .is_err()
    {
        writer_handle.abort();
        net_totals.dec_connections();
        registry.remove(id);
        return;
    }

    let reason = read_loop(
        id,
        read_half,
        magic,
        max_size,
        &events,
        &command_tx,
        &registry,
        &net_totals,
        &mut shutdown,
    )
    .await;

    let _ = command_tx.send(PeerCommand::Disconnect).await;
    let _ = writer_handle.await;
    net_totals.dec_connections();
    registry.set_state(id, PeerState::Disconnected);
    registry.remove(id);
    match reason {
        Ok(()) => disconnect("shutdown".to_string(), false).await,
        Err((reason, misbehaved)) => disconnect(reason, misbehaved).await,
    }
}

#[allow(clippy::too_many_arguments)]
async fn read_loop(
    id: PeerId,
    mut read_half: OwnedReadHalf,
    magic: [u8; 4],
    max_size: usize,
    events: &mpsc::Sender<(PeerId, PeerEvent)>,
    command_tx: &mpsc::Sender<PeerCommand>,
    registry: &Arc<PeerRegistry>,
    net_totals: &Arc<NetTotals>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), (String, bool)> {
    let ping_interval = Duration::from_secs(PING_INTERVAL_SECS);
    let pong_deadline = Duration::from_secs(PONG_TIMEOUT_SECS);
    let mut pending_ping: Option<(u64, Instant)> = None;

    loop {
        let wait = match pending_ping {
            Some((_, sent_at)) => pong_deadline
                .checked_sub(sent_at.elapsed())
                .unwrap_or(Duration::ZERO),
            None => ping_interval,
        };

        let read = timeout(wait, read_frame(&mut read_half, magic, max_size));
        let outcome = tokio::select! {
            outcome = read => outcome,
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
                continue;
            }
        };

        let (command, body, total) = match outcome {
            Ok(Ok(message)) => message,
            Ok(Err(ReadError::Frame(err))) => return Err((err, true)),
            Ok(Err(ReadError::Io(err))) => return Err((err, false)),
            Err(_) => {
                if pending_ping.is_some() {
                    return Err(("ping timed out".to_string(), false));
                }
                let nonce: u64 = rand::random();
                pending_ping = Some((nonce, Instant::now()));
                let payload = to_bytes(&PingMessage { nonce });
                if command_tx
                    .send(PeerCommand::Send {
                        command: commands::PING,
                        payload,
                    })
                    .await
                    .is_err()
                {
                    return Err(("write path closed".to_string(), false));
                }
                continue;
            }
        };

        net_totals.add_recv(total);
        registry.note_recv(id, total);

        let forward = |event: PeerEvent| {
            let events = events.clone();
            async move { events.send((id, event)).await.map_err(|_| ()) }
        };

        let parse_failure = |what: &str, err: elaspv_primitives::encoding::DecodeError| {
            (format!("bad {what} message: {err}"), true)
        };

        match command.as_str() {
            commands::PING => {
                // Echo the nonce straight back.
                if command_tx
                    .send(PeerCommand::Send {
                        command: commands::PONG,
                        payload: body,
                    })
                    .await
                    .is_err()
                {
                    return Err(("write path closed".to_string(), false));
                }
            }
            commands::PONG => {
                let message: PingMessage =
                    from_bytes(&body).map_err(|err| parse_failure("pong", err))?;
                match pending_ping {
                    Some((nonce, _)) if nonce == message.nonce => pending_ping = None,
                    _ => debug!("peer {id}: unsolicited pong"),
                }
            }
            commands::HEADERS => {
                let message: HeadersMessage =
                    from_bytes(&body).map_err(|err| parse_failure("headers", err))?;
                if forward(PeerEvent::Headers(message.headers)).await.is_err() {
                    return Ok(());
                }
            }
            commands::INV => {
                let message: InventoryMessage =
                    from_bytes(&body).map_err(|err| parse_failure("inv", err))?;
                if forward(PeerEvent::Inv(message)).await.is_err() {
                    return Ok(());
                }
            }
            commands::NOTFOUND => {
                let message: InventoryMessage =
                    from_bytes(&body).map_err(|err| parse_failure("notfound", err))?;
                if forward(PeerEvent::NotFound(message)).await.is_err() {
                    return Ok(());
                }
            }
            commands::MERKLEBLOCK => {
                let message: MerkleBlock =
                    from_bytes(&body).map_err(|err| parse_failure("merkleblock", err))?;
                if forward(PeerEvent::MerkleBlock(Box::new(message))).await.is_err() {
                    return Ok(());
                }
            }
            commands::TX => {
                let message: Transaction =
                    from_bytes(&body).map_err(|err| parse_failure("tx", err))?;
                if forward(PeerEvent::Tx(Box::new(message))).await.is_err() {
                    return Ok(());
                }
            }
            commands::ADDR => {
                let message: AddrMessage =
                    from_bytes(&body).map_err(|err| parse_failure("addr", err))?;
                let addrs = message
                    .addresses
                    .iter()
                    .map(|entry| entry.address.socket_addr())
                    .filter(|addr| !addr.ip().is_unspecified() && addr.port() != 0)
                    .collect();
                if forward(PeerEvent::Addr(addrs)).await.is_err() {
                    return Ok(());
                }
            }
            commands::GETADDR => {
                if forward(PeerEvent::GetAddr).await.is_err() {
                    return Ok(());
                }
            }
            commands::REJECT => {
                if let Ok(message) = from_bytes::<RejectMessage>(&body) {
                    match message.hash {
                        Some(hash) => warn!(
                            "peer {id} rejected {} {:02x}{:02x}..: {} ({:#x})",
                            message.message, hash[0], hash[1], message.reason, message.code
                        ),
                        None => warn!(
                            "peer {id} rejected {}: {} ({:#x})",
                            message.message, message.reason, message.code
                        ),
                    }
                }
            }
            other if commands::ALL.contains(&other) => {
                // Valid but unexpected for a light client; skip the body.
                debug!("peer {id}: ignoring {other}");
            }
            other => {
                debug!("peer {id}: unknown command {other}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGIC: [u8; 4] = [0x0e, 0x1a, 0xf5, 0x2d];
    const MAX: usize = 32 * 1024 * 1024;

    fn header_of(frame: &[u8]) -> [u8; MESSAGE_HEADER_LEN] {
        frame[..MESSAGE_HEADER_LEN].try_into().unwrap()
    }

    #[test]
    fn empty_body_checksum_matches_the_known_constant() {
        assert_eq!(body_checksum(&[]), EMPTY_MESSAGE_CHECKSUM);
    }

    #[test]
    fn frame_roundtrip() {
        let body = b"ping-body".to_vec();
        let frame = build_frame(MAGIC, "ping", &body).unwrap();
        let header = parse_frame_header(&header_of(&frame), MAGIC, MAX).unwrap();
        assert_eq!(header.command, "ping");
        assert_eq!(header.length as usize, body.len());
        verify_body(&header, &body).unwrap();
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let frame = build_frame(MAGIC, "verack", &[]).unwrap();
        let err = parse_frame_header(&header_of(&frame), [9, 9, 9, 9], MAX).unwrap_err();
        assert_eq!(err, FrameError::BadMagic { got: MAGIC });
    }

    #[test]
    fn oversized_length_is_rejected() {
        let mut frame = build_frame(MAGIC, "tx", &[]).unwrap();
        frame[16..20].copy_from_slice(&(64u32 * 1024 * 1024).to_le_bytes());
        let err = parse_frame_header(&header_of(&frame), MAGIC, MAX).unwrap_err();
        assert!(matches!(err, FrameError::Oversized { .. }));
    }

    #[test]
    fn checksum_mismatch_is_rejected() {
        let body = b"payload".to_vec();
        let frame = build_frame(MAGIC, "tx", &body).unwrap();
        let header = parse_frame_header(&header_of(&frame), MAGIC, MAX).unwrap();
        let err = verify_body(&header, b"tampered").unwrap_err();
        assert!(matches!(err, FrameError::ChecksumMismatch { .. }));
        // The report carries real hex on both sides.
        let text = err.to_string();
        assert!(text.contains("expecting"));
        assert!(!text.contains("$s"));
    }

    #[test]
    fn bytes_after_the_command_terminator_are_rejected() {
        let frame = build_frame(MAGIC, "ping", &[]).unwrap();
        let mut bytes = header_of(&frame);
        // Junk after the first NUL in the command field.
        bytes[10] = b'x';
        assert_eq!(
            parse_frame_header(&bytes, MAGIC, MAX).unwrap_err(),
            FrameError::MalformedCommand
        );
    }

    #[test]
    fn unterminated_command_is_rejected() {
        let frame = build_frame(MAGIC, "ping", &[]).unwrap();
        let mut bytes = header_of(&frame);
        for byte in bytes[4..16].iter_mut() {
            *byte = b'a';
        }
        assert_eq!(
            parse_frame_header(&bytes, MAGIC, MAX).unwrap_err(),
            FrameError::MalformedCommand
        );
    }

    #[test]
    fn overlong_command_cannot_be_built() {
        assert_eq!(
            build_frame(MAGIC, "thirteen-char", &[]).unwrap_err(),
            FrameError::CommandTooLong
        );
    }
}

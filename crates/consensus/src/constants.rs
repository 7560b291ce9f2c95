//! Protocol-wide constants shared across the client.

/// Current network protocol version for P2P messages.
pub const PROTOCOL_VERSION: u32 = 10_005;

/// Service bit advertised by full nodes.
pub const NODE_NETWORK: u64 = 1;
/// Service bit advertised by nodes that accept bloom-filtered requests.
pub const NODE_BLOOM: u64 = 4;
/// Services an SPV client advertises about itself.
pub const SERVICES_NONE: u64 = 0;

/// Hard cap on a single message body. Anything larger is a protocol
/// violation regardless of command.
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

/// Upper bound on one `headers` response (network rule).
pub const MAX_HEADERS_RESULTS: usize = 2_000;
/// Upper bound on one `inv`/`getdata`/`notfound` listing (network rule).
pub const MAX_INV_RESULTS: usize = 50_000;
/// Upper bound on one `addr` listing (network rule).
pub const MAX_ADDR_RESULTS: usize = 1_000;

/// Seconds of write-idle before a ping probe is sent.
pub const PING_INTERVAL_SECS: u64 = 120;
/// Seconds allowed for the matching pong before the peer is dropped.
pub const PONG_TIMEOUT_SECS: u64 = 60;
/// Seconds allowed for one `headers` response while syncing.
pub const SYNC_RESPONSE_TIMEOUT_SECS: u64 = 30;
/// Seconds without sync progress before the sync peer is replaced.
pub const SYNC_STALL_SECS: u64 = 30;
/// Seconds a misbehaving peer stays blacklisted.
pub const PEER_BLACKLIST_SECS: u64 = 300;

/// Merkle blocks requested per `getdata` batch during catch-up.
pub const FILTERED_BLOCK_BATCH: usize = 16;

/// Bound on inbound per-peer event channels; a peer that outruns the
/// coordinator blocks on send.
pub const PEER_CHANNEL_BOUND: usize = 128;

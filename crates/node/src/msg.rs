//! Message bodies for the peer-to-peer protocol.
//!
//! Builders and parsers over the primitives codec; the 24-byte envelope
//! lives in the p2p module.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use elaspv_bloom::BloomFilter;
use elaspv_consensus::constants::{MAX_ADDR_RESULTS, MAX_HEADERS_RESULTS, MAX_INV_RESULTS};
use elaspv_consensus::Hash256;
use elaspv_primitives::encoding::{
    DecodeError, Decoder, Encoder, WireDecode, WireEncode,
};
use elaspv_primitives::BlockHeader;

pub mod commands {
    pub const VERSION: &str = "version";
    pub const VERACK: &str = "verack";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const ADDR: &str = "addr";
    pub const GETADDR: &str = "getaddr";
    pub const INV: &str = "inv";
    pub const GETDATA: &str = "getdata";
    pub const NOTFOUND: &str = "notfound";
    pub const GETBLOCKS: &str = "getblocks";
    pub const GETHEADERS: &str = "getheaders";
    pub const HEADERS: &str = "headers";
    pub const TX: &str = "tx";
    pub const MERKLEBLOCK: &str = "merkleblock";
    pub const FILTERLOAD: &str = "filterload";
    pub const FILTERADD: &str = "filteradd";
    pub const FILTERCLEAR: &str = "filterclear";
    pub const REJECT: &str = "reject";

    /// Every command this protocol revision speaks.
    pub const ALL: [&str; 18] = [
        VERSION, VERACK, PING, PONG, ADDR, GETADDR, INV, GETDATA, NOTFOUND, GETBLOCKS,
        GETHEADERS, HEADERS, TX, MERKLEBLOCK, FILTERLOAD, FILTERADD, FILTERCLEAR, REJECT,
    ];
}

pub const INV_TYPE_TX: u32 = 1;
pub const INV_TYPE_BLOCK: u32 = 2;
pub const INV_TYPE_FILTERED_BLOCK: u32 = 3;

const MAX_USER_AGENT: u64 = 256;
const MAX_LOCATOR_HASHES: u64 = 101;
const MAX_FILTER_BYTES: u64 = 36_000;
const MAX_FILTER_ADD_BYTES: u64 = 520;
const MAX_REJECT_STRING: u64 = 111;

/// A 26-byte network address record: services, ipv6-mapped address and
/// big-endian port.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NetAddress {
    pub services: u64,
    pub ip: [u8; 16],
    pub port: u16,
}

impl NetAddress {
    pub fn unroutable(services: u64) -> Self {
        Self {
            services,
            ip: [0u8; 16],
            port: 0,
        }
    }

    pub fn from_socket_addr(addr: &SocketAddr, services: u64) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        };
        Self {
            services,
            ip,
            port: addr.port(),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        let ip6 = Ipv6Addr::from(self.ip);
        let ip = match ip6.to_ipv4_mapped() {
            Some(ip4) => IpAddr::V4(ip4),
            None => IpAddr::V6(ip6),
        };
        SocketAddr::new(ip, self.port)
    }
}

impl WireEncode for NetAddress {
    fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_u64_le(self.services);
        encoder.write_bytes(&self.ip);
        encoder.write_bytes(&self.port.to_be_bytes());
    }
}

impl WireDecode for NetAddress {
    fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let services = decoder.read_u64_le()?;
        let ip = decoder.read_fixed::<16>()?;
        let port = u16::from_be_bytes(decoder.read_fixed::<2>()?);
        Ok(Self { services, ip, port })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VersionMessage {
    pub version: i32,
    pub services: u64,
    pub timestamp: i64,
    pub addr_recv: NetAddress,
    pub addr_from: NetAddress,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

impl WireEncode for VersionMessage {
    fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_u64_le(self.services);
        encoder.write_i64_le(self.timestamp);
        self.addr_recv.encode_into(encoder);
        self.addr_from.encode_into(encoder);
        encoder.write_u64_le(self.nonce);
        encoder.write_var_str(&self.user_agent);
        encoder.write_i32_le(self.start_height);
        encoder.write_u8(u8::from(self.relay));
    }
}

impl WireDecode for VersionMessage {
    fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;
        let services = decoder.read_u64_le()?;
        let timestamp = decoder.read_i64_le()?;
        let addr_recv = NetAddress::decode_from(decoder)?;
        let addr_from = NetAddress::decode_from(decoder)?;
        let nonce = decoder.read_u64_le()?;
        let user_agent = decoder.read_var_str(MAX_USER_AGENT)?;
        let start_height = decoder.read_i32_le()?;
        let relay = decoder.read_u8()? != 0;
        Ok(Self {
            version,
            services,
            timestamp,
            addr_recv,
            addr_from,
            nonce,
            user_agent,
            start_height,
            relay,
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PingMessage {
    pub nonce: u64,
}

impl WireEncode for PingMessage {
    fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_u64_le(self.nonce);
    }
}

impl WireDecode for PingMessage {
    fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            nonce: decoder.read_u64_le()?,
        })
    }
}

/// One gossiped peer address with its last-seen timestamp.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TimestampedAddress {
    pub timestamp: u32,
    pub address: NetAddress,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AddrMessage {
    pub addresses: Vec<TimestampedAddress>,
}

impl WireEncode for AddrMessage {
    fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_varint(self.addresses.len() as u64);
        for entry in &self.addresses {
            encoder.write_u32_le(entry.timestamp);
            entry.address.encode_into(encoder);
        }
    }
}

impl WireDecode for AddrMessage {
    fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let count = decoder.read_varint_max(MAX_ADDR_RESULTS as u64)?;
        let mut addresses = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let timestamp = decoder.read_u32_le()?;
            let address = NetAddress::decode_from(decoder)?;
            addresses.push(TimestampedAddress { timestamp, address });
        }
        Ok(Self { addresses })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Inventory {
    pub inv_type: u32,
    pub hash: Hash256,
}

/// Shared body of `inv`, `getdata` and `notfound`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InventoryMessage {
    pub items: Vec<Inventory>,
}

impl InventoryMessage {
    pub fn filtered_blocks(hashes: &[Hash256]) -> Self {
        Self {
            items: hashes
                .iter()
                .map(|hash| Inventory {
                    inv_type: INV_TYPE_FILTERED_BLOCK,
                    hash: *hash,
                })
                .collect(),
        }
    }

    pub fn transactions(hashes: &[Hash256]) -> Self {
        Self {
            items: hashes
                .iter()
                .map(|hash| Inventory {
                    inv_type: INV_TYPE_TX,
                    hash: *hash,
                })
                .collect(),
        }
    }
}

impl WireEncode for InventoryMessage {
    fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_varint(self.items.len() as u64);
        for item in &self.items {
            encoder.write_u32_le(item.inv_type);
            encoder.write_hash(&item.hash);
        }
    }
}

impl WireDecode for InventoryMessage {
    fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let count = decoder.read_varint_max(MAX_INV_RESULTS as u64)?;
        let mut items = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let inv_type = decoder.read_u32_le()?;
            let hash = decoder.read_hash()?;
            items.push(Inventory { inv_type, hash });
        }
        Ok(Self { items })
    }
}

/// Shared body of `getheaders` and `getblocks`: a sparse locator plus a
/// stop hash (zero for "as many as allowed").
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GetHeadersMessage {
    pub version: u32,
    pub locator: Vec<Hash256>,
    pub stop: Hash256,
}

impl WireEncode for GetHeadersMessage {
    fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_u32_le(self.version);
        encoder.write_varint(self.locator.len() as u64);
        for hash in &self.locator {
            encoder.write_hash(hash);
        }
        encoder.write_hash(&self.stop);
    }
}

impl WireDecode for GetHeadersMessage {
    fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let version = decoder.read_u32_le()?;
        let count = decoder.read_varint_max(MAX_LOCATOR_HASHES)?;
        let mut locator = Vec::with_capacity(count as usize);
        for _ in 0..count {
            locator.push(decoder.read_hash()?);
        }
        let stop = decoder.read_hash()?;
        Ok(Self {
            version,
            locator,
            stop,
        })
    }
}

/// A `headers` response. Each header carries a trailing varint tx count,
/// the SPV convention inherited from the parent protocol.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct HeadersMessage {
    pub headers: Vec<BlockHeader>,
}

impl WireEncode for HeadersMessage {
    fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_varint(self.headers.len() as u64);
        for header in &self.headers {
            header.encode_into(encoder);
            encoder.write_varint(0);
        }
    }
}

impl WireDecode for HeadersMessage {
    fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let count = decoder.read_varint_max(MAX_HEADERS_RESULTS as u64)?;
        let mut headers = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let header = BlockHeader::decode_from(decoder)?;
            let _tx_count = decoder.read_varint()?;
            headers.push(header);
        }
        Ok(Self { headers })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FilterLoadMessage {
    pub filter: Vec<u8>,
    pub n_hash_funcs: u32,
    pub n_tweak: u32,
    pub n_flags: u8,
}

impl FilterLoadMessage {
    pub fn from_filter(filter: &BloomFilter) -> Self {
        Self {
            filter: filter.data().to_vec(),
            n_hash_funcs: filter.n_hash_funcs(),
            n_tweak: filter.tweak(),
            n_flags: filter.flags(),
        }
    }
}

impl WireEncode for FilterLoadMessage {
    fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_var_bytes(&self.filter);
        encoder.write_u32_le(self.n_hash_funcs);
        encoder.write_u32_le(self.n_tweak);
        encoder.write_u8(self.n_flags);
    }
}

impl WireDecode for FilterLoadMessage {
    fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let filter = decoder.read_var_bytes_max(MAX_FILTER_BYTES)?;
        let n_hash_funcs = decoder.read_u32_le()?;
        let n_tweak = decoder.read_u32_le()?;
        let n_flags = decoder.read_u8()?;
        Ok(Self {
            filter,
            n_hash_funcs,
            n_tweak,
            n_flags,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FilterAddMessage {
    pub data: Vec<u8>,
}

impl WireEncode for FilterAddMessage {
    fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_var_bytes(&self.data);
    }
}

impl WireDecode for FilterAddMessage {
    fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            data: decoder.read_var_bytes_max(MAX_FILTER_ADD_BYTES)?,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RejectMessage {
    pub message: String,
    pub code: u8,
    pub reason: String,
    /// Hash of the rejected object, when one applies.
    pub hash: Option<Hash256>,
}

impl WireEncode for RejectMessage {
    fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_var_str(&self.message);
        encoder.write_u8(self.code);
        encoder.write_var_str(&self.reason);
        if let Some(hash) = &self.hash {
            encoder.write_hash(hash);
        }
    }
}

impl WireDecode for RejectMessage {
    fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let message = decoder.read_var_str(MAX_REJECT_STRING)?;
        let code = decoder.read_u8()?;
        let reason = decoder.read_var_str(MAX_REJECT_STRING)?;
        let hash = if decoder.remaining() >= 32 {
            Some(decoder.read_hash()?)
        } else {
            None
        };
        Ok(Self {
            message,
            code,
            reason,
            hash,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use elaspv_primitives::encoding::{from_bytes, to_bytes};

    fn sample_header(height: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_block: [height as u8; 32],
            merkle_root: [0x22; 32],
            timestamp: 1_700_000_000 + height,
            bits: 0x1d00_ffff,
            height,
            nonce: height * 7,
            aux_payload: Vec::new(),
        }
    }

    #[test]
    fn version_roundtrip() {
        let message = VersionMessage {
            version: 10_005,
            services: 0,
            timestamp: 1_700_000_123,
            addr_recv: NetAddress::from_socket_addr(&"203.0.113.9:20866".parse().unwrap(), 1),
            addr_from: NetAddress::unroutable(0),
            nonce: 0x1122_3344_5566_7788,
            user_agent: "/elaspv-rust:0.1.0/".to_string(),
            start_height: 812,
            relay: false,
        };
        let bytes = to_bytes(&message);
        assert_eq!(from_bytes::<VersionMessage>(&bytes).unwrap(), message);
    }

    #[test]
    fn net_address_maps_ipv4() {
        let addr: SocketAddr = "192.0.2.5:8080".parse().unwrap();
        let encoded = NetAddress::from_socket_addr(&addr, 0);
        assert_eq!(encoded.socket_addr(), addr);
    }

    #[test]
    fn headers_roundtrip_with_trailing_tx_counts() {
        let message = HeadersMessage {
            headers: (1..=5).map(sample_header).collect(),
        };
        let bytes = to_bytes(&message);
        assert_eq!(from_bytes::<HeadersMessage>(&bytes).unwrap(), message);
    }

    #[test]
    fn headers_count_is_capped() {
        let mut encoder = Encoder::new();
        encoder.write_varint(MAX_HEADERS_RESULTS as u64 + 1);
        let bytes = encoder.into_inner();
        assert_eq!(
            from_bytes::<HeadersMessage>(&bytes),
            Err(DecodeError::Range)
        );
    }

    #[test]
    fn inventory_roundtrip() {
        let message = InventoryMessage {
            items: vec![
                Inventory {
                    inv_type: INV_TYPE_BLOCK,
                    hash: [0x31; 32],
                },
                Inventory {
                    inv_type: INV_TYPE_TX,
                    hash: [0x32; 32],
                },
            ],
        };
        let bytes = to_bytes(&message);
        assert_eq!(from_bytes::<InventoryMessage>(&bytes).unwrap(), message);
    }

    #[test]
    fn getheaders_roundtrip() {
        let message = GetHeadersMessage {
            version: 10_005,
            locator: vec![[0x01; 32], [0x02; 32]],
            stop: [0u8; 32],
        };
        let bytes = to_bytes(&message);
        assert_eq!(from_bytes::<GetHeadersMessage>(&bytes).unwrap(), message);
    }

    #[test]
    fn filterload_roundtrip() {
        let filter = BloomFilter::new(20, 0.001, 0xABCD, 1);
        let message = FilterLoadMessage::from_filter(&filter);
        let bytes = to_bytes(&message);
        assert_eq!(from_bytes::<FilterLoadMessage>(&bytes).unwrap(), message);
    }

    #[test]
    fn reject_roundtrip_with_and_without_hash() {
        let with_hash = RejectMessage {
            message: "tx".to_string(),
            code: 0x10,
            reason: "bad-txns".to_string(),
            hash: Some([0x44; 32]),
        };
        let bytes = to_bytes(&with_hash);
        assert_eq!(from_bytes::<RejectMessage>(&bytes).unwrap(), with_hash);

        let without = RejectMessage {
            message: "version".to_string(),
            code: 0x11,
            reason: "obsolete".to_string(),
            hash: None,
        };
        let bytes = to_bytes(&without);
        assert_eq!(from_bytes::<RejectMessage>(&bytes).unwrap(), without);
    }

    #[test]
    fn addr_roundtrip() {
        let message = AddrMessage {
            addresses: vec![TimestampedAddress {
                timestamp: 1_700_000_000,
                address: NetAddress::from_socket_addr(&"198.51.100.7:20866".parse().unwrap(), 1),
            }],
        };
        let bytes = to_bytes(&message);
        assert_eq!(from_bytes::<AddrMessage>(&bytes).unwrap(), message);
    }
}

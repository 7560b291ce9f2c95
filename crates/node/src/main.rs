mod msg;
mod p2p;
mod peer_book;
mod sync;

use std::collections::{HashMap, HashSet};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use elaspv_chainstate::{AddrFilter, ChainState, Ledger, Notifier, Proof, TransactionListener};
use elaspv_consensus::{chain_params, Hash168, Network};
use elaspv_primitives::Transaction;
use elaspv_storage::memory::MemoryStore;
use elaspv_storage::KeyValueStore;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::p2p::{NetTotals, PeerRegistry};
use crate::peer_book::PeerBook;
use crate::sync::{SyncConfig, SyncCoordinator};

const DEFAULT_DATA_DIR: &str = "data";
const DEFAULT_TARGET_PEERS: usize = 4;
const DEFAULT_FP_RATE: f64 = 0.000_1;
const DEFAULT_STATUS_INTERVAL_SECS: u64 = 30;
const PEERS_FILE_NAME: &str = "peers.dat";
const PEERS_FILE_VERSION: u32 = 1;
const PEERS_PERSIST_INTERVAL_SECS: u64 = 60;
const ADDR_BOOK_MAX: usize = 5_000;
const ADDR_RETRY_BASE_SECS: u64 = 30;
const ADDR_RETRY_CAP_SECS: u64 = 3_600;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Backend {
    Memory,
    Fjall,
}

impl Backend {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "memory" => Some(Self::Memory),
            "fjall" => Some(Self::Fjall),
            _ => None,
        }
    }
}

struct Config {
    backend: Backend,
    data_dir: PathBuf,
    network: Network,
    addnode_addrs: Vec<SocketAddr>,
    watch_addresses: Vec<Hash168>,
    target_peers: usize,
    fp_rate: f64,
    status_interval_secs: u64,
}

fn usage() -> String {
    [
        "usage: elaspv [options]",
        "  --backend <memory|fjall>   storage backend (default fjall)",
        "  --data-dir <path>          data directory (default ./data)",
        "  --network <mainnet|testnet|regtest>",
        "  --addnode <host:port>      peer to connect to (repeatable)",
        "  --watch <hex>              21-byte address hash to watch (repeatable)",
        "  --peers <n>                outbound connection target",
        "  --fp-rate <float>          bloom filter false-positive rate",
        "  --status-interval <secs>   status log interval",
    ]
    .join("\n")
}

fn parse_hex_bytes(value: &str) -> Option<Vec<u8>> {
    if value.len() % 2 != 0 {
        return None;
    }
    let mut bytes = Vec::with_capacity(value.len() / 2);
    let mut chars = value.chars();
    while let (Some(high), Some(low)) = (chars.next(), chars.next()) {
        let high = high.to_digit(16)? as u8;
        let low = low.to_digit(16)? as u8;
        bytes.push(high << 4 | low);
    }
    Some(bytes)
}

fn parse_args() -> Result<Config, String> {
    let mut backend = Backend::Fjall;
    let mut data_dir: Option<PathBuf> = None;
    let mut network = Network::Mainnet;
    let mut addnode_addrs = Vec::new();
    let mut watch_addresses = Vec::new();
    let mut target_peers = DEFAULT_TARGET_PEERS;
    let mut fp_rate = DEFAULT_FP_RATE;
    let mut status_interval_secs = DEFAULT_STATUS_INTERVAL_SECS;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--backend" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --backend\n{}", usage()))?;
                backend = Backend::parse(&value)
                    .ok_or_else(|| format!("invalid backend '{value}'\n{}", usage()))?;
            }
            "--data-dir" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --data-dir\n{}", usage()))?;
                data_dir = Some(PathBuf::from(value));
            }
            "--network" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --network\n{}", usage()))?;
                network = Network::parse(&value)
                    .ok_or_else(|| format!("invalid network '{value}'\n{}", usage()))?;
            }
            "--addnode" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --addnode\n{}", usage()))?;
                let addr = value
                    .parse()
                    .map_err(|_| format!("invalid addnode '{value}'\n{}", usage()))?;
                addnode_addrs.push(addr);
            }
            "--watch" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --watch\n{}", usage()))?;
                let bytes = parse_hex_bytes(&value)
                    .filter(|bytes| bytes.len() == 21)
                    .ok_or_else(|| format!("invalid watch address '{value}'\n{}", usage()))?;
                let mut address = [0u8; 21];
                address.copy_from_slice(&bytes);
                watch_addresses.push(address);
            }
            "--peers" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --peers\n{}", usage()))?;
                target_peers = value
                    .parse()
                    .map_err(|_| format!("invalid peer count '{value}'\n{}", usage()))?;
            }
            "--fp-rate" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --fp-rate\n{}", usage()))?;
                fp_rate = value
                    .parse()
                    .map_err(|_| format!("invalid fp rate '{value}'\n{}", usage()))?;
            }
            "--status-interval" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --status-interval\n{}", usage()))?;
                status_interval_secs = value
                    .parse()
                    .map_err(|_| format!("invalid interval '{value}'\n{}", usage()))?;
            }
            "--help" | "-h" => return Err(usage()),
            other => return Err(format!("unknown option '{other}'\n{}", usage())),
        }
    }

    Ok(Config {
        backend,
        data_dir: data_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR)),
        network,
        addnode_addrs,
        watch_addresses,
        target_peers,
        fp_rate,
        status_interval_secs,
    })
}

fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize)]
struct AddrBookEntry {
    last_seen: u64,
    last_success: u64,
    last_failure: u64,
    last_attempt: u64,
    successes: u32,
    failures: u32,
}

#[derive(Deserialize, Serialize)]
struct PeersFile {
    version: u32,
    entries: Vec<(String, AddrBookEntry)>,
}

/// Known peer addresses with attempt history. Failed addresses back off
/// exponentially before they become eligible again.
#[derive(Default)]
pub struct AddrBook {
    entries: Mutex<HashMap<SocketAddr, AddrBookEntry>>,
}

impl AddrBook {
    fn failure_cooldown_secs(failures: u32) -> u64 {
        let shift = failures.min(7);
        (ADDR_RETRY_BASE_SECS << shift).min(ADDR_RETRY_CAP_SECS)
    }

    pub fn insert_many(&self, addrs: &[SocketAddr]) -> usize {
        let now = unix_now_secs();
        let Ok(mut entries) = self.entries.lock() else {
            return 0;
        };
        let mut inserted = 0;
        for addr in addrs {
            if entries.len() >= ADDR_BOOK_MAX {
                break;
            }
            entries
                .entry(*addr)
                .and_modify(|entry| entry.last_seen = now)
                .or_insert_with(|| {
                    inserted += 1;
                    AddrBookEntry {
                        last_seen: now,
                        ..AddrBookEntry::default()
                    }
                });
        }
        inserted
    }

    pub fn record_attempt(&self, addr: SocketAddr) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.entry(addr).or_default().last_attempt = unix_now_secs();
        }
    }

    pub fn record_success(&self, addr: SocketAddr) {
        if let Ok(mut entries) = self.entries.lock() {
            let entry = entries.entry(addr).or_default();
            let now = unix_now_secs();
            entry.last_seen = now;
            entry.last_success = now;
            entry.successes = entry.successes.saturating_add(1);
            entry.failures = 0;
        }
    }

    pub fn record_failure(&self, addr: SocketAddr) {
        if let Ok(mut entries) = self.entries.lock() {
            let entry = entries.entry(addr).or_default();
            entry.last_failure = unix_now_secs();
            entry.failures = entry.failures.saturating_add(1);
        }
    }

    /// Addresses eligible for a new connection, most promising first.
    pub fn candidates(&self, exclude: &HashSet<SocketAddr>) -> Vec<SocketAddr> {
        let now = unix_now_secs();
        let Ok(entries) = self.entries.lock() else {
            return Vec::new();
        };
        let mut eligible: Vec<(SocketAddr, i64)> = entries
            .iter()
            .filter(|(addr, entry)| {
                if exclude.contains(addr) {
                    return false;
                }
                if entry.failures == 0 {
                    return true;
                }
                now >= entry.last_attempt + Self::failure_cooldown_secs(entry.failures)
            })
            .map(|(addr, entry)| {
                let score =
                    i64::from(entry.successes) * 10 - i64::from(entry.failures) * 3;
                (*addr, score)
            })
            .collect();
        eligible.sort_by(|a, b| b.1.cmp(&a.1));
        eligible.into_iter().map(|(addr, _)| addr).collect()
    }

    /// A sample for `getaddr` replies: (address, last-seen timestamp).
    pub fn sample(&self, limit: usize) -> Vec<(SocketAddr, u32)> {
        let Ok(entries) = self.entries.lock() else {
            return Vec::new();
        };
        entries
            .iter()
            .take(limit)
            .map(|(addr, entry)| (*addr, entry.last_seen as u32))
            .collect()
    }

    pub fn load(&self, path: &Path) -> Result<usize, String> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(format!("failed to read {}: {err}", path.display())),
        };
        let file: PeersFile =
            serde_json::from_slice(&bytes).map_err(|err| format!("invalid peers file: {err}"))?;
        if file.version != PEERS_FILE_VERSION {
            return Err(format!("unsupported peers file version {}", file.version));
        }
        let Ok(mut entries) = self.entries.lock() else {
            return Ok(0);
        };
        let mut loaded = 0;
        for (addr, entry) in file.entries {
            let Ok(addr) = addr.parse::<SocketAddr>() else {
                continue;
            };
            entries.insert(addr, entry);
            loaded += 1;
        }
        Ok(loaded)
    }

    pub fn save(&self, path: &Path) -> Result<(), String> {
        let Ok(entries) = self.entries.lock() else {
            return Ok(());
        };
        let file = PeersFile {
            version: PEERS_FILE_VERSION,
            entries: entries
                .iter()
                .map(|(addr, entry)| (addr.to_string(), *entry))
                .collect(),
        };
        let json =
            serde_json::to_vec_pretty(&file).map_err(|err| err.to_string())?;
        fs::write(path, json).map_err(|err| format!("failed to write {}: {err}", path.display()))
    }
}

/// Default listener wired by the binary: logs confirmed transfers after
/// re-checking the proof.
struct LogListener;

impl TransactionListener for LogListener {
    fn tx_type(&self) -> u8 {
        elaspv_primitives::transaction::tx_type::TRANSFER_ASSET
    }

    fn confirmed(&self) -> bool {
        true
    }

    fn depth(&self) -> u32 {
        1
    }

    fn notify(
        &self,
        proof: &Proof,
        tx: &Transaction,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if !proof.verify(&tx.hash()) {
            return Err("notification proof failed verification".into());
        }
        let tx_id = tx.hash();
        let mut hex = String::with_capacity(64);
        for byte in tx_id.iter().rev() {
            hex.push_str(&format!("{byte:02x}"));
        }
        info!("confirmed transaction {hex} at height {}", proof.height);
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();
    if let Err(err) = run().await {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), String> {
    let config = parse_args()?;
    let params = Arc::new(chain_params(config.network));

    fs::create_dir_all(&config.data_dir).map_err(|err| err.to_string())?;

    match config.backend {
        Backend::Memory => {
            let store = Arc::new(MemoryStore::new());
            run_node(config, params, store).await
        }
        Backend::Fjall => {
            #[cfg(feature = "fjall")]
            {
                let store = Arc::new(
                    elaspv_storage::fjall::FjallStore::open(config.data_dir.join("db"))
                        .map_err(|err| err.to_string())?,
                );
                run_node(config, params, store).await
            }
            #[cfg(not(feature = "fjall"))]
            {
                Err("built without the fjall backend; use --backend memory".to_string())
            }
        }
    }
}

async fn run_node<S: KeyValueStore + 'static>(
    config: Config,
    params: Arc<elaspv_consensus::ChainParams>,
    store: Arc<S>,
) -> Result<(), String> {
    let chain = Arc::new(
        ChainState::open(Arc::clone(&store), Arc::clone(&params)).map_err(|err| err.to_string())?,
    );
    info!(
        "chain open on {} at height {}",
        params.network.as_str(),
        chain.best_tip().height
    );

    let addr_filter = Arc::new(AddrFilter::default());
    let ledger = Ledger::new(Arc::clone(&store), Arc::clone(&addr_filter));
    let notifier = Notifier::new(Arc::clone(&store));

    let addr_book = Arc::new(AddrBook::default());
    let peers_path = config.data_dir.join(PEERS_FILE_NAME);
    match addr_book.load(&peers_path) {
        Ok(loaded) if loaded > 0 => info!("loaded {loaded} known peers"),
        Ok(_) => {}
        Err(err) => warn!("{err}"),
    }
    addr_book.insert_many(&config.addnode_addrs);

    let peer_book = Arc::new(PeerBook::default());
    let registry = Arc::new(PeerRegistry::default());
    let net_totals = Arc::new(NetTotals::default());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sync_config = SyncConfig {
        target_peers: config.target_peers,
        fp_rate: config.fp_rate,
        ..SyncConfig::default()
    };
    let mut coordinator = SyncCoordinator::new(
        Arc::clone(&store),
        Arc::clone(&params),
        Arc::clone(&chain),
        ledger,
        notifier,
        Arc::clone(&addr_book),
        peer_book,
        Arc::clone(&registry),
        Arc::clone(&net_totals),
        sync_config,
        shutdown_rx.clone(),
    )?;
    coordinator.register_listener(Arc::new(LogListener));
    for address in &config.watch_addresses {
        coordinator.register_address(*address).await?;
    }
    info!("watching {} addresses", config.watch_addresses.len());

    // Status reporting plus periodic address book persistence.
    let status_chain = Arc::clone(&chain);
    let status_totals = Arc::clone(&net_totals);
    let status_registry = Arc::clone(&registry);
    let status_interval = config.status_interval_secs.max(5);
    let mut status_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(status_interval));
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let tip = status_chain.best_tip();
                    let (bytes_recv, bytes_sent) = status_totals.totals();
                    info!(
                        "height {} | peers {} | recv {bytes_recv} B | sent {bytes_sent} B",
                        tip.height,
                        status_totals.connections(),
                    );
                    for peer in status_registry.snapshot() {
                        log::debug!(
                            "peer {} {:?} v{} height {} {} ({} in / {} out)",
                            peer.addr,
                            peer.state,
                            peer.version,
                            peer.start_height,
                            peer.user_agent,
                            peer.bytes_recv,
                            peer.bytes_sent,
                        );
                    }
                }
                _ = status_shutdown.changed() => {
                    if *status_shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });

    let persist_book = Arc::clone(&addr_book);
    let persist_path = peers_path.clone();
    let mut persist_shutdown = shutdown_rx;
    tokio::spawn(async move {
        let mut tick =
            tokio::time::interval(Duration::from_secs(PEERS_PERSIST_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(err) = persist_book.save(&persist_path) {
                        warn!("{err}");
                    }
                }
                _ = persist_shutdown.changed() => {
                    if *persist_shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });

    let coordinator_handle = tokio::spawn(coordinator.run());

    tokio::signal::ctrl_c()
        .await
        .map_err(|err| err.to_string())?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);

    match coordinator_handle.await {
        Ok(result) => result?,
        Err(err) => return Err(format!("coordinator task failed: {err}")),
    }

    if let Err(err) = addr_book.save(&peers_path) {
        warn!("{err}");
    }
    Ok(())
}

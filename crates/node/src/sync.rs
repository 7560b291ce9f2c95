//! The sync coordinator: owns chain and ledger state, elects a sync peer,
//! drives header-first catch-up and merkle-block filtering, and dispatches
//! listener notifications in best-chain order.
//!
//! Peer tasks never touch chain state; they forward events over a bounded
//! channel and receive commands back, which keeps a single writer over the
//! store without coarse locking.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use elaspv_bloom::{check_merkle_block, BloomFilter, MerkleBlock};
use elaspv_chainstate::notify::PendingNotification;
use elaspv_chainstate::{
    ChainState, ChainStateError, HeaderAccepted, Ledger, Notifier, Proof, ReorgEvent,
};
use elaspv_consensus::constants::{
    FILTERED_BLOCK_BATCH, NODE_BLOOM, PEER_BLACKLIST_SECS, PEER_CHANNEL_BOUND, PROTOCOL_VERSION,
    SYNC_RESPONSE_TIMEOUT_SECS, SYNC_STALL_SECS,
};
use elaspv_consensus::{ChainParams, Hash168, Hash256};
use elaspv_primitives::encoding::to_bytes;
use elaspv_primitives::{BlockHeader, OutPoint, Transaction};
use elaspv_storage::{Column, KeyValueStore, WriteBatch};
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};

use crate::msg::{
    commands, AddrMessage, FilterAddMessage, FilterLoadMessage, GetHeadersMessage,
    InventoryMessage, TimestampedAddress, INV_TYPE_BLOCK, INV_TYPE_TX,
};
use crate::p2p::{run_peer, NetTotals, PeerCommand, PeerEvent, PeerId, PeerRegistry, PeerState};
use crate::peer_book::PeerBook;
use crate::AddrBook;

const META_FILTER_HEIGHT_KEY: &[u8] = b"filter_height";
const TICK_SECS: u64 = 5;
const GETADDR_SAMPLE: usize = 128;
/// Addresses that failed this often are not retried by the dialer.
const MIN_PEER_SCORE: i32 = -10;
/// Bound on headers parked while their ancestors are fetched.
const MAX_ORPHAN_HEADERS: usize = 256;

#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub target_peers: usize,
    pub fp_rate: f64,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            target_peers: 4,
            fp_rate: 0.000_1,
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(8),
        }
    }
}

struct PeerHandle {
    addr: SocketAddr,
    command_tx: mpsc::Sender<PeerCommand>,
    height: u32,
    services: u64,
    latency: Duration,
    ready: bool,
}

/// A transaction matched by a verified merkle block whose body has not
/// arrived yet.
struct PendingTx {
    height: u32,
    proof: Proof,
}

/// A transaction of ours the coordinator tracks for notifications.
struct WalletTx {
    tx: Transaction,
    at_height: u32,
    proof: Option<Proof>,
}

pub struct SyncCoordinator<S: KeyValueStore> {
    params: Arc<ChainParams>,
    store: Arc<S>,
    chain: Arc<ChainState<S>>,
    ledger: Ledger<S>,
    notifier: Notifier<S>,
    addr_book: Arc<AddrBook>,
    peer_book: Arc<PeerBook>,
    registry: Arc<PeerRegistry>,
    net_totals: Arc<NetTotals>,
    config: SyncConfig,

    bloom: BloomFilter,
    peers: HashMap<PeerId, PeerHandle>,
    next_peer_id: PeerId,
    sync_peer: Option<PeerId>,
    awaiting_headers: bool,
    inflight: HashSet<Hash256>,
    batch_end_height: u32,
    next_filter_height: u32,
    orphans: HashMap<Hash256, Vec<BlockHeader>>,
    pending_block_txs: HashMap<Hash256, PendingTx>,
    wallet_txs: HashMap<Hash256, WalletTx>,
    last_progress: Instant,

    events_tx: mpsc::Sender<(PeerId, PeerEvent)>,
    events_rx: mpsc::Receiver<(PeerId, PeerEvent)>,
    shutdown: watch::Receiver<bool>,
}

impl<S: KeyValueStore + 'static> SyncCoordinator<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<S>,
        params: Arc<ChainParams>,
        chain: Arc<ChainState<S>>,
        ledger: Ledger<S>,
        notifier: Notifier<S>,
        addr_book: Arc<AddrBook>,
        peer_book: Arc<PeerBook>,
        registry: Arc<PeerRegistry>,
        net_totals: Arc<NetTotals>,
        config: SyncConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, String> {
        let (events_tx, events_rx) = mpsc::channel(PEER_CHANNEL_BOUND);
        let next_filter_height = match store
            .get(Column::Meta, META_FILTER_HEIGHT_KEY)
            .map_err(|err| err.to_string())?
        {
            Some(bytes) if bytes.len() == 4 => {
                u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
            }
            _ => 1,
        };
        let bloom = build_bloom_filter(&ledger, config.fp_rate).map_err(|err| err.to_string())?;
        Ok(Self {
            params,
            store,
            chain,
            ledger,
            notifier,
            addr_book,
            peer_book,
            registry,
            net_totals,
            config,
            bloom,
            peers: HashMap::new(),
            next_peer_id: 1,
            sync_peer: None,
            awaiting_headers: false,
            inflight: HashSet::new(),
            batch_end_height: 0,
            next_filter_height,
            orphans: HashMap::new(),
            pending_block_txs: HashMap::new(),
            wallet_txs: HashMap::new(),
            last_progress: Instant::now(),
            events_tx,
            events_rx,
            shutdown,
        })
    }

    /// Register one more watched address: rebuild the bloom filter and
    /// re-advertise it to every connected peer.
    pub async fn register_address(&mut self, address: Hash168) -> Result<(), String> {
        if !self.ledger.addr_filter().add_addr(address) {
            return Ok(());
        }
        self.bloom =
            build_bloom_filter(&self.ledger, self.config.fp_rate).map_err(|err| err.to_string())?;
        let payload = to_bytes(&FilterLoadMessage::from_filter(&self.bloom));
        self.broadcast(commands::FILTERLOAD, payload).await;
        Ok(())
    }

    pub fn register_listener(
        &mut self,
        listener: Arc<dyn elaspv_chainstate::TransactionListener>,
    ) {
        self.notifier.register_listener(listener);
    }

    pub async fn run(mut self) -> Result<(), String> {
        let mut tick = tokio::time::interval(Duration::from_secs(TICK_SECS));
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        break;
                    }
                }
                event = self.events_rx.recv() => {
                    let Some((peer, event)) = event else { break };
                    self.handle_event(peer, event).await?;
                }
                _ = tick.tick() => {
                    self.on_tick().await?;
                }
            }
        }

        // Cooperative shutdown: stop issuing requests and close writes;
        // peer tasks drain and exit on their own.
        info!("sync coordinator shutting down");
        for handle in self.peers.values() {
            let _ = handle.command_tx.send(PeerCommand::Disconnect).await;
        }
        Ok(())
    }

    async fn on_tick(&mut self) -> Result<(), String> {
        self.connect_more_peers();

        // A headers request has its own response deadline; block batches
        // stall on lack of progress.
        let stalled = if self.awaiting_headers {
            self.last_progress.elapsed() >= Duration::from_secs(SYNC_RESPONSE_TIMEOUT_SECS)
        } else if !self.inflight.is_empty() {
            self.last_progress.elapsed() >= Duration::from_secs(SYNC_STALL_SECS)
        } else {
            false
        };
        if stalled {
            if let Some(peer_id) = self.sync_peer {
                warn!("sync peer {peer_id} stalled; re-electing");
                self.drop_peer(peer_id, "sync stall", true).await?;
            }
        }

        self.maybe_prune()?;
        Ok(())
    }

    fn connect_more_peers(&mut self) {
        let connected: HashSet<SocketAddr> =
            self.peers.values().map(|handle| handle.addr).collect();
        let mut wanted = self
            .config
            .target_peers
            .saturating_sub(self.peers.len());
        for addr in self.addr_book.candidates(&connected) {
            if wanted == 0 {
                break;
            }
            if self.peer_book.is_banned(addr) || self.peer_book.score(addr) < MIN_PEER_SCORE {
                continue;
            }
            self.spawn_peer(addr);
            wanted -= 1;
        }
    }

    fn spawn_peer(&mut self, addr: SocketAddr) {
        let id = self.next_peer_id;
        self.next_peer_id += 1;
        self.addr_book.record_attempt(addr);

        let (command_tx, command_rx) = mpsc::channel(PEER_CHANNEL_BOUND);
        let handle = PeerHandle {
            addr,
            command_tx: command_tx.clone(),
            height: 0,
            services: 0,
            latency: Duration::ZERO,
            ready: false,
        };
        self.peers.insert(id, handle);

        let filter_load = to_bytes(&FilterLoadMessage::from_filter(&self.bloom));
        tokio::spawn(run_peer(
            id,
            addr,
            Arc::clone(&self.params),
            self.chain.best_tip().height,
            filter_load,
            self.events_tx.clone(),
            command_tx,
            command_rx,
            Arc::clone(&self.registry),
            Arc::clone(&self.net_totals),
            self.shutdown.clone(),
            self.config.connect_timeout,
            self.config.handshake_timeout,
        ));
    }

    async fn handle_event(&mut self, peer: PeerId, event: PeerEvent) -> Result<(), String> {
        match event {
            PeerEvent::Ready {
                height,
                services,
                latency,
            } => {
                if let Some(handle) = self.peers.get_mut(&peer) {
                    handle.ready = true;
                    handle.height = height;
                    handle.services = services;
                    handle.latency = latency;
                    self.addr_book.record_success(handle.addr);
                    self.peer_book.record_success(handle.addr);
                }
                if self.sync_peer.is_none() {
                    self.elect_sync_peer().await?;
                }
            }
            PeerEvent::Disconnected { reason, misbehaved } => {
                self.on_peer_gone(peer, &reason, misbehaved).await?;
            }
            PeerEvent::Headers(headers) => {
                self.process_headers(peer, headers).await?;
            }
            PeerEvent::Inv(message) => {
                self.process_inv(peer, message).await?;
            }
            PeerEvent::NotFound(message) => {
                for item in &message.items {
                    if self.inflight.remove(&item.hash) {
                        debug!("peer {peer} lacks requested block");
                        if let Some(handle) = self.peers.get(&peer) {
                            self.peer_book.record_failure(handle.addr);
                        }
                    }
                }
                self.after_batch_progress().await?;
            }
            PeerEvent::MerkleBlock(block) => {
                self.process_merkle_block(peer, *block).await?;
            }
            PeerEvent::Tx(tx) => {
                self.process_tx(*tx).await?;
            }
            PeerEvent::Addr(addrs) => {
                let learned = self.addr_book.insert_many(&addrs);
                if learned > 0 {
                    debug!("learned {learned} addresses from peer {peer}");
                }
            }
            PeerEvent::GetAddr => {
                let sample = self.addr_book.sample(GETADDR_SAMPLE);
                let message = AddrMessage {
                    addresses: sample
                        .into_iter()
                        .map(|(addr, last_seen)| TimestampedAddress {
                            timestamp: last_seen,
                            address: crate::msg::NetAddress::from_socket_addr(&addr, 0),
                        })
                        .collect(),
                };
                self.send_to(peer, commands::ADDR, to_bytes(&message)).await;
            }
        }
        Ok(())
    }

    async fn on_peer_gone(
        &mut self,
        peer: PeerId,
        reason: &str,
        misbehaved: bool,
    ) -> Result<(), String> {
        let Some(handle) = self.peers.remove(&peer) else {
            return Ok(());
        };
        debug!("peer {peer} ({}) gone: {reason}", handle.addr);
        if misbehaved {
            self.peer_book
                .record_misbehavior(handle.addr, PEER_BLACKLIST_SECS);
        } else {
            self.peer_book.record_failure(handle.addr);
        }
        self.addr_book.record_failure(handle.addr);

        if self.sync_peer == Some(peer) {
            self.sync_peer = None;
            self.awaiting_headers = false;
            self.inflight.clear();
            self.elect_sync_peer().await?;
        }
        Ok(())
    }

    /// Close a peer's write path and clean up immediately; the reader
    /// task's own Disconnected report then finds nothing left to do.
    async fn drop_peer(&mut self, peer: PeerId, reason: &str, blacklist: bool) -> Result<(), String> {
        if let Some(handle) = self.peers.get(&peer) {
            let _ = handle.command_tx.send(PeerCommand::Disconnect).await;
        }
        self.on_peer_gone(peer, reason, blacklist).await
    }

    /// Prefer the highest advertised height; break ties on lowest latency.
    async fn elect_sync_peer(&mut self) -> Result<(), String> {
        let mut best: Option<(PeerId, u32, Duration)> = None;
        for (id, handle) in &self.peers {
            if !handle.ready || self.peer_book.is_banned(handle.addr) {
                continue;
            }
            // Filtered-block sync needs a peer that serves bloom requests.
            if handle.services & NODE_BLOOM == 0 {
                debug!("peer {id} lacks bloom service; not a sync candidate");
                continue;
            }
            let better = match best {
                None => true,
                Some((_, height, latency)) => {
                    handle.height > height
                        || (handle.height == height && handle.latency < latency)
                }
            };
            if better {
                best = Some((*id, handle.height, handle.latency));
            }
        }
        if let Some((id, height, _)) = best {
            info!("sync peer elected: {id} at height {height}");
            self.sync_peer = Some(id);
            self.last_progress = Instant::now();
            self.continue_sync().await?;
        }
        Ok(())
    }

    async fn continue_sync(&mut self) -> Result<(), String> {
        let Some(peer_id) = self.sync_peer else {
            return Ok(());
        };
        let Some(handle) = self.peers.get(&peer_id) else {
            self.sync_peer = None;
            return Ok(());
        };

        let tip = self.chain.best_tip();
        if tip.height < handle.height {
            let locator = self.chain.locator().map_err(|err| err.to_string())?;
            let message = GetHeadersMessage {
                version: PROTOCOL_VERSION,
                locator,
                stop: [0u8; 32],
            };
            self.awaiting_headers = true;
            self.registry.set_state(peer_id, PeerState::Syncing);
            self.send_to(peer_id, commands::GETHEADERS, to_bytes(&message))
                .await;
        } else {
            self.awaiting_headers = false;
            self.registry.set_state(peer_id, PeerState::Ready);
            self.request_filtered_batch().await?;
        }
        Ok(())
    }

    /// Request the next ≤ B merkle blocks along the best chain, waiting
    /// for the whole batch before moving the cursor.
    async fn request_filtered_batch(&mut self) -> Result<(), String> {
        if !self.inflight.is_empty() {
            return Ok(());
        }
        let Some(peer_id) = self.sync_peer else {
            return Ok(());
        };
        let tip = self.chain.best_tip();
        let mut hashes = Vec::new();
        let mut height = self.next_filter_height;
        while height <= tip.height && hashes.len() < FILTERED_BLOCK_BATCH {
            if let Some(hash) = self
                .chain
                .height_hash(height)
                .map_err(|err| err.to_string())?
            {
                hashes.push(hash);
            }
            height += 1;
        }
        if hashes.is_empty() {
            return Ok(());
        }
        self.batch_end_height = height;
        self.inflight.extend(hashes.iter().copied());
        self.last_progress = Instant::now();
        let message = InventoryMessage::filtered_blocks(&hashes);
        self.send_to(peer_id, commands::GETDATA, to_bytes(&message))
            .await;
        Ok(())
    }

    async fn after_batch_progress(&mut self) -> Result<(), String> {
        if !self.inflight.is_empty() {
            return Ok(());
        }
        if self.batch_end_height > self.next_filter_height {
            self.next_filter_height = self.batch_end_height;
            self.store
                .put(
                    Column::Meta,
                    META_FILTER_HEIGHT_KEY,
                    &self.next_filter_height.to_le_bytes(),
                )
                .map_err(|err| err.to_string())?;
        }
        self.dispatch_notifications()?;
        self.continue_sync().await
    }

    async fn process_headers(
        &mut self,
        peer: PeerId,
        headers: Vec<BlockHeader>,
    ) -> Result<(), String> {
        self.awaiting_headers = false;
        let count = headers.len();
        let mut progress = false;

        let mut queue: Vec<BlockHeader> = headers;
        let mut index = 0;
        while index < queue.len() {
            let header = queue[index].clone();
            index += 1;
            match self.chain.insert_header(&header) {
                Ok(HeaderAccepted::Extended(hash)) | Ok(HeaderAccepted::SideChain(hash)) => {
                    progress = true;
                    if let Some(children) = self.orphans.remove(&hash) {
                        queue.extend(children);
                    }
                }
                Ok(HeaderAccepted::Reorged(event)) => {
                    progress = true;
                    let hash = header.hash();
                    self.apply_reorg(event)?;
                    if let Some(children) = self.orphans.remove(&hash) {
                        queue.extend(children);
                    }
                }
                Ok(HeaderAccepted::AlreadyKnown) => {}
                Err(ChainStateError::UnknownParent(prev)) => {
                    debug!("orphan header at {}; requesting ancestors", header.height);
                    if self.orphans.len() < MAX_ORPHAN_HEADERS {
                        self.orphans.entry(prev).or_default().push(header);
                    }
                    let locator = self.chain.locator().map_err(|err| err.to_string())?;
                    let message = GetHeadersMessage {
                        version: PROTOCOL_VERSION,
                        locator,
                        stop: [0u8; 32],
                    };
                    self.awaiting_headers = true;
                    self.send_to(peer, commands::GETHEADERS, to_bytes(&message))
                        .await;
                }
                Err(ChainStateError::Pow(err)) => {
                    warn!("peer {peer} sent header failing pow: {err}");
                    self.drop_peer(peer, "invalid proof of work", true).await?;
                    return Ok(());
                }
                Err(ChainStateError::HeightMismatch { expected, got }) => {
                    warn!("peer {peer} sent inconsistent height {got} (expected {expected})");
                    self.drop_peer(peer, "inconsistent header height", true).await?;
                    return Ok(());
                }
                Err(err) => return Err(err.to_string()),
            }
        }

        if progress {
            self.last_progress = Instant::now();
        }
        if count > 0 && Some(peer) == self.sync_peer {
            self.continue_sync().await?;
        }
        Ok(())
    }

    async fn process_inv(&mut self, peer: PeerId, message: InventoryMessage) -> Result<(), String> {
        let mut block_hashes = Vec::new();
        let mut tx_hashes = Vec::new();
        for item in &message.items {
            match item.inv_type {
                INV_TYPE_BLOCK => {
                    let known = self
                        .chain
                        .header_entry(&item.hash)
                        .map_err(|err| err.to_string())?
                        .is_some();
                    if !known && !self.inflight.contains(&item.hash) {
                        block_hashes.push(item.hash);
                    }
                }
                INV_TYPE_TX => {
                    // Only fetch announcements for transactions we already
                    // expect from a verified merkle block.
                    if self.pending_block_txs.contains_key(&item.hash) {
                        tx_hashes.push(item.hash);
                    }
                }
                _ => {}
            }
        }
        if !block_hashes.is_empty() {
            self.inflight.extend(block_hashes.iter().copied());
            self.last_progress = Instant::now();
            let request = InventoryMessage::filtered_blocks(&block_hashes);
            self.send_to(peer, commands::GETDATA, to_bytes(&request)).await;
        }
        if !tx_hashes.is_empty() {
            let request = InventoryMessage::transactions(&tx_hashes);
            self.send_to(peer, commands::GETDATA, to_bytes(&request)).await;
        }
        Ok(())
    }

    async fn process_merkle_block(
        &mut self,
        peer: PeerId,
        block: MerkleBlock,
    ) -> Result<(), String> {
        let block_hash = block.header.hash();

        match self.chain.insert_header(&block.header) {
            Ok(HeaderAccepted::Reorged(event)) => {
                self.apply_reorg(event)?;
            }
            Ok(_) => {}
            Err(ChainStateError::UnknownParent(prev)) => {
                debug!("merkle block with unknown parent; requesting ancestors");
                self.orphans
                    .entry(prev)
                    .or_default()
                    .push(block.header.clone());
                let locator = self.chain.locator().map_err(|err| err.to_string())?;
                let message = GetHeadersMessage {
                    version: PROTOCOL_VERSION,
                    locator,
                    stop: [0u8; 32],
                };
                self.send_to(peer, commands::GETHEADERS, to_bytes(&message))
                    .await;
                self.inflight.remove(&block_hash);
                return self.after_batch_progress().await;
            }
            Err(ChainStateError::Pow(err)) => {
                warn!("peer {peer} sent merkle block failing pow: {err}");
                self.inflight.remove(&block_hash);
                self.drop_peer(peer, "invalid proof of work", true).await?;
                return Ok(());
            }
            Err(ChainStateError::HeightMismatch { .. }) => {
                self.inflight.remove(&block_hash);
                self.drop_peer(peer, "inconsistent header height", true).await?;
                return Ok(());
            }
            Err(err) => return Err(err.to_string()),
        }

        let matches = match check_merkle_block(&block) {
            Ok(matches) => matches,
            Err(err) => {
                warn!("peer {peer} sent inconsistent merkle block: {err}");
                self.inflight.remove(&block_hash);
                self.drop_peer(peer, "merkle verification failed", true).await?;
                return Ok(());
            }
        };

        self.inflight.remove(&block_hash);
        self.last_progress = Instant::now();

        let height = block.header.height;
        let on_best_chain = self
            .chain
            .height_hash(height)
            .map_err(|err| err.to_string())?
            == Some(block_hash);

        if on_best_chain {
            let mut promotions: Vec<(Hash256, Proof)> = Vec::new();
            for tx_id in matches.matched_tx_ids() {
                let Some(branch) = matches.branch(&tx_id) else {
                    self.drop_peer(peer, "merkle branch extraction failed", true).await?;
                    return Ok(());
                };
                let proof = Proof {
                    block_hash,
                    height,
                    merkle_root: block.header.merkle_root,
                    branch,
                };
                if self.wallet_txs.contains_key(&tx_id) {
                    promotions.push((tx_id, proof));
                } else {
                    self.pending_block_txs.insert(tx_id, PendingTx { height, proof });
                }
            }

            // Transactions delivered earlier (mempool or a previous chain)
            // are promoted to this block.
            let mut new_outpoints: Vec<OutPoint> = Vec::new();
            for (tx_id, proof) in promotions {
                let mut batch = WriteBatch::new();
                let outcome = {
                    let Some(wallet_tx) = self.wallet_txs.get(&tx_id) else {
                        continue;
                    };
                    self.ledger
                        .apply_transaction(&mut batch, &wallet_tx.tx, height)
                        .map_err(|err| err.to_string())?
                };
                self.store.write_batch(&batch).map_err(|err| err.to_string())?;
                if let Some(wallet_tx) = self.wallet_txs.get_mut(&tx_id) {
                    wallet_tx.at_height = height;
                    wallet_tx.proof = Some(proof);
                }
                new_outpoints.extend(outcome.credited);
            }
            if !new_outpoints.is_empty() {
                self.extend_filter(&new_outpoints).await;
            }

            // Blocks announced at the tip arrive outside a batch; move the
            // filter cursor past them so catch-up never re-requests.
            if height == self.next_filter_height {
                self.next_filter_height = height + 1;
            }
        }

        self.after_batch_progress().await
    }

    async fn process_tx(&mut self, tx: Transaction) -> Result<(), String> {
        let tx_id = tx.hash();

        if let Some(pending) = self.pending_block_txs.remove(&tx_id) {
            let mut batch = WriteBatch::new();
            let outcome = self
                .ledger
                .apply_transaction(&mut batch, &tx, pending.height)
                .map_err(|err| err.to_string())?;
            self.store.write_batch(&batch).map_err(|err| err.to_string())?;
            if outcome.relevant {
                self.wallet_txs.insert(
                    tx_id,
                    WalletTx {
                        tx,
                        at_height: pending.height,
                        proof: Some(pending.proof),
                    },
                );
                let credited = outcome.credited;
                self.extend_filter(&credited).await;
            }
            self.dispatch_notifications()?;
            return Ok(());
        }

        // Unconfirmed delivery: create provisional entries if relevant.
        let mut batch = WriteBatch::new();
        let outcome = self
            .ledger
            .apply_transaction(&mut batch, &tx, 0)
            .map_err(|err| err.to_string())?;
        if outcome.relevant {
            self.store.write_batch(&batch).map_err(|err| err.to_string())?;
            self.wallet_txs.entry(tx_id).or_insert(WalletTx {
                tx,
                at_height: 0,
                proof: None,
            });
            let credited = outcome.credited;
            self.extend_filter(&credited).await;
        }
        Ok(())
    }

    /// Rewind the ledger for a best-chain switch, then re-filter the
    /// attached range. Detach happens in descending height order.
    fn apply_reorg(&mut self, event: ReorgEvent) -> Result<(), String> {
        info!(
            "reorg: detaching {} blocks, attaching {} from height {}",
            event.detached.len(),
            event.attached.len(),
            event.fork_height + 1
        );

        let mut batch = WriteBatch::new();
        let mut vanished: Vec<Hash256> = Vec::new();
        for (height, _) in &event.detached {
            self.ledger
                .undo_block(&mut batch, *height)
                .map_err(|err| err.to_string())?;
            for (tx_id, wallet_tx) in self.wallet_txs.iter_mut() {
                if wallet_tx.at_height == *height {
                    wallet_tx.at_height = 0;
                    wallet_tx.proof = None;
                    vanished.push(*tx_id);
                }
            }
        }
        self.store.write_batch(&batch).map_err(|err| err.to_string())?;
        self.notifier.forget(&vanished);

        // Everything above the fork is re-verified against the new chain.
        self.pending_block_txs.clear();
        self.inflight.clear();
        self.batch_end_height = 0;
        self.next_filter_height = self.next_filter_height.min(event.fork_height + 1);
        self.store
            .put(
                Column::Meta,
                META_FILTER_HEIGHT_KEY,
                &self.next_filter_height.to_le_bytes(),
            )
            .map_err(|err| err.to_string())?;
        Ok(())
    }

    /// Notify listeners in strict best-chain order.
    fn dispatch_notifications(&self) -> Result<(), String> {
        if !self.notifier.has_listeners() {
            return Ok(());
        }
        let tip = self.chain.best_tip();
        let mut confirmed: Vec<(&WalletTx, &Proof)> = self
            .wallet_txs
            .values()
            .filter_map(|wallet_tx| match (&wallet_tx.proof, wallet_tx.at_height) {
                (Some(proof), height) if height > 0 => Some((wallet_tx, proof)),
                _ => None,
            })
            .collect();
        confirmed.sort_by_key(|(wallet_tx, _)| wallet_tx.at_height);
        let pending: Vec<PendingNotification<'_>> = confirmed
            .into_iter()
            .map(|(wallet_tx, proof)| PendingNotification {
                tx: &wallet_tx.tx,
                at_height: wallet_tx.at_height,
                proof,
            })
            .collect();
        let fired = self
            .notifier
            .dispatch(tip.height, &pending)
            .map_err(|err| err.to_string())?;
        if fired > 0 {
            debug!("dispatched {fired} notifications at tip {}", tip.height);
        }
        Ok(())
    }

    /// Feed newly discovered outpoints into the bloom filter and advertise
    /// the additions without a full reload.
    async fn extend_filter(&mut self, credited: &[OutPoint]) {
        for outpoint in credited {
            let data = outpoint.key_bytes();
            self.bloom.insert(&data);
            let payload = to_bytes(&FilterAddMessage {
                data: data.to_vec(),
            });
            self.broadcast(commands::FILTERADD, payload).await;
        }
    }

    fn maybe_prune(&mut self) -> Result<(), String> {
        let pruned = self.chain.prune().map_err(|err| err.to_string())?;
        if pruned > 0 {
            debug!("pruned {pruned} buried headers");
        }
        let tip = self.chain.best_tip();
        let mut batch = WriteBatch::new();
        let dropped = self
            .ledger
            .prune_stxos(
                &mut batch,
                tip.height,
                self.params.consensus.reorg_horizon,
            )
            .map_err(|err| err.to_string())?;
        if dropped > 0 {
            self.store.write_batch(&batch).map_err(|err| err.to_string())?;
            debug!("pruned {dropped} buried spent outputs");
        }
        Ok(())
    }

    async fn send_to(&self, peer: PeerId, command: &'static str, payload: Vec<u8>) {
        if let Some(handle) = self.peers.get(&peer) {
            let _ = handle
                .command_tx
                .send(PeerCommand::Send { command, payload })
                .await;
        }
    }

    async fn broadcast(&self, command: &'static str, payload: Vec<u8>) {
        for handle in self.peers.values() {
            let _ = handle
                .command_tx
                .send(PeerCommand::Send {
                    command,
                    payload: payload.clone(),
                })
                .await;
        }
    }
}

/// Build the advertised filter from every registered address plus every
/// live outpoint we own.
fn build_bloom_filter<S: KeyValueStore>(
    ledger: &Ledger<S>,
    fp_rate: f64,
) -> Result<BloomFilter, elaspv_chainstate::LedgerError> {
    let addrs = ledger.addr_filter().addrs();
    let utxos = ledger.utxos()?;
    let elements = addrs.len() + utxos.len();
    let mut filter = BloomFilter::new(
        elements.max(16),
        fp_rate,
        rand::random(),
        elaspv_bloom::filter::BLOOM_UPDATE_NONE,
    );
    for addr in addrs {
        filter.insert(&addr);
    }
    for utxo in utxos {
        filter.insert(&utxo.op.key_bytes());
    }
    Ok(filter)
}

//! Shared state of one torrent: which pieces we hold, who is downloading
//! what, peer statistics, and the alerts that fall out of it.

use crate::bitfield::BitField;
use crate::engine::{Alert, PeerInfo, StorageMode, TorrentState, TorrentStatus};
use crate::storage::Storage;
use crate::torrent::TorrentDescriptor;
use crate::utils::{client_name, lock};
use crossbeam::channel::Sender;
use rand::seq::SliceRandom;
use sha1::{Digest, Sha1};
use std::collections::{BTreeSet, HashMap};
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct PeerStats {
    client: String,
    have: BitField,
    received: u64,
    sent: u64,
    rate_mark: (u64, u64),
    down_rate: u64,
    up_rate: u64,
    last_seen: Instant,
}

#[derive(Debug)]
struct SwarmState {
    checked: bool,
    have: BitField,
    priorities: Vec<u8>,
    /// piece -> the peer currently fetching it
    in_flight: HashMap<usize, SocketAddr>,
    pending_reads: BTreeSet<usize>,
    peers: HashMap<SocketAddr, PeerStats>,
    total_done: u64,
    downloaded: u64,
    uploaded: u64,
    last_tick: Instant,
}

/// Upload budget in bytes per one second window. 0 means we never upload.
#[derive(Debug)]
struct RateLimit {
    limit: AtomicU64,
    window: Mutex<(Instant, u64)>,
}

impl RateLimit {
    fn take(&self, bytes: u64) -> bool {
        let limit = self.limit.load(Ordering::Relaxed);
        if limit == 0 {
            return false;
        }
        let mut window = lock(&self.window);
        if window.0.elapsed() >= Duration::from_secs(1) {
            *window = (Instant::now(), 0);
        }
        // one block is always allowed into an empty window, even above a tiny limit
        if window.1 == 0 || window.1 + bytes <= limit {
            window.1 += bytes;
            true
        } else {
            false
        }
    }
}

#[derive(Debug)]
pub(crate) struct Swarm {
    pub torrent: Arc<TorrentDescriptor>,
    pub mode: StorageMode,
    storage: Storage,
    state: Mutex<SwarmState>,
    alerts: Sender<Alert>,
    stopped: AtomicBool,
    upload: RateLimit,
}

impl Swarm {
    pub fn new(
        torrent: Arc<TorrentDescriptor>,
        save_path: &Path,
        mode: StorageMode,
        alerts: Sender<Alert>,
    ) -> Swarm {
        let pieces = torrent.num_pieces();
        Swarm {
            storage: Storage::new(&torrent, save_path),
            torrent,
            mode,
            state: Mutex::new(SwarmState {
                checked: false,
                have: BitField::new(pieces),
                priorities: vec![1; pieces],
                in_flight: HashMap::new(),
                pending_reads: BTreeSet::new(),
                peers: HashMap::new(),
                total_done: 0,
                downloaded: 0,
                uploaded: 0,
                last_tick: Instant::now(),
            }),
            alerts,
            stopped: AtomicBool::new(false),
            upload: RateLimit {
                limit: AtomicU64::new(0),
                window: Mutex::new((Instant::now(), 0)),
            },
        }
    }

    fn emit(&self, alert: Alert) {
        let _ = self.alerts.send(alert);
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Disk mode resumes from whatever verified content already exists.
    pub fn check_files(&self) {
        let have = match self.mode {
            StorageMode::Disk => self.storage.check(&self.torrent),
            StorageMode::Memory => BitField::new(self.torrent.num_pieces()),
        };
        let total_done = have
            .pieces()
            .into_iter()
            .map(|i| self.torrent.piece_size(i))
            .sum();
        let mut state = lock(&self.state);
        state.have = have;
        state.total_done = total_done;
        state.checked = true;
    }

    pub fn status(&self) -> TorrentStatus {
        let state = lock(&self.state);
        let total = self.torrent.total_length();
        let progress = if total == 0 {
            1.0
        } else {
            state.total_done as f64 / total as f64
        };
        let status = if !state.checked {
            TorrentState::CheckingFiles
        } else if state.have.is_complete() {
            TorrentState::Seeding
        } else {
            TorrentState::Downloading
        };
        TorrentStatus {
            state: status,
            progress,
            total_done: state.total_done,
            total_wanted: total,
            download_rate: state.peers.values().map(|p| p.down_rate).sum(),
            upload_rate: state.peers.values().map(|p| p.up_rate).sum(),
            num_peers: state.peers.len(),
        }
    }

    pub fn peer_info(&self) -> Vec<PeerInfo> {
        let state = lock(&self.state);
        let mut peers: Vec<PeerInfo> = state
            .peers
            .iter()
            .map(|(addr, stats)| PeerInfo {
                addr: *addr,
                client: stats.client.clone(),
                down_speed: stats.down_rate,
                up_speed: stats.up_rate,
                last_active: stats.last_seen.elapsed().as_secs(),
                seed: stats.have.is_complete(),
            })
            .collect();
        peers.sort_by_key(|p| p.addr);
        peers
    }

    /// counters for tracker announces: (downloaded, uploaded, left)
    pub fn transfer_totals(&self) -> (u64, u64, u64) {
        let state = lock(&self.state);
        (
            state.downloaded,
            state.uploaded,
            self.torrent.total_length() - state.total_done,
        )
    }

    pub fn prioritize(&self, priorities: &[u8]) {
        let mut state = lock(&self.state);
        if priorities.len() != state.priorities.len() {
            log::warn!(
                "{} priorities given for {} pieces",
                priorities.len(),
                state.priorities.len()
            );
        }
        for (slot, priority) in state.priorities.iter_mut().zip(priorities) {
            *slot = *priority;
        }
    }

    pub fn read_piece(&self, index: usize) {
        if index >= self.torrent.num_pieces() {
            log::warn!("read of piece {} past the end", index);
            self.emit(Alert::ReadPiece {
                index,
                buffer: Vec::new(),
            });
            return;
        }
        let mut state = lock(&self.state);
        if state.have.has_piece(index) {
            match self.mode {
                StorageMode::Disk => {
                    drop(state);
                    let buffer = self.storage.read_piece(index).unwrap_or_else(|err| {
                        log::warn!("reading piece {}: {}", index, err);
                        Vec::new()
                    });
                    self.emit(Alert::ReadPiece { index, buffer });
                    return;
                }
                StorageMode::Memory => {
                    // bytes were not kept, fetch the piece again
                    state.have.unset(index);
                    state.total_done -= self.torrent.piece_size(index);
                }
            }
        }
        state.pending_reads.insert(index);
    }

    pub fn set_upload_limit(&self, bytes_per_sec: u64) {
        self.upload.limit.store(bytes_per_sec, Ordering::Relaxed);
    }

    pub fn can_upload(&self) -> bool {
        self.mode == StorageMode::Disk && self.upload.limit.load(Ordering::Relaxed) > 0
    }

    pub fn take_upload(&self, bytes: u64) -> bool {
        self.upload.take(bytes)
    }

    pub fn read_block(&self, index: usize, begin: u64, len: u64) -> io::Result<Vec<u8>> {
        if !self.has_piece(index) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "piece not present"));
        }
        self.storage.read_block(index, begin, len)
    }

    pub fn has_piece(&self, index: usize) -> bool {
        lock(&self.state).have.has_piece(index)
    }

    /// our bitfield, for announcing to peers; None when there is nothing to offer
    pub fn offer(&self) -> Option<BitField> {
        let state = lock(&self.state);
        if self.mode == StorageMode::Disk && state.have.count() > 0 {
            Some(state.have.clone())
        } else {
            None
        }
    }

    pub fn peer_joined(&self, addr: SocketAddr, peer_id: &[u8; 20]) {
        let mut state = lock(&self.state);
        state.peers.insert(
            addr,
            PeerStats {
                client: client_name(peer_id),
                have: BitField::new(self.torrent.num_pieces()),
                received: 0,
                sent: 0,
                rate_mark: (0, 0),
                down_rate: 0,
                up_rate: 0,
                last_seen: Instant::now(),
            },
        );
        drop(state);
        self.emit(Alert::PeerConnected { addr });
    }

    /// Forgets a peer. Pending reads nobody else can serve fail with an
    /// empty buffer, unless the torrent is being removed.
    pub fn peer_left(&self, addr: SocketAddr) {
        let mut state = lock(&self.state);
        let Some(stats) = state.peers.remove(&addr) else {
            return;
        };
        state.in_flight.retain(|_, owner| *owner != addr);
        if self.stopped() {
            state.pending_reads.clear();
            drop(state);
            self.emit(Alert::PeerDisconnected { addr });
            return;
        }
        let orphaned: Vec<usize> = state
            .pending_reads
            .iter()
            .copied()
            .filter(|&index| stats.have.has_piece(index))
            .filter(|&index| !state.peers.values().any(|p| p.have.has_piece(index)))
            .collect();
        for index in &orphaned {
            state.pending_reads.remove(index);
        }
        drop(state);

        self.emit(Alert::PeerDisconnected { addr });
        for index in orphaned {
            log::debug!("{} left before delivering piece {}", addr, index);
            self.emit(Alert::ReadPiece {
                index,
                buffer: Vec::new(),
            });
        }
    }

    pub fn peer_bitfield(&self, addr: SocketAddr, have: BitField) {
        if let Some(stats) = lock(&self.state).peers.get_mut(&addr) {
            stats.have = have;
        }
    }

    pub fn peer_has(&self, addr: SocketAddr, index: usize) {
        if let Some(stats) = lock(&self.state).peers.get_mut(&addr) {
            stats.have.set(index);
        }
    }

    pub fn touch(&self, addr: SocketAddr) {
        if let Some(stats) = lock(&self.state).peers.get_mut(&addr) {
            stats.last_seen = Instant::now();
        }
    }

    pub fn record_received(&self, addr: SocketAddr, bytes: u64) {
        let mut state = lock(&self.state);
        state.downloaded += bytes;
        if let Some(stats) = state.peers.get_mut(&addr) {
            stats.received += bytes;
        }
    }

    pub fn record_sent(&self, addr: SocketAddr, bytes: u64) {
        let mut state = lock(&self.state);
        state.uploaded += bytes;
        if let Some(stats) = state.peers.get_mut(&addr) {
            stats.sent += bytes;
        }
    }

    fn wanted(state: &SwarmState, index: usize) -> bool {
        !state.have.has_piece(index) && state.priorities.get(index).is_some_and(|p| *p > 0)
    }

    /// whether `peer_have` holds anything we still want
    pub fn wants_from(&self, peer_have: &BitField) -> bool {
        let state = lock(&self.state);
        peer_have
            .pieces()
            .into_iter()
            .any(|index| Self::wanted(&state, index) || state.pending_reads.contains(&index))
    }

    /// Assigns a piece the peer has to it: pending reads first, then a random
    /// wanted piece nobody else is fetching.
    pub fn pick(&self, addr: SocketAddr, peer_have: &BitField) -> Option<usize> {
        let mut state = lock(&self.state);
        if !state.checked {
            return None;
        }
        let free = |state: &SwarmState, index: usize| {
            peer_have.has_piece(index) && !state.in_flight.contains_key(&index)
        };
        let chosen = state
            .pending_reads
            .iter()
            .copied()
            .find(|&index| free(&state, index))
            .or_else(|| {
                let candidates: Vec<usize> = (0..self.torrent.num_pieces())
                    .filter(|&index| Self::wanted(&state, index) && free(&state, index))
                    .collect();
                candidates.choose(&mut rand::thread_rng()).copied()
            })?;
        state.in_flight.insert(chosen, addr);
        Some(chosen)
    }

    pub fn release(&self, addr: SocketAddr, index: usize) {
        let mut state = lock(&self.state);
        if state.in_flight.get(&index) == Some(&addr) {
            state.in_flight.remove(&index);
        }
    }

    /// Verifies a fully received piece. Returns true when it was accepted.
    /// A pending read is answered either way; a corrupt piece hands back the
    /// bytes the peer actually sent.
    pub fn complete(&self, addr: SocketAddr, index: usize, data: Vec<u8>) -> bool {
        self.release(addr, index);
        let valid = self
            .torrent
            .hash_for_piece(index)
            .is_some_and(|hash| Sha1::digest(&data).as_slice() == hash);
        if !valid {
            log::debug!("piece {} from {} failed the hash check", index, addr);
            let wanted_read = lock(&self.state).pending_reads.remove(&index);
            self.emit(Alert::HashFailed { index, peer: addr });
            if wanted_read {
                self.emit(Alert::ReadPiece {
                    index,
                    buffer: data,
                });
            }
            return false;
        }

        if self.mode == StorageMode::Disk {
            if let Err(err) = self.storage.write_piece(index, &data) {
                log::warn!("writing piece {}: {}", index, err);
                return false;
            }
        }

        let mut state = lock(&self.state);
        if !state.have.has_piece(index) {
            state.have.set(index);
            state.total_done += data.len() as u64;
        }
        let wanted_read = state.pending_reads.remove(&index);
        drop(state);

        self.emit(Alert::PieceFinished { index });
        if wanted_read {
            self.emit(Alert::ReadPiece {
                index,
                buffer: data,
            });
        }
        true
    }

    /// refreshes per peer rates, called about once a second
    pub fn tick(&self) {
        let mut state = lock(&self.state);
        let elapsed = state.last_tick.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }
        state.last_tick = Instant::now();
        for stats in state.peers.values_mut() {
            stats.down_rate = ((stats.received - stats.rate_mark.0) as f64 / elapsed) as u64;
            stats.up_rate = ((stats.sent - stats.rate_mark.1) as f64 / elapsed) as u64;
            stats.rate_mark = (stats.received, stats.sent);
        }
    }
}

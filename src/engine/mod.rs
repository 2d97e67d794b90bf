/*
src/engine/mod.rs

the torrent engine seen by the evidence code: a session that owns an ip filter and an alert queue, and handles
to the torrents added to it. the collector, sampler and downloader are written against these traits only, so
tests drive them with a scripted session and production runs use the wire engine.
*/

mod swarm;
pub mod wire;
mod worker;

#[cfg(test)]
pub(crate) mod fake;

pub use wire::{WireHandle, WireSession};

use crate::ip_filter::IpFilter;
use crate::torrent::TorrentDescriptor;
use anyhow::Result;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

/// requested block size, the de facto standard
pub const BLOCK_SIZE: u32 = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    /// verified pieces are written under the save path; existing files are hash-checked on add
    Disk,
    /// nothing is read from or written to the save path; piece bytes only live until read
    Memory,
}

#[derive(Debug, Clone)]
pub struct AddTorrentParams {
    pub torrent: Arc<TorrentDescriptor>,
    pub save_path: PathBuf,
    pub storage: StorageMode,
}

impl AddTorrentParams {
    pub fn new(torrent: Arc<TorrentDescriptor>, save_path: impl Into<PathBuf>, storage: StorageMode) -> Self {
        AddTorrentParams {
            torrent,
            save_path: save_path.into(),
            storage,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TorrentState {
    CheckingFiles,
    Downloading,
    Seeding,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TorrentStatus {
    pub state: TorrentState,
    /// verified share of the content, 0.0 to 1.0
    pub progress: f64,
    /// verified bytes
    pub total_done: u64,
    pub total_wanted: u64,
    /// bytes per second
    pub download_rate: u64,
    pub upload_rate: u64,
    pub num_peers: usize,
}

impl TorrentStatus {
    pub fn is_seeding(&self) -> bool {
        self.state == TorrentState::Seeding
    }
}

/// A connected peer as the engine sees it right now.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    pub client: String,
    /// bytes per second
    pub down_speed: u64,
    pub up_speed: u64,
    /// whole seconds since the peer last sent anything
    pub last_active: u64,
    pub seed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Alert {
    /// answer to `read_piece`; an empty buffer means the transfer failed
    ReadPiece { index: usize, buffer: Vec<u8> },
    HashFailed { index: usize, peer: SocketAddr },
    PieceFinished { index: usize },
    TrackerError { url: String, message: String },
    PeerConnected { addr: SocketAddr },
    PeerDisconnected { addr: SocketAddr },
}

pub trait TorrentHandle {
    fn info_hash(&self) -> [u8; 20];
    fn status(&self) -> Result<TorrentStatus>;
    fn peer_info(&self) -> Result<Vec<PeerInfo>>;
    /// one priority per piece, 0 means never download
    fn prioritize_pieces(&self, priorities: &[u8]);
    /// Answers with an `Alert::ReadPiece`, now if the piece is present,
    /// otherwise once it has been downloaded.
    fn read_piece(&self, index: usize);
    /// bytes per second we serve to peers; 0 disables uploading
    fn set_upload_limit(&self, bytes_per_sec: u64);
}

pub trait Session {
    type Handle: TorrentHandle;

    /// replaces the filter applied to tracker and peer addresses
    fn set_ip_filter(&self, filter: IpFilter);
    fn add_torrent(&self, params: AddTorrentParams) -> Result<Self::Handle>;
    fn remove_torrent(&self, handle: &Self::Handle);
    /// drains the alert queue
    fn pop_alerts(&self) -> Vec<Alert>;
}

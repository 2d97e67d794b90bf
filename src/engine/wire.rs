/*
src/engine/wire.rs

the real engine. every added torrent gets a driver thread that hash-checks (disk mode), announces to its
trackers and keeps a worker thread per connected peer. connections are outbound only; the port is announced
so trackers list us, nothing listens on it.

the ip filter is consulted for tracker addresses before announcing, for peers before connecting and by
every worker on each loop, so replacing the filter drops peers it no longer allows.
*/

use crate::engine::swarm::Swarm;
use crate::engine::worker;
use crate::engine::{AddTorrentParams, Alert, PeerInfo, Session, TorrentHandle, TorrentStatus};
use crate::ip_filter::IpFilter;
use crate::tracker::http::{AnnounceRequest, AnnounceResponse, Event, HttpTracker};
use crate::tracker::udp::UdpTracker;
use crate::utils::{generate_peer_id, lock};
use anyhow::{anyhow, Result};
use crossbeam::channel::{unbounded, Receiver, Sender};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use url::Url;

const TICK: Duration = Duration::from_secs(1);
const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(10);
/// per attempt; udp announces retry a few times
const UDP_TIMEOUT: Duration = Duration::from_secs(4);
/// re-announce delay after a failure or an empty peer list
const ANNOUNCE_RETRY: Duration = Duration::from_secs(60);
const MAX_ANNOUNCE_INTERVAL: u64 = 30 * 60;
/// wait before reconnecting to a peer that dropped or refused us
const PEER_RETRY: Duration = Duration::from_secs(30);
const MAX_PEERS: usize = 50;

/// State every driver and worker of a session reads.
#[derive(Debug)]
pub(crate) struct Shared {
    filter: RwLock<IpFilter>,
    pub peer_id: [u8; 20],
    pub port: u16,
    alerts: Sender<Alert>,
}

impl Shared {
    pub fn allowed(&self, ip: IpAddr) -> bool {
        self.filter
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_allowed(ip)
    }
}

#[derive(Debug)]
struct Running {
    swarm: Arc<Swarm>,
    driver: Option<JoinHandle<()>>,
}

#[derive(Debug)]
pub struct WireSession {
    shared: Arc<Shared>,
    alerts: Receiver<Alert>,
    torrents: Mutex<HashMap<[u8; 20], Running>>,
}

#[derive(Debug, Clone)]
pub struct WireHandle {
    swarm: Arc<Swarm>,
}

impl WireSession {
    /// `port` is what we announce to trackers.
    pub fn new(port: u16) -> WireSession {
        WireSession::with_peer_id(port, generate_peer_id())
    }

    pub fn with_peer_id(port: u16, peer_id: [u8; 20]) -> WireSession {
        let (tx, rx) = unbounded();
        WireSession {
            shared: Arc::new(Shared {
                filter: RwLock::new(IpFilter::new()),
                peer_id,
                port,
                alerts: tx,
            }),
            alerts: rx,
            torrents: Mutex::new(HashMap::new()),
        }
    }

    fn stop(running: &mut Running) {
        running.swarm.stop();
        if let Some(driver) = running.driver.take() {
            if driver.join().is_err() {
                log::warn!("driver of {} panicked", running.swarm.torrent.name());
            }
        }
    }
}

impl Session for WireSession {
    type Handle = WireHandle;

    fn set_ip_filter(&self, filter: IpFilter) {
        log::debug!("ip filter replaced, {} rules", filter.len());
        *self.shared.filter.write().unwrap_or_else(PoisonError::into_inner) = filter;
    }

    fn add_torrent(&self, params: AddTorrentParams) -> Result<WireHandle> {
        let info_hash = params.torrent.info_hash();
        let mut torrents = lock(&self.torrents);
        if torrents.contains_key(&info_hash) {
            return Err(anyhow!(
                "torrent {} is already in the session",
                hex::encode(info_hash)
            ));
        }
        let swarm = Arc::new(Swarm::new(
            params.torrent,
            &params.save_path,
            params.storage,
            self.shared.alerts.clone(),
        ));
        let driver = {
            let swarm = swarm.clone();
            let shared = self.shared.clone();
            thread::Builder::new()
                .name(format!("torrent-{}", &hex::encode(info_hash)[..8]))
                .spawn(move || drive(&swarm, &shared))?
        };
        log::info!(
            "added {} ({:?}) at {}",
            swarm.torrent.name(),
            params.storage,
            params.save_path.display()
        );
        torrents.insert(
            info_hash,
            Running {
                swarm: swarm.clone(),
                driver: Some(driver),
            },
        );
        Ok(WireHandle { swarm })
    }

    fn remove_torrent(&self, handle: &WireHandle) {
        let removed = lock(&self.torrents).remove(&handle.info_hash());
        if let Some(mut running) = removed {
            WireSession::stop(&mut running);
            log::debug!("removed {}", running.swarm.torrent.name());
        }
    }

    fn pop_alerts(&self) -> Vec<Alert> {
        self.alerts.try_iter().collect()
    }
}

impl Drop for WireSession {
    fn drop(&mut self) {
        for (_, mut running) in lock(&self.torrents).drain() {
            WireSession::stop(&mut running);
        }
    }
}

impl TorrentHandle for WireHandle {
    fn info_hash(&self) -> [u8; 20] {
        self.swarm.torrent.info_hash()
    }

    fn status(&self) -> Result<TorrentStatus> {
        if self.swarm.stopped() {
            return Err(anyhow!("torrent was removed"));
        }
        Ok(self.swarm.status())
    }

    fn peer_info(&self) -> Result<Vec<PeerInfo>> {
        if self.swarm.stopped() {
            return Err(anyhow!("torrent was removed"));
        }
        Ok(self.swarm.peer_info())
    }

    fn prioritize_pieces(&self, priorities: &[u8]) {
        self.swarm.prioritize(priorities);
    }

    fn read_piece(&self, index: usize) {
        self.swarm.read_piece(index);
    }

    fn set_upload_limit(&self, bytes_per_sec: u64) {
        self.swarm.set_upload_limit(bytes_per_sec);
    }
}

#[derive(Debug)]
struct TrackerSlot {
    url: String,
    next: Instant,
    started: bool,
}

#[derive(Debug)]
struct PeerSlot {
    worker: Option<JoinHandle<()>>,
    retry_at: Instant,
}

fn drive(swarm: &Arc<Swarm>, shared: &Arc<Shared>) {
    swarm.check_files();
    let now = Instant::now();
    let mut trackers: Vec<TrackerSlot> = swarm
        .torrent
        .trackers()
        .iter()
        .map(|url| TrackerSlot {
            url: url.clone(),
            next: now,
            started: false,
        })
        .collect();
    let mut peers: HashMap<SocketAddr, PeerSlot> = HashMap::new();

    while !swarm.stopped() {
        for slot in trackers.iter_mut().filter(|t| t.next <= Instant::now()) {
            let delay = match announce(swarm, shared, slot) {
                Ok(response) => {
                    log::debug!("{} returned {} peers", slot.url, response.peers.len());
                    slot.started = true;
                    for addr in &response.peers {
                        peers.entry(*addr).or_insert(PeerSlot {
                            worker: None,
                            retry_at: Instant::now(),
                        });
                    }
                    if response.peers.is_empty() {
                        ANNOUNCE_RETRY
                    } else {
                        let interval = response.interval.max(response.min_interval.unwrap_or(0));
                        Duration::from_secs(interval.clamp(ANNOUNCE_RETRY.as_secs(), MAX_ANNOUNCE_INTERVAL))
                    }
                }
                Err(err) => {
                    log::debug!("announce to {} failed: {}", slot.url, err);
                    let _ = shared.alerts.send(Alert::TrackerError {
                        url: slot.url.clone(),
                        message: err.to_string(),
                    });
                    ANNOUNCE_RETRY
                }
            };
            slot.next = Instant::now() + delay;
        }

        for slot in peers.values_mut() {
            if slot.worker.as_ref().is_some_and(|w| w.is_finished()) {
                if let Some(worker) = slot.worker.take() {
                    let _ = worker.join();
                }
                slot.retry_at = Instant::now() + PEER_RETRY;
            }
        }

        let mut active = peers.values().filter(|p| p.worker.is_some()).count();
        for (addr, slot) in peers.iter_mut() {
            if active >= MAX_PEERS || swarm.stopped() {
                break;
            }
            if slot.worker.is_some() || slot.retry_at > Instant::now() || !shared.allowed(addr.ip()) {
                continue;
            }
            let addr = *addr;
            let (swarm, shared) = (swarm.clone(), shared.clone());
            let spawned = thread::Builder::new()
                .name(format!("peer-{}", addr))
                .spawn(move || {
                    if let Err(err) = worker::run(&swarm, &shared, addr) {
                        log::debug!("peer {}: {}", addr, err);
                    }
                });
            match spawned {
                Ok(worker) => {
                    slot.worker = Some(worker);
                    active += 1;
                }
                Err(err) => {
                    log::warn!("cannot start a worker for {}: {}", addr, err);
                    slot.retry_at = Instant::now() + PEER_RETRY;
                }
            }
        }

        swarm.tick();
        thread::sleep(TICK);
    }

    for worker in peers.into_values().filter_map(|p| p.worker) {
        let _ = worker.join();
    }
    log::debug!("driver of {} finished", swarm.torrent.name());
}

/// Announces to one tracker at the first of its addresses the filter allows.
fn announce(swarm: &Swarm, shared: &Shared, slot: &TrackerSlot) -> Result<AnnounceResponse> {
    let url = Url::parse(&slot.url)?;
    let host = url.host_str().ok_or(anyhow!("tracker url has no host"))?;
    let port = url.port_or_known_default().ok_or(anyhow!("tracker url has no port"))?;
    let addr = (host.trim_matches(|c| c == '[' || c == ']'), port)
        .to_socket_addrs()?
        .find(|addr| shared.allowed(addr.ip()))
        .ok_or(anyhow!("no tracker address allowed by the ip filter"))?;

    let (downloaded, uploaded, left) = swarm.transfer_totals();
    let mut request = AnnounceRequest::new(swarm.torrent.info_hash(), shared.peer_id, shared.port);
    request.downloaded = downloaded;
    request.uploaded = uploaded;
    request.left = left;
    request.event = (!slot.started).then_some(Event::Started);

    match url.scheme() {
        "udp" => UdpTracker::new(addr, UDP_TIMEOUT)?.announce(&request),
        _ => HttpTracker::new(ANNOUNCE_TIMEOUT)?.announce(&url, addr, &request),
    }
}

//! Scripted engine for tests. Status and peer lists are played back one entry
//! per call (the last entry repeats), read requests are answered from a
//! closure, and every call that changes engine state is recorded.

use crate::engine::{
    AddTorrentParams, Alert, PeerInfo, Session, TorrentHandle, TorrentState, TorrentStatus,
};
use crate::ip_filter::IpFilter;
use anyhow::{anyhow, Result};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::Rc;

type Answer = Box<dyn Fn(usize) -> Vec<u8>>;

#[derive(Default)]
struct Script {
    statuses: RefCell<VecDeque<TorrentStatus>>,
    peer_rounds: RefCell<VecDeque<Vec<PeerInfo>>>,
    /// peer_info fails once called more often than this
    peers_fail_after: Cell<Option<usize>>,
    peer_calls: Cell<usize>,
    answer: RefCell<Option<Answer>>,
    alerts: RefCell<Vec<Alert>>,
    /// queued when a torrent is removed, like late answers from departing peers
    late_alerts: RefCell<Vec<Alert>>,

    filters: RefCell<Vec<IpFilter>>,
    added: RefCell<Vec<AddTorrentParams>>,
    removed: Cell<usize>,
    priorities: RefCell<Vec<Vec<u8>>>,
    reads: RefCell<Vec<usize>>,
    upload_limits: RefCell<Vec<u64>>,
}

#[derive(Default, Clone)]
pub(crate) struct FakeSession {
    script: Rc<Script>,
}

#[derive(Clone)]
pub(crate) struct FakeHandle {
    info_hash: [u8; 20],
    script: Rc<Script>,
}

/// a status with the given progress over 1000 bytes
pub(crate) fn status(progress: f64) -> TorrentStatus {
    let total_wanted = 1000;
    TorrentStatus {
        state: if progress >= 1.0 {
            TorrentState::Seeding
        } else {
            TorrentState::Downloading
        },
        progress,
        total_done: (progress * total_wanted as f64) as u64,
        total_wanted,
        download_rate: 0,
        upload_rate: 0,
        num_peers: 0,
    }
}

pub(crate) fn status_done(total_done: u64) -> TorrentStatus {
    TorrentStatus {
        total_done,
        ..status(total_done as f64 / 1000.0)
    }
}

pub(crate) fn peer(addr: &str, seed: bool, last_active: u64) -> PeerInfo {
    PeerInfo {
        addr: addr.parse().unwrap(),
        client: "qBittorrent 4.6.2".to_string(),
        down_speed: 51_200,
        up_speed: 0,
        last_active,
        seed,
    }
}

impl FakeSession {
    pub(crate) fn new() -> FakeSession {
        FakeSession::default()
    }

    pub(crate) fn with_statuses(self, statuses: Vec<TorrentStatus>) -> FakeSession {
        *self.script.statuses.borrow_mut() = statuses.into();
        self
    }

    pub(crate) fn with_peer_rounds(self, rounds: Vec<Vec<PeerInfo>>) -> FakeSession {
        *self.script.peer_rounds.borrow_mut() = rounds.into();
        self
    }

    /// peer_info errors once it has been called `calls` times
    pub(crate) fn failing_peers_after(self, calls: usize) -> FakeSession {
        self.script.peers_fail_after.set(Some(calls));
        self
    }

    pub(crate) fn answering(self, answer: impl Fn(usize) -> Vec<u8> + 'static) -> FakeSession {
        *self.script.answer.borrow_mut() = Some(Box::new(answer));
        self
    }

    pub(crate) fn with_alerts(self, alerts: Vec<Alert>) -> FakeSession {
        *self.script.alerts.borrow_mut() = alerts;
        self
    }

    pub(crate) fn with_late_alerts(self, alerts: Vec<Alert>) -> FakeSession {
        *self.script.late_alerts.borrow_mut() = alerts;
        self
    }

    pub(crate) fn pending_alerts(&self) -> usize {
        self.script.alerts.borrow().len()
    }

    pub(crate) fn filters(&self) -> Vec<IpFilter> {
        self.script.filters.borrow().clone()
    }

    pub(crate) fn added(&self) -> Vec<AddTorrentParams> {
        self.script.added.borrow().clone()
    }

    pub(crate) fn removed(&self) -> usize {
        self.script.removed.get()
    }

    pub(crate) fn priorities(&self) -> Vec<Vec<u8>> {
        self.script.priorities.borrow().clone()
    }

    pub(crate) fn reads(&self) -> Vec<usize> {
        self.script.reads.borrow().clone()
    }

    pub(crate) fn upload_limits(&self) -> Vec<u64> {
        self.script.upload_limits.borrow().clone()
    }

    pub(crate) fn peer_calls(&self) -> usize {
        self.script.peer_calls.get()
    }
}

fn next_of<T: Clone>(queue: &RefCell<VecDeque<T>>) -> Option<T> {
    let mut queue = queue.borrow_mut();
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    }
}

impl Session for FakeSession {
    type Handle = FakeHandle;

    fn set_ip_filter(&self, filter: IpFilter) {
        self.script.filters.borrow_mut().push(filter);
    }

    fn add_torrent(&self, params: AddTorrentParams) -> Result<FakeHandle> {
        let info_hash = params.torrent.info_hash();
        self.script.added.borrow_mut().push(params);
        Ok(FakeHandle {
            info_hash,
            script: self.script.clone(),
        })
    }

    fn remove_torrent(&self, _handle: &FakeHandle) {
        self.script.removed.set(self.script.removed.get() + 1);
        let late: Vec<Alert> = self.script.late_alerts.borrow().clone();
        self.script.alerts.borrow_mut().extend(late);
    }

    fn pop_alerts(&self) -> Vec<Alert> {
        self.script.alerts.borrow_mut().drain(..).collect()
    }
}

impl TorrentHandle for FakeHandle {
    fn info_hash(&self) -> [u8; 20] {
        self.info_hash
    }

    fn status(&self) -> Result<TorrentStatus> {
        next_of(&self.script.statuses).ok_or(anyhow!("no scripted status"))
    }

    fn peer_info(&self) -> Result<Vec<PeerInfo>> {
        let calls = self.script.peer_calls.get() + 1;
        self.script.peer_calls.set(calls);
        if matches!(self.script.peers_fail_after.get(), Some(limit) if calls > limit) {
            return Err(anyhow!("session went away"));
        }
        Ok(next_of(&self.script.peer_rounds).unwrap_or_default())
    }

    fn prioritize_pieces(&self, priorities: &[u8]) {
        self.script.priorities.borrow_mut().push(priorities.to_vec());
    }

    fn read_piece(&self, index: usize) {
        self.script.reads.borrow_mut().push(index);
        if let Some(answer) = self.script.answer.borrow().as_ref() {
            let buffer = answer(index);
            self.script
                .alerts
                .borrow_mut()
                .push(Alert::ReadPiece { index, buffer });
        }
    }

    fn set_upload_limit(&self, bytes_per_sec: u64) {
        self.script.upload_limits.borrow_mut().push(bytes_per_sec);
    }
}

/// every peer address a filter lets through, out of `candidates`
pub(crate) fn allowed(filter: &IpFilter, candidates: &[&str]) -> Vec<SocketAddr> {
    candidates
        .iter()
        .map(|c| c.parse::<SocketAddr>().unwrap())
        .filter(|addr| filter.is_allowed(addr.ip()))
        .collect()
}

use crate::bitfield::BitField;
use crate::engine::swarm::Swarm;
use crate::engine::wire::Shared;
use crate::engine::BLOCK_SIZE;
use crate::peer::connection::Connection;
use crate::peer::message::Message;
use std::collections::VecDeque;
use std::io::{Error, ErrorKind};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// how long one recv waits, which bounds how late a stop is noticed
const RECV_SLICE: Duration = Duration::from_millis(250);
/// outstanding block requests per peer
const PIPELINE: usize = 5;
const KEEPALIVE: Duration = Duration::from_secs(90);
/// a peer silent for this long is dropped
const IDLE_LIMIT: Duration = Duration::from_secs(180);
/// largest block we serve
const MAX_REQUEST: u32 = 2 * BLOCK_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Block {
    Missing,
    Requested,
    Received,
}

/// the piece this peer is fetching for us
#[derive(Debug)]
struct PieceProgress {
    index: usize,
    data: Vec<u8>,
    blocks: Vec<Block>,
}

impl PieceProgress {
    fn new(index: usize, size: u64) -> PieceProgress {
        let blocks = size.div_ceil(BLOCK_SIZE as u64) as usize;
        PieceProgress {
            index,
            data: vec![0; size as usize],
            blocks: vec![Block::Missing; blocks],
        }
    }

    fn outstanding(&self) -> usize {
        self.blocks.iter().filter(|b| **b == Block::Requested).count()
    }

    fn is_done(&self) -> bool {
        self.blocks.iter().all(|b| *b == Block::Received)
    }

    /// next block to request as (begin, length)
    fn next_request(&mut self) -> Option<(u32, u32)> {
        let slot = self.blocks.iter().position(|b| *b == Block::Missing)?;
        self.blocks[slot] = Block::Requested;
        let begin = slot as u32 * BLOCK_SIZE;
        let length = BLOCK_SIZE.min(self.data.len() as u32 - begin);
        Some((begin, length))
    }

    fn store(&mut self, begin: u32, block: &[u8]) -> bool {
        if begin % BLOCK_SIZE != 0 || begin as usize + block.len() > self.data.len() {
            return false;
        }
        let slot = (begin / BLOCK_SIZE) as usize;
        self.data[begin as usize..begin as usize + block.len()].copy_from_slice(block);
        self.blocks[slot] = Block::Received;
        true
    }

    /// a choke discards our outstanding requests
    fn reset_requests(&mut self) {
        for block in self.blocks.iter_mut() {
            if *block == Block::Requested {
                *block = Block::Missing;
            }
        }
    }
}

struct PeerWorker<'a> {
    swarm: &'a Swarm,
    shared: &'a Shared,
    conn: Connection,
    peer_choking: bool,
    am_interested: bool,
    am_choking: bool,
    peer_have: BitField,
    current: Option<PieceProgress>,
    uploads: VecDeque<(u32, u32, u32)>,
    last_sent: Instant,
    last_heard: Instant,
}

/// Talks to one peer until it leaves, the filter drops it or the torrent stops.
pub(crate) fn run(swarm: &Swarm, shared: &Shared, addr: SocketAddr) -> Result<(), Error> {
    let conn = Connection::connect(
        addr,
        swarm.torrent.info_hash(),
        shared.peer_id,
        CONNECT_TIMEOUT,
    )?;
    swarm.peer_joined(addr, &conn.peer_id);
    let mut worker = PeerWorker {
        swarm,
        shared,
        conn,
        peer_choking: true,
        am_interested: false,
        am_choking: true,
        peer_have: BitField::new(swarm.torrent.num_pieces()),
        current: None,
        uploads: VecDeque::new(),
        last_sent: Instant::now(),
        last_heard: Instant::now(),
    };
    let result = worker.session();
    swarm.peer_left(addr);
    result
}

impl PeerWorker<'_> {
    fn send(&mut self, message: Message) -> Result<(), Error> {
        self.last_sent = Instant::now();
        self.conn.send(&message)
    }

    fn session(&mut self) -> Result<(), Error> {
        let addr = self.conn.addr;
        if let Some(have) = self.swarm.offer() {
            self.send(Message::Bitfield(have.as_bytes().to_vec()))?;
        }

        loop {
            if self.swarm.stopped() {
                return Ok(());
            }
            if !self.shared.allowed(addr.ip()) {
                log::debug!("{} is no longer allowed by the ip filter", addr);
                return Ok(());
            }

            let messages = self.conn.recv(RECV_SLICE)?;
            if !messages.is_empty() {
                self.last_heard = Instant::now();
                self.swarm.touch(addr);
            }
            for message in messages {
                self.handle(message)?;
            }

            self.update_interest()?;
            self.request_blocks()?;
            self.serve_uploads()?;

            if self.last_sent.elapsed() >= KEEPALIVE {
                self.send(Message::KeepAlive)?;
            }
            if self.last_heard.elapsed() >= IDLE_LIMIT {
                return Err(Error::new(ErrorKind::TimedOut, "peer went silent"));
            }
        }
    }

    fn handle(&mut self, message: Message) -> Result<(), Error> {
        let addr = self.conn.addr;
        match message {
            Message::Choke => {
                self.peer_choking = true;
                if let Some(piece) = self.current.as_mut() {
                    piece.reset_requests();
                }
            }
            Message::Unchoke => self.peer_choking = false,
            Message::Interested => {
                if self.am_choking && self.swarm.can_upload() {
                    self.am_choking = false;
                    self.send(Message::Unchoke)?;
                }
            }
            Message::NotInterested => self.uploads.clear(),
            Message::Have(index) => {
                self.peer_have.set(index as usize);
                self.swarm.peer_has(addr, index as usize);
            }
            Message::Bitfield(payload) => {
                self.peer_have = BitField::from_payload(&payload, self.swarm.torrent.num_pieces())?;
                self.swarm.peer_bitfield(addr, self.peer_have.clone());
            }
            Message::Request(index, begin, length) => {
                if !self.am_choking && length <= MAX_REQUEST {
                    self.uploads.push_back((index, begin, length));
                }
            }
            Message::Cancel(index, begin, length) => {
                self.uploads.retain(|r| *r != (index, begin, length));
            }
            Message::Piece(index, begin, block) => {
                let Some(piece) = self.current.as_mut() else {
                    return Ok(());
                };
                if piece.index != index as usize || !piece.store(begin, &block) {
                    log::trace!("unexpected block {}+{} from {}", index, begin, addr);
                    return Ok(());
                }
                self.swarm.record_received(addr, block.len() as u64);
                if piece.is_done() {
                    if let Some(piece) = self.current.take() {
                        self.swarm.complete(addr, piece.index, piece.data);
                    }
                }
            }
            Message::KeepAlive | Message::Port(_) => {}
        }
        Ok(())
    }

    fn update_interest(&mut self) -> Result<(), Error> {
        let wanted = self.current.is_some() || self.swarm.wants_from(&self.peer_have);
        if wanted != self.am_interested {
            self.am_interested = wanted;
            let message = if wanted {
                Message::Interested
            } else {
                Message::NotInterested
            };
            self.send(message)?;
        }
        Ok(())
    }

    fn request_blocks(&mut self) -> Result<(), Error> {
        if self.peer_choking {
            return Ok(());
        }
        if self.current.is_none() {
            let addr = self.conn.addr;
            self.current = self
                .swarm
                .pick(addr, &self.peer_have)
                .map(|index| PieceProgress::new(index, self.swarm.torrent.piece_size(index)));
        }
        let mut requests = Vec::new();
        if let Some(piece) = self.current.as_mut() {
            while piece.outstanding() < PIPELINE {
                let Some((begin, length)) = piece.next_request() else {
                    break;
                };
                requests.push(Message::Request(piece.index as u32, begin, length));
            }
        }
        for request in requests {
            self.send(request)?;
        }
        Ok(())
    }

    fn serve_uploads(&mut self) -> Result<(), Error> {
        if !self.swarm.can_upload() {
            if !self.am_choking {
                self.am_choking = true;
                self.uploads.clear();
                self.send(Message::Choke)?;
            }
            return Ok(());
        }
        while let Some(&(index, begin, length)) = self.uploads.front() {
            if !self.swarm.take_upload(length as u64) {
                break;
            }
            self.uploads.pop_front();
            match self.swarm.read_block(index as usize, begin as u64, length as u64) {
                Ok(block) => {
                    self.send(Message::Piece(index, begin, block))?;
                    self.swarm.record_sent(self.conn.addr, length as u64);
                }
                Err(err) => log::debug!("cannot serve {}+{}: {}", index, begin, err),
            }
        }
        Ok(())
    }
}

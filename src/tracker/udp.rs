use crate::tracker::http::{compact_v4, compact_v6, AnnounceRequest, AnnounceResponse};
use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use rand::Rng;
use std::io::{Cursor, ErrorKind, Read};
use std::net::SocketAddr;
use std::time::Duration;

/// magic constant for UDP tracker protocol, see BEP 15
const UDP_TRACKER_PROTOCOL_ID: u64 = 0x41727101980;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

#[derive(Debug)]
pub struct UdpTracker {
    socket: UdpSocket,
    connection_id: Option<u64>,
    poll: Poll,
    events: Events,
    timeout: Duration,
    attempts: usize,
}

impl UdpTracker {
    /// A socket bound for talking to `tracker` (v4 or v6 matching it).
    pub fn new(tracker: SocketAddr, timeout: Duration) -> Result<Self> {
        let bind: SocketAddr = if tracker.is_ipv4() {
            "0.0.0.0:0".parse()?
        } else {
            "[::]:0".parse()?
        };
        let mut socket = UdpSocket::bind(bind)?;
        socket.connect(tracker)?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut socket, Token(0), Interest::READABLE)?;
        Ok(Self {
            socket,
            connection_id: None,
            poll,
            events: Events::with_capacity(8),
            timeout,
            attempts: 3,
        })
    }

    /// sends `packet` and waits for the reply with our transaction id, retrying a few times
    fn transact(&mut self, packet: &[u8], txn_id: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; 64 * 1024];
        for attempt in 0..self.attempts {
            self.socket.send(packet)?;
            self.poll.poll(&mut self.events, Some(self.timeout))?;
            if self.events.is_empty() {
                log::debug!("udp tracker silent, attempt {}", attempt + 1);
                continue;
            }
            loop {
                let len = match self.socket.recv(&mut buf) {
                    Ok(len) => len,
                    Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                    Err(err) => return Err(err.into()),
                };
                if len < 8 {
                    continue;
                }
                let mut cursor = Cursor::new(&buf[..len]);
                let action = cursor.read_u32::<BigEndian>()?;
                if cursor.read_u32::<BigEndian>()? != txn_id {
                    continue;
                }
                if action == ACTION_ERROR {
                    let mut message = String::new();
                    cursor.read_to_string(&mut message).ok();
                    return Err(anyhow!("tracker error: {}", message));
                }
                return Ok(buf[..len].to_vec());
            }
        }
        Err(anyhow!("udp tracker did not answer"))
    }

    pub fn connect(&mut self) -> Result<u64> {
        let txn_id = rand::thread_rng().gen::<u32>();
        let mut packet = Vec::with_capacity(16);
        packet.write_u64::<BigEndian>(UDP_TRACKER_PROTOCOL_ID)?;
        packet.write_u32::<BigEndian>(ACTION_CONNECT)?;
        packet.write_u32::<BigEndian>(txn_id)?;

        let reply = self.transact(&packet, txn_id)?;
        let mut cursor = Cursor::new(&reply[..]);
        if cursor.read_u32::<BigEndian>()? != ACTION_CONNECT || reply.len() < 16 {
            return Err(anyhow!("unexpected connect reply"));
        }
        cursor.set_position(8);
        let connection_id = cursor.read_u64::<BigEndian>()?;
        self.connection_id = Some(connection_id);
        Ok(connection_id)
    }

    pub fn announce(&mut self, request: &AnnounceRequest) -> Result<AnnounceResponse> {
        let connection_id = match self.connection_id {
            Some(id) => id,
            None => self.connect()?,
        };
        let txn_id = rand::thread_rng().gen::<u32>();
        let packet = announce_packet(connection_id, txn_id, request)?;
        let reply = self.transact(&packet, txn_id)?;
        parse_announce(&reply, self.socket.peer_addr()?.is_ipv6())
    }
}

fn announce_packet(connection_id: u64, txn_id: u32, request: &AnnounceRequest) -> Result<Vec<u8>> {
    let mut packet = Vec::with_capacity(98);
    packet.write_u64::<BigEndian>(connection_id)?;
    packet.write_u32::<BigEndian>(ACTION_ANNOUNCE)?;
    packet.write_u32::<BigEndian>(txn_id)?;
    packet.extend_from_slice(&request.info_hash);
    packet.extend_from_slice(&request.peer_id);
    packet.write_u64::<BigEndian>(request.downloaded)?;
    packet.write_u64::<BigEndian>(request.left)?;
    packet.write_u64::<BigEndian>(request.uploaded)?;
    packet.write_u32::<BigEndian>(request.event.map(|e| e.code()).unwrap_or(0))?;
    packet.write_u32::<BigEndian>(0)?; // ip: let the tracker use the source address
    packet.write_u32::<BigEndian>(rand::thread_rng().gen())?; // key
    packet.write_i32::<BigEndian>(request.numwant.map(|n| n as i32).unwrap_or(-1))?;
    packet.write_u16::<BigEndian>(request.port)?;
    Ok(packet)
}

/// peers are 6 byte entries over IPv4 and 18 byte entries over IPv6
fn parse_announce(reply: &[u8], ipv6: bool) -> Result<AnnounceResponse> {
    if reply.len() < 20 {
        return Err(anyhow!("announce reply too short"));
    }
    let mut cursor = Cursor::new(reply);
    if cursor.read_u32::<BigEndian>()? != ACTION_ANNOUNCE {
        return Err(anyhow!("unexpected announce reply"));
    }
    let _txn = cursor.read_u32::<BigEndian>()?;
    let interval = cursor.read_u32::<BigEndian>()?;
    let leechers = cursor.read_u32::<BigEndian>()?;
    let seeders = cursor.read_u32::<BigEndian>()?;
    let peers = if ipv6 {
        compact_v6(&reply[20..])
    } else {
        compact_v4(&reply[20..])
    };
    Ok(AnnounceResponse {
        interval: interval as u64,
        min_interval: None,
        warning: None,
        complete: Some(seeders as u64),
        incomplete: Some(leechers as u64),
        peers,
    })
}

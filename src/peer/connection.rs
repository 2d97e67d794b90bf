use crate::peer::message::{Handshake, Message, HANDSHAKE_LEN};
use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use std::io::{Error, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

const TOKEN: Token = Token(0);
/// largest frame we accept: a 16 KiB block plus header, or a big bitfield
const MAX_FRAME: usize = 1 << 20;

/// One non blocking connection to a peer. Every wait is bounded by a timeout.
pub struct Connection {
    pub my_id: [u8; 20],
    stream: TcpStream,
    poll: Poll,
    events: Events,
    pub addr: SocketAddr,
    /// the peer id of the remote peer (recv in handshake)
    pub peer_id: [u8; 20],
    pub info_hash: [u8; 20],
    read_buf: BytesMut,
    write_buf: BytesMut,
    /// the peer closed its side; buffered frames are still handed out
    closed: bool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.addr)
            .field("peer_id", &String::from_utf8_lossy(&self.peer_id))
            .field("info_hash", &hex::encode(self.info_hash))
            .field("buffered_in", &self.read_buf.len())
            .field("buffered_out", &self.write_buf.len())
            .finish()
    }
}

impl Connection {
    /// Connects to a peer and exchanges handshakes, giving up after `timeout`.
    pub fn connect(
        peer: SocketAddr,
        info_hash: [u8; 20],
        my_id: [u8; 20],
        timeout: Duration,
    ) -> Result<Connection, Error> {
        let poll = Poll::new()?;
        let mut stream = TcpStream::connect(peer)?;
        poll.registry()
            .register(&mut stream, TOKEN, Interest::READABLE | Interest::WRITABLE)?;

        let mut connection = Connection {
            my_id,
            stream,
            poll,
            events: Events::with_capacity(64),
            addr: peer,
            peer_id: [0; 20],
            info_hash,
            read_buf: BytesMut::with_capacity(64 * 1024),
            write_buf: BytesMut::with_capacity(1024),
            closed: false,
        };
        connection
            .write_buf
            .extend_from_slice(&Handshake::new(info_hash, my_id).to_bytes());

        let deadline = Instant::now() + timeout;
        let mut connected = false;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::new(ErrorKind::TimedOut, "handshake timed out"));
            }
            connection.poll.poll(&mut connection.events, Some(deadline - now))?;
            let (readable, writable) = connection.readiness();

            if writable && !connected {
                if let Some(err) = connection.stream.take_error()? {
                    return Err(err);
                }
                match connection.stream.peer_addr() {
                    Ok(_) => connected = true,
                    Err(err) if err.kind() == ErrorKind::NotConnected => continue,
                    Err(err) => return Err(err),
                }
                log::debug!("connected to {}", peer);
            }
            if connected {
                connection.flush()?;
            }
            if readable {
                connection.fill()?;
                if connection.read_buf.len() >= HANDSHAKE_LEN {
                    let frame = connection.read_buf.split_to(HANDSHAKE_LEN);
                    let handshake = Handshake::from_bytes(&frame)?;
                    if !handshake.check(&info_hash) {
                        return Err(Error::new(
                            ErrorKind::InvalidData,
                            "Handshake check failed",
                        ));
                    }
                    connection.peer_id = handshake.peer_id;
                    log::debug!("handshake with {} passed", peer);
                    return Ok(connection);
                }
                if connection.closed {
                    return Err(Error::new(
                        ErrorKind::UnexpectedEof,
                        "peer closed during handshake",
                    ));
                }
            }
        }
    }

    fn readiness(&self) -> (bool, bool) {
        self.events.iter().fold((false, false), |(r, w), event| {
            (
                r || event.is_readable() || event.is_read_closed(),
                w || event.is_writable(),
            )
        })
    }

    /// writes buffered output until the socket would block
    fn flush(&mut self) -> Result<(), Error> {
        while !self.write_buf.is_empty() {
            match self.stream.write(&self.write_buf) {
                Ok(0) => return Err(Error::new(ErrorKind::WriteZero, "peer closed")),
                Ok(n) => self.write_buf.advance(n),
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// reads until the socket would block or the peer closes
    fn fill(&mut self) -> Result<(), Error> {
        let mut chunk = [0u8; 16 * 1024];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    self.closed = true;
                    return Ok(());
                }
                Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Queues a message and writes as much as the socket takes right now.
    pub fn send(&mut self, message: &Message) -> Result<(), Error> {
        self.write_buf.extend_from_slice(&message.serialize());
        log::trace!("queued type {} message to {}", message.id(), self.addr);
        self.flush()
    }

    /// Waits up to `timeout` for socket activity and returns every complete
    /// message received so far.
    pub fn recv(&mut self, timeout: Duration) -> Result<Vec<Message>, Error> {
        if self.closed {
            return Err(Error::new(ErrorKind::UnexpectedEof, "peer closed"));
        }
        self.poll.poll(&mut self.events, Some(timeout))?;
        let (readable, writable) = self.readiness();
        if writable {
            self.flush()?;
        }
        if readable {
            self.fill()?;
        }

        let mut messages = Vec::new();
        while self.read_buf.len() >= 4 {
            let len = u32::from_be_bytes([
                self.read_buf[0],
                self.read_buf[1],
                self.read_buf[2],
                self.read_buf[3],
            ]) as usize;
            if len > MAX_FRAME {
                return Err(Error::new(
                    ErrorKind::InvalidData,
                    format!("frame of {} bytes is too large", len),
                ));
            }
            if self.read_buf.len() < 4 + len {
                break;
            }
            let frame = self.read_buf.split_to(4 + len);
            messages.push(Message::deserialize(&frame)?);
        }
        Ok(messages)
    }

    pub fn has_pending_output(&self) -> bool {
        !self.write_buf.is_empty()
    }

    /// Closes the connection to the peer
    pub fn close(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

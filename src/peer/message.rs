use bytes::{Buf, BufMut, BytesMut};
use std::io::{Error, ErrorKind};

pub const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 68;

#[derive(Debug, PartialEq, Clone)]
pub struct Handshake {
    /// 8 reserved bytes. We set none and ignore what the peer sets.
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    /// 20-byte string used as a unique ID for the client.
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Handshake {
        Handshake {
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Handshake, Error> {
        if bytes.len() < HANDSHAKE_LEN {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "Handshake message should be at least 68 bytes long",
            ));
        }
        if bytes[0] as usize != PROTOCOL.len() || &bytes[1..20] != PROTOCOL {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "peer does not speak the BitTorrent protocol",
            ));
        }

        let mut reserved = [0; 8];
        reserved.copy_from_slice(&bytes[20..28]);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&bytes[28..48]);
        let mut peer_id = [0; 20];
        peer_id.copy_from_slice(&bytes[48..68]);

        Ok(Handshake {
            reserved,
            info_hash,
            peer_id,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HANDSHAKE_LEN);
        bytes.push(PROTOCOL.len() as u8);
        bytes.extend_from_slice(PROTOCOL);
        bytes.extend_from_slice(&self.reserved);
        bytes.extend_from_slice(&self.info_hash);
        bytes.extend_from_slice(&self.peer_id);
        bytes
    }

    pub fn check(&self, info_hash: &[u8]) -> bool {
        self.info_hash == info_hash
    }
}

#[derive(Debug, PartialEq, Clone)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request(u32, u32, u32),
    Piece(u32, u32, Vec<u8>),
    Cancel(u32, u32, u32),
    Port(u16),
}

impl Message {
    /// length prefixed wire form
    pub fn serialize(&self) -> Vec<u8> {
        let mut msg = BytesMut::with_capacity(4 + self.len());
        msg.put_u32(self.len() as u32);
        if let Message::KeepAlive = self {
            return msg.to_vec();
        }
        msg.put_u8(self.id());
        match self {
            Message::Have(index) => msg.put_u32(*index),
            Message::Bitfield(bitfield) => msg.put_slice(bitfield),
            Message::Request(index, begin, length) | Message::Cancel(index, begin, length) => {
                msg.put_u32(*index);
                msg.put_u32(*begin);
                msg.put_u32(*length);
            }
            Message::Piece(index, begin, block) => {
                msg.put_u32(*index);
                msg.put_u32(*begin);
                msg.put_slice(block);
            }
            Message::Port(port) => msg.put_u16(*port),
            _ => {}
        }
        msg.to_vec()
    }

    /// Parses one whole frame, length prefix included.
    pub fn deserialize(data: &[u8]) -> Result<Message, Error> {
        if data.len() < 4 {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "Message too short to be valid",
            ));
        }
        let mut buf = data;
        let len = buf.get_u32() as usize;
        if buf.len() != len {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("length prefix {} but {} bytes follow", len, buf.len()),
            ));
        }
        if len == 0 {
            return Ok(Message::KeepAlive);
        }

        let id = buf.get_u8();
        let expect = |want: usize, name: &str| {
            if len == want {
                Ok(())
            } else {
                Err(Error::new(
                    ErrorKind::InvalidData,
                    format!("{} message should be {} bytes long", name, want),
                ))
            }
        };
        let msg = match id {
            0 => Message::Choke,
            1 => Message::Unchoke,
            2 => Message::Interested,
            3 => Message::NotInterested,
            4 => {
                expect(5, "Have")?;
                Message::Have(buf.get_u32())
            }
            5 => Message::Bitfield(buf.to_vec()),
            6 => {
                expect(13, "Request")?;
                Message::Request(buf.get_u32(), buf.get_u32(), buf.get_u32())
            }
            7 => {
                if len < 9 {
                    return Err(Error::new(
                        ErrorKind::InvalidData,
                        "Piece message should be at least 9 bytes long",
                    ));
                }
                let index = buf.get_u32();
                let begin = buf.get_u32();
                Message::Piece(index, begin, buf.to_vec())
            }
            8 => {
                expect(13, "Cancel")?;
                Message::Cancel(buf.get_u32(), buf.get_u32(), buf.get_u32())
            }
            9 => {
                expect(3, "Port")?;
                Message::Port(buf.get_u16())
            }
            _ => {
                return Err(Error::new(
                    ErrorKind::InvalidData,
                    format!("Unknown message id {}", id),
                ))
            }
        };
        Ok(msg)
    }

    pub fn id(&self) -> u8 {
        match self {
            Message::KeepAlive => 0,
            Message::Choke => 0,
            Message::Unchoke => 1,
            Message::Interested => 2,
            Message::NotInterested => 3,
            Message::Have(_) => 4,
            Message::Bitfield(_) => 5,
            Message::Request(_, _, _) => 6,
            Message::Piece(_, _, _) => 7,
            Message::Cancel(_, _, _) => 8,
            Message::Port(_) => 9,
        }
    }

    /// payload length, id byte included
    pub fn len(&self) -> usize {
        match self {
            Message::KeepAlive => 0,
            Message::Choke => 1,
            Message::Unchoke => 1,
            Message::Interested => 1,
            Message::NotInterested => 1,
            Message::Have(_) => 5,
            Message::Bitfield(bitfield) => 1 + bitfield.len(),
            Message::Request(_, _, _) => 13,
            Message::Piece(_, _, block) => 9 + block.len(),
            Message::Cancel(_, _, _) => 13,
            Message::Port(_) => 3,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Message::KeepAlive)
    }
}

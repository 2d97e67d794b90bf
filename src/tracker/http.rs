use anyhow::{anyhow, Context, Result};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use std::io::{ErrorKind, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::time::{Duration, Instant};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Started,
    Completed,
    Stopped,
}

impl Event {
    pub fn as_str(self) -> &'static str {
        match self {
            Event::Started => "started",
            Event::Completed => "completed",
            Event::Stopped => "stopped",
        }
    }

    /// numeric form used by UDP trackers
    pub fn code(self) -> u32 {
        match self {
            Event::Completed => 1,
            Event::Started => 2,
            Event::Stopped => 3,
        }
    }
}

/// What we tell a tracker. Shared by the HTTP and UDP clients.
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Option<Event>,
    pub numwant: Option<u32>,
}

impl AnnounceRequest {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20], port: u16) -> AnnounceRequest {
        AnnounceRequest {
            info_hash,
            peer_id,
            port,
            uploaded: 0,
            downloaded: 0,
            left: 0,
            event: None,
            numwant: Some(200),
        }
    }
}

/// the text parameters; info_hash and peer_id are raw bytes and encoded separately
#[derive(Debug, Serialize)]
struct AnnounceQuery {
    port: u16,
    uploaded: u64,
    downloaded: u64,
    left: u64,
    compact: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    event: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    numwant: Option<u32>,
}

/// A tracker's answer, from either protocol.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnnounceResponse {
    /// interval in seconds that the client should wait between sending regular requests to the tracker
    pub interval: u64,
    /// minimum announce interval. If present clients must not reannounce more frequently than this.
    pub min_interval: Option<u64>,
    /// warning, similar to failure reason, but the response still gets processed normally
    pub warning: Option<String>,
    /// number of peers with the entire file, i.e. seeders
    pub complete: Option<u64>,
    /// number of non-seeder peers, aka "leechers"
    pub incomplete: Option<u64>,
    pub peers: Vec<SocketAddr>,
}

/// peers come either compact (BEP 23) or as a list of dictionaries
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PeerList {
    Compact(ByteBuf),
    Dicts(Vec<PeerDict>),
}

#[derive(Debug, Deserialize)]
struct PeerDict {
    ip: String,
    port: u16,
}

#[derive(Debug, Deserialize)]
struct RawResponse {
    /// can still have a 200 ok, but this indicates a failure within the BT protocol request
    #[serde(default, rename = "failure reason")]
    failure_reason: Option<String>,
    #[serde(default, rename = "warning message")]
    warning_message: Option<String>,
    #[serde(default)]
    interval: Option<u64>,
    #[serde(default, rename = "min interval")]
    min_interval: Option<u64>,
    #[serde(default)]
    complete: Option<u64>,
    #[serde(default)]
    incomplete: Option<u64>,
    #[serde(default)]
    peers: Option<PeerList>,
    /// compact IPv6 peers, BEP 7
    #[serde(default)]
    peers6: Option<ByteBuf>,
}

pub fn compact_v4(bytes: &[u8]) -> Vec<SocketAddr> {
    bytes
        .chunks_exact(6)
        .map(|c| {
            let ip = Ipv4Addr::new(c[0], c[1], c[2], c[3]);
            SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be_bytes([c[4], c[5]])))
        })
        .collect()
}

pub fn compact_v6(bytes: &[u8]) -> Vec<SocketAddr> {
    bytes
        .chunks_exact(18)
        .map(|c| {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&c[..16]);
            let port = u16::from_be_bytes([c[16], c[17]]);
            SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(octets), port, 0, 0))
        })
        .collect()
}

#[derive(Debug)]
pub struct HttpTracker {
    poll: Poll,
    events: Events,
    timeout: Duration,
}

impl HttpTracker {
    pub fn new(timeout: Duration) -> Result<Self> {
        let poll = Poll::new()?;
        let events = Events::with_capacity(64);
        Ok(HttpTracker {
            poll,
            events,
            timeout,
        })
    }

    /// Announces to `url` at the already resolved `addr` (so the caller can
    /// filter tracker addresses first).
    pub fn announce(
        &mut self,
        url: &Url,
        addr: SocketAddr,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse> {
        if url.scheme() != "http" {
            return Err(anyhow!("unsupported tracker scheme {}", url.scheme()));
        }
        let host = url.host_str().ok_or(anyhow!("no host"))?;
        let request = build_request(url, host, request)?;
        log::debug!("announce request to {}: {}", addr, request.lines().next().unwrap_or(""));
        let raw = self.exchange(addr, request.as_bytes())?;
        parse_announce_response(&raw)
    }

    /// sends `request` and reads until the server closes, within the timeout
    fn exchange(&mut self, addr: SocketAddr, request: &[u8]) -> Result<Vec<u8>> {
        let token = Token(1);
        let mut stream = TcpStream::connect(addr)?;
        self.poll
            .registry()
            .register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)?;

        let deadline = Instant::now() + self.timeout;
        let mut written = 0;
        let mut response = Vec::new();
        let result = loop {
            let now = Instant::now();
            if now >= deadline {
                break Err(anyhow!("Timeout waiting for tracker response"));
            }
            self.poll.poll(&mut self.events, Some(deadline - now))?;
            let mut done = false;
            for event in self.events.iter() {
                if event.is_writable() && written < request.len() {
                    if let Some(err) = stream.take_error()? {
                        return Err(err).context("connecting to tracker");
                    }
                    match stream.write(&request[written..]) {
                        Ok(n) => written += n,
                        Err(err)
                            if err.kind() == ErrorKind::WouldBlock
                                || err.kind() == ErrorKind::NotConnected => {}
                        Err(err) => return Err(err.into()),
                    }
                }
                if event.is_readable() || event.is_read_closed() {
                    let mut chunk = [0u8; 8192];
                    loop {
                        match stream.read(&mut chunk) {
                            Ok(0) => {
                                done = true;
                                break;
                            }
                            Ok(n) => response.extend_from_slice(&chunk[..n]),
                            Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                            Err(err) => return Err(err.into()),
                        }
                    }
                }
            }
            if done {
                break Ok(response);
            }
        };
        self.poll.registry().deregister(&mut stream)?;
        result
    }
}

fn build_request(url: &Url, host: &str, request: &AnnounceRequest) -> Result<String> {
    let query = serde_urlencoded::to_string(AnnounceQuery {
        port: request.port,
        uploaded: request.uploaded,
        downloaded: request.downloaded,
        left: request.left,
        compact: 1,
        event: request.event.map(Event::as_str),
        numwant: request.numwant,
    })?;
    let mut path = format!("{}?", url.path());
    if let Some(existing) = url.query() {
        path.push_str(existing);
        path.push('&');
    }
    path.push_str(&format!(
        "info_hash={}&peer_id={}&{}",
        urlencoding::encode_binary(&request.info_hash),
        urlencoding::encode_binary(&request.peer_id),
        query
    ));
    let host_header = match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };
    // HTTP/1.0 keeps servers from answering chunked
    Ok(format!(
        "GET {} HTTP/1.0\r\nHost: {}\r\nUser-Agent: peer-evidence/{}\r\nConnection: close\r\n\r\n",
        path,
        host_header,
        env!("CARGO_PKG_VERSION")
    ))
}

pub fn parse_announce_response(raw: &[u8]) -> Result<AnnounceResponse> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut headers);
    let header_len = match response.parse(raw)? {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => return Err(anyhow!("Invalid response")),
    };
    let code = response.code.unwrap_or(0);
    if code != 200 {
        return Err(anyhow!(
            "tracker answered {} {}",
            code,
            response.reason.unwrap_or("")
        ));
    }

    let body = &raw[header_len..];
    let raw: RawResponse =
        serde_bencode::from_bytes(body).context("tracker response is not bencoded")?;
    if let Some(reason) = raw.failure_reason {
        return Err(anyhow!("tracker failure: {}", reason));
    }

    let mut peers = match raw.peers {
        Some(PeerList::Compact(bytes)) => compact_v4(&bytes),
        Some(PeerList::Dicts(list)) => list
            .into_iter()
            .filter_map(|p| p.ip.parse::<IpAddr>().ok().map(|ip| SocketAddr::new(ip, p.port)))
            .collect(),
        None => Vec::new(),
    };
    if let Some(bytes) = raw.peers6 {
        peers.extend(compact_v6(&bytes));
    }

    Ok(AnnounceResponse {
        interval: raw.interval.unwrap_or(1800),
        min_interval: raw.min_interval,
        warning: raw.warning_message,
        complete: raw.complete,
        incomplete: raw.incomplete,
        peers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn http_ok(body: &[u8]) -> Vec<u8> {
        let mut raw = format!(
            "HTTP/1.0 200 OK\r\nContent-Length: {}\r\n\r\n",
            body.len()
        )
        .into_bytes();
        raw.extend_from_slice(body);
        raw
    }

    #[test]
    fn parses_compact_v4_and_v6() {
        let mut body = b"d8:intervali900e5:peers12:".to_vec();
        body.extend_from_slice(&[10, 0, 0, 1, 0x1a, 0xe1, 192, 168, 1, 2, 0, 80]);
        body.extend_from_slice(b"6:peers618:");
        let mut v6 = [0u8; 18];
        v6[0] = 0x20;
        v6[1] = 0x01;
        v6[15] = 1;
        v6[17] = 99;
        body.extend_from_slice(&v6);
        body.push(b'e');

        let response = parse_announce_response(&http_ok(&body)).unwrap();
        assert_eq!(response.interval, 900);
        assert_eq!(
            response.peers,
            vec![
                "10.0.0.1:6881".parse().unwrap(),
                "192.168.1.2:80".parse().unwrap(),
                "[2001::1]:99".parse().unwrap(),
            ]
        );
    }

    #[test]
    fn parses_dictionary_peers() {
        let body = b"d8:intervali60e5:peersld2:ip8:10.0.0.74:porti51413eeee";
        let response = parse_announce_response(&http_ok(body)).unwrap();
        assert_eq!(response.peers, vec!["10.0.0.7:51413".parse().unwrap()]);
    }

    #[test]
    fn failure_reason_is_an_error() {
        let body = b"d14:failure reason15:torrent unknowne";
        let err = parse_announce_response(&http_ok(body)).unwrap_err();
        assert!(err.to_string().contains("torrent unknown"));
    }

    #[test]
    fn query_carries_binary_fields() {
        let url = Url::parse("http://tracker.example:6969/announce").unwrap();
        let mut request = AnnounceRequest::new([0xff; 20], *b"-PE0100-abcdefghijkl", 6881);
        request.left = 1234;
        request.event = Some(Event::Started);
        let text = build_request(&url, "tracker.example", &request).unwrap();
        assert!(text.starts_with("GET /announce?info_hash=%FF%FF"));
        assert!(text.contains("peer_id=-PE0100-abcdefghijkl"));
        assert!(text.contains("left=1234"));
        assert!(text.contains("event=started"));
        assert!(text.contains("compact=1"));
        assert!(text.contains("Host: tracker.example:6969\r\n"));
    }

    #[test]
    fn announce_against_local_tracker() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 2048];
            let n = stream.read(&mut buf).unwrap();
            assert!(buf[..n].starts_with(b"GET /announce?"));
            let mut body = b"d8:intervali120e5:peers6:".to_vec();
            body.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1]);
            body.push(b'e');
            stream.write_all(&http_ok(&body)).unwrap();
        });

        let url = Url::parse(&format!("http://{}/announce", addr)).unwrap();
        let mut tracker = HttpTracker::new(Duration::from_secs(5)).unwrap();
        let request = AnnounceRequest::new([1; 20], [2; 20], 6881);
        let response = tracker.announce(&url, addr, &request).unwrap();
        server.join().unwrap();
        assert_eq!(response.interval, 120);
        assert_eq!(response.peers, vec!["127.0.0.1:6881".parse().unwrap()]);
    }
}

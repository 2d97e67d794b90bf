use crate::locale::{Locale, Text};
use encoding_rs::{Encoding, ISO_2022_JP};
use std::io::{self, Read, Write};
use std::net::{IpAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Names the network provider behind a peer address. Failures come back as
/// a readable sentinel string, never as an error.
pub trait ProviderLookup {
    fn provider(&self, ip: IpAddr) -> String;
}

/// WHOIS over TCP (RFC 3912) against a registry that answers with a labelled
/// organization line, JPNIC by default.
#[derive(Debug, Clone)]
pub struct WhoisLookup {
    server: String,
    label: String,
    encoding: &'static Encoding,
    timeout: Duration,
    locale: Locale,
}

impl WhoisLookup {
    pub fn jpnic(server: &str, locale: Locale) -> WhoisLookup {
        WhoisLookup {
            server: server.to_string(),
            label: "[組織名]".to_string(),
            encoding: ISO_2022_JP,
            timeout: Duration::from_secs(15),
            locale,
        }
    }

    pub fn with_label(mut self, label: &str, encoding: &'static Encoding) -> WhoisLookup {
        self.label = label.to_string();
        self.encoding = encoding;
        self
    }

    fn query(&self, ip: IpAddr) -> io::Result<Vec<u8>> {
        let addr = self
            .server
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "whois server did not resolve"))?;
        let mut stream = TcpStream::connect_timeout(&addr, self.timeout)?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.write_all(format!("{}\r\n", ip).as_bytes())?;
        let mut data = Vec::new();
        stream.read_to_end(&mut data)?;
        Ok(data)
    }
}

impl ProviderLookup for WhoisLookup {
    fn provider(&self, ip: IpAddr) -> String {
        let data = match self.query(ip) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::ConnectionReset => {
                log::warn!("{}", self.locale.text(Text::LookupReset));
                return self.locale.text(Text::LookupReset).to_string();
            }
            Err(err) => {
                log::warn!("{}: {}", self.locale.text(Text::LookupSocket), err);
                return self.locale.text(Text::LookupSocket).to_string();
            }
        };
        let (text, _, _) = self.encoding.decode(&data);
        match organization(&text, &self.label) {
            Some(name) if !name.is_empty() => name,
            Some(_) => self.locale.text(Text::LookupUnknown).to_string(),
            None => self.locale.text(Text::LookupNotManaged).to_string(),
        }
    }
}

/// the text after `label` on its line, with surrounding whitespace removed
pub fn organization(response: &str, label: &str) -> Option<String> {
    response.lines().find_map(|line| {
        let start = line.find(label)?;
        Some(line[start + label.len()..].trim().to_string())
    })
}

/// Fixed answer for every address, for runs where lookups are unwanted.
#[derive(Debug, Clone)]
pub struct StaticLookup(pub String);

impl ProviderLookup for StaticLookup {
    fn provider(&self, _ip: IpAddr) -> String {
        self.0.clone()
    }
}

/*
src/roster.rs

peer_<infohash>.csv in an evidence folder: one row per peer ever seen for the torrent.

    ip,port,provider,remote_host,valid_piece_count,first_seen,last_seen

rows are matched by ip and port. a new peer appends a row, a known peer gets its last_seen refreshed and,
for a verified piece, its counter incremented. every update rewrites the whole file through a temp file in
the same folder that is renamed over the old one, so a failed write leaves the previous roster intact.
*/

use crate::error::{EvidenceError, Result};
use crate::locale::{Locale, Text};
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

const COLUMNS: usize = 7;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterRow {
    pub ip: String,
    pub port: String,
    pub provider: String,
    pub remote_host: String,
    /// kept as text so a hand edited, non numeric value survives untouched
    pub valid_count: String,
    pub first_seen: String,
    pub last_seen: String,
}

impl RosterRow {
    fn from_record(record: &csv::StringRecord) -> RosterRow {
        let field = |i: usize| record.get(i).unwrap_or("").to_string();
        RosterRow {
            ip: field(0),
            port: field(1),
            provider: field(2),
            remote_host: field(3),
            valid_count: field(4),
            first_seen: field(5),
            last_seen: field(6),
        }
    }

    fn to_record(&self) -> [&str; COLUMNS] {
        [
            &self.ip,
            &self.port,
            &self.provider,
            &self.remote_host,
            &self.valid_count,
            &self.first_seen,
            &self.last_seen,
        ]
    }

    fn is(&self, peer: SocketAddr) -> bool {
        self.ip == peer.ip().to_string() && self.port == peer.port().to_string()
    }
}

/// One observation to fold into the roster.
#[derive(Debug, Clone, Copy)]
pub struct Sighting<'a> {
    pub peer: SocketAddr,
    /// None keeps whatever provider the row already has
    pub provider: Option<&'a str>,
    pub valid_piece: bool,
    pub seen_at: &'a str,
}

#[derive(Debug, Clone)]
pub struct Roster {
    path: PathBuf,
    locale: Locale,
}

impl Roster {
    pub fn new(path: impl Into<PathBuf>, locale: Locale) -> Roster {
        Roster {
            path: path.into(),
            locale,
        }
    }

    /// `peer_<infohash>.csv` inside `folder`
    pub fn for_torrent(folder: &Path, info_hash_hex: &str, locale: Locale) -> Roster {
        Roster::new(folder.join(format!("peer_{}.csv", info_hash_hex)), locale)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows(&self) -> Result<Vec<RosterRow>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(&self.path)
            .map_err(|err| self.csv_error(err))?;
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|err| self.csv_error(err))?;
            if record.iter().all(str::is_empty) {
                continue;
            }
            rows.push(RosterRow::from_record(&record));
        }
        Ok(rows)
    }

    /// Creates or updates the row of `sighting.peer` and rewrites the file.
    pub fn record(&self, sighting: &Sighting) -> Result<()> {
        let mut rows = self.rows()?;
        match rows.iter_mut().find(|row| row.is(sighting.peer)) {
            Some(row) => {
                if sighting.valid_piece {
                    match row.valid_count.trim().parse::<u64>() {
                        Ok(count) => row.valid_count = (count + 1).to_string(),
                        Err(_) => {
                            log::warn!("{} ({})", self.locale.text(Text::RosterNotNumeric), row.valid_count);
                            return Ok(());
                        }
                    }
                }
                if let Some(provider) = sighting.provider {
                    row.provider = provider.to_string();
                }
                row.last_seen = sighting.seen_at.to_string();
            }
            None => rows.push(RosterRow {
                ip: sighting.peer.ip().to_string(),
                port: sighting.peer.port().to_string(),
                provider: sighting
                    .provider
                    .unwrap_or(self.locale.text(Text::NotFetched))
                    .to_string(),
                remote_host: String::new(),
                valid_count: u64::from(sighting.valid_piece).to_string(),
                first_seen: sighting.seen_at.to_string(),
                last_seen: sighting.seen_at.to_string(),
            }),
        }
        self.write(&rows)
    }

    fn write(&self, rows: &[RosterRow]) -> Result<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let tmp = NamedTempFile::new_in(dir).map_err(|err| self.io_error(err))?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(tmp);
        for row in rows {
            writer
                .write_record(row.to_record())
                .map_err(|err| self.csv_error(err))?;
        }
        let tmp = writer
            .into_inner()
            .map_err(|err| self.io_error(err.into_error()))?;
        tmp.persist(&self.path)
            .map_err(|err| self.io_error(err.error))?;
        Ok(())
    }

    fn io_error(&self, err: io::Error) -> EvidenceError {
        if err.kind() == ErrorKind::PermissionDenied {
            EvidenceError::PermissionDenied(self.path.clone())
        } else {
            EvidenceError::Io(err)
        }
    }

    fn csv_error(&self, err: csv::Error) -> EvidenceError {
        match err.into_kind() {
            csv::ErrorKind::Io(err) => self.io_error(err),
            other => EvidenceError::Io(io::Error::new(ErrorKind::InvalidData, format!("{:?}", other))),
        }
    }
}

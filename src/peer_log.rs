/*
src/peer_log.rs

human readable, append only evidence logs. the header is written when a log is created and never again;
every later write appends one line.

    <folder>/<peer_dir>/<peer_dir>_<infohash>.log    one line per piece attempt
    <folder>/peers/<peer_dir>_<infohash>.log         one line per sampling observation
*/

use crate::evidence::peer_dir_name;
use crate::locale::{Locale, Text};
use std::fs::OpenOptions;
use std::io::{self, ErrorKind, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

const PIECE_LOG_SEPARATOR: &str = "---";
const SAMPLING_LOG_SEPARATOR: &str = "------------------------------------";
/// the full width space the sampling lines are joined with
const WIDE_SPACE: char = '\u{3000}';

#[derive(Debug, Clone)]
pub struct EvidenceLog {
    path: PathBuf,
}

impl EvidenceLog {
    pub fn new(path: impl Into<PathBuf>) -> EvidenceLog {
        EvidenceLog { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Appends `line`, first writing `header` if the log does not exist yet.
    pub fn append(&self, header: impl FnOnce() -> String, line: &str) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match OpenOptions::new().write(true).create_new(true).open(&self.path) {
            Ok(mut file) => file.write_all(header().as_bytes())?,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
            Err(err) => return Err(err),
        }
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        writeln!(file, "{}", line)
    }
}

/// What every header names besides the peer itself.
#[derive(Debug, Clone)]
pub struct LogContext<'a> {
    pub file_name: &'a str,
    pub info_hash_hex: &'a str,
    pub started_at: &'a str,
    pub version: &'a str,
    pub locale: Locale,
}

impl LogContext<'_> {
    fn label(&self, key: Text) -> &'static str {
        self.locale.text(key)
    }

    pub fn piece_log(&self, folder: &Path, peer: SocketAddr) -> EvidenceLog {
        let dir = peer_dir_name(peer);
        EvidenceLog::new(
            folder
                .join(&dir)
                .join(format!("{}_{}.log", dir, self.info_hash_hex)),
        )
    }

    pub fn sampling_log(&self, folder: &Path, peer: SocketAddr) -> EvidenceLog {
        EvidenceLog::new(
            folder
                .join("peers")
                .join(format!("{}_{}.log", peer_dir_name(peer), self.info_hash_hex)),
        )
    }

    pub fn piece_header(&self, peer: SocketAddr, provider: &str) -> String {
        format!(
            "{}{}\n{}{}\n{}{}\n{}{}\n{}{}\n{}{}\n{}{}\n{}\n",
            self.label(Text::LabelIp),
            peer.ip(),
            self.label(Text::LabelPort),
            peer.port(),
            self.label(Text::LabelProvider),
            provider,
            self.label(Text::LabelFileName),
            self.file_name,
            self.label(Text::LabelFileHash),
            self.info_hash_hex,
            self.label(Text::LabelStart),
            self.started_at,
            self.label(Text::LabelTool),
            self.version,
            PIECE_LOG_SEPARATOR,
        )
    }

    /// `piece<index><error> 完了時刻: <ts> <version>`
    pub fn piece_line(&self, index: usize, error: &str, completed_at: &str) -> String {
        format!(
            "piece{}{} {}{} {}",
            index,
            error,
            self.label(Text::LabelCompleted),
            completed_at,
            self.version
        )
    }

    pub fn sampling_header(&self, peer: SocketAddr, client: &str) -> String {
        format!(
            "{}{}\n{}{}\n{}{}\n{}{}\n{}{}\n{}{}\n{}{}\n{}{}\n{}\n",
            self.label(Text::LabelIp),
            peer.ip(),
            self.label(Text::LabelPort),
            peer.port(),
            self.label(Text::LabelClient),
            client,
            self.label(Text::LabelProvider),
            self.label(Text::NotFetched),
            self.label(Text::LabelFileName),
            self.file_name,
            self.label(Text::LabelFileHash),
            self.info_hash_hex,
            self.label(Text::LabelStart),
            self.started_at,
            self.label(Text::LabelTool),
            self.version,
            SAMPLING_LOG_SEPARATOR,
        )
    }

    /// `<ts>　<client>　速度：<speed> KB/s　<corrupt piece note>`
    pub fn sampling_line(&self, seen_at: &str, client: &str, bytes_per_sec: u64, intact: bool) -> String {
        let note = if intact {
            ""
        } else {
            self.label(Text::CorruptPieceSeen)
        };
        format!(
            "{ts}{sp}{client}{sp}{label}{speed:.1} KB/s{sp}{note}",
            ts = seen_at,
            sp = WIDE_SPACE,
            client = client,
            label = self.label(Text::LabelSpeed),
            speed = bytes_per_sec as f64 / 1024.0,
            note = note,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(locale: Locale) -> LogContext<'static> {
        LogContext {
            file_name: "movie.mp4",
            info_hash_hex: "00ff",
            started_at: "2024-05-01 13:45:10.123",
            version: "ver.1.0",
            locale,
        }
    }

    #[test]
    fn header_only_once() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(Locale::Ja);
        let peer: SocketAddr = "203.0.113.5:6881".parse().unwrap();
        let log = ctx.piece_log(dir.path(), peer);
        assert_eq!(
            log.path(),
            dir.path().join("203.0.113.5_6881/203.0.113.5_6881_00ff.log")
        );

        log.append(|| ctx.piece_header(peer, "Example ISP"), &ctx.piece_line(3, "", "t1"))
            .unwrap();
        log.append(|| panic!("header written twice"), &ctx.piece_line(9, " エラー：x ", "t2"))
            .unwrap();

        let text = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "IPアドレス：203.0.113.5");
        assert_eq!(lines[2], "プロバイダ：Example ISP");
        assert_eq!(lines[7], "---");
        assert_eq!(lines[8], "piece3 完了時刻: t1 ver.1.0");
        assert_eq!(lines[9], "piece9 エラー：x  完了時刻: t2 ver.1.0");
        assert_eq!(lines.len(), 10);
    }

    #[test]
    fn sampling_log_lives_under_peers() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(Locale::Ja);
        let peer: SocketAddr = "[2001:db8::1]:51413".parse().unwrap();
        let log = ctx.sampling_log(dir.path(), peer);
        assert_eq!(log.path(), dir.path().join("peers/2001-db8--1_51413_00ff.log"));

        log.append(
            || ctx.sampling_header(peer, "qBittorrent 4.6.2"),
            &ctx.sampling_line("t1", "qBittorrent 4.6.2", 51_200, false),
        )
        .unwrap();
        let text = std::fs::read_to_string(log.path()).unwrap();
        assert!(text.contains("クライアント：qBittorrent 4.6.2\n"));
        assert!(text.contains("プロバイダ：未取得\n"));
        assert!(text.ends_with("t1\u{3000}qBittorrent 4.6.2\u{3000}速度：50.0 KB/s\u{3000}破損ピース：あり\n"));
    }
}

/*
src/evidence.rs

layout of the evidence tree on disk.

    evi/tor/<YYYY-MM-DD_HH-MM-SS>/     one folder per registered torrent
        source.torrent
        evi_<folder>.log               registration record
        .process                       marker: collect for this folder
        .download_skip                 marker: do not download the content
        <content>
        peer_<infohash>.csv
        <peer_dir>/...                 piece files and piece log
        peers/...                      sampling logs
    evi/tmp/                           sampling scratch, swept of orphans

nothing here ever deletes or overwrites evidence; clashing names get a numeric suffix.
*/

use crate::clock::Clock;
use crate::collector::PieceVerdict;
use crate::error::{EvidenceError, Result};
use crate::locale::{Locale, Text};
use crate::torrent::TorrentDescriptor;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

pub const PROCESS_MARKER: &str = ".process";
pub const DOWNLOAD_SKIP_MARKER: &str = ".download_skip";

/// `<ip>_<port>`, with the colons of an IPv6 address turned into hyphens
pub fn peer_dir_name(peer: SocketAddr) -> String {
    format!("{}_{}", peer.ip().to_string().replace(':', "-"), peer.port())
}

/// `<prefix><index:05>_<ip>_<port>_<infohash>.bin`
pub fn piece_file_name(verdict: PieceVerdict, index: usize, peer: SocketAddr, info_hash_hex: &str) -> String {
    format!(
        "{}{:05}_{}_{}.bin",
        verdict.prefix(),
        index,
        peer_dir_name(peer),
        info_hash_hex
    )
}

/// `path` itself if free, else the first free `<stem>_<n>.<ext>` with n = 1, 2, ...
pub fn unique_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = path.extension().map(|e| e.to_string_lossy().into_owned());
    (1..)
        .map(|n| {
            let name = match &extension {
                Some(ext) => format!("{}_{}.{}", stem, n, ext),
                None => format!("{}_{}", stem, n),
            };
            path.with_file_name(name)
        })
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| path.to_path_buf())
}

/// Writes piece bytes under the peer's folder, never replacing an existing file.
pub fn save_piece(
    folder: &Path,
    verdict: PieceVerdict,
    index: usize,
    peer: SocketAddr,
    info_hash_hex: &str,
    data: &[u8],
) -> io::Result<PathBuf> {
    let dir = folder.join(peer_dir_name(peer));
    fs::create_dir_all(&dir)?;
    let path = unique_path(&dir.join(piece_file_name(verdict, index, peer, info_hash_hex)));
    let mut file = OpenOptions::new().write(true).create_new(true).open(&path)?;
    file.write_all(data)?;
    Ok(path)
}

fn walk(dir: &Path, found: &mut Vec<PathBuf>, wanted: &dyn Fn(&Path) -> bool) -> io::Result<()> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<io::Result<_>>()?;
    entries.sort();
    for path in entries {
        if wanted(&path) {
            found.push(path.clone());
        }
        if path.is_dir() {
            walk(&path, found, wanted)?;
        }
    }
    Ok(())
}

/// every `.torrent` file below `root`
pub fn find_torrents(root: &Path) -> io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    if root.is_dir() {
        walk(root, &mut found, &|path| {
            path.is_file() && path.extension().is_some_and(|ext| ext == "torrent")
        })?;
    }
    Ok(found)
}

/// every saved `.bin` piece below `folder`
pub fn find_piece_files(folder: &Path) -> io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    if folder.is_dir() {
        walk(folder, &mut found, &|path| {
            path.is_file() && path.extension().is_some_and(|ext| ext == "bin")
        })?;
    }
    Ok(found)
}

/// the piece index a `.bin` file name was saved under, verdict prefix or not
pub fn piece_index_from_name(file_name: &str) -> Option<usize> {
    let rest = ["BLANK_", "FALSE_", "INVALID_"]
        .iter()
        .find_map(|prefix| file_name.strip_prefix(prefix))
        .unwrap_or(file_name);
    let digits = rest.get(..5)?;
    if !digits.bytes().all(|b| b.is_ascii_digit()) || rest.as_bytes().get(5) != Some(&b'_') {
        return None;
    }
    digits.parse().ok()
}

/// evidence folders below `evi_root` that carry a `.process` marker
pub fn pending_folders(evi_root: &Path) -> io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    if evi_root.is_dir() {
        walk(evi_root, &mut found, &|path| {
            path.is_dir() && path.join(PROCESS_MARKER).is_file()
        })?;
    }
    Ok(found)
}

/// Removes whatever earlier sampling runs left in the scratch area.
/// Returns how many entries went away.
pub fn sweep_scratch(scratch: &Path) -> usize {
    let Ok(entries) = fs::read_dir(scratch) else {
        return 0;
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let result = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match result {
            Ok(()) => removed += 1,
            Err(err) => log::warn!("cannot remove scratch {}: {}", path.display(), err),
        }
    }
    if removed > 0 {
        log::debug!("swept {} scratch entries from {}", removed, scratch.display());
    }
    removed
}

/// Creates a new evidence folder for `torrent_file` under `evi_root/tor`.
///
/// Refuses a torrent whose info hash already appears anywhere below
/// `evi_root`, so one torrent never gets two evidence folders.
pub fn register_torrent(
    evi_root: &Path,
    torrent_file: &Path,
    clock: &dyn Clock,
    locale: Locale,
) -> Result<PathBuf> {
    if !torrent_file.is_file() {
        return Err(EvidenceError::MissingFile(torrent_file.to_path_buf()));
    }
    let torrent = TorrentDescriptor::from_file(torrent_file).map_err(|err| EvidenceError::InvalidTorrent {
        path: torrent_file.to_path_buf(),
        reason: format!("{:#}", err),
    })?;

    for existing in find_torrents(evi_root)? {
        match TorrentDescriptor::from_file(&existing) {
            Ok(other) if other.info_hash() == torrent.info_hash() => {
                return Err(EvidenceError::DuplicateTorrent {
                    new: torrent_file.to_path_buf(),
                    existing,
                });
            }
            Ok(_) => {}
            Err(err) => log::debug!("skipping unreadable {}: {:#}", existing.display(), err),
        }
    }

    let stamp = clock.folder_stamp();
    let folder = unique_path(&evi_root.join("tor").join(&stamp));
    fs::create_dir_all(&folder)?;
    fs::copy(torrent_file, folder.join(crate::SOURCE_TORRENT))?;

    let folder_name = folder
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or(stamp);
    let record = format!(
        "{}{}\n{}{}\n{}{}\n{}{}\n{}{}\n",
        locale.text(Text::RegisterTarget),
        torrent.name(),
        locale.text(Text::RegisterMethod),
        locale.text(Text::RegisterManual),
        locale.text(Text::RegisterSource),
        torrent_file.display(),
        locale.text(Text::RegisterCreated),
        clock.timestamp(),
        locale.text(Text::LabelFileHash),
        torrent.info_hash_hex(),
    );
    fs::write(folder.join(format!("evi_{}.log", folder_name)), record)?;
    fs::write(folder.join(PROCESS_MARKER), b"")?;

    log::info!(
        "{}: {} ({})",
        locale.text(Text::TorrentRegistered),
        folder.display(),
        torrent.name()
    );
    Ok(folder)
}

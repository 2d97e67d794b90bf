use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_bencode::value::Value;
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};
use std::path::{Component, Path, PathBuf};

/// a file entry of a multi file torrent
#[derive(Debug, Deserialize)]
struct RawFile {
    /// The length of the file in bytes (integer)
    length: i64,
    /// a list of UTF-8 encoded strings corresponding to subdirectory names, the last of which is the actual file name
    path: Vec<String>,
}

/// if length is None, it's a multi file torrent, else it's a single file torrent
#[derive(Debug, Deserialize)]
struct RawInfo {
    name: String,
    pieces: ByteBuf,
    #[serde(rename = "piece length")]
    piece_length: i64,
    #[serde(default)]
    length: Option<i64>,
    #[serde(default)]
    files: Option<Vec<RawFile>>,
}

#[derive(Debug, Deserialize)]
struct MetaInfo {
    info: RawInfo,
    /// The announce URL of the tracker (string)
    #[serde(default)]
    announce: Option<String>,
    /// (optional) list of tiers of announce URLs, see BEP 12
    #[serde(default)]
    #[serde(rename = "announce-list")]
    announce_list: Option<Vec<Vec<String>>>,
    /// (optional) name and version of the program used to create the .torrent (string)
    #[serde(default)]
    #[serde(rename = "created by")]
    created_by: Option<String>,
    /// (optional) the creation time of the torrent, in standard UNIX epoch format
    #[serde(default)]
    #[serde(rename = "creation date")]
    creation_date: Option<i64>,
}

/// One file of the torrent's content, laid out in declared order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// path relative to the save directory (includes the torrent name for multi file torrents)
    pub path: PathBuf,
    pub length: u64,
    /// byte offset of this file inside the concatenated content
    pub offset: u64,
}

/// Parsed `.torrent` metadata. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct TorrentDescriptor {
    name: String,
    info_hash: [u8; 20],
    piece_length: u64,
    pieces: Vec<[u8; 20]>,
    total_length: u64,
    files: Vec<FileEntry>,
    multi_file: bool,
    trackers: Vec<String>,
    created_by: Option<String>,
    creation_date: Option<i64>,
}

impl TorrentDescriptor {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let meta: MetaInfo =
            serde_bencode::from_bytes(bytes).context("failed to deserialize torrent")?;
        let info_hash = raw_info_hash(bytes)?;
        let info = meta.info;

        if info.piece_length <= 0 {
            return Err(anyhow!("invalid piece length {}", info.piece_length));
        }
        if info.pieces.len() % 20 != 0 {
            return Err(anyhow!("pieces field is not a multiple of 20 bytes"));
        }
        let pieces: Vec<[u8; 20]> = info
            .pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        check_component(&info.name)?;
        let (files, multi_file) = match (info.length, info.files) {
            (Some(length), _) => {
                let length = u64::try_from(length).map_err(|_| anyhow!("negative length"))?;
                let entry = FileEntry {
                    path: PathBuf::from(&info.name),
                    length,
                    offset: 0,
                };
                (vec![entry], false)
            }
            (None, Some(raw)) => {
                let mut offset = 0u64;
                let mut files = Vec::with_capacity(raw.len());
                for file in raw {
                    let length =
                        u64::try_from(file.length).map_err(|_| anyhow!("negative file length"))?;
                    let mut path = PathBuf::from(&info.name);
                    for part in &file.path {
                        check_component(part)?;
                        path.push(part);
                    }
                    files.push(FileEntry {
                        path,
                        length,
                        offset,
                    });
                    offset += length;
                }
                (files, true)
            }
            (None, None) => return Err(anyhow!("torrent declares neither length nor files")),
        };

        let total_length: u64 = files.iter().map(|f| f.length).sum();
        let piece_length = info.piece_length as u64;
        let expected = total_length.div_ceil(piece_length) as usize;
        if expected != pieces.len() {
            return Err(anyhow!(
                "torrent declares {} pieces but content needs {}",
                pieces.len(),
                expected
            ));
        }

        let mut trackers = Vec::new();
        if let Some(announce) = meta.announce {
            trackers.push(announce);
        }
        for tier in meta.announce_list.unwrap_or_default() {
            for url in tier {
                if !trackers.contains(&url) {
                    trackers.push(url);
                }
            }
        }

        Ok(TorrentDescriptor {
            name: info.name,
            info_hash,
            piece_length,
            pieces,
            total_length,
            files,
            multi_file,
            trackers,
            created_by: meta.created_by,
            creation_date: meta.creation_date,
        })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let buf = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_bytes(&buf)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn info_hash(&self) -> [u8; 20] {
        self.info_hash
    }

    /// lowercase hex, the form used in every evidence file name
    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    pub fn piece_length(&self) -> u64 {
        self.piece_length
    }

    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }

    /// size of the piece at `index`; only the last piece may be shorter than the piece length
    pub fn piece_size(&self, index: usize) -> u64 {
        if index + 1 < self.pieces.len() {
            self.piece_length
        } else {
            self.total_length - self.piece_length * (self.pieces.len() as u64 - 1)
        }
    }

    pub fn hash_for_piece(&self, index: usize) -> Option<&[u8; 20]> {
        self.pieces.get(index)
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    pub fn is_multi_file(&self) -> bool {
        self.multi_file
    }

    pub fn trackers(&self) -> &[String] {
        &self.trackers
    }

    pub fn created_by(&self) -> Option<&str> {
        self.created_by.as_deref()
    }

    pub fn creation_date(&self) -> Option<i64> {
        self.creation_date
    }

    /// the file (single file torrent) or folder (multi file torrent) the content lives in
    pub fn content_path(&self, save_path: &Path) -> PathBuf {
        save_path.join(&self.name)
    }
}

/// SHA-1 of the info dictionary exactly as encoded, unknown keys included
fn raw_info_hash(bytes: &[u8]) -> Result<[u8; 20]> {
    let value: Value = serde_bencode::from_bytes(bytes).context("failed to decode torrent")?;
    let info = match value {
        Value::Dict(mut dict) => dict
            .remove(&b"info"[..])
            .ok_or_else(|| anyhow!("torrent has no info dictionary"))?,
        _ => return Err(anyhow!("torrent is not a dictionary")),
    };
    let encoded = serde_bencode::to_bytes(&info)?;
    Ok(Sha1::digest(&encoded).into())
}

fn check_component(part: &str) -> Result<()> {
    let mut components = Path::new(part).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(anyhow!("unsafe path component {:?} in torrent", part)),
    }
}

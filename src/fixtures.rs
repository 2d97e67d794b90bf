//! builders for torrents and evidence folders used across the test modules

use serde::Serialize;
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};
use std::path::Path;

#[derive(Serialize)]
struct FixtureFile {
    length: i64,
    path: Vec<String>,
}

#[derive(Serialize)]
struct FixtureInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    files: Option<Vec<FixtureFile>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    length: Option<i64>,
    name: String,
    #[serde(rename = "piece length")]
    piece_length: i64,
    pieces: ByteBuf,
}

#[derive(Serialize)]
struct FixtureTorrent {
    #[serde(skip_serializing_if = "Option::is_none")]
    announce: Option<String>,
    #[serde(rename = "announce-list")]
    #[serde(skip_serializing_if = "Option::is_none")]
    announce_list: Option<Vec<Vec<String>>>,
    info: FixtureInfo,
}

fn piece_hashes(content: &[u8], piece_length: usize) -> ByteBuf {
    let mut pieces = Vec::new();
    for chunk in content.chunks(piece_length) {
        pieces.extend_from_slice(&Sha1::digest(chunk));
    }
    ByteBuf::from(pieces)
}

fn encode(info: FixtureInfo, trackers: &[&str]) -> Vec<u8> {
    let announce = trackers.first().map(|t| t.to_string());
    let announce_list = if trackers.len() > 1 {
        Some(trackers.iter().map(|t| vec![t.to_string()]).collect())
    } else {
        None
    };
    serde_bencode::to_bytes(&FixtureTorrent {
        announce,
        announce_list,
        info,
    })
    .unwrap()
}

pub fn single_file_torrent(
    name: &str,
    content: &[u8],
    piece_length: usize,
    trackers: &[&str],
) -> Vec<u8> {
    let info = FixtureInfo {
        files: None,
        length: Some(content.len() as i64),
        name: name.to_string(),
        piece_length: piece_length as i64,
        pieces: piece_hashes(content, piece_length),
    };
    encode(info, trackers)
}

/// `files` are (relative path with '/' separators, content) in declared order
pub fn multi_file_torrent(
    name: &str,
    files: &[(&str, Vec<u8>)],
    piece_length: usize,
    trackers: &[&str],
) -> Vec<u8> {
    let content: Vec<u8> = files.iter().flat_map(|(_, data)| data.clone()).collect();
    let info = FixtureInfo {
        files: Some(
            files
                .iter()
                .map(|(path, data)| FixtureFile {
                    length: data.len() as i64,
                    path: path.split('/').map(str::to_string).collect(),
                })
                .collect(),
        ),
        length: None,
        name: name.to_string(),
        piece_length: piece_length as i64,
        pieces: piece_hashes(&content, piece_length),
    };
    encode(info, trackers)
}

/// deterministic pseudo random content so no two pieces are equal
pub fn content(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| ((i * 31 + i / 251) % 256) as u8)
        .collect()
}

/// writes `source.torrent` and the single file content into `folder`
pub fn evidence_folder(folder: &Path, name: &str, content: &[u8], piece_length: usize) {
    let torrent = single_file_torrent(name, content, piece_length, &[]);
    std::fs::write(folder.join(crate::SOURCE_TORRENT), torrent).unwrap();
    std::fs::write(folder.join(name), content).unwrap();
}

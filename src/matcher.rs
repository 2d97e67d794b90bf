/*
src/matcher.rs

binary matching of a piece against the already downloaded content of an evidence folder.

hash agreement only says the peer sent what the torrent describes. the binary match additionally proves
those bytes are the bytes of the content we hold, so a forged torrent or a swapped content file shows up.
the content is addressed as one stream: a single file as is, a folder as its files concatenated in sorted
order, files of a directory before its subdirectories.
*/

use crate::error::{EvidenceError, Result};
use crate::torrent::TorrentDescriptor;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
struct Segment {
    path: PathBuf,
    offset: u64,
    length: u64,
}

#[derive(Debug, Clone)]
pub struct BinaryMatcher {
    piece_length: u64,
    segments: Vec<Segment>,
    total_length: u64,
}

impl BinaryMatcher {
    /// Opens `source.torrent` and the content it names next to it. Either
    /// one missing is a hard error: nothing downstream can be trusted.
    pub fn open(source_torrent: &Path) -> Result<BinaryMatcher> {
        if !source_torrent.exists() {
            return Err(EvidenceError::MissingFile(source_torrent.to_path_buf()));
        }
        let torrent = TorrentDescriptor::from_file(source_torrent).map_err(|err| {
            EvidenceError::InvalidTorrent {
                path: source_torrent.to_path_buf(),
                reason: format!("{:#}", err),
            }
        })?;
        let folder = source_torrent.parent().unwrap_or_else(|| Path::new("."));
        Self::for_content(&torrent.content_path(folder), torrent.piece_length())
    }

    pub fn for_content(content: &Path, piece_length: u64) -> Result<BinaryMatcher> {
        if !content.exists() {
            return Err(EvidenceError::MissingFile(content.to_path_buf()));
        }
        let mut paths = Vec::new();
        if content.is_dir() {
            collect_sorted(content, &mut paths)?;
        } else {
            paths.push(content.to_path_buf());
        }

        let mut segments = Vec::with_capacity(paths.len());
        let mut offset = 0u64;
        for path in paths {
            let length = std::fs::metadata(&path)?.len();
            segments.push(Segment {
                path,
                offset,
                length,
            });
            offset += length;
        }

        Ok(BinaryMatcher {
            piece_length: piece_length.max(1),
            segments,
            total_length: offset,
        })
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// pieces the content spans, a trailing short piece included
    pub fn total_pieces(&self) -> usize {
        self.total_length.div_ceil(self.piece_length) as usize
    }

    /// Scan mode: reads a `.bin` file and looks for it at every piece aligned
    /// offset. Returns the matching piece index.
    pub fn binary_match(&self, bin_file: &Path) -> Result<Option<usize>> {
        let data = std::fs::read(bin_file)?;
        Ok(self.binary_match_bytes(&data)?)
    }

    pub fn binary_match_bytes(&self, data: &[u8]) -> io::Result<Option<usize>> {
        if data.is_empty() {
            return Ok(None);
        }
        let len = data.len() as u64;
        for index in 0..self.total_pieces() {
            let offset = index as u64 * self.piece_length;
            if self.chunk_len(offset) != len {
                continue;
            }
            if self.read_range(offset, len)? == data {
                return Ok(Some(index));
            }
        }
        Ok(None)
    }

    /// Direct mode: compares `data` with the content of piece `index` only.
    pub fn instant_binary_match(&self, data: &[u8], index: usize) -> io::Result<Option<usize>> {
        if index >= self.total_pieces() {
            log::warn!(
                "piece index {} is out of range ({} pieces)",
                index,
                self.total_pieces()
            );
            return Ok(None);
        }
        let offset = index as u64 * self.piece_length;
        let len = self.chunk_len(offset);
        if data.len() as u64 != len {
            return Ok(None);
        }
        if self.read_range(offset, len)? == data {
            Ok(Some(index))
        } else {
            Ok(None)
        }
    }

    fn chunk_len(&self, offset: u64) -> u64 {
        self.piece_length.min(self.total_length.saturating_sub(offset))
    }

    /// reads `len` bytes at `offset` of the concatenated content
    pub fn read_range(&self, offset: u64, len: u64) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len as usize);
        let end = offset + len;
        for segment in &self.segments {
            let seg_end = segment.offset + segment.length;
            if seg_end <= offset || segment.offset >= end {
                continue;
            }
            let start = offset.max(segment.offset);
            let stop = end.min(seg_end);
            let mut file = File::open(&segment.path)?;
            file.seek(SeekFrom::Start(start - segment.offset))?;
            let mut buf = vec![0u8; (stop - start) as usize];
            file.read_exact(&mut buf)?;
            out.extend_from_slice(&buf);
        }
        if out.len() as u64 != len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "range extends past the content",
            ));
        }
        Ok(out)
    }
}

/// files of `dir` in name order, then each subdirectory in name order
fn collect_sorted(dir: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
    let mut files = Vec::new();
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            dirs.push(path);
        } else {
            files.push(path);
        }
    }
    files.sort();
    dirs.sort();
    out.extend(files);
    for sub in dirs {
        collect_sorted(&sub, out)?;
    }
    Ok(())
}

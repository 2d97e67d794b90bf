/*
src/storage.rs

maps pieces onto the files of a torrent's content under a save path.

a piece is a slice of the concatenated content and may span several files; a block is the 16 KiB unit peers
request. pieces are only written here after their SHA-1 was verified, so everything on disk is either missing
or correct. on startup the existing files are hash-checked to find which pieces we already have.
*/

use crate::bitfield::BitField;
use crate::torrent::{FileEntry, TorrentDescriptor};
use sha1::{Digest, Sha1};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
    files: Vec<FileEntry>,
    piece_length: u64,
    total_length: u64,
}

/// part of a piece that lives in one file
#[derive(Debug, PartialEq, Eq)]
struct Span<'a> {
    file: &'a FileEntry,
    file_offset: u64,
    buf_offset: usize,
    len: usize,
}

impl Storage {
    pub fn new(torrent: &TorrentDescriptor, save_path: &Path) -> Storage {
        Storage {
            root: save_path.to_path_buf(),
            files: torrent.files().to_vec(),
            piece_length: torrent.piece_length(),
            total_length: torrent.total_length(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    fn spans(&self, offset: u64, len: u64) -> Vec<Span<'_>> {
        let end = offset + len;
        self.files
            .iter()
            .filter(|file| file.offset < end && file.offset + file.length > offset)
            .map(|file| {
                let start = offset.max(file.offset);
                let stop = end.min(file.offset + file.length);
                Span {
                    file,
                    file_offset: start - file.offset,
                    buf_offset: (start - offset) as usize,
                    len: (stop - start) as usize,
                }
            })
            .collect()
    }

    fn piece_range(&self, index: usize) -> (u64, u64) {
        let offset = index as u64 * self.piece_length;
        let len = self
            .piece_length
            .min(self.total_length.saturating_sub(offset));
        (offset, len)
    }

    /// Writes a verified piece, creating files and folders as needed.
    pub fn write_piece(&self, index: usize, data: &[u8]) -> io::Result<()> {
        let (offset, len) = self.piece_range(index);
        if data.len() as u64 != len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("piece {} is {} bytes, expected {}", index, data.len(), len),
            ));
        }
        for span in self.spans(offset, len) {
            let path = self.root.join(&span.file.path);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?;
            file.seek(SeekFrom::Start(span.file_offset))?;
            file.write_all(&data[span.buf_offset..span.buf_offset + span.len])?;
        }
        Ok(())
    }

    /// Reads `len` bytes at `begin` inside piece `index`.
    pub fn read_block(&self, index: usize, begin: u64, len: u64) -> io::Result<Vec<u8>> {
        let (offset, piece_len) = self.piece_range(index);
        if begin + len > piece_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("block {}+{} is outside piece {}", begin, len, index),
            ));
        }
        let mut data = vec![0u8; len as usize];
        for span in self.spans(offset + begin, len) {
            let mut file = File::open(self.root.join(&span.file.path))?;
            file.seek(SeekFrom::Start(span.file_offset))?;
            file.read_exact(&mut data[span.buf_offset..span.buf_offset + span.len])?;
        }
        Ok(data)
    }

    pub fn read_piece(&self, index: usize) -> io::Result<Vec<u8>> {
        let (_, len) = self.piece_range(index);
        self.read_block(index, 0, len)
    }

    /// Hash-checks whatever content already exists. Missing or short files
    /// simply leave their pieces unset.
    pub fn check(&self, torrent: &TorrentDescriptor) -> BitField {
        let mut have = BitField::new(torrent.num_pieces());
        for index in 0..torrent.num_pieces() {
            let Ok(data) = self.read_piece(index) else {
                continue;
            };
            if torrent
                .hash_for_piece(index)
                .is_some_and(|hash| Sha1::digest(&data).as_slice() == hash)
            {
                have.set(index);
            }
        }
        log::debug!(
            "hash check of {}: {}/{} pieces present",
            self.root.display(),
            have.count(),
            have.len()
        );
        have
    }
}

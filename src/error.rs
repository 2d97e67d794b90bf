use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Structural failures that callers need to tell apart. Piece integrity
/// problems are not errors, see [`crate::collector::PieceVerdict`].
#[derive(Error, Debug)]
pub enum EvidenceError {
    #[error("{0} was not found")]
    MissingFile(PathBuf),
    #[error("invalid torrent {path}: {reason}")]
    InvalidTorrent { path: PathBuf, reason: String },
    #[error("torrent {new} has the same info hash as {existing}")]
    DuplicateTorrent { new: PathBuf, existing: PathBuf },
    #[error("permission denied writing {0}")]
    PermissionDenied(PathBuf),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, EvidenceError>;

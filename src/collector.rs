/*
src/collector.rs

piece collection from one sampled peer.

the session filter is narrowed to that peer alone, the torrent is attached in memory mode (so every byte we
judge came from the peer, never from the content already on disk) with only one random piece wanted, and
the piece is read back through the alert queue. the bytes are then judged twice: against the torrent's
SHA-1 and against the content at the same offset. whatever the verdict, it is written to the roster, the
peer's log and optionally a .bin file; a failed transfer is evidence too.
*/

use crate::clock::Clock;
use crate::config::Settings;
use crate::engine::{AddTorrentParams, Alert, Session, StorageMode, TorrentHandle};
use crate::error::EvidenceError;
use crate::evidence::save_piece;
use crate::ip_filter::{build_filter, FilterRules};
use crate::locale::Text;
use crate::matcher::BinaryMatcher;
use crate::peer_log::LogContext;
use crate::poll::{BoundedPoll, Budget, Pacer, PollOutcome};
use crate::roster::{Roster, Sighting};
use crate::torrent::TorrentDescriptor;
use crate::whois::ProviderLookup;
use anyhow::{Context, Result};
use rand::Rng;
use sha1::{Digest, Sha1};
use std::io;
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// How a collected piece compares to the torrent and to the content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceVerdict {
    /// nothing arrived, the transfer failed
    Blank,
    /// the peer sent bytes the torrent does not describe
    HashMismatch,
    /// the bytes match the torrent but not our content: the torrent or the content is forged
    ContentMismatch,
    Valid,
}

impl PieceVerdict {
    /// Checks in a fixed order: empty, then hash, then content.
    pub fn classify(
        buffer: &[u8],
        index: usize,
        torrent: &TorrentDescriptor,
        matcher: &BinaryMatcher,
    ) -> io::Result<PieceVerdict> {
        if buffer.is_empty() {
            return Ok(PieceVerdict::Blank);
        }
        let hash_ok = torrent
            .hash_for_piece(index)
            .is_some_and(|hash| Sha1::digest(buffer).as_slice() == hash);
        if !hash_ok {
            return Ok(PieceVerdict::HashMismatch);
        }
        match matcher.instant_binary_match(buffer, index)? {
            Some(_) => Ok(PieceVerdict::Valid),
            None => Ok(PieceVerdict::ContentMismatch),
        }
    }

    /// file name prefix of a saved piece
    pub fn prefix(self) -> &'static str {
        match self {
            PieceVerdict::Blank => "BLANK_",
            PieceVerdict::HashMismatch => "FALSE_",
            PieceVerdict::ContentMismatch => "INVALID_",
            PieceVerdict::Valid => "",
        }
    }

    pub fn is_valid(self) -> bool {
        self == PieceVerdict::Valid
    }

    fn message(self) -> Text {
        match self {
            PieceVerdict::Blank => Text::PieceBlank,
            PieceVerdict::HashMismatch => Text::PieceHashMismatch,
            PieceVerdict::ContentMismatch => Text::PieceContentMismatch,
            PieceVerdict::Valid => Text::PieceVerified,
        }
    }

    fn log_error(self) -> Option<Text> {
        match self {
            PieceVerdict::Blank => Some(Text::LogBlank),
            PieceVerdict::HashMismatch => Some(Text::LogHashMismatch),
            PieceVerdict::ContentMismatch => Some(Text::LogContentMismatch),
            PieceVerdict::Valid => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectOutcome {
    /// no piece arrived within the retries; nothing was recorded
    NoPiece,
    /// cancelled or out of time while waiting
    Interrupted,
    /// the roster could not be written, nothing else was recorded
    RosterRefused,
    /// an error stopped this peer's collection; the message says why
    Failed(String),
    Recorded {
        index: usize,
        verdict: PieceVerdict,
        saved: Option<PathBuf>,
    },
}

/// The evidence folder a collection works on.
#[derive(Debug, Clone, Copy)]
pub struct CollectTarget<'a> {
    pub torrent: &'a Arc<TorrentDescriptor>,
    pub base: &'a FilterRules,
    pub folder: &'a Path,
    pub matcher: &'a BinaryMatcher,
}

/// Alerts left from an earlier attach must not answer this peer's read.
fn drop_stale_alerts<S: Session>(session: &S) {
    let stale = session.pop_alerts();
    if !stale.is_empty() {
        log::debug!("dropped {} stale alerts", stale.len());
    }
}

pub struct PieceCollector<'a> {
    settings: &'a Settings,
    pacer: &'a dyn Pacer,
    clock: &'a dyn Clock,
    lookup: &'a dyn ProviderLookup,
}

impl<'a> PieceCollector<'a> {
    pub fn new(
        settings: &'a Settings,
        pacer: &'a dyn Pacer,
        clock: &'a dyn Clock,
        lookup: &'a dyn ProviderLookup,
    ) -> PieceCollector<'a> {
        PieceCollector {
            settings,
            pacer,
            clock,
            lookup,
        }
    }

    /// Collects one uniformly random piece from `peer`.
    pub fn collect<S: Session>(
        &self,
        session: &S,
        target: &CollectTarget,
        peer: SocketAddr,
        budget: &Budget,
    ) -> Result<CollectOutcome> {
        let pieces = target.torrent.num_pieces();
        if pieces == 0 {
            return Ok(CollectOutcome::NoPiece);
        }
        let index = rand::thread_rng().gen_range(0..pieces);
        self.collect_piece(session, target, peer, index, budget)
    }

    pub fn collect_piece<S: Session>(
        &self,
        session: &S,
        target: &CollectTarget,
        peer: SocketAddr,
        index: usize,
        budget: &Budget,
    ) -> Result<CollectOutcome> {
        let locale = self.settings.locale;
        let torrent = target.torrent;
        let started_at = self.clock.timestamp();
        log::info!("collecting piece {} from {}", index, peer);

        session.set_ip_filter(build_filter(target.base, Some(peer.ip())));
        let handle = session
            .add_torrent(AddTorrentParams::new(
                torrent.clone(),
                target.folder,
                StorageMode::Memory,
            ))
            .with_context(|| format!("attaching {} for {}", torrent.name(), peer))?;

        let mut priorities = vec![0u8; torrent.num_pieces()];
        priorities[index] = 1;
        handle.prioritize_pieces(&priorities);
        handle.set_upload_limit(0);
        drop_stale_alerts(session);
        handle.read_piece(index);

        let poll = BoundedPoll::new(
            self.settings.piece_read_interval(),
            self.settings.piece_read_retries,
        );
        let outcome = poll.run(self.pacer, budget, |_| {
            for alert in session.pop_alerts() {
                match alert {
                    Alert::ReadPiece { index: read, buffer } if read == index => {
                        return ControlFlow::Break(buffer);
                    }
                    Alert::HashFailed { index: failed, peer: from } => {
                        log::debug!("hash check of piece {} from {} failed", failed, from)
                    }
                    _ => {}
                }
            }
            ControlFlow::Continue(())
        });
        session.remove_torrent(&handle);
        drop_stale_alerts(session);
        session.set_ip_filter(build_filter(target.base, None));

        let buffer = match outcome {
            PollOutcome::Done(buffer) => buffer,
            PollOutcome::Exhausted => {
                log::warn!("{} ({}, piece {})", locale.text(Text::NoReadPieceAlert), peer, index);
                return Ok(CollectOutcome::NoPiece);
            }
            PollOutcome::Cancelled | PollOutcome::DeadlineExceeded => {
                return Ok(CollectOutcome::Interrupted);
            }
        };

        let verdict = PieceVerdict::classify(&buffer, index, torrent, target.matcher)
            .with_context(|| format!("matching piece {} against the content", index))?;
        if verdict.is_valid() {
            log::info!("{}: piece {} from {}", locale.text(verdict.message()), index, peer);
        } else {
            log::warn!("{} (piece {} from {})", locale.text(verdict.message()), index, peer);
        }
        let completed_at = self.clock.timestamp();

        let info_hash = torrent.info_hash_hex();
        let ctx = LogContext {
            file_name: torrent.name(),
            info_hash_hex: &info_hash,
            started_at: &started_at,
            version: &self.settings.version,
            locale,
        };
        let log = ctx.piece_log(target.folder, peer);

        // one lookup per peer: an existing log means we asked before
        let provider = if log.exists() {
            None
        } else {
            let provider = self.lookup.provider(peer.ip());
            self.pacer.sleep(self.settings.whois_pause());
            Some(provider)
        };

        let roster = Roster::for_torrent(target.folder, &info_hash, locale);
        let sighting = Sighting {
            peer,
            provider: provider.as_deref(),
            valid_piece: verdict.is_valid(),
            seen_at: &completed_at,
        };
        match roster.record(&sighting) {
            Ok(()) => {}
            Err(EvidenceError::PermissionDenied(path)) => {
                log::warn!("{} ({})", locale.text(Text::RosterPermission), path.display());
                return Ok(CollectOutcome::RosterRefused);
            }
            Err(err) => return Err(err).context("updating the peer roster"),
        }

        let saved = if self.settings.piece_download {
            let path = save_piece(target.folder, verdict, index, peer, &info_hash, &buffer)
                .context("saving the piece")?;
            log::debug!("piece saved as {}", path.display());
            Some(path)
        } else {
            None
        };

        let error = verdict.log_error().map(|key| locale.text(key)).unwrap_or("");
        let header_provider = provider
            .as_deref()
            .unwrap_or(locale.text(Text::NotFetched))
            .to_string();
        log.append(
            || ctx.piece_header(peer, &header_provider),
            &ctx.piece_line(index, error, &completed_at),
        )
        .with_context(|| format!("writing {}", log.path().display()))?;

        Ok(CollectOutcome::Recorded {
            index,
            verdict,
            saved,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::engine::fake::FakeSession;
    use crate::fixtures::{content, evidence_folder};
    use crate::locale::Locale;
    use crate::poll::ManualPacer;
    use crate::whois::StaticLookup;
    use std::cell::Cell;
    use std::net::IpAddr;

    const PIECE: usize = 64;

    struct CountingLookup(Cell<usize>);

    impl ProviderLookup for CountingLookup {
        fn provider(&self, _ip: IpAddr) -> String {
            self.0.set(self.0.get() + 1);
            "Example ISP".to_string()
        }
    }

    struct Folder {
        dir: tempfile::TempDir,
        torrent: Arc<TorrentDescriptor>,
        matcher: BinaryMatcher,
        base: FilterRules,
        data: Vec<u8>,
    }

    impl Folder {
        fn new() -> Folder {
            let dir = tempfile::tempdir().unwrap();
            let data = content(PIECE * 4 + 10);
            evidence_folder(dir.path(), "movie.mp4", &data, PIECE);
            let source = dir.path().join(crate::SOURCE_TORRENT);
            Folder {
                torrent: Arc::new(TorrentDescriptor::from_file(&source).unwrap()),
                matcher: BinaryMatcher::open(&source).unwrap(),
                base: FilterRules::deny_all(),
                dir,
                data,
            }
        }

        fn target(&self) -> CollectTarget<'_> {
            CollectTarget {
                torrent: &self.torrent,
                base: &self.base,
                folder: self.dir.path(),
                matcher: &self.matcher,
            }
        }

        fn piece(&self, index: usize) -> Vec<u8> {
            let start = index * PIECE;
            self.data[start..(start + PIECE).min(self.data.len())].to_vec()
        }
    }

    fn settings(piece_download: bool) -> Settings {
        Settings {
            piece_download,
            locale: Locale::En,
            ..Settings::default()
        }
    }

    fn clock() -> FixedClock {
        FixedClock::from_rfc3339("2024-05-01T13:45:10.123+09:00").unwrap()
    }

    fn peer() -> SocketAddr {
        "203.0.113.5:6881".parse().unwrap()
    }

    fn collect(folder: &Folder, session: &FakeSession, settings: &Settings, index: usize) -> CollectOutcome {
        let pacer = ManualPacer::new();
        let lookup = StaticLookup("Example ISP".to_string());
        let clock = clock();
        PieceCollector::new(settings, &pacer, &clock, &lookup)
            .collect_piece(session, &folder.target(), peer(), index, &Budget::unlimited())
            .unwrap()
    }

    #[test]
    fn valid_piece_is_recorded_everywhere() {
        let folder = Folder::new();
        let expected = folder.piece(4);
        let session = FakeSession::new().answering(move |_| expected.clone());
        let outcome = collect(&folder, &session, &settings(true), 4);

        let CollectOutcome::Recorded { verdict, saved, .. } = outcome else {
            panic!("nothing recorded");
        };
        assert_eq!(verdict, PieceVerdict::Valid);
        let saved = saved.unwrap();
        assert_eq!(
            saved.file_name().unwrap().to_string_lossy(),
            format!("00004_203.0.113.5_6881_{}.bin", folder.torrent.info_hash_hex())
        );
        assert_eq!(std::fs::read(saved).unwrap(), folder.piece(4));

        // only the peer was let through, and only piece 4 was wanted from memory storage
        let filters = session.filters();
        assert!(filters[0].is_allowed(peer().ip()));
        assert!(!filters[0].is_allowed("203.0.113.6".parse().unwrap()));
        assert!(!filters.last().unwrap().is_allowed(peer().ip()));
        assert_eq!(session.priorities(), vec![vec![0, 0, 0, 0, 1]]);
        assert_eq!(session.added()[0].storage, StorageMode::Memory);
        assert_eq!(session.upload_limits(), vec![0]);
        assert_eq!(session.removed(), 1);

        let roster = Roster::for_torrent(folder.dir.path(), &folder.torrent.info_hash_hex(), Locale::En);
        let rows = roster.rows().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].valid_count, "1");
        assert_eq!(rows[0].provider, "Example ISP");

        let log = std::fs::read_to_string(
            folder
                .dir
                .path()
                .join("203.0.113.5_6881")
                .join(format!("203.0.113.5_6881_{}.log", folder.torrent.info_hash_hex())),
        )
        .unwrap();
        assert!(log.ends_with("piece4 completed: 2024-05-01 13:45:10.123 ver.1.0\n"));
    }

    #[test]
    fn failures_are_recorded_with_prefixes() {
        let folder = Folder::new();
        let cases: Vec<(Vec<u8>, PieceVerdict, &str)> = vec![
            (Vec::new(), PieceVerdict::Blank, "BLANK_00001"),
            (vec![0xee; PIECE], PieceVerdict::HashMismatch, "FALSE_00001"),
        ];
        for (reply, expected, prefix) in cases {
            let session = FakeSession::new().answering(move |_| reply.clone());
            let CollectOutcome::Recorded { verdict, saved, .. } =
                collect(&folder, &session, &settings(true), 1)
            else {
                panic!("nothing recorded");
            };
            assert_eq!(verdict, expected);
            assert!(saved.unwrap().file_name().unwrap().to_string_lossy().starts_with(prefix));
        }
        let roster = Roster::for_torrent(folder.dir.path(), &folder.torrent.info_hash_hex(), Locale::En);
        assert_eq!(roster.rows().unwrap()[0].valid_count, "0");
    }

    #[test]
    fn forged_content_is_invalid_not_false() {
        let folder = Folder::new();
        let mut forged = folder.data.clone();
        forged[PIECE * 2] ^= 0xff;
        std::fs::write(folder.dir.path().join("movie.mp4"), &forged).unwrap();
        let matcher = BinaryMatcher::open(&folder.dir.path().join(crate::SOURCE_TORRENT)).unwrap();

        let genuine = folder.piece(2);
        assert_eq!(
            PieceVerdict::classify(&genuine, 2, &folder.torrent, &matcher).unwrap(),
            PieceVerdict::ContentMismatch
        );
        assert_eq!(
            PieceVerdict::classify(&[], 2, &folder.torrent, &matcher).unwrap(),
            PieceVerdict::Blank
        );
        assert_eq!(
            PieceVerdict::classify(&forged[PIECE * 2..PIECE * 3], 2, &folder.torrent, &matcher).unwrap(),
            PieceVerdict::HashMismatch
        );
        assert_eq!(PieceVerdict::ContentMismatch.prefix(), "INVALID_");
    }

    #[test]
    fn no_alert_records_nothing() {
        let folder = Folder::new();
        let session = FakeSession::new();
        let settings = settings(true);
        let pacer = ManualPacer::new();
        let lookup = StaticLookup("x".to_string());
        let clock = clock();
        let outcome = PieceCollector::new(&settings, &pacer, &clock, &lookup)
            .collect_piece(&session, &folder.target(), peer(), 0, &Budget::unlimited())
            .unwrap();

        assert_eq!(outcome, CollectOutcome::NoPiece);
        assert_eq!(pacer.sleeps.get(), settings.piece_read_retries - 1);
        assert_eq!(session.reads(), vec![0]);
        assert!(!folder.dir.path().join("203.0.113.5_6881").exists());
        assert!(Roster::for_torrent(folder.dir.path(), &folder.torrent.info_hash_hex(), Locale::En)
            .rows()
            .unwrap()
            .is_empty());
    }

    #[test]
    fn stale_read_from_an_earlier_attach_is_ignored() {
        let folder = Folder::new();
        let session = FakeSession::new().with_alerts(vec![Alert::ReadPiece {
            index: 0,
            buffer: Vec::new(),
        }]);
        assert_eq!(collect(&folder, &session, &settings(true), 0), CollectOutcome::NoPiece);
        assert!(!folder.dir.path().join("203.0.113.5_6881").exists());
    }

    #[test]
    fn late_answer_does_not_reach_the_next_collection() {
        let folder = Folder::new();
        let session = FakeSession::new().with_late_alerts(vec![Alert::ReadPiece {
            index: 1,
            buffer: Vec::new(),
        }]);
        let settings = settings(true);

        assert_eq!(collect(&folder, &session, &settings, 1), CollectOutcome::NoPiece);
        assert_eq!(session.pending_alerts(), 0);
        assert_eq!(collect(&folder, &session, &settings, 1), CollectOutcome::NoPiece);
        assert_eq!(session.removed(), 2);
        assert!(Roster::for_torrent(folder.dir.path(), &folder.torrent.info_hash_hex(), Locale::En)
            .rows()
            .unwrap()
            .is_empty());
    }

    #[test]
    fn provider_lookup_happens_once_per_peer() {
        let folder = Folder::new();
        let data = folder.data.clone();
        let session = FakeSession::new().answering(move |i| data[i * PIECE..(i + 1) * PIECE].to_vec());
        let settings = settings(false);
        let pacer = ManualPacer::new();
        let lookup = CountingLookup(Cell::new(0));
        let clock = clock();
        let collector = PieceCollector::new(&settings, &pacer, &clock, &lookup);
        for index in [0, 3] {
            let outcome = collector
                .collect_piece(&session, &folder.target(), peer(), index, &Budget::unlimited())
                .unwrap();
            assert!(matches!(outcome, CollectOutcome::Recorded { saved: None, .. }));
        }
        assert_eq!(lookup.0.get(), 1);
        let roster = Roster::for_torrent(folder.dir.path(), &folder.torrent.info_hash_hex(), Locale::En);
        assert_eq!(roster.rows().unwrap()[0].valid_count, "2");
    }

    #[test]
    fn cancelled_before_any_alert() {
        let folder = Folder::new();
        let session = FakeSession::new();
        let budget = Budget::unlimited();
        budget.cancel.cancel();
        let settings = settings(false);
        let pacer = ManualPacer::new();
        let lookup = StaticLookup("x".to_string());
        let clock = clock();
        let outcome = PieceCollector::new(&settings, &pacer, &clock, &lookup)
            .collect(&session, &folder.target(), peer(), &budget)
            .unwrap();
        assert_eq!(outcome, CollectOutcome::Interrupted);
        assert_eq!(session.removed(), 1);
    }
}
